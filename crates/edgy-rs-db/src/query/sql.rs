//! Relational query AST and SQL generation.
//!
//! [`Query`] is a small relational algebra (tables, aliased joins, predicate
//! trees, projections, ordering, limits) and [`SqlCompiler`] renders it into
//! parameterized SQL for a [`DatabaseBackendType`]. PostgreSQL uses `$1, $2,
//! ...` placeholders, SQLite uses `?`. Parameters are always collected in the
//! order their placeholders appear in the text.
//!
//! [`Row`] and [`FromValue`] carry result rows back from the backends.

use std::fmt::Write as _;
use std::sync::Arc;

use edgy_rs_core::{EdgyError, EdgyResult};

use super::expressions::Expression;
use crate::value::Value;

/// The type of database backend, used to pick backend-specific syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackendType {
    /// PostgreSQL (`$n` placeholders, `ILIKE`, `DISTINCT ON`).
    PostgreSQL,
    /// SQLite (`?` placeholders).
    SQLite,
}

impl DatabaseBackendType {
    /// Returns `true` if `SELECT DISTINCT ON (...)` is available.
    pub const fn supports_distinct_on(self) -> bool {
        matches!(self, Self::PostgreSQL)
    }
}

/// Quotes an identifier.
pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// A table in a FROM or JOIN clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    /// Optional schema qualifier.
    pub schema: Option<String>,
    /// The table name.
    pub name: String,
    /// Optional alias.
    pub alias: Option<String>,
}

impl TableRef {
    /// An unqualified, unaliased table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
            alias: None,
        }
    }

    /// Sets the schema qualifier.
    #[must_use]
    pub fn with_schema(mut self, schema: Option<&str>) -> Self {
        self.schema = schema.map(str::to_string);
        self
    }

    /// Sets the alias.
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// The name other clauses use to reference this table.
    pub fn reference(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    fn qualified(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote(schema), quote(&self.name)),
            None => quote(&self.name),
        }
    }

    fn render(&self) -> String {
        match &self.alias {
            Some(alias) if alias != &self.name || self.schema.is_some() => {
                format!("{} AS {}", self.qualified(), quote(alias))
            }
            _ => self.qualified(),
        }
    }
}

/// A column, optionally qualified by a table alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    /// The table alias, if qualified.
    pub table: Option<String>,
    /// The column name.
    pub column: String,
}

impl ColumnRef {
    /// A qualified column.
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            column: column.into(),
        }
    }

    /// An unqualified column.
    pub fn bare(column: impl Into<String>) -> Self {
        Self {
            table: None,
            column: column.into(),
        }
    }

    fn render(&self) -> String {
        match &self.table {
            Some(table) => format!("{}.{}", quote(table), quote(&self.column)),
            None => quote(&self.column),
        }
    }
}

/// One entry of the SELECT list.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectColumn {
    /// A column with an optional output label.
    Column(ColumnRef, Option<String>),
    /// An expression with an output label.
    Expression(Expression, String),
}

/// The source of a SELECT.
#[derive(Debug, Clone, PartialEq)]
pub enum FromSource {
    /// A table.
    Table(TableRef),
    /// A derived table.
    Subquery(Box<Query>, String),
}

/// A field-level comparison as rendered in SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// `col = value`.
    Exact(Value),
    /// `LOWER(col) = LOWER(value)`.
    IExact(Value),
    /// Case-sensitive substring match (`LIKE` on PostgreSQL, `GLOB` on SQLite).
    Contains(String),
    /// Case-insensitive substring match.
    IContains(String),
    /// `col IN (...)`.
    In(Vec<Value>),
    /// `col > value`.
    Gt(Value),
    /// `col >= value`.
    Gte(Value),
    /// `col < value`.
    Lt(Value),
    /// `col <= value`.
    Lte(Value),
    /// Case-sensitive prefix match.
    StartsWith(String),
    /// Case-insensitive prefix match.
    IStartsWith(String),
    /// Case-sensitive suffix match.
    EndsWith(String),
    /// Case-insensitive suffix match.
    IEndsWith(String),
    /// `col BETWEEN low AND high`.
    Range(Value, Value),
    /// `col IS NULL` / `col IS NOT NULL`.
    IsNull(bool),
}

/// A WHERE / ON clause node.
#[derive(Debug, Clone, PartialEq)]
pub enum WhereNode {
    /// A single comparison.
    Condition {
        /// The left-hand column.
        column: ColumnRef,
        /// The comparison.
        lookup: Lookup,
    },
    /// Column-to-column equality (join conditions).
    ColumnEq(ColumnRef, ColumnRef),
    /// `col [NOT] IN (SELECT ...)`.
    InSubquery {
        /// The left-hand column.
        column: ColumnRef,
        /// The single-column subquery.
        query: Box<Query>,
        /// Whether this is `NOT IN`.
        negated: bool,
    },
    /// Logical AND. Empty means true.
    And(Vec<WhereNode>),
    /// Logical OR. Empty means false.
    Or(Vec<WhereNode>),
    /// Logical NOT.
    Not(Box<WhereNode>),
}

impl WhereNode {
    /// AND of two optional clauses.
    pub fn and_opt(left: Option<Self>, right: Self) -> Self {
        match left {
            None => right,
            Some(Self::And(mut children)) => {
                children.push(right);
                Self::And(children)
            }
            Some(left) => Self::And(vec![left, right]),
        }
    }
}

/// SQL JOIN types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    /// INNER JOIN.
    Inner,
    /// LEFT JOIN.
    Left,
}

impl JoinType {
    /// Returns the SQL keyword for this join type.
    pub const fn sql_keyword(self) -> &'static str {
        match self {
            Self::Inner => "INNER JOIN",
            Self::Left => "LEFT JOIN",
        }
    }
}

/// A JOIN clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    /// The joined table, usually aliased.
    pub table: TableRef,
    /// The join type.
    pub join_type: JoinType,
    /// Column pairs ANDed together in the ON clause.
    pub on: Vec<(ColumnRef, ColumnRef)>,
}

/// What an ORDER BY entry sorts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderTarget {
    /// A column.
    Column(ColumnRef),
    /// An output label from the SELECT list.
    Alias(String),
}

/// An ORDER BY entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    /// The sort key.
    pub target: OrderTarget,
    /// Whether to sort in descending order.
    pub descending: bool,
}

impl OrderBy {
    /// Ascending on a column.
    pub const fn asc(column: ColumnRef) -> Self {
        Self {
            target: OrderTarget::Column(column),
            descending: false,
        }
    }

    /// Descending on a column.
    pub const fn desc(column: ColumnRef) -> Self {
        Self {
            target: OrderTarget::Column(column),
            descending: true,
        }
    }
}

/// DISTINCT handling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Distinct {
    /// No DISTINCT.
    #[default]
    None,
    /// `SELECT DISTINCT`.
    All,
    /// `SELECT DISTINCT ON (...)` (PostgreSQL only).
    On(Vec<ColumnRef>),
}

/// A SELECT statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// The FROM source.
    pub from: FromSource,
    /// The SELECT list. Empty means `*`.
    pub select: Vec<SelectColumn>,
    /// DISTINCT handling.
    pub distinct: Distinct,
    /// JOIN clauses, in order.
    pub joins: Vec<Join>,
    /// WHERE clause.
    pub where_clause: Option<WhereNode>,
    /// GROUP BY columns.
    pub group_by: Vec<ColumnRef>,
    /// ORDER BY entries.
    pub order_by: Vec<OrderBy>,
    /// LIMIT.
    pub limit: Option<usize>,
    /// OFFSET.
    pub offset: Option<usize>,
}

impl Query {
    /// A `SELECT *` over `table`.
    pub fn new(table: TableRef) -> Self {
        Self::from_source(FromSource::Table(table))
    }

    /// A `SELECT *` over an arbitrary source.
    pub const fn from_source(from: FromSource) -> Self {
        Self {
            from,
            select: Vec::new(),
            distinct: Distinct::None,
            joins: Vec::new(),
            where_clause: None,
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// ANDs a condition into the WHERE clause.
    pub fn add_where(&mut self, node: WhereNode) {
        self.where_clause = Some(WhereNode::and_opt(self.where_clause.take(), node));
    }
}

/// A result row: shared column names plus one value per column.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Creates a row from column names and values.
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self::with_columns(columns.into(), values)
    }

    /// Creates a row sharing an existing column list.
    pub fn with_columns(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Returns the column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Gets a typed value by column name.
    pub fn get<T: FromValue>(&self, column: &str) -> EdgyResult<T> {
        let value = self.get_value(column).ok_or_else(|| {
            EdgyError::DatabaseError(format!("Column '{column}' not found in row"))
        })?;
        T::from_value(value)
    }

    /// Gets a typed value by position.
    pub fn get_by_index<T: FromValue>(&self, idx: usize) -> EdgyResult<T> {
        let value = self.values.get(idx).ok_or_else(|| {
            EdgyError::DatabaseError(format!(
                "Column index {idx} out of bounds (row has {} columns)",
                self.values.len()
            ))
        })?;
        T::from_value(value)
    }

    /// The raw value of a column.
    pub fn get_value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.values.get(idx))
    }

    /// The raw value at a position.
    pub fn value_at(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Consumes the row, returning its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// Conversion from a [`Value`] to a concrete Rust type.
///
/// Conversions accept the representations SQLite returns for types it does
/// not store natively (integers for booleans, text for UUIDs and dates).
pub trait FromValue: Sized {
    /// Attempts the conversion.
    fn from_value(value: &Value) -> EdgyResult<Self>;
}

fn mismatch(expected: &str, value: &Value) -> EdgyError {
    EdgyError::DatabaseError(format!("Expected {expected}, got {value:?}"))
}

impl FromValue for Value {
    fn from_value(value: &Value) -> EdgyResult<Self> {
        Ok(value.clone())
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> EdgyResult<Self> {
        match value {
            Value::Int(i) => Ok(*i),
            Value::Bool(b) => Ok(Self::from(*b)),
            _ => Err(mismatch("Int", value)),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> EdgyResult<Self> {
        let wide = i64::from_value(value)?;
        Self::try_from(wide)
            .map_err(|e| EdgyError::DatabaseError(format!("Int value out of i32 range: {e}")))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> EdgyResult<Self> {
        value.as_float().ok_or_else(|| mismatch("Float", value))
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> EdgyResult<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            _ => Err(mismatch("Bool", value)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> EdgyResult<Self> {
        match value {
            Value::String(s) => Ok(s.clone()),
            _ => Err(mismatch("String", value)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> EdgyResult<Self> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            _ => Err(mismatch("Bytes", value)),
        }
    }
}

impl FromValue for uuid::Uuid {
    fn from_value(value: &Value) -> EdgyResult<Self> {
        match value {
            Value::Uuid(u) => Ok(*u),
            Value::String(s) => Self::parse_str(s).map_err(|_| mismatch("Uuid", value)),
            _ => Err(mismatch("Uuid", value)),
        }
    }
}

impl FromValue for chrono::NaiveDate {
    fn from_value(value: &Value) -> EdgyResult<Self> {
        match value {
            Value::Date(d) => Ok(*d),
            Value::String(s) => s.parse().map_err(|_| mismatch("Date", value)),
            _ => Err(mismatch("Date", value)),
        }
    }
}

impl FromValue for chrono::NaiveDateTime {
    fn from_value(value: &Value) -> EdgyResult<Self> {
        match value {
            Value::DateTime(dt) => Ok(*dt),
            Value::DateTimeTz(dt) => Ok(dt.naive_utc()),
            Value::String(s) => Self::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                .or_else(|_| s.parse())
                .map_err(|_| mismatch("DateTime", value)),
            _ => Err(mismatch("DateTime", value)),
        }
    }
}

impl FromValue for chrono::DateTime<chrono::Utc> {
    fn from_value(value: &Value) -> EdgyResult<Self> {
        match value {
            Value::DateTimeTz(dt) => Ok(*dt),
            Value::DateTime(dt) => Ok(dt.and_utc()),
            Value::String(s) => s.parse().map_err(|_| mismatch("DateTimeTz", value)),
            _ => Err(mismatch("DateTimeTz", value)),
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> EdgyResult<Self> {
        match value {
            Value::Json(j) => Ok(j.clone()),
            Value::String(s) => Ok(serde_json::from_str(s)?),
            _ => Err(mismatch("Json", value)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> EdgyResult<Self> {
        match value {
            Value::Null => Ok(None),
            _ => T::from_value(value).map(Some),
        }
    }
}

/// Renders [`Query`] trees and DML statements into parameterized SQL.
#[derive(Debug, Clone, Copy)]
pub struct SqlCompiler {
    backend: DatabaseBackendType,
}

impl SqlCompiler {
    /// Creates a compiler for the given backend.
    pub const fn new(backend: DatabaseBackendType) -> Self {
        Self { backend }
    }

    /// The target backend.
    pub const fn backend(&self) -> DatabaseBackendType {
        self.backend
    }

    fn placeholder(&self, index: usize) -> String {
        match self.backend {
            DatabaseBackendType::PostgreSQL => format!("${index}"),
            DatabaseBackendType::SQLite => "?".to_string(),
        }
    }

    fn bind(&self, value: Value, params: &mut Vec<Value>) -> String {
        params.push(value);
        self.placeholder(params.len())
    }

    /// Compiles a SELECT.
    pub fn compile_select(&self, query: &Query) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = self.select_into(query, &mut params);
        (sql, params)
    }

    fn select_into(&self, query: &Query, params: &mut Vec<Value>) -> String {
        let mut sql = String::from("SELECT ");
        match &query.distinct {
            Distinct::None => {}
            Distinct::All => sql.push_str("DISTINCT "),
            Distinct::On(cols) => {
                let cols: Vec<String> = cols.iter().map(ColumnRef::render).collect();
                let _ = write!(sql, "DISTINCT ON ({}) ", cols.join(", "));
            }
        }

        if query.select.is_empty() {
            sql.push('*');
        } else {
            let parts: Vec<String> = query
                .select
                .iter()
                .map(|col| match col {
                    SelectColumn::Column(column, None) => column.render(),
                    SelectColumn::Column(column, Some(label)) => {
                        format!("{} AS {}", column.render(), quote(label))
                    }
                    SelectColumn::Expression(expr, label) => {
                        format!("{} AS {}", self.expression(expr, params), quote(label))
                    }
                })
                .collect();
            sql.push_str(&parts.join(", "));
        }

        sql.push_str(" FROM ");
        match &query.from {
            FromSource::Table(table) => sql.push_str(&table.render()),
            FromSource::Subquery(inner, alias) => {
                let inner_sql = self.select_into(inner, params);
                let _ = write!(sql, "({inner_sql}) AS {}", quote(alias));
            }
        }

        for join in &query.joins {
            let on: Vec<String> = join
                .on
                .iter()
                .map(|(l, r)| format!("{} = {}", l.render(), r.render()))
                .collect();
            let _ = write!(
                sql,
                " {} {} ON {}",
                join.join_type.sql_keyword(),
                join.table.render(),
                on.join(" AND ")
            );
        }

        if let Some(where_clause) = &query.where_clause {
            sql.push_str(" WHERE ");
            self.where_node(where_clause, &mut sql, params);
        }

        if !query.group_by.is_empty() {
            let cols: Vec<String> = query.group_by.iter().map(ColumnRef::render).collect();
            let _ = write!(sql, " GROUP BY {}", cols.join(", "));
        }

        if !query.order_by.is_empty() {
            let orders: Vec<String> = query
                .order_by
                .iter()
                .map(|o| {
                    let target = match &o.target {
                        OrderTarget::Column(c) => c.render(),
                        OrderTarget::Alias(a) => quote(a),
                    };
                    let dir = if o.descending { "DESC" } else { "ASC" };
                    format!("{target} {dir}")
                })
                .collect();
            let _ = write!(sql, " ORDER BY {}", orders.join(", "));
        }

        match (query.limit, query.offset) {
            (Some(limit), _) => {
                let _ = write!(sql, " LIMIT {limit}");
            }
            // SQLite requires a LIMIT before OFFSET.
            (None, Some(_)) if self.backend == DatabaseBackendType::SQLite => {
                sql.push_str(" LIMIT -1");
            }
            (None, _) => {}
        }
        if let Some(offset) = query.offset {
            let _ = write!(sql, " OFFSET {offset}");
        }

        sql
    }

    /// Compiles a (multi-row) INSERT. `rows` must each have one value per
    /// column. With no columns a single `DEFAULT VALUES` row is inserted.
    pub fn compile_insert(
        &self,
        table: &TableRef,
        columns: &[String],
        rows: &[Vec<Value>],
        returning: &[String],
    ) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let mut sql = format!("INSERT INTO {}", table.qualified());
        if columns.is_empty() {
            sql.push_str(" DEFAULT VALUES");
        } else {
            let cols: Vec<String> = columns.iter().map(|c| quote(c)).collect();
            let tuples: Vec<String> = rows
                .iter()
                .map(|row| {
                    let phs: Vec<String> = row
                        .iter()
                        .map(|v| self.bind(v.clone(), &mut params))
                        .collect();
                    format!("({})", phs.join(", "))
                })
                .collect();
            let _ = write!(sql, " ({}) VALUES {}", cols.join(", "), tuples.join(", "));
        }
        if !returning.is_empty() {
            let cols: Vec<String> = returning.iter().map(|c| quote(c)).collect();
            let _ = write!(sql, " RETURNING {}", cols.join(", "));
        }
        (sql, params)
    }

    /// Compiles an UPDATE. Without a WHERE clause every row is updated.
    pub fn compile_update(
        &self,
        table: &TableRef,
        assignments: &[(String, Value)],
        where_clause: Option<&WhereNode>,
    ) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sets: Vec<String> = assignments
            .iter()
            .map(|(column, value)| {
                let ph = self.bind(value.clone(), &mut params);
                format!("{} = {ph}", quote(column))
            })
            .collect();
        let mut sql = format!("UPDATE {} SET {}", table.qualified(), sets.join(", "));
        if let Some(node) = where_clause {
            sql.push_str(" WHERE ");
            self.where_node(node, &mut sql, &mut params);
        }
        (sql, params)
    }

    /// Compiles a DELETE. Without a WHERE clause every row is deleted.
    pub fn compile_delete(
        &self,
        table: &TableRef,
        where_clause: Option<&WhereNode>,
    ) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let mut sql = format!("DELETE FROM {}", table.qualified());
        if let Some(node) = where_clause {
            sql.push_str(" WHERE ");
            self.where_node(node, &mut sql, &mut params);
        }
        (sql, params)
    }

    fn where_node(&self, node: &WhereNode, sql: &mut String, params: &mut Vec<Value>) {
        match node {
            WhereNode::Condition { column, lookup } => {
                self.lookup(&column.render(), lookup, sql, params);
            }
            WhereNode::ColumnEq(left, right) => {
                let _ = write!(sql, "{} = {}", left.render(), right.render());
            }
            WhereNode::InSubquery {
                column,
                query,
                negated,
            } => {
                let not = if *negated { "NOT " } else { "" };
                let _ = write!(sql, "{} {not}IN (", column.render());
                let inner = self.select_into(query, params);
                sql.push_str(&inner);
                sql.push(')');
            }
            WhereNode::And(children) => self.junction(children, " AND ", "1=1", sql, params),
            WhereNode::Or(children) => self.junction(children, " OR ", "1=0", sql, params),
            WhereNode::Not(inner) => {
                sql.push_str("NOT (");
                self.where_node(inner, sql, params);
                sql.push(')');
            }
        }
    }

    fn junction(
        &self,
        children: &[WhereNode],
        op: &str,
        empty: &str,
        sql: &mut String,
        params: &mut Vec<Value>,
    ) {
        match children {
            [] => sql.push_str(empty),
            [only] => self.where_node(only, sql, params),
            _ => {
                sql.push('(');
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(op);
                    }
                    self.where_node(child, sql, params);
                }
                sql.push(')');
            }
        }
    }

    /// Substring, prefix or suffix match. `LIKE` ignores ASCII case on
    /// SQLite, so case-sensitive matches there use `GLOB`.
    fn pattern(
        &self,
        column: &str,
        needle: &str,
        anchor: Anchor,
        insensitive: bool,
        sql: &mut String,
        params: &mut Vec<Value>,
    ) {
        let glob = !insensitive && self.backend == DatabaseBackendType::SQLite;
        let (wildcard, escaped) = if glob {
            ('*', escape_glob(needle))
        } else {
            ('%', escape_like(needle))
        };
        let pattern = match anchor {
            Anchor::Contains => format!("{wildcard}{escaped}{wildcard}"),
            Anchor::Start => format!("{escaped}{wildcard}"),
            Anchor::End => format!("{wildcard}{escaped}"),
        };
        let ph = self.bind(Value::String(pattern), params);
        match (insensitive, self.backend) {
            (false, DatabaseBackendType::SQLite) => {
                let _ = write!(sql, "{column} GLOB {ph}");
            }
            (false, DatabaseBackendType::PostgreSQL) => {
                let _ = write!(sql, "{column} LIKE {ph} ESCAPE '\\'");
            }
            (true, DatabaseBackendType::PostgreSQL) => {
                let _ = write!(sql, "{column} ILIKE {ph} ESCAPE '\\'");
            }
            (true, DatabaseBackendType::SQLite) => {
                let _ = write!(sql, "LOWER({column}) LIKE LOWER({ph}) ESCAPE '\\'");
            }
        }
    }

    fn lookup(&self, column: &str, lookup: &Lookup, sql: &mut String, params: &mut Vec<Value>) {
        let compare = |op: &str, value: &Value, sql: &mut String, params: &mut Vec<Value>| {
            let ph = self.bind(value.clone(), params);
            let _ = write!(sql, "{column} {op} {ph}");
        };
        match lookup {
            Lookup::Exact(Value::Null) | Lookup::IsNull(true) => {
                let _ = write!(sql, "{column} IS NULL");
            }
            Lookup::IsNull(false) => {
                let _ = write!(sql, "{column} IS NOT NULL");
            }
            Lookup::Exact(value) => compare("=", value, sql, params),
            Lookup::Gt(value) => compare(">", value, sql, params),
            Lookup::Gte(value) => compare(">=", value, sql, params),
            Lookup::Lt(value) => compare("<", value, sql, params),
            Lookup::Lte(value) => compare("<=", value, sql, params),
            Lookup::IExact(value) => {
                let ph = self.bind(value.clone(), params);
                let _ = write!(sql, "LOWER({column}) = LOWER({ph})");
            }
            Lookup::Contains(s) => self.pattern(column, s, Anchor::Contains, false, sql, params),
            Lookup::IContains(s) => self.pattern(column, s, Anchor::Contains, true, sql, params),
            Lookup::StartsWith(s) => self.pattern(column, s, Anchor::Start, false, sql, params),
            Lookup::IStartsWith(s) => self.pattern(column, s, Anchor::Start, true, sql, params),
            Lookup::EndsWith(s) => self.pattern(column, s, Anchor::End, false, sql, params),
            Lookup::IEndsWith(s) => self.pattern(column, s, Anchor::End, true, sql, params),
            Lookup::In(values) if values.is_empty() => sql.push_str("1=0"),
            Lookup::In(values) => {
                let phs: Vec<String> = values.iter().map(|v| self.bind(v.clone(), params)).collect();
                let _ = write!(sql, "{column} IN ({})", phs.join(", "));
            }
            Lookup::Range(low, high) => {
                let low = self.bind(low.clone(), params);
                let high = self.bind(high.clone(), params);
                let _ = write!(sql, "{column} BETWEEN {low} AND {high}");
            }
        }
    }

    fn expression(&self, expr: &Expression, params: &mut Vec<Value>) -> String {
        match expr {
            Expression::F(path) => quote(path),
            Expression::Col(column) => column.render(),
            Expression::Value(value) => self.bind(value.clone(), params),
            Expression::Star => "*".to_string(),
            Expression::Func { name, args } => {
                let args: Vec<String> = args.iter().map(|a| self.expression(a, params)).collect();
                format!("{name}({})", args.join(", "))
            }
            Expression::Aggregate {
                func,
                field,
                distinct,
            } => {
                let distinct = if *distinct { "DISTINCT " } else { "" };
                format!("{}({distinct}{})", func.sql_name(), self.expression(field, params))
            }
            Expression::RawSQL(raw, raw_params) => {
                params.extend(raw_params.iter().cloned());
                raw.clone()
            }
            Expression::Add(l, r) => self.binary(l, "+", r, params),
            Expression::Sub(l, r) => self.binary(l, "-", r, params),
            Expression::Mul(l, r) => self.binary(l, "*", r, params),
            Expression::Div(l, r) => self.binary(l, "/", r, params),
        }
    }

    fn binary(&self, l: &Expression, op: &str, r: &Expression, params: &mut Vec<Value>) -> String {
        let l = self.expression(l, params);
        let r = self.expression(r, params);
        format!("({l} {op} {r})")
    }
}

#[derive(Clone, Copy)]
enum Anchor {
    Contains,
    Start,
    End,
}

/// Brackets the `GLOB` metacharacters so they match literally.
fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[') {
            out.push('[');
            out.push(c);
            out.push(']');
        } else {
            out.push(c);
        }
    }
    out
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
