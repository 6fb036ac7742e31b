//! Expressions, aggregates and F-objects.
//!
//! An [`Expression`] is a computed value usable in `extra_select` and
//! `values()` queries. `F` references a field path (possibly across to-one
//! relationships); the statement compiler resolves it to a qualified
//! [`ColumnRef`](crate::query::sql::ColumnRef) before SQL generation.
//!
//! # Examples
//!
//! ```
//! use edgy_rs_db::query::expressions::{AggregateFunc, Expression};
//!
//! let duration = Expression::f("length") / Expression::value(60);
//! assert!(matches!(duration, Expression::Div(_, _)));
//!
//! let tracks = Expression::aggregate(AggregateFunc::Count, Expression::f("id"));
//! assert!(matches!(tracks, Expression::Aggregate { distinct: false, .. }));
//! ```

use std::ops;

use crate::query::sql::ColumnRef;
use crate::value::Value;

/// A computed value in the context of a SQL query.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// A field path such as `"album__name"`, resolved at compile time.
    F(String),
    /// A resolved, qualified column.
    Col(ColumnRef),
    /// A literal value, bound as a parameter.
    Value(Value),
    /// `*`, only meaningful as the argument of `COUNT`.
    Star,
    /// A database function call.
    Func {
        /// Function name (e.g. `"COALESCE"`, `"UPPER"`).
        name: String,
        /// Function arguments.
        args: Vec<Expression>,
    },
    /// An aggregate function.
    Aggregate {
        /// The aggregate operation.
        func: AggregateFunc,
        /// The aggregated expression.
        field: Box<Expression>,
        /// Whether to apply DISTINCT.
        distinct: bool,
    },
    /// Raw SQL with parameters, using the backend's placeholder style.
    RawSQL(String, Vec<Value>),
    /// Addition.
    Add(Box<Expression>, Box<Expression>),
    /// Subtraction.
    Sub(Box<Expression>, Box<Expression>),
    /// Multiplication.
    Mul(Box<Expression>, Box<Expression>),
    /// Division.
    Div(Box<Expression>, Box<Expression>),
}

/// Aggregate function types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    /// COUNT.
    Count,
    /// SUM.
    Sum,
    /// AVG.
    Avg,
    /// MIN.
    Min,
    /// MAX.
    Max,
}

impl AggregateFunc {
    /// Returns the SQL function name for this aggregate.
    pub const fn sql_name(self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }
}

impl Expression {
    /// References a field path.
    pub fn f(path: impl Into<String>) -> Self {
        Self::F(path.into())
    }

    /// A literal value.
    pub fn value(v: impl Into<Value>) -> Self {
        Self::Value(v.into())
    }

    /// A function call.
    pub fn func(name: impl Into<String>, args: Vec<Self>) -> Self {
        Self::Func {
            name: name.into(),
            args,
        }
    }

    /// An aggregate over `field`.
    pub fn aggregate(func: AggregateFunc, field: Self) -> Self {
        Self::Aggregate {
            func,
            field: Box::new(field),
            distinct: false,
        }
    }

    /// An aggregate over the distinct values of `field`.
    pub fn aggregate_distinct(func: AggregateFunc, field: Self) -> Self {
        Self::Aggregate {
            func,
            field: Box::new(field),
            distinct: true,
        }
    }

    /// `COUNT(*)`.
    pub fn count_all() -> Self {
        Self::aggregate(AggregateFunc::Count, Self::Star)
    }

    /// Raw SQL with parameters.
    pub fn raw(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self::RawSQL(sql.into(), params)
    }

    /// Returns `true` if an aggregate appears anywhere in the tree.
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Self::Aggregate { .. } => true,
            Self::Func { args, .. } => args.iter().any(Self::contains_aggregate),
            Self::Add(l, r) | Self::Sub(l, r) | Self::Mul(l, r) | Self::Div(l, r) => {
                l.contains_aggregate() || r.contains_aggregate()
            }
            _ => false,
        }
    }

    /// Rewrites every `F` path with `resolve`, failing on the first error.
    pub fn resolve<E>(
        &self,
        resolve: &mut impl FnMut(&str) -> Result<ColumnRef, E>,
    ) -> Result<Self, E> {
        Ok(match self {
            Self::F(path) => Self::Col(resolve(path)?),
            Self::Func { name, args } => Self::Func {
                name: name.clone(),
                args: args
                    .iter()
                    .map(|a| a.resolve(resolve))
                    .collect::<Result<_, _>>()?,
            },
            Self::Aggregate {
                func,
                field,
                distinct,
            } => Self::Aggregate {
                func: *func,
                field: Box::new(field.resolve(resolve)?),
                distinct: *distinct,
            },
            Self::Add(l, r) => Self::Add(Box::new(l.resolve(resolve)?), Box::new(r.resolve(resolve)?)),
            Self::Sub(l, r) => Self::Sub(Box::new(l.resolve(resolve)?), Box::new(r.resolve(resolve)?)),
            Self::Mul(l, r) => Self::Mul(Box::new(l.resolve(resolve)?), Box::new(r.resolve(resolve)?)),
            Self::Div(l, r) => Self::Div(Box::new(l.resolve(resolve)?), Box::new(r.resolve(resolve)?)),
            other => other.clone(),
        })
    }

    /// Every `F` path referenced by the tree.
    pub fn field_paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::F(path) => out.push(path),
            Self::Func { args, .. } => args.iter().for_each(|a| a.collect_paths(out)),
            Self::Aggregate { field, .. } => field.collect_paths(out),
            Self::Add(l, r) | Self::Sub(l, r) | Self::Mul(l, r) | Self::Div(l, r) => {
                l.collect_paths(out);
                r.collect_paths(out);
            }
            _ => {}
        }
    }
}

impl ops::Add for Expression {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self::Add(Box::new(self), Box::new(rhs))
    }
}

impl ops::Sub for Expression {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self::Sub(Box::new(self), Box::new(rhs))
    }
}

impl ops::Mul for Expression {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self::Output {
        Self::Mul(Box::new(self), Box::new(rhs))
    }
}

impl ops::Div for Expression {
    type Output = Self;
    fn div(self, rhs: Self) -> Self::Output {
        Self::Div(Box::new(self), Box::new(rhs))
    }
}
