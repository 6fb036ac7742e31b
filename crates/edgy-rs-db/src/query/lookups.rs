//! Filter predicates and Q objects.
//!
//! A [`Q`] is a tree of AND / OR / NOT over [`Leaf`] predicates. Each leaf
//! is a relationship-aware field path, a [`LookupOp`] and a value. Leaves are
//! parsed once from the `"album__name__icontains"` convention (or built with
//! the typed [`field`] builder) and validated against model metadata when the
//! owning `QuerySet` is compiled.
//!
//! # Examples
//!
//! ```
//! use edgy_rs_db::query::lookups::{field, LookupOp, Q};
//!
//! let q = Q::lookup("album__name__icontains", "mali");
//! let Q::Filter(leaf) = &q else { unreachable!() };
//! assert_eq!(leaf.path, vec!["album", "name"]);
//! assert_eq!(leaf.op, LookupOp::IContains);
//!
//! // The typed builder produces the same leaf.
//! assert_eq!(field("album__name").icontains("mali"), q);
//!
//! let either = Q::lookup("position", 1) | Q::lookup("position__gt", 10);
//! assert!(matches!(either, Q::Or(ref children) if children.len() == 2));
//! ```

use std::fmt;
use std::ops;

use edgy_rs_core::{EdgyError, EdgyResult};

use super::sql::Lookup;
use crate::value::Value;

/// Separator between path segments in lookup strings.
pub const LOOKUP_SEP: &str = "__";

/// A field-level comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupOp {
    /// `field = value`.
    Exact,
    /// Case-insensitive equality.
    IExact,
    /// Substring match.
    Contains,
    /// Case-insensitive substring match.
    IContains,
    /// Membership in a list.
    In,
    /// `field > value`.
    Gt,
    /// `field >= value`.
    Gte,
    /// `field < value`.
    Lt,
    /// `field <= value`.
    Lte,
    /// `IS NULL` / `IS NOT NULL`.
    IsNull,
    /// Prefix match.
    StartsWith,
    /// Case-insensitive prefix match.
    IStartsWith,
    /// Suffix match.
    EndsWith,
    /// Case-insensitive suffix match.
    IEndsWith,
    /// Inclusive range over a two-element list.
    Range,
}

impl LookupOp {
    /// Parses a lookup name (`"icontains"`).
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "exact" => Self::Exact,
            "iexact" => Self::IExact,
            "contains" => Self::Contains,
            "icontains" => Self::IContains,
            "in" => Self::In,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "isnull" => Self::IsNull,
            "startswith" => Self::StartsWith,
            "istartswith" => Self::IStartsWith,
            "endswith" => Self::EndsWith,
            "iendswith" => Self::IEndsWith,
            "range" => Self::Range,
            _ => return None,
        })
    }

    /// The lookup name as written in lookup strings.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::IExact => "iexact",
            Self::Contains => "contains",
            Self::IContains => "icontains",
            Self::In => "in",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::IsNull => "isnull",
            Self::StartsWith => "startswith",
            Self::IStartsWith => "istartswith",
            Self::EndsWith => "endswith",
            Self::IEndsWith => "iendswith",
            Self::Range => "range",
        }
    }

    /// Builds the SQL-level lookup for `value`, validating its shape.
    pub fn to_sql(self, value: &Value, path: &str) -> EdgyResult<Lookup> {
        let malformed = |expected: &str| {
            EdgyError::ConfigurationError(format!(
                "Lookup '{path}{LOOKUP_SEP}{}' expects {expected}, got {value}",
                self.name()
            ))
        };
        let text = || match value {
            Value::Null | Value::List(_) => Err(malformed("a scalar value")),
            Value::String(s) => Ok(s.clone()),
            other => Ok(other.to_string()),
        };
        Ok(match self {
            Self::Exact if value.is_null() => Lookup::IsNull(true),
            Self::Exact => Lookup::Exact(value.clone()),
            Self::IExact => Lookup::IExact(value.clone()),
            Self::Contains => Lookup::Contains(text()?),
            Self::IContains => Lookup::IContains(text()?),
            Self::StartsWith => Lookup::StartsWith(text()?),
            Self::IStartsWith => Lookup::IStartsWith(text()?),
            Self::EndsWith => Lookup::EndsWith(text()?),
            Self::IEndsWith => Lookup::IEndsWith(text()?),
            Self::Gt => Lookup::Gt(value.clone()),
            Self::Gte => Lookup::Gte(value.clone()),
            Self::Lt => Lookup::Lt(value.clone()),
            Self::Lte => Lookup::Lte(value.clone()),
            Self::In => match value {
                Value::List(items) => Lookup::In(items.clone()),
                _ => return Err(malformed("a list")),
            },
            Self::IsNull => match value.as_bool() {
                Some(flag) => Lookup::IsNull(flag),
                None => return Err(malformed("a boolean")),
            },
            Self::Range => match value {
                Value::List(bounds) if bounds.len() == 2 => {
                    Lookup::Range(bounds[0].clone(), bounds[1].clone())
                }
                _ => return Err(malformed("a two-element list")),
            },
        })
    }
}

impl fmt::Display for LookupOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One parsed predicate: a field path, an operator and a value.
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    /// Path segments; all but the last name relationships.
    pub path: Vec<String>,
    /// The comparison operator.
    pub op: LookupOp,
    /// The right-hand side.
    pub value: Value,
}

impl Leaf {
    /// Parses `"album__name__icontains"`. A trailing segment that is not a
    /// lookup name means `exact`.
    pub fn parse(key: &str, value: Value) -> Self {
        let mut path: Vec<String> = key.split(LOOKUP_SEP).map(str::to_string).collect();
        let op = match path.last().and_then(|s| LookupOp::from_name(s)) {
            Some(op) if path.len() > 1 => {
                path.pop();
                op
            }
            _ => LookupOp::Exact,
        };
        Self { path, op, value }
    }

    /// Returns `true` if the path crosses at least one relationship.
    pub fn traverses_relations(&self) -> bool {
        self.path.len() > 1
    }

    /// The path joined back with `__`.
    pub fn path_string(&self) -> String {
        self.path.join(LOOKUP_SEP)
    }
}

/// A composable filter predicate.
///
/// Combine with `&` (AND), `|` (OR) and `!` (NOT). Nested ANDs and ORs
/// flatten and double negation cancels.
#[derive(Debug, Clone, PartialEq)]
pub enum Q {
    /// A single predicate.
    Filter(Leaf),
    /// All children hold. An empty AND is always true.
    And(Vec<Q>),
    /// Any child holds. An empty OR is always false.
    Or(Vec<Q>),
    /// The child does not hold.
    Not(Box<Q>),
}

impl Q {
    /// Parses a lookup string into a leaf predicate.
    pub fn lookup(key: &str, value: impl Into<Value>) -> Self {
        Self::Filter(Leaf::parse(key, value.into()))
    }

    /// A predicate from an explicit path and operator.
    pub fn filter(path: &str, op: LookupOp, value: impl Into<Value>) -> Self {
        Self::Filter(Leaf {
            path: path.split(LOOKUP_SEP).map(str::to_string).collect(),
            op,
            value: value.into(),
        })
    }

    /// AND of several `(lookup_string, value)` pairs.
    pub fn kwargs<K, V, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        and_(pairs.into_iter().map(|(k, v)| Self::lookup(k.as_ref(), v)))
    }

    /// Returns `true` for an empty AND or OR.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::And(children) | Self::Or(children) => children.is_empty(),
            _ => false,
        }
    }

    /// Visits every leaf in the tree.
    pub fn leaves(&self) -> Vec<&Leaf> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Leaf>) {
        match self {
            Self::Filter(leaf) => out.push(leaf),
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_leaves(out);
                }
            }
            Self::Not(inner) => inner.collect_leaves(out),
        }
    }
}

impl Default for Q {
    /// The empty AND, which matches every row.
    fn default() -> Self {
        Self::And(Vec::new())
    }
}

/// AND of all predicates.
pub fn and_(predicates: impl IntoIterator<Item = Q>) -> Q {
    predicates.into_iter().fold(Q::And(Vec::new()), |acc, q| acc & q)
}

/// OR of all predicates.
pub fn or_(predicates: impl IntoIterator<Item = Q>) -> Q {
    predicates.into_iter().fold(Q::Or(Vec::new()), |acc, q| acc | q)
}

/// Negation of a predicate.
pub fn not_(predicate: Q) -> Q {
    !predicate
}

impl ops::BitAnd for Q {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), other) => {
                left.push(other);
                Self::And(left)
            }
            (other, Self::And(mut right)) => {
                right.insert(0, other);
                Self::And(right)
            }
            (left, right) => Self::And(vec![left, right]),
        }
    }
}

impl ops::BitOr for Q {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            (Self::Or(mut left), Self::Or(right)) => {
                left.extend(right);
                Self::Or(left)
            }
            (Self::Or(mut left), other) => {
                left.push(other);
                Self::Or(left)
            }
            (other, Self::Or(mut right)) => {
                right.insert(0, other);
                Self::Or(right)
            }
            (left, right) => Self::Or(vec![left, right]),
        }
    }
}

impl ops::Not for Q {
    type Output = Self;

    fn not(self) -> Self::Output {
        match self {
            Self::Not(inner) => *inner,
            other => Self::Not(Box::new(other)),
        }
    }
}

/// Starts a typed predicate on `path`.
pub fn field(path: impl Into<String>) -> FieldRef {
    FieldRef { path: path.into() }
}

/// A field path awaiting an operator. See [`field`].
#[derive(Debug, Clone)]
pub struct FieldRef {
    path: String,
}

macro_rules! field_ops {
    ($($method:ident => $op:ident),* $(,)?) => {
        $(
            #[doc = concat!("`", stringify!($method), "` lookup.")]
            pub fn $method(&self, value: impl Into<Value>) -> Q {
                Q::filter(&self.path, LookupOp::$op, value)
            }
        )*
    };
}

impl FieldRef {
    field_ops! {
        exact => Exact,
        iexact => IExact,
        contains => Contains,
        icontains => IContains,
        gt => Gt,
        gte => Gte,
        lt => Lt,
        lte => Lte,
        startswith => StartsWith,
        istartswith => IStartsWith,
        endswith => EndsWith,
        iendswith => IEndsWith,
    }

    /// `in` lookup.
    pub fn is_in<V: Into<Value>>(&self, values: impl IntoIterator<Item = V>) -> Q {
        Q::filter(
            &self.path,
            LookupOp::In,
            Value::List(values.into_iter().map(Into::into).collect()),
        )
    }

    /// `isnull` lookup.
    pub fn isnull(&self, flag: bool) -> Q {
        Q::filter(&self.path, LookupOp::IsNull, flag)
    }

    /// Inclusive `range` lookup.
    pub fn range(&self, low: impl Into<Value>, high: impl Into<Value>) -> Q {
        Q::filter(
            &self.path,
            LookupOp::Range,
            Value::List(vec![low.into(), high.into()]),
        )
    }
}
