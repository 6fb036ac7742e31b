//! Backend-agnostic database values.
//!
//! [`Value`] carries field values, query parameters and row cells between the
//! query engine and the backends. [`ValueKey`] is its hashable projection,
//! used wherever rows have to be grouped or deduplicated by key (prefetch
//! stitching, primary-key identity).

use std::fmt;

/// A backend-agnostic representation of a database value.
///
/// # Examples
///
/// ```
/// use edgy_rs_db::value::Value;
///
/// assert_eq!(Value::from(42_i64), Value::Int(42));
/// assert_eq!(Value::from("Malibu"), Value::String("Malibu".to_string()));
/// assert_eq!(Value::from(None::<i64>), Value::Null);
/// ```
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    /// SQL NULL.
    Null,
    /// A boolean value.
    Bool(bool),
    /// A 64-bit signed integer.
    Int(i64),
    /// A 64-bit floating-point number.
    Float(f64),
    /// A UTF-8 string.
    String(String),
    /// Raw binary data.
    Bytes(Vec<u8>),
    /// A date without time.
    Date(chrono::NaiveDate),
    /// A date and time without timezone.
    DateTime(chrono::NaiveDateTime),
    /// A date and time with UTC timezone.
    DateTimeTz(chrono::DateTime<chrono::Utc>),
    /// A time without date.
    Time(chrono::NaiveTime),
    /// A UUID value.
    Uuid(uuid::Uuid),
    /// A JSON value.
    Json(serde_json::Value),
    /// A list of values (IN clauses, composite keys).
    List(Vec<Value>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Date(d) => write!(f, "{d}"),
            Self::DateTime(dt) => write!(f, "{dt}"),
            Self::DateTimeTz(dt) => write!(f, "{dt}"),
            Self::Time(t) => write!(f, "{t}"),
            Self::Uuid(u) => write!(f, "{u}"),
            Self::Json(j) => write!(f, "{j}"),
            Self::List(vals) => {
                write!(f, "[")?;
                for (i, v) in vals.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident $(via $conv:path)?),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant($($conv)?(v))
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i16 => Int via i64::from,
    i32 => Int via i64::from,
    i64 => Int,
    u32 => Int via i64::from,
    f32 => Float via f64::from,
    f64 => Float,
    String => String,
    Vec<u8> => Bytes,
    chrono::NaiveDate => Date,
    chrono::NaiveDateTime => DateTime,
    chrono::DateTime<chrono::Utc> => DateTimeTz,
    chrono::NaiveTime => Time,
    uuid::Uuid => Uuid,
    serde_json::Value => Json,
    Vec<Value> => List,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl Value {
    /// Returns `true` if this value is `Null`.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Attempts to extract a boolean value. SQLite integers 0/1 count.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(0) => Some(false),
            Self::Int(1) => Some(true),
            _ => None,
        }
    }

    /// Attempts to extract an integer value.
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Attempts to extract a float value.
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Attempts to extract a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Renders the value as plain JSON (no type tags).
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Self::Null => J::Null,
            Self::Bool(b) => J::Bool(*b),
            Self::Int(i) => J::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f).map_or(J::Null, J::Number),
            Self::Json(j) => j.clone(),
            Self::List(vals) => J::Array(vals.iter().map(Self::to_json).collect()),
            Self::Bytes(b) => J::Array(b.iter().map(|byte| J::from(*byte)).collect()),
            other => J::String(other.to_string()),
        }
    }

    /// Returns the hashable key for this value.
    pub fn key(&self) -> ValueKey {
        match self {
            Self::Null => ValueKey::Null,
            Self::Bool(b) => ValueKey::Int(i64::from(*b)),
            Self::Int(i) => ValueKey::Int(*i),
            Self::Float(f) => ValueKey::Float(f.to_bits()),
            Self::Bytes(b) => ValueKey::Bytes(b.clone()),
            Self::List(vals) => ValueKey::List(vals.iter().map(Self::key).collect()),
            // Text-like values compare by their canonical text form so that a
            // UUID bound as a parameter matches the string SQLite returns.
            other => ValueKey::Text(other.to_string()),
        }
    }
}

/// A hashable, totally-ordered projection of a [`Value`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueKey {
    /// NULL.
    Null,
    /// Integers and booleans.
    Int(i64),
    /// Floats, by bit pattern.
    Float(u64),
    /// Strings and every text-rendered type.
    Text(String),
    /// Binary data.
    Bytes(Vec<u8>),
    /// Composite keys.
    List(Vec<ValueKey>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_integers() {
        assert_eq!(Value::from(42_i32), Value::Int(42));
        assert_eq!(Value::from(42_i16), Value::Int(42));
        assert_eq!(Value::from(7_u32), Value::Int(7));
    }

    #[test]
    fn test_from_option() {
        assert_eq!(Value::from(Some(42_i64)), Value::Int(42));
        assert_eq!(Value::from(None::<&str>), Value::Null);
    }

    #[test]
    fn test_display_list() {
        let v = Value::List(vec![Value::Int(1), Value::from("a")]);
        assert_eq!(v.to_string(), "[1, a]");
    }

    #[test]
    fn test_as_bool_accepts_sqlite_integers() {
        assert_eq!(Value::Int(1).as_bool(), Some(true));
        assert_eq!(Value::Int(0).as_bool(), Some(false));
        assert_eq!(Value::Int(2).as_bool(), None);
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
    }

    #[test]
    fn test_uuid_key_matches_string_key() {
        let u = uuid::Uuid::new_v4();
        assert_eq!(Value::Uuid(u).key(), Value::String(u.to_string()).key());
    }

    #[test]
    fn test_key_distinguishes_int_and_text() {
        assert_ne!(Value::Int(1).key(), Value::from("1").key());
        assert_eq!(Value::Bool(true).key(), Value::Int(1).key());
    }

    #[test]
    fn test_to_json_is_untagged() {
        assert_eq!(Value::from("Malibu").to_json(), serde_json::json!("Malibu"));
        assert_eq!(Value::Int(3).to_json(), serde_json::json!(3));
        assert_eq!(Value::Null.to_json(), serde_json::Value::Null);
    }

    #[test]
    fn test_composite_key() {
        let a = Value::List(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::List(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(a.key(), b.key());
    }
}
