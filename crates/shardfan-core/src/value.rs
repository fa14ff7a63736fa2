//! Values returned by shard operations.
//!
//! Per-shard results are sequences of [`Value`]s: scalars from projections,
//! tuples from multi-column projections, or [`Entity`] rows. The merge
//! pipeline only needs three things from a value: value equality (distinct),
//! property lookup plus natural ordering (order by, min/max) and numeric
//! conversion (sum/avg).

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use bigdecimal::BigDecimal;

/// A value in a shard result
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Decimal(BigDecimal),
    Text(String),
    /// Multi-column projection row; properties are addressed by index.
    Tuple(Vec<Value>),
    Entity(Entity),
}

/// A mapped entity row
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entity {
    name: String,
    properties: BTreeMap<String, Value>,
}

impl Entity {
    pub fn new(name: impl Into<String>) -> Self {
        Entity {
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(property, value);
        self
    }

    pub fn set(&mut self, property: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(property.into(), value.into());
    }

    pub fn get(&self, property: &str) -> Option<&Value> {
        self.properties.get(property)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }
}

impl Value {
    /// Type name for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::I8(_) => "i8",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::U8(_) => "u8",
            Value::U16(_) => "u16",
            Value::U32(_) => "u32",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Decimal(_) => "decimal",
            Value::Text(_) => "text",
            Value::Tuple(_) => "tuple",
            Value::Entity(_) => "entity",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || self.is_float() || matches!(self, Value::Decimal(_))
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Value::I8(_)
                | Value::I16(_)
                | Value::I32(_)
                | Value::I64(_)
                | Value::U8(_)
                | Value::U16(_)
                | Value::U32(_)
                | Value::U64(_)
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Value::F32(_) | Value::F64(_))
    }

    /// Any integer variant widened to `i128`.
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Value::I8(v) => Some(i128::from(*v)),
            Value::I16(v) => Some(i128::from(*v)),
            Value::I32(v) => Some(i128::from(*v)),
            Value::I64(v) => Some(i128::from(*v)),
            Value::U8(v) => Some(i128::from(*v)),
            Value::U16(v) => Some(i128::from(*v)),
            Value::U32(v) => Some(i128::from(*v)),
            Value::U64(v) => Some(i128::from(*v)),
            _ => None,
        }
    }

    /// Any numeric variant as `f64`. Decimals are converted through their
    /// string form and may lose precision.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F32(v) => Some(f64::from(*v)),
            Value::F64(v) => Some(*v),
            Value::Decimal(d) => d.to_string().parse::<f64>().ok(),
            other => other.as_i128().map(|v| v as f64),
        }
    }

    /// Any numeric variant as a decimal. Non-finite floats have no decimal form.
    pub fn as_decimal(&self) -> Option<BigDecimal> {
        match self {
            Value::Decimal(d) => Some(d.clone()),
            Value::F32(v) if v.is_finite() => BigDecimal::from_str(&v.to_string()).ok(),
            Value::F64(v) if v.is_finite() => BigDecimal::from_str(&v.to_string()).ok(),
            other => other
                .as_i128()
                .and_then(|v| BigDecimal::from_str(&v.to_string()).ok()),
        }
    }

    /// Property lookup used by ordering and aggregation.
    ///
    /// Entities resolve by property name, tuples by positional index.
    pub fn property(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Entity(entity) => entity.get(name),
            Value::Tuple(items) => name.parse::<usize>().ok().and_then(|idx| items.get(idx)),
            _ => None,
        }
    }

    /// Natural ordering between comparable values.
    ///
    /// Numbers compare across widths and representations, text and booleans
    /// compare within their own type, tuples compare lexicographically.
    /// Returns `None` for incomparable pairs (including entities).
    pub fn natural_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Decimal(a), Value::Decimal(b)) => Some(a.cmp(b)),
            (Value::Tuple(a), Value::Tuple(b)) => {
                for (left, right) in a.iter().zip(b.iter()) {
                    match left.natural_cmp(right)? {
                        Ordering::Equal => continue,
                        unequal => return Some(unequal),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            (a, b) if a.is_numeric() && b.is_numeric() => {
                if let (Some(x), Some(y)) = (a.as_i128(), b.as_i128()) {
                    Some(x.cmp(&y))
                } else if a.is_float() || b.is_float() {
                    a.as_f64()?.partial_cmp(&b.as_f64()?)
                } else {
                    Some(a.as_decimal()?.cmp(&b.as_decimal()?))
                }
            }
            _ => None,
        }
    }
}

// Floats compare by canonical bit pattern so that distinct can hash them:
// all NaNs are one value and -0.0 equals 0.0.
fn canonical_f64_bits(v: f64) -> u64 {
    if v == 0.0 {
        0.0f64.to_bits()
    } else if v.is_nan() {
        f64::NAN.to_bits()
    } else {
        v.to_bits()
    }
}

fn canonical_f32_bits(v: f32) -> u32 {
    if v == 0.0 {
        0.0f32.to_bits()
    } else if v.is_nan() {
        f32::NAN.to_bits()
    } else {
        v.to_bits()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I8(a), Value::I8(b)) => a == b,
            (Value::I16(a), Value::I16(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::U8(a), Value::U8(b)) => a == b,
            (Value::U16(a), Value::U16(b)) => a == b,
            (Value::U32(a), Value::U32(b)) => a == b,
            (Value::U64(a), Value::U64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => canonical_f32_bits(*a) == canonical_f32_bits(*b),
            (Value::F64(a), Value::F64(b)) => canonical_f64_bits(*a) == canonical_f64_bits(*b),
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Entity(a), Value::Entity(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(v) => v.hash(state),
            Value::I8(v) => v.hash(state),
            Value::I16(v) => v.hash(state),
            Value::I32(v) => v.hash(state),
            Value::I64(v) => v.hash(state),
            Value::U8(v) => v.hash(state),
            Value::U16(v) => v.hash(state),
            Value::U32(v) => v.hash(state),
            Value::U64(v) => v.hash(state),
            Value::F32(v) => canonical_f32_bits(*v).hash(state),
            Value::F64(v) => canonical_f64_bits(*v).hash(state),
            Value::Decimal(v) => v.hash(state),
            Value::Text(v) => v.hash(state),
            Value::Tuple(v) => v.hash(state),
            Value::Entity(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::I8(v) => write!(f, "{}", v),
            Value::I16(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::U8(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::F32(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::Decimal(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{:?}", v),
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Value::Entity(entity) => write!(f, "{}{:?}", entity.name, entity.properties),
        }
    }
}

macro_rules! impl_from_primitive {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from_primitive!(
    bool => Bool,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    BigDecimal => Decimal,
    String => Text,
    Entity => Entity,
    Vec<Value> => Tuple,
);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_numeric_natural_ordering_crosses_widths() {
        assert_eq!(Value::I32(5).natural_cmp(&Value::U64(7)), Some(Ordering::Less));
        assert_eq!(Value::F64(2.5).natural_cmp(&Value::I64(2)), Some(Ordering::Greater));
        let decimal = Value::Decimal(BigDecimal::from_str("3.25").unwrap());
        assert_eq!(decimal.natural_cmp(&Value::I16(3)), Some(Ordering::Greater));
        assert_eq!(Value::Text("a".into()).natural_cmp(&Value::I8(1)), None);
    }

    #[test]
    fn test_float_equality_is_hash_consistent() {
        let mut seen = HashSet::new();
        assert!(seen.insert(Value::F64(0.0)));
        assert!(!seen.insert(Value::F64(-0.0)));
        assert!(seen.insert(Value::F64(f64::NAN)));
        assert!(!seen.insert(Value::F64(f64::NAN)));
        assert_ne!(Value::I32(1), Value::I64(1));
    }

    #[test]
    fn test_property_lookup() {
        let row = Value::Entity(Entity::new("Order").with("total", 42i64));
        assert_eq!(row.property("total"), Some(&Value::I64(42)));
        assert_eq!(row.property("missing"), None);

        let tuple = Value::Tuple(vec![Value::F64(1.5), Value::U64(3)]);
        assert_eq!(tuple.property("1"), Some(&Value::U64(3)));
        assert_eq!(tuple.property("x"), None);
        assert_eq!(Value::I32(1).property("0"), None);
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));
    }
}
