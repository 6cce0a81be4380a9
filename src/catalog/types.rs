use crate::catalog::ContainerKey;
use crate::storage::encoded_key::EncodedKey;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    Blob,
    Timestamp,
}

impl ColumnType {
    /// Whether `value` may be stored in a column of this type. `Null` fits
    /// every column.
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (ColumnType::Text, Value::Text(_))
                | (ColumnType::Integer, Value::Integer(_))
                | (ColumnType::Float, Value::Float(_))
                | (ColumnType::Boolean, Value::Boolean(_))
                | (ColumnType::Blob, Value::Blob(_))
                | (ColumnType::Timestamp, Value::Timestamp(_))
        )
    }

    pub fn of(value: &Value) -> Option<ColumnType> {
        match value {
            Value::Text(_) => Some(ColumnType::Text),
            Value::Integer(_) => Some(ColumnType::Integer),
            Value::Float(_) => Some(ColumnType::Float),
            Value::Boolean(_) => Some(ColumnType::Boolean),
            Value::Blob(_) => Some(ColumnType::Blob),
            Value::Timestamp(_) => Some(ColumnType::Timestamp),
            Value::Null => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Text(CompactString),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Blob(#[serde(with = "serde_bytes")] Vec<u8>),
    Timestamp(i64),
    Null,
}

impl Value {
    pub fn text(s: impl AsRef<str>) -> Self {
        Value::Text(CompactString::new(s.as_ref()))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) => 2,
            Value::Timestamp(_) => 3,
            Value::Float(_) => 4,
            Value::Text(_) => 5,
            Value::Blob(_) => 6,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Text(s) => write!(f, "{s}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Blob(b) => write!(f, "x'{}'", hex::encode(b)),
            Value::Timestamp(ts) => write!(f, "ts:{ts}"),
            Value::Null => write!(f, "NULL"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank_cmp = self.kind_rank().cmp(&other.kind_rank());
        if rank_cmp != Ordering::Equal {
            return rank_cmp;
        }

        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn from_values(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, column: usize) -> Option<&Value> {
        self.values.get(column)
    }

    /// Keeps only the listed columns, in the listed order.
    pub fn project(&self, columns: &[usize]) -> Row {
        Row {
            values: columns
                .iter()
                .map(|c| self.values.get(*c).cloned().unwrap_or(Value::Null))
                .collect(),
        }
    }
}

impl<const N: usize> From<[Value; N]> for Row {
    fn from(values: [Value; N]) -> Self {
        Row::from_values(values.to_vec())
    }
}

/// One key column of an ordered conglomerate or a sort.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnOrdering {
    pub column: usize,
    pub ascending: bool,
}

impl ColumnOrdering {
    pub fn asc(column: usize) -> Self {
        Self {
            column,
            ascending: true,
        }
    }

    pub fn desc(column: usize) -> Self {
        Self {
            column,
            ascending: false,
        }
    }
}

/// Physical address of a stored row: its container and the record key
/// within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowLocation {
    pub container: ContainerKey,
    pub record: EncodedKey,
}

#[cfg(test)]
mod tests {
    use super::{ColumnType, Row, Value};
    use proptest::prelude::*;

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Boolean),
            any::<i64>().prop_map(Value::Integer),
            any::<i64>().prop_map(Value::Timestamp),
            any::<f64>()
                .prop_filter("finite float only", |v| v.is_finite())
                .prop_map(Value::Float),
            "\\PC{0,32}".prop_map(|s| Value::Text(s.into())),
            prop::collection::vec(any::<u8>(), 0..64).prop_map(Value::Blob),
            Just(Value::Null),
        ]
    }

    proptest! {
        #[test]
        fn rows_survive_msgpack_encoding(values in prop::collection::vec(arb_value(), 0..16)) {
            let row = Row::from_values(values);
            let bytes = rmp_serde::to_vec(&row).expect("encode");
            let decoded: Row = rmp_serde::from_slice(&bytes).expect("decode");
            prop_assert_eq!(row, decoded);
        }
    }

    #[test]
    fn null_fits_every_column_type() {
        for ty in [
            ColumnType::Text,
            ColumnType::Integer,
            ColumnType::Float,
            ColumnType::Boolean,
            ColumnType::Blob,
            ColumnType::Timestamp,
        ] {
            assert!(ty.accepts(&Value::Null));
        }
        assert!(!ColumnType::Integer.accepts(&Value::text("1")));
    }

    #[test]
    fn projection_pads_missing_columns_with_null() {
        let row = Row::from([Value::Integer(1), Value::text("a")]);
        let projected = row.project(&[1, 4]);
        assert_eq!(projected.values, vec![Value::text("a"), Value::Null]);
    }
}
