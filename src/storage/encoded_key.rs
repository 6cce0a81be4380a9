use crate::catalog::types::{ColumnOrdering, Row, Value};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Byte string whose lexicographic order matches the order of the values it
/// was built from. Used as the record key inside raw containers.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EncodedKey {
    bytes: SmallVec<[u8; 64]>,
}

impl EncodedKey {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Heap record ids are plain big-endian integers.
    pub fn from_record_id(id: u64) -> Self {
        Self {
            bytes: SmallVec::from_slice(&id.to_be_bytes()),
        }
    }

    /// Encodes the ordered columns of `row`; descending columns have every
    /// byte inverted so larger values sort first.
    pub fn from_ordering(row: &Row, ordering: &[ColumnOrdering]) -> Self {
        let values: Vec<&Value> = ordering
            .iter()
            .map(|col| row.values.get(col.column).unwrap_or(&Value::Null))
            .collect();
        Self::encode_ordered(values.into_iter().zip(ordering))
    }

    /// Encodes key values given in ordering position, i.e. `values[i]` is the
    /// value of `ordering[i]`. Shorter inputs yield a prefix of the full key.
    pub fn from_prefix(values: &[Value], ordering: &[ColumnOrdering]) -> Self {
        Self::encode_ordered(values.iter().zip(ordering))
    }

    fn encode_ordered<'a>(pairs: impl Iterator<Item = (&'a Value, &'a ColumnOrdering)>) -> Self {
        let mut out = SmallVec::<[u8; 64]>::new();
        for (value, col) in pairs {
            if col.ascending {
                encode_value(value, &mut out);
            } else {
                let mut part = SmallVec::<[u8; 64]>::new();
                encode_value(value, &mut part);
                out.extend(part.iter().map(|b| !b));
            }
        }
        Self { bytes: out }
    }

    pub fn starts_with(&self, prefix: &EncodedKey) -> bool {
        self.bytes.starts_with(&prefix.bytes)
    }

    pub fn concat(&self, suffix: &EncodedKey) -> EncodedKey {
        let mut bytes = self.bytes.clone();
        bytes.extend_from_slice(&suffix.bytes);
        EncodedKey { bytes }
    }
}

impl std::fmt::Display for EncodedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.as_slice()))
    }
}

pub fn prefix_successor(prefix: &EncodedKey) -> Option<EncodedKey> {
    let mut next = prefix.bytes.clone();
    for i in (0..next.len()).rev() {
        if next[i] != 0xFF {
            next[i] += 1;
            next.truncate(i + 1);
            return Some(EncodedKey { bytes: next });
        }
    }
    None
}

fn encode_value(v: &Value, out: &mut SmallVec<[u8; 64]>) {
    match v {
        Value::Integer(i) => {
            out.push(0x10);
            let shifted = (*i as u64) ^ 0x8000_0000_0000_0000;
            out.extend_from_slice(&shifted.to_be_bytes());
        }
        Value::Timestamp(ts) => {
            out.push(0x11);
            let shifted = (*ts as u64) ^ 0x8000_0000_0000_0000;
            out.extend_from_slice(&shifted.to_be_bytes());
        }
        Value::Text(s) => {
            out.push(0x14);
            append_text(s, out);
        }
        Value::Boolean(b) => {
            out.push(0x16);
            out.push(if *b { 1 } else { 0 });
        }
        Value::Float(f) => {
            out.push(0x17);
            let bits = f.to_bits();
            let mapped = if (bits >> 63) == 1 {
                !bits
            } else {
                bits ^ 0x8000_0000_0000_0000
            };
            out.extend_from_slice(&mapped.to_be_bytes());
        }
        Value::Blob(b) => {
            out.push(0x18);
            out.extend_from_slice(&(b.len() as u32).to_be_bytes());
            out.extend_from_slice(b);
        }
        Value::Null => {
            out.push(0xFF);
        }
    }
}

fn append_text(s: &str, out: &mut SmallVec<[u8; 64]>) {
    for byte in s.as_bytes() {
        if *byte == 0 {
            // Escape interior nulls so terminator remains unambiguous.
            out.extend_from_slice(&[0x00, 0xFF]);
        } else {
            out.push(*byte);
        }
    }
    out.push(0x00);
}

#[cfg(test)]
mod tests {
    use super::{EncodedKey, prefix_successor};
    use crate::catalog::types::{ColumnOrdering, Row, Value};

    #[test]
    fn integer_order_is_preserved() {
        let ordering = [ColumnOrdering::asc(0)];
        let key = |v: i64| EncodedKey::from_ordering(&Row::from([Value::Integer(v)]), &ordering);
        let (a, b, c) = (key(-1), key(0), key(42));
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn descending_columns_reverse_order() {
        let ordering = [ColumnOrdering::desc(0)];
        let low = EncodedKey::from_ordering(&Row::from([Value::Integer(1)]), &ordering);
        let high = EncodedKey::from_ordering(&Row::from([Value::Integer(9)]), &ordering);
        assert!(high < low);
    }

    #[test]
    fn prefix_is_a_prefix_of_the_full_key() {
        let ordering = [ColumnOrdering::asc(1), ColumnOrdering::desc(0)];
        let row = Row::from([Value::Integer(3), Value::text("k")]);
        let full = EncodedKey::from_ordering(&row, &ordering);
        let prefix = EncodedKey::from_prefix(&[Value::text("k")], &ordering);
        assert!(full.starts_with(&prefix));
        assert_eq!(
            EncodedKey::from_prefix(&[Value::text("k"), Value::Integer(3)], &ordering),
            full
        );
    }

    #[test]
    fn record_ids_sort_numerically() {
        let a = EncodedKey::from_record_id(2);
        let b = EncodedKey::from_record_id(256);
        assert!(a < b);
        assert_eq!(b.to_string(), "0000000000000100");
    }

    #[test]
    fn prefix_successor_works() {
        let key = EncodedKey::from_record_id(0x01FF);
        let next = prefix_successor(&key).expect("next");
        assert_eq!(next.as_slice(), &[0, 0, 0, 0, 0, 0, 0x02]);
        assert!(!next.starts_with(&key));
    }
}
