//! Runtime-tagged index keys.
//!
//! Keys are self-describing on disk so an index page can be unmarshaled
//! without consulting the catalog. Integers (including timestamps)
//! normalize to `Int`, both float widths to `Float`; composite keys
//! order lexicographically over their elements and support prefix seek.

use std::{cmp::Ordering, fmt};

use crate::{
    error::DbError,
    io::{ByteReader, ByteWriter},
    storage::value::Value,
    types::DbResult,
};

const KEY_TAG_INT: u8 = 0;
const KEY_TAG_FLOAT: u8 = 1;
const KEY_TAG_BOOL: u8 = 2;
const KEY_TAG_STR: u8 = 3;
const KEY_TAG_COMPOSITE: u8 = 4;

#[derive(Debug, Clone)]
pub enum IndexKey {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Composite(Vec<IndexKey>),
}

impl IndexKey {
    /// Map a column value onto its key representation. NaN floats are
    /// rejected because they have no place in a total order.
    pub fn from_value(value: &Value) -> DbResult<IndexKey> {
        match value {
            Value::Bool(v) => Ok(IndexKey::Bool(*v)),
            Value::Int32(v) => Ok(IndexKey::Int(*v as i64)),
            Value::Int64(v) => Ok(IndexKey::Int(*v)),
            Value::Timestamp(v) => Ok(IndexKey::Int(*v)),
            Value::Float32(v) if v.is_nan() => Err(DbError::validation("NaN is not indexable")),
            Value::Float64(v) if v.is_nan() => Err(DbError::validation("NaN is not indexable")),
            Value::Float32(v) => Ok(IndexKey::Float(*v as f64)),
            Value::Float64(v) => Ok(IndexKey::Float(*v)),
            Value::Str(v) => Ok(IndexKey::Str(v.clone())),
        }
    }

    pub fn composite(parts: Vec<IndexKey>) -> IndexKey {
        IndexKey::Composite(parts)
    }

    fn rank(&self) -> u8 {
        match self {
            IndexKey::Int(_) => KEY_TAG_INT,
            IndexKey::Float(_) => KEY_TAG_FLOAT,
            IndexKey::Bool(_) => KEY_TAG_BOOL,
            IndexKey::Str(_) => KEY_TAG_STR,
            IndexKey::Composite(_) => KEY_TAG_COMPOSITE,
        }
    }

    /// True when `self` is a (possibly full) prefix of `other`. For
    /// plain keys this degenerates to equality.
    pub fn prefix_of(&self, other: &IndexKey) -> bool {
        match (self, other) {
            (IndexKey::Composite(a), IndexKey::Composite(b)) => {
                a.len() <= b.len() && a.iter().zip(b.iter()).all(|(x, y)| x == y)
            }
            (a, b) => a == b,
        }
    }

    /// Order `other` against the partial key `self`, comparing only the
    /// elements `self` actually has. Used to seek to the first key that
    /// can match a composite prefix.
    pub fn compare_prefix(&self, other: &IndexKey) -> Ordering {
        match (self, other) {
            (IndexKey::Composite(a), IndexKey::Composite(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.cmp(y) {
                        Ordering::Equal => continue,
                        non_eq => return non_eq,
                    }
                }
                if a.len() <= b.len() {
                    Ordering::Equal
                } else {
                    Ordering::Greater
                }
            }
            (a, b) => a.cmp(b),
        }
    }

    pub fn encode(&self, w: &mut ByteWriter) {
        match self {
            IndexKey::Int(v) => {
                w.write(&KEY_TAG_INT);
                w.write(v);
            }
            IndexKey::Float(v) => {
                w.write(&KEY_TAG_FLOAT);
                w.write(v);
            }
            IndexKey::Bool(v) => {
                w.write(&KEY_TAG_BOOL);
                w.write(v);
            }
            IndexKey::Str(v) => {
                w.write(&KEY_TAG_STR);
                w.write(&(v.len() as u16));
                w.write_bytes(v.as_bytes());
            }
            IndexKey::Composite(parts) => {
                w.write(&KEY_TAG_COMPOSITE);
                w.write(&(parts.len() as u8));
                for p in parts {
                    p.encode(w);
                }
            }
        }
    }

    pub fn decode(r: &mut ByteReader<'_>) -> DbResult<IndexKey> {
        let tag: u8 = r.read()?;
        match tag {
            KEY_TAG_INT => Ok(IndexKey::Int(r.read()?)),
            KEY_TAG_FLOAT => Ok(IndexKey::Float(r.read()?)),
            KEY_TAG_BOOL => Ok(IndexKey::Bool(r.read()?)),
            KEY_TAG_STR => {
                let len: u16 = r.read()?;
                let bytes = r.read_bytes(len as usize)?;
                let s = String::from_utf8(bytes.to_vec())
                    .map_err(|_| DbError::corrupt("invalid utf-8 in index key"))?;
                Ok(IndexKey::Str(s))
            }
            KEY_TAG_COMPOSITE => {
                let count: u8 = r.read()?;
                let mut parts = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    parts.push(IndexKey::decode(r)?);
                }
                Ok(IndexKey::Composite(parts))
            }
            other => Err(DbError::corrupt(format!("unknown index key tag {}", other))),
        }
    }

    pub fn encoded_size(&self) -> usize {
        match self {
            IndexKey::Int(_) | IndexKey::Float(_) => 9,
            IndexKey::Bool(_) => 2,
            IndexKey::Str(s) => 3 + s.len(),
            IndexKey::Composite(parts) => {
                2 + parts.iter().map(|p| p.encoded_size()).sum::<usize>()
            }
        }
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexKey::Int(a), IndexKey::Int(b)) => a.cmp(b),
            (IndexKey::Float(a), IndexKey::Float(b)) => a.total_cmp(b),
            (IndexKey::Bool(a), IndexKey::Bool(b)) => a.cmp(b),
            (IndexKey::Str(a), IndexKey::Str(b)) => a.as_bytes().cmp(b.as_bytes()),
            (IndexKey::Composite(a), IndexKey::Composite(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.cmp(y) {
                        Ordering::Equal => continue,
                        non_eq => return non_eq,
                    }
                }
                a.len().cmp(&b.len())
            }
            // Distinct kinds never meet inside one well-formed index;
            // order by tag to keep the comparison total anyway.
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::Int(v) => write!(f, "{}", v),
            IndexKey::Float(v) => write!(f, "{}", v),
            IndexKey::Bool(v) => write!(f, "{}", v),
            IndexKey::Str(v) => write!(f, "'{}'", v),
            IndexKey::Composite(parts) => {
                write!(f, "(")?;
                for (i, p) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(key: &IndexKey) -> IndexKey {
        let mut w = ByteWriter::new();
        key.encode(&mut w);
        let buf = w.into_bytes();
        assert_eq!(buf.len(), key.encoded_size());
        let mut r = ByteReader::new(&buf);
        let back = IndexKey::decode(&mut r).unwrap();
        assert_eq!(r.remaining(), 0);
        back
    }

    #[test]
    fn test_key_round_trip() {
        let keys = [
            IndexKey::Int(-42),
            IndexKey::Float(2.5),
            IndexKey::Bool(true),
            IndexKey::Str("hello".into()),
            IndexKey::Composite(vec![IndexKey::Int(1), IndexKey::Str("a".into())]),
        ];
        for key in &keys {
            assert_eq!(&round_trip(key), key);
        }
    }

    #[test]
    fn test_int_ordering_is_signed() {
        assert!(IndexKey::Int(-1) < IndexKey::Int(0));
        assert!(IndexKey::Int(i64::MIN) < IndexKey::Int(i64::MAX));
    }

    #[test]
    fn test_str_ordering_is_bytewise() {
        assert!(IndexKey::Str("a".into()) < IndexKey::Str("ab".into()));
        assert!(IndexKey::Str("b".into()) > IndexKey::Str("ab".into()));
    }

    #[test]
    fn test_composite_ordering() {
        let a = IndexKey::Composite(vec![IndexKey::Int(1), IndexKey::Str("b".into())]);
        let b = IndexKey::Composite(vec![IndexKey::Int(1), IndexKey::Str("c".into())]);
        let c = IndexKey::Composite(vec![IndexKey::Int(2), IndexKey::Str("a".into())]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_prefix_seek() {
        let prefix = IndexKey::Composite(vec![IndexKey::Int(1)]);
        let full = IndexKey::Composite(vec![IndexKey::Int(1), IndexKey::Str("x".into())]);
        let other = IndexKey::Composite(vec![IndexKey::Int(2), IndexKey::Str("a".into())]);
        assert!(prefix.prefix_of(&full));
        assert!(!prefix.prefix_of(&other));
        assert_eq!(prefix.compare_prefix(&full), Ordering::Equal);
        assert_eq!(prefix.compare_prefix(&other), Ordering::Less);
    }

    #[test]
    fn test_from_value_rejects_nan() {
        assert!(IndexKey::from_value(&Value::Float64(f64::NAN)).is_err());
    }
}
