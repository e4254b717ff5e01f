//! Persistent, structurally shared value tree
//!
//! [`Value`] is immutable. Containers hold their children behind an `Arc`,
//! so cloning a value is O(1) and "editing" one copies only the nodes on the
//! path from the root to the change. Every untouched subtree stays shared
//! between the old and new versions.
//!
//! Two values whose container nodes are the same allocation are equal
//! without looking inside; [`Value::ptr_eq`] exposes that shortcut for
//! change detection.

use std::collections::BTreeMap;
use std::sync::Arc;

/// Wire and arena tag of a value variant
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    Null = 0x00,
    Int32 = 0x01,
    Float32 = 0x02,
    Float64 = 0x03,
    Bool = 0x04,
    String = 0x05,
    Map = 0x06,
    Vector = 0x07,
    Array = 0x08,
    Table = 0x09,
    Int64 = 0x0A,
    Int8 = 0x0B,
    Int16 = 0x0C,
    UInt8 = 0x0D,
    UInt16 = 0x0E,
    UInt32 = 0x0F,
    Vec2 = 0x10,
    Vec3 = 0x11,
    Vec4 = 0x12,
    Mat3 = 0x13,
    Mat4x3 = 0x14,
    Mat4 = 0x15,
    UInt64 = 0x16,
}

impl Tag {
    /// Decode a tag byte
    pub fn from_u8(byte: u8) -> Option<Tag> {
        use Tag::*;
        Some(match byte {
            0x00 => Null,
            0x01 => Int32,
            0x02 => Float32,
            0x03 => Float64,
            0x04 => Bool,
            0x05 => String,
            0x06 => Map,
            0x07 => Vector,
            0x08 => Array,
            0x09 => Table,
            0x0A => Int64,
            0x0B => Int8,
            0x0C => Int16,
            0x0D => UInt8,
            0x0E => UInt16,
            0x0F => UInt32,
            0x10 => Vec2,
            0x11 => Vec3,
            0x12 => Vec4,
            0x13 => Mat3,
            0x14 => Mat4x3,
            0x15 => Mat4,
            0x16 => UInt64,
            _ => return None,
        })
    }

    /// Number of `f32` components for the math tags, `None` otherwise
    pub fn float_count(self) -> Option<usize> {
        match self {
            Tag::Vec2 => Some(2),
            Tag::Vec3 => Some(3),
            Tag::Vec4 => Some(4),
            Tag::Mat3 => Some(9),
            Tag::Mat4x3 => Some(12),
            Tag::Mat4 => Some(16),
            _ => None,
        }
    }

    /// Whether the tag holds child values
    pub fn is_container(self) -> bool {
        matches!(self, Tag::Map | Tag::Vector | Tag::Array | Tag::Table)
    }
}

/// Ordered sequence node
pub type Seq = Arc<Vec<Value>>;

/// String-keyed node; keys are kept sorted
pub type Dict = Arc<BTreeMap<String, Value>>;

/// An immutable tree-shaped value
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    String(Arc<str>),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    /// Column-major 3x3
    Mat3([f32; 9]),
    /// Column-major 4x3 (four columns of three)
    Mat4x3([f32; 12]),
    /// Column-major 4x4
    Mat4([f32; 16]),
    /// String-keyed map
    Map(Dict),
    /// Growable ordered sequence
    Vector(Seq),
    /// Small fixed sequence
    Array(Seq),
    /// Entries keyed by their id
    Table(Dict),
}

impl Value {
    /// Wire tag of this value
    pub fn tag(&self) -> Tag {
        match self {
            Value::Null => Tag::Null,
            Value::Bool(_) => Tag::Bool,
            Value::Int8(_) => Tag::Int8,
            Value::Int16(_) => Tag::Int16,
            Value::Int32(_) => Tag::Int32,
            Value::Int64(_) => Tag::Int64,
            Value::UInt8(_) => Tag::UInt8,
            Value::UInt16(_) => Tag::UInt16,
            Value::UInt32(_) => Tag::UInt32,
            Value::UInt64(_) => Tag::UInt64,
            Value::Float32(_) => Tag::Float32,
            Value::Float64(_) => Tag::Float64,
            Value::String(_) => Tag::String,
            Value::Vec2(_) => Tag::Vec2,
            Value::Vec3(_) => Tag::Vec3,
            Value::Vec4(_) => Tag::Vec4,
            Value::Mat3(_) => Tag::Mat3,
            Value::Mat4x3(_) => Tag::Mat4x3,
            Value::Mat4(_) => Tag::Mat4,
            Value::Map(_) => Tag::Map,
            Value::Vector(_) => Tag::Vector,
            Value::Array(_) => Tag::Array,
            Value::Table(_) => Tag::Table,
        }
    }

    /// Empty map
    pub fn map() -> Value {
        Value::Map(Arc::default())
    }

    /// Empty vector
    pub fn vector() -> Value {
        Value::Vector(Arc::default())
    }

    /// Empty table
    pub fn table() -> Value {
        Value::Table(Arc::default())
    }

    /// Array from items
    pub fn array<I: IntoIterator<Item = Value>>(items: I) -> Value {
        Value::Array(Arc::new(items.into_iter().collect()))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Any integer variant that fits an `i64`
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int8(v) => Some(v.into()),
            Value::Int16(v) => Some(v.into()),
            Value::Int32(v) => Some(v.into()),
            Value::Int64(v) => Some(v),
            Value::UInt8(v) => Some(v.into()),
            Value::UInt16(v) => Some(v.into()),
            Value::UInt32(v) => Some(v.into()),
            Value::UInt64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Any numeric variant widened to `f64`
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float32(v) => Some(v.into()),
            Value::Float64(v) => Some(v),
            Value::UInt64(v) => Some(v as f64),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Components of a math value
    pub fn as_floats(&self) -> Option<&[f32]> {
        match self {
            Value::Vec2(v) => Some(v),
            Value::Vec3(v) => Some(v),
            Value::Vec4(v) => Some(v),
            Value::Mat3(v) => Some(v),
            Value::Mat4x3(v) => Some(v),
            Value::Mat4(v) => Some(v),
            _ => None,
        }
    }

    /// Children of a vector or array
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Vector(s) | Value::Array(s) => Some(s),
            _ => None,
        }
    }

    /// Entries of a map or table
    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(d) | Value::Table(d) => Some(d),
            _ => None,
        }
    }

    /// Number of children, 0 for scalars
    pub fn len(&self) -> usize {
        match self {
            Value::Vector(s) | Value::Array(s) => s.len(),
            Value::Map(d) | Value::Table(d) => d.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Child by key of a map or table
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }

    /// Child by position of a vector or array
    pub fn at(&self, index: usize) -> Option<&Value> {
        self.as_seq().and_then(|s| s.get(index))
    }

    /// New value with `key` set; only valid on maps and tables.
    ///
    /// Returns `None` if `self` is not keyed.
    pub fn with(&self, key: impl Into<String>, child: Value) -> Option<Value> {
        let mut out = self.clone();
        match &mut out {
            Value::Map(d) | Value::Table(d) => {
                Arc::make_mut(d).insert(key.into(), child);
            }
            _ => return None,
        }
        Some(out)
    }

    /// New value without `key`
    pub fn without(&self, key: &str) -> Option<Value> {
        let mut out = self.clone();
        match &mut out {
            Value::Map(d) | Value::Table(d) => {
                if d.contains_key(key) {
                    Arc::make_mut(d).remove(key);
                }
            }
            _ => return None,
        }
        Some(out)
    }

    /// New sequence with `child` appended
    pub fn pushed(&self, child: Value) -> Option<Value> {
        let mut out = self.clone();
        match &mut out {
            Value::Vector(s) | Value::Array(s) => Arc::make_mut(s).push(child),
            _ => return None,
        }
        Some(out)
    }

    /// New sequence with position `index` replaced
    pub fn set_at(&self, index: usize, child: Value) -> Option<Value> {
        let mut out = self.clone();
        match &mut out {
            Value::Vector(s) | Value::Array(s) if index < s.len() => {
                Arc::make_mut(s)[index] = child;
            }
            _ => return None,
        }
        Some(out)
    }

    /// New value with the node at `path` replaced by `f(old)`.
    ///
    /// Path segments index maps/tables by key and vectors/arrays by their
    /// decimal position. Only the nodes along the path are copied.
    pub fn update_in<F>(&self, path: &[&str], f: F) -> Option<Value>
    where
        F: FnOnce(&Value) -> Value,
    {
        let Some((head, rest)) = path.split_first() else {
            return Some(f(self));
        };
        match self {
            Value::Map(_) | Value::Table(_) => {
                let child = self.get(head)?;
                let updated = child.update_in(rest, f)?;
                self.with(*head, updated)
            }
            Value::Vector(_) | Value::Array(_) => {
                let index: usize = head.parse().ok()?;
                let updated = self.at(index)?.update_in(rest, f)?;
                self.set_at(index, updated)
            }
            _ => None,
        }
    }

    /// True if both values are the same container allocation.
    ///
    /// Identity implies equality; the converse does not hold.
    pub fn ptr_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Map(a), Value::Map(b)) | (Value::Table(a), Value::Table(b)) => {
                Arc::ptr_eq(a, b)
            }
            (Value::Vector(a), Value::Vector(b)) | (Value::Array(a), Value::Array(b)) => {
                Arc::ptr_eq(a, b)
            }
            (Value::String(a), Value::String(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Address of the shared node, if this variant has one
    pub(crate) fn node_id(&self) -> Option<usize> {
        match self {
            Value::Map(d) | Value::Table(d) => Some(Arc::as_ptr(d) as *const u8 as usize),
            Value::Vector(s) | Value::Array(s) => Some(Arc::as_ptr(s) as *const u8 as usize),
            Value::String(s) => Some(Arc::as_ptr(s) as *const u8 as usize),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int8(a), Value::Int8(b)) => a == b,
            (Value::Int16(a), Value::Int16(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::UInt8(a), Value::UInt8(b)) => a == b,
            (Value::UInt16(a), Value::UInt16(b)) => a == b,
            (Value::UInt32(a), Value::UInt32(b)) => a == b,
            (Value::UInt64(a), Value::UInt64(b)) => a == b,
            (Value::Float32(a), Value::Float32(b)) => a == b,
            (Value::Float64(a), Value::Float64(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Vec2(a), Value::Vec2(b)) => a == b,
            (Value::Vec3(a), Value::Vec3(b)) => a == b,
            (Value::Vec4(a), Value::Vec4(b)) => a == b,
            (Value::Mat3(a), Value::Mat3(b)) => a == b,
            (Value::Mat4x3(a), Value::Mat4x3(b)) => a == b,
            (Value::Mat4(a), Value::Mat4(b)) => a == b,
            (Value::Map(a), Value::Map(b)) | (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Vector(a), Value::Vector(b)) | (Value::Array(a), Value::Array(b)) => a == b,
            _ => false,
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Value {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
    [f32; 2] => Vec2,
    [f32; 3] => Vec3,
    [f32; 4] => Vec4,
    [f32; 9] => Mat3,
    [f32; 12] => Mat4x3,
    [f32; 16] => Mat4,
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::String(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::String(Arc::from(s))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Value {
        Value::Vector(Arc::new(items))
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(entries: BTreeMap<String, Value>) -> Value {
        Value::Map(Arc::new(entries))
    }
}

impl FromIterator<Value> for Value {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Value {
        Value::Vector(Arc::new(iter.into_iter().collect()))
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Value {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Value {
        Value::Map(Arc::new(
            iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene() -> Value {
        let node = Value::map()
            .with("name", "cube".into())
            .unwrap()
            .with("transform", Value::Mat4([1.0; 16]))
            .unwrap();
        let nodes = Value::table().with("n1", node).unwrap();
        Value::map()
            .with("nodes", nodes)
            .unwrap()
            .with("frame", Value::UInt64(7))
            .unwrap()
    }

    #[test]
    fn test_tag_roundtrip_bytes() {
        for byte in 0x00..=0x16u8 {
            let tag = Tag::from_u8(byte).unwrap();
            assert_eq!(tag as u8, byte);
        }
        assert_eq!(Tag::from_u8(0x17), None);
    }

    #[test]
    fn test_edit_shares_untouched_subtrees() {
        let v1 = scene();
        let v2 = v1.with("frame", Value::UInt64(8)).unwrap();

        assert_ne!(v1, v2);
        // The nodes table was not on the edited path
        assert!(v1.get("nodes").unwrap().ptr_eq(v2.get("nodes").unwrap()));
        assert_eq!(v1.get("frame"), Some(&Value::UInt64(7)));
    }

    #[test]
    fn test_update_in_copies_only_path() {
        let v1 = scene();
        let v2 = v1
            .update_in(&["nodes", "n1", "name"], |_| "sphere".into())
            .unwrap();
        assert_eq!(
            v2.get("nodes")
                .and_then(|n| n.get("n1"))
                .and_then(|n| n.get("name"))
                .and_then(Value::as_str),
            Some("sphere")
        );
        assert_eq!(
            v1.get("nodes")
                .and_then(|n| n.get("n1"))
                .and_then(|n| n.get("name"))
                .and_then(Value::as_str),
            Some("cube")
        );
        assert!(!v1.get("nodes").unwrap().ptr_eq(v2.get("nodes").unwrap()));
        assert!(v1.update_in(&["missing", "x"], |v| v.clone()).is_none());
    }

    #[test]
    fn test_sequences() {
        let v: Value = (0..3).map(Value::Int32).collect();
        let v2 = v.pushed(Value::Null).unwrap().set_at(0, true.into()).unwrap();
        assert_eq!(v.len(), 3);
        assert_eq!(v2.len(), 4);
        assert_eq!(v2.at(0), Some(&Value::Bool(true)));
        assert_eq!(v2.update_in(&["1"], |_| Value::Null).unwrap().at(1), Some(&Value::Null));
        assert!(Value::Int32(1).pushed(Value::Null).is_none());
    }

    #[test]
    fn test_equal_content_distinct_nodes() {
        let a: Value = vec![Value::from("x")].into();
        let b: Value = vec![Value::from("x")].into();
        assert!(!a.ptr_eq(&b));
        assert_eq!(a, b);
        // Same payload under a different tag is a different value
        assert_ne!(Value::Vector(Arc::new(vec![])), Value::Array(Arc::new(vec![])));
        assert_ne!(Value::Int32(1), Value::Int64(1));
    }

    #[test]
    fn test_numeric_accessors() {
        assert_eq!(Value::UInt16(9).as_i64(), Some(9));
        assert_eq!(Value::UInt64(u64::MAX).as_i64(), None);
        assert_eq!(Value::Float32(0.5).as_f64(), Some(0.5));
        assert_eq!(Value::Vec3([1.0, 2.0, 3.0]).as_floats().map(<[f32]>::len), Some(3));
        assert_eq!(Tag::Mat4x3.float_count(), Some(12));
    }
}
