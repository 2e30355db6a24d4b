//!
//! Runtime Value Representation
//!
//! Host values are a closed tagged enum. Atoms (ints, reals, chars, bools)
//! are stored inline; everything else lives behind an `Arc`, which plays the
//! role of the host reference count:
//! - cloning a value increments the count
//! - dropping a value decrements it
//!
//! `BoxedInt` is an integer with identity. Two boxed integers holding the same
//! number are still distinct objects, and the number of live references to
//! one of them is observable through `refcount()`. Native-resource handles are
//! handed out as boxed integers so the owner of the resource can tell when the
//! host has let go of them.
//!

use std::fmt;
use std::sync::Arc;

use crate::array::NialArray;
use crate::fault::Fault;

/// A reference-counted integer object
#[derive(Clone)]
pub struct BoxedInt(Arc<i64>);

impl BoxedInt {
    pub fn new(value: i64) -> Self {
        Self(Arc::new(value))
    }

    pub fn value(&self) -> i64 {
        *self.0
    }

    /// Number of live references to this object, including `self`
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// True if both refer to the same object, not merely the same number
    pub fn same_object(&self, other: &BoxedInt) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for BoxedInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BoxedInt({})", self.value())
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Int(i64),
    Real(f64),
    Char(u8),
    Bool(bool),
    Boxed(BoxedInt),
    Text(Arc<str>),
    Ints(Arc<NialArray<i64>>),
    Reals(Arc<NialArray<f64>>),
    List(Arc<[Value]>),
    Fault(Fault),
}

impl Value {
    pub fn text(s: &str) -> Value {
        Value::Text(Arc::from(s))
    }

    pub fn ints(values: Vec<i64>) -> Value {
        Value::Ints(Arc::new(NialArray::from_vec(values)))
    }

    pub fn reals(values: Vec<f64>) -> Value {
        Value::Reals(Arc::new(NialArray::from_vec(values)))
    }

    pub fn list(values: Vec<Value>) -> Value {
        Value::List(Arc::from(values))
    }

    pub fn pair(first: Value, second: Value) -> Value {
        Value::list(vec![first, second])
    }

    pub fn fault(reason: &str) -> Value {
        Value::Fault(Fault::new(reason))
    }

    /// Integer view: plain ints and boxed ints both read as integers
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Boxed(b) => Some(b.value()),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_boxed(&self) -> Option<&BoxedInt> {
        match self {
            Value::Boxed(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_fault(&self) -> Option<&Fault> {
        match self {
            Value::Fault(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, Value::Fault(_))
    }

    /// Number of items: sequence length, 1 for atoms, 0 for null
    pub fn tally(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Text(s) => s.len(),
            Value::Ints(a) => a.len(),
            Value::Reals(a) => a.len(),
            Value::List(items) => items.len(),
            _ => 1,
        }
    }

    /// Split a sequence into its items; `None` for atoms.
    ///
    /// Numeric arrays yield `Int`/`Real` atoms, text yields `Char` atoms,
    /// lists yield clones of their elements.
    pub fn items(&self) -> Option<Vec<Value>> {
        match self {
            Value::Null => Some(Vec::new()),
            Value::Text(s) => Some(s.bytes().map(Value::Char).collect()),
            Value::Ints(a) => Some(a.to_vec().into_iter().map(Value::Int).collect()),
            Value::Reals(a) => Some(a.to_vec().into_iter().map(Value::Real).collect()),
            Value::List(items) => Some(items.to_vec()),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Real(_) => "real",
            Value::Char(_) => "char",
            Value::Bool(_) => "bool",
            Value::Boxed(_) => "boxed int",
            Value::Text(_) => "text",
            Value::Ints(_) => "int array",
            Value::Reals(_) => "real array",
            Value::List(_) => "list",
            Value::Fault(_) => "fault",
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(r: f64) -> Self {
        Value::Real(r)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::text(s)
    }
}

impl From<BoxedInt> for Value {
    fn from(b: BoxedInt) -> Self {
        Value::Boxed(b)
    }
}

impl From<Fault> for Value {
    fn from(f: Fault) -> Self {
        Value::Fault(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boxed_int_identity() {
        let a = BoxedInt::new(30);
        let b = BoxedInt::new(30);
        let a2 = a.clone();
        assert!(a.same_object(&a2));
        assert!(!a.same_object(&b));
        assert_eq!(a.value(), b.value());
    }

    #[test]
    fn test_boxed_int_refcount_follows_values() {
        let h = BoxedInt::new(24);
        assert_eq!(h.refcount(), 1);
        let v = Value::list(vec![Value::Boxed(h.clone()), Value::Int(1)]);
        assert_eq!(h.refcount(), 2);
        let v2 = v.clone();
        assert_eq!(h.refcount(), 2);
        drop(v);
        drop(v2);
        assert_eq!(h.refcount(), 1);
    }

    #[test]
    fn test_items() {
        let ints = Value::ints(vec![1, 2]);
        let items = ints.items().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].as_int(), Some(2));

        let text = Value::text("ab");
        let chars = text.items().unwrap();
        assert!(matches!(chars[0], Value::Char(b'a')));

        assert!(Value::Int(3).items().is_none());
        assert_eq!(Value::Null.tally(), 0);
        assert_eq!(Value::Real(1.0).tally(), 1);
    }

    #[test]
    fn test_as_int_reads_boxed() {
        let v = Value::Boxed(BoxedInt::new(42));
        assert_eq!(v.as_int(), Some(42));
        assert_eq!(Value::Real(1.0).as_int(), None);
    }
}
