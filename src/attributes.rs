//! Type-safe attribute map attached to every session.
//!
//! Keys are typed at construction ([`AttributeKey::new`] fixes `T`), so a
//! `set`/`get` pair with a mismatched value type is rejected rather than
//! silently corrupting state. Per open question (c) in the design notes,
//! attributes are internally synchronized and may be read or written from
//! any thread, including concurrently from a receive callback and a writer
//! thread.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::RwLock;

/// A named, typed key into a session's attribute map.
///
/// Two keys with the same name but different `T` are distinct entries.
pub struct AttributeKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttributeKey<T> {
    /// Creates a new attribute key named `name`.
    pub const fn new(name: &'static str) -> Self {
        AttributeKey {
            name,
            _marker: PhantomData,
        }
    }

    /// The key's name, used as the map's storage key.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> fmt::Debug for AttributeKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AttributeKey").field(&self.name).finish()
    }
}

impl<T> Clone for AttributeKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for AttributeKey<T> {}

/// A type-erased, thread-safe map of session attributes.
///
/// Stored under `(name, TypeId)` rather than `name` alone, so two keys that
/// happen to share a name but differ in `T` occupy distinct entries instead
/// of silently aliasing one another.
#[derive(Default)]
pub struct Attributes {
    values: RwLock<HashMap<(&'static str, TypeId), Box<dyn Any + Send + Sync>>>,
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.values.read().unwrap().len();
        f.debug_struct("Attributes").field("len", &len).finish()
    }
}

impl Attributes {
    /// Creates an empty attribute map.
    pub fn new() -> Self {
        Attributes::default()
    }

    /// Stores `value` under `key`, overwriting any previous value for the
    /// same key name.
    pub fn set<T: Any + Send + Sync>(&self, key: &AttributeKey<T>, value: T) {
        self.values
            .write()
            .unwrap()
            .insert((key.name(), TypeId::of::<T>()), Box::new(value));
    }

    /// Returns a clone of the value stored under `key`, or `None` if unset or
    /// the stored value does not match `T`.
    pub fn get<T: Any + Send + Sync + Clone>(&self, key: &AttributeKey<T>) -> Option<T> {
        self.values
            .read()
            .unwrap()
            .get(&(key.name(), TypeId::of::<T>()))
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Removes and returns the value stored under `key`, if present and of
    /// the expected type.
    pub fn remove<T: Any + Send + Sync>(&self, key: &AttributeKey<T>) -> Option<T> {
        self.values
            .write()
            .unwrap()
            .remove(&(key.name(), TypeId::of::<T>()))
            .and_then(|v| v.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    /// True if a value for `key` is present.
    pub fn contains<T: Any + Send + Sync>(&self, key: &AttributeKey<T>) -> bool {
        self.values
            .read()
            .unwrap()
            .contains_key(&(key.name(), TypeId::of::<T>()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_roundtrips() {
        static KEY: AttributeKey<u32> = AttributeKey::new("count");
        let attrs = Attributes::new();
        attrs.set(&KEY, 42);
        assert_eq!(attrs.get(&KEY), Some(42));
    }

    #[test]
    fn distinct_keys_do_not_collide() {
        static A: AttributeKey<u32> = AttributeKey::new("shared");
        static B: AttributeKey<String> = AttributeKey::new("other");
        let attrs = Attributes::new();
        attrs.set(&A, 1);
        attrs.set(&B, "hi".to_string());
        assert_eq!(attrs.get(&A), Some(1));
        assert_eq!(attrs.get(&B), Some("hi".to_string()));
    }

    #[test]
    fn same_name_different_type_does_not_collide() {
        static AS_INT: AttributeKey<u32> = AttributeKey::new("dup");
        static AS_STRING: AttributeKey<String> = AttributeKey::new("dup");
        let attrs = Attributes::new();
        attrs.set(&AS_INT, 7);
        attrs.set(&AS_STRING, "seven".to_string());
        assert_eq!(attrs.get(&AS_INT), Some(7));
        assert_eq!(attrs.get(&AS_STRING), Some("seven".to_string()));
    }

    #[test]
    fn missing_key_returns_none() {
        static KEY: AttributeKey<u32> = AttributeKey::new("missing");
        let attrs = Attributes::new();
        assert_eq!(attrs.get(&KEY), None);
    }

    #[test]
    fn remove_takes_value_out() {
        static KEY: AttributeKey<u32> = AttributeKey::new("removable");
        let attrs = Attributes::new();
        attrs.set(&KEY, 3);
        assert_eq!(attrs.remove(&KEY), Some(3));
        assert_eq!(attrs.get(&KEY), None);
    }
}
