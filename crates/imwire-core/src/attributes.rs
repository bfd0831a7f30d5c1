//! Typed per-invocation attribute bag
//!
//! Carries mutable state through one pipeline invocation (accumulated flags,
//! counters, decoder hints) without widening every processor signature.
//! Keys are declared once as typed constants:
//!
//! ```
//! use imwire_core::{AttributeContext, AttributeKey};
//!
//! const RETRIES: AttributeKey<u32> = AttributeKey::new("retries");
//!
//! let mut attributes = AttributeContext::new();
//! *attributes.get_or_insert_with(&RETRIES, || 0) += 1;
//! assert_eq!(attributes.get(&RETRIES), Some(&1));
//! ```

use core::any::{type_name, Any, TypeId};
use core::fmt;
use core::marker::PhantomData;
use hashbrown::HashMap;

// ----------------------------------------------------------------------------
// Attribute Key
// ----------------------------------------------------------------------------

/// Typed key into an [`AttributeContext`]
pub struct AttributeKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttributeKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for AttributeKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AttributeKey<T> {}

impl<T> fmt::Debug for AttributeKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttributeKey<{}>({})", type_name::<T>(), self.name)
    }
}

// ----------------------------------------------------------------------------
// Slot
// ----------------------------------------------------------------------------

struct Slot {
    type_id: TypeId,
    type_name: &'static str,
    value: Box<dyn Any + Send>,
}

impl Slot {
    fn new<T: Any + Send>(value: T) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            value: Box::new(value),
        }
    }

    fn check<T: Any>(&self, key: &'static str) {
        if self.type_id != TypeId::of::<T>() {
            panic!(
                "attribute `{}` holds {} but was accessed as {}",
                key,
                self.type_name,
                type_name::<T>()
            );
        }
    }

    fn downcast_ref<T: Any>(&self, key: &'static str) -> &T {
        self.check::<T>(key);
        match self.value.downcast_ref::<T>() {
            Some(value) => value,
            None => unreachable!("type id checked"),
        }
    }

    fn downcast_mut<T: Any>(&mut self, key: &'static str) -> &mut T {
        self.check::<T>(key);
        match self.value.downcast_mut::<T>() {
            Some(value) => value,
            None => unreachable!("type id checked"),
        }
    }
}

// ----------------------------------------------------------------------------
// Attribute Context
// ----------------------------------------------------------------------------

/// Heterogeneous map from typed keys to values
///
/// Lives for one pipeline invocation. Accessors panic when a key name is
/// reused with a different value type; that is a programming error in the
/// key declarations, not a runtime condition.
#[derive(Default)]
pub struct AttributeContext {
    values: HashMap<&'static str, Slot>,
}

impl AttributeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous one
    pub fn insert<T: Any + Send>(&mut self, key: &AttributeKey<T>, value: T) -> Option<T> {
        let previous = self.values.insert(key.name, Slot::new(value))?;
        previous.check::<T>(key.name);
        previous.value.downcast::<T>().ok().map(|boxed| *boxed)
    }

    pub fn get<T: Any + Send>(&self, key: &AttributeKey<T>) -> Option<&T> {
        self.values
            .get(key.name)
            .map(|slot| slot.downcast_ref::<T>(key.name))
    }

    pub fn get_mut<T: Any + Send>(&mut self, key: &AttributeKey<T>) -> Option<&mut T> {
        self.values
            .get_mut(key.name)
            .map(|slot| slot.downcast_mut::<T>(key.name))
    }

    /// Get the value, inserting `init()` the first time the key is read
    pub fn get_or_insert_with<T, F>(&mut self, key: &AttributeKey<T>, init: F) -> &mut T
    where
        T: Any + Send,
        F: FnOnce() -> T,
    {
        self.values
            .entry(key.name)
            .or_insert_with(|| Slot::new(init()))
            .downcast_mut::<T>(key.name)
    }

    pub fn remove<T: Any + Send>(&mut self, key: &AttributeKey<T>) -> Option<T> {
        let slot = self.values.remove(key.name)?;
        slot.check::<T>(key.name);
        slot.value.downcast::<T>().ok().map(|boxed| *boxed)
    }

    pub fn contains<T>(&self, key: &AttributeKey<T>) -> bool {
        self.values.contains_key(key.name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for AttributeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, slot) in &self.values {
            map.entry(name, &slot.type_name);
        }
        map.finish()
    }
}
