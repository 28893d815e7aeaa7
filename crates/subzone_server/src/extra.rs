//! Extra-data slots.
//!
//! Modules hang their own per-player and per-arena state off the core
//! objects without inheritance: a process-wide registry allocates typed
//! slot keys, and each object lazily instantiates a slot's value on first
//! access. Values are dropped when the object is recycled.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// A typed handle to one registered slot.
pub struct ExtraDataKey<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Copy for ExtraDataKey<T> {}

impl<T> Clone for ExtraDataKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

type Ctor = Arc<dyn Fn() -> Arc<dyn Any + Send + Sync> + Send + Sync>;

/// Allocates slot ids and remembers how to build each slot's initial value.
/// There is one registry per object kind (players, arenas).
#[derive(Default)]
pub struct ExtraDataRegistry {
    ctors: RwLock<FxHashMap<u64, Ctor>>,
    next: AtomicU64,
}

impl ExtraDataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a slot. Existing objects pick the slot up lazily on first
    /// access; objects created later do the same.
    pub fn register<T>(
        &self,
        ctor: impl Fn() -> T + Send + Sync + 'static,
    ) -> ExtraDataKey<T>
    where
        T: Send + Sync + 'static,
    {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.ctors
            .write()
            .insert(id, Arc::new(move || Arc::new(ctor())));
        ExtraDataKey {
            id,
            _marker: PhantomData,
        }
    }

    /// Frees a slot id. Values already instantiated on objects are dropped
    /// on their next recycle.
    pub fn unregister<T>(&self, key: ExtraDataKey<T>) {
        self.ctors.write().remove(&key.id);
    }

    fn construct(&self, id: u64) -> Option<Arc<dyn Any + Send + Sync>> {
        let ctor = self.ctors.read().get(&id).map(Arc::clone)?;
        Some(ctor())
    }
}

/// The per-object slot map.
#[derive(Default)]
pub struct ExtraData {
    values: RwLock<FxHashMap<u64, Arc<dyn Any + Send + Sync>>>,
}

impl ExtraData {
    pub fn new() -> Self {
        Self::default()
    }

    /// The value in `key`'s slot, instantiating it on first access. `None`
    /// only when the slot was never registered (or was unregistered).
    pub fn get<T>(&self, registry: &ExtraDataRegistry, key: ExtraDataKey<T>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        if let Some(v) = self.values.read().get(&key.id) {
            return Arc::clone(v).downcast::<T>().ok();
        }

        let fresh = registry.construct(key.id)?;
        let mut values = self.values.write();
        // Another thread may have won the race.
        let v = values.entry(key.id).or_insert(fresh);
        Arc::clone(v).downcast::<T>().ok()
    }

    /// Drops every slot value; called when the owning object is recycled.
    pub fn clear(&self) {
        self.values.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn lazy_instantiation_and_typed_access() {
        let registry = ExtraDataRegistry::new();
        let key = registry.register(|| AtomicU32::new(7));

        let data = ExtraData::new();
        let v = data.get(&registry, key).unwrap();
        assert_eq!(v.load(Ordering::SeqCst), 7);

        v.store(9, Ordering::SeqCst);
        assert_eq!(data.get(&registry, key).unwrap().load(Ordering::SeqCst), 9);
    }

    #[test]
    fn clear_resets_slots() {
        let registry = ExtraDataRegistry::new();
        let key = registry.register(|| AtomicU32::new(0));

        let data = ExtraData::new();
        data.get(&registry, key).unwrap().store(5, Ordering::SeqCst);
        data.clear();
        assert_eq!(data.get(&registry, key).unwrap().load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unregistered_slot_returns_none() {
        let registry = ExtraDataRegistry::new();
        let key = registry.register(|| 1u32);
        registry.unregister(key);

        let data = ExtraData::new();
        assert!(data.get(&registry, key).is_none());
    }
}
