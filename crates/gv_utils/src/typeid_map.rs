use core::any::TypeId;

use crate::hash::NoOpHashState;
use crate::hash::hashbrown::HashMap;
use crate::hash::hashbrown::hash_map::Entry;

// -----------------------------------------------------------------------------
// TypeIdMap

/// A map keyed by the runtime type of a value.
///
/// This is the backbone of the serialization core's lookup state: codec
/// entries, pending generic specializations, array shapes, and the
/// per-type memo tables of the pluggable serializer tiers are all keyed
/// this way. `TypeId` is already a well-mixed hash, so entries go
/// through a no-op hasher, and keys are passed by value — `TypeId` is
/// `Copy`.
///
/// Only the operations those tables need exist; this is not a
/// general-purpose map.
pub struct TypeIdMap<V>(HashMap<TypeId, V, NoOpHashState>);

impl<V> TypeIdMap<V> {
    /// Creates an empty map.
    #[inline]
    pub const fn new() -> Self {
        Self(HashMap::with_hasher(NoOpHashState))
    }

    /// Inserts only if the type has no entry yet, building the value on
    /// demand.
    ///
    /// Returns whether the insert happened. Registries use this for
    /// their first-writer-wins rule: a specialization or array shape
    /// planted twice keeps its first entry, so racing registrations
    /// collapse instead of replacing each other.
    #[inline]
    pub fn try_insert(&mut self, type_id: TypeId, value: impl FnOnce() -> V) -> bool {
        match self.0.entry(type_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value());
                true
            }
        }
    }

    /// Returns the entry for the type, filling it from `value` first if
    /// absent. The memo tables resolve their compute-once answers
    /// through this.
    #[inline]
    pub fn get_or_insert(&mut self, type_id: TypeId, value: impl FnOnce() -> V) -> &mut V {
        self.0.entry(type_id).or_insert_with(value)
    }

    /// Returns the entry for the type, if any.
    #[inline]
    pub fn get(&self, type_id: TypeId) -> Option<&V> {
        self.0.get(&type_id)
    }

    /// Inserts an entry, returning the displaced one if the type was
    /// already present.
    #[inline]
    pub fn insert(&mut self, type_id: TypeId, value: V) -> Option<V> {
        self.0.insert(type_id, value)
    }

    /// [`insert`](Self::insert) keyed by a statically-known type.
    #[inline]
    pub fn insert_type<T: ?Sized + 'static>(&mut self, value: V) -> Option<V> {
        self.insert(TypeId::of::<T>(), value)
    }

    /// Whether the type has an entry.
    #[inline]
    pub fn contains(&self, type_id: TypeId) -> bool {
        self.0.contains_key(&type_id)
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use core::any::TypeId;

    use super::TypeIdMap;

    #[test]
    fn first_writer_wins() {
        let mut map = TypeIdMap::new();
        assert!(map.try_insert(TypeId::of::<u8>(), || "first"));
        assert!(!map.try_insert(TypeId::of::<u8>(), || "second"));
        assert_eq!(map.get(TypeId::of::<u8>()), Some(&"first"));

        assert_eq!(*map.get_or_insert(TypeId::of::<u16>(), || "filled"), "filled");
        assert_eq!(*map.get_or_insert(TypeId::of::<u16>(), || "ignored"), "filled");
    }

    #[test]
    fn insert_replaces_and_reports() {
        let mut map = TypeIdMap::new();
        assert_eq!(map.insert_type::<str>(1), None);
        assert_eq!(map.insert_type::<str>(2), Some(1));
        assert!(map.contains(TypeId::of::<str>()));
        assert!(!map.contains(TypeId::of::<bool>()));
    }
}
