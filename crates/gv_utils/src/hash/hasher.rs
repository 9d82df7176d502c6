//! Hash states for the engine's lookup tables.
//!
//! Every hot-path lookup in the serialization core goes through one of
//! two kinds of key: strings and small integers (type keys, keyed
//! serializer ids, back-reference offsets and cell identities), or
//! [`TypeId`](core::any::TypeId)s. The first kind gets `foldhash` with a
//! fixed seed — registries and per-operation tables hold trusted keys,
//! so per-process randomization buys nothing and a fixed seed keeps
//! hashing deterministic across engine instances. The second kind is
//! already a high-quality hash and only needs passing through.

use core::hash::{BuildHasher, Hasher};

use foldhash::fast::{FixedState, FoldHasher};

// -----------------------------------------------------------------------------
// FixedHashState

/// Seed shared by every table in the engine. Arbitrary, but never
/// randomized: two engines hashing the same type key agree.
const FIXED_SEED: u64 = 0x7A31_9C8D_42E6_5B0F;

/// The deterministic `foldhash` state behind the default
/// [`HashMap`](crate::hash::HashMap) and
/// [`HashSet`](crate::hash::HashSet).
///
/// Used for the registry's key and marker indexes and for the
/// back-reference tables a serialize or deep-copy operation keeps
/// (cell identity to stream offset, identity to copy).
///
/// # Examples
///
/// ```
/// use gv_utils::hash::HashMap;
///
/// let mut key_index: HashMap<&str, u32> = HashMap::default();
/// key_index.insert("shared<node>", 7);
/// assert_eq!(key_index.get("shared<node>"), Some(&7));
/// ```
#[derive(Copy, Clone, Default, Debug)]
pub struct FixedHashState;

impl BuildHasher for FixedHashState {
    type Hasher = FoldHasher<'static>;

    #[inline(always)]
    fn build_hasher(&self) -> Self::Hasher {
        const { FixedState::with_seed(FIXED_SEED) }.build_hasher()
    }
}

// -----------------------------------------------------------------------------
// NoOpHashState

/// Pass-through hasher for keys that already are hashes.
///
/// [`TypeIdMap`](crate::TypeIdMap) keys every codec, memo, and
/// array-shape table by `TypeId`, whose bits the compiler has already
/// mixed; re-hashing them on every registry lookup is pure overhead.
/// `TypeId` feeds its value through [`Hasher::write`] as a 16-byte
/// block, so the fold below keeps both halves instead of truncating.
#[derive(Copy, Clone, Default, Debug)]
#[repr(transparent)]
pub struct NoOpHasher {
    hash: u64,
}

impl Hasher for NoOpHasher {
    #[inline(always)]
    fn finish(&self) -> u64 {
        self.hash
    }

    #[inline(always)]
    fn write_u64(&mut self, i: u64) {
        self.hash = i;
    }

    #[inline(always)]
    fn write_u128(&mut self, i: u128) {
        self.hash = (i as u64) ^ (i >> 64) as u64;
    }

    fn write(&mut self, bytes: &[u8]) {
        // The block form of the same fold, for key types that hash
        // through raw bytes.
        for chunk in bytes.chunks(8) {
            let mut word = [0_u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            self.hash = self.hash.rotate_left(1) ^ u64::from_le_bytes(word);
        }
    }
}

/// Builds [`NoOpHasher`]s.
///
/// # Examples
///
/// ```
/// use core::any::TypeId;
/// use core::hash::BuildHasher;
/// use gv_utils::hash::NoOpHashState;
///
/// // Deterministic: the same type always lands in the same slot.
/// let id = TypeId::of::<Vec<u8>>();
/// assert_eq!(NoOpHashState.hash_one(id), NoOpHashState.hash_one(id));
/// ```
#[derive(Copy, Clone, Default, Debug)]
pub struct NoOpHashState;

impl BuildHasher for NoOpHashState {
    type Hasher = NoOpHasher;

    #[inline(always)]
    fn build_hasher(&self) -> Self::Hasher {
        NoOpHasher { hash: 0 }
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use core::any::TypeId;
    use core::hash::BuildHasher;

    use super::{FixedHashState, NoOpHashState};

    #[test]
    fn fixed_state_is_deterministic() {
        let a = FixedHashState.hash_one("map<int,string>");
        let b = FixedHashState.hash_one("map<int,string>");
        assert_eq!(a, b);
        assert_ne!(a, FixedHashState.hash_one("map<int,guid>"));
    }

    #[test]
    fn noop_state_distinguishes_type_ids() {
        let ints = NoOpHashState.hash_one(TypeId::of::<i32>());
        assert_eq!(ints, NoOpHashState.hash_one(TypeId::of::<i32>()));
        assert_ne!(ints, NoOpHashState.hash_one(TypeId::of::<Vec<i32>>()));
    }
}
