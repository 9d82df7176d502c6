use core::any::TypeId;
use std::sync::Arc;

use gv_utils::TypeIdMap;
use gv_utils::hash::{HashMap, HashSet};
use tracing::debug;

use crate::error::{SerialError, SerialResult};
use crate::registry::entry::{ArrayKind, CodecEntry, FamilySeed, Registration};

// -----------------------------------------------------------------------------
// TypeLoader

/// The host's type loader: given a fully-qualified name from the
/// known-type table, produces the registration for it.
///
/// This is how the resolver reaches types the registry has not seen:
/// the known-type table maps a stable key to a qualified name, and the
/// loader turns that name into codecs.
pub type TypeLoader = Arc<dyn Fn(&str) -> Option<Registration> + Send + Sync>;

// -----------------------------------------------------------------------------
// ResolvedType

/// What a type key resolves to.
#[derive(Debug, Clone)]
pub enum ResolvedType {
    /// A registered concrete type.
    Concrete { type_id: TypeId, key: Arc<str> },
    /// A marker-registered abstract key: resolvable, but it cannot
    /// decode a value by itself.
    Abstract { key: Arc<str> },
    /// An array of the counted rank over a resolved element.
    Array { elem: Box<ResolvedType>, rank: usize },
}

impl ResolvedType {
    /// The concrete [`TypeId`], when there is one.
    pub fn type_id(&self) -> Option<TypeId> {
        match self {
            ResolvedType::Concrete { type_id, .. } => Some(*type_id),
            _ => None,
        }
    }

    /// The canonical key string of the resolved type.
    pub fn key(&self) -> String {
        match self {
            ResolvedType::Concrete { key, .. } | ResolvedType::Abstract { key } => key.to_string(),
            ResolvedType::Array { elem, rank } => {
                let mut s = elem.key();
                s.push('[');
                for _ in 1..*rank {
                    s.push(',');
                }
                s.push(']');
                s
            }
        }
    }

    /// The rank of the outermost array, if this is one.
    pub fn rank(&self) -> Option<usize> {
        match self {
            ResolvedType::Array { rank, .. } => Some(*rank),
            _ => None,
        }
    }
}

// -----------------------------------------------------------------------------
// CodecRegistry

/// How a typed array container maps back to its element type.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ArrayShape {
    pub(crate) elem: TypeId,
    pub(crate) kind: ArrayKind,
}

/// The codec tables: every lookup an operation performs starts here.
///
/// The registry is grow-only. It is written at startup registration and
/// on lazy specialization; the engine serializes writers behind its lock
/// and the hot path is read-only.
pub(crate) struct CodecRegistry {
    entries: TypeIdMap<CodecEntry>,
    key_to_type: HashMap<Arc<str>, TypeId>,
    markers: HashSet<Arc<str>>,
    known_types: HashMap<Arc<str>, Arc<str>>,
    loader: Option<TypeLoader>,
    /// Closed generic keys that can be materialized on demand.
    pending: HashMap<Arc<str>, FamilySeed>,
    pending_by_type: TypeIdMap<Arc<str>>,
    array_shapes: TypeIdMap<ArrayShape>,
}

impl CodecRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: TypeIdMap::new(),
            key_to_type: HashMap::default(),
            markers: HashSet::default(),
            known_types: HashMap::default(),
            loader: None,
            pending: HashMap::default(),
            pending_by_type: TypeIdMap::new(),
            array_shapes: TypeIdMap::new(),
        }
    }

    pub(crate) fn set_loader(&mut self, loader: TypeLoader) {
        self.loader = Some(loader);
    }

    pub(crate) fn loader(&self) -> Option<TypeLoader> {
        self.loader.clone()
    }

    pub(crate) fn add_known_type(&mut self, key: &str, qualified_name: &str) {
        self.known_types
            .insert(Arc::from(key), Arc::from(qualified_name));
    }

    pub(crate) fn known_type(&self, key: &str) -> Option<Arc<str>> {
        self.known_types.get(key).cloned()
    }

    /// Applies one registration: validates it, stores the entry, and
    /// plants its markers, seeds, and array shapes.
    ///
    /// An existing entry for the same type wins unless the registration
    /// asks to overwrite.
    pub(crate) fn apply(&mut self, reg: Registration) -> SerialResult<()> {
        let Registration {
            entry,
            marker_keys,
            overwrite,
            seeds,
            array_kinds,
        } = reg;

        if entry.serializer.is_some() != entry.deserializer.is_some() {
            return Err(SerialError::RegistrationInconsistency {
                type_key: entry.type_key.to_string(),
            });
        }

        for key in marker_keys {
            self.markers.insert(key);
        }

        let type_id = entry.type_id;
        if self.entries.contains(type_id) && !overwrite {
            debug!(type_key = %entry.type_key, "registration ignored, type already registered");
            return Ok(());
        }

        debug!(type_key = %entry.type_key, type_name = entry.type_name, "type registered");
        self.key_to_type.insert(entry.type_key.clone(), type_id);
        self.entries.insert(type_id, entry);

        for seed in seeds {
            if self.key_to_type.contains_key(&seed.closed_key) {
                continue;
            }
            self.pending_by_type
                .try_insert(seed.concrete_type, || seed.closed_key.clone());
            self.pending.entry(seed.closed_key.clone()).or_insert(seed);
        }

        for (container, elem, kind) in array_kinds {
            self.array_shapes
                .try_insert(container, || ArrayShape { elem, kind });
        }
        Ok(())
    }

    pub(crate) fn get(&self, type_id: TypeId) -> Option<&CodecEntry> {
        self.entries.get(type_id)
    }

    pub(crate) fn get_by_key(&self, key: &str) -> Option<&CodecEntry> {
        self.key_to_type
            .get(key)
            .and_then(|tid| self.entries.get(*tid))
    }

    pub(crate) fn is_marker(&self, key: &str) -> bool {
        self.markers.contains(key)
    }

    pub(crate) fn array_shape(&self, type_id: TypeId) -> Option<ArrayShape> {
        self.array_shapes.get(type_id).copied()
    }

    pub(crate) fn has_pending_for_type(&self, type_id: TypeId) -> bool {
        self.pending_by_type.contains(type_id)
    }

    pub(crate) fn has_pending_key(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    /// Materializes the pending specialization for a concrete type.
    ///
    /// Callers hold the write lock and have re-checked for a concrete
    /// entry, so a race between two operations collapses to one insert.
    pub(crate) fn materialize_for_type(
        &mut self,
        type_id: TypeId,
    ) -> SerialResult<Option<CodecEntry>> {
        let Some(closed_key) = self.pending_by_type.get(type_id).cloned() else {
            return Ok(None);
        };
        self.materialize_key(&closed_key)
    }

    /// Materializes the pending specialization for a closed generic key.
    pub(crate) fn materialize_key(&mut self, key: &str) -> SerialResult<Option<CodecEntry>> {
        let Some(seed) = self.pending.remove(key) else {
            return Ok(None);
        };
        debug!(closed_key = %seed.closed_key, "specializing generic codec");
        let concrete = seed.concrete_type;
        self.apply((seed.make)())?;
        Ok(self.entries.get(concrete).cloned())
    }
}
