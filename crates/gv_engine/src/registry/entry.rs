use core::any::TypeId;
use std::sync::Arc;

use crate::context::{CopyContext, DeserializeContext, SerializeContext};
use crate::error::SerialResult;
use crate::payload::Portable;

// -----------------------------------------------------------------------------
// Codec closures

/// Deep-copies a value of the entry's type.
pub type CopyFn =
    Arc<dyn Fn(&dyn Portable, &mut CopyContext<'_>) -> SerialResult<Box<dyn Portable>> + Send + Sync>;

/// Writes the body of a value of the entry's type. The type header has
/// already been written by the dispatcher.
pub type SerializeFn =
    Arc<dyn Fn(&dyn Portable, &mut SerializeContext<'_>) -> SerialResult<()> + Send + Sync>;

/// Reads a body back. The closure is type-specific; the expected type is
/// implicit.
pub type DeserializeFn =
    Arc<dyn Fn(&mut DeserializeContext<'_>) -> SerialResult<Box<dyn Portable>> + Send + Sync>;

// -----------------------------------------------------------------------------
// EnumKind

/// The underlying integer width of a registered enum.
///
/// Closed on purpose: an enum backed by anything other than these four
/// widths cannot be registered, so it fails loudly at construction
/// instead of being widened on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumKind {
    Byte,
    Short,
    Int,
    Long,
}

impl EnumKind {
    /// Whether `value` fits the width.
    pub(crate) fn fits(self, value: i64) -> bool {
        match self {
            EnumKind::Byte => u8::try_from(value).is_ok(),
            EnumKind::Short => i16::try_from(value).is_ok(),
            EnumKind::Int => i32::try_from(value).is_ok(),
            EnumKind::Long => true,
        }
    }
}

// -----------------------------------------------------------------------------
// Monomorphized vtables

/// Option support, monomorphized for one payload type when its
/// registration is specialized.
pub(crate) struct OptionFns {
    /// The payload's [`TypeId`]; `Some` bodies encode against it.
    pub(crate) inner: TypeId,
    pub(crate) make_none: Box<dyn Fn() -> Box<dyn Portable> + Send + Sync>,
    pub(crate) wrap_some:
        Box<dyn Fn(Box<dyn Portable>) -> SerialResult<Box<dyn Portable>> + Send + Sync>,
}

/// Array support, monomorphized for one element type at registration.
///
/// The general array wire shape is: type header, rank byte, one 4-byte
/// length per dimension, then the elements in row-major order. These
/// closures own everything after the dimensions.
pub(crate) struct ArrayFns {
    /// Dimension lengths of a `Vec` or `MultiArray` value.
    pub(crate) dims_of: Box<dyn Fn(&dyn Portable) -> Vec<u32> + Send + Sync>,
    /// Serializes the elements of a `Vec` or `MultiArray` value.
    pub(crate) serialize_elements:
        Box<dyn Fn(&dyn Portable, &mut SerializeContext<'_>) -> SerialResult<()> + Send + Sync>,
    /// Builds a `Vec` of the element type from `count` decoded elements.
    pub(crate) deserialize_vec:
        Box<dyn Fn(usize, &mut DeserializeContext<'_>) -> SerialResult<Box<dyn Portable>> + Send + Sync>,
    /// Builds a `MultiArray` of the element type from decoded elements.
    pub(crate) deserialize_multi:
        Box<dyn Fn(Vec<u32>, &mut DeserializeContext<'_>) -> SerialResult<Box<dyn Portable>> + Send + Sync>,
    /// Deep-copies element-wise.
    pub(crate) copy_elements: CopyFn,
    /// Whole-array shallow clone, present when the element type supports
    /// it. Used when the elements are shallow-copyable.
    pub(crate) clone_whole: Option<Box<dyn Fn(&dyn Portable) -> Box<dyn Portable> + Send + Sync>>,
}

// -----------------------------------------------------------------------------
// CodecEntry

/// A registry entry: the codec triple and the per-type metadata the
/// dispatcher consults.
///
/// Entries are cheap to clone; the closures are shared.
#[derive(Clone)]
pub struct CodecEntry {
    pub(crate) type_id: TypeId,
    pub(crate) type_key: Arc<str>,
    pub(crate) type_name: &'static str,
    pub(crate) copier: Option<CopyFn>,
    pub(crate) serializer: Option<SerializeFn>,
    pub(crate) deserializer: Option<DeserializeFn>,
    pub(crate) enum_kind: Option<EnumKind>,
    pub(crate) shallow: bool,
    pub(crate) array_fns: Option<Arc<ArrayFns>>,
    pub(crate) option_fns: Option<Arc<OptionFns>>,
}

impl CodecEntry {
    pub(crate) fn new<T: Portable>(type_key: Arc<str>) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_key,
            type_name: core::any::type_name::<T>(),
            copier: None,
            serializer: None,
            deserializer: None,
            enum_kind: None,
            shallow: false,
            array_fns: None,
            option_fns: None,
        }
    }

    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    #[inline]
    pub fn type_key(&self) -> &str {
        &self.type_key
    }

    #[inline]
    pub fn has_serializer(&self) -> bool {
        self.serializer.is_some()
    }

    #[inline]
    pub fn is_enum(&self) -> bool {
        self.enum_kind.is_some()
    }
}

impl core::fmt::Debug for CodecEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CodecEntry")
            .field("type_key", &self.type_key)
            .field("type_name", &self.type_name)
            .field("copier", &self.copier.is_some())
            .field("serializer", &self.serializer.is_some())
            .field("deserializer", &self.deserializer.is_some())
            .field("enum_kind", &self.enum_kind)
            .field("shallow", &self.shallow)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Registration

/// How typed arrays of a registered type are found from a value's
/// [`TypeId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArrayKind {
    /// `Vec<T>`: rank 1.
    Vec,
    /// `MultiArray<T>`: rank from the value.
    Multi,
}

/// A specialization seed: the monomorphized recipe for one closed
/// generic key, planted when the argument type registers and harvested
/// lazily on first use.
pub(crate) struct FamilySeed {
    pub(crate) closed_key: Arc<str>,
    pub(crate) concrete_type: TypeId,
    pub(crate) make: Arc<dyn Fn() -> Registration + Send + Sync>,
}

impl core::fmt::Debug for FamilySeed {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FamilySeed")
            .field("closed_key", &self.closed_key)
            .finish()
    }
}

/// One item of the registry feed: a codec entry plus everything its
/// registration drags in — marker keys for the abstract types it
/// satisfies, array shapes, and specialization seeds.
///
/// Build one with the constructors in [`crate::codecs`], then adjust:
///
/// ```
/// use gv_engine::{codecs, EngineBuilder};
///
/// #[derive(Debug, Clone, PartialEq, Default)]
/// struct Temperature(f64);
/// gv_engine::impl_portable!(Temperature);
///
/// let reg = codecs::record::<Temperature>(
///     "temperature",
///     |v, _ctx| Ok(Temperature(v.0)),
///     |v, ctx| {
///         ctx.writer().write_f64(v.0);
///         Ok(())
///     },
///     |ctx| Ok(Temperature(ctx.reader().read_f64()?)),
/// )
/// .with_markers(["sensor.reading"]);
///
/// let engine = EngineBuilder::new().register(reg).build().unwrap();
/// assert!(engine.has_serializer_for_key("temperature"));
/// ```
pub struct Registration {
    pub(crate) entry: CodecEntry,
    pub(crate) marker_keys: Vec<Arc<str>>,
    pub(crate) overwrite: bool,
    pub(crate) seeds: Vec<FamilySeed>,
    /// `(container, element, kind)` rows for the array-shape index.
    pub(crate) array_kinds: Vec<(TypeId, TypeId, ArrayKind)>,
}

impl Registration {
    /// A key-only marker registration: makes the key resolvable with no
    /// codecs attached. Used for abstract bases and for types whose
    /// codecs come from an external serializer.
    pub fn marker<T: Portable>(key: &str) -> Self {
        crate::codecs::seeded::<T>(CodecEntry::new::<T>(Arc::from(key)))
    }

    /// Adds abstract keys this type satisfies, registered as key-only
    /// entries so values statically of those types resolve at decode
    /// time.
    pub fn with_markers<'k>(mut self, keys: impl IntoIterator<Item = &'k str>) -> Self {
        self.marker_keys.extend(keys.into_iter().map(Arc::from));
        self
    }

    /// Marks the type shallow-copyable: deep copy shares it instead of
    /// copying, and arrays of it clone in one piece.
    pub fn shallow(mut self) -> Self {
        self.entry.shallow = true;
        self
    }

    /// Replaces an existing registration for the same type instead of
    /// being ignored.
    pub fn overwrite(mut self) -> Self {
        self.overwrite = true;
        self
    }

    /// Makes `Shared<T>` handles of this type serializable, enabling
    /// identity preservation and cycles through them.
    ///
    /// `T` must be the registered type; decode materializes the handle
    /// cell from `T::default()` before filling it, so forward and cyclic
    /// references can resolve mid-body.
    pub fn sharable<T: Portable + Default>(mut self) -> Self {
        assert_eq!(
            TypeId::of::<T>(),
            self.entry.type_id,
            "sharable::<T>() must name the registered type (got `{}`, registered `{}`)",
            core::any::type_name::<T>(),
            self.entry.type_name,
        );
        let shared_key = format!("shared<{}>", self.entry.type_key);
        self.seeds.push(crate::codecs::shared_seed::<T>(&self.entry.type_key));
        // Handles appear inside options and arrays as a matter of
        // course; seed those containers now so both endpoints agree on
        // what is materializable, whatever order they decode in.
        self.seeds.push(crate::codecs::option_seed::<crate::Shared<T>>(&shared_key));
        self.array_kinds.push((
            TypeId::of::<Vec<crate::Shared<T>>>(),
            TypeId::of::<crate::Shared<T>>(),
            ArrayKind::Vec,
        ));
        self.array_kinds.push((
            TypeId::of::<crate::MultiArray<crate::Shared<T>>>(),
            TypeId::of::<crate::Shared<T>>(),
            ArrayKind::Multi,
        ));
        self
    }

    #[inline]
    pub fn type_key(&self) -> &str {
        &self.entry.type_key
    }
}

impl core::fmt::Debug for Registration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registration")
            .field("entry", &self.entry)
            .field("marker_keys", &self.marker_keys)
            .field("overwrite", &self.overwrite)
            .field("seeds", &self.seeds)
            .finish()
    }
}
