//! User-pluggable serializer tiers.
//!
//! External, keyed, and fallback serializers are one abstraction — a
//! type-support predicate plus the codec triple — differing only in how
//! the dispatcher finds them and which wire token announces them:
//!
//! - **external**: ordered list, first match wins, tried before
//!   registered codecs; announced by a normal type header.
//! - **keyed**: selected on the wire by a 1-byte id.
//! - **fallback**: the single last resort, announced by the `Fallback`
//!   token.

use core::any::TypeId;
use std::sync::Arc;

use gv_utils::TypeIdMap;
use gv_utils::hash::HashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::context::{CopyContext, DeserializeContext, SerializeContext};
use crate::error::{SerialError, SerialResult};
use crate::payload::{Fault, Portable};

// -----------------------------------------------------------------------------
// PluggableSerializer

/// The capability set shared by all three pluggable tiers.
pub trait PluggableSerializer: Send + Sync {
    /// Whether this serializer claims the type. Results are memoized per
    /// type by the engine, negative answers included.
    fn supports_type(&self, type_id: TypeId) -> bool;

    fn copy(
        &self,
        value: &dyn Portable,
        ctx: &mut CopyContext<'_>,
    ) -> SerialResult<Box<dyn Portable>>;

    fn serialize(
        &self,
        value: &dyn Portable,
        ctx: &mut SerializeContext<'_>,
        expected: Option<TypeId>,
    ) -> SerialResult<()>;

    fn deserialize(
        &self,
        expected: Option<TypeId>,
        ctx: &mut DeserializeContext<'_>,
    ) -> SerialResult<Box<dyn Portable>>;
}

/// A pluggable serializer selected on the wire by its id byte.
pub trait KeyedSerializer: PluggableSerializer {
    /// The unique id written after the `KeyedSerializer` token. Ids are
    /// part of the wire contract between matching registries.
    fn serializer_id(&self) -> u8;
}

/// A memoized support answer: an index into the tier's ordered list, or
/// an explicit miss. Absence from the memo table means "not yet
/// computed" — the two states never conflate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Memo {
    Hit(usize),
    Miss,
}

// -----------------------------------------------------------------------------
// JsonFallback

type ToJson = Box<dyn Fn(&dyn Portable) -> SerialResult<Vec<u8>> + Send + Sync>;
type FromJson = Box<dyn Fn(&[u8]) -> SerialResult<Box<dyn Portable>> + Send + Sync>;

struct JsonCodec {
    key: Arc<str>,
    to_json: ToJson,
    from_json: FromJson,
}

/// The default fallback serializer: serde-based JSON payloads for
/// enrolled types.
///
/// The payload after the `Fallback` token is the enrolled key string
/// followed by length-prefixed JSON. Copy round-trips through the codec,
/// which is a deep copy by construction. [`Fault`] is always enrolled,
/// so the exception-substitution path has a transport no matter how the
/// engine is configured.
pub struct JsonFallback {
    by_type: TypeIdMap<JsonCodec>,
    by_key: HashMap<Arc<str>, TypeId>,
}

impl Default for JsonFallback {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonFallback {
    pub fn new() -> Self {
        Self {
            by_type: TypeIdMap::new(),
            by_key: HashMap::default(),
        }
        .with::<Fault>("fault")
    }

    /// Enrolls a type under a key. Both endpoints must enroll the same
    /// types under the same keys.
    pub fn with<T: Portable + Serialize + DeserializeOwned>(mut self, key: &str) -> Self {
        let key: Arc<str> = Arc::from(key);
        self.by_key.insert(key.clone(), TypeId::of::<T>());
        self.by_type.insert_type::<T>(JsonCodec {
            key,
            to_json: Box::new(|value| {
                let concrete = value.downcast_ref::<T>().unwrap_or_else(|| {
                    panic!(
                        "fallback type mismatched: expected `{}`, got `{}`",
                        core::any::type_name::<T>(),
                        value.type_name(),
                    )
                });
                serde_json::to_vec(concrete).map_err(SerialError::codec)
            }),
            from_json: Box::new(|bytes| {
                let value: T = serde_json::from_slice(bytes).map_err(SerialError::codec)?;
                Ok(Box::new(value) as Box<dyn Portable>)
            }),
        });
        self
    }

    fn codec_for(&self, type_id: TypeId) -> SerialResult<&JsonCodec> {
        self.by_type
            .get(type_id)
            .ok_or_else(|| SerialError::NoCodecFound {
                type_key: "<not enrolled with the fallback>".to_string(),
                type_name: format!("{type_id:?}"),
            })
    }
}

impl PluggableSerializer for JsonFallback {
    fn supports_type(&self, type_id: TypeId) -> bool {
        self.by_type.contains(type_id)
    }

    fn copy(
        &self,
        value: &dyn Portable,
        _ctx: &mut CopyContext<'_>,
    ) -> SerialResult<Box<dyn Portable>> {
        let codec = self.codec_for(value.concrete_type_id())?;
        let bytes = (codec.to_json)(value)?;
        (codec.from_json)(&bytes)
    }

    fn serialize(
        &self,
        value: &dyn Portable,
        ctx: &mut SerializeContext<'_>,
        _expected: Option<TypeId>,
    ) -> SerialResult<()> {
        let codec = self.codec_for(value.concrete_type_id())?;
        let bytes = (codec.to_json)(value)?;
        ctx.writer().write_str(&codec.key);
        ctx.writer().write_u32(bytes.len() as u32);
        ctx.writer().write_bytes(&bytes);
        Ok(())
    }

    fn deserialize(
        &self,
        _expected: Option<TypeId>,
        ctx: &mut DeserializeContext<'_>,
    ) -> SerialResult<Box<dyn Portable>> {
        let key = ctx.reader().read_str()?;
        let type_id =
            self.by_key
                .get(key.as_str())
                .copied()
                .ok_or_else(|| SerialError::NoCodecFound {
                    type_key: key.clone(),
                    type_name: "<not enrolled with the fallback>".to_string(),
                })?;
        let length = ctx.reader().read_len()?;
        let bytes = ctx.reader().read_bytes(length)?.to_vec();
        (self.by_type.get(type_id).expect("indexes agree").from_json)(&bytes)
    }
}
