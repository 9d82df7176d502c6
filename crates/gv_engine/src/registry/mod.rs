//! The type registry: codec triples keyed by runtime type, stable
//! string keys, and the lazy specialization machinery for closed
//! generics.

// -----------------------------------------------------------------------------
// Modules

mod codec_registry;
mod known;

pub(crate) mod entry;

// -----------------------------------------------------------------------------
// Exports

pub use codec_registry::{ResolvedType, TypeLoader};
pub use entry::{CodecEntry, CopyFn, DeserializeFn, EnumKind, Registration, SerializeFn};
pub use known::{KnownTypeEntry, parse_manifest};

pub(crate) use codec_registry::{ArrayShape, CodecRegistry};
