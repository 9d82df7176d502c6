#![doc = include_str!("../README.md")]

// -----------------------------------------------------------------------------
// Modules

mod array;
mod context;
mod engine;
mod error;
mod name;
mod payload;
mod pluggable;
mod stats;

pub mod codecs;
pub mod registry;

#[cfg(test)]
mod test;

// -----------------------------------------------------------------------------
// Top-level exports

pub use context::{CopyContext, DeserializeContext, SerializeContext};
pub use engine::{EngineBuilder, SerializationEngine};
pub use error::{SerialError, SerialResult};
pub use name::TypeName;
pub use payload::{BareObject, DynSeq, Fault, MultiArray, NullValue, Portable, Shared};
pub use pluggable::{JsonFallback, KeyedSerializer, PluggableSerializer};
pub use registry::{EnumKind, KnownTypeEntry, Registration, ResolvedType, TypeLoader};
pub use stats::{NullSink, SerializationStatistics, StatisticsSink};
