//! Per-operation state: stream cursors and the back-reference tables.
//!
//! A context lives for exactly one serialize, deserialize, or deep-copy
//! operation, is owned by one thread, and is a fresh back-reference
//! namespace: offsets recorded by one operation mean nothing to any
//! other.

use core::any::TypeId;

use gv_utils::hash::HashMap;
use gv_wire::{StreamReader, StreamWriter};

use crate::engine::SerializationEngine;
use crate::error::{SerialError, SerialResult};
use crate::payload::Portable;

/// A deferred handle clone, parked in a back-reference table.
///
/// Cloning through a closure keeps the concrete handle type out of the
/// table, so one table serves every `Shared<T>` in the graph.
pub type HandleCloner = Box<dyn Fn() -> Box<dyn Portable>>;

// -----------------------------------------------------------------------------
// SerializeContext

/// State of one encode operation.
///
/// Holds the stream writer and the identity table: reference-typed
/// values are recorded at the offset their body starts, and every later
/// occurrence encodes as a back-reference to that offset.
pub struct SerializeContext<'a> {
    engine: &'a SerializationEngine,
    writer: StreamWriter,
    refs: HashMap<usize, u32>,
}

impl<'a> SerializeContext<'a> {
    pub(crate) fn new(engine: &'a SerializationEngine) -> Self {
        Self {
            engine,
            writer: StreamWriter::new(),
            refs: HashMap::default(),
        }
    }

    #[inline]
    pub fn engine(&self) -> &'a SerializationEngine {
        self.engine
    }

    #[inline]
    pub fn writer(&mut self) -> &mut StreamWriter {
        &mut self.writer
    }

    /// Serializes a nested value through the engine's dispatch order.
    ///
    /// `expected` is the statically-known type at this position, used to
    /// collapse type headers.
    pub fn serialize_item(
        &mut self,
        value: &dyn Portable,
        expected: Option<TypeId>,
    ) -> SerialResult<()> {
        let engine = self.engine;
        engine.serialize_inner(value, self, expected)
    }

    /// The offset previously recorded for an identity, if any.
    pub fn lookup_reference(&self, identity: usize) -> Option<u32> {
        self.refs.get(&identity).copied()
    }

    /// Records an identity at a stream offset. First writer wins; a
    /// value is recorded once per operation.
    pub fn record_reference(&mut self, identity: usize, position: u32) {
        self.refs.entry(identity).or_insert(position);
    }

    pub(crate) fn into_writer(self) -> StreamWriter {
        self.writer
    }
}

// -----------------------------------------------------------------------------
// DeserializeContext

/// State of one decode operation.
///
/// The inverse table maps stream offsets to materialized handles. A
/// handle is recorded as soon as it exists — before its body decodes —
/// so references inside the body, cycles included, resolve to it.
pub struct DeserializeContext<'a> {
    engine: &'a SerializationEngine,
    reader: StreamReader<'a>,
    objects: HashMap<u32, HandleCloner>,
    current_offset: u32,
}

impl<'a> DeserializeContext<'a> {
    pub(crate) fn new(engine: &'a SerializationEngine, bytes: &'a [u8]) -> Self {
        Self {
            engine,
            reader: StreamReader::new(bytes),
            objects: HashMap::default(),
            current_offset: 0,
        }
    }

    #[inline]
    pub fn engine(&self) -> &'a SerializationEngine {
        self.engine
    }

    #[inline]
    pub fn reader(&mut self) -> &mut StreamReader<'a> {
        &mut self.reader
    }

    /// Deserializes a nested value through the engine's token dispatch.
    pub fn deserialize_item(
        &mut self,
        expected: Option<TypeId>,
    ) -> SerialResult<Box<dyn Portable>> {
        let engine = self.engine;
        engine.deserialize_item(self, expected)
    }

    /// Deserializes a nested value and downcasts it to `T`.
    pub fn deserialize_value<T: Portable>(&mut self) -> SerialResult<T> {
        self.deserialize_item(Some(TypeId::of::<T>()))?
            .take::<T>()
            .map_err(|actual| SerialError::TypeMismatch {
                expected: core::any::type_name::<T>(),
                actual: actual.type_name().to_string(),
            })
    }

    /// The body offset of the object currently being decoded.
    ///
    /// Saved and restored by the engine around every nested read, so a
    /// nested decode never corrupts its parent's offset.
    #[inline]
    pub fn current_offset(&self) -> u32 {
        self.current_offset
    }

    pub(crate) fn swap_current_offset(&mut self, offset: u32) -> u32 {
        core::mem::replace(&mut self.current_offset, offset)
    }

    /// Records the materialized handle for the object at the current
    /// body offset.
    pub fn record_current(&mut self, cloner: HandleCloner) {
        self.objects.entry(self.current_offset).or_insert(cloner);
    }

    /// Resolves a back-reference read off the stream.
    pub fn resolve_reference(&self, offset: u32) -> SerialResult<Box<dyn Portable>> {
        self.objects
            .get(&offset)
            .map(|cloner| cloner())
            .ok_or(SerialError::UnknownReference(offset))
    }
}

// -----------------------------------------------------------------------------
// CopyContext

/// State of one deep-copy operation: the identity-to-copy table that
/// keeps shared subgraphs shared and terminates cycles, with no wire
/// involved.
pub struct CopyContext<'a> {
    engine: &'a SerializationEngine,
    copies: HashMap<usize, HandleCloner>,
}

impl<'a> CopyContext<'a> {
    pub(crate) fn new(engine: &'a SerializationEngine) -> Self {
        Self {
            engine,
            copies: HashMap::default(),
        }
    }

    #[inline]
    pub fn engine(&self) -> &'a SerializationEngine {
        self.engine
    }

    /// Deep-copies a nested value through the engine's dispatch order.
    pub fn copy_item(&mut self, value: &dyn Portable) -> SerialResult<Box<dyn Portable>> {
        let engine = self.engine;
        engine.deep_copy_inner(value, self)
    }

    /// The copy previously made for an identity, if any.
    pub fn lookup_copy(&self, identity: usize) -> Option<Box<dyn Portable>> {
        self.copies.get(&identity).map(|cloner| cloner())
    }

    /// Records the copy of an identity. Recorded before the copied cell
    /// is filled, so cyclic graphs terminate.
    pub fn record_copy(&mut self, identity: usize, cloner: HandleCloner) {
        self.copies.entry(identity).or_insert(cloner);
    }
}
