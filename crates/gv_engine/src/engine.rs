//! The dispatcher: the top-level serialize / deserialize / deep-copy
//! routines and the tie-break order that selects a codec for every
//! value.

use core::any::TypeId;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use gv_utils::TypeIdMap;
use gv_utils::hash::HashMap;
use gv_wire::Token;
use tracing::{debug, warn};

use crate::array;
use crate::codecs;
use crate::context::{CopyContext, DeserializeContext, SerializeContext};
use crate::error::{SerialError, SerialResult};
use crate::name::TypeName;
use crate::payload::{
    BareObject, DynSeq, Portable, box_simple, try_as_simple, try_copy_simple,
};
use crate::pluggable::{JsonFallback, KeyedSerializer, Memo, PluggableSerializer};
use crate::registry::entry::OptionFns;
use crate::registry::{
    ArrayShape, CodecEntry, CodecRegistry, KnownTypeEntry, Registration, ResolvedType, TypeLoader,
    parse_manifest,
};
use crate::stats::{SerializationStatistics, StatisticsSink};

/// Allocations above this many bytes raise the large-allocation warning.
const DEFAULT_LARGE_OBJECT_THRESHOLD: usize = 85_000;

// -----------------------------------------------------------------------------
// EngineBuilder

/// Assembles a [`SerializationEngine`] from the host's registration
/// feed.
///
/// Construction is the only fallible phase: inconsistent registrations,
/// duplicate keyed ids, and malformed manifests abort `build` instead of
/// surfacing later mid-operation.
pub struct EngineBuilder {
    registrations: Vec<Registration>,
    known_types: Vec<KnownTypeEntry>,
    loader: Option<TypeLoader>,
    externals: Vec<Arc<dyn PluggableSerializer>>,
    keyed: Vec<Arc<dyn KeyedSerializer>>,
    fallback: Option<Arc<dyn PluggableSerializer>>,
    stats: Option<Arc<dyn StatisticsSink>>,
    large_object_threshold: usize,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
            known_types: Vec::new(),
            loader: None,
            externals: Vec::new(),
            keyed: Vec::new(),
            fallback: None,
            stats: None,
            large_object_threshold: DEFAULT_LARGE_OBJECT_THRESHOLD,
        }
    }

    /// Adds one registration. Build one with the constructors in
    /// [`crate::codecs`] or [`Registration::marker`].
    pub fn register(mut self, registration: Registration) -> Self {
        self.registrations.push(registration);
        self
    }

    pub fn register_all(mut self, registrations: impl IntoIterator<Item = Registration>) -> Self {
        self.registrations.extend(registrations);
        self
    }

    /// Adds known-type rows: stable key to fully-qualified name.
    pub fn with_known_types(mut self, entries: impl IntoIterator<Item = KnownTypeEntry>) -> Self {
        self.known_types.extend(entries);
        self
    }

    /// Adds known-type rows from a JSON manifest.
    pub fn with_known_type_manifest(mut self, json: &str) -> SerialResult<Self> {
        self.known_types.extend(parse_manifest(json)?);
        Ok(self)
    }

    /// Installs the loader that turns qualified names from the
    /// known-type table into registrations.
    pub fn with_type_loader(mut self, loader: TypeLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Appends an external serializer. Order matters: the first one
    /// whose `supports_type` answers yes wins, ahead of registered
    /// codecs.
    pub fn with_external(mut self, external: Arc<dyn PluggableSerializer>) -> Self {
        self.externals.push(external);
        self
    }

    /// Appends a keyed serializer. Its id byte must be unique.
    pub fn with_keyed(mut self, keyed: Arc<dyn KeyedSerializer>) -> Self {
        self.keyed.push(keyed);
        self
    }

    /// Replaces the default JSON fallback serializer.
    pub fn with_fallback(mut self, fallback: Arc<dyn PluggableSerializer>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Injects the statistics sink. Defaults to an enabled
    /// [`SerializationStatistics`].
    pub fn with_statistics(mut self, stats: Arc<dyn StatisticsSink>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Adjusts the large-allocation warning threshold, in bytes.
    pub fn with_large_object_threshold(mut self, bytes: usize) -> Self {
        self.large_object_threshold = bytes;
        self
    }

    pub fn build(self) -> SerialResult<SerializationEngine> {
        let mut registry = CodecRegistry::new();
        for entry in &self.known_types {
            registry.add_known_type(&entry.key, &entry.qualified_name);
        }
        if let Some(loader) = self.loader {
            registry.set_loader(loader);
        }

        let builtins = codecs::builtin_registrations();
        let registered = builtins.len() + self.registrations.len();
        for registration in builtins.into_iter().chain(self.registrations) {
            registry.apply(registration)?;
        }

        let mut keyed_by_id = HashMap::default();
        for (index, keyed) in self.keyed.iter().enumerate() {
            if keyed_by_id.insert(keyed.serializer_id(), index).is_some() {
                return Err(SerialError::DuplicateKeyedSerializer(keyed.serializer_id()));
            }
        }

        debug!(
            registrations = registered,
            externals = self.externals.len(),
            keyed = self.keyed.len(),
            "serialization engine built"
        );

        Ok(SerializationEngine {
            registry: RwLock::new(registry),
            externals: self.externals,
            external_memo: RwLock::new(TypeIdMap::new()),
            keyed: self.keyed,
            keyed_by_id,
            keyed_memo: RwLock::new(TypeIdMap::new()),
            fallback: self
                .fallback
                .unwrap_or_else(|| Arc::new(JsonFallback::new())),
            stats: self
                .stats
                .unwrap_or_else(|| Arc::new(SerializationStatistics::new())),
            large_object_threshold: self.large_object_threshold,
        })
    }
}

// -----------------------------------------------------------------------------
// SerializationEngine

/// The engine: owns the registry and the pluggable tiers, and runs every
/// operation.
///
/// One engine serves the whole host; operations from parallel threads
/// share it freely. Each operation gets a private context and never
/// holds a registry lock across user code.
pub struct SerializationEngine {
    registry: RwLock<CodecRegistry>,
    externals: Vec<Arc<dyn PluggableSerializer>>,
    external_memo: RwLock<TypeIdMap<Memo>>,
    keyed: Vec<Arc<dyn KeyedSerializer>>,
    keyed_by_id: HashMap<u8, usize>,
    keyed_memo: RwLock<TypeIdMap<Memo>>,
    fallback: Arc<dyn PluggableSerializer>,
    stats: Arc<dyn StatisticsSink>,
    large_object_threshold: usize,
}

impl SerializationEngine {
    /// Encodes a value into a fresh byte buffer.
    pub fn serialize(&self, value: &dyn Portable) -> SerialResult<Vec<u8>> {
        let started = self.stats.is_enabled().then(Instant::now);
        let mut ctx = SerializeContext::new(self);
        self.serialize_inner(value, &mut ctx, None)?;
        self.stats
            .record_serialization(started.map(|s| s.elapsed()));
        Ok(ctx.into_writer().into_bytes())
    }

    /// Decodes a value of a statically-known type.
    pub fn deserialize<T: Portable>(&self, bytes: &[u8]) -> SerialResult<T> {
        self.deserialize_dyn(Some(TypeId::of::<T>()), bytes)?
            .take::<T>()
            .map_err(|actual| SerialError::TypeMismatch {
                expected: core::any::type_name::<T>(),
                actual: actual.type_name().to_string(),
            })
    }

    /// Decodes a value, optionally against an expected type. With no
    /// expected type the stream must be fully self-describing.
    pub fn deserialize_dyn(
        &self,
        expected: Option<TypeId>,
        bytes: &[u8],
    ) -> SerialResult<Box<dyn Portable>> {
        let started = self.stats.is_enabled().then(Instant::now);
        let mut ctx = DeserializeContext::new(self, bytes);
        let value = self.deserialize_item(&mut ctx, expected)?;
        self.stats
            .record_deserialization(started.map(|s| s.elapsed()));
        Ok(value)
    }

    /// Deep-copies a value without touching the wire format.
    pub fn deep_copy(&self, value: &dyn Portable) -> SerialResult<Box<dyn Portable>> {
        let started = self.stats.is_enabled().then(Instant::now);
        let mut ctx = CopyContext::new(self);
        let copy = self.deep_copy_inner(value, &mut ctx)?;
        self.stats.record_copy(started.map(|s| s.elapsed()));
        Ok(copy)
    }

    /// Deep-copies a value of a statically-known type.
    pub fn deep_copy_value<T: Portable>(&self, value: &T) -> SerialResult<T> {
        self.deep_copy(value)?
            .take::<T>()
            .map_err(|actual| SerialError::TypeMismatch {
                expected: core::any::type_name::<T>(),
                actual: actual.type_name().to_string(),
            })
    }

    /// Deep-copies every element of a heterogeneous sequence in place,
    /// under one copy table so sharing across elements survives.
    pub fn deep_copy_elements_in_place(&self, seq: &mut DynSeq) -> SerialResult<()> {
        let started = self.stats.is_enabled().then(Instant::now);
        let mut ctx = CopyContext::new(self);
        for slot in seq.iter_mut() {
            *slot = self.deep_copy_inner(&**slot, &mut ctx)?;
        }
        self.stats.record_copy(started.map(|s| s.elapsed()));
        Ok(())
    }

    /// Serialize-then-deserialize, for tests and for hosts that want a
    /// wire-faithful copy.
    pub fn round_trip<T: Portable>(&self, value: &T) -> SerialResult<T> {
        let bytes = self.serialize(value)?;
        self.deserialize(&bytes)
    }

    /// Whether a serializer exists for the type: directly registered,
    /// a typed array of a registered element, or a specialization that
    /// can still be materialized.
    pub fn has_serializer(&self, type_id: TypeId) -> bool {
        let registry = self.read_registry();
        self.has_serializer_locked(&registry, type_id)
    }

    /// Whether a serializer exists for a type key, recursing through
    /// array and generic structure.
    pub fn has_serializer_for_key(&self, key: &str) -> bool {
        {
            let registry = self.read_registry();
            if let Some(entry) = registry.get_by_key(key) {
                return self.has_serializer_locked(&registry, entry.type_id());
            }
            if registry.has_pending_key(key) {
                return true;
            }
        }
        match TypeName::parse(key) {
            Ok(TypeName::Array { elem, .. }) => self.has_serializer_for_key(&elem.to_string()),
            _ => false,
        }
    }

    /// Resolves a stable type key to a runtime type.
    pub fn resolve_type_name(&self, key: &str) -> SerialResult<ResolvedType> {
        self.resolve_key(key)
    }

    /// The injected statistics sink.
    pub fn statistics(&self) -> &Arc<dyn StatisticsSink> {
        &self.stats
    }

    // -------------------------------------------------------------------------
    // Registry access

    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, CodecRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> std::sync::RwLockWriteGuard<'_, CodecRegistry> {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Finds the codec entry for a type, materializing a pending
    /// specialization if one exists. Never holds a lock across the
    /// returned entry's closures.
    pub(crate) fn lookup_entry(&self, type_id: TypeId) -> Option<CodecEntry> {
        {
            let registry = self.read_registry();
            if let Some(entry) = registry.get(type_id) {
                return Some(entry.clone());
            }
            if !registry.has_pending_for_type(type_id) {
                return None;
            }
        }
        let mut registry = self.write_registry();
        // Re-check under the write lock so racing specializations
        // collapse into one insert.
        if let Some(entry) = registry.get(type_id) {
            return Some(entry.clone());
        }
        match registry.materialize_for_type(type_id) {
            Ok(entry) => entry,
            Err(error) => {
                // Seeds are engine-built; a failing one is a bug worth
                // surfacing loudly, but the lookup itself just misses.
                warn!(%error, "specialization failed");
                None
            }
        }
    }

    pub(crate) fn array_shape(&self, type_id: TypeId) -> Option<ArrayShape> {
        self.read_registry().array_shape(type_id)
    }

    fn option_fns(&self, type_id: TypeId) -> Option<Arc<OptionFns>> {
        self.lookup_entry(type_id)?.option_fns
    }

    fn has_serializer_locked(&self, registry: &CodecRegistry, type_id: TypeId) -> bool {
        if let Some(entry) = registry.get(type_id) {
            if entry.has_serializer() {
                return true;
            }
            if let Some(option_fns) = &entry.option_fns {
                return self.has_serializer_locked(registry, option_fns.inner);
            }
            return false;
        }
        if let Some(shape) = registry.array_shape(type_id) {
            return self.has_serializer_locked(registry, shape.elem);
        }
        registry.has_pending_for_type(type_id)
    }

    /// Resolution order for a type key: exact registration, known-type
    /// table plus loader, pending specialization, array structure,
    /// generic structure, failure.
    fn resolve_key(&self, key: &str) -> SerialResult<ResolvedType> {
        {
            let registry = self.read_registry();
            if let Some(entry) = registry.get_by_key(key) {
                return Ok(ResolvedType::Concrete {
                    type_id: entry.type_id(),
                    key: Arc::from(entry.type_key()),
                });
            }
            if registry.is_marker(key) {
                return Ok(ResolvedType::Abstract { key: Arc::from(key) });
            }
        }

        // Known-type table: load through the host's type loader, cache
        // by registering, and answer from the registration.
        let loaded = {
            let registry = self.read_registry();
            registry
                .known_type(key)
                .zip(registry.loader())
                .and_then(|(qualified, loader)| loader(&qualified))
        };
        if let Some(registration) = loaded {
            debug!(key, "type loaded through the known-type table");
            let mut registry = self.write_registry();
            registry.apply(registration)?;
            if let Some(entry) = registry.get_by_key(key) {
                return Ok(ResolvedType::Concrete {
                    type_id: entry.type_id(),
                    key: Arc::from(entry.type_key()),
                });
            }
        }

        {
            let mut registry = self.write_registry();
            if let Some(entry) = registry.materialize_key(key)? {
                return Ok(ResolvedType::Concrete {
                    type_id: entry.type_id(),
                    key: Arc::from(entry.type_key()),
                });
            }
        }

        match TypeName::parse(key)? {
            TypeName::Array { elem, rank } => {
                let elem = self.resolve_key(&elem.to_string())?;
                Ok(ResolvedType::Array {
                    elem: Box::new(elem),
                    rank,
                })
            }
            TypeName::Generic { ref args, .. } => {
                // Resolving the arguments may plant the specialization
                // this key needs; try the definition again afterwards.
                for arg in args {
                    self.resolve_key(&arg.to_string())?;
                }
                let mut registry = self.write_registry();
                if let Some(entry) = registry.materialize_key(key)? {
                    return Ok(ResolvedType::Concrete {
                        type_id: entry.type_id(),
                        key: Arc::from(entry.type_key()),
                    });
                }
                Err(SerialError::UnresolvableTypeName { key: key.into() })
            }
            TypeName::Simple(_) => Err(SerialError::UnresolvableTypeName { key: key.into() }),
        }
    }

    pub(crate) fn note_allocation(&self, bytes: usize) {
        if bytes > self.large_object_threshold {
            warn!(
                bytes,
                threshold = self.large_object_threshold,
                "large object allocation"
            );
            self.stats.record_large_allocation(bytes);
        }
    }

    // -------------------------------------------------------------------------
    // Pluggable tiers

    fn find_external(&self, type_id: TypeId) -> Option<Arc<dyn PluggableSerializer>> {
        find_memoized(&self.externals, &self.external_memo, type_id)
    }

    fn find_keyed(&self, type_id: TypeId) -> Option<Arc<dyn KeyedSerializer>> {
        find_memoized(&self.keyed, &self.keyed_memo, type_id)
    }

    fn keyed_by_wire_id(&self, id: u8) -> Option<Arc<dyn KeyedSerializer>> {
        self.keyed_by_id.get(&id).map(|&index| self.keyed[index].clone())
    }

    // -------------------------------------------------------------------------
    // Serialize

    fn write_named_header(
        &self,
        ctx: &mut SerializeContext<'_>,
        key: &str,
        runtime: TypeId,
        expected: Option<TypeId>,
    ) {
        if expected == Some(runtime) {
            ctx.writer().write_token(Token::ExpectedType);
        } else {
            ctx.writer().write_token(Token::SpecifiedType);
            ctx.writer().write_token(Token::NamedType);
            ctx.writer().write_str(key);
        }
    }

    /// Records a reference-typed value's identity at the current
    /// position — the start of its body, right after its header.
    fn note_reference(&self, value: &dyn Portable, ctx: &mut SerializeContext<'_>) {
        if let Some(identity) = value.shared_identity() {
            let position = ctx.writer().position();
            ctx.record_reference(identity, position);
        }
    }

    /// The encode tie-break order. Every branch is a wire commitment
    /// shared with the decoder; reordering it is a format change.
    pub(crate) fn serialize_inner(
        &self,
        value: &dyn Portable,
        ctx: &mut SerializeContext<'_>,
        expected: Option<TypeId>,
    ) -> SerialResult<()> {
        // Null and present options encode transparently.
        if value.is_null() {
            ctx.writer().write_token(Token::Null);
            return Ok(());
        }
        if let Some(inner) = value.unwrap_some() {
            let expected = expected.and_then(|e| self.option_fns(e).map(|fns| fns.inner));
            return self.serialize_inner(inner, ctx, expected);
        }

        // 1. Primitive fastpath: token plus inline payload, no header.
        if let Some(simple) = try_as_simple(value) {
            ctx.writer().write_simple(&simple);
            return Ok(());
        }

        let type_id = value.concrete_type_id();

        // A reference-typed value already written encodes as an offset.
        if let Some(identity) = value.shared_identity()
            && let Some(offset) = ctx.lookup_reference(identity)
        {
            ctx.writer().write_token(Token::Reference);
            ctx.writer().write_u32(offset);
            return Ok(());
        }

        let entry = self.lookup_entry(type_id);

        // 2. Enums: header, then the underlying integer.
        if let Some(e) = &entry
            && e.is_enum()
            && let Some(serializer) = &e.serializer
        {
            self.write_named_header(ctx, e.type_key(), type_id, expected);
            return serializer(value, ctx);
        }

        // 3. The bare-object sentinel.
        if value.is::<BareObject>() {
            if expected == Some(type_id) {
                ctx.writer().write_token(Token::ExpectedType);
            } else {
                ctx.writer().write_token(Token::SpecifiedType);
                ctx.writer().write_token(Token::Object);
            }
            return Ok(());
        }

        // 4. Arrays: blittable fastpath, then typed containers.
        if array::try_write_blittable(self, value, ctx, expected)? {
            return Ok(());
        }
        if let Some(shape) = self.array_shape(type_id) {
            return array::serialize_general(self, shape, value, ctx, expected);
        }

        // 5. External serializers, ahead of registered codecs.
        if let Some(external) = self.find_external(type_id) {
            let Some(e) = &entry else {
                return Err(self.no_codec(entry.as_ref(), value));
            };
            self.write_named_header(ctx, e.type_key(), type_id, expected);
            self.note_reference(value, ctx);
            return external.serialize(value, ctx, expected);
        }

        // 6. Registered codecs.
        if let Some(e) = &entry
            && let Some(serializer) = &e.serializer
        {
            self.write_named_header(ctx, e.type_key(), type_id, expected);
            self.note_reference(value, ctx);
            return serializer(value, ctx);
        }

        // 7. Keyed serializers.
        if let Some(keyed) = self.find_keyed(type_id) {
            ctx.writer().write_token(Token::KeyedSerializer);
            ctx.writer().write_u8(keyed.serializer_id());
            self.note_reference(value, ctx);
            return keyed.serialize(value, ctx, expected);
        }

        // 8. The fallback serializer.
        if self.fallback.supports_type(type_id) {
            ctx.writer().write_token(Token::Fallback);
            self.note_reference(value, ctx);
            let started = self.stats.is_enabled().then(Instant::now);
            self.fallback.serialize(value, ctx, expected)?;
            self.stats
                .record_fallback_serialization(started.map(|s| s.elapsed()));
            return Ok(());
        }

        // 9. Error-carrying values are never un-transmittable: swap in
        // the synthetic fault and send that through the fallback.
        if let Some(fault) = value.as_fault() {
            warn!(
                original = value.type_name(),
                "substituting transmittable fault for unserializable error"
            );
            ctx.writer().write_token(Token::Fallback);
            let started = self.stats.is_enabled().then(Instant::now);
            self.fallback.serialize(&fault, ctx, expected)?;
            self.stats
                .record_fallback_serialization(started.map(|s| s.elapsed()));
            return Ok(());
        }

        Err(self.no_codec(entry.as_ref(), value))
    }

    fn no_codec(&self, entry: Option<&CodecEntry>, value: &dyn Portable) -> SerialError {
        SerialError::NoCodecFound {
            type_key: entry
                .map(|e| e.type_key().to_string())
                .unwrap_or_else(|| "<unregistered>".to_string()),
            type_name: value.type_name().to_string(),
        }
    }

    // -------------------------------------------------------------------------
    // Deserialize

    /// Decode entry point for one value position: applies the option
    /// adapter for nullable expected types, then dispatches on the next
    /// token.
    pub(crate) fn deserialize_item(
        &self,
        ctx: &mut DeserializeContext<'_>,
        expected: Option<TypeId>,
    ) -> SerialResult<Box<dyn Portable>> {
        if let Some(option_fns) = expected.and_then(|e| self.option_fns(e)) {
            if ctx.reader().peek_token()? == Token::Null {
                ctx.reader().read_token()?;
                return Ok((option_fns.make_none)());
            }
            let inner = self.deserialize_item(ctx, Some(option_fns.inner))?;
            return (option_fns.wrap_some)(inner);
        }
        self.deserialize_inner(ctx, expected)
    }

    fn deserialize_inner(
        &self,
        ctx: &mut DeserializeContext<'_>,
        expected: Option<TypeId>,
    ) -> SerialResult<Box<dyn Portable>> {
        if let Some(simple) = ctx.reader().try_read_simple()? {
            return Ok(box_simple(simple));
        }

        let position = ctx.reader().position();
        let token = ctx.reader().read_token()?;
        match token {
            Token::Reference => {
                let offset = ctx.reader().read_u32()?;
                ctx.resolve_reference(offset)
            }

            Token::SpecifiedType => {
                let tag = ctx.reader().read_token()?;
                match tag {
                    Token::Object => Ok(Box::new(BareObject)),
                    tag if tag.is_primitive_array() => array::read_blittable(self, tag, ctx),
                    Token::NamedType => {
                        let key = ctx.reader().read_str()?;
                        let resolved = self.resolve_key(&key)?;
                        self.deserialize_resolved(ctx, &resolved)
                    }
                    other => Err(SerialError::UnexpectedToken {
                        token: other,
                        position,
                    }),
                }
            }

            Token::ExpectedType => {
                let Some(expected) = expected else {
                    return Err(SerialError::ExpectedTypeMissing);
                };
                self.deserialize_expected(ctx, expected)
            }

            Token::Fallback => {
                let offset = ctx.reader().position();
                let saved = ctx.swap_current_offset(offset);
                let started = self.stats.is_enabled().then(Instant::now);
                let result = self.fallback.deserialize(expected, ctx);
                self.stats
                    .record_fallback_deserialization(started.map(|s| s.elapsed()));
                ctx.swap_current_offset(saved);
                result
            }

            Token::KeyedSerializer => {
                let id = ctx.reader().read_u8()?;
                let keyed = self
                    .keyed_by_wire_id(id)
                    .ok_or(SerialError::UnknownKeyedSerializer(id))?;
                let offset = ctx.reader().position();
                let saved = ctx.swap_current_offset(offset);
                let result = keyed.deserialize(expected, ctx);
                ctx.swap_current_offset(saved);
                result
            }

            other => Err(SerialError::UnexpectedToken {
                token: other,
                position,
            }),
        }
    }

    /// Decodes the body after a full type header.
    fn deserialize_resolved(
        &self,
        ctx: &mut DeserializeContext<'_>,
        resolved: &ResolvedType,
    ) -> SerialResult<Box<dyn Portable>> {
        match resolved {
            ResolvedType::Concrete { type_id, key } => {
                self.deserialize_with_entry(ctx, *type_id, key)
            }
            ResolvedType::Abstract { key } => Err(SerialError::NoCodecFound {
                type_key: key.to_string(),
                type_name: "<abstract>".to_string(),
            }),
            ResolvedType::Array { elem, rank } => {
                let offset = ctx.reader().position();
                let saved = ctx.swap_current_offset(offset);
                let result = array::deserialize_general(self, elem, *rank, ctx);
                ctx.swap_current_offset(saved);
                result
            }
        }
    }

    /// Decodes the body after a collapsed `ExpectedType` header.
    fn deserialize_expected(
        &self,
        ctx: &mut DeserializeContext<'_>,
        expected: TypeId,
    ) -> SerialResult<Box<dyn Portable>> {
        if expected == TypeId::of::<BareObject>() {
            return Ok(Box::new(BareObject));
        }
        if let Some(value) = array::read_blittable_expected(self, expected, ctx)? {
            return Ok(value);
        }
        if let Some(shape) = self.array_shape(expected) {
            let offset = ctx.reader().position();
            let saved = ctx.swap_current_offset(offset);
            let result = array::deserialize_shaped(self, shape, ctx);
            ctx.swap_current_offset(saved);
            return result;
        }
        let key = self
            .lookup_entry(expected)
            .map(|e| e.type_key().to_string())
            .unwrap_or_else(|| "<unregistered>".to_string());
        self.deserialize_with_entry(ctx, expected, &key)
    }

    /// Shared decode tail: mirrors the encode order of external over
    /// registered, and brackets the body with the saved object offset so
    /// nested reads cannot corrupt it.
    fn deserialize_with_entry(
        &self,
        ctx: &mut DeserializeContext<'_>,
        type_id: TypeId,
        key: &str,
    ) -> SerialResult<Box<dyn Portable>> {
        let offset = ctx.reader().position();
        let saved = ctx.swap_current_offset(offset);
        let result = if let Some(external) = self.find_external(type_id) {
            external.deserialize(Some(type_id), ctx)
        } else {
            match self.lookup_entry(type_id).and_then(|e| e.deserializer) {
                Some(deserializer) => deserializer(ctx),
                None => Err(SerialError::NoCodecFound {
                    type_key: key.to_string(),
                    type_name: "<no deserializer>".to_string(),
                }),
            }
        };
        ctx.swap_current_offset(saved);
        result
    }

    // -------------------------------------------------------------------------
    // Deep copy

    /// The copy tie-break order: shallow fastpath, the copy table, then
    /// external / registered / array / keyed / fallback.
    pub(crate) fn deep_copy_inner(
        &self,
        value: &dyn Portable,
        ctx: &mut CopyContext<'_>,
    ) -> SerialResult<Box<dyn Portable>> {
        // Statically shallow-copyable values pass through by value.
        if let Some(copy) = try_copy_simple(value) {
            return Ok(copy);
        }
        if let Some(copy) = array::try_copy_blittable(value) {
            return Ok(copy);
        }

        // A reference-typed value already copied stays shared.
        if let Some(identity) = value.shared_identity()
            && let Some(copy) = ctx.lookup_copy(identity)
        {
            return Ok(copy);
        }

        let type_id = value.concrete_type_id();

        if let Some(external) = self.find_external(type_id) {
            return external.copy(value, ctx);
        }

        let entry = self.lookup_entry(type_id);
        if let Some(e) = &entry
            && let Some(copier) = &e.copier
        {
            return copier(value, ctx);
        }

        if let Some(shape) = self.array_shape(type_id) {
            return array::copy_general(self, shape, value, ctx);
        }

        if let Some(keyed) = self.find_keyed(type_id) {
            return keyed.copy(value, ctx);
        }

        if self.fallback.supports_type(type_id) {
            let started = self.stats.is_enabled().then(Instant::now);
            let copy = self.fallback.copy(value, ctx)?;
            self.stats
                .record_fallback_copy(started.map(|s| s.elapsed()));
            return Ok(copy);
        }

        if let Some(fault) = value.as_fault() {
            return Ok(Box::new(fault));
        }

        Err(self.no_codec(entry.as_ref(), value))
    }
}

// -----------------------------------------------------------------------------
// Memoized first-match lookup

/// First-match lookup over an ordered serializer list, memoized per
/// type. An insert race is benign: first writer wins and both readers
/// observe the same entry.
fn find_memoized<S: ?Sized>(
    list: &[Arc<S>],
    memo: &RwLock<TypeIdMap<Memo>>,
    type_id: TypeId,
) -> Option<Arc<S>>
where
    Arc<S>: AsPluggable,
{
    if list.is_empty() {
        return None;
    }
    {
        let memo = memo.read().unwrap_or_else(PoisonError::into_inner);
        match memo.get(type_id) {
            Some(Memo::Hit(index)) => return Some(list[*index].clone()),
            Some(Memo::Miss) => return None,
            None => {}
        }
    }
    let answer = list
        .iter()
        .position(|candidate| candidate.as_pluggable().supports_type(type_id));
    let mut memo = memo.write().unwrap_or_else(PoisonError::into_inner);
    let stored = memo.get_or_insert(type_id, || match answer {
        Some(index) => Memo::Hit(index),
        None => Memo::Miss,
    });
    match *stored {
        Memo::Hit(index) => Some(list[index].clone()),
        Memo::Miss => None,
    }
}

/// Upcast helper so one memoized lookup serves both tiers.
trait AsPluggable {
    fn as_pluggable(&self) -> &dyn PluggableSerializer;
}

impl AsPluggable for Arc<dyn PluggableSerializer> {
    fn as_pluggable(&self) -> &dyn PluggableSerializer {
        &**self
    }
}

impl AsPluggable for Arc<dyn KeyedSerializer> {
    fn as_pluggable(&self) -> &dyn PluggableSerializer {
        &**self
    }
}
