//! Typed constructors for the registry feed.
//!
//! Everything here monomorphizes user closures into the erased codec
//! triples the registry stores, and plants the specialization seeds —
//! `Option<T>`, `Shared<T>`, and typed arrays — that let closed generics
//! over a registered type materialize lazily.
//!
//! Specialization reaches one container level per explicit registration:
//! registering `T` covers `Option<T>`, `Vec<T>` and `MultiArray<T>`
//! (plus `Shared<T>` via [`Registration::sharable`]); a nested container
//! such as `Vec<Vec<T>>` needs its inner container registered
//! explicitly. That boundary is where compile-time monomorphization
//! stops.

use core::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::{CopyContext, DeserializeContext, SerializeContext};
use crate::error::{SerialError, SerialResult};
use crate::payload::{
    BareObject, DynSeq, Fault, MultiArray, Portable, Shared, box_simple, try_as_simple,
};
use crate::registry::entry::{
    ArrayFns, ArrayKind, CodecEntry, CopyFn, EnumKind, FamilySeed, OptionFns, Registration,
};

// -----------------------------------------------------------------------------
// Typed helpers

fn downcast_or_panic<'v, T: Portable>(value: &'v dyn Portable, role: &str) -> &'v T {
    match value.downcast_ref::<T>() {
        Some(v) => v,
        None => panic!(
            "{role} type mismatched: expected `{}`, got `{}`",
            core::any::type_name::<T>(),
            value.type_name(),
        ),
    }
}

fn take_or_mismatch<T: Portable>(boxed: Box<dyn Portable>) -> SerialResult<T> {
    boxed.take::<T>().map_err(|actual| SerialError::TypeMismatch {
        expected: core::any::type_name::<T>(),
        actual: actual.type_name().to_string(),
    })
}

// -----------------------------------------------------------------------------
// Public constructors

/// A full codec registration for a record type: the copier / serializer
/// / deserializer triple, typed.
pub fn record<T: Portable>(
    key: &str,
    copier: impl Fn(&T, &mut CopyContext<'_>) -> SerialResult<T> + Send + Sync + 'static,
    serializer: impl Fn(&T, &mut SerializeContext<'_>) -> SerialResult<()> + Send + Sync + 'static,
    deserializer: impl Fn(&mut DeserializeContext<'_>) -> SerialResult<T> + Send + Sync + 'static,
) -> Registration {
    let mut entry = CodecEntry::new::<T>(Arc::from(key));
    entry.copier = Some(Arc::new(move |value, ctx| {
        let concrete = downcast_or_panic::<T>(value, "copier");
        Ok(Box::new(copier(concrete, ctx)?) as Box<dyn Portable>)
    }));
    entry.serializer = Some(Arc::new(move |value, ctx| {
        serializer(downcast_or_panic::<T>(value, "serializer"), ctx)
    }));
    entry.deserializer = Some(Arc::new(move |ctx| {
        Ok(Box::new(deserializer(ctx)?) as Box<dyn Portable>)
    }));
    seeded::<T>(entry)
}

/// A registration for an immutable type: serialized normally, but deep
/// copy shares the value via `Clone` instead of walking it.
pub fn immutable<T: Portable + Clone>(
    key: &str,
    serializer: impl Fn(&T, &mut SerializeContext<'_>) -> SerialResult<()> + Send + Sync + 'static,
    deserializer: impl Fn(&mut DeserializeContext<'_>) -> SerialResult<T> + Send + Sync + 'static,
) -> Registration {
    let mut reg = record::<T>(key, |v, _| Ok(v.clone()), serializer, deserializer).shallow();
    reg.entry.array_fns = Some(Arc::new(make_array_fns::<T>(whole_clone::<T>())));
    reg
}

/// A registration for a copier-only type: deep-copyable in-process,
/// never transmitted.
pub fn copy_only<T: Portable>(
    key: &str,
    copier: impl Fn(&T, &mut CopyContext<'_>) -> SerialResult<T> + Send + Sync + 'static,
) -> Registration {
    let mut entry = CodecEntry::new::<T>(Arc::from(key));
    entry.copier = Some(Arc::new(move |value, ctx| {
        let concrete = downcast_or_panic::<T>(value, "copier");
        Ok(Box::new(copier(concrete, ctx)?) as Box<dyn Portable>)
    }));
    seeded::<T>(entry)
}

/// A registration for an enum with an explicit underlying width.
///
/// On the wire an enum is its type header followed by the underlying
/// integer. `to_raw` and `from_raw` bridge the discriminant;
/// a raw value outside the declared width fails the operation, and an
/// unknown discriminant fails decode.
pub fn enum_codec<T: Portable + Copy>(
    key: &str,
    kind: EnumKind,
    to_raw: impl Fn(&T) -> i64 + Send + Sync + 'static,
    from_raw: impl Fn(i64) -> Option<T> + Send + Sync + 'static,
) -> Registration {
    use gv_wire::SimpleValue;

    let ser_key: Arc<str> = Arc::from(key);
    let de_key = ser_key.clone();

    let mut entry = CodecEntry::new::<T>(Arc::from(key));
    entry.enum_kind = Some(kind);
    entry.shallow = true;
    entry.copier = Some(Arc::new(|value, _ctx| {
        Ok(Box::new(*downcast_or_panic::<T>(value, "copier")) as Box<dyn Portable>)
    }));
    entry.serializer = Some(Arc::new(move |value, ctx| {
        let raw = to_raw(downcast_or_panic::<T>(value, "serializer"));
        if !kind.fits(raw) {
            return Err(SerialError::EnumValueOutOfRange {
                type_key: ser_key.to_string(),
                value: raw,
            });
        }
        let simple = match kind {
            EnumKind::Byte => SimpleValue::Byte(raw as u8),
            EnumKind::Short => SimpleValue::Short(raw as i16),
            EnumKind::Int => SimpleValue::Int(raw as i32),
            EnumKind::Long => SimpleValue::Long(raw),
        };
        ctx.writer().write_simple(&simple);
        Ok(())
    }));
    entry.deserializer = Some(Arc::new(move |ctx| {
        let simple = read_required_simple(ctx)?;
        let raw = match (kind, &simple) {
            (EnumKind::Byte, SimpleValue::Byte(v)) => i64::from(*v),
            (EnumKind::Short, SimpleValue::Short(v)) => i64::from(*v),
            (EnumKind::Int, SimpleValue::Int(v)) => i64::from(*v),
            (EnumKind::Long, SimpleValue::Long(v)) => *v,
            _ => {
                return Err(SerialError::TypeMismatch {
                    expected: core::any::type_name::<T>(),
                    actual: format!("{simple:?}"),
                });
            }
        };
        match from_raw(raw) {
            Some(value) => Ok(Box::new(value) as Box<dyn Portable>),
            None => Err(SerialError::UnknownEnumValue {
                type_key: de_key.to_string(),
                value: raw,
            }),
        }
    }));

    let mut reg = seeded::<T>(entry);
    reg.entry.array_fns = Some(Arc::new(make_array_fns::<T>(whole_clone::<T>())));
    reg
}

/// A registration for a map. Entries travel as key/value pairs after a
/// 4-byte count; both sides encode against their statically-known types.
pub fn map_of<K, V>(key: &str) -> Registration
where
    K: Portable + Eq + core::hash::Hash,
    V: Portable,
{
    record::<HashMap<K, V>>(
        key,
        |map, ctx| {
            let mut copy = HashMap::with_capacity(map.len());
            for (k, v) in map {
                copy.insert(
                    take_or_mismatch::<K>(ctx.copy_item(k)?)?,
                    take_or_mismatch::<V>(ctx.copy_item(v)?)?,
                );
            }
            Ok(copy)
        },
        |map, ctx| {
            ctx.writer().write_u32(map.len() as u32);
            for (k, v) in map {
                ctx.serialize_item(k, Some(TypeId::of::<K>()))?;
                ctx.serialize_item(v, Some(TypeId::of::<V>()))?;
            }
            Ok(())
        },
        |ctx| {
            let count = ctx.reader().read_u32()?;
            let mut map = HashMap::new();
            for _ in 0..count {
                let k = ctx.deserialize_value::<K>()?;
                let v = ctx.deserialize_value::<V>()?;
                map.insert(k, v);
            }
            Ok(map)
        },
    )
}

// -----------------------------------------------------------------------------
// Codec providers

/// A typed copier supplied by a [`CodecProvider`].
pub type TypedCopy<T> = Box<dyn Fn(&T, &mut CopyContext<'_>) -> SerialResult<T> + Send + Sync>;
/// A typed serializer supplied by a [`CodecProvider`].
pub type TypedSerialize<T> =
    Box<dyn Fn(&T, &mut SerializeContext<'_>) -> SerialResult<()> + Send + Sync>;
/// A typed deserializer supplied by a [`CodecProvider`].
pub type TypedDeserialize<T> =
    Box<dyn Fn(&mut DeserializeContext<'_>) -> SerialResult<T> + Send + Sync>;

/// A serializer type: a standalone type that carries the codec methods
/// for some target type, discovered through this trait rather than
/// reflection. Unimplemented hooks stay `None`.
pub trait CodecProvider<T: Portable>: 'static {
    const TYPE_KEY: &'static str;

    fn copier() -> Option<TypedCopy<T>> {
        None
    }

    fn serializer() -> Option<TypedSerialize<T>> {
        None
    }

    fn deserializer() -> Option<TypedDeserialize<T>> {
        None
    }
}

/// Builds the registration a [`CodecProvider`] describes.
///
/// A provider exposing no codec at all is a registration error.
pub fn from_provider<T: Portable, P: CodecProvider<T>>() -> SerialResult<Registration> {
    let copier = P::copier();
    let serializer = P::serializer();
    let deserializer = P::deserializer();

    if copier.is_none() && serializer.is_none() && deserializer.is_none() {
        return Err(SerialError::EmptyRegistration {
            type_key: P::TYPE_KEY.to_string(),
        });
    }

    let mut entry = CodecEntry::new::<T>(Arc::from(P::TYPE_KEY));
    if let Some(f) = copier {
        entry.copier = Some(Arc::new(move |value, ctx| {
            let concrete = downcast_or_panic::<T>(value, "copier");
            Ok(Box::new(f(concrete, ctx)?) as Box<dyn Portable>)
        }));
    }
    if let Some(f) = serializer {
        entry.serializer = Some(Arc::new(move |value, ctx| {
            f(downcast_or_panic::<T>(value, "serializer"), ctx)
        }));
    }
    if let Some(f) = deserializer {
        entry.deserializer =
            Some(Arc::new(move |ctx| Ok(Box::new(f(ctx)?) as Box<dyn Portable>)));
    }
    Ok(seeded::<T>(entry))
}

// -----------------------------------------------------------------------------
// Seeding

/// Wraps a bare entry into a [`Registration`] carrying the standard
/// specialization seeds for its type.
pub(crate) fn seeded<T: Portable>(mut entry: CodecEntry) -> Registration {
    if entry.array_fns.is_none() {
        entry.array_fns = Some(Arc::new(make_array_fns::<T>(None)));
    }
    let key = entry.type_key.clone();
    let elem = entry.type_id;
    Registration {
        entry,
        marker_keys: Vec::new(),
        overwrite: false,
        seeds: vec![option_seed::<T>(&key)],
        array_kinds: vec![
            (TypeId::of::<Vec<T>>(), elem, ArrayKind::Vec),
            (TypeId::of::<MultiArray<T>>(), elem, ArrayKind::Multi),
        ],
    }
}

pub(crate) fn option_seed<T: Portable>(key: &str) -> FamilySeed {
    let closed_key: Arc<str> = Arc::from(format!("option<{key}>"));
    FamilySeed {
        closed_key: closed_key.clone(),
        concrete_type: TypeId::of::<Option<T>>(),
        make: Arc::new(move || option_entry::<T>(closed_key.clone())),
    }
}

fn option_entry<T: Portable>(closed_key: Arc<str>) -> Registration {
    let mut entry = CodecEntry::new::<Option<T>>(closed_key);
    entry.option_fns = Some(Arc::new(OptionFns {
        inner: TypeId::of::<T>(),
        make_none: Box::new(|| Box::new(Option::<T>::None)),
        wrap_some: Box::new(|boxed| {
            Ok(Box::new(Some(take_or_mismatch::<T>(boxed)?)) as Box<dyn Portable>)
        }),
    }));
    entry.copier = Some(Arc::new(|value, ctx| {
        match downcast_or_panic::<Option<T>>(value, "copier") {
            None => Ok(Box::new(Option::<T>::None) as Box<dyn Portable>),
            Some(inner) => {
                let copy = take_or_mismatch::<T>(ctx.copy_item(inner)?)?;
                Ok(Box::new(Some(copy)) as Box<dyn Portable>)
            }
        }
    }));
    Registration {
        entry,
        marker_keys: Vec::new(),
        overwrite: false,
        seeds: Vec::new(),
        array_kinds: Vec::new(),
    }
}

pub(crate) fn shared_seed<T: Portable + Default>(key: &str) -> FamilySeed {
    let closed_key: Arc<str> = Arc::from(format!("shared<{key}>"));
    FamilySeed {
        closed_key: closed_key.clone(),
        concrete_type: TypeId::of::<Shared<T>>(),
        make: Arc::new(move || shared_entry::<T>(closed_key.clone())),
    }
}

fn shared_entry<T: Portable + Default>(closed_key: Arc<str>) -> Registration {
    let mut entry = CodecEntry::new::<Shared<T>>(closed_key);
    entry.array_fns = Some(Arc::new(make_array_fns::<Shared<T>>(None)));
    entry.serializer = Some(Arc::new(|value, ctx| {
        let shared = downcast_or_panic::<Shared<T>>(value, "serializer");
        let guard = shared.try_borrow().map_err(SerialError::codec)?;
        ctx.serialize_item(&*guard, Some(TypeId::of::<T>()))
    }));
    entry.deserializer = Some(Arc::new(|ctx| {
        // Publish the empty cell first so the body's own references,
        // cycles included, resolve to it.
        let handle = Shared::new(T::default());
        let cloner = {
            let handle = handle.clone();
            Box::new(move || Box::new(handle.clone()) as Box<dyn Portable>)
        };
        ctx.record_current(cloner);
        let inner = ctx.deserialize_value::<T>()?;
        handle.replace(inner);
        Ok(Box::new(handle) as Box<dyn Portable>)
    }));
    entry.copier = Some(Arc::new(|value, ctx| {
        let shared = downcast_or_panic::<Shared<T>>(value, "copier");
        let copy = Shared::new(T::default());
        let cloner = {
            let copy = copy.clone();
            Box::new(move || Box::new(copy.clone()) as Box<dyn Portable>)
        };
        ctx.record_copy(shared.identity(), cloner);
        let guard = shared.try_borrow().map_err(SerialError::codec)?;
        let inner = take_or_mismatch::<T>(ctx.copy_item(&*guard)?)?;
        drop(guard);
        copy.replace(inner);
        Ok(Box::new(copy) as Box<dyn Portable>)
    }));
    Registration {
        entry,
        marker_keys: Vec::new(),
        overwrite: false,
        seeds: Vec::new(),
        array_kinds: Vec::new(),
    }
}

// -----------------------------------------------------------------------------
// Array vtables

fn whole_clone<T: Portable + Clone>()
-> Option<Box<dyn Fn(&dyn Portable) -> Box<dyn Portable> + Send + Sync>> {
    Some(Box::new(|value| {
        if let Some(v) = value.downcast_ref::<Vec<T>>() {
            Box::new(v.clone()) as Box<dyn Portable>
        } else {
            let m = downcast_or_panic::<MultiArray<T>>(value, "array clone");
            Box::new(m.clone()) as Box<dyn Portable>
        }
    }))
}

pub(crate) fn make_array_fns<T: Portable>(
    clone_whole: Option<Box<dyn Fn(&dyn Portable) -> Box<dyn Portable> + Send + Sync>>,
) -> ArrayFns {
    ArrayFns {
        dims_of: Box::new(|value| {
            if let Some(v) = value.downcast_ref::<Vec<T>>() {
                vec![v.len() as u32]
            } else {
                downcast_or_panic::<MultiArray<T>>(value, "array codec")
                    .dims()
                    .to_vec()
            }
        }),
        serialize_elements: Box::new(|value, ctx| {
            let expected = Some(TypeId::of::<T>());
            let items: &[T] = if let Some(v) = value.downcast_ref::<Vec<T>>() {
                v
            } else {
                downcast_or_panic::<MultiArray<T>>(value, "array codec").items()
            };
            for item in items {
                ctx.serialize_item(item, expected)?;
            }
            Ok(())
        }),
        deserialize_vec: Box::new(|count, ctx| {
            ctx.engine().note_allocation(count * size_of::<T>());
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(ctx.deserialize_value::<T>()?);
            }
            Ok(Box::new(items) as Box<dyn Portable>)
        }),
        deserialize_multi: Box::new(|dims, ctx| {
            let count: usize = dims.iter().map(|&d| d as usize).product();
            ctx.engine().note_allocation(count * size_of::<T>());
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(ctx.deserialize_value::<T>()?);
            }
            Ok(Box::new(MultiArray::new(dims, items)) as Box<dyn Portable>)
        }),
        copy_elements: Arc::new(|value, ctx| {
            if let Some(v) = value.downcast_ref::<Vec<T>>() {
                let mut items = Vec::with_capacity(v.len());
                for item in v {
                    items.push(take_or_mismatch::<T>(ctx.copy_item(item)?)?);
                }
                Ok(Box::new(items) as Box<dyn Portable>)
            } else {
                let m = downcast_or_panic::<MultiArray<T>>(value, "array codec");
                let mut items = Vec::with_capacity(m.items().len());
                for item in m.items() {
                    items.push(take_or_mismatch::<T>(ctx.copy_item(item)?)?);
                }
                Ok(Box::new(MultiArray::new(m.dims().to_vec(), items)) as Box<dyn Portable>)
            }
        }),
        clone_whole,
    }
}

// -----------------------------------------------------------------------------
// Builtins

fn read_required_simple(ctx: &mut DeserializeContext<'_>) -> SerialResult<gv_wire::SimpleValue> {
    let position = ctx.reader().position();
    match ctx.reader().try_read_simple()? {
        Some(simple) => Ok(simple),
        None => {
            let token = ctx.reader().peek_token()?;
            Err(SerialError::UnexpectedToken { token, position })
        }
    }
}

/// A builtin registration for a type with an inline token.
fn simple<T: Portable + Clone + PartialEq>(key: &str) -> Registration {
    let mut reg = record::<T>(
        key,
        |v, _| Ok(v.clone()),
        |v, ctx| {
            let simple = try_as_simple(v).expect("builtin simple type has an inline token");
            ctx.writer().write_simple(&simple);
            Ok(())
        },
        |ctx| {
            let simple = read_required_simple(ctx)?;
            take_or_mismatch::<T>(box_simple(simple))
        },
    )
    .shallow();
    reg.entry.array_fns = Some(Arc::new(make_array_fns::<T>(whole_clone::<T>())));
    reg
}

fn bare_object() -> Registration {
    record::<BareObject>(
        "object",
        |_, _| Ok(BareObject),
        |_, _| Ok(()),
        |_| Ok(BareObject),
    )
    .shallow()
}

fn fault() -> Registration {
    record::<Fault>(
        "fault",
        |f, _| Ok(f.clone()),
        |f, ctx| {
            ctx.writer().write_str(&f.type_name);
            ctx.writer().write_str(&f.message);
            ctx.writer().write_str(&f.stack);
            Ok(())
        },
        |ctx| {
            Ok(Fault {
                type_name: ctx.reader().read_str()?,
                message: ctx.reader().read_str()?,
                stack: ctx.reader().read_str()?,
            })
        },
    )
    .shallow()
}

fn dyn_seq() -> Registration {
    record::<DynSeq>(
        "object[]",
        |seq, ctx| {
            let mut items = Vec::with_capacity(seq.len());
            for item in seq.iter() {
                items.push(ctx.copy_item(item)?);
            }
            Ok(DynSeq::from(items))
        },
        |seq, ctx| {
            ctx.writer().write_u8(1);
            ctx.writer().write_u32(seq.len() as u32);
            for item in seq.iter() {
                ctx.serialize_item(item, None)?;
            }
            Ok(())
        },
        |ctx| {
            let rank = ctx.reader().read_u8()?;
            if rank != 1 {
                return Err(SerialError::ArrayRankMismatch {
                    expected: 1,
                    actual: rank as usize,
                });
            }
            let count = ctx.reader().read_len()?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(ctx.deserialize_item(None)?);
            }
            Ok(DynSeq::from(items))
        },
    )
}

/// The registrations every engine starts from: the simple types, the
/// sentinels, faults, and the dynamic sequence.
pub(crate) fn builtin_registrations() -> Vec<Registration> {
    use gv_wire::chrono::TimeDelta;
    use gv_wire::rust_decimal::Decimal;
    use gv_wire::uuid::Uuid;
    use gv_wire::WireDate;

    vec![
        simple::<bool>("bool"),
        simple::<u8>("byte"),
        simple::<i8>("sbyte"),
        simple::<i16>("short"),
        simple::<u16>("ushort"),
        simple::<i32>("int"),
        simple::<u32>("uint"),
        simple::<i64>("long"),
        simple::<u64>("ulong"),
        simple::<f32>("float"),
        simple::<f64>("double"),
        simple::<Decimal>("decimal"),
        simple::<char>("char"),
        simple::<String>("string"),
        simple::<Uuid>("guid"),
        simple::<WireDate>("date"),
        simple::<TimeDelta>("timespan"),
        bare_object(),
        fault(),
        dyn_seq(),
    ]
}
