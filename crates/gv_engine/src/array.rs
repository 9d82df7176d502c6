//! The array codec.
//!
//! Rank-1 arrays of the twelve blittable element types get dedicated
//! tokens and a bulk little-endian payload. Every other array — typed
//! `Vec<T>`, rank-N `MultiArray<T>` — takes the general path: a type
//! header naming the element key and rank, a rank byte, the dimension
//! lengths, then the elements in row-major order. Lower bounds are
//! always zero.

use core::any::TypeId;
use std::sync::Arc;

use gv_wire::{Token, WireError};

use crate::context::{CopyContext, DeserializeContext, SerializeContext};
use crate::engine::SerializationEngine;
use crate::error::{SerialError, SerialResult};
use crate::payload::Portable;
use crate::registry::entry::{ArrayFns, ArrayKind};
use crate::registry::{ArrayShape, ResolvedType};

// -----------------------------------------------------------------------------
// Blittable fastpath

macro_rules! blittable_arrays {
    ($( $ty:ty => $token:ident, $write:ident, $read:ident; )*) => {
        /// Writes a `Vec` of a blittable element type, if the value is
        /// one. The header is the array token itself, collapsed to
        /// `ExpectedType` when the static type matches.
        pub(crate) fn try_write_blittable(
            engine: &SerializationEngine,
            value: &dyn Portable,
            ctx: &mut SerializeContext<'_>,
            expected: Option<TypeId>,
        ) -> SerialResult<bool> {
            $(
                if let Some(arr) = value.downcast_ref::<Vec<$ty>>() {
                    if expected == Some(TypeId::of::<Vec<$ty>>()) {
                        ctx.writer().write_token(Token::ExpectedType);
                    } else {
                        ctx.writer().write_token(Token::SpecifiedType);
                        ctx.writer().write_token(Token::$token);
                    }
                    engine.note_allocation(arr.len() * size_of::<$ty>());
                    ctx.writer().write_u32(arr.len() as u32);
                    for item in arr {
                        ctx.writer().$write(*item);
                    }
                    return Ok(true);
                }
            )*
            Ok(false)
        }

        /// Reads the bulk payload after `SpecifiedType` plus an array
        /// token.
        pub(crate) fn read_blittable(
            engine: &SerializationEngine,
            token: Token,
            ctx: &mut DeserializeContext<'_>,
        ) -> SerialResult<Box<dyn Portable>> {
            match token {
                $(
                    Token::$token => {
                        let count = ctx.reader().read_len()?;
                        engine.note_allocation(count * size_of::<$ty>());
                        let mut items = Vec::with_capacity(count);
                        for _ in 0..count {
                            items.push(ctx.reader().$read()?);
                        }
                        Ok(Box::new(items) as Box<dyn Portable>)
                    }
                )*
                other => {
                    let position = ctx.reader().position();
                    Err(SerialError::UnexpectedToken { token: other, position })
                }
            }
        }

        /// Reads the bulk payload after a collapsed header, when the
        /// expected type is a blittable `Vec`.
        pub(crate) fn read_blittable_expected(
            engine: &SerializationEngine,
            expected: TypeId,
            ctx: &mut DeserializeContext<'_>,
        ) -> SerialResult<Option<Box<dyn Portable>>> {
            $(
                if expected == TypeId::of::<Vec<$ty>>() {
                    return read_blittable(engine, Token::$token, ctx).map(Some);
                }
            )*
            Ok(None)
        }

        /// Bulk-copies a blittable `Vec`, if the value is one.
        pub(crate) fn try_copy_blittable(value: &dyn Portable) -> Option<Box<dyn Portable>> {
            $(
                if let Some(arr) = value.downcast_ref::<Vec<$ty>>() {
                    return Some(Box::new(arr.clone()) as Box<dyn Portable>);
                }
            )*
            None
        }
    };
}

blittable_arrays! {
    u8 => ByteArray, write_u8, read_u8;
    i8 => SByteArray, write_i8, read_i8;
    bool => BoolArray, write_bool, read_bool;
    char => CharArray, write_char, read_char;
    i16 => ShortArray, write_i16, read_i16;
    u16 => UShortArray, write_u16, read_u16;
    i32 => IntArray, write_i32, read_i32;
    u32 => UIntArray, write_u32, read_u32;
    i64 => LongArray, write_i64, read_i64;
    u64 => ULongArray, write_u64, read_u64;
    f32 => FloatArray, write_f32, read_f32;
    f64 => DoubleArray, write_f64, read_f64;
}

// -----------------------------------------------------------------------------
// General path

fn array_key(elem_key: &str, rank: usize) -> String {
    let mut key = String::with_capacity(elem_key.len() + rank + 1);
    key.push_str(elem_key);
    key.push('[');
    for _ in 1..rank {
        key.push(',');
    }
    key.push(']');
    key
}

fn fns_for_element(engine: &SerializationEngine, elem: TypeId) -> Arc<ArrayFns> {
    engine
        .lookup_entry(elem)
        .and_then(|entry| entry.array_fns)
        .expect("array shapes are planted only by element registrations")
}

/// Serializes a typed array: header, rank byte, dimension lengths,
/// elements.
pub(crate) fn serialize_general(
    engine: &SerializationEngine,
    shape: ArrayShape,
    value: &dyn Portable,
    ctx: &mut SerializeContext<'_>,
    expected: Option<TypeId>,
) -> SerialResult<()> {
    let elem_entry = engine
        .lookup_entry(shape.elem)
        .expect("array shapes are planted only by element registrations");
    let fns = elem_entry
        .array_fns
        .clone()
        .expect("registered elements carry array fns");

    let dims = (fns.dims_of)(value);
    let rank = dims.len();

    if expected == Some(value.concrete_type_id()) {
        ctx.writer().write_token(Token::ExpectedType);
    } else {
        ctx.writer().write_token(Token::SpecifiedType);
        ctx.writer().write_token(Token::NamedType);
        ctx.writer().write_str(&array_key(&elem_entry.type_key, rank));
    }

    ctx.writer().write_u8(rank as u8);
    for dim in &dims {
        ctx.writer().write_u32(*dim);
    }
    (fns.serialize_elements)(value, ctx)
}

fn read_general_body(
    fns: &ArrayFns,
    expected_rank: Option<usize>,
    ctx: &mut DeserializeContext<'_>,
) -> SerialResult<Box<dyn Portable>> {
    let rank = ctx.reader().read_u8()? as usize;
    if rank == 0 {
        return Err(SerialError::ArrayRankMismatch {
            expected: expected_rank.unwrap_or(1),
            actual: 0,
        });
    }
    if let Some(expected) = expected_rank
        && expected != rank
    {
        return Err(SerialError::ArrayRankMismatch {
            expected,
            actual: rank,
        });
    }

    let mut dims = Vec::with_capacity(rank);
    for _ in 0..rank {
        dims.push(ctx.reader().read_u32()?);
    }

    // Each element takes at least one byte; anything claiming more is a
    // corrupt stream, not an allocation request.
    let count = dims
        .iter()
        .try_fold(1_u64, |acc, &d| acc.checked_mul(u64::from(d)))
        .unwrap_or(u64::MAX);
    let remaining = ctx.reader().remaining();
    if count > remaining as u64 {
        return Err(SerialError::Wire(WireError::BadLength {
            length: count.min(u64::from(u32::MAX)) as u32,
            remaining,
        }));
    }

    if rank == 1 {
        (fns.deserialize_vec)(count as usize, ctx)
    } else {
        (fns.deserialize_multi)(dims, ctx)
    }
}

/// Decodes a general array announced by a full type header.
pub(crate) fn deserialize_general(
    engine: &SerializationEngine,
    elem: &ResolvedType,
    rank: usize,
    ctx: &mut DeserializeContext<'_>,
) -> SerialResult<Box<dyn Portable>> {
    let elem_tid = elem.type_id().ok_or_else(|| SerialError::NoCodecFound {
        type_key: elem.key(),
        type_name: "<abstract array element>".to_string(),
    })?;
    let fns = fns_for_element(engine, elem_tid);
    read_general_body(&fns, Some(rank), ctx)
}

/// Decodes a general array announced by a collapsed header, driven by
/// the expected container type.
pub(crate) fn deserialize_shaped(
    engine: &SerializationEngine,
    shape: ArrayShape,
    ctx: &mut DeserializeContext<'_>,
) -> SerialResult<Box<dyn Portable>> {
    let fns = fns_for_element(engine, shape.elem);
    let expected_rank = match shape.kind {
        ArrayKind::Vec => Some(1),
        ArrayKind::Multi => None,
    };
    read_general_body(&fns, expected_rank, ctx)
}

/// Deep-copies a typed array: whole-array clone when the elements are
/// shallow-copyable, element-wise copy otherwise.
pub(crate) fn copy_general(
    engine: &SerializationEngine,
    shape: ArrayShape,
    value: &dyn Portable,
    ctx: &mut CopyContext<'_>,
) -> SerialResult<Box<dyn Portable>> {
    let elem_entry = engine
        .lookup_entry(shape.elem)
        .expect("array shapes are planted only by element registrations");
    let fns = elem_entry
        .array_fns
        .clone()
        .expect("registered elements carry array fns");

    if elem_entry.shallow
        && let Some(clone_whole) = &fns.clone_whole
    {
        return Ok(clone_whole(value));
    }
    (fns.copy_elements)(value, ctx)
}
