use core::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use gv_wire::Token;

use crate::codecs::{self, CodecProvider, TypedSerialize};
use crate::context::{CopyContext, DeserializeContext, SerializeContext};
use crate::engine::{EngineBuilder, SerializationEngine};
use crate::error::{SerialError, SerialResult};
use crate::payload::{DynSeq, Fault, MultiArray, NullValue, Portable, Shared};
use crate::pluggable::{KeyedSerializer, PluggableSerializer};
use crate::registry::{EnumKind, KnownTypeEntry, Registration, ResolvedType};
use crate::stats::SerializationStatistics;

// -----------------------------------------------------------------------------
// Fixtures

#[derive(Debug, Clone, PartialEq, Default)]
struct Point {
    x: i32,
    y: i32,
}

crate::impl_portable!(Point);

fn point_registration() -> Registration {
    codecs::record::<Point>(
        "point",
        |p, _| Ok(p.clone()),
        |p, ctx| {
            ctx.writer().write_i32(p.x);
            ctx.writer().write_i32(p.y);
            Ok(())
        },
        |ctx| {
            Ok(Point {
                x: ctx.reader().read_i32()?,
                y: ctx.reader().read_i32()?,
            })
        },
    )
}

#[derive(Debug, Default)]
struct Node {
    name: String,
    next: Option<Shared<Node>>,
}

crate::impl_portable!(Node);

fn node_registration() -> Registration {
    codecs::record::<Node>(
        "node",
        |n, ctx| {
            let next = ctx
                .copy_item(&n.next)?
                .take::<Option<Shared<Node>>>()
                .expect("copying an option yields an option");
            Ok(Node {
                name: n.name.clone(),
                next,
            })
        },
        |n, ctx| {
            ctx.writer().write_str(&n.name);
            ctx.serialize_item(&n.next, Some(TypeId::of::<Option<Shared<Node>>>()))
        },
        |ctx| {
            Ok(Node {
                name: ctx.reader().read_str()?,
                next: ctx.deserialize_value::<Option<Shared<Node>>>()?,
            })
        },
    )
    .sharable::<Node>()
}

fn engine() -> SerializationEngine {
    EngineBuilder::new()
        .register(point_registration())
        .register(node_registration())
        .register(codecs::map_of::<i32, String>("map<int,string>"))
        .build()
        .unwrap()
}

// -----------------------------------------------------------------------------
// Round-trip identity

#[test]
fn simple_values_round_trip() {
    let engine = engine();
    assert_eq!(engine.round_trip(&42_i32).unwrap(), 42);
    assert_eq!(engine.round_trip(&true).unwrap(), true);
    assert_eq!(engine.round_trip(&'Ω').unwrap(), 'Ω');
    assert_eq!(
        engine.round_trip(&String::from("hello")).unwrap(),
        "hello"
    );
    assert_eq!(engine.round_trip(&-1.5_f64).unwrap(), -1.5);
    assert_eq!(engine.round_trip(&u64::MAX).unwrap(), u64::MAX);
}

#[test]
fn registered_records_round_trip() {
    let engine = engine();
    let point = Point { x: -7, y: 2_000 };
    assert_eq!(engine.round_trip(&point).unwrap(), point);
    assert_eq!(engine.round_trip(&Some(point.clone())).unwrap(), Some(point));
    assert_eq!(engine.round_trip(&Option::<Point>::None).unwrap(), None);
}

#[test]
fn maps_round_trip() {
    let engine = engine();
    let mut map = HashMap::new();
    map.insert(1, String::from("one"));
    map.insert(2, String::from("two"));
    assert_eq!(engine.round_trip(&map).unwrap(), map);
}

#[test]
fn typed_vectors_round_trip() {
    let engine = engine();
    let points = vec![Point { x: 1, y: 2 }, Point { x: 3, y: 4 }];
    assert_eq!(engine.round_trip(&points).unwrap(), points);

    let strings = vec![String::from("a"), String::new(), String::from("c")];
    assert_eq!(engine.round_trip(&strings).unwrap(), strings);
}

#[test]
fn multi_arrays_round_trip() {
    let engine = engine();
    let grid = MultiArray::new(vec![2, 3], (0..6).collect::<Vec<i32>>());
    assert_eq!(engine.round_trip(&grid).unwrap(), grid);

    let cube = MultiArray::new(vec![2, 2, 2], (0..8).map(Point::default_with).collect());
    assert_eq!(engine.round_trip(&cube).unwrap(), cube);
}

impl Point {
    fn default_with(x: i32) -> Point {
        Point { x, y: -x }
    }
}

#[test]
fn deep_copy_equals_but_is_distinct() {
    let engine = engine();

    let point = Point { x: 5, y: 6 };
    assert_eq!(engine.deep_copy_value(&point).unwrap(), point);

    let shared = Shared::new(Node {
        name: "only".into(),
        next: None,
    });
    let copy = engine.deep_copy_value(&shared).unwrap();
    assert_eq!(copy.borrow().name, "only");
    assert!(!copy.ptr_eq(&shared));
}

// -----------------------------------------------------------------------------
// Cycles and sharing

#[test]
fn self_cycle_round_trips() {
    let engine = engine();

    let node = Shared::new(Node {
        name: "loop".into(),
        next: None,
    });
    node.borrow_mut().next = Some(node.clone());

    let bytes = engine.serialize(&node).unwrap();
    let decoded: Shared<Node> = engine.deserialize(&bytes).unwrap();

    assert_eq!(decoded.borrow().name, "loop");
    let next = decoded.borrow().next.clone().unwrap();
    assert!(next.ptr_eq(&decoded));
}

#[test]
fn cycle_byte_stream_ends_with_a_reference() {
    let engine = engine();
    let node = Shared::new(Node {
        name: String::new(),
        next: None,
    });
    node.borrow_mut().next = Some(node.clone());

    let bytes = engine.serialize(&node).unwrap();
    // The cycle closes with a Reference token plus the 4-byte offset of
    // the node's body.
    assert_eq!(bytes[bytes.len() - 5], Token::Reference.as_u8());
}

#[test]
fn sharing_is_preserved() {
    let engine = engine();

    let a = Shared::new(Node {
        name: "a".into(),
        next: None,
    });
    let b = Shared::new(Node {
        name: "b".into(),
        next: None,
    });
    let list = vec![a.clone(), a.clone(), b.clone()];

    let decoded: Vec<Shared<Node>> = engine.round_trip(&list).unwrap();
    assert_eq!(decoded.len(), 3);
    assert!(decoded[0].ptr_eq(&decoded[1]));
    assert!(!decoded[0].ptr_eq(&decoded[2]));
    assert_eq!(decoded[2].borrow().name, "b");

    // The same holds for deep copy, with fresh identities.
    let copied: Vec<Shared<Node>> = engine.deep_copy_value(&list).unwrap();
    assert!(copied[0].ptr_eq(&copied[1]));
    assert!(!copied[0].ptr_eq(&copied[2]));
    assert!(!copied[0].ptr_eq(&a));
}

#[test]
fn shared_copies_preserve_cycles() {
    let engine = engine();
    let node = Shared::new(Node {
        name: "ring".into(),
        next: None,
    });
    node.borrow_mut().next = Some(node.clone());

    let copy: Shared<Node> = engine.deep_copy_value(&node).unwrap();
    assert!(!copy.ptr_eq(&node));
    let next = copy.borrow().next.clone().unwrap();
    assert!(next.ptr_eq(&copy));
}

// -----------------------------------------------------------------------------
// Byte-exact scenarios

#[test]
fn null_scenario() {
    let engine = engine();
    let bytes = engine.serialize(&Option::<i32>::None).unwrap();
    assert_eq!(bytes, vec![Token::Null.as_u8()]);
    assert_eq!(engine.deserialize::<Option<i32>>(&bytes).unwrap(), None);
}

#[test]
fn int_scenario() {
    let engine = engine();
    let bytes = engine.serialize(&42_i32).unwrap();
    assert_eq!(bytes, vec![Token::Int.as_u8(), 0x2A, 0, 0, 0]);
    assert_eq!(engine.deserialize::<i32>(&bytes).unwrap(), 42);
}

#[test]
fn string_scenario() {
    let engine = engine();
    let bytes = engine.serialize(&String::from("hello")).unwrap();
    let mut expected = vec![Token::String.as_u8(), 5, 0, 0, 0];
    expected.extend_from_slice(b"hello");
    assert_eq!(bytes, expected);
    assert_eq!(engine.deserialize::<String>(&bytes).unwrap(), "hello");
}

#[test]
fn byte_array_scenario() {
    let engine = engine();
    let bytes = engine.serialize(&vec![1_u8, 2, 3]).unwrap();
    assert_eq!(
        bytes,
        vec![
            Token::SpecifiedType.as_u8(),
            Token::ByteArray.as_u8(),
            3,
            0,
            0,
            0,
            1,
            2,
            3,
        ]
    );
    assert_eq!(engine.deserialize::<Vec<u8>>(&bytes).unwrap(), [1, 2, 3]);
}

#[test]
fn every_blittable_array_is_bulk_encoded() {
    let engine = engine();

    macro_rules! check {
        ($ty:ty, $token:ident, $values:expr, $payload:expr) => {{
            let values: Vec<$ty> = $values;
            let bytes = engine.serialize(&values).unwrap();
            let mut expected = vec![
                Token::SpecifiedType.as_u8(),
                Token::$token.as_u8(),
                values.len() as u8,
                0,
                0,
                0,
            ];
            expected.extend_from_slice(&$payload);
            assert_eq!(bytes, expected, "wire shape of Vec<{}>", stringify!($ty));
            assert_eq!(engine.deserialize::<Vec<$ty>>(&bytes).unwrap(), values);
        }};
    }

    check!(u8, ByteArray, vec![0xAB, 0xCD], [0xAB, 0xCD]);
    check!(i8, SByteArray, vec![-1, 1], [0xFF, 0x01]);
    check!(bool, BoolArray, vec![true, false], [1, 0]);
    check!(char, CharArray, vec!['A', 'B'], [0x41, 0, 0, 0, 0x42, 0, 0, 0]);
    check!(i16, ShortArray, vec![-2], [0xFE, 0xFF]);
    check!(u16, UShortArray, vec![0x1234], [0x34, 0x12]);
    check!(i32, IntArray, vec![1], [1, 0, 0, 0]);
    check!(u32, UIntArray, vec![0x0102_0304], [4, 3, 2, 1]);
    check!(i64, LongArray, vec![-1], [0xFF; 8]);
    check!(u64, ULongArray, vec![2], [2, 0, 0, 0, 0, 0, 0, 0]);
    check!(f32, FloatArray, vec![1.0], 1.0_f32.to_le_bytes());
    check!(f64, DoubleArray, vec![-2.5], (-2.5_f64).to_le_bytes());
}

#[test]
fn expected_type_collapses_the_header() {
    let engine = engine();

    // Standalone, the concrete type must be spelled out.
    let standalone = engine.serialize(&Point { x: 1, y: 2 }).unwrap();
    assert_eq!(standalone[0], Token::SpecifiedType.as_u8());
    assert_eq!(standalone[1], Token::NamedType.as_u8());
    assert_eq!(&standalone[2..6], &5_u32.to_le_bytes());
    assert_eq!(&standalone[6..11], b"point");

    // As an element of Vec<Point> the static type matches, so each
    // element header is the single ExpectedType byte.
    let listed = engine.serialize(&vec![Point { x: 1, y: 2 }]).unwrap();
    let header_len = 2 + 4 + "point[]".len();
    let rank_and_dims = 1 + 4;
    let element = &listed[header_len + rank_and_dims..];
    assert_eq!(element[0], Token::ExpectedType.as_u8());
    assert_eq!(element.len(), 1 + 8);

    // Both forms decode identically.
    assert_eq!(
        engine.deserialize::<Vec<Point>>(&listed).unwrap(),
        vec![Point { x: 1, y: 2 }]
    );
    assert_eq!(
        engine.deserialize::<Point>(&standalone).unwrap(),
        Point { x: 1, y: 2 }
    );
}

#[test]
fn dyn_seq_round_trips_mixed_values() {
    let engine = engine();

    let mut seq = DynSeq::new();
    seq.push(Box::new(7_i32));
    seq.push(Box::new(String::from("x")));
    seq.push(Box::new(NullValue));
    seq.push(Box::new(Point { x: 1, y: 1 }));

    let decoded: DynSeq = engine.round_trip(&seq).unwrap();
    assert_eq!(decoded.len(), 4);
    assert_eq!(decoded.get(0).unwrap().downcast_ref::<i32>(), Some(&7));
    assert_eq!(
        decoded.get(1).unwrap().downcast_ref::<String>().unwrap(),
        "x"
    );
    assert!(decoded.get(2).unwrap().is_null());
    assert_eq!(
        decoded.get(3).unwrap().downcast_ref::<Point>(),
        Some(&Point { x: 1, y: 1 })
    );
}

#[test]
fn deep_copy_elements_in_place_keeps_sharing() {
    let engine = engine();
    let shared = Shared::new(Node {
        name: "s".into(),
        next: None,
    });

    let mut seq = DynSeq::new();
    seq.push(Box::new(shared.clone()));
    seq.push(Box::new(shared.clone()));
    engine.deep_copy_elements_in_place(&mut seq).unwrap();

    let first = seq.get(0).unwrap().downcast_ref::<Shared<Node>>().unwrap();
    let second = seq.get(1).unwrap().downcast_ref::<Shared<Node>>().unwrap();
    assert!(first.ptr_eq(second));
    assert!(!first.ptr_eq(&shared));
}

// -----------------------------------------------------------------------------
// Enums

#[derive(Debug, Clone, Copy, PartialEq)]
enum Color {
    Red,
    Green,
    Blue,
}

crate::impl_portable!(Color);

fn color_registration() -> Registration {
    codecs::enum_codec::<Color>(
        "color",
        EnumKind::Int,
        |c| match c {
            Color::Red => 1,
            Color::Green => 2,
            Color::Blue => 3,
        },
        |raw| match raw {
            1 => Some(Color::Red),
            2 => Some(Color::Green),
            3 => Some(Color::Blue),
            _ => None,
        },
    )
}

#[test]
fn enums_travel_as_their_underlying_integer() {
    let engine = EngineBuilder::new().register(color_registration()).build().unwrap();

    let bytes = engine.serialize(&Color::Green).unwrap();
    // Header names the enum, then the underlying value is a plain Int.
    let header_len = 2 + 4 + "color".len();
    assert_eq!(
        &bytes[header_len..],
        &[Token::Int.as_u8(), 2, 0, 0, 0]
    );
    assert_eq!(engine.round_trip(&Color::Blue).unwrap(), Color::Blue);
}

#[test]
fn unknown_enum_discriminant_fails_decode() {
    let engine = EngineBuilder::new().register(color_registration()).build().unwrap();

    let mut writer = gv_wire::StreamWriter::new();
    writer.write_token(Token::SpecifiedType);
    writer.write_token(Token::NamedType);
    writer.write_str("color");
    writer.write_simple(&gv_wire::SimpleValue::Int(99));

    let result = engine.deserialize::<Color>(&writer.into_bytes());
    assert!(matches!(
        result,
        Err(SerialError::UnknownEnumValue { value: 99, .. })
    ));
}

#[test]
fn enum_value_outside_declared_width_fails() {
    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Tiny(i64);
    crate::impl_portable!(Tiny);

    let engine = EngineBuilder::new()
        .register(codecs::enum_codec::<Tiny>(
            "tiny",
            EnumKind::Byte,
            |t| t.0,
            |raw| Some(Tiny(raw)),
        ))
        .build()
        .unwrap();

    assert!(engine.serialize(&Tiny(12)).is_ok());
    assert!(matches!(
        engine.serialize(&Tiny(300)),
        Err(SerialError::EnumValueOutOfRange { value: 300, .. })
    ));
}

// -----------------------------------------------------------------------------
// Registration validation

struct SerializeOnlyProvider;

impl CodecProvider<Point> for SerializeOnlyProvider {
    const TYPE_KEY: &'static str = "point";

    fn serializer() -> Option<TypedSerialize<Point>> {
        Some(Box::new(|_, _| Ok(())))
    }
}

struct EmptyProvider;

impl CodecProvider<Point> for EmptyProvider {
    const TYPE_KEY: &'static str = "point";
}

#[test]
fn unpaired_serializer_is_rejected() {
    let registration = codecs::from_provider::<Point, SerializeOnlyProvider>().unwrap();
    let result = EngineBuilder::new().register(registration).build();
    assert!(matches!(
        result,
        Err(SerialError::RegistrationInconsistency { type_key }) if type_key == "point"
    ));
}

#[test]
fn provider_without_methods_is_rejected() {
    assert!(matches!(
        codecs::from_provider::<Point, EmptyProvider>(),
        Err(SerialError::EmptyRegistration { .. })
    ));
}

// -----------------------------------------------------------------------------
// Type-name resolution

#[test]
fn resolver_handles_generics_arrays_and_failures() {
    let engine = engine();

    let map = engine.resolve_type_name("map<int,string>").unwrap();
    assert!(matches!(
        &map,
        ResolvedType::Concrete { type_id, .. }
            if *type_id == TypeId::of::<HashMap<i32, String>>()
    ));

    let nested = engine.resolve_type_name("map<int,string>[]").unwrap();
    assert_eq!(nested.rank(), Some(1));
    assert_eq!(nested.key(), "map<int,string>[]");

    let rank3 = engine.resolve_type_name("point[,,]").unwrap();
    assert_eq!(rank3.rank(), Some(3));

    let shared = engine.resolve_type_name("shared<node>").unwrap();
    assert!(matches!(
        shared,
        ResolvedType::Concrete { type_id, .. }
            if type_id == TypeId::of::<Shared<Node>>()
    ));

    let option = engine.resolve_type_name("option<point>").unwrap();
    assert!(matches!(
        option,
        ResolvedType::Concrete { type_id, .. }
            if type_id == TypeId::of::<Option<Point>>()
    ));

    for key in ["nope", "foo<", "bar<int", "[,]"] {
        assert!(matches!(
            engine.resolve_type_name(key),
            Err(SerialError::UnresolvableTypeName { .. })
        ));
    }
}

#[test]
fn known_type_table_loads_through_the_loader() {
    let loads = Arc::new(AtomicUsize::new(0));
    let counter = loads.clone();

    let engine = EngineBuilder::new()
        .with_known_types([KnownTypeEntry::new("widget", "tests::Widget")])
        .with_type_loader(Arc::new(move |qualified| {
            if qualified == "tests::Widget" {
                counter.fetch_add(1, Ordering::SeqCst);
                Some(codecs::record::<Point>(
                    "widget",
                    |p, _| Ok(p.clone()),
                    |p, ctx| {
                        ctx.writer().write_i32(p.x);
                        ctx.writer().write_i32(p.y);
                        Ok(())
                    },
                    |ctx| {
                        Ok(Point {
                            x: ctx.reader().read_i32()?,
                            y: ctx.reader().read_i32()?,
                        })
                    },
                ))
            } else {
                None
            }
        }))
        .build()
        .unwrap();

    // A key outside the table never reaches the loader.
    assert!(engine.resolve_type_name("gadget").is_err());
    assert_eq!(loads.load(Ordering::SeqCst), 0);

    let resolved = engine.resolve_type_name("widget").unwrap();
    assert!(matches!(
        resolved,
        ResolvedType::Concrete { type_id, .. } if type_id == TypeId::of::<Point>()
    ));
    assert_eq!(loads.load(Ordering::SeqCst), 1);

    // Loading registered the type, so the second resolve is a cache hit.
    let _ = engine.resolve_type_name("widget").unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[test]
fn marker_keys_resolve_as_abstract() {
    let engine = EngineBuilder::new()
        .register(point_registration().with_markers(["geometry.shape"]))
        .build()
        .unwrap();

    assert!(matches!(
        engine.resolve_type_name("geometry.shape").unwrap(),
        ResolvedType::Abstract { .. }
    ));
}

#[test]
fn has_serializer_sees_structure() {
    let engine = engine();
    assert!(engine.has_serializer(TypeId::of::<i32>()));
    assert!(engine.has_serializer(TypeId::of::<Point>()));
    assert!(engine.has_serializer(TypeId::of::<Vec<Point>>()));
    assert!(engine.has_serializer(TypeId::of::<Option<Point>>()));
    assert!(!engine.has_serializer(TypeId::of::<std::fs::File>()));

    assert!(engine.has_serializer_for_key("point"));
    assert!(engine.has_serializer_for_key("point[,]"));
    assert!(engine.has_serializer_for_key("option<point>"));
    assert!(!engine.has_serializer_for_key("mystery"));
}

// -----------------------------------------------------------------------------
// Pluggable tiers

#[derive(Debug, Clone, PartialEq)]
struct Blob(Vec<u8>);

crate::impl_portable!(Blob);

struct BlobKeyed {
    asked: AtomicUsize,
}

impl PluggableSerializer for BlobKeyed {
    fn supports_type(&self, type_id: TypeId) -> bool {
        self.asked.fetch_add(1, Ordering::SeqCst);
        type_id == TypeId::of::<Blob>()
    }

    fn copy(
        &self,
        value: &dyn Portable,
        _ctx: &mut CopyContext<'_>,
    ) -> SerialResult<Box<dyn Portable>> {
        Ok(Box::new(value.downcast_ref::<Blob>().unwrap().clone()))
    }

    fn serialize(
        &self,
        value: &dyn Portable,
        ctx: &mut SerializeContext<'_>,
        _expected: Option<TypeId>,
    ) -> SerialResult<()> {
        let blob = value.downcast_ref::<Blob>().unwrap();
        ctx.writer().write_u32(blob.0.len() as u32);
        ctx.writer().write_bytes(&blob.0);
        Ok(())
    }

    fn deserialize(
        &self,
        _expected: Option<TypeId>,
        ctx: &mut DeserializeContext<'_>,
    ) -> SerialResult<Box<dyn Portable>> {
        let length = ctx.reader().read_len()?;
        Ok(Box::new(Blob(ctx.reader().read_bytes(length)?.to_vec())))
    }
}

impl KeyedSerializer for BlobKeyed {
    fn serializer_id(&self) -> u8 {
        17
    }
}

#[test]
fn keyed_serializers_are_selected_by_wire_id() {
    let engine = EngineBuilder::new()
        .with_keyed(Arc::new(BlobKeyed {
            asked: AtomicUsize::new(0),
        }))
        .build()
        .unwrap();

    let blob = Blob(vec![9, 8, 7]);
    let bytes = engine.serialize(&blob).unwrap();
    assert_eq!(bytes[0], Token::KeyedSerializer.as_u8());
    assert_eq!(bytes[1], 17);
    assert_eq!(engine.deserialize::<Blob>(&bytes).unwrap(), blob);

    // Copy also routes through the keyed tier.
    assert_eq!(engine.deep_copy_value(&blob).unwrap(), blob);
}

#[test]
fn duplicate_keyed_ids_abort_construction() {
    let result = EngineBuilder::new()
        .with_keyed(Arc::new(BlobKeyed {
            asked: AtomicUsize::new(0),
        }))
        .with_keyed(Arc::new(BlobKeyed {
            asked: AtomicUsize::new(0),
        }))
        .build();
    assert!(matches!(
        result,
        Err(SerialError::DuplicateKeyedSerializer(17))
    ));
}

#[test]
fn unknown_keyed_id_fails_decode() {
    let engine = engine();
    let bytes = [Token::KeyedSerializer.as_u8(), 99];
    assert!(matches!(
        engine.deserialize_dyn(None, &bytes),
        Err(SerialError::UnknownKeyedSerializer(99))
    ));
}

struct BlobExternal;

impl PluggableSerializer for BlobExternal {
    fn supports_type(&self, type_id: TypeId) -> bool {
        type_id == TypeId::of::<Blob>()
    }

    fn copy(
        &self,
        value: &dyn Portable,
        _ctx: &mut CopyContext<'_>,
    ) -> SerialResult<Box<dyn Portable>> {
        Ok(Box::new(value.downcast_ref::<Blob>().unwrap().clone()))
    }

    fn serialize(
        &self,
        value: &dyn Portable,
        ctx: &mut SerializeContext<'_>,
        _expected: Option<TypeId>,
    ) -> SerialResult<()> {
        let blob = value.downcast_ref::<Blob>().unwrap();
        ctx.writer().write_u32(blob.0.len() as u32);
        ctx.writer().write_bytes(&blob.0);
        Ok(())
    }

    fn deserialize(
        &self,
        _expected: Option<TypeId>,
        ctx: &mut DeserializeContext<'_>,
    ) -> SerialResult<Box<dyn Portable>> {
        let length = ctx.reader().read_len()?;
        Ok(Box::new(Blob(ctx.reader().read_bytes(length)?.to_vec())))
    }
}

#[test]
fn external_serializers_win_over_registered_codecs() {
    // The registered codec for Blob would write a marker byte; the
    // external one writes the raw payload. The external must win.
    let engine = EngineBuilder::new()
        .register(codecs::record::<Blob>(
            "blob",
            |b, _| Ok(b.clone()),
            |_, ctx| {
                ctx.writer().write_u8(0xEE);
                Ok(())
            },
            |ctx| {
                ctx.reader().read_u8()?;
                Ok(Blob(Vec::new()))
            },
        ))
        .with_external(Arc::new(BlobExternal))
        .build()
        .unwrap();

    let blob = Blob(vec![1, 2]);
    let bytes = engine.serialize(&blob).unwrap();
    let header_len = 2 + 4 + "blob".len();
    // External body: length prefix + payload, not the 0xEE marker.
    assert_eq!(&bytes[header_len..], &[2, 0, 0, 0, 1, 2]);
    assert_eq!(engine.deserialize::<Blob>(&bytes).unwrap(), blob);
}

#[test]
fn external_support_is_memoized() {
    let keyed = Arc::new(BlobKeyed {
        asked: AtomicUsize::new(0),
    });
    let engine = EngineBuilder::new().with_keyed(keyed.clone()).build().unwrap();

    let blob = Blob(vec![1]);
    let _ = engine.serialize(&blob).unwrap();
    let _ = engine.serialize(&blob).unwrap();
    let _ = engine.serialize(&blob).unwrap();

    assert_eq!(keyed.asked.load(Ordering::SeqCst), 1);
}

// -----------------------------------------------------------------------------
// Fallback and fault substitution

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
struct Meta {
    tag: String,
    weight: u32,
}

crate::impl_portable!(Meta);

#[test]
fn fallback_carries_enrolled_types() {
    let engine = EngineBuilder::new()
        .with_fallback(Arc::new(
            crate::pluggable::JsonFallback::new().with::<Meta>("meta"),
        ))
        .build()
        .unwrap();

    let meta = Meta {
        tag: "m".into(),
        weight: 3,
    };
    let bytes = engine.serialize(&meta).unwrap();
    assert_eq!(bytes[0], Token::Fallback.as_u8());
    assert_eq!(engine.deserialize::<Meta>(&bytes).unwrap(), meta);
    assert_eq!(engine.deep_copy_value(&meta).unwrap(), meta);
}

/// An error type nothing claims: not registered, not enrolled with the
/// fallback.
#[derive(Debug)]
struct SensorFailure {
    message: String,
}

impl Portable for SensorFailure {
    fn as_any(&self) -> &dyn core::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn core::any::Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn core::any::Any> {
        self
    }

    fn type_name(&self) -> &'static str {
        "tests::SensorFailure"
    }

    fn as_fault(&self) -> Option<Fault> {
        Some(Fault::new(
            "tests::SensorFailure",
            self.message.clone(),
            "sensor.rs:42\nprobe.rs:7",
        ))
    }
}

#[test]
fn unserializable_errors_become_faults() {
    let engine = engine();
    let failure = SensorFailure {
        message: "probe went dark".into(),
    };

    let bytes = engine.serialize(&failure).unwrap();
    let decoded = engine.deserialize::<Fault>(&bytes).unwrap();
    assert_eq!(decoded.type_name, "tests::SensorFailure");
    assert_eq!(decoded.message, "probe went dark");
    assert!(decoded.stack.contains("sensor.rs:42"));
}

#[test]
fn unclaimed_values_fail_with_no_codec_found() {
    let engine = engine();
    #[derive(Debug)]
    struct Opaque;
    crate::impl_portable!(Opaque);

    assert!(matches!(
        engine.serialize(&Opaque),
        Err(SerialError::NoCodecFound { .. })
    ));
    assert!(matches!(
        engine.deep_copy(&Opaque),
        Err(SerialError::NoCodecFound { .. })
    ));
}

// -----------------------------------------------------------------------------
// Stream format errors

#[test]
fn expected_type_without_context_fails() {
    let engine = engine();
    let bytes = [Token::ExpectedType.as_u8()];
    assert!(matches!(
        engine.deserialize_dyn(None, &bytes),
        Err(SerialError::ExpectedTypeMissing)
    ));
}

#[test]
fn truncated_streams_fail() {
    let engine = engine();
    let bytes = engine.serialize(&12345678_i32).unwrap();
    assert!(matches!(
        engine.deserialize::<i32>(&bytes[..2]),
        Err(SerialError::Wire(_))
    ));
}

#[test]
fn dangling_reference_fails() {
    let engine = engine();
    let mut writer = gv_wire::StreamWriter::new();
    writer.write_token(Token::Reference);
    writer.write_u32(7);
    assert!(matches!(
        engine.deserialize_dyn(None, &writer.into_bytes()),
        Err(SerialError::UnknownReference(7))
    ));
}

// -----------------------------------------------------------------------------
// Statistics

#[test]
fn statistics_count_operations() {
    let stats = Arc::new(SerializationStatistics::new());
    let engine = EngineBuilder::new()
        .with_statistics(stats.clone())
        .with_large_object_threshold(16)
        .build()
        .unwrap();

    let bytes = engine.serialize(&7_i64).unwrap();
    let _: i64 = engine.deserialize(&bytes).unwrap();
    let _ = engine.deep_copy_value(&7_i64).unwrap();

    assert_eq!(stats.serializations(), 1);
    assert_eq!(stats.deserializations(), 1);
    assert_eq!(stats.copies(), 1);

    // A 100-element byte vector crosses the 16-byte threshold.
    let _ = engine.serialize(&vec![0_u8; 100]).unwrap();
    assert_eq!(stats.large_allocations(), 1);
}

#[test]
fn fallback_operations_count_separately() {
    let stats = Arc::new(SerializationStatistics::new());
    let engine = EngineBuilder::new()
        .with_statistics(stats.clone())
        .with_fallback(Arc::new(
            crate::pluggable::JsonFallback::new().with::<Meta>("meta"),
        ))
        .build()
        .unwrap();

    let meta = Meta {
        tag: "t".into(),
        weight: 1,
    };
    let bytes = engine.serialize(&meta).unwrap();
    let _: Meta = engine.deserialize(&bytes).unwrap();

    assert_eq!(stats.fallback_serializations(), 1);
    assert_eq!(stats.fallback_deserializations(), 1);
    // The outer operation still counts once.
    assert_eq!(stats.serializations(), 1);
    assert_eq!(stats.deserializations(), 1);
}

// -----------------------------------------------------------------------------
// Properties

proptest::proptest! {
    #[test]
    fn longs_round_trip(v in proptest::num::i64::ANY) {
        let engine = engine();
        proptest::prop_assert_eq!(engine.round_trip(&v).unwrap(), v);
    }

    #[test]
    fn strings_round_trip(s in ".*") {
        let engine = engine();
        proptest::prop_assert_eq!(engine.round_trip(&s).unwrap(), s);
    }

    #[test]
    fn byte_vectors_round_trip(v in proptest::collection::vec(proptest::num::u8::ANY, 0..256)) {
        let engine = engine();
        proptest::prop_assert_eq!(engine.round_trip(&v).unwrap(), v);
    }

    #[test]
    fn int_vectors_round_trip(v in proptest::collection::vec(proptest::num::i32::ANY, 0..64)) {
        let engine = engine();
        proptest::prop_assert_eq!(engine.round_trip(&v).unwrap(), v);
    }

    #[test]
    fn optional_strings_round_trip(v in proptest::option::of(".*")) {
        let engine = engine();
        proptest::prop_assert_eq!(engine.round_trip(&v).unwrap(), v);
    }
}
