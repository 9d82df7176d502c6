use core::any::{Any, TypeId};
use core::cell::{Ref, RefCell, RefMut};
use core::fmt;
use std::collections::HashMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// Portable

/// A value the engine can transmit between silos or deep-copy in-process.
///
/// `Portable` is the engine's universal currency: every object graph is a
/// tree of `dyn Portable` values held together by [`Shared`] handles
/// wherever reference identity matters. The trait itself is only an
/// [`Any`] upcast plus two narrow hooks; all encoding knowledge lives in
/// the registry.
///
/// Implement it for a concrete type with [`impl_portable!`]:
///
/// ```
/// use gv_engine::impl_portable;
///
/// #[derive(Debug, Clone, PartialEq)]
/// struct Point { x: i32, y: i32 }
///
/// impl_portable!(Point);
/// ```
pub trait Portable: Any + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;

    /// The runtime type name, used as a diagnostic hint in errors.
    fn type_name(&self) -> &'static str;

    /// The identity of the heap cell behind this value, if it is a
    /// reference-typed handle. Identity drives back-reference tracking;
    /// value-typed objects return `None` and are never deduplicated.
    fn shared_identity(&self) -> Option<usize> {
        None
    }

    /// Whether this value is the absent value (`Option::None` or the
    /// dynamic null sentinel).
    fn is_null(&self) -> bool {
        false
    }

    /// The payload of a present `Option`, unwrapped for transparent
    /// encoding.
    fn unwrap_some(&self) -> Option<&dyn Portable> {
        None
    }

    /// A transmittable view of this value, if it carries an error.
    ///
    /// Consulted by the exception-substitution clause: an error-typed
    /// value that no codec accepts is replaced by this [`Fault`] so that
    /// failures are never themselves un-transmittable.
    fn as_fault(&self) -> Option<Fault> {
        None
    }
}

impl dyn Portable {
    /// Whether the concrete type of this value is `T`.
    #[inline]
    pub fn is<T: Portable>(&self) -> bool {
        self.as_any().type_id() == TypeId::of::<T>()
    }

    /// The [`TypeId`] of the concrete value.
    #[inline]
    pub fn concrete_type_id(&self) -> TypeId {
        self.as_any().type_id()
    }

    #[inline]
    pub fn downcast_ref<T: Portable>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }

    #[inline]
    pub fn downcast_mut<T: Portable>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut()
    }

    /// Takes the concrete value out of the box, or returns the box
    /// unchanged when the type does not match.
    pub fn take<T: Portable>(self: Box<Self>) -> Result<T, Box<dyn Portable>> {
        if self.is::<T>() {
            Ok(*self
                .into_any()
                .downcast::<T>()
                .expect("type id was checked above"))
        } else {
            Err(self)
        }
    }
}

/// Implements [`Portable`] for concrete types with no special hooks.
#[macro_export]
macro_rules! impl_portable {
    ($($ty:ty),* $(,)?) => {$(
        impl $crate::Portable for $ty {
            #[inline]
            fn as_any(&self) -> &dyn ::core::any::Any {
                self
            }

            #[inline]
            fn as_any_mut(&mut self) -> &mut dyn ::core::any::Any {
                self
            }

            #[inline]
            fn into_any(self: ::std::boxed::Box<Self>) -> ::std::boxed::Box<dyn ::core::any::Any> {
                self
            }

            #[inline]
            fn type_name(&self) -> &'static str {
                ::core::any::type_name::<$ty>()
            }
        }
    )*};
}

impl_portable!(
    bool,
    u8,
    i8,
    i16,
    u16,
    i32,
    u32,
    i64,
    u64,
    f32,
    f64,
    char,
    String,
    gv_wire::rust_decimal::Decimal,
    gv_wire::uuid::Uuid,
    gv_wire::WireDate,
    gv_wire::chrono::TimeDelta,
);

impl<T: Portable> Portable for Vec<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn type_name(&self) -> &'static str {
        core::any::type_name::<Self>()
    }
}

impl<T: Portable> Portable for Option<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn type_name(&self) -> &'static str {
        core::any::type_name::<Self>()
    }

    fn is_null(&self) -> bool {
        self.is_none()
    }

    fn unwrap_some(&self) -> Option<&dyn Portable> {
        self.as_ref().map(|value| value as &dyn Portable)
    }
}

impl<K, V> Portable for HashMap<K, V>
where
    K: Portable + Eq + core::hash::Hash,
    V: Portable,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn type_name(&self) -> &'static str {
        core::any::type_name::<Self>()
    }
}

// -----------------------------------------------------------------------------
// NullValue

/// The dynamic null sentinel: what an untyped decode of a `Null` token
/// materializes as, and what a heterogeneous sequence holds in an empty
/// slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NullValue;

impl Portable for NullValue {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn type_name(&self) -> &'static str {
        core::any::type_name::<Self>()
    }

    fn is_null(&self) -> bool {
        true
    }
}

// -----------------------------------------------------------------------------
// BareObject

/// The bare-object sentinel: a value with a type and nothing else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BareObject;

impl_portable!(BareObject);

// -----------------------------------------------------------------------------
// Shared

/// A reference-typed handle: the only kind of value with identity.
///
/// Cloning a `Shared` clones the handle, not the cell. During one
/// serialize or deep-copy operation, every handle to the same cell
/// encodes as a single body plus back-references, and cycles through
/// handles terminate instead of recursing forever.
///
/// ```
/// use gv_engine::Shared;
///
/// let a = Shared::new(vec![1_i32, 2]);
/// let b = a.clone();
/// assert!(a.ptr_eq(&b));
/// b.borrow_mut().push(3);
/// assert_eq!(*a.borrow(), [1, 2, 3]);
/// ```
pub struct Shared<T>(Rc<RefCell<T>>);

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        Self(Rc::new(RefCell::new(value)))
    }

    #[inline]
    pub fn borrow(&self) -> Ref<'_, T> {
        self.0.borrow()
    }

    #[inline]
    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.0.borrow_mut()
    }

    /// Replaces the cell contents, returning the previous value.
    pub fn replace(&self, value: T) -> T {
        self.0.replace(value)
    }

    /// Borrows the cell, failing instead of panicking when a mutable
    /// borrow is live. Codecs use this so a mid-operation aliasing
    /// mistake surfaces as an error.
    pub fn try_borrow(&self) -> Result<Ref<'_, T>, core::cell::BorrowError> {
        self.0.try_borrow()
    }

    /// The identity of the cell: stable for the lifetime of the handle
    /// graph, shared by every clone of this handle.
    #[inline]
    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    /// Whether two handles point at the same cell.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<T: fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Borrow may be held mutably mid-operation; never panic in Debug.
        match self.0.try_borrow() {
            Ok(value) => f.debug_tuple("Shared").field(&*value).finish(),
            Err(_) => f.write_str("Shared(<borrowed>)"),
        }
    }
}

/// Structural equality of the cell contents.
///
/// Comparing cyclic graphs with this does not terminate; compare
/// identities with [`Shared::ptr_eq`] there instead.
impl<T: PartialEq> PartialEq for Shared<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || *self.borrow() == *other.borrow()
    }
}

impl<T: Portable> Portable for Shared<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn type_name(&self) -> &'static str {
        core::any::type_name::<Self>()
    }

    fn shared_identity(&self) -> Option<usize> {
        Some(self.identity())
    }
}

// -----------------------------------------------------------------------------
// DynSeq

/// A heterogeneous sequence: the dynamic array of bare objects.
///
/// Elements carry their own type headers on the wire, so a `DynSeq` can
/// mix any registered types, nulls included.
#[derive(Debug, Default)]
pub struct DynSeq(Vec<Box<dyn Portable>>);

impl DynSeq {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, value: Box<dyn Portable>) {
        self.0.push(value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&dyn Portable> {
        self.0.get(index).map(|b| &**b)
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Portable> {
        self.0.iter().map(|b| &**b)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Portable>> {
        self.0.iter_mut()
    }

    pub fn into_inner(self) -> Vec<Box<dyn Portable>> {
        self.0
    }
}

impl From<Vec<Box<dyn Portable>>> for DynSeq {
    fn from(items: Vec<Box<dyn Portable>>) -> Self {
        Self(items)
    }
}

impl Portable for DynSeq {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn type_name(&self) -> &'static str {
        core::any::type_name::<Self>()
    }
}

// -----------------------------------------------------------------------------
// MultiArray

/// A rectangular array of rank two or higher, stored row-major with zero
/// lower bounds.
///
/// Rank-1 arrays are plain `Vec<T>`.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiArray<T> {
    dims: Vec<u32>,
    items: Vec<T>,
}

impl<T> MultiArray<T> {
    /// Builds an array from its dimension lengths and row-major items.
    ///
    /// # Panics
    ///
    /// Panics when the rank is below two or the item count does not
    /// match the product of the dimensions.
    pub fn new(dims: Vec<u32>, items: Vec<T>) -> Self {
        assert!(dims.len() >= 2, "rank-1 arrays are Vec<T>");
        let expected: usize = dims.iter().map(|&d| d as usize).product();
        assert_eq!(
            expected,
            items.len(),
            "dimension product does not match the item count"
        );
        Self { dims, items }
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[inline]
    pub fn dims(&self) -> &[u32] {
        &self.dims
    }

    #[inline]
    pub fn items(&self) -> &[T] {
        &self.items
    }

    #[inline]
    pub fn items_mut(&mut self) -> &mut [T] {
        &mut self.items
    }

    pub fn into_parts(self) -> (Vec<u32>, Vec<T>) {
        (self.dims, self.items)
    }

    /// Row-major linear index of a coordinate, if in bounds.
    pub fn linear_index(&self, index: &[u32]) -> Option<usize> {
        if index.len() != self.dims.len() {
            return None;
        }
        let mut linear = 0_usize;
        for (&i, &dim) in index.iter().zip(&self.dims) {
            if i >= dim {
                return None;
            }
            linear = linear * dim as usize + i as usize;
        }
        Some(linear)
    }

    pub fn get(&self, index: &[u32]) -> Option<&T> {
        self.linear_index(index).map(|i| &self.items[i])
    }
}

impl<T: Portable> Portable for MultiArray<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn type_name(&self) -> &'static str {
        core::any::type_name::<Self>()
    }
}

// -----------------------------------------------------------------------------
// Fault

/// A synthetic, always-transmittable error record.
///
/// When a value that carries an error reaches the end of the codec
/// tie-break order unclaimed, the engine substitutes its `Fault` view so
/// the failure still crosses the wire: original type name, message, and
/// stack text survive; everything else is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub type_name: String,
    pub message: String,
    pub stack: String,
}

impl Fault {
    pub fn new(
        type_name: impl Into<String>,
        message: impl Into<String>,
        stack: impl Into<String>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack: stack.into(),
        }
    }

    /// Captures an error's message and source chain as stack text.
    pub fn from_error<E: std::error::Error + 'static>(err: &E) -> Self {
        let mut stack = String::new();
        let mut source = err.source();
        while let Some(cause) = source {
            if !stack.is_empty() {
                stack.push('\n');
            }
            stack.push_str("caused by: ");
            stack.push_str(&cause.to_string());
            source = cause.source();
        }
        Self {
            type_name: std::any::type_name_of_val(err).to_string(),
            message: err.to_string(),
            stack,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl std::error::Error for Fault {}

impl Portable for Fault {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn type_name(&self) -> &'static str {
        core::any::type_name::<Self>()
    }

    fn as_fault(&self) -> Option<Fault> {
        Some(self.clone())
    }
}

// -----------------------------------------------------------------------------
// Simple fastpath bridge

use gv_wire::SimpleValue;

/// Views a value as a simple one, if its concrete type has an inline
/// token.
pub(crate) fn try_as_simple(value: &dyn Portable) -> Option<SimpleValue> {
    let any = value.as_any();
    if any.is::<NullValue>() {
        return Some(SimpleValue::Null);
    }
    if let Some(v) = any.downcast_ref::<bool>() {
        return Some(SimpleValue::Bool(*v));
    }
    if let Some(v) = any.downcast_ref::<u8>() {
        return Some(SimpleValue::Byte(*v));
    }
    if let Some(v) = any.downcast_ref::<i8>() {
        return Some(SimpleValue::SByte(*v));
    }
    if let Some(v) = any.downcast_ref::<i16>() {
        return Some(SimpleValue::Short(*v));
    }
    if let Some(v) = any.downcast_ref::<u16>() {
        return Some(SimpleValue::UShort(*v));
    }
    if let Some(v) = any.downcast_ref::<i32>() {
        return Some(SimpleValue::Int(*v));
    }
    if let Some(v) = any.downcast_ref::<u32>() {
        return Some(SimpleValue::UInt(*v));
    }
    if let Some(v) = any.downcast_ref::<i64>() {
        return Some(SimpleValue::Long(*v));
    }
    if let Some(v) = any.downcast_ref::<u64>() {
        return Some(SimpleValue::ULong(*v));
    }
    if let Some(v) = any.downcast_ref::<f32>() {
        return Some(SimpleValue::Float(*v));
    }
    if let Some(v) = any.downcast_ref::<f64>() {
        return Some(SimpleValue::Double(*v));
    }
    if let Some(v) = any.downcast_ref::<gv_wire::rust_decimal::Decimal>() {
        return Some(SimpleValue::Decimal(*v));
    }
    if let Some(v) = any.downcast_ref::<char>() {
        return Some(SimpleValue::Char(*v));
    }
    if let Some(v) = any.downcast_ref::<String>() {
        return Some(SimpleValue::Str(v.clone()));
    }
    if let Some(v) = any.downcast_ref::<gv_wire::uuid::Uuid>() {
        return Some(SimpleValue::Guid(*v));
    }
    if let Some(v) = any.downcast_ref::<gv_wire::WireDate>() {
        return Some(SimpleValue::Date(*v));
    }
    if let Some(v) = any.downcast_ref::<gv_wire::chrono::TimeDelta>() {
        return Some(SimpleValue::Span(*v));
    }
    None
}

/// Boxes a decoded simple value back into the payload model.
pub(crate) fn box_simple(value: SimpleValue) -> Box<dyn Portable> {
    match value {
        SimpleValue::Null => Box::new(NullValue),
        SimpleValue::Bool(v) => Box::new(v),
        SimpleValue::Byte(v) => Box::new(v),
        SimpleValue::SByte(v) => Box::new(v),
        SimpleValue::Short(v) => Box::new(v),
        SimpleValue::UShort(v) => Box::new(v),
        SimpleValue::Int(v) => Box::new(v),
        SimpleValue::UInt(v) => Box::new(v),
        SimpleValue::Long(v) => Box::new(v),
        SimpleValue::ULong(v) => Box::new(v),
        SimpleValue::Float(v) => Box::new(v),
        SimpleValue::Double(v) => Box::new(v),
        SimpleValue::Decimal(v) => Box::new(v),
        SimpleValue::Char(v) => Box::new(v),
        SimpleValue::Str(v) => Box::new(v),
        SimpleValue::Guid(v) => Box::new(v),
        SimpleValue::Date(v) => Box::new(v),
        SimpleValue::Span(v) => Box::new(v),
    }
}

/// Copies a simple value by cloning it; also claims [`BareObject`].
///
/// These are the statically shallow-copyable leaves of every graph.
pub(crate) fn try_copy_simple(value: &dyn Portable) -> Option<Box<dyn Portable>> {
    if value.as_any().is::<BareObject>() {
        return Some(Box::new(BareObject));
    }
    try_as_simple(value).map(box_simple)
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::{DynSeq, Fault, MultiArray, Portable, Shared};

    #[test]
    fn downcast_and_take() {
        let boxed: Box<dyn Portable> = Box::new(42_i32);
        assert!(boxed.is::<i32>());
        assert_eq!(boxed.downcast_ref::<i32>(), Some(&42));

        let wrong = boxed.take::<String>().unwrap_err();
        assert_eq!(wrong.take::<i32>().unwrap(), 42);
    }

    #[test]
    fn shared_identity_follows_the_cell() {
        let a = Shared::new(String::from("x"));
        let b = a.clone();
        let c = Shared::new(String::from("x"));

        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity(), c.identity());
        assert_eq!(a.shared_identity(), Some(a.identity()));
    }

    #[test]
    fn option_hooks() {
        let none: Option<i32> = None;
        assert!(Portable::is_null(&none));
        assert!(none.unwrap_some().is_none());

        let some = Some(7_i32);
        assert!(!Portable::is_null(&some));
        assert_eq!(some.unwrap_some().unwrap().downcast_ref::<i32>(), Some(&7));
    }

    #[test]
    fn multi_array_indexing() {
        let arr = MultiArray::new(vec![2, 3], (0..6_i32).collect());
        assert_eq!(arr.rank(), 2);
        assert_eq!(arr.get(&[0, 0]), Some(&0));
        assert_eq!(arr.get(&[1, 2]), Some(&5));
        assert_eq!(arr.get(&[2, 0]), None);
        assert_eq!(arr.get(&[0]), None);
    }

    #[test]
    #[should_panic(expected = "rank-1 arrays are Vec<T>")]
    fn multi_array_rejects_rank_one() {
        let _ = MultiArray::new(vec![3], vec![1_i32, 2, 3]);
    }

    #[test]
    fn dyn_seq_holds_mixed_values() {
        let mut seq = DynSeq::new();
        seq.push(Box::new(1_i32));
        seq.push(Box::new(String::from("two")));
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.get(0).unwrap().downcast_ref::<i32>(), Some(&1));
        assert!(seq.get(1).unwrap().is::<String>());
    }

    #[test]
    fn fault_from_error_captures_the_chain() {
        #[derive(Debug, thiserror::Error)]
        #[error("outer failed")]
        struct Outer(#[source] std::io::Error);

        let err = Outer(std::io::Error::other("inner broke"));
        let fault = Fault::from_error(&err);
        assert_eq!(fault.message, "outer failed");
        assert!(fault.stack.contains("inner broke"));
        assert!(fault.type_name.contains("Outer"));
        assert_eq!(fault.as_fault(), Some(fault.clone()));
    }
}
