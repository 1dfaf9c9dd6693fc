//! Tagged value slots and reference-counted heap blocks.
//!
//! A value slot is 16 bytes: a 16-bit type tag, a 16-bit subtype, padding
//! up to 8 bytes and an 8-byte payload. Reference-countable payloads point
//! at a heap block whose first field is a 32-bit count. Generated code only
//! ever touches the tag word and that count, through the offsets below.

use std::cell::Cell;
use std::fmt;
use std::mem::offset_of;

/// Type tags.
pub mod tags {
    pub const T_ARRAY: u16 = 0;
    pub const T_MAPPING: u16 = 1;
    pub const T_MULTISET: u16 = 2;
    pub const T_OBJECT: u16 = 3;
    pub const T_FUNCTION: u16 = 4;
    pub const T_PROGRAM: u16 = 5;
    pub const T_STRING: u16 = 6;
    pub const T_TYPE: u16 = 7;
    pub const T_INT: u16 = 8;
    pub const T_FLOAT: u16 = 9;
    pub const T_VOID: u16 = 16;
    /// Identifier slot of an object, the second half of a global lvalue.
    pub const T_OBJ_INDEX: u16 = 17;
    /// Pointer to a value slot, the first half of a local lvalue.
    pub const T_SVALUE_PTR: u16 = 18;

    /// Highest reference-countable tag. Every tag at or below it carries a
    /// heap block with a count at offset 0.
    pub const MAX_REF_TYPE: u16 = T_TYPE;

    /// Bits of the tag word that hold the type; the rest is the subtype.
    pub const TYPE_MASK: u16 = 0x1f;

    /// Subtype of `T_INT` marking the "undefined" zero.
    pub const NUMBER_UNDEFINED: u16 = 1;

    /// Subtype of `T_STRING` pushed by arrow-indexing opcodes.
    pub const STRING_ARROW: u16 = 1;
}

use tags::*;

/// Offset of the tag word inside a value slot.
pub const SVALUE_TYPE_OFFSET: i32 = offset_of!(Svalue, type_) as i32;
/// Offset of the payload inside a value slot.
pub const SVALUE_PAYLOAD_OFFSET: i32 = offset_of!(Svalue, payload) as i32;
/// Size of one value slot.
pub const SVALUE_SIZE: i32 = std::mem::size_of::<Svalue>() as i32;
/// Offset of the count field inside every reference-counted heap block.
pub const REFS_OFFSET: i32 = offset_of!(HeapString, refs) as i32;

/// The one classification of "reference-countable" shared by the runtime
/// and the inlined sequences in `jit::refcount`.
pub fn is_ref_type(type_word: u32) -> bool {
    (type_word & TYPE_MASK as u32) <= MAX_REF_TYPE as u32
}

thread_local! {
    static RELEASES: Cell<usize> = const { Cell::new(0) };
}

/// Number of heap blocks released on the current thread.
pub fn release_count() -> usize {
    RELEASES.with(|c| c.get())
}

fn note_release() {
    RELEASES.with(|c| c.set(c.get() + 1));
}

/// A VM value slot.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Svalue {
    pub type_: u16,
    pub subtype: u16,
    pad: u32,
    pub payload: u64,
}

const _: () = assert!(std::mem::size_of::<Svalue>() == 16);

/// Heap block behind `T_STRING`.
#[repr(C)]
pub struct HeapString {
    pub refs: i32,
    pub text: String,
}

/// Heap block behind `T_ARRAY`.
#[repr(C)]
pub struct HeapArray {
    pub refs: i32,
    pub items: Vec<Svalue>,
}

/// Heap block behind `T_OBJECT` and `T_FUNCTION`.
#[repr(C)]
pub struct Object {
    pub refs: i32,
    pub globals: Vec<Svalue>,
}

const _: () = assert!(offset_of!(HeapArray, refs) == 0);
const _: () = assert!(offset_of!(Object, refs) == 0);

impl Svalue {
    pub const fn with_type(type_: u16, subtype: u16, payload: u64) -> Self {
        Svalue {
            type_,
            subtype,
            pad: 0,
            payload,
        }
    }

    pub const fn int(n: i64) -> Self {
        Self::with_type(T_INT, 0, n as u64)
    }

    pub const fn undefined() -> Self {
        Self::with_type(T_INT, NUMBER_UNDEFINED, 0)
    }

    pub fn float(f: f64) -> Self {
        Self::with_type(T_FLOAT, 0, f.to_bits())
    }

    /// A fresh string holding one reference.
    pub fn string(text: &str) -> Self {
        let block = Box::new(HeapString {
            refs: 1,
            text: text.to_string(),
        });
        Self::with_type(T_STRING, 0, Box::into_raw(block) as u64)
    }

    /// A fresh array holding one reference; takes ownership of `items`.
    pub fn array(items: Vec<Svalue>) -> Self {
        let block = Box::new(HeapArray { refs: 1, items });
        Self::with_type(T_ARRAY, 0, Box::into_raw(block) as u64)
    }

    /// A fresh object holding one reference, with `globals` as storage.
    pub fn object(globals: Vec<Svalue>) -> Self {
        let block = Box::new(Object { refs: 1, globals });
        Self::with_type(T_OBJECT, 0, Box::into_raw(block) as u64)
    }

    /// The type with the subtype bits stripped.
    pub fn type_tag(&self) -> u16 {
        self.type_ & TYPE_MASK
    }

    pub fn is_ref_counted(&self) -> bool {
        is_ref_type(self.type_ as u32)
    }

    pub fn as_int(&self) -> Option<i64> {
        (self.type_tag() == T_INT).then_some(self.payload as i64)
    }

    pub fn is_truthy(&self) -> bool {
        match self.type_tag() {
            T_INT => self.payload != 0,
            T_FLOAT => f64::from_bits(self.payload) != 0.0,
            T_VOID => false,
            _ => true,
        }
    }

    /// Current count of the referenced heap block.
    pub fn refs(&self) -> Option<i32> {
        if !self.is_ref_counted() || self.payload == 0 {
            return None;
        }
        // SAFETY: reference-countable payloads always point at a live block
        // whose first field is the count.
        Some(unsafe { *(self.payload as *const i32) })
    }

    pub fn as_str(&self) -> Option<&str> {
        if self.type_tag() != T_STRING {
            return None;
        }
        // SAFETY: `T_STRING` payloads point at a `HeapString`.
        Some(unsafe { &(*(self.payload as *const HeapString)).text })
    }

    /// Take one more reference.
    ///
    /// # Safety
    /// The payload of a reference-countable value must point at a live block.
    pub unsafe fn add_ref(&self) {
        if self.is_ref_counted() {
            unsafe { *(self.payload as *mut i32) += 1 };
        }
    }

    /// Drop one reference, releasing the block when the count reaches zero.
    ///
    /// # Safety
    /// The payload of a reference-countable value must point at a live block
    /// and the caller must own the reference being dropped.
    pub unsafe fn free(&mut self) {
        if !self.is_ref_counted() {
            return;
        }
        let refs = self.payload as *mut i32;
        unsafe {
            *refs -= 1;
            if *refs == 0 {
                really_free(self);
            }
        }
    }
}

/// Type-specific teardown of a block whose count already reached zero.
///
/// # Safety
/// `sv` must be reference-countable and its block must have a zero count.
pub unsafe fn really_free(sv: &Svalue) {
    note_release();
    unsafe {
        match sv.type_tag() {
            T_STRING => drop(Box::from_raw(sv.payload as *mut HeapString)),
            T_ARRAY => {
                let mut block = Box::from_raw(sv.payload as *mut HeapArray);
                for item in block.items.iter_mut() {
                    item.free();
                }
            }
            T_OBJECT | T_FUNCTION => {
                let mut block = Box::from_raw(sv.payload as *mut Object);
                for global in block.globals.iter_mut() {
                    global.free();
                }
            }
            other => {
                tracing::warn!(tag = other, "release of a block type the runtime never allocates");
            }
        }
    }
}

impl Default for Svalue {
    fn default() -> Self {
        Svalue::int(0)
    }
}

impl fmt::Debug for Svalue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Svalue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.type_tag() {
            T_INT if self.subtype == NUMBER_UNDEFINED => write!(f, "UNDEFINED"),
            T_INT => write!(f, "{}", self.payload as i64),
            T_FLOAT => write!(f, "{}", f64::from_bits(self.payload)),
            T_STRING => match self.as_str() {
                Some(s) => write!(f, "{:?}", s),
                None => write!(f, "<string>"),
            },
            T_ARRAY => {
                // SAFETY: `T_ARRAY` payloads point at a `HeapArray`.
                let items = unsafe { &(*(self.payload as *const HeapArray)).items };
                write!(f, "({{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "}})")
            }
            T_OBJECT => write!(f, "<object>"),
            T_FUNCTION => write!(f, "<function {}>", self.subtype),
            T_VOID => write!(f, "void"),
            T_OBJ_INDEX => write!(f, "<global {}>", self.payload),
            T_SVALUE_PTR => write!(f, "<lvalue>"),
            other => write!(f, "<type {}>", other),
        }
    }
}
