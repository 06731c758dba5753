//! Object tiling.
//!
//! Every region is tiled end to end by length-prefixed objects. Each object
//! is preceded by a length word; the object address is the address of the
//! word after it. The top byte of a length word carries flags and the rest
//! carries the object length in words, not counting the length word itself.
//!
//! ```text
//!   63      56 55                                   0
//!  ┌──────────┬──────────────────────────────────────┐
//!  │  flags   │            length (words)            │
//!  └──────────┴──────────────────────────────────────┘
//!   0x80 tombstone   0x40 mutable   0x03 type (word/byte/code/closure)
//! ```
//!
//! A tombstone length word replaces the length of an object that the
//! collector has copied elsewhere; the remaining bits hold the new address
//! shifted right by two.
//!
//! Unused memory is covered by byte objects ("holes" or fillers), which
//! scanners always skip.

use std::fmt;

use crate::{Address, WORD};

const FLAGS_SHIFT: u32 = usize::BITS - 8;

/// Largest object length that fits in a length word.
pub const MAX_OBJECT_SIZE: usize = (1 << FLAGS_SHIFT) - 1;

/// Object flag bits, held in the top byte of a length word.
pub mod flags {
    /// Mask for the type bits.
    pub const TYPE_MASK: u8 = 0x03;
    /// Ordinary object holding tagged words.
    pub const WORD_OBJ: u8 = 0x00;
    /// Object holding raw bytes. Also used for holes.
    pub const BYTE_OBJ: u8 = 0x01;
    /// Compiled code.
    pub const CODE_OBJ: u8 = 0x02;
    /// Closure.
    pub const CLOSURE_OBJ: u8 = 0x03;
    /// Object may be updated in place.
    pub const MUTABLE: u8 = 0x40;
    /// Length word holds a forwarding address.
    pub const TOMBSTONE: u8 = 0x80;
}

/// A decoded length word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LengthWord(usize);

impl LengthWord {
    /// Build a length word from a length and flags.
    pub const fn new(length: usize, flags: u8) -> Self {
        debug_assert!(length <= MAX_OBJECT_SIZE);
        Self(length | ((flags as usize) << FLAGS_SHIFT))
    }

    /// Build a tombstone pointing at `target`.
    pub const fn forwarding(target: Address) -> Self {
        Self((target >> 2) | ((flags::TOMBSTONE as usize) << FLAGS_SHIFT))
    }

    /// Reinterpret a raw word.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// The raw word.
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Flag byte.
    pub const fn flags(self) -> u8 {
        (self.0 >> FLAGS_SHIFT) as u8
    }

    /// Object length in words, excluding the length word.
    pub const fn length(self) -> usize {
        self.0 & MAX_OBJECT_SIZE
    }

    /// Whether this is a tombstone.
    pub const fn is_forwarded(self) -> bool {
        self.flags() & flags::TOMBSTONE != 0
    }

    /// The forwarding target of a tombstone.
    pub const fn forwarded_to(self) -> Option<Address> {
        if self.is_forwarded() {
            Some((self.0 & !((flags::TOMBSTONE as usize) << FLAGS_SHIFT)) << 2)
        } else {
            None
        }
    }

    /// Whether the object is a byte object (or a hole).
    pub const fn is_byte_object(self) -> bool {
        !self.is_forwarded() && self.flags() & flags::TYPE_MASK == flags::BYTE_OBJ
    }

    /// Whether the object is compiled code.
    pub const fn is_code_object(self) -> bool {
        !self.is_forwarded() && self.flags() & flags::TYPE_MASK == flags::CODE_OBJ
    }

    /// Whether the object is mutable.
    pub const fn is_mutable(self) -> bool {
        !self.is_forwarded() && self.flags() & flags::MUTABLE != 0
    }
}

impl fmt::Debug for LengthWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.forwarded_to() {
            Some(target) => write!(f, "LengthWord(forwarded -> {:#x})", target),
            None => f
                .debug_struct("LengthWord")
                .field("length", &self.length())
                .field("flags", &format_args!("{:#04x}", self.flags()))
                .finish(),
        }
    }
}

/// Object-model capability supplied by the runtime.
///
/// The manager needs just enough of the object layout to keep regions
/// tiled and to find object boundaries after a collection has left
/// forwarding pointers behind.
pub trait ObjectModel: Send + Sync + fmt::Debug {
    /// Read the length word of the object at `obj`.
    ///
    /// # Safety
    ///
    /// `obj - WORD` must be a readable word inside a live region.
    unsafe fn length_word(&self, obj: Address) -> LengthWord;

    /// Overwrite the length word of the object at `obj`.
    ///
    /// # Safety
    ///
    /// `obj - WORD` must be a writable word inside a live region that no
    /// other thread is scanning.
    unsafe fn set_length_word(&self, obj: Address, word: LengthWord);

    /// Follow tombstones until reaching an object that has not moved.
    ///
    /// # Safety
    ///
    /// Every object on the chain must be readable.
    unsafe fn follow_forwarding_chain(&self, obj: Address) -> Address {
        let mut current = obj;
        while let Some(next) = self.length_word(current).forwarded_to() {
            current = next;
        }
        current
    }
}

/// [`ObjectModel`] over the layout described in this module.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardObjectModel;

impl ObjectModel for StandardObjectModel {
    unsafe fn length_word(&self, obj: Address) -> LengthWord {
        LengthWord::from_raw(read_word(obj - WORD))
    }

    unsafe fn set_length_word(&self, obj: Address, word: LengthWord) {
        write_word(obj - WORD, word.raw());
    }
}

/// Read the word at `addr`.
///
/// # Safety
///
/// `addr` must be word aligned and readable.
#[inline]
pub unsafe fn read_word(addr: Address) -> usize {
    std::ptr::read(addr as *const usize)
}

/// Write the word at `addr`.
///
/// # Safety
///
/// `addr` must be word aligned and writable.
#[inline]
pub unsafe fn write_word(addr: Address, value: usize) {
    std::ptr::write(addr as *mut usize, value)
}

/// Tile `words` words starting at `base` with byte objects so that scanners
/// skip them. Large areas are covered by several objects.
///
/// # Safety
///
/// `base..base + words * WORD` must be writable and unused.
pub unsafe fn fill_unused_space(model: &dyn ObjectModel, base: Address, words: usize) {
    let mut remaining = words;
    let mut obj = base + WORD;
    while remaining > 0 {
        let length = (remaining - 1).min(MAX_OBJECT_SIZE);
        model.set_length_word(obj, LengthWord::new(length, flags::BYTE_OBJ));
        remaining -= length + 1;
        obj += (length + 1) * WORD;
    }
}

/// Iterate over the objects tiling `[bottom, top)`, yielding each object
/// address with its length, following forwarding to recover lengths.
///
/// # Safety
///
/// The range must be readable and tiled by valid objects.
pub unsafe fn for_each_object(
    model: &dyn ObjectModel,
    bottom: Address,
    top: Address,
    mut f: impl FnMut(Address, LengthWord),
) {
    let mut ptr = bottom;
    while ptr < top {
        let obj = ptr + WORD;
        let mut word = model.length_word(obj);
        if word.is_forwarded() {
            word = model.length_word(model.follow_forwarding_chain(obj));
        }
        f(obj, word);
        ptr += (word.length() + 1) * WORD;
    }
}
