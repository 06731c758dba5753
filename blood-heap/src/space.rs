//! Region descriptors.
//!
//! A [`Space`] describes one contiguous range of mapped memory and its role
//! in the heap. The kind-specific state lives in [`SpaceDetail`]:
//!
//! | Kind | State | Reclaimed by |
//! |------|-------|--------------|
//! | Local (incl. nursery) | [`LocalState`] | copying collection |
//! | Code | [`CodeState`] | in-place hole reuse |
//! | Stack | none | thread exit |
//! | Permanent / Export | [`PermanentState`] | never (until demoted) |
//!
//! Descriptors are shared as `Arc<Space>`. Fields that change after
//! registration are atomics: the collector reads and writes the local
//! cursors directly while the world is stopped, and stack resizing swaps
//! `bottom`/`top` under the stack-space lock.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::OnceLock;

use bitflags::bitflags;

use crate::bitmap::Bitmap;
use crate::error::MemResult;
use crate::{Address, WORD};

/// Region kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SpaceType {
    /// Committed region from the initial heap or an imported snapshot.
    Permanent = 0,
    /// Collectable region, including nurseries.
    Local = 1,
    /// Executable region for compiled code.
    Code = 2,
    /// Execution-context stack.
    Stack = 3,
    /// Staging region of an in-progress snapshot.
    Export = 4,
}

impl SpaceType {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SpaceType::Permanent,
            1 => SpaceType::Local,
            2 => SpaceType::Code,
            3 => SpaceType::Stack,
            _ => SpaceType::Export,
        }
    }

    /// Short name for diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            SpaceType::Permanent => "permanent",
            SpaceType::Local => "local",
            SpaceType::Code => "code",
            SpaceType::Stack => "stack",
            SpaceType::Export => "export",
        }
    }
}

impl fmt::Display for SpaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Flags describing a permanent or exported region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SpaceFlags: u32 {
        /// Contents may be updated.
        const WRITEABLE = 1 << 0;
        /// Contents must not be overwritten when the snapshot is reloaded.
        const NO_OVERWRITE = 1 << 1;
        /// Region holds only byte objects.
        const BYTES = 1 << 2;
        /// Region holds code.
        const EXECUTABLE = 1 << 3;
    }
}

/// Generational scan boundaries of a local region.
///
/// These belong to the collector; the manager only initialises them. Each
/// is an address within the region.
#[derive(Debug, Default)]
pub struct ScanBounds {
    /// Top of the area scanned by a minor collection.
    pub partial_gc_top: AtomicUsize,
    /// Scan cursor of a minor collection.
    pub partial_gc_scan: AtomicUsize,
    /// Base of the roots retained by a minor collection.
    pub partial_gc_root_base: AtomicUsize,
    /// Top of the roots retained by a minor collection.
    pub partial_gc_root_top: AtomicUsize,
    /// Start of the range a full collection must rescan.
    pub full_gc_rescan_start: AtomicUsize,
    /// End of the range a full collection must rescan.
    pub full_gc_rescan_end: AtomicUsize,
    /// Lowest address a full collection may copy into.
    pub full_gc_lower_limit: AtomicUsize,
    /// Lowest weak reference seen.
    pub lowest_weak: AtomicUsize,
    /// Highest weak reference seen.
    pub highest_weak: AtomicUsize,
}

impl ScanBounds {
    fn fresh(bottom: Address, top: Address) -> Self {
        let b = || AtomicUsize::new(bottom);
        let t = || AtomicUsize::new(top);
        Self {
            partial_gc_top: t(),
            partial_gc_scan: b(),
            partial_gc_root_base: b(),
            partial_gc_root_top: b(),
            full_gc_rescan_start: t(),
            full_gc_rescan_end: b(),
            full_gc_lower_limit: t(),
            lowest_weak: t(),
            highest_weak: b(),
        }
    }
}

/// State of a local region.
#[derive(Debug)]
pub struct LocalState {
    lower_alloc: AtomicUsize,
    upper_alloc: AtomicUsize,
    is_nursery: AtomicBool,
    /// Collector scan boundaries.
    pub bounds: ScanBounds,
    /// Object-start bitmap for mark and compaction bookkeeping.
    pub bitmap: Bitmap,
}

impl LocalState {
    /// Allocation cursor growing upward from the bottom.
    pub fn lower_alloc(&self) -> Address {
        self.lower_alloc.load(Ordering::Acquire)
    }

    /// Set the lower allocation cursor.
    pub fn set_lower_alloc(&self, addr: Address) {
        self.lower_alloc.store(addr, Ordering::Release);
    }

    /// Boundary below which the collector has placed surviving data.
    pub fn upper_alloc(&self) -> Address {
        self.upper_alloc.load(Ordering::Acquire)
    }

    /// Set the upper allocation cursor.
    pub fn set_upper_alloc(&self, addr: Address) {
        self.upper_alloc.store(addr, Ordering::Release);
    }

    /// Whether this is a nursery region.
    pub fn is_nursery(&self) -> bool {
        self.is_nursery.load(Ordering::Acquire)
    }

    pub(crate) fn set_nursery(&self, nursery: bool) {
        self.is_nursery.store(nursery, Ordering::Release);
    }
}

/// State of a code region.
///
/// `first_free` and `largest_free` are only changed under the code-space
/// lock or while the collector has stopped the world.
#[derive(Debug)]
pub struct CodeState {
    first_free: AtomicUsize,
    largest_free: AtomicUsize,
    /// One bit per word; set on the length word of every live code object.
    pub header_map: Bitmap,
}

impl CodeState {
    /// Address before which there is no usable hole.
    pub fn first_free(&self) -> Address {
        self.first_free.load(Ordering::Acquire)
    }

    /// Set the first-free cursor. The collector resets it after sweeping.
    pub fn set_first_free(&self, addr: Address) {
        self.first_free.store(addr, Ordering::Release);
    }

    /// Length of the largest hole at or above `first_free` seen by the last
    /// allocation scan, in words, excluding its length word.
    pub fn largest_free(&self) -> usize {
        self.largest_free.load(Ordering::Acquire)
    }

    /// Set the largest-hole bound.
    pub fn set_largest_free(&self, words: usize) {
        self.largest_free.store(words, Ordering::Release);
    }
}

/// State of a permanent or export region.
#[derive(Debug)]
pub struct PermanentState {
    no_overwrite: bool,
    byte_only: bool,
    top_pointer: AtomicUsize,
    pub(crate) profile_map: OnceLock<Bitmap>,
}

impl PermanentState {
    /// Whether the contents must not be overwritten on reload.
    pub fn no_overwrite(&self) -> bool {
        self.no_overwrite
    }

    /// Whether the region holds only byte objects.
    pub fn byte_only(&self) -> bool {
        self.byte_only
    }

    /// High-water mark while an export region is being populated.
    pub fn top_pointer(&self) -> Address {
        self.top_pointer.load(Ordering::Acquire)
    }

    /// Set the high-water mark.
    pub fn set_top_pointer(&self, addr: Address) {
        self.top_pointer.store(addr, Ordering::Release);
    }

    /// The on-demand header map, if it has been built.
    pub fn profile_map(&self) -> Option<&Bitmap> {
        self.profile_map.get()
    }
}

/// Kind-specific state.
#[derive(Debug)]
pub enum SpaceDetail {
    /// Local or nursery region.
    Local(LocalState),
    /// Code region.
    Code(CodeState),
    /// Stack region.
    Stack,
    /// Permanent or export region.
    Permanent(PermanentState),
}

/// A region of mapped memory.
pub struct Space {
    kind: AtomicU8,
    bottom: AtomicUsize,
    top: AtomicUsize,
    is_mutable: AtomicBool,
    is_code: bool,
    owns_mapping: AtomicBool,
    index: u32,
    hierarchy: AtomicU32,
    detail: SpaceDetail,
}

impl Space {
    #[allow(clippy::too_many_arguments)]
    fn with_detail(
        kind: SpaceType,
        bottom: Address,
        top: Address,
        is_mutable: bool,
        is_code: bool,
        owns_mapping: bool,
        index: u32,
        hierarchy: u32,
        detail: SpaceDetail,
    ) -> Self {
        Self {
            kind: AtomicU8::new(kind as u8),
            bottom: AtomicUsize::new(bottom),
            top: AtomicUsize::new(top),
            is_mutable: AtomicBool::new(is_mutable),
            is_code,
            owns_mapping: AtomicBool::new(owns_mapping),
            index,
            hierarchy: AtomicU32::new(hierarchy),
            detail,
        }
    }

    /// A local region with fresh cursors: empty, all free.
    pub(crate) fn new_local(bottom: Address, top: Address, mutable: bool, nursery: bool) -> MemResult<Self> {
        let state = LocalState {
            lower_alloc: AtomicUsize::new(bottom),
            upper_alloc: AtomicUsize::new(top),
            is_nursery: AtomicBool::new(nursery),
            bounds: ScanBounds::fresh(bottom, top),
            bitmap: Bitmap::new((top - bottom) / WORD)?,
        };
        Ok(Self::with_detail(SpaceType::Local, bottom, top, mutable, false, true, 0, 0, SpaceDetail::Local(state)))
    }

    /// A local region whose whole extent is already occupied by old data.
    pub(crate) fn new_full_local(bottom: Address, top: Address, mutable: bool, index: u32) -> MemResult<Self> {
        let mut space = Self::new_local(bottom, top, mutable, false)?;
        space.index = index;
        if let Some(local) = space.local() {
            local.set_lower_alloc(bottom);
            local.set_upper_alloc(bottom);
            local.bounds.full_gc_lower_limit.store(bottom, Ordering::Release);
        }
        Ok(space)
    }

    /// A code region. The caller tiles it and sets the header bits.
    pub(crate) fn new_code(bottom: Address, top: Address, index: u32) -> MemResult<Self> {
        let words = (top - bottom) / WORD;
        let state = CodeState {
            first_free: AtomicUsize::new(bottom),
            largest_free: AtomicUsize::new(words.saturating_sub(1)),
            header_map: Bitmap::new(words)?,
        };
        Ok(Self::with_detail(SpaceType::Code, bottom, top, true, true, true, index, 0, SpaceDetail::Code(state)))
    }

    /// A stack region.
    pub(crate) fn new_stack(bottom: Address, top: Address) -> Self {
        Self::with_detail(SpaceType::Stack, bottom, top, true, false, true, 0, 0, SpaceDetail::Stack)
    }

    /// A permanent or export region.
    pub(crate) fn new_permanent(
        kind: SpaceType,
        bottom: Address,
        top: Address,
        flags: SpaceFlags,
        index: u32,
        hierarchy: u32,
        owns_mapping: bool,
    ) -> Self {
        debug_assert!(matches!(kind, SpaceType::Permanent | SpaceType::Export));
        let top_pointer = if kind == SpaceType::Export { bottom } else { top };
        let state = PermanentState {
            no_overwrite: flags.contains(SpaceFlags::NO_OVERWRITE),
            byte_only: flags.contains(SpaceFlags::BYTES),
            top_pointer: AtomicUsize::new(top_pointer),
            profile_map: OnceLock::new(),
        };
        Self::with_detail(
            kind,
            bottom,
            top,
            flags.contains(SpaceFlags::WRITEABLE),
            flags.contains(SpaceFlags::EXECUTABLE),
            owns_mapping,
            index,
            hierarchy,
            SpaceDetail::Permanent(state),
        )
    }

    /// Region kind.
    pub fn kind(&self) -> SpaceType {
        SpaceType::from_u8(self.kind.load(Ordering::Acquire))
    }

    pub(crate) fn set_kind(&self, kind: SpaceType) {
        self.kind.store(kind as u8, Ordering::Release);
    }

    /// Lowest address of the region.
    pub fn bottom(&self) -> Address {
        self.bottom.load(Ordering::Acquire)
    }

    /// One past the highest address of the region.
    pub fn top(&self) -> Address {
        self.top.load(Ordering::Acquire)
    }

    pub(crate) fn set_bounds(&self, bottom: Address, top: Address) {
        self.bottom.store(bottom, Ordering::Release);
        self.top.store(top, Ordering::Release);
    }

    /// Size in words.
    pub fn size_words(&self) -> usize {
        (self.top() - self.bottom()) / WORD
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.top() - self.bottom()
    }

    /// Whether `addr` lies in `[bottom, top)`.
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.bottom() && addr < self.top()
    }

    /// Whether the region may hold mutable data.
    pub fn is_mutable(&self) -> bool {
        self.is_mutable.load(Ordering::Acquire)
    }

    /// Mark or unmark the region as mutable.
    ///
    /// The collector clears this on code regions once it has scanned them.
    pub fn set_mutable(&self, mutable: bool) {
        self.is_mutable.store(mutable, Ordering::Release);
    }

    /// Whether the region holds code.
    pub fn is_code(&self) -> bool {
        self.is_code
    }

    /// Whether releasing the region must unmap its memory.
    pub fn owns_mapping(&self) -> bool {
        self.owns_mapping.load(Ordering::Acquire)
    }

    pub(crate) fn set_owns_mapping(&self, owns: bool) {
        self.owns_mapping.store(owns, Ordering::Release);
    }

    /// Stable identity used by snapshots.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Snapshot hierarchy level.
    pub fn hierarchy(&self) -> u32 {
        self.hierarchy.load(Ordering::Acquire)
    }

    pub(crate) fn set_hierarchy(&self, level: u32) {
        self.hierarchy.store(level, Ordering::Release);
    }

    /// Kind-specific state.
    pub fn detail(&self) -> &SpaceDetail {
        &self.detail
    }

    /// Local state, if this is a local region.
    pub fn local(&self) -> Option<&LocalState> {
        match &self.detail {
            SpaceDetail::Local(state) => Some(state),
            _ => None,
        }
    }

    /// Code state, if this is a code region.
    pub fn code(&self) -> Option<&CodeState> {
        match &self.detail {
            SpaceDetail::Code(state) => Some(state),
            _ => None,
        }
    }

    /// Permanent state, if this is a permanent or export region.
    pub fn permanent(&self) -> Option<&PermanentState> {
        match &self.detail {
            SpaceDetail::Permanent(state) => Some(state),
            _ => None,
        }
    }

    /// Whether this is a nursery region.
    pub fn is_nursery(&self) -> bool {
        self.local().is_some_and(LocalState::is_nursery)
    }

    /// Free words in a local region.
    pub fn free_space(&self) -> usize {
        self.local()
            .map(|l| (l.upper_alloc() - l.lower_alloc()) / WORD)
            .unwrap_or(0)
    }

    /// Allocated words in a local region.
    pub fn allocated_space(&self) -> usize {
        self.local()
            .map(|l| ((self.top() - l.upper_alloc()) + (l.lower_alloc() - self.bottom())) / WORD)
            .unwrap_or(0)
    }

    /// Flags as seen by snapshot writers.
    pub fn flags(&self) -> SpaceFlags {
        let mut flags = SpaceFlags::empty();
        if self.is_mutable() {
            flags |= SpaceFlags::WRITEABLE;
        }
        if self.is_code {
            flags |= SpaceFlags::EXECUTABLE;
        }
        if let Some(p) = self.permanent() {
            if p.no_overwrite {
                flags |= SpaceFlags::NO_OVERWRITE;
            }
            if p.byte_only {
                flags |= SpaceFlags::BYTES;
            }
        }
        flags
    }
}

impl fmt::Debug for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Space")
            .field("kind", &self.kind())
            .field("bottom", &format_args!("{:#x}", self.bottom()))
            .field("top", &format_args!("{:#x}", self.top()))
            .field("mutable", &self.is_mutable())
            .field("code", &self.is_code)
            .field("index", &self.index)
            .field("hierarchy", &self.hierarchy())
            .finish()
    }
}
