//! OS memory mapping.
//!
//! Every region is carved out of memory obtained through an [`OsMemory`]
//! implementation. [`SystemMemory`] maps anonymous private pages with
//! `mmap`; tests substitute implementations that fail on demand.

use std::ffi::c_void;
use std::fmt;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use bitflags::bitflags;
use nix::errno::Errno;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::unistd::{sysconf, SysconfVar};
use tracing::warn;

use crate::error::{MemError, MemResult};
use crate::Address;

bitflags! {
    /// Access permissions for a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u8 {
        /// Readable.
        const READ = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXEC = 1 << 2;
    }
}

impl Permissions {
    /// Read and write.
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);
    /// Read, write and execute.
    pub const ALL: Self = Self::READ.union(Self::WRITE).union(Self::EXEC);

    #[cfg(unix)]
    fn to_prot(self) -> ProtFlags {
        let mut prot = ProtFlags::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= ProtFlags::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= ProtFlags::PROT_WRITE;
        }
        if self.contains(Self::EXEC) {
            prot |= ProtFlags::PROT_EXEC;
        }
        prot
    }
}

/// A range of memory returned by [`OsMemory::map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Base address, page aligned.
    pub base: Address,
    /// Size in bytes, rounded up to a whole number of pages.
    pub size: usize,
}

impl Mapping {
    /// One past the last byte of the mapping.
    pub fn end(&self) -> Address {
        self.base + self.size
    }
}

/// The OS mapping collaborator.
pub trait OsMemory: Send + Sync + fmt::Debug {
    /// Page size used for rounding.
    fn page_size(&self) -> usize;

    /// Map `size` bytes, rounded up to a page boundary, with `perms`.
    fn map(&self, size: usize, perms: Permissions) -> MemResult<Mapping>;

    /// Release a mapping previously returned by [`OsMemory::map`].
    ///
    /// # Safety
    ///
    /// `base..base + size` must have come from `map` on this object and
    /// nothing may access it afterwards.
    unsafe fn unmap(&self, base: Address, size: usize) -> MemResult<()>;

    /// Change the permissions of part of a mapping.
    ///
    /// # Safety
    ///
    /// The range must lie within a live mapping and no code may rely on the
    /// permissions being removed.
    unsafe fn set_permissions(&self, base: Address, size: usize, perms: Permissions) -> MemResult<()>;

    /// Round `size` up to a whole number of pages.
    fn round_up(&self, size: usize) -> usize {
        let page = self.page_size();
        size.div_ceil(page) * page
    }
}

/// Anonymous private mappings from the operating system.
#[derive(Debug, Clone, Copy)]
pub struct SystemMemory {
    page_size: usize,
}

impl SystemMemory {
    /// Create a mapper using the system page size.
    pub fn new() -> Self {
        Self { page_size: system_page_size() }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn system_page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => 4096,
    }
}

/// Non-null pointer for a range the caller guarantees is mapped.
fn mapped_ptr(base: Address, size: usize) -> MemResult<NonNull<c_void>> {
    NonNull::new(base as *mut c_void).ok_or(MemError::ProtectFailed { base, size, errno: Errno::EINVAL })
}

#[cfg(unix)]
impl OsMemory for SystemMemory {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn map(&self, size: usize, perms: Permissions) -> MemResult<Mapping> {
        let size = self.round_up(size.max(1));
        let length = NonZeroUsize::new(size).ok_or(MemError::MapFailed { size, errno: Errno::EINVAL })?;
        // SAFETY: anonymous private mapping at a kernel-chosen address.
        match unsafe { mman::mmap_anonymous(None, length, perms.to_prot(), MapFlags::MAP_PRIVATE) } {
            Ok(base) => Ok(Mapping { base: base.as_ptr() as Address, size }),
            Err(errno) => {
                warn!("Unable to map {} bytes: {}", size, errno);
                Err(MemError::MapFailed { size, errno })
            }
        }
    }

    unsafe fn unmap(&self, base: Address, size: usize) -> MemResult<()> {
        let addr = mapped_ptr(base, size)?;
        mman::munmap(addr, size).map_err(|errno| MemError::ProtectFailed { base, size, errno })
    }

    unsafe fn set_permissions(&self, base: Address, size: usize, perms: Permissions) -> MemResult<()> {
        let addr = mapped_ptr(base, size)?;
        mman::mprotect(addr, size, perms.to_prot()).map_err(|errno| MemError::ProtectFailed { base, size, errno })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rounds_to_pages() {
        let os = SystemMemory::new();
        let mapping = os.map(1, Permissions::READ_WRITE).unwrap();
        assert_eq!(mapping.size, os.page_size());
        assert_eq!(mapping.base % os.page_size(), 0);
        unsafe {
            // Fresh anonymous memory reads as zero and is writable.
            let p = mapping.base as *mut usize;
            assert_eq!(*p, 0);
            *p = 42;
            assert_eq!(*p, 42);
            os.unmap(mapping.base, mapping.size).unwrap();
        }
    }

    #[test]
    fn test_set_permissions() {
        let os = SystemMemory::new();
        let mapping = os.map(os.page_size() * 2, Permissions::READ_WRITE).unwrap();
        unsafe {
            os.set_permissions(mapping.base, mapping.size, Permissions::READ).unwrap();
            os.set_permissions(mapping.base, mapping.size, Permissions::READ_WRITE).unwrap();
            *(mapping.base as *mut u8) = 1;
            os.unmap(mapping.base, mapping.size).unwrap();
        }
    }

    #[test]
    fn test_round_up() {
        let os = SystemMemory::new();
        let page = os.page_size();
        assert_eq!(os.round_up(0), 0);
        assert_eq!(os.round_up(1), page);
        assert_eq!(os.round_up(page), page);
        assert_eq!(os.round_up(page + 1), 2 * page);
    }

    #[test]
    fn test_permissions_flags() {
        assert!(Permissions::ALL.contains(Permissions::EXEC));
        assert!(!Permissions::READ_WRITE.contains(Permissions::EXEC));
        assert_eq!(Permissions::READ_WRITE, Permissions::READ | Permissions::WRITE);
    }

    #[test]
    fn test_permissions_to_prot() {
        assert_eq!(Permissions::empty().to_prot(), ProtFlags::PROT_NONE);
        assert_eq!(Permissions::READ_WRITE.to_prot(), ProtFlags::PROT_READ | ProtFlags::PROT_WRITE);
        assert!(Permissions::ALL.to_prot().contains(ProtFlags::PROT_EXEC));
    }

    #[test]
    fn test_null_range_is_rejected() {
        let os = SystemMemory::new();
        let err = unsafe { os.set_permissions(0, os.page_size(), Permissions::READ) }.unwrap_err();
        assert!(matches!(err, MemError::ProtectFailed { errno: Errno::EINVAL, .. }));
    }

    #[test]
    fn test_limited_memory_refuses() {
        let os = testing::LimitedMemory::new(1);
        let mapping = os.map(16, Permissions::READ_WRITE).unwrap();
        assert!(os.map(16, Permissions::READ_WRITE).unwrap_err().is_out_of_memory());
        unsafe { os.unmap(mapping.base, mapping.size).unwrap() };
    }
}
