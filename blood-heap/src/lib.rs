//! # Blood Heap
//!
//! The heap-region manager of the Blood runtime. It carves OS-mapped memory
//! into typed regions, answers "which region owns this address" without
//! taking a lock, and implements the allocation and reclamation policy for
//! each kind of region:
//!
//! - **Nursery allocation**: bump allocation spread round robin across
//!   nursery regions, growing the nursery up to the minor-collection ceiling
//! - **Code space**: non-moving allocation for compiled code with in-place
//!   hole reuse and reverse lookup from any address to its code object
//! - **Stacks**: per-context stack regions resized by replace-and-copy
//! - **Snapshot layering**: promotion and demotion of regions across
//!   persisted snapshot hierarchy levels
//!
//! The collector, the snapshot writers and the scheduler are collaborators:
//! they drive this crate through [`MemMgr`] and plug in the object layout
//! ([`ObjectModel`]), the OS mapper ([`OsMemory`]) and the per-task stack
//! copier ([`TaskContext`]).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            MemMgr                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Nursery /  │  │  Code space  │  │    Stacks    │           │
//! │  │    locals    │  │  (code.rs)   │  │  (stack.rs)  │           │
//! │  │ (memmgr.rs)  │  └──────────────┘  └──────────────┘           │
//! │  └──────────────┘         │                 │                   │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │  Hierarchy   │  │ Address index│  │    Export    │           │
//! │  │(hierarchy.rs)│  │(space_tree.rs│  │ (export.rs)  │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Regions    │  │ Object tiling│  │   OS memory  │           │
//! │  │  (space.rs)  │  │  (object.rs) │  │  (osmem.rs)  │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use blood_heap::{HeapConfig, MemMgr};
//!
//! let config = HeapConfig::builder()
//!     .default_space_size(64 * 1024)
//!     .build()
//!     .unwrap();
//! let heap = MemMgr::with_defaults(config).unwrap();
//!
//! let span = heap.alloc_heap_space(4, 64).expect("collect and retry");
//! assert!(heap.space_for_address(span.start).is_some());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bitmap;
pub mod code;
pub mod config;
pub mod error;
pub mod export;
pub mod hierarchy;
pub mod memmgr;
pub mod object;
pub mod osmem;
pub mod space;
pub mod space_tree;
pub mod stack;

// Re-exports
pub use code::CodeAllocation;
pub use config::{ConfigError, HeapConfig, HeapConfigBuilder};
pub use error::{MemError, MemResult};
pub use export::{MemTableEntry, MemoryTable};
pub use memmgr::{HeapReport, HeapSpan, HeapStats, MemMgr};
pub use object::{LengthWord, ObjectModel, StandardObjectModel};
pub use osmem::{Mapping, OsMemory, Permissions, SystemMemory};
pub use space::{Space, SpaceDetail, SpaceFlags, SpaceType};
pub use space_tree::SpaceTree;
pub use stack::TaskContext;

/// An address in the managed heap.
pub type Address = usize;

/// Size of a heap word in bytes.
pub const WORD: usize = std::mem::size_of::<usize>();

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
