#![cfg_attr(not(test), no_std)]

//! A best-fit heap allocator built on two sources of memory: the program's
//! data segment, grown with `sbrk`, and anonymous mappings from `mmap`.
//!
//! Small requests are carved out of the segment. Every block, free or not,
//! carries a header and sits in a single [`BlockList`](blocklist::BlockList);
//! free blocks are merged with free neighbours before each search, split when
//! they are larger than needed, and the last block grows in place when the
//! segment can be extended right behind it. Released segment memory is kept for
//! reuse and never returned to the OS.
//!
//! Requests at or above a threshold (128 KiB by default, or one page for
//! zeroed requests) each get their own mapping, which is unmapped as soon as
//! it is released.
//!
//! [`RawAlloc`](allocators::RawAlloc) is the single-threaded engine. To use it
//! as the global allocator on Unix, wrap it in a lock with
//! [`UnixAllocator`](allocators::UnixAllocator):
//!
//! ```no_run
//! use brk_allocator::UnixAllocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: UnixAllocator = UnixAllocator::new();
//!
//! fn main() {
//!     let v: Vec<u64> = (0..1000).collect();
//!     assert_eq!(v.len(), 1000);
//! }
//! ```

pub mod allocators;
pub mod blocklist;
pub mod config;
#[cfg(feature = "use_libc")]
pub mod unix;

pub use allocators::{GenericAllocator, MemoryProvider, RawAlloc, ToyHeap};
#[cfg(feature = "use_libc")]
pub use allocators::UnixAllocator;
pub use config::{Config, PointerPolicy};
