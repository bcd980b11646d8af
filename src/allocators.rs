//! Allocator types, both generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is a single-threaded, non-thread-safe heap manager. It routes
//! each request either to the program's data segment, where blocks are kept in
//! a [`BlockList`] and reused, or to a standalone anonymous mapping for large
//! requests. Because it is not thread-safe, it cannot be used as a global
//! allocator on its own.
//!
//! ### [`GenericAllocator`](struct.GenericAllocator.html)
//!
//! A `GenericAllocator` wraps `RawAlloc` with a spin lock to make it
//! thread-safe, allowing it to be used as the global allocator.
//!
//! ### [`MemoryProvider`](trait.MemoryProvider.html)
//!
//! `MemoryProvider` is a simple trait interface meant to abstract over the
//! calls to the OS to extend the data segment and to create and destroy
//! mappings.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a borrowed byte buffer that can pretend to be both a data
//! segment and a mapping area, and implements `MemoryProvider` for such a
//! purpose. It is mainly useful for testing.

use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::marker::PhantomData;
use core::ptr::{null_mut, NonNull};

use log::{debug, trace};
use spin::{Mutex, MutexGuard, Once};

use crate::blocklist::{
    align_up, Block, BlockList, Link, Stats, Status, Validity, ALIGNMENT, HEADER_SIZE,
};
use crate::config::{Config, PointerPolicy};
#[cfg(feature = "use_libc")]
use crate::unix::UnixProvider;

/// The provider call that failed, for fatal error reports.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProviderCall {
    ExtendSegment,
    CreateMapping,
    DestroyMapping,
}

impl fmt::Display for ProviderCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderCall::ExtendSegment => "extend_segment",
            ProviderCall::CreateMapping => "create_mapping",
            ProviderCall::DestroyMapping => "destroy_mapping",
        };
        f.write_str(name)
    }
}

/// The two sources of memory the allocator is built on.
///
/// Sizes passed in are already rounded to [`ALIGNMENT`] and include room for
/// a block header. There is no recovery from a failed call: the allocator
/// reports it and calls [`abort`](MemoryProvider::abort).
pub trait MemoryProvider {
    type Err: fmt::Display;

    /// Grow the data segment by exactly `size` bytes, returning the old end of
    /// the segment.
    ///
    /// # Safety
    ///
    /// The returned memory must be aligned to [`ALIGNMENT`], available, and
    /// untracked by any other rust code, including the allocator itself.
    unsafe fn extend_segment(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err>;

    /// The current end of the data segment.
    ///
    /// A tail block is only grown in place if it ends here; otherwise someone
    /// else has moved the segment end since the block was created.
    fn segment_end(&self) -> *const u8;

    /// Create a zero-filled mapping of `size` bytes.
    ///
    /// # Safety
    ///
    /// As for `extend_segment`.
    unsafe fn create_mapping(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err>;

    /// Destroy a mapping made by `create_mapping`.
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must be exactly those of a live mapping, and nothing
    /// may access that memory afterwards.
    unsafe fn destroy_mapping(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), Self::Err>;

    /// Report an unrecoverable error and stop.
    fn abort(&self, report: fmt::Arguments<'_>) -> ! {
        panic!("{}", report)
    }
}

/// A raw allocator, capable of growing the heap, returning pointers to new
/// allocations, and tracking and reusing freed memory.
///
/// Segment memory is never returned to the OS; mapped memory is returned as
/// soon as it is released.
pub struct RawAlloc<P> {
    provider: P,
    blocks: BlockList,
    config: Config,
    // Set once the segment has been extended for the first time.
    segment_seeded: bool,
    // Set once any mapping has been created.
    mapping_created: bool,
}

impl<P: MemoryProvider + Default> Default for RawAlloc<P> {
    fn default() -> Self {
        RawAlloc::new(P::default(), Config::DEFAULT)
    }
}

impl<P: MemoryProvider> RawAlloc<P> {
    /// Create a new `RawAlloc`
    pub const fn new(provider: P, config: Config) -> Self {
        RawAlloc {
            provider,
            blocks: BlockList::new(),
            config,
            segment_seeded: false,
            mapping_created: false,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn blocks(&self) -> &BlockList {
        &self.blocks
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether any mapping has been created since this allocator was made.
    pub fn mapping_created(&self) -> bool {
        self.mapping_created
    }

    /// Get statistics on this allocator, and verify validity of the BlockList
    pub fn stats(&self) -> (Validity, Stats) {
        self.blocks.stats()
    }

    /// The usable size of the live allocation at `ptr`, if there is one.
    pub fn usable_size(&self, ptr: *mut u8) -> Option<usize> {
        let (block, _) = self.find(NonNull::new(ptr)?)?;
        match block.status() {
            Status::Free => None,
            Status::OnSegment | Status::Mapped => Some(block.size()),
        }
    }

    ////////////////////////////////////////////////////////////
    // Public operations

    /// Allocate at least `size` bytes. Returns `None` if `size` is 0.
    ///
    /// # Safety
    ///
    /// The provider must uphold the contract of [`MemoryProvider`].
    pub unsafe fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let size = align_up(size)?;
        self.allocate_aligned(size)
    }

    /// Allocate room for `count` items of `size` bytes each, zeroed. Returns
    /// `None` if either is 0, or if the total overflows.
    ///
    /// # Safety
    ///
    /// The provider must uphold the contract of [`MemoryProvider`].
    pub unsafe fn allocate_zeroed(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        if count == 0 || size == 0 {
            return None;
        }
        let size = align_up(count.checked_mul(size)?)?;

        if size.checked_add(HEADER_SIZE)? >= self.config.zeroed_mmap_threshold {
            // Fresh mappings are already zeroed.
            return Some(self.map_block(size));
        }

        let ptr = self.allocate_aligned(size)?;
        ptr.as_ptr().write_bytes(0, size);
        Some(ptr)
    }

    /// Release the allocation at `ptr`. Null pointers are ignored; unknown
    /// pointers and double releases are handled according to
    /// [`Config::unknown_pointer`].
    ///
    /// # Safety
    ///
    /// If `ptr` was handed out by this allocator, nothing may access it after
    /// this call.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        let ptr = match NonNull::new(ptr) {
            None => return,
            Some(ptr) => ptr,
        };
        let (block, link) = match self.find(ptr) {
            None => return self.unknown_pointer("release", ptr),
            Some(found) => found,
        };

        match block.status() {
            Status::Free => self.double_release(ptr),
            Status::OnSegment => {
                trace!("Releasing {:?}", block);
                block.set_status(Status::Free);
                match link {
                    Link::After(previous) if self.blocks.coalesce(previous) => {
                        // `previous` now covers this block; pull in what
                        // followed it too.
                        self.blocks.coalesce(previous);
                    }
                    _ => {
                        self.blocks.coalesce(block);
                    }
                }
            }
            Status::Mapped => {
                trace!("Unmapping {:?}", block);
                let size = block.size() + HEADER_SIZE;
                self.blocks.unlink(link, block);
                self.destroy_mapping(NonNull::new_unchecked(block.start() as *mut u8), size);
            }
        }
    }

    /// Resize the allocation at `ptr` to at least `size` bytes, moving it if
    /// needed. The first `min(old, new)` bytes are preserved.
    ///
    /// A null `ptr` allocates; a `size` of 0 releases and returns `None`.
    /// Returns `None` without doing anything if `ptr` is not a live
    /// allocation.
    ///
    /// # Safety
    ///
    /// If a different pointer is returned, nothing may access `ptr` after this
    /// call.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
        let ptr = match NonNull::new(ptr) {
            None => return self.allocate(size),
            Some(ptr) => ptr,
        };
        if size == 0 {
            self.release(ptr.as_ptr());
            return None;
        }
        let size = align_up(size)?;

        let (block, _) = match self.find(ptr) {
            None => {
                self.unknown_pointer("reallocate", ptr);
                return None;
            }
            Some(found) => found,
        };

        match block.status() {
            Status::Free => {
                debug!("Refusing to reallocate released block {:?}", block);
                None
            }
            Status::OnSegment => self.resize_on_segment(block, size),
            // Mapped blocks are never resized in place.
            Status::Mapped => self.relocate(block, block.size(), size),
        }
    }

    ////////////////////////////////////////////////////////////
    // Routing

    unsafe fn allocate_aligned(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size.checked_add(HEADER_SIZE)? >= self.config.mmap_threshold {
            return Some(self.map_block(size));
        }

        if !self.segment_seeded {
            return Some(self.seed_segment());
        }

        Some(self.allocate_from_segment(size))
    }

    /// Give a request its own mapping, bypassing segment reuse.
    unsafe fn map_block(&mut self, size: usize) -> NonNull<u8> {
        let base = self.create_mapping(size + HEADER_SIZE);
        let block = Block::write(base, size, Status::Mapped);
        self.blocks.push_back(block);
        self.mapping_created = true;
        debug!("Mapped {:?}", block);
        block.payload()
    }

    /// Extend the segment for the first time, by a full threshold's worth, and
    /// hand the whole thing to the current request.
    unsafe fn seed_segment(&mut self) -> NonNull<u8> {
        let seed = align_up(self.config.mmap_threshold).unwrap_or(self.config.mmap_threshold);
        let base = self.extend_segment(seed);
        let block = Block::write(base, seed - HEADER_SIZE, Status::OnSegment);
        self.blocks.push_back(block);
        self.segment_seeded = true;
        debug!(
            "Seeded the segment with {:?} (after mapped blocks: {})",
            block, self.mapping_created
        );
        block.payload()
    }

    unsafe fn allocate_from_segment(&mut self, size: usize) -> NonNull<u8> {
        let merges = self.blocks.coalesce_all();
        trace!("Allocating {} bytes, after {} merges", size, merges);

        if let Some(block) = self.blocks.best_fit(size) {
            if block.size() >= size {
                self.blocks.split(block, size);
                block.set_status(Status::OnSegment);
                trace!("  Reusing {:?}", block);
                return block.payload();
            }

            // Nothing fits, but the tail is free and can grow.
            if self.expand_tail(block, size) {
                block.set_status(Status::OnSegment);
                trace!("  Grew free tail to {:?}", block);
                return block.payload();
            }
        }

        let base = self.extend_segment(size + HEADER_SIZE);
        let block = Block::write(base, size, Status::OnSegment);
        self.blocks.push_back(block);
        trace!("  New block {:?}", block);
        block.payload()
    }

    /// Grow the tail block in place to `size` bytes by extending the segment
    /// by the shortfall. Returns false if the segment no longer ends where the
    /// tail does.
    unsafe fn expand_tail(&mut self, block: Block, size: usize) -> bool {
        debug_assert_eq!(self.blocks.tail(), Some(block));
        if self.provider.segment_end() != block.end() {
            debug!("Segment end moved away from tail {:?}", block);
            return false;
        }

        let shortfall = size - block.size();
        let base = self.extend_segment(shortfall);
        debug_assert_eq!(base.as_ptr() as *const u8, block.end());
        block.set_size(size);
        true
    }

    unsafe fn resize_on_segment(&mut self, block: Block, size: usize) -> Option<NonNull<u8>> {
        if block.size() >= size {
            self.blocks.split(block, size);
            return Some(block.payload());
        }

        // Growth only leaves the segment once the payload alone reaches a
        // header past the threshold.
        if size >= self.config.mmap_threshold.checked_add(HEADER_SIZE)? {
            return self.relocate(block, block.size(), size);
        }

        let old_size = block.size();
        while block.size() < size {
            if !self.blocks.absorb_next(block) {
                break;
            }
        }
        if block.size() >= size {
            self.blocks.split(block, size);
            trace!("Grew {:?} into free neighbours", block);
            return Some(block.payload());
        }

        if self.blocks.tail() == Some(block) && self.expand_tail(block, size) {
            trace!("Grew tail {:?}", block);
            return Some(block.payload());
        }

        self.relocate(block, old_size, size)
    }

    /// Move the contents of `block` into a fresh allocation of `size` bytes,
    /// and release `block`.
    unsafe fn relocate(&mut self, block: Block, old_size: usize, size: usize) -> Option<NonNull<u8>> {
        let fresh = self.allocate_aligned(size)?;
        trace!("Moving {:?} to {:?}", block, fresh);
        core::ptr::copy_nonoverlapping(
            block.payload().as_ptr(),
            fresh.as_ptr(),
            old_size.min(size),
        );
        self.release(block.payload().as_ptr());
        Some(fresh)
    }

    /// Find the block for a payload pointer, and what precedes it.
    fn find(&self, ptr: NonNull<u8>) -> Option<(Block, Link)> {
        let block = Block::from_payload(ptr)?;
        let link = self.blocks.locate(block)?;
        Some((block, link))
    }

    fn unknown_pointer(&self, operation: &str, ptr: NonNull<u8>) {
        match self.config.unknown_pointer {
            PointerPolicy::Ignore => debug!("{}: ignoring unknown pointer {:?}", operation, ptr),
            PointerPolicy::Abort => self
                .provider
                .abort(format_args!("{}: {:?} was not allocated here", operation, ptr)),
        }
    }

    fn double_release(&self, ptr: NonNull<u8>) {
        match self.config.unknown_pointer {
            PointerPolicy::Ignore => debug!("release: {:?} is already free", ptr),
            PointerPolicy::Abort => self
                .provider
                .abort(format_args!("release: {:?} was released twice", ptr)),
        }
    }

    ////////////////////////////////////////////////////////////
    // Fail-fast wrappers around the provider

    fn fatal(&self, call: ProviderCall, err: P::Err) -> ! {
        log::error!("{} failed: {}", call, err);
        self.provider.abort(format_args!("{} failed: {}", call, err))
    }

    unsafe fn extend_segment(&mut self, size: usize) -> NonNull<u8> {
        match self.provider.extend_segment(size) {
            Ok(ptr) => ptr,
            Err(err) => self.fatal(ProviderCall::ExtendSegment, err),
        }
    }

    unsafe fn create_mapping(&mut self, size: usize) -> NonNull<u8> {
        match self.provider.create_mapping(size) {
            Ok(ptr) => ptr,
            Err(err) => self.fatal(ProviderCall::CreateMapping, err),
        }
    }

    unsafe fn destroy_mapping(&mut self, ptr: NonNull<u8>, size: usize) {
        if let Err(err) = self.provider.destroy_mapping(ptr, size) {
            self.fatal(ProviderCall::DestroyMapping, err)
        }
    }
}

fn default_config() -> Config {
    Config::DEFAULT
}

/// A thread-safe allocator, using a spin lock around a lazily created
/// RawAlloc.
///
/// Thread-safety is required for an allocator to be used as a global
/// allocator. The lock serializes every call; `RawAlloc` itself assumes a
/// single caller at a time.
///
/// Requests aligned to more than [`ALIGNMENT`] bytes are refused.
pub struct GenericAllocator<P> {
    raw: Once<Mutex<RawAlloc<P>>>,
    config: fn() -> Config,
}

impl<P: MemoryProvider + Default> Default for GenericAllocator<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> GenericAllocator<P> {
    pub const fn new() -> Self {
        Self::with_config(default_config)
    }

    /// `config` is called once, when the allocator is first used.
    pub const fn with_config(config: fn() -> Config) -> Self {
        GenericAllocator {
            raw: Once::new(),
            config,
        }
    }
}

impl<P: MemoryProvider + Default> GenericAllocator<P> {
    /// Get a reference to the underlying RawAlloc, creating it on first use.
    ///
    /// Allocation from other threads blocks while the guard is held.
    pub fn get_raw(&self) -> MutexGuard<'_, RawAlloc<P>> {
        self.raw
            .call_once(|| Mutex::new(RawAlloc::new(P::default(), (self.config)())))
            .lock()
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.get_raw().stats()
    }
}

fn into_raw(ptr: Option<NonNull<u8>>) -> *mut u8 {
    ptr.map_or(null_mut(), NonNull::as_ptr)
}

unsafe impl<P: MemoryProvider + Default + Send> GlobalAlloc for GenericAllocator<P> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        into_raw(self.get_raw().allocate(layout.size()))
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        into_raw(self.get_raw().allocate_zeroed(1, layout.size()))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.get_raw().release(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        into_raw(self.get_raw().reallocate(ptr, new_size))
    }
}

/// The allocator to install with `#[global_allocator]` on Unix: the program
/// break for small requests, `mmap` for large ones.
///
/// Log records are emitted while the allocator lock is held, so a logger that
/// allocates must not be enabled for this crate when this is the global
/// allocator.
#[cfg(feature = "use_libc")]
pub struct UnixAllocator {
    alloc: GenericAllocator<UnixProvider>,
}

#[cfg(feature = "use_libc")]
impl Default for UnixAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "use_libc")]
impl UnixAllocator {
    /// An allocator using [`Config::for_system`].
    pub const fn new() -> Self {
        Self::with_config(Config::for_system)
    }

    pub const fn with_config(config: fn() -> Config) -> Self {
        UnixAllocator {
            alloc: GenericAllocator::with_config(config),
        }
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.alloc.stats()
    }
}

#[cfg(feature = "use_libc")]
unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc(layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc_zeroed(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.alloc.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.alloc.realloc(ptr, layout, new_size)
    }
}

/// A pretend address space over a borrowed buffer.
///
/// The segment grows up from the bottom of the buffer and mappings are carved
/// down from the top. Destroying the lowest mapping gives its space back;
/// destroying any other mapping leaves a hole that is never reused.
pub struct ToyHeap<'a> {
    base: NonNull<u8>,
    len: usize,
    mapping_floor: usize,
    /// Bytes the segment has been extended by.
    pub segment_size: usize,
    /// Number of successful segment extensions.
    pub extensions: usize,
    /// Number of mappings ever created.
    pub mappings_created: usize,
    /// Number of mappings not yet destroyed.
    pub live_mappings: usize,
    /// Bytes in mappings not yet destroyed.
    pub mapped_bytes: usize,
    _memory: PhantomData<&'a mut [u8]>,
}

impl<'a> ToyHeap<'a> {
    pub fn new(memory: &'a mut [u8]) -> Self {
        let offset = memory.as_ptr().align_offset(ALIGNMENT).min(memory.len());
        let usable = &mut memory[offset..];
        let len = usable.len() & !(ALIGNMENT - 1);
        ToyHeap {
            base: NonNull::from(usable).cast(),
            len,
            mapping_floor: len,
            segment_size: 0,
            extensions: 0,
            mappings_created: 0,
            live_mappings: 0,
            mapped_bytes: 0,
            _memory: PhantomData,
        }
    }

    /// Bytes neither in the segment nor in a mapping.
    pub fn available(&self) -> usize {
        self.mapping_floor - self.segment_size
    }

    fn overflow(&self, requested: usize) -> ToyHeapError {
        ToyHeapError::Overflow {
            requested,
            available: self.available(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ToyHeapError {
    Overflow { requested: usize, available: usize },
    NotMapped { offset: usize, size: usize },
}

impl fmt::Display for ToyHeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToyHeapError::Overflow {
                requested,
                available,
            } => write!(
                f,
                "toy heap exhausted: {} bytes requested, {} available",
                requested, available
            ),
            ToyHeapError::NotMapped { offset, size } => {
                write!(f, "no mapping of {} bytes at offset {}", size, offset)
            }
        }
    }
}

impl<'a> MemoryProvider for ToyHeap<'a> {
    type Err = ToyHeapError;

    unsafe fn extend_segment(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err> {
        if size > self.available() || size % ALIGNMENT != 0 {
            return Err(self.overflow(size));
        }

        let ptr = self.base.as_ptr().add(self.segment_size);
        self.segment_size += size;
        self.extensions += 1;
        Ok(NonNull::new_unchecked(ptr))
    }

    fn segment_end(&self) -> *const u8 {
        self.base.as_ptr().wrapping_add(self.segment_size)
    }

    unsafe fn create_mapping(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err> {
        if size > self.available() || size % ALIGNMENT != 0 {
            return Err(self.overflow(size));
        }

        self.mapping_floor -= size;
        let ptr = self.base.as_ptr().add(self.mapping_floor);
        ptr.write_bytes(0, size);
        self.mappings_created += 1;
        self.live_mappings += 1;
        self.mapped_bytes += size;
        Ok(NonNull::new_unchecked(ptr))
    }

    unsafe fn destroy_mapping(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), Self::Err> {
        let offset = (ptr.as_ptr() as usize).wrapping_sub(self.base.as_ptr() as usize);
        let in_range = offset >= self.mapping_floor
            && offset
                .checked_add(size)
                .map_or(false, |end| end <= self.len);
        if !in_range || self.live_mappings == 0 {
            return Err(ToyHeapError::NotMapped { offset, size });
        }

        if offset == self.mapping_floor {
            self.mapping_floor += size;
        }
        self.live_mappings -= 1;
        self.mapped_bytes -= size;
        Ok(())
    }
}
