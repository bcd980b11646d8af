use core::fmt;
use core::ops::Range;
use core::ptr::NonNull;

use static_assertions::{const_assert, const_assert_eq};

/// Every payload size and every header boundary is a multiple of this.
pub const ALIGNMENT: usize = 16;

/// The space reserved in front of every payload for its [`BlockHeader`].
///
/// The header always sits exactly this many bytes before the pointer handed to
/// the caller, so the header can be found from the payload address alone.
pub const HEADER_SIZE: usize = 32;

/// Round `size` up to the next multiple of [`ALIGNMENT`].
///
/// Returns `None` if the rounded size does not fit in a `usize`.
pub const fn align_up(size: usize) -> Option<usize> {
    match size.checked_add(ALIGNMENT - 1) {
        Some(padded) => Some(padded & !(ALIGNMENT - 1)),
        None => None,
    }
}

/// What a block is currently used for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Status {
    /// Segment memory available for reuse, merging and splitting.
    Free,
    /// Segment memory handed out to a caller.
    OnSegment,
    /// A standalone anonymous mapping handed out to a caller. These are never
    /// split, merged or reused.
    Mapped,
}

/// The header written in front of every block, free or not.
///
/// We use C representation and align to 16 bytes so that the payload that
/// follows the header is aligned as well.
#[repr(C, align(16))]
pub struct BlockHeader {
    size: usize,
    status: Status,
    next: Option<Block>,
}

const_assert!(core::mem::size_of::<BlockHeader>() <= HEADER_SIZE);
const_assert_eq!(core::mem::align_of::<BlockHeader>(), ALIGNMENT);
const_assert_eq!(HEADER_SIZE % ALIGNMENT, 0);

/// An enum for easy comparison of blocks and their order
pub enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

/// A `Block` is a handle to a header living in memory owned by a
/// [`BlockList`].
///
/// Invariants:
///
/// - `header` points to a header written by [`Block::write`] that has not been
///   returned to the memory provider.
/// - `header.next` is `None` or points to another such header.
///
/// Handles are `Copy`: the list, not the handle, owns the chain.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Block {
    header: NonNull<BlockHeader>,
}

// A Block is sendable - as long as the whole "chain" is maintained across
// threads, its fine. It is not Sync; the allocator wraps the list in a lock
// when it needs to be shared.
unsafe impl Send for Block {}

impl Block {
    /// Write a fresh, unlinked header at `ptr` describing a block with `size`
    /// bytes of payload.
    ///
    /// # Safety
    ///
    /// `ptr` must be aligned to [`ALIGNMENT`] and point to at least
    /// `HEADER_SIZE + size` bytes of memory owned by the allocator and not
    /// reachable by any other program logic.
    pub unsafe fn write(ptr: NonNull<u8>, size: usize, status: Status) -> Block {
        debug_assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
        debug_assert_eq!(size % ALIGNMENT, 0);
        let header: NonNull<BlockHeader> = ptr.cast();
        header.as_ptr().write(BlockHeader {
            size,
            status,
            next: None,
        });
        Block { header }
    }

    /// The block whose payload would start at `ptr`.
    ///
    /// This only computes an address; the returned handle must not be used
    /// until it has been found in a [`BlockList`] (see [`BlockList::locate`]).
    pub fn from_payload(ptr: NonNull<u8>) -> Option<Block> {
        if (ptr.as_ptr() as usize) <= HEADER_SIZE {
            return None;
        }
        let header = ptr.as_ptr().wrapping_sub(HEADER_SIZE) as *mut BlockHeader;
        NonNull::new(header).map(|header| Block { header })
    }

    /// The address handed out to callers.
    pub fn payload(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked((self.header.as_ptr() as *mut u8).add(HEADER_SIZE)) }
    }

    /// The first byte of the header.
    pub fn start(&self) -> *const u8 {
        self.header.as_ptr() as *const u8
    }

    /// One past the last byte of the payload.
    pub fn end(&self) -> *const u8 {
        self.start().wrapping_add(HEADER_SIZE + self.size())
    }

    /// Get the pointer range covered by this block, header included.
    pub fn as_range(&self) -> Range<*const u8> {
        self.start()..self.end()
    }

    /// Compare two blocks to see how they are ordered.
    pub fn relation(&self, other: &Self) -> Relation {
        let self_range = self.as_range();
        let other_range = other.as_range();

        if self_range.end < other_range.start {
            Relation::Before
        } else if self_range.end == other_range.start {
            Relation::AdjacentBefore
        } else if self_range.start < other_range.end {
            Relation::Overlapping
        } else if self_range.start == other_range.end {
            Relation::AdjacentAfter
        } else {
            Relation::After
        }
    }

    /// Usable bytes, header excluded.
    pub fn size(&self) -> usize {
        self.header_view().size
    }

    pub fn status(&self) -> Status {
        self.header_view().status
    }

    pub fn is_free(&self) -> bool {
        self.status() == Status::Free
    }

    /// Get the next block over from this one.
    pub fn next(&self) -> Option<Block> {
        self.header_view().next
    }

    /// An immutable pointer to the header
    fn header_view(&self) -> &BlockHeader {
        unsafe { self.header.as_ref() }
    }

    /// Get a mutable view of the header.
    ///
    /// # Safety
    ///
    /// This allows modifying the size or links of a block, which could lead
    /// to corruption of the list or of neighbouring payloads.
    #[allow(clippy::mut_from_ref)]
    unsafe fn header_mut(&self) -> &mut BlockHeader {
        &mut *self.header.as_ptr()
    }

    pub(crate) fn set_status(&self, status: Status) {
        unsafe { self.header_mut().status = status }
    }

    pub(crate) fn set_size(&self, size: usize) {
        debug_assert_eq!(size % ALIGNMENT, 0);
        unsafe { self.header_mut().size = size }
    }

    fn set_next(&self, next: Option<Block>) {
        unsafe { self.header_mut().next = next }
    }

    /// Shrink this block to `size` bytes of payload, turning the rest into a
    /// new free block linked right after it.
    ///
    /// Nothing happens, and `None` is returned, if the remainder could not hold
    /// a header and at least one byte; the extra space then stays inside this
    /// block.
    fn split(&self, size: usize) -> Option<Block> {
        debug_assert_eq!(size % ALIGNMENT, 0);
        let remainder = self.size().checked_sub(size)?;
        if remainder < HEADER_SIZE + 1 {
            return None;
        }

        let rest = unsafe {
            let ptr = NonNull::new_unchecked(self.payload().as_ptr().add(size));
            Block::write(ptr, remainder - HEADER_SIZE, Status::Free)
        };
        rest.set_next(self.next());
        self.set_size(size);
        self.set_next(Some(rest));
        log::trace!(
            "Split {:?} at {} bytes, leaving {:?}",
            self.start(),
            size,
            rest
        );
        Some(rest)
    }

    /// Merge the next block into this one, if the next block is free and
    /// starts exactly where this one ends.
    ///
    /// The status of this block is left alone, so an allocated block can grow
    /// into free space that follows it.
    fn absorb_next(&self) -> bool {
        let next = match self.next() {
            Some(next) if next.is_free() => next,
            _ => return false,
        };
        if self.end() != next.start() {
            return false;
        }

        self.set_size(self.size() + HEADER_SIZE + next.size());
        self.set_next(next.next());
        true
    }

    /// Attempt to merge this block with the next.
    ///
    /// If both blocks are free and the next one exists directly after this
    /// block in memory, the two will merge and this will return true;
    /// otherwise, this will return false.
    fn try_merge_next(&self) -> bool {
        self.is_free() && self.absorb_next()
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block({:?}, {}, {:?})",
            self.header,
            self.size(),
            self.status()
        )
    }
}

/// Where a block sits in a [`BlockList`], as found by [`BlockList::locate`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Link {
    /// The block is the first in the list.
    Head,
    /// The block follows the given one.
    After(Block),
}

/// A `BlockList` is a singly linked list of every block the allocator knows
/// about: free segment memory, segment memory in use, and mapped allocations.
///
/// Blocks are appended in the order they are created. Segment blocks therefore
/// appear in ascending address order, and two segment blocks that are next to
/// each other in the list are normally next to each other in memory. Mapped
/// blocks sit wherever they were appended; they are never merged, so they only
/// act as barriers between segment blocks.
///
/// Free neighbours are not merged on release of a mapping or on a split; they
/// are merged by [`coalesce_all`](BlockList::coalesce_all) before every search.
///
/// Finding a predecessor is a linear scan, so releasing is O(n) in the number
/// of blocks.
#[derive(Default)]
pub struct BlockList {
    head: Option<Block>,
    tail: Option<Block>,
}

pub struct BlockIter<'list> {
    next: Option<Block>,
    _list: core::marker::PhantomData<&'list BlockList>,
}

impl<'list> Iterator for BlockIter<'list> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next.take()?;
        self.next = next.next();
        Some(next)
    }
}

impl<'list> IntoIterator for &'list BlockList {
    type Item = Block;
    type IntoIter = BlockIter<'list>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for BlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockList(")?;
        let mut start = true;
        for block in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{:?}", block)?;
        }

        write!(f, ")")
    }
}

/// Validity contains a representation of all invalid states found in a
/// BlockList.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct Validity {
    /// Number of segment blocks overlapping the previous segment block.
    ///
    /// This likely indicates corruption.
    pub overlaps: usize,
    /// Number of segment blocks that do not have an address greater than the
    /// previous segment block.
    ///
    /// This shouldn't occur.
    pub out_of_orders: usize,
    /// Number of free blocks directly following another free block, in the list
    /// and in memory. This is expected between searches, but not right after
    /// [`BlockList::coalesce_all`].
    pub unmerged: usize,
}

impl Validity {
    /// Returns a boolean - a simple check that no corruption was found
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0 && self.out_of_orders == 0
    }

    /// Valid, and no free neighbours are waiting to be merged.
    pub fn is_coalesced(&self) -> bool {
        self.is_valid() && self.unmerged == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

/// Counts and payload bytes, by status.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct Stats {
    pub length: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub segment_blocks: usize,
    pub segment_bytes: usize,
    pub mapped_blocks: usize,
    pub mapped_bytes: usize,
}

impl BlockList {
    pub const fn new() -> Self {
        BlockList {
            head: None,
            tail: None,
        }
    }

    pub fn head(&self) -> Option<Block> {
        self.head
    }

    pub fn tail(&self) -> Option<Block> {
        self.tail
    }

    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            next: self.head,
            _list: core::marker::PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Append a freshly written block at the end of the list.
    ///
    /// # Safety
    ///
    /// `block` must not already be in any list, and its memory must be owned
    /// by this list from now on.
    pub unsafe fn push_back(&mut self, block: Block) {
        block.set_next(None);
        match self.tail {
            None => self.head = Some(block),
            Some(tail) => tail.set_next(Some(block)),
        }
        self.tail = Some(block);
    }

    /// Find `target` in the list, and report what precedes it.
    ///
    /// Only addresses are compared, so `target` may be any handle, including
    /// one built from a pointer this list never handed out.
    pub fn locate(&self, target: Block) -> Option<Link> {
        let mut previous: Option<Block> = None;
        for block in self.iter() {
            if block == target {
                return Some(previous.map_or(Link::Head, Link::After));
            }
            previous = Some(block);
        }
        None
    }

    /// Remove `block`, found at `link`, from the list.
    pub fn unlink(&mut self, link: Link, block: Block) {
        let next = block.next();
        match link {
            Link::Head => self.head = next,
            Link::After(previous) => previous.set_next(next),
        }
        if self.tail == Some(block) {
            self.tail = match link {
                Link::Head => None,
                Link::After(previous) => Some(previous),
            };
        }
        block.set_next(None);
    }

    /// Merge the block after `previous` into it, if both are free and adjacent.
    pub fn coalesce(&mut self, previous: Block) -> bool {
        let next = previous.next();
        if !previous.try_merge_next() {
            return false;
        }
        if next == self.tail {
            self.tail = Some(previous);
        }
        true
    }

    /// Grow `block` over the free block that follows it, whatever the status
    /// of `block` itself.
    pub fn absorb_next(&mut self, block: Block) -> bool {
        let next = block.next();
        if !block.absorb_next() {
            return false;
        }
        if next == self.tail {
            self.tail = Some(block);
        }
        true
    }

    /// Merge every run of adjacent free blocks into a single block.
    pub fn coalesce_all(&mut self) -> usize {
        let mut merges = 0;
        let mut current = self.head;
        while let Some(block) = current {
            if self.coalesce(block) {
                // The merged block may now be adjacent to another free block.
                merges += 1;
            } else {
                current = block.next();
            }
        }
        merges
    }

    /// Trim `block` down to `size` bytes of payload, inserting the rest as a
    /// free block right after it if the rest is large enough to be a block.
    pub fn split(&mut self, block: Block, size: usize) -> Option<Block> {
        let rest = block.split(size)?;
        if self.tail == Some(block) {
            self.tail = Some(rest);
        }
        Some(rest)
    }

    /// Find the smallest free block that can hold `size` bytes. Ties go to the
    /// block closest to the head.
    ///
    /// If no free block is large enough but the tail is free, the tail is
    /// returned anyway, as it can be grown in place.
    pub fn best_fit(&self, size: usize) -> Option<Block> {
        let mut best: Option<Block> = None;
        for block in self.iter() {
            if !block.is_free() || block.size() < size {
                continue;
            }
            if best.map_or(true, |b| block.size() < b.size()) {
                best = Some(block);
            }
        }

        best.or_else(|| self.tail.filter(Block::is_free))
    }

    /// Check current size of the list, and whether its valid.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity: Validity = Default::default();
        let mut stats: Stats = Default::default();

        let mut previous: Option<Block> = None;
        let mut previous_segment: Option<Block> = None;
        for block in self.iter() {
            stats.length += 1;
            match block.status() {
                Status::Free => {
                    stats.free_blocks += 1;
                    stats.free_bytes += block.size();
                }
                Status::OnSegment => {
                    stats.segment_blocks += 1;
                    stats.segment_bytes += block.size();
                }
                Status::Mapped => {
                    stats.mapped_blocks += 1;
                    stats.mapped_bytes += block.size();
                    previous = Some(block);
                    continue;
                }
            }

            match previous_segment.map(|p| p.relation(&block)) {
                Some(Relation::Before) | Some(Relation::AdjacentBefore) | None => {}
                Some(Relation::Overlapping) => {
                    // This is really bad.
                    validity.overlaps += 1;
                }
                Some(Relation::AdjacentAfter) | Some(Relation::After) => {
                    validity.out_of_orders += 1;
                }
            }

            if let Some(p) = previous {
                if p.is_free() && block.is_free() && p.end() == block.start() {
                    validity.unmerged += 1;
                }
            }

            previous = Some(block);
            previous_segment = Some(block);
        }

        (validity, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[repr(C, align(16))]
    struct Arena([u8; 4096]);

    impl Arena {
        fn new() -> Self {
            Arena([0; 4096])
        }

        // Lay out blocks back to back from the start of the arena and append
        // them to a new list.
        fn carve(&mut self, layout: &[(usize, Status)]) -> (BlockList, Vec<Block>) {
            let mut list = BlockList::new();
            let mut blocks = Vec::new();
            let mut offset = 0;
            for &(size, status) in layout {
                unsafe {
                    let ptr = NonNull::new(self.0.as_mut_ptr().add(offset)).unwrap();
                    let block = Block::write(ptr, size, status);
                    list.push_back(block);
                    blocks.push(block);
                }
                offset += HEADER_SIZE + size;
            }
            (list, blocks)
        }
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0), Some(0));
        assert_eq!(align_up(1), Some(16));
        assert_eq!(align_up(16), Some(16));
        assert_eq!(align_up(17), Some(32));
        assert_eq!(align_up(usize::MAX), None);
    }

    #[test]
    fn test_payload_round_trip() {
        let mut arena = Arena::new();
        let (list, blocks) = arena.carve(&[(64, Status::OnSegment)]);
        let payload = blocks[0].payload();
        assert_eq!(payload.as_ptr() as usize - blocks[0].start() as usize, HEADER_SIZE);
        assert_eq!(Block::from_payload(payload), Some(blocks[0]));
        assert_eq!(list.locate(blocks[0]), Some(Link::Head));
    }

    #[test]
    fn test_split() {
        let mut arena = Arena::new();
        let (mut list, blocks) = arena.carve(&[(128, Status::OnSegment)]);

        let rest = list.split(blocks[0], 64).expect("64 bytes left is enough");
        assert_eq!(blocks[0].size(), 64);
        assert_eq!(rest.size(), 64 - HEADER_SIZE);
        assert!(rest.is_free());
        assert_eq!(blocks[0].end(), rest.start());
        assert_eq!(list.tail(), Some(rest));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_split_keeps_sliver() {
        let mut arena = Arena::new();
        let (mut list, blocks) = arena.carve(&[(96, Status::OnSegment)]);

        // 32 bytes left over could hold a header but no payload.
        assert!(list.split(blocks[0], 64).is_none());
        assert_eq!(blocks[0].size(), 96);
        assert_eq!(list.len(), 1);

        // 48 bytes is a header plus 16.
        assert!(list.split(blocks[0], 48).is_some());
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_coalesce_all() {
        let mut arena = Arena::new();
        let (mut list, blocks) = arena.carve(&[
            (64, Status::OnSegment),
            (32, Status::Free),
            (48, Status::Free),
            (16, Status::Free),
        ]);
        let (validity, _) = list.stats();
        assert_eq!(validity.unmerged, 2);

        assert_eq!(list.coalesce_all(), 2);
        assert_eq!(list.len(), 2);
        assert_eq!(blocks[1].size(), 32 + 48 + 16 + 2 * HEADER_SIZE);
        assert_eq!(list.tail(), Some(blocks[1]));
        assert!(list.stats().0.is_coalesced());
        log::info!("coalesced: {}", list);
    }

    #[test]
    fn test_coalesce_needs_free_neighbours() {
        let mut arena = Arena::new();
        let (mut list, blocks) = arena.carve(&[
            (64, Status::Free),
            (64, Status::OnSegment),
            (64, Status::Free),
            (64, Status::Mapped),
        ]);
        assert!(!list.coalesce(blocks[0]));
        assert!(!list.coalesce(blocks[2]));
        assert_eq!(list.coalesce_all(), 0);
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn test_coalesce_needs_memory_adjacency() {
        let mut arena = Arena::new();
        let mut list = BlockList::new();
        let (first, second) = unsafe {
            let base = arena.0.as_mut_ptr();
            let first = Block::write(NonNull::new(base).unwrap(), 64, Status::Free);
            // Leave a gap of 64 bytes between the two blocks.
            let second = Block::write(
                NonNull::new(base.add(HEADER_SIZE + 128)).unwrap(),
                64,
                Status::Free,
            );
            list.push_back(first);
            list.push_back(second);
            (first, second)
        };
        assert!(!list.coalesce(first));
        assert_eq!(first.size(), 64);
        assert_eq!(list.tail(), Some(second));
    }

    #[test]
    fn test_absorb_next_keeps_status() {
        let mut arena = Arena::new();
        let (mut list, blocks) = arena.carve(&[(64, Status::OnSegment), (64, Status::Free)]);
        assert!(list.absorb_next(blocks[0]));
        assert_eq!(blocks[0].status(), Status::OnSegment);
        assert_eq!(blocks[0].size(), 128 + HEADER_SIZE);
        assert_eq!(list.tail(), Some(blocks[0]));
        assert!(!list.absorb_next(blocks[0]));
    }

    #[test]
    fn test_best_fit() {
        let mut arena = Arena::new();
        let (list, blocks) = arena.carve(&[
            (128, Status::Free),
            (64, Status::OnSegment),
            (48, Status::Free),
            (64, Status::OnSegment),
            (48, Status::Free),
            (256, Status::Free),
            (32, Status::OnSegment),
        ]);

        // Smallest block that fits, first one on a tie.
        assert_eq!(list.best_fit(48), Some(blocks[2]));
        assert_eq!(list.best_fit(32), Some(blocks[2]));
        assert_eq!(list.best_fit(64), Some(blocks[0]));
        assert_eq!(list.best_fit(200), Some(blocks[5]));
        // Nothing fits, and the tail is in use.
        assert_eq!(list.best_fit(512), None);
    }

    #[test]
    fn test_best_fit_falls_back_to_free_tail() {
        let mut arena = Arena::new();
        let (list, blocks) = arena.carve(&[(64, Status::OnSegment), (32, Status::Free)]);
        assert_eq!(list.best_fit(1024), Some(blocks[1]));
    }

    #[test]
    fn test_unlink() {
        let mut arena = Arena::new();
        let (mut list, blocks) = arena.carve(&[
            (16, Status::Mapped),
            (16, Status::Mapped),
            (16, Status::Mapped),
        ]);

        let link = list.locate(blocks[1]).unwrap();
        assert_eq!(link, Link::After(blocks[0]));
        list.unlink(link, blocks[1]);
        assert_eq!(blocks[0].next(), Some(blocks[2]));

        let link = list.locate(blocks[2]).unwrap();
        list.unlink(link, blocks[2]);
        assert_eq!(list.tail(), Some(blocks[0]));
        assert_eq!(blocks[0].next(), None);

        assert_eq!(list.locate(blocks[0]), Some(Link::Head));
        list.unlink(Link::Head, blocks[0]);
        assert!(list.is_empty());
        assert_eq!(list.tail(), None);
        assert_eq!(list.locate(blocks[0]), None);
    }

    #[test]
    fn test_stats() {
        let mut arena = Arena::new();
        let (list, _blocks) = arena.carve(&[
            (64, Status::OnSegment),
            (32, Status::Free),
            (128, Status::Mapped),
            (16, Status::Free),
        ]);
        let (validity, stats) = list.stats();
        assert!(validity.is_valid());
        assert_eq!(
            stats,
            Stats {
                length: 4,
                free_blocks: 2,
                free_bytes: 48,
                segment_blocks: 1,
                segment_bytes: 64,
                mapped_blocks: 1,
                mapped_bytes: 128,
            }
        );
    }

    #[test]
    fn test_stats_out_of_order() {
        let mut arena = Arena::new();
        let mut list = BlockList::new();
        unsafe {
            let base = arena.0.as_mut_ptr();
            let high = Block::write(NonNull::new(base.add(512)).unwrap(), 64, Status::OnSegment);
            let low = Block::write(NonNull::new(base).unwrap(), 64, Status::OnSegment);
            list.push_back(high);
            list.push_back(low);
        }
        let (validity, _) = list.stats();
        assert_eq!(validity.out_of_orders, 1);
        assert!(!validity.is_valid());
    }
}
