//! Tunables for [`RawAlloc`](crate::allocators::RawAlloc).

/// Requests whose size plus header reaches this many bytes get their own
/// mapping instead of segment memory. This is also how much the segment is
/// extended by the first time it is used.
pub const MMAP_THRESHOLD: usize = 128 * 1024;

/// The mapping threshold for zeroed allocations: one page.
pub const PAGE_SIZE: usize = 4 * 1024;

/// What to do when a pointer passed to release or reallocate is not one the
/// allocator handed out, or has already been released.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PointerPolicy {
    /// Treat the call as a no-op.
    Ignore,
    /// Report the pointer and terminate, through the memory provider's
    /// [`abort`](crate::allocators::MemoryProvider::abort).
    Abort,
}

/// Configuration for `RawAlloc`. All fields have sensible defaults.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Threshold for `allocate` and `reallocate`, header included.
    /// Default: 128 KiB.
    pub mmap_threshold: usize,
    /// Threshold for `allocate_zeroed`, header included. Zeroed requests are
    /// isolated in mappings more eagerly. Default: one 4 KiB page.
    pub zeroed_mmap_threshold: usize,
    /// Default: [`PointerPolicy::Ignore`].
    pub unknown_pointer: PointerPolicy,
}

impl Config {
    pub const DEFAULT: Config = Config {
        mmap_threshold: MMAP_THRESHOLD,
        zeroed_mmap_threshold: PAGE_SIZE,
        unknown_pointer: PointerPolicy::Ignore,
    };

    /// The default configuration, with the zeroed-allocation threshold set to
    /// the page size reported by the OS.
    #[cfg(feature = "use_libc")]
    pub fn for_system() -> Self {
        Config::DEFAULT.with_zeroed_mmap_threshold(sysconf::page::pagesize())
    }

    #[must_use]
    pub const fn with_mmap_threshold(self, threshold: usize) -> Self {
        Config {
            mmap_threshold: threshold,
            ..self
        }
    }

    #[must_use]
    pub const fn with_zeroed_mmap_threshold(self, threshold: usize) -> Self {
        Config {
            zeroed_mmap_threshold: threshold,
            ..self
        }
    }

    #[must_use]
    pub const fn with_unknown_pointer(self, policy: PointerPolicy) -> Self {
        Config {
            unknown_pointer: policy,
            ..self
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::DEFAULT
    }
}
