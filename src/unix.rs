//! The memory provider backed by the operating system: `sbrk` for the data
//! segment, `mmap` and `munmap` for standalone mappings.

use core::convert::TryFrom;
use core::fmt::{self, Write};
use core::ptr::{null_mut, NonNull};

use errno::Errno;

use crate::allocators::MemoryProvider;
use crate::blocklist::ALIGNMENT;

/// A failed libc call, with the `errno` it left behind.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OsError(pub Errno);

impl OsError {
    fn last() -> Self {
        OsError(errno::errno())
    }

    fn out_of_memory() -> Self {
        OsError(Errno(libc::ENOMEM))
    }

    pub fn code(&self) -> i32 {
        (self.0).0
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (errno {})", self.0, self.code())
    }
}

/// UnixProvider moves the program break and maps anonymous memory on request.
#[derive(Default)]
pub struct UnixProvider {
    // Just for tracking, not really needed
    mappings: usize,
}

impl UnixProvider {
    pub const fn new() -> Self {
        UnixProvider { mappings: 0 }
    }

    /// Number of mappings created.
    pub fn mappings(&self) -> usize {
        self.mappings
    }
}

fn sbrk(size: usize) -> Result<NonNull<u8>, OsError> {
    let increment = libc::intptr_t::try_from(size).map_err(|_| OsError::out_of_memory())?;
    let ptr = unsafe { libc::sbrk(increment) };
    if ptr as isize == -1 {
        return Err(OsError::last());
    }
    NonNull::new(ptr as *mut u8).ok_or_else(OsError::out_of_memory)
}

impl MemoryProvider for UnixProvider {
    type Err = OsError;

    unsafe fn extend_segment(&mut self, size: usize) -> Result<NonNull<u8>, OsError> {
        // Anyone else moving the break may leave it unaligned.
        let misalignment = self.segment_end() as usize % ALIGNMENT;
        if misalignment != 0 {
            sbrk(ALIGNMENT - misalignment)?;
        }

        sbrk(size)
    }

    fn segment_end(&self) -> *const u8 {
        unsafe { libc::sbrk(0) as *const u8 }
    }

    unsafe fn create_mapping(&mut self, size: usize) -> Result<NonNull<u8>, OsError> {
        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            // Private to this process, and not backed by any file.
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(OsError::last());
        }

        self.mappings += 1;
        NonNull::new(ptr as *mut u8).ok_or_else(OsError::out_of_memory)
    }

    unsafe fn destroy_mapping(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), OsError> {
        if libc::munmap(ptr.as_ptr().cast(), size) != 0 {
            return Err(OsError::last());
        }
        Ok(())
    }

    fn abort(&self, report: fmt::Arguments<'_>) -> ! {
        // Formatting straight into stderr; nothing here may allocate.
        let _ = writeln!(Stderr, "brk_allocator: {}", report);
        unsafe { libc::abort() }
    }
}

struct Stderr;

impl Write for Stderr {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut bytes = s.as_bytes();
        while !bytes.is_empty() {
            let written =
                unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
            if written <= 0 {
                return Err(fmt::Error);
            }
            bytes = &bytes[written as usize..];
        }
        Ok(())
    }
}
