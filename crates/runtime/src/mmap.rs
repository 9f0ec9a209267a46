//! Low-level abstraction for reserving, committing, and decommitting
//! page-aligned spans of virtual address space.

use anyhow::{Context, Result};
use more_asserts::assert_le;
use std::ptr;

/// Return the host's native page size in bytes.
///
/// Guaranteed by the platforms we run on to be a power of two no larger than
/// a WebAssembly page; the reservation layout depends on that.
pub fn host_page_size() -> usize {
    region::page::size()
}

/// A reservation of zero-initialized virtual address space.
///
/// The mapping never moves: committing and decommitting only change page
/// protections and backing within it. This is the property the rest of the
/// runtime builds on, since compiled code holds the base address without
/// synchronization.
#[derive(Debug)]
pub struct Mmap {
    // Note that this is stored as a `usize` instead of a `*const` or `*mut`
    // pointer to allow this structure to be natively `Send` and `Sync`
    // without `unsafe impl`. This type is sendable across threads and
    // shareable since the coordination all happens at the OS layer.
    ptr: usize,
    len: usize,
}

impl Mmap {
    /// Construct a new empty instance of `Mmap`.
    pub fn new() -> Self {
        // Rust's slices require non-null pointers, even when empty. `Vec`
        // contains code to create a non-null dangling pointer value when
        // constructed empty, so we reuse that here.
        let empty = Vec::<u8>::new();
        Self {
            ptr: empty.as_ptr() as usize,
            len: 0,
        }
    }

    /// Create a new `Mmap` pointing to `accessible_size` bytes of
    /// page-aligned accessible memory, within a reserved mapping of
    /// `mapping_size` bytes. `accessible_size` and `mapping_size` must be
    /// native page-size multiples.
    #[cfg(not(target_os = "windows"))]
    pub fn accessible_reserved(accessible_size: usize, mapping_size: usize) -> Result<Self> {
        let page_size = host_page_size();
        assert_le!(accessible_size, mapping_size);
        assert_eq!(mapping_size & (page_size - 1), 0);
        assert_eq!(accessible_size & (page_size - 1), 0);

        // Mmap may return EINVAL if the size is zero, so just special-case
        // that.
        if mapping_size == 0 {
            return Ok(Self::new());
        }

        Ok(if accessible_size == mapping_size {
            // Allocate a single read-write region at once.
            let ptr = unsafe {
                rustix::io::mmap_anonymous(
                    ptr::null_mut(),
                    mapping_size,
                    rustix::io::ProtFlags::READ | rustix::io::ProtFlags::WRITE,
                    rustix::io::MapFlags::PRIVATE,
                )
                .context(format!("mmap failed to allocate {:#x} bytes", mapping_size))?
            };

            Self {
                ptr: ptr as usize,
                len: mapping_size,
            }
        } else {
            // Reserve the mapping size.
            let ptr = unsafe {
                rustix::io::mmap_anonymous(
                    ptr::null_mut(),
                    mapping_size,
                    rustix::io::ProtFlags::empty(),
                    rustix::io::MapFlags::PRIVATE,
                )
                .context(format!("mmap failed to reserve {:#x} bytes", mapping_size))?
            };

            let result = Self {
                ptr: ptr as usize,
                len: mapping_size,
            };

            if accessible_size != 0 {
                // Commit the accessible size.
                result.make_accessible(0, accessible_size)?;
            }

            result
        })
    }

    /// Create a new `Mmap` pointing to `accessible_size` bytes of
    /// page-aligned accessible memory, within a reserved mapping of
    /// `mapping_size` bytes. `accessible_size` and `mapping_size` must be
    /// native page-size multiples.
    #[cfg(target_os = "windows")]
    pub fn accessible_reserved(accessible_size: usize, mapping_size: usize) -> Result<Self> {
        use anyhow::bail;
        use std::io;
        use winapi::um::memoryapi::VirtualAlloc;
        use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE};

        if mapping_size == 0 {
            return Ok(Self::new());
        }

        let page_size = host_page_size();
        assert_le!(accessible_size, mapping_size);
        assert_eq!(mapping_size & (page_size - 1), 0);
        assert_eq!(accessible_size & (page_size - 1), 0);

        Ok(if accessible_size == mapping_size {
            // Allocate a single read-write region at once.
            let ptr = unsafe {
                VirtualAlloc(
                    ptr::null_mut(),
                    mapping_size,
                    MEM_RESERVE | MEM_COMMIT,
                    PAGE_READWRITE,
                )
            };
            if ptr.is_null() {
                bail!("VirtualAlloc failed: {}", io::Error::last_os_error());
            }

            Self {
                ptr: ptr as usize,
                len: mapping_size,
            }
        } else {
            // Reserve the mapping size.
            let ptr =
                unsafe { VirtualAlloc(ptr::null_mut(), mapping_size, MEM_RESERVE, PAGE_NOACCESS) };
            if ptr.is_null() {
                bail!("VirtualAlloc failed: {}", io::Error::last_os_error());
            }

            let result = Self {
                ptr: ptr as usize,
                len: mapping_size,
            };

            if accessible_size != 0 {
                // Commit the accessible size.
                result.make_accessible(0, accessible_size)?;
            }

            result
        })
    }

    /// Make the memory starting at `start` and extending for `len` bytes
    /// accessible. `start` and `len` must be native page-size multiples and
    /// describe a range within `self`'s reserved memory.
    ///
    /// Takes `&self`: protection changes never move the mapping, so the
    /// handle stays shareable while pages are committed.
    #[cfg(not(target_os = "windows"))]
    pub fn make_accessible(&self, start: usize, len: usize) -> Result<()> {
        let page_size = host_page_size();
        assert_eq!(start & (page_size - 1), 0);
        assert_eq!(len & (page_size - 1), 0);
        assert_le!(len, self.len);
        assert_le!(start, self.len - len);

        // Commit the accessible size.
        let ptr = self.ptr as *const u8;
        unsafe {
            region::protect(ptr.add(start), len, region::Protection::READ_WRITE)?;
        }

        Ok(())
    }

    /// Make the memory starting at `start` and extending for `len` bytes
    /// accessible. `start` and `len` must be native page-size multiples and
    /// describe a range within `self`'s reserved memory.
    #[cfg(target_os = "windows")]
    pub fn make_accessible(&self, start: usize, len: usize) -> Result<()> {
        use anyhow::bail;
        use std::io;
        use winapi::ctypes::c_void;
        use winapi::um::memoryapi::VirtualAlloc;
        use winapi::um::winnt::{MEM_COMMIT, PAGE_READWRITE};

        let page_size = host_page_size();
        assert_eq!(start & (page_size - 1), 0);
        assert_eq!(len & (page_size - 1), 0);
        assert_le!(len, self.len);
        assert_le!(start, self.len - len);

        // Commit the accessible size.
        let ptr = self.ptr as *const u8;
        if unsafe {
            VirtualAlloc(
                ptr.add(start) as *mut c_void,
                len,
                MEM_COMMIT,
                PAGE_READWRITE,
            )
        }
        .is_null()
        {
            bail!("VirtualAlloc failed: {}", io::Error::last_os_error());
        }

        Ok(())
    }

    /// Release the backing of `len` bytes starting at `start` without
    /// shrinking the reservation. `start` and `len` must be native page-size
    /// multiples and describe a range within `self`'s reserved memory.
    ///
    /// The range faults on access until it is made accessible again; the
    /// pages do not lazily re-zero on touch.
    #[cfg(not(target_os = "windows"))]
    pub fn decommit(&self, start: usize, len: usize) {
        let page_size = host_page_size();
        assert_eq!(start & (page_size - 1), 0);
        assert_eq!(len & (page_size - 1), 0);
        assert_le!(len, self.len);
        assert_le!(start, self.len - len);

        unsafe {
            let addr = (self.ptr + start) as *mut libc::c_void;
            assert_eq!(
                libc::mmap(
                    addr,
                    len,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_FIXED,
                    -1,
                    0,
                ),
                addr,
                "mmap failed to remap pages: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    /// Release the backing of `len` bytes starting at `start` without
    /// shrinking the reservation. `start` and `len` must be native page-size
    /// multiples and describe a range within `self`'s reserved memory.
    #[cfg(target_os = "windows")]
    pub fn decommit(&self, start: usize, len: usize) {
        use winapi::ctypes::c_void;
        use winapi::um::memoryapi::VirtualFree;
        use winapi::um::winnt::MEM_DECOMMIT;

        let page_size = host_page_size();
        assert_eq!(start & (page_size - 1), 0);
        assert_eq!(len & (page_size - 1), 0);
        assert_le!(len, self.len);
        assert_le!(start, self.len - len);

        let r = unsafe { VirtualFree((self.ptr + start) as *mut c_void, len, MEM_DECOMMIT) };
        assert_ne!(
            r,
            0,
            "VirtualFree failed to decommit pages: {}",
            std::io::Error::last_os_error()
        );
    }

    /// Return the allocated memory as a pointer to u8.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr as *const u8
    }

    /// Return the allocated memory as a mutable pointer to u8.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }

    /// Return the length of the allocated memory.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Return whether any memory has been allocated.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Mmap {
    #[cfg(not(target_os = "windows"))]
    fn drop(&mut self) {
        if self.len != 0 {
            unsafe { rustix::io::munmap(self.ptr as *mut std::ffi::c_void, self.len) }
                .expect("munmap failed");
        }
    }

    #[cfg(target_os = "windows")]
    fn drop(&mut self) {
        if self.len != 0 {
            use winapi::ctypes::c_void;
            use winapi::um::memoryapi::VirtualFree;
            use winapi::um::winnt::MEM_RELEASE;
            let r = unsafe { VirtualFree(self.ptr as *mut c_void, 0, MEM_RELEASE) };
            assert_ne!(r, 0);
        }
    }
}

fn _assert() {
    fn _assert_send_sync<T: Send + Sync>() {}
    _assert_send_sync::<Mmap>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_mapping() {
        let mmap = Mmap::accessible_reserved(0, 0).unwrap();
        assert!(mmap.is_empty());
    }

    #[test]
    fn commit_after_reserve() {
        let page_size = host_page_size();
        let mmap = Mmap::accessible_reserved(0, 4 * page_size).unwrap();
        assert_eq!(mmap.len(), 4 * page_size);

        mmap.make_accessible(0, page_size).unwrap();
        unsafe {
            mmap.as_mut_ptr().write(7);
            assert_eq!(mmap.as_ptr().read(), 7);
        }
    }

    #[test]
    fn recommit_after_decommit() {
        let page_size = host_page_size();
        let mmap = Mmap::accessible_reserved(2 * page_size, 2 * page_size).unwrap();

        unsafe { mmap.as_mut_ptr().write(42) };
        mmap.decommit(0, page_size);

        // The page is reserved but unbacked now; committing it again must
        // yield zeroed memory.
        mmap.make_accessible(0, page_size).unwrap();
        unsafe { assert_eq!(mmap.as_ptr().read(), 0) };
    }
}
