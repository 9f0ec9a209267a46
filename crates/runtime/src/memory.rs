//! Linear memory instances: reservation-backed WebAssembly heaps with a
//! stable base address.

use crate::compartment::Compartment;
use crate::index_allocator::SlotId;
use crate::mmap::{host_page_size, Mmap};
use crate::registry;
use crate::trap::Trap;
use ferrite_environ::{MemoryType, Pages, WASM_PAGE_SIZE};
use more_asserts::{assert_le, assert_lt};
use std::cmp;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Weak;
use thiserror::Error;

#[cfg(target_pointer_width = "32")]
compile_error!(
    "linear memories elide bounds checks by reserving a 33-bit address range \
     per memory, which requires a 64-bit host"
);

/// Reservation size for a single linear memory in bytes, excluding the guard
/// page.
///
/// A 32-bit index plus a 32-bit constant offset addresses at most 8 GiB past
/// the base, so every access compiled from valid 32-bit components lands
/// inside this reservation or its guard and either succeeds or faults; no
/// per-access bounds check is needed.
pub const MEMORY_RESERVATION_BYTES: usize = 1 << 33;

/// Host pages kept permanently uncommitted past the end of the reservation.
/// Misaligned accesses at the reservation edge may probe one page further.
pub const NUM_GUARD_PAGES: usize = 1;

const UNBOUND_ID: u32 = u32::MAX;

/// Error type describing failures when operating on linear memories.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Growing the memory would push its size past the maximum, or the host
    /// refused to commit the new pages.
    #[error("could not grow memory by {delta:?}: the limit of {maximum:?} would be exceeded")]
    CouldNotGrow {
        /// The committed size at the time of the attempt.
        current: Pages,
        /// The requested number of additional pages.
        delta: Pages,
        /// The upper size bound of the memory.
        maximum: Pages,
    },
    /// Shrinking the memory would pull its size below the minimum.
    #[error("could not shrink memory by {delta:?}: the minimum of {minimum:?} would be crossed")]
    CouldNotShrink {
        /// The committed size at the time of the attempt.
        current: Pages,
        /// The requested number of pages to release.
        delta: Pages,
        /// The lower size bound of the memory.
        minimum: Pages,
    },
    /// The compartment has bound a memory under every available id.
    #[error("the compartment has no free memory ids")]
    IdsExhausted,
    /// The host failed to reserve or commit virtual memory.
    #[error("failed to reserve or commit virtual memory")]
    Mmap(#[from] anyhow::Error),
}

/// A WebAssembly linear memory instance.
///
/// The memory owns one large virtual address reservation with a trailing
/// guard page; only the prefix covering `num_pages` WebAssembly pages is
/// committed. Growing and shrinking change page protections in place, so the
/// base address observed by generated code is stable for the memory's entire
/// lifetime.
#[derive(Debug)]
pub struct LinearMemory {
    ty: MemoryType,
    mmap: Mmap,
    end_offset: usize,
    num_pages: AtomicU64,
    id: AtomicU32,
    compartment: Weak<Compartment>,
}

impl LinearMemory {
    /// Reserve address space for a new memory, commit `initial_pages`, and
    /// enter it into the global registry.
    ///
    /// The memory is not yet bound to a compartment slot; the compartment
    /// does that under its own mutex before handing the memory out.
    pub(crate) fn with_reservation(
        ty: &MemoryType,
        compartment: Weak<Compartment>,
        initial_pages: Pages,
    ) -> Result<Self, MemoryError> {
        assert_le!(ty.minimum, ty.maximum);
        assert!(
            ty.maximum.checked_bytes().is_some(),
            "maximum page count is not representable as a byte size"
        );

        let page_size = host_page_size();
        assert!(page_size.is_power_of_two());
        assert_le!(page_size, WASM_PAGE_SIZE);

        let guard_bytes = NUM_GUARD_PAGES * page_size;
        let mmap = Mmap::accessible_reserved(0, MEMORY_RESERVATION_BYTES + guard_bytes)?;

        let memory = LinearMemory {
            ty: *ty,
            end_offset: MEMORY_RESERVATION_BYTES,
            num_pages: AtomicU64::new(0),
            id: AtomicU32::new(UNBOUND_ID),
            compartment,
            mmap,
        };

        // Enter the registry as soon as the reservation exists. If the
        // initial grow fails the caller drops the memory, which unwinds the
        // registration along with the reservation.
        let base = memory.base() as usize;
        registry::register(base, base + memory.end_offset);

        memory.grow(initial_pages)?;

        log::trace!(
            "created linear memory at {:p} with {:?} committed",
            memory.base(),
            initial_pages
        );
        Ok(memory)
    }

    /// The base address of the reservation. Non-null and stable for the
    /// memory's entire lifetime.
    pub fn base(&self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    /// The memory's type: its minimum and maximum size in pages.
    pub fn ty(&self) -> &MemoryType {
        &self.ty
    }

    /// The reservation size in bytes, excluding the guard page. Constant for
    /// the memory's lifetime.
    pub fn end_offset(&self) -> usize {
        self.end_offset
    }

    /// The currently committed size in WebAssembly pages.
    pub fn num_pages(&self) -> Pages {
        Pages(self.num_pages.load(Ordering::Acquire))
    }

    /// The upper size bound in WebAssembly pages.
    pub fn maximum(&self) -> Pages {
        self.ty.maximum
    }

    /// The compartment-local id this memory is bound under.
    ///
    /// Panics if the memory has not been bound to a compartment slot.
    pub fn id(&self) -> SlotId {
        let id = self.id.load(Ordering::Acquire);
        assert_ne!(id, UNBOUND_ID, "memory is not bound to a compartment");
        SlotId(id)
    }

    pub(crate) fn bind_id(&self, id: SlotId) {
        self.id.store(id.0, Ordering::Release);
    }

    /// The compartment that owns this memory.
    pub fn compartment(&self) -> Weak<Compartment> {
        self.compartment.clone()
    }

    /// Grow the committed prefix by `delta` WebAssembly pages, returning the
    /// page count from before the grow.
    ///
    /// The base address never changes; only page protections do. Growing by
    /// zero pages is a no-op that reports the current size. Callers growing
    /// the same memory from several threads must synchronize externally.
    pub fn grow(&self, delta: Pages) -> Result<Pages, MemoryError> {
        let current = self.num_pages();
        if delta == Pages(0) {
            return Ok(current);
        }

        // The type's maximum may exceed what the reservation can hold; the
        // committed prefix is bounded by whichever is smaller.
        let maximum = cmp::min(
            self.ty.maximum,
            Pages((self.end_offset / WASM_PAGE_SIZE) as u64),
        );

        // Two separate comparisons so the sum cannot overflow.
        if delta > maximum || current > Pages(maximum.0 - delta.0) {
            return Err(MemoryError::CouldNotGrow {
                current,
                delta,
                maximum,
            });
        }

        self.mmap
            .make_accessible(current.bytes().0, delta.bytes().0)?;

        // Only after the commit succeeded does the new size become visible.
        let new = current.0 + delta.0;
        self.num_pages.store(new, Ordering::Release);

        log::trace!(
            "grew memory at {:p} from {:?} to {:?}",
            self.base(),
            current,
            Pages(new)
        );
        Ok(current)
    }

    /// Shrink the committed prefix by `delta` WebAssembly pages, returning
    /// the page count from before the shrink.
    ///
    /// The page count is updated before the vacated pages are decommitted,
    /// so no observer can see freed pages still counted as committed.
    pub fn shrink(&self, delta: Pages) -> Result<Pages, MemoryError> {
        let current = self.num_pages();
        if delta == Pages(0) {
            return Ok(current);
        }

        let minimum = self.ty.minimum;
        if delta > current || Pages(current.0 - delta.0) < minimum {
            return Err(MemoryError::CouldNotShrink {
                current,
                delta,
                minimum,
            });
        }

        let new = Pages(current.0 - delta.0);
        self.num_pages.store(new.0, Ordering::Release);
        self.mmap.decommit(new.bytes().0, delta.bytes().0);

        log::trace!(
            "shrank memory at {:p} from {:?} to {:?}",
            self.base(),
            current,
            new
        );
        Ok(current)
    }

    /// Decommit `len` pages starting at `page_index` without changing the
    /// committed page count.
    ///
    /// Collaborators that logically zero a range use this to release its
    /// physical backing. Whether a later access to the range faults or
    /// transparently recommits is a property of the host decommit primitive;
    /// see [`Mmap::decommit`].
    ///
    /// Panics unless `len > 0` and `[page_index, page_index + len)` lies
    /// inside the committed prefix.
    pub fn unmap_pages(&self, page_index: Pages, len: Pages) {
        let num_pages = self.num_pages();
        assert_lt!(page_index, num_pages);
        assert!(len > Pages(0));
        let end = page_index
            .checked_add(len)
            .expect("page range end overflows");
        assert_le!(end, num_pages);

        self.mmap.decommit(page_index.bytes().0, len.bytes().0);
    }

    /// Translate `(offset, len)` into a raw pointer into this memory, or
    /// trap when the range leaves the reservation.
    ///
    /// Validation is against the reservation, not the committed prefix: a
    /// range past `num_pages` but inside the reservation is returned and
    /// faults on access, exactly as a compiled access to it would. This
    /// helper exists for host-originated accesses, which must surface a
    /// clean trap instead of a hardware fault.
    pub fn validated_range(&self, offset: usize, len: usize) -> Result<NonNull<u8>, Trap> {
        let start = cmp::min(offset, self.end_offset);
        match start.checked_add(len) {
            Some(end) if end <= self.end_offset => {
                // `start` is bounded by the reservation, so the pointer
                // arithmetic stays inside the mapping.
                Ok(unsafe { NonNull::new_unchecked(self.base().add(start)) })
            }
            _ => Err(Trap::heap_out_of_bounds()),
        }
    }

    /// Do an unsynchronized, non-atomic `memory.copy` within this memory.
    ///
    /// Unlike [`LinearMemory::validated_range`] this helper dereferences the
    /// memory itself, so both ranges are bounded against the committed
    /// prefix rather than the reservation. Overlapping ranges copy as if
    /// through a temporary buffer.
    pub fn copy_within(&self, dst: u32, src: u32, len: u32) -> Result<(), Trap> {
        let committed = self.num_pages().bytes().0;
        if src
            .checked_add(len)
            .map_or(true, |n| n as usize > committed)
            || dst
                .checked_add(len)
                .map_or(true, |n| n as usize > committed)
        {
            return Err(Trap::heap_out_of_bounds());
        }

        // Bounds are checked above; by this point the whole range is
        // committed and in bounds.
        unsafe {
            let dst = self.base().add(dst as usize);
            let src = self.base().add(src as usize);
            ptr::copy(src, dst, len as usize);
        }

        Ok(())
    }

    /// Perform the `memory.fill` operation within this memory, in an
    /// unsynchronized, non-atomic way. Bounds follow the same committed-
    /// prefix discipline as [`LinearMemory::copy_within`].
    pub fn fill(&self, dst: u32, val: u32, len: u32) -> Result<(), Trap> {
        let committed = self.num_pages().bytes().0;
        if dst
            .checked_add(len)
            .map_or(true, |n| n as usize > committed)
        {
            return Err(Trap::heap_out_of_bounds());
        }

        unsafe {
            let dst = self.base().add(dst as usize);
            ptr::write_bytes(dst, val as u8, len as usize);
        }

        Ok(())
    }
}

impl Drop for LinearMemory {
    fn drop(&mut self) {
        // Decommit whatever is still committed, then leave the registry just
        // before the reservation itself is released by the mmap's drop.
        let num_pages = Pages(*self.num_pages.get_mut());
        if num_pages > Pages(0) {
            self.mmap.decommit(0, num_pages.bytes().0);
        }
        registry::unregister(self.base() as usize);
        log::trace!("destroyed linear memory at {:p}", self.base());
    }
}

fn _assert() {
    fn _assert_send_sync<T: Send + Sync>() {}
    _assert_send_sync::<LinearMemory>();
}
