//! Process-wide tracking of live linear memory reservations.
//!
//! The signal handler consults this list to decide whether a hardware fault
//! at some address should be translated into a WebAssembly trap or rethrown
//! as a host crash. Attribution covers `[base, base + end_offset)` only; the
//! trailing guard page is deliberately excluded.

use lazy_static::lazy_static;
use std::sync::Mutex;

#[derive(Clone, Copy, Debug)]
struct MemoryRange {
    base: usize,
    end: usize,
}

lazy_static! {
    // Global list of live memories; used to query whether an address is
    // reserved by one of them.
    static ref LIVE_MEMORIES: Mutex<Vec<MemoryRange>> = Mutex::new(Vec::new());
}

/// Record a reservation spanning `[base, end)`. Called as soon as the
/// reservation succeeds, before the memory is visible anywhere else.
pub(crate) fn register(base: usize, end: usize) {
    assert!(base < end);
    let mut memories = LIVE_MEMORIES.lock().unwrap();
    debug_assert!(
        memories.iter().all(|m| end <= m.base || m.end <= base),
        "overlapping linear memory reservations"
    );
    memories.push(MemoryRange { base, end });
    log::trace!("registered linear memory {:#x}..{:#x}", base, end);
}

/// Drop the reservation record starting at `base`. Called just before the
/// reservation itself is released.
pub(crate) fn unregister(base: usize) {
    let mut memories = LIVE_MEMORIES.lock().unwrap();
    if let Some(index) = memories.iter().position(|m| m.base == base) {
        memories.swap_remove(index);
        log::trace!("unregistered linear memory at {:#x}", base);
    }
}

/// Returns whether `addr` falls within the reservation of a live linear
/// memory.
///
/// The scan is linear under the registry mutex; the caller is a fault
/// handler whose path is already slow.
pub fn is_address_owned_by_memory(addr: *const u8) -> bool {
    let addr = addr as usize;
    let memories = LIVE_MEMORIES.lock().unwrap();
    memories.iter().any(|m| addr >= m.base && addr < m.end)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Synthetic ranges near the top of the address space so they cannot
    // collide with reservations made by other tests in this process.
    const BASE: usize = usize::MAX - 0x10_0000;

    #[test]
    fn attribution_is_range_exclusive() {
        register(BASE, BASE + 0x1000);

        assert!(!is_address_owned_by_memory((BASE - 1) as *const u8));
        assert!(is_address_owned_by_memory(BASE as *const u8));
        assert!(is_address_owned_by_memory((BASE + 0xfff) as *const u8));
        assert!(!is_address_owned_by_memory((BASE + 0x1000) as *const u8));

        unregister(BASE);
        assert!(!is_address_owned_by_memory(BASE as *const u8));
    }
}
