//! Runtime library support for ferrite: linear memory instances, the
//! compartments that bind them, and the global registry that attributes
//! hardware faults to them.
//!
//! The layout contract that everything here serves: each memory reserves a
//! large contiguous address range with a trailing guard page, commits only a
//! prefix of it, and never moves. Compiled code may therefore form addresses
//! from a 32-bit index plus a 32-bit constant offset with no bounds check;
//! an out-of-bounds access lands in uncommitted or guard territory and
//! faults, and the signal handler uses [`is_address_owned_by_memory`] to
//! turn that fault into a trap rather than a crash.

#![deny(missing_docs)]

mod compartment;
mod index_allocator;
mod memory;
mod mmap;
mod registry;
mod trap;

pub use crate::compartment::{Compartment, CompartmentRuntimeData, MAX_MEMORIES_PER_COMPARTMENT};
pub use crate::index_allocator::{SlotId, SlotTable};
pub use crate::memory::{LinearMemory, MemoryError, MEMORY_RESERVATION_BYTES, NUM_GUARD_PAGES};
pub use crate::mmap::{host_page_size, Mmap};
pub use crate::registry::is_address_owned_by_memory;
pub use crate::trap::Trap;
