//! WebAssembly linear memory descriptions.

use crate::units::Pages;
use serde::{Deserialize, Serialize};

/// A WebAssembly linear memory description: its initial size and the upper
/// bound it may grow to, both in WebAssembly pages.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemoryType {
    /// The initial and minimum size of the memory, in pages. A freshly
    /// created memory has exactly this many pages committed.
    pub minimum: Pages,
    /// The upper size bound of the memory, in pages. Must be at least
    /// `minimum`; the runtime asserts this when a memory is created.
    pub maximum: Pages,
}

impl MemoryType {
    /// Create a new memory description with the given bounds.
    pub fn new(minimum: Pages, maximum: Pages) -> Self {
        Self { minimum, maximum }
    }
}
