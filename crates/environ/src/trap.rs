//! Trap codes describing synchronous failures signaled to the host.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The reason a trap was raised.
///
/// A trap is catchable by the host runtime, unlike a host crash. The memory
/// core raises exactly one code itself; the signal handler reuses it when it
/// translates a hardware fault attributed to a linear memory reservation.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, Serialize, Deserialize)]
pub enum TrapCode {
    /// A memory access was outside the bounds of a linear memory.
    HeapOutOfBounds,
}

impl fmt::Display for TrapCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let desc = match self {
            TrapCode::HeapOutOfBounds => "out of bounds memory access",
        };
        f.write_str(desc)
    }
}
