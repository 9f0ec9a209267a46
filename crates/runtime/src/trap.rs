//! Synchronous traps raised by host-originated memory accesses.

use ferrite_environ::TrapCode;
use std::fmt;

/// A trap signaled to the host runtime.
///
/// Host-facing accessors return this instead of letting the access reach the
/// hardware: the host expects a catchable failure, not a memory-protection
/// fault.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trap {
    code: TrapCode,
}

impl Trap {
    /// Create a trap with the given code.
    pub fn new(code: TrapCode) -> Self {
        Self { code }
    }

    /// The trap raised when an access leaves the bounds of a linear memory.
    pub fn heap_out_of_bounds() -> Self {
        Self::new(TrapCode::HeapOutOfBounds)
    }

    /// The code describing why the trap was raised.
    pub fn code(&self) -> TrapCode {
        self.code
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "wasm trap: {}", self.code)
    }
}

impl std::error::Error for Trap {}
