//! Internal dependency of the `ferrite` runtime crates.
//!
//! This crate defines the value types that the runtime and a code generator
//! must agree on: memory limits, page units, and trap codes. It contains no
//! runtime state of its own.

#![deny(missing_docs)]

mod memory;
mod trap;
mod units;

pub use crate::memory::MemoryType;
pub use crate::trap::TrapCode;
pub use crate::units::{
    Bytes, PageCountOutOfRange, Pages, WASM_MAX_PAGES, WASM_PAGE_SIZE, WASM_PAGE_SIZE_LOG2,
};
