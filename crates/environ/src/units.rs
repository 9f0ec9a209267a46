//! Units of WebAssembly memory.

use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;
use std::ops::{Add, Sub};
use thiserror::Error;

/// WebAssembly page sizes are fixed to be 64KiB.
pub const WASM_PAGE_SIZE: usize = 0x1_0000;

/// log2 of a WebAssembly page size.
pub const WASM_PAGE_SIZE_LOG2: u32 = 16;

/// The number of pages a 32-bit index can address before running out of byte
/// index space.
pub const WASM_MAX_PAGES: u64 = 0x1_0000;

/// Units of WebAssembly pages (as specified to be 65,536 bytes).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pages(pub u64);

impl Pages {
    /// Checked addition. Computes `self + rhs`, returning `None` if overflow
    /// occurred.
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    /// Checked subtraction. Computes `self - rhs`, returning `None` if the
    /// result would be negative.
    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }

    /// Calculate the number of bytes from pages.
    pub fn bytes(self) -> Bytes {
        self.into()
    }

    /// Like [`Pages::bytes`], but `None` when the byte count does not fit in
    /// a host `usize`.
    pub fn checked_bytes(self) -> Option<Bytes> {
        let pages = usize::try_from(self.0).ok()?;
        pages.checked_mul(WASM_PAGE_SIZE).map(Bytes)
    }
}

impl fmt::Debug for Pages {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} pages", self.0)
    }
}

impl From<u64> for Pages {
    fn from(other: u64) -> Self {
        Self(other)
    }
}

impl<T> Add<T> for Pages
where
    T: Into<Self>,
{
    type Output = Self;
    fn add(self, rhs: T) -> Self {
        Self(self.0 + rhs.into().0)
    }
}

impl<T> Sub<T> for Pages
where
    T: Into<Self>,
{
    type Output = Self;
    fn sub(self, rhs: T) -> Self {
        Self(self.0 - rhs.into().0)
    }
}

/// Units of WebAssembly memory in terms of 8-bit bytes.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Bytes(pub usize);

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} bytes", self.0)
    }
}

impl From<Pages> for Bytes {
    fn from(pages: Pages) -> Self {
        Self((pages.0 as usize) * WASM_PAGE_SIZE)
    }
}

impl From<usize> for Bytes {
    fn from(other: usize) -> Self {
        Self(other)
    }
}

/// The only error that can happen when converting `Bytes` to `Pages`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("number of pages exceeds the addressable range")]
pub struct PageCountOutOfRange;

impl TryFrom<Bytes> for Pages {
    type Error = PageCountOutOfRange;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        let pages = bytes.0 / WASM_PAGE_SIZE;
        u64::try_from(pages).map(Self).or(Err(PageCountOutOfRange))
    }
}
