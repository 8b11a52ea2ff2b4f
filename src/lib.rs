//! A native call-frame unwinder driven by DWARF call frame information.
//!
//! The unwinder never touches memory itself. A host implements [`Target`]
//! (memory reads, library lookup, symbols) and supplies a [`ThreadContext`];
//! [`Unwinder`] then walks the stack one sender frame at a time, using the
//! CFI of the library containing each PC and falling back to the frame
//! pointer convention where there is none.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate tracing;

use core::fmt;

pub mod arch;
pub mod dwarf;
pub mod target;
pub mod walk;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod identify;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod local;

#[cfg(test)]
mod testing;

pub use arch::{Aarch64, Amd64, RegisterConvention, Registers};
pub use dwarf::{CfaRegister, CfiInfo, CfiParser, Error as CfiError};
pub use target::{Library, MemoryError, Section, Target, ThreadContext};
pub use walk::{Config, Frame, Frames, Unwinder};

/// An address in the target process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub u64);

impl Address {
    pub const NULL: Address = Address(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// `self + offset`, or `None` if that leaves the address space.
    pub fn offset(self, offset: i64) -> Option<Address> {
        self.0.checked_add_signed(offset).map(Address)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
