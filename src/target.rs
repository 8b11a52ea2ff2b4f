//! What the unwinder needs from the debugger hosting it.

use alloc::string::String;
use core::fmt;

use crate::Address;

/// A process (live or a core dump) whose stacks are being walked.
pub trait Target {
    type Library<'a>: Library
    where
        Self: 'a;

    /// The loaded library whose code contains `pc`, if any. `None` means the
    /// code is not native, e.g. JIT-compiled or interpreted.
    fn find_library(&self, pc: Address) -> Option<Self::Library<'_>>;

    /// Fill `buf` with the target's memory starting at `address`.
    fn read_memory(&self, address: Address, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// A symbol name for display. Never used for unwinding decisions.
    fn symbol(&self, _pc: Address) -> Option<String> {
        None
    }
}

/// A loaded object and its call frame sections.
pub trait Library {
    fn name(&self) -> &str;

    /// `.eh_frame`
    fn eh_frame(&self) -> Option<Section<'_>>;

    /// `.eh_frame_hdr`, used for binary searching `.eh_frame`.
    fn eh_frame_hdr(&self) -> Option<Section<'_>> {
        None
    }

    /// `.debug_frame`, searched when `.eh_frame` has no entry for a PC.
    fn debug_frame(&self) -> Option<Section<'_>> {
        None
    }
}

impl<L: Library + ?Sized> Library for &L {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn eh_frame(&self) -> Option<Section<'_>> {
        (**self).eh_frame()
    }

    fn eh_frame_hdr(&self) -> Option<Section<'_>> {
        (**self).eh_frame_hdr()
    }

    fn debug_frame(&self) -> Option<Section<'_>> {
        (**self).debug_frame()
    }
}

/// The bytes of a section together with the address they are loaded at.
/// The address is the base for PC-relative pointer encodings.
#[derive(Clone, Copy)]
pub struct Section<'a> {
    pub address: u64,
    pub data: &'a [u8],
}

impl<'a> Section<'a> {
    pub fn new(address: u64, data: &'a [u8]) -> Self {
        Self { address, data }
    }
}

impl fmt::Debug for Section<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Section")
            .field("address", &format_args!("{:#x}", self.address))
            .field("len", &self.data.len())
            .finish()
    }
}

/// Register values of the thread being unwound, indexed by DWARF register
/// number.
pub trait ThreadContext {
    fn register(&self, index: u16) -> Option<u64>;

    fn register_as_address(&self, index: u16) -> Option<Address> {
        self.register(index).map(Address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    Unmapped(Address),
    Unaligned(Address),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::Unmapped(addr) => write!(f, "address {addr} is not mapped"),
            MemoryError::Unaligned(addr) => write!(f, "address {addr} is not aligned"),
        }
    }
}

impl core::error::Error for MemoryError {}
