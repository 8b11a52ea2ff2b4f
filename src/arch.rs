//! Per-architecture register numbering, kept out of the unwinding algorithm.

use crate::target::ThreadContext;

/// The registers and sizes the walker needs to know about for one
/// architecture. Register numbers are DWARF register numbers.
pub trait RegisterConvention {
    fn stack_pointer(&self) -> u16;
    fn base_pointer(&self) -> u16;
    /// Where the context keeps the program counter. On x86-64 this is the
    /// return address column, which is not a real register.
    fn program_counter(&self) -> u16;
    /// Size of a pointer, and of the return address slot.
    fn address_size(&self) -> u8;
}

impl<C: RegisterConvention + ?Sized> RegisterConvention for &C {
    fn stack_pointer(&self) -> u16 {
        (**self).stack_pointer()
    }
    fn base_pointer(&self) -> u16 {
        (**self).base_pointer()
    }
    fn program_counter(&self) -> u16 {
        (**self).program_counter()
    }
    fn address_size(&self) -> u8 {
        (**self).address_size()
    }
}

/// x86-64 System V psABI numbering.
#[derive(Debug, Clone, Copy, Default)]
pub struct Amd64;

impl Amd64 {
    pub const RBP: u16 = 6;
    pub const RSP: u16 = 7;
    pub const RA: u16 = 16;
}

impl RegisterConvention for Amd64 {
    fn stack_pointer(&self) -> u16 {
        Self::RSP
    }
    fn base_pointer(&self) -> u16 {
        Self::RBP
    }
    fn program_counter(&self) -> u16 {
        Self::RA
    }
    fn address_size(&self) -> u8 {
        8
    }
}

/// AArch64 numbering (AADWARF64). `x29` is the frame pointer and `x30` the
/// link register; the PC lives in slot 32 of a [`Registers`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Aarch64;

impl Aarch64 {
    pub const FP: u16 = 29;
    pub const LR: u16 = 30;
    pub const SP: u16 = 31;
    pub const PC: u16 = 32;
}

impl RegisterConvention for Aarch64 {
    fn stack_pointer(&self) -> u16 {
        Self::SP
    }
    fn base_pointer(&self) -> u16 {
        Self::FP
    }
    fn program_counter(&self) -> u16 {
        Self::PC
    }
    fn address_size(&self) -> u8 {
        8
    }
}

pub const MAX_REGISTERS: usize = 33;

/// A plain register file, enough to hold the general purpose registers of
/// both supported architectures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registers {
    values: [Option<u64>; MAX_REGISTERS],
}

impl Registers {
    pub fn new() -> Self {
        Self {
            values: [None; MAX_REGISTERS],
        }
    }

    pub fn set(&mut self, index: u16, value: u64) {
        if let Some(slot) = self.values.get_mut(usize::from(index)) {
            *slot = Some(value);
        } else {
            debug!(index, "register index out of range, ignoring");
        }
    }

    pub fn with(mut self, index: u16, value: u64) -> Self {
        self.set(index, value);
        self
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadContext for Registers {
    fn register(&self, index: u16) -> Option<u64> {
        self.values.get(usize::from(index)).copied().flatten()
    }
}

/// Capture the registers of the calling function. Always inlined so that
/// `rip`, `rsp` and `rbp` describe the caller's frame.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub(crate) fn capture_context() -> Registers {
    use core::arch::asm;

    let mut raw = [0u64; MAX_REGISTERS];

    unsafe {
        asm!(
            "mov [{regs}+0*8], rax",
            "mov [{regs}+1*8], rdx",
            "mov [{regs}+2*8], rcx",
            "mov [{regs}+3*8], rbx",
            "mov [{regs}+4*8], rsi",
            "mov [{regs}+5*8], rdi",
            "mov [{regs}+6*8], rbp",
            "mov [{regs}+7*8], rsp",
            "mov [{regs}+8*8], r8",
            "mov [{regs}+9*8], r9",
            "mov [{regs}+10*8], r10",
            "mov [{regs}+11*8], r11",
            "mov [{regs}+12*8], r12",
            "mov [{regs}+13*8], r13",
            "mov [{regs}+14*8], r14",
            "mov [{regs}+15*8], r15",

            "lea rax, [rip + 0]", // must use rip as a base register
            "mov [{regs}+16*8], rax", // return address column

            out("rax") _,
            regs = in(reg) raw.as_mut_ptr(),
            options(nostack),
        );
    }

    let mut registers = Registers::new();
    for (index, value) in raw.iter().enumerate().take(usize::from(Amd64::RA) + 1) {
        registers.set(index as u16, *value);
    }
    registers
}
