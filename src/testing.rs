//! Hand-built call frame sections and a fake process to walk.

use alloc::{collections::BTreeMap, string::String, vec::Vec};
use core::{cell::Cell, ops::Range};

use crate::{
    target::{Library, MemoryError, Section, Target},
    Address,
};

/// CIE initial instructions for the x86-64 function entry:
/// `DW_CFA_def_cfa: RSP +8`, `DW_CFA_offset: RIP -8`.
pub(crate) const ENTRY_INSTRUCTIONS: &[u8] = &[0x0c, 7, 8, 0x90, 1];

/// FDE instructions for `push rbp; mov rbp, rsp`:
/// ```text
/// DW_CFA_advance_loc: 1
/// DW_CFA_def_cfa_offset: +16
/// DW_CFA_offset: RBP -16
/// DW_CFA_advance_loc: 3
/// DW_CFA_def_cfa_register: RBP
/// ```
pub(crate) const PROLOGUE_INSTRUCTIONS: &[u8] = &[0x41, 0x0e, 0x10, 0x86, 0x02, 0x43, 0x0d, 0x06];

/// Builds an `.eh_frame` section (and a matching `.eh_frame_hdr`) loaded at
/// a fixed address. CIEs are `zR` with pcrel sdata4 FDE pointers, a code
/// alignment factor of 1, a data alignment factor of -8 and RIP as return
/// address column.
pub(crate) struct EhFrameBuilder {
    address: u64,
    data: Vec<u8>,
    /// `(pc_begin, offset)` of every FDE.
    fdes: Vec<(u64, usize)>,
}

impl EhFrameBuilder {
    pub(crate) fn new(address: u64) -> Self {
        Self {
            address,
            data: Vec::new(),
            fdes: Vec::new(),
        }
    }

    pub(crate) fn cie(&mut self) -> usize {
        self.cie_with(b"zR", &[0x1b], ENTRY_INSTRUCTIONS)
    }

    pub(crate) fn cie_with(
        &mut self,
        augmentation: &[u8],
        augmentation_data: &[u8],
        instructions: &[u8],
    ) -> usize {
        let offset = self.data.len();
        let mut body = vec![0, 0, 0, 0, 1];
        body.extend_from_slice(augmentation);
        body.push(0);
        body.extend_from_slice(&[1, 0x78, 16]);
        if augmentation.first() == Some(&b'z') {
            body.push(augmentation_data.len() as u8);
            body.extend_from_slice(augmentation_data);
        }
        body.extend_from_slice(instructions);
        self.push_entry(body);
        offset
    }

    pub(crate) fn fde(
        &mut self,
        cie: usize,
        pc_begin: u64,
        pc_range: u32,
        instructions: &[u8],
    ) -> usize {
        let offset = self.data.len();
        let id_offset = offset + 4;
        let pc_begin_address = self.address + (offset + 8) as u64;

        let mut body = Vec::new();
        body.extend_from_slice(&((id_offset - cie) as u32).to_le_bytes());
        body.extend_from_slice(&(pc_begin.wrapping_sub(pc_begin_address) as u32).to_le_bytes());
        body.extend_from_slice(&pc_range.to_le_bytes());
        body.push(0);
        body.extend_from_slice(instructions);
        self.push_entry(body);

        self.fdes.push((pc_begin, offset));
        offset
    }

    /// Append raw bytes, e.g. a broken entry.
    pub(crate) fn raw(&mut self, bytes: &[u8]) -> usize {
        let offset = self.data.len();
        self.data.extend_from_slice(bytes);
        offset
    }

    fn push_entry(&mut self, mut body: Vec<u8>) {
        while (body.len() + 4) % 8 != 0 {
            body.push(0); // DW_CFA_nop
        }
        self.data.extend_from_slice(&(body.len() as u32).to_le_bytes());
        self.data.extend_from_slice(&body);
    }

    /// An `.eh_frame_hdr` loaded at `address`, with a search table over
    /// every FDE added so far.
    pub(crate) fn hdr(&self, address: u64) -> Vec<u8> {
        let mut fdes = self.fdes.clone();
        fdes.sort();

        let eh_frame_ptr = self.address.wrapping_sub(address + 4) as u32;
        let mut hdr = vec![1, 0x1b, 0x03, 0x3b];
        hdr.extend_from_slice(&eh_frame_ptr.to_le_bytes());
        hdr.extend_from_slice(&(fdes.len() as u32).to_le_bytes());
        for (pc_begin, offset) in fdes {
            let fde_address = self.address + offset as u64;
            hdr.extend_from_slice(&(pc_begin.wrapping_sub(address) as u32).to_le_bytes());
            hdr.extend_from_slice(&(fde_address.wrapping_sub(address) as u32).to_le_bytes());
        }
        hdr
    }

    /// The section, with its zero terminator.
    pub(crate) fn finish(mut self) -> Vec<u8> {
        self.data.extend_from_slice(&[0, 0, 0, 0]);
        self.data
    }
}

#[derive(Debug)]
pub(crate) struct SyntheticLibrary {
    pub(crate) name: String,
    pub(crate) range: Range<u64>,
    pub(crate) eh_frame: Option<(u64, Vec<u8>)>,
    pub(crate) eh_frame_hdr: Option<(u64, Vec<u8>)>,
    pub(crate) debug_frame: Option<(u64, Vec<u8>)>,
}

impl SyntheticLibrary {
    pub(crate) fn new(name: &str, range: Range<u64>) -> Self {
        Self {
            name: name.into(),
            range,
            eh_frame: None,
            eh_frame_hdr: None,
            debug_frame: None,
        }
    }

    pub(crate) fn with_eh_frame(mut self, address: u64, data: Vec<u8>) -> Self {
        self.eh_frame = Some((address, data));
        self
    }

    pub(crate) fn with_eh_frame_hdr(mut self, address: u64, data: Vec<u8>) -> Self {
        self.eh_frame_hdr = Some((address, data));
        self
    }

    pub(crate) fn with_debug_frame(mut self, address: u64, data: Vec<u8>) -> Self {
        self.debug_frame = Some((address, data));
        self
    }
}

fn section(section: &Option<(u64, Vec<u8>)>) -> Option<Section<'_>> {
    section.as_ref().map(|(address, data)| Section::new(*address, data))
}

impl Library for SyntheticLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    fn eh_frame(&self) -> Option<Section<'_>> {
        section(&self.eh_frame)
    }

    fn eh_frame_hdr(&self) -> Option<Section<'_>> {
        section(&self.eh_frame_hdr)
    }

    fn debug_frame(&self) -> Option<Section<'_>> {
        section(&self.debug_frame)
    }
}

/// A process whose memory is a map of 8 byte words.
#[derive(Debug, Default)]
pub(crate) struct SyntheticTarget {
    pub(crate) libraries: Vec<SyntheticLibrary>,
    pub(crate) memory: BTreeMap<u64, u64>,
    pub(crate) symbols: Vec<(Range<u64>, String)>,
    pub(crate) reads: Cell<usize>,
}

impl SyntheticTarget {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn library(mut self, library: SyntheticLibrary) -> Self {
        self.libraries.push(library);
        self
    }

    pub(crate) fn word(mut self, address: u64, value: u64) -> Self {
        self.memory.insert(address, value);
        self
    }

    pub(crate) fn with_symbol(mut self, range: Range<u64>, name: &str) -> Self {
        self.symbols.push((range, name.into()));
        self
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads.get()
    }
}

impl Target for SyntheticTarget {
    type Library<'a> = &'a SyntheticLibrary
    where
        Self: 'a;

    fn find_library(&self, pc: Address) -> Option<Self::Library<'_>> {
        self.libraries
            .iter()
            .find(|library| library.range.contains(&pc.value()))
    }

    fn read_memory(&self, address: Address, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.reads.set(self.reads.get() + 1);
        let word = self
            .memory
            .get(&address.value())
            .filter(|_| buf.len() == 8)
            .ok_or(MemoryError::Unmapped(address))?;
        buf.copy_from_slice(&word.to_le_bytes());
        Ok(())
    }

    fn symbol(&self, pc: Address) -> Option<String> {
        self.symbols
            .iter()
            .find(|(range, _)| range.contains(&pc.value()))
            .map(|(_, name)| name.clone())
    }
}
