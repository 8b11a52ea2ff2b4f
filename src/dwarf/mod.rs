//! Finding out how to unwind a frame from the DWARF call frame information
//! of the library it belongs to.
//!
//! # how it works
//! We find the Frame Description Entry covering the PC: through the binary
//! search table in `.eh_frame_hdr` if the library has one, otherwise by
//! walking `.eh_frame` (and then `.debug_frame`) entry by entry. Then the
//! CIE and FDE instructions are replayed up to the PC (yes, that's basically
//! a little programming language, see [`rules`]), and the resulting row is
//! boiled down to the few numbers the frame walker needs: [`CfiInfo`].
//! See https://dwarfstd.org/doc/DWARF5.pdf for more information if more
//! information is desired.

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub(crate) mod divination;
pub(crate) mod hdr;
pub(crate) mod parse;
mod rules;


use alloc::{collections::BTreeMap, format, string::String};
use core::fmt;

use self::{
    hdr::EhFrameHdr,
    parse::{parse_cie_at, parse_entry_header, parse_fde, Cie, Fde, SectionKind},
    rules::{row_for_pc, CfaRule, RegisterRule},
};
use crate::{
    arch::RegisterConvention,
    target::{Library, Section},
};

/// Why call frame information could not be used for a PC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The library has neither `.eh_frame` nor `.debug_frame`.
    NoFrameInfo,
    /// No FDE covers the PC.
    PcNotCovered(u64),
    /// The CIE uses augmentations we cannot interpret, such as a personality
    /// routine or LSDA.
    UnsupportedAugmentation(String),
    UnsupportedEncoding(u8),
    UnsupportedOpcode(u8),
    /// The CFA is computed by a DWARF expression.
    UnsupportedCfaRule,
    /// The return address column has no `offset(N)` rule at this PC.
    MissingReturnAddress,
    Truncated { wanted: usize, remaining: usize },
    /// The dwarf is invalid.
    Malformed(String),
}

impl Error {
    /// Whether the CFI was found but could not be decoded, as opposed to
    /// there being nothing for this PC.
    pub fn is_decoding_error(&self) -> bool {
        !matches!(self, Error::NoFrameInfo | Error::PcNotCovered(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoFrameInfo => f.write_str("library has no call frame information"),
            Error::PcNotCovered(pc) => write!(f, "no FDE covers pc {pc:#x}"),
            Error::UnsupportedAugmentation(aug) => write!(f, "unsupported augmentation {aug:?}"),
            Error::UnsupportedEncoding(enc) => write!(f, "unsupported pointer encoding {enc:#x}"),
            Error::UnsupportedOpcode(op) => write!(f, "unsupported call frame instruction {op:#x}"),
            Error::UnsupportedCfaRule => f.write_str("CFA is defined by an expression"),
            Error::MissingReturnAddress => f.write_str("return address is not saved on the stack"),
            Error::Truncated { wanted, remaining } => {
                write!(f, "truncated: tried to read {wanted} bytes from {remaining}")
            }
            Error::Malformed(msg) => write!(f, "malformed call frame information: {msg}"),
        }
    }
}

impl core::error::Error for Error {}

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// The register the CFA is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfaRegister {
    BasePointer,
    StackPointer,
    /// Some other DWARF register.
    Other(u16),
}

/// How to unwind one frame, at one PC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfiInfo {
    cfa_register: CfaRegister,
    cfa_offset: i64,
    base_pointer_offset: Option<i64>,
    return_address_offset: i64,
}

impl CfiInfo {
    pub fn new(
        cfa_register: CfaRegister,
        cfa_offset: i64,
        base_pointer_offset: Option<i64>,
        return_address_offset: i64,
    ) -> Self {
        Self {
            cfa_register,
            cfa_offset,
            base_pointer_offset,
            return_address_offset,
        }
    }

    /// CFA = value of this register + [`CfiInfo::cfa_offset`].
    pub fn cfa_register(&self) -> CfaRegister {
        self.cfa_register
    }

    pub fn cfa_offset(&self) -> i64 {
        self.cfa_offset
    }

    /// Where the caller's base pointer is saved, relative to the CFA. `None`
    /// if this function has not saved it (yet).
    pub fn base_pointer_offset_from_cfa(&self) -> Option<i64> {
        self.base_pointer_offset
    }

    pub fn is_bp_offset_available(&self) -> bool {
        self.base_pointer_offset.is_some()
    }

    /// Where the return address is saved, relative to the CFA.
    pub fn return_address_offset_from_cfa(&self) -> i64 {
        self.return_address_offset
    }
}

/// Parses the call frame information of one library.
///
/// Holds no state between calls to [`CfiParser::process`], so the same PC
/// always gives the same answer.
#[derive(Debug)]
pub struct CfiParser<'a> {
    eh_frame: Option<Section<'a>>,
    eh_frame_hdr: Option<Section<'a>>,
    debug_frame: Option<Section<'a>>,
    base_pointer: u16,
    stack_pointer: u16,
    address_size: u8,
}

impl<'a> CfiParser<'a> {
    pub fn new<L, C>(library: &'a L, convention: &C) -> Result<Self>
    where
        L: Library + ?Sized,
        C: RegisterConvention + ?Sized,
    {
        let eh_frame = library.eh_frame();
        let debug_frame = library.debug_frame();
        if eh_frame.is_none() && debug_frame.is_none() {
            debug!(library = library.name(), "no call frame sections");
            return Err(Error::NoFrameInfo);
        }
        Ok(Self {
            eh_frame,
            eh_frame_hdr: library.eh_frame_hdr(),
            debug_frame,
            base_pointer: convention.base_pointer(),
            stack_pointer: convention.stack_pointer(),
            address_size: convention.address_size(),
        })
    }

    /// Compute the unwinding rules in effect at `pc`.
    #[instrument(level = "debug", skip_all, fields(pc = %crate::Address(pc)))]
    pub fn process(&self, pc: u64) -> Result<CfiInfo> {
        let mut result = Err(Error::PcNotCovered(pc));

        if let Some(eh_frame) = &self.eh_frame {
            result = self.find_in_eh_frame(eh_frame, pc);
        }
        if matches!(result, Err(Error::PcNotCovered(_))) {
            if let Some(debug_frame) = &self.debug_frame {
                trace!("falling back to .debug_frame");
                result =
                    find_by_scanning(debug_frame, SectionKind::DebugFrame, pc, self.address_size);
            }
        }

        let (cie, fde) = result?;
        self.info_for(&cie, &fde, pc)
    }

    fn find_in_eh_frame(&self, eh_frame: &Section<'a>, pc: u64) -> Result<(Cie<'a>, Fde<'a>)> {
        if let Some(hdr) = &self.eh_frame_hdr {
            match EhFrameHdr::parse(hdr, self.address_size) {
                Ok(hdr) if hdr.has_table() => match self.find_with_table(&hdr, eh_frame, pc) {
                    Err(err) if !matches!(err, Error::PcNotCovered(_)) => {
                        debug!(%err, "eh_frame_hdr search failed, scanning eh_frame")
                    }
                    result => return result,
                },
                Ok(_) => trace!("eh_frame_hdr has no search table"),
                Err(err) => debug!(%err, "unusable eh_frame_hdr, scanning eh_frame"),
            }
        }
        find_by_scanning(eh_frame, SectionKind::EhFrame, pc, self.address_size)
    }

    fn find_with_table(
        &self,
        hdr: &EhFrameHdr<'_>,
        eh_frame: &Section<'a>,
        pc: u64,
    ) -> Result<(Cie<'a>, Fde<'a>)> {
        let fde_address = hdr.search(pc)?.ok_or(Error::PcNotCovered(pc))?;

        let offset = fde_address
            .checked_sub(eh_frame.address)
            .and_then(|offset| usize::try_from(offset).ok())
            .filter(|offset| *offset < eh_frame.data.len())
            .ok_or_else(|| {
                Error::Malformed(format!("FDE address {fde_address:#x} is outside .eh_frame"))
            })?;
        trace!("FDE offset to .eh_frame: {offset:#x}");

        let header = parse_entry_header(eh_frame, offset)?
            .ok_or_else(|| Error::Malformed(format!("no FDE at offset {offset:#x}")))?;
        if header.is_cie(SectionKind::EhFrame) {
            return Err(Error::Malformed(format!("entry at {offset:#x} is a CIE")));
        }

        let cie_offset = header.cie_offset(SectionKind::EhFrame)?;
        trace!("CIE offset to .eh_frame: {cie_offset:#x}");
        let cie = parse_cie_at(eh_frame, cie_offset, SectionKind::EhFrame, self.address_size)?;
        let fde = parse_fde(header, SectionKind::EhFrame, &cie)?;

        if !fde.contains(pc) {
            return Err(Error::PcNotCovered(pc));
        }
        Ok((cie, fde))
    }

    fn info_for(&self, cie: &Cie<'_>, fde: &Fde<'_>, pc: u64) -> Result<CfiInfo> {
        if cie.augmentation.as_ref().is_some_and(|aug| aug.has_language_data()) {
            return Err(Error::UnsupportedAugmentation(cie.augmentation_string.into()));
        }

        let row = row_for_pc(cie, fde, pc)?;

        let (register, cfa_offset) = match row.cfa {
            CfaRule::RegisterOffset { register, offset } => (register, offset),
            CfaRule::Expression => return Err(Error::UnsupportedCfaRule),
            CfaRule::Unset => return Err(Error::Malformed("no CFA rule".into())),
        };
        let cfa_register = if register == self.base_pointer {
            CfaRegister::BasePointer
        } else if register == self.stack_pointer {
            CfaRegister::StackPointer
        } else {
            CfaRegister::Other(register)
        };

        let base_pointer_offset = match row.register(self.base_pointer) {
            RegisterRule::Offset(offset) => Some(offset),
            _ => None,
        };

        let return_address_offset = match row.register(cie.return_address_register) {
            RegisterRule::Offset(offset) => offset,
            rule => {
                debug!(?rule, "return address rule");
                return Err(Error::MissingReturnAddress);
            }
        };

        let info = CfiInfo {
            cfa_register,
            cfa_offset,
            base_pointer_offset,
            return_address_offset,
        };
        debug!(?info);
        Ok(info)
    }
}

/// Walk every entry of the section until an FDE covering `pc` turns up.
#[instrument(level = "debug", skip(section))]
fn find_by_scanning<'a>(
    section: &Section<'a>,
    kind: SectionKind,
    pc: u64,
    address_size: u8,
) -> Result<(Cie<'a>, Fde<'a>)> {
    // CIEs seen so far, by offset. Most sections have a handful.
    let mut cies: BTreeMap<usize, Option<Cie<'a>>> = BTreeMap::new();
    let mut offset = 0;

    while let Some(header) = parse_entry_header(section, offset)? {
        offset = header.next;

        if header.is_cie(kind) {
            continue;
        }

        let cie_offset = header.cie_offset(kind)?;
        let cie = cies.entry(cie_offset).or_insert_with(|| {
            parse_cie_at(section, cie_offset, kind, address_size)
                .inspect_err(|err| debug!(cie_offset, %err, "skipping FDEs of unusable CIE"))
                .ok()
        });
        // Without the CIE we cannot even tell where the FDE's range is.
        let Some(cie) = cie else {
            continue;
        };

        let fde = parse_fde(header, kind, cie)?;
        if fde.contains(pc) {
            let cie = cies.remove(&cie_offset).flatten().ok_or(Error::PcNotCovered(pc))?;
            return Ok((cie, fde));
        }
    }

    Err(Error::PcNotCovered(pc))
}
