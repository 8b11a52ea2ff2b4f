//! Byte-level decoding of DWARF call frame information.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §6.4 Call Frame Information,
//! and the LSB description of `.eh_frame` for the GNU flavour:
//! <https://refspecs.linuxbase.org/LSB_5.0.0/LSB-Core-generic/LSB-Core-generic/ehframechpt.html>
//!
//! Both sections are a sequence of length-prefixed entries. A Common
//! Information Entry (CIE) holds what is shared between functions (alignment
//! factors, return address column, initial instructions); a Frame Description
//! Entry (FDE) covers one PC range and points back to its CIE.
#![allow(non_upper_case_globals)]


use alloc::format;
use core::{ffi::CStr, fmt};

use super::{Error, Result};
use crate::target::Section;

/// Which flavour of call frame section is being read. They differ in how
/// CIEs are identified and how FDEs point at them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SectionKind {
    EhFrame,
    DebugFrame,
}

pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    /// The address `data[0]` is loaded at.
    base: u64,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(data: &'a [u8], base: u64) -> Self {
        Self { data, pos: 0, base }
    }

    pub(crate) fn of(section: &Section<'a>) -> Self {
        Self::new(section.data, section.address)
    }

    /// A cursor over `start..end` of the same data, keeping addresses intact.
    fn window(&self, start: usize, end: usize) -> Result<Cursor<'a>> {
        if start > end || end > self.data.len() {
            return Err(Error::Truncated {
                wanted: end,
                remaining: self.data.len(),
            });
        }
        Ok(Cursor {
            data: &self.data[..end],
            pos: start,
            base: self.base,
        })
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(Error::Truncated {
                wanted: pos,
                remaining: self.data.len(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The load address of the next byte.
    pub(crate) fn address(&self) -> u64 {
        self.base.wrapping_add(self.pos as u64)
    }

    fn rest(&mut self) -> &'a [u8] {
        let data: &'a [u8] = self.data;
        let rest = &data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}

impl fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cursor({:#x}: {:x?})", self.address(), &self.data[self.pos..])
    }
}

pub(crate) fn read_bytes<'a>(data: &mut Cursor<'a>, amount: usize) -> Result<&'a [u8]> {
    if data.remaining() < amount {
        return Err(Error::Truncated {
            wanted: amount,
            remaining: data.remaining(),
        });
    }
    let bytes: &'a [u8] = data.data;
    let result = &bytes[data.pos..][..amount];
    data.pos += amount;
    Ok(result)
}

fn read_array<const N: usize>(data: &mut Cursor<'_>) -> Result<[u8; N]> {
    let mut out = [0; N];
    out.copy_from_slice(read_bytes(data, N)?);
    Ok(out)
}

pub(crate) fn read_u8(data: &mut Cursor<'_>) -> Result<u8> {
    Ok(read_array::<1>(data)?[0])
}
pub(crate) fn read_u16(data: &mut Cursor<'_>) -> Result<u16> {
    Ok(u16::from_le_bytes(read_array(data)?))
}
pub(crate) fn read_u32(data: &mut Cursor<'_>) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array(data)?))
}
pub(crate) fn read_u64(data: &mut Cursor<'_>) -> Result<u64> {
    Ok(u64::from_le_bytes(read_array(data)?))
}

fn read_utf8_cstr<'a>(data: &mut Cursor<'a>) -> Result<&'a str> {
    let bytes: &'a [u8] = &data.data[data.pos..];
    let cstr: &CStr = CStr::from_bytes_until_nul(bytes)
        .map_err(|_| Error::Malformed("no null terminator found for string".into()))?;
    let utf8 = cstr
        .to_str()
        .map_err(|e| Error::Malformed(format!("invalid utf8: {e:?}")))?;
    data.pos += utf8.len() + 1;
    Ok(utf8)
}

pub(crate) fn read_uleb128(data: &mut Cursor<'_>) -> Result<u64> {
    let mut result = 0;
    let mut shift = 0;
    loop {
        let byte = read_u8(data)?;
        if shift >= 64 {
            return Err(Error::Malformed("uleb128 does not fit in 64 bits".into()));
        }
        result |= u64::from(byte & 0b0111_1111) << shift;
        if (byte >> 7) == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

pub(crate) fn read_ileb128(data: &mut Cursor<'_>) -> Result<i64> {
    let mut result = 0;
    let mut shift = 0;
    loop {
        let byte = read_u8(data)?;
        if shift >= 64 {
            return Err(Error::Malformed("sleb128 does not fit in 64 bits".into()));
        }
        result |= i64::from(byte & 0b0111_1111) << shift;
        shift += 7;
        if (byte >> 7) == 0 {
            let sign_bit_set = ((byte >> 6) & 1) == 1;
            if shift < 64 && sign_bit_set {
                result |= -1 << shift;
            }
            return Ok(result);
        }
    }
}

fn read_register(data: &mut Cursor<'_>) -> Result<u16> {
    let register = read_uleb128(data)?;
    u16::try_from(register)
        .map_err(|_| Error::Malformed(format!("register number {register} out of range")))
}

/// A `DW_EH_PE_*` pointer encoding byte.
#[derive(PartialEq, Eq, Clone, Copy)]
#[repr(transparent)]
pub(crate) struct Encoding(pub(crate) u8);

impl Encoding {
    pub(crate) const OMIT: Encoding = Encoding(0xff);
    pub(crate) const ABSPTR: Encoding = Encoding(0x00);

    pub(crate) fn is_omit(self) -> bool {
        self == Self::OMIT
    }

    fn format(self) -> Result<ValueFormat> {
        Ok(match self.0 & 0b1111 {
            0x00 => ValueFormat::DW_EH_PE_absptr,
            0x01 => ValueFormat::DW_EH_PE_uleb128,
            0x02 => ValueFormat::DW_EH_PE_udata2,
            0x03 => ValueFormat::DW_EH_PE_udata4,
            0x04 => ValueFormat::DW_EH_PE_udata8,
            0x09 => ValueFormat::DW_EH_PE_sleb128,
            0x0A => ValueFormat::DW_EH_PE_sdata2,
            0x0B => ValueFormat::DW_EH_PE_sdata4,
            0x0C => ValueFormat::DW_EH_PE_sdata8,
            _ => return Err(Error::UnsupportedEncoding(self.0)),
        })
    }

    fn application(self) -> Result<ValueApplication> {
        if self.0 & 0x80 != 0 {
            // DW_EH_PE_indirect: the value is the address of the real value.
            return Err(Error::UnsupportedEncoding(self.0));
        }
        Ok(match (self.0 >> 4) & 0b111 {
            0x0 => ValueApplication::DW_EH_PE_absptr,
            0x1 => ValueApplication::DW_EH_PE_pcrel,
            0x2 => ValueApplication::DW_EH_PE_textrel,
            0x3 => ValueApplication::DW_EH_PE_datarel,
            0x4 => ValueApplication::DW_EH_PE_funcrel,
            0x5 => ValueApplication::DW_EH_PE_aligned,
            _ => return Err(Error::UnsupportedEncoding(self.0)),
        })
    }

    /// The encoded size, for the fixed-size formats.
    pub(crate) fn size(self, address_size: u8) -> Result<usize> {
        Ok(match self.format()? {
            ValueFormat::DW_EH_PE_absptr => usize::from(address_size),
            ValueFormat::DW_EH_PE_udata2 | ValueFormat::DW_EH_PE_sdata2 => 2,
            ValueFormat::DW_EH_PE_udata4 | ValueFormat::DW_EH_PE_sdata4 => 4,
            ValueFormat::DW_EH_PE_udata8 | ValueFormat::DW_EH_PE_sdata8 => 8,
            ValueFormat::DW_EH_PE_uleb128 | ValueFormat::DW_EH_PE_sleb128 => {
                return Err(Error::UnsupportedEncoding(self.0))
            }
        })
    }
}

impl fmt::Debug for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_omit() {
            return f.write_str("DW_EH_PE_omit");
        }
        match (self.application(), self.format()) {
            (Ok(app), Ok(format)) => write!(f, "{app:?} | {format:?}"),
            _ => write!(f, "Encoding({:#x})", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
#[allow(non_camel_case_types)]
enum ValueFormat {
    /// A value the size of an address.
    DW_EH_PE_absptr,
    DW_EH_PE_uleb128,
    DW_EH_PE_udata2,
    DW_EH_PE_udata4,
    DW_EH_PE_udata8,
    DW_EH_PE_sleb128,
    DW_EH_PE_sdata2,
    DW_EH_PE_sdata4,
    DW_EH_PE_sdata8,
}

#[derive(Debug, Clone, Copy)]
#[allow(non_camel_case_types)]
enum ValueApplication {
    DW_EH_PE_absptr,
    ///	Value is relative to the address of the encoded value itself.
    DW_EH_PE_pcrel,
    ///	Value is relative to the beginning of the .text section.
    DW_EH_PE_textrel,
    ///	Value is relative to the beginning of the .got or .eh_frame_hdr
    /// section.
    DW_EH_PE_datarel,
    ///	Value is relative to the beginning of the function.
    DW_EH_PE_funcrel,
    ///	Value is aligned to an address unit sized boundary.
    DW_EH_PE_aligned,
}

/// Base addresses for the relative pointer encodings.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Bases {
    pub(crate) address_size: u8,
    pub(crate) datarel: Option<u64>,
}

fn read_value(data: &mut Cursor<'_>, format: ValueFormat, address_size: u8) -> Result<u64> {
    Ok(match format {
        ValueFormat::DW_EH_PE_absptr => match address_size {
            4 => u64::from(read_u32(data)?),
            8 => read_u64(data)?,
            size => return Err(Error::Malformed(format!("unsupported address size {size}"))),
        },
        ValueFormat::DW_EH_PE_uleb128 => read_uleb128(data)?,
        ValueFormat::DW_EH_PE_udata2 => u64::from(read_u16(data)?),
        ValueFormat::DW_EH_PE_udata4 => u64::from(read_u32(data)?),
        ValueFormat::DW_EH_PE_udata8 => read_u64(data)?,
        ValueFormat::DW_EH_PE_sleb128 => read_ileb128(data)? as u64,
        ValueFormat::DW_EH_PE_sdata2 => read_u16(data)? as i16 as i64 as u64,
        ValueFormat::DW_EH_PE_sdata4 => read_u32(data)? as i32 as i64 as u64,
        ValueFormat::DW_EH_PE_sdata8 => read_u64(data)?,
    })
}

/// Read a pointer encoded with `encoding`, applying its relocation.
pub(crate) fn read_encoded(
    data: &mut Cursor<'_>,
    encoding: Encoding,
    bases: &Bases,
) -> Result<u64> {
    let field_address = data.address();
    let application = encoding.application()?;
    let value = read_value(data, encoding.format()?, bases.address_size)?;

    Ok(match application {
        ValueApplication::DW_EH_PE_absptr => value,
        ValueApplication::DW_EH_PE_pcrel => field_address.wrapping_add(value),
        ValueApplication::DW_EH_PE_datarel => bases
            .datarel
            .ok_or(Error::UnsupportedEncoding(encoding.0))?
            .wrapping_add(value),
        ValueApplication::DW_EH_PE_textrel
        | ValueApplication::DW_EH_PE_funcrel
        | ValueApplication::DW_EH_PE_aligned => return Err(Error::UnsupportedEncoding(encoding.0)),
    })
}

/// Read a value in the format of `encoding` without relocating it, as used
/// for FDE address ranges.
fn read_encoded_unrelocated(
    data: &mut Cursor<'_>,
    encoding: Encoding,
    address_size: u8,
) -> Result<u64> {
    read_value(data, encoding.format()?, address_size)
}

/// The framing shared by CIEs and FDEs.
#[derive(Debug)]
pub(crate) struct EntryHeader<'a> {
    /// Offset of the entry in its section.
    pub(crate) offset: usize,
    /// Offset of the CIE id / CIE pointer field.
    id_offset: usize,
    pub(crate) id: u64,
    pub(crate) is_64: bool,
    /// Everything after the id, up to the end of the entry.
    pub(crate) body: Cursor<'a>,
    /// Offset of the next entry.
    pub(crate) next: usize,
}

impl EntryHeader<'_> {
    pub(crate) fn is_cie(&self, kind: SectionKind) -> bool {
        match kind {
            SectionKind::EhFrame => self.id == 0,
            SectionKind::DebugFrame if self.is_64 => self.id == u64::MAX,
            SectionKind::DebugFrame => self.id == u64::from(u32::MAX),
        }
    }

    /// The section offset of the CIE this FDE belongs to.
    pub(crate) fn cie_offset(&self, kind: SectionKind) -> Result<usize> {
        let offset = match kind {
            SectionKind::EhFrame => (self.id_offset as u64).checked_sub(self.id),
            SectionKind::DebugFrame => Some(self.id),
        };
        offset
            .and_then(|offset| usize::try_from(offset).ok())
            .ok_or_else(|| Error::Malformed(format!("CIE pointer {:#x} out of range", self.id)))
    }
}

/// Parse the entry starting at `offset`. Returns `None` for the zero
/// terminator of `.eh_frame` or at the end of the section.
pub(crate) fn parse_entry_header<'a>(
    section: &Section<'a>,
    offset: usize,
) -> Result<Option<EntryHeader<'a>>> {
    let mut data = Cursor::of(section);
    data.seek(offset)?;
    if data.is_empty() {
        return Ok(None);
    }

    let len = read_u32(&mut data)?;
    if len == 0 {
        return Ok(None);
    }

    let (is_64, len) = if len == 0xffffffff {
        (true, read_u64(&mut data)?)
    } else {
        (false, u64::from(len))
    };

    let start = data.pos();
    let end = usize::try_from(len)
        .ok()
        .and_then(|len| start.checked_add(len))
        .filter(|end| *end <= section.data.len())
        .ok_or(Error::Truncated {
            wanted: len as usize,
            remaining: data.remaining(),
        })?;

    let mut body = data.window(start, end)?;
    let id_offset = body.pos();
    let id = if is_64 {
        read_u64(&mut body)?
    } else {
        u64::from(read_u32(&mut body)?)
    };

    trace!(offset, id, "frame info entry: {body:?}");

    Ok(Some(EntryHeader {
        offset,
        id_offset,
        id,
        is_64,
        body,
        next: end,
    }))
}

/// Common Information Entry
#[derive(Debug, PartialEq)]
pub struct Cie<'a> {
    /// Decoded `z` augmentation data, if the string starts with `z`.
    pub augmentation: Option<AugmentationData>,
    pub augmentation_string: &'a str,
    pub version: u8,
    pub address_size: u8,
    /// Multiplied into every advance location delta.
    pub code_alignment_factor: u64,
    /// Multiplied into every factored offset.
    pub data_alignment_factor: i64,
    /// The rule table column holding the return address. It might not
    /// correspond to an actual machine register.
    pub return_address_register: u16,
    /// Run before every FDE's instructions to set up the initial rules.
    pub initial_instructions: &'a [u8],
    /// Load address of `initial_instructions`.
    pub initial_instructions_address: u64,
}

impl Cie<'_> {
    /// How FDE addresses (and `DW_CFA_set_loc` operands) are encoded.
    pub(crate) fn pointer_encoding(&self) -> Encoding {
        self.augmentation
            .as_ref()
            .and_then(|aug| aug.pointer_encoding)
            .unwrap_or(Encoding::ABSPTR)
    }
}

#[instrument(level = "trace", skip(data))]
pub(crate) fn parse_cie<'a>(
    data: &mut Cursor<'a>,
    kind: SectionKind,
    default_address_size: u8,
) -> Result<Cie<'a>> {
    let version = read_u8(data)?;
    let supported = match kind {
        SectionKind::EhFrame => matches!(version, 1 | 3),
        SectionKind::DebugFrame => matches!(version, 1 | 3 | 4),
    };
    if !supported {
        return Err(Error::Malformed(format!("unsupported CIE version {version}")));
    }

    let augmentation_string = read_utf8_cstr(data)?;

    let mut address_size = default_address_size;
    if version == 4 {
        address_size = read_u8(data)?;
        let segment_selector_size = read_u8(data)?;
        if segment_selector_size != 0 {
            return Err(Error::Malformed(format!(
                "segment selectors are not supported (size {segment_selector_size})"
            )));
        }
    }

    let code_alignment_factor = read_uleb128(data)?;
    let data_alignment_factor = read_ileb128(data)?;
    let return_address_register = if version == 1 {
        u16::from(read_u8(data)?)
    } else {
        read_register(data)?
    };

    let augmentation = if augmentation_string.starts_with('z') {
        let aug_len = read_uleb128(data)?;
        let aug_data = read_bytes(data, aug_len as usize)?;
        let aug = parse_augmentation_data(augmentation_string, aug_data, address_size)?;
        trace!("augmentation: {aug:?}");
        Some(aug)
    } else if augmentation_string.is_empty() {
        None
    } else {
        return Err(Error::UnsupportedAugmentation(augmentation_string.into()));
    };

    let initial_instructions_address = data.address();
    let initial_instructions = data.rest();

    let cie = Cie {
        augmentation,
        augmentation_string,
        version,
        address_size,
        code_alignment_factor,
        data_alignment_factor,
        return_address_register,
        initial_instructions,
        initial_instructions_address,
    };

    trace!("{cie:?}");
    Ok(cie)
}

#[derive(Debug, PartialEq)]
pub struct AugmentationData {
    pub(crate) pointer_encoding: Option<Encoding>,
    pub(crate) lsda_encoding: Option<Encoding>,
    pub(crate) personality: bool,
    pub(crate) signal_frame: bool,
}

impl AugmentationData {
    /// Whether FDEs of this CIE take part in language exception handling,
    /// which we do not interpret.
    pub(crate) fn has_language_data(&self) -> bool {
        self.personality || self.lsda_encoding.is_some()
    }
}

fn parse_augmentation_data(
    string: &str,
    data: &[u8],
    address_size: u8,
) -> Result<AugmentationData> {
    let data = &mut Cursor::new(data, 0);

    let mut aug_data = AugmentationData {
        pointer_encoding: None,
        lsda_encoding: None,
        personality: false,
        signal_frame: false,
    };

    for code in string.bytes().skip(1) {
        match code {
            // A 1 byte argument that is the pointer encoding for the address
            // of a language-specific data area (LSDA) in the FDE's
            // augmentation data.
            b'L' => {
                aug_data.lsda_encoding = Some(Encoding(read_u8(data)?));
            }
            // Two arguments: a 1 byte pointer encoding, then the address of
            // the personality routine in that encoding. We only need to skip
            // over it.
            b'P' => {
                let encoding = Encoding(read_u8(data)?);
                read_encoded_unrelocated(data, encoding, address_size)?;
                aug_data.personality = true;
            }
            // A 1 byte argument that is the pointer encoding for the address
            // pointers used in the FDE.
            b'R' => {
                aug_data.pointer_encoding = Some(Encoding(read_u8(data)?));
            }
            // The CIE belongs to a signal handler frame; no argument.
            b'S' => {
                aug_data.signal_frame = true;
            }
            _ => return Err(Error::UnsupportedAugmentation(string.into())),
        }
    }

    Ok(aug_data)
}

/// Frame Description Entry
#[derive(Debug, PartialEq)]
pub struct Fde<'a> {
    /// Section offset of the owning CIE.
    pub cie_offset: usize,
    /// The address of the first instruction covered by this entry.
    pub pc_begin: u64,
    /// The number of bytes of instructions covered by this entry.
    pub pc_range: u64,
    pub instructions: &'a [u8],
    /// Load address of `instructions`.
    pub instructions_address: u64,
}

impl Fde<'_> {
    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.pc_begin && pc - self.pc_begin < self.pc_range
    }
}

#[instrument(level = "trace", skip(header, cie), fields(offset = header.offset))]
pub(crate) fn parse_fde<'a>(
    header: EntryHeader<'a>,
    kind: SectionKind,
    cie: &Cie<'_>,
) -> Result<Fde<'a>> {
    let cie_offset = header.cie_offset(kind)?;
    let mut data = header.body;

    let encoding = cie.pointer_encoding();
    let bases = Bases {
        address_size: cie.address_size,
        datarel: None,
    };

    let pc_begin = read_encoded(&mut data, encoding, &bases)?;
    let pc_range = read_encoded_unrelocated(&mut data, encoding, cie.address_size)?;

    if cie.augmentation.is_some() {
        // Only the LSDA pointer lives here, and we have no use for it.
        let augmentation_len = read_uleb128(&mut data)?;
        read_bytes(&mut data, augmentation_len as usize)?;
    }

    let instructions_address = data.address();
    let fde = Fde {
        cie_offset,
        pc_begin,
        pc_range,
        instructions: data.rest(),
        instructions_address,
    };
    trace!("FDE: {fde:?}");
    Ok(fde)
}

/// Parse the CIE at `offset`, checking that it is one.
pub(crate) fn parse_cie_at<'a>(
    section: &Section<'a>,
    offset: usize,
    kind: SectionKind,
    default_address_size: u8,
) -> Result<Cie<'a>> {
    let mut header = parse_entry_header(section, offset)?
        .ok_or_else(|| Error::Malformed(format!("no CIE at offset {offset:#x}")))?;
    if !header.is_cie(kind) {
        return Err(Error::Malformed(format!("entry at {offset:#x} is not a CIE")));
    }
    parse_cie(&mut header.body, kind, default_address_size)
}

#[derive(Debug, PartialEq)]
pub(crate) enum Instruction<'a> {
    //-------- 6.4.2.1 Row Creation Instructions
    /// Start a new row at this absolute address.
    SetLoc(u64),
    /// Start a new row `delta * code_alignment_factor` bytes further. Covers
    /// DW_CFA_advance_loc and its 1, 2 and 4 byte variants.
    AdvanceLoc(u64),

    //-------- 6.4.2.2 CFA Definition Instructions
    DefCfa { register: u16, offset: u64 },
    DefCfaSf { register: u16, factored_offset: i64 },
    DefCfaRegister(u16),
    DefCfaOffset(u64),
    DefCfaOffsetSf(i64),
    DefCfaExpression(&'a [u8]),

    //-------- 6.4.2.3 Register Rule Instructions
    Undefined(u16),
    SameValue(u16),
    /// DW_CFA_offset and DW_CFA_offset_extended.
    Offset { register: u16, factored_offset: u64 },
    OffsetExtendedSf { register: u16, factored_offset: i64 },
    /// GNU extension: like DW_CFA_offset_extended, with the offset negated.
    NegativeOffsetExtended { register: u16, factored_offset: u64 },
    ValOffset { register: u16, factored_offset: u64 },
    ValOffsetSf { register: u16, factored_offset: i64 },
    Register { target_register: u16, from_register: u16 },
    Expression { register: u16, expr: &'a [u8] },
    ValExpression { register: u16, expr: &'a [u8] },
    /// DW_CFA_restore and DW_CFA_restore_extended.
    Restore(u16),

    //-------- 6.4.2.4 Row State Instructions
    RememberState,
    RestoreState,

    //-------- 6.4.2.5 Padding Instruction
    Nop,
    /// GNU extension recording the size of outgoing arguments. No effect on
    /// the rules.
    ArgsSize(u64),
}

const DW_CFA_advance_loc_hi: u8 = 0x01;
const DW_CFA_offset_hi: u8 = 0x02;
const DW_CFA_restore_hi: u8 = 0x03;

const DW_CFA_nop: u8 = 0;
const DW_CFA_set_loc: u8 = 0x01;
const DW_CFA_advance_loc1: u8 = 0x02;
const DW_CFA_advance_loc2: u8 = 0x03;
const DW_CFA_advance_loc4: u8 = 0x04;
const DW_CFA_offset_extended: u8 = 0x05;
const DW_CFA_restore_extended: u8 = 0x06;
const DW_CFA_undefined: u8 = 0x07;
const DW_CFA_same_value: u8 = 0x08;
const DW_CFA_register: u8 = 0x09;
const DW_CFA_remember_state: u8 = 0x0a;
const DW_CFA_restore_state: u8 = 0x0b;
const DW_CFA_def_cfa: u8 = 0x0c;
const DW_CFA_def_cfa_register: u8 = 0x0d;
const DW_CFA_def_cfa_offset: u8 = 0x0e;
const DW_CFA_def_cfa_expression: u8 = 0x0f;
const DW_CFA_expression: u8 = 0x10;
const DW_CFA_offset_extended_sf: u8 = 0x11;
const DW_CFA_def_cfa_sf: u8 = 0x12;
const DW_CFA_def_cfa_offset_sf: u8 = 0x13;
const DW_CFA_val_offset: u8 = 0x14;
const DW_CFA_val_offset_sf: u8 = 0x15;
const DW_CFA_val_expression: u8 = 0x16;
const DW_CFA_GNU_args_size: u8 = 0x2e;
const DW_CFA_GNU_negative_offset_extended: u8 = 0x2f;

/// Decodes a call frame instruction stream. Yields an error (and then
/// stops) on truncated input or an opcode we do not know.
pub(crate) struct InstrIter<'a> {
    data: Cursor<'a>,
    encoding: Encoding,
    bases: Bases,
    failed: bool,
}

impl<'a> InstrIter<'a> {
    /// `encoding` is the CIE's pointer encoding, used by `DW_CFA_set_loc`.
    /// `base` is the load address of `instructions[0]`.
    pub(crate) fn new(
        instructions: &'a [u8],
        base: u64,
        encoding: Encoding,
        address_size: u8,
    ) -> Self {
        Self {
            data: Cursor::new(instructions, base),
            encoding,
            bases: Bases {
                address_size,
                datarel: None,
            },
            failed: false,
        }
    }

    fn block(&mut self) -> Result<&'a [u8]> {
        let len = read_uleb128(&mut self.data)?;
        read_bytes(&mut self.data, len as usize)
    }

    fn decode(&mut self) -> Result<Instruction<'a>> {
        let data = &mut self.data;
        let b = read_u8(data)?;
        let high_2 = b >> 6;
        let low_6 = b & (u8::MAX >> 2);
        Ok(match high_2 {
            DW_CFA_advance_loc_hi => Instruction::AdvanceLoc(u64::from(low_6)),
            DW_CFA_offset_hi => Instruction::Offset {
                register: u16::from(low_6),
                factored_offset: read_uleb128(data)?,
            },
            DW_CFA_restore_hi => Instruction::Restore(u16::from(low_6)),
            _ => match b {
                DW_CFA_nop => Instruction::Nop,
                DW_CFA_set_loc => {
                    Instruction::SetLoc(read_encoded(data, self.encoding, &self.bases)?)
                }
                DW_CFA_advance_loc1 => Instruction::AdvanceLoc(u64::from(read_u8(data)?)),
                DW_CFA_advance_loc2 => Instruction::AdvanceLoc(u64::from(read_u16(data)?)),
                DW_CFA_advance_loc4 => Instruction::AdvanceLoc(u64::from(read_u32(data)?)),
                DW_CFA_offset_extended => Instruction::Offset {
                    register: read_register(data)?,
                    factored_offset: read_uleb128(data)?,
                },
                DW_CFA_restore_extended => Instruction::Restore(read_register(data)?),
                DW_CFA_undefined => Instruction::Undefined(read_register(data)?),
                DW_CFA_same_value => Instruction::SameValue(read_register(data)?),
                DW_CFA_register => Instruction::Register {
                    target_register: read_register(data)?,
                    from_register: read_register(data)?,
                },
                DW_CFA_remember_state => Instruction::RememberState,
                DW_CFA_restore_state => Instruction::RestoreState,
                DW_CFA_def_cfa => Instruction::DefCfa {
                    register: read_register(data)?,
                    offset: read_uleb128(data)?,
                },
                DW_CFA_def_cfa_register => Instruction::DefCfaRegister(read_register(data)?),
                DW_CFA_def_cfa_offset => Instruction::DefCfaOffset(read_uleb128(data)?),
                DW_CFA_def_cfa_expression => Instruction::DefCfaExpression(self.block()?),
                DW_CFA_expression => {
                    let register = read_register(&mut self.data)?;
                    Instruction::Expression {
                        register,
                        expr: self.block()?,
                    }
                }
                DW_CFA_offset_extended_sf => Instruction::OffsetExtendedSf {
                    register: read_register(data)?,
                    factored_offset: read_ileb128(data)?,
                },
                DW_CFA_def_cfa_sf => Instruction::DefCfaSf {
                    register: read_register(data)?,
                    factored_offset: read_ileb128(data)?,
                },
                DW_CFA_def_cfa_offset_sf => Instruction::DefCfaOffsetSf(read_ileb128(data)?),
                DW_CFA_val_offset => Instruction::ValOffset {
                    register: read_register(data)?,
                    factored_offset: read_uleb128(data)?,
                },
                DW_CFA_val_offset_sf => Instruction::ValOffsetSf {
                    register: read_register(data)?,
                    factored_offset: read_ileb128(data)?,
                },
                DW_CFA_val_expression => {
                    let register = read_register(&mut self.data)?;
                    Instruction::ValExpression {
                        register,
                        expr: self.block()?,
                    }
                }
                DW_CFA_GNU_args_size => Instruction::ArgsSize(read_uleb128(data)?),
                DW_CFA_GNU_negative_offset_extended => Instruction::NegativeOffsetExtended {
                    register: read_register(data)?,
                    factored_offset: read_uleb128(data)?,
                },
                _ => return Err(Error::UnsupportedOpcode(b)),
            },
        })
    }
}

impl<'a> Iterator for InstrIter<'a> {
    type Item = Result<Instruction<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.data.is_empty() {
            return None;
        }
        let instruction = self.decode();
        self.failed = instruction.is_err();
        Some(instruction)
    }
}
