//! The `.eh_frame_hdr` section: a sorted table of `(initial location, FDE
//! address)` pairs that lets us binary search `.eh_frame`.
//! See <https://refspecs.linuxfoundation.org/LSB_1.3.0/gLSB/gLSB/ehframehdr.html>.

use alloc::format;

use super::{
    parse::{read_encoded, read_u8, Bases, Cursor, Encoding},
    Error, Result,
};
use crate::target::Section;

#[derive(Debug)]
pub(crate) struct EhFrameHdr<'a> {
    /// Address of the `.eh_frame` section.
    pub(crate) eh_frame_ptr: u64,
    fde_count: u64,
    table_enc: Encoding,
    table: Section<'a>,
    /// Base for `DW_EH_PE_datarel` table entries.
    hdr_address: u64,
    address_size: u8,
}

impl<'a> EhFrameHdr<'a> {
    #[instrument(level = "trace", skip(section), fields(address = section.address))]
    pub(crate) fn parse(section: &Section<'a>, address_size: u8) -> Result<Self> {
        let data = &mut Cursor::of(section);

        let version = read_u8(data)?;
        if version != 1 {
            return Err(Error::Malformed(format!("eh_frame_hdr version {version} is not 1")));
        }
        let eh_frame_ptr_enc = Encoding(read_u8(data)?);
        let fde_count_enc = Encoding(read_u8(data)?);
        let table_enc = Encoding(read_u8(data)?);

        trace!(?eh_frame_ptr_enc, ?fde_count_enc, ?table_enc);

        let bases = Bases {
            address_size,
            datarel: Some(section.address),
        };

        if eh_frame_ptr_enc.is_omit() {
            return Err(Error::Malformed("eh_frame_hdr has no eh_frame_ptr".into()));
        }
        let eh_frame_ptr = read_encoded(data, eh_frame_ptr_enc, &bases)?;

        let fde_count = if fde_count_enc.is_omit() || table_enc.is_omit() {
            0
        } else {
            read_encoded(data, fde_count_enc, &bases)?
        };

        trace!("eh_frame: {eh_frame_ptr:#x}");
        trace!("fde_count: {fde_count}");

        let table_start = data.pos();
        Ok(Self {
            eh_frame_ptr,
            fde_count,
            table_enc,
            table: Section::new(
                section.address.wrapping_add(table_start as u64),
                &section.data[table_start..],
            ),
            hdr_address: section.address,
            address_size,
        })
    }

    pub(crate) fn has_table(&self) -> bool {
        self.fde_count > 0
    }

    fn entry(&self, index: u64, half_entry_size: usize) -> Result<(u64, u64)> {
        let bases = Bases {
            address_size: self.address_size,
            datarel: Some(self.hdr_address),
        };
        let offset = usize::try_from(index)
            .ok()
            .and_then(|index| index.checked_mul(half_entry_size * 2))
            .ok_or_else(|| Error::Malformed(format!("table index {index} out of range")))?;
        let data = &mut Cursor::of(&self.table);
        data.seek(offset)?;
        let initial_location = read_encoded(data, self.table_enc, &bases)?;
        let fde_address = read_encoded(data, self.table_enc, &bases)?;
        Ok((initial_location, fde_address))
    }

    /// The address of the FDE with the greatest initial location `<= pc`.
    /// The FDE might still end before `pc`.
    #[instrument(level = "debug", skip(self))]
    pub(crate) fn search(&self, pc: u64) -> Result<Option<u64>> {
        if !self.has_table() {
            return Ok(None);
        }
        let half_entry_size = self.table_enc.size(self.address_size)?;

        let mut base = 0;
        let mut len = self.fde_count;
        while len > 1 {
            let half = len / 2;
            let mid = base + half;
            let (initial_location, _) = self.entry(mid, half_entry_size)?;
            trace!(?base, ?len, ?mid, "binary searching for {pc:#x}: {initial_location:#x}");
            if initial_location <= pc {
                base = mid;
            }
            len -= half;
        }

        let (initial_location, fde_address) = self.entry(base, half_entry_size)?;
        if initial_location > pc {
            return Ok(None);
        }
        debug!("found FDE idx {base} in binary search at {fde_address:#x}");
        Ok(Some(fde_address))
    }
}
