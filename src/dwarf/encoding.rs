//! The `DW_EH_PE_*` pointer encoding byte used by `.eh_frame` augmentations.

use core::fmt;

use super::constants::*;

/// A pointer encoding. The low nibble is the [`ValueFormat`], bits 4..7 the
/// [`ValueApplication`] and the high bit marks the pointer as indirect.
#[derive(PartialEq, Eq, Clone, Copy)]
#[repr(transparent)]
pub struct Encoding(pub u8);

impl Encoding {
    pub const ABSPTR: Encoding = Encoding(DW_EH_PE_absptr);
    pub const OMIT: Encoding = Encoding(DW_EH_PE_omit);

    pub fn is_omit(self) -> bool {
        self == Self::OMIT
    }

    /// The decoded value is the address of the real pointer. Dereferencing it
    /// is up to the consumer.
    pub fn is_indirect(self) -> bool {
        self.0 & DW_EH_PE_indirect != 0
    }

    pub fn format(self) -> Option<ValueFormat> {
        Some(match self.0 & 0x0f {
            DW_EH_PE_absptr => ValueFormat::DW_EH_PE_absptr,
            DW_EH_PE_uleb128 => ValueFormat::DW_EH_PE_uleb128,
            DW_EH_PE_udata2 => ValueFormat::DW_EH_PE_udata2,
            DW_EH_PE_udata4 => ValueFormat::DW_EH_PE_udata4,
            DW_EH_PE_udata8 => ValueFormat::DW_EH_PE_udata8,
            DW_EH_PE_signed => ValueFormat::DW_EH_PE_signed,
            DW_EH_PE_sleb128 => ValueFormat::DW_EH_PE_sleb128,
            DW_EH_PE_sdata2 => ValueFormat::DW_EH_PE_sdata2,
            DW_EH_PE_sdata4 => ValueFormat::DW_EH_PE_sdata4,
            DW_EH_PE_sdata8 => ValueFormat::DW_EH_PE_sdata8,
            _ => return None,
        })
    }

    pub fn application(self) -> Option<ValueApplication> {
        Some(match self.0 & 0x70 {
            DW_EH_PE_absptr => ValueApplication::DW_EH_PE_absptr,
            DW_EH_PE_pcrel => ValueApplication::DW_EH_PE_pcrel,
            DW_EH_PE_textrel => ValueApplication::DW_EH_PE_textrel,
            DW_EH_PE_datarel => ValueApplication::DW_EH_PE_datarel,
            DW_EH_PE_funcrel => ValueApplication::DW_EH_PE_funcrel,
            DW_EH_PE_aligned => ValueApplication::DW_EH_PE_aligned,
            _ => return None,
        })
    }

    /// Whether this byte names a known format and application. `omit` counts
    /// as valid; whether it is acceptable depends on where it appears.
    /// `aligned` carries no format or indirection of its own.
    pub fn is_valid(self) -> bool {
        if self.is_omit() {
            return true;
        }
        match (self.format(), self.application()) {
            (Some(_), Some(ValueApplication::DW_EH_PE_aligned)) => self.0 == DW_EH_PE_aligned,
            (Some(_), Some(_)) => true,
            _ => false,
        }
    }

    /// The same format, read as an absolute value. FDE address ranges are
    /// lengths and are read this way.
    pub fn without_application(self) -> Encoding {
        Encoding(self.0 & 0x0f)
    }
}

impl fmt::Debug for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_omit() {
            return f.write_str("DW_EH_PE_omit");
        }
        match (self.application(), self.format()) {
            (Some(application), Some(format)) => {
                write!(f, "{application:?} | {format:?}")?;
                if self.is_indirect() {
                    f.write_str(" | DW_EH_PE_indirect")?;
                }
                Ok(())
            }
            _ => write!(f, "invalid encoding {:#04x}", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum ValueFormat {
    /// A value the size of a target address.
    DW_EH_PE_absptr = 0x00,
    /// Unsigned value is encoded using the Little Endian Base 128 (LEB128) as
    /// defined by DWARF Debugging Information Format, Revision 2.0.0 (July 27,
    /// 1993).
    DW_EH_PE_uleb128 = 0x01,
    /// A 2 bytes unsigned value.
    DW_EH_PE_udata2 = 0x02,
    /// A 4 bytes unsigned value.
    DW_EH_PE_udata4 = 0x03,
    /// An 8 bytes unsigned value.
    DW_EH_PE_udata8 = 0x04,
    /// A signed value the size of a target address.
    DW_EH_PE_signed = 0x08,
    /// Signed value is encoded using the Little Endian Base 128 (LEB128) as
    /// defined by DWARF Debugging Information Format, Revision 2.0.0 (July 27,
    /// 1993).
    DW_EH_PE_sleb128 = 0x09,
    /// A 2 bytes signed value.
    DW_EH_PE_sdata2 = 0x0A,
    /// A 4 bytes signed value.
    DW_EH_PE_sdata4 = 0x0B,
    /// An 8 bytes signed value.
    DW_EH_PE_sdata8 = 0x0C,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum ValueApplication {
    DW_EH_PE_absptr = 0x00,
    ///	Value is relative to the current program counter.
    DW_EH_PE_pcrel = 0x10,
    ///	Value is relative to the beginning of the .text section.
    DW_EH_PE_textrel = 0x20,
    ///	Value is relative to the beginning of the .got or .eh_frame_hdr
    /// section.
    DW_EH_PE_datarel = 0x30,
    ///	Value is relative to the beginning of the function.
    DW_EH_PE_funcrel = 0x40,
    ///	Value is aligned to an address unit sized boundary.
    DW_EH_PE_aligned = 0x50,
}
