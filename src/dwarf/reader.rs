//! Fixed width, LEB128 and encoded pointer reads over a section.

use core::fmt;

use super::config::{AddressSize, PointerBases};
use super::encoding::{Encoding, ValueApplication, ValueFormat};
use super::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

/// A read position inside a section.
///
/// The cursor always keeps the whole section so positions are section
/// offsets. `end` bounds the reads, which lets callers hand out cursors
/// limited to a single entry or augmentation block.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Cursor<'a> {
    section: &'a [u8],
    pos: usize,
    end: usize,
    endian: Endianness,
}

impl<'a> Cursor<'a> {
    pub fn new(section: &'a [u8], endian: Endianness) -> Self {
        Self {
            section,
            pos: 0,
            end: section.len(),
            endian,
        }
    }

    /// A cursor over `start..end` of the same section.
    pub fn range(&self, start: usize, end: usize) -> Result<Self> {
        if start > end || end > self.section.len() {
            return Err(Error::UnexpectedEnd);
        }
        Ok(Self {
            pos: start,
            end,
            ..*self
        })
    }

    /// A cursor over the next `len` bytes. `self` does not move.
    pub fn limit(&self, len: usize) -> Result<Self> {
        if len > self.remaining() {
            return Err(Error::UnexpectedEnd);
        }
        Ok(Self {
            end: self.pos + len,
            ..*self
        })
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn remaining(&self) -> usize {
        self.end - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.end
    }

    pub fn skip(&mut self, amount: usize) -> Result<()> {
        self.read_bytes(amount).map(drop)
    }

    /// Empty the cursor.
    pub fn exhaust(&mut self) {
        self.pos = self.end;
    }

    pub fn read_bytes(&mut self, amount: usize) -> Result<&'a [u8]> {
        if self.remaining() < amount {
            return Err(Error::UnexpectedEnd);
        }
        let result = &self.section[self.pos..self.pos + amount];
        self.pos += amount;
        Ok(result)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut array = [0; N];
        array.copy_from_slice(self.read_bytes(N)?);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_array()?;
        Ok(match self.endian {
            Endianness::Little => u16::from_le_bytes(bytes),
            Endianness::Big => u16::from_be_bytes(bytes),
        })
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_array()?;
        Ok(match self.endian {
            Endianness::Little => u32::from_le_bytes(bytes),
            Endianness::Big => u32::from_be_bytes(bytes),
        })
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_array()?;
        Ok(match self.endian {
            Endianness::Little => u64::from_le_bytes(bytes),
            Endianness::Big => u64::from_be_bytes(bytes),
        })
    }

    /// Reads an unsigned value of 1, 2, 4 or 8 bytes.
    pub fn read_unsigned(&mut self, size: usize) -> Result<u64> {
        match size {
            1 => self.read_u8().map(u64::from),
            2 => self.read_u16().map(u64::from),
            4 => self.read_u32().map(u64::from),
            8 => self.read_u64(),
            _ => Err(Error::UnexpectedEnd),
        }
    }

    /// Reads a sign-extended value of 1, 2, 4 or 8 bytes.
    pub fn read_signed(&mut self, size: usize) -> Result<i64> {
        match size {
            1 => self.read_u8().map(|v| i64::from(v as i8)),
            2 => self.read_u16().map(|v| i64::from(v as i16)),
            4 => self.read_u32().map(|v| i64::from(v as i32)),
            8 => self.read_u64().map(|v| v as i64),
            _ => Err(Error::UnexpectedEnd),
        }
    }

    pub fn read_address(&mut self, size: AddressSize) -> Result<u64> {
        self.read_unsigned(size.bytes())
    }

    /// Bits beyond the 64th are dropped.
    pub fn read_uleb128(&mut self) -> Result<u64> {
        let mut result = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= u64::from(byte & 0b0111_1111) << shift;
            }
            shift += 7;
            if (byte >> 7) == 0 {
                break;
            }
        }
        Ok(result)
    }

    pub fn read_sleb128(&mut self) -> Result<i64> {
        let mut result: i64 = 0;
        let mut shift = 0;
        let byte = loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= i64::from(byte & 0b0111_1111) << shift;
            }
            shift += 7;
            if (byte >> 7) == 0 {
                break byte;
            }
        };
        if shift < 64 && (byte & 0b0100_0000) != 0 {
            result |= -1 << shift;
        }
        Ok(result)
    }

    /// Reads a NUL terminated string, without the terminator.
    pub fn read_cstr(&mut self) -> Result<&'a [u8]> {
        let rest = &self.section[self.pos..self.end];
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::UnexpectedEnd)?;
        let string = &rest[..len];
        self.pos += len + 1;
        Ok(string)
    }

    /// Like [`Cursor::read_block`], but keeps section offsets for the
    /// block's contents.
    pub fn split_block(&mut self) -> Result<Self> {
        let len = self.read_uleb128()?;
        let len = usize::try_from(len).map_err(|_| Error::UnexpectedEnd)?;
        let block = self.limit(len)?;
        self.pos += len;
        Ok(block)
    }

    /// A ULEB128 length followed by that many bytes.
    pub fn read_block(&mut self) -> Result<&'a [u8]> {
        let len = self.read_uleb128()?;
        let len = usize::try_from(len).map_err(|_| Error::UnexpectedEnd)?;
        self.read_bytes(len)
    }
}

impl fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("range", &(self.pos..self.end))
            .field("endian", &self.endian)
            .finish()
    }
}

/// Reads a pointer encoded as `encoding`, combined with its base.
///
/// Indirect pointers are returned as the address of the pointer. Nothing is
/// consumed if the encoding is invalid or its base is missing.
pub fn read_encoded(
    data: &mut Cursor<'_>,
    encoding: Encoding,
    address_size: AddressSize,
    bases: &PointerBases,
) -> Result<u64> {
    if encoding.is_omit() || !encoding.is_valid() {
        return Err(Error::InvalidEncoding(encoding.0));
    }
    let (Some(format), Some(application)) = (encoding.format(), encoding.application()) else {
        return Err(Error::InvalidEncoding(encoding.0));
    };
    let base = bases
        .base_for(application)
        .ok_or(Error::UnusableEncoding(encoding.0))?;

    let base = match application {
        ValueApplication::DW_EH_PE_pcrel => base.wrapping_add(data.offset() as u64),
        ValueApplication::DW_EH_PE_aligned => {
            let size = address_size.bytes() as u64;
            let skew = base & (size - 1);
            let offset = skew + data.offset() as u64;
            let aligned = (offset + size - 1) & !(size - 1);
            let padding = usize::try_from(aligned - offset).map_err(|_| Error::UnexpectedEnd)?;
            data.skip(padding)?;
            return data.read_address(address_size);
        }
        _ => base,
    };

    let value = match format {
        ValueFormat::DW_EH_PE_absptr => data.read_address(address_size)?,
        ValueFormat::DW_EH_PE_uleb128 => data.read_uleb128()?,
        ValueFormat::DW_EH_PE_udata2 => data.read_unsigned(2)?,
        ValueFormat::DW_EH_PE_udata4 => data.read_unsigned(4)?,
        ValueFormat::DW_EH_PE_udata8 => data.read_unsigned(8)?,
        ValueFormat::DW_EH_PE_signed => data.read_signed(address_size.bytes())? as u64,
        ValueFormat::DW_EH_PE_sleb128 => data.read_sleb128()? as u64,
        ValueFormat::DW_EH_PE_sdata2 => data.read_signed(2)? as u64,
        ValueFormat::DW_EH_PE_sdata4 => data.read_signed(4)? as u64,
        ValueFormat::DW_EH_PE_sdata8 => data.read_signed(8)? as u64,
    };

    Ok(address_size.truncate(base.wrapping_add(value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dwarf::constants::*;

    fn cursor(data: &[u8]) -> Cursor<'_> {
        Cursor::new(data, Endianness::Little)
    }

    #[test]
    fn leb128() {
        let data = [0xe5, 0x8e, 0x26, 0x7f, 0x80, 0x7f, 0x02];
        let mut data = cursor(&data);
        assert_eq!(data.read_uleb128(), Ok(624485));
        assert_eq!(data.read_sleb128(), Ok(-1));
        assert_eq!(data.read_sleb128(), Ok(-128));
        assert_eq!(data.read_sleb128(), Ok(2));
        assert_eq!(data.read_uleb128(), Err(Error::UnexpectedEnd));
    }

    #[test]
    fn endianness() {
        let data = [0x12, 0x34, 0x56, 0x78];
        assert_eq!(cursor(&data).read_u32(), Ok(0x78563412));
        assert_eq!(Cursor::new(&data, Endianness::Big).read_u32(), Ok(0x12345678));
        assert_eq!(Cursor::new(&data, Endianness::Big).read_signed(2), Ok(0x1234));
    }

    #[test]
    fn limits_are_respected() {
        let data = [1, 2, 3, 4, 5, 6];
        let mut outer = cursor(&data);
        outer.skip(1).unwrap();
        let mut inner = outer.limit(2).unwrap();
        assert_eq!(inner.offset(), 1);
        assert_eq!(inner.read_u16(), Ok(0x0302));
        assert_eq!(inner.read_u8(), Err(Error::UnexpectedEnd));
        assert!(outer.limit(6).is_err());
        assert_eq!(cursor(b"zR\0xyz").read_cstr(), Ok(&b"zR"[..]));
        assert_eq!(cursor(b"zR").read_cstr(), Err(Error::UnexpectedEnd));
    }

    #[test]
    fn encoded_pointers() {
        let bases = PointerBases {
            cfi: Some(0x1000),
            text: Some(0x2000),
            data: None,
            function: None,
        };
        let data = [0, 0, 0xfc, 0xff, 0xff, 0xff];
        let mut data = cursor(&data);
        data.skip(2).unwrap();
        let value = read_encoded(
            &mut data,
            Encoding(DW_EH_PE_pcrel | DW_EH_PE_sdata4),
            AddressSize::Eight,
            &bases,
        );
        assert_eq!(value, Ok(0x1000 + 2 - 4));

        let data = [0x10, 0x00];
        let value = read_encoded(
            &mut cursor(&data),
            Encoding(DW_EH_PE_textrel | DW_EH_PE_udata2),
            AddressSize::Four,
            &bases,
        );
        assert_eq!(value, Ok(0x2010));
    }

    #[test]
    fn pointer_formats() {
        let read = |data: &[u8], encoding: u8, address_size: AddressSize| {
            let bases = PointerBases {
                data: Some(0x5000),
                ..PointerBases::default()
            };
            read_encoded(&mut cursor(data), Encoding(encoding), address_size, &bases)
        };

        let minus_two = [0xfe, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
        assert_eq!(read(&minus_two, DW_EH_PE_signed, AddressSize::Four), Ok(0xffff_fffe));
        assert_eq!(
            read(&minus_two, DW_EH_PE_signed, AddressSize::Eight),
            Ok(0xffff_ffff_ffff_fffe)
        );
        assert_eq!(read(&[0x7f], DW_EH_PE_sleb128, AddressSize::Eight), Ok(u64::MAX));
        assert_eq!(
            read(&[0x00, 0x80], DW_EH_PE_sdata2, AddressSize::Eight),
            Ok(0xffff_ffff_ffff_8000)
        );
        assert_eq!(
            read(&[1, 2, 3, 4, 5, 6, 7, 8], DW_EH_PE_udata8, AddressSize::Eight),
            Ok(0x0807_0605_0403_0201)
        );
        assert_eq!(
            read(&[0x10, 0, 0, 0], DW_EH_PE_datarel | DW_EH_PE_udata4, AddressSize::Four),
            Ok(0x5010)
        );
        assert_eq!(
            read(&[0x7f], DW_EH_PE_datarel | DW_EH_PE_sleb128, AddressSize::Eight),
            Ok(0x4fff)
        );
    }

    #[test]
    fn missing_base_consumes_nothing() {
        let data = [0x10, 0x00];
        let mut data = cursor(&data);
        let encoding = Encoding(DW_EH_PE_datarel | DW_EH_PE_udata2);
        assert_eq!(
            read_encoded(&mut data, encoding, AddressSize::Four, &PointerBases::default()),
            Err(Error::UnusableEncoding(encoding.0))
        );
        assert_eq!(data.offset(), 0);
    }

    #[test]
    fn four_byte_addresses_wrap() {
        let bases = PointerBases {
            cfi: Some(0xffff_fff0),
            ..PointerBases::default()
        };
        let data = [0x20, 0, 0, 0];
        let value = read_encoded(
            &mut cursor(&data),
            Encoding(DW_EH_PE_pcrel | DW_EH_PE_udata4),
            AddressSize::Four,
            &bases,
        );
        assert_eq!(value, Ok(0x10));
    }

    #[test]
    fn aligned_pointers_skip_padding() {
        let bases = PointerBases {
            cfi: Some(0x3002),
            ..PointerBases::default()
        };
        // With a section base of 0x3002, offset 2 is the first aligned one.
        let data = [0xaa, 0x78, 0x56, 0x34, 0x12];
        let mut data = cursor(&data);
        data.skip(1).unwrap();
        let encoding = Encoding(DW_EH_PE_aligned);
        assert_eq!(
            read_encoded(&mut data, encoding, AddressSize::Four, &bases),
            Err(Error::UnexpectedEnd)
        );

        let data = [0xaa, 0xbb, 0x78, 0x56, 0x34, 0x12];
        let mut data = cursor(&data);
        data.skip(1).unwrap();
        assert_eq!(
            read_encoded(&mut data, encoding, AddressSize::Four, &bases),
            Ok(0x12345678)
        );
        assert_eq!(data.offset(), 6);
    }
}
