//! Per-parse settings: byte order, address size, section flavour and the base
//! addresses that relative pointer encodings are resolved against.

use super::encoding::{Encoding, ValueApplication};
use super::reader::Endianness;

/// Which section the bytes came from. The two differ in how CIEs are
/// identified, how FDEs point at them and in the terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    DebugFrame,
    EhFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSize {
    Four,
    Eight,
}

impl AddressSize {
    pub fn bytes(self) -> usize {
        match self {
            AddressSize::Four => 4,
            AddressSize::Eight => 8,
        }
    }

    /// Addresses wrap at this size.
    pub(crate) fn truncate(self, value: u64) -> u64 {
        match self {
            AddressSize::Four => value & 0xffff_ffff,
            AddressSize::Eight => value,
        }
    }
}

/// Base addresses for relative pointer encodings. An encoding whose base is
/// missing cannot be decoded.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PointerBases {
    /// The address the first byte of the section is loaded at. Used by
    /// `DW_EH_PE_pcrel` and `DW_EH_PE_aligned`.
    pub cfi: Option<u64>,
    pub text: Option<u64>,
    pub data: Option<u64>,
    /// The start of the function the current FDE describes. Only ever set
    /// while that FDE is being read.
    pub(crate) function: Option<u64>,
}

impl PointerBases {
    pub(crate) fn base_for(&self, application: ValueApplication) -> Option<u64> {
        match application {
            ValueApplication::DW_EH_PE_absptr => Some(0),
            ValueApplication::DW_EH_PE_pcrel | ValueApplication::DW_EH_PE_aligned => self.cfi,
            ValueApplication::DW_EH_PE_textrel => self.text,
            ValueApplication::DW_EH_PE_datarel => self.data,
            ValueApplication::DW_EH_PE_funcrel => self.function,
        }
    }

    /// Whether a pointer with this (valid) encoding could be decoded now.
    pub(crate) fn is_usable(&self, encoding: Encoding) -> bool {
        encoding
            .application()
            .is_some_and(|application| self.base_for(application).is_some())
    }

    pub(crate) fn with_function(self, function: u64) -> Self {
        Self {
            function: Some(function),
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub endianness: Endianness,
    pub address_size: AddressSize,
    pub section: SectionKind,
    pub bases: PointerBases,
}

impl Config {
    pub fn debug_frame(endianness: Endianness, address_size: AddressSize) -> Self {
        Self {
            endianness,
            address_size,
            section: SectionKind::DebugFrame,
            bases: PointerBases::default(),
        }
    }

    pub fn eh_frame(endianness: Endianness, address_size: AddressSize) -> Self {
        Self {
            section: SectionKind::EhFrame,
            ..Self::debug_frame(endianness, address_size)
        }
    }

    pub fn with_cfi_base(mut self, base: u64) -> Self {
        self.bases.cfi = Some(base);
        self
    }

    pub fn with_text_base(mut self, base: u64) -> Self {
        self.bases.text = Some(base);
        self
    }

    pub fn with_data_base(mut self, base: u64) -> Self {
        self.bases.data = Some(base);
        self
    }

    pub fn is_eh_frame(&self) -> bool {
        self.section == SectionKind::EhFrame
    }
}
