//! Helpers for the tests: an assembler for CFI sections and a handler and
//! reporter that record what they are told.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::ops::ControlFlow;

use super::config::{AddressSize, Config, PointerBases, SectionKind};
use super::constants::*;
use super::encoding::{Encoding, ValueApplication, ValueFormat};
use super::handler::{Handler, Problem, Register, Reporter};
use super::parse::{CallFrameInfo, Outcome};
use super::reader::Endianness;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug)]
struct Fixup {
    at: usize,
    size: usize,
    label: Label,
    /// `.eh_frame` CIE pointers count back from the pointer itself.
    relative: bool,
}

/// Builds a `.debug_frame` or `.eh_frame` section byte by byte.
///
/// Entry lengths are filled in by [`CfiSection::finish_entry`] and CIE
/// references by [`CfiSection::finish`], so FDEs can cite CIEs that come
/// later.
#[derive(Debug)]
pub struct CfiSection {
    endian: Endianness,
    address_size: AddressSize,
    section: SectionKind,
    bytes: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
    /// Position and size of the length field of the open entry.
    open_entry: Option<(usize, usize)>,
    /// What [`CfiSection::encoded_pointer`] computes relative pointers against.
    pub bases: PointerBases,
}

impl CfiSection {
    pub fn new(endian: Endianness, address_size: AddressSize, section: SectionKind) -> Self {
        Self {
            endian,
            address_size,
            section,
            bytes: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            open_entry: None,
            bases: PointerBases::default(),
        }
    }

    pub fn debug_frame() -> Self {
        Self::new(Endianness::Little, AddressSize::Four, SectionKind::DebugFrame)
    }

    pub fn eh_frame() -> Self {
        Self::new(Endianness::Little, AddressSize::Four, SectionKind::EhFrame)
    }

    /// The configuration that parses this section.
    pub fn config(&self) -> Config {
        Config {
            endianness: self.endian,
            address_size: self.address_size,
            section: self.section,
            bases: PointerBases {
                function: None,
                ..self.bases
            },
        }
    }

    pub fn here(&self) -> usize {
        self.bytes.len()
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn mark(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.here());
        self
    }

    fn put(&mut self, value: u64, size: usize) -> &mut Self {
        let bytes = value.to_le_bytes();
        match self.endian {
            Endianness::Little => self.bytes.extend_from_slice(&bytes[..size]),
            Endianness::Big => self.bytes.extend(bytes[..size].iter().rev()),
        }
        self
    }

    fn put_at(&mut self, at: usize, value: u64, size: usize) {
        let bytes = value.to_le_bytes();
        for i in 0..size {
            let byte = bytes[i];
            match self.endian {
                Endianness::Little => self.bytes[at + i] = byte,
                Endianness::Big => self.bytes[at + size - 1 - i] = byte,
            }
        }
    }

    pub fn d8(&mut self, value: u8) -> &mut Self {
        self.put(u64::from(value), 1)
    }

    pub fn d16(&mut self, value: u16) -> &mut Self {
        self.put(u64::from(value), 2)
    }

    pub fn d32(&mut self, value: u32) -> &mut Self {
        self.put(u64::from(value), 4)
    }

    pub fn d64(&mut self, value: u64) -> &mut Self {
        self.put(value, 8)
    }

    pub fn address(&mut self, value: u64) -> &mut Self {
        self.put(value, self.address_size.bytes())
    }

    pub fn append(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn uleb128(&mut self, mut value: u64) -> &mut Self {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                return self.d8(byte);
            }
            self.d8(byte | 0x80);
        }
    }

    pub fn sleb128(&mut self, mut value: i64) -> &mut Self {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
            if done {
                return self.d8(byte);
            }
            self.d8(byte | 0x80);
        }
    }

    /// A ULEB128 length and the bytes.
    pub fn block(&mut self, bytes: &[u8]) -> &mut Self {
        self.uleb128(bytes.len() as u64).append(bytes)
    }

    /// Starts an entry with a length to be filled in and the given raw id.
    pub fn entry(&mut self, id: u64, dwarf64: bool) -> &mut Self {
        assert!(self.open_entry.is_none(), "entry still open");
        if dwarf64 {
            self.d32(DWARF64_LENGTH_ESCAPE);
            self.open_entry = Some((self.here(), 8));
            self.d64(0).d64(id)
        } else {
            self.open_entry = Some((self.here(), 4));
            self.d32(0).d32(id as u32)
        }
    }

    /// Everything up to the return address register. `z` augmentation data
    /// and the instructions are up to the caller.
    pub fn cie_header(
        &mut self,
        code_factor: u64,
        data_factor: i64,
        return_register: Register,
        version: u8,
        augmentation: &str,
        dwarf64: bool,
    ) -> &mut Self {
        let id = match (self.section, dwarf64) {
            (SectionKind::EhFrame, _) => EH_FRAME_CIE_ID,
            (SectionKind::DebugFrame, false) => DEBUG_FRAME_CIE_ID_32,
            (SectionKind::DebugFrame, true) => DEBUG_FRAME_CIE_ID_64,
        };
        self.entry(id, dwarf64)
            .d8(version)
            .append(augmentation.as_bytes())
            .d8(0);
        if version == 4 {
            self.d8(self.address_size.bytes() as u8).d8(0);
        }
        self.uleb128(code_factor).sleb128(data_factor);
        if version == 1 {
            self.d8(return_register as u8)
        } else {
            self.uleb128(return_register)
        }
    }

    /// Starts an FDE citing `cie`, without its addresses.
    pub fn fde_prologue(&mut self, cie: Label, dwarf64: bool) -> &mut Self {
        self.entry(0, dwarf64);
        let size = if dwarf64 { 8 } else { 4 };
        self.fixups.push(Fixup {
            at: self.here() - size,
            size,
            label: cie,
            relative: self.section == SectionKind::EhFrame,
        });
        self
    }

    /// Starts an FDE with absolute addresses.
    pub fn fde_header(&mut self, cie: Label, address: u64, size: u64, dwarf64: bool) -> &mut Self {
        self.fde_prologue(cie, dwarf64).address(address).address(size)
    }

    pub fn finish_entry(&mut self) -> &mut Self {
        let (at, size) = self.open_entry.take().expect("no entry open");
        let length = self.here() - at - size;
        self.put_at(at, length as u64, size);
        self
    }

    /// The `.eh_frame` end marker.
    pub fn terminator(&mut self) -> &mut Self {
        self.d32(0)
    }

    /// `value` as a pointer in `encoding`, relative to [`CfiSection::bases`].
    pub fn encoded_pointer(&mut self, value: u64, encoding: u8) -> &mut Self {
        let encoding = Encoding(encoding);
        let application = encoding.application().expect("valid application");
        let format = encoding.format().expect("valid format");
        let base = match application {
            ValueApplication::DW_EH_PE_absptr => 0,
            ValueApplication::DW_EH_PE_pcrel => {
                self.bases.cfi.expect("cfi base") + self.here() as u64
            }
            ValueApplication::DW_EH_PE_textrel => self.bases.text.expect("text base"),
            ValueApplication::DW_EH_PE_datarel => self.bases.data.expect("data base"),
            ValueApplication::DW_EH_PE_funcrel => self.bases.function.expect("function base"),
            ValueApplication::DW_EH_PE_aligned => {
                let size = self.address_size.bytes() as u64;
                let cfi = self.bases.cfi.expect("cfi base");
                while (cfi + self.here() as u64) % size != 0 {
                    self.d8(0);
                }
                return self.address(value);
            }
        };
        let raw = value.wrapping_sub(base);
        match format {
            ValueFormat::DW_EH_PE_absptr | ValueFormat::DW_EH_PE_signed => self.address(raw),
            ValueFormat::DW_EH_PE_uleb128 => self.uleb128(raw),
            ValueFormat::DW_EH_PE_sleb128 => self.sleb128(raw as i64),
            ValueFormat::DW_EH_PE_udata2 | ValueFormat::DW_EH_PE_sdata2 => self.d16(raw as u16),
            ValueFormat::DW_EH_PE_udata4 | ValueFormat::DW_EH_PE_sdata4 => self.d32(raw as u32),
            ValueFormat::DW_EH_PE_udata8 | ValueFormat::DW_EH_PE_sdata8 => self.d64(raw),
        }
    }

    /// The section, with CIE references resolved.
    pub fn finish(&mut self) -> Vec<u8> {
        assert!(self.open_entry.is_none(), "entry still open");
        for i in 0..self.fixups.len() {
            let Fixup {
                at,
                size,
                label,
                relative,
            } = self.fixups[i];
            let target = self.labels[label.0].expect("label never marked");
            let value = if relative {
                (at as u64).wrapping_sub(target as u64)
            } else {
                target as u64
            };
            self.put_at(at, value, size);
        }
        self.bytes.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Entry {
        offset: u64,
        address: u64,
        length: u64,
        version: u8,
        augmentation: String,
        return_address: Register,
    },
    Undefined {
        address: u64,
        register: Register,
    },
    SameValue {
        address: u64,
        register: Register,
    },
    Offset {
        address: u64,
        register: Register,
        base: Register,
        offset: i64,
    },
    ValOffset {
        address: u64,
        register: Register,
        base: Register,
        offset: i64,
    },
    Register {
        address: u64,
        register: Register,
        base: Register,
    },
    Expression {
        address: u64,
        register: Register,
        expression: Vec<u8>,
    },
    ValExpression {
        address: u64,
        register: Register,
        expression: Vec<u8>,
    },
    PersonalityRoutine {
        address: u64,
        indirect: bool,
    },
    LanguageSpecificDataArea {
        address: u64,
        indirect: bool,
    },
    SignalHandler,
    End,
}

/// Records every callback. Entries at addresses in `decline` are refused,
/// and the callback equal to `stop_on` returns [`ControlFlow::Break`].
#[derive(Debug, Default)]
pub struct RecordingHandler {
    pub events: Vec<Event>,
    pub decline: Vec<u64>,
    pub stop_on: Option<Event>,
}

impl RecordingHandler {
    fn record(&mut self, event: Event) -> ControlFlow<()> {
        let stop = self.stop_on.as_ref() == Some(&event);
        self.events.push(event);
        if stop {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

impl Handler for RecordingHandler {
    fn entry(
        &mut self,
        offset: u64,
        address: u64,
        length: u64,
        version: u8,
        augmentation: &str,
        return_address: Register,
    ) -> ControlFlow<()> {
        let flow = self.record(Event::Entry {
            offset,
            address,
            length,
            version,
            augmentation: augmentation.to_string(),
            return_address,
        });
        if self.decline.contains(&address) {
            return ControlFlow::Break(());
        }
        flow
    }

    fn undefined_rule(&mut self, address: u64, register: Register) -> ControlFlow<()> {
        self.record(Event::Undefined { address, register })
    }

    fn same_value_rule(&mut self, address: u64, register: Register) -> ControlFlow<()> {
        self.record(Event::SameValue { address, register })
    }

    fn offset_rule(
        &mut self,
        address: u64,
        register: Register,
        base: Register,
        offset: i64,
    ) -> ControlFlow<()> {
        self.record(Event::Offset {
            address,
            register,
            base,
            offset,
        })
    }

    fn val_offset_rule(
        &mut self,
        address: u64,
        register: Register,
        base: Register,
        offset: i64,
    ) -> ControlFlow<()> {
        self.record(Event::ValOffset {
            address,
            register,
            base,
            offset,
        })
    }

    fn register_rule(
        &mut self,
        address: u64,
        register: Register,
        base: Register,
    ) -> ControlFlow<()> {
        self.record(Event::Register {
            address,
            register,
            base,
        })
    }

    fn expression_rule(
        &mut self,
        address: u64,
        register: Register,
        expression: &[u8],
    ) -> ControlFlow<()> {
        self.record(Event::Expression {
            address,
            register,
            expression: expression.to_vec(),
        })
    }

    fn val_expression_rule(
        &mut self,
        address: u64,
        register: Register,
        expression: &[u8],
    ) -> ControlFlow<()> {
        self.record(Event::ValExpression {
            address,
            register,
            expression: expression.to_vec(),
        })
    }

    fn end(&mut self) {
        self.events.push(Event::End);
    }

    fn personality_routine(&mut self, address: u64, indirect: bool) -> ControlFlow<()> {
        self.record(Event::PersonalityRoutine { address, indirect })
    }

    fn language_specific_data_area(&mut self, address: u64, indirect: bool) -> ControlFlow<()> {
        self.record(Event::LanguageSpecificDataArea { address, indirect })
    }

    fn signal_handler(&mut self) -> ControlFlow<()> {
        self.record(Event::SignalHandler)
    }
}

#[derive(Debug, Default)]
pub struct RecordingReporter {
    pub problems: Vec<Problem>,
}

impl Reporter for RecordingReporter {
    fn report(&mut self, problem: Problem) {
        self.problems.push(problem);
    }
}

/// What parsing `section` produced.
pub struct Parsed {
    pub events: Vec<Event>,
    pub problems: Vec<Problem>,
    pub outcome: Outcome,
}

pub fn parse_with(section: &[u8], config: Config, mut handler: RecordingHandler) -> Parsed {
    let mut reporter = RecordingReporter::default();
    let outcome = CallFrameInfo::new(section, config).parse(&mut handler, &mut reporter);
    Parsed {
        events: handler.events,
        problems: reporter.problems,
        outcome,
    }
}

pub fn parse(section: &[u8], config: Config) -> Parsed {
    parse_with(section, config, RecordingHandler::default())
}
