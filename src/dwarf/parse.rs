//! Implements parsing and processing of DWARF call frame information.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §6.4 Call Frame Information
//!
//! The CFI is a very large table of the following structure:
//! ```text
//! LOC CFA R0 R1 ... RN
//! L0
//! L1
//! ...
//! LN
//! ```
//!
//! The first column is the address for every location that contains code in a
//! program (a relative offset in shared object files). The remaining columns
//! contain unwinding rules that are associated with the indicated location.
//!
//! The CFA column defines the rule which computes the Canonical Frame Address
//! value; it may be either a register and a signed offset that are added
//! together, or a DWARF expression that is evaluated.
//!
//! The remaining columns describe register numbers that indicate whether a
//! register has been saved and the rule to find the value for the previous
//! frame.
//!
//! The table is never materialized. Each FDE describes the rows of one
//! function as a CIE's initial instructions followed by its own, and
//! [`CallFrameInfo::parse`] hands each FDE's rule changes to a [`Handler`] as
//! the instructions run.


use alloc::collections::BTreeMap;
use alloc::string::String;

use super::config::{AddressSize, Config, PointerBases};
use super::constants::{
    DEBUG_FRAME_CIE_ID_32, DEBUG_FRAME_CIE_ID_64, DWARF64_LENGTH_ESCAPE, EH_FRAME_CIE_ID,
};
use super::encoding::Encoding;
use super::error::{Error, Result};
use super::handler::{EntryKind, Handler, Register, Reporter};
use super::instructions::{DecodeContext, Instructions};
use super::interp::{stop_on_break, Program, State, Stop};
use super::reader::{read_encoded, Cursor};

/// Common Information Entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cie<'a> {
    /// Section offset of the entry's length field.
    pub offset: u64,
    /// 1 for `.eh_frame` and DWARF 2, 3 for DWARF 3, 4 for DWARF 4 and 5.
    pub version: u8,
    /// A null-terminated UTF-8 string that identifies the augmentation to this
    /// CIE or to the FDEs that use it. If a reader encounters an
    /// augmentation string that is unexpected, then only the following
    /// fields can be read:
    /// - CIE: length, CIE_id, version, augmentation
    /// - FDE: length, CIE_pointer, initial_location, address_range
    ///
    /// If there is no augmentation, this value is a zero byte.
    ///
    /// The augmentation string allows users to indicate that there is
    /// additional target-specific information in the CIE or FDE which is
    /// needed to virtually unwind a stack frame. For example, this might be
    /// information about dynamically allocated data which needs to be freed
    /// on exit from the routine.
    pub augmentation_string: &'a str,
    /// Present for augmentation strings starting with `z`.
    pub augmentation: Option<AugmentationData>,
    /// The size of a segment selector in this CIE and its FDEs. Only version 4
    /// CIEs can have one.
    pub segment_selector_size: u8,
    /// A constant that is factored out of all advance location instructions.
    /// The resulting value is (operand * code_alignment_factor).
    pub code_alignment_factor: u64,
    /// A constant that is factored out of certain offset instructions. The
    /// resulting value is (operand * data_alignment_factor).
    pub data_alignment_factor: i64,
    /// An unsigned LEB128 constant that indicates which column in the rule
    /// table represents the return address of the function. Note that this
    /// column might not correspond to an actual machine register.
    pub return_address_register: Register,
    /// A sequence of rules that are interpreted to create the initial setting
    /// of each column in the table.
    pub initial_instructions: Cursor<'a>,
}

impl Cie<'_> {
    /// How addresses in FDEs citing this CIE are encoded.
    pub fn pointer_encoding(&self) -> Encoding {
        self.augmentation
            .map_or(Encoding::ABSPTR, |augmentation| augmentation.pointer_encoding)
    }
}

/// A decoded pointer and whether it points at the real value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pointer {
    pub address: u64,
    pub indirect: bool,
}

/// The contents of a CIE's `z` augmentation data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AugmentationData {
    /// `L`: how the LSDA pointer in each FDE's augmentation data is encoded.
    pub lsda_pointer_encoding: Option<Encoding>,
    /// `R`: how the FDE's addresses are encoded. Absolute without `R`.
    pub pointer_encoding: Encoding,
    /// `P`: the personality routine.
    pub personality: Option<Pointer>,
    /// `S`: the FDEs describe signal handler trampolines.
    pub signal_frame: bool,
}

/// Frame Description Entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fde<'a> {
    /// Section offset of the entry's length field.
    pub offset: u64,
    /// Section offset of the CIE this FDE cites.
    pub cie_offset: u64,
    /// The address of the first location associated with this table entry.
    pub initial_location: u64,
    /// The number of bytes of program instructions described by this entry.
    pub address_range: u64,
    /// From the augmentation data, if the CIE has an `L` augmentation.
    pub lsda: Option<Pointer>,
    /// A sequence of table defining instructions.
    pub instructions: Cursor<'a>,
    /// The bases in effect for this FDE, with the function base set to
    /// `initial_location`.
    pub bases: PointerBases,
}

/// How a parse went.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// FDEs whose instructions were all delivered to the handler.
    pub delivered: usize,
    /// Entries that were skipped or cut short because of bad data, or because
    /// the handler stopped them.
    pub failed: usize,
    /// An entry's extent could not be determined and the rest of the section
    /// was not looked at.
    pub truncated: bool,
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        self.failed == 0 && !self.truncated
    }
}

/// The fields every entry starts with.
#[derive(Debug, Clone, Copy)]
struct Prologue {
    offset: u64,
    kind: EntryKind,
    /// Section offset of the CIE, for FDEs.
    cie_offset: u64,
    /// The remaining fields, up to the end of the entry.
    fields: usize,
    end: usize,
}

enum Delivery {
    Delivered,
    Declined,
    Failed,
}

/// What was found at a CIE offset, remembered for every FDE that cites it.
#[derive(Debug, Clone, Copy, PartialEq)]
enum CachedCie<'a> {
    Cie(Cie<'a>),
    /// The offset holds some other kind of entry. Each FDE citing it is
    /// reported.
    NotACie,
    /// The CIE is bad. Reported once, when it was read.
    Unusable,
}

/// A `.debug_frame` or `.eh_frame` section.
#[derive(Debug, Clone)]
pub struct CallFrameInfo<'a> {
    section: &'a [u8],
    config: Config,
}

impl<'a> CallFrameInfo<'a> {
    pub fn new(section: &'a [u8], config: Config) -> Self {
        Self { section, config }
    }

    fn cursor(&self) -> Cursor<'a> {
        Cursor::new(self.section, self.config.endianness)
    }

    /// Walk the section, handing every FDE to `handler`.
    ///
    /// CIEs are only read when an FDE cites them. Problems go to `reporter`.
    /// Entries with bad data are skipped, unless their length is unusable, in
    /// which case nothing after them can be found and the parse stops.
    #[instrument(skip_all, fields(len = self.section.len(), section = ?self.config.section))]
    pub fn parse<H, R>(&self, handler: &mut H, reporter: &mut R) -> Outcome
    where
        H: Handler + ?Sized,
        R: Reporter + ?Sized,
    {
        let mut outcome = Outcome::default();
        let mut cies = BTreeMap::new();
        let mut offset = 0;

        while offset < self.section.len() {
            let entry = match self.read_prologue(offset, reporter) {
                Ok(entry) => entry,
                Err(Some(end)) => {
                    outcome.failed += 1;
                    offset = end;
                    continue;
                }
                Err(None) => {
                    outcome.truncated = true;
                    break;
                }
            };
            offset = entry.end;

            match entry.kind {
                EntryKind::Fde => {}
                EntryKind::Terminator => {
                    if entry.end < self.section.len() {
                        reporter.early_eh_terminator(entry.offset);
                    }
                    break;
                }
                EntryKind::Cie | EntryKind::Unknown => continue,
            }

            match self.process_fde(&entry, &mut cies, handler, reporter) {
                Delivery::Delivered => outcome.delivered += 1,
                Delivery::Declined => {}
                Delivery::Failed => outcome.failed += 1,
            }
        }

        debug!(?outcome, "parsed call frame information");
        outcome
    }

    /// Reads the length and id of the entry at `offset`.
    ///
    /// On failure, returns where the entry ends if that is known.
    fn read_prologue<R: Reporter + ?Sized>(
        &self,
        offset: usize,
        reporter: &mut R,
    ) -> core::result::Result<Prologue, Option<usize>> {
        let mut data = self.cursor().range(offset, self.section.len()).map_err(|_| None)?;
        let incomplete = |reporter: &mut R| reporter.incomplete(offset as u64, EntryKind::Unknown);

        let (length, offset_size) = match data.read_u32() {
            Ok(DWARF64_LENGTH_ESCAPE) => match data.read_u64() {
                Ok(length) => (length, 8),
                Err(_) => {
                    incomplete(reporter);
                    return Err(None);
                }
            },
            Ok(length) => (u64::from(length), 4),
            Err(_) => {
                incomplete(reporter);
                return Err(None);
            }
        };

        if length == 0 && self.config.is_eh_frame() {
            return Ok(Prologue {
                offset: offset as u64,
                kind: EntryKind::Terminator,
                cie_offset: 0,
                fields: data.offset(),
                end: data.offset(),
            });
        }

        let Ok(mut data) = usize::try_from(length)
            .map_err(|_| Error::UnexpectedEnd)
            .and_then(|length| data.limit(length))
        else {
            incomplete(reporter);
            return Err(None);
        };
        let end = data.end();

        let id_position = data.offset() as u64;
        let Ok(id) = data.read_unsigned(offset_size) else {
            incomplete(reporter);
            return Err(Some(end));
        };

        let (kind, cie_offset) = if self.config.is_eh_frame() {
            if id == EH_FRAME_CIE_ID {
                (EntryKind::Cie, 0)
            } else {
                // Relative to the id field. Pointers before the section start
                // wrap around and are caught as out of range.
                (EntryKind::Fde, id_position.wrapping_sub(id))
            }
        } else {
            let cie_id = if offset_size == 4 {
                DEBUG_FRAME_CIE_ID_32
            } else {
                DEBUG_FRAME_CIE_ID_64
            };
            if id == cie_id {
                (EntryKind::Cie, 0)
            } else {
                (EntryKind::Fde, id)
            }
        };

        Ok(Prologue {
            offset: offset as u64,
            kind,
            cie_offset,
            fields: data.offset(),
            end,
        })
    }

    #[instrument(skip(self, entry, cies, handler, reporter), fields(offset = entry.offset))]
    fn process_fde<H, R>(
        &self,
        entry: &Prologue,
        cies: &mut BTreeMap<u64, CachedCie<'a>>,
        handler: &mut H,
        reporter: &mut R,
    ) -> Delivery
    where
        H: Handler + ?Sized,
        R: Reporter + ?Sized,
    {
        let cie_offset = entry.cie_offset;
        if cie_offset >= self.section.len() as u64 {
            reporter.cie_pointer_out_of_range(entry.offset, cie_offset);
            return Delivery::Failed;
        }
        if self.config.is_eh_frame() && cie_offset > entry.offset {
            if let Some(terminator) = self.terminator_between(entry.end, cie_offset as usize) {
                reporter.early_eh_terminator(terminator);
                return Delivery::Failed;
            }
        }

        let cached = *cies
            .entry(cie_offset)
            .or_insert_with(|| self.load_cie(cie_offset, reporter));
        let cie = match cached {
            CachedCie::Cie(cie) => cie,
            CachedCie::NotACie => {
                reporter.bad_cie_id(entry.offset, cie_offset);
                return Delivery::Failed;
            }
            CachedCie::Unusable => {
                debug!("skipping FDE, its CIE at {cie_offset:#x} is unusable");
                return Delivery::Failed;
            }
        };

        let Some(fde) = self.read_fde_fields(entry, &cie, reporter) else {
            return Delivery::Failed;
        };
        trace!("{fde:x?}");

        if handler
            .entry(
                fde.offset,
                fde.initial_location,
                fde.address_range,
                cie.version,
                cie.augmentation_string,
                cie.return_address_register,
            )
            .is_break()
        {
            debug!("handler declined FDE");
            return Delivery::Declined;
        }

        let result = self.deliver(&cie, &fde, handler, reporter);
        handler.end();

        match result {
            Ok(()) => Delivery::Delivered,
            Err(stop) => {
                debug!(?stop, "FDE cut short");
                Delivery::Failed
            }
        }
    }

    /// Everything between `Entry` and `End`.
    fn deliver<H, R>(
        &self,
        cie: &Cie<'a>,
        fde: &Fde<'a>,
        handler: &mut H,
        reporter: &mut R,
    ) -> core::result::Result<(), Stop>
    where
        H: Handler + ?Sized,
        R: Reporter + ?Sized,
    {
        if let Some(augmentation) = cie.augmentation {
            if let Some(personality) = augmentation.personality {
                stop_on_break(handler.personality_routine(personality.address, personality.indirect))?;
            }
            if let Some(lsda) = fde.lsda {
                stop_on_break(handler.language_specific_data_area(lsda.address, lsda.indirect))?;
            }
            if augmentation.signal_frame {
                stop_on_break(handler.signal_handler())?;
            }
        }

        let context = DecodeContext {
            pointer_encoding: cie.pointer_encoding(),
            address_size: self.config.address_size,
            bases: fde.bases,
        };
        let mut state = State::new(
            handler,
            reporter,
            fde.initial_location,
            self.config.address_size,
        );
        state.interpret_cie(Program {
            entry_offset: cie.offset,
            cie_offset: cie.offset,
            kind: EntryKind::Cie,
            instructions: Instructions::new(cie.initial_instructions, context),
            code_alignment_factor: cie.code_alignment_factor,
            data_alignment_factor: cie.data_alignment_factor,
        })?;
        state.interpret_fde(Program {
            entry_offset: fde.offset,
            cie_offset: cie.offset,
            kind: EntryKind::Fde,
            instructions: Instructions::new(fde.instructions, context),
            code_alignment_factor: cie.code_alignment_factor,
            data_alignment_factor: cie.data_alignment_factor,
        })
    }

    /// Finds a terminator among the entries in `start..end`. Entries that
    /// can't be framed end the search.
    fn terminator_between(&self, start: usize, end: usize) -> Option<u64> {
        let mut offset = start;
        while offset < end {
            let mut data = self.cursor().range(offset, self.section.len()).ok()?;
            let length = match data.read_u32().ok()? {
                DWARF64_LENGTH_ESCAPE => data.read_u64().ok()?,
                length => u64::from(length),
            };
            if length == 0 {
                return Some(offset as u64);
            }
            offset = data
                .offset()
                .checked_add(usize::try_from(length).ok()?)?;
        }
        None
    }

    /// Reads and checks the CIE an FDE cites. Problems with the CIE are
    /// reported against it. A reference to something that isn't a CIE is left
    /// for the caller to report against the FDE.
    #[instrument(skip(self, reporter))]
    fn load_cie<R: Reporter + ?Sized>(&self, cie_offset: u64, reporter: &mut R) -> CachedCie<'a> {
        let Ok(entry) = self.read_prologue(cie_offset as usize, reporter) else {
            return CachedCie::Unusable;
        };
        if entry.kind != EntryKind::Cie {
            return CachedCie::NotACie;
        }
        match self.read_cie_fields(&entry, reporter) {
            Some(cie) => {
                trace!("{cie:x?}");
                CachedCie::Cie(cie)
            }
            None => CachedCie::Unusable,
        }
    }

    fn read_cie_fields<R: Reporter + ?Sized>(
        &self,
        entry: &Prologue,
        reporter: &mut R,
    ) -> Option<Cie<'a>> {
        let offset = entry.offset;
        let incomplete = |reporter: &mut R| {
            reporter.incomplete(offset, EntryKind::Cie);
            None
        };
        let Ok(mut data) = self.cursor().range(entry.fields, entry.end) else {
            return incomplete(reporter);
        };

        let Ok(version) = data.read_u8() else {
            return incomplete(reporter);
        };
        if !(1..=4).contains(&version) {
            reporter.unrecognized_version(offset, version);
            return None;
        }

        let Ok(augmentation_string) = data.read_cstr() else {
            return incomplete(reporter);
        };
        let Ok(augmentation_string) = core::str::from_utf8(augmentation_string) else {
            let lossy = String::from_utf8_lossy(augmentation_string);
            reporter.unrecognized_augmentation(offset, &lossy);
            return None;
        };
        let z_augmentation = match augmentation_string.as_bytes().first() {
            None => false,
            Some(b'z') => true,
            Some(_) => {
                reporter.unrecognized_augmentation(offset, augmentation_string);
                return None;
            }
        };

        let segment_selector_size = if version == 4 {
            // The address size comes from the configuration.
            let (Ok(_), Ok(segment_selector_size)) = (data.read_u8(), data.read_u8()) else {
                return incomplete(reporter);
            };
            segment_selector_size
        } else {
            0
        };
        let Ok(code_alignment_factor) = data.read_uleb128() else {
            return incomplete(reporter);
        };
        let Ok(data_alignment_factor) = data.read_sleb128() else {
            return incomplete(reporter);
        };
        let return_address_register = if version == 1 {
            data.read_u8().map(Register::from)
        } else {
            data.read_uleb128()
        };
        let Ok(return_address_register) = return_address_register else {
            return incomplete(reporter);
        };

        let augmentation = if z_augmentation {
            let augmentation_data = data
                .split_block()
                .and_then(|block| self.parse_augmentation_data(augmentation_string, block));
            match augmentation_data {
                Ok(augmentation) => Some(augmentation),
                Err(Error::BadAugmentation(_)) => {
                    reporter.unrecognized_augmentation(offset, augmentation_string);
                    return None;
                }
                Err(Error::InvalidEncoding(encoding)) => {
                    reporter.invalid_pointer_encoding(offset, encoding);
                    return None;
                }
                Err(Error::UnusableEncoding(encoding)) => {
                    reporter.unusable_pointer_encoding(offset, encoding);
                    return None;
                }
                Err(Error::UnexpectedEnd | Error::BadInstruction(_)) => {
                    return incomplete(reporter);
                }
            }
        } else {
            None
        };

        Some(Cie {
            offset,
            version,
            augmentation_string,
            augmentation,
            segment_selector_size,
            code_alignment_factor,
            data_alignment_factor,
            return_address_register,
            initial_instructions: data,
        })
    }

    /// Walks the augmentation string after the `z`, taking each letter's
    /// operands from `data` in order.
    fn parse_augmentation_data(&self, string: &str, mut data: Cursor<'a>) -> Result<AugmentationData> {
        trace!("aug data {:?} | {} bytes", string, data.remaining());

        let mut aug_data = AugmentationData {
            lsda_pointer_encoding: None,
            pointer_encoding: Encoding::ABSPTR,
            personality: None,
            signal_frame: false,
        };

        for code in string.bytes().skip(1) {
            match code {
                // If present, it indicates the presence of one argument in the Augmentation Data of the
                // CIE, and a corresponding argument in the Augmentation Data of the FDE.
                // The argument in the Augmentation Data of the CIE is 1-byte and represents the pointer
                // encoding used for the argument in the Augmentation Data of the FDE, which
                // is the address of a language-specific data area (LSDA). The size of the
                // LSDA pointer is specified by the pointer encoding used.
                b'L' => {
                    let encoding = Encoding(data.read_u8()?);
                    if !encoding.is_valid() {
                        return Err(Error::InvalidEncoding(encoding.0));
                    }
                    aug_data.lsda_pointer_encoding = (!encoding.is_omit()).then_some(encoding);
                }
                // If present, it indicates the presence of two arguments in the Augmentation Data of
                // the CIE. The first argument is 1-byte and represents the pointer encoding
                // used for the second argument, which is the address of a personality
                // routine handler. The size of the personality routine pointer is specified
                // by the pointer encoding used.
                b'P' => {
                    let encoding = Encoding(data.read_u8()?);
                    if !encoding.is_omit() {
                        let address = read_encoded(
                            &mut data,
                            encoding,
                            self.config.address_size,
                            &self.config.bases,
                        )?;
                        aug_data.personality = Some(Pointer {
                            address,
                            indirect: encoding.is_indirect(),
                        });
                    }
                }
                // If present, The Augmentation Data shall include a 1 byte argument that represents the
                // pointer encoding for the address pointers used in the FDE.
                b'R' => {
                    let encoding = Encoding(data.read_u8()?);
                    if encoding.is_omit() || !encoding.is_valid() {
                        return Err(Error::InvalidEncoding(encoding.0));
                    }
                    if !self.config.bases.is_usable(encoding) {
                        return Err(Error::UnusableEncoding(encoding.0));
                    }
                    aug_data.pointer_encoding = encoding;
                }
                // The FDEs using this CIE describe signal trampolines.
                b'S' => aug_data.signal_frame = true,
                _ => return Err(Error::BadAugmentation(code)),
            }
        }

        Ok(aug_data)
    }

    fn read_fde_fields<R: Reporter + ?Sized>(
        &self,
        entry: &Prologue,
        cie: &Cie<'a>,
        reporter: &mut R,
    ) -> Option<Fde<'a>> {
        let address_size = self.config.address_size;
        let mut bases = self.config.bases;
        let Ok(mut data) = self.cursor().range(entry.fields, entry.end) else {
            reporter.incomplete(entry.offset, EntryKind::Fde);
            return None;
        };

        let header = read_fde_addresses(&mut data, cie, address_size, &mut bases);
        let (initial_location, address_range) = match header {
            Ok(header) => header,
            Err(err) => {
                report_header_error(reporter, entry.offset, cie.offset, err);
                return None;
            }
        };

        let mut lsda = None;
        if let Some(augmentation) = cie.augmentation {
            let Ok(mut augmentation_data) = data.split_block() else {
                reporter.incomplete(entry.offset, EntryKind::Fde);
                return None;
            };
            if let Some(encoding) = augmentation.lsda_pointer_encoding {
                // Only checked now: a function relative pointer needs the
                // FDE's address as its base.
                match read_encoded(&mut augmentation_data, encoding, address_size, &bases) {
                    Ok(address) => {
                        lsda = Some(Pointer {
                            address,
                            indirect: encoding.is_indirect(),
                        })
                    }
                    Err(err) => {
                        report_header_error(reporter, entry.offset, cie.offset, err);
                        return None;
                    }
                }
            }
        }

        Some(Fde {
            offset: entry.offset,
            cie_offset: cie.offset,
            initial_location,
            address_range,
            lsda,
            instructions: data,
            bases,
        })
    }
}

fn report_header_error<R: Reporter + ?Sized>(
    reporter: &mut R,
    fde_offset: u64,
    cie_offset: u64,
    err: Error,
) {
    match err {
        Error::InvalidEncoding(encoding) => reporter.invalid_pointer_encoding(cie_offset, encoding),
        Error::UnusableEncoding(encoding) => {
            reporter.unusable_pointer_encoding(cie_offset, encoding)
        }
        Error::UnexpectedEnd | Error::BadInstruction(_) | Error::BadAugmentation(_) => {
            reporter.incomplete(fde_offset, EntryKind::Fde)
        }
    }
}

/// The FDE's initial location and address range. The function base is set
/// as soon as the initial location is known.
fn read_fde_addresses(
    data: &mut Cursor<'_>,
    cie: &Cie<'_>,
    address_size: AddressSize,
    bases: &mut PointerBases,
) -> Result<(u64, u64)> {
    let encoding = cie.pointer_encoding();
    data.skip(usize::from(cie.segment_selector_size))?;
    let initial_location = read_encoded(data, encoding, address_size, bases)?;
    *bases = bases.with_function(initial_location);
    // A length, so never relative to anything.
    let address_range = read_encoded(data, encoding.without_application(), address_size, bases)?;
    Ok((initial_location, address_range))
}
