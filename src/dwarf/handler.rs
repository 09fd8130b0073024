//! The interfaces the parser reports to: a [`Handler`] receives the rules, a
//! [`Reporter`] receives complaints about malformed data.

use alloc::string::{String, ToString};
use core::fmt;
use core::ops::ControlFlow;

/// A DWARF register number. Which machine register it denotes is up to the
/// architecture's ABI.
pub type Register = u64;

/// The register number the CFA's own rule is reported under. It is also a
/// valid LEB128 register number, so callers must treat it as reserved.
pub const CFA_REGISTER: Register = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Not yet known, the entry is too short to say.
    Unknown,
    Cie,
    Fde,
    /// A zero length that ends an `.eh_frame` section.
    Terminator,
}

impl EntryKind {
    pub fn name(self) -> &'static str {
        match self {
            EntryKind::Unknown => "entry",
            EntryKind::Cie => "common information entry",
            EntryKind::Fde => "frame description entry",
            EntryKind::Terminator => ".eh_frame sequence terminator",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Receives the contents of each frame description entry.
///
/// Every method returns whether to go on. [`ControlFlow::Break`] from
/// [`Handler::entry`] skips the entry; anywhere else it stops the entry where
/// it is, and [`Handler::end`] is still called.
///
/// Rule callbacks arrive in address order. Each one says that from `address`
/// on, the rule for `register` is the given one, until the next callback for
/// the same register.
pub trait Handler {
    /// A new FDE covering `length` bytes of code starting at `address`. The
    /// remaining values are taken from its CIE.
    fn entry(
        &mut self,
        offset: u64,
        address: u64,
        length: u64,
        version: u8,
        augmentation: &str,
        return_address: Register,
    ) -> ControlFlow<()>;

    /// The caller's value of the register cannot be recovered.
    fn undefined_rule(&mut self, address: u64, register: Register) -> ControlFlow<()>;

    /// The register still holds the caller's value.
    fn same_value_rule(&mut self, address: u64, register: Register) -> ControlFlow<()>;

    /// The caller's value is saved at `base + offset`.
    fn offset_rule(
        &mut self,
        address: u64,
        register: Register,
        base: Register,
        offset: i64,
    ) -> ControlFlow<()>;

    /// The caller's value is `base + offset` itself.
    fn val_offset_rule(
        &mut self,
        address: u64,
        register: Register,
        base: Register,
        offset: i64,
    ) -> ControlFlow<()>;

    /// The caller's value is in `base`.
    fn register_rule(&mut self, address: u64, register: Register, base: Register)
        -> ControlFlow<()>;

    /// The caller's value is saved at the address `expression` computes.
    fn expression_rule(
        &mut self,
        address: u64,
        register: Register,
        expression: &[u8],
    ) -> ControlFlow<()>;

    /// The caller's value is the value `expression` computes.
    fn val_expression_rule(
        &mut self,
        address: u64,
        register: Register,
        expression: &[u8],
    ) -> ControlFlow<()>;

    /// The entry is done. Called once for every accepted [`Handler::entry`].
    fn end(&mut self);

    fn personality_routine(&mut self, _address: u64, _indirect: bool) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    fn language_specific_data_area(&mut self, _address: u64, _indirect: bool) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// The frame is a signal handler trampoline.
    fn signal_handler(&mut self) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

/// Something wrong with the data. Offsets are section offsets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Problem {
    #[error("CFI {kind} at offset {offset:#x}: entry ends early")]
    Incomplete { offset: u64, kind: EntryKind },
    #[error("CFI at offset {offset:#x}: saw end-of-data marker before end of section contents")]
    EarlyEHTerminator { offset: u64 },
    #[error(
        "CFI frame description entry at offset {offset:#x}: CIE pointer is out of range: {cie_offset:#x}"
    )]
    CIEPointerOutOfRange { offset: u64, cie_offset: u64 },
    #[error(
        "CFI frame description entry at offset {offset:#x}: CIE pointer does not point to a CIE: {cie_offset:#x}"
    )]
    BadCIEId { offset: u64, cie_offset: u64 },
    #[error("CFI common information entry at offset {offset:#x}: unrecognized version: {version}")]
    UnrecognizedVersion { offset: u64, version: u8 },
    #[error(
        "CFI common information entry at offset {offset:#x}: unrecognized augmentation: '{augmentation}'"
    )]
    UnrecognizedAugmentation { offset: u64, augmentation: String },
    #[error(
        "CFI common information entry at offset {offset:#x}: 'z' augmentation specifies invalid pointer encoding: {encoding:#04x}"
    )]
    InvalidPointerEncoding { offset: u64, encoding: u8 },
    #[error(
        "CFI common information entry at offset {offset:#x}: 'z' augmentation specifies a pointer encoding for which we have no base address: {encoding:#04x}"
    )]
    UnusablePointerEncoding { offset: u64, encoding: u8 },
    #[error(
        "CFI common information entry at offset {offset:#x}: the DW_CFA_restore instruction at offset {insn_offset:#x} cannot be used in a common information entry"
    )]
    RestoreInCIE { offset: u64, insn_offset: u64 },
    #[error("CFI {kind} at offset {offset:#x}: the instruction at offset {insn_offset:#x} is unrecognized")]
    BadInstruction {
        offset: u64,
        kind: EntryKind,
        insn_offset: u64,
    },
    #[error(
        "CFI {kind} at offset {offset:#x}: the instruction at offset {insn_offset:#x} assumes that a CFA rule has been set, but none has been set"
    )]
    NoCFARule {
        offset: u64,
        kind: EntryKind,
        insn_offset: u64,
    },
    #[error(
        "CFI {kind} at offset {offset:#x}: the DW_CFA_restore_state instruction at offset {insn_offset:#x} should pop a saved state from the stack, but the stack is empty"
    )]
    EmptyStateStack {
        offset: u64,
        kind: EntryKind,
        insn_offset: u64,
    },
    #[error(
        "CFI {kind} at offset {offset:#x}: the DW_CFA_restore_state instruction at offset {insn_offset:#x} would clear the CFA rule in effect"
    )]
    ClearingCFARule {
        offset: u64,
        kind: EntryKind,
        insn_offset: u64,
    },
}

/// Receives complaints about the data. Reporting never stops the parse;
/// the parser decides how much of the section to give up on.
///
/// Implementors only need [`Reporter::report`]. The per-condition methods
/// exist so a reporter can treat some conditions specially.
pub trait Reporter {
    fn report(&mut self, problem: Problem);

    fn incomplete(&mut self, offset: u64, kind: EntryKind) {
        self.report(Problem::Incomplete { offset, kind });
    }

    fn early_eh_terminator(&mut self, offset: u64) {
        self.report(Problem::EarlyEHTerminator { offset });
    }

    fn cie_pointer_out_of_range(&mut self, offset: u64, cie_offset: u64) {
        self.report(Problem::CIEPointerOutOfRange { offset, cie_offset });
    }

    fn bad_cie_id(&mut self, offset: u64, cie_offset: u64) {
        self.report(Problem::BadCIEId { offset, cie_offset });
    }

    fn unrecognized_version(&mut self, offset: u64, version: u8) {
        self.report(Problem::UnrecognizedVersion { offset, version });
    }

    fn unrecognized_augmentation(&mut self, offset: u64, augmentation: &str) {
        self.report(Problem::UnrecognizedAugmentation {
            offset,
            augmentation: augmentation.to_string(),
        });
    }

    fn invalid_pointer_encoding(&mut self, offset: u64, encoding: u8) {
        self.report(Problem::InvalidPointerEncoding { offset, encoding });
    }

    fn unusable_pointer_encoding(&mut self, offset: u64, encoding: u8) {
        self.report(Problem::UnusablePointerEncoding { offset, encoding });
    }

    fn restore_in_cie(&mut self, offset: u64, insn_offset: u64) {
        self.report(Problem::RestoreInCIE {
            offset,
            insn_offset,
        });
    }

    fn bad_instruction(&mut self, offset: u64, kind: EntryKind, insn_offset: u64) {
        self.report(Problem::BadInstruction {
            offset,
            kind,
            insn_offset,
        });
    }

    fn no_cfa_rule(&mut self, offset: u64, kind: EntryKind, insn_offset: u64) {
        self.report(Problem::NoCFARule {
            offset,
            kind,
            insn_offset,
        });
    }

    fn empty_state_stack(&mut self, offset: u64, kind: EntryKind, insn_offset: u64) {
        self.report(Problem::EmptyStateStack {
            offset,
            kind,
            insn_offset,
        });
    }

    fn clearing_cfa_rule(&mut self, offset: u64, kind: EntryKind, insn_offset: u64) {
        self.report(Problem::ClearingCFARule {
            offset,
            kind,
            insn_offset,
        });
    }
}

/// Logs every problem as a `tracing` warning.
#[derive(Debug, Clone)]
pub struct TracingReporter<'a> {
    filename: &'a str,
    section: &'a str,
}

impl<'a> TracingReporter<'a> {
    pub fn new(filename: &'a str, section: &'a str) -> Self {
        Self { filename, section }
    }
}

impl Reporter for TracingReporter<'_> {
    fn report(&mut self, problem: Problem) {
        warn!(file = self.filename, section = self.section, "{problem}");
    }
}
