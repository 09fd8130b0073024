//! DWARF call frame information.
//!
//! The section is handed over as a byte slice that is already in memory.
//! Finding it in an object file is up to the caller, and so is unwinding:
//! this only tells a [`Handler`] which rules recover the caller's registers at
//! which addresses. See https://dwarfstd.org/doc/DWARF5.pdf §6.4 for the
//! format and the Linux Standard Base Core Specification for the `.eh_frame`
//! flavour of it.
//!
//! Expressions in rules are passed on as raw bytes, never evaluated.

pub mod config;
pub mod constants;
pub mod encoding;
mod error;
pub mod handler;
pub mod instructions;
mod interp;
pub mod parse;
pub mod reader;
pub mod rules;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{AddressSize, Config, PointerBases, SectionKind};
pub use encoding::Encoding;
pub use error::Error;
pub use handler::{
    EntryKind, Handler, Problem, Register, Reporter, TracingReporter, CFA_REGISTER,
};
pub use parse::{AugmentationData, CallFrameInfo, Cie, Fde, Outcome, Pointer};
pub use reader::{Cursor, Endianness};
pub use rules::Rule;
