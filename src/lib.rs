//! A parser and interpreter for DWARF call frame information, as found in the
//! `.debug_frame` and `.eh_frame` sections of object files.
//!
//! See [`dwarf::CallFrameInfo`] for the entry point.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate tracing;

pub mod dwarf;

pub use dwarf::{
    AddressSize, CallFrameInfo, Config, Endianness, EntryKind, Handler, Outcome, Problem,
    Register, Reporter, SectionKind, TracingReporter, CFA_REGISTER,
};
