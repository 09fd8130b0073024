//! Numeric values of the call frame information wire format.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §7.24 Call Frame Information
//! and the Linux Standard Base Core Specification, §10.5 DWARF Extensions.
#![allow(non_upper_case_globals)]

/// The initial length field holds this value if the entry uses the 64-bit
/// DWARF format. The real length follows as an 8 byte value.
pub const DWARF64_LENGTH_ESCAPE: u32 = 0xffff_ffff;

/// The CIE id of a `.debug_frame` CIE in the 32-bit format.
pub const DEBUG_FRAME_CIE_ID_32: u64 = 0xffff_ffff;
/// The CIE id of a `.debug_frame` CIE in the 64-bit format.
pub const DEBUG_FRAME_CIE_ID_64: u64 = 0xffff_ffff_ffff_ffff;
/// In `.eh_frame`, a CIE pointer of zero marks the entry as a CIE.
pub const EH_FRAME_CIE_ID: u64 = 0;

// The packed forms keep their opcode in the high two bits.
pub const DW_CFA_advance_loc: u8 = 0x40;
pub const DW_CFA_offset: u8 = 0x80;
pub const DW_CFA_restore: u8 = 0xc0;

pub const DW_CFA_nop: u8 = 0x00;
pub const DW_CFA_set_loc: u8 = 0x01;
pub const DW_CFA_advance_loc1: u8 = 0x02;
pub const DW_CFA_advance_loc2: u8 = 0x03;
pub const DW_CFA_advance_loc4: u8 = 0x04;
pub const DW_CFA_offset_extended: u8 = 0x05;
pub const DW_CFA_restore_extended: u8 = 0x06;
pub const DW_CFA_undefined: u8 = 0x07;
pub const DW_CFA_same_value: u8 = 0x08;
pub const DW_CFA_register: u8 = 0x09;
pub const DW_CFA_remember_state: u8 = 0x0a;
pub const DW_CFA_restore_state: u8 = 0x0b;
pub const DW_CFA_def_cfa: u8 = 0x0c;
pub const DW_CFA_def_cfa_register: u8 = 0x0d;
pub const DW_CFA_def_cfa_offset: u8 = 0x0e;
pub const DW_CFA_def_cfa_expression: u8 = 0x0f;
pub const DW_CFA_expression: u8 = 0x10;
pub const DW_CFA_offset_extended_sf: u8 = 0x11;
pub const DW_CFA_def_cfa_sf: u8 = 0x12;
pub const DW_CFA_def_cfa_offset_sf: u8 = 0x13;
pub const DW_CFA_val_offset: u8 = 0x14;
pub const DW_CFA_val_offset_sf: u8 = 0x15;
pub const DW_CFA_val_expression: u8 = 0x16;

// Vendor extensions.
pub const DW_CFA_MIPS_advance_loc8: u8 = 0x1d;
pub const DW_CFA_GNU_window_save: u8 = 0x2d;
pub const DW_CFA_GNU_args_size: u8 = 0x2e;
pub const DW_CFA_GNU_negative_offset_extended: u8 = 0x2f;

pub const DW_EH_PE_absptr: u8 = 0x00;
pub const DW_EH_PE_uleb128: u8 = 0x01;
pub const DW_EH_PE_udata2: u8 = 0x02;
pub const DW_EH_PE_udata4: u8 = 0x03;
pub const DW_EH_PE_udata8: u8 = 0x04;
pub const DW_EH_PE_signed: u8 = 0x08;
pub const DW_EH_PE_sleb128: u8 = 0x09;
pub const DW_EH_PE_sdata2: u8 = 0x0a;
pub const DW_EH_PE_sdata4: u8 = 0x0b;
pub const DW_EH_PE_sdata8: u8 = 0x0c;

pub const DW_EH_PE_pcrel: u8 = 0x10;
pub const DW_EH_PE_textrel: u8 = 0x20;
pub const DW_EH_PE_datarel: u8 = 0x30;
pub const DW_EH_PE_funcrel: u8 = 0x40;
pub const DW_EH_PE_aligned: u8 = 0x50;

pub const DW_EH_PE_indirect: u8 = 0x80;
pub const DW_EH_PE_omit: u8 = 0xff;
