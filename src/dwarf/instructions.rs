//! Decoding of the call frame instruction byte code.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §6.4.2 Call Frame Instructions
//!
//! Operands are kept as they appear in the stream. Factoring by the CIE's
//! alignment factors is left to the interpreter.

use super::config::{AddressSize, PointerBases};
use super::constants::*;
use super::encoding::Encoding;
use super::error::{Error, Result};
use super::handler::Register;
use super::reader::{read_encoded, Cursor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction<'a> {
    //-------- 6.4.2.1 Row Creation Instructions
    //
    /// The DW_CFA_set_loc instruction takes a single operand that represents a
    /// target address. The required action is to create a new table row using
    /// the specified address as the location. All other values in the new
    /// row are initially identical to the current row.
    ///
    /// The operand is read with the CIE's FDE pointer encoding.
    SetLoc(u64),
    /// The DW_CFA_advance_loc instruction takes a single operand (encoded with
    /// the opcode) that represents a constant delta. The required action is to
    /// create a new table row with a location value that is computed by
    /// taking the current entry’s location value and adding the value of
    /// delta * code_alignment_factor. All other values in the new row are
    /// initially identical to the current row
    AdvanceLoc(u8),
    /// Identical to DW_CFA_advance_loc except for the encoding and size of the
    /// delta operand, a ubyte.
    AdvanceLoc1(u8),
    /// Identical to DW_CFA_advance_loc except for the encoding and size of the
    /// delta operand, a uhalf.
    AdvanceLoc2(u16),
    /// Identical to DW_CFA_advance_loc except for the encoding and size of the
    /// delta operand, a uword.
    AdvanceLoc4(u32),
    /// MIPS extension with an 8 byte delta.
    MipsAdvanceLoc8(u64),
    //
    //-------- 6.4.2.2 CFA Definition Instructions
    //
    /// The DW_CFA_def_cfa instruction takes two unsigned LEB128 operands
    /// representing a register number and a (non-factored) offset. The required
    /// action is to define the current CFA rule to use the provided register
    /// and offset
    DefCfa { register: Register, offset: u64 },
    /// Identical to DW_CFA_def_cfa except that the second operand is signed
    /// and factored. The resulting offset is factored_offset *
    /// data_alignment_factor.
    DefCfaSf {
        register: Register,
        factored_offset: i64,
    },
    /// The DW_CFA_def_cfa_register instruction takes a single unsigned LEB128
    /// operand representing a register number. The required action is to define
    /// the current CFA rule to use the provided register (but to keep the
    /// old offset). This operation is valid only if the current CFA rule is
    /// defined to use a register and offset.
    DefCfaRegister(Register),
    /// The DW_CFA_def_cfa_offset instruction takes a single unsigned LEB128
    /// operand representing a (non-factored) offset. The required action is to
    /// define the current CFA rule to use the provided offset (but to keep
    /// the old register). This operation is valid only if the current CFA
    /// rule is defined to use a register and offset.
    DefCfaOffset(u64),
    /// Identical to DW_CFA_def_cfa_offset except that the operand is signed
    /// and factored.
    DefCfaOffsetSf(i64),
    /// The DW_CFA_def_cfa_expression instruction takes a single operand encoded
    /// as a DW_FORM_exprloc value representing a DWARF expression. The
    /// required action is to establish that expression as the means by which
    /// the current CFA is computed.
    DefCfaExpression(&'a [u8]),
    //
    //-------- 6.4.2.3 Register Rule Instructions
    //
    /// The DW_CFA_undefined instruction takes a single unsigned LEB128 operand
    /// that represents a register number. The required action is to set the
    /// rule for the specified register to “undefined.”
    Undefined(Register),
    /// The DW_CFA_same_value instruction takes a single unsigned LEB128
    /// operand that represents a register number. The required action is to set
    /// the rule for the specified register to “same value.”
    SameValue(Register),
    /// The DW_CFA_offset instruction takes two operands: a register number
    /// (encoded with the opcode) and an unsigned LEB128 constant representing a
    /// factored offset. The required action is to change the rule for the
    /// register indicated by the register number to be an offset(N) rule
    /// where the value of N is factored offset * data_alignment_factor.
    Offset {
        register: Register,
        factored_offset: u64,
    },
    /// Identical to DW_CFA_offset except for the encoding and size of the
    /// register operand.
    OffsetExtended {
        register: Register,
        factored_offset: u64,
    },
    /// Identical to DW_CFA_offset_extended except that the second operand is
    /// signed and factored.
    OffsetExtendedSf {
        register: Register,
        factored_offset: i64,
    },
    /// GNU extension: like DW_CFA_offset_extended with the offset negated.
    NegativeOffsetExtended {
        register: Register,
        factored_offset: u64,
    },
    /// The DW_CFA_val_offset instruction takes two unsigned LEB128 operands
    /// representing a register number and a factored offset. The required
    /// action is to change the rule for the register indicated by the
    /// register number to be a val_offset(N) rule where the value of N is
    /// factored_offset * data_alignment_factor.
    ValOffset {
        register: Register,
        factored_offset: u64,
    },
    /// Identical to DW_CFA_val_offset except that the second operand is signed
    /// and factored.
    ValOffsetSf {
        register: Register,
        factored_offset: i64,
    },
    /// The DW_CFA_register instruction takes two unsigned LEB128 operands
    /// representing register numbers. The required action is to set the rule
    /// for the first register to be register(R) where R is the second
    /// register.
    Register { register: Register, from: Register },
    /// The DW_CFA_expression instruction takes two operands: an unsigned
    /// LEB128 value representing a register number, and a DW_FORM_block value
    /// representing a DWARF expression. The required action is to change the
    /// rule for the register indicated by the register number to be an
    /// expression(E) rule where E is the DWARF expression.
    Expression { register: Register, expr: &'a [u8] },
    /// Like DW_CFA_expression, but the expression computes the value of the
    /// register instead of its address.
    ValExpression { register: Register, expr: &'a [u8] },
    /// The DW_CFA_restore instruction takes a single operand (encoded with the
    /// opcode) that represents a register number. The required action is to
    /// change the rule for the indicated register to the rule assigned it
    /// by the initial_instructions in the CIE.
    Restore(Register),
    /// Identical to DW_CFA_restore except for the encoding and size of the
    /// register operand.
    RestoreExtended(Register),
    //
    //-------- 6.4.2.4 Row State Instructions
    //
    /// The DW_CFA_remember_state instruction takes no operands. The required
    /// action is to push the set of rules for every register onto an implicit
    /// stack.
    RememberState,
    /// The DW_CFA_restore_state instruction takes no operands. The required
    /// action is to pop the set of rules off the implicit stack and place them
    /// in the current row.
    RestoreState,
    //
    //-------- 6.4.2.5 Padding Instruction
    //
    /// The DW_CFA_nop instruction has no operands and no required actions. It
    /// is used as padding to make a CIE or FDE an appropriate size.
    Nop,
    //
    //-------- GNU extensions
    //
    /// SPARC register window save.
    WindowSave,
    /// The size of the arguments pushed on the stack.
    ArgsSize(u64),
}

/// Everything besides the bytes that decoding an instruction depends on.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext {
    /// The CIE's FDE pointer encoding, used by `DW_CFA_set_loc`.
    pub pointer_encoding: Encoding,
    pub address_size: AddressSize,
    pub bases: PointerBases,
}

/// Iterator over the instructions of one entry, yielding each instruction
/// with its section offset. Stops after the first error.
#[derive(Debug, Clone)]
pub struct Instructions<'a> {
    data: Cursor<'a>,
    context: DecodeContext,
}

impl<'a> Instructions<'a> {
    pub fn new(data: Cursor<'a>, context: DecodeContext) -> Self {
        Self { data, context }
    }

    fn decode(&mut self) -> Result<Instruction<'a>> {
        let data = &mut self.data;
        let b = data.read_u8()?;
        let low_6 = Register::from(b & 0x3f);
        Ok(match b & 0xc0 {
            DW_CFA_advance_loc => Instruction::AdvanceLoc(b & 0x3f),
            DW_CFA_offset => Instruction::Offset {
                register: low_6,
                factored_offset: data.read_uleb128()?,
            },
            DW_CFA_restore => Instruction::Restore(low_6),
            _ => match b {
                DW_CFA_nop => Instruction::Nop,
                DW_CFA_set_loc => Instruction::SetLoc(read_encoded(
                    data,
                    self.context.pointer_encoding,
                    self.context.address_size,
                    &self.context.bases,
                )?),
                DW_CFA_advance_loc1 => Instruction::AdvanceLoc1(data.read_u8()?),
                DW_CFA_advance_loc2 => Instruction::AdvanceLoc2(data.read_u16()?),
                DW_CFA_advance_loc4 => Instruction::AdvanceLoc4(data.read_u32()?),
                DW_CFA_MIPS_advance_loc8 => Instruction::MipsAdvanceLoc8(data.read_u64()?),
                DW_CFA_offset_extended => Instruction::OffsetExtended {
                    register: data.read_uleb128()?,
                    factored_offset: data.read_uleb128()?,
                },
                DW_CFA_restore_extended => Instruction::RestoreExtended(data.read_uleb128()?),
                DW_CFA_undefined => Instruction::Undefined(data.read_uleb128()?),
                DW_CFA_same_value => Instruction::SameValue(data.read_uleb128()?),
                DW_CFA_register => Instruction::Register {
                    register: data.read_uleb128()?,
                    from: data.read_uleb128()?,
                },
                DW_CFA_remember_state => Instruction::RememberState,
                DW_CFA_restore_state => Instruction::RestoreState,
                DW_CFA_def_cfa => Instruction::DefCfa {
                    register: data.read_uleb128()?,
                    offset: data.read_uleb128()?,
                },
                DW_CFA_def_cfa_register => Instruction::DefCfaRegister(data.read_uleb128()?),
                DW_CFA_def_cfa_offset => Instruction::DefCfaOffset(data.read_uleb128()?),
                DW_CFA_def_cfa_expression => Instruction::DefCfaExpression(data.read_block()?),
                DW_CFA_expression => Instruction::Expression {
                    register: data.read_uleb128()?,
                    expr: data.read_block()?,
                },
                DW_CFA_offset_extended_sf => Instruction::OffsetExtendedSf {
                    register: data.read_uleb128()?,
                    factored_offset: data.read_sleb128()?,
                },
                DW_CFA_def_cfa_sf => Instruction::DefCfaSf {
                    register: data.read_uleb128()?,
                    factored_offset: data.read_sleb128()?,
                },
                DW_CFA_def_cfa_offset_sf => Instruction::DefCfaOffsetSf(data.read_sleb128()?),
                DW_CFA_val_offset => Instruction::ValOffset {
                    register: data.read_uleb128()?,
                    factored_offset: data.read_uleb128()?,
                },
                DW_CFA_val_offset_sf => Instruction::ValOffsetSf {
                    register: data.read_uleb128()?,
                    factored_offset: data.read_sleb128()?,
                },
                DW_CFA_val_expression => Instruction::ValExpression {
                    register: data.read_uleb128()?,
                    expr: data.read_block()?,
                },
                DW_CFA_GNU_window_save => Instruction::WindowSave,
                DW_CFA_GNU_args_size => Instruction::ArgsSize(data.read_uleb128()?),
                DW_CFA_GNU_negative_offset_extended => Instruction::NegativeOffsetExtended {
                    register: data.read_uleb128()?,
                    factored_offset: data.read_uleb128()?,
                },
                _ => return Err(Error::BadInstruction(b)),
            },
        })
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = (u64, Result<Instruction<'a>>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        let offset = self.data.offset() as u64;
        let instruction = self.decode();
        if instruction.is_err() {
            self.data.exhaust();
        }
        Some((offset, instruction))
    }
}
