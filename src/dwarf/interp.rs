//! Runs call frame instructions and reports the resulting rule changes.
//!
//! An FDE's row at any address is built by running its CIE's initial
//! instructions and then its own up to that address. The interpreter does
//! exactly that once per FDE, telling the [`Handler`] about every rule as it
//! is set.


use alloc::vec::Vec;
use core::ops::ControlFlow;

use super::config::AddressSize;
use super::error::Error;
use super::handler::{EntryKind, Handler, Register, Reporter, CFA_REGISTER};
use super::instructions::{Instruction, Instructions};
use super::rules::{Rule, RuleMap};

/// Why an entry's instructions were not run to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// A handler callback asked to stop.
    Handler,
    /// The instructions could not be decoded. Already reported.
    Malformed,
}

pub(crate) fn stop_on_break(flow: ControlFlow<()>) -> Result<(), Stop> {
    match flow {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(()) => Err(Stop::Handler),
    }
}

/// One entry's instruction stream and what is needed to run it.
#[derive(Debug, Clone)]
pub struct Program<'a> {
    /// Section offset of the entry, for reports.
    pub entry_offset: u64,
    /// Section offset of the CIE that owns the pointer encoding.
    pub cie_offset: u64,
    pub kind: EntryKind,
    pub instructions: Instructions<'a>,
    pub code_alignment_factor: u64,
    pub data_alignment_factor: i64,
}

impl Program<'_> {
    fn factored(&self, factored_offset: i64) -> i64 {
        factored_offset.wrapping_mul(self.data_alignment_factor)
    }

    fn factored_unsigned(&self, factored_offset: u64) -> i64 {
        self.factored(factored_offset as i64)
    }
}

pub struct State<'a, 'p, H: ?Sized, R: ?Sized> {
    handler: &'p mut H,
    reporter: &'p mut R,
    address_size: AddressSize,
    /// The address the next rule change applies to.
    address: u64,
    rules: RuleMap<'a>,
    /// The row the CIE's initial instructions produced, used by
    /// `DW_CFA_restore`.
    cie_rules: RuleMap<'a>,
    saved: Vec<RuleMap<'a>>,
}

impl<'a, 'p, H: Handler + ?Sized, R: Reporter + ?Sized> State<'a, 'p, H, R> {
    pub fn new(
        handler: &'p mut H,
        reporter: &'p mut R,
        address: u64,
        address_size: AddressSize,
    ) -> Self {
        Self {
            handler,
            reporter,
            address_size,
            address,
            rules: RuleMap::default(),
            cie_rules: RuleMap::default(),
            saved: Vec::new(),
        }
    }

    /// Run a CIE's initial instructions and keep the result for
    /// `DW_CFA_restore`.
    pub fn interpret_cie(&mut self, program: Program<'a>) -> Result<(), Stop> {
        self.run(program)?;
        self.cie_rules = self.rules.clone();
        Ok(())
    }

    pub fn interpret_fde(&mut self, program: Program<'a>) -> Result<(), Stop> {
        self.run(program)
    }

    fn run(&mut self, program: Program<'a>) -> Result<(), Stop> {
        for (at, instruction) in program.instructions.clone() {
            let instruction = match instruction {
                Ok(instruction) => instruction,
                Err(err) => {
                    self.report_decode_error(&program, at, err);
                    return Err(Stop::Malformed);
                }
            };
            trace!("{at:#x}: {instruction:x?}");
            self.execute(&program, at, instruction)?;
        }
        Ok(())
    }

    fn report_decode_error(&mut self, program: &Program<'a>, at: u64, err: Error) {
        debug!("{} at {:#x}: {err}", program.kind, program.entry_offset);
        match err {
            Error::BadInstruction(_) => {
                self.reporter
                    .bad_instruction(program.entry_offset, program.kind, at)
            }
            Error::InvalidEncoding(encoding) => self
                .reporter
                .invalid_pointer_encoding(program.cie_offset, encoding),
            Error::UnusableEncoding(encoding) => self
                .reporter
                .unusable_pointer_encoding(program.cie_offset, encoding),
            Error::UnexpectedEnd | Error::BadAugmentation(_) => {
                self.reporter.incomplete(program.entry_offset, program.kind)
            }
        }
    }

    fn execute(
        &mut self,
        program: &Program<'a>,
        at: u64,
        instruction: Instruction<'a>,
    ) -> Result<(), Stop> {
        match instruction {
            Instruction::SetLoc(address) => self.address = address,
            Instruction::AdvanceLoc(delta) => self.advance(program, u64::from(delta)),
            Instruction::AdvanceLoc1(delta) => self.advance(program, u64::from(delta)),
            Instruction::AdvanceLoc2(delta) => self.advance(program, u64::from(delta)),
            Instruction::AdvanceLoc4(delta) => self.advance(program, u64::from(delta)),
            Instruction::MipsAdvanceLoc8(delta) => self.advance(program, delta),

            Instruction::DefCfa { register, offset } => {
                return self.set_cfa(Rule::ValOffset {
                    base: register,
                    offset: offset as i64,
                });
            }
            Instruction::DefCfaSf {
                register,
                factored_offset,
            } => {
                return self.set_cfa(Rule::ValOffset {
                    base: register,
                    offset: program.factored(factored_offset),
                });
            }
            Instruction::DefCfaRegister(register) => match self.rules.cfa {
                Some(rule) => return self.set_cfa(rule.with_base(register)),
                None => self.no_cfa_rule(program, at),
            },
            Instruction::DefCfaOffset(offset) => match self.rules.cfa {
                Some(rule) => return self.set_cfa(rule.with_offset(offset as i64)),
                None => self.no_cfa_rule(program, at),
            },
            Instruction::DefCfaOffsetSf(factored_offset) => match self.rules.cfa {
                Some(rule) => return self.set_cfa(rule.with_offset(program.factored(factored_offset))),
                None => self.no_cfa_rule(program, at),
            },
            Instruction::DefCfaExpression(expr) => return self.set_cfa(Rule::ValExpression(expr)),

            Instruction::Undefined(register) => return self.set_rule(register, Rule::Undefined),
            Instruction::SameValue(register) => return self.set_rule(register, Rule::SameValue),
            Instruction::Offset {
                register,
                factored_offset,
            }
            | Instruction::OffsetExtended {
                register,
                factored_offset,
            } => {
                let offset = program.factored_unsigned(factored_offset);
                return self.set_cfa_relative(program, at, register, Rule::Offset {
                    base: CFA_REGISTER,
                    offset,
                });
            }
            Instruction::OffsetExtendedSf {
                register,
                factored_offset,
            } => {
                let offset = program.factored(factored_offset);
                return self.set_cfa_relative(program, at, register, Rule::Offset {
                    base: CFA_REGISTER,
                    offset,
                });
            }
            Instruction::NegativeOffsetExtended {
                register,
                factored_offset,
            } => {
                let offset = program.factored_unsigned(factored_offset).wrapping_neg();
                return self.set_cfa_relative(program, at, register, Rule::Offset {
                    base: CFA_REGISTER,
                    offset,
                });
            }
            Instruction::ValOffset {
                register,
                factored_offset,
            } => {
                let offset = program.factored_unsigned(factored_offset);
                return self.set_cfa_relative(program, at, register, Rule::ValOffset {
                    base: CFA_REGISTER,
                    offset,
                });
            }
            Instruction::ValOffsetSf {
                register,
                factored_offset,
            } => {
                let offset = program.factored(factored_offset);
                return self.set_cfa_relative(program, at, register, Rule::ValOffset {
                    base: CFA_REGISTER,
                    offset,
                });
            }
            Instruction::Register { register, from } => {
                return self.set_rule(register, Rule::Register(from));
            }
            Instruction::Expression { register, expr } => {
                return self.set_rule(register, Rule::Expression(expr));
            }
            Instruction::ValExpression { register, expr } => {
                return self.set_rule(register, Rule::ValExpression(expr));
            }
            Instruction::Restore(register) | Instruction::RestoreExtended(register) => {
                return self.restore(program, at, register);
            }

            Instruction::RememberState => self.saved.push(self.rules.clone()),
            Instruction::RestoreState => return self.restore_state(program, at),

            Instruction::Nop | Instruction::ArgsSize(_) => {}
            Instruction::WindowSave => return self.window_save(program, at),
        }
        Ok(())
    }

    fn advance(&mut self, program: &Program<'a>, delta: u64) {
        self.address = self.address_size.truncate(
            self.address
                .wrapping_add(delta.wrapping_mul(program.code_alignment_factor)),
        );
    }

    fn no_cfa_rule(&mut self, program: &Program<'a>, at: u64) {
        self.reporter
            .no_cfa_rule(program.entry_offset, program.kind, at);
    }

    /// Only an actual change reaches the handler.
    fn set_cfa(&mut self, rule: Rule<'a>) -> Result<(), Stop> {
        if self.rules.cfa == Some(rule) {
            return Ok(());
        }
        self.rules.cfa = Some(rule);
        stop_on_break(rule.handle(&mut *self.handler, self.address, CFA_REGISTER))
    }

    fn set_rule(&mut self, register: Register, rule: Rule<'a>) -> Result<(), Stop> {
        self.rules.set_register(register, rule);
        stop_on_break(rule.handle(&mut *self.handler, self.address, register))
    }

    /// Rules relative to the CFA need a CFA rule to be relative to.
    fn set_cfa_relative(
        &mut self,
        program: &Program<'a>,
        at: u64,
        register: Register,
        rule: Rule<'a>,
    ) -> Result<(), Stop> {
        if self.rules.cfa.is_none() {
            self.no_cfa_rule(program, at);
            return Ok(());
        }
        self.set_rule(register, rule)
    }

    fn restore(&mut self, program: &Program<'a>, at: u64, register: Register) -> Result<(), Stop> {
        if program.kind == EntryKind::Cie {
            self.reporter.restore_in_cie(program.entry_offset, at);
            return Ok(());
        }
        let rule = self.cie_rules.register(register).unwrap_or(Rule::SameValue);
        self.set_rule(register, rule)
    }

    fn restore_state(&mut self, program: &Program<'a>, at: u64) -> Result<(), Stop> {
        let Some(saved) = self.saved.last() else {
            self.reporter
                .empty_state_stack(program.entry_offset, program.kind, at);
            return Ok(());
        };
        if self.rules.cfa.is_some() && saved.cfa.is_none() {
            self.reporter
                .clearing_cfa_rule(program.entry_offset, program.kind, at);
            return Ok(());
        }
        let Some(saved) = self.saved.pop() else {
            return Ok(());
        };
        let transition = self
            .rules
            .handle_transition_to(&mut *self.handler, self.address, &saved);
        self.rules = saved;
        stop_on_break(transition)
    }

    /// Registers 8..16 move to 24..32, and 16..32 are saved in consecutive
    /// slots above the CFA.
    fn window_save(&mut self, program: &Program<'a>, at: u64) -> Result<(), Stop> {
        for register in 8..16 {
            self.set_rule(register, Rule::Register(register + 16))?;
        }
        if self.rules.cfa.is_none() {
            self.no_cfa_rule(program, at);
            return Ok(());
        }
        let size = self.address_size.bytes() as i64;
        for register in 16..32 {
            let offset = (register as i64 - 16) * size;
            self.set_rule(register, Rule::Offset {
                base: CFA_REGISTER,
                offset,
            })?;
        }
        Ok(())
    }
}
