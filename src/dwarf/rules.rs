//! One row of the CFI table: the rule for the CFA and for each register.

use alloc::collections::{BTreeMap, BTreeSet};
use core::ops::ControlFlow;

use super::handler::{Handler, Register, CFA_REGISTER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule<'a> {
    /// A register that has this rule has no recoverable value in the previous
    /// frame. (By convention, it is not preserved by a callee.)
    Undefined,
    /// This register has not been modified from the previous frame.
    /// (By convention, it is preserved by the callee, but the callee has not
    /// modified it.)
    SameValue,
    /// The previous value of this register is saved at the address base+N.
    /// For register rules the base is always the CFA.
    Offset { base: Register, offset: i64 },
    /// The previous value of this register is the value base+N. This is also
    /// the shape of a register-and-offset CFA rule.
    ValOffset { base: Register, offset: i64 },
    /// The previous value of this register is stored in another register
    /// numbered R.
    Register(Register),
    /// The previous value of this register is located at the address produced
    /// by executing the DWARF expression E.
    Expression(&'a [u8]),
    /// The previous value of this register is the value produced by executing
    /// the DWARF expression E.
    ValExpression(&'a [u8]),
}

impl<'a> Rule<'a> {
    /// Tell `handler` that `register` follows this rule from `address` on.
    pub fn handle<H: Handler + ?Sized>(
        &self,
        handler: &mut H,
        address: u64,
        register: Register,
    ) -> ControlFlow<()> {
        match *self {
            Rule::Undefined => handler.undefined_rule(address, register),
            Rule::SameValue => handler.same_value_rule(address, register),
            Rule::Offset { base, offset } => handler.offset_rule(address, register, base, offset),
            Rule::ValOffset { base, offset } => {
                handler.val_offset_rule(address, register, base, offset)
            }
            Rule::Register(base) => handler.register_rule(address, register, base),
            Rule::Expression(expression) => handler.expression_rule(address, register, expression),
            Rule::ValExpression(expression) => {
                handler.val_expression_rule(address, register, expression)
            }
        }
    }

    /// The rule with its base register replaced. Only register-and-offset
    /// rules have one; the others come back unchanged.
    pub fn with_base(self, base: Register) -> Self {
        match self {
            Rule::Offset { offset, .. } => Rule::Offset { base, offset },
            Rule::ValOffset { offset, .. } => Rule::ValOffset { base, offset },
            other => other,
        }
    }

    /// Like [`Rule::with_base`], for the offset.
    pub fn with_offset(self, offset: i64) -> Self {
        match self {
            Rule::Offset { base, .. } => Rule::Offset { base, offset },
            Rule::ValOffset { base, .. } => Rule::ValOffset { base, offset },
            other => other,
        }
    }
}

/// The rules in effect at one address. Registers without an entry have no
/// rule yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleMap<'a> {
    pub cfa: Option<Rule<'a>>,
    pub registers: BTreeMap<Register, Rule<'a>>,
}

impl<'a> RuleMap<'a> {
    pub fn register(&self, register: Register) -> Option<Rule<'a>> {
        self.registers.get(&register).copied()
    }

    pub fn set_register(&mut self, register: Register, rule: Rule<'a>) {
        self.registers.insert(register, rule);
    }

    /// Report to `handler` every rule that differs in `new`, as of `address`.
    ///
    /// A register with a rule here but none in `new` is reported as
    /// [`Rule::SameValue`].
    pub fn handle_transition_to<H: Handler + ?Sized>(
        &self,
        handler: &mut H,
        address: u64,
        new: &RuleMap<'a>,
    ) -> ControlFlow<()> {
        match (&self.cfa, &new.cfa) {
            (Some(old), Some(rule)) if old != rule => rule.handle(handler, address, CFA_REGISTER)?,
            (None, Some(rule)) => rule.handle(handler, address, CFA_REGISTER)?,
            _ => {}
        }

        let registers: BTreeSet<Register> = self
            .registers
            .keys()
            .chain(new.registers.keys())
            .copied()
            .collect();
        for register in registers {
            match (self.register(register), new.register(register)) {
                (Some(old), Some(rule)) if old != rule => rule.handle(handler, address, register)?,
                (None, Some(rule)) => rule.handle(handler, address, register)?,
                (Some(_), None) => handler.same_value_rule(address, register)?,
                _ => {}
            }
        }
        ControlFlow::Continue(())
    }
}
