//! Replays call frame instructions to find the unwinding rules at one PC.
//!
//! The CFI describes a table with one row per code location:
//! ```text
//! LOC CFA R0 R1 ... RN
//! L0
//! L1
//! ...
//! LN
//! ```
//! The CFA column says how to compute the Canonical Frame Address, the
//! others how to recover each register of the caller. Instead of building
//! the table, we run the instructions and stop at the row covering our PC.

use alloc::{collections::BTreeMap, format, vec::Vec};

use super::{
    parse::{Cie, Fde, InstrIter, Instruction},
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CfaRule {
    /// No `DW_CFA_def_cfa*` seen yet.
    Unset,
    RegisterOffset { register: u16, offset: i64 },
    Expression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegisterRule {
    /// A register that has this rule has no recoverable value in the previous
    /// frame. (By convention, it is not preserved by a callee.)
    Undefined,
    /// This register has not been modified from the previous frame.
    SameValue,
    /// The previous value of this register is saved at the address CFA+N.
    Offset(i64),
    /// The previous value of this register is the value CFA+N.
    ValOffset(i64),
    /// The previous value of this register is stored in another register.
    Register(u16),
    /// Saved at an address computed by a DWARF expression.
    Expression,
    /// The value itself is computed by a DWARF expression.
    ValExpression,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Row {
    pub(crate) cfa: CfaRule,
    registers: BTreeMap<u16, RegisterRule>,
}

impl Row {
    fn new() -> Self {
        Self {
            cfa: CfaRule::Unset,
            registers: BTreeMap::new(),
        }
    }

    pub(crate) fn register(&self, register: u16) -> RegisterRule {
        self.registers
            .get(&register)
            .copied()
            .unwrap_or(RegisterRule::Undefined)
    }

    fn set(&mut self, register: u16, rule: RegisterRule) {
        self.registers.insert(register, rule);
    }
}

enum Step {
    Continue,
    /// The next row starts after the PC we are looking for.
    Done,
}

struct Machine<'c> {
    cie: &'c Cie<'c>,
    pc: u64,
    location: u64,
    row: Row,
    /// The row after the CIE's initial instructions, for `DW_CFA_restore`.
    initial: Option<Row>,
    stack: Vec<Row>,
}

impl Machine<'_> {
    fn factored(&self, factored_offset: i64) -> Result<i64> {
        factored_offset
            .checked_mul(self.cie.data_alignment_factor)
            .ok_or_else(|| Error::Malformed(format!("factored offset {factored_offset} overflows")))
    }

    fn factored_unsigned(&self, factored_offset: u64) -> Result<i64> {
        let offset = i64::try_from(factored_offset)
            .map_err(|_| Error::Malformed(format!("factored offset {factored_offset} overflows")))?;
        self.factored(offset)
    }

    fn set_cfa_offset(&mut self, offset: i64) -> Result<()> {
        match &mut self.row.cfa {
            CfaRule::RegisterOffset { offset: old, .. } => {
                *old = offset;
                Ok(())
            }
            _ => Err(Error::Malformed("CFA offset changed without a CFA register".into())),
        }
    }

    fn advance_to(&mut self, location: u64) -> Step {
        if location > self.pc {
            return Step::Done;
        }
        self.location = location;
        Step::Continue
    }

    fn execute(&mut self, instruction: Instruction<'_>) -> Result<Step> {
        trace!(location = self.location, "{instruction:?}");
        match instruction {
            Instruction::SetLoc(location) => {
                if location < self.location {
                    return Err(Error::Malformed(format!(
                        "DW_CFA_set_loc moves backwards to {location:#x}"
                    )));
                }
                return Ok(self.advance_to(location));
            }
            Instruction::AdvanceLoc(delta) => {
                let location = delta
                    .checked_mul(self.cie.code_alignment_factor)
                    .and_then(|delta| self.location.checked_add(delta))
                    .ok_or_else(|| {
                        Error::Malformed(format!("location advance {delta} overflows"))
                    })?;
                return Ok(self.advance_to(location));
            }
            Instruction::DefCfa { register, offset } => {
                let offset = i64::try_from(offset)
                    .map_err(|_| Error::Malformed(format!("CFA offset {offset} overflows")))?;
                self.row.cfa = CfaRule::RegisterOffset { register, offset };
            }
            Instruction::DefCfaSf {
                register,
                factored_offset,
            } => {
                let offset = self.factored(factored_offset)?;
                self.row.cfa = CfaRule::RegisterOffset { register, offset };
            }
            Instruction::DefCfaRegister(register) => match &mut self.row.cfa {
                CfaRule::RegisterOffset { register: old, .. } => *old = register,
                _ => {
                    return Err(Error::Malformed(
                        "CFA register changed without a CFA offset".into(),
                    ))
                }
            },
            Instruction::DefCfaOffset(offset) => {
                let offset = i64::try_from(offset)
                    .map_err(|_| Error::Malformed(format!("CFA offset {offset} overflows")))?;
                self.set_cfa_offset(offset)?;
            }
            Instruction::DefCfaOffsetSf(factored_offset) => {
                let offset = self.factored(factored_offset)?;
                self.set_cfa_offset(offset)?;
            }
            Instruction::DefCfaExpression(_) => self.row.cfa = CfaRule::Expression,
            Instruction::Undefined(register) => self.row.set(register, RegisterRule::Undefined),
            Instruction::SameValue(register) => self.row.set(register, RegisterRule::SameValue),
            Instruction::Offset {
                register,
                factored_offset,
            } => {
                let offset = self.factored_unsigned(factored_offset)?;
                self.row.set(register, RegisterRule::Offset(offset));
            }
            Instruction::OffsetExtendedSf {
                register,
                factored_offset,
            } => {
                let offset = self.factored(factored_offset)?;
                self.row.set(register, RegisterRule::Offset(offset));
            }
            Instruction::NegativeOffsetExtended {
                register,
                factored_offset,
            } => {
                let offset = self.factored_unsigned(factored_offset)?;
                self.row.set(register, RegisterRule::Offset(-offset));
            }
            Instruction::ValOffset {
                register,
                factored_offset,
            } => {
                let offset = self.factored_unsigned(factored_offset)?;
                self.row.set(register, RegisterRule::ValOffset(offset));
            }
            Instruction::ValOffsetSf {
                register,
                factored_offset,
            } => {
                let offset = self.factored(factored_offset)?;
                self.row.set(register, RegisterRule::ValOffset(offset));
            }
            Instruction::Register {
                target_register,
                from_register,
            } => self
                .row
                .set(target_register, RegisterRule::Register(from_register)),
            Instruction::Expression { register, .. } => {
                self.row.set(register, RegisterRule::Expression)
            }
            Instruction::ValExpression { register, .. } => {
                self.row.set(register, RegisterRule::ValExpression)
            }
            Instruction::Restore(register) => {
                let Some(initial) = &self.initial else {
                    return Err(Error::Malformed(
                        "DW_CFA_restore in CIE initial instructions".into(),
                    ));
                };
                let rule = initial.register(register);
                self.row.set(register, rule);
            }
            Instruction::RememberState => self.stack.push(self.row.clone()),
            Instruction::RestoreState => {
                self.row = self
                    .stack
                    .pop()
                    .ok_or_else(|| {
                        Error::Malformed("DW_CFA_restore_state with empty stack".into())
                    })?;
            }
            Instruction::Nop | Instruction::ArgsSize(_) => {}
        }
        Ok(Step::Continue)
    }

    fn run(&mut self, instructions: &[u8], base: u64) -> Result<Step> {
        let iter = InstrIter::new(
            instructions,
            base,
            self.cie.pointer_encoding(),
            self.cie.address_size,
        );
        for instruction in iter {
            if let Step::Done = self.execute(instruction?)? {
                return Ok(Step::Done);
            }
        }
        Ok(Step::Continue)
    }
}

/// The row of `fde`'s table that covers `pc`.
pub(crate) fn row_for_pc(cie: &Cie<'_>, fde: &Fde<'_>, pc: u64) -> Result<Row> {
    let mut machine = Machine {
        cie,
        pc,
        location: fde.pc_begin,
        row: Row::new(),
        initial: None,
        stack: Vec::new(),
    };

    machine.run(cie.initial_instructions, cie.initial_instructions_address)?;
    machine.initial = Some(machine.row.clone());
    machine.stack.clear();
    machine.run(fde.instructions, fde.instructions_address)?;

    trace!(location = machine.location, row = ?machine.row, "row for pc {pc:#x}");
    Ok(machine.row)
}
