use crate::backend::issue_queue::IssueQueueEntry;
use crate::backend::reorder_buffer::Exception;
use crate::instructions::instructions::{Condition, Instr, Opcode, WordType, INSTR_SIZE};

/// The outcome of a control instruction, computed in branch stage 1 and applied in stage 2.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Resolution {
    pub(crate) taken: bool,
    pub(crate) target: WordType,
    // the return address written by JAL
    pub(crate) link: Option<WordType>,
}

/// An instruction occupying a functional unit (stage).
#[derive(Clone, Copy, Debug)]
pub(crate) struct InFlight {
    pub(crate) entry: IssueQueueEntry,
    pub(crate) address: Option<WordType>,
    pub(crate) resolution: Option<Resolution>,
}

/// A single functional unit, or a single stage of a multi stage unit.
pub(crate) struct EU {
    pub(crate) name: &'static str,
    pub(crate) cycles_remaining: u8,
    occupant: Option<InFlight>,
}

impl EU {
    fn new(name: &'static str) -> Self {
        EU { name, cycles_remaining: 0, occupant: None }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.occupant.is_none()
    }

    pub(crate) fn issue(&mut self, entry: IssueQueueEntry, cycles: u8) {
        debug_assert!(self.is_idle(), "{} is busy", self.name);
        self.occupant = Some(InFlight { entry, address: None, resolution: None });
        self.cycles_remaining = cycles;
    }

    // Hands an instruction over from the previous stage.
    pub(crate) fn accept(&mut self, in_flight: InFlight) {
        debug_assert!(self.is_idle(), "{} is busy", self.name);
        self.occupant = Some(in_flight);
        self.cycles_remaining = 1;
    }

    pub(crate) fn occupant(&self) -> Option<&InFlight> {
        self.occupant.as_ref()
    }

    pub(crate) fn occupant_mut(&mut self) -> Option<&mut InFlight> {
        self.occupant.as_mut()
    }

    pub(crate) fn take(&mut self) -> Option<InFlight> {
        self.cycles_remaining = 0;
        self.occupant.take()
    }

    fn flush_younger_than(&mut self, seq: u64) -> bool {
        if matches!(&self.occupant, Some(in_flight) if in_flight.entry.seq > seq) {
            self.take();
            return true;
        }
        false
    }
}

pub(crate) struct EUTable {
    pub(crate) integer: EU,
    pub(crate) multiplier: EU,
    pub(crate) memory_address: EU,
    pub(crate) memory_access: EU,
    pub(crate) branch_resolve: EU,
    pub(crate) branch_redirect: EU,
    pub(crate) mul_latency: u8,
}

impl EUTable {
    pub(crate) fn new(mul_latency: u8) -> Self {
        EUTable {
            integer: EU::new("INT"),
            multiplier: EU::new("MUL"),
            memory_address: EU::new("MEM1"),
            memory_access: EU::new("MEM2"),
            branch_resolve: EU::new("BR1"),
            branch_redirect: EU::new("BR2"),
            mul_latency,
        }
    }

    pub(crate) fn units(&self) -> [&EU; 6] {
        [&self.integer, &self.multiplier, &self.memory_address, &self.memory_access, &self.branch_resolve, &self.branch_redirect]
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.units().iter().all(|eu| eu.is_idle())
    }

    // Clears every unit occupied by an instruction younger than seq.
    pub(crate) fn flush_younger_than(&mut self, seq: u64) -> u16 {
        let mut flushed = 0;
        for eu in [&mut self.integer, &mut self.multiplier, &mut self.memory_address,
            &mut self.memory_access, &mut self.branch_resolve, &mut self.branch_redirect] {
            if eu.flush_younger_than(seq) {
                flushed += 1;
            }
        }
        return flushed;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct IntegerOutcome {
    pub(crate) value: Option<WordType>,
    pub(crate) flag: Option<bool>,
}

/// Executes an instruction of the integer class. `a` and `b` are the values of the two operands.
pub(crate) fn execute_integer(instr: &Instr, a: WordType, b: WordType) -> Result<IntegerOutcome, Exception> {
    let outcome = match *instr {
        Instr::Alu { opcode, .. } => {
            let value = match opcode {
                Opcode::ADD | Opcode::ADDL => a.wrapping_add(b),
                Opcode::SUB | Opcode::SUBL => a.wrapping_sub(b),
                Opcode::AND => a & b,
                Opcode::OR => a | b,
                Opcode::XOR => a ^ b,
                Opcode::DIV => {
                    if b == 0 {
                        return Err(Exception::DivideByZero);
                    }
                    a.wrapping_div(b)
                }
                _ => unreachable!("Unhandled ALU opcode {:?}", opcode),
            };
            let flag = if instr.sets_flag() { Some(value == 0) } else { None };
            IntegerOutcome { value: Some(value), flag }
        }
        Instr::Cmp { .. } => IntegerOutcome { value: None, flag: Some(a == b) },
        Instr::Movc { .. } => IntegerOutcome { value: Some(a), flag: None },
        Instr::Halt | Instr::Nop => IntegerOutcome { value: None, flag: None },
        _ => panic!("{} is not executed by the integer unit", instr),
    };
    return Ok(outcome);
}

pub(crate) fn execute_multiply(a: WordType, b: WordType) -> WordType {
    a.wrapping_mul(b)
}

/// base + displacement (LOAD/STORE) or base + index (LDR/STR)
pub(crate) fn effective_address(base: WordType, offset: WordType) -> WordType {
    base.wrapping_add(offset)
}

pub(crate) fn resolve_control(instr: &Instr, pc: WordType, a: WordType, b: WordType, zero_flag: bool) -> Resolution {
    match *instr {
        Instr::Branch { condition, offset, .. } => {
            let taken = match condition {
                Condition::Zero => zero_flag,
                Condition::NotZero => !zero_flag,
            };
            Resolution { taken, target: pc.wrapping_add(offset), link: None }
        }
        Instr::Jump { .. } => Resolution { taken: true, target: a.wrapping_add(b), link: None },
        Instr::Jal { .. } => Resolution { taken: true, target: a.wrapping_add(b), link: Some(pc + INSTR_SIZE) },
        _ => panic!("{} is not a control instruction", instr),
    }
}
