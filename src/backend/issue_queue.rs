use std::fmt;
use std::fmt::Display;

use crate::instructions::instructions::{Instr, RegisterType, WordType};

/// A renamed source operand.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SourceOperand {
    Unused,
    Ready(WordType),
    // waiting for the broadcast of this physical register
    Waiting(RegisterType),
}

impl SourceOperand {
    pub(crate) fn is_ready(&self) -> bool {
        !matches!(self, SourceOperand::Waiting(_))
    }

    pub(crate) fn value(&self) -> WordType {
        match *self {
            SourceOperand::Ready(value) => value,
            SourceOperand::Unused => 0,
            SourceOperand::Waiting(reg) => panic!("Operand waiting on P{} has no value", reg),
        }
    }

    fn wakeup(&mut self, phys_reg: RegisterType, value: WordType) -> bool {
        if *self == SourceOperand::Waiting(phys_reg) {
            *self = SourceOperand::Ready(value);
            return true;
        }
        false
    }
}

/// The renamed zero flag, only used by conditional branches.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum FlagOperand {
    Unused,
    Ready(bool),
    // waiting for the flag produced by the instruction with this seq
    Waiting(u64),
}

impl FlagOperand {
    pub(crate) fn is_ready(&self) -> bool {
        !matches!(self, FlagOperand::Waiting(_))
    }

    pub(crate) fn value(&self) -> bool {
        match *self {
            FlagOperand::Ready(value) => value,
            FlagOperand::Unused => false,
            FlagOperand::Waiting(seq) => panic!("Flag waiting on seq {} has no value", seq),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum IQState {
    WAITING,
    ISSUED,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct IssueQueueEntry {
    pub(crate) seq: u64,
    pub(crate) pc: WordType,
    pub(crate) instr: Instr,
    pub(crate) source: [SourceOperand; 2],
    pub(crate) store_data: SourceOperand,
    pub(crate) flag: FlagOperand,
    pub(crate) dest: Option<RegisterType>,
    // the checkpoint of the youngest control instruction in flight at dispatch
    pub(crate) branch_tag: Option<u16>,
    // the checkpoint owned by this (control) instruction
    pub(crate) checkpoint: Option<u16>,
    pub(crate) state: IQState,
}

impl IssueQueueEntry {
    // The store data is not needed to issue; the memory unit waits for it.
    pub(crate) fn is_ready(&self) -> bool {
        self.source.iter().all(|source| source.is_ready()) && self.flag.is_ready()
    }

    pub(crate) fn wakeup(&mut self, phys_reg: RegisterType, value: WordType) {
        for source in self.source.iter_mut() {
            source.wakeup(phys_reg, value);
        }
        self.store_data.wakeup(phys_reg, value);
    }

    pub(crate) fn wakeup_flag(&mut self, seq: u64, value: bool) {
        if self.flag == FlagOperand::Waiting(seq) {
            self.flag = FlagOperand::Ready(value);
        }
    }
}

impl Display for IssueQueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} seq={} pc={}", self.instr, self.seq, self.pc)?;
        for source in &self.source {
            match source {
                SourceOperand::Unused => {}
                SourceOperand::Ready(value) => write!(f, " [{}]", value)?,
                SourceOperand::Waiting(reg) => write!(f, " [P{}?]", reg)?,
            }
        }
        if let Some(dest) = self.dest {
            write!(f, " -> P{}", dest)?;
        }
        if let Some(tag) = self.branch_tag {
            write!(f, " tag={}", tag)?;
        }
        Ok(())
    }
}

/// The issue queue holds the dispatched instructions in program order until they are issued.
pub(crate) struct IssueQueue {
    pub(crate) capacity: u16,
    entries: Vec<IssueQueueEntry>,
}

impl IssueQueue {
    pub(crate) fn new(capacity: u16) -> Self {
        IssueQueue {
            capacity,
            entries: Vec::with_capacity(capacity as usize),
        }
    }

    pub(crate) fn has_space(&self) -> bool {
        return self.entries.len() < self.capacity as usize;
    }

    pub(crate) fn size(&self) -> u16 {
        return self.entries.len() as u16;
    }

    pub(crate) fn insert(&mut self, entry: IssueQueueEntry) {
        assert!(self.has_space(), "IssueQueue: Can't insert if no space.");
        debug_assert!(self.entries.last().map_or(true, |last| last.seq < entry.seq), "IssueQueue: entries must be inserted in program order");
        self.entries.push(entry);
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> &mut IssueQueueEntry {
        &mut self.entries[index]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item=&IssueQueueEntry> {
        self.entries.iter()
    }

    // Removes the issued entries; the remaining entries keep their order.
    pub(crate) fn compact(&mut self) {
        self.entries.retain(|entry| entry.state == IQState::WAITING);
    }

    pub(crate) fn wakeup(&mut self, phys_reg: RegisterType, value: WordType) {
        for entry in self.entries.iter_mut() {
            entry.wakeup(phys_reg, value);
        }
    }

    pub(crate) fn wakeup_flag(&mut self, seq: u64, value: bool) {
        for entry in self.entries.iter_mut() {
            entry.wakeup_flag(seq, value);
        }
    }

    // Drops every entry younger than seq and returns how many were dropped.
    pub(crate) fn flush_younger_than(&mut self, seq: u64) -> u16 {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.seq <= seq);
        return (before - self.entries.len()) as u16;
    }
}
