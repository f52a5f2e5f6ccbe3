use thiserror::Error;

use crate::instructions::instructions::{Instr, RegisterType, WordType};

#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum ROBSlotState {
    UNUSED,
    PENDING,
    COMPLETED,
}

/// An exception raised while executing an instruction. It is recorded on the
/// ROB slot and trapped when the instruction reaches commit.
#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Exception {
    #[error("memory access out of bounds at address {address}")]
    MemoryOutOfBounds { address: WordType },
    #[error("division by zero")]
    DivideByZero,
}

#[derive(Clone, Debug)]
pub(crate) struct ROBSlot {
    pub(crate) seq: u64,
    pub(crate) pc: WordType,
    pub(crate) instr: Option<Instr>,
    pub(crate) state: ROBSlotState,
    // the physical register written by the instruction
    pub(crate) dest: Option<RegisterType>,
    // the architectural register that is remapped
    pub(crate) arch_dest: Option<RegisterType>,
    // the mapping replaced at dispatch; released when this slot retires
    pub(crate) prev_phys: Option<RegisterType>,
    pub(crate) mem_address: Option<WordType>,
    pub(crate) flag: Option<bool>,
    pub(crate) checkpoint: Option<u16>,
    pub(crate) exception: Option<Exception>,
}

impl ROBSlot {
    fn new() -> Self {
        Self {
            seq: 0,
            pc: 0,
            instr: None,
            state: ROBSlotState::UNUSED,
            dest: None,
            arch_dest: None,
            prev_phys: None,
            mem_address: None,
            flag: None,
            checkpoint: None,
            exception: None,
        }
    }
}

/// The reorder buffer. `head` and `tail` are sequence numbers: every seq in
/// [head, tail) is in flight and lives in slot `seq % capacity`.
pub(crate) struct ROB {
    capacity: u16,
    // everything before this point is retired.
    head: u64,
    tail: u64,
    slots: Vec<ROBSlot>,
}

impl ROB {
    pub(crate) fn new(capacity: u16) -> Self {
        let mut slots = Vec::with_capacity(capacity as usize);
        for _ in 0..capacity {
            slots.push(ROBSlot::new());
        }

        // seq 0 is reserved for the initial register mappings.
        Self {
            capacity,
            head: 1,
            tail: 1,
            slots,
        }
    }

    pub(crate) fn to_index(&self, seq: u64) -> usize {
        (seq % self.capacity as u64) as usize
    }

    pub(crate) fn contains(&self, seq: u64) -> bool {
        return seq >= self.head && seq < self.tail;
    }

    pub(crate) fn get(&self, seq: u64) -> &ROBSlot {
        debug_assert!(self.contains(seq), "ROB: seq {} is not in flight", seq);
        &self.slots[self.to_index(seq)]
    }

    pub(crate) fn get_mut(&mut self, seq: u64) -> &mut ROBSlot {
        debug_assert!(self.contains(seq), "ROB: seq {} is not in flight", seq);
        let index = self.to_index(seq);
        &mut self.slots[index]
    }

    /// Allocates the slot for the next instruction in program order and returns its seq.
    pub(crate) fn allocate(&mut self, pc: WordType, instr: Instr) -> u64 {
        assert!(self.has_space(), "ROB: Can't allocate if no space.");

        let seq = self.tail;
        let index = self.to_index(seq);
        let slot = &mut self.slots[index];
        debug_assert!(slot.state == ROBSlotState::UNUSED);
        slot.seq = seq;
        slot.pc = pc;
        slot.instr = Some(instr);
        slot.state = ROBSlotState::PENDING;
        self.tail += 1;
        return seq;
    }

    pub(crate) fn complete(&mut self, seq: u64) {
        let slot = self.get_mut(seq);
        debug_assert!(slot.state == ROBSlotState::PENDING);
        slot.state = ROBSlotState::COMPLETED;
    }

    pub(crate) fn head_seq(&self) -> Option<u64> {
        if self.is_empty() {
            return None;
        }
        return Some(self.head);
    }

    pub(crate) fn head(&self) -> Option<&ROBSlot> {
        return self.head_seq().map(|seq| self.get(seq));
    }

    pub(crate) fn head_has_completed(&self) -> bool {
        return matches!(self.head(), Some(slot) if slot.state == ROBSlotState::COMPLETED);
    }

    /// Removes the head slot and returns its content.
    pub(crate) fn retire(&mut self) -> ROBSlot {
        assert!(self.head_has_completed(), "ROB: can't retire because the head has not completed");

        let index = self.to_index(self.head);
        let slot = std::mem::replace(&mut self.slots[index], ROBSlot::new());
        self.head += 1;
        return slot;
    }

    /// Drops every slot younger than seq; seq itself stays. Returns the number of dropped slots.
    pub(crate) fn truncate_after(&mut self, seq: u64) -> u16 {
        debug_assert!(self.contains(seq));

        let mut flushed = 0;
        for younger in seq + 1..self.tail {
            let index = self.to_index(younger);
            self.slots[index] = ROBSlot::new();
            flushed += 1;
        }
        self.tail = seq + 1;
        return flushed;
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item=&ROBSlot> + '_ {
        (self.head..self.tail).map(move |seq| self.get(seq))
    }

    pub(crate) fn size(&self) -> u16 {
        return (self.tail - self.head) as u16;
    }

    pub(crate) fn is_empty(&self) -> bool {
        return self.head == self.tail;
    }

    pub(crate) fn has_space(&self) -> bool {
        return self.capacity > self.size();
    }

    pub(crate) fn tail_seq(&self) -> u64 {
        self.tail
    }
}
