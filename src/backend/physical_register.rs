use crate::backend::backend::StallReason;
use crate::instructions::instructions::{RegisterType, WordType};

#[derive(Clone, Copy, PartialEq, Debug)]
enum PhysRegEntryState {
    IDLE,
    BUSY,
}

pub(crate) struct PhysRegEntry {
    pub(crate) value: WordType,
    pub(crate) has_value: bool,
    // the seq of the instruction that allocated the register; 0 for the initial mappings.
    pub(crate) owner_seq: u64,
    state: PhysRegEntryState,
}

impl PhysRegEntry {
    fn reset(&mut self) {
        self.value = 0;
        self.has_value = false;
        self.owner_seq = 0;
        self.state = PhysRegEntryState::IDLE;
    }
}

/// The unified physical register file. Free registers are kept on a stack.
pub(crate) struct PhysRegFile {
    free_stack: Vec<RegisterType>,
    count: u16,
    entries: Vec<PhysRegEntry>,
}

impl PhysRegFile {
    pub(crate) fn new(count: u16) -> PhysRegFile {
        let mut free_stack = Vec::with_capacity(count as usize);
        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count {
            entries.push(PhysRegEntry {
                value: 0,
                has_value: false,
                owner_seq: 0,
                state: PhysRegEntryState::IDLE,
            });
            free_stack.push(count - 1 - i);
        }

        PhysRegFile { count, entries, free_stack }
    }

    pub(crate) fn get(&self, reg: RegisterType) -> &PhysRegEntry {
        let entry = &self.entries[reg as usize];
        debug_assert!(entry.state == PhysRegEntryState::BUSY, "phys register {} is not in busy state", reg);
        return entry;
    }

    pub(crate) fn is_free(&self, reg: RegisterType) -> bool {
        return self.entries[reg as usize].state == PhysRegEntryState::IDLE;
    }

    pub(crate) fn has_free(&self) -> bool {
        return !self.free_stack.is_empty();
    }

    pub(crate) fn free_count(&self) -> u16 {
        return self.free_stack.len() as u16;
    }

    pub(crate) fn capacity(&self) -> u16 {
        return self.count;
    }

    pub(crate) fn allocate(&mut self, seq: u64) -> Result<RegisterType, StallReason> {
        let reg = self.free_stack.pop().ok_or(StallReason::NoFreeRegister)?;
        let entry = &mut self.entries[reg as usize];
        debug_assert!(entry.state == PhysRegEntryState::IDLE);
        debug_assert!(!entry.has_value, "The allocated physical register {} should not have a value", reg);
        entry.state = PhysRegEntryState::BUSY;
        entry.owner_seq = seq;
        return Ok(reg);
    }

    /// Writes the result of the owning instruction. A register is written at most once per allocation.
    pub(crate) fn write(&mut self, reg: RegisterType, value: WordType) {
        let entry = &mut self.entries[reg as usize];
        debug_assert!(entry.state == PhysRegEntryState::BUSY, "phys register {} is written while free", reg);
        debug_assert!(!entry.has_value, "phys register {} is written twice", reg);
        entry.value = value;
        entry.has_value = true;
    }

    pub(crate) fn deallocate(&mut self, reg: RegisterType) {
        debug_assert!(!self.free_stack.contains(&reg), "Phys register {} can't be deallocated while it is also on the free stack", reg);

        let entry = &mut self.entries[reg as usize];
        debug_assert!(entry.state == PhysRegEntryState::BUSY);
        entry.reset();

        self.free_stack.push(reg);
    }

    // Releases every register allocated by an instruction younger than seq.
    pub(crate) fn release_younger_than(&mut self, seq: u64) -> u16 {
        let mut released = 0;
        for reg in 0..self.count {
            let entry = &self.entries[reg as usize];
            if entry.state == PhysRegEntryState::BUSY && entry.owner_seq > seq {
                self.deallocate(reg);
                released += 1;
            }
        }
        return released;
    }
}
