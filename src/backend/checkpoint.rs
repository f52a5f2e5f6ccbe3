use crate::backend::backend::StallReason;
use crate::backend::register_alias_table::RAT;

/// A snapshot of the rename state, taken when a control instruction is dispatched.
#[derive(Clone, Debug)]
pub(crate) struct Checkpoint {
    pub(crate) rat: RAT,
    // the seq of the control instruction that owns the checkpoint
    pub(crate) branch_seq: u64,
}

/// A small fixed pool of checkpoints addressed by slot id.
pub(crate) struct CheckpointTable {
    slots: Vec<Option<Checkpoint>>,
    free_stack: Vec<u16>,
}

impl CheckpointTable {
    pub(crate) fn new(capacity: u16) -> Self {
        let mut free_stack = Vec::with_capacity(capacity as usize);
        let mut slots = Vec::with_capacity(capacity as usize);
        for i in 0..capacity {
            slots.push(None);
            free_stack.push(capacity - 1 - i);
        }
        CheckpointTable { slots, free_stack }
    }

    pub(crate) fn has_free(&self) -> bool {
        return !self.free_stack.is_empty();
    }

    pub(crate) fn live_count(&self) -> u16 {
        return (self.slots.len() - self.free_stack.len()) as u16;
    }

    pub(crate) fn take(&mut self, rat: &RAT, branch_seq: u64) -> Result<u16, StallReason> {
        let id = self.free_stack.pop().ok_or(StallReason::NoFreeCheckpoint)?;
        debug_assert!(self.slots[id as usize].is_none());
        self.slots[id as usize] = Some(Checkpoint { rat: rat.clone(), branch_seq });
        return Ok(id);
    }

    pub(crate) fn get(&self, id: u16) -> &Checkpoint {
        match &self.slots[id as usize] {
            Some(checkpoint) => checkpoint,
            None => panic!("Checkpoint {} is not in use", id),
        }
    }

    pub(crate) fn release(&mut self, id: u16) {
        debug_assert!(self.slots[id as usize].is_some(), "Checkpoint {} released twice", id);
        self.slots[id as usize] = None;
        self.free_stack.push(id);
    }

    // Releases the checkpoints of every control instruction younger than seq.
    pub(crate) fn release_younger_than(&mut self, seq: u64) {
        for id in 0..self.slots.len() as u16 {
            let younger = matches!(&self.slots[id as usize], Some(checkpoint) if checkpoint.branch_seq > seq);
            if younger {
                self.release(id);
            }
        }
    }

    /// The id of the checkpoint of the youngest in-flight control instruction.
    pub(crate) fn youngest(&self) -> Option<u16> {
        return self.slots.iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|checkpoint| (id as u16, checkpoint.branch_seq)))
            .max_by_key(|(_, branch_seq)| *branch_seq)
            .map(|(id, _)| id);
    }
}
