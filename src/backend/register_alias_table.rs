use crate::instructions::instructions::RegisterType;

/// Who produces the current value of the zero flag.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum FlagMapping {
    // the committed flag is current
    Committed,
    // an in-flight instruction with this seq produces the flag
    Pending(u64),
}

/// The Register Alias Table. This structure is used for the register
/// renaming process. The RAT entry for a given architectural register
/// points to the physical register that holds (or will hold) its newest value.
/// There is always exactly one mapping per architectural register.
#[derive(Clone, PartialEq, Eq, Debug)]
pub(crate) struct RAT {
    table: Vec<RegisterType>,
    flag: FlagMapping,
}

impl RAT {
    // Architectural register i starts out mapped to physical register i.
    pub fn new(arch_reg_count: u16) -> Self {
        let table = (0..arch_reg_count).collect();
        Self { table, flag: FlagMapping::Committed }
    }

    pub fn get(&self, arch_reg: RegisterType) -> RegisterType {
        return self.table[arch_reg as usize];
    }

    /// Maps arch_reg to phys_reg and returns the mapping it replaced.
    pub fn rename(&mut self, arch_reg: RegisterType, phys_reg: RegisterType) -> RegisterType {
        let previous = self.table[arch_reg as usize];
        self.table[arch_reg as usize] = phys_reg;
        return previous;
    }

    pub fn len(&self) -> u16 {
        return self.table.len() as u16;
    }

    pub fn mappings(&self) -> &[RegisterType] {
        &self.table
    }

    pub fn flag(&self) -> FlagMapping {
        self.flag
    }

    pub fn set_flag_producer(&mut self, seq: u64) {
        self.flag = FlagMapping::Pending(seq);
    }

    pub fn set_flag_committed(&mut self) {
        self.flag = FlagMapping::Committed;
    }
}
