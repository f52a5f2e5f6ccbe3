use crate::backend::reorder_buffer::Exception;
use crate::cpu::CPUConfig;
use crate::instructions::instructions::WordType;

/// The data memory, addressed in machine words.
pub(crate) struct MemorySubsystem {
    pub(crate) memory: Vec<WordType>,
}

impl MemorySubsystem {
    pub fn new(cpu_config: &CPUConfig) -> MemorySubsystem {
        MemorySubsystem {
            memory: vec![0; cpu_config.memory_size as usize],
        }
    }

    pub(crate) fn init(&mut self) {
        for k in 0..self.memory.len() {
            self.memory[k] = 0;
        }
    }

    fn to_index(&self, address: WordType) -> Result<usize, Exception> {
        if address < 0 || address as usize >= self.memory.len() {
            return Err(Exception::MemoryOutOfBounds { address });
        }
        Ok(address as usize)
    }

    pub(crate) fn load(&self, address: WordType) -> Result<WordType, Exception> {
        let index = self.to_index(address)?;
        Ok(self.memory[index])
    }

    pub(crate) fn store(&mut self, address: WordType, value: WordType) -> Result<(), Exception> {
        let index = self.to_index(address)?;
        self.memory[index] = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(size: u32) -> MemorySubsystem {
        let mut cpu_config = CPUConfig::default();
        cpu_config.memory_size = size;
        MemorySubsystem::new(&cpu_config)
    }

    #[test]
    fn test_load_store() {
        let mut memory = memory(16);
        memory.store(3, 99).unwrap();
        assert_eq!(memory.load(3), Ok(99));
        assert_eq!(memory.load(4), Ok(0));
    }

    #[test]
    fn test_out_of_bounds() {
        let mut memory = memory(16);
        assert_eq!(memory.load(16), Err(Exception::MemoryOutOfBounds { address: 16 }));
        assert_eq!(memory.store(-1, 1), Err(Exception::MemoryOutOfBounds { address: -1 }));
    }

    #[test]
    fn test_init_clears() {
        let mut memory = memory(4);
        memory.store(0, 5).unwrap();
        memory.init();
        assert_eq!(memory.memory, vec![0; 4]);
    }
}
