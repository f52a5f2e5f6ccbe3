use std::error::Error;
use std::fmt;
use std::fs::File;
use std::rc::Rc;

use log::info;
use serde::Deserialize;
use thiserror::Error;

use crate::backend::backend::{Backend, CommitRecord, StallReason};
use crate::backend::reorder_buffer::Exception;
use crate::frontend::frontend::Frontend;
use crate::instructions::instructions::{Program, RegisterType, WordType, INSTR_SIZE};
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;

#[derive(Default, Debug)]
pub(crate) struct PerfCounters {
    pub decode_cnt: u64,
    pub dispatch_cnt: u64,
    pub issue_cnt: u64,
    pub execute_cnt: u64,
    pub retire_cnt: u64,
    pub cycle_cnt: u64,
    pub branch_taken_cnt: u64,
    pub branch_not_taken_cnt: u64,
    pub pipeline_flushes: u64,
    // the number of wrong path instructions discarded by the flushes
    pub bad_speculation_cnt: u64,
    pub stall_rob_full_cnt: u64,
    pub stall_iq_full_cnt: u64,
    pub stall_no_free_reg_cnt: u64,
    pub stall_no_checkpoint_cnt: u64,
}

impl PerfCounters {
    pub(crate) fn record_stall(&mut self, reason: StallReason) {
        match reason {
            StallReason::FullReorderBuffer => self.stall_rob_full_cnt += 1,
            StallReason::FullIssueQueue => self.stall_iq_full_cnt += 1,
            StallReason::NoFreeRegister => self.stall_no_free_reg_cnt += 1,
            StallReason::NoFreeCheckpoint => self.stall_no_checkpoint_cnt += 1,
        }
    }

    pub(crate) fn ipc(&self) -> f32 {
        if self.cycle_cnt == 0 {
            return 0.0;
        }
        self.retire_cnt as f32 / self.cycle_cnt as f32
    }
}

#[derive(Clone, Default, Deserialize, Debug)]
#[serde(default)]
pub(crate) struct Trace {
    pub fetch: bool,
    pub dispatch: bool,
    pub issue: bool,
    pub execute: bool,
    pub retire: bool,
    pub flush: bool,
    pub cycle: bool,
}

impl Trace {
    pub(crate) fn all() -> Trace {
        Trace { fetch: true, dispatch: true, issue: true, execute: true, retire: true, flush: true, cycle: true }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub(crate) struct CPUConfig {
    // the number of architectural registers
    pub(crate) arch_reg_count: u16,
    // the number of physical registers
    pub(crate) phys_reg_count: u16,
    // the number of slots in the issue queue
    pub(crate) iq_capacity: u16,
    // the capacity of the reorder buffer
    pub(crate) rob_capacity: u16,
    // the number of control instructions that can be in flight
    pub(crate) checkpoint_count: u16,
    // the latency of the multiplier in cycles
    pub(crate) mul_latency: u8,
    // the size of the memory in machine words
    pub(crate) memory_size: u32,
    // the address of the first instruction
    pub(crate) code_base: WordType,
    // the maximum number of cycles in 'run' mode
    pub(crate) max_cycles: u64,
    // if processing of a single instruction should be traced (printed)
    pub(crate) trace: Trace,
}

impl Default for CPUConfig {
    fn default() -> Self {
        CPUConfig {
            arch_reg_count: 16,
            phys_reg_count: 32,
            iq_capacity: 8,
            rob_capacity: 16,
            checkpoint_count: 4,
            mul_latency: 3,
            memory_size: 4096,
            code_base: 4000,
            max_cycles: 10_000,
            trace: Trace::default(),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub(crate) enum ConfigError {
    #[error("phys_reg_count ({phys_reg_count}) must be larger than arch_reg_count ({arch_reg_count})")]
    TooFewPhysRegisters { phys_reg_count: u16, arch_reg_count: u16 },
    #[error("{0} must be at least 1")]
    Zero(&'static str),
    #[error("code_base ({0}) must be a non-negative multiple of 4")]
    BadCodeBase(WordType),
}

impl CPUConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("arch_reg_count", self.arch_reg_count as u64),
            ("iq_capacity", self.iq_capacity as u64),
            ("rob_capacity", self.rob_capacity as u64),
            ("checkpoint_count", self.checkpoint_count as u64),
            ("mul_latency", self.mul_latency as u64),
            ("memory_size", self.memory_size as u64),
            ("max_cycles", self.max_cycles),
        ];
        for (name, size) in sizes {
            if size == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        if self.phys_reg_count <= self.arch_reg_count {
            return Err(ConfigError::TooFewPhysRegisters {
                phys_reg_count: self.phys_reg_count,
                arch_reg_count: self.arch_reg_count,
            });
        }

        if self.code_base < 0 || self.code_base % INSTR_SIZE != 0 {
            return Err(ConfigError::BadCodeBase(self.code_base));
        }
        Ok(())
    }
}

pub fn load_cpu_config(file_path: &str) -> Result<CPUConfig, Box<dyn Error>> {
    let file = File::open(file_path)?;
    let config: CPUConfig = serde_yaml::from_reader(file)?;
    config.validate()?;
    Ok(config)
}

/// Why a simulation run ended.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum StopReason {
    // a HALT committed
    Halted,
    CycleLimit,
    // nothing in flight and nothing left to fetch
    Drained,
    // a precise trap: the faulting instruction did not commit
    Exception { pc: WordType, exception: Exception },
    // the operator quit in single step mode
    Quit,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Halted => write!(f, "HALT committed"),
            StopReason::CycleLimit => write!(f, "cycle limit reached"),
            StopReason::Drained => write!(f, "pipeline drained"),
            StopReason::Exception { pc, exception } => write!(f, "exception at pc={}: {}", pc, exception),
            StopReason::Quit => write!(f, "quit"),
        }
    }
}

/// Returned by the single step callback.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum StepControl {
    Continue,
    Quit,
}

/// The committed state of an architectural register. `valid` is false while an
/// in-flight instruction is going to write the register.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct ArchRegState {
    pub(crate) value: WordType,
    pub(crate) valid: bool,
}

pub(crate) struct CPU {
    pub(crate) backend: Backend,
    pub(crate) frontend: Frontend,
    pub(crate) memory_subsystem: MemorySubsystem,
    pub(crate) perf_counters: PerfCounters,
    cpu_config: CPUConfig,
    trace: Trace,
}

impl CPU {
    pub(crate) fn new(cpu_config: &CPUConfig) -> CPU {
        CPU {
            backend: Backend::new(cpu_config),
            frontend: Frontend::new(cpu_config),
            memory_subsystem: MemorySubsystem::new(cpu_config),
            perf_counters: PerfCounters::default(),
            cpu_config: cpu_config.clone(),
            trace: cpu_config.trace.clone(),
        }
    }

    /// Resets the machine and loads the program; the pc starts at the program's code base.
    pub(crate) fn init(&mut self, program: &Rc<Program>) {
        self.backend = Backend::new(&self.cpu_config);
        self.frontend.init(program);
        self.memory_subsystem.init();
        self.perf_counters = PerfCounters::default();
    }

    /// Advances the machine by one clock cycle.
    ///
    /// The backend runs first (commit, then the functional units from the last stage to the
    /// first, broadcast, issue and dispatch) and the frontend fetches last. So an instruction
    /// fetched in cycle N is dispatched in N+1 at the earliest, and a redirect in branch stage 2
    /// is visible to fetch in the same cycle.
    pub(crate) fn do_cycle(&mut self) -> Option<StopReason> {
        self.perf_counters.cycle_cnt += 1;

        let stop_reason = self.backend.do_cycle(&mut self.frontend.control, &mut self.memory_subsystem, &mut self.perf_counters);
        if stop_reason.is_none() {
            self.frontend.do_cycle(&mut self.perf_counters);
        }

        if self.trace.cycle {
            let perf_counters = &self.perf_counters;
            info!("[Cycles:{}][Decoded={}][Dispatched={}][Issued={}][Executed={}][Retired={}][IPC={:.2}]",
                  perf_counters.cycle_cnt,
                  perf_counters.decode_cnt,
                  perf_counters.dispatch_cnt,
                  perf_counters.issue_cnt,
                  perf_counters.execute_cnt,
                  perf_counters.retire_cnt,
                  perf_counters.ipc());
        }

        if stop_reason.is_some() {
            return stop_reason;
        }

        if self.backend.is_idle() && self.frontend.is_drained() {
            return Some(StopReason::Drained);
        }
        None
    }

    /// Runs the program until it stops or `max_cycles` is reached.
    pub(crate) fn run(&mut self, program: &Rc<Program>) -> StopReason {
        let max_cycles = self.cpu_config.max_cycles;
        self.run_for(program, max_cycles)
    }

    /// Runs the program for at most `cycles` cycles.
    pub(crate) fn run_for(&mut self, program: &Rc<Program>, cycles: u64) -> StopReason {
        self.init(program);
        self.run_loop(cycles, |_| StepControl::Continue)
    }

    /// Runs the program and calls `callback` after every cycle, including the cycle that
    /// ends the run. The callback can stop the simulation by returning `StepControl::Quit`.
    pub(crate) fn run_single_step<F>(&mut self, program: &Rc<Program>, callback: F) -> StopReason
        where F: FnMut(&CPU) -> StepControl {
        self.init(program);
        let max_cycles = self.cpu_config.max_cycles;
        self.run_loop(max_cycles, callback)
    }

    fn run_loop<F>(&mut self, cycles: u64, mut callback: F) -> StopReason
        where F: FnMut(&CPU) -> StepControl {
        let stop_reason = loop {
            if self.perf_counters.cycle_cnt >= cycles {
                break StopReason::CycleLimit;
            }

            if let Some(stop_reason) = self.do_cycle() {
                // the run is over, so the answer does not matter
                let _ = callback(self);
                break stop_reason;
            }

            if callback(self) == StepControl::Quit {
                break StopReason::Quit;
            }
        };

        info!("Simulation stopped after {} cycles: {}", self.perf_counters.cycle_cnt, stop_reason);
        stop_reason
    }

    pub(crate) fn arch_registers(&self) -> Vec<ArchRegState> {
        (0..self.cpu_config.arch_reg_count)
            .map(|arch_reg| {
                let (value, valid) = self.backend.arch_register(arch_reg);
                ArchRegState { value, valid }
            })
            .collect()
    }

    pub(crate) fn memory(&self) -> &[WordType] {
        &self.memory_subsystem.memory
    }

    pub(crate) fn zero_flag(&self) -> bool {
        self.backend.zero_flag
    }

    pub(crate) fn committed(&self) -> u64 {
        self.perf_counters.retire_cnt
    }

    pub(crate) fn cycles(&self) -> u64 {
        self.perf_counters.cycle_cnt
    }

    pub(crate) fn commit_log(&self) -> &[CommitRecord] {
        &self.backend.commit_log
    }

    // The address of the next instruction to fetch.
    pub(crate) fn pc(&self) -> WordType {
        self.frontend.control.pc
    }
}

struct ArgRegEntry {
    pub(crate) value: WordType,
}

/// The architectural register file; only written at commit.
pub struct ArgRegFile {
    entries: Vec<ArgRegEntry>,
}

impl ArgRegFile {
    pub(crate) fn new(count: u16) -> ArgRegFile {
        let mut array = Vec::with_capacity(count as usize);
        for _ in 0..count {
            array.push(ArgRegEntry { value: 0 });
        }

        ArgRegFile { entries: array }
    }

    pub fn get_value(&self, reg: RegisterType) -> WordType {
        return self.entries[reg as usize].value;
    }

    pub fn set_value(&mut self, reg: RegisterType, value: WordType) {
        let arch_reg = &mut self.entries[reg as usize];
        arch_reg.value = value;
    }
}
