use log::{debug, info};

use crate::backend::checkpoint::CheckpointTable;
use crate::backend::execution_unit::{effective_address, execute_integer, execute_multiply, resolve_control, EUTable};
use crate::backend::issue_queue::{FlagOperand, IQState, IssueQueue, IssueQueueEntry, SourceOperand};
use crate::backend::physical_register::PhysRegFile;
use crate::backend::register_alias_table::{FlagMapping, RAT};
use crate::backend::reorder_buffer::{Exception, ROB};
use crate::cpu::{ArgRegFile, CPUConfig, PerfCounters, StopReason, Trace};
use crate::frontend::frontend::{FetchedInstr, FrontendControl};
use crate::instructions::instructions::{Instr, Operand, RegisterType, UnitClass, WordType};
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;

/// A resource shortage that keeps dispatch from making progress this cycle.
/// Stalls are not errors; dispatch retries the same instruction next cycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum StallReason {
    FullReorderBuffer,
    FullIssueQueue,
    NoFreeRegister,
    NoFreeCheckpoint,
}

enum CDBBroadcast {
    Register { phys_reg: RegisterType, value: WordType },
    Flag { seq: u64, value: bool },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct CommitRecord {
    pub(crate) seq: u64,
    pub(crate) pc: WordType,
    pub(crate) instr: Instr,
    pub(crate) cycle: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Recovery {
    pub(crate) branch_seq: u64,
    pub(crate) checkpoint: u16,
    pub(crate) target: WordType,
    pub(crate) flushed: u16,
}

pub(crate) struct Backend {
    pub(crate) phys_reg_file: PhysRegFile,
    pub(crate) rat: RAT,
    pub(crate) rob: ROB,
    pub(crate) iq: IssueQueue,
    pub(crate) checkpoints: CheckpointTable,
    pub(crate) eu_table: EUTable,
    // the committed architectural state
    pub(crate) arch_reg_file: ArgRegFile,
    pub(crate) zero_flag: bool,
    pub(crate) commit_log: Vec<CommitRecord>,
    pub(crate) last_recovery: Option<Recovery>,
    trace: Trace,
    cdb_broadcast_buffer: Vec<CDBBroadcast>,
}

impl Backend {
    pub(crate) fn new(cpu_config: &CPUConfig) -> Backend {
        let mut phys_reg_file = PhysRegFile::new(cpu_config.phys_reg_count);

        // the initial mappings: arch register i lives in phys register i and holds 0
        for arch_reg in 0..cpu_config.arch_reg_count {
            match phys_reg_file.allocate(0) {
                Ok(phys_reg) => {
                    debug_assert!(phys_reg == arch_reg);
                    phys_reg_file.write(phys_reg, 0);
                }
                Err(reason) => panic!("Can't map the architectural registers: {:?}", reason),
            }
        }

        Backend {
            phys_reg_file,
            rat: RAT::new(cpu_config.arch_reg_count),
            rob: ROB::new(cpu_config.rob_capacity),
            iq: IssueQueue::new(cpu_config.iq_capacity),
            checkpoints: CheckpointTable::new(cpu_config.checkpoint_count),
            eu_table: EUTable::new(cpu_config.mul_latency),
            arch_reg_file: ArgRegFile::new(cpu_config.arch_reg_count),
            zero_flag: false,
            commit_log: Vec::new(),
            last_recovery: None,
            trace: cpu_config.trace.clone(),
            cdb_broadcast_buffer: Vec::with_capacity(4),
        }
    }

    /// Runs one clock cycle. The stages are evaluated in a fixed order:
    ///
    /// commit, branch stage 2, branch stage 1, memory stage 2, memory stage 1,
    /// multiplier, integer, cdb broadcast, issue, dispatch.
    ///
    /// Later pipeline stages run before earlier ones, so a value produced this cycle is
    /// visible to an instruction issuing or dispatching in the same cycle, and a
    /// recovery is complete before any other stage looks at the state.
    pub(crate) fn do_cycle(&mut self,
                           frontend_control: &mut FrontendControl,
                           memory_subsystem: &mut MemorySubsystem,
                           perf_counters: &mut PerfCounters) -> Option<StopReason> {
        if let Some(stop_reason) = self.cycle_retire(perf_counters) {
            return Some(stop_reason);
        }
        self.cycle_branch_redirect(frontend_control, perf_counters);
        self.cycle_branch_resolve();
        self.cycle_memory_access(memory_subsystem, perf_counters);
        self.cycle_memory_address();
        self.cycle_multiplier(perf_counters);
        self.cycle_integer(perf_counters);
        debug_assert!(self.cdb_broadcast_buffer.len() <= 4);
        self.cdb_broadcast();
        self.cycle_issue(perf_counters);
        self.cycle_dispatch(frontend_control, perf_counters);
        None
    }

    // True when no instruction is in flight.
    pub(crate) fn is_idle(&self) -> bool {
        let idle = self.rob.is_empty();
        debug_assert!(!idle || (self.iq.size() == 0 && self.eu_table.is_idle()));
        idle
    }

    /// The committed value of an architectural register, and whether no in-flight
    /// instruction is still going to write it.
    pub(crate) fn arch_register(&self, arch_reg: RegisterType) -> (WordType, bool) {
        let valid = !self.rob.iter().any(|rob_slot| rob_slot.arch_dest == Some(arch_reg));
        return (self.arch_reg_file.get_value(arch_reg), valid);
    }

    fn cycle_retire(&mut self, perf_counters: &mut PerfCounters) -> Option<StopReason> {
        if !self.rob.head_has_completed() {
            return None;
        }

        let (pc, exception) = {
            let head = self.rob.head()?;
            (head.pc, head.exception)
        };

        // precise trap: nothing younger has committed and the faulting instruction doesn't either
        if let Some(exception) = exception {
            info!("Exception at pc={}: {}", pc, exception);
            return Some(StopReason::Exception { pc, exception });
        }

        let rob_slot = self.rob.retire();
        let instr = match rob_slot.instr {
            Some(instr) => instr,
            None => panic!("Retiring ROB slot {} without an instruction", rob_slot.seq),
        };

        if let (Some(arch_reg), Some(phys_reg)) = (rob_slot.arch_dest, rob_slot.dest) {
            let phys_reg_entry = self.phys_reg_file.get(phys_reg);
            debug_assert!(phys_reg_entry.has_value, "Retiring [{}] before its result is written", instr);
            self.arch_reg_file.set_value(arch_reg, phys_reg_entry.value);

            // the instruction remapped arch_reg, so nothing can see the previous mapping anymore
            if let Some(prev_phys) = rob_slot.prev_phys {
                debug_assert!(self.rat.get(arch_reg) != prev_phys);
                self.phys_reg_file.deallocate(prev_phys);
            }
        }

        if let Some(flag) = rob_slot.flag {
            self.zero_flag = flag;
            if self.rat.flag() == FlagMapping::Pending(rob_slot.seq) {
                self.rat.set_flag_committed();
            }
        }

        perf_counters.retire_cnt += 1;
        self.commit_log.push(CommitRecord { seq: rob_slot.seq, pc: rob_slot.pc, instr, cycle: perf_counters.cycle_cnt });

        if self.trace.retire {
            match rob_slot.mem_address {
                Some(address) => info!("Retired [{}] pc={} address={}", instr, rob_slot.pc, address),
                None => info!("Retired [{}] pc={}", instr, rob_slot.pc),
            }
        }

        if instr.is_halt() {
            return Some(StopReason::Halted);
        }
        None
    }

    // Branch stage 2: the single point where the pc is redirected.
    fn cycle_branch_redirect(&mut self, frontend_control: &mut FrontendControl, perf_counters: &mut PerfCounters) {
        let in_flight = match self.eu_table.branch_redirect.take() {
            None => return,
            Some(in_flight) => in_flight,
        };
        let entry = in_flight.entry;
        let resolution = match in_flight.resolution {
            Some(resolution) => resolution,
            None => panic!("[{}] reached branch stage 2 unresolved", entry.instr),
        };
        let checkpoint = match entry.checkpoint {
            Some(checkpoint) => checkpoint,
            None => panic!("[{}] has no checkpoint", entry.instr),
        };
        debug_assert_eq!(self.rob.get(entry.seq).checkpoint, Some(checkpoint));

        if resolution.taken {
            perf_counters.branch_taken_cnt += 1;
            self.recover(entry.seq, checkpoint, resolution.target, frontend_control, perf_counters);
        } else {
            perf_counters.branch_not_taken_cnt += 1;
            self.checkpoints.release(checkpoint);
        }

        if self.trace.execute {
            info!("Executed [{}] taken={} target={}", entry.instr, resolution.taken, resolution.target);
        }
        self.finish(entry.seq, perf_counters);
    }

    /// Rolls back everything younger than the branch. All steps complete before any
    /// later stage of this cycle runs.
    fn recover(&mut self,
               branch_seq: u64,
               checkpoint_id: u16,
               target: WordType,
               frontend_control: &mut FrontendControl,
               perf_counters: &mut PerfCounters) {
        self.iq.flush_younger_than(branch_seq);
        self.eu_table.flush_younger_than(branch_seq);
        let flushed = self.rob.truncate_after(branch_seq);

        let checkpoint = self.checkpoints.get(checkpoint_id);
        debug_assert!(checkpoint.branch_seq == branch_seq);
        self.rat = checkpoint.rat.clone();

        // the flag producer may have committed after the checkpoint was taken
        if let FlagMapping::Pending(producer) = self.rat.flag() {
            if !self.rob.contains(producer) {
                self.rat.set_flag_committed();
            }
        }

        // register values are not restored; only the registers of flushed instructions are released
        self.phys_reg_file.release_younger_than(branch_seq);
        self.checkpoints.release_younger_than(branch_seq);
        self.checkpoints.release(checkpoint_id);

        frontend_control.redirect(target);

        perf_counters.pipeline_flushes += 1;
        perf_counters.bad_speculation_cnt += flushed as u64;
        self.last_recovery = Some(Recovery { branch_seq, checkpoint: checkpoint_id, target, flushed });

        if self.trace.flush {
            info!("Pipeline flush: {} instruction(s) after seq {} discarded, fetch redirected to {}", flushed, branch_seq, target);
        }
    }

    // Branch stage 1: resolves the outcome; JAL writes the return address.
    fn cycle_branch_resolve(&mut self) {
        debug_assert!(self.eu_table.branch_redirect.is_idle());

        let mut in_flight = match self.eu_table.branch_resolve.take() {
            None => return,
            Some(in_flight) => in_flight,
        };
        let entry = in_flight.entry;

        let resolution = resolve_control(&entry.instr, entry.pc, entry.source[0].value(), entry.source[1].value(), entry.flag.value());
        if let (Some(link), Some(dest)) = (resolution.link, entry.dest) {
            self.write_register(dest, link);
        }

        in_flight.resolution = Some(resolution);
        self.eu_table.branch_redirect.accept(in_flight);
    }

    // Memory stage 2: the actual memory access.
    fn cycle_memory_access(&mut self, memory_subsystem: &mut MemorySubsystem, perf_counters: &mut PerfCounters) {
        let in_flight = match self.eu_table.memory_access.take() {
            None => return,
            Some(in_flight) => in_flight,
        };
        let entry = in_flight.entry;
        let address = match in_flight.address {
            Some(address) => address,
            None => panic!("[{}] reached memory stage 2 without an address", entry.instr),
        };

        let result = match entry.instr {
            Instr::Load { .. } => memory_subsystem.load(address).map(Some),
            Instr::Store { .. } => memory_subsystem.store(address, entry.store_data.value()).map(|_| None),
            _ => panic!("[{}] is not a memory instruction", entry.instr),
        };

        match result {
            Ok(Some(value)) => {
                if let Some(dest) = entry.dest {
                    self.write_register(dest, value);
                }
            }
            Ok(None) => {}
            Err(exception) => self.raise(entry.seq, exception),
        }

        if self.trace.execute {
            info!("Executed [{}] address={}", entry.instr, address);
        }
        self.finish(entry.seq, perf_counters);
    }

    // Memory stage 1: address computation. A store waits here until its data is available.
    fn cycle_memory_address(&mut self) {
        debug_assert!(self.eu_table.memory_access.is_idle());

        let (seq, address) = {
            let in_flight = match self.eu_table.memory_address.occupant_mut() {
                None => return,
                Some(in_flight) => in_flight,
            };

            if let SourceOperand::Waiting(phys_reg) = in_flight.entry.store_data {
                let phys_reg_entry = self.phys_reg_file.get(phys_reg);
                if !phys_reg_entry.has_value {
                    debug!("Memory stage 1 bubble: store data P{} of [{}] is not ready", phys_reg, in_flight.entry.instr);
                    return;
                }
                in_flight.entry.store_data = SourceOperand::Ready(phys_reg_entry.value);
            }

            let address = effective_address(in_flight.entry.source[0].value(), in_flight.entry.source[1].value());
            in_flight.address = Some(address);
            (in_flight.entry.seq, address)
        };

        self.rob.get_mut(seq).mem_address = Some(address);
        if let Some(in_flight) = self.eu_table.memory_address.take() {
            self.eu_table.memory_access.accept(in_flight);
        }
    }

    fn cycle_multiplier(&mut self, perf_counters: &mut PerfCounters) {
        let eu = &mut self.eu_table.multiplier;
        if eu.is_idle() {
            return;
        }

        eu.cycles_remaining -= 1;
        if eu.cycles_remaining > 0 {
            // the multiplier isn't finished with its work
            return;
        }

        let entry = match eu.take() {
            None => return,
            Some(in_flight) => in_flight.entry,
        };

        let value = execute_multiply(entry.source[0].value(), entry.source[1].value());
        if let Some(dest) = entry.dest {
            self.write_register(dest, value);
        }

        if self.trace.execute {
            info!("Executed [{}] result={}", entry.instr, value);
        }
        self.finish(entry.seq, perf_counters);
    }

    fn cycle_integer(&mut self, perf_counters: &mut PerfCounters) {
        let entry = match self.eu_table.integer.take() {
            None => return,
            Some(in_flight) => in_flight.entry,
        };

        match execute_integer(&entry.instr, entry.source[0].value(), entry.source[1].value()) {
            Ok(outcome) => {
                if let (Some(dest), Some(value)) = (entry.dest, outcome.value) {
                    self.write_register(dest, value);
                }
                if let Some(flag) = outcome.flag {
                    self.rob.get_mut(entry.seq).flag = Some(flag);
                    self.cdb_broadcast_buffer.push(CDBBroadcast::Flag { seq: entry.seq, value: flag });
                }
                if self.trace.execute {
                    info!("Executed [{}] result={:?} flag={:?}", entry.instr, outcome.value, outcome.flag);
                }
            }
            Err(exception) => self.raise(entry.seq, exception),
        }

        self.finish(entry.seq, perf_counters);
    }

    fn write_register(&mut self, phys_reg: RegisterType, value: WordType) {
        self.phys_reg_file.write(phys_reg, value);
        self.cdb_broadcast_buffer.push(CDBBroadcast::Register { phys_reg, value });
    }

    fn raise(&mut self, seq: u64, exception: Exception) {
        debug!("seq {} raised: {}", seq, exception);
        self.rob.get_mut(seq).exception = Some(exception);
    }

    fn finish(&mut self, seq: u64, perf_counters: &mut PerfCounters) {
        self.rob.complete(seq);
        perf_counters.execute_cnt += 1;
    }

    // Wakes up the waiting issue queue entries.
    fn cdb_broadcast(&mut self) {
        for broadcast in self.cdb_broadcast_buffer.drain(..) {
            match broadcast {
                CDBBroadcast::Register { phys_reg, value } => self.iq.wakeup(phys_reg, value),
                CDBBroadcast::Flag { seq, value } => self.iq.wakeup_flag(seq, value),
            }
        }
    }

    // Moves ready instructions, oldest first, into the free functional units.
    fn cycle_issue(&mut self, perf_counters: &mut PerfCounters) {
        let mut integer_free = self.eu_table.integer.is_idle();
        let mut multiplier_free = self.eu_table.multiplier.is_idle();
        let mut memory_free = self.eu_table.memory_address.is_idle();
        let mut branch_free = self.eu_table.branch_resolve.is_idle();
        let mul_latency = self.eu_table.mul_latency;
        let head_seq = self.rob.head_seq();

        for index in 0..self.iq.size() as usize {
            if !(integer_free || multiplier_free || memory_free || branch_free) {
                break;
            }

            let entry = self.iq.get_mut(index);
            if !entry.is_ready() {
                continue;
            }

            let (eu, cycles) = match entry.instr.unit_class() {
                UnitClass::Integer if integer_free => {
                    integer_free = false;
                    (&mut self.eu_table.integer, 1)
                }
                UnitClass::Multiplier if multiplier_free => {
                    multiplier_free = false;
                    (&mut self.eu_table.multiplier, mul_latency)
                }
                // memory instructions only issue when they are the oldest instruction in flight
                UnitClass::Memory if memory_free && head_seq == Some(entry.seq) => {
                    memory_free = false;
                    (&mut self.eu_table.memory_address, 1)
                }
                UnitClass::Branch if branch_free => {
                    branch_free = false;
                    (&mut self.eu_table.branch_resolve, 1)
                }
                _ => continue,
            };

            entry.state = IQState::ISSUED;
            eu.issue(*entry, cycles);
            perf_counters.issue_cnt += 1;

            if self.trace.issue {
                info!("Issued [{}] to {}", entry, eu.name);
            }
        }

        self.iq.compact();
    }

    fn cycle_dispatch(&mut self, frontend_control: &mut FrontendControl, perf_counters: &mut PerfCounters) {
        let fetched = match frontend_control.decode_latch {
            None => return,
            Some(fetched) => fetched,
        };

        match self.dispatch(&fetched) {
            Ok(seq) => {
                frontend_control.decode_latch = None;
                perf_counters.dispatch_cnt += 1;
                if self.trace.dispatch {
                    info!("Dispatched [{}] seq={}", fetched.instr, seq);
                }
            }
            Err(reason) => {
                // the instruction stays in the decode latch, so fetch doesn't advance
                perf_counters.record_stall(reason);
                debug!("Dispatch of [{}] stalled: {:?}", fetched.instr, reason);
            }
        }
    }

    fn can_dispatch(&self, instr: &Instr) -> Result<(), StallReason> {
        if !self.rob.has_space() {
            return Err(StallReason::FullReorderBuffer);
        }
        if !self.iq.has_space() {
            return Err(StallReason::FullIssueQueue);
        }
        if instr.dest().is_some() && !self.phys_reg_file.has_free() {
            return Err(StallReason::NoFreeRegister);
        }
        if instr.is_control() && !self.checkpoints.has_free() {
            return Err(StallReason::NoFreeCheckpoint);
        }
        Ok(())
    }

    fn dispatch(&mut self, fetched: &FetchedInstr) -> Result<u64, StallReason> {
        let instr = fetched.instr;

        // nothing is modified unless every resource is available
        self.can_dispatch(&instr)?;

        let seq = self.rob.allocate(fetched.pc, instr);

        // sources are renamed before the destination: ADD R0,R0,R1 reads the old R0
        let operands = instr.operands();
        let source = [self.rename_operand(operands[0]), self.rename_operand(operands[1])];
        let store_data = match instr.store_data() {
            Some(arch_reg) => self.rename_source(arch_reg),
            None => SourceOperand::Unused,
        };
        let flag = if instr.reads_flag() { self.rename_flag() } else { FlagOperand::Unused };

        let mut dest = None;
        if let Some(arch_reg) = instr.dest() {
            let phys_reg = self.phys_reg_file.allocate(seq)?;
            let prev_phys = self.rat.rename(arch_reg, phys_reg);

            let rob_slot = self.rob.get_mut(seq);
            rob_slot.dest = Some(phys_reg);
            rob_slot.arch_dest = Some(arch_reg);
            rob_slot.prev_phys = Some(prev_phys);
            dest = Some(phys_reg);
        }

        if instr.sets_flag() {
            self.rat.set_flag_producer(seq);
        }

        // the checkpoint includes the rename of the instruction's own destination (JAL)
        let branch_tag = self.checkpoints.youngest();
        let mut checkpoint = None;
        if instr.is_control() {
            let id = self.checkpoints.take(&self.rat, seq)?;
            self.rob.get_mut(seq).checkpoint = Some(id);
            checkpoint = Some(id);
        }

        self.iq.insert(IssueQueueEntry {
            seq,
            pc: fetched.pc,
            instr,
            source,
            store_data,
            flag,
            dest,
            branch_tag,
            checkpoint,
            state: IQState::WAITING,
        });

        return Ok(seq);
    }

    fn rename_operand(&self, operand: Option<Operand>) -> SourceOperand {
        match operand {
            None => SourceOperand::Unused,
            Some(Operand::Immediate(value)) => SourceOperand::Ready(value),
            Some(Operand::Register(arch_reg)) => self.rename_source(arch_reg),
        }
    }

    fn rename_source(&self, arch_reg: RegisterType) -> SourceOperand {
        let phys_reg = self.rat.get(arch_reg);
        let phys_reg_entry = self.phys_reg_file.get(phys_reg);
        if phys_reg_entry.has_value {
            SourceOperand::Ready(phys_reg_entry.value)
        } else {
            // cdb broadcast will update
            SourceOperand::Waiting(phys_reg)
        }
    }

    fn rename_flag(&self) -> FlagOperand {
        match self.rat.flag() {
            FlagMapping::Committed => FlagOperand::Ready(self.zero_flag),
            FlagMapping::Pending(producer) => match self.rob.get(producer).flag {
                Some(value) => FlagOperand::Ready(value),
                None => FlagOperand::Waiting(producer),
            },
        }
    }

    /// Checks the structural invariants of the renaming state and the buffers.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        use crate::backend::reorder_buffer::ROBSlotState;

        let mappings = self.rat.mappings();

        // every architectural register maps to its own, allocated physical register
        for (arch_reg, &phys_reg) in mappings.iter().enumerate() {
            assert!(!self.phys_reg_file.is_free(phys_reg), "R{} maps to free P{}", arch_reg, phys_reg);
            assert_eq!(mappings.iter().filter(|&&other| other == phys_reg).count(), 1, "P{} is mapped more than once", phys_reg);
        }

        // no leaks: every in-flight writer holds exactly one register on top of the mapped ones
        let writers = self.rob.iter().filter(|slot| slot.dest.is_some()).count() as u16;
        let busy = self.phys_reg_file.capacity() - self.phys_reg_file.free_count();
        assert_eq!(busy, self.rat.len() + writers, "physical registers leaked");

        let mut previous = 0;
        for slot in self.rob.iter() {
            assert!(slot.seq > previous, "ROB is out of order");
            assert!(slot.state != ROBSlotState::UNUSED);
            previous = slot.seq;
        }

        for entry in self.iq.iter() {
            assert!(self.rob.contains(entry.seq), "IQ entry seq {} is not in the ROB", entry.seq);
            assert_eq!(entry.state, IQState::WAITING);
        }

        for eu in self.eu_table.units() {
            if let Some(in_flight) = eu.occupant() {
                assert!(self.rob.contains(in_flight.entry.seq), "{} holds seq {} which is not in the ROB", eu.name, in_flight.entry.seq);
            }
        }

        // a checkpoint lives exactly as long as its control instruction is unresolved
        let unresolved = self.rob.iter()
            .filter(|slot| slot.state == ROBSlotState::PENDING && slot.instr.map_or(false, |instr| instr.is_control()))
            .count() as u16;
        assert_eq!(self.checkpoints.live_count(), unresolved);
    }
}
