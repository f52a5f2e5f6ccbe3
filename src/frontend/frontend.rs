use std::rc::Rc;

use log::info;

use crate::cpu::{CPUConfig, PerfCounters, Trace};
use crate::instructions::instructions::{Instr, Program, WordType, INSTR_SIZE};

/// An instruction sitting in the decode latch between fetch and dispatch.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct FetchedInstr {
    pub(crate) pc: WordType,
    pub(crate) instr: Instr,
}

/// The state shared by fetch and the backend: the backend consumes the decode latch and
/// redirects the pc when a branch is taken.
pub(crate) struct FrontendControl {
    pub(crate) pc: WordType,
    pub(crate) decode_latch: Option<FetchedInstr>,
    // set after a HALT is fetched; fetching resumes only after a redirect
    pub(crate) halted: bool,
    pub(crate) suppress_fetch: bool,
}

impl FrontendControl {
    fn new(pc: WordType) -> Self {
        FrontendControl { pc, decode_latch: None, halted: false, suppress_fetch: false }
    }

    // Any instruction in the decode latch is on the wrong path.
    pub(crate) fn redirect(&mut self, target: WordType) {
        self.pc = target;
        self.decode_latch = None;
        self.halted = false;
        self.suppress_fetch = true;
    }
}

pub(crate) struct Frontend {
    pub(crate) control: FrontendControl,
    program_option: Option<Rc<Program>>,
    trace: Trace,
}

impl Frontend {
    pub(crate) fn new(cpu_config: &CPUConfig) -> Frontend {
        Frontend {
            control: FrontendControl::new(cpu_config.code_base),
            program_option: None,
            trace: cpu_config.trace.clone(),
        }
    }

    pub(crate) fn init(&mut self, program: &Rc<Program>) {
        self.program_option = Some(Rc::clone(program));
        self.control = FrontendControl::new(program.code_base);
    }

    // True when there is nothing left to fetch or decode.
    pub(crate) fn is_drained(&self) -> bool {
        if self.control.decode_latch.is_some() || self.control.suppress_fetch {
            return false;
        }
        match &self.program_option {
            None => true,
            Some(program) => self.control.halted || program.get_instr(self.control.pc).is_none(),
        }
    }

    pub(crate) fn do_cycle(&mut self, perf_counters: &mut PerfCounters) {
        let program = match &self.program_option {
            None => return,
            Some(program) => program,
        };
        let control = &mut self.control;

        if control.suppress_fetch {
            control.suppress_fetch = false;
            return;
        }

        // dispatch did not consume the previous instruction; the pc stays put
        if control.halted || control.decode_latch.is_some() {
            return;
        }

        let pc = control.pc;
        let instr = match program.get_instr(pc) {
            None => return,
            Some(instr) => instr,
        };

        if self.trace.fetch {
            info!("Fetched [{}] pc={}", instr, pc);
        }

        control.decode_latch = Some(FetchedInstr { pc, instr });
        control.pc = pc + INSTR_SIZE;
        perf_counters.decode_cnt += 1;

        if instr.is_halt() {
            control.halted = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frontend(code: Vec<Instr>) -> (Frontend, PerfCounters) {
        let cpu_config = CPUConfig::default();
        let mut frontend = Frontend::new(&cpu_config);
        frontend.init(&Rc::new(Program::new(code, cpu_config.code_base)));
        (frontend, PerfCounters::default())
    }

    #[test]
    fn test_fetch_stalls_on_full_latch() {
        let (mut frontend, mut perf_counters) = frontend(vec![Instr::Nop, Instr::Nop]);
        frontend.do_cycle(&mut perf_counters);
        assert_eq!(frontend.control.decode_latch, Some(FetchedInstr { pc: 4000, instr: Instr::Nop }));
        assert_eq!(frontend.control.pc, 4004);

        // nobody consumed the latch
        frontend.do_cycle(&mut perf_counters);
        assert_eq!(frontend.control.pc, 4004);
        assert_eq!(perf_counters.decode_cnt, 1);
    }

    #[test]
    fn test_fetch_stops_after_halt() {
        let (mut frontend, mut perf_counters) = frontend(vec![Instr::Halt, Instr::Nop]);
        frontend.do_cycle(&mut perf_counters);
        frontend.control.decode_latch = None;
        frontend.do_cycle(&mut perf_counters);
        assert!(frontend.control.decode_latch.is_none());
        assert!(frontend.is_drained());
    }

    #[test]
    fn test_redirect_suppresses_one_cycle() {
        let (mut frontend, mut perf_counters) = frontend(vec![Instr::Nop, Instr::Nop, Instr::Halt]);
        frontend.do_cycle(&mut perf_counters);
        frontend.control.redirect(4008);
        assert!(frontend.control.decode_latch.is_none());

        frontend.do_cycle(&mut perf_counters);
        assert!(frontend.control.decode_latch.is_none());

        frontend.do_cycle(&mut perf_counters);
        assert_eq!(frontend.control.decode_latch, Some(FetchedInstr { pc: 4008, instr: Instr::Halt }));
    }
}
