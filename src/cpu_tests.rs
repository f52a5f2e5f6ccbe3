use std::rc::Rc;

use crate::cpu::{CPU, CPUConfig, StepControl, StopReason};
use crate::instructions::instructions::{Program, RegisterType, WordType};

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use crate::backend::reorder_buffer::Exception;
    use crate::instructions::instructions::Instr;
    use crate::loader::loader::{load_from_string, LoadError};

    use super::*;

    #[test]
    fn test_straight_line() {
        let src = r#"
MOVC R0,#5
MOVC R1,#0
ADD R2,R0,R1
HALT
"#;
        let mut harness = TestHarness::default();
        assert_eq!(harness.run(src), StopReason::Halted);
        harness.assert_reg_value(0, 5);
        harness.assert_reg_value(1, 0);
        harness.assert_reg_value(2, 5);

        let cpu = &harness.cpu;
        assert_eq!(cpu.committed(), 4);
        assert_eq!(cpu.commit_log().last().map(|record| record.instr), Some(Instr::Halt));
        assert_eq!(cpu.cycles(), 8);
        assert!(cpu.arch_registers().iter().all(|reg| reg.valid));
    }

    #[test]
    fn test_taken_branch_discards_wrong_path() {
        let src = r#"
MOVC R0,#10
MOVC R1,#10
CMP R0,R1
BZ,#8
MOVC R2,#99     ; wrong path
MOVC R2,#1
"#;
        let mut harness = TestHarness::default();
        assert_eq!(harness.run(src), StopReason::Drained);
        harness.assert_reg_value(2, 1);
        assert!(harness.cpu.zero_flag());
        assert_eq!(harness.committed_pcs(), vec![4000, 4004, 4008, 4012, 4020]);

        let perf_counters = &harness.cpu.perf_counters;
        assert_eq!(perf_counters.branch_taken_cnt, 1);
        assert_eq!(perf_counters.pipeline_flushes, 1);
        assert!(perf_counters.bad_speculation_cnt >= 1);
    }

    #[test]
    fn test_full_rob_stalls_fetch() {
        let src = r#"
MOVC R0,#1
MOVC R1,#2
MOVC R2,#3
HALT
"#;
        let mut cpu_config = TestHarness::new_test_cpu_config();
        cpu_config.iq_capacity = 2;
        cpu_config.rob_capacity = 2;
        let mut harness = TestHarness::with_config(cpu_config);
        let program = harness.load_program(src);

        let mut stalls = 0;
        let mut pc = 4000;
        let stop_reason = harness.cpu.run_single_step(&program, |cpu| {
            cpu.backend.assert_invariants();
            assert!(cpu.backend.rob.size() <= 2);
            let perf_counters = &cpu.perf_counters;
            let now = perf_counters.stall_rob_full_cnt + perf_counters.stall_iq_full_cnt;
            if now > stalls {
                // the stalled instruction stays in the decode latch
                assert_eq!(cpu.pc(), pc);
            }
            stalls = now;
            pc = cpu.pc();
            StepControl::Continue
        });

        assert_eq!(stop_reason, StopReason::Halted);
        assert!(stalls > 0);
        harness.assert_reg_value(0, 1);
        harness.assert_reg_value(1, 2);
        harness.assert_reg_value(2, 3);
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(5)]
    fn test_multiplier_latency(#[case] mul_latency: u8) {
        let src = r#"
MOVC R0,#3
MOVC R1,#4
MUL R2,R0,R1
MUL R3,R0,R1
HALT
"#;
        let mut cpu_config = TestHarness::new_test_cpu_config();
        cpu_config.mul_latency = mul_latency;
        let mut harness = TestHarness::with_config(cpu_config);
        assert_eq!(harness.run(src), StopReason::Halted);
        harness.assert_reg_value(2, 12);
        harness.assert_reg_value(3, 12);

        let cycles: Vec<u64> = harness.cpu.commit_log().iter()
            .filter(|record| matches!(record.instr, Instr::Mul { .. }))
            .map(|record| record.cycle)
            .collect();
        assert_eq!(cycles.len(), 2);
        assert_eq!(cycles[1] - cycles[0], mul_latency as u64);
    }

    #[rstest]
    #[case("ADD R2,R0,R1", 12)]
    #[case("SUB R2,R0,R1", 2)]
    #[case("ADDL R2,R0,#-10", -3)]
    #[case("SUBL R2,R0,#7", 0)]
    #[case("AND R2,R0,R1", 5)]
    #[case("OR R2,R0,R1", 7)]
    #[case("XOR R2,R0,R1", 2)]
    #[case("MUL R2,R0,R1", 35)]
    #[case("DIV R2,R0,R1", 1)]
    fn test_arithmetic(#[case] line: &str, #[case] expected: WordType) {
        let src = format!("MOVC R0,#7\nMOVC R1,#5\n{}\nHALT\n", line);
        let mut harness = TestHarness::default();
        assert_eq!(harness.run(&src), StopReason::Halted);
        harness.assert_reg_value(2, expected);
    }

    #[test]
    fn test_same_src_dst_reg() {
        let src = r#"
MOVC R0,#5
ADDL R0,R0,#10
ADDL R0,R0,#1
HALT
"#;
        let mut harness = TestHarness::default();
        harness.run(src);
        harness.assert_reg_value(0, 16);
    }

    #[test]
    fn test_load_store() {
        let src = r#"
MOVC R0,#42
MOVC R1,#100
STORE R0,R1,#4
LOAD R2,R1,#4
HALT
"#;
        let mut harness = TestHarness::default();
        assert_eq!(harness.run(src), StopReason::Halted);
        harness.assert_mem_value(104, 42);
        harness.assert_reg_value(2, 42);
    }

    #[test]
    fn test_indexed_load_store() {
        let src = r#"
MOVC R0,#7
MOVC R1,#10
MOVC R3,#5
STR R0,R1,R3
LDR R2,R1,R3
HALT
"#;
        let mut harness = TestHarness::default();
        assert_eq!(harness.run(src), StopReason::Halted);
        harness.assert_mem_value(15, 7);
        harness.assert_reg_value(2, 7);
    }

    #[test]
    fn test_store_of_multiplier_result() {
        let src = r#"
MOVC R0,#3
MUL R4,R0,R0
MOVC R1,#20
STORE R4,R1,#0
HALT
"#;
        let mut harness = TestHarness::default();
        assert_eq!(harness.run(src), StopReason::Halted);
        harness.assert_mem_value(20, 9);
    }

    #[test]
    fn test_loop() {
        let src = r#"
MOVC R0,#5      ; counter
MOVC R1,#0      ; sum
MOVC R2,#1
ADD R1,R1,R0    ; loop
SUB R0,R0,R2
BNZ,#-8
HALT
"#;
        let mut harness = TestHarness::default();
        assert_eq!(harness.run(src), StopReason::Halted);
        harness.assert_reg_value(0, 0);
        harness.assert_reg_value(1, 15);
        assert!(harness.cpu.zero_flag());

        let mut expected = vec![4000, 4004, 4008];
        for _ in 0..5 {
            expected.extend([4012, 4016, 4020]);
        }
        expected.push(4024);
        assert_eq!(harness.committed_pcs(), expected);

        let perf_counters = &harness.cpu.perf_counters;
        assert_eq!(perf_counters.branch_taken_cnt, 4);
        assert_eq!(perf_counters.branch_not_taken_cnt, 1);
        assert_eq!(perf_counters.pipeline_flushes, 4);
    }

    #[test]
    fn test_commit_log_in_order() {
        let src = r#"
MOVC R0,#5
MOVC R2,#1
MUL R3,R0,R0
SUB R0,R0,R2
BNZ,#-8
HALT
"#;
        let mut harness = TestHarness::default();
        assert_eq!(harness.run(src), StopReason::Halted);
        harness.assert_reg_value(3, 1);

        let log = harness.cpu.commit_log();
        for pair in log.windows(2) {
            assert!(pair[0].seq < pair[1].seq);
            assert!(pair[0].cycle < pair[1].cycle);
        }
    }

    #[test]
    fn test_jal_and_jump() {
        let src = r#"
MOVC R5,#4016
JAL R6,R5,#0    ; call 4016
MOVC R1,#99     ; skipped
HALT
MOVC R2,#7
JUMP R6,#4      ; return past the skipped instruction
"#;
        let mut harness = TestHarness::default();
        assert_eq!(harness.run(src), StopReason::Halted);
        harness.assert_reg_value(6, 4008);
        harness.assert_reg_value(2, 7);
        harness.assert_reg_value(1, 0);
        assert_eq!(harness.committed_pcs(), vec![4000, 4004, 4016, 4020, 4012]);
    }

    #[test]
    fn test_halt_on_wrong_path() {
        let src = r#"
MOVC R0,#0
MOVC R1,#0
CMP R0,R1
BZ,#8
HALT            ; wrong path
MOVC R3,#5
HALT
"#;
        let mut harness = TestHarness::default();
        assert_eq!(harness.run(src), StopReason::Halted);
        harness.assert_reg_value(3, 5);
    }

    #[test]
    fn test_older_result_survives_recovery() {
        let src = r#"
MOVC R0,#6
MOVC R1,#7
MUL R2,R0,R1
BNZ,#8
MOVC R2,#99     ; wrong path
ADD R3,R2,R2
HALT
"#;
        let mut harness = TestHarness::default();
        assert_eq!(harness.run(src), StopReason::Halted);
        harness.assert_reg_value(2, 42);
        harness.assert_reg_value(3, 84);
    }

    #[test]
    fn test_flush_completeness() {
        let src = r#"
MOVC R0,#3
MOVC R2,#1
MUL R4,R0,R0
SUB R0,R0,R2
BNZ,#-8
MOVC R5,#1
HALT
"#;
        let mut harness = TestHarness::default();
        let program = harness.load_program(src);

        let mut flushes = 0;
        let stop_reason = harness.cpu.run_single_step(&program, |cpu| {
            cpu.backend.assert_invariants();
            if cpu.perf_counters.pipeline_flushes > flushes {
                flushes = cpu.perf_counters.pipeline_flushes;
                let recovery = match cpu.backend.last_recovery {
                    Some(recovery) => recovery,
                    None => panic!("flush without recovery"),
                };
                let branch_seq = recovery.branch_seq;
                assert!(recovery.flushed >= 1);
                assert!(recovery.checkpoint < 4);
                assert!(cpu.backend.iq.iter().all(|entry| entry.seq <= branch_seq));
                for eu in cpu.backend.eu_table.units() {
                    assert!(eu.occupant().map_or(true, |in_flight| in_flight.entry.seq <= branch_seq));
                }
                assert_eq!(cpu.backend.rob.tail_seq(), branch_seq + 1);
                assert_eq!(cpu.frontend.control.decode_latch, None);
                assert_eq!(cpu.pc(), recovery.target);
            }
            StepControl::Continue
        });

        assert_eq!(stop_reason, StopReason::Halted);
        assert_eq!(flushes, 2);
        harness.assert_reg_value(4, 1);
        harness.assert_reg_value(5, 1);
    }

    #[test]
    fn test_load_out_of_bounds() {
        let src = r#"
MOVC R0,#5000
LOAD R1,R0,#0
MOVC R2,#1
HALT
"#;
        let mut harness = TestHarness::default();
        let stop_reason = harness.run(src);
        assert_eq!(stop_reason, StopReason::Exception { pc: 4004, exception: Exception::MemoryOutOfBounds { address: 5000 } });
        assert_eq!(harness.cpu.committed(), 1);
        harness.assert_reg_value(2, 0);
    }

    #[test]
    fn test_divide_by_zero() {
        let src = r#"
MOVC R0,#1
MOVC R1,#0
DIV R2,R0,R1
HALT
"#;
        let mut harness = TestHarness::default();
        assert_eq!(harness.run(src), StopReason::Exception { pc: 4008, exception: Exception::DivideByZero });
        assert_eq!(harness.cpu.committed(), 2);
    }

    #[test]
    fn test_exception_on_wrong_path_is_ignored() {
        let src = r#"
MOVC R0,#0
MOVC R1,#0
CMP R0,R1
BZ,#8
DIV R2,R0,R1    ; wrong path
HALT
"#;
        let mut harness = TestHarness::default();
        assert_eq!(harness.run(src), StopReason::Halted);
        assert_eq!(harness.cpu.committed(), 5);
    }

    #[test]
    fn test_cycle_limit() {
        let mut cpu_config = TestHarness::new_test_cpu_config();
        cpu_config.max_cycles = 50;
        let mut harness = TestHarness::with_config(cpu_config);
        // an endless loop
        assert_eq!(harness.run("BNZ,#0"), StopReason::CycleLimit);
        assert_eq!(harness.cpu.cycles(), 50);
        assert!(harness.cpu.perf_counters.branch_taken_cnt > 0);
    }

    #[test]
    fn test_run_for() {
        let mut harness = TestHarness::default();
        let program = harness.load_program("BNZ,#0");
        assert_eq!(harness.cpu.run_for(&program, 20), StopReason::CycleLimit);
        assert_eq!(harness.cpu.cycles(), 20);
    }

    #[test]
    fn test_drained_without_halt() {
        let mut harness = TestHarness::default();
        assert_eq!(harness.run("MOVC R0,#1\nMOVC R1,#2\n"), StopReason::Drained);
        harness.assert_reg_value(0, 1);
        harness.assert_reg_value(1, 2);
    }

    #[test]
    fn test_single_step_quit() {
        let mut harness = TestHarness::default();
        let program = harness.load_program("MOVC R0,#1\nHALT\n");

        let mut steps = 0;
        let stop_reason = harness.cpu.run_single_step(&program, |_| {
            steps += 1;
            if steps == 3 { StepControl::Quit } else { StepControl::Continue }
        });

        assert_eq!(stop_reason, StopReason::Quit);
        assert_eq!(harness.cpu.cycles(), 3);
        // the MOVC has issued but not executed yet
        let r0 = harness.cpu.arch_registers()[0];
        assert!(!r0.valid);
        assert_eq!(r0.value, 0);
    }

    #[test]
    fn test_single_step_sees_final_cycle() {
        let mut harness = TestHarness::default();
        let program = harness.load_program("MOVC R0,#1\nHALT\n");

        let mut last_seen = None;
        let stop_reason = harness.cpu.run_single_step(&program, |cpu| {
            last_seen = Some((cpu.cycles(), cpu.committed()));
            StepControl::Continue
        });

        assert_eq!(stop_reason, StopReason::Halted);
        assert_eq!(last_seen, Some((harness.cpu.cycles(), 2)));
    }

    #[test]
    fn test_register_invalid_until_writer_commits() {
        let mut harness = TestHarness::default();
        let program = harness.load_program("MOVC R0,#1\nHALT\n");

        let mut states = Vec::new();
        harness.cpu.run_single_step(&program, |cpu| {
            states.push((cpu.cycles(), cpu.committed(), cpu.arch_registers()[0]));
            StepControl::Continue
        });

        for (cycle, committed, r0) in states.iter().copied() {
            if committed == 0 && cycle >= 2 {
                // the MOVC is dispatched, and may have executed, but has not committed
                assert!(!r0.valid, "R0 is valid at cycle {} before its writer committed", cycle);
                assert_eq!(r0.value, 0);
            }
            if committed >= 1 {
                assert!(r0.valid);
                assert_eq!(r0.value, 1);
            }
        }
        assert!(states.iter().any(|(_, committed, _)| *committed == 0));
        assert!(states.iter().any(|(_, committed, _)| *committed >= 1));
    }

    #[test]
    fn test_memory_issues_at_rob_head() {
        let src = r#"
MOVC R0,#3
MOVC R1,#100
MUL R2,R0,R0
LOAD R3,R1,#0   ; independent of the MUL
HALT
"#;
        let mut cpu_config = TestHarness::new_test_cpu_config();
        cpu_config.mul_latency = 5;
        let mut harness = TestHarness::with_config(cpu_config);
        assert_eq!(harness.run(src), StopReason::Halted);
        harness.assert_reg_value(2, 9);

        let commit_cycle = |pc: WordType| {
            match harness.cpu.commit_log().iter().find(|record| record.pc == pc) {
                Some(record) => record.cycle,
                None => panic!("pc {} did not commit", pc),
            }
        };
        // the LOAD waits for the head: issue, then MEM1, then MEM2
        assert!(commit_cycle(4012) >= commit_cycle(4008) + 3);
    }

    #[test]
    fn test_jump_to_far_negative_target_drains() {
        let src = r#"
MOVC R0,#-9223372036854775807
JUMP R0,#0
HALT
"#;
        let mut harness = TestHarness::default();
        assert_eq!(harness.run(src), StopReason::Drained);
        assert_eq!(harness.cpu.pc(), -9223372036854775807);
        assert_eq!(harness.cpu.committed(), 2);
    }

    #[test]
    fn test_checkpoint_exhaustion_stalls_dispatch() {
        let src = r#"
BZ,#100
BZ,#100
MOVC R0,#3
HALT
"#;
        let mut cpu_config = TestHarness::new_test_cpu_config();
        cpu_config.checkpoint_count = 1;
        let mut harness = TestHarness::with_config(cpu_config);
        assert_eq!(harness.run(src), StopReason::Halted);
        harness.assert_reg_value(0, 3);

        let perf_counters = &harness.cpu.perf_counters;
        assert!(perf_counters.stall_no_checkpoint_cnt > 0);
        assert_eq!(perf_counters.branch_not_taken_cnt, 2);
    }

    #[test]
    fn test_register_pressure() {
        let src = r#"
MOVC R0,#1
MOVC R1,#2
MOVC R2,#3
MOVC R3,#4
MOVC R4,#5
ADD R5,R4,R0
HALT
"#;
        let mut cpu_config = TestHarness::new_test_cpu_config();
        cpu_config.phys_reg_count = 18;
        let mut harness = TestHarness::with_config(cpu_config);
        assert_eq!(harness.run(src), StopReason::Halted);
        for (reg, value) in [(0, 1), (1, 2), (2, 3), (3, 4), (4, 5), (5, 6)] {
            harness.assert_reg_value(reg, value);
        }
        assert!(harness.cpu.perf_counters.stall_no_free_reg_cnt > 0);
    }

    #[test]
    fn test_rerun_resets_state() {
        let mut harness = TestHarness::default();
        harness.run("MOVC R0,#1\nMOVC R1,#20\nSTORE R0,R1,#0\nHALT\n");
        harness.assert_mem_value(20, 1);

        harness.run("MOVC R2,#2\nHALT\n");
        harness.assert_reg_value(0, 0);
        harness.assert_reg_value(2, 2);
        harness.assert_mem_value(20, 0);
        assert_eq!(harness.cpu.committed(), 2);
    }

    struct TestHarness {
        program: Option<Rc<Program>>,
        cpu: CPU,
        cpu_config: CPUConfig,
    }

    impl TestHarness {
        fn default() -> TestHarness {
            Self::with_config(Self::new_test_cpu_config())
        }

        fn with_config(cpu_config: CPUConfig) -> TestHarness {
            TestHarness {
                program: None,
                cpu: CPU::new(&cpu_config),
                cpu_config,
            }
        }

        fn new_test_cpu_config() -> CPUConfig {
            let _ = env_logger::builder().is_test(true).try_init();
            CPUConfig::default()
        }

        // Runs the program and checks the pipeline invariants after every cycle.
        fn run(&mut self, src: &str) -> StopReason {
            let program = self.load_program(src);
            self.cpu.run_single_step(&program, |cpu| {
                cpu.backend.assert_invariants();
                StepControl::Continue
            })
        }

        fn load_program(&mut self, src: &str) -> Rc<Program> {
            let load_result = load_from_string(self.cpu_config.clone(), src.to_string());
            let program = match load_result {
                Ok(p) => Rc::new(p),
                Err(err) => {
                    match err {
                        LoadError::AnalysisError(msg_vec) => {
                            for msg in msg_vec {
                                println!("{}", msg);
                            }
                        }
                        other => println!("{}", other),
                    }
                    panic!("Failed to load the test program");
                }
            };
            self.program = Some(Rc::clone(&program));
            program
        }

        fn committed_pcs(&self) -> Vec<WordType> {
            self.cpu.commit_log().iter().map(|record| record.pc).collect()
        }

        fn assert_reg_value(&self, reg: RegisterType, value: WordType) {
            let reg_file = self.cpu.arch_registers();
            assert_eq!(reg_file[reg as usize].value, value, "R{} has an unexpected value", reg);
        }

        fn assert_mem_value(&self, address: WordType, value: WordType) {
            match self.cpu.memory().get(address as usize) {
                Some(&actual_value) => {
                    assert_eq!(actual_value, value, "Memory address {} does not have the expected value", address);
                }
                None => {
                    panic!("Memory address {} is invalid", address);
                }
            }
        }
    }
}
