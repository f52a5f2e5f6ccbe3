use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process::exit;
use std::rc::Rc;

use structopt::StructOpt;

use crate::cpu::{load_cpu_config, StepControl, StopReason, Trace, CPU};
use crate::instructions::instructions::WordType;
use crate::loader::loader::{load, LoadError};

mod cpu;
mod loader;
mod frontend;
mod backend;
mod instructions;
mod memory_subsystem;
#[cfg(test)]
mod cpu_tests;

// The number of memory words printed after a simulation.
const MEM_DUMP_WORDS: WordType = 10;

#[derive(StructOpt, Debug)]
#[structopt(name = "Out-of-order pipeline simulator")]
struct Opt {
    /// Path of the file to load
    #[structopt(short, long, parse(from_os_str))]
    file: PathBuf,

    /// Sets a custom config file
    #[structopt(short, long, parse(from_os_str), default_value = "cpu.yaml")]
    config: PathBuf,

    #[structopt(subcommand)]
    mode: Option<Mode>,
}

#[derive(StructOpt, Debug)]
enum Mode {
    /// Runs until HALT commits or max_cycles is reached
    Run,
    /// Runs for at most the given number of cycles and dumps the state
    Simulate {
        cycles: u64,
    },
    /// Like simulate, but traces every pipeline event
    Display {
        cycles: u64,
        /// Additional memory addresses to print
        #[structopt(long, use_delimiter = true)]
        show_mem: Vec<WordType>,
    },
    /// Runs one cycle at a time; Enter continues, q quits
    SingleStep,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt = Opt::from_args();

    let cpu_config_path = opt.config.to_string_lossy();
    let mut cpu_config = match load_cpu_config(&cpu_config_path) {
        Ok(config) => config,
        Err(error) => {
            println!("Failed to load {}. Cause: {}", cpu_config_path, error);
            exit(1);
        }
    };

    let mode = opt.mode.unwrap_or(Mode::Run);
    if let Mode::Display { .. } = mode {
        cpu_config.trace = Trace::all();
    }

    let path = opt.file.to_string_lossy();
    println!("Loading {}", path);
    let load_result = load(cpu_config.clone(), &path);
    let program = match load_result {
        Ok(p) => {
            println!("Loaded {} instructions at [{}, {})", p.len(), p.code_base, p.end());
            Rc::new(p)
        }
        Err(err) => {
            println!("Loading program '{}' failed.", path);
            match err {
                LoadError::ParseError(msg) => {
                    println!("{}", msg);
                    exit(1);
                }

                LoadError::AnalysisError(msg_vec) => {
                    for msg in msg_vec {
                        println!("{}", msg);
                    }
                    exit(1);
                }
                LoadError::NotFoundError(msg) => {
                    println!("{}", msg);
                    exit(1);
                }
                LoadError::IOError(msg) => {
                    println!("{}", msg);
                    exit(1);
                }
            }
        }
    };

    let mut cpu = CPU::new(&cpu_config);
    let stop_reason = match &mode {
        Mode::Run => cpu.run(&program),
        Mode::Simulate { cycles } => cpu.run_for(&program, *cycles),
        Mode::Display { cycles, .. } => cpu.run_for(&program, *cycles),
        Mode::SingleStep => {
            let stdin = io::stdin();
            let mut lines = stdin.lock().lines();
            cpu.run_single_step(&program, |cpu| {
                print_status(cpu);
                match lines.next() {
                    Some(Ok(line)) if line.trim().eq_ignore_ascii_case("q") => StepControl::Quit,
                    Some(Ok(_)) => StepControl::Continue,
                    // stdin is closed
                    _ => StepControl::Quit,
                }
            })
        }
    };

    print_reg_file(&cpu);
    print_data_mem(&cpu, 0..MEM_DUMP_WORDS);
    if let Mode::Display { show_mem, .. } = &mode {
        println!("Z flag = {}", cpu.zero_flag() as u8);
        print_data_mem(&cpu, show_mem.iter().copied());
    }
    print_stats(&cpu, stop_reason);
}

fn print_status(cpu: &CPU) {
    println!("[Cycle {}] pc={} committed={} rob={} iq={} (Enter to continue, q to quit)",
             cpu.cycles(),
             cpu.pc(),
             cpu.committed(),
             cpu.backend.rob.size(),
             cpu.backend.iq.size());
}

fn print_reg_file(cpu: &CPU) {
    println!("=============== STATE OF ARCHITECTURAL REGISTER FILE ==========");
    for (reg, state) in cpu.arch_registers().iter().enumerate() {
        let status = if state.valid { "VALID" } else { "INVALID" };
        println!("|\tREG[{}]\t|\tValue = {}\t|\tStatus = {}\t|", reg, state.value, status);
    }
}

fn print_data_mem(cpu: &CPU, addresses: impl Iterator<Item=WordType>) {
    println!("============== STATE OF DATA MEMORY =============");
    let memory = cpu.memory();
    for address in addresses {
        match usize::try_from(address).ok().and_then(|index| memory.get(index)) {
            Some(value) => println!("|\tMEM[{}]\t|\tData Value = {}\t|", address, value),
            None => println!("|\tMEM[{}]\t|\tout of range\t|", address),
        }
    }
}

fn print_stats(cpu: &CPU, stop_reason: StopReason) {
    let perf_counters = &cpu.perf_counters;
    println!("Stopped: {}", stop_reason);
    println!("Cycles: {}  Committed: {}  IPC: {:.2}", cpu.cycles(), cpu.committed(), perf_counters.ipc());
    println!("Branches: taken={} not_taken={}  Flushes: {} ({} instructions discarded)",
             perf_counters.branch_taken_cnt,
             perf_counters.branch_not_taken_cnt,
             perf_counters.pipeline_flushes,
             perf_counters.bad_speculation_cnt);
    println!("Stalls: rob_full={} iq_full={} no_free_reg={} no_checkpoint={}",
             perf_counters.stall_rob_full_cnt,
             perf_counters.stall_iq_full_cnt,
             perf_counters.stall_no_free_reg_cnt,
             perf_counters.stall_no_checkpoint_cnt);
}
