use std::fs;
use std::io::ErrorKind;

use regex::Regex;
use thiserror::Error;

use crate::cpu::CPUConfig;
use crate::instructions::instructions::{create_instr, get_opcode, Instr, Operand, Program, SourceLocation, WordType};

#[derive(Error, Debug)]
pub enum LoadError {
    // a syntax error; loading stops at the first one
    #[error("{0}")]
    ParseError(String),
    // the semantic errors of the whole program
    #[error("{}", .0.join("\n"))]
    AnalysisError(Vec<String>),
    #[error("{0}")]
    NotFoundError(String),
    #[error("{0}")]
    IOError(String),
}

struct Loader {
    cpu_config: CPUConfig,
    code: Vec<Instr>,
    errors: Vec<String>,
    token_re: Regex,
    register_re: Regex,
    immediate_re: Regex,
}

impl Loader {
    fn new(cpu_config: CPUConfig) -> Result<Loader, LoadError> {
        let compile = |pattern: &str| Regex::new(pattern).map_err(|err| LoadError::ParseError(err.to_string()));
        Ok(Loader {
            cpu_config,
            code: Vec::new(),
            errors: Vec::new(),
            // operands are separated by commas and/or whitespace
            token_re: compile(r"[^,\s]+")?,
            register_re: compile(r"^(?i)R(\d+)$")?,
            immediate_re: compile(r"^#(-)?(?i)(0x[0-9a-f]+|\d+)$")?,
        })
    }

    fn load(&mut self, src: &str) -> Result<(), LoadError> {
        for (index, line) in src.lines().enumerate() {
            // everything after ';' is a comment
            let line = match line.find(';') {
                Some(comment) => &line[..comment],
                None => line,
            };
            self.parse_line(index + 1, line)?;
        }
        Ok(())
    }

    fn parse_line(&mut self, line_number: usize, line: &str) -> Result<(), LoadError> {
        let mut tokens = self.token_re.find_iter(line);

        let mnemonic = match tokens.next() {
            None => return Ok(()),
            Some(token) => token,
        };
        let opcode = match get_opcode(mnemonic.as_str()) {
            Some(opcode) => opcode,
            None => {
                let loc = SourceLocation { line: line_number, column: mnemonic.start() + 1 };
                return Err(LoadError::ParseError(format!("Unknown mnemonic '{}' at {}", mnemonic.as_str(), loc)));
            }
        };

        let mut operands = Vec::new();
        for token in tokens {
            let loc = SourceLocation { line: line_number, column: token.start() + 1 };
            operands.push(self.parse_operand(token.as_str(), loc)?);
        }

        let loc = SourceLocation { line: line_number, column: mnemonic.start() + 1 };
        for operand in &operands {
            if let Operand::Register(reg) = operand {
                if *reg >= self.cpu_config.arch_reg_count {
                    self.errors.push(format!("Register R{} is out of range at {}; there are {} registers",
                                             reg, loc, self.cpu_config.arch_reg_count));
                }
            }
        }

        match create_instr(opcode, &operands) {
            Ok(instr) => self.code.push(instr),
            Err(msg) => self.errors.push(format!("{} at {}", msg, loc)),
        }
        Ok(())
    }

    fn parse_operand(&self, token: &str, loc: SourceLocation) -> Result<Operand, LoadError> {
        if let Some(captures) = self.register_re.captures(token) {
            return match captures[1].parse() {
                Ok(reg) => Ok(Operand::Register(reg)),
                Err(_) => Err(LoadError::ParseError(format!("Illegal register '{}' at {}", token, loc))),
            };
        }

        if let Some(captures) = self.immediate_re.captures(token) {
            // the sign is parsed with the digits so the most negative word fits
            let sign = if captures.get(1).is_some() { "-" } else { "" };
            let digits = &captures[2];
            let parsed = if digits.len() > 2 && digits[..2].eq_ignore_ascii_case("0x") {
                WordType::from_str_radix(&format!("{}{}", sign, &digits[2..]), 16)
            } else {
                format!("{}{}", sign, digits).parse::<WordType>()
            };
            let value = parsed.map_err(|_| LoadError::ParseError(format!("Illegal immediate '{}' at {}", token, loc)))?;
            return Ok(Operand::Immediate(value));
        }

        Err(LoadError::ParseError(format!("Illegal operand '{}' at {}", token, loc)))
    }
}

/// Loads the program in the file at `path`.
pub fn load(cpu_config: CPUConfig, path: &str) -> Result<Program, LoadError> {
    let src = match fs::read_to_string(path) {
        Ok(src) => src,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(LoadError::NotFoundError(format!("File '{}' does not exist.", path)));
        }
        Err(err) => return Err(LoadError::IOError(format!("Error reading file '{}': {}", path, err))),
    };
    load_from_string(cpu_config, src)
}

pub fn load_from_string(cpu_config: CPUConfig, src: String) -> Result<Program, LoadError> {
    let code_base = cpu_config.code_base;
    let mut loader = Loader::new(cpu_config)?;
    loader.load(&src)?;

    if !loader.errors.is_empty() {
        return Err(LoadError::AnalysisError(loader.errors));
    }
    Ok(Program::new(loader.code, code_base))
}
