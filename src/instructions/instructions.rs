use std::fmt;

pub(crate) type RegisterType = u16;
pub(crate) type WordType = i64;

// The distance between the addresses of two consecutive instructions.
pub(crate) const INSTR_SIZE: WordType = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Opcode {
    ADD,
    SUB,
    ADDL,
    SUBL,
    MUL,
    DIV,
    AND,
    OR,
    XOR,
    MOVC,
    LOAD,
    LDR,
    STORE,
    STR,
    CMP,
    BZ,
    BNZ,
    JUMP,
    JAL,
    HALT,
    NOP,
}

pub(crate) fn mnemonic(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::ADD => "ADD",
        Opcode::SUB => "SUB",
        Opcode::ADDL => "ADDL",
        Opcode::SUBL => "SUBL",
        Opcode::MUL => "MUL",
        Opcode::DIV => "DIV",
        Opcode::AND => "AND",
        Opcode::OR => "OR",
        Opcode::XOR => "XOR",
        Opcode::MOVC => "MOVC",
        Opcode::LOAD => "LOAD",
        Opcode::LDR => "LDR",
        Opcode::STORE => "STORE",
        Opcode::STR => "STR",
        Opcode::CMP => "CMP",
        Opcode::BZ => "BZ",
        Opcode::BNZ => "BNZ",
        Opcode::JUMP => "JUMP",
        Opcode::JAL => "JAL",
        Opcode::HALT => "HALT",
        Opcode::NOP => "NOP",
    }
}

pub(crate) fn get_opcode(mnemonic: &str) -> Option<Opcode> {
    let string = mnemonic.to_uppercase();
    let mnemonic_uppercased = string.as_str();

    match mnemonic_uppercased {
        "ADD" => Some(Opcode::ADD),
        "SUB" => Some(Opcode::SUB),
        "ADDL" => Some(Opcode::ADDL),
        "SUBL" => Some(Opcode::SUBL),
        "MUL" => Some(Opcode::MUL),
        "DIV" => Some(Opcode::DIV),
        "AND" => Some(Opcode::AND),
        "OR" => Some(Opcode::OR),
        "XOR" => Some(Opcode::XOR),
        "MOVC" => Some(Opcode::MOVC),
        "LOAD" => Some(Opcode::LOAD),
        "LDR" => Some(Opcode::LDR),
        "STORE" => Some(Opcode::STORE),
        "STR" => Some(Opcode::STR),
        "CMP" => Some(Opcode::CMP),
        "BZ" => Some(Opcode::BZ),
        "BNZ" => Some(Opcode::BNZ),
        "JUMP" => Some(Opcode::JUMP),
        "JAL" => Some(Opcode::JAL),
        "HALT" => Some(Opcode::HALT),
        "NOP" => Some(Opcode::NOP),
        _ => None,
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Operand {
    Register(RegisterType),
    // The operand is directly specified in the instruction itself.
    Immediate(WordType),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Register(reg) => write!(f, "R{}", reg),
            Operand::Immediate(value) => write!(f, "#{}", value),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Condition {
    Zero,
    NotZero,
}

/// The class of functional unit an instruction executes on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum UnitClass {
    Integer,
    Multiplier,
    Memory,
    Branch,
}

/// A decoded instruction. Every variant carries exactly the operands its class needs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Instr {
    // ADD, SUB, AND, OR, XOR, DIV take a register as src2; ADDL and SUBL an immediate.
    Alu { opcode: Opcode, rd: RegisterType, rs1: RegisterType, src2: Operand },
    Mul { rd: RegisterType, rs1: RegisterType, rs2: RegisterType },
    Cmp { rs1: RegisterType, rs2: RegisterType },
    Movc { rd: RegisterType, imm: WordType },
    // LOAD: rd = mem[base + #imm], LDR: rd = mem[base + index]
    Load { opcode: Opcode, rd: RegisterType, base: RegisterType, offset: Operand },
    // STORE: mem[base + #imm] = value, STR: mem[base + index] = value
    Store { opcode: Opcode, value: RegisterType, base: RegisterType, offset: Operand },
    // The target is relative to the pc of the branch.
    Branch { opcode: Opcode, condition: Condition, offset: WordType },
    Jump { rs1: RegisterType, imm: WordType },
    Jal { rd: RegisterType, rs1: RegisterType, imm: WordType },
    Halt,
    Nop,
}

impl Instr {
    pub(crate) fn opcode(&self) -> Opcode {
        match *self {
            Instr::Alu { opcode, .. } |
            Instr::Load { opcode, .. } |
            Instr::Store { opcode, .. } |
            Instr::Branch { opcode, .. } => opcode,
            Instr::Mul { .. } => Opcode::MUL,
            Instr::Cmp { .. } => Opcode::CMP,
            Instr::Movc { .. } => Opcode::MOVC,
            Instr::Jump { .. } => Opcode::JUMP,
            Instr::Jal { .. } => Opcode::JAL,
            Instr::Halt => Opcode::HALT,
            Instr::Nop => Opcode::NOP,
        }
    }

    pub(crate) fn unit_class(&self) -> UnitClass {
        match self {
            Instr::Alu { .. } |
            Instr::Cmp { .. } |
            Instr::Movc { .. } |
            Instr::Halt |
            Instr::Nop => UnitClass::Integer,
            Instr::Mul { .. } => UnitClass::Multiplier,
            Instr::Load { .. } |
            Instr::Store { .. } => UnitClass::Memory,
            Instr::Branch { .. } |
            Instr::Jump { .. } |
            Instr::Jal { .. } => UnitClass::Branch,
        }
    }

    /// The architectural register written by this instruction.
    pub(crate) fn dest(&self) -> Option<RegisterType> {
        match *self {
            Instr::Alu { rd, .. } |
            Instr::Mul { rd, .. } |
            Instr::Movc { rd, .. } |
            Instr::Load { rd, .. } |
            Instr::Jal { rd, .. } => Some(rd),
            _ => None,
        }
    }

    /// The (at most) two operands fed into the functional unit. Register operands
    /// are renamed at dispatch, immediates are ready right away.
    pub(crate) fn operands(&self) -> [Option<Operand>; 2] {
        match *self {
            Instr::Alu { rs1, src2, .. } => [Some(Operand::Register(rs1)), Some(src2)],
            Instr::Mul { rs1, rs2, .. } |
            Instr::Cmp { rs1, rs2 } => [Some(Operand::Register(rs1)), Some(Operand::Register(rs2))],
            Instr::Movc { imm, .. } => [Some(Operand::Immediate(imm)), None],
            Instr::Load { base, offset, .. } |
            Instr::Store { base, offset, .. } => [Some(Operand::Register(base)), Some(offset)],
            Instr::Jump { rs1, imm } |
            Instr::Jal { rs1, imm, .. } => [Some(Operand::Register(rs1)), Some(Operand::Immediate(imm))],
            Instr::Branch { .. } |
            Instr::Halt |
            Instr::Nop => [None, None],
        }
    }

    // The register holding the value a store writes to memory.
    pub(crate) fn store_data(&self) -> Option<RegisterType> {
        match *self {
            Instr::Store { value, .. } => Some(value),
            _ => None,
        }
    }

    /// True if the instruction produces the zero flag.
    pub(crate) fn sets_flag(&self) -> bool {
        matches!(self, Instr::Cmp { .. } | Instr::Alu { opcode: Opcode::ADD | Opcode::SUB, .. })
    }

    pub(crate) fn reads_flag(&self) -> bool {
        matches!(self, Instr::Branch { .. })
    }

    /// True if the instruction can redirect the program counter; these instructions
    /// need a checkpoint when they are dispatched.
    pub(crate) fn is_control(&self) -> bool {
        matches!(self, Instr::Branch { .. } | Instr::Jump { .. } | Instr::Jal { .. })
    }

    pub(crate) fn is_halt(&self) -> bool {
        matches!(self, Instr::Halt)
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", mnemonic(self.opcode()))?;

        match *self {
            Instr::Alu { rd, rs1, src2, .. } => write!(f, ",R{},R{},{}", rd, rs1, src2),
            Instr::Mul { rd, rs1, rs2 } => write!(f, ",R{},R{},R{}", rd, rs1, rs2),
            Instr::Cmp { rs1, rs2 } => write!(f, ",R{},R{}", rs1, rs2),
            Instr::Movc { rd, imm } => write!(f, ",R{},#{}", rd, imm),
            Instr::Load { rd, base, offset, .. } => write!(f, ",R{},R{},{}", rd, base, offset),
            Instr::Store { value, base, offset, .. } => write!(f, ",R{},R{},{}", value, base, offset),
            Instr::Branch { offset, .. } => write!(f, ",#{}", offset),
            Instr::Jump { rs1, imm } => write!(f, ",R{},#{}", rs1, imm),
            Instr::Jal { rd, rs1, imm } => write!(f, ",R{},R{},#{}", rd, rs1, imm),
            Instr::Halt | Instr::Nop => Ok(()),
        }
    }
}

const POSITIONS: [&str; 3] = ["first", "second", "third"];

fn expect_count(opcode: Opcode, operands: &[Operand], count: usize) -> Result<(), String> {
    if operands.len() != count {
        return Err(format!("{:?} expects {} arguments, but {} are provided", opcode, count, operands.len()));
    }
    Ok(())
}

fn expect_register(opcode: Opcode, operands: &[Operand], index: usize) -> Result<RegisterType, String> {
    match operands[index] {
        Operand::Register(reg) => Ok(reg),
        Operand::Immediate(_) => Err(format!("{:?} expects a register as {} argument", opcode, POSITIONS[index])),
    }
}

fn expect_immediate(opcode: Opcode, operands: &[Operand], index: usize) -> Result<WordType, String> {
    match operands[index] {
        Operand::Immediate(value) => Ok(value),
        Operand::Register(_) => Err(format!("{:?} expects an immediate as {} argument", opcode, POSITIONS[index])),
    }
}

/// Builds an instruction from its opcode and the operands in source order.
pub(crate) fn create_instr(opcode: Opcode, operands: &[Operand]) -> Result<Instr, String> {
    let instr = match opcode {
        Opcode::ADD |
        Opcode::SUB |
        Opcode::AND |
        Opcode::OR |
        Opcode::XOR |
        Opcode::DIV => {
            expect_count(opcode, operands, 3)?;
            Instr::Alu {
                opcode,
                rd: expect_register(opcode, operands, 0)?,
                rs1: expect_register(opcode, operands, 1)?,
                src2: Operand::Register(expect_register(opcode, operands, 2)?),
            }
        }
        Opcode::ADDL |
        Opcode::SUBL => {
            expect_count(opcode, operands, 3)?;
            Instr::Alu {
                opcode,
                rd: expect_register(opcode, operands, 0)?,
                rs1: expect_register(opcode, operands, 1)?,
                src2: Operand::Immediate(expect_immediate(opcode, operands, 2)?),
            }
        }
        Opcode::MUL => {
            expect_count(opcode, operands, 3)?;
            Instr::Mul {
                rd: expect_register(opcode, operands, 0)?,
                rs1: expect_register(opcode, operands, 1)?,
                rs2: expect_register(opcode, operands, 2)?,
            }
        }
        Opcode::MOVC => {
            expect_count(opcode, operands, 2)?;
            Instr::Movc {
                rd: expect_register(opcode, operands, 0)?,
                imm: expect_immediate(opcode, operands, 1)?,
            }
        }
        Opcode::LOAD |
        Opcode::LDR => {
            expect_count(opcode, operands, 3)?;
            let offset = if opcode == Opcode::LOAD {
                Operand::Immediate(expect_immediate(opcode, operands, 2)?)
            } else {
                Operand::Register(expect_register(opcode, operands, 2)?)
            };
            Instr::Load {
                opcode,
                rd: expect_register(opcode, operands, 0)?,
                base: expect_register(opcode, operands, 1)?,
                offset,
            }
        }
        Opcode::STORE |
        Opcode::STR => {
            expect_count(opcode, operands, 3)?;
            let offset = if opcode == Opcode::STORE {
                Operand::Immediate(expect_immediate(opcode, operands, 2)?)
            } else {
                Operand::Register(expect_register(opcode, operands, 2)?)
            };
            Instr::Store {
                opcode,
                value: expect_register(opcode, operands, 0)?,
                base: expect_register(opcode, operands, 1)?,
                offset,
            }
        }
        Opcode::CMP => {
            expect_count(opcode, operands, 2)?;
            Instr::Cmp {
                rs1: expect_register(opcode, operands, 0)?,
                rs2: expect_register(opcode, operands, 1)?,
            }
        }
        Opcode::BZ |
        Opcode::BNZ => {
            expect_count(opcode, operands, 1)?;
            let condition = if opcode == Opcode::BZ { Condition::Zero } else { Condition::NotZero };
            Instr::Branch { opcode, condition, offset: expect_immediate(opcode, operands, 0)? }
        }
        Opcode::JUMP => {
            expect_count(opcode, operands, 2)?;
            Instr::Jump {
                rs1: expect_register(opcode, operands, 0)?,
                imm: expect_immediate(opcode, operands, 1)?,
            }
        }
        Opcode::JAL => {
            expect_count(opcode, operands, 3)?;
            Instr::Jal {
                rd: expect_register(opcode, operands, 0)?,
                rs1: expect_register(opcode, operands, 1)?,
                imm: expect_immediate(opcode, operands, 2)?,
            }
        }
        Opcode::HALT => {
            expect_count(opcode, operands, 0)?;
            Instr::Halt
        }
        Opcode::NOP => {
            expect_count(opcode, operands, 0)?;
            Instr::Nop
        }
    };

    return Ok(instr);
}

/// The program image: instructions laid out from `code_base` in steps of `INSTR_SIZE`.
pub(crate) struct Program {
    pub(crate) code: Vec<Instr>,
    pub(crate) code_base: WordType,
}

impl Program {
    pub(crate) fn new(code: Vec<Instr>, code_base: WordType) -> Program {
        Program { code, code_base }
    }

    pub(crate) fn get_instr(&self, pc: WordType) -> Option<Instr> {
        let offset = match pc.checked_sub(self.code_base) {
            Some(offset) => offset,
            None => return None,
        };
        if offset < 0 || offset % INSTR_SIZE != 0 {
            return None;
        }
        return self.code.get((offset / INSTR_SIZE) as usize).copied();
    }

    pub(crate) fn len(&self) -> usize {
        self.code.len()
    }

    // The address just past the last instruction.
    pub(crate) fn end(&self) -> WordType {
        self.code_base + self.code.len() as WordType * INSTR_SIZE
    }
}
