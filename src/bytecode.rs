// (C) 2020 Brandon Lewis
//
// Bytecode program model.
//
// A program is fixed once built: an instruction array plus four
// string tables (pooled literals, variable names at declaration
// index, property names, host-function names). Counts are stamped
// when the program is assembled; the memory governor enforces the
// capacity ceilings before a program is admitted.
//
// The in-memory opcode format makes illegal operations impossible
// to represent: every operand is embedded in its opcode arm, so a
// decoded instruction is structurally well-formed. Index validity
// (jump targets, pool and table indices) is a separate `validate`
// pass run before execution.
//
// The wire form is a compact little-endian encoding carried as
// base64 inside dynamic tool definitions and the persistent store.

use crate::value::{BinOp, UnOp};


pub const WIRE_MAGIC: [u8; 4] = *b"MCPB";
pub const WIRE_VERSION: u8 = 1;

const INSTRUCTION_BYTES: usize = 5;


#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Opcode {
    PushNum(f32),
    PushStr(u16),
    PushBool(bool),
    PushNull,
    Pop,
    Dup,
    LoadVar(u16),
    StoreVar(u16),
    Binary(BinOp),
    Unary(UnOp),
    Jump(u16),
    JumpIfFalse(u16),
    Call { func: u16, argc: u8 },
    Return,
    Halt,
}

impl Opcode {
    // Net stack discipline, declared statically per opcode:
    // (values consumed, values produced). Violations fault before
    // the handler runs.
    pub fn stack_effect(&self) -> (usize, usize) {
        match self {
            Opcode::PushNum(_) => (0, 1),
            Opcode::PushStr(_) => (0, 1),
            Opcode::PushBool(_) => (0, 1),
            Opcode::PushNull => (0, 1),
            Opcode::Pop => (1, 0),
            Opcode::Dup => (1, 2),
            Opcode::LoadVar(_) => (0, 1),
            Opcode::StoreVar(_) => (1, 0),
            Opcode::Binary(_) => (2, 1),
            Opcode::Unary(_) => (1, 1),
            Opcode::Jump(_) => (0, 0),
            Opcode::JumpIfFalse(_) => (1, 0),
            Opcode::Call { argc, .. } => (*argc as usize, 1),
            Opcode::Return => (0, 0),
            Opcode::Halt => (0, 0),
        }
    }
}


#[derive(Clone, Debug, PartialEq, Default)]
pub struct Program {
    pub instructions: Vec<Opcode>,
    pub string_pool: Vec<String>,
    pub variable_names: Vec<String>,
    pub property_names: Vec<String>,
    pub function_names: Vec<String>,
}


#[derive(Clone, Debug, PartialEq)]
pub enum CodecError {
    BadMagic,
    BadVersion(u8),
    Truncated,
    BadOpcode(u8),
    BadOperand,
    BadString,
    BadBase64,
}

pub type CodecResult<T> = core::result::Result<T, CodecError>;


#[derive(Clone, Debug, PartialEq)]
pub enum ProgramError {
    JumpOutOfRange(usize),
    StringOutOfRange(usize),
    VariableOutOfRange(usize),
    FunctionOutOfRange(usize),
}


impl Program {
    pub fn with_capacity(
        instructions: usize,
        strings: usize,
        variables: usize,
        properties: usize,
        functions: usize
    ) -> Program {
        Program {
            instructions: Vec::with_capacity(instructions),
            string_pool: Vec::with_capacity(strings),
            variable_names: Vec::with_capacity(variables),
            property_names: Vec::with_capacity(properties),
            function_names: Vec::with_capacity(functions),
        }
    }

    // Check every embedded index before execution. A jump target
    // equal to the instruction count is legal: falling off the end
    // halts.
    pub fn validate(&self) -> core::result::Result<(), ProgramError> {
        let len = self.instructions.len();
        for (pc, op) in self.instructions.iter().enumerate() {
            match op {
                Opcode::Jump(t) | Opcode::JumpIfFalse(t) => {
                    if *t as usize > len {
                        return Err(ProgramError::JumpOutOfRange(pc));
                    }
                },
                Opcode::PushStr(i) => {
                    if *i as usize >= self.string_pool.len() {
                        return Err(ProgramError::StringOutOfRange(pc));
                    }
                },
                Opcode::LoadVar(i) | Opcode::StoreVar(i) => {
                    if *i as usize >= self.variable_names.len() {
                        return Err(ProgramError::VariableOutOfRange(pc));
                    }
                },
                Opcode::Call { func, .. } => {
                    if *func as usize >= self.function_names.len() {
                        return Err(ProgramError::FunctionOutOfRange(pc));
                    }
                },
                _ => {}
            }
        }
        Ok(())
    }

    // Logical memory footprint used by the governor's accounting:
    // instruction slots plus table slots plus string bytes with
    // their terminators.
    pub fn footprint(&self) -> usize {
        let tables = [
            &self.string_pool,
            &self.variable_names,
            &self.property_names,
            &self.function_names,
        ];
        let mut size = self.instructions.len()
            * core::mem::size_of::<Opcode>();
        for table in &tables {
            size += table.len() * core::mem::size_of::<String>();
            size += table.iter().map(|s| s.len() + 1).sum::<usize>();
        }
        size
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&WIRE_MAGIC);
        out.push(WIRE_VERSION);

        for count in &[
            self.instructions.len(),
            self.string_pool.len(),
            self.variable_names.len(),
            self.property_names.len(),
            self.function_names.len(),
        ] {
            out.extend_from_slice(&(*count as u16).to_le_bytes());
        }

        for op in &self.instructions {
            encode_op(op, &mut out);
        }

        for table in &[
            &self.string_pool,
            &self.variable_names,
            &self.property_names,
            &self.function_names,
        ] {
            for s in table.iter() {
                out.extend_from_slice(&(s.len() as u16).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
        }

        out
    }

    pub fn decode(raw: &[u8]) -> CodecResult<Program> {
        let mut r = Reader { raw, at: 0 };

        if r.take(4)? != WIRE_MAGIC {
            return Err(CodecError::BadMagic);
        }
        let version = r.u8()?;
        if version != WIRE_VERSION {
            return Err(CodecError::BadVersion(version));
        }

        let instr_count = r.u16()? as usize;
        let counts = [r.u16()? as usize, r.u16()? as usize,
                      r.u16()? as usize, r.u16()? as usize];

        let mut program = Program::with_capacity(
            instr_count, counts[0], counts[1], counts[2], counts[3]
        );

        for _ in 0..instr_count {
            program.instructions.push(decode_op(&mut r)?);
        }

        for (t, &count) in counts.iter().enumerate() {
            for _ in 0..count {
                let len = r.u16()? as usize;
                let bytes = r.take(len)?;
                let s = String::from_utf8(bytes.to_vec())
                    .map_err(|_| CodecError::BadString)?;
                match t {
                    0 => program.string_pool.push(s),
                    1 => program.variable_names.push(s),
                    2 => program.property_names.push(s),
                    _ => program.function_names.push(s),
                }
            }
        }

        Ok(program)
    }

    pub fn to_base64(&self) -> String {
        base64::encode(self.encode())
    }

    pub fn from_base64(text: &str) -> CodecResult<Program> {
        let raw = base64::decode(text).map_err(|_| CodecError::BadBase64)?;
        Program::decode(&raw)
    }
}


struct Reader<'a> {
    raw: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        if self.at + n > self.raw.len() {
            return Err(CodecError::Truncated);
        }
        let slice = &self.raw[self.at..self.at + n];
        self.at += n;
        Ok(slice)
    }

    fn u8(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> CodecResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }
}


fn binop_code(op: BinOp) -> u8 {
    match op {
        BinOp::Add => 0,
        BinOp::Sub => 1,
        BinOp::Mul => 2,
        BinOp::Div => 3,
        BinOp::Mod => 4,
        BinOp::Lt => 5,
        BinOp::Gt => 6,
        BinOp::Lte => 7,
        BinOp::Gte => 8,
        BinOp::Eq => 9,
        BinOp::Neq => 10,
        BinOp::And => 11,
        BinOp::Or => 12,
    }
}

fn binop_from(code: u8) -> CodecResult<BinOp> {
    Ok(match code {
        0 => BinOp::Add,
        1 => BinOp::Sub,
        2 => BinOp::Mul,
        3 => BinOp::Div,
        4 => BinOp::Mod,
        5 => BinOp::Lt,
        6 => BinOp::Gt,
        7 => BinOp::Lte,
        8 => BinOp::Gte,
        9 => BinOp::Eq,
        10 => BinOp::Neq,
        11 => BinOp::And,
        12 => BinOp::Or,
        _ => return Err(CodecError::BadOperand),
    })
}


// One tag byte plus a fixed four-byte operand area. Unused operand
// bytes stay zero so the wire form is deterministic.
fn encode_op(op: &Opcode, out: &mut Vec<u8>) {
    let mut operand = [0u8; 4];
    let tag: u8 = match op {
        Opcode::PushNum(n) => {
            operand.copy_from_slice(&n.to_le_bytes());
            0
        },
        Opcode::PushStr(i) => {
            operand[..2].copy_from_slice(&i.to_le_bytes());
            1
        },
        Opcode::PushBool(b) => {
            operand[0] = *b as u8;
            2
        },
        Opcode::PushNull => 3,
        Opcode::Pop => 4,
        Opcode::Dup => 5,
        Opcode::LoadVar(i) => {
            operand[..2].copy_from_slice(&i.to_le_bytes());
            6
        },
        Opcode::StoreVar(i) => {
            operand[..2].copy_from_slice(&i.to_le_bytes());
            7
        },
        Opcode::Binary(b) => {
            operand[0] = binop_code(*b);
            8
        },
        Opcode::Unary(u) => {
            operand[0] = match u { UnOp::Not => 0, UnOp::Neg => 1 };
            9
        },
        Opcode::Jump(t) => {
            operand[..2].copy_from_slice(&t.to_le_bytes());
            10
        },
        Opcode::JumpIfFalse(t) => {
            operand[..2].copy_from_slice(&t.to_le_bytes());
            11
        },
        Opcode::Call { func, argc } => {
            operand[..2].copy_from_slice(&func.to_le_bytes());
            operand[2] = *argc;
            12
        },
        Opcode::Return => 13,
        Opcode::Halt => 14,
    };
    out.push(tag);
    out.extend_from_slice(&operand);
}

fn decode_op(r: &mut Reader) -> CodecResult<Opcode> {
    let tag = r.u8()?;
    let operand = r.take(INSTRUCTION_BYTES - 1)?;
    let u16_op = u16::from_le_bytes([operand[0], operand[1]]);

    Ok(match tag {
        0 => Opcode::PushNum(f32::from_le_bytes([
            operand[0], operand[1], operand[2], operand[3]
        ])),
        1 => Opcode::PushStr(u16_op),
        2 => Opcode::PushBool(operand[0] != 0),
        3 => Opcode::PushNull,
        4 => Opcode::Pop,
        5 => Opcode::Dup,
        6 => Opcode::LoadVar(u16_op),
        7 => Opcode::StoreVar(u16_op),
        8 => Opcode::Binary(binop_from(operand[0])?),
        9 => match operand[0] {
            0 => Opcode::Unary(UnOp::Not),
            1 => Opcode::Unary(UnOp::Neg),
            _ => return Err(CodecError::BadOperand),
        },
        10 => Opcode::Jump(u16_op),
        11 => Opcode::JumpIfFalse(u16_op),
        12 => Opcode::Call { func: u16_op, argc: operand[2] },
        13 => Opcode::Return,
        14 => Opcode::Halt,
        other => return Err(CodecError::BadOpcode(other)),
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::Opcode::*;

    fn sample() -> Program {
        Program {
            instructions: vec![
                PushNum(2.0),
                PushNum(3.0),
                Binary(BinOp::Add),
                StoreVar(0),
                LoadVar(0),
                PushStr(0),
                Call { func: 0, argc: 2 },
                Halt,
            ],
            string_pool: vec![String::from("celsius")],
            variable_names: vec![String::from("sum")],
            property_names: vec![],
            function_names: vec![String::from("convert")],
        }
    }

    #[test]
    fn test_wire_round_trip() {
        let program = sample();
        let decoded = Program::decode(&program.encode()).unwrap();
        assert_eq!(decoded, program);
    }

    #[test]
    fn test_base64_round_trip() {
        let program = sample();
        let decoded = Program::from_base64(&program.to_base64()).unwrap();
        assert_eq!(decoded, program);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(Program::decode(b"oops"), Err(CodecError::BadMagic));
        assert_eq!(Program::decode(b"MCP"), Err(CodecError::Truncated));
        assert_eq!(
            Program::from_base64("!!not base64!!"),
            Err(CodecError::BadBase64)
        );

        let mut raw = sample().encode();
        raw[4] = 99;
        assert_eq!(Program::decode(&raw), Err(CodecError::BadVersion(99)));

        let mut raw = sample().encode();
        raw.truncate(raw.len() - 3);
        assert!(Program::decode(&raw).is_err());
    }

    #[test]
    fn test_validate_catches_bad_indices() {
        let mut p = sample();
        assert_eq!(p.validate(), Ok(()));

        p.instructions[5] = PushStr(7);
        assert_eq!(p.validate(), Err(ProgramError::StringOutOfRange(5)));

        let mut p = sample();
        p.instructions[0] = Jump(100);
        assert_eq!(p.validate(), Err(ProgramError::JumpOutOfRange(0)));

        // A jump to one-past-the-end is a legal halt.
        let mut p = sample();
        p.instructions[0] = Jump(8);
        assert_eq!(p.validate(), Ok(()));

        let mut p = sample();
        p.instructions[3] = StoreVar(1);
        assert_eq!(p.validate(), Err(ProgramError::VariableOutOfRange(3)));

        let mut p = sample();
        p.instructions[6] = Call { func: 1, argc: 0 };
        assert_eq!(p.validate(), Err(ProgramError::FunctionOutOfRange(6)));
    }

    #[test]
    fn test_stack_effects() {
        assert_eq!(PushNum(1.0).stack_effect(), (0, 1));
        assert_eq!(Binary(BinOp::Add).stack_effect(), (2, 1));
        assert_eq!(Call { func: 0, argc: 3 }.stack_effect(), (3, 1));
        assert_eq!(Pop.stack_effect(), (1, 0));
    }

    #[test]
    fn test_footprint_counts_strings() {
        let empty = Program::default();
        let with_strings = sample();
        assert!(with_strings.footprint() > empty.footprint());
    }
}
