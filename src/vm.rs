// (C) 2020 Brandon Lewis
//
// Bytecode interpreter.
//
// A fetch-decode-execute loop over the program model in `bytecode`,
// driving one ExecContext per invocation. The loop is strongly
// typed and bounded on every axis:
//
//   - every opcode declares its stack effect, checked before the
//     handler runs; over- and underflow are faults, not UB
//   - jump targets and table indices were checked by the program
//     validator, and are re-checked here before use
//   - execution time is sampled against the monotonic clock at
//     every backward branch and at every host call; exceeding the
//     ceiling faults with Timeout and unwinds cleanly
//
// Every termination writes its status into the context's error
// slot. The success path leaves the program's result at the top of
// the stack, which run() hands back to the caller.
//
// Calls go to host functions resolved through the program's
// function-name table; there is no intra-program call mechanism,
// so Return is a conventional halt.

use std::collections::HashMap;

use crate::bytecode::{Opcode, Program};
use crate::clock::Clock;
use crate::value::{Value, ValueError};


#[derive(Clone, Debug, PartialEq)]
pub enum Fault {
    InvalidProgram,
    StackOverflow,
    StackUnderflow,
    IllegalAddress(usize),
    NotBoolean,
    TypeFault(ValueError),
    HostFunctionMissing(String),
    Timeout,
}

impl Fault {
    pub fn code(&self) -> i32 {
        match self {
            Fault::InvalidProgram => -1,
            Fault::StackOverflow => -2,
            Fault::StackUnderflow => -3,
            Fault::IllegalAddress(_) => -4,
            Fault::NotBoolean => -5,
            Fault::TypeFault(_) => -6,
            Fault::HostFunctionMissing(_) => -7,
            Fault::Timeout => -8,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Fault::InvalidProgram => String::from("invalid program"),
            Fault::StackOverflow => String::from("stack overflow"),
            Fault::StackUnderflow => String::from("stack underflow"),
            Fault::IllegalAddress(at) => format!("illegal address {}", at),
            Fault::NotBoolean => String::from("condition is not a boolean"),
            Fault::TypeFault(e) => format!("type fault: {:?}", e),
            Fault::HostFunctionMissing(name) =>
                format!("host function missing: {}", name),
            Fault::Timeout => String::from("execution time ceiling exceeded"),
        }
    }
}

pub type VmResult<T> = core::result::Result<T, Fault>;


// Per-invocation execution state: value stack with a fixed
// capacity, one slot per declared variable, program counter, halt
// flag, error slot. Created through the governor, which stamps the
// accounted size.
pub struct ExecContext {
    pub stack: Vec<Value>,
    pub stack_limit: usize,
    pub variables: Vec<Value>,
    pub pc: usize,
    pub halted: bool,
    pub error: Option<Fault>,
    pub(crate) charged: usize,
}

impl ExecContext {
    pub(crate) fn with_quota(
        stack_limit: usize,
        variable_count: usize,
        charged: usize
    ) -> ExecContext {
        ExecContext {
            stack: Vec::with_capacity(stack_limit),
            stack_limit,
            variables: vec![Value::Null; variable_count],
            pc: 0,
            halted: false,
            error: None,
            charged,
        }
    }

    // Bind a named variable before execution; used to pass tool
    // parameters into a program.
    pub fn seed(&mut self, program: &Program, name: &str, value: Value)
        -> bool
    {
        match program.variable_names.iter().position(|n| n == name) {
            Some(index) => {
                self.variables[index] = value;
                true
            },
            None => false,
        }
    }

    pub fn push(&mut self, value: Value) -> VmResult<()> {
        if self.stack.len() >= self.stack_limit {
            return Err(Fault::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or(Fault::StackUnderflow)
    }

    pub fn error_code(&self) -> i32 {
        self.error.as_ref().map_or(0, Fault::code)
    }
}


pub type HostFn = Box<dyn Fn(&[Value]) -> Value>;

// Host functions callable from bytecode, resolved by name through
// the program's function table at each call.
pub struct HostFunctions {
    functions: HashMap<String, HostFn>,
}

impl HostFunctions {
    pub fn new() -> HostFunctions {
        HostFunctions { functions: HashMap::new() }
    }

    pub fn register(&mut self, name: &str, f: HostFn) {
        self.functions.insert(String::from(name), f);
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Option<Value> {
        self.functions.get(name).map(|f| f(args))
    }
}


// The type of control flow an instruction can have.
enum ControlFlow {
    Advance,
    Branch(usize),
    Halt,
}


pub struct Interpreter<'a> {
    program: &'a Program,
    host: &'a HostFunctions,
}

impl<'a> Interpreter<'a> {
    pub fn new(program: &'a Program, host: &'a HostFunctions)
        -> Interpreter<'a>
    {
        Interpreter { program, host }
    }

    // Run to completion. A limit of zero means no time ceiling.
    pub fn run(
        &self,
        ctx: &mut ExecContext,
        clock: &Clock,
        limit_ms: u32
    ) -> VmResult<Value> {
        let result = self.run_inner(ctx, clock, limit_ms);
        ctx.halted = true;
        if let Err(fault) = &result {
            ctx.error = Some(fault.clone());
        }
        result
    }

    fn run_inner(
        &self,
        ctx: &mut ExecContext,
        clock: &Clock,
        limit_ms: u32
    ) -> VmResult<Value> {
        if self.program.validate().is_err() {
            return Err(Fault::InvalidProgram);
        }

        let start = clock.now_ms();
        let code = &self.program.instructions;

        loop {
            // Falling off the end is an implicit halt.
            if ctx.pc >= code.len() {
                break;
            }

            let op = code[ctx.pc];

            let (pops, pushes) = op.stack_effect();
            if ctx.stack.len() < pops {
                return Err(Fault::StackUnderflow);
            }
            if ctx.stack.len() - pops + pushes > ctx.stack_limit {
                return Err(Fault::StackOverflow);
            }

            match self.dispatch(op, ctx, clock, start, limit_ms)? {
                ControlFlow::Advance => ctx.pc += 1,
                ControlFlow::Branch(target) => {
                    if target <= ctx.pc {
                        check_deadline(clock, start, limit_ms)?;
                    }
                    ctx.pc = target;
                },
                ControlFlow::Halt => break,
            }
        }

        Ok(ctx.stack.pop().unwrap_or(Value::Null))
    }

    fn dispatch(
        &self,
        op: Opcode,
        ctx: &mut ExecContext,
        clock: &Clock,
        start: u64,
        limit_ms: u32
    ) -> VmResult<ControlFlow> {
        match op {
            Opcode::PushNum(n) => {
                ctx.push(Value::Float(n))?;
                Ok(ControlFlow::Advance)
            },

            Opcode::PushStr(index) => {
                let s = self.program.string_pool
                    .get(index as usize)
                    .ok_or(Fault::IllegalAddress(index as usize))?;
                ctx.push(Value::Str(s.clone()))?;
                Ok(ControlFlow::Advance)
            },

            Opcode::PushBool(b) => {
                ctx.push(Value::Bool(b))?;
                Ok(ControlFlow::Advance)
            },

            Opcode::PushNull => {
                ctx.push(Value::Null)?;
                Ok(ControlFlow::Advance)
            },

            Opcode::Pop => {
                ctx.pop()?;
                Ok(ControlFlow::Advance)
            },

            Opcode::Dup => {
                let top = ctx.pop()?;
                ctx.push(top.clone())?;
                ctx.push(top)?;
                Ok(ControlFlow::Advance)
            },

            Opcode::LoadVar(index) => {
                let value = ctx.variables
                    .get(index as usize)
                    .cloned()
                    .ok_or(Fault::IllegalAddress(index as usize))?;
                ctx.push(value)?;
                Ok(ControlFlow::Advance)
            },

            Opcode::StoreVar(index) => {
                let value = ctx.pop()?;
                let slot = ctx.variables
                    .get_mut(index as usize)
                    .ok_or(Fault::IllegalAddress(index as usize))?;
                *slot = value;
                Ok(ControlFlow::Advance)
            },

            Opcode::Binary(binop) => {
                let b = ctx.pop()?;
                let a = ctx.pop()?;
                let result = Value::apply_binary(binop, &a, &b)
                    .map_err(Fault::TypeFault)?;
                ctx.push(result)?;
                Ok(ControlFlow::Advance)
            },

            Opcode::Unary(unop) => {
                let v = ctx.pop()?;
                let result = Value::apply_unary(unop, &v)
                    .map_err(Fault::TypeFault)?;
                ctx.push(result)?;
                Ok(ControlFlow::Advance)
            },

            Opcode::Jump(target) => Ok(ControlFlow::Branch(target as usize)),

            Opcode::JumpIfFalse(target) => {
                match ctx.pop()? {
                    Value::Bool(false) => Ok(ControlFlow::Branch(target as usize)),
                    Value::Bool(true) => Ok(ControlFlow::Advance),
                    _ => Err(Fault::NotBoolean),
                }
            },

            Opcode::Call { func, argc } => {
                check_deadline(clock, start, limit_ms)?;

                let name = self.program.function_names
                    .get(func as usize)
                    .ok_or(Fault::IllegalAddress(func as usize))?;

                let mut args = Vec::with_capacity(argc as usize);
                for _ in 0..argc {
                    args.push(ctx.pop()?);
                }
                args.reverse();

                let result = self.host
                    .call(name, &args)
                    .ok_or_else(|| Fault::HostFunctionMissing(name.clone()))?;

                ctx.push(result)?;
                Ok(ControlFlow::Advance)
            },

            Opcode::Return | Opcode::Halt => Ok(ControlFlow::Halt),
        }
    }
}


fn check_deadline(clock: &Clock, start: u64, limit_ms: u32) -> VmResult<()> {
    if limit_ms > 0 && clock.now_ms().saturating_sub(start) > u64::from(limit_ms) {
        return Err(Fault::Timeout);
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Opcode::*;
    use crate::value::BinOp;
    use crate::value::Value::*;

    fn ctx(stack: usize, vars: usize) -> ExecContext {
        ExecContext::with_quota(stack, vars, 0)
    }

    fn run(program: &Program, context: &mut ExecContext) -> VmResult<Value> {
        let host = HostFunctions::new();
        let clock = Clock::new();
        let result = Interpreter::new(program, &host)
            .run(context, &clock, 1000);
        trace!("run: {:?}", result);
        result
    }

    fn program(instructions: Vec<Opcode>) -> Program {
        Program { instructions, ..Program::default() }
    }

    #[test]
    fn test_arithmetic() {
        let p = program(vec![
            PushNum(2.0),
            PushNum(3.0),
            Binary(BinOp::Add),
            Halt,
        ]);
        assert_eq!(run(&p, &mut ctx(4, 0)), Ok(Float(5.0)));
    }

    #[test]
    fn test_implicit_halt_at_end() {
        let p = program(vec![PushNum(7.0)]);
        assert_eq!(run(&p, &mut ctx(4, 0)), Ok(Float(7.0)));
    }

    #[test]
    fn test_variables() {
        let p = Program {
            instructions: vec![
                PushNum(21.0),
                StoreVar(0),
                LoadVar(0),
                LoadVar(0),
                Binary(BinOp::Add),
                Halt,
            ],
            variable_names: vec![String::from("x")],
            ..Program::default()
        };
        assert_eq!(run(&p, &mut ctx(4, 1)), Ok(Float(42.0)));
    }

    #[test]
    fn test_seeded_variable() {
        let p = Program {
            instructions: vec![LoadVar(0), Halt],
            variable_names: vec![String::from("input")],
            ..Program::default()
        };
        let mut c = ctx(2, 1);
        assert!(c.seed(&p, "input", Str(String::from("hi"))));
        assert!(!c.seed(&p, "nonsense", Null));
        assert_eq!(run(&p, &mut c), Ok(Str(String::from("hi"))));
    }

    #[test]
    fn test_branching() {
        // if (5 > 3) 1 else 2
        let p = program(vec![
            PushNum(5.0),
            PushNum(3.0),
            Binary(BinOp::Gt),
            JumpIfFalse(6),
            PushNum(1.0),
            Jump(7),
            PushNum(2.0),
            Halt,
        ]);
        assert_eq!(run(&p, &mut ctx(4, 0)), Ok(Float(1.0)));
    }

    #[test]
    fn test_loop_counts_down() {
        // x = 3; while (x > 0) x = x - 1; result x
        let p = Program {
            instructions: vec![
                PushNum(3.0),
                StoreVar(0),
                LoadVar(0),              // 2: loop head
                PushNum(0.0),
                Binary(BinOp::Gt),
                JumpIfFalse(11),
                LoadVar(0),
                PushNum(1.0),
                Binary(BinOp::Sub),
                StoreVar(0),
                Jump(2),                 // backward branch
                LoadVar(0),
                Halt,
            ],
            variable_names: vec![String::from("x")],
            ..Program::default()
        };
        assert_eq!(run(&p, &mut ctx(4, 1)), Ok(Float(0.0)));
    }

    #[test]
    fn test_stack_overflow() {
        let p = program(vec![PushNum(1.0), PushNum(2.0), PushNum(3.0)]);
        let mut c = ctx(2, 0);
        assert_eq!(run(&p, &mut c), Err(Fault::StackOverflow));
        assert_eq!(c.error, Some(Fault::StackOverflow));
        assert!(c.halted);
    }

    #[test]
    fn test_stack_underflow() {
        let p = program(vec![Pop]);
        assert_eq!(run(&p, &mut ctx(2, 0)), Err(Fault::StackUnderflow));
    }

    #[test]
    fn test_type_fault() {
        let p = program(vec![
            PushBool(true),
            PushNum(1.0),
            Binary(BinOp::Add),
        ]);
        let mut c = ctx(4, 0);
        match run(&p, &mut c) {
            Err(Fault::TypeFault(_)) => {},
            other => panic!("expected type fault, got {:?}", other),
        }
        assert!(c.error_code() < 0);
    }

    #[test]
    fn test_condition_must_be_boolean() {
        let p = program(vec![PushNum(1.0), JumpIfFalse(0)]);
        assert_eq!(run(&p, &mut ctx(2, 0)), Err(Fault::NotBoolean));
    }

    #[test]
    fn test_invalid_program_rejected() {
        let p = program(vec![PushStr(0)]);
        assert_eq!(run(&p, &mut ctx(2, 0)), Err(Fault::InvalidProgram));
    }

    #[test]
    fn test_host_call() {
        let p = Program {
            instructions: vec![
                PushNum(2.0),
                PushNum(3.0),
                Call { func: 0, argc: 2 },
                Halt,
            ],
            function_names: vec![String::from("mul")],
            ..Program::default()
        };

        let mut host = HostFunctions::new();
        host.register("mul", Box::new(|args: &[Value]| {
            match (args[0].as_number(), args[1].as_number()) {
                (Some(a), Some(b)) => Float(a * b),
                _ => Null,
            }
        }));

        let clock = Clock::new();
        let mut c = ctx(4, 0);
        let result = Interpreter::new(&p, &host).run(&mut c, &clock, 1000);
        assert_eq!(result, Ok(Float(6.0)));
    }

    #[test]
    fn test_missing_host_function() {
        let p = Program {
            instructions: vec![Call { func: 0, argc: 0 }],
            function_names: vec![String::from("nope")],
            ..Program::default()
        };
        assert_eq!(
            run(&p, &mut ctx(2, 0)),
            Err(Fault::HostFunctionMissing(String::from("nope")))
        );
    }

    #[test]
    fn test_timeout_on_infinite_loop() {
        let p = program(vec![Jump(0)]);
        let clock = Clock::new();
        let host = HostFunctions::new();
        let mut c = ctx(2, 0);
        let result = Interpreter::new(&p, &host).run(&mut c, &clock, 1);
        assert_eq!(result, Err(Fault::Timeout));
        assert_eq!(c.error, Some(Fault::Timeout));
    }

    #[test]
    fn test_empty_program_yields_null() {
        let p = program(vec![]);
        assert_eq!(run(&p, &mut ctx(2, 0)), Ok(Null));
    }
}
