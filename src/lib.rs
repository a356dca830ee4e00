//! Corvid: a single-pass bytecode compiler, stack VM, and generational
//! garbage collector for a small dynamically-typed scripting language.

pub mod chunk;
pub mod compiler;
pub mod gc;
pub mod lexer;
pub mod numeric;
pub mod opcode;
pub mod source;
pub mod span;
pub mod syntax;
pub mod token;
pub mod trace;
pub mod value;
pub mod vm;

use std::rc::Rc;

use gc::{Config, Heap};
use source::Source;
use syntax::Syntax;
use trace::Trace;

/// Exit code convention shared by the CLI driver: 0 success, 65 compile
/// error (EX_DATAERR), 70 runtime error (EX_SOFTWARE).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Ok = 0,
    CompileError = 65,
    RuntimeError = 70,
}

pub enum RunError {
    Compile(Vec<Syntax>),
    Runtime(Trace),
}

impl RunError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            RunError::Compile(_) => ExitCode::CompileError,
            RunError::Runtime(_) => ExitCode::RuntimeError,
        }
    }
}

/// Compiles and runs a complete program, using a fresh heap with the
/// given GC tuning. This is the entry point both the CLI and integration
/// tests drive.
pub fn run(source: Rc<Source>, config: Config) -> Result<(), RunError> {
    let mut heap = Heap::new(config);
    let function = compiler::compile(source, &mut heap).map_err(RunError::Compile)?;
    let mut machine = vm::Vm::new(&mut heap);
    machine.interpret(function).map_err(RunError::Runtime)
}
