use std::env;
use std::process::ExitCode as ProcessExitCode;

use corvid::gc::Config;
use corvid::source::Source;
use corvid::{run, ExitCode, RunError};

fn main() -> ProcessExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args: Vec<String> = env::args().skip(1).collect();
    let disassemble = if let Some(pos) = args.iter().position(|a| a == "--disassemble") {
        args.remove(pos);
        true
    } else {
        false
    };

    let path = match args.first() {
        Some(p) => p,
        None => {
            eprintln!("usage: corvid [--disassemble] <script>");
            return ProcessExitCode::from(ExitCode::CompileError as u8);
        }
    };

    let source = match Source::path(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("can't read '{}': {}", path, e);
            return ProcessExitCode::from(ExitCode::CompileError as u8);
        }
    };

    if disassemble {
        return disassemble_only(source);
    }

    match run(source, Config::default()) {
        Ok(()) => ProcessExitCode::from(ExitCode::Ok as u8),
        Err(RunError::Compile(errors)) => {
            for e in &errors {
                eprintln!("{}", e);
            }
            ProcessExitCode::from(ExitCode::CompileError as u8)
        }
        Err(RunError::Runtime(trace)) => {
            eprintln!("{}", trace);
            ProcessExitCode::from(ExitCode::RuntimeError as u8)
        }
    }
}

fn disassemble_only(source: std::rc::Rc<Source>) -> ProcessExitCode {
    let mut heap = corvid::gc::Heap::new(Config::default());
    match corvid::compiler::compile(source, &mut heap) {
        Ok(function) => {
            if let corvid::gc::objects::ObjData::Function(f) = heap.get(function) {
                print!("{}", f.chunk.disassemble("script", &heap));
            }
            ProcessExitCode::from(ExitCode::Ok as u8)
        }
        Err(errors) => {
            for e in &errors {
                eprintln!("{}", e);
            }
            ProcessExitCode::from(ExitCode::CompileError as u8)
        }
    }
}
