/// Module for managing source code: the character-tracking buffer and the tokenizer built on it.
#[macro_use]
mod lang;

/// Module for the runtime: the data structures, the interpreter trait family and its concrete
/// `Vm`, and the native words registered onto it.
#[macro_use]
mod runtime;

use lang::tokenizing::tokenize_from_file;
use runtime::{
    built_ins::{
        base_words::register_base_words, core_words::register_core_words,
        uv_words::register_uv_words,
    },
    error,
    interpreter::{Execution, Interpreter, RunControl, vm::Vm},
};
use std::{
    env::args,
    io::{self, BufRead, Write},
};

/// Build a fresh interpreter with every native word registered.
fn new_interpreter() -> error::Result<Vm> {
    let mut interpreter = Vm::new()?;

    register_base_words(&mut interpreter);
    register_core_words(&mut interpreter);
    register_uv_words(&mut interpreter);

    Ok(interpreter)
}

/// Tokenize and interpret each file argument, in order.
fn run_files(interpreter: &mut dyn Interpreter, paths: &[String]) -> error::Result<()> {
    for path in paths {
        let tokens = tokenize_from_file(path)?;
        interpreter.interpret_tokens(&tokens)?;
    }

    Ok(())
}

/// Read lines from standard input, tokenizing and interpreting each as it arrives, until EOF or
/// `bye` clears the running flag. No `ok` banner is printed between lines -- only what the script
/// itself writes via `print`/`cr`/`words`.
fn run_repl(interpreter: &mut dyn Interpreter) -> error::Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    while interpreter.is_running() {
        let Some(line) = lines.next() else {
            break;
        };

        let line = line?;
        let tokens = lang::tokenizing::tokenize_from_source("<repl>", &line)?;
        interpreter.interpret_tokens(&tokens)?;
    }

    Ok(())
}

fn main() -> error::Result<()> {
    let mut interpreter = new_interpreter()?;
    let args: Vec<String> = args().collect();

    if args.len() >= 2 {
        run_files(&mut interpreter, &args[1..])?;
    } else {
        run_repl(&mut interpreter)?;
    }

    io::stdout().flush()?;

    Ok(())
}
