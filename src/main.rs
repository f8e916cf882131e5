mod call_frame;
mod chunk;
mod compiler;
#[cfg_attr(
    not(any(feature = "debug_trace_execution", feature = "debug_print_code")),
    allow(dead_code)
)]
mod debug;
mod gc;
mod memory;
mod object_manager;
mod objects;
mod scanner;
mod std_mod;
mod table;
mod value;
mod vm;

use std::io::{BufRead, Write};
use std::process::exit;

use vm::{InterpretResult, VM};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    match args.len() {
        1 => repl(),
        2 => run_file(&args[1]),
        _ => {
            eprintln!("Usage: loxvm [path]");
            exit(64);
        }
    }
}

fn repl() {
    let mut vm = VM::new();
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    loop {
        print!("> ");
        let _ = stdout.flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => {
                println!();
                break;
            }
            Ok(_) => {}
        }

        // Errors are reported and the session continues.
        vm.interpret(&line, &mut stdout);
    }
}

fn run_file(path: &str) {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("Could not read file \"{}\": {}.", path, error);
            exit(74);
        }
    };

    let mut vm = VM::new();
    let mut stdout = std::io::stdout();
    match vm.interpret(&source, &mut stdout) {
        InterpretResult::Ok => {}
        InterpretResult::CompileError => exit(65),
        InterpretResult::RuntimeError => exit(70),
    }
}
