#![warn(clippy::all)]

mod assembler;
mod builtins;
mod bytecode;
mod compiler;
mod lexer;
mod parser;
mod source;
mod value;
mod vm;

use compiler::Compiler;
use source::SourceManager;
use vm::Vm;

fn print_help() {
    println!("MonDot Compiler & VM");
    println!("Usage:");
    println!("  mondot build <file.mon> -o <output.mdotc>");
    println!("  mondot run <file.mdotc>");
    println!("  mondot dump <file.mdotc>");
    println!("  mondot <file.mon>          (compiles and runs in memory)");
}

/// Reads, compiles, and optimizes a source file. Diagnostics have already
/// been reported through the SourceManager on failure.
fn compile_file(path: &str) -> Result<Compiler, ()> {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error when opening {path}: {e}");
            return Err(());
        }
    };
    let sm = SourceManager::new(source, path);
    let mut comp = Compiler::new();
    if parser::compile_unit(&mut comp, &sm).is_err() {
        return Err(());
    }
    comp.asm.optimize(2);
    Ok(comp)
}

fn main() {
    builtins::std_lib::register_default_builtins();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_help();
        return;
    }

    match args[1].as_str() {
        "build" => {
            if args.len() < 5 || args[3] != "-o" {
                print_help();
                std::process::exit(1);
            }
            let Ok(comp) = compile_file(&args[2]) else {
                std::process::exit(1);
            };
            if let Err(e) = bytecode::save(&args[4], &comp.asm) {
                eprintln!("Error writing {}: {e}", args[4]);
                std::process::exit(1);
            }
            println!("Compiled successfully for {}", args[4]);
        }
        "run" => {
            if args.len() < 3 {
                print_help();
                std::process::exit(1);
            }
            match bytecode::load(&args[2]) {
                Ok(asm) => Vm::new(&asm).run(),
                Err(e) => {
                    eprintln!("Error loading {}: {e}", args[2]);
                    std::process::exit(1);
                }
            }
        }
        "dump" => {
            if args.len() < 3 {
                print_help();
                std::process::exit(1);
            }
            match bytecode::load(&args[2]) {
                Ok(asm) => print!("{}", bytecode::disassemble(&asm)),
                Err(e) => {
                    eprintln!("Error loading {}: {e}", args[2]);
                    std::process::exit(1);
                }
            }
        }
        path => {
            let Ok(comp) = compile_file(path) else {
                std::process::exit(1);
            };
            Vm::new(&comp.asm).run();
        }
    }
}
