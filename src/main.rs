use clap::{Parser, ValueEnum};
use nox_rs::bytefile;
use nox_rs::interpreter::Interpreter;
use nox_rs::parser;
use nox_rs::x64;
use std::fs;

/// nox bytecode toolchain driver
#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
    /// Input program: .noxtbc (textual bytecode) or .noxbc (binary image)
    file: String,

    /// What to produce
    #[arg(value_enum, short, long, default_value_t = Output::Run)]
    out: Output,

    /// Where to write the result (defaults to stdout)
    #[arg(short = 'O', long)]
    output: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Output {
    /// Interpret the program; the process exits with the program's code
    Run,
    /// Windows-x64 NASM assembly
    Asm,
    /// Re-rendered textual bytecode
    Text,
    /// Serialized binary image
    Bin,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.file.ends_with(".noxbc") {
        // Binary images drop names and labels, so they can only be run.
        if args.out != Output::Run {
            return Err("binary images can only be run".into());
        }
        let bytefile = bytefile::read_file(&args.file)?;
        let code = Interpreter::from_bytefile(&bytefile).run().map_err(|err| {
            eprintln!("{}", err);
            err
        })?;
        std::process::exit(code as i32);
    }

    let text = fs::read_to_string(&args.file)?;
    let program = parser::parse(&text)?;

    match args.out {
        Output::Run => {
            let code = Interpreter::new(&program).run().map_err(|err| {
                eprintln!("{}", err);
                err
            })?;
            std::process::exit(code as i32);
        }
        Output::Asm => emit(&args.output, x64::compile(&program))?,
        Output::Text => emit(&args.output, format!("{}\n", program))?,
        Output::Bin => {
            let path = args
                .output
                .ok_or("--output <path> is required for binary output")?;
            bytefile::write_file(path, &program)?;
        }
    }
    Ok(())
}

fn emit(output: &Option<String>, text: String) -> std::io::Result<()> {
    match output {
        Some(path) => fs::write(path, text),
        None => {
            print!("{}", text);
            Ok(())
        }
    }
}
