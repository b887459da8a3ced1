//! Ferrule CLI and REPL
//!
//! Usage:
//!   ferrule run <file.fer> [name=value...]   - Execute a script
//!   ferrule check <file.fer>                 - Compile without running
//!   ferrule disasm <file.fer>                - Print the bytecode
//!   ferrule repl                             - Start interactive REPL

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing_subscriber::EnvFilter;

use ferrule::config::parse_binding;
use ferrule::{Engine, EngineConfig, ErrorKind, FerruleError, Value, VERSION};

#[derive(Parser)]
#[command(author, version, about = "Ferrule scripting language")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a Ferrule script
    Run {
        script: PathBuf,
        /// `name=value` bindings for `option` globals
        bindings: Vec<String>,
        /// Function to run after startup
        #[arg(long)]
        start: Option<String>,
        /// File holding `persist` globals
        #[arg(long)]
        persist: Option<PathBuf>,
    },
    /// Compile a script and report errors without running it
    Check { script: PathBuf },
    /// Print the compiled bytecode of a script
    Disasm { script: PathBuf },
    /// Start an interactive REPL session
    Repl,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("FERRULE_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let result = match args.command.unwrap_or(Command::Repl) {
        Command::Run { script, bindings, start, persist } => run_file(script, &bindings, start, persist),
        Command::Check { script } => check_file(script),
        Command::Disasm { script } => disassemble_file(script),
        Command::Repl => run_repl(),
    };

    if let Err(err) = result {
        eprintln!("{}", err.to_string().red());
        process::exit(1);
    }
}

fn run_file(
    script: PathBuf,
    bindings: &[String],
    start: Option<String>,
    persist: Option<PathBuf>,
) -> ferrule::Result<()> {
    let mut config = EngineConfig::default();
    for binding in bindings {
        let (name, value) = parse_binding(binding)?;
        config = config.with_option(name, value);
    }
    if let Some(start) = start {
        config = config.with_start(start);
    }
    if let Some(persist) = persist {
        config = config.with_persist_path(persist);
    }

    let value = Engine::new(config).run_file(&script)?;
    if value != Value::Void {
        println!("{}", value);
    }
    Ok(())
}

fn check_file(script: PathBuf) -> ferrule::Result<()> {
    Engine::default().compile_file(&script)?;
    println!("{}: {}", script.display(), "ok".green());
    Ok(())
}

fn disassemble_file(script: PathBuf) -> ferrule::Result<()> {
    let program = Engine::default().compile_file(&script)?;
    println!("{}", program.disassemble());
    Ok(())
}

/// Each line is compiled after the declarations entered so far. A line that
/// leaves the program without a start function is a declaration and is
/// kept; anything else runs once and is forgotten.
fn run_repl() -> ferrule::Result<()> {
    println!("{} {} - {}", "Ferrule".cyan().bold(), VERSION.cyan(), "statically typed scripting".dimmed());
    println!("Type {} to exit, {} for help\n", "exit".yellow(), "help".yellow());

    let mut rl = DefaultEditor::new().map_err(|e| FerruleError::new(ErrorKind::Io(e.to_string()), None))?;
    let engine = Engine::default();
    let mut declarations = String::new();

    loop {
        match rl.readline(&format!("{} ", "fer>".green().bold())) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);

                match line {
                    "exit" | "quit" => {
                        println!("{}", "Goodbye!".cyan());
                        break;
                    }
                    "help" => {
                        print_repl_help();
                        continue;
                    }
                    "clear" => {
                        declarations.clear();
                        println!("{}", "Declarations cleared.".dimmed());
                        continue;
                    }
                    "decls" => {
                        print!("{}", declarations);
                        continue;
                    }
                    _ => {}
                }

                let source = format!("{}{}\n", declarations, line);
                let program = match engine.compile_source("<repl>", &source) {
                    Ok(program) => program,
                    Err(err) if matches!(err.kind, ErrorKind::MissingStart(_)) => {
                        declarations = source;
                        continue;
                    }
                    Err(err) => {
                        eprintln!("{}", err.to_string().red());
                        continue;
                    }
                };

                match engine.load(program).and_then(|mut vm| vm.run()) {
                    Ok(Value::Void) => {}
                    Ok(value) => println!("{} {}", "=>".dimmed(), value.to_string().cyan()),
                    Err(err) => eprintln!("{}", err.to_string().red()),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("{}", "^C".dimmed());
            }
            Err(ReadlineError::Eof) => {
                println!("{}", "Goodbye!".cyan());
                break;
            }
            Err(err) => {
                eprintln!("{}: {:?}", "error".red(), err);
                break;
            }
        }
    }
    Ok(())
}

fn print_repl_help() {
    println!("{}", "REPL Commands:".yellow());
    println!("  exit, quit   Exit the REPL");
    println!("  clear        Forget every declaration");
    println!("  decls        Show the declarations entered so far");
    println!("  help         Show this help\n");
    println!("{}", "Examples:".yellow());
    println!("  int Square(int x) {{ return x * x; }}");
    println!("  int n = 7;");
    println!("  Square(n) + 1");
}
