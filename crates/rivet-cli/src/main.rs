//! `rivet` — runs a single Rivet source file.
//!
//! There is no build step, no project manifest, and (per the REPL
//! non-goal) no interactive mode: `rivet <file>` is the entire surface.

mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use rivet_engine::Runtime;

#[derive(Parser)]
#[command(name = "rivet", about = "Runs a Rivet script", disable_version_flag = true)]
struct Cli {
    /// Script to run.
    file: Option<PathBuf>,

    /// Print the version and exit.
    #[arg(short = 'v', long = "version")]
    version: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.version {
        println!("rivet {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let Some(file) = cli.file else {
        println!("REPL isn't implemented yet, sorry! :(");
        return ExitCode::SUCCESS;
    };

    match run(&file) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            output::print_error(&err.to_string());
            ExitCode::FAILURE
        }
    }
}

fn run(file: &std::path::Path) -> anyhow::Result<()> {
    let mut runtime = Runtime::new();
    runtime.run_file(file)?;
    Ok(())
}
