//! Command-line runner for macrobox macros.
//!
//! # Examples
//!
//! ```bash
//! # Run a macro and print its result
//! macrobox run macros/hello.rhai
//!
//! # Run several macros concurrently as startup runs, with debug logging
//! macrobox run --startup -v macros/*.rhai
//!
//! # Show directives and compile problems without running anything
//! macrobox check macros/hello.rhai
//! ```
//!
//! `retained` macros keep running until Ctrl-C, which cancels every live run.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use macrobox::{
    Diagnostic, ExecuteParams, ExecutionId, ExecutionOptions, LanguageKind, OutputHandler,
    Sandbox, SandboxManager,
};
use tracing_subscriber::EnvFilter;

/// Run and check macrobox macros.
#[derive(Parser, Debug)]
#[command(name = "macrobox")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one or more macros concurrently
    Run {
        /// Run as startup runs
        #[arg(long)]
        startup: bool,

        /// Macro files to run
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Report directives and compile problems without running the macro
    Check {
        /// Macro file to check
        file: PathBuf,
    },
}

/// Prints macro output prefixed with the run id.
#[derive(Debug)]
struct StdoutOutput;

impl OutputHandler for StdoutOutput {
    fn on_output(&self, run: &ExecutionId, line: &str) {
        println!("[{run}] {line}");
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // MACROBOX_LOG overrides the verbosity flag.
    let default_filter = match cli.verbose {
        0 => "macrobox=warn,macrobox_cli=info",
        1 => "macrobox=debug,macrobox_cli=debug",
        _ => "macrobox=trace,macrobox_cli=trace",
    };
    let filter =
        EnvFilter::try_from_env("MACROBOX_LOG").unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Run { startup, files } => run(startup, &files).await,
        Command::Check { file } => check(&file).await,
    }
}

async fn run(startup: bool, files: &[PathBuf]) -> Result<ExitCode> {
    let manager = SandboxManager::builder()
        .with_output_handler(StdoutOutput)
        .build();
    let params = if startup {
        ExecuteParams::startup()
    } else {
        ExecuteParams::default()
    };

    tracing::debug!(count = files.len(), startup, "Running macros");
    let runs = futures::future::join_all(files.iter().map(|file| {
        let manager = &manager;
        async move { (file, manager.run(file.as_path(), params).await) }
    }));
    tokio::pin!(runs);

    let results = tokio::select! {
        results = &mut runs => results,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted, cancelling {} live run(s)", manager.running_count());
            manager.shutdown();
            runs.await
        }
    };

    let mut failed = false;
    for (file, result) in results {
        match result {
            Ok(result) => println!(
                "{}: {} ({:.1?})",
                file.display(),
                result.value,
                result.stats.duration
            ),
            Err(e) => {
                failed = true;
                eprintln!("{}: error: {e}", file.display());
            }
        }
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn check(file: &Path) -> Result<ExitCode> {
    let source = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let options = ExecutionOptions::parse(&source);
    println!("Directives: {}", serde_json::to_string(&options)?);

    let sandbox = Sandbox::builder().build_sandbox();
    let language = LanguageKind::from_path(file);
    let diagnostics = match sandbox
        .transpiler()
        .transpile(&source, &language, Some(file))
    {
        Ok(code) => sandbox.engine().check(&code).err().unwrap_or_default(),
        Err(diagnostics) => diagnostics,
    };

    if diagnostics.is_empty() {
        println!("{}: ok", file.display());
        return Ok(ExitCode::SUCCESS);
    }
    for diagnostic in &diagnostics {
        report(file, diagnostic);
    }
    Ok(ExitCode::FAILURE)
}

fn report(file: &Path, diagnostic: &Diagnostic) {
    let hint = if diagnostic.recoverable {
        " (input looks incomplete)"
    } else {
        ""
    };
    eprintln!("{}:{diagnostic}{hint}", file.display());
}
