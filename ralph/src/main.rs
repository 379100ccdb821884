//! `ralph`: stop hook for loop-mode shell verifications.
//!
//! The engine writes `verify-active.json` into its runtime directory when a
//! `verify:` directive runs with `loop:true`. On every stop event the agent
//! invokes `ralph stop`, which re-runs the check and either lets the agent
//! stop or blocks it with the failure output.

mod hook;

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use engine::io::config::{DEFAULT_CONFIG_FILE, RUNTIME_DIR_ENV, load_resolved};
use engine::io::git::GitCheckpoints;
use engine::io::isolation::CliIsolationSpawner;
use engine::io::shell::ProcessShellExecutor;
use engine::logging;
use engine::verification::ShellVerificationService;
use tracing::debug;

#[derive(Parser)]
#[command(name = "ralph", version, about = "Stop hook for engine shell verification loops")]
struct Cli {
    /// Engine config file; supplies verification and isolation settings.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Runtime directory holding `verify-active.json`.
    #[arg(long, global = true, env = RUNTIME_DIR_ENV)]
    runtime_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Handle a stop event (hook JSON on stdin).
    Stop,
    /// Print the active loop state, if any.
    Status,
    /// Remove the active loop state.
    Clear,
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_resolved(&cli.config)?;
    if let Some(dir) = cli.runtime_dir {
        config.runtime_dir = dir;
    }
    debug!(runtime_dir = %config.runtime_dir.display(), "ralph configured");

    let verification = ShellVerificationService::new(
        Arc::new(ProcessShellExecutor),
        Arc::new(CliIsolationSpawner::new(
            config.verification.isolation.clone(),
            &config.runtime_dir,
        )),
        Arc::new(GitCheckpoints),
        &config.verification,
        &config.runtime_dir,
    );

    match cli.command {
        Command::Stop => cmd_stop(&verification),
        Command::Status => cmd_status(&verification),
        Command::Clear => cmd_clear(&verification),
    }
}

fn cmd_stop(verification: &ShellVerificationService) -> Result<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("read hook input")?;
    if let Some(decision) = hook::on_stop(&input, verification)? {
        let payload = serde_json::to_string(&decision).context("serialize hook decision")?;
        println!("{payload}");
    }
    Ok(())
}

fn cmd_status(verification: &ShellVerificationService) -> Result<()> {
    match verification.loop_state()? {
        Some(state) => {
            let payload =
                serde_json::to_string_pretty(&state).context("serialize verify state")?;
            println!("{payload}");
        }
        None => println!("no active verification loop"),
    }
    Ok(())
}

fn cmd_clear(verification: &ShellVerificationService) -> Result<()> {
    verification.clear_loop_state()?;
    println!("verification loop state cleared");
    Ok(())
}
