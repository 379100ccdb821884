//! `engine`: prompt execution engine.
//!
//! Serves the `prompt_engine` tool over stdio, or runs single invocations and
//! diagnostics from the command line.

use std::io::{BufReader, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use engine::core::parser::CommandParser;
use engine::exit_codes;
use engine::io::config::{DEFAULT_CONFIG_FILE, EngineConfig, load_resolved};
use engine::logging;
use engine::pipeline::{Collaborators, EngineServices, PromptEngine, PromptEngineRequest};
use engine::server::Server;

#[derive(Parser)]
#[command(
    name = "engine",
    version,
    about = "Prompt execution engine: chains, gates, frameworks and shell verification"
)]
struct Cli {
    /// Config file; relative directories in it resolve against its parent.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the `prompt_engine` tool as line-delimited JSON-RPC on stdio.
    Serve,
    /// Run one invocation and print the response JSON.
    Exec {
        /// Request JSON, e.g. `{"command": ">>summarize text=\"...\""}`.
        #[arg(long)]
        request: String,
    },
    /// Print the parsed form of a symbolic command.
    Parse { command: String },
    /// List known prompt ids.
    Prompts,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = load_resolved(&cli.config)?;
    match cli.command {
        Command::Serve => cmd_serve(config),
        Command::Exec { request } => cmd_exec(config, &request),
        Command::Parse { command } => cmd_parse(config, &command),
        Command::Prompts => cmd_prompts(config),
    }
}

fn services(config: EngineConfig) -> Result<EngineServices> {
    let collaborators = Collaborators::from_config(&config);
    EngineServices::new(config, collaborators)
}

fn cmd_serve(config: EngineConfig) -> Result<i32> {
    let server = Server::new(PromptEngine::new(services(config)?));
    let stdin = std::io::stdin();
    server.run(BufReader::new(stdin.lock()), std::io::stdout().lock())?;
    Ok(exit_codes::OK)
}

fn cmd_exec(config: EngineConfig, raw: &str) -> Result<i32> {
    let request: PromptEngineRequest =
        serde_json::from_str(raw).context("parse --request JSON")?;
    let engine = PromptEngine::new(services(config)?);
    let response = engine.execute(request);
    print_json(&response)?;
    Ok(if response.is_error {
        exit_codes::TOOL_ERROR
    } else {
        exit_codes::OK
    })
}

fn cmd_parse(config: EngineConfig, command: &str) -> Result<i32> {
    let services = services(config)?;
    let is_known_gate = |id: &str| services.gate_registry.contains(id);
    let parsed = CommandParser::new(&services.catalog, &is_known_gate).parse(command)?;
    print_json(&parsed)?;
    Ok(exit_codes::OK)
}

fn cmd_prompts(config: EngineConfig) -> Result<i32> {
    let services = services(config)?;
    let mut stdout = std::io::stdout().lock();
    for prompt in services.catalog.all() {
        writeln!(stdout, "{}\t{}", prompt.id, prompt.description).context("write prompt list")?;
    }
    Ok(exit_codes::OK)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{payload}");
    Ok(())
}
