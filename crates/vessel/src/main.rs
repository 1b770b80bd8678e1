//! Vessel CLI
//!
//! Usage:
//!     vessel run -- echo hello
//!     vessel run --cwd /srv --env KEY=VALUE -- ls

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::sync::Arc;
use vessel_host::{
    Container, ContainerOptions, NullRuntimeFactory, ProcessEvent, SpawnOptions,
};
use vessel_logging::{init_logging, LogConfig};

#[derive(Parser, Debug)]
#[command(name = "vessel", about = "Virtual process container")]
struct Args {
    /// Verbose console logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Spawn a process in a fresh container and stream its output
    Run {
        /// Working directory inside the virtual filesystem
        #[arg(long, default_value = "/")]
        cwd: String,

        /// Environment entries, KEY=VALUE (repeatable)
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,

        /// Concurrent process ceiling
        #[arg(long)]
        max_processes: Option<usize>,

        /// Per-request timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Command to run
        command: String,

        /// Command arguments
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
}

fn parse_env(entries: &[String]) -> Result<HashMap<String, String>> {
    let mut env = HashMap::new();
    for entry in entries {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("invalid --env entry '{}', expected KEY=VALUE", entry);
        };
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(LogConfig {
        app_name: "vessel",
        verbose: args.verbose,
    })
    .context("Failed to initialize logging")?;

    match args.command {
        Command::Run {
            cwd,
            env,
            max_processes,
            timeout_ms,
            command,
            args,
        } => {
            let exit_code = run(cwd, env, max_processes, timeout_ms, command, args).await?;
            std::process::exit(exit_code.clamp(0, 255));
        }
    }
}

async fn run(
    cwd: String,
    env: Vec<String>,
    max_processes: Option<usize>,
    timeout_ms: Option<u64>,
    command: String,
    args: Vec<String>,
) -> Result<i32> {
    let mut options = ContainerOptions::default();
    if let Some(max_processes) = max_processes {
        options.max_processes = max_processes;
    }
    if let Some(timeout_ms) = timeout_ms {
        options.request_timeout = std::time::Duration::from_millis(timeout_ms);
    }

    let container = Container::start(options, Arc::new(NullRuntimeFactory))
        .await
        .context("Failed to start container")?;

    tracing::info!(%command, "spawning");
    let spawn_options = SpawnOptions {
        cwd,
        env: parse_env(&env)?,
    };
    let handle = container
        .spawn_with(command, args, spawn_options)
        .await
        .map_err(|err| anyhow::anyhow!("{}", err))?;
    let mut events = handle.events();

    let exit_code = loop {
        match events.recv().await {
            Some(ProcessEvent::Output { output, is_error }) => {
                if is_error {
                    eprint!("{}", output);
                } else {
                    print!("{}", output);
                }
            }
            Some(ProcessEvent::Error { error }) => {
                eprintln!("process error: {}", error);
            }
            Some(ProcessEvent::Exit { exit_code }) => break exit_code,
            None => break handle.exit_code().unwrap_or(-1),
        }
    };

    container.dispose().await;
    Ok(exit_code)
}
