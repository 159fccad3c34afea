//! `playground` command-line driver.
//!
//! Usage:
//!   playground run <exercise>      # boot, install, serve; Ctrl-C to stop
//!   playground list                # exercise ids under the exercises dir
//!   playground config-schema       # JSON schema of config.toml

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use playground::sandbox::local::LocalSandbox;
use playground::sandbox::StreamKind;
use playground::workspace::TerminalLine;
use playground::{BootState, ExerciseLoader, PlaygroundConfig, ServerState, Session};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "playground")]
#[command(about = "Run coding exercises in a local sandbox", version)]
struct Cli {
    /// Path to config.toml (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the exercises directory
    #[arg(long, global = true)]
    exercises: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Boot a sandbox for an exercise and run its dev server
    Run {
        /// Exercise id (directory name under the exercises dir)
        id: String,

        /// Show the solution instead of the starting files
        #[arg(long)]
        solution: bool,
    },
    /// List available exercises
    List,
    /// Print the JSON schema of the configuration file
    ConfigSchema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Commands::ConfigSchema) {
        println!("{}", PlaygroundConfig::schema_json());
        return Ok(());
    }

    let mut config = PlaygroundConfig::load(cli.config.as_deref()).context("load config")?;
    if let Some(dir) = cli.exercises {
        config.exercises_dir = dir;
    }
    init_tracing(&config.log_level);

    let loader = ExerciseLoader::new(&config.exercises_dir);
    match cli.command {
        Commands::List => {
            for id in loader.list()? {
                println!("{id}");
            }
            Ok(())
        }
        Commands::Run { id, solution } => run(&config, &loader, &id, solution).await,
        Commands::ConfigSchema => Ok(()),
    }
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(config: &PlaygroundConfig, loader: &ExerciseLoader, id: &str, solution: bool) -> Result<()> {
    let exercise = loader
        .load(id)
        .with_context(|| format!("load exercise {id}"))?;

    let provider = LocalSandbox::new(&config.sandbox_root).with_poll_interval(config.watch_poll_interval());
    let store = Arc::new(playground::WorkspaceStore::new(config.terminal_scrollback));
    let session = Session::with_store(Arc::new(provider), config.session_options()?, store);
    session.load_exercise(exercise)?;
    if solution && !session.toggle_solution()? {
        tracing::warn!(exercise = id, "Exercise has no solution; running starting files");
    }

    let printer = tokio::spawn(print_terminal(session.store().subscribe()));

    let boot = session.start().await;
    let outcome = match preview_url(&boot, &session.server_state()) {
        Ok(url) => {
            println!("Preview ready at {url}");
            println!("Press Ctrl-C to stop.");
            tokio::signal::ctrl_c().await.context("wait for Ctrl-C")
        }
        Err(e) => Err(e),
    };

    session.dispose();
    printer.abort();
    outcome
}

/// The preview URL of a fully started session, or why there is none.
fn preview_url(boot: &BootState, server: &ServerState) -> Result<String> {
    match (boot, server) {
        (BootState::Ready, ServerState::Ready { url, .. }) => Ok(url.clone()),
        (BootState::Ready, server) => anyhow::bail!("dev server did not start: {server}"),
        (boot, _) => anyhow::bail!("sandbox failed: {boot}"),
    }
}

/// Lines pushed after the line with id `last_id`.
fn unseen_lines(lines: &[TerminalLine], last_id: u64) -> impl Iterator<Item = &TerminalLine> {
    lines.iter().filter(move |line| line.id > last_id)
}

/// Echo new terminal lines to stdout/stderr as they arrive.
async fn print_terminal(mut rx: tokio::sync::watch::Receiver<playground::workspace::WorkspaceState>) {
    let mut last_id = 0;
    loop {
        {
            let state = rx.borrow_and_update();
            for line in unseen_lines(state.terminal.lines(), last_id) {
                match line.stream {
                    StreamKind::Stdout => println!("{}", line.text),
                    StreamKind::Stderr => eprintln!("{}", line.text),
                }
                last_id = line.id;
            }
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
}
