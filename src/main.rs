//! didbot - conversational state machines for DIDComm agency bots
//!
//! Validates and diagrams machine definitions, and runs a machine against a
//! console agency for interactive testing.

mod console;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use console::ConsoleClient;
use didbot_agency::{Config, Multiplexer};
use didbot_core::notification::Notification;
use didbot_core::{diagram, CoreError, MachineDefinition};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "didbot")]
#[command(about = "Scriptable conversational state machines for DIDComm agency bots")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a machine definition
    Check {
        /// Machine file (YAML, or JSON with a .json extension)
        file: PathBuf,
    },

    /// Print a PlantUML diagram of a machine
    Diagram {
        /// Machine file
        file: PathBuf,

        /// Print a PlantUML server URL instead of the source
        #[arg(long)]
        url: bool,
    },

    /// Chat with a machine through a console agency
    Chat {
        /// Machine file (defaults to machine.path from config)
        file: Option<PathBuf>,

        /// Connection id of the console conversation
        #[arg(long, env = "DIDBOT_CONN_ID")]
        conn_id: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Check { file } => check(&file),
        Commands::Diagram { file, url } => print_diagram(&file, url),
        Commands::Chat { file, conn_id } => chat(file, conn_id).await,
    };

    if let Err(e) = result {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn load_definition(path: &Path) -> Result<MachineDefinition, CoreError> {
    let definition = MachineDefinition::from_file(path)?;
    tracing::debug!(
        name = %definition.name,
        checksum = %definition.checksum,
        "loaded machine definition"
    );
    Ok(definition)
}

fn check(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let definition = match load_definition(path) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{} {}", e.error_code().red(), path.display());
            return Err(e.into());
        }
    };

    println!("{} {}", "OK".green().bold(), path.display());
    println!("  name:       {}", definition.name);
    println!("  kind:       {:?}", definition.kind);
    println!("  initial:    {}", definition.initial.target);
    println!("  states:     {}", definition.states().len());
    println!("  scripts:    {}", definition.needs_evaluator());
    println!("  checksum:   {}", definition.checksum);
    Ok(())
}

fn print_diagram(path: &Path, url: bool) -> Result<(), Box<dyn std::error::Error>> {
    let definition = load_definition(path)?;
    if url {
        println!("{}", diagram::uml_url(&definition)?);
    } else {
        print!("{}", diagram::to_uml(&definition));
    }
    Ok(())
}

async fn chat(
    file: Option<PathBuf>,
    conn_id: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (from file if DIDBOT_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            if std::env::var("DIDBOT_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    let path = file
        .or_else(|| config.machine.path.clone())
        .ok_or("no machine file given and machine.path is not configured")?;
    let definition = Arc::new(load_definition(&path)?);
    let conn_id = conn_id.unwrap_or_else(|| config.console.conn_id.clone());

    let (inbound_tx, inbound_rx) = mpsc::channel(config.multiplexer.inbound_buffer);

    // Statuses echoed by the console agency go through an unbounded hop so a
    // conversation never blocks on its own inbound stream.
    let (echo_tx, echo_rx) = mpsc::unbounded_channel();
    let forwarder = tokio::spawn(forward(echo_rx, inbound_tx.clone()));

    let client = Arc::new(ConsoleClient::new(echo_tx));
    let multiplexer = Multiplexer::new(definition.clone(), client, &config)?;
    let handle = multiplexer.handle();

    let cancel = CancellationToken::new();
    let mux_task = tokio::spawn(multiplexer.run(inbound_rx, cancel.clone()));

    println!(
        "{} {}",
        "didbot".bold().cyan(),
        format!("machine '{}' ({})", definition.name, definition.checksum).dimmed()
    );

    let repl_result = repl::run(
        conn_id,
        inbound_tx,
        handle,
        config.console.history_file.clone(),
    )
    .await;

    cancel.cancel();
    forwarder.abort();
    match mux_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Multiplexer stopped with error: {}", e),
        Err(e) => tracing::error!("Multiplexer task failed: {}", e),
    }

    println!("{}", "Bye.".dimmed());
    repl_result
}

async fn forward(
    mut echo: mpsc::UnboundedReceiver<Notification>,
    inbound: mpsc::Sender<Notification>,
) {
    while let Some(notification) = echo.recv().await {
        if inbound.send(notification).await.is_err() {
            break;
        }
    }
}
