//! Blockpilot CLI
//!
//! Compiles block programs exported from the editor and runs them against a
//! remote automation service. Also manages the service's image and program
//! stores.
//!
//! Usage:
//!   blockpilot run program.json              # Compile and run a program file
//!   blockpilot run --saved login             # Run a program from the store
//!   blockpilot compile program.json          # Print the compiled script
//!   blockpilot images upload logo logo.png   # Upload a reference image
//!   blockpilot images watch                  # Follow the image list
//!   blockpilot programs list                 # List stored programs
//!   blockpilot position                      # Print the cursor position

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use blockpilot::data_url;
use blockpilot::{
    compile, connect, Config, ExecutionEngine, ExecutionSession, HttpClient, ReferenceCache,
    RunStatus, SavedProgram,
};
use clap::{Args, Parser, Subcommand};
use colored::*;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod log_view;
mod program_file;

/// Exit code for a run ended by Ctrl+C.
const EXIT_STOPPED: i32 = 130;

#[derive(Parser)]
#[command(name = "blockpilot")]
#[command(about = "Run visual block programs against a remote automation service")]
struct Cli {
    /// Automation service URL (e.g., http://127.0.0.1:5000)
    #[clap(long, short = 's', global = true, env = "BLOCKPILOT_SERVER_URL")]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Program file (workspace JSON or a stored program record)
    #[clap(required_unless_present = "saved", conflicts_with = "saved")]
    file: Option<PathBuf>,

    /// Run a program from the service's program store
    #[clap(long)]
    saved: Option<String>,

    /// Disable the corner failsafe for this run
    #[clap(long)]
    no_failsafe: bool,

    /// Compile and print the script without running it
    #[clap(long)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum ImageCommands {
    /// List stored images
    List,
    /// Locate a stored image on screen
    Find { name: String },
    /// Upload an image file under a name
    Upload { name: String, path: PathBuf },
    /// Delete a stored image
    Delete { name: String },
    /// Keep the image list fresh and print it whenever it changes
    Watch,
}

#[derive(Subcommand)]
enum ProgramCommands {
    /// List stored programs
    List,
    /// Store a program file under a name
    Save {
        name: String,
        file: PathBuf,
        /// Store the program with the failsafe disabled
        #[clap(long)]
        no_failsafe: bool,
    },
    /// Fetch a stored program
    Load {
        name: String,
        /// Write the workspace document here instead of stdout
        #[clap(long, short = 'o')]
        out: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and run a program
    Run(RunArgs),
    /// Print the compiled command script as JSON
    Compile { file: PathBuf },
    /// Reference image store
    #[command(subcommand)]
    Images(ImageCommands),
    /// Program store
    #[command(subcommand)]
    Programs(ProgramCommands),
    /// Print the remote cursor position
    Position,
}

#[tokio::main]
async fn main() {
    // Load .env before parsing so `env` defaults see it.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if let Err(e) = blockpilot::logging::init_logging() {
        eprintln!("Failed to initialize logging: {e}");
    }

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "❌".red(), e);
            1
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let mut config = Config::from_env().context("Invalid configuration")?;
    if let Some(server) = cli.server {
        config.server_url = server;
    }

    match cli.command {
        Commands::Compile { file } => {
            let program = program_file::read_program(&file)?;
            let script = compile(&program.graph).context("Failed to compile program")?;
            println!("{}", serde_json::to_string_pretty(&script)?);
            Ok(0)
        }
        Commands::Run(args) => run_program(&config, args).await,
        Commands::Images(command) => handle_images(&config, command).await.map(|_| 0),
        Commands::Programs(command) => handle_programs(&config, command).await.map(|_| 0),
        Commands::Position => {
            let position = client(&config)?.cursor_position().await?;
            println!("x: {}, y: {}", position.x, position.y);
            Ok(0)
        }
    }
}

fn client(config: &Config) -> Result<HttpClient> {
    connect(&config.server_url).with_context(|| format!("Cannot use server {}", config.server_url))
}

async fn run_program(config: &Config, args: RunArgs) -> Result<i32> {
    let client = Arc::new(client(config)?);

    let program = match (&args.file, &args.saved) {
        (Some(path), _) => program_file::read_program(path)?,
        (None, Some(name)) => {
            let saved = client
                .load_program(name)
                .await
                .with_context(|| format!("Failed to load stored program '{name}'"))?;
            let mut program = program_file::parse_program(&saved.data)?;
            program.failsafe = Some(saved.failsafe_enabled);
            program
        }
        (None, None) => bail!("Specify a program file or --saved NAME"),
    };
    let failsafe = !args.no_failsafe && program.failsafe.unwrap_or(config.failsafe);

    let script = compile(&program.graph).context("Failed to compile program")?;
    if args.dry_run {
        println!("{}", serde_json::to_string_pretty(&script)?);
        return Ok(0);
    }

    info!(
        "Running {} instructions against {} (failsafe {})",
        script.len(),
        config.server_url,
        if failsafe { "on" } else { "off" }
    );

    let session = Arc::new(ExecutionSession::new());
    let printer = spawn_log_printer(session.subscribe());
    let stopper = spawn_stop_handler(session.clone());

    let engine = ExecutionEngine::new(client, session.clone()).with_failsafe(failsafe);
    let outcome = engine.run(&script).await;

    // Close the log channel so the printer drains and exits.
    stopper.abort();
    let _ = stopper.await;
    drop(engine);
    drop(session);
    let _ = printer.await;

    match outcome {
        Ok(report) => match report.status {
            RunStatus::Completed => {
                println!(
                    "{} {} steps",
                    "✅ Completed:".green().bold(),
                    report.dispatched
                );
                Ok(0)
            }
            RunStatus::Stopped => {
                println!(
                    "{} after {} steps",
                    "⏹ Stopped".yellow().bold(),
                    report.dispatched
                );
                Ok(EXIT_STOPPED)
            }
            RunStatus::AlreadyRunning => bail!("A run is already in progress"),
        },
        Err(e) => {
            eprintln!("{} {}", "❌ Failed:".red().bold(), e);
            Ok(1)
        }
    }
}

fn spawn_log_printer(
    mut entries: broadcast::Receiver<blockpilot::LogEntry>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match entries.recv().await {
                Ok(entry) => log_view::print_entry(&entry),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Log output fell behind, {} entries skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// First Ctrl+C asks the run to stop after the current step; a second one
/// exits immediately.
fn spawn_stop_handler(session: Arc<ExecutionSession>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        session.request_stop();
        eprintln!(
            "{}",
            "Stopping after the current step (Ctrl+C again to abort)".yellow()
        );
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(EXIT_STOPPED);
        }
    })
}

async fn handle_images(config: &Config, command: ImageCommands) -> Result<()> {
    let client = Arc::new(client(config)?);
    match command {
        ImageCommands::List => {
            let images = client.list_images().await?;
            if images.is_empty() {
                println!("No images stored");
            }
            for image in images {
                match image.created {
                    Some(created) => println!("{}  {}", image.name.bold(), created.dimmed()),
                    None => println!("{}", image.name.bold()),
                }
            }
        }
        ImageCommands::Find { name } => {
            let location = client.find_image(&name).await?;
            println!(
                "{} at ({}, {}), center ({}, {})",
                name.bold(),
                location.x,
                location.y,
                location.center_x,
                location.center_y
            );
        }
        ImageCommands::Upload { name, path } => {
            let payload = data_url::from_file(&path)
                .with_context(|| format!("Failed to read image {}", path.display()))?;
            let cache = ReferenceCache::new(client);
            cache.upload(&name, &payload).await?;
            println!(
                "{} '{}' ({} images stored)",
                "Uploaded".green(),
                name,
                cache.names().len()
            );
        }
        ImageCommands::Delete { name } => {
            let cache = ReferenceCache::new(client);
            let message = cache.delete(&name).await?;
            if message.is_empty() {
                println!("{} '{}'", "Deleted".green(), name);
            } else {
                println!("{message}");
            }
        }
        ImageCommands::Watch => watch_images(config, client).await?,
    }
    Ok(())
}

async fn watch_images(config: &Config, client: Arc<HttpClient>) -> Result<()> {
    let cache = Arc::new(ReferenceCache::new(client));
    let mut names = cache.subscribe();
    let cancel = CancellationToken::new();
    // No editor is attached, so no graph events arrive.
    let (_events_tx, events_rx) = mpsc::channel(16);

    let refresher = cache
        .clone()
        .spawn_refresher(config.refresh_schedule(), events_rx, cancel.clone());
    println!(
        "Watching images on {} every {}s (Ctrl+C to quit)",
        config.server_url,
        config.image_refresh_interval.as_secs()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = names.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = names.borrow_and_update().clone();
                if current.is_empty() {
                    println!("{}", "(no images)".dimmed());
                } else {
                    println!("{}", current.join(", "));
                }
            }
        }
    }

    cancel.cancel();
    refresher.await.context("Image refresher panicked")?;
    Ok(())
}

async fn handle_programs(config: &Config, command: ProgramCommands) -> Result<()> {
    let client = client(config)?;
    match command {
        ProgramCommands::List => {
            let programs = client.list_programs().await?;
            if programs.is_empty() {
                println!("No programs stored");
            }
            for name in programs {
                println!("{name}");
            }
        }
        ProgramCommands::Save {
            name,
            file,
            no_failsafe,
        } => {
            let program = program_file::read_program(&file)?;
            // Store only programs that compile.
            compile(&program.graph).context("Refusing to store a program that does not compile")?;
            client
                .save_program(&SavedProgram {
                    name: name.clone(),
                    data: program.document,
                    failsafe_enabled: !no_failsafe,
                })
                .await?;
            println!("{} '{}'", "Saved".green(), name);
        }
        ProgramCommands::Load { name, out } => {
            let saved = client.load_program(&name).await?;
            match out {
                Some(path) => {
                    program_file::write_document(&path, &saved.data)?;
                    println!(
                        "{} '{}' to {} (failsafe {})",
                        "Wrote".green(),
                        name,
                        path.display(),
                        if saved.failsafe_enabled { "on" } else { "off" }
                    );
                }
                None => println!("{}", saved.data),
            }
        }
    }
    Ok(())
}
