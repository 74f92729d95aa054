// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! DeepTrack: multispectral target recognition backend
//!
//! Serves the upload and analysis API, and offers one-off analysis and status
//! commands against the configured vision model.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use deeptrack::analysis::FileAnalyzer;
use deeptrack::config::AppConfig;
use deeptrack::db::Database;
use deeptrack::jobs::build_detection;
use deeptrack::llm::VisionClient;
use deeptrack::web;
use deeptrack::Result;

/// DeepTrack CLI - multispectral target recognition API
#[derive(Parser, Debug)]
#[command(name = "deeptrack")]
#[command(author = "Jonathan D. A. Jewell <hyperpolymath>")]
#[command(version)]
#[command(about = "Target recognition backend driven by a vision language model", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (JSON format)
    #[arg(short, long, default_value = "config.json", global = true)]
    config: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable trace logging (most verbose)
    #[arg(long, global = true)]
    trace: bool,

    /// Suppress non-essential output (quiet mode)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP API and background job workers
    Serve {
        /// Address to bind (overrides config)
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run target recognition on one local image and print the detections
    Analyze {
        /// Image to analyze
        path: PathBuf,
    },

    /// Show recognition service and database status
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Generate default configuration file
    Generate {
        /// Output file path
        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // A missing .env is normal
    dotenv::dotenv().ok();

    let filter = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if !cli.quiet {
        info!("DeepTrack v{}", env!("CARGO_PKG_VERSION"));
    }

    let config = AppConfig::load_with_env(&cli.config)?;

    match cli.command {
        Some(Commands::Serve { host, port }) => run_serve(config, host, port).await,
        Some(Commands::Analyze { path }) => run_analyze(config, path).await,
        Some(Commands::Status) => run_status(config).await,
        Some(Commands::Config { action }) => run_config_command(config, action, &cli.config),
        None => run_serve(config, None, None).await,
    }
}

/// Open the configured store, creating its directory if needed
fn open_database(config: &AppConfig) -> Result<Database> {
    if config.database.is_in_memory() {
        warn!("Using an in-memory database; records are lost on exit");
        return Database::in_memory();
    }

    let path = config.database.file_path();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::open(&path)?;
    info!("Database initialized: {:?}", path);
    Ok(db)
}

/// Flip the shutdown flag on Ctrl+C or SIGTERM
fn spawn_signal_listener(shutdown_tx: Arc<watch::Sender<bool>>) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = terminate => info!("Received SIGTERM, shutting down..."),
        }

        let _ = shutdown_tx.send(true);
    });
}

/// Run the API server until a shutdown signal arrives
async fn run_serve(mut config: AppConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.web.host = host;
    }
    if let Some(port) = port {
        config.web.port = port;
    }

    let db = open_database(&config)?;

    let client = VisionClient::new(&config.ai_engine, &config.prompts.system)?;
    info!("Recognition service: {} (model {})", client.base_url(), client.model());
    if let Err(e) = client.health_check().await {
        warn!("Recognition service not reachable yet: {}", e);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    spawn_signal_listener(shutdown_tx.clone());

    let (state, pool) = web::assemble(config, db.clone(), Arc::new(client), shutdown_rx.clone())?;
    info!("Uploads stored in {:?}", state.blobs.root());

    let pool = tokio::spawn(pool.run());
    let served = web::start_server(state, shutdown_rx).await;
    if served.is_err() {
        // Let the workers drain even when the listener never came up
        let _ = shutdown_tx.send(true);
    }

    if let Err(e) = pool.await {
        error!("Job worker pool ended abnormally: {}", e);
    }
    served?;

    db.close()?;
    info!("DeepTrack stopped.");
    Ok(())
}

/// Analyze one local file and print its detections
async fn run_analyze(config: AppConfig, path: PathBuf) -> Result<()> {
    if !path.is_file() {
        return Err(deeptrack::DeepTrackError::NotFound(format!("{:?}", path)));
    }

    let client = VisionClient::new(&config.ai_engine, &config.prompts.system)?;
    let analyzer = FileAnalyzer::new(
        Arc::new(client),
        config.prompts.detection.clone(),
        config.ai_engine.max_image_dimension,
    );

    info!("Analyzing: {:?}", path);
    let file_id = path.to_string_lossy().into_owned();
    let detections: Vec<_> = analyzer
        .analyze(&path)
        .await
        .iter()
        .map(|candidate| build_detection(&file_id, candidate))
        .collect();

    println!("{}", serde_json::to_string_pretty(&detections)?);
    Ok(())
}

/// Run config commands
fn run_config_command(config: AppConfig, action: ConfigCommands, config_path: &Path) -> Result<()> {
    match action {
        ConfigCommands::Show => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigCommands::Generate { output } => {
            AppConfig::default().save(&output)?;
            println!("Generated config at {:?}", output);
        }
        ConfigCommands::Validate => {
            println!("Configuration at {:?} is valid", config_path);
            println!("  Provider: {:?} at {}", config.ai_engine.provider, config.ai_engine.url);
            println!("  Model: {}", config.ai_engine.model);
            println!("  Workers: {} (queue {})", config.jobs.workers, config.jobs.queue_capacity);
            println!("  Uploads: {}", config.storage.upload_dir);
            if config.database.is_in_memory() {
                println!("  Database: in memory");
            } else {
                println!("  Database: {:?}", config.database.file_path());
            }
        }
    }

    Ok(())
}

/// Run status check
async fn run_status(config: AppConfig) -> Result<()> {
    let client = VisionClient::new(&config.ai_engine, &config.prompts.system)?;

    println!("DeepTrack v{} Status", env!("CARGO_PKG_VERSION"));
    println!("======================");

    match client.health_check().await {
        Ok(()) => println!("Recognition service ({}): Running", client.base_url()),
        Err(e) => println!("Recognition service ({}): Error - {}", client.base_url(), e),
    }

    match client.list_models().await {
        Ok(models) => {
            println!("\nAvailable models:");
            for m in &models {
                let marker = if m == client.model() { "→" } else { " " };
                println!("  {} {}", marker, m);
            }
            if !models.iter().any(|m| m == client.model()) {
                println!("\nConfigured model '{}' is not listed", client.model());
            }
        }
        Err(e) => println!("  Error listing models: {}", e),
    }

    if config.database.is_in_memory() {
        println!("\nDatabase: in memory (nothing persisted)");
    } else {
        let path = config.database.file_path();
        match Database::open(&path) {
            Ok(db) => {
                let stats = db.stats()?;
                println!("\nDatabase ({:?}):", path);
                println!("  Files: {}", stats.file_count);
                println!("  Detections: {}", stats.detection_count);
                println!("  Jobs: {} ({} processing)", stats.job_count, stats.jobs_processing);
                db.close()?;
            }
            Err(e) => println!("\nDatabase: ✗ Error - {}", e),
        }
    }

    Ok(())
}
