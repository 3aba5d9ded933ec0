//! # depotd
//!
//! Operator tool for the depot blob store: runs the server and exposes each
//! server operation as a subcommand.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use depot_cas::{compute_key, BlobKey};
use depot_checkout::CheckoutRequest;
use depot_config::logging::{init_logging, LogLevel};
use depot_config::{log_server_info, Config};
use depot_server::gc::{format_bytes, format_number};
use depot_server::{Requirements, Server};
use tokio_util::sync::CancellationToken;

/// Content-addressed blob store with checkouts
#[derive(Parser)]
#[command(name = "depotd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ~/.depot/config.toml and .depot/config.toml)
    #[arg(short, long, env = "DEPOT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server until Ctrl-C
    Serve,

    /// Run one garbage collection sweep
    Gc {
        /// Only report what would be deleted
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the status of one blob
    Status {
        /// SHA-256 checksum, lowercase hex
        sha: String,
        /// Size in bytes
        size: u64,
    },

    /// List required files that are not stored yet
    Missing {
        /// JSON file: {"files": [{"sha": ..., "size": ...}]}
        #[arg(value_name = "FILE")]
        requirements: PathBuf,
    },

    /// Upload a file into the store
    Upload {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Create a checkout from a JSON request
    Checkout {
        /// JSON file: {"checkoutPath": ..., "files": [{"sha", "size", "path"}]}
        #[arg(value_name = "FILE")]
        request: PathBuf,
    },

    /// Erase a checkout
    Erase {
        /// Checkout ID, relative to the checkout root
        id: String,
    },

    /// Show store statistics
    Stats,

    /// Print the default configuration
    DefaultConfig,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load().context("Failed to load config")?,
    };
    Ok(config)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}

fn open_server(cli: &Cli) -> Result<Server> {
    let config = load_config(cli.config.as_deref())?;
    init_logging(cli.log_level.unwrap_or(config.logging.level));
    Server::new(&config).context("Failed to initialize storage server")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::DefaultConfig => print!("{}", Config::default_toml()?),
        Commands::Serve => serve(&open_server(&cli)?).await?,
        Commands::Gc { dry_run } => gc(&open_server(&cli)?, *dry_run),
        Commands::Status { sha, size } => {
            let key = BlobKey::new(sha.as_str(), *size)?;
            let server = open_server(&cli)?;
            let status = server.file_status(&key)?;
            println!("{key}: {}", serde_json::to_string(&status)?);
        }
        Commands::Missing { requirements } => {
            let requirements: Requirements = read_json(requirements)?;
            let missing = open_server(&cli)?.report_missing(&requirements.files)?;
            println!("{}", serde_json::to_string_pretty(&missing)?);
        }
        Commands::Upload { file } => upload(&open_server(&cli)?, file).await?,
        Commands::Checkout { request } => {
            let request: CheckoutRequest = read_json(request)?;
            let server = open_server(&cli)?;
            let result = server.checkout(&request, &cancel_on_ctrl_c()).await;
            server.shutdown().await;
            let id = result.context("Checkout failed")?;
            println!("{}", server.checkouts().checkout_dir(&id).display());
        }
        Commands::Erase { id } => {
            open_server(&cli)?
                .erase_checkout(id)
                .with_context(|| format!("Failed to erase checkout {id}"))?;
            println!("Erased {id}");
        }
        Commands::Stats => {
            let server = open_server(&cli)?;
            let stats = server.stats()?;
            println!();
            println!("  Store: {}", server.store().base_path().display());
            println!("    Blobs:      {}", format_number(stats.blob_count));
            println!("    Total size: {}", format_bytes(stats.total_bytes));
            println!("    Average:    {}", format_bytes(stats.avg_blob_size()));
            println!(
                "    Uploading:  {} ({})",
                format_number(stats.upload_count),
                format_bytes(stats.upload_bytes)
            );
            println!();
        }
    }

    Ok(())
}

async fn serve(server: &Server) -> Result<()> {
    server.start();
    log_server_info!("serving, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log_server_info!("received Ctrl-C, initiating graceful shutdown");
    server.shutdown().await;
    Ok(())
}

fn gc(server: &Server, dry_run: bool) {
    let stats = server.collect_garbage(dry_run);

    println!();
    println!("  Garbage Collection{}", if dry_run { " (dry run)" } else { "" });
    println!("    Checked:        {}", format_number(stats.checked));
    println!("    Old:            {}", format_number(stats.old));
    println!("    Still linked:   {}", format_number(stats.referenced));
    println!(
        "    {}  {} ({})",
        if dry_run { "Would delete:" } else { "Deleted:     " },
        format_number(stats.deleted),
        format_bytes(stats.bytes_deleted)
    );
    println!("    Stale uploads:  {}", format_number(stats.stale_uploads));
    if stats.failed > 0 {
        println!("    Failed:         {}", format_number(stats.failed));
    }
    println!();
}

async fn upload(server: &Server, path: &Path) -> Result<()> {
    let key = {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        compute_key(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to hash {}", path.display()))?
    };

    let body = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let outcome = server
        .upload(&key, body, false, &filename)
        .await
        .with_context(|| format!("Failed to upload {}", path.display()))?;
    println!("{key}: {outcome:?}");
    Ok(())
}

/// A token that is cancelled when the user presses Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
    token
}
