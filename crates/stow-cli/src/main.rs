//! stow: encrypted attachment storage CLI
//!
//! Commands:
//!   upload <file> --key <object-key>    - seal and upload a file, print its asset descriptor
//!   download <asset.json> <output>      - fetch, verify and decrypt an asset
//!   status                              - check storage reachability
//!   config show                         - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stow_core::config::StowConfig;
use stow_core::{Asset, Destination, StowError};
use stow_storage::{KeyedSigner, ObjectStore, OpendalStore, RequestSigner};
use stow_transfer::{AttachmentStore, ProgressControl, ProgressSink, UploadTask};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "stow",
    version,
    about = "Encrypted, resumable attachment storage",
    long_about = "stow: seal files with per-asset keys and store them in S3-compatible object storage"
)]
struct Cli {
    /// Path to stow.toml configuration file
    #[arg(long, short = 'c', env = "STOW_CONFIG", default_value = "stow.toml")]
    config: PathBuf,

    /// Log level filter (overrides config; RUST_LOG wins over both)
    #[arg(long, env = "STOW_LOG")]
    log: Option<String>,

    /// Log output format (overrides config)
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Seal a local file and upload it
    ///
    /// Credentials are read from AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY.
    /// Re-running an interrupted upload in the same process resumes it.
    Upload {
        /// Local file
        file: PathBuf,
        /// Object key in the bucket
        #[arg(long, short = 'k')]
        key: String,
        /// Bucket (default: storage.bucket from config)
        #[arg(long, short = 'b')]
        bucket: Option<String>,
        /// Write the asset descriptor here instead of stdout
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
        /// Conversation the attachment belongs to (logged only)
        #[arg(long)]
        conversation: Option<String>,
    },

    /// Download and verify an asset
    ///
    /// On failure the output holds only plaintext that verified.
    Download {
        /// Asset descriptor JSON written by `stow upload`
        asset: PathBuf,
        /// Output file
        output: PathBuf,
        /// Bucket (default: storage.bucket from config)
        #[arg(long, short = 'b')]
        bucket: Option<String>,
    },

    /// Check that storage is reachable
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let loaded = load_config(&cli.config).await?;
    let missing_config = loaded.is_none();
    let config = loaded.unwrap_or_default();

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, format);
    if missing_config {
        warn!(path = %cli.config.display(), "config file not found; using defaults");
    }

    match cli.command {
        Commands::Upload {
            file,
            key,
            bucket,
            out,
            conversation,
        } => {
            cmd_upload(
                &config,
                &file,
                &key,
                bucket.as_deref(),
                out.as_deref(),
                conversation.as_deref(),
            )
            .await
        }
        Commands::Download {
            asset,
            output,
            bucket,
        } => cmd_download(&config, &asset, &output, bucket.as_deref()).await,
        Commands::Status => cmd_status(&config).await,
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Read the config file, or `None` when it does not exist.
async fn load_config(path: &Path) -> Result<Option<StowConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config: {}", path.display()))?;
    StowConfig::from_toml(&content)
        .map(Some)
        .with_context(|| format!("parsing config: {}", path.display()))
}

// ── Storage from config + environment credentials ─────────────────────────────

/// Reads AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY (standard S3 env vars).
fn credentials_from_env() -> Result<(String, String)> {
    let access_key = std::env::var("AWS_ACCESS_KEY_ID")
        .or_else(|_| std::env::var("STOW_ACCESS_KEY_ID"))
        .context(
            "S3 credentials not set\n\
             Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY environment variables.",
        )?;
    let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
        .or_else(|_| std::env::var("STOW_SECRET_ACCESS_KEY"))
        .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
    Ok((access_key, secret_key))
}

struct Backend {
    store: Arc<dyn ObjectStore>,
    operator: opendal::Operator,
    signer: Arc<dyn RequestSigner>,
}

fn open_backend(config: &StowConfig) -> Result<Backend> {
    match config.storage.backend.as_str() {
        "memory" => {
            warn!("using the in-process memory backend; nothing outlives this command");
            let op = stow_storage::build_memory_operator()?;
            Ok(Backend {
                store: Arc::new(OpendalStore::new(op.clone(), config.storage.bucket.clone())),
                operator: op,
                signer: Arc::new(KeyedSigner::new([0u8; 32])),
            })
        }
        _ => {
            let (access_key, secret_key) = credentials_from_env()?;
            let op = stow_storage::operator::build_from_core_config(
                &config.storage,
                &access_key,
                &secret_key,
            )
            .context("building storage operator")?;
            Ok(Backend {
                store: Arc::new(OpendalStore::new(op.clone(), config.storage.bucket.clone())),
                operator: op,
                signer: Arc::new(KeyedSigner::from_credentials(&access_key, &secret_key)),
            })
        }
    }
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupted; stopping transfer");
            token.cancel();
        }
    });
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
    )
    .map(|s| s.progress_chars("=>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn progress_sink(pb: &ProgressBar) -> Arc<dyn ProgressSink> {
    let pb = pb.clone();
    Arc::new(move |done: u64, total: u64| {
        pb.set_length(total);
        pb.set_position(done);
        ProgressControl::Continue
    })
}

// ── `stow upload` ─────────────────────────────────────────────────────────────

async fn cmd_upload(
    config: &StowConfig,
    file: &Path,
    key: &str,
    bucket: Option<&str>,
    out: Option<&Path>,
    conversation: Option<&str>,
) -> Result<()> {
    let backend = open_backend(config)?;
    let store = AttachmentStore::new(backend.store.clone(), config.transfer.clone());
    let dest = Destination::new(bucket.unwrap_or(config.storage.bucket.as_str()), key);

    let mut task = UploadTask::from_file(file, dest.clone(), backend.signer.clone())
        .await
        .with_context(|| format!("opening {}", file.display()))?;
    if let Some(conv) = conversation {
        task = task.with_conversation_id(conv.as_bytes().to_vec());
    }

    eprintln!(
        "Uploading {} → {} ({})",
        file.display(),
        dest,
        fmt_bytes(task.local.size)
    );

    let pb = make_progress_bar(0, "upload");
    task = task.with_progress(progress_sink(&pb));

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let result = stow_transfer::upload_with_retry(&store, &cancel, &mut task).await;
    let asset = match result {
        Ok(asset) => {
            pb.finish_with_message("done");
            asset
        }
        Err(e) => {
            pb.abandon_with_message("failed");
            return Err(describe(e)).with_context(|| format!("uploading {}", file.display()));
        }
    };

    let json = asset.to_json()?;
    match out {
        Some(path) => {
            tokio::fs::write(path, json.as_bytes())
                .await
                .with_context(|| format!("writing asset descriptor: {}", path.display()))?;
            eprintln!("  asset:   {}", path.display());
        }
        None => println!("{json}"),
    }
    eprintln!("  sealed:  {}", fmt_bytes(asset.size));
    info!(dest = %dest, size = asset.size, "upload complete");
    Ok(())
}

// ── `stow download` ───────────────────────────────────────────────────────────

async fn cmd_download(
    config: &StowConfig,
    asset_path: &Path,
    output: &Path,
    bucket: Option<&str>,
) -> Result<()> {
    let json = tokio::fs::read_to_string(asset_path)
        .await
        .with_context(|| format!("reading asset descriptor: {}", asset_path.display()))?;
    let asset = Asset::from_json(&json)?;

    let backend = open_backend(config)?;
    let store = AttachmentStore::new(backend.store.clone(), config.transfer.clone());
    let dest = Destination::new(
        bucket.unwrap_or(config.storage.bucket.as_str()),
        asset.object_key.clone(),
    );

    let mut file = tokio::fs::File::create(output)
        .await
        .with_context(|| format!("creating {}", output.display()))?;

    eprintln!("Downloading {} → {}", dest, output.display());
    let pb = make_progress_bar(0, "download");
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let result = stow_transfer::download_with_retry(
        &store,
        &cancel,
        &dest,
        &asset,
        &mut file,
        &*backend.signer,
        Some(progress_sink(&pb)),
    )
    .await;

    match result {
        Ok(bytes) => {
            pb.finish_with_message("verified");
            eprintln!("  bytes:   {}", fmt_bytes(bytes));
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message("failed");
            Err(describe(e)).with_context(|| {
                format!(
                    "downloading {dest} ({} holds only verified plaintext)",
                    output.display()
                )
            })
        }
    }
}

/// Attach a hint about what the caller can do for each failure class.
fn describe(err: StowError) -> anyhow::Error {
    let hint = match &err {
        StowError::Integrity { .. } | StowError::Order { .. } => {
            "the stored object was modified or the asset keys do not match"
        }
        StowError::Truncation { .. } => "the stored object is incomplete",
        StowError::Canceled => "re-run the command to resume",
        StowError::Transfer(_) | StowError::Io(_) => "storage or network failure",
        StowError::Framing(_) | StowError::Config(_) => "invalid input",
    };
    anyhow::Error::new(err).context(hint)
}

// ── `stow status` ─────────────────────────────────────────────────────────────

async fn cmd_status(config: &StowConfig) -> Result<()> {
    let backend = open_backend(config)?;
    println!("stow v{}", env!("CARGO_PKG_VERSION"));
    println!("  backend:  {}", config.storage.backend);
    println!("  endpoint: {}", config.storage.endpoint);
    println!("  bucket:   {}", config.storage.bucket);

    let report = stow_storage::probe(&backend.operator).await;
    match &report.error {
        None => println!("  storage:  ok ({} ms)", report.latency.as_millis()),
        Some(e) => {
            println!("  storage:  UNREACHABLE ({e})");
            std::process::exit(1);
        }
    }
    Ok(())
}

// ── `stow config show` ────────────────────────────────────────────────────────

fn cmd_config_show(config: &StowConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!(
            "# Configuration: defaults (no file at {})",
            config_path.display()
        );
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
