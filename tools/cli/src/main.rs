//! FFLocker CLI - lock and unlock files and folders from the terminal.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fflocker_common::SecureBuffer;
use fflocker_crypto::BiometricSigner;
use fflocker_engine::{
    format_size, layout, uses_biometric, Credential, EventSink, LockEvent, LockOrchestrator,
    LockedItemsRepository, LockerConfig, SqliteRepository,
};

#[derive(Parser)]
#[command(name = "fflocker")]
#[command(about = "FFLocker - Lock files and folders with a password")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Locked-items database (default: <data dir>/fflocker/locked_items.db).
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    /// Number of files processed concurrently.
    #[arg(short, long, global = true)]
    parallelism: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lock a file or folder.
    Lock {
        /// File or folder to lock.
        path: PathBuf,
    },

    /// Unlock a locked file or folder.
    Unlock {
        /// Container file or locked folder.
        path: PathBuf,
    },

    /// List locked items.
    List,

    /// Show whether an item is locked.
    Status {
        /// File or folder to inspect.
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let builder = FmtSubscriber::builder()
        .with_target(false)
        .compact();
    if std::env::var_os("RUST_LOG").is_some() {
        tracing::subscriber::set_global_default(
            builder.with_env_filter(EnvFilter::from_default_env()).finish(),
        )?;
    } else {
        tracing::subscriber::set_global_default(builder.with_max_level(level).finish())?;
    }

    let mut config = match &cli.config {
        Some(path) => LockerConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => LockerConfig::default(),
    };
    if let Some(workers) = cli.parallelism {
        config = config.with_parallelism(workers);
    }

    let registry_path = match cli.registry {
        Some(path) => path,
        None => default_registry_path()?,
    };
    let registry: Arc<dyn LockedItemsRepository> = Arc::new(
        SqliteRepository::open(&registry_path).context("Failed to open locked-items registry")?,
    );

    match cli.command {
        Commands::Lock { path } => cmd_lock(config, registry, &path).await,
        Commands::Unlock { path } => cmd_unlock(config, registry, &path).await,
        Commands::List => cmd_list(registry.as_ref()),
        Commands::Status { path } => cmd_status(&path),
    }
}

fn default_registry_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir().context("Could not determine the user data directory")?;
    Ok(data_dir.join("fflocker").join("locked_items.db"))
}

/// Platform biometric signer. None ships for this platform.
fn biometric_signer() -> Option<Box<dyn BiometricSigner>> {
    None
}

/// Prompt for password securely.
fn prompt_password(prompt: &str) -> Result<SecureBuffer> {
    let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
    Ok(SecureBuffer::from_string(password))
}

/// Ask a yes/no question on stdin.
fn confirm(question: &str, default: bool) -> Result<bool> {
    let hint = if default { "[Y/n]" } else { "[y/N]" };
    print!("{} {} ", question, hint);
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().read_line(&mut answer).context("Failed to read answer")?;
    Ok(match answer.trim().to_lowercase().as_str() {
        "" => default,
        "y" | "yes" => true,
        _ => false,
    })
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Cancelling, rolling back...");
            token.cancel();
        }
    });
}

/// Print progress percentages until the sender side closes.
fn print_progress(mut events: UnboundedReceiver<LockEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let LockEvent::Progress(percent) = event {
                println!("  Progress: {}%", percent);
            }
        }
    })
}

fn orchestrator(
    config: LockerConfig,
    registry: Arc<dyn LockedItemsRepository>,
) -> (LockOrchestrator, UnboundedReceiver<LockEvent>) {
    let (events, rx) = EventSink::channel();
    (LockOrchestrator::new(config, registry).with_events(events), rx)
}

/// Lock a file or folder.
async fn cmd_lock(
    config: LockerConfig,
    registry: Arc<dyn LockedItemsRepository>,
    path: &Path,
) -> Result<()> {
    let password = prompt_password("Enter password: ")?;
    let confirmation = prompt_password("Confirm password: ")?;

    if password.as_bytes()? != confirmation.as_bytes()? {
        anyhow::bail!("Passwords do not match");
    }

    if password.is_empty()? {
        anyhow::bail!("Password cannot be empty");
    }

    let signer = biometric_signer();
    let use_biometric = match &signer {
        Some(_) => confirm("Enable biometric unlock?", false)?,
        None => false,
    };

    let (locker, rx) = orchestrator(config, registry);
    let printer = print_progress(rx);
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let started = Instant::now();
    let signer = signer.as_deref().filter(|_| use_biometric);
    let result = locker.lock(path, &password, signer, &cancel).await;
    drop(locker);
    let _ = printer.await;

    let outcome = result.with_context(|| format!("Failed to lock {}", path.display()))?;

    println!("Locked successfully!");
    println!("  Location: {}", outcome.locked_path.display());
    println!("  Files: {} ({})", outcome.files, format_size(outcome.bytes));
    println!("  Elapsed: {:.2}s", started.elapsed().as_secs_f64());

    Ok(())
}

/// Unlock a container or locked folder.
async fn cmd_unlock(
    config: LockerConfig,
    registry: Arc<dyn LockedItemsRepository>,
    path: &Path,
) -> Result<()> {
    let signer = biometric_signer();
    let biometric_item = uses_biometric(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let use_biometric = match (&signer, biometric_item) {
        (Some(_), true) => confirm("Unlock with biometrics?", true)?,
        (None, true) => {
            info!("Biometric unlock is not available here, falling back to password");
            false
        }
        _ => false,
    };

    let password = if use_biometric {
        None
    } else {
        Some(prompt_password("Enter password: ")?)
    };
    let credential = match (&password, signer.as_deref()) {
        (Some(password), _) => Credential::Password(password),
        (None, Some(signer)) => Credential::Biometric(signer),
        (None, None) => anyhow::bail!("No credential available"),
    };

    let (locker, rx) = orchestrator(config, registry);
    let printer = print_progress(rx);
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let started = Instant::now();
    let result = locker.unlock(path, credential, &cancel).await;
    drop(locker);
    let _ = printer.await;

    let outcome = result.with_context(|| format!("Failed to unlock {}", path.display()))?;

    println!("Unlocked successfully!");
    println!("  Location: {}", outcome.restored_path.display());
    println!("  Files: {} ({})", outcome.files, format_size(outcome.bytes));
    println!("  Elapsed: {:.2}s", started.elapsed().as_secs_f64());

    Ok(())
}

/// List locked items from the registry.
fn cmd_list(registry: &dyn LockedItemsRepository) -> Result<()> {
    let records = registry.list().context("Failed to read locked items")?;

    if records.is_empty() {
        println!("No locked items.");
    } else {
        println!("Locked items:");
        for record in records {
            let kind = if record.is_folder { "[DIR] " } else { "[FILE]" };
            println!(
                "  {} {} -> {} (locked {})",
                kind,
                record.original_path.display(),
                record.locked_path.display(),
                record.locked_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    Ok(())
}

/// Show lock status of a path.
fn cmd_status(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("{} does not exist", path.display());
    }

    if !layout::is_locked(path) {
        println!("{}: not locked", path.display());
        return Ok(());
    }

    let biometric = uses_biometric(path).context("Failed to read container header")?;
    println!("{}: locked", path.display());
    println!("  Biometric unlock: {}", if biometric { "enabled" } else { "disabled" });

    Ok(())
}
