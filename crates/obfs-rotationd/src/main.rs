//! obfs-rotationd - Obfuscation Rotation Daemon
//!
//! Entry point for the rotation daemon and its manual operation verbs.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use obfs_common::{ObfsError, ObfsResult, OpLock};
use obfs_rotationd::{load_policy, RotationScheduler, StateStore};

/// Default rotation policy config file
const DEFAULT_CONFIG: &str = "/etc/obfs-rotationd/rotation.conf";

/// Default persisted state file
const DEFAULT_STATE: &str = "/var/lib/obfs-rotationd/rotation.state";

/// Default exclusive lock marker
const DEFAULT_LOCK: &str = "/run/obfs-rotationd/rotation.lock";

#[derive(Parser)]
#[command(
    name = "obfs-rotationd",
    version,
    about = "Rotates VLAN/MAC/shaping attributes on mesh interfaces attached to an OVS bridge"
)]
struct Cli {
    /// Rotation policy config file
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Persisted rotation state file
    #[arg(long, default_value = DEFAULT_STATE)]
    state_file: PathBuf,

    /// Exclusive operation lock marker
    #[arg(long, default_value = DEFAULT_LOCK)]
    lock_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply obfuscation to a newly attached interface
    Apply { interface: String, bridge: String },

    /// Rotate techniques whose interval has elapsed on one interface
    Rotate { interface: String, bridge: String },

    /// Revert obfuscation from a detached interface
    Remove { interface: String, bridge: String },

    /// Print the persisted view of managed interfaces
    Status,

    /// Run the continuous rotation loop
    Daemon,
}

/// Initializes tracing/logging subsystem
fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("SIGTERM handler unavailable: {}", e);
            let _ = ctrl_c.await;
        }
    }
}

fn report(result: ObfsResult<()>, success_msg: &str) -> ExitCode {
    match result {
        Ok(()) => {
            println!("{}", success_msg);
            ExitCode::SUCCESS
        }
        Err(e) => fail(e),
    }
}

fn fail(e: ObfsError) -> ExitCode {
    eprintln!("error: {}", e);
    ExitCode::FAILURE
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    let policy = match load_policy(&cli.config) {
        Ok(policy) => policy,
        Err(ObfsError::ObfuscationDisabled) => {
            info!("Obfuscation is disabled, nothing to do");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let store = StateStore::new(&cli.state_file);
    let lock = OpLock::new(&cli.lock_file);
    let mut scheduler = RotationScheduler::new(policy, store, lock);

    match cli.command {
        Command::Apply { interface, bridge } => {
            let result = scheduler.apply(&interface, &bridge).await;
            report(result, &format!("applied obfuscation to {}", interface))
        }
        Command::Rotate { interface, bridge } => match scheduler.rotate(&interface, &bridge).await
        {
            Ok(true) => {
                println!("rotated {}", interface);
                ExitCode::SUCCESS
            }
            Ok(false) => {
                println!("no rotation due for {}", interface);
                ExitCode::SUCCESS
            }
            Err(e) => fail(e),
        },
        Command::Remove { interface, bridge } => {
            let result = scheduler.remove(&interface, &bridge).await;
            report(result, &format!("removed obfuscation from {}", interface))
        }
        Command::Status => match scheduler.status() {
            Ok(entries) => {
                if entries.is_empty() {
                    println!("no managed interfaces");
                }
                for entry in entries {
                    println!(
                        "{} bridge={} vlan={} mac={} vlan_rotated={} mac_rotated={}",
                        entry.name,
                        entry.bridge,
                        entry
                            .current_vlan
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        entry
                            .current_mac
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        entry.last_vlan_rotation,
                        entry.last_mac_rotation,
                    );
                }
                ExitCode::SUCCESS
            }
            Err(e) => fail(e),
        },
        Command::Daemon => {
            info!("--- Starting obfs-rotationd ---");

            // Lock infrastructure failure is the one runtime condition
            // that is fatal at startup
            if let Err(e) = scheduler.ensure_lock_dir() {
                error!("Lock setup failed: {}", e);
                return ExitCode::FAILURE;
            }

            scheduler.run_until(shutdown_signal()).await;
            info!("obfs-rotationd exiting normally");
            ExitCode::SUCCESS
        }
    }
}
