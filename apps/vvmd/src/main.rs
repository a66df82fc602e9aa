//! # vvmd
//!
//! Visual voicemail sync daemon.
//!
//! ## Startup Sequence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Daemon Startup                                  │
//! │                                                                         │
//! │  1. Initialize tracing (RUST_LOG, default info,vvm=debug,sqlx=warn)    │
//! │  2. Load VvmConfig (defaults → vvmd.toml → VVM_* env)                   │
//! │  3. Open SQLite database, run migrations                               │
//! │  4. Scheduler handle first, then orchestrator + registry over it       │
//! │  5. Spawn scheduler loop with the orchestrator as runner               │
//! │  6. "sync requested" once, then every sync_interval_secs               │
//! │  7. Ctrl-C: stop the alarm, drain running tasks, exit                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vvm_core::{AccountHandle, VoicemailStatus};
use vvm_db::{Database, DbConfig};
use vvm_sync::{
    NetworkManager, NetworkState, StatusEmitter, StatusReporter, SyncOrchestrator,
    SyncOrchestratorBuilder, SyncTriggers, TaskScheduler, VvmConfig,
};

/// Visual voicemail sync daemon
#[derive(Parser, Debug)]
#[command(name = "vvmd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: platform config dir / vvmd.toml)
    #[arg(short, long, global = true, env = "VVM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon until interrupted (default)
    Run,

    /// Sync every enabled account once and exit
    Sync,

    /// Print the stored status of every configured account as JSON
    Status,

    /// Change the voicemail PIN of an account
    ChangePin {
        #[arg(long)]
        account: String,

        #[arg(long)]
        old: String,

        #[arg(long)]
        new: String,
    },

    /// Change the greeting language of an account
    ChangeLanguage {
        #[arg(long)]
        account: String,

        /// ISO 639 code, e.g. "en" or "spa"
        #[arg(long)]
        language: String,
    },

    /// Dismiss the carrier's new-user tutorial
    CloseTutorial {
        #[arg(long)]
        account: String,
    },

    /// Download the audio of one voicemail
    Fetch {
        #[arg(long)]
        account: String,

        /// Server UID of the voicemail
        #[arg(long)]
        uid: String,

        /// Output file
        #[arg(short, long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = Arc::new(VvmConfig::load(cli.config.clone()).context("Failed to load config")?);
    info!(
        accounts = config.accounts.len(),
        database = %config.database_path().display(),
        "Configuration loaded"
    );

    let db = Arc::new(
        Database::new(DbConfig::new(config.database_path()))
            .await
            .context("Failed to open database")?,
    );

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(config, db).await,
        Command::Sync => sync_once(config, db).await,
        Command::Status => print_status(&config, &db).await,
        Command::ChangePin { account, old, new } => {
            let engine = Engine::start(config, db).await?;
            let result = engine
                .orchestrator
                .change_pin(&AccountHandle::new(account), &old, &new)
                .await;
            engine.stop().await;

            let result = result?;
            println!("{:?} (code {})", result, result.code());
            if !result.is_success() {
                anyhow::bail!("PIN change rejected");
            }
            Ok(())
        }
        Command::ChangeLanguage { account, language } => {
            let engine = Engine::start(config, db).await?;
            let result = engine
                .orchestrator
                .change_language(&AccountHandle::new(account), &language)
                .await;
            engine.stop().await;
            Ok(result?)
        }
        Command::CloseTutorial { account } => {
            let engine = Engine::start(config, db).await?;
            let result = engine
                .orchestrator
                .close_tutorial(&AccountHandle::new(account))
                .await;
            engine.stop().await;
            Ok(result?)
        }
        Command::Fetch { account, uid, out } => {
            let engine = Engine::start(config, db).await?;
            let result = engine
                .orchestrator
                .fetch_voicemail(&AccountHandle::new(account), &uid)
                .await;
            engine.stop().await;

            let payload = result?;
            std::fs::write(&out, &payload.data)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!("{} bytes of {} written to {}", payload.data.len(), payload.mime_type, out.display());
            Ok(())
        }
    }
}

// =============================================================================
// Engine Wiring
// =============================================================================

/// The running engine: scheduler loop plus the components around it.
struct Engine {
    orchestrator: Arc<SyncOrchestrator>,
    triggers: SyncTriggers,
    scheduler: vvm_sync::SchedulerHandle,
    scheduler_task: tokio::task::JoinHandle<()>,
}

impl Engine {
    async fn start(config: Arc<VvmConfig>, db: Arc<Database>) -> anyhow::Result<Engine> {
        let network = NetworkManager::new(NetworkState::online());
        let reporter = StatusReporter::new(db.clone(), Arc::new(LogEmitter));

        // The handle exists before the runner so the registry and the
        // orchestrator can enqueue follow-up work.
        let (scheduler, handle) = TaskScheduler::new(&config.scheduler);

        let orchestrator = Arc::new(
            SyncOrchestratorBuilder::new(config.clone())
                .with_database(db)
                .with_scheduler(handle.clone())
                .with_network(network)
                .with_reporter(reporter)
                .build()?,
        );
        let triggers = SyncTriggers::new(config, orchestrator.registry().clone(), handle.clone());
        let scheduler_task = tokio::spawn(scheduler.run(orchestrator.clone()));

        Ok(Engine {
            orchestrator,
            triggers,
            scheduler: handle,
            scheduler_task,
        })
    }

    /// Waits until nothing is pending or running.
    async fn drain(&self) -> anyhow::Result<()> {
        loop {
            tokio::time::sleep(Duration::from_millis(200)).await;
            if self.scheduler.is_idle().await? {
                return Ok(());
            }
        }
    }

    async fn stop(self) {
        if let Err(e) = self.scheduler.shutdown().await {
            warn!(?e, "Scheduler already stopped");
        }
        if let Err(e) = self.scheduler_task.await {
            error!(?e, "Scheduler task panicked");
        }
        self.orchestrator.registry().clear().await;
    }
}

async fn run_daemon(config: Arc<VvmConfig>, db: Arc<Database>) -> anyhow::Result<()> {
    let interval = config.sync_interval();
    let engine = Engine::start(config, db).await?;

    engine.triggers.sync_requested().await?;
    let alarm = engine.triggers.spawn_alarm(interval);
    info!(interval_secs = interval.as_secs(), "vvmd running");

    shutdown_signal().await;

    alarm.abort();
    engine.stop().await;
    info!("vvmd stopped");
    Ok(())
}

async fn sync_once(config: Arc<VvmConfig>, db: Arc<Database>) -> anyhow::Result<()> {
    let accounts: Vec<AccountHandle> = config.accounts.iter().map(|a| a.handle()).collect();
    let engine = Engine::start(config, db).await?;

    // First round activates, activation queues the full syncs.
    engine.triggers.sync_requested().await?;
    engine.drain().await?;

    for account in &accounts {
        let status = engine.orchestrator.status(account).await?;
        print_line(&status)?;
    }

    engine.stop().await;
    Ok(())
}

async fn print_status(config: &VvmConfig, db: &Database) -> anyhow::Result<()> {
    for account in config.accounts.iter().map(|a| a.handle()) {
        let status = db
            .status()
            .get(&account)
            .await?
            .unwrap_or_else(|| VoicemailStatus::new(account));
        print_line(&status)?;
    }
    Ok(())
}

fn print_line(status: &VoicemailStatus) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(status)?);
    Ok(())
}

// =============================================================================
// Host Integration
// =============================================================================

/// Status emitter that writes every change to the log.
struct LogEmitter;

impl StatusEmitter for LogEmitter {
    fn emit_status(&self, status: &VoicemailStatus) {
        info!(
            account = %status.account,
            configuration = ?status.configuration_state,
            data_channel = ?status.data_channel_state,
            last_event = status.last_event.as_deref().unwrap_or("-"),
            "Voicemail status"
        );
    }

    fn emit_error(&self, account: &AccountHandle, message: &str, retryable: bool) {
        warn!(account = %account, retryable, "Sync error: {}", message);
    }
}

/// Initializes the tracing subscriber for structured logging.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=vvm_sync=trace` - Show trace for the engine only
/// - Default: info, debug for the vvm crates
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vvm=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(?e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining tasks...");
}
