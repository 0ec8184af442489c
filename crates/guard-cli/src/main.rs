use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use guard_channel::RemoteChannel;
use guard_core::{now_ms, EntryStatus, JobKind, Origin};
use guard_runtime::{
    Agent, AgentSettings, Config, DeliveryWorker, Dispatcher, JobOutcome, ProtectionController, Shared,
};
use guard_storage::QueueStore;
use guard_storage_sqlite::SqliteStore;
use guard_telegram::{TelegramChannel, TelegramConfig};

#[derive(Parser)]
#[command(name = "teleguard", version, about = "Capture, queue and deliver device alerts to Telegram")]
struct Cli {
    /// Data directory holding teleguard.toml and teleguard.db (default ~/.teleguard)
    #[arg(long, global = true)]
    data_dir: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a config template and create the database
    Init {
        #[arg(long)]
        force: bool,
    },

    /// Run the resident agent until Ctrl-C or SIGTERM
    Run,

    /// Turn protection on (captures are admitted)
    Enable,

    /// Turn protection off (captures are suppressed)
    Disable,

    /// Protection state and queue counts
    Status {
        /// Also check that Telegram is reachable
        #[arg(long)]
        probe: bool,
    },

    /// Capture one artifact now and queue it
    Capture {
        #[arg(long)]
        kind: JobKind,
    },

    /// Run one delivery cycle now
    Flush,

    /// List entries that failed permanently
    Failed {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let data_dir = Config::data_dir(cli.data_dir.as_deref());

    match cli.cmd {
        Command::Init { force } => {
            let path = Config::config_path(&data_dir);
            if path.exists() && !force {
                println!("Config already exists at {} (use --force to overwrite)", path.display());
            } else {
                Config::default_template().save_to(&path)?;
                println!("Wrote config template to {}", path.display());
            }
            open_store(&data_dir, None)?;
            println!("Database ready at {}", Config::db_path(&data_dir).display());
            println!("Set recipient.bot_token and recipient.chat_id, then run `teleguard enable`.");
        }
        Command::Run => {
            let cfg = load_config(&data_dir)?;
            cfg.validate()?;
            run_agent(&data_dir, &cfg).await?;
        }
        Command::Enable => {
            let store = open_store(&data_dir, None)?;
            let state = ProtectionController::load(store)?.enable(now_ms())?;
            println!("Protection ON (since {})", state.last_changed_at);
        }
        Command::Disable => {
            let store = open_store(&data_dir, None)?;
            let state = ProtectionController::load(store)?.disable(now_ms())?;
            println!("Protection OFF (since {})", state.last_changed_at);
        }
        Command::Status { probe } => {
            let store = open_store(&data_dir, None)?;
            let shared = Shared::new(store.clone(), Arc::new(ProtectionController::load(store)?));
            if probe {
                let cfg = load_config(&data_dir)?;
                cfg.validate()?;
                let up = telegram(&cfg)?.probe().await.is_ok();
                shared.link.observe(up);
            }
            println!("{}", shared.snapshot(now_ms())?.render());
        }
        Command::Capture { kind } => {
            let cfg = load_config(&data_dir)?;
            let store = open_store(&data_dir, Some(&cfg))?;
            let shared = Shared::new(store.clone(), Arc::new(ProtectionController::load(store)?));
            let dispatcher = Dispatcher::new(shared, cfg.build_producer()?, vec![]);
            let outcome = dispatcher.trigger(kind, Origin::ManualLocal)?.outcome().await;
            match outcome {
                None => println!("Protection is OFF, capture suppressed"),
                Some(JobOutcome::Queued(id)) => println!("Queued {kind} capture as job #{id}"),
                Some(JobOutcome::CaptureFailed { job_id, error }) => println!("Job #{job_id} failed: {error}"),
                Some(JobOutcome::Dropped(job_id)) => println!("Job #{job_id} dropped, protection turned off"),
                Some(JobOutcome::PersistFailed { job_id, error }) => {
                    anyhow::bail!("job #{job_id} captured but not stored: {error}")
                }
            }
        }
        Command::Flush => {
            let cfg = load_config(&data_dir)?;
            cfg.validate()?;
            let store = open_store(&data_dir, Some(&cfg))?;
            let shared = Shared::new(store.clone(), Arc::new(ProtectionController::load(store)?));
            let worker = DeliveryWorker::new(shared, Arc::new(telegram(&cfg)?), cfg.worker_config());
            match worker.run_once(now_ms()).await? {
                Some(r) => println!(
                    "Claimed {}: {} delivered, {} retrying, {} failed{}",
                    r.claimed,
                    r.delivered,
                    r.retried,
                    r.failed,
                    if r.channel_down { " (Telegram unreachable)" } else { "" }
                ),
                None => println!("The running agent holds the delivery lease; it will deliver on its next cycle"),
            }
        }
        Command::Failed { limit } => {
            let store = open_store(&data_dir, None)?;
            let failed = store.list(EntryStatus::Failed)?;
            println!("Failed entries: {}", failed.len());
            for e in failed.iter().rev().take(limit) {
                println!(
                    "- #{} {} ({}) attempts={} reason={}",
                    e.id(),
                    e.job.kind,
                    e.job.origin.as_str(),
                    e.delivery_attempts,
                    e.failure_reason.as_deref().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}

fn load_config(data_dir: &Path) -> Result<Config> {
    let path = Config::config_path(data_dir);
    Config::load_from(&path).with_context(|| format!("load config (run `teleguard init` first): {}", path.display()))
}

fn open_store(data_dir: &Path, cfg: Option<&Config>) -> Result<Arc<SqliteStore>> {
    let db_path: PathBuf = Config::db_path(data_dir);
    let mut store = SqliteStore::open(&db_path)?;
    if let Some(cfg) = cfg {
        store = store.with_byte_cap(cfg.storage.max_queue_bytes);
    }
    Ok(Arc::new(store))
}

fn telegram(cfg: &Config) -> Result<TelegramChannel> {
    let channel = TelegramChannel::new(TelegramConfig {
        bot_token: cfg.recipient.bot_token.clone(),
        chat_id: cfg.recipient.chat_id,
        api_base: cfg.recipient.api_base.clone(),
        send_timeout: Duration::from_secs(cfg.delivery.send_timeout_secs),
        poll_timeout_secs: cfg.recipient.poll_timeout_secs,
    })?;
    Ok(channel)
}

async fn run_agent(data_dir: &Path, cfg: &Config) -> Result<()> {
    let store = open_store(data_dir, Some(cfg))?;
    let channel: Arc<dyn RemoteChannel> = Arc::new(telegram(cfg)?);
    let agent = Agent::new(
        store.clone(),
        store,
        channel,
        cfg.build_producer()?,
        AgentSettings::from_config(cfg),
    )?;

    let (tx, rx) = watch::channel(false);
    let tasks = agent.start(rx)?;
    info!(data_dir = %data_dir.display(), "teleguard running, Ctrl-C to stop");

    wait_for_stop_signal().await?;
    info!("shutting down");
    let _ = tx.send(true);
    tasks.join().await;
    Ok(())
}

/// Ctrl-C, or SIGTERM from a service manager.
async fn wait_for_stop_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("wait for ctrl-c")?,
            _ = terminate.recv() => info!("SIGTERM received"),
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("wait for ctrl-c")
    }
}
