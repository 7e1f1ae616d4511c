//! notirelay agent - forwards captured notifications to an HTTP endpoint.
//!
//! # Commands
//!
//! - `notirelay-agent run`: Watch the spool and deliver notifications
//! - `notirelay-agent logs`: Print the activity log
//! - `notirelay-agent clear-logs`: Empty the activity log
//! - `notirelay-agent export-logs`: Write the activity log as plain text
//! - `notirelay-agent test-send`: Queue and deliver a test notification
//! - `notirelay-agent settings`: Show the forwarding settings
//! - `notirelay-agent status`: Show the delivery queue
//!
//! # Environment Variables
//!
//! See the [`config`] module for available configuration options.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::{mpsc, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use notirelay_agent::client::DeliveryTarget;
use notirelay_agent::config::{Config, ConfigHandle, ForwardingConfig};
use notirelay_agent::dispatcher::{Dispatcher, DispatcherConfig};
use notirelay_agent::listener::{CaptureListener, SpoolProgress};
use notirelay_agent::log_sink::LogSink;
use notirelay_agent::store::DeliveryStore;
use notirelay_agent::types::{DeliveryPayload, DeliveryState, LogKind, NotificationEvent};
use notirelay_agent::watcher::{SpoolWatcher, WatchEvent};

/// Capacity of the watcher-to-main channel.
const WATCH_CHANNEL_CAPACITY: usize = 256;

/// notirelay agent - notification capture and reliable webhook delivery.
///
/// Reads notifications from a spool directory, filters them by package and
/// forwards them to an HTTP endpoint with retries.
#[derive(Parser, Debug)]
#[command(name = "notirelay-agent")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    NOTIRELAY_ENDPOINT_URL          Endpoint URL (required for 'run', 'test-send', 'settings')
    NOTIRELAY_API_KEY               Bearer token sent with every request
    NOTIRELAY_FILTER_PACKAGES       Comma-separated package identifiers to forward
    NOTIRELAY_FORWARD_ALL           Forward every package (default: false)
    NOTIRELAY_LOG_FILTERED          Log ignored notifications (default: false)
    NOTIRELAY_DATA_DIR              Data directory (default: ~/.notirelay)
    NOTIRELAY_SPOOL_DIR             Spool directory (default: <data dir>/spool)
    NOTIRELAY_CAPTURE_ENABLED       Notification access granted (default: true)
    NOTIRELAY_CONCURRENCY           Concurrent deliveries (default: 4)
    NOTIRELAY_POLL_INTERVAL_SECS    Idle poll interval (default: 5)
    NOTIRELAY_REQUEST_TIMEOUT_SECS  Per-request timeout (default: 15)
    NOTIRELAY_MAX_ATTEMPTS          Attempts before giving up (default: 5)
    NOTIRELAY_RETENTION_HOURS       Keep finished deliveries for (default: 24)
    NOTIRELAY_LOG_FORMAT            'json' for structured process logs
    RUST_LOG                        Process log filter (default: info for 'run')

EXAMPLES:
    # Start the agent
    export NOTIRELAY_ENDPOINT_URL=https://api.example.com/notifications
    export NOTIRELAY_FILTER_PACKAGES=com.whatsapp,id.dana
    notirelay-agent run

    # Check that the endpoint accepts deliveries
    notirelay-agent test-send

    # Save the activity log
    notirelay-agent export-logs --output notirelay-logs.txt
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Start the agent.
    ///
    /// Watches the spool directory and delivers accepted notifications.
    /// Requires NOTIRELAY_ENDPOINT_URL.
    Run,

    /// Print the activity log, most recent first.
    Logs {
        /// Show at most this many entries.
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Print entries as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Remove every activity log entry.
    ClearLogs,

    /// Export the activity log as plain text.
    ExportLogs {
        /// Write to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Queue a test notification and attempt delivery immediately.
    ///
    /// The test notification bypasses the package filter. Only the test
    /// notification is attempted; other queued deliveries are left to 'run'.
    TestSend {
        /// Source package of the test notification.
        #[arg(long, default_value = "notirelay.test")]
        package: String,

        #[arg(long, default_value = "Test notification")]
        title: String,

        #[arg(long, default_value = "If you can read this, forwarding works.")]
        body: String,
    },

    /// Show the forwarding settings with the API key masked.
    Settings,

    /// Show delivery counts per state and recent failures.
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Settings = cli.command {
        return run_settings();
    }

    let verbose = matches!(cli.command, Command::Run | Command::TestSend { .. });
    init_logging(if verbose { "info" } else { "warn" });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Command::Run => run_agent().await,
            Command::Logs { limit, json } => run_logs(limit, json).await,
            Command::ClearLogs => run_clear_logs().await,
            Command::ExportLogs { output } => run_export_logs(output).await,
            Command::TestSend {
                package,
                title,
                body,
            } => run_test_send(NotificationEvent::new(package, title, body)).await,
            Command::Status => run_status().await,
            Command::Settings => run_settings(),
        }
    })
}

async fn open_store(config: &Config) -> Result<DeliveryStore> {
    let path = config.database_path();
    DeliveryStore::open(&path)
        .await
        .with_context(|| format!("Failed to open delivery store at {}", path.display()))
}

/// Runs the agent until SIGINT or SIGTERM.
async fn run_agent() -> Result<()> {
    info!("Starting notirelay agent");

    let config = Config::from_env().context("Failed to load configuration")?;
    let forwarding = ForwardingConfig::from_env().context("Failed to load forwarding settings")?;

    info!(
        data_dir = %config.data_dir.display(),
        spool_dir = %config.spool_dir.display(),
        capture_enabled = config.capture_enabled,
        filter_packages = forwarding.filter_packages.len(),
        forward_all = forwarding.forward_all_apps,
        "Configuration loaded"
    );

    let store = open_store(&config).await?;

    // No lease can be legitimately held before the dispatcher starts.
    let recovered = store
        .recover_stale_leases(Utc::now(), Duration::ZERO)
        .await
        .context("Failed to recover interrupted deliveries")?;
    if recovered > 0 {
        warn!(recovered, "Re-queued deliveries interrupted by the previous run");
    }

    let config_handle = ConfigHandle::new(forwarding);
    let wake = Arc::new(Notify::new());
    let cancel = CancellationToken::new();

    let dispatcher = Dispatcher::new(
        store.clone(),
        config_handle.clone(),
        DispatcherConfig::from_config(&config),
        Arc::clone(&wake),
    )
    .context("Failed to create dispatcher")?;
    let dispatcher_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.run(cancel).await })
    };

    let listener = CaptureListener::new(store.clone(), config_handle, wake);

    let (watch_tx, mut watch_rx) = mpsc::channel::<WatchEvent>(WATCH_CHANNEL_CAPACITY);
    let watcher = if config.capture_enabled {
        Some(start_watcher(&config.spool_dir, &store, watch_tx).await?)
    } else {
        warn!("Notification capture is disabled; only queued deliveries will be sent");
        drop(watch_tx);
        None
    };

    info!("Agent running. Press Ctrl+C to stop.");

    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    let mut rewound: HashMap<PathBuf, u64> = HashMap::new();
    let mut reread = tokio::time::interval_at(
        Instant::now() + config.poll_interval,
        config.poll_interval,
    );
    reread.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            Some(watch_event) = watch_rx.recv() => {
                process_watch_event(watch_event, &listener, &store, watcher.as_ref(), &mut rewound).await;
            }
            _ = reread.tick(), if !rewound.is_empty() => {
                if let Some(watcher) = &watcher {
                    for path in rewound.keys() {
                        watcher.schedule_read(path);
                    }
                }
            }
        }
    }

    info!("Shutting down...");
    cancel.cancel();
    if let Err(e) = dispatcher_task.await {
        error!(error = %e, "Dispatcher task failed");
    }
    store.close().await;

    info!("Agent stopped");
    Ok(())
}

/// Creates the spool directory if needed and starts tailing it.
async fn start_watcher(
    spool_dir: &Path,
    store: &DeliveryStore,
    watch_tx: mpsc::Sender<WatchEvent>,
) -> Result<SpoolWatcher> {
    if !spool_dir.exists() {
        info!(spool_dir = %spool_dir.display(), "Creating spool directory");
        std::fs::create_dir_all(spool_dir).context("Failed to create spool directory")?;
    }

    let mut offsets: HashMap<PathBuf, u64> = store
        .spool_offsets()
        .await
        .context("Failed to read spool offsets")?;
    let missing: Vec<PathBuf> = offsets
        .keys()
        .filter(|path| !path.exists())
        .cloned()
        .collect();
    for path in missing {
        offsets.remove(&path);
        if let Err(e) = store.forget_spool_offset(&path).await {
            warn!(path = %path.display(), error = %e, "Failed to forget spool offset");
        }
    }

    SpoolWatcher::new(spool_dir.to_path_buf(), offsets, watch_tx).with_context(|| {
        format!("Failed to initialize spool watcher for {}", spool_dir.display())
    })
}

/// Hands new spool lines to the listener, then records how far the file was handled.
///
/// `rewound` holds files whose last batch hit a storage failure, keyed by the
/// offset they were rewound to. Reads of such a file that start past that
/// offset were made before the rewind and are dropped; the re-read covers them.
async fn process_watch_event(
    watch_event: WatchEvent,
    listener: &CaptureListener,
    store: &DeliveryStore,
    watcher: Option<&SpoolWatcher>,
    rewound: &mut HashMap<PathBuf, u64>,
) {
    match watch_event {
        WatchEvent::LinesAdded {
            path,
            lines,
            offset,
        } => {
            if let Some(&resume_at) = rewound.get(&path) {
                if lines.first().is_some_and(|line| line.start > resume_at) {
                    debug!(path = %path.display(), resume_at, "Dropping spool lines read before rewind");
                    return;
                }
                rewound.remove(&path);
            }

            debug!(path = %path.display(), line_count = lines.len(), "Processing spool lines");
            let progress = listener.on_spool_lines(&path, &lines, offset).await;

            if let SpoolProgress::Interrupted { offset: resume_at, error } = &progress {
                warn!(
                    path = %path.display(),
                    resume_at,
                    error = %error,
                    "Spool batch interrupted, will read again from the failed line"
                );
                if let Some(watcher) = watcher {
                    watcher.rewind(&path, *resume_at).await;
                }
                rewound.insert(path.clone(), *resume_at);
            }

            if let Err(e) = store
                .save_spool_offset(&path, progress.offset(), Utc::now())
                .await
            {
                error!(path = %path.display(), error = %e, "Failed to save spool offset");
            }
        }

        WatchEvent::FileRemoved(path) => {
            rewound.remove(&path);
            if let Err(e) = store.forget_spool_offset(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to forget spool offset");
            }
        }
    }
}

async fn run_logs(limit: Option<usize>, json: bool) -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    let store = open_store(&config).await?;
    let mut entries = LogSink::new(store.clone())
        .list()
        .await
        .context("Failed to read activity log")?;
    store.close().await;

    if let Some(limit) = limit {
        entries.truncate(limit);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("No logs yet.");
    } else {
        for entry in &entries {
            println!("{}", entry.to_line());
        }
    }
    Ok(())
}

async fn run_clear_logs() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    let store = open_store(&config).await?;
    let removed = LogSink::new(store.clone())
        .clear()
        .await
        .context("Failed to clear activity log")?;
    store.close().await;

    println!("Removed {removed} log entries.");
    Ok(())
}

async fn run_export_logs(output: Option<PathBuf>) -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    let store = open_store(&config).await?;
    let text = LogSink::new(store.clone())
        .export_text()
        .await
        .context("Failed to read activity log")?;
    store.close().await;

    match output {
        Some(path) => {
            std::fs::write(&path, text)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Logs exported to {}", path.display());
        }
        None => print!("{text}"),
    }
    Ok(())
}

/// Queues one notification outside the filter and drives the dispatcher
/// inline until that notification has had an attempt.
async fn run_test_send(event: NotificationEvent) -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    let forwarding = ForwardingConfig::from_env().context("Failed to load forwarding settings")?;
    DeliveryTarget::from_config(&forwarding).context("Forwarding settings are not usable")?;

    let store = open_store(&config).await?;
    let log = LogSink::new(store.clone());

    let payload = DeliveryPayload::from_event(&event);
    let id = store
        .enqueue(&payload, Utc::now())
        .await
        .context("Failed to queue test notification")?;
    log.record(
        LogKind::Queued,
        format!("Queued test notification from {}", event.source_package),
    )
    .await;

    let dispatcher = Dispatcher::new(
        store.clone(),
        ConfigHandle::new(forwarding),
        DispatcherConfig::from_config(&config),
        Arc::new(Notify::new()),
    )
    .context("Failed to create dispatcher")?;

    let outcome = dispatcher.process_delivery(id).await;
    store.close().await;
    let outcome = outcome.context("Failed to deliver test notification")?;

    let Some(done) = outcome else {
        bail!("Test notification {id} was queued but not attempted; it will be sent by the running agent");
    };

    match done.state {
        DeliveryState::Delivered => println!("Test notification delivered."),
        DeliveryState::Failed => println!(
            "Test notification failed and will be retried: {}",
            done.last_error.as_deref().unwrap_or("unknown error")
        ),
        _ => println!(
            "Test notification was not delivered: {}",
            done.last_error.as_deref().unwrap_or("unknown error")
        ),
    }
    Ok(())
}

fn run_settings() -> Result<()> {
    let forwarding = ForwardingConfig::from_env().context("Failed to load forwarding settings")?;
    println!("{}", forwarding.summary());
    if let Err(e) = DeliveryTarget::from_config(&forwarding) {
        println!();
        println!("Warning: {e}");
    }
    Ok(())
}

async fn run_status() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    let store = open_store(&config).await?;

    let counts = store
        .count_by_state()
        .await
        .context("Failed to count deliveries")?;
    let mut problems = store
        .list_deliveries(Some(DeliveryState::Failed))
        .await
        .context("Failed to list deliveries")?;
    problems.extend(
        store
            .list_deliveries(Some(DeliveryState::Abandoned))
            .await
            .context("Failed to list deliveries")?,
    );
    let next_due = store.next_due_at().await.context("Failed to read queue")?;
    store.close().await;

    println!("Database: {}", config.database_path().display());
    for (state, count) in counts {
        println!("  {:<10} {count}", state.as_str());
    }
    if let Some(next_due) = next_due {
        println!("Next attempt due: {}", next_due.format("%Y-%m-%d %H:%M:%S"));
    }

    problems.sort_by_key(|entry| std::cmp::Reverse(entry.last_updated_at));
    if !problems.is_empty() {
        println!();
        println!("Recent failures:");
        for entry in problems.iter().take(10) {
            println!(
                "  #{} {} [{}] attempts={} {}",
                entry.id,
                entry.payload.source_package,
                entry.state,
                entry.attempt_count,
                entry.last_error.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

/// Initializes the logging subsystem; `RUST_LOG` overrides `default_level`.
///
/// `NOTIRELAY_LOG_FORMAT=json` switches to one JSON object per line.
fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let json = std::env::var("NOTIRELAY_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
