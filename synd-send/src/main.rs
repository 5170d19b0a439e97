//! synd-send - Background daemon for scheduled posting
//!
//! Drains the dispatch queue and sweeps for due posts that the queue
//! missed, publishing each through the channel's relay.

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use libsyndicast::logging::{LogFormat, LoggingConfig};
use libsyndicast::platforms::mock::MockPublisher;
use libsyndicast::platforms::Publishers;
use libsyndicast::queue::{JobQueue, RetryPolicy};
use libsyndicast::service::events::{Event, EventReceiver};
use libsyndicast::service::{DispatchReport, SyndicastService};
use libsyndicast::{Channel, Config, SyndicastError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

/// Jobs claimed from the queue per poll
const CLAIM_BATCH: u32 = 25;

#[derive(Parser, Debug)]
#[command(name = "synd-send")]
#[command(version)]
#[command(about = "Background daemon for scheduled posting")]
#[command(long_about = "\
synd-send - Background daemon for scheduled posting

DESCRIPTION:
    synd-send is a long-running daemon that publishes scheduled posts
    when they fall due.

    Each poll it claims due jobs from the dispatch queue, publishes them
    through the configured channel relays, and retries jobs that hit
    storage trouble. It then sweeps for scheduled posts that are already
    due but never reached the queue.

    Run one synd-send per database. A post is published at most once by
    a single daemon, but two daemons sharing a database can both claim
    the same due post.

USAGE:
    # Run in foreground (logs to stderr)
    synd-send

    # Poll every 15 seconds with JSON logs
    synd-send --poll-interval 15 --log-format json

    # Publish through mock relays instead of the configured endpoints
    synd-send --dry-run --once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the current poll)

CONFIGURATION:
    Configuration file: ~/.config/syndicast/config.toml

    [scheduling]
    poll_interval = 60     # seconds between polls
    publish_timeout = 30   # seconds before a relay call is abandoned
    max_attempts = 3       # attempts per queued job
    retry_delay = 300      # seconds between attempts

    [channels.linkedin]
    endpoint = \"https://relay.example.com/linkedin\"
    token = \"...\"

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration or database error
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Log output format: text, json or pretty
    #[arg(long, value_name = "FORMAT", env = "SYNDICAST_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Publish through mock relays; nothing leaves the machine
    #[arg(long)]
    dry_run: bool,

    /// Process due posts once and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env().verbose(cli.verbose);
    if let Some(format) = cli.log_format {
        logging = logging.with_format(format);
    }
    logging.init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<SyndicastError>()
            .map_or(1, SyndicastError::exit_code);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    let publishers = if cli.dry_run {
        dry_run_publishers()
    } else {
        Publishers::from_config(&config.channels)?
    };
    let (service, queue) = SyndicastService::open_with_publishers(&config, publishers).await?;
    let policy = RetryPolicy::from(&config.scheduling);

    info!(dry_run = cli.dry_run, "synd-send daemon starting");

    let recovered = queue.requeue_running().await?;
    if recovered > 0 {
        warn!("Recovered {} job(s) left running by a previous run", recovered);
    }

    tokio::spawn(log_events(service.subscribe()));

    if cli.once {
        let (drained, swept) = process_due_posts(&service, &queue, policy).await?;
        println!("queue: {}", summary(&drained));
        println!("sweep: {}", summary(&swept));
        info!("synd-send: processed posts once, exiting");
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let poll_interval = cli.poll_interval.unwrap_or(config.scheduling.poll_interval).max(1);
    info!("Poll interval: {}s", poll_interval);

    run_daemon_loop(&service, &queue, policy, poll_interval, shutdown).await;

    info!("synd-send daemon stopped");
    Ok(())
}

fn dry_run_publishers() -> Publishers {
    Channel::ALL
        .iter()
        .fold(Publishers::new(), |publishers, channel| {
            publishers.with(Arc::new(MockPublisher::success(*channel)))
        })
}

#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    use futures::stream::StreamExt;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Signal setup failed")?;

    tokio::spawn(async move {
        if let Some(signal) = signals.next().await {
            info!(signal, "Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
    Ok(())
}

async fn run_daemon_loop(
    service: &SyndicastService,
    queue: &JobQueue,
    policy: RetryPolicy,
    poll_interval: u64,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("Shutdown requested, stopping daemon loop");
            break;
        }

        if let Err(e) = process_due_posts(service, queue, policy).await {
            error!("Error processing posts: {}", e);
        }

        // Sleep until next poll (check shutdown every second)
        for _ in 0..poll_interval {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }
}

/// Drain the queue, then sweep for due posts it never carried
async fn process_due_posts(
    service: &SyndicastService,
    queue: &JobQueue,
    policy: RetryPolicy,
) -> libsyndicast::Result<(DispatchReport, DispatchReport)> {
    let drained = service
        .dispatcher()
        .drain_queue(queue, policy, Utc::now(), CLAIM_BATCH)
        .await?;
    let swept = service.sweep_due(Utc::now()).await?;

    if drained.found + swept.found > 0 {
        info!(queue = %summary(&drained), sweep = %summary(&swept), "poll complete");
    }
    Ok((drained, swept))
}

fn summary(report: &DispatchReport) -> String {
    format!(
        "found={} published={} failed={} skipped={} errored={}",
        report.found, report.published, report.failed, report.skipped, report.errored
    )
}

async fn log_events(mut events: EventReceiver) {
    loop {
        match events.recv().await {
            Ok(event) => log_event(&event),
            Err(RecvError::Lagged(missed)) => warn!("event log lagged, {} event(s) dropped", missed),
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_event(event: &Event) {
    match event {
        Event::PostPublished {
            article_id,
            index,
            channel,
            platform_post_id,
        } => info!(%article_id, index, %channel, %platform_post_id, "post published"),
        Event::PostFailed {
            article_id,
            index,
            channel,
            error,
        } => warn!(%article_id, index, %channel, %error, "post failed"),
        other => tracing::debug!(article_id = other.article_id(), "{:?}", other),
    }
}
