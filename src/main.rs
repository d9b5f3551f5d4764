use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use channel_relay::channels::{MessagingClient, Outgoing, SourceUpdate, TelegramClient, TelegramUpdates};
use channel_relay::config::RelayConfig;
use channel_relay::error::ConfigError;
use channel_relay::relay::{
    AlbumCollector, LaneRouter, Notification, Notifier, Relay, RelayEvent, spawn_flush_task,
};
use channel_relay::rules::{RuleBook, RuleStore};
use channel_relay::store::{Database, LibSqlBackend};
use channel_relay::tracker::DeliveryTracker;
use channel_relay::types::ChatId;

/// Backlog per source lane before submitters wait.
const LANE_CAPACITY: usize = 256;

/// How often history is purged when retention is configured.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env()?;
    let _log_guard = init_tracing(&config);

    eprintln!("📡 Channel Relay v{}", env!("CARGO_PKG_VERSION"));

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Rules ────────────────────────────────────────────────────────────
    let (book, rejected) = match config.rules_path {
        Some(ref path) => {
            let (book, rejected) = RuleBook::load_json(path).await?;
            book.persist(db.as_ref()).await?;
            eprintln!("   Rules: {}", path.display());
            (book, rejected)
        }
        None => {
            eprintln!("   Rules: database");
            RuleBook::load_from_db(db.as_ref()).await?
        }
    };
    for err in &rejected {
        tracing::warn!(error = %err, "Rule rejected");
    }
    tracing::info!(
        rules = book.len().await,
        sources = ?book.sources().await,
        rejected = rejected.len(),
        "Rules loaded"
    );
    if book.is_empty().await {
        tracing::warn!("No forwarding rules configured; nothing will be relayed");
    }
    let rules: Arc<dyn RuleStore> = Arc::new(book);

    // ── Telegram ─────────────────────────────────────────────────────────
    let token = config
        .telegram_token
        .clone()
        .ok_or_else(|| ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".into()))?;
    let telegram = Arc::new(TelegramClient::new(token));
    telegram.health_check().await?;

    // ── Relay ────────────────────────────────────────────────────────────
    let tracker = Arc::new(
        DeliveryTracker::new(Arc::clone(&db)).with_retention(config.history_retention),
    );
    let (notifier, notifications) = Notifier::channel(64, config.notify_interval);
    let client: Arc<dyn MessagingClient> = telegram.clone();
    let relay = Arc::new(
        Relay::new(rules, Arc::clone(&tracker), client, &config).with_notifier(notifier.clone()),
    );
    let router = LaneRouter::new(Arc::clone(&relay), LANE_CAPACITY);

    let _notify_handle = spawn_notification_task(notifications, telegram.clone(), config.notify_chat);
    let _housekeeping_handle = config.history_retention.map(|retention| {
        spawn_housekeeping_task(Arc::clone(&tracker), Arc::clone(&db), retention, notifier)
    });

    // ── Ingestion ────────────────────────────────────────────────────────
    let collector = Arc::new(AlbumCollector::new(config.album_quiet));
    let (album_tx, mut album_rx) = mpsc::channel(64);
    let tick = (config.album_quiet / 4).max(Duration::from_millis(50));
    let flush_handle = spawn_flush_task(Arc::clone(&collector), tick, album_tx);

    let mut updates = TelegramUpdates::new(Arc::clone(&telegram), config.poll_timeout).start();
    eprintln!("   Listening for channel posts. Ctrl-C to stop.\n");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let event = tokio::select! {
            update = updates.next() => match update {
                Some(SourceUpdate::New(msg)) => {
                    collector.push(&msg).await;
                    RelayEvent::New(msg)
                }
                Some(SourceUpdate::Edited(msg)) => {
                    collector.update(&msg).await;
                    RelayEvent::Edit(msg)
                }
                None => break,
            },
            Some(event) = album_rx.recv() => event,
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested");
                break;
            }
        };

        if let Err(e) = router.submit(event).await {
            tracing::error!(error = %e, "Failed to queue event");
            break;
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────────
    flush_handle.abort();
    for album in collector.drain().await {
        if let Err(e) = router.submit(RelayEvent::AlbumComplete(album)).await {
            tracing::warn!(error = %e, "Dropping buffered album on shutdown");
        }
    }
    router.shutdown().await;
    relay.shutdown().await;
    Ok(())
}

/// stderr logging, plus a daily rolling file when `RELAY_LOG_DIR` is set.
///
/// The returned guard flushes the file writer on drop.
fn init_tracing(config: &RelayConfig) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match config.log_dir {
        Some(ref dir) => {
            let appender = tracing_appender::rolling::daily(dir, "relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

/// Deliver operator notifications to the notify chat, or log them.
fn spawn_notification_task(
    mut rx: mpsc::Receiver<Notification>,
    client: Arc<TelegramClient>,
    chat: Option<ChatId>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            let Some(chat) = chat else {
                tracing::warn!(key = %notification.key, "{}", notification.text);
                continue;
            };
            if let Err(e) = client.send(chat, &Outgoing::text(notification.text)).await {
                tracing::warn!(error = %e, key = %notification.key, "Failed to send notification");
            }
        }
    })
}

/// Periodically purge delivery history and expired keys.
fn spawn_housekeeping_task(
    tracker: Arc<DeliveryTracker>,
    db: Arc<dyn Database>,
    retention: Duration,
    notifier: Notifier,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        loop {
            interval.tick().await;

            let cutoff = chrono::Duration::from_std(retention)
                .ok()
                .and_then(|age| Utc::now().checked_sub_signed(age));
            if let Some(cutoff) = cutoff {
                if let Err(e) = tracker.purge_history(cutoff).await {
                    tracing::warn!(error = %e, "History purge failed");
                }
            }
            match db.purge_expired().await {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "Purged expired keys"),
                Err(e) => tracing::warn!(error = %e, "Expired key sweep failed"),
            }
            notifier.prune();
        }
    })
}
