//! Notifiers wake subscriptions when new data may be durable.
//!
//! A tick is a coalesced hint, never a delivery: subscribers read the store
//! themselves and decide when they are caught up. Ticks travel over a
//! `tokio::sync::watch` counter, so however many arrive while a subscriber is
//! busy, it observes at most one pending change.
use std::time::Duration;

use sqlx::postgres::PgListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::store::PgReader;
use streamstore::Position;

/// The channel the message-insert trigger notifies on.
pub(crate) const NOTIFY_CHANNEL: &str = "streamstore_messages";

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(500);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// How the store learns that new messages are durable.
#[derive(Debug, Clone)]
pub enum NotifierConfig {
    /// Poll the store head at a fixed interval and tick when it moves.
    Poll { interval: Duration },
    /// `LISTEN` on the notification channel fed by the insert trigger. The
    /// keep-alive probe round-trips through the database to detect a dead
    /// listener connection.
    PgNotify { keep_alive: Duration },
}

impl Default for NotifierConfig {
    fn default() -> Self {
        NotifierConfig::Poll {
            interval: Duration::from_millis(500),
        }
    }
}

impl NotifierConfig {
    pub fn poll() -> Self {
        Self::default()
    }

    pub fn pg_notify() -> Self {
        NotifierConfig::PgNotify {
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// A running notifier task. Created lazily by the store on first subscribe
/// and disposed with it.
pub(crate) struct Notifier {
    ticks: watch::Sender<u64>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Notifier {
    pub(crate) fn start(reader: PgReader, config: NotifierConfig) -> Self {
        let (ticks, _) = watch::channel(0);
        let cancel = CancellationToken::new();
        let task = match config {
            NotifierConfig::Poll { interval } => {
                tokio::spawn(poll_loop(reader, interval, ticks.clone(), cancel.clone()))
            }
            NotifierConfig::PgNotify { keep_alive } => {
                tokio::spawn(listen_loop(reader, keep_alive, ticks.clone(), cancel.clone()))
            }
        };
        Self {
            ticks,
            cancel,
            task,
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.ticks.subscribe()
    }

    /// Stops emitting ticks and releases the notifier's resources.
    pub(crate) async fn dispose(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

fn tick(ticks: &watch::Sender<u64>) {
    ticks.send_modify(|count| *count = count.wrapping_add(1));
}

async fn poll_loop(
    reader: PgReader,
    interval: Duration,
    ticks: watch::Sender<u64>,
    cancel: CancellationToken,
) {
    let mut poll = tokio::time::interval(interval);
    // The head query runs inside the tick arm, so polls never overlap; a poll
    // slower than the interval skips the missed ticks instead of bursting.
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Starting from zero makes the first poll of a non-empty store tick. That
    // covers an append landing between subscribe and the first poll; the
    // spurious wake-up on a quiet store coalesces away.
    let mut last_head = Position::START;
    loop {
        tokio::select! {
            _ = poll.tick() => match reader.read_head_position().await {
                Ok(head) => {
                    if head != last_head {
                        last_head = head;
                        tick(&ticks);
                    }
                }
                Err(err) => tracing::warn!(error = %err, "head poll failed"),
            },
            _ = cancel.cancelled() => return,
        }
    }
}

async fn listen_loop(
    reader: PgReader,
    keep_alive: Duration,
    ticks: watch::Sender<u64>,
    cancel: CancellationToken,
) {
    let mut reconnect_delay = INITIAL_RECONNECT_DELAY;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let mut listener = match PgListener::connect_with(reader.pool()).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::warn!(error = %err, "notify connection failed");
                if !pause(&cancel, reconnect_delay).await {
                    return;
                }
                reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
                continue;
            }
        };
        if let Err(err) = listener.listen(NOTIFY_CHANNEL).await {
            tracing::warn!(error = %err, "LISTEN failed");
            if !pause(&cancel, reconnect_delay).await {
                return;
            }
            reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
            continue;
        }
        reconnect_delay = INITIAL_RECONNECT_DELAY;

        let mut keepalive = tokio::time::interval(keep_alive);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
        keepalive.reset();
        loop {
            tokio::select! {
                notification = listener.recv() => match notification {
                    Ok(_) => tick(&ticks),
                    Err(err) => {
                        tracing::warn!(error = %err, "notify connection lost, reconnecting");
                        break;
                    }
                },
                _ = keepalive.tick() => {
                    // The probe notifies our own channel: a successful
                    // round-trip proves the whole path, and the resulting
                    // self-notification coalesces away like any other tick.
                    if let Err(err) = sqlx::query("SELECT pg_notify($1, '')")
                        .bind(NOTIFY_CHANNEL)
                        .execute(reader.pool())
                        .await
                    {
                        tracing::warn!(error = %err, "notify keep-alive failed");
                    }
                }
                _ = cancel.cancelled() => {
                    let _ = listener.unlisten_all().await;
                    return;
                }
            }
        }
        if !pause(&cancel, reconnect_delay).await {
            return;
        }
        reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
    }
}

async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}
