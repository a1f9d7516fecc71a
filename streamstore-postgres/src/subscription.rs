//! Live subscriptions.
//!
//! Each subscription runs one spawned task driving the same state machine:
//!
//! ```text
//!   Initializing → CatchingUp ⇄ Live → Disposed
//!                       ↘
//!                        consumer error → dropped
//! ```
//!
//! Catching up reads pages forward until a page reports the end, then the
//! task blocks on a notifier tick and starts over. The single-stream and
//! all-stream variants differ only in how a cursor is resolved and advanced,
//! which [`SubscriptionSource`] abstracts; delivery order, coalescing,
//! error backoff, and shutdown are shared.
//!
//! Delivery is at-least-once: the cursor advances only after `process`
//! resolves, and disposal awaits an in-flight `process` instead of cancelling
//! it.
#[cfg(test)]
mod tests;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use streamstore::{Message, MessageConsumer, Position, ReadDirection};

use crate::store::PgReader;
use crate::Error;

const INITIAL_READ_BACKOFF: Duration = Duration::from_millis(100);
const MAX_READ_BACKOFF: Duration = Duration::from_secs(5);

/// Options for [`PgStreamStore::subscribe_to_stream`].
///
/// [`PgStreamStore::subscribe_to_stream`]: crate::PgStreamStore::subscribe_to_stream
#[derive(Debug, Clone)]
pub struct SubscribeToStreamOptions {
    /// Deliver messages after this version. Absent means "only future
    /// messages".
    pub after_version: Option<i64>,
    pub max_count_per_read: u64,
}

impl Default for SubscribeToStreamOptions {
    fn default() -> Self {
        Self {
            after_version: None,
            max_count_per_read: 100,
        }
    }
}

impl SubscribeToStreamOptions {
    pub fn after_version(mut self, version: i64) -> Self {
        self.after_version = Some(version);
        self
    }

    pub fn max_count_per_read(mut self, count: u64) -> Self {
        self.max_count_per_read = count;
        self
    }
}

/// Options for [`PgStreamStore::subscribe_to_all`].
///
/// [`PgStreamStore::subscribe_to_all`]: crate::PgStreamStore::subscribe_to_all
#[derive(Debug, Clone)]
pub struct SubscribeToAllOptions {
    /// Deliver messages after this global position. Absent means "only future
    /// messages".
    pub after_position: Option<Position>,
    pub max_count_per_read: u64,
}

impl Default for SubscribeToAllOptions {
    fn default() -> Self {
        Self {
            after_position: None,
            max_count_per_read: 100,
        }
    }
}

impl SubscribeToAllOptions {
    pub fn after_position(mut self, position: Position) -> Self {
        self.after_position = Some(position);
        self
    }

    pub fn max_count_per_read(mut self, count: u64) -> Self {
        self.max_count_per_read = count;
        self
    }
}

/// Handle to a live subscription.
pub struct Subscription {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    pub(crate) fn spawn<S: SubscriptionSource>(
        source: S,
        consumer: Arc<dyn MessageConsumer>,
        start_after: Option<i64>,
        max_count_per_read: u64,
        ticks: watch::Receiver<u64>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            source,
            consumer,
            start_after,
            max_count_per_read.max(1),
            ticks,
            cancel.clone(),
        ));
        Arc::new(Self {
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Cancels the subscription and waits for its task to stop. Any wait the
    /// task is parked in ends immediately; an in-flight `process` call is
    /// awaited, not cancelled.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task
            .lock()
            .unwrap()
            .as_ref()
            .map_or(true, |task| task.is_finished())
    }
}

/// A page handed to the subscription driver.
pub(crate) struct Page {
    pub messages: Vec<Message>,
    pub is_end: bool,
}

/// What a subscription tails: a single stream or the all-stream.
#[async_trait]
pub(crate) trait SubscriptionSource: Send + Sync + 'static {
    /// Cursor pointing just past the current head, used when the subscriber
    /// wants only future messages.
    async fn start_cursor(&self) -> Result<i64, Error>;

    async fn read_page(
        &self,
        from: i64,
        count: u64,
        cancel: &CancellationToken,
    ) -> Result<Page, Error>;

    /// The cursor to resume from once `message` has been delivered.
    fn cursor_after(&self, message: &Message) -> i64;

    fn describe(&self) -> &str;
}

pub(crate) struct StreamSource {
    reader: PgReader,
    stream_id: String,
}

impl StreamSource {
    pub(crate) fn new(reader: PgReader, stream_id: String) -> Self {
        Self { reader, stream_id }
    }
}

#[async_trait]
impl SubscriptionSource for StreamSource {
    async fn start_cursor(&self) -> Result<i64, Error> {
        let head = self
            .reader
            .stream_info(&self.stream_id)
            .await?
            .map(|info| info.version)
            .unwrap_or(-1);
        Ok(head + 1)
    }

    async fn read_page(
        &self,
        from: i64,
        count: u64,
        _cancel: &CancellationToken,
    ) -> Result<Page, Error> {
        let page = self
            .reader
            .read_stream(&self.stream_id, from, count, ReadDirection::Forward)
            .await?;
        Ok(Page {
            messages: page.messages,
            is_end: page.is_end,
        })
    }

    fn cursor_after(&self, message: &Message) -> i64 {
        message.stream_version + 1
    }

    fn describe(&self) -> &str {
        &self.stream_id
    }
}

pub(crate) struct AllSource {
    reader: PgReader,
}

impl AllSource {
    pub(crate) fn new(reader: PgReader) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl SubscriptionSource for AllSource {
    async fn start_cursor(&self) -> Result<i64, Error> {
        Ok(self.reader.read_head_position().await?.get() + 1)
    }

    async fn read_page(
        &self,
        from: i64,
        count: u64,
        cancel: &CancellationToken,
    ) -> Result<Page, Error> {
        let page = self
            .reader
            .read_all(Position::new(from), count, ReadDirection::Forward, cancel)
            .await?;
        Ok(Page {
            messages: page.messages,
            is_end: page.is_end,
        })
    }

    fn cursor_after(&self, message: &Message) -> i64 {
        message.position.get() + 1
    }

    fn describe(&self) -> &str {
        "$all"
    }
}

async fn run<S: SubscriptionSource>(
    source: S,
    consumer: Arc<dyn MessageConsumer>,
    start_after: Option<i64>,
    max_count_per_read: u64,
    mut ticks: watch::Receiver<u64>,
    cancel: CancellationToken,
) {
    let mut backoff = ReadBackoff::new();
    let mut next = match start_after {
        Some(after) => after + 1,
        None => loop {
            let start = tokio::select! {
                result = source.start_cursor() => result,
                _ = cancel.cancelled() => return,
            };
            match start {
                Ok(cursor) => break cursor,
                Err(err) => {
                    tracing::warn!(
                        subscription = source.describe(),
                        error = %err,
                        "failed to resolve subscription start"
                    );
                    if !backoff.pause(&cancel).await {
                        return;
                    }
                }
            }
        },
    };
    consumer.established().await;

    let mut caught_up = false;
    loop {
        let page = tokio::select! {
            result = source.read_page(next, max_count_per_read, &cancel) => result,
            _ = cancel.cancelled() => break,
        };
        let page = match page {
            Ok(page) => {
                backoff.reset();
                page
            }
            Err(err) => {
                tracing::warn!(
                    subscription = source.describe(),
                    error = %err,
                    "subscription read failed"
                );
                if !backoff.pause(&cancel).await {
                    break;
                }
                continue;
            }
        };

        for message in page.messages {
            if cancel.is_cancelled() {
                return;
            }
            let cursor = source.cursor_after(&message);
            if let Err(err) = consumer.process(message).await {
                tracing::error!(
                    subscription = source.describe(),
                    error = %err,
                    "consumer rejected message, dropping subscription"
                );
                consumer.dropped(err).await;
                return;
            }
            next = cursor;
        }

        if page.is_end {
            if !caught_up {
                caught_up = true;
                consumer.caught_up().await;
            }
            tokio::select! {
                changed = ticks.changed() => {
                    // The notifier is only torn down after the subscriptions,
                    // so a closed channel means the store is going away.
                    if changed.is_err() {
                        break;
                    }
                    caught_up = false;
                }
                _ = cancel.cancelled() => break,
            }
        }
    }
    tracing::debug!(subscription = source.describe(), "subscription stopped");
}

/// Backoff between failed reads. Transient storage errors never drop a
/// subscription; it keeps retrying until disposed.
struct ReadBackoff {
    delay: Duration,
}

impl ReadBackoff {
    fn new() -> Self {
        Self {
            delay: INITIAL_READ_BACKOFF,
        }
    }

    fn reset(&mut self) {
        self.delay = INITIAL_READ_BACKOFF;
    }

    /// Sleeps for the current delay, doubling it up to the cap. Returns false
    /// when the sleep was cut short by cancellation.
    async fn pause(&mut self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {
                self.delay = (self.delay * 2).min(MAX_READ_BACKOFF);
                true
            }
            _ = cancel.cancelled() => false,
        }
    }
}
