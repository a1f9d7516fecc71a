//! PostgreSQL Stream Store
//!
//! This module provides the PostgreSQL implementation of the
//! [`StreamStore`] trait, plus the live-subscription surface and the store
//! lifecycle. Appends, reads, metadata, and deletion live in the submodules;
//! this file owns the shared state: the connection pool, the write latch, the
//! disposing flag, and the registry of live subscriptions and their notifier.
mod append;
mod metadata;
pub(crate) mod read;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use streamstore::{
    AllPage, AppendResult, ExpectedVersion, MessageConsumer, NewMessage, Position, ReadDirection,
    StreamMetadata, StreamMetadataResult, StreamPage, StreamStore,
};

use crate::gap::GapPolicy;
use crate::latch::{WriteGuard, WriteLatch};
use crate::notifier::{Notifier, NotifierConfig};
use crate::subscription::{
    AllSource, StreamSource, SubscribeToAllOptions, SubscribeToStreamOptions, Subscription,
    SubscriptionSource,
};
use crate::Error;

pub(crate) use read::PgReader;

/// Settings for [`PgStreamStore`].
#[derive(Debug, Clone, Default)]
pub struct PgStreamStoreSettings {
    pub notifier: NotifierConfig,
    pub gap: GapPolicy,
}

impl PgStreamStoreSettings {
    pub fn with_notifier(mut self, notifier: NotifierConfig) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_gap_policy(mut self, gap: GapPolicy) -> Self {
        self.gap = gap;
        self
    }
}

/// PostgreSQL stream store implementation.
#[derive(Clone)]
pub struct PgStreamStore {
    reader: PgReader,
    settings: PgStreamStoreSettings,
    latch: Arc<WriteLatch>,
    disposing: Arc<AtomicBool>,
    shared: Arc<Mutex<Shared>>,
}

struct Shared {
    notifier: Option<Notifier>,
    subscriptions: Vec<Arc<Subscription>>,
}

impl PgStreamStore {
    /// Initializes the database schema and returns a new store.
    ///
    /// # Arguments
    ///
    /// * `pool` - The PostgreSQL connection pool.
    /// * `settings` - Notifier and gap-detection settings.
    pub async fn try_new(pool: PgPool, settings: PgStreamStoreSettings) -> Result<Self, Error> {
        crate::schema::init(&pool).await?;
        Ok(Self::new_uninitialized(pool, settings))
    }

    /// Creates a store over an already-initialized schema.
    ///
    /// Use [`PgStreamStore::try_new`] (or the CLI's `setup` command) to create
    /// the schema first.
    pub fn new_uninitialized(pool: PgPool, settings: PgStreamStoreSettings) -> Self {
        Self {
            reader: PgReader::new(pool, settings.gap.clone()),
            settings,
            latch: Arc::new(WriteLatch::new()),
            disposing: Arc::new(AtomicBool::new(false)),
            shared: Arc::new(Mutex::new(Shared {
                notifier: None,
                subscriptions: Vec::new(),
            })),
        }
    }

    /// Subscribes to the live tail of one stream.
    ///
    /// With `after_version` set, delivery starts at `after_version + 1`;
    /// otherwise only messages appended after the subscription was established
    /// are delivered. Delivery is at-least-once, strictly in stream-version
    /// order.
    pub fn subscribe_to_stream(
        &self,
        stream_id: impl Into<String>,
        consumer: Arc<dyn MessageConsumer>,
        options: SubscribeToStreamOptions,
    ) -> Result<Arc<Subscription>, Error> {
        let source = StreamSource::new(self.reader.clone(), stream_id.into());
        self.spawn_subscription(
            source,
            consumer,
            options.after_version,
            options.max_count_per_read,
        )
    }

    /// Subscribes to the live tail of the all-stream, in position order, with
    /// gap detection applied before delivery.
    pub fn subscribe_to_all(
        &self,
        consumer: Arc<dyn MessageConsumer>,
        options: SubscribeToAllOptions,
    ) -> Result<Arc<Subscription>, Error> {
        let source = AllSource::new(self.reader.clone());
        self.spawn_subscription(
            source,
            consumer,
            options.after_position.map(Position::get),
            options.max_count_per_read,
        )
    }

    fn spawn_subscription<S: SubscriptionSource>(
        &self,
        source: S,
        consumer: Arc<dyn MessageConsumer>,
        start_after: Option<i64>,
        max_count_per_read: u64,
    ) -> Result<Arc<Subscription>, Error> {
        let mut shared = self.shared.lock().unwrap();
        if self.disposing() {
            return Err(Error::Disposed);
        }
        let ticks = shared
            .notifier
            .get_or_insert_with(|| {
                Notifier::start(self.reader.clone(), self.settings.notifier.clone())
            })
            .subscribe();
        let subscription =
            Subscription::spawn(source, consumer, start_after, max_count_per_read, ticks);
        shared.subscriptions.retain(|s| !s.is_finished());
        shared.subscriptions.push(subscription.clone());
        Ok(subscription)
    }

    /// Disposes the store.
    ///
    /// Flips the disposing flag so further writes fail fast, tears down every
    /// tracked subscription in parallel, disposes the notifier, waits for
    /// in-flight writes to drain, and closes the pool. A second call finds
    /// nothing left to tear down and completes.
    pub async fn dispose(&self) {
        self.disposing.store(true, Ordering::SeqCst);
        let (subscriptions, notifier) = {
            let mut shared = self.shared.lock().unwrap();
            (
                std::mem::take(&mut shared.subscriptions),
                shared.notifier.take(),
            )
        };
        futures::future::join_all(subscriptions.iter().map(|s| s.dispose())).await;
        if let Some(notifier) = notifier {
            notifier.dispose().await;
        }
        self.latch.wait().await;
        self.reader.pool().close().await;
    }

    pub(crate) fn disposing(&self) -> bool {
        self.disposing.load(Ordering::SeqCst)
    }

    /// Fails fast when the store is disposing, then enters the write latch.
    /// The flag is checked again after entering: a disposer that has already
    /// drained the latch must not see a new writer slip in behind it.
    pub(crate) fn enter_write(&self) -> Result<WriteGuard<'_>, Error> {
        if self.disposing() {
            return Err(Error::Disposed);
        }
        let guard = self.latch.enter();
        if self.disposing() {
            return Err(Error::Disposed);
        }
        Ok(guard)
    }
}

#[async_trait]
impl StreamStore for PgStreamStore {
    type Error = Error;

    async fn append_to_stream(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        messages: Vec<NewMessage>,
    ) -> Result<AppendResult, Error> {
        self.append(stream_id, expected_version, messages).await
    }

    async fn read_stream(
        &self,
        stream_id: &str,
        from_version: i64,
        count: u64,
        direction: ReadDirection,
    ) -> Result<StreamPage, Error> {
        if stream_id.is_empty() {
            return Err(Error::InvalidParameter("stream_id is required".into()));
        }
        self.reader
            .read_stream(stream_id, from_version, count, direction)
            .await
    }

    async fn read_all(
        &self,
        from_position: Position,
        count: u64,
        direction: ReadDirection,
    ) -> Result<AllPage, Error> {
        self.reader
            .read_all(from_position, count, direction, &CancellationToken::new())
            .await
    }

    async fn read_head_position(&self) -> Result<Position, Error> {
        self.reader.read_head_position().await
    }

    async fn get_stream_metadata(&self, stream_id: &str) -> Result<StreamMetadataResult, Error> {
        self.get_metadata(stream_id).await
    }

    async fn set_stream_metadata(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        metadata: StreamMetadata,
    ) -> Result<i64, Error> {
        self.set_metadata(stream_id, expected_version, metadata)
            .await
    }

    async fn delete_stream(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
    ) -> Result<(), Error> {
        self.delete_stream_with_tombstone(stream_id, expected_version)
            .await
    }

    async fn delete_message(&self, stream_id: &str, message_id: Uuid) -> Result<(), Error> {
        self.delete_single_message(stream_id, message_id).await
    }
}
