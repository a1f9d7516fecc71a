use super::*;

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use streamstore::BoxDynError;
use tokio::sync::Notify;
use uuid::Uuid;

fn message(version: i64) -> Message {
    Message {
        stream_id: "account-1".into(),
        id: Uuid::new_v4(),
        message_type: "Credited".into(),
        data: serde_json::json!({}),
        metadata: None,
        stream_version: version,
        position: Position::new(version + 1),
        created_at: DateTime::<Utc>::UNIX_EPOCH,
    }
}

/// In-memory source: a growable log indexed by stream version.
struct FakeSource {
    log: Arc<Mutex<Vec<Message>>>,
    fail_next_read: AtomicBool,
}

impl FakeSource {
    fn new(log: Arc<Mutex<Vec<Message>>>) -> Self {
        Self {
            log,
            fail_next_read: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SubscriptionSource for FakeSource {
    async fn start_cursor(&self) -> Result<i64, Error> {
        Ok(self.log.lock().unwrap().len() as i64)
    }

    async fn read_page(
        &self,
        from: i64,
        count: u64,
        _cancel: &CancellationToken,
    ) -> Result<Page, Error> {
        if self.fail_next_read.swap(false, Ordering::SeqCst) {
            return Err(Error::Database(sqlx::Error::PoolClosed));
        }
        let log = self.log.lock().unwrap();
        let from = from.max(0) as usize;
        let messages: Vec<Message> = log.iter().skip(from).take(count as usize).cloned().collect();
        let is_end = from + messages.len() >= log.len();
        Ok(Page { messages, is_end })
    }

    fn cursor_after(&self, message: &Message) -> i64 {
        message.stream_version + 1
    }

    fn describe(&self) -> &str {
        "fake"
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Established,
    CaughtUp,
    Processed(i64),
    Dropped,
}

/// Consumer recording every callback, optionally failing one version.
struct Recorder {
    events: Mutex<Vec<Event>>,
    fail_at: Option<i64>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            fail_at: None,
        })
    }

    fn failing_at(version: i64) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            fail_at: Some(version),
        })
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageConsumer for Recorder {
    async fn process(&self, message: Message) -> Result<(), BoxDynError> {
        if self.fail_at == Some(message.stream_version) {
            return Err("handler rejected the message".into());
        }
        self.events
            .lock()
            .unwrap()
            .push(Event::Processed(message.stream_version));
        Ok(())
    }

    async fn established(&self) {
        self.events.lock().unwrap().push(Event::Established);
    }

    async fn caught_up(&self) {
        self.events.lock().unwrap().push(Event::CaughtUp);
    }

    async fn dropped(&self, _error: BoxDynError) {
        self.events.lock().unwrap().push(Event::Dropped);
    }
}

async fn wait_until(mut predicate: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn spawn_driver(
    source: FakeSource,
    consumer: Arc<dyn MessageConsumer>,
    start_after: Option<i64>,
    ticks: tokio::sync::watch::Receiver<u64>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(source, consumer, start_after, 2, ticks, cancel))
}

#[tokio::test]
async fn it_delivers_the_backlog_in_order_then_reports_caught_up() {
    let log = Arc::new(Mutex::new((0..5).map(message).collect::<Vec<_>>()));
    let consumer = Recorder::new();
    let (_ticks, ticks_rx) = tokio::sync::watch::channel(0);
    let cancel = CancellationToken::new();

    let driver = spawn_driver(
        FakeSource::new(log),
        consumer.clone(),
        Some(-1),
        ticks_rx,
        cancel.clone(),
    );

    wait_until(|| consumer.events().contains(&Event::CaughtUp)).await;
    assert_eq!(
        consumer.events(),
        vec![
            Event::Established,
            Event::Processed(0),
            Event::Processed(1),
            Event::Processed(2),
            Event::Processed(3),
            Event::Processed(4),
            Event::CaughtUp,
        ]
    );

    cancel.cancel();
    driver.await.unwrap();
}

#[tokio::test]
async fn without_a_starting_point_only_future_messages_are_delivered() {
    let log = Arc::new(Mutex::new((0..5).map(message).collect::<Vec<_>>()));
    let consumer = Recorder::new();
    let (ticks, ticks_rx) = tokio::sync::watch::channel(0);
    let cancel = CancellationToken::new();

    let driver = spawn_driver(
        FakeSource::new(log.clone()),
        consumer.clone(),
        None,
        ticks_rx,
        cancel.clone(),
    );

    wait_until(|| consumer.events().contains(&Event::CaughtUp)).await;
    assert_eq!(consumer.events(), vec![Event::Established, Event::CaughtUp]);

    log.lock().unwrap().push(message(5));
    ticks.send_modify(|count| *count += 1);

    wait_until(|| consumer.events().contains(&Event::Processed(5))).await;
    assert_eq!(
        consumer.events(),
        vec![
            Event::Established,
            Event::CaughtUp,
            Event::Processed(5),
            Event::CaughtUp,
        ]
    );

    cancel.cancel();
    driver.await.unwrap();
}

#[tokio::test]
async fn extra_ticks_coalesce_and_never_redeliver() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let consumer = Recorder::new();
    let (ticks, ticks_rx) = tokio::sync::watch::channel(0);
    let cancel = CancellationToken::new();

    let driver = spawn_driver(
        FakeSource::new(log.clone()),
        consumer.clone(),
        None,
        ticks_rx,
        cancel.clone(),
    );
    wait_until(|| consumer.events().contains(&Event::CaughtUp)).await;

    log.lock().unwrap().extend((0..3).map(message));
    for _ in 0..5 {
        ticks.send_modify(|count| *count += 1);
    }

    wait_until(|| consumer.events().contains(&Event::Processed(2))).await;
    // Give any spurious redelivery a chance to happen before asserting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let processed: Vec<_> = consumer
        .events()
        .into_iter()
        .filter(|event| matches!(event, Event::Processed(_)))
        .collect();
    assert_eq!(
        processed,
        vec![Event::Processed(0), Event::Processed(1), Event::Processed(2)]
    );

    cancel.cancel();
    driver.await.unwrap();
}

#[tokio::test]
async fn a_rejected_message_drops_the_subscription() {
    let log = Arc::new(Mutex::new((0..4).map(message).collect::<Vec<_>>()));
    let consumer = Recorder::failing_at(2);
    let (_ticks, ticks_rx) = tokio::sync::watch::channel(0);

    let driver = spawn_driver(
        FakeSource::new(log),
        consumer.clone(),
        Some(-1),
        ticks_rx,
        CancellationToken::new(),
    );
    driver.await.unwrap();

    assert_eq!(
        consumer.events(),
        vec![
            Event::Established,
            Event::Processed(0),
            Event::Processed(1),
            Event::Dropped,
        ]
    );
}

#[tokio::test]
async fn a_transient_read_error_is_retried_not_fatal() {
    let log = Arc::new(Mutex::new((0..2).map(message).collect::<Vec<_>>()));
    let source = FakeSource::new(log);
    source.fail_next_read.store(true, Ordering::SeqCst);
    let consumer = Recorder::new();
    let (_ticks, ticks_rx) = tokio::sync::watch::channel(0);
    let cancel = CancellationToken::new();

    let driver = spawn_driver(source, consumer.clone(), Some(-1), ticks_rx, cancel.clone());

    wait_until(|| consumer.events().contains(&Event::CaughtUp)).await;
    assert_eq!(
        consumer.events(),
        vec![
            Event::Established,
            Event::Processed(0),
            Event::Processed(1),
            Event::CaughtUp,
        ]
    );
    cancel.cancel();
    driver.await.unwrap();
}

/// Consumer that parks inside `process` until released.
struct GatedConsumer {
    entered: AtomicBool,
    release: Notify,
    processed: Mutex<Vec<i64>>,
}

#[async_trait]
impl MessageConsumer for GatedConsumer {
    async fn process(&self, message: Message) -> Result<(), BoxDynError> {
        self.entered.store(true, Ordering::SeqCst);
        self.release.notified().await;
        self.processed.lock().unwrap().push(message.stream_version);
        Ok(())
    }
}

#[tokio::test]
async fn disposal_awaits_an_in_flight_delivery_instead_of_cancelling_it() {
    let log = Arc::new(Mutex::new(vec![message(0)]));
    let consumer = Arc::new(GatedConsumer {
        entered: AtomicBool::new(false),
        release: Notify::new(),
        processed: Mutex::new(Vec::new()),
    });
    let (_ticks, ticks_rx) = tokio::sync::watch::channel(0);
    let cancel = CancellationToken::new();

    let driver = spawn_driver(
        FakeSource::new(log),
        consumer.clone(),
        Some(-1),
        ticks_rx,
        cancel.clone(),
    );

    wait_until(|| consumer.entered.load(Ordering::SeqCst)).await;
    cancel.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        !driver.is_finished(),
        "the driver must wait for the in-flight delivery"
    );

    consumer.release.notify_one();
    tokio::time::timeout(Duration::from_secs(5), driver)
        .await
        .expect("driver should stop once the delivery completes")
        .unwrap();
    assert_eq!(*consumer.processed.lock().unwrap(), vec![0]);
}
