//! Gap detection for forward all-stream reads.
//!
//! Global positions come from a sequence, and sequence values survive
//! rollbacks, so a forward page can show a hole where a concurrent append has
//! reserved positions but not yet committed. Emitting such a page would let a
//! subscriber observe `p` then `p + 2` while `p + 1` fills in later, breaking
//! position ordering. The reader re-reads the page after a delay to give
//! in-flight transactions time to commit; a hole that survives the reload
//! budget belongs to a rolled-back transaction and is accepted.
use std::future::Future;
use std::time::Duration;

use streamstore::{AllPage, Message};
use tokio_util::sync::CancellationToken;

use crate::Error;

/// How forward all-reads respond to holes in the position sequence.
#[derive(Debug, Clone)]
pub struct GapPolicy {
    /// How long to wait for in-flight transactions before re-reading.
    pub reload_delay: Duration,
    /// How many times to re-read before accepting the gap as permanent.
    pub reload_times: u32,
}

impl Default for GapPolicy {
    fn default() -> Self {
        Self {
            reload_delay: Duration::from_secs(5),
            reload_times: 1,
        }
    }
}

/// Runs `read` until the returned page has no gap or the reload budget is
/// exhausted. Backward reads never come through here.
///
/// A page that is not full cannot hide a committed message behind a hole, so
/// short pages are returned as-is. Cancellation ends the delay early and
/// returns the page already in hand.
pub(crate) async fn read_gapless<F, Fut>(
    read: F,
    count: u64,
    policy: &GapPolicy,
    cancel: &CancellationToken,
) -> Result<AllPage, Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<AllPage, Error>>,
{
    let mut page = read().await?;
    if count == 0 || (page.messages.len() as u64) < count {
        return Ok(page);
    }
    for _ in 0..policy.reload_times {
        let Some(index) = first_gap(&page.messages) else {
            return Ok(page);
        };
        tracing::debug!(
            after = %page.messages[index].position,
            "gap in all-stream page, waiting for in-flight appends"
        );
        tokio::select! {
            _ = tokio::time::sleep(policy.reload_delay) => {}
            _ = cancel.cancelled() => return Ok(page),
        }
        page = read().await?;
    }
    if first_gap(&page.messages).is_some() {
        tracing::debug!("gap still present after reload, accepting it as permanent");
    }
    Ok(page)
}

/// Index of the first adjacent pair whose positions are not consecutive.
fn first_gap(messages: &[Message]) -> Option<usize> {
    messages
        .windows(2)
        .position(|pair| pair[1].position.get() - pair[0].position.get() > 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use streamstore::Position;
    use uuid::Uuid;

    fn message(position: i64) -> Message {
        Message {
            stream_id: "account-1".into(),
            id: Uuid::new_v4(),
            message_type: "Credited".into(),
            data: serde_json::json!({}),
            metadata: None,
            stream_version: 0,
            position: Position::new(position),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    fn page(positions: &[i64]) -> AllPage {
        let messages: Vec<_> = positions.iter().copied().map(message).collect();
        let next_position = messages
            .last()
            .map(|m| m.position.next())
            .unwrap_or(Position::START);
        AllPage {
            messages,
            next_position,
            is_end: false,
        }
    }

    fn positions(page: &AllPage) -> Vec<i64> {
        page.messages.iter().map(|m| m.position.get()).collect()
    }

    struct PageScript {
        pages: Mutex<VecDeque<AllPage>>,
        reads: AtomicUsize,
    }

    impl PageScript {
        fn new(pages: Vec<AllPage>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                reads: AtomicUsize::new(0),
            }
        }

        async fn read(&self) -> Result<AllPage, Error> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.pages.lock().unwrap().pop_front().expect("script ran dry"))
        }
    }

    #[test]
    fn first_gap_finds_the_hole() {
        assert_eq!(first_gap(&page(&[3, 5, 6]).messages), Some(0));
        assert_eq!(first_gap(&page(&[3, 4, 6]).messages), Some(1));
        assert_eq!(first_gap(&page(&[3, 4, 5, 6]).messages), None);
        assert_eq!(first_gap(&page(&[]).messages), None);
        assert_eq!(first_gap(&page(&[7]).messages), None);
    }

    #[tokio::test(start_paused = true)]
    async fn it_reloads_once_and_returns_the_filled_page() {
        let script = PageScript::new(vec![page(&[3, 5, 6]), page(&[3, 4, 5])]);
        let result = read_gapless(
            || script.read(),
            3,
            &GapPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(positions(&result), vec![3, 4, 5]);
        assert_eq!(script.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn a_persistent_gap_is_accepted_after_the_reload_budget() {
        let script = PageScript::new(vec![page(&[3, 5, 6]), page(&[3, 5, 6])]);
        let result = read_gapless(
            || script.read(),
            3,
            &GapPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(positions(&result), vec![3, 5, 6]);
        assert_eq!(script.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn a_short_page_skips_gap_detection() {
        let script = PageScript::new(vec![page(&[3, 6])]);
        let result = read_gapless(
            || script.read(),
            3,
            &GapPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(positions(&result), vec![3, 6]);
        assert_eq!(script.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_full_gapless_page_is_returned_without_reloading() {
        let script = PageScript::new(vec![page(&[3, 4, 5])]);
        let result = read_gapless(
            || script.read(),
            3,
            &GapPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(positions(&result), vec![3, 4, 5]);
        assert_eq!(script.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_returns_the_page_in_hand() {
        let script = PageScript::new(vec![page(&[3, 5, 6])]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = read_gapless(|| script.read(), 3, &GapPolicy::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(positions(&result), vec![3, 5, 6]);
        assert_eq!(script.reads.load(Ordering::SeqCst), 1);
    }
}
