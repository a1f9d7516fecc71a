//! Write latch coordinating in-flight appends with disposal.
//!
//! Any number of writers may hold the latch at once; it is not a mutex. The
//! disposer calls [`WriteLatch::wait`] after flipping the disposing flag, so
//! every write that entered before the flag flipped drains before the pool is
//! closed. Exits happen through the RAII guard so the count is decremented on
//! every path, including errors and retry exhaustion.
use tokio::sync::watch;

pub(crate) struct WriteLatch {
    writers: watch::Sender<usize>,
}

impl WriteLatch {
    pub(crate) fn new() -> Self {
        let (writers, _) = watch::channel(0);
        Self { writers }
    }

    /// Enters a write section. Never blocks.
    pub(crate) fn enter(&self) -> WriteGuard<'_> {
        self.writers.send_modify(|count| *count += 1);
        WriteGuard { latch: self }
    }

    /// Waits until every currently-entered write section has exited.
    pub(crate) async fn wait(&self) {
        let mut writers = self.writers.subscribe();
        // The sender lives in self, so wait_for cannot fail.
        let _ = writers.wait_for(|count| *count == 0).await;
    }
}

pub(crate) struct WriteGuard<'a> {
    latch: &'a WriteLatch,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.latch.writers.send_modify(|count| *count -= 1);
    }
}
