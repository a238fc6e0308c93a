use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use tokio::select;
use triggered::{trigger, Listener, Trigger};

use crate::error::{LatchError, LatchResult};

/// A one-shot countdown latch.
///
/// The latch starts with a fixed count. Tasks calling [`wait`](Self::wait) are suspended until
/// [`count_down`](Self::count_down) has brought the count to zero, at which point all current and
/// future waiters are released. Once open the latch stays open; further countdowns are no-ops and
/// the latch cannot be reset.
pub struct CountDownLatch {
    initial_count: u32,
    count: AtomicU32,
    open_trigger: Trigger,
    open_listener: Listener,
}

impl CountDownLatch {
    /// Creates a latch which opens after `count` countdowns. A latch created with a count of zero
    /// is open from the start.
    pub fn new(count: u32) -> Self {
        let (open_trigger, open_listener) = trigger();
        if count == 0 {
            open_trigger.trigger();
        }
        Self { initial_count: count, count: AtomicU32::new(count), open_trigger, open_listener }
    }

    /// The count this latch was created with.
    pub fn initial_count(&self) -> u32 {
        self.initial_count
    }

    /// The remaining count. Zero means the latch is open.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Decreases the count by one, releasing all waiters when the count reaches zero. Counting
    /// down an open latch is a no-op.
    pub fn count_down(&self) {
        let prev = self.count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        if prev == Ok(1) {
            self.open_trigger.trigger();
        }
    }

    /// Waits until the latch is open. Returns immediately if the count is already zero.
    pub async fn wait(&self) {
        if self.count() == 0 {
            return;
        }
        self.open_listener.clone().await;
    }

    /// Waits until the latch is open or `timeout` elapses, whichever comes first.
    ///
    /// An open latch succeeds immediately regardless of the timeout; a zero timeout on a closed
    /// latch fails immediately.
    pub async fn wait_timeout(&self, timeout: Duration) -> LatchResult<()> {
        if self.count() == 0 {
            return Ok(());
        }
        if timeout.is_zero() {
            return Err(LatchError::TimeoutExpired);
        }
        let open_listener = self.open_listener.clone();
        select! {
            biased;
            _ = open_listener => Ok(()),
            _ = tokio::time::sleep(timeout) => Err(LatchError::TimeoutExpired),
        }
    }
}

impl fmt::Display for CountDownLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CountDownLatch[count={}]", self.count())
    }
}
