use std::{collections::VecDeque, fmt, time::Duration};

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// An asynchronous counting semaphore with batched acquisition.
///
/// Acquirers request a number of permits and are suspended until the pool can cover the request.
/// Waiters are visited in FIFO order on every release, but selection is "first that fits": a
/// waiter requesting a large batch does not hold up smaller requests queued behind it when enough
/// permits are available for them.
///
/// Dropping a pending [`acquire`](Self::acquire) future removes its waiter from the queue; a grant
/// that raced the drop is returned to the pool, so permits are never leaked to an abandoned
/// acquisition.
#[derive(Debug)]
pub struct Semaphore {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    available: usize,
    next_id: u64,
    waiters: VecDeque<Waiter>,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    permits: usize,
    tx: oneshot::Sender<()>,
}

impl State {
    fn enqueue(&mut self, permits: usize) -> (u64, oneshot::Receiver<()>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(Waiter { id, permits, tx });
        (id, rx)
    }

    /// Removes the waiter with the given id. Returns false when the waiter already left the queue,
    /// i.e. its grant was already delivered.
    fn remove(&mut self, id: u64) -> bool {
        if let Some(pos) = self.waiters.iter().position(|w| w.id == id) {
            self.waiters.remove(pos);
            true
        } else {
            false
        }
    }

    /// Single FIFO pass over the queue, completing every waiter the current pool can cover.
    fn drain(&mut self) {
        if self.waiters.is_empty() {
            return;
        }
        let mut remaining = VecDeque::with_capacity(self.waiters.len());
        while let Some(waiter) = self.waiters.pop_front() {
            if self.available >= waiter.permits {
                self.available -= waiter.permits;
                let permits = waiter.permits;
                if waiter.tx.send(()).is_err() {
                    // The acquirer vanished before its grant; keep the permits in the pool.
                    self.available += permits;
                }
            } else {
                remaining.push_back(waiter);
            }
        }
        self.waiters = remaining;
    }
}

/// Queue bookkeeping for one pending acquisition. Armed until the acquisition resolves; dropping
/// an armed entry either removes the waiter or, when the grant already landed, hands the permits
/// back and re-runs the drain.
struct WaiterEntry<'a> {
    semaphore: &'a Semaphore,
    id: u64,
    permits: usize,
    armed: bool,
}

impl<'a> WaiterEntry<'a> {
    fn new(semaphore: &'a Semaphore, id: u64, permits: usize) -> Self {
        Self { semaphore, id, permits, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for WaiterEntry<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.semaphore.state.lock();
        if state.remove(self.id) {
            return;
        }
        state.available += self.permits;
        state.drain();
    }
}

impl Semaphore {
    /// Creates a semaphore with the given number of initially available permits.
    pub fn new(available_permits: usize) -> Self {
        Self { state: Mutex::new(State { available: available_permits, next_id: 0, waiters: VecDeque::new() }) }
    }

    /// Acquires `permits` permits, waiting until the pool can cover the request.
    pub async fn acquire(&self, permits: usize) {
        let (rx, entry) = {
            let mut state = self.state.lock();
            if state.available >= permits {
                state.available -= permits;
                return;
            }
            let (id, rx) = state.enqueue(permits);
            (rx, WaiterEntry::new(self, id, permits))
        };
        #[cfg(feature = "wait-trace")]
        let start = std::time::Instant::now();
        // The queue never drops a sender without delivering the grant, so an error here is
        // equivalent to a grant.
        let _ = rx.await;
        entry.disarm();
        #[cfg(feature = "wait-trace")]
        log::trace!("Semaphore: acquire of {} permits waited {:?}", permits, start.elapsed());
    }

    /// Attempts to acquire `permits` permits without waiting. Returns whether the permits were
    /// acquired.
    pub fn try_acquire(&self, permits: usize) -> bool {
        let mut state = self.state.lock();
        if state.available >= permits {
            state.available -= permits;
            true
        } else {
            false
        }
    }

    /// Attempts to acquire `permits` permits, waiting at most `timeout`. Returns whether the
    /// permits were acquired. A zero timeout makes this equivalent to [`try_acquire`](Self::try_acquire).
    pub async fn try_acquire_for(&self, permits: usize, timeout: Duration) -> bool {
        let (rx, entry) = {
            let mut state = self.state.lock();
            if state.available >= permits {
                state.available -= permits;
                return true;
            }
            if timeout.is_zero() {
                return false;
            }
            let (id, rx) = state.enqueue(permits);
            (rx, WaiterEntry::new(self, id, permits))
        };
        #[cfg(feature = "wait-trace")]
        let start = std::time::Instant::now();
        let mut rx = rx;
        let acquired = tokio::select! {
            biased;
            _ = &mut rx => true,
            _ = tokio::time::sleep(timeout) => {
                // The timer won the race; if the waiter already left the queue its grant landed
                // first and the acquisition stands.
                !self.state.lock().remove(entry.id)
            }
        };
        entry.disarm();
        #[cfg(feature = "wait-trace")]
        log::trace!("Semaphore: timed acquire of {} permits waited {:?} (acquired: {})", permits, start.elapsed(), acquired);
        acquired
    }

    /// Returns `permits` permits to the pool and completes every waiter the new pool can cover, in
    /// FIFO visiting order.
    pub fn release(&self, permits: usize) {
        let mut state = self.state.lock();
        state.available += permits;
        state.drain();
    }

    /// Removes all available permits from the pool and returns how many were removed. Waiters are
    /// left untouched; they could not have been satisfied by the drained pool.
    pub fn drain_permits(&self) -> usize {
        std::mem::take(&mut self.state.lock().available)
    }

    /// The number of currently available permits.
    pub fn available_permits(&self) -> usize {
        self.state.lock().available
    }

    /// Whether any acquirers are waiting for permits.
    pub fn has_waiting_acquirers(&self) -> bool {
        !self.state.lock().waiters.is_empty()
    }

    /// The number of acquirers waiting for permits.
    pub fn waiting_acquirer_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

impl fmt::Display for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Semaphore[permits={}]", self.available_permits())
    }
}
