use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{LockError, LockResult};

/// A multi-reader/single-writer lock with an explicit waiter queue and a choice of fairness
/// policy.
///
/// In fair mode (the default) a new reader is queued behind any waiter, so queued writers cannot
/// be starved by a steady stream of readers. In non-fair mode a new reader is admitted immediately
/// whenever readers are active, regardless of queued writers.
///
/// Locks are represented by owned handles. A [`ReadHandle`] can be upgraded to a write lock and a
/// [`WriteHandle`] downgraded to a read lock directly, without going through a full release/
/// acquire cycle from the caller's perspective. Handles release their lock when dropped.
#[derive(Debug)]
pub struct ReadWriteLock {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum WaiterKind {
    Read,
    Write,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    kind: WaiterKind,
    tx: oneshot::Sender<()>,
}

#[derive(Debug)]
struct State {
    fair: bool,
    readers: u32,
    writer: bool,
    next_id: u64,
    waiters: VecDeque<Waiter>,
}

impl State {
    fn new(fair: bool) -> Self {
        Self { fair, readers: 0, writer: false, next_id: 0, waiters: VecDeque::new() }
    }

    fn can_read(&self) -> bool {
        if self.writer {
            return false;
        }
        if self.fair && !self.waiters.is_empty() {
            return false;
        }
        if self.readers > 0 {
            // Uncontended, or the non-fair reader bypass
            return true;
        }
        self.waiters.is_empty()
    }

    fn can_write(&self) -> bool {
        self.readers == 0 && !self.writer
    }

    fn enqueue(&mut self, kind: WaiterKind) -> (u64, oneshot::Receiver<()>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(Waiter { id, kind, tx });
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

    fn release_read(&mut self) {
        self.readers -= 1;
        if self.readers == 0 && !self.writer {
            self.wake_next();
        }
    }

    fn release_write(&mut self) {
        self.writer = false;
        self.wake_next();
    }

    /// Activates the head of the waiter queue once both counts dropped to zero. A write waiter
    /// takes the lock exclusively; a read waiter is activated together with further read waiters
    /// per the fairness policy.
    fn wake_next(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.kind {
                WaiterKind::Write => {
                    self.writer = true;
                    if waiter.tx.send(()).is_ok() {
                        return;
                    }
                    self.writer = false;
                }
                WaiterKind::Read => {
                    self.readers += 1;
                    if waiter.tx.send(()).is_err() {
                        self.readers -= 1;
                        continue;
                    }
                    self.wake_readers();
                    return;
                }
            }
        }
    }

    /// The read-wake sub-policy. Fair: activate consecutive read waiters from the head of the
    /// queue, stopping at the first write waiter. Non-fair: activate every queued read waiter,
    /// leaving write waiters in order.
    fn wake_readers(&mut self) {
        if self.fair {
            while self.waiters.front().is_some_and(|w| w.kind == WaiterKind::Read) {
                if let Some(waiter) = self.waiters.pop_front() {
                    self.readers += 1;
                    if waiter.tx.send(()).is_err() {
                        self.readers -= 1;
                    }
                }
            }
        } else {
            let mut remaining = VecDeque::with_capacity(self.waiters.len());
            while let Some(waiter) = self.waiters.pop_front() {
                match waiter.kind {
                    WaiterKind::Read => {
                        self.readers += 1;
                        if waiter.tx.send(()).is_err() {
                            self.readers -= 1;
                        }
                    }
                    WaiterKind::Write => remaining.push_back(waiter),
                }
            }
            self.waiters = remaining;
        }
    }
}

/// Queue bookkeeping for one pending acquisition. Armed until the acquisition resolves; dropping
/// an armed entry either removes the waiter or, when the grant already landed, releases the lock
/// it delivered.
struct LockEntry {
    state: Arc<Mutex<State>>,
    id: u64,
    kind: WaiterKind,
    armed: bool,
}

impl LockEntry {
    fn new(state: &Arc<Mutex<State>>, id: u64, kind: WaiterKind) -> Self {
        Self { state: state.clone(), id, kind, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LockEntry {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.state.lock();
        if state.remove(self.id) {
            return;
        }
        match self.kind {
            WaiterKind::Read => state.release_read(),
            WaiterKind::Write => state.release_write(),
        }
    }
}

/// Waits for a grant with a deadline. On timeout the waiter is removed from the queue; a grant
/// that landed before the removal wins the race and the acquisition stands.
async fn wait_turn(mut rx: oneshot::Receiver<()>, entry: LockEntry, timeout: Duration) -> LockResult<()> {
    let granted = tokio::select! {
        biased;
        _ = &mut rx => true,
        _ = tokio::time::sleep(timeout) => !entry.state.lock().remove(entry.id),
    };
    entry.disarm();
    if granted {
        Ok(())
    } else {
        Err(LockError::TimeoutExpired)
    }
}

impl ReadWriteLock {
    /// Creates a lock with the fair admission policy: new readers queue behind any waiting writer.
    pub fn fair() -> Self {
        Self { state: Arc::new(Mutex::new(State::new(true))) }
    }

    /// Creates a lock with the non-fair admission policy: new readers are admitted immediately
    /// while readers are active, even when writers are waiting.
    pub fn non_fair() -> Self {
        Self { state: Arc::new(Mutex::new(State::new(false))) }
    }

    fn read_handle(&self) -> ReadHandle {
        ReadHandle { state: self.state.clone(), held: true }
    }

    fn write_handle(&self) -> WriteHandle {
        WriteHandle { state: self.state.clone(), held: true }
    }

    /// Acquires a read lock, waiting as long as it takes.
    pub async fn read(&self) -> ReadHandle {
        let (rx, entry) = {
            let mut state = self.state.lock();
            if state.can_read() {
                state.readers += 1;
                return self.read_handle();
            }
            let (id, rx) = state.enqueue(WaiterKind::Read);
            (rx, LockEntry::new(&self.state, id, WaiterKind::Read))
        };
        let _ = rx.await;
        entry.disarm();
        self.read_handle()
    }

    /// Acquires a read lock, waiting at most `timeout`. A zero timeout fails immediately unless
    /// the lock can be granted on the spot.
    pub async fn read_timeout(&self, timeout: Duration) -> LockResult<ReadHandle> {
        let (rx, entry) = {
            let mut state = self.state.lock();
            if state.can_read() {
                state.readers += 1;
                return Ok(self.read_handle());
            }
            if timeout.is_zero() {
                return Err(LockError::TimeoutExpired);
            }
            let (id, rx) = state.enqueue(WaiterKind::Read);
            (rx, LockEntry::new(&self.state, id, WaiterKind::Read))
        };
        wait_turn(rx, entry, timeout).await?;
        Ok(self.read_handle())
    }

    /// Acquires the write lock, waiting as long as it takes.
    pub async fn write(&self) -> WriteHandle {
        let (rx, entry) = {
            let mut state = self.state.lock();
            if state.can_write() {
                state.writer = true;
                return self.write_handle();
            }
            let (id, rx) = state.enqueue(WaiterKind::Write);
            (rx, LockEntry::new(&self.state, id, WaiterKind::Write))
        };
        let _ = rx.await;
        entry.disarm();
        self.write_handle()
    }

    /// Acquires the write lock, waiting at most `timeout`. A zero timeout fails immediately unless
    /// the lock can be granted on the spot.
    pub async fn write_timeout(&self, timeout: Duration) -> LockResult<WriteHandle> {
        let (rx, entry) = {
            let mut state = self.state.lock();
            if state.can_write() {
                state.writer = true;
                return Ok(self.write_handle());
            }
            if timeout.is_zero() {
                return Err(LockError::TimeoutExpired);
            }
            let (id, rx) = state.enqueue(WaiterKind::Write);
            (rx, LockEntry::new(&self.state, id, WaiterKind::Write))
        };
        wait_turn(rx, entry, timeout).await?;
        Ok(self.write_handle())
    }

    /// Whether any read locks are currently held.
    pub fn is_read_held(&self) -> bool {
        self.state.lock().readers > 0
    }

    /// Whether the write lock is currently held.
    pub fn is_write_held(&self) -> bool {
        self.state.lock().writer
    }

    /// The number of currently held read locks.
    pub fn current_read_count(&self) -> u32 {
        self.state.lock().readers
    }

    /// The number of queued read acquisitions.
    pub fn waiting_read_count(&self) -> usize {
        self.state.lock().waiters.iter().filter(|w| w.kind == WaiterKind::Read).count()
    }

    /// The number of queued write acquisitions.
    pub fn waiting_write_count(&self) -> usize {
        self.state.lock().waiters.iter().filter(|w| w.kind == WaiterKind::Write).count()
    }
}

impl Default for ReadWriteLock {
    fn default() -> Self {
        Self::fair()
    }
}

impl fmt::Display for ReadWriteLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        write!(f, "ReadWriteLock[write lock={}, read locks={}]", state.writer, state.readers)
    }
}

enum UpgradeStart {
    Granted(WriteHandle),
    Waiting(oneshot::Receiver<()>, LockEntry),
}

/// A held read lock. The lock is released when the handle is dropped, when
/// [`release`](Self::release) is called, or as the first step of an upgrade.
#[derive(Debug)]
pub struct ReadHandle {
    state: Arc<Mutex<State>>,
    held: bool,
}

impl ReadHandle {
    /// Whether this handle still holds its read lock.
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Releases the read lock held by this handle.
    pub fn release(&mut self) -> LockResult<()> {
        if !self.held {
            return Err(LockError::ReadLockNotHeld);
        }
        self.held = false;
        self.state.lock().release_read();
        Ok(())
    }

    /// Upgrades this read lock to a write lock, waiting as long as it takes.
    ///
    /// The read lock is released synchronously before the write acquisition starts, so concurrent
    /// upgraders race for the write slot like ordinary writers; callers must not assume the state
    /// they observed under the read lock survived the transition.
    pub async fn upgrade_to_write(self) -> LockResult<WriteHandle> {
        match self.begin_upgrade(false)? {
            UpgradeStart::Granted(handle) => Ok(handle),
            UpgradeStart::Waiting(rx, entry) => {
                let shared = entry.state.clone();
                let _ = rx.await;
                entry.disarm();
                Ok(WriteHandle { state: shared, held: true })
            }
        }
    }

    /// Upgrades this read lock to a write lock, waiting at most `timeout`.
    ///
    /// The read lock is released up front in all cases; on timeout it is *not* restored and the
    /// caller holds nothing.
    pub async fn upgrade_to_write_timeout(self, timeout: Duration) -> LockResult<WriteHandle> {
        match self.begin_upgrade(timeout.is_zero())? {
            UpgradeStart::Granted(handle) => Ok(handle),
            UpgradeStart::Waiting(rx, entry) => {
                let shared = entry.state.clone();
                wait_turn(rx, entry, timeout).await?;
                Ok(WriteHandle { state: shared, held: true })
            }
        }
    }

    /// Releases the read lock and either grabs the write slot on the spot or queues a write
    /// acquisition, all in one critical section.
    fn begin_upgrade(mut self, zero_timeout: bool) -> LockResult<UpgradeStart> {
        if !self.held {
            return Err(LockError::ReadLockNotHeld);
        }
        self.held = false;
        let shared = self.state.clone();
        let mut state = shared.lock();
        state.release_read();
        if state.can_write() {
            state.writer = true;
            drop(state);
            return Ok(UpgradeStart::Granted(WriteHandle { state: shared, held: true }));
        }
        if zero_timeout {
            return Err(LockError::TimeoutExpired);
        }
        let (id, rx) = state.enqueue(WaiterKind::Write);
        drop(state);
        Ok(UpgradeStart::Waiting(rx, LockEntry::new(&shared, id, WaiterKind::Write)))
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        if self.held {
            self.state.lock().release_read();
        }
    }
}

impl fmt::Display for ReadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReadLock[held={}]", self.held)
    }
}

/// A held write lock. The lock is released when the handle is dropped, when
/// [`release`](Self::release) is called, or by downgrading to a read lock.
#[derive(Debug)]
pub struct WriteHandle {
    state: Arc<Mutex<State>>,
    held: bool,
}

impl WriteHandle {
    /// Whether this handle still holds the write lock.
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Releases the write lock held by this handle.
    pub fn release(&mut self) -> LockResult<()> {
        if !self.held {
            return Err(LockError::WriteLockNotHeld);
        }
        self.held = false;
        self.state.lock().release_write();
        Ok(())
    }

    /// Atomically trades the write lock for a read lock. Queued read waiters are activated per the
    /// fairness policy and proceed in parallel with the downgraded reader; queued writers keep
    /// waiting until all those read locks are released.
    pub fn downgrade_to_read(mut self) -> LockResult<ReadHandle> {
        if !self.held {
            return Err(LockError::WriteLockNotHeld);
        }
        self.held = false;
        let shared = self.state.clone();
        {
            let mut state = shared.lock();
            state.writer = false;
            state.readers = 1;
            state.wake_readers();
        }
        Ok(ReadHandle { state: shared, held: true })
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if self.held {
            self.state.lock().release_write();
        }
    }
}

impl fmt::Display for WriteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WriteLock[held={}]", self.held)
    }
}
