//! Task coordination primitives for asynchronous services.
//!
//! All primitives keep their waiter queues behind a plain mutex and never suspend while holding
//! it; suspension happens only on the completion a waiter receives when it is enqueued. Timed
//! acquisitions use the runtime's timer and remove their waiter when the deadline passes.

pub mod error;
pub mod latch;
pub mod rwlock;
pub mod semaphore;

pub use error::{LatchError, LatchResult, LockError, LockResult};
pub use latch::CountDownLatch;
pub use rwlock::{ReadHandle, ReadWriteLock, WriteHandle};
pub use semaphore::Semaphore;
