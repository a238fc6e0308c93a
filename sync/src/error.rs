use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchError {
    #[error("Timeout expired")]
    TimeoutExpired,
}

pub type LatchResult<T> = std::result::Result<T, LatchError>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    #[error("Timeout expired")]
    TimeoutExpired,

    #[error("Read lock is no longer held")]
    ReadLockNotHeld,

    #[error("Write lock is no longer held")]
    WriteLockNotHeld,
}

pub type LockResult<T> = std::result::Result<T, LockError>;
