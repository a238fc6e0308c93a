//! A concurrent map whose mutations are serialized per key.
//!
//! Mutating operations queue an action on their key and resolve once every earlier action for the
//! same key has completed; snapshot reads never wait. See [`SerialMap`].

pub mod serial;

pub use serial::SerialMap;
