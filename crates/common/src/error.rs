//! Shared error type for the sync/async thread bridge.
//!
//! This stays small on purpose: it only covers the channel-bridge plumbing in
//! [`crate::channel`]. The daemon's full error taxonomy (blacklist, timeout,
//! partial-init, ...) lives in the `ipp-usb` crate's `error` module, which is
//! the boundary the rest of the daemon actually reasons about.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("channel error: {0}")]
    Channel(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
