//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the daemon reports one of these variants.
//! The PnP controller inspects the variant (not the message) to decide
//! whether to retry, blacklist-forever, or propagate a fatal startup error;
//! see [`Error::is_retryable`] and [`Error::is_permanent`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A config or quirks file contained an invalid option value.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Another instance already holds the process-wide lock file.
    #[error("another ipp-usb instance is already running")]
    LockBusy,

    /// Device matched a `blacklist = true` quirk rule.
    #[error("device is blacklisted: {0}")]
    Blacklisted(String),

    /// Device has neither a usable print path nor a usable scan path.
    #[error("device is unusable (no print or scan capability)")]
    Unusable,

    /// Device initialization exceeded `init-timeout`.
    #[error("device initialization timed out after {0:?}")]
    InitTimedOut(std::time::Duration),

    /// Some init probes failed, others succeeded.
    #[error("device initialization partially completed: {0}")]
    PartialInit(String),

    /// A USB I/O operation (libusb) failed.
    #[error("USB I/O error: {0}")]
    Io(String),

    /// The caller's context was cancelled before the operation completed.
    #[error("operation canceled")]
    Canceled,

    /// A per-request or per-connection deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Control socket or state-directory permissions are wrong.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The transport (or the whole daemon) is being torn down.
    #[error("shut down")]
    Shutdown,

    /// A malformed or unparsable HTTP response arrived from the device.
    #[error("malformed response from device: {0}")]
    BadResponse(String),

    /// Passthrough for std::io::Error not otherwise classified above.
    #[error(transparent)]
    StdIo(#[from] std::io::Error),

    #[error(transparent)]
    Usb(#[from] rusb::Error),
}

impl Error {
    /// `true` for errors the PnP controller should retry after `DevInitRetryInterval`.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Blacklisted(_) | Error::Unusable)
    }

    /// `true` for errors that should never be retried (PnP "remember forever" path).
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::Blacklisted(_) | Error::Unusable)
    }

    /// Whether a retry attempt following this error must force a hard reset
    /// before reopening the transport.
    pub fn requires_reset_before_retry(&self) -> bool {
        matches!(self, Error::InitTimedOut(_) | Error::DeadlineExceeded)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
