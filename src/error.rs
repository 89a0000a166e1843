//! Error taxonomy shared by the device layer and the coordinator

use std::io;

use thiserror::Error;

/// Reply status carried back to synchronous mailbox senders.
pub type Status = Result<(), CameraError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CameraError {
    /// Unknown camera id, id already claimed, or the node vanished.
    #[error("camera device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("device configuration failed: {0}")]
    ConfigurationFailed(String),

    /// Buffer allocation failed; partial allocations have been rolled back.
    #[error("buffer allocation failed: {0}")]
    AllocationFailed(String),

    /// The buffer belongs to an earlier session or delivery cycle.
    #[error("stale buffer (slot {slot})")]
    StaleBuffer { slot: usize },

    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// Polling signal: nothing to dequeue right now. Not a failure.
    #[error("no data available yet")]
    NoDataYet,

    #[error("bad value: {0}")]
    BadValue(String),

    #[error("mailbox closed")]
    MailboxClosed,

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl CameraError {
    /// Expected during mode switches; callers drop these silently.
    pub fn is_stale(&self) -> bool {
        matches!(self, CameraError::StaleBuffer { .. })
    }

    pub(crate) fn from_io(context: &str, err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EAGAIN) => CameraError::NoDataYet,
            Some(libc::ENODEV) => CameraError::DeviceUnavailable(format!("{context}: {err}")),
            _ => CameraError::Unknown(format!("{context}: {err}")),
        }
    }
}
