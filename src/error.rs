//! ## USBTMC Errors
//!
//! The error taxonomy surfaced by the public façade, plus the
//! narrower discovery-time errors the teacher's `init.rs` already raised.
//! Callers should match on the variant, not the message text.
//!

#[allow(unused)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // -- spec.md §7 error kinds -----------------------------------------
    /// No device matches the selector passed to `open`.
    #[error("no device matches the given selector")]
    NotFound,

    /// The OS refused to open the device or claim its interface.
    #[error("access denied: {0}")]
    AccessDenied(rusb::Error),

    /// Device descriptors do not expose a USBTMC interface.
    #[error("device does not expose a USBTMC interface")]
    NotUsbtmc,

    /// The handle already has a live operation of the requested kind.
    #[error("handle is busy with another operation")]
    Busy,

    /// A transfer did not complete within the handle's timeout.
    #[error("I/O operation timed out")]
    IoTimeout,

    /// A header mismatch, bTag mismatch after retry, or nonzero reserved bytes.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A class request returned `STATUS_FAILED` (or exhausted its PENDING budget).
    #[error("device reported status FAILED for {0}")]
    DeviceStatusFailed(&'static str),

    /// An operation was attempted while the handle is in the `Halted` state.
    #[error("handle is halted; call clear() before retrying")]
    Halted,

    /// Caller cancellation completed before the operation finished.
    #[error("operation was cancelled")]
    Cancelled,

    /// The operation requires a capability the device does not advertise.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    // -- discovery-time errors (teacher's init.rs), retained verbatim ---
    #[error("specified configuration not found")]
    ConfigurationNotFound,
    #[error("specified interface not found")]
    InterfaceNotFound,
    #[error("specified interface setting not found")]
    InterfaceSettingNotFound,
    #[error("bulk out endpoint not found")]
    BulkOutEndpointNotFound,
    #[error("bulk in endpoint not found")]
    BulkInEndpointNotFound,
    #[error("used incorrect endpoint")]
    IncorrectEndpoint,

    // -- wire-level passthrough ------------------------------------------
    /// A raw transport-level error that doesn't map to a more specific kind above.
    #[error("USB transport error: {0}")]
    Transport(#[from] rusb::Error),

    /// Response bytes were not valid UTF-8 where a string was requested.
    #[error("response was not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

impl Error {
    /// spec.md §7: "Fatal kinds: `NotUsbtmc`, `Halted` after failed clear."
    /// This only recognizes the unconditional case; a `Halted` instance is
    /// fatal once the caller's own `clear()` retry has also failed, which
    /// the caller is in the best position to track.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::NotUsbtmc)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
