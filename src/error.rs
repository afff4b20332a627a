//! Error types for the check-in core.

/// Top-level error type for the check-in tracking system.
#[derive(Debug, thiserror::Error)]
pub enum VigilError {
    /// Timezone identifier is not a recognized IANA zone.
    #[error("unknown timezone: {0}")]
    InvalidTimezone(String),

    /// SQLite storage error (including write conflicts).
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The store mutex was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    LockPoisoned,

    /// Referenced user does not exist.
    #[error("unknown user: {0}")]
    UnknownUser(i64),

    /// Referenced trusted contact does not exist.
    #[error("unknown contact: {0}")]
    UnknownContact(i64),

    /// User already has the maximum number of trusted contacts.
    #[error("contact limit reached ({0})")]
    ContactCapReached(usize),

    /// Outbound delivery failed. Only surfaced for failures the caller's
    /// retry layer must see (rate limits); permanent and transient send
    /// failures are absorbed into the notification ledger.
    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    /// Configuration load or parse error.
    #[error("config error: {0}")]
    Config(String),

    /// Check-in photo archival error.
    #[error("media archive error: {0}")]
    Media(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure kinds reported by the chat-platform client.
///
/// The three variants drive different recovery paths: permanent denial marks
/// the user unreachable, rate limiting propagates to the caller's retry
/// infrastructure, and anything else is logged without automatic retry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    /// Recipient blocked the sender or deleted their account. Never retried.
    #[error("recipient unreachable: {0}")]
    PermanentlyDenied(String),

    /// Platform throttled the send; retry after the given hint.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        /// Platform-provided retry-after hint in seconds.
        retry_after_secs: u64,
    },

    /// Any other delivery failure (network, platform API error).
    #[error("transient delivery failure: {0}")]
    Transient(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VigilError>;
