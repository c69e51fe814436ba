//! Error types for the lease core.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

/// Errors that can occur during lease management.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config or lease files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid service configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate) when the
    /// configuration contains invalid values (e.g., range_start > range_end).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    #[error("Socket error: {0}")]
    Socket(String),

    /// A uniqueness invariant (address, hardware address or hostname) would
    /// be violated by the operation.
    #[error("Lease conflict: {0}")]
    Conflict(String),

    /// The operation referenced a lease that does not exist.
    #[error("Lease not found: {0}")]
    NotFound(String),

    /// No free, non-conflicting address is available in the range.
    ///
    /// Affects only the requesting client; addresses become available again
    /// as leases are removed or reaped.
    #[error("No available IP addresses in pool")]
    PoolExhausted,

    /// Stateful assignment is switched off for the requested family.
    #[error("Address pool disabled: {0}")]
    PoolDisabled(String),

    /// Malformed or out-of-range input.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A conflict probe or the caller's deadline ran out.
    #[error("Allocation timed out")]
    Timeout,
}

/// A specialized Result type for lease operations.
pub type Result<T> = std::result::Result<T, Error>;
