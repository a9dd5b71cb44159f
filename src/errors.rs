//! Typed error taxonomy for the sync client.
//!
//! Transport failures are handled inside the connection manager (retry or
//! terminal state transition) and reach consumers as state changes, never
//! as panics. `SyncError` covers the cases a caller can act on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The server rejected the credential during connect or closed with an
    /// auth code. Never retried; the caller should re-authenticate.
    #[error("authentication rejected by the job stream; re-authenticate and retry")]
    AuthRejected,

    /// The reconnect budget ran out.
    #[error("reconnection failed after {attempts} attempts, please refresh")]
    RetriesExhausted { attempts: u32 },

    /// A send was attempted while the push channel is not open.
    #[error("not connected to the job stream")]
    NotConnected,

    /// The job no longer accepts operator input (past the collecting phases).
    #[error("job no longer accepts operator input")]
    InputClosed,

    /// The configured endpoints cannot produce a usable connection URL.
    #[error("invalid endpoint configuration: {0}")]
    BadEndpoint(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
