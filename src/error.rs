//! Errors returned by a [`RemoteHost`](crate::remote::RemoteHost).
//!
//! Callers match on the variant: `NotFound`, `TooLarge` and
//! `BaseUnresolvable` are expected outcomes with their own handling paths,
//! everything else is a real failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("not found on remote: {0}")]
    NotFound(String),

    #[error("content too large to fetch: {0}")]
    TooLarge(String),

    #[error("base commit {0} can no longer be resolved")]
    BaseUnresolvable(String),

    #[error("no token configured for credential '{0}'")]
    Unauthorized(String),

    #[error("remote returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Decode(String),
}
