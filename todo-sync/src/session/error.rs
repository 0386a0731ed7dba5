//! Error taxonomy for the sync client.
//!
//! A stale fetch result is deliberately absent here: it is not a failure and
//! is reported as [`crate::session::reconcile::FetchOutcome::Stale`].

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Network, socket, timeout or server-side (5xx) failure
    #[error("transport error: {0}")]
    Transport(String),

    /// 401 from any authenticated call; ends the session
    #[error("not authorized: {0}")]
    Auth(String),

    /// Malformed or rejected mutation; surfaced to the user, never retried
    #[error("invalid request: {0}")]
    Validation(String),
}

impl SyncError {
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.status() == Some(reqwest::StatusCode::UNAUTHORIZED) {
            SyncError::Auth(e.to_string())
        } else if e.is_decode() {
            SyncError::Transport(format!("unexpected response body: {}", e))
        } else {
            SyncError::Transport(e.to_string())
        }
    }
}
