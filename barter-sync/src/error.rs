use crate::render::SurfaceId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors a load can fail with in `barter-sync`.
///
/// These surface to callers as [`Outcome::Failure`](crate::outcome::Outcome::Failure). Cancellation
/// and timeouts are not errors and have their own [`Outcome`](crate::outcome::Outcome) variants.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum SyncError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("HTTP status {status} from {endpoint}")]
    Status { endpoint: String, status: u16 },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("provider error {code}: {message}")]
    Provider { code: String, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Determine if an error is likely to clear on its own (network blips, upstream overload,
    /// rate limiting) rather than indicating a request that will keep failing.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Http(_) => true,
            SyncError::Status { status, .. } => *status == 429 || *status >= 500,
            SyncError::Provider { code, .. } => {
                let code_lower = code.to_lowercase();
                code_lower.contains("rate")
                    || code_lower.contains("timeout")
                    || code_lower.contains("unavailable")
                    || code_lower.contains("upstream")
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            Self::Parse(value.to_string())
        } else {
            Self::Http(value.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value.to_string())
    }
}

/// Errors raised by a [`ChartEngine`](crate::render::ChartEngine) while building or tearing down
/// a view. The [`ViewRenderer`](crate::render::ViewRenderer) logs and swallows them.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum RenderError {
    #[error("display surface {0} does not exist")]
    SurfaceMissing(SurfaceId),

    #[error("display surface {0} is detached")]
    SurfaceDetached(SurfaceId),

    #[error("chart engine error: {0}")]
    Engine(String),
}
