//! Error type surfaced to consumers of the sync layer.

use serde::Deserialize;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// A normalized sync error.
///
/// Transport failures and rejected mutations are only told apart by the
/// optional HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SyncError {
  pub status: Option<u16>,
  pub message: String,
}

impl SyncError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      status: None,
      message: message.into(),
    }
  }

  pub fn with_status(status: u16, message: impl Into<String>) -> Self {
    Self {
      status: Some(status),
      message: message.into(),
    }
  }

  pub fn is_unauthorized(&self) -> bool {
    self.status == Some(401)
  }
}

impl From<reqwest::Error> for SyncError {
  fn from(e: reqwest::Error) -> Self {
    Self {
      status: e.status().map(|s| s.as_u16()),
      message: e.to_string(),
    }
  }
}

/// JSON error body returned by the API
#[derive(Debug, Deserialize)]
struct ErrorBody {
  message: Option<String>,
}

/// Build a `SyncError` from a non-2xx response.
///
/// Uses the body's `message` field when present, `fallback` otherwise.
pub(crate) async fn error_from_response(response: reqwest::Response, fallback: &str) -> SyncError {
  let status = response.status().as_u16();
  let message = response
    .json::<ErrorBody>()
    .await
    .ok()
    .and_then(|body| body.message)
    .unwrap_or_else(|| fallback.to_string());

  SyncError::with_status(status, message)
}
