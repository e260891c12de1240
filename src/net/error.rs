use thiserror::Error;

/// Failure to obtain any response from the network.
///
/// Every variant is transient from the caller's point of view: reads fall
/// back to the cache and queued writes are retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  #[error("Network unavailable (offline)")]
  Offline,

  #[error("Request timed out")]
  Timeout,

  #[error("Network error: {0}")]
  Transport(String),

  #[error("Invalid request: {0}")]
  InvalidRequest(String),
}

impl From<reqwest::Error> for FetchError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      FetchError::Timeout
    } else if e.is_builder() {
      FetchError::InvalidRequest(e.to_string())
    } else {
      FetchError::Transport(e.to_string())
    }
  }
}
