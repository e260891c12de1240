//! Replaying queued mutations against the backend.

use base64::engine::general_purpose::STANDARD as B64_STANDARD;
use base64::Engine as _;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::item::SyncItem;
use crate::net::{FetchError, Headers, Method, Network, Request};

/// Outcome of a failed replay.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
  /// Worth trying again later; counts against the retry budget.
  #[error("{0}")]
  Transient(String),

  /// The server refused the mutation. Retrying cannot help.
  #[error("rejected: {0}")]
  Rejected(String),
}

/// Sends one queued mutation to the server.
pub trait Replayer: Send + Sync {
  fn replay<'a>(&'a self, item: &'a SyncItem) -> BoxFuture<'a, Result<(), ReplayError>>;
}

/// The request captured when a write was queued.
///
/// UTF-8 bodies are kept readable in `body`; anything else goes to
/// `body_base64` byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationEnvelope {
  pub method: Method,
  pub url: String,
  #[serde(default)]
  pub headers: Headers,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body_base64: Option<String>,
}

impl MutationEnvelope {
  pub fn capture(request: &Request) -> Self {
    let (body, body_base64) = match &request.body {
      None => (None, None),
      Some(bytes) => match std::str::from_utf8(bytes) {
        Ok(text) => (Some(text.to_string()), None),
        Err(_) => (None, Some(B64_STANDARD.encode(bytes))),
      },
    };
    Self {
      method: request.method,
      url: request.url.to_string(),
      headers: request.headers.clone(),
      body,
      body_base64,
    }
  }

  pub fn to_request(&self) -> Result<Request, ReplayError> {
    let url = Url::parse(&self.url)
      .map_err(|e| ReplayError::Rejected(format!("invalid url {:?}: {}", self.url, e)))?;
    let mut request = Request::new(self.method, url);
    request.headers = self.headers.clone();
    request.body = match (&self.body_base64, &self.body) {
      (Some(encoded), _) => Some(
        B64_STANDARD
          .decode(encoded)
          .map_err(|e| ReplayError::Rejected(format!("invalid body encoding: {}", e)))?,
      ),
      (None, Some(text)) => Some(text.clone().into_bytes()),
      (None, None) => None,
    };
    Ok(request)
  }
}

/// Replays envelopes over HTTP.
pub struct HttpReplayer {
  network: Arc<dyn Network>,
}

impl HttpReplayer {
  pub fn new(network: Arc<dyn Network>) -> Self {
    Self { network }
  }

  async fn send(&self, item: &SyncItem) -> Result<(), ReplayError> {
    let envelope: MutationEnvelope = serde_json::from_value(item.payload.clone())
      .map_err(|e| ReplayError::Rejected(format!("malformed payload: {}", e)))?;
    let request = envelope.to_request()?;

    let response = self
      .network
      .fetch(&request)
      .await
      .map_err(|e| classify_fetch_error(&e))?;

    debug!(id = %item.id, action = %item.action, status = response.status, "replayed");
    classify_status(response.status, &response.text())
  }
}

impl Replayer for HttpReplayer {
  fn replay<'a>(&'a self, item: &'a SyncItem) -> BoxFuture<'a, Result<(), ReplayError>> {
    Box::pin(self.send(item))
  }
}

fn classify_fetch_error(error: &FetchError) -> ReplayError {
  match error {
    FetchError::InvalidRequest(msg) => ReplayError::Rejected(msg.clone()),
    other => ReplayError::Transient(other.to_string()),
  }
}

/// 2xx succeeds. Timeouts, throttling and server errors are transient.
fn classify_status(status: u16, body: &str) -> Result<(), ReplayError> {
  let detail = || {
    let snippet: String = body.chars().take(200).collect();
    if snippet.is_empty() {
      format!("HTTP {}", status)
    } else {
      format!("HTTP {}: {}", status, snippet)
    }
  };
  match status {
    200..=299 => Ok(()),
    408 | 429 | 500..=599 => Err(ReplayError::Transient(detail())),
    _ => Err(ReplayError::Rejected(detail())),
  }
}
