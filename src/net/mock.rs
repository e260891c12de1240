//! Scripted network double for tests.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::client::Network;
use super::error::FetchError;
use super::types::{Method, Request, Response};

type Handler = Box<dyn Fn(&Request, usize) -> Result<Response, FetchError> + Send + Sync>;

/// Network that answers from a closure and records every call.
///
/// The closure receives the request and the zero-based call number.
pub struct MockNetwork {
  handler: Handler,
  calls: Mutex<Vec<(Method, String)>>,
  count: AtomicUsize,
}

impl MockNetwork {
  pub fn new<F>(handler: F) -> Self
  where
    F: Fn(&Request, usize) -> Result<Response, FetchError> + Send + Sync + 'static,
  {
    Self {
      handler: Box::new(handler),
      calls: Mutex::new(Vec::new()),
      count: AtomicUsize::new(0),
    }
  }

  /// Always answers 200 with the given body.
  pub fn ok(body: &'static str) -> Self {
    Self::new(move |_, _| Ok(Response::new(200, body)))
  }

  /// Always fails as if the transport were down.
  pub fn down() -> Self {
    Self::new(|_, _| Err(FetchError::Transport("connection refused".to_string())))
  }

  pub fn call_count(&self) -> usize {
    self.count.load(Ordering::SeqCst)
  }

  /// Number of calls whose URL path equals `path`.
  pub fn calls_to(&self, path: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|(_, url)| url::Url::parse(url).map(|u| u.path() == path).unwrap_or(false))
      .count()
  }

  pub fn calls(&self) -> Vec<(Method, String)> {
    self.calls.lock().unwrap().clone()
  }
}

impl Network for MockNetwork {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>> {
    let n = self.count.fetch_add(1, Ordering::SeqCst);
    self
      .calls
      .lock()
      .unwrap()
      .push((request.method, request.url.to_string()));
    let result = (self.handler)(request, n);
    Box::pin(async move {
      tokio::task::yield_now().await;
      result
    })
  }
}
