use futures::future::BoxFuture;
use std::time::Duration;

use crate::config::Config;

use super::error::FetchError;
use super::types::{Headers, Method, Request, Response};

/// The network seam: everything the offline layer fetches goes through here.
pub trait Network: Send + Sync {
  /// Issue the request, returning any HTTP response the server produced.
  ///
  /// HTTP error statuses are responses, not errors; `FetchError` means no
  /// response was obtained at all.
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>>;
}

/// HTTP client wrapper backed by reqwest
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(config: &Config) -> Result<Self, FetchError> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.backend.timeout_secs))
      .user_agent(concat!("innkeep/", env!("CARGO_PKG_VERSION")))
      .build()?;

    Ok(Self { client })
  }

  fn to_reqwest(method: Method) -> reqwest::Method {
    match method {
      Method::Get => reqwest::Method::GET,
      Method::Head => reqwest::Method::HEAD,
      Method::Options => reqwest::Method::OPTIONS,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    }
  }

  async fn send(&self, request: &Request) -> Result<Response, FetchError> {
    let mut builder = self
      .client
      .request(Self::to_reqwest(request.method), request.url.clone());

    for (name, value) in request.headers.iter() {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();

    let headers = collect_headers(response.headers());

    let body = response.bytes().await?.to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

/// Repeated header lines are kept, not overwritten.
fn collect_headers(map: &reqwest::header::HeaderMap) -> Headers {
  let mut headers = Headers::new();
  for (name, value) in map {
    // Non-UTF8 header values are dropped
    if let Ok(value) = value.to_str() {
      headers.append(name.as_str(), value);
    }
  }
  headers
}

impl Network for HttpNetwork {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>> {
    Box::pin(async move {
      let result = self.send(request).await;
      match &result {
        Ok(response) => {
          tracing::debug!(method = %request.method, url = %request.url, status = response.status, "fetched")
        }
        Err(e) => tracing::debug!(method = %request.method, url = %request.url, error = %e, "fetch failed"),
      }
      result
    })
  }
}
