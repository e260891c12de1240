//! Request and response values carried through the offline layer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

use super::error::FetchError;

/// HTTP method of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Options,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  /// Safe methods are reads; everything else is a write.
  pub fn is_safe(&self) -> bool {
    matches!(self, Method::Get | Method::Head | Method::Options)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Options => "OPTIONS",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Some(Method::Get),
      "HEAD" => Some(Method::Head),
      "OPTIONS" => Some(Method::Options),
      "POST" => Some(Method::Post),
      "PUT" => Some(Method::Put),
      "PATCH" => Some(Method::Patch),
      "DELETE" => Some(Method::Delete),
      _ => None,
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// How the request was issued by the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  /// Top-level page navigation
  Navigate,
  /// Script-issued fetch or subresource load
  #[default]
  Fetch,
}

/// Header map with case-insensitive (lowercased) names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, name: &str, value: impl Into<String>) {
    self.0.insert(name.to_ascii_lowercase(), value.into());
  }

  /// Add a value for a header that may repeat.
  ///
  /// List-valued headers are joined with `", "`. `set-cookie` values cannot
  /// be joined that way, so each stays on its own line.
  pub fn append(&mut self, name: &str, value: &str) {
    let name = name.to_ascii_lowercase();
    let separator = if name == "set-cookie" { "\n" } else { ", " };
    self
      .0
      .entry(name)
      .and_modify(|existing| {
        existing.push_str(separator);
        existing.push_str(value);
      })
      .or_insert_with(|| value.to_string());
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
    self.0.iter()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl<const N: usize> From<[(&str, &str); N]> for Headers {
  fn from(pairs: [(&str, &str); N]) -> Self {
    let mut headers = Headers::new();
    for (name, value) in pairs {
      headers.insert(name, value);
    }
    headers
  }
}

/// An outgoing request as seen by the interceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
  pub mode: RequestMode,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Headers::new(),
      body: None,
      mode: RequestMode::Fetch,
    }
  }

  /// Build a request from an absolute URL or a path resolved against `base`.
  pub fn resolve(method: Method, base: &Url, href: &str) -> Result<Self, FetchError> {
    let url = base
      .join(href)
      .map_err(|e| FetchError::InvalidRequest(format!("{}: {}", href, e)))?;
    Ok(Self::new(method, url))
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name, value);
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn navigate(mut self) -> Self {
    self.mode = RequestMode::Navigate;
    self
  }

  pub fn path(&self) -> &str {
    self.url.path()
  }

  /// True for page loads: explicit navigations or HTML-accepting GETs.
  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
      || (self.method == Method::Get
        && self
          .headers
          .get("accept")
          .is_some_and(|a| a.contains("text/html")))
  }

  /// True when the caller expects structured data back.
  pub fn expects_json(&self) -> bool {
    self
      .headers
      .get("accept")
      .is_some_and(|a| a.contains("application/json"))
      || self.path().starts_with("/api/")
  }
}

/// A response produced by the network, the cache or a fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Headers::new(),
      body: body.into(),
    }
  }

  /// JSON response with the matching content type.
  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    let mut response = Self::new(status, value.to_string());
    response
      .headers
      .insert("content-type", "application/json; charset=utf-8");
    response
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name, value);
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn json_body(&self) -> Option<serde_json::Value> {
    serde_json::from_slice(&self.body).ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn base() -> Url {
    Url::parse("https://stay.example.com/").unwrap()
  }

  #[test]
  fn test_method_safety() {
    assert!(Method::Get.is_safe());
    assert!(Method::Head.is_safe());
    assert!(!Method::Post.is_safe());
    assert!(!Method::Patch.is_safe());
    assert_eq!(Method::parse("patch"), Some(Method::Patch));
    assert_eq!(Method::parse("BREW"), None);
  }

  #[test]
  fn test_headers_case_insensitive() {
    let headers = Headers::from([("Content-Type", "text/html")]);
    assert_eq!(headers.get("content-type"), Some("text/html"));
    assert_eq!(headers.get("CONTENT-TYPE"), Some("text/html"));
  }

  #[test]
  fn test_headers_append_keeps_every_value() {
    let mut headers = Headers::new();
    headers.append("Vary", "accept");
    headers.append("vary", "authorization");
    assert_eq!(headers.get("vary"), Some("accept, authorization"));

    headers.append("Set-Cookie", "a=1");
    headers.append("set-cookie", "b=2");
    assert_eq!(headers.get("set-cookie"), Some("a=1\nb=2"));
  }

  #[test]
  fn test_resolve_relative_path() {
    let req = Request::resolve(Method::Get, &base(), "/api/rooms?from=2024-01-01").unwrap();
    assert_eq!(req.url.as_str(), "https://stay.example.com/api/rooms?from=2024-01-01");
    assert_eq!(req.path(), "/api/rooms");
  }

  #[test]
  fn test_navigation_detection() {
    let page = Request::resolve(Method::Get, &base(), "/rooms").unwrap().navigate();
    assert!(page.is_navigation());

    let html = Request::resolve(Method::Get, &base(), "/about")
      .unwrap()
      .with_header("Accept", "text/html,application/xhtml+xml");
    assert!(html.is_navigation());

    let data = Request::resolve(Method::Get, &base(), "/api/rooms").unwrap();
    assert!(!data.is_navigation());
    assert!(data.expects_json());
  }
}
