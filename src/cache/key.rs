//! Normalized cache keys for requests.

use sha2::{Digest, Sha256};

use crate::net::{Method, Request};

/// Headers that select between distinct cached representations.
const KEY_HEADERS: &[&str] = &["authorization"];

/// Stable key for a request: method, URL without fragment, and the
/// representation-selecting headers.
///
/// HEAD shares the GET entry.
pub fn cache_key(request: &Request) -> String {
  let method = match request.method {
    Method::Head => Method::Get,
    m => m,
  };

  let mut url = request.url.clone();
  url.set_fragment(None);

  let mut input = format!("{}:{}", method, url);
  for name in KEY_HEADERS {
    if let Some(value) = request.headers.get(name) {
      input.push('\n');
      input.push_str(name);
      input.push(':');
      input.push_str(value.trim());
    }
  }

  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn req(method: Method, href: &str) -> Request {
    let base = Url::parse("https://stay.example.com/").unwrap();
    Request::resolve(method, &base, href).unwrap()
  }

  #[test]
  fn test_fragment_ignored() {
    assert_eq!(
      cache_key(&req(Method::Get, "/rooms#gallery")),
      cache_key(&req(Method::Get, "/rooms"))
    );
  }

  #[test]
  fn test_head_shares_get() {
    assert_eq!(
      cache_key(&req(Method::Head, "/api/rooms")),
      cache_key(&req(Method::Get, "/api/rooms"))
    );
  }

  #[test]
  fn test_query_and_auth_distinguish() {
    let a = cache_key(&req(Method::Get, "/api/rooms?page=1"));
    let b = cache_key(&req(Method::Get, "/api/rooms?page=2"));
    assert_ne!(a, b);

    let alice = cache_key(&req(Method::Get, "/api/user").with_header("Authorization", "Bearer a"));
    let bob = cache_key(&req(Method::Get, "/api/user").with_header("Authorization", "Bearer b"));
    assert_ne!(alice, bob);

    // Unrelated headers do not split entries
    let plain = cache_key(&req(Method::Get, "/api/rooms"));
    let with_accept = cache_key(&req(Method::Get, "/api/rooms").with_header("Accept", "*/*"));
    assert_eq!(plain, with_accept);
    assert_eq!(plain.len(), 64);
  }
}
