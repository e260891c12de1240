//! Responses synthesized when the network cannot answer.
//!
//! Everything here is a pure function of its inputs.

use serde_json::json;

use crate::net::{Request, Response};
use crate::queue::ActionKind;

/// Header marking a write that was accepted locally and awaits replay.
pub const SYNC_HEADER: &str = "x-innkeep-sync";

/// Header naming where a read was served from when it did not come from
/// the network.
pub const SOURCE_HEADER: &str = "x-innkeep-source";

const OFFLINE_DOCUMENT: &str = "<!DOCTYPE html>
<html lang=\"en\">
<head><meta charset=\"utf-8\"><title>Offline</title></head>
<body>
<h1>You are offline</h1>
<p>This page is not available offline. Your bookings will sync when the connection returns.</p>
</body>
</html>
";

/// Response for a read that could be served neither from the network nor
/// from the cache.
///
/// `offline_page` is the pre-cached offline document, if there is one.
pub fn offline_response(request: &Request, offline_page: Option<Response>) -> Response {
  if request.is_navigation() {
    return match offline_page {
      Some(page) => page,
      None => Response::new(503, OFFLINE_DOCUMENT)
        .with_header("content-type", "text/html; charset=utf-8"),
    };
  }

  if request.expects_json() {
    return Response::json(503, &json!({ "error": "offline", "offline": true }));
  }

  Response::new(503, "Service Unavailable").with_header("content-type", "text/plain; charset=utf-8")
}

/// A write accepted into the sync queue.
pub fn queued(id: &str, action: ActionKind) -> Response {
  Response::json(
    202,
    &json!({
      "queued": true,
      "offline": true,
      "id": id,
      "action": action,
    }),
  )
  .with_header(SYNC_HEADER, "pending")
}

/// A write that could neither reach the server nor be queued.
pub fn not_queued() -> Response {
  Response::json(
    503,
    &json!({ "error": "offline", "offline": true, "queued": false }),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::Method;
  use url::Url;

  fn request(href: &str) -> Request {
    let base = Url::parse("https://stay.example.com/").unwrap();
    Request::resolve(Method::Get, &base, href).unwrap()
  }

  #[test]
  fn test_navigation_prefers_cached_offline_page() {
    let cached = Response::new(200, "<html>cached offline</html>");
    let response = offline_response(&request("/rooms").navigate(), Some(cached.clone()));
    assert_eq!(response, cached);
  }

  #[test]
  fn test_navigation_without_offline_page() {
    let response = offline_response(&request("/rooms").navigate(), None);
    assert_eq!(response.status, 503);
    assert!(response.text().contains("You are offline"));
    assert_eq!(
      response.headers.get("content-type"),
      Some("text/html; charset=utf-8")
    );
  }

  #[test]
  fn test_data_request_gets_json() {
    let response = offline_response(&request("/api/availability?room=3"), None);
    assert_eq!(response.status, 503);
    assert_eq!(
      response.json_body().unwrap(),
      json!({ "error": "offline", "offline": true })
    );

    let accept_json = offline_response(
      &request("/feeds/rooms").with_header("accept", "application/json"),
      None,
    );
    assert_eq!(accept_json.json_body().unwrap()["offline"], json!(true));
  }

  #[test]
  fn test_other_requests_get_plain_503() {
    let response = offline_response(&request("/img/hero.png"), Some(Response::new(200, "page")));
    assert_eq!(response.status, 503);
    assert_eq!(response.text(), "Service Unavailable");
  }

  #[test]
  fn test_queued_contract() {
    let response = queued("0192", ActionKind::UpdateBooking);
    assert_eq!(response.status, 202);
    assert_eq!(response.headers.get(SYNC_HEADER), Some("pending"));
    assert_eq!(
      response.json_body().unwrap(),
      json!({ "queued": true, "offline": true, "id": "0192", "action": "update_booking" })
    );
  }
}
