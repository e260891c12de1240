//! Request classification: an ordered table of (predicate, strategy,
//! partition) rows evaluated top-down, first match wins.

use std::fmt;

use super::partition::Category;
use super::traits::Strategy;
use crate::net::Request;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

const STATIC_EXTENSIONS: &[&str] = &[
  "js",
  "mjs",
  "css",
  "woff",
  "woff2",
  "ttf",
  "otf",
  "eot",
  "webmanifest",
];
const STATIC_PREFIXES: &[&str] = &["/static/", "/assets/"];

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "svg", "webp", "avif", "ico"];
const IMAGE_PREFIXES: &[&str] = &["/images/", "/img/"];

type Predicate = Box<dyn Fn(&Request) -> bool + Send + Sync>;

/// One row of the classification table.
pub struct Route {
  pub name: &'static str,
  matcher: Predicate,
  pub strategy: Strategy,
  pub category: Option<Category>,
  pub default_ttl_secs: Option<u64>,
}

impl fmt::Debug for Route {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Route")
      .field("name", &self.name)
      .field("strategy", &self.strategy)
      .field("category", &self.category)
      .field("default_ttl_secs", &self.default_ttl_secs)
      .finish_non_exhaustive()
  }
}

/// Outcome of classifying a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteMatch {
  pub name: &'static str,
  pub strategy: Strategy,
  /// Target partition; `None` means the response is never cached
  pub category: Option<Category>,
  pub default_ttl_secs: Option<u64>,
}

impl RouteMatch {
  /// Straight to the network, nothing cached.
  pub const PASSTHROUGH: RouteMatch = RouteMatch {
    name: "passthrough",
    strategy: Strategy::NetworkOnly,
    category: None,
    default_ttl_secs: None,
  };
}

#[derive(Debug, Default)]
pub struct RouteTable {
  routes: Vec<Route>,
}

impl RouteTable {
  pub fn new() -> Self {
    Self::default()
  }

  /// Append a row; earlier rows take priority.
  pub fn push<F>(
    &mut self,
    name: &'static str,
    strategy: Strategy,
    category: Option<Category>,
    default_ttl_secs: Option<u64>,
    matcher: F,
  ) where
    F: Fn(&Request) -> bool + Send + Sync + 'static,
  {
    self.routes.push(Route {
      name,
      matcher: Box::new(matcher),
      strategy,
      category,
      default_ttl_secs,
    });
  }

  /// The booking client's table. `shell` lists app-shell paths that must
  /// never touch the network.
  pub fn standard(shell: &[String]) -> Self {
    let mut table = Self::new();

    let shell: Vec<String> = shell.to_vec();
    table.push(
      "app-shell",
      Strategy::CacheOnly,
      Some(Category::Static),
      None,
      move |req| shell.iter().any(|p| p == req.path()),
    );

    table.push(
      "static",
      Strategy::CacheFirst,
      Some(Category::Static),
      Some(30 * DAY),
      |req| {
        let path = req.path();
        has_extension(path, STATIC_EXTENSIONS)
          || file_name(path) == "manifest.json"
          || STATIC_PREFIXES.iter().any(|p| path.starts_with(p))
      },
    );

    table.push(
      "images",
      Strategy::CacheFirst,
      Some(Category::Images),
      Some(30 * DAY),
      |req| {
        let path = req.path();
        has_extension(path, IMAGE_EXTENSIONS) || IMAGE_PREFIXES.iter().any(|p| path.starts_with(p))
      },
    );

    // Payment state must never be served from cache
    table.push("payment", Strategy::NetworkOnly, None, None, |req| {
      req.path().starts_with("/api/payment")
    });

    table.push(
      "availability",
      Strategy::NetworkFirst,
      Some(Category::Api),
      Some(5 * MINUTE),
      |req| req.path().starts_with("/api/availability"),
    );

    table.push(
      "rooms",
      Strategy::StaleWhileRevalidate,
      Some(Category::Api),
      Some(HOUR),
      |req| req.path().starts_with("/api/rooms"),
    );

    table.push(
      "booking",
      Strategy::NetworkFirst,
      Some(Category::Booking),
      Some(HOUR),
      |req| req.path().starts_with("/api/booking"),
    );

    table.push(
      "user",
      Strategy::NetworkFirst,
      Some(Category::User),
      Some(DAY),
      |req| {
        let path = req.path();
        path.starts_with("/api/user") || path.starts_with("/api/auth")
      },
    );

    table.push(
      "pages",
      Strategy::StaleWhileRevalidate,
      Some(Category::Pages),
      Some(DAY),
      |req| req.is_navigation(),
    );

    table
  }

  /// Classify a request. Writes and unmatched reads pass straight through.
  pub fn classify(&self, request: &Request) -> RouteMatch {
    if !request.method.is_safe() {
      return RouteMatch::PASSTHROUGH;
    }

    self
      .routes
      .iter()
      .find(|route| (route.matcher)(request))
      .map(|route| RouteMatch {
        name: route.name,
        strategy: route.strategy,
        category: route.category,
        default_ttl_secs: route.default_ttl_secs,
      })
      .unwrap_or(RouteMatch::PASSTHROUGH)
  }
}

fn file_name(path: &str) -> &str {
  path.rsplit('/').next().unwrap_or("")
}

fn has_extension(path: &str, extensions: &[&str]) -> bool {
  match file_name(path).rsplit_once('.') {
    Some((stem, ext)) if !stem.is_empty() => {
      let ext = ext.to_ascii_lowercase();
      extensions.iter().any(|e| *e == ext)
    }
    _ => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::Method;
  use url::Url;

  fn table() -> RouteTable {
    RouteTable::standard(&["/app-shell.html".to_string(), "/offline.html".to_string()])
  }

  fn get(href: &str) -> Request {
    let base = Url::parse("https://stay.example.com/").unwrap();
    Request::resolve(Method::Get, &base, href).unwrap()
  }

  fn classify(href: &str) -> (Strategy, Option<Category>) {
    let m = table().classify(&get(href));
    (m.strategy, m.category)
  }

  #[test]
  fn test_static_and_images() {
    assert_eq!(classify("/js/app.js"), (Strategy::CacheFirst, Some(Category::Static)));
    assert_eq!(classify("/styles/main.CSS"), (Strategy::CacheFirst, Some(Category::Static)));
    assert_eq!(classify("/assets/font"), (Strategy::CacheFirst, Some(Category::Static)));
    assert_eq!(classify("/manifest.json"), (Strategy::CacheFirst, Some(Category::Static)));
    assert_eq!(classify("/rooms/suite.webp"), (Strategy::CacheFirst, Some(Category::Images)));
    assert_eq!(classify("/images/hero"), (Strategy::CacheFirst, Some(Category::Images)));
  }

  #[test]
  fn test_api_routes() {
    let t = table();
    let availability = t.classify(&get("/api/availability?from=2024-06-01"));
    assert_eq!(availability.strategy, Strategy::NetworkFirst);
    assert_eq!(availability.category, Some(Category::Api));
    assert_eq!(availability.default_ttl_secs, Some(5 * MINUTE));

    let rooms = t.classify(&get("/api/rooms"));
    assert_eq!(rooms.strategy, Strategy::StaleWhileRevalidate);
    assert_eq!(rooms.category, Some(Category::Api));
    assert_eq!(rooms.default_ttl_secs, Some(HOUR));

    assert_eq!(classify("/api/bookings/42"), (Strategy::NetworkFirst, Some(Category::Booking)));
    assert_eq!(classify("/api/user/profile"), (Strategy::NetworkFirst, Some(Category::User)));
    assert_eq!(classify("/api/auth/session"), (Strategy::NetworkFirst, Some(Category::User)));
    assert_eq!(classify("/api/payments/7"), (Strategy::NetworkOnly, None));
  }

  #[test]
  fn test_shell_is_cache_only() {
    assert_eq!(classify("/offline.html"), (Strategy::CacheOnly, Some(Category::Static)));
    let nav = table().classify(&get("/app-shell.html").navigate());
    assert_eq!(nav.strategy, Strategy::CacheOnly);
  }

  #[test]
  fn test_navigation_and_default() {
    let nav = table().classify(&get("/rooms/deluxe").navigate());
    assert_eq!(nav.strategy, Strategy::StaleWhileRevalidate);
    assert_eq!(nav.category, Some(Category::Pages));

    assert_eq!(table().classify(&get("/api/health")), RouteMatch::PASSTHROUGH);
    assert_eq!(table().classify(&get("/robots.txt")), RouteMatch::PASSTHROUGH);
  }

  #[test]
  fn test_priority_order() {
    // An image under /api/ is still an image: rule order decides
    assert_eq!(classify("/api/rooms/1/photo.jpg"), (Strategy::CacheFirst, Some(Category::Images)));
    // A navigation to a stylesheet is still a static asset
    let m = table().classify(&get("/theme.css").navigate());
    assert_eq!(m.category, Some(Category::Static));
  }

  #[test]
  fn test_writes_pass_through() {
    let base = Url::parse("https://stay.example.com/").unwrap();
    let post = Request::resolve(Method::Post, &base, "/api/rooms").unwrap();
    assert_eq!(table().classify(&post), RouteMatch::PASSTHROUGH);
  }

  #[test]
  fn test_dotfiles_have_no_extension() {
    assert!(!has_extension("/.css", STATIC_EXTENSIONS));
    assert!(has_extension("/a.woff2", STATIC_EXTENSIONS));
  }
}
