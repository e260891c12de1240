//! Request interception: the single entry point for every request the
//! client makes.
//!
//! Reads go through the strategy engine. Writes go straight to the network
//! and fall back to the sync queue when the network cannot be reached.
//! Whatever fails is turned into a response the caller can tell apart.

pub mod fallback;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{Category, PrecacheReport, StorageError, StrategyEngine};
use crate::connectivity::Connectivity;
use crate::net::{FetchError, Method, Network, Request, Response};
use crate::queue::{ActionKind, MutationEnvelope, MutationQueue};

/// Install/activate lifecycle of one release of the layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
  Installing,
  Installed,
  Activated,
  Running,
  /// A newer release took over. Keeps serving until nothing depends on it.
  Superseded,
}

impl Lifecycle {
  pub fn as_str(&self) -> &'static str {
    match self {
      Lifecycle::Installing => "installing",
      Lifecycle::Installed => "installed",
      Lifecycle::Activated => "activated",
      Lifecycle::Running => "running",
      Lifecycle::Superseded => "superseded",
    }
  }

  fn serves_requests(&self) -> bool {
    matches!(
      self,
      Lifecycle::Activated | Lifecycle::Running | Lifecycle::Superseded
    )
  }
}

impl std::fmt::Display for Lifecycle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Error, Debug)]
pub enum InterceptorError {
  #[error("Cannot {action} while {state}")]
  InvalidState {
    action: &'static str,
    state: Lifecycle,
  },

  #[error("Failed to activate cache partitions: {0}")]
  Activation(#[from] StorageError),
}

/// Keeps a controlled view registered for as long as it is alive.
pub struct ViewHandle {
  views: Arc<AtomicUsize>,
}

impl Drop for ViewHandle {
  fn drop(&mut self) {
    self.views.fetch_sub(1, Ordering::SeqCst);
  }
}

/// Counts a request as in flight until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
  fn enter(counter: &'a AtomicUsize) -> Self {
    counter.fetch_add(1, Ordering::SeqCst);
    Self(counter)
  }
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

pub struct Interceptor {
  engine: StrategyEngine,
  queue: MutationQueue,
  network: Arc<dyn Network>,
  connectivity: Connectivity,
  base_url: Url,
  precache: Vec<String>,
  offline_page: String,
  state: watch::Sender<Lifecycle>,
  views: Arc<AtomicUsize>,
  in_flight: AtomicUsize,
}

impl Interceptor {
  pub fn new(
    engine: StrategyEngine,
    queue: MutationQueue,
    network: Arc<dyn Network>,
    connectivity: Connectivity,
    base_url: Url,
  ) -> Self {
    let (state, _) = watch::channel(Lifecycle::Installing);
    Self {
      engine,
      queue,
      network,
      connectivity,
      base_url,
      precache: Vec::new(),
      offline_page: "/offline.html".to_string(),
      state,
      views: Arc::new(AtomicUsize::new(0)),
      in_flight: AtomicUsize::new(0),
    }
  }

  /// Assets fetched into the static partition at install.
  pub fn with_precache(mut self, hrefs: Vec<String>) -> Self {
    self.precache = hrefs;
    self
  }

  /// Document served for navigations that cannot be answered.
  pub fn with_offline_page(mut self, href: impl Into<String>) -> Self {
    self.offline_page = href.into();
    self
  }

  pub fn engine(&self) -> &StrategyEngine {
    &self.engine
  }

  pub fn queue(&self) -> &MutationQueue {
    &self.queue
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn lifecycle(&self) -> Lifecycle {
    *self.state.borrow()
  }

  pub fn subscribe_lifecycle(&self) -> watch::Receiver<Lifecycle> {
    self.state.subscribe()
  }

  fn transition(&self, from: &[Lifecycle], to: Lifecycle, action: &'static str) -> Result<(), InterceptorError> {
    let mut result = Ok(());
    self.state.send_if_modified(|state| {
      if from.contains(state) {
        *state = to;
        true
      } else {
        result = Err(InterceptorError::InvalidState {
          action,
          state: *state,
        });
        false
      }
    });
    if result.is_ok() {
      info!(state = %to, "lifecycle");
    }
    result
  }

  fn ensure_state(&self, allowed: &[Lifecycle], action: &'static str) -> Result<(), InterceptorError> {
    let state = self.lifecycle();
    if allowed.contains(&state) {
      Ok(())
    } else {
      Err(InterceptorError::InvalidState { action, state })
    }
  }

  /// Pre-cache the configured assets.
  ///
  /// Assets that fail to download are reported and logged; they do not
  /// block installation so a release can install while the backend is
  /// unreachable.
  pub async fn install(&self) -> Result<PrecacheReport, InterceptorError> {
    self.ensure_state(&[Lifecycle::Installing], "install")?;
    let report = self.engine.precache(&self.base_url, &self.precache).await;
    if !report.is_complete() {
      warn!(failed = report.failed.len(), "installed with missing pre-cached assets");
    }
    self.transition(&[Lifecycle::Installing], Lifecycle::Installed, "install")?;
    Ok(report)
  }

  /// Remove partitions of other releases and start serving.
  ///
  /// Returns the names of the removed partitions.
  pub fn activate(&self) -> Result<Vec<String>, InterceptorError> {
    self.ensure_state(&[Lifecycle::Installed], "activate")?;
    let removed = self.engine.activate_partitions()?;
    self.transition(&[Lifecycle::Installed], Lifecycle::Activated, "activate")?;
    Ok(removed)
  }

  /// Register a view controlled by this release.
  pub fn claim_view(&self) -> ViewHandle {
    self.views.fetch_add(1, Ordering::SeqCst);
    ViewHandle {
      views: self.views.clone(),
    }
  }

  pub fn view_count(&self) -> usize {
    self.views.load(Ordering::SeqCst)
  }

  pub fn in_flight(&self) -> usize {
    self.in_flight.load(Ordering::SeqCst)
  }

  /// Mark this release as replaced by a newer one.
  pub fn supersede(&self) -> Result<(), InterceptorError> {
    self.transition(
      &[Lifecycle::Installed, Lifecycle::Activated, Lifecycle::Running],
      Lifecycle::Superseded,
      "supersede",
    )
  }

  /// True once a superseded release no longer controls any view and has
  /// no request in flight.
  pub fn is_discardable(&self) -> bool {
    self.lifecycle() == Lifecycle::Superseded && self.view_count() == 0 && self.in_flight() == 0
  }

  /// Answer a request.
  ///
  /// Always produces a response once active; failures are encoded in it.
  pub async fn handle(&self, request: &Request) -> Result<Response, InterceptorError> {
    let state = self.lifecycle();
    if !state.serves_requests() {
      return Err(InterceptorError::InvalidState {
        action: "handle requests",
        state,
      });
    }
    if state == Lifecycle::Activated {
      // Another request may have won the race; either way we are running
      let _ = self.transition(&[Lifecycle::Activated], Lifecycle::Running, "run");
    }

    let _in_flight = InFlight::enter(&self.in_flight);
    if request.method.is_safe() {
      Ok(self.read(request).await)
    } else {
      Ok(self.write(request).await)
    }
  }

  async fn read(&self, request: &Request) -> Response {
    match self.engine.handle(request).await {
      Ok(result) => {
        let source = result.source;
        let mut response = result.data;
        if result.cached_at.is_some() {
          response.headers.insert(fallback::SOURCE_HEADER, source.as_str());
        }
        response
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "read failed, serving offline fallback");
        let offline_page = if request.is_navigation() {
          self.offline_document()
        } else {
          None
        };
        fallback::offline_response(request, offline_page)
      }
    }
  }

  fn offline_document(&self) -> Option<Response> {
    let request = Request::resolve(Method::Get, &self.base_url, &self.offline_page).ok()?;
    self
      .engine
      .lookup(Category::Static, &request)
      .map(|entry| entry.response)
  }

  async fn write(&self, request: &Request) -> Response {
    let error = if self.connectivity.is_online() {
      match self.network.fetch(request).await {
        // Any HTTP answer, including errors, belongs to the caller
        Ok(response) => return response,
        Err(FetchError::InvalidRequest(detail)) => {
          return Response::json(
            400,
            &serde_json::json!({ "error": "invalid_request", "detail": detail }),
          );
        }
        Err(e) => e,
      }
    } else {
      FetchError::Offline
    };

    let Some(action) = classify_write(request) else {
      warn!(method = %request.method, url = %request.url, error = %error, "write failed and cannot be queued");
      return fallback::not_queued();
    };

    let payload = match serde_json::to_value(MutationEnvelope::capture(request)) {
      Ok(payload) => payload,
      Err(e) => {
        warn!(url = %request.url, error = %e, "could not capture write");
        return fallback::not_queued();
      }
    };

    match self.queue.enqueue(action, payload) {
      Ok(id) => {
        debug!(id = %id, action = %action, error = %error, "write queued for sync");
        fallback::queued(&id, action)
      }
      Err(e) => {
        warn!(action = %action, url = %request.url, error = %e, "write lost: queue rejected it");
        fallback::not_queued()
      }
    }
  }
}

/// Which queued mutation a write corresponds to, if any.
pub fn classify_write(request: &Request) -> Option<ActionKind> {
  let path = request.path().trim_end_matches('/');
  match request.method {
    Method::Post if path == "/api/bookings" => Some(ActionKind::CreateBooking),
    Method::Put | Method::Patch
      if path
        .strip_prefix("/api/bookings/")
        .is_some_and(|id| !id.is_empty()) =>
    {
      Some(ActionKind::UpdateBooking)
    }
    Method::Post if path == "/api/payments" || path.starts_with("/api/payments/") => {
      Some(ActionKind::PaymentAttempt)
    }
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{cache_key, CacheEntry, CacheStorage, PartitionSet, RouteTable, SqliteStorage};
  use crate::config::QueueConfig;
  use crate::net::mock::MockNetwork;
  use crate::queue::{HttpReplayer, SqliteQueueStore};
  use chrono::Utc;
  use serde_json::json;
  use std::collections::BTreeMap;

  struct Harness {
    interceptor: Interceptor,
    network: Arc<MockNetwork>,
    storage: Arc<SqliteStorage>,
  }

  fn base() -> Url {
    Url::parse("https://stay.example.com/").unwrap()
  }

  fn build(network: MockNetwork, queue_available: bool) -> Harness {
    let network = Arc::new(network);
    let storage = Arc::new(SqliteStorage::open_in_memory(1 << 20).unwrap());
    let connectivity = Connectivity::new(true);
    let shell = vec!["/app-shell.html".to_string(), "/offline.html".to_string()];
    let engine = StrategyEngine::new(
      storage.clone(),
      network.clone(),
      PartitionSet::new("innkeep", "v1", &BTreeMap::new()),
      RouteTable::standard(&shell),
      connectivity.clone(),
    );
    let replayer = Arc::new(HttpReplayer::new(network.clone()));
    let config = QueueConfig {
      retry_backoff_secs: 0,
      ..QueueConfig::default()
    };
    let queue = if queue_available {
      MutationQueue::new(SqliteQueueStore::open_in_memory().unwrap(), replayer, &config)
    } else {
      MutationQueue::unavailable(replayer, &config)
    };
    let interceptor = Interceptor::new(engine, queue, network.clone(), connectivity, base())
      .with_precache(shell)
      .with_offline_page("/offline.html");
    Harness {
      interceptor,
      network,
      storage,
    }
  }

  async fn running(network: MockNetwork) -> Harness {
    let h = build(network, true);
    h.interceptor.install().await.unwrap();
    h.interceptor.activate().unwrap();
    h
  }

  fn get(href: &str) -> Request {
    Request::resolve(Method::Get, &base(), href).unwrap()
  }

  fn post(href: &str, body: &str) -> Request {
    Request::resolve(Method::Post, &base(), href)
      .unwrap()
      .with_header("content-type", "application/json")
      .with_body(body)
  }

  #[tokio::test]
  async fn test_lifecycle_order_is_enforced() {
    let h = build(MockNetwork::ok("asset"), true);
    assert!(matches!(
      h.interceptor.handle(&get("/api/rooms")).await,
      Err(InterceptorError::InvalidState { state: Lifecycle::Installing, .. })
    ));
    assert!(h.interceptor.activate().is_err());

    let report = h.interceptor.install().await.unwrap();
    assert!(report.is_complete());
    assert_eq!(h.interceptor.lifecycle(), Lifecycle::Installed);
    assert!(h.interceptor.install().await.is_err());

    h.interceptor.activate().unwrap();
    assert_eq!(h.interceptor.lifecycle(), Lifecycle::Activated);

    h.interceptor.handle(&get("/api/rooms")).await.unwrap();
    assert_eq!(h.interceptor.lifecycle(), Lifecycle::Running);
  }

  #[tokio::test]
  async fn test_install_tolerates_unreachable_backend() {
    let h = build(MockNetwork::down(), true);
    let report = h.interceptor.install().await.unwrap();
    assert_eq!(report.failed.len(), 2);
    assert_eq!(h.interceptor.lifecycle(), Lifecycle::Installed);
  }

  #[tokio::test]
  async fn test_app_shell_served_from_precache_offline() {
    let h = running(MockNetwork::new(|req, _| {
      Ok(Response::new(200, format!("<html>{}</html>", req.path())))
    }))
    .await;
    h.interceptor.connectivity().set_online(false);

    let shell = h.interceptor.handle(&get("/app-shell.html").navigate()).await.unwrap();
    assert_eq!(shell.status, 200);
    assert_eq!(shell.text(), "<html>/app-shell.html</html>");
    assert!(shell.headers.get(fallback::SOURCE_HEADER).is_some());
  }

  #[tokio::test]
  async fn test_offline_navigation_gets_offline_page() {
    let h = running(MockNetwork::new(|req, _| {
      Ok(Response::new(200, format!("<html>{}</html>", req.path())))
    }))
    .await;
    h.interceptor.connectivity().set_online(false);

    let page = h.interceptor.handle(&get("/rooms/12").navigate()).await.unwrap();
    assert_eq!(page.text(), "<html>/offline.html</html>");
  }

  #[tokio::test]
  async fn test_offline_navigation_without_precache_gets_builtin_page() {
    let h = build(MockNetwork::down(), true);
    h.interceptor.install().await.unwrap();
    h.interceptor.activate().unwrap();

    let page = h.interceptor.handle(&get("/rooms/12").navigate()).await.unwrap();
    assert_eq!(page.status, 503);
    assert!(page.text().contains("You are offline"));
  }

  #[tokio::test]
  async fn test_offline_reads_without_cache() {
    let h = running(MockNetwork::ok("asset")).await;
    h.interceptor.connectivity().set_online(false);

    let data = h.interceptor.handle(&get("/api/availability")).await.unwrap();
    assert_eq!(data.status, 503);
    assert_eq!(data.json_body().unwrap(), json!({ "error": "offline", "offline": true }));

    let image = h.interceptor.handle(&get("/img/hero.png")).await.unwrap();
    assert_eq!(image.status, 503);
    assert_eq!(image.text(), "Service Unavailable");
  }

  #[tokio::test]
  async fn test_offline_read_served_from_cache() {
    let h = running(MockNetwork::ok("asset")).await;
    let request = get("/api/rooms");
    let partition = h.interceptor.engine().partitions().get(Category::Api).clone();
    h.storage
      .put(
        &partition,
        &CacheEntry {
          key: cache_key(&request),
          url: request.url.to_string(),
          response: Response::new(200, "[]"),
          cached_at: Utc::now(),
          default_ttl_secs: None,
        },
      )
      .unwrap();
    h.interceptor.connectivity().set_online(false);

    let rooms = h.interceptor.handle(&request).await.unwrap();
    assert_eq!(rooms.status, 200);
    assert_eq!(rooms.headers.get(fallback::SOURCE_HEADER), Some("offline"));
  }

  #[tokio::test]
  async fn test_offline_write_is_queued_without_network() {
    let h = running(MockNetwork::ok("asset")).await;
    let before = h.network.call_count();
    h.interceptor.connectivity().set_online(false);

    let response = h
      .interceptor
      .handle(&post("/api/bookings", "{\"room\":12}"))
      .await
      .unwrap();
    assert_eq!(response.status, 202);
    assert_eq!(response.headers.get(fallback::SYNC_HEADER), Some("pending"));
    let body = response.json_body().unwrap();
    assert_eq!(body["queued"], json!(true));
    assert_eq!(body["action"], json!("create_booking"));
    assert_eq!(h.network.call_count(), before);

    let items = h.interceptor.queue().list().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, body["id"].as_str().unwrap());
    assert_eq!(items[0].payload["method"], json!("POST"));
    assert_eq!(items[0].payload["body"], json!("{\"room\":12}"));
  }

  #[tokio::test]
  async fn test_transport_failure_queues_and_http_error_does_not() {
    let h = running(MockNetwork::new(|req, _| match req.method {
      Method::Post => Err(FetchError::Transport("connection reset".to_string())),
      Method::Patch => Ok(Response::new(409, "conflict")),
      _ => Ok(Response::new(200, "asset")),
    }))
    .await;

    let queued = h
      .interceptor
      .handle(&post("/api/payments/intent", "{}"))
      .await
      .unwrap();
    assert_eq!(queued.status, 202);
    assert_eq!(queued.json_body().unwrap()["action"], json!("payment_attempt"));

    let patch = Request::resolve(Method::Patch, &base(), "/api/bookings/7")
      .unwrap()
      .with_body("{}");
    let conflict = h.interceptor.handle(&patch).await.unwrap();
    assert_eq!(conflict.status, 409);
    assert_eq!(h.interceptor.queue().pending_count().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_unqueueable_writes_are_surfaced() {
    let h = running(MockNetwork::ok("asset")).await;
    h.interceptor.connectivity().set_online(false);

    let delete = Request::resolve(Method::Delete, &base(), "/api/bookings/7").unwrap();
    let response = h.interceptor.handle(&delete).await.unwrap();
    assert_eq!(response.status, 503);
    assert_eq!(response.json_body().unwrap()["queued"], json!(false));

    let degraded = build(MockNetwork::ok("asset"), false);
    degraded.interceptor.install().await.unwrap();
    degraded.interceptor.activate().unwrap();
    degraded.interceptor.connectivity().set_online(false);
    let response = degraded
      .interceptor
      .handle(&post("/api/bookings", "{}"))
      .await
      .unwrap();
    assert_eq!(response.status, 503);
    assert_eq!(response.json_body().unwrap()["queued"], json!(false));
  }

  #[tokio::test]
  async fn test_queued_write_replays_after_reconnect() {
    let h = running(MockNetwork::ok("{}")).await;
    h.interceptor.connectivity().set_online(false);
    h.interceptor
      .handle(&post("/api/bookings", "{\"room\":12}"))
      .await
      .unwrap();

    h.interceptor.connectivity().set_online(true);
    let report = h.interceptor.queue().drain().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(h.network.calls_to("/api/bookings"), 1);
    assert!(h.interceptor.queue().list().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_superseded_release_waits_for_views_and_requests() {
    let h = running(MockNetwork::ok("asset")).await;
    let view = h.interceptor.claim_view();
    h.interceptor.supersede().unwrap();
    assert_eq!(h.interceptor.lifecycle(), Lifecycle::Superseded);

    // Still serving its remaining view
    let response = h.interceptor.handle(&get("/api/rooms")).await.unwrap();
    assert_eq!(response.status, 200);
    assert!(!h.interceptor.is_discardable());

    drop(view);
    {
      let _pending = InFlight::enter(&h.interceptor.in_flight);
      assert!(!h.interceptor.is_discardable());
    }
    assert!(h.interceptor.is_discardable());
  }

  #[test]
  fn test_classify_write() {
    let req = |method, href: &str| Request::resolve(method, &base(), href).unwrap();
    assert_eq!(classify_write(&req(Method::Post, "/api/bookings")), Some(ActionKind::CreateBooking));
    assert_eq!(classify_write(&req(Method::Post, "/api/bookings/")), Some(ActionKind::CreateBooking));
    assert_eq!(classify_write(&req(Method::Put, "/api/bookings/7")), Some(ActionKind::UpdateBooking));
    assert_eq!(classify_write(&req(Method::Patch, "/api/bookings/7")), Some(ActionKind::UpdateBooking));
    assert_eq!(classify_write(&req(Method::Post, "/api/payments")), Some(ActionKind::PaymentAttempt));
    assert_eq!(classify_write(&req(Method::Post, "/api/payments/intent")), Some(ActionKind::PaymentAttempt));
    assert_eq!(classify_write(&req(Method::Put, "/api/bookings")), None);
    assert_eq!(classify_write(&req(Method::Delete, "/api/bookings/7")), None);
    assert_eq!(classify_write(&req(Method::Post, "/api/paymentsx")), None);
    assert_eq!(classify_write(&req(Method::Post, "/api/newsletter")), None);
  }
}
