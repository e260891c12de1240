//! Background workers: periodic sweep, queue drains and the reachability
//! probe.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::StrategyEngine;
use crate::connectivity::Connectivity;
use crate::net::{Method, Network, Request};
use crate::queue::MutationQueue;

/// Intervals for the workers. Zero disables a worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
  pub sweep_interval: Duration,
  pub drain_interval: Duration,
  pub probe_interval: Duration,
  /// Endpoint probed for reachability
  pub health_url: Option<Url>,
}

/// Handles to the running workers.
pub struct Workers {
  shutdown: watch::Sender<bool>,
  handles: Vec<JoinHandle<()>>,
}

impl Workers {
  pub fn spawn(
    engine: StrategyEngine,
    queue: MutationQueue,
    connectivity: Connectivity,
    network: Arc<dyn Network>,
    settings: WorkerSettings,
  ) -> Self {
    let (shutdown, _) = watch::channel(false);
    let mut handles = Vec::new();

    if !settings.sweep_interval.is_zero() {
      handles.push(tokio::spawn(sweep_loop(
        engine,
        settings.sweep_interval,
        shutdown.subscribe(),
      )));
    }

    handles.push(tokio::spawn(drain_loop(
      queue,
      connectivity.clone(),
      settings.drain_interval,
      shutdown.subscribe(),
    )));

    if let Some(url) = settings.health_url {
      if !settings.probe_interval.is_zero() {
        handles.push(tokio::spawn(probe_loop(
          network,
          url,
          connectivity,
          settings.probe_interval,
          shutdown.subscribe(),
        )));
      }
    }

    debug!(workers = handles.len(), "workers started");
    Self { shutdown, handles }
  }

  /// Signal every worker and wait for them to stop.
  pub async fn shutdown(self) {
    let _ = self.shutdown.send(true);
    for handle in self.handles {
      if let Err(e) = handle.await {
        warn!(error = %e, "worker ended abnormally");
      }
    }
    info!("workers stopped");
  }
}

fn ticker(period: Duration) -> tokio::time::Interval {
  let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
  interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
  interval
}

async fn sweep_loop(engine: StrategyEngine, period: Duration, mut shutdown: watch::Receiver<bool>) {
  let mut interval = ticker(period);
  loop {
    tokio::select! {
      _ = interval.tick() => {
        let engine = engine.clone();
        match tokio::task::spawn_blocking(move || engine.sweep()).await {
          Ok(Ok(_)) => {}
          Ok(Err(e)) => warn!(error = %e, "cache sweep failed"),
          Err(e) => warn!(error = %e, "cache sweep panicked"),
        }
      }
      _ = shutdown.changed() => break,
    }
  }
}

/// Drains on a timer while online and immediately on every transition to
/// online.
async fn drain_loop(
  queue: MutationQueue,
  connectivity: Connectivity,
  period: Duration,
  mut shutdown: watch::Receiver<bool>,
) {
  let mut online = connectivity.subscribe();
  let mut interval = (!period.is_zero()).then(|| ticker(period));

  if connectivity.is_online() {
    drain_logged(&queue).await;
  }

  loop {
    tokio::select! {
      _ = next_tick(&mut interval) => {
        if connectivity.is_online() {
          drain_logged(&queue).await;
        }
      }
      changed = online.changed() => {
        if changed.is_err() {
          break;
        }
        let now_online = *online.borrow_and_update();
        if now_online {
          info!("back online, replaying queued writes");
          drain_logged(&queue).await;
        }
      }
      _ = shutdown.changed() => break,
    }
  }
}

/// Waits for the next tick, or forever without an interval.
async fn next_tick(interval: &mut Option<tokio::time::Interval>) {
  match interval {
    Some(interval) => {
      interval.tick().await;
    }
    None => std::future::pending().await,
  }
}

async fn drain_logged(queue: &MutationQueue) {
  if let Err(e) = queue.drain().await {
    warn!(error = %e, "queue drain failed");
  }
}

async fn probe_loop(
  network: Arc<dyn Network>,
  url: Url,
  connectivity: Connectivity,
  period: Duration,
  mut shutdown: watch::Receiver<bool>,
) {
  let mut interval = ticker(period);
  loop {
    tokio::select! {
      _ = interval.tick() => {
        connectivity.set_online(probe(network.as_ref(), &url).await);
      }
      _ = shutdown.changed() => break,
    }
  }
}

/// True if the backend answered at all. Any HTTP status counts as reachable.
pub async fn probe(network: &dyn Network, url: &Url) -> bool {
  let request = Request::new(Method::Head, url.clone());
  match network.fetch(&request).await {
    Ok(response) => {
      debug!(url = %url, status = response.status, "reachability probe");
      true
    }
    Err(e) => {
      debug!(url = %url, error = %e, "reachability probe failed");
      false
    }
  }
}
