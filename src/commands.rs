//! Subcommand implementations.

use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use innkeep::app::{App, Startup};
use innkeep::cache::StorageAlert;
use innkeep::config::Config;
use innkeep::net::{Method, Request};
use innkeep::queue::{QueueEvent, SyncItem};

use crate::{Command, QueueCommand};

pub async fn execute(command: Command, config: Config, offline: bool) -> Result<()> {
  match command {
    Command::Run => run(config, offline).await,
    Command::Fetch {
      url,
      method,
      data,
      headers,
      navigate,
    } => fetch(config, offline, &url, &method, data, &headers, navigate).await,
    Command::Precache { urls } => precache(config, offline, urls).await,
    Command::Sweep => sweep(config).await,
    Command::Quota => quota(config).await,
    Command::Queue { action } => queue(config, offline, action).await,
  }
}

/// Local-only commands never need the backend.
async fn local(config: Config) -> Result<App> {
  App::new(
    config,
    Startup {
      offline: true,
      precache: false,
    },
  )
  .await
}

async fn run(config: Config, offline: bool) -> Result<()> {
  let app = App::new(
    config,
    Startup {
      offline,
      precache: true,
    },
  )
  .await?;
  app.start().await?;
  let workers = app.spawn_workers()?;

  println!(
    "innkeep {} serving {} ({})",
    app.config.cache.version,
    app.config.backend.base_url,
    if app.connectivity.is_online() { "online" } else { "offline" }
  );

  let mut events = app.queue().subscribe();
  let mut alerts = app.engine().subscribe_alerts();
  let mut online = app.connectivity.subscribe();
  let ctrl_c = tokio::signal::ctrl_c();
  tokio::pin!(ctrl_c);

  loop {
    tokio::select! {
      event = events.recv() => match event {
        Ok(event) => print_event(&event),
        Err(RecvError::Lagged(n)) => warn!(skipped = n, "missed queue events"),
        Err(RecvError::Closed) => break,
      },
      alert = alerts.recv() => match alert {
        Ok(alert) => print_alert(&alert),
        Err(RecvError::Lagged(n)) => warn!(skipped = n, "missed storage alerts"),
        Err(RecvError::Closed) => break,
      },
      changed = online.changed() => {
        if changed.is_err() {
          break;
        }
        let now_online = *online.borrow_and_update();
        println!("{}", if now_online { "back online" } else { "offline" });
      }
      _ = &mut ctrl_c => break,
    }
  }

  workers.shutdown().await;
  app.engine().settle().await;
  Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn fetch(
  config: Config,
  offline: bool,
  url: &str,
  method: &str,
  data: Option<String>,
  headers: &[String],
  navigate: bool,
) -> Result<()> {
  let app = App::new(
    config,
    Startup {
      offline,
      precache: false,
    },
  )
  .await?;
  app.start().await?;

  let method = Method::parse(method).ok_or_else(|| eyre!("Unsupported method: {}", method))?;
  let base = app.config.base_url()?;
  let mut request =
    Request::resolve(method, &base, url).map_err(|e| eyre!("Invalid URL {}: {}", url, e))?;
  for header in headers {
    let (name, value) = header
      .split_once(':')
      .ok_or_else(|| eyre!("Header must look like 'name: value': {}", header))?;
    request.headers.insert(name.trim(), value.trim());
  }
  if let Some(body) = data {
    request = request.with_body(body);
  }
  if navigate {
    request = request.navigate();
  }

  let response = app.interceptor.handle(&request).await?;
  // Let background revalidation finish before the process exits
  app.engine().settle().await;

  let mut out = std::io::stdout().lock();
  writeln!(out, "HTTP {}", response.status)?;
  for (name, value) in response.headers.iter() {
    writeln!(out, "{}: {}", name, value)?;
  }
  writeln!(out)?;
  out.write_all(&response.body)?;
  if !response.body.ends_with(b"\n") {
    writeln!(out)?;
  }
  Ok(())
}

async fn precache(config: Config, offline: bool, urls: Vec<String>) -> Result<()> {
  let app = App::new(
    config,
    Startup {
      offline,
      precache: false,
    },
  )
  .await?;
  let urls = if urls.is_empty() {
    app.config.cache.precache.clone()
  } else {
    urls
  };

  let base = app.config.base_url()?;
  let report = app.engine().precache(&base, &urls).await;
  for href in &report.stored {
    println!("stored  {}", href);
  }
  for (href, error) in &report.failed {
    println!("failed  {} ({})", href, error);
  }

  if report.is_complete() {
    Ok(())
  } else {
    Err(eyre!("{} of {} assets could not be pre-cached", report.failed.len(), urls.len()))
  }
}

async fn sweep(config: Config) -> Result<()> {
  let app = local(config).await?;
  let report = app.engine().sweep()?;
  println!(
    "removed {} expired and {} overflowing entries",
    report.expired, report.trimmed
  );
  Ok(())
}

async fn quota(config: Config) -> Result<()> {
  let app = local(config).await?;
  let estimate = app.engine().estimate()?;
  println!(
    "used {} of {} bytes ({:.1}%)",
    estimate.used,
    estimate.used.saturating_add(estimate.available),
    estimate.percentage
  );
  for partition in app.engine().partitions().iter() {
    println!(
      "  {:<24} max {:>4} entries, {:>8}s{}",
      partition.name,
      partition.limits.max_entries,
      partition.limits.max_age_secs,
      if partition.limits.purge_on_quota_error { "" } else { ", protected" }
    );
  }
  Ok(())
}

async fn queue(config: Config, offline: bool, action: QueueCommand) -> Result<()> {
  match action {
    QueueCommand::List => {
      let app = local(config).await?;
      let items = app.queue().list()?;
      if items.is_empty() {
        println!("no queued writes");
      }
      for item in &items {
        print_item(item);
      }
    }
    QueueCommand::Drain => {
      let app = App::new(
        config,
        Startup {
          offline,
          precache: false,
        },
      )
      .await?;
      if !app.connectivity.is_online() {
        return Err(eyre!("Backend unreachable, nothing replayed"));
      }
      let report = app.queue().drain().await?;
      println!(
        "succeeded {}, retrying {}, failed {}, deferred {}",
        report.succeeded, report.retrying, report.failed, report.deferred
      );
    }
    QueueCommand::Retry { id } => {
      let app = local(config).await?;
      let item = app.queue().retry(&id)?;
      print_item(&item);
    }
    QueueCommand::Dismiss { id } => {
      let app = local(config).await?;
      app.queue().dismiss(&id)?;
      println!("dismissed {}", id);
    }
  }
  Ok(())
}

fn print_item(item: &SyncItem) {
  println!(
    "{}  {:<15} {:<7} {}/{}  {}{}",
    item.id,
    item.action.as_str(),
    item.status.as_str(),
    item.retry_count,
    item.max_retries,
    item.timestamp.format("%Y-%m-%d %H:%M:%S"),
    item
      .last_error
      .as_ref()
      .map(|e| format!("  ({})", e))
      .unwrap_or_default()
  );
}

fn print_event(event: &QueueEvent) {
  match event {
    QueueEvent::Enqueued { id, action } => println!("queued     {} {}", action, id),
    QueueEvent::Retrying {
      id,
      action,
      retry_count,
      error,
    } => println!("retrying   {} {} (attempt {}: {})", action, id, retry_count, error),
    QueueEvent::Succeeded { id, action } => println!("synced     {} {}", action, id),
    QueueEvent::FailedPermanently { id, action, reason } => {
      println!("failed     {} {} ({})", action, id, reason)
    }
  }
}

fn print_alert(alert: &StorageAlert) {
  match alert {
    StorageAlert::Purged { partition, removed } => {
      println!("storage    purged {} ({} entries)", partition, removed)
    }
    StorageAlert::NeedsAttention { partition, reason } => {
      println!("storage    {} needs attention: {}", partition, reason)
    }
  }
}
