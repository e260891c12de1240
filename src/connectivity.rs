//! Process-wide online/offline state as an owned, injectable object.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Connectivity state shared by the interceptor and the queue worker.
///
/// Cloning is cheap; all clones observe the same state. Transitions are
/// published to subscribers, repeated values are not.
#[derive(Clone, Debug)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  /// Initialize from the current reachability signal.
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record a reachability signal. Returns true if this was a transition.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      info!(online, "connectivity changed");
    }
    changed
  }

  /// Receiver that wakes on every transition.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}
