//! Transition events and observers for watching runs.
//!
//! One event is emitted per step status change, after the change has been
//! saved to the snapshot store. Observers get a read-only copy of the state
//! map, so they can persist it, stream it to a UI, or ignore it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use spindle_store::{RunStatus, StepRecord, StepStatus};
use tokio::sync::mpsc;

/// A step status transition within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
  pub run_id: String,
  pub workflow_id: String,
  /// Path of the step that changed.
  pub path: String,
  /// Its new status.
  pub status: StepStatus,
  pub run_status: RunStatus,
  /// Paths running or suspended after this transition.
  pub active_paths: Vec<String>,
  /// Per-step state map after this transition.
  pub context: BTreeMap<String, StepRecord>,
}

/// Receives transition events.
///
/// Called inline by the engine; implementations should return quickly and
/// hand heavy work to a channel or task.
pub trait RunObserver: Send + Sync {
  fn notify(&self, event: &WatchEvent);
}

impl<F> RunObserver for F
where
  F: Fn(&WatchEvent) + Send + Sync,
{
  fn notify(&self, event: &WatchEvent) {
    self(event)
  }
}

/// An observer that forwards events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
  // Unbounded so a slow consumer never stalls execution. Volume is one event
  // per step transition.
  sender: mpsc::UnboundedSender<WatchEvent>,
}

impl ChannelObserver {
  pub fn new(sender: mpsc::UnboundedSender<WatchEvent>) -> Self {
    Self { sender }
  }

  /// Create an observer together with the receiving end of its channel.
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<WatchEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Self::new(sender), receiver)
  }
}

impl RunObserver for ChannelObserver {
  fn notify(&self, event: &WatchEvent) {
    // The receiver may have been dropped.
    let _ = self.sender.send(event.clone());
  }
}

/// Handle returned by `watch`, used to stop watching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

/// Observers registered on a run handle.
#[derive(Default)]
pub(crate) struct Watchers {
  next_id: AtomicU64,
  entries: RwLock<Vec<(WatchId, Arc<dyn RunObserver>)>>,
}

impl Watchers {
  pub(crate) fn add(&self, observer: Arc<dyn RunObserver>) -> WatchId {
    let id = WatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
    self
      .entries
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .push((id, observer));
    id
  }

  pub(crate) fn remove(&self, id: WatchId) -> bool {
    let mut entries = self
      .entries
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    let before = entries.len();
    entries.retain(|(entry, _)| *entry != id);
    entries.len() != before
  }

  pub(crate) fn is_empty(&self) -> bool {
    self
      .entries
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .is_empty()
  }

  pub(crate) fn emit(&self, event: &WatchEvent) {
    // Snapshot the list so an observer can watch or unwatch from its callback.
    let observers: Vec<_> = self
      .entries
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .iter()
      .map(|(_, observer)| observer.clone())
      .collect();
    for observer in observers {
      observer.notify(event);
    }
  }
}
