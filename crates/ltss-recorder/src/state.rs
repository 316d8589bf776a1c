use std::{
  sync::atomic::{AtomicU64, Ordering},
  time::Duration,
};

use serde::{Deserialize, Serialize};

/// Lifecycle of the writer thread.
///
/// `Connecting → Ready → Draining → Stopped`, or `Connecting → Failed` when
/// the store never came up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
  Connecting,
  Ready,
  Draining,
  Stopped,
  Failed,
}

/// Bounded retry with a fixed pause, used both for bootstrap and for each
/// individual write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub wait:         Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 10,
      wait:         Duration::from_secs(3),
    }
  }
}

impl RetryPolicy {
  pub(crate) fn attempts(&self) -> u32 { self.max_attempts.max(1) }
}

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderStats {
  /// Events accepted onto the queue.
  pub enqueued:   u64,
  /// Samples committed.
  pub written:    u64,
  /// Samples whose `(time, entity_id)` was already stored.
  pub duplicates: u64,
  /// Samples given up on after dequeue.
  pub dropped:    u64,
  /// Events discarded before reaching the queue.
  pub rejected:   u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
  pub enqueued:   AtomicU64,
  pub written:    AtomicU64,
  pub duplicates: AtomicU64,
  pub dropped:    AtomicU64,
  pub rejected:   AtomicU64,
}

impl Counters {
  pub fn bump(counter: &AtomicU64) { counter.fetch_add(1, Ordering::Relaxed); }

  pub fn snapshot(&self) -> RecorderStats {
    RecorderStats {
      enqueued:   self.enqueued.load(Ordering::Relaxed),
      written:    self.written.load(Ordering::Relaxed),
      duplicates: self.duplicates.load(Ordering::Relaxed),
      dropped:    self.dropped.load(Ordering::Relaxed),
      rejected:   self.rejected.load(Ordering::Relaxed),
    }
  }
}
