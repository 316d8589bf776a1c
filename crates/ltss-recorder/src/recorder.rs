//! Producer-side handle and the ingestion adapter.

use std::{
  sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc},
  thread::{self, JoinHandle},
};

use chrono::{DateTime, Utc};
use ltss_core::{
  entity::EntityId,
  event::{NewState, STATE_UNKNOWN, StateChangedEvent},
  filter::EntityFilter,
  store::Connector,
};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, trace};

use crate::{
  Error, Result,
  state::{Counters, PipelineState, RecorderStats, RetryPolicy},
  worker::Worker,
};

/// Queue entry. `Stop` is the shutdown sentinel.
pub(crate) enum Message {
  Record(QueuedEvent),
  Stop,
}

/// An event that passed the adapter; the sample itself is built on the
/// writer thread, once the schema mode is known.
pub(crate) struct QueuedEvent {
  pub entity_id: EntityId,
  pub time:      DateTime<Utc>,
  pub state:     NewState,
}

/// What [`Recorder::record`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
  Enqueued,
  Discarded(Discard),
}

/// Why an event never reached the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
  /// The entity was removed.
  NoState,
  UnknownState,
  InvalidEntityId,
  /// Rejected by the include/exclude filter.
  Excluded,
}

/// Handle to a running write pipeline. Cheap to share behind an `Arc`.
pub struct Recorder {
  queue:    mpsc::Sender<Message>,
  filter:   EntityFilter,
  state:    watch::Receiver<PipelineState>,
  startup:  Mutex<Option<oneshot::Receiver<bool>>>,
  counters: Arc<Counters>,
  worker:   Mutex<Option<JoinHandle<()>>>,
}

impl Recorder {
  /// Start the writer thread. It begins bootstrapping immediately; events
  /// may be recorded before it is ready and are written once it is.
  pub fn spawn<C: Connector>(
    connector: C,
    filter: EntityFilter,
    policy: RetryPolicy,
  ) -> Result<Self> {
    let (queue, inbox) = mpsc::channel();
    let (state_tx, state) = watch::channel(PipelineState::Connecting);
    let (startup_tx, startup) = oneshot::channel();
    let counters = Arc::new(Counters::default());

    let worker = Worker::new(connector, policy, inbox, state_tx, Arc::clone(&counters));
    let handle = thread::Builder::new()
      .name("ltss-writer".to_string())
      .spawn(move || worker.run(startup_tx))
      .map_err(Error::Spawn)?;

    Ok(Self {
      queue,
      filter,
      state,
      startup: Mutex::new(Some(startup)),
      counters,
      worker: Mutex::new(Some(handle)),
    })
  }

  /// Resolves to `true` once the store is bootstrapped and samples are being
  /// written, or `false` if bootstrap gave up.
  pub async fn ready(&self) -> bool {
    let startup = lock(&self.startup).take();
    if let Some(startup) = startup {
      return startup.await.unwrap_or(false);
    }
    let mut state = self.state.clone();
    state
      .wait_for(|s| *s != PipelineState::Connecting)
      .await
      .is_ok_and(|s| *s == PipelineState::Ready)
  }

  pub fn state(&self) -> PipelineState { *self.state.borrow() }

  pub fn stats(&self) -> RecorderStats { self.counters.snapshot() }

  /// Filter and enqueue one event.
  ///
  /// Fails only when the writer thread has already exited.
  pub fn record(&self, event: StateChangedEvent) -> Result<Admission> {
    let queued = match self.admit(event) {
      Ok(queued) => queued,
      Err(discard) => {
        Counters::bump(&self.counters.rejected);
        return Ok(Admission::Discarded(discard));
      }
    };

    self
      .queue
      .send(Message::Record(queued))
      .map_err(|_| Error::Closed)?;
    Counters::bump(&self.counters.enqueued);
    Ok(Admission::Enqueued)
  }

  fn admit(&self, event: StateChangedEvent) -> Result<QueuedEvent, Discard> {
    let Some(state) = event.new_state else {
      return Err(Discard::NoState);
    };
    if state.state == STATE_UNKNOWN {
      return Err(Discard::UnknownState);
    }
    let entity_id = match EntityId::parse(&event.entity_id) {
      Ok(id) => id,
      Err(e) => {
        debug!(entity_id = %event.entity_id, error = %e, "discarding event");
        return Err(Discard::InvalidEntityId);
      }
    };
    if !self.filter.allows(&entity_id) {
      trace!(%entity_id, "entity excluded by filter");
      return Err(Discard::Excluded);
    }
    Ok(QueuedEvent {
      entity_id,
      time: event.time_fired,
      state,
    })
  }

  /// Enqueue the shutdown sentinel without waiting. Events recorded after
  /// this are accepted but never written.
  pub fn stop(&self) {
    if self.queue.send(Message::Stop).is_err() {
      debug!("writer thread already exited");
    }
  }

  /// Enqueue the sentinel and block until the writer thread has written
  /// everything queued before it and released its connection.
  pub fn shutdown(&self) {
    self.stop();
    let handle = lock(&self.worker).take();
    if let Some(handle) = handle
      && handle.join().is_err()
    {
      error!("writer thread panicked");
    }
  }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }
