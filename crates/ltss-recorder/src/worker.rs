//! The writer thread.

use std::{
  sync::{Arc, mpsc},
  thread,
};

use ltss_core::{
  sample::{SchemaMode, StateSample},
  store::{Connector, Session, WriteOutcome},
};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::{
  recorder::{Message, QueuedEvent},
  state::{Counters, PipelineState, RetryPolicy},
};

/// Message surfaced when bootstrap gives up.
const STARTUP_FAILED: &str = "LTSS could not start, please check the log";

pub(crate) struct Worker<C> {
  connector: C,
  policy:    RetryPolicy,
  inbox:     mpsc::Receiver<Message>,
  state:     watch::Sender<PipelineState>,
  counters:  Arc<Counters>,
}

impl<C: Connector> Worker<C> {
  pub fn new(
    connector: C,
    policy: RetryPolicy,
    inbox: mpsc::Receiver<Message>,
    state: watch::Sender<PipelineState>,
    counters: Arc<Counters>,
  ) -> Self {
    Self { connector, policy, inbox, state, counters }
  }

  pub fn run(mut self, startup: oneshot::Sender<bool>) {
    let Some(mut session) = self.connect() else {
      error!("{STARTUP_FAILED}");
      self.state.send_replace(PipelineState::Failed);
      // The receiver may be gone if nobody awaited startup.
      let _ = startup.send(false);
      return;
    };

    let mode = session.mode();
    self.state.send_replace(PipelineState::Ready);
    let _ = startup.send(true);
    info!(location = mode.location, "recorder ready");

    // Ends at the sentinel, or when every producer handle is gone.
    while let Ok(Message::Record(event)) = self.inbox.recv() {
      self.process(&mut session, mode, event);
    }

    self.state.send_replace(PipelineState::Draining);
    session.close();
    self.state.send_replace(PipelineState::Stopped);
    info!("recorder stopped");
  }

  fn connect(&mut self) -> Option<C::Session> {
    let attempts = self.policy.attempts();
    for attempt in 1..=attempts {
      match self.connector.connect() {
        Ok(session) => return Some(session),
        Err(e) => {
          warn!(attempt, attempts, wait = ?self.policy.wait, error = %e, "failed to connect to the database");
          if attempt < attempts {
            thread::sleep(self.policy.wait);
          }
        }
      }
    }
    None
  }

  fn process(&self, session: &mut C::Session, mode: SchemaMode, event: QueuedEvent) {
    let sample = match StateSample::from_state(event.entity_id, event.time, &event.state, mode) {
      Ok(sample) => sample,
      Err(e) => {
        warn!(error = %e, "dropping sample with unstorable attributes");
        Counters::bump(&self.counters.dropped);
        return;
      }
    };

    match self.write(session, &sample) {
      Some(WriteOutcome::Inserted) => Counters::bump(&self.counters.written),
      Some(WriteOutcome::Duplicate) => {
        debug!(entity_id = %sample.entity_id, time = %sample.time, "sample already stored");
        Counters::bump(&self.counters.duplicates);
      }
      None => Counters::bump(&self.counters.dropped),
    }
  }

  /// Transient failures are retried up to the policy limit; anything else
  /// drops the sample at once.
  fn write(&self, session: &mut C::Session, sample: &StateSample) -> Option<WriteOutcome> {
    let attempts = self.policy.attempts();
    for attempt in 1..=attempts {
      match session.write(sample) {
        Ok(outcome) => return Some(outcome),
        Err(e) if e.is_transient() => {
          warn!(attempt, attempts, entity_id = %sample.entity_id, error = %e, "write failed");
          if attempt < attempts {
            thread::sleep(self.policy.wait);
          }
        }
        Err(e) => {
          error!(
            entity_id = %sample.entity_id,
            time = %sample.time,
            state = %sample.state,
            error = %e,
            "dropping sample after database error"
          );
          return None;
        }
      }
    }
    error!(
      entity_id = %sample.entity_id,
      time = %sample.time,
      attempts,
      "dropping sample after repeated connectivity failures"
    );
    None
  }
}
