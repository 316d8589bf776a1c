use std::{
  collections::{HashSet, VecDeque},
  sync::{Arc, Mutex, mpsc},
  time::{Duration, Instant},
};

use chrono::{DateTime, TimeZone, Utc};
use ltss_core::{
  event::{NewState, StateChangedEvent},
  filter::{EntityFilter, FilterConfig},
  sample::{SchemaMode, StateSample},
  store::{Connector, Session, WriteError, WriteOutcome},
};
use serde_json::{Map, Value, json};

use crate::{Admission, Discard, Error, PipelineState, Recorder, RetryPolicy};

// ─── Fake store ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Fail {
  Transient,
  Permanent,
}

#[derive(Default)]
struct FakeStore {
  connect_failures: u32,
  connects:         u32,
  write_failures:   VecDeque<Fail>,
  write_attempts:   u32,
  stored:           HashSet<(String, DateTime<Utc>)>,
  written:          Vec<StateSample>,
  closed:           bool,
}

#[derive(Debug, thiserror::Error)]
#[error("database unreachable")]
struct Unreachable;

struct FakeConnector {
  store: Arc<Mutex<FakeStore>>,
  mode:  SchemaMode,
  /// Connect blocks until this fires, if set.
  gate:  Option<mpsc::Receiver<()>>,
}

impl Connector for FakeConnector {
  type Session = FakeSession;
  type Error = Unreachable;

  fn connect(&mut self) -> Result<FakeSession, Unreachable> {
    if let Some(gate) = self.gate.take() {
      gate.recv().ok();
    }
    let mut store = self.store.lock().unwrap();
    store.connects += 1;
    if store.connect_failures > 0 {
      store.connect_failures -= 1;
      return Err(Unreachable);
    }
    Ok(FakeSession { store: Arc::clone(&self.store), mode: self.mode })
  }
}

struct FakeSession {
  store: Arc<Mutex<FakeStore>>,
  mode:  SchemaMode,
}

impl Session for FakeSession {
  fn mode(&self) -> SchemaMode { self.mode }

  fn write(&mut self, sample: &StateSample) -> Result<WriteOutcome, WriteError> {
    let mut store = self.store.lock().unwrap();
    store.write_attempts += 1;
    match store.write_failures.pop_front() {
      Some(Fail::Transient) => return Err(WriteError::Transient("connection reset".into())),
      Some(Fail::Permanent) => return Err(WriteError::Permanent("invalid input syntax".into())),
      None => {}
    }
    if !store.stored.insert((sample.entity_id.to_string(), sample.time)) {
      return Ok(WriteOutcome::Duplicate);
    }
    store.written.push(sample.clone());
    Ok(WriteOutcome::Inserted)
  }

  fn close(self) { self.store.lock().unwrap().closed = true; }
}

struct Harness {
  store:    Arc<Mutex<FakeStore>>,
  recorder: Recorder,
}

impl Harness {
  fn start(store: FakeStore) -> Self { Self::with(store, EntityFilter::pass_all(), SchemaMode::default(), None) }

  fn with(
    store: FakeStore,
    filter: EntityFilter,
    mode: SchemaMode,
    gate: Option<mpsc::Receiver<()>>,
  ) -> Self {
    let store = Arc::new(Mutex::new(store));
    let connector = FakeConnector { store: Arc::clone(&store), mode, gate };
    let recorder = Recorder::spawn(connector, filter, no_wait()).unwrap();
    Self { store, recorder }
  }

  fn states(&self) -> Vec<String> {
    self.store.lock().unwrap().written.iter().map(|s| s.state.clone()).collect()
  }

  /// Block until the counters satisfy `done`, or fail after a few seconds.
  fn wait_for(&self, done: impl Fn(crate::RecorderStats) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(self.recorder.stats()) {
      assert!(Instant::now() < deadline, "timed out; stats = {:?}", self.recorder.stats());
      std::thread::sleep(Duration::from_millis(5));
    }
  }
}

fn no_wait() -> RetryPolicy { RetryPolicy { max_attempts: 10, wait: Duration::ZERO } }

fn event(entity: &str, secs: i64, state: Option<&str>) -> StateChangedEvent {
  event_with(entity, secs, state, json!({}))
}

fn event_with(entity: &str, secs: i64, state: Option<&str>, attributes: Value) -> StateChangedEvent {
  StateChangedEvent {
    entity_id:  entity.to_string(),
    new_state:  state.map(|s| NewState {
      state:      s.to_string(),
      attributes: attributes.as_object().cloned().unwrap_or_else(Map::new),
    }),
    time_fired: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
  }
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn writes_in_enqueue_order() {
  let h = Harness::start(FakeStore::default());
  assert!(h.recorder.ready().await);
  assert_eq!(h.recorder.state(), PipelineState::Ready);

  for i in 0..5 {
    let admission = h.recorder.record(event("sensor.power", i, Some(&i.to_string()))).unwrap();
    assert_eq!(admission, Admission::Enqueued);
  }
  h.recorder.shutdown();

  assert_eq!(h.states(), ["0", "1", "2", "3", "4"]);
  assert_eq!(h.recorder.state(), PipelineState::Stopped);
  assert!(h.store.lock().unwrap().closed);
  let stats = h.recorder.stats();
  assert_eq!((stats.enqueued, stats.written), (5, 5));
}

#[tokio::test]
async fn bootstrap_is_retried() {
  let h = Harness::start(FakeStore { connect_failures: 3, ..Default::default() });
  assert!(h.recorder.ready().await);
  assert_eq!(h.store.lock().unwrap().connects, 4);
  h.recorder.shutdown();
}

#[tokio::test]
async fn exhausted_bootstrap_fails_the_pipeline() {
  let h = Harness::start(FakeStore { connect_failures: 10, ..Default::default() });
  assert!(!h.recorder.ready().await);
  assert_eq!(h.recorder.state(), PipelineState::Failed);
  // Later callers see the same answer.
  assert!(!h.recorder.ready().await);

  h.recorder.shutdown();
  assert_eq!(h.store.lock().unwrap().connects, 10);
  assert!(matches!(h.recorder.record(event("sensor.a", 0, Some("1"))), Err(Error::Closed)));
}

#[tokio::test]
async fn events_recorded_during_bootstrap_are_written() {
  let (open, gate) = mpsc::channel();
  let h = Harness::with(FakeStore::default(), EntityFilter::pass_all(), SchemaMode::default(), Some(gate));

  h.recorder.record(event("sensor.a", 0, Some("early"))).unwrap();
  assert_eq!(h.recorder.state(), PipelineState::Connecting);
  open.send(()).unwrap();

  assert!(h.recorder.ready().await);
  h.recorder.shutdown();
  assert_eq!(h.states(), ["early"]);
}

#[test]
fn nothing_after_the_sentinel_is_written() {
  let (open, gate) = mpsc::channel();
  let h = Harness::with(FakeStore::default(), EntityFilter::pass_all(), SchemaMode::default(), Some(gate));

  for i in 0..3 {
    h.recorder.record(event("sensor.a", i, Some("before"))).unwrap();
  }
  h.recorder.stop();
  for i in 3..5 {
    assert_eq!(h.recorder.record(event("sensor.a", i, Some("after"))).unwrap(), Admission::Enqueued);
  }
  open.send(()).unwrap();
  h.recorder.shutdown();

  assert_eq!(h.states(), ["before", "before", "before"]);
  assert_eq!(h.store.lock().unwrap().write_attempts, 3);
  assert_eq!(h.recorder.state(), PipelineState::Stopped);
}

// ─── Write failures ──────────────────────────────────────────────────────────

#[tokio::test]
async fn exhausted_retries_drop_one_sample_and_keep_going() {
  let h = Harness::start(FakeStore {
    write_failures: std::iter::repeat_n(Fail::Transient, 11).collect(),
    ..Default::default()
  });
  assert!(h.recorder.ready().await);

  h.recorder.record(event("sensor.a", 0, Some("lost"))).unwrap();
  h.recorder.record(event("sensor.a", 1, Some("kept"))).unwrap();
  h.wait_for(|s| s.dropped == 1 && s.written == 1);

  assert_eq!(h.recorder.state(), PipelineState::Ready);
  assert_eq!(h.states(), ["kept"]);
  // Ten attempts for the first sample, two for the second.
  assert_eq!(h.store.lock().unwrap().write_attempts, 12);
  h.recorder.shutdown();
}

#[tokio::test]
async fn permanent_error_is_not_retried() {
  let h = Harness::start(FakeStore {
    write_failures: [Fail::Permanent].into(),
    ..Default::default()
  });
  assert!(h.recorder.ready().await);

  h.recorder.record(event("sensor.a", 0, Some("poisoned"))).unwrap();
  h.recorder.record(event("sensor.a", 1, Some("fine"))).unwrap();
  h.recorder.shutdown();

  assert_eq!(h.states(), ["fine"]);
  assert_eq!(h.store.lock().unwrap().write_attempts, 2);
  assert_eq!(h.recorder.stats().dropped, 1);
}

#[tokio::test]
async fn duplicates_are_counted_not_dropped() {
  let h = Harness::start(FakeStore::default());
  h.recorder.record(event("sensor.a", 0, Some("1"))).unwrap();
  h.recorder.record(event("sensor.a", 0, Some("2"))).unwrap();
  h.recorder.shutdown();

  let stats = h.recorder.stats();
  assert_eq!((stats.written, stats.duplicates, stats.dropped), (1, 1, 0));
}

#[tokio::test]
async fn unstorable_payload_drops_the_sample_before_writing() {
  let h = Harness::start(FakeStore::default());
  h.recorder
    .record(event_with("sensor.a", 0, Some("bad"), json!({"note": "a\u{0}b"})))
    .unwrap();
  h.recorder
    .record(event_with("sensor.a", 1, Some("good"), json!({"note": "ab"})))
    .unwrap();
  h.recorder.shutdown();

  assert_eq!(h.states(), ["good"]);
  assert_eq!(h.store.lock().unwrap().write_attempts, 1);
  assert_eq!(h.recorder.stats().dropped, 1);
}

// ─── Adapter ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn adapter_discards_before_enqueue() {
  let exclude = FilterConfig {
    domains:  ["switch".to_string()].into(),
    entities: Default::default(),
  };
  let filter = EntityFilter::new(&FilterConfig::default(), &exclude);
  let h = Harness::with(FakeStore::default(), filter, SchemaMode::default(), None);

  let cases = [
    (event("sensor.a", 0, None), Discard::NoState),
    (event("sensor.a", 1, Some("unknown")), Discard::UnknownState),
    (event("Not An Id", 2, Some("1")), Discard::InvalidEntityId),
    (event("switch.lamp", 3, Some("on")), Discard::Excluded),
  ];
  for (event, discard) in cases {
    assert_eq!(h.recorder.record(event).unwrap(), Admission::Discarded(discard));
  }
  assert_eq!(h.recorder.record(event("sensor.a", 4, Some("1"))).unwrap(), Admission::Enqueued);
  h.recorder.shutdown();

  let stats = h.recorder.stats();
  assert_eq!((stats.rejected, stats.enqueued), (4, 1));
  assert_eq!(h.states(), ["1"]);
}

#[tokio::test]
async fn schema_mode_comes_from_the_session() {
  let h = Harness::with(
    FakeStore::default(),
    EntityFilter::pass_all(),
    SchemaMode { location: true },
    None,
  );
  h.recorder
    .record(event_with(
      "device_tracker.phone",
      0,
      Some("home"),
      json!({"latitude": 52.5, "longitude": 13.4, "battery": 80}),
    ))
    .unwrap();
  h.recorder.shutdown();

  let store = h.store.lock().unwrap();
  let sample = &store.written[0];
  let location = sample.location.expect("location extracted");
  assert_eq!((location.latitude, location.longitude), (52.5, 13.4));
  let payload = &sample.attributes.as_ref().unwrap().payload;
  assert_eq!(payload.keys().collect::<Vec<_>>(), ["battery"]);
}
