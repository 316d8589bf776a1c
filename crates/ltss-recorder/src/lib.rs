//! The write pipeline: a single writer thread fed by a FIFO queue.
//!
//! [`Recorder::spawn`] starts the thread, which bootstraps a store session
//! through a [`Connector`](ltss_core::store::Connector) and then writes one
//! sample per queued event. Producers call [`Recorder::record`] from any
//! thread or task; it never blocks.

mod error;
mod recorder;
mod state;
mod worker;

#[cfg(test)]
mod tests;

pub use self::{
  error::{Error, Result},
  recorder::{Admission, Discard, Recorder},
  state::{PipelineState, RecorderStats, RetryPolicy},
};
