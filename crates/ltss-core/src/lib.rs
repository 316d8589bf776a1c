//! Core types and trait definitions for the long-term state store.
//!
//! This crate is deliberately free of HTTP and database dependencies. The
//! storage backend (`ltss-store-postgres`), the write pipeline
//! (`ltss-recorder`) and the host process (`ltss-server`) all depend on it.

pub mod entity;
pub mod error;
pub mod event;
pub mod filter;
pub mod fingerprint;
pub mod sample;
pub mod store;

pub use error::{Error, Result};
