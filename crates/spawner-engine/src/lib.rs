//! Process supervision engine.
//!
//! This crate contains the event-dispatch and supervision machinery:
//! the hierarchical [`EventEmitter`], the per-child process and stream
//! plumbing, the graceful-timeout tracker, the [`Manager`] loop thread,
//! and the [`Spawner`] convenience layer for test code.

pub mod api;
pub mod emitter;
pub mod manager;
mod process;
mod state;
mod stream;
mod tracker;

// Re-export commonly used types
pub use api::{SpawnGuard, Spawner};
pub use emitter::{EventEmitter, ListenerId, Publisher};
pub use manager::Manager;
pub use spawner_core::{Event, Future, ProcessConfig, Result, SpawnerError, StreamLabel, Topic};
