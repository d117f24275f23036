//! Transfer Core Library
//!
//! A concurrent, resumable multi-download engine. It schedules many HTTP(S)
//! transfers with a bounded number running at once, fetches byte ranges so
//! that interrupted transfers resume where they stopped, persists progress
//! crash-safely and reports every state change to subscribers.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`db`] - Database connection and schema management
//! - [`store`] - Durable transfer records and completed byte ranges
//! - [`fetch`] - Range-aware HTTP fetching with pause/cancel and checkpoints
//! - [`retry`] - Backoff decisions for failed attempts
//! - [`scheduler`] - Admission, lifecycle and retries with bounded concurrency
//! - [`events`] - Lifecycle and progress event fan-out
//! - [`config`] - TOML configuration
//! - [`engine`] - Assembly of all of the above
//!
//! ```no_run
//! # async fn demo() -> Result<(), transfer_core::EngineError> {
//! use transfer_core::{Engine, EngineConfig};
//!
//! let engine = Engine::open(EngineConfig::default()).await?;
//! let mut events = engine.subscribe();
//! engine.start().await;
//! let id = engine.submit("https://example.com/file.iso", None).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # let _ = id;
//! # Ok(())
//! # }
//! ```

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod fetch;
pub mod retry;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig, RetryConfig};
pub use db::{Database, DatabaseOptions, DbError};
pub use engine::Engine;
pub use error::EngineError;
pub use events::{EventBus, Subscription, TransferEvent};
pub use fetch::{
    FailureClass, FetchError, FetchOptions, FetchOutcome, HttpClient, ProgressSink, RangeFetcher,
    StopReason, StopSignal,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{DEFAULT_MAX_CONCURRENT, TaskScheduler};
pub use store::{
    ListOrder, RangeSet, StoreError, Transfer, TransferFilter, TransferId, TransferRepository,
    TransferStatus, TransferStore,
};
