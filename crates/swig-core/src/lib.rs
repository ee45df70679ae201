//! # swig-core
//!
//! The distributed dispatch and lifecycle engine of a durable, Postgres-backed
//! job queue: the transactional enqueue/claim/complete protocol, the
//! priority-aware concurrency-safe claim algorithm, the notification +
//! polling wake-up pipeline, single-leader recovery, and graceful shutdown.
//!
//! This crate is driver-agnostic: it depends only on [`JobStoreContract`],
//! not on any particular SQL client. `swig-postgres` provides the production
//! implementation; `swig-testing` provides an in-memory one for fast policy
//! tests.
//!
//! ## Example
//!
//! ```ignore
//! use swig_core::{Dispatcher, HandlerRegistry, QueueConfig, EnqueueOptions};
//! use std::sync::Arc;
//!
//! let registry = HandlerRegistry::new();
//! registry.register(SendEmail::default());
//!
//! let dispatcher = Dispatcher::new(
//!     Arc::new(store),
//!     vec![QueueConfig::new("default", 3), QueueConfig::new("priority", 3)],
//!     registry,
//! );
//! dispatcher.start().await?;
//! dispatcher.enqueue(&SendEmail { to: "a@x".into() }, EnqueueOptions::default()).await?;
//! dispatcher.stop().await?;
//! ```

mod barrier;
mod dispatcher;
mod error;
mod job;
mod leader;
mod registry;
mod shutdown;
mod store;
mod worker;

pub use dispatcher::{Dispatcher, DispatcherConfig, EnqueueHandler, QueueConfig, DEFAULT_LEADER_LOCK_KEY, NOTIFY_CHANNEL};
pub use error::{DeserializationError, FailureReason, Result, SwigError};
pub use job::{
    ClaimedJob, EnqueueOptions, JobId, JobNotification, JobRow, JobStatus, NewJob, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_PRIORITY, DEFAULT_QUEUE, PRIORITY_QUEUE,
};
pub use leader::{LeaderConfig, LeaderState, DEFAULT_LEADER_TTL_SECS, DEFAULT_RECOVERY_INTERVAL, DEFAULT_STALE_AFTER_SECS};
pub use registry::{Handler, HandlerRegistry, WorkerContext};
pub use store::{CallerTx, JobStoreContract};
pub use shutdown::DEFAULT_SHUTDOWN_TIMEOUT;

pub use async_trait::async_trait;
