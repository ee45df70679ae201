//! Handler registry (spec §4.1, C1).
//!
//! A handler is any type that knows its own `kind()` and how to execute
//! itself against a [`WorkerContext`]. The registry stores, per kind, a
//! factory capable of producing a fresh instance deserialized from a
//! claimed row's JSON payload — never the registered prototype itself,
//! since two claims of the same kind must never share state.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::DeserializationError;

/// Everything the worker loop needs to execute a claimed job.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub job_id: crate::job::JobId,
    pub attempt: i32,
    pub max_attempts: i32,
    pub instance_id: String,
    pub worker_id: String,
    pub cancellation: tokio_util::sync::CancellationToken,
}

impl WorkerContext {
    /// True once the caller has asked worker loops to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// The handler contract external job authors implement.
#[async_trait]
pub trait Handler: Send + Sync {
    /// The discriminator routing a payload to this handler. Stable across releases.
    fn kind(&self) -> &'static str;

    /// Run the job. An `Err` is recorded on the row as `last_error` and retried
    /// or terminalized per `max_attempts`; it is never surfaced to the enqueuer.
    async fn execute(&self, ctx: WorkerContext) -> anyhow::Result<()>;
}

type HandlerFactory = Arc<dyn Fn(Value) -> Result<Box<dyn Handler>, DeserializationError> + Send + Sync>;

/// Read-mostly map from kind string to handler factory.
///
/// Registration is expected once, at startup, before the dispatcher starts
/// worker loops; lookups happen on every claim. `DashMap` gives cheap
/// concurrent reads without a global lock, matching the "reads vastly more
/// frequent than writes" expectation from spec §4.1.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    factories: Arc<DashMap<String, HandlerFactory>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler type, using `prototype` only to read its `kind()`
    /// and to pin the concrete type `H` for the stored factory. Last writer
    /// for a given kind wins.
    pub fn register<H>(&self, prototype: H)
    where
        H: Handler + DeserializeOwned + 'static,
    {
        let kind = prototype.kind().to_string();
        drop(prototype);
        let factory: HandlerFactory = Arc::new(move |payload: Value| {
            let handler: H = serde_json::from_value(payload).map_err(|source| DeserializationError {
                kind: std::any::type_name::<H>().to_string(),
                source,
            })?;
            Ok(Box::new(handler) as Box<dyn Handler>)
        });
        self.factories.insert(kind, factory);
    }

    /// Produce a fresh handler instance for `kind`, deserializing `payload` into it.
    /// Returns `None` if no handler is registered for `kind` (spec: `UnknownKind`).
    pub fn lookup(&self, kind: &str, payload: Value) -> Option<Result<Box<dyn Handler>, DeserializationError>> {
        self.factories.get(kind).map(|factory| factory(payload))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    #[async_trait]
    impl Handler for Ping {
        fn kind(&self) -> &'static str {
            "ping"
        }

        async fn execute(&self, _ctx: WorkerContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn register_and_lookup_roundtrips_payload() {
        let registry = HandlerRegistry::new();
        registry.register(Ping { n: 0 });

        let payload = serde_json::json!({ "n": 7 });
        let handler = registry.lookup("ping", payload).unwrap().unwrap();
        assert_eq!(handler.kind(), "ping");
    }

    #[test]
    fn lookup_unknown_kind_is_none() {
        let registry = HandlerRegistry::new();
        assert!(registry.lookup("nope", serde_json::json!({})).is_none());
    }

    #[test]
    fn second_registration_of_same_kind_replaces_first() {
        let registry = HandlerRegistry::new();
        registry.register(Ping { n: 0 });
        registry.register(Ping { n: 0 });
        assert!(registry.contains("ping"));
    }
}
