#![deny(missing_docs)]
//! The opaque message bus (§6): four emit-only topics the core produces
//! onto, plus one reserved dead-letter topic. When no real bus is
//! configured, [`NoopBus`] is substituted with no semantic change other
//! than loss of external fan-out.

use async_trait::async_trait;
use tracing::warn;

/// Topic names the core produces onto.
pub mod topics {
    /// Consumed: triggers a submit when a request message arrives.
    pub const EXEC: &str = "persona.exec.v1";
    /// Produced: `{executionId, chunk, timestamp}` stdout/stderr chunks.
    pub const OUTPUT: &str = "persona.output.v1";
    /// Produced: completion and failure lifecycle records.
    pub const LIFECYCLE: &str = "persona.lifecycle.v1";
    /// Produced: worker-emitted persona events.
    pub const EVENTS: &str = "persona.events.v1";
    /// Reserved dead-letter topic.
    pub const DLQ: &str = "persona.dlq.v1";
}

/// A handler invoked for each message delivered on a subscribed topic.
#[async_trait]
pub trait BusHandler: Send + Sync {
    /// Handle one bus message.
    async fn handle(&self, topic: &str, key: Option<&str>, value: serde_json::Value);
}

/// The message bus contract (§6). `produce` is fire-and-forget: failures
/// are logged and never propagated to the caller.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Establish the underlying connection.
    async fn connect(&self);

    /// Tear down the underlying connection.
    async fn disconnect(&self);

    /// Register a handler for inbound messages. Implementations that
    /// don't support subscription (e.g. [`NoopBus`]) accept and ignore.
    async fn subscribe(&self, topic: &str, handler: std::sync::Arc<dyn BusHandler>);

    /// Emit a message onto `topic`, keyed by `key`. Never returns an
    /// error to the caller; failures are logged internally.
    async fn produce(&self, topic: &str, value: serde_json::Value, key: Option<&str>);
}

/// A no-op bus substituted when no real message bus is configured (§6).
#[derive(Default)]
pub struct NoopBus;

impl NoopBus {
    /// Construct a no-op bus.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MessageBus for NoopBus {
    async fn connect(&self) {}

    async fn disconnect(&self) {}

    async fn subscribe(&self, _topic: &str, _handler: std::sync::Arc<dyn BusHandler>) {}

    async fn produce(&self, topic: &str, _value: serde_json::Value, _key: Option<&str>) {
        warn!(topic, "produce called with no message bus configured; dropping");
    }
}
