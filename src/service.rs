//! The service facade: named messaging endpoint over a shared transport.
//!
//! A `Service` owns its command handler groups (one shared queue per routing
//! key), its broadcast state (one shared queue for all subscriptions), and
//! its RPC correlator. Create one per logical microservice identity; it
//! lives for the process lifetime.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::broadcast::BroadcastState;
use crate::completion::ErrorHook;
use crate::dispatch::{spawn_dispatch_loop, DispatchContext};
use crate::error::Result;
use crate::error_format::{default_error_formatter, ErrorFormatter};
use crate::group::HandlerGroup;
use crate::handler::Handler;
use crate::message::Headers;
use crate::routing::{validate, DeliveryMode};
use crate::transport::Transport;

/// Default deadline for synchronous sends.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Per-service configuration.
#[derive(Clone)]
pub struct ServiceConfig {
    /// Formats handler failures into RPC failure payloads.
    pub error_formatter: ErrorFormatter,
    /// Deadline for synchronous sends unless overridden per call.
    pub call_timeout: Duration,
    /// Observer for handler failures with no reply path. When absent,
    /// failures are logged in the dispatch task.
    pub on_handler_error: Option<ErrorHook>,
}

impl ServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with the bus configuration's call timeout applied, when set.
    pub fn from_bus(config: &crate::config::BusConfig) -> Self {
        let mut service_config = Self::default();
        if let Some(timeout) = config.call_timeout() {
            service_config.call_timeout = timeout;
        }
        service_config
    }

    pub fn with_error_formatter(mut self, formatter: ErrorFormatter) -> Self {
        self.error_formatter = formatter;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_handler_error_hook(mut self, hook: ErrorHook) -> Self {
        self.on_handler_error = Some(hook);
        self
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            error_formatter: default_error_formatter(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            on_handler_error: None,
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("call_timeout", &self.call_timeout)
            .field("has_error_hook", &self.on_handler_error.is_some())
            .finish()
    }
}

/// Options for [`Service::send_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Wait for a correlated reply.
    pub sync: bool,
    /// Deadline override for sync sends.
    pub timeout: Option<Duration>,
}

/// A named messaging endpoint.
pub struct Service {
    name: String,
    transport: Arc<dyn Transport>,
    config: ServiceConfig,
    command_groups: Mutex<HashMap<String, Arc<HandlerGroup>>>,
    broadcast: BroadcastState,
    rpc: crate::rpc::RpcCorrelator,
}

impl Service {
    /// Create a service with default configuration.
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self::with_config(name, transport, ServiceConfig::default())
    }

    /// Create a service with explicit configuration.
    pub fn with_config(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: ServiceConfig,
    ) -> Self {
        let name = name.into();
        info!(service = %name, "Service created");
        Self {
            broadcast: BroadcastState::new(&name),
            rpc: crate::rpc::RpcCorrelator::new(name.clone(), Arc::clone(&transport)),
            command_groups: Mutex::new(HashMap::new()),
            config,
            transport,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn context(&self, mode: DeliveryMode) -> DispatchContext {
        DispatchContext {
            service: self.name.clone(),
            mode,
            transport: Arc::clone(&self.transport),
            error_formatter: Arc::clone(&self.config.error_formatter),
            on_handler_error: self.config.on_handler_error.clone(),
        }
    }

    /// Register a command handler on a concrete routing key.
    ///
    /// Fails with a validation error if the key contains `*` or `#`. The
    /// first registration for a key declares the shared queue and starts the
    /// pull loop; later registrations join the round-robin rotation.
    /// Registering the same handler twice creates two independent slots.
    pub async fn listen(&self, routing_key: &str, handler: Arc<dyn Handler>) -> Result<()> {
        validate(routing_key, DeliveryMode::Command)?;

        let mut groups = self.command_groups.lock().await;
        if let Some(group) = groups.get(routing_key) {
            let slots = group.add(handler).await;
            debug!(
                service = %self.name,
                routing_key = %routing_key,
                handlers = slots,
                "Joined existing handler group"
            );
            return Ok(());
        }

        let queue = format!("{}.{}", self.name, routing_key);
        self.transport
            .declare_queue(&queue, &[routing_key], false)
            .await?;
        let stream = self.transport.consume(&queue).await?;

        let group = Arc::new(HandlerGroup::new());
        group.add(handler).await;
        spawn_dispatch_loop(
            self.context(DeliveryMode::Command),
            Arc::clone(&group),
            stream,
        );
        groups.insert(routing_key.to_string(), group);

        info!(
            service = %self.name,
            routing_key = %routing_key,
            queue = %queue,
            "Listening"
        );
        Ok(())
    }

    /// Fire-and-forget command send. Resolves once the transport
    /// acknowledges the publish.
    pub async fn send(&self, routing_key: &str, content: Value) -> Result<()> {
        validate(routing_key, DeliveryMode::Command)?;
        let payload = serde_json::to_vec(&content)?;
        self.transport
            .publish(routing_key, &payload, Headers::default())
            .await
    }

    /// Command send with explicit options. Returns the reply value for sync
    /// sends, `None` otherwise.
    pub async fn send_with(
        &self,
        routing_key: &str,
        content: Value,
        options: SendOptions,
    ) -> Result<Option<Value>> {
        if options.sync {
            let timeout = options.timeout.unwrap_or(self.config.call_timeout);
            self.call_with_timeout(routing_key, content, timeout)
                .await
                .map(Some)
        } else {
            self.send(routing_key, content).await.map(|()| None)
        }
    }

    /// Synchronous (RPC-style) send with the service's default deadline.
    ///
    /// Resolves to the remote handler's return value; rejects with the
    /// formatted remote error or a timeout.
    pub async fn call(&self, routing_key: &str, content: Value) -> Result<Value> {
        self.call_with_timeout(routing_key, content, self.config.call_timeout)
            .await
    }

    /// Synchronous send with an explicit deadline.
    pub async fn call_with_timeout(
        &self,
        routing_key: &str,
        content: Value,
        timeout: Duration,
    ) -> Result<Value> {
        validate(routing_key, DeliveryMode::Command)?;
        self.rpc.call(routing_key, &content, timeout).await
    }

    /// Subscribe a handler to a broadcast pattern (wildcards allowed).
    ///
    /// All of a service's subscriptions share one queue bound to the union
    /// of its patterns, so each matching publish reaches exactly one local
    /// handler no matter how many patterns matched.
    pub async fn subscribe(&self, pattern: &str, handler: Arc<dyn Handler>) -> Result<()> {
        validate(pattern, DeliveryMode::Broadcast)?;
        self.broadcast
            .subscribe(
                Arc::clone(&self.transport),
                self.context(DeliveryMode::Broadcast),
                pattern,
                handler,
            )
            .await
    }

    /// Broadcast a message to every service whose subscriptions match.
    pub async fn publish(&self, routing_key: &str, content: Value) -> Result<()> {
        validate(routing_key, DeliveryMode::Broadcast)?;
        let payload = serde_json::to_vec(&content)?;
        self.transport
            .publish(routing_key, &payload, Headers::default())
            .await
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}
