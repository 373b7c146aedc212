//! Connector: configured entry point owning one channel's lifecycle
//!
//! A connector is single-use. `open()` runs the transport handshake once;
//! after a failure or a close the caller builds a fresh connector.

use super::arbitration::ExclusivityArbiter;
use super::channel::Channel;
use super::error::ConnectorError;
use super::events::{EventEmitter, EventSink, LifecycleEvent, TracingSink};
use super::state_machine::{ConnectionState, ConnectionStateMachine, StateTransition};
use super::transport::{
    create_driver, ConnectorConfig, DriverContext, DriverOverrides, MuxService, SerialOpener,
    TransportDriver, TransportKind,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Timing and identity shared by all transports
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Upper bound for the open handshake
    pub handshake_timeout: Duration,
    /// Upper bound for each graceful teardown step
    pub teardown_grace: Duration,
    /// Identity announced to shared services
    pub holder: String,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            teardown_grace: Duration::from_secs(2),
            holder: default_holder(),
        }
    }
}

impl LinkOptions {
    /// Set the handshake bound
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the teardown grace period
    #[must_use]
    pub fn teardown_grace(mut self, grace: Duration) -> Self {
        self.teardown_grace = grace;
        self
    }

    /// Set the holder identity
    #[must_use]
    pub fn holder(mut self, holder: &str) -> Self {
        self.holder = holder.to_string();
        self
    }

    /// Check the options before any I/O
    pub fn validate(&self, transport: TransportKind, resource: &str) -> Result<(), ConnectorError> {
        validate_holder(&self.holder, transport, resource)
    }
}

/// The holder travels as one word on line-based control protocols, so it
/// must be non-empty with no whitespace or control characters.
pub fn validate_holder(holder: &str, transport: TransportKind, resource: &str) -> Result<(), ConnectorError> {
    if holder.is_empty() {
        return Err(ConnectorError::invalid_config(transport, resource, "holder must not be empty"));
    }
    if holder.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ConnectorError::invalid_config(
            transport,
            resource,
            format!("holder {holder:?} must not contain whitespace or control characters"),
        ));
    }
    Ok(())
}

/// `$USER-<short uuid>`, falling back to the uuid alone
pub fn default_holder() -> String {
    let id = Uuid::new_v4().simple().to_string();
    let short = &id[..8];
    match std::env::var("USER") {
        Ok(user) if !user.is_empty() && !user.chars().any(|c| c.is_whitespace() || c.is_control()) => {
            format!("{user}-{short}")
        }
        _ => format!("labconsole-{short}"),
    }
}

/// Builder for [`Connector`]
pub struct ConnectorBuilder {
    config: ConnectorConfig,
    arbiter: Option<Arc<ExclusivityArbiter>>,
    events: Option<Arc<dyn EventSink>>,
    options: LinkOptions,
    overrides: DriverOverrides,
    driver: Option<Box<dyn TransportDriver>>,
}

impl ConnectorBuilder {
    /// Share an arbiter with other connectors
    #[must_use]
    pub fn arbiter(mut self, arbiter: Arc<ExclusivityArbiter>) -> Self {
        self.arbiter = Some(arbiter);
        self
    }

    /// Where lifecycle events go (default: tracing)
    #[must_use]
    pub fn events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Timing and identity
    #[must_use]
    pub fn options(mut self, options: LinkOptions) -> Self {
        self.options = options;
        self
    }

    /// Use a specific multiplexer service client
    #[must_use]
    pub fn mux_service(mut self, service: Arc<dyn MuxService>) -> Self {
        self.overrides.mux_service = Some(service);
        self
    }

    /// Use a specific serial opener
    #[must_use]
    pub fn serial_opener(mut self, opener: Arc<dyn SerialOpener>) -> Self {
        self.overrides.serial_opener = Some(opener);
        self
    }

    /// Replace the driver chosen from the configuration
    #[must_use]
    pub fn driver(mut self, driver: Box<dyn TransportDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Build the connector; no I/O happens here
    pub fn build(self) -> Connector {
        let transport = self.config.kind();
        let resource = self.config.resource();
        let driver = match self.driver {
            Some(driver) => driver,
            None => create_driver(self.config.clone(), self.overrides),
        };
        let events = EventEmitter::new(
            self.events.unwrap_or_else(|| Arc::new(TracingSink)),
            transport,
            resource.clone(),
        );

        Connector {
            id: Uuid::new_v4(),
            transport,
            resource,
            config: self.config,
            driver,
            ctx: DriverContext {
                arbiter: self.arbiter.unwrap_or_else(ExclusivityArbiter::shared),
                events,
                holder: self.options.holder,
                handshake_timeout: self.options.handshake_timeout,
                teardown_grace: self.options.teardown_grace,
            },
            lifecycle: Arc::new(Mutex::new(ConnectionStateMachine::new())),
            channel: None,
        }
    }
}

/// Console connector
pub struct Connector {
    id: Uuid,
    transport: TransportKind,
    resource: String,
    config: ConnectorConfig,
    driver: Box<dyn TransportDriver>,
    ctx: DriverContext,
    lifecycle: Arc<Mutex<ConnectionStateMachine>>,
    channel: Option<Channel>,
}

impl Connector {
    /// Start building a connector for `config`
    pub fn builder(config: ConnectorConfig) -> ConnectorBuilder {
        ConnectorBuilder {
            config,
            arbiter: None,
            events: None,
            options: LinkOptions::default(),
            overrides: DriverOverrides::default(),
            driver: None,
        }
    }

    /// Connector with a shared arbiter and an event sink, default options
    pub fn new(config: ConnectorConfig, arbiter: Arc<ExclusivityArbiter>, events: Arc<dyn EventSink>) -> Self {
        Self::builder(config).arbiter(arbiter).events(events).build()
    }

    /// Unique connector ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Transport variant
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Resource identifier
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Configuration this connector was built from
    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Holder identity announced to shared services
    pub fn holder(&self) -> &str {
        &self.ctx.holder
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        self.lifecycle.lock().state()
    }

    /// Recorded transitions, oldest first
    pub fn history(&self) -> Vec<StateTransition> {
        self.lifecycle.lock().history().cloned().collect()
    }

    /// The open channel, if any
    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    /// Validate, negotiate and hand out the channel.
    ///
    /// Only valid on an `Unopened` connector.
    pub async fn open(&mut self) -> Result<Channel, ConnectorError> {
        let state = self.state();
        if state != ConnectionState::Unopened {
            return Err(ConnectorError::InvalidState {
                transport: self.transport,
                resource: self.resource.clone(),
                state,
                operation: "open",
            });
        }

        if let Err(e) = self
            .config
            .validate()
            .and_then(|()| validate_holder(&self.ctx.holder, self.transport, &self.resource))
        {
            self.fail(&e);
            return Err(e);
        }

        self.transition(ConnectionState::Negotiating, None);
        let channel = match self.driver.open(&self.ctx).await {
            Ok(channel) => channel,
            Err(e) => {
                self.fail(&e);
                // best effort: the driver may still hold a lease or a child
                if let Err(teardown) = self.driver.teardown(None, &self.ctx).await {
                    tracing::debug!("teardown after failed open: {}", teardown);
                }
                return Err(e);
            }
        };

        self.transition(ConnectionState::Open, None);
        self.install_loss_hook(&channel);
        self.ctx.events.emit(LifecycleEvent::Opened);
        self.channel = Some(channel.clone());
        Ok(channel)
    }

    /// Tear down the channel and end in `Closed`.
    ///
    /// Idempotent. Driver teardown runs even when the channel is already
    /// dead, so leases and subprocesses are always released.
    pub async fn close(&mut self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.state() {
                ConnectionState::Closed => return,
                ConnectionState::Closing => {}
                _ => {
                    // every non-closed state may move to Closing
                    if let Err(e) = lifecycle.transition(ConnectionState::Closing, Some("close requested")) {
                        tracing::error!(resource = %self.resource, "{}", e);
                    }
                }
            }
        }

        let io = match &self.channel {
            Some(channel) => {
                channel.interrupt("closed locally");
                channel.take_io().await
            }
            None => None,
        };
        if let Err(e) = self.driver.teardown(io, &self.ctx).await {
            tracing::warn!(resource = %self.resource, "teardown failed: {}", e);
        }
        if let Some(channel) = self.channel.take() {
            channel.close();
        }

        self.transition(ConnectionState::Closed, None);
        self.ctx.events.emit(LifecycleEvent::Closed);
    }

    /// Emit an event on this connector's behalf
    pub(crate) fn emit(&self, event: LifecycleEvent) {
        self.ctx.events.emit(event);
    }

    fn transition(&self, state: ConnectionState, reason: Option<&str>) {
        if let Err(e) = self.lifecycle.lock().transition(state, reason) {
            tracing::error!(resource = %self.resource, "{}", e);
        }
    }

    fn fail(&self, error: &ConnectorError) {
        let reason = error.to_string();
        self.transition(ConnectionState::Failed, Some(&reason));
        self.ctx.events.emit(LifecycleEvent::Failed { reason });
    }

    fn install_loss_hook(&self, channel: &Channel) {
        let lifecycle = self.lifecycle.clone();
        let events = self.ctx.events.clone();
        let on_lost = move |reason: &str| {
            let mut lifecycle = lifecycle.lock();
            if lifecycle.state() == ConnectionState::Open
                && lifecycle
                    .transition(ConnectionState::Failed, Some(reason))
                    .is_ok()
            {
                drop(lifecycle);
                events.emit(LifecycleEvent::Failed {
                    reason: reason.to_string(),
                });
            }
        };

        if channel.is_alive() {
            channel.set_loss_hook(Box::new(on_lost));
        } else {
            // lost between the handshake and now
            let reason = channel
                .close_reason()
                .unwrap_or_else(|| "line taken over by another holder".to_string());
            on_lost(&reason);
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        // subprocesses die with their handles; leases need an explicit release
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("resource", &self.resource)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
