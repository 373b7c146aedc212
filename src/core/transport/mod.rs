//! Transport drivers for console access
//!
//! Supports:
//! - Multiplexer service (shared, line-oriented attach protocol over TCP)
//! - Local serial ports
//! - Terminal emulator subprocess (kermit-style)

mod emulator;
mod multiplexer;
mod serial;

pub use emulator::{EmulatorConfig, EmulatorDriver};
pub use multiplexer::{
    AttachOutcome, AttachRequest, LineMuxService, MultiplexerConfig, MultiplexerDriver, MuxService,
    DEFAULT_MUX_PORT,
};
pub use serial::{
    list_ports, LineSettings, NativeSerialOpener, SerialConfig, SerialDriver, SerialFlowControl,
    SerialOpener, SerialParity,
};

use super::arbitration::ExclusivityArbiter;
use super::channel::{Channel, ChannelIo};
use super::error::ConnectorError;
use super::events::EventEmitter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Per-transport connector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum ConnectorConfig {
    /// Shared multiplexer service
    Multiplexer(MultiplexerConfig),
    /// Local serial port
    Serial(SerialConfig),
    /// Terminal emulator subprocess
    Emulator(EmulatorConfig),
}

impl ConnectorConfig {
    /// Transport variant
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Multiplexer(_) => TransportKind::Multiplexer,
            Self::Serial(_) => TransportKind::LocalSerial,
            Self::Emulator(_) => TransportKind::Emulator,
        }
    }

    /// Resource identifier used in events and errors
    pub fn resource(&self) -> String {
        match self {
            Self::Multiplexer(cfg) => cfg.resource_id().to_string(),
            Self::Serial(cfg) => cfg.port.clone(),
            Self::Emulator(cfg) => cfg.resource(),
        }
    }

    /// Check the configuration without touching any device
    pub fn validate(&self) -> Result<(), ConnectorError> {
        match self {
            Self::Multiplexer(cfg) => cfg.validate(),
            Self::Serial(cfg) => cfg.validate(),
            Self::Emulator(cfg) => cfg.validate(),
        }
    }
}

/// Transport type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Multiplexer service
    Multiplexer,
    /// Local serial port
    LocalSerial,
    /// Terminal emulator subprocess
    Emulator,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Multiplexer => write!(f, "multiplexer"),
            Self::LocalSerial => write!(f, "serial"),
            Self::Emulator => write!(f, "emulator"),
        }
    }
}

/// Everything a driver may use while opening or tearing down
#[derive(Debug, Clone)]
pub struct DriverContext {
    /// Lease table for shared lines
    pub arbiter: Arc<ExclusivityArbiter>,
    /// Lifecycle event output
    pub events: EventEmitter,
    /// Identity announced to shared services
    pub holder: String,
    /// Upper bound for `open`
    pub handshake_timeout: Duration,
    /// Upper bound for each graceful teardown step
    pub teardown_grace: Duration,
}

/// Single-attempt transport primitive.
///
/// Drivers never retry; that decision belongs to the caller.
#[async_trait]
pub trait TransportDriver: Send {
    /// Get transport type
    fn kind(&self) -> TransportKind;

    /// Resource identifier
    fn resource(&self) -> String;

    /// Negotiate the transport and hand out a channel.
    ///
    /// On error every resource acquired during the attempt is released.
    async fn open(&mut self, ctx: &DriverContext) -> Result<Channel, ConnectorError>;

    /// Graceful transport-specific close.
    ///
    /// `io` is `None` when the channel never opened or its halves are gone;
    /// the driver must still release what it holds.
    async fn teardown(&mut self, io: Option<ChannelIo>, ctx: &DriverContext) -> Result<(), ConnectorError>;
}

/// Overridable collaborators for drivers, mainly for tests and embedding
#[derive(Clone, Default)]
pub struct DriverOverrides {
    /// Multiplexer service client
    pub mux_service: Option<Arc<dyn MuxService>>,
    /// Serial port opener
    pub serial_opener: Option<Arc<dyn SerialOpener>>,
}

impl fmt::Debug for DriverOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverOverrides")
            .field("mux_service", &self.mux_service.is_some())
            .field("serial_opener", &self.serial_opener.is_some())
            .finish()
    }
}

/// Create a driver for `config`
pub fn create_driver(config: ConnectorConfig, overrides: DriverOverrides) -> Box<dyn TransportDriver> {
    match config {
        ConnectorConfig::Multiplexer(cfg) => {
            let service = overrides
                .mux_service
                .unwrap_or_else(|| Arc::new(LineMuxService::default()));
            Box::new(MultiplexerDriver::new(cfg, service))
        }
        ConnectorConfig::Serial(cfg) => {
            let opener = overrides
                .serial_opener
                .unwrap_or_else(|| Arc::new(NativeSerialOpener));
            Box::new(SerialDriver::new(cfg, opener))
        }
        ConnectorConfig::Emulator(cfg) => Box::new(EmulatorDriver::new(cfg)),
    }
}
