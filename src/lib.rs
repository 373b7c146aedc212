//! # Labconsole Core Library
//!
//! Console connectors for embedded boards reachable through:
//! - A shared console multiplexer service (`attach` / `force-attach`)
//! - Local serial ports (RS-232, USB-Serial adapters)
//! - A terminal emulator subprocess (kermit-style)
//!
//! ## Features
//!
//! - One `Connector` per console, with a validated lifecycle
//! - Byte channels with read timeouts and close-from-another-task
//! - Cooperative and forced takeover of shared lines
//! - Lifecycle events to tracing, broadcast or JSON lines sinks
//! - TOML profiles and a CLI with exit codes
//!
//! ## Example
//!
//! ```rust,no_run
//! use labconsole_core::{Connector, ConnectorConfig, ExclusivityArbiter, MultiplexerConfig, TracingSink};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConnectorConfig::Multiplexer(MultiplexerConfig::new("lab1", "board3"));
//!     let mut connector = Connector::new(config, ExclusivityArbiter::shared(), Arc::new(TracingSink));
//!
//!     let channel = connector.open().await?;
//!     channel.write_all(b"\r\n").await?;
//!     let banner = channel.read(4096, Duration::from_secs(2)).await?;
//!     println!("{}", String::from_utf8_lossy(&banner));
//!
//!     connector.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{exit_code_for, ExitCodes};
pub use crate::config::{ConfigError, ConnectorProfile, LinkSettings};
pub use crate::core::arbitration::{AcquireMode, ArbiterLease, ExclusivityArbiter, ResourceId};
pub use crate::core::channel::{Channel, ChannelIo, ChannelStats};
pub use crate::core::connector::{Connector, ConnectorBuilder, LinkOptions};
pub use crate::core::error::{ConnectorError, ErrorKind};
pub use crate::core::events::{
    BroadcastSink, ConnectorEvent, EventSink, JsonLinesSink, LifecycleEvent, MemorySink, NullSink,
    TracingSink,
};
pub use crate::core::retry::{open_with_busy_retry, RetryPolicy};
pub use crate::core::state_machine::{ConnectionState, StateTransition};
pub use crate::core::transport::{
    ConnectorConfig, EmulatorConfig, MultiplexerConfig, MuxService, SerialConfig, SerialFlowControl,
    SerialOpener, SerialParity, TransportDriver, TransportKind,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
