//! Multiplexer service driver
//!
//! The multiplexer shares a board's serial console among several clients and
//! arbitrates who may write to it. Its control protocol is line oriented:
//!
//! ```text
//! client: attach <device> <holder>        | force-attach <device> <holder>
//! server: ok | preempted <holder> | busy <holder> | error <reason>
//! ```
//!
//! After `ok` or `preempted` the connection carries raw console bytes until
//! the client sends its detach sequence.

use super::{DriverContext, TransportDriver, TransportKind};
use crate::core::arbitration::{AcquireMode, HeldLease, ResourceId};
use crate::core::channel::{Channel, ChannelIo};
use crate::core::error::ConnectorError;
use crate::core::events::LifecycleEvent;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

/// Default multiplexer control port
pub const DEFAULT_MUX_PORT: u16 = 782;

const MAX_REPLY_LEN: usize = 1024;

/// Multiplexer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiplexerConfig {
    /// Service host, optionally `host:port`
    pub host: String,
    /// Console name on that host
    pub device_name: String,
    /// Preempt the current holder instead of failing with `DeviceBusy`
    #[serde(default)]
    pub force_takeover: bool,
    /// Bytes sent to leave the console
    #[serde(default = "default_detach_sequence")]
    pub detach_sequence: String,
}

fn default_detach_sequence() -> String {
    "\u{5}c.".to_string()
}

impl MultiplexerConfig {
    /// Create a cooperative configuration
    pub fn new(host: &str, device_name: &str) -> Self {
        Self {
            host: host.to_string(),
            device_name: device_name.to_string(),
            force_takeover: false,
            detach_sequence: default_detach_sequence(),
        }
    }

    /// Request forced takeover
    #[must_use]
    pub fn force_takeover(mut self, force: bool) -> Self {
        self.force_takeover = force;
        self
    }

    /// Arbitration key; the port is not part of it
    pub fn resource_id(&self) -> ResourceId {
        ResourceId::new(self.host_name(), &self.device_name)
    }

    /// Host without port
    pub fn host_name(&self) -> &str {
        self.split_host().0
    }

    /// Service port
    pub fn port(&self) -> u16 {
        self.split_host().1.unwrap_or(DEFAULT_MUX_PORT)
    }

    // `host`, `host:port`, `[v6]` or `[v6]:port`
    fn split_host(&self) -> (&str, Option<u16>) {
        if let Some(rest) = self.host.strip_prefix('[') {
            return match rest.split_once(']') {
                Some((addr, "")) => (addr, None),
                Some((addr, tail)) => (addr, tail.strip_prefix(':').and_then(|p| p.parse().ok())),
                None => (self.host.as_str(), None),
            };
        }
        match self.host.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => match port.parse() {
                Ok(port) => (host, Some(port)),
                Err(_) => (self.host.as_str(), None),
            },
            _ => (self.host.as_str(), None),
        }
    }

    /// Port text after the host, if any
    fn port_text(&self) -> Option<&str> {
        match self.host.strip_prefix('[') {
            Some(rest) => rest.split_once(']').and_then(|(_, tail)| tail.strip_prefix(':')),
            None => self.host.rsplit_once(':').map(|(_, port)| port),
        }
    }

    /// Check the configuration without connecting
    pub fn validate(&self) -> Result<(), ConnectorError> {
        let invalid = |reason: &str| {
            ConnectorError::invalid_config(
                TransportKind::Multiplexer,
                format!("{}/{}", self.host, self.device_name),
                reason,
            )
        };

        if self.host_name().trim().is_empty() {
            return Err(invalid("host must not be empty"));
        }
        if let Some(rest) = self.host.strip_prefix('[') {
            match rest.split_once(']') {
                Some((_, tail)) if tail.is_empty() || tail.starts_with(':') => {}
                _ => return Err(invalid("malformed bracketed host")),
            }
        } else if self.host.matches(':').count() > 1 {
            return Err(invalid("IPv6 hosts must be bracketed, as in [::1]:782"));
        }
        if let Some(port) = self.port_text() {
            if port.parse::<u16>().map_or(true, |p| p == 0) {
                return Err(invalid("host port must be 1-65535"));
            }
        }
        if self.device_name.is_empty() {
            return Err(invalid("device name must not be empty"));
        }
        // the control protocol is whitespace separated
        if self.host.contains(char::is_whitespace) || self.device_name.contains(char::is_whitespace) {
            return Err(invalid("host and device name must not contain whitespace"));
        }
        if self.detach_sequence.is_empty() {
            return Err(invalid("detach sequence must not be empty"));
        }
        Ok(())
    }
}

/// One attach attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    /// Service host (no port)
    pub host: String,
    /// Service port
    pub port: u16,
    /// Console name
    pub device: String,
    /// Our identity
    pub holder: String,
    /// Preempt the current holder
    pub force: bool,
}

impl AttachRequest {
    /// Control line for this request
    pub fn command_line(&self) -> String {
        let verb = if self.force { "force-attach" } else { "attach" };
        format!("{verb} {} {}", self.device, self.holder)
    }
}

/// Service reply to an attach
#[derive(Debug)]
pub enum AttachOutcome {
    /// Console attached
    Attached {
        /// Console byte stream
        io: ChannelIo,
        /// Holder the service displaced to let us in
        preempted: Option<String>,
    },
    /// Somebody else holds the console
    Busy {
        /// Current holder
        holder: String,
    },
}

/// Client side of the multiplexer service contract
#[async_trait]
pub trait MuxService: Send + Sync {
    /// Run one attach handshake
    async fn attach(&self, request: &AttachRequest) -> Result<AttachOutcome, ConnectorError>;
}

/// Parsed control reply
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reply {
    Ok,
    Preempted(String),
    Busy(String),
    Error(String),
}

fn parse_reply(line: &str) -> Option<Reply> {
    let line = line.trim();
    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim().to_string();
    match verb {
        "ok" => Some(Reply::Ok),
        "preempted" => Some(Reply::Preempted(rest)),
        "busy" => Some(Reply::Busy(rest)),
        "error" => Some(Reply::Error(rest)),
        _ => None,
    }
}

/// TCP client for the line protocol
#[derive(Debug, Clone, Default)]
pub struct LineMuxService;

#[async_trait]
impl MuxService for LineMuxService {
    async fn attach(&self, request: &AttachRequest) -> Result<AttachOutcome, ConnectorError> {
        let resource = format!("{}/{}", request.host, request.device);
        let fault = |e: std::io::Error| ConnectorError::io(TransportKind::Multiplexer, resource.clone(), e);

        let stream = TcpStream::connect((request.host.as_str(), request.port))
            .await
            .map_err(&fault)?;
        stream.set_nodelay(true).map_err(&fault)?;

        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_REPLY_LEN));
        framed
            .send(request.command_line())
            .await
            .map_err(|e| fault(std::io::Error::other(e)))?;

        let line = match framed.next().await {
            Some(Ok(line)) => line,
            Some(Err(e)) => return Err(fault(std::io::Error::other(e))),
            None => {
                return Err(fault(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "multiplexer closed the connection during attach",
                )))
            }
        };
        tracing::debug!(%resource, reply = %line, "multiplexer reply");

        let preempted = match parse_reply(&line) {
            Some(Reply::Ok) => None,
            Some(Reply::Preempted(holder)) => Some(holder),
            Some(Reply::Busy(holder)) => return Ok(AttachOutcome::Busy { holder }),
            Some(Reply::Error(reason)) => {
                return Err(fault(std::io::Error::other(format!(
                    "multiplexer refused attach: {reason}"
                ))))
            }
            None => {
                return Err(fault(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unexpected multiplexer reply '{line}'"),
                )))
            }
        };

        // console bytes that arrived with the reply must not be lost
        let parts = framed.into_parts();
        let io = ChannelIo::from_stream(parts.io).with_prefix(parts.read_buf.to_vec());
        Ok(AttachOutcome::Attached { io, preempted })
    }
}

/// Multiplexer driver
pub struct MultiplexerDriver {
    config: MultiplexerConfig,
    service: Arc<dyn MuxService>,
    lease: Option<HeldLease>,
}

impl MultiplexerDriver {
    /// Create a driver talking to `service`
    pub fn new(config: MultiplexerConfig, service: Arc<dyn MuxService>) -> Self {
        Self {
            config,
            service,
            lease: None,
        }
    }

    fn busy(&self, holder: String) -> ConnectorError {
        ConnectorError::DeviceBusy {
            transport: TransportKind::Multiplexer,
            resource: self.resource(),
            holder,
        }
    }
}

#[async_trait]
impl TransportDriver for MultiplexerDriver {
    fn kind(&self) -> TransportKind {
        TransportKind::Multiplexer
    }

    fn resource(&self) -> String {
        self.config.resource_id().to_string()
    }

    async fn open(&mut self, ctx: &DriverContext) -> Result<Channel, ConnectorError> {
        let resource = self.config.resource_id();
        let mode = if self.config.force_takeover {
            AcquireMode::Forced
        } else {
            AcquireMode::Cooperative
        };

        // a forced takeover only touches the current lease once the service
        // has actually handed the line over
        let early = match mode {
            AcquireMode::Cooperative => {
                let lease = ctx
                    .arbiter
                    .acquire(&resource, &ctx.holder, mode)
                    .map_err(|contention| self.busy(contention.holder))?;
                Some(HeldLease::new(ctx.arbiter.clone(), lease))
            }
            AcquireMode::Forced => None,
        };
        let release_early = || {
            if let Some(lease) = &early {
                lease.release();
            }
        };

        let request = AttachRequest {
            host: self.config.host_name().to_string(),
            port: self.config.port(),
            device: self.config.device_name.clone(),
            holder: ctx.holder.clone(),
            force: self.config.force_takeover,
        };
        tracing::debug!(%resource, command = %request.command_line(), "attaching");

        let outcome = match tokio::time::timeout(ctx.handshake_timeout, self.service.attach(&request)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                release_early();
                return Err(e);
            }
            Err(_) => {
                release_early();
                return Err(ConnectorError::HandshakeTimeout {
                    transport: TransportKind::Multiplexer,
                    resource: resource.to_string(),
                    after: ctx.handshake_timeout,
                });
            }
        };

        let (io, preempted) = match outcome {
            AttachOutcome::Busy { holder } => {
                release_early();
                return Err(self.busy(holder));
            }
            AttachOutcome::Attached { io, preempted } => (io, preempted),
        };

        let (lease, local_preempted) = match early {
            Some(lease) => (lease, None),
            None => {
                let lease = ctx
                    .arbiter
                    .acquire(&resource, &ctx.holder, AcquireMode::Forced)
                    .map_err(|contention| self.busy(contention.holder))?;
                let local_preempted = lease.preempted_holder().map(String::from);
                (HeldLease::new(ctx.arbiter.clone(), lease), local_preempted)
            }
        };

        if let Some(previous_holder) = preempted.or(local_preempted) {
            ctx.events
                .emit(LifecycleEvent::ForcedTakeover { previous_holder });
        }
        tracing::info!(%resource, holder = %ctx.holder, ?mode, "attached to console");
        self.lease = Some(lease.clone());
        Ok(Channel::new(
            TransportKind::Multiplexer,
            resource.to_string(),
            io,
            Some(lease),
        ))
    }

    async fn teardown(&mut self, io: Option<ChannelIo>, ctx: &DriverContext) -> Result<(), ConnectorError> {
        if let Some(mut io) = io {
            let detach = async {
                io.writer
                    .write_all(self.config.detach_sequence.as_bytes())
                    .await?;
                io.writer.shutdown().await
            };
            match tokio::time::timeout(ctx.teardown_grace, detach).await {
                Ok(Ok(())) => tracing::debug!(resource = %self.resource(), "detached"),
                Ok(Err(e)) => tracing::warn!(resource = %self.resource(), "detach failed: {}", e),
                Err(_) => tracing::warn!(resource = %self.resource(), "detach timed out"),
            }
        }
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    #[test]
    fn test_host_port_split() {
        let cfg = MultiplexerConfig::new("lab1", "board3");
        assert_eq!(cfg.host_name(), "lab1");
        assert_eq!(cfg.port(), DEFAULT_MUX_PORT);

        let cfg = MultiplexerConfig::new("127.0.0.1:4000", "board3");
        assert_eq!(cfg.host_name(), "127.0.0.1");
        assert_eq!(cfg.port(), 4000);
        assert_eq!(cfg.resource_id(), ResourceId::new("127.0.0.1", "board3"));

        let cfg = MultiplexerConfig::new("[::1]:4000", "board3");
        assert_eq!(cfg.host_name(), "::1");
        assert_eq!(cfg.port(), 4000);
        cfg.validate().unwrap();

        let cfg = MultiplexerConfig::new("[fe80::2]", "board3");
        assert_eq!(cfg.host_name(), "fe80::2");
        assert_eq!(cfg.port(), DEFAULT_MUX_PORT);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_bare_ipv6_host_is_rejected() {
        for host in ["::1", "fe80::2:4000", "[::1", "[::1]4000", "[::1]:"] {
            let err = MultiplexerConfig::new(host, "board3").validate().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidConfig, "{host}");
        }
    }

    #[test]
    fn test_validation() {
        MultiplexerConfig::new("lab1", "board3").validate().unwrap();

        for cfg in [
            MultiplexerConfig::new("", "board3"),
            MultiplexerConfig::new("lab1", ""),
            MultiplexerConfig::new("lab1", "board 3"),
            MultiplexerConfig::new("lab1:0", "board3"),
            MultiplexerConfig::new("lab1:http", "board3"),
        ] {
            assert_eq!(cfg.validate().unwrap_err().kind(), ErrorKind::InvalidConfig, "{cfg:?}");
        }
    }

    #[test]
    fn test_command_line() {
        let mut request = AttachRequest {
            host: "lab1".to_string(),
            port: DEFAULT_MUX_PORT,
            device: "board3".to_string(),
            holder: "ci-runner".to_string(),
            force: false,
        };
        assert_eq!(request.command_line(), "attach board3 ci-runner");
        request.force = true;
        assert_eq!(request.command_line(), "force-attach board3 ci-runner");
    }

    #[test]
    fn test_parse_reply() {
        assert_eq!(parse_reply("ok"), Some(Reply::Ok));
        assert_eq!(parse_reply("ok\r"), Some(Reply::Ok));
        assert_eq!(parse_reply("busy alice"), Some(Reply::Busy("alice".to_string())));
        assert_eq!(
            parse_reply("preempted alice"),
            Some(Reply::Preempted("alice".to_string()))
        );
        assert_eq!(
            parse_reply("error no such console"),
            Some(Reply::Error("no such console".to_string()))
        );
        assert_eq!(parse_reply("hello"), None);
    }
}
