//! Error taxonomy shared by channels, transport drivers and connectors

use super::state_machine::ConnectionState;
use super::transport::TransportKind;
use std::time::Duration;
use thiserror::Error;

/// Coarse error category, for callers that branch on the failure class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Configuration rejected before any I/O
    InvalidConfig,
    /// Shared line held by another client
    DeviceBusy,
    /// Negotiation exceeded its bound
    HandshakeTimeout,
    /// Transport-level read/write failure
    IoFault,
    /// Operation on a closed or invalidated channel
    ChannelClosed,
    /// Lifecycle misuse
    InvalidState,
}

/// Connector error types
///
/// Every variant carries the transport and resource identifier so that a
/// diagnostic entry can be written without access to connector internals.
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// Configuration failed validation
    #[error("{transport} {resource}: invalid configuration: {reason}")]
    InvalidConfig {
        /// Transport variant
        transport: TransportKind,
        /// Resource identifier
        resource: String,
        /// What was wrong
        reason: String,
    },

    /// Line is held by another client and takeover was not requested
    #[error("{transport} {resource}: device busy (held by {holder})")]
    DeviceBusy {
        /// Transport variant
        transport: TransportKind,
        /// Resource identifier
        resource: String,
        /// Current holder as reported by the arbiter or the remote service
        holder: String,
    },

    /// Handshake did not complete in time
    #[error("{transport} {resource}: handshake timed out after {after:?}")]
    HandshakeTimeout {
        /// Transport variant
        transport: TransportKind,
        /// Resource identifier
        resource: String,
        /// Configured bound
        after: Duration,
    },

    /// Unrecoverable transport error
    #[error("{transport} {resource}: I/O fault: {source}")]
    IoFault {
        /// Transport variant
        transport: TransportKind,
        /// Resource identifier
        resource: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// Channel was closed locally, by the remote end, or by a forced takeover
    #[error("{transport} {resource}: channel closed: {reason}")]
    ChannelClosed {
        /// Transport variant
        transport: TransportKind,
        /// Resource identifier
        resource: String,
        /// Why the channel is gone
        reason: String,
    },

    /// Operation not allowed in the connector's current state
    #[error("{transport} {resource}: cannot {operation} while {state}")]
    InvalidState {
        /// Transport variant
        transport: TransportKind,
        /// Resource identifier
        resource: String,
        /// State at the time of the call
        state: ConnectionState,
        /// Attempted operation
        operation: &'static str,
    },
}

impl ConnectorError {
    /// Wrap an I/O error with transport context
    pub fn io(transport: TransportKind, resource: impl Into<String>, source: std::io::Error) -> Self {
        Self::IoFault {
            transport,
            resource: resource.into(),
            source,
        }
    }

    /// Build an I/O fault from a plain message
    pub fn io_msg(transport: TransportKind, resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::io(transport, resource, std::io::Error::other(msg.into()))
    }

    /// Build a validation error
    pub fn invalid_config(
        transport: TransportKind,
        resource: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidConfig {
            transport,
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Error category
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            Self::DeviceBusy { .. } => ErrorKind::DeviceBusy,
            Self::HandshakeTimeout { .. } => ErrorKind::HandshakeTimeout,
            Self::IoFault { .. } => ErrorKind::IoFault,
            Self::ChannelClosed { .. } => ErrorKind::ChannelClosed,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
        }
    }

    /// Transport the error originated from
    pub fn transport(&self) -> TransportKind {
        match self {
            Self::InvalidConfig { transport, .. }
            | Self::DeviceBusy { transport, .. }
            | Self::HandshakeTimeout { transport, .. }
            | Self::IoFault { transport, .. }
            | Self::ChannelClosed { transport, .. }
            | Self::InvalidState { transport, .. } => *transport,
        }
    }

    /// Resource identifier the error refers to
    pub fn resource(&self) -> &str {
        match self {
            Self::InvalidConfig { resource, .. }
            | Self::DeviceBusy { resource, .. }
            | Self::HandshakeTimeout { resource, .. }
            | Self::IoFault { resource, .. }
            | Self::ChannelClosed { resource, .. }
            | Self::InvalidState { resource, .. } => resource,
        }
    }

    /// Only contention is worth retrying; everything else is either a
    /// programming error or a dead session.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::DeviceBusy
    }

    /// Whether the error ends the session the channel belonged to
    pub fn is_session_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::IoFault | ErrorKind::ChannelClosed)
    }
}
