//! Core module containing the console connector layer
//!
//! This module provides:
//! - Transport drivers (multiplexer service, local serial, terminal emulator)
//! - Channel handles with timeouts and cooperative cancellation
//! - Connector state machine and lifecycle events
//! - Exclusivity arbitration for shared lines
//! - Caller-side retry for busy lines

pub mod arbitration;
pub mod channel;
pub mod connector;
pub mod error;
pub mod events;
pub mod retry;
pub mod state_machine;
pub mod transport;
