//! CLI Exit Codes
//!
//! Standard exit codes for CLI operations and automation.

use crate::core::error::{ConnectorError, ErrorKind};
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Connection failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// Handshake timeout
    pub const TIMEOUT: u8 = 4;

    /// File not found
    pub const FILE_NOT_FOUND: u8 = 6;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Line lost during the session
    pub const CONNECTION_LOST: u8 = 9;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// Device busy
    pub const DEVICE_BUSY: u8 = 13;

    /// Port not found
    pub const PORT_NOT_FOUND: u8 = 14;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success with a message for the user
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Error with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to `ExitCode`
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<ConnectorError> for CliResult {
    fn from(err: ConnectorError) -> Self {
        Self::Error(exit_code_for(&err), err.to_string())
    }
}

/// Exit code for a connector error
pub fn exit_code_for(err: &ConnectorError) -> u8 {
    match err.kind() {
        ErrorKind::InvalidConfig => ExitCodes::CONFIG_ERROR,
        ErrorKind::DeviceBusy => ExitCodes::DEVICE_BUSY,
        ErrorKind::HandshakeTimeout => ExitCodes::TIMEOUT,
        ErrorKind::IoFault => match err {
            ConnectorError::IoFault { source, .. }
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                ExitCodes::PORT_NOT_FOUND
            }
            _ => ExitCodes::CONNECTION_FAILED,
        },
        ErrorKind::ChannelClosed => ExitCodes::CONNECTION_LOST,
        ErrorKind::InvalidState => ExitCodes::INTERNAL_ERROR,
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        4 => "Handshake timeout",
        6 => "File not found",
        8 => "Configuration error",
        9 => "Connection lost",
        11 => "Operation cancelled",
        13 => "Device busy",
        14 => "Port not found",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in [0, 1, 2, 3, 4, 6, 8, 9, 11, 13, 14, 127] {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}
