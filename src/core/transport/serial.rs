//! Local serial port driver

use super::{DriverContext, TransportDriver, TransportKind};
use crate::core::channel::{Channel, ChannelIo};
use crate::core::error::ConnectorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity, StopBits};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_serial::SerialPortBuilderExt;

/// Serial port flow control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialFlowControl {
    /// No flow control
    #[default]
    None,
    /// Hardware flow control (RTS/CTS)
    Hardware,
    /// Software flow control (XON/XOFF)
    Software,
}

impl std::str::FromStr for SerialFlowControl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "hw" | "hardware" | "rtscts" => Ok(Self::Hardware),
            "sw" | "software" | "xonxoff" => Ok(Self::Software),
            other => Err(format!("unknown flow control '{other}'")),
        }
    }
}

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl std::str::FromStr for SerialParity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            other => Err(format!("unknown parity '{other}'")),
        }
    }
}

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port name (e.g., /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Parity
    #[serde(default)]
    pub parity: SerialParity,
    /// Stop bits (1, 2)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Flow control
    #[serde(default)]
    pub flow_control: SerialFlowControl,
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl SerialConfig {
    /// Create a new serial configuration with 8N1 settings
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: default_data_bits(),
            parity: SerialParity::None,
            stop_bits: default_stop_bits(),
            flow_control: SerialFlowControl::None,
        }
    }

    /// Set data bits
    #[must_use]
    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set stop bits
    #[must_use]
    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    #[must_use]
    pub fn flow_control(mut self, flow: SerialFlowControl) -> Self {
        self.flow_control = flow;
        self
    }

    /// Check the configuration without opening the port
    pub fn validate(&self) -> Result<(), ConnectorError> {
        self.line_settings().map(|_| ())
    }

    /// Resolve into fully typed line settings
    pub fn line_settings(&self) -> Result<LineSettings, ConnectorError> {
        let invalid =
            |reason: String| ConnectorError::invalid_config(TransportKind::LocalSerial, &self.port, reason);

        if self.port.trim().is_empty() {
            return Err(invalid("port must not be empty".to_string()));
        }
        if self.baud_rate == 0 {
            return Err(invalid("baud rate must be positive".to_string()));
        }

        let data_bits = match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => return Err(invalid(format!("data bits must be 5-8, got {other}"))),
        };

        let stop_bits = match self.stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            other => return Err(invalid(format!("stop bits must be 1 or 2, got {other}"))),
        };

        let parity = match self.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };

        let flow_control = match self.flow_control {
            SerialFlowControl::Hardware => FlowControl::Hardware,
            SerialFlowControl::Software => FlowControl::Software,
            SerialFlowControl::None => FlowControl::None,
        };

        Ok(LineSettings {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
            data_bits,
            parity,
            stop_bits,
            flow_control,
        })
    }

    /// Short form like `/dev/ttyUSB0 @ 115200 8N1`
    pub fn connection_info(&self) -> String {
        format!(
            "{} @ {} {}{}{}",
            self.port,
            self.baud_rate,
            self.data_bits,
            match self.parity {
                SerialParity::None => "N",
                SerialParity::Odd => "O",
                SerialParity::Even => "E",
            },
            self.stop_bits,
        )
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("/dev/ttyUSB0", 115_200)
    }
}

/// Validated line settings, applied in one step when the port opens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSettings {
    /// Device node
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits
    pub data_bits: DataBits,
    /// Parity
    pub parity: Parity,
    /// Stop bits
    pub stop_bits: StopBits,
    /// Flow control
    pub flow_control: FlowControl,
}

/// Opens a serial device.
///
/// Implementations must return only after every setting in `settings` is in
/// effect; the returned I/O is exposed to callers as-is.
pub trait SerialOpener: Send + Sync {
    /// Open and configure the port
    fn open(&self, settings: &LineSettings) -> std::io::Result<ChannelIo>;
}

/// Opens real ports through `tokio-serial`
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeSerialOpener;

impl SerialOpener for NativeSerialOpener {
    fn open(&self, settings: &LineSettings) -> std::io::Result<ChannelIo> {
        // the builder applies every termios setting inside open()
        let stream = tokio_serial::new(&settings.port, settings.baud_rate)
            .data_bits(settings.data_bits)
            .parity(settings.parity)
            .stop_bits(settings.stop_bits)
            .flow_control(settings.flow_control)
            .open_native_async()
            .map_err(std::io::Error::from)?;
        Ok(ChannelIo::from_stream(stream))
    }
}

/// Local serial port driver
pub struct SerialDriver {
    config: SerialConfig,
    opener: Arc<dyn SerialOpener>,
}

impl SerialDriver {
    /// Create a driver using `opener`
    pub fn new(config: SerialConfig, opener: Arc<dyn SerialOpener>) -> Self {
        Self { config, opener }
    }
}

#[async_trait]
impl TransportDriver for SerialDriver {
    fn kind(&self) -> TransportKind {
        TransportKind::LocalSerial
    }

    fn resource(&self) -> String {
        self.config.port.clone()
    }

    async fn open(&mut self, ctx: &DriverContext) -> Result<Channel, ConnectorError> {
        let settings = self.config.line_settings()?;
        let opener = self.opener.clone();
        let port = settings.port.clone();

        let opening = tokio::task::spawn_blocking(move || opener.open(&settings));
        let io = match tokio::time::timeout(ctx.handshake_timeout, opening).await {
            Err(_) => {
                return Err(ConnectorError::HandshakeTimeout {
                    transport: TransportKind::LocalSerial,
                    resource: port,
                    after: ctx.handshake_timeout,
                })
            }
            Ok(Err(join)) => {
                return Err(ConnectorError::io_msg(
                    TransportKind::LocalSerial,
                    port,
                    format!("opener task failed: {join}"),
                ))
            }
            Ok(Ok(Err(e))) => return Err(ConnectorError::io(TransportKind::LocalSerial, port, e)),
            Ok(Ok(Ok(io))) => io,
        };

        tracing::info!("Opened {}", self.config.connection_info());
        Ok(Channel::new(TransportKind::LocalSerial, port, io, None))
    }

    async fn teardown(&mut self, io: Option<ChannelIo>, ctx: &DriverContext) -> Result<(), ConnectorError> {
        if let Some(mut io) = io {
            // flush pending output; dropping the halves closes the port
            if tokio::time::timeout(ctx.teardown_grace, io.writer.shutdown())
                .await
                .is_err()
            {
                tracing::warn!(port = %self.config.port, "serial flush timed out");
            }
        }
        tracing::debug!(port = %self.config.port, "serial port closed");
        Ok(())
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>, ConnectorError> {
    serialport::available_ports()
        .map_err(|e| ConnectorError::io(TransportKind::LocalSerial, "*", e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    #[test]
    fn test_line_settings_mapping() {
        let cfg = SerialConfig::new("/dev/ttyS1", 9600)
            .data_bits(7)
            .parity(SerialParity::Even)
            .stop_bits(2);
        let settings = cfg.line_settings().unwrap();

        assert_eq!(settings.data_bits, DataBits::Seven);
        assert_eq!(settings.parity, Parity::Even);
        assert_eq!(settings.stop_bits, StopBits::Two);
        assert_eq!(settings.flow_control, FlowControl::None);
        assert_eq!(cfg.connection_info(), "/dev/ttyS1 @ 9600 7E2");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let bad = [
            SerialConfig::new("", 115_200),
            SerialConfig::new("/dev/ttyS0", 0),
            SerialConfig::new("/dev/ttyS0", 115_200).data_bits(9),
            SerialConfig::new("/dev/ttyS0", 115_200).data_bits(4),
            SerialConfig::new("/dev/ttyS0", 115_200).stop_bits(3),
        ];
        for cfg in bad {
            let err = cfg.validate().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidConfig, "{cfg:?}");
        }
    }

    #[test]
    fn test_parity_from_str() {
        assert_eq!("E".parse::<SerialParity>().unwrap(), SerialParity::Even);
        assert_eq!("none".parse::<SerialParity>().unwrap(), SerialParity::None);
        assert!("mark".parse::<SerialParity>().is_err());
    }
}
