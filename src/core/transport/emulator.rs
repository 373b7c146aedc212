//! Terminal emulator subprocess driver
//!
//! Runs a kermit-style serial terminal program and talks to the board
//! through its stdin/stdout. Opening waits out the program's banner; closing
//! escapes back to the program's own prompt and asks it to exit.

use super::{DriverContext, TransportDriver, TransportKind};
use crate::core::channel::{find_subsequence, BoxReader, Channel, ChannelIo};
use crate::core::error::ConnectorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

/// Emulator configuration.
///
/// The defaults match C-Kermit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmulatorConfig {
    /// Program and arguments
    pub command_line: Vec<String>,
    /// Configuration file, appended as the last argument
    #[serde(default)]
    pub config_file_path: Option<PathBuf>,
    /// Output that means the line is connected; without one the banner is
    /// drained until the program goes quiet
    #[serde(default)]
    pub ready_marker: Option<String>,
    /// Output that means another process owns the serial line
    #[serde(default = "default_busy_marker")]
    pub busy_marker: Option<String>,
    /// Quiet period ending the banner when no ready marker is set
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Escape from the connection back to the program's prompt
    #[serde(default = "default_escape_sequence")]
    pub escape_sequence: String,
    /// The program's command prompt
    #[serde(default = "default_prompt")]
    pub prompt: String,
    /// Command that ends the program
    #[serde(default = "default_exit_command")]
    pub exit_command: String,
}

fn default_busy_marker() -> Option<String> {
    Some("Locked".to_string())
}

fn default_settle_ms() -> u64 {
    500
}

fn default_escape_sequence() -> String {
    "\u{1c}C".to_string()
}

fn default_prompt() -> String {
    "C-Kermit>".to_string()
}

fn default_exit_command() -> String {
    "exit\n".to_string()
}

impl EmulatorConfig {
    /// Run `command_line` with kermit defaults
    pub fn new<I, S>(command_line: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command_line: command_line.into_iter().map(Into::into).collect(),
            config_file_path: None,
            ready_marker: None,
            busy_marker: default_busy_marker(),
            settle_ms: default_settle_ms(),
            escape_sequence: default_escape_sequence(),
            prompt: default_prompt(),
            exit_command: default_exit_command(),
        }
    }

    /// `kermit <cfg_file>`
    pub fn kermit(cfg_file: impl Into<PathBuf>) -> Self {
        Self::new(["kermit"]).config_file(cfg_file)
    }

    /// Set the configuration file
    #[must_use]
    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file_path = Some(path.into());
        self
    }

    /// Set the ready marker
    #[must_use]
    pub fn ready_marker(mut self, marker: &str) -> Self {
        self.ready_marker = Some(marker.to_string());
        self
    }

    /// Set the quiet period
    #[must_use]
    pub fn settle(mut self, settle: Duration) -> Self {
        self.settle_ms = u64::try_from(settle.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Resource identifier: the config file, else the program
    pub fn resource(&self) -> String {
        match (&self.config_file_path, self.command_line.first()) {
            (Some(path), _) => path.display().to_string(),
            (None, Some(program)) => program.clone(),
            (None, None) => String::new(),
        }
    }

    /// Full argv
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.command_line.clone();
        if let Some(path) = &self.config_file_path {
            argv.push(path.display().to_string());
        }
        argv
    }

    /// Check the configuration without spawning anything
    pub fn validate(&self) -> Result<(), ConnectorError> {
        let invalid =
            |reason: &str| ConnectorError::invalid_config(TransportKind::Emulator, self.resource(), reason);

        match self.command_line.first() {
            None => return Err(invalid("command line must not be empty")),
            Some(program) if program.trim().is_empty() => {
                return Err(invalid("program name must not be empty"))
            }
            Some(_) => {}
        }
        if self.ready_marker.as_deref() == Some("") {
            return Err(invalid("ready marker must not be empty"));
        }
        if self.busy_marker.as_deref() == Some("") {
            return Err(invalid("busy marker must not be empty"));
        }
        if self.settle_ms == 0 && self.ready_marker.is_none() {
            return Err(invalid("settle period must be positive without a ready marker"));
        }
        Ok(())
    }
}

/// How the banner phase ended
#[derive(Debug, PartialEq, Eq)]
enum Banner {
    /// Ready marker seen; bytes after it belong to the console
    Ready(Vec<u8>),
    /// No marker configured and the program went quiet
    Settled,
    /// Busy marker seen
    Busy(String),
    /// Ready marker never came
    TimedOut,
}

async fn await_banner<R>(reader: &mut R, config: &EmulatorConfig, deadline: Instant) -> std::io::Result<Banner>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let ready = config.ready_marker.as_deref().map(str::as_bytes);
    let busy = config.busy_marker.as_deref().map(str::as_bytes);
    let settle = Duration::from_millis(config.settle_ms);

    let mut seen = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(if ready.is_some() {
                Banner::TimedOut
            } else {
                Banner::Settled
            });
        }
        let wait = if ready.is_some() {
            remaining
        } else {
            remaining.min(settle)
        };

        match tokio::time::timeout(wait, reader.read(&mut chunk)).await {
            Err(_) if ready.is_none() => return Ok(Banner::Settled),
            Err(_) => continue,
            Ok(Ok(0)) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "emulator exited during handshake",
                ))
            }
            Ok(Ok(n)) => seen.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(e),
        }

        if let Some(busy) = busy {
            if find_subsequence(&seen, busy).is_some() {
                return Ok(Banner::Busy(String::from_utf8_lossy(&seen).trim().to_string()));
            }
        }
        if let Some(ready) = ready {
            if let Some(pos) = find_subsequence(&seen, ready) {
                return Ok(Banner::Ready(seen.split_off(pos + ready.len())));
            }
        }
    }
}

/// Terminal emulator driver
pub struct EmulatorDriver {
    config: EmulatorConfig,
    child: Option<Child>,
}

impl EmulatorDriver {
    /// Create a driver
    pub fn new(config: EmulatorConfig) -> Self {
        Self {
            config,
            child: None,
        }
    }

    fn fault(&self, e: std::io::Error) -> ConnectorError {
        ConnectorError::io(TransportKind::Emulator, self.config.resource(), e)
    }

    async fn kill(child: &mut Child) {
        if let Err(e) = child.kill().await {
            tracing::warn!("Failed to kill emulator: {}", e);
        }
    }
}

#[async_trait]
impl TransportDriver for EmulatorDriver {
    fn kind(&self) -> TransportKind {
        TransportKind::Emulator
    }

    fn resource(&self) -> String {
        self.config.resource()
    }

    async fn open(&mut self, ctx: &DriverContext) -> Result<Channel, ConnectorError> {
        self.config.validate()?;
        let argv = self.config.argv();
        tracing::info!("Starting emulator: {}", argv.join(" "));

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.fault(e))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            Self::kill(&mut child).await;
            return Err(self.fault(std::io::Error::other("emulator pipes unavailable")));
        };

        if let Some(stderr) = child.stderr.take() {
            let resource = self.config.resource();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(%resource, "emulator stderr: {}", line);
                }
            });
        }

        let mut stdout: BoxReader = Box::new(stdout);
        let deadline = Instant::now() + ctx.handshake_timeout;
        let banner = await_banner(&mut stdout, &self.config, deadline).await;

        let leftover = match banner {
            Ok(Banner::Ready(leftover)) => leftover,
            Ok(Banner::Settled) => Vec::new(),
            Ok(Banner::Busy(output)) => {
                Self::kill(&mut child).await;
                return Err(ConnectorError::DeviceBusy {
                    transport: TransportKind::Emulator,
                    resource: self.config.resource(),
                    holder: output,
                });
            }
            Ok(Banner::TimedOut) => {
                Self::kill(&mut child).await;
                return Err(ConnectorError::HandshakeTimeout {
                    transport: TransportKind::Emulator,
                    resource: self.config.resource(),
                    after: ctx.handshake_timeout,
                });
            }
            Err(e) => {
                Self::kill(&mut child).await;
                return Err(self.fault(e));
            }
        };

        tracing::debug!(resource = %self.config.resource(), pid = ?child.id(), "emulator ready");
        self.child = Some(child);
        let io = ChannelIo::new(stdout, stdin).with_prefix(leftover);
        Ok(Channel::new(TransportKind::Emulator, self.config.resource(), io, None))
    }

    async fn teardown(&mut self, io: Option<ChannelIo>, ctx: &DriverContext) -> Result<(), ConnectorError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if let Some(ChannelIo { mut reader, mut writer }) = io {
            let prompt = self.config.prompt.as_bytes();
            let escape = async {
                writer.write_all(self.config.escape_sequence.as_bytes()).await?;
                writer.flush().await?;

                let mut seen = Vec::new();
                let mut chunk = [0u8; 256];
                while find_subsequence(&seen, prompt).is_none() {
                    let n = reader.read(&mut chunk).await?;
                    if n == 0 {
                        break;
                    }
                    seen.extend_from_slice(&chunk[..n]);
                }

                writer.write_all(self.config.exit_command.as_bytes()).await?;
                writer.shutdown().await
            };
            match tokio::time::timeout(ctx.teardown_grace, escape).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!("emulator escape failed: {}", e),
                Err(_) => tracing::debug!("emulator did not return to its prompt"),
            }
        }

        match tokio::time::timeout(ctx.teardown_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(resource = %self.config.resource(), %status, "emulator exited");
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to wait for emulator: {}", e);
                Self::kill(&mut child).await;
            }
            Err(_) => {
                tracing::warn!(resource = %self.config.resource(), "emulator ignored exit, killing");
                Self::kill(&mut child).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    fn deadline(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn test_argv_appends_config_file() {
        let cfg = EmulatorConfig::kermit("/etc/kermit/board3.cfg");
        assert_eq!(cfg.argv(), vec!["kermit", "/etc/kermit/board3.cfg"]);
        assert_eq!(cfg.resource(), "/etc/kermit/board3.cfg");
    }

    #[test]
    fn test_validation() {
        let empty: Vec<String> = Vec::new();
        let err = EmulatorConfig::new(empty).validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);

        let err = EmulatorConfig::new(["kermit"])
            .ready_marker("")
            .validate()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);

        EmulatorConfig::kermit("board.cfg").validate().unwrap();
    }

    #[tokio::test]
    async fn test_banner_ready_keeps_leftover() {
        let mut reader = tokio_test::io::Builder::new()
            .read(b"C-Kermit 9.0\r\nConnecting to /dev/ttyUSB0")
            .read(b", speed 115200\r\n----\r\nU-Boot")
            .build();
        let cfg = EmulatorConfig::new(["kermit"]).ready_marker("----\r\n");

        let banner = await_banner(&mut reader, &cfg, deadline(1000)).await.unwrap();
        assert_eq!(banner, Banner::Ready(b"U-Boot".to_vec()));
    }

    #[tokio::test]
    async fn test_banner_busy_marker() {
        let mut reader = tokio_test::io::Builder::new()
            .read(b"Sorry, can't open connection: /dev/ttyUSB0\r\nLocked by pid 4242\r\n")
            .build();
        let cfg = EmulatorConfig::new(["kermit"]);

        match await_banner(&mut reader, &cfg, deadline(1000)).await.unwrap() {
            Banner::Busy(text) => assert!(text.contains("Locked")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_banner_settles_when_quiet() {
        let mut reader = tokio_test::io::Builder::new()
            .read(b"banner\r\n")
            .wait(Duration::from_secs(5))
            .build();
        let cfg = EmulatorConfig::new(["kermit"]).settle(Duration::from_millis(30));

        let banner = await_banner(&mut reader, &cfg, deadline(1000)).await.unwrap();
        assert_eq!(banner, Banner::Settled);
    }

    #[tokio::test]
    async fn test_banner_times_out_without_marker() {
        let mut reader = tokio_test::io::Builder::new()
            .read(b"banner\r\n")
            .wait(Duration::from_secs(5))
            .build();
        let cfg = EmulatorConfig::new(["kermit"]).ready_marker("----");

        let banner = await_banner(&mut reader, &cfg, deadline(50)).await.unwrap();
        assert_eq!(banner, Banner::TimedOut);
    }

    #[tokio::test]
    async fn test_banner_eof_is_error() {
        let mut reader = tokio_test::io::Builder::new().read(b"kermit: usage").build();
        let cfg = EmulatorConfig::new(["kermit"]).ready_marker("----");

        let err = await_banner(&mut reader, &cfg, deadline(1000)).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
