//! labconsole - attach to embedded board consoles
//!
//! Opens a console through a multiplexer service, a local serial port or a
//! terminal emulator subprocess and bridges it to stdin/stdout.

use clap::{Parser, Subcommand};
use labconsole_core::cli::{exit_code_for, print_exit_codes, ExitCodes};
use labconsole_core::config::{ConfigError, ConnectorProfile, LinkSettings};
use labconsole_core::core::transport::list_ports;
use labconsole_core::{
    open_with_busy_retry, Channel, Connector, ConnectorConfig, ConnectorError, EmulatorConfig,
    EventSink, ExclusivityArbiter, JsonLinesSink, MultiplexerConfig, RetryPolicy, SerialConfig,
    SerialFlowControl, SerialParity, TracingSink,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Ctrl-]
const DETACH_KEY: u8 = 0x1d;

/// Time given to the console to answer after stdin closes
const STDIN_EOF_DRAIN: Duration = Duration::from_secs(1);

/// labconsole CLI
#[derive(Parser, Debug)]
#[command(name = "labconsole", version, about = "Attach to embedded board consoles", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log as JSON records on stderr
    #[arg(long, global = true)]
    log_json: bool,

    /// Append lifecycle events as JSON lines to this file
    #[arg(long, global = true, env = "LABCONSOLE_EVENTS")]
    events: Option<PathBuf>,

    /// Handshake timeout in milliseconds
    #[arg(long, global = true)]
    handshake_timeout_ms: Option<u64>,

    /// Holder identity announced to shared services
    #[arg(long, global = true, env = "LABCONSOLE_HOLDER")]
    holder: Option<String>,

    /// Attempts while the line is busy (1 = no retry)
    #[arg(long, global = true)]
    retry: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    ListPorts {
        /// Show detailed info
        #[arg(short, long)]
        detailed: bool,
    },

    /// Validate a profile without connecting
    Check {
        /// Profile name or path
        profile: String,
    },

    /// Attach using a saved profile
    Attach {
        /// Profile name or path
        profile: String,
    },

    /// Attach through a console multiplexer
    Mux {
        /// Service host, optionally host:port
        host: String,

        /// Console name on that host
        device: String,

        /// Take the line over from its current holder
        #[arg(short, long)]
        force: bool,
    },

    /// Attach to a local serial port
    Serial {
        /// Serial port name (e.g., /dev/ttyUSB0)
        port: String,

        /// Baud rate
        #[arg(short, long, default_value = "115200")]
        baud: u32,

        /// Data bits (5-8)
        #[arg(long, default_value = "8")]
        data_bits: u8,

        /// Parity (none, odd, even)
        #[arg(long, default_value = "none")]
        parity: SerialParity,

        /// Stop bits (1, 2)
        #[arg(long, default_value = "1")]
        stop_bits: u8,

        /// Flow control (none, hw, sw)
        #[arg(long, default_value = "none")]
        flow: SerialFlowControl,
    },

    /// Attach through a terminal emulator subprocess
    Emulator {
        /// Emulator configuration file, passed as the last argument
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output meaning the line is connected
        #[arg(long)]
        ready: Option<String>,

        /// Program and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command_line: Vec<String>,
    },

    /// Print the exit code table
    ExitCodes,
}

/// How an interactive session ended
enum Ended {
    Detached,
    Cancelled,
    Lost(ConnectorError),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.quiet {
        tracing::Level::WARN
    } else if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    // console bytes own stdout
    let logs = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr);
    if cli.log_json {
        logs.json().init();
    } else {
        logs.init();
    }

    match run(&cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(classify(&e))
        }
    }
}

fn classify(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<ConnectorError>() {
        return exit_code_for(e);
    }
    match err.downcast_ref::<ConfigError>() {
        Some(ConfigError::NotFound(_)) => ExitCodes::FILE_NOT_FOUND,
        Some(_) => ExitCodes::CONFIG_ERROR,
        None => ExitCodes::ERROR,
    }
}

async fn run(cli: &Cli) -> anyhow::Result<u8> {
    let profile = match &cli.command {
        Commands::ListPorts { detailed } => {
            show_ports(cli, *detailed)?;
            return Ok(ExitCodes::SUCCESS);
        }
        Commands::ExitCodes => {
            print_exit_codes();
            return Ok(ExitCodes::SUCCESS);
        }
        Commands::Check { profile } => {
            let profile = ConnectorProfile::resolve(profile)?;
            profile.connector.validate()?;
            link_settings(cli, &profile)
                .to_options()
                .validate(profile.connector.kind(), &profile.connector.resource())?;
            if !cli.quiet {
                println!(
                    "{}: {} {} ok",
                    profile.display_name(),
                    profile.connector.kind(),
                    profile.connector.resource()
                );
            }
            return Ok(ExitCodes::SUCCESS);
        }
        Commands::Attach { profile } => ConnectorProfile::resolve(profile)?,
        Commands::Mux { host, device, force } => ConnectorProfile::new(
            device,
            ConnectorConfig::Multiplexer(MultiplexerConfig::new(host, device).force_takeover(*force)),
        ),
        Commands::Serial {
            port,
            baud,
            data_bits,
            parity,
            stop_bits,
            flow,
        } => ConnectorProfile::new(
            port,
            ConnectorConfig::Serial(
                SerialConfig::new(port, *baud)
                    .data_bits(*data_bits)
                    .parity(*parity)
                    .stop_bits(*stop_bits)
                    .flow_control(*flow),
            ),
        ),
        Commands::Emulator {
            config,
            ready,
            command_line,
        } => {
            let mut emulator = EmulatorConfig::new(command_line.iter().cloned());
            if let Some(path) = config {
                emulator = emulator.config_file(path);
            }
            if let Some(marker) = ready {
                emulator = emulator.ready_marker(marker);
            }
            ConnectorProfile::new("emulator", ConnectorConfig::Emulator(emulator))
        }
    };

    attach(cli, profile).await
}

fn show_ports(cli: &Cli, detailed: bool) -> anyhow::Result<()> {
    let ports = list_ports()?;

    if ports.is_empty() {
        if !cli.quiet {
            println!("No serial ports found.");
        }
        return Ok(());
    }

    if detailed {
        println!("Available Serial Ports:");
        println!("{:-<60}", "");
        for port in &ports {
            println!("  {} [{:?}]", port.port_name, port.port_type);
        }
    } else {
        for port in &ports {
            println!("{}", port.port_name);
        }
    }
    Ok(())
}

fn event_sink(cli: &Cli) -> anyhow::Result<Arc<dyn EventSink>> {
    match &cli.events {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Ok(Arc::new(JsonLinesSink::new(file)))
        }
        None => Ok(Arc::new(TracingSink)),
    }
}

fn link_settings(cli: &Cli, profile: &ConnectorProfile) -> LinkSettings {
    let mut link = profile.link.clone();
    if let Some(ms) = cli.handshake_timeout_ms {
        link.handshake_timeout_ms = ms;
    }
    if let Some(holder) = &cli.holder {
        link.holder = Some(holder.clone());
    }
    link
}

async fn attach(cli: &Cli, profile: ConnectorProfile) -> anyhow::Result<u8> {
    let sink = event_sink(cli)?;
    let arbiter = ExclusivityArbiter::shared();
    let options = link_settings(cli, &profile).to_options();
    let policy = match (cli.retry, &profile.retry) {
        (Some(attempts), Some(policy)) => RetryPolicy {
            max_attempts: attempts,
            ..policy.clone()
        },
        (Some(attempts), None) => RetryPolicy {
            max_attempts: attempts,
            ..RetryPolicy::default()
        },
        (None, Some(policy)) => policy.clone(),
        (None, None) => RetryPolicy::never(),
    };

    if !cli.quiet {
        eprintln!(
            "Attaching to {} ({} {})...",
            profile.display_name(),
            profile.connector.kind(),
            profile.connector.resource()
        );
    }

    let config = profile.connector;
    let (mut connector, channel) = open_with_busy_retry(
        |_| {
            Connector::builder(config.clone())
                .arbiter(arbiter.clone())
                .events(sink.clone())
                .options(options.clone())
                .build()
        },
        &policy,
    )
    .await?;

    if !cli.quiet {
        eprintln!("Connected. Press Ctrl-] then Enter to detach.");
    }

    let ended = bridge(&channel).await;
    connector.close().await;

    match ended {
        Ended::Detached => Ok(ExitCodes::SUCCESS),
        Ended::Cancelled => Ok(ExitCodes::CANCELLED),
        Ended::Lost(e) => Err(e.into()),
    }
}

/// Copy console output to stdout and stdin to the console until detach
async fn bridge(channel: &Channel) -> Ended {
    let reader = channel.clone();
    let mut output = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        loop {
            let data = reader.read(4096, Duration::from_millis(250)).await?;
            if data.is_empty() {
                continue;
            }
            if stdout.write_all(&data).await.is_err() || stdout.flush().await.is_err() {
                return Ok::<(), ConnectorError>(());
            }
        }
    });

    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1024];
    let mut stdin_open = true;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let ended = loop {
        tokio::select! {
            _ = &mut ctrl_c => break Ended::Cancelled,
            res = &mut output => {
                break match res {
                    Ok(Ok(())) => Ended::Detached,
                    Ok(Err(e)) => Ended::Lost(e),
                    Err(join) => {
                        tracing::error!("output task failed: {}", join);
                        Ended::Detached
                    }
                };
            }
            () = tokio::time::sleep(STDIN_EOF_DRAIN), if !stdin_open => break Ended::Detached,
            n = stdin.read(&mut buf), if stdin_open => match n {
                Ok(0) | Err(_) => stdin_open = false,
                Ok(n) => {
                    let chunk = &buf[..n];
                    let (data, detach) = match chunk.iter().position(|&b| b == DETACH_KEY) {
                        Some(pos) => (&chunk[..pos], true),
                        None => (chunk, false),
                    };
                    if let Err(e) = channel.write_all(data).await {
                        break Ended::Lost(e);
                    }
                    if detach {
                        break Ended::Detached;
                    }
                }
            },
        }
    };

    output.abort();
    ended
}
