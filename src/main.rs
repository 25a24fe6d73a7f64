//! Binary entrypoint for the zbcam CLI.
//!
//! Commands:
//! - `start [--port <path>] [--peer <addr>]` - handshake, then capture and send every interval
//! - `send <file> [--port <path>] [--peer <addr>]` - deliver one file and print a JSON report
//! - `listen [--port <path>] [--output <dir>]` - run the receiving station
//! - `init` - create a starter `config.toml`
//! - `smoketest --port <path> [-b <baud>] [--timeout <s>]` - probe the radio link with HELLO
//! - `selftest [--size <n> | --file <path>]` - full transfer against the in-process loopback peer
//!
//! See the library crate docs for module-level details: `zbcam::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use zbcam::config::Config;
use zbcam::metrics;
use zbcam::transfer::loopback::{Direction, LoopbackPeer};
use zbcam::transfer::{EventQueues, Message, ReliableSender};

#[derive(Parser)]
#[command(name = "zbcam")]
#[command(about = "Reliable chunked blob uplink over XBee radios")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the capture-and-send loop
    Start {
        /// Radio serial port (e.g., /dev/ttyUSB0)
        #[arg(short, long)]
        port: Option<String>,
        /// Peer 64-bit address, overrides the config
        #[arg(long)]
        peer: Option<String>,
    },
    /// Send one file and exit
    Send {
        /// File to deliver
        file: String,
        #[arg(short, long)]
        port: Option<String>,
        #[arg(long)]
        peer: Option<String>,
    },
    /// Run the receiving station
    Listen {
        #[arg(short, long)]
        port: Option<String>,
        /// Directory for received blobs, overrides the config
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// Open the radio and handshake with the peer
    SmokeTest {
        /// Radio serial port
        #[arg(short, long)]
        port: String,
        /// Baud rate
        #[arg(short = 'b', long, default_value_t = 115200)]
        baud: u32,
        /// Seconds to wait before giving up
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },
    /// Run a transfer against the in-process loopback peer
    SelfTest {
        /// Blob size when no file is given
        #[arg(short, long, default_value_t = 4096)]
        size: usize,
        /// Send this file instead of generated data
        #[arg(short, long)]
        file: Option<String>,
        /// Lose every Nth data acknowledgement
        #[arg(long)]
        drop_ack_every: Option<u32>,
        /// Lose every Nth data chunk on the way out
        #[arg(long)]
        drop_data_every: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Init => {
            info!("Initializing new zbcam configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::SelfTest {
            size,
            file,
            drop_ack_every,
            drop_data_every,
        } => {
            let config = pre_config.unwrap_or_default();
            let blob = match file {
                Some(path) => tokio::fs::read(&path).await?,
                None => (0..size).map(|i| (i * 31 % 251) as u8).collect(),
            };
            let ok = run_selftest(&config, &blob, drop_ack_every, drop_data_every).await?;
            std::process::exit(if ok { 0 } else { 1 });
        }
        #[cfg(not(feature = "serial"))]
        _ => {
            error!("This command requires the 'serial' feature");
            std::process::exit(2);
        }
        #[cfg(feature = "serial")]
        Commands::Start { port, peer } => {
            use zbcam::uplink::{connect_sender, FileCapture, Uplink};

            let config = load_for_radio(pre_config, &cli.config, peer).await?;
            info!("Starting zbcam v{}", env!("CARGO_PKG_VERSION"));
            let (sender, reader) = connect_sender(&config, port.as_deref()).await?;
            let mut uplink = Uplink::new(
                sender,
                Box::new(FileCapture::new(&config.capture.source)),
                std::time::Duration::from_secs(config.capture.interval_secs.max(1)),
            );
            let delivered = uplink.run(shutdown_signal()).await?;
            reader.shutdown().await;
            info!("{} blob(s) delivered; {:?}", delivered, metrics::snapshot());
        }
        #[cfg(feature = "serial")]
        Commands::Send { file, port, peer } => {
            use zbcam::uplink::connect_sender;

            let config = load_for_radio(pre_config, &cli.config, peer).await?;
            let blob = tokio::fs::read(&file)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", file, e))?;
            let (mut sender, reader) = connect_sender(&config, port.as_deref()).await?;
            let outcome = async {
                sender.handshake().await?;
                sender.send_blob(&blob).await
            }
            .await;
            reader.shutdown().await;
            let report = outcome?;
            let payload = serde_json::json!({
                "file": file,
                "report": report,
                "metrics": metrics::snapshot(),
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
            std::process::exit(if report.is_complete() { 0 } else { 1 });
        }
        #[cfg(feature = "serial")]
        Commands::Listen { port, output } => {
            use zbcam::uplink::{open_radio, Listener};
            use zbcam::xbee::{Destination, ReaderHandle};

            let mut config = pre_config.unwrap_or_default();
            if let Some(dir) = output {
                config.listener.output_dir = dir;
            }
            let (writer, mut reader) = open_radio(&config, port.as_deref()).await?;
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            reader.on_frame(move |frame| {
                let _ = tx.send(frame);
            });
            let handle = ReaderHandle::spawn(reader);
            let template = Destination {
                broadcast_radius: config.radio.broadcast_radius,
                options: config.radio.transmit_options,
                ..Destination::new(0)
            };
            let mut listener = Listener::new(writer, template, &config.listener.output_dir);
            let stored = listener.run(rx, shutdown_signal()).await;
            handle.shutdown().await;
            info!("{} blob(s) stored", stored?);
        }
        #[cfg(feature = "serial")]
        Commands::SmokeTest {
            port,
            baud,
            timeout,
        } => {
            use tokio::time::{Duration, Instant};
            use zbcam::uplink::connect_sender;

            let mut config = pre_config.unwrap_or_default();
            config.radio.baud_rate = baud;
            let (mut sender, reader) = connect_sender(&config, Some(&port)).await?;
            info!("Starting smoke test on {} @ {} baud", port, baud);
            let start = Instant::now();
            let outcome =
                tokio::time::timeout(Duration::from_secs(timeout), sender.handshake()).await;
            reader.shutdown().await;
            let (status, attempts) = match outcome {
                Ok(Ok(attempts)) => ("ok", Some(attempts)),
                Ok(Err(e)) => {
                    warn!("handshake failed: {}", e);
                    ("failed", None)
                }
                Err(_) => ("timeout", None),
            };
            let payload = serde_json::json!({
                "status": status,
                "port": port,
                "peer_address": config.radio.peer_address,
                "handshake_attempts": attempts,
                "elapsed_ms": start.elapsed().as_millis() as u64,
                "timeout_seconds": timeout,
                "metrics": metrics::snapshot(),
            });
            println!("{}", payload);
            std::process::exit(if status == "ok" { 0 } else { 1 });
        }
    }

    Ok(())
}

#[cfg(feature = "serial")]
async fn load_for_radio(
    pre_config: Option<Config>,
    path: &str,
    peer: Option<String>,
) -> Result<Config> {
    let mut config = match pre_config {
        Some(c) => c,
        None => Config::load(path).await?,
    };
    if let Some(peer) = peer {
        config.radio.peer_address = peer;
    }
    config.validate()?;
    Ok(config)
}

#[cfg(feature = "serial")]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Deliver `blob` through the loopback peer and check what arrived.
async fn run_selftest(
    config: &Config,
    blob: &[u8],
    drop_ack_every: Option<u32>,
    drop_data_every: Option<u32>,
) -> Result<bool> {
    let peer_addr = config.peer_address()?;
    let queues = EventQueues::new(config.queues.capacities());
    let mut acks_seen = 0u32;
    let mut data_seen = 0u32;
    let peer = LoopbackPeer::new(peer_addr, queues.clone()).with_loss(move |dir, msg| {
        match (dir, msg) {
            (Direction::Downlink, Message::WriteDataAck { .. }) => {
                acks_seen += 1;
                drop_ack_every.is_some_and(|n| n > 0 && acks_seen % n == 0)
            }
            (Direction::Uplink, Message::WriteData { .. }) => {
                data_seen += 1;
                drop_data_every.is_some_and(|n| n > 0 && data_seen % n == 0)
            }
            _ => false,
        }
    });
    let mut sender =
        ReliableSender::new(peer, config.destination()?, queues, config.transfer.engine());
    sender.handshake().await?;
    let report = sender.send_blob(blob).await?;
    let received = sender.sink_mut().take_completed();
    let intact = received.len() == 1 && received[0].data == blob && received[0].crc32 == report.crc32;
    if !intact {
        error!("loopback peer did not reassemble the blob intact");
    }
    let payload = serde_json::json!({
        "report": report,
        "intact": intact,
        "metrics": metrics::snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(intact && report.is_complete())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity wins; otherwise the config file's level applies.
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });
    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Echo to the console only when someone is watching it.
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
