//! SensorLink - Stream phone sensors to a PC
//!
//! `server` runs on the PC, `client` plays the device and streams synthetic
//! samples for whatever the server starts.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sensorlink::channel::{ChannelError, ChannelEvent, ChannelState, ControlChannel, DataChannel};
use sensorlink::config::{self, Config};
use sensorlink::discovery::{DiscoveryClient, DiscoveryEvent, DiscoveryResponder};
use sensorlink::network::Endpoint;
use sensorlink::protocol::{
    CompassReading, ControlCommand, ControllerInfo, DataMessage, DataType, GestureDelta,
    MotionReading, PinchGesture, TouchPhase, TouchPoint, Vector3, PROTOCOL_VERSION,
};

/// SensorLink - Stream phone sensors to a PC
#[derive(Parser)]
#[command(name = "sensorlink")]
#[command(author = "SensorLink Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Stream sensor and gesture events to a PC over the local network", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as server (the PC receiving sensor data)
    Server {
        /// Interface to bind to
        #[arg(short, long)]
        bind: Option<String>,

        /// Control channel port
        #[arg(long)]
        control_port: Option<u16>,

        /// Data channel port
        #[arg(long)]
        data_port: Option<u16>,

        /// Data types to start on every device that connects
        #[arg(short, long, value_delimiter = ',')]
        start: Vec<DataType>,

        /// Do not answer discovery probes
        #[arg(long)]
        no_discovery: bool,
    },

    /// Run as client (a device streaming sensor data)
    Client {
        /// Server address, as `host` or `host:port`
        #[arg(short, long)]
        server: Option<String>,

        /// Find the server by broadcast discovery
        #[arg(short, long)]
        discover: bool,

        /// Send this text once connected
        #[arg(short, long)]
        text: Option<String>,

        /// Samples per second for each started data type
        #[arg(short, long, default_value_t = 20)]
        rate: u32,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Discover servers on the network
    Discover {
        /// How long to wait for replies (milliseconds)
        #[arg(short, long)]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Server {
            bind,
            control_port,
            data_port,
            start,
            no_discovery,
        } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.network.bind_address = bind;
            }
            if let Some(port) = control_port {
                config.network.control_port = port;
            }
            if let Some(port) = data_port {
                config.network.data_port = port;
            }
            if no_discovery {
                config.discovery.enabled = false;
            }
            run_server(config, start).await?;
        }
        Commands::Client {
            server,
            discover,
            text,
            rate,
        } => {
            run_client(config, server, discover, text, rate).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Discover { timeout } => {
            let mut config = config;
            if let Some(timeout) = timeout {
                config.discovery.timeout_ms = timeout;
            }
            run_discovery(config).await?;
        }
    }

    Ok(())
}

/// Put both channels back into listening mode for the next device
fn relisten(
    control: &ControlChannel,
    data: &DataChannel,
    control_endpoint: &Endpoint,
    data_endpoint: &Endpoint,
) -> anyhow::Result<()> {
    control.shutdown();
    data.shutdown();
    control.listen(control_endpoint)?;
    data.listen(data_endpoint)?;
    println!("Waiting for the next device...");
    Ok(())
}

fn session_ended(control: &ControlChannel, data: &DataChannel) -> bool {
    control.state() == ChannelState::Closed || data.state() == ChannelState::Closed
}

/// Run the server (the PC)
async fn run_server(config: Config, start: Vec<DataType>) -> anyhow::Result<()> {
    let control_endpoint = config.control_endpoint()?;
    let data_endpoint = config.data_endpoint()?;
    let network = config.network_config();

    let mut control = ControlChannel::new(network.clone(), config.controller_configuration());
    let mut data = DataChannel::new(network);
    let mut control_rx = control
        .take_event_receiver()
        .context("control events already taken")?;
    let mut data_rx = data
        .take_event_receiver()
        .context("data events already taken")?;

    control.listen(&control_endpoint)?;
    data.listen(&data_endpoint)?;

    let mut responder = if config.discovery.enabled {
        let discovery = config.discovery_config()?;
        let mut responder = DiscoveryResponder::from_config(&discovery, control_endpoint.port());
        responder.start().await?;
        Some(responder)
    } else {
        None
    };

    tracing::info!(
        "Starting SensorLink server on {} (data {})",
        control_endpoint,
        data_endpoint
    );

    println!("\n========================================");
    println!("  SensorLink Server Running");
    println!("========================================");
    println!("  Control: {}", control_endpoint);
    println!("  Data:    {}", data_endpoint);
    println!("  Discovery: {}", if responder.is_some() { "on" } else { "off" });
    println!("========================================");
    println!("\nWaiting for a device to connect...");
    println!("Press Ctrl+C to stop.\n");

    loop {
        tokio::select! {
            Some(event) = control_rx.recv() => {
                match event {
                    ChannelEvent::ClientAccepted { remote } => {
                        println!("+ Device connected: {}", remote);
                        for data_type in &start {
                            if let Err(e) = control.send(ControlCommand::Start(*data_type)) {
                                tracing::warn!("Could not start {}: {}", data_type, e);
                            }
                        }
                    }
                    ChannelEvent::ControlCommandSent => {
                        tracing::debug!("Control queue drained");
                    }
                    ChannelEvent::ConnectionClosed => {
                        println!("- Device disconnected");
                        if session_ended(&control, &data) {
                            relisten(&control, &data, &control_endpoint, &data_endpoint)?;
                        }
                    }
                    ChannelEvent::Error(e) => {
                        tracing::error!("Control channel error: {}", e);
                        if session_ended(&control, &data) {
                            relisten(&control, &data, &control_endpoint, &data_endpoint)?;
                        }
                    }
                    _ => {}
                }
            }
            Some(event) = data_rx.recv() => {
                match event {
                    ChannelEvent::ClientAccepted { remote } => {
                        tracing::info!("Data channel connected from {}", remote);
                    }
                    ChannelEvent::DataMessageReceived(message) => log_message(&message),
                    ChannelEvent::ConnectionClosed => {
                        if session_ended(&control, &data) {
                            relisten(&control, &data, &control_endpoint, &data_endpoint)?;
                        }
                    }
                    ChannelEvent::Error(e) => {
                        tracing::warn!("Data channel error: {}", e);
                        if session_ended(&control, &data) {
                            relisten(&control, &data, &control_endpoint, &data_endpoint)?;
                        }
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    control.shutdown();
    data.shutdown();
    if let Some(responder) = responder.as_mut() {
        responder.stop().await?;
    }
    tracing::info!("Server stopped");

    Ok(())
}

fn log_message(message: &DataMessage) {
    match message {
        DataMessage::ControllerInfo(info) => {
            println!(
                "  Device '{}' (protocol v{})",
                info.device_name, info.client_version
            );
        }
        DataMessage::Text(text) => println!("  Text: {}", text),
        message if message.data_type().is_continuous() => {
            tracing::debug!("{}: {:?}", message.data_type(), message);
        }
        message => tracing::info!("{}: {:?}", message.data_type(), message),
    }
}

/// Turn `host` or `host:port` into an endpoint
async fn resolve_server(server: &str, default_port: u16) -> anyhow::Result<Endpoint> {
    if let Ok(endpoint) = server.parse::<Endpoint>() {
        return Ok(endpoint);
    }
    let (host, port) = match server.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().context("invalid port")?),
        None => (server, default_port),
    };
    Ok(Endpoint::resolve(host, port).await?)
}

/// Run one discovery window and take the first server that answers
async fn discover_first(config: &Config) -> anyhow::Result<Endpoint> {
    println!("Discovering SensorLink servers...");
    let mut client = DiscoveryClient::new(config.discovery_config()?);
    let mut events = client
        .take_event_receiver()
        .context("discovery events already taken")?;
    client.discover_server().await?;

    match events.recv().await {
        Some(DiscoveryEvent::ServerDiscovered { address }) => Ok(address.into()),
        Some(DiscoveryEvent::TimeoutElapsed) | None => {
            anyhow::bail!("No server answered; specify one with --server")
        }
    }
}

/// Run the client (the device)
async fn run_client(
    config: Config,
    server: Option<String>,
    discover: bool,
    mut text: Option<String>,
    rate: u32,
) -> anyhow::Result<()> {
    let control_endpoint = if let Some(server) = server {
        resolve_server(&server, config.network.control_port).await?
    } else if discover {
        discover_first(&config).await?
    } else {
        anyhow::bail!("Please specify --server address or use --discover");
    };
    let data_endpoint = control_endpoint.with_port(config.network.data_port);

    let network = config.network_config();
    let mut control = ControlChannel::new(network.clone(), config.controller_configuration());
    let mut data = DataChannel::new(network);
    let mut control_rx = control
        .take_event_receiver()
        .context("control events already taken")?;
    let mut data_rx = data
        .take_event_receiver()
        .context("data events already taken")?;

    println!("Connecting to {}...", control_endpoint);
    control.connect(&control_endpoint)?;

    let mut started: HashSet<DataType> = HashSet::new();
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / rate.max(1) as f64));
    let epoch = Instant::now();

    loop {
        tokio::select! {
            Some(event) = control_rx.recv() => {
                match event {
                    ChannelEvent::Connected => {
                        tracing::info!("Control channel connected, opening data channel");
                        data.connect(&data_endpoint)?;
                    }
                    ChannelEvent::ControlCommandReceived(command) => match command {
                        ControlCommand::Configure(settings) => {
                            tracing::info!(
                                "Server configuration: tracing={} endpoint={:?}",
                                settings.tracing_enabled,
                                settings.tracing_endpoint
                            );
                        }
                        ControlCommand::Start(data_type) => {
                            println!("> Start {}", data_type);
                            started.insert(data_type);
                        }
                        ControlCommand::Stop(data_type) => {
                            println!("> Stop {}", data_type);
                            started.remove(&data_type);
                            data.purge_from_queue(data_type);
                        }
                    },
                    ChannelEvent::Error(e @ ChannelError::VersionMismatch { .. }) => {
                        control.shutdown();
                        data.shutdown();
                        return Err(e.into());
                    }
                    ChannelEvent::Error(ChannelError::Codec(e)) => {
                        tracing::warn!("Ignoring malformed command: {}", e);
                    }
                    ChannelEvent::Error(e) => {
                        tracing::error!("Control channel error: {}", e);
                        break;
                    }
                    ChannelEvent::ConnectionClosed => {
                        println!("Server closed the connection");
                        break;
                    }
                    _ => {}
                }
            }
            Some(event) = data_rx.recv() => {
                match event {
                    ChannelEvent::Connected => {
                        println!("Connected (UDP: {})", if data.has_udp() { "on" } else { "off" });
                        announce(&data, &config.general.device_name, text.take());
                    }
                    ChannelEvent::ConnectionClosed => {
                        println!("Server closed the data connection");
                        break;
                    }
                    ChannelEvent::Error(e) => {
                        tracing::warn!("Data channel error: {}", e);
                        if data.state() == ChannelState::Closed {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            _ = ticker.tick() => {
                if data.state() != ChannelState::Connected {
                    continue;
                }
                let t = epoch.elapsed().as_secs_f32();
                for data_type in &started {
                    let Some(sample) = synthetic_sample(*data_type, t) else {
                        continue;
                    };
                    if let Err(e) = data.send(sample) {
                        tracing::warn!("Dropping {} sample: {}", data_type, e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    control.shutdown();
    data.shutdown();
    tracing::info!("Client disconnected");

    Ok(())
}

/// A plausible sample of a continuous data type at time `t` (seconds)
/// Introduce the device and send the one-off text. A message that cannot be
/// sent is logged and skipped; returns how many were queued.
fn announce(data: &DataChannel, device_name: &str, text: Option<String>) -> usize {
    let info = DataMessage::ControllerInfo(ControllerInfo {
        client_version: PROTOCOL_VERSION,
        device_name: device_name.to_string(),
    });
    let mut queued = 0;
    for message in std::iter::once(info).chain(text.map(DataMessage::Text)) {
        let data_type = message.data_type();
        match data.send(message) {
            Ok(()) => queued += 1,
            Err(e) => tracing::warn!("Not sending {}: {}", data_type, e),
        }
    }
    queued
}

fn synthetic_sample(data_type: DataType, t: f32) -> Option<DataMessage> {
    let (s, c) = t.sin_cos();
    let drag = GestureDelta {
        x: 300.0 + 150.0 * c,
        y: 500.0 + 150.0 * s,
        dx: -150.0 * s,
        dy: 150.0 * c,
    };

    let sample = match data_type {
        DataType::Accelerometer => DataMessage::Accelerometer(Vector3::new(0.1 * s, 0.1 * c, -1.0)),
        DataType::Gyroscope => DataMessage::Gyroscope(Vector3::new(c, s, 0.05)),
        DataType::Compass => {
            let heading = (t * 10.0).rem_euclid(360.0);
            DataMessage::Compass(CompassReading {
                magnetic_heading: heading,
                true_heading: (heading + 2.5).rem_euclid(360.0),
                accuracy: 5.0,
                raw: Vector3::new(20.0 * c, 20.0 * s, -40.0),
            })
        }
        DataType::Motion => DataMessage::Motion(MotionReading {
            yaw: s,
            pitch: 0.5 * c,
            roll: 0.25 * s,
            gravity: Vector3::new(0.0, 0.0, -1.0),
            acceleration: Vector3::new(0.1 * s, 0.1 * c, 0.0),
        }),
        DataType::Touch => DataMessage::Touch(TouchPoint {
            id: 0,
            x: drag.x,
            y: drag.y,
            phase: TouchPhase::Moved,
        }),
        DataType::FreeDrag => DataMessage::FreeDrag(drag),
        DataType::HorizontalDrag => DataMessage::HorizontalDrag(GestureDelta { dy: 0.0, ..drag }),
        DataType::VerticalDrag => DataMessage::VerticalDrag(GestureDelta { dx: 0.0, ..drag }),
        DataType::CustomDrag => DataMessage::CustomDrag(drag),
        DataType::Pinch => DataMessage::Pinch(PinchGesture {
            first: drag,
            second: GestureDelta {
                x: 600.0 - drag.x,
                y: 1000.0 - drag.y,
                dx: -drag.dx,
                dy: -drag.dy,
            },
        }),
        _ => return None,
    };
    Some(sample)
}

/// Run server discovery
async fn run_discovery(config: Config) -> anyhow::Result<()> {
    let discovery = config.discovery_config()?;
    let window = discovery.timeout;
    println!("Scanning for SensorLink servers ({:?})...\n", window);

    let mut client = DiscoveryClient::new(discovery);
    let mut events = client
        .take_event_receiver()
        .context("discovery events already taken")?;
    client.discover_server().await?;

    let deadline = tokio::time::Instant::now() + window + Duration::from_millis(250);
    let mut found = 0;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        match event {
            DiscoveryEvent::ServerDiscovered { address } => {
                found += 1;
                println!("  {}", address);
            }
            DiscoveryEvent::TimeoutElapsed => break,
        }
    }

    println!("\nDiscovery complete: {} server(s) found.", found);
    Ok(())
}
