//! PacketViz Sensor - live TCP traffic visualization backend
//!
//! Captures TCP traffic on the host's active interface and streams packet
//! summaries to WebSocket clients.

use clap::{Parser, Subcommand};
use packetviz_capture::backend::native_backends;
use packetviz_capture::{list_interfaces, pick_device, primary_address, CaptureSession};
use packetviz_core::config::{ConfigLoader, PacketVizConfig};
use packetviz_web::{start_server, WebConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "packetviz")]
#[command(version)]
#[command(about = "Live TCP traffic sensor", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "PACKETVIZ_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture traffic and stream it to WebSocket clients (default)
    Run {
        /// Port for the WebSocket server
        #[arg(long)]
        port: Option<u16>,

        /// Do not start the WebSocket server
        #[arg(long)]
        no_web: bool,
    },

    /// List interfaces and the capture devices each backend reports
    Interfaces,

    /// Show platform and backend availability
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.clone());

    // CLI verbose flag takes precedence, then config, then default
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.server.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command.unwrap_or(Commands::Run {
        port: None,
        no_web: false,
    }) {
        Commands::Run { port, no_web } => {
            let mut config = config;
            if let Some(port) = port {
                config.web.port = port;
            }
            if no_web {
                config.web.enabled = false;
            }
            run_command(config).await
        }
        Commands::Interfaces => interfaces_command(&config),
        Commands::Status => status_command(&config),
    }
}

/// Load configuration from file/env, with fallback to defaults
fn load_config(cli_path: Option<PathBuf>) -> PacketVizConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}, using defaults", e);
            PacketVizConfig::default()
        }
    }
}

async fn run_command(config: PacketVizConfig) -> anyhow::Result<()> {
    info!("PacketViz sensor v{}", packetviz_core::SENSOR_VERSION);

    let (event_tx, _) = broadcast::channel(config.web.buffer_size.max(1));

    if config.web.enabled {
        let web_config = WebConfig::from(&config.web);
        let web_tx = event_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_server(web_config, web_tx).await {
                error!("Web server error: {}", e);
            }
        });
    } else {
        info!("WebSocket server disabled");
    }

    let session = CaptureSession::from_settings(&config.capture);
    let capture_tx = event_tx.clone();
    let backend = session.start(move |event| {
        // decode failures are not republished
        if let Some(event) = event {
            let _ = capture_tx.send(Arc::new(event));
        }
    })?;

    for attempt in session.attempts() {
        warn!("Backend {} unavailable: {}", attempt.kind, attempt.error);
    }
    info!("Capturing with the {} backend. Press Ctrl+C to stop.", backend);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    tokio::task::block_in_place(|| session.stop());

    let stats = session.stats();
    info!(
        "Captured {} events ({} frames filtered, {} decode failures)",
        stats.events_emitted, stats.frames_filtered, stats.decode_failures
    );

    Ok(())
}

fn interfaces_command(config: &PacketVizConfig) -> anyhow::Result<()> {
    println!();
    println!("Interfaces:");
    let interfaces = list_interfaces();
    if interfaces.is_empty() {
        println!("  (none with an external IPv4 address)");
    }
    for iface in &interfaces {
        println!("  {:<16} {}", iface.name, iface.address);
    }

    match primary_address() {
        Ok(address) => println!("Primary address: {}", address),
        Err(e) => println!("Primary address: {}", e),
    }

    for backend in native_backends(&config.capture) {
        println!();
        println!("{} devices:", backend.kind());

        let devices = match backend.devices() {
            Ok(devices) => devices,
            Err(e) => {
                println!("  {}", e);
                continue;
            }
        };

        let chosen = pick_device(&devices).ok().map(|d| d.name.clone());
        for device in &devices {
            let marker = if chosen.as_deref() == Some(device.name.as_str()) {
                "*"
            } else {
                " "
            };
            println!(
                "  {} {:<16} {}",
                marker,
                device.name,
                device.description.as_deref().unwrap_or("")
            );
        }
    }

    println!();
    Ok(())
}

fn status_command(config: &PacketVizConfig) -> anyhow::Result<()> {
    println!();
    println!("PacketViz Sensor v{}", packetviz_core::SENSOR_VERSION);
    println!();

    println!(
        "Platform: {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );

    #[cfg(unix)]
    {
        let uid = unsafe { libc::getuid() };
        println!("Running as root: {}", uid == 0);
    }

    println!();
    println!("Capture backends:");
    for backend in native_backends(&config.capture) {
        match backend.probe() {
            Ok(()) => println!("  {:<16} available", backend.kind()),
            Err(e) => println!("  {:<16} unavailable: {}", backend.kind(), e),
        }
    }
    println!(
        "  {:<16} always available (every {} ms)",
        "connection_poll", config.capture.poll_interval_ms
    );

    println!();
    Ok(())
}
