//! trawl CLI
//!
//! ```bash
//! trawl interfaces
//! trawl capture eth0 --filter "tcp port 443" --count 100 --write out.pcapng
//! trawl read trace.pcap --display "ip.src==10.0.0.1" --hierarchy
//! trawl proxy --port 8080
//! trawl ca generate
//! trawl serve --listen 127.0.0.1:9420
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trawl_analysis::{protocol_hierarchy, ProtocolStat};
use trawl_bridge::{ws, Engine, ExportFormat};
use trawl_capture::CaptureOptions;
use trawl_config::{LoggingConfig, TrawlConfig};
use trawl_core::{Alert, Event, ProxyTransaction, TransactionState};
use trawl_proxy::ProxySettings;

#[derive(Parser)]
#[command(name = "trawl")]
#[command(about = "Packet capture, analysis and intercepting HTTP proxy")]
#[command(version)]
struct Cli {
    /// Configuration file (default: $TRAWL_CONFIG, then ~/.config/trawl/config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List capture interfaces
    Interfaces,

    /// Capture live traffic until a limit is hit or Ctrl-C
    Capture {
        device: String,

        /// Capture filter, e.g. "tcp port 80"
        #[arg(short, long, default_value = "")]
        filter: String,

        /// Stop after this many packets
        #[arg(short = 'n', long, default_value_t = 0)]
        count: u64,

        /// Stop after this many seconds
        #[arg(short, long, default_value_t = 0)]
        duration: u64,

        #[arg(long)]
        promisc: bool,

        #[arg(long)]
        monitor: bool,

        /// Export the session when it ends; format follows the extension
        #[arg(short, long)]
        write: Option<PathBuf>,
    },

    /// Read a pcap or pcapng file
    Read {
        path: PathBuf,

        /// Display filter, e.g. "ip.src==10.0.0.1"
        #[arg(short, long)]
        display: Option<String>,

        /// Print the protocol hierarchy instead of packets
        #[arg(long)]
        hierarchy: bool,

        /// Print expert and security alerts after the packets
        #[arg(long)]
        alerts: bool,

        /// Export the (filtered) packets; format follows the extension
        #[arg(short, long)]
        write: Option<PathBuf>,
    },

    /// Run the intercepting proxy and print history until Ctrl-C
    Proxy {
        #[arg(short, long)]
        port: Option<u16>,

        /// Relay CONNECT tunnels without decrypting them
        #[arg(long)]
        no_tls: bool,
    },

    /// Manage the interception CA
    Ca {
        #[command(subcommand)]
        action: CaAction,
    },

    /// Serve the WebSocket bridge for a UI
    Serve {
        /// Listen address (default: bridge.listen from config)
        #[arg(short, long)]
        listen: Option<String>,
    },
}

#[derive(Subcommand)]
enum CaAction {
    /// Create a new CA and save it
    Generate,
    /// Write the CA certificate as PEM
    Export { path: PathBuf },
    /// Add the CA to the system trust store
    Install,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = TrawlConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_logging(&config.logging, cli.json_logs);

    match cli.command {
        Commands::Interfaces => interfaces(),
        Commands::Capture { device, filter, count, duration, promisc, monitor, write } => {
            let options = CaptureOptions {
                filter,
                promiscuous: promisc,
                monitor_mode: monitor,
                max_packets: count,
                max_duration_secs: duration,
                ..Default::default()
            };
            capture(config, &device, options, write.as_deref()).await
        }
        Commands::Read { path, display, hierarchy, alerts, write } => {
            read(config, &path, display.as_deref(), hierarchy, alerts, write.as_deref()).await
        }
        Commands::Proxy { port, no_tls } => proxy(config, port, no_tls).await,
        Commands::Ca { action } => ca(config, action).await,
        Commands::Serve { listen } => serve(config, listen).await,
    }
}

fn init_logging(config: &LoggingConfig, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));
    let registry = tracing_subscriber::registry().with(filter);
    // Logs go to stderr so packet output stays pipeable
    if json || config.json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn interfaces() -> Result<()> {
    let devices = trawl_capture::list_interfaces();
    if devices.is_empty() {
        println!("No capture interfaces found");
    }
    for device in devices {
        let state = if device.is_up { "up" } else { "down" };
        let mac = device.mac.as_deref().unwrap_or("-");
        println!("{:<16} {:<5} {:<18} {}", device.name, state, mac, device.addresses.join(", "));
    }
    Ok(())
}

async fn capture(config: TrawlConfig, device: &str, options: CaptureOptions, write: Option<&Path>) -> Result<()> {
    let format = write.map(export_format).transpose()?;
    let mut engine = Engine::new(config);
    let mut events = engine.subscribe();
    engine.start_capture(device, options)?;
    eprintln!("Capturing on {device}, Ctrl-C to stop");

    follow_capture(&mut events).await;
    if let Some(stats) = engine.stop_capture().await {
        eprintln!(
            "{} packets, {} bytes, {} dropped in {:.1}s",
            stats.packet_count, stats.bytes, stats.dropped, stats.duration
        );
    }
    if let (Some(path), Some(format)) = (write, format) {
        let count = engine.export_packets(format, path, None)?;
        eprintln!("Wrote {count} packets to {}", path.display());
    }
    engine.shutdown().await;
    Ok(())
}

async fn follow_capture(events: &mut broadcast::Receiver<Event>) {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = events.recv() => match event {
                Ok(Event::PacketCaptured(packet)) => println!("{packet}"),
                Ok(Event::ExpertAlert(alert)) | Ok(Event::SecurityAlert(alert)) => print_alert(&alert),
                Ok(Event::CaptureError { code, message }) => eprintln!("capture error [{code}]: {message}"),
                Ok(Event::CaptureFileRotated { path }) => eprintln!("rotated to {}", path.display()),
                Ok(Event::CaptureStopped(_)) | Err(RecvError::Closed) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => tracing::warn!(missed, "output fell behind"),
            },
        }
    }
}

async fn read(
    config: TrawlConfig,
    path: &Path,
    display: Option<&str>,
    hierarchy: bool,
    alerts: bool,
    write: Option<&Path>,
) -> Result<()> {
    let format = write.map(export_format).transpose()?;
    let mut engine = Engine::new(config);
    let stats = engine.load_pcap_file(path).await?;
    tracing::info!(packets = stats.packet_count, "file loaded");

    let packets = engine.query_packets(display, None, None);
    if hierarchy {
        print_hierarchy(&protocol_hierarchy(&packets), 0);
    } else {
        packets.iter().for_each(|packet| println!("{packet}"));
    }
    if alerts {
        engine.expert_alerts().iter().chain(&engine.security_alerts()).for_each(print_alert);
    }
    if let (Some(out), Some(format)) = (write, format) {
        let count = engine.export_packets(format, out, display)?;
        eprintln!("Wrote {count} packets to {}", out.display());
    }
    engine.shutdown().await;
    Ok(())
}

async fn proxy(config: TrawlConfig, port: Option<u16>, no_tls: bool) -> Result<()> {
    let mut settings = ProxySettings::from(&config.proxy);
    if no_tls {
        settings.intercept_tls = false;
    }
    let mut engine = Engine::new(config);
    if settings.intercept_tls && engine.certificate_authority().is_none() {
        eprintln!("No CA found; HTTPS is relayed without decryption (see `trawl ca generate`)");
    }
    let mut events = engine.subscribe();
    let port = engine.start_proxy(port, Some(settings)).await?;
    eprintln!("Proxy listening on port {port}, Ctrl-C to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = events.recv() => match event {
                Ok(Event::ProxyHistoryUpdate(tx)) => print_transaction(&tx),
                Ok(Event::SecurityAlert(alert)) => print_alert(&alert),
                Ok(Event::ProxyError { message }) => eprintln!("proxy error: {message}"),
                Ok(Event::ProxyStopped) | Err(RecvError::Closed) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => tracing::warn!(missed, "output fell behind"),
            },
        }
    }
    engine.shutdown().await;
    Ok(())
}

async fn ca(config: TrawlConfig, action: CaAction) -> Result<()> {
    let mut engine = Engine::new(config);
    match action {
        CaAction::Generate => {
            let (_, path) = engine.generate_ca()?;
            println!("CA certificate saved to {}", path.display());
        }
        CaAction::Export { path } => {
            engine.export_ca(&path)?;
            println!("CA certificate written to {}", path.display());
        }
        CaAction::Install => {
            engine.install_ca().await?;
            println!("CA certificate installed");
        }
    }
    engine.shutdown().await;
    Ok(())
}

async fn serve(config: TrawlConfig, listen: Option<String>) -> Result<()> {
    let addr = listen.unwrap_or_else(|| config.bridge.listen.clone());
    let listener = TcpListener::bind(addr.as_str()).await.with_context(|| format!("binding {addr}"))?;
    let handle = Engine::new(config).spawn();

    ws::serve(listener, handle.clone(), async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
    })
    .await?;
    handle.shutdown().await;
    Ok(())
}

fn export_format(path: &Path) -> Result<ExportFormat> {
    match ExportFormat::from_path(path) {
        Some(format) => Ok(format),
        None => bail!("cannot tell the export format of {}; use one of {}", path.display(), format_list()),
    }
}

fn format_list() -> String {
    ExportFormat::ALL.iter().map(ExportFormat::extension).collect::<Vec<_>>().join(", ")
}

fn print_alert(alert: &Alert) {
    eprintln!("[{:?}] {} {}: {}", alert.severity, alert.protocol, alert.category, alert.message);
}

fn print_transaction(tx: &ProxyTransaction) {
    let outcome = match (&tx.state, tx.status()) {
        (TransactionState::Aborted { reason }, _) => format!("aborted ({reason})"),
        (_, Some(status)) => status.to_string(),
        (_, None) => "-".to_string(),
    };
    println!("{:>5} {:<7} {} {}", tx.no, tx.request.method, tx.request.url, outcome);
}

fn print_hierarchy(stats: &[ProtocolStat], depth: usize) {
    for stat in stats {
        println!(
            "{:indent$}{:<16} {:>8} packets {:>10} bytes {:>7}%",
            "",
            stat.protocol,
            stat.packets,
            stat.bytes,
            stat.percentage,
            indent = depth * 2
        );
        print_hierarchy(&stat.children, depth + 1);
    }
}
