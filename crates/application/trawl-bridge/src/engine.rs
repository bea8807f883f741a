//! The engine behind the bridge
//!
//! `Engine` owns both stores, the alert logs, the event bus and whichever
//! capture session and proxy server are active. It can be driven directly
//! (the CLI does) or moved onto a task with [`Engine::spawn`], after which a
//! cloneable [`BridgeHandle`] sends it commands.

use crate::command::Command;
use crate::export::{self, ExportFormat};
use crate::response::Response;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use trawl_analysis::{
    conversations, endpoints, io_graph, length_stats, protocol_hierarchy, tcp_streams, AggregateMonitor,
    PacketInspector, TransactionInspector,
};
use trawl_capture::{
    list_interfaces, CaptureError, CaptureGuard, CaptureOptions, CaptureSession, FileSource, FrameSource,
    InterfaceInfo, LiveSource,
};
use trawl_config::TrawlConfig;
use trawl_core::{
    Alert, AlertKind, CaptureStats, ErrorCode, Event, EventBus, HttpRequest, InterceptedItem, Packet,
    ProxyTransaction, Result, TrawlError,
};
use trawl_proxy::{
    CertificateAuthority, HistoryFilter, InterceptQueue, ProxyError, ProxyServer, ProxySettings, Recorder,
    Repeater, Upstream,
};
use trawl_store::{AlertLog, FilterExpr, Ingest, Inspector, Store};

/// Protocols listed per I/O graph bucket.
const IO_GRAPH_TOP_N: usize = 5;
const COMMAND_QUEUE: usize = 64;

pub struct Engine {
    config: TrawlConfig,
    bus: EventBus,
    packets: Arc<Store<Packet>>,
    packet_alerts: Arc<AlertLog>,
    transaction_alerts: Arc<AlertLog>,
    recorder: Arc<Recorder>,
    repeater: Repeater,
    guard: CaptureGuard,
    capture: Option<CaptureSession>,
    monitor: Option<AggregateMonitor>,
    proxy: Option<ProxyServer>,
    ca: Option<Arc<CertificateAuthority>>,
}

impl Engine {
    /// Build an engine and start its aggregate alert monitor. Must be called
    /// inside a tokio runtime.
    pub fn new(config: TrawlConfig) -> Self {
        let bus = EventBus::new(config.bridge.subscriber_queue);
        let packets = Arc::new(Store::new(config.store.max_packets));
        let packet_alerts = Arc::new(AlertLog::new(config.alerts.max_alerts));
        let transaction_alerts = Arc::new(AlertLog::new(config.alerts.max_alerts));

        let ingest = Ingest::transactions(
            Arc::new(Store::new(config.store.max_history)),
            Arc::clone(&transaction_alerts),
            Box::new(TransactionInspector::new()) as Box<dyn Inspector<ProxyTransaction>>,
            bus.clone(),
        );
        let recorder = Arc::new(Recorder::new(ingest));
        let repeater = Repeater::new(Upstream::new(&config.proxy), Arc::clone(&recorder));

        let monitor = AggregateMonitor::start(&config.alerts, Arc::clone(&packets), Arc::clone(&packet_alerts), bus.clone());

        if !config.capture.keep_raw {
            tracing::warn!("capture.keep_raw is off; plaintext-credential alerts cannot fire");
        }

        let ca_dir = config.proxy.ca_dir();
        let ca = match CertificateAuthority::load(&ca_dir) {
            Ok(ca) => {
                tracing::info!(dir = %ca_dir.display(), "loaded interception CA");
                Some(Arc::new(ca))
            }
            Err(ProxyError::NoCertificateAuthority) => None,
            Err(err) => {
                tracing::warn!(dir = %ca_dir.display(), error = %err, "ignoring unreadable CA");
                None
            }
        };

        Self {
            config,
            bus,
            packets,
            packet_alerts,
            transaction_alerts,
            recorder,
            repeater,
            guard: CaptureGuard::new(),
            capture: None,
            monitor: Some(monitor),
            proxy: None,
            ca,
        }
    }

    pub fn config(&self) -> &TrawlConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    pub fn packets(&self) -> &Arc<Store<Packet>> {
        &self.packets
    }

    pub fn history(&self) -> Arc<Store<ProxyTransaction>> {
        self.recorder.store()
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.as_ref().is_some_and(CaptureSession::is_running)
    }

    pub fn proxy(&self) -> Option<&ProxyServer> {
        self.proxy.as_ref()
    }

    pub fn certificate_authority(&self) -> Option<&Arc<CertificateAuthority>> {
        self.ca.as_ref()
    }

    // Capture

    pub fn interfaces(&self) -> Vec<InterfaceInfo> {
        list_interfaces()
    }

    pub fn start_capture(&mut self, device: &str, options: CaptureOptions) -> Result<()> {
        let options = self.prepare(options)?;
        let read_timeout = Duration::from_millis(self.config.capture.read_timeout_ms);
        let source = LiveSource::open(device, options.promiscuous, options.monitor_mode, read_timeout)?;
        self.begin(source, &options)
    }

    /// Start a session over any frame source (trace files, replays).
    pub fn start_source<S: FrameSource + 'static>(&mut self, source: S, options: CaptureOptions) -> Result<()> {
        let options = self.prepare(options)?;
        self.begin(source, &options)
    }

    /// Stop the active session. Returns its final figures, or `None` when
    /// nothing was capturing.
    pub async fn stop_capture(&mut self) -> Option<CaptureStats> {
        let session = self.capture.take()?;
        Some(session.stop().await)
    }

    /// Ingest a whole pcap/pcapng file as a new session and wait for it.
    pub async fn load_pcap_file(&mut self, path: &Path) -> Result<CaptureStats> {
        self.ensure_idle()?;
        let source = FileSource::open(path)?;
        self.start_source(source, CaptureOptions::default())?;
        let Some(session) = self.capture.take() else {
            return Err(TrawlError::Internal("capture session vanished".into()));
        };
        session.wait().await;
        let stats = session.stop().await;
        tracing::info!(path = %path.display(), packets = stats.packet_count, "trace loaded");
        Ok(stats)
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.guard.is_active() {
            return Err(CaptureError::AlreadyCapturing.into());
        }
        Ok(())
    }

    /// Refuse while capturing, fill defaults and check the options before
    /// anything is cleared.
    fn prepare(&self, mut options: CaptureOptions) -> Result<CaptureOptions> {
        self.ensure_idle()?;
        if options.ring_buffer && options.output_dir.is_none() {
            options.output_dir = self.config.capture.output_dir.clone();
        }
        options.validate()?;
        Ok(options)
    }

    /// A new session starts from an empty packet store.
    fn begin<S: FrameSource + 'static>(&mut self, source: S, options: &CaptureOptions) -> Result<()> {
        self.capture = None;
        self.clear_packets();
        let ingest = Ingest::packets(
            Arc::clone(&self.packets),
            Arc::clone(&self.packet_alerts),
            PacketInspector::new(&self.config.alerts),
            self.bus.clone(),
        );
        let session = CaptureSession::start(&self.guard, source, options, &self.config.capture, ingest)?;
        self.capture = Some(session);
        Ok(())
    }

    // Packets

    /// Packets numbered `start..=end` (either bound optional) that match
    /// the display filter.
    pub fn query_packets(&self, filter: Option<&str>, start: Option<u64>, end: Option<u64>) -> Vec<Arc<Packet>> {
        let expr = FilterExpr::parse(filter.unwrap_or_default());
        if start.is_none() && end.is_none() {
            return self.packets.filter(&expr).collect();
        }
        self.packets
            .range(start.unwrap_or(1), end.unwrap_or(u64::MAX))
            .filter(|p| expr.matches(&**p))
            .collect()
    }

    pub fn packet(&self, no: u64) -> Result<Arc<Packet>> {
        Ok(self.packets.get(no)?)
    }

    /// Empty the packet store and its alerts; numbering restarts at 1.
    pub fn clear_packets(&self) {
        self.reset_packets(1);
    }

    fn reset_packets(&self, first: u64) {
        let epoch = self.packets.clear_from(first);
        self.packet_alerts.clear(epoch);
        tracing::debug!(epoch, first, "packets cleared");
    }

    pub fn export_packets(&self, format: ExportFormat, path: &Path, filter: Option<&str>) -> Result<usize> {
        let packets = self.query_packets(filter, None, None);
        export::export_file(format, &packets, path)
    }

    /// Replace the packet store with a JSON export. Imported packets run
    /// through the packet rules like captured ones. A gapless export keeps
    /// its numbers; anything else is numbered from 1.
    pub fn import_packets(&mut self, path: &Path) -> Result<usize> {
        self.ensure_idle()?;
        let imported = export::import_file(path)?;
        self.capture = None;
        let first = contiguous_start(&imported);
        self.reset_packets(first.unwrap_or(1));
        if first.is_none() && !imported.is_empty() {
            tracing::debug!(path = %path.display(), "import has gaps, renumbering from 1");
        }

        let mut ingest = Ingest::packets(
            Arc::clone(&self.packets),
            Arc::clone(&self.packet_alerts),
            PacketInspector::new(&self.config.alerts),
            self.bus.clone(),
        );
        let count = imported.len();
        for packet in imported {
            ingest.push(packet);
        }
        tracing::info!(path = %path.display(), count, "packets imported");
        Ok(count)
    }

    // Alerts

    fn sweep(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.sweep();
        }
    }

    /// Expert alerts for the current packet session, oldest first.
    pub fn expert_alerts(&self) -> Vec<Alert> {
        self.sweep();
        self.packet_alerts.list(self.packets.epoch(), Some(AlertKind::Expert))
    }

    /// Security alerts from packets and proxy history, oldest first.
    pub fn security_alerts(&self) -> Vec<Alert> {
        self.sweep();
        let mut alerts = self.packet_alerts.list(self.packets.epoch(), Some(AlertKind::Security));
        let history = self.recorder.store();
        alerts.extend(self.transaction_alerts.list(history.epoch(), Some(AlertKind::Security)));
        alerts.sort_by_key(|a| a.timestamp);
        alerts
    }

    // Proxy

    pub async fn start_proxy(&mut self, port: Option<u16>, settings: Option<ProxySettings>) -> Result<u16> {
        if self.proxy.is_some() {
            return Err(ProxyError::AlreadyRunning.into());
        }
        let mut settings = settings.unwrap_or_else(|| ProxySettings::from(&self.config.proxy));
        if let Some(port) = port {
            settings.port = port;
        }
        let server = ProxyServer::start(
            settings,
            &self.config.proxy,
            Arc::clone(&self.recorder),
            self.ca.clone(),
            self.bus.clone(),
        )
        .await?;
        let port = server.port();
        self.proxy = Some(server);
        Ok(port)
    }

    /// Stop the proxy if it runs. Held requests are dropped.
    pub async fn stop_proxy(&mut self) -> bool {
        match self.proxy.take() {
            Some(server) => {
                server.stop().await;
                true
            }
            None => false,
        }
    }

    fn intercept(&self) -> Result<&Arc<InterceptQueue>> {
        self.proxy
            .as_ref()
            .map(ProxyServer::intercept)
            .ok_or_else(|| TrawlError::NotFound("proxy is not running".into()))
    }

    pub fn toggle_intercept(&self, enabled: bool) -> Result<bool> {
        let queue = self.intercept()?;
        queue.set_enabled(enabled);
        Ok(queue.is_enabled())
    }

    pub fn forward_intercept(&self, id: &str, request: Option<HttpRequest>) -> Result<InterceptedItem> {
        Ok(self.intercept()?.forward(id, request)?)
    }

    pub fn drop_intercept(&self, id: &str) -> Result<InterceptedItem> {
        Ok(self.intercept()?.discard(id)?)
    }

    pub fn pending_intercepts(&self) -> Result<Vec<InterceptedItem>> {
        Ok(self.intercept()?.pending())
    }

    pub fn proxy_history(&self, filters: &HistoryFilter) -> Vec<Arc<ProxyTransaction>> {
        filters.apply(&self.recorder.store())
    }

    pub fn clear_proxy_history(&self) {
        let epoch = self.recorder.store().clear();
        self.transaction_alerts.clear(epoch);
        tracing::debug!(epoch, "proxy history cleared");
        self.bus.publish(Event::ProxyHistoryCleared);
    }

    pub fn repeater(&self) -> Repeater {
        self.repeater.clone()
    }

    // Interception CA

    fn ca_dir(&self) -> PathBuf {
        self.config.proxy.ca_dir()
    }

    /// Generate and persist a fresh CA. A running proxy keeps the CA it was
    /// started with.
    pub fn generate_ca(&mut self) -> Result<(Arc<CertificateAuthority>, PathBuf)> {
        let ca = Arc::new(CertificateAuthority::generate()?);
        let path = ca.save(&self.ca_dir())?;
        tracing::info!(path = %path.display(), "generated interception CA");
        self.ca = Some(Arc::clone(&ca));
        Ok((ca, path))
    }

    fn require_ca(&self) -> Result<&Arc<CertificateAuthority>> {
        self.ca.as_ref().ok_or_else(|| ProxyError::NoCertificateAuthority.into())
    }

    pub fn export_ca(&self, path: &Path) -> Result<()> {
        Ok(self.require_ca()?.export_pem(path)?)
    }

    pub async fn install_ca(&self) -> Result<()> {
        let ca = Arc::clone(self.require_ca()?);
        Ok(ca.install(&self.ca_dir()).await?)
    }

    /// Stop everything that runs in the background.
    pub async fn shutdown(&mut self) {
        if let Some(stats) = self.stop_capture().await {
            tracing::debug!(packets = stats.packet_count, "capture stopped on shutdown");
        }
        self.stop_proxy().await;
        if let Some(monitor) = self.monitor.take() {
            monitor.stop().await;
        }
        tracing::info!("engine stopped");
    }

    /// Run one command to completion.
    pub async fn execute(&mut self, command: Command) -> Response {
        let method = command.method();
        let response = self.dispatch(command).await;
        match response.error_code() {
            Some(code) => tracing::warn!(method, %code, message = response.message().unwrap_or_default(), "command failed"),
            None => tracing::debug!(method, "command handled"),
        }
        response
    }

    async fn dispatch(&mut self, command: Command) -> Response {
        match command {
            Command::GetInterfaces => Response::ok().with("devices", self.interfaces()),
            Command::StartCapture { device, options } => match self.start_capture(&device, options) {
                Ok(()) => Response::ok(),
                Err(err) => err.into(),
            },
            Command::StopCapture => Response::ok().with("stats", self.stop_capture().await),
            Command::LoadPcapFile { path } => match self.load_pcap_file(&path).await {
                Ok(stats) => Response::ok()
                    .with("filepath", &path)
                    .with("packetCount", stats.packet_count)
                    .with("stats", stats),
                Err(err) => err.into(),
            },

            Command::GetPackets { filter, start, end } => {
                let packets = self.query_packets(filter.as_deref(), start, end);
                Response::ok().with("total", self.packets.len()).with("packets", packets)
            }
            Command::GetPacket { no } => match self.packet(no) {
                Ok(packet) => Response::ok().with("packet", packet),
                Err(err) => err.into(),
            },
            Command::ClearPackets => {
                self.clear_packets();
                Response::ok()
            }
            Command::ExportPackets { format, path, filter } => {
                match self.export_packets(format, &path, filter.as_deref()) {
                    Ok(count) => Response::ok().with("path", &path).with("count", count),
                    Err(err) => err.into(),
                }
            }
            Command::ImportPackets { path } => match self.import_packets(&path) {
                Ok(count) => Response::ok().with("count", count),
                Err(err) => err.into(),
            },

            Command::GetProtocolHierarchy => Response::ok().with("data", protocol_hierarchy(&self.packets.snapshot())),
            Command::GetConversations { kind } => Response::ok().with("data", conversations(&self.packets.snapshot(), kind)),
            Command::GetEndpoints { kind } => Response::ok().with("data", endpoints(&self.packets.snapshot(), kind)),
            Command::GetIoGraph { interval } => {
                let buckets = io_graph(&self.packets.snapshot(), interval.unwrap_or(1.0), IO_GRAPH_TOP_N);
                Response::ok().with("data", buckets)
            }
            Command::GetTcpStreams => Response::ok().with("data", tcp_streams(&self.packets.snapshot())),
            Command::GetPacketLengthStats => Response::ok().with("data", length_stats(&self.packets.snapshot())),

            Command::GetExpertAlerts => Response::ok().with("data", self.expert_alerts()),
            Command::GetSecurityAlerts => Response::ok().with("data", self.security_alerts()),

            Command::StartProxy { port, settings } => match self.start_proxy(port, settings).await {
                Ok(port) => Response::ok().with("port", port),
                Err(err) => err.into(),
            },
            Command::StopProxy => {
                self.stop_proxy().await;
                Response::ok()
            }
            Command::ToggleIntercept { enabled } => match self.toggle_intercept(enabled) {
                Ok(enabled) => Response::ok().with("enabled", enabled),
                Err(err) => err.into(),
            },
            Command::ForwardIntercept { id, request } => match self.forward_intercept(&id, request) {
                Ok(item) => Response::ok().with("item", item),
                Err(err) => err.into(),
            },
            Command::DropIntercept { id } => match self.drop_intercept(&id) {
                Ok(item) => Response::ok().with("item", item),
                Err(err) => err.into(),
            },
            Command::GetPendingIntercepts => match self.pending_intercepts() {
                Ok(items) => Response::ok().with("intercepts", items),
                Err(err) => err.into(),
            },
            Command::GetProxyHistory { filters } => Response::ok().with("history", self.proxy_history(&filters)),
            Command::ClearProxyHistory => {
                self.clear_proxy_history();
                Response::ok()
            }
            Command::RepeatRequest { request } => repeat(self.repeater(), request).await,

            Command::GenerateCaCertificate => match self.generate_ca() {
                Ok((ca, path)) => Response::ok().with("certificate", ca.cert_pem()).with("path", path),
                Err(err) => err.into(),
            },
            Command::ExportCaCertificate { path } => match self.export_ca(&path) {
                Ok(()) => Response::ok().with("path", &path),
                Err(err) => err.into(),
            },
            Command::InstallCaCertificate => match self.install_ca().await {
                Ok(()) => Response::ok().with("installed", true),
                Err(err) => err.into(),
            },
        }
    }

    /// Move the engine onto a task. Commands are handled one at a time in
    /// arrival order, except replays, which run alongside.
    pub fn spawn(self) -> BridgeHandle {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let bus = self.bus.clone();
        tokio::spawn(self.run(rx));
        BridgeHandle { tx, bus }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Message>) {
        while let Some(message) = rx.recv().await {
            match message {
                Message::Call(Command::RepeatRequest { request }, reply) => {
                    let repeater = self.repeater();
                    tokio::spawn(async move {
                        let _ = reply.send(repeat(repeater, request).await);
                    });
                }
                Message::Call(command, reply) => {
                    let _ = reply.send(self.execute(command).await);
                }
                Message::Shutdown(done) => {
                    self.shutdown().await;
                    let _ = done.send(());
                    return;
                }
            }
        }
        // Every handle is gone
        self.shutdown().await;
    }
}

/// First number of a run like `n, n+1, n+2, ...`.
fn contiguous_start(packets: &[Packet]) -> Option<u64> {
    let first = packets.first()?.no;
    let gapless = first >= 1 && packets.windows(2).all(|w| w[1].no == w[0].no + 1);
    gapless.then_some(first)
}

async fn repeat(repeater: Repeater, request: HttpRequest) -> Response {
    match repeater.repeat(request).await {
        Ok(tx) => Response::ok().with("result", tx),
        Err(err) => TrawlError::from(err).into(),
    }
}

enum Message {
    Call(Command, oneshot::Sender<Response>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable front door to a spawned engine.
#[derive(Clone)]
pub struct BridgeHandle {
    tx: mpsc::Sender<Message>,
    bus: EventBus,
}

impl BridgeHandle {
    pub async fn call(&self, command: Command) -> Response {
        let (reply, response) = oneshot::channel();
        if self.tx.send(Message::Call(command, reply)).await.is_err() {
            return Response::error(ErrorCode::Internal, "engine has stopped");
        }
        response
            .await
            .unwrap_or_else(|_| Response::error(ErrorCode::Internal, "engine dropped the command"))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.bus.subscriber_count()
    }

    /// Stop capture and proxy and end the engine task.
    pub async fn shutdown(&self) {
        let (done, stopped) = oneshot::channel();
        if self.tx.send(Message::Shutdown(done)).await.is_ok() {
            let _ = stopped.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trawl_capture::synth::Synth;
    use trawl_capture::ReplaySource;
    use trawl_core::RawFrame;

    fn config(dir: &Path) -> TrawlConfig {
        let mut config = TrawlConfig::default();
        config.proxy.ca_dir = Some(dir.join("ca"));
        config.proxy.listen_addr = "127.0.0.1".into();
        config
    }

    fn frames() -> Vec<RawFrame> {
        let mut synth = Synth::default();
        vec![
            synth.syn("10.0.0.1", "10.0.0.2", 40000, 80),
            synth.udp("10.0.0.3", "10.0.0.4", 5000, 53, b"q"),
            synth.tcp("10.0.0.2", "10.0.0.1", 80, 40000, 0x004, 1, &[]),
        ]
    }

    /// A source that never yields anything.
    struct Quiet;

    impl FrameSource for Quiet {
        fn next_frame(&mut self) -> trawl_capture::Result<trawl_capture::Poll> {
            std::thread::sleep(Duration::from_millis(5));
            Ok(trawl_capture::Poll::Idle)
        }

        fn describe(&self) -> String {
            "quiet".into()
        }
    }

    async fn replay(engine: &mut Engine, frames: Vec<RawFrame>) -> CaptureStats {
        engine.start_source(ReplaySource::new(frames), CaptureOptions::default()).unwrap();
        let stats = engine.capture.as_ref().unwrap().wait().await;
        engine.stop_capture().await;
        stats
    }

    #[tokio::test]
    async fn test_query_packets() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::new(config(dir.path()));
        assert_eq!(replay(&mut engine, frames()).await.packet_count, 3);

        assert_eq!(engine.query_packets(None, None, None).len(), 3);
        assert_eq!(engine.query_packets(Some("udp"), None, None).len(), 1);
        let range: Vec<u64> = engine.query_packets(None, Some(2), None).iter().map(|p| p.no).collect();
        assert_eq!(range, vec![2, 3]);
        assert_eq!(engine.query_packets(Some("tcp"), Some(2), Some(3)).len(), 1);
        assert_eq!(engine.packet(9).unwrap_err().code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_new_session_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::new(config(dir.path()));
        replay(&mut engine, frames()).await;
        assert!(!engine.expert_alerts().is_empty());

        replay(&mut engine, frames()[..1].to_vec()).await;
        assert_eq!(engine.packets().len(), 1);
        assert_eq!(engine.packet(1).unwrap().destination, "10.0.0.2");
        assert!(engine.expert_alerts().is_empty());
    }

    #[tokio::test]
    async fn test_second_capture_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::new(config(dir.path()));
        engine.start_source(Quiet, CaptureOptions::default()).unwrap();
        assert!(engine.is_capturing());

        let before = engine.packets().epoch();
        let err = engine.start_source(ReplaySource::new(Vec::new()), CaptureOptions::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ResourceBusy);
        assert_eq!(engine.packets().epoch(), before);
        let stats = engine.stop_capture().await.unwrap();
        assert_eq!(stats.packet_count, 0);
        assert!(!engine.is_capturing());
    }

    #[tokio::test]
    async fn test_bad_capture_filter_keeps_packets() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::new(config(dir.path()));
        replay(&mut engine, frames()).await;

        let err = engine
            .start_source(ReplaySource::new(frames()), CaptureOptions::default().filter("port banana"))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
        assert_eq!(engine.packets().len(), 3);
    }

    #[test]
    fn test_contiguous_start() {
        let numbered = |nos: &[u64]| -> Vec<Packet> {
            nos.iter()
                .map(|&no| {
                    let mut p = Packet::new(chrono::Utc::now(), 0.0, 60);
                    p.no = no;
                    p
                })
                .collect()
        };
        assert_eq!(contiguous_start(&numbered(&[11, 12, 13])), Some(11));
        assert_eq!(contiguous_start(&numbered(&[4])), Some(4));
        assert_eq!(contiguous_start(&numbered(&[4, 6])), None);
        assert_eq!(contiguous_start(&numbered(&[0, 1])), None);
        assert_eq!(contiguous_start(&[]), None);
    }

    #[tokio::test]
    async fn test_intercept_needs_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::new(config(dir.path()));
        let response = engine.execute(Command::ToggleIntercept { enabled: true }).await;
        assert_eq!(response.error_code(), Some(ErrorCode::NotFound));
        assert_eq!(engine.drop_intercept("missing").unwrap_err().code(), ErrorCode::NotFound);
        let response = engine.execute(Command::DropIntercept { id: "missing".into() }).await;
        assert_eq!(response.error_code(), Some(ErrorCode::NotFound));
        assert!(engine.execute(Command::StopProxy).await.is_success());
    }

    #[tokio::test]
    async fn test_ca_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::new(config(dir.path()));

        let out = dir.path().join("exported.pem");
        let response = engine.execute(Command::ExportCaCertificate { path: out.clone() }).await;
        assert_eq!(response.error_code(), Some(ErrorCode::NotFound));

        let response = engine.execute(Command::GenerateCaCertificate).await;
        assert!(response.is_success());
        let pem: String = response.field("certificate").unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));

        assert!(engine.execute(Command::ExportCaCertificate { path: out.clone() }).await.is_success());
        assert_eq!(std::fs::read_to_string(&out).unwrap(), pem);

        // A later engine picks the saved CA up
        let reloaded = Engine::new(config(dir.path()));
        assert_eq!(reloaded.certificate_authority().unwrap().cert_pem(), pem);
    }

    #[tokio::test]
    async fn test_spawned_engine() {
        let dir = tempfile::tempdir().unwrap();
        let handle = Engine::new(config(dir.path())).spawn();

        let response = handle.call(Command::GetPacket { no: 1 }).await;
        assert_eq!(response.error_code(), Some(ErrorCode::NotFound));
        let response = handle.call(Command::GetProtocolHierarchy).await;
        assert_eq!(response.get("data"), Some(&serde_json::json!([])));

        handle.shutdown().await;
        let response = handle.call(Command::GetInterfaces).await;
        assert_eq!(response.error_code(), Some(ErrorCode::Internal));
    }
}
