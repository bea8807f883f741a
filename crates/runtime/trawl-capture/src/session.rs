//! Capture sessions
//!
//! A session runs two OS threads. The reader pulls frames from a
//! `FrameSource` into a bounded queue; the ingest thread dissects, filters,
//! optionally writes the ring buffer and pushes packets through `Ingest`.
//! Stopping is cooperative: both threads poll a shared flag.

use crate::bpf::CaptureFilter;
use crate::dissect::dissect;
use crate::options::CaptureOptions;
use crate::source::{FrameSource, Poll};
use crate::trace::RingWriter;
use crate::{CaptureError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use trawl_config::CaptureConfig;
use trawl_core::{CaptureStats, Event, EventBus, Packet, RawFrame};
use trawl_store::{Ingest, Inspector};

/// Admits at most one running session. Owned by whoever starts sessions and
/// handed to each of them.
#[derive(Debug, Clone, Default)]
pub struct CaptureGuard {
    active: Arc<AtomicBool>,
}

impl CaptureGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn acquire(&self) -> Result<GuardToken> {
        self.active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| CaptureError::AlreadyCapturing)?;
        Ok(GuardToken(Arc::clone(&self.active)))
    }
}

/// Releases the guard when the last session thread lets go of it.
struct GuardToken(Arc<AtomicBool>);

impl Drop for GuardToken {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    PacketLimit,
    DurationLimit,
    EndOfInput,
    Failed(String),
}

struct Shared {
    /// Reader stops
    stop: AtomicBool,
    /// Ingest stops without draining the queue
    cancel: AtomicBool,
    packets: AtomicU64,
    dropped: AtomicU64,
    filtered: AtomicU64,
    bytes: AtomicU64,
    started: Instant,
    reason: Mutex<Option<StopReason>>,
    final_stats: Mutex<Option<CaptureStats>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            packets: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            started: Instant::now(),
            reason: Mutex::new(None),
            final_stats: Mutex::new(None),
        }
    }

    /// First reason wins, except that a packet limit reached while draining
    /// a finished source still counts as the packet limit.
    fn finish(&self, reason: StopReason) {
        let mut slot = self.reason.lock();
        let replace = match (&*slot, &reason) {
            (None, _) => true,
            (Some(StopReason::EndOfInput), StopReason::PacketLimit) => true,
            _ => false,
        };
        if reason == StopReason::Requested {
            self.cancel.store(true, Ordering::SeqCst);
        }
        if replace {
            *slot = Some(reason);
        }
        self.stop.store(true, Ordering::SeqCst);
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn stats(&self) -> CaptureStats {
        if let Some(stats) = self.final_stats.lock().clone() {
            return stats;
        }
        CaptureStats {
            packet_count: self.packets.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            filtered: self.filtered.load(Ordering::SeqCst),
            bytes: self.bytes.load(Ordering::SeqCst),
            duration: self.started.elapsed().as_secs_f64(),
        }
    }
}

/// A running capture.
pub struct CaptureSession {
    id: String,
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
    done: watch::Receiver<bool>,
    stop_timeout: Duration,
}

impl CaptureSession {
    /// Validate the options, claim the guard and spawn the session threads.
    pub fn start<S, I>(
        guard: &CaptureGuard,
        source: S,
        options: &CaptureOptions,
        settings: &CaptureConfig,
        ingest: Ingest<Packet, I>,
    ) -> Result<Self>
    where
        S: FrameSource + 'static,
        I: Inspector<Packet> + 'static,
    {
        let filter = options.validate()?;
        let token = Arc::new(guard.acquire()?);

        let ring = match (options.ring_buffer, &options.output_dir) {
            (true, Some(dir)) => Some(RingWriter::new(dir, options.max_file_size, options.max_files)?),
            _ => None,
        };

        let id = source.describe();
        let shared = Arc::new(Shared::new());
        let (tx, rx) = mpsc::channel(settings.channel_capacity.max(1));
        let (done_tx, done) = watch::channel(false);
        let bus = ingest.bus().clone();

        let reader = {
            let shared = Arc::clone(&shared);
            let token = Arc::clone(&token);
            let bus = bus.clone();
            let max_duration = options.max_duration();
            std::thread::Builder::new()
                .name("trawl-capture-reader".into())
                .spawn(move || {
                    read_loop(source, tx, &shared, &bus, max_duration);
                    drop(token);
                })?
        };

        let worker = IngestWorker {
            shared: Arc::clone(&shared),
            filter,
            ring,
            keep_raw: settings.keep_raw,
            max_packets: options.max_packets,
            ingest,
        };
        let ingester = std::thread::Builder::new()
            .name("trawl-capture-ingest".into())
            .spawn(move || {
                worker.run(rx, &bus, token);
                let _ = done_tx.send(true);
            })?;

        tracing::info!(source = %id, filter = %options.filter, "capture started");
        Ok(Self {
            id,
            shared,
            threads: vec![reader, ingester],
            done,
            stop_timeout: Duration::from_millis(settings.stop_timeout_ms),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        !*self.done.borrow()
    }

    /// Counters so far, or the final figures once the session ended.
    pub fn stats(&self) -> CaptureStats {
        self.shared.stats()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.shared.reason.lock().clone()
    }

    /// Wait until the session ends on its own (limit, end of input, failure).
    pub async fn wait(&self) -> CaptureStats {
        let mut done = self.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
        self.shared.stats()
    }

    /// Ask both threads to stop and wait for them, bounded by the configured
    /// stop timeout. Stopping an already finished session returns its final
    /// figures.
    pub async fn stop(mut self) -> CaptureStats {
        self.shared.finish(StopReason::Requested);

        let threads: Vec<_> = self.threads.drain(..).collect();
        let joined = tokio::task::spawn_blocking(move || {
            for handle in threads {
                if handle.join().is_err() {
                    tracing::error!("capture thread panicked");
                }
            }
        });
        if tokio::time::timeout(self.stop_timeout, joined).await.is_err() {
            tracing::warn!(session = %self.id, timeout = ?self.stop_timeout, "capture threads still running after stop timeout");
        }

        let stats = self.shared.stats();
        tracing::info!(session = %self.id, packets = stats.packet_count, dropped = stats.dropped, "capture stopped");
        stats
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.cancel.store(true, Ordering::SeqCst);
    }
}

fn read_loop<S: FrameSource>(
    mut source: S,
    tx: mpsc::Sender<RawFrame>,
    shared: &Shared,
    bus: &EventBus,
    max_duration: Option<Duration>,
) {
    let live = source.is_live();
    loop {
        if shared.stopping() {
            break;
        }
        if max_duration.is_some_and(|limit| shared.started.elapsed() >= limit) {
            tracing::info!("capture duration limit reached");
            shared.finish(StopReason::DurationLimit);
            break;
        }

        match source.next_frame() {
            Ok(Poll::Frame(frame)) if live => match tx.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    shared.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Closed(_)) => break,
            },
            Ok(Poll::Frame(frame)) => {
                if tx.blocking_send(frame).is_err() {
                    break;
                }
            }
            Ok(Poll::Idle) => continue,
            Ok(Poll::End) => {
                tracing::debug!(source = %source.describe(), "end of input");
                shared.finish(StopReason::EndOfInput);
                break;
            }
            Err(err) => {
                tracing::error!(source = %source.describe(), error = %err, "capture source failed");
                bus.publish(Event::CaptureError { code: err.code(), message: err.to_string() });
                shared.finish(StopReason::Failed(err.to_string()));
                break;
            }
        }
    }
}

struct IngestWorker<I: Inspector<Packet>> {
    shared: Arc<Shared>,
    filter: CaptureFilter,
    ring: Option<RingWriter>,
    keep_raw: bool,
    max_packets: u64,
    ingest: Ingest<Packet, I>,
}

impl<I: Inspector<Packet>> IngestWorker<I> {
    fn run(mut self, mut rx: mpsc::Receiver<RawFrame>, bus: &EventBus, token: Arc<GuardToken>) {
        let mut capture_start = None;

        while let Some(frame) = rx.blocking_recv() {
            if self.shared.cancel.load(Ordering::SeqCst) {
                break;
            }
            let start = *capture_start.get_or_insert(frame.timestamp);
            let packet = dissect(&frame, start, self.keep_raw);

            if !self.filter.matches(&packet) {
                self.shared.filtered.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            self.write_ring(&frame, bus);

            self.shared.bytes.fetch_add(packet.length as u64, Ordering::Relaxed);
            self.ingest.push(packet);
            let count = self.shared.packets.fetch_add(1, Ordering::SeqCst) + 1;

            if self.max_packets > 0 && count >= self.max_packets {
                tracing::info!(count, "capture packet limit reached");
                self.shared.finish(StopReason::PacketLimit);
                break;
            }
        }

        drop(rx);
        drop(self.ring.take());

        let stats = self.shared.stats();
        *self.shared.final_stats.lock() = Some(stats.clone());
        drop(token);
        bus.publish(Event::CaptureStopped(stats));
    }

    fn write_ring(&mut self, frame: &RawFrame, bus: &EventBus) {
        let Some(ring) = self.ring.as_mut() else { return };
        match ring.write(frame) {
            Ok(Some(path)) => {
                tracing::info!(path = %path.display(), "capture file rotated");
                bus.publish(Event::CaptureFileRotated { path });
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(error = %err, "ring buffer write failed, disabling it");
                bus.publish(Event::CaptureError { code: err.code(), message: err.to_string() });
                self.ring = None;
            }
        }
    }
}
