use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender, TrySendError};
use pcap::{Active, Capture, Device};
use tokio::{
    signal,
    sync::Notify,
    task,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    decode::{LinkKind, decode_frame},
    error::MonitorError,
    http,
    model::LocalNetworks,
    snapshot::render_table,
    stats::{Iface, IfaceOptions, Stats},
};

pub const DEFAULT_PORT: u16 = 16384;
pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_QUEUE_DEPTH: usize = 8192;
pub const DEFAULT_SNAPLEN: i32 = 65535;
pub const DEFAULT_RETENTION_SECS: u64 = 120;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const CAPTURE_TIMEOUT_MS: i32 = 100;
const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(100);
// enough for link + IPv6 + extension headers + transport ports
const HEADER_BYTES: usize = 256;

/// What the capture thread does when the worker queue is full.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum OverflowPolicy {
    /// Wait for a free slot; the kernel capture buffer absorbs the burst.
    Block,
    /// Discard the frame and count it.
    Drop,
}

#[derive(Clone, Debug)]
pub struct CaptureConfig {
    pub snaplen: i32,
    pub promisc: bool,
    pub filter: Option<String>,
}

pub struct MonitorOptions {
    pub ifaces: Vec<String>,
    pub enable_l4: bool,
    pub listen: SocketAddr,
    pub workers: usize,
    pub queue_depth: usize,
    pub overflow: OverflowPolicy,
    pub retention: Duration,
    pub local_nets: Option<PathBuf>,
    pub print: bool,
    pub capture: CaptureConfig,
}

fn validate_options(opts: &MonitorOptions) -> Result<()> {
    if opts.ifaces.is_empty() {
        return Err(anyhow!("at least one interface is required"));
    }
    if opts.workers == 0 {
        return Err(anyhow!("workers must be at least 1"));
    }
    if opts.queue_depth == 0 {
        return Err(anyhow!("queue depth must be at least 1"));
    }
    if opts.capture.snaplen <= 0 {
        return Err(anyhow!("snaplen must be positive"));
    }
    Ok(())
}

/// Header slice of one captured frame, handed from a capture thread to the
/// worker pool.
struct RawFrame {
    iface: Arc<Iface>,
    link: LinkKind,
    timestamp_ms: i64,
    wire_len: u64,
    data: Vec<u8>,
}

pub async fn run_monitor(opts: MonitorOptions) -> Result<()> {
    validate_options(&opts)?;

    let configured = LocalNetworks::from_option(opts.local_nets.as_deref())?;
    let devices = Device::list().unwrap_or_else(|err| {
        warn!(%err, "failed to list capture devices; interface addresses unknown");
        Vec::new()
    });

    let mut captures = Vec::with_capacity(opts.ifaces.len());
    let mut ifaces = Vec::with_capacity(opts.ifaces.len());
    for name in &opts.ifaces {
        let (capture, link) = open_capture(name, &opts.capture)?;
        let mut local = configured.clone();
        for device in devices.iter().filter(|d| &d.name == name) {
            for address in &device.addresses {
                local.insert_host(address.addr);
            }
        }
        info!(
            iface = %name,
            ?link,
            local_networks = local.len(),
            filter = opts.capture.filter.as_deref().unwrap_or(""),
            "capture opened"
        );
        ifaces.push(Iface::new(
            name.clone(),
            IfaceOptions {
                local,
                enable_l4: opts.enable_l4,
                retention: opts.retention,
            },
        ));
        captures.push((name.clone(), capture, link));
    }
    let stats = Arc::new(Stats::new(ifaces));
    let running = Arc::new(AtomicBool::new(true));

    let (tx, rx) = channel::bounded::<RawFrame>(opts.queue_depth);

    let mut workers = Vec::with_capacity(opts.workers);
    for worker_id in 0..opts.workers {
        let rx = rx.clone();
        workers.push(task::spawn_blocking(move || worker_loop(worker_id, rx)));
    }
    drop(rx);

    let capture_failed = Arc::new(Notify::new());
    let mut capturers = Vec::with_capacity(captures.len());
    for (name, capture, link) in captures {
        let iface = stats.get(&name)?.clone();
        let tx = tx.clone();
        let running = running.clone();
        let failed = capture_failed.clone();
        let overflow = opts.overflow;
        capturers.push(task::spawn_blocking(move || {
            supervise_capture(capture, link, iface, tx, overflow, &running, &failed)
        }));
    }
    // workers exit once every capture thread has dropped its sender
    drop(tx);

    let sampler_stats = stats.clone();
    let sampler_running = running.clone();
    let print = opts.print;
    let sampler = tokio::spawn(async move {
        let mut ticker = time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately; sample one interval later
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !sampler_running.load(Ordering::Relaxed) {
                break;
            }
            run_tick(&sampler_stats, Utc::now(), print);
        }
    });

    let server = http::serve(stats.clone(), opts.listen)?;
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);
    info!(listen = %opts.listen, "HTTP API listening");

    tokio::select! {
        res = shutdown_signal() => {
            res?;
            info!("received shutdown signal, draining");
        }
        _ = capture_failed.notified() => {
            warn!("capture stopped with an error, shutting down");
        }
    }
    running.store(false, Ordering::Relaxed);

    sampler.abort();
    let _ = sampler.await;
    server_handle.stop(true).await;
    let _ = server_task.await;

    let mut first_err = None;
    for handle in capturers {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                first_err = first_err.or(Some(err));
            }
            Err(err) => {
                first_err = first_err.or(Some(anyhow!("capture thread panicked: {err}")));
            }
        }
    }
    for handle in workers {
        if let Err(err) = handle.await {
            first_err = first_err.or(Some(anyhow!("worker panicked: {err}")));
        }
    }

    for iface in stats.iter() {
        let summary = iface.summary();
        info!(
            iface = %summary.name,
            frames = summary.frames,
            undecodable = summary.undecodable,
            queue_overflow = summary.queue_overflow,
            "monitor stopped"
        );
    }

    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use signal::unix::SignalKind;

    let mut term = signal::unix::signal(SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    let mut hangup = signal::unix::signal(SignalKind::hangup())
        .context("failed to install SIGHUP handler")?;
    tokio::select! {
        res = signal::ctrl_c() => res.context("failed to wait for ctrl-c"),
        _ = term.recv() => Ok(()),
        _ = hangup.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    signal::ctrl_c().await.context("failed to wait for ctrl-c")
}

fn open_capture(
    iface: &str,
    cfg: &CaptureConfig,
) -> std::result::Result<(Capture<Active>, LinkKind), MonitorError> {
    let open_err = |source| MonitorError::CaptureOpen {
        iface: iface.to_string(),
        source,
    };
    let mut capture = Capture::from_device(iface)
        .and_then(|c| {
            c.promisc(cfg.promisc)
                .snaplen(cfg.snaplen)
                .timeout(CAPTURE_TIMEOUT_MS)
                .immediate_mode(true)
                .open()
        })
        .map_err(open_err)?;

    if let Some(filter) = cfg.filter.as_deref().filter(|f| !f.trim().is_empty()) {
        capture
            .filter(filter, true)
            .map_err(|source| MonitorError::CaptureFilter {
                iface: iface.to_string(),
                filter: filter.to_string(),
                source,
            })?;
    }

    let dlt = capture.get_datalink();
    let link = LinkKind::from_dlt(dlt.0).ok_or_else(|| {
        open_err(pcap::Error::PcapError(format!(
            "unsupported link type {}",
            dlt.0
        )))
    })?;
    Ok((capture, link))
}

/// Header slice of one frame as read from the capture handle.
struct CapturedFrame {
    timestamp_ms: i64,
    wire_len: u64,
    data: Vec<u8>,
}

trait PacketSource {
    /// `Ok(None)` when the read timed out without a frame.
    fn next_frame(&mut self) -> std::result::Result<Option<CapturedFrame>, pcap::Error>;
}

impl PacketSource for Capture<Active> {
    fn next_frame(&mut self) -> std::result::Result<Option<CapturedFrame>, pcap::Error> {
        let packet = match self.next_packet() {
            Ok(packet) => packet,
            Err(pcap::Error::TimeoutExpired) => return Ok(None),
            Err(err) => return Err(err),
        };
        let header = packet.header;
        let keep = packet.data.len().min(HEADER_BYTES);
        Ok(Some(CapturedFrame {
            timestamp_ms: header.ts.tv_sec as i64 * 1_000 + header.ts.tv_usec as i64 / 1_000,
            wire_len: u64::from(header.len),
            data: packet.data[..keep].to_vec(),
        }))
    }
}

/// Runs one capture until shutdown. A read error is logged as it happens and
/// stops the whole monitor instead of leaving the interface dark.
fn supervise_capture<S: PacketSource>(
    source: S,
    link: LinkKind,
    iface: Arc<Iface>,
    tx: Sender<RawFrame>,
    overflow: OverflowPolicy,
    running: &AtomicBool,
    failed: &Notify,
) -> Result<()> {
    let name = iface.name().to_string();
    let result = capture_loop(source, link, iface, tx, overflow, running);
    if let Err(err) = &result {
        error!(iface = %name, "capture failed: {err:#}");
        running.store(false, Ordering::Relaxed);
        failed.notify_one();
    }
    result
}

fn capture_loop<S: PacketSource>(
    mut source: S,
    link: LinkKind,
    iface: Arc<Iface>,
    tx: Sender<RawFrame>,
    overflow: OverflowPolicy,
    running: &AtomicBool,
) -> Result<()> {
    while running.load(Ordering::Relaxed) {
        let captured = match source.next_frame() {
            Ok(Some(captured)) => captured,
            Ok(None) => continue,
            Err(pcap::Error::NoMorePackets) => break,
            Err(err) => {
                return Err(err).with_context(|| format!("capture on {} failed", iface.name()));
            }
        };
        let frame = RawFrame {
            iface: iface.clone(),
            link,
            timestamp_ms: captured.timestamp_ms,
            wire_len: captured.wire_len,
            data: captured.data,
        };
        if !enqueue(&tx, frame, overflow, &iface, running) {
            break;
        }
    }
    debug!(iface = %iface.name(), "capture loop finished");
    Ok(())
}

/// Returns `false` once the pipeline is shutting down.
fn enqueue(
    tx: &Sender<RawFrame>,
    mut frame: RawFrame,
    overflow: OverflowPolicy,
    iface: &Iface,
    running: &AtomicBool,
) -> bool {
    match overflow {
        OverflowPolicy::Drop => match tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                iface.record_overflow();
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        },
        OverflowPolicy::Block => loop {
            match tx.send_timeout(frame, ENQUEUE_TIMEOUT) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => {
                    if !running.load(Ordering::Relaxed) {
                        return false;
                    }
                    frame = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        },
    }
}

fn worker_loop(worker_id: usize, rx: Receiver<RawFrame>) {
    let mut processed: u64 = 0;
    for frame in rx.iter() {
        let decoded = decode_frame(
            frame.link,
            &frame.data,
            frame.wire_len,
            frame.timestamp_ms,
            frame.iface.local_networks(),
        );
        frame.iface.ingest(&decoded);
        processed += 1;
    }
    debug!(worker_id, processed, "worker drained");
}

fn run_tick(stats: &Stats, now: DateTime<Utc>, print: bool) {
    let now_ms = now.timestamp_millis();
    for iface in stats.iter() {
        let report = iface.tick(now_ms);
        debug!(
            iface = %iface.name(),
            l3_active = report.l3_active,
            l4_active = report.l4_active,
            l3_reaped = report.l3_reaped,
            l4_reaped = report.l4_reaped,
            "tick"
        );
        if print {
            print_iface(iface, now);
        }
    }
}

fn print_iface(iface: &Iface, now: DateTime<Utc>) {
    let timestamp = now.format("%Y-%m-%dT%H:%M:%SZ");
    println!("------ [{timestamp}] {}", iface.name());
    print!("{}", render_table(&iface.l3_snapshots()));
    if iface.l4_enabled() {
        println!();
        print!("{}", render_table(&iface.l4_snapshots()));
    }
}
