use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use flowtop_common::{DecodedFrame, L3Key, L4Key, derive_keys};
use serde::Serialize;

use crate::{
    error::{MonitorError, Result},
    model::LocalNetworks,
    rate::{HISTORY_CAPACITY, sample_table},
    snapshot::{FlowSnapshot, Published, SnapshotBoard, rank},
    store::FlowTable,
};

/// A reaped flow must already have cold windows, so retention never drops
/// below the history span.
pub const MIN_RETENTION: Duration = Duration::from_secs(HISTORY_CAPACITY as u64);
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(120);

#[derive(Clone, Debug)]
pub struct IfaceOptions {
    pub local: LocalNetworks,
    pub enable_l4: bool,
    pub retention: Duration,
}

impl Default for IfaceOptions {
    fn default() -> Self {
        Self {
            local: LocalNetworks::empty(),
            enable_l4: false,
            retention: DEFAULT_RETENTION,
        }
    }
}

#[derive(Debug, Default)]
struct FrameCounters {
    frames: AtomicU64,
    undecodable: AtomicU64,
    no_transport: AtomicU64,
    queue_overflow: AtomicU64,
}

/// What one tick did, for logging.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TickReport {
    pub l3_active: usize,
    pub l4_active: usize,
    pub l3_reaped: usize,
    pub l4_reaped: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct IfaceSummary {
    pub name: String,
    pub l4_enabled: bool,
    pub frames: u64,
    pub undecodable: u64,
    pub no_transport: u64,
    pub queue_overflow: u64,
    pub l3_flows: usize,
    pub l4_flows: usize,
}

pub struct Iface {
    name: String,
    local: LocalNetworks,
    enable_l4: bool,
    retention_ms: i64,
    l3: FlowTable<L3Key>,
    l4: FlowTable<L4Key>,
    published: SnapshotBoard,
    counters: FrameCounters,
}

impl Iface {
    pub fn new(name: impl Into<String>, opts: IfaceOptions) -> Self {
        let retention = opts.retention.max(MIN_RETENTION);
        Self {
            name: name.into(),
            local: opts.local,
            enable_l4: opts.enable_l4,
            retention_ms: i64::try_from(retention.as_millis()).unwrap_or(i64::MAX),
            l3: FlowTable::new(),
            l4: FlowTable::new(),
            published: SnapshotBoard::default(),
            counters: FrameCounters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_networks(&self) -> &LocalNetworks {
        &self.local
    }

    pub fn l4_enabled(&self) -> bool {
        self.enable_l4
    }

    /// Credits one frame to its L3 flow and, when enabled, its L4 flow.
    /// Frames without a network layer are only counted.
    pub fn ingest(&self, frame: &DecodedFrame) {
        self.counters.frames.fetch_add(1, Ordering::Relaxed);
        let Some(keys) = derive_keys(frame) else {
            self.counters.undecodable.fetch_add(1, Ordering::Relaxed);
            return;
        };
        self.l3
            .add_bytes(&keys.l3, keys.direction, frame.wire_len, frame.timestamp_ms);
        if !self.enable_l4 {
            return;
        }
        match keys.l4 {
            Some(l4) => self
                .l4
                .add_bytes(&l4, keys.direction, frame.wire_len, frame.timestamp_ms),
            None => {
                self.counters.no_transport.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Frames the capture side had to discard before ingestion.
    pub fn record_overflow(&self) {
        self.counters.queue_overflow.fetch_add(1, Ordering::Relaxed);
    }

    /// One sampler pass: push history, publish both ranked lists at once and
    /// reap flows idle for longer than the retention period.
    pub fn tick(&self, now_ms: i64) -> TickReport {
        let mut report = TickReport::default();

        let l3 = rank(&sample_table(&self.l3));
        let l4 = if self.enable_l4 {
            rank(&sample_table(&self.l4))
        } else {
            Vec::new()
        };
        report.l3_active = l3.len();
        report.l4_active = l4.len();
        self.published.publish(l3, l4);

        let cutoff = now_ms.saturating_sub(self.retention_ms);
        report.l3_reaped = self.l3.reap(cutoff);
        report.l4_reaped = self.l4.reap(cutoff);
        report
    }

    pub fn l3_snapshots(&self) -> Arc<[FlowSnapshot]> {
        self.published.current().l3
    }

    pub fn l4_snapshots(&self) -> Arc<[FlowSnapshot]> {
        self.published.current().l4
    }

    /// Both lists of the latest tick.
    pub fn published(&self) -> Published {
        self.published.current()
    }

    /// Bumped once per tick, after both lists are in place.
    pub fn generation(&self) -> u64 {
        self.published.generation()
    }

    pub fn l3_table(&self) -> &FlowTable<L3Key> {
        &self.l3
    }

    pub fn l4_table(&self) -> &FlowTable<L4Key> {
        &self.l4
    }

    pub fn summary(&self) -> IfaceSummary {
        IfaceSummary {
            name: self.name.clone(),
            l4_enabled: self.enable_l4,
            frames: self.counters.frames.load(Ordering::Relaxed),
            undecodable: self.counters.undecodable.load(Ordering::Relaxed),
            no_transport: self.counters.no_transport.load(Ordering::Relaxed),
            queue_overflow: self.counters.queue_overflow.load(Ordering::Relaxed),
            l3_flows: self.l3.len(),
            l4_flows: self.l4.len(),
        }
    }
}

/// Registry of monitored interfaces, fixed for the life of the process.
pub struct Stats {
    ifaces: HashMap<String, Arc<Iface>>,
    order: Vec<String>,
}

impl Stats {
    pub fn new(ifaces: impl IntoIterator<Item = Iface>) -> Self {
        let mut map = HashMap::new();
        let mut order = Vec::new();
        for iface in ifaces {
            let name = iface.name().to_string();
            if map.insert(name.clone(), Arc::new(iface)).is_none() {
                order.push(name);
            }
        }
        Self { ifaces: map, order }
    }

    pub fn get(&self, name: &str) -> Result<&Arc<Iface>> {
        self.ifaces
            .get(name)
            .ok_or_else(|| MonitorError::UnknownInterface(name.to_string()))
    }

    /// First interface given at startup; the default for API requests.
    pub fn primary(&self) -> Option<&Arc<Iface>> {
        self.order.first().and_then(|name| self.ifaces.get(name))
    }

    /// Resolves an optional interface name, falling back to the primary one.
    pub fn resolve(&self, name: Option<&str>) -> Result<&Arc<Iface>> {
        match name {
            Some(name) => self.get(name),
            None => self
                .primary()
                .ok_or_else(|| MonitorError::UnknownInterface(String::new())),
        }
    }

    pub fn tick(&self, name: &str, now_ms: i64) -> Result<TickReport> {
        Ok(self.get(name)?.tick(now_ms))
    }

    /// Interfaces in startup order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Iface>> {
        self.order.iter().filter_map(|name| self.ifaces.get(name))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
