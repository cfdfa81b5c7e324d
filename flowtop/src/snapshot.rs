use std::{fmt::Write as _, sync::Arc};

use flowtop_common::FlowKey;
use parking_lot::RwLock;
use serde::Serialize;

use crate::rate::FlowRates;

/// Point-in-time copy of one flow's identity and rates (bits per second).
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FlowSnapshot {
    pub protocol: String,
    pub source_address: String,
    pub destination_address: String,
    pub up_stream_rate1: u64,
    pub down_stream_rate1: u64,
    pub up_stream_rate15: u64,
    pub down_stream_rate15: u64,
    pub up_stream_rate60: u64,
    pub down_stream_rate60: u64,
}

impl FlowSnapshot {
    pub fn new<K: FlowKey>(key: &K, rates: &FlowRates) -> Self {
        Self {
            protocol: key.protocol().to_string(),
            source_address: key.source(),
            destination_address: key.destination(),
            up_stream_rate1: rates.one.up,
            down_stream_rate1: rates.one.down,
            up_stream_rate15: rates.fifteen.up,
            down_stream_rate15: rates.fifteen.down,
            up_stream_rate60: rates.sixty.up,
            down_stream_rate60: rates.sixty.down,
        }
    }

    /// Sum of all six rates; zero means the flow is idle.
    pub fn total_rate(&self) -> u64 {
        self.up_stream_rate1
            + self.down_stream_rate1
            + self.up_stream_rate15
            + self.down_stream_rate15
            + self.up_stream_rate60
            + self.down_stream_rate60
    }

    /// "Top talker" ranking key.
    pub fn rank_key(&self) -> u64 {
        self.up_stream_rate1.max(self.down_stream_rate1)
    }
}

/// Builds snapshots from sampled rates, drops idle flows and sorts busiest
/// first by the 1s rate.
pub fn rank<K: FlowKey>(sampled: &[(K, FlowRates)]) -> Vec<FlowSnapshot> {
    let mut snapshots: Vec<FlowSnapshot> = sampled
        .iter()
        .map(|(key, rates)| FlowSnapshot::new(key, rates))
        .filter(|snapshot| snapshot.total_rate() > 0)
        .collect();
    snapshots.sort_unstable_by(|a, b| b.rank_key().cmp(&a.rank_key()));
    snapshots
}

/// The L3 and L4 lists of one tick, published together.
#[derive(Clone, Debug, Default)]
pub struct Published {
    pub generation: u64,
    pub l3: Arc<[FlowSnapshot]>,
    pub l4: Arc<[FlowSnapshot]>,
}

/// Latest published pair plus a counter bumped on every publish. Readers clone
/// the `Arc`s and never see a partially built list or lists from two ticks.
#[derive(Debug, Default)]
pub struct SnapshotBoard {
    current: RwLock<Published>,
}

impl SnapshotBoard {
    pub fn publish(&self, l3: Vec<FlowSnapshot>, l4: Vec<FlowSnapshot>) -> u64 {
        let mut current = self.current.write();
        current.generation += 1;
        current.l3 = l3.into();
        current.l4 = l4.into();
        current.generation
    }

    pub fn current(&self) -> Published {
        self.current.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }
}

pub fn format_rate(rate: u64) -> String {
    if rate >= 1_000_000 {
        format!("{:.2} Mbps", rate as f64 / 1_000_000.0)
    } else if rate >= 1_000 {
        format!("{:.2} Kbps", rate as f64 / 1_000.0)
    } else {
        format!("{rate} bps")
    }
}

/// Console table; empty when there is nothing to show.
pub fn render_table(flows: &[FlowSnapshot]) -> String {
    let mut out = String::new();
    if flows.is_empty() {
        return out;
    }
    let _ = writeln!(
        out,
        "{:<8} {:<32} {:<32} {:<16} {:<16} {:<16} {:<16} {:<16} {:<16}",
        "Protocol", "Src", "Dst", "Up1", "Down1", "Up15", "Down15", "Up60", "Down60"
    );
    for f in flows {
        let _ = writeln!(
            out,
            "{:<8} {:<32} {:<32} {:<16} {:<16} {:<16} {:<16} {:<16} {:<16}",
            f.protocol,
            f.source_address,
            f.destination_address,
            format_rate(f.up_stream_rate1),
            format_rate(f.down_stream_rate1),
            format_rate(f.up_stream_rate15),
            format_rate(f.down_stream_rate15),
            format_rate(f.up_stream_rate60),
            format_rate(f.down_stream_rate60),
        );
    }
    out
}
