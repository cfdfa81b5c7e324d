use flowtop_common::FlowKey;

use crate::store::FlowTable;

/// "Now" plus sixty seconds back.
pub const HISTORY_CAPACITY: usize = 61;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Window {
    OneSecond,
    FifteenSeconds,
    SixtySeconds,
}

impl Window {
    pub const ALL: [Window; 3] = [
        Window::OneSecond,
        Window::FifteenSeconds,
        Window::SixtySeconds,
    ];

    pub fn seconds(self) -> usize {
        match self {
            Window::OneSecond => 1,
            Window::FifteenSeconds => 15,
            Window::SixtySeconds => 60,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Sample {
    pub upload_bytes: u64,
    pub download_bytes: u64,
}

/// Bits per second in both directions over one window.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct WindowRate {
    pub up: u64,
    pub down: u64,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FlowRates {
    pub one: WindowRate,
    pub fifteen: WindowRate,
    pub sixty: WindowRate,
}

/// Fixed-capacity ring of cumulative counters, oldest overwritten first. Each
/// window is one subtraction against an older sample.
#[derive(Clone, Debug)]
pub struct History {
    samples: [Sample; HISTORY_CAPACITY],
    // next slot to write
    head: usize,
    len: usize,
}

impl History {
    pub fn new() -> Self {
        Self {
            samples: [Sample::default(); HISTORY_CAPACITY],
            head: 0,
            len: 0,
        }
    }

    /// A ring holding one zero sample: the baseline a brand new flow starts from.
    pub fn seeded() -> Self {
        let mut history = Self::new();
        history.push(Sample::default());
        history
    }

    pub fn push(&mut self, sample: Sample) {
        self.samples[self.head] = sample;
        self.head = (self.head + 1) % HISTORY_CAPACITY;
        self.len = (self.len + 1).min(HISTORY_CAPACITY);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sample pushed `ago` ticks before the newest one (`0` is the newest).
    pub fn back(&self, ago: usize) -> Option<Sample> {
        if ago >= self.len {
            return None;
        }
        let idx = (self.head + HISTORY_CAPACITY - 1 - ago) % HISTORY_CAPACITY;
        Some(self.samples[idx])
    }

    /// Rate over `window`, or zero while the ring is too short to cover it.
    pub fn rate(&self, window: Window) -> WindowRate {
        let secs = window.seconds();
        let (Some(now), Some(then)) = (self.back(0), self.back(secs)) else {
            return WindowRate::default();
        };
        let secs = secs as u64;
        WindowRate {
            up: now.upload_bytes.saturating_sub(then.upload_bytes) * 8 / secs,
            down: now.download_bytes.saturating_sub(then.download_bytes) * 8 / secs,
        }
    }

    pub fn rates(&self) -> FlowRates {
        FlowRates {
            one: self.rate(Window::OneSecond),
            fifteen: self.rate(Window::FifteenSeconds),
            sixty: self.rate(Window::SixtySeconds),
        }
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

/// One sampler pass over a table: every record gets a new sample and its
/// rates are recomputed.
pub fn sample_table<K: FlowKey>(table: &FlowTable<K>) -> Vec<(K, FlowRates)> {
    table
        .snapshot()
        .into_iter()
        .map(|(key, record)| {
            let rates = record.sample();
            (key, rates)
        })
        .collect()
}
