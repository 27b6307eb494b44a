//! Counters and the in-memory log ring served by `gordon logs`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

#[derive(Debug, Default)]
pub struct Counters {
    pub deploys_started: AtomicU64,
    pub deploys_committed: AtomicU64,
    pub deploys_failed: AtomicU64,
    pub deploys_coalesced: AtomicU64,
    pub resolver_hits: AtomicU64,
    pub resolver_misses: AtomicU64,
    pub resolver_negative_hits: AtomicU64,
    pub bus_published: AtomicU64,
    pub bus_backpressure: AtomicU64,
    pub probes_failed: AtomicU64,
    pub monitor_restarts: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct CountersSnapshot {
    pub deploys_started: u64,
    pub deploys_committed: u64,
    pub deploys_failed: u64,
    pub deploys_coalesced: u64,
    pub resolver_hits: u64,
    pub resolver_misses: u64,
    pub resolver_negative_hits: u64,
    pub bus_published: u64,
    pub bus_backpressure: u64,
    pub probes_failed: u64,
    pub monitor_restarts: u64,
}

impl Counters {
    pub fn snapshot(&self) -> CountersSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CountersSnapshot {
            deploys_started: load(&self.deploys_started),
            deploys_committed: load(&self.deploys_committed),
            deploys_failed: load(&self.deploys_failed),
            deploys_coalesced: load(&self.deploys_coalesced),
            resolver_hits: load(&self.resolver_hits),
            resolver_misses: load(&self.resolver_misses),
            resolver_negative_hits: load(&self.resolver_negative_hits),
            bus_published: load(&self.bus_published),
            bus_backpressure: load(&self.bus_backpressure),
            probes_failed: load(&self.probes_failed),
            monitor_restarts: load(&self.monitor_restarts),
        }
    }
}

pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Bounded ring of recent formatted log lines.
pub struct LogBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        })
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().expect("log buffer lock poisoned");
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock().expect("log buffer lock poisoned");
        lines.iter().rev().take(n).rev().cloned().collect()
    }
}

/// A `tracing` layer mirroring events into a [`LogBuffer`].
pub struct LogBufferLayer(pub Arc<LogBuffer>);

impl<S: Subscriber> Layer<S> for LogBufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let meta = event.metadata();
        self.0.push(format!(
            "{} {:>5} {}: {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            meta.level(),
            meta.target(),
            visitor.message
        ));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            if !self.message.is_empty() {
                self.message.push(' ');
            }
            self.message
                .push_str(&format!("{}={:?}", field.name(), value));
        }
    }
}
