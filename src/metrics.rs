#![forbid(unsafe_code)]

// Relay metrics
//
// Plain atomics shared through an `Arc`, read out as Prometheus text by the
// `/metrics` handler. Room and participant gauges are not stored here; the
// caller passes the registry's current counts at render time.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound of each latency bucket in microseconds, with its `le` label
const LATENCY_BUCKETS: [(u64, &str); 10] = [
    (1_000, "0.001"),
    (5_000, "0.005"),
    (10_000, "0.01"),
    (25_000, "0.025"),
    (50_000, "0.05"),
    (100_000, "0.1"),
    (250_000, "0.25"),
    (500_000, "0.5"),
    (1_000_000, "1"),
    (5_000_000, "5"),
];

/// Latency histogram over `LATENCY_BUCKETS`.
///
/// Each bucket counts every observation at or under its bound, which is the
/// cumulative form the exposition format expects.
pub struct Histogram {
    buckets: [AtomicU64; LATENCY_BUCKETS.len()],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Relaxed);
        self.sum_us.fetch_add(us, Relaxed);
        for (bucket, &(bound, _)) in self.buckets.iter().zip(LATENCY_BUCKETS.iter()) {
            if us <= bound {
                bucket.fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        write_header(out, name, help, "histogram");
        for (bucket, &(_, label)) in self.buckets.iter().zip(LATENCY_BUCKETS.iter()) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", bucket.load(Relaxed));
        }
        let count = self.count.load(Relaxed);
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Process-wide relay counters; clones share the same values.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    connections_total: AtomicU64,
    events_received_total: AtomicU64,
    frames_sent_total: AtomicU64,
    errors_total: AtomicU64,
    joins_total: AtomicU64,
    leaves_total: AtomicU64,
    relayed_total: AtomicU64,
    broadcasts_total: AtomicU64,
    dropped_total: AtomicU64,
    delivery_failures_total: AtomicU64,

    /// Open sockets, maintained by `ConnectionGuard`
    connections_active: AtomicU64,
    /// Time spent applying one decoded inbound event
    event_handling: Histogram,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections_total: AtomicU64::new(0),
                events_received_total: AtomicU64::new(0),
                frames_sent_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                joins_total: AtomicU64::new(0),
                leaves_total: AtomicU64::new(0),
                relayed_total: AtomicU64::new(0),
                broadcasts_total: AtomicU64::new(0),
                dropped_total: AtomicU64::new(0),
                delivery_failures_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
                event_handling: Histogram::new(),
            }),
        }
    }

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_events_received(&self) {
        self.inner.events_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_frames_sent(&self) {
        self.inner.frames_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_leaves(&self) {
        self.inner.leaves_total.fetch_add(1, Relaxed);
    }

    pub fn inc_relayed(&self) {
        self.inner.relayed_total.fetch_add(1, Relaxed);
    }

    pub fn inc_broadcasts(&self) {
        self.inner.broadcasts_total.fetch_add(1, Relaxed);
    }

    pub fn inc_dropped(&self) {
        self.inner.dropped_total.fetch_add(1, Relaxed);
    }

    pub fn inc_delivery_failures(&self) {
        self.inner.delivery_failures_total.fetch_add(1, Relaxed);
    }

    /// Counts one open socket until the returned guard is dropped.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard { inner: self.inner.clone() }
    }

    pub fn observe_event_handling(&self, duration: Duration) {
        self.inner.event_handling.observe(duration);
    }

    /// Text exposition of every counter plus the two registry gauges.
    pub fn render_prometheus(&self, rooms_active: usize, participants_active: usize) -> String {
        let mut out = String::with_capacity(4096);
        let i = &self.inner;

        render_counter(&mut out, "meetrelay_connections_total", "Total WebSocket connections", i.connections_total.load(Relaxed));
        render_counter(&mut out, "meetrelay_events_received_total", "Total events received from clients", i.events_received_total.load(Relaxed));
        render_counter(&mut out, "meetrelay_frames_sent_total", "Total frames written to clients", i.frames_sent_total.load(Relaxed));
        render_counter(&mut out, "meetrelay_errors_total", "Total malformed or unencodable events", i.errors_total.load(Relaxed));
        render_counter(&mut out, "meetrelay_joins_total", "Total room joins", i.joins_total.load(Relaxed));
        render_counter(&mut out, "meetrelay_leaves_total", "Total room leaves", i.leaves_total.load(Relaxed));
        render_counter(&mut out, "meetrelay_relayed_total", "Total target-addressed handshake events relayed", i.relayed_total.load(Relaxed));
        render_counter(&mut out, "meetrelay_broadcasts_total", "Total room broadcasts", i.broadcasts_total.load(Relaxed));
        render_counter(&mut out, "meetrelay_dropped_total", "Total events dropped by routing rules", i.dropped_total.load(Relaxed));
        render_counter(&mut out, "meetrelay_delivery_failures_total", "Total frames not enqueued (full or closed channel)", i.delivery_failures_total.load(Relaxed));

        render_gauge(&mut out, "meetrelay_connections_active", "Currently active WebSocket connections", i.connections_active.load(Relaxed));
        render_gauge(&mut out, "meetrelay_rooms_active", "Currently active rooms", rooms_active as u64);
        render_gauge(&mut out, "meetrelay_participants_active", "Currently joined participants", participants_active as u64);

        i.event_handling.render(
            "meetrelay_event_handling_seconds",
            "Inbound event handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// Held by a connection task for as long as its socket is open.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn write_header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    write_header(out, name, help, "counter");
    let _ = writeln!(out, "{name} {value}");
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    write_header(out, name, help, "gauge");
    let _ = writeln!(out, "{name} {value}");
}
