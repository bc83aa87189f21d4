use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use serde::{Deserialize, Serialize};

/// Metrics collected during a synthetic client session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetrics {
    pub client_id: String,
    pub room_id: String,
    pub connection_successful: bool,
    pub connection_time_ms: u64,
    pub events_sent: u64,
    pub events_received: u64,
    pub handshakes_completed: u64,
    pub errors: Vec<String>,
    pub session_duration_ms: u64,
    pub signaling_latencies: SignalingLatencyReport,
}

/// Signaling latency report per event kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingLatencyReport {
    pub operations: HashMap<String, LatencyStats>,
}

/// Latency statistics for a single event kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub count: usize,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

impl LatencyStats {
    /// Computes stats from unsorted samples; `None` if there are none
    pub fn from_samples(mut samples: Vec<u64>) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();
        let count = samples.len();
        Some(Self {
            count,
            min_ms: samples[0],
            max_ms: samples[count - 1],
            avg_ms: samples.iter().sum::<u64>() / count as u64,
            p50_ms: percentile(&samples, 0.50),
            p95_ms: percentile(&samples, 0.95),
            p99_ms: percentile(&samples, 0.99),
        })
    }
}

/// Real-time metrics collector (thread-safe)
pub struct MetricsCollector {
    client_id: String,
    room_id: String,
    start_time: Instant,
    connection_successful: AtomicBool,
    connection_time_ms: AtomicU64,
    events_sent: AtomicU64,
    events_received: AtomicU64,
    handshakes_completed: AtomicU64,
    errors: std::sync::Mutex<Vec<String>>,
    signaling_latencies: std::sync::Mutex<HashMap<String, Vec<u64>>>,
}

impl MetricsCollector {
    pub fn new(client_id: String, room_id: String) -> Self {
        Self {
            client_id,
            room_id,
            start_time: Instant::now(),
            connection_successful: AtomicBool::new(false),
            connection_time_ms: AtomicU64::new(0),
            events_sent: AtomicU64::new(0),
            events_received: AtomicU64::new(0),
            handshakes_completed: AtomicU64::new(0),
            errors: std::sync::Mutex::new(Vec::new()),
            signaling_latencies: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn mark_connection_successful(&self) {
        self.connection_successful.store(true, Ordering::SeqCst);
        let elapsed = self.start_time.elapsed().as_millis() as u64;
        self.connection_time_ms.store(elapsed, Ordering::SeqCst);
    }

    pub fn record_event_sent(&self) {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake_completed(&self) {
        self.handshakes_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, error: String) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(error);
        }
    }

    /// Record a relay latency for a named event kind
    pub fn record_signaling_latency(&self, operation: &str, ms: u64) {
        if let Ok(mut latencies) = self.signaling_latencies.lock() {
            latencies.entry(operation.to_string()).or_default().push(ms);
        }
    }

    /// Generate final metrics report
    pub fn generate_report(&self) -> ClientMetrics {
        let errors = self.errors.lock().map(|e| e.clone()).unwrap_or_default();
        let latencies = self.signaling_latencies.lock().map(|l| l.clone()).unwrap_or_default();

        let operations = latencies
            .into_iter()
            .filter_map(|(op, samples)| LatencyStats::from_samples(samples).map(|s| (op, s)))
            .collect();

        ClientMetrics {
            client_id: self.client_id.clone(),
            room_id: self.room_id.clone(),
            connection_successful: self.connection_successful.load(Ordering::SeqCst),
            connection_time_ms: self.connection_time_ms.load(Ordering::SeqCst),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            handshakes_completed: self.handshakes_completed.load(Ordering::Relaxed),
            errors,
            session_duration_ms: self.start_time.elapsed().as_millis() as u64,
            signaling_latencies: SignalingLatencyReport { operations },
        }
    }
}

/// Per-room summary statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: String,
    pub total_clients: usize,
    pub successful_connections: usize,
    pub total_events_sent: u64,
    pub total_events_received: u64,
    pub total_handshakes: u64,
    pub total_errors: usize,
}

/// Aggregates metrics from multiple clients
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSummary {
    pub total_clients: usize,
    pub successful_connections: usize,
    pub failed_connections: usize,
    pub average_connection_time_ms: u64,
    pub p95_connection_time_ms: u64,
    pub total_events_sent: u64,
    pub total_events_received: u64,
    pub total_handshakes: u64,
    pub total_errors: usize,
    pub signaling_latencies: HashMap<String, LatencyStats>,
    pub rooms: Vec<RoomSummary>,
}

impl TestSummary {
    pub fn from_metrics(metrics: &[ClientMetrics]) -> Self {
        if metrics.is_empty() {
            return Self::default();
        }

        let total_clients = metrics.len();
        let successful_connections = metrics.iter().filter(|m| m.connection_successful).count();

        let connection_times: Vec<u64> = metrics
            .iter()
            .filter(|m| m.connection_successful)
            .map(|m| m.connection_time_ms)
            .collect();
        let connection_stats = LatencyStats::from_samples(connection_times).unwrap_or_default();

        // Per-client p50 as the representative sample for each event kind
        let mut all_samples: HashMap<String, Vec<u64>> = HashMap::new();
        for m in metrics {
            for (op, stats) in &m.signaling_latencies.operations {
                all_samples.entry(op.clone()).or_default().push(stats.p50_ms);
            }
        }
        let signaling_latencies = all_samples
            .into_iter()
            .filter_map(|(op, samples)| LatencyStats::from_samples(samples).map(|s| (op, s)))
            .collect();

        Self {
            total_clients,
            successful_connections,
            failed_connections: total_clients - successful_connections,
            average_connection_time_ms: connection_stats.avg_ms,
            p95_connection_time_ms: connection_stats.p95_ms,
            total_events_sent: metrics.iter().map(|m| m.events_sent).sum(),
            total_events_received: metrics.iter().map(|m| m.events_received).sum(),
            total_handshakes: metrics.iter().map(|m| m.handshakes_completed).sum(),
            total_errors: metrics.iter().map(|m| m.errors.len()).sum(),
            signaling_latencies,
            rooms: Self::compute_room_summaries(metrics),
        }
    }

    fn compute_room_summaries(metrics: &[ClientMetrics]) -> Vec<RoomSummary> {
        let mut room_map: HashMap<String, Vec<&ClientMetrics>> = HashMap::new();
        for m in metrics {
            room_map.entry(m.room_id.clone()).or_default().push(m);
        }

        let mut rooms: Vec<RoomSummary> = room_map
            .into_iter()
            .map(|(room_id, clients)| RoomSummary {
                room_id,
                total_clients: clients.len(),
                successful_connections: clients.iter().filter(|c| c.connection_successful).count(),
                total_events_sent: clients.iter().map(|c| c.events_sent).sum(),
                total_events_received: clients.iter().map(|c| c.events_received).sum(),
                total_handshakes: clients.iter().map(|c| c.handshakes_completed).sum(),
                total_errors: clients.iter().map(|c| c.errors.len()).sum(),
            })
            .collect();

        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        rooms
    }

    pub fn print_summary(&self) {
        println!("\n=== Load Test Summary ===");
        println!("Total Clients: {}", self.total_clients);
        println!("Successful Connections: {}", self.successful_connections);
        println!("Failed Connections: {}", self.failed_connections);
        println!("\nConnection Time:");
        println!("  Average: {} ms", self.average_connection_time_ms);
        println!("  P95: {} ms", self.p95_connection_time_ms);
        println!("\nSignaling:");
        println!("  Events Sent: {}", self.total_events_sent);
        println!("  Events Received: {}", self.total_events_received);
        println!("  Handshakes Completed: {}", self.total_handshakes);

        if !self.signaling_latencies.is_empty() {
            println!("\nRelay Latencies (aggregated across clients):");
            let mut ops: Vec<_> = self.signaling_latencies.iter().collect();
            ops.sort_by_key(|(k, _)| (*k).clone());
            for (op, stats) in &ops {
                println!("  {}: avg={}ms p50={}ms p95={}ms p99={}ms (n={})",
                    op, stats.avg_ms, stats.p50_ms, stats.p95_ms, stats.p99_ms, stats.count);
            }
        }

        if self.rooms.len() > 1 {
            println!("\nPer-Room Breakdown ({} rooms):", self.rooms.len());
            for room in &self.rooms {
                println!("  {}: {} clients, {} handshakes, {} events received, {} errors",
                    room.room_id, room.total_clients, room.total_handshakes,
                    room.total_events_received, room.total_errors);
            }
        }

        println!("\nTotal Errors: {}", self.total_errors);
        println!("========================\n");
    }
}

fn percentile(sorted_data: &[u64], p: f64) -> u64 {
    if sorted_data.is_empty() {
        return 0;
    }
    let idx = (p * (sorted_data.len() - 1) as f64).round() as usize;
    sorted_data[idx.min(sorted_data.len() - 1)]
}
