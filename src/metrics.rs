//! Prometheus-compatible metrics endpoint
//!
//! Counts what the fire-and-forget presence paths did, so failures that are
//! only logged on the hot path remain observable from outside.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, debug};

/// Metrics registry for presence synchronization
#[derive(Debug)]
pub struct Metrics {
    // Movement ticks
    pub samples_received: AtomicU64,
    pub samples_suppressed: AtomicU64,

    // Ephemeral channel
    pub broadcasts_sent: AtomicU64,
    pub broadcasts_failed: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_rejected: AtomicU64,
    pub inbound_faults: AtomicU64,
    pub self_echoes: AtomicU64,
    pub channel_leaves: AtomicU64,

    // Durable store
    pub durable_writes: AtomicU64,
    pub durable_writes_failed: AtomicU64,
    pub durable_writes_stale: AtomicU64,

    // Registry
    pub peers_tracked: AtomicU64,
    pub peer_departures: AtomicU64,
    pub sessions_active: AtomicU64,

    // Proximity
    pub proximity_changes: AtomicU64,

    // Host tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    start_time: Instant,

    tick_window: RwLock<VecDeque<u64>>,
}

/// Host ticks kept for percentiles
const TICK_WINDOW: usize = 512;

/// Percentiles stay zero until this many ticks are in the window
const MIN_TICKS_FOR_PERCENTILES: usize = 10;

impl Metrics {
    pub fn new() -> Self {
        Self {
            samples_received: AtomicU64::new(0),
            samples_suppressed: AtomicU64::new(0),
            broadcasts_sent: AtomicU64::new(0),
            broadcasts_failed: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_rejected: AtomicU64::new(0),
            inbound_faults: AtomicU64::new(0),
            self_echoes: AtomicU64::new(0),
            channel_leaves: AtomicU64::new(0),
            durable_writes: AtomicU64::new(0),
            durable_writes_failed: AtomicU64::new(0),
            durable_writes_stale: AtomicU64::new(0),
            peers_tracked: AtomicU64::new(0),
            peer_departures: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            proximity_changes: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_window: RwLock::new(VecDeque::with_capacity(TICK_WINDOW)),
        }
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn decr(counter: &AtomicU64) {
        Self::sub(counter, 1);
    }

    /// Saturating: a gauge never wraps below zero
    pub fn sub(counter: &AtomicU64, n: u64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(n))
        });
    }

    /// Time spent on one host movement tick (sample, propagate, proximity)
    pub fn record_tick_time(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.tick_time_us.store(us, Ordering::Relaxed);
        Self::incr(&self.tick_count);

        let mut window = self.tick_window.write();
        if window.len() == TICK_WINDOW {
            window.pop_front();
        }
        window.push_back(us);
        if window.len() < MIN_TICKS_FOR_PERCENTILES {
            return;
        }

        let mut sorted: Vec<u64> = window.iter().copied().collect();
        drop(window);
        sorted.sort_unstable();
        self.tick_time_p95_us.store(percentile(&sorted, 95), Ordering::Relaxed);
        self.tick_time_p99_us.store(percentile(&sorted, 99), Ordering::Relaxed);
        self.tick_time_max_us.store(percentile(&sorted, 100), Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("mall_presence_samples_total", "Movement samples received from the host", "counter",
            self.samples_received.load(Ordering::Relaxed));
        metric!("mall_presence_samples_suppressed_total", "Samples below the significance threshold", "counter",
            self.samples_suppressed.load(Ordering::Relaxed));

        metric!("mall_presence_broadcasts_sent_total", "Payloads published on the presence channel", "counter",
            self.broadcasts_sent.load(Ordering::Relaxed));
        metric!("mall_presence_broadcasts_failed_total", "Failed presence publishes", "counter",
            self.broadcasts_failed.load(Ordering::Relaxed));
        metric!("mall_presence_messages_received_total", "Payloads received from the presence channel", "counter",
            self.messages_received.load(Ordering::Relaxed));
        metric!("mall_presence_messages_rejected_total", "Malformed payloads rejected", "counter",
            self.messages_rejected.load(Ordering::Relaxed));
        metric!("mall_presence_inbound_faults_total", "Inbound events whose handler panicked", "counter",
            self.inbound_faults.load(Ordering::Relaxed));
        metric!("mall_presence_channel_leaves_total", "Leave events observed on the presence channel", "counter",
            self.channel_leaves.load(Ordering::Relaxed));

        metric!("mall_presence_durable_writes_total", "Durable presence rows written", "counter",
            self.durable_writes.load(Ordering::Relaxed));
        metric!("mall_presence_durable_writes_failed_total", "Failed durable presence writes", "counter",
            self.durable_writes_failed.load(Ordering::Relaxed));
        metric!("mall_presence_durable_writes_stale_total", "Durable writes rejected by the timestamp guard", "counter",
            self.durable_writes_stale.load(Ordering::Relaxed));

        metric!("mall_presence_peers", "Remote participants in the registry", "gauge",
            self.peers_tracked.load(Ordering::Relaxed));
        metric!("mall_presence_departures_total", "Peers removed after durable deletion", "counter",
            self.peer_departures.load(Ordering::Relaxed));
        metric!("mall_presence_sessions_active", "Active local sessions", "gauge",
            self.sessions_active.load(Ordering::Relaxed));

        #[cfg(feature = "metrics_extended")]
        {
            metric!("mall_presence_self_echoes_total", "Own broadcasts echoed back by the channel", "counter",
                self.self_echoes.load(Ordering::Relaxed));
            metric!("mall_presence_proximity_changes_total", "Nearest-product changes", "counter",
                self.proximity_changes.load(Ordering::Relaxed));
        }

        metric!("mall_presence_tick_time_microseconds", "Current host tick time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("mall_presence_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("mall_presence_tick_time_p99_microseconds", "99th percentile tick time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("mall_presence_tick_time_max_microseconds", "Maximum tick time", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("mall_presence_tick_count", "Total host ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));
        metric!("mall_presence_uptime_seconds", "Process uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics (alternative for direct API access)
    pub fn to_json(&self) -> String {
        format!(r#"{{
  "movement": {{
    "samples": {},
    "suppressed": {}
  }},
  "broadcast": {{
    "sent": {},
    "failed": {},
    "received": {},
    "rejected": {},
    "faults": {},
    "leaves": {}
  }},
  "durable": {{
    "writes": {},
    "failed": {},
    "stale": {}
  }},
  "registry": {{
    "peers": {},
    "departures": {},
    "sessions": {}
  }},
  "performance": {{
    "tick_time_us": {},
    "tick_time_p95_us": {},
    "tick_time_p99_us": {},
    "tick_time_max_us": {},
    "tick_count": {},
    "uptime_seconds": {}
  }}
}}"#,
            self.samples_received.load(Ordering::Relaxed),
            self.samples_suppressed.load(Ordering::Relaxed),
            self.broadcasts_sent.load(Ordering::Relaxed),
            self.broadcasts_failed.load(Ordering::Relaxed),
            self.messages_received.load(Ordering::Relaxed),
            self.messages_rejected.load(Ordering::Relaxed),
            self.inbound_faults.load(Ordering::Relaxed),
            self.channel_leaves.load(Ordering::Relaxed),
            self.durable_writes.load(Ordering::Relaxed),
            self.durable_writes_failed.load(Ordering::Relaxed),
            self.durable_writes_stale.load(Ordering::Relaxed),
            self.peers_tracked.load(Ordering::Relaxed),
            self.peer_departures.load(Ordering::Relaxed),
            self.sessions_active.load(Ordering::Relaxed),
            self.tick_time_us.load(Ordering::Relaxed),
            self.tick_time_p95_us.load(Ordering::Relaxed),
            self.tick_time_p99_us.load(Ordering::Relaxed),
            self.tick_time_max_us.load(Ordering::Relaxed),
            self.tick_count.load(Ordering::Relaxed),
            self.uptime_seconds(),
        )
    }
}

/// Nearest-rank percentile of an ascending slice; 0 when empty
fn percentile(sorted: &[u64], pct: usize) -> u64 {
    let rank = (sorted.len() * pct).div_ceil(100);
    sorted.get(rank.saturating_sub(1)).copied().unwrap_or(0)
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Answer one request line from the metrics socket
fn respond(metrics: &Metrics, request: &str) -> String {
    let mut parts = request.lines().next().unwrap_or_default().split_whitespace();
    let (status, content_type, body) = match (parts.next(), parts.next()) {
        (Some("GET"), Some("/metrics")) => ("200 OK", "text/plain; version=0.0.4", metrics.to_prometheus()),
        (Some("GET"), Some("/metrics/json")) => ("200 OK", "application/json", metrics.to_json()),
        (Some("GET"), Some("/health")) => {
            let sessions = metrics.sessions_active.load(Ordering::Relaxed);
            ("200 OK", "text/plain", format!("OK {} sessions", sessions))
        }
        (Some("GET"), Some(_)) => ("404 Not Found", "text/plain", String::new()),
        _ => ("405 Method Not Allowed", "text/plain", String::new()),
    };
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}

/// Serve `/metrics`, `/metrics/json` and `/health` until the listener fails
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Presence metrics on http://0.0.0.0:{}/metrics", port);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut request = [0u8; 512];
            let read = match socket.read(&mut request).await {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) => {
                    debug!("Metrics request from {} unreadable: {}", peer, e);
                    return;
                }
            };

            let response = respond(&metrics, &String::from_utf8_lossy(&request[..read]));
            if let Err(e) = socket.write_all(response.as_bytes()).await {
                debug!("Metrics response to {} failed: {}", peer, e);
            }
        });
    }
}
