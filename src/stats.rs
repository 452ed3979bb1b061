//! Passive observers for the dashboard and stats API
//!
//! Everything here sits off the hot path: request log entries travel through
//! a bounded channel with drop-on-full semantics, and counters are plain
//! atomics. The pipeline never blocks on observability.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Entries retained for `GET /api/logs`, newest first
pub const MAX_RECENT_LOGS: usize = 50;

const LOG_CHANNEL_CAPACITY: usize = 256;

/// One request as shown on the dashboard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub latency: String,
    pub action: String,
}

/// Runtime statistics for `GET /api/stats`
#[derive(Debug, Serialize)]
pub struct SystemStats {
    pub workers: usize,
    pub inflight_requests: i64,
    pub rss_bytes: u64,
    pub sys_mem_bytes: u64,
    pub uptime: String,
}

pub struct Stats {
    started_at: Instant,
    requests_total: AtomicU64,
    blocked_total: AtomicU64,
    latency_total_ms: AtomicU64,
    inflight: AtomicI64,
    status_codes: DashMap<u16, u64>,
    log_tx: mpsc::Sender<LogEntry>,
    recent: Arc<Mutex<VecDeque<LogEntry>>>,
}

impl Stats {
    /// Create the collector; the draining task is spawned on the current
    /// runtime.
    pub fn new() -> Arc<Self> {
        let (log_tx, mut log_rx) = mpsc::channel::<LogEntry>(LOG_CHANNEL_CAPACITY);
        let recent = Arc::new(Mutex::new(VecDeque::with_capacity(MAX_RECENT_LOGS)));

        let sink = recent.clone();
        tokio::spawn(async move {
            while let Some(entry) = log_rx.recv().await {
                let mut buffer = sink.lock();
                buffer.push_front(entry);
                buffer.truncate(MAX_RECENT_LOGS);
            }
        });

        Arc::new(Self {
            started_at: Instant::now(),
            requests_total: AtomicU64::new(0),
            blocked_total: AtomicU64::new(0),
            latency_total_ms: AtomicU64::new(0),
            inflight: AtomicI64::new(0),
            status_codes: DashMap::new(),
            log_tx,
            recent,
        })
    }

    pub fn record_request(&self, status: u16, latency: Duration) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.latency_total_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        *self.status_codes.entry(status).or_insert(0) += 1;
        if status == 403 || status == 429 {
            self.blocked_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inflight_inc(&self) {
        self.inflight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inflight_dec(&self) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Forward a log entry to the dashboard buffer; dropped when the channel
    /// is full rather than blocking the pipeline.
    pub fn push_log(&self, entry: LogEntry) {
        let _ = self.log_tx.try_send(entry);
    }

    /// Recent request logs, newest first
    pub fn recent_logs(&self) -> Vec<LogEntry> {
        self.recent.lock().iter().cloned().collect()
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn blocked_total(&self) -> u64 {
        self.blocked_total.load(Ordering::Relaxed)
    }

    pub fn status_count(&self, status: u16) -> u64 {
        self.status_codes.get(&status).map(|v| *v).unwrap_or(0)
    }

    pub fn system_stats(&self) -> SystemStats {
        let (rss_bytes, sys_mem_bytes) = memory_usage();
        SystemStats {
            workers: runtime_workers(),
            inflight_requests: self.inflight.load(Ordering::Relaxed),
            rss_bytes,
            sys_mem_bytes,
            uptime: format_uptime(self.started_at.elapsed()),
        }
    }
}

fn runtime_workers() -> usize {
    tokio::runtime::Handle::try_current()
        .map(|h| h.metrics().num_workers())
        .unwrap_or(0)
}

/// (resident, virtual) memory in bytes, from /proc/self/statm
#[cfg(target_os = "linux")]
fn memory_usage() -> (u64, u64) {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return (0, 0);
    };
    let mut fields = statm.split_whitespace();
    let vm_pages: u64 = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
    let rss_pages: u64 = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
    const PAGE_SIZE: u64 = 4096;
    (rss_pages * PAGE_SIZE, vm_pages * PAGE_SIZE)
}

#[cfg(not(target_os = "linux"))]
fn memory_usage() -> (u64, u64) {
    (0, 0)
}

fn format_uptime(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
