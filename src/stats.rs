use std::sync::atomic::{ AtomicU64, Ordering };
use std::sync::Arc;
use std::time::{ Duration, Instant };

use crate::error::SessionError;

/// Lock-free runtime counters for the upload server.
#[derive(Debug)]
pub struct Stats {
    pub sessions_started: AtomicU64,
    pub sessions_completed: AtomicU64,
    pub header_frames_processed: AtomicU64,
    pub data_frames_processed: AtomicU64,
    pub checksum_errors: AtomicU64,
    pub device_errors: AtomicU64,
    pub protocol_violations: AtomicU64,
    pub bytes_forwarded: AtomicU64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions_started: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            header_frames_processed: AtomicU64::new(0),
            data_frames_processed: AtomicU64::new(0),
            checksum_errors: AtomicU64::new(0),
            device_errors: AtomicU64::new(0),
            protocol_violations: AtomicU64::new(0),
            bytes_forwarded: AtomicU64::new(0),
        })
    }

    #[inline(always)]
    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_session_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_header_frame(&self, bytes: usize) {
        self.header_frames_processed.fetch_add(1, Ordering::Relaxed);
        self.bytes_forwarded.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_data_frame(&self, bytes: usize) {
        self.data_frames_processed.fetch_add(1, Ordering::Relaxed);
        self.bytes_forwarded.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_checksum_error(&self) {
        self.checksum_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump the counter matching the terminal error a session ended with.
    pub fn record_session_error(&self, error: &SessionError) {
        match error {
            SessionError::Framing(_) => {
                self.checksum_errors.fetch_add(1, Ordering::Relaxed);
            }
            SessionError::Usb(_) => {
                self.device_errors.fetch_add(1, Ordering::Relaxed);
            }
            SessionError::ProtocolViolation(_) => {
                self.protocol_violations.fetch_add(1, Ordering::Relaxed);
            }
            SessionError::ClientDisconnect => {}
        }
    }

    /// Snapshot and reset counters, return per-second rates over `elapsed`.
    pub fn snapshot_and_reset(&self, elapsed: Duration) -> StatsSnapshot {
        let secs = elapsed.as_secs_f64().max(0.001);

        let sessions_started = self.sessions_started.swap(0, Ordering::Relaxed);
        let sessions_completed = self.sessions_completed.swap(0, Ordering::Relaxed);
        let header_frames = self.header_frames_processed.swap(0, Ordering::Relaxed);
        let data_frames = self.data_frames_processed.swap(0, Ordering::Relaxed);
        let checksum_errors = self.checksum_errors.swap(0, Ordering::Relaxed);
        let device_errors = self.device_errors.swap(0, Ordering::Relaxed);
        let protocol_violations = self.protocol_violations.swap(0, Ordering::Relaxed);
        let bytes = self.bytes_forwarded.swap(0, Ordering::Relaxed);

        StatsSnapshot {
            sessions_started,
            sessions_completed,
            data_frames_per_sec: (data_frames as f64) / secs,
            throughput_mbps: ((bytes as f64) * 8.0) / (secs * 1_000_000.0),
            header_frames,
            checksum_errors,
            device_errors,
            protocol_violations,
        }
    }
}

#[derive(Debug)]
pub struct StatsSnapshot {
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub header_frames: u64,
    pub data_frames_per_sec: f64,
    pub throughput_mbps: f64,
    pub checksum_errors: u64,
    pub device_errors: u64,
    pub protocol_violations: u64,
}

/// Background stats reporter task, logging a one-line summary every
/// `interval_secs` seconds. `interval_secs == 0` disables reporting.
pub async fn stats_reporter(stats: Arc<Stats>, interval_secs: u64) {
    if interval_secs == 0 {
        std::future::pending::<()>().await;
        return;
    }

    let interval = Duration::from_secs(interval_secs);
    let mut last = Instant::now();

    loop {
        tokio::time::sleep(interval).await;
        let now = Instant::now();
        let elapsed = now - last;
        last = now;

        let snap = stats.snapshot_and_reset(elapsed);
        tracing::info!(
            sessions_started = snap.sessions_started,
            sessions_completed = snap.sessions_completed,
            headers = snap.header_frames,
            data_pps = format!("{:.1}", snap.data_frames_per_sec),
            throughput_mbps = format!("{:.2}", snap.throughput_mbps),
            checksum_errors = snap.checksum_errors,
            device_errors = snap.device_errors,
            protocol_violations = snap.protocol_violations,
            "stats"
        );
    }
}
