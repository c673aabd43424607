//! Health monitoring and metrics for volume transports

use log::warn;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_micros() as u64)
}

/// Health metrics for a transport
///
/// All fields use atomic operations for thread-safe access.
pub struct TransportHealth {
    /// Number of frames written to or read from the wire
    pub frames: AtomicU64,

    /// Number of frames skipped because no buffer or queue slot was free
    pub frame_drops: AtomicU64,

    /// Number of frames rejected for inconsistent headers
    pub malformed_frames: AtomicU64,

    /// Number of connection-level failures
    pub network_errors: AtomicU64,

    /// Total payload bytes moved
    pub bytes: AtomicU64,

    /// Timestamp (as Unix microseconds) of the last frame
    pub last_frame_time: AtomicU64,
}

impl TransportHealth {
    pub fn new() -> Self {
        Self {
            frames: AtomicU64::new(0),
            frame_drops: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            network_errors: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            last_frame_time: AtomicU64::new(now_micros()),
        }
    }

    pub fn record_frame(&self, size: usize) {
        self.last_frame_time.store(now_micros(), Ordering::Relaxed);
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_frame_drop(&self) {
        self.frame_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_error(&self) {
        self.network_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn frame_drops(&self) -> u64 {
        self.frame_drops.load(Ordering::Relaxed)
    }

    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames.load(Ordering::Relaxed)
    }

    pub fn network_errors(&self) -> u64 {
        self.network_errors.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn last_frame_time(&self) -> u64 {
        self.last_frame_time.load(Ordering::Relaxed)
    }

    /// Dropped frames as a percentage of frames seen
    pub fn frame_drop_rate(&self) -> f64 {
        let drops = self.frame_drops();
        let total = self.frames() + drops;
        if total == 0 {
            return 0.0;
        }
        (drops as f64 / total as f64) * 100.0
    }

    /// Check if no frame went through for the given duration
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let elapsed_micros = now_micros().saturating_sub(self.last_frame_time());
        elapsed_micros > threshold.as_micros() as u64
    }

    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            frames: self.frames(),
            frame_drops: self.frame_drops(),
            malformed_frames: self.malformed_frames(),
            network_errors: self.network_errors(),
            bytes: self.bytes(),
            frame_drop_rate: self.frame_drop_rate(),
        }
    }
}

impl Default for TransportHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub frames: u64,
    pub frame_drops: u64,
    pub malformed_frames: u64,
    pub network_errors: u64,
    pub bytes: u64,
    pub frame_drop_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} frames ({} drops, {:.2}%), {} malformed, {} network errors, {} bytes",
            self.frames,
            self.frame_drops,
            self.frame_drop_rate,
            self.malformed_frames,
            self.network_errors,
            self.bytes
        )
    }
}

#[derive(Debug, Clone)]
pub enum HealthAlert {
    /// No frame for the stall threshold
    Stalled { duration: Duration },

    HighDropRate { rate: f64 },

    /// New malformed frames since the last check
    MalformedFrames { count: u64 },

    /// New network errors since the last check
    NetworkErrors { count: u64 },
}

impl std::fmt::Display for HealthAlert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthAlert::Stalled { duration } => {
                write!(f, "Transport stalled for {:?}", duration)
            }
            HealthAlert::HighDropRate { rate } => {
                write!(f, "High frame drop rate: {:.2}%", rate)
            }
            HealthAlert::MalformedFrames { count } => {
                write!(f, "Malformed frames: {}", count)
            }
            HealthAlert::NetworkErrors { count } => {
                write!(f, "Network errors: {}", count)
            }
        }
    }
}

/// Periodically checks transport health, logging alerts and optionally
/// forwarding them to a channel.
pub struct HealthMonitor {
    health: Arc<TransportHealth>,
    alert_tx: Option<mpsc::Sender<HealthAlert>>,
    check_interval: Duration,
    stall_threshold: Duration,
    drop_rate_threshold: f64,
}

impl HealthMonitor {
    pub fn new(health: Arc<TransportHealth>) -> Self {
        Self {
            health,
            alert_tx: None,
            check_interval: Duration::from_secs(5),
            stall_threshold: Duration::from_secs(5),
            drop_rate_threshold: 10.0,
        }
    }

    pub fn with_alerts(mut self, alert_tx: mpsc::Sender<HealthAlert>) -> Self {
        self.alert_tx = Some(alert_tx);
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    pub fn with_drop_rate_threshold(mut self, threshold: f64) -> Self {
        self.drop_rate_threshold = threshold;
        self
    }

    /// Run the health monitor until the surrounding task is dropped
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.check_interval);
        let mut last_malformed = 0u64;
        let mut last_network_errors = 0u64;

        loop {
            interval.tick().await;

            if self.health.is_stalled(self.stall_threshold) {
                self.raise(HealthAlert::Stalled {
                    duration: self.stall_threshold,
                })
                .await;
            }

            let drop_rate = self.health.frame_drop_rate();
            if drop_rate > self.drop_rate_threshold {
                self.raise(HealthAlert::HighDropRate { rate: drop_rate })
                    .await;
            }

            let malformed = self.health.malformed_frames();
            if malformed > last_malformed {
                self.raise(HealthAlert::MalformedFrames {
                    count: malformed - last_malformed,
                })
                .await;
                last_malformed = malformed;
            }

            let network_errors = self.health.network_errors();
            if network_errors > last_network_errors {
                self.raise(HealthAlert::NetworkErrors {
                    count: network_errors - last_network_errors,
                })
                .await;
                last_network_errors = network_errors;
            }
        }
    }

    async fn raise(&self, alert: HealthAlert) {
        warn!("{}", alert);
        if let Some(alert_tx) = &self.alert_tx {
            let _ = alert_tx.send(alert).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_metrics() {
        let health = TransportHealth::new();

        health.record_frame(1000);
        health.record_frame(2000);
        health.record_frame(1500);

        assert_eq!(health.frames(), 3);
        assert_eq!(health.bytes(), 4500);
        assert_eq!(health.frame_drops(), 0);

        health.record_frame_drop();
        assert_eq!(health.frame_drops(), 1);
        assert!((health.frame_drop_rate() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_stall_detection() {
        let health = TransportHealth::new();
        assert!(!health.is_stalled(Duration::from_secs(1)));

        health.record_frame(1000);
        std::thread::sleep(Duration::from_millis(150));
        assert!(health.is_stalled(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_monitor_reports_new_errors() {
        let health = Arc::new(TransportHealth::new());
        let (tx, mut rx) = mpsc::channel(8);
        let monitor = HealthMonitor::new(health.clone())
            .with_alerts(tx)
            .with_check_interval(Duration::from_millis(10))
            .with_stall_threshold(Duration::from_secs(60));

        health.record_malformed_frame();
        health.record_malformed_frame();
        let task = tokio::spawn(async move { monitor.run().await });

        let alert = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(alert, HealthAlert::MalformedFrames { count: 2 }));
        task.abort();
    }
}
