/// Download progress tracking.
///
/// Grounded in `memsql_loader/execution/downloader.py::DownloadMetrics`: a
/// throttled (≤1/s) moving average of per-second byte deltas, a stall
/// detector keyed on the last time the delta exceeded 10 bytes, and a
/// `time_left` estimate.
use std::time::{Duration, Instant};

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);
const SNAPSHOT_WINDOW: usize = 30;
const STALL_DELTA_THRESHOLD: u64 = 10;

pub struct DownloadMetrics {
    bytes_total: Option<u64>,
    bytes_downloaded: u64,
    last_snapshot_at: Instant,
    last_snapshot_bytes: u64,
    rate_samples: Vec<f64>,
    last_change: Instant,
}

impl DownloadMetrics {
    pub fn new(bytes_total: Option<u64>) -> Self {
        let now = Instant::now();
        DownloadMetrics {
            bytes_total,
            bytes_downloaded: 0,
            last_snapshot_at: now,
            last_snapshot_bytes: 0,
            rate_samples: Vec::with_capacity(SNAPSHOT_WINDOW),
            last_change: now,
        }
    }

    /// Called from the progress callback with the cumulative bytes
    /// transferred so far. Throttled to at most one snapshot per second.
    pub fn record(&mut self, bytes_downloaded: u64) {
        self.bytes_downloaded = bytes_downloaded;

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_snapshot_at);
        if elapsed < SNAPSHOT_INTERVAL {
            return;
        }

        let delta = bytes_downloaded.saturating_sub(self.last_snapshot_bytes);
        let rate = delta as f64 / elapsed.as_secs_f64();

        if self.rate_samples.len() == SNAPSHOT_WINDOW {
            self.rate_samples.remove(0);
        }
        self.rate_samples.push(rate);

        if delta > STALL_DELTA_THRESHOLD {
            self.last_change = now;
        }

        self.last_snapshot_at = now;
        self.last_snapshot_bytes = bytes_downloaded;
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded
    }

    pub fn download_rate(&self) -> f64 {
        if self.rate_samples.is_empty() {
            return 0.0;
        }
        self.rate_samples.iter().sum::<f64>() / self.rate_samples.len() as f64
    }

    /// Seconds left at the current rate, or `-1.0` if unknown/complete.
    pub fn time_left(&self) -> f64 {
        let rate = self.download_rate();
        let total = match self.bytes_total {
            Some(t) => t,
            None => return -1.0,
        };
        if rate <= 0.0 || self.bytes_downloaded >= total {
            return -1.0;
        }
        (total - self.bytes_downloaded) as f64 / rate
    }

    pub fn seconds_since_last_change(&self) -> Duration {
        Instant::now().duration_since(self.last_change)
    }

    pub fn ping(&mut self) {
        self.last_change = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn time_left_is_negative_one_with_no_progress_yet() {
        let metrics = DownloadMetrics::new(Some(100));
        assert_eq!(metrics.time_left(), -1.0);
    }

    #[test]
    fn time_left_is_negative_one_when_total_unknown() {
        let metrics = DownloadMetrics::new(None);
        assert_eq!(metrics.time_left(), -1.0);
    }

    #[test]
    fn record_is_throttled_to_one_snapshot_per_second() {
        let mut metrics = DownloadMetrics::new(Some(1000));
        metrics.record(50);
        metrics.record(60); // within the same second, ignored as a new snapshot
        assert_eq!(metrics.bytes_downloaded(), 60);
        assert_eq!(metrics.download_rate(), 0.0);
    }

    #[test]
    fn stall_detector_only_resets_on_meaningful_deltas() {
        let mut metrics = DownloadMetrics::new(Some(1000));
        metrics.record(5); // delta 5, below the 10-byte threshold
        sleep(Duration::from_millis(5));
        assert!(metrics.seconds_since_last_change() < Duration::from_secs(1));
    }
}
