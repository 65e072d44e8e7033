use serde::Serialize;
use std::time::Instant;

/// Collects diagnostic statistics for a capture session.
pub struct DiagnosticStats {
    frame_count: u64,
    drop_count: u64,
    total_bytes: u64,
    start_time: Instant,
    last_capture_us: Option<u64>,
    interval_us: u64,
    resolution: Option<(u32, u32)>,
}

/// Serialisable snapshot of the diagnostic stats.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticSnapshot {
    pub fps: f64,
    pub frame_count: u64,
    pub drop_count: u64,
    pub drop_rate: f64,
    pub frame_interval_ms: f64,
    pub bandwidth_bps: u64,
    pub resolution: Option<String>,
}

impl DiagnosticStats {
    /// Create new stats with zeroed counters.
    pub fn new() -> Self {
        Self {
            frame_count: 0,
            drop_count: 0,
            total_bytes: 0,
            start_time: Instant::now(),
            last_capture_us: None,
            interval_us: 0,
            resolution: None,
        }
    }

    /// Record a published frame.
    pub fn record_frame(&mut self, width: u32, height: u32, capture_timestamp_us: u64) {
        self.frame_count += 1;
        self.total_bytes += u64::from(width) * u64::from(height) * 4;
        self.resolution = Some((width, height));

        // Capture timestamps are non-decreasing; a step back means a new stream.
        if let Some(last) = self.last_capture_us {
            if capture_timestamp_us >= last {
                self.interval_us = capture_timestamp_us - last;
            }
        }
        self.last_capture_us = Some(capture_timestamp_us);
    }

    /// Record a frame that was replaced before any consumer read it.
    pub fn record_drop(&mut self) {
        self.drop_count += 1;
    }

    /// Calculate current FPS based on elapsed time.
    pub fn fps(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed < 0.001 {
            return 0.0;
        }
        self.frame_count as f64 / elapsed
    }

    /// Drop rate as a percentage (0.0 - 100.0).
    pub fn drop_rate(&self) -> f64 {
        if self.frame_count == 0 {
            return 0.0;
        }
        (self.drop_count as f64 / self.frame_count as f64) * 100.0
    }

    /// Gap between the two most recent capture timestamps in milliseconds.
    pub fn frame_interval_ms(&self) -> f64 {
        self.interval_us as f64 / 1000.0
    }

    /// Bandwidth in bytes per second.
    pub fn bandwidth_bps(&self) -> u64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed < 0.001 {
            return 0;
        }
        (self.total_bytes as f64 / elapsed) as u64
    }

    /// Reset all counters.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Take a serialisable snapshot.
    pub fn snapshot(&self) -> DiagnosticSnapshot {
        DiagnosticSnapshot {
            fps: self.fps(),
            frame_count: self.frame_count,
            drop_count: self.drop_count,
            drop_rate: self.drop_rate(),
            frame_interval_ms: self.frame_interval_ms(),
            bandwidth_bps: self.bandwidth_bps(),
            resolution: self.resolution.map(|(w, h)| format!("{w}x{h}")),
        }
    }
}

impl DiagnosticSnapshot {
    /// One-line summary for periodic logging.
    pub fn summary(&self) -> String {
        format!(
            "{} at {:.1} fps, {} dropped ({:.1}%), {:.1} ms interval",
            self.resolution.as_deref().unwrap_or("no frames"),
            self.fps,
            self.drop_count,
            self.drop_rate,
            self.frame_interval_ms
        )
    }
}

impl Default for DiagnosticStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn initialises_with_zero_values() {
        let stats = DiagnosticStats::new();
        assert_eq!(stats.frame_count, 0);
        assert_eq!(stats.drop_count, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.interval_us, 0);
    }

    #[test]
    fn record_frame_counts_frames_and_bytes() {
        let mut stats = DiagnosticStats::new();
        stats.record_frame(10, 10, 0);
        stats.record_frame(10, 10, 33_333);
        assert_eq!(stats.frame_count, 2);
        assert_eq!(stats.total_bytes, 800);
    }

    #[test]
    fn frame_interval_follows_capture_timestamps() {
        let mut stats = DiagnosticStats::new();
        stats.record_frame(1, 1, 1_000);
        assert_eq!(stats.frame_interval_ms(), 0.0);
        stats.record_frame(1, 1, 34_333);
        assert!((stats.frame_interval_ms() - 33.333).abs() < 0.001);
        // A timestamp going backwards keeps the previous interval.
        stats.record_frame(1, 1, 10);
        assert!((stats.frame_interval_ms() - 33.333).abs() < 0.001);
    }

    #[test]
    fn fps_is_positive_after_frames() {
        let mut stats = DiagnosticStats::new();
        for i in 0..30 {
            stats.record_frame(4, 4, i * 33_333);
        }
        thread::sleep(Duration::from_millis(50));
        let fps = stats.fps();
        assert!(fps > 0.0, "fps should be positive, got {fps}");
    }

    #[test]
    fn drop_rate_is_share_of_published_frames() {
        let mut stats = DiagnosticStats::new();
        for i in 0..4 {
            stats.record_frame(1, 1, i);
        }
        stats.record_drop();
        let rate = stats.drop_rate();
        assert!((rate - 25.0).abs() < 0.001, "drop rate should be 25%, got {rate}");
    }

    #[test]
    fn summary_reports_drop_rate_as_stored() {
        let mut stats = DiagnosticStats::new();
        for i in 0..4 {
            stats.record_frame(64, 36, i * 33_333);
        }
        stats.record_drop();
        let summary = stats.snapshot().summary();
        assert!(summary.starts_with("64x36 at "), "{summary}");
        assert!(summary.contains("1 dropped (25.0%)"), "{summary}");
        assert!(summary.ends_with("33.3 ms interval"), "{summary}");
    }

    #[test]
    fn drop_rate_zero_when_no_events() {
        let stats = DiagnosticStats::new();
        assert_eq!(stats.drop_rate(), 0.0);
    }

    #[test]
    fn bandwidth_bps_tracks_bytes() {
        let mut stats = DiagnosticStats::new();
        stats.record_frame(100, 100, 0);
        thread::sleep(Duration::from_millis(50));
        let bps = stats.bandwidth_bps();
        assert!(bps > 0, "bandwidth should be positive, got {bps}");
    }

    #[test]
    fn reset_clears_all_counters() {
        let mut stats = DiagnosticStats::new();
        stats.record_frame(2, 2, 0);
        stats.record_drop();
        stats.reset();
        assert_eq!(stats.frame_count, 0);
        assert_eq!(stats.drop_count, 0);
        assert_eq!(stats.total_bytes, 0);
        assert!(stats.resolution.is_none());
    }

    #[test]
    fn snapshot_serialises_to_camelcase() {
        let mut stats = DiagnosticStats::new();
        stats.record_frame(640, 360, 0);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert!(json["frameCount"].is_number());
        assert!(json["dropCount"].is_number());
        assert!(json["frameIntervalMs"].is_number());
        assert_eq!(json["resolution"], "640x360");
    }

    #[test]
    fn snapshot_resolution_none_serialises_as_null() {
        let json = serde_json::to_value(DiagnosticStats::new().snapshot()).unwrap();
        assert!(json["resolution"].is_null());
    }
}
