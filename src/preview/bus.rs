use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::capture::types::Frame;
use crate::diagnostics::stats::{DiagnosticSnapshot, DiagnosticStats};
use crate::privacy::config::PrivacyConfig;

/// Change counters broadcast to sinks whenever either slot is replaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusTick {
    pub frame_seq: u64,
    pub config_version: u64,
}

/// Last-value broadcast of the current frame and privacy configuration.
///
/// Holds exactly one frame. Publishing replaces it, so a producer that
/// outpaces the sinks drops the intermediate frames instead of queueing
/// them. Consumers read the current values when they paint; the tick
/// channel only tells them something changed.
pub struct FrameBus {
    frame: Mutex<Option<Frame>>,
    /// Set once any consumer has read the current frame.
    frame_taken: AtomicBool,
    config: RwLock<Arc<PrivacyConfig>>,
    /// Monotonic counter incremented on each publish or clear.
    sequence: AtomicU64,
    config_version: AtomicU64,
    stats: Mutex<DiagnosticStats>,
    ticks: watch::Sender<BusTick>,
}

impl FrameBus {
    pub fn new(config: PrivacyConfig) -> Self {
        let (ticks, _) = watch::channel(BusTick::default());
        Self {
            frame: Mutex::new(None),
            frame_taken: AtomicBool::new(true),
            config: RwLock::new(Arc::new(config)),
            sequence: AtomicU64::new(0),
            config_version: AtomicU64::new(0),
            stats: Mutex::new(DiagnosticStats::new()),
            ticks,
        }
    }

    /// Replace the current frame. Never blocks on consumers.
    pub fn publish(&self, frame: Frame) {
        let (width, height) = frame.image.dimensions();
        let timestamp_us = frame.timestamp_us;
        let (previous, superseded_unread) = {
            let mut slot = self.frame.lock();
            let previous = slot.replace(frame);
            (previous, !self.frame_taken.swap(false, Ordering::AcqRel))
        };

        {
            let mut stats = self.stats.lock();
            if previous.is_some() && superseded_unread {
                stats.record_drop();
            }
            stats.record_frame(width, height, timestamp_us);
        }

        let seq = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        self.ticks.send_modify(|tick| tick.frame_seq = seq);
    }

    /// The most recently published frame, if any.
    pub fn current_frame(&self) -> Option<Frame> {
        let slot = self.frame.lock();
        if slot.is_some() {
            self.frame_taken.store(true, Ordering::Release);
        }
        slot.clone()
    }

    /// Drop the current frame so sinks fall back to their placeholder.
    pub fn clear_frame(&self) {
        {
            let mut slot = self.frame.lock();
            if slot.take().is_none() {
                return;
            }
            self.frame_taken.store(true, Ordering::Release);
        }
        let seq = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        self.ticks.send_modify(|tick| tick.frame_seq = seq);
    }

    pub fn current_config(&self) -> Arc<PrivacyConfig> {
        Arc::clone(&self.config.read())
    }

    /// Swap in a new configuration snapshot.
    pub fn set_config(&self, config: PrivacyConfig) {
        *self.config.write() = Arc::new(config);
        self.bump_config();
    }

    /// Derive a new snapshot from the current one and swap it in.
    pub fn update_config(&self, f: impl FnOnce(&mut PrivacyConfig)) -> Arc<PrivacyConfig> {
        let updated = {
            let mut slot = self.config.write();
            let mut next = PrivacyConfig::clone(&slot);
            f(&mut next);
            let next = Arc::new(next);
            *slot = Arc::clone(&next);
            next
        };
        self.bump_config();
        updated
    }

    fn bump_config(&self) {
        let version = self.config_version.fetch_add(1, Ordering::AcqRel) + 1;
        self.ticks.send_modify(|tick| tick.config_version = version);
    }

    /// Receiver that wakes whenever the frame or configuration changes.
    pub fn subscribe(&self) -> watch::Receiver<BusTick> {
        self.ticks.subscribe()
    }

    /// Number of publishes and clears so far.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub fn diagnostics(&self) -> DiagnosticSnapshot {
        self.stats.lock().snapshot()
    }

    /// Restart statistics, e.g. when a new stream opens.
    pub fn reset_diagnostics(&self) {
        self.stats.lock().reset();
    }
}

impl Default for FrameBus {
    fn default() -> Self {
        Self::new(PrivacyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privacy::config::PrivacyMode;
    use image::RgbaImage;
    use std::thread;

    fn frame(ts: u64) -> Frame {
        Frame::new(RgbaImage::new(2, 2), ts)
    }

    #[test]
    fn empty_bus_has_no_frame() {
        let bus = FrameBus::default();
        assert!(bus.current_frame().is_none());
        assert_eq!(bus.sequence(), 0);
    }

    #[test]
    fn publish_replaces_previous_frame() {
        let bus = FrameBus::default();
        bus.publish(frame(1));
        bus.publish(frame(2));
        bus.publish(frame(3));
        assert_eq!(bus.current_frame().unwrap().timestamp_us, 3);
        assert_eq!(bus.sequence(), 3);
    }

    #[test]
    fn superseded_frames_release_their_pixels() {
        let bus = FrameBus::default();
        let first = frame(1);
        let weak = Arc::downgrade(&first.image);
        bus.publish(first);
        bus.publish(frame(2));
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn unread_frames_count_as_dropped() {
        let bus = FrameBus::default();
        bus.publish(frame(1));
        bus.publish(frame(2)); // 1 never read
        let _ = bus.current_frame();
        bus.publish(frame(3)); // 2 was read
        let snap = bus.diagnostics();
        assert_eq!(snap.frame_count, 3);
        assert_eq!(snap.drop_count, 1);
    }

    #[test]
    fn clear_frame_removes_slot_and_bumps_sequence() {
        let bus = FrameBus::default();
        bus.publish(frame(1));
        bus.clear_frame();
        assert!(bus.current_frame().is_none());
        assert_eq!(bus.sequence(), 2);
        // Clearing an empty slot is a no-op.
        bus.clear_frame();
        assert_eq!(bus.sequence(), 2);
    }

    #[test]
    fn update_config_is_visible_to_every_reader() {
        let bus = FrameBus::default();
        let before = bus.current_config();
        let after = bus.update_config(|c| {
            c.enabled = true;
            c.mode = PrivacyMode::Black;
        });
        assert!(!before.enabled);
        assert!(after.enabled);
        assert!(Arc::ptr_eq(&after, &bus.current_config()));
    }

    #[tokio::test]
    async fn subscribers_see_frame_and_config_ticks() {
        let bus = FrameBus::default();
        let mut rx = bus.subscribe();
        bus.publish(frame(1));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().frame_seq, 1);

        bus.set_config(PrivacyConfig::default().with_enabled(true));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().config_version, 1);
    }

    #[test]
    fn concurrent_publish_and_read() {
        let bus = Arc::new(FrameBus::default());
        let producer = {
            let bus = Arc::clone(&bus);
            thread::spawn(move || {
                for i in 0..500 {
                    bus.publish(frame(i));
                }
            })
        };
        let mut last = 0;
        for _ in 0..500 {
            if let Some(f) = bus.current_frame() {
                // Readers never observe time going backwards.
                assert!(f.timestamp_us >= last);
                last = f.timestamp_us;
            }
        }
        producer.join().unwrap();
        assert_eq!(bus.current_frame().unwrap().timestamp_us, 499);
    }

    #[test]
    fn bus_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FrameBus>();
    }
}
