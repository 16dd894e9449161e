//! Stream statistics.
//!
//! Raw values only: frames sent in the last completed one-second window and
//! the ship count from the last detector message. No smoothing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

/// Length of one fps window
pub const FPS_WINDOW: Duration = Duration::from_millis(1000);

/// Snapshot read by the operator UI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Frames sent during the last completed window
    pub fps: u32,
    /// `total_ships` from the last detector message
    pub ships: u32,
    /// Frames sent since the session started
    pub frames_sent: u64,
    /// Detector messages received since the session started
    pub results_received: u64,
}

/// Rolling send counter.
#[derive(Debug, Clone)]
pub struct FpsWindow {
    window_start: Instant,
    count: u32,
}

impl FpsWindow {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
        }
    }

    /// Count one completed send. Returns the window total once more than
    /// [`FPS_WINDOW`] has elapsed since the window started, then starts a new window.
    pub fn record(&mut self, now: Instant) -> Option<u32> {
        self.count += 1;
        if now.saturating_duration_since(self.window_start) > FPS_WINDOW {
            let fps = self.count;
            self.count = 0;
            self.window_start = now;
            Some(fps)
        } else {
            None
        }
    }
}

/// Accumulates fps ticks and detection totals and publishes snapshots.
#[derive(Debug)]
pub struct StatsAggregator {
    window: FpsWindow,
    snapshot: StatsSnapshot,
    tx: Arc<watch::Sender<StatsSnapshot>>,
}

impl StatsAggregator {
    pub fn new(now: Instant) -> Self {
        let (tx, _) = watch::channel(StatsSnapshot::default());
        Self::attached(now, Arc::new(tx))
    }

    /// Aggregator publishing into an existing sender, so subscribers survive
    /// across sessions. Resets the published snapshot.
    pub fn attached(now: Instant, tx: Arc<watch::Sender<StatsSnapshot>>) -> Self {
        tx.send_replace(StatsSnapshot::default());
        Self {
            window: FpsWindow::new(now),
            snapshot: StatsSnapshot::default(),
            tx,
        }
    }

    /// Receiver for the UI layer
    pub fn subscribe(&self) -> watch::Receiver<StatsSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot
    }

    /// A frame send completed at `now`.
    pub fn record_send(&mut self, now: Instant) {
        self.snapshot.frames_sent += 1;
        if let Some(fps) = self.window.record(now) {
            self.snapshot.fps = fps;
        }
        self.publish();
    }

    /// A detector message arrived.
    pub fn record_result(&mut self, total_ships: u32) {
        self.snapshot.ships = total_ships;
        self.snapshot.results_received += 1;
        self.publish();
    }

    fn publish(&self) {
        self.tx.send_replace(self.snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_twelve_sends_over_1200ms_publish_twelve() {
        let start = Instant::now();
        let mut window = FpsWindow::new(start);
        let mut published = Vec::new();

        for i in 0..12u64 {
            if let Some(fps) = window.record(start + Duration::from_millis(i * 100)) {
                published.push(fps);
            }
        }

        assert_eq!(published, vec![12]);
    }

    #[test]
    fn test_window_boundary_is_exclusive() {
        let start = Instant::now();
        let mut window = FpsWindow::new(start);
        assert_eq!(window.record(start + Duration::from_millis(1000)), None);
        assert_eq!(window.record(start + Duration::from_millis(1001)), Some(2));
        // New window starts at the publish instant
        assert_eq!(window.record(start + Duration::from_millis(1500)), None);
    }

    #[test]
    fn test_fps_holds_when_sends_stop() {
        let start = Instant::now();
        let mut stats = StatsAggregator::new(start);
        for i in 0..12u64 {
            stats.record_send(start + Duration::from_millis(i * 100));
        }
        assert_eq!(stats.snapshot().fps, 12);

        // Two more sends that never complete a window leave fps unchanged
        stats.record_send(start + Duration::from_millis(1200));
        stats.record_send(start + Duration::from_millis(1300));
        assert_eq!(stats.snapshot().fps, 12);
        assert_eq!(stats.snapshot().frames_sent, 14);
    }

    #[test]
    fn test_result_replaces_ship_count() {
        let mut stats = StatsAggregator::new(Instant::now());
        let rx = stats.subscribe();

        stats.record_result(3);
        stats.record_result(1);

        assert_eq!(rx.borrow().ships, 1);
        assert_eq!(rx.borrow().results_received, 2);
    }

    #[test]
    fn test_attached_aggregator_resets_shared_snapshot() {
        let (tx, rx) = watch::channel(StatsSnapshot::default());
        let tx = Arc::new(tx);

        let mut first = StatsAggregator::attached(Instant::now(), tx.clone());
        first.record_result(4);
        assert_eq!(rx.borrow().ships, 4);

        let _second = StatsAggregator::attached(Instant::now(), tx);
        assert_eq!(*rx.borrow(), StatsSnapshot::default());
    }
}
