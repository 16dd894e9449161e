//! Synthetic camera (`synthetic://` devices).
//!
//! Paints a moving bright block over a water-coloured gradient so the whole
//! pipeline can run without hardware. Also used by the test suite, which needs
//! to count how many times a session actually stops its tracks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use super::{CaptureConfig, CaptureHandle, CaptureSource, FramePublisher};
use crate::error::DeviceError;
use crate::video::{PixelFormat, RawFrame};

/// Test-pattern capture source
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    releases: Arc<AtomicUsize>,
    acquisitions: Arc<AtomicUsize>,
    fail_with: Option<DeviceError>,
    /// When false the source never paints a frame, so metadata never loads
    paint: bool,
    /// Simulated unplug after this many frames
    drop_out_after: Option<u64>,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self {
            releases: Arc::new(AtomicUsize::new(0)),
            acquisitions: Arc::new(AtomicUsize::new(0)),
            fail_with: None,
            paint: true,
            drop_out_after: None,
        }
    }

    /// A source whose acquisition always fails with `err`.
    pub fn failing(err: DeviceError) -> Self {
        Self {
            fail_with: Some(err),
            ..Self::new()
        }
    }

    /// A source that acquires but never produces a frame.
    pub fn blank() -> Self {
        Self {
            paint: false,
            ..Self::new()
        }
    }

    /// A source that paints `frames` frames and then reports the camera as
    /// disconnected.
    pub fn dropping_out(frames: u64) -> Self {
        Self {
            drop_out_after: Some(frames),
            ..Self::new()
        }
    }

    /// Number of handles whose tracks have been stopped
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Number of successful acquisitions
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for SyntheticSource {
    fn acquire(&self, config: &CaptureConfig) -> Result<CaptureHandle, DeviceError> {
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }

        let (handle, publisher) = CaptureHandle::new(config.device.clone());
        let releases = self.releases.clone();
        let handle = handle.with_release_hook(move || {
            releases.fetch_add(1, Ordering::SeqCst);
        });

        if self.paint {
            let config = config.clone();
            let drop_out_after = self.drop_out_after;
            thread::Builder::new()
                .name("synthetic-capture".into())
                .spawn(move || run_pattern(config, publisher, drop_out_after))
                .map_err(|e| DeviceError::Backend(format!("spawn capture thread: {}", e)))?;
        } else {
            // Keep the surface open but never paint it
            thread::Builder::new()
                .name("synthetic-capture".into())
                .spawn(move || {
                    while !publisher.is_stopped() {
                        thread::sleep(Duration::from_millis(10));
                    }
                })
                .map_err(|e| DeviceError::Backend(format!("spawn capture thread: {}", e)))?;
        }

        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        info!(
            "Synthetic camera {} acquired ({}x{} @ {} fps)",
            config.device, config.width, config.height, config.frame_rate
        );
        Ok(handle)
    }
}

fn run_pattern(config: CaptureConfig, publisher: FramePublisher, drop_out_after: Option<u64>) {
    let frame_interval = Duration::from_micros(1_000_000 / config.frame_rate.max(1) as u64);
    let mut sequence = 0u64;

    while !publisher.is_stopped() {
        if drop_out_after.is_some_and(|limit| sequence >= limit) {
            publisher.fail(DeviceError::Backend(format!(
                "{} disconnected after {} frames",
                config.device, sequence
            )));
            return;
        }
        sequence += 1;
        publisher.publish(pattern_frame(config.width, config.height, sequence));
        thread::sleep(frame_interval);
    }

    debug!("Synthetic camera {} stopped after {} frames", config.device, sequence);
}

/// Render one pattern frame. The block moves one step per frame.
pub fn pattern_frame(width: u32, height: u32, sequence: u64) -> RawFrame {
    let mut data = vec![0u8; (width * height * 3) as usize];
    let block_w = (width / 6).max(1);
    let block_h = (height / 10).max(1);
    let block_x = (sequence as u32 * 4) % width.max(1);
    let block_y = height / 2;

    for y in 0..height {
        for x in 0..width {
            let idx = ((y * width + x) * 3) as usize;
            let inside = x >= block_x && x < block_x + block_w && y >= block_y && y < block_y + block_h;
            let px = if inside {
                [230, 230, 230]
            } else {
                [20, (60 + y * 100 / height.max(1)) as u8, (120 + y * 100 / height.max(1)) as u8]
            };
            data[idx..idx + 3].copy_from_slice(&px);
        }
    }

    RawFrame::new(data, width, height, PixelFormat::RGB24, sequence)
}
