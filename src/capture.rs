//! Camera capture.
//!
//! A [`CaptureSource`] acquires a device and hands back a [`CaptureHandle`]
//! whose live surface keeps updating from a dedicated capture thread. The
//! surface is a `watch` of the latest frame, so readers always see the newest
//! raster and never queue old ones.
//!
//! A capture thread that stops on its own (device unplugged, driver error)
//! reports it through [`FramePublisher::fail`] or by dropping its publisher;
//! [`CaptureHandle::lost`] resolves in both cases.

use std::sync::atomic::{AtomicBool, Ordering};
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::DeviceError;
use crate::video::RawFrame;

pub mod synthetic;
#[cfg(all(feature = "v4l2", target_os = "linux"))]
pub mod v4l2;

pub use synthetic::SyntheticSource;
#[cfg(all(feature = "v4l2", target_os = "linux"))]
pub use v4l2::V4l2Source;

/// Device prefix that selects the synthetic test-pattern source
pub const SYNTHETIC_SCHEME: &str = "synthetic://";

/// Capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Device path (e.g. "/dev/video0") or "synthetic://name"
    pub device: String,
    /// Requested width
    pub width: u32,
    /// Requested height
    pub height: u32,
    /// Requested frame rate
    pub frame_rate: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            frame_rate: 30,
        }
    }
}

/// Camera backend.
pub trait CaptureSource: Send + Sync {
    /// Request device access and start producing frames.
    fn acquire(&self, config: &CaptureConfig) -> Result<CaptureHandle, DeviceError>;
}

/// Pick a backend for the configured device string.
pub fn source_for_device(device: &str) -> Result<Arc<dyn CaptureSource>, DeviceError> {
    if device.starts_with(SYNTHETIC_SCHEME) {
        return Ok(Arc::new(SyntheticSource::new()));
    }

    #[cfg(all(feature = "v4l2", target_os = "linux"))]
    {
        Ok(Arc::new(V4l2Source::new()))
    }

    #[cfg(not(all(feature = "v4l2", target_os = "linux")))]
    {
        Err(DeviceError::Backend(format!(
            "no camera backend for {} (build with the `v4l2` feature)",
            device
        )))
    }
}

/// Write side of a live surface, owned by the capture thread.
#[derive(Debug, Clone)]
pub struct FramePublisher {
    tx: Arc<watch::Sender<Option<Arc<RawFrame>>>>,
    fault: Arc<watch::Sender<Option<DeviceError>>>,
    stop: Arc<AtomicBool>,
}

impl FramePublisher {
    /// Replace the current surface content.
    pub fn publish(&self, frame: RawFrame) {
        self.tx.send_replace(Some(Arc::new(frame)));
    }

    /// True once the handle has been released; the capture thread must exit.
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Report that the device stopped producing frames. Only the first
    /// fault is kept.
    pub fn fail(&self, err: DeviceError) {
        self.fault.send_if_modified(|fault| {
            if fault.is_some() {
                return false;
            }
            warn!("Capture fault: {}", err);
            *fault = Some(err);
            true
        });
    }
}

type ReleaseHook = Box<dyn Fn() + Send + Sync>;

/// Live capture handle.
///
/// Releasing stops the capture thread's tracks. Release is idempotent and also
/// happens on drop.
pub struct CaptureHandle {
    device: String,
    surface: watch::Receiver<Option<Arc<RawFrame>>>,
    fault: watch::Receiver<Option<DeviceError>>,
    stop: Arc<AtomicBool>,
    released: AtomicBool,
    on_release: Option<ReleaseHook>,
}

impl CaptureHandle {
    /// Create a handle plus the publisher its capture thread writes to.
    pub fn new(device: impl Into<String>) -> (Self, FramePublisher) {
        let (tx, rx) = watch::channel(None);
        let (fault_tx, fault_rx) = watch::channel(None);
        let stop = Arc::new(AtomicBool::new(false));

        let handle = Self {
            device: device.into(),
            surface: rx,
            fault: fault_rx,
            stop: stop.clone(),
            released: AtomicBool::new(false),
            on_release: None,
        };
        let publisher = FramePublisher {
            tx: Arc::new(tx),
            fault: Arc::new(fault_tx),
            stop,
        };
        (handle, publisher)
    }

    /// Run `hook` once when the handle is effectively released.
    pub fn with_release_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Latest frame on the live surface, if any has been painted.
    pub fn latest(&self) -> Option<Arc<RawFrame>> {
        self.surface.borrow().clone()
    }

    /// Wait until the first frame arrives and return its intrinsic size.
    pub async fn wait_metadata(&self, timeout: Duration) -> Result<(u32, u32), DeviceError> {
        let mut rx = self.surface.clone();
        let waited = tokio::time::timeout(timeout, async move {
            let dims = rx.wait_for(|frame| frame.is_some()).await.map(|frame| match &*frame {
                Some(f) => (f.width, f.height),
                None => (0, 0),
            });
            dims
        })
        .await;

        match waited {
            Ok(Ok(dims)) => {
                debug!("Capture {} metadata ready: {}x{}", self.device, dims.0, dims.1);
                Ok(dims)
            }
            Ok(Err(_)) => Err(DeviceError::Backend(format!(
                "capture on {} stopped before the first frame",
                self.device
            ))),
            Err(_) => Err(DeviceError::MetadataTimeout(timeout)),
        }
    }

    /// Resolves when the device stops producing frames while the handle is
    /// still held. Never resolves after release.
    pub async fn lost(&self) -> DeviceError {
        let mut rx = self.fault.clone();
        let fault = rx
            .wait_for(|fault| fault.is_some())
            .await
            .map(|fault| (*fault).clone());

        match fault {
            Ok(Some(err)) => err,
            _ if self.is_released() => pending().await,
            _ => DeviceError::Backend(format!("capture on {} stopped", self.device)),
        }
    }

    /// Stop every underlying track. Calling this again is a no-op.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop.store(true, Ordering::Release);
        if let Some(hook) = &self.on_release {
            hook();
        }
        info!("Capture {} released", self.device);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("device", &self.device)
            .field("released", &self.is_released())
            .finish()
    }
}
