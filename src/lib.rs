/*!
 * Ship Stream Library
 *
 * Live camera client for the ship detector: captures frames, streams them
 * over a websocket with single-flight pacing and overlays the detections
 * that come back. Also wraps the detector's one-shot upload and export API.
 */

pub mod api;
pub mod capture;
pub mod config;
pub mod detection;
pub mod error;
pub mod render;
pub mod stats;
pub mod streaming;
pub mod transport;
pub mod video;

// Re-export commonly used types
pub use capture::{CaptureConfig, CaptureHandle, CaptureSource, SyntheticSource};
pub use config::AppConfig;
pub use detection::{Detection, DetectionResult};
pub use error::{ChannelError, DeviceError, SessionError, SkipReason};
pub use render::{AnnotationRenderer, OverlaySink};
pub use stats::StatsSnapshot;
pub use streaming::{SessionConfig, SessionState, StreamSession};
pub use transport::{Channel, ChannelDriver, ChannelState, Transport, WsTransport};
