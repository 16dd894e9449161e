/*!
 * Video Encoding Module
 *
 * Turns captured frames into fixed-size rasters and compressed JPEG payloads
 * for the detector channel.
 */

pub mod encoder;
pub mod frame;

pub use encoder::{rasterize, EncodeFuture, EncodedFrame, EncoderConfig, FrameEncoder, JpegFrameEncoder};
pub use frame::{PixelFormat, RawFrame};

/// JPEG quality preset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    /// Small payloads for slow links
    Low,
    /// Balanced (default, matches the web client's 0.7)
    Medium,
    /// Sharper frames, larger payloads
    High,
    /// Explicit quality 1-100
    Custom(u8),
}

impl Quality {
    /// Get the JPEG quality factor (1-100) for this preset
    pub fn jpeg_quality(&self) -> u8 {
        match self {
            Quality::Low => 50,
            Quality::Medium => 70,
            Quality::High => 90,
            Quality::Custom(q) => (*q).clamp(1, 100),
        }
    }
}

impl Default for Quality {
    fn default() -> Self {
        Quality::Medium
    }
}
