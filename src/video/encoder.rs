/*!
 * Frame Encoder
 *
 * Rasterizes the live surface into the session's fixed-size buffer and
 * compresses it to JPEG. Encoding runs on the blocking pool so the stream loop
 * stays responsive while it is suspended.
 */

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use tracing::{debug, trace};

use super::frame::RawFrame;
use super::Quality;

/// Encoder configuration
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Output raster width in pixels
    pub width: u32,
    /// Output raster height in pixels
    pub height: u32,
    /// JPEG quality preset
    pub quality: Quality,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            quality: Quality::Medium,
        }
    }
}

impl EncoderConfig {
    /// Fix the output size from the capture's intrinsic dimensions, falling
    /// back to 640x480 when the source does not report a size.
    pub fn for_source(width: u32, height: u32, quality: Quality) -> Self {
        let (width, height) = if width == 0 || height == 0 {
            (640, 480)
        } else {
            (width, height)
        };
        Self { width, height, quality }
    }
}

/// Compressed frame ready for the channel
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// JPEG bytes
    pub data: Bytes,
    /// Sequence number of the source frame
    pub sequence: u64,
    /// Capture timestamp of the source frame
    pub timestamp_ms: u64,
    pub width: u32,
    pub height: u32,
}

/// Future returned by [`FrameEncoder::encode`]. `Ok(None)` means no payload
/// was produced and the attempt should be skipped.
pub type EncodeFuture = Pin<Box<dyn Future<Output = Result<Option<EncodedFrame>>> + Send>>;

/// Frame encoder trait
pub trait FrameEncoder: Send + Sync {
    /// Encode the given live frame
    fn encode(&self, frame: Arc<RawFrame>) -> EncodeFuture;

    /// Get encoder configuration
    fn config(&self) -> &EncoderConfig;
}

/// Draw `frame` into a raster of exactly `width` x `height`.
///
/// Returns `None` when the frame has no usable pixels yet.
pub fn rasterize(frame: &RawFrame, width: u32, height: u32) -> Option<RgbImage> {
    let rgb = frame.to_rgb_image()?;
    if rgb.width() == width && rgb.height() == height {
        Some(rgb)
    } else {
        Some(imageops::resize(&rgb, width, height, FilterType::Triangle))
    }
}

/// JPEG encoder backed by the `image` crate
#[derive(Debug, Clone)]
pub struct JpegFrameEncoder {
    config: EncoderConfig,
}

impl JpegFrameEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        debug!(
            "JPEG encoder: {}x{} quality {}",
            config.width,
            config.height,
            config.quality.jpeg_quality()
        );
        Self { config }
    }

    /// Synchronous encode, used from the blocking pool
    pub fn encode_blocking(config: &EncoderConfig, frame: &RawFrame) -> Result<Option<EncodedFrame>> {
        let Some(raster) = rasterize(frame, config.width, config.height) else {
            trace!("Frame {} has no pixels yet, skipping encode", frame.sequence);
            return Ok(None);
        };

        let mut buffer = Vec::with_capacity((config.width * config.height / 4) as usize);
        JpegEncoder::new_with_quality(&mut buffer, config.quality.jpeg_quality())
            .encode_image(&raster)
            .context("JPEG encode failed")?;

        if buffer.is_empty() {
            return Ok(None);
        }

        Ok(Some(EncodedFrame {
            data: Bytes::from(buffer),
            sequence: frame.sequence,
            timestamp_ms: frame.timestamp_ms,
            width: config.width,
            height: config.height,
        }))
    }
}

impl FrameEncoder for JpegFrameEncoder {
    fn encode(&self, frame: Arc<RawFrame>) -> EncodeFuture {
        let config = self.config.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || Self::encode_blocking(&config, &frame))
                .await
                .context("encode task join error")?
        })
    }

    fn config(&self) -> &EncoderConfig {
        &self.config
    }
}
