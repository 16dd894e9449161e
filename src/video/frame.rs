/*!
 * Video Frame Representation
 *
 * Raw captured frames and their conversion to an RGB raster.
 */

use std::time::{SystemTime, UNIX_EPOCH};

use image::RgbImage;

/// Pixel format for raw frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// RGB 24-bit (V4L2 RGB3)
    RGB24,
    /// RGBA 8-bit per channel
    RGBA,
    /// BGRA 8-bit per channel
    BGRA,
    /// Packed YUV 4:2:2 (Y0 U Y1 V), the usual webcam default
    YUYV,
}

impl PixelFormat {
    /// Get bytes per pixel
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::BGRA | PixelFormat::RGBA => 4,
            PixelFormat::RGB24 => 3,
            PixelFormat::YUYV => 2,
        }
    }

    /// Check if this format has an alpha channel
    pub fn has_alpha(&self) -> bool {
        matches!(self, PixelFormat::BGRA | PixelFormat::RGBA)
    }
}

/// Raw uncompressed video frame
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Frame pixel data
    pub data: Vec<u8>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel format
    pub format: PixelFormat,
    /// Timestamp in milliseconds since epoch
    pub timestamp_ms: u64,
    /// Frame sequence number
    pub sequence: u64,
}

impl RawFrame {
    /// Create a new raw frame
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u64,
    ) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            data,
            width,
            height,
            format,
            timestamp_ms,
            sequence,
        }
    }

    /// Get expected data size for this frame
    pub fn expected_size(&self) -> usize {
        (self.width * self.height) as usize * self.format.bytes_per_pixel()
    }

    /// Validate frame data size
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() == self.expected_size()
    }

    /// Convert to an RGB raster. Returns `None` for an empty or truncated frame.
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        if !self.is_valid() {
            return None;
        }

        let rgb = match self.format {
            PixelFormat::RGB24 => self.data.clone(),
            PixelFormat::RGBA => self
                .data
                .chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect(),
            PixelFormat::BGRA => self
                .data
                .chunks_exact(4)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
            PixelFormat::YUYV => yuyv_to_rgb(&self.data),
        };

        RgbImage::from_raw(self.width, self.height, rgb)
    }
}

/// Convert packed YUYV to RGB24 using BT.601 integer coefficients
fn yuyv_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 2 * 3);
    for chunk in data.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        out.extend_from_slice(&yuv_to_rgb(y0, u, v));
        out.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    out
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;

    [r.clamp(0, 255) as u8, g.clamp(0, 255) as u8, b.clamp(0, 255) as u8]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format() {
        assert_eq!(PixelFormat::BGRA.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::RGBA.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::RGB24.bytes_per_pixel(), 3);
        assert_eq!(PixelFormat::YUYV.bytes_per_pixel(), 2);
        assert!(PixelFormat::BGRA.has_alpha());
        assert!(!PixelFormat::RGB24.has_alpha());
    }

    #[test]
    fn test_raw_frame_creation() {
        let data = vec![0u8; 640 * 480 * 3];
        let frame = RawFrame::new(data, 640, 480, PixelFormat::RGB24, 0);

        assert_eq!(frame.width, 640);
        assert_eq!(frame.height, 480);
        assert!(frame.is_valid());
        assert!(frame.timestamp_ms > 0);
    }

    #[test]
    fn test_bgra_to_rgb() {
        let data = vec![10, 20, 30, 40, 255, 128, 64, 255]; // 2 BGRA pixels
        let frame = RawFrame::new(data, 2, 1, PixelFormat::BGRA, 0);

        let rgb = frame.to_rgb_image().unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [30, 20, 10]);
        assert_eq!(rgb.get_pixel(1, 0).0, [64, 128, 255]);
    }

    #[test]
    fn test_yuyv_grey_maps_to_grey() {
        // Y=126 with neutral chroma is mid grey
        let data = vec![126, 128, 126, 128];
        let frame = RawFrame::new(data, 2, 1, PixelFormat::YUYV, 0);

        let rgb = frame.to_rgb_image().unwrap();
        let px = rgb.get_pixel(0, 0).0;
        assert_eq!(px[0], px[1]);
        assert_eq!(px[1], px[2]);
    }

    #[test]
    fn test_frame_validation() {
        let data = vec![0u8; 100]; // Too small
        let frame = RawFrame::new(data, 640, 480, PixelFormat::RGB24, 0);
        assert!(!frame.is_valid());
        assert!(frame.to_rgb_image().is_none());

        let empty = RawFrame::new(Vec::new(), 0, 0, PixelFormat::RGB24, 0);
        assert!(!empty.is_valid());
    }
}
