//! Output surfaces for annotated frames.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbaImage};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Receives every annotated frame the session renders.
pub trait OverlaySink: Send + Sync {
    fn present(&self, frame: &RgbaImage) -> Result<()>;
}

/// Keeps the most recent annotated frame for embedding callers.
#[derive(Debug)]
pub struct LatestFrameSink {
    tx: watch::Sender<Option<Arc<RgbaImage>>>,
}

impl LatestFrameSink {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<RgbaImage>>> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> Option<Arc<RgbaImage>> {
        self.tx.borrow().clone()
    }
}

impl Default for LatestFrameSink {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlaySink for LatestFrameSink {
    fn present(&self, frame: &RgbaImage) -> Result<()> {
        self.tx.send_replace(Some(Arc::new(frame.clone())));
        Ok(())
    }
}

/// Writes annotated frames to a JPEG file, replacing it atomically so a
/// viewer polling the file never reads a half-written image.
///
/// `present` only hands the frame to a writer task; encoding and file IO run
/// on the blocking pool. Frames that arrive while a write is in progress
/// collapse to the newest one. Must be created inside a tokio runtime.
#[derive(Debug)]
pub struct JpegFileSink {
    path: PathBuf,
    tx: watch::Sender<Option<Arc<RgbaImage>>>,
    written: watch::Receiver<u64>,
}

impl JpegFileSink {
    pub fn new(path: impl Into<PathBuf>, quality: u8) -> Self {
        let path = path.into();
        let (tx, rx) = watch::channel(None);
        let (written_tx, written) = watch::channel(0);
        tokio::spawn(run_writer(path.clone(), quality.clamp(1, 100), rx, written_tx));
        Self { path, tx, written }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of frames written so far
    pub fn subscribe_written(&self) -> watch::Receiver<u64> {
        self.written.clone()
    }
}

impl OverlaySink for JpegFileSink {
    fn present(&self, frame: &RgbaImage) -> Result<()> {
        self.tx.send_replace(Some(Arc::new(frame.clone())));
        Ok(())
    }
}

async fn run_writer(
    path: PathBuf,
    quality: u8,
    mut frames: watch::Receiver<Option<Arc<RgbaImage>>>,
    written: watch::Sender<u64>,
) {
    while frames.changed().await.is_ok() {
        let Some(frame) = frames.borrow_and_update().clone() else {
            continue;
        };

        let target = path.clone();
        match tokio::task::spawn_blocking(move || write_jpeg(&target, quality, &frame)).await {
            Ok(Ok(())) => {
                written.send_modify(|count| *count += 1);
            }
            Ok(Err(e)) => warn!("Failed to write preview: {:#}", e),
            Err(e) => warn!("Preview writer task failed: {}", e),
        }
    }
    debug!("Preview writer for {} finished", path.display());
}

fn write_jpeg(path: &Path, quality: u8, frame: &RgbaImage) -> Result<()> {
    let rgb = DynamicImage::ImageRgba8(frame.clone()).to_rgb8();
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .encode_image(&rgb)
        .context("encode preview JPEG")?;

    let tmp = path.with_extension("jpg.part");
    std::fs::write(&tmp, &buffer).with_context(|| format!("write preview {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("replace preview {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_latest_frame_sink_keeps_newest() {
        let sink = LatestFrameSink::new();
        let rx = sink.subscribe();
        assert!(sink.latest().is_none());

        sink.present(&RgbaImage::from_pixel(2, 2, Rgba([1, 1, 1, 255]))).unwrap();
        sink.present(&RgbaImage::from_pixel(4, 4, Rgba([2, 2, 2, 255]))).unwrap();

        assert_eq!(sink.latest().unwrap().dimensions(), (4, 4));
        assert_eq!(rx.borrow().as_ref().unwrap().dimensions(), (4, 4));
    }

    #[test]
    fn test_write_jpeg_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.jpg");

        write_jpeg(&path, 70, &RgbaImage::from_pixel(16, 16, Rgba([0, 255, 0, 255]))).unwrap();
        write_jpeg(&path, 70, &RgbaImage::from_pixel(32, 16, Rgba([0, 0, 255, 255]))).unwrap();

        let written = image::open(&path).unwrap();
        assert_eq!((written.width(), written.height()), (32, 16));
        assert!(!path.with_extension("jpg.part").exists());
    }

    #[tokio::test]
    async fn test_jpeg_file_sink_writes_off_the_caller() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.jpg");
        let sink = JpegFileSink::new(&path, 70);
        let mut written = sink.subscribe_written();

        sink.present(&RgbaImage::from_pixel(16, 16, Rgba([0, 255, 0, 255]))).unwrap();
        sink.present(&RgbaImage::from_pixel(32, 16, Rgba([0, 0, 255, 255]))).unwrap();

        // Written frames always end with the newest one
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                written.changed().await.unwrap();
                let dims = image::image_dimensions(&path).unwrap();
                if dims == (32, 16) {
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert!(!path.with_extension("jpg.part").exists());
    }
}
