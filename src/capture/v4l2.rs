//! V4L2 camera source.
//!
//! The device and its mmap stream live on the capture thread, which keeps
//! publishing the newest frame until the handle is released. Dropping the
//! stream on that thread is what stops the camera's tracks.

use std::sync::mpsc as std_mpsc;
use std::thread;

use tracing::{info, warn};
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::FourCC;

use super::{CaptureConfig, CaptureHandle, CaptureSource, FramePublisher};
use crate::error::DeviceError;
use crate::video::{PixelFormat, RawFrame};

const BUFFER_COUNT: u32 = 4;

/// Local V4L2 device source
#[derive(Debug, Default, Clone)]
pub struct V4l2Source;

impl V4l2Source {
    pub fn new() -> Self {
        Self
    }
}

struct Negotiated {
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl CaptureSource for V4l2Source {
    fn acquire(&self, config: &CaptureConfig) -> Result<CaptureHandle, DeviceError> {
        let (handle, publisher) = CaptureHandle::new(config.device.clone());
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), DeviceError>>(1);
        let config = config.clone();

        thread::Builder::new()
            .name("v4l2-capture".into())
            .spawn(move || run_device(config, publisher, ready_tx))
            .map_err(|e| DeviceError::Backend(format!("spawn capture thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(DeviceError::Backend("capture thread exited during open".into())),
        }
    }
}

fn negotiate(device: &mut v4l::Device, config: &CaptureConfig) -> Result<Negotiated, DeviceError> {
    let mut format = device
        .format()
        .map_err(|e| DeviceError::from_io(&config.device, &e))?;
    format.width = config.width;
    format.height = config.height;
    format.fourcc = FourCC::new(b"RGB3");

    let format = match device.set_format(&format) {
        Ok(format) => format,
        Err(err) => {
            warn!("V4l2Source: failed to set RGB3 on {}: {}", config.device, err);
            let mut yuyv = device
                .format()
                .map_err(|e| DeviceError::from_io(&config.device, &e))?;
            yuyv.width = config.width;
            yuyv.height = config.height;
            yuyv.fourcc = FourCC::new(b"YUYV");
            device
                .set_format(&yuyv)
                .map_err(|e| DeviceError::from_io(&config.device, &e))?
        }
    };

    let pixel_format = if format.fourcc == FourCC::new(b"RGB3") {
        PixelFormat::RGB24
    } else if format.fourcc == FourCC::new(b"YUYV") {
        PixelFormat::YUYV
    } else {
        return Err(DeviceError::Backend(format!(
            "{} offers unsupported pixel format {}",
            config.device, format.fourcc
        )));
    };

    if config.frame_rate > 0 {
        let params = v4l::video::capture::Parameters::with_fps(config.frame_rate);
        if let Err(err) = device.set_params(&params) {
            warn!("V4l2Source: failed to set fps on {}: {}", config.device, err);
        }
    }

    Ok(Negotiated {
        width: format.width,
        height: format.height,
        format: pixel_format,
    })
}

fn run_device(
    config: CaptureConfig,
    publisher: FramePublisher,
    ready: std_mpsc::SyncSender<Result<(), DeviceError>>,
) {
    let mut device = match v4l::Device::with_path(&config.device) {
        Ok(device) => device,
        Err(err) => {
            let _ = ready.send(Err(DeviceError::from_io(&config.device, &err)));
            return;
        }
    };

    let negotiated = match negotiate(&mut device, &config) {
        Ok(n) => n,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    let mut stream = match MmapStream::with_buffers(&mut device, Type::VideoCapture, BUFFER_COUNT) {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready.send(Err(DeviceError::from_io(&config.device, &err)));
            return;
        }
    };

    info!(
        "V4l2Source: connected to {} ({}x{} {:?})",
        config.device, negotiated.width, negotiated.height, negotiated.format
    );
    let _ = ready.send(Ok(()));

    let mut sequence = 0u64;
    while !publisher.is_stopped() {
        match stream.next() {
            Ok((buf, _meta)) => {
                sequence += 1;
                publisher.publish(RawFrame::new(
                    buf.to_vec(),
                    negotiated.width,
                    negotiated.height,
                    negotiated.format,
                    sequence,
                ));
            }
            Err(err) => {
                warn!("V4l2Source: capture error on {}: {}", config.device, err);
                publisher.fail(DeviceError::from_io(&config.device, &err));
                break;
            }
        }
    }

    drop(stream);
    info!("V4l2Source: {} stopped after {} frames", config.device, sequence);
}
