//! Shared harness: an in-memory detector peer, a camera that is ready
//! immediately, and encoders with controllable timing.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ship_stream::capture::synthetic::pattern_frame;
use ship_stream::capture::{CaptureConfig, CaptureHandle, CaptureSource, FramePublisher};
use ship_stream::streaming::EncoderFactory;
use ship_stream::transport::ChannelLink;
use ship_stream::video::{EncodeFuture, EncodedFrame, EncoderConfig, FrameEncoder, RawFrame};
use ship_stream::{Channel, DeviceError, SessionConfig, Transport};

pub const STREAM_URL: &str = "ws://detector.test/ws/stream";

pub fn session_config() -> SessionConfig {
    SessionConfig {
        stream_url: STREAM_URL.to_string(),
        capture: CaptureConfig {
            device: "test://camera".into(),
            width: 640,
            height: 480,
            frame_rate: 30,
        },
        ..SessionConfig::default()
    }
}

/// Camera whose surface is painted before `acquire` returns.
#[derive(Default)]
pub struct StillCamera {
    releases: Arc<AtomicUsize>,
    publishers: Mutex<Vec<FramePublisher>>,
}

impl StillCamera {
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn acquisitions(&self) -> usize {
        self.publishers.lock().unwrap().len()
    }
}

impl CaptureSource for StillCamera {
    fn acquire(&self, config: &CaptureConfig) -> Result<CaptureHandle, DeviceError> {
        let (handle, publisher) = CaptureHandle::new(config.device.clone());
        publisher.publish(pattern_frame(config.width, config.height, 1));
        self.publishers.lock().unwrap().push(publisher);

        let releases = self.releases.clone();
        Ok(handle.with_release_hook(move || {
            releases.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

/// The detector side of one channel.
pub struct Peer {
    pub link: ChannelLink,
    pub shutdown: CancellationToken,
    received: Arc<AtomicUsize>,
    _drain: JoinHandle<()>,
}

impl Peer {
    /// Payloads the session has handed over so far
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

/// Transport whose channels are answered by in-memory peers.
#[derive(Default)]
pub struct LoopbackTransport {
    peers: Mutex<Vec<Peer>>,
    opened: AtomicUsize,
}

impl LoopbackTransport {
    pub fn take_peer(&self) -> Peer {
        self.peers.lock().unwrap().pop().expect("no channel was opened")
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl Transport for LoopbackTransport {
    fn open(&self, address: &str) -> Channel {
        let (channel, driver) = Channel::pair(address);
        let received = Arc::new(AtomicUsize::new(0));

        let counter = received.clone();
        let mut outbound = driver.outbound;
        let drain = tokio::spawn(async move {
            while outbound.recv().await.is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        self.opened.fetch_add(1, Ordering::SeqCst);
        self.peers.lock().unwrap().push(Peer {
            link: driver.link,
            shutdown: driver.shutdown,
            received,
            _drain: drain,
        });
        channel
    }
}

/// Encoder that takes `delay` of (tokio) time per frame and records how many
/// encodes overlap.
#[derive(Clone)]
pub struct TimedEncoder {
    delay: Duration,
    calls: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl TimedEncoder {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn factory(&self) -> EncoderFactory {
        let template = self.clone();
        Arc::new(move |config: EncoderConfig| -> Arc<dyn FrameEncoder> {
            Arc::new(ConfiguredTimedEncoder {
                inner: template.clone(),
                config,
            })
        })
    }
}

struct ConfiguredTimedEncoder {
    inner: TimedEncoder,
    config: EncoderConfig,
}

impl FrameEncoder for ConfiguredTimedEncoder {
    fn encode(&self, frame: Arc<RawFrame>) -> EncodeFuture {
        let inner = self.inner.clone();
        let (width, height) = (self.config.width, self.config.height);

        Box::pin(async move {
            inner.calls.fetch_add(1, Ordering::SeqCst);
            let now_active = inner.active.fetch_add(1, Ordering::SeqCst) + 1;
            inner.max_active.fetch_max(now_active, Ordering::SeqCst);

            if !inner.delay.is_zero() {
                tokio::time::sleep(inner.delay).await;
            }

            inner.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Some(EncodedFrame {
                data: Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]),
                sequence: frame.sequence,
                timestamp_ms: frame.timestamp_ms,
                width,
                height,
            }))
        })
    }

    fn config(&self) -> &EncoderConfig {
        &self.config
    }
}
