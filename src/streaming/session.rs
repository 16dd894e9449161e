/*!
 * Stream Session
 *
 * Coordinates one live stream: acquires the camera, opens the detector
 * channel and runs the paced send loop on a single task. Inbound detections
 * are rendered on the same task, so rendering never races the flight flag.
 *
 * Every way a session can end (operator stop, drop, peer close, channel error,
 * camera loss) goes through one teardown that releases the camera and then closes the
 * channel. Both handles are taken out of the session before they are released,
 * so overlapping triggers release each resource once.
 */

use std::fmt;
use std::future::pending;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use super::flow::{FlowController, DEFAULT_POLL_INTERVAL};
use crate::capture::{CaptureConfig, CaptureHandle, CaptureSource};
use crate::detection::DetectionResult;
use crate::error::{ChannelError, DeviceError, SessionError};
use crate::render::{AnnotationRenderer, LatestFrameSink, OverlaySink};
use crate::stats::{StatsAggregator, StatsSnapshot};
use crate::transport::{Channel, ChannelEvent, ChannelState, Transport};
use crate::video::{
    rasterize, EncodeFuture, EncodedFrame, EncoderConfig, FrameEncoder, JpegFrameEncoder, Quality,
};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
    Errored,
}

impl SessionState {
    /// Starting or Active
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Active)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
            SessionState::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Detector channel address (ws:// or wss://)
    pub stream_url: String,
    /// Camera request
    pub capture: CaptureConfig,
    /// Send loop cadence
    pub poll_interval: Duration,
    /// JPEG quality for outbound frames
    pub quality: Quality,
    /// How long to wait for the first frame after acquiring the camera
    pub metadata_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stream_url: "ws://localhost:8001/ws/stream".to_string(),
            capture: CaptureConfig::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            quality: Quality::Medium,
            metadata_timeout: Duration::from_secs(5),
        }
    }
}

/// Builds the frame encoder once the session raster size is known.
pub type EncoderFactory = Arc<dyn Fn(EncoderConfig) -> Arc<dyn FrameEncoder> + Send + Sync>;

#[derive(Default)]
struct Resources {
    capture: Option<Arc<CaptureHandle>>,
    channel: Option<Arc<Channel>>,
    cancel: Option<CancellationToken>,
}

/// State shared between the session owner and its pipeline task.
struct Shared {
    state: watch::Sender<SessionState>,
    stats: Arc<watch::Sender<StatsSnapshot>>,
    last_error: Mutex<Option<String>>,
    resources: Mutex<Resources>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (stats, _) = watch::channel(StatsSnapshot::default());
        Self {
            state,
            stats: Arc::new(stats),
            last_error: Mutex::new(None),
            resources: Mutex::new(Resources::default()),
        }
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!("Session state {} -> {}", prev, next);
        }
    }

    /// Release everything the session owns. Returns false when there was
    /// nothing left to release.
    fn teardown(&self) -> bool {
        let Resources {
            capture,
            channel,
            cancel,
        } = std::mem::take(&mut *lock(&self.resources));

        if capture.is_none() && channel.is_none() && cancel.is_none() {
            return false;
        }

        self.set_state(SessionState::Stopping);
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(capture) = capture {
            capture.release();
        }
        if let Some(channel) = channel {
            channel.close();
        }
        true
    }

    /// Operator stop or unmount.
    fn stop(&self) {
        let released = self.teardown();
        if released || self.state() == SessionState::Errored {
            self.set_state(SessionState::Idle);
            info!("Stream session stopped");
        }
    }

    /// Fatal error. Ignored once the session has already ended.
    fn fail(&self, err: SessionError) -> SessionError {
        let released = self.teardown();
        if !released && self.state() != SessionState::Starting {
            debug!("Ignoring error after session ended: {}", err);
            return err;
        }

        error!("Stream session failed: {}", err);
        *lock(&self.last_error) = Some(err.to_string());
        self.set_state(SessionState::Errored);
        err
    }
}

/// One live stream from a camera to the detector.
pub struct StreamSession {
    config: SessionConfig,
    source: Arc<dyn CaptureSource>,
    transport: Arc<dyn Transport>,
    encoder_factory: EncoderFactory,
    renderer: Arc<AnnotationRenderer>,
    sink: Arc<dyn OverlaySink>,
    shared: Arc<Shared>,
    session_id: Option<Uuid>,
    task: Option<JoinHandle<()>>,
}

impl StreamSession {
    /// Create an idle session. Annotated frames go to a [`LatestFrameSink`]
    /// until another sink is configured.
    pub fn new(
        config: SessionConfig,
        source: Arc<dyn CaptureSource>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            source,
            transport,
            encoder_factory: Arc::new(|config: EncoderConfig| -> Arc<dyn FrameEncoder> {
                Arc::new(JpegFrameEncoder::new(config))
            }),
            renderer: Arc::new(AnnotationRenderer::default()),
            sink: Arc::new(LatestFrameSink::new()),
            shared: Arc::new(Shared::new()),
            session_id: None,
            task: None,
        }
    }

    pub fn with_encoder(mut self, factory: EncoderFactory) -> Self {
        self.encoder_factory = factory;
        self
    }

    pub fn with_renderer(mut self, renderer: AnnotationRenderer) -> Self {
        self.renderer = Arc::new(renderer);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn OverlaySink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        *self.shared.stats.borrow()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<StatsSnapshot> {
        self.shared.stats.subscribe()
    }

    /// Message of the last fatal error, cleared on the next start.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    /// Id of the current or most recent run
    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    /// Start streaming.
    ///
    /// Returns once the camera is live and the channel is connecting; the
    /// session becomes Active when the channel opens. Use
    /// [`StreamSession::wait_settled`] to wait for that.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        let current = self.state();
        if current.is_running() || current == SessionState::Stopping {
            warn!("Stream session already running ({})", current);
            return Err(SessionError::AlreadyActive);
        }

        // Errored sessions hold no resources; this only resets the state
        self.shared.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }

        let session_id = Uuid::new_v4();
        self.session_id = Some(session_id);
        let span = info_span!("stream", session = %session_id);

        *lock(&self.shared.last_error) = None;
        self.shared.set_state(SessionState::Starting);
        span.in_scope(|| {
            info!(
                "Starting stream: {} -> {}",
                self.config.capture.device, self.config.stream_url
            )
        });

        let capture = self.acquire().instrument(span.clone()).await?;
        lock(&self.shared.resources).capture = Some(capture.clone());

        let (width, height) = match capture
            .wait_metadata(self.config.metadata_timeout)
            .instrument(span.clone())
            .await
        {
            Ok(dims) => dims,
            Err(e) => return Err(self.shared.fail(e.into())),
        };

        let encoder_config = EncoderConfig::for_source(width, height, self.config.quality);
        let encoder = (self.encoder_factory)(encoder_config.clone());

        let mut channel = self.transport.open(&self.config.stream_url);
        let Some(events) = channel.take_events() else {
            let err = ChannelError::Protocol("channel event stream already taken".into());
            return Err(self.shared.fail(err.into()));
        };
        let channel = Arc::new(channel);
        let cancel = CancellationToken::new();

        {
            let mut resources = lock(&self.shared.resources);
            resources.channel = Some(channel.clone());
            resources.cancel = Some(cancel.clone());
        }

        let pipeline = Pipeline {
            shared: self.shared.clone(),
            capture,
            channel,
            events,
            encoder,
            renderer: self.renderer.clone(),
            sink: self.sink.clone(),
            flow: FlowController::new(self.config.poll_interval),
            cancel,
            width: encoder_config.width,
            height: encoder_config.height,
        };
        self.task = Some(tokio::spawn(pipeline.run().instrument(span)));

        Ok(())
    }

    async fn acquire(&self) -> Result<Arc<CaptureHandle>, SessionError> {
        let source = self.source.clone();
        let capture_config = self.config.capture.clone();

        let acquired = tokio::task::spawn_blocking(move || source.acquire(&capture_config))
            .await
            .map_err(|e| DeviceError::Backend(format!("capture task failed: {}", e)))
            .and_then(|result| result);

        match acquired {
            Ok(handle) => Ok(Arc::new(handle)),
            Err(e) => Err(self.shared.fail(e.into())),
        }
    }

    /// Wait until the session is Active, Idle or Errored.
    pub async fn wait_settled(&self) -> SessionState {
        let mut rx = self.shared.state.subscribe();
        let settled = rx
            .wait_for(|state| !matches!(state, SessionState::Starting | SessionState::Stopping))
            .await
            .map(|state| *state);
        settled.unwrap_or(SessionState::Idle)
    }

    /// Stop streaming and wait for the send loop to exit. Safe to call in any
    /// state; stopping an idle session does nothing.
    pub async fn stop(&mut self) {
        self.shared.stop();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Stream task join error: {}", e);
            }
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("state", &self.state())
            .field("session_id", &self.session_id)
            .field("stream_url", &self.config.stream_url)
            .finish()
    }
}

/// The session's single task: send loop plus inbound handling.
struct Pipeline {
    shared: Arc<Shared>,
    capture: Arc<CaptureHandle>,
    channel: Arc<Channel>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    encoder: Arc<dyn FrameEncoder>,
    renderer: Arc<AnnotationRenderer>,
    sink: Arc<dyn OverlaySink>,
    flow: FlowController,
    cancel: CancellationToken,
    width: u32,
    height: u32,
}

async fn poll_in_flight(slot: &mut Option<EncodeFuture>) -> Result<Option<EncodedFrame>> {
    match slot {
        Some(encode) => encode.await,
        None => pending().await,
    }
}

impl Pipeline {
    async fn run(mut self) {
        if !self.await_open().await {
            return;
        }

        self.shared.set_state(SessionState::Active);
        info!("Stream active at {}x{}", self.width, self.height);

        let mut stats =
            StatsAggregator::attached(tokio::time::Instant::now().into_std(), self.shared.stats.clone());
        let mut ticker = self.flow.ticker();
        let mut in_flight: Option<EncodeFuture> = None;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                event = self.events.recv() => {
                    if !self.handle_event(event, &mut stats) {
                        break;
                    }
                }

                err = self.capture.lost() => {
                    self.shared.fail(err.into());
                    break;
                }

                encoded = poll_in_flight(&mut in_flight) => {
                    in_flight = None;
                    if self.flow.on_encoded(encoded, &self.channel).is_ok() {
                        stats.record_send(tokio::time::Instant::now().into_std());
                    }
                }

                _ = ticker.tick() => {
                    if !self.channel.is_open() {
                        self.channel_gone();
                        break;
                    }
                    match self.flow.on_tick(self.capture.latest(), &self.encoder) {
                        Ok(encode) => in_flight = Some(encode),
                        Err(reason) => trace!("Tick skipped: {:?}", reason),
                    }
                }
            }
        }

        if in_flight.take().is_some() {
            self.flow.abandon();
            debug!("Discarded in-flight frame");
        }
        info!("Send loop finished: {:?}", self.flow.counters());
    }

    /// Wait in Starting for the channel to open. False when the session ended first.
    async fn await_open(&mut self) -> bool {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return false,

                event = self.events.recv() => match event {
                    Some(ChannelEvent::Open) => return true,
                    Some(ChannelEvent::Message(_)) => {
                        debug!("Ignoring detector message before open");
                    }
                    Some(ChannelEvent::Error(err)) => {
                        self.shared.fail(err.into());
                        return false;
                    }
                    Some(ChannelEvent::Closed) | None => {
                        let err = ChannelError::Abrupt("closed before the stream opened".into());
                        self.shared.fail(err.into());
                        return false;
                    }
                },

                err = self.capture.lost() => {
                    self.shared.fail(err.into());
                    return false;
                }
            }
        }
    }

    /// Returns false when the event ends the session.
    fn handle_event(&self, event: Option<ChannelEvent>, stats: &mut StatsAggregator) -> bool {
        match event {
            Some(ChannelEvent::Message(result)) => {
                self.present(&result);
                stats.record_result(result.total_ships);
                true
            }
            Some(ChannelEvent::Open) => true,
            Some(ChannelEvent::Error(err)) => {
                self.shared.fail(err.into());
                false
            }
            Some(ChannelEvent::Closed) => {
                info!("Detector closed the stream");
                self.shared.stop();
                false
            }
            None => {
                let err = ChannelError::Abrupt("channel event stream ended".into());
                self.shared.fail(err.into());
                false
            }
        }
    }

    fn channel_gone(&self) {
        match self.channel.state() {
            ChannelState::Errored(err) => {
                self.shared.fail(err.into());
            }
            state => {
                debug!("Channel no longer open ({:?})", state);
                self.shared.stop();
            }
        }
    }

    /// Paint the latest raster with `result` on the output surface.
    fn present(&self, result: &DetectionResult) {
        let Some(frame) = self.capture.latest() else {
            debug!("No raster yet, dropping detection overlay");
            return;
        };
        let Some(raster) = rasterize(&frame, self.width, self.height) else {
            return;
        };

        let annotated = self.renderer.render(&raster, result);
        if let Err(e) = self.sink.present(&annotated) {
            warn!("Failed to present annotated frame: {:#}", e);
        }
    }
}
