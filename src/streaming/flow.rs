/*!
 * Flow Controller
 *
 * Paces capture -> encode -> send so that at most one frame is in flight.
 * The flight flag is set when an encode starts and cleared once the encode
 * and the send call have returned; ticks that find it set are skipped rather
 * than queued.
 */

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::error::SkipReason;
use crate::transport::{Channel, SendOutcome};
use crate::video::{EncodeFuture, EncodedFrame, FrameEncoder, RawFrame};

/// Default poll cadence
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-session attempt counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowCounters {
    /// Ticks that started an encode
    pub attempts: u64,
    /// Frames handed to the channel
    pub sent: u64,
    /// Ticks skipped because a frame was still in flight
    pub skipped_in_flight: u64,
    /// Attempts that produced no payload
    pub skipped_encode: u64,
    /// Attempts dropped because the channel could not take them
    pub skipped_send: u64,
}

/// Single-flight pacing for the send loop.
#[derive(Debug)]
pub struct FlowController {
    in_flight: bool,
    poll_interval: Duration,
    counters: FlowCounters,
}

impl FlowController {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            in_flight: false,
            poll_interval,
            counters: FlowCounters::default(),
        }
    }

    /// Ticker at the poll cadence. A late tick delays the following ones
    /// instead of bursting to catch up.
    pub fn ticker(&self) -> Interval {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn counters(&self) -> FlowCounters {
        self.counters
    }

    /// Handle a poll tick: start encoding the current raster unless a frame is
    /// already in flight or nothing has been painted yet.
    pub fn on_tick(
        &mut self,
        frame: Option<Arc<RawFrame>>,
        encoder: &Arc<dyn FrameEncoder>,
    ) -> Result<EncodeFuture, SkipReason> {
        if self.in_flight {
            self.counters.skipped_in_flight += 1;
            trace!("Frame still in flight, skipping tick");
            return Err(SkipReason::InFlight);
        }

        let Some(frame) = frame else {
            self.counters.skipped_encode += 1;
            return Err(SkipReason::EncodeSkip);
        };

        self.in_flight = true;
        self.counters.attempts += 1;
        Ok(encoder.encode(frame))
    }

    /// Handle a finished encode: send the payload if the channel is open.
    /// Clears the flight flag in every case.
    pub fn on_encoded(
        &mut self,
        encoded: Result<Option<EncodedFrame>>,
        channel: &Channel,
    ) -> Result<EncodedFrame, SkipReason> {
        self.in_flight = false;

        let frame = match encoded {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                self.counters.skipped_encode += 1;
                return Err(SkipReason::EncodeSkip);
            }
            Err(e) => {
                warn!("Frame encode failed: {:#}", e);
                self.counters.skipped_encode += 1;
                return Err(SkipReason::EncodeSkip);
            }
        };

        match channel.send(frame.data.clone()) {
            SendOutcome::Sent => {
                self.counters.sent += 1;
                debug!("Sent frame {} ({} bytes)", frame.sequence, frame.data.len());
                Ok(frame)
            }
            outcome => {
                self.counters.skipped_send += 1;
                trace!("Frame {} not sent: {:?}", frame.sequence, outcome);
                Err(SkipReason::SendSkip)
            }
        }
    }

    /// Forget an in-flight attempt whose result will never be observed.
    pub fn abandon(&mut self) {
        self.in_flight = false;
    }
}

impl Default for FlowController {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}
