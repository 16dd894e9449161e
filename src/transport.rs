//! Persistent duplex channel to the detector service.
//!
//! [`Transport::open`] returns immediately with a [`Channel`] in
//! `Connecting`; a backend task drives the connection through the matching
//! [`ChannelDriver`]. Outbound sends are fire-and-forget: a payload that the
//! channel cannot take right now is dropped, never queued behind others.
//! Inbound results are delivered in arrival order on a single event stream.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::detection::DetectionResult;
use crate::error::ChannelError;

pub mod ws;

pub use ws::WsTransport;

/// Connection lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
    Errored(ChannelError),
}

impl ChannelState {
    /// Closed or Errored; no further transitions happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Errored(_))
    }
}

/// Event delivered to the channel's single handler
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Open,
    Message(DetectionResult),
    Closed,
    Error(ChannelError),
}

/// Result of a fire-and-forget send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the connection
    Sent,
    /// Channel not open (or already closed); payload dropped
    NotOpen,
    /// Connection still busy with the previous payload; payload dropped
    Busy,
}

/// Opens channels to an address.
pub trait Transport: Send + Sync {
    fn open(&self, address: &str) -> Channel;
}

/// Client side of a channel, owned by one session.
#[derive(Debug)]
pub struct Channel {
    address: String,
    state: watch::Receiver<ChannelState>,
    link: ChannelLink,
    outbound: mpsc::Sender<Bytes>,
    events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    accepted: AtomicU64,
}

/// Backend side of a channel.
#[derive(Debug)]
pub struct ChannelDriver {
    /// State and event publisher
    pub link: ChannelLink,
    /// Payloads accepted by [`Channel::send`]
    pub outbound: mpsc::Receiver<Bytes>,
    /// Cancelled when the client closes the channel
    pub shutdown: CancellationToken,
}

/// Publishes state transitions and inbound events to the client.
#[derive(Debug, Clone)]
pub struct ChannelLink {
    state: Arc<watch::Sender<ChannelState>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Channel {
    /// Create a connected client/driver pair in `Connecting`.
    pub fn pair(address: impl Into<String>) -> (Channel, ChannelDriver) {
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();

        let link = ChannelLink {
            state: Arc::new(state_tx),
            events: event_tx,
        };

        let channel = Channel {
            address: address.into(),
            state: state_rx,
            link: link.clone(),
            outbound: out_tx,
            events: Some(event_rx),
            shutdown: shutdown.clone(),
            closed: AtomicBool::new(false),
            accepted: AtomicU64::new(0),
        };
        let driver = ChannelDriver {
            link,
            outbound: out_rx,
            shutdown,
        };
        (channel, driver)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ChannelState {
        self.state.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && *self.state.borrow() == ChannelState::Open
    }

    /// Take the inbound event stream. Only the first caller gets it.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.take()
    }

    /// Fire-and-forget send. Never writes once the channel is closed.
    pub fn send(&self, payload: Bytes) -> SendOutcome {
        if !self.is_open() {
            trace!("Channel {} not open, dropping payload", self.address);
            return SendOutcome::NotOpen;
        }

        match self.outbound.try_send(payload) {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Channel {} busy, dropping payload", self.address);
                SendOutcome::Busy
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::NotOpen,
        }
    }

    /// Payloads accepted since the channel opened
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Close the channel. Idempotent; terminates the backend task.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.link.set_state(ChannelState::Closed);
        info!("Channel {} closed", self.address);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

impl ChannelLink {
    /// Replace the state unless it is already terminal. Returns whether it changed.
    fn set_state(&self, next: ChannelState) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    pub fn state(&self) -> ChannelState {
        self.state.borrow().clone()
    }

    /// Connection established.
    pub fn mark_open(&self) {
        if self.set_state(ChannelState::Open) {
            let _ = self.events.send(ChannelEvent::Open);
        }
    }

    /// Deliver an inbound detection result.
    pub fn deliver(&self, result: DetectionResult) {
        if self.state.borrow().is_terminal() {
            return;
        }
        let _ = self.events.send(ChannelEvent::Message(result));
    }

    /// Peer closed the connection cleanly.
    pub fn finish(&self) {
        if self.set_state(ChannelState::Closed) {
            let _ = self.events.send(ChannelEvent::Closed);
        }
    }

    /// Connection failed or was lost.
    pub fn fail(&self, err: ChannelError) {
        if self.set_state(ChannelState::Errored(err.clone())) {
            let _ = self.events.send(ChannelEvent::Error(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_before_open_is_dropped() {
        let (channel, mut driver) = Channel::pair("ws://test");
        assert_eq!(channel.state(), ChannelState::Connecting);
        assert_eq!(channel.send(Bytes::from_static(b"x")), SendOutcome::NotOpen);
        assert!(driver.outbound.try_recv().is_err());
    }

    #[test]
    fn test_send_is_not_queued() {
        let (channel, mut driver) = Channel::pair("ws://test");
        driver.link.mark_open();

        assert_eq!(channel.send(Bytes::from_static(b"a")), SendOutcome::Sent);
        assert_eq!(channel.send(Bytes::from_static(b"b")), SendOutcome::Busy);
        assert_eq!(driver.outbound.try_recv().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(channel.send(Bytes::from_static(b"c")), SendOutcome::Sent);
        assert_eq!(channel.accepted(), 2);
    }

    #[test]
    fn test_close_is_idempotent_and_blocks_sends() {
        let (mut channel, driver) = Channel::pair("ws://test");
        let mut events = channel.take_events().unwrap();
        driver.link.mark_open();
        assert_eq!(events.try_recv().unwrap(), ChannelEvent::Open);

        channel.close();
        channel.close();

        assert!(driver.shutdown.is_cancelled());
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(channel.send(Bytes::from_static(b"x")), SendOutcome::NotOpen);

        // A late error from the backend does not resurrect the channel
        driver.link.fail(ChannelError::Abrupt("reset".into()));
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_error_event_is_delivered_once() {
        let (mut channel, driver) = Channel::pair("ws://test");
        let mut events = channel.take_events().unwrap();
        assert!(channel.take_events().is_none());

        driver.link.fail(ChannelError::Refused("nope".into()));
        driver.link.fail(ChannelError::Refused("again".into()));

        assert_eq!(
            events.try_recv().unwrap(),
            ChannelEvent::Error(ChannelError::Refused("nope".into()))
        );
        assert!(events.try_recv().is_err());
        assert!(channel.state().is_terminal());
    }

    #[test]
    fn test_messages_after_close_are_discarded() {
        let (mut channel, driver) = Channel::pair("ws://test");
        let mut events = channel.take_events().unwrap();
        driver.link.mark_open();
        driver.link.finish();
        driver.link.deliver(DetectionResult::default());

        assert_eq!(events.try_recv().unwrap(), ChannelEvent::Open);
        assert_eq!(events.try_recv().unwrap(), ChannelEvent::Closed);
        assert!(events.try_recv().is_err());
    }
}
