//! WebSocket backend for the detector channel.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{Channel, ChannelDriver, ChannelLink, Transport};
use crate::detection::DetectionResult;
use crate::error::ChannelError;

/// Opens `ws://` / `wss://` channels
#[derive(Debug, Clone)]
pub struct WsTransport {
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Transport for WsTransport {
    fn open(&self, address: &str) -> Channel {
        let (channel, driver) = Channel::pair(address);

        if !(address.starts_with("ws://") || address.starts_with("wss://")) {
            driver
                .link
                .fail(ChannelError::InvalidAddress(address.to_string()));
            return channel;
        }

        tokio::spawn(run_socket(address.to_string(), driver, self.connect_timeout));
        channel
    }
}

fn decode_inbound(link: &ChannelLink, data: &[u8]) {
    match DetectionResult::from_json(data) {
        Ok(result) => {
            debug!(
                "Detector result: {} ship(s), total {}",
                result.ships.len(),
                result.total_ships
            );
            link.deliver(result);
        }
        Err(e) => warn!("Ignoring undecodable detector message: {}", e),
    }
}

async fn run_socket(address: String, driver: ChannelDriver, connect_timeout: Duration) {
    let ChannelDriver {
        link,
        mut outbound,
        shutdown,
    } = driver;

    info!("Connecting to detector at {}", address);

    let connected = tokio::select! {
        _ = shutdown.cancelled() => {
            debug!("Channel {} closed while connecting", address);
            return;
        }
        result = tokio::time::timeout(connect_timeout, connect_async(address.as_str())) => result,
    };

    let socket = match connected {
        Ok(Ok((socket, _response))) => socket,
        Ok(Err(e)) => {
            link.fail(ChannelError::Refused(format!("{}: {}", address, e)));
            return;
        }
        Err(_) => {
            link.fail(ChannelError::Refused(format!(
                "{}: no answer within {:?}",
                address, connect_timeout
            )));
            return;
        }
    };

    info!("✅ Channel {} open", address);
    link.mark_open();

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
                break;
            }
            Some(payload) = outbound.recv() => {
                if let Err(e) = sink.send(Message::Binary(payload.to_vec())).await {
                    link.fail(ChannelError::Abrupt(e.to_string()));
                    break;
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => decode_inbound(&link, text.as_bytes()),
                Some(Ok(Message::Binary(data))) => decode_inbound(&link, &data),
                Some(Ok(Message::Close(frame))) => {
                    info!("Detector closed channel {}: {:?}", address, frame);
                    link.finish();
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    link.fail(ChannelError::Abrupt(e.to_string()));
                    break;
                }
                None => {
                    link.fail(ChannelError::Abrupt("connection ended without close".into()));
                    break;
                }
            },
        }
    }

    debug!("Channel {} task finished", address);
}
