/*!
 * Streaming Module
 *
 * Live stream to the detector: session lifecycle plus the single-flight
 * send loop.
 */

pub mod flow;
pub mod session;

pub use flow::{FlowController, FlowCounters, DEFAULT_POLL_INTERVAL};
pub use session::{EncoderFactory, SessionConfig, SessionState, StreamSession};
