//! shardlet: control-plane IPC substrate for multi-process worker clusters.
//!
//! A coordinating process and its workers share one duplex message channel.
//! Three primitives sit underneath the coordinator/worker object model:
//!
//! - [`Correlator`] turns fire-and-forget channel messages into awaitable
//!   request/response pairs with timeout-based cancellation
//! - [`PacingQueue`] serializes and rate-limits a sequence of async
//!   operations, used to stagger worker startup
//! - [`Broker`] multiplexes independent named publish/subscribe channels
//!   over the single shared transport
//!
//! The [`bridge`] module carries the tag catalog and wire envelopes; the
//! [`transport`] module is the boundary to whatever raw duplex channel the
//! host pair already holds.

pub mod bridge;
pub mod broker;
pub mod correlation;
pub mod pacing;
pub mod transport;

pub use bridge::protocol::{
    BrokerEnvelope, CorrelationToken, ErrorPayload, MessageTag, TaggedMessage, UnknownTag,
};
pub use broker::Broker;
pub use correlation::{CorrelationError, Correlator, PendingResponse};
pub use pacing::{ItemHandle, PacingQueue, QueueMode, QueueOptions};
pub use transport::{FramedTransport, PairTransport, RawTransport, TransportError, spawn_reader};
