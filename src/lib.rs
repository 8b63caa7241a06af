//! # Muxlink
//!
//! A framed, multiplexed session protocol engine for point-to-point
//! client/server links over a reliable byte stream.
//!
//! Three interaction patterns share one transport: one-shot packets,
//! synchronized named states (Enquiry/Response to read, Tell/Confirm to
//! write, Show to solicit a write), and begin/end sessions. Logical
//! services occupy disjoint 128-wide ranges of packet types; a
//! [`Protocol`] demultiplexes frames into per-range [`Handler`]s, each
//! drained by a single consumer task over a bounded queue.

pub mod codec;
pub mod config;
pub mod error;
pub mod exchange;
pub mod handler;
pub mod packet;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod waypoint;

pub use config::{HandlerConfig, ProtocolConfig};
pub use error::{CodecError, ProtocolError};
pub use exchange::{StateMode, StateSpec};
pub use handler::{Handler, Role, Service, SessionScope};
pub use packet::{ConfirmCode, ErrorCode, PacketLevel, SessionOutcome};
pub use protocol::Protocol;
pub use transport::{StreamTransport, TcpTransport, Transport};

/// The current crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values.
pub mod defaults {
    /// Default depth of a handler's bounded inbound queue.
    pub const QUEUE_CAPACITY: usize = 64;

    /// Default cap on concurrently open sessions per handler.
    pub const MAX_SESSIONS: usize = 8;

    /// Default depth of the outbound frame channel.
    pub const OUTBOX_CAPACITY: usize = 64;

    /// Default hard cap on a single frame.
    pub const MAX_FRAME_LEN: usize = crate::codec::MAX_FRAME_LEN;
}
