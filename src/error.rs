//! # Error Taxonomy
//!
//! Failures are split into two layers mirroring the processing pipeline:
//!
//! - [`CodecError`]: anything that goes wrong while turning bytes into typed
//!   packets or back. These are per-frame conditions and are reported to the
//!   peer as a `MALFORMED` error packet.
//! - [`ProtocolError`]: everything above the codec — routing, state-machine
//!   legality, session bookkeeping, and transport attachment. Some of these
//!   are per-packet (answered on the wire), some unwind a single session,
//!   and a few are fatal to the connection and surface to the host instead
//!   of producing a reply.

use thiserror::Error;

/// Failures while encoding or decoding frames and packet bodies.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The buffer ended before the announced content did.
    #[error("frame truncated: needed {needed} more bytes, had {have}")]
    Truncated { needed: usize, have: usize },

    /// A field carried a type tag the codec does not know.
    #[error("unsupported field type code {0:#04x}")]
    UnknownTypeCode(u8),

    /// Body field count disagrees with the packet schema.
    #[error("field count mismatch: schema expects {expected}, body carries {got}")]
    FieldCount { expected: usize, got: usize },

    /// A field arrived with a tag different from its schema type.
    #[error("field `{field}` type mismatch: expected tag {expected:#04x}, got {got:#04x}")]
    FieldType {
        field: &'static str,
        expected: u8,
        got: u8,
    },

    /// An integer field violated its `[lo, hi]` constraint.
    #[error("field `{field}` out of range: {value} not in [{lo}, {hi}]")]
    Range {
        field: &'static str,
        value: u64,
        lo: u64,
        hi: u64,
    },

    /// A byte field violated its exact-size or length-bounds constraint.
    #[error("field `{field}` length {len} outside [{lo}, {hi}]")]
    Length {
        field: &'static str,
        len: usize,
        lo: usize,
        hi: usize,
    },

    /// A timestamp that cannot be represented as whole UNIX seconds.
    #[error("field `{field}` carries an unrepresentable instant")]
    Instant { field: &'static str },

    /// The 6-byte frame header is internally inconsistent.
    #[error("malformed frame header: {0}")]
    Header(&'static str),

    /// Bytes were left over after the last schema field was read.
    #[error("{0} trailing bytes after final field")]
    Trailing(usize),
}

/// Failures above the codec: routing, dispatch, state machines, sessions,
/// and transport attachment.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A send was attempted with no transport attached.
    #[error("no transport attached")]
    NoTransport,

    /// A second transport attach on the same protocol instance.
    #[error("transport already attached")]
    AlreadyConnected,

    /// Handler registration collided with an existing range claim.
    #[error("packet range {0} already claimed by another handler")]
    RangeClaimed(u16),

    /// Handler registration named a range outside the service space.
    #[error("packet range {0} outside the assignable service space")]
    RangeOutOfBounds(u16),

    /// An Unknown/Error code aimed at a range with no registered handler.
    /// Fatal: raised to the host, never answered on the wire.
    #[error("unknown/error reply aimed at unregistered range (type {0}): treated as attack")]
    AttemptedAttack(u16),

    /// A state machine was asked to move along an edge its adjacency map
    /// does not contain. The machine is left unchanged.
    #[error("illegal transition `{from}` -> `{to}`")]
    IllegalTransition {
        from: &'static str,
        to: &'static str,
    },

    /// One or more states answered something other than YES during the
    /// synchronization pass of a scoped session.
    #[error("session failed to synchronize its states")]
    SessionNoSync,

    /// A lifecycle packet named a session type that disagrees with the type
    /// recorded when the session started. Unwinds the session.
    #[error("session {id}: type {got} does not match recorded type {expected}")]
    SessionTypeInconsistency { id: u64, expected: u64, got: u64 },

    /// A lifecycle packet referenced a session this handler does not hold.
    #[error("unknown session {0}")]
    UnknownSession(u64),

    /// `open_session` was asked for a session type the service never declared.
    #[error("unknown session type {0}")]
    UnknownSessionType(u64),

    /// An operation referenced a state id that is not hosted in its scope.
    #[error("unknown state {0}")]
    UnknownState(u64),

    /// The peer answered Start with Refuse, Busy or Done.
    #[error("session rejected by peer: {0:?}")]
    SessionRejected(crate::packet::SessionOutcome),

    /// An operation that only one side of the link may perform was invoked
    /// on the other side.
    #[error("operation not available on this side of the link")]
    WrongSide,

    /// The link closed while an operation was awaiting its reply.
    #[error("operation aborted: link closed")]
    Aborted,

    /// Body decoding failed; answered on the wire as `MALFORMED`.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Transport-level I/O failure.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}
