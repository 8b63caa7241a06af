//! # Packet Schemas
//!
//! Every packet type declares its shape once — an ordered list of named,
//! typed, constrained fields — and the codec validates both encode and
//! decode against it. The declarations below generate a typed struct per
//! packet together with its static [`PacketSchema`], so field access is
//! plain struct-field access and never an index into a tuple.
//!
//! Within every 128-wide range the top thirteen local codes are reserved
//! for the engine itself; the rest of the range belongs to the service
//! that claims it.

use crate::codec::{FieldKind, FieldSpec, PacketSchema, Value};
use crate::error::CodecError;
use serde::{Deserialize, Serialize};

/// Reserved local codes, identical in every range.
pub const ENQUIRY_PACKET: u8 = 115;
pub const RESPONSE_PACKET: u8 = 116;
pub const TELL_PACKET: u8 = 117;
pub const SHOW_PACKET: u8 = 118;
pub const CONFIRM_PACKET: u8 = 119;
pub const START_PACKET: u8 = 120;
pub const FINISH_PACKET: u8 = 121;
pub const ACCEPT_PACKET: u8 = 122;
pub const REFUSE_PACKET: u8 = 123;
pub const BUSY_PACKET: u8 = 124;
pub const DONE_PACKET: u8 = 125;
pub const UNKNOWN_PACKET: u8 = 126;
pub const ERROR_PACKET: u8 = 127;

/// First reserved local code; everything below is service-defined.
pub const RESERVED_BASE: u8 = ENQUIRY_PACKET;

/// The value a peer answers when it does not host the asked-for state.
pub const UNKNOWN_VALUE: &[u8] = b"?";

/// Upper bound on state values carried by Response/Tell bodies.
pub const MAX_VALUE_LEN: usize = 4096;

/// Error codes carried inside an [`ErrorPacket`]. Travels as a plain
/// UINT field; `from_wire` is the only decode path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The offending frame or body failed to parse or validate.
    Malformed = 1,
    /// Processing was cut short by link shutdown.
    Aborted = 2,
    /// The receiving handler's queue was full.
    Busy = 3,
    /// Processing raised an unanticipated failure.
    Unexpected = 4,
}

impl ErrorCode {
    pub fn from_wire(v: u64) -> Option<Self> {
        match v {
            1 => Some(ErrorCode::Malformed),
            2 => Some(ErrorCode::Aborted),
            3 => Some(ErrorCode::Busy),
            4 => Some(ErrorCode::Unexpected),
            _ => None,
        }
    }
}

/// Answer codes carried inside a [`ConfirmPacket`]. Travels as a plain
/// UINT field; `from_wire` is the only decode path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmCode {
    /// The receiver has no opinion: no check installed, or no such state.
    NoComment = 0,
    /// Proposal accepted; the value was committed.
    Yes = 1,
    /// Proposal denied; nothing was committed.
    No = 2,
}

impl ConfirmCode {
    pub fn from_wire(v: u64) -> Option<Self> {
        match v {
            0 => Some(ConfirmCode::NoComment),
            1 => Some(ConfirmCode::Yes),
            2 => Some(ConfirmCode::No),
            _ => None,
        }
    }
}

/// Outcome surfaced to the caller of `open_session`. Never leaves the
/// process; the wire carries it as distinct lifecycle packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Accept = 0,
    Busy = 1,
    Refuse = 2,
    Done = 3,
}

/// Advisory management level carried in the frame header. Serde derives
/// because it is part of [`crate::config::HandlerConfig`]'s JSON shape;
/// on the wire it is a bare header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketLevel {
    SessionHandler = 1,
    Service = 2,
    SubService = 3,
}

impl PacketLevel {
    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            1 => Some(PacketLevel::SessionHandler),
            2 => Some(PacketLevel::Service),
            3 => Some(PacketLevel::SubService),
            _ => None,
        }
    }
}

impl From<PacketLevel> for u8 {
    fn from(level: PacketLevel) -> u8 {
        level as u8
    }
}

/// Conversion between struct fields and tagged wire values.
pub trait FieldValue: Sized {
    fn into_value(self) -> Value;
    fn from_value(value: Value, field: &'static str) -> Result<Self, CodecError>;
}

impl FieldValue for u64 {
    fn into_value(self) -> Value {
        Value::Uint(self)
    }

    fn from_value(value: Value, field: &'static str) -> Result<Self, CodecError> {
        value.as_uint().ok_or(CodecError::FieldType {
            field,
            expected: crate::codec::tag::UINT,
            got: 0,
        })
    }
}

impl FieldValue for Vec<u8> {
    fn into_value(self) -> Value {
        Value::Bytes(self)
    }

    fn from_value(value: Value, field: &'static str) -> Result<Self, CodecError> {
        match value {
            Value::Bytes(b) => Ok(b),
            _ => Err(CodecError::FieldType {
                field,
                expected: crate::codec::tag::BYTES_VAR,
                got: 0,
            }),
        }
    }
}

/// A typed packet bound to a static schema.
pub trait Packet: Sized {
    /// Range-local type code.
    const LOCAL: u8;

    fn schema() -> &'static PacketSchema;

    fn values(&self) -> Vec<Value>;

    fn from_values(values: Vec<Value>) -> Result<Self, CodecError>;

    /// Serialize this packet into a frame body.
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Self::schema().encode(&self.values())
    }

    /// Parse and validate a frame body into this packet.
    fn decode(body: &[u8]) -> Result<Self, CodecError> {
        Self::from_values(Self::schema().decode(body)?)
    }
}

const fn uint() -> FieldKind {
    FieldKind::Uint { bounds: None }
}

const fn uint_in(lo: u64, hi: u64) -> FieldKind {
    FieldKind::Uint {
        bounds: Some((lo, hi)),
    }
}

const fn value_bytes() -> FieldKind {
    FieldKind::BytesVar {
        bounds: Some((0, MAX_VALUE_LEN)),
    }
}

macro_rules! define_packet {
    (
        $(#[$meta:meta])*
        $name:ident, $schema:ident, $local:expr, $wire_name:literal {
            $( $field:ident : $fty:ty = $kind:expr ),+ $(,)?
        }
    ) => {
        static $schema: PacketSchema = PacketSchema {
            name: $wire_name,
            local_type: $local,
            fields: &[
                $( FieldSpec { name: stringify!($field), kind: $kind }, )+
            ],
        };

        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            $( pub $field: $fty, )+
        }

        impl $name {
            #[allow(clippy::too_many_arguments)]
            pub fn new( $( $field: $fty ),+ ) -> Self {
                Self { $( $field, )+ }
            }
        }

        impl Packet for $name {
            const LOCAL: u8 = $local;

            fn schema() -> &'static PacketSchema {
                &$schema
            }

            fn values(&self) -> Vec<Value> {
                vec![ $( FieldValue::into_value(self.$field.clone()), )+ ]
            }

            fn from_values(values: Vec<Value>) -> Result<Self, CodecError> {
                let expected = $schema.fields.len();
                if values.len() != expected {
                    return Err(CodecError::FieldCount {
                        expected,
                        got: values.len(),
                    });
                }
                let mut iter = values.into_iter();
                Ok(Self {
                    $( $field: FieldValue::from_value(
                        iter.next().expect("arity checked above"),
                        stringify!($field),
                    )?, )+
                })
            }
        }
    };
}

define_packet! {
    /// Ask the peer for the current value of a named state.
    EnquiryPacket, ENQUIRY_SCHEMA, ENQUIRY_PACKET, "enquiry" {
        state: u64 = uint(),
        sesh_type: u64 = uint(),
        sesh_id: u64 = uint(),
    }
}

define_packet! {
    /// Answer to an enquiry, carrying the state's value (or `b"?"`).
    ResponsePacket, RESPONSE_SCHEMA, RESPONSE_PACKET, "response" {
        state: u64 = uint(),
        value: Vec<u8> = value_bytes(),
        sesh_type: u64 = uint(),
        sesh_id: u64 = uint(),
    }
}

define_packet! {
    /// Propose a value for a named state.
    TellPacket, TELL_SCHEMA, TELL_PACKET, "tell" {
        state: u64 = uint(),
        value: Vec<u8> = value_bytes(),
        sesh_type: u64 = uint(),
        sesh_id: u64 = uint(),
    }
}

define_packet! {
    /// Ask the peer to push its value for a named state via Tell.
    ShowPacket, SHOW_SCHEMA, SHOW_PACKET, "show" {
        state: u64 = uint(),
        sesh_type: u64 = uint(),
        sesh_id: u64 = uint(),
    }
}

define_packet! {
    /// Accept or deny a proposed value.
    ConfirmPacket, CONFIRM_SCHEMA, CONFIRM_PACKET, "confirm" {
        proposal: u64 = uint(),
        answer: u64 = uint_in(0, 2),
        sesh_type: u64 = uint(),
        sesh_id: u64 = uint(),
    }
}

macro_rules! define_lifecycle_packet {
    ( $(#[$meta:meta])* $name:ident, $schema:ident, $local:expr, $wire_name:literal ) => {
        define_packet! {
            $(#[$meta])*
            $name, $schema, $local, $wire_name {
                sesh_type: u64 = uint(),
                sesh_id: u64 = uint(),
            }
        }
    };
}

define_lifecycle_packet! {
    /// Open a session of the given type; the sender becomes its finalizer.
    StartPacket, START_SCHEMA, START_PACKET, "start"
}

define_lifecycle_packet! {
    /// Tear a session down; only the side that issued Start may send it.
    FinishPacket, FINISH_SCHEMA, FINISH_PACKET, "finish"
}

define_lifecycle_packet! {
    /// The responder accepted a Start.
    AcceptPacket, ACCEPT_SCHEMA, ACCEPT_PACKET, "accept"
}

define_lifecycle_packet! {
    /// The responder declined a Start (bad id, unknown type, or hook veto).
    RefusePacket, REFUSE_SCHEMA, REFUSE_PACKET, "refuse"
}

define_lifecycle_packet! {
    /// The responder is at its session cap.
    BusyPacket, BUSY_SCHEMA, BUSY_PACKET, "busy"
}

define_lifecycle_packet! {
    /// The responder has nothing more to do in this session.
    DonePacket, DONE_SCHEMA, DONE_PACKET, "done"
}

define_packet! {
    /// Out-of-band notice that a received packet could not be routed
    /// or dispatched.
    UnknownPacket, UNKNOWN_SCHEMA, UNKNOWN_PACKET, "unknown" {
        pkt_type: u64 = uint_in(0, 65535),
        level: u64 = uint_in(1, 3),
        process: u64 = uint(),
    }
}

define_packet! {
    /// Out-of-band notice that a received packet failed while being
    /// processed.
    ErrorPacket, ERROR_SCHEMA, ERROR_PACKET, "error" {
        pkt_type: u64 = uint_in(0, 65535),
        level: u64 = uint_in(1, 3),
        process: u64 = uint(),
        error: u64 = uint_in(1, 4),
    }
}
