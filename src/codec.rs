//! # Wire Codec
//!
//! The lowest layer of the stack: the fixed 6-byte frame header, the
//! 128-wide packet-type range arithmetic, and the tagged value format that
//! packet bodies are serialized through.
//!
//! ## Frame header
//!
//! ```text
//! offset  bytes  field
//!  0      2      pkt_type    u16 big-endian
//!  2      3      pkt_length  u24 big-endian, whole frame incl. header
//!  5      1      pkt_level   u8 advisory routing hint
//! ```
//!
//! ## Body format
//!
//! A body is a self-delimiting typed array: a one-byte field count followed
//! by one tagged value per field. Every value carries its type tag, and
//! byte-string values carry an explicit u32 length, so a body can be walked
//! without consulting the schema. Schemas are still consulted for
//! validation: integer ranges, exact sizes and length bounds.
//!
//! ```text
//! count: u8
//! per field:
//!   tag: u8
//!   UINT      (0x01)  8 bytes BE
//!   UUID      (0x02)  16 raw bytes
//!   BYTES_FIX (0x03)  u32 BE length + raw bytes
//!   BYTES_VAR (0x04)  u32 BE length + raw bytes
//!   DATETIME  (0x05)  8 bytes BE UNIX seconds, UTC
//! ```

use crate::error::CodecError;
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 6;

/// Hard cap on a whole frame; anything larger is malformed.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Width of one packet-type range.
pub const RANGE_WIDTH: u16 = 128;

/// Highest assignable range index for user services.
pub const USER_RANGE_MAX: u16 = 10;

/// Range index reserved for system use (codes 65408..=65535).
pub const SYSTEM_RANGE: u16 = 512;

/// Field type tags as they appear on the wire.
pub mod tag {
    pub const UINT: u8 = 0x01;
    pub const UUID: u8 = 0x02;
    pub const BYTES_FIX: u8 = 0x03;
    pub const BYTES_VAR: u8 = 0x04;
    pub const DATETIME: u8 = 0x05;
}

/// Range index for a packet type: `n/128 + 1`.
pub fn range_index(pkt_type: u16) -> u16 {
    pkt_type / RANGE_WIDTH + 1
}

/// Inclusive `(first, last)` type codes of a range.
pub fn range_bounds(index: u16) -> (u16, u16) {
    let base = (index - 1) * RANGE_WIDTH;
    (base, base + (RANGE_WIDTH - 1))
}

/// First type code of a range.
pub fn range_base(index: u16) -> u16 {
    range_bounds(index).0
}

/// The fixed 6-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Absolute packet type code.
    pub pkt_type: u16,
    /// Whole frame length including the header itself.
    pub pkt_length: u32,
    /// Advisory management level (1 session handler, 2 service, 3 sub-service).
    pub pkt_level: u8,
}

impl FrameHeader {
    /// Build a header for a body of `body_len` bytes.
    pub fn new(pkt_type: u16, body_len: usize, pkt_level: u8) -> Self {
        Self {
            pkt_type,
            pkt_length: (HEADER_LEN + body_len) as u32,
            pkt_level,
        }
    }

    /// Serialize to the 6 wire bytes.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let t = self.pkt_type.to_be_bytes();
        let l = self.pkt_length.to_be_bytes();
        // u24: drop the most significant byte of the u32.
        [t[0], t[1], l[1], l[2], l[3], self.pkt_level]
    }

    /// Parse the 6 wire bytes and sanity-check the announced length.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN - buf.len(),
                have: buf.len(),
            });
        }
        let pkt_type = u16::from_be_bytes([buf[0], buf[1]]);
        let pkt_length = u32::from_be_bytes([0, buf[2], buf[3], buf[4]]);
        let pkt_level = buf[5];
        if (pkt_length as usize) < HEADER_LEN {
            return Err(CodecError::Header("declared length below header size"));
        }
        if pkt_length as usize > MAX_FRAME_LEN {
            return Err(CodecError::Header("declared length exceeds frame cap"));
        }
        Ok(Self {
            pkt_type,
            pkt_length,
            pkt_level,
        })
    }

    /// Length of the body that follows the header.
    pub fn body_len(&self) -> usize {
        self.pkt_length as usize - HEADER_LEN
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Uint(u64),
    Uuid(Uuid),
    Bytes(Vec<u8>),
    Instant(DateTime<Utc>),
}

impl Value {
    /// Build an instant value truncated to whole seconds, the only
    /// resolution the wire carries.
    pub fn instant(at: DateTime<Utc>) -> Self {
        match Utc.timestamp_opt(at.timestamp(), 0).single() {
            Some(truncated) => Value::Instant(truncated),
            None => Value::Instant(at),
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_instant(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Instant(t) => Some(*t),
            _ => None,
        }
    }
}

/// Declarative type-and-constraint description of one schema field.
#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    /// Unsigned integer, optionally constrained to `[lo, hi]`.
    Uint { bounds: Option<(u64, u64)> },
    /// 128-bit identifier.
    Uuid,
    /// Opaque bytes of exactly `size` bytes.
    BytesFix { size: usize },
    /// Opaque bytes, length optionally constrained to `[lo, hi]`.
    BytesVar { bounds: Option<(usize, usize)> },
    /// Instant at one-second resolution, UTC.
    Instant,
}

impl FieldKind {
    /// The wire tag this kind serializes under.
    pub fn tag(&self) -> u8 {
        match self {
            FieldKind::Uint { .. } => tag::UINT,
            FieldKind::Uuid => tag::UUID,
            FieldKind::BytesFix { .. } => tag::BYTES_FIX,
            FieldKind::BytesVar { .. } => tag::BYTES_VAR,
            FieldKind::Instant => tag::DATETIME,
        }
    }
}

/// One named, typed field of a packet schema.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

/// Ordered field list for one packet type.
///
/// Schemas are static: every packet declares its shape once and the codec
/// validates both directions against it.
#[derive(Debug, Clone, Copy)]
pub struct PacketSchema {
    pub name: &'static str,
    pub local_type: u8,
    pub fields: &'static [FieldSpec],
}

impl PacketSchema {
    /// Encode `values` against this schema into a body.
    pub fn encode(&self, values: &[Value]) -> Result<Vec<u8>, CodecError> {
        if values.len() != self.fields.len() {
            return Err(CodecError::FieldCount {
                expected: self.fields.len(),
                got: values.len(),
            });
        }
        let mut out = Vec::with_capacity(16 * self.fields.len() + 1);
        out.push(self.fields.len() as u8);
        for (spec, value) in self.fields.iter().zip(values) {
            self.check(spec, value)?;
            out.push(spec.kind.tag());
            match value {
                Value::Uint(v) => out.extend_from_slice(&v.to_be_bytes()),
                Value::Uuid(u) => out.extend_from_slice(u.as_bytes()),
                Value::Bytes(b) => {
                    out.extend_from_slice(&(b.len() as u32).to_be_bytes());
                    out.extend_from_slice(b);
                }
                Value::Instant(t) => {
                    let secs = u64::try_from(t.timestamp())
                        .map_err(|_| CodecError::Instant { field: spec.name })?;
                    out.extend_from_slice(&secs.to_be_bytes());
                }
            }
        }
        Ok(out)
    }

    /// Decode a body against this schema into typed values.
    pub fn decode(&self, body: &[u8]) -> Result<Vec<Value>, CodecError> {
        let mut r = Reader::new(body);
        let count = r.u8()? as usize;
        if count != self.fields.len() {
            return Err(CodecError::FieldCount {
                expected: self.fields.len(),
                got: count,
            });
        }
        let mut values = Vec::with_capacity(count);
        for spec in self.fields {
            let got = r.u8()?;
            let expected = spec.kind.tag();
            if got != expected {
                // Distinguish garbage tags from well-formed but mismatched ones.
                if !matches!(
                    got,
                    tag::UINT | tag::UUID | tag::BYTES_FIX | tag::BYTES_VAR | tag::DATETIME
                ) {
                    return Err(CodecError::UnknownTypeCode(got));
                }
                return Err(CodecError::FieldType {
                    field: spec.name,
                    expected,
                    got,
                });
            }
            let value = match spec.kind {
                FieldKind::Uint { .. } => Value::Uint(r.u64_be()?),
                FieldKind::Uuid => {
                    let raw = r.take(16)?;
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(raw);
                    Value::Uuid(Uuid::from_bytes(bytes))
                }
                FieldKind::BytesFix { .. } | FieldKind::BytesVar { .. } => {
                    let len = r.u32_be()? as usize;
                    Value::Bytes(r.take(len)?.to_vec())
                }
                FieldKind::Instant => {
                    let secs = r.u64_be()?;
                    let signed = i64::try_from(secs)
                        .map_err(|_| CodecError::Instant { field: spec.name })?;
                    let at = Utc
                        .timestamp_opt(signed, 0)
                        .single()
                        .ok_or(CodecError::Instant { field: spec.name })?;
                    Value::Instant(at)
                }
            };
            self.check(spec, &value)?;
            values.push(value);
        }
        if r.remaining() > 0 {
            return Err(CodecError::Trailing(r.remaining()));
        }
        Ok(values)
    }

    /// Validate one value against its field constraints.
    fn check(&self, spec: &FieldSpec, value: &Value) -> Result<(), CodecError> {
        match (spec.kind, value) {
            (FieldKind::Uint { bounds }, Value::Uint(v)) => {
                if let Some((lo, hi)) = bounds {
                    if *v < lo || *v > hi {
                        return Err(CodecError::Range {
                            field: spec.name,
                            value: *v,
                            lo,
                            hi,
                        });
                    }
                }
                Ok(())
            }
            (FieldKind::Uuid, Value::Uuid(_)) => Ok(()),
            (FieldKind::BytesFix { size }, Value::Bytes(b)) => {
                if b.len() != size {
                    return Err(CodecError::Length {
                        field: spec.name,
                        len: b.len(),
                        lo: size,
                        hi: size,
                    });
                }
                Ok(())
            }
            (FieldKind::BytesVar { bounds }, Value::Bytes(b)) => {
                if let Some((lo, hi)) = bounds {
                    if b.len() < lo || b.len() > hi {
                        return Err(CodecError::Length {
                            field: spec.name,
                            len: b.len(),
                            lo,
                            hi,
                        });
                    }
                }
                Ok(())
            }
            (FieldKind::Instant, Value::Instant(_)) => Ok(()),
            (kind, _) => Err(CodecError::FieldType {
                field: spec.name,
                expected: kind.tag(),
                got: 0,
            }),
        }
    }
}

/// Bounds-checked cursor over a body slice.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n - self.remaining(),
                have: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u32_be(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64_be(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}
