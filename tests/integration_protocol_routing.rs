//! Byte-level multiplexer behavior, driven by feeding raw frames and
//! inspecting what comes back on the wire: range routing, unknown/error
//! replies, reply-loop prevention, attack detection, malformed framing,
//! and queue backpressure.

use anyhow::Result;
use muxlink::codec::{range_base, FrameHeader, HEADER_LEN};
use muxlink::packet::{
    AcceptPacket, EnquiryPacket, ErrorPacket, FinishPacket, Packet, UnknownPacket, ERROR_PACKET,
    UNKNOWN_PACKET,
};
use muxlink::{
    ErrorCode, HandlerConfig, Protocol, ProtocolConfig, ProtocolError, Role, Service, StateSpec,
    StreamTransport,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, ReadHalf};

type WireReader = ReadHalf<tokio::io::DuplexStream>;
type SpareHalves = (
    ReadHalf<tokio::io::DuplexStream>,
    tokio::io::WriteHalf<tokio::io::DuplexStream>,
);

/// A protocol wired to a duplex pipe whose far end we hold: frames are
/// injected with `feed`, replies read back with `read_frame`. The spare
/// halves are returned so the pipe stays open for the test's lifetime.
async fn harness(role: Role) -> Result<(Protocol, WireReader, SpareHalves)> {
    let protocol = Protocol::new(role, ProtocolConfig::default());
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    protocol.attach(StreamTransport::new(a_write)).await?;
    Ok((protocol, b_read, (a_read, b_write)))
}

fn frame(pkt_type: u16, level: u8, body: &[u8]) -> Vec<u8> {
    let mut out = FrameHeader::new(pkt_type, body.len(), level).encode().to_vec();
    out.extend_from_slice(body);
    out
}

async fn read_frame(reader: &mut WireReader) -> Result<(FrameHeader, Vec<u8>)> {
    let mut head = [0u8; HEADER_LEN];
    reader.read_exact(&mut head).await?;
    let header = FrameHeader::decode(&head)?;
    let mut body = vec![0u8; header.body_len()];
    reader.read_exact(&mut body).await?;
    Ok((header, body))
}

async fn assert_silent(reader: &mut WireReader) {
    let mut byte = [0u8; 1];
    let outcome = tokio::time::timeout(Duration::from_millis(200), reader.read(&mut byte)).await;
    assert!(outcome.is_err(), "expected no wire traffic, got some");
}

struct CountingService {
    range: u16,
    seen: Arc<AtomicUsize>,
    /// How long each service packet takes to process.
    delay: Duration,
}

#[async_trait::async_trait]
impl Service for CountingService {
    fn range(&self) -> u16 {
        self.range
    }

    fn states(&self) -> Vec<(u64, StateSpec)> {
        Vec::new()
    }

    async fn handle_packet(
        &self,
        _local_type: u8,
        _body: &[u8],
        _handler: &muxlink::Handler,
    ) -> Result<bool, ProtocolError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

fn counting(range: u16) -> (CountingService, Arc<AtomicUsize>) {
    let seen = Arc::new(AtomicUsize::new(0));
    (
        CountingService {
            range,
            seen: seen.clone(),
            delay: Duration::ZERO,
        },
        seen,
    )
}

#[tokio::test]
async fn frames_route_to_their_range_only() -> Result<()> {
    let (protocol, _wire, _pipe) = harness(Role::Server).await?;
    let (svc1, seen1) = counting(1);
    let (svc2, seen2) = counting(2);
    protocol.register(svc1, HandlerConfig::default()).await?;
    protocol.register(svc2, HandlerConfig::default()).await?;

    protocol.feed(&frame(range_base(1) + 5, 1, b"")).await?;
    protocol.feed(&frame(range_base(2) + 5, 1, b"")).await?;
    protocol.feed(&frame(range_base(2) + 6, 1, b"")).await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(seen1.load(Ordering::SeqCst), 1);
    assert_eq!(seen2.load(Ordering::SeqCst), 2);

    protocol.close().await?;
    Ok(())
}

#[tokio::test]
async fn unroutable_type_answers_unknown_in_its_own_range() -> Result<()> {
    let (protocol, mut wire, _pipe) = harness(Role::Server).await?;
    let (svc, _seen) = counting(3);
    protocol.register(svc, HandlerConfig::default()).await?;

    // Type 500 lives in range 4, which nobody owns.
    let body = EnquiryPacket::new(1, 0, 0).encode()?;
    protocol.feed(&frame(500, 2, &body)).await?;

    let (header, body) = read_frame(&mut wire).await?;
    assert_eq!(header.pkt_type, range_base(4) + UNKNOWN_PACKET as u16);
    let unknown = UnknownPacket::decode(&body)?;
    assert_eq!(unknown.pkt_type, 500);
    assert_eq!(unknown.process, 0);

    protocol.close().await?;
    Ok(())
}

#[tokio::test]
async fn unknown_reply_to_unowned_range_is_an_attack() -> Result<()> {
    let (protocol, mut wire, _pipe) = harness(Role::Server).await?;
    let (svc, _seen) = counting(3);
    protocol.register(svc, HandlerConfig::default()).await?;

    // The Error code slot of unowned range 9.
    let attack_type = range_base(9) + ERROR_PACKET as u16;
    let body = ErrorPacket::new(1, 1, 0, ErrorCode::Malformed as u64).encode()?;
    let result = protocol.feed(&frame(attack_type, 1, &body)).await;
    assert!(matches!(
        result,
        Err(ProtocolError::AttemptedAttack(t)) if t == attack_type
    ));
    assert_silent(&mut wire).await;

    Ok(())
}

#[tokio::test]
async fn unknown_and_error_replies_are_never_answered() -> Result<()> {
    let (protocol, mut wire, _pipe) = harness(Role::Server).await?;
    let (svc, _seen) = counting(3);
    protocol.register(svc, HandlerConfig::default()).await?;
    let base = range_base(3);

    let unknown = UnknownPacket::new(300, 1, 0).encode()?;
    protocol
        .feed(&frame(base + UNKNOWN_PACKET as u16, 1, &unknown))
        .await?;
    let error = ErrorPacket::new(300, 1, 0, ErrorCode::Unexpected as u64).encode()?;
    protocol
        .feed(&frame(base + ERROR_PACKET as u16, 1, &error))
        .await?;

    // Even undecodable ones stay silent while in the reply path.
    protocol
        .feed(&frame(base + UNKNOWN_PACKET as u16, 1, b"\xff\xff"))
        .await?;

    assert_silent(&mut wire).await;
    protocol.close().await?;
    Ok(())
}

#[tokio::test]
async fn malformed_length_answers_malformed_error() -> Result<()> {
    let (protocol, mut wire, _pipe) = harness(Role::Server).await?;
    let (svc, _seen) = counting(3);
    protocol.register(svc, HandlerConfig::default()).await?;

    // Declared length 3 cannot cover the header itself.
    let bogus = [0x01, 0x2c, 0x00, 0x00, 0x03, 0x01]; // type 300, length 3
    protocol.feed(&bogus).await?;

    let (header, body) = read_frame(&mut wire).await?;
    assert_eq!(header.pkt_type, range_base(3) + ERROR_PACKET as u16);
    let error = ErrorPacket::decode(&body)?;
    assert_eq!(error.pkt_type, 300);
    assert_eq!(ErrorCode::from_wire(error.error), Some(ErrorCode::Malformed));

    protocol.close().await?;
    Ok(())
}

#[tokio::test]
async fn queue_overflow_answers_busy_with_relative_type() -> Result<()> {
    let (protocol, mut wire, _pipe) = harness(Role::Server).await?;
    let seen = Arc::new(AtomicUsize::new(0));
    protocol
        .register(
            CountingService {
                range: 3,
                seen: seen.clone(),
                delay: Duration::from_millis(300),
            },
            HandlerConfig {
                queue_capacity: 1,
                ..Default::default()
            },
        )
        .await?;
    let base = range_base(3);

    // First frame occupies the consumer, second fills the queue, third
    // overflows.
    protocol.feed(&frame(base + 1, 1, b"")).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    protocol.feed(&frame(base + 1, 1, b"")).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    protocol.feed(&frame(base + 1, 1, b"")).await?;

    let (header, body) = read_frame(&mut wire).await?;
    assert_eq!(header.pkt_type, base + ERROR_PACKET as u16);
    let error = ErrorPacket::decode(&body)?;
    assert_eq!(ErrorCode::from_wire(error.error), Some(ErrorCode::Busy));
    // Busy reports the range-relative type of the dropped packet.
    assert_eq!(error.pkt_type, 1);

    protocol.close().await?;
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn finish_for_unknown_session_is_answered_unexpected() -> Result<()> {
    let (protocol, mut wire, _pipe) = harness(Role::Server).await?;
    let (svc, _seen) = counting(3);
    protocol.register(svc, HandlerConfig::default()).await?;
    let base = range_base(3);

    let finish = FinishPacket::new(7, 99).encode()?;
    protocol
        .feed(&frame(base + FinishPacket::LOCAL as u16, 1, &finish))
        .await?;

    let (header, body) = read_frame(&mut wire).await?;
    assert_eq!(header.pkt_type, base + ERROR_PACKET as u16);
    let error = ErrorPacket::decode(&body)?;
    assert_eq!(
        ErrorCode::from_wire(error.error),
        Some(ErrorCode::Unexpected)
    );

    protocol.close().await?;
    Ok(())
}

#[tokio::test]
async fn lifecycle_answer_on_wrong_side_is_unknown() -> Result<()> {
    // A server never processes Accept; it must answer Unknown, not crash.
    let (protocol, mut wire, _pipe) = harness(Role::Server).await?;
    let (svc, _seen) = counting(3);
    protocol.register(svc, HandlerConfig::default()).await?;
    let base = range_base(3);

    let accept = AcceptPacket::new(7, 1).encode()?;
    let pkt_type = base + AcceptPacket::LOCAL as u16;
    protocol.feed(&frame(pkt_type, 1, &accept)).await?;

    let (header, body) = read_frame(&mut wire).await?;
    assert_eq!(header.pkt_type, base + UNKNOWN_PACKET as u16);
    let unknown = UnknownPacket::decode(&body)?;
    assert_eq!(unknown.pkt_type, pkt_type as u64);

    protocol.close().await?;
    Ok(())
}

#[tokio::test]
async fn undecodable_body_answers_malformed() -> Result<()> {
    let (protocol, mut wire, _pipe) = harness(Role::Server).await?;
    let (svc, _seen) = counting(3);
    protocol.register(svc, HandlerConfig::default()).await?;
    let base = range_base(3);

    let pkt_type = base + EnquiryPacket::LOCAL as u16;
    protocol.feed(&frame(pkt_type, 1, b"\x02\x01")).await?;

    let (header, body) = read_frame(&mut wire).await?;
    assert_eq!(header.pkt_type, base + ERROR_PACKET as u16);
    let error = ErrorPacket::decode(&body)?;
    assert_eq!(ErrorCode::from_wire(error.error), Some(ErrorCode::Malformed));

    protocol.close().await?;
    Ok(())
}

#[tokio::test]
async fn frames_reassemble_across_chunked_delivery() -> Result<()> {
    let (protocol, mut wire, _pipe) = harness(Role::Server).await?;
    let (svc, seen) = counting(3);
    protocol.register(svc, HandlerConfig::default()).await?;

    let whole = frame(range_base(3) + 2, 1, b"abc");
    protocol.feed(&whole[..3]).await?;
    protocol.feed(&whole[3..7]).await?;
    protocol.feed(&whole[7..]).await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_silent(&mut wire).await;

    protocol.close().await?;
    Ok(())
}
