//! # Protocol Multiplexer
//!
//! One protocol instance binds one transport and fans inbound frames out
//! to handlers by packet-type range. The write path is serialized through
//! a single writer task fed by a bounded outbox channel, so handlers and
//! operations never contend for the transport.
//!
//! Inbound processing peels whole frames off the byte stream and routes
//! each one:
//!
//! 1. no handler owns the range — answer with an Unknown reply, except
//!    when the frame itself claims to be an Unknown/Error reply, which is
//!    treated as an attempted reply-storm attack and raised to the host
//!    with nothing written to the wire;
//! 2. the header is malformed — answer with a MALFORMED error;
//! 3. the handler's queue is full — answer with a BUSY error carrying the
//!    range-relative type;
//! 4. otherwise — deliver `(type, body)` into the handler's queue.

use crate::codec::{range_base, range_index, FrameHeader, HEADER_LEN, SYSTEM_RANGE, USER_RANGE_MAX};
use crate::config::{HandlerConfig, ProtocolConfig};
use crate::error::ProtocolError;
use crate::handler::{Handler, Inbound, Role, Service};
use crate::packet::{
    ErrorCode, ErrorPacket, Packet, UnknownPacket, ERROR_PACKET, UNKNOWN_PACKET,
};
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Items consumed by the writer task.
pub(crate) enum Outbound {
    Frame(Vec<u8>),
    /// Close the transport and stop writing.
    Shutdown,
}

/// Clonable handle to the serialized write path.
#[derive(Clone)]
pub(crate) struct Outbox {
    tx: mpsc::Sender<Outbound>,
    attached: Arc<AtomicBool>,
}

impl Outbox {
    /// Frame a body and enqueue it for the writer.
    pub(crate) async fn send_frame(
        &self,
        pkt_type: u16,
        level: u8,
        body: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        if !self.attached.load(Ordering::SeqCst) {
            return Err(ProtocolError::NoTransport);
        }
        let header = FrameHeader::new(pkt_type, body.len(), level);
        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(&body);
        self.tx
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| ProtocolError::Aborted)
    }

    /// Outbox wired straight to a channel, for handler-level unit tests
    /// that inspect emitted frames without a transport.
    #[cfg(test)]
    pub(crate) fn stub(tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            tx,
            attached: Arc::new(AtomicBool::new(true)),
        }
    }
}

struct ProtocolInner {
    role: Role,
    cfg: ProtocolConfig,
    outbox_tx: mpsc::Sender<Outbound>,
    outbox_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
    attached: Arc<AtomicBool>,
    closed: AtomicBool,
    handlers: Mutex<HashMap<u16, mpsc::Sender<Inbound>>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    recv_buf: Mutex<Vec<u8>>,
    /// Opaque authenticated-identity handle for the host's use.
    identity: Mutex<Option<Uuid>>,
}

/// One end of a point-to-point link.
#[derive(Clone)]
pub struct Protocol {
    inner: Arc<ProtocolInner>,
}

impl Protocol {
    pub fn new(role: Role, cfg: ProtocolConfig) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::channel(cfg.outbox_capacity);
        Self {
            inner: Arc::new(ProtocolInner {
                role,
                cfg,
                outbox_tx,
                outbox_rx: Mutex::new(Some(outbox_rx)),
                attached: Arc::new(AtomicBool::new(false)),
                closed: AtomicBool::new(false),
                handlers: Mutex::new(HashMap::new()),
                consumers: Mutex::new(Vec::new()),
                writer: Mutex::new(None),
                recv_buf: Mutex::new(Vec::new()),
                identity: Mutex::new(None),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// The authenticated identity of the peer, if the host has set one.
    pub async fn identity(&self) -> Option<Uuid> {
        *self.inner.identity.lock().await
    }

    pub async fn set_identity(&self, identity: Option<Uuid>) {
        *self.inner.identity.lock().await = identity;
    }

    fn outbox(&self) -> Outbox {
        Outbox {
            tx: self.inner.outbox_tx.clone(),
            attached: self.inner.attached.clone(),
        }
    }

    /// Register a service, claiming its whole range. Handlers are meant to
    /// be registered before the transport starts delivering bytes.
    pub async fn register<S: Service>(
        &self,
        service: S,
        cfg: HandlerConfig,
    ) -> Result<Handler, ProtocolError> {
        let range = service.range();
        if !(1..=USER_RANGE_MAX).contains(&range) && range != SYSTEM_RANGE {
            return Err(ProtocolError::RangeOutOfBounds(range));
        }
        let mut handlers = self.inner.handlers.lock().await;
        if handlers.contains_key(&range) {
            return Err(ProtocolError::RangeClaimed(range));
        }
        let (handler, queue, consumer) =
            Handler::spawn(self.inner.role, Arc::new(service), cfg, self.outbox());
        handlers.insert(range, queue);
        self.inner.consumers.lock().await.push(consumer);
        debug!(range, role = ?self.inner.role, "handler registered");
        Ok(handler)
    }

    /// Bind the write side of a transport, spawning the writer task.
    pub async fn attach<T>(&self, mut transport: T) -> Result<(), ProtocolError>
    where
        T: Transport + 'static,
    {
        let mut rx_slot = self.inner.outbox_rx.lock().await;
        if self.inner.attached.swap(true, Ordering::SeqCst) {
            return Err(ProtocolError::AlreadyConnected);
        }
        let mut rx = rx_slot.take().ok_or(ProtocolError::AlreadyConnected)?;
        let name = transport.name();
        debug!(transport = name, "transport attached");
        let writer = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    Outbound::Frame(frame) => {
                        if let Err(e) = transport.write_frame(&frame).await {
                            error!(transport = name, error = %e, "transport write failed; writer stopping");
                            break;
                        }
                    }
                    Outbound::Shutdown => {
                        if let Err(e) = transport.close().await {
                            debug!(transport = name, error = %e, "transport close failed");
                        }
                        break;
                    }
                }
            }
        });
        *self.inner.writer.lock().await = Some(writer);
        Ok(())
    }

    /// Write one raw frame to the peer.
    pub async fn send_packet(
        &self,
        pkt_type: u16,
        level: u8,
        body: &[u8],
    ) -> Result<(), ProtocolError> {
        self.outbox().send_frame(pkt_type, level, body.to_vec()).await
    }

    /// Deliver received bytes. Peels and routes every whole frame in the
    /// internal buffer; partial frames wait for the next call.
    ///
    /// The only fatal outcome is an attempted attack, which is returned to
    /// the caller so the host can tear the connection down.
    pub async fn feed(&self, data: &[u8]) -> Result<(), ProtocolError> {
        let mut buf = self.inner.recv_buf.lock().await;
        buf.extend_from_slice(data);
        loop {
            if buf.len() < HEADER_LEN {
                return Ok(());
            }
            let pkt_type = u16::from_be_bytes([buf[0], buf[1]]);
            let declared = u32::from_be_bytes([0, buf[2], buf[3], buf[4]]) as usize;
            let level = buf[5];

            let index = range_index(pkt_type);
            let local = (pkt_type - range_base(index)) as u8;
            let queue = self.inner.handlers.lock().await.get(&index).cloned();

            if queue.is_none() && (local == UNKNOWN_PACKET || local == ERROR_PACKET) {
                // A reply packet aimed at a range nobody owns: answering it
                // would arm a reply storm. Raise to the host instead.
                error!(
                    pkt_type,
                    "unknown/error reply aimed at unregistered range; treating as attack"
                );
                return Err(ProtocolError::AttemptedAttack(pkt_type));
            }

            if declared < HEADER_LEN || declared > self.inner.cfg.max_frame_len {
                warn!(pkt_type, declared, "malformed frame length");
                match &queue {
                    Some(_) => {
                        self.emit_error(index, pkt_type as u64, level, ErrorCode::Malformed)
                            .await;
                    }
                    None => self.emit_unknown(pkt_type, level).await,
                }
                // The stream cannot be re-synchronized past an untrusted
                // length; everything buffered is suspect.
                buf.clear();
                return Ok(());
            }

            if buf.len() < declared {
                return Ok(());
            }

            let frame: Vec<u8> = buf.drain(..declared).collect();
            let body = frame[HEADER_LEN..].to_vec();

            match queue {
                None => {
                    warn!(pkt_type, "no handler for range; answering unknown");
                    self.emit_unknown(pkt_type, level).await;
                }
                Some(queue) => match queue.try_send(Inbound::Frame {
                    pkt_type,
                    level,
                    body,
                }) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(pkt_type, range = index, "handler queue full; answering busy");
                        self.emit_error(index, local as u64, level, ErrorCode::Busy)
                            .await;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        warn!(pkt_type, range = index, "handler consumer gone; frame dropped");
                    }
                },
            }
        }
    }

    /// Pump an async reader into `feed` until EOF or a fatal error.
    pub fn spawn_reader<R>(&self, mut reader: R) -> JoinHandle<Result<(), ProtocolError>>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let protocol = self.clone();
        tokio::spawn(async move {
            let mut chunk = vec![0u8; 4096];
            loop {
                let n = reader.read(&mut chunk).await?;
                if n == 0 {
                    debug!("peer closed the read side");
                    return Ok(());
                }
                protocol.feed(&chunk[..n]).await?;
            }
        })
    }

    /// Close the link: inject the termination sentinel into every handler
    /// queue, join the consumers, then stop the writer (which closes the
    /// transport). Idempotent.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let queues: Vec<_> = self
            .inner
            .handlers
            .lock()
            .await
            .values()
            .cloned()
            .collect();
        for queue in queues {
            let _ = queue.send(Inbound::Shutdown).await;
        }
        let consumers: Vec<_> = self.inner.consumers.lock().await.drain(..).collect();
        for consumer in consumers {
            let _ = consumer.await;
        }
        let _ = self.inner.outbox_tx.send(Outbound::Shutdown).await;
        if let Some(writer) = self.inner.writer.lock().await.take() {
            let _ = writer.await;
        }
        self.inner.attached.store(false, Ordering::SeqCst);
        debug!(role = ?self.inner.role, "protocol closed");
        Ok(())
    }

    /// Answer an unroutable packet: absolute type = offending range's base
    /// plus the Unknown code.
    async fn emit_unknown(&self, offender: u16, level: u8) {
        let base = range_base(range_index(offender));
        let packet = UnknownPacket::new(offender as u64, clamp_level(level), 0);
        match packet.encode() {
            Ok(body) => {
                if let Err(e) = self
                    .outbox()
                    .send_frame(base + UNKNOWN_PACKET as u16, level, body)
                    .await
                {
                    debug!(error = %e, "could not answer with unknown packet");
                }
            }
            Err(e) => debug!(error = %e, "could not encode unknown packet"),
        }
    }

    /// Answer a framing-layer failure into the given range.
    async fn emit_error(&self, index: u16, offender_field: u64, level: u8, code: ErrorCode) {
        let base = range_base(index);
        let packet = ErrorPacket::new(offender_field, clamp_level(level), 0, code as u64);
        match packet.encode() {
            Ok(body) => {
                if let Err(e) = self
                    .outbox()
                    .send_frame(base + ERROR_PACKET as u16, level, body)
                    .await
                {
                    debug!(error = %e, "could not answer with error packet");
                }
            }
            Err(e) => debug!(error = %e, "could not encode error packet"),
        }
    }
}

fn clamp_level(level: u8) -> u64 {
    level.clamp(1, 3) as u64
}
