//! # Handler
//!
//! A handler owns one 128-wide packet-type range and processes everything
//! routed into it: a bounded inbound queue drained by a single consumer
//! task, a dispatch table selected by link role at construction, and the
//! state/session bookkeeping those packets drive.
//!
//! The public operations (`question_state`, `tell_state`, `show_state`,
//! `sync`, `open_session`, `with_session`, ...) are thin async fronts over
//! the same shared state: they arm a completion handle, emit a packet, and
//! park until the consumer resolves them.
//!
//! ## Failure rules
//!
//! - a packet that cannot be dispatched is answered with an Unknown reply;
//! - a body that fails to decode is answered with a MALFORMED error;
//! - any other processing failure is answered with an UNEXPECTED error;
//! - while processing an Unknown or Error packet the handler is *silent*:
//!   failures are logged, never answered, so reply loops cannot form.

use crate::codec::range_base;
use crate::config::HandlerConfig;
use crate::error::ProtocolError;
use crate::exchange::{StateSpec, StateTable};
use crate::packet::{
    AcceptPacket, BusyPacket, ConfirmCode, ConfirmPacket, DonePacket, EnquiryPacket, ErrorCode,
    ErrorPacket, FinishPacket, Packet, RefusePacket, ResponsePacket, SessionOutcome, ShowPacket,
    StartPacket, TellPacket, UnknownPacket, ACCEPT_PACKET, BUSY_PACKET, CONFIRM_PACKET,
    DONE_PACKET, ENQUIRY_PACKET, ERROR_PACKET, FINISH_PACKET, REFUSE_PACKET, RESERVED_BASE,
    RESPONSE_PACKET, SHOW_PACKET, START_PACKET, TELL_PACKET, UNKNOWN_PACKET, UNKNOWN_VALUE,
};
use crate::protocol::Outbox;
use crate::session::{Session, SessionRegistry};
use crate::waypoint::label;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Which end of the link a protocol instance is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Extension seam for concrete services.
///
/// A service claims a range, declares the states and session types it
/// hosts, and may veto incoming sessions or process packets in the
/// service-defined part of its range.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Range index this service occupies (1..=10 for user services).
    fn range(&self) -> u16;

    /// Handler-scoped states hosted by this side.
    fn states(&self) -> Vec<(u64, StateSpec)> {
        Vec::new()
    }

    /// Session-scoped states per session type; `None` marks the type
    /// unknown, which refuses incoming Starts and fails outgoing ones.
    fn session_states(&self, sesh_type: u64) -> Option<Vec<(u64, StateSpec)>> {
        let _ = sesh_type;
        None
    }

    /// Responder-side veto hook, run before a Start is accepted.
    async fn prepare_session(&self, sesh_type: u64, sesh_id: u64) -> Result<(), ProtocolError> {
        let _ = (sesh_type, sesh_id);
        Ok(())
    }

    /// Process a packet in the service-defined part of the range.
    /// Return `Ok(false)` to have the engine answer with an Unknown reply.
    async fn handle_packet(
        &self,
        local_type: u8,
        body: &[u8],
        handler: &Handler,
    ) -> Result<bool, ProtocolError> {
        let _ = (local_type, body, handler);
        Ok(false)
    }
}

/// Items delivered into a handler's bounded queue.
pub(crate) enum Inbound {
    Frame {
        pkt_type: u16,
        level: u8,
        body: Vec<u8>,
    },
    /// Termination sentinel injected on close; the consumer drains
    /// everything ahead of it, then exits.
    Shutdown,
}

struct HandlerState {
    table: StateTable,
    registry: SessionRegistry,
    /// Completion handle of the one in-flight enquiry (serialized by the
    /// enquiry lock, so one slot suffices).
    pending_response: Option<oneshot::Sender<Option<Vec<u8>>>>,
}

impl HandlerState {
    /// Resolve an operation scope to its state table and wire addressing.
    fn scope(&mut self, session: Option<u64>) -> Result<(&mut StateTable, u64, u64), ProtocolError> {
        match session {
            None => Ok((&mut self.table, 0, 0)),
            Some(id) => {
                let session = self
                    .registry
                    .get_mut(id)
                    .ok_or(ProtocolError::UnknownSession(id))?;
                let sesh_type = session.sesh_type;
                Ok((&mut session.table, sesh_type, id))
            }
        }
    }

    /// Table for an incoming packet's addressing; `None` when the session
    /// is unknown (answered softly, not as an error).
    fn table_in(&mut self, sesh_id: u64) -> Option<&mut StateTable> {
        if sesh_id == 0 {
            Some(&mut self.table)
        } else {
            self.registry.get_mut(sesh_id).map(|s| &mut s.table)
        }
    }
}

struct HandlerInner {
    role: Role,
    range: u16,
    base: u16,
    level: u8,
    service: Arc<dyn Service>,
    outbox: Outbox,
    state: Mutex<HandlerState>,
    /// Serializes enquiries: at most one Enquiry/Response pair in flight.
    enquiry: Mutex<()>,
}

/// Dispatch failure classes, each with its own wire answer.
enum Fault {
    /// No packet class / processor for this (type, role).
    Unroutable,
    /// Body failed to decode or validate.
    Decode(crate::error::CodecError),
    /// Processing itself failed.
    Failed(ProtocolError),
}

/// Public, clonable handle to one registered handler.
#[derive(Clone)]
pub struct Handler {
    inner: Arc<HandlerInner>,
}

impl Handler {
    pub(crate) fn spawn(
        role: Role,
        service: Arc<dyn Service>,
        cfg: HandlerConfig,
        outbox: Outbox,
    ) -> (Handler, mpsc::Sender<Inbound>, JoinHandle<()>) {
        let range = service.range();
        let inner = Arc::new(HandlerInner {
            role,
            range,
            base: range_base(range),
            level: cfg.level.into(),
            service: service.clone(),
            outbox,
            state: Mutex::new(HandlerState {
                table: StateTable::from_specs(service.states()),
                registry: SessionRegistry::new(cfg.max_sessions),
                pending_response: None,
            }),
            enquiry: Mutex::new(()),
        });
        let (tx, rx) = mpsc::channel(cfg.queue_capacity);
        let handler = Handler { inner };
        let consumer = tokio::spawn(run_consumer(handler.clone(), rx));
        (handler, tx, consumer)
    }

    /// Range index this handler claims.
    pub fn range(&self) -> u16 {
        self.inner.range
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Number of currently open sessions.
    pub async fn session_count(&self) -> usize {
        self.inner.state.lock().await.registry.len()
    }

    /// Lifecycle state label of an open session, `None` once it is gone.
    pub async fn session_lifecycle(&self, id: u64) -> Option<&'static str> {
        self.inner
            .state
            .lock()
            .await
            .registry
            .get(id)
            .map(|s| s.lifecycle.state())
    }

    /// Emit a packet in the service-defined part of this handler's range.
    pub async fn send_packet(&self, local_type: u8, body: Vec<u8>) -> Result<(), ProtocolError> {
        if local_type >= RESERVED_BASE {
            return Err(ProtocolError::RangeOutOfBounds(local_type as u16));
        }
        self.inner
            .outbox
            .send_frame(self.inner.base + local_type as u16, self.inner.level, body)
            .await
    }

    async fn send<P: Packet>(&self, packet: &P) -> Result<(), ProtocolError> {
        let body = packet.encode()?;
        self.inner
            .outbox
            .send_frame(self.inner.base + P::LOCAL as u16, self.inner.level, body)
            .await
    }

    // ------------------------------------------------------------------
    // State operations
    // ------------------------------------------------------------------

    /// Ask the peer for its value of a state. Resolves to `None` when the
    /// peer does not host it. Enquiries serialize per handler.
    pub async fn question_state(
        &self,
        state: u64,
        session: Option<u64>,
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        let _serialized = self.inner.enquiry.lock().await;
        let (tx, rx) = oneshot::channel();
        let (sesh_type, sesh_id) = {
            let mut st = self.inner.state.lock().await;
            let (_, sesh_type, sesh_id) = st.scope(session)?;
            st.pending_response = Some(tx);
            (sesh_type, sesh_id)
        };
        let packet = EnquiryPacket::new(state, sesh_type, sesh_id);
        if let Err(e) = self.send(&packet).await {
            self.inner.state.lock().await.pending_response = None;
            return Err(e);
        }
        rx.await.map_err(|_| ProtocolError::Aborted)
    }

    /// Propose our value of a state to the peer; resolves to the peer's
    /// confirm code.
    pub async fn tell_state(
        &self,
        state: u64,
        session: Option<u64>,
    ) -> Result<ConfirmCode, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        let (value, sesh_type, sesh_id) = {
            let mut st = self.inner.state.lock().await;
            let (table, sesh_type, sesh_id) = st.scope(session)?;
            let value = table
                .value(state)
                .unwrap_or_else(|| UNKNOWN_VALUE.to_vec());
            table.initiator(state).start_tell(tx)?;
            (value, sesh_type, sesh_id)
        };
        self.send(&TellPacket::new(state, value, sesh_type, sesh_id))
            .await?;
        rx.await.map_err(|_| ProtocolError::Aborted)
    }

    /// Ask the peer to push its value of a state via Tell; resolves to the
    /// pushed value once the exchange completes, `None` when the peer had
    /// nothing to push.
    pub async fn show_state(
        &self,
        state: u64,
        session: Option<u64>,
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        let (sesh_type, sesh_id) = {
            let mut st = self.inner.state.lock().await;
            let (table, sesh_type, sesh_id) = st.scope(session)?;
            table.initiator(state).start_show(tx)?;
            (sesh_type, sesh_id)
        };
        self.send(&ShowPacket::new(state, sesh_type, sesh_id))
            .await?;
        rx.await.map_err(|_| ProtocolError::Aborted)
    }

    /// Tell every listed state; true iff every one was answered YES. The
    /// result is decided by the first non-YES answer but every state is
    /// still told.
    pub async fn sync(&self, states: &[u64], session: Option<u64>) -> Result<bool, ProtocolError> {
        let mut all_yes = true;
        for state in states {
            let code = self.tell_state(*state, session).await?;
            if code != ConfirmCode::Yes {
                all_yes = false;
            }
        }
        Ok(all_yes)
    }

    /// Set our own value of a state (no wire traffic).
    pub async fn set_state(
        &self,
        state: u64,
        value: impl Into<Vec<u8>>,
        session: Option<u64>,
    ) -> Result<(), ProtocolError> {
        let mut st = self.inner.state.lock().await;
        let (table, _, _) = st.scope(session)?;
        let entry = table
            .states
            .get_mut(&state)
            .ok_or(ProtocolError::UnknownState(state))?;
        entry.value = Some(value.into());
        Ok(())
    }

    /// Read our own value of a state (no wire traffic).
    pub async fn state_value(
        &self,
        state: u64,
        session: Option<u64>,
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        let mut st = self.inner.state.lock().await;
        let (table, _, _) = st.scope(session)?;
        Ok(table.value(state))
    }

    /// Park until a proposal for `state` has been accepted, then return
    /// the accepted value.
    pub async fn wait_accepted(
        &self,
        state: u64,
        session: Option<u64>,
    ) -> Result<Vec<u8>, ProtocolError> {
        loop {
            let notify = {
                let mut st = self.inner.state.lock().await;
                let (table, _, _) = st.scope(session)?;
                let entry = table
                    .states
                    .get(&state)
                    .ok_or(ProtocolError::UnknownState(state))?;
                if entry.accepted {
                    if let Some(value) = entry.value.clone() {
                        return Ok(value);
                    }
                }
                entry.notify.clone()
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register before the re-check so a commit between the two
            // lock sections cannot be missed.
            notified.as_mut().enable();
            {
                let mut st = self.inner.state.lock().await;
                let (table, _, _) = st.scope(session)?;
                if let Some(entry) = table.states.get(&state) {
                    if entry.accepted {
                        if let Some(value) = entry.value.clone() {
                            return Ok(value);
                        }
                    }
                }
            }
            notified.await;
        }
    }

    // ------------------------------------------------------------------
    // Session operations
    // ------------------------------------------------------------------

    /// Open a session of `sesh_type` and await the peer's answer. On
    /// Accept (and Done) the session stays registered; on Refuse/Busy it
    /// is already gone when this resolves.
    pub async fn open_session(
        &self,
        sesh_type: u64,
    ) -> Result<(SessionOutcome, u64), ProtocolError> {
        if self.inner.role != Role::Client {
            return Err(ProtocolError::WrongSide);
        }
        let specs = self
            .inner
            .service
            .session_states(sesh_type)
            .ok_or(ProtocolError::UnknownSessionType(sesh_type))?;
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut st = self.inner.state.lock().await;
            let id = st.registry.allocate_id();
            let mut session = Session::initiated(sesh_type, id, specs);
            session.lifecycle.as_initiator()?.begin(tx)?;
            st.registry.insert(session);
            id
        };
        if let Err(e) = self.send(&StartPacket::new(sesh_type, id)).await {
            self.inner.state.lock().await.registry.remove(id);
            return Err(e);
        }
        let outcome = rx.await.map_err(|_| ProtocolError::Aborted)?;
        Ok((outcome, id))
    }

    /// Finish a session we started.
    pub async fn close_session(&self, id: u64) -> Result<(), ProtocolError> {
        if self.inner.role != Role::Client {
            return Err(ProtocolError::WrongSide);
        }
        let sesh_type = {
            let mut st = self.inner.state.lock().await;
            let session = st
                .registry
                .get_mut(id)
                .ok_or(ProtocolError::UnknownSession(id))?;
            session.lifecycle.as_initiator()?.finish()?;
            let sesh_type = session.sesh_type;
            st.registry.remove(id);
            sesh_type
        };
        self.send(&FinishPacket::new(sesh_type, id)).await
    }

    /// Responder-side: announce there is nothing more to do in a session.
    /// The peer still owes the Finish.
    pub async fn session_done(&self, id: u64) -> Result<(), ProtocolError> {
        if self.inner.role != Role::Server {
            return Err(ProtocolError::WrongSide);
        }
        let sesh_type = {
            let mut st = self.inner.state.lock().await;
            let session = st
                .registry
                .get_mut(id)
                .ok_or(ProtocolError::UnknownSession(id))?;
            session.lifecycle.as_responder()?.done()?;
            session.sesh_type
        };
        self.send(&DonePacket::new(sesh_type, id)).await
    }

    /// Scoped session acquisition: open, synchronize every session state,
    /// hand the running session to `f`, and finish it on every exit path.
    pub async fn with_session<F, Fut, T>(&self, sesh_type: u64, f: F) -> Result<T, ProtocolError>
    where
        F: FnOnce(SessionScope) -> Fut,
        Fut: Future<Output = Result<T, ProtocolError>>,
    {
        let (outcome, id) = self.open_session(sesh_type).await?;
        if outcome != SessionOutcome::Accept {
            return Err(ProtocolError::SessionRejected(outcome));
        }
        let mut state_ids: Vec<u64> = {
            let mut st = self.inner.state.lock().await;
            let (table, _, _) = st.scope(Some(id))?;
            table.states.keys().copied().collect()
        };
        state_ids.sort_unstable();
        match self.sync(&state_ids, Some(id)).await {
            Ok(true) => {}
            Ok(false) => {
                self.finish_quietly(id).await;
                return Err(ProtocolError::SessionNoSync);
            }
            Err(e) => {
                self.finish_quietly(id).await;
                return Err(e);
            }
        }
        let scope = SessionScope {
            handler: self.clone(),
            sesh_type,
            id,
        };
        let result = f(scope).await;
        self.finish_quietly(id).await;
        result
    }

    async fn finish_quietly(&self, id: u64) {
        if let Err(e) = self.close_session(id).await {
            warn!(session = id, error = %e, "failed to finish scoped session");
        }
    }

    // ------------------------------------------------------------------
    // Inbound processing
    // ------------------------------------------------------------------

    async fn process(&self, pkt_type: u16, level: u8, body: &[u8]) {
        let local = (pkt_type - self.inner.base) as u8;
        // Silent mode: anything that goes wrong while handling a peer's
        // Unknown/Error must not be answered with another one.
        let silent = local == UNKNOWN_PACKET || local == ERROR_PACKET;
        match self.dispatch(local, body).await {
            Ok(()) => {}
            Err(Fault::Unroutable) => {
                warn!(
                    range = self.inner.range,
                    pkt_type, "no processor for packet; answering unknown"
                );
                if !silent {
                    self.reply_unknown(pkt_type, level).await;
                }
            }
            Err(Fault::Decode(e)) => {
                warn!(range = self.inner.range, pkt_type, error = %e, "undecodable packet body");
                if !silent {
                    self.reply_error(ErrorCode::Malformed, pkt_type, level).await;
                }
            }
            Err(Fault::Failed(e)) => {
                error!(range = self.inner.range, pkt_type, error = %e, "packet processing failed");
                if !silent {
                    self.reply_error(ErrorCode::Unexpected, pkt_type, level).await;
                }
            }
        }
    }

    async fn dispatch(&self, local: u8, body: &[u8]) -> Result<(), Fault> {
        match (local, self.inner.role) {
            (ENQUIRY_PACKET, _) => {
                let p = EnquiryPacket::decode(body).map_err(Fault::Decode)?;
                self.process_enquiry(p).await.map_err(Fault::Failed)
            }
            (RESPONSE_PACKET, _) => {
                let p = ResponsePacket::decode(body).map_err(Fault::Decode)?;
                self.process_response(p).await.map_err(Fault::Failed)
            }
            (TELL_PACKET, _) => {
                let p = TellPacket::decode(body).map_err(Fault::Decode)?;
                self.process_tell(p).await.map_err(Fault::Failed)
            }
            (SHOW_PACKET, _) => {
                let p = ShowPacket::decode(body).map_err(Fault::Decode)?;
                self.process_show(p).await.map_err(Fault::Failed)
            }
            (CONFIRM_PACKET, _) => {
                let p = ConfirmPacket::decode(body).map_err(Fault::Decode)?;
                self.process_confirm(p).await.map_err(Fault::Failed)
            }
            (START_PACKET, Role::Server) => {
                let p = StartPacket::decode(body).map_err(Fault::Decode)?;
                self.process_start(p).await.map_err(Fault::Failed)
            }
            (FINISH_PACKET, Role::Server) => {
                let p = FinishPacket::decode(body).map_err(Fault::Decode)?;
                self.process_finish(p).await.map_err(Fault::Failed)
            }
            (ACCEPT_PACKET, Role::Client) => {
                let p = AcceptPacket::decode(body).map_err(Fault::Decode)?;
                self.process_answer(p.sesh_type, p.sesh_id, label::ACCEPT, SessionOutcome::Accept)
                    .await
                    .map_err(Fault::Failed)
            }
            (REFUSE_PACKET, Role::Client) => {
                let p = RefusePacket::decode(body).map_err(Fault::Decode)?;
                self.process_rejection(p.sesh_type, p.sesh_id, label::REFUSE, SessionOutcome::Refuse)
                    .await
                    .map_err(Fault::Failed)
            }
            (BUSY_PACKET, Role::Client) => {
                let p = BusyPacket::decode(body).map_err(Fault::Decode)?;
                self.process_rejection(p.sesh_type, p.sesh_id, label::BUSY, SessionOutcome::Busy)
                    .await
                    .map_err(Fault::Failed)
            }
            (DONE_PACKET, Role::Client) => {
                let p = DonePacket::decode(body).map_err(Fault::Decode)?;
                self.process_answer(p.sesh_type, p.sesh_id, label::DONE, SessionOutcome::Done)
                    .await
                    .map_err(Fault::Failed)
            }
            (UNKNOWN_PACKET, _) => {
                let p = UnknownPacket::decode(body).map_err(Fault::Decode)?;
                warn!(
                    range = self.inner.range,
                    offending_type = p.pkt_type,
                    offending_level = p.level,
                    "peer could not route a packet of ours"
                );
                Ok(())
            }
            (ERROR_PACKET, _) => {
                let p = ErrorPacket::decode(body).map_err(Fault::Decode)?;
                error!(
                    range = self.inner.range,
                    offending_type = p.pkt_type,
                    code = ?ErrorCode::from_wire(p.error),
                    "peer reported a processing failure"
                );
                Ok(())
            }
            (local, _) if local < RESERVED_BASE => {
                match self
                    .inner
                    .service
                    .handle_packet(local, body, self)
                    .await
                {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(Fault::Unroutable),
                    Err(e) => Err(Fault::Failed(e)),
                }
            }
            // A reserved packet on the side that never processes it.
            _ => Err(Fault::Unroutable),
        }
    }

    async fn process_enquiry(&self, p: EnquiryPacket) -> Result<(), ProtocolError> {
        let value = {
            let mut st = self.inner.state.lock().await;
            st.table_in(p.sesh_id)
                .and_then(|table| table.value(p.state))
                .unwrap_or_else(|| UNKNOWN_VALUE.to_vec())
        };
        self.send(&ResponsePacket::new(p.state, value, p.sesh_type, p.sesh_id))
            .await
    }

    async fn process_response(&self, p: ResponsePacket) -> Result<(), ProtocolError> {
        let known = p.value != UNKNOWN_VALUE;
        let waiter = {
            let mut st = self.inner.state.lock().await;
            if known {
                if let Some(table) = st.table_in(p.sesh_id) {
                    table
                        .states
                        .entry(p.state)
                        .or_insert_with(|| {
                            crate::exchange::NamedState::from_spec(StateSpec::new(
                                crate::exchange::StateMode::Fact,
                            ))
                        })
                        .value = Some(p.value.clone());
                }
            }
            st.pending_response.take()
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(known.then(|| p.value));
                Ok(())
            }
            None => {
                debug!(state = p.state, "response with no enquiry in flight; dropped");
                Ok(())
            }
        }
    }

    async fn process_tell(&self, p: TellPacket) -> Result<(), ProtocolError> {
        let code = {
            let mut st = self.inner.state.lock().await;
            let table = match st.table_in(p.sesh_id) {
                Some(table) => table,
                None => {
                    drop(st);
                    return self.confirm(&p, ConfirmCode::NoComment).await;
                }
            };
            let solicited = table
                .initiators
                .get(&p.state)
                .map(|m| m.awaiting_push())
                .unwrap_or(false);
            if solicited {
                self.accept_push(table, &p)?
            } else {
                match self.accept_proposal(table, &p)? {
                    Some(code) => code,
                    None => ConfirmCode::NoComment,
                }
            }
        };
        self.confirm(&p, code).await
    }

    /// The peer answered our Show with this Tell.
    fn accept_push(&self, table: &mut StateTable, p: &TellPacket) -> Result<ConfirmCode, ProtocolError> {
        let absent = p.value == UNKNOWN_VALUE;
        let code = if absent {
            ConfirmCode::NoComment
        } else {
            match table.states.get(&p.state).and_then(|s| s.check.clone()) {
                Some(check) => check(&p.value),
                // We asked for this value; accept it unless a check objects.
                None => ConfirmCode::Yes,
            }
        };
        if code == ConfirmCode::Yes {
            table
                .states
                .entry(p.state)
                .or_insert_with(|| {
                    crate::exchange::NamedState::from_spec(StateSpec::new(
                        crate::exchange::StateMode::Fact,
                    ))
                })
                .commit(p.value.clone());
        }
        let pushed = (code == ConfirmCode::Yes).then(|| p.value.clone());
        if let Some(machine) = table.initiators.get_mut(&p.state) {
            machine.pushed(code, pushed)?;
        }
        Ok(code)
    }

    /// The peer proposed a value on its own initiative.
    fn accept_proposal(
        &self,
        table: &mut StateTable,
        p: &TellPacket,
    ) -> Result<Option<ConfirmCode>, ProtocolError> {
        if !table.states.contains_key(&p.state) {
            return Ok(None);
        }
        {
            let machine = table.responders.entry(p.state).or_default();
            machine.reclaim();
            machine.telling(p.value.clone())?;
        }
        let code = {
            let entry = table
                .states
                .get_mut(&p.state)
                .ok_or(ProtocolError::UnknownState(p.state))?;
            if p.value == UNKNOWN_VALUE {
                ConfirmCode::NoComment
            } else if entry.mode == crate::exchange::StateMode::Once && entry.accepted {
                ConfirmCode::No
            } else {
                match &entry.check {
                    Some(check) => check(&p.value),
                    None => ConfirmCode::NoComment,
                }
            }
        };
        if code == ConfirmCode::Yes {
            if let Some(entry) = table.states.get_mut(&p.state) {
                entry.commit(p.value.clone());
            }
        }
        if let Some(machine) = table.responders.get_mut(&p.state) {
            machine.complete()?;
        }
        Ok(Some(code))
    }

    async fn confirm(&self, p: &TellPacket, code: ConfirmCode) -> Result<(), ProtocolError> {
        self.send(&ConfirmPacket::new(
            p.state,
            code as u64,
            p.sesh_type,
            p.sesh_id,
        ))
        .await
    }

    async fn process_show(&self, p: ShowPacket) -> Result<(), ProtocolError> {
        let value = {
            let mut st = self.inner.state.lock().await;
            let table = match st.table_in(p.sesh_id) {
                Some(table) => table,
                None => {
                    drop(st);
                    return self
                        .send(&TellPacket::new(
                            p.state,
                            UNKNOWN_VALUE.to_vec(),
                            p.sesh_type,
                            p.sesh_id,
                        ))
                        .await;
                }
            };
            {
                let machine = table.responders.entry(p.state).or_default();
                machine.reclaim();
                machine.showing()?;
            }
            let value = table
                .value(p.state)
                .unwrap_or_else(|| UNKNOWN_VALUE.to_vec());
            if let Some(machine) = table.responders.get_mut(&p.state) {
                machine.pushing()?;
            }
            value
        };
        self.send(&TellPacket::new(p.state, value, p.sesh_type, p.sesh_id))
            .await
    }

    async fn process_confirm(&self, p: ConfirmPacket) -> Result<(), ProtocolError> {
        let code = ConfirmCode::from_wire(p.answer).unwrap_or(ConfirmCode::NoComment);
        let mut st = self.inner.state.lock().await;
        let table = match st.table_in(p.sesh_id) {
            Some(table) => table,
            None if code == ConfirmCode::NoComment => return Ok(()),
            None => return Err(ProtocolError::UnknownSession(p.sesh_id)),
        };
        // A confirm for a Tell we pushed in answer to the peer's Show.
        if table
            .responders
            .get(&p.proposal)
            .map(|m| m.awaiting_confirm())
            .unwrap_or(false)
        {
            if let Some(machine) = table.responders.get_mut(&p.proposal) {
                machine.complete()?;
            }
            return Ok(());
        }
        // A confirm for a Tell we initiated.
        match table.initiators.get_mut(&p.proposal) {
            Some(machine) if machine.state() == label::TELL => machine.confirmed(code),
            _ if code == ConfirmCode::NoComment => {
                // No exchange to speak of; a shrug on an unknown state is
                // ignored by rule.
                Ok(())
            }
            _ => Err(ProtocolError::UnknownState(p.proposal)),
        }
    }

    async fn process_start(&self, p: StartPacket) -> Result<(), ProtocolError> {
        let specs = self.inner.service.session_states(p.sesh_type);
        {
            let st = self.inner.state.lock().await;
            if st.registry.at_capacity() {
                drop(st);
                debug!(
                    range = self.inner.range,
                    sesh_id = p.sesh_id,
                    "session cap reached; answering busy"
                );
                return self.send(&BusyPacket::new(p.sesh_type, p.sesh_id)).await;
            }
            if st.registry.id_reused(p.sesh_id) || specs.is_none() {
                drop(st);
                debug!(
                    range = self.inner.range,
                    sesh_type = p.sesh_type,
                    sesh_id = p.sesh_id,
                    "refusing session (id reuse or unknown type)"
                );
                return self.send(&RefusePacket::new(p.sesh_type, p.sesh_id)).await;
            }
        }
        if let Err(e) = self
            .inner
            .service
            .prepare_session(p.sesh_type, p.sesh_id)
            .await
        {
            debug!(sesh_id = p.sesh_id, error = %e, "prepare hook vetoed session");
            return self.send(&RefusePacket::new(p.sesh_type, p.sesh_id)).await;
        }
        {
            let mut st = self.inner.state.lock().await;
            let mut session =
                Session::responded(p.sesh_type, p.sesh_id, specs.unwrap_or_default());
            session.lifecycle.as_responder()?.begin()?;
            st.registry.insert(session);
        }
        self.send(&AcceptPacket::new(p.sesh_type, p.sesh_id)).await
    }

    async fn process_finish(&self, p: FinishPacket) -> Result<(), ProtocolError> {
        let mut st = self.inner.state.lock().await;
        let session = st
            .registry
            .get_mut(p.sesh_id)
            .ok_or(ProtocolError::UnknownSession(p.sesh_id))?;
        match session.check_type(p.sesh_type) {
            Err(e) => {
                // Unwind the inconsistent session; the handler itself
                // carries on.
                st.registry.remove(p.sesh_id);
                Err(e)
            }
            Ok(()) => {
                session.lifecycle.as_responder()?.finish()?;
                st.registry.remove(p.sesh_id);
                Ok(())
            }
        }
    }

    /// Accept and Done keep the session registered.
    async fn process_answer(
        &self,
        sesh_type: u64,
        sesh_id: u64,
        to: &'static str,
        outcome: SessionOutcome,
    ) -> Result<(), ProtocolError> {
        let mut st = self.inner.state.lock().await;
        let session = st
            .registry
            .get_mut(sesh_id)
            .ok_or(ProtocolError::UnknownSession(sesh_id))?;
        match session.check_type(sesh_type) {
            Err(e) => {
                st.registry.remove(sesh_id);
                Err(e)
            }
            Ok(()) => session.lifecycle.as_initiator()?.answered(to, outcome),
        }
    }

    /// Refuse and Busy are terminal: the session is dropped.
    async fn process_rejection(
        &self,
        sesh_type: u64,
        sesh_id: u64,
        to: &'static str,
        outcome: SessionOutcome,
    ) -> Result<(), ProtocolError> {
        let mut st = self.inner.state.lock().await;
        let session = st
            .registry
            .get_mut(sesh_id)
            .ok_or(ProtocolError::UnknownSession(sesh_id))?;
        match session.check_type(sesh_type) {
            Err(e) => {
                st.registry.remove(sesh_id);
                Err(e)
            }
            Ok(()) => {
                let lifecycle = session.lifecycle.as_initiator()?;
                lifecycle.answered(to, outcome)?;
                lifecycle.conclude()?;
                st.registry.remove(sesh_id);
                Ok(())
            }
        }
    }

    async fn reply_unknown(&self, offender_type: u16, offender_level: u8) {
        let packet = UnknownPacket::new(offender_type as u64, clamp_level(offender_level), 0);
        let local = UNKNOWN_PACKET as u16;
        match packet.encode() {
            Ok(body) => {
                if let Err(e) = self
                    .inner
                    .outbox
                    .send_frame(self.inner.base + local, self.inner.level, body)
                    .await
                {
                    debug!(error = %e, "could not answer with unknown packet");
                }
            }
            Err(e) => debug!(error = %e, "could not encode unknown packet"),
        }
    }

    async fn reply_error(&self, code: ErrorCode, offender_type: u16, offender_level: u8) {
        let packet = ErrorPacket::new(
            offender_type as u64,
            clamp_level(offender_level),
            0,
            code as u64,
        );
        let local = ERROR_PACKET as u16;
        match packet.encode() {
            Ok(body) => {
                if let Err(e) = self
                    .inner
                    .outbox
                    .send_frame(self.inner.base + local, self.inner.level, body)
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

/// Single consumer of one handler's bounded queue. Exits on the shutdown
/// sentinel (or when every queue sender is gone).
async fn run_consumer(handler: Handler, mut rx: mpsc::Receiver<Inbound>) {
    debug!(range = handler.inner.range, "handler consumer started");
    while let Some(item) = rx.recv().await {
        match item {
            Inbound::Shutdown => break,
            Inbound::Frame {
                pkt_type,
                level,
                body,
            } => handler.process(pkt_type, level, &body).await,
        }
    }
    // Drop any parked enquiry so its caller observes the shutdown.
    handler.inner.state.lock().await.pending_response = None;
    debug!(range = handler.inner.range, "handler consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FrameHeader, HEADER_LEN};
    use crate::exchange::StateMode;
    use crate::protocol::Outbound;

    const RANGE: u16 = 3;
    const BASE: u16 = 256;
    const STATE: u64 = 42;
    const SESH_TYPE: u64 = 7;

    struct StubService;

    impl Service for StubService {
        fn range(&self) -> u16 {
            RANGE
        }

        fn states(&self) -> Vec<(u64, StateSpec)> {
            vec![(
                STATE,
                StateSpec::new(StateMode::Mediate)
                    .with_value(b"v1".to_vec())
                    .with_check(|v| {
                        if v == b"bad" {
                            ConfirmCode::No
                        } else {
                            ConfirmCode::Yes
                        }
                    }),
            )]
        }

        fn session_states(&self, sesh_type: u64) -> Option<Vec<(u64, StateSpec)>> {
            (sesh_type == SESH_TYPE).then(Vec::new)
        }
    }

    fn spawn_handler(
        role: Role,
        cfg: HandlerConfig,
    ) -> (Handler, mpsc::Receiver<Outbound>, mpsc::Sender<Inbound>) {
        let (tx, rx) = mpsc::channel(16);
        let (handler, queue, _consumer) =
            Handler::spawn(role, Arc::new(StubService), cfg, Outbox::stub(tx));
        (handler, rx, queue)
    }

    /// Pop the next emitted frame, if any.
    fn reply(rx: &mut mpsc::Receiver<Outbound>) -> Option<(FrameHeader, Vec<u8>)> {
        match rx.try_recv() {
            Ok(Outbound::Frame(frame)) => {
                let header = FrameHeader::decode(&frame[..HEADER_LEN]).unwrap();
                Some((header, frame[HEADER_LEN..].to_vec()))
            }
            _ => None,
        }
    }

    #[tokio::test]
    async fn enquiry_dispatches_and_answers_response() {
        let (handler, mut rx, _queue) = spawn_handler(Role::Server, HandlerConfig::default());
        let body = EnquiryPacket::new(STATE, 0, 0).encode().unwrap();
        handler
            .process(BASE + ENQUIRY_PACKET as u16, 1, &body)
            .await;

        let (header, body) = reply(&mut rx).unwrap();
        assert_eq!(header.pkt_type, BASE + RESPONSE_PACKET as u16);
        let response = ResponsePacket::decode(&body).unwrap();
        assert_eq!(response.state, STATE);
        assert_eq!(response.value, b"v1".to_vec());
        assert!(reply(&mut rx).is_none());
    }

    #[tokio::test]
    async fn tell_dispatch_runs_check_and_commits_on_yes() {
        let (handler, mut rx, _queue) = spawn_handler(Role::Server, HandlerConfig::default());
        let body = TellPacket::new(STATE, b"fresh".to_vec(), 0, 0).encode().unwrap();
        handler.process(BASE + TELL_PACKET as u16, 1, &body).await;

        let (header, body) = reply(&mut rx).unwrap();
        assert_eq!(header.pkt_type, BASE + CONFIRM_PACKET as u16);
        let confirm = ConfirmPacket::decode(&body).unwrap();
        assert_eq!(ConfirmCode::from_wire(confirm.answer), Some(ConfirmCode::Yes));
        assert_eq!(
            handler.state_value(STATE, None).await.unwrap().as_deref(),
            Some(&b"fresh"[..])
        );
    }

    #[tokio::test]
    async fn tell_dispatch_denied_leaves_value() {
        let (handler, mut rx, _queue) = spawn_handler(Role::Server, HandlerConfig::default());
        let body = TellPacket::new(STATE, b"bad".to_vec(), 0, 0).encode().unwrap();
        handler.process(BASE + TELL_PACKET as u16, 1, &body).await;

        let (_, body) = reply(&mut rx).unwrap();
        let confirm = ConfirmPacket::decode(&body).unwrap();
        assert_eq!(ConfirmCode::from_wire(confirm.answer), Some(ConfirmCode::No));
        assert_eq!(
            handler.state_value(STATE, None).await.unwrap().as_deref(),
            Some(&b"v1"[..])
        );
    }

    #[tokio::test]
    async fn lifecycle_packet_on_wrong_side_is_unroutable() {
        // A server never processes Accept; the reply also proves level
        // clamping, since 0 is not a legal level field value.
        let (handler, mut rx, _queue) = spawn_handler(Role::Server, HandlerConfig::default());
        let pkt_type = BASE + ACCEPT_PACKET as u16;
        let body = AcceptPacket::new(SESH_TYPE, 1).encode().unwrap();
        handler.process(pkt_type, 0, &body).await;

        let (header, body) = reply(&mut rx).unwrap();
        assert_eq!(header.pkt_type, BASE + UNKNOWN_PACKET as u16);
        let unknown = UnknownPacket::decode(&body).unwrap();
        assert_eq!(unknown.pkt_type, pkt_type as u64);
        assert_eq!(unknown.level, 1);
        assert_eq!(unknown.process, 0);
    }

    #[tokio::test]
    async fn unclaimed_service_code_is_unroutable() {
        let (handler, mut rx, _queue) = spawn_handler(Role::Server, HandlerConfig::default());
        handler.process(BASE + 5, 2, b"").await;

        let (header, body) = reply(&mut rx).unwrap();
        assert_eq!(header.pkt_type, BASE + UNKNOWN_PACKET as u16);
        let unknown = UnknownPacket::decode(&body).unwrap();
        assert_eq!(unknown.pkt_type, (BASE + 5) as u64);
        assert_eq!(unknown.level, 2);
    }

    #[tokio::test]
    async fn undecodable_body_maps_to_malformed() {
        let (handler, mut rx, _queue) = spawn_handler(Role::Server, HandlerConfig::default());
        let pkt_type = BASE + ENQUIRY_PACKET as u16;
        handler.process(pkt_type, 1, b"\x01\x01").await;

        let (header, body) = reply(&mut rx).unwrap();
        assert_eq!(header.pkt_type, BASE + ERROR_PACKET as u16);
        let error = ErrorPacket::decode(&body).unwrap();
        assert_eq!(error.pkt_type, pkt_type as u64);
        assert_eq!(ErrorCode::from_wire(error.error), Some(ErrorCode::Malformed));
    }

    #[tokio::test]
    async fn failed_processing_maps_to_unexpected() {
        // A Finish for a session this handler never held is a hard error.
        let (handler, mut rx, _queue) = spawn_handler(Role::Server, HandlerConfig::default());
        let body = FinishPacket::new(SESH_TYPE, 99).encode().unwrap();
        handler.process(BASE + FINISH_PACKET as u16, 1, &body).await;

        let (header, body) = reply(&mut rx).unwrap();
        assert_eq!(header.pkt_type, BASE + ERROR_PACKET as u16);
        let error = ErrorPacket::decode(&body).unwrap();
        assert_eq!(
            ErrorCode::from_wire(error.error),
            Some(ErrorCode::Unexpected)
        );
    }

    #[tokio::test]
    async fn unknown_and_error_processing_is_silent() {
        let (handler, mut rx, _queue) = spawn_handler(Role::Server, HandlerConfig::default());

        let unknown = UnknownPacket::new(300, 1, 0).encode().unwrap();
        handler
            .process(BASE + UNKNOWN_PACKET as u16, 1, &unknown)
            .await;
        let error = ErrorPacket::new(300, 1, 0, ErrorCode::Unexpected as u64)
            .encode()
            .unwrap();
        handler.process(BASE + ERROR_PACKET as u16, 1, &error).await;
        // Failures inside the silent path are swallowed too.
        handler
            .process(BASE + UNKNOWN_PACKET as u16, 1, b"\xff")
            .await;
        handler.process(BASE + ERROR_PACKET as u16, 1, b"\xff").await;

        assert!(reply(&mut rx).is_none());
    }

    #[tokio::test]
    async fn start_dispatch_walks_busy_refuse_accept_ladder() {
        let (handler, mut rx, _queue) = spawn_handler(
            Role::Server,
            HandlerConfig {
                max_sessions: 1,
                ..Default::default()
            },
        );

        let start = |id: u64, ty: u64| StartPacket::new(ty, id).encode().unwrap();
        handler
            .process(BASE + START_PACKET as u16, 1, &start(1, SESH_TYPE))
            .await;
        let (header, _) = reply(&mut rx).unwrap();
        assert_eq!(header.pkt_type, BASE + ACCEPT_PACKET as u16);
        assert_eq!(handler.session_count().await, 1);

        // Cap reached: answered Busy, not Refuse.
        handler
            .process(BASE + START_PACKET as u16, 1, &start(2, SESH_TYPE))
            .await;
        let (header, _) = reply(&mut rx).unwrap();
        assert_eq!(header.pkt_type, BASE + BUSY_PACKET as u16);
        assert_eq!(handler.session_count().await, 1);
    }

    #[tokio::test]
    async fn start_dispatch_refuses_reuse_and_unknown_type() {
        let (handler, mut rx, _queue) = spawn_handler(Role::Server, HandlerConfig::default());

        let start = |id: u64, ty: u64| StartPacket::new(ty, id).encode().unwrap();
        handler
            .process(BASE + START_PACKET as u16, 1, &start(1, SESH_TYPE))
            .await;
        let (header, _) = reply(&mut rx).unwrap();
        assert_eq!(header.pkt_type, BASE + ACCEPT_PACKET as u16);

        // An id at or below the highest seen is a reuse.
        handler
            .process(BASE + START_PACKET as u16, 1, &start(1, SESH_TYPE))
            .await;
        let (header, _) = reply(&mut rx).unwrap();
        assert_eq!(header.pkt_type, BASE + REFUSE_PACKET as u16);

        handler
            .process(BASE + START_PACKET as u16, 1, &start(2, 99))
            .await;
        let (header, _) = reply(&mut rx).unwrap();
        assert_eq!(header.pkt_type, BASE + REFUSE_PACKET as u16);
        assert_eq!(handler.session_count().await, 1);
    }

    #[tokio::test]
    async fn confirm_shrug_on_unknown_state_is_ignored() {
        let (handler, mut rx, _queue) = spawn_handler(Role::Client, HandlerConfig::default());

        // NO_COMMENT with no exchange in flight: dropped without a reply.
        let shrug = ConfirmPacket::new(5, 0, 0, 0).encode().unwrap();
        handler.process(BASE + CONFIRM_PACKET as u16, 1, &shrug).await;
        assert!(reply(&mut rx).is_none());

        // Any other answer with no exchange is a processing failure.
        let denial = ConfirmPacket::new(5, 2, 0, 0).encode().unwrap();
        handler
            .process(BASE + CONFIRM_PACKET as u16, 1, &denial)
            .await;
        let (header, body) = reply(&mut rx).unwrap();
        assert_eq!(header.pkt_type, BASE + ERROR_PACKET as u16);
        let error = ErrorPacket::decode(&body).unwrap();
        assert_eq!(
            ErrorCode::from_wire(error.error),
            Some(ErrorCode::Unexpected)
        );
    }
}

/// A running, synchronized session scoped to a `with_session` closure.
pub struct SessionScope {
    handler: Handler,
    pub sesh_type: u64,
    pub id: u64,
}

impl SessionScope {
    pub async fn question_state(&self, state: u64) -> Result<Option<Vec<u8>>, ProtocolError> {
        self.handler.question_state(state, Some(self.id)).await
    }

    pub async fn tell_state(&self, state: u64) -> Result<ConfirmCode, ProtocolError> {
        self.handler.tell_state(state, Some(self.id)).await
    }

    pub async fn show_state(&self, state: u64) -> Result<Option<Vec<u8>>, ProtocolError> {
        self.handler.show_state(state, Some(self.id)).await
    }

    pub async fn set_state(
        &self,
        state: u64,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), ProtocolError> {
        self.handler.set_state(state, value, Some(self.id)).await
    }

    pub async fn state_value(&self, state: u64) -> Result<Option<Vec<u8>>, ProtocolError> {
        self.handler.state_value(state, Some(self.id)).await
    }
}
