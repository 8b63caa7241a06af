//! # Sessions and Lifecycle Machines
//!
//! A session is a bounded conversation within a handler, identified by
//! `(type, id)`. Both sides hold a session object with the same identity
//! but side-specific lifecycle machines: the initiator walks
//! `start -> accept|refuse|busy|done -> finish`, the responder only ever
//! follows. The initiator is the finalizer — only the side that issued
//! Start may issue Finish.
//!
//! Session ids are allocated by the initiator, starting at 1 and strictly
//! increasing; the responder refuses Starts that reuse an id it has
//! already seen.

use crate::error::ProtocolError;
use crate::exchange::{StateSpec, StateTable};
use crate::packet::SessionOutcome;
use crate::waypoint::{label, TransitionMap, Waypoint};
use std::collections::HashMap;
use tokio::sync::oneshot;

const INITIATOR_EDGES: TransitionMap = &[
    (label::READY, &[label::START]),
    (
        label::START,
        &[label::ACCEPT, label::REFUSE, label::DONE, label::BUSY],
    ),
    (label::ACCEPT, &[label::FINISH, label::DONE]),
    (label::DONE, &[label::FINISH]),
    (label::REFUSE, &[label::ACCOMPLISHED]),
    (label::BUSY, &[label::ACCOMPLISHED]),
    (label::FINISH, &[label::ACCOMPLISHED]),
];

const RESPONDER_EDGES: TransitionMap = &[
    (label::READY, &[label::START]),
    (label::START, &[label::FINISH, label::DONE]),
    (label::DONE, &[label::FINISH]),
    (label::FINISH, &[label::ACCOMPLISHED]),
];

/// Lifecycle machine on the side that issued Start.
pub struct InitiatorLifecycle {
    machine: Waypoint,
    /// Resolved once with the peer's answer to Start (or Done).
    outcome: Option<oneshot::Sender<SessionOutcome>>,
}

impl InitiatorLifecycle {
    pub fn new() -> Self {
        Self {
            machine: Waypoint::new(label::READY, INITIATOR_EDGES),
            outcome: None,
        }
    }

    pub fn state(&self) -> &'static str {
        self.machine.state()
    }

    /// `ready -> start`, arming the outcome slot.
    pub fn begin(&mut self, outcome: oneshot::Sender<SessionOutcome>) -> Result<(), ProtocolError> {
        self.machine.goto(label::START)?;
        self.outcome = Some(outcome);
        Ok(())
    }

    /// Record the peer's answer and resolve the outcome slot.
    pub fn answered(
        &mut self,
        to: &'static str,
        outcome: SessionOutcome,
    ) -> Result<(), ProtocolError> {
        self.machine.goto(to)?;
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(outcome);
        }
        Ok(())
    }

    /// `-> finish -> accomplished`; legal from accept or done only.
    pub fn finish(&mut self) -> Result<(), ProtocolError> {
        self.machine.goto(label::FINISH)?;
        self.machine.goto(label::ACCOMPLISHED)
    }

    /// Terminal transition after a refuse or busy answer.
    pub fn conclude(&mut self) -> Result<(), ProtocolError> {
        self.machine.goto(label::ACCOMPLISHED)
    }
}

impl Default for InitiatorLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle machine on the side that accepted Start.
pub struct ResponderLifecycle {
    machine: Waypoint,
}

impl ResponderLifecycle {
    pub fn new() -> Self {
        Self {
            machine: Waypoint::new(label::READY, RESPONDER_EDGES),
        }
    }

    pub fn state(&self) -> &'static str {
        self.machine.state()
    }

    pub fn begin(&mut self) -> Result<(), ProtocolError> {
        self.machine.goto(label::START)
    }

    /// Nothing more to do; the peer still owes us a Finish.
    pub fn done(&mut self) -> Result<(), ProtocolError> {
        self.machine.goto(label::DONE)
    }

    pub fn finish(&mut self) -> Result<(), ProtocolError> {
        self.machine.goto(label::FINISH)?;
        self.machine.goto(label::ACCOMPLISHED)
    }
}

impl Default for ResponderLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Side-specific lifecycle of one session.
pub enum Lifecycle {
    Initiator(InitiatorLifecycle),
    Responder(ResponderLifecycle),
}

impl Lifecycle {
    pub fn state(&self) -> &'static str {
        match self {
            Lifecycle::Initiator(m) => m.state(),
            Lifecycle::Responder(m) => m.state(),
        }
    }

    pub fn as_initiator(&mut self) -> Result<&mut InitiatorLifecycle, ProtocolError> {
        match self {
            Lifecycle::Initiator(m) => Ok(m),
            Lifecycle::Responder(_) => Err(ProtocolError::WrongSide),
        }
    }

    pub fn as_responder(&mut self) -> Result<&mut ResponderLifecycle, ProtocolError> {
        match self {
            Lifecycle::Responder(m) => Ok(m),
            Lifecycle::Initiator(_) => Err(ProtocolError::WrongSide),
        }
    }
}

/// One bounded conversation: identity, lifecycle, and session-scoped
/// states with their exchange machines.
pub struct Session {
    pub sesh_type: u64,
    pub id: u64,
    pub lifecycle: Lifecycle,
    pub table: StateTable,
}

impl Session {
    pub fn initiated(sesh_type: u64, id: u64, states: Vec<(u64, StateSpec)>) -> Self {
        Self {
            sesh_type,
            id,
            lifecycle: Lifecycle::Initiator(InitiatorLifecycle::new()),
            table: StateTable::from_specs(states),
        }
    }

    pub fn responded(sesh_type: u64, id: u64, states: Vec<(u64, StateSpec)>) -> Self {
        Self {
            sesh_type,
            id,
            lifecycle: Lifecycle::Responder(ResponderLifecycle::new()),
            table: StateTable::from_specs(states),
        }
    }

    /// Verify a lifecycle packet's announced type against the one recorded
    /// at Start.
    pub fn check_type(&self, sesh_type: u64) -> Result<(), ProtocolError> {
        if sesh_type != self.sesh_type {
            return Err(ProtocolError::SessionTypeInconsistency {
                id: self.id,
                expected: self.sesh_type,
                got: sesh_type,
            });
        }
        Ok(())
    }
}

/// Active sessions of one handler.
///
/// The registry enforces the session cap on the responding side and the
/// monotonic-id rule on both.
pub struct SessionRegistry {
    sessions: HashMap<u64, Session>,
    /// Next id to hand to `allocate_id` (initiator side).
    next_id: u64,
    /// Highest id ever observed (responder side); Starts at or below it
    /// are refused as reuse.
    highest_seen: u64,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            next_id: 1,
            highest_seen: 0,
            max_sessions,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn at_capacity(&self) -> bool {
        self.sessions.len() >= self.max_sessions
    }

    /// Allocate the next session id, monotonically increasing from 1.
    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Whether a Start for `id` would reuse an id this side has seen.
    pub fn id_reused(&self, id: u64) -> bool {
        id <= self.highest_seen || self.sessions.contains_key(&id)
    }

    pub fn insert(&mut self, session: Session) {
        self.highest_seen = self.highest_seen.max(session.id);
        self.sessions.insert(session.id, session);
    }

    pub fn get(&self, id: u64) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn remove(&mut self, id: u64) -> Option<Session> {
        self.sessions.remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiator_accept_finish_path() {
        let mut lc = InitiatorLifecycle::new();
        let (tx, mut rx) = oneshot::channel();
        lc.begin(tx).unwrap();
        lc.answered(label::ACCEPT, SessionOutcome::Accept).unwrap();
        assert_eq!(rx.try_recv().unwrap(), SessionOutcome::Accept);
        lc.finish().unwrap();
        assert_eq!(lc.state(), label::ACCOMPLISHED);
    }

    #[test]
    fn initiator_refuse_concludes() {
        let mut lc = InitiatorLifecycle::new();
        let (tx, mut rx) = oneshot::channel();
        lc.begin(tx).unwrap();
        lc.answered(label::REFUSE, SessionOutcome::Refuse).unwrap();
        assert_eq!(rx.try_recv().unwrap(), SessionOutcome::Refuse);
        lc.conclude().unwrap();
        assert_eq!(lc.state(), label::ACCOMPLISHED);
    }

    #[test]
    fn finish_before_accept_is_illegal() {
        let mut lc = InitiatorLifecycle::new();
        let (tx, _rx) = oneshot::channel();
        lc.begin(tx).unwrap();
        assert!(matches!(
            lc.finish(),
            Err(ProtocolError::IllegalTransition { .. })
        ));
        assert_eq!(lc.state(), label::START);
    }

    #[test]
    fn responder_done_then_finish() {
        let mut lc = ResponderLifecycle::new();
        lc.begin().unwrap();
        lc.done().unwrap();
        lc.finish().unwrap();
        assert_eq!(lc.state(), label::ACCOMPLISHED);
    }

    #[test]
    fn registry_allocates_monotonic_ids() {
        let mut reg = SessionRegistry::new(4);
        assert_eq!(reg.allocate_id(), 1);
        assert_eq!(reg.allocate_id(), 2);
        assert_eq!(reg.allocate_id(), 3);
    }

    #[test]
    fn registry_detects_id_reuse() {
        let mut reg = SessionRegistry::new(4);
        reg.insert(Session::responded(7, 3, Vec::new()));
        assert!(reg.id_reused(3));
        assert!(reg.id_reused(2));
        assert!(!reg.id_reused(4));
        // Reuse remains detectable after the session is gone.
        reg.remove(3);
        assert!(reg.id_reused(3));
    }

    #[test]
    fn registry_capacity() {
        let mut reg = SessionRegistry::new(1);
        assert!(!reg.at_capacity());
        reg.insert(Session::responded(7, 1, Vec::new()));
        assert!(reg.at_capacity());
    }

    #[test]
    fn type_check() {
        let session = Session::responded(7, 1, Vec::new());
        assert!(session.check_type(7).is_ok());
        assert!(matches!(
            session.check_type(9),
            Err(ProtocolError::SessionTypeInconsistency {
                id: 1,
                expected: 7,
                got: 9,
            })
        ));
    }
}
