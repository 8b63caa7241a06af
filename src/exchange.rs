//! # Named States and Exchange Machines
//!
//! A named state is a `(id, mode, value, check?)` tuple synchronized
//! between the two ends of a link. Reads travel as Enquiry/Response; writes
//! travel as Tell/Confirm, optionally solicited by Show. Every in-flight
//! exchange is tracked by a waypoint machine: the side that opened the
//! exchange holds an initiator machine, the other side a responder machine.
//!
//! Machines live as long as their containing scope (handler or session) but
//! describe a single exchange each; a machine that has reached
//! `accomplished` is reset to `ready` when the next exchange on its state
//! begins. A machine abandoned mid-exchange (for example by a caller-side
//! timeout) is treated the same way on the next successful exit.

use crate::error::ProtocolError;
use crate::packet::ConfirmCode;
use crate::waypoint::{label, TransitionMap, Waypoint};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};

/// Server-side approval predicate for proposed values.
pub type CheckFn = Arc<dyn Fn(&[u8]) -> ConfirmCode + Send + Sync>;

/// How a named state may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateMode {
    /// Authoritative on the hosting side; peers read it, proposals are
    /// subject to the check like any other write.
    Fact,
    /// Writable exactly once; later proposals are denied outright.
    Once,
    /// Both sides may propose until a value is accepted.
    Mediate,
}

/// Declarative description of one named state.
#[derive(Clone)]
pub struct StateSpec {
    pub mode: StateMode,
    pub value: Option<Vec<u8>>,
    pub check: Option<CheckFn>,
}

impl StateSpec {
    pub fn new(mode: StateMode) -> Self {
        Self {
            mode,
            value: None,
            check: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&[u8]) -> ConfirmCode + Send + Sync + 'static,
    {
        self.check = Some(Arc::new(check));
        self
    }
}

impl fmt::Debug for StateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSpec")
            .field("mode", &self.mode)
            .field("value", &self.value)
            .field("check", &self.check.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// A hosted named state: its spec plus the live value and the notifier
/// used by waiters parked until a proposal is accepted.
pub struct NamedState {
    pub mode: StateMode,
    pub value: Option<Vec<u8>>,
    pub check: Option<CheckFn>,
    /// True once a value has been accepted through an exchange (or seeded
    /// at construction).
    pub accepted: bool,
    /// Wakes `wait_accepted` parkers when a proposal commits.
    pub notify: Arc<Notify>,
}

impl NamedState {
    pub fn from_spec(spec: StateSpec) -> Self {
        let accepted = spec.value.is_some();
        Self {
            mode: spec.mode,
            value: spec.value,
            check: spec.check,
            accepted,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Commit an accepted value and wake anybody waiting for one.
    pub fn commit(&mut self, value: Vec<u8>) {
        self.value = Some(value);
        self.accepted = true;
        self.notify.notify_waiters();
    }
}

const INITIATOR_EDGES: TransitionMap = &[
    (label::READY, &[label::TELL, label::SHOW]),
    (label::SHOW, &[label::CONFIRM]),
    (label::TELL, &[label::CONFIRM]),
    (label::CONFIRM, &[label::ACCOMPLISHED]),
];

const RESPONDER_EDGES: TransitionMap = &[
    (label::READY, &[label::SHOW, label::TELL]),
    (label::SHOW, &[label::TELL]),
    (label::TELL, &[label::ACCOMPLISHED]),
];

/// Completion handle of an in-flight initiator exchange.
pub enum ExchangeWaiter {
    /// `tell_state` caller awaiting the peer's confirm code.
    Tell(oneshot::Sender<ConfirmCode>),
    /// `show_state` caller awaiting the value the peer pushed.
    Show(oneshot::Sender<Option<Vec<u8>>>),
}

/// Exchange machine on the side that opened the exchange.
pub struct InitiatorExchange {
    machine: Waypoint,
    waiter: Option<ExchangeWaiter>,
    /// The peer's last confirm code, kept for inspection after completion.
    pub answer: Option<ConfirmCode>,
}

impl Default for InitiatorExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl InitiatorExchange {
    pub fn new() -> Self {
        Self {
            machine: Waypoint::new(label::READY, INITIATOR_EDGES),
            waiter: None,
            answer: None,
        }
    }

    pub fn state(&self) -> &'static str {
        self.machine.state()
    }

    /// Reset a finished machine so a new exchange can begin. A machine
    /// whose caller went away mid-exchange (timeout, cancellation) counts
    /// as finished; one with a live waiter is left alone, so a second
    /// concurrent exchange on the same state fails its transition.
    pub fn ensure_ready(&mut self) {
        let abandoned = match &self.waiter {
            Some(ExchangeWaiter::Tell(tx)) => tx.is_closed(),
            Some(ExchangeWaiter::Show(tx)) => tx.is_closed(),
            None => true,
        };
        if self.machine.is(label::ACCOMPLISHED) || (!self.machine.is(label::READY) && abandoned) {
            *self = Self::new();
        }
    }

    /// Open a write exchange: `ready -> tell`.
    pub fn start_tell(&mut self, waiter: oneshot::Sender<ConfirmCode>) -> Result<(), ProtocolError> {
        self.machine.goto(label::TELL)?;
        self.waiter = Some(ExchangeWaiter::Tell(waiter));
        Ok(())
    }

    /// Open a solicited-read exchange: `ready -> show`.
    pub fn start_show(
        &mut self,
        waiter: oneshot::Sender<Option<Vec<u8>>>,
    ) -> Result<(), ProtocolError> {
        self.machine.goto(label::SHOW)?;
        self.waiter = Some(ExchangeWaiter::Show(waiter));
        Ok(())
    }

    /// The peer confirmed our Tell: `tell -> confirm -> accomplished`.
    pub fn confirmed(&mut self, code: ConfirmCode) -> Result<(), ProtocolError> {
        self.machine.goto(label::CONFIRM)?;
        self.answer = Some(code);
        if let Some(ExchangeWaiter::Tell(tx)) = self.waiter.take() {
            let _ = tx.send(code);
        }
        self.machine.goto(label::ACCOMPLISHED)
    }

    /// Whether this machine is waiting for the Tell a Show solicited.
    pub fn awaiting_push(&self) -> bool {
        self.machine.is(label::SHOW)
    }

    /// The peer pushed the value our Show asked for:
    /// `show -> confirm -> accomplished`.
    pub fn pushed(
        &mut self,
        code: ConfirmCode,
        value: Option<Vec<u8>>,
    ) -> Result<(), ProtocolError> {
        self.machine.goto(label::CONFIRM)?;
        self.answer = Some(code);
        if let Some(ExchangeWaiter::Show(tx)) = self.waiter.take() {
            let _ = tx.send(value);
        }
        self.machine.goto(label::ACCOMPLISHED)
    }
}

/// Exchange machine on the side answering the exchange.
pub struct ResponderExchange {
    machine: Waypoint,
    /// The value most recently proposed to this side.
    pub proposed: Option<Vec<u8>>,
}

impl Default for ResponderExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponderExchange {
    pub fn new() -> Self {
        Self {
            machine: Waypoint::new(label::READY, RESPONDER_EDGES),
            proposed: None,
        }
    }

    pub fn state(&self) -> &'static str {
        self.machine.state()
    }

    /// Reset a finished machine for the next exchange. Unlike the
    /// initiator reset this never touches a machine mid-flight: incoming
    /// packets must find it exactly where the flow left it.
    pub fn reclaim(&mut self) {
        if self.machine.is(label::ACCOMPLISHED) {
            *self = Self::new();
        }
    }

    /// A Tell arrived: `ready -> tell`.
    pub fn telling(&mut self, value: Vec<u8>) -> Result<(), ProtocolError> {
        self.machine.goto(label::TELL)?;
        self.proposed = Some(value);
        Ok(())
    }

    /// A Show arrived: `ready -> show`.
    pub fn showing(&mut self) -> Result<(), ProtocolError> {
        self.machine.goto(label::SHOW)
    }

    /// We answered a Show with a Tell: `show -> tell`.
    pub fn pushing(&mut self) -> Result<(), ProtocolError> {
        self.machine.goto(label::TELL)
    }

    /// Whether this machine is waiting for the Confirm of a pushed Tell.
    pub fn awaiting_confirm(&self) -> bool {
        self.machine.is(label::TELL)
    }

    /// The exchange finished: `tell -> accomplished`.
    pub fn complete(&mut self) -> Result<(), ProtocolError> {
        self.machine.goto(label::ACCOMPLISHED)
    }
}

/// States plus their exchange machines for one scope (handler or session).
#[derive(Default)]
pub struct StateTable {
    pub states: HashMap<u64, NamedState>,
    pub initiators: HashMap<u64, InitiatorExchange>,
    pub responders: HashMap<u64, ResponderExchange>,
}

impl StateTable {
    pub fn from_specs(specs: Vec<(u64, StateSpec)>) -> Self {
        let mut table = Self::default();
        for (id, spec) in specs {
            table.states.insert(id, NamedState::from_spec(spec));
        }
        table
    }

    pub fn value(&self, state: u64) -> Option<Vec<u8>> {
        self.states.get(&state).and_then(|s| s.value.clone())
    }

    /// Initiator machine for a state, created (or reset) on demand. A
    /// machine a caller abandoned mid-exchange is reclaimed here too.
    pub fn initiator(&mut self, state: u64) -> &mut InitiatorExchange {
        let entry = self.initiators.entry(state).or_default();
        entry.ensure_ready();
        entry
    }
}
