//! # Waypoint State Machine
//!
//! A minimal finite-state automaton driven by a static adjacency map. Both
//! the state-exchange machines and the session-lifecycle machines are
//! waypoint instances with different maps; the machine itself knows nothing
//! about packets or sessions.

use crate::error::ProtocolError;

/// State labels shared by the exchange and lifecycle machines.
pub mod label {
    pub const READY: &str = "ready";
    pub const TELL: &str = "tell";
    pub const SHOW: &str = "show";
    pub const CONFIRM: &str = "confirm";
    pub const START: &str = "start";
    pub const ACCEPT: &str = "accept";
    pub const REFUSE: &str = "refuse";
    pub const BUSY: &str = "busy";
    pub const DONE: &str = "done";
    pub const FINISH: &str = "finish";
    pub const ACCOMPLISHED: &str = "accomplished";
}

/// Adjacency map: each entry lists the states reachable from its key.
/// States absent from the map have no outgoing edges.
pub type TransitionMap = &'static [(&'static str, &'static [&'static str])];

/// Finite-state automaton over string labels.
///
/// `goto` succeeds iff the target is in the allowed set of the current
/// state; an illegal transition fails without touching the current state.
#[derive(Debug, Clone)]
pub struct Waypoint {
    state: &'static str,
    edges: TransitionMap,
}

impl Waypoint {
    pub fn new(start: &'static str, edges: TransitionMap) -> Self {
        Self { state: start, edges }
    }

    /// Current state label.
    pub fn state(&self) -> &'static str {
        self.state
    }

    pub fn is(&self, label: &str) -> bool {
        self.state == label
    }

    /// Whether `target` is reachable in one step from the current state.
    pub fn can_goto(&self, target: &str) -> bool {
        self.edges
            .iter()
            .find(|(from, _)| *from == self.state)
            .map(|(_, next)| next.contains(&target))
            .unwrap_or(false)
    }

    /// Move to `target`, or fail leaving the current state unchanged.
    pub fn goto(&mut self, target: &'static str) -> Result<(), ProtocolError> {
        if !self.can_goto(target) {
            return Err(ProtocolError::IllegalTransition {
                from: self.state,
                to: target,
            });
        }
        self.state = target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::label::*;
    use super::*;

    const EDGES: TransitionMap = &[
        (READY, &[TELL, SHOW]),
        (TELL, &[CONFIRM]),
        (SHOW, &[CONFIRM]),
        (CONFIRM, &[ACCOMPLISHED]),
    ];

    #[test]
    fn walks_legal_path() {
        let mut wp = Waypoint::new(READY, EDGES);
        assert_eq!(wp.state(), READY);
        wp.goto(TELL).unwrap();
        wp.goto(CONFIRM).unwrap();
        wp.goto(ACCOMPLISHED).unwrap();
        assert!(wp.is(ACCOMPLISHED));
    }

    #[test]
    fn illegal_transition_leaves_state_unchanged() {
        let mut wp = Waypoint::new(READY, EDGES);
        let err = wp.goto(CONFIRM).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::IllegalTransition {
                from: READY,
                to: CONFIRM,
            }
        ));
        assert_eq!(wp.state(), READY);
    }

    #[test]
    fn terminal_state_has_no_edges() {
        let mut wp = Waypoint::new(READY, EDGES);
        wp.goto(SHOW).unwrap();
        wp.goto(CONFIRM).unwrap();
        wp.goto(ACCOMPLISHED).unwrap();
        assert!(!wp.can_goto(READY));
        assert!(wp.goto(TELL).is_err());
        assert_eq!(wp.state(), ACCOMPLISHED);
    }
}
