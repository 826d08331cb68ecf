//! Session state machine.
//!
//! A pure transition table keyed by (state, direction, message kind). It does
//! no I/O; the session driver consults it for every message it sends or
//! receives and treats a missing transition as a protocol violation.

use std::fmt;

use super::message::MessageKind;

/// Session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// HELLO sent (or about to be), awaiting the router
    #[default]
    Idle,
    /// CHALLENGE received, AUTHENTICATE not yet sent
    Challenging,
    /// WELCOME received, role traffic allowed
    Established,
    /// GOODBYE exchange in progress
    Closing,
    /// GOODBYE exchange complete
    Closed,
    /// Session aborted
    Error,
}

impl SessionState {
    /// Whether no further transitions are possible
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error)
    }
}

/// Which side produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to router
    Sent,
    /// Router to client
    Received,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Sent => f.write_str("sent"),
            Direction::Received => f.write_str("received"),
        }
    }
}

/// Role traffic a client may send once established.
fn is_role_request(kind: MessageKind) -> bool {
    matches!(
        kind,
        MessageKind::Publish
            | MessageKind::Subscribe
            | MessageKind::Unsubscribe
            | MessageKind::Call
            | MessageKind::Cancel
            | MessageKind::Register
            | MessageKind::Unregister
            | MessageKind::Yield
            | MessageKind::Error
    )
}

/// Role traffic a client may receive once established.
fn is_role_reply(kind: MessageKind) -> bool {
    matches!(
        kind,
        MessageKind::Error
            | MessageKind::Published
            | MessageKind::Subscribed
            | MessageKind::Unsubscribed
            | MessageKind::Event
            | MessageKind::Result
            | MessageKind::Registered
            | MessageKind::Unregistered
            | MessageKind::Invocation
            | MessageKind::Interrupt
    )
}

/// Next state for `(state, direction, kind)`, `None` if the message is illegal.
pub fn next_state(
    state: SessionState,
    direction: Direction,
    kind: MessageKind,
) -> Option<SessionState> {
    use Direction::{Received, Sent};
    use MessageKind as K;
    use SessionState as S;

    match (state, direction, kind) {
        (S::Idle, Sent, K::Hello) => Some(S::Idle),
        (S::Idle, Received, K::Challenge) => Some(S::Challenging),
        (S::Challenging, Sent, K::Authenticate) => Some(S::Idle),
        (S::Idle | S::Challenging, Received, K::Welcome) => Some(S::Established),
        (S::Idle | S::Challenging, Received, K::Abort) => Some(S::Error),

        (S::Established, Received, K::Goodbye) => Some(S::Closing),
        (S::Established, Sent, K::Goodbye) => Some(S::Closing),
        (S::Closing, Sent, K::Goodbye) => Some(S::Closed),
        (S::Closing, Received, K::Goodbye) => Some(S::Closed),

        (S::Established, Sent, k) if is_role_request(k) => Some(S::Established),
        (S::Established, Received, k) if is_role_reply(k) => Some(S::Established),
        // Replies still in flight when the GOODBYE crossed them.
        (S::Closing, Received, k) if is_role_reply(k) => Some(S::Closing),

        (s, Sent, K::Abort) if !s.is_terminal() => Some(S::Error),
        _ => None,
    }
}

/// Session state holder driven by [`next_state`].
#[derive(Debug, Default)]
pub struct SessionStateMachine {
    state: SessionState,
}

impl SessionStateMachine {
    /// New machine in `Idle`
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether role traffic is allowed
    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Apply a message. On an illegal message the state is left untouched
    /// and a description of the violation is returned.
    pub fn apply(
        &mut self,
        direction: Direction,
        kind: MessageKind,
    ) -> std::result::Result<SessionState, String> {
        match next_state(self.state, direction, kind) {
            Some(next) => {
                if next != self.state {
                    tracing::debug!("Session state {:?} -> {:?} ({} {})", self.state, next, direction, kind);
                }
                self.state = next;
                Ok(next)
            },
            None => Err(format!(
                "Cannot process {} {} in state {:?}",
                direction, kind, self.state
            )),
        }
    }

    /// Back to `Idle` for a fresh connection attempt.
    pub fn reset(&mut self) {
        self.state = SessionState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_handshake() {
        let mut sm = SessionStateMachine::new();
        assert_eq!(sm.apply(Direction::Sent, MessageKind::Hello), Ok(SessionState::Idle));
        assert_eq!(
            sm.apply(Direction::Received, MessageKind::Welcome),
            Ok(SessionState::Established)
        );
        assert!(sm.is_established());
    }

    #[test]
    fn test_challenge_handshake() {
        let mut sm = SessionStateMachine::new();
        sm.apply(Direction::Sent, MessageKind::Hello).unwrap();
        assert_eq!(
            sm.apply(Direction::Received, MessageKind::Challenge),
            Ok(SessionState::Challenging)
        );
        assert_eq!(
            sm.apply(Direction::Sent, MessageKind::Authenticate),
            Ok(SessionState::Idle)
        );
        assert_eq!(
            sm.apply(Direction::Received, MessageKind::Welcome),
            Ok(SessionState::Established)
        );
    }

    #[test]
    fn test_abort_is_terminal() {
        let mut sm = SessionStateMachine::new();
        sm.apply(Direction::Sent, MessageKind::Hello).unwrap();
        assert_eq!(
            sm.apply(Direction::Received, MessageKind::Abort),
            Ok(SessionState::Error)
        );
        assert!(sm.apply(Direction::Received, MessageKind::Welcome).is_err());
        assert!(sm.state().is_terminal());
    }

    #[test]
    fn test_router_goodbye() {
        let mut sm = SessionStateMachine::new();
        sm.apply(Direction::Sent, MessageKind::Hello).unwrap();
        sm.apply(Direction::Received, MessageKind::Welcome).unwrap();
        assert_eq!(
            sm.apply(Direction::Received, MessageKind::Goodbye),
            Ok(SessionState::Closing)
        );
        assert_eq!(
            sm.apply(Direction::Sent, MessageKind::Goodbye),
            Ok(SessionState::Closed)
        );
    }

    #[test]
    fn test_client_goodbye_tolerates_inflight_replies() {
        let mut sm = SessionStateMachine::new();
        sm.apply(Direction::Sent, MessageKind::Hello).unwrap();
        sm.apply(Direction::Received, MessageKind::Welcome).unwrap();
        sm.apply(Direction::Sent, MessageKind::Goodbye).unwrap();
        assert_eq!(
            sm.apply(Direction::Received, MessageKind::Result),
            Ok(SessionState::Closing)
        );
        assert!(sm.apply(Direction::Sent, MessageKind::Call).is_err());
        assert_eq!(
            sm.apply(Direction::Received, MessageKind::Goodbye),
            Ok(SessionState::Closed)
        );
    }

    #[test]
    fn test_challenge_when_established_is_violation() {
        let mut sm = SessionStateMachine::new();
        sm.apply(Direction::Sent, MessageKind::Hello).unwrap();
        sm.apply(Direction::Received, MessageKind::Welcome).unwrap();
        let err = sm
            .apply(Direction::Received, MessageKind::Challenge)
            .unwrap_err();
        assert!(err.contains("CHALLENGE"));
        assert_eq!(sm.state(), SessionState::Established);
    }

    #[test]
    fn test_role_traffic_requires_established() {
        let mut sm = SessionStateMachine::new();
        assert!(sm.apply(Direction::Received, MessageKind::Event).is_err());
        assert!(sm.apply(Direction::Sent, MessageKind::Call).is_err());
        sm.apply(Direction::Sent, MessageKind::Hello).unwrap();
        sm.apply(Direction::Received, MessageKind::Welcome).unwrap();
        assert!(sm.apply(Direction::Received, MessageKind::Event).is_ok());
        assert!(sm.apply(Direction::Sent, MessageKind::Yield).is_ok());
        assert!(sm.apply(Direction::Received, MessageKind::Call).is_err());
    }

    #[test]
    fn test_reset() {
        let mut sm = SessionStateMachine::new();
        sm.apply(Direction::Sent, MessageKind::Abort).unwrap();
        assert_eq!(sm.state(), SessionState::Error);
        sm.reset();
        assert_eq!(sm.state(), SessionState::Idle);
    }
}
