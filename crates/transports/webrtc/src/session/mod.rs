//! Call sessions: negotiation state and its lifecycle owner
//!
//! [`Negotiator`] runs the offer/answer state machine for one call at a time.
//! [`SessionController`] reads relay events and decides who offers, who
//! answers, and when a session is created.

mod controller;
mod negotiator;

pub use controller::SessionController;
pub use negotiator::Negotiator;

use crate::peer::RemoteMedia;
use serde::Serialize;

/// Negotiation state of the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    /// Session created (or none yet); nothing sent
    #[default]
    Idle,
    /// Local offer applied and relayed; waiting for the answer
    Offering,
    /// Remote offer answered; waiting for connectivity
    AnswerPending,
    /// Peer connection established
    Connected,
    /// Negotiation or connectivity failed; the session was disposed
    Failed,
    /// Call ended locally
    Closed,
}

impl NegotiationState {
    /// Offer or answer sent, not yet connected
    pub fn is_negotiating(&self) -> bool {
        matches!(self, Self::Offering | Self::AnswerPending)
    }

    /// No session remains in this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// What observers see of the session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: NegotiationState,
    /// True while the peer connection is up
    pub call_active: bool,
    /// Last remote media track announced, reset when the call ends
    pub remote_media: Option<RemoteMedia>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification() {
        assert!(NegotiationState::Offering.is_negotiating());
        assert!(NegotiationState::AnswerPending.is_negotiating());
        assert!(!NegotiationState::Connected.is_negotiating());
        assert!(NegotiationState::Failed.is_terminal());
        assert!(NegotiationState::Closed.is_terminal());
        assert!(!NegotiationState::Idle.is_terminal());
    }

    #[test]
    fn test_default_snapshot_is_idle() {
        let snapshot = SessionSnapshot::default();
        assert_eq!(snapshot.state, NegotiationState::Idle);
        assert!(!snapshot.call_active);
        assert!(snapshot.remote_media.is_none());
    }
}
