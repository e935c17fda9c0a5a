//! Session state machine shared by both roles: phases, legal transitions,
//! negotiated features and the per-session crypto context.

use std::fmt;

use crate::close::{CloseCause, CloseReason};
use crate::crypto::CryptoEngine;
use crate::requests::Feature;

/// Lifecycle phase of one pairing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    HelloExchanged,
    Challenged,
    Transferring,
    PullPending,
    /// Transfer acknowledged; waiting to close (or to run a pull first).
    Completed,
    Closed(CloseReason),
}

impl Phase {
    pub fn is_closed(&self) -> bool {
        matches!(self, Phase::Closed(_))
    }

    fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::HelloExchanged => "hello-exchanged",
            Phase::Challenged => "challenged",
            Phase::Transferring => "transferring",
            Phase::PullPending => "pull-pending",
            Phase::Completed => "completed",
            Phase::Closed(CloseReason::Success) => "closed(success)",
            Phase::Closed(CloseReason::Error(_)) => "closed(error)",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Effect of feeding an event into a session, for the host to carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Send these encoded envelope bytes to the peer.
    Send(Vec<u8>),
    TransferCompleted,
    PullCompleted,
    Closed(CloseReason),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },
    #[error("no pull handler registered")]
    NoPullHandler,
    #[error("a vault transfer is already under way")]
    TransferInProgress,
    #[error("unknown session")]
    UnknownSession,
}

/// Mutable state of one pairing-to-close lifecycle. `T` is the role's transfer
/// state: the sending engine on the initiator, the reassembly buffer on the responder.
pub struct Session<T> {
    pub session_id: String,
    pub peer_id: String,
    phase: Phase,
    /// Phase a pull exchange interrupted; restored when the pull finishes.
    before_pull: Option<Phase>,
    crypto: Box<dyn CryptoEngine>,
    negotiated_features: Vec<Feature>,
    pub transfer: Option<T>,
}

impl<T> Session<T> {
    pub fn new(session_id: String, peer_id: String, crypto: Box<dyn CryptoEngine>) -> Self {
        Self {
            session_id,
            peer_id,
            phase: Phase::Idle,
            before_pull: None,
            crypto,
            negotiated_features: Vec::new(),
            transfer: None,
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase.is_closed()
    }

    pub fn crypto(&self) -> &dyn CryptoEngine {
        self.crypto.as_ref()
    }

    pub fn crypto_mut(&mut self) -> &mut dyn CryptoEngine {
        self.crypto.as_mut()
    }

    pub fn negotiated_features(&self) -> &[Feature] {
        &self.negotiated_features
    }

    pub fn has_feature(&self, feature: Feature) -> bool {
        self.negotiated_features.contains(&feature)
    }

    pub fn set_negotiated_features(&mut self, features: Vec<Feature>) {
        self.negotiated_features = features;
    }

    /// Move to `next` if the transition is legal. Closing goes through [`Session::close`].
    pub fn transition(&mut self, next: Phase) -> Result<(), SessionError> {
        let legal = match (&self.phase, &next) {
            (Phase::Closed(_), _) => return Err(SessionError::Closed),
            (_, Phase::Closed(_)) => false,
            (Phase::Idle, Phase::HelloExchanged)
            | (Phase::HelloExchanged, Phase::Challenged)
            | (Phase::Challenged, Phase::Transferring)
            | (Phase::Transferring, Phase::Completed) => true,
            (Phase::Challenged | Phase::Transferring | Phase::Completed, Phase::PullPending) => {
                true
            }
            _ => false,
        };
        if !legal {
            return Err(SessionError::IllegalTransition {
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        if next == Phase::PullPending {
            self.before_pull = Some(self.phase.clone());
        }
        self.phase = next;
        Ok(())
    }

    /// Leave `PullPending` back to the phase the pull interrupted.
    pub fn finish_pull(&mut self) -> Result<Phase, SessionError> {
        if self.phase != Phase::PullPending {
            return Err(SessionError::IllegalTransition {
                from: self.phase.to_string(),
                to: "previous phase".into(),
            });
        }
        let previous = self.before_pull.take().unwrap_or(Phase::Challenged);
        self.phase = previous.clone();
        Ok(previous)
    }

    /// Enter the terminal phase. Returns false if already closed.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        if self.phase.is_closed() {
            return false;
        }
        self.phase = Phase::Closed(reason);
        self.transfer = None;
        self.before_pull = None;
        true
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        match &self.phase {
            Phase::Closed(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn fail(&mut self, cause: CloseCause) -> bool {
        self.close(CloseReason::Error(cause))
    }
}
