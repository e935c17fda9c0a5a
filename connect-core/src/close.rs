//! Close mapping: local failure causes to the stable numeric codes the peer branches on.

use crate::chunk::ChunkError;
use crate::crypto::CryptoError;
use crate::protocol::ActionTag;
use crate::requests::{CloseWithError, RequestError, ResponseError};
use crate::session::SessionError;
use crate::wire::MessageError;

/// Catch-all wire error code.
pub const CODE_GENERIC: u16 = 1000;
/// A referenced vault entry was not found.
pub const CODE_MISSING_ITEM: u16 = 1001;
/// Key agreement or integrity check failed.
pub const CODE_SALT_VERIFICATION_FAILED: u16 = 1020;

/// Why a session ended badly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CloseCause {
    #[error("salt verification failed")]
    SaltVerificationFailed,
    #[error("vault digest mismatch")]
    DigestMismatch,
    #[error("missing item: {0}")]
    MissingItem(String),
    #[error("wrong response action: expected {expected}, got {actual}")]
    WrongResponseAction {
        expected: ActionTag,
        actual: ActionTag,
    },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("{action} request timed out")]
    Timeout { action: ActionTag },
    #[error("transport lost")]
    TransportLost,
    #[error("crypto failure: {0}")]
    Crypto(String),
    #[error("vault unavailable: {0}")]
    VaultUnavailable(String),
    #[error("pull rejected: {0}")]
    PullRejected(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("peer closed with code {code}")]
    PeerClosed { code: u16, message: Option<String> },
}

impl CloseCause {
    /// Wire code for this cause. No wildcard arm: every new cause is classified here.
    pub fn error_code(&self) -> u16 {
        match self {
            CloseCause::SaltVerificationFailed | CloseCause::DigestMismatch => {
                CODE_SALT_VERIFICATION_FAILED
            }
            CloseCause::MissingItem(_) => CODE_MISSING_ITEM,
            CloseCause::WrongResponseAction { .. }
            | CloseCause::ProtocolViolation(_)
            | CloseCause::Timeout { .. }
            | CloseCause::TransportLost
            | CloseCause::Crypto(_)
            | CloseCause::VaultUnavailable(_)
            | CloseCause::PullRejected(_)
            | CloseCause::Cancelled(_)
            | CloseCause::Internal(_) => CODE_GENERIC,
            CloseCause::PeerClosed { code, .. } => *code,
        }
    }

    /// The `closeWithError` request reporting this cause.
    pub fn to_request(&self) -> CloseWithError {
        CloseWithError {
            error_code: self.error_code(),
            error_message: Some(self.to_string()),
        }
    }
}

impl From<ResponseError> for CloseCause {
    fn from(err: ResponseError) -> Self {
        match err {
            ResponseError::WrongResponseAction { expected, actual } => {
                CloseCause::WrongResponseAction { expected, actual }
            }
            ResponseError::Payload(e) => CloseCause::ProtocolViolation(e.to_string()),
        }
    }
}

impl From<RequestError> for CloseCause {
    fn from(err: RequestError) -> Self {
        CloseCause::ProtocolViolation(err.to_string())
    }
}

impl From<MessageError> for CloseCause {
    fn from(err: MessageError) -> Self {
        CloseCause::ProtocolViolation(err.to_string())
    }
}

impl From<ChunkError> for CloseCause {
    fn from(err: ChunkError) -> Self {
        match err {
            ChunkError::DigestMismatch => CloseCause::DigestMismatch,
            ChunkError::OutOfSequence { .. }
            | ChunkError::OutOfRange { .. }
            | ChunkError::SizeMismatch { .. }
            | ChunkError::Overflow
            | ChunkError::Incomplete { .. }
            | ChunkError::AlreadyComplete
            | ChunkError::EmptyPlan => CloseCause::ProtocolViolation(err.to_string()),
            // sender-side bookkeeping, not caused by the peer
            ChunkError::NotInFlight { .. } | ChunkError::Busy { .. } => {
                CloseCause::Internal(err.to_string())
            }
        }
    }
}

impl From<CryptoError> for CloseCause {
    fn from(err: CryptoError) -> Self {
        CloseCause::Crypto(err.to_string())
    }
}

impl From<SessionError> for CloseCause {
    fn from(err: SessionError) -> Self {
        CloseCause::Internal(err.to_string())
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Success,
    Error(CloseCause),
}

impl CloseReason {
    pub fn is_success(&self) -> bool {
        matches!(self, CloseReason::Success)
    }

    /// Wire code, `None` on success.
    pub fn error_code(&self) -> Option<u16> {
        match self {
            CloseReason::Success => None,
            CloseReason::Error(cause) => Some(cause.error_code()),
        }
    }
}

impl From<CloseCause> for CloseReason {
    fn from(cause: CloseCause) -> Self {
        CloseReason::Error(cause)
    }
}
