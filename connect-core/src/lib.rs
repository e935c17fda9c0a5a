//! Connect protocol reference implementation: device pairing and vault sync
//! between a mobile initiator and a browser responder.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod chunk;
pub mod close;
pub mod config;
pub mod core;
pub mod crypto;
pub mod initiator;
pub mod integrity;
pub mod pending;
pub mod protocol;
pub mod requests;
pub mod responder;
pub mod session;
pub mod vault;
pub mod wire;

pub use close::{CloseCause, CloseReason};
pub use config::ConnectConfig;
pub use core::{ConnectCore, OutboundAction, SessionHandle};
pub use crypto::{CryptoContext, CryptoEngine, CryptoError, Keypair, PairingCrypto, PublicKey};
pub use initiator::{ConnectMode, DeviceInfo, InitiatorSession, PeerHint};
pub use protocol::{ActionTag, ConnectMessage, RawMessage, SCHEME_VERSION};
pub use requests::Feature;
pub use responder::{BrowserInfo, ResponderSession, TransferMetadata};
pub use session::{Phase, SessionError, SessionEvent};
pub use vault::{MemoryVault, PullError, PullHandler, PullSource, VaultBlob, VaultError, VaultSource};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError, MAX_FRAME_LEN};
