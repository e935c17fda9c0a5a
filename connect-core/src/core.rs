//! Host-driven API: ConnectCore owns the initiator sessions, receives events from
//! the host and returns the actions the host must perform.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, info};

use crate::close::CloseReason;
use crate::config::ConnectConfig;
use crate::crypto::{CryptoEngine, PairingCrypto};
use crate::initiator::{DeviceInfo, InitiatorSession, PeerHint};
use crate::session::{Phase, SessionError, SessionEvent};
use crate::vault::{PullHandler, VaultBlob, VaultSource};

/// Opaque key of one session inside a [`ConnectCore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Send encoded envelope bytes to the session's peer.
    SendMessage(SessionHandle, Vec<u8>),
    TransferCompleted(SessionHandle),
    PullCompleted(SessionHandle),
    /// Terminal outcome; the session is gone from the core afterwards.
    SessionClosed(SessionHandle, CloseReason),
}

type CryptoFactory = Box<dyn FnMut() -> Box<dyn CryptoEngine> + Send>;

/// Main coordinator. Host passes events; core returns actions.
pub struct ConnectCore {
    device: DeviceInfo,
    config: ConnectConfig,
    sessions: HashMap<SessionHandle, InitiatorSession>,
    next_handle: u64,
    tick_count: u64,
    crypto_factory: CryptoFactory,
}

impl ConnectCore {
    pub fn new(device: DeviceInfo) -> Self {
        Self::with_config(device, ConnectConfig::default())
    }

    pub fn with_config(device: DeviceInfo, config: ConnectConfig) -> Self {
        Self {
            device,
            config,
            sessions: HashMap::new(),
            next_handle: 1,
            tick_count: 0,
            crypto_factory: Box::new(|| Box::new(PairingCrypto::ephemeral())),
        }
    }

    /// Replace the engine each new session is given.
    pub fn set_crypto_factory(
        &mut self,
        factory: impl FnMut() -> Box<dyn CryptoEngine> + Send + 'static,
    ) {
        self.crypto_factory = Box::new(factory);
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, handle: SessionHandle) -> Option<&InitiatorSession> {
        self.sessions.get(&handle)
    }

    pub fn phase(&self, handle: SessionHandle) -> Option<&Phase> {
        self.sessions.get(&handle).map(InitiatorSession::phase)
    }

    /// Token the host presents when re-dialing the peer of a suspended session.
    pub fn resume_token(&self, handle: SessionHandle) -> Option<&[u8]> {
        self.sessions.get(&handle)?.resume_token()
    }

    /// Register a session for the hinted peer and send its `hello`.
    pub fn begin_pairing(&mut self, hint: PeerHint) -> (SessionHandle, Vec<OutboundAction>) {
        let handle = SessionHandle(self.next_handle);
        self.next_handle += 1;
        let crypto = (self.crypto_factory)();
        let mut session =
            InitiatorSession::new(hint, self.device.clone(), crypto, self.config.clone());
        info!(session = %handle, session_id = %session.session_id(), "session registered");
        let events = session.start(self.tick_count);
        self.sessions.insert(handle, session);
        let actions = self.collect(handle, events);
        (handle, actions)
    }

    pub fn push_vault(
        &mut self,
        handle: SessionHandle,
        blob: impl Into<VaultBlob>,
    ) -> Result<Vec<OutboundAction>, SessionError> {
        let now = self.tick_count;
        let events = self.session_mut(handle)?.push_vault(blob, now)?;
        Ok(self.collect(handle, events))
    }

    /// Push the blob `source` supplies. A vault that cannot supply one closes the
    /// session with the matching code.
    pub fn push_vault_from(
        &mut self,
        handle: SessionHandle,
        source: &mut dyn VaultSource,
    ) -> Result<Vec<OutboundAction>, SessionError> {
        match source.vault_blob() {
            Ok(blob) => self.push_vault(handle, blob),
            Err(e) => {
                let events = self
                    .session_mut(handle)?
                    .close(CloseReason::Error(e.into()));
                Ok(self.collect(handle, events))
            }
        }
    }

    /// Register the handler answering the peer's pull request.
    pub fn on_pull_requested(
        &mut self,
        handle: SessionHandle,
        handler: Box<dyn PullHandler>,
    ) -> Result<Vec<OutboundAction>, SessionError> {
        let now = self.tick_count;
        let events = self.session_mut(handle)?.set_pull_handler(handler, now);
        Ok(self.collect(handle, events))
    }

    pub fn request_pull(
        &mut self,
        handle: SessionHandle,
    ) -> Result<Vec<OutboundAction>, SessionError> {
        let now = self.tick_count;
        let events = self.session_mut(handle)?.request_pull(now)?;
        Ok(self.collect(handle, events))
    }

    pub fn close(
        &mut self,
        handle: SessionHandle,
        reason: CloseReason,
    ) -> Result<Vec<OutboundAction>, SessionError> {
        let events = self.session_mut(handle)?.close(reason);
        Ok(self.collect(handle, events))
    }

    /// Process received envelope bytes for one session.
    pub fn on_message_received(
        &mut self,
        handle: SessionHandle,
        bytes: &[u8],
    ) -> Result<Vec<OutboundAction>, SessionError> {
        let now = self.tick_count;
        let events = self.session_mut(handle)?.on_message(bytes, now);
        Ok(self.collect(handle, events))
    }

    pub fn on_transport_lost(
        &mut self,
        handle: SessionHandle,
    ) -> Result<Vec<OutboundAction>, SessionError> {
        let now = self.tick_count;
        let events = self.session_mut(handle)?.on_transport_lost(now);
        Ok(self.collect(handle, events))
    }

    pub fn on_reconnected(
        &mut self,
        handle: SessionHandle,
    ) -> Result<Vec<OutboundAction>, SessionError> {
        let now = self.tick_count;
        let events = self.session_mut(handle)?.on_reconnected(now);
        Ok(self.collect(handle, events))
    }

    /// Periodic tick: request timeouts and reconnect grace for every session.
    pub fn tick(&mut self) -> Vec<OutboundAction> {
        self.tick_count = self.tick_count.saturating_add(1);
        let now = self.tick_count;
        let mut handles: Vec<SessionHandle> = self.sessions.keys().copied().collect();
        handles.sort();
        let mut actions = Vec::new();
        for handle in handles {
            let Some(session) = self.sessions.get_mut(&handle) else {
                continue;
            };
            let events = session.tick(now);
            actions.extend(self.collect(handle, events));
        }
        actions
    }

    fn session_mut(&mut self, handle: SessionHandle) -> Result<&mut InitiatorSession, SessionError> {
        self.sessions
            .get_mut(&handle)
            .ok_or(SessionError::UnknownSession)
    }

    /// Tag session events with their handle; closed sessions leave the registry.
    fn collect(&mut self, handle: SessionHandle, events: Vec<SessionEvent>) -> Vec<OutboundAction> {
        let mut closed = false;
        let actions: Vec<OutboundAction> = events
            .into_iter()
            .map(|event| match event {
                SessionEvent::Send(bytes) => OutboundAction::SendMessage(handle, bytes),
                SessionEvent::TransferCompleted => OutboundAction::TransferCompleted(handle),
                SessionEvent::PullCompleted => OutboundAction::PullCompleted(handle),
                SessionEvent::Closed(reason) => {
                    closed = true;
                    OutboundAction::SessionClosed(handle, reason)
                }
            })
            .collect();
        if closed {
            self.sessions.remove(&handle);
            debug!(session = %handle, "session removed");
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use crate::close::{CloseCause, CODE_MISSING_ITEM};
    use crate::crypto::Keypair;
    use crate::initiator::ConnectMode;
    use crate::protocol::ActionTag;
    use crate::requests::{ChunkPayload, CloseWithError};
    use crate::responder::{BrowserInfo, ResponderSession};
    use crate::vault::{gunzip_vault, gzip_vault, MemoryVault, PullError, PullSource, VaultError};
    use crate::wire;

    #[derive(Clone, Default)]
    struct SharedVault(Arc<Mutex<Vec<Vec<u8>>>>);

    impl VaultSource for SharedVault {
        fn vault_blob(&mut self) -> Result<Vec<u8>, VaultError> {
            Err(VaultError::MissingItem("vault".into()))
        }

        fn accept_blob(&mut self, blob: Vec<u8>) -> Result<(), VaultError> {
            self.0.lock().unwrap().push(blob);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct SharedItems(Arc<Mutex<Vec<Vec<u8>>>>);

    impl PullSource for SharedItems {
        fn pull_data(&mut self) -> Result<Vec<u8>, PullError> {
            Ok(b"login:mail".to_vec())
        }

        fn on_pull_action(&mut self, data: Vec<u8>) -> Result<(), PullError> {
            self.0.lock().unwrap().push(data);
            Ok(())
        }
    }

    fn device() -> DeviceInfo {
        DeviceInfo::new("dev-1", "Pixel", "android")
    }

    fn pair(chunk_size: usize, vault: SharedVault) -> (ConnectCore, ResponderSession, PeerHint) {
        let keypair = Keypair::generate();
        let hint = PeerHint {
            session_id: "s-1".into(),
            peer_id: "browser".into(),
            peer_public_key: *keypair.public_key(),
            mode: ConnectMode::Push,
        };
        let config = ConnectConfig {
            chunk_size,
            ..ConnectConfig::default()
        };
        let responder = ResponderSession::new(
            "s-1",
            BrowserInfo::new("Firefox", "128", "vault-ext"),
            Box::new(PairingCrypto::new(keypair)),
            Box::new(vault),
            config.clone(),
        );
        (ConnectCore::with_config(device(), config), responder, hint)
    }

    /// Hand one frame to the responder and its replies back to the core.
    fn deliver(
        core: &mut ConnectCore,
        handle: SessionHandle,
        responder: &mut ResponderSession,
        bytes: &[u8],
    ) -> Vec<OutboundAction> {
        let mut out = Vec::new();
        for event in responder.on_message(bytes, core.tick_count()) {
            if let SessionEvent::Send(reply) = event {
                if let Ok(actions) = core.on_message_received(handle, &reply) {
                    out.extend(actions);
                }
            }
        }
        out
    }

    /// Run the exchange until nothing is left to send; returns the non-send actions.
    fn pump(
        core: &mut ConnectCore,
        handle: SessionHandle,
        responder: &mut ResponderSession,
        actions: Vec<OutboundAction>,
    ) -> Vec<OutboundAction> {
        let mut queue: VecDeque<OutboundAction> = actions.into();
        let mut outcomes = Vec::new();
        while let Some(action) = queue.pop_front() {
            match action {
                OutboundAction::SendMessage(_, bytes) => {
                    queue.extend(deliver(core, handle, responder, &bytes))
                }
                other => outcomes.push(other),
            }
        }
        outcomes
    }

    /// Run the exchange until the initiator sends `action`; that frame is returned
    /// undelivered.
    fn run_until(
        core: &mut ConnectCore,
        handle: SessionHandle,
        responder: &mut ResponderSession,
        actions: Vec<OutboundAction>,
        action: ActionTag,
    ) -> Vec<u8> {
        let mut queue: VecDeque<OutboundAction> = actions.into();
        loop {
            let Some(OutboundAction::SendMessage(_, bytes)) = queue.pop_front() else {
                panic!("exchange stalled before {action}");
            };
            if wire::decode_message(&bytes).unwrap().action == action {
                return bytes;
            }
            queue.extend(deliver(core, handle, responder, &bytes));
        }
    }

    /// Drop the transport on both sides and bring it back; returns the
    /// initiator's actions on reconnect.
    fn bounce(
        core: &mut ConnectCore,
        handle: SessionHandle,
        responder: &mut ResponderSession,
    ) -> Vec<OutboundAction> {
        assert!(core.on_transport_lost(handle).unwrap().is_empty());
        assert!(responder.on_transport_lost(core.tick_count()).is_empty());
        assert_eq!(core.resume_token(handle), responder.resume_token());
        for _ in 0..5 {
            assert!(core.tick().is_empty());
        }
        assert!(responder.on_reconnected(core.tick_count()).is_empty());
        core.on_reconnected(handle).unwrap()
    }

    #[test]
    fn full_push_between_initiator_and_responder() {
        let vault = SharedVault::default();
        let (mut core, mut responder, hint) = pair(64, vault.clone());
        let plain = br#"{"items":[{"name":"mail","password":"hunter2"}]}"#.repeat(40);
        let blob = gzip_vault(&plain).unwrap();

        let (handle, mut actions) = core.begin_pairing(hint);
        actions.extend(core.push_vault(handle, blob.clone()).unwrap());
        let outcomes = pump(&mut core, handle, &mut responder, actions);

        assert_eq!(
            outcomes,
            vec![
                OutboundAction::TransferCompleted(handle),
                OutboundAction::SessionClosed(handle, CloseReason::Success),
            ]
        );
        assert_eq!(responder.phase(), &Phase::Closed(CloseReason::Success));
        let received = vault.0.lock().unwrap();
        assert_eq!(received.as_slice(), &[blob]);
        assert_eq!(gunzip_vault(&received[0]).unwrap(), plain);
        assert_eq!(core.session_count(), 0);
    }

    #[test]
    fn pull_runs_after_transfer_when_negotiated() {
        let keypair = Keypair::generate();
        let hint = PeerHint {
            session_id: "s-2".into(),
            peer_id: "browser".into(),
            peer_public_key: *keypair.public_key(),
            mode: ConnectMode::Push,
        };
        let items = SharedItems::default();
        let mut responder = ResponderSession::new(
            "s-2",
            BrowserInfo::new("Chrome", "126", "vault-ext"),
            Box::new(PairingCrypto::new(keypair)),
            Box::new(MemoryVault::new()),
            ConnectConfig::default(),
        )
        .with_pull_source(Box::new(items.clone()));
        let mut core = ConnectCore::new(device());

        let (handle, mut actions) = core.begin_pairing(hint);
        actions.extend(
            core.on_pull_requested(
                handle,
                Box::new(|req: Vec<u8>| -> Result<Vec<u8>, PullError> {
                    let mut answer = b"ok ".to_vec();
                    answer.extend(req);
                    Ok(answer)
                }),
            )
            .unwrap(),
        );
        actions.extend(core.push_vault(handle, vec![5u8; 100]).unwrap());
        let outcomes = pump(&mut core, handle, &mut responder, actions);

        assert_eq!(
            outcomes,
            vec![
                OutboundAction::TransferCompleted(handle),
                OutboundAction::PullCompleted(handle),
                OutboundAction::SessionClosed(handle, CloseReason::Success),
            ]
        );
        assert_eq!(
            items.0.lock().unwrap().as_slice(),
            &[b"ok login:mail".to_vec()]
        );
    }

    #[test]
    fn transport_loss_resumes_mid_transfer() {
        let vault = SharedVault::default();
        let (mut core, mut responder, hint) = pair(8, vault.clone());
        let blob: Vec<u8> = (0u8..40).collect();

        let (handle, mut actions) = core.begin_pairing(hint);
        actions.extend(core.push_vault(handle, blob.clone()).unwrap());
        // run until chunk 2 is on the wire, then lose it
        let mut queue: VecDeque<OutboundAction> = actions.into();
        loop {
            let Some(OutboundAction::SendMessage(_, bytes)) = queue.pop_front() else {
                panic!("exchange stalled before chunk 2");
            };
            let message = wire::decode_message(&bytes).unwrap();
            if message.action == ActionTag::TransferChunk
                && message.payload_as::<ChunkPayload>().unwrap().chunk_index == 2
            {
                break;
            }
            queue.extend(deliver(&mut core, handle, &mut responder, &bytes));
        }

        assert!(core.on_transport_lost(handle).unwrap().is_empty());
        assert!(responder.on_transport_lost(core.tick_count()).is_empty());
        assert_eq!(
            core.resume_token(handle),
            responder.resume_token(),
            "both sides agree on the continuation token"
        );
        for _ in 0..10 {
            assert!(core.tick().is_empty());
        }
        responder.on_reconnected(core.tick_count());
        let resumed = core.on_reconnected(handle).unwrap();
        let OutboundAction::SendMessage(_, bytes) = &resumed[0] else {
            panic!("expected a resent chunk, got {resumed:?}");
        };
        let chunk: ChunkPayload = wire::decode_message(bytes).unwrap().payload_as().unwrap();
        assert_eq!(chunk.chunk_index, 2);

        let outcomes = pump(&mut core, handle, &mut responder, resumed);
        assert!(outcomes.contains(&OutboundAction::SessionClosed(handle, CloseReason::Success)));
        assert_eq!(vault.0.lock().unwrap().as_slice(), &[blob]);
    }

    #[test]
    fn loss_before_announce_confirmed_resumes() {
        let vault = SharedVault::default();
        let (mut core, mut responder, hint) = pair(16, vault.clone());
        let blob: Vec<u8> = (0u8..50).collect();

        let (handle, mut actions) = core.begin_pairing(hint);
        actions.extend(core.push_vault(handle, blob.clone()).unwrap());
        let init = run_until(&mut core, handle, &mut responder, actions, ActionTag::InitTransfer);
        // the responder confirms, but the confirmation never arrives
        responder.on_message(&init, core.tick_count());
        assert_eq!(responder.phase(), &Phase::Transferring);

        let resumed = bounce(&mut core, handle, &mut responder);
        assert_eq!(resumed, vec![OutboundAction::SendMessage(handle, init)]);
        let outcomes = pump(&mut core, handle, &mut responder, resumed);
        assert_eq!(
            outcomes,
            vec![
                OutboundAction::TransferCompleted(handle),
                OutboundAction::SessionClosed(handle, CloseReason::Success),
            ]
        );
        assert_eq!(vault.0.lock().unwrap().as_slice(), &[blob]);
    }

    #[test]
    fn loss_while_pull_pending_resumes() {
        let keypair = Keypair::generate();
        let hint = PeerHint {
            session_id: "s-3".into(),
            peer_id: "browser".into(),
            peer_public_key: *keypair.public_key(),
            mode: ConnectMode::Pull,
        };
        let items = SharedItems::default();
        let mut responder = ResponderSession::new(
            "s-3",
            BrowserInfo::new("Chrome", "126", "vault-ext"),
            Box::new(PairingCrypto::new(keypair)),
            Box::new(MemoryVault::new()),
            ConnectConfig::default(),
        )
        .with_pull_source(Box::new(items.clone()));
        let mut core = ConnectCore::new(device());

        let (handle, mut actions) = core.begin_pairing(hint);
        actions.extend(
            core.on_pull_requested(
                handle,
                Box::new(|req: Vec<u8>| -> Result<Vec<u8>, PullError> { Ok(req) }),
            )
            .unwrap(),
        );
        let pull = run_until(&mut core, handle, &mut responder, actions, ActionTag::PullRequest);
        responder.on_message(&pull, core.tick_count());
        assert_eq!(responder.phase(), &Phase::PullPending);

        let resumed = bounce(&mut core, handle, &mut responder);
        assert_eq!(resumed, vec![OutboundAction::SendMessage(handle, pull)]);
        let outcomes = pump(&mut core, handle, &mut responder, resumed);
        assert_eq!(
            outcomes,
            vec![
                OutboundAction::PullCompleted(handle),
                OutboundAction::SessionClosed(handle, CloseReason::Success),
            ]
        );
        assert_eq!(items.0.lock().unwrap().as_slice(), &[b"login:mail".to_vec()]);
    }

    #[test]
    fn vault_travels_sealed() {
        let vault = SharedVault::default();
        let (mut core, mut responder, hint) = pair(32, vault.clone());
        let plain = b"site=mail user=alice password=hunter2\n".repeat(8);

        let (handle, mut actions) = core.begin_pairing(hint);
        actions.extend(core.push_vault(handle, plain.clone()).unwrap());
        let mut on_wire = Vec::new();
        let mut queue: VecDeque<OutboundAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            let OutboundAction::SendMessage(_, bytes) = action else {
                continue;
            };
            let message = wire::decode_message(&bytes).unwrap();
            if message.action == ActionTag::TransferChunk {
                let chunk: ChunkPayload = message.payload_as().unwrap();
                on_wire.extend(wire::from_base64(&chunk.chunk_data).unwrap());
            }
            queue.extend(deliver(&mut core, handle, &mut responder, &bytes));
        }

        assert!(on_wire.len() > plain.len());
        assert!(!on_wire.windows(7).any(|w| w == b"hunter2"));
        assert_eq!(vault.0.lock().unwrap().as_slice(), &[plain]);
    }

    #[test]
    fn missing_vault_closes_with_1001() {
        let (mut core, _, hint) = pair(64, SharedVault::default());
        let (handle, _) = core.begin_pairing(hint);
        let actions = core
            .push_vault_from(handle, &mut MemoryVault::new())
            .unwrap();
        let OutboundAction::SendMessage(_, bytes) = &actions[0] else {
            panic!("expected closeWithError, got {actions:?}");
        };
        let close: CloseWithError = wire::decode_message(bytes).unwrap().payload_as().unwrap();
        assert_eq!(close.error_code, CODE_MISSING_ITEM);
        assert_eq!(
            actions[1],
            OutboundAction::SessionClosed(
                handle,
                CloseReason::Error(CloseCause::MissingItem("vault".into()))
            )
        );
        assert_eq!(core.session_count(), 0);
        assert_eq!(
            core.push_vault(handle, vec![1]),
            Err(SessionError::UnknownSession)
        );
    }

    #[test]
    fn tick_retries_then_times_out() {
        let (mut core, _, hint) = pair(64, SharedVault::default());
        let (handle, first) = core.begin_pairing(hint);
        let mut resent = Vec::new();
        let mut closed = None;
        for _ in 0..62 {
            for action in core.tick() {
                match action {
                    OutboundAction::SendMessage(_, bytes) if closed.is_none() => resent.push(bytes),
                    OutboundAction::SessionClosed(_, reason) => closed = Some(reason),
                    _ => {}
                }
            }
        }
        let OutboundAction::SendMessage(_, hello) = &first[0] else {
            panic!("expected hello");
        };
        assert_eq!(resent.first(), Some(hello));
        assert_eq!(
            closed,
            Some(CloseReason::Error(CloseCause::Timeout {
                action: ActionTag::Hello
            }))
        );
        assert!(core.phase(handle).is_none());
    }

    #[test]
    fn sessions_are_independent() {
        let (mut core, _, hint) = pair(64, SharedVault::default());
        let (a, _) = core.begin_pairing(hint.clone());
        let (b, _) = core.begin_pairing(hint);
        assert_ne!(a, b);
        core.close(a, CloseReason::Success).unwrap();
        assert_eq!(core.session_count(), 1);
        assert_eq!(core.phase(b), Some(&Phase::Idle));
    }
}
