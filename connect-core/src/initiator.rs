//! Initiator role: the device that scanned the pairing hint. Drives hello, the
//! challenge, the vault push and the pull exchange against one peer.

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunk::{ChunkRequest, OutboundTransfer};
use crate::close::{CloseCause, CloseReason, CODE_GENERIC};
use crate::config::ConnectConfig;
use crate::crypto::{self, CryptoContext, CryptoEngine, PublicKey};
use crate::pending::{Expiry, PendingRequest, PendingTable};
use crate::protocol::{ActionTag, RawMessage};
use crate::requests::{
    negotiate_features, ChallengeRequest, CloseWithError, CloseWithSuccess, ConnectRequest,
    Feature, HelloRequest, HelloResponse, InitTransferRequest, PullRequest, PullRequestAction,
    RequestExpectedResponse, TransferChunk, TransferLastChunk,
};
use crate::session::{Phase, Session, SessionError, SessionEvent};
use crate::vault::{PullHandler, VaultBlob};
use crate::wire;

/// What the pairing hint asks for once the channel is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectMode {
    #[default]
    Push,
    /// Serve the peer's pull request; no vault is pushed.
    Pull,
}

/// Out-of-band pairing data, typically scanned from a QR code.
#[derive(Debug, Clone)]
pub struct PeerHint {
    pub session_id: String,
    pub peer_id: String,
    /// The peer's long-lived pairing key.
    pub peer_public_key: PublicKey,
    pub mode: ConnectMode,
}

/// How this device introduces itself in `hello`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
    pub device_os: String,
    /// Push-notification token forwarded, encrypted, in `initTransfer`.
    pub fcm_token: String,
    pub supported_features: Vec<Feature>,
}

impl DeviceInfo {
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_os: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            device_os: device_os.into(),
            fcm_token: String::new(),
            supported_features: vec![Feature::Pull, Feature::ExpirationDate],
        }
    }
}

/// Outstanding request, with whatever its response needs to be checked against.
#[derive(Debug)]
enum Pending {
    Hello,
    Challenge { salt: Vec<u8> },
    /// The transfer becomes the session's once confirmed.
    InitTransfer(Box<OutboundTransfer>),
    Chunk { index: u32, last: bool },
    PullRequest,
    PullRequestAction,
}

impl Pending {
    fn action(&self) -> ActionTag {
        match self {
            Pending::Hello => ActionTag::Hello,
            Pending::Challenge { .. } => ActionTag::Challenge,
            Pending::InitTransfer(_) => ActionTag::InitTransfer,
            Pending::Chunk { .. } => ActionTag::TransferChunk,
            Pending::PullRequest => ActionTag::PullRequest,
            Pending::PullRequestAction => ActionTag::PullRequestAction,
        }
    }

    /// Requests the peer may already have acted on. They go out again under the
    /// same envelope id so the peer answers from its reply cache.
    fn replays_on_reconnect(&self) -> bool {
        matches!(
            self,
            Pending::InitTransfer(_) | Pending::PullRequest | Pending::PullRequestAction
        )
    }
}

/// One initiator-side session. Every entry point returns the effects the host
/// must carry out; nothing here performs I/O.
pub struct InitiatorSession {
    session: Session<OutboundTransfer>,
    hint: PeerHint,
    device: DeviceInfo,
    config: ConnectConfig,
    pending: PendingTable<Pending>,
    peer_info: Option<HelloResponse>,
    /// Kept until `initTransferConfirmed`; a second push is refused meanwhile.
    queued_vault: Option<VaultBlob>,
    pull_handler: Option<Box<dyn PullHandler>>,
    pull_queued: bool,
    pull_done: bool,
    new_session_id: Vec<u8>,
    continuation_issued: bool,
    suspended_since: Option<u64>,
    /// Request cut off by a transport loss, re-sent verbatim on reconnect.
    interrupted: Option<PendingRequest<Pending>>,
}

impl InitiatorSession {
    pub fn new(
        hint: PeerHint,
        device: DeviceInfo,
        crypto: Box<dyn CryptoEngine>,
        config: ConnectConfig,
    ) -> Self {
        let session = Session::new(hint.session_id.clone(), hint.peer_id.clone(), crypto);
        Self {
            session,
            hint,
            device,
            config,
            pending: PendingTable::new(1),
            peer_info: None,
            queued_vault: None,
            pull_handler: None,
            pull_queued: false,
            pull_done: false,
            new_session_id: Uuid::new_v4().as_bytes().to_vec(),
            continuation_issued: false,
            suspended_since: None,
            interrupted: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    pub fn phase(&self) -> &Phase {
        self.session.phase()
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.session.close_reason()
    }

    pub fn negotiated_features(&self) -> &[Feature] {
        self.session.negotiated_features()
    }

    /// What the peer announced in its `hello` response.
    pub fn peer_info(&self) -> Option<&HelloResponse> {
        self.peer_info.as_ref()
    }

    pub fn transfer(&self) -> Option<&OutboundTransfer> {
        self.session.transfer.as_ref()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended_since.is_some()
    }

    /// Continuation token the peer knows this session by, once it has been sent.
    pub fn resume_token(&self) -> Option<&[u8]> {
        self.continuation_issued
            .then_some(self.new_session_id.as_slice())
    }

    /// Send `hello`. No-op unless the session is idle.
    pub fn start(&mut self, now: u64) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if self.session.phase() != &Phase::Idle || !self.pending.is_empty() {
            return events;
        }
        info!(
            session = %self.session.session_id,
            peer = %self.session.peer_id,
            mode = ?self.hint.mode,
            "pairing started"
        );
        let hello = HelloRequest {
            device_id: self.device.device_id.clone(),
            device_name: self.device.device_name.clone(),
            device_os: self.device.device_os.clone(),
            supported_features: Some(self.device.supported_features.clone()),
        };
        if let Err(cause) = self.issue(hello, Pending::Hello, now, &mut events) {
            self.fail(cause, &mut events);
        }
        events
    }

    /// Queue a vault blob. It is announced as soon as the channel is secured.
    pub fn push_vault(
        &mut self,
        blob: impl Into<VaultBlob>,
        now: u64,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        if self.session.is_closed() {
            return Err(SessionError::Closed);
        }
        if self.hint.mode == ConnectMode::Pull {
            return Err(SessionError::IllegalTransition {
                from: self.session.phase().to_string(),
                to: Phase::Transferring.to_string(),
            });
        }
        if self.queued_vault.is_some()
            || self.session.transfer.is_some()
            || self.session.phase() == &Phase::Completed
        {
            return Err(SessionError::TransferInProgress);
        }
        self.queued_vault = Some(blob.into());
        let mut events = Vec::new();
        self.advance(now, &mut events);
        Ok(events)
    }

    /// Register the callback answering the peer's pull request.
    pub fn set_pull_handler(
        &mut self,
        handler: Box<dyn PullHandler>,
        now: u64,
    ) -> Vec<SessionEvent> {
        self.pull_handler = Some(handler);
        let mut events = Vec::new();
        self.advance(now, &mut events);
        events
    }

    /// Run a pull exchange at the next idle point, then return to the current phase.
    pub fn request_pull(&mut self, now: u64) -> Result<Vec<SessionEvent>, SessionError> {
        if self.session.is_closed() {
            return Err(SessionError::Closed);
        }
        if self.pull_handler.is_none() {
            return Err(SessionError::NoPullHandler);
        }
        self.pull_queued = true;
        self.pull_done = false;
        let mut events = Vec::new();
        self.advance(now, &mut events);
        Ok(events)
    }

    /// Close locally, telling the peer.
    pub fn close(&mut self, reason: CloseReason) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        self.terminate(reason, true, &mut events);
        events
    }

    /// Feed one envelope received from the peer.
    pub fn on_message(&mut self, bytes: &[u8], now: u64) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if self.session.is_closed() {
            debug!(session = %self.session.session_id, "message after close ignored");
            return events;
        }
        let message = match wire::decode_message(bytes) {
            Ok(message) => message,
            Err(e) => {
                self.fail(e.into(), &mut events);
                return events;
            }
        };
        match message.action {
            ActionTag::CloseWithSuccess => {
                self.terminate(CloseReason::Success, false, &mut events);
                return events;
            }
            ActionTag::CloseWithError => {
                let close = message
                    .payload_as::<CloseWithError>()
                    .unwrap_or(CloseWithError {
                        error_code: CODE_GENERIC,
                        error_message: None,
                    });
                let cause = CloseCause::PeerClosed {
                    code: close.error_code,
                    message: close.error_message,
                };
                self.terminate(cause.into(), false, &mut events);
                return events;
            }
            _ => {}
        }
        let Some(request) = self.pending.take(&message.id) else {
            warn!(
                session = %self.session.session_id,
                id = %message.id,
                action = %message.action,
                "response without outstanding request ignored"
            );
            return events;
        };
        if let Err(cause) = self.on_response(request.kind, &message, now, &mut events) {
            self.fail(cause, &mut events);
            return events;
        }
        self.advance(now, &mut events);
        events
    }

    /// Advance time: re-send or give up on overdue requests, expire a suspended transport.
    pub fn tick(&mut self, now: u64) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if self.session.is_closed() {
            return events;
        }
        if let Some(since) = self.suspended_since {
            if now.saturating_sub(since) > self.config.reconnect_grace_ticks {
                warn!(session = %self.session.session_id, "no reconnect within grace period");
                self.terminate(CloseCause::TransportLost.into(), false, &mut events);
            }
            return events;
        }
        let expired = self.pending.expire(
            now,
            self.config.request_timeout_ticks,
            self.config.max_retries,
        );
        for expiry in expired {
            match expiry {
                Expiry::Resend(frame) => {
                    warn!(session = %self.session.session_id, "request timed out; re-sending");
                    events.push(SessionEvent::Send(frame));
                }
                Expiry::GiveUp(request) => {
                    let action = request.kind.action();
                    self.fail(CloseCause::Timeout { action }, &mut events);
                }
            }
        }
        events
    }

    /// The transport dropped. Without a continuation token the session is over;
    /// with one it waits for [`InitiatorSession::on_reconnected`].
    pub fn on_transport_lost(&mut self, now: u64) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if self.session.is_closed() || self.suspended_since.is_some() {
            return events;
        }
        if !self.continuation_issued {
            self.terminate(CloseCause::TransportLost.into(), false, &mut events);
            return events;
        }
        self.interrupted = self
            .pending
            .drain()
            .into_iter()
            .find(|request| request.kind.replays_on_reconnect());
        if let Some(index) = self
            .session
            .transfer
            .as_mut()
            .and_then(OutboundTransfer::cancel_in_flight)
        {
            debug!(session = %self.session.session_id, chunk_index = index, "in-flight chunk rolled back");
        }
        if self.interrupted.is_none()
            && self.session.phase() == &Phase::PullPending
            && self.session.finish_pull().is_ok()
        {
            self.pull_queued = true;
        }
        self.suspended_since = Some(now);
        info!(session = %self.session.session_id, "transport lost; awaiting reconnect");
        events
    }

    /// Transport is back: re-send an interrupted announce or pull exchange as it
    /// was, otherwise issue the next request from where the session stopped.
    pub fn on_reconnected(&mut self, now: u64) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if self.session.is_closed() || self.suspended_since.take().is_none() {
            return events;
        }
        info!(
            session = %self.session.session_id,
            next_chunk = ?self.session.transfer.as_ref().map(|t| t.state().next_chunk_index()),
            "transport restored; resuming"
        );
        if let Some(request) = self.interrupted.take() {
            let action = request.kind.action();
            let id = request.id;
            match self.pending.restore(request, now) {
                Ok(frame) => {
                    debug!(session = %self.session.session_id, action = %action, id = %id, "interrupted request re-sent");
                    events.push(SessionEvent::Send(frame));
                }
                Err(busy) => self.fail(CloseCause::Internal(busy.to_string()), &mut events),
            }
            return events;
        }
        self.advance(now, &mut events);
        events
    }

    fn on_response(
        &mut self,
        kind: Pending,
        message: &RawMessage,
        now: u64,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), CloseCause> {
        match kind {
            Pending::Hello => {
                let response = HelloRequest::decode_response(message)?;
                let features = negotiate_features(
                    &self.device.supported_features,
                    response.supported_features.as_deref(),
                );
                info!(
                    session = %self.session.session_id,
                    browser = %response.browser_name,
                    version = %response.browser_version,
                    features = ?features,
                    "hello exchanged"
                );
                self.session.set_negotiated_features(features);
                self.session.transition(Phase::HelloExchanged)?;
                self.peer_info = Some(response);
            }
            Pending::Challenge { salt } => {
                let response = ChallengeRequest::decode_response(message)?;
                let verified = wire::from_base64(&response.hkdf_salt_enc)
                    .ok()
                    .and_then(|sealed| {
                        self.session
                            .crypto()
                            .decrypt(&sealed, CryptoContext::Challenge)
                            .ok()
                    })
                    .is_some_and(|echo| echo == salt);
                if !verified {
                    return Err(CloseCause::SaltVerificationFailed);
                }
                self.session.transition(Phase::Challenged)?;
                info!(session = %self.session.session_id, "challenge verified; channel secured");
            }
            Pending::InitTransfer(transfer) => {
                InitTransferRequest::decode_response(message)?;
                info!(
                    session = %self.session.session_id,
                    total_chunks = transfer.state().total_chunks,
                    total_size = transfer.state().total_size,
                    "transfer confirmed"
                );
                self.session.transfer = Some(*transfer);
                self.queued_vault = None;
                self.session.transition(Phase::Transferring)?;
            }
            Pending::Chunk { index, last } => {
                self.on_chunk_confirmed(message, index, last, events)?;
            }
            Pending::PullRequest => self.on_pull_data(message, now, events)?,
            Pending::PullRequestAction => {
                PullRequestAction::decode_response(message)?;
                self.session.finish_pull()?;
                self.pull_done = true;
                info!(session = %self.session.session_id, "pull completed");
                events.push(SessionEvent::PullCompleted);
            }
        }
        Ok(())
    }

    fn on_chunk_confirmed(
        &mut self,
        message: &RawMessage,
        index: u32,
        last: bool,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), CloseCause> {
        if last {
            TransferLastChunk::decode_response(message)?;
        } else {
            let confirmed = TransferChunk::decode_response(message)?;
            if confirmed.chunk_index != index {
                return Err(CloseCause::ProtocolViolation(format!(
                    "chunk {index} confirmed as {}",
                    confirmed.chunk_index
                )));
            }
        }
        debug!(session = %self.session.session_id, chunk_index = index, "chunk confirmed");
        let transfer = self
            .session
            .transfer
            .as_mut()
            .ok_or_else(|| CloseCause::Internal("chunk confirmed without a transfer".into()))?;
        let complete = transfer.on_confirmed(index)?;
        if last {
            if !complete {
                return Err(CloseCause::ProtocolViolation(
                    "transfer completed with unacknowledged chunks".into(),
                ));
            }
            self.session.transition(Phase::Completed)?;
            info!(session = %self.session.session_id, "vault transfer completed");
            events.push(SessionEvent::TransferCompleted);
        }
        Ok(())
    }

    fn on_pull_data(
        &mut self,
        message: &RawMessage,
        now: u64,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), CloseCause> {
        let response = PullRequest::decode_response(message)?;
        let sealed = wire::from_base64(&response.data_enc)?;
        let request = self.session.crypto().decrypt(&sealed, CryptoContext::Pull)?;
        let handler = self
            .pull_handler
            .as_mut()
            .ok_or_else(|| CloseCause::from(SessionError::NoPullHandler))?;
        let answer = handler.on_pull(request)?;
        let data_enc = wire::to_base64(&self.session.crypto().encrypt(&answer, CryptoContext::Pull)?);
        self.issue(
            PullRequestAction { data_enc },
            Pending::PullRequestAction,
            now,
            events,
        )
    }

    /// Issue the next request the current phase calls for, if nothing is outstanding.
    fn drive(&mut self, now: u64, events: &mut Vec<SessionEvent>) -> Result<(), CloseCause> {
        if self.session.is_closed() || self.suspended_since.is_some() || !self.pending.is_empty() {
            return Ok(());
        }
        let phase = self.session.phase().clone();
        match phase {
            Phase::Idle | Phase::PullPending | Phase::Closed(_) => Ok(()),
            Phase::HelloExchanged => self.send_challenge(now, events),
            Phase::Challenged => {
                if self.wants_pull() {
                    self.send_pull_request(now, events)
                } else if self.hint.mode == ConnectMode::Pull {
                    if self.pull_done {
                        self.terminate(CloseReason::Success, true, events);
                    }
                    Ok(())
                } else if let Some(blob) = self.queued_vault.clone() {
                    self.send_init_transfer(blob, now, events)
                } else {
                    Ok(())
                }
            }
            Phase::Transferring => {
                if self.pull_queued && self.pull_handler.is_some() {
                    self.send_pull_request(now, events)
                } else {
                    self.send_next_chunk(now, events)
                }
            }
            Phase::Completed => {
                if self.wants_pull() {
                    self.send_pull_request(now, events)
                } else {
                    self.terminate(CloseReason::Success, true, events);
                    Ok(())
                }
            }
        }
    }

    fn advance(&mut self, now: u64, events: &mut Vec<SessionEvent>) {
        if let Err(cause) = self.drive(now, events) {
            self.fail(cause, events);
        }
    }

    fn wants_pull(&self) -> bool {
        if self.pull_handler.is_none() {
            return false;
        }
        if self.pull_queued {
            return true;
        }
        if self.pull_done {
            return false;
        }
        match self.hint.mode {
            ConnectMode::Pull => true,
            ConnectMode::Push => {
                self.session.phase() == &Phase::Completed && self.session.has_feature(Feature::Pull)
            }
        }
    }

    fn send_challenge(&mut self, now: u64, events: &mut Vec<SessionEvent>) -> Result<(), CloseCause> {
        let salt = crypto::generate_salt();
        let peer_key = self.hint.peer_public_key;
        self.session.crypto_mut().agree(&peer_key, &salt)?;
        let request = ChallengeRequest {
            pk_epke: self.session.crypto().ephemeral_public_key().to_base64(),
            hkdf_salt: wire::to_base64(&salt),
        };
        self.issue(request, Pending::Challenge { salt }, now, events)
    }

    fn send_init_transfer(
        &mut self,
        blob: VaultBlob,
        now: u64,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), CloseCause> {
        let crypto = self.session.crypto();
        // The digest and the chunks cover the sealed blob.
        let sealed = crypto.encrypt(&blob.data, CryptoContext::Transfer)?;
        let transfer =
            OutboundTransfer::new(sealed, self.config.chunk_size, self.new_session_id.clone());
        let state = transfer.state();
        let seal = |bytes: &[u8]| -> Result<String, CloseCause> {
            Ok(wire::to_base64(&crypto.encrypt(bytes, CryptoContext::Transfer)?))
        };
        let expiration_date_enc = match blob.expiration_date.as_deref() {
            Some(date) if self.session.has_feature(Feature::ExpirationDate) => {
                Some(seal(date.as_bytes())?)
            }
            _ => None,
        };
        let request = InitTransferRequest {
            total_chunks: state.total_chunks,
            total_size: state.total_size,
            sha256_gzip_vault_data_enc: seal(&state.expected_digest)?,
            fcm_token_enc: seal(self.device.fcm_token.as_bytes())?,
            new_session_id_enc: seal(&self.new_session_id)?,
            expiration_date_enc,
        };
        info!(
            session = %self.session.session_id,
            total_chunks = request.total_chunks,
            total_size = request.total_size,
            "announcing vault transfer"
        );
        self.continuation_issued = true;
        self.issue(request, Pending::InitTransfer(Box::new(transfer)), now, events)
    }

    fn send_next_chunk(&mut self, now: u64, events: &mut Vec<SessionEvent>) -> Result<(), CloseCause> {
        let transfer = self
            .session
            .transfer
            .as_mut()
            .ok_or_else(|| CloseCause::Internal("no transfer to continue".into()))?;
        match transfer.next_request()? {
            Some(ChunkRequest::Middle(payload)) => {
                let index = payload.chunk_index;
                self.issue(TransferChunk(payload), Pending::Chunk { index, last: false }, now, events)
            }
            Some(ChunkRequest::Last(payload)) => {
                let index = payload.chunk_index;
                self.issue(
                    TransferLastChunk(payload),
                    Pending::Chunk { index, last: true },
                    now,
                    events,
                )
            }
            None => Ok(()),
        }
    }

    fn send_pull_request(&mut self, now: u64, events: &mut Vec<SessionEvent>) -> Result<(), CloseCause> {
        let token = self
            .session
            .crypto()
            .encrypt(&self.new_session_id, CryptoContext::Pull)?;
        self.session.transition(Phase::PullPending)?;
        self.pull_queued = false;
        self.continuation_issued = true;
        info!(session = %self.session.session_id, "pull requested");
        self.issue(
            PullRequest {
                new_session_id_enc: wire::to_base64(&token),
            },
            Pending::PullRequest,
            now,
            events,
        )
    }

    fn issue<R: RequestExpectedResponse>(
        &mut self,
        request: R,
        kind: Pending,
        now: u64,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), CloseCause> {
        let message = request.into_message();
        let frame = wire::encode_message(&message)?;
        self.pending
            .insert(message.id, R::RESPONSE_ACTION, kind, frame.clone(), now)
            .map_err(|busy| CloseCause::Internal(busy.to_string()))?;
        debug!(
            session = %self.session.session_id,
            action = %R::ACTION,
            id = %message.id,
            "request sent"
        );
        events.push(SessionEvent::Send(frame));
        Ok(())
    }

    fn fail(&mut self, cause: CloseCause, events: &mut Vec<SessionEvent>) {
        self.terminate(CloseReason::Error(cause), true, events);
    }

    fn terminate(&mut self, reason: CloseReason, notify_peer: bool, events: &mut Vec<SessionEvent>) {
        if self.session.is_closed() {
            return;
        }
        self.pending.drain();
        self.interrupted = None;
        if let Some(transfer) = self.session.transfer.as_mut() {
            transfer.cancel_in_flight();
        }
        if notify_peer {
            let frame = match &reason {
                CloseReason::Success => wire::encode_message(&CloseWithSuccess::new().into_message()),
                CloseReason::Error(cause) => wire::encode_message(&cause.to_request().into_message()),
            };
            match frame {
                Ok(frame) => events.push(SessionEvent::Send(frame)),
                Err(e) => warn!(session = %self.session.session_id, error = %e, "close message not encodable"),
            }
        }
        match &reason {
            CloseReason::Success => info!(session = %self.session.session_id, "session closed"),
            CloseReason::Error(cause) => warn!(
                session = %self.session.session_id,
                code = cause.error_code(),
                cause = %cause,
                "session closed with error"
            ),
        }
        self.session.close(reason.clone());
        events.push(SessionEvent::Closed(reason));
    }
}
