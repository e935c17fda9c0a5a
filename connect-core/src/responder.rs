//! Responder role: the paired browser side. Answers every request, reassembles
//! the pushed vault and serves the pull flow.

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunk::{ChunkReceiveResult, InboundTransfer};
use crate::close::{CloseCause, CloseReason};
use crate::config::ConnectConfig;
use crate::crypto::{CryptoContext, CryptoEngine, PublicKey};
use crate::integrity;
use crate::protocol::{ActionTag, ConnectMessage, Empty};
use crate::requests::{
    negotiate_features, ChallengeRequest, ChallengeResponse, ChunkConfirmed, ChunkPayload,
    CloseWithSuccess, ConnectRequest, Feature, HelloRequest, HelloResponse, InboundRequest,
    InitTransferRequest, PullRequest, PullRequestAction, PullRequestResponse,
};
use crate::session::{Phase, Session, SessionEvent};
use crate::vault::{PullSource, VaultSource};
use crate::wire;

/// How the responder introduces itself in its `hello` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserInfo {
    pub browser_name: String,
    pub browser_version: String,
    pub browser_ext_name: String,
    pub supported_features: Vec<Feature>,
}

impl BrowserInfo {
    pub fn new(
        browser_name: impl Into<String>,
        browser_version: impl Into<String>,
        browser_ext_name: impl Into<String>,
    ) -> Self {
        Self {
            browser_name: browser_name.into(),
            browser_version: browser_version.into(),
            browser_ext_name: browser_ext_name.into(),
            supported_features: vec![Feature::Pull, Feature::ExpirationDate],
        }
    }
}

/// Data the initiator forwarded in `initTransfer`, decrypted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferMetadata {
    pub fcm_token: String,
    pub expiration_date: Option<String>,
}

pub struct ResponderSession {
    session: Session<InboundTransfer>,
    info: BrowserInfo,
    config: ConnectConfig,
    vault: Box<dyn VaultSource>,
    pull_source: Option<Box<dyn PullSource>>,
    device: Option<HelloRequest>,
    metadata: Option<TransferMetadata>,
    continuation: Option<Vec<u8>>,
    /// Reply to the most recent request, re-sent verbatim when the request is retried.
    last_reply: Option<(Uuid, Vec<u8>)>,
    /// Sealed answer to the open pull request, repeated if the request is re-issued.
    pull_answer: Option<String>,
    last_activity: u64,
    suspended_since: Option<u64>,
}

impl ResponderSession {
    /// `crypto` holds the long-lived pairing keypair whose public half the initiator scanned.
    pub fn new(
        session_id: impl Into<String>,
        info: BrowserInfo,
        crypto: Box<dyn CryptoEngine>,
        vault: Box<dyn VaultSource>,
        config: ConnectConfig,
    ) -> Self {
        Self {
            session: Session::new(session_id.into(), String::new(), crypto),
            info,
            config,
            vault,
            pull_source: None,
            device: None,
            metadata: None,
            continuation: None,
            last_reply: None,
            pull_answer: None,
            last_activity: 0,
            suspended_since: None,
        }
    }

    pub fn with_pull_source(mut self, source: Box<dyn PullSource>) -> Self {
        self.pull_source = Some(source);
        self
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

    /// The initiator's `hello`, once received.
    pub fn device(&self) -> Option<&HelloRequest> {
        self.device.as_ref()
    }

    pub fn metadata(&self) -> Option<&TransferMetadata> {
        self.metadata.as_ref()
    }

    /// Continuation token the initiator announced, used to match a reconnect.
    pub fn resume_token(&self) -> Option<&[u8]> {
        self.continuation.as_deref()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended_since.is_some()
    }

    /// The public key the initiator must have scanned to pair with this side.
    pub fn pairing_key(&self) -> PublicKey {
        self.session.crypto().ephemeral_public_key()
    }

    pub fn close(&mut self, reason: CloseReason) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        self.terminate(reason, true, &mut events);
        events
    }

    /// Feed one envelope received from the initiator.
    pub fn on_message(&mut self, bytes: &[u8], now: u64) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if self.session.is_closed() {
            debug!(session = %self.session.session_id, "message after close ignored");
            return events;
        }
        self.last_activity = now;
        let message = match wire::decode_message(bytes) {
            Ok(message) => message,
            Err(e) => {
                self.fail(e.into(), &mut events);
                return events;
            }
        };
        if let Some((id, frame)) = &self.last_reply {
            if *id == message.id {
                debug!(session = %self.session.session_id, id = %id, "repeated request; re-sending reply");
                events.push(SessionEvent::Send(frame.clone()));
                return events;
            }
        }
        let request = match InboundRequest::from_message(&message) {
            Ok(request) => request,
            Err(e) => {
                self.fail(e.into(), &mut events);
                return events;
            }
        };
        let id = message.id;
        let result = match request {
            InboundRequest::Hello(hello) => self.on_hello(id, hello, &mut events),
            InboundRequest::Challenge(challenge) => self.on_challenge(id, challenge, &mut events),
            InboundRequest::InitTransfer(announce) => {
                self.on_init_transfer(id, announce, &mut events)
            }
            InboundRequest::TransferChunk(chunk) => self.on_chunk(id, chunk, &mut events),
            InboundRequest::PullRequest(pull) => self.on_pull_request(id, pull, &mut events),
            InboundRequest::PullRequestAction(action) => {
                self.on_pull_action(id, action, &mut events)
            }
            InboundRequest::CloseWithSuccess => {
                self.terminate(CloseReason::Success, false, &mut events);
                Ok(())
            }
            InboundRequest::CloseWithError(close) => {
                let cause = CloseCause::PeerClosed {
                    code: close.error_code,
                    message: close.error_message,
                };
                self.terminate(cause.into(), false, &mut events);
                Ok(())
            }
        };
        if let Err(cause) = result {
            self.fail(cause, &mut events);
        }
        events
    }

    /// Advance time: close on a silent initiator or an expired reconnect grace.
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
        if now.saturating_sub(self.last_activity) > self.config.idle_timeout_ticks {
            let action = self.awaited_action();
            self.fail(CloseCause::Timeout { action }, &mut events);
        }
        events
    }

    pub fn on_transport_lost(&mut self, now: u64) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if self.session.is_closed() || self.suspended_since.is_some() {
            return events;
        }
        if self.continuation.is_none() {
            self.terminate(CloseCause::TransportLost.into(), false, &mut events);
            return events;
        }
        self.suspended_since = Some(now);
        info!(session = %self.session.session_id, "transport lost; awaiting reconnect");
        events
    }

    pub fn on_reconnected(&mut self, now: u64) -> Vec<SessionEvent> {
        if !self.session.is_closed() && self.suspended_since.take().is_some() {
            self.last_activity = now;
            info!(session = %self.session.session_id, phase = %self.session.phase(), "transport restored");
        }
        Vec::new()
    }

    fn awaited_action(&self) -> ActionTag {
        match self.session.phase() {
            Phase::Idle => ActionTag::Hello,
            Phase::HelloExchanged => ActionTag::Challenge,
            Phase::Challenged => ActionTag::InitTransfer,
            Phase::Transferring => ActionTag::TransferChunk,
            Phase::PullPending => ActionTag::PullRequestAction,
            Phase::Completed | Phase::Closed(_) => ActionTag::CloseWithSuccess,
        }
    }

    fn expect_phase(&self, action: ActionTag, allowed: &[Phase]) -> Result<(), CloseCause> {
        if allowed.contains(self.session.phase()) {
            return Ok(());
        }
        Err(CloseCause::ProtocolViolation(format!(
            "{action} not allowed while {}",
            self.session.phase()
        )))
    }

    fn on_hello(
        &mut self,
        id: Uuid,
        hello: HelloRequest,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), CloseCause> {
        self.expect_phase(HelloRequest::ACTION, &[Phase::Idle])?;
        let advertised: Vec<Feature> = self
            .info
            .supported_features
            .iter()
            .copied()
            .filter(|f| *f != Feature::Pull || self.pull_source.is_some())
            .collect();
        let features = negotiate_features(&advertised, hello.supported_features.as_deref());
        info!(
            session = %self.session.session_id,
            device = %hello.device_name,
            os = %hello.device_os,
            features = ?features,
            "hello received"
        );
        self.session.peer_id = hello.device_id.clone();
        self.session.set_negotiated_features(features);
        self.session.transition(Phase::HelloExchanged)?;
        self.device = Some(hello);
        let response = HelloResponse {
            browser_name: self.info.browser_name.clone(),
            browser_version: self.info.browser_version.clone(),
            browser_ext_name: self.info.browser_ext_name.clone(),
            supported_features: Some(advertised),
        };
        self.reply(id, ActionTag::Hello, response, events)
    }

    fn on_challenge(
        &mut self,
        id: Uuid,
        challenge: ChallengeRequest,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), CloseCause> {
        self.expect_phase(ChallengeRequest::ACTION, &[Phase::HelloExchanged])?;
        let ephemeral = PublicKey::from_base64(&challenge.pk_epke)?;
        let salt = wire::from_base64(&challenge.hkdf_salt)?;
        let echo = self
            .session
            .crypto_mut()
            .derive_challenge_response(&ephemeral, &salt)?;
        self.session.transition(Phase::Challenged)?;
        info!(session = %self.session.session_id, "challenge answered");
        self.reply(
            id,
            ActionTag::Challenge,
            ChallengeResponse {
                hkdf_salt_enc: wire::to_base64(&echo),
            },
            events,
        )
    }

    fn open(&self, sealed_b64: &str, context: CryptoContext) -> Result<Vec<u8>, CloseCause> {
        let sealed = wire::from_base64(sealed_b64)?;
        Ok(self.session.crypto().decrypt(&sealed, context)?)
    }

    fn on_init_transfer(
        &mut self,
        id: Uuid,
        announce: InitTransferRequest,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), CloseCause> {
        self.expect_phase(
            InitTransferRequest::ACTION,
            &[Phase::Challenged, Phase::Transferring],
        )?;
        let digest = self.open(&announce.sha256_gzip_vault_data_enc, CryptoContext::Transfer)?;
        let digest = integrity::hash_from_slice(&digest)
            .ok_or_else(|| CloseCause::ProtocolViolation("vault digest is not 32 bytes".into()))?;
        let token = self.open(&announce.new_session_id_enc, CryptoContext::Transfer)?;
        let reannounce = self.session.phase() == &Phase::Transferring;
        if reannounce {
            // Same session, nothing received yet: the new plan replaces the old one.
            let untouched = self
                .session
                .transfer
                .as_ref()
                .is_some_and(|t| t.next_expected() == 0);
            if !untouched || self.continuation.as_deref() != Some(token.as_slice()) {
                return Err(CloseCause::ProtocolViolation(format!(
                    "{} not allowed while {}",
                    InitTransferRequest::ACTION,
                    self.session.phase()
                )));
            }
        }
        let fcm_token = self.open(&announce.fcm_token_enc, CryptoContext::Transfer)?;
        let expiration_date = match announce.expiration_date_enc.as_deref() {
            Some(sealed) if self.session.has_feature(Feature::ExpirationDate) => {
                let date = self.open(sealed, CryptoContext::Transfer)?;
                Some(String::from_utf8_lossy(&date).into_owned())
            }
            _ => None,
        };
        let transfer = InboundTransfer::new(announce.total_chunks, announce.total_size, digest)?;
        info!(
            session = %self.session.session_id,
            total_chunks = announce.total_chunks,
            total_size = announce.total_size,
            reannounce,
            "vault transfer announced"
        );
        self.session.transfer = Some(transfer);
        self.continuation = Some(token);
        self.metadata = Some(TransferMetadata {
            fcm_token: String::from_utf8_lossy(&fcm_token).into_owned(),
            expiration_date,
        });
        if !reannounce {
            self.session.transition(Phase::Transferring)?;
        }
        self.reply(id, ActionTag::InitTransferConfirmed, Empty, events)
    }

    fn on_chunk(
        &mut self,
        id: Uuid,
        chunk: ChunkPayload,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), CloseCause> {
        self.expect_phase(
            ActionTag::TransferChunk,
            &[Phase::Transferring, Phase::Completed],
        )?;
        let data = wire::from_base64(&chunk.chunk_data)?;
        let transfer = self
            .session
            .transfer
            .as_mut()
            .ok_or_else(|| CloseCause::ProtocolViolation("chunk before initTransfer".into()))?;
        match transfer.accept(chunk.chunk_index, chunk.chunk_size, &data)? {
            ChunkReceiveResult::InProgress { index } => {
                debug!(session = %self.session.session_id, chunk_index = index, "chunk stored");
                self.reply(
                    id,
                    ActionTag::TransferChunkConfirmed,
                    ChunkConfirmed { chunk_index: index },
                    events,
                )
            }
            ChunkReceiveResult::Complete(sealed) => {
                // The digest matched; a seal that does not open is an integrity failure too.
                let blob = self
                    .session
                    .crypto()
                    .decrypt(&sealed, CryptoContext::Transfer)
                    .map_err(|_| CloseCause::DigestMismatch)?;
                let size = blob.len();
                self.vault.accept_blob(blob)?;
                self.session.transition(Phase::Completed)?;
                info!(session = %self.session.session_id, size, "vault received and verified");
                events.push(SessionEvent::TransferCompleted);
                self.reply(id, ActionTag::TransferCompleted, Empty, events)
            }
            ChunkReceiveResult::AlreadyDelivered { index } => {
                debug!(session = %self.session.session_id, chunk_index = index, "last chunk repeated");
                self.reply(id, ActionTag::TransferCompleted, Empty, events)
            }
        }
    }

    fn on_pull_request(
        &mut self,
        id: Uuid,
        pull: PullRequest,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), CloseCause> {
        self.expect_phase(
            PullRequest::ACTION,
            &[
                Phase::Challenged,
                Phase::Transferring,
                Phase::Completed,
                Phase::PullPending,
            ],
        )?;
        let token = self.open(&pull.new_session_id_enc, CryptoContext::Pull)?;
        if self.session.phase() == &Phase::PullPending {
            let data_enc = self
                .pull_answer
                .clone()
                .filter(|_| self.continuation.as_deref() == Some(token.as_slice()))
                .ok_or_else(|| {
                    CloseCause::ProtocolViolation(format!(
                        "{} not allowed while {}",
                        PullRequest::ACTION,
                        self.session.phase()
                    ))
                })?;
            debug!(session = %self.session.session_id, "pull request re-issued; answering again");
            return self.reply(
                id,
                ActionTag::PullRequest,
                PullRequestResponse { data_enc },
                events,
            );
        }
        let source = self
            .pull_source
            .as_mut()
            .ok_or_else(|| CloseCause::ProtocolViolation("pull is not served here".into()))?;
        let data = source.pull_data()?;
        let data_enc = wire::to_base64(&self.session.crypto().encrypt(&data, CryptoContext::Pull)?);
        self.continuation = Some(token);
        self.session.transition(Phase::PullPending)?;
        self.pull_answer = Some(data_enc.clone());
        info!(session = %self.session.session_id, "pull request answered");
        self.reply(
            id,
            ActionTag::PullRequest,
            PullRequestResponse { data_enc },
            events,
        )
    }

    fn on_pull_action(
        &mut self,
        id: Uuid,
        action: PullRequestAction,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), CloseCause> {
        self.expect_phase(PullRequestAction::ACTION, &[Phase::PullPending])?;
        let data = self.open(&action.data_enc, CryptoContext::Pull)?;
        let source = self
            .pull_source
            .as_mut()
            .ok_or_else(|| CloseCause::ProtocolViolation("pull is not served here".into()))?;
        source.on_pull_action(data)?;
        self.pull_answer = None;
        let resumed = self.session.finish_pull()?;
        info!(session = %self.session.session_id, resumed = %resumed, "pull completed");
        events.push(SessionEvent::PullCompleted);
        self.reply(id, ActionTag::PullRequestCompleted, Empty, events)
    }

    fn reply<P: Serialize>(
        &mut self,
        id: Uuid,
        action: ActionTag,
        payload: P,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), CloseCause> {
        let frame = wire::encode_message(&ConnectMessage::reply(id, action, payload))?;
        self.last_reply = Some((id, frame.clone()));
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
        self.last_reply = None;
        self.pull_answer = None;
        self.session.close(reason.clone());
        events.push(SessionEvent::Closed(reason));
    }
}
