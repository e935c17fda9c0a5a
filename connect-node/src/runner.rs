//! Drives sessions over a transport: inbound frames and a periodic tick go into the
//! protocol core, the actions it returns go out.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use connect_core::{
    BrowserInfo, CloseReason, ConnectConfig, ConnectCore, ConnectMode, DeviceInfo, Keypair,
    OutboundAction, PairingCrypto, PeerHint, PublicKey, ResponderSession, SessionEvent,
    SessionHandle, VaultSource,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::store::{self, FileVault};
use crate::transport::{self, ResumeRegistry, TcpTransport, Transport, TransportEvent};

/// Run the initiator session `handle` until it closes. `initial` are the actions
/// returned while setting the session up.
pub async fn run_initiator<T: Transport>(
    core: &mut ConnectCore,
    handle: SessionHandle,
    initial: Vec<OutboundAction>,
    transport: &mut T,
    tick: Duration,
) -> anyhow::Result<CloseReason> {
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pending: VecDeque<OutboundAction> = initial.into();
    loop {
        while let Some(action) = pending.pop_front() {
            match action {
                OutboundAction::SendMessage(_, bytes) => send_or_warn(transport, &bytes).await,
                OutboundAction::TransferCompleted(h) => info!(session = %h, "vault delivered"),
                OutboundAction::PullCompleted(h) => info!(session = %h, "pull answered"),
                OutboundAction::SessionClosed(h, reason) if h == handle => return Ok(reason),
                OutboundAction::SessionClosed(h, _) => debug!(session = %h, "other session closed"),
            }
        }
        transport.set_resume_token(core.resume_token(handle));
        let event = tokio::select! {
            _ = ticker.tick() => None,
            event = transport.next_event() => Some(event),
        };
        let actions = match event {
            None => core.tick(),
            Some(TransportEvent::Message(bytes)) => core.on_message_received(handle, &bytes)?,
            Some(TransportEvent::Lost) => core.on_transport_lost(handle)?,
            Some(TransportEvent::Reconnected) => core.on_reconnected(handle)?,
        };
        pending.extend(actions);
    }
}

/// Run a responder session until it closes.
pub async fn run_responder<T: Transport>(
    session: &mut ResponderSession,
    transport: &mut T,
    tick: Duration,
) -> anyhow::Result<CloseReason> {
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut now = 0u64;
    let mut pending: VecDeque<SessionEvent> = VecDeque::new();
    loop {
        while let Some(event) = pending.pop_front() {
            match event {
                SessionEvent::Send(bytes) => send_or_warn(transport, &bytes).await,
                SessionEvent::TransferCompleted => {
                    info!(session = %session.session_id(), "vault received")
                }
                SessionEvent::PullCompleted => {
                    info!(session = %session.session_id(), "pull served")
                }
                SessionEvent::Closed(reason) => return Ok(reason),
            }
        }
        transport.set_resume_token(session.resume_token());
        let event = tokio::select! {
            _ = ticker.tick() => None,
            event = transport.next_event() => Some(event),
        };
        let events = match event {
            None => {
                now += 1;
                session.tick(now)
            }
            Some(TransportEvent::Message(bytes)) => session.on_message(&bytes, now),
            Some(TransportEvent::Lost) => session.on_transport_lost(now),
            Some(TransportEvent::Reconnected) => session.on_reconnected(now),
        };
        pending.extend(events);
    }
}

// A failed send surfaces as `Lost` from the transport's next event.
async fn send_or_warn<T: Transport>(transport: &mut T, bytes: &[u8]) {
    if let Err(e) = transport.send(bytes).await {
        warn!(error = %e, "send failed");
    }
}

fn outcome(reason: CloseReason) -> anyhow::Result<()> {
    match reason {
        CloseReason::Success => Ok(()),
        CloseReason::Error(cause) => {
            bail!("session closed with code {}: {}", cause.error_code(), cause)
        }
    }
}

/// Pair with the listener at `peer` and push the blob `vault` supplies.
pub async fn push(
    peer: SocketAddr,
    peer_key: PublicKey,
    vault: &mut dyn VaultSource,
    cfg: &Config,
) -> anyhow::Result<()> {
    let mut transport = TcpTransport::connect(peer).await?;
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let device = DeviceInfo::new(
        format!("{}-{}", cfg.device_name, std::process::id()),
        cfg.device_name.clone(),
        std::env::consts::OS,
    );
    let mut core = ConnectCore::with_config(device, cfg.connect_config());
    let hint = PeerHint {
        session_id: format!("{}-{stamp}", cfg.device_name),
        peer_id: peer.to_string(),
        peer_public_key: peer_key,
        mode: ConnectMode::Push,
    };
    let (handle, mut actions) = core.begin_pairing(hint);
    actions.extend(core.push_vault_from(handle, vault)?);
    let reason = run_initiator(&mut core, handle, actions, &mut transport, cfg.tick()).await?;
    outcome(reason)?;
    info!(peer = %peer, "push complete");
    Ok(())
}

/// Shared state of the responder listener.
pub struct ListenContext {
    pub pairing_secret: [u8; 32],
    pub info: BrowserInfo,
    pub config: ConnectConfig,
    pub tick: Duration,
    /// Vault each accepted session delivers into.
    pub vault: Box<dyn Fn() -> Box<dyn VaultSource> + Send + Sync>,
    pub registry: ResumeRegistry,
}

/// Listen on `port`, writing each received vault to `out`.
pub async fn listen(port: u16, out: PathBuf, cfg: &Config) -> anyhow::Result<()> {
    let keypair = store::load_or_create_keypair(cfg.key_file.as_deref())?;
    println!("pairing key: {}", keypair.public_key().to_base64());
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("bind port {port}"))?;
    info!(port, out = %out.display(), "listening");
    let ctx = Arc::new(ListenContext {
        pairing_secret: keypair.secret_bytes(),
        info: BrowserInfo::new("connect-node", crate::VERSION, "connect-node"),
        config: cfg.connect_config(),
        tick: cfg.tick(),
        vault: Box::new(move || -> Box<dyn VaultSource> { Box::new(FileVault::new(out.clone())) }),
        registry: ResumeRegistry::default(),
    });
    serve(listener, ctx).await
}

/// Accept loop: one responder session per fresh connection; resuming connections are
/// handed to their suspended session.
pub async fn serve(listener: TcpListener, ctx: Arc<ListenContext>) -> anyhow::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await.context("accept")?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, ctx).await {
                warn!(peer = %addr, error = %e, "connection failed");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<ListenContext>,
) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let token = transport::read_preface(&mut stream).await?;
    if !token.is_empty() {
        if transport::hand_over(&ctx.registry, &token, stream).await? {
            info!(peer = %addr, "connection resumed a session");
        } else {
            warn!(peer = %addr, "unknown resume token, dropping connection");
        }
        return Ok(());
    }

    let crypto = PairingCrypto::new(Keypair::from_secret_bytes(ctx.pairing_secret));
    let mut session = ResponderSession::new(
        addr.to_string(),
        ctx.info.clone(),
        Box::new(crypto),
        (ctx.vault)(),
        ctx.config.clone(),
    );
    let mut transport = TcpTransport::accepted(stream, ctx.registry.clone());
    info!(peer = %addr, "session accepted");
    let reason = run_responder(&mut session, &mut transport, ctx.tick).await?;
    match reason.error_code() {
        None => info!(peer = %addr, "session closed"),
        Some(code) => warn!(peer = %addr, code, "session closed with error"),
    }
    Ok(())
}
