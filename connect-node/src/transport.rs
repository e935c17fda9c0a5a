//! Stream transport for sessions: length-prefixed envelopes over TCP.
//!
//! Every connection opens with a preface frame carrying the resume token (empty for a
//! fresh session). The dialing side re-dials after a drop; the listening side waits for
//! the listener to hand over a new stream presenting its token.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use connect_core::{decode_frame, encode_frame, FrameDecodeError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const READ_RESERVE: usize = 64 * 1024;
const REDIAL_DELAY: Duration = Duration::from_secs(1);
const PREFACE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_TOKEN_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete envelope.
    Message(Vec<u8>),
    Lost,
    Reconnected,
}

/// Byte pipe under a session.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: &[u8]) -> anyhow::Result<()>;

    /// Next inbound event. Cancel safe: callers race it against the tick timer.
    async fn next_event(&mut self) -> TransportEvent;

    /// Token the session will present when the link comes back.
    fn set_resume_token(&mut self, _token: Option<&[u8]>) {}
}

/// Suspended listener-side sessions, keyed by resume token.
pub type ResumeRegistry = Arc<Mutex<HashMap<Vec<u8>, mpsc::Sender<TcpStream>>>>;

type Dial = Pin<Box<dyn Future<Output = anyhow::Result<TcpStream>> + Send>>;

enum Reconnect {
    Dial {
        addr: SocketAddr,
        token: Vec<u8>,
        attempt: Option<Dial>,
    },
    Handover {
        registry: ResumeRegistry,
        tx: mpsc::Sender<TcpStream>,
        rx: mpsc::Receiver<TcpStream>,
        token: Option<Vec<u8>>,
    },
}

pub struct TcpTransport {
    stream: Option<TcpStream>,
    buffer: Vec<u8>,
    lost_reported: bool,
    reconnect: Reconnect,
}

impl TcpTransport {
    /// Dial `addr` for a fresh session.
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = dial(addr, Vec::new()).await?;
        Ok(Self::with_stream(
            stream,
            Reconnect::Dial {
                addr,
                token: Vec::new(),
                attempt: None,
            },
        ))
    }

    /// Wrap a stream the listener accepted for a fresh session.
    pub fn accepted(stream: TcpStream, registry: ResumeRegistry) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self::with_stream(
            stream,
            Reconnect::Handover {
                registry,
                tx,
                rx,
                token: None,
            },
        )
    }

    fn with_stream(stream: TcpStream, reconnect: Reconnect) -> Self {
        Self {
            stream: Some(stream),
            buffer: Vec::new(),
            lost_reported: false,
            reconnect,
        }
    }

    fn take_frame(&mut self) -> Result<Option<Vec<u8>>, FrameDecodeError> {
        match decode_frame(&self.buffer) {
            Ok((payload, consumed)) => {
                let frame = payload.to_vec();
                self.buffer.drain(..consumed);
                Ok(Some(frame))
            }
            Err(FrameDecodeError::NeedMore) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn drop_stream(&mut self) {
        self.stream = None;
        self.buffer.clear();
    }

    async fn reestablish(&mut self) -> TcpStream {
        match &mut self.reconnect {
            Reconnect::Dial {
                addr,
                token,
                attempt,
            } => loop {
                let dial = attempt.get_or_insert_with(|| Box::pin(redial(*addr, token.clone())));
                let result = dial.await;
                *attempt = None;
                match result {
                    Ok(stream) => return stream,
                    Err(e) => warn!(peer = %addr, error = %e, "redial failed"),
                }
            },
            Reconnect::Handover { rx, .. } => match rx.recv().await {
                Some(stream) => stream,
                // Every sender gone: nobody can resume us. The session's grace timer ends it.
                None => std::future::pending::<TcpStream>().await,
            },
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            bail!("transport is down");
        };
        let bytes = encode_frame(frame)?;
        if let Err(e) = stream.write_all(&bytes).await {
            self.drop_stream();
            return Err(e).context("write frame");
        }
        Ok(())
    }

    async fn next_event(&mut self) -> TransportEvent {
        loop {
            if self.stream.is_none() {
                if !self.lost_reported {
                    self.lost_reported = true;
                    return TransportEvent::Lost;
                }
                let stream = self.reestablish().await;
                self.stream = Some(stream);
                self.lost_reported = false;
                info!("transport reconnected");
                return TransportEvent::Reconnected;
            }
            match self.take_frame() {
                Ok(Some(frame)) => return TransportEvent::Message(frame),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "bad frame, dropping connection");
                    self.drop_stream();
                    continue;
                }
            }
            let Some(stream) = self.stream.as_mut() else {
                continue;
            };
            self.buffer.reserve(READ_RESERVE);
            match stream.read_buf(&mut self.buffer).await {
                Ok(0) => {
                    debug!("peer closed the connection");
                    self.drop_stream();
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "read failed");
                    self.drop_stream();
                }
            }
        }
    }

    fn set_resume_token(&mut self, token: Option<&[u8]>) {
        let Some(token) = token else {
            return;
        };
        match &mut self.reconnect {
            Reconnect::Dial { token: current, .. } => {
                if current.as_slice() != token {
                    *current = token.to_vec();
                }
            }
            Reconnect::Handover {
                registry,
                tx,
                token: registered,
                ..
            } => {
                if registered.as_deref() == Some(token) {
                    return;
                }
                if let Ok(mut map) = registry.lock() {
                    map.insert(token.to_vec(), tx.clone());
                    debug!("resume token registered");
                }
                *registered = Some(token.to_vec());
            }
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Reconnect::Handover {
            registry,
            token: Some(token),
            ..
        } = &self.reconnect
        {
            if let Ok(mut map) = registry.lock() {
                map.remove(token);
            }
        }
    }
}

async fn dial(addr: SocketAddr, token: Vec<u8>) -> anyhow::Result<TcpStream> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connect to {addr}"))?;
    stream.set_nodelay(true)?;
    stream.write_all(&encode_frame(&token)?).await?;
    Ok(stream)
}

async fn redial(addr: SocketAddr, token: Vec<u8>) -> anyhow::Result<TcpStream> {
    tokio::time::sleep(REDIAL_DELAY).await;
    dial(addr, token).await
}

/// Read the preface frame a new connection opens with. Empty means a fresh session.
pub async fn read_preface(stream: &mut TcpStream) -> anyhow::Result<Vec<u8>> {
    let read = async {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await?;
        let len = u32::from_le_bytes(len) as usize;
        if len > MAX_TOKEN_LEN {
            bail!("preface too large ({len} bytes)");
        }
        let mut token = vec![0u8; len];
        stream.read_exact(&mut token).await?;
        Ok::<_, anyhow::Error>(token)
    };
    tokio::time::timeout(PREFACE_TIMEOUT, read)
        .await
        .context("preface timed out")?
}

/// Pass a resuming connection to the suspended session holding `token`.
/// Returns false when no session is waiting on it.
pub async fn hand_over(
    registry: &ResumeRegistry,
    token: &[u8],
    stream: TcpStream,
) -> anyhow::Result<bool> {
    let sender = match registry.lock() {
        Ok(map) => map.get(token).cloned(),
        Err(_) => bail!("resume registry poisoned"),
    };
    let Some(sender) = sender else {
        return Ok(false);
    };
    if sender.send(stream).await.is_err() {
        return Ok(false);
    }
    Ok(true)
}

/// In-process transport pair for tests.
#[cfg(test)]
pub(crate) mod channel {
    use super::*;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    pub struct ChannelTransport {
        peer: UnboundedSender<TransportEvent>,
        inbox: UnboundedReceiver<TransportEvent>,
        own: UnboundedSender<TransportEvent>,
    }

    impl ChannelTransport {
        pub fn pair() -> (Self, Self) {
            let (a_tx, a_rx) = unbounded_channel();
            let (b_tx, b_rx) = unbounded_channel();
            (
                Self {
                    peer: b_tx.clone(),
                    inbox: a_rx,
                    own: a_tx.clone(),
                },
                Self {
                    peer: a_tx,
                    inbox: b_rx,
                    own: b_tx,
                },
            )
        }

        /// Sender into this side's own inbox, for injecting link events.
        pub fn injector(&self) -> UnboundedSender<TransportEvent> {
            self.own.clone()
        }
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send(&mut self, frame: &[u8]) -> anyhow::Result<()> {
            self.peer
                .send(TransportEvent::Message(frame.to_vec()))
                .map_err(|_| anyhow::anyhow!("peer gone"))
        }

        async fn next_event(&mut self) -> TransportEvent {
            match self.inbox.recv().await {
                Some(event) => event,
                None => std::future::pending().await,
            }
        }
    }
}
