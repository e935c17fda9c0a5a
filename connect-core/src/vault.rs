//! Vault collaborator: supplies the blob to push and accepts the blob a transfer delivers.
//! Also the pull-flow hooks on both sides.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::close::CloseCause;

/// Source of the gzip-compressed, pre-encrypted vault blob, and sink for reassembled blobs.
pub trait VaultSource: Send {
    fn vault_blob(&mut self) -> Result<Vec<u8>, VaultError>;

    fn accept_blob(&mut self, blob: Vec<u8>) -> Result<(), VaultError>;
}

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("missing item: {0}")]
    MissingItem(String),
    #[error("vault unavailable: {0}")]
    Unavailable(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<VaultError> for CloseCause {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::MissingItem(item) => CloseCause::MissingItem(item),
            VaultError::Unavailable(msg) => CloseCause::VaultUnavailable(msg),
            VaultError::Io(e) => CloseCause::VaultUnavailable(e.to_string()),
        }
    }
}

/// A blob queued for pushing, with the optional V2 expiration date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultBlob {
    pub data: Vec<u8>,
    pub expiration_date: Option<String>,
}

impl From<Vec<u8>> for VaultBlob {
    fn from(data: Vec<u8>) -> Self {
        Self {
            data,
            expiration_date: None,
        }
    }
}

/// In-memory vault: one blob to hand out, every accepted blob kept in order.
#[derive(Debug, Default)]
pub struct MemoryVault {
    blob: Option<Vec<u8>>,
    received: Vec<Vec<u8>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(blob: Vec<u8>) -> Self {
        Self {
            blob: Some(blob),
            received: Vec::new(),
        }
    }

    pub fn received(&self) -> &[Vec<u8>] {
        &self.received
    }
}

impl VaultSource for MemoryVault {
    fn vault_blob(&mut self) -> Result<Vec<u8>, VaultError> {
        self.blob
            .clone()
            .ok_or_else(|| VaultError::MissingItem("vault".into()))
    }

    fn accept_blob(&mut self, blob: Vec<u8>) -> Result<(), VaultError> {
        self.received.push(blob);
        Ok(())
    }
}

pub fn gzip_vault(plaintext: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(plaintext)?;
    encoder.finish()
}

pub fn gunzip_vault(blob: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(blob).read_to_end(&mut out)?;
    Ok(out)
}

/// Initiator side of the pull flow: turns the peer's decrypted request into the
/// plaintext answer sent back in `pullRequestAction`.
pub trait PullHandler: Send {
    fn on_pull(&mut self, request: Vec<u8>) -> Result<Vec<u8>, PullError>;
}

impl<F> PullHandler for F
where
    F: FnMut(Vec<u8>) -> Result<Vec<u8>, PullError> + Send,
{
    fn on_pull(&mut self, request: Vec<u8>) -> Result<Vec<u8>, PullError> {
        self(request)
    }
}

/// Responder side of the pull flow: the data handed out on `pullRequest` and the
/// sink for the initiator's `pullRequestAction`.
pub trait PullSource: Send {
    fn pull_data(&mut self) -> Result<Vec<u8>, PullError>;

    fn on_pull_action(&mut self, data: Vec<u8>) -> Result<(), PullError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PullError {
    #[error("missing item: {0}")]
    MissingItem(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<PullError> for CloseCause {
    fn from(err: PullError) -> Self {
        match err {
            PullError::MissingItem(item) => CloseCause::MissingItem(item),
            PullError::Rejected(msg) => CloseCause::PullRejected(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_roundtrip() {
        let plain = br#"{"items":[{"name":"mail","password":"hunter2"}]}"#.repeat(20);
        let packed = gzip_vault(&plain).unwrap();
        assert!(packed.len() < plain.len());
        assert_eq!(gunzip_vault(&packed).unwrap(), plain);
    }

    #[test]
    fn gunzip_rejects_garbage() {
        assert!(gunzip_vault(b"plain text").is_err());
    }

    #[test]
    fn memory_vault_without_blob_is_missing_item() {
        let mut vault = MemoryVault::new();
        let err = vault.vault_blob().unwrap_err();
        assert_eq!(CloseCause::from(err).error_code(), 1001);
    }

    #[test]
    fn memory_vault_keeps_received() {
        let mut vault = MemoryVault::with_blob(vec![1, 2, 3]);
        assert_eq!(vault.vault_blob().unwrap(), vec![1, 2, 3]);
        vault.accept_blob(vec![9]).unwrap();
        assert_eq!(vault.received(), &[vec![9]]);
    }

    #[test]
    fn closure_pull_handler() {
        let mut handler = |req: Vec<u8>| -> Result<Vec<u8>, PullError> {
            if req.is_empty() {
                Err(PullError::MissingItem("item".into()))
            } else {
                Ok(req.into_iter().rev().collect())
            }
        };
        assert_eq!(handler.on_pull(vec![1, 2]).unwrap(), vec![2, 1]);
        let err = handler.on_pull(Vec::new()).unwrap_err();
        assert_eq!(CloseCause::from(err).error_code(), 1001);
    }

    #[test]
    fn rejected_pull_maps_to_generic_code() {
        assert_eq!(
            CloseCause::from(PullError::Rejected("no".into())).error_code(),
            1000
        );
    }
}
