//! On-disk state: the vault file a session pushes or receives, and the listener's pairing key.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use connect_core::vault::{gunzip_vault, gzip_vault};
use connect_core::{Keypair, VaultError, VaultSource};
use tracing::info;

/// Vault backed by a plain file. Pushing gzips its content; a received blob is gunzipped into it.
pub struct FileVault {
    path: PathBuf,
}

impl FileVault {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl VaultSource for FileVault {
    fn vault_blob(&mut self) -> Result<Vec<u8>, VaultError> {
        let plain = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(VaultError::MissingItem(self.path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(gzip_vault(&plain)?)
    }

    fn accept_blob(&mut self, blob: Vec<u8>) -> Result<(), VaultError> {
        let plain = gunzip_vault(&blob)?;
        std::fs::write(&self.path, &plain)?;
        info!(path = %self.path.display(), bytes = plain.len(), "vault written");
        Ok(())
    }
}

/// Load the pairing key from `path`, creating it on first use. `None`: a fresh key.
pub fn load_or_create_keypair(path: Option<&Path>) -> anyhow::Result<Keypair> {
    let Some(path) = path else {
        return Ok(Keypair::generate());
    };
    match std::fs::read_to_string(path) {
        Ok(s) => {
            let bytes = STANDARD
                .decode(s.trim())
                .with_context(|| format!("decode key file {}", path.display()))?;
            let Ok(secret) = <[u8; 32]>::try_from(bytes.as_slice()) else {
                bail!("key file {} must hold 32 bytes", path.display());
            };
            Ok(Keypair::from_secret_bytes(secret))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let keypair = Keypair::generate();
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("create {}", dir.display()))?;
            }
            std::fs::write(path, STANDARD.encode(keypair.secret_bytes()))
                .with_context(|| format!("write key file {}", path.display()))?;
            info!(path = %path.display(), "generated pairing key");
            Ok(keypair)
        }
        Err(e) => Err(e).with_context(|| format!("read key file {}", path.display())),
    }
}
