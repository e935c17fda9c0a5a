//! Command-line arguments.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use connect_core::PublicKey;

pub const USAGE: &str = "usage:
  connect-node listen [--port P] [--out FILE]
  connect-node push --peer ADDR --peer-key BASE64 --file FILE
  connect-node --version";

const DEFAULT_OUT: &str = "vault.json";

#[derive(Debug)]
pub enum Command {
    Version,
    /// Responder: accept pushes. `port` falls back to the configured listen port.
    Listen { port: Option<u16>, out: PathBuf },
    /// Initiator: push `file` to the listener at `peer`.
    Push {
        peer: SocketAddr,
        peer_key: PublicKey,
        file: PathBuf,
    },
}

pub fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Command> {
    let mut args = args.into_iter();
    let Some(first) = args.next() else {
        bail!("missing command\n{USAGE}");
    };
    match first.as_str() {
        "--version" | "-V" => Ok(Command::Version),
        "listen" => {
            let mut port = None;
            let mut out = PathBuf::from(DEFAULT_OUT);
            while let Some(flag) = args.next() {
                match flag.as_str() {
                    "--port" => {
                        let v = value(&mut args, &flag)?;
                        port = Some(v.parse().with_context(|| format!("bad port {v:?}"))?);
                    }
                    "--out" => out = PathBuf::from(value(&mut args, &flag)?),
                    other => bail!("unknown flag {other:?}\n{USAGE}"),
                }
            }
            Ok(Command::Listen { port, out })
        }
        "push" => {
            let (mut peer, mut peer_key, mut file) = (None, None, None);
            while let Some(flag) = args.next() {
                match flag.as_str() {
                    "--peer" => {
                        let v = value(&mut args, &flag)?;
                        peer = Some(
                            v.parse::<SocketAddr>()
                                .with_context(|| format!("bad peer address {v:?}"))?,
                        );
                    }
                    "--peer-key" => {
                        let v = value(&mut args, &flag)?;
                        peer_key = Some(
                            PublicKey::from_base64(&v)
                                .with_context(|| format!("bad peer key {v:?}"))?,
                        );
                    }
                    "--file" => file = Some(PathBuf::from(value(&mut args, &flag)?)),
                    other => bail!("unknown flag {other:?}\n{USAGE}"),
                }
            }
            Ok(Command::Push {
                peer: peer.ok_or_else(|| anyhow!("push needs --peer\n{USAGE}"))?,
                peer_key: peer_key.ok_or_else(|| anyhow!("push needs --peer-key\n{USAGE}"))?,
                file: file.ok_or_else(|| anyhow!("push needs --file\n{USAGE}"))?,
            })
        }
        other => bail!("unknown command {other:?}\n{USAGE}"),
    }
}

fn value(args: &mut impl Iterator<Item = String>, flag: &str) -> anyhow::Result<String> {
    args.next()
        .ok_or_else(|| anyhow!("{flag} needs a value\n{USAGE}"))
}
