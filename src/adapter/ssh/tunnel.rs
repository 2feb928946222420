// SPDX-License-Identifier: MPL-2.0

//! Port forwarding (§4.9 "Tunnels").
//!
//! The real `openssh` session's forwards live for the session's own
//! lifetime with no per-forward cancel handle, so every [`Tunnel`] gets its
//! own dedicated, unpooled [`openssh::Session`]; closing the tunnel closes
//! that session.

use crate::error::{Error, Result};
use openssh::ForwardType;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// Which direction a tunnel forwards traffic.
#[derive(Debug, Clone)]
pub enum TunnelKind {
    /// `local_port` on this machine forwards to `remote_addr` via the host.
    Local { remote_addr: SocketAddr },
    /// `remote_port` on the host forwards back to `local_addr` here.
    Remote { local_addr: SocketAddr },
}

/// A live SSH port forward. State machine: `new -> open -> closed`
/// (terminal); an error while opening leaves it `closed` directly (§4.8).
/// The session lives behind a lock so [`Tunnel::close`] can take `&self`
/// and be called more than once safely — a second close is a no-op rather
/// than a panic or a double-close error.
pub struct Tunnel {
    session: Arc<Mutex<Option<openssh::Session>>>,
    pub kind: TunnelKind,
    pub bound_port: u16,
}

impl Tunnel {
    /// Open a local-forward: binds an ephemeral port on this machine first
    /// (when `local_port == 0`) so the concrete port is known before asking
    /// `ssh` to forward it, since the `0 == any` convention isn't
    /// universally honored by `ssh -L`.
    pub async fn local(session: openssh::Session, local_port: u16, remote_addr: SocketAddr) -> Result<Self> {
        let bound_port = if local_port == 0 {
            let listener = TcpListener::bind(("127.0.0.1", 0))
                .await
                .map_err(|source| Error::Spawn {
                    command: "bind ephemeral tunnel port".into(),
                    cwd: None,
                    source,
                })?;
            let port = listener.local_addr().map_err(|source| Error::Spawn {
                command: "read ephemeral tunnel port".into(),
                cwd: None,
                source,
            })?.port();
            drop(listener);
            port
        } else {
            local_port
        };

        let local_addr: SocketAddr = ([127, 0, 0, 1], bound_port).into();
        session
            .request_port_forward(ForwardType::Local, local_addr, remote_addr)
            .await
            .map_err(|e| Error::Backend {
                adapter: crate::outcome::AdapterTag::Ssh,
                message: format!("failed to open local forward on :{bound_port}: {e}"),
            })?;

        Ok(Tunnel {
            session: Arc::new(Mutex::new(Some(session))),
            kind: TunnelKind::Local { remote_addr },
            bound_port,
        })
    }

    /// Open a remote-forward: the host listens on `remote_port` and
    /// forwards connections back to `local_addr` here.
    pub async fn remote(session: openssh::Session, remote_port: u16, local_addr: SocketAddr) -> Result<Self> {
        let remote_socket: SocketAddr = ([0, 0, 0, 0], remote_port).into();
        session
            .request_port_forward(ForwardType::Remote, remote_socket, local_addr)
            .await
            .map_err(|e| Error::Backend {
                adapter: crate::outcome::AdapterTag::Ssh,
                message: format!("failed to open remote forward on :{remote_port}: {e}"),
            })?;

        Ok(Tunnel {
            session: Arc::new(Mutex::new(Some(session))),
            kind: TunnelKind::Remote { local_addr },
            bound_port: remote_port,
        })
    }

    /// Sever the dedicated session backing this tunnel. Idempotent: a
    /// second call observes the session already taken and returns `Ok(())`
    /// without re-closing anything (§4.8).
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.take() {
            session.close().await.map_err(|e| Error::Backend {
                adapter: crate::outcome::AdapterTag::Ssh,
                message: format!("failed to close tunnel session: {e}"),
            })?;
        }
        Ok(())
    }

    /// Whether the tunnel's session has not yet been closed.
    pub async fn is_open(&self) -> bool {
        self.session.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_tunnel_kind_carries_remote_addr() {
        let remote: SocketAddr = "10.0.0.5:5432".parse().unwrap();
        let kind = TunnelKind::Local { remote_addr: remote };
        match kind {
            TunnelKind::Local { remote_addr } => assert_eq!(remote_addr, remote),
            _ => panic!("expected Local"),
        }
    }
}
