//! An established datagram path to a peer over a shared [`Mux`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::mux::{Inbound, Mux};
use crate::protocol::PacketKind;

struct State {
    remote_addr: SocketAddr,
    closed: bool,
    keepalive_interval: Option<Duration>,
}

/// A bound sending endpoint plus the inbound queue the [`Mux`] feeds for the
/// remote address. Data and control planes are separate packet kinds on the
/// same queue.
///
/// Cheap to clone; all clones share the same state and queue.
#[derive(Clone)]
pub struct Session {
    mux: Mux,
    incoming: flume::Receiver<Inbound>,
    state: Arc<RwLock<State>>,
}

impl Session {
    /// Creates a session bound to `remote` and registers its inbound queue
    /// with the mux. `queue` of zero selects the default size.
    pub fn new(mux: &Mux, remote: SocketAddr, queue: usize) -> Session {
        Session {
            mux: mux.clone(),
            incoming: mux.register(remote, queue),
            state: Arc::new(RwLock::new(State {
                remote_addr: remote,
                closed: false,
                keepalive_interval: None,
            })),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.state.read().remote_addr
    }

    /// Sends application data to the remote peer.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        self.send_kind(PacketKind::Data, payload).await
    }

    /// Receives the next application data payload.
    pub async fn recv(&self, token: &CancellationToken) -> Result<(Bytes, SocketAddr)> {
        self.recv_kind(token, PacketKind::Data).await
    }

    /// Sends a control packet for application-level coordination.
    pub async fn send_control(&self, payload: &[u8]) -> Result<()> {
        self.send_kind(PacketKind::Control, payload).await
    }

    /// Receives the next control payload.
    pub async fn recv_control(&self, token: &CancellationToken) -> Result<(Bytes, SocketAddr)> {
        self.recv_kind(token, PacketKind::Control).await
    }

    async fn send_kind(&self, kind: PacketKind, payload: &[u8]) -> Result<()> {
        let remote = {
            let state = self.state.read();
            if state.closed {
                return Err(Error::ConnectionClosed);
            }
            state.remote_addr
        };
        self.mux.send(remote, kind, payload).await
    }

    async fn recv_kind(
        &self,
        token: &CancellationToken,
        kind: PacketKind,
    ) -> Result<(Bytes, SocketAddr)> {
        loop {
            let inbound = tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                rs = self.incoming.recv_async() => rs.map_err(|_| Error::ConnectionClosed)?,
            };
            if inbound.packet.kind != kind {
                continue;
            }
            return Ok((inbound.packet.payload, inbound.addr));
        }
    }

    /// Swaps the send target to `new_remote` and aliases the inbound queue so
    /// frames from the new endpoint keep arriving here. Safe to call
    /// concurrently with sends.
    pub fn update_remote(&self, new_remote: SocketAddr) {
        let mut state = self.state.write();
        self.mux.alias(state.remote_addr, new_remote);
        state.remote_addr = new_remote;
    }

    /// Sets the keepalive interval used by [`start_keepalive`](Self::start_keepalive).
    pub fn set_keepalive(&self, interval: Duration) {
        self.state.write().keepalive_interval = Some(interval);
    }

    /// Spawns a task emitting empty control frames on the configured interval
    /// until `token` is cancelled or the session closes. A no-op when no
    /// interval is set.
    pub fn start_keepalive(&self, token: &CancellationToken) {
        let interval = match self.state.read().keepalive_interval {
            Some(interval) if !interval.is_zero() => interval,
            _ => return,
        };
        let session = self.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                match session.send_control(&[]).await {
                    Err(Error::ConnectionClosed) => return,
                    Err(e) => log::warn!("keepalive send failed: {e:?}"),
                    Ok(()) => {}
                }
            }
        });
    }

    /// Marks the session closed. Further sends fail with
    /// [`Error::ConnectionClosed`]; the mux registration stays in place so
    /// late frames are still absorbed. Idempotent.
    pub fn close(&self) {
        self.state.write().closed = true;
    }
}
