//! Accepting side of the traversal facade.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::mux::Mux;
use crate::protocol::message::{Message, MessageType};
use crate::protocol::PacketKind;
use crate::punch::{NatBehavior, PunchResult};
use crate::session::Session;

/// Configures [`Acceptor::accept`] behavior.
#[derive(Debug, Clone, Default)]
pub struct AcceptOptions {
    /// Inbound queue size for the created session. Zero selects the default.
    pub queue: usize,

    /// Enables session keepalive when non-zero.
    pub keepalive_interval: Duration,
}

/// Waits for an incoming hole-punching attempt on the mux's fallback control
/// channel. Single-shot: one peer per acceptor.
pub struct Acceptor {
    mux: Mux,
    self_id: String,
    options: AcceptOptions,
    closed: CancellationToken,
}

impl Acceptor {
    pub fn new(mux: &Mux, self_id: &str, options: AcceptOptions) -> Acceptor {
        Acceptor {
            mux: mux.clone(),
            self_id: self_id.to_string(),
            options,
            closed: CancellationToken::new(),
        }
    }

    /// Waits for the first HELLO addressed to us (or to nobody), ACKs it,
    /// and returns an established session toward the sender.
    pub async fn accept(&self, token: &CancellationToken) -> Result<(Session, PunchResult)> {
        let control = self.mux.control();

        loop {
            let inbound = tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                _ = self.closed.cancelled() => return Err(Error::ConnectionClosed),
                rs = control.recv_async() => rs.map_err(|_| Error::ConnectionClosed)?,
            };
            if inbound.packet.kind != PacketKind::Control {
                continue;
            }
            let msg = match Message::decode(&inbound.packet.payload) {
                Ok(msg) => msg,
                Err(_) => continue,
            };
            if msg.kind != MessageType::Hello {
                continue;
            }
            // When the initiator named a destination, make sure it is us.
            if let Some(to) = &msg.to_peer_id {
                if to != &self.self_id {
                    continue;
                }
            }

            // Immediate ACK so the dialer progresses without waiting for a
            // second HELLO tick.
            let ack = Message::new(MessageType::Ack, &self.self_id, Some(&msg.peer_id));
            if let Ok(payload) = ack.encode() {
                if let Err(e) = self
                    .mux
                    .send(inbound.addr, PacketKind::Control, &payload)
                    .await
                {
                    log::debug!("ack to {} failed: {e:?}", inbound.addr);
                }
            }

            let result = PunchResult {
                addr: inbound.addr,
                peer_id: msg.peer_id,
                behavior: NatBehavior::Unknown,
            };

            let session = Session::new(&self.mux, result.addr, self.options.queue);
            if !self.options.keepalive_interval.is_zero() {
                session.set_keepalive(self.options.keepalive_interval);
                session.start_keepalive(token);
            }

            return Ok((session, result));
        }
    }

    /// Makes a pending [`accept`](Self::accept) return
    /// [`Error::ConnectionClosed`]. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }
}
