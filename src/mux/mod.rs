//! Single-socket UDP receive demultiplexer.
//!
//! One receive task owns the socket and fans inbound frames out to bounded
//! channels: per-source-address channels for sessions, per-addressee control
//! channels for punchers, and one fallback control channel. Address routing
//! wins over control routing, and a frame is delivered to at most one queue.
//!
//! Every queue is bounded with drop-on-full. UDP is already lossy; blocking
//! the receive loop on a slow consumer would stall every other flow sharing
//! the socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::protocol::message::Message;
use crate::protocol::{decode_packet, encode_packet, Packet, PacketKind};

/// Queue size used when the caller passes zero.
pub const DEFAULT_QUEUE: usize = 32;

const MAX_DATAGRAM: usize = 64 * 1024;

/// A received frame with its source address.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub packet: Packet,
    pub addr: SocketAddr,
}

type Channel = (flume::Sender<Inbound>, flume::Receiver<Inbound>);

/// Multiplexes incoming UDP frames by source address and control semantics.
///
/// Cheap to clone; all clones share the same socket and routing state.
#[derive(Clone)]
pub struct Mux {
    socket: Arc<UdpSocket>,
    by_addr: Arc<RwLock<HashMap<SocketAddr, Channel>>>,
    control: Channel,
    control_by_peer: Arc<RwLock<HashMap<String, Channel>>>,
    started: Arc<AtomicBool>,
}

impl Mux {
    pub fn new(socket: UdpSocket) -> Mux {
        Mux {
            socket: Arc::new(socket),
            by_addr: Arc::new(RwLock::new(HashMap::new())),
            control: flume::bounded(DEFAULT_QUEUE),
            control_by_peer: Arc::new(RwLock::new(HashMap::new())),
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Launches the receive loop. Subsequent calls are no-ops.
    ///
    /// The loop runs until `token` is cancelled.
    pub fn start(&self, token: &CancellationToken) {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let mux = self.clone();
        let token = token.clone();
        tokio::spawn(async move {
            mux.recv_loop(token).await;
        });
    }

    /// Returns the fallback control channel. Control frames not addressed to
    /// a registered peer are delivered here.
    pub fn control(&self) -> flume::Receiver<Inbound> {
        self.control.1.clone()
    }

    /// Returns the dedicated control channel for `peer_id`, creating it on
    /// first use. Only control frames with a matching `to_peer_id` are
    /// delivered there.
    pub fn control_for(&self, peer_id: &str) -> flume::Receiver<Inbound> {
        if let Some((_, rx)) = self.control_by_peer.read().get(peer_id) {
            return rx.clone();
        }
        let mut guard = self.control_by_peer.write();
        let (_, rx) = guard
            .entry(peer_id.to_string())
            .or_insert_with(|| flume::bounded(DEFAULT_QUEUE));
        rx.clone()
    }

    /// Registers a channel for frames arriving from `addr`, creating it with
    /// the given queue size on first use. Registration is idempotent: a
    /// second call returns the existing channel and keeps its queue size.
    pub fn register(&self, addr: SocketAddr, queue: usize) -> flume::Receiver<Inbound> {
        let queue = if queue == 0 { DEFAULT_QUEUE } else { queue };
        if let Some((_, rx)) = self.by_addr.read().get(&addr) {
            return rx.clone();
        }
        let mut guard = self.by_addr.write();
        let (_, rx) = guard
            .entry(addr)
            .or_insert_with(|| flume::bounded(queue));
        rx.clone()
    }

    /// Reattaches the channel registered for `old` under `new`, so frames
    /// from the new source keep landing on the same queue. A no-op when
    /// nothing is registered for `old`.
    pub fn alias(&self, old: SocketAddr, new: SocketAddr) {
        if old == new {
            return;
        }
        let mut guard = self.by_addr.write();
        if let Some(ch) = guard.remove(&old) {
            guard.insert(new, ch);
        }
    }

    /// Frames and sends `payload` to `addr` through the shared socket.
    pub async fn send(&self, addr: SocketAddr, kind: PacketKind, payload: &[u8]) -> Result<()> {
        let wire = encode_packet(kind, payload);
        self.socket.send_to(&wire, addr).await?;
        Ok(())
    }

    async fn recv_loop(&self, token: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, addr) = tokio::select! {
                _ = token.cancelled() => return,
                rs = self.socket.recv_from(&mut buf) => match rs {
                    Ok(rs) => rs,
                    Err(e) => {
                        log::debug!("mux recv error: {e:?}");
                        continue;
                    }
                },
            };
            // Decode errors never kill the loop; foreign datagrams are noise.
            let packet = match decode_packet(&buf[..len]) {
                Ok(packet) => packet,
                Err(_) => continue,
            };
            let inbound = Inbound { packet, addr };
            if self.dispatch_by_addr(&inbound) {
                continue;
            }
            if inbound.packet.kind == PacketKind::Control {
                self.dispatch_control(inbound);
            }
            // Data frames with no matching registration are dropped.
        }
    }

    fn dispatch_by_addr(&self, inbound: &Inbound) -> bool {
        let guard = self.by_addr.read();
        if let Some((tx, _)) = guard.get(&inbound.addr) {
            if tx.try_send(inbound.clone()).is_err() {
                log::debug!("mux queue full, dropping frame from {}", inbound.addr);
            }
            return true;
        }
        false
    }

    fn dispatch_control(&self, inbound: Inbound) {
        let to_peer_id = match Message::decode(&inbound.packet.payload) {
            Ok(msg) => msg.to_peer_id,
            Err(_) => None,
        };
        if let Some(to_peer_id) = to_peer_id {
            let guard = self.control_by_peer.read();
            if let Some((tx, _)) = guard.get(&to_peer_id) {
                if tx.try_send(inbound).is_err() {
                    log::debug!("control queue for {to_peer_id} full, dropping frame");
                }
                return;
            }
        }
        if self.control.0.try_send(inbound).is_err() {
            log::debug!("fallback control queue full, dropping frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::message::MessageType;
    use crate::socket::bind_udp;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let token = CancellationToken::new();
        let mux = Mux::new(bind_udp(loopback()).unwrap());
        mux.start(&token);

        let sender = bind_udp(loopback()).unwrap();
        let addr = sender.local_addr().unwrap();
        let first = mux.register(addr, 4);
        let _second = mux.register(addr, 99);
        assert_eq!(mux.by_addr.read().len(), 1);

        // The original channel must still be fed: a replacement would leave
        // `first` orphaned.
        let wire = encode_packet(PacketKind::Data, b"still mine");
        sender
            .send_to(&wire, mux.local_addr().unwrap())
            .await
            .unwrap();
        let inbound = tokio::time::timeout(Duration::from_secs(1), first.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&inbound.packet.payload[..], b"still mine");
        token.cancel();
    }

    #[tokio::test]
    async fn dispatches_by_source_address() {
        let token = CancellationToken::new();
        let mux = Mux::new(bind_udp(loopback()).unwrap());
        mux.start(&token);

        let sender = bind_udp(loopback()).unwrap();
        let rx = mux.register(sender.local_addr().unwrap(), 4);

        let wire = encode_packet(PacketKind::Data, b"direct");
        sender
            .send_to(&wire, mux.local_addr().unwrap())
            .await
            .unwrap();

        let inbound = tokio::time::timeout(Duration::from_secs(1), rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&inbound.packet.payload[..], b"direct");
        token.cancel();
    }

    #[tokio::test]
    async fn alias_keeps_frames_flowing() {
        let token = CancellationToken::new();
        let mux = Mux::new(bind_udp(loopback()).unwrap());
        mux.start(&token);

        let old_sender = bind_udp(loopback()).unwrap();
        let new_sender = bind_udp(loopback()).unwrap();
        let old_addr = old_sender.local_addr().unwrap();
        let new_addr = new_sender.local_addr().unwrap();

        let rx = mux.register(old_addr, 4);
        mux.alias(old_addr, new_addr);

        let wire = encode_packet(PacketKind::Data, b"rebound");
        new_sender
            .send_to(&wire, mux.local_addr().unwrap())
            .await
            .unwrap();

        let inbound = tokio::time::timeout(Duration::from_secs(1), rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&inbound.packet.payload[..], b"rebound");
        assert_eq!(inbound.addr, new_addr);
        token.cancel();
    }

    #[tokio::test]
    async fn alias_of_unknown_addr_is_noop() {
        let mux = Mux::new(bind_udp(loopback()).unwrap());
        mux.alias(
            "127.0.0.1:1111".parse().unwrap(),
            "127.0.0.1:2222".parse().unwrap(),
        );
        assert!(mux.by_addr.read().is_empty());
    }

    #[tokio::test]
    async fn control_routed_by_addressee() {
        let token = CancellationToken::new();
        let mux = Mux::new(bind_udp(loopback()).unwrap());
        mux.start(&token);

        let dedicated = mux.control_for("peer-b");
        let fallback = mux.control();

        let sender = bind_udp(loopback()).unwrap();
        let addressed = Message::new(MessageType::Hello, "peer-a", Some("peer-b"))
            .encode()
            .unwrap();
        let broadcast = Message::new(MessageType::Hello, "peer-a", None)
            .encode()
            .unwrap();
        let target = mux.local_addr().unwrap();
        sender
            .send_to(&encode_packet(PacketKind::Control, &addressed), target)
            .await
            .unwrap();
        sender
            .send_to(&encode_packet(PacketKind::Control, &broadcast), target)
            .await
            .unwrap();

        let inbound = tokio::time::timeout(Duration::from_secs(1), dedicated.recv_async())
            .await
            .unwrap()
            .unwrap();
        let msg = Message::decode(&inbound.packet.payload).unwrap();
        assert_eq!(msg.to_peer_id.as_deref(), Some("peer-b"));

        let inbound = tokio::time::timeout(Duration::from_secs(1), fallback.recv_async())
            .await
            .unwrap()
            .unwrap();
        let msg = Message::decode(&inbound.packet.payload).unwrap();
        assert_eq!(msg.to_peer_id, None);
        token.cancel();
    }
}
