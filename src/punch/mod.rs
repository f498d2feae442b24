//! Message-based UDP hole punching over a shared [`Mux`].
//!
//! Both sides run the same state machine simultaneously, so the design is
//! symmetric under role-swap. Two success witnesses exist: receiving a HELLO
//! (something reached us, and we ACK it so the other side progresses), or
//! receiving an ACK of our own HELLO. Relying on ACK alone deadlocks when
//! both sides start at the same instant and drop each other's first HELLO.
//!
//! The puncher listens on both the fallback control channel and the
//! per-self-id control channel for its entire lifetime. Gating the dedicated
//! subscription by state loses ACKs from a peer that learned our id first.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::mux::{Inbound, Mux};
use crate::protocol::message::{Message, MessageType};
use crate::protocol::PacketKind;

pub use peer::Peer;
pub mod peer;

const DEFAULT_INTERVAL: Duration = Duration::from_millis(200);
const MIN_INIT_INTERVAL: Duration = Duration::from_millis(25);

/// Best-effort mapping heuristic observed during the handshake. With only
/// two peers and no STUN server in the path this is never definitive.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum NatBehavior {
    #[default]
    Unknown,
    EndpointIndependent,
    EndpointDependent,
}

impl fmt::Display for NatBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NatBehavior::Unknown => "unknown",
            NatBehavior::EndpointIndependent => "endpoint-independent-like",
            NatBehavior::EndpointDependent => "endpoint-dependent-like",
        };
        write!(f, "{s}")
    }
}

/// Outcome of a hole punching attempt.
#[derive(Debug, Clone)]
pub struct PunchResult {
    /// Source address of the accepted HELLO or ACK.
    pub addr: SocketAddr,
    pub peer_id: String,
    pub behavior: NatBehavior,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum PunchState {
    Init,
    PeerKnown,
    Done,
}

struct Observed {
    state: PunchState,
    peer_id: String,
    remote_addr: Option<SocketAddr>,
    first_observed: Option<SocketAddr>,
    behavior: NatBehavior,
}

impl Observed {
    fn new(peer: &Peer) -> Observed {
        Observed {
            state: PunchState::Init,
            peer_id: peer.id.clone(),
            remote_addr: Some(peer.addr),
            first_observed: None,
            behavior: NatBehavior::Unknown,
        }
    }
}

/// Performs message-based UDP hole punching over a shared [`Mux`].
#[derive(Clone)]
pub struct Puncher {
    mux: Mux,
    self_id: String,

    /// Cadence before the peer has been heard from; sprays all candidates.
    init_interval: Duration,

    /// Cadence once the peer is known; targets the observed address only.
    steady_interval: Duration,

    timeout: Option<Duration>,
}

impl Puncher {
    /// `interval` is the steady cadence; the init cadence is half of it,
    /// floored at 25ms. Zero selects the 200ms default.
    pub fn new(mux: &Mux, self_id: &str, interval: Duration) -> Puncher {
        let interval = if interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            interval
        };
        Puncher {
            mux: mux.clone(),
            self_id: self_id.to_string(),
            init_interval: (interval / 2).max(MIN_INIT_INTERVAL),
            steady_interval: interval,
            timeout: None,
        }
    }

    /// Bounds [`punch`](Self::punch), mapping expiry to [`Error::PunchTimeout`].
    pub fn with_timeout(mut self, timeout: Duration) -> Puncher {
        self.timeout = Some(timeout);
        self
    }

    /// Attempts to establish reachability with `peer`. Returns the observed
    /// remote address once either a HELLO or an ACK arrives from the peer.
    ///
    /// Exactly one result is reported. Cancelling `token` returns
    /// [`Error::Cancelled`]; the configured deadline returns
    /// [`Error::PunchTimeout`].
    pub async fn punch(&self, token: &CancellationToken, peer: &Peer) -> Result<PunchResult> {
        match self.timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.punch_inner(token, peer)).await {
                    Ok(rs) => rs,
                    Err(_) => Err(Error::PunchTimeout),
                }
            }
            None => self.punch_inner(token, peer).await,
        }
    }

    async fn punch_inner(&self, token: &CancellationToken, peer: &Peer) -> Result<PunchResult> {
        let observed = Arc::new(Mutex::new(Observed::new(peer)));
        let candidates = peer.candidate_list();

        // Everything spawned below dies with this guard, deadline included.
        let internal = token.child_token();
        let _guard = internal.clone().drop_guard();

        let (result_tx, result_rx) = flume::bounded::<PunchResult>(1);
        let (merged_tx, merged_rx) = flume::bounded::<Inbound>(64);

        // Always listen on both control channels plus every candidate's
        // address channel (address routing wins over control routing once a
        // candidate is registered).
        spawn_forwarder(self.mux.control(), merged_tx.clone(), internal.clone());
        spawn_forwarder(
            self.mux.control_for(&self.self_id),
            merged_tx.clone(),
            internal.clone(),
        );
        for candidate in &candidates {
            spawn_forwarder(
                self.mux.register(*candidate, 16),
                merged_tx.clone(),
                internal.clone(),
            );
        }

        {
            let puncher = self.clone();
            let observed = observed.clone();
            let internal = internal.clone();
            tokio::spawn(async move {
                loop {
                    let inbound = tokio::select! {
                        _ = internal.cancelled() => return,
                        rs = merged_rx.recv_async() => match rs {
                            Ok(inbound) => inbound,
                            Err(_) => return,
                        },
                    };
                    puncher.handle_inbound(&observed, &result_tx, inbound).await;
                }
            });
        }

        // Immediate burst before the first tick to reduce first-RTT variance.
        self.send_round(&observed, &candidates).await;

        let mut ticker = tokio::time::interval(self.init_interval);
        ticker.tick().await;
        let mut steady = false;

        loop {
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                rs = result_rx.recv_async() => {
                    return rs.map_err(|_| Error::ConnectionClosed);
                }
                _ = ticker.tick() => {}
            }
            let state = observed.lock().state;
            if state == PunchState::Done {
                continue;
            }
            // Swap to the steady cadence exactly once.
            if state == PunchState::PeerKnown && !steady {
                steady = true;
                ticker = tokio::time::interval(self.steady_interval);
                ticker.tick().await;
            }
            self.send_round(&observed, &candidates).await;
        }
    }

    /// One tick's worth of HELLOs: all candidates while in `Init`, only the
    /// best observed address once the peer is known.
    async fn send_round(&self, observed: &Arc<Mutex<Observed>>, candidates: &[SocketAddr]) {
        let (state, peer_id, remote_addr) = {
            let obs = observed.lock();
            (obs.state, obs.peer_id.clone(), obs.remote_addr)
        };
        let to_peer_id = if peer_id.is_empty() {
            None
        } else {
            Some(peer_id.as_str())
        };
        if state == PunchState::Init {
            for candidate in candidates {
                self.send_hello(*candidate, to_peer_id).await;
            }
            match remote_addr {
                Some(addr) if !candidates.contains(&addr) => {
                    self.send_hello(addr, to_peer_id).await;
                }
                _ => {}
            }
        } else if let Some(addr) = remote_addr {
            self.send_hello(addr, to_peer_id).await;
        }
    }

    async fn send_hello(&self, to: SocketAddr, to_peer_id: Option<&str>) {
        let hello = Message::new(MessageType::Hello, &self.self_id, to_peer_id);
        if let Ok(payload) = hello.encode() {
            if let Err(e) = self.mux.send(to, PacketKind::Control, &payload).await {
                log::debug!("hello to {to} failed: {e:?}");
            }
        }
    }

    async fn handle_inbound(
        &self,
        observed: &Arc<Mutex<Observed>>,
        result_tx: &flume::Sender<PunchResult>,
        inbound: Inbound,
    ) {
        if inbound.packet.kind != PacketKind::Control {
            return;
        }
        let msg = match Message::decode(&inbound.packet.payload) {
            Ok(msg) => msg,
            Err(_) => return,
        };
        if let Some(to) = &msg.to_peer_id {
            if to != &self.self_id {
                return;
            }
        }

        match msg.kind {
            MessageType::Hello => {
                self.set_observed(observed, inbound.addr, &msg.peer_id);

                // Immediate ACK so the other side progresses without
                // waiting for its next HELLO tick.
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

                // Hello-received is a success witness of its own; without it
                // two sides that drop each other's first HELLO deadlock.
                succeed(observed, result_tx, inbound.addr, &msg.peer_id);
            }
            MessageType::Ack => {
                self.set_observed(observed, inbound.addr, &msg.peer_id);
                succeed(observed, result_tx, inbound.addr, &msg.peer_id);
            }
        }
    }

    fn set_observed(&self, observed: &Arc<Mutex<Observed>>, addr: SocketAddr, id: &str) {
        let mut obs = observed.lock();

        if !id.is_empty() {
            obs.peer_id = id.to_string();
            if obs.state == PunchState::Init {
                obs.state = PunchState::PeerKnown;
            }
        }

        match obs.first_observed {
            None => obs.first_observed = Some(addr),
            Some(first) if first != addr => {
                // The peer reached us from a different endpoint mid-handshake.
                // Merely suggestive of endpoint-dependent mapping; legitimate
                // rebinds look the same, so it never aborts the handshake.
                obs.behavior = NatBehavior::EndpointDependent;
            }
            _ => {}
        }

        // Keep the send target current and alias inbound routing so frames
        // from the new endpoint land on the queue we already hold.
        if obs.remote_addr != Some(addr) {
            if let Some(old) = obs.remote_addr {
                self.mux.alias(old, addr);
            }
            obs.remote_addr = Some(addr);
        }

        if obs.behavior == NatBehavior::Unknown && obs.first_observed.is_some() {
            obs.behavior = NatBehavior::EndpointIndependent;
        }
    }
}

/// Reports the result exactly once; repeated success events are discarded.
fn succeed(
    observed: &Arc<Mutex<Observed>>,
    result_tx: &flume::Sender<PunchResult>,
    addr: SocketAddr,
    peer_id: &str,
) {
    let behavior = {
        let mut obs = observed.lock();
        if obs.state == PunchState::Done {
            return;
        }
        obs.state = PunchState::Done;
        obs.behavior
    };
    let _ = result_tx.try_send(PunchResult {
        addr,
        peer_id: peer_id.to_string(),
        behavior,
    });
}

fn spawn_forwarder(
    rx: flume::Receiver<Inbound>,
    tx: flume::Sender<Inbound>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let inbound = tokio::select! {
                _ = token.cancelled() => return,
                rs = rx.recv_async() => match rs {
                    Ok(inbound) => inbound,
                    Err(_) => return,
                },
            };
            if tx.send_async(inbound).await.is_err() {
                return;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::bind_udp;

    fn started_mux(token: &CancellationToken) -> Mux {
        let mux = Mux::new(bind_udp("127.0.0.1:0".parse().unwrap()).unwrap());
        mux.start(token);
        mux
    }

    #[tokio::test]
    async fn symmetric_handshake() {
        let _ = env_logger::builder().is_test(true).try_init();
        let token = CancellationToken::new();
        let a_mux = started_mux(&token);
        let b_mux = started_mux(&token);
        let a_addr = a_mux.local_addr().unwrap();
        let b_addr = b_mux.local_addr().unwrap();

        let a = Puncher::new(&a_mux, "A", Duration::from_millis(50))
            .with_timeout(Duration::from_secs(3));
        let b = Puncher::new(&b_mux, "B", Duration::from_millis(50))
            .with_timeout(Duration::from_secs(3));

        let a_token = token.clone();
        let b_token = token.clone();
        let a_task =
            tokio::spawn(async move { a.punch(&a_token, &Peer::new("B", b_addr)).await });
        let b_task =
            tokio::spawn(async move { b.punch(&b_token, &Peer::new("A", a_addr)).await });

        let a_res = a_task.await.unwrap().unwrap();
        let b_res = b_task.await.unwrap().unwrap();

        assert_eq!(a_res.addr, b_addr);
        assert_eq!(a_res.peer_id, "B");
        assert_eq!(b_res.addr, a_addr);
        assert_eq!(b_res.peer_id, "A");
        assert_ne!(a_res.behavior, NatBehavior::Unknown);
        assert_ne!(b_res.behavior, NatBehavior::Unknown);
        token.cancel();
    }

    #[tokio::test]
    async fn punch_times_out_against_silence() {
        let token = CancellationToken::new();
        let mux = started_mux(&token);
        // Nobody is listening here.
        let silent = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let peer = Peer::new("ghost", silent.local_addr().unwrap());

        let puncher = Puncher::new(&mux, "A", Duration::from_millis(20))
            .with_timeout(Duration::from_millis(200));
        assert!(matches!(
            puncher.punch(&token, &peer).await,
            Err(Error::PunchTimeout)
        ));
        token.cancel();
    }

    #[tokio::test]
    async fn punch_returns_cancelled() {
        let token = CancellationToken::new();
        let mux = started_mux(&token);
        let silent = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let peer = Peer::new("ghost", silent.local_addr().unwrap());

        let puncher = Puncher::new(&mux, "A", Duration::from_millis(20));
        let punch_token = token.clone();
        let task = tokio::spawn(async move { puncher.punch(&punch_token, &peer).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        assert!(matches!(task.await.unwrap(), Err(Error::Cancelled)));
    }
}
