//! # nat-traverse - UDP NAT Traversal Library
//!
//! `nat-traverse` lets two peers behind NATs establish a bidirectional UDP
//! datagram path using message-based hole punching, with STUN discovery and a
//! TURN relay client as fallback. It is a library, not an application: the
//! embedder exchanges observed endpoints out-of-band (signaling is out of
//! scope) and then drives this crate to converge on a working direct path.
//!
//! ## Architecture
//!
//! - [`mux`] - single-socket receive loop that fans inbound frames out to
//!   per-address and control channels
//! - [`punch`] - the hole-punching handshake state machine
//! - [`session`] - established datagram path riding on a [`mux::Mux`]
//! - [`dial`] / [`accept`] - facade composing puncher and session
//! - [`nat`] - two-server NAT type detection
//! - [`stun`] - STUN codec, Binding client, and a minimal server
//! - [`turn`] - TURN client (allocations, permissions, channels)
//!
//! ## Quick Start
//!
//! Each side binds a UDP socket, starts a [`mux::Mux`] on it, and then one
//! side dials while the other accepts:
//!
//! ```rust,no_run
//! use nat_traverse::dial::{dial, DialOptions};
//! use nat_traverse::mux::Mux;
//! use nat_traverse::punch::Peer;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> nat_traverse::error::Result<()> {
//! let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
//! let mux = Mux::new(socket);
//! let token = CancellationToken::new();
//! mux.start(&token);
//!
//! let peer = Peer::new("peer-b", "203.0.113.7:41641".parse().unwrap());
//! let (session, result) = dial(&token, &mux, "peer-a", &peer, DialOptions::default()).await?;
//! println!("reached {} at {}", result.peer_id, result.addr);
//! session.send(b"hello").await?;
//! # Ok(())
//! # }
//! ```
//!
//! All long-running tasks take a [`tokio_util::sync::CancellationToken`];
//! cancelling it stops receive loops, pending punches, and keepalives.

pub mod accept;
pub mod dial;
pub mod error;
pub mod mux;
pub mod nat;
pub mod protocol;
pub mod punch;
pub mod session;
pub mod socket;
pub mod stun;
pub mod turn;

pub use accept::{AcceptOptions, Acceptor};
pub use dial::{dial, DialOptions};
pub use error::{Error, Result};
pub use mux::Mux;
pub use punch::{NatBehavior, Peer, PunchResult, Puncher};
pub use session::Session;
