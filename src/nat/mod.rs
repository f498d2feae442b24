//! Best-effort NAT type detection via two STUN Binding transactions.
//!
//! The heuristic compares the mappings two distinct servers observe for the
//! same local socket. It deliberately collapses Full Cone, Restricted Cone,
//! and Port-Restricted Cone into the port-restricted bucket; distinguishing
//! them requires the RFC 5780 CHANGE-REQUEST tests this crate does not do.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::stun::{self, Client};

/// Coarse NAT classification.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum NatType {
    OpenInternet,
    /// Never produced by the two-server heuristic; kept for embedders that
    /// refine the classification with their own probes.
    FullCone,
    /// Never produced by the two-server heuristic (see [`FullCone`](Self::FullCone)).
    RestrictedCone,
    PortRestricted,
    Symmetric,
}

impl NatType {
    #[inline]
    pub fn is_symmetric(&self) -> bool {
        self == &NatType::Symmetric
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NatType::OpenInternet => "Open Internet",
            NatType::FullCone => "Full Cone NAT",
            NatType::RestrictedCone => "Restricted Cone NAT",
            NatType::PortRestricted => "Port Restricted Cone NAT",
            NatType::Symmetric => "Symmetric NAT",
        };
        write!(f, "{s}")
    }
}

/// How external ports are mapped.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum MappingBehavior {
    Independent,
    Dependent,
}

/// Inbound filtering rules.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum FilteringBehavior {
    None,
    Address,
    Port,
    AddressPort,
}

/// The final detection result.
#[derive(Debug, Clone)]
pub struct NatResult {
    pub local_addr: SocketAddr,
    pub mapped_addr1: SocketAddr,
    pub mapped_addr2: SocketAddr,
    pub nat_type: NatType,
    pub mapping: MappingBehavior,
    pub filtering: FilteringBehavior,
    pub punching_ok: bool,
}

#[derive(Debug, Clone)]
pub struct DetectOptions {
    /// Two distinct servers are required.
    pub stun_servers: Vec<String>,
    pub timeout: Duration,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun.l.google.com:19302".to_string(),
                "stun1.l.google.com:19302".to_string(),
            ],
            timeout: Duration::from_secs(2),
        }
    }
}

/// Performs best-effort NAT type detection using two Binding transactions
/// from the same local socket against two distinct STUN servers.
pub async fn detect_nat(
    token: &CancellationToken,
    socket: &UdpSocket,
    options: DetectOptions,
) -> stun::Result<NatResult> {
    if options.stun_servers.len() < 2 {
        return Err(stun::Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "nat detection needs two stun servers",
        )));
    }

    let local_addr = socket.local_addr()?;
    let client = Client {
        timeout: options.timeout,
        ..Client::default()
    };

    let server1 = resolve(&options.stun_servers[0]).await?;
    let server2 = resolve(&options.stun_servers[1]).await?;

    let mapped_addr1 = client.binding_request_with(token, socket, server1).await?;
    let mapped_addr2 = client.binding_request_with(token, socket, server2).await?;

    let (nat_type, mapping, filtering, punching_ok) =
        classify(local_addr, mapped_addr1, mapped_addr2);

    Ok(NatResult {
        local_addr,
        mapped_addr1,
        mapped_addr2,
        nat_type,
        mapping,
        filtering,
        punching_ok,
    })
}

async fn resolve(server: &str) -> stun::Result<SocketAddr> {
    tokio::net::lookup_host(server)
        .await?
        .next()
        .ok_or_else(|| {
            stun::Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no address for stun server",
            ))
        })
}

/// The pure classification heuristic behind [`detect_nat`].
pub fn classify(
    local: SocketAddr,
    mapped1: SocketAddr,
    mapped2: SocketAddr,
) -> (NatType, MappingBehavior, FilteringBehavior, bool) {
    if mapped1.ip() == local.ip() && mapped1.port() == local.port() {
        return (
            NatType::OpenInternet,
            MappingBehavior::Independent,
            FilteringBehavior::None,
            true,
        );
    }

    if mapped1 == mapped2 {
        // Both servers saw the same mapping: endpoint-independent, so hole
        // punching is feasible.
        (
            NatType::PortRestricted,
            MappingBehavior::Independent,
            FilteringBehavior::Port,
            true,
        )
    } else {
        (
            NatType::Symmetric,
            MappingBehavior::Dependent,
            FilteringBehavior::AddressPort,
            false,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::bind_udp;
    use crate::stun::Server;

    #[test]
    fn classify_port_restricted() {
        let local: SocketAddr = "192.168.1.10:54321".parse().unwrap();
        let mapped: SocketAddr = "198.51.100.20:60000".parse().unwrap();
        let (nat_type, mapping, _, ok) = classify(local, mapped, mapped);
        assert_eq!(nat_type, NatType::PortRestricted);
        assert_eq!(mapping, MappingBehavior::Independent);
        assert!(ok);
    }

    #[test]
    fn classify_symmetric() {
        let local: SocketAddr = "192.168.1.10:54321".parse().unwrap();
        let mapped1: SocketAddr = "198.51.100.20:60000".parse().unwrap();
        let mapped2: SocketAddr = "198.51.100.20:60001".parse().unwrap();
        let (nat_type, mapping, _, ok) = classify(local, mapped1, mapped2);
        assert_eq!(nat_type, NatType::Symmetric);
        assert_eq!(mapping, MappingBehavior::Dependent);
        assert!(!ok);
    }

    #[test]
    fn classify_open_internet() {
        let local: SocketAddr = "198.51.100.20:60000".parse().unwrap();
        let (nat_type, _, filtering, ok) = classify(local, local, local);
        assert_eq!(nat_type, NatType::OpenInternet);
        assert_eq!(filtering, FilteringBehavior::None);
        assert!(ok);
    }

    #[tokio::test]
    async fn detect_against_local_servers() {
        let token = CancellationToken::new();
        let server1 = Server::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let server2 = Server::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr1 = server1.local_addr().unwrap();
        let addr2 = server2.local_addr().unwrap();
        let t1 = token.clone();
        let t2 = token.clone();
        tokio::spawn(async move { server1.serve(&t1).await });
        tokio::spawn(async move { server2.serve(&t2).await });

        let socket = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let options = DetectOptions {
            stun_servers: vec![addr1.to_string(), addr2.to_string()],
            timeout: Duration::from_secs(1),
        };
        let result = detect_nat(&token, &socket, options).await.unwrap();

        // Loopback: both servers see the local address itself.
        assert_eq!(result.nat_type, NatType::OpenInternet);
        assert_eq!(result.mapped_addr1, socket.local_addr().unwrap());
        assert!(result.punching_ok);
        token.cancel();
    }
}
