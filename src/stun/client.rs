//! Transactional STUN Binding client.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::{find_mapped_address, Error, Message, MessageClass, Result, METHOD_BINDING};
use crate::socket::bind_udp;

/// A STUN Binding client with retransmission.
#[derive(Debug, Clone)]
pub struct Client {
    /// Overall transaction deadline.
    pub timeout: Duration,

    /// How many times to retransmit the same request on timeout.
    pub retries: usize,

    /// Initial retransmission timeout, doubled on each retry.
    pub rto: Duration,
}

impl Default for Client {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            retries: 6,
            rto: Duration::from_millis(250),
        }
    }
}

impl Client {
    pub fn new() -> Client {
        Client::default()
    }

    /// Resolves `server` (e.g. `"stun.l.google.com:19302"`), binds an
    /// ephemeral socket of the matching family, and performs a Binding
    /// transaction. Returns the public mapped address.
    pub async fn binding_request(
        &self,
        token: &CancellationToken,
        server: &str,
    ) -> Result<SocketAddr> {
        let server = tokio::net::lookup_host(server)
            .await?
            .next()
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no address for stun server",
                ))
            })?;
        let bind_addr: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = bind_udp(bind_addr)?;
        self.binding_request_with(token, &socket, server).await
    }

    /// Performs a Binding transaction toward `server` over an existing
    /// unconnected socket. Responses from other sources are ignored, so the
    /// socket can be shared across transactions (the NAT detector reuses one
    /// socket against two servers).
    pub async fn binding_request_with(
        &self,
        token: &CancellationToken,
        socket: &UdpSocket,
        server: SocketAddr,
    ) -> Result<SocketAddr> {
        let tid = super::new_transaction_id();
        let request = Message::binding_request(tid).marshal();

        let deadline = Instant::now() + self.timeout;
        let mut rto = self.rto;
        let mut buf = vec![0u8; 1500];

        for _ in 0..=self.retries {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            socket.send_to(&request, server).await?;

            // Wait for a matching response until min(deadline, now + rto).
            let window_end = (Instant::now() + rto).min(deadline);
            loop {
                let now = Instant::now();
                if now >= window_end {
                    break;
                }
                let (len, from) = tokio::select! {
                    _ = token.cancelled() => return Err(Error::Cancelled),
                    rs = tokio::time::timeout(window_end - now, socket.recv_from(&mut buf)) => {
                        match rs {
                            Ok(rs) => rs?,
                            Err(_) => break,
                        }
                    }
                };
                if from != server {
                    continue;
                }
                let resp = match Message::parse(&buf[..len]) {
                    Ok(resp) => resp,
                    Err(_) => continue,
                };
                if resp.transaction_id != tid {
                    continue;
                }
                if resp.method != METHOD_BINDING {
                    return Err(Error::NotStun);
                }
                return match resp.class {
                    MessageClass::SuccessResponse => find_mapped_address(&resp),
                    MessageClass::ErrorResponse => Err(Error::ErrorResponse),
                    _ => Err(Error::NotStun),
                };
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            rto *= 2;
        }

        Err(Error::Timeout)
    }
}
