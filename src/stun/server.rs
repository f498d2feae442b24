//! Minimal STUN server: answers UDP Binding requests with a Binding Success
//! Response carrying XOR-MAPPED-ADDRESS. Everything else is dropped.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::attributes::build_xor_mapped_address;
use super::{
    Attribute, Message, MessageClass, Result, ATTR_SOFTWARE, MAGIC_COOKIE, METHOD_BINDING,
};
use crate::socket::bind_udp;

pub struct Server {
    socket: UdpSocket,

    /// Included as a SOFTWARE attribute in responses when set.
    pub software: Option<String>,

    /// Bounds each read so a cancelled serve loop exits promptly.
    pub read_timeout: Duration,

    /// Largest datagram read into the scratch buffer.
    pub max_packet_size: usize,
}

impl Server {
    /// Binds a server to `addr` (e.g. `"0.0.0.0:3478"`).
    pub fn bind(addr: SocketAddr) -> Result<Server> {
        Ok(Server::new(bind_udp(addr)?))
    }

    pub fn new(socket: UdpSocket) -> Server {
        Server {
            socket,
            software: None,
            read_timeout: Duration::from_secs(1),
            max_packet_size: 1500,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Runs the serve loop until `token` is cancelled.
    pub async fn serve(&self, token: &CancellationToken) -> Result<()> {
        let mut buf = vec![0u8; self.max_packet_size.max(128)];
        loop {
            let (len, from) = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                rs = tokio::time::timeout(self.read_timeout, self.socket.recv_from(&mut buf)) => {
                    match rs {
                        Ok(rs) => rs?,
                        Err(_) => continue,
                    }
                }
            };
            self.handle_packet(&buf[..len], from).await;
        }
    }

    async fn handle_packet(&self, pkt: &[u8], from: SocketAddr) {
        // Non-STUN traffic and malformed messages are silently ignored.
        let req = match Message::parse(pkt) {
            Ok(req) => req,
            Err(_) => return,
        };
        if req.method != METHOD_BINDING || req.class != MessageClass::Request {
            return;
        }

        let resp = self.binding_success(&req, from);
        if let Err(e) = self.socket.send_to(&resp.marshal(), from).await {
            log::debug!("binding response to {from} failed: {e:?}");
        }
    }

    fn binding_success(&self, req: &Message, from: SocketAddr) -> Message {
        let mut attributes = vec![build_xor_mapped_address(from, &req.transaction_id)];
        if let Some(software) = &self.software {
            attributes.push(Attribute {
                typ: ATTR_SOFTWARE,
                value: software.as_bytes().to_vec(),
            });
        }
        Message {
            method: METHOD_BINDING,
            class: MessageClass::SuccessResponse,
            cookie: MAGIC_COOKIE,
            transaction_id: req.transaction_id,
            attributes,
        }
    }
}
