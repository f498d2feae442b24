//! TURN client over a single connected UDP socket.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::addr::{parse_xor_addr, xor_addr};
use super::integrity::{add_fingerprint, add_message_integrity, long_term_key};
use super::message::Message;
use super::{
    is_error_response, is_success_response, stun_type, Error, Result, ATTR_CHANNEL_NUMBER,
    ATTR_DATA, ATTR_ERROR_CODE, ATTR_LIFETIME, ATTR_NONCE, ATTR_REALM, ATTR_REQUESTED_TRANSPORT,
    ATTR_USERNAME, ATTR_XOR_PEER_ADDRESS, ATTR_XOR_RELAYED_ADDRESS, CHANNEL_MAX, CHANNEL_MIN,
    CLASS_INDICATION, CLASS_REQUEST, METHOD_ALLOCATE, METHOD_CHANNEL_BIND,
    METHOD_CREATE_PERMISSION, METHOD_REFRESH, METHOD_SEND,
};
use crate::socket::bind_udp;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RTO: Duration = Duration::from_millis(250);

/// Long-term auth parameters.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Default)]
struct ClientState {
    realm: String,
    nonce: String,
    relayed: Option<SocketAddr>,
    lifetime: Duration,
}

/// A TURN client over UDP.
pub struct Client {
    socket: UdpSocket,
    creds: Credentials,

    /// Per-request deadline.
    pub timeout: Duration,

    /// Initial retransmission timeout, doubled on each resend.
    pub rto: Duration,

    state: Mutex<ClientState>,
}

impl Client {
    /// Resolves `server` (host:port) and creates a connected UDP client.
    pub async fn dial(server: &str, creds: Credentials) -> Result<Client> {
        let server_addr = tokio::net::lookup_host(server)
            .await?
            .next()
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no address for turn server",
                ))
            })?;
        let bind_addr: SocketAddr = if server_addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = bind_udp(bind_addr)?;
        socket.connect(server_addr).await?;
        Ok(Client {
            socket,
            creds,
            timeout: DEFAULT_TIMEOUT,
            rto: DEFAULT_RTO,
            state: Mutex::new(ClientState::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Returns the allocated relayed address, if any.
    pub fn relayed_addr(&self) -> Option<SocketAddr> {
        self.state.lock().relayed
    }

    /// Returns the last realm/nonce learned from the server.
    pub fn nonce_realm(&self) -> (String, String) {
        let state = self.state.lock();
        (state.realm.clone(), state.nonce.clone())
    }

    /// Requests a relayed address (UDP transport). The first attempt goes
    /// out unauthenticated; a 401/438 challenge caches realm and nonce and
    /// the request is retried once with long-term credentials.
    pub async fn allocate(
        &self,
        token: &CancellationToken,
        lifetime: Duration,
    ) -> Result<SocketAddr> {
        let rs = match self.allocate_once(token, lifetime, false).await {
            Err(Error::Unauthorized) => self.allocate_once(token, lifetime, true).await,
            rs => rs,
        };
        let (relayed, lifetime) = rs?;
        let mut state = self.state.lock();
        state.relayed = Some(relayed);
        state.lifetime = lifetime;
        Ok(relayed)
    }

    async fn allocate_once(
        &self,
        token: &CancellationToken,
        lifetime: Duration,
        with_auth: bool,
    ) -> Result<(SocketAddr, Duration)> {
        let mut m = Message::new(stun_type(METHOD_ALLOCATE, CLASS_REQUEST));

        // REQUESTED-TRANSPORT: 17 = UDP (RFC 5766)
        m.add_attr(ATTR_REQUESTED_TRANSPORT, vec![17, 0, 0, 0]);
        let secs = lifetime.as_secs() as u32;
        m.add_attr(ATTR_LIFETIME, secs.to_be_bytes().to_vec());

        if with_auth {
            self.add_auth_attrs(&mut m);
        }

        let resp = self.do_request(token, m, with_auth).await?;

        let attr = resp
            .find_attr(ATTR_XOR_RELAYED_ADDRESS)
            .ok_or(Error::BadMessage)?;
        let relayed = parse_xor_addr(&attr.value, &resp.transaction_id)?;

        let mut granted = Duration::from_secs(secs as u64);
        if let Some(attr) = resp.find_attr(ATTR_LIFETIME) {
            if attr.value.len() == 4 {
                let v = u32::from_be_bytes([attr.value[0], attr.value[1], attr.value[2], attr.value[3]]);
                granted = Duration::from_secs(v as u64);
            }
        }
        Ok((relayed, granted))
    }

    /// Refreshes the allocation lifetime. Always authenticated; retried once
    /// after a stale-nonce challenge.
    pub async fn refresh(&self, token: &CancellationToken, lifetime: Duration) -> Result<()> {
        if self.state.lock().relayed.is_none() {
            return Err(Error::NoAllocation);
        }
        let resp = match self.refresh_once(token, lifetime).await {
            Err(Error::Unauthorized) => self.refresh_once(token, lifetime).await,
            rs => rs,
        }?;

        if let Some(attr) = resp.find_attr(ATTR_LIFETIME) {
            if attr.value.len() == 4 {
                let v = u32::from_be_bytes([attr.value[0], attr.value[1], attr.value[2], attr.value[3]]);
                self.state.lock().lifetime = Duration::from_secs(v as u64);
            }
        }
        Ok(())
    }

    async fn refresh_once(&self, token: &CancellationToken, lifetime: Duration) -> Result<Message> {
        let mut m = Message::new(stun_type(METHOD_REFRESH, CLASS_REQUEST));
        let secs = lifetime.as_secs() as u32;
        m.add_attr(ATTR_LIFETIME, secs.to_be_bytes().to_vec());
        self.add_auth_attrs(&mut m);
        self.do_request(token, m, true).await
    }

    /// Creates a permission for `peer`, required before Send or ChannelData
    /// traffic can flow. Retried once on a stale nonce.
    pub async fn create_permission(
        &self,
        token: &CancellationToken,
        peer: SocketAddr,
    ) -> Result<()> {
        if self.state.lock().relayed.is_none() {
            return Err(Error::NoAllocation);
        }
        let rs = match self.create_permission_once(token, peer).await {
            Err(Error::Unauthorized) => self.create_permission_once(token, peer).await,
            rs => rs,
        };
        rs.map(|_| ())
    }

    async fn create_permission_once(
        &self,
        token: &CancellationToken,
        peer: SocketAddr,
    ) -> Result<Message> {
        let mut m = Message::new(stun_type(METHOD_CREATE_PERMISSION, CLASS_REQUEST));
        let xp = xor_addr(peer, &m.transaction_id);
        m.add_attr(ATTR_XOR_PEER_ADDRESS, xp);
        self.add_auth_attrs(&mut m);
        self.do_request(token, m, true).await
    }

    /// Binds channel `ch` to `peer` for compact ChannelData framing.
    /// Retried once on a stale nonce.
    pub async fn channel_bind(
        &self,
        token: &CancellationToken,
        peer: SocketAddr,
        ch: u16,
    ) -> Result<()> {
        if !(CHANNEL_MIN..=CHANNEL_MAX).contains(&ch) {
            return Err(Error::InvalidAddress);
        }
        if self.state.lock().relayed.is_none() {
            return Err(Error::NoAllocation);
        }
        let rs = match self.channel_bind_once(token, peer, ch).await {
            Err(Error::Unauthorized) => self.channel_bind_once(token, peer, ch).await,
            rs => rs,
        };
        rs.map(|_| ())
    }

    async fn channel_bind_once(
        &self,
        token: &CancellationToken,
        peer: SocketAddr,
        ch: u16,
    ) -> Result<Message> {
        let mut m = Message::new(stun_type(METHOD_CHANNEL_BIND, CLASS_REQUEST));

        // CHANNEL-NUMBER: channel (2) + RFFU (2)
        let mut cn = vec![0u8; 4];
        cn[..2].copy_from_slice(&ch.to_be_bytes());
        m.add_attr(ATTR_CHANNEL_NUMBER, cn);

        let xp = xor_addr(peer, &m.transaction_id);
        m.add_attr(ATTR_XOR_PEER_ADDRESS, xp);
        self.add_auth_attrs(&mut m);
        self.do_request(token, m, true).await
    }

    /// Sends data to `peer` through the relay with a Send indication.
    /// Best effort; no response is expected.
    pub async fn send_indication(&self, peer: SocketAddr, data: &[u8]) -> Result<()> {
        if self.state.lock().relayed.is_none() {
            return Err(Error::NoAllocation);
        }
        let mut m = Message::new(stun_type(METHOD_SEND, CLASS_INDICATION));
        let xp = xor_addr(peer, &m.transaction_id);
        m.add_attr(ATTR_XOR_PEER_ADDRESS, xp);
        m.add_attr(ATTR_DATA, data.to_vec());
        self.socket.send(&m.encode()).await?;
        Ok(())
    }

    /// Sends data via ChannelData framing (requires a prior
    /// [`channel_bind`](Self::channel_bind)).
    pub async fn send_channel_data(&self, ch: u16, data: &[u8]) -> Result<()> {
        if !(CHANNEL_MIN..=CHANNEL_MAX).contains(&ch) {
            return Err(Error::InvalidAddress);
        }
        // ChannelData: channel (2), length (2), data
        let mut b = Vec::with_capacity(4 + data.len());
        b.extend_from_slice(&ch.to_be_bytes());
        b.extend_from_slice(&(data.len() as u16).to_be_bytes());
        b.extend_from_slice(data);
        self.socket.send(&b).await?;
        Ok(())
    }

    /// Reads either a ChannelData frame or a Data indication from the
    /// server. The payload is copied to the head of `buf`. ChannelData does
    /// not carry the peer address (the caller maps channel to peer), so the
    /// returned peer is `None` for that framing.
    pub async fn read_from(&self, buf: &mut [u8]) -> Result<(Option<SocketAddr>, usize)> {
        let mut scratch = vec![0u8; 2048];
        let n = self.socket.recv(&mut scratch).await?;
        if n < 4 {
            return Err(Error::BadMessage);
        }

        // ChannelData frames start with a channel number in [0x4000, 0x7FFF].
        let ch = u16::from_be_bytes([scratch[0], scratch[1]]);
        if (CHANNEL_MIN..=CHANNEL_MAX).contains(&ch) {
            let len = u16::from_be_bytes([scratch[2], scratch[3]]) as usize;
            if 4 + len > n {
                return Err(Error::BadMessage);
            }
            let copied = len.min(buf.len());
            buf[..copied].copy_from_slice(&scratch[4..4 + copied]);
            return Ok((None, copied));
        }

        // Otherwise a STUN message, e.g. a Data indication.
        let msg = Message::parse(&scratch[..n])?;
        let peer_attr = msg.find_attr(ATTR_XOR_PEER_ADDRESS).ok_or(Error::BadMessage)?;
        let peer = parse_xor_addr(&peer_attr.value, &msg.transaction_id)?;
        let Some(data) = msg.find_attr(ATTR_DATA) else {
            return Ok((Some(peer), 0));
        };
        let copied = data.value.len().min(buf.len());
        buf[..copied].copy_from_slice(&data.value[..copied]);
        Ok((Some(peer), copied))
    }

    /// USERNAME/REALM/NONCE for long-term credentials. MESSAGE-INTEGRITY and
    /// FINGERPRINT are appended in `do_request` over the final bytes.
    fn add_auth_attrs(&self, m: &mut Message) {
        let (realm, nonce) = {
            let state = self.state.lock();
            (state.realm.clone(), state.nonce.clone())
        };
        if !self.creds.username.is_empty() {
            m.add_attr(ATTR_USERNAME, self.creds.username.as_bytes().to_vec());
        }
        if !realm.is_empty() {
            m.add_attr(ATTR_REALM, realm.into_bytes());
        }
        if !nonce.is_empty() {
            m.add_attr(ATTR_NONCE, nonce.into_bytes());
        }
    }

    /// Sends a request and waits for the matching response, retransmitting
    /// on an RTO-doubling schedule bounded by the request timeout.
    async fn do_request(
        &self,
        token: &CancellationToken,
        mut req: Message,
        with_auth: bool,
    ) -> Result<Message> {
        if with_auth {
            let key = {
                let state = self.state.lock();
                long_term_key(&self.creds.username, &state.realm, &self.creds.password)
            };
            add_message_integrity(&mut req, &key);
            add_fingerprint(&mut req);
        }
        let raw = req.encode();

        let deadline = Instant::now() + self.timeout;
        let mut rto = self.rto;
        let mut buf = vec![0u8; 2048];

        loop {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.socket.send(&raw).await?;

            let window_end = (Instant::now() + rto).min(deadline);
            loop {
                let now = Instant::now();
                if now >= window_end {
                    break;
                }
                let n = tokio::select! {
                    _ = token.cancelled() => return Err(Error::Cancelled),
                    rs = tokio::time::timeout(window_end - now, self.socket.recv(&mut buf)) => {
                        match rs {
                            Ok(rs) => rs?,
                            Err(_) => break,
                        }
                    }
                };
                let resp = match Message::parse(&buf[..n]) {
                    Ok(resp) => resp,
                    Err(_) => continue,
                };
                if resp.transaction_id != req.transaction_id {
                    continue;
                }
                return self.finish_response(resp);
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            rto *= 2;
        }
    }

    /// Maps a matching response to success or error, caching realm/nonce
    /// from challenges so the caller's single retry can authenticate.
    fn finish_response(&self, resp: Message) -> Result<Message> {
        if is_error_response(resp.typ) {
            if let Some(attr) = resp.find_attr(ATTR_ERROR_CODE) {
                if attr.value.len() >= 4 {
                    let code = attr.value[2] as u16 * 100 + attr.value[3] as u16;

                    let mut state = self.state.lock();
                    if let Some(realm) = resp.find_attr(ATTR_REALM) {
                        if let Ok(realm) = String::from_utf8(realm.value.clone()) {
                            state.realm = realm;
                        }
                    }
                    if let Some(nonce) = resp.find_attr(ATTR_NONCE) {
                        if let Ok(nonce) = String::from_utf8(nonce.value.clone()) {
                            state.nonce = nonce;
                        }
                    }
                    drop(state);

                    if code == 401 || code == 438 {
                        return Err(Error::Unauthorized);
                    }
                }
            }
            return Err(Error::BadMessage);
        }
        if !is_success_response(resp.typ) {
            return Err(Error::BadMessage);
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::{ATTR_MESSAGE_INTEGRITY, CLASS_ERROR, CLASS_SUCCESS};

    fn creds() -> Credentials {
        Credentials {
            username: "user".into(),
            password: "pass".into(),
        }
    }

    fn error_response(req: &Message, code: u16, realm: &str, nonce: &str) -> Vec<u8> {
        let mut resp = Message {
            typ: stun_type(METHOD_ALLOCATE, CLASS_ERROR),
            transaction_id: req.transaction_id,
            attrs: Vec::new(),
        };
        resp.add_attr(
            ATTR_ERROR_CODE,
            vec![0, 0, (code / 100) as u8, (code % 100) as u8],
        );
        resp.add_attr(ATTR_REALM, realm.as_bytes().to_vec());
        resp.add_attr(ATTR_NONCE, nonce.as_bytes().to_vec());
        resp.encode()
    }

    #[tokio::test]
    async fn allocate_retries_once_with_credentials() {
        let server = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = server.local_addr().unwrap();
        let relayed: SocketAddr = "198.51.100.9:49152".parse().unwrap();

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];

            // First request is unauthenticated: challenge it.
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            let req = Message::parse(&buf[..n]).unwrap();
            assert!(req.find_attr(ATTR_USERNAME).is_none());
            server
                .send_to(&error_response(&req, 401, "example.org", "nonce-1"), from)
                .await
                .unwrap();

            // Second request carries credentials and integrity.
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            let req = Message::parse(&buf[..n]).unwrap();
            assert_eq!(
                req.find_attr(ATTR_USERNAME).unwrap().value,
                b"user".to_vec()
            );
            assert_eq!(
                req.find_attr(ATTR_REALM).unwrap().value,
                b"example.org".to_vec()
            );
            assert_eq!(
                req.find_attr(ATTR_NONCE).unwrap().value,
                b"nonce-1".to_vec()
            );
            assert!(req.find_attr(ATTR_MESSAGE_INTEGRITY).is_some());

            let mut resp = Message {
                typ: stun_type(METHOD_ALLOCATE, CLASS_SUCCESS),
                transaction_id: req.transaction_id,
                attrs: Vec::new(),
            };
            let xr = xor_addr(relayed, &req.transaction_id);
            resp.add_attr(ATTR_XOR_RELAYED_ADDRESS, xr);
            resp.add_attr(ATTR_LIFETIME, 600u32.to_be_bytes().to_vec());
            server.send_to(&resp.encode(), from).await.unwrap();
        });

        let client = Client::dial(&server_addr.to_string(), creds()).await.unwrap();
        let token = CancellationToken::new();
        let got = client
            .allocate(&token, Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(got, relayed);
        assert_eq!(client.relayed_addr(), Some(relayed));
        let (realm, nonce) = client.nonce_realm();
        assert_eq!(realm, "example.org");
        assert_eq!(nonce, "nonce-1");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn operations_require_allocation() {
        let server = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = Client::dial(&server_addr.to_string(), creds()).await.unwrap();
        let token = CancellationToken::new();
        let peer: SocketAddr = "192.0.2.5:2000".parse().unwrap();

        assert!(matches!(
            client.refresh(&token, Duration::from_secs(60)).await,
            Err(Error::NoAllocation)
        ));
        assert!(matches!(
            client.create_permission(&token, peer).await,
            Err(Error::NoAllocation)
        ));
        assert!(matches!(
            client.send_indication(peer, b"x").await,
            Err(Error::NoAllocation)
        ));
    }

    #[tokio::test]
    async fn channel_numbers_are_range_checked() {
        let server = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = Client::dial(&server_addr.to_string(), creds()).await.unwrap();
        let token = CancellationToken::new();
        let peer: SocketAddr = "192.0.2.5:2000".parse().unwrap();

        assert!(matches!(
            client.send_channel_data(0x3FFF, b"x").await,
            Err(Error::InvalidAddress)
        ));
        assert!(matches!(
            client.send_channel_data(0x8000, b"x").await,
            Err(Error::InvalidAddress)
        ));
        assert!(matches!(
            client.channel_bind(&token, peer, 0x0001).await,
            Err(Error::InvalidAddress)
        ));
    }

    #[tokio::test]
    async fn read_from_classifies_channel_data() {
        let server = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = Client::dial(&server_addr.to_string(), creds()).await.unwrap();

        // Teach the server the client's address, then answer with a
        // ChannelData frame: channel 0x4000, length 5, "hello".
        client.send_channel_data(0x4000, b"ping").await.unwrap();
        let mut buf = vec![0u8; 64];
        let (_, from) = server.recv_from(&mut buf).await.unwrap();
        let mut frame = vec![0x40, 0x00, 0x00, 0x05];
        frame.extend_from_slice(b"hello");
        server.send_to(&frame, from).await.unwrap();

        let mut out = vec![0u8; 1500];
        let (peer, n) = client.read_from(&mut out).await.unwrap();
        assert_eq!(peer, None);
        assert_eq!(n, 5);
        assert_eq!(&out[..5], b"hello");
    }

    #[tokio::test]
    async fn read_from_parses_data_indication() {
        let server = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = Client::dial(&server_addr.to_string(), creds()).await.unwrap();
        let peer_addr: SocketAddr = "192.0.2.77:4000".parse().unwrap();

        client.send_channel_data(0x4000, b"ping").await.unwrap();
        let mut buf = vec![0u8; 64];
        let (_, from) = server.recv_from(&mut buf).await.unwrap();

        let mut ind = Message::new(stun_type(crate::turn::METHOD_DATA, CLASS_INDICATION));
        let xp = xor_addr(peer_addr, &ind.transaction_id);
        ind.add_attr(ATTR_XOR_PEER_ADDRESS, xp);
        ind.add_attr(ATTR_DATA, b"relayed payload".to_vec());
        server.send_to(&ind.encode(), from).await.unwrap();

        let mut out = vec![0u8; 1500];
        let (peer, n) = client.read_from(&mut out).await.unwrap();
        assert_eq!(peer, Some(peer_addr));
        assert_eq!(&out[..n], b"relayed payload");
    }

    #[tokio::test]
    async fn request_times_out_against_silence() {
        let server = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = server.local_addr().unwrap();
        let mut client = Client::dial(&server_addr.to_string(), creds()).await.unwrap();
        client.timeout = Duration::from_millis(200);
        client.rto = Duration::from_millis(50);

        let token = CancellationToken::new();
        assert!(matches!(
            client.allocate(&token, Duration::from_secs(60)).await,
            Err(Error::Timeout)
        ));
    }
}
