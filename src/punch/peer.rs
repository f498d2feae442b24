use std::net::SocketAddr;

/// A remote peer to punch toward.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: String,

    /// The peer's externally reachable UDP address (primary).
    pub addr: SocketAddr,

    /// Optional alternate addresses to try while the peer is unknown.
    pub candidates: Vec<SocketAddr>,
}

impl Peer {
    pub fn new(id: &str, addr: SocketAddr) -> Peer {
        Peer {
            id: id.to_string(),
            addr,
            candidates: Vec::new(),
        }
    }

    pub fn with_candidates(mut self, candidates: Vec<SocketAddr>) -> Peer {
        self.candidates = candidates;
        self
    }

    /// Primary address first, then alternates, deduplicated.
    pub(crate) fn candidate_list(&self) -> Vec<SocketAddr> {
        let mut list = vec![self.addr];
        for candidate in &self.candidates {
            if !list.contains(candidate) {
                list.push(*candidate);
            }
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_deduplicated_primary_first() {
        let primary: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let alt: SocketAddr = "10.0.0.2:2000".parse().unwrap();
        let peer = Peer::new("p", primary).with_candidates(vec![alt, primary, alt]);
        assert_eq!(peer.candidate_list(), vec![primary, alt]);
    }
}
