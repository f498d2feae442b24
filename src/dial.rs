//! Dialing side of the traversal facade.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::mux::Mux;
use crate::punch::{Peer, PunchResult, Puncher};
use crate::session::Session;

/// Configures [`dial`] behavior.
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Steady HELLO cadence during punching. Zero selects the default.
    pub interval: Duration,

    /// Inbound queue size for the created session. Zero selects the default.
    pub queue: usize,

    /// Enables session keepalive when non-zero.
    pub keepalive_interval: Duration,

    /// Overall punching deadline.
    pub timeout: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            queue: 0,
            keepalive_interval: Duration::ZERO,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Performs NAT traversal with `peer` and returns an established session.
/// The mux must already be started.
pub async fn dial(
    token: &CancellationToken,
    mux: &Mux,
    self_id: &str,
    peer: &Peer,
    options: DialOptions,
) -> Result<(Session, PunchResult)> {
    let puncher = Puncher::new(mux, self_id, options.interval).with_timeout(options.timeout);
    let result = puncher.punch(token, peer).await?;

    let session = Session::new(mux, result.addr, options.queue);
    session.update_remote(result.addr);

    if !options.keepalive_interval.is_zero() {
        session.set_keepalive(options.keepalive_interval);
        session.start_keepalive(token);
    }

    Ok((session, result))
}
