//! Phase deadlines.

use std::time::Duration;

use super::connection::Phase;

/// Time a fresh connection may stay silent before it is classified anyway.
pub const DEFAULT_PROTOCOL_TIMEOUT: Duration = Duration::from_secs(2);

/// Time a disguised client has to answer the decoy banner.
pub const DEFAULT_BANNER_TIMEOUT: Duration = Duration::from_secs(3);

/// Grace period of a half-closed connection before its handle is released.
pub const DEFAULT_CLOSING_TIMEOUT: Duration = Duration::from_secs(5);

/// Time buffered bytes may stay unflushed before the pair is torn down.
pub const DEFAULT_ALIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// What an expired deadline asks the dispatcher to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Classify a silent client with whatever is available.
    ForceClassify,
    /// Drop a disguised client that never answered.
    AbandonBanner,
    /// Tear down a pair whose buffered bytes cannot be delivered.
    Evict,
    /// Release a half-closed connection.
    Reclaim,
}

/// Deadlines per phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub protocol: Duration,
    pub banner: Duration,
    pub closing: Duration,
    pub alive: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            protocol: DEFAULT_PROTOCOL_TIMEOUT,
            banner: DEFAULT_BANNER_TIMEOUT,
            closing: DEFAULT_CLOSING_TIMEOUT,
            alive: DEFAULT_ALIVE_TIMEOUT,
        }
    }
}

impl TimeoutPolicy {
    /// Check a connection's deadline.
    ///
    /// `idle` is the time since the connection's last activity. Connected
    /// pairs without buffered bytes have no deadline at all.
    pub fn check(
        &self,
        phase: &Phase,
        buffered: usize,
        idle: Duration,
        heavy_load: bool,
    ) -> Option<Expiry> {
        match phase {
            Phase::Deciding { .. } if idle >= self.protocol => Some(Expiry::ForceClassify),
            Phase::BannerSent { .. } if idle >= self.banner => Some(Expiry::AbandonBanner),
            Phase::Closing if heavy_load || idle > self.closing => Some(Expiry::Reclaim),
            Phase::Connected { .. } if buffered > 0 && idle >= self.alive => Some(Expiry::Evict),
            _ => None,
        }
    }
}
