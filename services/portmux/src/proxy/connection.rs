//! Connection records and their lifecycle phases.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Instant;

use super::net::{Interest, Readiness, Source};
use super::relay::RelayBuffer;
use super::table::ConnId;

/// Lifecycle phase of a connection.
///
/// Phases with a partner carry its id; phases before pairing carry the
/// client's origin address, needed for transparent binding later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The listening socket.
    Accepting,
    /// Accepted client waiting to be classified.
    Deciding { origin: SocketAddr },
    /// Disguised client that received the decoy banner.
    BannerSent { origin: SocketAddr },
    /// Backend of a disguised client, connect in flight.
    BannerConnecting { peer: ConnId },
    /// Backend of a disguised client, greeting not yet swallowed.
    BannerConnected { peer: ConnId },
    /// Backend connect in flight.
    Connecting { peer: ConnId },
    /// Relaying.
    Connected { peer: ConnId },
    /// Half-closed, waiting to be reclaimed.
    Closing,
}

impl Phase {
    /// Partner of this connection, if paired.
    pub fn peer(&self) -> Option<ConnId> {
        match self {
            Phase::BannerConnecting { peer }
            | Phase::BannerConnected { peer }
            | Phase::Connecting { peer }
            | Phase::Connected { peer } => Some(*peer),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Accepting => "accepting",
            Phase::Deciding { .. } => "deciding",
            Phase::BannerSent { .. } => "banner_sent",
            Phase::BannerConnecting { .. } => "banner_connecting",
            Phase::BannerConnected { .. } => "banner_connected",
            Phase::Connecting { .. } => "connecting",
            Phase::Connected { .. } => "connected",
            Phase::Closing => "closing",
        }
    }
}

/// Which side of a pair a connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listener,
    Client,
    Backend,
}

/// The OS object behind a connection.
#[derive(Debug)]
pub enum Endpoint<L, S> {
    Listener(L),
    Stream(S),
}

impl<L, S> Endpoint<L, S> {
    pub fn stream(&self) -> Option<&S> {
        match self {
            Endpoint::Stream(stream) => Some(stream),
            Endpoint::Listener(_) => None,
        }
    }

    pub fn stream_mut(&mut self) -> Option<&mut S> {
        match self {
            Endpoint::Stream(stream) => Some(stream),
            Endpoint::Listener(_) => None,
        }
    }
}

impl<L: Source, S: Source> Source for Endpoint<L, S> {
    fn handle(&self) -> RawFd {
        match self {
            Endpoint::Listener(listener) => listener.handle(),
            Endpoint::Stream(stream) => stream.handle(),
        }
    }
}

/// One entry of the connection table.
#[derive(Debug)]
pub struct Connection<L, S> {
    pub(crate) endpoint: Endpoint<L, S>,
    pub(crate) phase: Phase,
    pub(crate) role: Role,
    pub(crate) last_activity: Instant,
    pub(crate) buffer: RelayBuffer,
    pub(crate) interest: Interest,
    pub(crate) ready: Readiness,
}

impl<L, S> Connection<L, S> {
    fn with(
        endpoint: Endpoint<L, S>,
        phase: Phase,
        role: Role,
        interest: Interest,
        now: Instant,
    ) -> Self {
        Self {
            endpoint,
            phase,
            role,
            last_activity: now,
            buffer: RelayBuffer::new(),
            interest,
            ready: Readiness::default(),
        }
    }

    /// The listening socket.
    pub fn listener(listener: L, now: Instant) -> Self {
        Self::with(
            Endpoint::Listener(listener),
            Phase::Accepting,
            Role::Listener,
            Interest::READ,
            now,
        )
    }

    /// A freshly accepted client.
    pub fn accepted(stream: S, origin: SocketAddr, now: Instant) -> Self {
        Self::with(
            Endpoint::Stream(stream),
            Phase::Deciding { origin },
            Role::Client,
            Interest::READ,
            now,
        )
    }

    /// A backend whose connect is in flight.
    pub fn outbound(stream: S, phase: Phase, now: Instant) -> Self {
        Self::with(Endpoint::Stream(stream), phase, Role::Backend, Interest::WRITE, now)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn peer(&self) -> Option<ConnId> {
        self.phase.peer()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Bytes read from this side and not yet delivered to the peer.
    pub fn buffered(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn stream(&self) -> Option<&S> {
        self.endpoint.stream()
    }

    pub fn stream_mut(&mut self) -> Option<&mut S> {
        self.endpoint.stream_mut()
    }
}

impl<L: Source, S: Source> Connection<L, S> {
    pub fn handle(&self) -> RawFd {
        self.endpoint.handle()
    }
}
