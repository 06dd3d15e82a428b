//! Event loop and connection state machine.
//!
//! One [`Multiplexer`] runs per worker process. Each turn it rebuilds the poll
//! set from the connection table, waits for readiness, then visits every
//! record in ascending slot order:
//!
//! 1. deadlines first ([`TimeoutPolicy`]),
//! 2. then hangup/error conditions,
//! 3. then the phase-specific step (accept, classify, connect, relay).
//!
//! Destroying a connection always goes through two primitives. `shutdown`
//! half-closes a record and parks it in [`Phase::Closing`] with its handle
//! still reserved; `cleanup` releases the record and closes the handle. When
//! one side of a pair dies for its own reasons the other side is shut down,
//! never cleaned up in the same step, and reclaimed later by the closing
//! deadline (or eagerly under descriptor pressure).

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use super::backend::BackendPorts;
use super::connection::{Connection, Endpoint, Phase, Role};
use super::net::{is_descriptor_exhaustion, Interest, Network, PollEntry, Readiness, Stream};
use super::relay::{Flush, BUFFER_SIZE};
use super::sniff::{self, Protocol, SniffResult};
use super::table::{ConnId, ConnectionTable};
use super::timeout::{Expiry, TimeoutPolicy};
use crate::error::MuxError;

/// Upper bound on one readiness wait, so deadlines are checked regularly.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Default decoy SMTP greeting.
pub const DEFAULT_SMTP_BANNER: &str = "220 mail.example.com ESMTP Postfix";

/// Default SSH identification sent ahead of the real server's.
pub const DEFAULT_SSH_BANNER: &str = "SSH-2.0-OpenSSH_8.9p1";

/// The two-line greeting disguised clients receive on connect.
///
/// The SSH line must match the real SSH backend's identification string byte
/// for byte, since the client signs it during key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Banner {
    pub smtp: String,
    pub ssh: String,
}

impl Banner {
    pub fn render(&self) -> Vec<u8> {
        format!("{}\r\n{}\r\n", self.smtp, self.ssh).into_bytes()
    }
}

impl Default for Banner {
    fn default() -> Self {
        Self {
            smtp: DEFAULT_SMTP_BANNER.to_string(),
            ssh: DEFAULT_SSH_BANNER.to_string(),
        }
    }
}

/// Immutable multiplexer configuration.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Backend ports per protocol.
    pub backends: BackendPorts,
    /// Greet every client with the decoy banner.
    pub disguise: bool,
    /// Bind outbound connects to the client's address.
    pub transparent: bool,
    /// Decoy banner for disguise mode.
    pub banner: Banner,
    /// Phase deadlines.
    pub timeouts: TimeoutPolicy,
}

impl MuxConfig {
    /// Create a configuration with default banner and deadlines.
    pub fn new(backends: BackendPorts) -> Self {
        Self {
            backends,
            disguise: false,
            transparent: false,
            banner: Banner::default(),
            timeouts: TimeoutPolicy::default(),
        }
    }
}

/// Statistics for one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MuxStats {
    /// Connections accepted.
    pub accepted: u64,
    /// Clients classified as SSH.
    pub detected_ssh: u64,
    /// Clients classified as HTTP.
    pub detected_http: u64,
    /// Clients classified as TLS.
    pub detected_tls: u64,
    /// Disguised clients classified as SMTP.
    pub detected_smtp: u64,
    /// Clients sending unrecognized bytes.
    pub detected_unknown: u64,
    /// Clients that closed or failed before classification.
    pub sniff_failed: u64,
    /// Decoy banners written.
    pub banners_sent: u64,
    /// Backend connects that completed.
    pub backend_connected: u64,
    /// Backend connects that failed.
    pub backend_failed: u64,
    /// Bytes read from clients.
    pub bytes_from_clients: u64,
    /// Bytes read from backends.
    pub bytes_from_backends: u64,
    /// Connections half-closed.
    pub shutdowns: u64,
    /// Connections released.
    pub cleanups: u64,
    /// Pairs torn down for undeliverable bytes.
    pub evictions: u64,
    /// Accepts that hit the descriptor limit.
    pub heavy_load_events: u64,
}

/// Outcome of looking for the end of a backend greeting line.
enum Greeting {
    /// The line (including `\n`) was consumed.
    Swallowed(usize),
    /// No complete line yet.
    Pending,
}

type Table<N> = ConnectionTable<<N as Network>::Listener, <N as Network>::Stream>;

/// Single-threaded connection multiplexer.
pub struct Multiplexer<N: Network> {
    config: MuxConfig,
    net: N,
    table: Table<N>,
    listener: ConnId,
    heavy_load: bool,
    banner: Vec<u8>,
    poll_set: Vec<PollEntry>,
    poll_ids: Vec<ConnId>,
    stats: MuxStats,
}

impl<N: Network> Multiplexer<N> {
    /// Create a multiplexer around an already bound listener.
    ///
    /// `capacity` bounds the number of records, listener included; it is
    /// normally the process descriptor limit.
    pub fn new(
        config: MuxConfig,
        net: N,
        listener: N::Listener,
        capacity: usize,
    ) -> Result<Self, MuxError> {
        let mut table = ConnectionTable::with_capacity(capacity);
        let listener = table.insert(Connection::listener(listener, Instant::now()))?;
        let banner = config.banner.render();

        info!(
            ssh_port = config.backends.ssh,
            catch_all_port = config.backends.catch_all,
            disguise = config.disguise,
            transparent = config.transparent,
            capacity,
            "Multiplexer ready"
        );

        Ok(Self {
            config,
            net,
            table,
            listener,
            heavy_load: false,
            banner,
            poll_set: Vec::new(),
            poll_ids: Vec::new(),
            stats: MuxStats::default(),
        })
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    pub fn stats(&self) -> &MuxStats {
        &self.stats
    }

    pub fn table(&self) -> &Table<N> {
        &self.table
    }

    pub fn listener_id(&self) -> ConnId {
        self.listener
    }

    /// Descriptor pressure seen in the current turn; cleared once the turn
    /// has reclaimed closing connections.
    pub fn is_heavy_load(&self) -> bool {
        self.heavy_load
    }

    /// Run forever. Returns only with an error; the multiplexer keeps its
    /// state and may be run again when the error is recoverable.
    pub fn run(&mut self) -> Result<(), MuxError> {
        loop {
            self.wait()?;
            self.dispatch(Instant::now())?;
        }
    }

    /// One iteration, with `now` standing in for the clock.
    pub fn turn_at(&mut self, now: Instant) -> Result<(), MuxError> {
        self.wait()?;
        self.dispatch(now)
    }

    fn wait(&mut self) -> Result<(), MuxError> {
        self.poll_set.clear();
        self.poll_ids.clear();
        for (id, conn) in self.table.iter_mut() {
            conn.ready = Readiness::default();
            if conn.phase == Phase::Closing {
                continue;
            }
            self.poll_ids.push(id);
            self.poll_set.push(PollEntry::new(conn.handle(), conn.interest));
        }

        match self.net.wait(&mut self.poll_set, POLL_TIMEOUT) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(MuxError::Poll(e)),
        }

        for (id, entry) in self.poll_ids.iter().zip(&self.poll_set) {
            if let Some(conn) = self.table.get_mut(*id) {
                conn.ready = entry.ready;
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, now: Instant) -> Result<(), MuxError> {
        let mut first_error = None;
        let mut index = 0;
        // The bound is re-read every step: records created during the scan
        // above the cursor are visited in this same pass. An error does not
        // end the pass; existing pairs are still served.
        while index < self.table.bound() {
            if let Some(id) = self.table.id_at(index) {
                if let Err(e) = self.visit(id, now) {
                    debug!(conn = %id, error = %e, "Visit failed, continuing turn");
                    first_error.get_or_insert(e);
                }
            }
            index += 1;
        }
        self.table.shrink_bound();
        self.reap_closing(now);
        // Heavy load lasts for the iteration that detected it.
        self.heavy_load = false;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn visit(&mut self, id: ConnId, now: Instant) -> Result<(), MuxError> {
        let Some(conn) = self.table.get(id) else {
            return Ok(());
        };
        let phase = conn.phase;
        let ready = conn.ready;
        if phase == Phase::Closing {
            return Ok(());
        }

        let idle = now.saturating_duration_since(conn.last_activity);
        let expiry = self
            .config
            .timeouts
            .check(&phase, conn.buffer.len(), idle, self.heavy_load);
        match expiry {
            Some(Expiry::Evict) => {
                self.evict(id, phase, now);
                return Ok(());
            }
            Some(Expiry::AbandonBanner) => {
                debug!(conn = %id, "disguised client never answered the banner");
                self.cleanup(id);
                return Ok(());
            }
            Some(Expiry::Reclaim) => {
                self.cleanup(id);
                return Ok(());
            }
            Some(Expiry::ForceClassify) | None => {}
        }

        if ready.hangup {
            if phase == Phase::Accepting {
                warn!("Error condition on listening socket, ignoring");
                return Ok(());
            }
            self.hang_up(id, phase, now);
            return Ok(());
        }

        if ready.is_empty() && expiry.is_none() {
            return Ok(());
        }

        match phase {
            Phase::Accepting => self.accept_all(now),
            Phase::Deciding { origin } => self.decide(id, origin, now),
            Phase::BannerSent { origin } => self.classify_disguised(id, origin, now),
            Phase::Connecting { peer } | Phase::BannerConnecting { peer } => {
                self.finish_connect(id, peer, now);
                Ok(())
            }
            Phase::BannerConnected { peer } => {
                self.swallow_greeting(id, peer, now);
                Ok(())
            }
            Phase::Connected { peer } => {
                self.relay(id, peer, ready, now);
                Ok(())
            }
            Phase::Closing => Ok(()),
        }
    }

    fn accept_all(&mut self, now: Instant) -> Result<(), MuxError> {
        loop {
            let accepted = match self.table.get(self.listener).map(|c| &c.endpoint) {
                Some(Endpoint::Listener(listener)) => self.net.accept(listener),
                _ => return Ok(()),
            };

            match accepted {
                Ok((stream, origin)) => {
                    let id = match self.table.insert(Connection::accepted(stream, origin, now)) {
                        Ok(id) => id,
                        Err(e) => {
                            self.heavy_load = true;
                            return Err(e);
                        }
                    };
                    self.stats.accepted += 1;
                    debug!(conn = %id, origin = %origin, "Accepted connection");

                    if self.config.disguise {
                        self.decide(id, origin, now)?;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_descriptor_exhaustion(&e) => {
                    self.heavy_load = true;
                    self.stats.heavy_load_events += 1;
                    warn!(error = %e, "Out of descriptors, reclaiming closing connections");
                    break;
                }
                Err(e) => {
                    debug!(error = %e, "Accept failed");
                    break;
                }
            }
        }
        Ok(())
    }

    fn decide(&mut self, id: ConnId, origin: SocketAddr, now: Instant) -> Result<(), MuxError> {
        if self.config.disguise {
            self.send_banner(id, origin, now);
            return Ok(());
        }

        let result = match self.table.get(id).and_then(|c| c.stream()) {
            Some(stream) => sniff::sniff(stream),
            None => return Ok(()),
        };
        let Some(port) = self.config.backends.port_for(&result) else {
            self.stats.sniff_failed += 1;
            debug!(conn = %id, result = ?result, "Protocol detection failed");
            self.cleanup(id);
            return Ok(());
        };

        match &result {
            SniffResult::Detected(protocol) => self.count_protocol(*protocol),
            _ => self.count_protocol(Protocol::Ssh),
        }
        debug!(conn = %id, result = ?result, backend_port = port, "Protocol detected");
        self.open_backend(id, origin, port, false, now)
    }

    fn send_banner(&mut self, id: ConnId, origin: SocketAddr, now: Instant) {
        let Some(conn) = self.table.get_mut(id) else {
            return;
        };
        let Some(stream) = conn.endpoint.stream_mut() else {
            return;
        };
        if let Err(e) = stream.write_all(&self.banner) {
            debug!(conn = %id, error = %e, "Failed to send banner");
            self.cleanup(id);
            return;
        }
        conn.phase = Phase::BannerSent { origin };
        conn.interest = Interest::READ;
        conn.last_activity = now;
        self.stats.banners_sent += 1;
        debug!(conn = %id, "Banner sent");
    }

    fn classify_disguised(
        &mut self,
        id: ConnId,
        origin: SocketAddr,
        now: Instant,
    ) -> Result<(), MuxError> {
        let Some(conn) = self.table.get_mut(id) else {
            return Ok(());
        };
        let read = match conn.endpoint.stream_mut() {
            Some(stream) => conn.buffer.fill_from(stream),
            None => return Ok(()),
        };
        match read {
            Ok(0) => {
                debug!(conn = %id, "Client left during disguise handshake");
                self.cleanup(id);
                return Ok(());
            }
            Ok(n) => {
                conn.last_activity = now;
                self.stats.bytes_from_clients += n as u64;
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return Ok(())
            }
            Err(e) => {
                debug!(conn = %id, error = %e, "Read failed during disguise handshake");
                self.cleanup(id);
                return Ok(());
            }
        }

        let Some(protocol) = sniff::detect_disguised(conn.buffer.as_slice()) else {
            return Ok(());
        };
        let port = self.config.backends.port_for_protocol(protocol);
        self.count_protocol(protocol);
        debug!(conn = %id, protocol = %protocol, backend_port = port, "Disguised protocol detected");
        self.open_backend(id, origin, port, true, now)
    }

    fn open_backend(
        &mut self,
        client: ConnId,
        origin: SocketAddr,
        port: u16,
        disguised: bool,
        now: Instant,
    ) -> Result<(), MuxError> {
        let destination = match self.table.get(client).and_then(|c| c.stream()) {
            Some(stream) => self.net.destination(stream),
            None => return Ok(()),
        };
        let target = match destination {
            Ok(destination) => self.config.backends.target(destination, port),
            Err(e) => {
                warn!(conn = %client, error = %e, "Failed to resolve original destination");
                self.cleanup(client);
                return Ok(());
            }
        };

        let source = self.config.transparent.then_some(origin);
        let stream = match self.net.connect(target, source) {
            Ok(stream) => stream,
            Err(e) => {
                self.stats.backend_failed += 1;
                warn!(conn = %client, backend = %target, error = %e, "Backend connect failed");
                self.cleanup(client);
                return Ok(());
            }
        };

        let phase = if disguised {
            Phase::BannerConnecting { peer: client }
        } else {
            Phase::Connecting { peer: client }
        };
        let backend = match self.table.insert(Connection::outbound(stream, phase, now)) {
            Ok(id) => id,
            Err(e) => {
                self.heavy_load = true;
                self.cleanup(client);
                return Err(e);
            }
        };

        if let Some(conn) = self.table.get_mut(client) {
            conn.phase = Phase::Connected { peer: backend };
            conn.interest = Interest::NONE;
            conn.last_activity = now;
        }
        debug!(conn = %client, peer = %backend, backend = %target, "Connecting to backend");
        Ok(())
    }

    fn finish_connect(&mut self, id: ConnId, peer: ConnId, now: Instant) {
        if !self.is_paired(id, peer) {
            self.break_pair(id, peer, now);
            return;
        }

        let result = match self.table.get(id).and_then(|c| c.stream()) {
            Some(stream) => stream.finish_connect(),
            None => return,
        };
        if let Err(e) = result {
            self.stats.backend_failed += 1;
            warn!(conn = %id, peer = %peer, error = %e, "Backend connect failed");
            self.shutdown(peer, now);
            self.cleanup(id);
            return;
        }
        self.stats.backend_connected += 1;

        let Some((conn, client)) = self.table.pair_mut(id, peer) else {
            return;
        };
        if let Phase::BannerConnecting { peer } = conn.phase {
            conn.phase = Phase::BannerConnected { peer };
            conn.interest = Interest::READ;
        } else {
            conn.phase = Phase::Connected { peer };
            set_relay_interest(conn, client);
        }
        conn.last_activity = now;
        client.last_activity = now;
        debug!(conn = %id, peer = %peer, "Backend connected");
    }

    fn swallow_greeting(&mut self, id: ConnId, peer: ConnId, now: Instant) {
        if !self.is_paired(id, peer) {
            self.break_pair(id, peer, now);
            return;
        }

        let outcome = match self.table.get_mut(id).and_then(|c| c.stream_mut()) {
            Some(stream) => consume_line(stream),
            None => return,
        };
        match outcome {
            Ok(Greeting::Pending) => {}
            Ok(Greeting::Swallowed(len)) => {
                let Some((conn, client)) = self.table.pair_mut(id, peer) else {
                    return;
                };
                conn.phase = Phase::Connected { peer };
                set_relay_interest(conn, client);
                conn.last_activity = now;
                client.last_activity = now;
                debug!(conn = %id, peer = %peer, bytes = len, "Backend greeting swallowed");
            }
            Err(e) => {
                debug!(conn = %id, error = %e, "Backend went away before its greeting");
                self.shutdown(peer, now);
                self.cleanup(id);
            }
        }
    }

    fn relay(&mut self, id: ConnId, peer: ConnId, ready: Readiness, now: Instant) {
        match self.table.get(peer).map(|c| c.phase) {
            Some(Phase::Connected { peer: back }) if back == id => {}
            Some(
                Phase::Connecting { peer: back }
                | Phase::BannerConnecting { peer: back }
                | Phase::BannerConnected { peer: back },
            ) if back == id => return,
            _ => {
                self.break_pair(id, peer, now);
                return;
            }
        }

        let Some((conn, other)) = self.table.pair_mut(id, peer) else {
            return;
        };
        let mut failed = false;

        if ready.writable {
            if other.buffer.is_empty() {
                conn.interest.write = false;
            } else if let Some(stream) = conn.endpoint.stream_mut() {
                match other.buffer.flush_into(stream) {
                    Ok(Flush::Drained(n)) => {
                        conn.interest.write = false;
                        other.interest.read = true;
                        trace!(conn = %id, bytes = n, "Flushed");
                    }
                    Ok(Flush::Partial(n)) => {
                        conn.interest.write = true;
                        trace!(conn = %id, bytes = n, pending = other.buffer.len(), "Partial flush");
                    }
                    Err(e) => {
                        debug!(conn = %id, error = %e, "Write failed");
                        failed = true;
                    }
                }
            }
        }

        if !failed && ready.readable {
            if !conn.buffer.is_empty() {
                conn.interest.read = false;
                other.interest.write = true;
            } else if let Some(stream) = conn.endpoint.stream_mut() {
                match conn.buffer.fill_from(stream) {
                    Ok(0) => {
                        debug!(conn = %id, "Connection closed by remote");
                        failed = true;
                    }
                    Ok(n) => {
                        conn.interest.read = false;
                        other.interest.write = true;
                        match conn.role {
                            Role::Backend => self.stats.bytes_from_backends += n as u64,
                            _ => self.stats.bytes_from_clients += n as u64,
                        }
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                        ) => {}
                    Err(e) => {
                        debug!(conn = %id, error = %e, "Read failed");
                        failed = true;
                    }
                }
            }
        }

        conn.last_activity = now;
        other.last_activity = now;

        if failed {
            self.shutdown(peer, now);
            self.cleanup(id);
        }
    }

    fn hang_up(&mut self, id: ConnId, phase: Phase, now: Instant) {
        debug!(conn = %id, phase = phase.name(), "Hangup");
        if let Some(peer) = phase.peer() {
            if matches!(phase, Phase::Connected { .. }) {
                self.flush_best_effort(id, peer);
            }
            self.shutdown(peer, now);
        }
        self.cleanup(id);
    }

    fn flush_best_effort(&mut self, id: ConnId, peer: ConnId) {
        let Some((conn, other)) = self.table.pair_mut(id, peer) else {
            return;
        };
        if conn.buffer.is_empty() {
            return;
        }
        if let Some(stream) = other.endpoint.stream_mut() {
            if let Err(e) = conn.buffer.flush_into(stream) {
                trace!(conn = %id, error = %e, "Final flush failed");
            }
        }
        conn.buffer.clear();
    }

    fn evict(&mut self, id: ConnId, phase: Phase, now: Instant) {
        self.stats.evictions += 1;
        warn!(conn = %id, phase = phase.name(), "Buffered bytes stuck, tearing pair down");
        if let Some(peer) = phase.peer() {
            self.shutdown(peer, now);
        }
        self.cleanup(id);
    }

    /// Recover from a record whose partner is gone or no longer points back.
    fn break_pair(&mut self, id: ConnId, peer: ConnId, now: Instant) {
        warn!(conn = %id, peer = %peer, "Peer linkage broken");
        self.shutdown(peer, now);
        self.cleanup(id);
    }

    fn is_paired(&self, id: ConnId, peer: ConnId) -> bool {
        self.table.get(peer).and_then(|p| p.peer()) == Some(id)
    }

    /// Half-close a record and park it until it is reclaimed.
    fn shutdown(&mut self, id: ConnId, now: Instant) {
        let Some(conn) = self.table.get_mut(id) else {
            return;
        };
        if matches!(conn.phase, Phase::Closing | Phase::Accepting) {
            return;
        }
        if let Some(stream) = conn.stream() {
            if let Err(e) = stream.half_close() {
                trace!(conn = %id, error = %e, "Half-close failed");
            }
        }
        conn.phase = Phase::Closing;
        conn.buffer.clear();
        conn.interest = Interest::NONE;
        conn.ready = Readiness::default();
        conn.last_activity = now;
        self.stats.shutdowns += 1;
        debug!(conn = %id, "Connection shut down");
    }

    /// Release a record and close its handle.
    fn cleanup(&mut self, id: ConnId) {
        if id == self.listener {
            return;
        }
        if let Some(conn) = self.table.release(id) {
            self.stats.cleanups += 1;
            debug!(conn = %id, phase = conn.phase.name(), "Connection closed");
        }
    }

    fn reap_closing(&mut self, now: Instant) {
        let timeouts = self.config.timeouts;
        let heavy_load = self.heavy_load;
        let expired: Vec<ConnId> = self
            .table
            .iter()
            .filter(|(_, conn)| {
                conn.phase == Phase::Closing
                    && timeouts.check(
                        &conn.phase,
                        0,
                        now.saturating_duration_since(conn.last_activity),
                        heavy_load,
                    ) == Some(Expiry::Reclaim)
            })
            .map(|(id, _)| id)
            .collect();
        for id in expired {
            self.cleanup(id);
        }
    }

    fn count_protocol(&mut self, protocol: Protocol) {
        let counter = match protocol {
            Protocol::Ssh => &mut self.stats.detected_ssh,
            Protocol::Http => &mut self.stats.detected_http,
            Protocol::Tls => &mut self.stats.detected_tls,
            Protocol::Smtp => &mut self.stats.detected_smtp,
            Protocol::Unknown => &mut self.stats.detected_unknown,
        };
        *counter += 1;
    }
}

/// Interest of two relaying partners, derived from what each holds.
fn set_relay_interest<L, S>(a: &mut Connection<L, S>, b: &mut Connection<L, S>) {
    a.interest = Interest {
        read: a.buffer.is_empty(),
        write: !b.buffer.is_empty(),
    };
    b.interest = Interest {
        read: b.buffer.is_empty(),
        write: !a.buffer.is_empty(),
    };
}

/// Consume the first line a backend sends, if it is complete.
///
/// A full buffer of bytes without a line terminator is consumed as well; the
/// search continues with the next bytes.
fn consume_line<S: Stream + ?Sized>(stream: &mut S) -> io::Result<Greeting> {
    let mut line = [0u8; BUFFER_SIZE];
    let n = match stream.peek_into(&mut line) {
        Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
        Ok(n) => n,
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
        {
            return Ok(Greeting::Pending)
        }
        Err(e) => return Err(e),
    };

    match line[..n].iter().position(|&b| b == b'\n') {
        Some(end) => {
            stream.read_exact(&mut line[..=end])?;
            Ok(Greeting::Swallowed(end + 1))
        }
        None if n == line.len() => {
            stream.read_exact(&mut line)?;
            Ok(Greeting::Pending)
        }
        None => Ok(Greeting::Pending),
    }
}
