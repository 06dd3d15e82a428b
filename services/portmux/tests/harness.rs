//! Test harness for portmux integration tests.
//!
//! Two environments:
//! - [`Sim`]: a scripted in-memory network. The multiplexer runs turn by turn
//!   against a fake clock; every socket's inbound bytes, write budget, connect
//!   outcome and hangup state are set by the test, and every half-close and
//!   close is recorded in order.
//! - Loopback helpers: a real `Multiplexer<SystemNet>` on a thread with tokio
//!   backends behind it.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;

use portmux::proxy::{
    bind_listener, BackendPorts, ConnId, Multiplexer, MuxConfig, Network, Phase, PollEntry,
    Readiness, Source, Stream, SystemNet,
};

pub const LISTEN_ADDR: &str = "192.0.2.1:80";
pub const SSH_PORT: u16 = 22;
pub const HTTP_PORT: u16 = 8080;
pub const SMTP_PORT: u16 = 2525;

/// Half-close and close events, in the order the multiplexer issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Shutdown(RawFd),
    Close(RawFd),
}

/// State of one simulated socket, seen from the remote end.
#[derive(Debug, Default)]
pub struct Socket {
    /// Bytes the remote sent that the multiplexer has not read yet.
    pub inbound: VecDeque<u8>,
    /// Bytes the multiplexer wrote.
    pub received: Vec<u8>,
    /// The remote sent FIN.
    pub remote_closed: bool,
    /// Report hangup/error readiness.
    pub hangup: bool,
    /// Bytes the socket accepts before would-block; `None` is unlimited.
    pub write_budget: Option<usize>,
    /// Fail every write with this error.
    pub write_error: Option<io::ErrorKind>,
    pub connected: bool,
    pub connect_error: Option<io::ErrorKind>,
    pub shut_down: bool,
    /// Outbound target and bound source, for backend sockets.
    pub target: Option<SocketAddr>,
    pub source: Option<SocketAddr>,
    /// Destination the client dialed, for accepted sockets.
    pub local: Option<SocketAddr>,
}

#[derive(Debug, Default)]
pub struct World {
    pub sockets: HashMap<RawFd, Socket>,
    pub closed: Vec<(RawFd, Socket)>,
    pub journal: Vec<Event>,
    pub pending: VecDeque<(RawFd, SocketAddr)>,
    pub accept_errors: VecDeque<i32>,
    pub refuse_connects: bool,
    pub fail_next_connect: Option<io::ErrorKind>,
    /// Leave outbound connects in flight until `complete_connect`.
    pub manual_connect: bool,
    /// Backend handles in creation order.
    pub connects: Vec<RawFd>,
    pub listener: RawFd,
    free: BTreeSet<RawFd>,
    next_fd: RawFd,
}

impl World {
    /// Lowest free handle number, like the kernel.
    fn allocate(&mut self) -> RawFd {
        if let Some(fd) = self.free.pop_first() {
            return fd;
        }
        let fd = self.next_fd.max(3);
        self.next_fd = fd + 1;
        fd
    }
}

type Shared = Rc<RefCell<World>>;

pub struct SimListener {
    fd: RawFd,
}

impl Source for SimListener {
    fn handle(&self) -> RawFd {
        self.fd
    }
}

pub struct SimStream {
    fd: RawFd,
    world: Shared,
}

impl Source for SimStream {
    fn handle(&self) -> RawFd {
        self.fd
    }
}

impl Read for SimStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut world = self.world.borrow_mut();
        let socket = world
            .sockets
            .get_mut(&self.fd)
            .ok_or(io::ErrorKind::NotConnected)?;
        if socket.inbound.is_empty() {
            return if socket.remote_closed || socket.shut_down {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(socket.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(socket.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut world = self.world.borrow_mut();
        let socket = world
            .sockets
            .get_mut(&self.fd)
            .ok_or(io::ErrorKind::NotConnected)?;
        if let Some(kind) = socket.write_error {
            return Err(kind.into());
        }
        if socket.shut_down {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = socket.write_budget.map_or(buf.len(), |budget| budget.min(buf.len()));
        if n == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        socket.received.extend_from_slice(&buf[..n]);
        if let Some(budget) = socket.write_budget.as_mut() {
            *budget -= n;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Stream for SimStream {
    fn peek_into(&self, buf: &mut [u8]) -> io::Result<usize> {
        let world = self.world.borrow();
        let socket = world
            .sockets
            .get(&self.fd)
            .ok_or(io::ErrorKind::NotConnected)?;
        if socket.inbound.is_empty() {
            return if socket.remote_closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let mut n = 0;
        for (slot, byte) in buf.iter_mut().zip(socket.inbound.iter()) {
            *slot = *byte;
            n += 1;
        }
        Ok(n)
    }

    fn half_close(&self) -> io::Result<()> {
        let mut world = self.world.borrow_mut();
        world.journal.push(Event::Shutdown(self.fd));
        if let Some(socket) = world.sockets.get_mut(&self.fd) {
            socket.shut_down = true;
        }
        Ok(())
    }

    fn finish_connect(&self) -> io::Result<()> {
        let world = self.world.borrow();
        match world.sockets.get(&self.fd).and_then(|s| s.connect_error) {
            Some(kind) => Err(kind.into()),
            None => Ok(()),
        }
    }
}

impl Drop for SimStream {
    fn drop(&mut self) {
        let mut world = self.world.borrow_mut();
        if let Some(socket) = world.sockets.remove(&self.fd) {
            world.closed.push((self.fd, socket));
        }
        world.free.insert(self.fd);
        world.journal.push(Event::Close(self.fd));
    }
}

pub struct SimNet {
    world: Shared,
}

impl Network for SimNet {
    type Listener = SimListener;
    type Stream = SimStream;

    fn accept(&mut self, _listener: &SimListener) -> io::Result<(SimStream, SocketAddr)> {
        let mut world = self.world.borrow_mut();
        if let Some(errno) = world.accept_errors.pop_front() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let (fd, origin) = world
            .pending
            .pop_front()
            .ok_or(io::ErrorKind::WouldBlock)?;
        let stream = SimStream {
            fd,
            world: Rc::clone(&self.world),
        };
        Ok((stream, origin))
    }

    fn destination(&self, stream: &SimStream) -> io::Result<SocketAddr> {
        let world = self.world.borrow();
        world
            .sockets
            .get(&stream.fd)
            .and_then(|s| s.local)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }

    fn connect(&mut self, target: SocketAddr, source: Option<SocketAddr>) -> io::Result<SimStream> {
        let mut world = self.world.borrow_mut();
        if world.refuse_connects {
            return Err(io::ErrorKind::ConnectionRefused.into());
        }
        let fd = world.allocate();
        let connect_error = world.fail_next_connect.take();
        world.sockets.insert(
            fd,
            Socket {
                target: Some(target),
                source,
                connect_error,
                ..Default::default()
            },
        );
        world.connects.push(fd);
        Ok(SimStream {
            fd,
            world: Rc::clone(&self.world),
        })
    }

    fn wait(&mut self, entries: &mut [PollEntry], _timeout: Duration) -> io::Result<usize> {
        let mut world = self.world.borrow_mut();
        if !world.manual_connect {
            for socket in world.sockets.values_mut() {
                if socket.target.is_some() && socket.connect_error.is_none() {
                    socket.connected = true;
                }
            }
        }

        let listener_ready = !world.pending.is_empty() || !world.accept_errors.is_empty();
        let mut ready = 0;
        for entry in entries.iter_mut() {
            entry.ready = if entry.handle == world.listener {
                Readiness {
                    readable: entry.interest.read && listener_ready,
                    ..Default::default()
                }
            } else if let Some(socket) = world.sockets.get(&entry.handle) {
                let completed = socket.connected || socket.connect_error.is_some();
                Readiness {
                    readable: entry.interest.read
                        && (!socket.inbound.is_empty() || socket.remote_closed),
                    writable: entry.interest.write
                        && completed
                        && socket.write_budget != Some(0),
                    hangup: socket.hangup,
                }
            } else {
                Readiness {
                    hangup: true,
                    ..Default::default()
                }
            };
            if !entry.ready.is_empty() {
                ready += 1;
            }
        }
        Ok(ready)
    }
}

/// Multiplexer over the simulated network.
pub struct Sim {
    pub world: Shared,
    pub mux: Multiplexer<SimNet>,
    pub now: Instant,
}

pub fn sim_config() -> MuxConfig {
    MuxConfig::new(BackendPorts::new(SSH_PORT, HTTP_PORT, SMTP_PORT))
}

pub fn disguise_config() -> MuxConfig {
    let mut config = sim_config();
    config.disguise = true;
    config
}

impl Sim {
    pub fn new() -> Self {
        Self::with_config(sim_config())
    }

    pub fn with_config(config: MuxConfig) -> Self {
        Self::with_capacity(config, 1024)
    }

    pub fn with_capacity(config: MuxConfig, capacity: usize) -> Self {
        let world = Rc::new(RefCell::new(World::default()));
        let listener = {
            let mut world = world.borrow_mut();
            let fd = world.allocate();
            world.listener = fd;
            fd
        };
        let net = SimNet {
            world: Rc::clone(&world),
        };
        let mux = Multiplexer::new(config, net, SimListener { fd: listener }, capacity)
            .expect("create multiplexer");
        Self {
            world,
            mux,
            now: Instant::now(),
        }
    }

    /// Queue a client connection; it is accepted on the next turn.
    pub fn connect_client(&mut self, origin: &str) -> RawFd {
        let origin: SocketAddr = origin.parse().expect("origin address");
        let mut world = self.world.borrow_mut();
        let fd = world.allocate();
        world.sockets.insert(
            fd,
            Socket {
                connected: true,
                local: Some(LISTEN_ADDR.parse().expect("listen address")),
                ..Default::default()
            },
        );
        world.pending.push_back((fd, origin));
        fd
    }

    fn with_socket<R>(&self, fd: RawFd, f: impl FnOnce(&mut Socket) -> R) -> R {
        let mut world = self.world.borrow_mut();
        f(world.sockets.get_mut(&fd).expect("socket is open"))
    }

    /// The remote end of `fd` sends bytes.
    pub fn send(&self, fd: RawFd, data: &[u8]) {
        self.with_socket(fd, |s| s.inbound.extend(data.iter().copied()));
    }

    pub fn close_remote(&self, fd: RawFd) {
        self.with_socket(fd, |s| s.remote_closed = true);
    }

    pub fn hang_up(&self, fd: RawFd) {
        self.with_socket(fd, |s| s.hangup = true);
    }

    pub fn set_write_budget(&self, fd: RawFd, budget: Option<usize>) {
        self.with_socket(fd, |s| s.write_budget = budget);
    }

    pub fn set_write_error(&self, fd: RawFd, kind: io::ErrorKind) {
        self.with_socket(fd, |s| s.write_error = Some(kind));
    }

    pub fn complete_connect(&self, fd: RawFd) {
        self.with_socket(fd, |s| s.connected = true);
    }

    /// Everything the multiplexer wrote to `fd`, open or closed.
    pub fn received(&self, fd: RawFd) -> Vec<u8> {
        let world = self.world.borrow();
        if let Some(socket) = world.sockets.get(&fd) {
            return socket.received.clone();
        }
        world
            .closed
            .iter()
            .rev()
            .find(|(closed, _)| *closed == fd)
            .map(|(_, socket)| socket.received.clone())
            .unwrap_or_default()
    }

    pub fn is_open(&self, fd: RawFd) -> bool {
        self.world.borrow().sockets.contains_key(&fd)
    }

    pub fn is_shut_down(&self, fd: RawFd) -> bool {
        self.world
            .borrow()
            .sockets
            .get(&fd)
            .is_some_and(|s| s.shut_down)
    }

    pub fn journal(&self) -> Vec<Event> {
        self.world.borrow().journal.clone()
    }

    pub fn backends(&self) -> Vec<RawFd> {
        self.world.borrow().connects.clone()
    }

    pub fn last_backend(&self) -> RawFd {
        *self.backends().last().expect("a backend was connected")
    }

    /// Target and source of the backend socket `fd`.
    pub fn route_of(&self, fd: RawFd) -> (SocketAddr, Option<SocketAddr>) {
        let world = self.world.borrow();
        let socket = world
            .sockets
            .get(&fd)
            .or_else(|| {
                world
                    .closed
                    .iter()
                    .rev()
                    .find(|(closed, _)| *closed == fd)
                    .map(|(_, s)| s)
            })
            .expect("backend socket");
        (socket.target.expect("outbound socket"), socket.source)
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    /// One iteration, then the pairing invariant.
    pub fn turn(&mut self) {
        self.mux.turn_at(self.now).expect("multiplexer turn");
        self.assert_pairing();
    }

    /// Enough turns for every pending step to play out.
    pub fn settle(&mut self) {
        for _ in 0..8 {
            self.turn();
        }
    }

    pub fn conn(&self, fd: RawFd) -> Option<ConnId> {
        self.mux.table().lookup(fd)
    }

    pub fn phase(&self, fd: RawFd) -> Option<Phase> {
        let table = self.mux.table();
        table.get(table.lookup(fd)?).map(|c| c.phase())
    }

    pub fn buffered(&self, fd: RawFd) -> Vec<u8> {
        let table = self.mux.table();
        table
            .lookup(fd)
            .and_then(|id| table.get(id))
            .map(|c| c.buffered().to_vec())
            .unwrap_or_default()
    }

    /// Handle of the partner of `fd`.
    pub fn peer_of(&self, fd: RawFd) -> Option<RawFd> {
        let table = self.mux.table();
        let conn = table.get(table.lookup(fd)?)?;
        table.get(conn.peer()?).map(|p| p.handle())
    }

    /// Every paired record's partner resolves and points back.
    pub fn assert_pairing(&self) {
        let table = self.mux.table();
        for (id, conn) in table.iter() {
            let Some(peer) = conn.peer() else { continue };
            let partner = table
                .get(peer)
                .unwrap_or_else(|| panic!("{id} ({}) points at missing {peer}", conn.phase().name()));
            assert_eq!(
                partner.peer(),
                Some(id),
                "{id} ({}) -> {peer} ({}) is not mutual",
                conn.phase().name(),
                partner.phase().name()
            );
        }
    }

    /// Accept a client and drive it to a relaying pair with the first bytes
    /// it sends. Returns (client, backend).
    pub fn establish(&mut self, origin: &str, first_bytes: &[u8]) -> (RawFd, RawFd) {
        let client = self.connect_client(origin);
        self.turn();
        self.send(client, first_bytes);
        self.settle();
        let backend = self.last_backend();
        assert!(matches!(self.phase(client), Some(Phase::Connected { .. })));
        assert!(matches!(self.phase(backend), Some(Phase::Connected { .. })));
        (client, backend)
    }
}

/// Position of `event` in the journal.
pub fn position(journal: &[Event], event: Event) -> Option<usize> {
    journal.iter().position(|e| *e == event)
}

// ---------------------------------------------------------------------------
// Loopback
// ---------------------------------------------------------------------------

/// A tokio backend that writes a greeting on connect, then echoes.
pub struct GreetingBackend {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl GreetingBackend {
    pub async fn spawn(greeting: &'static [u8]) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        let Ok((mut stream, _)) = accept_result else { break };
                        tokio::spawn(async move {
                            if stream.write_all(greeting).await.is_err() {
                                return;
                            }
                            let (mut reader, mut writer) = stream.split();
                            let _ = tokio::io::copy(&mut reader, &mut writer).await;
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

impl Drop for GreetingBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Run a real multiplexer on a thread; returns its listening address.
pub fn spawn_mux(config: MuxConfig) -> SocketAddr {
    let listener = bind_listener("127.0.0.1:0".parse().expect("loopback address"))
        .expect("bind multiplexer listener");
    let addr = listener.local_addr().expect("listener address");
    std::thread::spawn(move || {
        let mut mux = Multiplexer::new(config, SystemNet::new(), listener, 1024)
            .expect("create multiplexer");
        while let Err(e) = mux.run() {
            if !e.is_recoverable() {
                break;
            }
        }
    });
    addr
}

/// Read until `needle` shows up or `limit` passes.
pub async fn read_until(
    stream: &mut TcpStream,
    needle: &[u8],
    limit: Duration,
) -> io::Result<Vec<u8>> {
    match timeout(limit, read_until_inner(stream, needle)).await {
        Ok(result) => result,
        Err(_) => Err(io::ErrorKind::TimedOut.into()),
    }
}

async fn read_until_inner(stream: &mut TcpStream, needle: &[u8]) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if buf.windows(needle.len()).any(|w| w == needle) {
            return Ok(buf);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
