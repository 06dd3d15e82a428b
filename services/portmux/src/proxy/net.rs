//! Socket primitives behind the event loop.
//!
//! The dispatcher never touches the kernel directly; everything it needs
//! (accept, connect, original destination, readiness wait) goes through the
//! [`Network`] trait. [`SystemNet`] is the production implementation over
//! `std::net` sockets, `socket2` for socket options and `poll(2)`.

use std::fmt;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};

/// Backlog passed to `listen(2)`.
pub const LISTEN_BACKLOG: i32 = 1024;

/// Readiness the event loop asks for on a handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        read: false,
        write: false,
    };
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };
    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
    };
}

/// Readiness reported for a handle in one iteration.
///
/// `hangup` covers hangup, error and invalid-handle conditions; it is reported
/// whether or not any interest was registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        !(self.readable || self.writable || self.hangup)
    }
}

/// One slot of the poll set.
#[derive(Debug, Clone, Copy)]
pub struct PollEntry {
    pub handle: RawFd,
    pub interest: Interest,
    pub ready: Readiness,
}

impl PollEntry {
    pub fn new(handle: RawFd, interest: Interest) -> Self {
        Self {
            handle,
            interest,
            ready: Readiness::default(),
        }
    }
}

/// Anything that owns an OS handle.
pub trait Source {
    fn handle(&self) -> RawFd;
}

/// A connected (or connecting) byte stream.
pub trait Stream: Read + Write + Source {
    /// Copy pending bytes into `buf` without consuming them.
    fn peek_into(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Half-close both directions, keeping the handle open.
    fn half_close(&self) -> io::Result<()>;

    /// Check the outcome of a non-blocking connect once the stream turned
    /// writable, and set `TCP_NODELAY` on success.
    fn finish_connect(&self) -> io::Result<()>;
}

/// The kernel surface the dispatcher runs on.
pub trait Network {
    type Listener: Source;
    type Stream: Stream;

    /// Accept one pending connection. The returned stream is non-blocking.
    fn accept(&mut self, listener: &Self::Listener) -> io::Result<(Self::Stream, SocketAddr)>;

    /// Destination the client originally dialed.
    fn destination(&self, stream: &Self::Stream) -> io::Result<SocketAddr>;

    /// Start a non-blocking connect to `target`, bound to `source` when given.
    fn connect(&mut self, target: SocketAddr, source: Option<SocketAddr>)
        -> io::Result<Self::Stream>;

    /// Block until some entry is ready or `timeout` elapses, filling in each
    /// entry's `ready` field. Returns the number of ready entries.
    fn wait(&mut self, entries: &mut [PollEntry], timeout: Duration) -> io::Result<usize>;
}

/// Whether an accept failure means the process ran out of descriptors.
pub fn is_descriptor_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

/// Bind a non-blocking listener with `SO_REUSEADDR`.
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Production network over real sockets and `poll(2)`.
#[derive(Default)]
pub struct SystemNet {
    pollfds: Vec<libc::pollfd>,
}

impl SystemNet {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for SystemNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemNet")
            .field("poll_capacity", &self.pollfds.capacity())
            .finish()
    }
}

impl Network for SystemNet {
    type Listener = TcpListener;
    type Stream = TcpStream;

    fn accept(&mut self, listener: &TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, origin) = listener.accept()?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok((stream, origin))
    }

    fn destination(&self, stream: &TcpStream) -> io::Result<SocketAddr> {
        let local = stream.local_addr()?;
        // Only IPv4 NAT keeps an original destination to recover.
        if local.is_ipv4() {
            if let Some(original) = SockRef::from(stream)
                .original_dst()
                .ok()
                .and_then(|addr| addr.as_socket())
            {
                return Ok(original);
            }
        }
        Ok(local)
    }

    fn connect(&mut self, target: SocketAddr, source: Option<SocketAddr>) -> io::Result<TcpStream> {
        let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        if let Some(source) = source {
            set_transparent(&socket, source)?;
            socket.set_reuse_address(true)?;
            socket.bind(&source.into())?;
        }
        match socket.connect(&target.into()) {
            Ok(()) => {}
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
        Ok(socket.into())
    }

    fn wait(&mut self, entries: &mut [PollEntry], timeout: Duration) -> io::Result<usize> {
        self.pollfds.clear();
        self.pollfds.extend(entries.iter().map(|entry| libc::pollfd {
            fd: entry.handle,
            events: poll_events(entry.interest),
            revents: 0,
        }));

        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        // SAFETY: the pointer and length describe `self.pollfds`, which stays
        // alive and unaliased for the duration of the call.
        let rc = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        for (entry, pollfd) in entries.iter_mut().zip(&self.pollfds) {
            let revents = pollfd.revents;
            entry.ready = Readiness {
                readable: revents & libc::POLLIN != 0,
                writable: revents & libc::POLLOUT != 0,
                hangup: revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0,
            };
        }
        Ok(rc as usize)
    }
}

fn poll_events(interest: Interest) -> libc::c_short {
    let mut events = 0;
    if interest.read {
        events |= libc::POLLIN;
    }
    if interest.write {
        events |= libc::POLLOUT;
    }
    events
}

/// Allow binding to a non-local address.
fn set_transparent(socket: &Socket, source: SocketAddr) -> io::Result<()> {
    match source {
        SocketAddr::V4(_) => socket.set_ip_transparent(true),
        SocketAddr::V6(_) => {
            let on: libc::c_int = 1;
            // SAFETY: `on` outlives the call and the length matches its type.
            let rc = unsafe {
                libc::setsockopt(
                    socket.as_raw_fd(),
                    libc::SOL_IPV6,
                    libc::IPV6_TRANSPARENT,
                    &on as *const libc::c_int as *const libc::c_void,
                    mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }
    }
}

impl Source for TcpListener {
    fn handle(&self) -> RawFd {
        self.as_raw_fd()
    }
}

impl Source for TcpStream {
    fn handle(&self) -> RawFd {
        self.as_raw_fd()
    }
}

impl Stream for TcpStream {
    fn peek_into(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.peek(buf)
    }

    fn half_close(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }

    fn finish_connect(&self) -> io::Result<()> {
        if let Some(err) = self.take_error()? {
            return Err(err);
        }
        self.set_nodelay(true)
    }
}
