//! Protocol-multiplexing TCP proxy.
//!
//! This module provides:
//! - Protocol detection by peeking at a client's first bytes
//! - Backend selection by detected protocol
//! - A generational connection table
//! - The readiness-driven event loop and per-connection state machine
//! - Fixed-size relay buffers with partial-write handling
//! - Phase deadlines and the shutdown/cleanup discipline
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Deciding --peek/sniff--> Connected <--relay--> Connected <- Backend
//!                          |                         ^
//!                          | (disguise)              | greeting line swallowed
//!                          v                         |
//!                      BannerSent --"SSH"/other--> BannerConnecting -> BannerConnected
//!
//! Shutdown(x): half-close, Closing, handle kept    Cleanup(x): slot released, handle closed
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use portmux::proxy::{bind_listener, BackendPorts, Multiplexer, MuxConfig, SystemNet};
//!
//! let listener = bind_listener("0.0.0.0:443".parse()?)?;
//! let config = MuxConfig::new(BackendPorts::new(22, 8443, 2525));
//! let mut mux = Multiplexer::new(config, SystemNet::new(), listener, 65536)?;
//! mux.run()?;
//! ```

mod backend;
mod connection;
mod dispatcher;
mod net;
mod relay;
mod sniff;
mod table;
mod timeout;

pub use backend::BackendPorts;
pub use connection::{Connection, Endpoint, Phase, Role};
pub use dispatcher::{
    Banner, Multiplexer, MuxConfig, MuxStats, DEFAULT_SMTP_BANNER, DEFAULT_SSH_BANNER,
    POLL_TIMEOUT,
};
pub use net::{
    bind_listener, is_descriptor_exhaustion, Interest, Network, PollEntry, Readiness, Source,
    Stream, SystemNet,
};
pub use relay::{Flush, RelayBuffer, BUFFER_SIZE};
pub use sniff::{detect, detect_disguised, sniff, Protocol, SniffResult, PEEK_LIMIT};
pub use table::{ConnId, ConnectionTable};
pub use timeout::{Expiry, TimeoutPolicy};
