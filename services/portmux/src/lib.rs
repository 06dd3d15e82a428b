pub mod config;
pub mod error;
pub mod limits;
pub mod logging;
pub mod privilege;
pub mod proxy;
pub mod scaler;

pub use error::MuxError;
pub use proxy::{
    bind_listener, BackendPorts, Banner, ConnId, Multiplexer, MuxConfig, MuxStats, Network, Phase,
    Protocol, SniffResult, SystemNet, TimeoutPolicy,
};
