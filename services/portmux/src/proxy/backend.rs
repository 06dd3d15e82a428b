//! Backend selection.
//!
//! Backends live on the host the client originally dialed (normally this
//! machine); only the port differs per protocol.

use std::net::SocketAddr;

use super::sniff::{Protocol, SniffResult};

/// Backend ports per detected protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendPorts {
    /// SSH daemon.
    pub ssh: u16,
    /// HTTP, TLS and anything unrecognized.
    pub catch_all: u16,
    /// Real SMTP server behind the disguise banner.
    pub smtp: u16,
}

impl BackendPorts {
    pub fn new(ssh: u16, catch_all: u16, smtp: u16) -> Self {
        Self {
            ssh,
            catch_all,
            smtp,
        }
    }

    /// Port for a protocol.
    pub fn port_for_protocol(&self, protocol: Protocol) -> u16 {
        match protocol {
            Protocol::Ssh => self.ssh,
            Protocol::Smtp => self.smtp,
            Protocol::Http | Protocol::Tls | Protocol::Unknown => self.catch_all,
        }
    }

    /// Port for a sniff result, `None` when the connection cannot be routed.
    ///
    /// A client that has not spoken yet goes to SSH, whose servers talk
    /// first. Slow clients of other protocols are misrouted by this.
    pub fn port_for(&self, result: &SniffResult) -> Option<u16> {
        match result {
            SniffResult::Detected(protocol) => Some(self.port_for_protocol(*protocol)),
            SniffResult::NoData => Some(self.ssh),
            SniffResult::Closed | SniffResult::IoError(_) => None,
        }
    }

    /// Outbound target: the original destination with the backend port.
    pub fn target(&self, destination: SocketAddr, port: u16) -> SocketAddr {
        let mut target = destination;
        target.set_port(port);
        target
    }
}

impl Default for BackendPorts {
    fn default() -> Self {
        Self::new(22, 8080, 2525)
    }
}
