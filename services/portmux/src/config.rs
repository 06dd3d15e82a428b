//! Configuration for portmuxd.
//!
//! Every option can be given as a flag or through a `PORTMUX_*` environment
//! variable; flags win.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;

use crate::logging::LogFormat;
use crate::proxy::{
    BackendPorts, Banner, MuxConfig, TimeoutPolicy, DEFAULT_SMTP_BANNER, DEFAULT_SSH_BANNER,
};

/// Port that switches disguise mode on by itself.
pub const SMTP_PORT: u16 = 25;

/// Default descriptor limit requested at startup.
pub const DEFAULT_MAX_FDS: u64 = 65536;

/// portmuxd - serve SSH and HTTP(S) on one port
#[derive(Debug, Clone, Parser)]
#[command(name = "portmuxd", version, about, long_about = None)]
pub struct Config {
    /// Address to listen on [default: 0.0.0.0, or :: with --ipv6]
    #[arg(short = 'l', long, env = "PORTMUX_LISTEN_ADDR")]
    pub listen_addr: Option<IpAddr>,

    /// Port to listen on
    #[arg(short = 'L', long, env = "PORTMUX_LISTEN_PORT", default_value_t = 80)]
    pub listen_port: u16,

    /// SSH backend port
    #[arg(short = 'S', long, env = "PORTMUX_SSH_PORT", default_value_t = 22)]
    pub ssh_port: u16,

    /// Catch-all backend port (HTTP, TLS and anything unrecognized)
    #[arg(short = 'H', long, env = "PORTMUX_HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// SMTP backend port (disguise mode)
    #[arg(long, env = "PORTMUX_SMTP_PORT", default_value_t = 2525)]
    pub smtp_port: u16,

    /// Listen on IPv6
    #[arg(short = '6', long, env = "PORTMUX_IPV6")]
    pub ipv6: bool,

    /// Connect to backends from the client's address (needs CAP_NET_ADMIN)
    #[arg(short = 'T', long, env = "PORTMUX_TRANSPARENT")]
    pub transparent: bool,

    /// Worker processes, 0 for one per core
    #[arg(short = 'n', long, env = "PORTMUX_WORKERS", default_value_t = 0)]
    pub workers: usize,

    /// Greet clients with an SMTP banner and hide SSH behind it (implied on port 25)
    #[arg(long, env = "PORTMUX_DISGUISE")]
    pub disguise: bool,

    /// First line of the disguise banner
    #[arg(long, env = "PORTMUX_SMTP_BANNER", default_value = DEFAULT_SMTP_BANNER)]
    pub smtp_banner: String,

    /// Second line of the disguise banner; must match the SSH server's identification
    #[arg(long, env = "PORTMUX_SSH_BANNER", default_value = DEFAULT_SSH_BANNER)]
    pub ssh_banner: String,

    /// Switch to this user after binding
    #[arg(short = 'U', long, env = "PORTMUX_USER")]
    pub user: Option<String>,

    /// Chroot into this directory after binding
    #[arg(short = 'R', long, env = "PORTMUX_CHROOT")]
    pub chroot: Option<PathBuf>,

    /// Descriptor limit to request
    #[arg(long, env = "PORTMUX_MAX_FDS", default_value_t = DEFAULT_MAX_FDS)]
    pub max_fds: u64,

    /// Stay in the foreground
    #[arg(long, env = "PORTMUX_FOREGROUND")]
    pub foreground: bool,

    /// Log level, used when RUST_LOG is unset
    #[arg(long, env = "PORTMUX_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "PORTMUX_LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,
}

impl Config {
    /// Address the listener binds to.
    pub fn listen_socket_addr(&self) -> SocketAddr {
        let ip = self.listen_addr.unwrap_or(if self.ipv6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        });
        SocketAddr::new(ip, self.listen_port)
    }

    /// Whether clients get the disguise banner.
    pub fn disguise_enabled(&self) -> bool {
        self.disguise || self.listen_port == SMTP_PORT
    }

    /// Reject configurations the multiplexer cannot serve.
    pub fn validate(&self) -> Result<()> {
        if self.ssh_port == 0 || self.http_port == 0 {
            bail!("backend ports must be non-zero");
        }
        if self.ssh_port == self.http_port {
            bail!("SSH and catch-all backends share port {}", self.ssh_port);
        }
        if self.disguise_enabled() {
            if self.smtp_port == 0 {
                bail!("disguise mode needs a non-zero SMTP port");
            }
            if self.smtp_port == self.ssh_port {
                bail!("SSH and SMTP backends share port {}", self.ssh_port);
            }
        }
        for (name, banner) in [("SMTP", &self.smtp_banner), ("SSH", &self.ssh_banner)] {
            if banner.contains(['\r', '\n']) {
                bail!("{name} banner must be a single line");
            }
        }
        if !self.ssh_banner.starts_with("SSH-") {
            bail!("SSH banner must start with \"SSH-\", got {:?}", self.ssh_banner);
        }
        Ok(())
    }

    /// Multiplexer settings derived from this configuration.
    pub fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            backends: BackendPorts::new(self.ssh_port, self.http_port, self.smtp_port),
            disguise: self.disguise_enabled(),
            transparent: self.transparent,
            banner: Banner {
                smtp: self.smtp_banner.clone(),
                ssh: self.ssh_banner.clone(),
            },
            timeouts: TimeoutPolicy::default(),
        }
    }
}
