//! portmuxd
//!
//! Protocol-multiplexing TCP proxy.
//!
//! This service:
//! - Accepts TCP connections on one port
//! - Peeks at each client's first bytes to tell SSH from HTTP/TLS
//! - Relays each client to the matching local backend
//! - Optionally preserves client source addresses (transparent mode)
//! - Optionally hides SSH behind an SMTP greeting (disguise mode)

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::{chdir, fork, setsid, ForkResult};
use tracing::{error, info};

use portmux::config::Config;
use portmux::scaler;
use portmux::{bind_listener, limits, logging, privilege, Multiplexer, SystemNet};

fn main() -> ExitCode {
    let config = Config::parse();

    if let Err(e) = logging::init(&config.log_level, config.log_format) {
        eprintln!("portmuxd: failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let message = format!("{e:#}");
            error!(error = %message, "portmuxd exiting");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> Result<()> {
    config.validate().context("invalid configuration")?;
    let listen_addr = config.listen_socket_addr();
    let mux_config = config.mux_config();

    info!("Starting portmuxd");
    info!(
        listen_addr = %listen_addr,
        ssh_port = config.ssh_port,
        http_port = config.http_port,
        smtp_port = config.smtp_port,
        disguise = mux_config.disguise,
        transparent = config.transparent,
        workers = config.workers,
        "Configuration loaded"
    );

    let capacity =
        limits::raise_descriptor_limit(config.max_fds).context("failed to read descriptor limit")?;
    let listener =
        bind_listener(listen_addr).with_context(|| format!("failed to bind {listen_addr}"))?;
    info!(bind_addr = %listen_addr, "Listener bound");

    ignore_signals()?;
    let role = scaler::scale_out(config.workers).context("failed to start workers")?;
    privilege::drop_privileges(
        config.chroot.as_deref(),
        config.user.as_deref(),
        config.transparent,
    )
    .context("failed to drop privileges")?;

    if role.is_master() && !config.foreground {
        daemonize().context("failed to daemonize")?;
    }

    let mut mux = Multiplexer::new(mux_config, SystemNet::new(), listener, capacity)
        .context("failed to create multiplexer")?;
    info!(role = ?role, "Worker running");

    loop {
        match mux.run() {
            Ok(()) => return Ok(()),
            Err(e) if e.is_recoverable() => {
                error!(
                    error = %e,
                    reason = e.reason_code(),
                    stats = ?mux.stats(),
                    "Multiplexer error, resuming"
                );
            }
            Err(e) => {
                error!(reason = e.reason_code(), stats = ?mux.stats(), "Multiplexer stopped");
                return Err(e).context("event loop failed");
            }
        }
    }
}

/// Signals a long-running daemon should not die from.
fn ignore_signals() -> Result<()> {
    for sig in [Signal::SIGHUP, Signal::SIGURG] {
        // SAFETY: installing SIG_IGN does not run any handler code.
        unsafe { signal(sig, SigHandler::SigIgn) }
            .with_context(|| format!("failed to ignore {sig}"))?;
    }
    Ok(())
}

/// Detach from the controlling terminal; the parent exits.
fn daemonize() -> Result<()> {
    // SAFETY: no threads have been spawned yet.
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {
            setsid()?;
            chdir("/")?;
            Ok(())
        }
    }
}
