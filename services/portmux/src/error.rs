//! Error types for the multiplexer and its bootstrap.

use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

use crate::proxy::ConnId;

/// Multiplexer errors with standardized reason codes.
///
/// Per-connection failures never show up here: they are handled inside the
/// dispatcher by shutting down and cleaning up the affected pair. What reaches
/// the caller is either resource exhaustion (recoverable, the loop can be
/// re-entered with its state intact) or something that ends the worker.
#[derive(Debug, Error)]
pub enum MuxError {
    /// No free slot left in the connection table.
    #[error("table_full: all {capacity} connection slots in use")]
    TableFull { capacity: usize },

    /// A new handle collides with one still owned by a live record.
    #[error("handle_aliased: handle {handle} still owned by connection {owner}")]
    HandleAliased { handle: RawFd, owner: ConnId },

    /// The readiness wait failed for a reason other than an interrupt.
    #[error("poll_failed: {0}")]
    Poll(#[source] io::Error),

    /// Pinning a process to a core failed.
    #[error("affinity_failed: core {core}: {source}")]
    Affinity {
        core: usize,
        #[source]
        source: nix::Error,
    },

    /// Forking a worker failed.
    #[error("fork_failed: {0}")]
    Fork(#[source] nix::Error),

    /// Chroot or user switch failed.
    #[error("privilege_drop_failed: {0}")]
    Privilege(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// System call error.
    #[error("syscall error: {0}")]
    Syscall(#[from] nix::Error),
}

impl MuxError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            MuxError::TableFull { .. } => "table_full",
            MuxError::HandleAliased { .. } => "handle_aliased",
            MuxError::Poll(_) => "poll_failed",
            MuxError::Affinity { .. } => "affinity_failed",
            MuxError::Fork(_) => "fork_failed",
            MuxError::Privilege(_) => "privilege_drop_failed",
            MuxError::Io(_) => "io_error",
            MuxError::Syscall(_) => "syscall_error",
        }
    }

    /// Whether the event loop may be re-entered after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MuxError::TableFull { .. } | MuxError::HandleAliased { .. }
        )
    }
}
