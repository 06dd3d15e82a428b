//! Horizontal scaling across cores.
//!
//! The listener is bound before scaling, so every forked worker inherits it
//! and the kernel spreads incoming connections over the workers' accepts.
//! Each process is pinned to its own core.

use std::thread;

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, info};

use crate::error::MuxError;

/// What this process became after scaling out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// The original process, pinned to core 0.
    Master,
    /// A forked worker pinned to `core`.
    Worker { core: usize },
}

impl ProcessRole {
    pub fn is_master(&self) -> bool {
        matches!(self, ProcessRole::Master)
    }
}

/// Logical cores available to this process.
pub fn available_cores() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

/// Effective worker count: `0`, or more than there are cores, means one per
/// core.
pub fn resolve_workers(requested: usize, cores: usize) -> usize {
    let cores = cores.max(1);
    if requested == 0 || requested > cores {
        cores
    } else {
        requested
    }
}

/// Fork workers and pin every process to a core.
///
/// Returns in every process: the original one gets [`ProcessRole::Master`], each
/// child gets [`ProcessRole::Worker`]. With a single worker nothing is forked or
/// pinned.
pub fn scale_out(requested: usize) -> Result<ProcessRole, MuxError> {
    let cores = available_cores();
    let workers = resolve_workers(requested, cores);
    if workers == 1 {
        return Ok(ProcessRole::Master);
    }

    pin_to_core(0)?;
    for core in 1..workers {
        // SAFETY: called before any thread is spawned; the child only pins
        // itself and returns into the same single-threaded startup path.
        match unsafe { fork() }.map_err(MuxError::Fork)? {
            ForkResult::Parent { child } => {
                debug!(pid = child.as_raw(), core, "Forked worker");
            }
            ForkResult::Child => {
                pin_to_core(core)?;
                return Ok(ProcessRole::Worker { core });
            }
        }
    }

    info!(workers, cores, "Workers started");
    Ok(ProcessRole::Master)
}

fn pin_to_core(core: usize) -> Result<(), MuxError> {
    let mut set = CpuSet::new();
    set.set(core)
        .and_then(|()| sched_setaffinity(Pid::from_raw(0), &set))
        .map_err(|source| MuxError::Affinity { core, source })
}
