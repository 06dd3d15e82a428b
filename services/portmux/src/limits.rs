//! Descriptor limit.

use nix::sys::resource::{getrlimit, setrlimit, Resource};
use tracing::{info, warn};

use crate::error::MuxError;

/// Raise `RLIMIT_NOFILE` to `target` and return the resulting soft limit.
///
/// When the hard limit cannot be raised, the soft limit is lifted to the
/// existing hard limit instead. The result sizes the connection table.
pub fn raise_descriptor_limit(target: u64) -> Result<usize, MuxError> {
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE)?;

    if soft < target {
        if let Err(e) = setrlimit(Resource::RLIMIT_NOFILE, target, target.max(hard)) {
            warn!(
                error = %e,
                target,
                hard,
                "Cannot raise descriptor limit, using hard limit"
            );
            if soft < hard {
                setrlimit(Resource::RLIMIT_NOFILE, hard, hard)?;
            }
        }
    }

    let (soft, _) = getrlimit(Resource::RLIMIT_NOFILE)?;
    info!(limit = soft, "Descriptor limit");
    Ok(usize::try_from(soft).unwrap_or(usize::MAX))
}
