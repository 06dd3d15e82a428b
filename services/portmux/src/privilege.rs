//! Privilege dropping after the listener is bound.

use std::path::Path;

use nix::unistd::{chdir, chroot, setgid, setgroups, setuid, User};
use tracing::{info, warn};

use crate::error::MuxError;

/// Optionally chroot and switch to an unprivileged user.
///
/// The user is looked up before the chroot, since the password database is
/// usually not reachable from inside it.
pub fn drop_privileges(
    root: Option<&Path>,
    user: Option<&str>,
    transparent: bool,
) -> Result<(), MuxError> {
    let account = match user {
        Some(name) => Some(
            User::from_name(name)?
                .ok_or_else(|| MuxError::Privilege(format!("unknown user {name:?}")))?,
        ),
        None => None,
    };

    if let Some(root) = root {
        chroot(root)
            .map_err(|e| MuxError::Privilege(format!("chroot {}: {e}", root.display())))?;
        chdir("/")?;
        info!(root = %root.display(), "Changed root");
    }

    if let Some(account) = account {
        if transparent {
            warn!(
                user = %account.name,
                "Transparent mode needs CAP_NET_ADMIN, which the user switch drops"
            );
        }
        setgroups(&[account.gid])?;
        setgid(account.gid)?;
        setuid(account.uid)?;
        info!(user = %account.name, uid = account.uid.as_raw(), "Dropped privileges");
    }
    Ok(())
}
