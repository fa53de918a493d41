#![forbid(unsafe_code)]

//! Process and filesystem guards used by the tubevault binaries.

use anyhow::{Context, Result, bail};
use nix::unistd::Uid;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Fails fast when a binary is started as root. The scheduled run and the API
/// both write into the NAS tree, which must stay owned by the service account.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; use the dedicated tubevault service account");
    }
    Ok(())
}

/// Creates the data directory that holds the stores and restricts it to the
/// owning user. Subscription and settings files are admin-only state.
pub fn ensure_private_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("creating {}", path.display()))?;
    #[cfg(unix)]
    {
        let mut perms = fs::metadata(path)
            .with_context(|| format!("reading permissions of {}", path.display()))?
            .permissions();
        if perms.mode() & 0o077 != 0 {
            perms.set_mode(0o700);
            fs::set_permissions(path, perms)
                .with_context(|| format!("restricting {}", path.display()))?;
        }
    }
    Ok(())
}
