//! User-namespace identity plumbing. The parent writes the child's id
//! maps through /proc; the child drops to the configured uid/gid right
//! before exec.

use std::fmt::Write as _;
use std::fs;

use anyhow::{bail, Context, Result};
use nix::unistd::{self, Gid, Pid, Uid};

use crate::core::config::{Config, IdMapping, User};
use crate::platform::linux::runtime;
use crate::util::log::diag;

/// Write the child's `uid_map`, `setgroups`, and `gid_map`, in that
/// order. Runs in the parent, against the child's /proc entry, before
/// the child is released to call setuid/setgid.
///
/// The setgroups write has to land before gid_map: an unprivileged
/// mapper may only write gid_map after setgroups says "deny".
pub fn apply_mappings(config: &Config, cpid: Pid) -> Result<()> {
    let Some(user) = config.user_namespace() else {
        return Ok(());
    };

    if let Some(mappings) = &user.uid_mappings {
        write_id_map(cpid, "uid_map", mappings)?;
    }
    if let Some(allow) = user.setgroups {
        write_setgroups(cpid, allow)?;
    }
    if let Some(mappings) = &user.gid_mappings {
        write_id_map(cpid, "gid_map", mappings)?;
    }
    Ok(())
}

/// Render an id-map table exactly as the kernel expects it: one
/// `<container> <host> <size>` line per mapping, in configuration order.
pub fn render_id_map(mappings: &[IdMapping]) -> String {
    let mut table = String::new();
    for mapping in mappings {
        let _ = writeln!(
            table,
            "{} {} {}",
            mapping.container_id, mapping.host_id, mapping.size
        );
    }
    table
}

fn write_id_map(cpid: Pid, filename: &str, mappings: &[IdMapping]) -> Result<()> {
    let path = format!("/proc/{cpid}/{filename}");
    if !runtime::container_alive() {
        bail!("container process exited before {filename} could be written");
    }
    let table = render_id_map(mappings);
    diag!("write '{}' to {path}", table.trim_end());
    // The whole table goes down in a single write: the kernel rejects
    // piecemeal updates from unprivileged mappers.
    fs::write(&path, table.as_bytes()).with_context(|| format!("failed to write {path}"))
}

fn write_setgroups(cpid: Pid, allow: bool) -> Result<()> {
    let path = format!("/proc/{cpid}/setgroups");
    if !runtime::container_alive() {
        bail!("container process exited before setgroups could be written");
    }
    let value = if allow { "allow" } else { "deny" };
    diag!("write '{value}' to {path}");
    fs::write(&path, value).with_context(|| format!("failed to write {path}"))
}

/// Apply the configured identity inside the child: gid first, then the
/// supplementary groups, then uid last so the process keeps the
/// privilege to perform the earlier two.
pub fn apply_identity(user: Option<&User>) -> Result<()> {
    let Some(user) = user else {
        return Ok(());
    };

    if let Some(gid) = user.gid {
        diag!("set GID to {gid}");
        unistd::setgid(Gid::from_raw(gid)).context("setgid failed")?;
    }
    if let Some(groups) = &user.additional_gids {
        diag!("set additional GIDs to {groups:?}");
        let gids: Vec<Gid> = groups.iter().copied().map(Gid::from_raw).collect();
        unistd::setgroups(&gids).context("setgroups failed")?;
    }
    if let Some(uid) = user.uid {
        diag!("set UID to {uid}");
        unistd::setuid(Uid::from_raw(uid)).context("setuid failed")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_map_renders_in_configuration_order() {
        let mappings = vec![
            IdMapping { container_id: 0, host_id: 1000, size: 1 },
            IdMapping { container_id: 1, host_id: 100000, size: 65536 },
        ];
        assert_eq!(render_id_map(&mappings), "0 1000 1\n1 100000 65536\n");
    }

    #[test]
    fn empty_id_map_renders_empty() {
        assert_eq!(render_id_map(&[]), "");
    }
}
