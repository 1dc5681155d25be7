use std::fs::File;
use std::os::fd::AsFd;
use std::path::PathBuf;

use anyhow::{Context, Result};
use nix::sched::{self, CloneFlags};

use crate::core::config::Namespaces;
use crate::util::log::diag;

/// A namespace kind the kernel can create or join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceKind {
    Mount,
    Uts,
    Ipc,
    Net,
    Pid,
    User,
}

impl NamespaceKind {
    pub fn clone_flag(self) -> CloneFlags {
        match self {
            NamespaceKind::Mount => CloneFlags::CLONE_NEWNS,
            NamespaceKind::Uts => CloneFlags::CLONE_NEWUTS,
            NamespaceKind::Ipc => CloneFlags::CLONE_NEWIPC,
            NamespaceKind::Net => CloneFlags::CLONE_NEWNET,
            NamespaceKind::Pid => CloneFlags::CLONE_NEWPID,
            NamespaceKind::User => CloneFlags::CLONE_NEWUSER,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            NamespaceKind::Mount => "mount",
            NamespaceKind::Uts => "uts",
            NamespaceKind::Ipc => "ipc",
            NamespaceKind::Net => "net",
            NamespaceKind::Pid => "pid",
            NamespaceKind::User => "user",
        }
    }
}

/// The configured namespaces, partitioned into the set to create at
/// clone time and the list to join by `setns` inside the child.
#[derive(Debug)]
pub struct NamespaceSelection {
    pub create_mask: CloneFlags,
    pub join_list: Vec<(NamespaceKind, PathBuf)>,
}

impl NamespaceSelection {
    /// Partition the `namespaces` section: an entry with a `path` joins
    /// the namespace behind it, an entry without one asks for a fresh
    /// namespace in the clone mask.
    pub fn from_config(namespaces: Option<&Namespaces>) -> NamespaceSelection {
        let mut selection = NamespaceSelection {
            create_mask: CloneFlags::empty(),
            join_list: Vec::new(),
        };
        let Some(ns) = namespaces else {
            return selection;
        };

        let entries = [
            (NamespaceKind::Mount, ns.mount.as_ref()),
            (NamespaceKind::Uts, ns.uts.as_ref()),
            (NamespaceKind::Ipc, ns.ipc.as_ref()),
            (NamespaceKind::Net, ns.net.as_ref()),
            (NamespaceKind::Pid, ns.pid.as_ref()),
            (NamespaceKind::User, ns.user.as_ref()),
        ];
        for (kind, entry) in entries {
            let Some(entry) = entry else { continue };
            match &entry.path {
                Some(path) => selection.join_list.push((kind, path.clone())),
                None => selection.create_mask |= kind.clone_flag(),
            }
        }
        selection
    }

    /// Join every namespace in the list. Runs in the child, before the
    /// mount plan. Each namespace fd is closed as soon as it has been
    /// entered.
    pub fn join_all(&self) -> Result<()> {
        for (kind, path) in &self.join_list {
            diag!("join {} namespace at {}", kind.label(), path.display());
            let file = File::open(path).with_context(|| {
                format!(
                    "failed to open {} namespace at {}",
                    kind.label(),
                    path.display()
                )
            })?;
            sched::setns(file.as_fd(), kind.clone_flag()).with_context(|| {
                format!(
                    "failed to join {} namespace at {}",
                    kind.label(),
                    path.display()
                )
            })?;
        }
        Ok(())
    }
}
