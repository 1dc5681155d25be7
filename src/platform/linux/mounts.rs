//! The mount plan: resolved in the parent against its working directory,
//! applied inside the child's mount namespace in list order.

use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd;

use crate::core::config::{Config, MountFlag};
use crate::core::error::{RuntimeError, MAX_PATH_BYTES};
use crate::util::log::diag;

/// Scratch directory template for the old root during a pivot.
const PIVOT_TEMPLATE: &str = "pivot-root.XXXXXX";

/// One resolved step of the plan, paths already absolute.
#[derive(Debug, Clone, PartialEq)]
pub enum MountStep {
    Mount {
        source: Option<PathBuf>,
        target: PathBuf,
        fstype: Option<String>,
        flags: MsFlags,
        data: Option<String>,
    },
    PivotRoot {
        new_root: PathBuf,
    },
}

#[derive(Debug, Default)]
pub struct MountPlan {
    steps: Vec<MountStep>,
}

impl MountPlan {
    /// Resolve the configured mount list against `cwd` (the parent's
    /// working directory captured at startup). Every path is
    /// absolutized and length-checked here, before the child exists.
    pub fn resolve(config: &Config, cwd: &Path) -> Result<MountPlan> {
        let mut steps = Vec::new();
        for (index, entry) in config.mounts().iter().enumerate() {
            let source = entry
                .source
                .as_deref()
                .map(|path| absolutize(path, cwd))
                .transpose()?;

            if entry.fstype.as_deref() == Some("pivot-root") {
                let new_root = source.ok_or(RuntimeError::MissingPivotSource(index))?;
                steps.push(MountStep::PivotRoot { new_root });
                continue;
            }

            let target = entry
                .target
                .as_deref()
                .ok_or(RuntimeError::MissingMountTarget(index))
                .map(|path| absolutize(path, cwd))??;

            steps.push(MountStep::Mount {
                source,
                target,
                fstype: entry.fstype.clone(),
                flags: ms_flags(&entry.flags),
                data: entry.data.clone(),
            });
        }
        Ok(MountPlan { steps })
    }

    pub fn steps(&self) -> &[MountStep] {
        &self.steps
    }

    /// Apply every step in order. Runs inside the child, after namespace
    /// joins and before the setup-complete handshake.
    pub fn apply(&self) -> Result<()> {
        for (index, step) in self.steps.iter().enumerate() {
            match step {
                MountStep::Mount {
                    source,
                    target,
                    fstype,
                    flags,
                    data,
                } => {
                    diag!(
                        "mount {index}: {source:?} to {} (type {fstype:?}, flags {flags:?}, data {data:?})",
                        target.display()
                    );
                    mount(
                        source.as_deref(),
                        target.as_path(),
                        fstype.as_deref(),
                        *flags,
                        data.as_deref(),
                    )
                    .with_context(|| {
                        format!("mount {index} onto {} failed", target.display())
                    })?;
                }
                MountStep::PivotRoot { new_root } => {
                    pivot_root(new_root)
                        .with_context(|| format!("pivot-root step {index} failed"))?;
                }
            }
        }
        Ok(())
    }
}

/// Make `path` absolute against `cwd` and enforce the path length cap.
fn absolutize(path: &str, cwd: &Path) -> Result<PathBuf, RuntimeError> {
    let full = if path.starts_with('/') {
        PathBuf::from(path)
    } else {
        cwd.join(path)
    };
    let length = full.as_os_str().as_bytes().len();
    if length >= MAX_PATH_BYTES {
        return Err(RuntimeError::PathTooLong {
            path: path.to_string(),
            length,
        });
    }
    Ok(full)
}

fn ms_flags(flags: &[MountFlag]) -> MsFlags {
    let mut mask = MsFlags::empty();
    for flag in flags {
        mask |= match flag {
            MountFlag::Bind => MsFlags::MS_BIND,
            MountFlag::Dirsync => MsFlags::MS_DIRSYNC,
            MountFlag::IVersion => MsFlags::MS_I_VERSION,
            MountFlag::Lazytime => MsFlags::MS_LAZYTIME,
            MountFlag::Mandlock => MsFlags::MS_MANDLOCK,
            MountFlag::Move => MsFlags::MS_MOVE,
            MountFlag::Noatime => MsFlags::MS_NOATIME,
            MountFlag::Nodev => MsFlags::MS_NODEV,
            MountFlag::Nodiratime => MsFlags::MS_NODIRATIME,
            MountFlag::Noexec => MsFlags::MS_NOEXEC,
            MountFlag::Nosuid => MsFlags::MS_NOSUID,
            MountFlag::Private => MsFlags::MS_PRIVATE,
            MountFlag::Rdonly => MsFlags::MS_RDONLY,
            MountFlag::Rec => MsFlags::MS_REC,
            MountFlag::Relatime => MsFlags::MS_RELATIME,
            MountFlag::Remount => MsFlags::MS_REMOUNT,
            MountFlag::Shared => MsFlags::MS_SHARED,
            // MS_SILENT superseded MS_VERBOSE; both names select the
            // same kernel bit.
            MountFlag::Silent | MountFlag::Verbose => MsFlags::MS_SILENT,
            MountFlag::Slave => MsFlags::MS_SLAVE,
            MountFlag::Strictatime => MsFlags::MS_STRICTATIME,
            // MS_SYNC is the historical spelling of MS_SYNCHRONOUS.
            MountFlag::Sync | MountFlag::Synchronous => MsFlags::MS_SYNCHRONOUS,
            MountFlag::Unbindable => MsFlags::MS_UNBINDABLE,
        };
    }
    mask
}

/// Swap the root filesystem for `new_root` and dispose of the old one.
///
/// The old root is parked in a fresh `pivot-root.XXXXXX` directory
/// inside the new root, lazily unmounted, and the directory removed
/// exactly once, whichever of the intermediate steps fail.
fn pivot_root(new_root: &Path) -> Result<()> {
    let template = new_root.join(PIVOT_TEMPLATE);
    if template.as_os_str().as_bytes().len() >= MAX_PATH_BYTES {
        return Err(RuntimeError::PathTooLong {
            path: template.display().to_string(),
            length: template.as_os_str().as_bytes().len(),
        }
        .into());
    }

    let put_old = unistd::mkdtemp(&template).with_context(|| {
        format!("failed to create old-root scratch directory in {}", new_root.display())
    })?;

    if let Err(err) = unistd::chdir(new_root) {
        let _ = fs::remove_dir(&put_old);
        return Err(err).with_context(|| format!("chdir {} failed", new_root.display()));
    }

    diag!("pivot root to {}", new_root.display());
    if let Err(err) = unistd::pivot_root(new_root, &put_old) {
        let _ = fs::remove_dir(&put_old);
        return Err(err).with_context(|| {
            format!("pivot_root({}, {}) failed", new_root.display(), put_old.display())
        });
    }

    // The old root now lives under the new root at the scratch
    // directory's basename.
    let old_root = Path::new("/").join(
        put_old
            .file_name()
            .context("old-root scratch directory has no name")?,
    );

    let moved = unistd::chdir("/").context("chdir / after pivot_root");
    let detached = if moved.is_ok() {
        diag!("unmount old root from {}", old_root.display());
        umount2(&old_root, MntFlags::MNT_DETACH)
            .with_context(|| format!("failed to detach old root at {}", old_root.display()))
    } else {
        Ok(())
    };
    // Remove the scratch directory exactly once, even when the unmount
    // before it failed.
    let removed = fs::remove_dir(&old_root)
        .with_context(|| format!("failed to remove {}", old_root.display()));

    moved?;
    detached?;
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;

    fn plan_for(json: &str, cwd: &str) -> Result<MountPlan> {
        let config = Config::from_inline(json).unwrap();
        MountPlan::resolve(&config, Path::new(cwd))
    }

    #[test]
    fn empty_config_yields_an_empty_plan() {
        let plan = plan_for(r#"{"version":"0.2.0"}"#, "/work").unwrap();
        assert!(plan.steps().is_empty());
    }

    #[test]
    fn relative_paths_resolve_against_the_captured_cwd() {
        let plan = plan_for(
            r#"{"version":"0.2.0","namespaces":{"mount":{"mounts":[
                {"source":"rootfs","target":"mnt","flags":["MS_BIND"]}
            ]}}}"#,
            "/work",
        )
        .unwrap();

        match &plan.steps()[0] {
            MountStep::Mount { source, target, flags, .. } => {
                assert_eq!(source.as_deref(), Some(Path::new("/work/rootfs")));
                assert_eq!(target, Path::new("/work/mnt"));
                assert_eq!(*flags, MsFlags::MS_BIND);
            }
            other => panic!("expected a mount step, got {other:?}"),
        }
    }

    #[test]
    fn absolute_paths_pass_through() {
        let plan = plan_for(
            r#"{"version":"0.2.0","namespaces":{"mount":{"mounts":[
                {"source":"proc","target":"/proc","type":"proc"}
            ]}}}"#,
            "/work",
        )
        .unwrap();

        match &plan.steps()[0] {
            MountStep::Mount { source, target, fstype, .. } => {
                assert_eq!(source.as_deref(), Some(Path::new("/work/proc")));
                assert_eq!(target, Path::new("/proc"));
                assert_eq!(fstype.as_deref(), Some("proc"));
            }
            other => panic!("expected a mount step, got {other:?}"),
        }
    }

    #[test]
    fn pivot_root_type_becomes_a_pivot_step() {
        let plan = plan_for(
            r#"{"version":"0.2.0","namespaces":{"mount":{"mounts":[
                {"source":"/tmp/newroot","type":"pivot-root"}
            ]}}}"#,
            "/work",
        )
        .unwrap();

        assert_eq!(
            plan.steps()[0],
            MountStep::PivotRoot { new_root: PathBuf::from("/tmp/newroot") }
        );
    }

    #[test]
    fn pivot_root_without_source_is_rejected() {
        let err = plan_for(
            r#"{"version":"0.2.0","namespaces":{"mount":{"mounts":[
                {"type":"pivot-root"}
            ]}}}"#,
            "/work",
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RuntimeError>(),
            Some(RuntimeError::MissingPivotSource(0))
        ));
    }

    #[test]
    fn mount_without_target_is_rejected() {
        let err = plan_for(
            r#"{"version":"0.2.0","namespaces":{"mount":{"mounts":[
                {"source":"/a"}
            ]}}}"#,
            "/work",
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RuntimeError>(),
            Some(RuntimeError::MissingMountTarget(0))
        ));
    }

    #[test]
    fn path_length_boundary_sits_at_1024_bytes() {
        // 1023 bytes: "/" plus 1022 'a's.
        let just_fits = format!("/{}", "a".repeat(MAX_PATH_BYTES - 2));
        assert!(absolutize(&just_fits, Path::new("/")).is_ok());

        let too_long = format!("/{}", "a".repeat(MAX_PATH_BYTES - 1));
        let err = absolutize(&too_long, Path::new("/")).unwrap_err();
        assert!(matches!(err, RuntimeError::PathTooLong { length, .. } if length == MAX_PATH_BYTES));
    }

    #[test]
    fn flag_names_map_onto_kernel_bits() {
        assert_eq!(
            ms_flags(&[MountFlag::Bind, MountFlag::Rec]),
            MsFlags::MS_BIND | MsFlags::MS_REC
        );
        assert_eq!(ms_flags(&[MountFlag::Sync]), MsFlags::MS_SYNCHRONOUS);
        assert_eq!(ms_flags(&[MountFlag::Verbose]), MsFlags::MS_SILENT);
        assert_eq!(ms_flags(&[]), MsFlags::empty());
    }
}
