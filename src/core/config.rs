use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::error::RuntimeError;

/// Configuration versions this runtime accepts. The match is exact; a
/// pre-release suffix does not count as a supported version.
const SUPPORTED_VERSIONS: &[&str] = &["0.1.0", "0.2.0"];

/// The decoded configuration tree. Immutable for the whole run.
///
/// Unrecognized top-level keys are ignored: beyond the version gate,
/// schema validation is someone else's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<Namespaces>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Hooks>,
}

/// The six namespace kinds the kernel (and this runtime) knows about.
/// Any other key under `namespaces` is a configuration error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Namespaces {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount: Option<NamespaceEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uts: Option<NamespaceEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipc: Option<NamespaceEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net: Option<NamespaceEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<NamespaceEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<NamespaceEntry>,
}

/// One `namespaces` entry. A `path` means "join the namespace behind this
/// file"; no `path` means "create a fresh one at clone time". The mapping
/// fields only make sense on `user`, `mounts` only on `mount`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamespaceEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(rename = "uidMappings", skip_serializing_if = "Option::is_none")]
    pub uid_mappings: Option<Vec<IdMapping>>,
    #[serde(rename = "gidMappings", skip_serializing_if = "Option::is_none")]
    pub gid_mappings: Option<Vec<IdMapping>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setgroups: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mounts: Option<Vec<MountEntry>>,
}

/// A single id-map line: container id, host id, range length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    #[serde(rename = "containerID")]
    pub container_id: u32,
    #[serde(rename = "hostID")]
    pub host_id: u32,
    pub size: u32,
}

/// One mount operation, applied in the child in list order. The
/// pseudo-type `pivot-root` turns the entry into a root pivot instead of
/// a mount(2) call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub fstype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<MountFlag>,
}

/// The closed set of recognized mount flag names. Decoding an unknown
/// name fails the whole configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountFlag {
    #[serde(rename = "MS_BIND")]
    Bind,
    #[serde(rename = "MS_DIRSYNC")]
    Dirsync,
    #[serde(rename = "MS_I_VERSION")]
    IVersion,
    #[serde(rename = "MS_LAZYTIME")]
    Lazytime,
    #[serde(rename = "MS_MANDLOCK")]
    Mandlock,
    #[serde(rename = "MS_MOVE")]
    Move,
    #[serde(rename = "MS_NOATIME")]
    Noatime,
    #[serde(rename = "MS_NODEV")]
    Nodev,
    #[serde(rename = "MS_NODIRATIME")]
    Nodiratime,
    #[serde(rename = "MS_NOEXEC")]
    Noexec,
    #[serde(rename = "MS_NOSUID")]
    Nosuid,
    #[serde(rename = "MS_PRIVATE")]
    Private,
    #[serde(rename = "MS_RDONLY")]
    Rdonly,
    #[serde(rename = "MS_REC")]
    Rec,
    #[serde(rename = "MS_RELATIME")]
    Relatime,
    #[serde(rename = "MS_REMOUNT")]
    Remount,
    #[serde(rename = "MS_SHARED")]
    Shared,
    #[serde(rename = "MS_SILENT")]
    Silent,
    #[serde(rename = "MS_SLAVE")]
    Slave,
    #[serde(rename = "MS_STRICTATIME")]
    Strictatime,
    #[serde(rename = "MS_SYNC")]
    Sync,
    #[serde(rename = "MS_SYNCHRONOUS")]
    Synchronous,
    #[serde(rename = "MS_UNBINDABLE")]
    Unbindable,
    #[serde(rename = "MS_VERBOSE")]
    Verbose,
}

/// What to execute and as whom: the process description plus the
/// identity and capability whitelist applied right before exec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    #[serde(flatten)]
    pub descriptor: ProcessDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
}

/// A runnable process: shared between the container target process and
/// lifecycle hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Resolve the executable on the host side, before any mount changes,
    /// and exec it through the held fd.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub host: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(rename = "additionalGids", skip_serializing_if = "Option::is_none")]
    pub additional_gids: Option<Vec<u32>>,
}

/// The recognized lifecycle hook lists. Other keys under `hooks` are
/// ignored; hooks are looked up by name, never enumerated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(rename = "pre-start", default, skip_serializing_if = "Vec::is_empty")]
    pub pre_start: Vec<ProcessDescriptor>,
    #[serde(rename = "post-stop", default, skip_serializing_if = "Vec::is_empty")]
    pub post_stop: Vec<ProcessDescriptor>,
}

impl Config {
    /// Load and validate a configuration from a file. Errors name the
    /// path they came from.
    pub fn from_file(path: &Path) -> Result<Config> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration passed inline on the command
    /// line (`-s`). Errors name the input kind, not a file.
    pub fn from_inline(json: &str) -> Result<Config> {
        let config: Config =
            serde_json::from_str(json).context("failed to parse inline configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !SUPPORTED_VERSIONS.contains(&self.version.as_str()) {
            return Err(RuntimeError::UnsupportedVersion(self.version.clone()).into());
        }
        if let Some(process) = &self.process {
            if process.descriptor.args.is_empty() {
                bail!("process.args must not be empty");
            }
        }
        if let Some(hooks) = &self.hooks {
            for (name, list) in [("pre-start", &hooks.pre_start), ("post-stop", &hooks.post_stop)]
            {
                for (index, hook) in list.iter().enumerate() {
                    if hook.args.is_empty() {
                        bail!("hooks.{name}[{index}].args must not be empty");
                    }
                }
            }
        }
        Ok(())
    }

    /// The mount list, if a `mount` namespace entry carries one.
    pub fn mounts(&self) -> &[MountEntry] {
        self.namespaces
            .as_ref()
            .and_then(|ns| ns.mount.as_ref())
            .and_then(|entry| entry.mounts.as_deref())
            .unwrap_or(&[])
    }

    /// The `user` namespace entry, holder of the id mappings.
    pub fn user_namespace(&self) -> Option<&NamespaceEntry> {
        self.namespaces.as_ref().and_then(|ns| ns.user.as_ref())
    }
}
