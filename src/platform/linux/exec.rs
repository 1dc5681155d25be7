//! Target process resolution and the final transfer of control.

use std::convert::Infallible;
use std::env;
use std::ffi::CString;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::ptr;

use anyhow::{bail, Context, Result};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd;

use crate::core::config::ProcessDescriptor;
use crate::util::log::diag;

/// Open the executable on the host side, before any mount changes hide
/// it. The lookup name is `path` when present, `args[0]` otherwise:
/// absolute names open directly, names with a slash resolve against the
/// current directory, bare names walk the host PATH.
///
/// The fd is `O_PATH | O_CLOEXEC`; it exists only to be handed to
/// execveat later.
pub fn resolve_host_fd(descriptor: &ProcessDescriptor) -> Result<OwnedFd> {
    let name = match (&descriptor.path, descriptor.args.first()) {
        (Some(path), _) => path.as_str(),
        (None, Some(arg0)) => arg0.as_str(),
        (None, None) => bail!("host process has neither a path nor args"),
    };

    if name.starts_with('/') {
        diag!("open container-process executable from host {name}");
        return open_path_fd(Path::new(name));
    }

    if name.contains('/') {
        let full = env::current_dir()
            .context("failed to read current directory")?
            .join(name);
        diag!("open container-process executable from host {}", full.display());
        return open_path_fd(&full);
    }

    for dir in env::split_paths(&env::var_os("PATH").context("host PATH is not set")?) {
        let candidate = dir.join(name);
        if let Ok(fd) = open_path_fd(&candidate) {
            diag!(
                "open container-process executable from host {}",
                candidate.display()
            );
            return Ok(fd);
        }
    }
    bail!("failed to find {name} in the host PATH");
}

fn open_path_fd(path: &Path) -> Result<OwnedFd> {
    let raw = nix::fcntl::open(path, OFlag::O_PATH | OFlag::O_CLOEXEC, Mode::empty())
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Replace this process with the described one. Only returns on failure.
///
/// With a host fd the exec goes through `execveat(fd, "", …,
/// AT_EMPTY_PATH)`; otherwise `execvpe` on `path` (or `args[0]`). The
/// environment defaults to the runtime's own when the descriptor has
/// none.
pub fn exec(descriptor: &ProcessDescriptor, host_fd: Option<OwnedFd>) -> Result<Infallible> {
    let argv: Vec<CString> = descriptor
        .args
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<_, _>>()
        .context("process argument contains a NUL byte")?;
    if argv.is_empty() {
        bail!("process has no arguments to execute");
    }

    let envp: Vec<CString> = match &descriptor.env {
        Some(env) => env
            .iter()
            .map(|entry| CString::new(entry.as_str()))
            .collect::<Result<_, _>>()
            .context("environment entry contains a NUL byte")?,
        None => env::vars()
            .map(|(key, value)| CString::new(format!("{key}={value}")))
            .collect::<Result<_, _>>()
            .context("inherited environment entry contains a NUL byte")?,
    };

    if let Some(fd) = host_fd {
        diag!("execute host executable: {}", descriptor.args.join(" "));
        let err = execveat_empty_path(fd.as_raw_fd(), &argv, &envp);
        return Err(err).context("execveat of the host executable failed");
    }

    let filename = match &descriptor.path {
        Some(path) => {
            CString::new(path.as_str()).context("process path contains a NUL byte")?
        }
        None => argv[0].clone(),
    };
    diag!("execute [{filename:?}]: {}", descriptor.args.join(" "));
    let result = unistd::execvpe(&filename, &argv, &envp)
        .with_context(|| format!("execvpe {filename:?} failed"))?;
    Ok(result)
}

/// execveat(2) with AT_EMPTY_PATH. glibc grew a wrapper only recently,
/// so this goes through syscall(2) directly.
fn execveat_empty_path(fd: RawFd, argv: &[CString], envp: &[CString]) -> io::Error {
    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|arg| arg.as_ptr()).collect();
    argv_ptrs.push(ptr::null());
    let mut envp_ptrs: Vec<*const libc::c_char> =
        envp.iter().map(|entry| entry.as_ptr()).collect();
    envp_ptrs.push(ptr::null());

    let empty = [0 as libc::c_char];
    unsafe {
        libc::syscall(
            libc::SYS_execveat,
            fd,
            empty.as_ptr(),
            argv_ptrs.as_ptr(),
            envp_ptrs.as_ptr(),
            libc::AT_EMPTY_PATH,
        );
    }
    io::Error::last_os_error()
}

/// Resolve the host-side lookup name the way `resolve_host_fd` will.
/// Split out so tests can cover the precedence without opening fds.
pub fn host_lookup_name(descriptor: &ProcessDescriptor) -> Option<&str> {
    descriptor
        .path
        .as_deref()
        .or_else(|| descriptor.args.first().map(String::as_str))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn descriptor(args: &[&str], path: Option<&str>) -> ProcessDescriptor {
        ProcessDescriptor {
            args: args.iter().map(|s| s.to_string()).collect(),
            env: None,
            path: path.map(|s| s.to_string()),
            host: true,
            cwd: None,
        }
    }

    #[test]
    fn path_takes_precedence_over_arg0() {
        let desc = descriptor(&["busybox", "ls"], Some("/bin/busybox"));
        assert_eq!(host_lookup_name(&desc), Some("/bin/busybox"));

        let desc = descriptor(&["ls"], None);
        assert_eq!(host_lookup_name(&desc), Some("ls"));
    }

    #[test]
    fn absolute_names_open_directly() {
        let desc = descriptor(&["/bin/sh"], None);
        let fd = resolve_host_fd(&desc).unwrap();
        assert!(fd.as_raw_fd() >= 0);
    }

    #[test]
    fn bare_names_walk_the_host_path() {
        let desc = descriptor(&["sh"], None);
        let fd = resolve_host_fd(&desc).unwrap();
        assert!(fd.as_raw_fd() >= 0);
    }

    #[test]
    fn names_with_a_slash_resolve_against_the_current_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = tmp.path().join("tool");
        fs::write(&exe, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();

        let previous = env::current_dir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        let result = resolve_host_fd(&descriptor(&["./tool"], None));
        env::set_current_dir(previous).unwrap();

        result.unwrap();
    }

    #[test]
    fn missing_executables_are_reported() {
        let desc = descriptor(&["ccon-test-no-such-binary"], None);
        assert!(resolve_host_fd(&desc).is_err());
    }
}
