//! The bring-up choreography: clone the container child, drive the
//! handshake, run hooks at the right moments, wait, and propagate the
//! exit status.

use std::env;
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sched;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::{self, Pid};

use crate::core::config::{Config, Hooks};
use crate::platform::linux::caps::CapabilitySet;
use crate::platform::linux::channel::{self, Pipe};
use crate::platform::linux::exec;
use crate::platform::linux::hooks;
use crate::platform::linux::mounts::MountPlan;
use crate::platform::linux::namespaces::NamespaceSelection;
use crate::platform::linux::userns;
use crate::util::log::diag;

/// Stack handed to the cloned child.
const STACK_SIZE: usize = 1024 * 1024;

/// PID of the container child, -1 once reaped (or before clone). Written
/// by the main flow and the SIGCHLD handler, read by every handler.
static CONTAINER_PID: AtomicI32 = AtomicI32::new(-1);

/// PID of the currently running hook, -1 when none.
static HOOK_PID: AtomicI32 = AtomicI32::new(-1);

/// Whether the container child is still recorded as alive.
pub(crate) fn container_alive() -> bool {
    CONTAINER_PID.load(Ordering::SeqCst) > 0
}

pub(crate) fn record_hook_pid(pid: Pid) {
    HOOK_PID.store(pid.as_raw(), Ordering::SeqCst);
}

pub(crate) fn clear_hook_pid() {
    HOOK_PID.store(-1, Ordering::SeqCst);
}

/// SIGHUP/SIGINT/SIGTERM: forward as SIGKILL to the container child,
/// best-effort. Only async-signal-safe calls in here.
extern "C" fn forward_fatal_signal(
    _signum: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    let cpid = CONTAINER_PID.load(Ordering::SeqCst);
    if cpid > 0 {
        unsafe { libc::kill(cpid, libc::SIGKILL) };
    }
}

/// SIGCHLD: mark the container child or the current hook as gone so the
/// main flow stops signaling them; reap anything else (grandchildren
/// reparented onto us) so it cannot linger as a zombie. Only
/// async-signal-safe calls in here.
extern "C" fn reap_stray_child(
    _signum: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    let pid = unsafe { (*info).si_pid() };
    if pid == CONTAINER_PID.load(Ordering::SeqCst) {
        CONTAINER_PID.store(-1, Ordering::SeqCst);
    } else if pid == HOOK_PID.load(Ordering::SeqCst) {
        HOOK_PID.store(-1, Ordering::SeqCst);
    } else {
        let mut status: libc::siginfo_t = unsafe { std::mem::zeroed() };
        unsafe { libc::waitid(libc::P_PID, pid as libc::id_t, &mut status, libc::WEXITED) };
    }
}

fn install_signal_handlers() -> Result<()> {
    let forward = SigAction::new(
        SigHandler::SigAction(forward_fatal_signal),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    for sig in [Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler is async-signal-safe.
        unsafe { signal::sigaction(sig, &forward) }
            .with_context(|| format!("failed to install the {sig} handler"))?;
    }

    let reap = SigAction::new(
        SigHandler::SigAction(reap_stray_child),
        SaFlags::SA_SIGINFO | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    // SAFETY: as above.
    unsafe { signal::sigaction(Signal::SIGCHLD, &reap) }
        .context("failed to install the SIGCHLD handler")?;
    Ok(())
}

/// Kills and reaps the container child if it is still recorded when an
/// error unwinds past the clone point. A clean run clears the recorded
/// PID first, making this a no-op.
struct ChildGuard;

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let pid = CONTAINER_PID.swap(-1, Ordering::SeqCst);
        if pid > 0 {
            let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
            let _ = waitid(Id::Pid(Pid::from_raw(pid)), WaitPidFlag::WEXITED);
        }
    }
}

/// Launch the configured container and return its exit code.
///
/// Exactly one child is cloned per run; every pipe end, the clone
/// stack, and the child itself are released on all paths out of here.
pub fn run(config: &Config) -> Result<i32> {
    let selection = NamespaceSelection::from_config(config.namespaces.as_ref());
    let cwd = env::current_dir().context("failed to read the working directory")?;
    let mounts = MountPlan::resolve(config, &cwd)?;
    // Capability names are resolved before the child exists so a typo
    // cannot surface as a half-built container.
    let capabilities = config
        .process
        .as_ref()
        .and_then(|process| process.capabilities.as_deref())
        .map(CapabilitySet::from_names)
        .transpose()?;

    let mut to_child = Pipe::new().context("failed to create the host-to-container pipe")?;
    let mut from_child = Pipe::new().context("failed to create the container-to-host pipe")?;
    let mut stack = vec![0u8; STACK_SIZE];

    let child = {
        let cb: sched::CloneCb = Box::new(|| {
            child_main(
                config,
                &selection,
                &mounts,
                capabilities.as_ref(),
                &mut to_child,
                &mut from_child,
            )
        });
        // SAFETY: the child closure works on its own copy of the address
        // space and terminates in exec or process exit.
        unsafe { sched::clone(cb, &mut stack, selection.create_mask, Some(libc::SIGCHLD)) }
            .context("failed to clone the container process")?
    };
    CONTAINER_PID.store(child.as_raw(), Ordering::SeqCst);
    let _guard = ChildGuard;

    diag!("launched container process with PID {child}");
    install_signal_handlers()?;

    to_child.close_read()?;
    from_child.close_write()?;

    supervise(config, child, &mut to_child, &mut from_child)
}

/// The parent side of the handshake, from map writing to the final
/// post-stop hook.
fn supervise(
    config: &Config,
    cpid: Pid,
    to_child: &mut Pipe,
    from_child: &mut Pipe,
) -> Result<i32> {
    userns::apply_mappings(config, cpid)
        .context("failed to write user namespace mappings")?;

    to_child
        .write_message(channel::USER_NAMESPACE_MAPPING_COMPLETE)
        .context("failed to notify the container of mapping completion")?;

    from_child
        .expect_message(channel::CONTAINER_SETUP_COMPLETE)
        .context("container setup did not complete")?;
    from_child.close_read()?;

    let default_hooks = Hooks::default();
    let hooks = config.hooks.as_ref().unwrap_or(&default_hooks);

    match hooks::run_hooks(&hooks.pre_start, "pre-start", Some(cpid)) {
        Ok(()) => {
            to_child
                .write_message(channel::EXEC_PROCESS)
                .context("failed to send the exec request to the container")?;
        }
        Err(err) => {
            diag!("pre-start hooks failed: {err:#}");
            let pid = CONTAINER_PID.load(Ordering::SeqCst);
            if pid > 0 {
                diag!("SIGKILL the container process");
                let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
    }
    to_child.close_write()?;

    let status = wait_exited(cpid, "container");
    CONTAINER_PID.store(-1, Ordering::SeqCst);

    // Post-stop failures are logged inside run_hooks and never reach
    // the exit code.
    let _ = hooks::run_hooks(&hooks.post_stop, "post-stop", None);

    status
}

/// Entry point of the cloned child. The return value is the child's
/// exit status when exec never happens.
fn child_main(
    config: &Config,
    selection: &NamespaceSelection,
    mounts: &MountPlan,
    capabilities: Option<&CapabilitySet>,
    from_parent: &mut Pipe,
    to_parent: &mut Pipe,
) -> isize {
    match child_setup(config, selection, mounts, capabilities, from_parent, to_parent) {
        Ok(code) => code as isize,
        Err(err) => {
            diag!("container setup failed: {err:#}");
            1
        }
    }
}

fn child_setup(
    config: &Config,
    selection: &NamespaceSelection,
    mounts: &MountPlan,
    capabilities: Option<&CapabilitySet>,
    from_parent: &mut Pipe,
    to_parent: &mut Pipe,
) -> Result<i32> {
    from_parent.close_write()?;
    to_parent.close_read()?;

    from_parent
        .expect_message(channel::USER_NAMESPACE_MAPPING_COMPLETE)
        .context("user namespace mapping did not complete")?;

    // A host executable must be resolved before mounts can hide the
    // host's filesystem view.
    let host_fd = match &config.process {
        Some(process) if process.descriptor.host => {
            Some(exec::resolve_host_fd(&process.descriptor)?)
        }
        _ => None,
    };

    selection.join_all()?;
    mounts.apply()?;

    to_parent.write_message(channel::CONTAINER_SETUP_COMPLETE)?;
    to_parent.close_write()?;

    // Blocks here while the parent runs pre-start hooks.
    from_parent
        .expect_message(channel::EXEC_PROCESS)
        .context("never released to exec")?;
    from_parent.close_read()?;

    let Some(process) = &config.process else {
        diag!("process not defined, exiting");
        return Ok(0);
    };

    if let Some(cwd) = &process.descriptor.cwd {
        diag!("change working directory to {}", cwd.display());
        unistd::chdir(cwd.as_path())
            .with_context(|| format!("chdir {} failed", cwd.display()))?;
    }

    userns::apply_identity(process.user.as_ref())?;

    if let Some(capabilities) = capabilities {
        capabilities.apply()?;
    }

    exec::exec(&process.descriptor, host_fd)?;
    unreachable!("exec should have replaced this process");
}

/// Wait for `pid` to terminate, retrying on EINTR, and translate the
/// outcome: exit status as-is, anything else (signal death, unexpected
/// states) as 1.
pub(crate) fn wait_exited(pid: Pid, name: &str) -> Result<i32> {
    loop {
        match waitid(Id::Pid(pid), WaitPidFlag::WEXITED) {
            Ok(WaitStatus::Exited(_, code)) => {
                diag!("{name} process {pid} exited with {code}");
                return Ok(code);
            }
            Ok(WaitStatus::Signaled(_, sig, core_dumped)) => {
                diag!("{name} process {pid} killed by {sig} (core dumped: {core_dumped})");
                return Ok(1);
            }
            Ok(status) => {
                diag!("unrecognized {name} exit condition: {status:?}");
                return Ok(1);
            }
            Err(Errno::EINTR) => continue,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("waitid on the {name} process failed"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::ForkResult;

    #[test]
    fn wait_exited_returns_the_exit_status() {
        match unsafe { unistd::fork() }.unwrap() {
            ForkResult::Child => unsafe { libc::_exit(7) },
            ForkResult::Parent { child } => {
                assert_eq!(wait_exited(child, "test").unwrap(), 7);
            }
        }
    }

    #[test]
    fn wait_exited_translates_signal_death_to_one() {
        match unsafe { unistd::fork() }.unwrap() {
            ForkResult::Child => unsafe {
                libc::kill(libc::getpid(), libc::SIGKILL);
                libc::_exit(0)
            },
            ForkResult::Parent { child } => {
                assert_eq!(wait_exited(child, "test").unwrap(), 1);
            }
        }
    }

    #[test]
    fn recorded_pids_default_to_gone() {
        assert!(!container_alive());
    }
}
