//! Lifecycle hooks: short-lived host-side processes run at pre-start
//! (container PID on stdin) and post-stop.

use anyhow::{bail, Context, Result};
use nix::unistd::{self, ForkResult, Pid};

use crate::core::config::ProcessDescriptor;
use crate::platform::linux::channel::Pipe;
use crate::platform::linux::exec;
use crate::platform::linux::runtime;
use crate::util::log::diag;

/// Run every hook in `list`, in order.
///
/// With a container PID (pre-start) the PID is piped to each hook's
/// stdin and the first failing hook aborts the rest, at which point the
/// caller kills the container. Without one (post-stop) failures are
/// logged to the diagnostic stream and the remaining hooks still run.
pub fn run_hooks(list: &[ProcessDescriptor], name: &str, cpid: Option<Pid>) -> Result<()> {
    for (index, hook) in list.iter().enumerate() {
        diag!("run {name} hook {index}");
        match run_hook(hook, cpid) {
            Ok(()) => {}
            Err(err) if cpid.is_some() => {
                return Err(err).with_context(|| format!("{name} hook {index} failed"));
            }
            Err(err) => diag!("{name} hook {index} failed: {err:#}"),
        }
    }
    Ok(())
}

fn run_hook(hook: &ProcessDescriptor, cpid: Option<Pid>) -> Result<()> {
    let stdin_pipe = match cpid {
        Some(pid) => {
            let mut pipe = Pipe::new().context("failed to create hook stdin pipe")?;
            // The PID line is far below PIPE_BUF, so this write lands in
            // the kernel buffer without a reader.
            pipe.write_message(&format!("{pid}\n"))?;
            pipe.close_write()?;
            if !runtime::container_alive() {
                bail!("container process exited before the hook could run");
            }
            Some(pipe)
        }
        None => None,
    };

    // SAFETY: the hook child only dups an fd and execs (or _exits).
    match unsafe { unistd::fork() }.context("failed to fork hook process")? {
        ForkResult::Child => {
            if let Some(pipe) = &stdin_pipe {
                if let Some(fd) = pipe.read_fd() {
                    if unistd::dup2(fd, 0).is_err() {
                        unsafe { libc::_exit(1) };
                    }
                }
            }
            drop(stdin_pipe);
            let _ = exec::exec(hook, None);
            unsafe { libc::_exit(1) }
        }
        ForkResult::Parent { child } => {
            runtime::record_hook_pid(child);
            diag!("launched hook with PID {child}");
            drop(stdin_pipe);
            let status = runtime::wait_exited(child, "hook");
            runtime::clear_hook_pid();
            let status = status?;
            if status != 0 {
                bail!("hook exited with status {status}");
            }
            Ok(())
        }
    }
}
