//! The parent/child handshake channel: two unidirectional pipes carrying
//! fixed newline-terminated messages.

use std::io;
use std::os::unix::io::{AsRawFd, IntoRawFd, OwnedFd};

use anyhow::{bail, Context, Result};
use nix::unistd;

use crate::core::error::{RuntimeError, MAX_MESSAGE_BYTES};

/// Sent by the parent once uid_map/gid_map/setgroups are in place.
pub const USER_NAMESPACE_MAPPING_COMPLETE: &str = "user-namespace-mapping-complete\n";
/// Sent by the child once namespaces are joined and mounts applied.
pub const CONTAINER_SETUP_COMPLETE: &str = "container-setup-complete\n";
/// Sent by the parent after pre-start hooks; releases the child to exec.
pub const EXEC_PROCESS: &str = "exec-process\n";

/// Line reads grow the buffer in blocks of this size.
const READ_BLOCK: usize = 512;

/// One half-duplex pipe. Each end has a single owner and a single close
/// point; whatever is still open when the `Pipe` is dropped (an error
/// path) is released then.
///
/// Both fds are inherited across clone/fork as-is; the child closes the
/// ends it does not use, mirroring the parent.
#[derive(Debug)]
pub struct Pipe {
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
}

impl Pipe {
    pub fn new() -> Result<Pipe> {
        let (read, write) = unistd::pipe().context("failed to create pipe")?;
        Ok(Pipe {
            read: Some(read),
            write: Some(write),
        })
    }

    /// Close the read end now, reporting failure. Safe to call more than
    /// once per process image; the fd slot is emptied either way.
    pub fn close_read(&mut self) -> Result<()> {
        close_end(self.read.take()).context("failed to close pipe read end")
    }

    /// Close the write end now, reporting failure.
    pub fn close_write(&mut self) -> Result<()> {
        close_end(self.write.take()).context("failed to close pipe write end")
    }

    /// The raw read fd, for duping onto a hook's stdin.
    pub fn read_fd(&self) -> Option<i32> {
        self.read.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Write an entire message with a single `write(2)`. Messages are a
    /// handful of bytes, far below PIPE_BUF, so a short write is an
    /// error, not something to resume.
    pub fn write_message(&mut self, message: &str) -> Result<()> {
        let fd = self
            .write
            .as_ref()
            .context("pipe write end already closed")?
            .as_raw_fd();
        let n = unsafe { libc::write(fd, message.as_ptr().cast(), message.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error()).context("failed to write to pipe");
        }
        if n as usize != message.len() {
            bail!("short write to pipe ({n} of {} bytes)", message.len());
        }
        Ok(())
    }

    /// Read one newline-terminated message.
    ///
    /// Byte-at-a-time reads keep this free of overshoot: the expected
    /// message count is tiny and bounded, and the fd can be closed the
    /// instant the line is complete without buffered bytes going missing.
    pub fn read_message(&mut self) -> Result<String> {
        let fd = self
            .read
            .as_ref()
            .context("pipe read end already closed")?
            .as_raw_fd();

        let mut line: Vec<u8> = Vec::new();
        loop {
            if line.len() == line.capacity() {
                line.reserve(READ_BLOCK);
            }
            let mut byte = 0u8;
            let n = unsafe { libc::read(fd, (&mut byte as *mut u8).cast(), 1) };
            if n < 0 {
                return Err(io::Error::last_os_error()).context("failed to read from pipe");
            }
            if n == 0 {
                return Err(RuntimeError::ChannelClosed.into());
            }
            line.push(byte);
            if line.len() >= MAX_MESSAGE_BYTES {
                return Err(RuntimeError::OversizedMessage.into());
            }
            if byte == b'\n' {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Read one message and require it to equal `expected`, byte for
    /// byte. Anything else is a protocol error.
    pub fn expect_message(&mut self, expected: &str) -> Result<()> {
        let received = self.read_message()?;
        if received != expected {
            return Err(RuntimeError::UnexpectedMessage {
                expected: expected.trim_end().to_string(),
                received: received.trim_end().to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Close a taken pipe end with an error check, unlike the silent close
/// in `OwnedFd::drop`.
fn close_end(fd: Option<OwnedFd>) -> io::Result<()> {
    if let Some(fd) = fd {
        if unsafe { libc::close(fd.into_raw_fd()) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
