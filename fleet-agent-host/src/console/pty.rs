//! Shell attached to a pseudo-terminal

use nix::pty::{openpty, Winsize};
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::debug;

/// How long to wait for trailing output once the shell has exited
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("cannot open pseudo-terminal: {0}")]
    Open(#[from] nix::Error),
    #[error("terminal I/O failed: {0}")]
    Io(#[from] io::Error),
}

fn winsize(cols: u16, rows: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Input side of a running terminal
pub struct Terminal {
    master: File,
    writer: tokio::fs::File,
}

/// Output side of a running terminal: the master reader and the child itself
pub struct TerminalOutput {
    reader: tokio::fs::File,
    child: Child,
    exited: Option<i32>,
}

impl Terminal {
    pub fn spawn(shell: &str, cols: u16, rows: u16) -> Result<(Self, TerminalOutput), PtyError> {
        let pty = openpty(Some(&winsize(cols, rows)), None)?;
        let master = File::from(pty.master);
        let slave = pty.slave;

        let mut command = Command::new(shell);
        command
            .env("TERM", "xterm-256color")
            .stdin(Stdio::from(slave.try_clone()?))
            .stdout(Stdio::from(slave.try_clone()?))
            .stderr(Stdio::from(slave))
            .kill_on_drop(true);

        // SAFETY: the closure runs between fork and exec and only issues
        // setsid and ioctl, both async-signal-safe. The child becomes a
        // session leader and takes its stdin (the pty slave) as controlling
        // terminal so job control and ^C behave.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map_err(io::Error::from)?;
                if libc::ioctl(0, libc::TIOCSCTTY, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn()?;
        debug!("Spawned console shell {} (pid {:?})", shell, child.id());

        let reader = tokio::fs::File::from_std(master.try_clone()?);
        let writer = tokio::fs::File::from_std(master.try_clone()?);
        Ok((
            Terminal { master, writer },
            TerminalOutput {
                reader,
                child,
                exited: None,
            },
        ))
    }

    pub async fn write(&mut self, input: &[u8]) -> Result<(), PtyError> {
        self.writer.write_all(input).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let size = winsize(cols, rows);
        // SAFETY: the descriptor is the live pty master owned by self and
        // `size` outlives the call.
        let rc = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &size as *const Winsize) };
        if rc == -1 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

/// What the terminal did next
#[derive(Debug, PartialEq, Eq)]
pub enum Output {
    /// `n` bytes of output were read into the buffer
    Data(usize),
    /// The shell exited with this code, -1 when killed by a signal
    Exited(i32),
}

impl TerminalOutput {
    pub async fn next(&mut self, buf: &mut [u8]) -> Output {
        loop {
            if let Some(code) = self.exited {
                // pick up what the shell wrote right before exiting
                return match tokio::time::timeout(DRAIN_TIMEOUT, self.reader.read(buf)).await {
                    Ok(Ok(n)) if n > 0 => Output::Data(n),
                    _ => Output::Exited(code),
                };
            }

            let read = tokio::select! {
                biased;
                read = self.reader.read(buf) => read,
                status = self.child.wait() => {
                    self.exited = Some(exit_code(status));
                    continue;
                }
            };
            match read {
                Ok(n) if n > 0 => return Output::Data(n),
                Ok(_) => {}
                // Linux reports a hung-up pty as EIO
                Err(e) if e.raw_os_error() == Some(libc::EIO) => {}
                Err(e) => debug!("Console read failed: {}", e),
            }
            let code = exit_code(self.child.wait().await);
            self.exited = Some(code);
            return Output::Exited(code);
        }
    }
}

fn exit_code(status: io::Result<std::process::ExitStatus>) -> i32 {
    status.ok().and_then(|s| s.code()).unwrap_or(-1)
}

/// Decodes terminal output into text without splitting multi-byte characters
#[derive(Default)]
pub struct Utf8Chunks {
    pending: Vec<u8>,
}

impl Utf8Chunks {
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            // incomplete sequence at the end: keep it for the next chunk
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let text = String::from_utf8_lossy(&self.pending[..valid]).to_string();
                self.pending.drain(..valid);
                text
            }
            Err(_) => String::from_utf8_lossy(&std::mem::take(&mut self.pending)).to_string(),
        }
    }
}
