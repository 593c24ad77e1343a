//! PTY allocation and shell processes.
//!
//! Each accepted SSH session gets a platform PTY pair with `/bin/bash -l`
//! on the slave side, running as the Unix account matching the certificate
//! principal. Window-change requests land as `TIOCSWINSZ` on the master.

#![cfg(unix)]

use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

use nix::pty::{openpty, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{Pid, User};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const SHELL: &str = "/bin/bash";
const CHILD_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, Winsize);

/// Parameters captured from the SSH PTY request.
#[derive(Debug, Clone)]
pub struct PtyRequest {
    /// Terminal type (e.g. `xterm-256color`).
    pub term: String,
    /// Columns.
    pub cols: u16,
    /// Rows.
    pub rows: u16,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm".to_string(),
            cols: 80,
            rows: 24,
        }
    }
}

/// A live PTY-backed shell.
pub struct PtySession {
    reader: tokio::fs::File,
    writer: tokio::fs::File,
    ioctl_fd: OwnedFd,
    child: tokio::process::Child,
}

fn winsize(cols: u16, rows: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Spawn a login shell on a fresh PTY as the given principal.
///
/// A principal with no local account is refused unless `allow_root_fallback`
/// is set, in which case the shell runs as the agent's own (root) user.
///
/// # Errors
///
/// Returns an error when the principal cannot be mapped, the PTY cannot be
/// allocated, or the shell fails to start.
pub fn spawn_shell(
    principal: &str,
    allow_root_fallback: bool,
    request: &PtyRequest,
) -> anyhow::Result<PtySession> {
    let account = User::from_name(principal)?;
    if account.is_none() && !allow_root_fallback {
        anyhow::bail!("no local account for principal {principal} and root fallback is disabled");
    }

    let pty = openpty(Some(&winsize(request.cols, request.rows)), None)?;
    let master: OwnedFd = pty.master;
    let slave: OwnedFd = pty.slave;

    let mut command = tokio::process::Command::new(SHELL);
    command
        .arg("-l")
        .env("TERM", &request.term)
        .stdin(Stdio::from(slave.try_clone()?))
        .stdout(Stdio::from(slave.try_clone()?))
        .stderr(Stdio::from(slave));

    if let Some(account) = account {
        command
            .uid(account.uid.as_raw())
            .gid(account.gid.as_raw())
            .env("HOME", &account.dir)
            .env("USER", &account.name)
            .env("LOGNAME", &account.name)
            .env("SHELL", SHELL)
            .current_dir(&account.dir);
    } else {
        tracing::warn!(principal, "running session as root (fallback enabled)");
    }

    // The child must lead its own session with the PTY slave as its
    // controlling terminal.
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn()?;

    let reader = tokio::fs::File::from_std(std::fs::File::from(master.try_clone()?));
    let writer = tokio::fs::File::from_std(std::fs::File::from(master.try_clone()?));

    Ok(PtySession {
        reader,
        writer,
        ioctl_fd: master,
        child,
    })
}

impl PtySession {
    /// Read the next chunk of shell output.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error; EOF (0 bytes) means the child
    /// closed its side.
    pub async fn read_output(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf).await
    }

    /// Write client keystrokes to the shell.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn write_input(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data).await
    }

    /// Apply a window-change request.
    ///
    /// # Errors
    ///
    /// Returns the ioctl error.
    pub fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        let size = winsize(cols, rows);
        unsafe { tiocswinsz(self.ioctl_fd.as_raw_fd(), &size) }?;
        Ok(())
    }

    /// Terminate the shell: SIGTERM, a five second grace period, SIGKILL.
    pub async fn shutdown(self) {
        let (_, controller) = self.split();
        controller.shutdown().await;
    }

    /// Split into the output reader (for the pump task) and the controller
    /// (input, resize, and teardown, kept by the connection handler).
    #[must_use]
    pub fn split(self) -> (PtyReader, PtyController) {
        (
            PtyReader {
                reader: self.reader,
            },
            PtyController {
                writer: self.writer,
                ioctl_fd: self.ioctl_fd,
                child: self.child,
            },
        )
    }
}

/// Read half of a PTY session.
pub struct PtyReader {
    reader: tokio::fs::File,
}

impl PtyReader {
    /// Read the next chunk of shell output.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error; EOF (0 bytes) means the child
    /// closed its side.
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf).await
    }
}

/// Control half of a PTY session.
pub struct PtyController {
    writer: tokio::fs::File,
    ioctl_fd: OwnedFd,
    child: tokio::process::Child,
}

impl PtyController {
    /// Write client keystrokes to the shell.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn write_input(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data).await
    }

    /// Apply a window-change request.
    ///
    /// # Errors
    ///
    /// Returns the ioctl error.
    pub fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        let size = winsize(cols, rows);
        unsafe { tiocswinsz(self.ioctl_fd.as_raw_fd(), &size) }?;
        Ok(())
    }

    /// Terminate the shell: SIGTERM, a five second grace period, SIGKILL.
    pub async fn shutdown(mut self) {
        if let Some(pid) = self.child.id() {
            #[allow(clippy::cast_possible_wrap)]
            let pid = Pid::from_raw(pid as i32);
            let _ = kill(pid, Signal::SIGTERM);
        }

        match tokio::time::timeout(CHILD_GRACE, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                tracing::warn!("shell did not exit in grace period, killing");
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_username() -> Option<String> {
        User::from_uid(nix::unistd::Uid::current())
            .ok()
            .flatten()
            .map(|u| u.name)
    }

    #[tokio::test]
    async fn shell_echoes_through_the_pty() {
        if !std::path::Path::new(SHELL).exists() {
            return;
        }
        let Some(user) = current_username() else {
            return;
        };

        let mut session = spawn_shell(&user, false, &PtyRequest::default()).unwrap();
        session.write_input(b"echo gough-$((40+2))\n").await.unwrap();

        let mut collected = String::new();
        let mut buf = [0u8; 4096];
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(
                std::time::Duration::from_secs(2),
                session.read_output(&mut buf),
            )
            .await
            {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    collected.push_str(&String::from_utf8_lossy(&buf[..n]));
                    if collected.contains("gough-42") {
                        break;
                    }
                }
                _ => break,
            }
        }

        assert!(collected.contains("gough-42"), "output was: {collected}");
        session.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_principal_is_refused_without_fallback() {
        let result = spawn_shell("no-such-user-gough", false, &PtyRequest::default());
        assert!(result.is_err());
    }

    #[test]
    fn resize_on_live_session() {
        if !std::path::Path::new(SHELL).exists() {
            return;
        }
        let Some(user) = current_username() else {
            return;
        };

        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let session = spawn_shell(&user, false, &PtyRequest::default()).unwrap();
            session.resize(120, 40).unwrap();
            session.shutdown().await;
        });
    }
}
