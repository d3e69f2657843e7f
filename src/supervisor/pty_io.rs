// SPDX-License-Identifier: Apache-2.0

//! PTY-backed child I/O source. The slave side is wired to the child's
//! stdin/stdout/stderr; the master side is read by the runner as a single
//! `combined` byte stream, since a pty interleaves what would otherwise be
//! separate stdout/stderr into one tty line discipline.

use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::Stdio;

use bytes::Bytes;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::{openpty, Winsize};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

use crate::error::SupervisorError;
use crate::types::StreamLabel;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;
const READ_CHUNK: usize = 8192;

fn set_nonblocking(fd: &OwnedFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Allocates a pty pair and wires `command`'s stdio to the slave end. Returns
/// the spawned child and a master-side reader task feeding `tx`.
pub fn spawn_with_pty(
    mut command: tokio::process::Command,
) -> Result<(tokio::process::Child, AsyncFd<File>), SupervisorError> {
    let winsize = Winsize {
        ws_row: DEFAULT_ROWS,
        ws_col: DEFAULT_COLS,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let pty = openpty(Some(&winsize), None).map_err(SupervisorError::Pty)?;
    let master = pty.master;
    let slave = pty.slave;

    let slave_file = File::from(slave);
    let stdin_fd = slave_file
        .try_clone()
        .map_err(SupervisorError::Spawn)?;
    let stdout_fd = slave_file
        .try_clone()
        .map_err(SupervisorError::Spawn)?;
    let stderr_fd = slave_file;

    command.stdin(Stdio::from(stdin_fd));
    command.stdout(Stdio::from(stdout_fd));
    command.stderr(Stdio::from(stderr_fd));

    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }

    let child = command.spawn().map_err(SupervisorError::Spawn)?;

    // `Stdio::from` handed the parent's slave-side fds to the child during
    // spawn; no parent-side copy survives, so the master sees EOF once the
    // child's own copies close on exit.

    set_nonblocking(&master).map_err(SupervisorError::Pty)?;
    let master_file = File::from(master);
    let async_master = AsyncFd::new(master_file).map_err(SupervisorError::Spawn)?;

    Ok((child, async_master))
}

/// Reads the pty master until EOF, feeding `(Combined, chunk)` to `tx`.
pub async fn pump_master(master: AsyncFd<File>, tx: mpsc::Sender<(StreamLabel, Bytes)>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let mut guard = match master.readable().await {
            Ok(guard) => guard,
            Err(_) => break,
        };
        let result = guard.try_io(|inner| {
            use std::io::Read;
            let mut file_ref = inner.get_ref();
            file_ref.read(&mut buf)
        });
        match result {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                if tx
                    .send((StreamLabel::Combined, Bytes::copy_from_slice(&buf[..n])))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Ok(Err(_)) => break,
            Err(_would_block) => continue,
        }
    }
}
