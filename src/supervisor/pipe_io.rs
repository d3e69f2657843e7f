// SPDX-License-Identifier: Apache-2.0

//! Pipe-backed child I/O source: stdout and stderr are captured separately,
//! each with its own reader task feeding a shared channel tagged by stream.

use std::os::unix::process::CommandExt;
use std::process::Stdio;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, ChildStdout};
use tokio::sync::mpsc;

use crate::error::SupervisorError;
use crate::types::StreamLabel;

const READ_CHUNK: usize = 8192;

/// Wires `command`'s stdout/stderr to pipes and puts it in its own session,
/// so a single signal to the (negative) pid reaches every descendant.
pub fn spawn_with_pipes(
    mut command: tokio::process::Command,
) -> Result<tokio::process::Child, SupervisorError> {
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }

    command.spawn().map_err(SupervisorError::Spawn)
}

pub async fn pump_stdout(mut stdout: ChildStdout, tx: mpsc::Sender<(StreamLabel, Bytes)>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx
                    .send((StreamLabel::Stdout, Bytes::copy_from_slice(&buf[..n])))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

pub async fn pump_stderr(mut stderr: ChildStderr, tx: mpsc::Sender<(StreamLabel, Bytes)>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx
                    .send((StreamLabel::Stderr, Bytes::copy_from_slice(&buf[..n])))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}
