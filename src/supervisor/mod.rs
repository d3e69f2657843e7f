// SPDX-License-Identifier: Apache-2.0

//! Owns the lifetime of one child process: spawning it in its own process
//! group or pty, delivering line-framed output into the ring buffer, and
//! performing graceful-then-forceful termination.

mod line_framer;
mod pipe_io;
mod pty_io;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::ring_buffer::RingBuffer;
use crate::types::{ChildLifecycle, ChildState, StreamLabel};
use line_framer::LineFramer;

/// Everything needed to spawn the supervised child; set once at runner
/// startup, reused verbatim on every restart.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub use_pty: bool,
}

struct RunningChild {
    orchestrator: tokio::task::JoinHandle<()>,
    notify_exit: Arc<Notify>,
}

/// Owns the child process handle and the partial-line accumulators.
pub struct Supervisor {
    ring: Arc<RingBuffer>,
    config: SpawnConfig,
    state: Arc<Mutex<ChildState>>,
    running: tokio::sync::Mutex<Option<RunningChild>>,
}

fn build_command(config: &SpawnConfig) -> Result<tokio::process::Command, SupervisorError> {
    let program = config
        .command
        .first()
        .ok_or_else(|| SupervisorError::Spawn(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty command",
        )))?;

    let mut command = tokio::process::Command::new(program);
    command.args(&config.command[1..]);
    command.envs(&config.env);
    if let Some(cwd) = &config.cwd {
        command.current_dir(cwd);
    }
    command.kill_on_drop(false);
    Ok(command)
}

impl Supervisor {
    pub fn new(ring: Arc<RingBuffer>, config: SpawnConfig) -> Self {
        Supervisor {
            ring,
            config,
            state: Arc::new(Mutex::new(ChildState::default())),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> ChildState {
        self.state.lock().expect("supervisor state mutex poisoned").clone()
    }

    fn set_state(state: &Arc<Mutex<ChildState>>, new_state: ChildState) {
        *state.lock().expect("supervisor state mutex poisoned") = new_state;
    }

    /// Spawns the child configured at construction time. Safe to call again
    /// after `stop()` to restart with the same configuration.
    ///
    /// `restart_marker`, when true, appends `--- restarted (pid=P) ---` to
    /// the ring *before* the orchestrator task that drains the new child's
    /// output is spawned — so the marker is guaranteed a lower `seq` than
    /// anything the new child prints, even on the multi-threaded runtime.
    /// Inserting it only after `spawn` returns (as the control server used
    /// to) races the orchestrator task it has just started.
    pub async fn spawn(&self, restart_marker: bool) -> Result<u32, SupervisorError> {
        Self::set_state(
            &self.state,
            ChildState {
                pid: None,
                state: ChildLifecycle::Starting,
                exit_code: None,
                exit_signal: None,
            },
        );

        let command = build_command(&self.config)?;
        let (tx, mut rx) = mpsc::channel::<(StreamLabel, bytes::Bytes)>(256);

        let (mut child, pty_master) = if self.config.use_pty {
            let (child, master) = pty_io::spawn_with_pty(command)?;
            tokio::spawn(pty_io::pump_master(master, tx.clone()));
            (child, true)
        } else {
            let mut child = pipe_io::spawn_with_pipes(command)?;
            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(pipe_io::pump_stdout(stdout, tx.clone()));
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(pipe_io::pump_stderr(stderr, tx.clone()));
            }
            (child, false)
        };
        drop(tx);
        let _ = pty_master;

        let pid = child
            .id()
            .ok_or(SupervisorError::NoPid)?;

        Self::set_state(
            &self.state,
            ChildState {
                pid: Some(pid),
                state: ChildLifecycle::Running,
                exit_code: None,
                exit_signal: None,
            },
        );
        info!(pid, "child started");

        if restart_marker {
            self.ring
                .insert_marker(format!("--- restarted (pid={pid}) ---"));
        }

        let ring = self.ring.clone();
        let state = self.state.clone();
        let notify_exit = Arc::new(Notify::new());
        let notify_for_task = notify_exit.clone();

        let orchestrator = tokio::spawn(async move {
            let mut combined_framer = LineFramer::new();
            let mut stdout_framer = LineFramer::new();
            let mut stderr_framer = LineFramer::new();

            let mut wait_fut = Box::pin(child.wait());
            let exit_status = loop {
                tokio::select! {
                    maybe_chunk = rx.recv() => {
                        match maybe_chunk {
                            Some((stream, bytes)) => {
                                let framer = match stream {
                                    StreamLabel::Combined => &mut combined_framer,
                                    StreamLabel::Stdout => &mut stdout_framer,
                                    StreamLabel::Stderr => &mut stderr_framer,
                                };
                                for line in framer.feed(&bytes) {
                                    ring.append(line, stream);
                                }
                            }
                            None => {
                                // all pump tasks finished (EOF); keep waiting for
                                // the process itself to be reaped.
                            }
                        }
                    }
                    status = &mut wait_fut => {
                        break status;
                    }
                }
            };

            for (framer, stream) in [
                (&mut combined_framer, StreamLabel::Combined),
                (&mut stdout_framer, StreamLabel::Stdout),
                (&mut stderr_framer, StreamLabel::Stderr),
            ] {
                if let Some(line) = framer.flush() {
                    ring.append(line, stream);
                }
            }

            let (exit_code, exit_signal) = match exit_status {
                Ok(status) => {
                    use std::os::unix::process::ExitStatusExt;
                    (status.code(), status.signal())
                }
                Err(e) => {
                    warn!(error = %e, "error waiting on child");
                    (Some(1), None)
                }
            };

            ring.insert_marker(format!(
                "--- exited (code={}, signal={}) ---",
                exit_code.map(|c| c.to_string()).unwrap_or_else(|| "none".into()),
                exit_signal.map(|s| s.to_string()).unwrap_or_else(|| "none".into()),
            ));

            let mut guard = state.lock().expect("supervisor state mutex poisoned");
            guard.state = ChildLifecycle::Exited;
            guard.exit_code = exit_code;
            guard.exit_signal = exit_signal;
            drop(guard);

            // `notify_one`, not `notify_waiters`: the latter only wakes waiters
            // already polling `notified()`, so a `stop()` call that hasn't
            // reached its `select!` yet would miss the wakeup and block for the
            // full grace period. `notify_one` stores a permit if nobody's
            // listening yet.
            notify_for_task.notify_one();
        });

        *self.running.lock().await = Some(RunningChild {
            orchestrator,
            notify_exit,
        });

        Ok(pid)
    }

    /// Sends `SIGTERM` (then, after `grace`, `SIGKILL`) to the child's
    /// process group, falling back to the bare pid if group signalling
    /// fails. Idempotent: a no-op if the child isn't running.
    pub async fn stop(&self, grace: Duration) {
        let pid = match self.state().pid {
            Some(pid) if self.state().state == ChildLifecycle::Running => pid as i32,
            _ => return,
        };

        let notify_exit = {
            let guard = self.running.lock().await;
            guard.as_ref().map(|r| r.notify_exit.clone())
        };
        let Some(notify_exit) = notify_exit else {
            return;
        };

        signal_group_or_pid(pid, Signal::SIGTERM);

        tokio::select! {
            _ = notify_exit.notified() => {}
            _ = tokio::time::sleep(grace) => {
                if self.state().state == ChildLifecycle::Running {
                    warn!(pid, "grace period elapsed, sending SIGKILL");
                    signal_group_or_pid(pid, Signal::SIGKILL);
                    tokio::select! {
                        _ = notify_exit.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    }
                }
            }
        }

        if let Some(running) = self.running.lock().await.take() {
            let _ = running.orchestrator.await;
        }

        Self::set_state(
            &self.state,
            ChildState {
                pid: None,
                state: ChildLifecycle::Stopped,
                exit_code: self.state().exit_code,
                exit_signal: self.state().exit_signal,
            },
        );
        debug!(pid, "child stopped");
    }
}

fn signal_group_or_pid(pid: i32, signal: Signal) {
    match kill(Pid::from_raw(-pid), signal) {
        Ok(()) => {}
        Err(nix::errno::Errno::ESRCH) => {
            // already dead
        }
        Err(_) => {
            let _ = kill(Pid::from_raw(pid), signal);
        }
    }
}
