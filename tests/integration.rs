// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios exercising real child processes and, for the
//! restart/stale-socket cases, a real control server over a Unix socket.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tap::control_server::{self, ServerState};
use tap::locator;
use tap::ring_buffer::RingBuffer;
use tap::supervisor::{SpawnConfig, Supervisor};
use tap::types::{QueryOptions, ReadySpec, ReadyType, RestartRequest, WindowSelector};
use tempfile::tempdir;
use tokio::sync::watch;

fn sh_config(script: &str) -> SpawnConfig {
    SpawnConfig {
        command: vec!["/bin/sh".into(), "-c".into(), script.into()],
        cwd: None,
        env: Default::default(),
        use_pty: false,
    }
}

async fn wait_until<F: Fn() -> bool>(f: F, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !f() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition did not become true in time");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn basic_capture() {
    let ring = Arc::new(RingBuffer::with_defaults());
    let supervisor = Supervisor::new(ring.clone(), sh_config("printf 'line 1\\nline 2\\n'"));
    supervisor.spawn(false).await.unwrap();

    wait_until(
        || ring.query(&QueryOptions::default()).unwrap().events.len() >= 2,
        Duration::from_secs(5),
    )
    .await;

    let response = ring
        .query(&QueryOptions {
            window: WindowSelector::Last(10),
            ..Default::default()
        })
        .unwrap();

    assert_eq!(response.events.len(), 2);
    assert_eq!(response.events[0].seq, 1);
    assert_eq!(response.events[1].seq, 2);
    assert_eq!(response.events[0].text, "line 1");
    assert_eq!(response.events[1].text, "line 2");
    assert_eq!(response.cursor_next, 3);
    assert!(!response.truncated);
    assert!(!response.dropped);
}

#[tokio::test]
async fn byte_cap_eviction() {
    let ring = RingBuffer::new(5000, 20);
    for text in ["12345", "67890", "abcde", "fghij"] {
        ring.append(text, tap::types::StreamLabel::Stdout);
    }

    let snapshot = ring.snapshot_stats();
    assert!(snapshot.current_bytes <= 20);

    let response = ring.query(&QueryOptions::default()).unwrap();
    assert!(response.events.first().unwrap().seq >= 3);
}

#[tokio::test]
async fn cursor_continuity_under_eviction() {
    let ring = RingBuffer::new(2, 10_000_000);
    ring.append("one", tap::types::StreamLabel::Stdout);
    ring.append("two", tap::types::StreamLabel::Stdout);
    ring.append("three", tap::types::StreamLabel::Stdout);

    let response = ring
        .query(&QueryOptions {
            window: WindowSelector::SinceCursor(1),
            ..Default::default()
        })
        .unwrap();

    assert!(response.dropped);
    assert_eq!(response.events[0].seq, 2);
}

async fn start_test_server(
    name: &str,
    spawn: SpawnConfig,
) -> (
    tempfile::TempDir,
    PathBuf,
    watch::Sender<bool>,
    tokio::task::JoinHandle<()>,
) {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join(format!("{name}.sock"));

    let ring = Arc::new(RingBuffer::with_defaults());
    let supervisor = Arc::new(Supervisor::new(ring.clone(), spawn));
    supervisor.spawn(false).await.unwrap();

    let listener = control_server::bind_with_stale_recovery(&socket_path)
        .await
        .unwrap();
    let (shutdown_tx, _rx) = watch::channel(false);
    let state = ServerState::new(
        name.to_string(),
        ring,
        supervisor,
        socket_path.clone(),
        false,
        false,
        shutdown_tx.clone(),
    );
    let handle = tokio::spawn(control_server::serve(listener, state));
    (dir, socket_path, shutdown_tx, handle)
}

#[tokio::test]
async fn restart_with_readiness() {
    let (_dir, socket_path, shutdown_tx, handle) = start_test_server(
        "svc",
        sh_config("printf 'booting\\n'; sleep 0.1; printf 'RESTARTED_READY\\n'; sleep 5"),
    )
    .await;

    let before = tap::client::get_status(&socket_path, Duration::from_secs(5))
        .await
        .unwrap();

    let req = RestartRequest {
        grace_ms: Some(500),
        ready: Some(ReadySpec {
            kind: ReadyType::Substring,
            pattern: "RESTARTED_READY".to_string(),
            case_sensitive: true,
        }),
        timeout_ms: Some(5000),
        clear_logs: false,
    };
    let response = tap::client::post_restart(&socket_path, &req, Duration::from_secs(10))
        .await
        .unwrap();

    assert!(response.ready);
    assert!(response
        .ready_match
        .as_deref()
        .unwrap()
        .contains("RESTARTED_READY"));
    assert!(response.cursor_next > before.buffer.current_lines as u64);

    let _ = shutdown_tx.send(true);
    handle.abort();
}

#[tokio::test]
async fn stale_socket_recovery() {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("svc.sock");
    std::fs::write(&socket_path, b"not a real socket").unwrap();

    let listener = control_server::bind_with_stale_recovery(&socket_path)
        .await
        .expect("stale socket should be unlinked and rebound");
    drop(listener);
}

#[tokio::test]
async fn name_resolution_in_nested_workspace() {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join(".tap")).unwrap();
    std::fs::write(dir.path().join(".tap/worker.sock"), b"").unwrap();
    std::fs::create_dir_all(dir.path().join("frontend/.tap")).unwrap();
    std::fs::write(dir.path().join("frontend/.tap/api.sock"), b"").unwrap();

    let nested = locator::resolve(dir.path(), "frontend:api", None).unwrap();
    assert_eq!(nested, dir.path().join("frontend/.tap/api.sock"));

    let fallback = locator::resolve(dir.path(), "api", None).unwrap();
    assert_eq!(fallback, dir.path().join("frontend/.tap/api.sock"));

    let root = locator::resolve(dir.path(), "worker", None).unwrap();
    assert_eq!(root, dir.path().join(".tap/worker.sock"));
}
