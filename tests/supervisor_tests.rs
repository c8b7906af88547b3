//! Tests for process spawning, pid recovery and termination escalation.

mod common;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{FakeSignaller, Reaction};
use magiknative::supervisor::{
    self, EscalationPolicy, LaunchRequest, LibcSignaller, ProcessSignaller, Signal, Supervisor,
    Termination,
};
use magiknative::{Error, ScriptFamily};
use tempfile::TempDir;

fn policy() -> EscalationPolicy {
    EscalationPolicy {
        settle: Duration::from_millis(20),
        grace: Duration::from_millis(50),
    }
}

fn fake_supervisor(signaller: Arc<FakeSignaller>) -> Supervisor {
    Supervisor::new(ScriptFamily::Posix, signaller, Duration::from_secs(1), policy())
}

fn real_supervisor() -> Supervisor {
    Supervisor::new(
        ScriptFamily::Posix,
        Arc::new(LibcSignaller),
        Duration::from_secs(3),
        policy(),
    )
}

fn request<'a>(
    dir: &'a Path,
    log: &'a Path,
    command: &'a str,
    args: &'a [String],
    packaged: bool,
) -> LaunchRequest<'a> {
    LaunchRequest {
        instance_id: "i1",
        command,
        args,
        instance_dir: dir,
        log_file: log,
        namespace: None,
        env: HashMap::new(),
        packaged,
    }
}

// =============================================================================
// Escalation
// =============================================================================

#[tokio::test]
async fn test_not_running_sends_nothing() {
    let signaller = Arc::new(FakeSignaller::new());
    let sup = fake_supervisor(signaller.clone());

    assert_eq!(sup.terminate(4242).await, Termination::NotRunning);
    assert!(signaller.sent().is_empty());
}

#[tokio::test]
async fn test_exit_after_first_interrupt_stops_escalation() {
    let signaller = Arc::new(FakeSignaller::new());
    signaller.spawn(4242, Reaction::DiesOnInterrupt);
    let sup = fake_supervisor(signaller.clone());

    assert_eq!(sup.terminate(4242).await, Termination::Interrupted);
    assert_eq!(signaller.sent(), vec![(4242, true, Signal::Int)]);
}

#[tokio::test]
async fn test_kill_after_two_interrupts() {
    let signaller = Arc::new(FakeSignaller::new());
    signaller.spawn(4242, Reaction::IgnoresInterrupt);
    let sup = fake_supervisor(signaller.clone());

    assert_eq!(sup.terminate(4242).await, Termination::Killed);
    assert_eq!(
        signaller.sent(),
        vec![
            (4242, true, Signal::Int),
            (4242, false, Signal::Int),
            (4242, true, Signal::Kill),
        ]
    );
    assert_eq!(signaller.kills(4242), 1);
    assert!(!signaller.is_alive(4242));
}

#[tokio::test]
async fn test_terminate_all_deduplicates() {
    let signaller = Arc::new(FakeSignaller::new());
    signaller.spawn(10, Reaction::IgnoresInterrupt);
    signaller.spawn(11, Reaction::DiesOnInterrupt);
    let sup = fake_supervisor(signaller.clone());

    let outcomes = sup.terminate_all(&[10, 10, 0, -1, 11, 10]).await;
    assert_eq!(
        outcomes,
        vec![(10, Termination::Killed), (11, Termination::Interrupted)]
    );
    assert_eq!(signaller.kills(10), 1);
    assert_eq!(signaller.kills(11), 0);
}

// =============================================================================
// PID Recovery
// =============================================================================

#[tokio::test]
async fn test_direct_start_pid_is_child_pid() {
    let tmp = TempDir::new().unwrap();
    let log = tmp.path().join("out.log");
    let args = vec!["100".to_string()];
    let sup = real_supervisor();

    let mut launched = sup
        .start(&request(tmp.path(), &log, "sleep", &args, false))
        .await
        .unwrap();
    assert_eq!(Some(launched.pid), launched.child.id());
    assert!(!Supervisor::pid_file(tmp.path(), "i1").exists());

    assert_eq!(sup.terminate(launched.pid as i32).await, Termination::Interrupted);
    launched.child.wait().await.unwrap();
}

#[tokio::test]
async fn test_packaged_start_pid_from_pid_file() {
    let tmp = TempDir::new().unwrap();
    let log = tmp.path().join("out.log");
    let args = vec!["100".to_string()];
    let sup = real_supervisor();

    let mut launched = sup
        .start(&request(tmp.path(), &log, "sleep", &args, true))
        .await
        .unwrap();

    let script = tmp.path().join("i1_run.sh");
    assert!(script.is_file());
    let recorded = supervisor::read_pid_file(&Supervisor::pid_file(tmp.path(), "i1"))
        .unwrap()
        .expect("pid file written by launcher");
    assert_eq!(launched.pid as i32, recorded);
    assert!(LibcSignaller.is_alive(recorded));

    sup.terminate(recorded).await;
    launched.child.wait().await.unwrap();
    assert!(!LibcSignaller.is_alive(recorded));
}

#[tokio::test]
async fn test_packaged_start_requires_instance_dir() {
    let tmp = TempDir::new().unwrap();
    let log = tmp.path().join("out.log");
    let missing = tmp.path().join("gone");
    let args = Vec::new();
    let sup = real_supervisor();

    let err = sup
        .start(&request(&missing, &log, "true", &args, true))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ExecutionFailure { .. }));
    assert!(!missing.exists());
}

#[tokio::test]
async fn test_run_writes_pid_file_and_exit_code() {
    let tmp = TempDir::new().unwrap();
    let log = tmp.path().join("out.log");
    let args = vec!["-c".to_string(), "echo out; echo err >&2; exit 5".to_string()];
    let sup = real_supervisor();

    let mut launched = sup
        .run(&request(tmp.path(), &log, "sh", &args, false))
        .await
        .unwrap();
    let recorded = supervisor::read_pid_file(&Supervisor::pid_file(tmp.path(), "i1")).unwrap();
    assert_eq!(recorded, Some(launched.pid as i32));

    let status = launched.child.wait().await.unwrap();
    assert_eq!(supervisor::exit_code(status), 5);

    let output = std::fs::read_to_string(&log).unwrap();
    assert!(output.contains("out"));
    assert!(output.contains("err"));
}

#[tokio::test]
async fn test_spawn_failure_is_execution_failure() {
    let tmp = TempDir::new().unwrap();
    let log = tmp.path().join("out.log");
    let args = Vec::new();
    let sup = real_supervisor();

    let err = sup
        .start(&request(tmp.path(), &log, "/nonexistent/binary", &args, false))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ExecutionFailure { .. }));
}

#[tokio::test]
async fn test_killed_exit_code_offset() {
    let tmp = TempDir::new().unwrap();
    let log = tmp.path().join("out.log");
    let args = vec!["100".to_string()];
    let sup = real_supervisor();

    let mut launched = sup
        .run(&request(tmp.path(), &log, "sleep", &args, false))
        .await
        .unwrap();
    LibcSignaller
        .signal(launched.pid as i32, Signal::Kill)
        .unwrap();
    let status = launched.child.wait().await.unwrap();
    assert_eq!(supervisor::exit_code(status), 128 + 9);
}
