use super::*;
use crate::configs::{BackoffConfig, RestartPolicy};
use crate::process::policy::backoff_delay;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::time::Duration;
use tempfile::TempDir;
use ProgramState::*;

fn fast(name: &str, command: &str) -> ProgramConfig {
    let mut config = ProgramConfig::new(name, command);
    config.start_dwell = Duration::from_millis(200);
    config.stop_timeout = Duration::from_millis(500);
    config.backoff = BackoffConfig {
        first: Duration::from_millis(20),
        max: Duration::from_millis(200),
        factor: 2.0,
        reset_after: Duration::from_secs(60),
    };
    config
}

async fn create(dir: &TempDir, config: ProgramConfig) -> (Program, broadcast::Receiver<StatusEvent>) {
    let (events, receiver) = broadcast::channel(256);
    let program = Program::create(config, dir.path(), events).await.unwrap();
    (program, receiver)
}

/// Collects events until one reaches `last`.
async fn transitions_until(
    events: &mut broadcast::Receiver<StatusEvent>,
    last: ProgramState,
) -> Vec<StatusEvent> {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.unwrap();
            let done = event.to == last;
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {last}, saw {seen:?}");
    seen
}

fn pairs(events: &[StatusEvent]) -> Vec<(ProgramState, ProgramState)> {
    events.iter().map(|event| (event.from, event.to)).collect()
}

fn alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None::<Signal>).is_ok()
}

#[tokio::test]
async fn clean_exit_is_not_restarted() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast("echo", "echo hello");
    config.autorestart = RestartPolicy::OnFailure;
    let (program, mut events) = create(&dir, config).await;

    assert_eq!(program.start().await, Ok(Starting));
    let seen = transitions_until(&mut events, Exited).await;
    assert_eq!(pairs(&seen), vec![(Stopped, Starting), (Starting, Exited)]);

    let status = program.status();
    assert_eq!(status.pid, None);
    assert!(status.last_exit.unwrap().success());
    assert_eq!(status.failures, 0);
}

#[tokio::test]
async fn failing_program_goes_fatal_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast("fail", "sh -c 'exit 1'");
    config.retries = 3;
    let (program, mut events) = create(&dir, config).await;

    program.start().await.unwrap();
    let seen = transitions_until(&mut events, Fatal).await;
    assert_eq!(
        pairs(&seen),
        vec![
            (Stopped, Starting),
            (Starting, Backoff),
            (Backoff, Starting),
            (Starting, Backoff),
            (Backoff, Starting),
            (Starting, Fatal),
        ]
    );
    assert_eq!(program.status().failures, 3);
}

#[tokio::test]
async fn missing_executable_backs_off_with_growing_delays() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast("missing", "/no/such/binary");
    config.retries = 4;
    let backoff = config.backoff.clone();
    let (program, mut events) = create(&dir, config).await;

    assert_eq!(program.start().await, Ok(Backoff));
    let seen = transitions_until(&mut events, Fatal).await;
    let starts = seen.iter().filter(|event| event.to == Starting).count();
    assert_eq!(starts, 4);

    // Each retry waits at least the scheduled delay.
    let mut failures = 0;
    for window in seen.windows(2) {
        if window[0].to == Backoff {
            failures += 1;
            let waited = (window[1].timestamp - window[0].timestamp).to_std().unwrap();
            let scheduled = backoff_delay(&backoff, failures);
            assert!(
                waited + Duration::from_millis(2) >= scheduled,
                "retry {failures} after {waited:?}, expected {scheduled:?}"
            );
        }
    }
    assert_eq!(failures, 3);
}

#[tokio::test]
async fn crash_while_running_is_restarted() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast("crash", "sh -c 'sleep 0.3; exit 2'");
    config.start_dwell = Duration::from_millis(100);
    config.retries = 2;
    let (program, mut events) = create(&dir, config).await;

    program.start().await.unwrap();
    let seen = transitions_until(&mut events, Fatal).await;
    assert_eq!(
        pairs(&seen),
        vec![
            (Stopped, Starting),
            (Starting, Running),
            (Running, Backoff),
            (Backoff, Starting),
            (Starting, Running),
            (Running, Fatal),
        ]
    );
}

#[tokio::test]
async fn stop_terminates_running_process() {
    let dir = tempfile::tempdir().unwrap();
    let (program, mut events) = create(&dir, fast("sleeper", "sleep 30")).await;

    program.start().await.unwrap();
    transitions_until(&mut events, Running).await;
    let pid = program.status().pid.unwrap();
    assert!(alive(pid));

    assert_eq!(program.stop().await, Ok(Stopped));
    let status = program.status();
    assert_eq!(status.state, Stopped);
    assert_eq!(status.pid, None);
    assert_eq!(
        status.last_exit.unwrap().kind,
        ExitKind::Signal(Signal::SIGTERM as i32)
    );
    assert!(!alive(pid));
}

#[tokio::test]
async fn stubborn_process_is_killed_after_grace_period() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast("stubborn", "sh -c \"trap '' TERM; sleep 30\"");
    config.stop_timeout = Duration::from_millis(300);
    let (program, mut events) = create(&dir, config).await;

    program.start().await.unwrap();
    transitions_until(&mut events, Running).await;

    let requested = std::time::Instant::now();
    assert_eq!(program.stop().await, Ok(Stopped));
    let elapsed = requested.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
    assert_eq!(
        program.status().last_exit.unwrap().kind,
        ExitKind::Signal(Signal::SIGKILL as i32)
    );
}

#[tokio::test]
async fn kill_ends_in_stopped_without_relaunch() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast("victim", "sleep 30");
    config.autorestart = RestartPolicy::Always;
    let (program, mut events) = create(&dir, config).await;

    program.start().await.unwrap();
    transitions_until(&mut events, Running).await;
    let pid = program.status().pid.unwrap();

    program.kill();
    let seen = transitions_until(&mut events, Stopped).await;
    assert_eq!(pairs(&seen), vec![(Running, Stopping), (Stopping, Stopped)]);
    assert_eq!(
        program.status().last_exit.unwrap().kind,
        ExitKind::Signal(Signal::SIGKILL as i32)
    );
    assert!(!alive(pid));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(program.state(), Stopped);
}

#[tokio::test]
async fn concurrent_restarts_leave_one_process() {
    let dir = tempfile::tempdir().unwrap();
    let (program, mut events) = create(&dir, fast("x", "sleep 30")).await;

    program.start().await.unwrap();
    transitions_until(&mut events, Running).await;
    let old_pid = program.status().pid.unwrap();

    let (first, second) = tokio::join!(program.restart(), program.restart());
    assert_eq!(first, Ok(Starting));
    assert_eq!(second, Ok(Starting));

    let seen = transitions_until(&mut events, Starting).await;
    assert_eq!(pairs(&seen), vec![(Running, Stopping), (Stopping, Stopped), (Stopped, Starting)]);

    let new_pid = program.status().pid.unwrap();
    assert_ne!(old_pid, new_pid);
    assert!(!alive(old_pid));
    assert!(alive(new_pid));

    program.stop().await.unwrap();
    assert!(!alive(new_pid));
}

#[tokio::test]
async fn stop_cancels_pending_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast("flaky", "sh -c 'exit 1'");
    config.retries = 5;
    config.backoff.first = Duration::from_secs(10);
    config.backoff.max = Duration::from_secs(10);
    let (program, mut events) = create(&dir, config).await;

    program.start().await.unwrap();
    transitions_until(&mut events, Backoff).await;
    assert_eq!(program.stop().await, Ok(Stopped));

    let seen = transitions_until(&mut events, Stopped).await;
    assert_eq!(pairs(&seen), vec![(Backoff, Stopping), (Stopping, Stopped)]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(program.state(), Stopped);
}

#[tokio::test]
async fn restart_rearms_fatal_program() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast("fatal", "sh -c 'exit 1'");
    config.retries = 1;
    let (program, mut events) = create(&dir, config).await;

    program.start().await.unwrap();
    transitions_until(&mut events, Fatal).await;
    assert_eq!(program.status().failures, 1);

    assert_eq!(program.restart().await, Ok(Starting));
    transitions_until(&mut events, Fatal).await;
    assert_eq!(program.status().failures, 1);
}

#[tokio::test]
async fn invalid_transitions_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (program, mut events) = create(&dir, fast("idle", "sleep 30")).await;

    assert!(matches!(
        program.stop().await,
        Err(ControlError::InvalidTransition { state: Stopped, control: Control::Stop, .. })
    ));

    program.start().await.unwrap();
    assert!(matches!(
        program.start().await,
        Err(ControlError::InvalidTransition { state: Starting, .. })
    ));
    transitions_until(&mut events, Running).await;
    assert!(matches!(
        program.start().await,
        Err(ControlError::InvalidTransition { state: Running, .. })
    ));
    program.stop().await.unwrap();
}

#[tokio::test]
async fn output_reaches_log_tail() {
    let dir = tempfile::tempdir().unwrap();
    let (program, mut events) = create(&dir, fast("talker", "sh -c 'echo one; echo two'")).await;

    program.start().await.unwrap();
    transitions_until(&mut events, Exited).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(program.tail(1, false).replay, vec!["two"]);

    program.close().await;
    let file = tokio::fs::read_to_string(dir.path().join("talker.log")).await.unwrap();
    assert_eq!(file, "one\ntwo\n");
}
