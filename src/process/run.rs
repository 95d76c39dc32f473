use super::log::LogSink;
use super::types::{ExitKind, ExitResult};
use crate::configs::ProgramConfig;
use crate::error::{NotRunning, SpawnError};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// Owner side of one live OS process.
///
/// The child itself lives in a monitor task which waits for it to exit and
/// delivers signals; the exit is reported on the channel passed to
/// [`spawn`] as `(pid, result)`.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    started: Instant,
    signals: mpsc::UnboundedSender<Signal>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Signals the process group of the child.
    pub fn signal(&self, signal: Signal) -> Result<(), NotRunning> {
        self.signals.send(signal).map_err(|_| NotRunning)
    }

    pub fn kill(&self) -> Result<(), NotRunning> {
        self.signal(Signal::SIGKILL)
    }
}

/// Starts the configured command with its output redirected into `log`.
#[instrument(skip_all, fields(program = %config.name))]
pub async fn spawn(
    config: &ProgramConfig,
    log: Arc<LogSink>,
    exits: mpsc::UnboundedSender<(u32, ExitResult)>,
) -> Result<ProcessHandle, SpawnError> {
    let argv = config
        .argv()
        .map_err(|err| SpawnError::Invalid(err.to_string()))?;
    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .envs(&config.environment)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    if let Some(directory) = &config.directory {
        command.current_dir(directory);
    }
    if let Some(user) = &config.user {
        let account = nix::unistd::User::from_name(user)
            .map_err(|err| SpawnError::Invalid(format!("looking up user {user}: {err}")))?
            .ok_or_else(|| SpawnError::Invalid(format!("unknown user {user}")))?;
        command.uid(account.uid.as_raw()).gid(account.gid.as_raw());
    }

    let mut child = command
        .spawn()
        .map_err(|err| SpawnError::from_io(&argv[0], err))?;
    let started = Instant::now();
    let pid = match child.id() {
        Some(pid) => pid,
        None => {
            // Already reaped, which only happens when it was never started.
            return Err(SpawnError::Invalid(format!("{} exited instantly", argv[0])));
        }
    };

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(
            forward_output(stdout, Arc::clone(&log)).instrument(info_span!("read_stdout", pid)),
        );
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(
            forward_output(stderr, Arc::clone(&log)).instrument(info_span!("read_stderr", pid)),
        );
    }

    let (signals, signal_receiver) = mpsc::unbounded_channel();
    tokio::spawn(
        monitor(child, pid, started, signal_receiver, exits)
            .instrument(info_span!("monitor", pid)),
    );

    info!("Child started: {}", pid);
    Ok(ProcessHandle {
        pid,
        started,
        signals,
    })
}

async fn forward_output(stream: impl AsyncRead + Unpin, log: Arc<LogSink>) {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            // Output is not required to be utf-8.
            Ok(_) => log.append(&String::from_utf8_lossy(&line)),
            Err(err) => {
                warn!(?err, "Reading output failed");
                break;
            }
        }
    }
    debug!("Output closed");
}

/// Waits for the child to exit while relaying signals to its process group.
async fn monitor(
    mut child: Child,
    pid: u32,
    started: Instant,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    exits: mpsc::UnboundedSender<(u32, ExitResult)>,
) {
    let mut signals_open = true;
    let status = loop {
        select! {
            status = child.wait() => break status,
            signal = signals.recv(), if signals_open => match signal {
                Some(signal) => deliver(&mut child, pid, signal),
                None => signals_open = false,
            },
        }
    };

    let duration = started.elapsed();
    let result = match status {
        Ok(status) => exit_result(status, duration),
        Err(err) => {
            error!(?err, "Waiting for child failed");
            ExitResult {
                kind: ExitKind::Code(-1),
                duration,
            }
        }
    };
    debug!(%result, "Child exited");
    if exits.send((pid, result)).is_err() {
        debug!("Nobody is waiting for the exit");
    }
}

fn deliver(child: &mut Child, pid: u32, signal: Signal) {
    // `id()` is gone once the child was reaped, so the pid cannot be stale.
    if child.id().is_none() {
        return;
    }
    debug!(?signal, "Signalling process group");
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => {}
        Err(err) => {
            warn!(?err, ?signal, "Failed to signal process group");
            if signal == Signal::SIGKILL {
                if let Err(err) = child.start_kill() {
                    error!(?err, "Failed to kill child");
                }
            }
        }
    }
}

fn exit_result(status: ExitStatus, duration: std::time::Duration) -> ExitResult {
    let kind = match (status.code(), status.signal()) {
        (Some(code), _) => ExitKind::Code(code),
        (None, Some(signal)) => ExitKind::Signal(signal),
        (None, None) => ExitKind::Code(-1),
    };
    ExitResult { kind, duration }
}
