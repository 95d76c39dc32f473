mod event_handlers;
pub mod log;
pub mod policy;
pub mod run;
pub mod types;

use self::log::{LogSink, LogTail};
use self::run::ProcessHandle;
use self::types::*;
use crate::configs::ProgramConfig;
use crate::error::ControlError;
use chrono::Utc;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// A supervised program.
///
/// All state lives in an owning task; this handle submits commands to it
/// and reads the status snapshot it publishes.
pub struct Program {
    config: ProgramConfig,
    requests: mpsc::UnboundedSender<Request>,
    status: watch::Receiver<ProgramStatus>,
    log: Arc<LogSink>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Program {
    /// Opens the log sink and starts the owning task. The program begins in
    /// `Stopped`.
    pub async fn create(
        config: ProgramConfig,
        log_dir: &Path,
        events: broadcast::Sender<StatusEvent>,
    ) -> std::io::Result<Self> {
        let log = Arc::new(LogSink::open(&config.log_path(log_dir), config.log_buffer).await?);
        let signal = config.signal().unwrap_or_else(|err| {
            warn!(?err, program = %config.name, "Unusable stop signal, using SIGTERM");
            Signal::SIGTERM
        });
        let (status_sender, status) = watch::channel(ProgramStatus::new(&config.name));
        let (requests, request_receiver) = mpsc::unbounded_channel();
        let (exits, exit_receiver) = mpsc::unbounded_channel();

        let task = ProgramTask {
            config: config.clone(),
            signal,
            phase: Phase::Stopped,
            failures: 0,
            last_exit: None,
            status: status_sender,
            events,
            log: Arc::clone(&log),
            exits,
            stop_waiters: Vec::new(),
            restart_waiters: Vec::new(),
        };
        let handle = tokio::spawn(
            task.run(request_receiver, exit_receiver)
                .instrument(info_span!("program", name = %config.name)),
        );

        Ok(Self {
            config,
            requests,
            status,
            log,
            task: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ProgramConfig {
        &self.config
    }

    pub fn status(&self) -> ProgramStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ProgramState {
        self.status.borrow().state
    }

    pub fn watch(&self) -> watch::Receiver<ProgramStatus> {
        self.status.clone()
    }

    pub async fn start(&self) -> Result<ProgramState, ControlError> {
        self.control(Control::Start).await
    }

    /// Resolves once the process is gone.
    pub async fn stop(&self) -> Result<ProgramState, ControlError> {
        self.control(Control::Stop).await
    }

    pub async fn restart(&self) -> Result<ProgramState, ControlError> {
        self.control(Control::Restart).await
    }

    pub async fn control(&self, control: Control) -> Result<ProgramState, ControlError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request::Control { control, reply })
            .map_err(|_| ControlError::Unavailable(self.config.name.clone()))?;
        response
            .await
            .map_err(|_| ControlError::Unavailable(self.config.name.clone()))?
    }

    /// Sends SIGKILL to the live process group before returning, then lets
    /// the owning task settle the program in `Stopped`.
    pub fn kill(&self) {
        let pid = self.status.borrow().pid;
        if let Some(pid) = pid {
            if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!(?err, pid, "Process group already gone");
            }
        }
        let _ = self.requests.send(Request::Kill);
    }

    /// Waits until the program has no process and nothing scheduled.
    pub async fn wait_terminal(&self) -> ProgramState {
        let mut status = self.status.clone();
        loop {
            let state = status.borrow_and_update().state;
            if state.is_terminal() {
                return state;
            }
            if status.changed().await.is_err() {
                return self.state();
            }
        }
    }

    pub fn tail(&self, lines: usize, follow: bool) -> LogTail {
        self.log.tail(lines, follow)
    }

    /// Ends the owning task and closes the log file.
    pub async fn close(&self) {
        let _ = self.requests.send(Request::Shutdown);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(?err, program = %self.config.name, "Program task failed");
            }
        }
        self.log.close().await;
    }
}

/// The only place a program's state is mutated.
pub(crate) struct ProgramTask {
    config: ProgramConfig,
    signal: Signal,
    phase: Phase,
    failures: u32,
    last_exit: Option<ExitResult>,
    status: watch::Sender<ProgramStatus>,
    events: broadcast::Sender<StatusEvent>,
    log: Arc<LogSink>,
    exits: mpsc::UnboundedSender<(u32, ExitResult)>,
    stop_waiters: Vec<Reply>,
    restart_waiters: Vec<Reply>,
}

impl ProgramTask {
    async fn run(
        mut self,
        mut requests: UnboundedReceiver<Request>,
        mut exits: UnboundedReceiver<(u32, ExitResult)>,
    ) {
        loop {
            let event = fetch_event(&mut requests, &mut exits, self.phase.deadline()).await;
            match event {
                Event::Request(Request::Control { control, reply }) => {
                    self.handle_control(control, reply).await
                }
                Event::Request(Request::Kill) => self.handle_kill(),
                Event::Request(Request::Shutdown) | Event::Closed => {
                    if let Some(process) = self.phase.process() {
                        warn!(pid = process.pid(), "Program closed with a live process");
                        let _ = process.kill();
                    }
                    break;
                }
                Event::ProcessExited { pid, result } => self.handle_exit(pid, result).await,
                Event::TimeoutReached => self.handle_timeout().await,
            }
        }
        info!("Program task finished");
    }

    fn state(&self) -> ProgramState {
        self.status.borrow().state
    }

    /// Replaces the phase and publishes the resulting state.
    fn set_phase(&mut self, phase: Phase, detail: Option<String>) {
        let to = phase.state();
        let pid = phase.process().map(ProcessHandle::pid);
        self.phase = phase;
        self.publish(to, pid, detail);
    }

    fn publish(&mut self, to: ProgramState, pid: Option<u32>, detail: Option<String>) {
        let from = self.state();
        let now = Utc::now();
        let failures = self.failures;
        let last_exit = self.last_exit;
        // State and pid change together in one update.
        self.status.send_modify(|status| {
            status.state = to;
            status.pid = pid;
            status.failures = failures;
            status.last_exit = last_exit;
            match to {
                ProgramState::Starting => status.started_at = Some(now),
                ProgramState::Stopped | ProgramState::Exited | ProgramState::Fatal => {
                    status.stopped_at = Some(now)
                }
                _ => {}
            }
        });
        match &detail {
            Some(detail) => info!(%from, %to, detail = detail.as_str(), "State changed"),
            None => info!(%from, %to, "State changed"),
        }
        let _ = self.events.send(StatusEvent {
            program: self.config.name.clone(),
            from,
            to,
            timestamp: now,
            detail,
        });
    }
}

async fn fetch_event(
    requests: &mut UnboundedReceiver<Request>,
    exits: &mut UnboundedReceiver<(u32, ExitResult)>,
    deadline: Option<Instant>,
) -> Event {
    let timeout = deadline.unwrap_or_else(Instant::now);
    select! {
        biased;
        Some((pid, result)) = exits.recv() => Event::ProcessExited { pid, result },
        request = requests.recv() => match request {
            Some(request) => Event::Request(request),
            None => Event::Closed,
        },
        _ = tokio::time::sleep_until(timeout), if deadline.is_some() => Event::TimeoutReached,
    }
}

#[cfg(test)]
mod tests;
