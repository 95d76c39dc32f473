use super::policy::{backoff_delay, judge_exit, ExitOutcome};
use super::run;
use super::types::{AfterStop, Control, ExitResult, Phase, ProgramState, Reply};
use super::ProgramTask;
use crate::error::ControlError;
use std::mem;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

impl ProgramTask {
    pub(super) async fn handle_control(&mut self, control: Control, reply: Reply) {
        let state = self.state();
        match (control, state) {
            (Control::Start, ProgramState::Stopped | ProgramState::Exited | ProgramState::Fatal) => {
                self.failures = 0;
                self.launch().await;
                let _ = reply.send(Ok(self.state()));
            }
            (Control::Stop, ProgramState::Starting | ProgramState::Running) => {
                self.begin_stop(AfterStop::Stay);
                self.stop_waiters.push(reply);
            }
            (Control::Stop, ProgramState::Stopping) => {
                if let Phase::Stopping { then, .. } = &mut self.phase {
                    *then = AfterStop::Stay;
                }
                self.stop_waiters.push(reply);
            }
            (Control::Stop, ProgramState::Backoff) => {
                self.cancel_backoff();
                let _ = reply.send(Ok(self.state()));
            }
            (Control::Restart, ProgramState::Starting | ProgramState::Running) => {
                self.begin_stop(AfterStop::Restart);
                self.restart_waiters.push(reply);
            }
            (Control::Restart, ProgramState::Stopping) => {
                if let Phase::Stopping { then, .. } = &mut self.phase {
                    *then = AfterStop::Restart;
                }
                self.restart_waiters.push(reply);
            }
            (Control::Restart, ProgramState::Backoff) => {
                self.cancel_backoff();
                self.failures = 0;
                self.launch().await;
                let _ = reply.send(Ok(self.state()));
            }
            (Control::Restart, ProgramState::Stopped | ProgramState::Exited | ProgramState::Fatal) => {
                self.failures = 0;
                self.launch().await;
                let _ = reply.send(Ok(self.state()));
            }
            (control, state) => {
                debug!(%control, %state, "Rejected command");
                let _ = reply.send(Err(ControlError::InvalidTransition {
                    program: self.config.name.clone(),
                    state,
                    control,
                }));
            }
        }
    }

    pub(super) fn handle_kill(&mut self) {
        let (process, then) = match mem::replace(&mut self.phase, Phase::Stopped) {
            Phase::Backoff { .. } => {
                self.cancel_backoff();
                return;
            }
            Phase::Starting { process, .. } | Phase::Running { process } => {
                (process, AfterStop::Stay)
            }
            Phase::Stopping { process, then, .. } => (process, then),
            other => {
                self.phase = other;
                return;
            }
        };
        warn!(pid = process.pid(), "Force killing");
        if process.kill().is_err() {
            debug!("Process already gone");
        }
        // The exit report settles it in `Stopped`.
        let phase = Phase::Stopping {
            process,
            kill_at: None,
            then,
        };
        if self.state() == ProgramState::Stopping {
            self.phase = phase;
        } else {
            self.set_phase(phase, Some("killed".into()));
        }
    }

    pub(super) async fn handle_exit(&mut self, pid: u32, result: ExitResult) {
        if self.phase.process().map(|process| process.pid()) != Some(pid) {
            debug!(pid, "Ignoring exit of a process we no longer own");
            return;
        }
        self.last_exit = Some(result);

        match mem::replace(&mut self.phase, Phase::Stopped) {
            Phase::Starting { .. } => {
                warn!(%result, "Process exited during startup: attempt {}/{}", self.failures + 1, self.config.retries);
                self.after_exit(result, true);
            }
            Phase::Running { .. } => {
                if result.duration >= self.config.backoff.reset_after {
                    self.failures = 0;
                }
                if result.success() {
                    debug!(%result, "Process exited");
                } else {
                    warn!(%result, "Process exited");
                }
                self.after_exit(result, false);
            }
            Phase::Stopping { then, .. } => {
                self.set_phase(Phase::Stopped, Some(result.to_string()));
                for waiter in self.stop_waiters.drain(..) {
                    let _ = waiter.send(Ok(ProgramState::Stopped));
                }
                if then == AfterStop::Restart {
                    self.failures = 0;
                    self.launch().await;
                }
                let state = self.state();
                for waiter in self.restart_waiters.drain(..) {
                    let _ = waiter.send(Ok(state));
                }
            }
            other => self.phase = other,
        }
    }

    pub(super) async fn handle_timeout(&mut self) {
        match mem::replace(&mut self.phase, Phase::Stopped) {
            Phase::Starting { process, ready_at } if Instant::now() >= ready_at => {
                self.set_phase(Phase::Running { process }, None);
            }
            Phase::Backoff { retry_at } if Instant::now() >= retry_at => {
                self.launch().await;
            }
            Phase::Stopping {
                process,
                kill_at: Some(kill_at),
                then,
            } if Instant::now() >= kill_at => {
                warn!(pid = process.pid(), "Grace period expired, killing");
                if process.kill().is_err() {
                    debug!("Process already gone");
                }
                // Same state, the exit is still pending.
                self.phase = Phase::Stopping {
                    process,
                    kill_at: None,
                    then,
                };
            }
            other => self.phase = other,
        }
    }

    /// Spawns a new process. Ends in `Starting`, or in `Backoff`/`Fatal`
    /// when the spawn fails.
    async fn launch(&mut self) {
        match run::spawn(&self.config, Arc::clone(&self.log), self.exits.clone()).await {
            Ok(process) => {
                let detail = format!("pid {}", process.pid());
                let ready_at = Instant::now() + self.config.start_dwell;
                self.set_phase(Phase::Starting { process, ready_at }, Some(detail));
            }
            Err(err) => {
                error!(?err, "Failed to start program");
                self.publish(ProgramState::Starting, None, Some(err.to_string()));
                let transient = err.is_transient();
                self.fail_attempt(err.to_string(), transient);
            }
        }
    }

    fn after_exit(&mut self, result: ExitResult, early: bool) {
        match judge_exit(self.config.autorestart, &result, early) {
            ExitOutcome::Exited => self.set_phase(Phase::Exited, Some(result.to_string())),
            ExitOutcome::Failed => self.fail_attempt(result.to_string(), false),
        }
    }

    fn fail_attempt(&mut self, reason: String, transient: bool) {
        self.failures += 1;
        if self.failures >= self.config.retries {
            let detail = format!("{reason}; giving up after {} attempts", self.failures);
            self.set_phase(Phase::Fatal, Some(detail));
            return;
        }
        let delay = if transient {
            self.config.backoff.max
        } else {
            backoff_delay(&self.config.backoff, self.failures)
        };
        let detail = format!(
            "{reason}; retrying in {}",
            humantime::format_duration(delay)
        );
        self.set_phase(
            Phase::Backoff {
                retry_at: Instant::now() + delay,
            },
            Some(detail),
        );
    }

    /// Sends the stop signal and arms the grace timer.
    fn begin_stop(&mut self, then: AfterStop) {
        let process = match mem::replace(&mut self.phase, Phase::Stopped) {
            Phase::Starting { process, .. } | Phase::Running { process } => process,
            other => {
                self.phase = other;
                return;
            }
        };
        let now = Instant::now();
        let kill_at = match process.signal(self.signal) {
            Ok(()) => now + self.config.stop_timeout,
            // Exited already; its exit report is on the way.
            Err(_) => now,
        };
        let detail = format!("sent {}", self.signal);
        self.set_phase(
            Phase::Stopping {
                process,
                kill_at: Some(kill_at),
                then,
            },
            Some(detail),
        );
    }

    fn cancel_backoff(&mut self) {
        self.publish(ProgramState::Stopping, None, Some("backoff cancelled".into()));
        self.set_phase(Phase::Stopped, None);
    }
}
