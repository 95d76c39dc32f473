use crate::configs::ProgramConfig;
use crate::error::ControlError;
use crate::process::log::LogTail;
use crate::process::types::{Control, ProgramState, ProgramStatus, StatusEvent};
use crate::process::Program;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};

const EVENT_CAPACITY: usize = 1024;

/// Configuration plus current status of one program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSummary {
    pub config: ProgramConfig,
    pub status: ProgramStatus,
}

#[derive(Default)]
struct ProgramTable {
    order: Vec<String>,
    programs: HashMap<String, Arc<Program>>,
}

/// Owns every program and serializes changes to the set of programs.
///
/// The table lock is only held to look programs up or to insert and remove
/// them; commands run against the program after the lock is released.
pub struct Supervisor {
    table: RwLock<ProgramTable>,
    events: broadcast::Sender<StatusEvent>,
    log_dir: PathBuf,
    shutdown_timeout: Duration,
}

impl Supervisor {
    pub fn new(log_dir: &Path, shutdown_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            table: RwLock::new(ProgramTable::default()),
            events,
            log_dir: log_dir.to_path_buf(),
            shutdown_timeout,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    #[instrument(skip_all, fields(program = %config.name))]
    pub async fn create_program(&self, config: ProgramConfig) -> Result<ProgramSummary, ControlError> {
        config.validate()?;
        if self.table.read().programs.contains_key(&config.name) {
            return Err(ControlError::DuplicateName(config.name));
        }

        let program = Program::create(config.clone(), &self.log_dir, self.events.clone())
            .await
            .map_err(|err| {
                error!(?err, "Failed to open program log");
                ControlError::InvalidConfig(crate::error::ConfigError::Invalid {
                    program: config.name.clone(),
                    reason: format!("cannot open log file: {err}"),
                })
            })?;
        let program = Arc::new(program);

        let inserted = {
            let mut table = self.table.write();
            if table.programs.contains_key(&config.name) {
                false
            } else {
                table.order.push(config.name.clone());
                table.programs.insert(config.name.clone(), Arc::clone(&program));
                true
            }
        };
        if !inserted {
            // Lost a race against another create with the same name.
            program.close().await;
            return Err(ControlError::DuplicateName(config.name));
        }

        info!("Program created");
        Ok(summarize(&program))
    }

    #[instrument(skip(self))]
    pub async fn remove_program(&self, name: &str) -> Result<(), ControlError> {
        let program = {
            let mut table = self.table.write();
            let program = table
                .programs
                .get(name)
                .ok_or_else(|| ControlError::NotFound(name.to_string()))?;
            if !program.state().is_terminal() {
                return Err(ControlError::StillRunning(name.to_string()));
            }
            table.order.retain(|entry| entry != name);
            table.programs.remove(name)
        };
        if let Some(program) = program {
            program.close().await;
        }
        info!("Program removed");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<Program>, ControlError> {
        self.table
            .read()
            .programs
            .get(name)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(name.to_string()))
    }

    pub fn status(&self, name: &str) -> Result<ProgramSummary, ControlError> {
        self.get(name).map(|program| summarize(&program))
    }

    /// Programs in creation order.
    pub fn list(&self) -> Vec<ProgramSummary> {
        let table = self.table.read();
        table
            .order
            .iter()
            .filter_map(|name| table.programs.get(name))
            .map(|program| summarize(program))
            .collect()
    }

    pub fn statuses(&self) -> Vec<ProgramStatus> {
        self.programs().iter().map(|program| program.status()).collect()
    }

    pub async fn start(&self, name: &str) -> Result<ProgramState, ControlError> {
        self.control(name, Control::Start).await
    }

    pub async fn stop(&self, name: &str) -> Result<ProgramState, ControlError> {
        self.control(name, Control::Stop).await
    }

    pub async fn restart(&self, name: &str) -> Result<ProgramState, ControlError> {
        self.control(name, Control::Restart).await
    }

    pub async fn control(&self, name: &str, control: Control) -> Result<ProgramState, ControlError> {
        let program = self.get(name)?;
        program.control(control).await
    }

    pub fn tail_log(&self, name: &str, lines: usize, follow: bool) -> Result<LogTail, ControlError> {
        Ok(self.get(name)?.tail(lines, follow))
    }

    /// Starts every program flagged `autostart`, all at once. Failures are
    /// logged per program.
    pub async fn auto_start_all(&self) {
        let programs: Vec<_> = self
            .programs()
            .into_iter()
            .filter(|program| program.config().autostart)
            .collect();
        info!("Auto starting {} programs", programs.len());
        join_all(programs.iter().map(|program| async move {
            match program.start().await {
                Ok(state) => info!(program = program.name(), %state, "Auto started"),
                Err(err) => warn!(?err, program = program.name(), "Auto start failed"),
            }
        }))
        .await;
    }

    /// Stops every live program, force killing whatever is still alive once
    /// the shutdown timeout expires. Returns the number of programs that had
    /// to be killed.
    #[instrument(skip(self))]
    pub async fn kill_all(&self) -> usize {
        let live: Vec<_> = self
            .programs()
            .into_iter()
            .filter(|program| !program.state().is_terminal())
            .collect();
        info!("Stopping {} programs", live.len());

        let stopping = join_all(live.iter().map(|program| async move {
            if let Err(err) = program.stop().await {
                // Raced with a natural exit.
                info!(?err, program = program.name(), "Stop not needed");
            }
            program.wait_terminal().await
        }));
        if tokio::time::timeout(self.shutdown_timeout, stopping).await.is_ok() {
            return 0;
        }

        let mut killed = 0;
        for program in &live {
            if !program.state().is_terminal() {
                warn!(program = program.name(), "Shutdown timeout reached, killing");
                program.kill();
                killed += 1;
            }
        }
        killed
    }

    /// Stops everything, then closes program tasks and log files.
    pub async fn shutdown(&self) {
        let killed = self.kill_all().await;
        if killed > 0 {
            warn!(killed, "Programs were force killed on shutdown");
        }
        for program in self.programs() {
            program.close().await;
        }
        info!("Supervisor stopped");
    }

    fn programs(&self) -> Vec<Arc<Program>> {
        let table = self.table.read();
        table
            .order
            .iter()
            .filter_map(|name| table.programs.get(name).cloned())
            .collect()
    }
}

fn summarize(program: &Program) -> ProgramSummary {
    ProgramSummary {
        config: program.config().clone(),
        status: program.status(),
    }
}
