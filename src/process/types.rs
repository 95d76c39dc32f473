use super::run::ProcessHandle;
use crate::error::ControlError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgramState {
    Stopped,
    Starting,
    Running,
    Backoff,
    Stopping,
    Exited,
    Fatal,
}

impl ProgramState {
    /// No process and nothing scheduled.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProgramState::Stopped | ProgramState::Exited | ProgramState::Fatal
        )
    }
}

impl fmt::Display for ProgramState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProgramState::Stopped => "stopped",
            ProgramState::Starting => "starting",
            ProgramState::Running => "running",
            ProgramState::Backoff => "backoff",
            ProgramState::Stopping => "stopping",
            ProgramState::Exited => "exited",
            ProgramState::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Control {
    Start,
    Stop,
    Restart,
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Control::Start => "start",
            Control::Stop => "stop",
            Control::Restart => "restart",
        })
    }
}

impl FromStr for Control {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Control::Start),
            "stop" => Ok(Control::Stop),
            "restart" => Ok(Control::Restart),
            other => Err(format!("unknown action {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitKind {
    Code(i32),
    Signal(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitResult {
    pub kind: ExitKind,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl ExitResult {
    pub fn success(&self) -> bool {
        self.kind == ExitKind::Code(0)
    }
}

impl fmt::Display for ExitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ExitKind::Code(code) => write!(f, "exit code {code}")?,
            ExitKind::Signal(signal) => write!(f, "killed by signal {signal}")?,
        }
        write!(f, " after {}", humantime::format_duration(self.duration))
    }
}

/// Emitted once per state transition of a program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub program: String,
    pub from: ProgramState,
    pub to: ProgramState,
    pub timestamp: DateTime<Utc>,
    pub detail: Option<String>,
}

/// Snapshot of a program's runtime fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProgramStatus {
    pub name: String,
    pub state: ProgramState,
    pub pid: Option<u32>,
    pub last_exit: Option<ExitResult>,
    pub failures: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl ProgramStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ProgramState::Stopped,
            pid: None,
            last_exit: None,
            failures: 0,
            started_at: None,
            stopped_at: None,
        }
    }
}

pub type Reply = oneshot::Sender<Result<ProgramState, ControlError>>;

#[derive(Debug)]
pub enum Request {
    Control { control: Control, reply: Reply },
    /// Kill the live process, if any, without waiting for its exit.
    Kill,
    /// Kill the live process, if any, and end the owning task.
    Shutdown,
}

/// What happens once a stopping process is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterStop {
    Stay,
    Restart,
}

#[derive(Debug)]
pub enum Phase {
    Stopped,
    Starting {
        process: ProcessHandle,
        ready_at: Instant,
    },
    Running {
        process: ProcessHandle,
    },
    Backoff {
        retry_at: Instant,
    },
    Stopping {
        process: ProcessHandle,
        kill_at: Option<Instant>,
        then: AfterStop,
    },
    Exited,
    Fatal,
}

impl Phase {
    pub fn state(&self) -> ProgramState {
        match self {
            Phase::Stopped => ProgramState::Stopped,
            Phase::Starting { .. } => ProgramState::Starting,
            Phase::Running { .. } => ProgramState::Running,
            Phase::Backoff { .. } => ProgramState::Backoff,
            Phase::Stopping { .. } => ProgramState::Stopping,
            Phase::Exited => ProgramState::Exited,
            Phase::Fatal => ProgramState::Fatal,
        }
    }

    pub fn process(&self) -> Option<&ProcessHandle> {
        match self {
            Phase::Starting { process, .. }
            | Phase::Running { process }
            | Phase::Stopping { process, .. } => Some(process),
            _ => None,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self {
            Phase::Starting { ready_at, .. } => Some(*ready_at),
            Phase::Backoff { retry_at } => Some(*retry_at),
            Phase::Stopping { kill_at, .. } => *kill_at,
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum Event {
    Request(Request),
    ProcessExited { pid: u32, result: ExitResult },
    TimeoutReached,
    Closed,
}
