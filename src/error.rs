use crate::process::types::{Control, ProgramState};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("program {program}: {reason}")]
    Invalid { program: String, reason: String },
    #[error("program {0} is defined more than once")]
    Duplicate(String),
}

/// Reasons a child process could not be created.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("executable not found: {command}")]
    NotFound { command: String },
    #[error("permission denied: {command}")]
    PermissionDenied { command: String },
    #[error("out of resources spawning {command}: {source}")]
    ResourceExhausted {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid launch configuration: {0}")]
    Invalid(String),
    #[error("failed to spawn {command}: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl SpawnError {
    /// Transient failures are retried after the longest backoff delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, SpawnError::ResourceExhausted { .. })
    }

    pub(crate) fn from_io(command: &str, err: std::io::Error) -> Self {
        use nix::errno::Errno;
        use std::io::ErrorKind;

        let command = command.to_string();
        match err.kind() {
            ErrorKind::NotFound => return SpawnError::NotFound { command },
            ErrorKind::PermissionDenied => return SpawnError::PermissionDenied { command },
            _ => {}
        }
        match err.raw_os_error().map(Errno::from_i32) {
            Some(Errno::EAGAIN | Errno::ENOMEM | Errno::EMFILE | Errno::ENFILE) => {
                SpawnError::ResourceExhausted {
                    command,
                    source: err,
                }
            }
            _ => SpawnError::Io {
                command,
                source: err,
            },
        }
    }
}

#[derive(Debug, Error)]
#[error("process is not running")]
pub struct NotRunning;

/// Errors returned synchronously from supervisor operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("program {0} not found")]
    NotFound(String),
    #[error("program {0} already exists")]
    DuplicateName(String),
    #[error("program {program} cannot {control} while {state}")]
    InvalidTransition {
        program: String,
        state: ProgramState,
        control: Control,
    },
    #[error("program {0} must be stopped first")]
    StillRunning(String),
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
    #[error("program {0} is shutting down")]
    Unavailable(String),
}

impl ControlError {
    pub fn code(&self) -> i32 {
        match self {
            ControlError::NotFound(_) => 1,
            ControlError::DuplicateName(_) => 2,
            ControlError::InvalidTransition { .. } => 3,
            ControlError::StillRunning(_) => 4,
            ControlError::InvalidConfig(_) => 5,
            ControlError::Unavailable(_) => 6,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    #[error("peer {peer} unreachable: {reason}")]
    Unreachable { peer: String, reason: String },
    #[error("peer {peer} timed out")]
    Timeout { peer: String },
    #[error("invalid program name {0:?}")]
    InvalidProgram(String),
    #[error("peer {peer} answered {code}: {message}")]
    Remote {
        peer: String,
        code: i32,
        message: String,
    },
}

impl PeerError {
    pub fn code(&self) -> i32 {
        match self {
            PeerError::InvalidProgram(_) => 8,
            PeerError::UnknownPeer(_) => 10,
            PeerError::Unreachable { .. } => 11,
            PeerError::Timeout { .. } => 12,
            PeerError::Remote { .. } => 13,
        }
    }
}
