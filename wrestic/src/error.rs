use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResticError {
    #[error("failed to start `{path}`: {source}")]
    Startup {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with code {code}")]
    Execution { command: String, code: i32 },

    #[error("`{command}` was terminated by a signal")]
    Terminated { command: String },

    #[error("`{command}` was cancelled")]
    Cancelled { command: String },

    #[error("stream failure in {stage}: {source}")]
    Stream {
        stage: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("cannot decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("no snapshots available")]
    NoSnapshots,

    #[error("no snapshot found with ID {0}")]
    SnapshotNotFound(String),

    #[error("snapshot ID {prefix} is ambiguous, it matches {matches} snapshots")]
    AmbiguousSnapshot { prefix: String, matches: usize },

    #[error("restore reported {0} unignored errors")]
    RestoreFailures(usize),

    #[error("object storage: {0}")]
    ObjectStorage(String),

    #[error("kubernetes: {0}")]
    Kubernetes(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ResticError {
    pub fn stream(stage: &'static str, source: io::Error) -> Self {
        ResticError::Stream { stage, source }
    }

    pub fn decode(what: &'static str, source: serde_json::Error) -> Self {
        ResticError::Decode { what, source }
    }
}

pub type Result<T> = std::result::Result<T, ResticError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("the restore type '{0}' is unknown")]
    UnknownRestoreType(String),

    #[error("if the restore type is set to '{restore_type}', then the {what} must be defined")]
    MissingRestoreSetting {
        restore_type: &'static str,
        what: &'static str,
    },

    #[error("the duration '{value}' of the argument {arg} is not valid")]
    InvalidDuration { arg: &'static str, value: String },

    #[error("the duration '{value}' of the argument {arg} must be positive")]
    EmptyDuration { arg: &'static str, value: String },

    #[error("{0}")]
    Multiple(String),
}

impl ConfigError {
    pub fn from_all(mut errors: Vec<ConfigError>) -> Option<ConfigError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(ConfigError::Multiple(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )),
        }
    }
}
