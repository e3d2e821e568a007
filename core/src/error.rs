use std::fmt;
use std::io;
use thiserror::Error;

/// Which external tool an invocation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Sweep,
    Probe,
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolKind::Sweep => f.write_str("sweep"),
            ToolKind::Probe => f.write_str("probe"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ReconError {
    #[error("{tool} tool exited with status {status:?}: {stderr}")]
    ToolFailure {
        tool: ToolKind,
        status: Option<i32>,
        stderr: String,
    },

    #[error("failed to launch {tool} tool `{program}`: {source}")]
    ToolLaunch {
        tool: ToolKind,
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} tool did not finish within {secs}s")]
    ToolTimeout { tool: ToolKind, secs: u64 },

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("http client error: {0}")]
    Http(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("task did not complete: {0}")]
    Task(String),
}

impl ReconError {
    pub fn is_tool_failure(&self) -> bool {
        matches!(
            self,
            ReconError::ToolFailure { .. } | ReconError::ToolLaunch { .. } | ReconError::ToolTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ReconError>;
