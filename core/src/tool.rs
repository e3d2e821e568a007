//! External tool invocation. Tools run from an argument vector (no shell)
//! with a deadline; every file a tool reads or writes is an [`Artifact`]
//! that removes itself when dropped.

use crate::error::ToolKind;
use crate::{ReconError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn, Span};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Invocation {
    pub tool: ToolKind,
    pub program: String,
    pub args: Vec<String>,
    /// File the tool is told to write its report to.
    pub output: PathBuf,
    pub timeout: Duration,
}

/// Seam between the runners and the operating system.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run to completion. `Ok` only for a zero exit status.
    async fn run(&self, inv: &Invocation) -> Result<()>;
}

/// Runs tools as child processes.
pub struct ProcessRunner {
    log: Span,
}

impl ProcessRunner {
    pub fn new(log: Span) -> Self {
        ProcessRunner { log }
    }
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, inv: &Invocation) -> Result<()> {
        debug!(parent: &self.log, tool = %inv.tool, program = %inv.program, args = ?inv.args, "launching tool");
        let mut cmd = Command::new(&inv.program);
        cmd.args(&inv.args).stdin(Stdio::null()).kill_on_drop(true);

        let output = match timeout(inv.timeout, cmd.output()).await {
            Err(_) => {
                return Err(ReconError::ToolTimeout { tool: inv.tool, secs: inv.timeout.as_secs() });
            }
            Ok(Err(source)) => {
                return Err(ReconError::ToolLaunch { tool: inv.tool, program: inv.program.clone(), source });
            }
            Ok(Ok(out)) => out,
        };

        if !output.status.success() {
            return Err(ReconError::ToolFailure {
                tool: inv.tool,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(parent: &self.log, tool = %inv.tool, "tool finished");
        Ok(())
    }
}

/// A transient file scoped to one tool invocation. Names are unique per
/// instance, so overlapping runs never share a file.
#[derive(Debug)]
pub struct Artifact {
    path: PathBuf,
    log: Span,
}

impl Artifact {
    pub fn new(dir: &Path, prefix: &str, ext: &str, log: Span) -> Self {
        let path = dir.join(format!("{prefix}-{}.{ext}", Uuid::now_v7()));
        Artifact { path, log }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Artifact {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(parent: &self.log, path = %self.path.display(), error = %e, "failed to remove artifact"),
        }
    }
}
