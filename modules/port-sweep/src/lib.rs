//! Fast multi-host sweep over a fixed candidate port set (masscan), and the
//! parser for its greppable (`-oG`) output.

use recon_core::error::ToolKind;
use recon_core::tool::{Artifact, Invocation, ToolRunner};
use recon_core::{exclude_ports, Host, PortRecord, Result, ScanResult};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, Span};

/// Ports swept when none are configured.
pub const CANDIDATE_PORTS: &[u16] = &[80, 8080, 443, 22, 21, 49123, 53301];

const TIMESTAMP_MARKER: &str = "Timestamp: ";

#[derive(Debug, Clone)]
pub struct SweepOptions {
    pub program: String,
    /// Packets per second handed to the tool.
    pub rate: u32,
    pub ports: Vec<u16>,
    /// Directory for the host list and the tool's report.
    pub work_dir: PathBuf,
    pub timeout: Duration,
}

impl Default for SweepOptions {
    fn default() -> Self {
        SweepOptions {
            program: "masscan".into(),
            rate: 1000,
            ports: CANDIDATE_PORTS.to_vec(),
            work_dir: std::env::temp_dir(),
            timeout: Duration::from_secs(600),
        }
    }
}

pub struct PortSweep {
    runner: Arc<dyn ToolRunner>,
    opts: SweepOptions,
    log: Span,
}

impl PortSweep {
    pub fn new(runner: Arc<dyn ToolRunner>, opts: SweepOptions, log: Span) -> Self {
        PortSweep { runner, opts, log }
    }

    /// Sweep all hosts in one tool run, then drop `excluded` ports from every host.
    pub async fn sweep(&self, hosts: &[Host], excluded: &BTreeSet<u16>) -> Result<ScanResult> {
        info!(parent: &self.log, hosts = hosts.len(), excluded = excluded.len(), "starting sweep");

        // both files are removed when these guards drop, on every path out
        let input = Artifact::new(&self.opts.work_dir, "sweep-input", "txt", self.log.clone());
        let output = Artifact::new(&self.opts.work_dir, "sweep-output", "txt", self.log.clone());

        let mut list = hosts.join("\n");
        list.push('\n');
        tokio::fs::write(input.path(), list).await?;

        self.runner.run(&self.invocation(input.path(), output.path())).await?;

        let text = match tokio::fs::read_to_string(output.path()).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(parent: &self.log, "sweep wrote no report");
                String::new()
            }
            Err(e) => return Err(e.into()),
        };

        let mut result = parse_grepable(&text, &self.log);
        exclude_ports(&mut result, excluded);

        let open: usize = result.values().map(|p| p.len()).sum();
        info!(parent: &self.log, hosts = result.len(), open, "sweep finished");
        Ok(result)
    }

    pub fn invocation(&self, input: &Path, output: &Path) -> Invocation {
        let ports = self.opts.ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(",");
        Invocation {
            tool: ToolKind::Sweep,
            program: self.opts.program.clone(),
            args: vec![
                "-iL".into(),
                input.display().to_string(),
                "-p".into(),
                ports,
                "-oG".into(),
                output.display().to_string(),
                "--rate".into(),
                self.opts.rate.to_string(),
            ],
            output: output.to_path_buf(),
            timeout: self.opts.timeout,
        }
    }
}

/// Parse a greppable report. Only lines starting with the timestamp marker
/// count; everything else is skipped.
pub fn parse_grepable(text: &str, log: &Span) -> ScanResult {
    let mut out = ScanResult::new();
    for line in text.lines() {
        if !line.starts_with(TIMESTAMP_MARKER) {
            continue;
        }
        match parse_line(line) {
            Some((host, port, rec)) => {
                out.entry(host).or_default().insert(port, rec);
            }
            None => debug!(parent: log, line, "skipping malformed sweep line"),
        }
    }
    out
}

/// `Timestamp: T<TAB>Host: H (name)<TAB>Ports: P/state/transport/owner/service/...`
fn parse_line(line: &str) -> Option<(Host, u16, PortRecord)> {
    let rest = line.trim_end_matches(['\r', '\n']).strip_prefix(TIMESTAMP_MARKER)?;
    let mut fields = rest.split('\t');

    let timestamp = fields.next()?.trim();
    let host = fields.next()?.trim().strip_prefix("Host:")?.split_whitespace().next()?;
    let ports = fields.next()?.trim().strip_prefix("Ports:")?.trim();

    let mut parts = ports.split('/');
    let port: u16 = parts.next()?.trim().parse().ok().filter(|p| *p != 0)?;
    let _state = parts.next()?;
    let transport = parts.next().map(str::trim).filter(|s| !s.is_empty())?;
    let _owner = parts.next();
    let service = parts.next().map(str::trim).filter(|s| !s.is_empty()).map(String::from);

    Some((host.to_string(), port, PortRecord::swept(transport, service, timestamp)))
}
