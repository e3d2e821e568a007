//! Per-port deep probe (nmap `-sV` with the banner script) and the parser
//! for its normal-format report.

use recon_core::error::ToolKind;
use recon_core::tool::{Artifact, Invocation, ToolRunner};
use recon_core::{Banner, BannerMode, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Span};

pub const BANNER_MARKER: &str = "|_banner: ";
pub const HTTP_HEADER_MARKER: &str = "|_http-server-header: ";

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub program: String,
    pub work_dir: PathBuf,
    pub timeout: Duration,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        ProbeOptions { program: "nmap".into(), work_dir: std::env::temp_dir(), timeout: Duration::from_secs(300) }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub service_version: Option<String>,
    pub banner: Option<Banner>,
}

pub struct ServiceProbe {
    runner: Arc<dyn ToolRunner>,
    opts: ProbeOptions,
    log: Span,
}

impl ServiceProbe {
    pub fn new(runner: Arc<dyn ToolRunner>, opts: ProbeOptions, log: Span) -> Self {
        ServiceProbe { runner, opts, log }
    }

    pub async fn probe(&self, host: &str, port: u16) -> Result<ProbeReport> {
        info!(parent: &self.log, host, port, "probing service");
        let report = Artifact::new(&self.opts.work_dir, "probe-report", "txt", self.log.clone());
        self.runner.run(&self.invocation(host, port, report.path())).await?;

        let text = tokio::fs::read_to_string(report.path()).await?;
        let parsed = parse_report(&text, port);
        info!(
            parent: &self.log,
            host,
            port,
            version = parsed.service_version.as_deref().unwrap_or("-"),
            banner = parsed.banner.is_some(),
            "probe finished"
        );
        Ok(parsed)
    }

    pub fn invocation(&self, host: &str, port: u16, report: &Path) -> Invocation {
        Invocation {
            tool: ToolKind::Probe,
            program: self.opts.program.clone(),
            args: vec![
                host.to_string(),
                "--script=banner".into(),
                "-sV".into(),
                "-p".into(),
                port.to_string(),
                "-oN".into(),
                report.display().to_string(),
            ],
            output: report.to_path_buf(),
            timeout: self.opts.timeout,
        }
    }
}

/// Scan report lines in order, stopping as soon as both a version and a
/// banner are known. A later banner line replaces an earlier one.
pub fn parse_report(text: &str, port: u16) -> ProbeReport {
    let port_prefix = format!("{port}/");
    let mut out = ProbeReport::default();
    for line in text.lines() {
        if line.starts_with(&port_prefix) && line.contains("open") {
            if let Some(tok) = line.split_whitespace().nth(3) {
                out.service_version = Some(tok.to_string());
            }
        }
        if let Some(rest) = line.strip_prefix(BANNER_MARKER) {
            out.banner = Some(Banner { mode: BannerMode::Banner, text: rest.trim_end().to_string() });
        } else if let Some(rest) = line.strip_prefix(HTTP_HEADER_MARKER) {
            out.banner = Some(Banner { mode: BannerMode::HttpHeader, text: rest.trim_end().to_string() });
        }
        if out.service_version.is_some() && out.banner.is_some() {
            break;
        }
    }
    out
}
