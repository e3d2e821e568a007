use api_crawler::CrawlOptions;
use port_scan::ProbeFailurePolicy;
use port_sweep::{SweepOptions, CANDIDATE_PORTS};
use recon_core::input::{normalize_ports, PortSpec, Targets};
use recon_core::{parse_endpoints, EndpointMap, ReconError, Result};
use serde::Deserialize;
use service_probe::ProbeOptions;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG: &str = "recon.yaml";

#[derive(Debug, Default, Deserialize, Clone)]
pub struct SweepConfig {
    pub program: Option<String>,
    pub rate: Option<u32>,
    pub ports: Option<PortSpec>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct ProbeConfig {
    pub program: Option<String>,
    pub timeout_secs: Option<u64>,
    pub on_failure: Option<ProbeFailurePolicy>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct CrawlConfig {
    pub timeout_ms: Option<u64>,
    pub redirects: Option<usize>,
    pub user_agent: Option<String>,
    pub qps: Option<u32>,
    pub concurrency: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct ScanConfig {
    pub targets: Option<Targets>,
    /// Seed endpoint descriptor file (JSON).
    pub endpoints: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub crawl_ports: Option<PortSpec>,
    pub excl_ports: Option<PortSpec>,
    pub save_output: Option<bool>,
    /// Where transient tool artifacts go.
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct TlsConfig {
    /// Swept ports that get a certificate lookup. Empty disables it.
    pub ports: Option<Vec<u16>>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct LastSeenConfig {
    pub path: Option<PathBuf>,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub sweep: SweepConfig,
    pub probe: ProbeConfig,
    pub crawl: CrawlConfig,
    pub scan: ScanConfig,
    pub tls: TlsConfig,
    pub last_seen: LastSeenConfig,
}

impl Config {
    pub fn work_dir(&self) -> PathBuf {
        self.scan.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn sweep_options(&self) -> Result<SweepOptions> {
        let d = SweepOptions::default();
        let ports = normalize_ports(self.sweep.ports.clone())?;
        Ok(SweepOptions {
            program: self.sweep.program.clone().unwrap_or(d.program),
            rate: self.sweep.rate.unwrap_or(d.rate),
            ports: if ports.is_empty() { CANDIDATE_PORTS.to_vec() } else { ports.into_iter().collect() },
            work_dir: self.work_dir(),
            timeout: self.sweep.timeout_secs.map(Duration::from_secs).unwrap_or(d.timeout),
        })
    }

    pub fn probe_options(&self) -> ProbeOptions {
        let d = ProbeOptions::default();
        ProbeOptions {
            program: self.probe.program.clone().unwrap_or(d.program),
            work_dir: self.work_dir(),
            timeout: self.probe.timeout_secs.map(Duration::from_secs).unwrap_or(d.timeout),
        }
    }

    pub fn crawl_options(&self) -> CrawlOptions {
        let d = CrawlOptions::default();
        CrawlOptions {
            timeout_ms: self.crawl.timeout_ms.unwrap_or(d.timeout_ms),
            redirects: self.crawl.redirects.unwrap_or(d.redirects),
            user_agent: self.crawl.user_agent.clone().unwrap_or(d.user_agent),
            qps: self.crawl.qps.unwrap_or(d.qps),
        }
    }

    pub fn tls_ports(&self) -> BTreeSet<u16> {
        self.tls.ports.clone().unwrap_or_else(|| vec![443]).into_iter().collect()
    }

    pub fn tls_timeout(&self) -> Duration {
        Duration::from_millis(self.tls.timeout_ms.unwrap_or(5000))
    }
}

/// Load `path`, or `./recon.yaml` when no path is given. A missing default
/// file yields the built-in defaults; a missing explicit file is an error.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG);
            if p.exists() { p.to_path_buf() } else { return Ok(Config::default()); }
        }
    };
    let s = fs::read_to_string(&path)?;
    parse_config(&s).map_err(|e| ReconError::Validation(format!("{}: {e}", path.display())))
}

fn parse_config(s: &str) -> std::result::Result<Config, serde_yaml::Error> {
    if s.trim().is_empty() {
        return Ok(Config::default());
    }
    serde_yaml::from_str(s)
}

pub fn load_endpoints(path: &Path) -> Result<EndpointMap> {
    parse_endpoints(&fs::read_to_string(path)?)
}
