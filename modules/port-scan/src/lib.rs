//! Two-stage port scan: one sweep over the whole host batch, then a
//! service probe for every surviving host:port, merged in place.

use port_sweep::PortSweep;
use recon_core::input::Targets;
use recon_core::{Result, ScanResult};
use serde::Deserialize;
use service_probe::ServiceProbe;
use std::collections::BTreeSet;
use tracing::{info, warn, Span};

/// What to do when the probe tool fails for one host:port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeFailurePolicy {
    /// Fail the whole scan with the tool error.
    #[default]
    Abort,
    /// Log and keep the port without probe enrichment.
    Skip,
}

pub struct PortScan {
    sweep: PortSweep,
    probe: ServiceProbe,
    on_probe_failure: ProbeFailurePolicy,
    log: Span,
}

impl PortScan {
    pub fn new(sweep: PortSweep, probe: ServiceProbe, on_probe_failure: ProbeFailurePolicy, log: Span) -> Self {
        PortScan { sweep, probe, on_probe_failure, log }
    }

    pub async fn scan(&self, targets: impl Into<Targets>, excluded: &BTreeSet<u16>) -> Result<ScanResult> {
        let hosts = targets.into().into_hosts()?;
        info!(parent: &self.log, hosts = hosts.len(), "starting port scan");

        let mut result = self.sweep.sweep(&hosts, excluded).await?;

        for (host, ports) in result.iter_mut() {
            for (port, record) in ports.iter_mut() {
                match self.probe.probe(host, *port).await {
                    Ok(report) => record.apply_probe(report.service_version, report.banner),
                    Err(e) if e.is_tool_failure() && self.on_probe_failure == ProbeFailurePolicy::Skip => {
                        warn!(parent: &self.log, host = host.as_str(), port = *port, error = %e, "probe failed, keeping sweep data only");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        info!(parent: &self.log, hosts = result.len(), "port scan finished");
        Ok(result)
    }
}
