//! Normalization of caller-supplied hosts and port selections. Everything
//! here runs before any network or process activity.

use crate::{Host, ReconError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One host or a list of hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Targets {
    One(String),
    Many(Vec<String>),
}

impl Targets {
    /// Validate and flatten into a duplicate-free host list, keeping input order.
    pub fn into_hosts(self) -> Result<Vec<Host>> {
        let raw = match self {
            Targets::One(h) => vec![h],
            Targets::Many(v) => v,
        };
        let mut seen = BTreeSet::new();
        let mut hosts = Vec::with_capacity(raw.len());
        for h in raw {
            validate_host(&h)?;
            if seen.insert(h.clone()) {
                hosts.push(h);
            }
        }
        if hosts.is_empty() {
            return Err(ReconError::Validation("no hosts given".into()));
        }
        Ok(hosts)
    }
}

impl From<&str> for Targets {
    fn from(s: &str) -> Self {
        Targets::One(s.to_string())
    }
}

impl From<Vec<String>> for Targets {
    fn from(v: Vec<String>) -> Self {
        Targets::Many(v)
    }
}

impl From<Vec<&str>> for Targets {
    fn from(v: Vec<&str>) -> Self {
        Targets::Many(v.into_iter().map(str::to_string).collect())
    }
}

/// Hosts are passed to external tools as single arguments; reject anything
/// that could be read as an option or split into several words.
pub fn validate_host(host: &str) -> Result<()> {
    if host.is_empty() {
        return Err(ReconError::Validation("empty host".into()));
    }
    if host.starts_with('-') {
        return Err(ReconError::Validation(format!("host must not start with '-': {host}")));
    }
    if host.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ReconError::Validation(format!("host contains whitespace: {host:?}")));
    }
    Ok(())
}

/// A single port or a list of ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    One(u16),
    Many(Vec<u16>),
}

impl From<u16> for PortSpec {
    fn from(p: u16) -> Self {
        PortSpec::One(p)
    }
}

impl From<Vec<u16>> for PortSpec {
    fn from(v: Vec<u16>) -> Self {
        PortSpec::Many(v)
    }
}

/// `None` becomes the empty set, a bare port a singleton.
pub fn normalize_ports(spec: Option<PortSpec>) -> Result<BTreeSet<u16>> {
    let ports = match spec {
        None => Vec::new(),
        Some(PortSpec::One(p)) => vec![p],
        Some(PortSpec::Many(v)) => v,
    };
    if ports.contains(&0) {
        return Err(ReconError::Validation("port 0 is not a valid port".into()));
    }
    Ok(ports.into_iter().collect())
}

/// Parse a comma-separated list of ports/ranges (e.g., "22,80,443", "1-1024,8080").
pub fn parse_ports(spec: &str) -> Result<Vec<u16>> {
    let bad = |part: &str| ReconError::Validation(format!("invalid port: {part}"));
    let mut ports = Vec::new();
    for part in spec.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let s: u16 = start.trim().parse().map_err(|_| bad(part))?;
            let e: u16 = end.trim().parse().map_err(|_| bad(part))?;
            if s == 0 || e == 0 || s > e {
                return Err(ReconError::Validation(format!("invalid port range: {part}")));
            }
            ports.extend(s..=e);
        } else {
            let p: u16 = part.parse().map_err(|_| bad(part))?;
            if p == 0 {
                return Err(bad(part));
            }
            ports.push(p);
        }
    }
    ports.sort_unstable();
    ports.dedup();
    Ok(ports)
}
