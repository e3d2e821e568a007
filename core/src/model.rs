//! Scan data model. Records are filled in progressively: the sweep creates
//! [`PortRecord`]s, the probe adds version and banner, the crawler attaches
//! [`EndpointRecord`]s.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

pub type Host = String;
/// Endpoint path -> record, for one host:port.
pub type EndpointMap = BTreeMap<String, EndpointRecord>;
pub type HostPorts = BTreeMap<u16, PortRecord>;
pub type ScanResult = BTreeMap<Host, HostPorts>;

/// Evidence source of a banner string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BannerMode {
    Banner,
    HttpHeader,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Banner {
    pub mode: BannerMode,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortRecord {
    /// Transport label reported by the sweep (`tcp`, `udp`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Service guess reported by the sweep, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<BannerMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<EndpointMap>,
}

impl PortRecord {
    pub fn swept(protocol: impl Into<String>, service: Option<String>, timestamp: impl Into<String>) -> Self {
        PortRecord {
            protocol: Some(protocol.into()),
            service,
            timestamp: Some(timestamp.into()),
            ..Default::default()
        }
    }

    /// Merge probe findings into this record in place.
    pub fn apply_probe(&mut self, service_version: Option<String>, banner: Option<Banner>) {
        self.service_version = service_version;
        match banner {
            Some(b) => {
                self.mode = Some(b.mode);
                self.banner = Some(b.text);
            }
            None => {
                self.mode = None;
                self.banner = None;
            }
        }
    }
}

/// HTTP method of an endpoint descriptor. Unsupported values are kept
/// verbatim so the crawler can report and reject them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum HttpMethod {
    Get,
    Post,
    Unsupported(String),
}

impl From<String> for HttpMethod {
    fn from(s: String) -> Self {
        match s.as_str() {
            "GET" => HttpMethod::Get,
            "POST" => HttpMethod::Post,
            _ => HttpMethod::Unsupported(s),
        }
    }
}

impl From<HttpMethod> for String {
    fn from(m: HttpMethod) -> Self {
        m.to_string()
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => f.write_str("GET"),
            HttpMethod::Post => f.write_str("POST"),
            HttpMethod::Unsupported(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRecord {
    /// Artifact number, unique within one crawl of a host:port.
    pub num: u32,
    pub method: HttpMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Status the first response must carry. Cleared once validated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    /// Saved response body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl EndpointRecord {
    pub fn seed(num: u32, method: HttpMethod, expected_status_code: u16) -> Self {
        EndpointRecord {
            num,
            method,
            data: None,
            expected_status_code: Some(expected_status_code),
            status_code: None,
            headers: None,
            path: None,
            sha256: None,
        }
    }

    /// A link found while crawling: always `GET`, expecting 200.
    pub fn discovered(num: u32) -> Self {
        EndpointRecord::seed(num, HttpMethod::Get, 200)
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn accepts(&self, status: u16) -> bool {
        self.expected_status_code == Some(status) || self.status_code == Some(status)
    }

    pub fn is_resolved(&self) -> bool {
        self.path.is_some()
    }

    pub fn resolve(&mut self, status: u16, headers: BTreeMap<String, String>, path: PathBuf, sha256: String) {
        self.expected_status_code = None;
        self.status_code = Some(status);
        self.headers = Some(headers);
        self.path = Some(path);
        self.sha256 = Some(sha256);
    }
}

/// TLS certificate metadata of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertInfo {
    pub subject: BTreeMap<String, String>,
    pub issuer: BTreeMap<String, String>,
    pub serial_number: String,
    pub version: u32,
    pub not_before: String,
    pub not_after: String,
}

/// Drop every excluded port from every host.
pub fn exclude_ports(result: &mut ScanResult, excluded: &BTreeSet<u16>) {
    if excluded.is_empty() {
        return;
    }
    for ports in result.values_mut() {
        ports.retain(|port, _| !excluded.contains(port));
    }
}

/// Parse a seed descriptor document: `{"/path": {"num": 1, "method": "GET", ...}}`.
pub fn parse_endpoints(json: &str) -> crate::Result<EndpointMap> {
    Ok(serde_json::from_str(json)?)
}
