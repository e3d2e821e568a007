//! Result persistence: one pretty JSON document per host, and an optional
//! flat CSV summary.

use recon_core::{BannerMode, Result, ScanResult};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use std::io;
use std::path::{Path, PathBuf};

/// JSON with four-space indentation.
pub fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut ser)?;
    Ok(buf)
}

/// Write `{output}/{host}.json` for every host. Returns the written paths.
pub async fn persist_hosts(result: &ScanResult, output: &Path) -> Result<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(result.len());
    for (host, ports) in result {
        let file = output.join(format!("{host}.json"));
        tokio::fs::write(&file, to_pretty_json(ports)?).await?;
        written.push(file);
    }
    Ok(written)
}

fn mode_label(mode: Option<BannerMode>) -> &'static str {
    match mode {
        Some(BannerMode::Banner) => "banner",
        Some(BannerMode::HttpHeader) => "http-header",
        None => "",
    }
}

/// One row per host:port.
pub fn write_summary(result: &ScanResult, path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path).map_err(io::Error::from)?;
    wtr.write_record([
        "host",
        "port",
        "protocol",
        "service",
        "service_version",
        "banner",
        "mode",
        "endpoints",
        "certificate_cn",
    ])
    .map_err(io::Error::from)?;
    for (host, ports) in result {
        for (port, rec) in ports {
            let cn = rec.certificate.as_ref().and_then(|c| c.subject.get("CN").cloned());
            wtr.write_record([
                host.clone(),
                port.to_string(),
                rec.protocol.clone().unwrap_or_default(),
                rec.service.clone().unwrap_or_default(),
                rec.service_version.clone().unwrap_or_default(),
                rec.banner.clone().unwrap_or_default(),
                mode_label(rec.mode).to_string(),
                rec.endpoints.as_ref().map(|e| e.len()).unwrap_or(0).to_string(),
                cn.unwrap_or_default(),
            ])
            .map_err(io::Error::from)?;
        }
    }
    wtr.flush()?;
    Ok(())
}
