use crate::config::Config;
use crate::report::persist_hosts;
use api_crawler::ApiCrawler;
use port_scan::PortScan;
use port_sweep::PortSweep;
use recon_core::input::{normalize_ports, PortSpec, Targets};
use recon_core::tool::ToolRunner;
use recon_core::{EndpointMap, Host, ReconError, Result, ScanResult};
use service_probe::ServiceProbe;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tls_cert::CertRetriever;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, info_span, Span};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Crawls in flight at once; 1 runs them one after another.
    pub crawl_concurrency: usize,
    /// Swept ports whose certificate is recorded.
    pub tls_ports: BTreeSet<u16>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions { crawl_concurrency: 1, tls_ports: BTreeSet::from([443]) }
    }
}

pub struct ReconSession {
    scanner: PortScan,
    crawler: Arc<ApiCrawler>,
    certs: Option<CertRetriever>,
    opts: SessionOptions,
    log: Span,
}

impl ReconSession {
    pub fn new(
        scanner: PortScan,
        crawler: ApiCrawler,
        certs: Option<CertRetriever>,
        opts: SessionOptions,
        log: Span,
    ) -> Self {
        ReconSession { scanner, crawler: Arc::new(crawler), certs, opts, log }
    }

    /// Wire every stage from configuration. Each stage logs under its own
    /// child span of `log`. Must run inside a tokio runtime when crawl
    /// pacing is configured.
    pub fn from_config(cfg: &Config, runner: Arc<dyn ToolRunner>, log: Span) -> Result<Self> {
        let sweep = PortSweep::new(runner.clone(), cfg.sweep_options()?, info_span!(parent: &log, "sweep"));
        let probe = ServiceProbe::new(runner, cfg.probe_options(), info_span!(parent: &log, "probe"));
        let scanner = PortScan::new(
            sweep,
            probe,
            cfg.probe.on_failure.unwrap_or_default(),
            info_span!(parent: &log, "scan"),
        );
        let crawler = ApiCrawler::new(&cfg.crawl_options(), info_span!(parent: &log, "crawl"))?;
        let tls_ports = cfg.tls_ports();
        let certs = if tls_ports.is_empty() {
            None
        } else {
            Some(CertRetriever::new(cfg.tls_timeout(), info_span!(parent: &log, "tls"))?)
        };
        let opts = SessionOptions { crawl_concurrency: cfg.crawl.concurrency.unwrap_or(1), tls_ports };
        Ok(ReconSession::new(scanner, crawler, certs, opts, log))
    }

    /// Scan `targets`, crawl every discovered port plus every port in
    /// `crawl_ports` with `seeds`, and when `save_output` is set write one
    /// JSON file per host into `output`.
    pub async fn scan(
        &self,
        targets: impl Into<Targets>,
        seeds: &EndpointMap,
        output: &Path,
        crawl_ports: Option<PortSpec>,
        excl_ports: Option<PortSpec>,
        save_output: bool,
    ) -> Result<ScanResult> {
        let hosts = targets.into().into_hosts()?;
        let forced = normalize_ports(crawl_ports)?;
        let excluded = normalize_ports(excl_ports)?;

        tokio::fs::create_dir_all(output).await?;
        info!(
            parent: &self.log,
            hosts = hosts.len(),
            forced = ?forced,
            excluded = ?excluded,
            output = %output.display(),
            "recon session started"
        );

        let mut result = self.scanner.scan(hosts, &excluded).await?;
        self.attach_certificates(&mut result).await;
        self.crawl_all(&mut result, seeds, output, &forced).await?;

        if save_output {
            let written = persist_hosts(&result, output).await?;
            info!(parent: &self.log, files = written.len(), "host results saved");
        }
        Ok(result)
    }

    async fn attach_certificates(&self, result: &mut ScanResult) {
        let Some(certs) = &self.certs else { return };
        for (host, ports) in result.iter_mut() {
            for (port, record) in ports.iter_mut() {
                if self.opts.tls_ports.contains(port) {
                    record.certificate = certs.retrieve(host, *port).await;
                }
            }
        }
    }

    /// Crawls may overlap, but results are merged in (host, port) order.
    async fn crawl_all(
        &self,
        result: &mut ScanResult,
        seeds: &EndpointMap,
        output: &Path,
        forced: &BTreeSet<u16>,
    ) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.opts.crawl_concurrency.max(1)));
        let seeds = Arc::new(seeds.clone());
        let mut tasks = JoinSet::new();

        for (host, ports) in result.iter() {
            let visit: BTreeSet<u16> = ports.keys().chain(forced.iter()).copied().collect();
            for port in visit {
                let crawler = self.crawler.clone();
                let seeds = seeds.clone();
                let output = output.to_path_buf();
                let permits = permits.clone();
                let host = host.clone();
                tasks.spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    let endpoints = crawler.crawl(&host, port, &seeds, &output).await;
                    ((host, port), endpoints)
                });
            }
        }

        for ((host, port), endpoints) in join_all(tasks).await? {
            // forced ports that the sweep never reported get a bare record
            result.entry(host).or_default().entry(port).or_default().endpoints = Some(endpoints);
        }
        Ok(())
    }
}

/// Collect every task's output keyed by (host, port). The first task that
/// panics or is cancelled aborts the rest.
async fn join_all<T: Send + 'static>(mut tasks: JoinSet<((Host, u16), T)>) -> Result<BTreeMap<(Host, u16), T>> {
    let mut done = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((key, value)) => {
                done.insert(key, value);
            }
            Err(e) => {
                tasks.abort_all();
                return Err(ReconError::Task(format!("crawl: {e}")));
            }
        }
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use api_crawler::CrawlOptions;
    use async_trait::async_trait;
    use port_scan::ProbeFailurePolicy;
    use port_sweep::SweepOptions;
    use recon_core::error::ToolKind;
    use recon_core::tool::Invocation;
    use recon_core::{EndpointRecord, HostPorts, HttpMethod};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use service_probe::ProbeOptions;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const CERT_PEM: &str = include_str!("../../modules/tls-cert/testdata/device-cert.pem");
    const KEY_PEM: &str = include_str!("../../modules/tls-cert/testdata/device-key.pem");

    /// Reports the given open ports for 127.0.0.1 and a lighttpd probe for each.
    struct FakeTools {
        open: Vec<u16>,
        calls: Mutex<Vec<ToolKind>>,
    }

    #[async_trait]
    impl ToolRunner for FakeTools {
        async fn run(&self, inv: &Invocation) -> Result<()> {
            self.calls.lock().unwrap().push(inv.tool);
            let report = match inv.tool {
                ToolKind::Sweep => self
                    .open
                    .iter()
                    .map(|p| format!("Timestamp: 1700000000\tHost: 127.0.0.1 ()\tPorts: {p}/open/tcp//\n"))
                    .collect::<String>(),
                ToolKind::Probe => {
                    let port = &inv.args[4];
                    format!("{port}/tcp open  http    lighttpd 1.4.59\n|_http-server-header: lighttpd/1.4.59\n")
                }
            };
            std::fs::write(&inv.output, report)?;
            Ok(())
        }
    }

    /// Serves `/` linking to `/status`, and `/status` itself.
    async fn device() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match sock.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&buf).to_string();
                    let target = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let (status, ctype, body) = match target.as_str() {
                        "/" => (200, "text/html", r#"<a href="/status">status</a>"#),
                        "/status" => (200, "application/json", r#"{"up":true}"#),
                        _ => (404, "text/plain", "no"),
                    };
                    let resp = format!(
                        "HTTP/1.1 {status} OK\r\nContent-Type: {ctype}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                    let _ = sock.shutdown().await;
                });
            }
        });
        port
    }

    fn closed_port() -> u16 {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    }

    fn scratch() -> PathBuf {
        std::env::temp_dir().join(format!("recon-session-{}", uuid::Uuid::now_v7()))
    }

    /// TLS server presenting the self-signed camera certificate.
    async fn tls_device() -> u16 {
        let pem_der = |pem: &str| x509_parser::pem::parse_x509_pem(pem.as_bytes()).unwrap().1.contents;
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let cfg = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(
                vec![CertificateDer::from(pem_der(CERT_PEM))],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pem_der(KEY_PEM))),
            )
            .unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(cfg));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(mut tls) = acceptor.accept(sock).await {
                        let mut buf = [0u8; 64];
                        let _ = tls.read(&mut buf).await;
                        let _ = tls.shutdown().await;
                    }
                });
            }
        });
        port
    }

    fn session_with(
        tools: Arc<FakeTools>,
        concurrency: usize,
        certs: Option<CertRetriever>,
        tls_ports: BTreeSet<u16>,
    ) -> ReconSession {
        let sweep = PortSweep::new(tools.clone(), SweepOptions::default(), Span::none());
        let probe = ServiceProbe::new(tools, ProbeOptions::default(), Span::none());
        let scanner = PortScan::new(sweep, probe, ProbeFailurePolicy::Abort, Span::none());
        let crawler = ApiCrawler::new(&CrawlOptions::default(), Span::none()).unwrap();
        let opts = SessionOptions { crawl_concurrency: concurrency, tls_ports };
        ReconSession::new(scanner, crawler, certs, opts, Span::none())
    }

    fn session(tools: Arc<FakeTools>, concurrency: usize) -> ReconSession {
        session_with(tools, concurrency, None, BTreeSet::new())
    }

    fn seeds() -> EndpointMap {
        EndpointMap::from([("/".to_string(), EndpointRecord::seed(1, HttpMethod::Get, 200))])
    }

    #[tokio::test]
    async fn discovered_and_forced_ports_are_crawled_and_saved() {
        let swept = device().await;
        let forced = device().await;
        let dead = closed_port();
        let tools = Arc::new(FakeTools { open: vec![swept, dead], calls: Mutex::new(Vec::new()) });
        let out = scratch().join("nested");

        let res = session(tools.clone(), 2)
            .scan("127.0.0.1", &seeds(), &out, Some(forced.into()), None, true)
            .await
            .unwrap();

        let ports = &res["127.0.0.1"];
        assert_eq!(ports.keys().copied().collect::<BTreeSet<_>>(), BTreeSet::from([swept, dead, forced]));

        let web = &ports[&swept];
        assert_eq!(web.service_version.as_deref(), Some("lighttpd"));
        let eps = web.endpoints.as_ref().unwrap();
        assert_eq!(eps["/status"].num, 2);
        assert_eq!(eps["/status"].status_code, Some(200));

        // forced-only port: crawl results and nothing else
        let extra = &ports[&forced];
        assert_eq!(extra.protocol, None);
        assert_eq!(extra.service_version, None);
        assert_eq!(extra.endpoints.as_ref().unwrap().len(), 2);

        // swept but not speaking http: crawled, everything rejected
        assert!(ports[&dead].endpoints.as_ref().unwrap().is_empty());

        let saved = std::fs::read_to_string(out.join("127.0.0.1.json")).unwrap();
        assert!(saved.contains("\n    \""));
        let back: HostPorts = serde_json::from_str(&saved).unwrap();
        assert_eq!(&back, ports);
        assert!(out.join(format!("127.0.0.1_{swept}_2.html")).exists());

        std::fs::remove_dir_all(out.parent().unwrap()).ok();
    }

    #[tokio::test]
    async fn certificates_are_recorded_for_swept_tls_ports_only() {
        let camera = tls_device().await;
        let forced = tls_device().await;
        let refused = closed_port();
        let plain = device().await;
        let tools = Arc::new(FakeTools { open: vec![camera, refused, plain], calls: Mutex::new(Vec::new()) });
        let certs = CertRetriever::new(Duration::from_secs(1), Span::none()).unwrap();
        let tls_ports = BTreeSet::from([camera, forced, refused, plain]);
        let out = scratch();

        let res = session_with(tools, 2, Some(certs), tls_ports)
            .scan("127.0.0.1", &seeds(), &out, Some(forced.into()), None, false)
            .await
            .unwrap();

        let ports = &res["127.0.0.1"];
        let cert = ports[&camera].certificate.as_ref().unwrap();
        assert_eq!(cert.subject["CN"], "cam.local");
        assert_eq!(cert.issuer["O"], "Acme Devices");
        assert_eq!(cert.serial_number, "1f2e3d");

        // crawled, but never swept
        assert!(ports[&forced].certificate.is_none());
        assert!(ports[&forced].endpoints.is_some());

        // handshake refused or never answered
        assert!(ports[&refused].certificate.is_none());
        assert!(ports[&plain].certificate.is_none());
        assert_eq!(ports[&plain].endpoints.as_ref().unwrap().len(), 2);
        std::fs::remove_dir_all(out).ok();
    }

    #[tokio::test]
    async fn excluded_ports_are_not_crawled_unless_forced() {
        let a = device().await;
        let b = device().await;
        let tools = Arc::new(FakeTools { open: vec![a, b], calls: Mutex::new(Vec::new()) });
        let out = scratch();

        let res = session(tools, 1)
            .scan(vec!["127.0.0.1"], &seeds(), &out, None, Some(vec![b].into()), false)
            .await
            .unwrap();

        assert_eq!(res["127.0.0.1"].keys().copied().collect::<Vec<_>>(), vec![a]);
        assert!(!out.join("127.0.0.1.json").exists());
        std::fs::remove_dir_all(out).ok();
    }

    #[tokio::test]
    async fn bad_port_spec_fails_before_any_work() {
        let tools = Arc::new(FakeTools { open: vec![], calls: Mutex::new(Vec::new()) });
        let out = scratch();

        let err = session(tools.clone(), 1)
            .scan("127.0.0.1", &seeds(), &out, Some(PortSpec::One(0)), None, true)
            .await
            .unwrap_err();

        assert!(matches!(err, ReconError::Validation(_)));
        assert!(tools.calls.lock().unwrap().is_empty());
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn crashed_crawl_fails_the_session_and_stops_the_rest() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let mut tasks = JoinSet::new();
        tasks.spawn(async {
            let crashed: Option<u8> = None;
            (("10.0.0.1".to_string(), 80), crashed.expect("crawler crashed"))
        });
        tasks.spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            flag.store(true, Ordering::SeqCst);
            (("10.0.0.1".to_string(), 81), 1u8)
        });

        let err = join_all(tasks).await.unwrap_err();
        assert!(matches!(err, ReconError::Task(_)));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn sweep_failure_propagates() {
        struct Broken;
        #[async_trait]
        impl ToolRunner for Broken {
            async fn run(&self, inv: &Invocation) -> Result<()> {
                Err(ReconError::ToolFailure { tool: inv.tool, status: Some(1), stderr: "need root".into() })
            }
        }
        let cfg = Config::default();
        let out = scratch();
        let s = ReconSession::from_config(&cfg, Arc::new(Broken), Span::none()).unwrap();
        let err = s.scan("127.0.0.1", &seeds(), &out, None, None, true).await.unwrap_err();
        assert!(matches!(err, ReconError::ToolFailure { tool: ToolKind::Sweep, .. }));
        std::fs::remove_dir_all(out).ok();
    }
}
