//! Crawls the HTTP surface of one host:port, starting from seed endpoint
//! descriptors and following same-origin links until nothing new turns up.

use recon_core::ratelimiter::RateLimiter;
use recon_core::{EndpointMap, EndpointRecord, HttpMethod, ReconError, Result};
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{redirect::Policy, Client, RequestBuilder};
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn, Span};
use url::Url;

/// Element/attribute pairs that can point at further endpoints.
const LINK_SOURCES: &[(&str, &str)] = &[("a", "href"), ("link", "href"), ("img", "src"), ("script", "src")];

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub timeout_ms: u64,
    pub redirects: usize,
    pub user_agent: String,
    /// Requests per second; 0 disables pacing.
    pub qps: u32,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        CrawlOptions {
            timeout_ms: 5000,
            redirects: 10,
            user_agent: format!("recon/{}", env!("CARGO_PKG_VERSION")),
            qps: 0,
        }
    }
}

/// Why an endpoint was dropped from the crawl result.
#[derive(Debug, Error)]
pub enum EndpointRejected {
    #[error("unsupported method {0}")]
    Method(String),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {got} (wanted {wanted:?})")]
    Status { got: u16, wanted: Option<u16> },
    #[error("could not save body: {0}")]
    Persist(#[from] std::io::Error),
}

struct Visit {
    status: u16,
    headers: BTreeMap<String, String>,
    file: PathBuf,
    sha256: String,
    links: BTreeSet<String>,
}

pub struct ApiCrawler {
    client: Client,
    pacing: Option<RateLimiter>,
    log: Span,
}

impl ApiCrawler {
    /// With `qps > 0` this must run inside a tokio runtime.
    pub fn new(opts: &CrawlOptions, log: Span) -> Result<Self> {
        let client = Client::builder()
            .redirect(Policy::limited(opts.redirects))
            .timeout(Duration::from_millis(opts.timeout_ms))
            .user_agent(opts.user_agent.clone())
            .brotli(true)
            .gzip(true)
            .deflate(true)
            .build()
            .map_err(|e| ReconError::Http(e.to_string()))?;
        let pacing = (opts.qps > 0).then(|| RateLimiter::new(opts.qps));
        Ok(ApiCrawler { client, pacing, log })
    }

    /// Crawl `host:port` from `seeds`, saving every validated body under
    /// `output_dir`. Endpoints that fail in any way are dropped from the
    /// returned map; the crawl itself never fails.
    pub async fn crawl(&self, host: &str, port: u16, seeds: &EndpointMap, output_dir: &Path) -> EndpointMap {
        info!(parent: &self.log, host, port, seeds = seeds.len(), "crawling api");

        let mut result = seeds.clone();
        // every path ever queued, including ones removed later
        let mut seen: BTreeSet<String> = seeds.keys().cloned().collect();
        let mut pending: VecDeque<String> = seeds.keys().cloned().collect();
        // None once the numbering space is used up
        let mut next_num = seeds.values().map(|e| e.num).max().map_or(Some(1), |n| n.checked_add(1));

        while let Some(path) = pending.pop_front() {
            let Some(entry) = result.get(&path) else { continue };
            if entry.is_resolved() {
                continue;
            }
            let url = format!("http://{}{}", authority(host, port), path);

            match self.visit(&url, host, port, entry, output_dir).await {
                Ok(visit) => {
                    info!(parent: &self.log, url = url.as_str(), status = visit.status, "valid response");
                    if let Some(entry) = result.get_mut(&path) {
                        entry.resolve(visit.status, visit.headers, visit.file, visit.sha256);
                    }
                    let mut fresh = Vec::new();
                    for link in visit.links {
                        if seen.contains(&link) {
                            continue;
                        }
                        let Some(num) = next_num else {
                            warn!(parent: &self.log, url = url.as_str(), link = link.as_str(), "endpoint numbers exhausted");
                            break;
                        };
                        seen.insert(link.clone());
                        result.insert(link.clone(), EndpointRecord::discovered(num));
                        next_num = num.checked_add(1);
                        fresh.push(link);
                    }
                    if !fresh.is_empty() {
                        debug!(parent: &self.log, url = url.as_str(), found = fresh.len(), "new endpoints");
                    }
                    // visit what this page revealed before its siblings
                    for link in fresh.into_iter().rev() {
                        pending.push_front(link);
                    }
                }
                Err(reason) => {
                    warn!(parent: &self.log, url = url.as_str(), %reason, "endpoint rejected");
                    result.remove(&path);
                }
            }
        }

        info!(parent: &self.log, host, port, endpoints = result.len(), "crawl finished");
        result
    }

    async fn visit(
        &self,
        url: &str,
        host: &str,
        port: u16,
        entry: &EndpointRecord,
        output_dir: &Path,
    ) -> std::result::Result<Visit, EndpointRejected> {
        let req = match &entry.method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
            HttpMethod::Unsupported(m) => return Err(EndpointRejected::Method(m.clone())),
        };
        let req = with_body(req, entry.data.as_ref());

        if let Some(p) = &self.pacing {
            p.acquire().await;
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        if !entry.accepts(status) {
            return Err(EndpointRejected::Status {
                got: status,
                wanted: entry.expected_status_code.or(entry.status_code),
            });
        }

        let final_url = resp.url().clone();
        let headers = header_map(resp.headers());
        let markup = is_markup(resp.headers());
        let body = resp.bytes().await?;

        let file = output_dir.join(format!("{host}_{port}_{}.html", entry.num));
        tokio::fs::write(&file, &body).await?;
        let sha256 = hex::encode(Sha256::digest(&body));

        let links = if markup { extract_links(&final_url, &String::from_utf8_lossy(&body)) } else { BTreeSet::new() };
        Ok(Visit { status, headers, file, sha256, links })
    }
}

/// IPv6 literals need brackets inside a URL.
fn authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn with_body(req: RequestBuilder, data: Option<&serde_json::Value>) -> RequestBuilder {
    use serde_json::Value;
    match data {
        None | Some(Value::Null) => req,
        Some(Value::String(s)) => req.body(s.clone()),
        Some(obj @ Value::Object(_)) => req.form(obj),
        Some(other) => req.body(other.to_string()),
    }
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers {
        let v = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match out.entry(name.as_str().to_string()) {
            Entry::Occupied(mut e) => {
                let cur: &mut String = e.get_mut();
                cur.push_str(", ");
                cur.push_str(&v);
            }
            Entry::Vacant(e) => {
                e.insert(v);
            }
        }
    }
    out
}

fn is_markup(headers: &HeaderMap) -> bool {
    match headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        None => true,
        Some(ct) => {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("text/") || ct.contains("html") || ct.contains("xml")
        }
    }
}

/// Same-origin links of a document, as `path[?query]`. A raw attribute value
/// without a `/` (a bare file name) is ignored.
pub fn extract_links(base: &Url, html: &str) -> BTreeSet<String> {
    let doc = Html::parse_document(html);
    let origin = base.origin();
    let mut out = BTreeSet::new();
    for (tag, attr) in LINK_SOURCES {
        let Ok(sel) = Selector::parse(&format!("{tag}[{attr}]")) else { continue };
        for el in doc.select(&sel) {
            let Some(raw) = el.value().attr(attr) else { continue };
            if !raw.contains('/') {
                continue;
            }
            let Ok(abs) = base.join(raw.trim()) else { continue };
            if abs.origin() != origin {
                continue;
            }
            let mut path = abs.path().to_string();
            if let Some(q) = abs.query() {
                path.push('?');
                path.push_str(q);
            }
            out.insert(path);
        }
    }
    out
}
