use anyhow::{anyhow, Result};
use api_crawler::ApiCrawler;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use last_seen::LastSeen;
use recon::report::{to_pretty_json, write_summary};
use recon::{load_config, load_endpoints, Config, ReconSession};
use recon_core::input::{parse_ports, PortSpec, Targets};
use recon_core::tool::ProcessRunner;
use recon_core::{EndpointMap, EndpointRecord, HttpMethod, ScanResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tls_cert::CertRetriever;
use tracing::{info_span, Span};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum LogFormat { Text, Json }

#[derive(Debug, Parser)]
#[command(name = "recon", version, about = "IoT device reconnaissance: port sweep, service probe, API crawl")]
struct Cli {
    /// Config file (YAML). If omitted, loads ./recon.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// More log output (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Hosts to scan. Falls back to scan.targets from the config.
    targets: Vec<String>,
    /// Seed endpoint descriptors (JSON)
    #[arg(long, value_name = "FILE")]
    endpoints: Option<PathBuf>,
    /// Directory for saved bodies and per-host results
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,
    /// Ports crawled on every host even if not found open (e.g. 8081 or 8000-8002)
    #[arg(long)]
    crawl_ports: Option<String>,
    /// Ports dropped from every host's sweep result
    #[arg(long)]
    exclude_ports: Option<String>,
    /// Do not write {output}/{host}.json
    #[arg(long, default_value_t = false)]
    no_save: bool,
    /// Sweep rate in packets per second
    #[arg(long)]
    rate: Option<u32>,
    /// Also write a CSV summary to this file
    #[arg(long, value_name = "FILE")]
    csv: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum LastSeenCmd {
    /// Remember the port a device was last reachable on
    Record { ip: String, port: u16 },
    /// Print the last recorded port of a device
    Get { ip: String },
    /// Drop entries older than the TTL and print how many went
    Prune,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Sweep, probe and crawl a batch of devices
    Scan(ScanArgs),
    /// Crawl one host:port from seed endpoints
    Crawl {
        host: String,
        port: u16,
        #[arg(long, value_name = "FILE")]
        endpoints: Option<PathBuf>,
        #[arg(long, value_name = "DIR")]
        output: Option<PathBuf>,
    },
    /// Print TLS certificate metadata of a service
    Cert {
        host: String,
        #[arg(long, default_value_t = 443)]
        port: u16,
    },
    /// IP -> port side-store
    LastSeen {
        #[command(subcommand)]
        cmd: LastSeenCmd,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);
    let cfg = load_config(cli.config.as_deref())?;
    let root = info_span!("recon");

    match cli.command {
        Commands::Version => {
            println!("recon {}", recon_core::version());
        }
        Commands::Scan(args) => {
            let csv = args.csv.clone();
            let rt = tokio::runtime::Runtime::new()?;
            let result = rt.block_on(run_scan(cfg, args, root))?;
            if let Some(path) = csv {
                write_summary(&result, &path)?;
            }
            println!("{}", String::from_utf8(to_pretty_json(&result)?)?);
        }
        Commands::Crawl { host, port, endpoints, output } => {
            recon_core::input::validate_host(&host)?;
            let seeds = seeds_from(endpoints.as_deref().or(cfg.scan.endpoints.as_deref()))?;
            let output = output_dir(output, &cfg);
            let rt = tokio::runtime::Runtime::new()?;
            let found = rt.block_on(async {
                tokio::fs::create_dir_all(&output).await?;
                let crawler = ApiCrawler::new(&cfg.crawl_options(), info_span!(parent: &root, "crawl"))?;
                anyhow::Ok(crawler.crawl(&host, port, &seeds, &output).await)
            })?;
            println!("{}", String::from_utf8(to_pretty_json(&found)?)?);
        }
        Commands::Cert { host, port } => {
            recon_core::input::validate_host(&host)?;
            let rt = tokio::runtime::Runtime::new()?;
            let cert = rt.block_on(async {
                let certs = CertRetriever::new(cfg.tls_timeout(), info_span!(parent: &root, "tls"))?;
                anyhow::Ok(certs.retrieve(&host, port).await)
            })?;
            let cert = cert.ok_or_else(|| anyhow!("no certificate from {host}:{port}"))?;
            println!("{}", String::from_utf8(to_pretty_json(&cert)?)?);
        }
        Commands::LastSeen { cmd } => {
            let path = cfg.last_seen.path.clone().unwrap_or_else(|| PathBuf::from("last_seen.sqlite"));
            let ttl = cfg.last_seen.ttl_secs.map(Duration::from_secs).unwrap_or(last_seen::DEFAULT_TTL);
            let store = LastSeen::open_or_create(&path, ttl, info_span!(parent: &root, "last_seen"))?;
            match cmd {
                LastSeenCmd::Record { ip, port } => store.record(&ip, port)?,
                LastSeenCmd::Get { ip } => match store.lookup(&ip)? {
                    Some(port) => println!("{port}"),
                    None => return Err(anyhow!("no recent port for {ip}")),
                },
                LastSeenCmd::Prune => println!("{}", store.prune()?),
            }
        }
    }
    Ok(())
}

async fn run_scan(mut cfg: Config, args: ScanArgs, log: Span) -> Result<ScanResult> {
    if let Some(rate) = args.rate {
        cfg.sweep.rate = Some(rate);
    }
    let targets = if !args.targets.is_empty() {
        Targets::from(args.targets)
    } else {
        cfg.scan
            .targets
            .clone()
            .ok_or_else(|| anyhow!("no targets: pass hosts or set scan.targets in the config"))?
    };
    let seeds = seeds_from(args.endpoints.as_deref().or(cfg.scan.endpoints.as_deref()))?;
    let output = output_dir(args.output, &cfg);
    let crawl_ports = cli_ports(args.crawl_ports.as_deref())?.or_else(|| cfg.scan.crawl_ports.clone());
    let excl_ports = cli_ports(args.exclude_ports.as_deref())?.or_else(|| cfg.scan.excl_ports.clone());
    let save = !args.no_save && cfg.scan.save_output.unwrap_or(true);

    let runner = Arc::new(ProcessRunner::new(info_span!(parent: &log, "tools")));
    let session = ReconSession::from_config(&cfg, runner, log)?;
    Ok(session.scan(targets, &seeds, &output, crawl_ports, excl_ports, save).await?)
}

fn cli_ports(spec: Option<&str>) -> Result<Option<PortSpec>> {
    Ok(spec.map(parse_ports).transpose()?.map(PortSpec::Many))
}

/// Without a descriptor file only the root page is seeded.
fn seeds_from(path: Option<&Path>) -> Result<EndpointMap> {
    match path {
        Some(p) => Ok(load_endpoints(p)?),
        None => Ok(EndpointMap::from([("/".to_string(), EndpointRecord::seed(1, HttpMethod::Get, 200))])),
    }
}

fn output_dir(cli: Option<PathBuf>, cfg: &Config) -> PathBuf {
    cli.or_else(|| cfg.scan.output.clone()).unwrap_or_else(|| PathBuf::from("recon-output"))
}

fn init_logging(verbose: u8, format: LogFormat) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}
