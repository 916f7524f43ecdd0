use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kindex_api::{HistoryRequest, HistoryResponse, InProcApi, IndexApi, OriginRequest, SearchRequest, SearchResponse};
use kindex_core::{ResourceKey, WatchScope};
use kindex_feed::KubeFeed;
use kindex_pipeline::{Health, IndexFacade, OriginResult, PipelineConfig};
use kindex_search::IndexLimits;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kindexctl", version, about = "Keep a search index in sync with a Kubernetes resource type")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Restrict the scope to one namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug, Clone, Default)]
struct ConfigArgs {
    /// Revisions kept per resource
    #[arg(long = "history-limit", env = "KINDEX_HISTORY_LIMIT", global = true)]
    history_limit: Option<usize>,
    /// Reject index writes beyond this many documents
    #[arg(long = "max-docs", env = "KINDEX_MAX_DOCS", global = true)]
    max_docs: Option<usize>,
    /// Reject documents with larger payloads
    #[arg(long = "max-payload-bytes", env = "KINDEX_MAX_PAYLOAD_BYTES", global = true)]
    max_payload_bytes: Option<usize>,
    /// Annotation prefix carrying origin information
    #[arg(long = "origin-prefix", env = "KINDEX_ORIGIN_PREFIX", global = true)]
    origin_prefix: Option<String>,
    /// Seconds to wait for the initial list before giving up
    #[arg(long = "wait-secs", env = "KINDEX_WAIT_SECS", global = true)]
    wait_secs: Option<u64>,
    /// Deleted uids remembered to reject late events
    #[arg(long = "tombstone-limit", env = "KINDEX_TOMBSTONE_LIMIT", global = true)]
    tombstone_limit: Option<usize>,
}

impl ConfigArgs {
    fn pipeline_config(&self) -> PipelineConfig { self.apply_to(PipelineConfig::from_env()) }

    /// Flags override `base`; unset flags keep its values.
    fn apply_to(&self, base: PipelineConfig) -> PipelineConfig {
        let mut cfg = base;
        if let Some(n) = self.history_limit {
            cfg = cfg.with_history_limit(n);
        }
        if let Some(p) = &self.origin_prefix {
            cfg = cfg.with_origin_prefix(p.clone());
        }
        if let Some(secs) = self.wait_secs {
            cfg = cfg.with_ready_timeout(Duration::from_secs(secs));
        }
        if let Some(n) = self.tombstone_limit {
            cfg = cfg.with_tombstone_limit(n);
        }
        let limits = IndexLimits {
            max_docs: self.max_docs.or(cfg.limits.max_docs),
            max_payload_bytes: self.max_payload_bytes.or(cfg.limits.max_payload_bytes),
        };
        cfg.with_limits(limits)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bootstrap the index, follow the watch and report health until Ctrl-C
    Serve {
        /// Scope key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        scope: String,
        /// Seconds between health reports
        #[arg(long = "report-secs", default_value_t = 30)]
        report_secs: u64,
    },
    /// Bootstrap the index once and run a query
    Search {
        scope: String,
        /// Query string: free text plus g:, k:, ns:, name:, label:k[=v], anno:k[=v]
        query: String,
        #[arg(long = "limit", default_value_t = 20)]
        limit: usize,
        /// Print filter stage counts
        #[arg(long = "explain", action = ArgAction::SetTrue)]
        explain: bool,
    },
    /// Show recorded revisions of a resource
    History {
        scope: String,
        name: String,
        #[arg(long = "limit")]
        limit: Option<usize>,
    },
    /// Show origin annotations of one resource, or of every resource in scope
    Origin {
        scope: String,
        name: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("KINDEX_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KINDEX_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KINDEX_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_scope(key: &str, ns: Option<&str>) -> Result<WatchScope> {
    let scope = WatchScope::parse(key).ok_or_else(|| anyhow!("invalid scope {key:?}; expected Kind, version/Kind or group/version/Kind"))?;
    Ok(match ns {
        Some(ns) => scope.in_namespace(ns),
        None => scope,
    })
}

/// Facade over a Kubernetes feed for `scope`.
async fn facade_for(scope: WatchScope, cfg: PipelineConfig) -> Result<Arc<IndexFacade>> {
    let feed = KubeFeed::try_default().await.context("connecting to the cluster")?;
    Ok(Arc::new(IndexFacade::with_mem_index(scope, Arc::new(feed), cfg)))
}

/// Bootstrap within the configured ready timeout.
async fn bootstrap(facade: &IndexFacade) -> Result<()> {
    let cancel = CancellationToken::new();
    let timeout = facade.config().ready_timeout;
    match tokio::time::timeout(timeout, facade.bootstrap(&cancel)).await {
        Ok(res) => {
            let report = res?;
            info!(indexed = report.indexed, skipped = report.skipped, "index ready");
            Ok(())
        }
        Err(_) => {
            cancel.cancel();
            Err(anyhow!("index not ready after {timeout:?}"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = cli.config.pipeline_config();
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Serve { scope, report_secs } => {
            let scope = parse_scope(&scope, ns)?;
            info!(scope = %scope, report_secs, "serve invoked");
            let facade = facade_for(scope, cfg).await?;
            let cancel = CancellationToken::new();
            let handle = facade.start(cancel.clone()).await?;
            let mut ticker = tokio::time::interval(Duration::from_secs(report_secs.max(1)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = signal::ctrl_c() => {
                        info!("ctrl-c received; stopping watch");
                        break;
                    }
                    _ = ticker.tick() => {
                        let health = facade.health();
                        print_health(cli.output, &health)?;
                        if handle.is_finished() {
                            break;
                        }
                    }
                }
            }
            match handle.stop().await {
                Ok(report) => info!(received = report.received, applied = report.applied, stale = report.stale, dropped = report.dropped, "watch stopped"),
                Err(e) => {
                    error!(error = %e, "watch ended with error");
                    print_health(cli.output, &facade.health())?;
                    return Err(e.into());
                }
            }
        }
        Commands::Search { scope, query, limit, explain } => {
            let scope = parse_scope(&scope, ns)?;
            info!(scope = %scope, query = %query, limit, "search invoked");
            let facade = facade_for(scope, cfg).await?;
            bootstrap(&facade).await?;
            let api = InProcApi::new(facade);
            let resp = api.search(SearchRequest { query, namespace: None, limit: Some(limit) }).await?;
            print_search(cli.output, &resp, explain)?;
        }
        Commands::History { scope, name, limit } => {
            let scope = parse_scope(&scope, ns)?;
            let key = resource_key(&scope, ns, &name);
            info!(key = %key, "history invoked");
            let facade = facade_for(scope, cfg).await?;
            bootstrap(&facade).await?;
            let api = InProcApi::new(facade);
            let resp = api.history(HistoryRequest { key, limit }).await?;
            print_history(cli.output, &resp)?;
        }
        Commands::Origin { scope, name } => {
            let scope = parse_scope(&scope, ns)?;
            let key = resource_key(&scope, ns, name.as_deref().unwrap_or(""));
            info!(key = %key, "origin invoked");
            let facade = facade_for(scope, cfg).await?;
            bootstrap(&facade).await?;
            let api = InProcApi::new(facade);
            let resp = api.origin(OriginRequest { key }).await?;
            print_origin(cli.output, &resp)?;
        }
    }

    Ok(())
}

fn resource_key(scope: &WatchScope, ns: Option<&str>, name: &str) -> ResourceKey {
    ResourceKey::new(&scope.group, &scope.resource_type, ns.unwrap_or(""), name)
}

fn print_health(output: Output, h: &Health) -> Result<()> {
    match output {
        Output::Human => println!("{}", render_health(h)),
        Output::Json => println!("{}", serde_json::to_string(h)?),
    }
    Ok(())
}

fn render_health(h: &Health) -> String {
    let c = &h.counters;
    format!(
        "{} phase={:?} watch={:?} docs={} received={} applied={} stale={} dropped={} write_failures={} delete_fallbacks={}",
        h.scope, h.phase, h.watch, h.docs, c.received, c.applied, c.stale, c.dropped, c.write_failures, c.delete_fallbacks
    )
}

fn ns_name(key: &ResourceKey) -> String {
    if key.namespace.is_empty() { key.name.clone() } else { format!("{}/{}", key.namespace, key.name) }
}

fn print_search(output: Output, resp: &SearchResponse, explain: bool) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<20} {:<40} {:>8} {:>6}", "KIND", "NAMESPACE/NAME", "VERSION", "SCORE");
            for h in &resp.hits {
                println!("{:<20} {:<40} {:>8} {:>6.2}", h.key.resource_type, ns_name(&h.key), h.version, h.score);
            }
            if explain {
                let d = &resp.debug;
                eprintln!(
                    "debug: total={} after_labels={} after_annos={} after_key={} after_text={} indexed={} took_ms={}",
                    d.total, d.after_labels, d.after_annos, d.after_key, d.after_text, resp.meta.indexed, resp.meta.took_ms
                );
            }
        }
        Output::Json if explain => println!("{}", serde_json::to_string_pretty(resp)?),
        Output::Json => println!("{}", serde_json::to_string_pretty(&resp.hits)?),
    }
    Ok(())
}

fn print_history(output: Output, resp: &HistoryResponse) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<8} {:<10} {:<40} {:<8}", "VERSION", "ACTION", "NAMESPACE/NAME", "AGE");
            let now = chrono::Utc::now().timestamp_millis();
            for r in &resp.revisions {
                println!("{:<8} {:<10} {:<40} {:<8}", r.version, r.action.as_str(), ns_name(&r.key), render_age((now - r.observed_at) / 1000));
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(resp)?),
    }
    Ok(())
}

fn print_origin(output: Output, resp: &OriginResult) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<40} {:<16} {:<32} {:<12}", "NAMESPACE/NAME", "ORIGIN", "PATH", "HASH");
            for e in &resp.items {
                match &e.origin {
                    Some(o) => println!(
                        "{:<40} {:<16} {:<32} {:<12}",
                        ns_name(&e.key),
                        o.name,
                        o.path.as_deref().unwrap_or("-"),
                        o.hash.as_deref().unwrap_or("-")
                    ),
                    None => println!("{:<40} {:<16} {:<32} {:<12}", ns_name(&e.key), "-", "-", "-"),
                }
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(resp)?),
    }
    Ok(())
}

fn render_age(secs: i64) -> String {
    if secs < 0 { return "-".to_string(); }
    let mut secs = secs as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
