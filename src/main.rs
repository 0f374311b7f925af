use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wrt_scan_rs::client::{ReconnectPolicy, StreamClient};
use wrt_scan_rs::coordinator::{EngineConfig, ScanCoordinator};
use wrt_scan_rs::export::{self, ExportFormat};
use wrt_scan_rs::http_probe::{HttpLoginConfig, HttpLoginProber};
use wrt_scan_rs::netdetect;
use wrt_scan_rs::probe::{self, StaticCredentials};
use wrt_scan_rs::projection::Summary;
use wrt_scan_rs::publisher::EventPublisher;
use wrt_scan_rs::reconciler::{ConnectionState, Reconciler};
use wrt_scan_rs::server;
use wrt_scan_rs::targets::{self, Target};
use wrt_scan_rs::types::{ResultRecord, ScanEvent, SortKey};

/// wrt-scan-rs — concurrent OpenWrt login prober with a live result stream.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "wrt-scan-rs",
    version,
    about = "Concurrent OpenWrt login prober with a live result stream and a tiny embedded web UI.",
    long_about = None
)]
struct Cli {
    /// File with one target per line (host, host:port or IPv4 CIDR).
    #[arg(long)]
    targets: Option<PathBuf>,

    /// Probe every host of the detected local IPv4 /24 networks.
    #[arg(long, default_value_t = false)]
    local: bool,

    /// File with one `username:password` per line, tried in order.
    #[arg(long)]
    credentials: Option<PathBuf>,

    /// Number of concurrent probe workers.
    #[arg(long, default_value_t = 50)]
    threads: usize,

    /// Connect timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 3000)]
    timeout_ms: u64,

    /// Hard deadline for one target's whole attempt, in milliseconds.
    #[arg(long = "attempt-timeout-ms", default_value_t = 30_000)]
    attempt_timeout_ms: u64,

    /// Login form path on the device; repeat to try several in order.
    /// Defaults to /cgi-bin/luci, /cgi-bin/luci/admin and /.
    #[arg(long = "login-path")]
    login_paths: Vec<String>,

    /// Login form field names as `USER_FIELD:PASS_FIELD`; repeat to try
    /// several. Defaults to the luci_, plain and auth_ variants.
    #[arg(long = "field-variant")]
    field_variants: Vec<String>,

    /// Talk HTTPS to the devices.
    #[arg(long, default_value_t = false)]
    https: bool,

    /// Export the final table to this path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Export format (csv, json, txt). Defaults to the output file extension.
    #[arg(long)]
    format: Option<ExportFormat>,

    /// Sort the printed/exported table by this column.
    #[arg(long, value_parser = parse_sort_key)]
    sort: Option<SortKey>,

    /// Run the HTTP API + event stream instead of a one-shot scan.
    #[arg(long = "serve-ui", default_value_t = false)]
    serve_ui: bool,

    /// Bind address for --serve-ui.
    #[arg(long, default_value = "127.0.0.1:8000")]
    bind: String,

    /// Static UI directory served by --serve-ui.
    #[arg(long = "ui-dir")]
    ui_dir: Option<PathBuf>,

    /// Follow a running server's event stream (e.g. http://127.0.0.1:8000/api/events).
    #[arg(long)]
    follow: Option<String>,
}

fn parse_sort_key(s: &str) -> Result<SortKey, String> {
    SortKey::COLUMNS
        .into_iter()
        .find(|k| k.header().eq_ignore_ascii_case(s))
        .ok_or_else(|| format!("unknown column: {s}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Some(url) = cli.follow.clone() {
        return follow(&cli, url).await;
    }

    let coordinator = build_coordinator(&cli)?;
    let targets = collect_targets(&cli)?;

    if cli.serve_ui {
        let server_coordinator = coordinator.clone();
        let bind = cli.bind.clone();
        let ui_dir = cli.ui_dir.clone();
        let server = tokio::spawn(async move {
            if let Err(e) = server::spawn_server(&bind, server_coordinator, ui_dir).await {
                error!("HTTP server error: {e:#}");
            }
        });
        if !targets.is_empty() {
            coordinator.start(targets, cli.threads)?;
        }
        println!("API at http://{}/api (Ctrl+C to stop)", cli.bind);
        let _ = tokio::signal::ctrl_c().await;
        coordinator.stop();
        server.abort();
        return Ok(());
    }

    if targets.is_empty() {
        bail!("no targets: pass --targets <file>, --local, or --serve-ui");
    }
    run_once(&cli, &coordinator, targets).await
}

fn build_coordinator(cli: &Cli) -> Result<ScanCoordinator> {
    let credentials = match &cli.credentials {
        Some(path) => probe::load_credentials_from_path(path)?,
        None => Vec::new(),
    };
    if credentials.is_empty() {
        warn!("no credentials supplied; reachable devices will report auth-rejected");
    }

    let mut login = HttpLoginConfig {
        use_https: cli.https,
        connect_timeout: Duration::from_millis(cli.timeout_ms),
        request_timeout: Duration::from_millis(cli.timeout_ms.saturating_mul(2)),
        ..HttpLoginConfig::default()
    };
    if !cli.login_paths.is_empty() {
        login.login_paths = cli.login_paths.clone();
    }
    if !cli.field_variants.is_empty() {
        login.field_variants = cli
            .field_variants
            .iter()
            .map(|v| match v.split_once(':') {
                Some((user, pass)) if !user.is_empty() && !pass.is_empty() => {
                    Ok((user.to_string(), pass.to_string()))
                }
                _ => bail!("field variant must be USER_FIELD:PASS_FIELD, got {v:?}"),
            })
            .collect::<Result<_>>()?;
    }
    let prober = HttpLoginProber::new(login)?;

    let config = EngineConfig {
        attempt_timeout: Duration::from_millis(cli.attempt_timeout_ms),
        ..EngineConfig::default()
    };
    Ok(ScanCoordinator::new(
        config,
        EventPublisher::new(),
        Arc::new(prober),
        Arc::new(StaticCredentials(credentials)),
    ))
}

fn collect_targets(cli: &Cli) -> Result<Vec<Target>> {
    let mut out = Vec::new();
    if let Some(path) = &cli.targets {
        let parsed = targets::load_targets_from_path(path)?;
        println!(
            "Targets: {} unique ({} duplicates, {} malformed lines skipped)",
            parsed.len(),
            parsed.duplicates,
            parsed.malformed
        );
        out.extend(parsed.targets);
    }
    if cli.local {
        let local = netdetect::detect_local_targets().context("failed to detect local networks")?;
        println!("Local networks: {} hosts", local.len());
        for t in local {
            if !out.contains(&t) {
                out.push(t);
            }
        }
    }
    Ok(out)
}

async fn run_once(cli: &Cli, coordinator: &ScanCoordinator, targets: Vec<Target>) -> Result<()> {
    let mut events = coordinator.subscribe();
    let ticket = coordinator.start(targets, cli.threads)?;
    info!(session = ticket.session_id, workers = ticket.workers, "probing {} targets", ticket.targets);

    let stopper = coordinator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.stop();
        }
    });

    let mut reconciler = Reconciler::new();
    reconciler.set_connection(ConnectionState::Connected);
    let completed = coordinator.wait_completed(ticket.session_id);
    tokio::pin!(completed);
    let mut saw_final_status = false;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                saw_final_status = matches!(event, ScanEvent::Status(s) if !s.scanning);
                if let ScanEvent::Result(r) = &event {
                    if r.status.is_terminal() {
                        println!("[{}] {:<24} {:<7} {}", r.id, r.address, r.status.as_str(), r.details);
                    }
                }
                reconciler.apply(event);
                if saw_final_status {
                    break;
                }
            }
            _ = &mut completed => break,
        }
    }
    if events.dropped() > 0 || !saw_final_status {
        warn!(
            dropped = events.dropped(),
            "event stream incomplete; rebuilding table from session results"
        );
        reconciler.begin_session();
        for record in coordinator.results() {
            reconciler.apply(ScanEvent::Result(record));
        }
    }

    finish(cli, &mut reconciler)
}

async fn follow(cli: &Cli, url: String) -> Result<()> {
    let client = StreamClient::new(url, ReconnectPolicy::default())?;
    let cancel = CancellationToken::new();
    let ctrlc = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrlc.cancel();
    });

    let mut reconciler = Reconciler::new();
    client
        .run(&mut reconciler, &cancel, |state, event| match event {
            Some(ScanEvent::Result(r)) if r.status.is_terminal() => {
                println!("[{}] {:<24} {:<7} {}", r.id, r.address, r.status.as_str(), r.details);
            }
            Some(ScanEvent::Status(s)) => {
                println!("scanning: {}", s.scanning);
            }
            Some(ScanEvent::Result(_)) => {}
            None => println!("connection: {:?}", state.connection()),
        })
        .await?;

    finish(cli, &mut reconciler)
}

fn finish(cli: &Cli, reconciler: &mut Reconciler) -> Result<()> {
    if let Some(key) = cli.sort {
        reconciler.view_mut().toggle_sort(key);
    }
    let rows = reconciler.displayed();
    print_results_table(&rows, Summary::of(reconciler.table()));

    if let Some(path) = cli.output.as_deref() {
        let format = cli
            .format
            .or_else(|| ExportFormat::from_path(path))
            .unwrap_or(ExportFormat::Json);
        export::write_to_path(path, &rows, format)?;
        println!("Wrote {} rows to {}", rows.len(), path.display());
    }
    Ok(())
}

fn print_results_table(rows: &[&ResultRecord], summary: Summary) {
    let mut addr_w = "address".len();
    let mut user_w = "username".len();
    let mut pass_w = "password".len();
    for r in rows {
        addr_w = addr_w.max(r.address.len());
        user_w = user_w.max(r.username.len());
        pass_w = pass_w.max(r.password.len());
    }
    let id_w = 4usize;
    let status_w = "success".len();

    println!(
        "\nSuccess: {}  Failed: {}  Pending: {}",
        summary.success, summary.failed, summary.pending
    );
    println!(
        "{:>id_w$}  {:<addr_w$}  {:<status_w$}  {:<user_w$}  {:<pass_w$}  details",
        "id", "address", "status", "username", "password",
    );
    println!(
        "{:-<id_w$}  {:-<addr_w$}  {:-<status_w$}  {:-<user_w$}  {:-<pass_w$}  {:-<7}",
        "", "", "", "", "", "",
    );
    for r in rows {
        let mut details = r.details.clone();
        if details.chars().count() > 60 {
            details = details.chars().take(60).collect();
        }
        println!(
            "{:>id_w$}  {:<addr_w$}  {:<status_w$}  {:<user_w$}  {:<pass_w$}  {}",
            r.id,
            r.address,
            r.status.as_str(),
            r.username,
            r.password,
            details,
        );
    }
}
