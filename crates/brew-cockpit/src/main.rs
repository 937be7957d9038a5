use anyhow::{Context, Result};
use brew_core::snapshot::{parse_findings, parse_forecast_response, parse_planner_steps};
use brew_core::{Category, ForecastView, Overview};
use brew_correlate::{normalize_series, palette_index};
use chrono::Utc;
use clap::{Parser, Subcommand};
use client::{BackendClient, ClientError};
use poller::{run_cycle, CycleSettings, Poller, PollerConfig};
use serde_json::{json, Value};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod assemble;
mod client;
mod fixture;
mod poller;

const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000";
const DEFAULT_POLL_SECS: u64 = 5;
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_HORIZON_MINUTES: u32 = 240;
const DEFAULT_MAX_FORECASTS: usize = 4;
const DEFAULT_PLANNER_GOAL: &str = "Balance drains and tickets across the potion network.";
const GROUP_PALETTE: [&str; 6] = ["gold", "violet", "teal", "rose", "amber", "sky"];

#[derive(Clone, Debug)]
struct Config {
    backend_url: String,
    poll_interval: Duration,
    http_timeout: Duration,
    horizon_minutes: u32,
    max_forecasts: usize,
    fixture_only: bool,
    debug: bool,
}

impl Config {
    fn cycle_settings(&self) -> CycleSettings {
        CycleSettings {
            fixture_only: self.fixture_only,
            horizon_minutes: self.horizon_minutes,
            max_forecasts: self.max_forecasts,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "brew-cockpit")]
#[command(about = "Cauldron network correlation dashboard", long_about = None)]
struct Args {
    #[arg(long, default_value = "")]
    backend_url: String,
    #[arg(long)]
    poll_secs: Option<u64>,
    #[arg(long)]
    timeout_secs: Option<u64>,
    #[arg(long)]
    horizon_minutes: Option<u32>,
    #[arg(long)]
    max_forecasts: Option<usize>,
    #[arg(long, default_value_t = false)]
    fixture_only: bool,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Poll the backend and print one summary line per cycle
    Watch,
    /// Run a single cycle and print the overview
    Snapshot {
        #[arg(long)]
        json: bool,
    },
    /// Trigger drain detection
    Detect,
    /// Trigger ticket matching
    Match,
    /// Trigger an audit and list its findings
    Audit,
    /// Request a forecast for one cauldron
    Forecast {
        entity_id: String,
        #[arg(long)]
        horizon_minutes: Option<u32>,
    },
    /// Run the planner, then one cycle seeded with its steps
    Plan {
        goal: Option<String>,
        #[arg(long)]
        entity: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args);
    init_logging(&config);

    let client = BackendClient::new(&config.backend_url, config.http_timeout)
        .context("Failed to build backend client")?;
    info!(
        event = "cockpit_start",
        backend = client.base_url(),
        fixture_only = config.fixture_only
    );

    match args.command.clone().unwrap_or(Command::Watch) {
        Command::Watch => watch(client, &config).await,
        Command::Snapshot { json } => snapshot(&client, &config, json).await,
        Command::Detect => {
            let body = run_action("detect", client.run_detect()).await?;
            print_json(&body)
        }
        Command::Match => {
            let body = run_action("match", client.run_match()).await?;
            print_json(&body)
        }
        Command::Audit => {
            let body = run_action("audit", client.run_audit()).await?;
            print_findings(&body);
            Ok(())
        }
        Command::Forecast {
            entity_id,
            horizon_minutes,
        } => {
            let horizon = horizon_minutes.unwrap_or(config.horizon_minutes);
            let body = run_action("forecast", client.run_forecast(&entity_id, horizon)).await?;
            print_forecast(&entity_id, &body);
            Ok(())
        }
        Command::Plan {
            goal,
            entity,
            dry_run,
        } => plan(&client, &config, goal, entity, dry_run).await,
    }
}

fn load_config(args: &Args) -> Config {
    let debug = args.debug || env_flag("BREW_DEBUG");
    Config {
        backend_url: resolve_backend_url(&args.backend_url, std::env::var("BREW_BACKEND_URL").ok()),
        poll_interval: Duration::from_secs(
            resolve_number(args.poll_secs, env_value("BREW_POLL_SECS"), DEFAULT_POLL_SECS).max(1),
        ),
        http_timeout: Duration::from_secs(
            resolve_number(
                args.timeout_secs,
                env_value("BREW_HTTP_TIMEOUT_SECS"),
                DEFAULT_TIMEOUT_SECS,
            )
            .max(1),
        ),
        horizon_minutes: resolve_number(
            args.horizon_minutes,
            env_value("BREW_FORECAST_HORIZON_MIN"),
            DEFAULT_HORIZON_MINUTES,
        ),
        max_forecasts: resolve_number(
            args.max_forecasts,
            env_value("BREW_MAX_FORECASTS"),
            DEFAULT_MAX_FORECASTS,
        ),
        fixture_only: args.fixture_only || env_flag("BREW_FIXTURE_ONLY"),
        debug,
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn env_flag(key: &str) -> bool {
    env_value(key)
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(false)
}

fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn resolve_backend_url(flag: &str, env: Option<String>) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    if let Some(value) = env {
        if !value.trim().is_empty() {
            return value.trim().to_string();
        }
    }
    DEFAULT_BACKEND_URL.to_string()
}

fn resolve_number<T: std::str::FromStr>(flag: Option<T>, env: Option<String>, default: T) -> T {
    flag.or_else(|| env.and_then(|value| value.trim().parse().ok()))
        .unwrap_or(default)
}

fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("BREW_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if env_flag("BREW_LOG_STDOUT") {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
}

async fn run_action<F>(action: &str, request: F) -> Result<Value>
where
    F: Future<Output = Result<Value, ClientError>>,
{
    match request.await {
        Ok(body) => {
            info!(event = "action_run", action);
            Ok(body)
        }
        Err(err) => {
            error!(event = "action_error", action, error = %err);
            Err(err).with_context(|| format!("{action} request failed"))
        }
    }
}

async fn watch(client: BackendClient, config: &Config) -> Result<()> {
    let handle = Poller::start(
        Arc::new(client),
        PollerConfig {
            poll_interval: config.poll_interval,
            cycle: config.cycle_settings(),
        },
    );
    let mut updates = handle.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let overview = updates.borrow_and_update().clone();
                println!("{}", summary_line(&overview));
            }
        }
    }
    handle.stop();
    let last = handle.latest();
    info!(
        event = "watch_stop",
        origin = last.origin.as_str(),
        groups = last.groups.len()
    );
    handle.join().await;
    Ok(())
}

async fn snapshot(client: &BackendClient, config: &Config, as_json: bool) -> Result<()> {
    let overview = run_cycle(client, &config.cycle_settings(), &[], Utc::now()).await;
    if as_json {
        let rendered =
            serde_json::to_string_pretty(&overview).context("Failed to serialize overview")?;
        println!("{rendered}");
    } else {
        print_overview(&overview);
    }
    Ok(())
}

async fn plan(
    client: &BackendClient,
    config: &Config,
    goal: Option<String>,
    entity: Option<String>,
    dry_run: bool,
) -> Result<()> {
    let goal = goal.unwrap_or_else(|| DEFAULT_PLANNER_GOAL.to_string());
    let context = match entity {
        Some(entity_id) => json!({ "cauldron_id": entity_id }),
        None => json!({}),
    };
    let body = run_action("planner", client.run_planner(&goal, context, dry_run)).await?;
    let run_at = Utc::now();
    let steps = parse_planner_steps(&body);
    println!("planner: {} step(s){}", steps.len(), if dry_run { " (dry run)" } else { "" });
    for step in &steps {
        println!(
            "  {:<9} {:<8} {}",
            step.tool,
            step.status,
            step.summary.as_deref().unwrap_or("")
        );
    }

    let seeded = assemble::seed_planner_trace(&steps, run_at);
    let overview = run_cycle(client, &config.cycle_settings(), &seeded, run_at).await;
    print_overview(&overview);
    Ok(())
}

fn print_json(body: &Value) -> Result<()> {
    let rendered = serde_json::to_string_pretty(body).context("Failed to render response")?;
    println!("{rendered}");
    Ok(())
}

fn print_findings(body: &Value) {
    let findings = parse_findings(body);
    if findings.is_empty() {
        println!("No findings.");
        return;
    }
    for finding in findings {
        println!(
            "[{}] {} {} {}",
            finding.severity().as_str(),
            finding.title(),
            finding.cauldron_id.as_deref().unwrap_or("-"),
            finding.reason.as_deref().unwrap_or("")
        );
    }
}

fn print_forecast(entity_id: &str, body: &Value) {
    let Some(raw) = parse_forecast_response(body) else {
        println!("No forecast for {entity_id}.");
        return;
    };
    let view = normalize_series(&raw.series, raw.overflow_eta, Utc::now());
    println!("{}", forecast_line(entity_id, &view));
    for point in &view.table {
        println!("  {}  {:.1}", point.ts.format("%H:%M"), point.value);
    }
}

fn forecast_line(entity_id: &str, view: &ForecastView) -> String {
    if view.is_empty() {
        return format!("forecast {entity_id}: no points");
    }
    let eta = view
        .series
        .overflow_eta
        .map(|eta| eta.format("%H:%M").to_string())
        .unwrap_or_else(|| "none".to_string());
    let range = view
        .min_max()
        .map(|(min, max)| format!("{min:.1}..{max:.1}"))
        .unwrap_or_default();
    format!(
        "forecast {entity_id}: {} observed, {} projected, range {range}, overflow {eta}",
        view.observed.len(),
        view.projected.len()
    )
}

fn summary_line(overview: &Overview) -> String {
    let summary = &overview.summary;
    let avg_fill = summary
        .avg_fill_percent
        .map(|value| format!("{value:.0}%"))
        .unwrap_or_else(|| "-".to_string());
    let groups: Vec<String> = overview
        .groups
        .iter()
        .map(|group| format!("{}({})", group.entity_id, group.highlight_labels().join(",")))
        .collect();
    format!(
        "[{}] {} | cauldrons {} | avg fill {} | open tickets {} | anomalies {} | {}",
        overview.generated_at.format("%H:%M:%S"),
        overview.origin.as_str(),
        summary.active_cauldrons,
        avg_fill,
        summary.open_tickets,
        summary.recent_anomalies,
        if groups.is_empty() {
            "no agent activity".to_string()
        } else {
            groups.join(" ")
        }
    )
}

fn print_overview(overview: &Overview) {
    println!("{}", summary_line(overview));
    for group in &overview.groups {
        let theme = GROUP_PALETTE[palette_index(&group.entity_id, GROUP_PALETTE.len())];
        println!(
            "{} [{}] last {} agents {}",
            group.name,
            theme,
            group.latest_ts.format("%H:%M:%S"),
            group.agents.iter().cloned().collect::<Vec<_>>().join(",")
        );
        for category in Category::ALL {
            if let Some(step) = group.slot(category) {
                println!("  {:<9} #{} {}", category.label(), step.step, step.summary);
            }
        }
    }
    if let Some((entity_id, view)) = overview.primary_forecast() {
        println!("{}", forecast_line(entity_id, view));
    }
    for row in &overview.logs {
        println!(
            "log {} {} vol {:.1} ticket {} diff {:+.1}",
            row.time
                .map(|ts| ts.format("%H:%M").to_string())
                .unwrap_or_else(|| "--:--".to_string()),
            row.cauldron_id.as_deref().unwrap_or("-"),
            row.volume,
            row.ticket_id,
            row.diff_volume
        );
    }
}
