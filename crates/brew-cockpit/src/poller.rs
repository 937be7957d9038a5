use crate::assemble::{assemble_overview, focus_entity, AssembleInput};
use crate::client::SnapshotSource;
use crate::fixture::fixture_snapshot;
use brew_core::snapshot::{
    parse_forecast_response, parse_snapshot, RawForecast, SnapshotRecords,
};
use brew_core::{Overview, SnapshotOrigin, TraceStep};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub fixture_only: bool,
    pub horizon_minutes: u32,
    pub max_forecasts: usize,
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    pub cycle: CycleSettings,
}

/// One fetch-and-recompute cycle. Never fails: a dead backend yields the
/// fixture snapshot, a dead forecast yields no entry for that entity.
pub async fn run_cycle(
    source: &dyn SnapshotSource,
    settings: &CycleSettings,
    seeded_trace: &[TraceStep],
    now: DateTime<Utc>,
) -> Overview {
    let (records, origin) = load_records(source, settings).await;
    let fetched_forecasts = match origin {
        SnapshotOrigin::Live => fetch_forecasts(source, settings, &records, seeded_trace).await,
        SnapshotOrigin::Fixture => BTreeMap::new(),
    };
    assemble_overview(AssembleInput {
        records,
        fetched_forecasts,
        seeded_trace,
        origin,
        now,
    })
}

async fn load_records(
    source: &dyn SnapshotSource,
    settings: &CycleSettings,
) -> (SnapshotRecords, SnapshotOrigin) {
    if !settings.fixture_only {
        match source.fetch_snapshot().await {
            Ok(root) => match parse_snapshot(&root) {
                Ok(records) => return (records, SnapshotOrigin::Live),
                Err(err) => warn!(event = "snapshot_fetch_error", error = %err),
            },
            Err(err) => warn!(event = "snapshot_fetch_error", error = %err),
        }
    }

    info!(event = "snapshot_fixture_fallback", fixture_only = settings.fixture_only);
    let records = match fixture_snapshot().and_then(|root| parse_snapshot(&root)) {
        Ok(records) => records,
        Err(err) => {
            warn!(event = "snapshot_fixture_fallback", error = %err);
            SnapshotRecords::default()
        }
    };
    (records, SnapshotOrigin::Fixture)
}

/// Focus entity first, then listed cauldrons, capped.
pub fn forecast_targets(
    records: &SnapshotRecords,
    seeded_trace: &[TraceStep],
    max: usize,
) -> Vec<String> {
    let trace: Vec<TraceStep> = records
        .trace
        .iter()
        .chain(seeded_trace)
        .cloned()
        .collect();
    let mut seen = BTreeSet::new();
    focus_entity(&trace, &records.cauldrons)
        .into_iter()
        .chain(records.cauldrons.iter().map(|cauldron| cauldron.id.clone()))
        .filter(|entity_id| seen.insert(entity_id.clone()))
        .take(max)
        .collect()
}

async fn fetch_forecasts(
    source: &dyn SnapshotSource,
    settings: &CycleSettings,
    records: &SnapshotRecords,
    seeded_trace: &[TraceStep],
) -> BTreeMap<String, RawForecast> {
    let mut fetched = BTreeMap::new();
    for entity_id in forecast_targets(records, seeded_trace, settings.max_forecasts) {
        match source
            .fetch_forecast(&entity_id, settings.horizon_minutes)
            .await
        {
            Ok(body) => match parse_forecast_response(&body) {
                Some(raw) => {
                    fetched.insert(entity_id, raw);
                }
                None => debug!(
                    event = "forecast_fetch_error",
                    entity_id = %entity_id,
                    reason = "no series"
                ),
            },
            Err(err) => {
                warn!(event = "forecast_fetch_error", entity_id = %entity_id, error = %err);
            }
        }
    }
    fetched
}

/// Holds the overview of whichever cycle landed last, until the poller stops.
struct Published {
    tx: watch::Sender<Arc<Overview>>,
    stopped: watch::Receiver<bool>,
    landed: Mutex<u64>,
}

impl Published {
    fn new(tx: watch::Sender<Arc<Overview>>, stopped: watch::Receiver<bool>) -> Self {
        Self {
            tx,
            stopped,
            landed: Mutex::new(0),
        }
    }

    async fn offer(&self, generation: u64, overview: Overview) -> bool {
        let mut landed = self.landed.lock().await;
        if *self.stopped.borrow() {
            debug!(event = "poll_cycle_stale", generation, reason = "stopped");
            return false;
        }
        *landed += 1;
        info!(
            event = "poll_cycle",
            generation,
            landed = *landed,
            origin = overview.origin.as_str(),
            cauldrons = overview.cauldrons.len(),
            groups = overview.groups.len(),
            forecasts = overview.forecasts.len()
        );
        self.tx.send_replace(Arc::new(overview));
        true
    }
}

pub struct Poller;

impl Poller {
    pub fn start(source: Arc<dyn SnapshotSource>, config: PollerConfig) -> PollerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let initial = Arc::new(Overview::empty(Utc::now(), SnapshotOrigin::Fixture));
        let (latest_tx, latest_rx) = watch::channel(initial);
        let published = Arc::new(Published::new(latest_tx, shutdown_rx.clone()));
        let task = tokio::spawn(poll_loop(source, config, published, shutdown_rx));
        PollerHandle {
            shutdown: shutdown_tx,
            latest: latest_rx,
            task,
        }
    }
}

async fn poll_loop(
    source: Arc<dyn SnapshotSource>,
    config: PollerConfig,
    published: Arc<Published>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        event = "poll_start",
        interval_ms = config.poll_interval.as_millis() as u64,
        fixture_only = config.cycle.fixture_only
    );
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut generation: u64 = 0;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                generation += 1;
                let source = source.clone();
                let settings = config.cycle.clone();
                let published = published.clone();
                tokio::spawn(async move {
                    let overview = run_cycle(source.as_ref(), &settings, &[], Utc::now()).await;
                    published.offer(generation, overview).await;
                });
            }
        }
    }

    info!(event = "poll_stop", cycles = generation);
}

pub struct PollerHandle {
    shutdown: watch::Sender<bool>,
    latest: watch::Receiver<Arc<Overview>>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Stops scheduling; cycles still in flight are discarded on completion.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn latest(&self) -> Arc<Overview> {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Overview>> {
        self.latest.clone()
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}
