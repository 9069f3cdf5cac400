use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::aggregate::{Aggregator, ThresholdImpacts, admin_baselines, rollup_admins};
use crate::cci::{self, CciOutcome, CciWeights};
use crate::config::{FacilityProbability, ResolvedConfig};
use crate::domain::{CountryCode, FacilityKind, ForecastRef, StormId, UnitKey, WindThreshold};
use crate::error::ImpactError;
use crate::exposure::{BoundaryCache, EnsembleEnvelopes, Exposure, NotAffectedReason, filter_country};
use crate::layers::{BaseLayers, BoundaryProvider, Facility};
use crate::ledger::{Ledger, LedgerEntry, LedgerOutcome};
use crate::providers::{EnsembleTrack, StormSource};
use crate::report::{ImpactReport, ReportInputs, compose, previous_report};
use crate::severity::{SeverityRow, expected_landfall, score_tracks};
use crate::store::{StorageLayout, StoragePort, Table, TableFormat};

/// Lifecycle of one (storm, forecast, country) unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum UnitState {
    Pending,
    Filtering,
    Aggregating,
    Composing,
    Persisted,
    Skipped,
    NotAffected,
    Failed { reason: String, retryable: bool },
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitState::Persisted | UnitState::Skipped | UnitState::NotAffected | UnitState::Failed { .. }
        )
    }

    pub fn can_transition_to(&self, next: &UnitState) -> bool {
        use UnitState::*;
        match (self, next) {
            (_, Failed { .. }) => !self.is_terminal(),
            (Pending, Filtering | Skipped) => true,
            (Filtering, Aggregating | NotAffected) => true,
            (Aggregating, Composing) => true,
            (Composing, Persisted) => true,
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            UnitState::Pending => "pending",
            UnitState::Filtering => "filtering",
            UnitState::Aggregating => "aggregating",
            UnitState::Composing => "composing",
            UnitState::Persisted => "persisted",
            UnitState::Skipped => "skipped",
            UnitState::NotAffected => "not-affected",
            UnitState::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub unit: UnitKey,
    pub state: UnitState,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

/// Cooperative abort flag checked between unit stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), ImpactError> {
        if self.is_cancelled() {
            Err(ImpactError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub rewrite: bool,
    pub storm: Option<StormId>,
    /// Restricts the run to forecasts issued on this day.
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub countries: Vec<CountryCode>,
    pub zoom: u8,
    pub buffer_km: f64,
    pub facility_buffer_m: f64,
    pub time_delta_days: i64,
    pub max_concurrency: usize,
    pub facility_probability: FacilityProbability,
    pub cci_weights: CciWeights,
}

impl PipelineSettings {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            countries: config.countries.clone(),
            zoom: config.zoom,
            buffer_km: config.buffer_km,
            facility_buffer_m: config.facility_buffer_m,
            time_delta_days: config.time_delta_days,
            max_concurrency: config.max_concurrency,
            facility_probability: config.facility_probability,
            cci_weights: config.cci_weights.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitOutcome {
    pub unit: UnitKey,
    #[serde(flatten)]
    pub state: UnitState,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub thresholds: Vec<WindThreshold>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_affected: Option<NotAffectedReason>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub manifest: Vec<String>,
    pub nesting_violations: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub forecasts: Vec<ForecastRef>,
    pub persisted: usize,
    pub skipped: usize,
    pub not_affected: usize,
    pub failed: usize,
    pub units: Vec<UnitOutcome>,
}

impl RunSummary {
    fn new(
        started_at: DateTime<Utc>,
        forecasts: Vec<ForecastRef>,
        mut units: Vec<UnitOutcome>,
    ) -> Self {
        units.sort_by(|a, b| a.unit.cmp(&b.unit));
        let count = |pred: fn(&UnitState) -> bool| units.iter().filter(|u| pred(&u.state)).count();
        Self {
            started_at,
            finished_at: Utc::now(),
            forecasts,
            persisted: count(|s| matches!(s, UnitState::Persisted)),
            skipped: count(|s| matches!(s, UnitState::Skipped)),
            not_affected: count(|s| matches!(s, UnitState::NotAffected)),
            failed: count(|s| matches!(s, UnitState::Failed { .. })),
            units,
        }
    }

    pub fn outcome(&self, unit: &UnitKey) -> Option<&UnitOutcome> {
        self.units.iter().find(|outcome| &outcome.unit == unit)
    }
}

/// Tracks one unit's state and reports every transition.
struct UnitTracker<'a> {
    unit: UnitKey,
    state: UnitState,
    started: Instant,
    sink: &'a dyn ProgressSink,
}

impl<'a> UnitTracker<'a> {
    fn new(unit: UnitKey, sink: &'a dyn ProgressSink) -> Self {
        sink.event(ProgressEvent {
            unit: unit.clone(),
            state: UnitState::Pending,
            elapsed: None,
        });
        Self {
            unit,
            state: UnitState::Pending,
            started: Instant::now(),
            sink,
        }
    }

    fn advance(&mut self, next: UnitState) -> Result<(), ImpactError> {
        if !self.state.can_transition_to(&next) {
            return Err(ImpactError::InvariantViolation(format!(
                "illegal transition {} -> {} for {}",
                self.state.name(),
                next.name(),
                self.unit
            )));
        }
        info!(
            storm = %self.unit.storm,
            forecast = %self.unit.forecast_time,
            country = %self.unit.country,
            state = next.name(),
            "unit state changed"
        );
        self.state = next;
        self.sink.event(ProgressEvent {
            unit: self.unit.clone(),
            state: self.state.clone(),
            elapsed: Some(self.started.elapsed()),
        });
        Ok(())
    }

    fn fail(&mut self, err: &ImpactError) {
        error!(
            storm = %self.unit.storm,
            forecast = %self.unit.forecast_time,
            country = %self.unit.country,
            state = self.state.name(),
            retryable = err.is_retryable(),
            error = %err,
            "unit failed"
        );
        let failed = UnitState::Failed {
            reason: err.to_string(),
            retryable: err.is_retryable(),
        };
        if self.state.can_transition_to(&failed) {
            self.state = failed;
            self.sink.event(ProgressEvent {
                unit: self.unit.clone(),
                state: self.state.clone(),
                elapsed: Some(self.started.elapsed()),
            });
        }
    }
}

/// Inputs shared by every unit of one forecast. Read-only for the run.
struct ForecastInputs {
    envelopes: EnsembleEnvelopes,
    tracks: Vec<EnsembleTrack>,
}

/// Pipeline Orchestrator.
pub struct Pipeline<S, W, B>
where
    S: StoragePort + Clone,
    W: StormSource,
    B: BoundaryProvider,
{
    store: S,
    source: W,
    boundaries: B,
    ledger: Ledger<S>,
    layers: BaseLayers<S>,
    settings: PipelineSettings,
}

impl<S, W, B> Pipeline<S, W, B>
where
    S: StoragePort + Clone,
    W: StormSource,
    B: BoundaryProvider,
{
    pub fn new(store: S, source: W, boundaries: B, settings: PipelineSettings) -> Self {
        Self {
            ledger: Ledger::new(store.clone()),
            layers: BaseLayers::new(store.clone(), settings.zoom),
            store,
            source,
            boundaries,
            settings,
        }
    }

    pub fn ledger(&self) -> &Ledger<S> {
        &self.ledger
    }

    pub fn source(&self) -> &W {
        &self.source
    }

    /// Forecasts to consider: issued on `options.date` when given, otherwise
    /// within `time_delta_days` of `today`.
    pub fn discover(
        &self,
        options: &RunOptions,
        today: NaiveDate,
    ) -> Result<Vec<ForecastRef>, ImpactError> {
        let since = match options.date {
            Some(date) => date,
            None => today - chrono::Duration::days(self.settings.time_delta_days),
        };
        let forecasts: BTreeSet<ForecastRef> = self
            .source
            .list_forecasts(since)?
            .into_iter()
            .filter(|forecast| {
                options
                    .storm
                    .as_ref()
                    .is_none_or(|storm| &forecast.storm == storm)
            })
            .filter(|forecast| {
                options
                    .date
                    .is_none_or(|date| forecast.forecast_time.date() == date)
            })
            .collect();
        Ok(forecasts.into_iter().collect())
    }

    pub fn run(
        &self,
        options: &RunOptions,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, ImpactError> {
        let started_at = Utc::now();
        let forecasts = self.discover(options, started_at.date_naive())?;
        info!(forecasts = forecasts.len(), rewrite = options.rewrite, "starting update run");

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.max_concurrency)
            .build()
            .map_err(|err| ImpactError::InvalidConfig(format!("worker pool: {err}")))?;
        let cache = BoundaryCache::new(&self.boundaries, self.settings.buffer_km);

        let mut outcomes = Vec::new();
        for forecast in &forecasts {
            outcomes.extend(self.run_forecast(forecast, options, &pool, &cache, cancel, sink));
        }

        let summary = RunSummary::new(started_at, forecasts, outcomes);
        info!(
            persisted = summary.persisted,
            skipped = summary.skipped,
            not_affected = summary.not_affected,
            failed = summary.failed,
            "update run finished"
        );
        Ok(summary)
    }

    fn run_forecast(
        &self,
        forecast: &ForecastRef,
        options: &RunOptions,
        pool: &rayon::ThreadPool,
        cache: &BoundaryCache<'_>,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Vec<UnitOutcome> {
        let mut outcomes = Vec::new();
        let mut pending = Vec::new();
        for country in &self.settings.countries {
            let unit = UnitKey::new(
                forecast.storm.clone(),
                forecast.forecast_time,
                country.clone(),
            );
            let decision = self.ledger.should_process(&unit, options.rewrite);
            if let Ok(true) = decision {
                pending.push(unit);
                continue;
            }
            let mut tracker = UnitTracker::new(unit.clone(), sink);
            match decision {
                Err(err) => tracker.fail(&err),
                _ => {
                    if let Err(err) = tracker.advance(UnitState::Skipped) {
                        tracker.fail(&err);
                    }
                }
            }
            outcomes.push(outcome(unit, tracker.state));
        }
        if pending.is_empty() {
            return outcomes;
        }

        let inputs = match self.fetch_inputs(forecast) {
            Ok(inputs) => inputs,
            Err(err) => {
                warn!(storm = %forecast.storm, forecast = %forecast.forecast_time, error = %err, "storm data unavailable");
                for unit in pending {
                    let mut tracker = UnitTracker::new(unit.clone(), sink);
                    tracker.fail(&err);
                    outcomes.push(outcome(unit, tracker.state));
                }
                return outcomes;
            }
        };

        let processed: Vec<UnitOutcome> = pool.install(|| {
            pending
                .par_iter()
                .map(|unit| self.process_unit(unit, &inputs, cache, cancel, sink))
                .collect()
        });
        outcomes.extend(processed);
        outcomes
    }

    fn fetch_inputs(&self, forecast: &ForecastRef) -> Result<ForecastInputs, ImpactError> {
        let envelopes = self
            .source
            .get_envelopes(&forecast.storm, forecast.forecast_time)?;
        if envelopes.is_empty() {
            return Err(ImpactError::unavailable(
                "storm envelopes",
                format!(
                    "none published yet for {} {}",
                    forecast.storm, forecast.forecast_time
                ),
            ));
        }
        let tracks = self
            .source
            .get_tracks(&forecast.storm, forecast.forecast_time)?;
        info!(
            storm = %forecast.storm,
            forecast = %forecast.forecast_time,
            envelopes = envelopes.len(),
            tracks = tracks.len(),
            "storm data loaded"
        );
        Ok(ForecastInputs {
            envelopes: EnsembleEnvelopes::new(&envelopes),
            tracks,
        })
    }

    fn process_unit(
        &self,
        unit: &UnitKey,
        inputs: &ForecastInputs,
        cache: &BoundaryCache<'_>,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> UnitOutcome {
        let mut tracker = UnitTracker::new(unit.clone(), sink);
        let mut result = outcome(unit.clone(), UnitState::Pending);
        if let Err(err) = self.execute(&mut tracker, &mut result, inputs, cache, cancel) {
            tracker.fail(&err);
        }
        result.state = tracker.state;
        result
    }

    fn execute(
        &self,
        tracker: &mut UnitTracker<'_>,
        result: &mut UnitOutcome,
        inputs: &ForecastInputs,
        cache: &BoundaryCache<'_>,
        cancel: &CancelToken,
    ) -> Result<(), ImpactError> {
        let unit = tracker.unit.clone();
        cancel.check()?;
        tracker.advance(UnitState::Filtering)?;
        let prior = self.ledger.get(&unit)?;

        let (thresholds, geometry) = match filter_country(cache, &unit.country, &inputs.envelopes) {
            Exposure::Affected {
                thresholds,
                geometry,
            } => (thresholds, geometry),
            Exposure::NotAffected(reason) => {
                if reason == NotAffectedReason::NoIntersection {
                    self.commit(&unit, prior.as_ref(), LedgerOutcome::NotAffected, Vec::new())?;
                }
                result.not_affected = Some(reason);
                return tracker.advance(UnitState::NotAffected);
            }
        };
        result.thresholds = thresholds.clone();
        cancel.check()?;
        tracker.advance(UnitState::Aggregating)?;

        let tiles = self.layers.tiles(&unit.country)?;
        let admins = self.layers.admins(&unit.country)?;
        let schools = self.facilities(&unit.country, FacilityKind::School)?;
        let health_centers = self.facilities(&unit.country, FacilityKind::HealthCenter)?;
        let baselines = admin_baselines(&tiles);

        let aggregator = Aggregator::new(
            &inputs.envelopes,
            self.settings.facility_probability,
            self.settings.facility_buffer_m,
        );
        let mut impacts = BTreeMap::new();
        for threshold in &thresholds {
            let tile_rows = aggregator.tiles(*threshold, &tiles)?;
            let admin_rows = rollup_admins(*threshold, &tile_rows, &baselines, &admins)?;
            impacts.insert(
                *threshold,
                ThresholdImpacts {
                    tiles: tile_rows,
                    admins: admin_rows,
                    schools: aggregator.facilities(*threshold, &schools)?,
                    health_centers: aggregator.facilities(*threshold, &health_centers)?,
                },
            );
        }
        let severity = score_tracks(
            &unit.country,
            &inputs.envelopes,
            &inputs.tracks,
            &thresholds,
            &tiles,
            &schools,
            &health_centers,
        )?;
        let cci = cci::compute(&self.settings.cci_weights, &impacts)?;
        result.nesting_violations = cci.nesting_violations;
        cancel.check()?;
        tracker.advance(UnitState::Composing)?;

        let previous = previous_report(&self.store, &unit)?;
        let report = compose(ReportInputs {
            unit: &unit,
            impacts: &impacts,
            cci: &cci,
            severity: &severity,
            landfall: expected_landfall(&inputs.tracks, &geometry.boundary, unit.forecast_time),
            previous: previous.as_ref(),
            generated_at: Utc::now(),
        });
        cancel.check()?;

        let mut manifest = Vec::new();
        if let Err(err) = self.write_outputs(&unit, &impacts, &cci, &severity, &report, &mut manifest) {
            self.discard(&unit, prior.as_ref(), &manifest);
            return Err(err);
        }
        self.commit(&unit, prior.as_ref(), LedgerOutcome::Affected, manifest.clone())?;
        result.manifest = manifest;
        tracker.advance(UnitState::Persisted)
    }

    fn write_outputs(
        &self,
        unit: &UnitKey,
        impacts: &BTreeMap<WindThreshold, ThresholdImpacts>,
        cci: &CciOutcome,
        severity: &[SeverityRow],
        report: &ImpactReport,
        manifest: &mut Vec<String>,
    ) -> Result<(), ImpactError> {
        for (threshold, rows) in impacts {
            self.write_view(manifest, StorageLayout::tile_view(unit, *threshold), &rows.tiles)?;
            self.write_view(manifest, StorageLayout::admin_view(unit, *threshold), &rows.admins)?;
            for kind in FacilityKind::all() {
                self.write_view(
                    manifest,
                    StorageLayout::facility_view(unit, kind, *threshold),
                    rows.facilities(kind),
                )?;
            }
        }
        self.write_view(manifest, StorageLayout::cci_tile_view(unit), &cci.tiles)?;
        self.write_view(manifest, StorageLayout::cci_admin_view(unit), &cci.admins)?;
        self.write_view(manifest, StorageLayout::track_view(unit), severity)?;
        let report_key = StorageLayout::report(unit);
        self.store.write_json(&report_key, report)?;
        manifest.push(report_key);
        Ok(())
    }

    /// Removes outputs of the unit's earlier pass that `manifest` no longer
    /// lists, then records the new ledger entry. A failure here discards the
    /// unit so the next run starts it over.
    fn commit(
        &self,
        unit: &UnitKey,
        prior: Option<&LedgerEntry>,
        outcome: LedgerOutcome,
        manifest: Vec<String>,
    ) -> Result<(), ImpactError> {
        let committed = self
            .remove_stale(unit, prior, &manifest)
            .and_then(|()| self.ledger.put(unit, outcome, manifest.clone()));
        if let Err(err) = committed {
            self.discard(unit, prior, &manifest);
            return Err(err);
        }
        Ok(())
    }

    fn remove_stale(
        &self,
        unit: &UnitKey,
        prior: Option<&LedgerEntry>,
        keep: &[String],
    ) -> Result<(), ImpactError> {
        let Some(prior) = prior else {
            return Ok(());
        };
        let stale: Vec<&String> = prior
            .manifest
            .iter()
            .filter(|key| !keep.contains(key))
            .collect();
        for key in &stale {
            self.store.delete(key)?;
        }
        if !stale.is_empty() {
            info!(unit = %unit, removed = stale.len(), "outputs of earlier pass removed");
        }
        Ok(())
    }

    /// Best-effort cleanup after a failed persist. The unit keeps neither
    /// partial outputs nor a ledger entry describing an earlier pass.
    fn discard(&self, unit: &UnitKey, prior: Option<&LedgerEntry>, written: &[String]) {
        let earlier = prior.map(|entry| entry.manifest.as_slice()).unwrap_or(&[]);
        for key in written.iter().chain(earlier) {
            if let Err(err) = self.store.delete(key) {
                warn!(unit = %unit, key = %key, error = %err, "could not remove partial output");
            }
        }
        if prior.is_some() {
            if let Err(err) = self.ledger.remove(unit) {
                warn!(unit = %unit, error = %err, "could not remove ledger entry");
            }
        }
    }

    /// Facility lists that are temporarily unavailable are skipped with a
    /// warning; the unit proceeds without them.
    fn facilities(
        &self,
        country: &CountryCode,
        kind: FacilityKind,
    ) -> Result<Vec<Facility>, ImpactError> {
        match self.boundaries.get_facilities(country, kind) {
            Ok(facilities) => Ok(facilities),
            Err(err) if err.is_retryable() => {
                warn!(country = %country, kind = %kind, error = %err, "facilities unavailable, skipping");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    fn write_view<T: Serialize>(
        &self,
        manifest: &mut Vec<String>,
        key: String,
        rows: &[T],
    ) -> Result<(), ImpactError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.store
            .write_table(&key, &Table::from_records(rows)?, TableFormat::Csv)?;
        manifest.push(key);
        Ok(())
    }
}

fn outcome(unit: UnitKey, state: UnitState) -> UnitOutcome {
    UnitOutcome {
        unit,
        state,
        thresholds: Vec::new(),
        not_affected: None,
        manifest: Vec::new(),
        nesting_violations: 0,
    }
}
