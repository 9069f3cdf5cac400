use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::NaiveDate;
use geo::{Coord, MultiPolygon, Rect};

use storm_impact::aggregate::{AdminImpact, TileImpact};
use storm_impact::cci::{CciRecord, CciWeights};
use storm_impact::config::FacilityProbability;
use storm_impact::domain::{
    CountryCode, FacilityKind, ForecastRef, ForecastTime, StormId, UnitKey, WindThreshold,
};
use storm_impact::error::ImpactError;
use storm_impact::exposure::NotAffectedReason;
use storm_impact::geometry::{tile_bounds, tile_to_quadkey};
use storm_impact::layers::{
    AdminRegion, BaseAttributes, BaseLayerSource, BaseLayers, CountryBoundary, Facility, Tile,
    initialize_countries,
};
use storm_impact::ledger::LedgerOutcome;
use storm_impact::pipeline::{
    CancelToken, Pipeline, PipelineSettings, ProgressEvent, ProgressSink, RunOptions, UnitState,
};
use storm_impact::providers::{
    DETERMINISTIC_MEMBER, EnsembleTrack, StormEnvelope, StormSource, TrackPosition,
};
use storm_impact::report::{ChangeDirection, ImpactReport};
use storm_impact::store::{MemoryStore, StorageLayout, StoragePort};

const ZOOM: u8 = 6;
const TILE_X: u32 = 53;
const TILE_Y: u32 = 27;
const MEMBERS: u32 = 10;

fn tile_rect() -> Rect<f64> {
    tile_bounds(ZOOM, TILE_X, TILE_Y)
}

fn tile_center() -> Coord<f64> {
    tile_rect().center()
}

fn square_around(center: Coord<f64>, half: f64) -> MultiPolygon<f64> {
    MultiPolygon(vec![
        Rect::new(
            Coord {
                x: center.x - half,
                y: center.y - half,
            },
            Coord {
                x: center.x + half,
                y: center.y + half,
            },
        )
        .to_polygon(),
    ])
}

fn far_away() -> MultiPolygon<f64> {
    square_around(Coord { x: -60.0, y: 15.0 }, 0.5)
}

fn twn() -> CountryCode {
    "TWN".parse().unwrap()
}

fn threshold(knots: u16) -> WindThreshold {
    WindThreshold::try_from(knots).unwrap()
}

/// Base layers for a single-tile TWN; every other country is unavailable.
struct StagedLayers;

impl BaseLayerSource for StagedLayers {
    fn boundary(&self, country: &CountryCode) -> Result<CountryBoundary, ImpactError> {
        if country != &twn() {
            return Err(ImpactError::unavailable("staging", "no boundary"));
        }
        Ok(CountryBoundary {
            country: country.clone(),
            geometry: MultiPolygon(vec![tile_rect().to_polygon()]),
        })
    }

    fn tiles(&self, _country: &CountryCode, zoom: u8) -> Result<Vec<Tile>, ImpactError> {
        Ok(vec![Tile {
            tile_id: tile_to_quadkey(zoom, TILE_X, TILE_Y),
            admin_id: Some("TWN.1".to_string()),
            attributes: BaseAttributes {
                population: Some(1000.0),
                school_age_population: Some(200.0),
                infant_population: Some(50.0),
                built_surface_m2: Some(5000.0),
                num_schools: Some(1.0),
                num_hcs: Some(0.0),
                rwi: Some(-1.2),
                smod_class: Some(30.0),
            },
        }])
    }

    fn admins(&self, _country: &CountryCode) -> Result<Vec<AdminRegion>, ImpactError> {
        Ok(vec![AdminRegion {
            admin_id: "TWN.1".to_string(),
            name: "Taipei".to_string(),
        }])
    }

    fn facilities(
        &self,
        _country: &CountryCode,
        kind: FacilityKind,
    ) -> Result<Vec<Facility>, ImpactError> {
        let center = tile_center();
        Ok(match kind {
            FacilityKind::School => vec![Facility {
                facility_id: "s-1".to_string(),
                kind,
                name: Some("Central Elementary".to_string()),
                category: Some("primary".to_string()),
                lon: center.x,
                lat: center.y,
            }],
            FacilityKind::HealthCenter => Vec::new(),
        })
    }
}

/// Storm source serving fixed forecasts. `hits[threshold]` is how many of the
/// ten members cover the TWN tile at that threshold.
#[derive(Default)]
struct FakeStorms {
    forecasts: BTreeMap<ForecastRef, BTreeMap<u16, u32>>,
    envelope_calls: Mutex<usize>,
}

impl FakeStorms {
    fn with(mut self, storm: &str, forecast: &str, hits: &[(u16, u32)]) -> Self {
        self.forecasts.insert(
            ForecastRef {
                storm: storm.parse().unwrap(),
                forecast_time: forecast.parse().unwrap(),
            },
            hits.iter().copied().collect(),
        );
        self
    }

    fn calls(&self) -> usize {
        *self.envelope_calls.lock().unwrap()
    }
}

impl StormSource for FakeStorms {
    fn list_forecasts(&self, _since: NaiveDate) -> Result<Vec<ForecastRef>, ImpactError> {
        Ok(self.forecasts.keys().cloned().collect())
    }

    fn get_envelopes(
        &self,
        storm: &StormId,
        forecast_time: ForecastTime,
    ) -> Result<Vec<StormEnvelope>, ImpactError> {
        *self.envelope_calls.lock().unwrap() += 1;
        let key = ForecastRef {
            storm: storm.clone(),
            forecast_time,
        };
        let hits = self
            .forecasts
            .get(&key)
            .ok_or_else(|| ImpactError::unavailable("storm source", "unknown forecast"))?;
        let mut envelopes = Vec::new();
        for (knots, covering) in hits {
            for member in 1..=MEMBERS {
                let geometry = if member <= *covering {
                    square_around(tile_center(), 0.5)
                } else {
                    far_away()
                };
                envelopes.push(StormEnvelope {
                    storm: storm.clone(),
                    forecast_time,
                    ensemble_member: member,
                    threshold: threshold(*knots),
                    geometry,
                });
            }
        }
        Ok(envelopes)
    }

    fn get_tracks(
        &self,
        _storm: &StormId,
        _forecast_time: ForecastTime,
    ) -> Result<Vec<EnsembleTrack>, ImpactError> {
        let center = tile_center();
        let position = |lead_time_h, lon| TrackPosition {
            lead_time_h,
            lat: center.y,
            lon,
            wind_speed_kt: Some(60.0),
            pressure_hpa: Some(980.0),
        };
        Ok(vec![EnsembleTrack {
            member: DETERMINISTIC_MEMBER,
            positions: vec![position(0, center.x + 15.0), position(6, center.x)],
        }])
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<(UnitKey, &'static str)>>,
}

impl RecordingSink {
    fn states_for(&self, unit: &UnitKey) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key == unit)
            .map(|(_, state)| *state)
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.events
            .lock()
            .unwrap()
            .push((event.unit, event.state.name()));
    }
}

fn settings(countries: &[&str]) -> PipelineSettings {
    PipelineSettings {
        countries: countries.iter().map(|code| code.parse().unwrap()).collect(),
        zoom: ZOOM,
        buffer_km: 50.0,
        facility_buffer_m: 150.0,
        time_delta_days: 9,
        max_concurrency: 2,
        facility_probability: FacilityProbability::EnsembleFraction,
        cci_weights: CciWeights::default(),
    }
}

fn initialized_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let outcomes = initialize_countries(&store, &StagedLayers, &[twn()], ZOOM, false);
    assert!(outcomes.iter().all(|outcome| outcome.error.is_none()));
    store
}

fn pipeline(
    store: &Arc<MemoryStore>,
    storms: FakeStorms,
    countries: &[&str],
) -> Pipeline<Arc<MemoryStore>, FakeStorms, BaseLayers<Arc<MemoryStore>>> {
    Pipeline::new(
        Arc::clone(store),
        storms,
        BaseLayers::new(Arc::clone(store), ZOOM),
        settings(countries),
    )
}

fn options_for(date: &str, rewrite: bool) -> RunOptions {
    RunOptions {
        rewrite,
        storm: None,
        date: Some(date.parse().unwrap()),
    }
}

fn unit(storm: &str, forecast: &str, country: &str) -> UnitKey {
    UnitKey::new(
        storm.parse().unwrap(),
        forecast.parse().unwrap(),
        country.parse().unwrap(),
    )
}

fn output_keys(store: &MemoryStore) -> Vec<String> {
    store
        .keys()
        .into_iter()
        .filter(|key| key.starts_with("views/") || key.starts_with("reports/"))
        .collect()
}

fn close(actual: f64, expected: f64) -> bool {
    (actual - expected).abs() < 1e-9
}

#[test]
fn distant_storm_records_not_affected_without_outputs() {
    let store = initialized_store();
    let storms = FakeStorms::default().with("LORENZO", "20251015120000", &[(34, 0), (64, 0)]);
    let pipeline = pipeline(&store, storms, &["TWN"]);

    let summary = pipeline
        .run(&options_for("2025-10-15", false), &CancelToken::new(), &RecordingSink::default())
        .unwrap();

    assert_eq!(summary.not_affected, 1);
    let key = unit("LORENZO", "20251015120000", "TWN");
    let outcome = summary.outcome(&key).unwrap();
    assert_eq!(outcome.not_affected, Some(NotAffectedReason::NoIntersection));
    let entry = pipeline.ledger().get(&key).unwrap().unwrap();
    assert_eq!(entry.outcome, LedgerOutcome::NotAffected);
    assert!(output_keys(&store).is_empty());
}

#[test]
fn affected_unit_persists_views_report_and_ledger() {
    let store = initialized_store();
    let storms =
        FakeStorms::default().with("FUNG-WONG", "20251110000000", &[(34, 3), (40, 2), (50, 1)]);
    let pipeline = pipeline(&store, storms, &["TWN"]);
    let sink = RecordingSink::default();

    let summary = pipeline
        .run(&options_for("2025-11-10", false), &CancelToken::new(), &sink)
        .unwrap();
    assert_eq!(summary.persisted, 1);
    assert_eq!(summary.failed, 0);

    let key = unit("FUNG-WONG", "20251110000000", "TWN");
    assert_eq!(
        sink.states_for(&key),
        vec!["pending", "filtering", "aggregating", "composing", "persisted"]
    );
    let outcome = summary.outcome(&key).unwrap();
    assert_eq!(
        outcome.thresholds,
        vec![threshold(34), threshold(40), threshold(50)]
    );

    let tiles: Vec<TileImpact> = store
        .read_table(&StorageLayout::tile_view(&key, threshold(34)))
        .unwrap()
        .to_records()
        .unwrap();
    assert_eq!(tiles.len(), 1);
    assert_eq!(tiles[0].tile_id, tile_to_quadkey(ZOOM, TILE_X, TILE_Y));
    assert!(close(tiles[0].probability.value(), 0.3));
    assert!(close(tiles[0].expected.population, 300.0));

    let admins: Vec<AdminImpact> = store
        .read_table(&StorageLayout::admin_view(&key, threshold(34)))
        .unwrap()
        .to_records()
        .unwrap();
    assert_eq!(admins[0].name.as_deref(), Some("Taipei"));
    assert_eq!(admins[0].base.population, Some(1000.0));

    let cci: Vec<CciRecord> = store
        .read_table(&StorageLayout::cci_tile_view(&key))
        .unwrap()
        .to_records()
        .unwrap();
    let index = cci[0].index;
    // 1 * 0.3 + 2 * 0.2 + 3 * 0.1
    assert!(close(index, 1.0));
    assert!(index >= 0.3);

    let report: ImpactReport = store.read_json(&StorageLayout::report(&key)).unwrap();
    let headline = report.headline.as_ref().unwrap();
    assert_eq!(headline.threshold, threshold(34));
    assert!(close(headline.expected.population, 300.0));
    assert!(close(headline.expected.children, 75.0));
    assert!(headline.delta.is_none());
    assert!(report.previous_forecast.is_none());
    assert_eq!(report.storm_category.as_deref(), Some("Very Strong TS"));
    assert_eq!(report.expected_landfall, "November 10, 2025 06:00 UTC");
    assert_eq!(report.next_forecast_date, "November 10, 2025 06:00 UTC");
    assert_eq!(report.top_schools.len(), 1);
    assert_eq!(report.top_schools[0].facility_id, "s-1");
    assert!(close(report.top_schools[0].probability, 0.3));
    assert!(close(report.vulnerability.population.urban, 300.0));
    assert!(close(report.vulnerability.population.severe_poverty, 300.0));

    let entry = pipeline.ledger().get(&key).unwrap().unwrap();
    assert_eq!(entry.outcome, LedgerOutcome::Affected);
    assert!(entry.manifest.contains(&StorageLayout::report(&key)));
    assert!(entry.manifest.contains(&StorageLayout::track_view(&key)));
}

#[test]
fn second_run_skips_without_writes() {
    let store = initialized_store();
    let storms = FakeStorms::default().with("FUNG-WONG", "20251110000000", &[(34, 3)]);
    let pipeline = pipeline(&store, storms, &["TWN"]);
    let options = options_for("2025-11-10", false);

    pipeline
        .run(&options, &CancelToken::new(), &RecordingSink::default())
        .unwrap();
    let writes = store.write_count();
    let summary = pipeline
        .run(&options, &CancelToken::new(), &RecordingSink::default())
        .unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.persisted, 0);
    assert_eq!(store.write_count(), writes);
}

#[test]
fn rewrite_reprocesses_and_refreshes_ledger() {
    let store = initialized_store();
    let storms = FakeStorms::default().with("FUNG-WONG", "20251110000000", &[(34, 3)]);
    let pipeline = pipeline(&store, storms, &["TWN"]);
    let key = unit("FUNG-WONG", "20251110000000", "TWN");

    pipeline
        .run(&options_for("2025-11-10", false), &CancelToken::new(), &RecordingSink::default())
        .unwrap();
    let first = pipeline.ledger().get(&key).unwrap().unwrap();
    std::thread::sleep(Duration::from_millis(5));

    let summary = pipeline
        .run(&options_for("2025-11-10", true), &CancelToken::new(), &RecordingSink::default())
        .unwrap();
    assert_eq!(summary.persisted, 1);
    let second = pipeline.ledger().get(&key).unwrap().unwrap();
    assert!(second.processed_at > first.processed_at);
    assert_eq!(second.manifest, first.manifest);
}

#[test]
fn storage_failure_leaves_unit_retryable() {
    let store = initialized_store();
    let storms = FakeStorms::default().with("FUNG-WONG", "20251110000000", &[(34, 3)]);
    let pipeline = pipeline(&store, storms, &["TWN"]);
    let key = unit("FUNG-WONG", "20251110000000", "TWN");

    store.fail_writes_under(Some("reports/"));
    let summary = pipeline
        .run(&options_for("2025-11-10", false), &CancelToken::new(), &RecordingSink::default())
        .unwrap();
    assert_eq!(summary.failed, 1);
    assert_matches!(
        summary.outcome(&key).unwrap().state,
        UnitState::Failed {
            retryable: true,
            ..
        }
    );
    assert!(pipeline.ledger().get(&key).unwrap().is_none());
    assert!(output_keys(&store).is_empty());

    store.fail_writes_under(None);
    let summary = pipeline
        .run(&options_for("2025-11-10", false), &CancelToken::new(), &RecordingSink::default())
        .unwrap();
    assert_eq!(summary.persisted, 1);
    assert!(pipeline.ledger().get(&key).unwrap().is_some());
}

#[test]
fn unpublished_envelopes_stay_pending() {
    let store = initialized_store();
    let storms = FakeStorms::default().with("FUNG-WONG", "20251110000000", &[]);
    let pipeline = pipeline(&store, storms, &["TWN"]);
    let key = unit("FUNG-WONG", "20251110000000", "TWN");
    let options = options_for("2025-11-10", false);

    let summary = pipeline
        .run(&options, &CancelToken::new(), &RecordingSink::default())
        .unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.not_affected, 0);
    assert_matches!(
        summary.outcome(&key).unwrap().state,
        UnitState::Failed {
            retryable: true,
            ..
        }
    );
    assert!(pipeline.ledger().get(&key).unwrap().is_none());
    assert!(output_keys(&store).is_empty());

    pipeline
        .run(&options, &CancelToken::new(), &RecordingSink::default())
        .unwrap();
    assert_eq!(pipeline.source().calls(), 2);
}

#[test]
fn rewrite_removes_views_of_dropped_thresholds() {
    let store = initialized_store();
    let key = unit("FUNG-WONG", "20251110000000", "TWN");
    let storms =
        FakeStorms::default().with("FUNG-WONG", "20251110000000", &[(34, 3), (40, 2), (50, 1)]);
    pipeline(&store, storms, &["TWN"])
        .run(&options_for("2025-11-10", false), &CancelToken::new(), &RecordingSink::default())
        .unwrap();
    assert!(store.exists(&StorageLayout::tile_view(&key, threshold(50))).unwrap());

    let storms = FakeStorms::default().with("FUNG-WONG", "20251110000000", &[(34, 3)]);
    let rerun = pipeline(&store, storms, &["TWN"]);
    let summary = rerun
        .run(&options_for("2025-11-10", true), &CancelToken::new(), &RecordingSink::default())
        .unwrap();
    assert_eq!(summary.persisted, 1);

    for knots in [40, 50] {
        assert!(!store.exists(&StorageLayout::tile_view(&key, threshold(knots))).unwrap());
        assert!(!store.exists(&StorageLayout::admin_view(&key, threshold(knots))).unwrap());
        assert!(!store
            .exists(&StorageLayout::facility_view(&key, FacilityKind::School, threshold(knots)))
            .unwrap());
    }
    assert!(store.exists(&StorageLayout::tile_view(&key, threshold(34))).unwrap());

    let entry = rerun.ledger().get(&key).unwrap().unwrap();
    let mut manifest = entry.manifest.clone();
    manifest.sort();
    assert_eq!(manifest, output_keys(&store));
}

#[test]
fn rewrite_to_not_affected_clears_outputs() {
    let store = initialized_store();
    let key = unit("FUNG-WONG", "20251110000000", "TWN");
    let storms = FakeStorms::default().with("FUNG-WONG", "20251110000000", &[(34, 3)]);
    pipeline(&store, storms, &["TWN"])
        .run(&options_for("2025-11-10", false), &CancelToken::new(), &RecordingSink::default())
        .unwrap();
    assert!(!output_keys(&store).is_empty());

    let storms = FakeStorms::default().with("FUNG-WONG", "20251110000000", &[(34, 0)]);
    let rerun = pipeline(&store, storms, &["TWN"]);
    let summary = rerun
        .run(&options_for("2025-11-10", true), &CancelToken::new(), &RecordingSink::default())
        .unwrap();

    assert_eq!(summary.not_affected, 1);
    let entry = rerun.ledger().get(&key).unwrap().unwrap();
    assert_eq!(entry.outcome, LedgerOutcome::NotAffected);
    assert!(entry.manifest.is_empty());
    assert!(output_keys(&store).is_empty());
    assert!(!store.exists(&StorageLayout::report(&key)).unwrap());
}

#[test]
fn failed_persist_leaves_no_partial_views() {
    let store = initialized_store();
    let storms = FakeStorms::default().with("FUNG-WONG", "20251110000000", &[(34, 3), (40, 2)]);
    let pipeline = pipeline(&store, storms, &["TWN"]);
    let key = unit("FUNG-WONG", "20251110000000", "TWN");

    store.fail_writes_under(Some("views/cci/"));
    let summary = pipeline
        .run(&options_for("2025-11-10", false), &CancelToken::new(), &RecordingSink::default())
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert!(summary.outcome(&key).unwrap().manifest.is_empty());
    assert!(output_keys(&store).is_empty());
    assert!(pipeline.ledger().get(&key).unwrap().is_none());
}

#[test]
fn failed_rewrite_drops_earlier_pass() {
    let store = initialized_store();
    let storms = FakeStorms::default().with("FUNG-WONG", "20251110000000", &[(34, 3)]);
    let pipeline = pipeline(&store, storms, &["TWN"]);
    let key = unit("FUNG-WONG", "20251110000000", "TWN");

    pipeline
        .run(&options_for("2025-11-10", false), &CancelToken::new(), &RecordingSink::default())
        .unwrap();
    assert!(pipeline.ledger().get(&key).unwrap().is_some());

    store.fail_writes_under(Some("reports/"));
    let summary = pipeline
        .run(&options_for("2025-11-10", true), &CancelToken::new(), &RecordingSink::default())
        .unwrap();
    assert_eq!(summary.failed, 1);
    assert!(output_keys(&store).is_empty());
    assert!(pipeline.ledger().get(&key).unwrap().is_none());

    store.fail_writes_under(None);
    let summary = pipeline
        .run(&options_for("2025-11-10", false), &CancelToken::new(), &RecordingSink::default())
        .unwrap();
    assert_eq!(summary.persisted, 1);
}

#[test]
fn malformed_base_tile_fails_without_retry() {
    let store = initialized_store();
    store
        .write_json(
            &StorageLayout::tiles(&twn(), ZOOM),
            &vec![Tile {
                tile_id: "9x".to_string(),
                admin_id: Some("TWN.1".to_string()),
                attributes: BaseAttributes::default(),
            }],
        )
        .unwrap();
    let storms = FakeStorms::default().with("FUNG-WONG", "20251110000000", &[(34, 3)]);
    let pipeline = pipeline(&store, storms, &["TWN"]);
    let key = unit("FUNG-WONG", "20251110000000", "TWN");

    let summary = pipeline
        .run(&options_for("2025-11-10", false), &CancelToken::new(), &RecordingSink::default())
        .unwrap();

    assert_matches!(
        summary.outcome(&key).unwrap().state,
        UnitState::Failed {
            retryable: false,
            ..
        }
    );
    assert!(output_keys(&store).is_empty());
    assert!(pipeline.ledger().get(&key).unwrap().is_none());
}

#[test]
fn report_delta_follows_previous_forecast() {
    let store = initialized_store();
    let storms = FakeStorms::default()
        .with("FUNG-WONG", "20251110000000", &[(34, 3)])
        .with("FUNG-WONG", "20251110060000", &[(34, 5), (40, 1)]);
    let pipeline = pipeline(&store, storms, &["TWN"]);

    let summary = pipeline
        .run(&options_for("2025-11-10", false), &CancelToken::new(), &RecordingSink::default())
        .unwrap();
    assert_eq!(summary.persisted, 2);

    let first = unit("FUNG-WONG", "20251110000000", "TWN");
    let second = unit("FUNG-WONG", "20251110060000", "TWN");
    let earlier: ImpactReport = store.read_json(&StorageLayout::report(&first)).unwrap();
    let later: ImpactReport = store.read_json(&StorageLayout::report(&second)).unwrap();

    assert!(earlier.headline.as_ref().unwrap().delta.is_none());
    assert_eq!(later.previous_forecast, Some(first.forecast_time));

    let headline = later.headline.as_ref().unwrap();
    let delta = headline.delta.unwrap();
    assert!(close(delta.population, 200.0));
    assert!(close(delta.children, 50.0));
    let change = headline.children_change.as_ref().unwrap();
    assert_eq!(change.direction, ChangeDirection::Increased);
    assert!((change.percentage.unwrap() - 66.666_666_666).abs() < 1e-6);

    // 40 kt was not evaluated for the earlier forecast and counts as zero.
    let at_40 = later
        .thresholds
        .iter()
        .find(|summary| summary.threshold == threshold(40))
        .unwrap();
    assert!(close(at_40.delta.unwrap().population, 100.0));
}

#[test]
fn unavailable_boundary_skips_country_without_ledger() {
    let store = initialized_store();
    let storms = FakeStorms::default().with("FUNG-WONG", "20251110000000", &[(34, 3)]);
    let pipeline = pipeline(&store, storms, &["TWN", "JAM"]);

    let summary = pipeline
        .run(&options_for("2025-11-10", false), &CancelToken::new(), &RecordingSink::default())
        .unwrap();

    assert_eq!(summary.persisted, 1);
    let jam = unit("FUNG-WONG", "20251110000000", "JAM");
    assert_matches!(
        summary.outcome(&jam).unwrap().not_affected,
        Some(NotAffectedReason::BoundaryUnavailable { .. })
    );
    assert!(pipeline.ledger().get(&jam).unwrap().is_none());
}

#[test]
fn storm_and_date_filters_limit_discovery() {
    let store = initialized_store();
    let storms = FakeStorms::default()
        .with("FUNG-WONG", "20251110000000", &[(34, 3)])
        .with("LORENZO", "20251015120000", &[(34, 0)]);
    let pipeline = pipeline(&store, storms, &["TWN"]);

    let options = RunOptions {
        rewrite: false,
        storm: Some("lorenzo".parse().unwrap()),
        date: None,
    };
    let today: NaiveDate = "2025-10-20".parse().unwrap();
    let forecasts = pipeline.discover(&options, today).unwrap();
    assert_eq!(forecasts.len(), 1);
    assert_eq!(forecasts[0].storm.as_str(), "LORENZO");

    let forecasts = pipeline
        .discover(&options_for("2025-11-10", false), today)
        .unwrap();
    assert_eq!(forecasts.len(), 1);
    assert_eq!(forecasts[0].storm.as_str(), "FUNG-WONG");
}

#[test]
fn cancelled_run_writes_nothing() {
    let store = initialized_store();
    let storms = FakeStorms::default().with("FUNG-WONG", "20251110000000", &[(34, 3)]);
    let pipeline = pipeline(&store, storms, &["TWN"]);
    let writes = store.write_count();

    let cancel = CancelToken::new();
    cancel.cancel();
    let summary = pipeline
        .run(&options_for("2025-11-10", false), &cancel, &RecordingSink::default())
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(store.write_count(), writes);
}

#[test]
fn skipped_forecasts_do_not_fetch_storm_data() {
    let store = initialized_store();
    let storms = FakeStorms::default().with("FUNG-WONG", "20251110000000", &[(34, 3)]);
    let pipeline = pipeline(&store, storms, &["TWN"]);
    let options = options_for("2025-11-10", false);

    pipeline
        .run(&options, &CancelToken::new(), &RecordingSink::default())
        .unwrap();
    pipeline
        .run(&options, &CancelToken::new(), &RecordingSink::default())
        .unwrap();
    assert_eq!(pipeline_source_calls(&pipeline), 1);
}

fn pipeline_source_calls(
    pipeline: &Pipeline<Arc<MemoryStore>, FakeStorms, BaseLayers<Arc<MemoryStore>>>,
) -> usize {
    pipeline.source().calls()
}
