use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::aggregate::{AdminImpact, ExpectedValues, FacilityImpact, ThresholdImpacts, TileImpact};
use crate::cci::{CciOutcome, CciTotals};
use crate::domain::{CountryCode, FacilityKind, ForecastTime, StormId, UnitKey, WindThreshold, human_time};
use crate::error::ImpactError;
use crate::layers::Attribute;
use crate::severity::{Landfall, SeverityRow, SeveritySpread, spread};
use crate::store::{StorageLayout, StoragePort};

pub const TOP_FACILITIES: usize = 5;
pub const EXPECTED_THRESHOLD_KNOTS: u16 = 34;
pub const NEXT_FORECAST_HOURS: i64 = 6;

const SEVERE_POVERTY_RWI: f64 = -1.0;
const POVERTY_RWI: f64 = -0.5;
const URBAN_SMOD: f64 = 20.0;

/// Headline expected values for one threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpactFigures {
    pub population: f64,
    pub school_age: f64,
    pub infants: f64,
    pub children: f64,
    pub schools: f64,
    pub health_centers: f64,
    pub built_surface_m2: f64,
}

impl ImpactFigures {
    fn from_expected(expected: &ExpectedValues) -> Self {
        Self {
            population: expected.population,
            school_age: expected.school_age_population,
            infants: expected.infant_population,
            children: expected.children(),
            schools: expected.num_schools,
            health_centers: expected.num_hcs,
            built_surface_m2: expected.built_surface_m2,
        }
    }

    /// Signed `self - previous` for every figure.
    pub fn minus(&self, previous: &ImpactFigures) -> ImpactFigures {
        ImpactFigures {
            population: self.population - previous.population,
            school_age: self.school_age - previous.school_age,
            infants: self.infants - previous.infants,
            children: self.children - previous.children,
            schools: self.schools - previous.schools,
            health_centers: self.health_centers - previous.health_centers,
            built_surface_m2: self.built_surface_m2 - previous.built_surface_m2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSummary {
    pub threshold: WindThreshold,
    pub category: String,
    pub expected: ImpactFigures,
    /// `None` when no earlier forecast report exists for this storm.
    pub delta: Option<ImpactFigures>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeDirection {
    Increased,
    Decreased,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildrenChange {
    pub direction: ChangeDirection,
    pub change: f64,
    /// Relative to the previous figure; `None` when that figure was zero.
    pub percentage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Headline {
    pub threshold: WindThreshold,
    pub expected: ImpactFigures,
    pub delta: Option<ImpactFigures>,
    pub children_change: Option<ChildrenChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopFacility {
    pub rank: usize,
    pub facility_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub probability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminThresholdFigures {
    pub threshold: WindThreshold,
    pub expected: ImpactFigures,
    pub delta: Option<ImpactFigures>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminBreakdown {
    pub admin_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub rwi: Option<f64>,
    #[serde(default)]
    pub smod_class: Option<f64>,
    pub thresholds: Vec<AdminThresholdFigures>,
    pub cci: CciTotals,
}

/// Expected values at the headline threshold split by settlement class and
/// wealth band.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassSplit {
    pub urban: f64,
    pub rural: f64,
    pub poverty: f64,
    pub severe_poverty: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub population: ClassSplit,
    pub school_age: ClassSplit,
    pub infants: ClassSplit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactReport {
    pub country: CountryCode,
    pub storm: StormId,
    pub forecast_time: ForecastTime,
    pub forecast_date: String,
    pub report_date: String,
    pub storm_category: Option<String>,
    pub expected_landfall: String,
    pub next_forecast_date: String,
    pub previous_forecast: Option<ForecastTime>,
    pub headline: Option<Headline>,
    pub thresholds: Vec<ThresholdSummary>,
    pub top_schools: Vec<TopFacility>,
    pub top_health_centers: Vec<TopFacility>,
    pub admins: Vec<AdminBreakdown>,
    pub vulnerability: Vulnerability,
    pub cci: CciTotals,
    pub severity_spread: BTreeMap<Attribute, SeveritySpread>,
    pub nesting_violations: usize,
}

impl ImpactReport {
    fn threshold(&self, threshold: WindThreshold) -> Option<&ThresholdSummary> {
        self.thresholds
            .iter()
            .find(|summary| summary.threshold == threshold)
    }

    fn admin(&self, admin_id: &str) -> Option<&AdminBreakdown> {
        self.admins.iter().find(|admin| admin.admin_id == admin_id)
    }
}

pub struct ReportInputs<'a> {
    pub unit: &'a UnitKey,
    pub impacts: &'a BTreeMap<WindThreshold, ThresholdImpacts>,
    pub cci: &'a CciOutcome,
    pub severity: &'a [SeverityRow],
    pub landfall: Landfall,
    pub previous: Option<&'a ImpactReport>,
    pub generated_at: DateTime<Utc>,
}

/// Headline threshold: 34 kt when evaluated, else the weakest evaluated.
pub fn expected_threshold(
    impacts: &BTreeMap<WindThreshold, ThresholdImpacts>,
) -> Option<WindThreshold> {
    let preferred = WindThreshold::try_from(EXPECTED_THRESHOLD_KNOTS).ok()?;
    if impacts.contains_key(&preferred) {
        return Some(preferred);
    }
    impacts.keys().next().copied()
}

/// Strongest threshold with exposure, scanning upward until the first
/// threshold without any.
pub fn max_exposed_threshold(
    impacts: &BTreeMap<WindThreshold, ThresholdImpacts>,
) -> Option<WindThreshold> {
    let mut strongest = None;
    for (threshold, rows) in impacts {
        let exposed =
            !rows.tiles.is_empty() || !rows.schools.is_empty() || !rows.health_centers.is_empty();
        if !exposed {
            break;
        }
        strongest = Some(*threshold);
    }
    strongest
}

/// Report Composer.
pub fn compose(inputs: ReportInputs<'_>) -> ImpactReport {
    let ReportInputs {
        unit,
        impacts,
        cci,
        severity,
        landfall,
        previous,
        generated_at,
    } = inputs;

    let thresholds: Vec<ThresholdSummary> = impacts
        .iter()
        .map(|(threshold, rows)| {
            let expected = ImpactFigures::from_expected(&rows.totals());
            let delta = previous.map(|report| {
                let before = report
                    .threshold(*threshold)
                    .map(|summary| summary.expected)
                    .unwrap_or_default();
                expected.minus(&before)
            });
            ThresholdSummary {
                threshold: *threshold,
                category: threshold.category().to_string(),
                expected,
                delta,
            }
        })
        .collect();

    let headline_threshold = expected_threshold(impacts);
    let headline = headline_threshold.and_then(|threshold| {
        let summary = thresholds.iter().find(|s| s.threshold == threshold)?;
        let before = previous.map(|report| {
            report
                .headline
                .as_ref()
                .map(|headline| headline.expected)
                .unwrap_or_default()
        });
        Some(Headline {
            threshold,
            expected: summary.expected,
            delta: before.map(|before| summary.expected.minus(&before)),
            children_change: before.map(|before| children_change(&summary.expected, &before)),
        })
    });

    let (top_schools, top_health_centers, vulnerability, severity_spread) = match headline_threshold
        .and_then(|threshold| impacts.get(&threshold).map(|rows| (threshold, rows)))
    {
        Some((threshold, rows)) => (
            top_facilities(rows.facilities(FacilityKind::School)),
            top_facilities(rows.facilities(FacilityKind::HealthCenter)),
            vulnerability(&rows.tiles),
            spread(severity, threshold),
        ),
        None => Default::default(),
    };

    ImpactReport {
        country: unit.country.clone(),
        storm: unit.storm.clone(),
        forecast_time: unit.forecast_time,
        forecast_date: unit.forecast_time.to_human(),
        report_date: human_time(generated_at.naive_utc()),
        storm_category: max_exposed_threshold(impacts).map(|t| t.category().to_string()),
        expected_landfall: landfall.describe(),
        next_forecast_date: human_time(unit.forecast_time.plus_hours(NEXT_FORECAST_HOURS)),
        previous_forecast: previous.map(|report| report.forecast_time),
        headline,
        thresholds,
        top_schools,
        top_health_centers,
        admins: admin_breakdown(impacts, cci, previous),
        vulnerability,
        cci: cci.totals(),
        severity_spread,
        nesting_violations: cci.nesting_violations,
    }
}

fn children_change(current: &ImpactFigures, previous: &ImpactFigures) -> ChildrenChange {
    let change = current.children - previous.children;
    let direction = match change.partial_cmp(&0.0) {
        Some(Ordering::Greater) => ChangeDirection::Increased,
        Some(Ordering::Less) => ChangeDirection::Decreased,
        _ => ChangeDirection::Unchanged,
    };
    ChildrenChange {
        direction,
        change,
        percentage: (previous.children > 0.0).then(|| change.abs() / previous.children * 100.0),
    }
}

/// Highest probability first, ties by facility id ascending.
pub fn top_facilities(rows: &[FacilityImpact]) -> Vec<TopFacility> {
    let mut ranked: Vec<&FacilityImpact> = rows.iter().collect();
    ranked.sort_by(|a, b| {
        b.expected
            .total_cmp(&a.expected)
            .then_with(|| a.facility_id.cmp(&b.facility_id))
    });
    ranked
        .into_iter()
        .take(TOP_FACILITIES)
        .enumerate()
        .map(|(idx, row)| TopFacility {
            rank: idx + 1,
            facility_id: row.facility_id.clone(),
            name: row.name.clone(),
            category: row.category.clone(),
            probability: row.probability.value(),
        })
        .collect()
}

pub fn vulnerability(tiles: &[TileImpact]) -> Vulnerability {
    let mut result = Vulnerability::default();
    for tile in tiles {
        let classes = [
            (&mut result.population, tile.expected.population),
            (&mut result.school_age, tile.expected.school_age_population),
            (&mut result.infants, tile.expected.infant_population),
        ];
        let smod = tile.base.get(Attribute::SmodClass);
        let rwi = tile.base.get(Attribute::Rwi);
        for (split, value) in classes {
            match smod {
                Some(smod) if smod >= URBAN_SMOD => split.urban += value,
                Some(_) => split.rural += value,
                None => {}
            }
            match rwi {
                Some(rwi) if rwi < SEVERE_POVERTY_RWI => split.severe_poverty += value,
                Some(rwi) if rwi < POVERTY_RWI => split.poverty += value,
                _ => {}
            }
        }
    }
    result
}

fn admin_breakdown(
    impacts: &BTreeMap<WindThreshold, ThresholdImpacts>,
    cci: &CciOutcome,
    previous: Option<&ImpactReport>,
) -> Vec<AdminBreakdown> {
    let mut admins: BTreeMap<&str, AdminBreakdown> = BTreeMap::new();
    for (threshold, rows) in impacts {
        for admin in &rows.admins {
            let entry = admins
                .entry(admin.admin_id.as_str())
                .or_insert_with(|| empty_breakdown(admin));
            let expected = ImpactFigures::from_expected(&admin.expected);
            let delta = previous.map(|report| {
                let before = report
                    .admin(&admin.admin_id)
                    .and_then(|prev| prev.thresholds.iter().find(|t| t.threshold == *threshold))
                    .map(|prev| prev.expected)
                    .unwrap_or_default();
                expected.minus(&before)
            });
            entry.thresholds.push(AdminThresholdFigures {
                threshold: *threshold,
                expected,
                delta,
            });
        }
    }
    for record in &cci.admins {
        if let Some(entry) = admins.get_mut(record.unit_id.as_str()) {
            entry.cci = CciTotals {
                children: record.children,
                school_age: record.school_age,
                infants: record.infants,
                population: record.population,
            };
        }
    }
    admins.into_values().collect()
}

/// Static indicators are the region's base-layer values, identical in every
/// threshold's rollup.
fn empty_breakdown(admin: &AdminImpact) -> AdminBreakdown {
    AdminBreakdown {
        admin_id: admin.admin_id.clone(),
        name: admin.name.clone(),
        rwi: admin.base.rwi,
        smod_class: admin.base.smod_class,
        thresholds: Vec::new(),
        cci: CciTotals::default(),
    }
}

/// Latest stored report for the same storm and country issued before
/// `unit`'s forecast. An unreadable report is treated as absent.
pub fn previous_report<S: StoragePort>(
    store: &S,
    unit: &UnitKey,
) -> Result<Option<ImpactReport>, ImpactError> {
    let prefix = StorageLayout::report_prefix(&unit.country, &unit.storm);
    let latest = store
        .list(&prefix)?
        .iter()
        .filter_map(|key| StorageLayout::forecast_from_key(key))
        .filter(|forecast| *forecast < unit.forecast_time)
        .max();
    let Some(forecast_time) = latest else {
        return Ok(None);
    };
    let key = StorageLayout::report(&UnitKey::new(
        unit.storm.clone(),
        forecast_time,
        unit.country.clone(),
    ));
    match store.read_json::<ImpactReport>(&key) {
        Ok(report) => Ok(Some(report)),
        Err(ImpactError::Storage(message)) => {
            warn!(key = %key, error = %message, "previous report unreadable, deltas left empty");
            Ok(None)
        }
        Err(ImpactError::NotFound(_)) => Ok(None),
        Err(err) => Err(err),
    }
}
