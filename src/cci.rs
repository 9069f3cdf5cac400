use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::aggregate::{ThresholdImpacts, weighted_mean};
use crate::domain::WindThreshold;
use crate::error::ImpactError;
use crate::layers::{Attribute, BaseAttributes};

const NESTING_TOLERANCE: f64 = 1e-9;

/// Non-negative weight per wind threshold. Thresholds not listed keep their
/// default ordinal weight (1 for 34 kt up to 8 for 137 kt).
#[derive(Debug, Clone, PartialEq)]
pub struct CciWeights(BTreeMap<WindThreshold, f64>);

impl CciWeights {
    pub fn new(overrides: BTreeMap<WindThreshold, f64>) -> Result<Self, ImpactError> {
        let mut weights = Self::default().0;
        for (threshold, weight) in overrides {
            if !weight.is_finite() || weight < 0.0 {
                return Err(ImpactError::InvalidConfig(format!(
                    "cci weight for {threshold} kt must be finite and non-negative, got {weight}"
                )));
            }
            weights.insert(threshold, weight);
        }
        Ok(Self(weights))
    }

    pub fn weight(&self, threshold: WindThreshold) -> f64 {
        self.0.get(&threshold).copied().unwrap_or(0.0)
    }
}

impl Default for CciWeights {
    fn default() -> Self {
        Self(
            WindThreshold::all()
                .map(|threshold| (threshold, threshold.ordinal() as f64))
                .collect(),
        )
    }
}

/// Cumulative index for one tile or admin region, with its expected-value
/// form per population class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CciRecord {
    pub unit_id: String,
    #[serde(default)]
    pub admin_id: Option<String>,
    #[serde(rename = "CCI")]
    pub index: f64,
    #[serde(rename = "E_CCI_children")]
    pub children: f64,
    #[serde(rename = "E_CCI_school_age")]
    pub school_age: f64,
    #[serde(rename = "E_CCI_infants")]
    pub infants: f64,
    #[serde(rename = "E_CCI_pop")]
    pub population: f64,
}

impl CciRecord {
    fn from_index(unit_id: String, admin_id: Option<String>, index: f64, base: &BaseAttributes) -> Self {
        let class = |attribute| base.get(attribute).unwrap_or(0.0) * index;
        Self {
            unit_id,
            admin_id,
            index,
            children: base.children().unwrap_or(0.0) * index,
            school_age: class(Attribute::SchoolAgePopulation),
            infants: class(Attribute::InfantPopulation),
            population: class(Attribute::Population),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CciOutcome {
    pub tiles: Vec<CciRecord>,
    pub admins: Vec<CciRecord>,
    /// Units where a stronger threshold reached further than a weaker one.
    pub nesting_violations: usize,
}

impl CciOutcome {
    pub fn totals(&self) -> CciTotals {
        let mut totals = CciTotals::default();
        for record in &self.tiles {
            totals.children += record.children;
            totals.school_age += record.school_age;
            totals.infants += record.infants;
            totals.population += record.population;
        }
        totals
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CciTotals {
    pub children: f64,
    pub school_age: f64,
    pub infants: f64,
    pub population: f64,
}

/// `Σ w_t · p_t` over the thresholds present. With non-negative weights the
/// index never drops when a threshold is added.
pub fn cumulative_index(weights: &CciWeights, probabilities: &BTreeMap<WindThreshold, f64>) -> f64 {
    probabilities
        .iter()
        .map(|(threshold, probability)| weights.weight(*threshold) * probability)
        .sum()
}

/// Number of adjacent threshold pairs where the stronger threshold has a
/// higher probability than the weaker one. Thresholds absent from
/// `probabilities` but listed in `evaluated` count as zero.
pub fn nesting_breaks(evaluated: &[WindThreshold], probabilities: &BTreeMap<WindThreshold, f64>) -> usize {
    let series: Vec<f64> = evaluated
        .iter()
        .map(|threshold| probabilities.get(threshold).copied().unwrap_or(0.0))
        .collect();
    series
        .windows(2)
        .filter(|pair| pair[1] > pair[0] + NESTING_TOLERANCE)
        .count()
}

struct TileSeries {
    admin_id: Option<String>,
    base: BaseAttributes,
    probabilities: BTreeMap<WindThreshold, f64>,
}

/// CCI Calculator over every threshold evaluated for one unit of work.
pub fn compute(
    weights: &CciWeights,
    per_threshold: &BTreeMap<WindThreshold, ThresholdImpacts>,
) -> Result<CciOutcome, ImpactError> {
    let evaluated: Vec<WindThreshold> = per_threshold.keys().copied().collect();
    let mut series: BTreeMap<&str, TileSeries> = BTreeMap::new();
    for (threshold, impacts) in per_threshold {
        for tile in &impacts.tiles {
            series
                .entry(tile.tile_id.as_str())
                .or_insert_with(|| TileSeries {
                    admin_id: tile.admin_id.clone(),
                    base: tile.base.clone(),
                    probabilities: BTreeMap::new(),
                })
                .probabilities
                .insert(*threshold, tile.probability.value());
        }
    }

    let mut outcome = CciOutcome::default();
    for (tile_id, tile) in &series {
        let breaks = nesting_breaks(&evaluated, &tile.probabilities);
        if breaks > 0 {
            debug!(tile = tile_id, breaks, "wind thresholds not nested");
            outcome.nesting_violations += 1;
        }
        let index = cumulative_index(weights, &tile.probabilities);
        if !index.is_finite() {
            return Err(ImpactError::InvariantViolation(format!(
                "non-finite cci index for tile {tile_id}"
            )));
        }
        outcome.tiles.push(CciRecord::from_index(
            tile_id.to_string(),
            tile.admin_id.clone(),
            index,
            &tile.base,
        ));
    }
    if outcome.nesting_violations > 0 {
        warn!(
            tiles = outcome.nesting_violations,
            "stronger wind envelope exceeds weaker one; cci computed anyway"
        );
    }

    outcome.admins = rollup_admins(&outcome.tiles, &series);
    Ok(outcome)
}

fn rollup_admins(tiles: &[CciRecord], series: &BTreeMap<&str, TileSeries>) -> Vec<CciRecord> {
    let mut groups: BTreeMap<&str, Vec<&CciRecord>> = BTreeMap::new();
    for record in tiles {
        if let Some(admin_id) = record.admin_id.as_deref() {
            groups.entry(admin_id).or_default().push(record);
        }
    }
    groups
        .into_iter()
        .map(|(admin_id, members)| {
            let index = weighted_mean(members.iter().map(|record| {
                let population = series
                    .get(record.unit_id.as_str())
                    .and_then(|tile| tile.base.get(Attribute::Population));
                (Some(record.index), population)
            }))
            .unwrap_or(0.0);
            CciRecord {
                unit_id: admin_id.to_string(),
                admin_id: Some(admin_id.to_string()),
                index,
                children: members.iter().map(|r| r.children).sum(),
                school_age: members.iter().map(|r| r.school_age).sum(),
                infants: members.iter().map(|r| r.infants).sum(),
                population: members.iter().map(|r| r.population).sum(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::aggregate::{ExpectedValues, Probability, TileImpact};

    fn kt(knots: u16) -> WindThreshold {
        WindThreshold::try_from(knots).unwrap()
    }

    #[test]
    fn default_weights_are_ordinal() {
        let weights = CciWeights::default();
        assert_eq!(weights.weight(kt(34)), 1.0);
        assert_eq!(weights.weight(kt(137)), 8.0);
    }

    #[test]
    fn negative_weight_is_config_error() {
        let err = CciWeights::new(BTreeMap::from([(kt(64), -1.0)])).unwrap_err();
        assert_matches!(err, ImpactError::InvalidConfig(_));
        assert!(err.is_config());
    }

    #[test]
    fn adding_thresholds_never_lowers_index() {
        let weights = CciWeights::default();
        let t1 = BTreeMap::from([(kt(34), 0.3)]);
        let t2 = BTreeMap::from([(kt(34), 0.3), (kt(40), 0.2), (kt(50), 0.0)]);
        assert!(cumulative_index(&weights, &t2) >= cumulative_index(&weights, &t1));
        assert!((cumulative_index(&weights, &t2) - 0.7).abs() < 1e-12);
    }

    #[test]
    fn nesting_breaks_are_counted() {
        let evaluated = [kt(34), kt(40), kt(50)];
        let nested = BTreeMap::from([(kt(34), 0.5), (kt(40), 0.5), (kt(50), 0.1)]);
        assert_eq!(nesting_breaks(&evaluated, &nested), 0);
        let broken = BTreeMap::from([(kt(40), 0.4)]);
        assert_eq!(nesting_breaks(&evaluated, &broken), 1);
    }

    fn tile(id: &str, threshold: WindThreshold, probability: f64, population: f64) -> TileImpact {
        let p = Probability::new(probability, "test").unwrap();
        let base = BaseAttributes {
            population: Some(population),
            ..BaseAttributes::default()
        };
        TileImpact {
            tile_id: id.to_string(),
            admin_id: Some("ADM".to_string()),
            threshold,
            probability: p,
            expected: ExpectedValues::from_attributes(p, &base),
            base,
        }
    }

    #[test]
    fn compute_flags_broken_nesting_and_keeps_index() {
        let impacts = |knots: u16, rows: &[(&str, f64, f64)]| ThresholdImpacts {
            tiles: rows
                .iter()
                .map(|(id, p, population)| tile(id, kt(knots), *p, *population))
                .collect(),
            ..ThresholdImpacts::default()
        };
        let per_threshold = BTreeMap::from([
            (kt(34), impacts(34, &[("a", 0.2, 100.0), ("b", 0.6, 300.0)])),
            (kt(40), impacts(40, &[("a", 0.5, 100.0), ("b", 0.4, 300.0)])),
        ]);

        let outcome = compute(&CciWeights::default(), &per_threshold).unwrap();

        assert_eq!(outcome.nesting_violations, 1);
        let index = |id: &str| {
            outcome
                .tiles
                .iter()
                .find(|record| record.unit_id == id)
                .map(|record| record.index)
                .unwrap()
        };
        assert!((index("a") - 1.2).abs() < 1e-12);
        assert!((index("b") - 1.4).abs() < 1e-12);

        assert_eq!(outcome.admins.len(), 1);
        let admin = &outcome.admins[0];
        assert_eq!(admin.unit_id, "ADM");
        // (1.2 * 100 + 1.4 * 300) / 400
        assert!((admin.index - 1.35).abs() < 1e-12);
        assert!((admin.population - 540.0).abs() < 1e-9);
    }
}
