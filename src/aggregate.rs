use std::collections::BTreeMap;

use geo::BoundingRect;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::FacilityProbability;
use crate::domain::{FacilityKind, WindThreshold};
use crate::error::ImpactError;
use crate::exposure::EnsembleEnvelopes;
use crate::geometry::point_footprint;
use crate::layers::{AdminRegion, Attribute, BaseAttributes, Facility, Tile};

/// Probability that at least one of several independent indicators holds:
/// `1 - Π(1 - x_i)`. Each indicator is expected in [0, 1].
pub fn union_probability<I>(indicators: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    1.0 - indicators
        .into_iter()
        .fold(1.0, |miss, indicator| miss * (1.0 - indicator))
}

/// Inclusion probability checked to lie in [0, 1]. Out-of-range values are
/// rejected, never clamped.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Probability(f64);

impl Probability {
    pub const ZERO: Probability = Probability(0.0);

    pub fn new(value: f64, context: &str) -> Result<Self, ImpactError> {
        if value.is_finite() && (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ImpactError::ProbabilityOutOfRange {
                value,
                context: context.to_string(),
            })
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Probability {
    type Error = ImpactError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value, "decoded value")
    }
}

impl From<Probability> for f64 {
    fn from(value: Probability) -> Self {
        value.0
    }
}

/// Probability-weighted base attributes. Missing inputs contribute zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpectedValues {
    #[serde(rename = "E_population", default)]
    pub population: f64,
    #[serde(rename = "E_school_age_population", default)]
    pub school_age_population: f64,
    #[serde(rename = "E_infant_population", default)]
    pub infant_population: f64,
    #[serde(rename = "E_built_surface_m2", default)]
    pub built_surface_m2: f64,
    #[serde(rename = "E_num_schools", default)]
    pub num_schools: f64,
    #[serde(rename = "E_num_hcs", default)]
    pub num_hcs: f64,
}

impl ExpectedValues {
    pub fn from_attributes(probability: Probability, attributes: &BaseAttributes) -> Self {
        let p = probability.value();
        let weighted = |attribute| attributes.get(attribute).map(|v| v * p).unwrap_or(0.0);
        Self {
            population: weighted(Attribute::Population),
            school_age_population: weighted(Attribute::SchoolAgePopulation),
            infant_population: weighted(Attribute::InfantPopulation),
            built_surface_m2: weighted(Attribute::BuiltSurfaceM2),
            num_schools: weighted(Attribute::NumSchools),
            num_hcs: weighted(Attribute::NumHcs),
        }
    }

    pub fn get(&self, attribute: Attribute) -> f64 {
        match attribute {
            Attribute::Population => self.population,
            Attribute::SchoolAgePopulation => self.school_age_population,
            Attribute::InfantPopulation => self.infant_population,
            Attribute::BuiltSurfaceM2 => self.built_surface_m2,
            Attribute::NumSchools => self.num_schools,
            Attribute::NumHcs => self.num_hcs,
            Attribute::Rwi | Attribute::SmodClass => 0.0,
        }
    }

    pub fn children(&self) -> f64 {
        self.school_age_population + self.infant_population
    }

    pub fn add(&mut self, other: &ExpectedValues) {
        self.population += other.population;
        self.school_age_population += other.school_age_population;
        self.infant_population += other.infant_population;
        self.built_surface_m2 += other.built_surface_m2;
        self.num_schools += other.num_schools;
        self.num_hcs += other.num_hcs;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileImpact {
    pub tile_id: String,
    #[serde(default)]
    pub admin_id: Option<String>,
    pub threshold: WindThreshold,
    pub probability: Probability,
    #[serde(flatten)]
    pub base: BaseAttributes,
    #[serde(flatten)]
    pub expected: ExpectedValues,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminImpact {
    pub admin_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub threshold: WindThreshold,
    /// Population-weighted mean of the member tiles' probabilities.
    pub probability: Probability,
    pub tiles: usize,
    #[serde(flatten)]
    pub base: BaseAttributes,
    #[serde(flatten)]
    pub expected: ExpectedValues,
}

/// A facility is one expected occurrence, so its expected count equals its
/// probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilityImpact {
    pub facility_id: String,
    pub kind: FacilityKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub lon: f64,
    pub lat: f64,
    pub threshold: WindThreshold,
    pub probability: Probability,
    pub expected: f64,
}

/// All exposure rows for one threshold of one unit of work.
#[derive(Debug, Clone, Default)]
pub struct ThresholdImpacts {
    pub tiles: Vec<TileImpact>,
    pub admins: Vec<AdminImpact>,
    pub schools: Vec<FacilityImpact>,
    pub health_centers: Vec<FacilityImpact>,
}

impl ThresholdImpacts {
    pub fn facilities(&self, kind: FacilityKind) -> &[FacilityImpact] {
        match kind {
            FacilityKind::School => &self.schools,
            FacilityKind::HealthCenter => &self.health_centers,
        }
    }

    pub fn totals(&self) -> ExpectedValues {
        let mut totals = ExpectedValues::default();
        for tile in &self.tiles {
            totals.add(&tile.expected);
        }
        totals
    }
}

/// Facility & Tile Exposure Aggregator for one forecast's ensemble.
pub struct Aggregator<'a> {
    envelopes: &'a EnsembleEnvelopes,
    facility_mode: FacilityProbability,
    facility_buffer_m: f64,
}

impl<'a> Aggregator<'a> {
    pub fn new(
        envelopes: &'a EnsembleEnvelopes,
        facility_mode: FacilityProbability,
        facility_buffer_m: f64,
    ) -> Self {
        Self {
            envelopes,
            facility_mode,
            facility_buffer_m,
        }
    }

    /// Share of ensemble members whose envelope at `threshold` reaches the
    /// target, each member's pieces combined with [`union_probability`].
    fn ensemble_probability(
        &self,
        threshold: WindThreshold,
        target: &geo::Polygon<f64>,
        context: &str,
    ) -> Result<Probability, ImpactError> {
        let members = self.envelopes.member_count();
        if members == 0 {
            return Ok(Probability::ZERO);
        }
        let Some(rect) = target.bounding_rect() else {
            return Ok(Probability::ZERO);
        };
        let covered: f64 = self
            .envelopes
            .member_indicators(threshold, target, &rect)
            .into_iter()
            .sum();
        Probability::new(covered / members as f64, context)
    }

    /// Tile rows for every tile with non-zero probability at `threshold`.
    pub fn tiles(
        &self,
        threshold: WindThreshold,
        tiles: &[Tile],
    ) -> Result<Vec<TileImpact>, ImpactError> {
        let rows = tiles
            .par_iter()
            .map(|tile| {
                let polygon = tile.bounds()?.to_polygon();
                let probability = self.ensemble_probability(
                    threshold,
                    &polygon,
                    &format!("tile {} at {threshold} kt", tile.tile_id),
                )?;
                if probability.value() == 0.0 {
                    return Ok(None);
                }
                Ok(Some(TileImpact {
                    tile_id: tile.tile_id.clone(),
                    admin_id: tile.admin_id.clone(),
                    threshold,
                    probability,
                    base: tile.attributes.clone(),
                    expected: ExpectedValues::from_attributes(probability, &tile.attributes),
                }))
            })
            .collect::<Result<Vec<_>, ImpactError>>()?;
        let rows: Vec<TileImpact> = rows.into_iter().flatten().collect();
        debug!(threshold = %threshold, tiles = rows.len(), "tile exposure computed");
        Ok(rows)
    }

    /// Facility rows for every facility with non-zero probability at `threshold`.
    pub fn facilities(
        &self,
        threshold: WindThreshold,
        facilities: &[Facility],
    ) -> Result<Vec<FacilityImpact>, ImpactError> {
        let rows = facilities
            .par_iter()
            .map(|facility| {
                let context = format!("facility {} at {threshold} kt", facility.facility_id);
                let probability = match self.facility_mode {
                    FacilityProbability::EnsembleFraction => {
                        let footprint =
                            point_footprint(facility.location(), self.facility_buffer_m);
                        self.ensemble_probability(threshold, &footprint, &context)?
                    }
                    FacilityProbability::PointInEnvelope => {
                        let inside = self.envelopes.covers_point(threshold, &facility.location());
                        Probability::new(if inside { 1.0 } else { 0.0 }, &context)?
                    }
                };
                if probability.value() == 0.0 {
                    return Ok(None);
                }
                Ok(Some(FacilityImpact {
                    facility_id: facility.facility_id.clone(),
                    kind: facility.kind,
                    name: facility.name.clone(),
                    category: facility.category.clone(),
                    lon: facility.lon,
                    lat: facility.lat,
                    threshold,
                    probability,
                    expected: probability.value(),
                }))
            })
            .collect::<Result<Vec<_>, ImpactError>>()?;
        Ok(rows.into_iter().flatten().collect())
    }
}

/// Static attributes of each admin-1 region, rolled up from every base tile
/// that carries its id. Independent of any storm footprint.
pub fn admin_baselines(tiles: &[Tile]) -> BTreeMap<String, BaseAttributes> {
    let mut groups: BTreeMap<&str, Vec<&BaseAttributes>> = BTreeMap::new();
    for tile in tiles {
        if let Some(admin_id) = tile.admin_id.as_deref() {
            groups.entry(admin_id).or_default().push(&tile.attributes);
        }
    }
    groups
        .into_iter()
        .map(|(admin_id, members)| (admin_id.to_string(), rollup_attributes(&members)))
        .collect()
}

fn rollup_attributes(members: &[&BaseAttributes]) -> BaseAttributes {
    let sum = |attribute| sum_present(members.iter().map(|base| base.get(attribute)));
    let weighted = |attribute| {
        weighted_mean(
            members
                .iter()
                .map(|base| (base.get(attribute), base.get(Attribute::Population))),
        )
    };
    BaseAttributes {
        population: sum(Attribute::Population),
        school_age_population: sum(Attribute::SchoolAgePopulation),
        infant_population: sum(Attribute::InfantPopulation),
        built_surface_m2: sum(Attribute::BuiltSurfaceM2),
        num_schools: sum(Attribute::NumSchools),
        num_hcs: sum(Attribute::NumHcs),
        rwi: weighted(Attribute::Rwi),
        smod_class: weighted(Attribute::SmodClass),
    }
}

/// Rolls tile rows of one threshold up to their admin-1 regions, ordered by
/// admin id. Expected values and probability follow the exposed tiles; the
/// static attributes come from `baselines`. Tiles without an admin id are
/// left out of the rollup.
pub fn rollup_admins(
    threshold: WindThreshold,
    tiles: &[TileImpact],
    baselines: &BTreeMap<String, BaseAttributes>,
    admins: &[AdminRegion],
) -> Result<Vec<AdminImpact>, ImpactError> {
    let names: BTreeMap<&str, &str> = admins
        .iter()
        .map(|admin| (admin.admin_id.as_str(), admin.name.as_str()))
        .collect();
    let mut groups: BTreeMap<&str, Vec<&TileImpact>> = BTreeMap::new();
    for tile in tiles {
        if let Some(admin_id) = tile.admin_id.as_deref() {
            groups.entry(admin_id).or_default().push(tile);
        }
    }

    groups
        .into_iter()
        .map(|(admin_id, members)| {
            let mut expected = ExpectedValues::default();
            for tile in &members {
                expected.add(&tile.expected);
            }
            let base = match baselines.get(admin_id) {
                Some(base) => base.clone(),
                None => {
                    let bases: Vec<&BaseAttributes> = members.iter().map(|t| &t.base).collect();
                    rollup_attributes(&bases)
                }
            };
            let probability = weighted_mean(members.iter().map(|t| {
                (
                    Some(t.probability.value()),
                    t.base.get(Attribute::Population),
                )
            }))
            .unwrap_or(0.0);
            Ok(AdminImpact {
                admin_id: admin_id.to_string(),
                name: names.get(admin_id).map(|name| name.to_string()),
                threshold,
                probability: Probability::new(
                    probability,
                    &format!("admin {admin_id} at {threshold} kt"),
                )?,
                tiles: members.len(),
                base,
                expected,
            })
        })
        .collect()
}

fn sum_present(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    values.flatten().fold(None, |acc, v| Some(acc.unwrap_or(0.0) + v))
}

/// Mean of the present values weighted by `weight`. Falls back to the
/// unweighted mean when the present values carry no positive weight, and to
/// `None` when no value is present.
pub fn weighted_mean(pairs: impl Iterator<Item = (Option<f64>, Option<f64>)>) -> Option<f64> {
    let present: Vec<(f64, f64)> = pairs
        .filter_map(|(value, weight)| {
            value.map(|v| (v, weight.filter(|w| w.is_finite() && *w > 0.0).unwrap_or(0.0)))
        })
        .collect();
    if present.is_empty() {
        return None;
    }
    let total_weight: f64 = present.iter().map(|(_, w)| w).sum();
    if total_weight > 0.0 {
        Some(present.iter().map(|(v, w)| v * w).sum::<f64>() / total_weight)
    } else {
        Some(present.iter().map(|(v, _)| v).sum::<f64>() / present.len() as f64)
    }
}
