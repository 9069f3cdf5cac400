use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use geo::{BoundingRect, Intersects, MultiPolygon, Point, Polygon, Rect};
use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::{CountryCode, WindThreshold};
use crate::error::ImpactError;
use crate::geometry::{buffer_boundary, rects_overlap};
use crate::layers::BoundaryProvider;
use crate::providers::StormEnvelope;

/// Raw and buffered outline of one country.
#[derive(Debug, Clone)]
pub struct CountryGeometry {
    pub boundary: MultiPolygon<f64>,
    pub buffered: MultiPolygon<f64>,
    buffered_rect: Option<Rect<f64>>,
}

impl CountryGeometry {
    pub fn new(boundary: MultiPolygon<f64>, buffer_km: f64) -> Result<Self, ImpactError> {
        let buffered = buffer_boundary(&boundary, buffer_km)?;
        let buffered_rect = buffered.bounding_rect();
        Ok(Self {
            boundary,
            buffered,
            buffered_rect,
        })
    }
}

/// Per-run arena of country geometries keyed by ISO3. Each boundary is fetched
/// and buffered at most once per run; a fresh cache is built for every run.
pub struct BoundaryCache<'a> {
    provider: &'a dyn BoundaryProvider,
    buffer_km: f64,
    entries: Mutex<HashMap<CountryCode, Arc<CountryGeometry>>>,
}

impl<'a> BoundaryCache<'a> {
    pub fn new(provider: &'a dyn BoundaryProvider, buffer_km: f64) -> Self {
        Self {
            provider,
            buffer_km,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, country: &CountryCode) -> Result<Arc<CountryGeometry>, ImpactError> {
        if let Some(found) = self.lock()?.get(country) {
            return Ok(Arc::clone(found));
        }
        // Fetch without holding the lock; a racing insert for the same country wins.
        let boundary = self.provider.get_country_boundary(country)?;
        let geometry = Arc::new(CountryGeometry::new(boundary, self.buffer_km)?);
        debug!(country = %country, "buffered boundary cached");
        Ok(Arc::clone(
            self.lock()?.entry(country.clone()).or_insert(geometry),
        ))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<CountryCode, Arc<CountryGeometry>>>, ImpactError>
    {
        self.entries
            .lock()
            .map_err(|_| ImpactError::InvariantViolation("boundary cache poisoned".to_string()))
    }
}

#[derive(Debug, Clone)]
struct EnvelopePiece {
    rect: Rect<f64>,
    polygon: Polygon<f64>,
}

/// Envelopes of one forecast indexed by threshold, then ensemble member.
#[derive(Debug, Clone, Default)]
pub struct EnsembleEnvelopes {
    members: BTreeSet<u32>,
    by_threshold: BTreeMap<WindThreshold, BTreeMap<u32, Vec<EnvelopePiece>>>,
}

impl EnsembleEnvelopes {
    pub fn new(envelopes: &[StormEnvelope]) -> Self {
        let mut index = Self::default();
        for envelope in envelopes {
            index.members.insert(envelope.ensemble_member);
            let pieces = index
                .by_threshold
                .entry(envelope.threshold)
                .or_default()
                .entry(envelope.ensemble_member)
                .or_default();
            for polygon in &envelope.geometry.0 {
                if let Some(rect) = polygon.bounding_rect() {
                    pieces.push(EnvelopePiece {
                        rect,
                        polygon: polygon.clone(),
                    });
                }
            }
        }
        index
    }

    /// Distinct ensemble members across every threshold of the forecast.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn thresholds(&self) -> impl Iterator<Item = WindThreshold> + '_ {
        self.by_threshold.keys().copied()
    }

    /// Per-member coverage indicators of `target` at `threshold`, one per
    /// member that has an envelope at that threshold. Boundary contact counts.
    pub fn member_indicators(
        &self,
        threshold: WindThreshold,
        target: &Polygon<f64>,
        target_rect: &Rect<f64>,
    ) -> Vec<f64> {
        let Some(members) = self.by_threshold.get(&threshold) else {
            return Vec::new();
        };
        members
            .values()
            .map(|pieces| {
                union_indicator(pieces.iter().map(|piece| {
                    rects_overlap(&piece.rect, target_rect) && piece.polygon.intersects(target)
                }))
            })
            .collect()
    }

    /// Whether any member's envelope at `threshold` contains or touches `point`.
    pub fn covers_point(&self, threshold: WindThreshold, point: &Point<f64>) -> bool {
        let Some(members) = self.by_threshold.get(&threshold) else {
            return false;
        };
        let indicators = members
            .values()
            .flat_map(|pieces| pieces.iter().map(|piece| piece.polygon.intersects(point)));
        union_indicator(indicators) > 0.0
    }

    pub fn members(&self) -> impl Iterator<Item = u32> + '_ {
        self.members.iter().copied()
    }

    /// Whether `member`'s own envelope at `threshold` touches `target`.
    pub fn member_covers(
        &self,
        threshold: WindThreshold,
        member: u32,
        target: &Polygon<f64>,
        target_rect: &Rect<f64>,
    ) -> bool {
        self.member_pieces(threshold, member).iter().any(|piece| {
            rects_overlap(&piece.rect, target_rect) && piece.polygon.intersects(target)
        })
    }

    pub fn member_covers_point(&self, threshold: WindThreshold, member: u32, point: &Point<f64>) -> bool {
        self.member_pieces(threshold, member)
            .iter()
            .any(|piece| piece.polygon.intersects(point))
    }

    fn member_pieces(&self, threshold: WindThreshold, member: u32) -> &[EnvelopePiece] {
        self.by_threshold
            .get(&threshold)
            .and_then(|members| members.get(&member))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn intersects_region(&self, threshold: WindThreshold, region: &MultiPolygon<f64>, rect: &Rect<f64>) -> bool {
        self.by_threshold
            .get(&threshold)
            .map(|members| {
                members.values().flatten().any(|piece| {
                    rects_overlap(&piece.rect, rect) && piece.polygon.intersects(region)
                })
            })
            .unwrap_or(false)
    }
}

fn union_indicator(hits: impl Iterator<Item = bool>) -> f64 {
    crate::aggregate::union_probability(hits.map(|hit| if hit { 1.0 } else { 0.0 }))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum NotAffectedReason {
    NoIntersection,
    BoundaryUnavailable { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Exposure {
    Affected {
        thresholds: Vec<WindThreshold>,
        geometry: Arc<CountryGeometry>,
    },
    NotAffected(NotAffectedReason),
}

impl PartialEq for CountryGeometry {
    fn eq(&self, other: &Self) -> bool {
        self.boundary == other.boundary && self.buffered == other.buffered
    }
}

/// Thresholds whose envelope touches the buffered outline, ascending.
pub fn affected_thresholds(
    geometry: &CountryGeometry,
    envelopes: &EnsembleEnvelopes,
) -> Vec<WindThreshold> {
    let Some(rect) = geometry.buffered_rect else {
        return Vec::new();
    };
    envelopes
        .thresholds()
        .filter(|threshold| envelopes.intersects_region(*threshold, &geometry.buffered, &rect))
        .collect()
}

/// Country Exposure Filter. Never fails: a boundary that cannot be fetched or
/// buffered yields `NotAffected` with a warning so other countries proceed.
pub fn filter_country(
    cache: &BoundaryCache<'_>,
    country: &CountryCode,
    envelopes: &EnsembleEnvelopes,
) -> Exposure {
    let geometry = match cache.get(country) {
        Ok(geometry) => geometry,
        Err(err) => {
            warn!(country = %country, error = %err, "boundary unavailable, treating country as not affected");
            return Exposure::NotAffected(NotAffectedReason::BoundaryUnavailable {
                message: err.to_string(),
            });
        }
    };
    let thresholds = affected_thresholds(&geometry, envelopes);
    if thresholds.is_empty() {
        debug!(country = %country, "no envelope reaches buffered boundary");
        return Exposure::NotAffected(NotAffectedReason::NoIntersection);
    }
    Exposure::Affected {
        thresholds,
        geometry,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::NaiveDate;
    use geo::{Coord, Rect};

    use super::*;
    use crate::domain::FacilityKind;
    use crate::layers::Facility;

    fn square(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> MultiPolygon<f64> {
        MultiPolygon(vec![
            Rect::new(Coord { x: min_x, y: min_y }, Coord { x: max_x, y: max_y }).to_polygon(),
        ])
    }

    fn envelope(member: u32, knots: u16, geometry: MultiPolygon<f64>) -> StormEnvelope {
        StormEnvelope {
            storm: "TEST".parse().unwrap(),
            forecast_time: crate::domain::ForecastTime::new(
                NaiveDate::from_ymd_opt(2025, 11, 10)
                    .unwrap()
                    .and_hms_opt(0, 0, 0)
                    .unwrap(),
            ),
            ensemble_member: member,
            threshold: WindThreshold::try_from(knots).unwrap(),
            geometry,
        }
    }

    struct FixedBoundaries;

    impl BoundaryProvider for FixedBoundaries {
        fn get_country_boundary(
            &self,
            country: &CountryCode,
        ) -> Result<MultiPolygon<f64>, ImpactError> {
            match country.as_str() {
                "AAA" => Ok(square(0.0, 0.0, 1.0, 1.0)),
                _ => Err(ImpactError::unavailable("country boundary", "offline")),
            }
        }

        fn get_facilities(
            &self,
            _country: &CountryCode,
            _kind: FacilityKind,
        ) -> Result<Vec<Facility>, ImpactError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn touching_envelope_counts_as_affected() {
        let provider = FixedBoundaries;
        let cache = BoundaryCache::new(&provider, 0.0);
        let envelopes = EnsembleEnvelopes::new(&[envelope(1, 34, square(1.0, 0.0, 2.0, 1.0))]);
        let exposure = filter_country(&cache, &"AAA".parse().unwrap(), &envelopes);
        assert_matches!(exposure, Exposure::Affected { ref thresholds, .. } if thresholds.len() == 1);
    }

    #[test]
    fn countries_are_filtered_independently() {
        let provider = FixedBoundaries;
        let cache = BoundaryCache::new(&provider, 10.0);
        let envelopes = EnsembleEnvelopes::new(&[envelope(1, 34, square(0.2, 0.2, 0.4, 0.4))]);
        let missing = filter_country(&cache, &"BBB".parse().unwrap(), &envelopes);
        assert_matches!(
            missing,
            Exposure::NotAffected(NotAffectedReason::BoundaryUnavailable { .. })
        );
        let present = filter_country(&cache, &"AAA".parse().unwrap(), &envelopes);
        assert_matches!(present, Exposure::Affected { .. });
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distant_envelope_is_not_affected() {
        let provider = FixedBoundaries;
        let cache = BoundaryCache::new(&provider, 100.0);
        let envelopes = EnsembleEnvelopes::new(&[envelope(1, 34, square(40.0, 40.0, 41.0, 41.0))]);
        assert_eq!(
            filter_country(&cache, &"AAA".parse().unwrap(), &envelopes),
            Exposure::NotAffected(NotAffectedReason::NoIntersection)
        );
    }
}
