use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDateTime;
use geo::{BoundingRect, Intersects, Line, MultiPolygon, Point, Polygon, Rect};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::domain::{CountryCode, ForecastTime, WindThreshold, human_time};
use crate::error::ImpactError;
use crate::exposure::EnsembleEnvelopes;
use crate::layers::{Attribute, BaseAttributes, Facility, Tile};
use crate::providers::{DETERMINISTIC_MEMBER, EnsembleTrack};

const SEVERITY_ATTRIBUTES: [Attribute; 6] = [
    Attribute::Population,
    Attribute::SchoolAgePopulation,
    Attribute::InfantPopulation,
    Attribute::BuiltSurfaceM2,
    Attribute::NumSchools,
    Attribute::NumHcs,
];

/// Deterministic exposure of one ensemble member: the attribute summed over
/// every tile its envelope touches, or the number of facilities it covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityRow {
    pub ensemble_member: u32,
    pub country: CountryCode,
    pub threshold: WindThreshold,
    pub attribute: Attribute,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeveritySpread {
    pub min: f64,
    pub median: f64,
    pub max: f64,
    pub members: usize,
}

struct TileShape<'a> {
    polygon: Polygon<f64>,
    rect: Rect<f64>,
    attributes: &'a BaseAttributes,
}

/// Track Severity Scorer. Members come from both the track list and the
/// envelopes, so a track that never reaches the country still scores zero.
pub fn score_tracks(
    country: &CountryCode,
    envelopes: &EnsembleEnvelopes,
    tracks: &[EnsembleTrack],
    thresholds: &[WindThreshold],
    tiles: &[Tile],
    schools: &[Facility],
    health_centers: &[Facility],
) -> Result<Vec<SeverityRow>, ImpactError> {
    let shapes = tiles
        .iter()
        .map(|tile| {
            let rect = tile.bounds()?;
            Ok(TileShape {
                polygon: rect.to_polygon(),
                rect,
                attributes: &tile.attributes,
            })
        })
        .collect::<Result<Vec<_>, ImpactError>>()?;

    let members: BTreeSet<u32> = envelopes
        .members()
        .chain(tracks.iter().map(|track| track.member))
        .collect();
    let pairs: Vec<(u32, WindThreshold)> = members
        .iter()
        .flat_map(|member| thresholds.iter().map(move |threshold| (*member, *threshold)))
        .collect();

    let rows = pairs
        .par_iter()
        .flat_map_iter(|(member, threshold)| {
            let (member, threshold) = (*member, *threshold);
            let mut totals: BTreeMap<Attribute, f64> = BTreeMap::new();
            for shape in &shapes {
                if !envelopes.member_covers(threshold, member, &shape.polygon, &shape.rect) {
                    continue;
                }
                for attribute in [
                    Attribute::Population,
                    Attribute::SchoolAgePopulation,
                    Attribute::InfantPopulation,
                    Attribute::BuiltSurfaceM2,
                ] {
                    *totals.entry(attribute).or_default() +=
                        shape.attributes.get(attribute).unwrap_or(0.0);
                }
            }
            let covered = |facilities: &[Facility]| {
                facilities
                    .iter()
                    .filter(|facility| {
                        envelopes.member_covers_point(threshold, member, &facility.location())
                    })
                    .count() as f64
            };
            totals.insert(Attribute::NumSchools, covered(schools));
            totals.insert(Attribute::NumHcs, covered(health_centers));

            SEVERITY_ATTRIBUTES
                .into_iter()
                .map(|attribute| SeverityRow {
                    ensemble_member: member,
                    country: country.clone(),
                    threshold,
                    attribute,
                    value: totals.get(&attribute).copied().unwrap_or(0.0),
                })
                .collect::<Vec<_>>()
        })
        .collect();
    Ok(rows)
}

/// Min, median and max across members for each attribute at `threshold`.
pub fn spread(rows: &[SeverityRow], threshold: WindThreshold) -> BTreeMap<Attribute, SeveritySpread> {
    let mut values: BTreeMap<Attribute, Vec<f64>> = BTreeMap::new();
    for row in rows.iter().filter(|row| row.threshold == threshold) {
        values.entry(row.attribute).or_default().push(row.value);
    }
    values
        .into_iter()
        .filter_map(|(attribute, mut values)| {
            values.sort_by(f64::total_cmp);
            let n = values.len();
            let median = match n {
                0 => return None,
                n if n % 2 == 1 => values[n / 2],
                n => (values[n / 2 - 1] + values[n / 2]) / 2.0,
            };
            Some((
                attribute,
                SeveritySpread {
                    min: values[0],
                    median,
                    max: values[n - 1],
                    members: n,
                },
            ))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Landfall {
    AlreadyLanded,
    At(NaiveDateTime),
    Unknown,
}

impl Landfall {
    pub fn describe(&self) -> String {
        match self {
            Landfall::AlreadyLanded => "Already landed".to_string(),
            Landfall::At(time) => human_time(*time),
            Landfall::Unknown => "Unknown".to_string(),
        }
    }
}

/// Landfall along the deterministic member: the first position inside the
/// country, else the first segment crossing its outline.
pub fn expected_landfall(
    tracks: &[EnsembleTrack],
    boundary: &MultiPolygon<f64>,
    forecast_time: ForecastTime,
) -> Landfall {
    let Some(track) = tracks.iter().find(|track| track.member == DETERMINISTIC_MEMBER) else {
        return Landfall::Unknown;
    };
    let Some(bounds) = boundary.bounding_rect() else {
        return Landfall::Unknown;
    };

    let inside = track.positions.iter().find(|position| {
        let point = Point::new(position.lon, position.lat);
        bounds.intersects(&point) && boundary.intersects(&point)
    });
    let lead_time = match inside {
        Some(position) => Some(position.lead_time_h),
        None => track
            .positions
            .windows(2)
            .find(|pair| {
                let segment = Line::new(
                    (pair[0].lon, pair[0].lat),
                    (pair[1].lon, pair[1].lat),
                );
                boundary.intersects(&segment)
            })
            .map(|pair| pair[0].lead_time_h),
    };

    match lead_time {
        None => Landfall::Unknown,
        Some(0) => Landfall::AlreadyLanded,
        Some(hours) => Landfall::At(forecast_time.plus_hours(hours)),
    }
}
