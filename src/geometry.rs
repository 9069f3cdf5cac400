use std::f64::consts::PI;

use geo::{BoundingRect, Coord, LineString, MultiPolygon, Point, Polygon, Rect};
use serde_json::Value;

use crate::error::ImpactError;

const KM_PER_DEGREE: f64 = 111.32;
const MAX_LATITUDE: f64 = 89.9;

/// Buffers `boundary` by `buffer_km`, approximately.
///
/// Each polygon of the boundary contributes its own bounding rectangle padded
/// by `buffer_km` on every side, so every point within `buffer_km` of the
/// country is covered. The result is a superset of the true buffer: near
/// concave coastlines and at rectangle corners it reaches further than
/// `buffer_km`, which can mark a distant threshold as affected. Tile and
/// facility probabilities are unaffected since they only consider the
/// country's own tiles and facilities.
///
/// The result is expressed in lon/lat. A rectangle running past the
/// antimeridian is split into two parts so each stays within [-180, 180].
pub fn buffer_boundary(
    boundary: &MultiPolygon<f64>,
    buffer_km: f64,
) -> Result<MultiPolygon<f64>, ImpactError> {
    let mut parts = Vec::new();
    for polygon in &boundary.0 {
        let Some(rect) = polygon.bounding_rect() else {
            continue;
        };
        parts.extend(pad_rect(rect, buffer_km)?);
    }
    if parts.is_empty() {
        return Err(ImpactError::InvariantViolation(
            "empty boundary geometry".to_string(),
        ));
    }
    Ok(MultiPolygon(parts))
}

fn pad_rect(rect: Rect<f64>, buffer_km: f64) -> Result<Vec<Polygon<f64>>, ImpactError> {
    let (min, max) = (rect.min(), rect.max());
    if ![min.x, min.y, max.x, max.y].iter().all(|v| v.is_finite()) {
        return Err(ImpactError::InvariantViolation(
            "boundary has non-finite coordinates".to_string(),
        ));
    }

    let pad_lat = buffer_km / KM_PER_DEGREE;
    let min_lat = (min.y - pad_lat).max(-90.0);
    let max_lat = (max.y + pad_lat).min(90.0);
    let widest = min_lat.abs().max(max_lat.abs()).min(MAX_LATITUDE);
    let pad_lon = buffer_km / (KM_PER_DEGREE * widest.to_radians().cos());
    let min_lon = min.x - pad_lon;
    let max_lon = max.x + pad_lon;

    if max_lon - min_lon >= 360.0 {
        return Ok(vec![lonlat_rect(-180.0, min_lat, 180.0, max_lat)]);
    }
    Ok(if min_lon < -180.0 {
        vec![
            lonlat_rect(min_lon + 360.0, min_lat, 180.0, max_lat),
            lonlat_rect(-180.0, min_lat, max_lon, max_lat),
        ]
    } else if max_lon > 180.0 {
        vec![
            lonlat_rect(min_lon, min_lat, 180.0, max_lat),
            lonlat_rect(-180.0, min_lat, max_lon - 360.0, max_lat),
        ]
    } else {
        vec![lonlat_rect(min_lon, min_lat, max_lon, max_lat)]
    })
}

fn lonlat_rect(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Polygon<f64> {
    Rect::new(
        Coord {
            x: min_lon,
            y: min_lat,
        },
        Coord {
            x: max_lon,
            y: max_lat,
        },
    )
    .to_polygon()
}

/// Square footprint of `meters` half-width around a point.
pub fn point_footprint(point: Point<f64>, meters: f64) -> Polygon<f64> {
    let half_lat = meters / 1000.0 / KM_PER_DEGREE;
    let cos = point.y().abs().min(MAX_LATITUDE).to_radians().cos();
    let half_lon = meters / 1000.0 / (KM_PER_DEGREE * cos);
    lonlat_rect(
        point.x() - half_lon,
        point.y() - half_lat,
        point.x() + half_lon,
        point.y() + half_lat,
    )
}

pub fn rects_overlap(a: &Rect<f64>, b: &Rect<f64>) -> bool {
    a.min().x <= b.max().x && b.min().x <= a.max().x && a.min().y <= b.max().y && b.min().y <= a.max().y
}

/// Lon/lat bounds of a Web-Mercator tile.
pub fn tile_bounds(zoom: u8, x: u32, y: u32) -> Rect<f64> {
    let n = f64::from(1u32 << zoom);
    let lon = |x: f64| x / n * 360.0 - 180.0;
    let lat = |y: f64| (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees();
    Rect::new(
        Coord {
            x: lon(f64::from(x)),
            y: lat(f64::from(y) + 1.0),
        },
        Coord {
            x: lon(f64::from(x) + 1.0),
            y: lat(f64::from(y)),
        },
    )
}

pub fn tile_to_quadkey(zoom: u8, x: u32, y: u32) -> String {
    (1..=zoom)
        .rev()
        .map(|level| {
            let mask = 1u32 << (level - 1);
            let mut digit = 0u8;
            if x & mask != 0 {
                digit += 1;
            }
            if y & mask != 0 {
                digit += 2;
            }
            char::from(b'0' + digit)
        })
        .collect()
}

pub fn quadkey_to_tile(quadkey: &str) -> Option<(u8, u32, u32)> {
    let zoom = u8::try_from(quadkey.len()).ok()?;
    if zoom == 0 || zoom > 30 {
        return None;
    }
    let (mut x, mut y) = (0u32, 0u32);
    for (idx, ch) in quadkey.chars().enumerate() {
        let mask = 1u32 << (usize::from(zoom) - idx - 1);
        match ch {
            '0' => {}
            '1' => x |= mask,
            '2' => y |= mask,
            '3' => {
                x |= mask;
                y |= mask;
            }
            _ => return None,
        }
    }
    Some((zoom, x, y))
}

/// Decodes a GeoJSON `Polygon` or `MultiPolygon` geometry object.
pub fn decode_geojson(value: &Value) -> Result<MultiPolygon<f64>, ImpactError> {
    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
    let coordinates = value
        .get("coordinates")
        .ok_or_else(|| ImpactError::InvariantViolation("geojson missing coordinates".to_string()))?;
    match kind {
        "Polygon" => Ok(MultiPolygon(vec![decode_polygon(coordinates)?])),
        "MultiPolygon" => {
            let polygons = coordinates
                .as_array()
                .ok_or_else(|| invalid_geojson("multipolygon coordinates"))?
                .iter()
                .map(decode_polygon)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(MultiPolygon(polygons))
        }
        other => Err(ImpactError::InvariantViolation(format!(
            "unsupported envelope geometry type: {other}"
        ))),
    }
}

fn decode_polygon(value: &Value) -> Result<Polygon<f64>, ImpactError> {
    let rings = value
        .as_array()
        .ok_or_else(|| invalid_geojson("polygon rings"))?
        .iter()
        .map(decode_ring)
        .collect::<Result<Vec<_>, _>>()?;
    let mut rings = rings.into_iter();
    let exterior = rings.next().ok_or_else(|| invalid_geojson("polygon exterior"))?;
    Ok(Polygon::new(exterior, rings.collect()))
}

fn decode_ring(value: &Value) -> Result<LineString<f64>, ImpactError> {
    let coords = value
        .as_array()
        .ok_or_else(|| invalid_geojson("ring"))?
        .iter()
        .map(|position| {
            let x = position.get(0).and_then(Value::as_f64);
            let y = position.get(1).and_then(Value::as_f64);
            match (x, y) {
                (Some(x), Some(y)) => Ok(Coord { x, y }),
                _ => Err(invalid_geojson("position")),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(LineString::new(coords))
}

fn invalid_geojson(what: &str) -> ImpactError {
    ImpactError::InvariantViolation(format!("invalid geojson {what}"))
}
