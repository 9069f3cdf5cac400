use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use geo::{MultiPolygon, Point, Rect};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{CountryCode, FacilityKind};
use crate::error::ImpactError;
use crate::geometry::{quadkey_to_tile, tile_bounds};
use crate::store::{StorageLayout, StoragePort, Table, TableFormat};

/// Static per-unit attributes. Any of them may be missing in the source
/// layers; missing values contribute nothing to sums and are skipped by
/// weighted averages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseAttributes {
    #[serde(default)]
    pub population: Option<f64>,
    #[serde(default)]
    pub school_age_population: Option<f64>,
    #[serde(default)]
    pub infant_population: Option<f64>,
    #[serde(default)]
    pub built_surface_m2: Option<f64>,
    #[serde(default)]
    pub num_schools: Option<f64>,
    #[serde(default)]
    pub num_hcs: Option<f64>,
    #[serde(default)]
    pub rwi: Option<f64>,
    #[serde(default)]
    pub smod_class: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    Population,
    SchoolAgePopulation,
    InfantPopulation,
    BuiltSurfaceM2,
    NumSchools,
    NumHcs,
    Rwi,
    SmodClass,
}

impl Attribute {
    pub const ADDITIVE: [Attribute; 6] = [
        Attribute::Population,
        Attribute::SchoolAgePopulation,
        Attribute::InfantPopulation,
        Attribute::BuiltSurfaceM2,
        Attribute::NumSchools,
        Attribute::NumHcs,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Attribute::Population => "population",
            Attribute::SchoolAgePopulation => "school_age_population",
            Attribute::InfantPopulation => "infant_population",
            Attribute::BuiltSurfaceM2 => "built_surface_m2",
            Attribute::NumSchools => "num_schools",
            Attribute::NumHcs => "num_hcs",
            Attribute::Rwi => "rwi",
            Attribute::SmodClass => "smod_class",
        }
    }
}

impl BaseAttributes {
    pub fn get(&self, attribute: Attribute) -> Option<f64> {
        let value = match attribute {
            Attribute::Population => self.population,
            Attribute::SchoolAgePopulation => self.school_age_population,
            Attribute::InfantPopulation => self.infant_population,
            Attribute::BuiltSurfaceM2 => self.built_surface_m2,
            Attribute::NumSchools => self.num_schools,
            Attribute::NumHcs => self.num_hcs,
            Attribute::Rwi => self.rwi,
            Attribute::SmodClass => self.smod_class,
        };
        value.filter(|v| v.is_finite())
    }

    pub fn children(&self) -> Option<f64> {
        match (
            self.get(Attribute::SchoolAgePopulation),
            self.get(Attribute::InfantPopulation),
        ) {
            (None, None) => None,
            (school, infant) => Some(school.unwrap_or(0.0) + infant.unwrap_or(0.0)),
        }
    }
}

/// Mercator tile keyed by quadkey, carrying its admin-1 region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tile {
    pub tile_id: String,
    #[serde(default)]
    pub admin_id: Option<String>,
    #[serde(flatten)]
    pub attributes: BaseAttributes,
}

impl Tile {
    pub fn bounds(&self) -> Result<Rect<f64>, ImpactError> {
        let (zoom, x, y) = quadkey_to_tile(&self.tile_id).ok_or_else(|| {
            ImpactError::InvariantViolation(format!("invalid tile quadkey: {}", self.tile_id))
        })?;
        Ok(tile_bounds(zoom, x, y))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminRegion {
    pub admin_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facility {
    pub facility_id: String,
    pub kind: FacilityKind,
    #[serde(default)]
    pub name: Option<String>,
    /// Education level for schools, facility type for health centres.
    #[serde(default)]
    pub category: Option<String>,
    pub lon: f64,
    pub lat: f64,
}

impl Facility {
    pub fn location(&self) -> Point<f64> {
        Point::new(self.lon, self.lat)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountryBoundary {
    pub country: CountryCode,
    pub geometry: MultiPolygon<f64>,
}

/// Source of country outlines and facility lists. Failures are expected to be
/// transient and are handled as "skip with warning" by callers.
pub trait BoundaryProvider: Send + Sync {
    fn get_country_boundary(&self, country: &CountryCode) -> Result<MultiPolygon<f64>, ImpactError>;
    fn get_facilities(
        &self,
        country: &CountryCode,
        kind: FacilityKind,
    ) -> Result<Vec<Facility>, ImpactError>;
}

/// Read-only view of the initialized base layers in storage.
#[derive(Debug, Clone)]
pub struct BaseLayers<S: StoragePort> {
    store: S,
    zoom: u8,
}

impl<S: StoragePort> BaseLayers<S> {
    pub fn new(store: S, zoom: u8) -> Self {
        Self { store, zoom }
    }

    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    pub fn tiles(&self, country: &CountryCode) -> Result<Vec<Tile>, ImpactError> {
        self.read_layer(&StorageLayout::tiles(country, self.zoom), "tiles")
    }

    /// Missing admin metadata is not fatal: rollups then fall back to ids.
    pub fn admins(&self, country: &CountryCode) -> Result<Vec<AdminRegion>, ImpactError> {
        let key = StorageLayout::admins(country);
        if !self.store.exists(&key)? {
            return Ok(Vec::new());
        }
        self.read_layer(&key, "admin regions")
    }

    fn read_layer<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
        what: &str,
    ) -> Result<Vec<T>, ImpactError> {
        match self.store.read_table(key) {
            Ok(table) => table.to_records(),
            Err(ImpactError::NotFound(_)) => Err(ImpactError::unavailable(
                what,
                format!("{key} not initialized"),
            )),
            Err(err) => Err(err),
        }
    }
}

impl<S: StoragePort> BoundaryProvider for BaseLayers<S> {
    fn get_country_boundary(&self, country: &CountryCode) -> Result<MultiPolygon<f64>, ImpactError> {
        let key = StorageLayout::boundary(country);
        match self.store.read_json::<CountryBoundary>(&key) {
            Ok(boundary) => Ok(boundary.geometry),
            Err(ImpactError::NotFound(_)) => Err(ImpactError::unavailable(
                "country boundary",
                format!("{key} not initialized"),
            )),
            Err(err) => Err(err),
        }
    }

    fn get_facilities(
        &self,
        country: &CountryCode,
        kind: FacilityKind,
    ) -> Result<Vec<Facility>, ImpactError> {
        self.read_layer(&StorageLayout::facilities(country, kind), kind.dir_name())
    }
}

/// Producer of freshly computed base layers for one country.
pub trait BaseLayerSource {
    fn boundary(&self, country: &CountryCode) -> Result<CountryBoundary, ImpactError>;
    fn tiles(&self, country: &CountryCode, zoom: u8) -> Result<Vec<Tile>, ImpactError>;
    fn admins(&self, country: &CountryCode) -> Result<Vec<AdminRegion>, ImpactError>;
    fn facilities(&self, country: &CountryCode, kind: FacilityKind)
    -> Result<Vec<Facility>, ImpactError>;
}

/// Pre-computed layers staged on disk as
/// `{root}/{ISO3}/{boundary,tiles_{zoom},admins,schools,health_centers}.json`.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: Utf8PathBuf,
}

impl DirectorySource {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn read<T: serde::de::DeserializeOwned>(&self, path: &Utf8Path) -> Result<T, ImpactError> {
        let content = fs::read(path.as_std_path()).map_err(|err| {
            ImpactError::unavailable("base layer source", format!("{path}: {err}"))
        })?;
        serde_json::from_slice(&content)
            .map_err(|err| ImpactError::InvariantViolation(format!("{path}: {err}")))
    }
}

impl BaseLayerSource for DirectorySource {
    fn boundary(&self, country: &CountryCode) -> Result<CountryBoundary, ImpactError> {
        let geometry = self.read(&self.root.join(country.as_str()).join("boundary.json"))?;
        Ok(CountryBoundary {
            country: country.clone(),
            geometry,
        })
    }

    fn tiles(&self, country: &CountryCode, zoom: u8) -> Result<Vec<Tile>, ImpactError> {
        self.read(
            &self
                .root
                .join(country.as_str())
                .join(format!("tiles_{zoom}.json")),
        )
    }

    fn admins(&self, country: &CountryCode) -> Result<Vec<AdminRegion>, ImpactError> {
        self.read(&self.root.join(country.as_str()).join("admins.json"))
    }

    fn facilities(
        &self,
        country: &CountryCode,
        kind: FacilityKind,
    ) -> Result<Vec<Facility>, ImpactError> {
        self.read(
            &self
                .root
                .join(country.as_str())
                .join(format!("{}.json", kind.dir_name())),
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InitOutcome {
    pub country: CountryCode,
    pub written: Vec<String>,
    pub skipped: Vec<String>,
    pub error: Option<String>,
}

/// Initialization phase: copies each country's base layers into storage,
/// leaving existing layers untouched unless `rewrite` is set.
pub fn initialize_countries<S: StoragePort, B: BaseLayerSource>(
    store: &S,
    source: &B,
    countries: &[CountryCode],
    zoom: u8,
    rewrite: bool,
) -> Vec<InitOutcome> {
    countries
        .iter()
        .map(|country| {
            let mut outcome = InitOutcome {
                country: country.clone(),
                written: Vec::new(),
                skipped: Vec::new(),
                error: None,
            };
            if let Err(err) = initialize_country(store, source, country, zoom, rewrite, &mut outcome) {
                warn!(country = %country, error = %err, "base layer initialization failed");
                outcome.error = Some(err.to_string());
            } else {
                info!(
                    country = %country,
                    written = outcome.written.len(),
                    skipped = outcome.skipped.len(),
                    "base layers ready"
                );
            }
            outcome
        })
        .collect()
}

fn initialize_country<S: StoragePort, B: BaseLayerSource>(
    store: &S,
    source: &B,
    country: &CountryCode,
    zoom: u8,
    rewrite: bool,
    outcome: &mut InitOutcome,
) -> Result<(), ImpactError> {
    let key = StorageLayout::boundary(country);
    if should_write(store, &key, rewrite, outcome)? {
        store.write_json(&key, &source.boundary(country)?)?;
        outcome.written.push(key);
    }

    let key = StorageLayout::tiles(country, zoom);
    if should_write(store, &key, rewrite, outcome)? {
        let tiles = source.tiles(country, zoom)?;
        store.write_table(&key, &Table::from_records(&tiles)?, TableFormat::Json)?;
        outcome.written.push(key);
    }

    let key = StorageLayout::admins(country);
    if should_write(store, &key, rewrite, outcome)? {
        let admins = source.admins(country)?;
        store.write_table(&key, &Table::from_records(&admins)?, TableFormat::Json)?;
        outcome.written.push(key);
    }

    for kind in FacilityKind::all() {
        let key = StorageLayout::facilities(country, kind);
        if !should_write(store, &key, rewrite, outcome)? {
            continue;
        }
        match source.facilities(country, kind) {
            Ok(facilities) => {
                store.write_table(&key, &Table::from_records(&facilities)?, TableFormat::Json)?;
                outcome.written.push(key);
            }
            Err(err) if err.is_retryable() => {
                warn!(country = %country, kind = %kind, error = %err, "facility list unavailable, skipping");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn should_write<S: StoragePort>(
    store: &S,
    key: &str,
    rewrite: bool,
    outcome: &mut InitOutcome,
) -> Result<bool, ImpactError> {
    if !rewrite && store.exists(key)? {
        outcome.skipped.push(key.to_string());
        return Ok(false);
    }
    Ok(true)
}
