use std::collections::BTreeMap;
use std::fs;

use camino::Utf8PathBuf;
use clap::ValueEnum;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::cci::CciWeights;
use crate::domain::{CountryCode, WindThreshold};
use crate::error::ImpactError;

pub const CONFIG_FILE: &str = "storm-impact.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub countries: Vec<String>,
    #[serde(default)]
    pub zoom: Option<u8>,
    #[serde(default)]
    pub buffer_km: Option<f64>,
    #[serde(default)]
    pub facility_buffer_m: Option<f64>,
    #[serde(default)]
    pub time_delta_days: Option<i64>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub facility_probability: Option<FacilityProbability>,
    #[serde(default)]
    pub cci_weights: Option<BTreeMap<u16, f64>>,
    #[serde(default)]
    pub storage: Option<StorageBackend>,
    #[serde(default)]
    pub data_root: Option<String>,
}

/// How a facility's inclusion probability is derived from the envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FacilityProbability {
    /// Fraction of ensemble members whose envelope touches the facility footprint.
    EnsembleFraction,
    /// 1 when the point lies inside the merged envelope of all members, else 0.
    PointInEnvelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackend {
    Local,
    Blob,
    RoBlob,
}

impl StorageBackend {
    fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "LOCAL" => Some(StorageBackend::Local),
            "BLOB" => Some(StorageBackend::Blob),
            "RO_BLOB" => Some(StorageBackend::RoBlob),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum StorageSettings {
    Local {
        root: Utf8PathBuf,
    },
    Blob {
        account_url: String,
        sas_token: String,
        container: String,
        read_only: bool,
    },
}

#[derive(Debug, Clone)]
pub struct WarehouseCredentials {
    pub account: String,
    pub token: String,
    pub warehouse: String,
    pub database: String,
    pub schema: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub countries: Vec<CountryCode>,
    pub zoom: u8,
    pub buffer_km: f64,
    pub facility_buffer_m: f64,
    pub time_delta_days: i64,
    pub max_concurrency: usize,
    pub facility_probability: FacilityProbability,
    pub cci_weights: CciWeights,
    pub storage: StorageSettings,
    pub warehouse: Option<WarehouseCredentials>,
}

impl ResolvedConfig {
    /// The storm source is only needed for update runs; its absence is a
    /// startup failure there, not at load time.
    pub fn require_warehouse(&self) -> Result<&WarehouseCredentials, ImpactError> {
        self.warehouse
            .as_ref()
            .ok_or_else(|| ImpactError::MissingCredentials {
                provider: "warehouse".to_string(),
                missing: WAREHOUSE_VARS.join(", "),
            })
    }
}

const WAREHOUSE_VARS: [&str; 5] = [
    "SNOWFLAKE_ACCOUNT",
    "SNOWFLAKE_TOKEN",
    "SNOWFLAKE_WAREHOUSE",
    "SNOWFLAKE_DATABASE",
    "SNOWFLAKE_SCHEMA",
];

const BLOB_VARS: [&str; 2] = ["ACCOUNT_URL", "SAS_TOKEN"];

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve<E>(path: Option<&str>, env: E) -> Result<ResolvedConfig, ImpactError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Utf8PathBuf::from(CONFIG_FILE),
        };

        let config = if config_path.as_std_path().exists() {
            let content = fs::read_to_string(config_path.as_std_path())
                .map_err(|_| ImpactError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content).map_err(|err| ImpactError::ConfigParse(err.to_string()))?
        } else if path.is_some() {
            return Err(ImpactError::ConfigRead(config_path));
        } else {
            Config::default()
        };

        Self::resolve_config(config, env)
    }

    pub fn resolve_config<E>(config: Config, env: E) -> Result<ResolvedConfig, ImpactError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let schema_version = config.schema_version.unwrap_or(1);

        let countries = if config.countries.is_empty() {
            default_countries()
        } else {
            config.countries
        }
        .iter()
        .map(|code| code.parse())
        .collect::<Result<Vec<CountryCode>, ImpactError>>()?;

        let zoom = config.zoom.unwrap_or(14);
        if !(1..=20).contains(&zoom) {
            return Err(ImpactError::InvalidConfig(format!(
                "zoom must be between 1 and 20, got {zoom}"
            )));
        }

        let buffer_km = config.buffer_km.unwrap_or(1500.0);
        let facility_buffer_m = config.facility_buffer_m.unwrap_or(150.0);
        if !(buffer_km.is_finite() && buffer_km >= 0.0)
            || !(facility_buffer_m.is_finite() && facility_buffer_m >= 0.0)
        {
            return Err(ImpactError::InvalidConfig(
                "buffer distances must be finite and non-negative".to_string(),
            ));
        }

        let max_concurrency = config.max_concurrency.unwrap_or_else(default_concurrency);
        if max_concurrency == 0 {
            return Err(ImpactError::InvalidConfig(
                "max_concurrency must be at least 1".to_string(),
            ));
        }

        let cci_weights = match config.cci_weights {
            Some(raw) => {
                let mut weights = BTreeMap::new();
                for (knots, weight) in raw {
                    weights.insert(WindThreshold::try_from(knots)?, weight);
                }
                CciWeights::new(weights)?
            }
            None => CciWeights::default(),
        };

        let backend = env("DATA_PIPELINE_DB")
            .and_then(|value| StorageBackend::from_env_value(&value))
            .or(config.storage)
            .unwrap_or(StorageBackend::Local);
        let storage = resolve_storage(backend, config.data_root, &env)?;

        Ok(ResolvedConfig {
            schema_version,
            countries,
            zoom,
            buffer_km,
            facility_buffer_m,
            time_delta_days: config.time_delta_days.unwrap_or(9),
            max_concurrency,
            facility_probability: config
                .facility_probability
                .unwrap_or(FacilityProbability::EnsembleFraction),
            cci_weights,
            storage,
            warehouse: resolve_warehouse(&env),
        })
    }
}

fn resolve_storage<E>(
    backend: StorageBackend,
    data_root: Option<String>,
    env: &E,
) -> Result<StorageSettings, ImpactError>
where
    E: Fn(&str) -> Option<String>,
{
    match backend {
        StorageBackend::Local => {
            let root = match data_root.or_else(|| env("ROOT_DATA_DIR")) {
                Some(root) => Utf8PathBuf::from(root),
                None => default_data_root()?,
            };
            Ok(StorageSettings::Local { root })
        }
        StorageBackend::Blob | StorageBackend::RoBlob => {
            let values = lookup_all(env, &BLOB_VARS);
            let missing = missing_vars(&BLOB_VARS, &values);
            if !missing.is_empty() {
                return Err(ImpactError::MissingCredentials {
                    provider: "blob storage".to_string(),
                    missing,
                });
            }
            let mut values = values.into_iter().flatten();
            let account_url = values.next().unwrap_or_default();
            let sas_token = values.next().unwrap_or_default();
            Ok(StorageSettings::Blob {
                account_url,
                sas_token,
                container: env("BLOB_CONTAINER").unwrap_or_else(|| "storm-impact".to_string()),
                read_only: backend == StorageBackend::RoBlob,
            })
        }
    }
}

fn resolve_warehouse<E>(env: &E) -> Option<WarehouseCredentials>
where
    E: Fn(&str) -> Option<String>,
{
    let values = lookup_all(env, &WAREHOUSE_VARS);
    if !missing_vars(&WAREHOUSE_VARS, &values).is_empty() {
        return None;
    }
    let mut values = values.into_iter().flatten();
    Some(WarehouseCredentials {
        account: values.next()?,
        token: values.next()?,
        warehouse: values.next()?,
        database: values.next()?,
        schema: values.next()?,
    })
}

fn lookup_all<E>(env: &E, vars: &[&str]) -> Vec<Option<String>>
where
    E: Fn(&str) -> Option<String>,
{
    vars.iter()
        .map(|var| env(var).filter(|value| !value.trim().is_empty()))
        .collect()
}

fn missing_vars(vars: &[&str], values: &[Option<String>]) -> String {
    vars.iter()
        .zip(values)
        .filter(|(_, value)| value.is_none())
        .map(|(var, _)| *var)
        .collect::<Vec<_>>()
        .join(", ")
}

fn default_data_root() -> Result<Utf8PathBuf, ImpactError> {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_dir().join("storm-impact")).ok())
        .ok_or_else(|| ImpactError::InvalidConfig("unable to resolve data directory".to_string()))
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|value| value.get())
        .unwrap_or(4)
}

pub fn default_countries() -> Vec<String> {
    [
        "ATG", "JAM", "BLZ", "NIC", "DOM", "DMA", "GRD", "MSR", "KNA", "LCA", "VCT", "AIA", "VGB",
    ]
    .iter()
    .map(|code| code.to_string())
    .collect()
}
