use std::collections::BTreeMap;

use assert_matches::assert_matches;

use storm_impact::config::{Config, ConfigLoader, StorageBackend, StorageSettings};
use storm_impact::domain::WindThreshold;
use storm_impact::error::ImpactError;

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: BTreeMap<String, String> = pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    move |key: &str| map.get(key).cloned()
}

#[test]
fn parse_config_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("storm-impact.json");
    std::fs::write(
        &path,
        r#"{
            "countries": ["twn", "jam"],
            "zoom": 12,
            "buffer_km": 500,
            "facility_probability": "point-in-envelope",
            "cci_weights": {"34": 0.5, "64": 4.0},
            "data_root": "/tmp/storm-impact-test"
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str(), env_from(&[])).unwrap();
    let countries: Vec<&str> = resolved.countries.iter().map(|code| code.as_str()).collect();
    assert_eq!(countries, vec!["TWN", "JAM"]);
    assert_eq!(resolved.zoom, 12);
    assert_eq!(resolved.buffer_km, 500.0);
    assert_eq!(resolved.cci_weights.weight(WindThreshold::try_from(34).unwrap()), 0.5);
    assert_eq!(resolved.cci_weights.weight(WindThreshold::try_from(40).unwrap()), 2.0);
    assert_eq!(resolved.cci_weights.weight(WindThreshold::try_from(64).unwrap()), 4.0);
    assert_matches!(resolved.storage, StorageSettings::Local { ref root } if root == "/tmp/storm-impact-test");
}

#[test]
fn explicit_missing_config_is_an_error() {
    let err = ConfigLoader::resolve(Some("/nonexistent/storm-impact.json"), env_from(&[]))
        .unwrap_err();
    assert_matches!(err, ImpactError::ConfigRead(_));
    assert!(err.is_config());
}

#[test]
fn blob_backend_requires_credentials() {
    let config = Config {
        storage: Some(StorageBackend::Blob),
        ..Config::default()
    };
    let err = ConfigLoader::resolve_config(config, env_from(&[])).unwrap_err();
    assert_matches!(err, ImpactError::MissingCredentials { ref missing, .. } if missing.contains("SAS_TOKEN"));
}

#[test]
fn environment_selects_read_only_blob() {
    let env = env_from(&[
        ("DATA_PIPELINE_DB", "RO_BLOB"),
        ("ACCOUNT_URL", "https://example.blob.core.windows.net"),
        ("SAS_TOKEN", "sv=2024&sig=abc"),
    ]);
    let resolved = ConfigLoader::resolve_config(Config::default(), env).unwrap();
    assert_matches!(
        resolved.storage,
        StorageSettings::Blob {
            read_only: true,
            ..
        }
    );
}

#[test]
fn warehouse_is_required_only_on_demand() {
    let config = Config {
        data_root: Some("/tmp/storm-impact-test".to_string()),
        ..Config::default()
    };
    let resolved = ConfigLoader::resolve_config(config, env_from(&[])).unwrap();
    assert_matches!(
        resolved.require_warehouse(),
        Err(ImpactError::MissingCredentials { .. })
    );

    let env = env_from(&[
        ("SNOWFLAKE_ACCOUNT", "acme"),
        ("SNOWFLAKE_TOKEN", "token"),
        ("SNOWFLAKE_WAREHOUSE", "wh"),
        ("SNOWFLAKE_DATABASE", "db"),
        ("SNOWFLAKE_SCHEMA", "storms"),
        ("ROOT_DATA_DIR", "/tmp/storm-impact-test"),
    ]);
    let resolved = ConfigLoader::resolve_config(Config::default(), env).unwrap();
    assert_eq!(resolved.require_warehouse().unwrap().account, "acme");
}

#[test]
fn rejects_bad_values() {
    let zoom = Config {
        zoom: Some(0),
        data_root: Some("/tmp/x".to_string()),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(zoom, env_from(&[])),
        Err(ImpactError::InvalidConfig(_))
    );

    let weights = Config {
        cci_weights: Some(BTreeMap::from([(34, -1.0)])),
        data_root: Some("/tmp/x".to_string()),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(weights, env_from(&[])),
        Err(ImpactError::InvalidConfig(_))
    );

    let threshold = Config {
        cci_weights: Some(BTreeMap::from([(35, 1.0)])),
        data_root: Some("/tmp/x".to_string()),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(threshold, env_from(&[])),
        Err(ImpactError::InvalidWindThreshold(_))
    );
}
