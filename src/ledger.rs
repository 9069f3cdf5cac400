use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{CountryCode, ForecastTime, StormId, UnitKey};
use crate::error::ImpactError;
use crate::store::{StorageLayout, StoragePort};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LedgerOutcome {
    Affected,
    NotAffected,
}

/// Record that one (storm, forecast, country) unit was fully materialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub storm: StormId,
    pub forecast_time: ForecastTime,
    pub country: CountryCode,
    pub processed_at: DateTime<Utc>,
    pub outcome: LedgerOutcome,
    /// Storage keys written for this unit.
    #[serde(default)]
    pub manifest: Vec<String>,
}

impl LedgerEntry {
    pub fn key(&self) -> UnitKey {
        UnitKey::new(self.storm.clone(), self.forecast_time, self.country.clone())
    }
}

/// Processing Ledger: one JSON document per unit key, written atomically
/// through the storage port. Puts from this process are serialised; across
/// processes the last writer wins.
pub struct Ledger<S: StoragePort> {
    store: S,
    write_lock: Mutex<()>,
}

impl<S: StoragePort> Ledger<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub fn get(&self, key: &UnitKey) -> Result<Option<LedgerEntry>, ImpactError> {
        match self.store.read_json(&StorageLayout::ledger_entry(key)) {
            Ok(entry) => Ok(Some(entry)),
            Err(ImpactError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn put(
        &self,
        key: &UnitKey,
        outcome: LedgerOutcome,
        manifest: Vec<String>,
    ) -> Result<LedgerEntry, ImpactError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| ImpactError::Storage("ledger lock poisoned".to_string()))?;
        let entry = LedgerEntry {
            storm: key.storm.clone(),
            forecast_time: key.forecast_time,
            country: key.country.clone(),
            processed_at: Utc::now(),
            outcome,
            manifest,
        };
        self.store
            .write_json(&StorageLayout::ledger_entry(key), &entry)?;
        debug!(unit = %key, outcome = ?outcome, "ledger entry written");
        Ok(entry)
    }

    /// Drops the unit's entry so the next run processes it again.
    pub fn remove(&self, key: &UnitKey) -> Result<(), ImpactError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| ImpactError::Storage("ledger lock poisoned".to_string()))?;
        self.store.delete(&StorageLayout::ledger_entry(key))?;
        debug!(unit = %key, "ledger entry removed");
        Ok(())
    }

    /// A unit needs work when it has no entry or a rewrite was requested.
    pub fn should_process(&self, key: &UnitKey, rewrite: bool) -> Result<bool, ImpactError> {
        if rewrite {
            return Ok(true);
        }
        Ok(self.get(key)?.is_none())
    }

    /// Every entry recorded for `storm` in `country`, oldest forecast first.
    pub fn entries_for(
        &self,
        storm: &StormId,
        country: &CountryCode,
    ) -> Result<Vec<LedgerEntry>, ImpactError> {
        let suffix = format!("/{country}.json");
        let mut entries = Vec::new();
        for key in self.store.list(&StorageLayout::ledger_prefix(storm))? {
            if !key.ends_with(&suffix) {
                continue;
            }
            match self.store.read_json::<LedgerEntry>(&key) {
                Ok(entry) => entries.push(entry),
                Err(ImpactError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        entries.sort_by_key(|entry| entry.forecast_time);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn unit(forecast: &str) -> UnitKey {
        UnitKey::new(
            "LORENZO".parse().unwrap(),
            forecast.parse().unwrap(),
            "TWN".parse().unwrap(),
        )
    }

    #[test]
    fn absent_entry_means_pending() {
        let ledger = Ledger::new(MemoryStore::new());
        let key = unit("20251015120000");
        assert!(ledger.get(&key).unwrap().is_none());
        assert!(ledger.should_process(&key, false).unwrap());

        ledger.put(&key, LedgerOutcome::NotAffected, Vec::new()).unwrap();
        assert!(!ledger.should_process(&key, false).unwrap());
        assert!(ledger.should_process(&key, true).unwrap());
        let entry = ledger.get(&key).unwrap().unwrap();
        assert_eq!(entry.outcome, LedgerOutcome::NotAffected);
        assert_eq!(entry.key(), key);

        ledger.remove(&key).unwrap();
        assert!(ledger.get(&key).unwrap().is_none());
        assert!(ledger.should_process(&key, false).unwrap());
    }

    #[test]
    fn entries_for_filters_country_and_orders() {
        let ledger = Ledger::new(MemoryStore::new());
        ledger
            .put(&unit("20251015180000"), LedgerOutcome::Affected, Vec::new())
            .unwrap();
        ledger
            .put(&unit("20251015120000"), LedgerOutcome::Affected, Vec::new())
            .unwrap();
        let other = UnitKey::new(
            "LORENZO".parse().unwrap(),
            "20251015120000".parse().unwrap(),
            "JAM".parse().unwrap(),
        );
        ledger.put(&other, LedgerOutcome::Affected, Vec::new()).unwrap();

        let entries = ledger
            .entries_for(&"LORENZO".parse().unwrap(), &"TWN".parse().unwrap())
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].forecast_time < entries[1].forecast_time);
    }
}
