use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::de::value::MapDeserializer;
use serde::de::{DeserializeOwned, Deserializer, IntoDeserializer, Visitor};
use serde::{Serialize, forward_to_deserialize_any};
use serde_json::{Map, Value};
use tempfile::Builder;

use crate::domain::{CountryCode, FacilityKind, ForecastTime, StormId, UnitKey, WindThreshold};
use crate::error::ImpactError;
use crate::http::send_with_retries;

/// Key-addressable storage used by every component. Implementations must make
/// `write_bytes` atomic per key: readers see either the old or the new object.
pub trait StoragePort: Send + Sync {
    fn exists(&self, key: &str) -> Result<bool, ImpactError>;
    fn read_bytes(&self, key: &str) -> Result<Vec<u8>, ImpactError>;
    fn write_bytes(&self, key: &str, content: &[u8]) -> Result<(), ImpactError>;
    fn list(&self, prefix: &str) -> Result<Vec<String>, ImpactError>;
    /// Removes `key`. Deleting an absent key succeeds.
    fn delete(&self, key: &str) -> Result<(), ImpactError>;

    fn read_table(&self, key: &str) -> Result<Table, ImpactError> {
        let bytes = self.read_bytes(key)?;
        Table::decode(&bytes, TableFormat::from_key(key))
    }

    fn write_table(&self, key: &str, table: &Table, format: TableFormat) -> Result<(), ImpactError> {
        let bytes = table.encode(format)?;
        self.write_bytes(key, &bytes)
    }

    fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<T, ImpactError>
    where
        Self: Sized,
    {
        let bytes = self.read_bytes(key)?;
        serde_json::from_slice(&bytes)
            .map_err(|err| ImpactError::Storage(format!("decode {key}: {err}")))
    }

    fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ImpactError>
    where
        Self: Sized,
    {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|err| ImpactError::Storage(format!("encode {key}: {err}")))?;
        self.write_bytes(key, &bytes)
    }
}

impl<T: StoragePort + ?Sized> StoragePort for Arc<T> {
    fn exists(&self, key: &str) -> Result<bool, ImpactError> {
        (**self).exists(key)
    }

    fn read_bytes(&self, key: &str) -> Result<Vec<u8>, ImpactError> {
        (**self).read_bytes(key)
    }

    fn write_bytes(&self, key: &str, content: &[u8]) -> Result<(), ImpactError> {
        (**self).write_bytes(key, content)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, ImpactError> {
        (**self).list(prefix)
    }

    fn delete(&self, key: &str) -> Result<(), ImpactError> {
        (**self).delete(key)
    }
}

impl<T: StoragePort + ?Sized> StoragePort for Box<T> {
    fn exists(&self, key: &str) -> Result<bool, ImpactError> {
        (**self).exists(key)
    }

    fn read_bytes(&self, key: &str) -> Result<Vec<u8>, ImpactError> {
        (**self).read_bytes(key)
    }

    fn write_bytes(&self, key: &str, content: &[u8]) -> Result<(), ImpactError> {
        (**self).write_bytes(key, content)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, ImpactError> {
        (**self).list(prefix)
    }

    fn delete(&self, key: &str) -> Result<(), ImpactError> {
        (**self).delete(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Json,
    Csv,
}

impl TableFormat {
    pub fn from_key(key: &str) -> Self {
        if key.ends_with(".csv") {
            TableFormat::Csv
        } else {
            TableFormat::Json
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            TableFormat::Json => "json",
            TableFormat::Csv => "csv",
        }
    }
}

/// Rows of named columns. Geometry columns travel as nested JSON values and
/// are written as JSON text in CSV form.
///
/// Tables decoded from CSV keep every cell as text; [`Table::to_records`]
/// lets the target field type decide whether a cell is a number or a string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    rows: Vec<Map<String, Value>>,
    text_cells: bool,
}

impl Table {
    pub fn from_records<T: Serialize>(records: &[T]) -> Result<Self, ImpactError> {
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            match serde_json::to_value(record)
                .map_err(|err| ImpactError::Storage(err.to_string()))?
            {
                Value::Object(map) => rows.push(map),
                other => {
                    return Err(ImpactError::Storage(format!(
                        "table rows must be objects, got {other}"
                    )));
                }
            }
        }
        Ok(Self {
            rows,
            text_cells: false,
        })
    }

    pub fn to_records<T: DeserializeOwned>(&self) -> Result<Vec<T>, ImpactError> {
        self.rows
            .iter()
            .map(|row| {
                let decoded = if self.text_cells {
                    T::deserialize(MapDeserializer::new(
                        row.iter().map(|(column, cell)| (column.as_str(), TextCell(cell))),
                    ))
                } else {
                    serde_json::from_value(Value::Object(row.clone()))
                };
                decoded.map_err(|err| ImpactError::Storage(format!("decode row: {err}")))
            })
            .collect()
    }

    pub fn rows(&self) -> &[Map<String, Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for row in &self.rows {
            for key in row.keys() {
                if !columns.iter().any(|existing| existing == key) {
                    columns.push(key.clone());
                }
            }
        }
        columns
    }

    pub fn encode(&self, format: TableFormat) -> Result<Vec<u8>, ImpactError> {
        match format {
            TableFormat::Json => serde_json::to_vec_pretty(&self.rows)
                .map_err(|err| ImpactError::Storage(err.to_string())),
            TableFormat::Csv => {
                let columns = self.columns();
                let mut writer = csv::Writer::from_writer(Vec::new());
                writer
                    .write_record(&columns)
                    .map_err(|err| ImpactError::Storage(err.to_string()))?;
                for row in &self.rows {
                    let record = columns
                        .iter()
                        .map(|column| csv_cell(row.get(column)))
                        .collect::<Vec<_>>();
                    writer
                        .write_record(&record)
                        .map_err(|err| ImpactError::Storage(err.to_string()))?;
                }
                writer
                    .into_inner()
                    .map_err(|err| ImpactError::Storage(err.to_string()))
            }
        }
    }

    pub fn decode(bytes: &[u8], format: TableFormat) -> Result<Self, ImpactError> {
        match format {
            TableFormat::Json => {
                let rows: Vec<Map<String, Value>> = serde_json::from_slice(bytes)
                    .map_err(|err| ImpactError::Storage(err.to_string()))?;
                Ok(Self {
                    rows,
                    text_cells: false,
                })
            }
            TableFormat::Csv => {
                let mut reader = csv::Reader::from_reader(bytes);
                let headers = reader
                    .headers()
                    .map_err(|err| ImpactError::Storage(err.to_string()))?
                    .clone();
                let mut rows = Vec::new();
                for record in reader.records() {
                    let record = record.map_err(|err| ImpactError::Storage(err.to_string()))?;
                    let mut row = Map::new();
                    for (column, cell) in headers.iter().zip(record.iter()) {
                        row.insert(column.to_string(), text_cell(cell));
                    }
                    rows.push(row);
                }
                Ok(Self {
                    rows,
                    text_cells: true,
                })
            }
        }
    }
}

fn csv_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::Bool(flag)) => flag.to_string(),
        Some(other) => other.to_string(),
    }
}

/// Empty cells are null and JSON text is parsed back into nested values;
/// everything else stays text until a record type asks for it.
fn text_cell(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    if cell.starts_with('{') || cell.starts_with('[') {
        if let Ok(value) = serde_json::from_str(cell) {
            return value;
        }
    }
    Value::String(cell.to_string())
}

/// Best guess for a text cell when the target type does not say, as inside
/// flattened structs.
fn infer_scalar(text: &str) -> Value {
    if let Ok(int) = text.parse::<i64>() {
        return Value::from(int);
    }
    if let Ok(float) = text.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(float) {
            return Value::Number(number);
        }
    }
    match text {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(text.to_string()),
    }
}

/// One CSV cell. String-typed fields receive the raw text; every other field
/// gets the text parsed as a scalar.
struct TextCell<'a>(&'a Value);

impl<'de> IntoDeserializer<'de, serde_json::Error> for TextCell<'de> {
    type Deserializer = Self;

    fn into_deserializer(self) -> Self {
        self
    }
}

impl<'de> Deserializer<'de> for TextCell<'de> {
    type Error = serde_json::Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::String(text) => infer_scalar(text).deserialize_any(visitor),
            other => other.deserialize_any(visitor),
        }
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Null => visitor.visit_none(),
            _ => visitor.visit_some(self),
        }
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::String(text) => visitor.visit_borrowed_str(text),
            other => other.deserialize_str(visitor),
        }
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_str(visitor)
    }

    fn deserialize_char<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_str(visitor)
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_str(visitor)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.0.deserialize_enum(name, variants, visitor)
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_newtype_struct(self)
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 bytes byte_buf unit
        unit_struct seq tuple tuple_struct map struct ignored_any
    }
}

/// Every storage key the engine reads or writes.
pub struct StorageLayout;

impl StorageLayout {
    pub fn boundary(country: &CountryCode) -> String {
        format!("base/boundaries/{country}.json")
    }

    pub fn tiles(country: &CountryCode, zoom: u8) -> String {
        format!("base/tiles/{country}_{zoom}.json")
    }

    pub fn admins(country: &CountryCode) -> String {
        format!("base/admins/{country}.json")
    }

    pub fn facilities(country: &CountryCode, kind: FacilityKind) -> String {
        format!("base/facilities/{}/{country}.json", kind.dir_name())
    }

    pub fn tile_view(unit: &UnitKey, threshold: WindThreshold) -> String {
        Self::threshold_view("tiles", unit, threshold)
    }

    pub fn admin_view(unit: &UnitKey, threshold: WindThreshold) -> String {
        Self::threshold_view("admins", unit, threshold)
    }

    pub fn facility_view(unit: &UnitKey, kind: FacilityKind, threshold: WindThreshold) -> String {
        Self::threshold_view(kind.dir_name(), unit, threshold)
    }

    pub fn cci_tile_view(unit: &UnitKey) -> String {
        format!(
            "views/cci/tiles/{}/{}/{}.csv",
            unit.country, unit.storm, unit.forecast_time
        )
    }

    pub fn cci_admin_view(unit: &UnitKey) -> String {
        format!(
            "views/cci/admins/{}/{}/{}.csv",
            unit.country, unit.storm, unit.forecast_time
        )
    }

    pub fn track_view(unit: &UnitKey) -> String {
        format!(
            "views/tracks/{}/{}/{}.csv",
            unit.country, unit.storm, unit.forecast_time
        )
    }

    pub fn report(unit: &UnitKey) -> String {
        format!(
            "reports/{}/{}/{}.json",
            unit.country, unit.storm, unit.forecast_time
        )
    }

    pub fn report_prefix(country: &CountryCode, storm: &StormId) -> String {
        format!("reports/{country}/{storm}/")
    }

    pub fn ledger_entry(unit: &UnitKey) -> String {
        format!(
            "ledger/{}/{}/{}.json",
            unit.storm, unit.forecast_time, unit.country
        )
    }

    pub fn ledger_prefix(storm: &StormId) -> String {
        format!("ledger/{storm}/")
    }

    /// Parses the forecast time out of a `.../{FORECAST}.json` key.
    pub fn forecast_from_key(key: &str) -> Option<ForecastTime> {
        let file = key.rsplit('/').next()?;
        let stem = file.split('.').next()?;
        stem.parse().ok()
    }

    fn threshold_view(kind: &str, unit: &UnitKey, threshold: WindThreshold) -> String {
        format!(
            "views/{kind}/{}/{}/{}/{threshold}.csv",
            unit.country, unit.storm, unit.forecast_time
        )
    }
}

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: Utf8PathBuf,
}

impl LocalStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<Utf8PathBuf, ImpactError> {
        let is_safe = !key.is_empty()
            && !key.starts_with('/')
            && key.split('/').all(|part| !part.is_empty() && part != ".." && part != ".");
        if !is_safe {
            return Err(ImpactError::Storage(format!("invalid storage key: {key}")));
        }
        Ok(self.root.join(key))
    }
}

impl StoragePort for LocalStore {
    fn exists(&self, key: &str) -> Result<bool, ImpactError> {
        Ok(self.path_for(key)?.as_std_path().is_file())
    }

    fn read_bytes(&self, key: &str) -> Result<Vec<u8>, ImpactError> {
        let path = self.path_for(key)?;
        if !path.as_std_path().is_file() {
            return Err(ImpactError::NotFound(key.to_string()));
        }
        fs::read(path.as_std_path()).map_err(|err| ImpactError::Storage(err.to_string()))
    }

    fn write_bytes(&self, key: &str, content: &[u8]) -> Result<(), ImpactError> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| ImpactError::Storage("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| ImpactError::Storage(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix(".storm-impact-write")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| ImpactError::Storage(err.to_string()))?;
        temp.write_all(content)
            .map_err(|err| ImpactError::Storage(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| ImpactError::Storage(err.to_string()))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), ImpactError> {
        let path = self.path_for(key)?;
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ImpactError::Storage(err.to_string())),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, ImpactError> {
        if !self.root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for path in walk_dir(self.root.as_std_path())? {
            if !path.is_file() {
                continue;
            }
            let Ok(relative) = path.strip_prefix(self.root.as_std_path()) else {
                continue;
            };
            let key = relative
                .components()
                .map(|part| part.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let is_temp = key
                .rsplit('/')
                .next()
                .map(|name| name.starts_with(".storm-impact-write"))
                .unwrap_or(false);
            if !is_temp && key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, ImpactError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| ImpactError::Storage(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| ImpactError::Storage(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}

/// Blob container addressed over REST with a SAS token.
#[derive(Clone)]
pub struct BlobStore {
    client: Client,
    account_url: String,
    container: String,
    sas_token: String,
    read_only: bool,
}

impl BlobStore {
    pub fn new(
        account_url: &str,
        sas_token: &str,
        container: &str,
        read_only: bool,
    ) -> Result<Self, ImpactError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("storm-impact/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ImpactError::BlobHttp(err.to_string()))?,
        );
        headers.insert("x-ms-version", HeaderValue::from_static("2021-08-06"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| ImpactError::BlobHttp(err.to_string()))?;
        Ok(Self {
            client,
            account_url: account_url.trim_end_matches('/').to_string(),
            container: container.to_string(),
            sas_token: sas_token.trim_start_matches('?').to_string(),
            read_only,
        })
    }

    fn blob_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}?{}",
            self.account_url, self.container, key, self.sas_token
        )
    }

    fn send<F>(&self, make_req: F) -> Result<reqwest::blocking::Response, ImpactError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        send_with_retries(make_req, ImpactError::BlobHttp)
    }

    fn status_error(response: reqwest::blocking::Response) -> ImpactError {
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "blob request failed".to_string());
        ImpactError::BlobStatus { status, message }
    }
}

impl StoragePort for BlobStore {
    fn exists(&self, key: &str) -> Result<bool, ImpactError> {
        let url = self.blob_url(key);
        let response = self.send(|| self.client.head(&url))?;
        match response.status().as_u16() {
            200..=299 => Ok(true),
            404 => Ok(false),
            _ => Err(Self::status_error(response)),
        }
    }

    fn read_bytes(&self, key: &str) -> Result<Vec<u8>, ImpactError> {
        let url = self.blob_url(key);
        let response = self.send(|| self.client.get(&url))?;
        if response.status().as_u16() == 404 {
            return Err(ImpactError::NotFound(key.to_string()));
        }
        if !response.status().is_success() {
            return Err(Self::status_error(response));
        }
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| ImpactError::BlobHttp(err.to_string()))
    }

    fn write_bytes(&self, key: &str, content: &[u8]) -> Result<(), ImpactError> {
        if self.read_only {
            return Err(ImpactError::ReadOnlyStore(key.to_string()));
        }
        let url = self.blob_url(key);
        let response = self.send(|| {
            self.client
                .put(&url)
                .header("x-ms-blob-type", "BlockBlob")
                .body(content.to_vec())
        })?;
        if !response.status().is_success() {
            return Err(Self::status_error(response));
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), ImpactError> {
        if self.read_only {
            return Err(ImpactError::ReadOnlyStore(key.to_string()));
        }
        let url = self.blob_url(key);
        let response = self.send(|| self.client.delete(&url))?;
        match response.status().as_u16() {
            200..=299 | 404 => Ok(()),
            _ => Err(Self::status_error(response)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, ImpactError> {
        let names = Regex::new(r"<Name>([^<]*)</Name>")
            .map_err(|err| ImpactError::Storage(err.to_string()))?;
        let next_marker = Regex::new(r"<NextMarker>([^<]+)</NextMarker>")
            .map_err(|err| ImpactError::Storage(err.to_string()))?;

        let base = format!(
            "{}/{}?restype=container&comp=list&{}",
            self.account_url, self.container, self.sas_token
        );
        let mut keys = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let response = self.send(|| {
                let mut request = self.client.get(&base).query(&[("prefix", prefix)]);
                if let Some(marker) = &marker {
                    request = request.query(&[("marker", marker.as_str())]);
                }
                request
            })?;
            if !response.status().is_success() {
                return Err(Self::status_error(response));
            }
            let body = response
                .text()
                .map_err(|err| ImpactError::BlobHttp(err.to_string()))?;
            keys.extend(
                names
                    .captures_iter(&body)
                    .filter_map(|caps| caps.get(1))
                    .map(|name| name.as_str().to_string()),
            );
            marker = next_marker
                .captures(&body)
                .and_then(|caps| caps.get(1))
                .map(|value| value.as_str().to_string());
            if marker.is_none() {
                break;
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Process-local backend. Counts successful writes and can be told to fail
/// writes under a prefix.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    writes: AtomicUsize,
    failing_prefix: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_writes_under(&self, prefix: Option<&str>) {
        if let Ok(mut guard) = self.failing_prefix.lock() {
            *guard = prefix.map(str::to_string);
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>, ImpactError> {
        self.objects
            .lock()
            .map_err(|_| ImpactError::Storage("memory store poisoned".to_string()))
    }
}

impl StoragePort for MemoryStore {
    fn exists(&self, key: &str) -> Result<bool, ImpactError> {
        Ok(self.lock()?.contains_key(key))
    }

    fn read_bytes(&self, key: &str) -> Result<Vec<u8>, ImpactError> {
        self.lock()?
            .get(key)
            .cloned()
            .ok_or_else(|| ImpactError::NotFound(key.to_string()))
    }

    fn write_bytes(&self, key: &str, content: &[u8]) -> Result<(), ImpactError> {
        let failing = self
            .failing_prefix
            .lock()
            .map_err(|_| ImpactError::Storage("memory store poisoned".to_string()))?
            .clone();
        if let Some(prefix) = failing {
            if key.starts_with(&prefix) {
                return Err(ImpactError::Storage(format!("injected write failure: {key}")));
            }
        }
        self.lock()?.insert(key.to_string(), content.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), ImpactError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, ImpactError> {
        Ok(self
            .lock()?
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}
