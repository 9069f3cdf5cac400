use std::time::Duration;

use chrono::NaiveDate;
use geo::MultiPolygon;
use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::config::WarehouseCredentials;
use crate::domain::{ForecastRef, ForecastTime, StormId, WindThreshold};
use crate::error::ImpactError;
use crate::geometry::decode_geojson;
use crate::http::send_with_retries;

/// Ensemble member carrying the deterministic (high-resolution) run.
pub const DETERMINISTIC_MEMBER: u32 = 51;

/// Area at or above `threshold` for one ensemble member of a forecast.
#[derive(Debug, Clone)]
pub struct StormEnvelope {
    pub storm: StormId,
    pub forecast_time: ForecastTime,
    pub ensemble_member: u32,
    pub threshold: WindThreshold,
    pub geometry: MultiPolygon<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPosition {
    pub lead_time_h: i64,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub wind_speed_kt: Option<f64>,
    #[serde(default)]
    pub pressure_hpa: Option<f64>,
}

/// One ensemble member's path, positions ordered by lead time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleTrack {
    pub member: u32,
    pub positions: Vec<TrackPosition>,
}

pub trait StormSource: Send + Sync {
    fn list_forecasts(&self, since: NaiveDate) -> Result<Vec<ForecastRef>, ImpactError>;
    fn get_envelopes(
        &self,
        storm: &StormId,
        forecast_time: ForecastTime,
    ) -> Result<Vec<StormEnvelope>, ImpactError>;
    fn get_tracks(
        &self,
        storm: &StormId,
        forecast_time: ForecastTime,
    ) -> Result<Vec<EnsembleTrack>, ImpactError>;
}

/// Storm source backed by the warehouse SQL REST endpoint.
#[derive(Clone)]
pub struct WarehouseClient {
    client: Client,
    base_url: String,
    credentials: WarehouseCredentials,
}

impl WarehouseClient {
    pub fn new(credentials: WarehouseCredentials) -> Result<Self, ImpactError> {
        let base_url = format!("https://{}.snowflakecomputing.com", credentials.account);
        Self::with_base_url(credentials, base_url)
    }

    pub fn with_base_url(
        credentials: WarehouseCredentials,
        base_url: String,
    ) -> Result<Self, ImpactError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("storm-impact/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ImpactError::WarehouseHttp(err.to_string()))?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", credentials.token))
                .map_err(|err| ImpactError::WarehouseHttp(err.to_string()))?,
        );
        headers.insert(
            "X-Snowflake-Authorization-Token-Type",
            HeaderValue::from_static("PROGRAMMATIC_ACCESS_TOKEN"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| ImpactError::WarehouseHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    /// Runs one statement and returns every row across all result partitions.
    fn query(&self, statement: &str, bindings: &[&str]) -> Result<Vec<Vec<Value>>, ImpactError> {
        let mut binds = serde_json::Map::new();
        for (idx, value) in bindings.iter().enumerate() {
            binds.insert(
                (idx + 1).to_string(),
                json!({ "type": "TEXT", "value": value }),
            );
        }
        let body = json!({
            "statement": statement,
            "timeout": 120,
            "warehouse": self.credentials.warehouse,
            "database": self.credentials.database,
            "schema": self.credentials.schema,
            "bindings": binds,
        });

        let url = format!("{}/api/v2/statements", self.base_url);
        let response = send_with_retries(
            || self.client.post(&url).json(&body),
            ImpactError::WarehouseHttp,
        )?;
        let first: StatementResponse = Self::decode(response)?;

        let mut rows = first.data;
        let partitions = first
            .result_set_meta_data
            .map(|meta| meta.partition_info.len())
            .unwrap_or(1);
        if let Some(handle) = first.statement_handle {
            for partition in 1..partitions {
                let url = format!("{}/api/v2/statements/{handle}", self.base_url);
                let response = send_with_retries(
                    || {
                        self.client
                            .get(&url)
                            .query(&[("partition", partition.to_string())])
                    },
                    ImpactError::WarehouseHttp,
                )?;
                let page: StatementResponse = Self::decode(response)?;
                rows.extend(page.data);
            }
        }
        debug!(rows = rows.len(), "warehouse query complete");
        Ok(rows)
    }

    fn decode(response: reqwest::blocking::Response) -> Result<StatementResponse, ImpactError> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "warehouse request failed".to_string());
            return Err(ImpactError::WarehouseStatus { status, message });
        }
        response
            .json()
            .map_err(|err| ImpactError::WarehouseHttp(err.to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Vec<Vec<Value>>,
    #[serde(default)]
    statement_handle: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    #[serde(default)]
    partition_info: Vec<Value>,
}

const LIST_FORECASTS: &str = "SELECT DISTINCT TRACK_ID, TO_VARCHAR(FORECAST_TIME, 'YYYY-MM-DD HH24:MI:SS') \
     FROM TC_TRACKS WHERE FORECAST_TIME >= TO_TIMESTAMP(?) \
     ORDER BY 2 DESC, 1";

const GET_ENVELOPES: &str = "SELECT ENSEMBLE_MEMBER, WIND_THRESHOLD, ST_ASGEOJSON(ENVELOPE_REGION) \
     FROM TC_ENVELOPES_COMBINED WHERE TRACK_ID = ? AND FORECAST_TIME = TO_TIMESTAMP(?) \
     ORDER BY ENSEMBLE_MEMBER, WIND_THRESHOLD";

const GET_TRACKS: &str = "SELECT ENSEMBLE_MEMBER, LEAD_TIME, LATITUDE, LONGITUDE, WIND_SPEED_KNOTS, PRESSURE_HPA \
     FROM TC_TRACKS WHERE TRACK_ID = ? AND FORECAST_TIME = TO_TIMESTAMP(?) \
     ORDER BY ENSEMBLE_MEMBER, LEAD_TIME";

impl StormSource for WarehouseClient {
    fn list_forecasts(&self, since: NaiveDate) -> Result<Vec<ForecastRef>, ImpactError> {
        let since = since.format("%Y-%m-%d 00:00:00").to_string();
        self.query(LIST_FORECASTS, &[&since])?
            .iter()
            .map(|row| {
                Ok(ForecastRef {
                    storm: text_cell(row, 0)?.parse()?,
                    forecast_time: text_cell(row, 1)?.parse()?,
                })
            })
            .collect()
    }

    fn get_envelopes(
        &self,
        storm: &StormId,
        forecast_time: ForecastTime,
    ) -> Result<Vec<StormEnvelope>, ImpactError> {
        let rows = self.query(GET_ENVELOPES, &[storm.as_str(), &forecast_time.to_sql()])?;
        let mut envelopes = Vec::with_capacity(rows.len());
        for row in &rows {
            let knots = number_cell(row, 1)?
                .ok_or_else(|| invalid_row("WIND_THRESHOLD is null"))?;
            let geometry: Value = serde_json::from_str(text_cell(row, 2)?)
                .map_err(|err| invalid_row(&format!("ENVELOPE_REGION: {err}")))?;
            envelopes.push(StormEnvelope {
                storm: storm.clone(),
                forecast_time,
                ensemble_member: member_cell(row, 0)?,
                threshold: WindThreshold::try_from(knots.round() as u16)?,
                geometry: decode_geojson(&geometry)?,
            });
        }
        Ok(envelopes)
    }

    fn get_tracks(
        &self,
        storm: &StormId,
        forecast_time: ForecastTime,
    ) -> Result<Vec<EnsembleTrack>, ImpactError> {
        let rows = self.query(GET_TRACKS, &[storm.as_str(), &forecast_time.to_sql()])?;
        let mut tracks: Vec<EnsembleTrack> = Vec::new();
        for row in &rows {
            let member = member_cell(row, 0)?;
            let position = TrackPosition {
                lead_time_h: number_cell(row, 1)?.unwrap_or_default() as i64,
                lat: number_cell(row, 2)?.ok_or_else(|| invalid_row("LATITUDE is null"))?,
                lon: number_cell(row, 3)?.ok_or_else(|| invalid_row("LONGITUDE is null"))?,
                wind_speed_kt: number_cell(row, 4)?,
                pressure_hpa: number_cell(row, 5)?,
            };
            match tracks.last_mut() {
                Some(track) if track.member == member => track.positions.push(position),
                _ => tracks.push(EnsembleTrack {
                    member,
                    positions: vec![position],
                }),
            }
        }
        Ok(tracks)
    }
}

fn text_cell(row: &[Value], idx: usize) -> Result<&str, ImpactError> {
    row.get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| invalid_row(&format!("column {idx} is not text")))
}

fn number_cell(row: &[Value], idx: usize) -> Result<Option<f64>, ImpactError> {
    match row.get(idx) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => Ok(number.as_f64()),
        Some(Value::String(text)) => text
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| invalid_row(&format!("column {idx} is not numeric: {text}"))),
        Some(other) => Err(invalid_row(&format!("column {idx} is not numeric: {other}"))),
    }
}

fn member_cell(row: &[Value], idx: usize) -> Result<u32, ImpactError> {
    let value = number_cell(row, idx)?.ok_or_else(|| invalid_row("ENSEMBLE_MEMBER is null"))?;
    if value < 0.0 {
        return Err(invalid_row("ENSEMBLE_MEMBER is negative"));
    }
    Ok(value as u32)
}

fn invalid_row(message: &str) -> ImpactError {
    ImpactError::InvalidStormData(format!("unexpected result row: {message}"))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn cells_accept_text_numbers() {
        let row = vec![json!("51"), json!(12), Value::Null];
        assert_eq!(member_cell(&row, 0).unwrap(), 51);
        assert_eq!(number_cell(&row, 1).unwrap(), Some(12.0));
        assert_eq!(number_cell(&row, 2).unwrap(), None);
        assert_matches!(text_cell(&row, 1), Err(ImpactError::InvalidStormData(_)));
        assert!(!member_cell(&[json!(-1)], 0).unwrap_err().is_retryable());
    }

    #[test]
    fn statement_response_reads_partitions() {
        let response: StatementResponse = serde_json::from_value(json!({
            "resultSetMetaData": { "partitionInfo": [{ "rowCount": 1 }, { "rowCount": 1 }] },
            "data": [["FUNG-WONG", "2025-11-10 00:00:00"]],
            "statementHandle": "01b2"
        }))
        .unwrap();
        assert_eq!(response.data.len(), 1);
        assert_eq!(
            response.result_set_meta_data.unwrap().partition_info.len(),
            2
        );
    }
}
