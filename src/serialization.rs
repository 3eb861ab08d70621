use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};

use crate::errors::{ForecastError, ForecastResult};
use crate::models::{Forecast, Observation, ObservationSource};

/// Trait for serializing data to different formats
pub trait FormatSerializer<T> {
    /// Serialize to JSON string
    fn to_json(&self) -> ForecastResult<String>;

    /// Serialize to TOML string
    fn to_toml(&self) -> ForecastResult<String>;

    /// Serialize to CSV string
    fn to_csv(&self) -> ForecastResult<String>;

    /// Deserialize from JSON string
    fn from_json(json: &str) -> ForecastResult<T>;

    /// Deserialize from TOML string
    fn from_toml(toml: &str) -> ForecastResult<T>;

    /// Deserialize from CSV string
    fn from_csv(csv: &str) -> ForecastResult<T>;
}

/// Wrapper for observation collections to implement serialization.
///
/// The CSV shape doubles as the hand-off format from receipt and sensor
/// pipelines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationList {
    pub observations: Vec<Observation>,
}

impl ObservationList {
    pub fn new(observations: Vec<Observation>) -> Self {
        Self { observations }
    }
}

impl FormatSerializer<ObservationList> for ObservationList {
    fn to_json(&self) -> ForecastResult<String> {
        serde_json::to_string_pretty(self).map_err(Into::into)
    }

    fn to_toml(&self) -> ForecastResult<String> {
        toml::to_string(self).map_err(Into::into)
    }

    fn to_csv(&self) -> ForecastResult<String> {
        let mut wtr = WriterBuilder::new().from_writer(vec![]);

        wtr.write_record(["item_id", "timestamp", "quantity", "source"])?;

        for obs in &self.observations {
            wtr.write_record(&[
                obs.item_id.clone(),
                obs.timestamp.to_rfc3339(),
                obs.quantity.to_string(),
                source_label(obs.source).to_string(),
            ])?;
        }

        let data = String::from_utf8(wtr.into_inner().map_err(|e| {
            ForecastError::serialization(format!("CSV writer error: {:?}", e))
        })?)?;
        Ok(data)
    }

    fn from_json(json: &str) -> ForecastResult<ObservationList> {
        serde_json::from_str(json).map_err(Into::into)
    }

    fn from_toml(toml_str: &str) -> ForecastResult<ObservationList> {
        toml::from_str(toml_str).map_err(Into::into)
    }

    fn from_csv(csv_data: &str) -> ForecastResult<ObservationList> {
        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .from_reader(csv_data.as_bytes());
        let mut observations = Vec::new();

        for result in rdr.records() {
            let record = result?;

            if record.len() < 4 {
                return Err(ForecastError::serialization(
                    "Invalid CSV format - insufficient columns",
                ));
            }

            let timestamp = chrono::DateTime::parse_from_rfc3339(&record[1])
                .map_err(|_| ForecastError::serialization("Invalid timestamp in CSV"))?
                .with_timezone(&chrono::Utc);

            let quantity: f64 = record[2]
                .parse()
                .map_err(|_| ForecastError::serialization("Invalid quantity in CSV"))?;

            let source = match &record[3] {
                "sensor" => ObservationSource::Sensor,
                "receipt" => ObservationSource::Receipt,
                "manual" => ObservationSource::Manual,
                "system" => ObservationSource::System,
                _ => return Err(ForecastError::serialization("Invalid source in CSV")),
            };

            observations.push(Observation::new(
                record[0].to_string(),
                timestamp,
                quantity,
                source,
            ));
        }

        Ok(ObservationList { observations })
    }
}

/// Wrapper for forecast collections to implement serialization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastList {
    pub forecasts: Vec<Forecast>,
}

impl ForecastList {
    pub fn new(forecasts: Vec<Forecast>) -> Self {
        Self { forecasts }
    }
}

impl FormatSerializer<ForecastList> for ForecastList {
    fn to_json(&self) -> ForecastResult<String> {
        serde_json::to_string_pretty(self).map_err(Into::into)
    }

    fn to_toml(&self) -> ForecastResult<String> {
        toml::to_string(self).map_err(Into::into)
    }

    fn to_csv(&self) -> ForecastResult<String> {
        let mut wtr = WriterBuilder::new().from_writer(vec![]);

        // Summary columns only; trajectories stay in JSON/TOML exports.
        wtr.write_record([
            "forecast_id",
            "item_id",
            "created_at",
            "model_version",
            "horizon_days",
            "predicted_runout_date",
            "confidence",
            "recommended_order_date",
            "recommended_quantity",
        ])?;

        for forecast in &self.forecasts {
            wtr.write_record(&[
                forecast.forecast_id.to_string(),
                forecast.item_id.clone(),
                forecast.created_at.to_rfc3339(),
                forecast.model_version.to_string(),
                forecast.horizon_days.to_string(),
                forecast
                    .predicted_runout_date
                    .map(|d| d.to_rfc3339())
                    .unwrap_or_default(),
                forecast.confidence.to_string(),
                forecast
                    .recommended_order_date
                    .map(|d| d.to_rfc3339())
                    .unwrap_or_default(),
                forecast.recommended_quantity.to_string(),
            ])?;
        }

        let data = String::from_utf8(wtr.into_inner().map_err(|e| {
            ForecastError::serialization(format!("CSV writer error: {:?}", e))
        })?)?;
        Ok(data)
    }

    fn from_json(json: &str) -> ForecastResult<ForecastList> {
        serde_json::from_str(json).map_err(Into::into)
    }

    fn from_toml(toml_str: &str) -> ForecastResult<ForecastList> {
        toml::from_str(toml_str).map_err(Into::into)
    }

    fn from_csv(_csv: &str) -> ForecastResult<ForecastList> {
        Err(ForecastError::serialization(
            "CSV deserialization not implemented for forecasts - use JSON or TOML",
        ))
    }
}

fn source_label(source: ObservationSource) -> &'static str {
    match source {
        ObservationSource::Sensor => "sensor",
        ObservationSource::Receipt => "receipt",
        ObservationSource::Manual => "manual",
        ObservationSource::System => "system",
    }
}

/// Export format used by the observation and forecast surfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializationFormat {
    Json,
    Toml,
    Csv,
}

impl std::fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SerializationFormat::Json => "json",
            SerializationFormat::Toml => "toml",
            SerializationFormat::Csv => "csv",
        })
    }
}

/// Identify which export format an observation file carries.
///
/// A recognized file extension wins; otherwise the content shape decides:
/// the JSON export is always a single object, the CSV hand-off format leads
/// with its `item_id` header column, and the TOML export opens with an
/// `[[observations]]` table array.
pub fn detect_observation_format(filename: &str, content: &str) -> SerializationFormat {
    if let Some(extension) = std::path::Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
    {
        match extension.to_ascii_lowercase().as_str() {
            "json" => return SerializationFormat::Json,
            "toml" => return SerializationFormat::Toml,
            "csv" => return SerializationFormat::Csv,
            _ => {}
        }
    }

    let trimmed = content.trim_start();
    if trimmed.starts_with('{') {
        SerializationFormat::Json
    } else if trimmed
        .lines()
        .next()
        .map(|header| header.starts_with("item_id"))
        .unwrap_or(false)
    {
        SerializationFormat::Csv
    } else {
        SerializationFormat::Toml
    }
}

/// Parse an observation export in the given format and validate every record,
/// returning the accepted observations.
///
/// Receipt and sensor pipelines run their drops through this before handing
/// them to `ForecastService::ingest`; one bad row rejects the whole file so a
/// partially garbled export is never half-applied.
pub fn parse_observation_export(
    content: &str,
    format: SerializationFormat,
) -> ForecastResult<ObservationList> {
    let list = match format {
        SerializationFormat::Json => ObservationList::from_json(content)?,
        SerializationFormat::Toml => ObservationList::from_toml(content)?,
        SerializationFormat::Csv => ObservationList::from_csv(content)?,
    };

    for observation in &list.observations {
        observation.validate()?;
    }
    Ok(list)
}
