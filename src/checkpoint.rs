use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{ForecastError, ForecastResult};
use crate::features::FEATURE_WIDTH;
use crate::models::{
    CheckpointOwner, InfluenceMatrix, ModelCheckpoint, ModelParameters, ModelState,
    StateCovariance, TrainingStats, STATE_DIM,
};

/// Current checkpoint envelope schema version.
///
/// Envelopes with an older version are treated as missing: the caller falls
/// through to the next warm-start source and the next full retrain rebuilds
/// the model from history.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Envelope magic bytes
const MAGIC: &[u8; 4] = b"PFCK";

/// Fixed envelope header length: magic + schema + crc + payload length
const HEADER_LEN: usize = 4 + 4 + 4 + 8;

/// Typed checkpoint payload as persisted inside the envelope.
///
/// Unknown keys are ignored on read and never produced on write, so newer
/// writers can extend the payload without breaking older readers.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointPayload {
    model_id: Uuid,
    owner: CheckpointOwner,
    version: u64,
    created_at_ns: i64,
    feature_names: Vec<String>,
    parameters: ParametersBlob,
    last_state: [f64; STATE_DIM],
    covariance: Vec<f64>,
    stats: TrainingStats,
}

/// Flattened row-major parameter matrices
#[derive(Debug, Serialize, Deserialize)]
struct ParametersBlob {
    transition: Vec<f64>,
    influence: Vec<f64>,
    process_noise: Vec<f64>,
    observation_noise: f64,
}

/// Serialize a checkpoint into the versioned binary envelope:
/// `magic | schema_version u32 | crc32 u32 | payload_len u64 | payload`.
pub fn encode_checkpoint(checkpoint: &ModelCheckpoint) -> ForecastResult<Vec<u8>> {
    let payload = CheckpointPayload {
        model_id: checkpoint.model_id,
        owner: checkpoint.owner.clone(),
        version: checkpoint.version,
        created_at_ns: checkpoint
            .trained_at
            .timestamp_nanos_opt()
            .unwrap_or_default(),
        feature_names: checkpoint.feature_names.clone(),
        parameters: ParametersBlob {
            transition: flatten_square(&checkpoint.parameters.transition),
            influence: flatten_influence(&checkpoint.parameters.influence),
            process_noise: flatten_square(&checkpoint.parameters.process_noise),
            observation_noise: checkpoint.parameters.observation_noise,
        },
        last_state: [
            checkpoint.state.quantity,
            checkpoint.state.rate,
            checkpoint.state.trend,
            checkpoint.state.seasonal,
        ],
        covariance: flatten_square(&checkpoint.covariance),
        stats: checkpoint.stats.clone(),
    };

    let body = serde_json::to_vec(&payload)?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&CHECKPOINT_SCHEMA_VERSION.to_le_bytes());
    out.extend_from_slice(&crc32(&body).to_le_bytes());
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Deserialize a checkpoint envelope, validating magic, schema version, CRC,
/// and payload shape. Bytes beyond the declared payload length are ignored.
pub fn decode_checkpoint(key: &str, bytes: &[u8]) -> ForecastResult<ModelCheckpoint> {
    if bytes.len() < HEADER_LEN {
        return Err(ForecastError::checkpoint_corrupt(key, "Envelope truncated"));
    }

    if &bytes[0..4] != MAGIC {
        return Err(ForecastError::checkpoint_corrupt(key, "Bad magic bytes"));
    }

    let schema = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    if schema != CHECKPOINT_SCHEMA_VERSION {
        return Err(ForecastError::checkpoint_corrupt(
            key,
            format!("Schema version {} is not supported", schema),
        ));
    }

    let stored_crc = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    let payload_len = u64::from_le_bytes(bytes[12..HEADER_LEN].try_into().unwrap()) as usize;

    let Some(body) = bytes.get(HEADER_LEN..HEADER_LEN + payload_len) else {
        return Err(ForecastError::checkpoint_corrupt(key, "Payload truncated"));
    };

    if crc32(body) != stored_crc {
        return Err(ForecastError::checkpoint_corrupt(key, "CRC mismatch"));
    }

    let payload: CheckpointPayload = serde_json::from_slice(body)
        .map_err(|e| ForecastError::checkpoint_corrupt(key, format!("Bad payload: {}", e)))?;

    let parameters = ModelParameters {
        transition: unflatten_square(key, &payload.parameters.transition)?,
        influence: unflatten_influence(key, &payload.parameters.influence)?,
        process_noise: unflatten_square(key, &payload.parameters.process_noise)?,
        observation_noise: payload.parameters.observation_noise,
    };

    if !parameters.is_finite() {
        return Err(ForecastError::checkpoint_corrupt(
            key,
            "Parameters contain non-finite values",
        ));
    }

    let state = ModelState {
        quantity: payload.last_state[0],
        rate: payload.last_state[1],
        trend: payload.last_state[2],
        seasonal: payload.last_state[3],
    };

    let trained_at = nanos_to_datetime(payload.created_at_ns);

    Ok(ModelCheckpoint {
        model_id: payload.model_id,
        owner: payload.owner,
        version: payload.version,
        parameters,
        state,
        covariance: unflatten_square(key, &payload.covariance)?,
        trained_at,
        feature_names: payload.feature_names,
        stats: payload.stats,
    })
}

fn nanos_to_datetime(ns: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(ns)
}

fn flatten_square(matrix: &StateCovariance) -> Vec<f64> {
    let mut out = Vec::with_capacity(STATE_DIM * STATE_DIM);
    for row in 0..STATE_DIM {
        for col in 0..STATE_DIM {
            out.push(matrix[(row, col)]);
        }
    }
    out
}

fn unflatten_square(key: &str, values: &[f64]) -> ForecastResult<StateCovariance> {
    if values.len() != STATE_DIM * STATE_DIM {
        return Err(ForecastError::checkpoint_corrupt(
            key,
            format!("Expected {} matrix entries", STATE_DIM * STATE_DIM),
        ));
    }
    let mut matrix = StateCovariance::zeros();
    for row in 0..STATE_DIM {
        for col in 0..STATE_DIM {
            matrix[(row, col)] = values[row * STATE_DIM + col];
        }
    }
    Ok(matrix)
}

fn flatten_influence(matrix: &InfluenceMatrix) -> Vec<f64> {
    let mut out = Vec::with_capacity(STATE_DIM * FEATURE_WIDTH);
    for row in 0..STATE_DIM {
        for col in 0..FEATURE_WIDTH {
            out.push(matrix[(row, col)]);
        }
    }
    out
}

fn unflatten_influence(key: &str, values: &[f64]) -> ForecastResult<InfluenceMatrix> {
    if values.len() != STATE_DIM * FEATURE_WIDTH {
        return Err(ForecastError::checkpoint_corrupt(
            key,
            format!("Expected {} influence entries", STATE_DIM * FEATURE_WIDTH),
        ));
    }
    let mut matrix = InfluenceMatrix::zeros();
    for row in 0..STATE_DIM {
        for col in 0..FEATURE_WIDTH {
            matrix[(row, col)] = values[row * FEATURE_WIDTH + col];
        }
    }
    Ok(matrix)
}

/// CRC-32 (IEEE, reflected) over the payload bytes.
fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for byte in bytes {
        crc ^= u32::from(*byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}
