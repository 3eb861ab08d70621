use thiserror::Error;

/// Error taxonomy for the forecasting core.
///
/// Every failure crosses module boundaries as one of these structured values;
/// raw strings never escape the module that produced them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ForecastError {
    /// Observation rejected before it touched any model state
    #[error("Invalid observation for '{item_id}': {reason}")]
    InvalidObservation { item_id: String, reason: String },

    /// Filter update produced a non-finite or non-PSD result
    #[error("Numerical fault in model for '{item_id}': {detail}")]
    NumericalFault { item_id: String, detail: String },

    /// Checkpoint failed version, CRC, or schema validation
    #[error("Corrupt checkpoint '{key}': {detail}")]
    CheckpointCorrupt { key: String, detail: String },

    /// A collaborator store returned an I/O failure
    #[error("Store '{store}' unavailable: {detail}")]
    StoreUnavailable { store: String, detail: String },

    /// Full retrain did not complete; the prior model remains active
    #[error("Retrain failed for '{item_id}': {detail}")]
    RetrainFailed { item_id: String, detail: String },

    /// Requested horizon exceeds the configured maximum
    #[error("Forecast horizon {requested} exceeds maximum of {max} days")]
    HorizonExceeded { requested: u32, max: u32 },

    /// No model or observations exist for the item
    #[error("Unknown item '{item_id}'")]
    UnknownItem { item_id: String },

    /// Operation cancelled cooperatively at an I/O boundary
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation exceeded its deadline
    #[error("Operation '{operation}' timed out")]
    Timeout { operation: String },

    /// Serialization/deserialization errors at a persistence boundary
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Configuration validation errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl ForecastError {
    /// Create a new invalid-observation rejection
    pub fn invalid_observation<I: Into<String>, R: Into<String>>(item_id: I, reason: R) -> Self {
        Self::InvalidObservation {
            item_id: item_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a new numerical-fault error
    pub fn numerical_fault<I: Into<String>, D: Into<String>>(item_id: I, detail: D) -> Self {
        Self::NumericalFault {
            item_id: item_id.into(),
            detail: detail.into(),
        }
    }

    /// Create a new corrupt-checkpoint error
    pub fn checkpoint_corrupt<K: Into<String>, D: Into<String>>(key: K, detail: D) -> Self {
        Self::CheckpointCorrupt {
            key: key.into(),
            detail: detail.into(),
        }
    }

    /// Create a new store-unavailable error
    pub fn store_unavailable<S: Into<String>, D: Into<String>>(store: S, detail: D) -> Self {
        Self::StoreUnavailable {
            store: store.into(),
            detail: detail.into(),
        }
    }

    /// Create a new retrain-failed error
    pub fn retrain_failed<I: Into<String>, D: Into<String>>(item_id: I, detail: D) -> Self {
        Self::RetrainFailed {
            item_id: item_id.into(),
            detail: detail.into(),
        }
    }

    /// Create a new unknown-item error
    pub fn unknown_item<I: Into<String>>(item_id: I) -> Self {
        Self::UnknownItem {
            item_id: item_id.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<O: Into<String>>(operation: O) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a new serialization error
    pub fn serialization<S: Into<String>>(message: S) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the caller may retry the failed operation with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. } | Self::Timeout { .. })
    }

    /// The item this error concerns, when one is known
    pub fn item_id(&self) -> Option<&str> {
        match self {
            Self::InvalidObservation { item_id, .. }
            | Self::NumericalFault { item_id, .. }
            | Self::RetrainFailed { item_id, .. }
            | Self::UnknownItem { item_id } => Some(item_id),
            _ => None,
        }
    }
}

/// Result type alias for forecasting operations
pub type ForecastResult<T> = Result<T, ForecastError>;

// Implement conversions from common error types
impl From<serde_json::Error> for ForecastError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for ForecastError {
    fn from(err: toml::de::Error) -> Self {
        Self::serialization(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for ForecastError {
    fn from(err: toml::ser::Error) -> Self {
        Self::serialization(format!("TOML serialization error: {}", err))
    }
}

impl From<csv::Error> for ForecastError {
    fn from(err: csv::Error) -> Self {
        Self::serialization(format!("CSV error: {}", err))
    }
}

impl From<std::string::FromUtf8Error> for ForecastError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Self::serialization(format!("UTF-8 conversion error: {}", err))
    }
}

impl From<std::io::Error> for ForecastError {
    fn from(err: std::io::Error) -> Self {
        Self::store_unavailable("filesystem", err.to_string())
    }
}
