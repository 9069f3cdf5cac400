use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ImpactError {
    #[error("invalid storm identifier: {0}")]
    InvalidStormId(String),

    #[error("invalid forecast time: {0}")]
    InvalidForecastTime(String),

    #[error("invalid ISO3 country code: {0}")]
    InvalidCountryCode(String),

    #[error("unsupported wind threshold: {0}")]
    InvalidWindThreshold(String),

    #[error("invalid facility kind: {0}")]
    InvalidFacilityKind(String),

    #[error("missing config file storm-impact.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("missing credentials for {provider}: {missing}")]
    #[diagnostic(help("set the listed environment variables before starting the run"))]
    MissingCredentials { provider: String, missing: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{source_name} temporarily unavailable: {message}")]
    InputUnavailable {
        source_name: String,
        message: String,
    },

    #[error("warehouse request failed: {0}")]
    WarehouseHttp(String),

    #[error("malformed storm data: {0}")]
    InvalidStormData(String),

    #[error("warehouse returned status {status}: {message}")]
    WarehouseStatus { status: u16, message: String },

    #[error("blob request failed: {0}")]
    BlobHttp(String),

    #[error("blob storage returned status {status}: {message}")]
    BlobStatus { status: u16, message: String },

    #[error("probability {value} outside [0, 1] for {context}")]
    ProbabilityOutOfRange { value: f64, context: String },

    #[error("data invariant violated: {0}")]
    InvariantViolation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("key not found in storage: {0}")]
    NotFound(String),

    #[error("storage backend is read-only, refusing to write {0}")]
    ReadOnlyStore(String),

    #[error("unit of work cancelled before completion")]
    Cancelled,
}

impl ImpactError {
    /// Whether retrying the same unit of work later can succeed without a
    /// data or configuration fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ImpactError::InputUnavailable { .. }
                | ImpactError::WarehouseHttp(_)
                | ImpactError::WarehouseStatus { .. }
                | ImpactError::BlobHttp(_)
                | ImpactError::BlobStatus { .. }
                | ImpactError::Storage(_)
                | ImpactError::Cancelled
        )
    }

    pub fn is_config(&self) -> bool {
        matches!(
            self,
            ImpactError::MissingConfig
                | ImpactError::ConfigRead(_)
                | ImpactError::ConfigParse(_)
                | ImpactError::MissingCredentials { .. }
                | ImpactError::InvalidConfig(_)
        )
    }

    pub fn unavailable(source_name: &str, message: impl Into<String>) -> Self {
        ImpactError::InputUnavailable {
            source_name: source_name.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(ImpactError::unavailable("boundary", "timeout").is_retryable());
        assert!(ImpactError::Storage("disk full".to_string()).is_retryable());
        assert!(!ImpactError::InvariantViolation("nested".to_string()).is_retryable());
        assert!(
            !ImpactError::ProbabilityOutOfRange {
                value: 1.2,
                context: "tile".to_string()
            }
            .is_retryable()
        );
        assert!(!ImpactError::InvalidStormData("bad row".to_string()).is_retryable());
        assert!(ImpactError::MissingConfig.is_config());
    }
}
