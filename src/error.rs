use std::time::Duration;

use crate::transport::TransportError;

/// In-band error codes the service embeds inside otherwise successful bodies.
pub const ERROR_USAGE_LIMIT_EXCEEDED: i64 = 1037;
pub const ERROR_MODEL_INCONSISTENT: i64 = 1050;
pub const ERROR_MODEL_HEADER_INVALID: i64 = 1052;
pub const ERROR_IP_TEMPORARILY_BLOCKED: i64 = 1060;

#[derive(Debug, thiserror::Error)]
pub enum GeminiError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error calling {endpoint}: {message}")]
    Network { endpoint: String, message: String },

    #[error("{endpoint} returned status {status}: {excerpt}")]
    Api {
        endpoint: String,
        status: u16,
        excerpt: String,
    },

    #[error("failed to parse response at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("usage limit exceeded for the selected model")]
    UsageLimitExceeded,

    #[error("model is inconsistent with the conversation history; start a new chat")]
    ModelInconsistent,

    #[error("model header is invalid or the model is unavailable for this account")]
    ModelHeaderInvalid,

    #[error("IP address is temporarily blocked by the service")]
    IpTemporarilyBlocked,

    #[error("service returned unknown error code {0}")]
    UnknownServiceCode(i64),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("client is closed")]
    ClientClosed,

    #[error("client is closed and auto-reinit is disabled")]
    AutoReinitDisabled,

    #[error("browser refresh attempted too recently; retry in {}s", wait.as_secs().max(1))]
    RefreshTooSoon { wait: Duration },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GeminiError>;

impl GeminiError {
    pub fn parse(path: impl Into<String>, message: impl Into<String>) -> Self {
        GeminiError::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn network(endpoint: &str, err: TransportError) -> Self {
        match err {
            TransportError::Cancelled => GeminiError::Cancelled,
            other => GeminiError::Network {
                endpoint: endpoint.to_string(),
                message: other.to_string(),
            },
        }
    }

    /// Maps an in-band service code to its taxonomy entry.
    pub fn from_service_code(code: i64) -> Self {
        match code {
            ERROR_USAGE_LIMIT_EXCEEDED => GeminiError::UsageLimitExceeded,
            ERROR_MODEL_INCONSISTENT => GeminiError::ModelInconsistent,
            ERROR_MODEL_HEADER_INVALID => GeminiError::ModelHeaderInvalid,
            ERROR_IP_TEMPORARILY_BLOCKED => GeminiError::IpTemporarilyBlocked,
            other => GeminiError::UnknownServiceCode(other),
        }
    }

    /// True for missing/expired credentials and any 401.
    pub fn is_auth(&self) -> bool {
        match self {
            GeminiError::Auth(_) => true,
            GeminiError::Api { status, .. } => *status == 401,
            _ => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            GeminiError::ClientClosed | GeminiError::AutoReinitDisabled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_codes_map_to_taxonomy() {
        assert!(matches!(
            GeminiError::from_service_code(1037),
            GeminiError::UsageLimitExceeded
        ));
        assert!(matches!(
            GeminiError::from_service_code(1060),
            GeminiError::IpTemporarilyBlocked
        ));
        assert!(matches!(
            GeminiError::from_service_code(42),
            GeminiError::UnknownServiceCode(42)
        ));
    }

    #[test]
    fn api_401_counts_as_auth() {
        let err = GeminiError::Api {
            endpoint: "generate".to_string(),
            status: 401,
            excerpt: String::new(),
        };
        assert!(err.is_auth());
        let err = GeminiError::Api {
            endpoint: "generate".to_string(),
            status: 500,
            excerpt: String::new(),
        };
        assert!(!err.is_auth());
    }

    #[test]
    fn refresh_too_soon_reports_wait() {
        let err = GeminiError::RefreshTooSoon {
            wait: Duration::from_secs(42),
        };
        assert_eq!(
            err.to_string(),
            "browser refresh attempted too recently; retry in 42s"
        );
    }
}
