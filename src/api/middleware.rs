use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application error types
#[derive(Debug, Error)]
pub enum AppError {
    /// Rule model could not be built or a referenced algorithm/property is invalid
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Hint data source `{0}` does not exist")]
    HintDataSourceNotFound(String),

    /// A valid statement uses a construct the router or rewriter cannot honor
    #[error("Unsupported construct: {0}")]
    UnsupportedConstruct(String),

    #[error("No matching shard: {0}")]
    NoMatchingShard(String),

    #[error("Invalid SQL: {0}")]
    InvalidSql(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl AppError {
    /// Stable error code exposed to API clients
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Configuration(_) => "CONFIGURATION_ERROR",
            AppError::HintDataSourceNotFound(_) => "HINT_DATA_SOURCE_NOT_FOUND",
            AppError::UnsupportedConstruct(_) => "UNSUPPORTED_CONSTRUCT",
            AppError::NoMatchingShard(_) => "NO_MATCHING_SHARD",
            AppError::InvalidSql(_) => "INVALID_SQL",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::NoMatchingShard(_) | AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_detail = match &self {
            AppError::HintDataSourceNotFound(name) => ErrorDetail::new(self.code(), self.to_string())
                .with_details(format!(
                    "Check the hint or add `{}` under data_sources in the rule file.",
                    name
                )),
            AppError::NoMatchingShard(_) => ErrorDetail::new(self.code(), self.to_string())
                .with_details("The sharding algorithms selected zero targets for this statement."),
            _ => ErrorDetail::new(self.code(), self.to_string()),
        };

        let body = Json(ErrorResponse {
            error: error_detail,
        });

        (status, body).into_response()
    }
}

/// Convert anyhow::Error to AppError
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Convert config::ConfigError to AppError
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration(err.to_string())
    }
}

/// Convert sqlparser tokenizer failures to AppError
impl From<sqlparser::tokenizer::TokenizerError> for AppError {
    fn from(err: sqlparser::tokenizer::TokenizerError) -> Self {
        AppError::InvalidSql(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_status() {
        let error = AppError::NotFound("Rule not found".to_string());
        assert_eq!(error.into_response().status(), StatusCode::NOT_FOUND);

        let error = AppError::HintDataSourceNotFound("ds_9".to_string());
        assert_eq!(error.into_response().status(), StatusCode::BAD_REQUEST);

        let error = AppError::NoMatchingShard("t_order".to_string());
        assert_eq!(error.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_error_detail_creation() {
        let detail = ErrorDetail::new("TEST_CODE", "Test message");
        assert_eq!(detail.code, "TEST_CODE");
        assert_eq!(detail.message, "Test message");
        assert!(detail.details.is_none());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(AppError::Configuration("x".into()).code(), "CONFIGURATION_ERROR");
        assert_eq!(AppError::UnsupportedConstruct("x".into()).code(), "UNSUPPORTED_CONSTRUCT");
    }
}
