use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Row-store error code for "single row requested, none found".
pub const NO_ROWS_CODE: &str = "PGRST116";

/// Error body returned by the row store.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct ApiError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
            details: None,
            hint: None,
        }
    }

    pub fn is_no_rows(&self) -> bool {
        self.code.as_deref() == Some(NO_ROWS_CODE)
    }
}

/// Error body returned by the auth service. Field names vary between
/// endpoints and service versions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthApiError {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl AuthApiError {
    pub fn reason(&self) -> String {
        self.error_description
            .clone()
            .or_else(|| self.msg.clone())
            .or_else(|| self.message.clone())
            .or_else(|| self.error.clone())
            .unwrap_or_else(|| "authentication failed".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_prefers_description_over_code() {
        let err: AuthApiError = serde_json::from_str(
            r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#,
        )
        .expect("json");
        assert_eq!(err.reason(), "Invalid login credentials");
    }

    #[test]
    fn no_rows_code_is_recognised() {
        let err: ApiError = serde_json::from_str(
            r#"{"code":"PGRST116","message":"JSON object requested, multiple (or no) rows returned"}"#,
        )
        .expect("json");
        assert!(err.is_no_rows());
        assert!(!ApiError::new("42501", "denied").is_no_rows());
    }
}
