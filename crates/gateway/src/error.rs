use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("user not authenticated")]
    NotAuthenticated,
    #[error("authentication failed: {reason}")]
    AuthFailure { reason: String },
    #[error("requested row not found")]
    NotFound,
    #[error("backend unreachable: {0}")]
    Transient(String),
    #[error("backend returned {status}: {message}")]
    Remote {
        status: u16,
        message: String,
        code: Option<String>,
    },
    #[error("failed to decode backend response: {0}")]
    Decode(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("refusing unfiltered delete on {table}")]
    UnscopedDelete { table: String },
    #[error("invalid oauth redirect: {0}")]
    InvalidRedirect(String),
    #[error("session store failure: {0}")]
    Store(String),
}

impl GatewayError {
    /// The only distinction the gateway draws on behalf of callers.
    pub fn is_not_authenticated(&self) -> bool {
        matches!(self, GatewayError::NotAuthenticated)
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else {
            GatewayError::Transient(err.to_string())
        }
    }
}

impl From<url::ParseError> for GatewayError {
    fn from(err: url::ParseError) -> Self {
        GatewayError::InvalidUrl(err.to_string())
    }
}
