//! Session state as observed by the presentation layer, and the pure
//! transitions that produce it.

use serde::{Deserialize, Serialize};
use shared::{domain::Identity, protocol::PublicSettings};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorKind {
    UserNotRegistered,
    AuthRequired,
    AuthFailed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct AuthError {
    pub kind: AuthErrorKind,
    pub message: String,
}

impl AuthError {
    pub fn new(kind: AuthErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Errors that leave the user without a usable session.
    pub fn blocks_session(&self) -> bool {
        matches!(
            self.kind,
            AuthErrorKind::AuthRequired | AuthErrorKind::UserNotRegistered
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Initializing,
    Authenticated,
    Unauthenticated,
    Error(AuthErrorKind),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub user: Option<Identity>,
    pub is_loading_auth: bool,
    pub is_loading_public_settings: bool,
    pub auth_error: Option<AuthError>,
    pub public_settings: Option<PublicSettings>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            user: None,
            is_loading_auth: true,
            is_loading_public_settings: true,
            auth_error: None,
            public_settings: None,
        }
    }
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
            && !self
                .auth_error
                .as_ref()
                .is_some_and(AuthError::blocks_session)
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading_auth || self.is_loading_public_settings
    }

    pub fn phase(&self) -> SessionPhase {
        if self.is_loading() {
            SessionPhase::Initializing
        } else if self.is_authenticated() {
            SessionPhase::Authenticated
        } else if let Some(err) = &self.auth_error {
            SessionPhase::Error(err.kind)
        } else {
            SessionPhase::Unauthenticated
        }
    }
}

/// Everything that can change a [`SessionState`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    /// A session check is under way.
    CheckStarted,
    /// The session check found a user.
    CheckSucceeded(Identity),
    /// The session check found no usable session. `None` means the user is
    /// simply signed out.
    CheckFailed(Option<AuthError>),
    /// Nothing is left awaiting the gateway and whatever resolved last was
    /// superseded, so the user already reflects the newest input.
    CheckSettled,
    /// An action is starting; any surfaced error is stale.
    ActionStarted,
    IdentityLoaded(Identity),
    Failed(AuthError),
    SignedOut,
    LoggedOut { redirect: bool },
    ProfileUpdated(Identity),
}

pub fn reduce(state: &mut SessionState, input: SessionInput) {
    match input {
        SessionInput::CheckStarted => {
            state.is_loading_auth = true;
            state.is_loading_public_settings = true;
            state.auth_error = None;
        }
        SessionInput::CheckSucceeded(identity) => {
            state.user = Some(identity);
            state.auth_error = None;
            settle(state);
        }
        SessionInput::CheckFailed(error) => {
            state.user = None;
            state.auth_error = error;
            settle(state);
        }
        SessionInput::CheckSettled => settle(state),
        SessionInput::ActionStarted => state.auth_error = None,
        SessionInput::IdentityLoaded(identity) => {
            state.user = Some(identity);
            state.auth_error = None;
        }
        SessionInput::Failed(error) => state.auth_error = Some(error),
        SessionInput::SignedOut => {
            state.user = None;
            state.auth_error = None;
        }
        SessionInput::LoggedOut { redirect: true } => *state = SessionState::default(),
        SessionInput::LoggedOut { redirect: false } => state.user = None,
        SessionInput::ProfileUpdated(identity) => state.user = Some(identity),
    }
}

fn settle(state: &mut SessionState) {
    state.is_loading_auth = false;
    state.is_loading_public_settings = false;
    state.public_settings = Some(PublicSettings::hosted_backend());
}
