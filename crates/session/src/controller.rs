use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex, Weak,
};

use gateway::{
    on_auth_state_change, AuthGateway, GatewayError, OAuthProvider, SignUpOutcome, Subscription,
};
use shared::{
    domain::{Identity, Year},
    protocol::{AuthChange, AuthChangeEvent, ProfileUpdate},
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::state::{reduce, AuthError, AuthErrorKind, SessionInput, SessionState};

pub const SIGN_UP_PENDING_MESSAGE: &str =
    "Account created successfully! Please check your email to verify.";
const NAVIGATION_CAPACITY: usize = 16;

/// Effects the presentation layer carries out on the controller's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    Login,
    /// Discard in-memory state and start over.
    Reload,
    External(Url),
}

/// Result handed back to form handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub success: bool,
    pub message: Option<String>,
}

impl ActionOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

struct Inner {
    gateway: Arc<dyn AuthGateway>,
    oauth_redirect_to: String,
    state: watch::Sender<SessionState>,
    generation: AtomicU64,
    /// Session checks and auth-change reloads still awaiting the gateway.
    /// Only touched while the state lock is held.
    resolving: AtomicUsize,
    navigation: broadcast::Sender<Navigation>,
    started: AtomicBool,
    subscription: Mutex<Option<Subscription>>,
}

/// Process-wide owner of the session state.
///
/// Every input that decides the user bumps a generation counter. Background
/// results (the session check, auth-change reloads, profile writes) remember
/// the generation they started from and are dropped if anything newer was
/// applied in the meantime. Action results apply directly. The loading flags
/// stay raised until the last outstanding check or reload has resolved, so a
/// superseded check never settles on a user that a pending reload decides.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(gateway: Arc<dyn AuthGateway>, oauth_redirect_to: impl Into<String>) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        let (navigation, _) = broadcast::channel(NAVIGATION_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                gateway,
                oauth_redirect_to: oauth_redirect_to.into(),
                state,
                generation: AtomicU64::new(0),
                resolving: AtomicUsize::new(0),
                navigation,
                started: AtomicBool::new(false),
                subscription: Mutex::new(None),
            }),
        }
    }

    pub fn snapshot(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_navigation(&self) -> broadcast::Receiver<Navigation> {
        self.inner.navigation.subscribe()
    }

    /// Waits until no session check or reload is outstanding and returns the
    /// state it settled on.
    pub async fn settled(&self) -> SessionState {
        let mut states = self.inner.state.subscribe();
        let settled = match states.wait_for(|state| !state.is_loading()).await {
            Ok(state) => state.clone(),
            Err(_) => self.snapshot(),
        };
        settled
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.borrow().is_authenticated()
    }

    pub fn has_subscription(&self) -> bool {
        self.inner
            .subscription
            .lock()
            .map(|slot| slot.as_ref().is_some_and(Subscription::is_active))
            .unwrap_or(false)
    }

    /// Registers the auth-change listener and runs the startup check.
    /// Later calls are no-ops.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!("session controller already started");
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let subscription = on_auth_state_change(self.inner.gateway.as_ref(), move |change| {
            let weak: Weak<Inner> = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    SessionController { inner }.handle_change(change).await;
                }
            }
        });
        match self.inner.subscription.lock() {
            Ok(mut slot) => *slot = Some(subscription),
            Err(_) => error!("subscription slot poisoned; auth changes will not be observed"),
        }

        self.check_app_state().await;
    }

    /// Releases the auth-change listener. Safe to call more than once.
    pub fn shutdown(&self) {
        let released = self
            .inner
            .subscription
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(subscription) = released {
            subscription.unsubscribe();
            info!("session controller stopped observing auth changes");
        }
    }

    /// Resolves the current session against the gateway.
    pub async fn check_app_state(&self) {
        let generation = self.begin_resolution(Some(SessionInput::CheckStarted));
        let outcome = self.inner.gateway.me().await;
        let signed_in = outcome.is_ok();

        let input = match outcome {
            Ok(identity) => {
                info!(user_id = %identity.id, "session check found a signed-in user");
                SessionInput::CheckSucceeded(identity)
            }
            Err(err) => {
                let classified = classify_check_failure(&err);
                match &classified {
                    None => info!("no active session"),
                    Some(auth_error) => {
                        error!(%err, kind = ?auth_error.kind, "session check failed")
                    }
                }
                SessionInput::CheckFailed(classified)
            }
        };

        if !self.finish_resolution(generation, input) {
            debug!("session check result superseded by a newer auth change");
        }

        if signed_in {
            let gateway = Arc::clone(&self.inner.gateway);
            tokio::spawn(async move {
                if let Err(err) = gateway.log_user_in_app().await {
                    warn!(%err, "failed to record app login");
                }
            });
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> ActionOutcome {
        self.apply(SessionInput::ActionStarted);
        let result = match self.inner.gateway.sign_in(email, password).await {
            Ok(_) => self.inner.gateway.me().await,
            Err(err) => Err(err),
        };

        match result {
            Ok(identity) => {
                self.apply(SessionInput::IdentityLoaded(identity));
                ActionOutcome::ok()
            }
            Err(err) => self.action_failed("sign in", err),
        }
    }

    pub async fn sign_up(&self, email: &str, password: &str, full_name: &str) -> ActionOutcome {
        self.apply(SessionInput::ActionStarted);
        let outcome = match self.inner.gateway.sign_up(email, password, full_name).await {
            Ok(outcome) => outcome,
            Err(err) => return self.action_failed("sign up", err),
        };

        match outcome {
            SignUpOutcome::ConfirmationRequired { .. } => {
                ActionOutcome::ok_with(SIGN_UP_PENDING_MESSAGE)
            }
            SignUpOutcome::SignedIn(_) => match self.inner.gateway.me().await {
                Ok(identity) => {
                    self.apply(SessionInput::IdentityLoaded(identity));
                    ActionOutcome::ok()
                }
                Err(err) => self.action_failed("sign up", err),
            },
        }
    }

    /// Sends the user to the provider's consent page. The session arrives
    /// later through the auth-change stream.
    pub async fn sign_in_with_google(&self) -> ActionOutcome {
        self.apply(SessionInput::ActionStarted);
        match self
            .inner
            .gateway
            .oauth_authorize_url(OAuthProvider::Google, &self.inner.oauth_redirect_to)
        {
            Ok(url) => {
                info!(%url, "redirecting to google sign in");
                self.navigate(Navigation::External(url));
                ActionOutcome::ok()
            }
            Err(err) => self.action_failed("google sign in", err),
        }
    }

    /// Clears the user right away; the remote logout finishes in the
    /// background on the returned task. Must be called from within a Tokio
    /// runtime.
    pub fn logout(&self, should_redirect: bool) -> JoinHandle<()> {
        self.apply(SessionInput::LoggedOut {
            redirect: should_redirect,
        });
        info!(redirect = should_redirect, "logged out locally");

        let gateway = Arc::clone(&self.inner.gateway);
        let remote = tokio::spawn(async move {
            if let Err(err) = gateway.logout().await {
                warn!(%err, "remote logout failed");
            }
        });

        if should_redirect {
            self.navigate(Navigation::Reload);
        }
        remote
    }

    pub fn navigate_to_login(&self) {
        self.navigate(Navigation::Login);
    }

    pub async fn update_selected_year(&self, year: Year) -> Result<Identity, GatewayError> {
        let generation = self.current_generation();
        let update = ProfileUpdate {
            selected_year: Some(year),
            ..ProfileUpdate::default()
        };
        let identity = self.inner.gateway.update_me(&update).await?;
        self.apply_if_current(generation, SessionInput::ProfileUpdated(identity.clone()));
        Ok(identity)
    }

    async fn handle_change(&self, change: AuthChange) {
        debug!(seq = change.seq, event = ?change.event, "applying auth change");
        match change.event {
            AuthChangeEvent::SignedIn
            | AuthChangeEvent::TokenRefreshed
            | AuthChangeEvent::UserUpdated => {
                let generation = self.begin_resolution(None);
                let input = match self.inner.gateway.me().await {
                    Ok(identity) => SessionInput::IdentityLoaded(identity),
                    Err(err) => {
                        error!(%err, "failed to load user after auth change");
                        SessionInput::Failed(AuthError::new(
                            AuthErrorKind::Unknown,
                            error_message(&err),
                        ))
                    }
                };
                if !self.finish_resolution(generation, input) {
                    debug!(seq = change.seq, "auth change result superseded");
                }
            }
            AuthChangeEvent::SignedOut => {
                self.apply(SessionInput::SignedOut);
            }
        }
    }

    fn action_failed(&self, action: &str, err: GatewayError) -> ActionOutcome {
        warn!(%err, action, "auth action failed");
        let message = error_message(&err);
        self.apply(SessionInput::Failed(AuthError::new(
            AuthErrorKind::AuthFailed,
            message.clone(),
        )));
        ActionOutcome::failed(message)
    }

    fn navigate(&self, navigation: Navigation) {
        if self.inner.navigation.send(navigation).is_err() {
            debug!("no navigation observers");
        }
    }

    fn current_generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Supersedes every in-flight result and registers a new one. `input`
    /// is applied alongside, if given.
    fn begin_resolution(&self, input: Option<SessionInput>) -> u64 {
        let mut generation = 0;
        self.inner.state.send_if_modified(|state| {
            generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            self.inner.resolving.fetch_add(1, Ordering::SeqCst);
            match input {
                Some(input) => {
                    reduce(state, input);
                    true
                }
                None => false,
            }
        });
        generation
    }

    /// Applies `input` if nothing newer happened since `captured`, and
    /// settles the loading flags once no check or reload is outstanding.
    /// Returns whether `input` was applied.
    fn finish_resolution(&self, captured: u64, input: SessionInput) -> bool {
        let mut applied = false;
        self.inner.state.send_if_modified(|state| {
            let outstanding = self
                .inner
                .resolving
                .fetch_sub(1, Ordering::SeqCst)
                .saturating_sub(1);
            if self.inner.generation.load(Ordering::SeqCst) == captured {
                self.inner.generation.fetch_add(1, Ordering::SeqCst);
                reduce(state, input);
                applied = true;
            }
            let settle = outstanding == 0 && state.is_loading();
            if settle {
                reduce(state, SessionInput::CheckSettled);
            }
            applied || settle
        });
        applied
    }

    fn apply(&self, input: SessionInput) -> u64 {
        let mut generation = 0;
        self.inner.state.send_modify(|state| {
            generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            reduce(state, input);
        });
        generation
    }

    fn apply_if_current(&self, captured: u64, input: SessionInput) -> bool {
        self.inner.state.send_if_modified(|state| {
            if self.inner.generation.load(Ordering::SeqCst) != captured {
                return false;
            }
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            reduce(state, input);
            true
        })
    }
}

/// `None` for the expected signed-out case.
fn classify_check_failure(err: &GatewayError) -> Option<AuthError> {
    let kind = match err {
        GatewayError::NotAuthenticated => return None,
        GatewayError::AuthFailure { .. } => AuthErrorKind::AuthRequired,
        GatewayError::Remote { status: 403, .. } => AuthErrorKind::UserNotRegistered,
        _ => AuthErrorKind::Unknown,
    };
    Some(AuthError::new(kind, error_message(err)))
}

fn error_message(err: &GatewayError) -> String {
    match err {
        GatewayError::AuthFailure { reason } => reason.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
