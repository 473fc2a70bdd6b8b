use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration as StdDuration,
};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Identity, Role, UserId},
    error::{ApiError, AuthApiError},
    protocol::{
        AuthChange, AuthChangeEvent, AuthUser, PasswordGrant, ProfileRow, ProfileUpdate,
        ProfileUpsert, RefreshGrant, Session, SignUpRequest, SignUpResponse, TokenResponse,
        UserMetadata,
    },
};
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tracing::{error, info, warn};
use url::Url;

pub mod catalog;
mod entities;
pub mod error;
pub mod query;
pub mod store;
pub mod subscription;

pub use catalog::{Catalog, QuestionFilter};
pub use error::GatewayError;
pub use query::RowQuery;
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
pub use subscription::{on_auth_state_change, Subscription};

use shared::domain::{Question, StudyGuide};

/// Access tokens closer than this to expiry are refreshed before use.
const REFRESH_MARGIN_SECS: i64 = 60;
const AUTH_EVENT_CAPACITY: usize = 64;
const DEFAULT_FULL_NAME: &str = "User";
const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: Url,
    pub anon_key: String,
    pub request_timeout: StdDuration,
}

impl GatewayConfig {
    pub fn new(base_url: &str, anon_key: impl Into<String>) -> Result<Self, GatewayError> {
        let mut raw = base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base_url = Url::parse(&raw)
            .map_err(|err| GatewayError::InvalidUrl(format!("{raw}: {err}")))?;
        Ok(Self {
            base_url,
            anon_key: anon_key.into(),
            request_timeout: StdDuration::from_secs(15),
        })
    }

    pub fn with_request_timeout(mut self, request_timeout: StdDuration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthProvider {
    Google,
}

impl OAuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "google",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignUpOutcome {
    SignedIn(Session),
    /// The account exists but stays unusable until the email is verified.
    ConfirmationRequired {
        user_id: UserId,
        email: Option<String>,
    },
}

/// Auth surface of the remote service, as consumed by the session controller.
#[async_trait]
pub trait AuthGateway: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, GatewayError>;
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        full_name: &str,
    ) -> Result<SignUpOutcome, GatewayError>;
    fn oauth_authorize_url(
        &self,
        provider: OAuthProvider,
        redirect_to: &str,
    ) -> Result<Url, GatewayError>;
    async fn me(&self) -> Result<Identity, GatewayError>;
    async fn update_me(&self, update: &ProfileUpdate) -> Result<Identity, GatewayError>;
    async fn logout(&self) -> Result<(), GatewayError>;
    async fn log_user_in_app(&self) -> Result<(), GatewayError>;
    fn subscribe_auth_changes(&self) -> broadcast::Receiver<AuthChange>;
}

/// Identity from the auth record, overlaid with the profile row when present.
pub fn identity_from(user: &AuthUser, profile: Option<&ProfileRow>) -> Identity {
    let full_name = profile
        .and_then(|row| row.full_name.clone())
        .filter(|name| !name.trim().is_empty())
        .or_else(|| user.user_metadata.full_name.clone())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FULL_NAME.to_string());

    Identity {
        id: user.id,
        email: user.email.clone().unwrap_or_default(),
        full_name,
        selected_year: profile.and_then(|row| row.selected_year),
        role: Role::from_remote(profile.and_then(|row| row.role.as_deref())),
    }
}

pub struct SupabaseGateway {
    http: Client,
    config: GatewayConfig,
    store: Arc<dyn SessionStore>,
    session: Mutex<Option<Session>>,
    events: broadcast::Sender<AuthChange>,
    seq: AtomicU64,
    questions: Catalog<Question>,
    study_guides: Catalog<StudyGuide>,
}

impl SupabaseGateway {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn SessionStore>,
    ) -> Result<Arc<Self>, GatewayError> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let restored = match store.load() {
            Ok(session) => session,
            Err(err) => {
                warn!(%err, "ignoring unreadable persisted session");
                None
            }
        };
        if let Some(session) = &restored {
            info!(user_id = %session.user.id, "restored persisted session");
        }

        let (events, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        Ok(Arc::new(Self {
            http,
            config,
            store,
            session: Mutex::new(restored),
            events,
            seq: AtomicU64::new(0),
            questions: Catalog::new("questions"),
            study_guides: Catalog::new("study_guides"),
        }))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub async fn has_session(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Forces a refresh-token grant for the current session.
    pub async fn refresh_session(&self) -> Result<Session, GatewayError> {
        let mut guard = self.session.lock().await;
        let refresh_token = guard
            .as_ref()
            .map(|session| session.refresh_token.clone())
            .ok_or(GatewayError::NotAuthenticated)?;
        self.refresh_locked(&mut guard, &refresh_token).await
    }

    /// Completes an implicit-flow OAuth sign-in from the redirect URL the
    /// provider sent the browser back to.
    pub async fn set_session_from_redirect(&self, redirect: &Url) -> Result<Session, GatewayError> {
        let fragment = redirect
            .fragment()
            .ok_or_else(|| GatewayError::InvalidRedirect("missing url fragment".into()))?;
        let params: HashMap<String, String> = url::form_urlencoded::parse(fragment.as_bytes())
            .into_owned()
            .collect();

        if let Some(error) = params.get("error") {
            let reason = params
                .get("error_description")
                .cloned()
                .unwrap_or_else(|| error.clone());
            return Err(GatewayError::AuthFailure { reason });
        }

        let access_token = params
            .get("access_token")
            .cloned()
            .ok_or_else(|| GatewayError::InvalidRedirect("missing access_token".into()))?;
        let refresh_token = params
            .get("refresh_token")
            .cloned()
            .ok_or_else(|| GatewayError::InvalidRedirect("missing refresh_token".into()))?;
        let expires_in = params
            .get("expires_in")
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(3600);
        let expires_at = params
            .get("expires_at")
            .and_then(|raw| raw.parse::<i64>().ok());

        let user = match self.fetch_auth_user(&access_token).await? {
            Some(user) => user,
            None => {
                return Err(GatewayError::AuthFailure {
                    reason: "redirect carried an invalid access token".into(),
                })
            }
        };

        let session = TokenResponse {
            access_token,
            refresh_token,
            expires_in,
            expires_at,
            user,
        }
        .into_session(Utc::now());
        self.install_session(session.clone(), AuthChangeEvent::SignedIn)
            .await;
        Ok(session)
    }

    fn endpoint(&self, path: &str) -> Result<Url, GatewayError> {
        Ok(self.config.base_url.join(path)?)
    }

    fn authed(&self, builder: RequestBuilder, access_token: Option<&str>) -> RequestBuilder {
        let bearer = access_token.unwrap_or(&self.config.anon_key);
        builder
            .header("apikey", &self.config.anon_key)
            .bearer_auth(bearer)
    }

    fn emit(&self, event: AuthChangeEvent, session: Option<&Session>) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.events.send(AuthChange {
            seq,
            event,
            session: session.map(Session::snapshot),
        });
    }

    fn persist(&self, session: &Session) {
        if let Err(err) = self.store.save(session) {
            warn!(%err, "failed to persist session; continuing in memory");
        }
    }

    fn forget_persisted(&self) {
        if let Err(err) = self.store.clear() {
            warn!(%err, "failed to clear persisted session");
        }
    }

    async fn install_session(&self, session: Session, event: AuthChangeEvent) {
        let mut guard = self.session.lock().await;
        self.persist(&session);
        *guard = Some(session);
        self.emit(event, (*guard).as_ref());
    }

    /// Current session, refreshed first if the access token is about to lapse.
    async fn active_session(&self) -> Result<Session, GatewayError> {
        let mut guard = self.session.lock().await;
        let session = guard.clone().ok_or(GatewayError::NotAuthenticated)?;
        if !session.expires_within(Utc::now(), Duration::seconds(REFRESH_MARGIN_SECS)) {
            return Ok(session);
        }
        self.refresh_locked(&mut guard, &session.refresh_token)
            .await
    }

    async fn refresh_locked(
        &self,
        guard: &mut MutexGuard<'_, Option<Session>>,
        refresh_token: &str,
    ) -> Result<Session, GatewayError> {
        let res = self
            .authed(self.http.post(self.endpoint("auth/v1/token")?), None)
            .query(&[("grant_type", "refresh_token")])
            .json(&RefreshGrant { refresh_token })
            .send()
            .await?;

        match read_auth::<TokenResponse>(res).await {
            Ok(token) => {
                let fresh = token.into_session(Utc::now());
                self.persist(&fresh);
                **guard = Some(fresh.clone());
                self.emit(AuthChangeEvent::TokenRefreshed, Some(&fresh));
                info!(user_id = %fresh.user.id, "session refreshed");
                Ok(fresh)
            }
            Err(GatewayError::AuthFailure { reason }) => {
                warn!(%reason, "refresh token rejected; dropping session");
                **guard = None;
                self.forget_persisted();
                self.emit(AuthChangeEvent::SignedOut, None);
                Err(GatewayError::NotAuthenticated)
            }
            Err(err) => Err(err),
        }
    }

    /// `None` when the service no longer accepts `access_token`. A 403 means
    /// the token is valid but the account may not use the app, and surfaces
    /// as `Remote { status: 403 }`.
    async fn fetch_auth_user(&self, access_token: &str) -> Result<Option<AuthUser>, GatewayError> {
        let res = self
            .authed(
                self.http.get(self.endpoint("auth/v1/user")?),
                Some(access_token),
            )
            .send()
            .await?;
        match res.status() {
            StatusCode::UNAUTHORIZED => Ok(None),
            StatusCode::FORBIDDEN => {
                let body = res.text().await.unwrap_or_default();
                let message = serde_json::from_str::<AuthApiError>(&body)
                    .map(|err| err.reason())
                    .unwrap_or(body);
                warn!(%message, "auth service refused the account");
                Err(GatewayError::Remote {
                    status: StatusCode::FORBIDDEN.as_u16(),
                    message,
                    code: None,
                })
            }
            _ => read_auth(res).await.map(Some),
        }
    }

    async fn fetch_profile(
        &self,
        session: &Session,
        user_id: UserId,
    ) -> Result<Option<ProfileRow>, GatewayError> {
        let rows: Vec<ProfileRow> = self
            .select_rows(&RowQuery::table("profiles").eq("id", user_id), Some(session))
            .await?;
        Ok(rows.into_iter().next())
    }

    pub(crate) async fn select_rows<T: DeserializeOwned>(
        &self,
        query: &RowQuery,
        session: Option<&Session>,
    ) -> Result<Vec<T>, GatewayError> {
        let res = self
            .authed(
                self.http
                    .get(self.endpoint(&format!("rest/v1/{}", query.table_name()))?),
                session.map(|s| s.access_token.as_str()),
            )
            .query(&query.select_params())
            .send()
            .await?;
        Ok(check_rest(res).await?.json().await?)
    }

    pub(crate) async fn insert_row<T, B>(
        &self,
        table: &str,
        body: &B,
        session: &Session,
    ) -> Result<T, GatewayError>
    where
        T: DeserializeOwned,
        B: serde::Serialize + ?Sized,
    {
        let res = self
            .authed(
                self.http.post(self.endpoint(&format!("rest/v1/{table}"))?),
                Some(&session.access_token),
            )
            .header("Prefer", "return=representation")
            .header("Accept", SINGLE_OBJECT)
            .json(body)
            .send()
            .await?;
        Ok(check_rest(res).await?.json().await?)
    }

    /// Insert without reading the row back.
    pub(crate) async fn insert_minimal<B>(
        &self,
        table: &str,
        body: &B,
        session: &Session,
    ) -> Result<(), GatewayError>
    where
        B: serde::Serialize + ?Sized,
    {
        let res = self
            .authed(
                self.http.post(self.endpoint(&format!("rest/v1/{table}"))?),
                Some(&session.access_token),
            )
            .header("Prefer", "return=minimal")
            .json(body)
            .send()
            .await?;
        check_rest(res).await?;
        Ok(())
    }

    pub(crate) async fn upsert_row<T, B>(
        &self,
        table: &str,
        body: &B,
        session: &Session,
    ) -> Result<T, GatewayError>
    where
        T: DeserializeOwned,
        B: serde::Serialize + ?Sized,
    {
        let res = self
            .authed(
                self.http.post(self.endpoint(&format!("rest/v1/{table}"))?),
                Some(&session.access_token),
            )
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .header("Accept", SINGLE_OBJECT)
            .json(body)
            .send()
            .await?;
        Ok(check_rest(res).await?.json().await?)
    }

    pub(crate) async fn update_row<T, B>(
        &self,
        query: &RowQuery,
        body: &B,
        session: &Session,
    ) -> Result<T, GatewayError>
    where
        T: DeserializeOwned,
        B: serde::Serialize + ?Sized,
    {
        let res = self
            .authed(
                self.http
                    .patch(self.endpoint(&format!("rest/v1/{}", query.table_name()))?),
                Some(&session.access_token),
            )
            .query(&query.filter_params())
            .header("Prefer", "return=representation")
            .header("Accept", SINGLE_OBJECT)
            .json(body)
            .send()
            .await?;
        Ok(check_rest(res).await?.json().await?)
    }

    pub(crate) async fn delete_rows(
        &self,
        query: &RowQuery,
        session: &Session,
    ) -> Result<(), GatewayError> {
        if !query.has_filters() {
            return Err(GatewayError::UnscopedDelete {
                table: query.table_name().to_string(),
            });
        }
        let res = self
            .authed(
                self.http
                    .delete(self.endpoint(&format!("rest/v1/{}", query.table_name()))?),
                Some(&session.access_token),
            )
            .query(&query.filter_params())
            .send()
            .await?;
        check_rest(res).await?;
        Ok(())
    }
}

async fn read_auth<T: DeserializeOwned>(res: Response) -> Result<T, GatewayError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res.json().await?);
    }

    let body = res.text().await.unwrap_or_default();
    let reason = serde_json::from_str::<AuthApiError>(&body)
        .map(|err| err.reason())
        .unwrap_or(body);
    if status.is_client_error() {
        Err(GatewayError::AuthFailure { reason })
    } else {
        Err(GatewayError::Remote {
            status: status.as_u16(),
            message: reason,
            code: None,
        })
    }
}

async fn check_rest(res: Response) -> Result<Response, GatewayError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }

    let body = res.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(err) if err.is_no_rows() => Err(GatewayError::NotFound),
        _ if status == StatusCode::UNAUTHORIZED => Err(GatewayError::NotAuthenticated),
        Ok(err) => Err(GatewayError::Remote {
            status: status.as_u16(),
            message: err.message,
            code: err.code,
        }),
        Err(_) => Err(GatewayError::Remote {
            status: status.as_u16(),
            message: body,
            code: None,
        }),
    }
}

#[async_trait]
impl AuthGateway for SupabaseGateway {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, GatewayError> {
        let res = self
            .authed(self.http.post(self.endpoint("auth/v1/token")?), None)
            .query(&[("grant_type", "password")])
            .json(&PasswordGrant { email, password })
            .send()
            .await?;
        let session = read_auth::<TokenResponse>(res)
            .await
            .map_err(|err| {
                warn!(%email, %err, "sign in rejected");
                err
            })?
            .into_session(Utc::now());

        info!(user_id = %session.user.id, "signed in");
        self.install_session(session.clone(), AuthChangeEvent::SignedIn)
            .await;
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        full_name: &str,
    ) -> Result<SignUpOutcome, GatewayError> {
        let res = self
            .authed(self.http.post(self.endpoint("auth/v1/signup")?), None)
            .json(&SignUpRequest {
                email,
                password,
                data: UserMetadata {
                    full_name: Some(full_name.to_string()),
                },
            })
            .send()
            .await?;

        match read_auth::<SignUpResponse>(res).await? {
            SignUpResponse::Session(token) => {
                let session = token.into_session(Utc::now());
                info!(user_id = %session.user.id, "signed up with immediate session");
                self.install_session(session.clone(), AuthChangeEvent::SignedIn)
                    .await;
                Ok(SignUpOutcome::SignedIn(session))
            }
            SignUpResponse::Pending(user) => {
                info!(user_id = %user.id, "signed up; awaiting email confirmation");
                Ok(SignUpOutcome::ConfirmationRequired {
                    user_id: user.id,
                    email: user.email,
                })
            }
        }
    }

    fn oauth_authorize_url(
        &self,
        provider: OAuthProvider,
        redirect_to: &str,
    ) -> Result<Url, GatewayError> {
        let mut url = self.endpoint("auth/v1/authorize")?;
        url.query_pairs_mut()
            .append_pair("provider", provider.as_str())
            .append_pair("redirect_to", redirect_to);
        Ok(url)
    }

    async fn me(&self) -> Result<Identity, GatewayError> {
        let session = self.active_session().await?;
        let user = self
            .fetch_auth_user(&session.access_token)
            .await?
            .ok_or(GatewayError::NotAuthenticated)?;

        let profile = match self.fetch_profile(&session, user.id).await {
            Ok(profile) => profile,
            Err(err) => {
                error!(user_id = %user.id, %err, "profile lookup failed; using defaults");
                None
            }
        };
        Ok(identity_from(&user, profile.as_ref()))
    }

    async fn update_me(&self, update: &ProfileUpdate) -> Result<Identity, GatewayError> {
        let session = self.active_session().await?;
        let row: ProfileRow = self
            .upsert_row(
                "profiles",
                &ProfileUpsert {
                    id: session.user.id,
                    email: session.user.email.as_deref(),
                    update,
                    updated_at: Utc::now(),
                },
                &session,
            )
            .await
            .map_err(|err| {
                error!(user_id = %session.user.id, %err, "profile update failed");
                err
            })?;
        self.emit(AuthChangeEvent::UserUpdated, Some(&session));
        Ok(identity_from(&session.user, Some(&row)))
    }

    async fn logout(&self) -> Result<(), GatewayError> {
        let previous = {
            let mut guard = self.session.lock().await;
            let previous = guard.take();
            self.forget_persisted();
            self.emit(AuthChangeEvent::SignedOut, None);
            previous
        };

        let Some(session) = previous else {
            return Ok(());
        };
        let res = self
            .authed(
                self.http.post(self.endpoint("auth/v1/logout")?),
                Some(&session.access_token),
            )
            .send()
            .await
            .map_err(|err| {
                error!(%err, "remote logout failed");
                GatewayError::from(err)
            })?;
        let status = res.status();
        if status.is_success() || status == StatusCode::UNAUTHORIZED {
            return Ok(());
        }
        error!(status = status.as_u16(), "remote logout rejected");
        Err(GatewayError::Remote {
            status: status.as_u16(),
            message: res.text().await.unwrap_or_default(),
            code: None,
        })
    }

    async fn log_user_in_app(&self) -> Result<(), GatewayError> {
        let session = match self.active_session().await {
            Ok(session) => session,
            Err(GatewayError::NotAuthenticated) => return Ok(()),
            Err(err) => return Err(err),
        };
        self.record_activity(&session).await
    }

    fn subscribe_auth_changes(&self) -> broadcast::Receiver<AuthChange> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
