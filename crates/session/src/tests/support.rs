use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use gateway::{AuthGateway, GatewayError, OAuthProvider, SignUpOutcome};
use shared::{
    domain::{Identity, Role, UserId},
    protocol::{AuthChange, AuthChangeEvent, AuthUser, ProfileUpdate, Session, UserMetadata},
};
use tokio::sync::{broadcast, oneshot};
use url::Url;

pub const GOOD_PASSWORD: &str = "correct-horse";

pub fn alice() -> Identity {
    Identity {
        id: UserId(uuid::Uuid::from_u128(0xa11ce)),
        email: "alice@example.com".into(),
        full_name: "Alice Fitter".into(),
        selected_year: None,
        role: Role::User,
    }
}

fn alice_session() -> Session {
    let identity = alice();
    Session {
        access_token: "access".into(),
        refresh_token: "refresh".into(),
        expires_at: Utc::now() + chrono::Duration::hours(1),
        user: AuthUser {
            id: identity.id,
            email: Some(identity.email),
            user_metadata: UserMetadata {
                full_name: Some(identity.full_name),
            },
        },
    }
}

#[derive(Debug, Clone)]
pub enum MeReply {
    User(Identity),
    NotAuthenticated,
    Rejected(String),
    Remote(u16),
}

impl MeReply {
    fn into_result(self) -> Result<Identity, GatewayError> {
        match self {
            MeReply::User(identity) => Ok(identity),
            MeReply::NotAuthenticated => Err(GatewayError::NotAuthenticated),
            MeReply::Rejected(reason) => Err(GatewayError::AuthFailure { reason }),
            MeReply::Remote(status) => Err(GatewayError::Remote {
                status,
                message: "backend said no".into(),
                code: None,
            }),
        }
    }
}

/// Scriptable stand-in for the remote service.
pub struct FakeGateway {
    events: broadcast::Sender<AuthChange>,
    seq: AtomicU64,
    scripted: Mutex<VecDeque<(Option<oneshot::Receiver<()>>, MeReply)>>,
    fallback: Mutex<MeReply>,
    pub me_calls: AtomicUsize,
    pub subscriptions: AtomicUsize,
    pub logout_calls: AtomicUsize,
    pub logout_fails: AtomicBool,
    pub activity_logs: AtomicUsize,
    pub profile_updates: Mutex<Vec<ProfileUpdate>>,
}

impl FakeGateway {
    pub fn new(fallback: MeReply) -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            events,
            seq: AtomicU64::new(0),
            scripted: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            me_calls: AtomicUsize::new(0),
            subscriptions: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            logout_fails: AtomicBool::new(false),
            activity_logs: AtomicUsize::new(0),
            profile_updates: Mutex::new(Vec::new()),
        })
    }

    pub fn set_fallback(&self, reply: MeReply) {
        *self.fallback.lock().expect("fallback lock") = reply;
    }

    /// Queues a `me` reply that is held back until the returned sender fires.
    pub fn hold_next_me(&self, reply: MeReply) -> oneshot::Sender<()> {
        let (release, held) = oneshot::channel();
        self.scripted
            .lock()
            .expect("script lock")
            .push_back((Some(held), reply));
        release
    }

    pub fn emit(&self, event: AuthChangeEvent) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let session = match event {
            AuthChangeEvent::SignedOut => None,
            _ => Some(alice_session().snapshot()),
        };
        let _ = self.events.send(AuthChange {
            seq,
            event,
            session,
        });
    }
}

#[async_trait]
impl AuthGateway for FakeGateway {
    async fn sign_in(&self, _email: &str, password: &str) -> Result<Session, GatewayError> {
        if password != GOOD_PASSWORD {
            return Err(GatewayError::AuthFailure {
                reason: "Invalid login credentials".into(),
            });
        }
        self.set_fallback(MeReply::User(alice()));
        self.emit(AuthChangeEvent::SignedIn);
        Ok(alice_session())
    }

    async fn sign_up(
        &self,
        email: &str,
        _password: &str,
        _full_name: &str,
    ) -> Result<SignUpOutcome, GatewayError> {
        if email.starts_with("taken") {
            return Err(GatewayError::AuthFailure {
                reason: "User already registered".into(),
            });
        }
        if email.starts_with("pending") {
            return Ok(SignUpOutcome::ConfirmationRequired {
                user_id: UserId(uuid::Uuid::from_u128(0xbeef)),
                email: Some(email.to_string()),
            });
        }
        self.set_fallback(MeReply::User(alice()));
        self.emit(AuthChangeEvent::SignedIn);
        Ok(SignUpOutcome::SignedIn(alice_session()))
    }

    fn oauth_authorize_url(
        &self,
        provider: OAuthProvider,
        redirect_to: &str,
    ) -> Result<Url, GatewayError> {
        let mut url = Url::parse("https://backend.test/auth/v1/authorize")?;
        url.query_pairs_mut()
            .append_pair("provider", provider.as_str())
            .append_pair("redirect_to", redirect_to);
        Ok(url)
    }

    async fn me(&self) -> Result<Identity, GatewayError> {
        self.me_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.scripted.lock().expect("script lock").pop_front();
        let reply = match next {
            Some((held, reply)) => {
                if let Some(held) = held {
                    let _ = held.await;
                }
                reply
            }
            None => self.fallback.lock().expect("fallback lock").clone(),
        };
        reply.into_result()
    }

    async fn update_me(&self, update: &ProfileUpdate) -> Result<Identity, GatewayError> {
        self.profile_updates
            .lock()
            .expect("updates lock")
            .push(update.clone());
        let mut identity = alice();
        identity.selected_year = update.selected_year;
        self.set_fallback(MeReply::User(identity.clone()));
        Ok(identity)
    }

    async fn logout(&self) -> Result<(), GatewayError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        self.set_fallback(MeReply::NotAuthenticated);
        self.emit(AuthChangeEvent::SignedOut);
        if self.logout_fails.load(Ordering::SeqCst) {
            return Err(GatewayError::Transient("connection reset".into()));
        }
        Ok(())
    }

    async fn log_user_in_app(&self) -> Result<(), GatewayError> {
        self.activity_logs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe_auth_changes(&self) -> broadcast::Receiver<AuthChange> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        self.events.subscribe()
    }
}

/// Polls `check` until it holds, failing the test after two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "condition not reached in time");
}
