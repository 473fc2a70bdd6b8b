use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use gateway::{FileSessionStore, GatewayConfig, SessionStore, SupabaseGateway};
use serde_json::{json, Value};
use session::{decide, RouteDecision, SessionController, SessionPhase, SessionState};
use shared::{
    domain::UserId,
    protocol::{AuthUser, Session, UserMetadata},
};
use tokio::net::TcpListener;

const USER_ID: &str = "3d6f0a52-8c1e-4b7a-9f2d-5e4c3b2a1908";

#[derive(Default)]
struct Backend {
    tokens: Vec<String>,
    refreshes: usize,
    activity: Vec<Value>,
    remote_logouts: usize,
}

type SharedBackend = Arc<Mutex<Backend>>;

fn auth_user() -> Value {
    json!({
        "id": USER_ID,
        "email": "sam@example.com",
        "user_metadata": { "full_name": "Sam Steamfitter" }
    })
}

async fn token(
    State(state): State<SharedBackend>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let refreshing = query.get("grant_type").map(String::as_str) == Some("refresh_token");
    let accepted = if refreshing {
        body["refresh_token"] == "refresh"
    } else {
        body["password"] == "hunter22"
    };
    if !accepted {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_grant", "error_description": "Invalid login credentials" })),
        );
    }
    let mut backend = state.lock().expect("backend lock");
    if refreshing {
        backend.refreshes += 1;
    }
    let access = format!("token-{}", backend.tokens.len() + 1);
    backend.tokens.push(access.clone());
    (
        StatusCode::OK,
        Json(json!({
            "access_token": access,
            "refresh_token": "refresh",
            "expires_in": 3600,
            "user": auth_user()
        })),
    )
}

async fn user(State(state): State<SharedBackend>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    let bearer = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string();
    if state.lock().expect("backend lock").tokens.contains(&bearer) {
        (StatusCode::OK, Json(auth_user()))
    } else if bearer.starts_with("blocked-") {
        (StatusCode::FORBIDDEN, Json(json!({ "msg": "User not allowed" })))
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({ "msg": "invalid JWT" })))
    }
}

async fn profiles(Query(query): Query<HashMap<String, String>>) -> Json<Value> {
    if query.get("id") == Some(&format!("eq.{USER_ID}")) {
        Json(json!([{ "id": USER_ID, "selected_year": 4, "role": "admin" }]))
    } else {
        Json(json!([]))
    }
}

async fn logout(State(state): State<SharedBackend>) -> StatusCode {
    state.lock().expect("backend lock").remote_logouts += 1;
    StatusCode::NO_CONTENT
}

async fn activity(State(state): State<SharedBackend>, Json(body): Json<Value>) -> StatusCode {
    state.lock().expect("backend lock").activity.push(body);
    StatusCode::CREATED
}

async fn spawn_backend() -> (String, SharedBackend) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = SharedBackend::default();
    let app = Router::new()
        .route("/auth/v1/token", post(token))
        .route("/auth/v1/user", get(user))
        .route("/auth/v1/logout", post(logout))
        .route("/rest/v1/profiles", get(profiles))
        .route("/rest/v1/user_activity_logs", post(activity))
        .with_state(Arc::clone(&state));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

fn seed_session(path: &std::path::Path, access_token: &str, expires_in_secs: i64) {
    FileSessionStore::new(path)
        .save(&Session {
            access_token: access_token.into(),
            refresh_token: "refresh".into(),
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in_secs),
            user: AuthUser {
                id: UserId(USER_ID.parse().expect("uuid")),
                email: Some("sam@example.com".into()),
                user_metadata: UserMetadata {
                    full_name: Some("Sam Steamfitter".into()),
                },
            },
        })
        .expect("seed session");
}

async fn launch(url: &str, session_file: &std::path::Path) -> SessionController {
    let config = GatewayConfig::new(url, "anon").expect("config");
    let gateway = SupabaseGateway::new(config, Arc::new(FileSessionStore::new(session_file)))
        .expect("gateway");
    let controller = SessionController::new(gateway, "http://localhost:5173/dashboard");
    controller.start().await;
    controller.settled().await;
    controller
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn sign_in_survives_restart_and_logout_ends_it() {
    let (url, backend) = spawn_backend().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let session_file = dir.path().join("session.json");

    let first = launch(&url, &session_file).await;
    assert_eq!(first.snapshot().phase(), SessionPhase::Unauthenticated);
    assert_eq!(decide(&first.snapshot()), RouteDecision::RedirectToLogin);

    let outcome = first.sign_in("sam@example.com", "wrong").await;
    assert!(!outcome.success);
    assert_eq!(outcome.message.as_deref(), Some("Invalid login credentials"));

    assert!(first.sign_in("sam@example.com", "hunter22").await.success);
    let user = first.snapshot().user.expect("signed-in user");
    assert_eq!(user.full_name, "Sam Steamfitter");
    assert_eq!(user.selected_year, Some(4));
    assert_eq!(decide(&first.snapshot()), RouteDecision::Render);
    first.shutdown();
    drop(first);

    let second = launch(&url, &session_file).await;
    assert_eq!(second.snapshot().phase(), SessionPhase::Authenticated);
    wait_for(|| backend.lock().expect("backend lock").activity.len() == 1).await;

    second.logout(true).await.expect("logout task");
    assert_eq!(second.snapshot(), SessionState::default());
    assert_eq!(backend.lock().expect("backend lock").remote_logouts, 1);
    assert!(!session_file.exists());

    let third = launch(&url, &session_file).await;
    assert_eq!(third.snapshot().phase(), SessionPhase::Unauthenticated);
    assert_eq!(third.snapshot().auth_error, None);
}

#[tokio::test]
async fn session_refreshed_during_startup_still_renders() {
    let (url, backend) = spawn_backend().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let session_file = dir.path().join("session.json");
    seed_session(&session_file, "expiring", 10);

    let controller = launch(&url, &session_file).await;
    let state = controller.snapshot();
    assert_eq!(state.phase(), SessionPhase::Authenticated);
    assert_eq!(decide(&state), RouteDecision::Render);
    assert_eq!(backend.lock().expect("backend lock").refreshes, 1);
}

#[tokio::test]
async fn refused_account_lands_on_the_not_registered_view() {
    let (url, _backend) = spawn_backend().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let session_file = dir.path().join("session.json");
    seed_session(&session_file, "blocked-1", 3600);

    let controller = launch(&url, &session_file).await;
    let state = controller.snapshot();
    assert_eq!(
        state.phase(),
        SessionPhase::Error(session::AuthErrorKind::UserNotRegistered)
    );
    assert_eq!(decide(&state), RouteDecision::NotRegistered);
    assert!(!controller.is_authenticated());
}
