//! Exercises the client against an in-process mock control plane.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post, put};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Value, json};

use api_client::ApiClient;
use models::{SessionPatch, SessionState};

#[derive(Default)]
struct ControlPlane {
    login_count: AtomicUsize,
    token_lifetime: i64,
    locks: Mutex<HashMap<String, String>>,
    session_patches: Mutex<Vec<Value>>,
}

fn fake_token(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
    format!("{header}.{payload}.sig")
}

fn session_json(id: &str, state: &str) -> Value {
    json!({
        "id": id,
        "name": format!("pb-{id}"),
        "user_id": "u-1",
        "application_id": "a-1",
        "state": state,
        "provisioning_config": {
            "cluster": "local_kubernetes",
            "image": "jupyter/minimal-notebook",
            "memory_limit": "1Gi",
            "port": 8888,
            "volume_mount_path": "/home/jovyan/work"
        }
    })
}

async fn login(State(cp): State<Arc<ControlPlane>>) -> Json<Value> {
    cp.login_count.fetch_add(1, Ordering::SeqCst);
    let exp = chrono::Utc::now().timestamp() + cp.token_lifetime;
    Json(json!({"token": fake_token(exp)}))
}

async fn obtain_lock(
    State(cp): State<Arc<ControlPlane>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let owner = body["owner"].as_str().unwrap_or_default().to_string();
    let mut locks = cp.locks.lock().unwrap();
    if let Some(current) = locks.get(&id) {
        if *current != owner {
            return (StatusCode::CONFLICT, Json(json!({})));
        }
    }
    locks.insert(id.clone(), owner.clone());
    (StatusCode::OK, Json(json!({"id": id, "owner": owner})))
}

async fn release_lock(
    State(cp): State<Arc<ControlPlane>>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    let owner = params.get("owner").cloned().unwrap_or_default();
    let mut locks = cp.locks.lock().unwrap();
    match locks.get(&id) {
        Some(current) if *current == owner => {
            locks.remove(&id);
            StatusCode::OK
        }
        _ => StatusCode::NOT_FOUND,
    }
}

async fn list_sessions() -> Json<Value> {
    Json(json!([session_json("s-1", "queueing"), session_json("s-2", "running")]))
}

async fn get_session(Path(id): Path<String>) -> (StatusCode, Json<Value>) {
    if id == "s-gone" {
        (StatusCode::NOT_FOUND, Json(json!({})))
    } else {
        (StatusCode::OK, Json(session_json(&id, "queueing")))
    }
}

async fn patch_session(
    State(cp): State<Arc<ControlPlane>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, String) {
    if id == "s-invalid" {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            "maximum_lifetime out of range".to_string(),
        );
    }
    cp.session_patches.lock().unwrap().push(body);
    (StatusCode::OK, "{}".to_string())
}

async fn accept_log() -> Json<Value> {
    Json(json!({}))
}

async fn spawn_control_plane(cp: Arc<ControlPlane>) -> String {
    let api = Router::new()
        .route("/sessions", post(login))
        .route("/locks/{id}", put(obtain_lock).delete(release_lock))
        .route("/application_sessions", get(list_sessions))
        .route(
            "/application_sessions/{id}",
            get(get_session).patch(patch_session),
        )
        .route("/application_sessions/{id}/logs", patch(accept_log))
        .with_state(cp);
    let app = Router::new().nest("/api/v1", api);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/api/v1")
}

fn long_lived() -> Arc<ControlPlane> {
    Arc::new(ControlPlane {
        token_lifetime: 3600,
        ..Default::default()
    })
}

#[tokio::test]
async fn login_then_list_sessions() {
    let cp = long_lived();
    let base = spawn_control_plane(cp.clone()).await;
    let client = ApiClient::new(base, "worker@pb", "secret").unwrap();

    client.login().await.unwrap();
    let sessions = client.list_sessions(50).await.unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].id, "s-1");
    assert_eq!(sessions[0].state, SessionState::Queueing);
    assert_eq!(sessions[1].state, SessionState::Running);
}

#[tokio::test]
async fn calls_without_login_fail() {
    let cp = long_lived();
    let base = spawn_control_plane(cp).await;
    let client = ApiClient::new(base, "worker@pb", "secret").unwrap();
    assert!(client.list_sessions(50).await.is_err());
}

#[tokio::test]
async fn lock_protocol_round_trip() {
    let cp = long_lived();
    let base = spawn_control_plane(cp.clone()).await;
    let client = ApiClient::new(base, "worker@pb", "secret").unwrap();
    client.login().await.unwrap();

    assert!(client.obtain_lock("s-1", "worker-a").await.unwrap());
    // held by worker-a, so another owner loses the race
    assert!(!client.obtain_lock("s-1", "worker-b").await.unwrap());

    client.release_lock("s-1", "worker-a").await.unwrap();
    // releasing a lock that no longer exists is not an error
    client.release_lock("s-1", "worker-a").await.unwrap();

    assert!(client.obtain_lock("s-1", "worker-b").await.unwrap());
}

#[tokio::test]
async fn missing_session_reads_as_none() {
    let cp = long_lived();
    let base = spawn_control_plane(cp).await;
    let client = ApiClient::new(base, "worker@pb", "secret").unwrap();
    client.login().await.unwrap();

    assert!(client.get_session("s-gone").await.unwrap().is_none());
    assert!(client.get_session("s-1").await.unwrap().is_some());
}

#[tokio::test]
async fn session_patch_carries_only_set_fields() {
    let cp = long_lived();
    let base = spawn_control_plane(cp.clone()).await;
    let client = ApiClient::new(base, "worker@pb", "secret").unwrap();
    client.login().await.unwrap();

    client
        .patch_session("s-1", &SessionPatch::state(SessionState::Provisioning))
        .await
        .unwrap();

    let patches = cp.session_patches.lock().unwrap();
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0], json!({"state": "provisioning"}));
}

#[tokio::test]
async fn error_responses_carry_the_server_message() {
    let cp = long_lived();
    let base = spawn_control_plane(cp).await;
    let client = ApiClient::new(base, "worker@pb", "secret").unwrap();
    client.login().await.unwrap();

    let err = client
        .patch_session("s-invalid", &SessionPatch::state(SessionState::Failed))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "patch session failed with status 422 Unprocessable Entity: maximum_lifetime out of range"
    );
}

#[tokio::test]
async fn ensure_session_refreshes_an_expiring_token() {
    let cp = Arc::new(ControlPlane {
        // below the 900 s refresh margin
        token_lifetime: 120,
        ..Default::default()
    });
    let base = spawn_control_plane(cp.clone()).await;
    let client = ApiClient::new(base, "worker@pb", "secret").unwrap();

    client.ensure_session().await.unwrap();
    assert_eq!(cp.login_count.load(Ordering::SeqCst), 1);

    // the short-lived token is already within the margin
    client.ensure_session().await.unwrap();
    assert_eq!(cp.login_count.load(Ordering::SeqCst), 2);
}
