//! `FirebaseAuthSource` and `CallableEndpoint` against a local axum server
//! that speaks the identity service and callable function formats.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};

use geotrack_core::{Credential, DeliveryState, LocationSample};
use geotrack_sync::{
    AuthError, CallableEndpoint, CredentialSource, DeliveryEndpoint, FirebaseAuthSource,
    OutcomeStatus, TrackerConfig, TransportError,
};

#[derive(Default)]
struct Recorded {
    paths: Vec<String>,
    authorization: Option<String>,
    bodies: Vec<String>,
}

#[derive(Clone)]
struct FakeBackend {
    /// Fixed answer for every request.
    reply: Arc<(StatusCode, Value)>,
    recorded: Arc<Mutex<Recorded>>,
}

async fn handle(
    State(backend): State<FakeBackend>,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    {
        let mut recorded = backend.recorded.lock().unwrap();
        recorded.paths.push(
            uri.path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_default(),
        );
        recorded.authorization = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        recorded.bodies.push(body);
    }
    let (status, value) = backend.reply.as_ref().clone();
    (status, Json(value)).into_response()
}

async fn serve(status: StatusCode, reply: Value) -> (SocketAddr, Arc<Mutex<Recorded>>) {
    let recorded = Arc::new(Mutex::new(Recorded::default()));
    let app = Router::new().fallback(handle).with_state(FakeBackend {
        reply: Arc::new((status, reply)),
        recorded: recorded.clone(),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, recorded)
}

fn config_for(addr: SocketAddr) -> TrackerConfig {
    let base = format!("http://{addr}");
    let mut config = TrackerConfig::default();
    config.device.id = "device-1".into();
    config.device.label = "pixel-7".into();
    config.auth.api_key = Some("test-key".into());
    config.auth.identity_url = base.clone();
    config.auth.secure_token_url = base.clone();
    config.backend.functions_url = base;
    config
}

fn auth_source(config: &TrackerConfig) -> FirebaseAuthSource {
    FirebaseAuthSource::new(&config.auth, config.sync.request_timeout()).unwrap()
}

fn sample(id: i64) -> LocationSample {
    let now = Utc::now();
    LocationSample {
        id,
        captured_at: now,
        latitude: 48.85,
        longitude: 2.35,
        accuracy_m: 10.0,
        provider: Some("gps".into()),
        speed_mps: None,
        altitude_m: None,
        bearing_deg: None,
        delivery_state: DeliveryState::InFlight,
        attempts: 0,
        failure_reason: None,
        last_error: None,
        created_at: now,
        updated_at: now,
        delivered_at: None,
    }
}

fn credential() -> Credential {
    Credential::new("id-token", Utc::now() + chrono::Duration::hours(1), "uid-1")
}

// =============================================================================
// Identity Service
// =============================================================================

#[tokio::test]
async fn test_anonymous_sign_in() {
    let (addr, recorded) = serve(
        StatusCode::OK,
        json!({
            "idToken": "id-1",
            "refreshToken": "rt-1",
            "expiresIn": "3600",
            "localId": "uid-1"
        }),
    )
    .await;

    let issued = auth_source(&config_for(addr)).sign_in().await.unwrap();
    assert_eq!(issued.credential.token, "id-1");
    assert_eq!(issued.credential.subject, "uid-1");
    assert_eq!(issued.refresh_token.as_deref(), Some("rt-1"));
    assert!(issued.credential.expires_at > Utc::now() + chrono::Duration::minutes(59));

    let recorded = recorded.lock().unwrap();
    assert_eq!(recorded.paths[0], "/v1/accounts:signUp?key=test-key");
    let body: Value = serde_json::from_str(&recorded.bodies[0]).unwrap();
    assert_eq!(body["returnSecureToken"], true);
}

#[tokio::test]
async fn test_refresh_token_exchange() {
    let (addr, recorded) = serve(
        StatusCode::OK,
        json!({
            "id_token": "id-2",
            "refresh_token": "rt-2",
            "expires_in": "3600",
            "user_id": "uid-1"
        }),
    )
    .await;

    let issued = auth_source(&config_for(addr)).refresh("rt-1").await.unwrap();
    assert_eq!(issued.credential.token, "id-2");
    assert_eq!(issued.refresh_token.as_deref(), Some("rt-2"));

    let recorded = recorded.lock().unwrap();
    assert_eq!(recorded.paths[0], "/v1/token?key=test-key");
    assert!(recorded.bodies[0].contains("grant_type=refresh_token"));
    assert!(recorded.bodies[0].contains("refresh_token=rt-1"));
}

#[tokio::test]
async fn test_disabled_account_is_revoked() {
    let (addr, _) = serve(
        StatusCode::BAD_REQUEST,
        json!({ "error": { "code": 400, "message": "USER_DISABLED" } }),
    )
    .await;

    let err = auth_source(&config_for(addr)).refresh("rt-1").await.unwrap_err();
    assert_eq!(err, AuthError::Revoked("USER_DISABLED".into()));
}

#[tokio::test]
async fn test_dead_refresh_token_is_session_expired() {
    let (addr, _) = serve(
        StatusCode::BAD_REQUEST,
        json!({ "error": { "code": 400, "message": "INVALID_REFRESH_TOKEN" } }),
    )
    .await;

    let err = auth_source(&config_for(addr)).refresh("rt-1").await.unwrap_err();
    assert!(matches!(err, AuthError::SessionExpired(_)));
}

#[tokio::test]
async fn test_identity_outage_is_unavailable() {
    let (addr, _) = serve(StatusCode::SERVICE_UNAVAILABLE, json!({})).await;

    let err = auth_source(&config_for(addr)).sign_in().await.unwrap_err();
    assert!(matches!(err, AuthError::Unavailable(_)));
    assert!(err.is_retryable());
}

// =============================================================================
// Callable Function
// =============================================================================

#[tokio::test]
async fn test_submit_batch() {
    let (addr, recorded) = serve(
        StatusCode::OK,
        json!({ "result": { "results": [
            { "id": 1, "status": "accepted" },
            { "id": 2, "status": "rejected", "reason": "latitude out of range" }
        ] } }),
    )
    .await;

    let endpoint = CallableEndpoint::new(&config_for(addr)).unwrap();
    let outcomes = endpoint
        .submit(&[sample(1), sample(2)], &credential())
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].status, OutcomeStatus::Accepted);
    assert_eq!(outcomes[1].status, OutcomeStatus::Rejected);

    let recorded = recorded.lock().unwrap();
    assert_eq!(recorded.paths[0], "/onCallCreateOne");
    assert_eq!(recorded.authorization.as_deref(), Some("Bearer id-token"));

    let body: Value = serde_json::from_str(&recorded.bodies[0]).unwrap();
    assert_eq!(body["data"]["deviceId"], "device-1");
    assert_eq!(body["data"]["collection"], "locations");
    let ids: Vec<i64> = body["data"]["documents"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2]);
}

#[tokio::test]
async fn test_unauthorized_status() {
    let (addr, _) = serve(StatusCode::UNAUTHORIZED, json!({})).await;

    let endpoint = CallableEndpoint::new(&config_for(addr)).unwrap();
    let err = endpoint.submit(&[sample(1)], &credential()).await.unwrap_err();
    assert!(err.is_auth_failure());
}

#[tokio::test]
async fn test_unauthenticated_error_body() {
    let (addr, _) = serve(
        StatusCode::OK,
        json!({ "error": { "status": "UNAUTHENTICATED", "message": "token expired" } }),
    )
    .await;

    let endpoint = CallableEndpoint::new(&config_for(addr)).unwrap();
    let err = endpoint.submit(&[sample(1)], &credential()).await.unwrap_err();
    assert_eq!(err, TransportError::Unauthorized("token expired".into()));
}

#[tokio::test]
async fn test_server_error() {
    let (addr, _) = serve(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "error": { "status": "INTERNAL", "message": "boom" } }),
    )
    .await;

    let endpoint = CallableEndpoint::new(&config_for(addr)).unwrap();
    let err = endpoint.submit(&[sample(1)], &credential()).await.unwrap_err();
    assert_eq!(
        err,
        TransportError::Server {
            status: 500,
            message: "INTERNAL: boom".into()
        }
    );
}

#[tokio::test]
async fn test_response_without_result() {
    let (addr, _) = serve(StatusCode::OK, json!({ "unexpected": true })).await;

    let endpoint = CallableEndpoint::new(&config_for(addr)).unwrap();
    let err = endpoint.submit(&[sample(1)], &credential()).await.unwrap_err();
    assert!(matches!(err, TransportError::InvalidResponse(_)));
}
