//! HTTP surface: shared state, request/response schemas, handlers, router.
//!
//! Everything except the token endpoint requires a bearer token; a request
//! naming a `user_id` other than the token subject is rejected before any
//! side effect. Group elements travel as lowercase hex strings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::Utc;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::auth::{self, CurrentUser, TokenService};
use crate::error::ApiError;
use crate::geo::validate_coordinates;
use crate::psi::group;
use crate::psi::session::{SessionManager, SessionStatus, SessionValues};
use crate::store::{GeoStore, NearbyUser, UserStore};

pub const DEFAULT_MAX_DISTANCE_KM: f64 = 6.0;

#[derive(Clone)]
pub struct AppState {
    pub users: Arc<dyn UserStore>,
    pub geo: Arc<dyn GeoStore>,
    pub tokens: Arc<TokenService>,
    pub sessions: Arc<SessionManager>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        users: Arc<dyn UserStore>,
        geo: Arc<dyn GeoStore>,
        tokens: TokenService,
    ) -> Self {
        Self {
            users,
            geo,
            tokens: Arc::new(tokens),
            sessions: Arc::new(SessionManager::new()),
            metrics: Arc::new(Metrics::default()),
        }
    }
}

/// Request counters, exported as a JSON snapshot on /metrics.
#[derive(Default)]
pub struct Metrics {
    pub logins: AtomicU64,
    pub login_rejected: AtomicU64,
    pub auth_rejected: AtomicU64,
    pub location_updates: AtomicU64,
    pub nearby_queries: AtomicU64,
    pub psi_initiated: AtomicU64,
    pub psi_joined: AtomicU64,
    pub psi_completed: AtomicU64,
    pub sessions_swept: AtomicU64,
}

fn ensure_same_user(current_user: &CurrentUser, named: &str) -> Result<(), ApiError> {
    if current_user.user_id != named {
        return Err(ApiError::Forbidden(format!(
            "token subject does not match user_id '{named}'"
        )));
    }
    Ok(())
}

fn decode_elements(values: &[String]) -> Result<Vec<BigUint>, ApiError> {
    values
        .iter()
        .map(|s| {
            group::decode_element(s)
                .ok_or_else(|| ApiError::Validation(format!("'{s}' is not a hex group element")))
        })
        .collect()
}

fn encode_elements(values: &[BigUint]) -> Vec<String> {
    values.iter().map(group::encode_element).collect()
}

/// The original deployment keyed sessions by UUID string; anything that does
/// not parse is simply an unknown session.
fn parse_session_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound("Session not found".to_string()))
}

// ---------------------------------------------------------------------------
// Locations
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LocationUpdate {
    pub user_id: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Serialize)]
struct LocationAck {
    status: &'static str,
    latitude: f64,
    longitude: f64,
}

#[instrument(skip_all, fields(uid = %current_user.user_id))]
async fn update_location(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(body): Json<LocationUpdate>,
) -> Result<Json<LocationAck>, ApiError> {
    ensure_same_user(&current_user, &body.user_id)?;
    validate_coordinates(body.latitude, body.longitude)?;

    state
        .geo
        .upsert_point(&body.user_id, body.latitude, body.longitude, Utc::now())?;
    state.metrics.location_updates.fetch_add(1, Ordering::Relaxed);
    info!(lat = body.latitude, lon = body.longitude, "location_updated");
    Ok(Json(LocationAck {
        status: "success",
        latitude: body.latitude,
        longitude: body.longitude,
    }))
}

fn default_max_distance() -> f64 {
    DEFAULT_MAX_DISTANCE_KM
}

#[derive(Deserialize)]
pub struct NearbyParams {
    pub user_id: String,
    #[serde(default = "default_max_distance")]
    pub max_distance: f64,
}

#[instrument(skip_all, fields(uid = %current_user.user_id))]
async fn nearby_users(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Query(params): Query<NearbyParams>,
) -> Result<Json<Vec<NearbyUser>>, ApiError> {
    ensure_same_user(&current_user, &params.user_id)?;
    if !params.max_distance.is_finite() || params.max_distance < 0.0 {
        return Err(ApiError::Validation(format!(
            "max_distance {} out of range",
            params.max_distance
        )));
    }

    let hits = state
        .geo
        .query_nearby(&params.user_id, params.max_distance)?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
    state.metrics.nearby_queries.fetch_add(1, Ordering::Relaxed);
    info!(hits = hits.len(), max_km = params.max_distance, "nearby_query");

    let rounded = hits
        .into_iter()
        .map(|mut h| {
            h.distance_km = (h.distance_km * 100.0).round() / 100.0;
            h
        })
        .collect();
    Ok(Json(rounded))
}

// ---------------------------------------------------------------------------
// PSI
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct InitiateRequest {
    pub blinded_values: Vec<String>,
    pub user_id: String,
}

#[derive(Serialize)]
struct InitiateResponse {
    session_id: Uuid,
}

#[derive(Deserialize)]
pub struct JoinRequest {
    /// Optional echo of the path id; must match when present.
    #[serde(default)]
    pub session_id: Option<Uuid>,
    pub response_values: Vec<String>,
    pub user_id: String,
}

#[derive(Serialize)]
struct JoinResponse {
    status: SessionStatus,
    session_id: Uuid,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ValuesBody {
    List(Vec<String>),
    Map(HashMap<String, Vec<String>>),
}

#[derive(Serialize)]
struct SessionValuesResponse {
    status: SessionStatus,
    values: ValuesBody,
}

#[derive(Deserialize)]
pub struct IntersectionUpdateRequest {
    pub user_id: String,
    pub other_user_id: String,
    pub len_intersection: i64,
}

#[derive(Serialize)]
struct IntersectionResponse {
    intersection_len: i64,
}

#[instrument(skip_all, fields(uid = %current_user.user_id))]
async fn psi_init(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(body): Json<InitiateRequest>,
) -> Result<(StatusCode, Json<InitiateResponse>), ApiError> {
    ensure_same_user(&current_user, &body.user_id)?;
    let values = decode_elements(&body.blinded_values)?;
    let session_id = state.sessions.initiate(&current_user.user_id, values)?;
    state.metrics.psi_initiated.fetch_add(1, Ordering::Relaxed);
    info!(sid = %session_id, items = body.blinded_values.len(), "psi_initiated");
    Ok((StatusCode::CREATED, Json(InitiateResponse { session_id })))
}

#[instrument(skip_all, fields(uid = %current_user.user_id, sid = %session_id))]
async fn psi_join(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Path(session_id): Path<String>,
    Json(body): Json<JoinRequest>,
) -> Result<Json<JoinResponse>, ApiError> {
    ensure_same_user(&current_user, &body.user_id)?;
    let session_id = parse_session_id(&session_id)?;
    if body.session_id.is_some_and(|echoed| echoed != session_id) {
        return Err(ApiError::Validation(
            "session_id in body does not match path".to_string(),
        ));
    }

    let values = decode_elements(&body.response_values)?;
    let status = state.sessions.join(session_id, &current_user.user_id, values)?;
    state.metrics.psi_joined.fetch_add(1, Ordering::Relaxed);
    info!(elements = body.response_values.len(), "psi_joined");
    Ok(Json(JoinResponse { status, session_id }))
}

#[instrument(skip_all, fields(uid = %current_user.user_id, sid = %session_id))]
async fn psi_get_values(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Path(session_id): Path<String>,
) -> Result<Json<SessionValuesResponse>, ApiError> {
    let session_id = parse_session_id(&session_id)?;
    let (status, values) = state.sessions.values(session_id, &current_user.user_id)?;
    let values = match values {
        SessionValues::Initiator(list) => ValuesBody::List(encode_elements(&list)),
        SessionValues::Responses(map) => ValuesBody::Map(
            map.into_iter()
                .map(|(user, list)| (user, encode_elements(&list)))
                .collect(),
        ),
    };
    Ok(Json(SessionValuesResponse { status, values }))
}

#[instrument(skip_all, fields(uid = %current_user.user_id, sid = %session_id))]
async fn psi_update_intersection(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Path(session_id): Path<String>,
    Json(body): Json<IntersectionUpdateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    ensure_same_user(&current_user, &body.user_id)?;
    let session_id = parse_session_id(&session_id)?;
    if body.len_intersection < 0 {
        return Err(ApiError::Validation(
            "len_intersection must be non-negative".to_string(),
        ));
    }

    state.sessions.record_intersection(
        session_id,
        &current_user.user_id,
        &body.other_user_id,
        body.len_intersection as u64,
    )?;
    state.metrics.psi_completed.fetch_add(1, Ordering::Relaxed);
    info!(other = %body.other_user_id, n = body.len_intersection, "psi_completed");
    Ok(Json(json!({
        "status": format!("Intersection updated to {}", body.len_intersection)
    })))
}

#[instrument(skip_all, fields(uid = %current_user.user_id, sid = %session_id))]
async fn psi_get_intersection(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Path(session_id): Path<String>,
) -> Result<Json<IntersectionResponse>, ApiError> {
    let session_id = parse_session_id(&session_id)?;
    let intersection_len = state
        .sessions
        .intersection_for(session_id, &current_user.user_id)?;
    Ok(Json(IntersectionResponse { intersection_len }))
}

// ---------------------------------------------------------------------------
// Operational endpoints
// ---------------------------------------------------------------------------

async fn health() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
struct MetricsResponse {
    logins: u64,
    login_rejected: u64,
    auth_rejected: u64,
    location_updates: u64,
    nearby_queries: u64,
    psi_initiated: u64,
    psi_joined: u64,
    psi_completed: u64,
    sessions_swept: u64,
    sessions_live: usize,
}

async fn metrics_snapshot(State(state): State<AppState>) -> Json<MetricsResponse> {
    let m = &state.metrics;
    Json(MetricsResponse {
        logins: m.logins.load(Ordering::Relaxed),
        login_rejected: m.login_rejected.load(Ordering::Relaxed),
        auth_rejected: m.auth_rejected.load(Ordering::Relaxed),
        location_updates: m.location_updates.load(Ordering::Relaxed),
        nearby_queries: m.nearby_queries.load(Ordering::Relaxed),
        psi_initiated: m.psi_initiated.load(Ordering::Relaxed),
        psi_joined: m.psi_joined.load(Ordering::Relaxed),
        psi_completed: m.psi_completed.load(Ordering::Relaxed),
        sessions_swept: m.sessions_swept.load(Ordering::Relaxed),
        sessions_live: state.sessions.len(),
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/login_for_access_token", post(auth::login_for_access_token))
        .route("/users/me", get(auth::users_me))
        .route("/locations", post(update_location))
        .route("/locations/nearby_users", get(nearby_users))
        .route("/psi/init", post(psi_init))
        .route("/psi/:session_id/join", post(psi_join))
        .route("/psi/:session_id", get(psi_get_values))
        .route(
            "/psi/:session_id/intersection",
            patch(psi_update_intersection).get(psi_get_intersection),
        )
        .route("/health", get(health))
        .route("/metrics", get(metrics_snapshot))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(CorsLayer::permissive()),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::client::{Initiator, Joiner};
    use crate::store::MemStore;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::Value;

    const USERS: &[(&str, &str)] = &[
        ("big_ben", "secret"),
        ("london_eye", "secret"),
        ("tower_bridge", "secret"),
        ("wembley", "secret"),
        ("greenwich", "secret"),
    ];

    /// Bind the router to an ephemeral port and return its base URL plus the
    /// handles the tests poke at directly.
    async fn spawn_app() -> (String, Arc<MemStore>, AppState) {
        let store = Arc::new(MemStore::new());
        for (user, password) in USERS {
            // Low bcrypt cost: these credentials only live for one test.
            let hashed = bcrypt::hash(password, 4).unwrap();
            store.upsert_user(user, &hashed, false).unwrap();
        }

        let users: Arc<dyn UserStore> = store.clone();
        let geo: Arc<dyn GeoStore> = store.clone();
        let state = AppState::new(users, geo, TokenService::new("http-test-secret"));
        let app = router(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), store, state)
    }

    async fn login(client: &reqwest::Client, base: &str, user: &str, password: &str) -> String {
        let resp = client
            .post(format!("{base}/login_for_access_token"))
            .form(&[("username", user), ("password", password)])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200, "login failed for {user}");
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["token_type"], "bearer");
        body["access_token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_login_and_me() {
        let (base, _store, _state) = spawn_app().await;
        let client = reqwest::Client::new();

        let token = login(&client, &base, "big_ben", "secret").await;
        let me: Value = client
            .get(format!("{base}/users/me"))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(me["user_id"], "big_ben");
        assert_eq!(me["disabled"], false);
    }

    #[tokio::test]
    async fn test_bad_credentials_rejected() {
        let (base, _store, _state) = spawn_app().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/login_for_access_token"))
            .form(&[("username", "big_ben"), ("password", "wrong")])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
        assert_eq!(resp.headers()["www-authenticate"], "Bearer");

        let resp = client
            .post(format!("{base}/login_for_access_token"))
            .form(&[("username", "nobody"), ("password", "secret")])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
    }

    #[tokio::test]
    async fn test_missing_token_rejected() {
        let (base, _store, _state) = spawn_app().await;
        let client = reqwest::Client::new();
        let resp = client.get(format!("{base}/users/me")).send().await.unwrap();
        assert_eq!(resp.status(), 401);
        assert_eq!(resp.headers()["www-authenticate"], "Bearer");
    }

    #[tokio::test]
    async fn test_disabled_user_rejected() {
        let (base, store, _state) = spawn_app().await;
        let client = reqwest::Client::new();
        let token = login(&client, &base, "wembley", "secret").await;

        // Disable after token issuance; validation re-checks the record.
        let hashed = bcrypt::hash("secret", 4).unwrap();
        store.upsert_user("wembley", &hashed, true).unwrap();

        let resp = client
            .get(format!("{base}/users/me"))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
    }

    #[tokio::test]
    async fn test_location_update_and_nearby() {
        let (base, _store, _state) = spawn_app().await;
        let client = reqwest::Client::new();

        for (user, lat, lon) in [
            ("big_ben", 51.5007, -0.1246),
            ("london_eye", 51.5033, -0.1195),
            ("tower_bridge", 51.5055, -0.0754),
            ("wembley", 51.5580, -0.2765),
            ("greenwich", 51.4822, -0.0055),
        ] {
            let token = login(&client, &base, user, "secret").await;
            let resp = client
                .post(format!("{base}/locations"))
                .bearer_auth(&token)
                .json(&json!({ "user_id": user, "latitude": lat, "longitude": lon }))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 200);
        }

        let token = login(&client, &base, "big_ben", "secret").await;
        let hits: Vec<Value> = client
            .get(format!("{base}/locations/nearby_users"))
            .bearer_auth(&token)
            .query(&[("user_id", "big_ben"), ("max_distance", "6.0")])
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        let ids: Vec<&str> = hits.iter().map(|h| h["user_id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["london_eye", "tower_bridge"]);
        assert!(hits[0]["distance_km"].as_f64().unwrap() < 0.6);
        assert!(hits[1]["distance_km"].as_f64().unwrap() > 3.0);
    }

    #[tokio::test]
    async fn test_nearby_without_location_is_not_found() {
        let (base, _store, _state) = spawn_app().await;
        let client = reqwest::Client::new();
        let token = login(&client, &base, "greenwich", "secret").await;
        let resp = client
            .get(format!("{base}/locations/nearby_users"))
            .bearer_auth(&token)
            .query(&[("user_id", "greenwich")])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_update_for_other_user_forbidden() {
        let (base, store, _state) = spawn_app().await;
        let client = reqwest::Client::new();
        let token = login(&client, &base, "big_ben", "secret").await;

        let resp = client
            .post(format!("{base}/locations"))
            .bearer_auth(&token)
            .json(&json!({ "user_id": "wembley", "latitude": 51.0, "longitude": 0.0 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 403);
        // The rejected write must not have touched the store.
        assert_eq!(store.location_count(), 0);

        let resp = client
            .get(format!("{base}/locations/nearby_users"))
            .bearer_auth(&token)
            .query(&[("user_id", "wembley")])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 403);
    }

    #[tokio::test]
    async fn test_out_of_range_coordinates_rejected() {
        let (base, store, _state) = spawn_app().await;
        let client = reqwest::Client::new();
        let token = login(&client, &base, "big_ben", "secret").await;
        let resp = client
            .post(format!("{base}/locations"))
            .bearer_auth(&token)
            .json(&json!({ "user_id": "big_ben", "latitude": 95.0, "longitude": 0.0 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert_eq!(store.location_count(), 0);
    }

    #[tokio::test]
    async fn test_psi_end_to_end() {
        let (base, _store, _state) = spawn_app().await;
        let client = reqwest::Client::new();
        let mut rng = StdRng::seed_from_u64(42);

        let alice_token = login(&client, &base, "big_ben", "secret").await;
        let bob_token = login(&client, &base, "london_eye", "secret").await;

        let alice = Initiator::new(
            ["sports", "books", "music", "movies", "programming", "nature"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            &mut rng,
        );
        let bob = Joiner::new(
            ["music", "travel", "movies", "nature", "food"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            &mut rng,
        );

        // Step 1: initiator submits blinded items.
        let resp = client
            .post(format!("{base}/psi/init"))
            .bearer_auth(&alice_token)
            .json(&json!({
                "user_id": "big_ben",
                "blinded_values": encode_elements(&alice.blinded_items()),
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let sid = resp.json::<Value>().await.unwrap()["session_id"]
            .as_str()
            .unwrap()
            .to_string();

        // Step 2: joiner fetches the initiator's values and responds.
        let fetched: Value = client
            .get(format!("{base}/psi/{sid}"))
            .bearer_auth(&bob_token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(fetched["status"], "INITIATED");
        let initiator_values = decode_elements(
            &fetched["values"]
                .as_array()
                .unwrap()
                .iter()
                .map(|v| v.as_str().unwrap().to_string())
                .collect::<Vec<_>>(),
        )
        .unwrap();

        let resp = client
            .post(format!("{base}/psi/{sid}/join"))
            .bearer_auth(&bob_token)
            .json(&json!({
                "session_id": sid,
                "user_id": "london_eye",
                "response_values": encode_elements(&bob.respond(&initiator_values)),
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.json::<Value>().await.unwrap()["status"], "JOINED");

        // Step 3: initiator computes and reports the intersection.
        let joined: Value = client
            .get(format!("{base}/psi/{sid}"))
            .bearer_auth(&alice_token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(joined["status"], "JOINED");
        let response_values = decode_elements(
            &joined["values"]["london_eye"]
                .as_array()
                .unwrap()
                .iter()
                .map(|v| v.as_str().unwrap().to_string())
                .collect::<Vec<_>>(),
        )
        .unwrap();

        let shared = alice.intersect(&response_values).unwrap();
        assert_eq!(shared, vec!["music", "movies", "nature"]);

        let resp = client
            .patch(format!("{base}/psi/{sid}/intersection"))
            .bearer_auth(&alice_token)
            .json(&json!({
                "user_id": "big_ben",
                "other_user_id": "london_eye",
                "len_intersection": shared.len(),
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        // The joiner can read the recorded size; the session is Completed.
        let n: Value = client
            .get(format!("{base}/psi/{sid}/intersection"))
            .bearer_auth(&bob_token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(n["intersection_len"], 3);

        let n: Value = client
            .get(format!("{base}/psi/{sid}/intersection"))
            .bearer_auth(&alice_token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(n["intersection_len"], -1);

        let completed: Value = client
            .get(format!("{base}/psi/{sid}"))
            .bearer_auth(&alice_token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(completed["status"], "COMPLETED");
    }

    #[tokio::test]
    async fn test_psi_joined_values_hidden_from_joiner() {
        let (base, _store, state) = spawn_app().await;
        let client = reqwest::Client::new();
        let mut rng = StdRng::seed_from_u64(9);

        let alice_token = login(&client, &base, "big_ben", "secret").await;
        let bob_token = login(&client, &base, "london_eye", "secret").await;

        let alice = Initiator::new(vec!["music".to_string()], &mut rng);
        let resp = client
            .post(format!("{base}/psi/init"))
            .bearer_auth(&alice_token)
            .json(&json!({
                "user_id": "big_ben",
                "blinded_values": encode_elements(&alice.blinded_items()),
            }))
            .send()
            .await
            .unwrap();
        let sid = resp.json::<Value>().await.unwrap()["session_id"]
            .as_str()
            .unwrap()
            .to_string();

        let bob = Joiner::new(vec!["music".to_string()], &mut rng);
        let values = state
            .sessions
            .values(sid.parse().unwrap(), "london_eye")
            .map(|(_, v)| match v {
                SessionValues::Initiator(list) => list,
                SessionValues::Responses(_) => unreachable!(),
            })
            .unwrap();
        client
            .post(format!("{base}/psi/{sid}/join"))
            .bearer_auth(&bob_token)
            .json(&json!({
                "user_id": "london_eye",
                "response_values": encode_elements(&bob.respond(&values)),
            }))
            .send()
            .await
            .unwrap();

        // After the join, reads are initiator-only.
        let resp = client
            .get(format!("{base}/psi/{sid}"))
            .bearer_auth(&bob_token)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 403);
    }

    #[tokio::test]
    async fn test_psi_expired_session_gone_then_not_found() {
        let (base, _store, state) = spawn_app().await;
        let client = reqwest::Client::new();
        let mut rng = StdRng::seed_from_u64(10);

        let alice_token = login(&client, &base, "big_ben", "secret").await;
        let bob_token = login(&client, &base, "london_eye", "secret").await;

        let alice = Initiator::new(vec!["music".to_string()], &mut rng);
        let blinded = encode_elements(&alice.blinded_items());
        let resp = client
            .post(format!("{base}/psi/init"))
            .bearer_auth(&alice_token)
            .json(&json!({ "user_id": "big_ben", "blinded_values": blinded }))
            .send()
            .await
            .unwrap();
        let sid = resp.json::<Value>().await.unwrap()["session_id"]
            .as_str()
            .unwrap()
            .to_string();

        // T+31 minutes.
        state.sessions.backdate(sid.parse().unwrap(), 31);

        let resp = client
            .post(format!("{base}/psi/{sid}/join"))
            .bearer_auth(&bob_token)
            .json(&json!({
                "user_id": "london_eye",
                "response_values": vec!["2", "3"],
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 410);

        // Detection removed the entry.
        let resp = client
            .get(format!("{base}/psi/{sid}"))
            .bearer_auth(&bob_token)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_psi_join_with_invalid_element() {
        let (base, _store, _state) = spawn_app().await;
        let client = reqwest::Client::new();
        let mut rng = StdRng::seed_from_u64(11);

        let alice_token = login(&client, &base, "big_ben", "secret").await;
        let bob_token = login(&client, &base, "london_eye", "secret").await;

        let alice = Initiator::new(vec!["music".to_string()], &mut rng);
        let resp = client
            .post(format!("{base}/psi/init"))
            .bearer_auth(&alice_token)
            .json(&json!({
                "user_id": "big_ben",
                "blinded_values": encode_elements(&alice.blinded_items()),
            }))
            .send()
            .await
            .unwrap();
        let sid = resp.json::<Value>().await.unwrap()["session_id"]
            .as_str()
            .unwrap()
            .to_string();

        // p itself is outside [1, p-1].
        let resp = client
            .post(format!("{base}/psi/{sid}/join"))
            .bearer_auth(&bob_token)
            .json(&json!({
                "user_id": "london_eye",
                "response_values": vec!["2".to_string(), group::encode_element(&group::P)],
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        // Session untouched, still Initiated and readable.
        let fetched: Value = client
            .get(format!("{base}/psi/{sid}"))
            .bearer_auth(&bob_token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(fetched["status"], "INITIATED");
    }

    #[tokio::test]
    async fn test_psi_unknown_session() {
        let (base, _store, _state) = spawn_app().await;
        let client = reqwest::Client::new();
        let token = login(&client, &base, "big_ben", "secret").await;

        for path in [
            format!("{base}/psi/{}", Uuid::new_v4()),
            format!("{base}/psi/not-a-uuid"),
        ] {
            let resp = client.get(path).bearer_auth(&token).send().await.unwrap();
            assert_eq!(resp.status(), 404);
        }
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let (base, _store, _state) = spawn_app().await;
        let client = reqwest::Client::new();
        assert_eq!(client.get(format!("{base}/health")).send().await.unwrap().status(), 200);

        login(&client, &base, "big_ben", "secret").await;
        let m: Value = client
            .get(format!("{base}/metrics"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(m["logins"], 1);
        assert_eq!(m["sessions_live"], 0);
    }
}
