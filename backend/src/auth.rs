//! Authentication: bcrypt-hashed users, HS256 bearer tokens, the
//! `CurrentUser` extractor gating every non-login route.
//!
//! Every authentication failure collapses into the same 401 — a caller
//! cannot tell a bad password from an expired token or a disabled account.

use axum::extract::{FromRequestParts, State};
use axum::http::header;
use axum::http::request::Parts;
use axum::{Form, Json};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::error::ApiError;
use crate::http::AppState;
use crate::store::{StoreError, UserStore};

pub const TOKEN_TTL_MINUTES: i64 = 30;

pub fn hash_password(plain: &str) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(plain, bcrypt::DEFAULT_COST)
}

/// True only on a positive match; hash-format errors count as mismatch.
pub fn verify_password(plain: &str, hashed: &str) -> bool {
    bcrypt::verify(plain, hashed).unwrap_or(false)
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
}

/// Issues and validates HMAC-SHA-256 signed bearer tokens carrying the
/// subject and an absolute expiry. The signing secret is fixed at startup.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenService {
    pub fn new(secret: &str) -> Self {
        Self::with_ttl(secret, Duration::minutes(TOKEN_TTL_MINUTES))
    }

    pub fn with_ttl(secret: &str, ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl,
        }
    }

    pub fn issue(&self, user_id: &str) -> Result<String, ApiError> {
        let claims = Claims {
            sub: user_id.to_string(),
            exp: (Utc::now() + self.ttl).timestamp(),
        };
        jsonwebtoken::encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| ApiError::Upstream(format!("token encoding failed: {e}")))
    }

    /// Signature + expiry check; returns the subject. The caller still has to
    /// resolve the subject to a live user.
    pub fn subject(&self, token: &str) -> Result<String, ApiError> {
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims.sub)
            .map_err(|_| ApiError::Unauthorized)
    }
}

/// The authenticated caller, extracted from the bearer token. Requires a
/// valid signature, an unexpired token and a known, non-disabled user.
pub struct CurrentUser {
    pub user_id: String,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        match authenticate(parts, state) {
            Ok(user) => Ok(user),
            Err(e) => {
                state.metrics.auth_rejected.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

fn authenticate(parts: &Parts, state: &AppState) -> Result<CurrentUser, ApiError> {
    let token = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let user_id = state.tokens.subject(token)?;
    let user = state.users.get_user(&user_id)?.ok_or(ApiError::Unauthorized)?;
    if user.disabled {
        return Err(ApiError::Unauthorized);
    }
    Ok(CurrentUser { user_id })
}

#[derive(Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
}

/// POST /login_for_access_token — form-encoded, per the OAuth2 password flow
/// the original deployment spoke.
#[instrument(skip_all, fields(user = %form.username))]
pub async fn login_for_access_token(
    State(state): State<AppState>,
    Form(form): Form<LoginForm>,
) -> Result<Json<TokenResponse>, ApiError> {
    let user = state.users.get_user(&form.username)?;
    let authenticated = user
        .map(|u| !u.disabled && verify_password(&form.password, &u.hashed_password))
        .unwrap_or(false);

    if !authenticated {
        state.metrics.login_rejected.fetch_add(1, Ordering::Relaxed);
        warn!("login_rejected");
        return Err(ApiError::Unauthorized);
    }

    let access_token = state.tokens.issue(&form.username)?;
    state.metrics.logins.fetch_add(1, Ordering::Relaxed);
    info!("login_ok");
    Ok(Json(TokenResponse { access_token, token_type: "bearer".to_string() }))
}

#[derive(Serialize)]
pub struct MeResponse {
    pub user_id: String,
    pub disabled: bool,
}

/// GET /users/me — echo the token's subject.
pub async fn users_me(
    State(state): State<AppState>,
    current_user: CurrentUser,
) -> Result<Json<MeResponse>, ApiError> {
    let user = state
        .users
        .get_user(&current_user.user_id)?
        .ok_or(ApiError::Unauthorized)?;
    Ok(Json(MeResponse { user_id: user.user_id, disabled: user.disabled }))
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("malformed user entry '{0}', expected user:password")]
    BadSpec(String),
    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Out-of-band user provisioning from a `user:password,user:password` list.
/// Idempotent; re-running replaces passwords and re-enables accounts.
pub fn provision_users(store: &dyn UserStore, spec: &str) -> Result<usize, ProvisionError> {
    let mut count = 0;
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (user_id, password) = entry
            .split_once(':')
            .filter(|(u, p)| !u.is_empty() && !p.is_empty())
            .ok_or_else(|| ProvisionError::BadSpec(entry.to_string()))?;
        let hashed = hash_password(password)?;
        store.upsert_user(user_id, &hashed, false)?;
        count += 1;
    }
    Ok(count)
}
