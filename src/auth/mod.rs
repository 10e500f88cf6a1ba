//! Login, bearer-token authentication, and account management.
//!
//! Tokens are opaque 40-char random strings; only their SHA-256 hash is
//! stored, so a database leak does not leak usable credentials. Passwords
//! are hashed with argon2.

use crate::shared::error::ApiError;
use crate::shared::models::{schema, NewApiToken, NewUser, User};
use crate::shared::state::AppState;
use crate::shared::utils::{random_token, DbPool};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use diesel::prelude::*;
use log::info;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;

const TOKEN_LENGTH: usize = 40;
const MIN_PASSWORD_LENGTH: usize = 8;

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/login", post(login))
        .route("/user", get(current_user))
        .route("/user/password", post(update_password))
}

pub fn hash_password(password: &str) -> Result<String, anyhow::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?;
    Ok(hash.to_string())
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// Tokens are stored hashed; the plaintext exists only in the login response.
pub fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

// ---------------------------------------------------------------------------
// Bearer-token extractor
// ---------------------------------------------------------------------------

/// Authenticated request context, resolved from the Authorization header.
pub struct AuthUser {
    pub user: User,
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(ApiError::Unauthorized)?
            .trim();
        if token.is_empty() {
            return Err(ApiError::Unauthorized);
        }

        let hashed = token_hash(token);
        let pool = state.conn.clone();
        let user = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<User>> {
            let mut conn = pool.get()?;
            Ok(schema::api_tokens::table
                .inner_join(schema::users::table)
                .filter(schema::api_tokens::token_hash.eq(&hashed))
                .select(User::as_select())
                .first(&mut conn)
                .optional()?)
        })
        .await
        .map_err(anyhow::Error::from)??;

        user.map(|user| AuthUser { user })
            .ok_or(ApiError::Unauthorized)
    }
}

/// Optional variant for endpoints that are public but attribute activity to
/// a logged-in account when a valid token is supplied.
pub struct MaybeAuthUser(pub Option<AuthUser>);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for MaybeAuthUser {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        Ok(MaybeAuthUser(
            AuthUser::from_request_parts(parts, state).await.ok(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pool = state.conn.clone();
    let email = request.email.clone();
    let user = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<User>> {
        let mut conn = pool.get()?;
        Ok(schema::users::table
            .filter(schema::users::email.eq(&email))
            .select(User::as_select())
            .first(&mut conn)
            .optional()?)
    })
    .await
    .map_err(anyhow::Error::from)??;

    let user = match user {
        Some(user) if verify_password(&user.password_hash, &request.password) => user,
        _ => return Err(ApiError::Unauthorized),
    };

    let token = random_token(TOKEN_LENGTH);
    let row = NewApiToken {
        user_id: user.id,
        token_hash: token_hash(&token),
    };
    let pool = state.conn.clone();
    tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
        let mut conn = pool.get()?;
        Ok(diesel::insert_into(schema::api_tokens::table)
            .values(&row)
            .execute(&mut conn)?)
    })
    .await
    .map_err(anyhow::Error::from)??;

    Ok(Json(json!({ "token": token, "user": user })))
}

async fn current_user(user: AuthUser) -> Json<User> {
    Json(user.user)
}

#[derive(Debug, Deserialize)]
pub struct PasswordChangeRequest {
    pub current_password: String,
    pub new_password: String,
    pub new_password_confirmation: String,
}

async fn update_password(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(request): Json<PasswordChangeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if request.new_password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(ApiError::validation(
            "new_password",
            "The new password must be at least 8 characters.",
        ));
    }
    if request.new_password != request.new_password_confirmation {
        return Err(ApiError::validation(
            "new_password",
            "The new password confirmation does not match.",
        ));
    }
    if !verify_password(&auth.user.password_hash, &request.current_password) {
        return Err(ApiError::validation("current_password", "当前密码不正确"));
    }

    let hashed = hash_password(&request.new_password)?;
    let pool = state.conn.clone();
    let user_id = auth.user.id;
    tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
        let mut conn = pool.get()?;
        Ok(diesel::update(schema::users::table.find(user_id))
            .set((
                schema::users::password_hash.eq(&hashed),
                schema::users::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)?)
    })
    .await
    .map_err(anyhow::Error::from)??;

    Ok(Json(json!({ "message": "密码修改成功，请重新登录" })))
}

// ---------------------------------------------------------------------------
// CLI: first-admin bootstrap
// ---------------------------------------------------------------------------

/// Create the initial admin account, refusing duplicates by email.
pub fn init_user(pool: &DbPool, name: &str, email: &str, password: &str) -> anyhow::Result<()> {
    let mut conn = pool.get()?;
    let exists: Option<i64> = schema::users::table
        .filter(schema::users::email.eq(email))
        .select(schema::users::id)
        .first(&mut conn)
        .optional()?;
    if exists.is_some() {
        anyhow::bail!("user already exists: {}", email);
    }

    let row = NewUser {
        name: name.to_string(),
        email: email.to_string(),
        password_hash: hash_password(password)?,
    };
    diesel::insert_into(schema::users::table)
        .values(&row)
        .execute(&mut conn)?;
    info!("created user {} <{}>", name, email);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_roundtrip_and_rejection() {
        let hash = hash_password("correct horse battery").unwrap();
        assert!(verify_password(&hash, "correct horse battery"));
        assert!(!verify_password(&hash, "wrong password"));
        assert!(!verify_password("not-a-phc-string", "anything"));
    }

    #[test]
    fn token_hash_is_stable_hex_sha256() {
        let hash = token_hash("abc");
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(token_hash("abc"), hash);
    }
}
