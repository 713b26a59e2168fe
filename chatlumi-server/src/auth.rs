//! Session authentication
//!
//! Credentials are argon2 hashes in `users`; a successful login creates a row
//! in `sessions` keyed by a random 256-bit token. The token travels in an
//! HttpOnly cookie (or as `Authorization: Bearer <token>` for API clients)
//! and is resolved per request by the `AuthUser` extractor.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use chatlumi_core::config::AuthConfig;
use chatlumi_core::models::User;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tower_cookies::cookie::{time, SameSite};
use tower_cookies::{Cookie, Cookies};
use uuid::Uuid;

use crate::http::{internal_error, message_body, ApiResponse, HttpState};

const MIN_NAME_LEN: usize = 2;
const MIN_PASSWORD_LEN: usize = 6;

// ============================================================================
// Extractor
// ============================================================================

/// The signed-in user behind the current request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: User,
    pub token: String,
}

impl AuthUser {
    pub fn id(&self) -> Uuid {
        self.user.id
    }
}

#[async_trait]
impl FromRequestParts<Arc<HttpState>> for AuthUser {
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<HttpState>,
    ) -> Result<Self, Self::Rejection> {
        let cookies = parts.extensions.get::<Cookies>();
        let token = session_token(&parts.headers, cookies, &state.config.auth.cookie_name)
            .ok_or_else(unauthorized)?;

        match find_session_user(&state.pool, &token).await {
            Ok(Some(user)) => Ok(AuthUser { user, token }),
            Ok(None) => Err(unauthorized()),
            Err(e) => {
                let (status, body) = internal_error("Session lookup failed", e);
                Err((status, Json(body)))
            }
        }
    }
}

fn unauthorized() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "message": "Unauthorized" })),
    )
}

/// Bearer header first, then the session cookie.
pub fn session_token(
    headers: &HeaderMap,
    cookies: Option<&Cookies>,
    cookie_name: &str,
) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| {
            let scheme = auth.get(..7)?;
            if scheme.eq_ignore_ascii_case("bearer ") {
                auth.get(7..).map(|t| t.trim().to_string())
            } else {
                None
            }
        })
        .filter(|t| !t.is_empty());

    bearer.or_else(|| {
        cookies
            .and_then(|c| c.get(cookie_name))
            .map(|c| c.value().to_string())
            .filter(|t| !t.is_empty())
    })
}

// ============================================================================
// Passwords & tokens
// ============================================================================

pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::warn!("Unparseable password hash: {}", e);
            false
        }
    }
}

pub fn generate_session_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap_or_else(|_| unreachable!("valid regex"))
    })
}

pub fn is_valid_email(email: &str) -> bool {
    email_regex().is_match(email)
}

// ============================================================================
// Session storage
// ============================================================================

pub async fn create_session(
    pool: &PgPool,
    user_id: Uuid,
    ttl_hours: i64,
) -> Result<String, sqlx::Error> {
    let token = generate_session_token();
    let expires_at = Utc::now() + chrono::Duration::hours(ttl_hours);

    sqlx::query("INSERT INTO sessions (token, user_id, expires_at) VALUES ($1, $2, $3)")
        .bind(&token)
        .bind(user_id)
        .bind(expires_at)
        .execute(pool)
        .await?;

    Ok(token)
}

pub async fn find_session_user(pool: &PgPool, token: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(
        r#"
        SELECT u.*
        FROM sessions s
        JOIN users u ON u.id = s.user_id
        WHERE s.token = $1 AND s.expires_at > now()
        "#,
    )
    .bind(token)
    .fetch_optional(pool)
    .await
}

pub async fn delete_session(pool: &PgPool, token: &str) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM sessions WHERE token = $1")
        .bind(token)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn purge_expired_sessions(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= now()")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Periodically delete expired sessions until shutdown fires.
pub async fn run_session_purge_loop(
    pool: PgPool,
    config: AuthConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    let period = Duration::from_secs(config.purge_interval_minutes.max(1) * 60);
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match purge_expired_sessions(&pool).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(purged = n, "Expired sessions removed"),
                    Err(e) => tracing::warn!("Session purge failed: {}", e),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Session purge loop stopping");
                break;
            }
        }
    }
}

pub fn session_cookie(config: &AuthConfig, token: String) -> Cookie<'static> {
    Cookie::build((config.cookie_name.clone(), token))
        .path("/")
        .http_only(true)
        .secure(config.secure_cookies)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::hours(config.session_ttl_hours))
        .build()
}

pub fn removal_cookie(config: &AuthConfig) -> Cookie<'static> {
    Cookie::build((config.cookie_name.clone(), String::new()))
        .path("/")
        .build()
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct RegisterRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoginRequest {
    pub email: Option<String>,
    pub password: Option<String>,
}

/// Field-level problems with a registration request, empty when valid.
pub fn validate_registration(req: &RegisterRequest) -> Vec<String> {
    let mut issues = Vec::new();

    let name = req.name.as_deref().map(str::trim).unwrap_or("");
    if name.chars().count() < MIN_NAME_LEN {
        issues.push(format!("name must have at least {} characters", MIN_NAME_LEN));
    }

    let email = req.email.as_deref().map(str::trim).unwrap_or("");
    if !is_valid_email(email) {
        issues.push("email must be a valid address".to_string());
    }

    let password = req.password.as_deref().unwrap_or("");
    if password.chars().count() < MIN_PASSWORD_LEN {
        issues.push(format!(
            "password must have at least {} characters",
            MIN_PASSWORD_LEN
        ));
    }

    issues
}

// ============================================================================
// Inner (directly testable) functions
// ============================================================================

pub async fn register_inner(pool: &PgPool, req: RegisterRequest) -> ApiResponse {
    let issues = validate_registration(&req);
    if !issues.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            json!({ "message": "Invalid input data", "error": issues }),
        );
    }

    let name = req.name.unwrap_or_default().trim().to_string();
    let email = req.email.unwrap_or_default().trim().to_lowercase();
    let password = req.password.unwrap_or_default();

    let hashed = match tokio::task::spawn_blocking(move || hash_password(&password)).await {
        Ok(Ok(h)) => h,
        Ok(Err(e)) => return internal_error("Password hashing failed", e),
        Err(e) => return internal_error("Password hashing task failed", e),
    };

    let inserted = sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (id, name, email, password_hash)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&name)
    .bind(&email)
    .bind(&hashed)
    .fetch_one(pool)
    .await;

    match inserted {
        Ok(user) => {
            tracing::info!(user_id = %user.id, "User registered");
            (
                StatusCode::CREATED,
                json!({ "user": user, "message": "User registered successfully" }),
            )
        }
        Err(e) if chatlumi_core::db::is_unique_violation(&e) => {
            message_body(StatusCode::CONFLICT, "This email is already in use")
        }
        Err(e) => internal_error("Failed to register user", e),
    }
}

/// Verify credentials and open a session. Returns the token alongside the body.
pub async fn login_inner(
    pool: &PgPool,
    config: &AuthConfig,
    req: LoginRequest,
) -> (StatusCode, serde_json::Value, Option<String>) {
    let (Some(email), Some(password)) = (req.email, req.password) else {
        let (status, body) = message_body(StatusCode::BAD_REQUEST, "Email and password are required");
        return (status, body, None);
    };

    let email = email.trim().to_lowercase();
    let user = match sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
        .bind(&email)
        .fetch_optional(pool)
        .await
    {
        Ok(u) => u,
        Err(e) => {
            let (status, body) = internal_error("Login lookup failed", e);
            return (status, body, None);
        }
    };

    let Some(user) = user else {
        let (status, body) = message_body(StatusCode::UNAUTHORIZED, "Invalid credentials");
        return (status, body, None);
    };

    let stored = user.password_hash.clone();
    let valid = tokio::task::spawn_blocking(move || verify_password(&password, &stored))
        .await
        .unwrap_or(false);
    if !valid {
        let (status, body) = message_body(StatusCode::UNAUTHORIZED, "Invalid credentials");
        return (status, body, None);
    }

    match create_session(pool, user.id, config.session_ttl_hours).await {
        Ok(token) => {
            tracing::info!(user_id = %user.id, "User signed in");
            (StatusCode::OK, json!({ "user": user }), Some(token))
        }
        Err(e) => {
            let (status, body) = internal_error("Failed to create session", e);
            (status, body, None)
        }
    }
}

pub async fn logout_inner(pool: &PgPool, token: &str) -> ApiResponse {
    match delete_session(pool, token).await {
        Ok(_) => (StatusCode::OK, json!({ "status": "ok" })),
        Err(e) => internal_error("Failed to delete session", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_password_hash_verifies() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
    }

    #[test]
    fn test_verify_rejects_garbage_hash() {
        assert!(!verify_password("anything", "not-a-phc-string"));
    }

    #[test]
    fn test_session_tokens_are_unique_hex() {
        let a = generate_session_token();
        let b = generate_session_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_bearer_token_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(
            session_token(&headers, None, "chatlumi_session").as_deref(),
            Some("abc123")
        );
    }

    #[test]
    fn test_missing_token_is_none() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        assert!(session_token(&headers, None, "chatlumi_session").is_none());
        assert!(session_token(&HeaderMap::new(), None, "chatlumi_session").is_none());
    }

    #[test]
    fn test_validate_registration() {
        let ok = RegisterRequest {
            name: Some("Ana".to_string()),
            email: Some("ana@example.com".to_string()),
            password: Some("secret1".to_string()),
        };
        assert!(validate_registration(&ok).is_empty());

        let bad = RegisterRequest {
            name: Some("A".to_string()),
            email: Some("not-an-email".to_string()),
            password: Some("123".to_string()),
        };
        assert_eq!(validate_registration(&bad).len(), 3);
        assert_eq!(validate_registration(&RegisterRequest::default()).len(), 3);
    }

    #[test]
    fn test_session_cookie_attributes() {
        let cfg = AuthConfig::default();
        let cookie = session_cookie(&cfg, "tok".to_string());
        assert_eq!(cookie.name(), "chatlumi_session");
        assert_eq!(cookie.value(), "tok");
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.path(), Some("/"));
    }
}
