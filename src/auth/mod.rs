/*!
 * # Authentication boundary
 *
 * The storefront's identity provider issues HS256 bearer tokens. This module
 * only verifies them and hands the opaque subject to the settlement core;
 * credentials are never seen here.
 */

use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{config::AppConfig, errors::ServiceError, AppState};

pub const ADMIN_ROLE: &str = "admin";

/// Claim structure for JWT tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,        // Subject (opaque user id)
    pub roles: Vec<String>, // User's roles
    pub iat: i64,           // Issued at time
    pub exp: i64,           // Expiration time
    pub iss: String,        // Issuer
}

/// Authenticated caller extracted from the bearer token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub user_id: String,
    pub roles: Vec<String>,
}

impl AuthUser {
    /// Check if the user has a specific role
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Check if the user is an admin
    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }
}

/// An [`AuthUser`] holding the `admin` role.
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthUser);

/// Verification settings for bearer tokens
#[derive(Clone)]
pub struct AuthConfig {
    jwt_secret: String,
    issuer: String,
}

impl AuthConfig {
    pub fn new(jwt_secret: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            issuer: issuer.into(),
        }
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, ServiceError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.issuer.as_str()]);

        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|e| {
            debug!(error = %e, "bearer token rejected");
            ServiceError::Unauthorized("Invalid or expired token".to_string())
        })
    }

    /// Mints a token the way the identity provider does. Used by tooling and tests.
    pub fn issue_token(
        &self,
        user_id: &str,
        roles: &[&str],
        ttl_secs: i64,
    ) -> Result<String, ServiceError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            iat: now,
            exp: now + ttl_secs,
            iss: self.issuer.clone(),
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .map_err(|e| ServiceError::Internal(format!("token encoding failed: {}", e)))
    }
}

impl From<&AppConfig> for AuthConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self::new(cfg.jwt_secret.clone(), cfg.auth_issuer.clone())
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    AppState: FromRef<S>,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);
        let token = bearer_token(parts)
            .ok_or_else(|| ServiceError::Unauthorized("Missing bearer token".to_string()))?;

        let claims = app_state.auth.validate_token(token)?;
        if claims.sub.trim().is_empty() {
            return Err(ServiceError::Unauthorized("Token has no subject".to_string()));
        }

        Ok(AuthUser {
            user_id: claims.sub,
            roles: claims.roles,
        })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
    AppState: FromRef<S>,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(ServiceError::Forbidden(
                "Administrator role required".to_string(),
            ));
        }
        Ok(AdminUser(user))
    }
}
