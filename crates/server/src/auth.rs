//! Bearer-token authentication for the RPC surface.
//!
//! Two validation paths: a static API-token store and an OIDC verifier that
//! validates JWTs locally against the issuer's JWKS (issuer, audience, and
//! expiry checks). Health and discovery endpoints bypass the interceptor
//! entirely; everything else passes through it, and whether a missing
//! credential is fatal depends on the deployment (see
//! [`crate::config::ServerConfig::auth_required`]).

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::ApiError;

/// Shared authentication state for the interceptor.
pub struct AuthState {
    /// When false, requests without credentials are admitted (dev mode).
    required: bool,
    tokens: HashSet<String>,
    oidc: Option<OidcVerifier>,
}

impl AuthState {
    pub fn new(required: bool, tokens: Vec<String>, oidc: Option<OidcVerifier>) -> Arc<Self> {
        Arc::new(Self {
            required,
            tokens: tokens.into_iter().collect(),
            oidc,
        })
    }

    /// Validate a bearer token against the token store, then OIDC.
    pub async fn authenticate(&self, bearer: Option<&str>) -> Result<(), ApiError> {
        let Some(token) = bearer else {
            if self.required {
                return Err(ApiError::unauthenticated("missing bearer token"));
            }
            return Ok(());
        };

        if self.tokens.contains(token) {
            debug!("request authenticated via api token");
            return Ok(());
        }

        if let Some(oidc) = &self.oidc {
            oidc.verify(token).await?;
            debug!("request authenticated via oidc");
            return Ok(());
        }

        if self.required {
            return Err(ApiError::unauthenticated("invalid bearer token"));
        }
        Ok(())
    }
}

/// Axum middleware enforcing authentication on non-public routes.
pub async fn require_auth(
    State(auth): State<Arc<AuthState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let bearer = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    auth.authenticate(bearer).await?;
    Ok(next.run(request).await)
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[allow(dead_code)]
    sub: Option<String>,
}

/// JWKS-backed local JWT validation.
pub struct OidcVerifier {
    issuer: String,
    audience: String,
    http: reqwest::Client,
    jwks: RwLock<Option<JwkSet>>,
}

impl OidcVerifier {
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into().trim_end_matches('/').to_string(),
            audience: audience.into(),
            http: reqwest::Client::new(),
            jwks: RwLock::new(None),
        }
    }

    /// Validate signature, issuer, audience, and expiry.
    pub async fn verify(&self, token: &str) -> Result<(), ApiError> {
        let header = decode_header(token)
            .map_err(|error| ApiError::unauthenticated(format!("malformed token: {error}")))?;
        let kid = header.kid;

        let key = self.decoding_key(kid.as_deref()).await?;
        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);

        decode::<Claims>(token, &key, &validation)
            .map_err(|error| ApiError::unauthenticated(format!("token rejected: {error}")))?;
        Ok(())
    }

    async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, ApiError> {
        if let Some(key) = self.lookup_cached(kid).await? {
            return Ok(key);
        }
        self.refresh_jwks().await?;
        match self.lookup_cached(kid).await? {
            Some(key) => Ok(key),
            None => Err(ApiError::unauthenticated("no matching signing key")),
        }
    }

    async fn lookup_cached(&self, kid: Option<&str>) -> Result<Option<DecodingKey>, ApiError> {
        let cached = self.jwks.read().await;
        let Some(set) = cached.as_ref() else {
            return Ok(None);
        };
        let jwk = match kid {
            Some(kid) => set.keys.iter().find(|key| key.kid.as_deref() == Some(kid)),
            None => set.keys.first(),
        };
        let Some(jwk) = jwk else {
            return Ok(None);
        };
        let (Some(n), Some(e)) = (&jwk.n, &jwk.e) else {
            return Ok(None);
        };
        let key = DecodingKey::from_rsa_components(n, e)
            .map_err(|error| ApiError::unauthenticated(format!("invalid signing key: {error}")))?;
        Ok(Some(key))
    }

    async fn refresh_jwks(&self) -> Result<(), ApiError> {
        let discovery_url = format!("{}/.well-known/openid-configuration", self.issuer);
        let discovery: DiscoveryDocument = self
            .http
            .get(&discovery_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|error| ApiError::unauthenticated(format!("oidc discovery failed: {error}")))?
            .json()
            .await
            .map_err(|error| ApiError::unauthenticated(format!("oidc discovery failed: {error}")))?;

        let set: JwkSet = self
            .http
            .get(&discovery.jwks_uri)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|error| ApiError::unauthenticated(format!("jwks fetch failed: {error}")))?
            .json()
            .await
            .map_err(|error| ApiError::unauthenticated(format!("jwks fetch failed: {error}")))?;

        *self.jwks.write().await = Some(set);
        Ok(())
    }
}
