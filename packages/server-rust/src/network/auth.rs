//! Optional request authentication: static API keys or JWTs checked against a
//! JWKS.
//!
//! Paths under `/.well-known/` are never authenticated.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;
use gantry_core::HandlerError;
use http::header::AUTHORIZATION;
use http::HeaderMap;
use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk, JwkSet, KeyAlgorithm};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use subtle::{Choice, ConstantTimeEq};
use tracing::warn;

use super::config::AuthConfig;
use crate::service::context::AuthClaims;
use crate::service::respond::{render_error, Encoding};

const API_KEY_HEADER: &str = "x-api-key";
const EXEMPT_PREFIX: &str = "/.well-known/";

/// Why a request was rejected.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing X-Api-Key header")]
    MissingApiKey,
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("missing bearer token")]
    MissingBearer,
    #[error("token has no key id")]
    MissingKeyId,
    #[error("unknown signing key '{0}'")]
    UnknownKey(String),
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

impl From<AuthError> for HandlerError {
    fn from(err: AuthError) -> Self {
        HandlerError::Unauthorized {
            reason: err.to_string(),
        }
    }
}

/// A decoding key pinned to the algorithm its JWK declares.
struct VerifyingKey {
    key: DecodingKey,
    algorithm: Algorithm,
}

/// Decoding keys by `kid`, loaded once at startup.
#[derive(Default)]
pub struct JwksCache {
    keys: DashMap<String, VerifyingKey>,
}

/// The signing algorithm a JWK is used with.
///
/// An explicit `alg` wins. Without one, RSA keys mean RS256, EC keys follow
/// their curve and OKP keys mean EdDSA. Symmetric keys must declare `alg`.
fn key_algorithm(jwk: &Jwk) -> Option<Algorithm> {
    if let Some(alg) = &jwk.common.key_algorithm {
        return match alg {
            KeyAlgorithm::HS256 => Some(Algorithm::HS256),
            KeyAlgorithm::HS384 => Some(Algorithm::HS384),
            KeyAlgorithm::HS512 => Some(Algorithm::HS512),
            KeyAlgorithm::ES256 => Some(Algorithm::ES256),
            KeyAlgorithm::ES384 => Some(Algorithm::ES384),
            KeyAlgorithm::RS256 => Some(Algorithm::RS256),
            KeyAlgorithm::RS384 => Some(Algorithm::RS384),
            KeyAlgorithm::RS512 => Some(Algorithm::RS512),
            KeyAlgorithm::PS256 => Some(Algorithm::PS256),
            KeyAlgorithm::PS384 => Some(Algorithm::PS384),
            KeyAlgorithm::PS512 => Some(Algorithm::PS512),
            KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
            // Encryption algorithms never sign.
            _ => None,
        };
    }
    match &jwk.algorithm {
        AlgorithmParameters::RSA(_) => Some(Algorithm::RS256),
        AlgorithmParameters::EllipticCurve(ec) => match &ec.curve {
            EllipticCurve::P256 => Some(Algorithm::ES256),
            EllipticCurve::P384 => Some(Algorithm::ES384),
            _ => None,
        },
        AlgorithmParameters::OctetKeyPair(_) => Some(Algorithm::EdDSA),
        _ => None,
    }
}

impl JwksCache {
    /// Builds the cache from a key set. Keys without a `kid`, without a
    /// usable signing algorithm, or with an unsupported type are skipped with
    /// a warning.
    #[must_use]
    pub fn from_set(set: &JwkSet) -> Self {
        let cache = Self::default();
        for jwk in &set.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                warn!("skipping JWK without kid");
                continue;
            };
            let Some(algorithm) = key_algorithm(jwk) else {
                warn!(kid = %kid, "skipping JWK without a signing algorithm");
                continue;
            };
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    cache.keys.insert(kid, VerifyingKey { key, algorithm });
                }
                Err(err) => warn!(kid = %kid, error = %err, "skipping unusable JWK"),
            }
        }
        cache
    }

    /// Fetches and parses the key set at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the body is not a JWKS.
    pub async fn fetch(url: &str) -> anyhow::Result<Self> {
        let set: JwkSet = reqwest::get(url)
            .await?
            .error_for_status()?
            .json()
            .await?;
        let cache = Self::from_set(&set);
        tracing::info!(url, keys = cache.len(), "loaded JWKS");
        Ok(cache)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn verify(&self, token: &str) -> Result<serde_json::Value, AuthError> {
        let header = jsonwebtoken::decode_header(token)?;
        let kid = header.kid.ok_or(AuthError::MissingKeyId)?;
        let entry = self
            .keys
            .get(&kid)
            .ok_or_else(|| AuthError::UnknownKey(kid.clone()))?;

        // The key decides the algorithm; a token claiming another one fails.
        let mut validation = Validation::new(entry.algorithm);
        validation.validate_aud = false;
        let data = jsonwebtoken::decode::<serde_json::Value>(token, &entry.key, &validation)?;
        Ok(data.claims)
    }
}

/// The configured authentication mechanism.
pub enum Authenticator {
    None,
    ApiKey(Vec<String>),
    Jwt(JwksCache),
}

impl Authenticator {
    /// Selects the mechanism from configuration, fetching the JWKS if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the JWKS cannot be loaded.
    pub async fn from_config(config: &AuthConfig) -> anyhow::Result<Self> {
        if !config.api_keys.is_empty() {
            if config.jwks_url.is_some() {
                warn!("both API keys and a JWKS URL are configured; using API keys, JWT validation is disabled");
            }
            return Ok(Self::ApiKey(config.api_keys.clone()));
        }

        match &config.jwks_url {
            Some(url) => Ok(Self::Jwt(JwksCache::fetch(url).await?)),
            None => Ok(Self::None),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Checks the request headers. On success returns the JWT claims, if any.
    ///
    /// # Errors
    ///
    /// Returns the reason the credentials were rejected.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Option<serde_json::Value>, AuthError> {
        match self {
            Self::None => Ok(None),
            Self::ApiKey(keys) => {
                let presented = headers
                    .get(API_KEY_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .ok_or(AuthError::MissingApiKey)?;

                let matched = keys.iter().fold(Choice::from(0), |acc, key| {
                    acc | key.as_bytes().ct_eq(presented.as_bytes())
                });
                if bool::from(matched) {
                    Ok(None)
                } else {
                    Err(AuthError::InvalidApiKey)
                }
            }
            Self::Jwt(cache) => {
                let token = headers
                    .get(AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("Bearer "))
                    .ok_or(AuthError::MissingBearer)?;
                cache.verify(token.trim()).map(Some)
            }
        }
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::ApiKey(keys) => write!(f, "ApiKey({} keys)", keys.len()),
            Self::Jwt(cache) => write!(f, "Jwt({} keys)", cache.len()),
        }
    }
}

/// `from_fn_with_state` middleware enforcing the configured [`Authenticator`].
pub async fn auth_middleware(
    State(auth): State<Arc<Authenticator>>,
    mut request: Request,
    next: Next,
) -> Response {
    if !auth.is_enabled() || request.uri().path().starts_with(EXEMPT_PREFIX) {
        return next.run(request).await;
    }

    match auth.authenticate(request.headers()) {
        Ok(claims) => {
            if let Some(claims) = claims {
                request.extensions_mut().insert(AuthClaims(Arc::new(claims)));
            }
            next.run(request).await
        }
        Err(err) => {
            tracing::debug!(error = %err, path = request.uri().path(), "rejected request");
            let encoding = request
                .extensions()
                .get::<Encoding>()
                .copied()
                .unwrap_or_default();
            render_error(encoding, &err.into())
        }
    }
}
