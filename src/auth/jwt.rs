//! JWT access token generation and validation
//!
//! Access tokens are short-lived HS256 JWTs. Refresh tokens are opaque random
//! strings owned by the token service, not JWTs.

use crate::{config::SecurityConfig, error::AppError};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const ACCESS_TOKEN_TYPE: &str = "access";

/// JWT claims for access tokens
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,

    pub email: String,

    /// User roles
    pub roles: Vec<String>,

    /// Token type, always "access"
    pub token_type: String,

    /// Issued at
    pub iat: i64,

    /// Not before
    pub nbf: i64,

    /// Expiration
    pub exp: i64,

    /// JWT ID (unique token identifier, used for revocation)
    pub jti: String,
}

impl Claims {
    pub fn user_id(&self) -> Result<Uuid, AppError> {
        Uuid::parse_str(&self.sub).map_err(|_| AppError::InvalidToken)
    }

    /// Seconds until expiry, zero once expired
    pub fn remaining_secs(&self) -> u64 {
        u64::try_from(self.exp - Utc::now().timestamp()).unwrap_or(0)
    }
}

/// JWT service
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    access_token_exp_secs: u64,
}

impl JwtService {
    /// Create JWT service from config
    pub fn from_config(config: &SecurityConfig) -> Result<Self, AppError> {
        let secret = config.jwt_secret.expose_secret();

        // Ensure secret is at least 32 bytes for HS256
        if secret.len() < 32 {
            return Err(AppError::Config("JWT secret too short (min 32 chars)".to_string()));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_nbf = true;
        validation.leeway = 5;
        validation.set_required_spec_claims(&["exp", "nbf", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            access_token_exp_secs: config.access_token_exp_secs,
        })
    }

    pub fn access_token_exp_secs(&self) -> u64 {
        self.access_token_exp_secs
    }

    /// Generate access token
    pub fn generate_access_token(
        &self,
        user_id: &Uuid,
        email: &str,
        roles: Vec<String>,
    ) -> Result<String, AppError> {
        let now = Utc::now();
        let expiration = now + Duration::seconds(self.access_token_exp_secs as i64);

        let claims = Claims {
            sub: user_id.to_string(),
            email: email.to_string(),
            roles,
            token_type: ACCESS_TOKEN_TYPE.to_string(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expiration.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        self.encode_claims(&claims)
    }

    pub(crate) fn encode_claims(&self, claims: &Claims) -> Result<String, AppError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key).map_err(|e| {
            tracing::error!("Failed to encode access token: {:?}", e);
            AppError::Internal(format!("Failed to encode access token: {}", e))
        })
    }

    /// Validate access token: signature, algorithm, exp/nbf and token type
    ///
    /// Every failure maps to the same `InvalidToken`; the reason only goes to
    /// the debug log.
    pub fn validate_access_token(&self, token: &str) -> Result<Claims, AppError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                tracing::debug!("Token validation failed: {:?}", e);
                AppError::InvalidToken
            })?
            .claims;

        if claims.token_type != ACCESS_TOKEN_TYPE {
            tracing::debug!("Token type mismatch: expected 'access', got '{}'", claims.token_type);
            return Err(AppError::InvalidToken);
        }

        Ok(claims)
    }
}
