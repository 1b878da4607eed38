//! Password hashing and verification using Argon2id

use crate::{config::SecurityConfig, error::AppError};
use argon2::{
    password_hash::{
        rand_core::OsRng, PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString,
    },
    Algorithm, Argon2, Params, Version,
};

/// 任何配置下都不允许低于该长度
pub const MIN_PASSWORD_LENGTH: usize = 6;

/// Password hasher with configurable parameters
pub struct PasswordHasher {
    argon2: Argon2<'static>,
    /// 未知邮箱时用于对齐耗时的哈希
    dummy_hash: Option<String>,
}

impl PasswordHasher {
    /// Create hasher from the configured Argon2 cost parameters
    pub fn from_config(config: &SecurityConfig) -> Result<Self, AppError> {
        let params = Params::new(
            config.argon2_memory_kib,
            config.argon2_iterations,
            config.argon2_parallelism,
            None,
        )
        .map_err(|e| AppError::Config(format!("Invalid Argon2 params: {}", e)))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut hasher = Self {
            argon2,
            dummy_hash: None,
        };
        hasher.dummy_hash = hasher.hash("timing-equalisation-placeholder").ok();

        Ok(hasher)
    }

    /// Hash a password
    pub fn hash(&self, password: &str) -> Result<String, AppError> {
        let salt = SaltString::generate(&mut OsRng);

        let password_hash = self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| {
                tracing::error!("Failed to hash password: {:?}", e);
                AppError::Internal(format!("Failed to hash password: {}", e))
            })?
            .to_string();

        Ok(password_hash)
    }

    /// Verify a password against a stored hash
    ///
    /// Ok(false) on mismatch; a hash that cannot be parsed is an internal error.
    pub fn verify(&self, password: &str, hash: &str) -> Result<bool, AppError> {
        let parsed_hash = PasswordHash::new(hash).map_err(|e| {
            tracing::error!("Stored password hash is corrupted: {:?}", e);
            AppError::Internal(format!("Failed to parse password hash: {}", e))
        })?;

        Ok(self
            .argon2
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok())
    }

    /// Run one verification against a throwaway hash so that unknown
    /// accounts take as long to reject as wrong passwords
    pub fn verify_dummy(&self, password: &str) {
        if let Some(hash) = &self.dummy_hash {
            let _ = self.verify(password, hash);
        }
    }
}

/// Password policy
#[derive(Debug, Clone)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub require_uppercase: bool,
    pub require_digit: bool,
    pub require_special: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: MIN_PASSWORD_LENGTH,
            require_uppercase: false,
            require_digit: false,
            require_special: false,
        }
    }
}

impl PasswordPolicy {
    pub fn from_config(config: &SecurityConfig) -> Self {
        Self {
            min_length: config.password_min_length.max(MIN_PASSWORD_LENGTH),
            require_uppercase: config.password_require_uppercase,
            require_digit: config.password_require_digit,
            require_special: config.password_require_special,
        }
    }

    /// Validate password against policy
    pub fn validate(&self, password: &str) -> Result<(), AppError> {
        // Check length (in characters, not bytes)
        if password.chars().count() < self.min_length.max(MIN_PASSWORD_LENGTH) {
            return Err(AppError::WeakCredential(format!(
                "Password must be at least {} characters",
                self.min_length.max(MIN_PASSWORD_LENGTH)
            )));
        }

        // Check uppercase
        if self.require_uppercase && !password.chars().any(|c| c.is_uppercase()) {
            return Err(AppError::WeakCredential(
                "Password must contain at least one uppercase letter".to_string(),
            ));
        }

        // Check digit
        if self.require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
            return Err(AppError::WeakCredential(
                "Password must contain at least one digit".to_string(),
            ));
        }

        // Check special character
        if self.require_special && !password.chars().any(|c| !c.is_alphanumeric()) {
            return Err(AppError::WeakCredential(
                "Password must contain at least one special character".to_string(),
            ));
        }

        Ok(())
    }
}
