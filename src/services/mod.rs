//! Business logic services layer

pub mod admin_service;
pub mod audit_service;
pub mod auth_service;
pub mod credential_service;
pub mod fraud_service;
pub mod rate_limiter;
pub mod session_service;
pub mod token_service;

pub use admin_service::AdminService;
pub use audit_service::AuditService;
pub use auth_service::{AuthFlow, AuthService};
pub use credential_service::CredentialService;
pub use fraud_service::FraudService;
pub use rate_limiter::{RateLimitDecision, RateLimiter};
pub use session_service::SessionService;
pub use token_service::TokenService;
