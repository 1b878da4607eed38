//! Authentication and authorization module

pub mod jwt;
pub mod middleware;
pub mod password;

pub use jwt::{Claims, JwtService};
pub use middleware::{extract_token, jwt_auth_middleware, require_admin, AuthContext};
pub use password::{PasswordHasher, PasswordPolicy};
