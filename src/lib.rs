//! FLUX console session and role authorization.
//!
//! - [`auth`]: the session core, route guard and local identity backend
//! - [`integrations`]: the Supabase identity backend
//! - [`console`]: route table and navigation
//! - [`config`]: `config.toml` with environment overrides

pub mod auth;
pub mod config;
pub mod console;
pub mod integrations;

pub use auth::{AuthCore, AuthError, AuthErrorKind, AuthPhase, AuthState, Role, RouteGuard};
pub use config::Config;
pub use console::Navigator;
