//! Error taxonomy for the session core and its collaborators.

use thiserror::Error;

/// Classified failure recorded in `AuthState::last_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum AuthErrorKind {
    /// Sign-in rejected by the identity provider.
    #[error("invalid email or password")]
    InvalidCredentials,
    /// Sign-up for an email that already has an account.
    #[error("account already registered")]
    AlreadyRegistered,
    /// Session is valid but no profile row matches its subject.
    #[error("profile not found")]
    ProfileNotFound,
    /// Profile insert during sign-up failed.
    #[error("profile write failed")]
    ProfileWriteFailed,
    /// Network or provider-level failure.
    #[error("identity provider unavailable")]
    ProviderUnavailable,
    /// Provider-side sign-out failed; local state was cleared anyway.
    #[error("sign-out failed at provider")]
    SignOutFailed,
    /// A provider or profile-store call exceeded the configured timeout.
    #[error("identity call timed out")]
    TimedOut,
    /// Self-service sign-up requested a role that cannot be self-assigned.
    #[error("role cannot be self-assigned")]
    RoleNotSelfAssignable,
    /// Credential rejected locally before contacting the provider.
    #[error("credential does not meet requirements")]
    WeakCredential,
}

/// An [`AuthErrorKind`] plus human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct AuthError {
    pub kind: AuthErrorKind,
    pub detail: String,
}

impl AuthError {
    pub fn new(kind: AuthErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn timed_out(operation: &str) -> Self {
        Self::new(AuthErrorKind::TimedOut, format!("{operation} timed out"))
    }
}

/// Errors returned by an [`IdentityProvider`](super::traits::IdentityProvider).
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider refused the credentials.
    #[error("credentials rejected: {0}")]
    Rejected(String),
    /// An account with this email already exists.
    #[error("already registered: {0}")]
    AlreadyRegistered(String),
    /// Transport or provider-side failure.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Map into the published taxonomy.
    pub fn into_auth_error(self) -> AuthError {
        let kind = match &self {
            Self::Rejected(_) => AuthErrorKind::InvalidCredentials,
            Self::AlreadyRegistered(_) => AuthErrorKind::AlreadyRegistered,
            Self::Unavailable(_) => AuthErrorKind::ProviderUnavailable,
        };
        AuthError::new(kind, self.to_string())
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Errors returned by a [`ProfileStore`](super::traits::ProfileStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// A profile row with this id already exists.
    #[error("duplicate profile id: {0}")]
    Duplicate(String),
    /// The stored row could not be decoded (e.g. unknown role).
    #[error("malformed profile row: {0}")]
    Malformed(String),
    /// Storage backend failure.
    #[error("profile store unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::Unavailable(format!("{err:#}"))
    }
}
