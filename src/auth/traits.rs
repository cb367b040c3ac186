//! Collaborator contracts consumed by [`AuthCore`](super::core::AuthCore).

use async_trait::async_trait;

use super::error::{ProviderError, StoreError};
use super::feed::SessionSubscription;
use super::types::{Profile, Session};

/// Result of restoring the provider's current session.
#[derive(Debug, Clone)]
pub struct RestoredSession {
    pub seq: u64,
    pub session: Option<Session>,
}

/// Result of a successful password sign-in.
#[derive(Debug, Clone)]
pub struct SignedIn {
    pub seq: u64,
    pub session: Session,
}

/// Result of a successful account creation.
///
/// `session` is `None` when the provider requires out-of-band confirmation
/// before it will issue one.
#[derive(Debug, Clone)]
pub struct SignedUp {
    pub seq: u64,
    pub subject_id: String,
    pub email: String,
    pub session: Option<Session>,
}

/// External authentication provider.
///
/// Owns the raw session and its refresh lifecycle; the core never mutates
/// a session it receives from here.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Restore whatever session the provider currently holds.
    async fn restore_session(&self) -> Result<RestoredSession, ProviderError>;

    /// `seq` of the most recent session change this provider emitted.
    fn current_seq(&self) -> u64;

    /// Subscribe to session-change notifications. Dropping or calling
    /// [`SessionSubscription::unsubscribe`] ends the subscription.
    fn subscribe(&self) -> SessionSubscription;

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<SignedIn, ProviderError>;

    async fn sign_up(&self, email: &str, password: &str) -> Result<SignedUp, ProviderError>;

    /// Invalidate the current session. Returns the `seq` of the sign-out
    /// notification.
    async fn sign_out(&self) -> Result<u64, ProviderError>;
}

/// Record store holding application profiles.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Look up a profile by subject id. `Ok(None)` means no row.
    async fn fetch_profile(&self, id: &str) -> Result<Option<Profile>, StoreError>;

    /// Insert a new profile row. Must fail with [`StoreError::Duplicate`]
    /// when a row with the same id exists.
    async fn insert_profile(&self, profile: &Profile) -> Result<(), StoreError>;
}
