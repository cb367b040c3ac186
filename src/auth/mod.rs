//! Session and authorization for the FLUX console.
//!
//! Provides:
//! - [`AuthCore`]: one process-wide, observable [`AuthState`] reconciled from
//!   an [`IdentityProvider`] session and a [`ProfileStore`] profile
//! - [`RouteGuard`]: the render / redirect / deny decision for role-gated views
//! - A local identity backend (SQLite accounts + persisted session file)
//!
//! ## Design Decisions
//! - The core is the only writer of `AuthState`. Readers get snapshots from a
//!   `tokio::sync::watch` channel and never observe a half-applied transition.
//! - Profile fetches are tagged with a generation; a result whose generation
//!   has been superseded is dropped rather than committed.
//! - Provider notifications carry a sequence number so the core can skip
//!   echoes of transitions it already applied itself.

pub mod core;
pub mod error;
pub mod feed;
pub mod guard;
pub mod local;
pub mod persist;
pub mod store;
pub mod traits;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use self::core::{AuthCore, CoreSettings};
pub use error::{AuthError, AuthErrorKind, ProviderError, StoreError};
pub use feed::{SessionFeed, SessionSubscription, SubscriptionEvent};
pub use guard::{DenyReason, Destinations, GuardDecision, RedirectReason, RoleSet, RouteGuard};
pub use local::LocalIdentity;
pub use persist::SessionFile;
pub use store::AccountStore;
pub use traits::{IdentityProvider, ProfileStore, RestoredSession, SignedIn, SignedUp};
pub use types::{AuthPhase, AuthState, Profile, Readiness, Role, Session, SessionChange, SessionEventKind};
