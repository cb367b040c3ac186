//! Identity value types shared by the core, the guard and the backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::AuthError;

// ── Roles and profiles ───────────────────────────────────────────

/// Application role attached to a profile row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Client,
    Technician,
}

impl Role {
    /// Lowercase wire name, as stored in the profiles table.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Client => "client",
            Self::Technician => "technician",
        }
    }

    /// Parse a stored role name (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Self::Admin),
            "client" => Some(Self::Client),
            "technician" => Some(Self::Technician),
            _ => None,
        }
    }

    pub fn all() -> &'static [Role] {
        &[Self::Admin, Self::Client, Self::Technician]
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| {
            format!("Unknown role '{s}'. Supported values: admin, client, technician")
        })
    }
}

/// Application-level identity record, keyed by the session subject id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub email: String,
    pub role: Role,
}

// ── Provider session ─────────────────────────────────────────────

/// Credential bundle issued by the identity provider.
///
/// The core only ever reads [`Session::subject_id`]; the remaining fields
/// belong to whichever backend issued the session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub subject_id: String,
    pub email: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(subject_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            email: None,
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether the access token has passed its expiry (sessions without
    /// an expiry never expire client-side).
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("subject_id", &self.subject_id)
            .field("email", &self.email)
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// ── Change notifications ─────────────────────────────────────────

/// What caused a session change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionEventKind {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// A session-change notification from the identity provider.
///
/// `seq` is assigned by the provider and strictly increases per provider
/// instance. Results of imperative provider calls carry the `seq` of the
/// notification they caused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionChange {
    pub seq: u64,
    pub kind: SessionEventKind,
    pub session: Option<Session>,
}

// ── Published state ──────────────────────────────────────────────

/// Whether the first session-restore attempt has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Readiness {
    #[default]
    Initializing,
    Ready,
}

/// Sub-state derived from an [`AuthState`] snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuthPhase {
    Initializing,
    Anonymous,
    Authenticating,
    Authenticated,
    AuthenticatedProfileMissing,
}

/// The core's published snapshot.
///
/// Snapshots are replaced whole; `session` and `profile` are always
/// written in the same transition.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthState {
    pub session: Option<Session>,
    pub profile: Option<Profile>,
    pub readiness: Readiness,
    pub last_error: Option<AuthError>,
    /// Imperative operations (sign in/up/out) currently running.
    pub operations_in_flight: u32,
}

impl AuthState {
    pub fn is_ready(&self) -> bool {
        self.readiness == Readiness::Ready
    }

    pub fn role(&self) -> Option<Role> {
        self.profile.as_ref().map(|p| p.role)
    }

    pub fn phase(&self) -> AuthPhase {
        if self.readiness == Readiness::Initializing {
            return AuthPhase::Initializing;
        }
        if self.operations_in_flight > 0 {
            return AuthPhase::Authenticating;
        }
        match (&self.session, &self.profile) {
            (None, _) => AuthPhase::Anonymous,
            (Some(session), Some(profile)) if profile.id == session.subject_id => {
                AuthPhase::Authenticated
            }
            (Some(_), _) => AuthPhase::AuthenticatedProfileMissing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::error::AuthErrorKind;

    fn profile(id: &str, role: Role) -> Profile {
        Profile {
            id: id.into(),
            email: format!("{id}@x.com"),
            role,
        }
    }

    #[test]
    fn role_wire_names_are_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Technician).unwrap(), "\"technician\"");
        let parsed: Role = serde_json::from_str("\"admin\"").unwrap();
        assert_eq!(parsed, Role::Admin);
        assert!(serde_json::from_str::<Role>("\"owner\"").is_err());
    }

    #[test]
    fn role_parse_is_case_insensitive() {
        assert_eq!(Role::parse(" Client "), Some(Role::Client));
        assert_eq!(Role::parse("superuser"), None);
        assert!("owner".parse::<Role>().unwrap_err().contains("Unknown role"));
    }

    #[test]
    fn session_debug_redacts_tokens() {
        let session = Session::new("u1", "secret-access").with_refresh_token("secret-refresh");
        let rendered = format!("{session:?}");
        assert!(rendered.contains("u1"));
        assert!(!rendered.contains("secret-access"));
        assert!(!rendered.contains("secret-refresh"));
    }

    #[test]
    fn session_expiry_check() {
        let now = Utc::now();
        let past = Session::new("u1", "t").with_expiry(now - chrono::Duration::seconds(5));
        let future = Session::new("u1", "t").with_expiry(now + chrono::Duration::seconds(5));
        assert!(past.is_expired_at(now));
        assert!(!future.is_expired_at(now));
        assert!(!Session::new("u1", "t").is_expired_at(now));
    }

    #[test]
    fn phase_is_initializing_before_ready() {
        let state = AuthState {
            session: Some(Session::new("u1", "t")),
            profile: Some(profile("u1", Role::Client)),
            ..AuthState::default()
        };
        assert_eq!(state.phase(), AuthPhase::Initializing);
    }

    #[test]
    fn phase_derivation_when_ready() {
        let mut state = AuthState {
            readiness: Readiness::Ready,
            ..AuthState::default()
        };
        assert_eq!(state.phase(), AuthPhase::Anonymous);

        state.session = Some(Session::new("u1", "t"));
        assert_eq!(state.phase(), AuthPhase::AuthenticatedProfileMissing);

        state.profile = Some(profile("u1", Role::Client));
        assert_eq!(state.phase(), AuthPhase::Authenticated);
        assert_eq!(state.role(), Some(Role::Client));

        state.operations_in_flight = 1;
        assert_eq!(state.phase(), AuthPhase::Authenticating);
    }

    #[test]
    fn mismatched_profile_is_not_authenticated() {
        let state = AuthState {
            readiness: Readiness::Ready,
            session: Some(Session::new("u1", "t")),
            profile: Some(profile("u2", Role::Admin)),
            last_error: Some(AuthError::new(AuthErrorKind::ProfileNotFound, "u1")),
            operations_in_flight: 0,
        };
        assert_eq!(state.phase(), AuthPhase::AuthenticatedProfileMissing);
    }
}
