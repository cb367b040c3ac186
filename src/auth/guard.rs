//! Role-based route guard.
//!
//! A pure decision over an [`AuthState`] snapshot; it never triggers a
//! fetch or mutates state.

use std::collections::HashMap;
use std::fmt;

use super::error::AuthErrorKind;
use super::types::{AuthState, Role};

/// Where anonymous callers are sent.
pub const DEFAULT_ANONYMOUS_ENTRY: &str = "/login";

// ── Role sets ───────────────────────────────────────────────────

/// Set of roles permitted on a protected view.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RoleSet(u8);

impl RoleSet {
    pub const EMPTY: Self = Self(0);
    pub const ALL: Self = Self::of(&[Role::Admin, Role::Client, Role::Technician]);

    pub const fn of(roles: &[Role]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < roles.len() {
            bits |= bit(roles[i]);
            i += 1;
        }
        Self(bits)
    }

    #[must_use]
    pub const fn with(self, role: Role) -> Self {
        Self(self.0 | bit(role))
    }

    pub const fn contains(self, role: Role) -> bool {
        self.0 & bit(role) != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Role> {
        Role::all().iter().copied().filter(move |role| self.contains(*role))
    }
}

const fn bit(role: Role) -> u8 {
    match role {
        Role::Admin => 1,
        Role::Client => 1 << 1,
        Role::Technician => 1 << 2,
    }
}

impl FromIterator<Role> for RoleSet {
    fn from_iter<I: IntoIterator<Item = Role>>(iter: I) -> Self {
        iter.into_iter().fold(Self::EMPTY, Self::with)
    }
}

impl fmt::Debug for RoleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for RoleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Role::as_str).collect();
        f.write_str(&names.join(", "))
    }
}

// ── Destinations ────────────────────────────────────────────────

/// Default landing views per role plus the anonymous entry view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destinations {
    anonymous_entry: String,
    homes: HashMap<Role, String>,
}

impl Default for Destinations {
    fn default() -> Self {
        Self::new(DEFAULT_ANONYMOUS_ENTRY)
            .with_home(Role::Admin, "/dashboard/admin")
            .with_home(Role::Client, "/dashboard/client")
            .with_home(Role::Technician, "/dashboard/technician")
    }
}

impl Destinations {
    /// Destinations with no role homes configured.
    pub fn new(anonymous_entry: impl Into<String>) -> Self {
        Self {
            anonymous_entry: anonymous_entry.into(),
            homes: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_home(mut self, role: Role, path: impl Into<String>) -> Self {
        self.homes.insert(role, path.into());
        self
    }

    pub fn anonymous_entry(&self) -> &str {
        &self.anonymous_entry
    }

    /// Home view for `role`. A role without one goes to the anonymous entry.
    pub fn home_for(&self, role: Role) -> &str {
        self.homes
            .get(&role)
            .map_or(self.anonymous_entry.as_str(), String::as_str)
    }
}

// ── Decisions ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectReason {
    /// No session.
    Anonymous,
    /// Authenticated, but the role is not permitted here.
    RoleMismatch(Role),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Session present but the profile could not be established.
    ProfileMissing,
    /// The last operation left an error on the state.
    Error(AuthErrorKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// Still initializing; show a neutral placeholder.
    Placeholder,
    Render,
    Redirect { to: String, reason: RedirectReason },
    /// Fail closed: neither the view nor a redirect loop.
    NotAuthorized(DenyReason),
}

/// Decides whether a protected view may render for the current state.
#[derive(Debug, Clone, Default)]
pub struct RouteGuard {
    destinations: Destinations,
}

impl RouteGuard {
    pub fn new(destinations: Destinations) -> Self {
        Self { destinations }
    }

    pub fn destinations(&self) -> &Destinations {
        &self.destinations
    }

    pub fn decide(&self, state: &AuthState, required: RoleSet) -> GuardDecision {
        if !state.is_ready() {
            return GuardDecision::Placeholder;
        }
        let Some(session) = &state.session else {
            return GuardDecision::Redirect {
                to: self.destinations.anonymous_entry().to_string(),
                reason: RedirectReason::Anonymous,
            };
        };
        if let Some(err) = &state.last_error {
            return GuardDecision::NotAuthorized(DenyReason::Error(err.kind));
        }
        let Some(profile) = state
            .profile
            .as_ref()
            .filter(|p| p.id == session.subject_id)
        else {
            return GuardDecision::NotAuthorized(DenyReason::ProfileMissing);
        };
        if !required.contains(profile.role) {
            return GuardDecision::Redirect {
                to: self.destinations.home_for(profile.role).to_string(),
                reason: RedirectReason::RoleMismatch(profile.role),
            };
        }
        GuardDecision::Render
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::error::AuthError;
    use crate::auth::types::{Profile, Readiness, Session};

    fn signed_in(role: Role) -> AuthState {
        AuthState {
            session: Some(Session::new("u1", "t")),
            profile: Some(Profile {
                id: "u1".into(),
                email: "u1@x.com".into(),
                role,
            }),
            readiness: Readiness::Ready,
            ..AuthState::default()
        }
    }

    #[test]
    fn role_set_membership() {
        let set = RoleSet::of(&[Role::Admin, Role::Technician]);
        assert!(set.contains(Role::Admin));
        assert!(!set.contains(Role::Client));
        assert_eq!(set.iter().count(), 2);
        assert_eq!(set.to_string(), "admin, technician");
        assert!(RoleSet::EMPTY.is_empty());
        assert_eq!(Role::all().iter().copied().collect::<RoleSet>(), RoleSet::ALL);
    }

    #[test]
    fn initializing_shows_placeholder() {
        let guard = RouteGuard::default();
        let state = AuthState {
            session: Some(Session::new("u1", "t")),
            ..AuthState::default()
        };
        assert_eq!(
            guard.decide(&state, RoleSet::ALL),
            GuardDecision::Placeholder
        );
    }

    #[test]
    fn anonymous_goes_to_entry() {
        let guard = RouteGuard::default();
        let state = AuthState {
            readiness: Readiness::Ready,
            ..AuthState::default()
        };
        assert_eq!(
            guard.decide(&state, RoleSet::of(&[Role::Client])),
            GuardDecision::Redirect {
                to: "/login".into(),
                reason: RedirectReason::Anonymous,
            }
        );
    }

    #[test]
    fn permitted_role_renders() {
        let guard = RouteGuard::default();
        assert_eq!(
            guard.decide(&signed_in(Role::Client), RoleSet::of(&[Role::Client])),
            GuardDecision::Render
        );
    }

    #[test]
    fn wrong_role_goes_home() {
        let guard = RouteGuard::default();
        assert_eq!(
            guard.decide(&signed_in(Role::Technician), RoleSet::of(&[Role::Admin])),
            GuardDecision::Redirect {
                to: "/dashboard/technician".into(),
                reason: RedirectReason::RoleMismatch(Role::Technician),
            }
        );
    }

    #[test]
    fn role_without_home_falls_back_to_entry() {
        let guard = RouteGuard::new(
            Destinations::new("/welcome").with_home(Role::Admin, "/dashboard/admin"),
        );
        match guard.decide(&signed_in(Role::Client), RoleSet::of(&[Role::Admin])) {
            GuardDecision::Redirect { to, .. } => assert_eq!(to, "/welcome"),
            other => panic!("expected redirect, got {other:?}"),
        }
    }

    #[test]
    fn missing_profile_fails_closed() {
        let guard = RouteGuard::default();
        let mut state = signed_in(Role::Admin);
        state.profile = None;
        assert_eq!(
            guard.decide(&state, RoleSet::ALL),
            GuardDecision::NotAuthorized(DenyReason::ProfileMissing)
        );

        let mut orphaned = signed_in(Role::Admin);
        orphaned.session = Some(Session::new("u2", "t"));
        assert_eq!(
            guard.decide(&orphaned, RoleSet::ALL),
            GuardDecision::NotAuthorized(DenyReason::ProfileMissing)
        );
    }

    #[test]
    fn recorded_error_fails_closed() {
        let guard = RouteGuard::default();
        let mut state = signed_in(Role::Admin);
        state.last_error = Some(AuthError::new(AuthErrorKind::ProviderUnavailable, "offline"));
        assert_eq!(
            guard.decide(&state, RoleSet::ALL),
            GuardDecision::NotAuthorized(DenyReason::Error(AuthErrorKind::ProviderUnavailable))
        );
    }
}
