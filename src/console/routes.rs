//! The console's route table and navigator.
//!
//! [`Navigator::resolve`] maps a requested path plus the current
//! [`AuthState`] to what the console should do: render, wait, redirect or
//! refuse. Role checks are delegated to [`RouteGuard`].

use crate::auth::guard::{DenyReason, GuardDecision, RedirectReason, RoleSet, RouteGuard};
use crate::auth::types::{AuthPhase, AuthState, Role};

/// Resolves to the signed-in role's own dashboard.
pub const DASHBOARD_ALIAS: &str = "/dashboard";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    Roles(RoleSet),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub path: &'static str,
    pub title: &'static str,
    pub access: Access,
}

pub static ROUTES: &[RouteSpec] = &[
    RouteSpec {
        path: "/login",
        title: "Sign in",
        access: Access::Public,
    },
    RouteSpec {
        path: "/signup",
        title: "Create account",
        access: Access::Public,
    },
    RouteSpec {
        path: "/dashboard/admin",
        title: "Admin dashboard",
        access: Access::Roles(RoleSet::of(&[Role::Admin])),
    },
    RouteSpec {
        path: "/dashboard/client",
        title: "Client dashboard",
        access: Access::Roles(RoleSet::of(&[Role::Client])),
    },
    RouteSpec {
        path: "/dashboard/technician",
        title: "Technician dashboard",
        access: Access::Roles(RoleSet::of(&[Role::Technician])),
    },
    RouteSpec {
        path: "/jobs",
        title: "Jobs",
        access: Access::Roles(RoleSet::ALL),
    },
    RouteSpec {
        path: "/jobs/new",
        title: "New job",
        access: Access::Roles(RoleSet::of(&[Role::Admin, Role::Technician])),
    },
];

/// Outcome of resolving a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    Render(&'static RouteSpec),
    /// Auth state not ready yet.
    Placeholder,
    /// `from` is set when the redirect is to the anonymous entry, so a
    /// successful login can return to the requested path.
    Redirect { to: String, from: Option<String> },
    NotAuthorized { path: String, reason: DenyReason },
}

#[derive(Debug, Clone, Default)]
pub struct Navigator {
    guard: RouteGuard,
}

impl Navigator {
    pub fn new(guard: RouteGuard) -> Self {
        Self { guard }
    }

    pub fn guard(&self) -> &RouteGuard {
        &self.guard
    }

    pub fn lookup(path: &str) -> Option<&'static RouteSpec> {
        let path = normalize(path);
        ROUTES.iter().find(|route| route.path == path)
    }

    pub fn resolve(&self, path: &str, state: &AuthState) -> Navigation {
        let path = normalize(path);

        if path == DASHBOARD_ALIAS {
            return match self.guard.decide(state, RoleSet::ALL) {
                GuardDecision::Render => match state.role() {
                    Some(role) => Navigation::Redirect {
                        to: self.guard.destinations().home_for(role).to_string(),
                        from: None,
                    },
                    None => self.unknown(),
                },
                decision => self.follow(decision, path),
            };
        }

        let Some(route) = ROUTES.iter().find(|route| route.path == path) else {
            tracing::debug!(path = %path, "Unknown route");
            return self.unknown();
        };
        match route.access {
            Access::Public => Navigation::Render(route),
            Access::Roles(required) => match self.guard.decide(state, required) {
                GuardDecision::Render => Navigation::Render(route),
                decision => self.follow(decision, path),
            },
        }
    }

    /// Where to go after a successful sign-in. `from` is the path that was
    /// requested before the login redirect; it is honoured only if the
    /// signed-in role may open it. `None` unless fully authenticated.
    pub fn post_login_destination(&self, state: &AuthState, from: Option<&str>) -> Option<String> {
        if state.phase() != AuthPhase::Authenticated {
            return None;
        }
        let role = state.role()?;
        let home = self.guard.destinations().home_for(role).to_string();
        let Some(from) = from.map(normalize) else {
            return Some(home);
        };
        match Self::lookup(&from) {
            Some(RouteSpec {
                access: Access::Roles(required),
                ..
            }) if required.contains(role) => Some(from),
            _ => Some(home),
        }
    }

    fn unknown(&self) -> Navigation {
        Navigation::Redirect {
            to: self.guard.destinations().anonymous_entry().to_string(),
            from: None,
        }
    }

    fn follow(&self, decision: GuardDecision, path: String) -> Navigation {
        match decision {
            GuardDecision::Placeholder => Navigation::Placeholder,
            GuardDecision::Render => self.unknown(),
            GuardDecision::Redirect {
                to,
                reason: RedirectReason::Anonymous,
            } => Navigation::Redirect {
                to,
                from: Some(path),
            },
            GuardDecision::Redirect {
                to,
                reason: RedirectReason::RoleMismatch(_),
            } => Navigation::Redirect { to, from: None },
            GuardDecision::NotAuthorized(reason) => Navigation::NotAuthorized { path, reason },
        }
    }
}

fn normalize(path: &str) -> String {
    let path = path.trim();
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
