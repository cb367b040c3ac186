//! Supabase identity backend.
//!
//! Provides:
//! - [`SupabaseIdentity`]: an [`IdentityProvider`] over the GoTrue auth REST API
//!   (password sign-in, sign-up, refresh, logout)
//! - [`SupabaseProfiles`]: a [`ProfileStore`] over a PostgREST table
//!   (default `users`, columns `id, email, role`)
//!
//! ## Design
//! - HTTP client (reqwest) against `/auth/v1/*` and `/rest/v1/<table>`
//! - Anon-key authentication; profile reads and writes carry the signed-in
//!   user's access token so Row Level Security applies
//! - The session is persisted to a local [`SessionFile`]; an expired one is
//!   refreshed during restore and announced as `TOKEN_REFRESHED`

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::error::{ProviderError, StoreError};
use crate::auth::feed::{SessionFeed, SessionSubscription};
use crate::auth::persist::SessionFile;
use crate::auth::traits::{IdentityProvider, ProfileStore, RestoredSession, SignedIn, SignedUp};
use crate::auth::types::{Profile, Role, Session, SessionEventKind};

/// Default PostgREST table holding profile rows.
pub const DEFAULT_PROFILES_TABLE: &str = "users";

/// Refresh a persisted session this long before its recorded expiry.
const EXPIRY_MARGIN_SECS: i64 = 30;

/// PostgreSQL unique-violation code as surfaced by PostgREST.
const PG_UNIQUE_VIOLATION: &str = "23505";

// ── Configuration ────────────────────────────────────────────────

/// Supabase connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupabaseConfig {
    /// Supabase project URL (e.g., https://xxxx.supabase.co).
    pub url: String,
    /// Public anon key.
    pub anon_key: String,
    /// Table holding `id, email, role` profile rows.
    #[serde(default = "default_profiles_table")]
    pub profiles_table: String,
}

fn default_profiles_table() -> String {
    DEFAULT_PROFILES_TABLE.to_string()
}

// ── Wire models ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GoTrueUser {
    id: String,
    email: Option<String>,
}

/// GoTrue token grant / auto-confirmed sign-up response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    expires_at: Option<i64>,
    user: GoTrueUser,
}

impl TokenResponse {
    fn into_session(self) -> Session {
        let expires_at = self
            .expires_at
            .and_then(|at| DateTime::<Utc>::from_timestamp(at, 0))
            .or_else(|| {
                self.expires_in
                    .map(|secs| Utc::now() + ChronoDuration::seconds(secs))
            });
        let mut session = Session::new(self.user.id, self.access_token);
        if let Some(email) = self.user.email {
            session = session.with_email(email);
        }
        if let Some(refresh) = self.refresh_token {
            session = session.with_refresh_token(refresh);
        }
        if let Some(at) = expires_at {
            session = session.with_expiry(at);
        }
        session
    }
}

/// Sign-up returns a token response when auto-confirm is on, otherwise the
/// bare user record.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(TokenResponse),
    User(GoTrueUser),
}

/// GoTrue error bodies have used several shapes across versions.
#[derive(Debug, Default, Deserialize)]
struct GoTrueError {
    error: Option<String>,
    error_description: Option<String>,
    error_code: Option<String>,
    msg: Option<String>,
    message: Option<String>,
}

impl GoTrueError {
    fn message(&self) -> String {
        self.error_description
            .as_deref()
            .or(self.msg.as_deref())
            .or(self.message.as_deref())
            .or(self.error.as_deref())
            .unwrap_or("unknown error")
            .to_string()
    }

    fn is_already_registered(&self) -> bool {
        self.error_code.as_deref() == Some("user_already_exists")
            || self.message().to_ascii_lowercase().contains("already registered")
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ProfileRow {
    id: String,
    email: String,
    role: String,
}

#[derive(Debug, Default, Deserialize)]
struct PostgrestError {
    code: Option<String>,
    message: Option<String>,
}

// ── Supabase client ──────────────────────────────────────────────

/// Shared HTTP plumbing for the auth and REST endpoints.
pub struct SupabaseClient {
    config: SupabaseConfig,
    http: reqwest::Client,
}

impl SupabaseClient {
    pub fn new(config: SupabaseConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self { config, http })
    }

    pub fn config(&self) -> &SupabaseConfig {
        &self.config
    }

    fn auth_url(&self, endpoint: &str) -> String {
        format!("{}/auth/v1/{}", self.config.url, endpoint)
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.url, table)
    }

    /// `apikey` plus a bearer token: the user's when signed in, else the anon key.
    fn auth_headers(&self, access_token: Option<&str>) -> Vec<(&'static str, String)> {
        let bearer = access_token.unwrap_or(&self.config.anon_key);
        vec![
            ("apikey", self.config.anon_key.clone()),
            ("Authorization", format!("Bearer {bearer}")),
        ]
    }

    fn post(&self, url: String, access_token: Option<&str>) -> reqwest::RequestBuilder {
        let mut request = self.http.post(url);
        for (key, value) in self.auth_headers(access_token) {
            request = request.header(key, value);
        }
        request
    }

    async fn grant(
        &self,
        grant_type: &str,
        body: serde_json::Value,
    ) -> Result<TokenResponse, ProviderError> {
        let url = format!("{}?grant_type={grant_type}", self.auth_url("token"));
        let resp = self.post(url, None).json(&body).send().await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }
        let err: GoTrueError = resp.json().await.unwrap_or_default();
        if status.is_client_error() {
            Err(ProviderError::Rejected(err.message()))
        } else {
            Err(ProviderError::Unavailable(format!("{status}: {}", err.message())))
        }
    }
}

// ── Identity provider ────────────────────────────────────────────

pub struct SupabaseIdentity {
    client: Arc<SupabaseClient>,
    session_file: SessionFile,
    feed: SessionFeed,
    current: Mutex<Option<Session>>,
}

impl SupabaseIdentity {
    pub fn new(client: Arc<SupabaseClient>, session_file: SessionFile) -> Self {
        Self {
            client,
            session_file,
            feed: SessionFeed::default(),
            current: Mutex::new(None),
        }
    }

    /// Access token of the current session, if any.
    pub fn access_token(&self) -> Option<String> {
        self.current.lock().as_ref().map(|s| s.access_token.clone())
    }

    fn adopt(&self, session: &Session) {
        if let Err(e) = self.session_file.save(session) {
            tracing::warn!(error = %e, "Could not persist Supabase session");
        }
        *self.current.lock() = Some(session.clone());
    }

    fn forget(&self) {
        *self.current.lock() = None;
        if let Err(e) = self.session_file.clear() {
            tracing::warn!(error = %e, "Could not remove session file");
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, ProviderError> {
        let tokens = self
            .client
            .grant(
                "refresh_token",
                serde_json::json!({ "refresh_token": refresh_token }),
            )
            .await?;
        Ok(tokens.into_session())
    }
}

#[async_trait]
impl IdentityProvider for SupabaseIdentity {
    fn name(&self) -> &str {
        "supabase"
    }

    async fn restore_session(&self) -> Result<RestoredSession, ProviderError> {
        let persisted = self
            .session_file
            .load()
            .map_err(|e| ProviderError::Unavailable(format!("{e:#}")))?;
        let Some(persisted) = persisted else {
            return Ok(RestoredSession {
                seq: self.feed.current_seq(),
                session: None,
            });
        };

        let margin = Utc::now() + ChronoDuration::seconds(EXPIRY_MARGIN_SECS);
        if !persisted.is_expired_at(margin) {
            *self.current.lock() = Some(persisted.clone());
            return Ok(RestoredSession {
                seq: self.feed.current_seq(),
                session: Some(persisted),
            });
        }

        let Some(refresh_token) = persisted.refresh_token.clone() else {
            tracing::info!("Persisted session expired without a refresh token");
            self.forget();
            return Ok(RestoredSession {
                seq: self.feed.current_seq(),
                session: None,
            });
        };

        match self.refresh(&refresh_token).await {
            Ok(session) => {
                tracing::info!(user_id = %session.subject_id, "Refreshed persisted session");
                self.adopt(&session);
                let seq = self
                    .feed
                    .emit(SessionEventKind::TokenRefreshed, Some(session.clone()));
                Ok(RestoredSession {
                    seq,
                    session: Some(session),
                })
            }
            Err(ProviderError::Rejected(reason)) => {
                tracing::info!(reason = %reason, "Refresh token rejected; session dropped");
                self.forget();
                Ok(RestoredSession {
                    seq: self.feed.current_seq(),
                    session: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn current_seq(&self) -> u64 {
        self.feed.current_seq()
    }

    fn subscribe(&self) -> SessionSubscription {
        self.feed.subscribe()
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<SignedIn, ProviderError> {
        let tokens = self
            .client
            .grant(
                "password",
                serde_json::json!({ "email": email, "password": password }),
            )
            .await?;
        let session = tokens.into_session();
        tracing::info!(user_id = %session.subject_id, "Supabase sign-in succeeded");

        self.adopt(&session);
        let seq = self
            .feed
            .emit(SessionEventKind::SignedIn, Some(session.clone()));
        Ok(SignedIn { seq, session })
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<SignedUp, ProviderError> {
        let resp = self
            .client
            .post(self.client.auth_url("signup"), None)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let err: GoTrueError = resp.json().await.unwrap_or_default();
            if err.is_already_registered() {
                return Err(ProviderError::AlreadyRegistered(email.to_string()));
            }
            return Err(if status.is_client_error() {
                ProviderError::Rejected(err.message())
            } else {
                ProviderError::Unavailable(format!("{status}: {}", err.message()))
            });
        }

        match resp.json::<SignUpResponse>().await? {
            SignUpResponse::Session(tokens) => {
                let session = tokens.into_session();
                self.adopt(&session);
                let seq = self
                    .feed
                    .emit(SessionEventKind::SignedIn, Some(session.clone()));
                Ok(SignedUp {
                    seq,
                    subject_id: session.subject_id.clone(),
                    email: session.email.clone().unwrap_or_else(|| email.to_string()),
                    session: Some(session),
                })
            }
            SignUpResponse::User(user) => {
                tracing::info!(user_id = %user.id, "Sign-up pending email confirmation");
                Ok(SignedUp {
                    seq: self.feed.current_seq(),
                    subject_id: user.id,
                    email: user.email.unwrap_or_else(|| email.to_string()),
                    session: None,
                })
            }
        }
    }

    async fn sign_out(&self) -> Result<u64, ProviderError> {
        let token = self.access_token();
        self.forget();

        let result = match token {
            Some(token) => {
                let resp = self
                    .client
                    .post(self.client.auth_url("logout"), Some(&token))
                    .send()
                    .await;
                match resp {
                    // 401/404: the token is already invalid server-side.
                    Ok(resp)
                        if resp.status().is_success()
                            || resp.status() == reqwest::StatusCode::UNAUTHORIZED
                            || resp.status() == reqwest::StatusCode::NOT_FOUND =>
                    {
                        Ok(())
                    }
                    Ok(resp) => Err(ProviderError::Unavailable(format!(
                        "logout failed ({})",
                        resp.status()
                    ))),
                    Err(e) => Err(e.into()),
                }
            }
            None => Ok(()),
        };

        let seq = self.feed.emit(SessionEventKind::SignedOut, None);
        result.map(|()| seq)
    }
}

// ── Profile store ────────────────────────────────────────────────

pub struct SupabaseProfiles {
    client: Arc<SupabaseClient>,
    identity: Arc<SupabaseIdentity>,
}

impl SupabaseProfiles {
    pub fn new(client: Arc<SupabaseClient>, identity: Arc<SupabaseIdentity>) -> Self {
        Self { client, identity }
    }
}

#[async_trait]
impl ProfileStore for SupabaseProfiles {
    async fn fetch_profile(&self, id: &str) -> Result<Option<Profile>, StoreError> {
        let token = self.identity.access_token();
        let mut request = self
            .client
            .http
            .get(self.client.table_url(&self.client.config.profiles_table))
            .query(&[("id", format!("eq.{id}")), ("select", "id,email,role".into())]);
        for (key, value) in self.client.auth_headers(token.as_deref()) {
            request = request.header(key, value);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Unavailable(format!("{status}: {body}")));
        }

        let rows: Vec<ProfileRow> = resp
            .json()
            .await
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        let role = Role::parse(&row.role)
            .ok_or_else(|| StoreError::Malformed(format!("unknown role '{}'", row.role)))?;
        Ok(Some(Profile {
            id: row.id,
            email: row.email,
            role,
        }))
    }

    async fn insert_profile(&self, profile: &Profile) -> Result<(), StoreError> {
        let token = self.identity.access_token();
        let row = ProfileRow {
            id: profile.id.clone(),
            email: profile.email.clone(),
            role: profile.role.as_str().to_string(),
        };
        let resp = self
            .client
            .post(
                self.client.table_url(&self.client.config.profiles_table),
                token.as_deref(),
            )
            .header("Prefer", "return=minimal")
            .json(&row)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let err: PostgrestError = resp.json().await.unwrap_or_default();
        if status == reqwest::StatusCode::CONFLICT
            || err.code.as_deref() == Some(PG_UNIQUE_VIOLATION)
        {
            return Err(StoreError::Duplicate(profile.id.clone()));
        }
        Err(StoreError::Unavailable(format!(
            "{status}: {}",
            err.message.unwrap_or_default()
        )))
    }
}

// ── Tests ────────────────────────────────────────────────────────
