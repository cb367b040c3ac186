//! SQLite-backed account store for the local identity backend.
//!
//! Tables:
//! - `users`: id, email (unique, case-insensitive), password_hash, salt, created_at
//! - `sessions`: token_hash, user_id, created_at, expires_at
//! - `profiles`: id (= users.id), email, role, created_at
//!
//! Passwords use iterated SHA-256 with a per-user salt. Session tokens are
//! opaque hex strings; only their SHA-256 is stored.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use super::error::StoreError;
use super::traits::ProfileStore;
use super::types::{Profile, Role};

/// Default session duration: 30 days (seconds).
pub const DEFAULT_SESSION_TTL_SECS: u64 = 30 * 24 * 3600;

/// Number of SHA-256 iterations for password stretching.
const HASH_ITERATIONS: u32 = 100_000;

/// Salt used for the dummy hash on unknown emails.
const DUMMY_SALT: &str = "00000000000000000000000000000000";

/// A registered account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub created_at: i64,
}

/// A session looked up by token.
#[derive(Debug, Clone)]
pub struct StoredSession {
    pub user_id: String,
    pub email: String,
    pub expires_at: i64,
}

/// A freshly issued session token. The plaintext is only revealed here.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: i64,
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Email '{0}' is already registered")]
    EmailTaken(String),
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
}

/// SQLite-backed account, session and profile store.
pub struct AccountStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
    session_ttl_secs: u64,
}

impl AccountStore {
    /// Open (or create) the account database at the given path.
    pub fn open(db_path: &Path, session_ttl_secs: Option<u64>) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(db_path)?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                password_hash TEXT NOT NULL,
                salt TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                token_hash TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at);

            CREATE TABLE IF NOT EXISTS profiles (
                id TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                email TEXT NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('admin', 'client', 'technician')),
                created_at INTEGER NOT NULL
            );",
        )?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            session_ttl_secs: session_ttl_secs.unwrap_or(DEFAULT_SESSION_TTL_SECS),
        };
        let purged = store.cleanup_expired_sessions()?;
        tracing::debug!(path = %db_path.display(), purged, "Account store opened");

        Ok(store)
    }

    // ── Accounts ────────────────────────────────────────────────────

    /// Register a new account.
    pub fn register(&self, email: &str, password: &str) -> Result<Account, AccountError> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(AccountError::Invalid(format!("'{email}' is not an email address")));
        }
        if email.len() > 254 {
            return Err(AccountError::Invalid("Email too long (max 254 characters)".into()));
        }
        if password.is_empty() {
            return Err(AccountError::Invalid("Password cannot be empty".into()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let salt = generate_salt();
        let password_hash = hash_password(password, &salt);
        let now = epoch_secs() as i64;

        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO users (id, email, password_hash, salt, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![id, email, password_hash, salt, now],
        );

        match result {
            Ok(_) => {
                tracing::info!(user_id = %id, "Account registered");
                Ok(Account {
                    id,
                    email: email.to_string(),
                    created_at: now,
                })
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(AccountError::EmailTaken(email.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Authenticate by email + password.
    pub fn authenticate(&self, email: &str, password: &str) -> Result<Account, AccountError> {
        let conn = self.conn.lock();
        let row: Result<(String, String, String, String, i64), _> = conn.query_row(
            "SELECT id, email, password_hash, salt, created_at FROM users WHERE email = ?1 COLLATE NOCASE",
            rusqlite::params![email.trim()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        );

        match row {
            Ok((id, email, stored_hash, salt, created_at)) => {
                let attempt_hash = hash_password(password, &salt);
                if !constant_time_eq(stored_hash.as_bytes(), attempt_hash.as_bytes()) {
                    return Err(AccountError::InvalidCredentials);
                }
                Ok(Account {
                    id,
                    email,
                    created_at,
                })
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                // Same cost as a real check so unknown emails are not distinguishable by timing.
                let _ = hash_password(password, DUMMY_SALT);
                Err(AccountError::InvalidCredentials)
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Sessions ────────────────────────────────────────────────────

    /// Issue a session token for an authenticated account.
    pub fn create_session(&self, user_id: &str) -> Result<IssuedToken> {
        let token = generate_token();
        let token_hash = hash_token(&token);
        let now = epoch_secs();
        let expires_at = (now + self.session_ttl_secs) as i64;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (token_hash, user_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![token_hash, user_id, now as i64, expires_at],
        )?;

        Ok(IssuedToken { token, expires_at })
    }

    /// Validate a session token. Returns `None` if it is unknown or expired.
    pub fn validate_session(&self, token: &str) -> Result<Option<StoredSession>> {
        let token_hash = hash_token(token);
        let now = epoch_secs() as i64;

        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT s.user_id, u.email, s.expires_at
             FROM sessions s
             JOIN users u ON s.user_id = u.id
             WHERE s.token_hash = ?1 AND s.expires_at > ?2",
            rusqlite::params![token_hash, now],
            |row| {
                Ok(StoredSession {
                    user_id: row.get(0)?,
                    email: row.get(1)?,
                    expires_at: row.get(2)?,
                })
            },
        );

        match row {
            Ok(session) => Ok(Some(session)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn revoke_session(&self, token: &str) -> Result<bool> {
        let token_hash = hash_token(token);
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE token_hash = ?1",
            rusqlite::params![token_hash],
        )?;
        Ok(deleted > 0)
    }

    pub fn cleanup_expired_sessions(&self) -> Result<u64> {
        let now = epoch_secs() as i64;
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE expires_at <= ?1",
            rusqlite::params![now],
        )?;
        Ok(deleted as u64)
    }

    // ── Profiles ────────────────────────────────────────────────────

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&conn.lock()))
            .await
            .map_err(|e| StoreError::Unavailable(format!("profile store task failed: {e}")))?
    }
}

#[async_trait]
impl ProfileStore for AccountStore {
    async fn fetch_profile(&self, id: &str) -> Result<Option<Profile>, StoreError> {
        let id = id.to_string();
        self.blocking(move |conn| query_profile(conn, &id)).await
    }

    async fn insert_profile(&self, profile: &Profile) -> Result<(), StoreError> {
        let profile = profile.clone();
        self.blocking(move |conn| insert_profile_row(conn, &profile)).await
    }
}

// ── Profile rows ────────────────────────────────────────────────────

fn query_profile(conn: &rusqlite::Connection, id: &str) -> Result<Option<Profile>, StoreError> {
    let row: Result<(String, String, String), _> = conn.query_row(
        "SELECT id, email, role FROM profiles WHERE id = ?1",
        rusqlite::params![id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    );

    match row {
        Ok((id, email, role)) => {
            let role = Role::parse(&role)
                .ok_or_else(|| StoreError::Malformed(format!("unknown role '{role}'")))?;
            Ok(Some(Profile { id, email, role }))
        }
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StoreError::Unavailable(e.to_string())),
    }
}

fn insert_profile_row(conn: &rusqlite::Connection, profile: &Profile) -> Result<(), StoreError> {
    let result = conn.execute(
        "INSERT INTO profiles (id, email, role, created_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            profile.id,
            profile.email,
            profile.role.as_str(),
            epoch_secs() as i64
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            Err(StoreError::Duplicate(profile.id.clone()))
        }
        Err(e) => Err(StoreError::Unavailable(e.to_string())),
    }
}

// ── Cryptographic Helpers ───────────────────────────────────────────

/// Random salt (32 hex chars).
fn generate_salt() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Random session token (64 hex chars).
fn generate_token() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Hash a password with salt using iterated SHA-256.
fn hash_password(password: &str, salt: &str) -> String {
    let mut hash = Sha256::new();
    hash.update(salt.as_bytes());
    hash.update(password.as_bytes());
    let mut result = hash.finalize();

    for _ in 1..HASH_ITERATIONS {
        let mut h = Sha256::new();
        h.update(result);
        h.update(salt.as_bytes());
        result = h.finalize();
    }

    hex::encode(result)
}

/// Single-pass SHA-256; tokens are already high-entropy.
fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, AccountStore) {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("accounts.db");
        let store = AccountStore::open(&db_path, Some(3600)).unwrap();
        (tmp, store)
    }

    fn count(store: &AccountStore, table: &str) -> i64 {
        store
            .conn
            .lock()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn register_and_authenticate() {
        let (_tmp, store) = test_store();

        let account = store.register("ana@example.com", "pw123456").unwrap();
        assert!(!account.id.is_empty());

        let authed = store.authenticate("ana@example.com", "pw123456").unwrap();
        assert_eq!(authed, account);
        assert_eq!(count(&store, "users"), 1);
    }

    #[test]
    fn duplicate_email_is_case_insensitive() {
        let (_tmp, store) = test_store();

        store.register("Ana@Example.com", "pw123456").unwrap();
        let err = store.register("ana@example.com", "other-pw").unwrap_err();
        assert!(matches!(err, AccountError::EmailTaken(_)));
        assert_eq!(count(&store, "users"), 1);
    }

    #[test]
    fn wrong_password_and_unknown_email_look_the_same() {
        let (_tmp, store) = test_store();
        store.register("ana@example.com", "right-pw").unwrap();

        let wrong = store.authenticate("ana@example.com", "wrong-pw").unwrap_err();
        let ghost = store.authenticate("ghost@example.com", "right-pw").unwrap_err();
        assert_eq!(wrong.to_string(), ghost.to_string());
        assert!(matches!(ghost, AccountError::InvalidCredentials));
    }

    #[test]
    fn register_rejects_non_email() {
        let (_tmp, store) = test_store();
        assert!(matches!(
            store.register("", "pw123456"),
            Err(AccountError::Invalid(_))
        ));
        assert!(matches!(
            store.register("not-an-email", "pw123456"),
            Err(AccountError::Invalid(_))
        ));
    }

    #[test]
    fn session_lifecycle() {
        let (_tmp, store) = test_store();
        let account = store.register("ana@example.com", "pw123456").unwrap();

        let issued = store.create_session(&account.id).unwrap();
        assert_eq!(issued.token.len(), 64);

        let session = store.validate_session(&issued.token).unwrap().unwrap();
        assert_eq!(session.user_id, account.id);
        assert_eq!(session.email, "ana@example.com");
        assert_eq!(session.expires_at, issued.expires_at);

        assert!(store.revoke_session(&issued.token).unwrap());
        assert!(store.validate_session(&issued.token).unwrap().is_none());
        assert!(!store.revoke_session(&issued.token).unwrap());
    }

    #[test]
    fn expired_sessions_do_not_validate() {
        let tmp = TempDir::new().unwrap();
        let store = AccountStore::open(&tmp.path().join("a.db"), Some(0)).unwrap();
        let account = store.register("ana@example.com", "pw123456").unwrap();

        let issued = store.create_session(&account.id).unwrap();
        assert!(store.validate_session(&issued.token).unwrap().is_none());
        assert_eq!(store.cleanup_expired_sessions().unwrap(), 1);
    }

    #[test]
    fn reopening_purges_expired_sessions() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("a.db");
        {
            let store = AccountStore::open(&db_path, Some(0)).unwrap();
            let account = store.register("ana@example.com", "pw123456").unwrap();
            store.create_session(&account.id).unwrap();
            assert_eq!(count(&store, "sessions"), 1);
        }

        let store = AccountStore::open(&db_path, Some(3600)).unwrap();
        assert_eq!(count(&store, "sessions"), 0);
        assert_eq!(count(&store, "users"), 1);
    }

    #[test]
    fn unknown_token_is_none() {
        let (_tmp, store) = test_store();
        assert!(store.validate_session("nope").unwrap().is_none());
    }

    #[tokio::test]
    async fn profile_for_unknown_account_is_rejected() {
        let (_tmp, store) = test_store();
        let err = store
            .insert_profile(&Profile {
                id: "orphan".into(),
                email: "o@example.com".into(),
                role: Role::Client,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn profile_insert_and_fetch() {
        let (_tmp, store) = test_store();
        let account = store.register("c@example.com", "pw123456").unwrap();
        let profile = Profile {
            id: account.id.clone(),
            email: account.email,
            role: Role::Client,
        };

        store.insert_profile(&profile).await.unwrap();
        assert_eq!(store.fetch_profile(&account.id).await.unwrap(), Some(profile.clone()));
        assert!(store.fetch_profile("missing").await.unwrap().is_none());

        let dup = store.insert_profile(&profile).await.unwrap_err();
        assert!(matches!(dup, StoreError::Duplicate(_)));
    }

    #[test]
    fn password_hash_is_deterministic_with_same_salt() {
        assert_eq!(
            hash_password("pw", "fixed_salt_value"),
            hash_password("pw", "fixed_salt_value")
        );
        assert_ne!(hash_password("pw", "salt_a"), hash_password("pw", "salt_b"));
    }

    #[test]
    fn constant_time_eq_works() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"short", b"longer"));
    }
}
