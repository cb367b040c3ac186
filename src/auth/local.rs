//! Local identity backend: [`IdentityProvider`] over the SQLite
//! [`AccountStore`], with the current session persisted to a
//! [`SessionFile`] so it survives restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

use super::error::ProviderError;
use super::feed::{SessionFeed, SessionSubscription};
use super::persist::SessionFile;
use super::store::{Account, AccountError, AccountStore};
use super::traits::{IdentityProvider, RestoredSession, SignedIn, SignedUp};
use super::types::{Session, SessionEventKind};

pub struct LocalIdentity {
    store: Arc<AccountStore>,
    session_file: SessionFile,
    feed: SessionFeed,
    current: Mutex<Option<Session>>,
}

impl LocalIdentity {
    pub fn new(store: Arc<AccountStore>, session_file: SessionFile) -> Self {
        Self {
            store,
            session_file,
            feed: SessionFeed::default(),
            current: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<AccountStore> {
        &self.store
    }

    fn issue(&self, account: &Account) -> Result<Session, ProviderError> {
        let issued = self
            .store
            .create_session(&account.id)
            .map_err(|e| ProviderError::Unavailable(format!("{e:#}")))?;
        let mut session = Session::new(&account.id, issued.token).with_email(&account.email);
        if let Some(expiry) = DateTime::<Utc>::from_timestamp(issued.expires_at, 0) {
            session = session.with_expiry(expiry);
        }
        if let Err(e) = self.session_file.save(&session) {
            tracing::warn!(error = %e, "Could not persist session; it will not survive a restart");
        }
        *self.current.lock() = Some(session.clone());
        Ok(session)
    }

    /// Run a password-hashing store call off the async worker threads.
    async fn blocking<T, F>(&self, f: F) -> Result<T, ProviderError>
    where
        T: Send + 'static,
        F: FnOnce(&AccountStore) -> Result<T, AccountError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?
            .map_err(into_provider_error)
    }
}

fn into_provider_error(err: AccountError) -> ProviderError {
    match err {
        AccountError::EmailTaken(email) => ProviderError::AlreadyRegistered(email),
        AccountError::InvalidCredentials => {
            ProviderError::Rejected("Invalid login credentials".into())
        }
        AccountError::Invalid(detail) => ProviderError::Rejected(detail),
        AccountError::Storage(e) => ProviderError::Unavailable(e.to_string()),
    }
}

#[async_trait]
impl IdentityProvider for LocalIdentity {
    fn name(&self) -> &str {
        "local"
    }

    async fn restore_session(&self) -> Result<RestoredSession, ProviderError> {
        let seq = self.feed.current_seq();
        let persisted = self
            .session_file
            .load()
            .map_err(|e| ProviderError::Unavailable(format!("{e:#}")))?;
        let Some(persisted) = persisted else {
            return Ok(RestoredSession { seq, session: None });
        };

        let stored = self
            .store
            .validate_session(&persisted.access_token)
            .map_err(|e| ProviderError::Unavailable(format!("{e:#}")))?;

        let session = match stored {
            Some(stored) if stored.user_id == persisted.subject_id => {
                tracing::info!(user_id = %stored.user_id, "Restored local session");
                Some(persisted)
            }
            _ => {
                tracing::info!("Persisted session is no longer valid");
                if let Err(e) = self.session_file.clear() {
                    tracing::warn!(error = %e, "Could not remove stale session file");
                }
                None
            }
        };
        *self.current.lock() = session.clone();
        Ok(RestoredSession { seq, session })
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
        let (email, password) = (email.to_string(), password.to_string());
        let account = self
            .blocking(move |store| store.authenticate(&email, &password))
            .await?;
        let session = self.issue(&account)?;
        let seq = self
            .feed
            .emit(SessionEventKind::SignedIn, Some(session.clone()));
        Ok(SignedIn { seq, session })
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<SignedUp, ProviderError> {
        let (email, password) = (email.to_string(), password.to_string());
        let account = self
            .blocking(move |store| store.register(&email, &password))
            .await?;
        let session = self.issue(&account)?;
        let seq = self
            .feed
            .emit(SessionEventKind::SignedIn, Some(session.clone()));
        Ok(SignedUp {
            seq,
            subject_id: account.id,
            email: account.email,
            session: Some(session),
        })
    }

    async fn sign_out(&self) -> Result<u64, ProviderError> {
        let current = self.current.lock().take();
        let token = match current {
            Some(session) => Some(session.access_token),
            None => self
                .session_file
                .load()
                .ok()
                .flatten()
                .map(|s| s.access_token),
        };
        if let Err(e) = self.session_file.clear() {
            tracing::warn!(error = %e, "Could not remove session file");
        }
        if let Some(token) = token {
            self.store
                .revoke_session(&token)
                .map_err(|e| ProviderError::Unavailable(format!("{e:#}")))?;
        }
        Ok(self.feed.emit(SessionEventKind::SignedOut, None))
    }
}
