use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::core::{CoreSettings, DEFAULT_CALL_TIMEOUT_SECS, DEFAULT_MIN_PASSWORD_LEN};
use crate::auth::guard::{Destinations, DEFAULT_ANONYMOUS_ENTRY};
use crate::auth::store::DEFAULT_SESSION_TTL_SECS;
use crate::auth::types::Role;
use crate::integrations::supabase::{SupabaseConfig, DEFAULT_PROFILES_TABLE};

/// Top-level `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory that relative paths resolve against. Not read from the file.
    #[serde(skip)]
    pub flux_dir: PathBuf,
    pub identity: IdentityConfig,
    pub local: LocalConfig,
    pub supabase: SupabaseSection,
    pub auth: AuthConfig,
    pub routes: RoutesConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityBackend {
    #[default]
    Local,
    Supabase,
}

impl std::str::FromStr for IdentityBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "supabase" => Ok(Self::Supabase),
            other => Err(format!(
                "Unknown identity backend '{other}'. Supported values: local, supabase"
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub backend: IdentityBackend,
    /// Where the current session is persisted. Relative to the flux dir.
    pub session_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// SQLite database path. Relative to the flux dir.
    pub database_path: PathBuf,
    pub session_ttl_secs: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("flux.db"),
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupabaseSection {
    pub url: Option<String>,
    pub anon_key: Option<String>,
    pub profiles_table: String,
}

impl Default for SupabaseSection {
    fn default() -> Self {
        Self {
            url: None,
            anon_key: None,
            profiles_table: DEFAULT_PROFILES_TABLE.to_string(),
        }
    }
}

impl SupabaseSection {
    /// Connection settings, if both URL and anon key are present.
    pub fn connection(&self) -> Option<SupabaseConfig> {
        let url = self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())?;
        let anon_key = self.anon_key.as_deref().filter(|k| !k.is_empty())?;
        Some(SupabaseConfig {
            url: url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            profiles_table: self.profiles_table.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Bound on each identity-provider or profile-store call.
    pub call_timeout_secs: u64,
    pub min_password_length: usize,
    /// Let self-service sign-up create `admin` profiles.
    pub allow_admin_signup: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            min_password_length: DEFAULT_MIN_PASSWORD_LEN,
            allow_admin_signup: false,
        }
    }
}

impl AuthConfig {
    pub fn core_settings(&self) -> CoreSettings {
        CoreSettings {
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            min_password_len: self.min_password_length,
            allow_admin_signup: self.allow_admin_signup,
        }
    }
}

/// Landing views. A role set to `None` falls back to the anonymous entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
    pub anonymous_entry: String,
    pub admin: Option<String>,
    pub client: Option<String>,
    pub technician: Option<String>,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            anonymous_entry: DEFAULT_ANONYMOUS_ENTRY.to_string(),
            admin: Some("/dashboard/admin".into()),
            client: Some("/dashboard/client".into()),
            technician: Some("/dashboard/technician".into()),
        }
    }
}

impl RoutesConfig {
    pub fn destinations(&self) -> Destinations {
        let homes = [
            (Role::Admin, &self.admin),
            (Role::Client, &self.client),
            (Role::Technician, &self.technician),
        ];
        homes
            .into_iter()
            .fold(Destinations::new(&self.anonymous_entry), |dest, (role, home)| {
                match home {
                    Some(path) => dest.with_home(role, path),
                    None => dest,
                }
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. `info` or `flux_console=debug`.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".into(),
        }
    }
}
