//! Configuration: `~/.flux/config.toml` plus environment overrides.
//!
//! Environment variables win over the file:
//! `FLUX_IDENTITY_BACKEND`, `SUPABASE_URL`, `SUPABASE_ANON_KEY`, `FLUX_LOG`.

mod schema;

pub use schema::{
    AuthConfig, Config, IdentityBackend, IdentityConfig, LocalConfig, LoggingConfig,
    RoutesConfig, SupabaseSection,
};

use anyhow::{bail, Context, Result};
use directories::UserDirs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.toml";
const DEFAULT_SESSION_FILE: &str = "session.json";

impl Config {
    /// Default flux directory (`~/.flux`).
    pub fn default_dir() -> Result<PathBuf> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
        Ok(home.join(".flux"))
    }

    /// Load `<flux_dir>/config.toml` (defaults if absent), apply
    /// environment overrides, then `backend` (a command-line override),
    /// and validate the result.
    pub fn load(flux_dir: Option<&Path>, backend: Option<IdentityBackend>) -> Result<Self> {
        let flux_dir = match flux_dir {
            Some(dir) => dir.to_path_buf(),
            None => Self::default_dir()?,
        };
        Self::assemble(flux_dir, |key| std::env::var(key).ok(), backend)
    }

    fn assemble(
        flux_dir: PathBuf,
        lookup: impl Fn(&str) -> Option<String>,
        backend: Option<IdentityBackend>,
    ) -> Result<Self> {
        let mut config = Self::load_file(&flux_dir.join(CONFIG_FILE))?;
        config.flux_dir = flux_dir;
        config.apply_env_overrides(lookup);
        if let Some(backend) = backend {
            config.identity.backend = backend;
        }
        config.validate()?;
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file; using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(backend) = lookup("FLUX_IDENTITY_BACKEND") {
            match backend.parse() {
                Ok(backend) => self.identity.backend = backend,
                Err(e) => tracing::warn!(error = %e, "Ignoring FLUX_IDENTITY_BACKEND"),
            }
        }
        if let Some(url) = lookup("SUPABASE_URL") {
            self.supabase.url = Some(url);
        }
        if let Some(key) = lookup("SUPABASE_ANON_KEY") {
            self.supabase.anon_key = Some(key);
        }
        if let Some(level) = lookup("FLUX_LOG") {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth.call_timeout_secs == 0 {
            bail!("auth.call_timeout_secs must be greater than zero");
        }
        if !self.routes.anonymous_entry.starts_with('/') {
            bail!(
                "routes.anonymous_entry must be an absolute path, got '{}'",
                self.routes.anonymous_entry
            );
        }
        if self.identity.backend == IdentityBackend::Supabase && self.supabase.connection().is_none() {
            bail!("Supabase backend selected but supabase.url / supabase.anon_key are not set");
        }
        Ok(())
    }

    /// Resolve a configured path against the flux dir.
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.flux_dir.join(path)
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve(&self.local.database_path)
    }

    pub fn session_file_path(&self) -> PathBuf {
        let configured = self
            .identity
            .session_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SESSION_FILE));
        self.resolve(&configured)
    }

    pub fn config_path(&self) -> PathBuf {
        self.flux_dir.join(CONFIG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::Role;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_file() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load_file(&tmp.path().join("config.toml")).unwrap();

        assert_eq!(config.identity.backend, IdentityBackend::Local);
        assert_eq!(config.auth.call_timeout_secs, 15);
        assert_eq!(config.auth.min_password_length, 6);
        assert!(!config.auth.allow_admin_signup);
        assert_eq!(config.routes.anonymous_entry, "/login");
    }

    #[test]
    fn parses_all_sections() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[identity]
backend = "supabase"
session_file = "/var/lib/flux/session.json"

[local]
database_path = "accounts.db"
session_ttl_secs = 60

[supabase]
url = "https://demo.supabase.co/"
anon_key = "anon"
profiles_table = "profiles"

[auth]
call_timeout_secs = 5
min_password_length = 10
allow_admin_signup = true

[routes]
anonymous_entry = "/welcome"
client = "/jobs"

[logging]
level = "debug"
"#,
        )
        .unwrap();

        let mut config = Config::load_file(&path).unwrap();
        config.flux_dir = tmp.path().to_path_buf();
        config.validate().unwrap();

        assert_eq!(config.identity.backend, IdentityBackend::Supabase);
        assert_eq!(config.session_file_path(), PathBuf::from("/var/lib/flux/session.json"));
        assert_eq!(config.database_path(), tmp.path().join("accounts.db"));
        assert_eq!(config.local.session_ttl_secs, 60);

        let supabase = config.supabase.connection().unwrap();
        assert_eq!(supabase.url, "https://demo.supabase.co");
        assert_eq!(supabase.profiles_table, "profiles");

        let settings = config.auth.core_settings();
        assert_eq!(settings.call_timeout, Duration::from_secs(5));
        assert_eq!(settings.min_password_len, 10);
        assert!(settings.allow_admin_signup);

        // Omitted role keys in a present [routes] table keep their defaults.
        let destinations = config.routes.destinations();
        assert_eq!(destinations.anonymous_entry(), "/welcome");
        assert_eq!(destinations.home_for(Role::Client), "/jobs");
        assert_eq!(destinations.home_for(Role::Admin), "/dashboard/admin");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = Config::default();
        config.apply_env_overrides(env(&[
            ("FLUX_IDENTITY_BACKEND", "Supabase"),
            ("SUPABASE_URL", "https://env.supabase.co"),
            ("SUPABASE_ANON_KEY", "env-key"),
            ("FLUX_LOG", "flux_console=trace"),
        ]));

        assert_eq!(config.identity.backend, IdentityBackend::Supabase);
        assert_eq!(config.supabase.url.as_deref(), Some("https://env.supabase.co"));
        assert_eq!(config.supabase.anon_key.as_deref(), Some("env-key"));
        assert_eq!(config.logging.level, "flux_console=trace");
        config.validate().unwrap();
    }

    #[test]
    fn bad_backend_override_is_ignored() {
        let mut config = Config::default();
        config.apply_env_overrides(env(&[("FLUX_IDENTITY_BACKEND", "ldap"), ("FLUX_LOG", " ")]));
        assert_eq!(config.identity.backend, IdentityBackend::Local);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn supabase_without_credentials_is_invalid() {
        let mut config = Config::default();
        config.identity.backend = IdentityBackend::Supabase;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("supabase.url"));
    }

    #[test]
    fn zero_timeout_is_invalid() {
        let mut config = Config::default();
        config.auth.call_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_file_reports_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[auth]\ncall_timeout_secs = \"soon\"\n").unwrap();

        let err = Config::load_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config"));
    }

    #[test]
    fn backend_override_applies_before_validation() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[identity]\nbackend = \"supabase\"\n",
        )
        .unwrap();

        let err = Config::assemble(tmp.path().to_path_buf(), env(&[]), None).unwrap_err();
        assert!(err.to_string().contains("supabase.url"));

        let config = Config::assemble(
            tmp.path().to_path_buf(),
            env(&[("FLUX_IDENTITY_BACKEND", "supabase")]),
            Some(IdentityBackend::Local),
        )
        .unwrap();
        assert_eq!(config.identity.backend, IdentityBackend::Local);
        assert_eq!(config.flux_dir, tmp.path());
    }

    #[test]
    fn relative_paths_resolve_against_flux_dir() {
        let config = Config {
            flux_dir: PathBuf::from("/srv/flux"),
            ..Config::default()
        };
        assert_eq!(config.session_file_path(), PathBuf::from("/srv/flux/session.json"));
        assert_eq!(config.database_path(), PathBuf::from("/srv/flux/flux.db"));
        assert_eq!(config.config_path(), PathBuf::from("/srv/flux/config.toml"));
    }
}
