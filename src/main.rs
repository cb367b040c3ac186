use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use flux_console::auth::{
    AccountStore, AuthCore, AuthState, LocalIdentity, Role, RouteGuard, SessionFile,
};
use flux_console::config::{Config, IdentityBackend};
use flux_console::console::{Access, Navigation, Navigator, ROUTES};
use flux_console::integrations::{SupabaseClient, SupabaseIdentity, SupabaseProfiles};

/// FLUX operations console.
#[derive(Parser, Debug)]
#[command(name = "flux", version, about)]
struct Cli {
    /// Config/data directory (default: ~/.flux)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Identity backend override: local or supabase
    #[arg(long, global = true)]
    backend: Option<IdentityBackend>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an account and its profile
    Signup {
        email: String,
        /// admin, client or technician
        #[arg(long, default_value = "client")]
        role: Role,
        /// Read from FLUX_PASSWORD or stdin when omitted
        #[arg(long)]
        password: Option<String>,
    },
    /// Sign in with email and password
    Login {
        email: String,
        #[arg(long)]
        password: Option<String>,
        /// Path requested before the login redirect
        #[arg(long)]
        from: Option<String>,
    },
    /// Sign out
    Logout,
    /// Show the current session and profile
    Whoami,
    /// Resolve a console path for the current session
    Open { path: String },
    /// List the console's routes
    Routes,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let logging = init_logging();

    let config = Config::load(cli.dir.as_deref(), cli.backend)?;
    logging.apply_config_level(&config.logging.level);

    let navigator = Navigator::new(RouteGuard::new(config.routes.destinations()));

    if let Command::Routes = cli.command {
        print_routes();
        return Ok(());
    }

    let core = start_core(&config)?;
    let state = core.ready().await;
    let result = run(cli.command, &core, &navigator, state).await;
    core.shutdown().await;
    result
}

/// Installed subscriber whose filter the config file may still replace.
struct Logging {
    filter: reload::Handle<EnvFilter, Registry>,
    /// `RUST_LOG` was set and wins over the config file.
    from_env: bool,
}

impl Logging {
    fn apply_config_level(&self, level: &str) {
        if self.from_env {
            return;
        }
        match EnvFilter::try_new(level) {
            Ok(filter) => {
                if let Err(e) = self.filter.reload(filter) {
                    tracing::warn!(error = %e, "Could not apply configured log level");
                }
            }
            Err(e) => tracing::warn!(level, error = %e, "Ignoring invalid logging.level"),
        }
    }
}

/// Start logging before the config is read; `RUST_LOG`, then `FLUX_LOG`,
/// then `warn` until [`Logging::apply_config_level`] runs.
fn init_logging() -> Logging {
    let (filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (
            std::env::var("FLUX_LOG")
                .ok()
                .and_then(|level| EnvFilter::try_new(level).ok())
                .unwrap_or_else(|| EnvFilter::new("warn")),
            false,
        ),
    };
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    Logging {
        filter: handle,
        from_env,
    }
}

fn start_core(config: &Config) -> Result<AuthCore> {
    let settings = config.auth.core_settings();
    let session_file = SessionFile::new(config.session_file_path());

    match config.identity.backend {
        IdentityBackend::Local => {
            let store = Arc::new(AccountStore::open(
                &config.database_path(),
                Some(config.local.session_ttl_secs),
            )?);
            let identity = Arc::new(LocalIdentity::new(store.clone(), session_file));
            Ok(AuthCore::start(identity, store, settings))
        }
        IdentityBackend::Supabase => {
            let connection = config
                .supabase
                .connection()
                .context("supabase.url and supabase.anon_key are required")?;
            let client = Arc::new(SupabaseClient::new(connection)?);
            let identity = Arc::new(SupabaseIdentity::new(client.clone(), session_file));
            let profiles = Arc::new(SupabaseProfiles::new(client, identity.clone()));
            Ok(AuthCore::start(identity, profiles, settings))
        }
    }
}

async fn run(
    command: Command,
    core: &AuthCore,
    navigator: &Navigator,
    state: AuthState,
) -> Result<()> {
    match command {
        Command::Signup {
            email,
            role,
            password,
        } => {
            let password = read_password(password)?;
            let state = core.sign_up(&email, &password, role).await?;
            if state.session.is_none() {
                println!("Account created for {email}. Confirm your email, then run `flux login`.");
            } else {
                print_state(&state);
                if let Some(dest) = navigator.post_login_destination(&state, None) {
                    println!("Next: {dest}");
                }
            }
        }
        Command::Login {
            email,
            password,
            from,
        } => {
            let password = read_password(password)?;
            let state = core.sign_in(&email, &password).await?;
            print_state(&state);
            if let Some(dest) = navigator.post_login_destination(&state, from.as_deref()) {
                println!("Next: {dest}");
            }
        }
        Command::Logout => {
            core.sign_out().await?;
            println!("Signed out.");
        }
        Command::Whoami => print_state(&state),
        Command::Open { path } => match navigator.resolve(&path, &state) {
            Navigation::Render(route) => println!("{} ({})", route.title, route.path),
            Navigation::Placeholder => println!("Loading..."),
            Navigation::Redirect { to, from: Some(from) } => {
                println!("Redirect to {to} (return to {from} after login)");
            }
            Navigation::Redirect { to, from: None } => println!("Redirect to {to}"),
            Navigation::NotAuthorized { path, reason } => {
                anyhow::bail!("Not authorized to open {path}: {reason:?}");
            }
        },
        Command::Routes => print_routes(),
    }
    Ok(())
}

fn print_state(state: &AuthState) {
    println!("Status:  {:?}", state.phase());
    if let Some(session) = &state.session {
        println!("Subject: {}", session.subject_id);
        if let Some(email) = &session.email {
            println!("Email:   {email}");
        }
    }
    if let Some(profile) = &state.profile {
        println!("Role:    {}", profile.role);
    }
    if let Some(err) = &state.last_error {
        println!("Error:   {err}");
    }
}

fn print_routes() {
    for route in ROUTES {
        let access = match route.access {
            Access::Public => "public".to_string(),
            Access::Roles(roles) => roles.to_string(),
        };
        println!("{:<24} {:<22} {access}", route.path, route.title);
    }
}

fn read_password(arg: Option<String>) -> Result<String> {
    if let Some(password) = arg {
        return Ok(password);
    }
    if let Ok(password) = std::env::var("FLUX_PASSWORD") {
        return Ok(password);
    }
    eprint!("Password: ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
