use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

use develoop::config::{AppConfig, ConfigError, StoreBackend};
use develoop::db::{self, PgStore};
use develoop::error::ErrorCode;
use develoop::guard::{GuardView, Navigator, RouteGuard, SIGN_IN_PATH};
use develoop::model::{ProfilePatch, ProjectStatus, Provider};
use develoop::remote::supabase::SupabaseClient;
use develoop::remote::{AuthClient, PostStore, ProfileStore, RemoteError};
use develoop::services::oauth;
use develoop::services::posts::{
    EventFilter, EventForm, PostError, PostService, ProjectFilter, ProjectForm, ProjectStats, filter_events,
    filter_projects,
};
use develoop::services::profile::{ProfileError, ProfileService};
use develoop::state::{AuthError, AuthManager, AuthState};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Post(#[from] PostError),
    #[error("database init failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to bind callback listener: {0}")]
    Bind(#[source] std::io::Error),
    #[error("invalid JSON output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sign-in required")]
    SignInRequired,
    #[error("sign-up requires email confirmation")]
    ConfirmationPending,
}

impl ErrorCode for CliError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Config(e) => e.error_code(),
            Self::Remote(e) => e.error_code(),
            Self::Profile(e) => e.error_code(),
            Self::Auth(e) => e.error_code(),
            Self::Post(e) => e.error_code(),
            Self::Database(_) => "E_DATABASE",
            Self::Bind(_) => "E_CALLBACK_BIND",
            Self::Json(_) => "E_JSON",
            Self::SignInRequired => "E_SIGN_IN_REQUIRED",
            Self::ConfirmationPending => "E_CONFIRMATION_PENDING",
        }
    }

    fn user_message(&self) -> String {
        match self {
            Self::Config(e) => e.user_message(),
            Self::Remote(e) => e.user_message(),
            Self::Profile(e) => e.user_message(),
            Self::Auth(e) => e.user_message(),
            Self::Post(e) => e.user_message(),
            Self::Bind(e) => format!("Could not listen for the sign-in redirect: {e}"),
            Self::SignInRequired => format!("Please sign in first (develoop signin). Redirect: {SIGN_IN_PATH}"),
            Self::ConfirmationPending => "Check your inbox to confirm your email, then sign in.".to_owned(),
            Self::Database(_) | Self::Json(_) => develoop::error::GENERIC_FAILURE_MESSAGE.to_owned(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "develoop", about = "Develoop club members, events, and project posts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an account with email and password.
    Signup(Credentials),
    /// Sign in with email and password.
    Signin(Credentials),
    /// Sign in with Discord in the browser.
    SigninDiscord {
        #[arg(long, env = "DEVELOOP_CALLBACK_PORT")]
        port: Option<u16>,
    },
    Signout,
    /// Show the signed-in identity and profile.
    Whoami,
    Profile(ProfileCommand),
    /// Recently joined members.
    Members {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    Events(EventsCommand),
    Projects(ProjectsCommand),
}

#[derive(Args, Debug)]
struct Credentials {
    #[arg(long, env = "DEVELOOP_EMAIL")]
    email: String,
    #[arg(long, env = "DEVELOOP_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Args, Debug)]
struct ProfileCommand {
    #[command(subcommand)]
    command: ProfileSubcommand,
}

#[derive(Subcommand, Debug)]
enum ProfileSubcommand {
    /// Show a member's profile, or your own without `--id`.
    Show {
        #[arg(long)]
        id: Option<Uuid>,
    },
    Update {
        #[arg(long)]
        username: Option<String>,
        #[arg(long, conflicts_with = "clear_icon")]
        icon_url: Option<String>,
        #[arg(long)]
        clear_icon: bool,
        #[arg(long, conflicts_with = "clear_message")]
        message: Option<String>,
        #[arg(long)]
        clear_message: bool,
    },
    CheckUsername {
        username: String,
    },
}

#[derive(Args, Debug)]
struct EventsCommand {
    #[command(subcommand)]
    command: EventsSubcommand,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EventFilterArg {
    All,
    Upcoming,
    Completed,
}

#[derive(Subcommand, Debug)]
enum EventsSubcommand {
    List {
        #[arg(long, default_value_t = 50)]
        limit: u32,
        #[arg(long, value_enum, default_value_t = EventFilterArg::All)]
        filter: EventFilterArg,
        #[arg(long, default_value = "")]
        search: String,
    },
    Create {
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: String,
        /// YYYY-MM-DD
        #[arg(long)]
        date: String,
        /// HH:MM
        #[arg(long)]
        time: String,
        #[arg(long)]
        online_url: Option<String>,
        #[arg(long, default_value = "")]
        location: String,
        #[arg(long, default_value = "")]
        max_participants: String,
        /// Comma-separated.
        #[arg(long, default_value = "")]
        tags: String,
    },
}

#[derive(Args, Debug)]
struct ProjectsCommand {
    #[command(subcommand)]
    command: ProjectsSubcommand,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProjectFilterArg {
    All,
    InProgress,
    Completed,
    Planning,
}

#[derive(Subcommand, Debug)]
enum ProjectsSubcommand {
    List {
        #[arg(long, default_value_t = 50)]
        limit: u32,
        #[arg(long, value_enum, default_value_t = ProjectFilterArg::All)]
        filter: ProjectFilterArg,
        #[arg(long, default_value = "")]
        search: String,
    },
    Create {
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: String,
        #[arg(long)]
        content: String,
        #[arg(long, default_value = "")]
        tags: String,
        #[arg(long, default_value = "0")]
        progress: String,
        #[arg(long, default_value = "in-progress")]
        status: String,
        #[arg(long)]
        private: bool,
    },
}

// =============================================================================
// APP WIRING
// =============================================================================

struct App {
    auth: Arc<SupabaseClient>,
    profiles: ProfileService,
    posts: PostService,
    callback_port: u16,
}

impl App {
    async fn from_config(config: AppConfig) -> Result<Self, CliError> {
        let auth = Arc::new(SupabaseClient::new(config.supabase)?);
        let (profile_store, post_store): (Arc<dyn ProfileStore>, Arc<dyn PostStore>) = match config.store {
            StoreBackend::Supabase => (auth.clone(), auth.clone()),
            StoreBackend::Postgres { database_url, max_connections } => {
                let store = Arc::new(PgStore::new(db::init_pool(&database_url, max_connections).await?));
                info!(max_connections, "using direct postgres store");
                (store.clone(), store)
            }
        };
        Ok(Self {
            profiles: ProfileService::new(auth.clone(), profile_store),
            posts: PostService::new(auth.clone(), post_store),
            auth,
            callback_port: config.callback_port,
        })
    }

    /// Start the auth state manager and pass a protected route guard.
    async fn require_user(&self) -> Result<(AuthManager, AuthState), CliError> {
        let manager = AuthManager::start(self.auth.clone(), self.profiles.clone());
        let state = manager.handle().wait_until_ready().await?;
        let guard = RouteGuard::new(&manager.handle(), TerminalNavigator);
        match guard.view() {
            GuardView::Protected => Ok((manager, state)),
            GuardView::Loading | GuardView::Hidden => {
                manager.stop().await;
                Err(CliError::SignInRequired)
            }
        }
    }
}

struct TerminalNavigator;

impl Navigator for TerminalNavigator {
    fn navigate(&self, path: &str) {
        eprintln!("Not signed in. Sign-in page: {path}");
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// COMMANDS
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(code = e.error_code(), error = %e, "command failed");
            eprintln!("{}", e.user_message());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let app = App::from_config(AppConfig::from_env()?).await?;

    match cli.command {
        Command::Signup(creds) => {
            let session = app
                .auth
                .sign_up(&creds.email, &creds.password)
                .await?
                .ok_or(CliError::ConfirmationPending)?;
            print_json(&session.identity)
        }
        Command::Signin(creds) => {
            let session = app.auth.sign_in_with_password(&creds.email, &creds.password).await?;
            print_json(&session.identity)
        }
        Command::SigninDiscord { port } => {
            let port = port.unwrap_or(app.callback_port);
            let listener = TcpListener::bind(("127.0.0.1", port)).await.map_err(CliError::Bind)?;
            let session = oauth::sign_in_with_oauth(app.auth.as_ref(), Provider::Discord, listener, |url| {
                eprintln!("Open this URL in your browser to continue:\n{url}");
            })
            .await?;
            print_json(&session.identity)
        }
        Command::Signout => {
            let manager = AuthManager::start(app.auth.clone(), app.profiles.clone());
            let handle = manager.handle();
            handle.wait_until_ready().await?;
            let result = handle.sign_out().await;
            manager.stop().await;
            result?;
            eprintln!("Signed out.");
            Ok(())
        }
        Command::Whoami => {
            let (manager, state) = app.require_user().await?;
            manager.stop().await;
            print_json(&serde_json::json!({
                "identity": state.identity(),
                "profile": state.profile(),
            }))
        }
        Command::Profile(cmd) => run_profile(&app, cmd.command).await,
        Command::Members { limit } => print_json(&app.profiles.get_public_profiles(limit).await?),
        Command::Events(cmd) => run_events(&app, cmd.command).await,
        Command::Projects(cmd) => run_projects(&app, cmd.command).await,
    }
}

fn text_patch(value: Option<String>, clear: bool) -> Option<Option<String>> {
    if clear { Some(None) } else { value.map(Some) }
}

async fn run_profile(app: &App, command: ProfileSubcommand) -> Result<(), CliError> {
    match command {
        ProfileSubcommand::Show { id: Some(id) } => print_json(&app.profiles.get_profile(Some(id)).await?),
        ProfileSubcommand::Show { id: None } => {
            let (manager, _) = app.require_user().await?;
            let profile = app.profiles.get_profile(None).await;
            manager.stop().await;
            print_json(&profile?)
        }
        ProfileSubcommand::Update { username, icon_url, clear_icon, message, clear_message } => {
            let (manager, _) = app.require_user().await?;
            let patch = ProfilePatch {
                username: username.map(Some),
                icon_url: text_patch(icon_url, clear_icon),
                profile_message: text_patch(message, clear_message),
            };
            let updated = app.profiles.update_profile(&patch).await;
            manager.stop().await;
            print_json(&updated?)
        }
        ProfileSubcommand::CheckUsername { username } => {
            let available = app.profiles.check_username_availability(&username).await?;
            print_json(&serde_json::json!({ "username": username, "available": available }))
        }
    }
}

async fn run_events(app: &App, command: EventsSubcommand) -> Result<(), CliError> {
    match command {
        EventsSubcommand::List { limit, filter, search } => {
            let events = app.posts.list_events(limit).await?;
            let filter = match filter {
                EventFilterArg::All => EventFilter::All,
                EventFilterArg::Upcoming => EventFilter::Upcoming,
                EventFilterArg::Completed => EventFilter::Completed,
            };
            let today = OffsetDateTime::now_utc().date();
            let rows: Vec<_> = filter_events(&events, filter, &search, today)
                .into_iter()
                .map(|e| serde_json::json!({ "event": e, "status": e.status(today) }))
                .collect();
            print_json(&rows)
        }
        EventsSubcommand::Create { title, description, date, time, online_url, location, max_participants, tags } => {
            let (manager, _) = app.require_user().await?;
            let form = EventForm {
                title,
                description,
                date,
                time,
                is_online: online_url.is_some(),
                online_url: online_url.unwrap_or_default(),
                location,
                max_participants,
                tags,
            };
            let created = app.posts.create_event(&form).await;
            manager.stop().await;
            print_json(&created?)
        }
    }
}

async fn run_projects(app: &App, command: ProjectsSubcommand) -> Result<(), CliError> {
    match command {
        ProjectsSubcommand::List { limit, filter, search } => {
            let posts = app.posts.list_projects(limit).await?;
            let filter = match filter {
                ProjectFilterArg::All => ProjectFilter::All,
                ProjectFilterArg::InProgress => ProjectFilter::Status(ProjectStatus::InProgress),
                ProjectFilterArg::Completed => ProjectFilter::Status(ProjectStatus::Completed),
                ProjectFilterArg::Planning => ProjectFilter::Status(ProjectStatus::Planning),
            };
            print_json(&serde_json::json!({
                "stats": ProjectStats::from_posts(&posts),
                "posts": filter_projects(&posts, filter, &search),
            }))
        }
        ProjectsSubcommand::Create { title, description, content, tags, progress, status, private } => {
            let (manager, _) = app.require_user().await?;
            let form = ProjectForm { title, description, content, tags, progress, status, is_public: !private };
            let created = app.posts.create_project(&form).await;
            manager.stop().await;
            print_json(&created?)
        }
    }
}
