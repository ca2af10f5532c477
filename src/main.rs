//! Leadflow CLI entry point

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use leadflow::auth::{handle_google_callback, redirect_uri, wait_for_callback, CallbackParams};
use leadflow::config::Config;
use leadflow::guard::{GuardDecision, Route, RouteGuard};
use leadflow::leads::{Lead, LeadFilter, LeadUpdate, LeadsApi, NewLead};
use leadflow::session::SignupRequest;
use leadflow::{ui, AuthOutcome, SessionManager};

#[derive(Parser)]
#[command(name = "leadflow")]
#[command(about = "Leadflow - client for the lead-management dashboard")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure the backend URL and credential mode
    Init,

    /// Sign in with email and password
    Login {
        #[arg(short, long)]
        email: Option<String>,
    },

    /// Create a new account
    Signup {
        #[arg(short, long)]
        username: Option<String>,

        #[arg(short, long)]
        email: Option<String>,
    },

    /// Sign in with Google
    Google {
        /// Authorization code, or the full callback URL, captured elsewhere
        #[arg(long)]
        code: Option<String>,
    },

    /// Sign out and forget stored credentials
    Logout,

    /// Show the signed-in user
    Whoami,

    /// Show configuration and session state
    Status,

    /// Work with leads (requires sign-in)
    Leads {
        #[command(subcommand)]
        command: LeadsCommand,
    },
}

#[derive(Subcommand)]
enum LeadsCommand {
    /// List leads
    List(FilterArgs),

    /// Count leads
    Count(FilterArgs),

    /// Show one lead
    Get { id: uuid::Uuid },

    /// Create a lead
    Create {
        #[arg(long)]
        business_name: String,

        #[arg(long)]
        industry: String,

        #[arg(long)]
        lead_score: i64,

        #[arg(long)]
        email: Option<String>,

        #[arg(long)]
        country: Option<String>,

        #[arg(long)]
        website: Option<String>,
    },

    /// Update a lead
    Update {
        id: uuid::Uuid,

        #[arg(long)]
        lead_score: Option<i64>,

        #[arg(long)]
        verified: Option<bool>,

        #[arg(long)]
        summary: Option<String>,
    },

    /// Delete a lead
    Delete { id: uuid::Uuid },
}

#[derive(Args)]
struct FilterArgs {
    #[arg(long)]
    industry: Option<String>,

    #[arg(long)]
    min_score: Option<i64>,

    #[arg(long)]
    max_score: Option<i64>,
}

impl From<FilterArgs> for LeadFilter {
    fn from(args: FilterArgs) -> Self {
        LeadFilter {
            industry: args.industry,
            min_lead_score: args.min_score,
            max_lead_score: args.max_score,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => leadflow::config::onboard()?,

        Commands::Login { email } => {
            let (_, manager) = connect().await?;
            run_login(&manager, email).await?;
        }

        Commands::Signup { username, email } => {
            let (_, manager) = connect().await?;
            run_signup(&manager, username, email).await?;
        }

        Commands::Google { code } => {
            let (config, manager) = connect().await?;
            run_google(&manager, &config, code).await?;
        }

        Commands::Logout => {
            let (_, manager) = connect().await?;
            manager.logout().await;
            ui::print_success("Logged out");
        }

        Commands::Whoami => {
            let (_, manager) = connect().await?;
            match manager.session().user {
                Some(user) => {
                    println!("{} <{}>", user.display_name().bold(), user.email);
                    println!("id: {}", user.id);
                }
                None => ui::print_step("Not signed in. Run 'leadflow login'."),
            }
        }

        Commands::Status => {
            let (config, manager) = connect().await?;
            print_status(&manager, &config);
        }

        Commands::Leads { command } => {
            let (_, manager) = connect().await?;
            require_dashboard(&manager)?;
            run_leads(LeadsApi::new(manager), command).await?;
        }
    }

    Ok(())
}

/// Load config and resolve the session before any command looks at it.
async fn connect() -> Result<(Config, SessionManager)> {
    let config = leadflow::config::load_or_default()?;
    let manager = SessionManager::new(leadflow::http::ApiClient::from_config(&config)?);

    let spinner = ui::spinner("Checking session");
    manager.bootstrap().await;
    spinner.finish_and_clear();

    Ok((config, manager))
}

fn report(outcome: &AuthOutcome) -> Result<()> {
    match outcome {
        AuthOutcome::Success { message } => {
            ui::print_success(message);
            Ok(())
        }
        AuthOutcome::Failure { message, field } => {
            match field {
                Some(field) => ui::print_error(&format!("{} ({})", message, field)),
                None => ui::print_error(message),
            }
            bail!("{}", message)
        }
    }
}

async fn run_login(manager: &SessionManager, email: Option<String>) -> Result<()> {
    let email = match email {
        Some(email) => email,
        None => inquire::Text::new("Email:").prompt()?,
    };
    let password = inquire::Password::new("Password:")
        .without_confirmation()
        .prompt()?;

    let spinner = ui::spinner("Signing in");
    let outcome = manager.login(&email, &password).await;
    spinner.finish_and_clear();

    report(&outcome)?;
    if let Some(user) = manager.session().user {
        ui::print_step(&format!("Welcome, {}", user.display_name()));
    }
    Ok(())
}

async fn run_signup(
    manager: &SessionManager,
    username: Option<String>,
    email: Option<String>,
) -> Result<()> {
    let username = match username {
        Some(username) => username,
        None => inquire::Text::new("Username:").prompt()?,
    };
    let email = match email {
        Some(email) => email,
        None => inquire::Text::new("Email:").prompt()?,
    };
    let password = inquire::Password::new("Password:").prompt()?;

    let spinner = ui::spinner("Creating account");
    let outcome = manager
        .signup(&SignupRequest {
            username,
            email,
            password,
        })
        .await;
    spinner.finish_and_clear();

    report(&outcome)?;
    ui::print_step("Run 'leadflow login' to sign in.");
    Ok(())
}

async fn run_google(manager: &SessionManager, config: &Config, code: Option<String>) -> Result<()> {
    let params = match code {
        Some(input) if input.contains('=') => CallbackParams::parse(&input)?,
        Some(code) => CallbackParams {
            code: Some(code),
            ..CallbackParams::default()
        },
        None => {
            let port = config.google.callback_port;
            let url = config.google_login_url();

            ui::print_step(&format!("Sign in at {}", url.cyan()));
            ui::print_step(&format!(
                "The backend must redirect to {}",
                redirect_uri(port)
            ));

            if config.google.open_browser {
                if let Err(e) = open::that(&url) {
                    tracing::warn!("Failed to open browser: {}", e);
                }
            }

            let spinner = ui::spinner("Waiting for Google");
            let params = wait_for_callback(port).await;
            spinner.finish_and_clear();
            params?
        }
    };

    let spinner = ui::spinner("Completing sign-in");
    let route = handle_google_callback(manager, &params).await;
    spinner.finish_and_clear();

    match (route, manager.session().user) {
        (Route::Dashboard, Some(user)) => {
            ui::print_success(&format!("Signed in with Google as {}", user.display_name()));
            Ok(())
        }
        _ => {
            ui::print_error("Google sign-in failed");
            bail!("Google sign-in failed")
        }
    }
}

fn print_status(manager: &SessionManager, config: &Config) {
    ui::print_header("Status", &config.base_url);

    println!("Auth mode: {}", config.auth_mode);
    match config.auth_mode {
        leadflow::config::AuthMode::Token => {
            println!("Credentials: {:?}", leadflow::auth::credentials_path())
        }
        leadflow::config::AuthMode::Cookie => {
            println!("Cookies: {:?}", leadflow::http::cookies_path())
        }
    }

    let state = manager.state();
    match state.user() {
        Some(user) => println!("Session: {} ({})", state.label().green(), user.email),
        None => println!("Session: {}", state.label().yellow()),
    }

    let decision = RouteGuard::default().evaluate(Route::Dashboard, &state);
    println!("Dashboard: {:?}", decision);
}

/// Leads live behind the dashboard route; apply its guard.
fn require_dashboard(manager: &SessionManager) -> Result<()> {
    match RouteGuard::default().evaluate(Route::Dashboard, &manager.state()) {
        GuardDecision::Render(_) => Ok(()),
        GuardDecision::Redirect(route) => {
            ui::print_warning("Not signed in. Run 'leadflow login' first.");
            bail!("redirected to {}", route)
        }
        GuardDecision::Pending => bail!("session has not resolved"),
    }
}

async fn run_leads(api: LeadsApi, command: LeadsCommand) -> Result<()> {
    match command {
        LeadsCommand::List(filter) => {
            let leads = api.list(&filter.into()).await?;
            if leads.is_empty() {
                ui::print_step("No leads found");
            }
            for lead in &leads {
                print_lead_row(lead);
            }
        }

        LeadsCommand::Count(filter) => {
            println!("{}", api.count(&filter.into()).await?);
        }

        LeadsCommand::Get { id } => {
            let lead = api.get(id).await?;
            println!("{}", serde_json::to_string_pretty(&lead)?);
        }

        LeadsCommand::Create {
            business_name,
            industry,
            lead_score,
            email,
            country,
            website,
        } => {
            let lead = api
                .create(&NewLead {
                    business_name,
                    industry,
                    lead_score,
                    email,
                    country,
                    website,
                    ..NewLead::default()
                })
                .await?;
            ui::print_success(&format!("Created lead {}", lead.id));
        }

        LeadsCommand::Update {
            id,
            lead_score,
            verified,
            summary,
        } => {
            let update = LeadUpdate {
                lead_score,
                verified,
                summary,
                ..LeadUpdate::default()
            };
            if update.is_empty() {
                bail!("nothing to update");
            }
            let lead = api.update(id, &update).await?;
            ui::print_success(&format!("Updated lead {}", lead.id));
        }

        LeadsCommand::Delete { id } => {
            api.delete(id).await?;
            ui::print_success(&format!("Deleted lead {}", id));
        }
    }

    Ok(())
}

fn print_lead_row(lead: &Lead) {
    let score = lead
        .lead_score
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());
    let verified = if lead.verified { "✓".green() } else { " ".normal() };
    println!(
        "{}  {:>3}  {} {}  {}",
        lead.id.to_string().black().bold(),
        score,
        verified,
        lead.business_name.bold(),
        lead.industry.as_deref().unwrap_or("").cyan()
    );
}
