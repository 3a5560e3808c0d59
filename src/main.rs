use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use kohakuhub::auth::generate_token;
use kohakuhub::config::{Config, ConfigOverrides};
use kohakuhub::lakefs::LakefsClient;
use kohakuhub::server::{AppState, create_router};
use kohakuhub::storage::BlobStore;
use kohakuhub::store::{NewUser, SqliteStore, Store};
use kohakuhub::types::OrgRole;

#[derive(Parser)]
#[command(name = "kohakuhub")]
#[command(about = "A self-hostable, HuggingFace-compatible hub", long_about = None)]
struct Cli {
    /// Config file path (default: ./kohakuhub.toml, /etc/kohakuhub/kohakuhub.toml,
    /// or $KOHAKUHUB_CONFIG)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(long, short)]
        port: Option<u16>,

        /// Public base URL for external access
        #[arg(long)]
        base_url: Option<String>,

        /// Metadata database path
        #[arg(long)]
        database: Option<PathBuf>,
    },

    /// Administrative commands (direct database access)
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Create the database schema
    Init,

    /// Create a user
    AddUser {
        username: String,
        #[arg(long)]
        email: Option<String>,
        /// Also issue an API token for the new user
        #[arg(long)]
        with_token: bool,
    },

    /// Create an organization
    AddOrg { name: String },

    /// Add a user to an organization
    AddMember {
        username: String,
        organization: String,
        /// visitor | member | admin | super-admin
        #[arg(long, default_value = "member")]
        role: String,
    },

    /// Issue an API token for a user
    AddToken {
        username: String,
        #[arg(long, default_value = "cli")]
        name: String,
    },
}

fn open_store(config: &Config) -> anyhow::Result<SqliteStore> {
    if let Some(parent) = config.app.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = SqliteStore::new(&config.app.database_path)?;
    store.initialize()?;
    Ok(store)
}

fn print_token(username: &str, raw: &str) {
    println!();
    println!("========================================");
    println!("Token for '{username}' (save this, it won't be shown again):");
    println!();
    println!("  {raw}");
    println!();
    println!("========================================");
    println!();
}

fn run_admin(config: &Config, command: AdminCommands) -> anyhow::Result<()> {
    let store = open_store(config)?;

    match command {
        AdminCommands::Init => {
            println!("Database initialized at {}", config.app.database_path.display());
        }
        AdminCommands::AddUser {
            username,
            email,
            with_token,
        } => {
            let user = store
                .create_user(&NewUser {
                    username: &username,
                    email: email.as_deref(),
                    password_hash: None,
                    is_org: false,
                    private_quota_bytes: config.quota.default_user_private_quota_bytes,
                    public_quota_bytes: config.quota.default_user_public_quota_bytes,
                })
                .context("create user")?;
            println!("Created user '{}' (id {})", user.username, user.id);
            if with_token {
                let (raw, digest) = generate_token();
                store.create_token(user.id, &digest, "initial")?;
                print_token(&user.username, &raw);
            }
        }
        AdminCommands::AddOrg { name } => {
            let org = store
                .create_user(&NewUser {
                    username: &name,
                    email: None,
                    password_hash: None,
                    is_org: true,
                    private_quota_bytes: config.quota.default_org_private_quota_bytes,
                    public_quota_bytes: config.quota.default_org_public_quota_bytes,
                })
                .context("create organization")?;
            println!("Created organization '{}' (id {})", org.username, org.id);
        }
        AdminCommands::AddMember {
            username,
            organization,
            role,
        } => {
            let Some(role) = OrgRole::from_str(&role) else {
                bail!("Unknown role '{role}' (expected visitor|member|admin|super-admin)");
            };
            let user = store
                .get_user_by_username(&username)?
                .with_context(|| format!("user '{username}' not found"))?;
            let org = store
                .get_organization(&organization)?
                .with_context(|| format!("organization '{organization}' not found"))?;
            store.create_membership(user.id, org.id, role)?;
            println!("Added '{username}' to '{organization}' as {}", role.as_str());
        }
        AdminCommands::AddToken { username, name } => {
            let user = store
                .get_user_by_username(&username)?
                .with_context(|| format!("user '{username}' not found"))?;
            let (raw, digest) = generate_token();
            store.create_token(user.id, &digest, &name)?;
            print_token(&user.username, &raw);
        }
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("kohakuhub=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Serve {
            host,
            port,
            base_url,
            database,
        } => {
            let overrides = ConfigOverrides {
                host,
                port,
                base_url,
                database_path: database,
            };
            let config = Config::load_with_overrides(config_path, overrides)?;
            run_server(config)?;
        }
        Commands::Admin { command } => {
            let config = Config::load_with_overrides(config_path, ConfigOverrides::default())?;
            run_admin(&config, command)?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn run_server(config: Config) -> anyhow::Result<()> {
    let store = open_store(&config)?;

    let blobs = BlobStore::new(&config.s3).await;
    blobs
        .ensure_bucket()
        .await
        .context("blob store bucket bootstrap")?;

    let lakefs = LakefsClient::new(&config.lakefs);
    let addr = config.socket_addr()?;

    let state = Arc::new(AppState::new(
        Arc::new(store),
        Arc::new(blobs),
        Arc::new(lakefs),
        Arc::new(config),
    ));
    let app = create_router(state);

    info!("Starting server on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
