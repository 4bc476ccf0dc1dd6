use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use chatdesk_server::{ServerConfig, TokenIssuer};
use chatdesk_store::{AccountRepo, AccountRole, Database};
use chatdesk_telemetry::TelemetryConfig;

#[derive(Debug, Parser)]
#[command(name = "chatdesk", about = "Real-time support chat broker")]
struct Cli {
    /// SQLite database path (overrides CHATDESK_DB_PATH).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Emit human-readable logs instead of JSON lines.
    #[arg(long, global = true, default_value_t = false)]
    text_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the WebSocket + HTTP server.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Create an account.
    CreateAccount {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        /// One of `customer`, `agent`, `admin`.
        #[arg(long, default_value = "agent")]
        role: String,
    },
    /// Print a signed bearer token for an existing account.
    IssueToken {
        #[arg(long)]
        email: String,
        /// Lifetime in seconds (defaults to CHATDESK_TOKEN_TTL_SECS).
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::from_env();
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            serve(config, cli.text_logs).await
        }
        Command::CreateAccount { name, email, role } => {
            let _guard = chatdesk_telemetry::init_telemetry(cli_telemetry());
            let role: AccountRole = role.parse().map_err(anyhow::Error::msg)?;
            let accounts = AccountRepo::new(open_db(&config.db_path)?);
            let account = accounts
                .create(&name, &email, role)
                .context("failed to create account")?;
            println!("{}", account.id);
            Ok(())
        }
        Command::IssueToken { email, ttl_secs } => {
            let _guard = chatdesk_telemetry::init_telemetry(cli_telemetry());
            let Some(secret) = config.jwt_secret.as_ref() else {
                bail!("CHATDESK_JWT_SECRET must be set to issue tokens the server will accept");
            };
            let accounts = AccountRepo::new(open_db(&config.db_path)?);
            let Some(account) = accounts.find_by_email(&email)? else {
                bail!("no account with email {email}");
            };
            let ttl = ttl_secs.map(Duration::from_secs);
            let issuer = TokenIssuer::new(secret, config.token_ttl);
            println!("{}", issuer.issue(&account, ttl)?);
            Ok(())
        }
    }
}

async fn serve(config: ServerConfig, text_logs: bool) -> Result<()> {
    let telemetry = chatdesk_telemetry::init_telemetry(TelemetryConfig {
        json: !text_logs,
        ..Default::default()
    });
    tracing::info!("starting chatdesk");

    let db = open_db(&config.db_path)?;
    tracing::info!(path = %config.db_path.display(), "database opened");

    let handle = chatdesk_server::start_with_telemetry(config, db, Arc::new(telemetry))
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "chatdesk ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown();
    Ok(())
}

fn open_db(path: &std::path::Path) -> Result<Database> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Database::open(path).with_context(|| format!("failed to open database {}", path.display()))
}

fn cli_telemetry() -> TelemetryConfig {
    TelemetryConfig {
        log_level: tracing::Level::WARN,
        json: false,
        log_to_sqlite: false,
        ..Default::default()
    }
}
