// Keygate - Main Entry Point
//
// Command-line front end for the credential and quota enforcement engine:
// - serve: open the journals, start background tasks and the HTTP API
// - check-config: load and validate configuration without starting anything
// - issue-credential: mint a credential straight into the journal, used to
//   bootstrap the first admin key before the API is reachable

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keygate::audit::AuditAction;
use keygate::clock::SystemClock;
use keygate::config::Config;
use keygate::credentials::keygen::fingerprint;
use keygate::credentials::CredentialKind;
use keygate::engine::Engine;
use keygate::{logging, metrics, server};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Keygate: credential and quota enforcement engine
#[derive(Parser, Debug)]
#[command(name = "keygate")]
#[command(author = "Keygate Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Credential and quota enforcement engine", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to ~/.config/keygate/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine API
    Serve {
        /// Listen address, overriding the configuration
        #[arg(long)]
        bind: Option<String>,
    },
    /// Validate the configuration and exit
    CheckConfig {
        /// Print the effective configuration as TOML
        #[arg(long)]
        print: bool,
    },
    /// Issue a credential offline; requires a credential journal
    IssueCredential {
        /// Owner of the new credential
        #[arg(long)]
        owner: String,
        /// Issue an auth token instead of an API key
        #[arg(long)]
        token: bool,
        /// Token lifetime in seconds
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
}

/// Actor recorded for credentials minted from the command line
const CLI_ACTOR: &str = "cli";

fn load_config(path: Option<&PathBuf>) -> Result<(PathBuf, Config)> {
    let path = path.cloned().unwrap_or_else(Config::config_path);
    let config = Config::load_from_path(&path)?;
    Ok((path, config))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Some(Commands::Serve { bind }) => {
            let (path, mut config) = load_config(args.config.as_ref())?;
            if let Some(bind) = bind {
                config.server.bind = bind;
                config.validate()?;
            }
            logging::init(&config.logging, args.verbose)?;
            info!("Keygate v{} starting with {:?}", env!("CARGO_PKG_VERSION"), path);
            serve(config).await?;
        }
        Some(Commands::CheckConfig { print }) => {
            let (path, config) = load_config(args.config.as_ref())?;
            println!("Configuration valid: {}", path.display());
            if print {
                let text =
                    toml::to_string_pretty(&config).context("Failed to render configuration")?;
                println!("{}", text);
            }
        }
        Some(Commands::IssueCredential {
            owner,
            token,
            ttl_secs,
        }) => {
            let (_, config) = load_config(args.config.as_ref())?;
            let kind = if token {
                CredentialKind::AuthToken
            } else {
                CredentialKind::ApiKey
            };
            let id = issue_credential(config, &owner, kind, ttl_secs).await?;
            println!("{}", id);
        }
        None => {
            println!("No command specified. Use \"keygate --help\" for usage.");
        }
    }

    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    metrics::init().context("Failed to initialize metrics")?;

    let engine = Engine::open(&config, Arc::new(SystemClock))
        .await
        .context("Failed to open engine")?;
    let engine = Arc::new(engine);
    engine.start_background();

    server::serve(engine, &config).await
}

async fn issue_credential(
    config: Config,
    owner: &str,
    kind: CredentialKind,
    ttl_secs: Option<u64>,
) -> Result<String> {
    if config.credentials.journal_path.is_none() {
        anyhow::bail!("credentials.journal_path must be set to issue credentials offline");
    }
    if ttl_secs == Some(0) {
        anyhow::bail!("--ttl-secs must be positive");
    }

    let engine = Engine::open(&config, Arc::new(SystemClock))
        .await
        .context("Failed to open engine")?;
    let credential = engine
        .credentials()
        .issue(owner, kind, ttl_secs.map(Duration::from_secs))
        .await
        .context("Failed to issue credential")?;
    engine
        .audit()
        .record(
            CLI_ACTOR,
            AuditAction::CredentialIssued,
            Some(fingerprint(&credential.id).to_string()),
            Some(format!("owner={} kind={}", owner, kind.as_str())),
        )
        .await
        .context("Failed to audit issued credential")?;
    Ok(credential.id)
}
