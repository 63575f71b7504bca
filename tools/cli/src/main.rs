//! cabinetry CLI - provision the platform and manage cabinets.
//!
//! Every command reconciles the platform's resources first; the process
//! holds no state between runs.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use cabinetry_platform::{Cabinet, InitializeReport, Platform, PlatformConfig, DEFAULT_CONFIG_FILE};

/// Cabinets created and read back by `demo`.
const DEMO_CABINETS: [&str; 2] = ["cabinet1", "cabinet2"];

#[derive(Parser)]
#[command(name = "cabinetry")]
#[command(about = "cabinetry - Storage cabinets with vault-held access URIs")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Path to the configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Print results as JSON.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the resource group, storage account and key vault.
    Init,

    /// Create a cabinet (or refresh its access URI).
    Create {
        /// Cabinet name; must be a valid container name.
        name: String,
    },

    /// Show a cabinet's access URI.
    Get {
        /// Cabinet name.
        name: String,
    },

    /// Delete a cabinet's container.
    Delete {
        /// Cabinet name.
        name: String,
    },

    /// Create and read back two sample cabinets.
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let platform = load_platform(&cli.config)?;
    let report = initialize(&platform).await?;

    match cli.command {
        Commands::Init => cmd_init(&report, cli.json),
        Commands::Create { name } => cmd_create(&platform, &name, cli.json).await,
        Commands::Get { name } => cmd_get(&platform, &name, cli.json).await,
        Commands::Delete { name } => cmd_delete(&platform, &name).await,
        Commands::Demo => cmd_demo(&platform, cli.json).await,
    }
}

fn load_platform(path: &Path) -> Result<Platform> {
    let config = PlatformConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    Platform::from_config(config).context("Failed to set up cloud backend")
}

/// Run initialization, cancelled by Ctrl-C.
async fn initialize(platform: &Platform) -> Result<InitializeReport> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping after the current request");
            on_signal.cancel();
        }
    });

    platform
        .initialize_with_cancellation(&cancel)
        .await
        .context("Failed to initialize platform")
}

fn print_cabinet(cabinet: &Cabinet, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(cabinet)?);
    } else {
        println!("Cabinet: {}", cabinet.name);
        println!("  Access URI: {}", cabinet.access_uri);
    }
    Ok(())
}

/// Report what initialization did.
fn cmd_init(report: &InitializeReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let state = |created: bool| if created { "created" } else { "existing" };
    println!("Platform initialized");
    println!("  Subscription: {}", report.subscription);
    println!("  Resource group: {} ({})", report.group, state(report.group_created));
    println!(
        "  Storage account: {} ({})",
        report.storage_account,
        state(report.storage_account_created)
    );
    println!("  Key vault: {} ({})", report.vault, state(report.vault_created));
    match &report.grant {
        Some(grant) => println!("  Granted {} to {}", grant.role_id, grant.principal_id),
        None => println!("  No role grant needed"),
    }
    Ok(())
}

/// Create a cabinet.
async fn cmd_create(platform: &Platform, name: &str, json: bool) -> Result<()> {
    let cabinet = platform
        .create_cabinet(name)
        .await
        .with_context(|| format!("Failed to create cabinet '{}'", name))?;
    print_cabinet(&cabinet, json)
}

/// Show a cabinet.
async fn cmd_get(platform: &Platform, name: &str, json: bool) -> Result<()> {
    let cabinet = platform
        .get_cabinet(name)
        .await
        .with_context(|| format!("Failed to read cabinet '{}'", name))?;

    match cabinet {
        Some(cabinet) => print_cabinet(&cabinet, json),
        None => anyhow::bail!("Cabinet '{}' does not exist", name),
    }
}

/// Delete a cabinet.
async fn cmd_delete(platform: &Platform, name: &str) -> Result<()> {
    let removed = platform
        .delete_cabinet(name)
        .await
        .with_context(|| format!("Failed to delete cabinet '{}'", name))?;

    if removed {
        println!("Cabinet '{}' deleted", name);
    } else {
        println!("Cabinet '{}' did not exist", name);
    }
    Ok(())
}

/// Create two cabinets, then read both back.
async fn cmd_demo(platform: &Platform, json: bool) -> Result<()> {
    for name in DEMO_CABINETS {
        info!("Creating cabinet {}", name);
        platform
            .create_cabinet(name)
            .await
            .with_context(|| format!("Failed to create cabinet '{}'", name))?;
    }

    for name in DEMO_CABINETS {
        let cabinet = platform
            .get_cabinet(name)
            .await
            .with_context(|| format!("Failed to read cabinet '{}'", name))?
            .with_context(|| format!("Cabinet '{}' vanished after creation", name))?;
        print_cabinet(&cabinet, json)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_create() {
        let cli = Cli::try_parse_from(["cabinetry", "--json", "create", "reports"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
        assert!(matches!(cli.command, Commands::Create { name } if name == "reports"));
    }

    #[test]
    fn test_parse_config_override() {
        let cli =
            Cli::try_parse_from(["cabinetry", "--config", "/etc/cab.json", "-v", "init"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, PathBuf::from("/etc/cab.json"));
        assert!(matches!(cli.command, Commands::Init));
    }

    #[test]
    fn test_missing_config_has_context() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_platform(&dir.path().join("absent.json"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("Failed to load configuration"));
    }

    #[tokio::test]
    async fn test_demo_against_memory_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(
            &path,
            r#"{
                "tenant": "72f988bf-86f1-41af-91ab-2d7cd011db47",
                "subscription": "00000000-0000-0000-0000-000000000001",
                "resource-prefix": "demo",
                "location": "westeurope",
                "backend": { "name": "memory" },
                "grant": { "propagation-initial-delay-ms": 1, "propagation-jitter": false }
            }"#,
        )
        .unwrap();

        let platform = load_platform(&path).unwrap();
        initialize(&platform).await.unwrap();
        cmd_demo(&platform, false).await.unwrap();

        for name in DEMO_CABINETS {
            assert!(platform.get_cabinet(name).await.unwrap().is_some());
        }
    }
}
