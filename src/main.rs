use clap::{Parser, Subcommand};
use cloudrow::config::Config;
use cloudrow::utils::init_tracing;
use cloudrow::{Account, Direction, HttpCloud, OperationOutcome, Orchestrator, modules};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

#[derive(Parser)]
#[command(name = "cloudrow")]
#[command(about = "Reconcile cloud resources against SQLite tables", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Missing files are ignored.
    #[arg(short, long, env = "CLOUDROW_CONFIG", default_value = "cloudrow.toml")]
    config: PathBuf,

    /// Target name; each target has its own database.
    #[arg(short, long, env = "CLOUDROW_TARGET", default_value = "default")]
    target: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available modules and their state on the target
    Modules,
    /// Install modules with their dependencies
    Install { modules: Vec<String> },
    /// Uninstall modules and the disabled modules depending on them
    Uninstall { modules: Vec<String> },
    Enable { module: String },
    Disable { module: String },
    /// Make the cloud match the tables
    Apply {
        /// Only compute the plan
        #[arg(long)]
        plan: bool,
        /// Stop launching cloud calls after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Make the tables match the cloud
    Sync {
        #[arg(long)]
        plan: bool,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Call a module action with JSON parameters
    Rpc {
        module: String,
        method: String,
        #[arg(default_value = "{}")]
        params: String,
    },
    /// Show recent operations
    Operations {
        #[arg(short = 'n', long, default_value = "20")]
        limit: u32,
    },
    /// Store credentials and enabled regions
    SetAccount {
        #[arg(long, env = "CLOUDROW_ACCESS_KEY_ID")]
        access_key_id: String,
        #[arg(long, env = "CLOUDROW_SECRET_ACCESS_KEY", hide_env_values = true)]
        secret_access_key: String,
        #[arg(long)]
        default_region: String,
        /// Additional enabled regions
        #[arg(long, value_delimiter = ',')]
        regions: Vec<String>,
    },
}

fn print_json(value: &impl serde::Serialize) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report(outcome: &OperationOutcome) -> Result<bool, Box<dyn std::error::Error>> {
    info!(opid = %outcome.opid, kind = %outcome.kind, status = ?outcome.status, "operation finished");
    if let Some(output) = &outcome.output {
        print_json(output)?;
    }
    if let Some(lines) = outcome.error_lines() {
        for line in lines {
            eprintln!("{line}");
        }
    }
    Ok(outcome.is_success())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let cfg = Config::load_from(&cli.config)?;
    init_tracing(&cfg.basic.loglevel);

    info!(
        target_name = %cli.target,
        database_url = %cfg.basic.database_url_for(&cli.target),
        endpoint = %cfg.cloud.endpoint,
        loglevel = %cfg.basic.loglevel
    );

    let cloud = Arc::new(HttpCloud::new(&cfg.cloud)?);
    let orchestrator = Orchestrator::new(cfg, modules::catalog()?, cloud);
    let target = cli.target.as_str();
    let deadline = |secs: Option<u64>| secs.map(|s| Instant::now() + Duration::from_secs(s));

    let ok = match cli.command {
        Commands::Modules => {
            print_json(&orchestrator.list_modules(target).await?)?;
            true
        }
        Commands::Install { modules } => report(&orchestrator.install(target, &modules).await?)?,
        Commands::Uninstall { modules } => {
            report(&orchestrator.uninstall(target, &modules).await?)?
        }
        Commands::Enable { module } => {
            orchestrator.set_enabled(target, &module, true).await?;
            true
        }
        Commands::Disable { module } => {
            orchestrator.set_enabled(target, &module, false).await?;
            true
        }
        Commands::Apply { plan, timeout_secs } => report(
            &orchestrator
                .reconcile(target, Direction::Apply, plan, deadline(timeout_secs))
                .await?,
        )?,
        Commands::Sync { plan, timeout_secs } => report(
            &orchestrator
                .reconcile(target, Direction::Sync, plan, deadline(timeout_secs))
                .await?,
        )?,
        Commands::Rpc {
            module,
            method,
            params,
        } => {
            let params: Value = serde_json::from_str(&params)?;
            report(&orchestrator.rpc(target, &module, &method, params).await?)?
        }
        Commands::Operations { limit } => {
            print_json(&orchestrator.list_operations(target, limit).await?)?;
            true
        }
        Commands::SetAccount {
            access_key_id,
            secret_access_key,
            default_region,
            regions,
        } => {
            let account = Account::new(access_key_id, secret_access_key, default_region, regions);
            orchestrator.set_account(target, account).await?;
            true
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
