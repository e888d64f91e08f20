//! MallQuest production binary.
//!
//! Usage:
//!   mallquest serve              - start transport + scheduler
//!   mallquest worker             - start the scheduler alone
//!   mallquest migrate            - run shard schema migrations
//!   mallquest tenant add|list    - manage the tenant registry
//!
//! Exit codes: 0 success, 2 bad arguments or configuration, 3 schema
//! out-of-date, 4 store unreachable at startup.

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;

use mq_api::{run_server, AppState};
use mq_core::types::{Tenant, TenantId};
use mq_core::MallConfig;
use mq_engine::{BackgroundScheduler, NotificationHub, SmartCache};
use mq_store::{ShardedStore, SledStore, Store, StoreError, SCHEMA_VERSION};

const EXIT_BAD_CONFIG: u8 = 2;
const EXIT_SCHEMA: u8 = 3;
const EXIT_STORE: u8 = 4;

#[derive(Parser)]
#[command(name = "mallquest")]
#[command(about = "MallQuest gamification backend")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server and the background scheduler.
    Serve {
        /// Listen address override.
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Start the background scheduler alone.
    Worker,

    /// Run shard-wide schema migrations; idempotent.
    Migrate,

    /// Manage the tenant registry.
    Tenant {
        #[command(subcommand)]
        action: TenantCommands,
    },
}

#[derive(Subcommand)]
enum TenantCommands {
    /// Register a tenant.
    Add {
        /// Tenant id.
        #[arg(long)]
        id: String,
        /// Display name.
        #[arg(long)]
        name: String,
        /// Host domain routed to this tenant.
        #[arg(long)]
        host: String,
        /// Fixed UTC offset, e.g. "+04:00".
        #[arg(long)]
        timezone: Option<String>,
    },
    /// List registered tenants.
    List,
}

struct Failure {
    code: u8,
    message: String,
}

impl Failure {
    fn new(code: u8, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<StoreError> for Failure {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::SchemaMismatch { .. } => Failure::new(EXIT_SCHEMA, err.to_string()),
            StoreError::Transient(_) => Failure::new(EXIT_STORE, err.to_string()),
            _ => Failure::new(1, err.to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = MallConfig::from_env();

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            eprintln!("Error: {}", failure.message);
            ExitCode::from(failure.code)
        }
    }
}

async fn run(cli: Cli, mut config: MallConfig) -> Result<(), Failure> {
    match cli.command {
        Commands::Serve { listen } => {
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            let store = open_store(&config)?;
            ensure_default_tenant(&store, &config).await?;

            let state = AppState::from_config(&config, store)
                .map_err(|message| Failure::new(EXIT_BAD_CONFIG, message))?;
            let state = match mq_api::metrics::init_metrics() {
                Ok(handle) => state.with_prometheus(handle),
                Err(message) => {
                    tracing::warn!(%message, "metrics recorder unavailable");
                    state
                }
            };
            let state = Arc::new(state);

            let scheduler = BackgroundScheduler::for_coordinator(&state.coordinator);
            let handle = scheduler.start();

            let result = run_server(state).await;
            handle.stop().await;
            result.map_err(|err| Failure::new(1, err.to_string()))
        }

        Commands::Worker => {
            let store = open_store(&config)?;
            ensure_default_tenant(&store, &config).await?;

            let hub = Arc::new(NotificationHub::default());
            let user_cache = Arc::new(SmartCache::new(1_000, std::time::Duration::from_secs(60)));
            let template_cache =
                Arc::new(SmartCache::new(1_000, std::time::Duration::from_secs(600)));
            let scheduler = BackgroundScheduler::new(store, hub, user_cache, template_cache);
            let handle = scheduler.start();

            tracing::info!("worker running; press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .map_err(|err| Failure::new(1, err.to_string()))?;
            handle.stop().await;
            Ok(())
        }

        Commands::Migrate => {
            let Some(data_dir) = config.data_dir.clone() else {
                println!("in-memory store: nothing to migrate");
                return Ok(());
            };
            for shard in 0..config.shard_count.max(1) {
                let path = std::path::Path::new(&data_dir).join(format!("shard-{shard}"));
                let store = SledStore::open_unchecked(&path).map_err(Failure::from)?;
                let before = store.schema_version().map_err(Failure::from)?;
                store
                    .write_schema_version(SCHEMA_VERSION)
                    .map_err(Failure::from)?;
                println!(
                    "shard-{shard}: schema {} -> {SCHEMA_VERSION}",
                    before.map(|v| v.to_string()).unwrap_or_else(|| "none".to_string())
                );
            }
            Ok(())
        }

        Commands::Tenant { action } => {
            let store = open_store(&config)?;
            match action {
                TenantCommands::Add {
                    id,
                    name,
                    host,
                    timezone,
                } => {
                    let mut policy = config.default_policy();
                    if let Some(timezone) = timezone {
                        policy.timezone = timezone;
                    }
                    let tenant = Tenant::new(
                        TenantId::new(id.clone()),
                        name,
                        host.clone(),
                        policy,
                        chrono::Utc::now(),
                    );
                    store.upsert_tenant(tenant).await.map_err(Failure::from)?;
                    println!("tenant {id} registered for host {host}");
                    Ok(())
                }
                TenantCommands::List => {
                    let tenants = store.list_tenants().await.map_err(Failure::from)?;
                    if tenants.is_empty() {
                        println!("no tenants registered");
                    }
                    for tenant in tenants {
                        println!(
                            "{:<20} {:<30} {}",
                            tenant.id.as_str(),
                            tenant.host,
                            tenant.name
                        );
                    }
                    Ok(())
                }
            }
        }
    }
}

fn open_store(config: &MallConfig) -> Result<Arc<ShardedStore>, Failure> {
    let store = match &config.data_dir {
        Some(data_dir) => ShardedStore::open_sled(data_dir, config.shard_count)?,
        None => {
            tracing::warn!("MALLQUEST_DATA_DIR not set; using the in-memory store");
            ShardedStore::in_memory(config.shard_count)
        }
    };
    Ok(Arc::new(store))
}

/// Seed a single default tenant so a fresh deployment serves requests
/// before onboarding runs.
async fn ensure_default_tenant(
    store: &Arc<ShardedStore>,
    config: &MallConfig,
) -> Result<(), Failure> {
    let tenants = store.list_tenants().await.map_err(Failure::from)?;
    if tenants.is_empty() {
        store
            .upsert_tenant(Tenant::new(
                TenantId::new("default"),
                "Default Mall",
                "localhost",
                config.default_policy(),
                chrono::Utc::now(),
            ))
            .await
            .map_err(Failure::from)?;
        tracing::info!("seeded default tenant for host localhost");
    }
    Ok(())
}
