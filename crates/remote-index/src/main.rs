//! Remote index consumer fleet for the Helios FHIR Server.
//!
//! Runs until the fleet health threshold is breached or an unrecoverable
//! error occurs; both exit with a non-zero status so the environment can
//! restart the service.

use std::sync::Arc;

use clap::Parser;
use helios_remote_index::cache::IdentityCache;
use helios_remote_index::database::IndexDatabase;
use helios_remote_index::orchestrator::{FleetOutcome, OrchestratorOptions};
use helios_remote_index::{RemoteIndexConfig, init_logging};
use tracing::{error, info};

fn open_database(config: &RemoteIndexConfig) -> anyhow::Result<IndexDatabase> {
    let mut db_config = config.database_config()?;
    // One connection per consumer plus the cache loader.
    db_config.max_connections = db_config.max_connections.max(config.consumer_count as u32 + 1);

    let database = IndexDatabase::with_config(db_config)?;
    if config.init_schema {
        info!("Initializing index schema");
        database.init_schema()?;
    }
    Ok(database)
}

#[cfg(feature = "kafka")]
fn run_fleet(
    config: &RemoteIndexConfig,
    options: OrchestratorOptions,
    database: IndexDatabase,
    cache: Arc<IdentityCache>,
) -> anyhow::Result<FleetOutcome> {
    use helios_remote_index::broker::KafkaBrokerClient;
    use helios_remote_index::orchestrator::Orchestrator;

    let properties = config.broker_properties()?;
    let group = config.consumer_group.clone();
    let orchestrator = Orchestrator::new(options, database, cache, move |_| {
        KafkaBrokerClient::new(&properties, &group)
    });
    Ok(orchestrator.run()?)
}

// Built without a broker backend; see the `--help` text.
#[cfg(not(feature = "kafka"))]
fn run_fleet(
    _config: &RemoteIndexConfig,
    _options: OrchestratorOptions,
    _database: IndexDatabase,
    _cache: Arc<IdentityCache>,
) -> anyhow::Result<FleetOutcome> {
    Err(helios_remote_index::IndexError::from(
        helios_remote_index::error::StartupError::BrokerUnavailable {
            backend: "kafka".to_string(),
        },
    )
    .into())
}

fn main() -> anyhow::Result<()> {
    let config = RemoteIndexConfig::parse();
    init_logging(&config.log_level);

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Configuration error: {}", error);
        }
        std::process::exit(1);
    }

    info!(
        topic = %config.topic_name,
        group = %config.consumer_group,
        consumers = config.consumer_count,
        schema = %config.schema_variant,
        "Starting remote index service"
    );

    let database = open_database(&config)?;
    let cache = Arc::new(IdentityCache::new(&config.identity_cache_config()));

    match run_fleet(&config, config.orchestrator_options(), database, cache) {
        Ok(FleetOutcome::Stopped) => {
            info!("Remote index service stopped");
            Ok(())
        }
        Ok(FleetOutcome::HealthBreach { running, threshold }) => {
            error!(running, threshold, "Exiting after fleet health breach");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "Remote index service failed");
            std::process::exit(1);
        }
    }
}
