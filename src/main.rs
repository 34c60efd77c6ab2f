//! Replicator - bulk replication engine for rate-limited advertising platforms

use clap::Parser;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use replicator::{
    config::Args,
    db::MongoClient,
    engine::ReplicationEngine,
    jobs::{InMemoryJobStore, JobStore, JobTracker, MongoJobStore, TrackerParts},
    ledger::{FailureLedger, FailureStore, InMemoryFailureStore, MongoFailureStore},
    platform::{AdPlatform, GraphClient, SimulatedPlatform},
    quota::{CredentialPool, InMemoryQuotaStore, MongoQuotaStore, QuotaStore},
    selection::SelectionState,
    server::{self, AppState},
    templates::{InMemoryTemplates, MongoTemplates, TemplateSource},
};

/// Pending failure records before the ledger applies backpressure
const LEDGER_CAPACITY: usize = 1024;

struct Stores {
    quota: Arc<dyn QuotaStore>,
    jobs: Arc<dyn JobStore>,
    failures: Arc<dyn FailureStore>,
    templates: Arc<dyn TemplateSource>,
    kind: &'static str,
}

impl Stores {
    fn in_memory() -> Self {
        Self {
            quota: Arc::new(InMemoryQuotaStore::new()),
            jobs: Arc::new(InMemoryJobStore::new()),
            failures: Arc::new(InMemoryFailureStore::new()),
            templates: Arc::new(InMemoryTemplates::new()),
            kind: "memory",
        }
    }

    async fn mongo(mongo: &MongoClient) -> replicator::Result<Self> {
        Ok(Self {
            quota: Arc::new(MongoQuotaStore::new(mongo).await?),
            jobs: Arc::new(MongoJobStore::new(mongo).await?),
            failures: Arc::new(MongoFailureStore::new(mongo).await?),
            templates: Arc::new(MongoTemplates::new(mongo).await?),
            kind: "mongodb",
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("replicator={},info", args.log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if args.log_format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Replicator - bulk replication engine");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!(
        "Platform: {}",
        if args.simulate_platform { "simulated" } else { args.graph_api_url.as_str() }
    );
    info!("MongoDB: {}", args.mongodb_uri);
    info!("Workers: {} (fan-out concurrency {})", args.worker_count, args.fanout_concurrency);
    info!("Batch: {} ops per call, {:?} layout", args.max_ops_per_call, args.batch_layout);
    info!("======================================");

    // Connect to MongoDB (optional in dev mode)
    let stores = match MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await {
        Ok(client) => {
            info!("MongoDB connected successfully");
            Stores::mongo(&client).await?
        }
        Err(e) => {
            if args.dev_mode {
                warn!("MongoDB connection failed (dev mode, using in-memory stores): {}", e);
                Stores::in_memory()
            } else {
                error!("MongoDB connection failed: {}", e);
                std::process::exit(1);
            }
        }
    };

    let platform: Arc<dyn AdPlatform> = if args.simulate_platform {
        warn!("Simulated platform enabled - nothing reaches the real advertising API");
        Arc::new(SimulatedPlatform::new())
    } else {
        Arc::new(GraphClient::new(args.graph_config())?)
    };

    let pool = Arc::new(CredentialPool::load(stores.quota, args.quota_window()).await?);
    let credentials = pool.credential_count().await;
    if credentials == 0 {
        warn!("No credentials registered; jobs will wait until one is added via /admin/credentials");
    } else {
        info!("Loaded {} credential(s)", credentials);
    }

    let ledger = FailureLedger::spawn(stores.failures, LEDGER_CAPACITY);
    let selection = Arc::new(SelectionState::new(args.stored_selection()));
    let engine = Arc::new(ReplicationEngine::new(Arc::clone(&pool), platform, args.engine_config()));

    let tracker = Arc::new(JobTracker::new(
        TrackerParts {
            store: stores.jobs,
            engine,
            pool: Arc::clone(&pool),
            templates: Arc::clone(&stores.templates),
            selection: Arc::clone(&selection),
            ledger: ledger.clone(),
        },
        args.tracker_config(),
    ));

    let shutdown = CancellationToken::new();
    let workers = tracker.spawn_workers(shutdown.clone());

    let state = Arc::new(AppState {
        args,
        tracker,
        pool,
        templates: stores.templates,
        selection,
        ledger: ledger.clone(),
        storage: stores.kind,
        started_at: Instant::now(),
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown signal received");
        signal_shutdown.cancel();
    });

    let served = server::run(state, shutdown.clone()).await;
    shutdown.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            warn!("Job worker ended abnormally: {}", e);
        }
    }
    ledger.flush().await;

    served?;
    info!("Replicator stopped");
    Ok(())
}
