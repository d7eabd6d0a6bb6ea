use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use mca_batch_job_server::adapter::data_source::{ExternalDataSource, HttpDataSource};
use mca_batch_job_server::adapter::handler::{self, AppState};
use mca_batch_job_server::adapter::repository::batch_job_in_memory::InMemoryBatchJobRepository;
use mca_batch_job_server::adapter::repository::batch_job_postgres::BatchJobPostgresRepository;
use mca_batch_job_server::adapter::repository::mirror_in_memory::InMemoryMirrorRepository;
use mca_batch_job_server::adapter::repository::mirror_postgres::MirrorPostgresRepository;
use mca_batch_job_server::adapter::repository::tenant_directory_static::StaticTenantDirectory;
use mca_batch_job_server::domain::repository::{
    BatchJobRepository, MirrorRepository, TenantDirectory,
};
use mca_batch_job_server::infrastructure::config::Config;
use mca_batch_job_server::infrastructure::database;
use mca_batch_job_server::infrastructure::operations;
use mca_batch_job_server::infrastructure::reaper::StaleJobReaper;
use mca_batch_job_server::infrastructure::run_registry::{InMemoryRunRegistry, RunRegistry};
use mca_batch_job_server::usecase;

const SERVICE_NAME: &str = "mca-batch-job-server";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config
    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/config.yaml".to_string());
    let cfg = Config::load(&config_path)?;

    // Telemetry
    let telemetry_cfg = mca_telemetry::TelemetryConfig {
        service_name: SERVICE_NAME.to_string(),
        version: cfg.app.version.clone(),
        environment: cfg.app.environment.clone(),
        trace_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .ok()
            .or_else(|| cfg.observability.trace_endpoint.clone()),
        sample_rate: cfg.observability.sample_rate,
        log_level: cfg.observability.log_level.clone(),
        log_format: cfg.observability.log_format.clone(),
    };
    mca_telemetry::init_telemetry(&telemetry_cfg)
        .map_err(|e| anyhow::anyhow!("failed to init telemetry: {e}"))?;

    info!(
        app_name = %cfg.app.name,
        version = %cfg.app.version,
        environment = %cfg.app.environment,
        "starting batch job server"
    );

    // Database pool (optional)
    let db_pool = if let Some(ref db_config) = cfg.database {
        let url = std::env::var("DATABASE_URL").unwrap_or_else(|_| db_config.connection_url());
        info!("connecting to database");
        let pool = database::connect(
            &url,
            db_config.max_open_conns,
            Duration::from_secs(db_config.acquire_timeout_secs),
        )
        .await?;
        if db_config.run_migrations {
            database::run_migrations(&pool).await?;
        }
        Some(pool)
    } else if let Ok(url) = std::env::var("DATABASE_URL") {
        let pool = database::connect(&url, 25, Duration::from_secs(5)).await?;
        database::run_migrations(&pool).await?;
        info!("database connection pool established from DATABASE_URL");
        Some(pool)
    } else {
        warn!("no database configured, using in-memory repositories");
        None
    };

    // Repositories
    let (job_repo, mirror_repo): (Arc<dyn BatchJobRepository>, Arc<dyn MirrorRepository>) =
        if let Some(ref pool) = db_pool {
            (
                Arc::new(BatchJobPostgresRepository::new(pool.clone())),
                Arc::new(MirrorPostgresRepository::new(pool.clone())),
            )
        } else {
            (
                Arc::new(InMemoryBatchJobRepository::new()),
                Arc::new(InMemoryMirrorRepository::new()),
            )
        };
    let tenant_directory: Arc<dyn TenantDirectory> =
        Arc::new(StaticTenantDirectory::new(cfg.tenants.clone()));

    // External data source
    let data_source: Arc<dyn ExternalDataSource> = Arc::new(
        HttpDataSource::new(
            &cfg.data_source.base_url,
            Duration::from_secs(cfg.data_source.timeout_secs),
            cfg.data_source.credentials,
        )
        .context("failed to build external data source client")?,
    );
    info!(base_url = %cfg.data_source.base_url, "external data source configured");

    // Engine
    let operations = Arc::new(operations::default_registry(
        data_source.clone(),
        mirror_repo.clone(),
    ));
    let run_registry: Arc<dyn RunRegistry> =
        Arc::new(InMemoryRunRegistry::new(cfg.batch.registry_capacity));
    let metrics = Arc::new(
        mca_telemetry::metrics::Metrics::new(SERVICE_NAME)
            .map_err(|e| anyhow::anyhow!("failed to register metrics: {e}"))?,
    );

    let limits = usecase::BatchLimits {
        default_batch_size: cfg.batch.default_batch_size,
        max_batch_size: cfg.batch.max_batch_size,
    };
    let admission = Arc::new(tokio::sync::Mutex::new(()));

    // Use cases
    let executor = Arc::new(usecase::ExecuteJobUseCase::new(
        job_repo.clone(),
        run_registry.clone(),
        operations.clone(),
        Some(metrics.clone()),
    ));
    let create_job_uc = Arc::new(usecase::CreateJobUseCase::new(
        job_repo.clone(),
        operations,
        data_source,
        tenant_directory,
        executor.clone(),
        admission.clone(),
        limits,
    ));
    let resume_job_uc = Arc::new(usecase::ResumeJobUseCase::new(
        job_repo.clone(),
        run_registry.clone(),
        executor,
        admission,
        limits,
    ));
    let resume_all_jobs_uc = Arc::new(usecase::ResumeAllJobsUseCase::new(
        job_repo.clone(),
        resume_job_uc.clone(),
    ));
    let reap_uc = Arc::new(usecase::ReapStaleJobsUseCase::new(
        job_repo.clone(),
        run_registry.clone(),
        Duration::from_secs(cfg.batch.lease_timeout_secs),
    ));

    // Startup recovery: 前回プロセスの RUNNING ジョブはリース切れとして FAILED にする
    let reaped = reap_uc.execute().await?;
    if !reaped.is_empty() {
        info!(count = reaped.len(), "orphaned batch jobs marked failed at startup");
    }
    let reaper = StaleJobReaper::new(
        reap_uc,
        Duration::from_secs(cfg.batch.reaper_interval_secs),
    );
    let reaper_handle = reaper.start();

    // AppState (REST handler用)
    let state = AppState {
        create_job_uc,
        get_job_uc: Arc::new(usecase::GetJobUseCase::new(
            job_repo.clone(),
            run_registry.clone(),
        )),
        list_jobs_uc: Arc::new(usecase::ListJobsUseCase::new(job_repo.clone())),
        cancel_job_uc: Arc::new(usecase::CancelJobUseCase::new(
            job_repo.clone(),
            run_registry.clone(),
        )),
        pause_job_uc: Arc::new(usecase::PauseJobUseCase::new(
            job_repo.clone(),
            run_registry,
        )),
        resume_job_uc,
        resume_all_jobs_uc,
        progress_summary_uc: Arc::new(usecase::ProgressSummaryUseCase::new(job_repo)),
        metrics,
    };

    // Router
    let app = handler::router(state);

    // REST server
    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cfg.server.host, cfg.server.port))?;
    info!("REST server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    reaper.stop();
    if let Err(e) = reaper_handle.await {
        warn!(error = %e, "stale job reaper task ended abnormally");
    }
    mca_telemetry::shutdown();

    served.context("REST server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
