use std::{process, sync::Arc};

use ateneo::{
    application::{
        error::AppError,
        records::RecordsService,
        repos::{CredentialSource, RecordsRepo},
        sync::{SessionService, SyncService},
    },
    cache::{
        CacheConfig, Invalidator, KvCache, MemoryKv, SnapshotCache, spawn_delete_consumer,
    },
    config::{self, Command},
    domain::{
        identity::SubjectId,
        types::{RecordKind, Scope, Term},
    },
    infra::{
        credentials::StaticCredentialSource,
        db::PostgresRepositories,
        error::InfraError,
        queue::{Broker, DelayQueue, InMemoryBroker},
        telemetry,
    },
    portal::{
        PortalGateway,
        acquirer::SessionAcquirer,
        http::{PortalHttp, ReqwestTransport},
        sessions::{SessionPool, spawn_sweeper},
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(Command::Worker(Box::default()));

    telemetry::init(&settings.logging)?;

    match command {
        Command::Worker(_) => run_worker(settings).await,
        Command::Sync(args) => run_sync(settings, args).await,
    }
}

/// Resident mode: keep the deferred-invalidation machinery and the
/// session pool healthy until interrupted.
async fn run_worker(settings: config::Settings) -> Result<(), AppError> {
    let repositories = init_store(&settings).await?;
    repositories
        .health_check()
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    let kv: Arc<dyn KvCache> = Arc::new(MemoryKv::new(&CacheConfig::from(&settings.cache)));
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let defer = DelayQueue::new(broker, settings.broker.clone())
        .await
        .map_err(|err| AppError::unexpected(err.to_string()))?;
    let pool = Arc::new(SessionPool::new(&settings.sessions));

    let forwarder = defer.spawn_forwarder();
    let delete_consumer = spawn_delete_consumer(&defer, kv)
        .await
        .map_err(|err| AppError::unexpected(err.to_string()))?;
    let sweeper = spawn_sweeper(pool, settings.sessions.sweep_interval);

    info!("worker running, press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .map_err(|err| AppError::unexpected(format!("failed to listen for shutdown: {err}")))?;
    info!("shutting down");

    for handle in [forwarder, delete_consumer, sweeper] {
        handle.abort();
        let _ = handle.await;
    }
    Ok(())
}

/// One-shot mode: force-refresh a single subject and scope through the
/// whole pipeline and report what came back.
async fn run_sync(settings: config::Settings, args: config::SyncArgs) -> Result<(), AppError> {
    let scope = parse_scope(&args)?;
    let subject = SubjectId::new(args.subject.trim());

    let repositories = init_store(&settings).await?;
    let repo: Arc<dyn RecordsRepo> = repositories;

    let kv: Arc<dyn KvCache> = Arc::new(MemoryKv::new(&CacheConfig::from(&settings.cache)));
    let snapshots = Arc::new(SnapshotCache::new(
        kv.clone(),
        CacheConfig::from(&settings.cache),
    ));
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let defer = DelayQueue::new(broker, settings.broker.clone())
        .await
        .map_err(|err| AppError::unexpected(err.to_string()))?;
    let invalidator = Invalidator::new(kv, defer);

    let http: Arc<dyn PortalHttp> = Arc::new(
        ReqwestTransport::new(&settings.portal)
            .map_err(|err| AppError::unexpected(format!("failed to build portal client: {err}")))?,
    );
    let acquirer = Arc::new(SessionAcquirer::new(
        http.clone(),
        settings.portal.clone(),
        settings.retry.clone(),
    ));
    let pool = Arc::new(SessionPool::new(&settings.sessions));
    let credentials: Arc<dyn CredentialSource> =
        Arc::new(StaticCredentialSource::from_settings(&settings.portal));
    let sessions = Arc::new(SessionService::new(credentials, pool, acquirer));
    let gateway = Arc::new(PortalGateway::new(http, settings.portal.clone()));
    let sync = Arc::new(SyncService::new(
        sessions,
        gateway,
        repo.clone(),
        settings.retry.clone(),
        settings.portal.pipeline_timeout,
    ));
    let records = RecordsService::new(repo, snapshots, invalidator, sync);

    let fetched = records.get_records(&subject, &scope, true).await?;
    info!(
        subject = %subject,
        scope = %scope,
        count = fetched.len(),
        "sync complete"
    );
    Ok(())
}

async fn init_store(settings: &config::Settings) -> Result<Arc<PostgresRepositories>, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))
        .map_err(AppError::from)?;

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    Ok(Arc::new(PostgresRepositories::new(
        pool,
        settings.store.relation_cap.get(),
    )))
}

fn parse_scope(args: &config::SyncArgs) -> Result<Scope, AppError> {
    let kind: RecordKind = args
        .scope
        .parse()
        .map_err(|_| AppError::validation(format!("unknown scope `{}`", args.scope)))?;
    let period = match (args.year, args.term) {
        (Some(year), Some(ordinal)) => Some((year, Term::from_ordinal(ordinal)?)),
        _ => None,
    };
    Ok(Scope::for_kind(kind, period)?)
}
