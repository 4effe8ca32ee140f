use std::sync::Arc;

use anyhow::{bail, Context};
use assignment_coordination::etcd::{EtcdStore, StoreConfig};
use assignment_coordination::leader_election::{run_election, LeaderElectionConfig};
use assignment_coordination::memory::MemoryStore;
use assignment_coordination::store::CoordinationStore;
use axum::{routing::get, Router};
use envconfig::Envconfig;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use stream_dispatcher::config::Config;
use stream_dispatcher::converter::PathConverter;
use stream_dispatcher::dispatcher::{follow_leadership, Dispatcher};
use stream_dispatcher::flow::{BalanceSettings, FlowCollector};
use stream_dispatcher::pipeline::{IdleUnitFactory, PipelineConfig, PipelineManager};
use stream_dispatcher::registry::{RegistryConfig, WorkerRegistry};
use stream_dispatcher::scheduler::{Scheduler, SchedulerConfig};
use stream_dispatcher::store::DispatchStore;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

async fn shutdown_signal() -> anyhow::Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to register SIGTERM handler")?;
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("failed to register SIGINT handler")?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
    Ok(())
}

async fn connect_store(config: &Config) -> anyhow::Result<Arc<dyn CoordinationStore>> {
    match config.store_backend.as_str() {
        "etcd" => {
            let store = EtcdStore::connect(StoreConfig {
                endpoints: config.etcd_endpoint_list(),
                prefix: config.etcd_prefix.clone(),
            })
            .await
            .context("failed to connect to etcd")?;
            Ok(Arc::new(store))
        }
        "memory" => {
            tracing::warn!("using the in-memory store, state is not shared between processes");
            Ok(Arc::new(MemoryStore::new()))
        }
        other => bail!("unknown store backend {other:?}, expected \"etcd\" or \"memory\""),
    }
}

fn health_router(metrics: PrometheusHandle) -> Router {
    Router::new()
        .route("/_readiness", get(|| async { "ok" }))
        .route("/_liveness", get(|| async { "ok" }))
        .route("/metrics", get(move || std::future::ready(metrics.render())))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env().context("invalid configuration")?;

    let log_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(log_layer)
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    tracing::info!("Starting stream-dispatcher");
    tracing::info!("Worker name: {}", config.service_name);
    tracing::info!("Store backend: {}", config.store_backend);
    tracing::info!("Metrics port: {}", config.metrics_port);

    let recorder = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;
    let metrics_port = config.metrics_port;
    let bind = format!("0.0.0.0:{metrics_port}");
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind metrics port {metrics_port}"))?;
    tracing::info!("Metrics server listening on {}", bind);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health_router(recorder)).await {
            tracing::error!(error = %e, "metrics server failed");
        }
    });

    let backend = connect_store(&config).await?;
    let store = DispatchStore::new(Arc::clone(&backend), config.key_layout());

    let settings = Arc::new(BalanceSettings::default());
    if let Err(e) = settings.sync(&store).await {
        tracing::warn!(error = %e, "failed to load balance config, using defaults");
    }

    let converter = Arc::new(PathConverter::new(
        config.items_root.clone(),
        config.shadows_root.clone(),
    ));
    let flows = Arc::new(FlowCollector::new(store.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        converter,
        Arc::clone(&settings),
        flows,
        config.dispatcher_config(),
    ));

    let registry = WorkerRegistry::new(
        store.clone(),
        RegistryConfig {
            name: config.service_name.clone(),
            address: config.service_address.clone(),
            lease_ttl: config.service_lease_ttl_secs,
            keepalive_interval: config.service_keepalive_interval(),
        },
    );

    let manager = Arc::new(PipelineManager::new(
        Arc::new(IdleUnitFactory),
        PipelineConfig {
            stop_timeout: config.unit_stop_timeout(),
            wait_timeout: config.unit_wait_timeout(),
        },
    ));
    let scheduler = Scheduler::new(
        store.clone(),
        manager,
        SchedulerConfig {
            worker: config.service_name.clone(),
            check_interval: config.scheduler_check_interval(),
            flow_interval: config.scheduler_flow_interval(),
            cleanup_interval: config.scheduler_cleanup_interval(),
            flow_record_enabled: config.flow_record_enabled,
            watch_retry_interval: config.watch_retry_interval(),
        },
    );

    let election = LeaderElectionConfig {
        name: config.service_name.clone(),
        leader_key: config.leader_key.clone(),
        lease_ttl: config.leader_lease_ttl_secs,
        keepalive_interval: config.leader_keepalive_interval(),
        retry_interval: config.election_retry_interval(),
    };

    let cancel = CancellationToken::new();
    let mut tasks: JoinSet<(&'static str, anyhow::Result<()>)> = JoinSet::new();

    {
        let cancel = cancel.clone();
        tasks.spawn(async move { ("registry", registry.run(cancel).await.map_err(Into::into)) });
    }
    {
        let cancel = cancel.clone();
        tasks.spawn(async move { ("scheduler", scheduler.run(cancel).await.map_err(Into::into)) });
    }
    {
        let cancel = cancel.clone();
        let store = store.clone();
        let interval = config.balance_sync_interval();
        tasks.spawn(async move {
            settings.run_sync(store, interval, cancel).await;
            ("balance-sync", Ok(()))
        });
    }

    let (events_tx, events_rx) = mpsc::channel(8);
    {
        let cancel = cancel.clone();
        let backend = Arc::clone(&backend);
        tasks.spawn(async move {
            let result = run_election(backend, election, cancel, events_tx).await;
            ("election", result.map_err(Into::into))
        });
    }
    {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            follow_leadership(events_rx, cancel, move |token| {
                Arc::clone(&dispatcher).run(token)
            })
            .await;
            ("dispatcher", Ok(()))
        });
    }

    tokio::select! {
        result = shutdown_signal() => result?,
        Some(joined) = tasks.join_next() => match joined {
            Ok((name, Ok(()))) => tracing::warn!(task = name, "task exited early"),
            Ok((name, Err(e))) => tracing::error!(task = name, error = %e, "task failed"),
            Err(e) => tracing::error!(error = %e, "task panicked"),
        },
    }

    cancel.cancel();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Err(e))) => tracing::warn!(task = name, error = %e, "task ended with error"),
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "task panicked during shutdown"),
        }
    }

    drop(backend.close().await);
    tracing::info!("stream-dispatcher stopped");
    Ok(())
}
