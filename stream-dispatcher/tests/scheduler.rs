mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use assignment_coordination::store::CoordinationStore;
use common::{
    dispatcher, item_key, put_item, start_candidate, test_store, wait_for_condition,
    RecordingFactory, SharedFactory, StaticFlows, UnitEvent, POLL_INTERVAL, WAIT_TIMEOUT,
};
use stream_dispatcher::pipeline::{PipelineConfig, PipelineManager};
use stream_dispatcher::registry::{RegistryConfig, WorkerRegistry};
use stream_dispatcher::scheduler::{Scheduler, SchedulerConfig};
use stream_dispatcher::store::DispatchStore;
use stream_dispatcher::types::DataId;

struct Worker {
    manager: Arc<PipelineManager>,
    scheduler: Arc<Scheduler>,
    units: Arc<RecordingFactory>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Worker {
    fn start(store: &DispatchStore, name: &str) -> Self {
        let units = Arc::new(RecordingFactory::default());
        let manager = Arc::new(PipelineManager::new(
            Arc::new(SharedFactory(Arc::clone(&units))),
            PipelineConfig {
                stop_timeout: Duration::from_secs(1),
                wait_timeout: Duration::from_secs(1),
            },
        ));
        let cancel = CancellationToken::new();

        let registry = WorkerRegistry::new(
            store.clone(),
            RegistryConfig {
                name: name.to_string(),
                address: format!("{name}:9000"),
                lease_ttl: 10,
                keepalive_interval: Duration::from_millis(50),
            },
        );
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            Arc::clone(&manager),
            SchedulerConfig {
                worker: name.to_string(),
                check_interval: Duration::from_millis(50),
                flow_interval: Duration::from_millis(50),
                cleanup_interval: Duration::from_millis(20),
                flow_record_enabled: true,
                watch_retry_interval: Duration::from_millis(50),
            },
        ));

        let handles = vec![
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    registry.run(cancel).await.unwrap();
                })
            },
            {
                let cancel = cancel.clone();
                let scheduler = Arc::clone(&scheduler);
                tokio::spawn(async move {
                    scheduler.run(cancel).await.unwrap();
                })
            },
        ];

        Self {
            manager,
            scheduler,
            units,
            cancel,
            handles,
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        for handle in self.handles {
            handle.await.unwrap();
        }
    }
}

async fn wait_for_units(manager: &Arc<PipelineManager>, ids: &[DataId]) {
    let manager = Arc::clone(manager);
    let ids = ids.to_vec();
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
        let manager = Arc::clone(&manager);
        let ids = ids.clone();
        async move { manager.data_ids() == ids }
    })
    .await;
}

#[tokio::test]
async fn items_reach_work_units_and_follow_worker_changes() {
    let (backend, store) = test_store();
    for id in 1..=4 {
        put_item(&backend, &id.to_string(), id, 1).await;
    }

    let w1 = Worker::start(&store, "w-1");
    let w2 = Worker::start(&store, "w-2");
    let leader = CancellationToken::new();
    start_candidate(
        &backend,
        "leader",
        dispatcher(&store, false, StaticFlows::new(&[])),
        leader.clone(),
    );

    wait_for_units(&w1.manager, &[2, 4]).await;
    wait_for_units(&w2.manager, &[1, 3]).await;

    // w-2 leaves: its registration goes away and its items move to w-1.
    let w2_units = Arc::clone(&w2.units);
    w2.stop().await;
    let stopped = w2_units.events();
    assert!(stopped.contains(&UnitEvent::Stopped(1)));
    assert!(stopped.contains(&UnitEvent::Stopped(3)));

    wait_for_units(&w1.manager, &[1, 2, 3, 4]).await;

    leader.cancel();
    w1.stop().await;
}

#[tokio::test]
async fn dead_units_are_restarted_and_flow_is_recorded() {
    let (backend, store) = test_store();
    put_item(&backend, "7", 7, 1).await;

    let worker = Worker::start(&store, "w-1");
    let leader = CancellationToken::new();
    start_candidate(
        &backend,
        "leader",
        dispatcher(&store, false, StaticFlows::new(&[])),
        leader.clone(),
    );
    wait_for_units(&worker.manager, &[7]).await;

    {
        let store = store.clone();
        wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
            let store = store.clone();
            async move {
                store
                    .list_flows()
                    .await
                    .unwrap()
                    .iter()
                    .any(|kv| kv.key == "/sd/flow/w-1/7" && kv.value == b"700".to_vec())
            }
        })
        .await;
    }

    assert!(worker.units.kill(7));
    {
        let units = Arc::clone(&worker.units);
        wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
            let units = Arc::clone(&units);
            async move { units.started(7) == 2 }
        })
        .await;
    }
    wait_for_units(&worker.manager, &[7]).await;

    leader.cancel();
    let units = Arc::clone(&worker.units);
    worker.stop().await;
    assert_eq!(units.events().last(), Some(&UnitEvent::Stopped(7)));
}

#[tokio::test]
async fn failing_restart_does_not_hold_up_new_shadows() {
    let (backend, store) = test_store();
    put_item(&backend, "7", 7, 1).await;

    let worker = Worker::start(&store, "w-1");
    let leader = CancellationToken::new();
    start_candidate(
        &backend,
        "leader",
        dispatcher(&store, false, StaticFlows::new(&[])),
        leader.clone(),
    );
    wait_for_units(&worker.manager, &[7]).await;

    worker.units.refuse(7, true);
    assert!(worker.units.kill(7));
    {
        let units = Arc::clone(&worker.units);
        wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
            let units = Arc::clone(&units);
            async move { units.refused(7) >= 2 }
        })
        .await;
    }

    // 7 keeps failing in the background while 8 arrives.
    put_item(&backend, "8", 8, 1).await;
    wait_for_units(&worker.manager, &[8]).await;
    assert_eq!(worker.scheduler.restarting(), vec![7]);

    // Losing the shadow ends the restart for good.
    backend.delete(&item_key("7")).await.unwrap();
    {
        let scheduler = Arc::clone(&worker.scheduler);
        wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.restarting().is_empty() }
        })
        .await;
    }
    let attempts = worker.units.refused(7);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(worker.units.refused(7), attempts);
    assert_eq!(worker.manager.data_ids(), vec![8]);

    leader.cancel();
    worker.stop().await;
}
