mod common;

use std::collections::BTreeMap;

use assignment_coordination::leader_election::get_leader;
use assignment_coordination::store::{CoordinationStore, KvPair};
use tokio_util::sync::CancellationToken;

use common::{
    dispatcher, item_config, item_key, put_item, register_services, shadow_key,
    shadows_by_worker, start_candidate, test_store, wait_for_condition, StaticFlows, POLL_INTERVAL,
    ROOT, WAIT_TIMEOUT,
};
use stream_dispatcher::converter::{decode_shadow, encode_shadow};
use stream_dispatcher::dispatcher::DispatchSummary;
use stream_dispatcher::error::Error;
use stream_dispatcher::types::{ServiceInfo, ServiceStatus};

fn expected(spec: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
    spec.iter()
        .map(|(worker, suffixes)| {
            (
                worker.to_string(),
                suffixes.iter().map(|s| s.to_string()).collect(),
            )
        })
        .collect()
}

#[tokio::test]
async fn dispatch_reconciles_existing_shadows() {
    let (backend, store) = test_store();
    let one = put_item(&backend, "1", 1, 1).await;
    let two = put_item(&backend, "2", 2, 1).await;
    let four = put_item(&backend, "4", 3, 1).await;
    put_item(&backend, "5", 4, 1).await;

    // 1 is current, 2 is an older copy, 3 no longer exists, 4 sits on a
    // worker that is gone.
    let stale_two = KvPair::new(two.key.clone(), two.value.clone(), two.version - 1);
    let gone = KvPair::new(item_key("3"), item_config(9, 1), 1);
    for (target, source) in [
        (shadow_key("a-2", "1"), &one),
        (shadow_key("b-3", "2"), &stale_two),
        (shadow_key("c-4", "3"), &gone),
        (shadow_key("e-5", "4"), &four),
    ] {
        store
            .put_shadow(&target, encode_shadow(source).unwrap())
            .await
            .unwrap();
    }
    let untouched_version = backend
        .get(&shadow_key("a-2", "1"))
        .await
        .unwrap()
        .unwrap()
        .version;

    register_services(&backend, &store, &["a-2", "b-3", "c-4", "d-1"]).await;

    let dispatcher = dispatcher(&store, false, StaticFlows::new(&[]));
    assert_eq!(dispatcher.recover().await.unwrap(), 4);

    let pairs = store.list_items().await.unwrap();
    let services = store.list_services().await.unwrap();
    let summary = dispatcher.dispatch(&pairs, &services).await.unwrap();
    assert_eq!(
        summary,
        DispatchSummary {
            written: 3,
            deleted: 2,
            failed: 0,
        }
    );

    assert_eq!(
        shadows_by_worker(&store).await,
        expected(&[
            ("a-2", &["1"]),
            ("b-3", &["2"]),
            ("c-4", &["4"]),
            ("d-1", &["5"]),
        ])
    );

    let kept = backend
        .get(&shadow_key("a-2", "1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(kept.version, untouched_version);

    let refreshed = backend
        .get(&shadow_key("b-3", "2"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(decode_shadow(&refreshed).unwrap(), two);

    // Nothing changed, nothing to do.
    let again = dispatcher.dispatch(&pairs, &services).await.unwrap();
    assert_eq!(again, DispatchSummary::default());
}

#[tokio::test]
async fn dispatch_without_workers_is_rejected() {
    let (backend, store) = test_store();
    put_item(&backend, "1", 1, 1).await;
    let dispatcher = dispatcher(&store, false, StaticFlows::new(&[]));

    let pairs = store.list_items().await.unwrap();
    let err = dispatcher.dispatch(&pairs, &[]).await.unwrap_err();
    assert!(matches!(err, Error::EmptyInput("services")));
    assert_eq!(dispatcher.current_plan().await.pair_count(), 0);
}

#[tokio::test]
async fn draining_workers_get_nothing() {
    let (backend, store) = test_store();
    put_item(&backend, "1", 1, 1).await;
    put_item(&backend, "2", 2, 1).await;
    let dispatcher = dispatcher(&store, false, StaticFlows::new(&[]));

    let services = vec![
        ServiceInfo {
            id: "a-1".to_string(),
            address: String::new(),
            status: ServiceStatus::Ready,
            registered_at: 0,
        },
        ServiceInfo {
            id: "b-2".to_string(),
            address: String::new(),
            status: ServiceStatus::Draining,
            registered_at: 0,
        },
    ];
    let pairs = store.list_items().await.unwrap();
    dispatcher.dispatch(&pairs, &services).await.unwrap();

    assert_eq!(
        shadows_by_worker(&store).await,
        expected(&[("a-1", &["1", "2"])])
    );
}

#[tokio::test]
async fn recover_rebuilds_the_plan_from_shadows() {
    let (backend, store) = test_store();
    let one = put_item(&backend, "1", 1, 1).await;
    let two = put_item(&backend, "2", 2, 1).await;
    let three = put_item(&backend, "3", 3, 1).await;

    store
        .put_shadow(&shadow_key("w-1", "1"), encode_shadow(&one).unwrap())
        .await
        .unwrap();
    store
        .put_shadow(&shadow_key("w-1", "2"), encode_shadow(&two).unwrap())
        .await
        .unwrap();
    store
        .put_shadow(&shadow_key("w-2", "3"), encode_shadow(&three).unwrap())
        .await
        .unwrap();
    store
        .put_shadow(&shadow_key("w-2", "9"), b"not a shadow".to_vec())
        .await
        .unwrap();

    let dispatcher = dispatcher(&store, false, StaticFlows::new(&[]));
    assert_eq!(dispatcher.recover().await.unwrap(), 3);

    let plan = dispatcher.current_plan().await;
    assert_eq!(plan.plans.len(), 2);
    let w1 = &plan.plans["w-1"].pairs[&item_key("2")];
    assert_eq!(w1.target, shadow_key("w-1", "2"));
    assert_eq!(w1.version, two.version);

    let mut visited = 0;
    dispatcher
        .visit_plan(|_, _| {
            visited += 1;
            true
        })
        .await;
    assert_eq!(visited, 3);

    let mut first = None;
    dispatcher
        .visit_plan(|service, pair| {
            first = Some((service.to_string(), pair.source.clone()));
            false
        })
        .await;
    assert_eq!(first, Some(("w-1".to_string(), item_key("1"))));
}

#[tokio::test]
async fn manual_pins_swap_items_between_workers() {
    let (backend, store) = test_store();
    for id in 1001..=1006 {
        put_item(&backend, &id.to_string(), id, 1).await;
    }
    register_services(&backend, &store, &["t-1", "t-2", "t-3"]).await;
    backend
        .put(
            &format!("{ROOT}/manual/1001"),
            br#"[{"name": "t-1"}]"#.to_vec(),
            None,
        )
        .await
        .unwrap();

    let dispatcher = dispatcher(&store, false, StaticFlows::new(&[]));
    let pairs = store.list_items().await.unwrap();
    let services = store.list_services().await.unwrap();
    dispatcher.dispatch(&pairs, &services).await.unwrap();

    // Hash alone puts 1001 on t-3 and 1002 on t-1; the pin swaps them.
    assert_eq!(
        shadows_by_worker(&store).await,
        expected(&[
            ("t-1", &["1001", "1005"]),
            ("t-2", &["1003", "1006"]),
            ("t-3", &["1002", "1004"]),
        ])
    );
}

#[tokio::test]
async fn pin_to_a_worker_the_balancer_left_empty() {
    let (backend, store) = test_store();
    put_item(&backend, "1001", 1001, 1).await;
    put_item(&backend, "1002", 1002, 1).await;
    register_services(&backend, &store, &["t-1", "t-2", "t-3"]).await;
    // Hash alone gives 1001 to t-3, 1002 to t-1 and nothing to t-2.
    backend
        .put(
            &format!("{ROOT}/manual/1001"),
            br#"[{"name": "t-2"}]"#.to_vec(),
            None,
        )
        .await
        .unwrap();

    let dispatcher = dispatcher(&store, false, StaticFlows::new(&[]));
    let pairs = store.list_items().await.unwrap();
    let services = store.list_services().await.unwrap();
    let summary = dispatcher.dispatch(&pairs, &services).await.unwrap();
    assert_eq!(summary.written, 2);

    assert_eq!(
        shadows_by_worker(&store).await,
        expected(&[("t-1", &["1002"]), ("t-2", &["1001"])])
    );
}

#[tokio::test]
async fn unusable_pins_do_not_block_the_dispatch() {
    let (backend, store) = test_store();
    for id in 1001..=1003 {
        put_item(&backend, &id.to_string(), id, 1).await;
    }
    register_services(&backend, &store, &["t-1", "t-2", "t-3"]).await;
    for (id, body) in [
        (9999, r#"[{"name": "t-1"}]"#),
        (1001, r#"[{"name": "t-9"}]"#),
        (1002, "not json"),
    ] {
        backend
            .put(&format!("{ROOT}/manual/{id}"), body.as_bytes().to_vec(), None)
            .await
            .unwrap();
    }

    let dispatcher = dispatcher(&store, false, StaticFlows::new(&[]));
    let pairs = store.list_items().await.unwrap();
    let services = store.list_services().await.unwrap();
    dispatcher.dispatch(&pairs, &services).await.unwrap();

    assert_eq!(
        shadows_by_worker(&store).await,
        expected(&[("t-1", &["1002"]), ("t-2", &["1003"]), ("t-3", &["1001"])])
    );
}

#[tokio::test]
async fn auto_balancing_packs_equal_flow_groups() {
    let (backend, store) = test_store();
    put_item(&backend, "1001", 1001, 8).await;
    put_item(&backend, "1002", 1002, 4).await;
    register_services(&backend, &store, &["w-0", "w-1", "w-2", "w-3"]).await;

    let dispatcher = dispatcher(
        &store,
        true,
        StaticFlows::new(&[(1001, 1000), (1002, 500)]),
    );
    let pairs = store.list_items().await.unwrap();
    let services = store.list_services().await.unwrap();
    dispatcher.dispatch(&pairs, &services).await.unwrap();

    // 12 partitions weighing 10000 in total pack into four groups of 2500:
    // two partitions of 1001 and one of 1002 each.
    let plan = dispatcher.current_plan().await;
    assert_eq!(plan.assignment.all.len(), 4);
    for group in plan.assignment.all.values() {
        let mut ids: Vec<i64> = group.iter().map(|e| e.id).collect();
        ids.sort();
        assert_eq!(ids, vec![1001, 1001, 1002]);
    }
    for suffixes in shadows_by_worker(&store).await.values() {
        assert_eq!(suffixes, &vec!["1001".to_string(), "1002".to_string()]);
    }

    // Stable flow, same inputs: the grouping is kept and nothing is written.
    let again = dispatcher.dispatch(&pairs, &services).await.unwrap();
    assert_eq!(again, DispatchSummary::default());
}

#[tokio::test]
async fn leader_dispatches_and_a_standby_takes_over() {
    let (backend, store) = test_store();
    for id in 1..=4 {
        put_item(&backend, &id.to_string(), id, 1).await;
    }
    register_services(&backend, &store, &["w-1", "w-2"]).await;

    let first = CancellationToken::new();
    let second = CancellationToken::new();
    start_candidate(
        &backend,
        "c-1",
        dispatcher(&store, false, StaticFlows::new(&[])),
        first.clone(),
    );

    {
        let store = store.clone();
        wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
            let store = store.clone();
            async move { store.list_shadows().await.unwrap().len() == 4 }
        })
        .await;
    }
    assert_eq!(
        shadows_by_worker(&store).await,
        expected(&[("w-1", &["2", "4"]), ("w-2", &["1", "3"])])
    );

    start_candidate(
        &backend,
        "c-2",
        dispatcher(&store, false, StaticFlows::new(&[])),
        second.clone(),
    );

    // The first leader dies without cleaning up.
    first.cancel();
    let leader = get_leader(&backend, &format!("{ROOT}/leader"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(leader.holder, "c-1");
    backend.expire_lease(leader.lease_id).unwrap();

    put_item(&backend, "5", 5, 1).await;
    {
        let backend = backend.clone();
        let store = store.clone();
        wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
            let backend = backend.clone();
            let store = store.clone();
            async move {
                let leader = get_leader(&backend, &format!("{ROOT}/leader"))
                    .await
                    .unwrap();
                leader.is_some_and(|l| l.holder == "c-2")
                    && store.list_shadows().await.unwrap().len() == 5
            }
        })
        .await;
    }
    assert_eq!(
        shadows_by_worker(&store).await,
        expected(&[("w-1", &["2", "4"]), ("w-2", &["1", "3", "5"])])
    );

    second.cancel();
}
