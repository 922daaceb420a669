//! End-to-end engine scenarios over the in-memory storage backend

use hiveflow_bitmap::RoaringBitmap;
use hiveflow_crowd::{CrowdLoader, KvLoader};
use hiveflow_engine::{Engine, EngineError, EngineOptions};
use hiveflow_meta::{
    Branch, InstanceState, Kv, LoaderKind, Notify, QueueKind, Step, UserEvent, Workflow,
};
use hiveflow_storage::{CommandResponse, MemoryStorage, Storage, StoreCommand};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const TENANT: u64 = 100;

fn test_options() -> EngineOptions {
    EngineOptions::default()
        .with_idle_interval(Duration::from_millis(20))
        .with_retry_interval(Duration::from_millis(100))
}

async fn setup() -> (Engine, Arc<MemoryStorage>) {
    let store = Arc::new(MemoryStorage::new());
    let engine = Engine::new(store.clone(), test_options());
    engine.start().unwrap();
    engine.tenant_init(TENANT, 4, 4).await.unwrap();
    (engine, store)
}

fn even_odd_workflow(id: u64) -> Workflow {
    Workflow::new(id, TENANT, "even-odd")
        .with_step(Step::conditional(
            "a",
            vec![Branch::new("uid % 2 == 0", "b")],
        ))
        .with_step(Step::sink("b"))
}

fn crowd(ids: impl IntoIterator<Item = u32>) -> Vec<u8> {
    hiveflow_bitmap::marshal(&ids.into_iter().collect::<RoaringBitmap>())
}

fn user_event(workflow_id: u64, instance_id: u64, user_id: u32) -> UserEvent {
    UserEvent {
        tenant_id: TENANT,
        workflow_id,
        instance_id,
        user_id,
        data: vec![Kv::new("src", "test")],
    }
}

/// Poll until `f` returns true or the deadline passes
async fn eventually<F, Fut>(what: &str, mut f: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if f().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn counts(engine: &Engine, workflow_id: u64) -> Option<Vec<(String, u64)>> {
    engine
        .instance_count_state(workflow_id)
        .await
        .ok()
        .map(|state| {
            state
                .states
                .iter()
                .map(|s| (s.step.clone(), s.count))
                .collect()
        })
}

async fn step_count(engine: &Engine, workflow_id: u64, step: &str) -> Option<u64> {
    counts(engine, workflow_id)
        .await?
        .into_iter()
        .find(|(name, _)| name == step)
        .map(|(_, count)| count)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_step_counts() {
    let (engine, _store) = setup().await;

    let instance_id = engine
        .start_instance(
            even_odd_workflow(1),
            LoaderKind::Raw,
            crowd([1, 2, 3, 4]),
            1,
        )
        .await
        .unwrap();

    eventually("instance running", || async {
        step_count(&engine, 1, "a").await == Some(4)
    })
    .await;

    for user in [1, 2, 3, 4] {
        engine
            .submit_event(user_event(1, instance_id, user))
            .await
            .unwrap();
    }

    eventually("even users moved to b", || async {
        step_count(&engine, 1, "b").await == Some(2)
    })
    .await;

    let state = engine.instance_count_state(1).await.unwrap();
    assert_eq!(state.total, 4);
    assert_eq!(step_count(&engine, 1, "a").await, Some(2));

    // the step crowd comes back as a TTL'd loader reference
    let step_ref = engine.instance_step_state(1, "b").await.unwrap();
    assert_eq!(step_ref.loader, LoaderKind::Kv);
    assert_eq!(step_ref.total_crowd, 2);

    engine.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_update_crowd_adds_and_drops() {
    let (engine, store) = setup().await;

    let instance_id = engine
        .start_instance(
            even_odd_workflow(2),
            LoaderKind::Raw,
            crowd([1, 2, 3, 4]),
            1,
        )
        .await
        .unwrap();

    for user in [1, 2, 3, 4] {
        engine
            .submit_event(user_event(2, instance_id, user))
            .await
            .unwrap();
    }
    eventually("initial split", || async {
        step_count(&engine, 2, "b").await == Some(2)
    })
    .await;

    // new total {2,3,4,5}: 5 admitted into step a, 1 dropped everywhere
    engine
        .update_crowd(2, LoaderKind::Raw, crowd([2, 3, 4, 5]))
        .await
        .unwrap();

    let loader = KvLoader::new(store.clone());
    eventually("crowd updated", || {
        let loader = &loader;
        let engine = &engine;
        async move {
            let Ok(step_ref) = engine.instance_step_state(2, "a").await else {
                return false;
            };
            let Ok(a_crowd) = loader.get(&step_ref.loader_meta).await else {
                return false;
            };
            a_crowd == [3u32, 5].into_iter().collect::<RoaringBitmap>()
        }
    })
    .await;

    let step_ref = engine.instance_step_state(2, "b").await.unwrap();
    let b_crowd = loader.get(&step_ref.loader_meta).await.unwrap();
    assert_eq!(b_crowd, [2u32, 4].into_iter().collect::<RoaringBitmap>());

    let state = engine.instance_count_state(2).await.unwrap();
    assert_eq!(state.total, 4);

    engine.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_four_shards_cover_the_crowd() {
    let (engine, store) = setup().await;

    engine
        .start_instance(even_odd_workflow(3), LoaderKind::Raw, crowd(1..=1000), 4)
        .await
        .unwrap();

    eventually("all shards created", || async {
        engine
            .instance_count_state(3)
            .await
            .map(|s| s.total == 1000)
            .unwrap_or(false)
    })
    .await;

    // four contiguous shards of 250 users each
    let mut ranges = Vec::new();
    for index in 0..4u32 {
        let data = store
            .get(&hiveflow_storage::keys::worker_state(3, index))
            .await
            .unwrap()
            .unwrap();
        let state: hiveflow_meta::WorkerState = serde_json::from_slice(&data).unwrap();
        assert_eq!(state.states[0].total_crowd, 250);
        ranges.push((state.start, state.end));
    }
    assert_eq!(ranges, vec![(1, 251), (251, 501), (501, 751), (751, 1001)]);

    engine.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_start_rejected() {
    let (engine, _store) = setup().await;

    engine
        .start_instance(even_odd_workflow(4), LoaderKind::Raw, crowd([1, 2]), 1)
        .await
        .unwrap();

    let result = engine
        .start_instance(even_odd_workflow(4), LoaderKind::Raw, crowd([3, 4]), 1)
        .await;
    assert!(matches!(result, Err(EngineError::Precondition(_))));

    engine.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_writes_history_snapshot() {
    let (engine, _store) = setup().await;

    let instance_id = engine
        .start_instance(
            even_odd_workflow(5),
            LoaderKind::Raw,
            crowd([1, 2, 3, 4]),
            1,
        )
        .await
        .unwrap();

    for user in [1, 2, 3, 4] {
        engine
            .submit_event(user_event(5, instance_id, user))
            .await
            .unwrap();
    }
    eventually("events processed", || async {
        step_count(&engine, 5, "b").await == Some(2)
    })
    .await;

    engine.stop_instance(5).await.unwrap();

    eventually("history written", || async {
        engine
            .history_instance(5, instance_id)
            .await
            .unwrap()
            .is_some()
    })
    .await;

    let snapshot = engine.history_instance(5, instance_id).await.unwrap().unwrap();
    assert_eq!(snapshot.instance.state, InstanceState::Stopped);
    assert!(snapshot.instance.stopped_at.unwrap() >= snapshot.instance.started_at.unwrap());

    // the per-step union equals the crowd at stop time
    let mut union = RoaringBitmap::new();
    for step in &snapshot.states {
        union |= hiveflow_bitmap::parse(&step.crowd).unwrap();
    }
    assert_eq!(union, (1u32..=4).collect::<RoaringBitmap>());

    // late events for the stopped instance are dropped silently
    engine
        .submit_event(user_event(5, instance_id, 2))
        .await
        .unwrap();

    engine.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_subtracts_previous_crowd() {
    let (engine, _store) = setup().await;

    let first = engine
        .start_instance(
            even_odd_workflow(6),
            LoaderKind::Raw,
            crowd([1, 2, 3, 4]),
            1,
        )
        .await
        .unwrap();
    eventually("first instance up", || async {
        step_count(&engine, 6, "a").await == Some(4)
    })
    .await;

    engine.stop_instance(6).await.unwrap();
    eventually("first instance stopped", || async {
        engine.history_instance(6, first).await.unwrap().is_some()
    })
    .await;

    // the new crowd {1..6} minus the previous {1..4} leaves {5,6}
    engine
        .start_instance(even_odd_workflow(6), LoaderKind::Raw, crowd(1..=6), 1)
        .await
        .unwrap();

    eventually("second instance up", || async {
        engine
            .instance_count_state(6)
            .await
            .map(|s| s.total == 2)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(step_count(&engine, 6, "a").await, Some(2));

    engine.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timer_step_moves_matching_users() {
    let (engine, _store) = setup().await;

    let workflow = Workflow::new(7, TENANT, "timed")
        .with_step(Step::timer("hold", 1, "uid % 2 == 0", "done"))
        .with_step(Step::sink("done"));

    engine
        .start_instance(workflow, LoaderKind::Raw, crowd([1, 2, 3, 4]), 1)
        .await
        .unwrap();

    eventually("timer moved the evens", || async {
        step_count(&engine, 7, "done").await == Some(2)
    })
    .await;
    assert_eq!(step_count(&engine, 7, "hold").await, Some(2));

    engine.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_terminal_transitions_notify_output_queue() {
    let (engine, store) = setup().await;

    let instance_id = engine
        .start_instance(even_odd_workflow(8), LoaderKind::Raw, crowd([2, 4]), 1)
        .await
        .unwrap();

    eventually("instance up", || async {
        step_count(&engine, 8, "a").await == Some(2)
    })
    .await;

    for user in [2, 4] {
        engine
            .submit_event(user_event(8, instance_id, user))
            .await
            .unwrap();
    }
    eventually("moved to terminal step", || async {
        step_count(&engine, 8, "b").await == Some(2)
    })
    .await;

    // read the output queue as an external consumer group
    let join = store
        .exec_command(StoreCommand::QueueJoinGroup {
            tenant: TENANT,
            kind: QueueKind::Output,
            group: "sink".to_string(),
        })
        .await
        .unwrap();
    let CommandResponse::Join(join) = join else {
        panic!("unexpected join response");
    };

    let mut notifies: Vec<Notify> = Vec::new();
    for (partition, version) in join.partitions.iter().zip(&join.versions) {
        let resp = store
            .exec_command(StoreCommand::QueueFetch {
                tenant: TENANT,
                kind: QueueKind::Output,
                partition: *partition,
                group: "sink".to_string(),
                consumer: join.index,
                version: *version,
                count: 100,
                max_bytes: 1 << 20,
            })
            .await
            .unwrap();
        let CommandResponse::Fetch(result) = resp else {
            panic!("unexpected fetch response");
        };
        for item in result.items {
            notifies.push(serde_json::from_slice(&item).unwrap());
        }
    }

    assert_eq!(notifies.len(), 1);
    assert_eq!(notifies[0].from_step, "a");
    assert_eq!(notifies[0].to_step, "b");
    let users = hiveflow_bitmap::parse(&notifies[0].users).unwrap();
    assert_eq!(users, [2u32, 4].into_iter().collect::<RoaringBitmap>());

    engine.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_update_workflow_in_band() {
    let (engine, _store) = setup().await;

    let instance_id = engine
        .start_instance(
            even_odd_workflow(9),
            LoaderKind::Raw,
            crowd([1, 2, 3, 4]),
            1,
        )
        .await
        .unwrap();

    for user in [1, 2, 3, 4] {
        engine
            .submit_event(user_event(9, instance_id, user))
            .await
            .unwrap();
    }
    eventually("initial split", || async {
        step_count(&engine, 9, "b").await == Some(2)
    })
    .await;

    // widen the guard so the remaining users pass too
    let updated = Workflow::new(9, TENANT, "even-odd")
        .with_step(Step::conditional("a", vec![Branch::new("all", "b")]))
        .with_step(Step::sink("b"));
    engine.update_workflow(updated).await.unwrap();

    for user in [1, 3] {
        engine
            .submit_event(user_event(9, instance_id, user))
            .await
            .unwrap();
    }

    eventually("everyone in b", || async {
        step_count(&engine, 9, "b").await == Some(4)
    })
    .await;
    assert_eq!(step_count(&engine, 9, "a").await, Some(0));

    engine.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_instance_without_instance_is_noop() {
    let (engine, _store) = setup().await;
    engine.stop_instance(9999).await.unwrap();
    engine.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_instance_count_state_unknown_workflow() {
    let (engine, _store) = setup().await;
    let result = engine.instance_count_state(424242).await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
    engine.stop();
}
