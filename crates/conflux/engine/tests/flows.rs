use conflux_engine::{
    flow_fn, task_fn, FailurePropagation, FlowRegistry, FlowSpec, Orchestrator,
    OrchestratorConfig, RunRecorder, TaskSpec,
};
use conflux_tracker::{InMemoryResultStore, InMemoryRunTracker, RunFilter, RunQuery, RunTracker};
use conflux_types::{
    Failure, FlowRun, Parameters, RetryCondition, RetryPolicy, RunId, RunKind, State, StateType,
    TrackedRun,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

struct Harness {
    tracker: Arc<InMemoryRunTracker>,
    registry: Arc<FlowRegistry>,
    orchestrator: Orchestrator,
}

fn harness_with(config: OrchestratorConfig) -> Harness {
    let tracker = Arc::new(InMemoryRunTracker::new());
    let registry = Arc::new(FlowRegistry::new());
    let orchestrator = Orchestrator::new(
        tracker.clone(),
        Arc::new(InMemoryResultStore::new()),
        registry.clone(),
        config,
    );
    Harness {
        tracker,
        registry,
        orchestrator,
    }
}

fn harness() -> Harness {
    harness_with(OrchestratorConfig {
        archive_task_runs: false,
        rng_seed: Some(7),
        ..OrchestratorConfig::default()
    })
}

fn always_failing(max_attempts: u32) -> TaskSpec {
    TaskSpec::new(
        "flaky",
        task_fn(|_ctx, _params| async {
            Err::<Value, _>(Failure::new("TransientError", "upstream timeout"))
        }),
    )
    .with_retry_policy(RetryPolicy::fixed(max_attempts, Duration::from_millis(5)))
}

async fn task_runs(h: &Harness, flow_run: &conflux_types::FlowRunId) -> Vec<conflux_tracker::RunSnapshot> {
    RunQuery::new(h.tracker.clone(), RunFilter::task_runs_of(*flow_run))
        .collect()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_failing_task_exhausts_attempts_and_fails_flow() {
    let h = harness();
    let task = always_failing(2);
    h.registry.register(FlowSpec::new(
        "etl",
        flow_fn(move |ctx, _params| {
            let task = task.clone();
            async move { ctx.run_task(&task, Parameters::new()).await }
        }),
    ));

    let outcome = h.orchestrator.invoke("etl", Parameters::new()).await.unwrap();
    assert_eq!(outcome.state_type(), StateType::Failed);
    assert_eq!(outcome.failure.as_ref().map(|f| f.kind.as_str()), Some("TransientError"));

    let attempts = task_runs(&h, &outcome.flow_run_id).await;
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|s| s.state_type() == StateType::Failed));
    let mut numbers: Vec<u32> = attempts
        .iter()
        .filter_map(|s| s.run.as_task().map(|t| t.attempt))
        .collect();
    numbers.sort();
    assert_eq!(numbers, vec![1, 2]);

    // Every attempt shares the invocation key
    let keys: Vec<_> = attempts
        .iter()
        .filter_map(|s| s.run.as_task().map(|t| t.task_key.clone()))
        .collect();
    assert_eq!(keys[0], keys[1]);
}

#[tokio::test]
async fn test_retry_then_success() {
    let h = harness();
    let task = TaskSpec::new(
        "fetch",
        task_fn(|ctx, _params| async move {
            if ctx.attempt() < 3 {
                Err(Failure::new("TransientError", "not yet"))
            } else {
                Ok(json!({"rows": 42}))
            }
        }),
    )
    .with_retry_policy(RetryPolicy::exponential(
        5,
        Duration::from_millis(1),
        Duration::from_millis(10),
    ));
    h.registry.register(FlowSpec::new(
        "etl",
        flow_fn(move |ctx, _params| {
            let task = task.clone();
            async move { ctx.run_task(&task, Parameters::new()).await }
        }),
    ));

    let outcome = h.orchestrator.invoke("etl", Parameters::new()).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(outcome.value, Some(json!({"rows": 42})));
    assert!(outcome.state.result.is_some());

    let attempts = task_runs(&h, &outcome.flow_run_id).await;
    assert_eq!(attempts.len(), 3);
    let completed: Vec<_> = attempts
        .iter()
        .filter(|s| s.state_type() == StateType::Completed)
        .collect();
    assert_eq!(completed.len(), 1);
    assert!(completed[0].state().result.is_some());
}

#[tokio::test]
async fn test_non_retryable_failure_gives_up_immediately() {
    let h = harness();
    let task = TaskSpec::new(
        "validate",
        task_fn(|_ctx, _params| async {
            Err::<Value, _>(Failure::new("ValidationError", "bad row"))
        }),
    )
    .with_retry_policy(
        RetryPolicy::fixed(5, Duration::ZERO)
            .with_condition(RetryCondition::Only(vec!["TransientError".into()])),
    );
    h.registry.register(FlowSpec::new(
        "etl",
        flow_fn(move |ctx, _params| {
            let task = task.clone();
            async move { ctx.run_task(&task, Parameters::new()).await }
        }),
    ));

    let outcome = h.orchestrator.invoke("etl", Parameters::new()).await.unwrap();
    assert_eq!(outcome.state_type(), StateType::Failed);
    assert_eq!(task_runs(&h, &outcome.flow_run_id).await.len(), 1);
}

#[tokio::test]
async fn test_independent_tasks_complete_before_flow() {
    let h = harness();
    let double = TaskSpec::new(
        "double",
        task_fn(|_ctx, params| async move {
            let n = params.get("n").and_then(Value::as_i64).unwrap_or(0);
            Ok::<_, Failure>(json!(n * 2))
        }),
    );
    h.registry.register(FlowSpec::new(
        "fan-out",
        flow_fn(move |ctx, _params| {
            let double = double.clone();
            async move {
                let mut a = Parameters::new();
                a.insert("n".into(), json!(1));
                let mut b = Parameters::new();
                b.insert("n".into(), json!(2));
                let handles = vec![
                    ctx.submit(&double, a).map_err(|e| Failure::new("Submit", e.to_string()))?,
                    ctx.submit(&double, b).map_err(|e| Failure::new("Submit", e.to_string()))?,
                ];
                let values = ctx
                    .join_all(handles)
                    .await
                    .into_iter()
                    .collect::<Result<Vec<_>, _>>()?;
                Ok::<_, Failure>(json!(values))
            }
        }),
    ));

    let outcome = h.orchestrator.invoke("fan-out", Parameters::new()).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(outcome.value, Some(json!([2, 4])));

    let tasks = task_runs(&h, &outcome.flow_run_id).await;
    assert_eq!(tasks.len(), 2);
    for task in &tasks {
        assert_eq!(task.state_type(), StateType::Completed);
        assert!(task.state().timestamp < outcome.state.timestamp);
    }
}

#[tokio::test]
async fn test_cancel_running_flow_with_in_flight_task() {
    let h = harness();
    let slow = TaskSpec::new(
        "slow",
        task_fn(|_ctx, _params| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, Failure>(Value::Null)
        }),
    );
    h.registry.register(FlowSpec::new(
        "long",
        flow_fn(move |ctx, _params| {
            let slow = slow.clone();
            async move { ctx.run_task(&slow, Parameters::new()).await }
        }),
    ));

    let mut events = h.tracker.subscribe();
    let orchestrator = h.orchestrator.clone();
    let running = tokio::spawn(async move { orchestrator.invoke("long", Parameters::new()).await });

    let flow_run_id = loop {
        let event = events.recv().await.unwrap();
        if event.kind == RunKind::Task && event.to == StateType::Running {
            break event.flow_run_id;
        }
    };
    assert!(h.orchestrator.cancel(&flow_run_id).await.unwrap());

    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome.state_type(), StateType::Cancelled);

    let tasks = task_runs(&h, &flow_run_id).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].state_type(), StateType::Cancelled);
    assert!(tasks[0]
        .history()
        .iter()
        .all(|t| t.to.state_type != StateType::Completed));
    assert!(h.orchestrator.active_flow_runs().is_empty());
}

#[tokio::test]
async fn test_task_panic_is_a_failure() {
    let h = harness();
    let boom = TaskSpec::new(
        "boom",
        task_fn(|_ctx, _params| async {
            if true {
                panic!("index out of bounds");
            }
            Ok::<_, Failure>(Value::Null)
        }),
    );
    h.registry.register(FlowSpec::new(
        "etl",
        flow_fn(move |ctx, _params| {
            let boom = boom.clone();
            async move { ctx.run_task(&boom, Parameters::new()).await }
        }),
    ));

    let outcome = h.orchestrator.invoke("etl", Parameters::new()).await.unwrap();
    assert_eq!(outcome.state_type(), StateType::Failed);
    let failure = outcome.failure.unwrap();
    assert!(failure.is_kind(Failure::PANIC));
    assert!(failure.message.contains("index out of bounds"));
}

#[tokio::test]
async fn test_failure_propagation_modes() {
    let h = harness();
    let task = always_failing(1);
    let body = flow_fn(move |ctx, _params| {
        let task = task.clone();
        async move {
            // Swallow the failure
            let _ = ctx.run_task(&task, Parameters::new()).await;
            Ok::<_, Failure>(json!("recovered"))
        }
    });
    h.registry.register(FlowSpec::new("lenient", body.clone()));
    h.registry.register(
        FlowSpec::new("strict", body).with_failure_propagation(FailurePropagation::AnyTaskFailure),
    );

    let lenient = h.orchestrator.invoke("lenient", Parameters::new()).await.unwrap();
    assert_eq!(lenient.state_type(), StateType::Completed);

    let strict = h.orchestrator.invoke("strict", Parameters::new()).await.unwrap();
    assert_eq!(strict.state_type(), StateType::Failed);
}

#[tokio::test]
async fn test_subflow_records_parent_task_run() {
    let h = harness();
    h.registry.register(FlowSpec::new(
        "child",
        flow_fn(|_ctx, params| async move { Ok::<_, Failure>(Value::Object(params)) }),
    ));
    h.registry.register(FlowSpec::new(
        "parent",
        flow_fn(|ctx, _params| async move {
            let mut params = Parameters::new();
            params.insert("region".into(), json!("eu"));
            ctx.run_subflow("child", params).await
        }),
    ));

    let outcome = h.orchestrator.invoke("parent", Parameters::new()).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(outcome.value, Some(json!({"region": "eu"})));

    let wrappers = task_runs(&h, &outcome.flow_run_id).await;
    assert_eq!(wrappers.len(), 1);
    assert_eq!(wrappers[0].state_type(), StateType::Completed);
    let wrapper_id = wrappers[0].run.as_task().map(|t| t.id);

    let children = RunQuery::new(h.tracker.clone(), RunFilter::flow_runs().with_flow_name("child"))
        .collect()
        .await
        .unwrap();
    assert_eq!(children.len(), 1);
    let child = children[0].run.as_flow().unwrap();
    assert_eq!(child.parent_task_run, wrapper_id);
    assert_eq!(child.state_type(), StateType::Completed);
}

#[tokio::test]
async fn test_unknown_subflow_fails_the_body() {
    let h = harness();
    h.registry.register(FlowSpec::new(
        "parent",
        flow_fn(|ctx, _params| async move { ctx.run_subflow("missing", Parameters::new()).await }),
    ));
    let outcome = h.orchestrator.invoke("parent", Parameters::new()).await.unwrap();
    assert_eq!(outcome.state_type(), StateType::Failed);
}

#[tokio::test]
async fn test_run_flow_from_scheduled() {
    let h = harness();
    h.registry.register(FlowSpec::new(
        "etl",
        flow_fn(|_ctx, _params| async { Ok::<_, Failure>(Value::Null) }),
    ));
    let run = FlowRun::new("etl", Parameters::new(), State::scheduled(chrono::Utc::now()));
    h.tracker.register(run.clone().into()).await.unwrap();

    let outcome = h.orchestrator.run_flow(run.clone()).await.unwrap();
    assert!(outcome.is_completed());

    let snapshot = h.tracker.get(&run.run_id()).await.unwrap();
    let states: Vec<_> = snapshot.history().iter().map(|t| t.to.state_type).collect();
    assert_eq!(
        states,
        vec![
            StateType::Scheduled,
            StateType::Pending,
            StateType::Running,
            StateType::Completed
        ]
    );
}

#[tokio::test]
async fn test_run_flow_registers_unknown_run() {
    let h = harness();
    h.registry.register(FlowSpec::new(
        "etl",
        flow_fn(|_ctx, _params| async { Ok::<_, Failure>(json!("ok")) }),
    ));
    let run = FlowRun::new("etl", Parameters::new(), State::pending());

    let outcome = h.orchestrator.run_flow(run.clone()).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(outcome.value, Some(json!("ok")));
    let snapshot = h.tracker.get(&run.run_id()).await.unwrap();
    assert_eq!(snapshot.state_type(), StateType::Completed);
    assert!(h.orchestrator.active_flow_runs().is_empty());
}

#[tokio::test]
async fn test_run_flow_unknown_flow_is_not_tracked() {
    let h = harness();
    let run = FlowRun::new("nope", Parameters::new(), State::pending());
    assert!(h.orchestrator.run_flow(run.clone()).await.is_err());
    assert!(h.tracker.get(&run.run_id()).await.is_err());
    assert!(h.orchestrator.active_flow_runs().is_empty());
}

#[tokio::test]
async fn test_cancel_before_start() {
    let h = harness();
    h.registry.register(FlowSpec::new(
        "etl",
        flow_fn(|_ctx, _params| async { Ok::<_, Failure>(Value::Null) }),
    ));
    let run = FlowRun::new("etl", Parameters::new(), State::pending());
    h.tracker.register(run.clone().into()).await.unwrap();

    assert!(h.orchestrator.cancel(&run.id).await.unwrap());
    assert!(!h.orchestrator.cancel(&run.id).await.unwrap());

    let outcome = h.orchestrator.run_flow(run).await.unwrap();
    assert_eq!(outcome.state_type(), StateType::Cancelled);
}

#[tokio::test]
async fn test_flow_crashed_elsewhere_stops_driving() {
    let h = harness_with(OrchestratorConfig {
        heartbeat_interval: Duration::from_millis(10),
        archive_task_runs: true,
        rng_seed: Some(3),
    });
    let gate = Arc::new(Semaphore::new(0));
    let gated = {
        let gate = gate.clone();
        TaskSpec::new(
            "gated",
            task_fn(move |_ctx, _params| {
                let gate = gate.clone();
                async move {
                    let _permit = gate.acquire().await;
                    Ok::<_, Failure>(json!("done"))
                }
            }),
        )
    };
    let after = TaskSpec::new(
        "after",
        task_fn(|_ctx, _params| async { Ok::<_, Failure>(Value::Null) }),
    );
    h.registry.register(FlowSpec::new(
        "etl",
        flow_fn(move |ctx, _params| {
            let gated = gated.clone();
            let after = after.clone();
            async move {
                let _ = ctx.run_task(&gated, Parameters::new()).await;
                ctx.run_task(&after, Parameters::new()).await
            }
        }),
    ));

    let mut events = h.tracker.subscribe();
    let orchestrator = h.orchestrator.clone();
    let running = tokio::spawn(async move { orchestrator.invoke("etl", Parameters::new()).await });

    let (flow_run_id, task_run_id) = loop {
        let event = events.recv().await.unwrap();
        if event.kind == RunKind::Task && event.to == StateType::Running {
            break (event.flow_run_id, event.run_id);
        }
    };

    // Another writer decides the run is dead
    let recorder = RunRecorder::new(h.tracker.clone());
    let snapshot = h.tracker.get(&task_run_id).await.unwrap();
    let mut task = snapshot.run.as_task().cloned().unwrap();
    recorder
        .transition(&mut task, State::crashed("worker lost"))
        .await
        .unwrap();
    let snapshot = h.tracker.get(&RunId::Flow(flow_run_id)).await.unwrap();
    let mut flow = snapshot.run.as_flow().cloned().unwrap();
    recorder
        .transition(&mut flow, State::crashed("worker lost"))
        .await
        .unwrap();

    gate.add_permits(1);
    let outcome = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome.state_type(), StateType::Crashed);

    let tasks = task_runs(&h, &flow_run_id).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].state_type(), StateType::Crashed);
    assert!(tasks
        .iter()
        .flat_map(|t| t.history().iter())
        .all(|t| t.to.state_type != StateType::Completed));
    assert!(tasks.iter().all(|t| t.archived));

    let stored = h.tracker.get(&RunId::Flow(flow_run_id)).await.unwrap();
    assert_eq!(stored.state_type(), StateType::Crashed);
    assert!(h.orchestrator.active_flow_runs().is_empty());
}

#[tokio::test]
async fn test_cancel_before_start_archives_task_runs() {
    let h = harness_with(OrchestratorConfig {
        archive_task_runs: true,
        rng_seed: Some(5),
        ..OrchestratorConfig::default()
    });
    let run = FlowRun::new("etl", Parameters::new(), State::pending());
    h.tracker.register(run.clone().into()).await.unwrap();
    let leftover = conflux_types::TaskRun::new(
        run.id,
        "extract",
        conflux_types::TaskKey::for_invocation("extract", 0),
        1,
        RetryPolicy::none(),
        State::scheduled(chrono::Utc::now()),
    );
    h.tracker.register(leftover.into()).await.unwrap();

    assert!(h.orchestrator.cancel(&run.id).await.unwrap());
    let tasks = task_runs(&h, &run.id).await;
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].archived);
}

#[tokio::test]
async fn test_heartbeats_and_archiving() {
    let h = harness_with(OrchestratorConfig {
        heartbeat_interval: Duration::from_millis(10),
        archive_task_runs: true,
        rng_seed: Some(1),
    });
    let nap = TaskSpec::new(
        "nap",
        task_fn(|_ctx, _params| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, Failure>(Value::Null)
        }),
    );
    h.registry.register(FlowSpec::new(
        "etl",
        flow_fn(move |ctx, _params| {
            let nap = nap.clone();
            async move { ctx.run_task(&nap, Parameters::new()).await }
        }),
    ));

    let outcome = h.orchestrator.invoke("etl", Parameters::new()).await.unwrap();
    let snapshot = h.tracker.get(&RunId::Flow(outcome.flow_run_id)).await.unwrap();
    assert!(snapshot.last_heartbeat.is_some());

    let tasks = task_runs(&h, &outcome.flow_run_id).await;
    assert!(tasks.iter().all(|t| t.archived));
    let unarchived = RunQuery::new(
        h.tracker.clone(),
        RunFilter::task_runs_of(outcome.flow_run_id).archived(false),
    )
    .collect()
    .await
    .unwrap();
    assert!(unarchived.is_empty());
}

#[tokio::test]
async fn test_invoke_unknown_flow() {
    let h = harness();
    assert!(h.orchestrator.invoke("nope", Parameters::new()).await.is_err());
}
