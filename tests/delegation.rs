//! End-to-end delegation tests
//!
//! Drives the router through scripted role runners and recording tools:
//! capability enforcement across the tree, batch ordering, cancellation,
//! deadlines, and the retry policy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use conclave::{
    role, Capability, ConclaveError, DelegationRequest, DelegationRouter, FnRunner, RoleRegistry,
    RoleRunner, RouterConfig, RouterEvent, TaskScope, TaskStatus, Tool, ToolError, ToolGateway,
    ToolInvocation,
};

/// Tool that counts invocations and returns a fixed payload.
struct CannedTool {
    calls: AtomicUsize,
    payload: Value,
    fail_first: usize,
    idempotent: bool,
}

impl CannedTool {
    fn new(payload: Value) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            payload,
            fail_first: 0,
            idempotent: false,
        })
    }

    fn flaky(payload: Value, fail_first: usize, idempotent: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            payload,
            fail_first,
            idempotent,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for CannedTool {
    async fn call(&self, _invocation: ToolInvocation, _args: Value) -> Result<Value, ToolError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Err(ToolError::new("transient failure"));
        }
        Ok(self.payload.clone())
    }

    fn idempotent(&self) -> bool {
        self.idempotent
    }
}

fn build_router(
    runner: Arc<dyn RoleRunner>,
    config: RouterConfig,
    tools: Vec<(Capability, Arc<CannedTool>)>,
) -> Arc<DelegationRouter> {
    let registry = Arc::new(RoleRegistry::with_defaults());
    let mut gateway = ToolGateway::new(Arc::clone(&registry));
    for (capability, tool) in tools {
        gateway.register_tool(capability, tool);
    }
    DelegationRouter::new(registry, Arc::new(gateway), runner, config)
}

#[tokio::test]
async fn coder_delegates_search_to_researcher() {
    let locations = json!([
        { "file": "src/parser.rs", "line": 41 },
        { "file": "src/eval.rs", "line": 102 },
        { "file": "tests/parse.rs", "line": 9 },
    ]);
    let search = CannedTool::new(locations.clone());

    let runner = Arc::new(FnRunner::new(|scope: TaskScope| async move {
        match scope.role_id().as_str() {
            role::CODER => {
                let outcome = scope
                    .delegate(DelegationRequest::new(role::RESEARCHER, "find callers of X"))
                    .await;
                match outcome {
                    Ok(found) => Ok(json!({ "callers": found })),
                    Err(failure) => Err(failure.error),
                }
            }
            _ => scope.invoke(Capability::Search, json!({ "query": "X" })).await,
        }
    }));

    let router = build_router(
        runner,
        RouterConfig::default(),
        vec![(Capability::Search, search.clone())],
    );

    let outcome = router.run_root_task(role::CODER.into(), "trace usages of X").await;
    let value = outcome.unwrap();
    assert_eq!(value["callers"], locations);
    assert_eq!(value["callers"].as_array().unwrap().len(), 3);
    assert_eq!(search.calls(), 1);

    // no capability errors anywhere in the chain
    assert!(router.gateway().audit().iter().all(|record| record.granted));
}

#[tokio::test]
async fn researcher_write_attempt_is_denied_without_side_effect() {
    let write = CannedTool::new(json!("written"));

    let runner = Arc::new(FnRunner::new(|scope: TaskScope| async move {
        match scope.role_id().as_str() {
            role::CODER => {
                let outcome = scope
                    .delegate(DelegationRequest::new(role::RESEARCHER, "update the notes"))
                    .await;
                match outcome {
                    Ok(_) => Ok(json!("child unexpectedly wrote")),
                    Err(failure) => Err(failure.error),
                }
            }
            _ => {
                scope
                    .invoke(Capability::WriteFile, json!({ "path": "notes.md" }))
                    .await
            }
        }
    }));

    let router = build_router(
        runner,
        RouterConfig::default(),
        vec![(Capability::WriteFile, write.clone())],
    );

    let failure = router
        .run_root_task(role::CODER.into(), "root work")
        .await
        .unwrap_err();

    assert_eq!(
        failure.error,
        ConclaveError::CapabilityDenied {
            role: role::RESEARCHER.into(),
            capability: "write_file".into(),
        }
    );
    // the denial never reached the collaborator
    assert_eq!(write.calls(), 0);
    // and it is on the audit trail
    assert!(router.gateway().audit().iter().any(|record| !record.granted));
}

#[tokio::test]
async fn batch_outcomes_preserve_request_order() {
    // second and third children finish well before the first
    let runner = Arc::new(FnRunner::new(|scope: TaskScope| async move {
        match scope.role_id().as_str() {
            role::CODER => {
                let outcomes = scope
                    .delegate_many(vec![
                        DelegationRequest::new(role::RESEARCHER, "slow"),
                        DelegationRequest::new(role::RESEARCHER, "fast"),
                        DelegationRequest::new(role::RESEARCHER, "medium"),
                    ])
                    .await;
                let values: Vec<Value> = outcomes.into_iter().map(|o| o.unwrap()).collect();
                Ok(Value::Array(values))
            }
            _ => {
                let delay = match scope.task() {
                    "slow" => 80,
                    "medium" => 30,
                    _ => 5,
                };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(json!(scope.task()))
            }
        }
    }));

    let router = build_router(runner, RouterConfig::default(), Vec::new());
    let outcome = router.run_root_task(role::CODER.into(), "fan out").await;
    assert_eq!(outcome.unwrap(), json!(["slow", "fast", "medium"]));
}

#[tokio::test]
async fn cancelling_parent_resolves_children_first() {
    let runner = Arc::new(FnRunner::new(|scope: TaskScope| async move {
        match scope.role_id().as_str() {
            role::CODER => {
                let outcomes = scope
                    .delegate_many(vec![
                        DelegationRequest::new(role::RESEARCHER, "wait a"),
                        DelegationRequest::new(role::RESEARCHER, "wait b"),
                    ])
                    .await;
                let _ = outcomes;
                Ok(json!("unreachable"))
            }
            _ => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!("never"))
            }
        }
    }));

    let router = build_router(runner, RouterConfig::default(), Vec::new());
    let mut events = router.subscribe();

    let worker = {
        let router = Arc::clone(&router);
        tokio::spawn(async move { router.run_root_task(role::CODER.into(), "parent work").await })
    };

    // wait until the root is running and both children exist, then cancel
    let mut root_id = None;
    let mut delegated = 0;
    while let Some(event) = events.recv().await {
        match event {
            RouterEvent::TaskStarted { id, role } if role.as_str() == role::CODER => {
                root_id = Some(id);
            }
            RouterEvent::TaskDelegated { .. } => {
                delegated += 1;
                if delegated == 2 {
                    break;
                }
            }
            _ => {}
        }
    }
    router.cancel(root_id.expect("root started"));

    let failure = worker.await.unwrap().unwrap_err();
    assert_eq!(failure.error, ConclaveError::Cancelled);

    // both children settled as cancelled before the parent's outcome
    let mut resolutions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RouterEvent::TaskResolved { role, status, error, .. } = event {
            resolutions.push((role.as_str().to_string(), status, error));
        }
    }
    assert_eq!(resolutions.len(), 3);
    for (role_name, status, error) in &resolutions[..2] {
        assert_eq!(role_name, role::RESEARCHER);
        assert_eq!(*status, TaskStatus::Failed);
        assert_eq!(*error, Some(ConclaveError::Cancelled));
    }
    assert_eq!(resolutions[2].0, role::CODER);
    assert_eq!(resolutions[2].2, Some(ConclaveError::Cancelled));
}

#[tokio::test]
async fn deadline_resolves_child_as_timeout() {
    let runner = Arc::new(FnRunner::new(|scope: TaskScope| async move {
        match scope.role_id().as_str() {
            role::CODER => {
                let outcome = scope
                    .delegate(
                        DelegationRequest::new(role::RESEARCHER, "stall")
                            .with_deadline(Duration::from_millis(50)),
                    )
                    .await;
                let failure = outcome.expect_err("child should time out");
                assert_eq!(failure.error, ConclaveError::Timeout);
                // the parent recovers instead of propagating
                Ok(json!("gave up on the child"))
            }
            _ => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!("never"))
            }
        }
    }));

    let router = build_router(runner, RouterConfig::default(), Vec::new());
    let outcome = router.run_root_task(role::CODER.into(), "root").await;
    assert_eq!(outcome.unwrap(), json!("gave up on the child"));
}

#[tokio::test]
async fn delegation_loop_detected_at_depth_two() {
    let runner = Arc::new(FnRunner::new(|scope: TaskScope| async move {
        match scope.role_id().as_str() {
            role::CODER => {
                let outcome = scope
                    .delegate(DelegationRequest::new(role::PLANNER, "plan X"))
                    .await;
                let failure = outcome.expect_err("loop should surface through the planner");
                assert_eq!(
                    failure.error,
                    ConclaveError::DelegationLoop { role: role::CODER.into() }
                );
                // the chain names the roles that produced it, root first
                assert_eq!(failure.chain.len(), 2);
                assert_eq!(failure.chain[0].role.as_str(), role::CODER);
                assert_eq!(failure.chain[1].role.as_str(), role::PLANNER);
                Ok(json!("loop caught"))
            }
            // the planner tries to hand the root's exact task back to coder
            _ => {
                let outcome = scope
                    .delegate(DelegationRequest::new(role::CODER, "implement X"))
                    .await;
                match outcome {
                    Ok(v) => Ok(v),
                    Err(failure) => Err(failure.error),
                }
            }
        }
    }));

    let router = build_router(runner, RouterConfig::default(), Vec::new());
    let outcome = router.run_root_task(role::CODER.into(), "implement X").await;
    assert_eq!(outcome.unwrap(), json!("loop caught"));
}

#[tokio::test]
async fn idempotent_tool_failure_is_retried() {
    let search = CannedTool::flaky(json!("found"), 1, true);

    let runner = Arc::new(FnRunner::new(|scope: TaskScope| async move {
        scope.invoke(Capability::Search, json!({ "query": "y" })).await
    }));

    let router = build_router(
        runner,
        RouterConfig { tool_retries: 1, ..Default::default() },
        vec![(Capability::Search, search.clone())],
    );

    let outcome = router.run_root_task(role::CODER.into(), "search").await;
    assert_eq!(outcome.unwrap(), json!("found"));
    assert_eq!(search.calls(), 2);
}

#[tokio::test]
async fn non_idempotent_tool_failure_is_not_retried() {
    let shell = CannedTool::flaky(json!("ran"), 1, false);

    let runner = Arc::new(FnRunner::new(|scope: TaskScope| async move {
        scope.invoke(Capability::ExecuteShell, json!({ "cmd": "make" })).await
    }));

    let router = build_router(
        runner,
        RouterConfig { tool_retries: 3, ..Default::default() },
        vec![(Capability::ExecuteShell, shell.clone())],
    );

    let failure = router
        .run_root_task(role::CODER.into(), "build")
        .await
        .unwrap_err();
    assert!(matches!(failure.error, ConclaveError::Tool(_)));
    // exactly one attempt despite the configured retries
    assert_eq!(shell.calls(), 1);
}

#[tokio::test]
async fn custom_role_table_scopes_capabilities() {
    let json_table = r#"{
        "roles": [
            { "id": "scout", "capabilities": ["search"], "persona": "look, don't touch" }
        ]
    }"#;
    let registry = Arc::new(RoleRegistry::from_json_str(json_table).unwrap());

    let search = CannedTool::new(json!("hit"));
    let gateway = Arc::new(
        ToolGateway::new(Arc::clone(&registry)).with_tool(Capability::Search, search),
    );

    let runner = Arc::new(FnRunner::new(|scope: TaskScope| async move {
        assert_eq!(scope.persona(), "look, don't touch");
        let found = scope.invoke(Capability::Search, json!({ "query": "z" })).await?;
        // outside the declared set, even for this task's own role
        let denied = scope.invoke(Capability::ReadFile, json!({ "path": "x" })).await;
        assert!(matches!(
            denied,
            Err(ConclaveError::CapabilityDenied { .. })
        ));
        Ok(found)
    }));

    let router = DelegationRouter::new(registry, gateway, runner, RouterConfig::default());
    let outcome = router.run_root_task("scout".into(), "survey").await;
    assert_eq!(outcome.unwrap(), json!("hit"));
}
