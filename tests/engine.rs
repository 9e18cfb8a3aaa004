//! End-to-end runs of the Seafile reference stack on the memory provider.

use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use stratum::config::{ConfigParser, StackConfig};
use stratum::engine::Engine;
use stratum::error::NodeFailure;
use stratum::planner::{NodeStatus, PlanAction, RunOutcome};
use stratum::provider::{MemoryProvider, Operation, ProviderRegistry};
use stratum::state::{LocalStateStore, StateStore};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn seafile_stack() -> StackConfig {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("templates/stratum.yaml");
    ConfigParser::new().load_file(path).expect("template parses")
}

fn registry(provider: &Arc<MemoryProvider>) -> ProviderRegistry {
    ProviderRegistry::new()
        .with("linode", provider.clone())
        .with("docker", provider.clone())
}

fn store_for(config: &StackConfig, temp: &TempDir) -> LocalStateStore {
    LocalStateStore::with_base_dir(config.state_dir(temp.path()))
}

fn position(calls: &[String], name: &str) -> usize {
    calls
        .iter()
        .position(|n| n == name)
        .unwrap_or_else(|| panic!("{name} was never created"))
}

#[tokio::test]
async fn test_seafile_stack_converges() {
    let temp = TempDir::new().expect("temp dir");
    let config = seafile_stack();
    let store = store_for(&config, &temp);
    let provider = Arc::new(MemoryProvider::new());
    let engine = Engine::new(&config, &store, registry(&provider)).with_base_dir(temp.path());

    let report = engine.apply(CancellationToken::new()).await.expect("apply");
    assert!(report.is_success(), "{:?}", report.run.outcome);
    assert_eq!(report.outputs["instanceIpAddress"], json!("192.0.2.1"));

    let creates = provider.names_for(Operation::Create);
    assert_eq!(creates.len(), 6);
    assert!(position(&creates, "seafileInstance") < position(&creates, "seafileVolume"));
    assert!(position(&creates, "seafileVolume") < position(&creates, "seafileContainer"));
    assert!(position(&creates, "seafileNetwork") < position(&creates, "seafileContainer"));
    assert!(position(&creates, "seafileDomain") < position(&creates, "seafileARecord"));
    assert!(position(&creates, "seafileInstance") < position(&creates, "seafileARecord"));

    let state = store.load().await.expect("load").expect("state saved");
    let domain_id = state.get("seafileDomain").and_then(|r| r.id.clone()).expect("domain id");
    let record = state.get("seafileARecord").expect("A record");
    assert_eq!(record.inputs["domainId"], json!(domain_id));
    assert_eq!(record.inputs["target"], json!("192.0.2.1"));
    assert_eq!(record.inputs["ttlSec"], json!(300));

    let container = state.get("seafileContainer").expect("container");
    assert_eq!(container.inputs["volumes"][0]["source"], json!("seafileVolume"));
    assert_eq!(container.inputs["networksAdvanced"][0]["name"], json!("seafileNetwork"));

    let written = std::fs::read_to_string(engine.outputs_path()).expect("outputs file");
    assert!(written.contains("192.0.2.1"));
}

#[tokio::test]
async fn test_second_apply_makes_no_calls() {
    let temp = TempDir::new().expect("temp dir");
    let config = seafile_stack();
    let store = store_for(&config, &temp);
    let provider = Arc::new(MemoryProvider::new());
    let engine = Engine::new(&config, &store, registry(&provider)).with_base_dir(temp.path());

    engine.apply(CancellationToken::new()).await.expect("first apply");
    let calls = provider.calls().len();

    let plan = engine.plan().await.expect("plan");
    assert!(plan.is_noop());

    let report = engine.apply(CancellationToken::new()).await.expect("second apply");
    assert!(report.is_success());
    assert_eq!(provider.calls().len(), calls);
    assert_eq!(report.outputs["instanceIpAddress"], json!("192.0.2.1"));
}

#[tokio::test]
async fn test_instance_failure_blocks_only_its_dependents() {
    let temp = TempDir::new().expect("temp dir");
    let config = seafile_stack();
    let store = store_for(&config, &temp);
    let provider = Arc::new(MemoryProvider::new());
    provider.fail_on("seafileInstance");
    let engine = Engine::new(&config, &store, registry(&provider)).with_base_dir(temp.path());

    let report = engine.apply(CancellationToken::new()).await.expect("apply");
    let status = |name: &str| report.run.node(name).map(|n| n.status);

    assert_eq!(status("seafileInstance"), Some(NodeStatus::Failed));
    assert_eq!(status("seafileVolume"), Some(NodeStatus::Blocked));
    assert_eq!(status("seafileContainer"), Some(NodeStatus::Blocked));
    assert_eq!(status("seafileARecord"), Some(NodeStatus::Blocked));
    assert_eq!(status("seafileNetwork"), Some(NodeStatus::Resolved));
    assert_eq!(status("seafileDomain"), Some(NodeStatus::Resolved));

    assert_eq!(
        report.run.node("seafileContainer").and_then(|n| n.cause.clone()),
        Some(NodeFailure::DependencyFailed {
            dependency: String::from("seafileVolume")
        })
    );
    assert!(matches!(report.run.outcome, RunOutcome::PartialFailure { .. }));
    assert!(report.export_error.is_some());

    let creates = provider.names_for(Operation::Create);
    for blocked in ["seafileVolume", "seafileContainer", "seafileARecord"] {
        assert!(!creates.iter().any(|n| n == blocked), "{blocked} was dispatched");
    }

    // Once the provider recovers, only the unfinished resources are created.
    provider.recover("seafileInstance");
    let plan = engine.plan().await.expect("plan");
    let summary = plan.summary();
    assert_eq!((summary.create, summary.noop), (4, 2));

    let report = engine.apply(CancellationToken::new()).await.expect("retry");
    assert!(report.is_success());
    assert_eq!(provider.live_count(), 6);
}

#[tokio::test]
async fn test_removed_resources_are_deleted_dependents_first() {
    let temp = TempDir::new().expect("temp dir");
    let config = seafile_stack();
    let store = store_for(&config, &temp);
    let provider = Arc::new(MemoryProvider::new());

    Engine::new(&config, &store, registry(&provider))
        .with_base_dir(temp.path())
        .apply(CancellationToken::new())
        .await
        .expect("apply");

    let mut reduced = config.clone();
    reduced
        .resources
        .retain(|r| r.name != "seafileVolume" && r.name != "seafileContainer");
    let engine = Engine::new(&reduced, &store, registry(&provider)).with_base_dir(temp.path());

    let plan = engine.plan().await.expect("plan");
    let deletes: Vec<&str> = plan.deletes().map(|e| e.name.as_str()).collect();
    assert_eq!(deletes, vec!["seafileContainer", "seafileVolume"]);
    assert!(
        plan.entries
            .iter()
            .filter(|e| e.action != PlanAction::Delete)
            .all(|e| e.action == PlanAction::NoOp)
    );

    let report = engine.apply(CancellationToken::new()).await.expect("apply");
    assert!(report.is_success());
    assert_eq!(
        provider.names_for(Operation::Delete),
        vec!["seafileContainer", "seafileVolume"]
    );

    let state = store.load().await.expect("load").expect("state");
    assert_eq!(state.resources.len(), 4);
}

#[tokio::test]
async fn test_cycle_is_rejected_before_any_call() {
    let yaml = r"
stack:
  name: loop
providers:
  linode:
    type: memory
resources:
  - name: first
    kind: linode:instance
    properties:
      peer: ${second.id}
  - name: second
    kind: linode:instance
    properties:
      peer: ${first.id}
";
    let temp = TempDir::new().expect("temp dir");
    let config = ConfigParser::new().parse_yaml(yaml, None).expect("parse");
    let store = store_for(&config, &temp);
    let provider = Arc::new(MemoryProvider::new());
    let engine = Engine::new(&config, &store, registry(&provider)).with_base_dir(temp.path());

    let err = engine
        .apply(CancellationToken::new())
        .await
        .expect_err("cycle must be rejected");

    assert!(err.is_validation());
    assert!(err.to_string().contains("Cyclic dependency"));
    assert!(provider.calls().is_empty());
    assert!(!store.exists().await.expect("exists"));
}

#[tokio::test]
async fn test_destroy_tears_down_everything() {
    let temp = TempDir::new().expect("temp dir");
    let config = seafile_stack();
    let store = store_for(&config, &temp);
    let provider = Arc::new(MemoryProvider::new());
    let engine = Engine::new(&config, &store, registry(&provider)).with_base_dir(temp.path());

    engine.apply(CancellationToken::new()).await.expect("apply");
    let report = engine.destroy(CancellationToken::new()).await.expect("destroy");

    assert!(report.run.is_success());
    assert_eq!(provider.live_count(), 0);

    let deletes = provider.names_for(Operation::Delete);
    let at = |name: &str| deletes.iter().position(|n| n == name).expect("deleted");
    assert!(at("seafileContainer") < at("seafileVolume"));
    assert!(at("seafileVolume") < at("seafileInstance"));
    assert!(at("seafileARecord") < at("seafileInstance"));
    assert!(at("seafileARecord") < at("seafileDomain"));
    assert!(at("seafileContainer") < at("seafileNetwork"));

    assert!(engine.outputs().await.expect("outputs").is_empty());
}
