//! Loading flow documents and running them with stand-in workers.

use std::io::Write;

use deltaflow::simulate::Simulation;
use df_content::{Content, Segment};
use df_core::config::Config;
use df_core::ObjectId;
use df_model::{DeltaFileStage, FlowState};
use df_router::IngressRequest;
use df_rules::FlowPlans;

const FLOWS: &str = r#"
[[plans]]
name = "rest"
type = "REST_DATA_SOURCE"

[plans.publish]
rules = [{ topic = "raw" }]

[[plans]]
name = "smoke"
type = "TRANSFORM"
subscribe = [{ topic = "raw" }]

[plans.publish]
rules = [{ topic = "smoked" }]

[[plans.actions]]
name = "transform"
type = "TRANSFORM"
action_class = "SmokeTransform"

[[plans.actions]]
name = "load"
type = "LOAD"
action_class = "SmokeLoad"

[[plans]]
name = "archive"
type = "DATA_SINK"
subscribe = [{ topic = "smoked" }]

[[plans.actions]]
name = "egress"
type = "EGRESS"
action_class = "ArchiveEgress"
"#;

fn write_flows(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn request(name: &str) -> IngressRequest {
    IngressRequest {
        data_source: "rest".into(),
        name: name.into(),
        content: vec![Content::new(
            name,
            "text/plain",
            vec![Segment::new(ObjectId::new(), 0, 16)],
        )],
        metadata: Default::default(),
    }
}

#[test]
fn toml_flow_document_loads_and_validates() {
    let file = write_flows(FLOWS);
    let plans = FlowPlans::load(file.path()).unwrap();
    plans.validate().unwrap();
    assert_eq!(plans.plans.len(), 3);
    assert_eq!(plans.by_name("smoke").unwrap().actions[1].action_class, "SmokeLoad");
}

#[test]
fn invalid_flow_document_reports_problems() {
    let file = write_flows(&FLOWS.replace("type = \"EGRESS\"", "type = \"TRANSFORM\""));
    let plans = FlowPlans::load(file.path()).unwrap();
    assert!(plans.validate().is_err());
}

#[tokio::test]
async fn simulation_runs_items_to_completion() {
    let file = write_flows(FLOWS);
    let plans = FlowPlans::load(file.path()).unwrap();
    let simulation = Simulation::new(plans, Config::default());
    simulation.ingest(request("a.txt")).await.unwrap();
    simulation.ingest(request("b.txt")).await.unwrap();

    let report = simulation.run().await.unwrap();
    assert_eq!(report.steps, 6);
    assert_eq!(report.rejected, 0);
    assert_eq!(report.items.len(), 2);
    for item in &report.items {
        assert_eq!(item.stage, DeltaFileStage::Complete);
        assert!(item.egressed);
        assert_eq!(item.flows.len(), 3);
    }
    assert_eq!(simulation.queue().total_len(), 0);
}

#[tokio::test]
async fn cold_queued_items_finish_before_the_report() {
    let file = write_flows(FLOWS);
    let plans = FlowPlans::load(file.path()).unwrap();
    let mut config = Config::default();
    config.queue.cold_queue_threshold = 1;
    let simulation = Simulation::new(plans, config);
    simulation.ingest(request("a.txt")).await.unwrap();
    let cold = simulation.ingest(request("b.txt")).await.unwrap();
    assert!(cold.flow_named("smoke").unwrap().cold_queued);

    let report = simulation.run().await.unwrap();
    assert_eq!(report.steps, 6);
    for item in &report.items {
        assert_eq!(item.stage, DeltaFileStage::Complete);
        assert!(item.flows.iter().all(|f| !f.cold_queued));
    }
    assert_eq!(simulation.queue().total_len(), 0);
}

#[tokio::test]
async fn simulated_error_parameter_fails_the_action() {
    let flows = FLOWS.replace(
        "action_class = \"SmokeLoad\"",
        "action_class = \"SmokeLoad\"\nparameters = { simulateError = \"disk full\" }",
    );
    let file = write_flows(&flows);
    let plans = FlowPlans::load(file.path()).unwrap();
    let simulation = Simulation::new(plans, Config::default());
    simulation.ingest(request("a.txt")).await.unwrap();

    let report = simulation.run().await.unwrap();
    assert_eq!(report.steps, 2);
    let item = &report.items[0];
    assert_eq!(item.stage, DeltaFileStage::Error);
    let smoke = item.flow_named("smoke").unwrap();
    assert_eq!(smoke.state, FlowState::Error);
    assert_eq!(smoke.error_or_filter_cause.as_deref(), Some("disk full"));
}

#[test]
fn config_file_overrides_defaults() {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    file.write_all(br#"{"router": {"max_flow_depth": 8}, "queue": {"cold_queue_threshold": 50}}"#)
        .unwrap();

    let config = Config::load_or_default(Some(file.path()));
    assert_eq!(config.router.max_flow_depth, 8);
    assert_eq!(config.queue.cold_queue_threshold, 50);
    assert_eq!(config.router.workers, Config::default().router.workers);
    assert!(config.validate().is_empty());
}

#[test]
fn missing_config_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load_or_default(Some(&dir.path().join("absent.json")));
    assert_eq!(config.retry.max_attempts, 10);
}
