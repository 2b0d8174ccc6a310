//! Items moving through transform, load, domain/enrich and sink flows.

mod common;

use common::{action, sink_plan, source_plan, transform_plan, TestHarness};
use df_model::{ActionState, ActionType, DeltaFileStage, Domain, FlowState};
use df_router::event::{DomainOutcome, LoadOutcome, TransformOutcome};
use df_router::router::{MAX_FLOW_DEPTH, NO_SUBSCRIBERS, NO_SUBSCRIBER_CAUSE};
use df_router::Outcome;
use df_rules::{DefaultBehavior, DefaultRule};

fn pipeline() -> Vec<df_rules::FlowPlan> {
    vec![
        source_plan("raw"),
        transform_plan(
            "smoke",
            "raw",
            "smoked",
            vec![
                action("transform", ActionType::Transform),
                action("load", ActionType::Load),
            ],
        ),
        sink_plan("archive", "smoked"),
    ]
}

#[tokio::test]
async fn transform_load_egress_completes() {
    let h = TestHarness::new(pipeline());
    let df = h.ingest("input.txt").await;
    assert_eq!(df.stage, DeltaFileStage::InFlight);

    let transform = h.take("TRANSFORM");
    assert_eq!(transform.delta_file.content[0].name, "input.txt");
    h.report(
        &transform,
        Outcome::Transform(TransformOutcome {
            content: vec![common::make_test_content("transformed.txt", 5)],
            metadata: [("step".to_string(), "transformed".to_string())].into(),
            delete_metadata_keys: Vec::new(),
        }),
    )
    .await;

    let load = h.take("LOAD");
    assert_eq!(load.delta_file.content[0].name, "transformed.txt");
    assert_eq!(load.delta_file.metadata["step"], "transformed");
    h.report(
        &load,
        Outcome::Load(LoadOutcome {
            content: vec![common::make_test_content("loaded.txt", 5)],
            ..Default::default()
        }),
    )
    .await;

    let egress = h.take("EGRESS");
    assert_eq!(egress.context.flow_name, "archive");
    assert_eq!(egress.delta_file.content[0].name, "loaded.txt");
    let done = h.report(&egress, Outcome::Egress(Default::default())).await;

    assert_eq!(done.stage, DeltaFileStage::Complete);
    assert!(done.egressed);
    assert!(done.flows.iter().all(|f| f.state == FlowState::Complete));
    assert_eq!(done.flow_named("smoke").unwrap().publish_topics, vec!["smoked"]);
    assert_eq!(done.referenced_bytes, 20);
}

#[tokio::test]
async fn enrich_waits_for_required_domain() {
    let mut enrich = action("enrich", ActionType::Enrich);
    enrich.required_domains = vec!["weather".into()];
    let plans = vec![
        source_plan("raw"),
        transform_plan(
            "enrichment",
            "raw",
            "enriched",
            vec![enrich, action("domain", ActionType::Domain)],
        ),
        sink_plan("archive", "enriched"),
    ];
    let h = TestHarness::new(plans);
    h.ingest("input.txt").await;

    assert!(h.queue.pop("ENRICH").is_none());
    let domain = h.take("DOMAIN");
    h.report(
        &domain,
        Outcome::Domain(DomainOutcome {
            domains: vec![Domain::new("weather", Some("rain".into()), None)],
            metadata: Default::default(),
        }),
    )
    .await;

    let enrich = h.take("ENRICH");
    assert_eq!(enrich.delta_file.domains[0].name, "weather");
    assert_eq!(enrich.delta_file.content[0].name, "input.txt");
}

#[tokio::test]
async fn no_subscribers_errors_with_synthetic_action() {
    let plans = vec![
        source_plan("raw"),
        transform_plan("smoke", "raw", "nowhere", vec![action("transform", ActionType::Transform)]),
    ];
    let h = TestHarness::new(plans);
    h.ingest("input.txt").await;
    let transform = h.take("TRANSFORM");
    let df = h.report(&transform, Outcome::Transform(TransformOutcome::default())).await;

    assert_eq!(df.stage, DeltaFileStage::Error);
    let smoke = df.flow_named("smoke").unwrap();
    let last = smoke.last_action().unwrap();
    assert_eq!(last.name, NO_SUBSCRIBERS);
    assert_eq!(last.state, ActionState::Error);
    assert_eq!(last.error_cause.as_deref(), Some(NO_SUBSCRIBER_CAUSE));
    assert!(last.error_context.as_deref().unwrap().contains("nowhere"));
}

#[tokio::test]
async fn no_subscribers_filter_default() {
    let mut source = source_plan("nowhere");
    source.publish.as_mut().unwrap().default_rule = DefaultRule {
        behavior: DefaultBehavior::Filter,
        topic: None,
    };
    let h = TestHarness::new(vec![source]);
    let df = h.ingest("input.txt").await;

    assert!(df.filtered);
    assert_eq!(df.stage, DeltaFileStage::Complete);
    assert_eq!(df.flows[0].last_action().unwrap().state, ActionState::Filtered);
}

#[tokio::test]
async fn test_mode_sink_never_dispatches_egress() {
    let mut sink = sink_plan("archive", "raw");
    sink.test_mode = true;
    let h = TestHarness::new(vec![source_plan("raw"), sink]);
    let df = h.ingest("input.txt").await;

    assert_eq!(h.queue.total_len(), 0);
    assert_eq!(df.stage, DeltaFileStage::Complete);
    assert!(!df.egressed);
    let archive = df.flow_named("archive").unwrap();
    assert!(archive.test_mode);
    assert!(archive.test_mode_reason.is_some());
}

#[tokio::test]
async fn annotations_release_pending_sink() {
    let mut sink = sink_plan("archive", "raw");
    sink.expected_annotations = ["reviewed".to_string()].into();
    let h = TestHarness::new(vec![source_plan("raw"), sink]);
    let df = h.ingest("input.txt").await;
    let egress = h.take("EGRESS");
    let egressed = h.report(&egress, Outcome::Egress(Default::default())).await;
    assert_eq!(
        egressed.flow_named("archive").unwrap().state,
        FlowState::PendingAnnotations
    );
    assert_eq!(egressed.pending_annotations().len(), 1);

    let annotated = h
        .service
        .annotate(df.did, [("reviewed".to_string(), "alice".to_string())].into())
        .await
        .unwrap();
    assert_eq!(annotated.flow_named("archive").unwrap().state, FlowState::Complete);
    assert!(annotated.pending_annotations().is_empty());
    assert_eq!(annotated.annotations["reviewed"], "alice");
}

#[tokio::test]
async fn flow_chain_deeper_than_limit_errors() {
    let mut config = df_core::config::Config::default();
    config.router.max_flow_depth = 1;
    let plans = vec![
        source_plan("raw"),
        transform_plan("first", "raw", "one", vec![action("t1", ActionType::Transform)]),
        sink_plan("archive", "one"),
    ];
    let h = TestHarness::with_config(plans, config);
    h.ingest("input.txt").await;
    let t1 = h.take("T1");
    let df = h.report(&t1, Outcome::Transform(TransformOutcome::default())).await;

    let archive = df.flow_named("archive").unwrap();
    assert_eq!(archive.depth, 2);
    assert_eq!(archive.state, FlowState::Error);
    assert_eq!(archive.last_action().unwrap().name, MAX_FLOW_DEPTH);
    assert_eq!(h.queue.total_len(), 0);
}
