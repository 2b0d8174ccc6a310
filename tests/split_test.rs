//! Splitting one item into children that carry on through the flow.

mod common;

use common::{action, make_test_content, sink_plan, source_plan, transform_plan, TestHarness};
use df_model::{ActionState, ActionType, DeltaFileStage, FlowState};
use df_router::event::{SplitChild, SplitOutcome, TransformOutcome};
use df_router::Outcome;

fn child(name: &str) -> SplitChild {
    SplitChild {
        name: name.into(),
        content: vec![make_test_content(name, 4)],
        metadata: [("part".to_string(), name.to_string())].into(),
    }
}

#[tokio::test]
async fn children_resume_after_split_action() {
    let plans = vec![
        source_plan("raw"),
        transform_plan(
            "unzip",
            "raw",
            "parts",
            vec![
                action("split", ActionType::Transform),
                action("load", ActionType::Load),
            ],
        ),
        sink_plan("archive", "parts"),
    ];
    let h = TestHarness::new(plans);
    let parent = h.ingest("bundle.zip").await;
    let split = h.take("SPLIT");

    let parent = h
        .report(
            &split,
            Outcome::Split(SplitOutcome {
                children: vec![child("one.txt"), child("two.txt")],
            }),
        )
        .await;
    assert_eq!(parent.stage, DeltaFileStage::Complete);
    assert_eq!(parent.child_dids.len(), 2);
    let unzip = parent.flow_named("unzip").unwrap();
    assert_eq!(unzip.last_action().unwrap().state, ActionState::Split);
    assert_eq!(unzip.state, FlowState::Complete);

    let mut loads = vec![h.take("LOAD"), h.take("LOAD")];
    assert!(h.queue.pop("LOAD").is_none());
    loads.sort_by(|a, b| a.delta_file.name.cmp(&b.delta_file.name));
    assert_eq!(loads[0].delta_file.name, "one.txt");
    assert_eq!(loads[0].delta_file.content[0].name, "one.txt");
    assert_eq!(loads[0].delta_file.metadata["part"], "one.txt");
    assert_eq!(loads[1].delta_file.parent_dids, vec![parent.did]);

    for load in &loads {
        let child = h.get(load.context.did).await;
        assert!(parent.child_dids.contains(&child.did));
        assert_eq!(child.data_source, common::SOURCE);
        assert_eq!(child.ingress_bytes, 4);
        let flow = child.flow_named("unzip").unwrap();
        assert_eq!(flow.depth, unzip.depth + 1);
        assert_eq!(flow.latest_action("split").unwrap().state, ActionState::Complete);
    }

    let first = h
        .report(&loads[0], Outcome::Load(Default::default()))
        .await;
    assert_eq!(first.flow_named("unzip").unwrap().publish_topics, vec!["parts"]);
    assert_eq!(h.take("EGRESS").context.did, first.did);
}

#[tokio::test]
async fn split_outcome_needs_children() {
    let plans = vec![
        source_plan("raw"),
        transform_plan("unzip", "raw", "parts", vec![action("split", ActionType::Transform)]),
        sink_plan("archive", "parts"),
    ];
    let h = TestHarness::new(plans);
    h.ingest("bundle.zip").await;
    let split = h.take("SPLIT");

    let empty = h
        .service
        .handle_event(common::event_for(
            &split,
            Outcome::Split(SplitOutcome { children: Vec::new() }),
        ))
        .await;
    assert!(empty.is_err());

    // The action is still pending and accepts a proper result.
    let df = h
        .report(&split, Outcome::Transform(TransformOutcome::default()))
        .await;
    assert_eq!(df.flow_named("unzip").unwrap().state, FlowState::Complete);
}
