//! Cold queueing under load and requeue of stale work.

mod common;

use chrono::{Duration, Utc};
use common::{action, source_plan, transform_plan, sink_plan, TestHarness};
use df_core::config::Config;
use df_model::{ActionState, ActionType};

fn pipeline() -> Vec<df_rules::FlowPlan> {
    vec![
        source_plan("raw"),
        transform_plan("smoke", "raw", "smoked", vec![action("transform", ActionType::Transform)]),
        sink_plan("archive", "smoked"),
    ]
}

#[tokio::test]
async fn full_queue_cold_queues_until_requeue() {
    let mut config = Config::default();
    config.queue.cold_queue_threshold = 1;
    let h = TestHarness::with_config(pipeline(), config);

    let hot = h.ingest("a.txt").await;
    let cold = h.ingest("b.txt").await;
    assert_eq!(h.queue.total_len(), 1);
    let smoke = cold.flow_named("smoke").unwrap();
    assert!(smoke.cold_queued);
    assert_eq!(smoke.last_action().unwrap().state, ActionState::ColdQueued);

    // Queue still full: the cold action stays cold.
    h.service.requeue(Utc::now()).await.unwrap();
    assert_eq!(h.queue.total_len(), 1);
    assert!(h.get(cold.did).await.flow_named("smoke").unwrap().cold_queued);

    assert_eq!(h.take("TRANSFORM").context.did, hot.did);
    assert_eq!(h.service.requeue(Utc::now()).await.unwrap(), 1);
    let warmed = h.take("TRANSFORM");
    assert_eq!(warmed.context.did, cold.did);
    assert_eq!(warmed.context.attempt, 1);
    let smoke = h.get(cold.did).await;
    let smoke = smoke.flow_named("smoke").unwrap();
    assert!(!smoke.cold_queued);
    assert_eq!(smoke.last_action().unwrap().state, ActionState::Queued);
}

#[tokio::test]
async fn stale_action_is_dispatched_again() {
    let h = TestHarness::new(pipeline());
    let df = h.ingest("a.txt").await;
    let lost = h.take("TRANSFORM");

    assert_eq!(h.service.requeue(Utc::now()).await.unwrap(), 0);
    assert_eq!(h.queue.total_len(), 0);

    let later = Utc::now() + Duration::seconds(301);
    assert_eq!(h.service.requeue(later).await.unwrap(), 1);
    let again = h.take("TRANSFORM");
    assert_eq!(again.context.did, df.did);
    assert_eq!(again.context.attempt, lost.context.attempt);
    let queued = h.get(df.did).await;
    let action = queued.flow_named("smoke").unwrap().last_action().unwrap().clone();
    assert_eq!(action.queued, Some(later));
}
