//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], an in-memory engine (repository, dispatch
//! queue, event bus) over a set of flow plans, plus builders for plans,
//! content and worker events.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use df_content::{Content, Segment};
use df_core::config::Config;
use df_core::events::EventBus;
use df_core::ObjectId;
use df_model::{ActionType, DeltaFile, FlowType, Metadata};
use df_router::{
    ActionEvent, ActionInvocation, DeltaFileRepository, DeltaFilesService, FlowRouter,
    InMemoryDeltaFileRepository, InMemoryDispatchQueue, IngressRequest, Outcome,
};
use df_rules::{ActionConfiguration, FlowPlan, FlowPlans, PublishRules, Rule};

/// Name of the data source every harness ingests into.
pub const SOURCE: &str = "rest";

/// Engine wired over in-memory adapters.
pub struct TestHarness {
    pub service: Arc<DeltaFilesService>,
    pub queue: Arc<InMemoryDispatchQueue>,
}

impl TestHarness {
    /// Harness with default configuration over `plans`.
    pub fn new(plans: Vec<FlowPlan>) -> Self {
        Self::with_config(plans, Config::default())
    }

    pub fn with_config(plans: Vec<FlowPlan>, config: Config) -> Self {
        Self::with_repository(plans, config, Arc::new(InMemoryDeltaFileRepository::new()))
    }

    pub fn with_repository(
        plans: Vec<FlowPlan>,
        config: Config,
        repo: Arc<dyn DeltaFileRepository>,
    ) -> Self {
        let plans = FlowPlans::new(plans);
        plans.validate().expect("test flow plans must be valid");
        let queue = Arc::new(InMemoryDispatchQueue::new());
        let router = FlowRouter::new(Arc::new(plans), Arc::new(config));
        let service = Arc::new(DeltaFilesService::new(
            repo,
            queue.clone(),
            router,
            Arc::new(EventBus::default()),
        ));
        Self { service, queue }
    }

    /// Ingest one 10-byte item into [`SOURCE`].
    pub async fn ingest(&self, name: &str) -> DeltaFile {
        self.ingest_with(name, Metadata::new()).await
    }

    pub async fn ingest_with(&self, name: &str, metadata: Metadata) -> DeltaFile {
        self.service
            .ingest(IngressRequest {
                data_source: SOURCE.into(),
                name: name.into(),
                content: vec![make_test_content(name, 10)],
                metadata,
            })
            .await
            .expect("ingest failed")
    }

    /// Pop the oldest invocation waiting on `queue`; panics when empty.
    pub fn take(&self, queue: &str) -> ActionInvocation {
        self.queue
            .pop(queue)
            .unwrap_or_else(|| panic!("nothing queued on {queue}"))
    }

    /// Report `outcome` for `invocation` and return the updated item.
    pub async fn report(&self, invocation: &ActionInvocation, outcome: Outcome) -> DeltaFile {
        self.service
            .handle_event(event_for(invocation, outcome))
            .await
            .expect("event rejected")
    }

    pub async fn get(&self, did: df_core::DeltaFileId) -> DeltaFile {
        self.service.get(did).await.expect("item missing")
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn make_test_content(name: &str, size: u64) -> Content {
    Content::new(name, "text/plain", vec![Segment::new(ObjectId::new(), 0, size)])
}

pub fn event_for(invocation: &ActionInvocation, outcome: Outcome) -> ActionEvent {
    let now = Utc::now();
    ActionEvent {
        did: invocation.context.did,
        flow_id: invocation.context.flow_id,
        action_name: invocation.context.action_name.clone(),
        attempt: invocation.context.attempt,
        start: now,
        stop: now,
        outcome,
    }
}

/// Action whose queue (class) is its name upper-cased.
pub fn action(name: &str, action_type: ActionType) -> ActionConfiguration {
    ActionConfiguration::new(name, action_type, name.to_uppercase())
}

/// The [`SOURCE`] data source publishing to `topic`.
pub fn source_plan(topic: &str) -> FlowPlan {
    let mut plan = FlowPlan::new(SOURCE, FlowType::RestDataSource);
    plan.publish = Some(PublishRules::to_topic(topic));
    plan
}

pub fn transform_plan(
    name: &str,
    subscribe: &str,
    publish: &str,
    actions: Vec<ActionConfiguration>,
) -> FlowPlan {
    let mut plan = FlowPlan::new(name, FlowType::Transform);
    plan.subscribe = vec![Rule::new(subscribe)];
    plan.publish = Some(PublishRules::to_topic(publish));
    plan.actions = actions;
    plan
}

/// A data sink with a single egress action on queue `EGRESS`.
pub fn sink_plan(name: &str, subscribe: &str) -> FlowPlan {
    let mut plan = FlowPlan::new(name, FlowType::DataSink);
    plan.subscribe = vec![Rule::new(subscribe)];
    plan.actions = vec![action("egress", ActionType::Egress)];
    plan
}
