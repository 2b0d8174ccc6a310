//! In-process simulation: runs items through the configured flows with
//! stand-in action workers.
//!
//! Every dispatched invocation is answered with a plausible outcome for its
//! action type: transforms pass content through, joins concatenate their
//! members, egress succeeds. An action whose parameters carry
//! `"simulateError": "<cause>"` reports an error instead, and
//! `"simulateFilter": "<cause>"` filters. Once nothing is queued,
//! cold-queued work is warmed and pending joins are flushed by sweeping
//! past their max age.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use df_content::Content;
use df_core::config::Config;
use df_core::events::EventBus;
use df_core::{DeltaFileId, Error, Result};
use df_model::{ActionType, DeltaFile};
use df_router::event::{
    EgressOutcome, ErrorOutcome, FilterOutcome, FormatOutcome, LoadOutcome, TransformOutcome,
};
use df_router::{
    ActionEvent, ActionInvocation, DeltaFilesService, FlowRouter, InMemoryDeltaFileRepository,
    InMemoryDispatchQueue, IngressRequest, Outcome,
};
use df_rules::FlowPlans;
use serde::Serialize;

/// Upper bound on invocations answered in one run.
const MAX_STEPS: usize = 10_000;
/// Furthest the join sweep is pushed into the future (a century).
const MAX_HORIZON_SECS: i64 = 100 * 365 * 24 * 3600;

/// An in-memory engine plus stand-in workers.
pub struct Simulation {
    service: Arc<DeltaFilesService>,
    queue: Arc<InMemoryDispatchQueue>,
    repo: Arc<InMemoryDeltaFileRepository>,
    ingested: parking_lot::Mutex<Vec<DeltaFileId>>,
}

/// What one run did.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    pub steps: usize,
    pub rejected: usize,
    pub items: Vec<DeltaFile>,
}

impl Simulation {
    pub fn new(plans: FlowPlans, config: Config) -> Self {
        let queue = Arc::new(InMemoryDispatchQueue::new());
        let repo = Arc::new(InMemoryDeltaFileRepository::new());
        let events = Arc::new(EventBus::new(config.router.event_channel_capacity.max(1)));
        let router = FlowRouter::new(Arc::new(plans), Arc::new(config));
        let service = Arc::new(DeltaFilesService::new(repo.clone(), queue.clone(), router, events));
        Self {
            service,
            queue,
            repo,
            ingested: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn service(&self) -> &Arc<DeltaFilesService> {
        &self.service
    }

    pub fn queue(&self) -> &Arc<InMemoryDispatchQueue> {
        &self.queue
    }

    pub async fn ingest(&self, request: IngressRequest) -> Result<DeltaFile> {
        let delta_file = self.service.ingest(request).await?;
        self.ingested.lock().push(delta_file.did);
        Ok(delta_file)
    }

    /// Answer queued work until nothing is left, then report every item
    /// the run touched (ingested items and their descendants).
    pub async fn run(&self) -> Result<SimulationReport> {
        let mut steps = 0;
        let mut rejected = 0;
        loop {
            let batch = self.queue.drain();
            if batch.is_empty() {
                self.service.requeue(Utc::now()).await?;
                if self.queue.total_len() > 0 {
                    continue;
                }
                if self.service.open_joins() == 0 {
                    break;
                }
                if self.service.sweep_joins(self.join_horizon()).await? == 0 {
                    break;
                }
                continue;
            }
            for invocation in batch {
                steps += 1;
                if steps > MAX_STEPS {
                    return Err(Error::Internal(format!(
                        "Simulation did not settle within {MAX_STEPS} steps"
                    )));
                }
                let event = self.answer(&invocation)?;
                match self.service.handle_event(event).await {
                    Ok(_) => {}
                    Err(Error::UnexpectedAction { .. } | Error::InvalidEvent { .. }) => rejected += 1,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(SimulationReport {
            steps,
            rejected,
            items: self.touched_items().await?,
        })
    }

    /// The stand-in worker's reply to `invocation`.
    pub fn answer(&self, invocation: &ActionInvocation) -> Result<ActionEvent> {
        let context = &invocation.context;
        let action_type = self
            .service
            .router()
            .plans()
            .by_name(&context.flow_name)
            .and_then(|plan| plan.action(&context.action_name))
            .map(|action| action.action_type)
            .ok_or_else(|| Error::not_found("action", &context.action_name))?;

        let view = &invocation.delta_file;
        let parameter = |key: &str| {
            invocation
                .parameters
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        let outcome = if let Some(cause) = parameter("simulateError") {
            Outcome::Error(ErrorOutcome {
                cause,
                context: format!("Simulated failure in {}", context.action_name),
            })
        } else if let Some(cause) = parameter("simulateFilter") {
            Outcome::Filter(FilterOutcome { cause, context: None })
        } else {
            match action_type {
                ActionType::Load => Outcome::Load(LoadOutcome {
                    content: view.content.clone(),
                    ..Default::default()
                }),
                ActionType::Domain => Outcome::Domain(Default::default()),
                ActionType::Enrich => Outcome::Enrich(Default::default()),
                ActionType::Format => Outcome::Format(FormatOutcome {
                    content: view.content.clone(),
                    metadata: Default::default(),
                }),
                ActionType::Validate => Outcome::Validate,
                ActionType::Egress => Outcome::Egress(EgressOutcome {
                    destination: Some(invocation.queue_name.clone()),
                    bytes_egressed: view.content.iter().map(Content::size).sum(),
                }),
                ActionType::Join => {
                    let parts: Vec<&Content> = invocation
                        .joined
                        .iter()
                        .flat_map(|member| member.content.iter())
                        .collect();
                    let content = match parts.first() {
                        Some(first) => {
                            vec![Content::concat(&first.name, &first.media_type, parts.iter().copied())]
                        }
                        None => Vec::new(),
                    };
                    Outcome::Join(TransformOutcome {
                        content,
                        ..Default::default()
                    })
                }
                ActionType::Transform | ActionType::Ingress | ActionType::TimedIngress | ActionType::Publish => {
                    Outcome::Transform(TransformOutcome {
                        content: view.content.clone(),
                        ..Default::default()
                    })
                }
            }
        };

        let now = Utc::now();
        Ok(ActionEvent {
            did: context.did,
            flow_id: context.flow_id,
            action_name: context.action_name.clone(),
            attempt: context.attempt,
            start: now,
            stop: now,
            outcome,
        })
    }

    /// A time past the max age of every configured join.
    fn join_horizon(&self) -> DateTime<Utc> {
        let longest = self
            .service
            .router()
            .plans()
            .plans
            .iter()
            .flat_map(|plan| plan.actions.iter())
            .filter_map(|action| action.join.as_ref())
            .map(|join| join.max_age_secs)
            .max()
            .unwrap_or(0);
        let longest = i64::try_from(longest).unwrap_or(i64::MAX).min(MAX_HORIZON_SECS);
        Utc::now() + chrono::Duration::seconds(longest + 1)
    }

    async fn touched_items(&self) -> Result<Vec<DeltaFile>> {
        use df_router::DeltaFileRepository;

        let mut pending: Vec<DeltaFileId> = self.ingested.lock().clone();
        let mut seen = std::collections::BTreeSet::new();
        let mut items = Vec::new();
        while let Some(did) = pending.pop() {
            if !seen.insert(did) {
                continue;
            }
            if let Some(delta_file) = self.repo.get(did).await? {
                pending.extend(delta_file.child_dids.iter().copied());
                items.push(delta_file);
            }
        }
        items.sort_by_key(|df| df.created);
        Ok(items)
    }
}
