//! The flow router: decides what runs next for an item.
//!
//! [`FlowRouter::advance`] is called after every state change with the ids
//! of the flows the change touched. For each of them it walks the flow's
//! configured actions in plan order:
//!
//! - an action with a final record is done and skipped;
//! - an action still queued or parked in a join means the flow waits;
//! - the first action without a record is queued if its requirements are
//!   met, and passed over otherwise;
//! - once nothing is left, data sinks are finished and every other flow
//!   publishes, which may start new subscriber flows (advanced in turn).
//!
//! The router only mutates the item it is given. Invocations and join
//! registrations are handed back to the caller, which dispatches them after
//! the item has been saved.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use df_core::config::Config;
use df_core::DeltaFileId;
use df_model::{
    Action, ActionState, ActionType, DeltaFile, DeltaFileFlow, DeltaFileView, FlowInput, FlowState,
    FlowType, Metadata,
};
use df_rules::{
    ActionConfiguration, FlowPlan, FlowPlans, JoinConfiguration, Routing, Subject, TopicRouter,
};
use tracing::{debug, info};

use crate::dispatch::{ActionContext, ActionInvocation};
use crate::event::SplitChild;
use crate::join::{JoinKey, JoinMember, PendingJoin, DEFAULT_JOIN_GROUP};

/// Synthetic action recorded when publishing finds no subscriber.
pub const NO_SUBSCRIBERS: &str = "NO_SUBSCRIBERS";
pub const NO_SUBSCRIBER_CAUSE: &str = "No matching subscribers were found";
/// Synthetic action recorded when a flow would exceed the depth limit.
pub const MAX_FLOW_DEPTH: &str = "MAX_FLOW_DEPTH";
pub const MAX_FLOW_DEPTH_CAUSE: &str = "Maximum flow depth exceeded";
/// Synthetic action recorded when an item reaches a flow that is not running.
pub const FLOW_NOT_RUNNING: &str = "FLOW_NOT_RUNNING";
pub const FLOW_NOT_RUNNING_CAUSE: &str = "Flow is not running";

/// What one advancement produced besides the mutated item.
#[derive(Debug, Default)]
pub struct Advancement {
    /// Work to dispatch once the item is saved.
    pub invocations: Vec<ActionInvocation>,
    /// Items to park in the join accumulator once the item is saved.
    pub joins: Vec<PendingJoin>,
    pub stage_changed: bool,
}

impl Advancement {
    pub fn merge(&mut self, other: Advancement) {
        self.invocations.extend(other.invocations);
        self.joins.extend(other.joins);
        self.stage_changed |= other.stage_changed;
    }
}

enum Step<'p> {
    Wait,
    Queue(&'p ActionConfiguration),
    Done,
}

/// Walks flow plans for items. Cheap to clone; the plans are shared.
#[derive(Debug, Clone)]
pub struct FlowRouter {
    plans: Arc<FlowPlans>,
    topics: Arc<TopicRouter>,
    config: Arc<Config>,
}

impl FlowRouter {
    pub fn new(plans: Arc<FlowPlans>, config: Arc<Config>) -> Self {
        let topics = Arc::new(TopicRouter::new(&plans));
        Self {
            plans,
            topics,
            config,
        }
    }

    pub fn plans(&self) -> &FlowPlans {
        &self.plans
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The enabled plan called `name`.
    pub fn running_plan(&self, name: &str) -> Option<&FlowPlan> {
        self.plans.by_name(name).filter(|p| p.enabled)
    }

    /// Advance every flow in `touched`, plus any flow they start.
    pub fn advance(
        &self,
        delta_file: &mut DeltaFile,
        touched: impl IntoIterator<Item = u32>,
        now: DateTime<Utc>,
    ) -> Advancement {
        let mut advancement = Advancement::default();
        let mut work: VecDeque<u32> = touched.into_iter().collect();
        while let Some(flow_id) = work.pop_front() {
            work.extend(self.advance_flow(delta_file, flow_id, now, &mut advancement));
        }
        advancement.stage_changed = delta_file.update_stage(now);
        delta_file.recalculate_bytes();
        advancement
    }

    /// Advance one flow; returns the ids of flows it started.
    fn advance_flow(
        &self,
        delta_file: &mut DeltaFile,
        flow_id: u32,
        now: DateTime<Utc>,
        advancement: &mut Advancement,
    ) -> Vec<u32> {
        loop {
            let Some(flow) = delta_file.flow(flow_id) else {
                return Vec::new();
            };
            if !can_advance(flow) {
                return Vec::new();
            }
            let Some(plan) = self.running_plan(&flow.name) else {
                let context = format!("Flow '{}' is not configured or not enabled", flow.name);
                error_flow(delta_file, flow_id, FLOW_NOT_RUNNING, FLOW_NOT_RUNNING_CAUSE, &context, now);
                return Vec::new();
            };

            let action = match self.next_step(delta_file, flow, plan) {
                Step::Wait => return Vec::new(),
                Step::Done => return self.finish(delta_file, flow_id, plan, now),
                Step::Queue(action) => action,
            };

            if action.action_type == ActionType::Egress && flow.test_mode {
                let reason = format!("Data sink '{}' in test mode", flow.name);
                record_test_egress(delta_file, flow_id, &action.name, reason, now);
                continue;
            }

            if let Some(join) = &action.join {
                let key = join_key(flow, action, join);
                let did = delta_file.did;
                if let Some(flow) = delta_file.flow_mut(flow_id) {
                    flow.add_action(&action.name, ActionType::Join, ActionState::Collecting, now);
                    flow.update_state(now);
                }
                debug!(did = %did, flow = %key.flow, action = %key.action, group = %key.group, "Parked for join");
                advancement.joins.push(PendingJoin {
                    key,
                    config: join.clone(),
                    member: JoinMember {
                        did,
                        flow_id,
                        joined_at: now,
                    },
                });
                return Vec::new();
            }

            let Some(flow) = delta_file.flow_mut(flow_id) else {
                return Vec::new();
            };
            let attempt = flow
                .queue_action(&action.name, action.action_type, false, now)
                .attempt;
            flow.update_state(now);
            if let Some(invocation) = self.invocation(delta_file, flow_id, action, attempt) {
                debug!(did = %delta_file.did, flow_id, action = %action.name, attempt, "Queued action");
                advancement.invocations.push(invocation);
            }
            return Vec::new();
        }
    }

    fn next_step<'p>(&self, delta_file: &DeltaFile, flow: &DeltaFileFlow, plan: &'p FlowPlan) -> Step<'p> {
        let domains = gather(delta_file, flow, DeltaFileFlow::domains);
        let enrichments = gather(delta_file, flow, DeltaFileFlow::enrichments);
        let latest_metadata = flow.metadata();
        let source_metadata = source_metadata(delta_file, flow);

        for action in &plan.actions {
            match flow.latest_action(&action.name) {
                Some(record) if record.is_final() => continue,
                Some(_) => return Step::Wait,
                None => {}
            }
            if action.requirements_met(&domains, &enrichments, &latest_metadata, source_metadata) {
                return Step::Queue(action);
            }
            debug!(
                did = %delta_file.did,
                flow = %flow.name,
                action = %action.name,
                "Requirements not met; passing over"
            );
        }
        Step::Done
    }

    /// Every configured action is done: finish a sink or publish.
    fn finish(
        &self,
        delta_file: &mut DeltaFile,
        flow_id: u32,
        plan: &FlowPlan,
        now: DateTime<Utc>,
    ) -> Vec<u32> {
        if plan.flow_type == FlowType::DataSink {
            if let Some(flow) = delta_file.flow_mut(flow_id) {
                flow.update_state(now);
            }
            return Vec::new();
        }

        let Some(rules) = plan.publish.as_ref() else {
            let context = format!("Flow '{}' does not have publish rules", plan.name);
            error_flow(delta_file, flow_id, NO_SUBSCRIBERS, NO_SUBSCRIBER_CAUSE, &context, now);
            return Vec::new();
        };
        let Some(flow) = delta_file.flow(flow_id) else {
            return Vec::new();
        };

        let routing = self.topics.route(rules, &Subject::of_flow(flow), &flow.name);
        let content = flow.last_content().to_vec();
        let metadata = flow.metadata();
        let mut ancestor_ids = flow.input.ancestor_ids.clone();
        ancestor_ids.push(flow.id);
        let depth = flow.depth + 1;
        let republished = flow
            .last_action()
            .is_some_and(|a| a.state != ActionState::Complete);

        if let Some(flow) = delta_file.flow_mut(flow_id) {
            flow.publish_topics = routing.topics().to_vec();
        }

        match routing {
            Routing::Subscribers { flows, .. } => {
                if republished {
                    if let Some(flow) = delta_file.flow_mut(flow_id) {
                        let carried = content.clone();
                        flow.add_action(NO_SUBSCRIBERS, ActionType::Publish, ActionState::Queued, now)
                            .complete(now, now, carried, Metadata::new(), Vec::new(), now);
                        flow.update_state(now);
                    }
                }
                let mut started = Vec::new();
                for (name, topics) in flows {
                    let Some(plan) = self.running_plan(&name) else {
                        continue;
                    };
                    let input = FlowInput {
                        content: content.clone(),
                        metadata: metadata.clone(),
                        topics,
                        ancestor_ids: ancestor_ids.clone(),
                    };
                    started.push(self.start_flow(delta_file, plan, input, depth, now));
                }
                info!(did = %delta_file.did, flow_id, subscribers = started.len(), "Published");
                started
            }
            Routing::Filter { context, .. } => {
                if let Some(flow) = delta_file.flow_mut(flow_id) {
                    flow.add_action(NO_SUBSCRIBERS, ActionType::Publish, ActionState::Queued, now)
                        .filter(now, now, NO_SUBSCRIBER_CAUSE, Some(context.as_str()), now);
                    flow.update_state(now);
                }
                delta_file.filtered = true;
                info!(did = %delta_file.did, flow_id, "Filtered: no subscribers");
                Vec::new()
            }
            Routing::Error { context, .. } => {
                error_flow(delta_file, flow_id, NO_SUBSCRIBERS, NO_SUBSCRIBER_CAUSE, &context, now);
                info!(did = %delta_file.did, flow_id, "Errored: no subscribers");
                Vec::new()
            }
        }
    }

    /// Add a flow instance of `plan` to the item; returns its id.
    pub fn start_flow(
        &self,
        delta_file: &mut DeltaFile,
        plan: &FlowPlan,
        input: FlowInput,
        depth: u32,
        now: DateTime<Utc>,
    ) -> u32 {
        let pending_annotations: BTreeSet<String> = if plan.flow_type == FlowType::DataSink {
            plan.expected_annotations
                .iter()
                .filter(|key| !delta_file.annotations.contains_key(*key))
                .cloned()
                .collect()
        } else {
            BTreeSet::new()
        };

        let flow = delta_file.add_flow(&plan.name, plan.flow_type, input, depth, now);
        flow.test_mode = plan.test_mode;
        flow.pending_annotations = pending_annotations;
        let id = flow.id;
        self.check_depth(delta_file, id, now);
        id
    }

    fn check_depth(&self, delta_file: &mut DeltaFile, flow_id: u32, now: DateTime<Utc>) {
        let max = self.config.router.max_flow_depth;
        let Some(depth) = delta_file.flow(flow_id).map(|f| f.depth) else {
            return;
        };
        if depth > max {
            let context = format!("Flow depth {depth} exceeds the maximum of {max}");
            error_flow(delta_file, flow_id, MAX_FLOW_DEPTH, MAX_FLOW_DEPTH_CAUSE, &context, now);
        }
    }

    // -- Invocations ---------------------------------------------------------

    fn invocation(
        &self,
        delta_file: &DeltaFile,
        flow_id: u32,
        action: &ActionConfiguration,
        attempt: u32,
    ) -> Option<ActionInvocation> {
        let mut view = delta_file.for_queue(flow_id)?;
        if let Some(flow) = delta_file.flow(flow_id) {
            view.domains = gather(delta_file, flow, DeltaFileFlow::domains).into_values().collect();
            view.enrichments = gather(delta_file, flow, DeltaFileFlow::enrichments).into_values().collect();
        }
        // An aggregate's parents are the items it joined.
        let joined_dids = if action.action_type == ActionType::Join {
            delta_file.parent_dids.clone()
        } else {
            Vec::new()
        };
        Some(ActionInvocation {
            queue_name: action.action_class.clone(),
            context: ActionContext {
                did: delta_file.did,
                flow_name: view.flow_name.clone(),
                flow_id,
                action_name: action.name.clone(),
                attempt,
                joined_dids,
            },
            parameters: action.parameters.clone(),
            delta_file: view,
            joined: Vec::new(),
        })
    }

    /// Rebuild the invocation of the live record of `action_name`, for
    /// re-dispatching work that is already queued.
    ///
    /// For a JOIN on an aggregate only `joined_dids` can be rebuilt here;
    /// the member views come from [`joined_view`] on each stored member.
    pub fn invocation_for(
        &self,
        delta_file: &DeltaFile,
        flow_id: u32,
        action_name: &str,
    ) -> Option<ActionInvocation> {
        let flow = delta_file.flow(flow_id)?;
        let config = self.running_plan(&flow.name)?.action(action_name)?;
        let attempt = flow.latest_action(action_name)?.attempt;
        self.invocation(delta_file, flow_id, config, attempt)
    }

    /// Join registrations for every action `delta_file` has parked, for
    /// rebuilding the accumulator after a restart.
    pub fn parked_joins(&self, delta_file: &DeltaFile) -> Vec<PendingJoin> {
        let mut parked = Vec::new();
        for flow in &delta_file.flows {
            let Some(last) = flow.last_action() else {
                continue;
            };
            if last.state != ActionState::Collecting {
                continue;
            }
            let Some(action) = self.running_plan(&flow.name).and_then(|p| p.action(&last.name)) else {
                continue;
            };
            let Some(join) = &action.join else {
                continue;
            };
            parked.push(PendingJoin {
                key: join_key(flow, action, join),
                config: join.clone(),
                member: JoinMember {
                    did: delta_file.did,
                    flow_id: flow.id,
                    joined_at: last.created,
                },
            });
        }
        parked
    }

    // -- Split and join --------------------------------------------------------

    /// Build one child of a split.
    ///
    /// The child carries copies of the parent's ancestor flows and of the
    /// splitting flow up to the split, with the splitting action recorded
    /// COMPLETE on the child's own content. Advancing the child's flow
    /// (same id as in the parent) continues the plan from there.
    pub fn split_child(
        &self,
        parent: &DeltaFile,
        flow_id: u32,
        action: &Action,
        child: &SplitChild,
        now: DateTime<Utc>,
    ) -> Option<DeltaFile> {
        let flow = parent.flow(flow_id)?;
        let mut delta_file = DeltaFile::new(DeltaFileId::new(), &child.name, &parent.data_source, now);
        delta_file.parent_dids = vec![parent.did];
        delta_file.ingress_bytes = child.content.iter().map(|c| c.size()).sum();
        delta_file.flows = copy_ancestors(parent, flow);

        let mut child_flow = flow.clone();
        child_flow.actions.truncate(action.number);
        child_flow.depth = flow.depth + 1;
        child_flow.created = now;
        child_flow.publish_topics.clear();
        child_flow
            .add_action(&action.name, action.action_type, ActionState::Queued, now)
            .complete(
                action.start.unwrap_or(now),
                action.stop.unwrap_or(now),
                child.content.clone(),
                child.metadata.clone(),
                Vec::new(),
                now,
            );
        child_flow.update_state(now);
        delta_file.flows.push(child_flow);
        self.check_depth(&mut delta_file, flow_id, now);
        Some(delta_file)
    }

    /// Build the aggregate item `did` for a released join plus the
    /// invocation of its JOIN action. `members` pairs each joined item with
    /// the flow that parked it; the first member's flow history seeds the
    /// aggregate.
    pub fn join_aggregate(
        &self,
        key: &JoinKey,
        did: DeltaFileId,
        members: &[(DeltaFile, u32)],
        now: DateTime<Utc>,
    ) -> Option<(DeltaFile, ActionInvocation)> {
        let (first, first_flow_id) = members.first()?;
        let flow = first.flow(*first_flow_id)?;
        let config = self.running_plan(&key.flow)?.action(&key.action)?;
        let collecting = flow.latest_action(&key.action)?;

        let mut aggregate = DeltaFile::new(did, &first.name, &first.data_source, now);
        aggregate.parent_dids = members.iter().map(|(df, _)| df.did).collect();
        aggregate.join_key = Some(key.group.clone());
        aggregate.flows = copy_ancestors(first, flow);

        let mut joined_flow = flow.clone();
        joined_flow.actions.truncate(collecting.number);
        joined_flow.depth = members
            .iter()
            .filter_map(|(df, id)| df.flow(*id).map(|f| f.depth))
            .max()
            .unwrap_or(flow.depth);
        joined_flow.created = now;
        let attempt = joined_flow
            .queue_new_action(&key.action, ActionType::Join, false, now)
            .attempt;
        joined_flow.update_state(now);
        let flow_id = joined_flow.id;
        aggregate.flows.push(joined_flow);
        aggregate.update_stage(now);

        let mut invocation = self.invocation(&aggregate, flow_id, config, attempt)?;
        invocation.joined = members
            .iter()
            .filter_map(|(df, id)| df.for_queue(*id))
            .collect();
        Some((aggregate, invocation))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// What a JOIN worker sees of `member`: the view of its flow `flow_name`
/// that was parked on `action_name`.
pub fn joined_view(member: &DeltaFile, flow_name: &str, action_name: &str) -> Option<DeltaFileView> {
    let flow = member.flows.iter().rev().find(|f| {
        f.name == flow_name
            && f.latest_action(action_name).is_some_and(|a| {
                matches!(
                    a.state,
                    ActionState::Collecting | ActionState::ReadyToCollect | ActionState::Collected
                )
            })
    })?;
    member.for_queue(flow.id)
}

/// Items accumulate per joining action and per value of the configured
/// metadata key; without a key the whole flow forms one group.
fn join_key(flow: &DeltaFileFlow, action: &ActionConfiguration, join: &JoinConfiguration) -> JoinKey {
    let group = match &join.metadata_key {
        Some(key) => flow
            .metadata()
            .get(key)
            .cloned()
            .unwrap_or_else(|| DEFAULT_JOIN_GROUP.to_string()),
        None => flow.name.clone(),
    };
    JoinKey {
        flow: flow.name.clone(),
        action: action.name.clone(),
        group,
    }
}

/// Whether a touched flow may make further progress.
fn can_advance(flow: &DeltaFileFlow) -> bool {
    if matches!(flow.state, FlowState::Cancelled | FlowState::Error) {
        return false;
    }
    !flow.last_action().is_some_and(|a| {
        matches!(
            a.state,
            ActionState::Split
                | ActionState::Filtered
                | ActionState::Collected
                | ActionState::Cancelled
                | ActionState::Error
        )
    })
}

/// Values from the flow's ancestors then the flow itself; nearer wins.
fn gather<T>(
    delta_file: &DeltaFile,
    flow: &DeltaFileFlow,
    values: fn(&DeltaFileFlow) -> BTreeMap<String, T>,
) -> BTreeMap<String, T> {
    let mut all = BTreeMap::new();
    for ancestor in flow.input.ancestor_ids.iter().filter_map(|id| delta_file.flow(*id)) {
        all.extend(values(ancestor));
    }
    all.extend(values(flow));
    all
}

/// Metadata the item was ingested with.
fn source_metadata<'a>(delta_file: &'a DeltaFile, flow: &'a DeltaFileFlow) -> &'a Metadata {
    flow.input
        .ancestor_ids
        .first()
        .and_then(|id| delta_file.flow(*id))
        .map_or(&flow.input.metadata, |source| &source.input.metadata)
}

fn copy_ancestors(delta_file: &DeltaFile, flow: &DeltaFileFlow) -> Vec<DeltaFileFlow> {
    flow.input
        .ancestor_ids
        .iter()
        .filter_map(|id| delta_file.flow(*id).cloned())
        .collect()
}

/// Record a synthetic ERROR action carrying the flow's current content.
pub(crate) fn error_flow(
    delta_file: &mut DeltaFile,
    flow_id: u32,
    action_name: &str,
    cause: &str,
    context: &str,
    now: DateTime<Utc>,
) {
    let Some(flow) = delta_file.flow_mut(flow_id) else {
        return;
    };
    let carried = flow.last_content().to_vec();
    let action = flow.add_action(action_name, ActionType::Publish, ActionState::Queued, now);
    action.error(now, now, cause, context, now);
    action.content = carried;
    flow.update_state(now);
}

fn record_test_egress(
    delta_file: &mut DeltaFile,
    flow_id: u32,
    action_name: &str,
    reason: String,
    now: DateTime<Utc>,
) {
    let Some(flow) = delta_file.flow_mut(flow_id) else {
        return;
    };
    let carried = flow.last_content().to_vec();
    flow.add_action(action_name, ActionType::Egress, ActionState::Queued, now)
        .complete(now, now, carried, Metadata::new(), Vec::new(), now);
    info!(flow = %flow.name, action = action_name, "Skipped egress: {reason}");
    flow.test_mode_reason = Some(reason);
    flow.update_state(now);
}
