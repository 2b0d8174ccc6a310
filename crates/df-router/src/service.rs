//! The DeltaFile service: every state change goes through here.
//!
//! Each operation is one optimistic cycle wrapped in [`retry_on_conflict`]:
//! read the item, apply the change, let the [`FlowRouter`] advance the
//! touched flows, decide hot or cold queueing, then save against the
//! version that was read. Only after the save succeeds is anything
//! dispatched, parked in the join accumulator, or announced on the event
//! bus, so a retried cycle never leaves duplicate work behind.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use df_content::Content;
use df_core::events::{EventBus, EventPayload};
use df_core::{DeltaFileId, Error, Result};
use df_model::{
    Action, ActionState, ActionType, DeltaFile, FlowInput, FlowState, FlowType, Metadata,
    ResumeMetadata,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::dispatch::{ActionInvocation, DispatchQueue};
use crate::event::{ActionEvent, Outcome};
use crate::join::{JoinAccumulator, JoinKey, JoinMember, JoinRelease, PendingJoin};
use crate::repository::DeltaFileRepository;
use crate::retry::{retry_on_conflict, RetryPolicy};
use crate::router::{joined_view, Advancement, FlowRouter};

/// Name of the action recorded on a data source flow at ingress.
pub const INGRESS_ACTION: &str = "IngressAction";
/// Cause recorded on members of a join that timed out too small.
pub const JOIN_FAILED_CAUSE: &str = "Failed to collect: minNum not reached";
/// Cause recorded on a member whose collection into a stored aggregate
/// could not be saved.
pub const JOIN_RECORD_FAILED_CAUSE: &str = "Failed to record join";

/// A new item arriving at a data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRequest {
    pub data_source: String,
    pub name: String,
    #[serde(default)]
    pub content: Vec<Content>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// What a change did besides mutating the item.
#[derive(Debug, Default)]
struct Touched {
    /// Flows to advance.
    flows: Vec<u32>,
    /// Live actions to dispatch again as they are.
    redispatch: Vec<(u32, String)>,
}

impl From<Vec<u32>> for Touched {
    fn from(flows: Vec<u32>) -> Self {
        Self {
            flows,
            redispatch: Vec::new(),
        }
    }
}

/// Work decided inside a cycle, released once the save succeeded.
#[derive(Debug, Default)]
struct Pending {
    hot: Vec<ActionInvocation>,
    cold: Vec<ActionInvocation>,
    joins: Vec<PendingJoin>,
    stage_changed: bool,
}

pub struct DeltaFilesService {
    repo: Arc<dyn DeltaFileRepository>,
    queue: Arc<dyn DispatchQueue>,
    router: FlowRouter,
    joins: Mutex<JoinAccumulator>,
    events: Arc<EventBus>,
    retry: RetryPolicy,
}

impl DeltaFilesService {
    pub fn new(
        repo: Arc<dyn DeltaFileRepository>,
        queue: Arc<dyn DispatchQueue>,
        router: FlowRouter,
        events: Arc<EventBus>,
    ) -> Self {
        let retry = RetryPolicy::from(&router.config().retry);
        Self {
            repo,
            queue,
            router,
            joins: Mutex::new(JoinAccumulator::new()),
            events,
            retry,
        }
    }

    pub fn router(&self) -> &FlowRouter {
        &self.router
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Number of join groups still accumulating.
    pub fn open_joins(&self) -> usize {
        self.joins.lock().len()
    }

    /// # Errors
    ///
    /// [`Error::NotFound`] when no item has this id.
    pub async fn get(&self, did: DeltaFileId) -> Result<DeltaFile> {
        self.repo
            .get(did)
            .await?
            .ok_or_else(|| Error::not_found("deltaFile", did))
    }

    // -----------------------------------------------------------------------
    // Ingress
    // -----------------------------------------------------------------------

    /// Accept a new item at a data source and route it.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the data source is unknown or not running.
    pub async fn ingest(&self, request: IngressRequest) -> Result<DeltaFile> {
        let now = Utc::now();
        let plan = self
            .router
            .running_plan(&request.data_source)
            .filter(|p| p.flow_type.is_data_source())
            .ok_or_else(|| Error::not_found("dataSource", &request.data_source))?;

        let ingress_type = match plan.flow_type {
            FlowType::TimedDataSource => ActionType::TimedIngress,
            _ => ActionType::Ingress,
        };
        let mut delta_file = DeltaFile::new(DeltaFileId::new(), &request.name, &plan.name, now);
        delta_file.ingress_bytes = request.content.iter().map(Content::size).sum();
        let input = FlowInput {
            content: request.content.clone(),
            metadata: request.metadata.clone(),
            ..Default::default()
        };
        let flow_id = self.router.start_flow(&mut delta_file, plan, input, 0, now);
        if let Some(flow) = delta_file.flow_mut(flow_id) {
            flow.add_action(INGRESS_ACTION, ingress_type, ActionState::Queued, now)
                .complete(now, now, request.content, request.metadata, Vec::new(), now);
            flow.update_state(now);
        }

        let (delta_file, releases) = self.admit(delta_file, vec![flow_id], Vec::new(), now).await?;
        info!(
            did = %delta_file.did,
            data_source = %delta_file.data_source,
            bytes = delta_file.ingress_bytes,
            "Ingested"
        );
        self.events.broadcast(EventPayload::DeltaFileIngested {
            did: delta_file.did,
            data_source: delta_file.data_source.clone(),
        });
        self.settle_all(releases, now).await?;
        Ok(delta_file)
    }

    // -----------------------------------------------------------------------
    // Worker events
    // -----------------------------------------------------------------------

    /// Apply one worker-reported result.
    ///
    /// # Errors
    ///
    /// [`Error::UnexpectedAction`] for events addressing an action that is
    /// not pending at that attempt (stale, duplicate, or cancelled), and
    /// [`Error::InvalidEvent`] for outcomes that do not fit the action.
    /// Both are announced as rejections and leave the item untouched.
    pub async fn handle_event(&self, event: ActionEvent) -> Result<DeltaFile> {
        let now = Utc::now();
        let event_ref = &event;
        let result = retry_on_conflict(&self.retry, event.did, move |_| {
            self.apply_event(event_ref, now)
        })
        .await;

        let (delta_file, pending, children) = match result {
            Ok(applied) => applied,
            Err(e @ (Error::UnexpectedAction { .. } | Error::InvalidEvent { .. })) => {
                warn!(did = %event.did, action = %event.action_name, "Rejected event: {e}");
                self.events.broadcast(EventPayload::EventRejected {
                    did: event.did,
                    action: event.action_name.clone(),
                    reason: e.to_string(),
                });
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let mut releases = Vec::new();
        for child in children {
            let (_, more) = self.admit(child, vec![event.flow_id], Vec::new(), now).await?;
            releases.extend(more);
        }
        releases.extend(self.dispatch(&delta_file, pending).await?);
        self.settle_all(releases, now).await?;
        Ok(delta_file)
    }

    async fn apply_event(
        &self,
        event: &ActionEvent,
        now: DateTime<Utc>,
    ) -> Result<(DeltaFile, Pending, Vec<DeltaFile>)> {
        let mut delta_file = self.get(event.did).await?;
        let expected = delta_file.version;
        let action_type = delta_file
            .pending_action(event.flow_id, &event.action_name, event.attempt)?
            .action_type;
        event.validate(action_type)?;

        let (flow_name, carried) = match delta_file.flow(event.flow_id) {
            Some(flow) => (flow.name.clone(), flow.last_content().to_vec()),
            None => return Err(Error::not_found("flow", event.flow_id)),
        };
        let resume_policy = match &event.outcome {
            Outcome::Error(e) => self
                .router
                .config()
                .auto_resume
                .iter()
                .find(|p| p.matches(event.attempt, &e.cause, &flow_name, &event.action_name))
                .cloned(),
            _ => None,
        };

        let action = delta_file.pending_action(event.flow_id, &event.action_name, event.attempt)?;
        let (start, stop) = (event.start, event.stop);
        let mut egressed = false;
        let mut filtered = false;
        match &event.outcome {
            Outcome::Transform(t) | Outcome::Join(t) => {
                action.complete(
                    start,
                    stop,
                    t.content.clone(),
                    t.metadata.clone(),
                    t.delete_metadata_keys.clone(),
                    now,
                );
            }
            Outcome::Load(l) => {
                action.complete(
                    start,
                    stop,
                    l.content.clone(),
                    l.metadata.clone(),
                    l.delete_metadata_keys.clone(),
                    now,
                );
                action.domains = l.domains.clone();
            }
            Outcome::Domain(d) => {
                action.complete(start, stop, carried, d.metadata.clone(), Vec::new(), now);
                action.domains = d.domains.clone();
            }
            Outcome::Enrich(e) => {
                action.complete(start, stop, carried, e.metadata.clone(), Vec::new(), now);
                action.enrichments = e.enrichments.clone();
            }
            Outcome::Format(f) => {
                action.complete(start, stop, f.content.clone(), f.metadata.clone(), Vec::new(), now);
            }
            Outcome::Validate => {
                action.complete(start, stop, carried, Metadata::new(), Vec::new(), now);
            }
            Outcome::Egress(e) => {
                action.complete(start, stop, carried, Metadata::new(), Vec::new(), now);
                egressed = true;
                debug!(
                    did = %event.did,
                    destination = e.destination.as_deref().unwrap_or("-"),
                    bytes = e.bytes_egressed,
                    "Egressed"
                );
            }
            Outcome::Error(e) => {
                action.error(start, stop, &e.cause, &e.context, now);
                if let Some(policy) = &resume_policy {
                    let delay = chrono::Duration::from_std(policy.delay_for(event.attempt))
                        .unwrap_or_else(|_| chrono::Duration::zero());
                    action.next_auto_resume = Some(stop + delay);
                    action.next_auto_resume_reason = Some(policy.name.clone());
                }
            }
            Outcome::Filter(f) => {
                action.filter(start, stop, &f.cause, f.context.as_deref(), now);
                filtered = true;
            }
            Outcome::Split(_) => {
                action.split(start, stop, now);
            }
        }
        let split_action: Option<Action> =
            matches!(event.outcome, Outcome::Split(_)).then(|| action.clone());

        delta_file.egressed |= egressed;
        delta_file.filtered |= filtered;
        if let Some(flow) = delta_file.flow_mut(event.flow_id) {
            flow.update_state(now);
        }

        let mut children = Vec::new();
        if let (Some(split_action), Outcome::Split(split)) = (&split_action, &event.outcome) {
            for child in &split.children {
                if let Some(child) =
                    self.router
                        .split_child(&delta_file, event.flow_id, split_action, child, now)
                {
                    children.push(child);
                }
            }
            delta_file.child_dids.extend(children.iter().map(|c| c.did));
        }

        let pending = self
            .advance(&mut delta_file, Touched::from(vec![event.flow_id]), now)
            .await?;
        delta_file.version = self.repo.save(&delta_file, expected).await?;
        debug!(
            did = %delta_file.did,
            action = %event.action_name,
            outcome = event.outcome.kind(),
            "Applied event"
        );
        Ok((delta_file, pending, children))
    }

    // -----------------------------------------------------------------------
    // Operator actions
    // -----------------------------------------------------------------------

    /// Cancel every unfinished flow of the item.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] when the item is already complete or cancelled.
    pub async fn cancel(&self, did: DeltaFileId) -> Result<DeltaFile> {
        let delta_file = self
            .update(did, Utc::now(), |df, now| {
                if df.cancel(now) {
                    Ok(Touched::default())
                } else {
                    Err(Error::Validation(format!(
                        "DeltaFile {did} is {} and cannot be cancelled",
                        df.stage
                    )))
                }
            })
            .await?;
        info!(did = %did, "Cancelled");
        Ok(delta_file)
    }

    /// Retry every errored flow, folding in `resume_metadata`.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] when nothing is in error.
    pub async fn resume(&self, did: DeltaFileId, resume_metadata: &[ResumeMetadata]) -> Result<DeltaFile> {
        self.update(did, Utc::now(), |df, now| {
            let resumed = df.resume_errors(resume_metadata, now);
            if resumed.is_empty() {
                return Err(Error::Validation(format!("DeltaFile {did} has no errors to resume")));
            }
            info!(did = %did, flows = ?resumed, "Resuming");
            Ok(resumed.into())
        })
        .await
    }

    /// # Errors
    ///
    /// [`Error::Validation`] when there is no unacknowledged error.
    pub async fn acknowledge(&self, did: DeltaFileId, reason: &str) -> Result<DeltaFile> {
        self.update(did, Utc::now(), |df, now| {
            if df.acknowledge_errors(now, reason) {
                Ok(Touched::default())
            } else {
                Err(Error::Validation(format!("DeltaFile {did} has no errors to acknowledge")))
            }
        })
        .await
    }

    pub async fn clear_acknowledged(&self, did: DeltaFileId) -> Result<DeltaFile> {
        self.update(did, Utc::now(), |df, now| {
            df.clear_acknowledged_errors(now);
            Ok(Touched::default())
        })
        .await
    }

    /// Record annotations; data sinks waiting on them complete.
    pub async fn annotate(&self, did: DeltaFileId, annotations: BTreeMap<String, String>) -> Result<DeltaFile> {
        self.update(did, Utc::now(), |df, now| {
            df.annotate(&annotations, now);
            Ok(Touched::default())
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Sweeps
    // -----------------------------------------------------------------------

    /// Settle join groups whose max age ran out. Returns how many settled.
    pub async fn sweep_joins(&self, now: DateTime<Utc>) -> Result<usize> {
        let releases = self.joins.lock().expired(now);
        let count = releases.len();
        self.settle_all(releases, now).await?;
        Ok(count)
    }

    /// Dispatch again actions queued for longer than the requeue duration,
    /// and warm cold-queued actions while their queue has room. Join members
    /// left behind by a release that failed part way are settled or parked
    /// again. Returns the number of items and members touched.
    pub async fn requeue(&self, now: DateTime<Utc>) -> Result<usize> {
        let config = &self.router.config().queue;
        let stale_after = chrono::Duration::from_std(config.requeue_duration())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = now - stale_after;

        let mut dids = self.repo.queued_before(cutoff).await?;
        dids.extend(self.repo.cold_queued(config.cold_queue_threshold.max(1)).await?);
        dids.sort();
        dids.dedup();

        for did in &dids {
            let did = *did;
            self.update(did, now, |df, now| {
                let mut touched = Touched::default();
                for flow in &mut df.flows {
                    for action in &mut flow.actions {
                        let stale = action.state == ActionState::Queued
                            && action.queued.is_some_and(|q| q < cutoff);
                        if stale || action.state == ActionState::ColdQueued {
                            action.requeue(false, now);
                            touched.redispatch.push((flow.id, action.name.clone()));
                        }
                    }
                    flow.update_state(now);
                }
                Ok(touched)
            })
            .await?;
        }
        if !dids.is_empty() {
            info!(items = dids.len(), "Requeued");
        }
        let (recovered, _) = self.recover_joins(Some(cutoff), now).await?;
        Ok(dids.len() + recovered)
    }

    /// Resume errored flows whose auto-resume time has come. Returns the
    /// number of items resumed.
    pub async fn auto_resume(&self, now: DateTime<Utc>) -> Result<usize> {
        let dids = self.repo.auto_resume_due(now).await?;
        for did in &dids {
            self.update(*did, now, |df, now| {
                let mut resumed = Vec::new();
                for flow in &mut df.flows {
                    let due = flow.state == FlowState::Error
                        && flow.next_auto_resume.is_some_and(|at| at <= now);
                    if due && flow.resume(&[], now).is_some() {
                        resumed.push(flow.id);
                    }
                }
                Ok(resumed.into())
            })
            .await?;
        }
        if !dids.is_empty() {
            info!(items = dids.len(), "Auto-resumed");
        }
        Ok(dids.len())
    }

    /// Rebuild the join accumulator from items parked in the repository,
    /// and settle members a release left waiting for collection. Returns
    /// the number of members parked or settled.
    pub async fn restore_joins(&self) -> Result<usize> {
        let (recovered, parked) = self.recover_joins(None, Utc::now()).await?;
        Ok(recovered + parked)
    }

    /// Park every COLLECTING member again (the accumulator ignores members
    /// it already holds) and settle READY_TO_COLLECT members last modified
    /// before `cutoff`: collected when their aggregate was stored, parked
    /// again otherwise. Returns (settled, parked).
    async fn recover_joins(&self, cutoff: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Result<(usize, usize)> {
        let mut settled = 0;
        let mut parked = 0;
        let mut releases = Vec::new();
        for did in self.repo.joining().await? {
            let Some(delta_file) = self.repo.get(did).await? else {
                continue;
            };
            for (flow_id, action, join_id) in ready_to_collect(&delta_file, cutoff) {
                let aggregate = match join_id {
                    Some(id) => self.repo.get(id).await?,
                    None => None,
                };
                let result = match aggregate {
                    Some(aggregate) => self.collect_or_error(did, flow_id, &action, aggregate.did, now).await,
                    None => self.unready(did, flow_id, &action, now).await,
                };
                match result {
                    Ok(more) => {
                        settled += 1;
                        releases.extend(more);
                    }
                    Err(e) => warn!(did = %did, action = %action, "Join member still waiting: {e}"),
                }
            }

            let Some(delta_file) = self.repo.get(did).await? else {
                continue;
            };
            let pending = self.router.parked_joins(&delta_file);
            parked += pending.len();
            let released: Vec<_> = {
                let mut joins = self.joins.lock();
                pending.into_iter().filter_map(|p| joins.add(p)).collect()
            };
            releases.extend(released);
        }
        if settled > 0 {
            info!(members = settled, "Settled join members");
        }
        self.settle_all(releases, now).await?;
        Ok((settled, parked))
    }

    // -----------------------------------------------------------------------
    // Cycle plumbing
    // -----------------------------------------------------------------------

    /// One retried read-change-advance-save cycle, then dispatch and settle.
    async fn update<F>(&self, did: DeltaFileId, now: DateTime<Utc>, change: F) -> Result<DeltaFile>
    where
        F: Fn(&mut DeltaFile, DateTime<Utc>) -> Result<Touched> + Sync,
    {
        let (delta_file, releases) = self.commit(did, now, change).await?;
        self.settle_all(releases, now).await?;
        Ok(delta_file)
    }

    /// Like [`Self::update`] but hands join releases back unsettled.
    async fn commit<F>(
        &self,
        did: DeltaFileId,
        now: DateTime<Utc>,
        change: F,
    ) -> Result<(DeltaFile, Vec<JoinRelease>)>
    where
        F: Fn(&mut DeltaFile, DateTime<Utc>) -> Result<Touched> + Sync,
    {
        let change = &change;
        let (delta_file, pending) = retry_on_conflict(&self.retry, did, move |_| async move {
            let mut delta_file = self.get(did).await?;
            let expected = delta_file.version;
            let touched = change(&mut delta_file, now)?;
            let pending = self.advance(&mut delta_file, touched, now).await?;
            delta_file.version = self.repo.save(&delta_file, expected).await?;
            Ok::<_, Error>((delta_file, pending))
        })
        .await?;
        let releases = self.dispatch(&delta_file, pending).await?;
        Ok((delta_file, releases))
    }

    /// Advance and store a new item, dispatching `extra` alongside whatever
    /// the router queues.
    async fn admit(
        &self,
        mut delta_file: DeltaFile,
        touched: Vec<u32>,
        extra: Vec<ActionInvocation>,
        now: DateTime<Utc>,
    ) -> Result<(DeltaFile, Vec<JoinRelease>)> {
        let mut pending = self.advance(&mut delta_file, touched.into(), now).await?;
        if !extra.is_empty() {
            let (hot, cold) = self.partition(&mut delta_file, extra, now).await?;
            pending.hot.extend(hot);
            pending.cold.extend(cold);
        }
        let delta_file = self.repo.insert(delta_file).await?;
        let releases = self.dispatch(&delta_file, pending).await?;
        Ok((delta_file, releases))
    }

    async fn advance(&self, delta_file: &mut DeltaFile, touched: Touched, now: DateTime<Utc>) -> Result<Pending> {
        let Advancement {
            mut invocations,
            joins,
            stage_changed,
        } = self.router.advance(delta_file, touched.flows, now);
        invocations.extend(
            touched
                .redispatch
                .iter()
                .filter_map(|(flow_id, name)| self.router.invocation_for(delta_file, *flow_id, name)),
        );
        for invocation in &mut invocations {
            self.attach_joined(invocation).await?;
        }
        let (hot, cold) = self.partition(delta_file, invocations, now).await?;
        Ok(Pending {
            hot,
            cold,
            joins,
            stage_changed,
        })
    }

    /// Fill in the member views of a JOIN invocation rebuilt from its
    /// aggregate alone.
    async fn attach_joined(&self, invocation: &mut ActionInvocation) -> Result<()> {
        if invocation.context.joined_dids.is_empty() || !invocation.joined.is_empty() {
            return Ok(());
        }
        let context = &invocation.context;
        let mut joined = Vec::with_capacity(context.joined_dids.len());
        for did in &context.joined_dids {
            match self.repo.get(*did).await? {
                Some(member) => {
                    joined.extend(joined_view(&member, &context.flow_name, &context.action_name));
                }
                None => warn!(did = %did, aggregate = %context.did, "Joined item is gone"),
            }
        }
        invocation.joined = joined;
        Ok(())
    }

    /// Split invocations into those to dispatch now and those to leave
    /// cold. An action goes cold when its queue, counting what this batch
    /// already adds, has reached the cold queue threshold.
    async fn partition(
        &self,
        delta_file: &mut DeltaFile,
        invocations: Vec<ActionInvocation>,
        now: DateTime<Utc>,
    ) -> Result<(Vec<ActionInvocation>, Vec<ActionInvocation>)> {
        let threshold = self.router.config().queue.cold_queue_threshold;
        let mut batch: BTreeMap<String, usize> = BTreeMap::new();
        let (mut hot, mut cold) = (Vec::new(), Vec::new());

        for invocation in invocations {
            let waiting = self.queue.len(&invocation.queue_name).await?;
            let added = batch.entry(invocation.queue_name.clone()).or_default();
            if waiting + *added < threshold {
                *added += 1;
                hot.push(invocation);
                continue;
            }
            let context = &invocation.context;
            if let Some(flow) = delta_file.flow_mut(context.flow_id) {
                let action_type = flow
                    .latest_action(&context.action_name)
                    .map_or(ActionType::Transform, |a| a.action_type);
                flow.queue_action(&context.action_name, action_type, true, now);
                flow.update_state(now);
            }
            cold.push(invocation);
        }
        Ok((hot, cold))
    }

    /// Hand saved work to the queue, the join accumulator, and the bus.
    async fn dispatch(&self, delta_file: &DeltaFile, pending: Pending) -> Result<Vec<JoinRelease>> {
        for invocation in pending.hot {
            self.announce_queued(&invocation, false);
            self.queue.enqueue(invocation).await?;
        }
        for invocation in &pending.cold {
            debug!(
                did = %invocation.context.did,
                action = %invocation.context.action_name,
                queue = %invocation.queue_name,
                "Cold queued"
            );
            self.announce_queued(invocation, true);
        }
        if pending.stage_changed {
            info!(did = %delta_file.did, stage = %delta_file.stage, "Stage changed");
            self.events.broadcast(EventPayload::StageChanged {
                did: delta_file.did,
                stage: delta_file.stage.to_string(),
            });
        }
        let mut joins = self.joins.lock();
        let releases = pending.joins.into_iter().filter_map(|j| joins.add(j)).collect();
        Ok(releases)
    }

    fn announce_queued(&self, invocation: &ActionInvocation, cold: bool) {
        self.events.broadcast(EventPayload::ActionQueued {
            did: invocation.context.did,
            flow: invocation.context.flow_name.clone(),
            action: invocation.context.action_name.clone(),
            queue: invocation.queue_name.clone(),
            cold,
        });
    }

    // -----------------------------------------------------------------------
    // Joins
    // -----------------------------------------------------------------------

    /// Settle every release, including those that settling produces. A
    /// failing release does not stop the others; the first error is
    /// returned once all are done.
    async fn settle_all(&self, mut releases: Vec<JoinRelease>, now: DateTime<Utc>) -> Result<()> {
        let mut first_error = None;
        while let Some(release) = releases.pop() {
            let result = match release {
                JoinRelease::Ready { key, members } => self.release_join(&key, &members, now).await,
                JoinRelease::Failed {
                    key,
                    members,
                    min_num,
                } => self.fail_join(&key, &members, min_num, now).await,
            };
            match result {
                Ok(more) => releases.extend(more),
                Err(e) => {
                    error!("Join settlement failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Build the aggregate for a released group and retire its members.
    ///
    /// Members are first marked READY_TO_COLLECT with the id the aggregate
    /// will get, then the aggregate is stored, then the members are marked
    /// COLLECTED. A member that cannot be collected into a stored aggregate
    /// is errored; if the aggregate itself cannot be stored the members go
    /// back to COLLECTING and the requeue sweep parks them again.
    async fn release_join(
        &self,
        key: &JoinKey,
        members: &[JoinMember],
        now: DateTime<Utc>,
    ) -> Result<Vec<JoinRelease>> {
        let aggregate_did = DeltaFileId::new();
        let mut releases = Vec::new();
        let mut ready = Vec::new();
        for member in members {
            let result = self
                .commit(member.did, now, |df, now| {
                    let action = parked_action(df, member.flow_id, &key.action, ActionState::Collecting)?;
                    action.change_state(ActionState::ReadyToCollect, None, None, now);
                    action.join_id = Some(aggregate_did);
                    Ok(Touched::default())
                })
                .await;
            match result {
                Ok((delta_file, more)) => {
                    ready.push((delta_file, member.flow_id));
                    releases.extend(more);
                }
                Err(e) => warn!(did = %member.did, join = %key, "Left out of join: {e}"),
            }
        }
        if ready.is_empty() {
            return Ok(releases);
        }

        let admitted = match self.router.join_aggregate(key, aggregate_did, &ready, now) {
            Some((aggregate, invocation)) => self.admit(aggregate, Vec::new(), vec![invocation], now).await,
            None => Err(Error::Internal(format!("Join {key} is no longer configured"))),
        };
        let aggregate = match admitted {
            Ok((aggregate, more)) => {
                releases.extend(more);
                aggregate
            }
            Err(e) => {
                for (member, flow_id) in &ready {
                    if let Err(undo) = self.unready(member.did, *flow_id, &key.action, now).await {
                        warn!(did = %member.did, join = %key, "Join member still waiting: {undo}");
                    }
                }
                return Err(e);
            }
        };

        for (member, flow_id) in &ready {
            match self
                .collect_or_error(member.did, *flow_id, &key.action, aggregate.did, now)
                .await
            {
                Ok(more) => releases.extend(more),
                Err(e) => warn!(did = %member.did, join = %key, "Join member still waiting: {e}"),
            }
        }

        info!(did = %aggregate.did, join = %key, members = ready.len(), "Join released");
        self.events.broadcast(EventPayload::JoinReleased {
            did: aggregate.did,
            flow: key.flow.clone(),
            action: key.action.clone(),
            members: ready.len(),
        });
        Ok(releases)
    }

    async fn fail_join(
        &self,
        key: &JoinKey,
        members: &[JoinMember],
        min_num: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<JoinRelease>> {
        warn!(join = %key, members = members.len(), min_num, "Join timed out below minimum");
        let context = format!(
            "Join {key} collected {} of the {min_num} required items",
            members.len()
        );
        let mut releases = Vec::new();
        for member in members {
            let result = self
                .error_member(
                    member.did,
                    member.flow_id,
                    &key.action,
                    ActionState::Collecting,
                    JOIN_FAILED_CAUSE,
                    &context,
                    now,
                )
                .await;
            match result {
                Ok(more) => releases.extend(more),
                Err(e) => warn!(did = %member.did, join = %key, "Skipping join member: {e}"),
            }
        }
        Ok(releases)
    }

    /// Collect a member into its stored aggregate. When that cannot be
    /// saved the member's join action is errored instead.
    async fn collect_or_error(
        &self,
        did: DeltaFileId,
        flow_id: u32,
        action_name: &str,
        aggregate: DeltaFileId,
        now: DateTime<Utc>,
    ) -> Result<Vec<JoinRelease>> {
        match self.collect_member(did, flow_id, action_name, aggregate, now).await {
            Ok(releases) => Ok(releases),
            Err(e) => {
                error!(did = %did, aggregate = %aggregate, "Could not record join: {e}");
                let context = format!("Collected into {aggregate}: {e}");
                self.error_member(
                    did,
                    flow_id,
                    action_name,
                    ActionState::ReadyToCollect,
                    JOIN_RECORD_FAILED_CAUSE,
                    &context,
                    now,
                )
                .await
            }
        }
    }

    /// READY_TO_COLLECT to COLLECTED, recording the aggregate as a child.
    async fn collect_member(
        &self,
        did: DeltaFileId,
        flow_id: u32,
        action_name: &str,
        aggregate: DeltaFileId,
        now: DateTime<Utc>,
    ) -> Result<Vec<JoinRelease>> {
        let (_, releases) = self
            .commit(did, now, |df, now| {
                let action = parked_action(df, flow_id, action_name, ActionState::ReadyToCollect)?;
                action.change_state(ActionState::Collected, None, Some(now), now);
                if !df.child_dids.contains(&aggregate) {
                    df.child_dids.push(aggregate);
                }
                if let Some(flow) = df.flow_mut(flow_id) {
                    flow.update_state(now);
                }
                Ok(Touched::default())
            })
            .await?;
        Ok(releases)
    }

    /// READY_TO_COLLECT back to COLLECTING, for a member whose aggregate was
    /// never stored.
    async fn unready(
        &self,
        did: DeltaFileId,
        flow_id: u32,
        action_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<JoinRelease>> {
        let (_, releases) = self
            .commit(did, now, |df, now| {
                let action = parked_action(df, flow_id, action_name, ActionState::ReadyToCollect)?;
                action.change_state(ActionState::Collecting, None, None, now);
                action.join_id = None;
                Ok(Touched::default())
            })
            .await?;
        Ok(releases)
    }

    /// Error a parked member's join action.
    #[allow(clippy::too_many_arguments)]
    async fn error_member(
        &self,
        did: DeltaFileId,
        flow_id: u32,
        action_name: &str,
        expected: ActionState,
        cause: &str,
        context: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<JoinRelease>> {
        let (_, releases) = self
            .commit(did, now, |df, now| {
                let action = parked_action(df, flow_id, action_name, expected)?;
                let since = action.created;
                action.error(since, now, cause, context, now);
                if let Some(flow) = df.flow_mut(flow_id) {
                    flow.update_state(now);
                }
                Ok(Touched::default())
            })
            .await?;
        Ok(releases)
    }
}

impl std::fmt::Debug for DeltaFilesService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaFilesService")
            .field("open_joins", &self.open_joins())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Flows of `delta_file` whose join action waits for collection and was
/// last modified before `cutoff`, with the action name and aggregate id.
fn ready_to_collect(
    delta_file: &DeltaFile,
    cutoff: Option<DateTime<Utc>>,
) -> Vec<(u32, String, Option<DeltaFileId>)> {
    delta_file
        .flows
        .iter()
        .filter_map(|flow| {
            let last = flow.last_action()?;
            let stale = cutoff.map_or(true, |cutoff| last.modified < cutoff);
            (last.state == ActionState::ReadyToCollect && stale)
                .then(|| (flow.id, last.name.clone(), last.join_id))
        })
        .collect()
}

/// The latest record of `name` in `flow_id`, which must be in `state`.
fn parked_action<'a>(
    delta_file: &'a mut DeltaFile,
    flow_id: u32,
    name: &str,
    state: ActionState,
) -> Result<&'a mut Action> {
    let did = delta_file.did;
    let flow = delta_file
        .flow_mut(flow_id)
        .ok_or_else(|| Error::unexpected_action(did, flow_id.to_string(), name, "no flow with this id"))?;
    let flow_name = flow.name.clone();
    let action = flow
        .actions
        .iter_mut()
        .rev()
        .find(|a| a.name == name && a.state != ActionState::Retried)
        .ok_or_else(|| Error::unexpected_action(did, &flow_name, name, "no record of this action"))?;
    if action.state != state {
        return Err(Error::unexpected_action(
            did,
            &flow_name,
            name,
            format!("action is {}, expected {state}", action.state),
        ));
    }
    Ok(action)
}
