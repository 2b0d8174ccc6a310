//! One flow instance for one item.
//!
//! A [`DeltaFileFlow`] owns an ordered action history. Its [`FlowState`] is
//! derived from the last action by [`DeltaFileFlow::update_state`], which
//! must run after every action mutation; only [`DeltaFileFlow::cancel`] sets
//! the state directly.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use df_content::{Content, Segment};
use df_core::{DeltaFileId, Error, Result};
use serde::{Deserialize, Serialize};

use crate::action::{Action, ActionState, ActionType};
use crate::types::{Domain, Enrichment, Metadata, ResumeMetadata};

// ---------------------------------------------------------------------------
// FlowType / FlowState
// ---------------------------------------------------------------------------

/// Kind of flow plan a flow instance was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowType {
    RestDataSource,
    TimedDataSource,
    Transform,
    DataSink,
}

impl FlowType {
    pub fn is_data_source(self) -> bool {
        matches!(self, FlowType::RestDataSource | FlowType::TimedDataSource)
    }
}

/// Derived state of a flow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowState {
    InFlight,
    Complete,
    Error,
    Cancelled,
    PendingAnnotations,
}

// ---------------------------------------------------------------------------
// FlowInput
// ---------------------------------------------------------------------------

/// What a flow instance started from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowInput {
    #[serde(default)]
    pub content: Vec<Content>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Topics the flow was subscribed through.
    #[serde(default)]
    pub topics: BTreeSet<String>,
    /// Ids of the flows this one descends from, nearest last.
    #[serde(default)]
    pub ancestor_ids: Vec<u32>,
}

// ---------------------------------------------------------------------------
// DeltaFileFlow
// ---------------------------------------------------------------------------

/// One instantiation of a flow plan for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaFileFlow {
    pub name: String,
    /// Unique within the owning DeltaFile.
    pub id: u32,
    pub flow_type: FlowType,
    pub state: FlowState,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub input: FlowInput,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub publish_topics: Vec<String>,
    /// Number of publish hops from the data source.
    pub depth: u32,
    #[serde(default)]
    pub pending_annotations: BTreeSet<String>,
    pub test_mode: bool,
    pub test_mode_reason: Option<String>,
    pub error_or_filter_cause: Option<String>,
    pub next_auto_resume: Option<DateTime<Utc>>,
    pub cold_queued: bool,
}

impl DeltaFileFlow {
    pub fn new(
        name: impl Into<String>,
        id: u32,
        flow_type: FlowType,
        input: FlowInput,
        depth: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            id,
            flow_type,
            state: FlowState::InFlight,
            created: now,
            modified: now,
            input,
            actions: Vec::new(),
            publish_topics: Vec::new(),
            depth,
            pending_annotations: BTreeSet::new(),
            test_mode: false,
            test_mode_reason: None,
            error_or_filter_cause: None,
            next_auto_resume: None,
            cold_queued: false,
        }
    }

    // -- Lookup --------------------------------------------------------------

    pub fn last_action(&self) -> Option<&Action> {
        self.actions.last()
    }

    /// Latest record for `name` that has not been superseded by a retry.
    pub fn latest_action(&self, name: &str) -> Option<&Action> {
        self.actions
            .iter()
            .rev()
            .find(|a| a.name == name && a.state != ActionState::Retried)
    }

    fn latest_action_index(&self, name: &str) -> Option<usize> {
        self.actions
            .iter()
            .rposition(|a| a.name == name && a.state != ActionState::Retried)
    }

    /// Whether `name` has a terminal, non-retried record.
    pub fn has_final_action(&self, name: &str) -> bool {
        self.latest_action(name).is_some_and(Action::is_final)
    }

    pub fn queued_actions(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter().filter(|a| a.is_queued())
    }

    /// Whether any action still waits on a worker or a join.
    pub fn has_pending_actions(&self) -> bool {
        self.actions.iter().any(|a| !a.is_terminal())
    }

    pub fn is_terminal(&self) -> bool {
        self.state != FlowState::InFlight
    }

    // -- Queueing ------------------------------------------------------------

    /// Queue `name`: re-queue its live record in place, or append attempt 1.
    pub fn queue_action(
        &mut self,
        name: &str,
        action_type: ActionType,
        cold: bool,
        now: DateTime<Utc>,
    ) -> &mut Action {
        match self.latest_action_index(name) {
            Some(index) => {
                self.actions[index].requeue(cold, now);
                self.modified = now;
                &mut self.actions[index]
            }
            None => self.queue_new_action(name, action_type, cold, now),
        }
    }

    /// Append a fresh queued attempt of `name`.
    pub fn queue_new_action(
        &mut self,
        name: &str,
        action_type: ActionType,
        cold: bool,
        now: DateTime<Utc>,
    ) -> &mut Action {
        let state = if cold {
            ActionState::ColdQueued
        } else {
            ActionState::Queued
        };
        self.add_action(name, action_type, state, now)
    }

    /// Append a record of `name` in `state`. The attempt number continues
    /// after the highest earlier attempt of the same name.
    pub fn add_action(
        &mut self,
        name: &str,
        action_type: ActionType,
        state: ActionState,
        now: DateTime<Utc>,
    ) -> &mut Action {
        let attempt = self
            .actions
            .iter()
            .filter(|a| a.name == name)
            .map(|a| a.attempt)
            .max()
            .unwrap_or(0)
            + 1;
        let number = self.actions.len();
        self.actions
            .push(Action::new(name, number, action_type, state, attempt, now));
        self.modified = now;
        let index = self.actions.len() - 1;
        &mut self.actions[index]
    }

    /// The live, queued record of `name` at `attempt`.
    ///
    /// # Errors
    ///
    /// [`Error::UnexpectedAction`] when there is no such record, it is no
    /// longer queued, or the attempt does not match. Stale and duplicate
    /// worker events are rejected here.
    pub fn pending_action(
        &mut self,
        did: DeltaFileId,
        name: &str,
        attempt: u32,
    ) -> Result<&mut Action> {
        let flow_name = self.name.clone();
        let Some(index) = self.latest_action_index(name) else {
            return Err(Error::unexpected_action(
                did,
                flow_name,
                name,
                "no record of this action",
            ));
        };
        let action = &mut self.actions[index];
        if !action.is_queued() {
            return Err(Error::unexpected_action(
                did,
                flow_name,
                name,
                format!("action is {}", action.state),
            ));
        }
        if action.attempt != attempt {
            return Err(Error::unexpected_action(
                did,
                flow_name,
                name,
                format!("attempt {attempt} does not match current attempt {}", action.attempt),
            ));
        }
        Ok(action)
    }

    // -- State derivation ----------------------------------------------------

    /// Recompute the flow state from the last action.
    pub fn update_state(&mut self, now: DateTime<Utc>) {
        self.cold_queued = self
            .actions
            .iter()
            .any(|a| a.state == ActionState::ColdQueued);

        let Some(last) = self.actions.last() else {
            self.state = FlowState::Complete;
            self.modified = now;
            return;
        };

        self.error_or_filter_cause = match last.state {
            ActionState::Error => last.error_cause.clone(),
            ActionState::Filtered => last.filtered_cause.clone(),
            _ => None,
        };
        self.next_auto_resume = match last.state {
            ActionState::Error => last.next_auto_resume,
            _ => None,
        };

        self.state = match last.state {
            ActionState::Error => FlowState::Error,
            ActionState::Cancelled => FlowState::Cancelled,
            ActionState::Complete if !self.pending_annotations.is_empty() => {
                FlowState::PendingAnnotations
            }
            ActionState::Complete
            | ActionState::Collected
            | ActionState::Filtered
            | ActionState::Split => FlowState::Complete,
            _ => FlowState::InFlight,
        };
        self.modified = now;
    }

    /// Cancel every unfinished action and the flow itself.
    ///
    /// Only IN_FLIGHT and ERROR flows can be cancelled; anything else is
    /// left alone and `false` is returned.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if !matches!(self.state, FlowState::InFlight | FlowState::Error) {
            return false;
        }
        for action in &mut self.actions {
            action.cancel(now);
        }
        self.state = FlowState::Cancelled;
        self.cold_queued = false;
        self.next_auto_resume = None;
        self.modified = now;
        true
    }

    /// Retry the errored last action. Returns its name when resumed.
    pub fn resume(&mut self, resume_metadata: &[ResumeMetadata], now: DateTime<Utc>) -> Option<String> {
        let flow_name = self.name.clone();
        let last = self.actions.last_mut()?;
        if last.state != ActionState::Error {
            return None;
        }
        last.retry(resume_metadata, &flow_name, now);
        let name = last.name.clone();
        self.update_state(now);
        Some(name)
    }

    pub fn has_unacknowledged_error(&self) -> bool {
        self.actions
            .last()
            .is_some_and(|a| a.state == ActionState::Error && a.error_acknowledged.is_none())
    }

    pub fn acknowledge_error(&mut self, now: DateTime<Utc>, reason: &str) -> bool {
        let acknowledged = self
            .actions
            .last_mut()
            .is_some_and(|a| a.acknowledge_error(now, reason));
        if acknowledged {
            self.update_state(now);
        }
        acknowledged
    }

    pub fn clear_error_acknowledged(&mut self, now: DateTime<Utc>) {
        if let Some(last) = self.actions.last_mut() {
            last.clear_error_acknowledged(now);
        }
    }

    /// Drop satisfied annotation keys; returns whether any were pending.
    pub fn remove_pending_annotations<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a str>,
        now: DateTime<Utc>,
    ) -> bool {
        let before = self.pending_annotations.len();
        for key in keys {
            self.pending_annotations.remove(key);
        }
        let changed = before != self.pending_annotations.len();
        if changed && self.state == FlowState::PendingAnnotations {
            self.update_state(now);
        }
        changed
    }

    // -- Data hand-off -------------------------------------------------------

    /// Content produced by the latest COMPLETE action, else the input.
    pub fn last_content(&self) -> &[Content] {
        self.actions
            .iter()
            .rev()
            .find(|a| a.state == ActionState::Complete)
            .map_or(self.input.content.as_slice(), |a| a.content.as_slice())
    }

    /// Content of the nearest COMPLETE action at or before `index`, else
    /// the input.
    pub fn content_at_or_before(&self, index: usize) -> &[Content] {
        self.actions
            .iter()
            .take(index.saturating_add(1))
            .rev()
            .find(|a| a.state == ActionState::Complete)
            .map_or(self.input.content.as_slice(), |a| a.content.as_slice())
    }

    /// Input metadata with every action's additions and deletions applied
    /// in order.
    pub fn metadata(&self) -> Metadata {
        let mut metadata = self.input.metadata.clone();
        for action in &self.actions {
            metadata.extend(
                action
                    .metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
            for key in &action.delete_metadata_keys {
                metadata.remove(key);
            }
        }
        metadata
    }

    /// Domains attached by completed actions; later ones win by name.
    pub fn domains(&self) -> BTreeMap<String, Domain> {
        self.actions
            .iter()
            .filter(|a| a.state == ActionState::Complete)
            .flat_map(|a| a.domains.iter())
            .map(|d| (d.name.clone(), d.clone()))
            .collect()
    }

    /// Enrichments attached by completed actions; later ones win by name.
    pub fn enrichments(&self) -> BTreeMap<String, Enrichment> {
        self.actions
            .iter()
            .filter(|a| a.state == ActionState::Complete)
            .flat_map(|a| a.enrichments.iter())
            .map(|e| (e.name.clone(), e.clone()))
            .collect()
    }

    /// Every distinct segment this flow references.
    pub fn unique_segments(&self) -> BTreeSet<Segment> {
        self.input
            .content
            .iter()
            .chain(self.actions.iter().flat_map(|a| a.content.iter()))
            .flat_map(|c| c.segments.iter().copied())
            .collect()
    }
}
