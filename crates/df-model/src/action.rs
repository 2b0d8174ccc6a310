//! One attempt of one named action.
//!
//! Actions are only ever appended to a flow. A retry marks the failed attempt
//! RETRIED and a fresh attempt is appended, so the history of every attempt
//! stays on the item.

use chrono::{DateTime, Utc};
use df_content::Content;
use df_core::DeltaFileId;
use serde::{Deserialize, Serialize};

use crate::types::{Domain, Enrichment, Metadata, ResumeMetadata};

/// Longest error or filter cause kept on an action, in bytes.
pub const MAX_CAUSE_SIZE: usize = 100_000;

// ---------------------------------------------------------------------------
// ActionType / ActionState
// ---------------------------------------------------------------------------

/// Kind of processing an action performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Ingress,
    TimedIngress,
    Transform,
    Load,
    Domain,
    Enrich,
    Format,
    Validate,
    Egress,
    Join,
    /// Synthetic actions recorded by the router while publishing.
    Publish,
}

impl ActionType {
    /// Types whose completion may replace the flow's content and metadata.
    pub fn amends_data(self) -> bool {
        matches!(
            self,
            ActionType::Ingress
                | ActionType::TimedIngress
                | ActionType::Transform
                | ActionType::Load
                | ActionType::Join
        )
    }
}

/// Lifecycle state of one action attempt.
///
/// RUNNING is implicit: a dispatched action stays QUEUED until its worker
/// reports an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionState {
    Queued,
    ColdQueued,
    Complete,
    Error,
    Filtered,
    Split,
    Retried,
    Cancelled,
    Collecting,
    ReadyToCollect,
    Collected,
}

impl ActionState {
    pub fn is_queued(self) -> bool {
        matches!(self, ActionState::Queued | ActionState::ColdQueued)
    }

    /// Not waiting on a worker and not waiting on a join.
    pub fn is_terminal(self) -> bool {
        !self.is_queued()
            && !matches!(self, ActionState::ReadyToCollect | ActionState::Collecting)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionState::Queued => "QUEUED",
            ActionState::ColdQueued => "COLD_QUEUED",
            ActionState::Complete => "COMPLETE",
            ActionState::Error => "ERROR",
            ActionState::Filtered => "FILTERED",
            ActionState::Split => "SPLIT",
            ActionState::Retried => "RETRIED",
            ActionState::Cancelled => "CANCELLED",
            ActionState::Collecting => "COLLECTING",
            ActionState::ReadyToCollect => "READY_TO_COLLECT",
            ActionState::Collected => "COLLECTED",
        }
    }
}

impl std::fmt::Display for ActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// One attempt of one named action within a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub name: String,
    /// Position of this record in the flow's action list.
    pub number: usize,
    pub action_type: ActionType,
    pub state: ActionState,
    pub created: DateTime<Utc>,
    pub queued: Option<DateTime<Utc>>,
    pub start: Option<DateTime<Utc>>,
    pub stop: Option<DateTime<Utc>>,
    pub modified: DateTime<Utc>,
    pub attempt: u32,
    pub error_cause: Option<String>,
    pub error_context: Option<String>,
    pub error_acknowledged: Option<DateTime<Utc>>,
    pub error_acknowledged_reason: Option<String>,
    pub next_auto_resume: Option<DateTime<Utc>>,
    pub next_auto_resume_reason: Option<String>,
    pub filtered_cause: Option<String>,
    pub filtered_context: Option<String>,
    /// Aggregate this join member was released into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_id: Option<DeltaFileId>,
    #[serde(default)]
    pub content: Vec<Content>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub delete_metadata_keys: Vec<String>,
    #[serde(default)]
    pub domains: Vec<Domain>,
    #[serde(default)]
    pub enrichments: Vec<Enrichment>,
}

impl Action {
    pub fn new(
        name: impl Into<String>,
        number: usize,
        action_type: ActionType,
        state: ActionState,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            number,
            action_type,
            state,
            created: now,
            queued: state.is_queued().then_some(now),
            start: None,
            stop: None,
            modified: now,
            attempt,
            error_cause: None,
            error_context: None,
            error_acknowledged: None,
            error_acknowledged_reason: None,
            next_auto_resume: None,
            next_auto_resume_reason: None,
            filtered_cause: None,
            filtered_context: None,
            join_id: None,
            content: Vec::new(),
            metadata: Metadata::new(),
            delete_metadata_keys: Vec::new(),
            domains: Vec::new(),
            enrichments: Vec::new(),
        }
    }

    pub fn is_queued(&self) -> bool {
        self.state.is_queued()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Terminal in a way that still counts for routing (not superseded).
    pub fn is_final(&self) -> bool {
        self.state != ActionState::Retried && self.is_terminal()
    }

    /// Move to `state`, stamping start/stop/modified.
    pub fn change_state(
        &mut self,
        state: ActionState,
        start: Option<DateTime<Utc>>,
        stop: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        self.state = state;
        if start.is_some() {
            self.start = start;
        }
        if stop.is_some() {
            self.stop = stop;
        }
        self.modified = now;
    }

    /// Put the action (back) on a queue, warm or cold.
    pub fn requeue(&mut self, cold: bool, now: DateTime<Utc>) {
        self.state = if cold {
            ActionState::ColdQueued
        } else {
            ActionState::Queued
        };
        self.queued = Some(now);
        self.modified = now;
    }

    /// Record successful completion. No-op once terminal.
    pub fn complete(
        &mut self,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        content: Vec<Content>,
        metadata: Metadata,
        delete_metadata_keys: Vec<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.change_state(ActionState::Complete, Some(start), Some(stop), now);
        self.content = content;
        self.metadata = metadata;
        self.delete_metadata_keys = delete_metadata_keys;
        true
    }

    /// Record a worker-reported failure. No-op once terminal.
    pub fn error(
        &mut self,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        cause: &str,
        context: &str,
        now: DateTime<Utc>,
    ) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.change_state(ActionState::Error, Some(start), Some(stop), now);
        self.error_cause = Some(truncate_cause(cause));
        self.error_context = Some(context.to_string());
        true
    }

    /// Record an intentional drop. No-op once terminal.
    pub fn filter(
        &mut self,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        cause: &str,
        context: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.change_state(ActionState::Filtered, Some(start), Some(stop), now);
        self.filtered_cause = Some(truncate_cause(cause));
        self.filtered_context = context.map(str::to_string);
        true
    }

    /// Record that the action split its input into children. No-op once
    /// terminal.
    pub fn split(&mut self, start: DateTime<Utc>, stop: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.change_state(ActionState::Split, Some(start), Some(stop), now);
        true
    }

    /// Cancel unless the action already finished some other way.
    ///
    /// Errored actions are cancelled too, so a cancelled item keeps no
    /// resumable errors.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_terminal() && self.state != ActionState::Error {
            return false;
        }
        self.change_state(ActionState::Cancelled, None, None, now);
        true
    }

    /// Supersede this errored attempt, folding in matching resume metadata.
    pub fn retry(&mut self, resume_metadata: &[ResumeMetadata], flow: &str, now: DateTime<Utc>) {
        self.change_state(ActionState::Retried, None, None, now);
        self.error_acknowledged = None;
        self.error_acknowledged_reason = None;
        self.next_auto_resume = None;
        self.next_auto_resume_reason = None;

        for resume in resume_metadata
            .iter()
            .filter(|r| r.action == self.name && r.flow == flow)
        {
            self.metadata
                .extend(resume.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
            self.delete_metadata_keys
                .extend(resume.delete_metadata_keys.iter().cloned());
        }
    }

    pub fn acknowledge_error(&mut self, now: DateTime<Utc>, reason: &str) -> bool {
        if self.state != ActionState::Error {
            return false;
        }
        self.error_acknowledged = Some(now);
        self.error_acknowledged_reason = Some(reason.to_string());
        self.next_auto_resume = None;
        self.next_auto_resume_reason = None;
        self.modified = now;
        true
    }

    pub fn clear_error_acknowledged(&mut self, now: DateTime<Utc>) {
        if self.error_acknowledged.take().is_some() {
            self.error_acknowledged_reason = None;
            self.modified = now;
        }
    }
}

/// Clip `cause` to [`MAX_CAUSE_SIZE`] bytes without splitting a character.
fn truncate_cause(cause: &str) -> String {
    if cause.len() <= MAX_CAUSE_SIZE {
        return cause.to_string();
    }
    let mut end = MAX_CAUSE_SIZE;
    while !cause.is_char_boundary(end) {
        end -= 1;
    }
    cause[..end].to_string()
}
