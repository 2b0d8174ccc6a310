//! The aggregate root for one ingested item.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use df_core::{DeltaFileId, Error, Result};
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::flow::{DeltaFileFlow, FlowInput, FlowState, FlowType};
use crate::types::ResumeMetadata;
use crate::view::DeltaFileView;

/// Overall progress of an item across all of its flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeltaFileStage {
    InFlight,
    Complete,
    Error,
    Cancelled,
}

impl DeltaFileStage {
    pub fn as_str(self) -> &'static str {
        match self {
            DeltaFileStage::InFlight => "IN_FLIGHT",
            DeltaFileStage::Complete => "COMPLETE",
            DeltaFileStage::Error => "ERROR",
            DeltaFileStage::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for DeltaFileStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ingested item tracked end-to-end.
///
/// `version` is the optimistic-concurrency token: repositories refuse a save
/// whose version does not match what is stored, and bump it on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaFile {
    pub did: DeltaFileId,
    pub name: String,
    pub data_source: String,
    #[serde(default)]
    pub parent_dids: Vec<DeltaFileId>,
    #[serde(default)]
    pub child_dids: Vec<DeltaFileId>,
    /// Accumulation key when this item was built by a join.
    #[serde(default)]
    pub join_key: Option<String>,
    pub stage: DeltaFileStage,
    #[serde(default)]
    pub flows: Vec<DeltaFileFlow>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub ingress_bytes: u64,
    pub referenced_bytes: u64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub egressed: bool,
    pub filtered: bool,
    pub version: u64,
}

impl DeltaFile {
    pub fn new(
        did: DeltaFileId,
        name: impl Into<String>,
        data_source: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            did,
            name: name.into(),
            data_source: data_source.into(),
            parent_dids: Vec::new(),
            child_dids: Vec::new(),
            join_key: None,
            stage: DeltaFileStage::InFlight,
            flows: Vec::new(),
            annotations: BTreeMap::new(),
            ingress_bytes: 0,
            referenced_bytes: 0,
            created: now,
            modified: now,
            egressed: false,
            filtered: false,
            version: 0,
        }
    }

    // -- Flows ---------------------------------------------------------------

    /// Add a flow instance with the next free id.
    pub fn add_flow(
        &mut self,
        name: &str,
        flow_type: FlowType,
        input: FlowInput,
        depth: u32,
        now: DateTime<Utc>,
    ) -> &mut DeltaFileFlow {
        let id = self.flows.iter().map(|f| f.id).max().map_or(0, |max| max + 1);
        self.flows
            .push(DeltaFileFlow::new(name, id, flow_type, input, depth, now));
        self.modified = now;
        let index = self.flows.len() - 1;
        &mut self.flows[index]
    }

    pub fn flow(&self, id: u32) -> Option<&DeltaFileFlow> {
        self.flows.iter().find(|f| f.id == id)
    }

    pub fn flow_mut(&mut self, id: u32) -> Option<&mut DeltaFileFlow> {
        self.flows.iter_mut().find(|f| f.id == id)
    }

    /// Most recently added flow instance of the named plan.
    pub fn flow_named(&self, name: &str) -> Option<&DeltaFileFlow> {
        self.flows.iter().rev().find(|f| f.name == name)
    }

    /// The queued action an inbound event addresses.
    pub fn pending_action(
        &mut self,
        flow_id: u32,
        action: &str,
        attempt: u32,
    ) -> Result<&mut Action> {
        let did = self.did;
        let flow = self.flow_mut(flow_id).ok_or_else(|| {
            Error::unexpected_action(did, flow_id.to_string(), action, "no flow with this id")
        })?;
        flow.pending_action(did, action, attempt)
    }

    // -- Stage ---------------------------------------------------------------

    /// Recompute the stage from the flows; returns whether it changed.
    ///
    /// An errored flow makes the item ERROR even while an auto-resume is
    /// pending; the auto-resume sweep moves it back to IN_FLIGHT.
    pub fn update_stage(&mut self, now: DateTime<Utc>) -> bool {
        let stage = if self.flows.iter().any(|f| f.state == FlowState::Cancelled) {
            DeltaFileStage::Cancelled
        } else if self.flows.iter().any(|f| f.state == FlowState::InFlight) {
            DeltaFileStage::InFlight
        } else if self.flows.iter().any(|f| f.state == FlowState::Error) {
            DeltaFileStage::Error
        } else {
            DeltaFileStage::Complete
        };
        let changed = stage != self.stage;
        self.stage = stage;
        self.modified = now;
        changed
    }

    pub fn is_terminal(&self) -> bool {
        self.stage != DeltaFileStage::InFlight
    }

    /// Cancel every cancellable flow. Returns whether anything changed.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if matches!(
            self.stage,
            DeltaFileStage::Complete | DeltaFileStage::Cancelled
        ) {
            return false;
        }
        let mut cancelled = false;
        for flow in &mut self.flows {
            cancelled |= flow.cancel(now);
        }
        if cancelled {
            self.update_stage(now);
        }
        cancelled
    }

    // -- Errors --------------------------------------------------------------

    /// Retry every errored flow; returns the ids of the flows resumed.
    pub fn resume_errors(&mut self, resume_metadata: &[ResumeMetadata], now: DateTime<Utc>) -> Vec<u32> {
        let mut resumed = Vec::new();
        for flow in &mut self.flows {
            if flow.state == FlowState::Error && flow.resume(resume_metadata, now).is_some() {
                resumed.push(flow.id);
            }
        }
        if !resumed.is_empty() {
            self.update_stage(now);
        }
        resumed
    }

    pub fn has_unacknowledged_error(&self) -> bool {
        self.flows.iter().any(DeltaFileFlow::has_unacknowledged_error)
    }

    /// Acknowledge every error; returns whether any were acknowledged.
    pub fn acknowledge_errors(&mut self, now: DateTime<Utc>, reason: &str) -> bool {
        let mut acknowledged = false;
        for flow in &mut self.flows {
            acknowledged |= flow.acknowledge_error(now, reason);
        }
        if acknowledged {
            self.modified = now;
        }
        acknowledged
    }

    pub fn clear_acknowledged_errors(&mut self, now: DateTime<Utc>) {
        for flow in &mut self.flows {
            flow.clear_error_acknowledged(now);
        }
        self.modified = now;
    }

    /// Earliest pending auto-resume across errored flows.
    pub fn next_auto_resume(&self) -> Option<DateTime<Utc>> {
        self.flows
            .iter()
            .filter(|f| f.state == FlowState::Error)
            .filter_map(|f| f.next_auto_resume)
            .min()
    }

    // -- Annotations ---------------------------------------------------------

    /// Record annotations and release flows waiting on them.
    pub fn annotate(&mut self, annotations: &BTreeMap<String, String>, now: DateTime<Utc>) {
        self.annotations
            .extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        for flow in &mut self.flows {
            flow.remove_pending_annotations(annotations.keys().map(String::as_str), now);
        }
        self.update_stage(now);
    }

    pub fn pending_annotations(&self) -> BTreeSet<&str> {
        self.flows
            .iter()
            .flat_map(|f| f.pending_annotations.iter().map(String::as_str))
            .collect()
    }

    // -- Projections ---------------------------------------------------------

    /// The narrowed view of this item handed to the action that runs next
    /// in `flow_id`.
    pub fn for_queue(&self, flow_id: u32) -> Option<DeltaFileView> {
        let flow = self.flow(flow_id)?;
        Some(DeltaFileView {
            did: self.did,
            name: self.name.clone(),
            data_source: self.data_source.clone(),
            flow_name: flow.name.clone(),
            flow_id: flow.id,
            parent_dids: self.parent_dids.clone(),
            content: flow.last_content().to_vec(),
            metadata: flow.metadata(),
            domains: flow.domains().into_values().collect(),
            enrichments: flow.enrichments().into_values().collect(),
        })
    }

    /// Recount the bytes referenced by all flows.
    pub fn recalculate_bytes(&mut self) {
        let segments: BTreeSet<_> = self.flows.iter().flat_map(|f| f.unique_segments()).collect();
        self.referenced_bytes = segments.iter().map(|s| s.size).sum();
    }
}
