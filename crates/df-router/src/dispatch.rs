//! Outbound dispatch: the work handed to action workers.

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use df_core::{DeltaFileId, Result};
use df_model::DeltaFileView;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Which attempt of which action an invocation is for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionContext {
    pub did: DeltaFileId,
    pub flow_name: String,
    pub flow_id: u32,
    pub action_name: String,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub joined_dids: Vec<DeltaFileId>,
}

/// One unit of work for an action worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionInvocation {
    /// The action class; workers consume one queue per class.
    pub queue_name: String,
    pub context: ActionContext,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub delta_file: DeltaFileView,
    /// Narrowed views of every joined item, for JOIN actions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub joined: Vec<DeltaFileView>,
}

/// Queue consumed by action workers.
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    async fn enqueue(&self, invocation: ActionInvocation) -> Result<()>;

    /// Number of invocations waiting on `queue_name`.
    async fn len(&self, queue_name: &str) -> Result<usize>;
}

/// Per-class FIFO queues held in memory.
#[derive(Debug, Default)]
pub struct InMemoryDispatchQueue {
    queues: Mutex<BTreeMap<String, VecDeque<ActionInvocation>>>,
}

impl InMemoryDispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the oldest invocation from `queue_name`.
    pub fn pop(&self, queue_name: &str) -> Option<ActionInvocation> {
        self.queues.lock().get_mut(queue_name)?.pop_front()
    }

    /// Take every waiting invocation across all queues, oldest first per queue.
    pub fn drain(&self) -> Vec<ActionInvocation> {
        let mut queues = self.queues.lock();
        queues.values_mut().flat_map(|q| q.drain(..)).collect()
    }

    pub fn total_len(&self) -> usize {
        self.queues.lock().values().map(VecDeque::len).sum()
    }

    /// Names of queues that currently hold work.
    pub fn queue_names(&self) -> Vec<String> {
        self.queues
            .lock()
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[async_trait]
impl DispatchQueue for InMemoryDispatchQueue {
    async fn enqueue(&self, invocation: ActionInvocation) -> Result<()> {
        self.queues
            .lock()
            .entry(invocation.queue_name.clone())
            .or_default()
            .push_back(invocation);
        Ok(())
    }

    async fn len(&self, queue_name: &str) -> Result<usize> {
        Ok(self.queues.lock().get(queue_name).map_or(0, VecDeque::len))
    }
}
