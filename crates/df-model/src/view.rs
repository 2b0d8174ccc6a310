//! The "for-queue" projection of an item.

use df_content::Content;
use df_core::DeltaFileId;
use serde::{Deserialize, Serialize};

use crate::types::{Domain, Enrichment, Metadata};

/// What an action worker sees of an item: the content and metadata in effect
/// for one flow, without the action history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaFileView {
    pub did: DeltaFileId,
    pub name: String,
    pub data_source: String,
    pub flow_name: String,
    pub flow_id: u32,
    #[serde(default)]
    pub parent_dids: Vec<DeltaFileId>,
    #[serde(default)]
    pub content: Vec<Content>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub domains: Vec<Domain>,
    #[serde(default)]
    pub enrichments: Vec<Enrichment>,
}
