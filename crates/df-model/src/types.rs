//! Small value types shared by actions, flows, and rules.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Key/value metadata. Ordered so snapshots and projections are stable.
pub type Metadata = BTreeMap<String, String>;

/// Requirement wildcard satisfied by any domain or enrichment.
pub const MATCHES_ANY: &str = "any";

/// Typed side-channel data attached by a load or domain action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Domain {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
}

impl Domain {
    pub fn new(name: impl Into<String>, value: Option<String>, media_type: Option<String>) -> Self {
        Self {
            name: name.into(),
            value,
            media_type,
        }
    }
}

/// Typed side-channel data attached by an enrich action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrichment {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
}

impl Enrichment {
    pub fn new(name: impl Into<String>, value: Option<String>, media_type: Option<String>) -> Self {
        Self {
            name: name.into(),
            value,
            media_type,
        }
    }
}

/// Operator-supplied metadata changes applied when an action is retried.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeMetadata {
    pub flow: String,
    pub action: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub delete_metadata_keys: Vec<String>,
}
