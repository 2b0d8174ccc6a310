//! One configured action of a flow plan and the requirements that gate it.

use std::collections::BTreeMap;

use df_model::{ActionType, Domain, Enrichment, Metadata, MATCHES_ANY};
use serde::{Deserialize, Serialize};

/// A single action in a flow plan.
///
/// Requirements are optional and only legal on the action types that can
/// consume them; [`ActionConfiguration::validate`] enforces that per type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfiguration {
    pub name: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    /// Queue the action's workers consume from.
    pub action_class: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub parameters: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_enrichments: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub required_metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinConfiguration>,
}

impl ActionConfiguration {
    pub fn new(
        name: impl Into<String>,
        action_type: ActionType,
        action_class: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            action_type,
            action_class: action_class.into(),
            parameters: serde_json::Value::Null,
            required_domains: Vec::new(),
            required_enrichments: Vec::new(),
            required_metadata: Metadata::new(),
            join: None,
        }
    }

    /// Configuration problems, each prefixed with the action name.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut push = |msg: String| errors.push(format!("action '{}': {msg}", self.name));

        if self.name.trim().is_empty() {
            push("name must not be empty".into());
        }
        if self.action_class.trim().is_empty() {
            push("action_class must not be empty".into());
        }

        match self.action_type {
            ActionType::Ingress | ActionType::TimedIngress | ActionType::Publish => {
                push(format!("type {:?} cannot be configured in a flow", self.action_type));
            }
            ActionType::Join => match &self.join {
                Some(join) => {
                    for e in join.validate() {
                        push(e);
                    }
                }
                None => push("JOIN action requires a join configuration".into()),
            },
            _ => {
                if self.join.is_some() {
                    push("join configuration is only allowed on JOIN actions".into());
                }
            }
        }

        let takes_domains = matches!(
            self.action_type,
            ActionType::Domain | ActionType::Enrich | ActionType::Format | ActionType::Validate
        );
        let takes_enrichments = matches!(
            self.action_type,
            ActionType::Enrich | ActionType::Format | ActionType::Validate
        );
        if !self.required_domains.is_empty() && !takes_domains {
            push(format!("type {:?} cannot require domains", self.action_type));
        }
        if !self.required_enrichments.is_empty() && !takes_enrichments {
            push(format!("type {:?} cannot require enrichments", self.action_type));
        }
        if self.action_type == ActionType::Enrich && self.required_domains.is_empty() {
            push("ENRICH action must require at least one domain".into());
        }
        errors
    }

    /// Whether the item's current data satisfies every requirement.
    ///
    /// `latest_metadata` is the flow's folded metadata and `source_metadata`
    /// the metadata the item was ingested with; required metadata passes if
    /// either one holds every key/value pair.
    pub fn requirements_met(
        &self,
        domains: &BTreeMap<String, Domain>,
        enrichments: &BTreeMap<String, Enrichment>,
        latest_metadata: &Metadata,
        source_metadata: &Metadata,
    ) -> bool {
        names_present(&self.required_domains, domains)
            && names_present(&self.required_enrichments, enrichments)
            && (self.required_metadata.is_empty()
                || contains_all(latest_metadata, &self.required_metadata)
                || contains_all(source_metadata, &self.required_metadata))
    }
}

fn names_present<T>(required: &[String], present: &BTreeMap<String, T>) -> bool {
    required.iter().all(|name| {
        if name == MATCHES_ANY {
            !present.is_empty()
        } else {
            present.contains_key(name)
        }
    })
}

fn contains_all(metadata: &Metadata, required: &Metadata) -> bool {
    required
        .iter()
        .all(|(key, value)| metadata.get(key) == Some(value))
}

// ---------------------------------------------------------------------------
// JoinConfiguration
// ---------------------------------------------------------------------------

/// Accumulation settings of a JOIN action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinConfiguration {
    /// Longest time a group may wait after its first member arrived.
    pub max_age_secs: u64,
    /// Fewest members a group must reach to be released on timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_num: Option<u32>,
    /// Group size that releases immediately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_num: Option<u32>,
    /// Metadata key whose value selects the group; the flow name otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_key: Option<String>,
}

impl JoinConfiguration {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.max_age_secs == 0 {
            errors.push("join max_age_secs must be greater than 0".to_string());
        }
        if self.min_num == Some(0) {
            errors.push("join min_num must be at least 1".to_string());
        }
        if self.max_num == Some(0) {
            errors.push("join max_num must be at least 1".to_string());
        }
        if let (Some(min), Some(max)) = (self.min_num, self.max_num) {
            if max < min {
                errors.push(format!("join max_num ({max}) must be >= min_num ({min})"));
            }
        }
        errors
    }

    pub fn max_age(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.max_age_secs)
    }

    /// Group members required before a timeout releases the group.
    pub fn min_members(&self) -> usize {
        self.min_num.unwrap_or(1) as usize
    }
}
