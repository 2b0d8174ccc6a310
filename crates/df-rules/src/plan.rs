//! Flow plans: the declarative configuration the router reads.
//!
//! A [`FlowPlans`] document lists every data source, transform and data sink
//! flow. It is loaded once at startup (JSON or TOML) and validated as a whole
//! before any flow is activated; the router only ever reads it.

use std::collections::BTreeSet;
use std::path::Path;

use df_core::{Error, Result};
use df_model::{ActionType, FlowType};
use serde::{Deserialize, Serialize};

use crate::action_config::ActionConfiguration;
use crate::rule::{PublishRules, Rule};

/// One configured flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowPlan {
    pub name: String,
    #[serde(rename = "type")]
    pub flow_type: FlowType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Test-mode flows never dispatch egress actions.
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscribe: Vec<Rule>,
    /// Only accept items published by these flows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_flows: Option<Vec<String>>,
    /// Never accept items published by these flows.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_flows: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishRules>,
    #[serde(default)]
    pub actions: Vec<ActionConfiguration>,
    /// Annotation keys a data sink waits for after egress.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub expected_annotations: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl FlowPlan {
    pub fn new(name: impl Into<String>, flow_type: FlowType) -> Self {
        Self {
            name: name.into(),
            flow_type,
            enabled: true,
            test_mode: false,
            subscribe: Vec::new(),
            include_flows: None,
            exclude_flows: Vec::new(),
            publish: None,
            actions: Vec::new(),
            expected_annotations: BTreeSet::new(),
            description: None,
        }
    }

    pub fn action(&self, name: &str) -> Option<&ActionConfiguration> {
        self.actions.iter().find(|a| a.name == name)
    }

    fn validate(&self, known_flows: &BTreeSet<&str>) -> Vec<String> {
        let mut errors = Vec::new();
        let mut push = |msg: String| errors.push(format!("flow '{}': {msg}", self.name));

        if self.name.trim().is_empty() {
            push("name must not be empty".into());
        }

        let is_source = self.flow_type.is_data_source();
        match self.flow_type {
            FlowType::DataSink => {
                if self.publish.is_some() {
                    push("data sinks cannot have publish rules".into());
                }
                let egress_count = self
                    .actions
                    .iter()
                    .filter(|a| a.action_type == ActionType::Egress)
                    .count();
                if egress_count != 1 {
                    push(format!("data sinks need exactly one EGRESS action, found {egress_count}"));
                } else if self.actions.last().map(|a| a.action_type) != Some(ActionType::Egress) {
                    push("the EGRESS action must be the last action".into());
                }
            }
            _ => {
                match &self.publish {
                    Some(publish) => {
                        for e in publish.validate() {
                            push(e);
                        }
                    }
                    None => push("missing publish rules".into()),
                }
                if self.actions.iter().any(|a| a.action_type == ActionType::Egress) {
                    push("EGRESS actions are only allowed in data sinks".into());
                }
                if !self.expected_annotations.is_empty() {
                    push("expected annotations are only allowed on data sinks".into());
                }
            }
        }

        if is_source {
            if !self.subscribe.is_empty() {
                push("data sources cannot subscribe to topics".into());
            }
        } else {
            if self.subscribe.is_empty() {
                push("must subscribe to at least one topic".into());
            }
            if self.actions.is_empty() {
                push("must have at least one action".into());
            }
        }

        for rule in &self.subscribe {
            if rule.topic.trim().is_empty() {
                push("subscription has an empty topic".into());
            }
            if let Some(Err(e)) = rule.condition.as_ref().map(|c| c.validate()) {
                push(format!("subscription to '{}': {e}", rule.topic));
            }
        }

        let referenced = self
            .include_flows
            .iter()
            .flatten()
            .chain(self.exclude_flows.iter());
        for flow in referenced {
            if !known_flows.contains(flow.as_str()) {
                push(format!("references unknown flow '{flow}'"));
            }
        }

        let mut action_names = BTreeSet::new();
        for action in &self.actions {
            if !action_names.insert(action.name.as_str()) {
                push(format!("duplicate action name '{}'", action.name));
            }
            for e in action.validate() {
                push(e);
            }
        }
        errors
    }
}

// ---------------------------------------------------------------------------
// FlowPlans
// ---------------------------------------------------------------------------

/// The complete set of configured flows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowPlans {
    #[serde(default)]
    pub plans: Vec<FlowPlan>,
}

impl FlowPlans {
    pub fn new(plans: Vec<FlowPlan>) -> Self {
        Self { plans }
    }

    pub fn by_name(&self, name: &str) -> Option<&FlowPlan> {
        self.plans.iter().find(|p| p.name == name)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Configuration(format!("flow plan parse error: {e}")))
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| Error::Configuration(format!("flow plan parse error: {e}")))
    }

    /// Read plans from a `.toml` or `.json` file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let plans = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&contents)?,
            _ => Self::from_json(&contents)?,
        };
        tracing::info!(path = %path.display(), flows = plans.plans.len(), "Loaded flow plans");
        Ok(plans)
    }

    /// Check the whole document, reporting every problem at once.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] listing each problem on its own line.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        let mut names = BTreeSet::new();
        for plan in &self.plans {
            if !names.insert(plan.name.as_str()) {
                errors.push(format!("duplicate flow name '{}'", plan.name));
            }
        }
        for plan in &self.plans {
            errors.extend(plan.validate(&names));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Configuration(errors.join("\n")))
        }
    }
}
