//! Topic rules: what a flow publishes to and what it subscribes to.

use serde::{Deserialize, Serialize};

use crate::condition::Subject;
use crate::expr::{self, Expr};

/// A topic guarded by an optional condition.
///
/// Used both for publishing (send to `topic` when the condition holds) and
/// for subscribing (accept from `topic` when the condition holds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub topic: String,
    /// Absent means the rule always matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Expr>,
}

impl Rule {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            condition: None,
        }
    }

    pub fn when(topic: impl Into<String>, condition: impl Into<Expr>) -> Self {
        Self {
            topic: topic.into(),
            condition: Some(condition.into()),
        }
    }

    pub fn matches(&self, subject: &Subject<'_>) -> bool {
        self.condition
            .as_ref()
            .map_or(true, |condition| expr::evaluate(condition, subject))
    }
}

/// How many publish rules may fire for one item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchingPolicy {
    /// Every matching rule contributes its topic.
    #[default]
    AllMatching,
    /// Only the first matching rule (in declaration order) fires.
    FirstMatching,
}

/// What happens when no rule produces a subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultBehavior {
    #[default]
    Error,
    Filter,
    Publish,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultRule {
    #[serde(default)]
    pub behavior: DefaultBehavior,
    /// Topic used by [`DefaultBehavior::Publish`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

/// Publish configuration of a data source or transform flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishRules {
    #[serde(default)]
    pub matching_policy: MatchingPolicy,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub default_rule: DefaultRule,
}

impl PublishRules {
    /// Unconditionally publish to a single topic.
    pub fn to_topic(topic: impl Into<String>) -> Self {
        Self {
            rules: vec![Rule::new(topic)],
            ..Default::default()
        }
    }

    /// Topics whose rules match `subject`, honouring the matching policy.
    pub fn matching_topics(&self, subject: &Subject<'_>) -> Vec<&str> {
        let mut matching = self.rules.iter().filter(|rule| rule.matches(subject));
        match self.matching_policy {
            MatchingPolicy::AllMatching => matching.map(|rule| rule.topic.as_str()).collect(),
            MatchingPolicy::FirstMatching => {
                matching.next().map(|rule| rule.topic.as_str()).into_iter().collect()
            }
        }
    }

    /// Problems that make these rules unusable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for rule in &self.rules {
            if rule.topic.trim().is_empty() {
                errors.push("publish rule has an empty topic".to_string());
            }
            if let Some(Err(e)) = rule.condition.as_ref().map(Expr::validate) {
                errors.push(format!("publish rule for topic '{}': {e}", rule.topic));
            }
        }
        if self.default_rule.behavior == DefaultBehavior::Publish
            && self.default_rule.topic.as_deref().map_or(true, str::is_empty)
        {
            errors.push("default rule PUBLISH requires a topic".to_string());
        }
        errors
    }
}
