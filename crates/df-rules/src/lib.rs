//! # df-rules
//!
//! Declarative flow configuration and the rules that route items between
//! flows.
//!
//! ## Overview
//!
//! - [`Condition`] -- leaf tests over an item's metadata and content.
//! - [`Expr`] -- expression tree combining conditions with AND/OR/NOT.
//! - [`Rule`] / [`PublishRules`] -- topic routing with a matching policy and
//!   a default rule.
//! - [`ActionConfiguration`] / [`JoinConfiguration`] -- one configured action
//!   and its requirements.
//! - [`FlowPlan`] / [`FlowPlans`] -- the validated set of flows the router
//!   reads.
//! - [`TopicRouter`] -- resolves publish rules against subscriptions.

pub mod action_config;
pub mod condition;
pub mod engine;
pub mod expr;
pub mod plan;
pub mod rule;

pub use action_config::{ActionConfiguration, JoinConfiguration};
pub use condition::{Condition, Subject};
pub use engine::{Routing, TopicRouter};
pub use expr::{evaluate, Expr};
pub use plan::{FlowPlan, FlowPlans};
pub use rule::{DefaultBehavior, DefaultRule, MatchingPolicy, PublishRules, Rule};

/// Serialize flow plans to a pretty-printed JSON string.
///
/// Keeps serde monomorphization for the recursive [`Expr`] inside this
/// crate.
pub fn serialize_plans_pretty(plans: &FlowPlans) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(plans)
}

/// Deserialize flow plans from a JSON string.
pub fn deserialize_plans(json: &str) -> Result<FlowPlans, serde_json::Error> {
    serde_json::from_str(json)
}
