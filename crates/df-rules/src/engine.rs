//! The [`TopicRouter`] resolves publish rules against flow subscriptions.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::condition::Subject;
use crate::plan::FlowPlans;
use crate::rule::{DefaultBehavior, PublishRules, Rule};

/// Where a published item goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// Subscriber flow name mapped to the topics it accepted the item on.
    Subscribers {
        topics: Vec<String>,
        flows: BTreeMap<String, BTreeSet<String>>,
    },
    /// Nobody subscribed and the default rule drops the item.
    Filter { topics: Vec<String>, context: String },
    /// Nobody subscribed and the default rule errors the item.
    Error { topics: Vec<String>, context: String },
}

impl Routing {
    /// Topics the publishing flow published on.
    pub fn topics(&self) -> &[String] {
        match self {
            Routing::Subscribers { topics, .. }
            | Routing::Filter { topics, .. }
            | Routing::Error { topics, .. } => topics,
        }
    }
}

#[derive(Debug, Clone)]
struct Subscription {
    flow: String,
    rules: Vec<Rule>,
    include_flows: Option<Vec<String>>,
    exclude_flows: Vec<String>,
}

impl Subscription {
    fn accepts_from(&self, upstream: &str) -> bool {
        !self.exclude_flows.iter().any(|f| f == upstream)
            && self
                .include_flows
                .as_ref()
                .map_or(true, |include| include.iter().any(|f| f == upstream))
    }

    /// Topics out of `published` this subscription accepts the subject on.
    fn matched_topics(&self, published: &[String], subject: &Subject<'_>) -> BTreeSet<String> {
        self.rules
            .iter()
            .filter(|rule| published.contains(&rule.topic) && rule.matches(subject))
            .map(|rule| rule.topic.clone())
            .collect()
    }
}

/// Index from topic to the enabled flows subscribed to it.
#[derive(Debug, Clone, Default)]
pub struct TopicRouter {
    by_topic: BTreeMap<String, Vec<Subscription>>,
}

impl TopicRouter {
    pub fn new(plans: &FlowPlans) -> Self {
        let mut by_topic: BTreeMap<String, Vec<Subscription>> = BTreeMap::new();
        for plan in plans.plans.iter().filter(|p| p.enabled) {
            let subscription = Subscription {
                flow: plan.name.clone(),
                rules: plan.subscribe.clone(),
                include_flows: plan.include_flows.clone(),
                exclude_flows: plan.exclude_flows.clone(),
            };
            let topics: BTreeSet<&str> = plan.subscribe.iter().map(|r| r.topic.as_str()).collect();
            for topic in topics {
                by_topic
                    .entry(topic.to_string())
                    .or_default()
                    .push(subscription.clone());
            }
        }
        Self { by_topic }
    }

    /// Every topic with at least one subscriber.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.by_topic.keys().map(String::as_str)
    }

    /// Subscriber flows accepting `subject` from `upstream` on any of `topics`.
    pub fn subscribers(
        &self,
        topics: &[String],
        subject: &Subject<'_>,
        upstream: &str,
    ) -> BTreeMap<String, BTreeSet<String>> {
        let mut flows = BTreeMap::new();
        for subscription in topics
            .iter()
            .filter_map(|topic| self.by_topic.get(topic))
            .flatten()
        {
            if flows.contains_key(&subscription.flow) || !subscription.accepts_from(upstream) {
                continue;
            }
            let matched = subscription.matched_topics(topics, subject);
            if !matched.is_empty() {
                flows.insert(subscription.flow.clone(), matched);
            }
        }
        flows
    }

    /// Apply `rules` for the flow `upstream` publishing `subject`.
    pub fn route(&self, rules: &PublishRules, subject: &Subject<'_>, upstream: &str) -> Routing {
        let topics: Vec<String> = rules
            .matching_topics(subject)
            .into_iter()
            .map(str::to_string)
            .collect();
        let flows = self.subscribers(&topics, subject, upstream);
        if !flows.is_empty() {
            debug!(flow = upstream, ?topics, subscribers = flows.len(), "Routed by publish rules");
            return Routing::Subscribers { topics, flows };
        }

        let default_rule = &rules.default_rule;
        let mut behavior = default_rule.behavior;
        if behavior == DefaultBehavior::Publish {
            if let Some(topic) = &default_rule.topic {
                let default_topics = vec![topic.clone()];
                let flows = self.subscribers(&default_topics, subject, upstream);
                if !flows.is_empty() {
                    debug!(flow = upstream, topic = %topic, "Routed by default rule");
                    return Routing::Subscribers {
                        topics: default_topics,
                        flows,
                    };
                }
            }
            behavior = DefaultBehavior::Error;
        }

        let mut context = format!("No subscribers found from flow '{upstream}' ");
        if topics.is_empty() {
            context.push_str("because no topics matched the criteria.");
        } else {
            context.push_str("listening on matching topics: ");
            context.push_str(&topics.join(", "));
        }

        match behavior {
            DefaultBehavior::Filter => Routing::Filter { topics, context },
            _ => Routing::Error { topics, context },
        }
    }
}
