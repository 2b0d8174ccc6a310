//! Inbound events reported by action workers.
//!
//! Every worker result is an [`ActionEvent`] whose [`Outcome`] is a closed
//! sum type. The service matches it exhaustively; an outcome that does not
//! fit the action it targets is rejected before anything is applied.

use chrono::{DateTime, Utc};
use df_content::Content;
use df_core::{DeltaFileId, Error, Result};
use df_model::{ActionType, Domain, Enrichment, Metadata};
use serde::{Deserialize, Serialize};

/// One worker-reported result for one action attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEvent {
    pub did: DeltaFileId,
    pub flow_id: u32,
    pub action_name: String,
    pub attempt: u32,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub outcome: Outcome,
}

/// New content plus metadata changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformOutcome {
    #[serde(default)]
    pub content: Vec<Content>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub delete_metadata_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadOutcome {
    #[serde(default)]
    pub content: Vec<Content>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub delete_metadata_keys: Vec<String>,
    #[serde(default)]
    pub domains: Vec<Domain>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainOutcome {
    #[serde(default)]
    pub domains: Vec<Domain>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichOutcome {
    #[serde(default)]
    pub enrichments: Vec<Enrichment>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatOutcome {
    pub content: Vec<Content>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressOutcome {
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub bytes_egressed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorOutcome {
    pub cause: String,
    #[serde(default)]
    pub context: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterOutcome {
    pub cause: String,
    #[serde(default)]
    pub context: Option<String>,
}

/// One item produced by a split (reinject).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitChild {
    pub name: String,
    #[serde(default)]
    pub content: Vec<Content>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitOutcome {
    pub children: Vec<SplitChild>,
}

/// What the worker did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Transform(TransformOutcome),
    Load(LoadOutcome),
    Domain(DomainOutcome),
    Enrich(EnrichOutcome),
    Format(FormatOutcome),
    Validate,
    Egress(EgressOutcome),
    Error(ErrorOutcome),
    Filter(FilterOutcome),
    Split(SplitOutcome),
    Join(TransformOutcome),
}

impl Outcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Transform(_) => "TRANSFORM",
            Outcome::Load(_) => "LOAD",
            Outcome::Domain(_) => "DOMAIN",
            Outcome::Enrich(_) => "ENRICH",
            Outcome::Format(_) => "FORMAT",
            Outcome::Validate => "VALIDATE",
            Outcome::Egress(_) => "EGRESS",
            Outcome::Error(_) => "ERROR",
            Outcome::Filter(_) => "FILTER",
            Outcome::Split(_) => "SPLIT",
            Outcome::Join(_) => "JOIN",
        }
    }

    /// Whether an action of `action_type` may report this outcome.
    pub fn fits(&self, action_type: ActionType) -> bool {
        match self {
            Outcome::Error(_) | Outcome::Filter(_) => true,
            Outcome::Transform(_) => action_type == ActionType::Transform,
            Outcome::Load(_) => action_type == ActionType::Load,
            Outcome::Domain(_) => action_type == ActionType::Domain,
            Outcome::Enrich(_) => action_type == ActionType::Enrich,
            Outcome::Format(_) => action_type == ActionType::Format,
            Outcome::Validate => action_type == ActionType::Validate,
            Outcome::Egress(_) => action_type == ActionType::Egress,
            Outcome::Split(_) => matches!(action_type, ActionType::Transform | ActionType::Load),
            Outcome::Join(_) => action_type == ActionType::Join,
        }
    }
}

impl ActionEvent {
    /// Reject events that are malformed or do not fit `action_type`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidEvent`] describing the first problem found.
    pub fn validate(&self, action_type: ActionType) -> Result<()> {
        let invalid = |message: String| Err(Error::invalid_event(&self.action_name, message));

        if !self.outcome.fits(action_type) {
            return invalid(format!(
                "{} outcome is not valid for a {action_type:?} action",
                self.outcome.kind()
            ));
        }
        if self.stop < self.start {
            return invalid("stop time precedes start time".into());
        }

        match &self.outcome {
            Outcome::Error(e) if e.cause.trim().is_empty() => {
                invalid("error outcome must carry a cause".into())
            }
            Outcome::Filter(f) if f.cause.trim().is_empty() => {
                invalid("filter outcome must carry a cause".into())
            }
            Outcome::Split(s) if s.children.is_empty() => {
                invalid("split outcome must carry at least one child".into())
            }
            Outcome::Split(s) if s.children.iter().any(|c| c.name.trim().is_empty()) => {
                invalid("split children must be named".into())
            }
            Outcome::Format(f) if f.content.is_empty() => {
                invalid("format outcome must carry content".into())
            }
            Outcome::Domain(d) if d.domains.iter().any(|d| d.name.trim().is_empty()) => {
                invalid("domains must be named".into())
            }
            Outcome::Load(l) if l.domains.iter().any(|d| d.name.trim().is_empty()) => {
                invalid("domains must be named".into())
            }
            Outcome::Enrich(e) if e.enrichments.iter().any(|e| e.name.trim().is_empty()) => {
                invalid("enrichments must be named".into())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn make_test_event(outcome: Outcome) -> ActionEvent {
        let now = Utc::now();
        ActionEvent {
            did: DeltaFileId::new(),
            flow_id: 1,
            action_name: "transform".into(),
            attempt: 1,
            start: now,
            stop: now,
            outcome,
        }
    }

    #[test]
    fn outcome_must_match_action_type() {
        let event = make_test_event(Outcome::Transform(TransformOutcome::default()));
        assert!(event.validate(ActionType::Transform).is_ok());
        assert_matches!(
            event.validate(ActionType::Load),
            Err(Error::InvalidEvent { message, .. }) if message.contains("TRANSFORM outcome")
        );
    }

    #[test]
    fn error_and_filter_fit_any_action() {
        let error = make_test_event(Outcome::Error(ErrorOutcome {
            cause: "boom".into(),
            context: String::new(),
        }));
        let filter = make_test_event(Outcome::Filter(FilterOutcome {
            cause: "dup".into(),
            context: None,
        }));
        for action_type in [ActionType::Transform, ActionType::Egress, ActionType::Join] {
            assert!(error.validate(action_type).is_ok());
            assert!(filter.validate(action_type).is_ok());
        }
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let empty_cause = make_test_event(Outcome::Error(ErrorOutcome::default()));
        assert!(empty_cause.validate(ActionType::Transform).is_err());

        let no_children = make_test_event(Outcome::Split(SplitOutcome::default()));
        assert!(no_children.validate(ActionType::Transform).is_err());

        let no_content = make_test_event(Outcome::Format(FormatOutcome::default()));
        assert!(no_content.validate(ActionType::Format).is_err());

        let mut backwards = make_test_event(Outcome::Validate);
        backwards.stop = backwards.start - chrono::Duration::seconds(1);
        assert!(backwards.validate(ActionType::Validate).is_err());
    }

    #[test]
    fn wire_shape() {
        let event = make_test_event(Outcome::Error(ErrorOutcome {
            cause: "boom".into(),
            context: "trace".into(),
        }));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["outcome"]["type"], "ERROR");
        assert_eq!(json["outcome"]["payload"]["cause"], "boom");
        assert_eq!(json["actionName"], "transform");

        let validate: Outcome = serde_json::from_str(r#"{"type": "VALIDATE"}"#).unwrap();
        assert_eq!(validate, Outcome::Validate);
    }
}
