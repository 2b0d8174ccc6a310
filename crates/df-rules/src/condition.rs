//! Leaf conditions that evaluate against an item's metadata and content.
//!
//! Each [`Condition`] variant checks a single aspect of the data a flow is
//! about to publish. Conditions are composed into expression trees via
//! [`Expr`](crate::Expr).

use df_content::Content;
use df_model::{DeltaFileFlow, Metadata};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// What conditions are evaluated against.
#[derive(Debug, Clone)]
pub struct Subject<'a> {
    pub metadata: Metadata,
    pub content: &'a [Content],
}

impl<'a> Subject<'a> {
    pub fn new(metadata: Metadata, content: &'a [Content]) -> Self {
        Self { metadata, content }
    }

    /// The metadata and content a flow currently hands downstream.
    pub fn of_flow(flow: &'a DeltaFileFlow) -> Self {
        Self::new(flow.metadata(), flow.last_content())
    }
}

/// A leaf condition over one property of a [`Subject`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Condition {
    /// Matches if the metadata key holds exactly this value.
    MetadataEquals { key: String, value: String },
    /// Matches if the metadata key holds one of these values.
    MetadataIn { key: String, values: Vec<String> },
    /// Matches if the metadata key is present at all.
    MetadataExists(String),
    /// Matches if the metadata key's value matches the regex.
    MetadataMatches { key: String, pattern: String },
    /// Matches if any content has one of these media types. A trailing
    /// `/*` matches a whole family (e.g. `text/*`).
    MediaType(Vec<String>),
    /// Matches if any content name matches the regex.
    ContentName(String),
    /// Matches if total content size is at least this many bytes.
    MinSize(u64),
    /// Matches if total content size is at most this many bytes.
    MaxSize(u64),
}

impl Condition {
    /// Evaluate this condition against the given subject.
    ///
    /// A pattern that does not compile never matches; [`Condition::validate`]
    /// reports it at configuration time.
    pub fn evaluate(&self, subject: &Subject<'_>) -> bool {
        match self {
            Condition::MetadataEquals { key, value } => {
                subject.metadata.get(key).is_some_and(|v| v == value)
            }
            Condition::MetadataIn { key, values } => subject
                .metadata
                .get(key)
                .is_some_and(|v| values.iter().any(|candidate| candidate == v)),
            Condition::MetadataExists(key) => subject.metadata.contains_key(key),
            Condition::MetadataMatches { key, pattern } => {
                match (subject.metadata.get(key), Regex::new(pattern)) {
                    (Some(value), Ok(re)) => re.is_match(value),
                    _ => false,
                }
            }
            Condition::MediaType(types) => subject
                .content
                .iter()
                .any(|c| types.iter().any(|t| media_type_matches(t, &c.media_type))),
            Condition::ContentName(pattern) => match Regex::new(pattern) {
                Ok(re) => subject.content.iter().any(|c| re.is_match(&c.name)),
                Err(_) => false,
            },
            Condition::MinSize(min) => total_size(subject) >= *min,
            Condition::MaxSize(max) => total_size(subject) <= *max,
        }
    }

    /// Check patterns compile.
    pub fn validate(&self) -> Result<(), String> {
        let pattern = match self {
            Condition::MetadataMatches { pattern, .. } | Condition::ContentName(pattern) => pattern,
            _ => return Ok(()),
        };
        Regex::new(pattern)
            .map(|_| ())
            .map_err(|e| format!("invalid pattern '{pattern}': {e}"))
    }
}

fn total_size(subject: &Subject<'_>) -> u64 {
    subject.content.iter().map(Content::size).sum()
}

fn media_type_matches(wanted: &str, actual: &str) -> bool {
    match wanted.strip_suffix("/*") {
        Some(family) => actual
            .split_once('/')
            .is_some_and(|(actual_family, _)| actual_family.eq_ignore_ascii_case(family)),
        None => wanted.eq_ignore_ascii_case(actual),
    }
}
