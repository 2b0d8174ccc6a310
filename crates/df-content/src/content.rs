//! Named, typed content built from segments.

use df_core::Result;
use serde::{Deserialize, Serialize};

use crate::segment::{subreference_segments, total_size, Segment};

/// Media type used when a producer does not say otherwise.
pub const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

/// A named payload assembled from one or more [`Segment`]s.
///
/// Two `Content` values are equal when their name, media type, and ordered
/// segment list are equal; there is no separate identity. `clone()` is the
/// structural copy: the segment list is duplicated, the stored bytes are not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub name: String,
    pub media_type: String,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

impl Content {
    pub fn new(name: impl Into<String>, media_type: impl Into<String>, segments: Vec<Segment>) -> Self {
        Self {
            name: name.into(),
            media_type: media_type.into(),
            segments,
        }
    }

    /// Content with no bytes at all.
    pub fn empty(name: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self::new(name, media_type, Vec::new())
    }

    /// Total number of bytes referenced.
    pub fn size(&self) -> u64 {
        total_size(&self.segments)
    }

    /// Segments covering `[offset, offset + size)` of this content.
    pub fn subreference_segments(&self, offset: u64, size: u64) -> Result<Vec<Segment>> {
        subreference_segments(&self.segments, offset, size)
    }

    /// A new content over a byte range of this one, keeping name and type.
    pub fn subcontent(&self, offset: u64, size: u64) -> Result<Content> {
        self.subcontent_as(offset, size, self.name.clone(), self.media_type.clone())
    }

    /// A new content over a byte range of this one, under a new name and type.
    pub fn subcontent_as(
        &self,
        offset: u64,
        size: u64,
        name: impl Into<String>,
        media_type: impl Into<String>,
    ) -> Result<Content> {
        Ok(Content::new(
            name,
            media_type,
            self.subreference_segments(offset, size)?,
        ))
    }

    /// Concatenate several contents into one by chaining their segments.
    pub fn concat<'a>(
        name: impl Into<String>,
        media_type: impl Into<String>,
        parts: impl IntoIterator<Item = &'a Content>,
    ) -> Content {
        let segments = parts
            .into_iter()
            .flat_map(|part| part.segments.iter().copied())
            .collect();
        Content::new(name, media_type, segments)
    }

    /// Add segments in front of the existing ones.
    pub fn prepend_segments(&mut self, segments: &[Segment]) {
        self.segments.splice(0..0, segments.iter().copied());
    }

    /// Add segments after the existing ones.
    pub fn append_segments(&mut self, segments: &[Segment]) {
        self.segments.extend_from_slice(segments);
    }
}
