//! The blob-store port.
//!
//! The engine itself never reads payload bytes; actions do. The port lives
//! here so that content produced by actions and the segments referencing it
//! share one definition of "object", and so tests and the CLI simulator have
//! somewhere to put bytes.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use df_core::{Error, ObjectId, Result};

use crate::content::Content;
use crate::segment::Segment;

/// Append-only object storage addressed by [`ObjectId`].
///
/// Stored objects are never modified; new output is always a new object.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `bytes` as a new object and return a segment covering all of it.
    async fn put(&self, bytes: Bytes) -> Result<Segment>;

    /// Read the bytes one segment refers to.
    async fn read_segment(&self, segment: &Segment) -> Result<Bytes>;

    /// Remove whole objects; returns how many existed.
    async fn delete(&self, object_ids: &[ObjectId]) -> Result<usize>;

    /// Read every byte of `content`, in segment order.
    async fn read(&self, content: &Content) -> Result<Bytes> {
        if let [only] = content.segments.as_slice() {
            return self.read_segment(only).await;
        }
        let mut buf = BytesMut::with_capacity(content.size() as usize);
        for segment in &content.segments {
            buf.extend_from_slice(&self.read_segment(segment).await?);
        }
        Ok(buf.freeze())
    }
}

/// In-process [`ContentStore`] backed by a concurrent map.
///
/// Reads are `Bytes::slice`s of the stored object, so sub-references share
/// memory with the original.
#[derive(Debug, Default)]
pub struct InMemoryContentStore {
    objects: DashMap<ObjectId, Bytes>,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn put(&self, bytes: Bytes) -> Result<Segment> {
        let id = ObjectId::new();
        let size = bytes.len() as u64;
        self.objects.insert(id, bytes);
        Ok(Segment::new(id, 0, size))
    }

    async fn read_segment(&self, segment: &Segment) -> Result<Bytes> {
        let object = self
            .objects
            .get(&segment.object_id)
            .ok_or_else(|| Error::not_found("object", segment.object_id))?;
        let len = object.len() as u64;
        if segment.end() > len {
            return Err(Error::InvalidRange {
                offset: segment.offset,
                size: segment.size,
                total: len,
            });
        }
        Ok(object.slice(segment.offset as usize..segment.end() as usize))
    }

    async fn delete(&self, object_ids: &[ObjectId]) -> Result<usize> {
        Ok(object_ids
            .iter()
            .filter(|id| self.objects.remove(id).is_some())
            .count())
    }
}
