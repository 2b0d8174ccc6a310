//! # df-content
//!
//! The content-addressing model: immutable byte-range references into a blob
//! store, and the bookkeeping that lets payloads be sliced, concatenated, and
//! traced through many processing steps without copying bytes.
//!
//! - [`Segment`] -- one byte range of one stored object.
//! - [`Content`] -- a named, typed, ordered list of segments.
//! - [`LineageMap`] -- parent/child provenance for unpacked content.
//! - [`ContentStore`] -- the blob-store port, with an in-memory implementation.

pub mod content;
pub mod lineage;
pub mod segment;
pub mod store;

pub use content::Content;
pub use lineage::{LineageData, LineageMap};
pub use segment::{subreference_segments, total_size, Segment};
pub use store::{ContentStore, InMemoryContentStore};
