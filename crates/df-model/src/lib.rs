//! # df-model
//!
//! The item aggregate and its state machines.
//!
//! - [`Action`] -- one attempt of one named action inside a flow.
//! - [`DeltaFileFlow`] -- one flow instance for one item; owns its actions
//!   and derives its state from the last one.
//! - [`DeltaFile`] -- the aggregate root: flows, lineage ids, stage, version.
//! - [`DeltaFileView`] -- the narrowed "for-queue" projection handed to
//!   action workers.

pub mod action;
pub mod delta_file;
pub mod flow;
pub mod types;
pub mod view;

pub use action::{Action, ActionState, ActionType, MAX_CAUSE_SIZE};
pub use delta_file::{DeltaFile, DeltaFileStage};
pub use flow::{DeltaFileFlow, FlowInput, FlowState, FlowType};
pub use types::{Domain, Enrichment, Metadata, ResumeMetadata, MATCHES_ANY};
pub use view::DeltaFileView;
