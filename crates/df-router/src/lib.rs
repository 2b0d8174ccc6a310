//! # df-router
//!
//! The orchestration engine: routing items through flows, applying worker
//! results, and the background sweeps.
//!
//! ## Overview
//!
//! - [`FlowRouter`] -- pure advancement of an item's flows against the
//!   configured plans.
//! - [`DeltaFilesService`] -- the optimistic read-advance-save cycle around
//!   every operation, plus dispatch, joins and sweeps.
//! - [`ActionEvent`] / [`Outcome`] -- inbound worker results.
//! - [`ActionInvocation`] / [`DispatchQueue`] -- outbound work.
//! - [`JoinAccumulator`] -- groups parked for a JOIN action.
//! - [`DeltaFileRepository`] -- versioned persistence.
//! - [`worker`] -- event consumers and the periodic sweeper.

pub mod dispatch;
pub mod event;
pub mod join;
pub mod repository;
pub mod retry;
pub mod router;
pub mod service;
pub mod worker;

pub use dispatch::{ActionContext, ActionInvocation, DispatchQueue, InMemoryDispatchQueue};
pub use event::{ActionEvent, Outcome};
pub use join::{JoinAccumulator, JoinKey, JoinRelease};
pub use repository::{DeltaFileRepository, InMemoryDeltaFileRepository};
pub use retry::{retry_on_conflict, RetryPolicy};
pub use router::{Advancement, FlowRouter};
pub use service::{DeltaFilesService, IngressRequest};
