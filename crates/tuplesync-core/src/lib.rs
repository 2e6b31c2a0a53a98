//! Core types shared across the tuplesync pipeline.
//!
//! This crate sits at the root of the workspace dependency graph and carries
//! the value types every stage agrees on: the change-event model, qualified
//! identity splitting, the source-fetch contract, and the error taxonomy.

pub mod error;
pub mod event;
pub mod identity;
pub mod source;

pub use error::{SyncError, SyncResult};
pub use event::{ChangeEvent, ChangeKind};
pub use identity::{split_qualified, DEFAULT_OBJECT_TYPE, DEFAULT_SUBJECT_TYPE};
pub use source::{ChangeSource, FetchResult, FetcherStats};
