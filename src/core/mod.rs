//! Core functionality for iptv-refresh.
//!
//! This module contains the main components:
//! - [`pipeline`]: Ordered step execution under a run budget
//! - [`trigger`]: What started a run (schedule, manual, push)
//! - [`schedule`]: Daily UTC schedule
//! - [`git`]: Git repository operations
//! - [`artifact`]: Output archives and their retention
//! - [`executor`]: Child process execution
//! - [`error`]: Error types and result handling

pub mod artifact;
pub mod error;
pub mod executor;
pub mod git;
pub mod pipeline;
pub mod schedule;
pub mod trigger;
