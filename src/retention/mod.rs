//! Retention
//!
//! Per-entity-type retention policies and the background sweeper that
//! enforces them.

pub mod policy;
pub mod sweeper;

pub use policy::{Disposition, PolicySet, PolicyStore, RetentionPolicy};
pub use sweeper::{RetentionSweeper, SweepReport, SweeperConfig};
