//! Copy a segment store from one persistence backend to another.
//!
//! [`SegmentStoreMigrator`] drives the migration over any pair of [`persistence::Persistence`]
//! implementations. Archive contents go through a [`pipeline::SegmentPipeline`], which fetches segments
//! concurrently but writes them in order, and every backend access is guarded by a [`retry::RetryPolicy`].

pub mod error;
mod migrator;
pub mod pipeline;
pub mod retry;

pub use crate::error::MigrationError;
pub use crate::migrator::{MigrationOptions, MigrationSummary, SegmentStoreMigrator};
pub use crate::retry::RetryPolicy;
