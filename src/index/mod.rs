//! Timevault index structures
//!
//! Two relational indexes sit next to the physical storage backends:
//!
//! - **metadata_store**: which arrays are attached to which components, with
//!   what attributes, and how many references each physical array still has
//! - **associations**: which components compose which other components
//!
//! # Architecture
//!
//! ```text
//! get("active_power" for gen1)
//!        ↓
//! TimeSeriesMetadataStore: resolve exactly one metadata row
//!        ↓
//! TimeSeriesStore: range-read only the referenced array
//! ```
//!
//! The metadata store travels with manager snapshots; the association index
//! is never persisted and is rebuilt from the live component graph.

mod associations;
mod metadata_store;

pub use associations::ComponentAssociations;
pub use metadata_store::{TimeSeriesMetadataStore, METADATA_DB_FILENAME};
