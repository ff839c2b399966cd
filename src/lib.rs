//! # Timevault
//!
//! Component time-series storage - an embedded Rust engine for storing,
//! indexing, and migrating large numeric time-series arrays attached to
//! domain components.
//!
//! ## Features
//!
//! - **One contract, three backends**: heap map, columnar segment files,
//!   embedded SQL - all behind [`storage::TimeSeriesStore`]
//! - **Exactly-once physical storage**: many metadata records can share one
//!   stored array; deletion is gated on a reference count
//! - **Sub-range reads**: block-pruned file reads and filtered SQL queries
//!   fetch only the requested window, never the whole dataset
//! - **Atomic migration**: snapshot a manager to disk and reconstruct it on
//!   any durable backend, read-only or as a private writable copy
//! - **Derived association index**: fast parent/child lookup over the
//!   component graph, rebuildable from scratch at any time
//!
//! ## Modules
//!
//! - [`storage`]: The backend contract and its three implementations
//! - [`index`]: Metadata and association indexes
//! - [`manager`]: The orchestration layer tying allocator, index, and
//!   backend together
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use chrono::{TimeDelta, TimeZone, Utc};
//! use timevault::{
//!     Component, MetadataFilter, SingleTimeSeries, StoreOptions, TimeSeriesManager,
//! };
//!
//! struct Generator {
//!     id: Option<u64>,
//!     name: String,
//! }
//!
//! impl Component for Generator {
//!     fn id(&self) -> Option<u64> {
//!         self.id
//!     }
//!     fn component_type(&self) -> &'static str {
//!         "Generator"
//!     }
//!     fn name(&self) -> &str {
//!         &self.name
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut manager = TimeSeriesManager::new(&StoreOptions::default())?;
//!     let gen = Generator {
//!         id: Some(1),
//!         name: "gen1".to_string(),
//!     };
//!
//!     let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
//!     let mut series = SingleTimeSeries::new(
//!         "active_power",
//!         start,
//!         TimeDelta::hours(1),
//!         vec![0.9, 1.1, 1.4, 1.2],
//!     );
//!
//!     manager.add(&mut series, &[&gen], BTreeMap::new())?;
//!
//!     let filter = MetadataFilter::new().variable_name("active_power");
//!     let window = manager.get(&gen, &filter, Some(start + TimeDelta::hours(1)), Some(2))?;
//!     assert_eq!(window.data, vec![1.1, 1.4]);
//!
//!     Ok(())
//! }
//! ```

pub mod component;
pub mod config;
pub mod id;
pub mod index;
pub mod manager;
pub mod storage;

// Re-export top-level types for convenience
pub use component::Component;
pub use config::StoreOptions;
pub use id::IdAllocator;
pub use index::{ComponentAssociations, TimeSeriesMetadataStore};
pub use manager::TimeSeriesManager;
pub use storage::{
    ColumnarStore, InMemoryStore, MetadataFilter, Normalization, SingleTimeSeries, SqlStore,
    StorageDescriptor, StorageKind, StoreError, StoreResult, TimeSeriesMetadata, TimeSeriesStore,
};
