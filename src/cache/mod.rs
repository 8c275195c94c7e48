//! Shared, live-synced collections.
//!
//! - `registry` hands out one `Collection` per table, parameters and
//!   mutation capability, and sweeps the ones nobody uses any more
//! - `collection` runs the change-stream and the optimistic write layer
//! - `error_handler` rate-limits repeated failures of a collection

pub mod collection;
pub mod error_handler;
pub mod registry;
mod state;

pub use collection::{Collection, CollectionConfig, CollectionStatus};
pub use error_handler::ErrorHandler;
pub use registry::{CollectionId, CollectionLease, CollectionRegistry};
