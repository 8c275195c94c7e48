//! Local-first sync client.
//!
//! Shapes (server-side row sets) are mirrored into shared in-memory
//! collections that follow a change-stream. Writes are applied
//! optimistically and confirmed once their transaction ids show up in the
//! stream. One `TokenManager` per client refreshes the access token for all
//! collections at once, pausing their requests while it does.

pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod mutation;
pub mod query;
pub mod shape;

pub use auth::{HttpTokenSource, StaticTokenSource, TokenManager, TokenSource};
pub use client::SyncClient;
pub use config::Config;
pub use error::{SyncError, SyncResult};
pub use mutation::{MutationHandlers, Persisted};
pub use query::{Inserted, ShapeMutations, ShapeOptions, ShapeQuery};
pub use shape::{params, row_key, MutationDefinition, Params, Row, ShapeDefinition, Txid};
