//! trawl store
//!
//! Append-only, bounded, indexed storage for packets and proxy transactions,
//! the display-filter language evaluated against it, and the ingest pipeline
//! that feeds it.
//!
//! # Modules
//!
//! - `store` - `Store<T>` with sequence numbering, eviction and snapshots
//! - `index` - Secondary indices maintained under the store lock
//! - `filter` - Display filter parsing and evaluation
//! - `alerts` - Epoch-tagged alert log
//! - `ingest` - Single-writer append → inspect → publish pipeline

pub mod alerts;
pub mod filter;
mod index;
pub mod ingest;
pub mod store;

pub use alerts::AlertLog;
pub use filter::{Direction, FilterExpr};
pub use ingest::{Ingest, Inspector, NoInspection};
pub use store::Store;

use thiserror::Error;
use trawl_core::TrawlError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("No item numbered {0}")]
    NotFound(u64),
}

impl From<StoreError> for TrawlError {
    fn from(err: StoreError) -> Self {
        TrawlError::NotFound(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
