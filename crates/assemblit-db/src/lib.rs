//! assemblit data-access layer over per-domain SQLite files.
//!
//! Users, sessions and datasets each live in their own database. This crate
//! offers an async API (sqlx) to create and query those tables, converts stored
//! text back into typed values, and deletes whole ownership subtrees across the
//! three files while keeping children that another parent still owns.

pub mod catalog;
pub mod coerce;
pub mod config;
pub mod error;
pub mod filter;
pub mod handler;
pub mod hierarchy;
pub mod ident;
pub mod integrity;
pub mod registry;
pub mod schema;

pub use catalog::{dataset_id_for, session_id_for, Catalog, DatasetInfo};
pub use coerce::{coerce, coerce_named, coerce_value, serialize, Value, ValueKind};
pub use config::{parse_db_name, StoreConfig, TierConfig};
pub use error::{StoreError, StoreResult};
pub use filter::{Assignment, DeleteTarget, Filter, FilterValue, Record, SortOrder};
pub use handler::Handler;
pub use hierarchy::{
    CascadeOutcome, CascadePlan, CascadeStep, Hierarchy, Tier, DATASETS_LEVEL, SESSIONS_LEVEL,
    USERS_LEVEL,
};
pub use integrity::Violation;
pub use registry::StoreRegistry;
pub use schema::{tables, ColumnDef, TableSchema};

/// MD5 hex digest of `input`, as used for content-derived identifiers.
pub fn md5_hex(input: &str) -> String {
    catalog::md5_hex(input)
}
