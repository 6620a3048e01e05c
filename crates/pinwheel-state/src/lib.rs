//! pinwheel-state — system of record for hosts, instances, and CPU mappings.
//!
//! Backed by [redb](https://docs.rs/redb). Every record is JSON-serialized
//! into a `&[u8]` value column keyed by its natural identifier (host name or
//! instance UUID), so uniqueness of a mapping per instance falls out of the
//! table layout.
//!
//! Read-modify-write operations (`upsert_*`, `update_mapping`) run inside a
//! single write transaction. redb admits one writer at a time, which makes
//! each of them atomic with respect to concurrent callers.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`).

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{StateStore, Upsert};
pub use types::*;
