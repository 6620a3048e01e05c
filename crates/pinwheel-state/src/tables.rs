//! redb table definitions for the pinwheel state store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Host topology keyed by `{host_name}`.
pub const HOSTS: TableDefinition<&str, &[u8]> = TableDefinition::new("hosts");

/// Observed instance state keyed by `{instance_uuid}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Desired CPU mappings keyed by `{instance_uuid}` (one per instance).
pub const MAPPINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("instance_cpu_mappings");

/// Monotonic id sequences keyed by sequence name.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Sequence used for `MappingRecord::id`.
pub const MAPPING_ID_SEQ: &str = "instance_cpu_mappings";
