//! redb table definitions for the global state store.
//!
//! Each record type has a primary table (`&str` key, JSON `&[u8]` value) and
//! an index table mapping `{index}\x1f{partition}\x1f{sort:020}\x1f{key}` to
//! the primary key. Index entries are written in the same transaction as the
//! primary row.

use redb::TableDefinition;

/// NodeRecord keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
pub const NODES_IDX: TableDefinition<&str, &str> = TableDefinition::new("nodes_idx");

/// RoutingFact keyed by `{node_id}`.
pub const ROUTING_FACTS: TableDefinition<&str, &[u8]> = TableDefinition::new("routing_facts");
pub const ROUTING_FACTS_IDX: TableDefinition<&str, &str> =
    TableDefinition::new("routing_facts_idx");

/// ScalingRecord keyed by `{pool}:{timestamp_ms:020}:{region}`.
pub const SCALING: TableDefinition<&str, &[u8]> = TableDefinition::new("scaling");
pub const SCALING_IDX: TableDefinition<&str, &str> = TableDefinition::new("scaling_idx");

/// CleanupRecord keyed by `{node_id}:{timestamp_ms:020}`.
pub const CLEANUP: TableDefinition<&str, &[u8]> = TableDefinition::new("cleanup");
pub const CLEANUP_IDX: TableDefinition<&str, &str> = TableDefinition::new("cleanup_idx");

/// MetricSample keyed by `{name}:{timestamp_ms:020}:{region}:{dimensions}`.
pub const METRICS: TableDefinition<&str, &[u8]> = TableDefinition::new("metrics");
pub const METRICS_IDX: TableDefinition<&str, &str> = TableDefinition::new("metrics_idx");

/// RegionSnapshot keyed by `{region}`.
pub const REGIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("regions");
pub const REGIONS_IDX: TableDefinition<&str, &str> = TableDefinition::new("regions_idx");

/// ScaleIntent keyed by `{target_region}:{timestamp_ms:020}:{source_region}`.
pub const SCALE_INTENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("scale_intents");
pub const SCALE_INTENTS_IDX: TableDefinition<&str, &str> =
    TableDefinition::new("scale_intents_idx");

/// Separator between index key components. Sorts below every printable byte.
pub const SEP: char = '\x1f';

/// Build the full index key for one entry.
pub fn index_key(index: &str, partition: &str, sort: u64, primary: &str) -> String {
    format!("{index}{SEP}{partition}{SEP}{sort:020}{SEP}{primary}")
}

/// Inclusive-start, exclusive-end bounds covering a partition, optionally
/// narrowed to `[since, until]` on the sort component.
pub fn partition_bounds(
    index: &str,
    partition: &str,
    since: Option<u64>,
    until: Option<u64>,
) -> (String, String) {
    let start = match since {
        Some(s) => format!("{index}{SEP}{partition}{SEP}{s:020}"),
        None => format!("{index}{SEP}{partition}{SEP}"),
    };
    let end = match until {
        Some(u) if u < u64::MAX => format!("{index}{SEP}{partition}{SEP}{:020}", u + 1),
        // One past the separator byte closes the partition.
        _ => format!("{index}{SEP}{partition}\x20"),
    };
    (start, end)
}
