//! Tamper evidence for cleanup records.

use mrgc_state::CleanupRecord;
use sha2::{Digest, Sha256};

/// Hex SHA-256 over the identifying fields and check results.
pub fn compute_integrity(record: &CleanupRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.node_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(record.timestamp_ms.to_be_bytes());
    hasher.update(record.status.as_str().as_bytes());
    hasher.update([
        u8::from(record.compute_memory_wiped),
        u8::from(record.system_memory_wiped),
        u8::from(record.secure_compute_restarted),
    ]);
    if let Some(reason) = &record.failure_reason {
        hasher.update(reason.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub fn seal(mut record: CleanupRecord) -> CleanupRecord {
    record.integrity = compute_integrity(&record);
    record
}

pub fn verify(record: &CleanupRecord) -> bool {
    !record.integrity.is_empty() && record.integrity == compute_integrity(record)
}
