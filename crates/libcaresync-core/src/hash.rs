use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use chrono::SecondsFormat;
use ciborium::Value;

use crate::types::audit::{AuditLogEntry, EntryHash};

/// Schema version for audit entry hashing
pub const AUDIT_HASH_VERSION: u8 = 1;

/// Compute the chained hash of an audit entry using canonical CBOR + BLAKE2b-256.
///
/// Covers every field except `hash` itself, including `prev_hash`.
pub fn compute_entry_hash(entry: &AuditLogEntry) -> EntryHash {
    let preimage = build_canonical_cbor(entry);
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(&preimage);
    hasher.finalize().into()
}

/// Build the canonical CBOR preimage for hashing
/// Format: [version, id, action, timestamp, user, tenant, device, details, ip, user_agent, prev_hash]
pub fn build_canonical_cbor(entry: &AuditLogEntry) -> Vec<u8> {
    // serde_json maps are sorted by key, so this string is canonical
    let details = entry.details.to_string();

    let array = Value::Array(vec![
        Value::Integer(AUDIT_HASH_VERSION.into()),
        Value::Integer(entry.id.into()),
        Value::Text(entry.action.clone()),
        Value::Text(entry.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)),
        Value::Text(entry.actor.user_id.clone()),
        Value::Text(entry.actor.tenant_id.clone()),
        Value::Text(entry.actor.device_id.clone()),
        Value::Text(details),
        Value::Text(entry.ip_address.clone()),
        Value::Text(entry.user_agent.clone()),
        Value::Bytes(entry.prev_hash.to_vec()),
    ]);

    let mut buf = Vec::new();
    ciborium::into_writer(&array, &mut buf).expect("CBOR serialization should not fail");
    buf
}
