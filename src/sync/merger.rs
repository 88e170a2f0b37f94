//! Reconcile records from overlapping source extracts
//!
//! The same message can appear in several extracts (a live database and
//! one or more backups). The copy with the most attachments available on
//! disk wins; on a tie the first one seen stays.

use std::collections::HashMap;

use tracing::debug;

use crate::types::LogicalRecord;

/// Merge record sequences into one guid-keyed map.
///
/// Surviving records get ordinals `1..=n` ordered by (date, guid).
/// Colliding records with different conversations are not rejected; the
/// attachment rule still decides.
pub fn merge_records(sequences: Vec<Vec<LogicalRecord>>) -> HashMap<String, LogicalRecord> {
    // guid -> (record, resolved attachment count)
    let mut merged: HashMap<String, (LogicalRecord, usize)> = HashMap::new();

    for (source_index, sequence) in sequences.into_iter().enumerate() {
        for record in sequence {
            let resolved = record.resolved_attachment_count();
            match merged.get_mut(&record.guid) {
                Some((existing, existing_resolved)) => {
                    if resolved > *existing_resolved {
                        debug!(
                            guid = %record.guid,
                            source = source_index,
                            resolved,
                            replaced = *existing_resolved,
                            "Replacing record with richer copy"
                        );
                        *existing = record;
                        *existing_resolved = resolved;
                    }
                }
                None => {
                    merged.insert(record.guid.clone(), (record, resolved));
                }
            }
        }
    }

    let mut order: Vec<(chrono::DateTime<chrono::Utc>, String)> = merged
        .values()
        .map(|(r, _)| (r.date, r.guid.clone()))
        .collect();
    order.sort();

    let mut out: HashMap<String, LogicalRecord> = merged
        .into_iter()
        .map(|(guid, (record, _))| (guid, record))
        .collect();
    for (i, (_, guid)) in order.iter().enumerate() {
        if let Some(record) = out.get_mut(guid) {
            record.ordinal = i as u64 + 1;
        }
    }
    out
}
