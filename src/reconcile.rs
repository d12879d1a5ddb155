//! Inventory reconciliation.
//!
//! Inventory is append-only history: every session writes its own records
//! and the dashboard keeps master templates (`session_id = None`) for the
//! price list. These functions collapse that history into one current row
//! per item, keyed by the trimmed, lower-cased item name.

use std::collections::BTreeMap;
use tracing::warn;

use crate::error::RemoteError;
use crate::models::{round2, InventoryRecord};

fn is_newer(candidate: &InventoryRecord, current: &InventoryRecord) -> bool {
    (candidate.updated_at, candidate.created_at) > (current.updated_at, current.created_at)
}

/// One current record per item.
///
/// For each item the most recent record with at least one non-zero count
/// wins; items that never had counts fall back to their most recent record.
/// Output is ordered by item key.
pub fn current_state(records: &[InventoryRecord]) -> Vec<InventoryRecord> {
    // (latest with counts, latest overall)
    let mut groups: BTreeMap<String, (Option<&InventoryRecord>, &InventoryRecord)> =
        BTreeMap::new();

    for rec in records {
        let entry = groups.entry(rec.name_key()).or_insert((None, rec));
        if is_newer(rec, entry.1) {
            entry.1 = rec;
        }
        if rec.has_counts() && entry.0.map_or(true, |best| is_newer(rec, best)) {
            entry.0 = Some(rec);
        }
    }

    groups
        .into_values()
        .map(|(with_counts, latest)| with_counts.unwrap_or(latest).clone())
        .collect()
}

/// Fresh records for `session_id`, carrying each item's remaining stock
/// into the new session's start count.
pub fn seed_session(current: &[InventoryRecord], session_id: &str) -> Vec<InventoryRecord> {
    current
        .iter()
        .map(|prior| {
            let mut seeded = InventoryRecord::new(
                prior.item_name.trim(),
                Some(session_id.to_string()),
                prior.unit_price,
                prior.quantity,
            );
            seeded.set_counts(prior.left_count, 0, 0);
            seeded
        })
        .collect()
}

/// Overlay current state onto the master item list.
///
/// The master list decides which items exist and their name, price and
/// quantity. Items missing from it are left out of the result; nothing is
/// deleted from history.
pub fn merge_with_master(
    current: &[InventoryRecord],
    master: &[InventoryRecord],
) -> Vec<InventoryRecord> {
    let by_key: BTreeMap<String, &InventoryRecord> =
        current.iter().map(|r| (r.name_key(), r)).collect();

    let mut merged: BTreeMap<String, InventoryRecord> = BTreeMap::new();
    for template in master {
        let key = template.name_key();
        if key.is_empty() || merged.contains_key(&key) {
            continue;
        }
        let row = match by_key.get(&key) {
            Some(cur) => {
                let mut row = (*cur).clone();
                row.item_name = template.item_name.trim().to_string();
                row.unit_price = template.unit_price;
                row.quantity = template.quantity;
                row.recompute();
                row
            }
            None => template.clone(),
        };
        merged.insert(key, row);
    }

    let dropped = by_key.keys().filter(|k| !merged.contains_key(*k)).count();
    if dropped > 0 {
        warn!(dropped, "Items missing from master list hidden from view");
    }

    merged.into_values().collect()
}

/// Display rows for one session. Duplicate item names are summed on the
/// count fields; price and quantity come from the first occurrence.
pub fn session_view(records: &[InventoryRecord], session_id: &str) -> Vec<InventoryRecord> {
    let mut in_session: Vec<&InventoryRecord> = records
        .iter()
        .filter(|r| r.session_id.as_deref() == Some(session_id))
        .collect();
    in_session.sort_by_key(|r| (r.created_at, r.id.clone()));

    let mut rows: BTreeMap<String, InventoryRecord> = BTreeMap::new();
    for rec in in_session {
        match rows.get_mut(&rec.name_key()) {
            Some(row) => {
                row.start_count += rec.start_count;
                row.add_count += rec.add_count;
                row.sold_count += rec.sold_count;
                row.recompute();
            }
            None => {
                let mut row = rec.clone();
                row.recompute();
                rows.insert(rec.name_key(), row);
            }
        }
    }
    rows.into_values().collect()
}

/// Sum of row totals, rounded to cents.
pub fn inventory_total(rows: &[InventoryRecord]) -> f64 {
    round2(rows.iter().map(|r| r.total_amount).sum())
}

/// True when local inventory is empty or nothing has ever been counted.
pub fn is_bootstrap_state(records: &[InventoryRecord]) -> bool {
    records.iter().all(|r| !r.has_counts())
}

/// Rebuild the displayed inventory from history and the master list.
///
/// When the master list could not be fetched the prior display is returned
/// as is.
pub fn refresh_view(
    prior: &[InventoryRecord],
    history: &[InventoryRecord],
    master: Result<Vec<InventoryRecord>, RemoteError>,
) -> Vec<InventoryRecord> {
    match master {
        Ok(master) => merge_with_master(&current_state(history), &master),
        Err(e) => {
            warn!("Master item list unavailable, keeping displayed inventory: {e}");
            prior.to_vec()
        }
    }
}
