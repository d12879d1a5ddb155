//! Employee clock in / clock out.

use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::info;

use crate::error::SyncError;
use crate::models::TimesheetEntry;
use crate::store::LocalStore;

/// Open entries for an employee, oldest first.
fn open_entries(store: &LocalStore, employee_id: &str) -> Result<Vec<TimesheetEntry>, SyncError> {
    Ok(store.load_where(
        "employee_id = ?1 AND clock_out_time IS NULL",
        params![employee_id],
    )?)
}

pub fn current_entry(
    store: &LocalStore,
    employee_id: &str,
) -> Result<Option<TimesheetEntry>, SyncError> {
    Ok(open_entries(store, employee_id)?.pop())
}

/// Start a timesheet entry. Clocking in twice returns the entry that is
/// already open.
pub fn clock_in(
    store: &LocalStore,
    employee_id: &str,
    at: DateTime<Utc>,
) -> Result<TimesheetEntry, SyncError> {
    if let Some(open) = current_entry(store, employee_id)? {
        return Ok(open);
    }
    let entry = store.put(TimesheetEntry::clock_in(employee_id, at))?;
    info!(employee_id = %employee_id, entry_id = %entry.id, "Clocked in");
    Ok(entry)
}

/// Close the employee's open entry and record the worked hours.
pub fn clock_out(
    store: &LocalStore,
    employee_id: &str,
    at: DateTime<Utc>,
) -> Result<TimesheetEntry, SyncError> {
    let mut entry = current_entry(store, employee_id)?
        .ok_or_else(|| SyncError::NoOpenTimesheet(employee_id.to_string()))?;
    entry.clock_out(at);
    let entry = store.put(entry)?;
    info!(
        employee_id = %employee_id,
        entry_id = %entry.id,
        hours = entry.work_duration,
        "Clocked out"
    );
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;
    use chrono::Duration;

    #[test]
    fn test_clock_in_then_out() {
        let store = test_store();
        let start = Utc::now() - Duration::hours(8);

        let entry = clock_in(&store, "emp-1", start).unwrap();
        assert!(entry.is_open());
        let again = clock_in(&store, "emp-1", Utc::now()).unwrap();
        assert_eq!(again.id, entry.id);

        let closed = clock_out(&store, "emp-1", start + Duration::minutes(495)).unwrap();
        assert_eq!(closed.id, entry.id);
        assert_eq!(closed.work_duration, 8.25);
        assert!(!closed.synced);
        assert!(current_entry(&store, "emp-1").unwrap().is_none());
    }

    #[test]
    fn test_clock_out_without_clock_in() {
        let store = test_store();
        let err = clock_out(&store, "emp-2", Utc::now()).unwrap_err();
        assert!(matches!(err, SyncError::NoOpenTimesheet(ref id) if id == "emp-2"));
    }
}
