//! Local record store.
//!
//! Typed access to the five collections in `laundromat.db`. Every call runs
//! in a single SQLite transaction and emits a [`StoreEvent`] after commit.
//! When the database could not be opened the store stays usable in a
//! degraded mode: plain reads return empty collections, writes fail with
//! [`StoreError::Unavailable`].

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, Row, ToSql};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::db::{self, DbState};
use crate::error::StoreError;
use crate::models::{
    Collection, EmployeeProfile, InventoryRecord, Session, SessionStatus, Ticket, TimesheetEntry,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Record mapping
// ---------------------------------------------------------------------------

/// A row type stored in one of the local collections.
///
/// `COLUMNS` lists every persisted column except `synced`, in the order
/// produced by [`Record::values`]. The first column is always `id`.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: Collection;
    const COLUMNS: &'static [&'static str];
    const ORDER_BY: &'static str = "created_at, id";

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    fn synced(&self) -> bool;
    fn set_synced(&mut self, synced: bool);
    /// Bump `updated_at` for a local edit.
    fn touch(&mut self, now: DateTime<Utc>);
    /// Re-derive computed fields before a local write.
    fn normalize(&mut self) {}
    fn values(&self) -> Vec<Value>;
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn ts(dt: &DateTime<Utc>) -> Value {
    Value::Text(dt.to_rfc3339_opts(SecondsFormat::Nanos, true))
}

fn conversion_error(
    row: &Row<'_>,
    col: &str,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    let idx = row.as_ref().column_index(col).unwrap_or(0);
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn parse_ts(row: &Row<'_>, col: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(col)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(row, col, e))
}

fn parse_opt_ts(row: &Row<'_>, col: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(col)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(row, col, e))
    })
    .transpose()
}

impl Record for EmployeeProfile {
    const COLLECTION: Collection = Collection::Profiles;
    const COLUMNS: &'static [&'static str] = &["id", "full_name", "email", "role"];
    const ORDER_BY: &'static str = "full_name, id";

    fn id(&self) -> &str {
        &self.id
    }
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
    fn synced(&self) -> bool {
        self.synced
    }
    fn set_synced(&mut self, synced: bool) {
        self.synced = synced;
    }
    fn touch(&mut self, _now: DateTime<Utc>) {}

    fn values(&self) -> Vec<Value> {
        vec![
            text(&self.id),
            text(&self.full_name),
            text(&self.email),
            text(&self.role),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            full_name: row.get("full_name")?,
            email: row.get("email")?,
            role: row.get("role")?,
            synced: row.get("synced")?,
        })
    }
}

impl Record for InventoryRecord {
    const COLLECTION: Collection = Collection::Inventory;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "item_name",
        "session_id",
        "quantity",
        "unit_price",
        "start_count",
        "add_count",
        "sold_count",
        "left_count",
        "total_amount",
        "created_at",
        "updated_at",
    ];

    fn id(&self) -> &str {
        &self.id
    }
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
    fn synced(&self) -> bool {
        self.synced
    }
    fn set_synced(&mut self, synced: bool) {
        self.synced = synced;
    }
    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
    fn normalize(&mut self) {
        self.recompute();
    }

    fn values(&self) -> Vec<Value> {
        vec![
            text(&self.id),
            text(&self.item_name),
            self.session_id.as_deref().map_or(Value::Null, text),
            Value::Integer(self.quantity),
            Value::Real(self.unit_price),
            Value::Integer(self.start_count),
            Value::Integer(self.add_count),
            Value::Integer(self.sold_count),
            Value::Integer(self.left_count),
            Value::Real(self.total_amount),
            ts(&self.created_at),
            ts(&self.updated_at),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            item_name: row.get("item_name")?,
            session_id: row.get("session_id")?,
            quantity: row.get("quantity")?,
            unit_price: row.get("unit_price")?,
            start_count: row.get("start_count")?,
            add_count: row.get("add_count")?,
            sold_count: row.get("sold_count")?,
            left_count: row.get("left_count")?,
            total_amount: row.get("total_amount")?,
            created_at: parse_ts(row, "created_at")?,
            updated_at: parse_ts(row, "updated_at")?,
            synced: row.get("synced")?,
        })
    }
}

impl Record for Ticket {
    const COLLECTION: Collection = Collection::Tickets;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "ticket_number",
        "session_id",
        "wash_amount",
        "dry_amount",
        "total_amount",
        "created_at",
        "updated_at",
    ];

    fn id(&self) -> &str {
        &self.id
    }
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
    fn synced(&self) -> bool {
        self.synced
    }
    fn set_synced(&mut self, synced: bool) {
        self.synced = synced;
    }
    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
    fn normalize(&mut self) {
        self.recompute();
    }

    fn values(&self) -> Vec<Value> {
        vec![
            text(&self.id),
            text(&self.ticket_number),
            text(&self.session_id),
            Value::Real(self.wash_amount),
            Value::Real(self.dry_amount),
            Value::Real(self.total_amount),
            ts(&self.created_at),
            ts(&self.updated_at),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            ticket_number: row.get("ticket_number")?,
            session_id: row.get("session_id")?,
            wash_amount: row.get("wash_amount")?,
            dry_amount: row.get("dry_amount")?,
            total_amount: row.get("total_amount")?,
            created_at: parse_ts(row, "created_at")?,
            updated_at: parse_ts(row, "updated_at")?,
            synced: row.get("synced")?,
        })
    }
}

impl Record for Session {
    const COLLECTION: Collection = Collection::Sessions;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "employee_id",
        "session_date",
        "cash_started",
        "cash_added",
        "cash_total",
        "inventory_total",
        "wash_dry_total",
        "grand_total",
        "notes",
        "status",
        "created_at",
        "updated_at",
    ];

    fn id(&self) -> &str {
        &self.id
    }
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
    fn synced(&self) -> bool {
        self.synced
    }
    fn set_synced(&mut self, synced: bool) {
        self.synced = synced;
    }
    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
    fn normalize(&mut self) {
        self.recompute_totals();
    }

    fn values(&self) -> Vec<Value> {
        vec![
            text(&self.id),
            text(&self.employee_id),
            Value::Text(self.session_date.format("%Y-%m-%d").to_string()),
            Value::Real(self.cash_started),
            Value::Real(self.cash_added),
            Value::Real(self.cash_total),
            Value::Real(self.inventory_total),
            Value::Real(self.wash_dry_total),
            Value::Real(self.grand_total),
            text(&self.notes),
            text(self.status.as_str()),
            ts(&self.created_at),
            ts(&self.updated_at),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let raw_date: String = row.get("session_date")?;
        let session_date = NaiveDate::parse_from_str(&raw_date, "%Y-%m-%d")
            .map_err(|e| conversion_error(row, "session_date", e))?;
        let raw_status: String = row.get("status")?;
        let status = raw_status
            .parse::<SessionStatus>()
            .map_err(|e| conversion_error(row, "status", e))?;

        Ok(Self {
            id: row.get("id")?,
            employee_id: row.get("employee_id")?,
            session_date,
            cash_started: row.get("cash_started")?,
            cash_added: row.get("cash_added")?,
            cash_total: row.get("cash_total")?,
            inventory_total: row.get("inventory_total")?,
            wash_dry_total: row.get("wash_dry_total")?,
            grand_total: row.get("grand_total")?,
            notes: row.get("notes")?,
            status,
            created_at: parse_ts(row, "created_at")?,
            updated_at: parse_ts(row, "updated_at")?,
            synced: row.get("synced")?,
        })
    }
}

impl Record for TimesheetEntry {
    const COLLECTION: Collection = Collection::Timesheets;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "employee_id",
        "clock_in_time",
        "clock_out_time",
        "work_duration",
        "created_at",
        "updated_at",
    ];
    const ORDER_BY: &'static str = "clock_in_time, id";

    fn id(&self) -> &str {
        &self.id
    }
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
    fn synced(&self) -> bool {
        self.synced
    }
    fn set_synced(&mut self, synced: bool) {
        self.synced = synced;
    }
    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
    fn normalize(&mut self) {
        self.recompute_duration();
    }

    fn values(&self) -> Vec<Value> {
        vec![
            text(&self.id),
            text(&self.employee_id),
            ts(&self.clock_in_time),
            self.clock_out_time.as_ref().map_or(Value::Null, ts),
            Value::Real(self.work_duration),
            ts(&self.created_at),
            ts(&self.updated_at),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            employee_id: row.get("employee_id")?,
            clock_in_time: parse_ts(row, "clock_in_time")?,
            clock_out_time: parse_opt_ts(row, "clock_out_time")?,
            work_duration: row.get("work_duration")?,
            created_at: parse_ts(row, "created_at")?,
            updated_at: parse_ts(row, "updated_at")?,
            synced: row.get("synced")?,
        })
    }
}

/// Map row decoding failures to `Corrupt`, everything else stays SQLite.
fn row_error(err: rusqlite::Error) -> StoreError {
    match err {
        rusqlite::Error::FromSqlConversionFailure(idx, _, inner) => {
            StoreError::Corrupt(format!("column {idx}: {inner}"))
        }
        rusqlite::Error::InvalidColumnType(idx, name, ty) => {
            StoreError::Corrupt(format!("column {idx} ({name}) has type {ty}"))
        }
        other => StoreError::Sqlite(other),
    }
}

fn upsert_sql<R: Record>() -> String {
    let cols = R::COLUMNS.join(", ");
    let placeholders = (1..=R::COLUMNS.len() + 1)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = R::COLUMNS[1..]
        .iter()
        .chain(std::iter::once(&"synced"))
        .map(|c| format!("{c} = excluded.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {table} ({cols}, synced) VALUES ({placeholders})
         ON CONFLICT(id) DO UPDATE SET {updates}",
        table = R::COLLECTION.table(),
    )
}

fn upsert_row<R: Record>(conn: &Connection, sql: &str, record: &R) -> Result<(), StoreError> {
    let mut values = record.values();
    values.push(Value::Integer(i64::from(record.synced())));
    conn.execute(sql, params_from_iter(values.iter()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Change notifications, sent after the corresponding transaction commits.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// Local edits stored as unsynced.
    Written { collection: Collection, ids: Vec<String> },
    /// Rows stored or flagged as confirmed by the remote.
    Synced { collection: Collection, ids: Vec<String> },
    /// A session moved to a new identifier along with its child rows.
    SessionRekeyed { old_id: String, new_id: String },
}

/// Handle to the local database. Cheap to clone.
#[derive(Clone)]
pub struct LocalStore {
    db: Result<Arc<DbState>, Arc<str>>,
    events: broadcast::Sender<StoreEvent>,
}

impl LocalStore {
    /// Open (or create) the store under `data_dir`. Never fails: an open
    /// failure leaves the store in degraded mode.
    pub fn open(data_dir: &Path) -> Self {
        match db::init(data_dir) {
            Ok(state) => Self::from_db(state),
            Err(e) => {
                error!("Local store unavailable: {e}");
                Self::unavailable(e.to_string())
            }
        }
    }

    pub fn from_db(state: DbState) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            db: Ok(Arc::new(state)),
            events,
        }
    }

    /// A store with no backing database.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let reason: String = reason.into();
        Self {
            db: Err(Arc::from(reason.as_str())),
            events,
        }
    }

    pub fn is_available(&self) -> bool {
        self.db.is_ok()
    }

    /// `Err(Unavailable)` when the database could not be opened.
    pub fn ensure_available(&self) -> Result<(), StoreError> {
        match &self.db {
            Ok(_) => Ok(()),
            Err(reason) => Err(StoreError::Unavailable(reason.to_string())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        let state = self
            .db
            .as_ref()
            .map_err(|reason| StoreError::Unavailable(reason.to_string()))?;
        state
            .conn
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("connection lock poisoned: {e}")))
    }

    /// Run `f` against the raw connection (settings helpers).
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn()?;
        f(&conn)
    }

    fn emit(&self, event: StoreEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    // -- writes -------------------------------------------------------------

    /// Upsert a locally edited record. Assigns a UUID when the id is empty,
    /// re-derives computed fields, marks the record unsynced and bumps
    /// `updated_at`.
    pub fn put<R: Record>(&self, record: R) -> Result<R, StoreError> {
        let mut stored = self.put_many(vec![record])?;
        stored
            .pop()
            .ok_or_else(|| StoreError::Corrupt("put returned no record".into()))
    }

    /// Upsert several local edits in one transaction.
    pub fn put_many<R: Record>(&self, records: Vec<R>) -> Result<Vec<R>, StoreError> {
        if records.is_empty() {
            return Ok(records);
        }
        let now = Utc::now();
        let records: Vec<R> = records
            .into_iter()
            .map(|mut r| {
                if r.id().trim().is_empty() {
                    r.set_id(uuid::Uuid::new_v4().to_string());
                }
                r.set_synced(false);
                r.normalize();
                r.touch(now);
                r
            })
            .collect();

        let sql = upsert_sql::<R>();
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            for record in &records {
                upsert_row(&tx, &sql, record)?;
            }
            tx.commit()?;
        }

        debug!(
            collection = %R::COLLECTION,
            count = records.len(),
            "Stored local records"
        );
        self.emit(StoreEvent::Written {
            collection: R::COLLECTION,
            ids: records.iter().map(|r| r.id().to_string()).collect(),
        });
        Ok(records)
    }

    /// Bulk upsert of records the remote already holds. Stored as synced,
    /// timestamps untouched, all in one transaction.
    pub fn cache_remote<R: Record>(&self, records: &[R]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let sql = upsert_sql::<R>();
        let mut ids = Vec::with_capacity(records.len());
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            for record in records {
                if record.id().trim().is_empty() {
                    warn!(collection = %R::COLLECTION, "Skipping remote row without id");
                    continue;
                }
                let mut confirmed = record.clone();
                confirmed.set_synced(true);
                upsert_row(&tx, &sql, &confirmed)?;
                ids.push(confirmed.id().to_string());
            }
            tx.commit()?;
        }

        info!(collection = %R::COLLECTION, count = ids.len(), "Cached remote records");
        let count = ids.len();
        self.emit(StoreEvent::Synced {
            collection: R::COLLECTION,
            ids,
        });
        Ok(count)
    }

    /// Flag records as confirmed by the remote. Unknown ids are ignored and
    /// repeated calls are no-ops. Returns the number of rows that flipped.
    pub fn mark_synced(&self, collection: Collection, ids: &[String]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {} SET synced = 1 WHERE id = ?1 AND synced = 0",
            collection.table()
        );
        let mut changed = 0;
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&sql)?;
                for id in ids {
                    changed += stmt.execute(params![id])?;
                }
            }
            tx.commit()?;
        }

        debug!(collection = %collection, requested = ids.len(), changed, "Marked synced");
        if changed > 0 {
            self.emit(StoreEvent::Synced {
                collection,
                ids: ids.to_vec(),
            });
        }
        Ok(changed)
    }

    /// Flag uploaded records as synced, but only rows whose `updated_at`
    /// still matches the uploaded copy. A row edited while the upload was
    /// in flight stays unsynced. Returns the number of rows that flipped.
    pub fn mark_synced_if_unchanged(
        &self,
        collection: Collection,
        uploaded: &[(String, DateTime<Utc>)],
    ) -> Result<usize, StoreError> {
        if uploaded.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {} SET synced = 1 WHERE id = ?1 AND updated_at = ?2 AND synced = 0",
            collection.table()
        );
        let mut flipped = Vec::with_capacity(uploaded.len());
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&sql)?;
                for (id, updated_at) in uploaded {
                    if stmt.execute(params![id, ts(updated_at)])? > 0 {
                        flipped.push(id.clone());
                    }
                }
            }
            tx.commit()?;
        }

        let stale = uploaded.len() - flipped.len();
        if stale > 0 {
            debug!(collection = %collection, stale, "Rows changed during upload stay unsynced");
        }
        let changed = flipped.len();
        if changed > 0 {
            self.emit(StoreEvent::Synced {
                collection,
                ids: flipped,
            });
        }
        Ok(changed)
    }

    /// Set a session to `synced` after a complete upload, provided it was not
    /// edited since the committed copy was read. Returns whether it flipped.
    pub fn confirm_session(
        &self,
        session_id: &str,
        committed_at: &DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let changed = {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE sessions SET status = ?1, synced = 1
                 WHERE id = ?2 AND updated_at = ?3 AND status != 'completed'",
                params![SessionStatus::Synced.as_str(), session_id, ts(committed_at)],
            )?
        };
        if changed == 0 {
            return Ok(false);
        }
        self.emit(StoreEvent::Synced {
            collection: Collection::Sessions,
            ids: vec![session_id.to_string()],
        });
        Ok(true)
    }

    /// Move a session to `new_id`, re-tagging its inventory and ticket rows.
    /// Everything moved becomes unsynced.
    pub fn rekey_session(&self, old_id: &str, new_id: &str) -> Result<(), StoreError> {
        let now = ts(&Utc::now());
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            let moved = tx.execute(
                "UPDATE sessions SET id = ?1, synced = 0, updated_at = ?3 WHERE id = ?2",
                params![new_id, old_id, now],
            )?;
            if moved == 0 {
                return Err(StoreError::NotFound {
                    collection: Collection::Sessions,
                    id: old_id.to_string(),
                });
            }
            let inventory = tx.execute(
                "UPDATE inventory_records SET session_id = ?1, synced = 0, updated_at = ?3
                 WHERE session_id = ?2",
                params![new_id, old_id, now],
            )?;
            let tickets = tx.execute(
                "UPDATE tickets SET session_id = ?1, synced = 0, updated_at = ?3
                 WHERE session_id = ?2",
                params![new_id, old_id, now],
            )?;
            tx.commit()?;
            info!(
                old_id = %old_id,
                new_id = %new_id,
                inventory,
                tickets,
                "Session re-keyed"
            );
        }

        self.emit(StoreEvent::SessionRekeyed {
            old_id: old_id.to_string(),
            new_id: new_id.to_string(),
        });
        Ok(())
    }

    // -- reads --------------------------------------------------------------

    pub fn get<R: Record>(&self, id: &str) -> Result<Option<R>, StoreError> {
        let sql = format!("SELECT * FROM {} WHERE id = ?1", R::COLLECTION.table());
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id], |row| R::from_row(row))?;
        rows.next().transpose().map_err(row_error)
    }

    /// Rows matching a SQL `WHERE` clause.
    pub(crate) fn load_where<R: Record>(
        &self,
        clause: &str,
        args: &[&dyn ToSql],
    ) -> Result<Vec<R>, StoreError> {
        let sql = format!(
            "SELECT * FROM {} WHERE {clause} ORDER BY {}",
            R::COLLECTION.table(),
            R::ORDER_BY
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args, |row| R::from_row(row))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(row_error)
    }

    pub fn load_all<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        self.load_where("1 = 1", &[])
    }

    pub fn load_unsynced<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        self.load_where("synced = 0", &[])
    }

    /// Every record in the collection; empty when the store is unavailable.
    pub fn get_all<R: Record>(&self) -> Vec<R> {
        self.load_all().unwrap_or_else(|e| {
            warn!(collection = %R::COLLECTION, "Read degraded to empty: {e}");
            Vec::new()
        })
    }

    /// Unsynced records; empty when the store is unavailable.
    pub fn get_unsynced<R: Record>(&self) -> Vec<R> {
        self.load_unsynced().unwrap_or_else(|e| {
            warn!(collection = %R::COLLECTION, "Read degraded to empty: {e}");
            Vec::new()
        })
    }

    pub fn count_unsynced(&self, collection: Collection) -> Result<usize, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE synced = 0", collection.table());
        let conn = self.conn()?;
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
pub(crate) fn test_store() -> LocalStore {
    LocalStore::from_db(db::open_in_memory().expect("open in-memory db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
    }

    #[test]
    fn test_put_assigns_id_and_marks_unsynced() {
        let store = test_store();
        let mut ticket = Ticket::new("001", "s1", 4.0, 3.0);
        ticket.synced = true;
        let before = ticket.updated_at;

        let stored = store.put(ticket).unwrap();
        assert!(!stored.id.is_empty());
        assert!(!stored.synced);
        assert!(stored.updated_at >= before);

        let loaded: Ticket = store.get(&stored.id).unwrap().unwrap();
        assert_eq!(loaded, stored);
    }

    #[test]
    fn test_put_upserts_by_id() {
        let store = test_store();
        let mut rec = store
            .put(InventoryRecord::new("Tide", Some("s1".into()), 2.0, 1))
            .unwrap();
        rec.set_counts(10, 0, 2);
        store.put(rec.clone()).unwrap();

        let all: Vec<InventoryRecord> = store.get_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].left_count, 8);
        assert_eq!(all[0].total_amount, 4.0);
    }

    #[test]
    fn test_mark_synced_is_idempotent_and_ignores_unknown_ids() {
        let store = test_store();
        let t = store.put(Ticket::new("001", "s1", 1.0, 1.0)).unwrap();
        let ids = vec![t.id.clone(), "no-such-ticket".to_string()];

        assert_eq!(store.mark_synced(Collection::Tickets, &ids).unwrap(), 1);
        assert_eq!(store.mark_synced(Collection::Tickets, &ids).unwrap(), 0);

        let loaded: Ticket = store.get(&t.id).unwrap().unwrap();
        assert!(loaded.synced);
        assert!(store.get_unsynced::<Ticket>().is_empty());
    }

    #[test]
    fn test_put_rederives_inventory_fields() {
        let store = test_store();
        let mut rec = InventoryRecord::new("Gain", Some("s1".into()), 5.50, 1);
        rec.start_count = 10;
        rec.sold_count = 3;

        let stored = store.put(rec).unwrap();
        assert_eq!(stored.left_count, 7);
        assert_eq!(stored.total_amount, 16.5);

        let loaded: InventoryRecord = store.get(&stored.id).unwrap().unwrap();
        assert_eq!((loaded.left_count, loaded.total_amount), (7, 16.5));
    }

    #[test]
    fn test_put_rederives_ticket_and_session_totals() {
        let store = test_store();
        let mut ticket = Ticket::new("001", "s1", 1.0, 1.0);
        ticket.wash_amount = 4.0;
        assert_eq!(store.put(ticket).unwrap().total_amount, 5.0);

        let mut session = Session::new("emp-1", day());
        session.cash_started = 20.0;
        session.inventory_total = 10.0;
        let session = store.put(session).unwrap();
        assert_eq!(session.cash_total, 20.0);
        assert_eq!(session.grand_total, 10.0);
    }

    #[test]
    fn test_mark_synced_if_unchanged_skips_edited_rows() {
        let store = test_store();
        let a = store.put(Ticket::new("001", "s1", 1.0, 0.0)).unwrap();
        let b = store.put(Ticket::new("002", "s1", 2.0, 0.0)).unwrap();
        let uploaded = vec![(a.id.clone(), a.updated_at), (b.id.clone(), b.updated_at)];

        let mut edited = b.clone();
        edited.set_amounts(9.0, 0.0);
        store.put(edited).unwrap();

        assert_eq!(
            store
                .mark_synced_if_unchanged(Collection::Tickets, &uploaded)
                .unwrap(),
            1
        );
        assert!(store.get::<Ticket>(&a.id).unwrap().unwrap().synced);
        let b: Ticket = store.get(&b.id).unwrap().unwrap();
        assert!(!b.synced);
        assert_eq!(b.total_amount, 9.0);
    }

    #[test]
    fn test_confirm_session_requires_unchanged_row() {
        let store = test_store();
        let session = store.put(Session::new("emp-1", day())).unwrap();
        assert!(store.confirm_session(&session.id, &session.updated_at).unwrap());
        let loaded: Session = store.get(&session.id).unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Synced);
        assert!(loaded.synced);

        let mut edited = loaded.clone();
        edited.status = SessionStatus::Active;
        edited.notes = "recount".into();
        let edited = store.put(edited).unwrap();
        assert!(!store.confirm_session(&edited.id, &session.updated_at).unwrap());
        let loaded: Session = store.get(&session.id).unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Active);
        assert!(!loaded.synced);
    }

    #[test]
    fn test_cache_remote_stores_synced_rows() {
        let store = test_store();
        let profiles = vec![
            EmployeeProfile {
                id: "emp-2".into(),
                full_name: "Rosa".into(),
                email: String::new(),
                role: "employee".into(),
                synced: false,
            },
            EmployeeProfile {
                id: "emp-1".into(),
                full_name: "Ana".into(),
                email: "ana@example.com".into(),
                role: "admin".into(),
                synced: false,
            },
        ];
        assert_eq!(store.cache_remote(&profiles).unwrap(), 2);

        let all: Vec<EmployeeProfile> = store.get_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].full_name, "Ana");
        assert!(all.iter().all(|p| p.synced));
        assert_eq!(store.count_unsynced(Collection::Profiles).unwrap(), 0);
    }

    #[test]
    fn test_session_round_trip_keeps_date_and_status() {
        let store = test_store();
        let mut session = Session::new("emp-1", day());
        session.status = SessionStatus::Synced;
        session.notes = "drawer short 2.00".into();
        let stored = store.put(session).unwrap();

        let loaded: Session = store.get(&stored.id).unwrap().unwrap();
        assert_eq!(loaded.session_date, day());
        assert_eq!(loaded.status, SessionStatus::Synced);
        assert_eq!(loaded.notes, "drawer short 2.00");
    }

    #[test]
    fn test_timesheet_optional_clock_out() {
        let store = test_store();
        let entry = store
            .put(TimesheetEntry::clock_in("emp-1", Utc::now()))
            .unwrap();
        let loaded: TimesheetEntry = store.get(&entry.id).unwrap().unwrap();
        assert!(loaded.clock_out_time.is_none());
    }

    #[test]
    fn test_rekey_session_moves_child_rows() {
        let store = test_store();
        let session = store.put(Session::new("emp-1", day())).unwrap();
        let inv = store
            .put(InventoryRecord::new("Downy", Some(session.id.clone()), 5.5, 1))
            .unwrap();
        let ticket = store.put(Ticket::new("001", session.id.clone(), 3.0, 0.0)).unwrap();
        store
            .mark_synced(Collection::Tickets, &[ticket.id.clone()])
            .unwrap();

        store.rekey_session(&session.id, "fresh-id").unwrap();

        assert!(store.get::<Session>(&session.id).unwrap().is_none());
        assert!(store.get::<Session>("fresh-id").unwrap().is_some());
        let inv: InventoryRecord = store.get(&inv.id).unwrap().unwrap();
        assert_eq!(inv.session_id.as_deref(), Some("fresh-id"));
        let ticket: Ticket = store.get(&ticket.id).unwrap().unwrap();
        assert_eq!(ticket.session_id, "fresh-id");
        assert!(!ticket.synced);
    }

    #[test]
    fn test_rekey_unknown_session_is_not_found() {
        let store = test_store();
        let err = store.rekey_session("missing", "other").unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn test_unavailable_store_degrades_reads_and_fails_writes() {
        let store = LocalStore::unavailable("disk unplugged");
        assert!(!store.is_available());
        assert!(store.get_all::<Ticket>().is_empty());
        assert!(store.get_unsynced::<Session>().is_empty());

        let err = store.put(Ticket::new("001", "s1", 1.0, 0.0)).unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.load_all::<Ticket>().is_err());
    }

    #[test]
    fn test_events_follow_commits() {
        let store = test_store();
        let mut rx = store.subscribe();
        let t = store.put(Ticket::new("001", "s1", 1.0, 0.0)).unwrap();

        match rx.try_recv().unwrap() {
            StoreEvent::Written { collection, ids } => {
                assert_eq!(collection, Collection::Tickets);
                assert_eq!(ids, vec![t.id.clone()]);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        store.mark_synced(Collection::Tickets, &[t.id.clone()]).unwrap();
        assert!(matches!(rx.try_recv().unwrap(), StoreEvent::Synced { .. }));
    }

    #[test]
    fn test_on_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = LocalStore::open(dir.path());
            assert!(store.is_available());
            store.put(Session::new("emp-1", day())).unwrap().id
        };

        let store = LocalStore::open(dir.path());
        let loaded: Option<Session> = store.get(&id).unwrap();
        assert!(loaded.is_some());
    }
}
