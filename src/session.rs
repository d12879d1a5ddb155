//! Shift sessions.
//!
//! One employee's working day is one session. There is at most one
//! non-completed session per (employee, date); every employee-side edit
//! returns it to `active` and clears its sync flag. Completion is an
//! administrative action and freezes the session for the terminal.

use chrono::NaiveDate;
use rusqlite::params;
use tracing::{info, warn};

use crate::error::{StoreError, SyncError};
use crate::models::{round2, Collection, InventoryRecord, Session, SessionStatus, Ticket};
use crate::reconcile;
use crate::remote::{to_row, RemoteBackend, RemoteTable};
use crate::store::LocalStore;

const OPEN_SESSION_CLAUSE: &str =
    "employee_id = ?1 AND session_date = ?2 AND status != 'completed'";

fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub struct SessionManager {
    store: LocalStore,
    conflict_retries: u32,
}

impl SessionManager {
    pub fn new(store: LocalStore, conflict_retries: u32) -> Self {
        Self {
            store,
            conflict_retries,
        }
    }

    /// The open session for the pair, if any.
    pub fn find_open(
        &self,
        employee_id: &str,
        date: NaiveDate,
    ) -> Result<Option<Session>, SyncError> {
        let mut open: Vec<Session> = self
            .store
            .load_where(OPEN_SESSION_CLAUSE, params![employee_id, date_key(date)])?;
        Ok(open.pop())
    }

    /// Return the open session for (employee, date), creating and persisting
    /// a fresh one when none exists. Repeated calls return the same id.
    pub fn resolve(&self, employee_id: &str, date: NaiveDate) -> Result<Session, SyncError> {
        if let Some(existing) = self.find_open(employee_id, date)? {
            return Ok(existing);
        }
        let session = self.store.put(Session::new(employee_id, date))?;
        info!(
            session_id = %session.id,
            employee_id = %employee_id,
            date = %date,
            "Opened new session"
        );
        Ok(session)
    }

    fn load(&self, session_id: &str) -> Result<Session, SyncError> {
        self.store.get::<Session>(session_id)?.ok_or_else(|| {
            SyncError::from(StoreError::NotFound {
                collection: Collection::Sessions,
                id: session_id.to_string(),
            })
        })
    }

    /// Apply an employee-side edit (cash counts, notes) and persist it.
    /// Identity and status are not editable through here.
    pub fn edit(
        &self,
        session_id: &str,
        apply: impl FnOnce(&mut Session),
    ) -> Result<Session, SyncError> {
        let original = self.load(session_id)?;
        if original.is_completed() {
            return Err(SyncError::SessionCompleted(original.id));
        }

        let mut session = original.clone();
        apply(&mut session);
        session.id = original.id;
        session.employee_id = original.employee_id;
        session.session_date = original.session_date;
        session.created_at = original.created_at;
        session.status = SessionStatus::Active;
        session.recompute_totals();

        Ok(self.store.put(session)?)
    }

    /// Recompute inventory, wash/dry and grand totals from local rows.
    pub fn refresh_totals(&self, session_id: &str) -> Result<Session, SyncError> {
        let mut session = self.load(session_id)?;
        if session.is_completed() {
            return Err(SyncError::SessionCompleted(session.id));
        }

        let inventory: Vec<InventoryRecord> = self
            .store
            .load_where("session_id = ?1", params![session_id])?;
        let tickets: Vec<Ticket> = self
            .store
            .load_where("session_id = ?1", params![session_id])?;

        let inventory_total = reconcile::inventory_total(&reconcile::session_view(
            &inventory, session_id,
        ));
        let wash_dry_total = round2(tickets.iter().map(|t| t.total_amount).sum());

        if session.inventory_total == inventory_total && session.wash_dry_total == wash_dry_total {
            return Ok(session);
        }

        session.inventory_total = inventory_total;
        session.wash_dry_total = wash_dry_total;
        session.status = SessionStatus::Active;
        session.recompute_totals();
        Ok(self.store.put(session)?)
    }

    /// Administrative close. Idempotent.
    pub fn complete(&self, session_id: &str) -> Result<Session, SyncError> {
        let mut session = self.load(session_id)?;
        if session.is_completed() {
            return Ok(session);
        }
        session.status = SessionStatus::Completed;
        let session = self.store.put(session)?;
        info!(session_id = %session.id, "Session completed");
        Ok(session)
    }

    /// Resolve the incoming employee's session and, when it has no inventory
    /// yet, seed it from reconciled history so remaining stock carries over.
    pub fn switch_employee(&self, employee_id: &str, date: NaiveDate) -> Result<Session, SyncError> {
        let session = self.resolve(employee_id, date)?;

        let own: Vec<InventoryRecord> = self
            .store
            .load_where("session_id = ?1", params![session.id])?;
        if !own.is_empty() {
            return Ok(session);
        }

        let history: Vec<InventoryRecord> = self.store.load_all()?;
        let seeded = reconcile::seed_session(&reconcile::current_state(&history), &session.id);
        if seeded.is_empty() {
            return Ok(session);
        }
        let count = seeded.len();
        self.store.put_many(seeded)?;
        info!(
            session_id = %session.id,
            employee_id = %employee_id,
            items = count,
            "Seeded session inventory from previous stock"
        );

        self.refresh_totals(&session.id)
    }

    /// Upsert the session remotely. An identifier collision moves the local
    /// session to a fresh id and retries, up to the configured retry count.
    pub async fn commit(
        &self,
        remote: &dyn RemoteBackend,
        mut session: Session,
    ) -> Result<Session, SyncError> {
        let attempts = self.conflict_retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let row = to_row(&session).map_err(|e| SyncError::from_remote("session upsert", e))?;
            let Err(err) = remote.upsert(RemoteTable::Sessions, vec![row]).await else {
                info!(session_id = %session.id, attempt, "Session committed");
                return Ok(session);
            };

            match SyncError::from_remote("session upsert", err) {
                SyncError::RemoteConflict(message) if attempt < attempts => {
                    let new_id = uuid::Uuid::new_v4().to_string();
                    warn!(
                        old_id = %session.id,
                        new_id = %new_id,
                        attempt,
                        "Session id collides with a different remote session: {message}"
                    );
                    self.store.rekey_session(&session.id, &new_id)?;
                    session = self.load(&new_id)?;
                }
                SyncError::RemoteConflict(message) => {
                    return Err(SyncError::RemoteRejected {
                        operation: "session upsert".to_string(),
                        message: format!(
                            "identifier collision persisted after {attempts} attempts: {message}"
                        ),
                    });
                }
                other => return Err(other),
            }
        }
    }
}
