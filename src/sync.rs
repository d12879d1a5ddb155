//! Save / sync workflow for the laundromat terminal.
//!
//! Nothing leaves the terminal until an employee presses save. A save runs
//! exactly one of two phases:
//!
//! - **Bootstrap** (remote wins): the local caches look untouched, so the
//!   roster and the inventory history are downloaded.
//! - **Upload** (local wins): the session, its inventory and tickets, and
//!   pending timesheets are pushed to the backend.
//!
//! When the connectivity check fails the save is recorded locally with a
//! note on the session and no request is made at all.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::params;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::SyncSettings;
use crate::error::{RemoteError, SyncError};
use crate::models::{Collection, EmployeeProfile, InventoryRecord, Ticket, TimesheetEntry};
use crate::reconcile;
use crate::remote::{decode_rows, to_row, Connectivity, RemoteBackend, RemoteTable};
use crate::session::SessionManager;
use crate::store::{LocalStore, Record};

const EVENT_CHANNEL_CAPACITY: usize = 32;

// ---------------------------------------------------------------------------
// Outcomes and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Bootstrap,
    Upload,
}

/// What a bootstrap download brought in. Fetch failures are listed in
/// `errors` and leave the corresponding local data untouched.
#[derive(Debug, Clone, Default)]
pub struct BootstrapReport {
    pub profiles_cached: usize,
    pub inventory_cached: usize,
    /// Reconciled inventory to display after the download.
    pub inventory_view: Vec<InventoryRecord>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub session_id: String,
    pub inventory_uploaded: usize,
    pub tickets_uploaded: usize,
    pub ticket_batches: usize,
    pub timesheets_inserted: usize,
    pub timesheets_updated: usize,
}

#[derive(Debug, Clone)]
pub enum SaveOutcome {
    Bootstrapped(BootstrapReport),
    Uploaded(UploadReport),
    /// Offline: everything stays local, the session carries a note.
    SavedLocally { session_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Started { employee_id: String },
    PhaseChosen(SyncPhase),
    SavedLocally { session_id: String },
    Finished(SyncPhase),
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub is_running: bool,
    pub last_sync: Option<DateTime<Utc>>,
    /// Result of the most recent connectivity check, if any.
    pub last_online: Option<bool>,
    pub pending: Vec<(Collection, usize)>,
}

// ---------------------------------------------------------------------------
// Sync engine state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SyncState {
    is_running: AtomicBool,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    last_online: Mutex<Option<bool>>,
}

/// Clears the running flag when the save returns, however it returns.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn upload_failure(operation: &str, err: RemoteError) -> SyncError {
    SyncError::RemoteRejected {
        operation: operation.to_string(),
        message: err.to_string(),
    }
}

fn encode_all<R: Record>(operation: &str, records: &[R]) -> Result<Vec<serde_json::Value>, SyncError> {
    records
        .iter()
        .map(|r| to_row(r).map_err(|e| upload_failure(operation, e)))
        .collect()
}

/// (id, updated_at) of each uploaded row, for the conditional sync mark.
fn versions<'a, I>(records: I) -> Vec<(String, DateTime<Utc>)>
where
    I: IntoIterator<Item = (&'a String, &'a DateTime<Utc>)>,
{
    records
        .into_iter()
        .map(|(id, at)| (id.clone(), *at))
        .collect()
}

pub struct SyncOrchestrator {
    store: LocalStore,
    sessions: Arc<SessionManager>,
    remote: Arc<dyn RemoteBackend>,
    connectivity: Arc<dyn Connectivity>,
    settings: SyncSettings,
    state: SyncState,
    employee_names: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncOrchestrator {
    pub fn new(
        store: LocalStore,
        sessions: Arc<SessionManager>,
        remote: Arc<dyn RemoteBackend>,
        connectivity: Arc<dyn Connectivity>,
        settings: SyncSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            sessions,
            remote,
            connectivity,
            settings,
            state: SyncState::default(),
            employee_names: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SyncStatus {
        let pending = Collection::ALL
            .iter()
            .filter(|c| **c != Collection::Profiles)
            .map(|c| (*c, self.store.count_unsynced(*c).unwrap_or(0)))
            .collect();
        SyncStatus {
            is_running: self.is_running(),
            last_sync: self.state.last_sync.lock().ok().and_then(|g| *g),
            last_online: self.state.last_online.lock().ok().and_then(|g| *g),
            pending,
        }
    }

    /// Cached employee id to name projection. Filled from the local roster
    /// on first use.
    pub fn employee_names(&self) -> HashMap<String, String> {
        let Ok(mut names) = self.employee_names.lock() else {
            return HashMap::new();
        };
        if names.is_empty() {
            names.extend(
                self.store
                    .get_all::<EmployeeProfile>()
                    .into_iter()
                    .map(|p| (p.id, p.full_name)),
            );
        }
        names.clone()
    }

    fn cache_names(&self, profiles: &[EmployeeProfile]) {
        if let Ok(mut names) = self.employee_names.lock() {
            names.clear();
            names.extend(profiles.iter().map(|p| (p.id.clone(), p.full_name.clone())));
        }
    }

    fn set_last_online(&self, online: bool) {
        if let Ok(mut last) = self.state.last_online.lock() {
            *last = Some(online);
        }
    }

    fn set_last_sync(&self, at: DateTime<Utc>) {
        if let Ok(mut last) = self.state.last_sync.lock() {
            *last = Some(at);
        }
    }

    // -----------------------------------------------------------------------
    // Save
    // -----------------------------------------------------------------------

    /// Run one explicit save for `employee_id` on `date`.
    ///
    /// A save already in progress is not queued: the call returns
    /// [`SyncError::SaveInProgress`].
    pub async fn save(&self, employee_id: &str, date: NaiveDate) -> Result<SaveOutcome, SyncError> {
        if self
            .state
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Save requested while another save is running");
            return Err(SyncError::SaveInProgress);
        }
        let _running = RunningGuard(&self.state.is_running);

        self.emit(SyncEvent::Started {
            employee_id: employee_id.to_string(),
        });

        match self.run_save(employee_id, date).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(employee_id = %employee_id, "Save failed: {e}");
                self.emit(SyncEvent::Failed {
                    message: e.user_message(),
                });
                Err(e)
            }
        }
    }

    async fn run_save(&self, employee_id: &str, date: NaiveDate) -> Result<SaveOutcome, SyncError> {
        self.store.ensure_available()?;

        match self.require_online().await {
            Ok(()) => {}
            Err(SyncError::NetworkUnreachable) => return self.save_offline(employee_id, date),
            Err(e) => return Err(e),
        }

        let profiles: Vec<EmployeeProfile> = self.store.load_all()?;
        let inventory: Vec<InventoryRecord> = self.store.load_all()?;

        if self.looks_untouched(&profiles, &inventory)? {
            self.emit(SyncEvent::PhaseChosen(SyncPhase::Bootstrap));
            let report = self.bootstrap(&profiles, &inventory).await;
            if report.errors.is_empty() {
                self.set_last_sync(Utc::now());
            }
            self.emit(SyncEvent::Finished(SyncPhase::Bootstrap));
            return Ok(SaveOutcome::Bootstrapped(report));
        }

        self.emit(SyncEvent::PhaseChosen(SyncPhase::Upload));
        let report = self.upload(employee_id, date).await?;
        self.set_last_sync(Utc::now());
        self.emit(SyncEvent::Finished(SyncPhase::Upload));
        Ok(SaveOutcome::Uploaded(report))
    }

    /// Connectivity check at phase start. Offline is reported as
    /// [`SyncError::NetworkUnreachable`], which the save turns into a local
    /// save rather than a failure.
    async fn require_online(&self) -> Result<(), SyncError> {
        let online = self.connectivity.is_online().await;
        self.set_last_online(online);
        if online {
            Ok(())
        } else {
            Err(SyncError::NetworkUnreachable)
        }
    }

    /// Caches are untouched when the roster is empty or inventory has never
    /// been counted, and there is no pending local work to push.
    fn looks_untouched(
        &self,
        profiles: &[EmployeeProfile],
        inventory: &[InventoryRecord],
    ) -> Result<bool, SyncError> {
        if !profiles.is_empty() && !reconcile::is_bootstrap_state(inventory) {
            return Ok(false);
        }
        for collection in [
            Collection::Sessions,
            Collection::Inventory,
            Collection::Tickets,
            Collection::Timesheets,
        ] {
            if self.store.count_unsynced(collection)? > 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn save_offline(&self, employee_id: &str, date: NaiveDate) -> Result<SaveOutcome, SyncError> {
        let session = self.sessions.resolve(employee_id, date)?;
        let note = format!(
            "[offline save {}] changes saved locally; sync pending",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let session = self.sessions.edit(&session.id, |s| s.append_note(&note))?;

        info!(session_id = %session.id, "Offline, save kept local");
        self.emit(SyncEvent::SavedLocally {
            session_id: session.id.clone(),
        });
        Ok(SaveOutcome::SavedLocally {
            session_id: session.id,
        })
    }

    // -----------------------------------------------------------------------
    // Bootstrap phase
    // -----------------------------------------------------------------------

    async fn bootstrap(
        &self,
        profiles: &[EmployeeProfile],
        inventory: &[InventoryRecord],
    ) -> BootstrapReport {
        let mut report = BootstrapReport::default();

        if profiles.is_empty() {
            match self.remote.fetch_all(RemoteTable::Employees).await {
                Ok(rows) => {
                    let fetched: Vec<EmployeeProfile> = decode_rows(RemoteTable::Employees, rows);
                    match self.store.cache_remote(&fetched) {
                        Ok(n) => {
                            report.profiles_cached = n;
                            self.cache_names(&fetched);
                        }
                        Err(e) => report.errors.push(format!("store employees: {e}")),
                    }
                }
                Err(e) => report.errors.push(format!("fetch employees: {e}")),
            }
        } else {
            self.cache_names(profiles);
        }

        if !reconcile::is_bootstrap_state(inventory) {
            report.inventory_view = reconcile::current_state(inventory);
        } else {
            match self.remote.fetch_all(RemoteTable::InventoryItems).await {
                Ok(rows) => {
                    let fetched: Vec<InventoryRecord> =
                        decode_rows(RemoteTable::InventoryItems, rows);
                    match self.store.cache_remote(&fetched) {
                        Ok(n) => report.inventory_cached = n,
                        Err(e) => report.errors.push(format!("store inventory: {e}")),
                    }

                    let history = self.store.get_all::<InventoryRecord>();
                    let master: Vec<InventoryRecord> =
                        fetched.into_iter().filter(|r| r.is_template()).collect();
                    report.inventory_view = if master.is_empty() {
                        reconcile::current_state(&history)
                    } else {
                        reconcile::refresh_view(
                            &reconcile::current_state(inventory),
                            &history,
                            Ok(master),
                        )
                    };
                }
                Err(e) => {
                    report.errors.push(format!("fetch inventory: {e}"));
                    report.inventory_view =
                        reconcile::refresh_view(&reconcile::current_state(inventory), inventory, Err(e));
                }
            }
        }

        if report.errors.is_empty() {
            info!(
                profiles = report.profiles_cached,
                inventory = report.inventory_cached,
                "Bootstrap download complete"
            );
        } else {
            warn!(errors = ?report.errors, "Bootstrap download incomplete");
        }
        report
    }

    // -----------------------------------------------------------------------
    // Upload phase
    // -----------------------------------------------------------------------

    async fn upload(&self, employee_id: &str, date: NaiveDate) -> Result<UploadReport, SyncError> {
        let session = self.sessions.resolve(employee_id, date)?;
        let session = self.sessions.refresh_totals(&session.id)?;
        let session = self.sessions.commit(self.remote.as_ref(), session).await?;

        let mut report = UploadReport {
            session_id: session.id.clone(),
            ..UploadReport::default()
        };

        report.inventory_uploaded = self.upload_inventory(&session.id).await?;
        let (uploaded, batches) = self.upload_tickets(&session.id).await?;
        report.tickets_uploaded = uploaded;
        report.ticket_batches = batches;
        let (inserted, updated) = self.upload_timesheets().await?;
        report.timesheets_inserted = inserted;
        report.timesheets_updated = updated;

        if !self
            .store
            .confirm_session(&session.id, &session.updated_at)?
        {
            warn!(
                session_id = %session.id,
                "Session edited during upload, left pending for the next save"
            );
        }

        info!(
            session_id = %report.session_id,
            inventory = report.inventory_uploaded,
            tickets = report.tickets_uploaded,
            timesheets = report.timesheets_inserted + report.timesheets_updated,
            "Upload complete"
        );
        Ok(report)
    }

    async fn upload_inventory(&self, session_id: &str) -> Result<usize, SyncError> {
        let pending: Vec<InventoryRecord> = self
            .store
            .load_where("synced = 0 AND session_id = ?1", params![session_id])?;
        if pending.is_empty() {
            return Ok(0);
        }

        let rows = encode_all("inventory upload", &pending)?;
        self.remote
            .upsert(RemoteTable::InventoryItems, rows)
            .await
            .map_err(|e| upload_failure("inventory upload", e))?;
        self.store.mark_synced_if_unchanged(
            Collection::Inventory,
            &versions(pending.iter().map(|r| (&r.id, &r.updated_at))),
        )?;
        debug!(session_id = %session_id, count = pending.len(), "Inventory uploaded");
        Ok(pending.len())
    }

    /// Upload tickets in batches. The first failing batch stops the upload;
    /// earlier batches stay synced.
    async fn upload_tickets(&self, session_id: &str) -> Result<(usize, usize), SyncError> {
        let pending: Vec<Ticket> = self
            .store
            .load_where("synced = 0 AND session_id = ?1", params![session_id])?;
        if pending.is_empty() {
            return Ok((0, 0));
        }

        let batch_size = self.settings.ticket_batch_size.max(1);
        let batch_count = pending.len().div_ceil(batch_size);
        let mut synced = 0;

        for (index, batch) in pending.chunks(batch_size).enumerate() {
            let rows = encode_all("ticket upload", batch)?;
            match self.remote.upsert(RemoteTable::Tickets, rows).await {
                Ok(()) => {
                    self.store.mark_synced_if_unchanged(
                        Collection::Tickets,
                        &versions(batch.iter().map(|t| (&t.id, &t.updated_at))),
                    )?;
                    synced += batch.len();
                }
                Err(e) => {
                    warn!(
                        session_id = %session_id,
                        batch = index,
                        of = batch_count,
                        "Ticket batch failed: {e}"
                    );
                    return Err(SyncError::PartialBatchFailure {
                        failed_batches: vec![index],
                        skipped_batches: (index + 1..batch_count).collect(),
                        synced_tickets: synced,
                    });
                }
            }
        }

        Ok((synced, batch_count))
    }

    /// Update entries the backend already has, insert the rest.
    async fn upload_timesheets(&self) -> Result<(usize, usize), SyncError> {
        let pending: Vec<TimesheetEntry> = self.store.load_unsynced()?;
        let mut inserted = 0;
        let mut updated = 0;

        for entry in &pending {
            let row = to_row(entry).map_err(|e| upload_failure("timesheet upload", e))?;
            let existing = self
                .remote
                .fetch_where(RemoteTable::Timesheets, "id", &entry.id)
                .await
                .map_err(|e| upload_failure("timesheet lookup", e))?;

            if existing.is_empty() {
                self.remote
                    .insert(RemoteTable::Timesheets, vec![row])
                    .await
                    .map_err(|e| upload_failure("timesheet insert", e))?;
                inserted += 1;
            } else {
                self.remote
                    .update(RemoteTable::Timesheets, &entry.id, row)
                    .await
                    .map_err(|e| upload_failure("timesheet update", e))?;
                updated += 1;
            }
            self.store.mark_synced_if_unchanged(
                Collection::Timesheets,
                &[(entry.id.clone(), entry.updated_at)],
            )?;
        }

        Ok((inserted, updated))
    }
}
