//! Laundromat POS - offline-first terminal core
//!
//! Everything an employee does at the terminal (inventory counts, wash/dry
//! tickets, cash, clock in/out) is written to the local SQLite store first.
//! The backend only sees it when the employee presses save, through
//! [`sync::SyncOrchestrator::save`].
//!
//! [`Terminal`] wires the pieces together once at process start.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod models;
pub mod reconcile;
pub mod remote;
pub mod session;
pub mod storage;
pub mod store;
pub mod sync;
pub mod tickets;
pub mod timesheet;

pub use config::SyncSettings;
pub use error::{RemoteError, StoreError, SyncError};
pub use models::{
    Collection, EmployeeProfile, InventoryRecord, Session, SessionStatus, Ticket, TimesheetEntry,
};
pub use remote::{Connectivity, HttpBackend, RemoteBackend, RemoteTable, StaticConnectivity};
pub use session::SessionManager;
pub use store::{LocalStore, StoreEvent};
pub use sync::{SaveOutcome, SyncEvent, SyncOrchestrator, SyncStatus};
pub use tickets::TicketSequencer;

/// Process-wide context: one store, the managers built on it and the sync
/// engine. Build it once at startup and pass it by reference.
pub struct Terminal {
    pub store: LocalStore,
    pub sessions: Arc<SessionManager>,
    pub tickets: TicketSequencer,
    pub sync: SyncOrchestrator,
    pub settings: SyncSettings,
    data_dir: PathBuf,
    log_guard: Option<WorkerGuard>,
}

impl Terminal {
    /// Production startup: logging, the store under [`config::data_dir`],
    /// and the HTTP backend from the stored credentials.
    ///
    /// Never fails. Without usable credentials every save stays local; an
    /// unreadable database leaves the store in degraded mode.
    pub fn start() -> Self {
        let data_dir = config::data_dir();
        let guard = diagnostics::init_logging(&diagnostics::get_log_dir(&data_dir));

        info!(
            "Starting Laundromat POS v{} ({})",
            env!("CARGO_PKG_VERSION"),
            env!("BUILD_GIT_SHA")
        );

        let store = LocalStore::open(&data_dir);
        let settings = SyncSettings::load(&store);

        let (remote, connectivity): (Arc<dyn RemoteBackend>, Arc<dyn Connectivity>) =
            match storage::BackendCredentials::load() {
                Some(creds) => match HttpBackend::new(&creds, &settings) {
                    Ok(http) => {
                        let http = Arc::new(http);
                        let remote: Arc<dyn RemoteBackend> = http.clone();
                        let connectivity: Arc<dyn Connectivity> = http;
                        (remote, connectivity)
                    }
                    Err(e) => {
                        warn!("Backend disabled, saves stay local: {e}");
                        unconfigured()
                    }
                },
                None => {
                    warn!("Terminal not configured, saves stay local");
                    unconfigured()
                }
            };

        let mut terminal = Self::assemble(data_dir, store, settings, remote, connectivity);
        terminal.log_guard = Some(guard);
        terminal
    }

    /// Open a terminal over `data_dir` with an explicit backend. Does not
    /// install logging.
    pub fn open(
        data_dir: &Path,
        remote: Arc<dyn RemoteBackend>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Self {
        let store = LocalStore::open(data_dir);
        let settings = SyncSettings::load(&store);
        Self::assemble(data_dir.to_path_buf(), store, settings, remote, connectivity)
    }

    fn assemble(
        data_dir: PathBuf,
        store: LocalStore,
        settings: SyncSettings,
        remote: Arc<dyn RemoteBackend>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            settings.session_conflict_retries,
        ));
        let tickets = TicketSequencer::new(store.clone());
        let sync = SyncOrchestrator::new(
            store.clone(),
            sessions.clone(),
            remote,
            connectivity,
            settings.clone(),
        );

        Self {
            store,
            sessions,
            tickets,
            sync,
            settings,
            data_dir,
            log_guard: None,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Tear down in order. Dropping the log guard last flushes the file
    /// writer.
    pub fn shutdown(self) {
        info!(data_dir = %self.data_dir.display(), "Shutting down terminal");
        let Terminal {
            store,
            sessions,
            tickets,
            sync,
            log_guard,
            ..
        } = self;
        drop(sync);
        drop(tickets);
        drop(sessions);
        drop(store);
        drop(log_guard);
    }
}

fn unconfigured() -> (Arc<dyn RemoteBackend>, Arc<dyn Connectivity>) {
    (
        Arc::new(remote::Unconfigured),
        Arc::new(StaticConnectivity::new(false)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::FakeRemote;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn test_terminal_offline_day_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let day = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let remote = Arc::new(FakeRemote::new());

        let session_id = {
            let terminal = Terminal::open(
                dir.path(),
                remote.clone(),
                Arc::new(StaticConnectivity::new(false)),
            );
            assert_eq!(terminal.data_dir(), dir.path());

            let session = terminal.sessions.resolve("emp-1", day).unwrap();
            terminal.tickets.record_ticket(&session.id, 4.0, 3.0).unwrap();
            timesheet::clock_in(&terminal.store, "emp-1", chrono::Utc::now()).unwrap();

            let outcome = terminal.sync.save("emp-1", day).await.unwrap();
            assert!(matches!(outcome, SaveOutcome::SavedLocally { .. }));
            terminal.shutdown();
            session.id
        };

        assert!(remote.calls().is_empty());

        let terminal = Terminal::open(
            dir.path(),
            remote.clone(),
            Arc::new(StaticConnectivity::new(false)),
        );
        let session = terminal.sessions.resolve("emp-1", day).unwrap();
        assert_eq!(session.id, session_id);
        assert_eq!(terminal.store.get_unsynced::<Ticket>().len(), 1);
        let status = terminal.sync.status();
        assert!(status
            .pending
            .contains(&(Collection::Timesheets, 1)));
    }

    #[tokio::test]
    async fn test_unconfigured_backend_keeps_saves_local() {
        let dir = tempfile::tempdir().unwrap();
        let (remote, connectivity) = unconfigured();
        let terminal = Terminal::open(dir.path(), remote, connectivity);

        let day = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let outcome = terminal.sync.save("emp-1", day).await.unwrap();
        assert!(matches!(outcome, SaveOutcome::SavedLocally { .. }));
    }
}
