//! Remote backend client.
//!
//! The dashboard exposes its tables over a PostgREST-style REST endpoint
//! (`{base}/rest/v1/{table}`). The sync engine talks to it only through the
//! [`RemoteBackend`] and [`Connectivity`] traits so tests can script the
//! backend without a network.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SyncSettings;
use crate::error::RemoteError;
use crate::storage::BackendCredentials;

/// Postgres unique-violation SQLSTATE.
const PG_UNIQUE_VIOLATION: &str = "23505";

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteTable {
    Employees,
    InventoryItems,
    Tickets,
    Sessions,
    Timesheets,
}

impl RemoteTable {
    pub fn name(self) -> &'static str {
        match self {
            RemoteTable::Employees => "employees",
            RemoteTable::InventoryItems => "inventory_items",
            RemoteTable::Tickets => "tickets",
            RemoteTable::Sessions => "sessions",
            RemoteTable::Timesheets => "timesheets",
        }
    }
}

impl fmt::Display for RemoteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Table-like access to the remote backend. Rows travel as JSON objects
/// whose keys match the local record field names.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn fetch_all(&self, table: RemoteTable) -> Result<Vec<Value>, RemoteError>;

    /// Rows whose `column` equals `value`.
    async fn fetch_where(
        &self,
        table: RemoteTable,
        column: &str,
        value: &str,
    ) -> Result<Vec<Value>, RemoteError>;

    async fn insert(&self, table: RemoteTable, rows: Vec<Value>) -> Result<(), RemoteError>;

    async fn update(&self, table: RemoteTable, id: &str, row: Value) -> Result<(), RemoteError>;

    async fn delete(&self, table: RemoteTable, id: &str) -> Result<(), RemoteError>;

    /// Insert or merge rows by `id`. A uniqueness violation is reported as
    /// [`RemoteError::Conflict`].
    async fn upsert(&self, table: RemoteTable, rows: Vec<Value>) -> Result<(), RemoteError>;
}

/// Online/offline signal checked at the start of every save.
#[async_trait]
pub trait Connectivity: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// A fixed connectivity answer, switchable at runtime.
#[derive(Debug)]
pub struct StaticConnectivity {
    online: AtomicBool,
}

impl StaticConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connectivity for StaticConnectivity {
    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Backend used before the terminal has credentials. Every call fails as
/// unreachable; paired with an offline connectivity signal it is never hit.
#[derive(Debug, Default)]
pub struct Unconfigured;

#[async_trait]
impl RemoteBackend for Unconfigured {
    async fn fetch_all(&self, _table: RemoteTable) -> Result<Vec<Value>, RemoteError> {
        Err(not_configured())
    }

    async fn fetch_where(
        &self,
        _table: RemoteTable,
        _column: &str,
        _value: &str,
    ) -> Result<Vec<Value>, RemoteError> {
        Err(not_configured())
    }

    async fn insert(&self, _table: RemoteTable, _rows: Vec<Value>) -> Result<(), RemoteError> {
        Err(not_configured())
    }

    async fn update(&self, _table: RemoteTable, _id: &str, _row: Value) -> Result<(), RemoteError> {
        Err(not_configured())
    }

    async fn delete(&self, _table: RemoteTable, _id: &str) -> Result<(), RemoteError> {
        Err(not_configured())
    }

    async fn upsert(&self, _table: RemoteTable, _rows: Vec<Value>) -> Result<(), RemoteError> {
        Err(not_configured())
    }
}

fn not_configured() -> RemoteError {
    RemoteError::Unreachable("backend credentials are not configured".to_string())
}

// ---------------------------------------------------------------------------
// Row encoding
// ---------------------------------------------------------------------------

pub fn to_row<R: Serialize>(record: &R) -> Result<Value, RemoteError> {
    serde_json::to_value(record).map_err(|e| RemoteError::Decode(e.to_string()))
}

/// Decode remote rows, skipping (and logging) rows that do not fit `R`.
pub fn decode_rows<R: DeserializeOwned>(table: RemoteTable, rows: Vec<Value>) -> Vec<R> {
    let total = rows.len();
    let decoded: Vec<R> = rows
        .into_iter()
        .filter_map(|row| match serde_json::from_value(row) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(table = %table, "Skipping malformed remote row: {e}");
                None
            }
        })
        .collect();
    if decoded.len() < total {
        warn!(
            table = %table,
            skipped = total - decoded.len(),
            "Some remote rows could not be decoded"
        );
    }
    decoded
}

// ---------------------------------------------------------------------------
// URL normalisation and error mapping
// ---------------------------------------------------------------------------

/// Normalise the backend URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
pub fn normalize_backend_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - "/rest/v1".len());
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Convert a `reqwest::Error` into a readable message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach backend at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid backend URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Backend table not found".to_string(),
        s if s >= 500 => format!("Backend server error (HTTP {s})"),
        s => format!("Unexpected response from backend (HTTP {s})"),
    }
}

/// Map a non-success response to a [`RemoteError`]. HTTP 409 or a Postgres
/// unique violation in the body is a conflict.
pub(crate) fn classify_failure(status: StatusCode, body: &str) -> RemoteError {
    let json = serde_json::from_str::<Value>(body).ok();
    let code = json
        .as_ref()
        .and_then(|v| v.get("code"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let message = json
        .as_ref()
        .and_then(|v| v.get("message").or_else(|| v.get("error")))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| status_error(status));

    if status == StatusCode::CONFLICT || code == PG_UNIQUE_VIOLATION {
        return RemoteError::Conflict(message);
    }

    let details = json
        .as_ref()
        .and_then(|v| v.get("details").or_else(|| v.get("hint")))
        .and_then(Value::as_str)
        .filter(|d| !d.trim().is_empty());
    let message = match details {
        Some(d) => format!("{message}: {d}"),
        None if json.is_none() && !body.trim().is_empty() => {
            format!("{message}: {}", body.trim())
        }
        None => message,
    };

    RemoteError::Rejected {
        status: status.as_u16(),
        message,
    }
}

// ---------------------------------------------------------------------------
// HTTP backend
// ---------------------------------------------------------------------------

/// [`RemoteBackend`] over reqwest.
pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: String,
    terminal_id: String,
    check_timeout: Duration,
}

impl HttpBackend {
    pub fn new(credentials: &BackendCredentials, settings: &SyncSettings) -> Result<Self, RemoteError> {
        let base_url = normalize_backend_url(&credentials.backend_url);
        Url::parse(&base_url)
            .map_err(|e| RemoteError::Unreachable(format!("Invalid backend URL {base_url}: {e}")))?;

        let client = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| RemoteError::Unreachable(format!("Failed to create HTTP client: {e}")))?;

        info!(backend = %base_url, "Remote backend configured");
        Ok(Self {
            client,
            base_url,
            api_key: credentials.api_key.clone(),
            terminal_id: credentials.terminal_id.clone(),
            check_timeout: settings.connectivity_timeout(),
        })
    }

    fn table_url(&self, table: RemoteTable, query: &[(&str, String)]) -> Result<Url, RemoteError> {
        let mut url = Url::parse(&format!("{}/rest/v1/{}", self.base_url, table.name()))
            .map_err(|e| RemoteError::Unreachable(format!("Invalid backend URL: {e}")))?;
        if !query.is_empty() {
            let mut qp = url.query_pairs_mut();
            for (k, v) in query {
                qp.append_pair(k, v);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("x-terminal-id", &self.terminal_id)
            .header("Content-Type", "application/json")
    }

    /// Send and return the response body (empty for 201/204).
    async fn send(&self, req: RequestBuilder, table: RemoteTable) -> Result<String, RemoteError> {
        let resp = req
            .send()
            .await
            .map_err(|e| RemoteError::Unreachable(friendly_error(&self.base_url, &e)))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let err = classify_failure(status, &body);
            warn!(table = %table, status = status.as_u16(), "Backend request failed: {err}");
            return Err(err);
        }
        debug!(table = %table, status = status.as_u16(), "Backend request ok");
        Ok(body)
    }

    async fn get_rows(
        &self,
        table: RemoteTable,
        query: &[(&str, String)],
    ) -> Result<Vec<Value>, RemoteError> {
        let url = self.table_url(table, query)?;
        let body = self.send(self.request(Method::GET, url), table).await?;
        match serde_json::from_str::<Value>(&body) {
            Ok(Value::Array(rows)) => Ok(rows),
            Ok(other) => Err(RemoteError::Decode(format!(
                "expected an array from {table}, got {}",
                short_kind(&other)
            ))),
            Err(e) => Err(RemoteError::Decode(format!("Invalid JSON from {table}: {e}"))),
        }
    }
}

fn short_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn fetch_all(&self, table: RemoteTable) -> Result<Vec<Value>, RemoteError> {
        self.get_rows(table, &[("select", "*".to_string())]).await
    }

    async fn fetch_where(
        &self,
        table: RemoteTable,
        column: &str,
        value: &str,
    ) -> Result<Vec<Value>, RemoteError> {
        self.get_rows(
            table,
            &[("select", "*".to_string()), (column, format!("eq.{value}"))],
        )
        .await
    }

    async fn insert(&self, table: RemoteTable, rows: Vec<Value>) -> Result<(), RemoteError> {
        if rows.is_empty() {
            return Ok(());
        }
        let url = self.table_url(table, &[])?;
        let req = self
            .request(Method::POST, url)
            .header("Prefer", "return=minimal")
            .json(&Value::Array(rows));
        self.send(req, table).await.map(|_| ())
    }

    async fn update(&self, table: RemoteTable, id: &str, row: Value) -> Result<(), RemoteError> {
        let url = self.table_url(table, &[("id", format!("eq.{id}"))])?;
        let req = self
            .request(Method::PATCH, url)
            .header("Prefer", "return=minimal")
            .json(&row);
        self.send(req, table).await.map(|_| ())
    }

    async fn delete(&self, table: RemoteTable, id: &str) -> Result<(), RemoteError> {
        let url = self.table_url(table, &[("id", format!("eq.{id}"))])?;
        self.send(self.request(Method::DELETE, url), table)
            .await
            .map(|_| ())
    }

    async fn upsert(&self, table: RemoteTable, rows: Vec<Value>) -> Result<(), RemoteError> {
        if rows.is_empty() {
            return Ok(());
        }
        let url = self.table_url(table, &[("on_conflict", "id".to_string())])?;
        let req = self
            .request(Method::POST, url)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&Value::Array(rows));
        self.send(req, table).await.map(|_| ())
    }
}

#[async_trait]
impl Connectivity for HttpBackend {
    /// HEAD request against the REST root with a short timeout. Any answer
    /// below 500 counts as reachable.
    async fn is_online(&self) -> bool {
        let url = format!("{}/rest/v1/", self.base_url);
        match self
            .client
            .head(&url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(self.check_timeout)
            .send()
            .await
        {
            Ok(resp) => !resp.status().is_server_error(),
            Err(e) => {
                debug!("Connectivity check failed: {}", friendly_error(&self.base_url, &e));
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted backend for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        FetchAll(RemoteTable),
        FetchWhere(RemoteTable, String, String),
        Insert(RemoteTable, usize),
        Update(RemoteTable, String),
        Delete(RemoteTable, String),
        Upsert(RemoteTable, Vec<String>),
    }

    impl Call {
        pub fn table(&self) -> RemoteTable {
            match self {
                Call::FetchAll(t)
                | Call::FetchWhere(t, ..)
                | Call::Insert(t, _)
                | Call::Update(t, _)
                | Call::Delete(t, _)
                | Call::Upsert(t, _) => *t,
            }
        }

        pub fn is_write(&self) -> bool {
            matches!(self, Call::Insert(..) | Call::Upsert(..))
        }
    }

    /// In-memory backend that records every call.
    #[derive(Default)]
    pub struct FakeRemote {
        tables: Mutex<HashMap<RemoteTable, Vec<Value>>>,
        calls: Mutex<Vec<Call>>,
        upsert_conflicts: Mutex<u32>,
        failing_writes: Mutex<Vec<(RemoteTable, usize)>>,
        failing_fetches: Mutex<Vec<RemoteTable>>,
    }

    fn row_id(row: &Value) -> String {
        row.get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    impl FakeRemote {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed(&self, table: RemoteTable, rows: Vec<Value>) {
            self.tables.lock().unwrap().entry(table).or_default().extend(rows);
        }

        pub fn rows(&self, table: RemoteTable) -> Vec<Value> {
            self.tables
                .lock()
                .unwrap()
                .get(&table)
                .cloned()
                .unwrap_or_default()
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        /// The next `n` upserts answer with a conflict.
        pub fn conflict_next_upserts(&self, n: u32) {
            *self.upsert_conflicts.lock().unwrap() = n;
        }

        /// Fail the `nth` (0-based) insert or upsert call against `table`.
        pub fn fail_write_call(&self, table: RemoteTable, nth: usize) {
            self.failing_writes.lock().unwrap().push((table, nth));
        }

        /// Calls that wrote to `table`.
        pub fn writes(&self, table: RemoteTable) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.table() == table && c.is_write())
                .count()
        }

        /// Record `call` and apply any scripted write failure.
        fn record_write(&self, call: Call) -> Result<(), RemoteError> {
            let table = call.table();
            let nth = self.writes(table);
            self.record(call);
            if self.failing_writes.lock().unwrap().contains(&(table, nth)) {
                return Err(RemoteError::Rejected {
                    status: 500,
                    message: format!("{table} write failed"),
                });
            }
            Ok(())
        }

        pub fn fail_fetches(&self, table: RemoteTable) {
            self.failing_fetches.lock().unwrap().push(table);
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }

        fn check_fetch(&self, table: RemoteTable) -> Result<(), RemoteError> {
            if self.failing_fetches.lock().unwrap().contains(&table) {
                return Err(RemoteError::Rejected {
                    status: 503,
                    message: format!("{table} temporarily unavailable"),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteBackend for FakeRemote {
        async fn fetch_all(&self, table: RemoteTable) -> Result<Vec<Value>, RemoteError> {
            self.record(Call::FetchAll(table));
            self.check_fetch(table)?;
            Ok(self.rows(table))
        }

        async fn fetch_where(
            &self,
            table: RemoteTable,
            column: &str,
            value: &str,
        ) -> Result<Vec<Value>, RemoteError> {
            self.record(Call::FetchWhere(table, column.to_string(), value.to_string()));
            self.check_fetch(table)?;
            Ok(self
                .rows(table)
                .into_iter()
                .filter(|row| row.get(column).and_then(Value::as_str) == Some(value))
                .collect())
        }

        async fn insert(&self, table: RemoteTable, rows: Vec<Value>) -> Result<(), RemoteError> {
            self.record_write(Call::Insert(table, rows.len()))?;
            let mut tables = self.tables.lock().unwrap();
            let stored = tables.entry(table).or_default();
            for row in &rows {
                let id = row_id(row);
                if stored.iter().any(|r| row_id(r) == id) {
                    return Err(RemoteError::Conflict(format!("duplicate id {id}")));
                }
            }
            stored.extend(rows);
            Ok(())
        }

        async fn update(&self, table: RemoteTable, id: &str, row: Value) -> Result<(), RemoteError> {
            self.record(Call::Update(table, id.to_string()));
            let mut tables = self.tables.lock().unwrap();
            if let Some(existing) = tables
                .entry(table)
                .or_default()
                .iter_mut()
                .find(|r| row_id(r) == id)
            {
                *existing = row;
            }
            Ok(())
        }

        async fn delete(&self, table: RemoteTable, id: &str) -> Result<(), RemoteError> {
            self.record(Call::Delete(table, id.to_string()));
            self.tables
                .lock()
                .unwrap()
                .entry(table)
                .or_default()
                .retain(|r| row_id(r) != id);
            Ok(())
        }

        async fn upsert(&self, table: RemoteTable, rows: Vec<Value>) -> Result<(), RemoteError> {
            let ids: Vec<String> = rows.iter().map(row_id).collect();
            self.record_write(Call::Upsert(table, ids.clone()))?;
            {
                let mut pending = self.upsert_conflicts.lock().unwrap();
                if *pending > 0 {
                    *pending -= 1;
                    return Err(RemoteError::Conflict(format!(
                        "duplicate key value violates unique constraint ({})",
                        ids.join(", ")
                    )));
                }
            }
            let mut tables = self.tables.lock().unwrap();
            let stored = tables.entry(table).or_default();
            for row in rows {
                let id = row_id(&row);
                match stored.iter_mut().find(|r| row_id(r) == id) {
                    Some(existing) => *existing = row,
                    None => stored.push(row),
                }
            }
            Ok(())
        }
    }
}
