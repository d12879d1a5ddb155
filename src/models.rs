//! Record types for the five local collections.
//!
//! Field names double as the local column names and the remote wire names.
//! The `synced` flag is local bookkeeping and never goes over the wire.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Round a money amount to cents.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

/// The five record collections held by the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Profiles,
    Inventory,
    Tickets,
    Sessions,
    Timesheets,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Profiles,
        Collection::Inventory,
        Collection::Tickets,
        Collection::Sessions,
        Collection::Timesheets,
    ];

    /// Local SQLite table backing this collection.
    pub fn table(self) -> &'static str {
        match self {
            Collection::Profiles => "employee_profiles",
            Collection::Inventory => "inventory_records",
            Collection::Tickets => "tickets",
            Collection::Sessions => "sessions",
            Collection::Timesheets => "timesheets",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

// ---------------------------------------------------------------------------
// Employee profile
// ---------------------------------------------------------------------------

/// Roster entry. Created on the dashboard; the terminal only caches it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeeProfile {
    pub id: String,
    pub full_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(skip_serializing, default)]
    pub synced: bool,
}

fn default_role() -> String {
    "employee".to_string()
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

/// One snapshot of an item's counts. History is append-only: many records
/// share an `item_name` over time, and `session_id = None` marks a master
/// template from the price list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRecord {
    #[serde(default)]
    pub id: String,
    pub item_name: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub unit_price: f64,
    #[serde(default)]
    pub start_count: i64,
    #[serde(default)]
    pub add_count: i64,
    #[serde(default)]
    pub sold_count: i64,
    #[serde(default)]
    pub left_count: i64,
    #[serde(default)]
    pub total_amount: f64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing, default)]
    pub synced: bool,
}

impl InventoryRecord {
    /// A zero-count record. The store assigns the id on first `put`.
    pub fn new(
        item_name: impl Into<String>,
        session_id: Option<String>,
        unit_price: f64,
        quantity: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            item_name: item_name.into(),
            session_id,
            quantity,
            unit_price,
            start_count: 0,
            add_count: 0,
            sold_count: 0,
            left_count: 0,
            total_amount: 0.0,
            created_at: now,
            updated_at: now,
            synced: false,
        }
    }

    /// Set the three entered counts and recompute the derived fields.
    pub fn set_counts(&mut self, start: i64, add: i64, sold: i64) {
        self.start_count = start;
        self.add_count = add;
        self.sold_count = sold;
        self.recompute();
    }

    /// `left = max(0, start + add - sold)`, `total = round(sold * price, 2)`.
    pub fn recompute(&mut self) {
        self.left_count = (self.start_count + self.add_count - self.sold_count).max(0);
        self.total_amount = round2(self.sold_count as f64 * self.unit_price);
    }

    /// True when any count field is non-zero.
    pub fn has_counts(&self) -> bool {
        self.start_count != 0 || self.add_count != 0 || self.sold_count != 0 || self.left_count != 0
    }

    /// Cross-time identity key: trimmed, lower-cased item name.
    pub fn name_key(&self) -> String {
        self.item_name.trim().to_lowercase()
    }

    pub fn is_template(&self) -> bool {
        self.session_id.is_none()
    }
}

// ---------------------------------------------------------------------------
// Tickets
// ---------------------------------------------------------------------------

/// A wash/dry ticket. `ticket_number` is a display sequence only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    #[serde(default)]
    pub id: String,
    pub ticket_number: String,
    pub session_id: String,
    #[serde(default)]
    pub wash_amount: f64,
    #[serde(default)]
    pub dry_amount: f64,
    #[serde(default)]
    pub total_amount: f64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing, default)]
    pub synced: bool,
}

impl Ticket {
    pub fn new(
        ticket_number: impl Into<String>,
        session_id: impl Into<String>,
        wash_amount: f64,
        dry_amount: f64,
    ) -> Self {
        let now = Utc::now();
        let mut ticket = Self {
            id: String::new(),
            ticket_number: ticket_number.into(),
            session_id: session_id.into(),
            wash_amount,
            dry_amount,
            total_amount: 0.0,
            created_at: now,
            updated_at: now,
            synced: false,
        };
        ticket.recompute();
        ticket
    }

    pub fn set_amounts(&mut self, wash: f64, dry: f64) {
        self.wash_amount = wash;
        self.dry_amount = dry;
        self.recompute();
    }

    pub fn recompute(&mut self) {
        self.total_amount = round2(self.wash_amount + self.dry_amount);
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Lifecycle of a shift session.
///
/// `Active` on every edit, `Synced` after a fully successful upload (any
/// later edit returns it to `Active`). `Completed` is set by an
/// administrator and closes the session to employee-side edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Synced,
    Completed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Synced => "synced",
            SessionStatus::Completed => "completed",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "synced" => Ok(SessionStatus::Synced),
            "completed" => Ok(SessionStatus::Completed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// One employee's shift on one day: cash counts plus the totals of the
/// inventory and tickets recorded under it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub id: String,
    pub employee_id: String,
    pub session_date: NaiveDate,
    #[serde(default)]
    pub cash_started: f64,
    #[serde(default)]
    pub cash_added: f64,
    #[serde(default)]
    pub cash_total: f64,
    #[serde(default)]
    pub inventory_total: f64,
    #[serde(default)]
    pub wash_dry_total: f64,
    #[serde(default)]
    pub grand_total: f64,
    #[serde(default)]
    pub notes: String,
    pub status: SessionStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing, default)]
    pub synced: bool,
}

impl Session {
    pub fn new(employee_id: impl Into<String>, session_date: NaiveDate) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            employee_id: employee_id.into(),
            session_date,
            cash_started: 0.0,
            cash_added: 0.0,
            cash_total: 0.0,
            inventory_total: 0.0,
            wash_dry_total: 0.0,
            grand_total: 0.0,
            notes: String::new(),
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
            synced: false,
        }
    }

    /// Recompute cash and grand totals from their parts.
    pub fn recompute_totals(&mut self) {
        self.cash_total = round2(self.cash_started + self.cash_added);
        self.inventory_total = round2(self.inventory_total);
        self.wash_dry_total = round2(self.wash_dry_total);
        self.grand_total = round2(self.inventory_total + self.wash_dry_total);
    }

    /// Append a line to the free-text notes.
    pub fn append_note(&mut self, line: &str) {
        if !self.notes.is_empty() && !self.notes.ends_with('\n') {
            self.notes.push('\n');
        }
        self.notes.push_str(line);
    }

    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }
}

// ---------------------------------------------------------------------------
// Timesheets
// ---------------------------------------------------------------------------

/// A clock-in / clock-out pair. `work_duration` is in hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimesheetEntry {
    #[serde(default)]
    pub id: String,
    pub employee_id: String,
    pub clock_in_time: DateTime<Utc>,
    #[serde(default)]
    pub clock_out_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub work_duration: f64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing, default)]
    pub synced: bool,
}

impl TimesheetEntry {
    pub fn clock_in(employee_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: String::new(),
            employee_id: employee_id.into(),
            clock_in_time: at,
            clock_out_time: None,
            work_duration: 0.0,
            created_at: at,
            updated_at: at,
            synced: false,
        }
    }

    /// Close the entry. A clock-out earlier than the clock-in yields zero hours.
    pub fn clock_out(&mut self, at: DateTime<Utc>) {
        self.clock_out_time = Some(at);
        self.recompute_duration();
    }

    /// Hours between clock-in and clock-out, 0 while the entry is open.
    pub fn recompute_duration(&mut self) {
        self.work_duration = match self.clock_out_time {
            Some(out) => round2((out - self.clock_in_time).num_seconds().max(0) as f64 / 3600.0),
            None => 0.0,
        };
    }

    pub fn is_open(&self) -> bool {
        self.clock_out_time.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_inventory_left_and_total_invariants() {
        let mut rec = InventoryRecord::new("Downy 19 oz", Some("s1".into()), 5.50, 1);
        rec.set_counts(20, 0, 5);
        assert_eq!(rec.left_count, 15);
        assert_eq!(rec.total_amount, 27.50);

        // Oversold never goes negative
        rec.set_counts(2, 1, 10);
        assert_eq!(rec.left_count, 0);
        assert_eq!(rec.total_amount, 55.0);
    }

    #[test]
    fn test_inventory_total_rounds_to_cents() {
        let mut rec = InventoryRecord::new("Bleach", None, 1.333, 1);
        rec.set_counts(10, 0, 3);
        assert_eq!(rec.total_amount, 4.0);
    }

    #[test]
    fn test_ticket_total_is_rounded_sum() {
        let mut ticket = Ticket::new("001", "s1", 0.1, 0.2);
        assert_eq!(ticket.total_amount, 0.3);
        ticket.set_amounts(4.25, 3.5);
        assert_eq!(ticket.total_amount, 7.75);
    }

    #[test]
    fn test_session_grand_total() {
        let mut session = Session::new("emp-1", NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
        session.cash_started = 100.0;
        session.cash_added = 20.5;
        session.inventory_total = 27.5;
        session.wash_dry_total = 12.25;
        session.recompute_totals();
        assert_eq!(session.cash_total, 120.5);
        assert_eq!(session.grand_total, 39.75);
    }

    #[test]
    fn test_session_append_note_separates_lines() {
        let mut session = Session::new("emp-1", NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
        session.append_note("first");
        session.append_note("second");
        assert_eq!(session.notes, "first\nsecond");
    }

    #[test]
    fn test_session_status_round_trips_through_text() {
        for status in [
            SessionStatus::Active,
            SessionStatus::Synced,
            SessionStatus::Completed,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("reopened".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_timesheet_duration_in_hours() {
        let start = Utc::now();
        let mut entry = TimesheetEntry::clock_in("emp-1", start);
        assert!(entry.is_open());
        entry.clock_out(start + Duration::minutes(90));
        assert!(!entry.is_open());
        assert_eq!(entry.work_duration, 1.5);
    }

    #[test]
    fn test_synced_flag_is_not_serialized() {
        let mut ticket = Ticket::new("004", "s1", 3.0, 2.0);
        ticket.synced = true;
        let wire = serde_json::to_value(&ticket).unwrap();
        assert!(wire.get("synced").is_none());
        assert_eq!(wire["total_amount"], 5.0);
    }

    #[test]
    fn test_remote_inventory_row_defaults_missing_counts() {
        let row = serde_json::json!({
            "id": "inv-1",
            "item_name": "Tide Pods",
            "session_id": null,
            "unit_price": 2.25
        });
        let rec: InventoryRecord = serde_json::from_value(row).unwrap();
        assert!(rec.is_template());
        assert_eq!(rec.sold_count, 0);
        assert!(!rec.has_counts());
    }
}
