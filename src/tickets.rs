//! Ticket numbering.
//!
//! Ticket numbers are a display sequence continued from local history, one
//! sequence per store. They are not unique identifiers: the fallback used
//! on an empty store can collide, and callers that care check
//! [`is_taken_in_session`] before printing.

use chrono::Utc;
use tracing::{debug, info};

use crate::error::SyncError;
use crate::models::Ticket;
use crate::store::LocalStore;

/// Three-digit zero padding; larger numbers print in full.
pub fn format_number(n: u64) -> String {
    format!("{n:03}")
}

/// Numbers at or above this are treated as unparseable history.
const MAX_TICKET_NUMBER: u64 = 1_000_000_000_000;

fn parse_number(raw: &str) -> Option<u64> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|n| *n < MAX_TICKET_NUMBER)
}

fn highest_number(tickets: &[Ticket]) -> Option<u64> {
    tickets
        .iter()
        .filter_map(|t| parse_number(&t.ticket_number))
        .max()
}

/// Base used when there is no parseable history: the last three digits of
/// the current millisecond clock.
fn fallback_base() -> u64 {
    u64::try_from(Utc::now().timestamp_millis().rem_euclid(1000)).unwrap_or(0)
}

/// `count` numbers following the highest in `tickets`. Out-of-range stored
/// numbers are ignored.
pub fn next_numbers(tickets: &[Ticket], count: usize) -> Vec<String> {
    let base = highest_number(tickets).unwrap_or_else(|| {
        let base = fallback_base();
        debug!(base, "No ticket history, using clock-based ticket base");
        base
    });
    (1..=count as u64)
        .map_while(|i| base.checked_add(i))
        .map(format_number)
        .collect()
}

/// Advisory duplicate check within one session.
pub fn is_taken_in_session(tickets: &[Ticket], session_id: &str, number: &str) -> bool {
    let wanted = number.trim();
    let wanted_num = wanted.parse::<u64>().ok();
    tickets.iter().any(|t| {
        t.session_id == session_id
            && (t.ticket_number.trim() == wanted
                || (wanted_num.is_some() && t.ticket_number.trim().parse::<u64>().ok() == wanted_num))
    })
}

pub struct TicketSequencer {
    store: LocalStore,
}

impl TicketSequencer {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// The next `count` ticket numbers. An unavailable store reads as empty.
    pub fn generate_next(&self, count: usize) -> Vec<String> {
        next_numbers(&self.store.get_all::<Ticket>(), count)
    }

    /// Create and persist a ticket with the next number.
    pub fn record_ticket(
        &self,
        session_id: &str,
        wash_amount: f64,
        dry_amount: f64,
    ) -> Result<Ticket, SyncError> {
        let tickets: Vec<Ticket> = self.store.load_all()?;
        let number = next_numbers(&tickets, 1)
            .pop()
            .unwrap_or_else(|| format_number(fallback_base()));

        let ticket = self
            .store
            .put(Ticket::new(number, session_id, wash_amount, dry_amount))?;
        info!(
            ticket_id = %ticket.id,
            ticket_number = %ticket.ticket_number,
            session_id = %session_id,
            total = ticket.total_amount,
            "Ticket recorded"
        );
        Ok(ticket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    #[test]
    fn test_generate_next_continues_history() {
        let store = test_store();
        for n in ["001", "007", "abc", "003"] {
            store.put(Ticket::new(n, "s1", 1.0, 0.0)).unwrap();
        }
        let seq = TicketSequencer::new(store);
        assert_eq!(seq.generate_next(3), vec!["008", "009", "010"]);
    }

    #[test]
    fn test_numbers_past_999_print_in_full() {
        let tickets = vec![Ticket::new("999", "s1", 0.0, 0.0)];
        assert_eq!(next_numbers(&tickets, 2), vec!["1000", "1001"]);
    }

    #[test]
    fn test_out_of_range_stored_numbers_are_ignored() {
        let tickets = vec![
            Ticket::new(u64::MAX.to_string(), "s1", 0.0, 0.0),
            Ticket::new("041", "s1", 0.0, 0.0),
        ];
        assert_eq!(next_numbers(&tickets, 2), vec!["042", "043"]);

        let only_huge = vec![Ticket::new("18446744073709551615", "s1", 0.0, 0.0)];
        let next = next_numbers(&only_huge, 1);
        assert_eq!(next.len(), 1);
        assert!(next[0].parse::<u64>().unwrap() <= 1000);
    }

    #[test]
    fn test_record_ticket_after_huge_stored_number() {
        let store = test_store();
        store
            .put(Ticket::new(u64::MAX.to_string(), "s0", 1.0, 0.0))
            .unwrap();
        store.put(Ticket::new("12", "s0", 1.0, 0.0)).unwrap();

        let ticket = TicketSequencer::new(store).record_ticket("s1", 2.0, 0.0).unwrap();
        assert_eq!(ticket.ticket_number, "013");
    }

    #[test]
    fn test_empty_store_uses_clock_fallback() {
        let seq = TicketSequencer::new(test_store());
        let numbers = seq.generate_next(2);
        assert_eq!(numbers.len(), 2);
        let first: u64 = numbers[0].parse().unwrap();
        let second: u64 = numbers[1].parse().unwrap();
        assert!((1..=1000).contains(&first));
        assert_eq!(second, first + 1);
    }

    #[test]
    fn test_unavailable_store_still_generates() {
        let seq = TicketSequencer::new(LocalStore::unavailable("gone"));
        assert_eq!(seq.generate_next(1).len(), 1);
        assert!(seq.record_ticket("s1", 1.0, 1.0).is_err());
    }

    #[test]
    fn test_record_ticket_persists_next_number() {
        let store = test_store();
        store.put(Ticket::new("041", "s0", 1.0, 0.0)).unwrap();
        let seq = TicketSequencer::new(store.clone());

        let ticket = seq.record_ticket("s1", 4.25, 3.5).unwrap();
        assert_eq!(ticket.ticket_number, "042");
        assert_eq!(ticket.total_amount, 7.75);
        assert!(!ticket.synced);
        assert_eq!(store.get_all::<Ticket>().len(), 2);
    }

    #[test]
    fn test_is_taken_in_session() {
        let tickets = vec![
            Ticket::new("007", "s1", 0.0, 0.0),
            Ticket::new("012", "s2", 0.0, 0.0),
        ];
        assert!(is_taken_in_session(&tickets, "s1", "007"));
        assert!(is_taken_in_session(&tickets, "s1", "7"));
        assert!(!is_taken_in_session(&tickets, "s1", "012"));
        assert!(!is_taken_in_session(&tickets, "s3", "007"));
    }
}
