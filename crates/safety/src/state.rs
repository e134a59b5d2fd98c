use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Entries kept in the bounded audit tail of the state file.
pub const REQUEST_LOG_CAPACITY: usize = 100;

pub(crate) fn window() -> Duration {
    Duration::hours(1)
}

/// One recorded attempt, kept for `status --verbose`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLogEntry {
    pub timestamp: DateTime<Utc>,
    pub project_id: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Persisted safety counters. Owned by [`crate::SafetyController`]; nothing
/// else reads or writes the file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyState {
    #[serde(default)]
    pub last_request_at: Option<DateTime<Utc>>,
    /// Attempt timestamps inside the trailing hour.
    #[serde(default)]
    pub request_timestamps: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub remix_count_today: u32,
    /// UTC date `remix_count_today` belongs to.
    #[serde(default)]
    pub counter_date: Option<NaiveDate>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub circuit_opened_at: Option<DateTime<Utc>>,
    /// Set while the single half-open trial is out.
    #[serde(default)]
    pub half_open_trial_at: Option<DateTime<Utc>>,
    /// Permits not yet recorded or released: project id -> issue time.
    #[serde(default)]
    pub in_flight: BTreeMap<String, DateTime<Utc>>,
    /// Idempotency ledger: source project id -> resulting project id, if known.
    #[serde(default)]
    pub remixed_projects: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub request_log: Vec<RequestLogEntry>,
}

impl SafetyState {
    /// Drop attempt timestamps that fell out of the trailing hour.
    pub fn prune_window(&mut self, now: DateTime<Utc>) {
        self.request_timestamps.retain(|ts| now - *ts < window());
    }

    /// Attempts inside the trailing hour ending at `now`.
    pub fn requests_in_window(&self, now: DateTime<Utc>) -> usize {
        self.request_timestamps
            .iter()
            .filter(|ts| now - **ts < window())
            .count()
    }

    /// Oldest timestamp still inside the window; its expiry frees the next slot.
    pub fn oldest_in_window(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.request_timestamps
            .iter()
            .filter(|ts| now - **ts < window())
            .min()
            .copied()
    }

    /// Reset the daily counter when `now` is on a later UTC date. Returns
    /// whether anything changed.
    pub fn roll_daily(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if self.counter_date == Some(today) {
            return false;
        }
        self.counter_date = Some(today);
        self.remix_count_today = 0;
        true
    }

    /// Daily count as seen at `now`, without mutating.
    pub fn remixes_on(&self, now: DateTime<Utc>) -> u32 {
        if self.counter_date == Some(now.date_naive()) {
            self.remix_count_today
        } else {
            0
        }
    }

    /// Ledger entry for `project_id`: `Some(new_id)` once remixed, where
    /// `new_id` itself may be unknown.
    pub fn remixed_as(&self, project_id: &str) -> Option<&Option<String>> {
        self.remixed_projects.get(project_id)
    }

    /// Issue time of the most recent outstanding permit.
    pub fn latest_permit(&self) -> Option<DateTime<Utc>> {
        self.in_flight.values().max().copied()
    }

    /// Remove and return permits issued `ttl` or more before `now`, oldest
    /// first.
    pub fn take_abandoned(&mut self, now: DateTime<Utc>, ttl: Duration) -> Vec<(String, DateTime<Utc>)> {
        let stale: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, issued)| now - **issued >= ttl)
            .map(|(id, _)| id.clone())
            .collect();
        let mut taken: Vec<(String, DateTime<Utc>)> = stale
            .into_iter()
            .filter_map(|id| self.in_flight.remove_entry(&id))
            .collect();
        taken.sort_by_key(|(_, issued)| *issued);
        taken
    }

    pub fn push_log(&mut self, entry: RequestLogEntry) {
        self.request_log.push(entry);
        if self.request_log.len() > REQUEST_LOG_CAPACITY {
            let excess = self.request_log.len() - REQUEST_LOG_CAPACITY;
            self.request_log.drain(..excess);
        }
    }
}
