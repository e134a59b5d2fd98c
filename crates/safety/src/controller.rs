//! The gatekeeper every automated action passes through.
//!
//! Check order for [`SafetyController::check_before_action`]:
//! circuit breaker, minimum spacing, hourly window, daily quota, idempotency
//! ledger, in-flight attempts. Counters only move in
//! [`SafetyController::record_outcome`]. A permit leaves behind an in-flight
//! entry for its project: it holds the minimum spacing and an hourly slot,
//! blocks a second permit for the same project, and is written off as a
//! failed attempt if it is never recorded or released.

use chrono::{DateTime, Duration, Utc};
use remixctl_core::config::SafetyConfig;
use remixctl_core::{Paths, Result};
use remixctl_storage::LockedJsonFile;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::state::{window, RequestLogEntry, SafetyState};

/// Error recorded for a permit that was never recorded or released.
pub const ABANDONED: &str = "abandoned";

#[derive(Debug, Clone)]
pub struct SafetyLimits {
    pub min_interval: Duration,
    pub hourly_limit: u32,
    pub daily_limit: u32,
    pub failure_threshold: u32,
    pub cooldown: Duration,
    /// Age at which an unrecorded permit counts as abandoned.
    pub in_flight_ttl: Duration,
    pub warn_after_requests: u32,
}

impl From<&SafetyConfig> for SafetyLimits {
    fn from(cfg: &SafetyConfig) -> Self {
        Self {
            min_interval: Duration::milliseconds(cfg.min_request_interval_ms as i64),
            hourly_limit: cfg.max_requests_per_hour,
            daily_limit: cfg.max_remixes_per_day,
            failure_threshold: cfg.max_consecutive_failures.max(1),
            cooldown: Duration::minutes(cfg.circuit_cooldown_minutes as i64),
            in_flight_ttl: Duration::minutes(cfg.in_flight_timeout_minutes.max(1) as i64),
            warn_after_requests: cfg.warn_after_requests,
        }
    }
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self::from(&SafetyConfig::default())
    }
}

/// Why a pre-check refused an action. Every variant is an expected policy
/// outcome, never an error in the automation itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Denial {
    #[error("circuit breaker open: {} until the next trial is allowed", format_wait(.remaining))]
    CircuitOpen { remaining: std::time::Duration },

    #[error("rate limited: wait {} before the next request", format_wait(.wait))]
    RateLimited { wait: std::time::Duration },

    #[error("hourly limit reached ({limit} requests), next slot in {}", format_wait(.retry_after))]
    HourlyLimit {
        limit: u32,
        retry_after: std::time::Duration,
    },

    #[error("daily remix limit reached ({limit})")]
    DailyLimit { limit: u32 },

    #[error("project {project_id} was already remixed{}", remixed_as(.new_project_id))]
    AlreadyRemixed {
        project_id: String,
        new_project_id: Option<String>,
    },

    #[error("project {project_id} is already being remixed (permit issued {})", format_time(.since))]
    InProgress {
        project_id: String,
        since: DateTime<Utc>,
    },
}

impl Denial {
    /// Machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            Denial::CircuitOpen { .. } => "circuit_open",
            Denial::RateLimited { .. } => "rate_limited",
            Denial::HourlyLimit { .. } => "hourly_limit",
            Denial::DailyLimit { .. } => "daily_limit",
            Denial::AlreadyRemixed { .. } => "already_remixed",
            Denial::InProgress { .. } => "remix_in_progress",
        }
    }

    /// How long until the same request could pass this particular check.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            Denial::CircuitOpen { remaining } => Some(*remaining),
            Denial::RateLimited { wait } => Some(*wait),
            Denial::HourlyLimit { retry_after, .. } => Some(*retry_after),
            Denial::DailyLimit { .. } | Denial::AlreadyRemixed { .. } | Denial::InProgress { .. } => None,
        }
    }
}

fn format_wait(d: &std::time::Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        format!("{:.1} min", secs / 60.0)
    }
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn remixed_as(new_project_id: &Option<String>) -> String {
    match new_project_id {
        Some(id) => format!(" (as {})", id),
        None => String::new(),
    }
}

fn to_std(d: Duration) -> std::time::Duration {
    d.to_std().unwrap_or_default()
}

/// Permission for exactly one attempt on one project.
#[derive(Debug)]
#[must_use = "a permit must be recorded or released"]
pub struct Permit {
    project_id: String,
    issued_at: DateTime<Utc>,
    half_open_trial: bool,
}

impl Permit {
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// True when this permit is the single trial of a half-open breaker.
    pub fn is_half_open_trial(&self) -> bool {
        self.half_open_trial
    }
}

#[derive(Debug)]
pub enum Decision {
    Permit(Permit),
    Deny(Denial),
}

/// What actually happened to a permitted attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    pub new_project_id: Option<String>,
    pub error: Option<String>,
}

impl Outcome {
    pub fn success(new_project_id: Option<String>) -> Self {
        Self {
            success: true,
            new_project_id,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            new_project_id: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open { until: DateTime<Utc> },
    /// Cooldown over; the next permitted attempt is the trial.
    HalfOpen,
    /// Cooldown over and the trial is currently out.
    Trial { since: DateTime<Utc> },
}

/// Read-only view of the safety state for the `status` command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyStatus {
    pub requests_last_hour: usize,
    pub hourly_limit: u32,
    pub remixes_today: u32,
    pub daily_limit: u32,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub circuit: CircuitState,
    pub last_request_at: Option<DateTime<Utc>>,
    /// Milliseconds until the minimum spacing allows another request.
    pub next_request_in_ms: Option<u64>,
    /// Permitted attempts not yet recorded, by project id.
    pub in_flight: BTreeMap<String, DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remixed_projects: Option<BTreeMap<String, Option<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_requests: Option<Vec<RequestLogEntry>>,
}

/// Lock-guarded handle over the persisted [`SafetyState`]. Cheap to build;
/// pass it explicitly to every component that needs gating.
pub struct SafetyController {
    file: LockedJsonFile<SafetyState>,
    limits: SafetyLimits,
}

impl SafetyController {
    pub fn new(path: PathBuf, limits: SafetyLimits) -> Self {
        Self {
            file: LockedJsonFile::new(path),
            limits,
        }
    }

    pub fn from_config(paths: &Paths, cfg: &SafetyConfig) -> Self {
        Self::new(paths.safety_state_file(), SafetyLimits::from(cfg))
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    pub fn check_before_action(&self, project_id: &str) -> Result<Decision> {
        self.check_before_action_at(project_id, Utc::now())
    }

    pub fn check_before_action_at(&self, project_id: &str, now: DateTime<Utc>) -> Result<Decision> {
        let limits = &self.limits;
        let decision = self.file.update(|state| {
            state.roll_daily(now);
            write_off_abandoned(state, limits, now);
            evaluate(state, limits, project_id, now)
        })?;

        match &decision {
            Decision::Permit(p) => debug!(
                project_id = %project_id,
                half_open_trial = p.half_open_trial,
                "Safety check passed"
            ),
            Decision::Deny(d) => info!(project_id = %project_id, reason = d.code(), "{}", d),
        }
        Ok(decision)
    }

    /// Record the result of a permitted attempt. Durable before returning.
    pub fn record_outcome(&self, project_id: &str, outcome: &Outcome, at: DateTime<Utc>) -> Result<()> {
        let limits = &self.limits;
        let (tripped, failures) = self.file.update(|state| {
            state.prune_window(at);
            state.roll_daily(at);
            state.in_flight.remove(project_id);
            let was_trial = state.half_open_trial_at.take().is_some();
            let tripped = apply_outcome(state, limits, project_id, outcome, at, was_trial);
            (tripped, state.consecutive_failures)
        })?;

        if tripped {
            warn!(
                consecutive_failures = failures,
                cooldown_minutes = limits.cooldown.num_minutes(),
                "Circuit breaker tripped, automated actions paused"
            );
        } else {
            debug!(project_id = %project_id, success = outcome.success, "Outcome recorded");
        }
        Ok(())
    }

    /// Give back a permit that will not be used. Records no attempt.
    pub fn release(&self, permit: Permit) -> Result<()> {
        self.file.update(|state| {
            if state.in_flight.get(&permit.project_id) == Some(&permit.issued_at) {
                state.in_flight.remove(&permit.project_id);
            }
            if permit.half_open_trial && state.half_open_trial_at == Some(permit.issued_at) {
                state.half_open_trial_at = None;
            }
        })?;
        debug!(project_id = %permit.project_id, "Permit released unused");
        Ok(())
    }

    /// Wipe every counter and the idempotency ledger. Requires `confirm`;
    /// returns whether a reset happened.
    pub fn reset(&self, confirm: bool) -> Result<bool> {
        if !confirm {
            warn!("Safety reset requested without confirmation; nothing changed");
            return Ok(false);
        }
        self.file.update(|state| *state = SafetyState::default())?;
        warn!("Safety state reset: counters, circuit breaker and remix ledger cleared");
        Ok(true)
    }

    pub fn status(&self, verbose: bool) -> Result<SafetyStatus> {
        self.status_at(verbose, Utc::now())
    }

    pub fn status_at(&self, verbose: bool, now: DateTime<Utc>) -> Result<SafetyStatus> {
        let state = self.file.read()?;
        let limits = &self.limits;

        let circuit = match state.circuit_opened_at {
            None => CircuitState::Closed,
            Some(opened) if now - opened < limits.cooldown => CircuitState::Open {
                until: opened + limits.cooldown,
            },
            Some(_) => match state.half_open_trial_at {
                Some(since) if now - since < limits.cooldown => CircuitState::Trial { since },
                _ => CircuitState::HalfOpen,
            },
        };

        let recent_requests = verbose.then(|| {
            let skip = state.request_log.len().saturating_sub(10);
            state.request_log[skip..].to_vec()
        });

        Ok(SafetyStatus {
            requests_last_hour: state.requests_in_window(now),
            hourly_limit: limits.hourly_limit,
            remixes_today: state.remixes_on(now),
            daily_limit: limits.daily_limit,
            consecutive_failures: state.consecutive_failures,
            failure_threshold: limits.failure_threshold,
            circuit,
            last_request_at: state.last_request_at,
            next_request_in_ms: rate_wait(&state, limits, now).map(|w| w.as_millis() as u64),
            in_flight: state
                .in_flight
                .iter()
                .filter(|(_, issued)| now - **issued < limits.in_flight_ttl)
                .map(|(id, issued)| (id.clone(), *issued))
                .collect(),
            remixed_projects: verbose.then(|| state.remixed_projects.clone()),
            recent_requests,
        })
    }
}

/// Run the checks in order against `state`, reserving an in-flight entry
/// for `project_id` when everything passes.
fn evaluate(state: &mut SafetyState, limits: &SafetyLimits, project_id: &str, now: DateTime<Utc>) -> Decision {
    let half_open = match circuit_gate(state, limits, now) {
        Ok(half_open) => half_open,
        Err(denial) => return Decision::Deny(denial),
    };

    if let Some(wait) = rate_wait(state, limits, now) {
        return Decision::Deny(Denial::RateLimited { wait });
    }

    // Outstanding permits hold a slot until they are recorded or released.
    let in_window = state.requests_in_window(now) + state.in_flight.len();
    if in_window >= limits.hourly_limit as usize {
        let retry_after = state
            .oldest_in_window(now)
            .map(|oldest| to_std(oldest + window() - now))
            .or_else(|| {
                let issued = state.in_flight.values().min()?;
                Some(to_std(*issued + limits.in_flight_ttl - now))
            })
            .unwrap_or_default();
        return Decision::Deny(Denial::HourlyLimit {
            limit: limits.hourly_limit,
            retry_after,
        });
    }
    if state.remix_count_today >= limits.daily_limit {
        return Decision::Deny(Denial::DailyLimit {
            limit: limits.daily_limit,
        });
    }

    if let Some(new_project_id) = state.remixed_as(project_id) {
        return Decision::Deny(Denial::AlreadyRemixed {
            project_id: project_id.to_string(),
            new_project_id: new_project_id.clone(),
        });
    }

    if let Some(since) = state.in_flight.get(project_id) {
        return Decision::Deny(Denial::InProgress {
            project_id: project_id.to_string(),
            since: *since,
        });
    }

    if limits.warn_after_requests > 0 && in_window >= limits.warn_after_requests as usize {
        warn!(
            requests_last_hour = in_window,
            hourly_limit = limits.hourly_limit,
            "High request volume in the last hour"
        );
    }

    state.in_flight.insert(project_id.to_string(), now);
    if half_open {
        state.half_open_trial_at = Some(now);
    }
    Decision::Permit(Permit {
        project_id: project_id.to_string(),
        issued_at: now,
        half_open_trial: half_open,
    })
}

/// Count every permit older than the in-flight timeout as a failed attempt
/// made at its issue time. Its process died or hung before recording.
fn write_off_abandoned(state: &mut SafetyState, limits: &SafetyLimits, now: DateTime<Utc>) {
    for (project_id, issued) in state.take_abandoned(now, limits.in_flight_ttl) {
        let was_trial = state.half_open_trial_at == Some(issued);
        if was_trial {
            state.half_open_trial_at = None;
        }
        let outcome = Outcome::failure(ABANDONED);
        let tripped = apply_outcome(state, limits, &project_id, &outcome, issued, was_trial);
        if tripped {
            // The cooldown runs from when the loss was noticed.
            state.circuit_opened_at = Some(now);
        }
        warn!(
            project_id = %project_id,
            permit_issued_at = %issued,
            circuit_tripped = tripped,
            "Permit never recorded, counted as a failed attempt"
        );
    }
}

/// Move the counters for one finished attempt. Returns whether the circuit
/// breaker tripped.
fn apply_outcome(
    state: &mut SafetyState,
    limits: &SafetyLimits,
    project_id: &str,
    outcome: &Outcome,
    at: DateTime<Utc>,
    was_trial: bool,
) -> bool {
    state.request_timestamps.push(at);
    state.last_request_at = Some(state.last_request_at.map_or(at, |last| last.max(at)));

    let mut tripped = false;
    if outcome.success {
        state.remix_count_today += 1;
        state
            .remixed_projects
            .insert(project_id.to_string(), outcome.new_project_id.clone());
        state.consecutive_failures = 0;
        if state.circuit_opened_at.take().is_some() {
            info!("Circuit breaker closed after successful trial");
        }
    } else {
        state.consecutive_failures += 1;
        if was_trial || state.consecutive_failures >= limits.failure_threshold {
            state.circuit_opened_at = Some(at);
            tripped = true;
        }
    }

    state.push_log(RequestLogEntry {
        timestamp: at,
        project_id: project_id.to_string(),
        success: outcome.success,
        error: outcome.error.clone(),
    });
    tripped
}

/// `Ok(true)` when the breaker is half-open and the trial is available,
/// `Ok(false)` when closed.
fn circuit_gate(state: &SafetyState, limits: &SafetyLimits, now: DateTime<Utc>) -> std::result::Result<bool, Denial> {
    let Some(opened) = state.circuit_opened_at else {
        return Ok(false);
    };

    let open_for = now - opened;
    if open_for < limits.cooldown {
        return Err(Denial::CircuitOpen {
            remaining: to_std(limits.cooldown - open_for),
        });
    }

    // A trial claim that outlives the cooldown belongs to a crashed process.
    if let Some(trial_at) = state.half_open_trial_at {
        let out_for = now - trial_at;
        if out_for < limits.cooldown {
            return Err(Denial::CircuitOpen {
                remaining: to_std(limits.cooldown - out_for),
            });
        }
    }
    Ok(true)
}

/// Remaining wait imposed by the minimum spacing, counted from the later of
/// the last recorded attempt and the newest outstanding permit.
fn rate_wait(state: &SafetyState, limits: &SafetyLimits, now: DateTime<Utc>) -> Option<std::time::Duration> {
    let reference = match (state.last_request_at, state.latest_permit()) {
        (Some(a), Some(b)) => a.max(b),
        (a, b) => a.or(b)?,
    };
    let elapsed = (now - reference).max(Duration::zero());
    if elapsed < limits.min_interval {
        Some(to_std(limits.min_interval - elapsed))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn controller(dir: &TempDir, limits: SafetyLimits) -> SafetyController {
        SafetyController::new(dir.path().join("safety_state.json"), limits)
    }

    fn limits() -> SafetyLimits {
        SafetyLimits {
            min_interval: Duration::seconds(2),
            hourly_limit: 60,
            daily_limit: 20,
            failure_threshold: 3,
            cooldown: Duration::minutes(15),
            in_flight_ttl: Duration::minutes(10),
            warn_after_requests: 10,
        }
    }

    fn expect_permit(d: Decision) -> Permit {
        match d {
            Decision::Permit(p) => p,
            Decision::Deny(d) => panic!("expected permit, got denial: {}", d),
        }
    }

    fn expect_denial(d: Decision) -> Denial {
        match d {
            Decision::Deny(d) => d,
            Decision::Permit(p) => panic!("expected denial, got permit for {}", p.project_id()),
        }
    }

    #[test]
    fn test_fresh_state_permits_then_rate_limits() {
        let dir = TempDir::new().unwrap();
        let safety = controller(&dir, SafetyLimits { hourly_limit: 1, ..limits() });
        let now = Utc::now();

        let permit = expect_permit(safety.check_before_action_at("p1", now).unwrap());
        assert!(!permit.is_half_open_trial());

        let denial = expect_denial(
            safety
                .check_before_action_at("p2", now + Duration::milliseconds(500))
                .unwrap(),
        );
        assert_eq!(denial.code(), "rate_limited");
        assert_eq!(denial.retry_after(), Some(std::time::Duration::from_millis(1500)));
    }

    #[test]
    fn test_rate_limit_after_recorded_attempt() {
        let dir = TempDir::new().unwrap();
        let safety = controller(&dir, limits());
        let now = Utc::now();

        let permit = expect_permit(safety.check_before_action_at("p1", now).unwrap());
        safety
            .record_outcome(permit.project_id(), &Outcome::failure("element_not_found"), now)
            .unwrap();

        for offset_ms in [0, 700, 1999] {
            let d = expect_denial(
                safety
                    .check_before_action_at("p1", now + Duration::milliseconds(offset_ms))
                    .unwrap(),
            );
            assert_eq!(
                d,
                Denial::RateLimited {
                    wait: std::time::Duration::from_millis((2000 - offset_ms) as u64)
                }
            );
        }

        expect_permit(
            safety
                .check_before_action_at("p1", now + Duration::seconds(2))
                .unwrap(),
        );
    }

    #[test]
    fn test_check_does_not_move_counters() {
        let dir = TempDir::new().unwrap();
        let safety = controller(&dir, limits());
        let now = Utc::now();

        let _ = expect_permit(safety.check_before_action_at("p1", now).unwrap());
        let status = safety.status_at(false, now).unwrap();
        assert_eq!(status.requests_last_hour, 0);
        assert_eq!(status.remixes_today, 0);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[test]
    fn test_released_permit_frees_the_slot() {
        let dir = TempDir::new().unwrap();
        let safety = controller(&dir, limits());
        let now = Utc::now();

        let permit = expect_permit(safety.check_before_action_at("p1", now).unwrap());
        safety.release(permit).unwrap();
        expect_permit(safety.check_before_action_at("p1", now).unwrap());
    }

    #[test]
    fn test_circuit_opens_after_threshold_failures() {
        let dir = TempDir::new().unwrap();
        let safety = controller(&dir, limits());
        let start = Utc::now();

        for i in 0..3 {
            let at = start + Duration::seconds(10 * i);
            let permit = expect_permit(safety.check_before_action_at("p1", at).unwrap());
            safety
                .record_outcome(permit.project_id(), &Outcome::failure("navigation_error"), at)
                .unwrap();
        }

        let after = start + Duration::seconds(60);
        let denial = expect_denial(safety.check_before_action_at("p9", after).unwrap());
        assert_eq!(denial.code(), "circuit_open");
        assert!(denial.retry_after().unwrap() > std::time::Duration::from_secs(60 * 13));
        assert!(matches!(
            safety.status_at(false, after).unwrap().circuit,
            CircuitState::Open { .. }
        ));
    }

    #[test]
    fn test_half_open_grants_single_trial_then_closes_on_success() {
        let dir = TempDir::new().unwrap();
        let safety = controller(&dir, limits());
        let t0 = Utc::now();
        for i in 0..3 {
            safety
                .record_outcome("p1", &Outcome::failure("timeout"), t0 + Duration::seconds(i))
                .unwrap();
        }

        let t1 = t0 + Duration::minutes(16);
        assert_eq!(safety.status_at(false, t1).unwrap().circuit, CircuitState::HalfOpen);

        let trial = expect_permit(safety.check_before_action_at("p1", t1).unwrap());
        assert!(trial.is_half_open_trial());

        // Even once the spacing has passed, a second caller is held back while the trial is out.
        let second = expect_denial(
            safety
                .check_before_action_at("p2", t1 + Duration::seconds(30))
                .unwrap(),
        );
        assert_eq!(second.code(), "circuit_open");

        let t2 = t1 + Duration::seconds(40);
        safety
            .record_outcome(trial.project_id(), &Outcome::success(Some("p1-copy".into())), t2)
            .unwrap();

        let status = safety.status_at(false, t2).unwrap();
        assert_eq!(status.circuit, CircuitState::Closed);
        assert_eq!(status.consecutive_failures, 0);
        expect_permit(
            safety
                .check_before_action_at("p2", t2 + Duration::seconds(3))
                .unwrap(),
        );
    }

    #[test]
    fn test_half_open_trial_failure_reopens() {
        let dir = TempDir::new().unwrap();
        let safety = controller(&dir, limits());
        let t0 = Utc::now();
        for i in 0..3 {
            safety
                .record_outcome("p1", &Outcome::failure("timeout"), t0 + Duration::seconds(i))
                .unwrap();
        }

        let t1 = t0 + Duration::minutes(16);
        let trial = expect_permit(safety.check_before_action_at("p1", t1).unwrap());
        safety
            .record_outcome(trial.project_id(), &Outcome::failure("element_not_found"), t1)
            .unwrap();

        let denial = expect_denial(
            safety
                .check_before_action_at("p1", t1 + Duration::minutes(5))
                .unwrap(),
        );
        assert_eq!(denial.code(), "circuit_open");
        assert_eq!(
            denial.retry_after(),
            Some(std::time::Duration::from_secs(10 * 60))
        );
    }

    #[test]
    fn test_released_trial_can_be_claimed_again() {
        let dir = TempDir::new().unwrap();
        let safety = controller(&dir, limits());
        let t0 = Utc::now();
        for i in 0..3 {
            safety
                .record_outcome("p1", &Outcome::failure("timeout"), t0 + Duration::seconds(i))
                .unwrap();
        }

        let t1 = t0 + Duration::minutes(16);
        let trial = expect_permit(safety.check_before_action_at("p1", t1).unwrap());
        safety.release(trial).unwrap();
        let again = expect_permit(safety.check_before_action_at("p1", t1).unwrap());
        assert!(again.is_half_open_trial());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let dir = TempDir::new().unwrap();
        let safety = controller(&dir, limits());
        let t0 = Utc::now();

        safety.record_outcome("a", &Outcome::failure("x"), t0).unwrap();
        safety.record_outcome("b", &Outcome::failure("x"), t0 + Duration::seconds(5)).unwrap();
        safety.record_outcome("c", &Outcome::success(None), t0 + Duration::seconds(10)).unwrap();
        safety.record_outcome("d", &Outcome::failure("x"), t0 + Duration::seconds(15)).unwrap();
        safety.record_outcome("e", &Outcome::failure("x"), t0 + Duration::seconds(20)).unwrap();

        let d = safety.check_before_action_at("f", t0 + Duration::seconds(30)).unwrap();
        expect_permit(d);
    }

    #[test]
    fn test_idempotency_ledger() {
        let dir = TempDir::new().unwrap();
        let safety = controller(&dir, limits());
        let t0 = Utc::now();

        safety
            .record_outcome("p1", &Outcome::success(Some("p1-remix".into())), t0)
            .unwrap();

        let denial = expect_denial(
            safety
                .check_before_action_at("p1", t0 + Duration::minutes(5))
                .unwrap(),
        );
        assert_eq!(
            denial,
            Denial::AlreadyRemixed {
                project_id: "p1".into(),
                new_project_id: Some("p1-remix".into())
            }
        );
        expect_permit(
            safety
                .check_before_action_at("p2", t0 + Duration::minutes(5))
                .unwrap(),
        );
    }

    #[test]
    fn test_failed_attempt_does_not_enter_ledger() {
        let dir = TempDir::new().unwrap();
        let safety = controller(&dir, limits());
        let t0 = Utc::now();

        safety.record_outcome("p1", &Outcome::failure("timeout"), t0).unwrap();
        expect_permit(
            safety
                .check_before_action_at("p1", t0 + Duration::minutes(1))
                .unwrap(),
        );
    }

    #[test]
    fn test_hourly_window_slides() {
        let dir = TempDir::new().unwrap();
        let safety = controller(&dir, SafetyLimits { hourly_limit: 2, ..limits() });
        let t0 = Utc::now();

        safety.record_outcome("a", &Outcome::failure("x"), t0).unwrap();
        safety
            .record_outcome("b", &Outcome::success(None), t0 + Duration::minutes(30))
            .unwrap();

        let denial = expect_denial(
            safety
                .check_before_action_at("c", t0 + Duration::minutes(45))
                .unwrap(),
        );
        assert_eq!(
            denial,
            Denial::HourlyLimit {
                limit: 2,
                retry_after: std::time::Duration::from_secs(15 * 60)
            }
        );

        // 61 minutes after the first attempt it no longer counts.
        expect_permit(
            safety
                .check_before_action_at("c", t0 + Duration::minutes(61))
                .unwrap(),
        );
    }

    #[test]
    fn test_daily_limit_and_rollover() {
        let dir = TempDir::new().unwrap();
        let safety = controller(&dir, SafetyLimits { daily_limit: 1, ..limits() });
        let t0 = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();

        safety.record_outcome("a", &Outcome::success(None), t0).unwrap();
        let denial = expect_denial(
            safety
                .check_before_action_at("b", t0 + Duration::minutes(2))
                .unwrap(),
        );
        assert_eq!(denial, Denial::DailyLimit { limit: 1 });

        expect_permit(
            safety
                .check_before_action_at("b", t0 + Duration::days(1))
                .unwrap(),
        );
    }

    #[test]
    fn test_circuit_denial_takes_precedence() {
        let dir = TempDir::new().unwrap();
        let safety = controller(&dir, limits());
        let t0 = Utc::now();

        safety.record_outcome("p1", &Outcome::success(None), t0).unwrap();
        for i in 1..=3 {
            safety
                .record_outcome("x", &Outcome::failure("x"), t0 + Duration::seconds(i))
                .unwrap();
        }
        let denial = expect_denial(safety.check_before_action_at("p1", t0 + Duration::seconds(4)).unwrap());
        assert_eq!(denial.code(), "circuit_open");
    }

    #[test]
    fn test_reset_requires_confirmation() {
        let dir = TempDir::new().unwrap();
        let safety = controller(&dir, limits());
        let t0 = Utc::now();

        safety.record_outcome("p1", &Outcome::success(None), t0).unwrap();
        for i in 1..=3 {
            safety
                .record_outcome("x", &Outcome::failure("x"), t0 + Duration::seconds(i))
                .unwrap();
        }
        let before = safety.status_at(true, t0).unwrap();

        assert!(!safety.reset(false).unwrap());
        let unchanged = safety.status_at(true, t0).unwrap();
        assert_eq!(unchanged.consecutive_failures, before.consecutive_failures);
        assert_eq!(unchanged.remixed_projects, before.remixed_projects);

        assert!(safety.reset(true).unwrap());
        let cleared = safety.status_at(true, t0 + Duration::seconds(5)).unwrap();
        assert_eq!(cleared.consecutive_failures, 0);
        assert_eq!(cleared.remixes_today, 0);
        assert_eq!(cleared.requests_last_hour, 0);
        assert_eq!(cleared.circuit, CircuitState::Closed);
        assert!(cleared.remixed_projects.unwrap().is_empty());
        expect_permit(safety.check_before_action_at("p1", t0 + Duration::seconds(5)).unwrap());
    }

    #[test]
    fn test_state_survives_new_controller() {
        let dir = TempDir::new().unwrap();
        let t0 = Utc::now();
        controller(&dir, limits())
            .record_outcome("p1", &Outcome::success(None), t0)
            .unwrap();

        let reopened = controller(&dir, limits());
        let d = expect_denial(
            reopened
                .check_before_action_at("p1", t0 + Duration::minutes(1))
                .unwrap(),
        );
        assert_eq!(d.code(), "already_remixed");
    }

    #[test]
    fn test_concurrent_failures_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("safety_state.json");
        let t0 = Utc::now();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let safety = SafetyController::new(
                        path,
                        SafetyLimits { failure_threshold: 1000, ..limits() },
                    );
                    for j in 0..10 {
                        safety
                            .record_outcome(
                                "p",
                                &Outcome::failure("x"),
                                t0 + Duration::milliseconds(i * 100 + j),
                            )
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let safety = SafetyController::new(path, limits());
        assert_eq!(safety.status_at(false, t0).unwrap().consecutive_failures, 40);
    }

    #[test]
    fn test_verbose_status_includes_history() {
        let dir = TempDir::new().unwrap();
        let safety = controller(&dir, limits());
        let t0 = Utc::now();
        safety
            .record_outcome("p1", &Outcome::success(Some("n1".into())), t0)
            .unwrap();

        let terse = safety.status_at(false, t0).unwrap();
        assert!(terse.remixed_projects.is_none());
        assert!(terse.recent_requests.is_none());
        assert_eq!(terse.next_request_in_ms, Some(2000));

        let verbose = safety.status_at(true, t0).unwrap();
        assert_eq!(verbose.recent_requests.unwrap().len(), 1);
        assert_eq!(
            verbose.remixed_projects.unwrap().get("p1"),
            Some(&Some("n1".to_string()))
        );
    }

    #[test]
    fn test_same_project_blocked_across_processes_while_in_flight() {
        let dir = TempDir::new().unwrap();
        let first = controller(&dir, limits());
        let second = controller(&dir, limits());
        let t0 = Utc::now();

        let permit = expect_permit(first.check_before_action_at("p1", t0).unwrap());

        let denial = expect_denial(
            second
                .check_before_action_at("p1", t0 + Duration::seconds(3))
                .unwrap(),
        );
        assert_eq!(
            denial,
            Denial::InProgress {
                project_id: "p1".into(),
                since: t0
            }
        );
        assert_eq!(denial.code(), "remix_in_progress");
        assert_eq!(denial.retry_after(), None);

        first
            .record_outcome(
                permit.project_id(),
                &Outcome::failure("navigation_error"),
                t0 + Duration::seconds(5),
            )
            .unwrap();
        expect_permit(
            second
                .check_before_action_at("p1", t0 + Duration::seconds(8))
                .unwrap(),
        );
    }

    #[test]
    fn test_simultaneous_checks_grant_one_permit_per_project() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("safety_state.json");
        let now = Utc::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let safety = SafetyController::new(
                        path,
                        SafetyLimits { min_interval: Duration::zero(), ..limits() },
                    );
                    match safety.check_before_action_at("p1", now).unwrap() {
                        Decision::Permit(_) => None,
                        Decision::Deny(d) => Some(d.code()),
                    }
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_none()).count(), 1);
        assert!(results
            .iter()
            .flatten()
            .all(|code| *code == "remix_in_progress"));
    }

    #[test]
    fn test_live_permit_holds_an_hourly_slot() {
        let dir = TempDir::new().unwrap();
        let safety = controller(&dir, SafetyLimits { hourly_limit: 1, ..limits() });
        let t0 = Utc::now();

        let _ = expect_permit(safety.check_before_action_at("p1", t0).unwrap());
        let denial = expect_denial(
            safety
                .check_before_action_at("p2", t0 + Duration::seconds(3))
                .unwrap(),
        );
        assert_eq!(
            denial,
            Denial::HourlyLimit {
                limit: 1,
                retry_after: std::time::Duration::from_secs(10 * 60 - 3)
            }
        );

        let status = safety.status_at(false, t0 + Duration::seconds(3)).unwrap();
        assert_eq!(status.requests_last_hour, 0);
        assert_eq!(status.in_flight.get("p1"), Some(&t0));
    }

    #[test]
    fn test_forgotten_permit_is_counted_as_failure() {
        let dir = TempDir::new().unwrap();
        let t0 = Utc::now();

        // The process that took this permit never came back.
        let _ = expect_permit(controller(&dir, limits()).check_before_action_at("p1", t0).unwrap());

        let safety = controller(&dir, limits());
        let still_live = expect_denial(
            safety
                .check_before_action_at("p1", t0 + Duration::minutes(9))
                .unwrap(),
        );
        assert_eq!(still_live.code(), "remix_in_progress");

        let later = t0 + Duration::minutes(11);
        let permit = expect_permit(safety.check_before_action_at("p1", later).unwrap());
        assert_eq!(permit.issued_at(), later);

        let status = safety.status_at(true, later).unwrap();
        assert_eq!(status.requests_last_hour, 1);
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(status.last_request_at, Some(t0));
        assert_eq!(status.in_flight.get("p1"), Some(&later));
        let log = status.recent_requests.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].project_id, "p1");
        assert_eq!(log[0].timestamp, t0);
        assert_eq!(log[0].error.as_deref(), Some(ABANDONED));
    }

    #[test]
    fn test_abandoned_trial_reopens_circuit() {
        let dir = TempDir::new().unwrap();
        let safety = controller(&dir, limits());
        let t0 = Utc::now();
        for i in 0..3 {
            safety
                .record_outcome("p1", &Outcome::failure("timeout"), t0 + Duration::seconds(i))
                .unwrap();
        }

        let t1 = t0 + Duration::minutes(16);
        let trial = expect_permit(safety.check_before_action_at("p2", t1).unwrap());
        assert!(trial.is_half_open_trial());

        // Noticed once the permit is stale; the cooldown starts then.
        let t2 = t1 + Duration::minutes(11);
        let denial = expect_denial(safety.check_before_action_at("p3", t2).unwrap());
        assert_eq!(denial.code(), "circuit_open");
        assert_eq!(
            denial.retry_after(),
            Some(std::time::Duration::from_secs(15 * 60))
        );
        let status = safety.status_at(false, t2).unwrap();
        assert_eq!(status.consecutive_failures, 4);
        assert!(status.in_flight.is_empty());
    }

    #[test]
    fn test_release_keeps_a_newer_permit() {
        let dir = TempDir::new().unwrap();
        let t0 = Utc::now();
        let first = controller(&dir, limits());
        let stale = expect_permit(first.check_before_action_at("p1", t0).unwrap());

        let later = t0 + Duration::minutes(11);
        let fresh = expect_permit(controller(&dir, limits()).check_before_action_at("p1", later).unwrap());

        first.release(stale).unwrap();
        let status = first.status_at(false, later).unwrap();
        assert_eq!(status.in_flight.get("p1"), Some(&fresh.issued_at()));
    }

    #[test]
    fn test_denial_messages() {
        let d = Denial::RateLimited {
            wait: std::time::Duration::from_millis(1500),
        };
        assert_eq!(d.to_string(), "rate limited: wait 1.5s before the next request");

        let d = Denial::AlreadyRemixed {
            project_id: "p1".into(),
            new_project_id: None,
        };
        assert_eq!(d.to_string(), "project p1 was already remixed");
    }
}
