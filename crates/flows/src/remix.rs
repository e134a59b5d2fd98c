//! Remix flow: gate on the safety controller, confirm with the user, then
//! drive the project page through menu, dialog and redirect.

use chrono::Utc;
use remixctl_browser::{BrowserDriver, DriverError, DriverResult};
use remixctl_core::{is_valid_project_id, Config, Error, ProjectUrlMatcher, Result};
use remixctl_safety::{Decision, Denial, Outcome, Permit, SafetyController};
use remixctl_storage::{SessionRecord, SessionStore};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long to look for the optional confirmation dialog and its switch.
const DIALOG_LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);
const SWITCH_LOOKUP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemixErrorKind {
    CircuitOpen,
    RateLimited,
    HourlyLimit,
    DailyLimit,
    AlreadyRemixed,
    RemixInProgress,
    UserDeclined,
    NavigationError,
    ElementNotFound,
    TimeoutDetectingRedirect,
    Unauthenticated,
}

impl RemixErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemixErrorKind::CircuitOpen => "circuit_open",
            RemixErrorKind::RateLimited => "rate_limited",
            RemixErrorKind::HourlyLimit => "hourly_limit",
            RemixErrorKind::DailyLimit => "daily_limit",
            RemixErrorKind::AlreadyRemixed => "already_remixed",
            RemixErrorKind::RemixInProgress => "remix_in_progress",
            RemixErrorKind::UserDeclined => "user_declined",
            RemixErrorKind::NavigationError => "navigation_error",
            RemixErrorKind::ElementNotFound => "element_not_found",
            RemixErrorKind::TimeoutDetectingRedirect => "timeout_detecting_redirect",
            RemixErrorKind::Unauthenticated => "unauthenticated",
        }
    }

    /// Expected refusals; never counted as failures.
    pub fn is_policy_denial(&self) -> bool {
        matches!(
            self,
            RemixErrorKind::CircuitOpen
                | RemixErrorKind::RateLimited
                | RemixErrorKind::HourlyLimit
                | RemixErrorKind::DailyLimit
                | RemixErrorKind::AlreadyRemixed
                | RemixErrorKind::RemixInProgress
                | RemixErrorKind::UserDeclined
        )
    }

    /// Definite automation failures worth another attempt. A redirect
    /// timeout is excluded: the remix may have been created anyway.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RemixErrorKind::NavigationError | RemixErrorKind::ElementNotFound
        )
    }

    /// The outcome is unknown rather than failed.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, RemixErrorKind::TimeoutDetectingRedirect)
    }
}

impl fmt::Display for RemixErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&Denial> for RemixErrorKind {
    fn from(d: &Denial) -> Self {
        match d {
            Denial::CircuitOpen { .. } => RemixErrorKind::CircuitOpen,
            Denial::RateLimited { .. } => RemixErrorKind::RateLimited,
            Denial::HourlyLimit { .. } => RemixErrorKind::HourlyLimit,
            Denial::DailyLimit { .. } => RemixErrorKind::DailyLimit,
            Denial::AlreadyRemixed { .. } => RemixErrorKind::AlreadyRemixed,
            Denial::InProgress { .. } => RemixErrorKind::RemixInProgress,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemixStage {
    SafetyCheck,
    SessionCheck,
    Confirmation,
    Navigate,
    OpenMenu,
    ConfirmDialog,
    AwaitRedirect,
    Done,
}

#[derive(Debug, Clone)]
pub struct RemixRequest {
    pub project_id: String,
    pub include_history: bool,
    pub skip_confirmation: bool,
}

/// Asks the operator to approve a pending remix.
pub trait Confirmer: Send + Sync {
    fn confirm(&self, request: &RemixRequest) -> bool;
}

pub struct AlwaysConfirm;

impl Confirmer for AlwaysConfirm {
    fn confirm(&self, _request: &RemixRequest) -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemixResult {
    pub success: bool,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_project_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RemixErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<RemixStage>,
    /// Final state of the dialog's history switch, when history was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_included: Option<bool>,
    /// Wait imposed by a policy denial, when one applies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub duration_ms: u64,
}

impl RemixResult {
    fn failed(
        project_id: &str,
        kind: RemixErrorKind,
        stage: RemixStage,
        message: impl Into<String>,
        started: Instant,
    ) -> Self {
        Self {
            success: false,
            project_id: project_id.to_string(),
            new_project_id: None,
            new_project_url: None,
            error: Some(kind),
            message: Some(message.into()),
            failed_stage: Some(stage),
            history_included: None,
            retry_after_ms: None,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    pub fn error_kind(&self) -> Option<RemixErrorKind> {
        self.error
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

/// Outcome of the browser-driven part of the flow.
struct Remixed {
    new_project_id: String,
    new_project_url: String,
    history_included: Option<bool>,
}

struct StageFailure {
    stage: RemixStage,
    kind: RemixErrorKind,
    message: String,
}

impl StageFailure {
    fn new(stage: RemixStage, kind: RemixErrorKind, err: impl fmt::Display) -> Self {
        Self {
            stage,
            kind,
            message: err.to_string(),
        }
    }
}

pub struct RemixFlow<'a> {
    config: &'a Config,
    safety: &'a SafetyController,
    sessions: &'a SessionStore,
    confirmer: &'a dyn Confirmer,
}

impl<'a> RemixFlow<'a> {
    pub fn new(
        config: &'a Config,
        safety: &'a SafetyController,
        sessions: &'a SessionStore,
        confirmer: &'a dyn Confirmer,
    ) -> Self {
        Self {
            config,
            safety,
            sessions,
            confirmer,
        }
    }

    /// Run one remix attempt. Expected refusals and automation failures come
    /// back as an unsuccessful [`RemixResult`]; `Err` is reserved for
    /// configuration, storage and browser-launch problems.
    pub async fn run<D, F, Fut>(&self, request: &RemixRequest, launch: F) -> Result<RemixResult>
    where
        D: BrowserDriver,
        F: FnOnce() -> Fut,
        Fut: Future<Output = DriverResult<D>>,
    {
        let started = Instant::now();
        let project_id = request.project_id.as_str();
        if !is_valid_project_id(project_id) {
            return Err(Error::Validation(format!("invalid project id: {:?}", project_id)));
        }
        let matcher = self.config.site.project_matcher()?;

        let permit = match self.safety.check_before_action(project_id)? {
            Decision::Permit(permit) => permit,
            Decision::Deny(denial) => {
                let mut result = RemixResult::failed(
                    project_id,
                    RemixErrorKind::from(&denial),
                    RemixStage::SafetyCheck,
                    denial.to_string(),
                    started,
                );
                if let Denial::AlreadyRemixed { new_project_id, .. } = &denial {
                    result.new_project_id = new_project_id.clone();
                }
                result.retry_after_ms = denial.retry_after().map(|d| d.as_millis() as u64);
                return Ok(result);
            }
        };

        let stored = match self.sessions.load_valid(Utc::now(), self.config.session.max_age()) {
            Ok(stored) => stored,
            Err(e) => {
                self.safety.release(permit)?;
                return Err(e);
            }
        };
        let Some(session) = stored else {
            self.safety.release(permit)?;
            return Ok(RemixResult::failed(
                project_id,
                RemixErrorKind::Unauthenticated,
                RemixStage::SessionCheck,
                "no valid session; run `remixctl auth` first",
                started,
            ));
        };

        if !request.skip_confirmation && !self.confirmer.confirm(request) {
            self.safety.release(permit)?;
            info!(project_id = %project_id, "Remix declined");
            return Ok(RemixResult::failed(
                project_id,
                RemixErrorKind::UserDeclined,
                RemixStage::Confirmation,
                "remix declined",
                started,
            ));
        }

        let mut driver = match launch().await {
            Ok(driver) => driver,
            Err(e) => {
                self.safety.release(permit)?;
                return Err(e.into());
            }
        };

        info!(
            project_id = %project_id,
            include_history = request.include_history,
            half_open_trial = permit.is_half_open_trial(),
            "Starting remix"
        );
        let outcome = self.drive(&mut driver, request, &session, &matcher).await;
        if let Err(e) = driver.close().await {
            warn!("Failed to close browser after remix: {}", e);
        }

        self.finish(permit, outcome, request, started)
    }

    fn finish(
        &self,
        permit: Permit,
        outcome: std::result::Result<Remixed, StageFailure>,
        request: &RemixRequest,
        started: Instant,
    ) -> Result<RemixResult> {
        let project_id = permit.project_id().to_string();
        match outcome {
            Ok(remixed) => {
                self.safety.record_outcome(
                    &project_id,
                    &Outcome::success(Some(remixed.new_project_id.clone())),
                    Utc::now(),
                )?;
                info!(
                    project_id = %project_id,
                    new_project_id = %remixed.new_project_id,
                    "Remix created"
                );
                Ok(RemixResult {
                    success: true,
                    project_id,
                    new_project_id: Some(remixed.new_project_id),
                    new_project_url: Some(remixed.new_project_url),
                    error: None,
                    message: None,
                    failed_stage: None,
                    history_included: if request.include_history {
                        remixed.history_included
                    } else {
                        None
                    },
                    retry_after_ms: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                })
            }
            Err(failure) => {
                self.safety.record_outcome(
                    &project_id,
                    &Outcome::failure(failure.kind.as_str()),
                    Utc::now(),
                )?;
                if failure.kind.is_ambiguous() {
                    warn!(
                        project_id = %project_id,
                        "No redirect seen; the remix may still have been created, check the dashboard"
                    );
                } else {
                    warn!(
                        project_id = %project_id,
                        stage = ?failure.stage,
                        error = failure.kind.as_str(),
                        "Remix failed: {}",
                        failure.message
                    );
                }
                Ok(RemixResult::failed(
                    &project_id,
                    failure.kind,
                    failure.stage,
                    failure.message,
                    started,
                ))
            }
        }
    }

    async fn drive<D: BrowserDriver>(
        &self,
        driver: &mut D,
        request: &RemixRequest,
        session: &SessionRecord,
        matcher: &ProjectUrlMatcher,
    ) -> std::result::Result<Remixed, StageFailure> {
        let site = &self.config.site;
        let sel = &site.selectors;
        let browser = &self.config.browser;
        let source_id = request.project_id.clone();

        let nav_failed = |e: DriverError| StageFailure::new(RemixStage::Navigate, RemixErrorKind::NavigationError, e);
        driver
            .set_cookies(&session.live_cookies(Utc::now()))
            .await
            .map_err(nav_failed)?;
        driver
            .goto(&site.project_url(&source_id), browser.navigation_timeout())
            .await
            .map_err(nav_failed)?;
        debug!(project_id = %source_id, "Project page loaded");

        let menu_failed = |e: DriverError| StageFailure::new(RemixStage::OpenMenu, RemixErrorKind::ElementNotFound, e);
        driver
            .click(&sel.project_menu_button, browser.action_timeout())
            .await
            .map_err(menu_failed)?;
        driver
            .click_by_text(&sel.menu_item, &sel.remix_menu_text, browser.action_timeout())
            .await
            .map_err(menu_failed)?;

        let history_included = self.handle_dialog(driver, request).await?;

        let is_new_project =
            move |url: &str| matches!(matcher.project_id(url), Some(id) if id != source_id);
        let new_url = match driver
            .wait_for_url(&is_new_project, browser.redirect_timeout())
            .await
        {
            Ok(url) => url,
            Err(DriverError::Timeout { .. }) => {
                // The page may have moved just as the wait gave up.
                match driver.current_url().await {
                    Ok(url) if is_new_project(&url) => url,
                    _ => {
                        return Err(StageFailure::new(
                            RemixStage::AwaitRedirect,
                            RemixErrorKind::TimeoutDetectingRedirect,
                            format!(
                                "no redirect to a new project within {}s",
                                browser.redirect_timeout().as_secs()
                            ),
                        ))
                    }
                }
            }
            Err(e) => {
                return Err(StageFailure::new(
                    RemixStage::AwaitRedirect,
                    RemixErrorKind::NavigationError,
                    e,
                ))
            }
        };

        let new_project_id = matcher.project_id(&new_url).ok_or_else(|| {
            StageFailure::new(
                RemixStage::AwaitRedirect,
                RemixErrorKind::NavigationError,
                format!("redirected to {} without a project id", new_url),
            )
        })?;
        Ok(Remixed {
            new_project_url: site.project_url(&new_project_id),
            new_project_id,
            history_included,
        })
    }

    /// Set the dialog's history switch and confirm. Returns the switch's
    /// final state, if the switch was found.
    async fn handle_dialog<D: BrowserDriver>(
        &self,
        driver: &mut D,
        request: &RemixRequest,
    ) -> std::result::Result<Option<bool>, StageFailure> {
        let sel = &self.config.site.selectors;
        let action_timeout = self.config.browser.action_timeout();

        match driver.wait_for_selector(&sel.dialog, DIALOG_LOOKUP_TIMEOUT).await {
            Ok(()) => {}
            Err(DriverError::ElementNotFound { .. }) => {
                info!("No confirmation dialog; remix may start directly");
                return Ok(None);
            }
            Err(e) => {
                return Err(StageFailure::new(
                    RemixStage::ConfirmDialog,
                    RemixErrorKind::ElementNotFound,
                    e,
                ))
            }
        }

        let history_included = match driver
            .attribute(&sel.history_switch, "aria-checked", SWITCH_LOOKUP_TIMEOUT)
            .await
        {
            Ok(state) => {
                let enabled = state.as_deref() == Some("true");
                if enabled == request.include_history {
                    Some(enabled)
                } else {
                    driver
                        .click(&sel.history_switch, action_timeout)
                        .await
                        .map_err(|e| StageFailure::new(RemixStage::ConfirmDialog, RemixErrorKind::ElementNotFound, e))?;
                    let after = driver
                        .attribute(&sel.history_switch, "aria-checked", SWITCH_LOOKUP_TIMEOUT)
                        .await
                        .ok()
                        .flatten();
                    debug!(include_history = request.include_history, "History switch toggled");
                    Some(after.as_deref() == Some("true"))
                }
            }
            Err(e) => {
                debug!("History switch not present: {}", e);
                None
            }
        };

        driver
            .click_by_text(&sel.confirm_button, &sel.confirm_text, action_timeout)
            .await
            .map_err(|e| StageFailure::new(RemixStage::ConfirmDialog, RemixErrorKind::ElementNotFound, e))?;
        debug!("Remix confirmed in dialog");
        Ok(history_included)
    }
}
