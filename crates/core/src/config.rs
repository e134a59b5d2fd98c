use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::paths::Paths;
use crate::project::{extract_project_id, ProjectUrlMatcher};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsConfig {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// API token obtained elsewhere; used in place of a browser login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
}

fn filled(v: &Option<String>) -> bool {
    v.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false)
}

impl CredentialsConfig {
    pub fn has_credentials(&self) -> bool {
        filled(&self.email) && filled(&self.password)
    }

    pub fn configured_token(&self) -> Option<&str> {
        self.bearer_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    /// Project remixed when the command line does not name one.
    #[serde(default)]
    pub default_project_id: Option<String>,
    /// Full project page URL; the id is extracted from it when
    /// `default_project_id` is unset.
    #[serde(default)]
    pub project_url: Option<String>,
}

impl ProjectConfig {
    pub fn resolve_project_id(&self) -> Option<String> {
        self.default_project_id
            .as_ref()
            .filter(|id| !id.trim().is_empty())
            .cloned()
            .or_else(|| self.project_url.as_deref().and_then(extract_project_id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    #[serde(default)]
    pub headless: bool,
    /// Pause inserted between UI steps, in milliseconds.
    #[serde(default = "default_slow_mo_ms")]
    pub slow_mo_ms: u64,
    /// Explicit Chrome/Chromium binary; auto-detected when unset.
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,
    #[serde(default = "default_navigation_timeout_ms")]
    pub navigation_timeout_ms: u64,
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,
    #[serde(default = "default_token_timeout_ms")]
    pub token_timeout_ms: u64,
    #[serde(default = "default_redirect_timeout_ms")]
    pub redirect_timeout_ms: u64,
}

fn default_slow_mo_ms() -> u64 {
    100
}

fn default_launch_timeout_secs() -> u64 {
    15
}

fn default_navigation_timeout_ms() -> u64 {
    30_000
}

fn default_action_timeout_ms() -> u64 {
    10_000
}

fn default_token_timeout_ms() -> u64 {
    15_000
}

fn default_redirect_timeout_ms() -> u64 {
    120_000
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: false,
            slow_mo_ms: default_slow_mo_ms(),
            executable: None,
            launch_timeout_secs: default_launch_timeout_secs(),
            navigation_timeout_ms: default_navigation_timeout_ms(),
            action_timeout_ms: default_action_timeout_ms(),
            token_timeout_ms: default_token_timeout_ms(),
            redirect_timeout_ms: default_redirect_timeout_ms(),
        }
    }
}

impl BrowserConfig {
    pub fn slow_mo(&self) -> Duration {
        Duration::from_millis(self.slow_mo_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn token_timeout(&self) -> Duration {
        Duration::from_millis(self.token_timeout_ms)
    }

    pub fn redirect_timeout(&self) -> Duration {
        Duration::from_millis(self.redirect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyConfig {
    /// Minimum gap between two recorded attempts.
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,
    #[serde(default = "default_max_requests_per_hour")]
    pub max_requests_per_hour: u32,
    #[serde(default = "default_max_remixes_per_day")]
    pub max_remixes_per_day: u32,
    /// Consecutive failures that open the circuit breaker.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_circuit_cooldown_minutes")]
    pub circuit_cooldown_minutes: u64,
    /// How long a permitted attempt may stay unrecorded before it is
    /// written off as abandoned.
    #[serde(default = "default_in_flight_timeout_minutes")]
    pub in_flight_timeout_minutes: u64,
    /// Hourly request count above which a warning is logged.
    #[serde(default = "default_warn_after_requests")]
    pub warn_after_requests: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_base_secs")]
    pub retry_backoff_base_secs: f64,
    #[serde(default = "default_retry_backoff_max_secs")]
    pub retry_backoff_max_secs: f64,
}

fn default_min_request_interval_ms() -> u64 {
    2000
}

fn default_max_requests_per_hour() -> u32 {
    60
}

fn default_max_remixes_per_day() -> u32 {
    20
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_circuit_cooldown_minutes() -> u64 {
    15
}

fn default_in_flight_timeout_minutes() -> u64 {
    10
}

fn default_warn_after_requests() -> u32 {
    10
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_base_secs() -> f64 {
    2.0
}

fn default_retry_backoff_max_secs() -> f64 {
    30.0
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            min_request_interval_ms: default_min_request_interval_ms(),
            max_requests_per_hour: default_max_requests_per_hour(),
            max_remixes_per_day: default_max_remixes_per_day(),
            max_consecutive_failures: default_max_consecutive_failures(),
            circuit_cooldown_minutes: default_circuit_cooldown_minutes(),
            in_flight_timeout_minutes: default_in_flight_timeout_minutes(),
            warn_after_requests: default_warn_after_requests(),
            max_retries: default_max_retries(),
            retry_backoff_base_secs: default_retry_backoff_base_secs(),
            retry_backoff_max_secs: default_retry_backoff_max_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// A captured token older than this is treated as stale.
    #[serde(default = "default_session_max_age_hours")]
    pub max_age_hours: u64,
}

fn default_session_max_age_hours() -> u64 {
    24
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_age_hours: default_session_max_age_hours(),
        }
    }
}

impl SessionConfig {
    pub fn max_age(&self) -> chrono::Duration {
        // Capped at roughly a century; chrono panics on out-of-range durations.
        chrono::Duration::hours(self.max_age_hours.min(24 * 365 * 100) as i64)
    }
}

/// CSS selectors used by the login and remix flows. Only defaults are
/// shipped; they are expected to be edited when the site markup moves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorConfig {
    #[serde(default = "default_email_input")]
    pub email_input: String,
    #[serde(default = "default_continue_button")]
    pub continue_button: String,
    #[serde(default = "default_continue_text")]
    pub continue_text: String,
    #[serde(default = "default_password_input")]
    pub password_input: String,
    #[serde(default = "default_submit_button")]
    pub submit_button: String,
    #[serde(default = "default_project_menu_button")]
    pub project_menu_button: String,
    #[serde(default = "default_menu_item")]
    pub menu_item: String,
    #[serde(default = "default_remix_menu_text")]
    pub remix_menu_text: String,
    #[serde(default = "default_dialog")]
    pub dialog: String,
    #[serde(default = "default_history_switch")]
    pub history_switch: String,
    #[serde(default = "default_confirm_button")]
    pub confirm_button: String,
    #[serde(default = "default_confirm_text")]
    pub confirm_text: String,
}

fn default_email_input() -> String {
    r#"input[type="email"]"#.to_string()
}

fn default_continue_button() -> String {
    "button".to_string()
}

fn default_continue_text() -> String {
    "Continue".to_string()
}

fn default_password_input() -> String {
    r#"input[type="password"]"#.to_string()
}

fn default_submit_button() -> String {
    r#"button[type="submit"]"#.to_string()
}

fn default_project_menu_button() -> String {
    "button[aria-haspopup='menu']".to_string()
}

fn default_menu_item() -> String {
    "[role='menuitem']".to_string()
}

fn default_remix_menu_text() -> String {
    "Remix".to_string()
}

fn default_dialog() -> String {
    "[role='dialog']".to_string()
}

fn default_history_switch() -> String {
    "[role='dialog'] [role='switch']".to_string()
}

fn default_confirm_button() -> String {
    "[role='dialog'] button".to_string()
}

fn default_confirm_text() -> String {
    "Remix".to_string()
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            email_input: default_email_input(),
            continue_button: default_continue_button(),
            continue_text: default_continue_text(),
            password_input: default_password_input(),
            submit_button: default_submit_button(),
            project_menu_button: default_project_menu_button(),
            menu_item: default_menu_item(),
            remix_menu_text: default_remix_menu_text(),
            dialog: default_dialog(),
            history_switch: default_history_switch(),
            confirm_button: default_confirm_button(),
            confirm_text: default_confirm_text(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_projects_path")]
    pub projects_path: String,
    /// Regex recognising a project page URL, first group the id. Derived
    /// from `base_url` and `projects_path` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_url_pattern: Option<String>,
    #[serde(default)]
    pub selectors: SelectorConfig,
}

fn default_base_url() -> String {
    "https://lovable.dev".to_string()
}

fn default_login_path() -> String {
    "/login".to_string()
}

fn default_projects_path() -> String {
    "/projects".to_string()
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            login_path: default_login_path(),
            projects_path: default_projects_path(),
            project_url_pattern: None,
            selectors: SelectorConfig::default(),
        }
    }
}

impl SiteConfig {
    fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn login_url(&self) -> String {
        format!("{}{}", self.base(), self.login_path)
    }

    pub fn projects_url(&self) -> String {
        format!("{}{}", self.base(), self.projects_path)
    }

    pub fn project_url(&self, project_id: &str) -> String {
        format!("{}/{}", self.projects_url(), project_id)
    }

    /// Matcher used to spot the redirect to a newly created project.
    pub fn project_matcher(&self) -> Result<ProjectUrlMatcher> {
        match self.project_url_pattern.as_deref().map(str::trim) {
            Some(pattern) if !pattern.is_empty() => ProjectUrlMatcher::from_pattern(pattern)
                .map_err(|e| Error::Config(format!("site.projectUrlPattern: {}", e))),
            _ => ProjectUrlMatcher::for_site(self.base(), &self.projects_path)
                .map_err(|e| Error::Config(format!("site.projectsPath: {}", e))),
        }
    }

    /// Cookie domain for the site host (`lovable.dev` for `https://lovable.dev`).
    pub fn host(&self) -> Option<String> {
        url_host(self.base())
    }
}

fn url_host(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let host = rest.split(['/', ':', '?']).next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub site: SiteConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            debug!(path = %config_path.display(), "Loading config");
            Self::load(&config_path)
        } else {
            debug!(path = %config_path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overlay `REMIXCTL_*` environment variables on top of the file config.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        if let Some(email) = get("REMIXCTL_EMAIL") {
            self.credentials.email = Some(email);
        }
        if let Some(password) = get("REMIXCTL_PASSWORD") {
            self.credentials.password = Some(password);
        }
        if let Some(token) = get("REMIXCTL_BEARER_TOKEN") {
            self.credentials.bearer_token = Some(token);
        }
        if let Some(id) = get("REMIXCTL_PROJECT_ID") {
            self.project.default_project_id = Some(id);
        }
        if let Some(url) = get("REMIXCTL_PROJECT_URL") {
            self.project.project_url = Some(url);
        }
        if let Some(headless) = get("REMIXCTL_HEADLESS") {
            self.browser.headless = matches!(
                headless.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
    }

    /// Reject limits that would silently disable a safety mechanism.
    pub fn validate(&self) -> Result<()> {
        let s = &self.safety;
        if s.max_consecutive_failures == 0 {
            return Err(Error::Config(
                "safety.maxConsecutiveFailures must be at least 1".to_string(),
            ));
        }
        if s.max_requests_per_hour == 0 || s.max_remixes_per_day == 0 {
            return Err(Error::Config(
                "safety hourly/daily ceilings must be at least 1".to_string(),
            ));
        }
        if s.in_flight_timeout_minutes == 0 {
            return Err(Error::Config(
                "safety.inFlightTimeoutMinutes must be at least 1".to_string(),
            ));
        }
        if s.circuit_cooldown_minutes == 0 {
            return Err(Error::Config(
                "safety.circuitCooldownMinutes must be at least 1".to_string(),
            ));
        }
        if !(s.retry_backoff_base_secs.is_finite() && s.retry_backoff_base_secs >= 1.0) {
            return Err(Error::Config(
                "safety.retryBackoffBaseSecs must be >= 1.0".to_string(),
            ));
        }
        if self.session.max_age_hours == 0 {
            return Err(Error::Config(
                "session.maxAgeHours must be at least 1".to_string(),
            ));
        }
        self.site.project_matcher()?;
        if self.site.host().is_none() {
            return Err(Error::Config(format!(
                "site.baseUrl has no host: {}",
                self.site.base_url
            )));
        }
        Ok(())
    }
}
