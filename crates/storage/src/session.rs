use chrono::{DateTime, Duration, Utc};
use remixctl_core::{Cookie, Paths, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::json_file::LockedJsonFile;

/// Authentication artifacts captured by a successful login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(cookies: Vec<Cookie>, bearer_token: Option<String>, captured_at: DateTime<Utc>) -> Self {
        Self {
            cookies,
            bearer_token,
            captured_at,
        }
    }

    /// A record is usable only with a token captured inside the freshness window.
    /// Timestamps from the future (clock skew, hand-edited files) are rejected too.
    pub fn is_valid_at(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        let has_token = self
            .bearer_token
            .as_deref()
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false);
        if !has_token {
            return false;
        }
        let age = now - self.captured_at;
        age >= Duration::zero() && age < max_age
    }

    /// Cookies still alive at `now`, for restoring into a fresh browser.
    pub fn live_cookies(&self, now: DateTime<Utc>) -> Vec<Cookie> {
        let now_secs = now.timestamp() as f64;
        self.cookies
            .iter()
            .filter(|c| !c.is_expired_at(now_secs))
            .cloned()
            .collect()
    }

    /// Token preview safe for terminal output.
    pub fn masked_token(&self) -> Option<String> {
        let chars: Vec<char> = self.bearer_token.as_deref()?.chars().collect();
        if chars.len() <= 30 {
            return Some(format!("{}...", chars.iter().take(6).collect::<String>()));
        }
        let head: String = chars[..20].iter().collect();
        let tail: String = chars[chars.len() - 10..].iter().collect();
        Some(format!("{}...{}", head, tail))
    }
}

/// Durable home of the [`SessionRecord`]; shared by every process using the
/// same data directory.
pub struct SessionStore {
    file: LockedJsonFile<Option<SessionRecord>>,
}

impl SessionStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            file: LockedJsonFile::new(path),
        }
    }

    pub fn from_paths(paths: &Paths) -> Self {
        Self::new(paths.session_file())
    }

    pub fn load(&self) -> Result<Option<SessionRecord>> {
        self.file.read()
    }

    /// The stored record if it is still fresh at `now`.
    pub fn load_valid(&self, now: DateTime<Utc>, max_age: Duration) -> Result<Option<SessionRecord>> {
        let record = self.load()?;
        match record {
            Some(r) if r.is_valid_at(now, max_age) => Ok(Some(r)),
            Some(r) => {
                debug!(captured_at = %r.captured_at, "Stored session is stale or has no token");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub fn save(&self, record: &SessionRecord) -> Result<()> {
        self.file.write(&Some(record.clone()))?;
        info!(
            cookies = record.cookies.len(),
            has_token = record.bearer_token.is_some(),
            "Session saved"
        );
        Ok(())
    }

    pub fn clear(&self) -> Result<bool> {
        let removed = self.file.remove()?;
        if removed {
            info!("Stored session cleared");
        }
        Ok(removed)
    }
}
