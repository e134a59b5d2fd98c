use std::path::PathBuf;

/// Environment variable that relocates the whole data directory.
pub const HOME_ENV: &str = "REMIXCTL_HOME";

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        if let Ok(home) = std::env::var(HOME_ENV) {
            if !home.trim().is_empty() {
                return Self::with_base(PathBuf::from(home));
            }
        }
        let base = dirs::home_dir()
            .map(|h| h.join(".remixctl"))
            .unwrap_or_else(|| PathBuf::from(".remixctl"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn session_dir(&self) -> PathBuf {
        self.base.join("session")
    }

    /// Cookies + bearer token captured by the login flow.
    pub fn session_file(&self) -> PathBuf {
        self.session_dir().join("session.json")
    }

    /// Rate-limit counters, circuit breaker and idempotency ledger.
    pub fn safety_state_file(&self) -> PathBuf {
        self.session_dir().join("safety_state.json")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.base.join("audit")
    }

    pub fn browser_profile_dir(&self) -> PathBuf {
        self.base.join("browser-profile")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.session_dir())?;
        std::fs::create_dir_all(self.audit_dir())?;
        std::fs::create_dir_all(self.browser_profile_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
