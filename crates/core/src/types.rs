use serde::{Deserialize, Serialize};

/// A browser cookie as captured after login and restored before a remix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    /// Expiry as seconds since the Unix epoch; `None` for session cookies.
    #[serde(default)]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: default_cookie_path(),
            expires: None,
            http_only: false,
            secure: false,
        }
    }

    pub fn is_expired_at(&self, unix_secs: f64) -> bool {
        matches!(self.expires, Some(exp) if exp > 0.0 && exp <= unix_secs)
    }
}
