use async_trait::async_trait;
use remixctl_core::Cookie;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("element not found: {selector}")]
    ElementNotFound { selector: String },

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("timed out after {}ms waiting for {what}", .after.as_millis())]
    Timeout { what: String, after: Duration },

    #[error("browser protocol error: {0}")]
    Protocol(String),

    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("browser is closed")]
    Closed,
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

impl From<DriverError> for remixctl_core::Error {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::Timeout { .. } => remixctl_core::Error::Timeout(e.to_string()),
            other => remixctl_core::Error::Browser(other.to_string()),
        }
    }
}

/// An outbound HTTP request observed in the page.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
}

impl OutboundRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn has_authorization(&self) -> bool {
        self.header("authorization").is_some()
    }

    /// Header lookup, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// The operations the login and remix flows need from a browser.
///
/// Every wait takes an explicit bound; implementations must never block
/// indefinitely.
#[async_trait]
pub trait BrowserDriver: Send {
    async fn goto(&mut self, url: &str, timeout: Duration) -> DriverResult<()>;

    /// Wait for `selector`, then replace its value with `text`.
    async fn fill(&mut self, selector: &str, text: &str, timeout: Duration) -> DriverResult<()>;

    async fn click(&mut self, selector: &str, timeout: Duration) -> DriverResult<()>;

    /// Click the first element matching `selector` whose text contains `text`.
    async fn click_by_text(&mut self, selector: &str, text: &str, timeout: Duration) -> DriverResult<()>;

    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> DriverResult<()>;

    /// Wait for `selector` and read one of its attributes.
    async fn attribute(&mut self, selector: &str, name: &str, timeout: Duration) -> DriverResult<Option<String>>;

    async fn current_url(&mut self) -> DriverResult<String>;

    /// Poll the page URL until `predicate` accepts it.
    async fn wait_for_url(
        &mut self,
        predicate: &(dyn for<'s> Fn(&'s str) -> bool + Send + Sync),
        timeout: Duration,
    ) -> DriverResult<String>;

    /// Start observing outbound requests that carry an `Authorization`
    /// header. Requests made before the call are not delivered; none after
    /// it are dropped, however slowly the receiver drains.
    async fn subscribe_requests(&mut self) -> DriverResult<mpsc::UnboundedReceiver<OutboundRequest>>;

    async fn cookies(&mut self) -> DriverResult<Vec<Cookie>>;

    async fn set_cookies(&mut self, cookies: &[Cookie]) -> DriverResult<()>;

    async fn close(&mut self) -> DriverResult<()>;
}
