//! In-memory [`BrowserDriver`] that plays back a scripted page and records
//! every call, for exercising flows without a browser.

use async_trait::async_trait;
use remixctl_core::Cookie;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::driver::{BrowserDriver, DriverError, DriverResult, OutboundRequest};

#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    Goto(String),
    Fill { selector: String, text: String },
    Click(String),
    ClickByText { selector: String, text: String },
    WaitForSelector(String),
    Attribute { selector: String, name: String },
    CurrentUrl,
    WaitForUrl,
    SubscribeRequests,
    Cookies,
    SetCookies(Vec<Cookie>),
    Close,
}

#[derive(Debug, Default)]
struct Script {
    url: String,
    present: HashSet<String>,
    attributes: HashMap<(String, String), String>,
    /// Click target (selector, or button text for `click_by_text`) -> URL it leads to.
    navigations: HashMap<String, String>,
    failing_urls: HashSet<String>,
    /// Click targets after which the browser goes away.
    crash_targets: HashSet<String>,
    requests: Vec<OutboundRequest>,
    cookies: Vec<Cookie>,
    calls: Vec<DriverCall>,
    closed: bool,
}

/// Shared view of a [`ScriptedDriver`]'s script, kept by the test after the
/// driver itself has been handed to a flow.
#[derive(Clone, Default)]
pub struct ScriptHandle(Arc<Mutex<Script>>);

impl ScriptHandle {
    fn lock(&self) -> MutexGuard<'_, Script> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.lock().calls.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn url(&self) -> String {
        self.lock().url.clone()
    }

    pub fn attribute(&self, selector: &str, name: &str) -> Option<String> {
        self.lock()
            .attributes
            .get(&(selector.to_string(), name.to_string()))
            .cloned()
    }

    pub fn clicked(&self, target: &str) -> bool {
        self.lock().calls.iter().any(|c| match c {
            DriverCall::Click(s) => s == target,
            DriverCall::ClickByText { text, .. } => text == target,
            _ => false,
        })
    }
}

#[derive(Default)]
pub struct ScriptedDriver {
    handle: ScriptHandle,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> ScriptHandle {
        self.handle.clone()
    }

    /// Elements matching `selector` exist and are visible.
    pub fn with_element(self, selector: &str) -> Self {
        self.handle.lock().present.insert(selector.to_string());
        self
    }

    /// An element carrying an attribute; clicking it toggles `aria-checked`.
    pub fn with_attribute(self, selector: &str, name: &str, value: &str) -> Self {
        {
            let mut s = self.handle.lock();
            s.present.insert(selector.to_string());
            s.attributes
                .insert((selector.to_string(), name.to_string()), value.to_string());
        }
        self
    }

    /// Clicking `target` (a selector, or the text passed to `click_by_text`)
    /// moves the page to `url`.
    pub fn navigates_on_click(self, target: &str, url: &str) -> Self {
        self.handle
            .lock()
            .navigations
            .insert(target.to_string(), url.to_string());
        self
    }

    /// The browser dies right after `target` is clicked.
    pub fn crashes_on_click(self, target: &str) -> Self {
        self.handle.lock().crash_targets.insert(target.to_string());
        self
    }

    pub fn failing_navigation(self, url: &str) -> Self {
        self.handle.lock().failing_urls.insert(url.to_string());
        self
    }

    /// Requests delivered to every subscriber.
    pub fn with_request(self, request: OutboundRequest) -> Self {
        self.handle.lock().requests.push(request);
        self
    }

    pub fn with_cookie(self, cookie: Cookie) -> Self {
        self.handle.lock().cookies.push(cookie);
        self
    }

    fn record(&self, call: DriverCall) -> MutexGuard<'_, Script> {
        let mut s = self.handle.lock();
        s.calls.push(call);
        s
    }

    fn check_open(s: &Script) -> DriverResult<()> {
        if s.closed {
            Err(DriverError::Closed)
        } else {
            Ok(())
        }
    }

    fn toggle_switch(s: &mut Script, selector: &str) {
        let key = (selector.to_string(), "aria-checked".to_string());
        if let Some(v) = s.attributes.get_mut(&key) {
            *v = if v == "true" { "false".into() } else { "true".into() };
        }
    }
}

#[async_trait]
impl BrowserDriver for ScriptedDriver {
    async fn goto(&mut self, url: &str, _timeout: Duration) -> DriverResult<()> {
        let mut s = self.record(DriverCall::Goto(url.to_string()));
        Self::check_open(&s)?;
        if s.failing_urls.contains(url) {
            return Err(DriverError::Navigation(format!("{}: net::ERR_FAILED", url)));
        }
        s.url = url.to_string();
        Ok(())
    }

    async fn fill(&mut self, selector: &str, text: &str, _timeout: Duration) -> DriverResult<()> {
        let s = self.record(DriverCall::Fill {
            selector: selector.to_string(),
            text: text.to_string(),
        });
        Self::check_open(&s)?;
        if !s.present.contains(selector) {
            return Err(DriverError::ElementNotFound {
                selector: selector.to_string(),
            });
        }
        Ok(())
    }

    async fn click(&mut self, selector: &str, _timeout: Duration) -> DriverResult<()> {
        let mut s = self.record(DriverCall::Click(selector.to_string()));
        Self::check_open(&s)?;
        if !s.present.contains(selector) {
            return Err(DriverError::ElementNotFound {
                selector: selector.to_string(),
            });
        }
        Self::toggle_switch(&mut s, selector);
        if let Some(url) = s.navigations.get(selector).cloned() {
            s.url = url;
        }
        s.closed = s.crash_targets.contains(selector);
        Ok(())
    }

    async fn click_by_text(&mut self, selector: &str, text: &str, _timeout: Duration) -> DriverResult<()> {
        let mut s = self.record(DriverCall::ClickByText {
            selector: selector.to_string(),
            text: text.to_string(),
        });
        Self::check_open(&s)?;
        if !s.present.contains(selector) {
            return Err(DriverError::ElementNotFound {
                selector: format!("{} containing {:?}", selector, text),
            });
        }
        if let Some(url) = s.navigations.get(text).cloned() {
            s.url = url;
        }
        s.closed = s.crash_targets.contains(text);
        Ok(())
    }

    async fn wait_for_selector(&mut self, selector: &str, _timeout: Duration) -> DriverResult<()> {
        let s = self.record(DriverCall::WaitForSelector(selector.to_string()));
        Self::check_open(&s)?;
        if s.present.contains(selector) {
            Ok(())
        } else {
            Err(DriverError::ElementNotFound {
                selector: selector.to_string(),
            })
        }
    }

    async fn attribute(&mut self, selector: &str, name: &str, _timeout: Duration) -> DriverResult<Option<String>> {
        let s = self.record(DriverCall::Attribute {
            selector: selector.to_string(),
            name: name.to_string(),
        });
        Self::check_open(&s)?;
        if !s.present.contains(selector) {
            return Err(DriverError::ElementNotFound {
                selector: selector.to_string(),
            });
        }
        Ok(s.attributes
            .get(&(selector.to_string(), name.to_string()))
            .cloned())
    }

    async fn current_url(&mut self) -> DriverResult<String> {
        let s = self.record(DriverCall::CurrentUrl);
        Self::check_open(&s)?;
        Ok(s.url.clone())
    }

    async fn wait_for_url(
        &mut self,
        predicate: &(dyn for<'s> Fn(&'s str) -> bool + Send + Sync),
        timeout: Duration,
    ) -> DriverResult<String> {
        let s = self.record(DriverCall::WaitForUrl);
        Self::check_open(&s)?;
        if predicate(&s.url) {
            Ok(s.url.clone())
        } else {
            Err(DriverError::Timeout {
                what: "URL change".to_string(),
                after: timeout,
            })
        }
    }

    async fn subscribe_requests(&mut self) -> DriverResult<mpsc::UnboundedReceiver<OutboundRequest>> {
        let s = self.record(DriverCall::SubscribeRequests);
        Self::check_open(&s)?;
        let (tx, rx) = mpsc::unbounded_channel();
        for request in s.requests.iter().filter(|r| r.has_authorization()) {
            let _ = tx.send(request.clone());
        }
        // Dropping `tx` ends the stream once the scripted requests are read.
        Ok(rx)
    }

    async fn cookies(&mut self) -> DriverResult<Vec<Cookie>> {
        let s = self.record(DriverCall::Cookies);
        Self::check_open(&s)?;
        Ok(s.cookies.clone())
    }

    async fn set_cookies(&mut self, cookies: &[Cookie]) -> DriverResult<()> {
        let mut s = self.record(DriverCall::SetCookies(cookies.to_vec()));
        Self::check_open(&s)?;
        s.cookies.extend_from_slice(cookies);
        Ok(())
    }

    async fn close(&mut self) -> DriverResult<()> {
        let mut s = self.record(DriverCall::Close);
        s.closed = true;
        Ok(())
    }
}
