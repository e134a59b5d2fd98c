//! Browser automation for remixctl: a small [`BrowserDriver`] abstraction,
//! and a Chrome DevTools Protocol implementation of it.

pub mod cdp;
pub mod chrome;
pub mod driver;
pub mod launcher;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use chrome::ChromeDriver;
pub use driver::{BrowserDriver, DriverError, DriverResult, OutboundRequest};
