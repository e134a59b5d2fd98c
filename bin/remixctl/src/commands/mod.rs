pub mod auth;
pub mod remix;
pub mod reset;
pub mod status;

use remixctl_browser::{ChromeDriver, DriverResult};
use remixctl_core::{Config, Paths};
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::pin::Pin;

pub type LaunchFuture = Pin<Box<dyn Future<Output = DriverResult<ChromeDriver>>>>;

/// Configuration and locations shared by every command.
pub struct Context {
    pub paths: Paths,
    pub config: Config,
}

impl Context {
    pub fn load(data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let paths = data_dir.map(Paths::with_base).unwrap_or_default();
        let mut config = Config::load_or_default(&paths)?;
        config.apply_env_overrides();
        config.validate()?;
        paths.ensure_dirs()?;
        Ok(Self { paths, config })
    }

    /// Browser launcher handed to the flows; only invoked once a flow
    /// actually needs a browser.
    pub fn launcher(&self) -> impl FnOnce() -> LaunchFuture {
        let browser = self.config.browser.clone();
        let profile_root = self.paths.browser_profile_dir();
        move || -> LaunchFuture {
            Box::pin(async move { ChromeDriver::launch(&browser, &profile_root).await })
        }
    }
}

/// Ask a yes/no question on the terminal; anything but `y`/`yes` is no.
pub fn prompt_yes_no(question: &str) -> std::io::Result<bool> {
    print!("{} [y/N] ", question);
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    let answer = input.trim();
    Ok(answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes"))
}
