//! Locating and starting a Chromium-family browser with remote debugging.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::driver::{DriverError, DriverResult};

/// A running browser process and the page target to drive.
pub struct LaunchedBrowser {
    pub process: Child,
    pub debug_port: u16,
    pub page_ws_url: String,
    pub user_data_dir: PathBuf,
}

pub struct LaunchOptions<'a> {
    pub executable: Option<&'a str>,
    pub user_data_dir: &'a Path,
    pub headless: bool,
    pub ready_timeout: Duration,
}

pub async fn launch(opts: LaunchOptions<'_>) -> DriverResult<LaunchedBrowser> {
    let binary = match opts.executable {
        Some(path) => path.to_string(),
        None => find_browser_binary().ok_or_else(|| {
            DriverError::Launch(
                "no Chrome, Chromium or Edge binary found; set browser.executable".to_string(),
            )
        })?,
    };

    std::fs::create_dir_all(opts.user_data_dir).map_err(|e| {
        DriverError::Launch(format!(
            "failed to create browser profile dir {}: {}",
            opts.user_data_dir.display(),
            e
        ))
    })?;

    let debug_port = find_free_port().await?;
    let args = build_browser_args(debug_port, opts.user_data_dir, opts.headless);

    info!(
        browser = %binary,
        port = debug_port,
        headless = opts.headless,
        "Launching browser"
    );

    let process = Command::new(&binary)
        .args(&args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| DriverError::Launch(format!("failed to start {}: {}", binary, e)))?;

    wait_for_cdp_ready(debug_port, opts.ready_timeout).await?;
    let page_ws_url = get_page_ws_url(debug_port).await?;
    debug!(ws_url = %page_ws_url, "Page target ready");

    Ok(LaunchedBrowser {
        process,
        debug_port,
        page_ws_url,
        user_data_dir: opts.user_data_dir.to_path_buf(),
    })
}

fn build_browser_args(debug_port: u16, user_data_dir: &Path, headless: bool) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", debug_port),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-extensions".to_string(),
        "--disable-sync".to_string(),
        "--disable-translate".to_string(),
        "--password-store=basic".to_string(),
    ];
    if headless {
        args.push("--headless=new".to_string());
    }
    args.push("--window-size=1280,800".to_string());
    args.push("about:blank".to_string());
    args
}

/// First Chrome/Chromium/Edge binary found on this machine.
pub fn find_browser_binary() -> Option<String> {
    let candidates: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
        ]
    } else if cfg!(target_os = "linux") {
        &[
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
            "microsoft-edge",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
        ]
    } else {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
        ]
    };

    for candidate in candidates {
        if Path::new(candidate).exists() {
            return Some(candidate.to_string());
        }
        let bare = !candidate.contains('/') && !candidate.contains('\\');
        if bare && which::which(candidate).is_ok() {
            return Some(candidate.to_string());
        }
    }
    None
}

async fn find_free_port() -> DriverResult<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| DriverError::Launch(format!("failed to bind a local port: {}", e)))?;
    let port = listener
        .local_addr()
        .map_err(|e| DriverError::Launch(format!("failed to read local addr: {}", e)))?
        .port();
    drop(listener);
    Ok(port)
}

/// Poll `/json/version` until the DevTools endpoint answers.
async fn wait_for_cdp_ready(port: u16, timeout: Duration) -> DriverResult<()> {
    let start = Instant::now();
    let url = format!("http://127.0.0.1:{}/json/version", port);

    loop {
        if start.elapsed() > timeout {
            return Err(DriverError::Launch(format!(
                "DevTools endpoint not ready after {}s on port {}",
                timeout.as_secs(),
                port
            )));
        }
        if let Ok(resp) = reqwest::get(&url).await {
            if let Ok(body) = resp.json::<Value>().await {
                if body.get("webSocketDebuggerUrl").is_some() {
                    return Ok(());
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// WebSocket URL of the first page target; it may appear after the browser
/// endpoint itself, so this retries briefly.
async fn get_page_ws_url(port: u16) -> DriverResult<String> {
    let url = format!("http://127.0.0.1:{}/json/list", port);

    for attempt in 0..10 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        let Ok(resp) = reqwest::get(&url).await else {
            continue;
        };
        let Ok(targets) = resp.json::<Vec<Value>>().await else {
            continue;
        };
        if let Some(ws) = page_target_ws_url(&targets) {
            return Ok(ws);
        }
    }
    Err(DriverError::Launch("no page target found".to_string()))
}

fn page_target_ws_url(targets: &[Value]) -> Option<String> {
    targets
        .iter()
        .filter(|t| t.get("type").and_then(|v| v.as_str()) == Some("page"))
        .find_map(|t| t.get("webSocketDebuggerUrl").and_then(|v| v.as_str()))
        .map(str::to_string)
}
