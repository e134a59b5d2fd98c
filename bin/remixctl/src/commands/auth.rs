use remixctl_flows::{AuthFlow, AuthSource, LoginError};
use remixctl_storage::{AuditLogger, SessionStore};
use std::time::Instant;
use tracing::warn;

use super::Context;

pub async fn run(ctx: &Context, force: bool, show: bool) -> anyhow::Result<()> {
    let store = SessionStore::from_paths(&ctx.paths);
    let audit = AuditLogger::new(&ctx.paths);
    let flow = AuthFlow::new(&ctx.config, &store);

    let started = Instant::now();
    let result = flow.authenticate(force, ctx.launcher()).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            if !matches!(e, LoginError::MissingCredentials) {
                let stage = e.stage().map(|s| s.as_str());
                if let Err(audit_err) = audit.log_login(false, stage, Some(e.to_string()), Some(elapsed_ms)) {
                    warn!("Failed to write audit event: {}", audit_err);
                }
            }
            return Err(e.into());
        }
    };

    match outcome.source {
        AuthSource::Stored => println!(
            "✓ Using stored session (captured {})",
            outcome.record.captured_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        AuthSource::Configured => println!(
            "✓ Using configured bearer token, saved to {}",
            ctx.paths.session_file().display()
        ),
        AuthSource::Login => {
            if let Err(e) = audit.log_login(true, None, None, Some(elapsed_ms)) {
                warn!("Failed to write audit event: {}", e);
            }
            println!("✓ Logged in, session saved to {}", ctx.paths.session_file().display());
        }
    }

    println!("  Cookies: {}", outcome.record.cookies.len());
    let token = if show {
        outcome.record.bearer_token.clone()
    } else {
        outcome.record.masked_token()
    };
    println!("  Token:   {}", token.as_deref().unwrap_or("(none)"));
    Ok(())
}
