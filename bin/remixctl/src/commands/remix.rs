use anyhow::Context as _;
use remixctl_flows::{Confirmer, RemixErrorKind, RemixFlow, RemixRequest, RemixResult};
use remixctl_safety::{RetryPolicy, SafetyController};
use remixctl_storage::{AuditLogger, SessionStore};
use tracing::{info, warn};

use super::{prompt_yes_no, Context};

/// Extra pre-checks a retry may spend waiting out the minimum spacing.
const MAX_RATE_LIMIT_WAITS: u32 = 3;

pub struct RemixOptions {
    pub project_id: Option<String>,
    pub include_history: bool,
    pub skip_confirmation: bool,
    pub json: bool,
    pub retries: Option<u32>,
}

/// Terminal confirmation prompt.
struct StdinConfirmer;

impl Confirmer for StdinConfirmer {
    fn confirm(&self, request: &RemixRequest) -> bool {
        println!("About to remix project {}", request.project_id);
        println!(
            "  Edit history: {}",
            if request.include_history { "included" } else { "excluded" }
        );
        match prompt_yes_no("Proceed?") {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Could not read confirmation: {}", e);
                false
            }
        }
    }
}

pub async fn run(ctx: &Context, opts: RemixOptions) -> anyhow::Result<()> {
    let project_id = opts
        .project_id
        .clone()
        .or_else(|| ctx.config.project.resolve_project_id())
        .context("no project given: pass PROJECT_ID or set project.defaultProjectId")?;

    let safety = SafetyController::from_config(&ctx.paths, &ctx.config.safety);
    let sessions = SessionStore::from_paths(&ctx.paths);
    let audit = AuditLogger::new(&ctx.paths);
    let confirmer = StdinConfirmer;
    let flow = RemixFlow::new(&ctx.config, &safety, &sessions, &confirmer);

    let mut policy = RetryPolicy::from_config(&ctx.config.safety);
    if let Some(retries) = opts.retries {
        policy = policy.with_max_retries(retries);
    }

    let mut request = RemixRequest {
        project_id,
        include_history: opts.include_history,
        skip_confirmation: opts.skip_confirmation,
    };

    let mut retry = 0;
    let result = loop {
        let result = attempt(&flow, &request, ctx, retry > 0).await?;
        audit_attempt(&audit, &result);

        let retriable = result.error_kind().map(|k| k.is_retriable()).unwrap_or(false);
        if result.success || !retriable || !policy.allows(retry + 1) {
            break result;
        }

        retry += 1;
        let delay = policy.delay_for(retry);
        warn!(
            retry,
            max_retries = policy.max_retries,
            delay_secs = delay.as_secs_f64(),
            "Transient remix failure, retrying"
        );
        tokio::time::sleep(delay).await;
        // The operator already approved this remix.
        request.skip_confirmation = true;
    };

    report(&result, opts.json)?;
    if !result.success {
        std::process::exit(exit_code(result.error_kind()));
    }
    Ok(())
}

/// One pass through the flow. On retries a `rate_limited` pre-check is
/// waited out instead of ending the command.
async fn attempt(
    flow: &RemixFlow<'_>,
    request: &RemixRequest,
    ctx: &Context,
    is_retry: bool,
) -> anyhow::Result<RemixResult> {
    let mut waits = 0;
    loop {
        let result = flow.run(request, ctx.launcher()).await?;
        let rate_limited = result.error_kind() == Some(RemixErrorKind::RateLimited);
        match result.retry_after() {
            Some(wait) if is_retry && rate_limited && waits < MAX_RATE_LIMIT_WAITS => {
                waits += 1;
                info!(wait_ms = wait.as_millis() as u64, "Waiting out request spacing");
                tokio::time::sleep(wait).await;
            }
            _ => return Ok(result),
        }
    }
}

/// Only attempts that reached the browser belong in the audit trail.
fn audit_attempt(audit: &AuditLogger, result: &RemixResult) {
    let attempted = match result.error_kind() {
        None => true,
        Some(kind) => !kind.is_policy_denial() && kind != RemixErrorKind::Unauthenticated,
    };
    if !attempted {
        return;
    }
    let logged = audit.log_remix_attempt(
        &result.project_id,
        result.success,
        result.new_project_id.clone(),
        result.error_kind().map(|k| k.as_str().to_string()),
        Some(result.duration_ms),
    );
    if let Err(e) = logged {
        warn!("Failed to write audit event: {}", e);
    }
}

fn report(result: &RemixResult, as_json: bool) -> anyhow::Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    if result.success {
        println!("✓ Remix created");
        println!("  Source:  {}", result.project_id);
        if let Some(id) = &result.new_project_id {
            println!("  New id:  {}", id);
        }
        if let Some(url) = &result.new_project_url {
            println!("  URL:     {}", url);
        }
        if let Some(history) = result.history_included {
            println!("  History: {}", if history { "included" } else { "not included" });
        }
        println!("  Took:    {:.1}s", result.duration_ms as f64 / 1000.0);
        return Ok(());
    }

    let kind = result.error_kind().map(|k| k.as_str()).unwrap_or("unknown");
    if result.error_kind().map(|k| k.is_ambiguous()).unwrap_or(false) {
        println!("? Remix outcome unknown ({})", kind);
        println!("  No redirect was seen; check the dashboard before trying again.");
    } else {
        println!("✗ Remix not performed: {}", kind);
    }
    if let Some(message) = &result.message {
        println!("  {}", message);
    }
    if let Some(id) = &result.new_project_id {
        println!("  Existing remix: {}", id);
    }
    Ok(())
}

/// 1 for failures, 2 for policy refusals, 3 when the outcome is unknown.
fn exit_code(kind: Option<RemixErrorKind>) -> i32 {
    match kind {
        Some(k) if k.is_ambiguous() => 3,
        Some(k) if k.is_policy_denial() => 2,
        _ => 1,
    }
}
