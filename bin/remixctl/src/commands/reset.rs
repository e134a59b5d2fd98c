use remixctl_safety::SafetyController;
use remixctl_storage::AuditLogger;
use tracing::warn;

use super::{prompt_yes_no, Context};

pub async fn run(ctx: &Context, confirm: bool) -> anyhow::Result<()> {
    let confirmed = confirm
        || prompt_yes_no("⚠ Clear all safety counters, the circuit breaker and the remix ledger?")?;

    let safety = SafetyController::from_config(&ctx.paths, &ctx.config.safety);
    if !safety.reset(confirmed)? {
        println!("Cancelled.");
        return Ok(());
    }

    if let Err(e) = AuditLogger::new(&ctx.paths).log_safety_reset() {
        warn!("Failed to write audit event: {}", e);
    }
    println!("✓ Safety state reset");
    Ok(())
}
