use chrono::Utc;
use remixctl_safety::{CircuitState, SafetyController, SafetyStatus};
use remixctl_storage::SessionStore;
use serde_json::json;

use super::Context;

pub async fn run(ctx: &Context, verbose: bool, as_json: bool) -> anyhow::Result<()> {
    let safety = SafetyController::from_config(&ctx.paths, &ctx.config.safety);
    let status = safety.status(verbose)?;

    let store = SessionStore::from_paths(&ctx.paths);
    let record = store.load()?;
    let session_valid = record
        .as_ref()
        .map(|r| r.is_valid_at(Utc::now(), ctx.config.session.max_age()))
        .unwrap_or(false);

    if as_json {
        let out = json!({
            "safety": status,
            "session": {
                "present": record.is_some(),
                "valid": session_valid,
                "capturedAt": record.as_ref().map(|r| r.captured_at),
            },
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("remixctl status");
    println!("===============");
    println!();
    println!("Data dir:  {}", ctx.paths.base.display());
    match &record {
        Some(r) => println!(
            "Session:   {} (captured {})",
            if session_valid { "✓ valid" } else { "✗ stale" },
            r.captured_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        None => println!("Session:   ✗ none (run `remixctl auth`)"),
    }
    println!();
    print_safety(&status);
    Ok(())
}

fn print_safety(status: &SafetyStatus) {
    println!("Safety:");
    let circuit = match &status.circuit {
        CircuitState::Closed => "closed".to_string(),
        CircuitState::Open { until } => format!("OPEN until {}", until.format("%H:%M:%S UTC")),
        CircuitState::HalfOpen => "half-open (next attempt is a trial)".to_string(),
        CircuitState::Trial { since } => format!("half-open, trial running since {}", since.format("%H:%M:%S UTC")),
    };
    println!("  Circuit breaker:   {}", circuit);
    println!(
        "  Failures in a row: {}/{}",
        status.consecutive_failures, status.failure_threshold
    );
    println!(
        "  Last hour:         {}/{} requests",
        status.requests_last_hour, status.hourly_limit
    );
    println!(
        "  Today:             {}/{} remixes",
        status.remixes_today, status.daily_limit
    );
    match status.next_request_in_ms {
        Some(ms) => println!("  Next request in:   {:.1}s", ms as f64 / 1000.0),
        None => println!("  Next request in:   now"),
    }
    for (project_id, since) in &status.in_flight {
        println!(
            "  In flight:         {} (since {})",
            project_id,
            since.format("%H:%M:%S UTC")
        );
    }

    if let Some(ledger) = &status.remixed_projects {
        println!();
        println!("Remixed projects ({}):", ledger.len());
        for (source, new_id) in ledger {
            println!("  {:<40} → {}", source, new_id.as_deref().unwrap_or("?"));
        }
    }

    if let Some(recent) = &status.recent_requests {
        println!();
        println!("Recent attempts:");
        if recent.is_empty() {
            println!("  (none)");
        }
        for entry in recent.iter().rev() {
            println!(
                "  {} {} {}{}",
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                if entry.success { "✓" } else { "✗" },
                entry.project_id,
                entry
                    .error
                    .as_deref()
                    .map(|e| format!(" ({})", e))
                    .unwrap_or_default()
            );
        }
    }
}
