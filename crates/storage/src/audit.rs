use chrono::Utc;
use remixctl_core::{Paths, Result};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    Login {
        success: bool,
        stage: Option<String>,
        error: Option<String>,
        timestamp_ms: i64,
        duration_ms: Option<u64>,
    },
    RemixAttempt {
        attempt_id: String,
        project_id: String,
        success: bool,
        new_project_id: Option<String>,
        error: Option<String>,
        timestamp_ms: i64,
        duration_ms: Option<u64>,
    },
    SafetyReset {
        timestamp_ms: i64,
    },
}

/// Append-only daily JSONL audit trail (`audit/YYYY-MM-DD.jsonl`).
pub struct AuditLogger {
    dir: PathBuf,
}

impl AuditLogger {
    pub fn new(paths: &Paths) -> Self {
        Self {
            dir: paths.audit_dir(),
        }
    }

    pub fn log_login(
        &self,
        success: bool,
        stage: Option<&str>,
        error: Option<String>,
        duration_ms: Option<u64>,
    ) -> Result<()> {
        self.write_event(&AuditEvent::Login {
            success,
            stage: stage.map(str::to_string),
            error,
            timestamp_ms: Utc::now().timestamp_millis(),
            duration_ms,
        })
    }

    pub fn log_remix_attempt(
        &self,
        project_id: &str,
        success: bool,
        new_project_id: Option<String>,
        error: Option<String>,
        duration_ms: Option<u64>,
    ) -> Result<()> {
        self.write_event(&AuditEvent::RemixAttempt {
            attempt_id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            success,
            new_project_id,
            error,
            timestamp_ms: Utc::now().timestamp_millis(),
            duration_ms,
        })
    }

    pub fn log_safety_reset(&self) -> Result<()> {
        self.write_event(&AuditEvent::SafetyReset {
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }

    fn write_event(&self, event: &AuditEvent) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_file_for(&today()))?;

        let json = serde_json::to_string(event)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    fn log_file_for(&self, date: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", date))
    }

    /// Read audit events from a specific date (`YYYY-MM-DD`).
    pub fn read_events(&self, date: &str) -> Result<Vec<AuditEvent>> {
        let log_file = self.log_file_for(date);
        if !log_file.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&log_file)?;
        let mut events = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    error!(error = %e, line = %line, "Failed to parse audit event");
                }
            }
        }
        Ok(events)
    }

    pub fn read_today(&self) -> Result<Vec<AuditEvent>> {
        self.read_events(&today())
    }
}

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}
