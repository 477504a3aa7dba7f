/// Audit logging for privileged operations
///
/// Every apply, persist, rollback, reset and confirmation outcome is recorded
/// as one JSON object per line. Events from one invocation share a run id,
/// and applied scripts are identified by their SHA-256 checksum.
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Apply,
    Confirm,
    Persist,
    Rollback,
    Reset,
    Verify,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Invocation the event belongs to
    pub run_id: Uuid,

    pub event_type: EventType,

    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        run_id: Uuid,
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            run_id,
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Hex SHA-256 of a script, as recorded in event details
pub fn checksum(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Audit log writer
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Log in the user state directory
    ///
    /// # Errors
    ///
    /// Returns `Err` if the state directory cannot be determined or created
    pub fn new() -> std::io::Result<Self> {
        let dir = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        crate::utils::ensure_dir(&dir)?;

        Ok(Self::at(dir.join("audit.log")))
    }

    /// Log at an explicit path
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event to the audit log
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Records an event, logging (not returning) a write failure
    pub async fn record(
        &self,
        run_id: Uuid,
        event_type: EventType,
        details: serde_json::Value,
        error: Option<String>,
    ) {
        let event = AuditEvent::new(run_id, event_type, error.is_none(), details, error);
        if let Err(e) = self.log(event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }

    /// Reads the most recent events from the log, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum() {
        assert_eq!(
            checksum(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(checksum("*filter\nCOMMIT\n"), checksum("*nat\nCOMMIT\n"));
    }

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::new(
            Uuid::nil(),
            EventType::Rollback,
            false,
            serde_json::json!({"failures": 2}),
            Some("ip rules: exit 1".to_string()),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"rollback\""));
        assert!(json.contains("ip rules: exit 1"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"timestamp":"2024-01-01T00:00:00Z","run_id":"00000000-0000-0000-0000-000000000000","event_type":"apply","success":true,"details":{},"error":null}"#;
        let event: AuditEvent = serde_json::from_str(json).unwrap();

        assert!(event.success);
        assert_eq!(event.event_type, EventType::Apply);
    }

    #[tokio::test]
    async fn test_record_and_read_recent() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::at(dir.path().join("audit.log"));
        let run_id = Uuid::new_v4();

        log.record(run_id, EventType::Apply, serde_json::json!({}), None)
            .await;
        log.record(
            run_id,
            EventType::Confirm,
            serde_json::json!({"outcome": "timed_out"}),
            Some("timed out".into()),
        )
        .await;

        let events = log.read_recent(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::Confirm);
        assert!(!events[0].success);
        assert!(events[1].success);
        assert!(events.iter().all(|e| e.run_id == run_id));
    }
}
