/// Audit trail for ruleset mutations
///
/// Every enable, resync and teardown performed by the CLI or the session loop
/// is recorded as one JSON line, so an operator can reconstruct what the
/// forwarder did to the host firewall and when.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Enable,
    ResetPeers,
    ResetFirewall,
    Disable,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if the operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Opens the default log at `~/.local/state/meshgate/audit.log`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    /// Writes to `path` instead of the state directory.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event as one JSON line.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be opened or written
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

    /// Reads up to `count` events, newest first. Malformed lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        Ok(content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str(line).ok())
            .take(count)
            .collect())
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

async fn record(event_type: EventType, details: serde_json::Value, error: Option<String>) {
    if let Ok(audit) = AuditLog::new() {
        let event = AuditEvent::new(event_type, error.is_none(), details, error);
        if let Err(e) = audit.log(event).await {
            tracing::warn!("Failed to write audit log: {e}");
        }
    }
}

/// Logs turning forwarding on.
pub async fn log_enable(error: Option<String>) {
    record(EventType::Enable, serde_json::json!({}), error).await;
}

/// Logs a peer list resync.
pub async fn log_reset_peers(
    peer_count: usize,
    kill_switch: bool,
    lan_available: bool,
    error: Option<String>,
) {
    record(
        EventType::ResetPeers,
        serde_json::json!({
            "peer_count": peer_count,
            "kill_switch": kill_switch,
            "lan_available": lan_available,
        }),
        error,
    )
    .await;
}

/// Logs a resync triggered by a settings change.
pub async fn log_reset_firewall(enabled: bool, error: Option<String>) {
    record(
        EventType::ResetFirewall,
        serde_json::json!({ "enabled": enabled }),
        error,
    )
    .await;
}

/// Logs a teardown.
pub async fn log_disable(error: Option<String>) {
    record(EventType::Disable, serde_json::json!({}), error).await;
}
