// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Audit logging for security-sensitive operations.
//!
//! Submission writes, key registration, and export runs are appended to
//! daily JSONL files (one JSON object per line).

use std::fs::{self, OpenOptions};
use std::io::Write;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::StoragePaths;

/// Types of auditable events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // Submission events
    SubmissionCreated,
    SubmissionVersionCreated,
    SubmissionDeleted,
    AttachmentSaved,

    // Key events
    KeyRegistered,
    ManagedKeyCreated,

    // Export events
    ExportStarted,
    ExportCompleted,
    ExportFailed,
}

/// An audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID.
    pub event_id: String,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Type of event.
    pub event_type: AuditEventType,
    /// Actor who triggered the event (if known).
    pub actor_id: Option<String>,
    /// Resource affected (instance id, key id, form id, ...).
    pub resource_id: Option<String>,
    /// Additional details as JSON.
    pub details: Option<serde_json::Value>,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Error message if the operation failed.
    pub error: Option<String>,
}

impl AuditEvent {
    /// Create a new audit event.
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
            actor_id: None,
            resource_id: None,
            details: None,
            success: true,
            error: None,
        }
    }

    /// Set the actor.
    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Set the affected resource.
    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Add details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Mark as failed with error message.
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

/// Append-only audit log on the storage filesystem.
pub struct AuditLog {
    paths: StoragePaths,
}

impl AuditLog {
    pub fn new(paths: StoragePaths) -> Self {
        Self { paths }
    }

    /// Log an audit event.
    ///
    /// Events are appended to a daily log file in JSONL format.
    pub fn log(&self, event: &AuditEvent) -> Result<()> {
        let date = event.timestamp.format("%Y-%m-%d").to_string();
        let path = self.paths.audit_events_file(&date);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Read audit events for a specific date. Malformed lines are skipped
    /// with a warning rather than failing the read.
    pub fn read_events(&self, date: &str) -> Result<Vec<AuditEvent>> {
        let path = self.paths.audit_events_file(date);
        if !path.is_file() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path)?;
        let mut events = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::warn!(date, error = %e, "Skipping malformed audit line");
                }
            }
        }
        Ok(events)
    }
}
