//! Redacting audit log.
//!
//! Every custody operation records what happened — never the secret
//! material involved. Event payloads pass through [`LeakGuard::redact`]
//! before they are stored, and the log is a bounded in-memory ring: once
//! the capacity is reached the oldest events are evicted.
//!
//! Recording is infallible by design. If anything goes wrong while
//! preparing an entry, a minimal fallback event is appended instead of
//! dropping the record silently.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::guard::LeakGuard;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Kinds of auditable custody events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    // Session events
    SessionCreated,
    SessionCleared,
    SessionExpired,
    SessionLoggedOut,

    // Vault events
    VaultStored,
    VaultRetrieved,
    VaultDenied,
    VaultRemoved,
    VaultPurged,
    VaultCleared,

    // Guard events
    LeakBlocked,

    // Maintenance
    SweepCompleted,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionCreated => "session_created",
            Self::SessionCleared => "session_cleared",
            Self::SessionExpired => "session_expired",
            Self::SessionLoggedOut => "session_logged_out",
            Self::VaultStored => "vault_stored",
            Self::VaultRetrieved => "vault_retrieved",
            Self::VaultDenied => "vault_denied",
            Self::VaultRemoved => "vault_removed",
            Self::VaultPurged => "vault_purged",
            Self::VaultCleared => "vault_cleared",
            Self::LeakBlocked => "leak_blocked",
            Self::SweepCompleted => "sweep_completed",
        }
    }
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entry in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique, time-ordered event id (UUID v7).
    pub id: Uuid,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: AuditKind,
    /// Session involved, if any.
    pub session_id: Option<String>,
    /// Redacted event payload.
    pub detail: Value,
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

/// Bounded, redacting, append-only event log.
pub struct AuditLog {
    guard: Arc<LeakGuard>,
    events: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
}

impl AuditLog {
    /// Create a log that retains at most `capacity` events.
    pub fn new(guard: Arc<LeakGuard>, capacity: usize) -> Self {
        Self {
            guard,
            events: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity,
        }
    }

    /// Append an event.
    ///
    /// `detail` is redacted before storage. This method never fails: if the
    /// event cannot be recorded as given, a minimal fallback entry is
    /// appended in its place.
    pub fn record(&self, kind: AuditKind, session_id: Option<&str>, detail: Value) {
        let event = AuditEvent {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            kind,
            session_id: session_id.map(str::to_string),
            detail: self.guard.redact(&detail),
        };

        tracing::debug!(kind = %kind, session_id, "audit event");

        match self.events.lock() {
            Ok(mut events) => {
                while events.len() >= self.capacity {
                    events.pop_front();
                }
                events.push_back(event);
            }
            Err(poisoned) => {
                // A panicked writer must not silence the log; keep appending.
                let mut events = poisoned.into_inner();
                while events.len() >= self.capacity {
                    events.pop_front();
                }
                events.push_back(AuditEvent {
                    id: Uuid::now_v7(),
                    timestamp: Utc::now(),
                    kind,
                    session_id: None,
                    detail: Value::String("audit fallback: lock poisoned".into()),
                });
            }
        }
    }

    /// Snapshot of all retained events, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// The most recent `n` events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<AuditEvent> {
        let events = self.events();
        let skip = events.len().saturating_sub(n);
        events.into_iter().skip(skip).collect()
    }

    /// All retained events for one session, oldest first.
    pub fn events_for_session(&self, session_id: &str) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.session_id.as_deref() == Some(session_id))
            .collect()
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        match self.events.lock() {
            Ok(events) => events.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of events retained.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
