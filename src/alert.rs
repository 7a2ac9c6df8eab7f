//! ==============================================================================
//! alert.rs - outbound alert events
//! ==============================================================================
//!
//! purpose:
//!     the authority decides *when* somebody must be told (liveness thresholds,
//!     low disk) and *who* (a project's address or the operators). delivering
//!     the message is somebody else's job, behind the `AlertSink` trait.
//!
//! relationships:
//!     - produced by: engine.rs
//!     - consumed by: service.rs (forwards every alert to the configured sink)
//!
//! ==============================================================================

use crate::ProjectId;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Recipient {
    /// The registered address of a project.
    Project { project_id: ProjectId, email: String },
    /// Whoever runs the fleet.
    Operators,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub recipient: Recipient,
    pub subject: String,
    pub body: String,
}

impl Alert {
    pub fn new(recipient: Recipient, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self { recipient, subject: subject.into(), body: body.into() }
    }
}

/// Delivery seam for alerts.
pub trait AlertSink: Send {
    fn deliver(&mut self, alert: &Alert);
}

/// Writes alerts to the log. Used when no mailer is wired in.
#[derive(Debug, Default)]
pub struct LogSink;

impl AlertSink for LogSink {
    fn deliver(&mut self, alert: &Alert) {
        match &alert.recipient {
            Recipient::Project { project_id, email } => {
                tracing::warn!(project = project_id, to = %email, "ALERT {}: {}", alert.subject, alert.body)
            }
            Recipient::Operators => tracing::warn!(to = "operators", "ALERT {}: {}", alert.subject, alert.body),
        }
    }
}
