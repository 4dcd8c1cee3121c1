//! The notification dispatch seam.
//!
//! The engine talks to the outside world (SMS, email, push) through the
//! [`NotificationDispatcher`] trait; real transports live in the
//! surrounding application. The library ships [`LogDispatcher`], a
//! tracing-only implementation used by the dev harness and the shell.

use crate::common::{ContactId, EpisodeId, UserId};
use crate::components::episode::{GeoPoint, Severity, TriggerKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// A person to reach during an emergency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub id: ContactId,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub relationship: Option<String>,
    /// 1 is the primary contact; higher numbers are reached later.
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Inactive contacts stay in the registry but are never dispatched to.
    #[serde(default = "default_active")]
    pub active: bool,
}

impl EmergencyContact {
    /// A minimal active contact with default priority.
    pub fn new(id: ContactId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            phone: None,
            email: None,
            relationship: None,
            priority: default_priority(),
            active: default_active(),
        }
    }
}

fn default_priority() -> u8 {
    1
}

fn default_active() -> bool {
    true
}

/// Filters a registry down to dispatchable contacts, primaries first.
pub fn dispatch_order(contacts: &[EmergencyContact]) -> Vec<EmergencyContact> {
    let mut active: Vec<EmergencyContact> =
        contacts.iter().filter(|c| c.active).cloned().collect();
    active.sort_by_key(|c| c.priority);
    active
}

/// Everything a dispatcher needs to compose an alert message.
#[derive(Debug, Clone, Serialize)]
pub struct EpisodeContext {
    pub episode_id: EpisodeId,
    pub user_id: UserId,
    pub trigger: TriggerKind,
    pub severity: Severity,
    pub location: Option<GeoPoint>,
    pub message: Option<String>,
}

/// Per-contact results of one completed dispatch attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Contacts the transport confirmed, in dispatch order.
    pub succeeded: Vec<ContactId>,
    /// Contacts the transport could not reach.
    pub failed: Vec<ContactId>,
}

impl DispatchOutcome {
    /// An outcome where every listed contact was reached.
    pub fn all_succeeded(contacts: &[EmergencyContact]) -> Self {
        Self {
            succeeded: contacts.iter().map(|c| c.id).collect(),
            failed: Vec::new(),
        }
    }

    /// True when at least one contact was reached.
    pub fn any_delivered(&self) -> bool {
        !self.succeeded.is_empty()
    }
}

/// Attempt-level dispatch failures. Per-contact failures are not errors;
/// they come back inside a successful [`DispatchOutcome`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The notification service could not be reached at all.
    #[error("notification service unavailable: {0}")]
    Unavailable(String),
    /// The notification service did not answer in time.
    #[error("notification service timed out after {0} ms")]
    Timeout(u64),
}

/// Sends emergency notifications. The engine's only outward effect.
///
/// `Err` means the attempt as a whole failed and may be retried; `Ok` ends
/// the retry loop and reports per-contact results. Implementations are
/// shared across concurrent episodes, so they must not hold per-episode
/// state.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify(
        &self,
        contacts: &[EmergencyContact],
        context: &EpisodeContext,
    ) -> Result<DispatchOutcome, DispatchError>;
}

/// Dispatcher that only writes log lines. Nothing is actually sent.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn notify(
        &self,
        contacts: &[EmergencyContact],
        context: &EpisodeContext,
    ) -> Result<DispatchOutcome, DispatchError> {
        for contact in contacts {
            warn!(
                contact = %contact.name,
                contact_id = %contact.id,
                user = %context.user_id,
                trigger = %context.trigger,
                severity = %context.severity,
                "EMERGENCY ALERT (log only, nothing sent)"
            );
        }
        Ok(DispatchOutcome::all_succeeded(contacts))
    }
}
