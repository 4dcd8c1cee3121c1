//! The emergency episode state machine.
//!
//! An [`EmergencyEpisode`] is one armed-or-fired emergency sequence. The
//! engine owns the authoritative copy behind its lock and mutates it only
//! through the guarded methods here; clones of the struct are handed to
//! subscribers as point-in-time snapshots.

use crate::common::{ContactId, EpisodeId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Lifecycle states of an emergency episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeState {
    /// Countdown running; the user can still cancel or send immediately.
    Armed,
    /// The user stopped the countdown before anyone was notified. Terminal.
    Cancelled,
    /// Contact notification in progress. Remaining time is frozen and the
    /// episode can no longer be cancelled.
    Notifying,
    /// Contacts have been notified, or delivery was abandoned after
    /// exhausting retries (see `dispatch_failed` on the episode).
    Escalated,
    /// An escalated episode acknowledged as handled. Terminal.
    Resolved,
}

impl EpisodeState {
    /// True once the episode can no longer escalate or be cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EpisodeState::Cancelled | EpisodeState::Escalated | EpisodeState::Resolved
        )
    }
}

impl fmt::Display for EpisodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EpisodeState::Armed => "armed",
            EpisodeState::Cancelled => "cancelled",
            EpisodeState::Notifying => "notifying",
            EpisodeState::Escalated => "escalated",
            EpisodeState::Resolved => "resolved",
        };
        f.write_str(name)
    }
}

/// What set the episode off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// The user held the panic button to completion.
    PanicButton,
    /// A sensor pipeline (fall or crash detection) raised the alarm.
    AutoDetected,
    /// Opened by hand from the emergency controls.
    Manual,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerKind::PanicButton => "panic_button",
            TriggerKind::AutoDetected => "auto_detected",
            TriggerKind::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// Severity attached to dispatched alerts. Countdown expiry raises an
/// episode to `Critical`; a user-requested send-now keeps the armed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A location attached to an episode and forwarded to contacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    /// Reverse-geocoded address when the surrounding app has one.
    #[serde(default)]
    pub address: Option<String>,
}

/// An attempted move between two episode states that the state graph does
/// not permit.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("illegal episode transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: EpisodeState,
    pub to: EpisodeState,
}

/// Is `from -> to` an edge of the episode state graph?
///
/// `armed` branches to `cancelled` or `notifying`; `notifying` always lands
/// on `escalated` (dispatch failures retry inside `notifying` rather than
/// regressing); `resolved` is reachable only as an acknowledgement of
/// `escalated`.
fn is_legal_transition(from: EpisodeState, to: EpisodeState) -> bool {
    use EpisodeState::*;
    matches!(
        (from, to),
        (Armed, Cancelled) | (Armed, Notifying) | (Notifying, Escalated) | (Escalated, Resolved)
    )
}

/// One armed-or-fired emergency sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyEpisode {
    /// Assigned at creation, immutable.
    pub id: EpisodeId,
    /// Owner of the episode.
    pub user_id: UserId,
    pub state: EpisodeState,
    pub trigger: TriggerKind,
    pub severity: Severity,
    /// Configured budget before auto-escalation.
    pub countdown_total_secs: u32,
    /// Monotonically non-increasing while `armed`; frozen afterwards.
    pub seconds_remaining: u32,
    /// Contacts successfully notified, in dispatch order. Append-only.
    pub contacts_notified: Vec<ContactId>,
    /// Set when delivery ultimately failed or reached nobody, so operators
    /// know to raise help through another channel.
    pub dispatch_failed: bool,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    /// Free-text note forwarded to contacts.
    #[serde(default)]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// `None` until a terminal state is reached; keeps its first value
    /// when an escalated episode is later resolved.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl EmergencyEpisode {
    pub(crate) fn new(
        id: EpisodeId,
        user_id: UserId,
        trigger: TriggerKind,
        severity: Severity,
        countdown_total_secs: u32,
        location: Option<GeoPoint>,
        message: Option<String>,
    ) -> Self {
        Self {
            id,
            user_id,
            state: EpisodeState::Armed,
            trigger,
            severity,
            countdown_total_secs,
            seconds_remaining: countdown_total_secs,
            contacts_notified: Vec::new(),
            dispatch_failed: false,
            location,
            message,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// Applies one elapsed second and returns the new remaining time.
    ///
    /// Returns `None` without mutating anything when the episode is no
    /// longer armed: a tick that races a cancel or send-now loses, because
    /// the intent already won.
    pub(crate) fn record_tick(&mut self) -> Option<u32> {
        if self.state != EpisodeState::Armed {
            return None;
        }
        self.seconds_remaining = self.seconds_remaining.saturating_sub(1);
        Some(self.seconds_remaining)
    }

    /// Moves the episode along the state graph.
    ///
    /// The first transition into a terminal state stamps `resolved_at`.
    pub(crate) fn transition(&mut self, to: EpisodeState) -> Result<(), TransitionError> {
        if !is_legal_transition(self.state, to) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        debug!(episode = ?self.id, from = %self.state, to = %to, "episode transition");
        self.state = to;
        if to.is_terminal() && self.resolved_at.is_none() {
            self.resolved_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Records contacts that were successfully notified. Append-only; a
    /// contact already present is not added twice.
    pub(crate) fn append_notified(&mut self, contacts: impl IntoIterator<Item = ContactId>) {
        for id in contacts {
            if !self.contacts_notified.contains(&id) {
                self.contacts_notified.push(id);
            }
        }
    }

    /// Remaining time formatted the way the countdown overlay shows it,
    /// `m:ss`.
    pub fn format_remaining(&self) -> String {
        let minutes = self.seconds_remaining / 60;
        let seconds = self.seconds_remaining % 60;
        format!("{}:{:02}", minutes, seconds)
    }
}
