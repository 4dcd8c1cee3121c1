//! The escalation decision policy.
//!
//! [`decide`] is a pure function of episode state, remaining time, and an
//! optional explicit user intent. Every mutation path in the engine runs
//! its inputs through this table; keeping the safety-critical branching
//! side-effect free makes it exhaustively testable.

use crate::components::episode::EpisodeState;
use serde::{Deserialize, Serialize};

/// An explicit instruction from the user, evaluated alongside timer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserIntent {
    /// Stand down: stop the countdown without notifying anyone.
    CancelRequested,
    /// Skip the rest of the countdown and notify contacts now.
    SendNowRequested,
}

/// What the controller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationAction {
    /// Nothing to do this second.
    None,
    /// Notify contacts at the episode's current severity.
    Notify,
    /// Notify contacts and raise severity to critical. Produced when an
    /// armed countdown runs out.
    Escalate,
    /// Stop the countdown and close the episode without notifying.
    Cancel,
}

/// Decides the next action for an episode.
///
/// Deterministic and side-effect free: the same inputs always yield the
/// same action. Explicit intents only apply while the episode is armed and
/// take precedence over expiry, so a cancel landing on the final second
/// still wins.
pub fn decide(
    state: EpisodeState,
    seconds_remaining: u32,
    intent: Option<UserIntent>,
) -> EscalationAction {
    match (state, intent) {
        (EpisodeState::Armed, Some(UserIntent::CancelRequested)) => EscalationAction::Cancel,
        (EpisodeState::Armed, Some(UserIntent::SendNowRequested)) => EscalationAction::Notify,
        (EpisodeState::Armed, None) if seconds_remaining == 0 => EscalationAction::Escalate,
        _ => EscalationAction::None,
    }
}
