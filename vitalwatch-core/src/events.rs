//! Public event types broadcast by the escalation engine.
//!
//! Presentation layers subscribe to these streams to render countdown and
//! dispatch state. Every episode mutation publishes an [`EpisodeEvent`]
//! carrying a full snapshot taken at mutation time, so subscribers never
//! need to query the engine to draw the current state.

use crate::common::{ContactId, EpisodeId};
use crate::components::episode::EmergencyEpisode;
use std::time::Duration;

/// Fired after every state mutation of an emergency episode.
#[derive(Debug, Clone)]
pub enum EpisodeEvent {
    /// A new episode was created and its countdown armed.
    Armed { episode: EmergencyEpisode },
    /// One second elapsed on an armed countdown.
    CountdownTicked { episode: EmergencyEpisode },
    /// The user cancelled the episode before escalation.
    Cancelled { episode: EmergencyEpisode },
    /// Contact notification began, via send-now or countdown expiry.
    DispatchStarted { episode: EmergencyEpisode },
    /// The episode reached `escalated`. Check `dispatch_failed` on the
    /// snapshot before assuming contacts were reached.
    Escalated { episode: EmergencyEpisode },
    /// An escalated episode was acknowledged as handled.
    Resolved { episode: EmergencyEpisode },
}

impl EpisodeEvent {
    /// The snapshot carried by any variant.
    pub fn episode(&self) -> &EmergencyEpisode {
        match self {
            EpisodeEvent::Armed { episode }
            | EpisodeEvent::CountdownTicked { episode }
            | EpisodeEvent::Cancelled { episode }
            | EpisodeEvent::DispatchStarted { episode }
            | EpisodeEvent::Escalated { episode }
            | EpisodeEvent::Resolved { episode } => episode,
        }
    }

    /// A stable tag for log lines and shell output.
    pub fn kind(&self) -> &'static str {
        match self {
            EpisodeEvent::Armed { .. } => "armed",
            EpisodeEvent::CountdownTicked { .. } => "countdown_ticked",
            EpisodeEvent::Cancelled { .. } => "cancelled",
            EpisodeEvent::DispatchStarted { .. } => "dispatch_started",
            EpisodeEvent::Escalated { .. } => "escalated",
            EpisodeEvent::Resolved { .. } => "resolved",
        }
    }
}

/// Telemetry from the notification dispatch pipeline.
///
/// Carried on a separate stream from [`EpisodeEvent`] so operator surfaces
/// can watch delivery health without wading through per-second ticks.
#[derive(Debug, Clone)]
pub enum AlertEvent {
    /// One dispatch attempt completed and reported per-contact results.
    DispatchAttempted {
        episode_id: EpisodeId,
        /// 1-based attempt number.
        attempt: u32,
        succeeded: Vec<ContactId>,
        failed: Vec<ContactId>,
    },
    /// An attempt failed at the transport level; another will run after
    /// the backoff delay.
    DispatchRetrying {
        episode_id: EpisodeId,
        attempt: u32,
        backoff: Duration,
        error: String,
    },
    /// Every attempt failed. The episode escalates anyway with
    /// `dispatch_failed` set; operators should assume nobody was reached.
    DeliveryExhausted {
        episode_id: EpisodeId,
        attempts: u32,
        error: String,
    },
}
