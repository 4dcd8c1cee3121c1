//! # VitalWatch
//!
//! An emergency countdown and escalation engine for Rust.
//!
//! VitalWatch provides the core engine for panic-button style safety flows.
//! Triggering an emergency arms a countdown; the user can cancel it, skip it,
//! or let it expire, at which point the engine notifies the user's emergency
//! contacts. It is designed to be a library that an application embeds to
//! manage these time-critical flows in a structured and decoupled way.
//!
//! ## Core Concepts
//!
//! - **Countdown**: A cancellable, pausable one-second ticker that gives the
//!   user a window to stand down before anyone is alerted.
//! - **EmergencyEpisode**: One trigger-to-resolution incident, tracked as a
//!   state machine (`armed` to `cancelled`, or through `notifying` to
//!   `escalated`). Terminal states are final.
//! - **Escalation Policy**: A pure decision function. Every second and every
//!   user intent flows through [`components::policy::decide`], so the
//!   escalation rules live in exactly one place.
//! - **Event-Driven**: All state changes are published as strongly-typed
//!   events. Your application subscribes to event streams (`EpisodeEvent`,
//!   `AlertEvent`) to drive UI and audit trails.
//! - **Fail-Open Dispatch**: Notification delivery is retried with bounded
//!   backoff; if every attempt fails the episode still escalates, with
//!   `dispatch_failed` set so operators can follow up out of band.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vitalwatch::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // 1. Create a default configuration (180s countdown, 3 attempts).
//!     let config = VitalWatchConfig::default();
//!
//!     // 2. Create the engine with a notification transport.
//!     let engine = EscalationEngine::new(config, Arc::new(LogDispatcher));
//!
//!     // 3. Subscribe to the episode stream before triggering anything.
//!     let mut episode_events = engine.subscribe_episode_events();
//!     tokio::spawn(async move {
//!         while let Ok(event) = episode_events.recv().await {
//!             println!("episode {:?} -> {}", event.episode().id, event.kind());
//!         }
//!     });
//!
//!     // 4. Register who to alert, then trigger an emergency.
//!     let user = UserId("ada".to_string());
//!     engine
//!         .set_contacts(user.clone(), vec![EmergencyContact::new(ContactId(1), "Dana")])
//!         .await;
//!     engine
//!         .start_episode(user, TriggerKind::PanicButton, EpisodeOptions::default())
//!         .await?;
//!
//!     // 5. Run the engine. It will shut down on Ctrl+C.
//!     engine.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub const ENGINE_NAME: &str = "VitalWatch Engine";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");


// Declare all the modules in the crate.
pub mod common;
pub mod components;
pub mod config;
pub mod engine;
pub mod events;
pub mod time;

/// A prelude module for easy importing of the most common VitalWatch types.
pub mod prelude {
    pub use crate::common::{ContactId, EpisodeId, UserId};
    pub use crate::components::dispatch::{
        DispatchError, DispatchOutcome, EmergencyContact, EpisodeContext, LogDispatcher,
        NotificationDispatcher,
    };
    pub use crate::components::episode::{
        EmergencyEpisode, EpisodeState, GeoPoint, Severity, TriggerKind,
    };
    pub use crate::components::policy::{decide, EscalationAction, UserIntent};
    pub use crate::config::{CountdownConfig, RetryConfig, VitalWatchConfig};
    pub use crate::engine::{EngineError, EpisodeOptions, EscalationEngine};
    pub use crate::events::{AlertEvent, EpisodeEvent};
    pub use crate::time::{Countdown, CountdownHandle, CountdownSignal};
}
