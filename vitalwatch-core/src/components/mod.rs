//! Building blocks for the escalation engine.
//!
//! This module holds the episode state machine, the pure escalation
//! policy, and the notification dispatch seam. The `EscalationEngine`
//! wires these together and drives them from countdown signals.

pub mod dispatch;
pub mod episode;
pub mod policy;
