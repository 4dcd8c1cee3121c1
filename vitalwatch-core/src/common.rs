//! Common, primitive identifier types used across the engine.
//!
//! Distinct ID types keep episodes, users, and contacts from being mixed up
//! at compile time. Episode keys come from a slotmap and are never reused,
//! so a stale handle held by a presentation layer can never address a newer
//! episode by accident.

use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use std::fmt;

new_key_type! {
    /// Uniquely and safely identifies an emergency episode within the engine.
    pub struct EpisodeId;
}

/// Identifies the owner of episodes and of a contact registry.
///
/// The surrounding application supplies these; the engine treats them as
/// opaque. One armed episode is allowed per `UserId` at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a single emergency contact within a user's registry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ContactId(pub u32);

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
