//! Twitch-side domain model: channel state, change events, predictions and
//! chat lines, plus the per-channel fan-out machinery.
//!
//! Everything here is transport-agnostic. Raw wire payloads live in
//! [`events`], the prediction admission state machine in [`predictions`],
//! and the monitored-channel registry type in [`channel`].

pub mod channel;
pub mod events;
pub mod predictions;
pub mod preview;

pub use channel::MonitoredChannel;
pub use predictions::{are_predictions_mergeable, reconcile_prediction, ReconciledPrediction};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// The kinds of channel state transitions subscribers can be notified about.
///
/// Variant order doubles as render order: live transitions lead, metadata
/// changes follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateChange {
    Online,
    Offline,
    Title,
    Category,
}

/// An ordered set of [`StateChange`] kinds.
pub type ChangeSet = BTreeSet<StateChange>;

/// Current broadcast metadata of a monitored channel.
///
/// The monitored channel owns the mutable copy; everything downstream sees
/// immutable [`Arc`] snapshots (see [`MonitoredChannel::current_state`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    pub is_live: bool,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub category_id: String,
    #[serde(default)]
    pub category_name: String,
}

/// One filtered state-change notification delivered to a subscriber.
///
/// Immutable once created; ownership moves into the destination coalescer.
#[derive(Debug, Clone)]
pub struct ChannelUpdate {
    pub changes: ChangeSet,
    pub state: Arc<ChannelState>,
    pub updated_at: DateTime<Utc>,
}

/// Normalized lifecycle of a channel-points prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionStatus {
    Active,
    Locked,
    ResolvePending,
    Resolved,
    Canceled,
}

/// One betting outcome of a prediction, totals clamped to be non-negative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionOutcome {
    pub id: String,
    pub title: String,
    pub total_points: u64,
    pub total_users: u64,
}

/// A reconciled channel-points prediction snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prediction {
    pub timestamp: DateTime<Utc>,
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub status: PredictionStatus,
    pub prediction_window_secs: u64,
    pub title: String,
    pub outcomes: Vec<PredictionOutcome>,
    pub winning_outcome_id: Option<String>,
    /// Sticky across same-id snapshots: once a prediction has been seen
    /// active or locked, its resolution renders as a result of a live wager
    /// rather than a full recap.
    pub has_been_active_or_locked: bool,
}

impl Prediction {
    /// Index of the winning outcome in `outcomes`, if any.
    pub fn winning_outcome_index(&self) -> Option<usize> {
        let winning_id = self.winning_outcome_id.as_deref()?;
        self.outcomes.iter().position(|o| o.id == winning_id)
    }

    pub fn total_points(&self) -> u64 {
        self.outcomes.iter().map(|o| o.total_points).sum()
    }
}

/// Display identity of a Twitch user (channel owner or chatter).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub emoji: Option<String>,
}

impl UserProfile {
    pub fn from_login(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            name: None,
            emoji: None,
        }
    }

    /// Preferred display name, falling back to the login.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.login)
    }
}

/// A parsed piece of a chat line: a plain text run or an emote reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    Emote { name: String },
}

/// One chat line from a monitored chatter, enriched with the display
/// profiles the destination subscription configured.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub channel: UserProfile,
    pub chatter: UserProfile,
    pub text: String,
    pub parts: Vec<MessagePart>,
}
