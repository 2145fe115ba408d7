//! Per-subscription bookkeeping for one (Twitch channel → Telegram chat)
//! pairing: display identity, the pending-event buffers the drain loops
//! consume, and the live-preview refresh token.

use crate::twitch::{
    are_predictions_mergeable, ChangeSet, ChannelUpdate, MonitoredChannel, Prediction, StateChange,
};
use crate::twitch::UserProfile;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One Twitch channel as seen by one destination chat.
pub struct ChannelObserver {
    pub name: String,
    pub emoji: String,
    pub channel: Arc<MonitoredChannel>,
    /// Token of the in-flight live-preview refresh; replaced (and the old
    /// one cancelled) whenever a new refresh starts.
    pub(crate) preview_retry: Mutex<Option<CancellationToken>>,
}

impl ChannelObserver {
    pub fn new(channel: Arc<MonitoredChannel>, profile: &UserProfile) -> Arc<Self> {
        Arc::new(Self {
            name: profile.display_name().to_string(),
            emoji: profile.emoji.clone().unwrap_or_default(),
            channel,
            preview_retry: Mutex::new(None),
        })
    }

    /// Cancel any in-flight preview refresh and install a fresh token.
    pub(crate) fn restart_preview_retry(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.preview_retry.lock().replace(token.clone()) {
            previous.cancel();
        }
        token
    }
}

/// A batch of coalesced state updates handed to the renderer: the accumulated
/// change kinds, the newest update, and the older ones (arrival order).
#[derive(Debug, Clone)]
pub struct StateBatch {
    pub notifications: ChangeSet,
    pub latest: ChannelUpdate,
    pub previous: Vec<ChannelUpdate>,
}

/// Pending state updates accumulated between drain iterations.
#[derive(Default)]
pub struct PendingUpdates {
    notifications: ChangeSet,
    updates: Vec<ChannelUpdate>,
}

impl PendingUpdates {
    /// Merge one incoming update. A live transition supersedes the opposite
    /// one still pending: `online` + `offline` never survive together.
    pub fn push(&mut self, update: ChannelUpdate) {
        if update.changes.contains(&StateChange::Online)
            || update.changes.contains(&StateChange::Offline)
        {
            self.notifications.remove(&StateChange::Online);
            self.notifications.remove(&StateChange::Offline);
        }
        self.notifications.extend(update.changes.iter().copied());
        self.updates.push(update);
    }

    /// Take everything buffered so far, or `None` when nothing is pending.
    pub fn take(&mut self) -> Option<StateBatch> {
        let latest = self.updates.pop()?;
        Some(StateBatch {
            notifications: std::mem::take(&mut self.notifications),
            latest,
            previous: std::mem::take(&mut self.updates),
        })
    }
}

/// Pending predictions accumulated between drain iterations; mergeable
/// snapshots collapse into the newest buffered entry instead of appending.
#[derive(Default)]
pub struct PendingPredictions {
    items: Vec<Prediction>,
}

impl PendingPredictions {
    pub fn push(&mut self, prediction: Prediction) {
        if let Some(last) = self.items.last_mut() {
            if are_predictions_mergeable(last, &prediction) {
                *last = prediction;
                return;
            }
        }
        self.items.push(prediction);
    }

    pub fn take(&mut self) -> Option<Vec<Prediction>> {
        if self.items.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.items))
        }
    }
}
