//! Per-channel state tracking and subscriber fan-out.
//!
//! A [`MonitoredChannel`] owns the mutable channel state, normalizes raw
//! upstream payloads into change sets, and dispatches filtered notifications
//! to the registered subscriber channels. Subscribers are plain records
//! (sender + options), appended in registration order and dispatched by
//! straight iteration.

use super::events::{BroadcastSettingsUpdate, PlaybackUpdate, PredictionSnapshot};
use super::preview::{PreviewClient, PreviewImage};
use super::{
    reconcile_prediction, ChangeSet, ChannelState, ChannelUpdate, ChatMessage, MessagePart,
    Prediction, PredictionStatus, StateChange, UserProfile,
};
use crate::config::NotificationOptions;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long a generated preview URL stays cached before a fresh cache-buster
/// is minted.
const PREVIEW_URL_CACHE: Duration = Duration::from_secs(1);
/// A preview image is assumed renderable this many seconds after the stream
/// started.
const PREVIEW_WARMUP_SECS: i64 = 20;
/// Pause between preview fetch attempts while polling for availability.
const PREVIEW_RETRY_PAUSE: Duration = Duration::from_secs(2);

/// A state-update subscription: filtered change notifications are pushed
/// into `tx` for the destination's coalescing loop to consume.
pub struct StateUpdateSubscriber {
    pub tx: mpsc::UnboundedSender<ChannelUpdate>,
    pub options: NotificationOptions,
}

/// A prediction subscription with its active-status cooldown state.
pub struct PredictionSubscriber {
    pub tx: mpsc::UnboundedSender<Prediction>,
    pub active_status_update_interval: Duration,
    active_status_updated_at: Option<Instant>,
}

/// A chat subscription: monitored chatters plus the display profiles the
/// destination configured for them.
pub struct ChatSubscriber {
    pub tx: mpsc::UnboundedSender<ChatMessage>,
    pub channel_profile: UserProfile,
    pub chatter_profiles: HashMap<String, UserProfile>,
}

#[derive(Default)]
struct ChannelStateInner {
    state: ChannelState,
    /// Last published snapshot; refreshed only when a field differs.
    last_snapshot: Option<Arc<ChannelState>>,
    prediction: Option<Prediction>,
    live_started_at: Option<DateTime<Utc>>,
    is_preview_available: bool,
}

#[derive(Default)]
struct Subscribers {
    state_updates: Vec<StateUpdateSubscriber>,
    predictions: Vec<PredictionSubscriber>,
    chatters: Vec<ChatSubscriber>,
}

/// A live-streaming channel under observation.
pub struct MonitoredChannel {
    pub login: String,
    pub display_name: String,
    inner: Mutex<ChannelStateInner>,
    subscribers: Mutex<Subscribers>,
    /// Union of every subscriber's monitored chatters, kept denormalized so
    /// the chat feed can cheaply test speakers before parsing work.
    monitored_chatters: RwLock<HashSet<String>>,
    preview: PreviewClient,
    preview_url_cache: Mutex<Option<(String, Instant)>>,
}

impl MonitoredChannel {
    pub fn new(profile: &UserProfile) -> Arc<Self> {
        Arc::new(Self {
            login: profile.login.clone(),
            display_name: profile.display_name().to_string(),
            inner: Mutex::new(ChannelStateInner::default()),
            subscribers: Mutex::new(Subscribers::default()),
            monitored_chatters: RwLock::new(HashSet::new()),
            preview: PreviewClient::new(),
            preview_url_cache: Mutex::new(None),
        })
    }

    // ── Subscriptions ────────────────────────────────────────────────────

    pub fn add_state_update_subscriber(&self, subscriber: StateUpdateSubscriber) {
        self.subscribers.lock().state_updates.push(subscriber);
    }

    pub fn add_prediction_subscriber(
        &self,
        tx: mpsc::UnboundedSender<Prediction>,
        active_status_update_interval: Duration,
    ) {
        self.subscribers.lock().predictions.push(PredictionSubscriber {
            tx,
            active_status_update_interval,
            active_status_updated_at: None,
        });
    }

    pub fn add_chat_subscriber(&self, subscriber: ChatSubscriber) {
        {
            let mut union = self.monitored_chatters.write();
            for login in subscriber.chatter_profiles.keys() {
                union.insert(login.clone());
            }
        }
        self.subscribers.lock().chatters.push(subscriber);
    }

    /// Fast pre-test: is anyone listening for this speaker at all?
    pub fn wants_chatter(&self, login: &str) -> bool {
        self.monitored_chatters.read().contains(login)
    }

    // ── State ────────────────────────────────────────────────────────────

    /// Replace the channel state without notifying anyone (initial sync).
    pub fn set_initial_state(&self, state: ChannelState) {
        let mut inner = self.inner.lock();
        inner.live_started_at = state.is_live.then(Utc::now);
        inner.state = state;
        inner.last_snapshot = None;
    }

    /// Current state as an immutable snapshot. A new snapshot value is
    /// produced only when a field differs from the last published one.
    pub fn current_state(&self) -> Arc<ChannelState> {
        let mut inner = self.inner.lock();
        let stale = inner
            .last_snapshot
            .as_ref()
            .is_none_or(|snap| **snap != inner.state);
        if stale {
            inner.last_snapshot = Some(Arc::new(inner.state.clone()));
        }
        inner.last_snapshot.clone().unwrap_or_default()
    }

    pub fn is_live(&self) -> bool {
        self.inner.lock().state.is_live
    }

    pub fn live_started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().live_started_at
    }

    pub fn last_prediction(&self) -> Option<Prediction> {
        self.inner.lock().prediction.clone()
    }

    // ── Upstream payload application ─────────────────────────────────────

    /// Apply a broadcast-settings payload: title and/or category change.
    pub fn apply_broadcast_settings(&self, update: &BroadcastSettingsUpdate) {
        let new_title = update.status.as_deref().unwrap_or("").trim().to_string();
        let new_category_id = update
            .game_id
            .filter(|id| *id != 0)
            .map(|id| id.to_string())
            .unwrap_or_default();
        let new_category_name = update.game.as_deref().unwrap_or("").trim().to_string();

        let mut changes = ChangeSet::new();
        {
            let mut inner = self.inner.lock();
            if inner.state.title != new_title {
                inner.state.title = new_title.clone();
                if !new_title.is_empty() {
                    changes.insert(StateChange::Title);
                }
            }
            if inner.state.category_id != new_category_id
                && inner.state.category_name != new_category_name
            {
                inner.state.category_id = new_category_id.clone();
                inner.state.category_name = new_category_name.clone();
                if !new_category_id.is_empty() && !new_category_name.is_empty() {
                    changes.insert(StateChange::Category);
                }
            }
        }
        self.notify_channel_updates(changes);
    }

    /// Apply a playback payload: stream-up / stream-down transition.
    pub fn apply_playback(&self, update: &PlaybackUpdate) {
        let mut changes = ChangeSet::new();
        {
            let mut inner = self.inner.lock();
            if update.is_stream_up() {
                inner.state.is_live = true;
                inner.live_started_at = Some(Utc::now());
                inner.is_preview_available = false;
                changes.insert(StateChange::Online);
            } else if update.is_stream_down() {
                inner.state.is_live = false;
                inner.is_preview_available = false;
                changes.insert(StateChange::Offline);
            }
        }
        self.notify_channel_updates(changes);
    }

    /// Reconcile and dispatch a raw prediction snapshot.
    pub fn apply_prediction_snapshot(&self, snapshot: &PredictionSnapshot) {
        let reconciled = {
            let inner = self.inner.lock();
            reconcile_prediction(snapshot, inner.prediction.as_ref())
        };
        if let Some(reconciled) = reconciled {
            self.notify_predictions(reconciled.prediction, reconciled.is_existing_active_update);
        }
    }

    /// Dispatch a chat line from the feed to interested subscribers.
    pub fn notify_chat(&self, chatter_login: &str, text: &str, parts: &[MessagePart]) {
        let subscribers = self.subscribers.lock();
        for subscriber in &subscribers.chatters {
            let Some(chatter) = subscriber.chatter_profiles.get(chatter_login) else {
                continue;
            };
            let _ = subscriber.tx.send(ChatMessage {
                channel: subscriber.channel_profile.clone(),
                chatter: chatter.clone(),
                text: text.to_string(),
                parts: parts.to_vec(),
            });
        }
    }

    // ── Fan-out ──────────────────────────────────────────────────────────

    /// Dispatch a change set to every state-update subscriber whose filter
    /// keeps it non-empty.
    pub fn notify_channel_updates(&self, changes: ChangeSet) {
        if changes.is_empty() {
            return;
        }
        let state = self.current_state();
        let updated_at = Utc::now();

        let subscribers = self.subscribers.lock();
        for subscriber in &subscribers.state_updates {
            let filtered = filter_channel_changes(&changes, &state, &subscriber.options);
            if filtered.is_empty() {
                continue;
            }
            let _ = subscriber.tx.send(ChannelUpdate {
                changes: filtered,
                state: Arc::clone(&state),
                updated_at,
            });
        }
    }

    /// Store and dispatch an accepted prediction, honoring each subscriber's
    /// independent active-status cooldown.
    pub fn notify_predictions(&self, prediction: Prediction, is_existing_active_update: bool) {
        self.inner.lock().prediction = Some(prediction.clone());

        let now = Instant::now();
        let mut subscribers = self.subscribers.lock();
        for subscriber in &mut subscribers.predictions {
            if is_existing_active_update
                && subscriber.active_status_updated_at.is_some_and(|at| {
                    now < at + subscriber.active_status_update_interval
                })
            {
                continue;
            }
            if prediction.status == PredictionStatus::Active {
                subscriber.active_status_updated_at = Some(now);
            }
            let _ = subscriber.tx.send(prediction.clone());
        }
    }

    // ── Live preview ─────────────────────────────────────────────────────

    /// Cache-busted preview image URL, refreshed at most once per second.
    pub fn cached_preview_url(&self) -> String {
        let mut cache = self.preview_url_cache.lock();
        if let Some((url, created_at)) = cache.as_ref() {
            if created_at.elapsed() < PREVIEW_URL_CACHE {
                return url.clone();
            }
        }
        let url = super::preview::preview_image_url(&self.login);
        *cache = Some((url.clone(), Instant::now()));
        url
    }

    /// Whether the preview CDN has been observed serving a real image for the
    /// current live session.
    pub fn is_preview_available(&self) -> bool {
        let inner = self.inner.lock();
        inner.is_preview_available
            || inner
                .live_started_at
                .is_some_and(|at| (Utc::now() - at).num_seconds() > PREVIEW_WARMUP_SECS)
    }

    /// Poll the preview CDN until an image appears, the deadline passes, the
    /// stream goes offline, or the token is cancelled.
    pub async fn try_get_preview_image(
        &self,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Option<PreviewImage> {
        if token.is_cancelled() || !self.is_live() {
            return None;
        }
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(image) = self.preview.fetch(&self.login).await {
                if self.is_live() {
                    self.inner.lock().is_preview_available = true;
                    return Some(image);
                }
                return None;
            }
            if token.is_cancelled() || !self.is_live() || Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(PREVIEW_RETRY_PAUSE).await;
        }
    }
}

/// Strip a change set down to the kinds a subscriber opted into; category
/// changes are additionally suppressed when the new category name is on the
/// subscriber's exclusion list.
pub fn filter_channel_changes(
    changes: &ChangeSet,
    state: &ChannelState,
    options: &NotificationOptions,
) -> ChangeSet {
    let mut filtered = ChangeSet::new();
    let mut keep = |change: StateChange, enabled: bool| {
        if enabled && changes.contains(&change) {
            filtered.insert(change);
        }
    };
    keep(StateChange::Online, options.notifies_online);
    keep(StateChange::Offline, options.notifies_offline);
    keep(StateChange::Title, options.notifies_title);
    keep(
        StateChange::Category,
        options.notifies_category
            && !options
                .excluded_category_names
                .iter()
                .any(|excluded| state.category_name == *excluded),
    );
    filtered
}
