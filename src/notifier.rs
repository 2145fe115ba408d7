//! Orchestration: the channel registry, upstream event intake, and
//! destination wiring.
//!
//! The upstream transport (feed subscription, frame parsing, chat-room
//! membership) lives outside this crate; it hands events in through
//! [`Notifier::handle_event`] and joins chat rooms through the
//! [`ChatFeed`] retry policy.

use crate::alert::Alerter;
use crate::config::{Config, DestinationConfig};
use crate::telegram::{MessageTransport, NotifiedChannel, TelegramBot};
use crate::twitch::events::{BroadcastSettingsUpdate, PlaybackUpdate, PredictionSnapshot};
use crate::twitch::{ChannelState, MessagePart, MonitoredChannel, UserProfile};
use crate::util::fibonacci_delays;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Join attempts before the feed connection is forced to reconnect.
const CHAT_JOIN_RETRY_LIMIT: usize = 10;
/// Cap on the Fibonacci retry delay between join attempts.
const CHAT_JOIN_RETRY_CAP_SECS: u64 = 120;

/// One upstream event, keyed by channel login. The transport adapter
/// resolves feed-internal ids to logins before handing events over.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamEvent {
    /// Full state sync, e.g. the transport's initial lookup. Applied
    /// silently, without notifying subscribers.
    ChannelState {
        channel: String,
        state: ChannelState,
    },
    /// Title/category change.
    BroadcastSettings {
        channel: String,
        update: BroadcastSettingsUpdate,
    },
    /// Stream-up / stream-down transition.
    Playback {
        channel: String,
        update: PlaybackUpdate,
    },
    /// Raw channel-points prediction snapshot.
    Prediction {
        channel: String,
        payload: PredictionSnapshot,
    },
    /// One chat line from the channel's chat room.
    Chat {
        channel: String,
        chatter: String,
        text: String,
        #[serde(default)]
        parts: Vec<MessagePart>,
    },
}

/// The chat-room side of the upstream transport.
#[async_trait]
pub trait ChatFeed: Send + Sync {
    /// Whether the feed connection is registered and able to join.
    fn is_registered(&self) -> bool;

    async fn join(&self, channel_login: &str) -> Result<()>;

    /// Tear down and re-establish the feed connection.
    async fn reconnect(&self) -> Result<()>;
}

/// Event router and registry of monitored channels and destinations.
pub struct Notifier {
    config: Config,
    channels: Mutex<HashMap<String, Arc<MonitoredChannel>>>,
    destinations: Mutex<HashMap<String, Arc<NotifiedChannel>>>,
    emotes: Arc<HashMap<String, String>>,
    alerter: Alerter,
}

impl Notifier {
    pub fn new(config: Config, alerter: Alerter) -> Self {
        let emotes = Arc::new(config.emotes.clone());
        Self {
            config,
            channels: Mutex::new(HashMap::new()),
            destinations: Mutex::new(HashMap::new()),
            emotes,
            alerter,
        }
    }

    /// The monitored channel for a login, created on first use.
    pub fn ensure_channel(&self, login: &str) -> Arc<MonitoredChannel> {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get(login) {
            return Arc::clone(channel);
        }
        let profile = self.config.user_profile(login);
        let channel = MonitoredChannel::new(&profile);
        channels.insert(login.to_string(), Arc::clone(&channel));
        channel
    }

    fn channel(&self, login: &str) -> Option<Arc<MonitoredChannel>> {
        self.channels.lock().get(login).cloned()
    }

    /// The delivery pipeline registered for a destination chat.
    pub fn destination(&self, chat_id: &str) -> Option<Arc<NotifiedChannel>> {
        self.destinations.lock().get(chat_id).cloned()
    }

    /// Wire one destination chat: build its pipeline and subscribe every
    /// configured channel.
    pub fn add_destination(&self, destination: &DestinationConfig, bot: &Arc<TelegramBot>) -> Result<()> {
        let throttler = bot
            .throttler_for_chat(&destination.chat_id)
            .with_context(|| {
                format!(
                    "could not get throttler for telegram chat: {}",
                    destination.chat_id
                )
            })?;

        let notified = NotifiedChannel::new(
            destination.chat_id.clone(),
            destination.name.clone(),
            Arc::clone(bot) as Arc<dyn MessageTransport>,
            throttler,
            Arc::clone(&self.emotes),
            &self.config.pacing,
            self.alerter.clone(),
        );

        for subscription in &destination.channels {
            let profile = self.config.user_profile(&subscription.login);
            let channel = self.ensure_channel(&subscription.login);
            let chatter_profiles: HashMap<String, UserProfile> = subscription
                .options
                .monitored_chatters
                .iter()
                .map(|login| (login.clone(), self.config.user_profile(login)))
                .collect();
            notified.subscribe_channel(&channel, &profile, &subscription.options, chatter_profiles);
        }

        self.destinations
            .lock()
            .insert(destination.chat_id.clone(), notified);
        info!(
            "destination added: {} ({} channels)",
            destination.chat_id,
            destination.channels.len()
        );
        Ok(())
    }

    /// Route one upstream event to its channel.
    pub fn handle_event(&self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::ChannelState { channel, state } => {
                self.ensure_channel(&channel).set_initial_state(state);
            }
            UpstreamEvent::BroadcastSettings { channel, update } => {
                if let Some(channel) = self.channel(&channel) {
                    channel.apply_broadcast_settings(&update);
                }
            }
            UpstreamEvent::Playback { channel, update } => {
                if let Some(channel) = self.channel(&channel) {
                    channel.apply_playback(&update);
                }
            }
            UpstreamEvent::Prediction { channel, payload } => {
                if let Some(channel) = self.channel(&channel) {
                    channel.apply_prediction_snapshot(&payload);
                }
            }
            UpstreamEvent::Chat {
                channel,
                chatter,
                text,
                parts,
            } => {
                let Some(channel) = self.channel(&channel) else {
                    return;
                };
                // Cheap union test before any per-message work.
                if text.is_empty() || !channel.wants_chatter(&chatter) {
                    return;
                }
                let parts = if parts.is_empty() {
                    vec![MessagePart::Text { text: text.clone() }]
                } else {
                    parts
                };
                channel.notify_chat(&chatter, &text, &parts);
            }
        }
    }

    /// Join a channel's chat room with bounded Fibonacci backoff; after the
    /// retry budget is spent the feed is forced to reconnect.
    pub async fn join_chat_with_retry(&self, feed: &dyn ChatFeed, channel_login: &str) {
        let mut delays = fibonacci_delays(CHAT_JOIN_RETRY_CAP_SECS);
        let mut attempts = 0usize;
        while feed.is_registered() {
            match feed.join(channel_login).await {
                Ok(()) => {
                    info!("joined channel chat: {channel_login}");
                    return;
                }
                Err(err) => {
                    self.alerter.alert(format!(
                        "failed to join channel chat: {channel_login}\nerror message: {err:#}"
                    ));
                    attempts += 1;
                    if attempts > CHAT_JOIN_RETRY_LIMIT {
                        if let Err(err) = feed.reconnect().await {
                            self.alerter.alert(format!(
                                "failed to reconnect chat feed.\nerror message: {err:#}"
                            ));
                        }
                        return;
                    }
                    let secs = delays.next().unwrap_or(CHAT_JOIN_RETRY_CAP_SECS);
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn notifier() -> Notifier {
        let config: Config = toml::from_str(
            r#"
            [telegram.bot]
            token = "t"
            "#,
        )
        .unwrap();
        Notifier::new(config, Alerter::disabled())
    }

    #[test]
    fn ensure_channel_returns_the_same_instance() {
        let notifier = notifier();
        let a = notifier.ensure_channel("streamer");
        let b = notifier.ensure_channel("streamer");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn upstream_events_deserialize_from_tagged_json() {
        let event: UpstreamEvent = serde_json::from_str(
            r#"{"type":"playback","channel":"streamer","update":{"type":"stream-up"}}"#,
        )
        .unwrap();
        match event {
            UpstreamEvent::Playback { channel, update } => {
                assert_eq!(channel, "streamer");
                assert!(update.is_stream_up());
            }
            _ => panic!("wrong variant"),
        }

        let event: UpstreamEvent = serde_json::from_str(
            r#"{"type":"chat","channel":"streamer","chatter":"alice","text":"hi"}"#,
        )
        .unwrap();
        assert!(matches!(event, UpstreamEvent::Chat { .. }));
    }

    struct FlakyFeed {
        join_calls: AtomicUsize,
        reconnects: AtomicUsize,
        fail_joins: usize,
    }

    #[async_trait]
    impl ChatFeed for FlakyFeed {
        fn is_registered(&self) -> bool {
            true
        }

        async fn join(&self, _channel_login: &str) -> Result<()> {
            let attempt = self.join_calls.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_joins {
                anyhow::bail!("join refused");
            }
            Ok(())
        }

        async fn reconnect(&self) -> Result<()> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn join_retries_with_backoff_then_succeeds() {
        let notifier = notifier();
        let feed = FlakyFeed {
            join_calls: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
            fail_joins: 3,
        };
        notifier.join_chat_with_retry(&feed, "streamer").await;
        assert_eq!(feed.join_calls.load(Ordering::SeqCst), 4);
        assert_eq!(feed.reconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn join_gives_up_and_reconnects_after_retry_budget() {
        let notifier = notifier();
        let feed = FlakyFeed {
            join_calls: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
            fail_joins: usize::MAX,
        };
        notifier.join_chat_with_retry(&feed, "streamer").await;
        assert_eq!(feed.join_calls.load(Ordering::SeqCst), 11);
        assert_eq!(feed.reconnects.load(Ordering::SeqCst), 1);
    }
}
