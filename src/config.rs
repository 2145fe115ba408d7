//! Configuration: a TOML file deserialized into plain structs, validated
//! once at startup and handed to the notifier as in-memory values.

use crate::twitch::UserProfile;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Which notifications one destination wants for one channel.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotificationOptions {
    pub notifies_online: bool,
    pub notifies_offline: bool,
    pub notifies_title: bool,
    pub notifies_category: bool,
    /// Category changes into any of these names are suppressed.
    pub excluded_category_names: Vec<String>,
    pub notifies_predictions: bool,
    /// Chat from these logins is relayed.
    pub monitored_chatters: Vec<String>,
}

/// Bot account credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    pub token: String,
    #[serde(default)]
    pub name: String,
}

/// Telegram account setup: the notification bot, plus an optional separate
/// bot for chat relays so chat volume cannot starve state notifications.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub bot: BotConfig,
    #[serde(default)]
    pub chat_bot: Option<BotConfig>,
}

/// Operator alert forwarding target.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    pub chat_id: String,
    /// Deployment label prefixed to forwarded alerts.
    #[serde(default)]
    pub label: String,
}

/// One monitored channel within a destination.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelSubscriptionConfig {
    pub login: String,
    #[serde(default)]
    pub options: NotificationOptions,
}

/// One destination chat and the channels it watches.
#[derive(Debug, Clone, Deserialize)]
pub struct DestinationConfig {
    pub chat_id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Name of the bot to deliver through; the chat bot is picked when this
    /// matches its configured name, the notification bot otherwise.
    #[serde(default)]
    pub bot_name: Option<String>,
    pub channels: Vec<ChannelSubscriptionConfig>,
}

fn default_active_status_cooldown_secs() -> u64 {
    7
}

fn default_flow_target_interval_ms() -> u64 {
    3000
}

fn default_flow_min_interval_ms() -> u64 {
    1000
}

fn default_flow_max_interval_ms() -> u64 {
    6000
}

fn default_flow_window() -> usize {
    10
}

fn default_chat_buffer_max_chars() -> usize {
    1_000_000
}

/// Delivery pacing knobs. The defaults match the tuned production values;
/// they are configuration, not contract.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Per-subscriber cooldown between active-prediction refreshes.
    pub active_status_cooldown_secs: u64,
    /// Chat flow control: desired average gap between sends.
    pub flow_target_interval_ms: u64,
    /// Chat flow control: gap below which the maximum correction applies.
    pub flow_min_interval_ms: u64,
    /// Chat flow control: largest enforced gap.
    pub flow_max_interval_ms: u64,
    /// Sliding-window sample count for the trailing average.
    pub flow_window: usize,
    /// Cap on buffered, pre-render chat text per destination.
    pub chat_buffer_max_chars: usize,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            active_status_cooldown_secs: default_active_status_cooldown_secs(),
            flow_target_interval_ms: default_flow_target_interval_ms(),
            flow_min_interval_ms: default_flow_min_interval_ms(),
            flow_max_interval_ms: default_flow_max_interval_ms(),
            flow_window: default_flow_window(),
            chat_buffer_max_chars: default_chat_buffer_max_chars(),
        }
    }
}

impl PacingConfig {
    pub fn active_status_cooldown(&self) -> Duration {
        Duration::from_secs(self.active_status_cooldown_secs)
    }
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub alerts: Option<AlertConfig>,
    /// Display profiles for channel owners and chatters.
    #[serde(default)]
    pub users: Vec<UserProfile>,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
    /// Emote name → alt text replacements for chat relays.
    #[serde(default)]
    pub emotes: HashMap<String, String>,
    #[serde(default)]
    pub pacing: PacingConfig,
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.telegram.bot.token.is_empty(),
            "telegram.bot.token must not be empty"
        );
        for destination in &self.destinations {
            anyhow::ensure!(
                !destination.chat_id.is_empty(),
                "destination chat_id must not be empty"
            );
            anyhow::ensure!(
                !destination.channels.is_empty(),
                "destination {} has no channels",
                destination.chat_id
            );
        }
        Ok(())
    }

    /// Display profile for a login, falling back to a bare profile.
    pub fn user_profile(&self, login: &str) -> UserProfile {
        self.users
            .iter()
            .find(|user| user.login == login)
            .cloned()
            .unwrap_or_else(|| UserProfile::from_login(login))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [telegram.bot]
        token = "123:abc"
        name = "noti-bot"

        [telegram.chat_bot]
        token = "456:def"
        name = "chat-bot"

        [alerts]
        chat_id = "777"
        label = "prod"

        [[users]]
        login = "somestreamer"
        name = "SomeStreamer"
        emoji = "🦊"

        [[destinations]]
        chat_id = "-100200300"
        name = "notification group"
        bot_name = "chat-bot"

        [[destinations.channels]]
        login = "somestreamer"
        options = { notifies_online = true, notifies_title = true, monitored_chatters = ["alice"] }

        [emotes]
        FrogHype = "🐸"

        [pacing]
        active_status_cooldown_secs = 5
    "#;

    #[test]
    fn sample_config_parses() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.telegram.bot.name, "noti-bot");
        assert_eq!(config.telegram.chat_bot.as_ref().unwrap().name, "chat-bot");
        assert_eq!(config.alerts.as_ref().unwrap().chat_id, "777");

        let destination = &config.destinations[0];
        assert_eq!(destination.bot_name.as_deref(), Some("chat-bot"));
        let channel = &destination.channels[0];
        assert!(channel.options.notifies_online);
        assert!(!channel.options.notifies_offline);
        assert_eq!(channel.options.monitored_chatters, ["alice"]);

        assert_eq!(config.emotes["FrogHype"], "🐸");
        assert_eq!(config.pacing.active_status_cooldown_secs, 5);
        assert_eq!(config.pacing.flow_window, 10);
    }

    #[test]
    fn user_profile_lookup_falls_back_to_login() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.user_profile("somestreamer").display_name(), "SomeStreamer");
        assert_eq!(config.user_profile("unknown").display_name(), "unknown");
    }

    #[tokio::test]
    async fn load_reads_and_validates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streamherald.toml");
        tokio::fs::write(&path, SAMPLE).await.unwrap();

        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.destinations.len(), 1);

        assert!(Config::load(&dir.path().join("missing.toml")).await.is_err());
    }

    #[test]
    fn empty_token_is_rejected() {
        let config: Config = toml::from_str(
            r#"
            [telegram.bot]
            token = ""
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
