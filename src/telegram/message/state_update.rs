//! Renderer for channel state-update notifications.
//!
//! The newest state renders prominently at the top; every older coalesced
//! update is archived below it as a spoiler-collapsed history entry, dropped
//! oldest-first once the character budget runs out.

use super::{MessageKind, OutboundMessage, RenderedMessage, TextChangeTracker};
use crate::telegram::observer::{ChannelObserver, StateBatch};
use crate::telegram::MAX_TEXT_MESSAGE_LENGTH;
use crate::twitch::{ChangeSet, ChannelState, ChannelUpdate, StateChange};
use crate::util::{escape_html, time_ago, truncate_chars};
use chrono::{DateTime, Utc};
use std::sync::Arc;

const MAX_CHANNEL_NAME_LEN: usize = 100;
const MAX_TITLE_LEN: usize = 140;
const MAX_CATEGORY_LEN: usize = 140;

/// What the previous render decided about the embedded live preview.
#[derive(Debug, Clone)]
pub struct RenderMetadata {
    pub has_live_preview: bool,
    pub live_started_at: Option<DateTime<Utc>>,
    /// True when a preview was wanted but not yet available — the sender
    /// should start a background preview refresh for this message.
    pub is_live_preview_update_required: bool,
}

pub struct StateUpdateMessage {
    observer: Arc<ChannelObserver>,
    show_channel_name: bool,
    notifications: ChangeSet,
    latest: ChannelUpdate,
    previous: Vec<ChannelUpdate>,
    tracker: TextChangeTracker,
    pub(crate) prev_metadata: Option<RenderMetadata>,
    /// Preview URL confirmed by a background fetch, embedded on re-render.
    pub(crate) live_preview_image_url: Option<String>,
}

impl StateUpdateMessage {
    pub fn new(observer: Arc<ChannelObserver>, show_channel_name: bool, batch: StateBatch) -> Self {
        Self {
            observer,
            show_channel_name,
            notifications: batch.notifications,
            latest: batch.latest,
            previous: batch.previous,
            tracker: TextChangeTracker::default(),
            prev_metadata: None,
            live_preview_image_url: None,
        }
    }

    /// Merge a newer batch into this message: its updates become the new
    /// head, everything currently held moves into history.
    pub fn absorb(&mut self, batch: StateBatch) {
        self.notifications.extend(batch.notifications);
        let superseded = std::mem::replace(&mut self.latest, batch.latest);
        self.previous.push(superseded);
        self.previous.extend(batch.previous);
    }

    fn notification_title_text(&self, visible: &mut usize) -> String {
        let channel_name = if self.show_channel_name {
            format!("[{}] ", truncate_chars(&self.observer.name, MAX_CHANNEL_NAME_LEN))
        } else {
            String::new()
        };
        *visible += channel_name.chars().count();

        let changes = state_changes_label(&self.notifications, &self.latest.state);
        *visible += changes.chars().count();

        let url = format!("https://www.twitch.tv/{}", self.observer.channel.login);
        let emoji = if self.latest.state.is_live { "🔴" } else { "⚪" };
        *visible += 1;

        let text = format!(
            "<b>{}</b> <a href=\"{}\">{}</a>",
            escape_html(&format!("{channel_name}{changes}")),
            escape_html(&url),
            emoji
        );
        *visible += 1; // whitespace in front of the emoji anchor
        text
    }

    fn latest_state_text(&self, visible: &mut usize) -> String {
        let title = truncate_chars(&self.latest.state.title, MAX_TITLE_LEN);
        let category = truncate_chars(&self.latest.state.category_name, MAX_CATEGORY_LEN);

        let mut title_text = String::new();
        if !title.is_empty() {
            title_text = if self.notifications.contains(&StateChange::Title) {
                format!("\n<b>{}</b>", escape_html(&title))
            } else {
                format!("\n{}", escape_html(&title))
            };
            *visible += title.chars().count() + 1;
        }

        let mut category_text = String::new();
        if !category.is_empty() {
            category_text = if self.notifications.contains(&StateChange::Category) {
                format!("\n<b><i>{}</i></b>", escape_html(&category))
            } else {
                format!("\n<i>{}</i>", escape_html(&category))
            };
            *visible += category.chars().count() + 1;
        }

        // A pure category change leads with the category.
        if self.notifications.contains(&StateChange::Category)
            && !self.notifications.contains(&StateChange::Title)
        {
            format!("{category_text}{title_text}")
        } else {
            format!("{title_text}{category_text}")
        }
    }

    fn history_entry(&self, index: usize, visible_budget_left: usize) -> Option<(String, usize)> {
        let update = &self.previous[index];
        let mut extra = 8usize; // separator line + newline
        let separator = if index + 1 == self.previous.len() {
            "\n───────"
        } else {
            "\n<tg-spoiler>―――――――</tg-spoiler>"
        };

        let title = truncate_chars(&update.state.title, MAX_TITLE_LEN);
        let mut title_text = String::new();
        if !title.is_empty() {
            title_text = format!("\n<tg-spoiler>{}</tg-spoiler>", escape_html(&title));
            extra += title.chars().count() + 1;
        }

        let category = truncate_chars(&update.state.category_name, MAX_CATEGORY_LEN);
        let mut category_text = String::new();
        if !category.is_empty() {
            category_text = format!("\n<tg-spoiler><i>{}</i></tg-spoiler>", escape_html(&category));
            extra += category.chars().count() + 1;
        }

        let metadata = format!(
            "{} | {} {}",
            time_ago(update.updated_at),
            state_changes_label(&update.changes, &update.state),
            if update.state.is_live { '●' } else { '○' }
        );
        let metadata_text = format!("\n<tg-spoiler>{}</tg-spoiler>", escape_html(&metadata));
        extra += metadata.chars().count() + 1;

        if extra > visible_budget_left {
            return None;
        }
        Some((
            format!("{separator}{title_text}{category_text}{metadata_text}"),
            extra,
        ))
    }
}

impl OutboundMessage for StateUpdateMessage {
    fn kind(&self) -> MessageKind {
        MessageKind::StateUpdate
    }

    fn render(&mut self) -> RenderedMessage {
        let mut visible = 0usize;
        let mut text = self.notification_title_text(&mut visible);

        let offline_only = self.notifications.len() == 1
            && self.notifications.contains(&StateChange::Offline);
        if !offline_only {
            text.push_str(&self.latest_state_text(&mut visible));
        }

        for index in (0..self.previous.len()).rev() {
            let budget_left = (MAX_TEXT_MESSAGE_LENGTH - 1).saturating_sub(visible);
            match self.history_entry(index, budget_left) {
                Some((entry, extra)) => {
                    text.push_str(&entry);
                    visible += extra;
                }
                None => break,
            }
        }

        let channel = &self.observer.channel;
        let mut has_live_preview = false;
        let mut is_live_preview_update_required = false;
        let is_live_preview_required = self.latest.state.is_live && channel.is_live();
        if is_live_preview_required {
            if channel.is_preview_available() {
                text = format!(
                    "<a href=\"{}\">\u{200e}</a>{text}",
                    channel.cached_preview_url()
                );
                has_live_preview = true;
            } else if self
                .prev_metadata
                .as_ref()
                .is_some_and(|meta| meta.live_started_at == channel.live_started_at())
                && self.live_preview_image_url.is_some()
            {
                // Same live session: reuse the preview a background fetch
                // already confirmed for this message.
                if let Some(url) = &self.live_preview_image_url {
                    text = format!("<a href=\"{url}\">\u{200e}</a>{text}");
                    has_live_preview = true;
                }
            } else {
                is_live_preview_update_required = true;
            }
        }
        self.prev_metadata = Some(RenderMetadata {
            has_live_preview,
            live_started_at: channel.live_started_at(),
            is_live_preview_update_required,
        });

        let has_text_changed = self.tracker.update(&text);
        RenderedMessage {
            text,
            has_text_changed,
            disable_web_page_preview: !has_live_preview,
        }
    }
}

/// Human label for a set of state changes, e.g. `Live, Title changed`.
fn state_changes_label(changes: &ChangeSet, state: &ChannelState) -> String {
    let mut segments: Vec<&str> = Vec::new();
    if changes.contains(&StateChange::Online) && state.is_live {
        segments.push("Live");
    } else if changes.contains(&StateChange::Offline) && !state.is_live {
        segments.push("Offline");
    }

    let title = changes.contains(&StateChange::Title);
    let category = changes.contains(&StateChange::Category);
    if title && category {
        segments.push("Title & category changed");
    } else if title {
        segments.push("Title changed");
    } else if category {
        segments.push("Category changed");
    }
    segments.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twitch::{MonitoredChannel, UserProfile};

    fn visible_len(text: &str) -> usize {
        let mut count = 0usize;
        let mut in_tag = false;
        for c in text.chars() {
            match c {
                '<' => in_tag = true,
                '>' => in_tag = false,
                _ if !in_tag => count += 1,
                _ => {}
            }
        }
        count
    }

    fn observer(live: bool) -> Arc<ChannelObserver> {
        let channel = MonitoredChannel::new(&UserProfile {
            login: "streamer".into(),
            name: Some("Streamer".into()),
            emoji: None,
        });
        channel.set_initial_state(ChannelState {
            is_live: live,
            title: "current title".into(),
            category_id: "1".into(),
            category_name: "Tetris".into(),
        });
        ChannelObserver::new(channel, &UserProfile {
            login: "streamer".into(),
            name: Some("Streamer".into()),
            emoji: None,
        })
    }

    fn update(changes: &[StateChange], state: ChannelState) -> ChannelUpdate {
        ChannelUpdate {
            changes: changes.iter().copied().collect(),
            state: Arc::new(state),
            updated_at: Utc::now(),
        }
    }

    fn online_state(title: &str) -> ChannelState {
        ChannelState {
            is_live: true,
            title: title.into(),
            category_id: "1".into(),
            category_name: "Tetris".into(),
        }
    }

    fn batch(changes: &[StateChange], state: ChannelState) -> StateBatch {
        StateBatch {
            notifications: changes.iter().copied().collect(),
            latest: update(changes, state),
            previous: Vec::new(),
        }
    }

    #[test]
    fn online_update_renders_state_and_label() {
        let mut message = StateUpdateMessage::new(
            observer(false),
            true,
            batch(&[StateChange::Online], online_state("current title")),
        );
        let rendered = message.render();
        assert!(rendered.text.contains("[Streamer] Live"));
        assert!(rendered.text.contains("current title"));
        assert!(rendered.text.contains("<i>Tetris</i>"));
        assert!(rendered.has_text_changed);
    }

    #[test]
    fn offline_only_update_skips_state_block() {
        let state = ChannelState {
            is_live: false,
            ..online_state("current title")
        };
        let mut message = StateUpdateMessage::new(
            observer(false),
            false,
            batch(&[StateChange::Offline], state),
        );
        let rendered = message.render();
        assert!(rendered.text.contains("Offline"));
        assert!(!rendered.text.contains("current title"));
    }

    #[test]
    fn unchanged_rerender_reports_no_change() {
        let mut message = StateUpdateMessage::new(
            observer(false),
            true,
            batch(&[StateChange::Title], online_state("a title")),
        );
        assert!(message.render().has_text_changed);
        assert!(!message.render().has_text_changed);

        message.absorb(StateBatch {
            notifications: ChangeSet::from([StateChange::Title]),
            latest: update(&[StateChange::Title], online_state("another title")),
            previous: Vec::new(),
        });
        assert!(message.render().has_text_changed);
    }

    #[test]
    fn absorbed_updates_archive_into_history() {
        let mut message = StateUpdateMessage::new(
            observer(false),
            true,
            batch(&[StateChange::Title], online_state("first title")),
        );
        message.absorb(batch(&[StateChange::Title], online_state("second title")));

        let rendered = message.render();
        assert!(rendered.text.contains("second title"));
        assert!(rendered.text.contains("<tg-spoiler>first title</tg-spoiler>"));
        // Newest content leads.
        assert!(
            rendered.text.find("second title").unwrap()
                < rendered.text.find("first title").unwrap()
        );
    }

    #[test]
    fn history_is_dropped_oldest_first_under_budget() {
        let mut message = StateUpdateMessage::new(
            observer(false),
            true,
            batch(&[StateChange::Title], online_state("title 0")),
        );
        for i in 1..100 {
            let long_title = format!("title {i} {}", "x".repeat(130));
            message.absorb(batch(&[StateChange::Title], online_state(&long_title)));
        }

        let rendered = message.render();
        assert!(visible_len(&rendered.text) <= MAX_TEXT_MESSAGE_LENGTH);
        // The newest survives, the oldest history entries do not.
        assert!(rendered.text.contains("title 99"));
        assert!(!rendered.text.contains("title 0"));
    }

    #[test]
    fn live_message_without_preview_requests_refresh() {
        let obs = observer(true);
        let mut message = StateUpdateMessage::new(
            obs,
            true,
            batch(&[StateChange::Online], online_state("current title")),
        );
        let rendered = message.render();
        // Channel just went live: preview not warmed up yet.
        assert!(rendered.disable_web_page_preview);
        let meta = message.prev_metadata.as_ref().unwrap();
        assert!(meta.is_live_preview_update_required);
        assert!(!meta.has_live_preview);
    }

    #[test]
    fn confirmed_preview_url_is_embedded_on_rerender() {
        let obs = observer(true);
        let mut message = StateUpdateMessage::new(
            obs,
            true,
            batch(&[StateChange::Online], online_state("current title")),
        );
        message.render();
        message.live_preview_image_url = Some("https://example.com/preview.jpg".into());

        let rendered = message.render();
        assert!(rendered.text.starts_with("<a href=\"https://example.com/preview.jpg\">"));
        assert!(!rendered.disable_web_page_preview);
    }
}
