//! Renderer for channel-points prediction notifications.
//!
//! The newest prediction state renders in full (title, per-outcome share,
//! payout ratio, bettor count and a proportional bar); older states archive
//! into a spoiler-collapsed trailer under the same character budget.

use super::{MessageKind, OutboundMessage, RenderedMessage, TextChangeTracker};
use crate::telegram::observer::ChannelObserver;
use crate::telegram::MAX_TEXT_MESSAGE_LENGTH;
use crate::twitch::{are_predictions_mergeable, Prediction, PredictionStatus};
use crate::util::{compact_number, escape_html, keycap_number, time_ago, truncate_chars};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

const MAX_CHANNEL_NAME_LEN: usize = 100;
const MAX_PREDICTION_TITLE_LEN: usize = 150;
const MAX_OUTCOME_TITLE_LEN: usize = 50;
/// At most this many outcomes render; a winning outcome beyond the cut-off
/// is appended anyway.
const MAX_RENDERED_OUTCOMES: usize = 30;
const PROPORTION_BAR_CELLS: f64 = 40.0;
/// A cached preview URL is reused until this much time has passed *and* the
/// prediction id or status moved on.
const PREVIEW_REFRESH_AFTER: std::time::Duration = std::time::Duration::from_secs(32);

struct CachedPreview {
    url: String,
    fetched_at: Instant,
    prediction_id: String,
    status: PredictionStatus,
}

pub struct PredictionMessage {
    observer: Arc<ChannelObserver>,
    show_channel_name: bool,
    predictions: Vec<Prediction>,
    tracker: TextChangeTracker,
    preview: Option<CachedPreview>,
}

impl PredictionMessage {
    pub fn new(
        observer: Arc<ChannelObserver>,
        show_channel_name: bool,
        predictions: Vec<Prediction>,
    ) -> Self {
        Self {
            observer,
            show_channel_name,
            predictions,
            tracker: TextChangeTracker::default(),
            preview: None,
        }
    }

    /// Absorb a whole pending batch: collapse its head into the current tail
    /// when mergeable, append the rest.
    pub fn absorb(&mut self, batch: &mut Vec<Prediction>) {
        self.merge_status(batch);
        self.predictions.append(batch);
    }

    /// Collapse the batch head into the tail prediction when they are
    /// mergeable (same wager ticking up, or a resolution finalizing).
    /// Returns true when a merge happened.
    pub fn merge_status(&mut self, batch: &mut Vec<Prediction>) -> bool {
        let mergeable = match (self.predictions.last(), batch.first()) {
            (Some(existing), Some(addition)) => are_predictions_mergeable(existing, addition),
            _ => false,
        };
        if mergeable {
            if let Some(last) = self.predictions.last_mut() {
                *last = batch.remove(0);
            }
        }
        mergeable
    }

    fn notification_title_text(&self, visible: &mut usize) -> String {
        let Some(prediction) = self.predictions.last() else {
            return String::new();
        };

        let channel_name = if self.show_channel_name {
            format!("[{}] ", truncate_chars(&self.observer.name, MAX_CHANNEL_NAME_LEN))
        } else {
            String::new()
        };
        *visible += channel_name.chars().count();

        let url = format!("https://www.twitch.tv/{}", self.observer.channel.login);
        let linked = |label: &str, emoji: &str| {
            format!(
                "<b>{}</b> <a href=\"{}\">{}</a>",
                escape_html(&format!("{channel_name}{label}")),
                escape_html(&url),
                emoji
            )
        };

        match prediction.status {
            PredictionStatus::Active => {
                let ends_at = prediction.created_at
                    + chrono::Duration::seconds(prediction.prediction_window_secs as i64);
                let mut seconds_left = (ends_at - Utc::now()).num_seconds();
                if seconds_left > 0 {
                    // Snap a just-opened window to its full length so the
                    // countdown does not flicker off by transit delay.
                    if seconds_left > prediction.prediction_window_secs as i64 - 3 {
                        seconds_left = prediction.prediction_window_secs as i64;
                    }
                    let time_left = format!("{}:{:02}", seconds_left / 60, seconds_left % 60);
                    *visible += "Prediction started".chars().count() + 2 + time_left.chars().count();
                    format!("{}{}", linked("Prediction started", "⏳"), time_left)
                } else {
                    *visible += "Prediction started".chars().count() + 2;
                    linked("Prediction started", "🚪")
                }
            }
            PredictionStatus::Locked => {
                *visible += "Prediction started".chars().count() + 2;
                linked("Prediction started", "🔒")
            }
            PredictionStatus::ResolvePending | PredictionStatus::Resolved => {
                let winner_emoji = keycap_number(
                    prediction.winning_outcome_index().map_or(0, |i| i + 1),
                );
                *visible += "Prediction result".chars().count() + 1 + winner_emoji.chars().count();
                linked("Prediction result", &winner_emoji)
            }
            PredictionStatus::Canceled => {
                *visible += "Prediction canceled".chars().count() + 2;
                linked("Prediction canceled", "❌")
            }
        }
    }

    fn prediction_title_text(&self, visible: &mut usize) -> String {
        let Some(prediction) = self.predictions.last() else {
            return String::new();
        };
        let title = truncate_chars(&prediction.title, MAX_PREDICTION_TITLE_LEN);
        *visible += title.chars().count() + 1;
        format!("\n<b>{}</b>", escape_html(&title))
    }

    fn outcomes_text(&self, visible: &mut usize) -> String {
        let Some(prediction) = self.predictions.last() else {
            return String::new();
        };
        let total_points = prediction.total_points();
        let winning_index = prediction.winning_outcome_index();

        let outcome_text = |index: usize, show_graph: bool, visible: &mut usize| {
            let outcome = &prediction.outcomes[index];
            let number = if Some(index) == winning_index {
                "✅".to_string()
            } else {
                keycap_number(index + 1)
            };
            let title = truncate_chars(&outcome.title, MAX_OUTCOME_TITLE_LEN);
            let mut text = format!("\n{number} <b>{}</b>", escape_html(&title));
            *visible += number.chars().count() + title.chars().count() + 2;

            if total_points == 0 {
                return text;
            }
            let proportion = outcome.total_points as f64 / total_points as f64;
            let share = format!("{}%", (proportion * 100.0).round());
            let betting = betting_info(proportion, outcome, true);
            text.push_str(&format!("\n<b>{share}</b> {betting}"));
            *visible += share.chars().count() + betting.chars().count() + 2;

            if show_graph {
                let cells = ((proportion * PROPORTION_BAR_CELLS).round() as usize).max(1);
                text.push_str(&format!("\n{}", "‾".repeat(cells)));
                *visible += cells + 1;
            }
            text
        };

        let mut text = String::new();
        let recap_full_board = matches!(
            prediction.status,
            PredictionStatus::Active | PredictionStatus::Locked
        ) || (matches!(
            prediction.status,
            PredictionStatus::ResolvePending | PredictionStatus::Resolved
        ) && !prediction.has_been_active_or_locked);

        if recap_full_board {
            for index in 0..prediction.outcomes.len().min(MAX_RENDERED_OUTCOMES) {
                if index == 0 && total_points > 0 {
                    text.push('\n');
                    *visible += 1;
                }
                text.push_str(&outcome_text(index, true, visible));
            }
            if let Some(winner) = winning_index {
                if winner >= MAX_RENDERED_OUTCOMES {
                    text.push_str(&outcome_text(winner, true, visible));
                }
            }
        } else if matches!(
            prediction.status,
            PredictionStatus::ResolvePending | PredictionStatus::Resolved
        ) {
            if let Some(winner) = winning_index {
                text.push_str(&outcome_text(winner, false, visible));
            }
        }
        text
    }

    fn archived_prediction_text(&self, index: usize, visible_budget_left: usize) -> Option<(String, usize)> {
        let prediction = &self.predictions[index];
        let mut extra = 8usize; // separator line + newline
        let separator = if index + 2 == self.predictions.len() {
            "\n───────"
        } else {
            "\n<tg-spoiler>―――――――</tg-spoiler>"
        };
        let mut text = separator.to_string();

        let when = time_ago(prediction.timestamp);
        let heading = match prediction.status {
            PredictionStatus::Active | PredictionStatus::Locked => {
                format!("Prediction started ({when})")
            }
            PredictionStatus::ResolvePending | PredictionStatus::Resolved => {
                format!("Prediction result ({when})")
            }
            PredictionStatus::Canceled => format!("Prediction canceled ({when})"),
        };
        text.push_str(&format!("\n<tg-spoiler>{}</tg-spoiler>", escape_html(&heading)));
        extra += heading.chars().count() + 1;

        let title = truncate_chars(&prediction.title, MAX_PREDICTION_TITLE_LEN);
        text.push_str(&format!("\n<tg-spoiler>{}</tg-spoiler>", escape_html(&title)));
        extra += title.chars().count() + 1;

        let total_points = prediction.total_points();
        let winning_index = prediction.winning_outcome_index();
        let outcome_text = |index: usize, show_betting_data: bool, extra: &mut usize| {
            let outcome = &prediction.outcomes[index];
            let number = if Some(index) == winning_index {
                format!("✓[{}]", index + 1)
            } else {
                format!("[{}]", index + 1)
            };
            let title = truncate_chars(&outcome.title, MAX_OUTCOME_TITLE_LEN);
            let mut text = format!("\n<tg-spoiler>{number} {}</tg-spoiler>", escape_html(&title));
            *extra += number.chars().count() + title.chars().count() + 2;

            if total_points == 0 || !show_betting_data {
                return text;
            }
            let proportion = outcome.total_points as f64 / total_points as f64;
            let share = format!("{}%", (proportion * 100.0).round());
            let betting = betting_info(proportion, outcome, false);
            text.push_str(&format!("\n<tg-spoiler>{share} | {betting}</tg-spoiler>"));
            *extra += share.chars().count() + betting.chars().count() + 4;
            text
        };

        match prediction.status {
            PredictionStatus::Active | PredictionStatus::Locked => {
                for i in 0..prediction.outcomes.len().min(MAX_RENDERED_OUTCOMES) {
                    text.push_str(&outcome_text(i, false, &mut extra));
                }
            }
            PredictionStatus::ResolvePending | PredictionStatus::Resolved => {
                if prediction.has_been_active_or_locked {
                    if let Some(winner) = winning_index {
                        text.push_str(&outcome_text(winner, true, &mut extra));
                    }
                } else {
                    for i in 0..prediction.outcomes.len().min(MAX_RENDERED_OUTCOMES) {
                        text.push_str(&outcome_text(i, Some(i) == winning_index, &mut extra));
                    }
                    if let Some(winner) = winning_index {
                        if winner >= MAX_RENDERED_OUTCOMES {
                            text.push_str(&outcome_text(winner, true, &mut extra));
                        }
                    }
                }
            }
            PredictionStatus::Canceled => {}
        }

        if extra > visible_budget_left {
            return None;
        }
        Some((text, extra))
    }
}

impl OutboundMessage for PredictionMessage {
    fn kind(&self) -> MessageKind {
        MessageKind::Prediction
    }

    fn render(&mut self) -> RenderedMessage {
        if self.predictions.is_empty() {
            return RenderedMessage {
                text: String::new(),
                has_text_changed: false,
                disable_web_page_preview: true,
            };
        }

        let mut visible = 0usize;
        let mut text = self.notification_title_text(&mut visible);
        text.push_str(&self.prediction_title_text(&mut visible));
        text.push_str(&self.outcomes_text(&mut visible));

        for index in (0..self.predictions.len().saturating_sub(1)).rev() {
            let budget_left = (MAX_TEXT_MESSAGE_LENGTH - 1).saturating_sub(visible);
            match self.archived_prediction_text(index, budget_left) {
                Some((entry, extra)) => {
                    text.push_str(&entry);
                    visible += extra;
                }
                None => break,
            }
        }

        let channel = &self.observer.channel;
        let newest = &self.predictions[self.predictions.len() - 1];
        let is_preview_required = newest.status != PredictionStatus::Canceled;
        let has_live_preview = is_preview_required && channel.is_preview_available();
        if has_live_preview {
            let refresh = match &self.preview {
                None => true,
                Some(cached) => {
                    cached.fetched_at.elapsed() > PREVIEW_REFRESH_AFTER
                        && (cached.prediction_id != newest.id || cached.status != newest.status)
                }
            };
            if refresh {
                self.preview = Some(CachedPreview {
                    url: channel.cached_preview_url(),
                    fetched_at: Instant::now(),
                    prediction_id: newest.id.clone(),
                    status: newest.status,
                });
            }
            if let Some(cached) = &self.preview {
                text = format!("<a href=\"{}\">\u{200e}</a>{text}", cached.url);
            }
        }

        let has_text_changed = self.tracker.update(&text);
        RenderedMessage {
            text,
            has_text_changed,
            disable_web_page_preview: !has_live_preview,
        }
    }
}

/// Wager summary of one outcome: total points staked, payout ratio, bettors.
fn betting_info(
    proportion: f64,
    outcome: &crate::twitch::PredictionOutcome,
    use_emoji: bool,
) -> String {
    let total_points = compact_number(outcome.total_points as f64, 1);
    let payout = if proportion > 0.0 {
        format!("1:{}", compact_number((100.0 / proportion).round() / 100.0, 2))
    } else {
        "-:-".to_string()
    };
    let total_users = compact_number(outcome.total_users as f64, 1);
    if use_emoji {
        format!("💰{total_points} 🏆{payout} 👥{total_users}")
    } else {
        format!("{total_points} | {payout} | {total_users} bettors")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twitch::{ChannelState, MonitoredChannel, PredictionOutcome, UserProfile};

    fn observer() -> Arc<ChannelObserver> {
        let profile = UserProfile {
            login: "streamer".into(),
            name: Some("Streamer".into()),
            emoji: None,
        };
        let channel = MonitoredChannel::new(&profile);
        channel.set_initial_state(ChannelState {
            is_live: true,
            title: "t".into(),
            category_id: "1".into(),
            category_name: "c".into(),
        });
        ChannelObserver::new(channel, &profile)
    }

    fn prediction(status: PredictionStatus, totals: &[u64]) -> Prediction {
        Prediction {
            timestamp: Utc::now(),
            id: "p1".into(),
            created_at: Utc::now(),
            status,
            prediction_window_secs: 600,
            title: "who wins the run?".into(),
            outcomes: totals
                .iter()
                .enumerate()
                .map(|(i, points)| PredictionOutcome {
                    id: format!("o{i}"),
                    title: format!("outcome {i}"),
                    total_points: *points,
                    total_users: *points / 10,
                })
                .collect(),
            winning_outcome_id: None,
            has_been_active_or_locked: true,
        }
    }

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

    #[test]
    fn active_prediction_renders_countdown_and_outcomes() {
        let mut message = PredictionMessage::new(
            observer(),
            true,
            vec![prediction(PredictionStatus::Active, &[300, 100])],
        );
        let rendered = message.render();
        assert!(rendered.text.contains("[Streamer] Prediction started"));
        assert!(rendered.text.contains("⏳"));
        assert!(rendered.text.contains("10:00"));
        assert!(rendered.text.contains("who wins the run?"));
        assert!(rendered.text.contains("<b>75%</b>"));
        assert!(rendered.text.contains("💰300"));
        assert!(rendered.text.contains("🏆1:1.33"));
    }

    #[test]
    fn resolved_after_live_wager_shows_winner_only() {
        let mut resolved = prediction(PredictionStatus::Resolved, &[300, 100]);
        resolved.winning_outcome_id = Some("o1".into());
        let mut message = PredictionMessage::new(observer(), false, vec![resolved]);
        let rendered = message.render();
        assert!(rendered.text.contains("Prediction result"));
        assert!(rendered.text.contains("✅"));
        assert!(rendered.text.contains("outcome 1"));
        assert!(!rendered.text.contains("outcome 0"));
    }

    #[test]
    fn merge_status_collapses_active_tick() {
        let mut message = PredictionMessage::new(
            observer(),
            false,
            vec![prediction(PredictionStatus::Active, &[100])],
        );
        let mut batch = vec![prediction(PredictionStatus::Locked, &[150])];
        assert!(message.merge_status(&mut batch));
        assert!(batch.is_empty());
        assert_eq!(message.predictions.len(), 1);
        assert_eq!(message.predictions[0].status, PredictionStatus::Locked);
    }

    #[test]
    fn merge_status_rejects_unrelated_predictions() {
        let mut message = PredictionMessage::new(
            observer(),
            false,
            vec![prediction(PredictionStatus::Resolved, &[100])],
        );
        let mut batch = vec![prediction(PredictionStatus::Active, &[1])];
        assert!(!message.merge_status(&mut batch));
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn archived_predictions_stay_within_budget() {
        let mut predictions = Vec::new();
        for i in 0..60 {
            let mut p = prediction(PredictionStatus::Active, &[100, 50, 25]);
            p.id = format!("p{i}");
            p.title = format!("prediction {i} {}", "y".repeat(120));
            predictions.push(p);
        }
        let mut message = PredictionMessage::new(observer(), true, predictions);
        let rendered = message.render();
        assert!(visible_len(&rendered.text) <= MAX_TEXT_MESSAGE_LENGTH);
        assert!(rendered.text.contains("prediction 59"));
        assert!(!rendered.text.contains("prediction 0 "));
    }

    #[test]
    fn empty_message_renders_nothing() {
        let mut message = PredictionMessage::new(observer(), false, Vec::new());
        let rendered = message.render();
        assert!(rendered.text.is_empty());
        assert!(!rendered.has_text_changed);
    }
}
