//! Bounded chat-line buffering and the chat relay renderer.
//!
//! Chat lines queue in a [`ChatBuffer`] capped by total raw text length
//! (oldest lines evicted first). The renderer consumes lines from the front
//! into consecutive-same-speaker blocks until the message budget is hit;
//! whatever it could not fit stays in the buffer for the next message.

use super::{MessageKind, OutboundMessage, RenderedMessage, RenderedText, TextChangeTracker};
use crate::telegram::MAX_TEXT_MESSAGE_LENGTH;
use crate::twitch::{ChatMessage, MessagePart};
use crate::util::{escape_html, truncate_chars};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Pending chat lines for one destination, bounded by total text length.
pub struct ChatBuffer {
    max_total_text_len: usize,
    messages: VecDeque<ChatMessage>,
    total_text_len: usize,
}

impl ChatBuffer {
    pub fn new(max_total_text_len: usize) -> Self {
        Self {
            max_total_text_len,
            messages: VecDeque::new(),
            total_text_len: 0,
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.total_text_len += message.text.chars().count();
        self.messages.push_back(message);
        self.evict();
    }

    /// Evict oldest lines until the tracked total is back under the cap.
    fn evict(&mut self) {
        while self.total_text_len > self.max_total_text_len {
            let Some(oldest) = self.messages.pop_front() else {
                self.total_text_len = 0;
                break;
            };
            self.total_text_len = self
                .total_text_len
                .saturating_sub(oldest.text.chars().count());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn total_text_len(&self) -> usize {
        self.total_text_len
    }

    /// Move the whole buffered content out, leaving this buffer empty.
    pub fn take(&mut self) -> ChatBuffer {
        ChatBuffer {
            max_total_text_len: self.max_total_text_len,
            messages: std::mem::take(&mut self.messages),
            total_text_len: std::mem::replace(&mut self.total_text_len, 0),
        }
    }

    /// Re-queue leftover lines ahead of anything that arrived meanwhile,
    /// then re-apply the cap. Preserves arrival order and never duplicates.
    pub fn prepend(&mut self, earlier: ChatBuffer) {
        self.total_text_len += earlier.total_text_len;
        for message in earlier.messages.into_iter().rev() {
            self.messages.push_front(message);
        }
        self.evict();
    }

    /// Drop `count` lines from the front, adjusting the tracked total. Used
    /// by the renderer after it consumed them into a message.
    fn consume_front(&mut self, count: usize) {
        for _ in 0..count {
            if let Some(consumed) = self.messages.pop_front() {
                self.total_text_len = self
                    .total_text_len
                    .saturating_sub(consumed.text.chars().count());
            }
        }
    }
}

/// Consecutive lines from one speaker in one channel, sharing a header.
struct ChatBlock {
    chatter_login: String,
    channel_login: String,
    header: RenderedText,
    contents: Vec<RenderedText>,
    raw_len: usize,
}

impl ChatBlock {
    fn new(message: &ChatMessage, header: RenderedText, content: RenderedText) -> Self {
        let raw_len = header.raw_len + content.raw_len;
        Self {
            chatter_login: message.chatter.login.clone(),
            channel_login: message.channel.login.clone(),
            header,
            contents: vec![content],
            raw_len,
        }
    }

    fn is_appendable(&self, message: &ChatMessage) -> bool {
        self.chatter_login == message.chatter.login && self.channel_login == message.channel.login
    }

    fn append_content(&mut self, content: RenderedText) {
        if !self.contents.is_empty() {
            self.raw_len += 1; // newline between contents
        }
        self.raw_len += content.raw_len;
        self.contents.push(content);
    }
}

/// Renderer batching chat lines into one outbound message.
pub struct ChatBatchMessage {
    show_channel_name: bool,
    emotes: Arc<HashMap<String, String>>,
    blocks: Vec<ChatBlock>,
    /// Visible characters accumulated so far (markup excluded).
    total_raw_len: usize,
    tracker: TextChangeTracker,
}

impl ChatBatchMessage {
    pub fn new(
        buffer: &mut ChatBuffer,
        show_channel_name: bool,
        emotes: Arc<HashMap<String, String>>,
    ) -> Self {
        let mut message = Self {
            show_channel_name,
            emotes,
            blocks: Vec::new(),
            total_raw_len: 0,
            tracker: TextChangeTracker::default(),
        };
        message.add_chat_messages(buffer);
        message
    }

    /// Consume lines from the buffer front while they fit the budget.
    pub fn add_chat_messages(&mut self, buffer: &mut ChatBuffer) {
        let mut added = 0usize;
        for message in &buffer.messages {
            let mut addition = 0usize;
            let appendable = self
                .blocks
                .last()
                .is_some_and(|block| block.is_appendable(message));

            let header = if appendable {
                addition += 1; // newline between contents
                None
            } else {
                let header = self.render_header(message);
                addition += header.raw_len;
                if !self.blocks.is_empty() {
                    addition += 2; // blank line between blocks
                }
                Some(header)
            };

            let mut content = self.render_content(message, None);
            // A single line larger than the whole message budget can only
            // ever ship truncated.
            if self.blocks.is_empty() && addition + content.raw_len > MAX_TEXT_MESSAGE_LENGTH {
                content =
                    self.render_content(message, Some(MAX_TEXT_MESSAGE_LENGTH - addition));
            }
            addition += content.raw_len;

            if self.total_raw_len + addition > MAX_TEXT_MESSAGE_LENGTH {
                break;
            }

            match header {
                Some(header) => self.blocks.push(ChatBlock::new(message, header, content)),
                None => {
                    if let Some(last) = self.blocks.last_mut() {
                        last.append_content(content);
                    }
                }
            }
            self.total_raw_len += addition;
            added += 1;
        }
        buffer.consume_front(added);
    }

    /// Rebuild around a fresh batch after an unconfirmed send: new lines
    /// first claim the budget, then as many of the previously accumulated
    /// blocks as still fit are kept (newest first) ahead of them.
    pub fn force_add_chat_messages(&mut self, buffer: &mut ChatBuffer) {
        let prev_blocks = std::mem::take(&mut self.blocks);
        let mut prev_total = std::mem::replace(&mut self.total_raw_len, 0);
        self.add_chat_messages(buffer);

        if prev_blocks.is_empty() {
            return;
        }
        if !self.blocks.is_empty() {
            prev_total += 2; // blank line joining old and new blocks
        }

        let mut removed = 0usize;
        for block in &prev_blocks {
            if self.total_raw_len + prev_total <= MAX_TEXT_MESSAGE_LENGTH {
                break;
            }
            prev_total = prev_total.saturating_sub(block.raw_len + 2);
            removed += 1;
        }
        self.total_raw_len += prev_total;

        let mut blocks: Vec<ChatBlock> = prev_blocks.into_iter().skip(removed).collect();
        blocks.append(&mut self.blocks);
        self.blocks = blocks;
    }

    fn render_header(&self, message: &ChatMessage) -> RenderedText {
        let is_self_chat = message.chatter.login == message.channel.login;
        let chatter_info = format!(
            "{}{}",
            message.chatter.display_name(),
            message.chatter.emoji.as_deref().unwrap_or("")
        );
        let channel_info = if self.show_channel_name && !is_self_chat {
            format!(" → {}", message.channel.display_name())
        } else {
            String::new()
        };

        let text = format!("<b>{}</b>: ", escape_html(&format!("{chatter_info}{channel_info}")));
        let raw_len = chatter_info.chars().count() + channel_info.chars().count() + 2; // ": "
        RenderedText { text, raw_len }
    }

    /// Render the parsed parts of one line, replacing known emotes with
    /// their configured alt text and italicizing unknown emote names.
    /// Adjacent runs with the same styling collapse into one entity to stay
    /// under the destination's per-message entity limit.
    fn render_content(&self, message: &ChatMessage, length_limit: Option<usize>) -> RenderedText {
        let mut raw_len = 0usize;
        let mut groups: Vec<(bool, String)> = Vec::new();

        for part in &message.parts {
            let (mut text, is_italic) = match part {
                MessagePart::Text { text } => {
                    let inherits_italic = text.trim().is_empty()
                        && groups.last().is_some_and(|(italic, _)| *italic);
                    (text.clone(), inherits_italic)
                }
                MessagePart::Emote { name } => match self.emotes.get(name) {
                    Some(alt) => (alt.clone(), false),
                    None => (name.clone(), true),
                },
            };

            if let Some(limit) = length_limit {
                if raw_len + text.chars().count() > limit {
                    if !matches!(part, MessagePart::Text { .. }) {
                        break;
                    }
                    text = truncate_chars(&text, limit - raw_len);
                }
            }
            raw_len += text.chars().count();

            match groups.last_mut() {
                Some((italic, existing)) if *italic == is_italic => existing.push_str(&text),
                _ => groups.push((is_italic, text)),
            }

            if length_limit == Some(raw_len) {
                break;
            }
        }

        let text = groups
            .into_iter()
            .map(|(italic, text)| {
                if italic {
                    format!("<i>{}</i>", escape_html(&text))
                } else {
                    escape_html(&text)
                }
            })
            .collect();
        RenderedText { text, raw_len }
    }

    #[cfg(test)]
    fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

impl OutboundMessage for ChatBatchMessage {
    fn kind(&self) -> MessageKind {
        MessageKind::Chat
    }

    fn render(&mut self) -> RenderedMessage {
        let text: String = self
            .blocks
            .iter()
            .enumerate()
            .map(|(i, block)| {
                let mut text = String::new();
                if i > 0 {
                    text.push_str("\n\n");
                }
                text.push_str(&block.header.text);
                for (j, content) in block.contents.iter().enumerate() {
                    if j > 0 {
                        text.push('\n');
                    }
                    text.push_str(&content.text);
                }
                text
            })
            .collect();

        let has_text_changed = self.tracker.update(&text);
        RenderedMessage {
            text,
            has_text_changed,
            disable_web_page_preview: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twitch::UserProfile;

    fn chat_line(chatter: &str, text: &str) -> ChatMessage {
        ChatMessage {
            channel: UserProfile::from_login("streamer"),
            chatter: UserProfile::from_login(chatter),
            text: text.to_string(),
            parts: vec![MessagePart::Text {
                text: text.to_string(),
            }],
        }
    }

    fn emotes() -> Arc<HashMap<String, String>> {
        Arc::new(HashMap::from([(
            "FrogHype".to_string(),
            "🐸".to_string(),
        )]))
    }

    #[test]
    fn buffer_evicts_oldest_lines_beyond_cap() {
        let mut buffer = ChatBuffer::new(10);
        buffer.push(chat_line("alice", "aaaa"));
        buffer.push(chat_line("alice", "bbbb"));
        buffer.push(chat_line("alice", "cccc"));

        assert!(buffer.total_text_len() <= 10);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.messages.front().unwrap().text, "bbbb");
    }

    #[test]
    fn prepend_preserves_order_and_reapplies_cap() {
        let mut buffer = ChatBuffer::new(100);
        buffer.push(chat_line("alice", "one"));
        let leftovers = buffer.take();
        buffer.push(chat_line("alice", "two"));
        buffer.prepend(leftovers);

        let texts: Vec<&str> = buffer.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["one", "two"]);
        assert_eq!(buffer.total_text_len(), 6);
    }

    #[test]
    fn consecutive_same_speaker_lines_share_one_block() {
        let mut buffer = ChatBuffer::new(1_000_000);
        for i in 0..5 {
            buffer.push(chat_line("alice", &format!("line {i}")));
        }
        let mut message = ChatBatchMessage::new(&mut buffer, false, emotes());
        assert_eq!(message.block_count(), 1);
        assert!(buffer.is_empty());

        let rendered = message.render();
        assert_eq!(rendered.text.matches("<b>alice</b>: ").count(), 1);
        assert_eq!(rendered.text.matches('\n').count(), 4);
    }

    #[test]
    fn speaker_change_starts_a_new_block() {
        let mut buffer = ChatBuffer::new(1_000_000);
        buffer.push(chat_line("alice", "hello"));
        buffer.push(chat_line("bob", "hi"));
        buffer.push(chat_line("alice", "again"));

        let message = ChatBatchMessage::new(&mut buffer, false, emotes());
        assert_eq!(message.block_count(), 3);
    }

    #[test]
    fn oversized_single_line_is_truncated_with_ellipsis() {
        let mut buffer = ChatBuffer::new(1_000_000);
        buffer.push(chat_line("alice", &"x".repeat(MAX_TEXT_MESSAGE_LENGTH * 2)));

        let mut message = ChatBatchMessage::new(&mut buffer, false, emotes());
        assert!(buffer.is_empty());
        let rendered = message.render();
        assert!(rendered.text.contains('…'));
        assert!(message.total_raw_len <= MAX_TEXT_MESSAGE_LENGTH);
    }

    #[test]
    fn budget_overflow_leaves_lines_in_buffer() {
        let mut buffer = ChatBuffer::new(1_000_000);
        for i in 0..10 {
            buffer.push(chat_line("alice", &format!("{i}:{}", "z".repeat(800))));
        }
        let message = ChatBatchMessage::new(&mut buffer, false, emotes());
        assert!(message.total_raw_len <= MAX_TEXT_MESSAGE_LENGTH);
        assert!(!buffer.is_empty());
        // Remaining lines are the unconsumed tail, in order.
        assert!(buffer.messages.front().unwrap().text.starts_with("5:"));
    }

    #[test]
    fn known_emotes_use_alt_text_and_unknown_render_italic() {
        let mut buffer = ChatBuffer::new(1_000_000);
        buffer.push(ChatMessage {
            channel: UserProfile::from_login("streamer"),
            chatter: UserProfile::from_login("alice"),
            text: "FrogHype MysteryEmote".to_string(),
            parts: vec![
                MessagePart::Emote {
                    name: "FrogHype".to_string(),
                },
                MessagePart::Text {
                    text: " ".to_string(),
                },
                MessagePart::Emote {
                    name: "MysteryEmote".to_string(),
                },
            ],
        });

        let mut message = ChatBatchMessage::new(&mut buffer, false, emotes());
        let rendered = message.render();
        assert!(rendered.text.contains("🐸"));
        assert!(rendered.text.contains("<i>MysteryEmote</i>"));
    }

    #[test]
    fn channel_suffix_appears_only_for_multi_channel_relays() {
        let mut buffer = ChatBuffer::new(1_000_000);
        buffer.push(chat_line("alice", "hello"));
        let mut message = ChatBatchMessage::new(&mut buffer, true, emotes());
        assert!(message.render().text.contains("alice → streamer"));

        let mut buffer = ChatBuffer::new(1_000_000);
        buffer.push(chat_line("streamer", "hello"));
        let mut message = ChatBatchMessage::new(&mut buffer, true, emotes());
        // Self-chat never shows the channel suffix.
        assert!(!message.render().text.contains('→'));
    }

    #[test]
    fn force_add_keeps_newest_previous_blocks_within_budget() {
        let mut buffer = ChatBuffer::new(1_000_000);
        buffer.push(chat_line("alice", &format!("old:{}", "a".repeat(2000))));
        buffer.push(chat_line("bob", &format!("older:{}", "b".repeat(1500))));
        let mut message = ChatBatchMessage::new(&mut buffer, false, emotes());
        assert_eq!(message.block_count(), 2);

        buffer.push(chat_line("carol", &format!("new:{}", "c".repeat(2000))));
        message.force_add_chat_messages(&mut buffer);

        let rendered = message.render();
        assert!(message.total_raw_len <= MAX_TEXT_MESSAGE_LENGTH + 2);
        assert!(rendered.text.contains("new:"));
        // The oldest previous block was sacrificed for the fresh lines.
        assert!(!rendered.text.contains("old:"));
        assert!(rendered.text.contains("older:"));
    }
}
