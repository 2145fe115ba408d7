#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

//! `StreamHerald` — live-stream state notifications for Telegram.
//!
//! Watches Twitch channels for live/offline transitions, title and category
//! changes, channel-points predictions and chat from selected users, and
//! relays them to Telegram chats. The pipeline coalesces event bursts into
//! single messages, edits in-flight messages instead of re-sending where the
//! destination allows it, keeps every message under Telegram's character
//! budget, and paces outbound calls through layered rate limiters plus an
//! adaptive flow-control delay for chat relays.

pub mod alert;
pub mod config;
pub mod notifier;
pub mod telegram;
pub mod twitch;
pub mod util;

pub use alert::Alerter;
pub use config::Config;
pub use notifier::{ChatFeed, Notifier, UpstreamEvent};
