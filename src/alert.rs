//! Operator alert side-channel.
//!
//! Every degraded-path failure in the pipeline is reported here: it always
//! lands in the log, and when an operator chat is configured it is also
//! forwarded there best-effort. A failed forward is only logged — alerts
//! must never create more failing outbound work.

use crate::telegram::{MessageTransport, SendOptions};
use std::sync::Arc;
use tracing::{debug, warn};

/// Telegram's plain-text message cap; forwarded alerts are cut to fit.
const MAX_ALERT_LEN: usize = 4096;

struct AlertSink {
    transport: Arc<dyn MessageTransport>,
    chat_id: String,
    prefix: String,
}

/// Cheap-to-clone handle for raising operator alerts.
#[derive(Clone, Default)]
pub struct Alerter {
    sink: Option<Arc<AlertSink>>,
}

impl Alerter {
    /// An alerter that only logs.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// An alerter that logs and forwards to an operator chat. `prefix`
    /// identifies the sending deployment in the forwarded text.
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        chat_id: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            sink: Some(Arc::new(AlertSink {
                transport,
                chat_id: chat_id.into(),
                prefix: prefix.into(),
            })),
        }
    }

    /// Raise an alert. Returns immediately; any forwarding happens in the
    /// background.
    pub fn alert(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");

        let Some(sink) = self.sink.clone() else {
            return;
        };
        tokio::spawn(async move {
            // The transport always sends HTML; escape so an alert carrying
            // markup-looking content cannot be rejected by the parser.
            let mut text = crate::util::escape_html(&format!("[{}] {}", sink.prefix, message));
            if text.chars().count() > MAX_ALERT_LEN {
                text = text.chars().take(MAX_ALERT_LEN).collect();
            }
            let options = SendOptions {
                disable_web_page_preview: true,
            };
            if let Err(err) = sink
                .transport
                .send_message(&sink.chat_id, &text, &options)
                .await
            {
                debug!("failed to forward alert to operator chat: {err}");
            }
        });
    }
}
