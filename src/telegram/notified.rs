//! Per-destination notification pipeline: coalescing drain loops, message
//! slots, the chat buffer, and adaptive send-flow control.
//!
//! Every (channel, kind) pairing gets one unbounded queue and one consumer
//! task. The consumer merges whatever is queued into the current message
//! slot as long as that slot has not rendered its final text yet; once it
//! has, the consumer waits for the in-flight call, then either starts a new
//! slot (the send was confirmed with a message id) or re-merges into the
//! same slot and retries (it was not). This guarantees at most one in-flight
//! send per slot and that buffered events are never lost to a failed send.

use super::message::{
    ChatBatchMessage, ChatBuffer, MessageKind, OutboundMessage, PredictionMessage,
    StateUpdateMessage,
};
use super::observer::{ChannelObserver, PendingPredictions, PendingUpdates, StateBatch};
use super::throttle::Throttler;
use super::{MessageTransport, SendOptions};
use crate::alert::Alerter;
use crate::config::{NotificationOptions, PacingConfig};
use crate::twitch::channel::{ChatSubscriber, StateUpdateSubscriber};
use crate::twitch::{ChannelUpdate, ChatMessage, MonitoredChannel, Prediction, UserProfile};
use crate::util::linear_y_from_x;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How long a background preview refresh keeps polling the CDN.
const PREVIEW_FETCH_TIMEOUT: Duration = Duration::from_secs(20);

/// Sliding-window pacing state for chat sends.
///
/// Purely observational: it watches the gaps between outbound calls and,
/// when the trailing average drops below a threshold, asks for an extra
/// delay interpolated between the configured minimum and maximum.
struct FlowControl {
    target_interval: Duration,
    min_interval: Duration,
    max_interval: Duration,
    window: usize,
    intervals: VecDeque<Duration>,
    last_sent_at: Option<Instant>,
}

impl FlowControl {
    fn new(pacing: &PacingConfig) -> Self {
        Self {
            target_interval: Duration::from_millis(pacing.flow_target_interval_ms),
            min_interval: Duration::from_millis(pacing.flow_min_interval_ms),
            max_interval: Duration::from_millis(pacing.flow_max_interval_ms),
            window: pacing.flow_window,
            intervals: VecDeque::new(),
            last_sent_at: None,
        }
    }

    /// Record one outbound call.
    fn record_send(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_sent_at {
            self.intervals.push_back(now.duration_since(last));
            if self.intervals.len() > self.window {
                self.intervals.pop_front();
            }
        }
        self.last_sent_at = Some(now);
    }

    /// Extra delay to apply before the next chat send, if any.
    fn required_delay(&self) -> Option<Duration> {
        if self.intervals.len() < self.window {
            return None;
        }
        let last_sent_at = self.last_sent_at?;

        let average_ms = self
            .intervals
            .iter()
            .map(|d| d.as_millis() as f64)
            .sum::<f64>()
            / self.intervals.len() as f64;
        let min_ms = self.min_interval.as_millis() as f64;
        let max_ms = self.max_interval.as_millis() as f64;
        let threshold_ms = 2.0 * self.target_interval.as_millis() as f64 - min_ms;
        if average_ms >= threshold_ms {
            return None;
        }

        let correction_ms =
            linear_y_from_x((min_ms, max_ms), (threshold_ms, min_ms), average_ms).round();
        let correction = Duration::from_millis(correction_ms.max(0.0) as u64);
        let since_last = last_sent_at.elapsed();
        (since_last < correction).then(|| correction - since_last)
    }
}

/// Lifecycle state of one outbound message, shared between the drain loop
/// and its in-flight send task. `render_started` lives under the same mutex
/// as the renderer so the merge-or-wait decision is atomic with rendering.
struct SlotState<M> {
    message: M,
    render_started: bool,
    message_id: Option<i64>,
}

impl<M> SlotState<M> {
    fn new(message: M) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            message,
            render_started: false,
            message_id: None,
        }))
    }
}

/// One message slot: its shared state, the in-flight task (taken once
/// awaited), and whether the last issued call was an edit.
struct Slot<M> {
    state: Arc<Mutex<SlotState<M>>>,
    task: Option<JoinHandle<()>>,
    is_edit: bool,
}

impl<M> Slot<M> {
    async fn wait_in_flight(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn is_confirmed(&self) -> bool {
        self.state.lock().message_id.is_some()
    }
}

/// A Telegram chat receiving notifications about one or more channels.
pub struct NotifiedChannel {
    chat_id: String,
    chat_name: String,
    transport: Arc<dyn MessageTransport>,
    throttler: Arc<Throttler>,
    alerter: Alerter,
    emotes: Arc<HashMap<String, String>>,
    active_status_cooldown: Duration,
    chat_buffer_max_chars: usize,
    observers: Mutex<Vec<Arc<ChannelObserver>>>,
    chat_tx: mpsc::UnboundedSender<ChatMessage>,
    flow: Mutex<FlowControl>,
}

impl NotifiedChannel {
    pub fn new(
        chat_id: impl Into<String>,
        chat_name: Option<String>,
        transport: Arc<dyn MessageTransport>,
        throttler: Arc<Throttler>,
        emotes: Arc<HashMap<String, String>>,
        pacing: &PacingConfig,
        alerter: Alerter,
    ) -> Arc<Self> {
        let (chat_tx, chat_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            chat_id: chat_id.into(),
            chat_name: chat_name.unwrap_or_default(),
            transport,
            throttler,
            alerter,
            emotes,
            active_status_cooldown: pacing.active_status_cooldown(),
            chat_buffer_max_chars: pacing.chat_buffer_max_chars,
            observers: Mutex::new(Vec::new()),
            chat_tx,
            flow: Mutex::new(FlowControl::new(pacing)),
        });
        tokio::spawn(Arc::clone(&channel).run_chat_loop(chat_rx));
        channel
    }

    /// Register one channel subscription: wires the fan-out senders into the
    /// channel and spawns the per-kind drain loops.
    pub fn subscribe_channel(
        self: &Arc<Self>,
        channel: &Arc<MonitoredChannel>,
        profile: &UserProfile,
        options: &NotificationOptions,
        chatter_profiles: HashMap<String, UserProfile>,
    ) {
        let observer = ChannelObserver::new(Arc::clone(channel), profile);
        self.observers.lock().push(Arc::clone(&observer));

        let (tx, rx) = mpsc::unbounded_channel();
        channel.add_state_update_subscriber(StateUpdateSubscriber {
            tx,
            options: options.clone(),
        });
        tokio::spawn(Arc::clone(self).run_state_loop(Arc::clone(&observer), rx));

        if options.notifies_predictions {
            let (tx, rx) = mpsc::unbounded_channel();
            channel.add_prediction_subscriber(tx, self.active_status_cooldown);
            tokio::spawn(Arc::clone(self).run_prediction_loop(observer, rx));
        }

        if !chatter_profiles.is_empty() {
            channel.add_chat_subscriber(ChatSubscriber {
                tx: self.chat_tx.clone(),
                channel_profile: profile.clone(),
                chatter_profiles,
            });
        }
    }

    /// Channel names are shown only once a destination watches several
    /// channels; a single-channel destination already knows who it is about.
    fn shows_channel_name(&self) -> bool {
        self.observers.lock().len() >= 2
    }

    fn delivery_metadata(&self) -> String {
        format!(
            "chat_id: {} / chat: {} / bot: {}",
            self.chat_id,
            self.chat_name,
            self.transport.bot_name()
        )
    }

    // ── State updates ────────────────────────────────────────────────────

    async fn run_state_loop(
        self: Arc<Self>,
        observer: Arc<ChannelObserver>,
        mut rx: mpsc::UnboundedReceiver<ChannelUpdate>,
    ) {
        let mut pending = PendingUpdates::default();
        let mut slot: Option<Slot<StateUpdateMessage>> = None;
        while let Some(update) = rx.recv().await {
            pending.push(update);
            while let Ok(update) = rx.try_recv() {
                pending.push(update);
            }
            while let Some(batch) = pending.take() {
                self.deliver_state_batch(&observer, &mut slot, batch).await;
                while let Ok(update) = rx.try_recv() {
                    pending.push(update);
                }
            }
        }
    }

    async fn deliver_state_batch(
        self: &Arc<Self>,
        observer: &Arc<ChannelObserver>,
        slot: &mut Option<Slot<StateUpdateMessage>>,
        batch: StateBatch,
    ) {
        let Some(current) = slot.as_mut() else {
            *slot = Some(self.start_state_slot(observer, batch));
            return;
        };

        {
            let mut state = current.state.lock();
            if !state.render_started {
                // Final text not rendered yet: fold the batch straight into
                // the pending message, no extra outbound call needed.
                state.message.absorb(batch);
                return;
            }
        }

        current.wait_in_flight().await;
        if current.is_confirmed() {
            // The previous message exists at the destination; queued content
            // starts a fresh one.
            *slot = Some(self.start_state_slot(observer, batch));
        } else {
            // Never confirmed: merge and retry against the same slot so
            // nothing is lost.
            {
                let mut state = current.state.lock();
                state.message.absorb(batch);
                state.render_started = false;
            }
            current.task = Some(self.spawn_send(
                Arc::clone(&current.state),
                MessageKind::StateUpdate,
            ));
        }
    }

    fn start_state_slot(
        self: &Arc<Self>,
        observer: &Arc<ChannelObserver>,
        batch: StateBatch,
    ) -> Slot<StateUpdateMessage> {
        let message =
            StateUpdateMessage::new(Arc::clone(observer), self.shows_channel_name(), batch);
        let state = SlotState::new(message);
        let send = self.spawn_send(Arc::clone(&state), MessageKind::StateUpdate);

        // After a confirmed send, chase the live preview if the renderer
        // wanted one but none was available yet.
        let task = tokio::spawn({
            let this = Arc::clone(self);
            let observer = Arc::clone(observer);
            let state = Arc::clone(&state);
            async move {
                let _ = send.await;
                let wants_preview = {
                    let slot_state = state.lock();
                    slot_state.message_id.is_some()
                        && slot_state
                            .message
                            .prev_metadata
                            .as_ref()
                            .is_some_and(|meta| meta.is_live_preview_update_required)
                };
                if wants_preview {
                    this.update_live_preview(&observer, &state);
                }
            }
        });

        Slot {
            state,
            task: Some(task),
            is_edit: false,
        }
    }

    /// Start a cancellable background fetch of the live preview image; when
    /// it lands, embed it and edit the already-sent message.
    fn update_live_preview(
        self: &Arc<Self>,
        observer: &Arc<ChannelObserver>,
        state: &Arc<Mutex<SlotState<StateUpdateMessage>>>,
    ) {
        let token = observer.restart_preview_retry();
        let this = Arc::clone(self);
        let channel = Arc::clone(&observer.channel);
        let state = Arc::clone(state);
        tokio::spawn(async move {
            let image = channel
                .try_get_preview_image(PREVIEW_FETCH_TIMEOUT, &token)
                .await;
            let Some(image) = image else { return };
            if token.is_cancelled() {
                return;
            }
            state.lock().message.live_preview_image_url = Some(image.url);
            // A plain refresh edit: does not mark the slot as rendered, so
            // pending merges keep their cheap path.
            let _ = this.spawn_edit(state, MessageKind::StateUpdate, false);
        });
    }

    // ── Predictions ──────────────────────────────────────────────────────

    async fn run_prediction_loop(
        self: Arc<Self>,
        observer: Arc<ChannelObserver>,
        mut rx: mpsc::UnboundedReceiver<Prediction>,
    ) {
        let mut pending = PendingPredictions::default();
        let mut slot: Option<Slot<PredictionMessage>> = None;
        while let Some(prediction) = rx.recv().await {
            pending.push(prediction);
            while let Ok(prediction) = rx.try_recv() {
                pending.push(prediction);
            }
            while let Some(batch) = pending.take() {
                self.deliver_predictions(&observer, &mut slot, batch).await;
                while let Ok(prediction) = rx.try_recv() {
                    pending.push(prediction);
                }
            }
        }
    }

    async fn deliver_predictions(
        self: &Arc<Self>,
        observer: &Arc<ChannelObserver>,
        slot: &mut Option<Slot<PredictionMessage>>,
        mut batch: Vec<Prediction>,
    ) {
        let Some(mut current) = slot.take() else {
            *slot = Some(self.start_prediction_slot(observer, batch));
            return;
        };

        {
            let mut state = current.state.lock();
            if !state.render_started {
                if current.is_edit {
                    // The pending edit has not rendered yet: a mergeable
                    // status upgrade rides along with it for free.
                    state.message.merge_status(&mut batch);
                    drop(state);
                    if batch.is_empty() {
                        *slot = Some(current);
                    } else {
                        *slot = Some(self.start_prediction_slot(observer, batch));
                    }
                } else {
                    state.message.absorb(&mut batch);
                    drop(state);
                    *slot = Some(current);
                }
                return;
            }
        }

        if !current.is_edit {
            current.wait_in_flight().await;
        }

        if current.is_confirmed() {
            let merged = current.state.lock().message.merge_status(&mut batch);
            if merged {
                // Upgrade the already-visible message in place.
                current.state.lock().render_started = false;
                current.task = Some(self.spawn_edit(
                    Arc::clone(&current.state),
                    MessageKind::Prediction,
                    true,
                ));
                current.is_edit = true;
            }
            if batch.is_empty() {
                *slot = Some(current);
            } else {
                // Whatever could not merge becomes a fresh message; an
                // in-flight edit of the old one finishes on its own.
                *slot = Some(self.start_prediction_slot(observer, batch));
            }
        } else {
            {
                let mut state = current.state.lock();
                state.message.absorb(&mut batch);
                state.render_started = false;
            }
            current.task =
                Some(self.spawn_send(Arc::clone(&current.state), MessageKind::Prediction));
            current.is_edit = false;
            *slot = Some(current);
        }
    }

    fn start_prediction_slot(
        self: &Arc<Self>,
        observer: &Arc<ChannelObserver>,
        batch: Vec<Prediction>,
    ) -> Slot<PredictionMessage> {
        let message =
            PredictionMessage::new(Arc::clone(observer), self.shows_channel_name(), batch);
        let state = SlotState::new(message);
        let task = self.spawn_send(Arc::clone(&state), MessageKind::Prediction);
        Slot {
            state,
            task: Some(task),
            is_edit: false,
        }
    }

    // ── Chat ─────────────────────────────────────────────────────────────

    async fn run_chat_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ChatMessage>) {
        let mut buffer = ChatBuffer::new(self.chat_buffer_max_chars);
        let mut slot: Option<Slot<ChatBatchMessage>> = None;
        while let Some(message) = rx.recv().await {
            buffer.push(message);
            while let Ok(message) = rx.try_recv() {
                buffer.push(message);
            }
            while !buffer.is_empty() {
                let mut batch = buffer.take();
                self.deliver_chat(&mut slot, &mut batch).await;
                while let Ok(message) = rx.try_recv() {
                    buffer.push(message);
                }
                // Leftover lines the renderer could not fit go back in,
                // ahead of anything that arrived meanwhile.
                buffer.prepend(batch);
            }
        }
    }

    async fn deliver_chat(
        self: &Arc<Self>,
        slot: &mut Option<Slot<ChatBatchMessage>>,
        batch: &mut ChatBuffer,
    ) {
        let Some(current) = slot.as_mut() else {
            *slot = Some(self.start_chat_slot(batch));
            return;
        };

        {
            let mut state = current.state.lock();
            if !state.render_started {
                state.message.add_chat_messages(batch);
                if batch.is_empty() {
                    return;
                }
                // The batch did not fully fit; fall through and wait so the
                // drain loop cannot spin on an over-full buffer.
            }
        }

        current.wait_in_flight().await;
        if current.is_confirmed() {
            *slot = Some(self.start_chat_slot(batch));
        } else {
            {
                let mut state = current.state.lock();
                state.message.force_add_chat_messages(batch);
                state.render_started = false;
            }
            current.task =
                Some(self.spawn_send(Arc::clone(&current.state), MessageKind::Chat));
        }
    }

    fn start_chat_slot(self: &Arc<Self>, batch: &mut ChatBuffer) -> Slot<ChatBatchMessage> {
        let message =
            ChatBatchMessage::new(batch, self.shows_channel_name(), Arc::clone(&self.emotes));
        let state = SlotState::new(message);
        let task = self.spawn_send(Arc::clone(&state), MessageKind::Chat);
        Slot {
            state,
            task: Some(task),
            is_edit: false,
        }
    }

    // ── Outbound calls ───────────────────────────────────────────────────

    fn record_send_interval(&self) {
        self.flow.lock().record_send();
    }

    /// Apply the adaptive flow-control delay for chat sends.
    async fn delay_for_flow_control(&self) {
        let delay = self.flow.lock().required_delay();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Spawn the send task for a slot: acquire the throttler, render the
    /// final text (marking the slot), and send. A failure leaves the slot
    /// unconfirmed and is reported through the alerter.
    fn spawn_send<M>(
        self: &Arc<Self>,
        state: Arc<Mutex<SlotState<M>>>,
        kind: MessageKind,
    ) -> JoinHandle<()>
    where
        M: OutboundMessage + 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let permit = this.throttler.acquire().await;
            if kind == MessageKind::Chat {
                this.delay_for_flow_control().await;
            }

            let rendered = {
                let mut slot_state = state.lock();
                slot_state.render_started = true;
                slot_state.message.render()
            };
            if rendered.text.is_empty() {
                this.alerter.alert(format!(
                    "rendered {} message text is empty ({})",
                    kind.label(),
                    this.delivery_metadata()
                ));
                return;
            }

            this.record_send_interval();
            let options = SendOptions {
                disable_web_page_preview: rendered.disable_web_page_preview,
            };
            match this
                .transport
                .send_message(&this.chat_id, &rendered.text, &options)
                .await
            {
                Ok(message_id) => {
                    state.lock().message_id = Some(message_id);
                }
                Err(err) => {
                    this.alerter.alert(format!(
                        "failed to send {} message ({}): {err:#}",
                        kind.label(),
                        this.delivery_metadata()
                    ));
                }
            }
            drop(permit);
        })
    }

    /// Spawn an edit task for an already-confirmed slot. Skips the call
    /// outright when the re-render produced identical text.
    fn spawn_edit<M>(
        self: &Arc<Self>,
        state: Arc<Mutex<SlotState<M>>>,
        kind: MessageKind,
        mark_render_started: bool,
    ) -> JoinHandle<()>
    where
        M: OutboundMessage + 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let message_id = state.lock().message_id;
            let Some(message_id) = message_id else {
                return;
            };

            let permit = this.throttler.acquire().await;
            let rendered = {
                let mut slot_state = state.lock();
                if mark_render_started {
                    slot_state.render_started = true;
                }
                slot_state.message.render()
            };
            if rendered.text.is_empty() {
                this.alerter.alert(format!(
                    "rendered {} message text is empty ({})",
                    kind.label(),
                    this.delivery_metadata()
                ));
                return;
            }
            if !rendered.has_text_changed {
                return;
            }

            this.record_send_interval();
            let options = SendOptions {
                disable_web_page_preview: rendered.disable_web_page_preview,
            };
            if let Err(err) = this
                .transport
                .edit_message(&this.chat_id, message_id, &rendered.text, &options)
                .await
            {
                this.alerter.alert(format!(
                    "failed to edit {} message ({}): {err:#}",
                    kind.label(),
                    this.delivery_metadata()
                ));
            }
            drop(permit);
        })
    }
}
