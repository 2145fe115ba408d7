//! Raw upstream event payloads, mirroring the wire JSON of the source feed.
//!
//! These structs are deliberately loose — every field is optional or
//! defaulted — because the feed is noisy and partially populated payloads are
//! normal. Normalization into the strict domain model happens in
//! [`super::channel`] and [`super::predictions`].

use serde::Deserialize;

/// Broadcast settings update: new title and/or category.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BroadcastSettingsUpdate {
    /// New stream title.
    #[serde(default)]
    pub status: Option<String>,
    /// New category (game) name.
    #[serde(default)]
    pub game: Option<String>,
    /// New category (game) id; `0` means unset.
    #[serde(default)]
    pub game_id: Option<i64>,
}

/// Stream playback transition.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackUpdate {
    /// `stream-up`, `stream-down`, or an ignorable keepalive kind.
    #[serde(rename = "type")]
    pub kind: String,
}

impl PlaybackUpdate {
    pub fn is_stream_up(&self) -> bool {
        self.kind == "stream-up"
    }

    pub fn is_stream_down(&self) -> bool {
        self.kind == "stream-down"
    }
}

/// Envelope of a channel-points prediction snapshot.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PredictionSnapshot {
    /// Wall-clock timestamp of the snapshot (RFC 3339).
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub event: Option<PredictionEventPayload>,
}

/// The prediction event body carried by a snapshot.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PredictionEventPayload {
    #[serde(default)]
    pub id: Option<String>,
    /// RFC 3339 creation time of the prediction.
    #[serde(default)]
    pub created_at: Option<String>,
    /// Server status string: `ACTIVE`, `LOCKED`, `RESOLVE_PENDING`,
    /// `RESOLVED`, `CANCEL_PENDING`, `CANCELED`, or something newer.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub prediction_window_seconds: Option<f64>,
    #[serde(default)]
    pub winning_outcome_id: Option<String>,
    #[serde(default)]
    pub outcomes: Option<Vec<PredictionOutcomePayload>>,
}

/// One raw betting outcome.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PredictionOutcomePayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub total_points: Option<f64>,
    #[serde(default)]
    pub total_users: Option<f64>,
}
