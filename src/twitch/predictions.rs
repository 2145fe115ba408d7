//! Prediction reconciliation: turns the noisy snapshot feed into a strictly
//! ordered sequence of status transitions.
//!
//! The feed replays snapshots, delivers them out of order, and repeats
//! terminal states. [`reconcile_prediction`] admits a snapshot only when it
//! advances the partial order `active/locked → resolve_pending → resolved`
//! (with `canceled` reachable from any non-canceled state) relative to the
//! last accepted prediction.

use super::events::{PredictionOutcomePayload, PredictionSnapshot};
use super::{Prediction, PredictionOutcome, PredictionStatus};
use chrono::{DateTime, Utc};

/// A snapshot accepted by the reconciler.
#[derive(Debug, Clone)]
pub struct ReconciledPrediction {
    pub prediction: Prediction,
    /// True when this is an `active → active` totals refresh of the already
    /// known prediction; these are subject to the per-subscriber cooldown.
    pub is_existing_active_update: bool,
}

fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value?).ok()?;
    Some(parsed.with_timezone(&Utc))
}

/// Clamp a raw numeric field to a non-negative integer; anything missing,
/// non-finite or negative becomes zero.
fn clamp_count(value: Option<f64>) -> u64 {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => v as u64,
        _ => 0,
    }
}

fn normalize_outcomes(raw: Option<&[PredictionOutcomePayload]>) -> Vec<PredictionOutcome> {
    raw.unwrap_or_default()
        .iter()
        .map(|o| PredictionOutcome {
            id: o.id.clone().unwrap_or_default(),
            title: o.title.clone().unwrap_or_default(),
            total_points: clamp_count(o.total_points),
            total_users: clamp_count(o.total_users),
        })
        .collect()
}

/// Apply the admission rules to one raw snapshot.
///
/// `last` is the most recently accepted prediction for the channel, if any.
/// Returns `None` when the snapshot is malformed, a replay, or does not
/// advance the status state machine.
pub fn reconcile_prediction(
    snapshot: &PredictionSnapshot,
    last: Option<&Prediction>,
) -> Option<ReconciledPrediction> {
    let timestamp = parse_time(snapshot.timestamp.as_deref())?;
    let event = snapshot.event.as_ref()?;
    let id = event.id.clone().filter(|id| !id.is_empty())?;
    let created_at = parse_time(event.created_at.as_deref())?;

    // Replay / out-of-order guard: strictly older than the last accepted
    // snapshot, or a different prediction that was created before it.
    if let Some(last) = last {
        if last.timestamp > timestamp || (last.id != id && last.created_at > created_at) {
            return None;
        }
    }

    let outcomes = normalize_outcomes(event.outcomes.as_deref());
    let winning_outcome_id = event.winning_outcome_id.clone().filter(|id| !id.is_empty());
    let has_winning_outcome = winning_outcome_id
        .as_deref()
        .is_some_and(|winner| outcomes.iter().any(|o| !o.id.is_empty() && o.id == winner));

    let same_prediction = last.is_some_and(|last| last.id == id);
    let last_status = last.filter(|_| same_prediction).map(|l| l.status);

    let mut is_existing_active_update = false;
    let status = match event.status.as_deref() {
        Some("ACTIVE") => {
            if !same_prediction || last_status == Some(PredictionStatus::Active) {
                is_existing_active_update = same_prediction;
                Some(PredictionStatus::Active)
            } else {
                None
            }
        }
        Some("LOCKED") => {
            if !same_prediction || last_status == Some(PredictionStatus::Active) {
                Some(PredictionStatus::Locked)
            } else {
                None
            }
        }
        Some("RESOLVE_PENDING") => {
            let already_resolving = matches!(
                last_status,
                Some(PredictionStatus::ResolvePending | PredictionStatus::Resolved)
            );
            if has_winning_outcome && !already_resolving {
                Some(PredictionStatus::ResolvePending)
            } else {
                None
            }
        }
        Some("RESOLVED") => {
            if has_winning_outcome && last_status != Some(PredictionStatus::Resolved) {
                Some(PredictionStatus::Resolved)
            } else {
                None
            }
        }
        Some("CANCEL_PENDING" | "CANCELED") => {
            if same_prediction && last_status != Some(PredictionStatus::Canceled) {
                Some(PredictionStatus::Canceled)
            } else {
                None
            }
        }
        _ => None,
    }?;

    let has_been_active_or_locked = matches!(
        status,
        PredictionStatus::Active | PredictionStatus::Locked
    ) || (same_prediction && last.is_some_and(|l| l.has_been_active_or_locked));

    Some(ReconciledPrediction {
        prediction: Prediction {
            timestamp,
            id,
            created_at,
            status,
            prediction_window_secs: clamp_count(event.prediction_window_seconds),
            title: event.title.clone().unwrap_or_default(),
            outcomes,
            winning_outcome_id,
            has_been_active_or_locked,
        },
        is_existing_active_update,
    })
}

/// Whether `addition` may collapse into the buffered slot currently holding
/// `existing` instead of producing a separate outbound message.
///
/// True only for same-id `active → active/locked` ticks and same-id
/// `resolve_pending → resolved` upgrades.
pub fn are_predictions_mergeable(existing: &Prediction, addition: &Prediction) -> bool {
    if existing.id != addition.id {
        return false;
    }
    let active_merge = existing.status == PredictionStatus::Active
        && matches!(
            addition.status,
            PredictionStatus::Active | PredictionStatus::Locked
        );
    let resolve_merge = existing.status == PredictionStatus::ResolvePending
        && addition.status == PredictionStatus::Resolved;
    active_merge || resolve_merge
}

#[cfg(test)]
mod tests {
    use super::super::events::PredictionEventPayload;
    use super::*;

    fn snapshot(
        id: &str,
        status: &str,
        timestamp: &str,
        created_at: &str,
        winner: Option<&str>,
        outcomes: &[(&str, f64, f64)],
    ) -> PredictionSnapshot {
        PredictionSnapshot {
            timestamp: Some(timestamp.to_string()),
            event: Some(PredictionEventPayload {
                id: Some(id.to_string()),
                created_at: Some(created_at.to_string()),
                status: Some(status.to_string()),
                title: Some("who wins?".to_string()),
                prediction_window_seconds: Some(120.0),
                winning_outcome_id: winner.map(str::to_string),
                outcomes: Some(
                    outcomes
                        .iter()
                        .map(|(id, points, users)| PredictionOutcomePayload {
                            id: Some((*id).to_string()),
                            title: Some(format!("outcome {id}")),
                            total_points: Some(*points),
                            total_users: Some(*users),
                        })
                        .collect(),
                ),
            }),
        }
    }

    const T0: &str = "2026-01-01T00:00:00Z";
    const T1: &str = "2026-01-01T00:00:10Z";
    const T2: &str = "2026-01-01T00:00:20Z";

    fn active(id: &str) -> Prediction {
        reconcile_prediction(
            &snapshot(id, "ACTIVE", T0, T0, None, &[("a", 100.0, 3.0), ("b", 50.0, 2.0)]),
            None,
        )
        .unwrap()
        .prediction
    }

    #[test]
    fn malformed_snapshots_are_discarded() {
        let mut s = snapshot("p1", "ACTIVE", T0, T0, None, &[]);
        s.timestamp = None;
        assert!(reconcile_prediction(&s, None).is_none());

        let mut s = snapshot("p1", "ACTIVE", T0, T0, None, &[]);
        s.event.as_mut().unwrap().id = None;
        assert!(reconcile_prediction(&s, None).is_none());

        let mut s = snapshot("p1", "ACTIVE", T0, T0, None, &[]);
        s.event.as_mut().unwrap().created_at = Some("not a time".to_string());
        assert!(reconcile_prediction(&s, None).is_none());
    }

    #[test]
    fn stale_timestamps_are_discarded() {
        let last = reconcile_prediction(&snapshot("p1", "ACTIVE", T1, T0, None, &[]), None)
            .unwrap()
            .prediction;
        assert!(
            reconcile_prediction(&snapshot("p1", "LOCKED", T0, T0, None, &[]), Some(&last))
                .is_none()
        );
    }

    #[test]
    fn older_foreign_prediction_is_discarded() {
        let last = reconcile_prediction(&snapshot("p2", "ACTIVE", T1, T1, None, &[]), None)
            .unwrap()
            .prediction;
        // Different id, created before the one we already track.
        assert!(
            reconcile_prediction(&snapshot("p1", "ACTIVE", T2, T0, None, &[]), Some(&last))
                .is_none()
        );
    }

    #[test]
    fn active_refresh_of_same_prediction_is_flagged() {
        let last = active("p1");
        let refreshed = reconcile_prediction(
            &snapshot("p1", "ACTIVE", T1, T0, None, &[("a", 150.0, 4.0)]),
            Some(&last),
        )
        .unwrap();
        assert!(refreshed.is_existing_active_update);
        assert_eq!(refreshed.prediction.status, PredictionStatus::Active);
    }

    #[test]
    fn locked_is_rejected_once_past_active() {
        let mut last = active("p1");
        last.status = PredictionStatus::Locked;
        assert!(
            reconcile_prediction(&snapshot("p1", "LOCKED", T1, T0, None, &[]), Some(&last))
                .is_none()
        );
    }

    #[test]
    fn resolve_pending_requires_listed_winner() {
        let last = active("p1");
        // Winner id not among outcomes.
        assert!(reconcile_prediction(
            &snapshot("p1", "RESOLVE_PENDING", T1, T0, Some("z"), &[("a", 1.0, 1.0)]),
            Some(&last),
        )
        .is_none());

        let accepted = reconcile_prediction(
            &snapshot("p1", "RESOLVE_PENDING", T1, T0, Some("a"), &[("a", 1.0, 1.0)]),
            Some(&last),
        )
        .unwrap();
        assert_eq!(accepted.prediction.status, PredictionStatus::ResolvePending);
        assert!(accepted.prediction.has_been_active_or_locked);
    }

    #[test]
    fn resolved_is_not_emitted_twice() {
        let mut last = active("p1");
        last.status = PredictionStatus::Resolved;
        assert!(reconcile_prediction(
            &snapshot("p1", "RESOLVED", T1, T0, Some("a"), &[("a", 1.0, 1.0)]),
            Some(&last),
        )
        .is_none());
    }

    #[test]
    fn cancel_requires_known_prediction() {
        assert!(reconcile_prediction(&snapshot("p1", "CANCELED", T0, T0, None, &[]), None)
            .is_none());

        let last = active("p1");
        let canceled =
            reconcile_prediction(&snapshot("p1", "CANCELED", T1, T0, None, &[]), Some(&last))
                .unwrap();
        assert_eq!(canceled.prediction.status, PredictionStatus::Canceled);
    }

    #[test]
    fn unknown_status_is_discarded() {
        assert!(
            reconcile_prediction(&snapshot("p1", "SOMETHING_NEW", T0, T0, None, &[]), None)
                .is_none()
        );
    }

    #[test]
    fn status_order_never_regresses() {
        // active → resolve_pending → resolved; every later snapshot trying to
        // go back to an earlier status is rejected.
        let p_active = active("p1");
        let p_pending = reconcile_prediction(
            &snapshot("p1", "RESOLVE_PENDING", T1, T0, Some("a"), &[("a", 1.0, 1.0)]),
            Some(&p_active),
        )
        .unwrap()
        .prediction;
        assert!(reconcile_prediction(
            &snapshot("p1", "ACTIVE", T2, T0, None, &[]),
            Some(&p_pending)
        )
        .is_none());
        assert!(reconcile_prediction(
            &snapshot("p1", "LOCKED", T2, T0, None, &[]),
            Some(&p_pending)
        )
        .is_none());

        let p_resolved = reconcile_prediction(
            &snapshot("p1", "RESOLVED", T2, T0, Some("a"), &[("a", 1.0, 1.0)]),
            Some(&p_pending),
        )
        .unwrap()
        .prediction;
        assert!(reconcile_prediction(
            &snapshot("p1", "RESOLVE_PENDING", T2, T0, Some("a"), &[("a", 1.0, 1.0)]),
            Some(&p_resolved),
        )
        .is_none());
    }

    #[test]
    fn numeric_fields_are_clamped() {
        let accepted = reconcile_prediction(
            &snapshot("p1", "ACTIVE", T0, T0, None, &[("a", -5.0, f64::NAN)]),
            None,
        )
        .unwrap()
        .prediction;
        assert_eq!(accepted.outcomes[0].total_points, 0);
        assert_eq!(accepted.outcomes[0].total_users, 0);

        let mut s = snapshot("p1", "ACTIVE", T0, T0, None, &[]);
        s.event.as_mut().unwrap().prediction_window_seconds = Some(-1.0);
        assert_eq!(
            reconcile_prediction(&s, None)
                .unwrap()
                .prediction
                .prediction_window_secs,
            0
        );
    }

    #[test]
    fn mergeable_truth_table() {
        let p_active = active("p1");
        let mut p_locked = active("p1");
        p_locked.status = PredictionStatus::Locked;
        let mut p_pending = active("p1");
        p_pending.status = PredictionStatus::ResolvePending;
        let mut p_resolved = active("p1");
        p_resolved.status = PredictionStatus::Resolved;
        let mut p_canceled = active("p1");
        p_canceled.status = PredictionStatus::Canceled;
        let other = active("p2");

        assert!(are_predictions_mergeable(&p_active, &p_active));
        assert!(are_predictions_mergeable(&p_active, &p_locked));
        assert!(are_predictions_mergeable(&p_pending, &p_resolved));

        assert!(!are_predictions_mergeable(&p_active, &other));
        assert!(!are_predictions_mergeable(&p_locked, &p_pending));
        assert!(!are_predictions_mergeable(&p_pending, &p_pending));
        assert!(!are_predictions_mergeable(&p_resolved, &p_resolved));
        assert!(!are_predictions_mergeable(&p_active, &p_canceled));
        assert!(!are_predictions_mergeable(&p_active, &p_resolved));
    }
}
