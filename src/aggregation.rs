//! Folds a refill's event history into a point-in-time snapshot.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::models::{artifact_id, CanonicalEvent, EventCategory, EventDetails, EventType, PaStatus};
use crate::store::KeyedStore;

pub const SNAPSHOT_VERSION: &str = "snapshot-v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStage {
    Initiated,
    Eligible,
    PaPending,
    PaApproved,
    PaDenied,
    Bundled,
    OosDetected,
    Shipped,
    Completed,
    Cancelled,
}

impl SnapshotStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStage::Initiated => "initiated",
            SnapshotStage::Eligible => "eligible",
            SnapshotStage::PaPending => "pa_pending",
            SnapshotStage::PaApproved => "pa_approved",
            SnapshotStage::PaDenied => "pa_denied",
            SnapshotStage::Bundled => "bundled",
            SnapshotStage::OosDetected => "oos_detected",
            SnapshotStage::Shipped => "shipped",
            SnapshotStage::Completed => "completed",
            SnapshotStage::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SnapshotStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleTimingState {
    Aligned,
    Early,
    Late,
    Misaligned,
    Unknown,
}

impl BundleTimingState {
    pub fn from_alignment(score: Option<f64>) -> Self {
        match score {
            None => BundleTimingState::Unknown,
            Some(score) if score >= 0.8 => BundleTimingState::Aligned,
            Some(score) if score >= 0.6 => BundleTimingState::Early,
            Some(score) if score >= 0.4 => BundleTimingState::Late,
            Some(_) => BundleTimingState::Misaligned,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounts {
    pub total: u32,
    pub refill: u32,
    pub pa: u32,
    pub oos: u32,
    pub bundle: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimestamps {
    pub initiated_at: Option<DateTime<Utc>>,
    pub eligible_at: Option<DateTime<Utc>>,
    pub pa_submitted_at: Option<DateTime<Utc>>,
    pub pa_resolved_at: Option<DateTime<Utc>>,
    pub bundled_at: Option<DateTime<Utc>>,
    pub oos_detected_at: Option<DateTime<Utc>>,
    pub oos_resolved_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl StageTimestamps {
    /// When the refill entered `stage`, if known.
    pub fn entered(&self, stage: SnapshotStage) -> Option<DateTime<Utc>> {
        match stage {
            SnapshotStage::Initiated => self.initiated_at,
            SnapshotStage::Eligible => self.eligible_at,
            SnapshotStage::PaPending => self.pa_submitted_at,
            SnapshotStage::PaApproved | SnapshotStage::PaDenied => self.pa_resolved_at,
            SnapshotStage::Bundled => self.bundled_at,
            SnapshotStage::OosDetected => self.oos_detected_at,
            SnapshotStage::Shipped => self.shipped_at,
            SnapshotStage::Completed => self.completed_at,
            SnapshotStage::Cancelled => self.cancelled_at,
        }
    }

    fn oos_unresolved(&self) -> bool {
        match (self.oos_detected_at, self.oos_resolved_at) {
            (Some(detected), Some(resolved)) => resolved < detected,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefillSnapshot {
    pub snapshot_id: String,
    pub member_id: String,
    pub refill_id: String,
    pub bundle_id: Option<String>,
    pub as_of: DateTime<Utc>,

    pub current_stage: SnapshotStage,
    pub pa_state: PaStatus,
    pub bundle_timing: BundleTimingState,

    pub drug_ndc: Option<String>,
    pub drug_name: Option<String>,
    pub days_supply: Option<u32>,
    pub quantity: Option<f64>,
    pub refill_due_date: Option<DateTime<Utc>>,
    pub ship_by_date: Option<DateTime<Utc>>,
    pub last_fill_date: Option<DateTime<Utc>>,
    pub bundle_alignment_score: Option<f64>,
    pub pa_type: Option<String>,
    pub pa_processing_days: Option<u32>,
    pub oos_reason: Option<String>,
    pub bundle_type: Option<String>,
    pub bundle_sequence: Option<u32>,
    pub bundle_member_count: Option<u32>,
    pub bundle_refill_count: Option<u32>,
    pub latest_status: Option<String>,

    pub counts: EventCounts,
    pub earliest_event: DateTime<Utc>,
    pub latest_event: DateTime<Utc>,
    pub stages: StageTimestamps,

    pub days_until_due: Option<i64>,
    pub days_since_last_fill: Option<i64>,
    pub total_processing_days: i64,
    pub days_in_current_stage: i64,

    pub event_ids: Vec<String>,
    pub correlation_id: Option<String>,
    pub version: String,
}

fn overwrite<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
    if value.is_some() {
        slot.clone_from(value);
    }
}

/// Fold `events` for a single refill into a snapshot evaluated at `as_of`.
///
/// Events are stably sorted by timestamp, so ties keep the order given.
pub fn fold_events(events: &[CanonicalEvent], as_of: DateTime<Utc>) -> Result<RefillSnapshot> {
    let mut ordered: Vec<&CanonicalEvent> = events.iter().collect();
    ordered.sort_by_key(|event| event.event_timestamp);

    let (first, last) = match (ordered.first(), ordered.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => return Err(PipelineError::EmptyEventSequence),
    };
    if let Some(stray) = ordered.iter().find(|event| event.refill_id != first.refill_id) {
        return Err(PipelineError::SnapshotMismatch {
            snapshot_refill_id: first.refill_id.clone(),
            event_refill_id: stray.refill_id.clone(),
        });
    }

    let mut snapshot = RefillSnapshot {
        snapshot_id: String::new(),
        member_id: first.member_id.clone(),
        refill_id: first.refill_id.clone(),
        bundle_id: None,
        as_of,
        current_stage: SnapshotStage::Initiated,
        pa_state: PaStatus::NotRequired,
        bundle_timing: BundleTimingState::Unknown,
        drug_ndc: None,
        drug_name: None,
        days_supply: None,
        quantity: None,
        refill_due_date: None,
        ship_by_date: None,
        last_fill_date: None,
        bundle_alignment_score: None,
        pa_type: None,
        pa_processing_days: None,
        oos_reason: None,
        bundle_type: None,
        bundle_sequence: None,
        bundle_member_count: None,
        bundle_refill_count: None,
        latest_status: None,
        counts: EventCounts::default(),
        earliest_event: first.event_timestamp,
        latest_event: last.event_timestamp,
        stages: StageTimestamps::default(),
        days_until_due: None,
        days_since_last_fill: None,
        total_processing_days: 0,
        days_in_current_stage: 0,
        event_ids: Vec::with_capacity(ordered.len()),
        correlation_id: None,
        version: SNAPSHOT_VERSION.to_string(),
    };

    for event in &ordered {
        apply_event(&mut snapshot, event);
    }

    snapshot.current_stage = current_stage(&snapshot);
    snapshot.bundle_timing = BundleTimingState::from_alignment(snapshot.bundle_alignment_score);
    compute_timing(&mut snapshot);

    let as_of_text = as_of.to_rfc3339();
    let mut parts: Vec<&str> = vec![snapshot.refill_id.as_str(), as_of_text.as_str()];
    parts.extend(snapshot.event_ids.iter().map(String::as_str));
    let snapshot_id = artifact_id("snapshot", &parts).to_string();
    snapshot.snapshot_id = snapshot_id;

    Ok(snapshot)
}

fn apply_event(snapshot: &mut RefillSnapshot, event: &CanonicalEvent) {
    let at = event.event_timestamp;
    snapshot.counts.total += 1;
    snapshot.event_ids.push(event.event_id.clone());
    overwrite(&mut snapshot.bundle_id, &event.bundle_id);
    overwrite(&mut snapshot.bundle_sequence, &event.bundle_sequence);
    overwrite(&mut snapshot.bundle_member_count, &event.bundle_member_count);
    overwrite(&mut snapshot.bundle_refill_count, &event.bundle_refill_count);
    overwrite(&mut snapshot.latest_status, &event.canonical_status);
    if snapshot.correlation_id.is_none() {
        snapshot.correlation_id.clone_from(&event.correlation_id);
    }

    match event.event_type.category() {
        EventCategory::Refill => snapshot.counts.refill += 1,
        EventCategory::PriorAuth => snapshot.counts.pa += 1,
        EventCategory::OutOfStock => snapshot.counts.oos += 1,
        EventCategory::Bundle => snapshot.counts.bundle += 1,
    }

    match &event.details {
        EventDetails::Refill(details) => {
            overwrite(&mut snapshot.drug_ndc, &details.drug_ndc);
            overwrite(&mut snapshot.drug_name, &details.drug_name);
            overwrite(&mut snapshot.days_supply, &details.days_supply);
            overwrite(&mut snapshot.quantity, &details.quantity);
            overwrite(&mut snapshot.refill_due_date, &details.refill_due_date);
            overwrite(&mut snapshot.ship_by_date, &details.ship_by_date);
            overwrite(&mut snapshot.last_fill_date, &details.last_fill_date);
            overwrite(&mut snapshot.bundle_alignment_score, &details.bundle_alignment_score);
        }
        EventDetails::PriorAuth(details) => {
            snapshot.pa_state = details.pa_status;
            overwrite(&mut snapshot.pa_type, &details.pa_type);
            overwrite(&mut snapshot.pa_processing_days, &details.pa_processing_days);
        }
        EventDetails::OutOfStock(details) => {
            overwrite(&mut snapshot.oos_reason, &details.oos_reason);
        }
        EventDetails::Bundle(details) => {
            overwrite(&mut snapshot.bundle_type, &details.bundle_type);
        }
    }

    let stages = &mut snapshot.stages;
    match event.event_type {
        EventType::RefillInitiated => stages.initiated_at = Some(at),
        EventType::RefillEligible => stages.eligible_at = Some(at),
        EventType::RefillBundled | EventType::BundleFormed => stages.bundled_at = Some(at),
        EventType::RefillShipped | EventType::BundleShipped => stages.shipped_at = Some(at),
        EventType::RefillCompleted => stages.completed_at = Some(at),
        EventType::RefillCancelled => stages.cancelled_at = Some(at),
        EventType::PaSubmitted => stages.pa_submitted_at = Some(at),
        EventType::PaApproved | EventType::PaDenied | EventType::PaExpired => {
            stages.pa_resolved_at = Some(at)
        }
        EventType::OosDetected => stages.oos_detected_at = Some(at),
        EventType::OosResolved => stages.oos_resolved_at = Some(at),
        EventType::BundleSplit => {}
    }
}

fn current_stage(snapshot: &RefillSnapshot) -> SnapshotStage {
    let stages = &snapshot.stages;
    if stages.completed_at.is_some() {
        SnapshotStage::Completed
    } else if stages.shipped_at.is_some() {
        SnapshotStage::Shipped
    } else if stages.oos_unresolved() {
        SnapshotStage::OosDetected
    } else if stages.bundled_at.is_some() {
        SnapshotStage::Bundled
    } else if stages.cancelled_at.is_some() {
        SnapshotStage::Cancelled
    } else {
        match snapshot.pa_state {
            PaStatus::Denied | PaStatus::Expired => SnapshotStage::PaDenied,
            PaStatus::Approved => SnapshotStage::PaApproved,
            PaStatus::Submitted | PaStatus::InReview => SnapshotStage::PaPending,
            PaStatus::NotRequired if stages.eligible_at.is_some() => SnapshotStage::Eligible,
            PaStatus::NotRequired => SnapshotStage::Initiated,
        }
    }
}

fn compute_timing(snapshot: &mut RefillSnapshot) {
    let as_of = snapshot.as_of;
    let today = as_of.date_naive();
    snapshot.days_until_due = snapshot
        .refill_due_date
        .map(|due| (due.date_naive() - today).num_days());
    snapshot.days_since_last_fill = snapshot
        .last_fill_date
        .map(|filled| (today - filled.date_naive()).num_days());

    let started = snapshot.stages.initiated_at.unwrap_or(snapshot.earliest_event);
    snapshot.total_processing_days = (as_of - started).num_days().max(0);

    let entered = snapshot
        .stages
        .entered(snapshot.current_stage)
        .unwrap_or(snapshot.earliest_event);
    snapshot.days_in_current_stage = (as_of - entered).num_days().max(0);
}

#[derive(Debug, Default)]
struct RefillLog {
    events: Vec<CanonicalEvent>,
    history: Vec<String>,
}

impl RefillLog {
    fn absorb(&mut self, events: &[CanonicalEvent]) {
        for event in events {
            if !self.events.iter().any(|known| known.event_id == event.event_id) {
                self.events.push(event.clone());
            }
        }
    }
}

/// Owns the per-refill event logs and every snapshot built from them.
#[derive(Default)]
pub struct SnapshotAggregator {
    logs: KeyedStore<String, RefillLog>,
    snapshots: KeyedStore<String, RefillSnapshot>,
}

impl SnapshotAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a refill's event history, record it and return the new snapshot.
    /// Events already known for the refill are not duplicated.
    pub fn aggregate(
        &self,
        events: &[CanonicalEvent],
        as_of: DateTime<Utc>,
    ) -> Result<RefillSnapshot> {
        let probe = fold_events(events, as_of)?;
        let snapshot = self.logs.with_entry(&probe.refill_id, RefillLog::default, |log| {
            log.absorb(events);
            let snapshot = fold_events(&log.events, as_of)?;
            if log.history.last() != Some(&snapshot.snapshot_id) {
                log.history.push(snapshot.snapshot_id.clone());
            }
            Ok::<_, PipelineError>(snapshot)
        })?;
        self.store(&snapshot);
        Ok(snapshot)
    }

    /// Fold one more event into the refill behind `snapshot_id`.
    ///
    /// An event that the snapshot already contains returns it unchanged.
    /// Otherwise the result supersedes the old snapshot, which stays readable.
    pub fn update(
        &self,
        snapshot_id: &str,
        event: &CanonicalEvent,
        as_of: DateTime<Utc>,
    ) -> Result<RefillSnapshot> {
        let existing = self
            .snapshots
            .get(&snapshot_id.to_string())
            .ok_or_else(|| PipelineError::SnapshotNotFound(snapshot_id.to_string()))?;
        if existing.refill_id != event.refill_id {
            return Err(PipelineError::SnapshotMismatch {
                snapshot_refill_id: existing.refill_id,
                event_refill_id: event.refill_id.clone(),
            });
        }
        if existing.event_ids.contains(&event.event_id) {
            debug!(snapshot_id, event_id = %event.event_id, "event already folded");
            return Ok(existing);
        }

        let snapshot = self.logs.with_entry(&existing.refill_id, RefillLog::default, |log| {
            log.absorb(std::slice::from_ref(event));
            let snapshot = fold_events(&log.events, as_of)?;
            if log.history.last() != Some(&snapshot.snapshot_id) {
                log.history.push(snapshot.snapshot_id.clone());
            }
            Ok::<_, PipelineError>(snapshot)
        })?;
        self.store(&snapshot);
        debug!(
            superseded = snapshot_id,
            snapshot_id = %snapshot.snapshot_id,
            stage = %snapshot.current_stage,
            "snapshot updated"
        );
        Ok(snapshot)
    }

    fn store(&self, snapshot: &RefillSnapshot) {
        self.snapshots.with_entry(
            &snapshot.snapshot_id,
            || snapshot.clone(),
            |stored| stored.clone_from(snapshot),
        );
    }

    pub fn get(&self, snapshot_id: &str) -> Option<RefillSnapshot> {
        self.snapshots.get(&snapshot_id.to_string())
    }

    pub fn latest_for_refill(&self, refill_id: &str) -> Option<RefillSnapshot> {
        let latest = self
            .logs
            .with_existing(&refill_id.to_string(), |log| log.history.last().cloned())
            .flatten()?;
        self.get(&latest)
    }

    /// Snapshot ids recorded for a refill, oldest first.
    pub fn history(&self, refill_id: &str) -> Vec<String> {
        self.logs
            .with_existing(&refill_id.to_string(), |log| log.history.clone())
            .unwrap_or_default()
    }

    fn latest_where(&self, keep: impl Fn(&RefillSnapshot) -> bool) -> Vec<RefillSnapshot> {
        let mut refill_ids = self.logs.keys();
        refill_ids.sort();
        refill_ids
            .iter()
            .filter_map(|refill_id| self.latest_for_refill(refill_id))
            .filter(|snapshot| keep(snapshot))
            .collect()
    }

    /// Latest snapshot of every refill carrying `bundle_id`, ordered by refill id.
    pub fn snapshots_for_bundle(&self, bundle_id: &str) -> Vec<RefillSnapshot> {
        self.latest_where(|snapshot| snapshot.bundle_id.as_deref() == Some(bundle_id))
    }

    pub fn snapshots_for_member(&self, member_id: &str) -> Vec<RefillSnapshot> {
        self.latest_where(|snapshot| snapshot.member_id == member_id)
    }

    /// The events a snapshot was built from, in fold order.
    pub fn events_for(&self, snapshot_id: &str) -> Result<Vec<CanonicalEvent>> {
        let snapshot = self
            .get(snapshot_id)
            .ok_or_else(|| PipelineError::SnapshotNotFound(snapshot_id.to_string()))?;
        let by_id: BTreeMap<String, CanonicalEvent> = self
            .logs
            .with_existing(&snapshot.refill_id, |log| {
                log.events
                    .iter()
                    .map(|event| (event.event_id.clone(), event.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(snapshot
            .event_ids
            .iter()
            .filter_map(|event_id| by_id.get(event_id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BundleDetails, PriorAuthDetails, RefillDetails};
    use chrono::{Duration, TimeZone};

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 9, 0, 0).unwrap() + Duration::days(n)
    }

    fn event(id: &str, event_type: EventType, at: DateTime<Utc>) -> CanonicalEvent {
        let details = match event_type.category() {
            EventCategory::Refill => EventDetails::Refill(RefillDetails::default()),
            EventCategory::PriorAuth => EventDetails::PriorAuth(PriorAuthDetails {
                pa_status: match event_type {
                    EventType::PaApproved => PaStatus::Approved,
                    EventType::PaDenied => PaStatus::Denied,
                    _ => PaStatus::Submitted,
                },
                pa_type: None,
                pa_processing_days: None,
                pa_expiry_date: None,
            }),
            EventCategory::OutOfStock => EventDetails::OutOfStock(Default::default()),
            EventCategory::Bundle => EventDetails::Bundle(BundleDetails::default()),
        };
        CanonicalEvent {
            event_id: id.to_string(),
            event_type,
            source_system: "centersync".to_string(),
            member_id: "M00000001".to_string(),
            refill_id: "R00000001".to_string(),
            bundle_id: Some("B00000001".to_string()),
            event_timestamp: at,
            received_timestamp: at,
            correlation_id: None,
            causation_id: None,
            bundle_sequence: None,
            bundle_member_count: None,
            bundle_refill_count: None,
            canonical_status: None,
            source_status: None,
            details,
        }
    }

    fn bundled_history() -> Vec<CanonicalEvent> {
        vec![
            event("E00000001", EventType::RefillInitiated, day(0)),
            event("E00000002", EventType::RefillEligible, day(1)),
            event("E00000003", EventType::BundleFormed, day(2)),
        ]
    }

    #[test]
    fn initiated_eligible_bundled_history_lands_in_bundled() {
        let snapshot = fold_events(&bundled_history(), day(4)).unwrap();
        assert_eq!(snapshot.current_stage, SnapshotStage::Bundled);
        assert_eq!(snapshot.counts.refill, 2);
        assert_eq!(snapshot.counts.bundle, 1);
        assert_eq!(snapshot.counts.pa, 0);
        assert_eq!(snapshot.counts.oos, 0);
        assert_eq!(snapshot.pa_state, PaStatus::NotRequired);
        assert_eq!(snapshot.days_in_current_stage, 2);
        assert_eq!(snapshot.total_processing_days, 4);
        assert_eq!(snapshot.bundle_timing, BundleTimingState::Unknown);
    }

    #[test]
    fn folding_is_independent_of_input_order() {
        let history = bundled_history();
        let mut shuffled = history.clone();
        shuffled.reverse();
        assert_eq!(
            fold_events(&history, day(4)).unwrap(),
            fold_events(&shuffled, day(4)).unwrap()
        );
    }

    #[test]
    fn same_timestamp_keeps_arrival_order() {
        let mut first = event("E00000001", EventType::RefillInitiated, day(0));
        first.canonical_status = Some("pending".to_string());
        let mut second = event("E00000002", EventType::RefillInitiated, day(0));
        second.canonical_status = Some("eligible".to_string());
        let snapshot = fold_events(&[first, second], day(1)).unwrap();
        assert_eq!(snapshot.latest_status.as_deref(), Some("eligible"));
        assert_eq!(snapshot.event_ids, vec!["E00000001", "E00000002"]);
    }

    #[test]
    fn stage_cascade_prefers_terminal_and_open_oos_states() {
        let mut history = bundled_history();
        history.push(event("E00000004", EventType::OosDetected, day(3)));
        let snapshot = fold_events(&history, day(4)).unwrap();
        assert_eq!(snapshot.current_stage, SnapshotStage::OosDetected);

        history.push(event("E00000005", EventType::OosResolved, day(4)));
        let snapshot = fold_events(&history, day(4)).unwrap();
        assert_eq!(snapshot.current_stage, SnapshotStage::Bundled);

        let pa_history = vec![
            event("E00000001", EventType::RefillInitiated, day(0)),
            event("E00000002", EventType::PaSubmitted, day(1)),
            event("E00000003", EventType::PaDenied, day(2)),
        ];
        let snapshot = fold_events(&pa_history, day(3)).unwrap();
        assert_eq!(snapshot.current_stage, SnapshotStage::PaDenied);
        assert_eq!(snapshot.pa_state, PaStatus::Denied);
    }

    #[test]
    fn timing_fields_are_relative_to_the_evaluation_instant() {
        let mut initiated = event("E00000001", EventType::RefillInitiated, day(0));
        initiated.details = EventDetails::Refill(RefillDetails {
            refill_due_date: Some(day(10)),
            last_fill_date: Some(day(-20)),
            bundle_alignment_score: Some(0.65),
            ..RefillDetails::default()
        });
        let snapshot = fold_events(&[initiated], day(3)).unwrap();
        assert_eq!(snapshot.days_until_due, Some(7));
        assert_eq!(snapshot.days_since_last_fill, Some(23));
        assert_eq!(snapshot.bundle_timing, BundleTimingState::Early);
    }

    #[test]
    fn empty_and_mixed_refill_inputs_are_rejected() {
        assert_eq!(fold_events(&[], day(0)), Err(PipelineError::EmptyEventSequence));
        let mut other = event("E00000002", EventType::RefillEligible, day(1));
        other.refill_id = "R00000002".to_string();
        let mixed = vec![event("E00000001", EventType::RefillInitiated, day(0)), other];
        assert!(matches!(
            fold_events(&mixed, day(2)),
            Err(PipelineError::SnapshotMismatch { .. })
        ));
    }

    #[test]
    fn update_supersedes_without_double_counting() {
        let aggregator = SnapshotAggregator::new();
        let history = bundled_history();
        let first = aggregator.aggregate(&history[..2], day(4)).unwrap();
        assert_eq!(first.current_stage, SnapshotStage::Eligible);

        let second = aggregator.update(&first.snapshot_id, &history[2], day(4)).unwrap();
        assert_eq!(second.current_stage, SnapshotStage::Bundled);
        assert_ne!(second.snapshot_id, first.snapshot_id);
        assert_eq!(second, fold_events(&history, day(4)).unwrap());

        let again = aggregator.update(&second.snapshot_id, &history[2], day(4)).unwrap();
        assert_eq!(again, second);
        assert_eq!(again.counts.total, 3);

        assert!(aggregator.get(&first.snapshot_id).is_some());
        assert_eq!(aggregator.history("R00000001").len(), 2);
        assert_eq!(
            aggregator.latest_for_refill("R00000001").map(|s| s.snapshot_id),
            Some(second.snapshot_id.clone())
        );
        assert_eq!(aggregator.snapshots_for_bundle("B00000001").len(), 1);
        assert_eq!(aggregator.snapshots_for_member("M00000001").len(), 1);
        assert_eq!(aggregator.events_for(&second.snapshot_id).unwrap().len(), 3);
    }

    #[test]
    fn replaying_against_a_superseded_snapshot_keeps_history_unique() {
        let aggregator = SnapshotAggregator::new();
        let history = bundled_history();
        let first = aggregator.aggregate(&history[..2], day(4)).unwrap();
        let second = aggregator.update(&first.snapshot_id, &history[2], day(4)).unwrap();

        let replayed = aggregator.update(&first.snapshot_id, &history[2], day(4)).unwrap();
        assert_eq!(replayed, second);
        assert_eq!(
            aggregator.history("R00000001"),
            vec![first.snapshot_id.clone(), second.snapshot_id.clone()]
        );
        assert_eq!(aggregator.events_for(&second.snapshot_id).unwrap().len(), 3);
    }

    #[test]
    fn update_rejects_unknown_snapshots_and_foreign_refills() {
        let aggregator = SnapshotAggregator::new();
        let snapshot = aggregator.aggregate(&bundled_history(), day(4)).unwrap();
        let mut foreign = event("E00000009", EventType::RefillShipped, day(5));
        foreign.refill_id = "R00000002".to_string();
        assert!(matches!(
            aggregator.update(&snapshot.snapshot_id, &foreign, day(5)),
            Err(PipelineError::SnapshotMismatch { .. })
        ));
        assert!(matches!(
            aggregator.update("missing-snapshot", &foreign, day(5)),
            Err(PipelineError::SnapshotNotFound(_))
        ));
    }
}
