//! Bundle membership tracking across the event stream.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::models::{artifact_id, CanonicalEvent, EventType};
use crate::store::KeyedStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Max distance between an unbundled event and a bundle's last activity.
    pub inference_window_hours: i64,
    /// Wider window for bundles that already hold the event's member.
    pub member_window_hours: i64,
    pub retire_after_hours: i64,
    pub aged_after_hours: i64,
    pub stale_after_hours: i64,
    pub large_member_count: usize,
    pub large_refill_count: usize,
    pub inactive_after_hours: i64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            inference_window_hours: 2,
            member_window_hours: 24,
            retire_after_hours: 168,
            aged_after_hours: 24,
            stale_after_hours: 48,
            large_member_count: 5,
            large_refill_count: 10,
            inactive_after_hours: 12,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.inference_window_hours < 0
            || self.member_window_hours < 0
            || self.retire_after_hours < 0
        {
            return Err(PipelineError::InvalidConfig(
                "detector windows must not be negative".to_string(),
            ));
        }
        if self.aged_after_hours >= self.stale_after_hours {
            return Err(PipelineError::InvalidConfig(format!(
                "aged_after_hours ({}) must be below stale_after_hours ({})",
                self.aged_after_hours, self.stale_after_hours
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleLifecycle {
    Forming,
    Active,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BundleRiskFactor {
    #[serde(rename = "bundle_age_over_24h")]
    AgedOver24h,
    #[serde(rename = "bundle_age_over_48h")]
    AgedOver48h,
    #[serde(rename = "large_bundle")]
    LargeBundle,
    #[serde(rename = "bundle_inactive_over_12h")]
    Inactive,
    #[serde(rename = "complex_bundle_type")]
    ComplexType,
}

impl BundleRiskFactor {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleRiskFactor::AgedOver24h => "bundle_age_over_24h",
            BundleRiskFactor::AgedOver48h => "bundle_age_over_48h",
            BundleRiskFactor::LargeBundle => "large_bundle",
            BundleRiskFactor::Inactive => "bundle_inactive_over_12h",
            BundleRiskFactor::ComplexType => "complex_bundle_type",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleContext {
    pub bundle_id: String,
    pub bundle_type: Option<String>,
    pub member_ids: BTreeSet<String>,
    pub refill_ids: BTreeSet<String>,
    pub formed_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub lifecycle: BundleLifecycle,
    pub inferred: bool,
    pub event_count: usize,
    pub risk_factors: BTreeSet<BundleRiskFactor>,
}

impl BundleContext {
    fn new(bundle_id: String, at: DateTime<Utc>, inferred: bool) -> Self {
        Self {
            bundle_id,
            bundle_type: inferred.then(|| "individual".to_string()),
            member_ids: BTreeSet::new(),
            refill_ids: BTreeSet::new(),
            formed_at: at,
            last_activity: at,
            lifecycle: if inferred {
                BundleLifecycle::Active
            } else {
                BundleLifecycle::Forming
            },
            inferred,
            event_count: 0,
            risk_factors: BTreeSet::new(),
        }
    }

    pub fn member_count(&self) -> usize {
        self.member_ids.len()
    }

    pub fn refill_count(&self) -> usize {
        self.refill_ids.len()
    }

    pub fn is_completed(&self) -> bool {
        self.lifecycle == BundleLifecycle::Completed
    }

    fn attach(&mut self, event: &CanonicalEvent, config: &DetectorConfig) {
        let previous_activity = (self.event_count > 0).then_some(self.last_activity);

        self.member_ids.insert(event.member_id.clone());
        self.refill_ids.insert(event.refill_id.clone());
        if let Some(bundle_type) = event.bundle_type() {
            self.bundle_type = Some(bundle_type.to_string());
        }
        self.formed_at = self.formed_at.min(event.event_timestamp);
        self.last_activity = self.last_activity.max(event.event_timestamp);
        self.event_count += 1;

        match (self.lifecycle, event.event_type) {
            (BundleLifecycle::Completed, _) => {}
            (_, EventType::BundleShipped) => self.lifecycle = BundleLifecycle::Completed,
            (BundleLifecycle::Forming, EventType::BundleFormed) => {
                self.lifecycle = BundleLifecycle::Active
            }
            (BundleLifecycle::Forming, _) if self.refill_ids.len() >= 2 => {
                self.lifecycle = BundleLifecycle::Active
            }
            _ => {}
        }

        let idle = previous_activity
            .map(|previous| event.event_timestamp - previous)
            .unwrap_or_else(Duration::zero);
        self.risk_factors = self.evaluate_risks(event.event_timestamp, idle, config);
    }

    fn evaluate_risks(
        &self,
        at: DateTime<Utc>,
        idle: Duration,
        config: &DetectorConfig,
    ) -> BTreeSet<BundleRiskFactor> {
        let mut factors = BTreeSet::new();
        let age = at - self.formed_at;
        if age > Duration::hours(config.stale_after_hours) {
            factors.insert(BundleRiskFactor::AgedOver48h);
        } else if age > Duration::hours(config.aged_after_hours) {
            factors.insert(BundleRiskFactor::AgedOver24h);
        }
        if self.member_count() > config.large_member_count
            || self.refill_count() > config.large_refill_count
        {
            factors.insert(BundleRiskFactor::LargeBundle);
        }
        if idle > Duration::hours(config.inactive_after_hours) {
            factors.insert(BundleRiskFactor::Inactive);
        }
        if self.bundle_type.as_deref() == Some("complex") {
            factors.insert(BundleRiskFactor::ComplexType);
        }
        factors
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectorStatistics {
    pub forming_bundles: usize,
    pub active_bundles: usize,
    pub completed_bundles: usize,
    pub inferred_bundles: usize,
    pub members_tracked: usize,
    pub average_bundle_size: f64,
    pub bundle_types: BTreeMap<String, usize>,
    pub risk_distribution: BTreeMap<BundleRiskFactor, usize>,
}

pub struct BundleDetector {
    config: DetectorConfig,
    contexts: KeyedStore<String, BundleContext>,
    member_bundles: KeyedStore<String, BTreeSet<String>>,
    // Serializes lookup-then-create for events without a bundle id.
    inference: Mutex<()>,
}

impl Default for BundleDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

impl BundleDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            contexts: KeyedStore::new(),
            member_bundles: KeyedStore::new(),
            inference: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Attach `event` to its bundle and return the updated context.
    pub fn resolve_bundle(&self, event: &CanonicalEvent) -> BundleContext {
        let context = match &event.bundle_id {
            Some(bundle_id) => self.contexts.with_entry(
                bundle_id,
                || BundleContext::new(bundle_id.clone(), event.event_timestamp, false),
                |context| {
                    context.attach(event, &self.config);
                    context.clone()
                },
            ),
            None => self.resolve_inferred(event),
        };

        self.member_bundles.with_entry(&event.member_id, BTreeSet::new, |bundles| {
            bundles.insert(context.bundle_id.clone());
        });

        debug!(
            event_id = %event.event_id,
            bundle_id = %context.bundle_id,
            inferred = context.inferred,
            refills = context.refill_count(),
            "bundle resolved"
        );
        context
    }

    fn resolve_inferred(&self, event: &CanonicalEvent) -> BundleContext {
        let _guard = self.inference.lock().unwrap_or_else(PoisonError::into_inner);
        let window = Duration::hours(self.config.inference_window_hours);
        let member_window = Duration::hours(self.config.member_window_hours);
        let at = event.event_timestamp;
        let open: Vec<BundleContext> = self
            .contexts
            .values()
            .into_iter()
            .filter(|context| !context.is_completed())
            .collect();

        // The member's own most recent bundle wins, then the closest bundle in time.
        let own = open
            .iter()
            .filter(|context| context.member_ids.contains(&event.member_id))
            .filter(|context| (at - context.last_activity).abs() < member_window)
            .min_by_key(|context| {
                (
                    std::cmp::Reverse(context.last_activity),
                    context.bundle_id.clone(),
                )
            });
        let candidate = own.or_else(|| {
            open.iter()
                .filter(|context| (at - context.last_activity).abs() <= window)
                .filter(|context| {
                    context.member_ids.contains(&event.member_id)
                        || context.member_count() < self.config.large_member_count
                })
                .min_by_key(|context| {
                    ((at - context.last_activity).abs(), context.bundle_id.clone())
                })
        });

        if let Some(candidate) = candidate {
            let attached = self.contexts.with_existing(&candidate.bundle_id, |context| {
                context.attach(event, &self.config);
                context.clone()
            });
            if let Some(context) = attached {
                return context;
            }
        }

        let at_text = at.to_rfc3339();
        let bundle_id = format!(
            "inferred-{}",
            artifact_id("inferred_bundle", &[event.member_id.as_str(), at_text.as_str()])
        );
        self.contexts.with_entry(
            &bundle_id,
            || BundleContext::new(bundle_id.clone(), at, true),
            |context| {
                context.attach(event, &self.config);
                context.clone()
            },
        )
    }

    pub fn get(&self, bundle_id: &str) -> Option<BundleContext> {
        self.contexts.get(&bundle_id.to_string())
    }

    /// Re-evaluate and store risk factors as of `as_of`. Inactivity is
    /// measured from the last activity to `as_of`.
    pub fn analyze_risks(
        &self,
        bundle_id: &str,
        as_of: DateTime<Utc>,
    ) -> Option<BTreeSet<BundleRiskFactor>> {
        self.contexts.with_existing(&bundle_id.to_string(), |context| {
            let idle = as_of - context.last_activity;
            context.risk_factors = context.evaluate_risks(as_of, idle, &self.config);
            context.risk_factors.clone()
        })
    }

    /// Drop completed bundles idle for longer than `max_age`. Returns how many went.
    pub fn retire_completed(&self, as_of: DateTime<Utc>, max_age: Duration) -> usize {
        let retired: Vec<BundleContext> = self
            .contexts
            .values()
            .into_iter()
            .filter(|context| context.is_completed() && as_of - context.last_activity > max_age)
            .collect();

        for context in &retired {
            self.contexts.remove(&context.bundle_id);
            for member_id in &context.member_ids {
                self.member_bundles.with_existing(member_id, |bundles| {
                    bundles.remove(&context.bundle_id);
                });
            }
        }
        if !retired.is_empty() {
            debug!(retired = retired.len(), "completed bundles retired");
        }
        retired.len()
    }

    pub fn bundles_for_member(&self, member_id: &str) -> Vec<BundleContext> {
        let ids = self
            .member_bundles
            .get(&member_id.to_string())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn contexts(&self) -> Vec<BundleContext> {
        let mut contexts = self.contexts.values();
        contexts.sort_by(|a, b| a.bundle_id.cmp(&b.bundle_id));
        contexts
    }

    pub fn statistics(&self) -> DetectorStatistics {
        let contexts = self.contexts.values();
        let mut stats = DetectorStatistics {
            members_tracked: self.member_bundles.len(),
            ..DetectorStatistics::default()
        };
        for context in &contexts {
            match context.lifecycle {
                BundleLifecycle::Forming => stats.forming_bundles += 1,
                BundleLifecycle::Active => stats.active_bundles += 1,
                BundleLifecycle::Completed => stats.completed_bundles += 1,
            }
            if context.inferred {
                stats.inferred_bundles += 1;
            }
            let bundle_type = context.bundle_type.clone().unwrap_or_else(|| "unknown".to_string());
            *stats.bundle_types.entry(bundle_type).or_insert(0) += 1;
            for factor in &context.risk_factors {
                *stats.risk_distribution.entry(*factor).or_insert(0) += 1;
            }
        }
        if !contexts.is_empty() {
            let refills: usize = contexts.iter().map(BundleContext::refill_count).sum();
            stats.average_bundle_size = refills as f64 / contexts.len() as f64;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BundleDetails, EventDetails, RefillDetails};
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap() + Duration::hours(hour as i64)
    }

    fn event(
        id: &str,
        event_type: EventType,
        member: &str,
        refill: &str,
        bundle: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> CanonicalEvent {
        let details = match event_type.category() {
            crate::models::EventCategory::Bundle => EventDetails::Bundle(BundleDetails::default()),
            _ => EventDetails::Refill(RefillDetails::default()),
        };
        CanonicalEvent {
            event_id: id.to_string(),
            event_type,
            source_system: "centersync".to_string(),
            member_id: member.to_string(),
            refill_id: refill.to_string(),
            bundle_id: bundle.map(str::to_string),
            event_timestamp: timestamp,
            received_timestamp: timestamp,
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

    #[test]
    fn explicit_bundles_form_then_activate_then_complete() {
        let detector = BundleDetector::default();
        let first = detector.resolve_bundle(&event(
            "E00000001",
            EventType::RefillInitiated,
            "M00000001",
            "R00000001",
            Some("B00000001"),
            at(0),
        ));
        assert_eq!(first.lifecycle, BundleLifecycle::Forming);
        assert!(!first.inferred);

        let second = detector.resolve_bundle(&event(
            "E00000002",
            EventType::RefillInitiated,
            "M00000001",
            "R00000002",
            Some("B00000001"),
            at(1),
        ));
        assert_eq!(second.lifecycle, BundleLifecycle::Active);
        assert_eq!(second.refill_count(), 2);

        let shipped = detector.resolve_bundle(&event(
            "E00000003",
            EventType::BundleShipped,
            "M00000001",
            "R00000001",
            Some("B00000001"),
            at(2),
        ));
        assert!(shipped.is_completed());
        assert_eq!(detector.get("B00000001").map(|c| c.event_count), Some(3));
    }

    #[test]
    fn unbundled_events_join_a_recent_bundle_of_the_same_member() {
        let detector = BundleDetector::default();
        detector.resolve_bundle(&event(
            "E00000001",
            EventType::BundleFormed,
            "M00000001",
            "R00000001",
            Some("B00000001"),
            at(10),
        ));
        let joined = detector.resolve_bundle(&event(
            "E00000002",
            EventType::RefillEligible,
            "M00000001",
            "R00000002",
            None,
            at(11),
        ));
        assert_eq!(joined.bundle_id, "B00000001");
        assert!(joined.refill_ids.contains("R00000002"));
    }

    #[test]
    fn unbundled_events_outside_the_window_get_their_own_bundle() {
        let detector = BundleDetector::default();
        detector.resolve_bundle(&event(
            "E00000001",
            EventType::BundleFormed,
            "M00000001",
            "R00000001",
            Some("B00000001"),
            at(0),
        ));
        let late = event(
            "E00000002",
            EventType::RefillEligible,
            "M00000002",
            "R00000002",
            None,
            at(5),
        );
        let own = detector.resolve_bundle(&late);
        assert!(own.inferred);
        assert_eq!(own.lifecycle, BundleLifecycle::Active);
        assert_ne!(own.bundle_id, "B00000001");

        let replay = BundleDetector::default();
        assert_eq!(replay.resolve_bundle(&late).bundle_id, own.bundle_id);
    }

    #[test]
    fn a_members_own_bundle_reaches_past_the_timing_window() {
        let detector = BundleDetector::default();
        detector.resolve_bundle(&event(
            "E00000001",
            EventType::BundleFormed,
            "M00000001",
            "R00000001",
            Some("B00000001"),
            at(0),
        ));
        detector.resolve_bundle(&event(
            "E00000002",
            EventType::BundleFormed,
            "M00000002",
            "R00000002",
            Some("B00000002"),
            at(19),
        ));

        let joined = detector.resolve_bundle(&event(
            "E00000003",
            EventType::RefillEligible,
            "M00000001",
            "R00000003",
            None,
            at(20),
        ));
        assert_eq!(joined.bundle_id, "B00000001");

        let outside = detector.resolve_bundle(&event(
            "E00000004",
            EventType::RefillEligible,
            "M00000001",
            "R00000004",
            None,
            at(45),
        ));
        assert!(outside.inferred);
        assert_ne!(outside.bundle_id, "B00000001");
    }

    #[test]
    fn inference_skips_bundles_at_the_member_cap() {
        let detector = BundleDetector::default();
        let members = ["M00000001", "M00000002", "M00000003", "M00000004", "M00000005"];
        let mut shared = None;
        for (index, member) in members.iter().enumerate() {
            let context = detector.resolve_bundle(&event(
                &format!("E0000000{index}"),
                EventType::RefillInitiated,
                member,
                &format!("R0000000{index}"),
                None,
                at(0),
            ));
            shared.get_or_insert_with(|| context.bundle_id.clone());
            assert_eq!(Some(&context.bundle_id), shared.as_ref());
        }
        let shared = shared.unwrap();
        assert_eq!(detector.get(&shared).map(|c| c.member_count()), Some(5));

        let newcomer = detector.resolve_bundle(&event(
            "E00000009",
            EventType::RefillInitiated,
            "M00000006",
            "R00000009",
            None,
            at(1),
        ));
        assert_ne!(newcomer.bundle_id, shared);
        assert_eq!(newcomer.member_count(), 1);

        let existing_member = detector.resolve_bundle(&event(
            "E00000010",
            EventType::RefillEligible,
            "M00000003",
            "R00000010",
            None,
            at(1),
        ));
        assert_eq!(existing_member.bundle_id, shared);
    }

    #[test]
    fn completed_bundles_are_not_inference_targets() {
        let detector = BundleDetector::default();
        detector.resolve_bundle(&event(
            "E00000001",
            EventType::BundleShipped,
            "M00000001",
            "R00000001",
            Some("B00000001"),
            at(0),
        ));
        let next = detector.resolve_bundle(&event(
            "E00000002",
            EventType::RefillInitiated,
            "M00000001",
            "R00000002",
            None,
            at(1),
        ));
        assert_ne!(next.bundle_id, "B00000001");
        assert_eq!(detector.bundles_for_member("M00000001").len(), 2);
    }

    #[test]
    fn risk_factors_follow_age_and_inactivity() {
        let detector = BundleDetector::default();
        detector.resolve_bundle(&event(
            "E00000001",
            EventType::BundleFormed,
            "M00000001",
            "R00000001",
            Some("B00000001"),
            at(0),
        ));
        let factors = detector.analyze_risks("B00000001", at(30)).unwrap();
        assert!(factors.contains(&BundleRiskFactor::AgedOver24h));
        assert!(factors.contains(&BundleRiskFactor::Inactive));
        assert!(!factors.contains(&BundleRiskFactor::AgedOver48h));

        let factors = detector.analyze_risks("B00000001", at(50)).unwrap();
        assert!(factors.contains(&BundleRiskFactor::AgedOver48h));
        assert!(!factors.contains(&BundleRiskFactor::AgedOver24h));
        assert_eq!(detector.analyze_risks("B99999999", at(50)), None);
    }

    #[test]
    fn many_members_or_refills_mark_a_large_bundle() {
        let detector = BundleDetector::default();
        for index in 1..=6 {
            let context = detector.resolve_bundle(&event(
                &format!("E0000000{index}"),
                EventType::RefillInitiated,
                &format!("M0000000{index}"),
                &format!("R0000000{index}"),
                Some("B00000001"),
                at(0),
            ));
            assert_eq!(
                context.risk_factors.contains(&BundleRiskFactor::LargeBundle),
                index > 5
            );
        }

        for index in 1..=11 {
            let context = detector.resolve_bundle(&event(
                &format!("E000001{index:02}"),
                EventType::RefillInitiated,
                "M00000001",
                &format!("R000001{index:02}"),
                Some("B00000002"),
                at(0),
            ));
            assert_eq!(context.member_count(), 1);
            assert_eq!(
                context.risk_factors.contains(&BundleRiskFactor::LargeBundle),
                index > 10
            );
        }
    }

    #[test]
    fn complex_bundle_type_is_a_risk_factor() {
        let detector = BundleDetector::default();
        let mut formed = event(
            "E00000001",
            EventType::BundleFormed,
            "M00000001",
            "R00000001",
            Some("B00000001"),
            at(0),
        );
        formed.details = EventDetails::Bundle(BundleDetails {
            bundle_type: Some("complex".to_string()),
            ..BundleDetails::default()
        });
        let context = detector.resolve_bundle(&formed);
        assert_eq!(context.bundle_type.as_deref(), Some("complex"));
        assert!(context.risk_factors.contains(&BundleRiskFactor::ComplexType));

        let simple = detector.resolve_bundle(&event(
            "E00000002",
            EventType::BundleFormed,
            "M00000002",
            "R00000002",
            Some("B00000002"),
            at(0),
        ));
        assert!(!simple.risk_factors.contains(&BundleRiskFactor::ComplexType));
    }

    #[test]
    fn a_long_gap_between_attached_events_marks_inactivity() {
        let detector = BundleDetector::default();
        for (id, bundle, hour) in [
            ("E00000001", "B00000001", 0),
            ("E00000002", "B00000002", 0),
        ] {
            detector.resolve_bundle(&event(
                id,
                EventType::BundleFormed,
                "M00000001",
                "R00000001",
                Some(bundle),
                at(hour),
            ));
        }

        let late = detector.resolve_bundle(&event(
            "E00000003",
            EventType::RefillEligible,
            "M00000001",
            "R00000002",
            Some("B00000001"),
            at(13),
        ));
        assert!(late.risk_factors.contains(&BundleRiskFactor::Inactive));
        assert!(!late.risk_factors.contains(&BundleRiskFactor::AgedOver24h));

        let prompt = detector.resolve_bundle(&event(
            "E00000004",
            EventType::RefillEligible,
            "M00000001",
            "R00000002",
            Some("B00000002"),
            at(11),
        ));
        assert!(!prompt.risk_factors.contains(&BundleRiskFactor::Inactive));
    }

    #[test]
    fn retiring_drops_only_idle_completed_bundles() {
        let detector = BundleDetector::default();
        detector.resolve_bundle(&event(
            "E00000001",
            EventType::BundleShipped,
            "M00000001",
            "R00000001",
            Some("B00000001"),
            at(0),
        ));
        detector.resolve_bundle(&event(
            "E00000002",
            EventType::BundleFormed,
            "M00000002",
            "R00000002",
            Some("B00000002"),
            at(0),
        ));
        assert_eq!(detector.retire_completed(at(100), Duration::hours(168)), 0);
        assert_eq!(detector.retire_completed(at(200), Duration::hours(168)), 1);
        assert!(detector.get("B00000001").is_none());
        assert!(detector.get("B00000002").is_some());
        assert!(detector.bundles_for_member("M00000001").is_empty());

        let stats = detector.statistics();
        assert_eq!(stats.active_bundles, 1);
        assert_eq!(stats.completed_bundles, 0);
    }
}
