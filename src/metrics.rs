//! Bundle health metrics derived from refill snapshots.
//!
//! Every score here is clamped to [0, 1]. Fields that cannot be computed
//! because their inputs are missing are `None` rather than a guess, so that
//! scoring can tell degraded input apart from a healthy bundle.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::aggregation::{RefillSnapshot, SnapshotStage};
use crate::config::merge_table;
use crate::error::{PipelineError, Result};
use crate::models::{artifact_id, PaStatus};

pub const METRICS_VERSION: &str = "bundle-metrics-v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Days a refill is expected to spend in each stage before it counts as aging.
    #[serde(deserialize_with = "expected_stage_days_over_defaults")]
    pub expected_stage_days: BTreeMap<SnapshotStage, f64>,
    /// Days in stage at which the stage-aging risk saturates.
    #[serde(deserialize_with = "stage_risk_horizon_days_over_defaults")]
    pub stage_risk_horizon_days: BTreeMap<SnapshotStage, f64>,
    pub optimal_gap_days: f64,
    pub gap_tolerance_days: f64,
    pub abandonment_horizon_days: f64,
    pub min_supply_buffer_days: f64,
    pub variance_scale_days: f64,
    pub efficiency_gap_days: f64,
    pub fragmentation_gap_days: f64,
    pub fragmentation_sigma_days: f64,
    pub carrier_capacity_refills: f64,
    pub dispersion_member_span: f64,
    pub carrier_delay_horizon_days: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        use SnapshotStage::*;
        Self {
            expected_stage_days: BTreeMap::from([
                (Initiated, 3.0),
                (Eligible, 7.0),
                (PaPending, 5.0),
                (PaApproved, 3.0),
                (PaDenied, 3.0),
                (Bundled, 2.0),
                (OosDetected, 1.0),
                (Shipped, 0.0),
                (Completed, 0.0),
                (Cancelled, 0.0),
            ]),
            stage_risk_horizon_days: BTreeMap::from([
                (Initiated, 7.0),
                (Eligible, 14.0),
                (PaPending, 10.0),
                (PaApproved, 7.0),
                (PaDenied, 7.0),
                (Bundled, 5.0),
                (OosDetected, 3.0),
                (Shipped, 0.0),
                (Completed, 0.0),
                (Cancelled, 0.0),
            ]),
            optimal_gap_days: 30.0,
            gap_tolerance_days: 7.0,
            abandonment_horizon_days: 60.0,
            min_supply_buffer_days: 7.0,
            variance_scale_days: 900.0,
            efficiency_gap_days: 30.0,
            fragmentation_gap_days: 14.0,
            fragmentation_sigma_days: 7.0,
            carrier_capacity_refills: 10.0,
            dispersion_member_span: 4.0,
            carrier_delay_horizon_days: 7.0,
        }
    }
}

fn expected_stage_days_over_defaults<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<BTreeMap<SnapshotStage, f64>, D::Error> {
    merge_table(deserializer, MetricsConfig::default().expected_stage_days)
}

fn stage_risk_horizon_days_over_defaults<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<BTreeMap<SnapshotStage, f64>, D::Error> {
    merge_table(deserializer, MetricsConfig::default().stage_risk_horizon_days)
}

impl MetricsConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("optimal_gap_days", self.optimal_gap_days),
            ("abandonment_horizon_days", self.abandonment_horizon_days),
            ("min_supply_buffer_days", self.min_supply_buffer_days),
            ("variance_scale_days", self.variance_scale_days),
            ("efficiency_gap_days", self.efficiency_gap_days),
            ("fragmentation_gap_days", self.fragmentation_gap_days),
            ("fragmentation_sigma_days", self.fragmentation_sigma_days),
            ("carrier_capacity_refills", self.carrier_capacity_refills),
            ("dispersion_member_span", self.dispersion_member_span),
            ("carrier_delay_horizon_days", self.carrier_delay_horizon_days),
        ];
        for (name, value) in positive {
            if value.is_nan() || value <= 0.0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if self.gap_tolerance_days < 0.0 {
            return Err(PipelineError::InvalidConfig(
                "gap_tolerance_days must not be negative".to_string(),
            ));
        }
        let tables = [&self.expected_stage_days, &self.stage_risk_horizon_days];
        if tables.iter().flat_map(|table| table.values()).any(|days| *days < 0.0) {
            return Err(PipelineError::InvalidConfig(
                "stage durations must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    fn expected_days(&self, stage: SnapshotStage) -> f64 {
        self.expected_stage_days.get(&stage).copied().unwrap_or(3.0)
    }

    fn risk_horizon(&self, stage: SnapshotStage) -> f64 {
        self.stage_risk_horizon_days.get(&stage).copied().unwrap_or(7.0)
    }
}

fn clamp01(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn ratio(days: f64, limit: f64) -> f64 {
    if limit > 0.0 {
        clamp01(days / limit)
    } else if days > 0.0 {
        1.0
    } else {
        0.0
    }
}

fn is_terminal(stage: SnapshotStage) -> bool {
    matches!(
        stage,
        SnapshotStage::Shipped | SnapshotStage::Completed | SnapshotStage::Cancelled
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgeInStage {
    pub current_stage: SnapshotStage,
    pub days_in_current_stage: i64,
    pub expected_days: f64,
    /// Whole days spent in every stage the refill has entered.
    pub stage_history: BTreeMap<SnapshotStage, i64>,
    pub initiation_to_eligible_days: Option<i64>,
    pub eligibility_to_bundled_days: Option<i64>,
    pub bundled_to_shipped_days: Option<i64>,
    pub is_aging: bool,
    pub stage_age_percentile: f64,
    pub aging_risk: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingOverlap {
    pub bundle_size: usize,
    pub known_dates: usize,
    pub timing_variance_days: Option<f64>,
    pub max_gap_days: Option<f64>,
    pub overlap_score: f64,
    pub alignment_efficiency: f64,
    pub fragmentation_risk: f64,
    pub shipment_split_probability: f64,
    pub well_aligned: bool,
    pub sufficient_data: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefillGap {
    pub days_since_last_fill: Option<i64>,
    pub days_until_due: Option<i64>,
    pub is_optimal_gap: bool,
    pub gap_efficiency: f64,
    pub gap_anomaly: Option<f64>,
    pub days_supply_remaining: Option<i64>,
    pub supply_buffer_days: Option<i64>,
    pub buffer_depletion: Option<f64>,
    pub urgency_score: f64,
    pub abandonment_risk: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    TimingOptimization,
    BundleOptimization,
    SplitMonitoring,
    ProcessOptimization,
    MemberEngagement,
    SupplyManagement,
}

impl ActionCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionCategory::TimingOptimization => "timing_optimization",
            ActionCategory::BundleOptimization => "bundle_optimization",
            ActionCategory::SplitMonitoring => "split_monitoring",
            ActionCategory::ProcessOptimization => "process_optimization",
            ActionCategory::MemberEngagement => "member_engagement",
            ActionCategory::SupplyManagement => "supply_management",
        }
    }
}

impl fmt::Display for ActionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleAlignment {
    pub member_count: usize,
    pub refill_count: usize,
    pub alignment_score: f64,
    pub timing_alignment_score: f64,
    pub efficiency_score: f64,
    pub cost_savings_potential: f64,
    pub split_risk_score: f64,
    pub outreach_reduction_score: f64,
    pub health_score: f64,
    pub recommended_actions: Vec<ActionCategory>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FulfillmentSignals {
    pub pa_delay: f64,
    pub oos_disruption: f64,
    pub inventory_shortage_ratio: f64,
    pub carrier_load: f64,
    pub member_dispersion: f64,
    pub carrier_delay: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAvailability {
    pub alignment_score: bool,
    pub bundle_dates: bool,
    pub last_fill_date: bool,
    pub refill_due_date: bool,
    pub days_supply: bool,
    pub ship_by_date: bool,
    pub stage_entry: bool,
}

/// Named numeric fields that risk drivers read their impact from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    TimingMisalignment,
    FragmentationRisk,
    StageAgingRisk,
    PaDelay,
    RefillGapAnomaly,
    SupplyBufferDepletion,
    OosDisruption,
    InventoryFragmentation,
    CarrierLoad,
    MemberDispersion,
    InventoryShortage,
    CarrierDelay,
}

impl MetricField {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricField::TimingMisalignment => "timing_misalignment",
            MetricField::FragmentationRisk => "fragmentation_risk",
            MetricField::StageAgingRisk => "stage_aging_risk",
            MetricField::PaDelay => "pa_delay",
            MetricField::RefillGapAnomaly => "refill_gap_anomaly",
            MetricField::SupplyBufferDepletion => "supply_buffer_depletion",
            MetricField::OosDisruption => "oos_disruption",
            MetricField::InventoryFragmentation => "inventory_fragmentation",
            MetricField::CarrierLoad => "carrier_load",
            MetricField::MemberDispersion => "member_dispersion",
            MetricField::InventoryShortage => "inventory_shortage",
            MetricField::CarrierDelay => "carrier_delay",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleMetrics {
    pub metrics_id: String,
    /// Snapshot the metrics describe.
    pub snapshot_id: String,
    /// Every snapshot that contributed, the focal one included. Sorted.
    pub snapshot_ids: Vec<String>,
    pub member_id: String,
    pub refill_id: String,
    pub bundle_id: Option<String>,
    pub as_of: DateTime<Utc>,
    pub age_in_stage: AgeInStage,
    pub timing_overlap: TimingOverlap,
    pub refill_gap: RefillGap,
    pub bundle_alignment: BundleAlignment,
    pub fulfillment: FulfillmentSignals,
    pub availability: DataAvailability,
    pub version: String,
}

impl BundleMetrics {
    /// Value of a named field, or `None` when its inputs were missing.
    pub fn field_value(&self, field: MetricField) -> Option<f64> {
        match field {
            MetricField::TimingMisalignment => (self.availability.alignment_score
                || self.timing_overlap.sufficient_data)
                .then(|| 1.0 - self.bundle_alignment.timing_alignment_score),
            MetricField::FragmentationRisk => self
                .timing_overlap
                .sufficient_data
                .then_some(self.timing_overlap.fragmentation_risk),
            MetricField::StageAgingRisk => Some(self.age_in_stage.aging_risk),
            MetricField::PaDelay => Some(self.fulfillment.pa_delay),
            MetricField::RefillGapAnomaly => self.refill_gap.gap_anomaly,
            MetricField::SupplyBufferDepletion => self.refill_gap.buffer_depletion,
            MetricField::OosDisruption => Some(self.fulfillment.oos_disruption),
            MetricField::InventoryFragmentation => self.timing_overlap.sufficient_data.then(|| {
                self.timing_overlap
                    .shipment_split_probability
                    .max(self.fulfillment.inventory_shortage_ratio)
            }),
            MetricField::CarrierLoad => Some(self.fulfillment.carrier_load),
            MetricField::MemberDispersion => Some(self.fulfillment.member_dispersion),
            MetricField::InventoryShortage => Some(self.fulfillment.inventory_shortage_ratio),
            MetricField::CarrierDelay => self.fulfillment.carrier_delay,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub total: usize,
    pub bundles: usize,
    pub average_health: f64,
    pub aging_count: usize,
    pub insufficient_timing_count: usize,
    pub stage_distribution: BTreeMap<SnapshotStage, usize>,
}

/// Stateless; safe to share across threads.
#[derive(Debug, Clone, Default)]
pub struct BundleMetricsEngine {
    config: MetricsConfig,
}

impl BundleMetricsEngine {
    pub fn new(config: MetricsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Metrics for `snapshot` in the context of its bundle peers. The focal
    /// snapshot is counted once whether or not `bundle` already holds it.
    pub fn compute(
        &self,
        snapshot: &RefillSnapshot,
        bundle: &[RefillSnapshot],
        as_of: DateTime<Utc>,
    ) -> BundleMetrics {
        let mut peers: BTreeMap<&str, &RefillSnapshot> = BTreeMap::new();
        for peer in bundle {
            peers.entry(peer.refill_id.as_str()).or_insert(peer);
        }
        peers.insert(snapshot.refill_id.as_str(), snapshot);
        let peers: Vec<&RefillSnapshot> = peers.into_values().collect();

        let age_in_stage = self.age_in_stage(snapshot);
        let timing_overlap = self.timing_overlap(&peers);
        let refill_gap = self.refill_gap(snapshot);
        let fulfillment = self.fulfillment(snapshot, &peers, &age_in_stage, as_of);
        let bundle_alignment =
            self.bundle_alignment(snapshot, &peers, &age_in_stage, &timing_overlap, &refill_gap);

        let availability = DataAvailability {
            alignment_score: snapshot.bundle_alignment_score.is_some(),
            bundle_dates: timing_overlap.sufficient_data,
            last_fill_date: snapshot.last_fill_date.is_some(),
            refill_due_date: snapshot.refill_due_date.is_some(),
            days_supply: snapshot.days_supply.is_some(),
            ship_by_date: snapshot.ship_by_date.is_some(),
            stage_entry: snapshot.stages.entered(snapshot.current_stage).is_some(),
        };

        let mut snapshot_ids: Vec<String> =
            peers.iter().map(|peer| peer.snapshot_id.clone()).collect();
        snapshot_ids.sort();

        let as_of_text = as_of.to_rfc3339();
        let mut parts: Vec<&str> = vec![snapshot.snapshot_id.as_str(), as_of_text.as_str()];
        parts.extend(snapshot_ids.iter().map(String::as_str));
        let metrics_id = artifact_id("metrics", &parts).to_string();

        BundleMetrics {
            metrics_id,
            snapshot_id: snapshot.snapshot_id.clone(),
            snapshot_ids,
            member_id: snapshot.member_id.clone(),
            refill_id: snapshot.refill_id.clone(),
            bundle_id: snapshot.bundle_id.clone(),
            as_of,
            age_in_stage,
            timing_overlap,
            refill_gap,
            bundle_alignment,
            fulfillment,
            availability,
            version: METRICS_VERSION.to_string(),
        }
    }

    /// Metrics for every snapshot, grouping peers by bundle id. Each output
    /// depends only on its own bundle group, so input order does not matter.
    pub fn compute_batch(
        &self,
        snapshots: &[RefillSnapshot],
        as_of: DateTime<Utc>,
    ) -> Vec<BundleMetrics> {
        let mut groups: BTreeMap<&str, Vec<RefillSnapshot>> = BTreeMap::new();
        for snapshot in snapshots {
            if let Some(bundle_id) = snapshot.bundle_id.as_deref() {
                groups.entry(bundle_id).or_default().push(snapshot.clone());
            }
        }
        snapshots
            .iter()
            .map(|snapshot| {
                let peers = snapshot
                    .bundle_id
                    .as_deref()
                    .and_then(|bundle_id| groups.get(bundle_id))
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                self.compute(snapshot, peers, as_of)
            })
            .collect()
    }

    pub fn summarize(&self, metrics: &[BundleMetrics]) -> MetricsSummary {
        let mut summary = MetricsSummary {
            total: metrics.len(),
            ..MetricsSummary::default()
        };
        let mut bundles = BTreeSet::new();
        for item in metrics {
            *summary
                .stage_distribution
                .entry(item.age_in_stage.current_stage)
                .or_insert(0) += 1;
            if item.age_in_stage.is_aging {
                summary.aging_count += 1;
            }
            if !item.timing_overlap.sufficient_data {
                summary.insufficient_timing_count += 1;
            }
            if let Some(bundle_id) = &item.bundle_id {
                bundles.insert(bundle_id.as_str());
            }
        }
        summary.bundles = bundles.len();
        if !metrics.is_empty() {
            summary.average_health = metrics
                .iter()
                .map(|item| item.bundle_alignment.health_score)
                .sum::<f64>()
                / metrics.len() as f64;
        }
        summary
    }

    fn age_in_stage(&self, snapshot: &RefillSnapshot) -> AgeInStage {
        let stage = snapshot.current_stage;
        let days = snapshot.days_in_current_stage;
        let expected = self.config.expected_days(stage);

        let pa_resolution = match snapshot.pa_state {
            PaStatus::Denied | PaStatus::Expired => SnapshotStage::PaDenied,
            _ => SnapshotStage::PaApproved,
        };
        let mut entered: Vec<(DateTime<Utc>, SnapshotStage)> = [
            SnapshotStage::Initiated,
            SnapshotStage::Eligible,
            SnapshotStage::PaPending,
            pa_resolution,
            SnapshotStage::Bundled,
            SnapshotStage::OosDetected,
            SnapshotStage::Shipped,
            SnapshotStage::Completed,
            SnapshotStage::Cancelled,
        ]
        .into_iter()
        .filter_map(|stage| snapshot.stages.entered(stage).map(|at| (at, stage)))
        .collect();
        entered.sort();

        let mut stage_history = BTreeMap::new();
        for (index, (at, stage)) in entered.iter().enumerate() {
            let until = entered
                .get(index + 1)
                .map(|(next, _)| *next)
                .unwrap_or(snapshot.as_of);
            stage_history.insert(*stage, (until - *at).num_days().max(0));
        }

        let span = |from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>| match (from, to) {
            (Some(from), Some(to)) => Some((to - from).num_days()),
            _ => None,
        };
        let stages = &snapshot.stages;

        let terminal = is_terminal(stage);
        AgeInStage {
            current_stage: stage,
            days_in_current_stage: days,
            expected_days: expected,
            stage_history,
            initiation_to_eligible_days: span(stages.initiated_at, stages.eligible_at),
            eligibility_to_bundled_days: span(stages.eligible_at, stages.bundled_at),
            bundled_to_shipped_days: span(stages.bundled_at, stages.shipped_at),
            is_aging: !terminal && days as f64 > expected,
            stage_age_percentile: if terminal {
                0.0
            } else {
                ratio(days as f64, 2.0 * expected)
            },
            aging_risk: if terminal {
                0.0
            } else {
                ratio(days as f64, self.config.risk_horizon(stage))
            },
        }
    }

    fn timing_overlap(&self, peers: &[&RefillSnapshot]) -> TimingOverlap {
        let config = &self.config;
        let bundle_size = peers.len();
        let dates: Vec<NaiveDate> = peers
            .iter()
            .filter_map(|peer| peer.ship_by_date.or(peer.refill_due_date))
            .map(|date| date.date_naive())
            .collect();

        if bundle_size <= 1 {
            return TimingOverlap {
                bundle_size,
                known_dates: dates.len(),
                timing_variance_days: Some(0.0),
                max_gap_days: Some(0.0),
                overlap_score: 1.0,
                alignment_efficiency: 1.0,
                fragmentation_risk: 0.0,
                shipment_split_probability: 0.0,
                well_aligned: true,
                sufficient_data: true,
            };
        }
        if dates.len() < 2 {
            return TimingOverlap {
                bundle_size,
                known_dates: dates.len(),
                timing_variance_days: None,
                max_gap_days: None,
                overlap_score: 0.5,
                alignment_efficiency: 0.5,
                fragmentation_risk: 0.5,
                shipment_split_probability: 0.5,
                well_aligned: false,
                sufficient_data: false,
            };
        }

        let earliest = dates.iter().min().copied().unwrap_or_default();
        let offsets: Vec<f64> = dates
            .iter()
            .map(|date| (*date - earliest).num_days() as f64)
            .collect();
        let mean = offsets.iter().sum::<f64>() / offsets.len() as f64;
        let variance =
            offsets.iter().map(|offset| (offset - mean).powi(2)).sum::<f64>() / offsets.len() as f64;
        let max_gap = offsets.iter().copied().fold(0.0, f64::max);

        let alignment_efficiency = clamp01(1.0 - max_gap / config.efficiency_gap_days);
        let fragmentation_risk = clamp01(
            0.6 * max_gap / config.fragmentation_gap_days
                + 0.4 * variance.sqrt() / config.fragmentation_sigma_days,
        );

        TimingOverlap {
            bundle_size,
            known_dates: dates.len(),
            timing_variance_days: Some(variance),
            max_gap_days: Some(max_gap),
            overlap_score: clamp01(1.0 - variance / config.variance_scale_days),
            alignment_efficiency,
            fragmentation_risk,
            shipment_split_probability: clamp01(0.8 * fragmentation_risk),
            well_aligned: alignment_efficiency > 0.8,
            sufficient_data: true,
        }
    }

    fn refill_gap(&self, snapshot: &RefillSnapshot) -> RefillGap {
        let config = &self.config;
        let since = snapshot.days_since_last_fill;
        let until = snapshot.days_until_due;

        let deviation = since.map(|days| (days as f64 - config.optimal_gap_days).abs());
        let gap_anomaly = since.map(|days| {
            let excess = days as f64 - (config.optimal_gap_days + config.gap_tolerance_days);
            ratio(excess.max(0.0), config.abandonment_horizon_days)
        });

        let remaining = match (snapshot.days_supply, since) {
            (Some(supply), Some(since)) => Some((supply as i64 - since).max(0)),
            _ => None,
        };
        let buffer = match (remaining, until) {
            (Some(remaining), Some(until)) => Some(remaining - until.max(0)),
            _ => None,
        };
        let buffer_depletion = buffer.map(|buffer| {
            clamp01((config.min_supply_buffer_days - buffer as f64) / config.min_supply_buffer_days)
        });

        let urgency_score = match until {
            Some(days) if days < 0 => 1.0,
            Some(days) if days < 7 => 0.8,
            Some(days) if days < 14 => 0.5,
            Some(days) if days < 30 => 0.2,
            _ => 0.0,
        };

        RefillGap {
            days_since_last_fill: since,
            days_until_due: until,
            is_optimal_gap: deviation.is_some_and(|dev| dev <= config.gap_tolerance_days),
            gap_efficiency: deviation
                .map(|dev| clamp01(1.0 - dev / config.optimal_gap_days))
                .unwrap_or(0.5),
            gap_anomaly,
            days_supply_remaining: remaining,
            supply_buffer_days: buffer,
            buffer_depletion,
            urgency_score,
            abandonment_risk: clamp01(
                gap_anomaly
                    .unwrap_or(0.0)
                    .max(0.5 * buffer_depletion.unwrap_or(0.0)),
            ),
        }
    }

    fn bundle_alignment(
        &self,
        snapshot: &RefillSnapshot,
        peers: &[&RefillSnapshot],
        age: &AgeInStage,
        timing: &TimingOverlap,
        gap: &RefillGap,
    ) -> BundleAlignment {
        let member_count = peers
            .iter()
            .map(|peer| peer.member_id.as_str())
            .collect::<BTreeSet<_>>()
            .len();
        let refill_count = peers
            .len()
            .max(snapshot.bundle_refill_count.unwrap_or(0) as usize);

        let alignment_score = snapshot
            .bundle_alignment_score
            .unwrap_or(if timing.sufficient_data {
                timing.alignment_efficiency
            } else {
                0.5
            });
        let timing_alignment_score = clamp01((alignment_score + timing.alignment_efficiency) / 2.0);
        let efficiency_score = clamp01(alignment_score * 0.8);
        let cost_savings_potential = clamp01(refill_count as f64 * 0.1);
        let split_risk_score = clamp01(1.0 - alignment_score);
        let health_score = (alignment_score + efficiency_score + cost_savings_potential) / 3.0;

        let mut recommended_actions = Vec::new();
        if alignment_score < 0.6 {
            recommended_actions.push(ActionCategory::TimingOptimization);
        }
        if efficiency_score < 0.5 {
            recommended_actions.push(ActionCategory::BundleOptimization);
        }
        if split_risk_score > 0.7 {
            recommended_actions.push(ActionCategory::SplitMonitoring);
        }
        if age.is_aging {
            recommended_actions.push(ActionCategory::ProcessOptimization);
        }
        if gap.gap_anomaly.is_some_and(|risk| risk > 0.5) {
            recommended_actions.push(ActionCategory::MemberEngagement);
        }
        if gap.urgency_score > 0.7 {
            recommended_actions.push(ActionCategory::SupplyManagement);
        }

        BundleAlignment {
            member_count,
            refill_count,
            alignment_score,
            timing_alignment_score,
            efficiency_score,
            cost_savings_potential,
            split_risk_score,
            outreach_reduction_score: clamp01(efficiency_score * 0.7),
            health_score,
            recommended_actions,
        }
    }

    fn fulfillment(
        &self,
        snapshot: &RefillSnapshot,
        peers: &[&RefillSnapshot],
        age: &AgeInStage,
        as_of: DateTime<Utc>,
    ) -> FulfillmentSignals {
        let config = &self.config;
        let pa_delay = match snapshot.current_stage {
            SnapshotStage::PaPending | SnapshotStage::PaApproved => age.aging_risk,
            SnapshotStage::PaDenied => 1.0,
            _ if snapshot.pa_state == PaStatus::Expired => 1.0,
            _ => 0.0,
        };
        let oos_disruption = if snapshot.current_stage == SnapshotStage::OosDetected {
            clamp01(0.8 + 0.2 * age.aging_risk)
        } else {
            0.0
        };
        let short = peers
            .iter()
            .filter(|peer| peer.current_stage == SnapshotStage::OosDetected)
            .count();
        let members = peers
            .iter()
            .map(|peer| peer.member_id.as_str())
            .collect::<BTreeSet<_>>()
            .len();

        let carrier_delay = if is_terminal(snapshot.current_stage) {
            Some(0.0)
        } else {
            snapshot.ship_by_date.map(|ship_by| {
                let overdue = (as_of.date_naive() - ship_by.date_naive()).num_days();
                ratio(overdue.max(0) as f64, config.carrier_delay_horizon_days)
            })
        };

        FulfillmentSignals {
            pa_delay,
            oos_disruption,
            inventory_shortage_ratio: if peers.is_empty() {
                0.0
            } else {
                short as f64 / peers.len() as f64
            },
            carrier_load: ratio(peers.len() as f64, config.carrier_capacity_refills),
            member_dispersion: ratio(
                members.saturating_sub(1) as f64,
                config.dispersion_member_span,
            ),
            carrier_delay,
        }
    }
}
