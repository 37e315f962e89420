//! Risk scoring: weighted driver sums over bundle metrics.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::config::{merge_nested_table, merge_table};
use crate::error::{PipelineError, Result};
use crate::metrics::{ActionCategory, BundleMetrics, MetricField};
use crate::models::artifact_id;

pub const MODEL_VERSION: &str = "bundle-risk-v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskType {
    BundleBreak,
    Abandonment,
    ShipmentSplit,
    FulfillmentDelay,
}

impl RiskType {
    pub const ALL: [RiskType; 4] = [
        RiskType::BundleBreak,
        RiskType::Abandonment,
        RiskType::ShipmentSplit,
        RiskType::FulfillmentDelay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskType::BundleBreak => "bundle_break",
            RiskType::Abandonment => "abandonment",
            RiskType::ShipmentSplit => "shipment_split",
            RiskType::FulfillmentDelay => "fulfillment_delay",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RiskType::BundleBreak => "bundle break",
            RiskType::Abandonment => "refill abandonment",
            RiskType::ShipmentSplit => "shipment split",
            RiskType::FulfillmentDelay => "fulfillment delay",
        }
    }

    /// The fixed driver set this risk type is scored over.
    pub fn drivers(&self) -> &'static [DriverKind] {
        use DriverKind::*;
        match self {
            RiskType::BundleBreak => &[TimingMisalignment, BundleFragmentation, StageAging, PaDelay],
            RiskType::Abandonment => &[
                RefillGapAnomaly,
                SupplyBufferDepletion,
                StageAging,
                OosDisruption,
            ],
            RiskType::ShipmentSplit => &[
                InventoryFragmentation,
                CarrierCapacity,
                GeographicDispersion,
            ],
            RiskType::FulfillmentDelay => &[SupplyChainDisruption, InventoryShortage, CarrierDelay],
        }
    }
}

impl fmt::Display for RiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lower bounds of the medium, high and critical bands. Bounds are closed:
/// a probability equal to a bound belongs to the higher band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeverityBands {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl SeverityBands {
    pub const fn new(medium: f64, high: f64, critical: f64) -> Self {
        Self {
            medium,
            high,
            critical,
        }
    }

    pub fn classify(&self, probability: f64) -> Severity {
        if probability >= self.critical {
            Severity::Critical
        } else if probability >= self.high {
            Severity::High
        } else if probability >= self.medium {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    fn is_ordered(&self) -> bool {
        0.0 <= self.medium
            && self.medium <= self.high
            && self.high <= self.critical
            && self.critical <= 1.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    TimingMisalignment,
    BundleFragmentation,
    StageAging,
    PaDelay,
    RefillGapAnomaly,
    SupplyBufferDepletion,
    OosDisruption,
    InventoryFragmentation,
    CarrierCapacity,
    GeographicDispersion,
    SupplyChainDisruption,
    InventoryShortage,
    CarrierDelay,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::TimingMisalignment => "timing_misalignment",
            DriverKind::BundleFragmentation => "bundle_fragmentation",
            DriverKind::StageAging => "stage_aging",
            DriverKind::PaDelay => "pa_delay",
            DriverKind::RefillGapAnomaly => "refill_gap_anomaly",
            DriverKind::SupplyBufferDepletion => "supply_buffer_depletion",
            DriverKind::OosDisruption => "oos_disruption",
            DriverKind::InventoryFragmentation => "inventory_fragmentation",
            DriverKind::CarrierCapacity => "carrier_capacity",
            DriverKind::GeographicDispersion => "geographic_dispersion",
            DriverKind::SupplyChainDisruption => "supply_chain_disruption",
            DriverKind::InventoryShortage => "inventory_shortage",
            DriverKind::CarrierDelay => "carrier_delay",
        }
    }

    /// Metric field the driver's impact is read from.
    pub fn field(&self) -> MetricField {
        match self {
            DriverKind::TimingMisalignment => MetricField::TimingMisalignment,
            DriverKind::BundleFragmentation => MetricField::FragmentationRisk,
            DriverKind::StageAging => MetricField::StageAgingRisk,
            DriverKind::PaDelay => MetricField::PaDelay,
            DriverKind::RefillGapAnomaly => MetricField::RefillGapAnomaly,
            DriverKind::SupplyBufferDepletion => MetricField::SupplyBufferDepletion,
            DriverKind::OosDisruption | DriverKind::SupplyChainDisruption => {
                MetricField::OosDisruption
            }
            DriverKind::InventoryFragmentation => MetricField::InventoryFragmentation,
            DriverKind::CarrierCapacity => MetricField::CarrierLoad,
            DriverKind::GeographicDispersion => MetricField::MemberDispersion,
            DriverKind::InventoryShortage => MetricField::InventoryShortage,
            DriverKind::CarrierDelay => MetricField::CarrierDelay,
        }
    }

    /// How far the underlying measurement can be trusted when present.
    pub fn base_confidence(&self) -> f64 {
        match self {
            DriverKind::TimingMisalignment | DriverKind::RefillGapAnomaly => 0.9,
            DriverKind::BundleFragmentation
            | DriverKind::PaDelay
            | DriverKind::SupplyBufferDepletion
            | DriverKind::OosDisruption
            | DriverKind::SupplyChainDisruption => 0.8,
            DriverKind::StageAging
            | DriverKind::InventoryFragmentation
            | DriverKind::InventoryShortage
            | DriverKind::CarrierDelay => 0.7,
            DriverKind::CarrierCapacity | DriverKind::GeographicDispersion => 0.6,
        }
    }

    /// What to watch when this driver is a primary contributor.
    pub fn monitored_factor(&self) -> &'static str {
        match self {
            DriverKind::TimingMisalignment => "Timing alignment score",
            DriverKind::BundleFragmentation => "Maximum timing gap",
            DriverKind::StageAging => "Days in current stage",
            DriverKind::PaDelay => "Prior authorization turnaround",
            DriverKind::RefillGapAnomaly => "Days since last fill",
            DriverKind::SupplyBufferDepletion => "Supply buffer days",
            DriverKind::OosDisruption | DriverKind::SupplyChainDisruption => {
                "Out-of-stock resolution"
            }
            DriverKind::InventoryFragmentation => "Shipment split probability",
            DriverKind::CarrierCapacity => "Refills per shipment",
            DriverKind::GeographicDispersion => "Members per bundle",
            DriverKind::InventoryShortage => "Share of bundle out of stock",
            DriverKind::CarrierDelay => "Days past ship-by date",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub field: MetricField,
    pub value: Option<f64>,
    pub threshold: f64,
    /// `value - threshold`; positive means the threshold is exceeded.
    pub delta: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskDriver {
    pub kind: DriverKind,
    pub impact: f64,
    pub weight: f64,
    pub weighted_impact: f64,
    pub confidence: f64,
    pub evidence: Evidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub category: ActionCategory,
    pub priority: Priority,
    pub title: String,
    pub action_steps: Vec<String>,
    pub mitigates: Vec<DriverKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub assessment_id: String,
    pub risk_type: RiskType,
    pub metrics_id: String,
    pub snapshot_id: String,
    pub member_id: String,
    pub refill_id: String,
    pub bundle_id: Option<String>,
    pub probability: f64,
    pub severity: Severity,
    pub confidence: f64,
    pub primary_drivers: Vec<RiskDriver>,
    pub secondary_drivers: Vec<RiskDriver>,
    pub recommendations: Vec<Recommendation>,
    pub estimated_timeframe: String,
    pub critical_factors: Vec<String>,
    pub assessed_at: DateTime<Utc>,
    pub model_version: String,
    pub degraded: bool,
    pub missing_fields: Vec<MetricField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    #[serde(deserialize_with = "weights_over_defaults")]
    pub weights: BTreeMap<RiskType, BTreeMap<DriverKind, f64>>,
    #[serde(deserialize_with = "bands_over_defaults")]
    pub bands: BTreeMap<RiskType, SeverityBands>,
    /// Evidence threshold per driver; the value a driver is compared against.
    #[serde(deserialize_with = "thresholds_over_defaults")]
    pub thresholds: BTreeMap<DriverKind, f64>,
    pub min_confidence: f64,
    /// Confidence reported when complete data shows no risk at all.
    pub quiet_confidence: f64,
    /// Cumulative share of weighted impact the primary drivers must cover.
    pub primary_cut: f64,
    pub model_version: String,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        use DriverKind::*;
        let weights = BTreeMap::from([
            (
                RiskType::BundleBreak,
                BTreeMap::from([
                    (TimingMisalignment, 0.35),
                    (BundleFragmentation, 0.25),
                    (StageAging, 0.25),
                    (PaDelay, 0.15),
                ]),
            ),
            (
                RiskType::Abandonment,
                BTreeMap::from([
                    (RefillGapAnomaly, 0.4),
                    (SupplyBufferDepletion, 0.3),
                    (StageAging, 0.2),
                    (OosDisruption, 0.1),
                ]),
            ),
            (
                RiskType::ShipmentSplit,
                BTreeMap::from([
                    (InventoryFragmentation, 0.5),
                    (CarrierCapacity, 0.25),
                    (GeographicDispersion, 0.25),
                ]),
            ),
            (
                RiskType::FulfillmentDelay,
                BTreeMap::from([
                    (SupplyChainDisruption, 0.4),
                    (InventoryShortage, 0.3),
                    (CarrierDelay, 0.3),
                ]),
            ),
        ]);
        let bands = BTreeMap::from([
            (RiskType::BundleBreak, SeverityBands::new(0.3, 0.6, 0.8)),
            (RiskType::Abandonment, SeverityBands::new(0.2, 0.5, 0.8)),
            (RiskType::ShipmentSplit, SeverityBands::new(0.2, 0.4, 0.7)),
            (RiskType::FulfillmentDelay, SeverityBands::new(0.15, 0.35, 0.65)),
        ]);
        let thresholds = BTreeMap::from([
            (TimingMisalignment, 0.4),
            (BundleFragmentation, 0.5),
            (StageAging, 0.5),
            (PaDelay, 0.5),
            (RefillGapAnomaly, 0.3),
            (SupplyBufferDepletion, 0.5),
            (OosDisruption, 0.5),
            (InventoryFragmentation, 0.4),
            (CarrierCapacity, 0.7),
            (GeographicDispersion, 0.5),
            (SupplyChainDisruption, 0.5),
            (InventoryShortage, 0.3),
            (CarrierDelay, 0.3),
        ]);
        Self {
            weights,
            bands,
            thresholds,
            min_confidence: 0.3,
            quiet_confidence: 0.5,
            primary_cut: 0.7,
            model_version: MODEL_VERSION.to_string(),
        }
    }
}

fn weights_over_defaults<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<BTreeMap<RiskType, BTreeMap<DriverKind, f64>>, D::Error> {
    merge_nested_table(deserializer, ScoringConfig::default().weights)
}

fn bands_over_defaults<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<BTreeMap<RiskType, SeverityBands>, D::Error> {
    merge_table(deserializer, ScoringConfig::default().bands)
}

fn thresholds_over_defaults<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<BTreeMap<DriverKind, f64>, D::Error> {
    merge_table(deserializer, ScoringConfig::default().thresholds)
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<()> {
        for risk_type in RiskType::ALL {
            let weights = self.weights.get(&risk_type).ok_or_else(|| {
                PipelineError::InvalidConfig(format!("no driver weights for {risk_type}"))
            })?;
            for (kind, weight) in weights {
                if !risk_type.drivers().contains(kind) {
                    return Err(PipelineError::InvalidConfig(format!(
                        "{kind} is not a driver of {risk_type}"
                    )));
                }
                if weight.is_nan() || *weight < 0.0 {
                    return Err(PipelineError::InvalidConfig(format!(
                        "weight for {risk_type}/{kind} must not be negative"
                    )));
                }
            }
            let bands = self.bands.get(&risk_type).ok_or_else(|| {
                PipelineError::InvalidConfig(format!("no severity bands for {risk_type}"))
            })?;
            if !bands.is_ordered() {
                return Err(PipelineError::InvalidConfig(format!(
                    "severity bands for {risk_type} must ascend within [0, 1]"
                )));
            }
        }
        for (name, value) in [
            ("min_confidence", self.min_confidence),
            ("quiet_confidence", self.quiet_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::InvalidConfig(format!(
                    "{name} must lie within [0, 1], got {value}"
                )));
            }
        }
        if self.primary_cut.is_nan() || self.primary_cut <= 0.0 || self.primary_cut > 1.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "primary_cut must lie within (0, 1], got {}",
                self.primary_cut
            )));
        }
        Ok(())
    }

    pub fn weight(&self, risk_type: RiskType, kind: DriverKind) -> f64 {
        self.weights
            .get(&risk_type)
            .and_then(|weights| weights.get(&kind))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn threshold(&self, kind: DriverKind) -> f64 {
        self.thresholds.get(&kind).copied().unwrap_or(0.5)
    }

    fn bands(&self, risk_type: RiskType) -> SeverityBands {
        self.bands
            .get(&risk_type)
            .copied()
            .unwrap_or(SeverityBands::new(0.3, 0.6, 0.8))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssessmentSummary {
    pub total: usize,
    pub degraded: usize,
    pub by_type: BTreeMap<RiskType, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub average_probability: f64,
    pub average_confidence: f64,
    pub highest: Option<HighestRisk>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HighestRisk {
    pub assessment_id: String,
    pub risk_type: RiskType,
    pub refill_id: String,
    pub probability: f64,
    pub severity: Severity,
}

fn clamp01(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RiskScoringEngine {
    config: ScoringConfig,
}

impl RiskScoringEngine {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn score(&self, metrics: &BundleMetrics, risk_type: RiskType) -> Result<RiskAssessment> {
        if metrics.snapshot_ids.is_empty() {
            return Err(PipelineError::InvalidMetricsInput(format!(
                "metrics {} have no contributing snapshot",
                metrics.metrics_id
            )));
        }
        let config = &self.config;

        let mut missing_fields = Vec::new();
        let mut drivers = Vec::with_capacity(risk_type.drivers().len());
        for &kind in risk_type.drivers() {
            let field = kind.field();
            let value = metrics.field_value(field);
            if value.is_none() {
                missing_fields.push(field);
            }
            let weight = config.weight(risk_type, kind);
            let impact = clamp01(value.unwrap_or(0.0));
            let threshold = config.threshold(kind);
            drivers.push(RiskDriver {
                kind,
                impact,
                weight,
                weighted_impact: impact * weight,
                confidence: if value.is_some() {
                    kind.base_confidence()
                } else {
                    0.0
                },
                evidence: Evidence {
                    field,
                    value,
                    threshold,
                    delta: value.map(|value| value - threshold),
                },
            });
        }

        let probability = clamp01(drivers.iter().map(|driver| driver.weighted_impact).sum());
        let severity = config.bands(risk_type).classify(probability);
        let (primary_drivers, secondary_drivers) = split_drivers(drivers, config.primary_cut);

        let degraded = !missing_fields.is_empty();
        let confidence = if degraded {
            config.min_confidence
        } else if primary_drivers.is_empty() {
            config.quiet_confidence.max(config.min_confidence)
        } else {
            let contributing: Vec<f64> = primary_drivers
                .iter()
                .chain(&secondary_drivers)
                .map(|driver| driver.confidence)
                .collect();
            let mean = contributing.iter().sum::<f64>() / contributing.len() as f64;
            clamp01(mean).max(config.min_confidence)
        };

        let recommendations = recommend(&primary_drivers, severity);
        let critical_factors = primary_drivers
            .iter()
            .map(|driver| driver.kind.monitored_factor())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(str::to_string)
            .collect();

        let as_of_text = metrics.as_of.to_rfc3339();
        let assessment_id = artifact_id(
            "assessment",
            &[
                metrics.metrics_id.as_str(),
                risk_type.as_str(),
                config.model_version.as_str(),
                as_of_text.as_str(),
            ],
        )
        .to_string();

        if degraded {
            warn!(
                assessment_id = %assessment_id,
                risk_type = %risk_type,
                refill_id = %metrics.refill_id,
                missing = missing_fields.len(),
                "assessment degraded by missing metrics"
            );
        } else {
            debug!(
                assessment_id = %assessment_id,
                risk_type = %risk_type,
                probability,
                severity = %severity,
                "scored"
            );
        }

        Ok(RiskAssessment {
            assessment_id,
            risk_type,
            metrics_id: metrics.metrics_id.clone(),
            snapshot_id: metrics.snapshot_id.clone(),
            member_id: metrics.member_id.clone(),
            refill_id: metrics.refill_id.clone(),
            bundle_id: metrics.bundle_id.clone(),
            probability,
            severity,
            confidence,
            primary_drivers,
            secondary_drivers,
            recommendations,
            estimated_timeframe: estimated_timeframe(metrics, risk_type),
            critical_factors,
            assessed_at: metrics.as_of,
            model_version: config.model_version.clone(),
            degraded,
            missing_fields,
        })
    }

    pub fn score_all(&self, metrics: &BundleMetrics) -> Result<Vec<RiskAssessment>> {
        RiskType::ALL
            .into_iter()
            .map(|risk_type| self.score(metrics, risk_type))
            .collect()
    }

    pub fn summarize(&self, assessments: &[RiskAssessment]) -> AssessmentSummary {
        let mut summary = AssessmentSummary {
            total: assessments.len(),
            ..AssessmentSummary::default()
        };
        if assessments.is_empty() {
            return summary;
        }
        for assessment in assessments {
            *summary.by_type.entry(assessment.risk_type).or_insert(0) += 1;
            *summary.by_severity.entry(assessment.severity).or_insert(0) += 1;
            if assessment.degraded {
                summary.degraded += 1;
            }
        }
        let count = assessments.len() as f64;
        summary.average_probability =
            assessments.iter().map(|a| a.probability).sum::<f64>() / count;
        summary.average_confidence = assessments.iter().map(|a| a.confidence).sum::<f64>() / count;
        summary.highest = assessments
            .iter()
            .max_by(|a, b| {
                a.probability
                    .total_cmp(&b.probability)
                    .then_with(|| b.assessment_id.cmp(&a.assessment_id))
            })
            .map(|top| HighestRisk {
                assessment_id: top.assessment_id.clone(),
                risk_type: top.risk_type,
                refill_id: top.refill_id.clone(),
                probability: top.probability,
                severity: top.severity,
            });
        summary
    }
}

/// Orders drivers by weighted impact and takes the smallest prefix whose
/// share of the total reaches `cut`. Zero-impact drivers are dropped.
fn split_drivers(mut drivers: Vec<RiskDriver>, cut: f64) -> (Vec<RiskDriver>, Vec<RiskDriver>) {
    drivers.retain(|driver| driver.weighted_impact > 0.0);
    drivers.sort_by(|a, b| {
        b.weighted_impact
            .total_cmp(&a.weighted_impact)
            .then_with(|| a.kind.cmp(&b.kind))
    });
    let total: f64 = drivers.iter().map(|driver| driver.weighted_impact).sum();
    let mut covered = 0.0;
    let mut primary_len = 0;
    for driver in &drivers {
        if total > 0.0 && covered / total >= cut {
            break;
        }
        covered += driver.weighted_impact;
        primary_len += 1;
    }
    let secondary = drivers.split_off(primary_len);
    (drivers, secondary)
}

struct RecommendationTemplate {
    category: ActionCategory,
    title: &'static str,
    steps: &'static [&'static str],
}

fn template_for(kind: DriverKind) -> RecommendationTemplate {
    match kind {
        DriverKind::TimingMisalignment => RecommendationTemplate {
            category: ActionCategory::TimingOptimization,
            title: "Optimize Bundle Timing Alignment",
            steps: &[
                "Review refill due dates across the bundle",
                "Adjust the bundle formation window",
                "Coordinate fill timing with the dispensing pharmacy",
            ],
        },
        DriverKind::BundleFragmentation | DriverKind::InventoryFragmentation => {
            RecommendationTemplate {
                category: ActionCategory::BundleOptimization,
                title: "Address Bundle Fragmentation Risk",
                steps: &[
                    "Consolidate refills with divergent ship-by dates",
                    "Review bundle composition for split-prone items",
                ],
            }
        }
        DriverKind::StageAging | DriverKind::PaDelay => RecommendationTemplate {
            category: ActionCategory::ProcessOptimization,
            title: "Expedite Aging Refill Processing",
            steps: &[
                "Escalate refills waiting past their expected stage duration",
                "Follow up on outstanding prior authorizations",
            ],
        },
        DriverKind::RefillGapAnomaly => RecommendationTemplate {
            category: ActionCategory::MemberEngagement,
            title: "Address Refill Gap Anomaly",
            steps: &[
                "Contact the member to confirm therapy continuation",
                "Offer refill reminders or auto-refill enrollment",
            ],
        },
        DriverKind::SupplyBufferDepletion => RecommendationTemplate {
            category: ActionCategory::SupplyManagement,
            title: "Address Supply Buffer Depletion",
            steps: &[
                "Prioritize the refill ahead of the member's supply end date",
                "Consider an expedited or partial fill",
            ],
        },
        DriverKind::OosDisruption
        | DriverKind::SupplyChainDisruption
        | DriverKind::InventoryShortage => RecommendationTemplate {
            category: ActionCategory::SupplyManagement,
            title: "Resolve Inventory Disruption",
            steps: &[
                "Source the item from an alternate location or supplier",
                "Review therapeutic alternatives with the prescriber",
            ],
        },
        DriverKind::CarrierCapacity | DriverKind::GeographicDispersion | DriverKind::CarrierDelay => {
            RecommendationTemplate {
                category: ActionCategory::SplitMonitoring,
                title: "Monitor Shipment Execution",
                steps: &[
                    "Confirm carrier capacity for the bundle shipment",
                    "Track the shipment against its ship-by date",
                ],
            }
        }
    }
}

/// One recommendation per distinct template, in primary-driver order.
fn recommend(primary: &[RiskDriver], severity: Severity) -> Vec<Recommendation> {
    let priority = if severity >= Severity::High {
        Priority::High
    } else {
        Priority::Medium
    };
    let mut recommendations: Vec<Recommendation> = Vec::new();
    for driver in primary {
        let template = template_for(driver.kind);
        match recommendations
            .iter_mut()
            .find(|existing| existing.title == template.title)
        {
            Some(existing) => existing.mitigates.push(driver.kind),
            None => recommendations.push(Recommendation {
                category: template.category,
                priority,
                title: template.title.to_string(),
                action_steps: template.steps.iter().map(|step| step.to_string()).collect(),
                mitigates: vec![driver.kind],
            }),
        }
    }
    recommendations
}

fn estimated_timeframe(metrics: &BundleMetrics, risk_type: RiskType) -> String {
    let timeframe = match risk_type {
        RiskType::BundleBreak => match metrics.age_in_stage.days_in_current_stage {
            days if days > 14 => "2-4 weeks",
            days if days > 7 => "1-2 weeks",
            days if days > 3 => "1 week",
            _ => "3-7 days",
        },
        RiskType::Abandonment => match metrics.refill_gap.days_until_due {
            Some(days) if days < 0 => "Immediate (overdue)",
            Some(days) if days < 7 => "1 week",
            Some(days) if days < 14 => "1-2 weeks",
            Some(days) if days < 30 => "2-4 weeks",
            Some(_) => "1+ months",
            None => "Unknown",
        },
        RiskType::ShipmentSplit => "Next shipment",
        RiskType::FulfillmentDelay => {
            if metrics.fulfillment.carrier_delay.is_some_and(|delay| delay > 0.0) {
                "Immediate (past ship-by)"
            } else if metrics.fulfillment.oos_disruption > 0.0 {
                "1 week"
            } else {
                "1-2 weeks"
            }
        }
    };
    timeframe.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::fold_events;
    use crate::metrics::BundleMetricsEngine;
    use crate::models::{
        CanonicalEvent, EventDetails, EventType, PaStatus, PriorAuthDetails, RefillDetails,
    };
    use chrono::{Duration, TimeZone};

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 9, 0, 0).unwrap() + Duration::days(n)
    }

    fn event(id: &str, event_type: EventType, details: EventDetails) -> CanonicalEvent {
        CanonicalEvent {
            event_id: id.to_string(),
            event_type,
            source_system: "centersync".to_string(),
            member_id: "M00000001".to_string(),
            refill_id: "R00000001".to_string(),
            bundle_id: Some("B00000001".to_string()),
            event_timestamp: day(0),
            received_timestamp: day(0),
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

    fn metrics_for(events: &[CanonicalEvent], as_of: DateTime<Utc>) -> BundleMetrics {
        let snapshot = fold_events(events, as_of).unwrap();
        BundleMetricsEngine::default().compute(&snapshot, &[], as_of)
    }

    fn pa_pending_for_six_days() -> BundleMetrics {
        let submitted = event(
            "E00000001",
            EventType::PaSubmitted,
            EventDetails::PriorAuth(PriorAuthDetails {
                pa_status: PaStatus::Submitted,
                pa_type: None,
                pa_processing_days: None,
                pa_expiry_date: None,
            }),
        );
        metrics_for(&[submitted], day(6))
    }

    fn complete_refill(last_fill: i64, due: i64) -> BundleMetrics {
        let eligible = event(
            "E00000001",
            EventType::RefillEligible,
            EventDetails::Refill(RefillDetails {
                days_supply: Some(30),
                last_fill_date: Some(day(last_fill)),
                refill_due_date: Some(day(due)),
                ship_by_date: Some(day(due)),
                bundle_alignment_score: Some(0.9),
                ..RefillDetails::default()
            }),
        );
        metrics_for(&[eligible], day(0))
    }

    #[test]
    fn band_lower_bounds_are_closed() {
        let bands = SeverityBands::new(0.3, 0.6, 0.8);
        assert_eq!(bands.classify(0.29), Severity::Low);
        assert_eq!(bands.classify(0.3), Severity::Medium);
        assert_eq!(bands.classify(0.5999), Severity::Medium);
        assert_eq!(bands.classify(0.6), Severity::High);
        assert_eq!(bands.classify(0.8), Severity::Critical);
    }

    #[test]
    fn probability_on_a_threshold_takes_the_higher_band() {
        let mut config = ScoringConfig::default();
        config.weights.insert(
            RiskType::BundleBreak,
            BTreeMap::from([(DriverKind::StageAging, 1.0)]),
        );
        let engine = RiskScoringEngine::new(config);
        let metrics = pa_pending_for_six_days();
        assert_eq!(metrics.age_in_stage.aging_risk, 0.6);

        let assessment = engine.score(&metrics, RiskType::BundleBreak).unwrap();
        assert_eq!(assessment.probability, 0.6);
        assert_eq!(assessment.severity, Severity::High);
        assert_eq!(assessment.primary_drivers.len(), 1);
        assert_eq!(assessment.primary_drivers[0].kind, DriverKind::StageAging);
        assert_eq!(assessment.recommendations[0].priority, Priority::High);
    }

    #[test]
    fn metrics_without_snapshots_are_rejected() {
        let mut metrics = complete_refill(-20, 10);
        metrics.snapshot_ids.clear();
        let engine = RiskScoringEngine::default();
        assert!(matches!(
            engine.score(&metrics, RiskType::Abandonment),
            Err(PipelineError::InvalidMetricsInput(_))
        ));
    }

    #[test]
    fn missing_inputs_degrade_to_minimum_confidence() {
        let bare = event(
            "E00000001",
            EventType::RefillInitiated,
            EventDetails::Refill(RefillDetails::default()),
        );
        let metrics = metrics_for(&[bare], day(0));
        let engine = RiskScoringEngine::default();
        let assessment = engine.score(&metrics, RiskType::Abandonment).unwrap();
        assert!(assessment.degraded);
        assert_eq!(assessment.confidence, engine.config().min_confidence);
        assert!(assessment
            .missing_fields
            .contains(&MetricField::RefillGapAnomaly));
        assert_eq!(assessment.probability, 0.0);
        assert_eq!(assessment.severity, Severity::Low);
    }

    #[test]
    fn primary_drivers_cover_the_configured_share() {
        let metrics = complete_refill(-80, -50);
        let engine = RiskScoringEngine::default();
        let assessment = engine.score(&metrics, RiskType::Abandonment).unwrap();
        assert!(!assessment.degraded);
        assert!(assessment.probability > 0.5);

        let primary: f64 = assessment.primary_drivers.iter().map(|d| d.weighted_impact).sum();
        let secondary: f64 = assessment.secondary_drivers.iter().map(|d| d.weighted_impact).sum();
        assert!(primary / (primary + secondary) >= 0.7);
        assert!(assessment
            .secondary_drivers
            .iter()
            .all(|driver| driver.weighted_impact > 0.0));
        let ordered = assessment
            .primary_drivers
            .windows(2)
            .all(|pair| pair[0].weighted_impact >= pair[1].weighted_impact);
        assert!(ordered);
        assert_eq!(assessment.estimated_timeframe, "Immediate (overdue)");
        assert!(assessment
            .critical_factors
            .contains(&"Days since last fill".to_string()));
    }

    #[test]
    fn healthy_refill_scores_low_with_quiet_confidence() {
        let metrics = complete_refill(-20, 3);
        let engine = RiskScoringEngine::default();
        let assessment = engine.score(&metrics, RiskType::Abandonment).unwrap();
        assert_eq!(assessment.severity, Severity::Low);
        assert!(assessment.primary_drivers.is_empty());
        assert!(assessment.recommendations.is_empty());
        assert_eq!(assessment.confidence, 0.5);
    }

    #[test]
    fn scoring_is_deterministic_across_all_types() {
        let metrics = complete_refill(-80, -50);
        let engine = RiskScoringEngine::default();
        let first = engine.score_all(&metrics).unwrap();
        let second = engine.score_all(&metrics).unwrap();
        assert_eq!(first, second);
        let types: Vec<RiskType> = first.iter().map(|a| a.risk_type).collect();
        assert_eq!(types, RiskType::ALL.to_vec());
        let ids: BTreeSet<&str> = first.iter().map(|a| a.assessment_id.as_str()).collect();
        assert_eq!(ids.len(), 4);

        let summary = engine.summarize(&first);
        assert_eq!(summary.total, 4);
        assert_eq!(
            summary.highest.map(|top| top.risk_type),
            Some(RiskType::Abandonment)
        );
    }

    #[test]
    fn default_config_is_valid_and_bad_bands_are_rejected() {
        assert!(ScoringConfig::default().validate().is_ok());
        let mut config = ScoringConfig::default();
        config
            .bands
            .insert(RiskType::ShipmentSplit, SeverityBands::new(0.5, 0.4, 0.7));
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }
}
