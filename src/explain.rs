//! Narrative explanations for scored risks.
//!
//! An explanation never rescales the assessment. It re-ranks the drivers,
//! attaches evidence, composes text from a fixed template table and grades
//! how much of the expected evidence was actually available.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::metrics::{ActionCategory, BundleMetrics};
use crate::models::artifact_id;
use crate::scoring::{
    DriverKind, Evidence, Priority, RiskAssessment, RiskDriver, RiskType, Severity,
};

pub const EXPLANATION_VERSION: &str = "bundle-explain-v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplainConfig {
    pub primary_weight: f64,
    pub evidence_weight: f64,
    /// Upper bound on key takeaways; at least three are always produced.
    pub max_takeaways: usize,
    pub explanation_version: String,
}

impl Default for ExplainConfig {
    fn default() -> Self {
        Self {
            primary_weight: 0.6,
            evidence_weight: 0.4,
            max_takeaways: 5,
            explanation_version: EXPLANATION_VERSION.to_string(),
        }
    }
}

impl ExplainConfig {
    pub fn validate(&self) -> Result<()> {
        let weights = [self.primary_weight, self.evidence_weight];
        if weights.iter().any(|w| w.is_nan() || *w < 0.0)
            || (self.primary_weight + self.evidence_weight - 1.0).abs() > 1e-9
        {
            return Err(PipelineError::InvalidConfig(
                "explanation confidence weights must be non-negative and sum to 1".to_string(),
            ));
        }
        if !(3..=10).contains(&self.max_takeaways) {
            return Err(PipelineError::InvalidConfig(format!(
                "max_takeaways must lie within 3..=10, got {}",
                self.max_takeaways
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactLevel {
    Negligible,
    Low,
    Medium,
    High,
    Critical,
}

impl ImpactLevel {
    pub fn from_impact(impact: f64) -> Self {
        if impact >= 0.8 {
            ImpactLevel::Critical
        } else if impact >= 0.6 {
            ImpactLevel::High
        } else if impact >= 0.4 {
            ImpactLevel::Medium
        } else if impact >= 0.2 {
            ImpactLevel::Low
        } else {
            ImpactLevel::Negligible
        }
    }
}

impl fmt::Display for ImpactLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImpactLevel::Negligible => "negligible",
            ImpactLevel::Low => "low",
            ImpactLevel::Medium => "medium",
            ImpactLevel::High => "high",
            ImpactLevel::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverNarrative {
    pub rank: usize,
    pub kind: DriverKind,
    pub primary: bool,
    pub impact: f64,
    pub confidence: f64,
    /// `impact * confidence`, the ranking key.
    pub strength: f64,
    pub impact_level: ImpactLevel,
    pub narrative: String,
    pub evidence: Evidence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationRationale {
    pub title: String,
    pub category: ActionCategory,
    pub priority: Priority,
    pub mitigates: Vec<DriverKind>,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleRiskExplanation {
    pub explanation_id: String,
    pub assessment_id: String,
    pub metrics_id: String,
    pub risk_type: RiskType,
    pub severity: Severity,
    pub probability: f64,
    pub executive_summary: String,
    pub key_takeaways: Vec<String>,
    pub drivers: Vec<DriverNarrative>,
    pub recommendations: Vec<RecommendationRationale>,
    pub evidence_completeness: f64,
    pub confidence: f64,
    pub degraded: bool,
    pub explanation_version: String,
    pub model_version: String,
}

fn subject(kind: DriverKind) -> &'static str {
    match kind {
        DriverKind::TimingMisalignment => "Timing misalignment across the bundle",
        DriverKind::BundleFragmentation => "Spread between refill ship-by dates",
        DriverKind::StageAging => "Time spent in the current processing stage",
        DriverKind::PaDelay => "Prior authorization turnaround",
        DriverKind::RefillGapAnomaly => "The gap since the last fill",
        DriverKind::SupplyBufferDepletion => "The member's remaining supply buffer",
        DriverKind::OosDisruption => "An open out-of-stock event",
        DriverKind::InventoryFragmentation => "Inventory spread across the bundle",
        DriverKind::CarrierCapacity => "The number of refills per shipment",
        DriverKind::GeographicDispersion => "The number of members sharing the bundle",
        DriverKind::SupplyChainDisruption => "Supply chain disruption",
        DriverKind::InventoryShortage => "The share of bundle items out of stock",
        DriverKind::CarrierDelay => "Carrier progress against the ship-by date",
    }
}

fn verdict(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "is driving a critical",
        Severity::High => "is a major contributor to a high",
        Severity::Medium => "contributes to a moderate",
        Severity::Low => "adds slightly to a low",
    }
}

/// Narrative line for one driver, keyed by driver kind and assessment severity.
fn narrate(driver: &RiskDriver, severity: Severity, risk_type: RiskType) -> String {
    let mut line = format!(
        "{} {} {} risk",
        subject(driver.kind),
        verdict(severity),
        risk_type.label()
    );
    match (driver.evidence.value, driver.evidence.delta) {
        (Some(value), Some(delta)) if delta >= 0.0 => line.push_str(&format!(
            " ({value:.2}, {delta:.2} above the {:.2} threshold).",
            driver.evidence.threshold
        )),
        (Some(value), Some(delta)) => line.push_str(&format!(
            " ({value:.2}, {:.2} below the {:.2} threshold).",
            -delta, driver.evidence.threshold
        )),
        _ => line.push_str(" (measurement unavailable)."),
    }
    line
}

fn percent(value: f64) -> String {
    format!("{:.0}%", value * 100.0)
}

#[derive(Debug, Clone, Default)]
pub struct ExplainabilityEngine {
    config: ExplainConfig,
}

impl ExplainabilityEngine {
    pub fn new(config: ExplainConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExplainConfig {
        &self.config
    }

    pub fn explain(
        &self,
        assessment: &RiskAssessment,
        metrics: &BundleMetrics,
    ) -> Result<BundleRiskExplanation> {
        if assessment.metrics_id != metrics.metrics_id {
            return Err(PipelineError::InvalidMetricsInput(format!(
                "assessment {} was computed from metrics {}, not {}",
                assessment.assessment_id, assessment.metrics_id, metrics.metrics_id
            )));
        }
        let config = &self.config;
        let risk_type = assessment.risk_type;
        let severity = assessment.severity;

        let mut ranked: Vec<(bool, &RiskDriver)> = assessment
            .primary_drivers
            .iter()
            .map(|driver| (true, driver))
            .chain(assessment.secondary_drivers.iter().map(|driver| (false, driver)))
            .collect();
        ranked.sort_by(|(_, a), (_, b)| {
            (b.impact * b.confidence)
                .total_cmp(&(a.impact * a.confidence))
                .then_with(|| a.kind.cmp(&b.kind))
        });
        let drivers: Vec<DriverNarrative> = ranked
            .into_iter()
            .enumerate()
            .map(|(index, (primary, driver))| DriverNarrative {
                rank: index + 1,
                kind: driver.kind,
                primary,
                impact: driver.impact,
                confidence: driver.confidence,
                strength: driver.impact * driver.confidence,
                impact_level: ImpactLevel::from_impact(driver.impact),
                narrative: narrate(driver, severity, risk_type),
                evidence: driver.evidence.clone(),
            })
            .collect();

        let expected = risk_type.drivers();
        let present = expected
            .iter()
            .filter(|kind| metrics.field_value(kind.field()).is_some())
            .count();
        let evidence_completeness = if expected.is_empty() {
            0.0
        } else {
            present as f64 / expected.len() as f64
        };

        let primary_confidence = if assessment.primary_drivers.is_empty() {
            assessment.confidence
        } else {
            assessment
                .primary_drivers
                .iter()
                .map(|driver| driver.confidence)
                .sum::<f64>()
                / assessment.primary_drivers.len() as f64
        };
        let confidence = (config.primary_weight * primary_confidence
            + config.evidence_weight * evidence_completeness)
            .clamp(0.0, 1.0);

        let executive_summary = self.summary(assessment, &drivers);
        let key_takeaways =
            self.takeaways(assessment, &drivers, confidence, evidence_completeness);
        let recommendations = assessment
            .recommendations
            .iter()
            .map(|recommendation| {
                let lead = drivers
                    .iter()
                    .find(|driver| recommendation.mitigates.contains(&driver.kind));
                let names: Vec<&str> = recommendation
                    .mitigates
                    .iter()
                    .map(|kind| kind.as_str())
                    .collect();
                let rationale = match lead {
                    Some(lead) => format!(
                        "Targets {} (rank {}, {} impact).",
                        names.join(", "),
                        lead.rank,
                        lead.impact_level
                    ),
                    None => format!("Targets {}.", names.join(", ")),
                };
                RecommendationRationale {
                    title: recommendation.title.clone(),
                    category: recommendation.category,
                    priority: recommendation.priority,
                    mitigates: recommendation.mitigates.clone(),
                    rationale,
                }
            })
            .collect();

        let explanation_id = artifact_id(
            "explanation",
            &[
                assessment.assessment_id.as_str(),
                metrics.metrics_id.as_str(),
                config.explanation_version.as_str(),
            ],
        )
        .to_string();
        debug!(
            explanation_id = %explanation_id,
            assessment_id = %assessment.assessment_id,
            confidence,
            "explained"
        );

        Ok(BundleRiskExplanation {
            explanation_id,
            assessment_id: assessment.assessment_id.clone(),
            metrics_id: metrics.metrics_id.clone(),
            risk_type,
            severity,
            probability: assessment.probability,
            executive_summary,
            key_takeaways,
            drivers,
            recommendations,
            evidence_completeness,
            confidence,
            degraded: assessment.degraded,
            explanation_version: config.explanation_version.clone(),
            model_version: assessment.model_version.clone(),
        })
    }

    fn summary(&self, assessment: &RiskAssessment, drivers: &[DriverNarrative]) -> String {
        let scope = match &assessment.bundle_id {
            Some(bundle_id) => format!("refill {} in bundle {bundle_id}", assessment.refill_id),
            None => format!("refill {}", assessment.refill_id),
        };
        let mut summary = format!(
            "{} {} risk ({}) for {scope}.",
            capitalize(assessment.severity.as_str()),
            assessment.risk_type.label(),
            percent(assessment.probability),
        );
        let leads: Vec<String> = drivers
            .iter()
            .filter(|driver| driver.primary)
            .take(2)
            .map(|driver| subject(driver.kind).to_lowercase())
            .collect();
        match leads.as_slice() {
            [] => summary.push_str(" No significant risk drivers were detected."),
            [only] => summary.push_str(&format!(" Driven mainly by {only}.")),
            [first, second, ..] => {
                summary.push_str(&format!(" Driven mainly by {first} and {second}."))
            }
        }
        if assessment.degraded {
            summary.push_str(" Based on incomplete data.");
        }
        summary
    }

    fn takeaways(
        &self,
        assessment: &RiskAssessment,
        drivers: &[DriverNarrative],
        confidence: f64,
        completeness: f64,
    ) -> Vec<String> {
        let max = self.config.max_takeaways.max(3);
        let mut takeaways: Vec<String> = drivers
            .iter()
            .take(max - 2)
            .map(|driver| driver.narrative.clone())
            .collect();
        if takeaways.is_empty() {
            takeaways.push(format!(
                "{} probability is {}, within the {} band.",
                capitalize(assessment.risk_type.label()),
                percent(assessment.probability),
                assessment.severity
            ));
        }
        takeaways.push(format!(
            "Estimated timeframe: {}.",
            assessment.estimated_timeframe
        ));
        takeaways.push(format!(
            "Confidence {} with {} of expected evidence available.",
            percent(confidence),
            percent(completeness)
        ));
        takeaways.truncate(max);
        takeaways
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
