//! Batch wiring of the six stages, source record to explanation.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::aggregation::{RefillSnapshot, SnapshotAggregator};
use crate::config::PipelineConfig;
use crate::detector::{BundleContext, BundleDetector};
use crate::error::{PipelineError, Result};
use crate::explain::{BundleRiskExplanation, ExplainabilityEngine};
use crate::mapping::StatusMapper;
use crate::metrics::{BundleMetrics, BundleMetricsEngine, MetricsSummary};
use crate::models::{CanonicalEvent, SourceRecord};
use crate::scoring::{AssessmentSummary, RiskAssessment, RiskScoringEngine};

/// A source record that failed identity or timestamp checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRecord {
    pub source_key: String,
    pub reason: String,
}

/// A mapped record the mapper flagged for a human to look at.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewItem {
    pub source_key: String,
    pub source_system: String,
    pub source_status: String,
    pub ambiguous: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Ingested {
    pub events: Vec<CanonicalEvent>,
    pub rejected: Vec<RejectedRecord>,
    pub review: Vec<ReviewItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineOutput {
    pub as_of: DateTime<Utc>,
    pub rejected: Vec<RejectedRecord>,
    pub review: Vec<ReviewItem>,
    pub bundles: Vec<BundleContext>,
    pub snapshots: Vec<RefillSnapshot>,
    pub metrics: Vec<BundleMetrics>,
    pub assessments: Vec<RiskAssessment>,
    pub explanations: Vec<BundleRiskExplanation>,
    pub metrics_summary: MetricsSummary,
    pub assessment_summary: AssessmentSummary,
    pub retired_bundles: usize,
}

pub struct RefillRiskPipeline {
    config: PipelineConfig,
    mapper: StatusMapper,
    detector: BundleDetector,
    aggregator: SnapshotAggregator,
    metrics: BundleMetricsEngine,
    scoring: RiskScoringEngine,
    explain: ExplainabilityEngine,
}

impl RefillRiskPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Self::with_mapper(config, StatusMapper::with_default_rules())
    }

    pub fn with_mapper(config: PipelineConfig, mapper: StatusMapper) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            detector: BundleDetector::new(config.detector.clone()),
            aggregator: SnapshotAggregator::new(),
            metrics: BundleMetricsEngine::new(config.metrics.clone()),
            scoring: RiskScoringEngine::new(config.scoring.clone()),
            explain: ExplainabilityEngine::new(config.explain.clone()),
            mapper,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn mapper(&self) -> &StatusMapper {
        &self.mapper
    }

    pub fn detector(&self) -> &BundleDetector {
        &self.detector
    }

    pub fn aggregator(&self) -> &SnapshotAggregator {
        &self.aggregator
    }

    /// Canonicalize records in arrival order. Records with bad identity or
    /// time fields are set aside; a record no rule can map is fatal.
    pub fn ingest(&self, records: &[SourceRecord]) -> Result<Ingested> {
        let mut ingested = Ingested::default();
        for record in records {
            match self.mapper.canonicalize(record) {
                Ok((event, mapping)) => {
                    if mapping.requires_manual_review || mapping.ambiguous {
                        ingested.review.push(ReviewItem {
                            source_key: record.source_key.clone(),
                            source_system: record.source_system.clone(),
                            source_status: record.source_status.clone(),
                            ambiguous: mapping.ambiguous,
                            warnings: mapping.warnings,
                        });
                    }
                    ingested.events.push(event);
                }
                Err(err @ PipelineError::UnmappableStatus { .. }) => return Err(err),
                Err(err) => {
                    warn!(source_key = %record.source_key, %err, "source record rejected");
                    ingested.rejected.push(RejectedRecord {
                        source_key: record.source_key.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(ingested)
    }

    pub fn run(&self, records: &[SourceRecord], as_of: DateTime<Utc>) -> Result<PipelineOutput> {
        let ingested = self.ingest(records)?;
        let mut output = self.assess_events(&ingested.events, as_of)?;
        output.rejected = ingested.rejected;
        output.review = ingested.review;
        Ok(output)
    }

    /// Detect bundles, aggregate, measure, score and explain already
    /// canonical events. Events are taken in arrival order.
    pub fn assess_events(
        &self,
        events: &[CanonicalEvent],
        as_of: DateTime<Utc>,
    ) -> Result<PipelineOutput> {
        let mut by_refill: BTreeMap<&str, Vec<CanonicalEvent>> = BTreeMap::new();
        let mut resolved: BTreeMap<String, String> = BTreeMap::new();
        for event in events {
            let context = self.detector.resolve_bundle(event);
            resolved.insert(event.refill_id.clone(), context.bundle_id);
            by_refill
                .entry(event.refill_id.as_str())
                .or_default()
                .push(event.clone());
        }

        let snapshots = by_refill
            .values()
            .map(|history| self.aggregator.aggregate(history, as_of))
            .collect::<Result<Vec<_>>>()?;

        let bundle_of = |snapshot: &RefillSnapshot| -> Option<String> {
            snapshot
                .bundle_id
                .clone()
                .or_else(|| resolved.get(&snapshot.refill_id).cloned())
        };
        let mut groups: BTreeMap<String, Vec<RefillSnapshot>> = BTreeMap::new();
        for snapshot in &snapshots {
            if let Some(bundle_id) = bundle_of(snapshot) {
                groups.entry(bundle_id).or_default().push(snapshot.clone());
            }
        }

        let mut metrics = Vec::with_capacity(snapshots.len());
        for snapshot in &snapshots {
            let bundle_id = bundle_of(snapshot);
            let peers = bundle_id
                .as_ref()
                .and_then(|bundle_id| groups.get(bundle_id))
                .map(Vec::as_slice)
                .unwrap_or_default();
            let mut computed = self.metrics.compute(snapshot, peers, as_of);
            if computed.bundle_id.is_none() {
                computed.bundle_id = bundle_id;
            }
            metrics.push(computed);
        }

        let mut assessments = Vec::with_capacity(metrics.len() * 4);
        let mut explanations = Vec::with_capacity(metrics.len() * 4);
        for item in &metrics {
            for assessment in self.scoring.score_all(item)? {
                explanations.push(self.explain.explain(&assessment, item)?);
                assessments.push(assessment);
            }
        }

        let mut bundles: Vec<BundleContext> = groups
            .keys()
            .filter_map(|bundle_id| {
                self.detector.analyze_risks(bundle_id, as_of)?;
                self.detector.get(bundle_id)
            })
            .collect();
        bundles.sort_by(|a, b| a.bundle_id.cmp(&b.bundle_id));
        let retired_bundles = self.detector.retire_completed(
            as_of,
            Duration::hours(self.config.detector.retire_after_hours),
        );

        let metrics_summary = self.metrics.summarize(&metrics);
        let assessment_summary = self.scoring.summarize(&assessments);
        info!(
            events = events.len(),
            refills = snapshots.len(),
            bundles = bundles.len(),
            assessments = assessments.len(),
            degraded = assessment_summary.degraded,
            "pipeline run complete"
        );

        Ok(PipelineOutput {
            as_of,
            rejected: Vec::new(),
            review: Vec::new(),
            bundles,
            snapshots,
            metrics,
            assessments,
            explanations,
            metrics_summary,
            assessment_summary,
            retired_bundles,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::SnapshotStage;
    use crate::scoring::RiskType;
    use chrono::TimeZone;

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 12, 9, 0, 0).unwrap()
    }

    fn record(key: &str, status: &str, refill: &str, member: &str, at: &str) -> SourceRecord {
        SourceRecord {
            source_key: key.to_string(),
            source_system: "centersync".to_string(),
            source_status: status.to_string(),
            member_id: member.to_string(),
            refill_id: refill.to_string(),
            bundle_id: Some("B00000001".to_string()),
            event_timestamp: at.to_string(),
            days_supply: Some(30),
            quantity: Some(30.0),
            last_fill_date: Some("2026-09-20T09:00:00Z".to_string()),
            refill_due_date: Some("2026-10-20T09:00:00Z".to_string()),
            ..SourceRecord::default()
        }
    }

    fn batch() -> Vec<SourceRecord> {
        let mut late = record(
            "SRC00000004",
            "ELIGIBLE_FOR_BUNDLING",
            "R00000002",
            "M00000002",
            "2026-10-02T10:00:00Z",
        );
        late.ship_by_date = Some("2026-10-30T09:00:00Z".to_string());
        vec![
            record("SRC00000001", "PENDING", "R00000001", "M00000001", "2026-10-01T09:00:00Z"),
            record("SRC00000002", "ELIGIBLE_FOR_BUNDLING", "R00000001", "M00000001", "2026-10-02T09:00:00Z"),
            record("SRC00000003", "PENDING", "R00000002", "M00000002", "2026-10-01T09:30:00Z"),
            late,
            record("bad", "PENDING", "R00000003", "M00000003", "2026-10-01T09:00:00Z"),
        ]
    }

    #[test]
    fn runs_every_stage_and_sets_aside_bad_records() {
        let pipeline = RefillRiskPipeline::new(PipelineConfig::default()).unwrap();
        let output = pipeline.run(&batch(), as_of()).unwrap();

        assert_eq!(output.rejected.len(), 1);
        assert_eq!(output.rejected[0].source_key, "bad");
        assert_eq!(output.snapshots.len(), 2);
        assert!(output
            .snapshots
            .iter()
            .all(|snapshot| snapshot.current_stage == SnapshotStage::Eligible));
        assert_eq!(output.metrics.len(), 2);
        assert!(output.metrics.iter().all(|m| m.snapshot_ids.len() == 2));
        assert_eq!(output.assessments.len(), 8);
        assert_eq!(output.explanations.len(), 8);
        assert_eq!(output.bundles.len(), 1);
        assert_eq!(output.bundles[0].refill_count(), 2);
        assert_eq!(output.assessment_summary.by_type[&RiskType::ShipmentSplit], 2);
    }

    #[test]
    fn identical_runs_yield_identical_artifacts() {
        let first = RefillRiskPipeline::new(PipelineConfig::default())
            .unwrap()
            .run(&batch(), as_of())
            .unwrap();
        let second = RefillRiskPipeline::new(PipelineConfig::default())
            .unwrap()
            .run(&batch(), as_of())
            .unwrap();
        assert_eq!(first.assessments, second.assessments);
        assert_eq!(first.explanations, second.explanations);
    }

    #[test]
    fn unbundled_events_are_grouped_through_inference() {
        let mut records = batch();
        records.truncate(4);
        for record in &mut records {
            record.bundle_id = None;
        }
        let pipeline = RefillRiskPipeline::new(PipelineConfig::default()).unwrap();
        let output = pipeline.run(&records, as_of()).unwrap();

        assert_eq!(output.bundles.len(), 1);
        assert!(output.bundles[0].inferred);
        let bundle_id = &output.bundles[0].bundle_id;
        assert!(output
            .metrics
            .iter()
            .all(|m| m.bundle_id.as_ref() == Some(bundle_id) && m.snapshot_ids.len() == 2));
    }
}
