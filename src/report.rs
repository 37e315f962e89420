use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::explain::BundleRiskExplanation;
use crate::pipeline::PipelineOutput;
use crate::scoring::{RiskAssessment, Severity};

/// Assessments ordered by probability, highest first. Ties go to the
/// higher severity, then to the assessment id.
pub fn rank_assessments(output: &PipelineOutput) -> Vec<&RiskAssessment> {
    let mut ranked: Vec<&RiskAssessment> = output.assessments.iter().collect();
    ranked.sort_by(|a, b| {
        b.probability
            .total_cmp(&a.probability)
            .then_with(|| b.severity.cmp(&a.severity))
            .then_with(|| a.assessment_id.cmp(&b.assessment_id))
    });
    ranked
}

fn explanation_for<'a>(
    output: &'a PipelineOutput,
    assessment: &RiskAssessment,
) -> Option<&'a BundleRiskExplanation> {
    output
        .explanations
        .iter()
        .find(|explanation| explanation.assessment_id == assessment.assessment_id)
}

pub fn build_report(
    scope: Option<&str>,
    since: DateTime<Utc>,
    output: &PipelineOutput,
    limit: usize,
) -> String {
    let mut report = String::new();
    let scope_label = scope.unwrap_or("all bundles");

    let _ = writeln!(report, "# Refill Bundle Risk Report");
    let _ = writeln!(
        report,
        "Generated for {} (records since {}, evaluated as of {})",
        scope_label,
        since.format("%Y-%m-%d"),
        output.as_of.to_rfc3339()
    );
    let _ = writeln!(report);
    let _ = writeln!(report, "## Pipeline Summary");
    let _ = writeln!(
        report,
        "- {} refills across {} bundles",
        output.snapshots.len(),
        output.bundles.len()
    );
    let _ = writeln!(
        report,
        "- {} assessments, {} degraded by missing data",
        output.assessment_summary.total, output.assessment_summary.degraded
    );
    let _ = writeln!(
        report,
        "- average bundle health {:.2}, {} refills aging in stage",
        output.metrics_summary.average_health, output.metrics_summary.aging_count
    );
    let _ = writeln!(
        report,
        "- {} records rejected, {} flagged for mapping review",
        output.rejected.len(),
        output.review.len()
    );

    let _ = writeln!(report);
    let _ = writeln!(report, "## Severity Mix");
    if output.assessments.is_empty() {
        let _ = writeln!(report, "No assessments produced for this window.");
    } else {
        for severity in [
            Severity::Critical,
            Severity::High,
            Severity::Medium,
            Severity::Low,
        ] {
            let count = output
                .assessment_summary
                .by_severity
                .get(&severity)
                .copied()
                .unwrap_or(0);
            let _ = writeln!(report, "- {severity}: {count}");
        }
    }

    let ranked = rank_assessments(output);
    let _ = writeln!(report);
    let _ = writeln!(report, "## Highest Risk Refills");
    if ranked.is_empty() {
        let _ = writeln!(report, "No refills with activity in this window.");
    } else {
        for assessment in ranked.iter().take(limit) {
            let _ = writeln!(
                report,
                "- {} ({}) {} {} at {:.0}% (confidence {:.0}%{})",
                assessment.refill_id,
                assessment.bundle_id.as_deref().unwrap_or("unbundled"),
                assessment.risk_type,
                assessment.severity,
                assessment.probability * 100.0,
                assessment.confidence * 100.0,
                if assessment.degraded { ", degraded" } else { "" }
            );
            if let Some(explanation) = explanation_for(output, assessment) {
                let _ = writeln!(report, "  - {}", explanation.executive_summary);
                for recommendation in &explanation.recommendations {
                    let _ = writeln!(
                        report,
                        "  - Recommended: {}. {}",
                        recommendation.title, recommendation.rationale
                    );
                }
            }
        }
    }

    let _ = writeln!(report);
    let _ = writeln!(report, "## Bundle Risk Factors");
    let flagged: Vec<_> = output
        .bundles
        .iter()
        .filter(|bundle| !bundle.risk_factors.is_empty())
        .collect();
    if flagged.is_empty() {
        let _ = writeln!(report, "No bundle-level risk factors.");
    } else {
        for bundle in flagged {
            let factors: Vec<&str> = bundle.risk_factors.iter().map(|f| f.as_str()).collect();
            let _ = writeln!(
                report,
                "- {} ({} members, {} refills): {}",
                bundle.bundle_id,
                bundle.member_count(),
                bundle.refill_count(),
                factors.join(", ")
            );
        }
    }

    if !output.review.is_empty() {
        let _ = writeln!(report);
        let _ = writeln!(report, "## Mapping Review");
        for item in &output.review {
            let _ = writeln!(
                report,
                "- {} {}:{}{}",
                item.source_key,
                item.source_system,
                item.source_status,
                if item.ambiguous { " (ambiguous)" } else { "" }
            );
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::models::SourceRecord;
    use crate::pipeline::RefillRiskPipeline;
    use chrono::TimeZone;

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 10, 9, 0, 0).unwrap()
    }

    fn output(records: &[SourceRecord]) -> PipelineOutput {
        RefillRiskPipeline::new(PipelineConfig::default())
            .unwrap()
            .run(records, as_of())
            .unwrap()
    }

    #[test]
    fn empty_window_reports_placeholders() {
        let report = build_report(None, as_of(), &output(&[]), 10);
        assert!(report.starts_with("# Refill Bundle Risk Report"));
        assert!(report.contains("Generated for all bundles"));
        assert!(report.contains("No assessments produced for this window."));
        assert!(report.contains("No refills with activity in this window."));
        assert!(!report.contains("## Mapping Review"));
    }

    #[test]
    fn lists_ranked_refills_with_explanations() {
        let records = vec![
            SourceRecord {
                source_key: "SRC00000001".to_string(),
                source_system: "centersync".to_string(),
                source_status: "PENDING".to_string(),
                member_id: "M00000001".to_string(),
                refill_id: "R00000001".to_string(),
                bundle_id: Some("B00000001".to_string()),
                event_timestamp: "2026-01-10T09:00:00Z".to_string(),
                days_supply: Some(30),
                quantity: Some(30.0),
                last_fill_date: Some("2025-11-01T09:00:00Z".to_string()),
                refill_due_date: Some("2025-12-01T09:00:00Z".to_string()),
                ..SourceRecord::default()
            },
            SourceRecord {
                source_key: "SRC00000002".to_string(),
                source_system: "centersync".to_string(),
                source_status: "AWAITING_SOMETHING".to_string(),
                member_id: "M00000001".to_string(),
                refill_id: "R00000001".to_string(),
                bundle_id: Some("B00000001".to_string()),
                event_timestamp: "2026-01-11T09:00:00Z".to_string(),
                ..SourceRecord::default()
            },
        ];
        let output = output(&records);
        let report = build_report(Some("B00000001"), as_of(), &output, 2);

        assert!(report.contains("Generated for B00000001"));
        assert!(report.contains("- 1 refills across 1 bundles"));
        let ranked = rank_assessments(&output);
        assert_eq!(ranked.len(), 4);
        assert!(ranked
            .windows(2)
            .all(|pair| pair[0].probability >= pair[1].probability));
        assert!(report.contains(&format!("- R00000001 (B00000001) {}", ranked[0].risk_type)));
        assert!(report.contains("## Mapping Review"));
        assert!(report.contains("SRC00000002 centersync:AWAITING_SOMETHING"));
    }
}
