//! Source status → canonical event mapping.
//!
//! Rules are kept in registration order. Every matching rule is collected and
//! the highest confidence wins; ties go to the earliest registered rule and
//! mark the result ambiguous. A low-confidence catch-all is consulted only
//! when no specific rule applies.

use std::collections::{BTreeMap, HashSet};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::models::{
    BundleDetails, CanonicalEvent, EventCategory, EventDetails, EventType, OutOfStockDetails,
    PaStatus, PriorAuthDetails, RefillDetails, RefillStatus, SourceRecord,
};
use crate::validation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingConfidence {
    Low,
    Medium,
    High,
}

impl MappingConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingConfidence::Low => "low",
            MappingConfidence::Medium => "medium",
            MappingConfidence::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operator", content = "value", rename_all = "snake_case")]
pub enum Comparison {
    Equals(Value),
    Contains(String),
    In(Vec<Value>),
    GreaterThan(f64),
    LessThan(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub comparison: Comparison,
}

impl Condition {
    pub fn new(field: impl Into<String>, comparison: Comparison) -> Self {
        Self {
            field: field.into(),
            comparison,
        }
    }

    /// A missing field never satisfies a condition.
    pub fn holds(&self, context: &Map<String, Value>) -> bool {
        let Some(actual) = context.get(&self.field) else {
            return false;
        };
        if actual.is_null() {
            return false;
        }
        match &self.comparison {
            Comparison::Equals(expected) => actual == expected,
            Comparison::Contains(needle) => match actual {
                Value::String(text) => text.contains(needle.as_str()),
                other => other.to_string().contains(needle.as_str()),
            },
            Comparison::In(options) => options.contains(actual),
            Comparison::GreaterThan(bound) => actual.as_f64().is_some_and(|v| v > *bound),
            Comparison::LessThan(bound) => actual.as_f64().is_some_and(|v| v < *bound),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StatusMatcher {
    Exact(String),
    Pattern(Regex),
    Conditional {
        status: String,
        conditions: Vec<Condition>,
    },
    Any,
}

impl StatusMatcher {
    fn matches(&self, source_status: &str, context: &Map<String, Value>) -> bool {
        match self {
            StatusMatcher::Exact(status) => status.eq_ignore_ascii_case(source_status),
            StatusMatcher::Pattern(pattern) => pattern.is_match(source_status),
            StatusMatcher::Conditional { status, conditions } => {
                status.eq_ignore_ascii_case(source_status)
                    && conditions.iter().all(|condition| condition.holds(context))
            }
            StatusMatcher::Any => true,
        }
    }

    fn describe(&self) -> String {
        match self {
            StatusMatcher::Exact(status) => status.clone(),
            StatusMatcher::Pattern(pattern) => format!("regex:{}", pattern.as_str()),
            StatusMatcher::Conditional { status, .. } => status.clone(),
            StatusMatcher::Any => "*".to_string(),
        }
    }

    fn tier(&self) -> &'static str {
        match self {
            StatusMatcher::Exact(_) => "exact",
            StatusMatcher::Pattern(_) => "regex",
            StatusMatcher::Conditional { .. } => "conditional",
            StatusMatcher::Any => "catch_all",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MappingRule {
    /// `None` matches every source system.
    pub source_system: Option<String>,
    pub matcher: StatusMatcher,
    pub event_type: EventType,
    pub canonical_status: Option<String>,
    pub confidence: MappingConfidence,
    pub description: String,
    pub bundle_hints: Map<String, Value>,
}

impl MappingRule {
    pub fn exact(
        source_system: &str,
        status: &str,
        event_type: EventType,
        canonical_status: Option<&str>,
        confidence: MappingConfidence,
        description: &str,
    ) -> Self {
        Self {
            source_system: Some(source_system.to_string()),
            matcher: StatusMatcher::Exact(status.to_string()),
            event_type,
            canonical_status: canonical_status.map(str::to_string),
            confidence,
            description: description.to_string(),
            bundle_hints: Map::new(),
        }
    }

    /// Case-insensitive pattern anchored at the start of the status.
    pub fn pattern(
        source_system: &str,
        pattern: &str,
        event_type: EventType,
        canonical_status: Option<&str>,
        confidence: MappingConfidence,
        description: &str,
    ) -> Result<Self> {
        let regex = Regex::new(&format!("(?i)^(?:{pattern})")).map_err(|err| {
            PipelineError::InvalidConfig(format!("bad status pattern {pattern:?}: {err}"))
        })?;
        Ok(Self {
            source_system: Some(source_system.to_string()),
            matcher: StatusMatcher::Pattern(regex),
            event_type,
            canonical_status: canonical_status.map(str::to_string),
            confidence,
            description: description.to_string(),
            bundle_hints: Map::new(),
        })
    }

    pub fn conditional(
        source_system: &str,
        status: &str,
        conditions: Vec<Condition>,
        event_type: EventType,
        canonical_status: Option<&str>,
        confidence: MappingConfidence,
        description: &str,
    ) -> Self {
        Self {
            source_system: Some(source_system.to_string()),
            matcher: StatusMatcher::Conditional {
                status: status.to_string(),
                conditions,
            },
            event_type,
            canonical_status: canonical_status.map(str::to_string),
            confidence,
            description: description.to_string(),
            bundle_hints: Map::new(),
        }
    }

    pub fn catch_all() -> Self {
        Self {
            source_system: None,
            matcher: StatusMatcher::Any,
            event_type: EventType::RefillInitiated,
            canonical_status: Some(RefillStatus::Pending.as_str().to_string()),
            confidence: MappingConfidence::Low,
            description: "Unrecognized status (catch-all)".to_string(),
            bundle_hints: Map::new(),
        }
    }

    pub fn with_hint(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.bundle_hints.insert(key.to_string(), value.into());
        self
    }

    fn applies(&self, source_system: &str, source_status: &str, context: &Map<String, Value>) -> bool {
        let system_matches = self
            .source_system
            .as_deref()
            .map_or(true, |system| system.eq_ignore_ascii_case(source_system));
        system_matches && self.matcher.matches(source_status, context)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRef {
    /// Registration index, or `None` for the catch-all.
    pub index: Option<usize>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingResult {
    pub rule: RuleRef,
    pub event_type: EventType,
    pub canonical_status: Option<String>,
    pub confidence: MappingConfidence,
    pub ambiguous: bool,
    pub requires_manual_review: bool,
    pub warnings: Vec<String>,
    pub bundle_context: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MappingStatistics {
    pub total_rules: usize,
    pub rules_by_source: BTreeMap<String, usize>,
    pub rules_by_confidence: BTreeMap<MappingConfidence, usize>,
    pub rules_by_event_type: BTreeMap<EventType, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleExport {
    pub index: usize,
    pub source_system: String,
    pub tier: &'static str,
    pub source_status: String,
    pub event_type: EventType,
    pub canonical_status: Option<String>,
    pub confidence: MappingConfidence,
    pub description: String,
    pub conditions: Vec<Condition>,
    pub bundle_hints: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct StatusMapper {
    rules: Vec<MappingRule>,
    catch_all: Option<MappingRule>,
}

impl Default for StatusMapper {
    fn default() -> Self {
        Self::with_default_rules()
    }
}

impl StatusMapper {
    /// A mapper with no rules and no catch-all.
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            catch_all: None,
        }
    }

    pub fn with_default_rules() -> Self {
        Self {
            rules: default_rules(),
            catch_all: Some(MappingRule::catch_all()),
        }
    }

    pub fn add_rule(&mut self, rule: MappingRule) {
        self.rules.push(rule);
    }

    pub fn set_catch_all(&mut self, rule: Option<MappingRule>) {
        self.catch_all = rule;
    }

    pub fn rules(&self) -> &[MappingRule] {
        &self.rules
    }

    pub fn map(
        &self,
        source_system: &str,
        source_status: &str,
        context: &Map<String, Value>,
    ) -> Result<MappingResult> {
        let matching: Vec<(usize, &MappingRule)> = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.applies(source_system, source_status, context))
            .collect();

        let mut warnings = Vec::new();
        let (rule_ref, rule, ambiguous) = match matching.iter().map(|(_, r)| r.confidence).max() {
            Some(best) => {
                let tied: Vec<&(usize, &MappingRule)> =
                    matching.iter().filter(|(_, r)| r.confidence == best).collect();
                let (index, rule) = *tied[0];
                let ambiguous = tied.len() > 1;
                if ambiguous {
                    warnings.push(format!(
                        "{} {}-confidence rules match {source_system}:{source_status}; using rule {index}",
                        tied.len(),
                        best.as_str()
                    ));
                }
                let rule_ref = RuleRef {
                    index: Some(index),
                    description: rule.description.clone(),
                };
                (rule_ref, rule, ambiguous)
            }
            None => {
                let rule = self
                    .catch_all
                    .as_ref()
                    .filter(|rule| rule.applies(source_system, source_status, context))
                    .ok_or_else(|| PipelineError::UnmappableStatus {
                        source_system: source_system.to_string(),
                        source_status: source_status.to_string(),
                    })?;
                warnings.push(format!(
                    "no specific rule for {source_system}:{source_status}; applied catch-all"
                ));
                let rule_ref = RuleRef {
                    index: None,
                    description: rule.description.clone(),
                };
                (rule_ref, rule, false)
            }
        };

        let mut bundle_context = rule.bundle_hints.clone();
        if context.get("bundle_id").is_some_and(|v| !v.is_null()) {
            bundle_context.insert("has_bundle_id".into(), Value::Bool(true));
        }
        if context
            .get("bundle_member_count")
            .and_then(Value::as_u64)
            .is_some_and(|count| count > 1)
        {
            bundle_context.insert("is_multi_member".into(), Value::Bool(true));
        }

        let requires_manual_review = ambiguous || rule.confidence == MappingConfidence::Low;
        if requires_manual_review {
            warn!(
                source_system,
                source_status,
                confidence = rule.confidence.as_str(),
                ambiguous,
                "status mapping needs review"
            );
        } else {
            debug!(source_system, source_status, event_type = %rule.event_type, "status mapped");
        }

        Ok(MappingResult {
            rule: rule_ref,
            event_type: rule.event_type,
            canonical_status: rule.canonical_status.clone(),
            confidence: rule.confidence,
            ambiguous,
            requires_manual_review,
            warnings,
            bundle_context,
        })
    }

    /// Validate, map and build the canonical event for one source record.
    pub fn canonicalize(&self, record: &SourceRecord) -> Result<(CanonicalEvent, MappingResult)> {
        validation::check_pseudonymized_id("event_id", &record.source_key)?;
        validation::check_pseudonymized_id("member_id", &record.member_id)?;
        validation::check_pseudonymized_id("refill_id", &record.refill_id)?;
        if let Some(bundle_id) = &record.bundle_id {
            validation::check_pseudonymized_id("bundle_id", bundle_id)?;
        }
        let event_timestamp = validation::parse_timestamp("event_timestamp", &record.event_timestamp)?;
        let received_timestamp =
            validation::parse_optional_timestamp("received_timestamp", record.received_timestamp.as_deref())?
                .unwrap_or(event_timestamp);

        let mapping = self.map(&record.source_system, &record.source_status, &record.context_fields())?;
        let details = build_details(record, &mapping)?;

        let event = CanonicalEvent {
            event_id: record.source_key.clone(),
            event_type: mapping.event_type,
            source_system: record.source_system.to_ascii_lowercase(),
            member_id: record.member_id.clone(),
            refill_id: record.refill_id.clone(),
            bundle_id: record.bundle_id.clone(),
            event_timestamp,
            received_timestamp,
            correlation_id: record.correlation_id.clone(),
            causation_id: record.causation_id.clone(),
            bundle_sequence: record.bundle_sequence,
            bundle_member_count: record.bundle_member_count,
            bundle_refill_count: record.bundle_refill_count,
            canonical_status: mapping.canonical_status.clone(),
            source_status: Some(record.source_status.clone()),
            details,
        };
        Ok((event, mapping))
    }

    pub fn statistics(&self) -> MappingStatistics {
        let mut stats = MappingStatistics {
            total_rules: self.rules.len(),
            ..MappingStatistics::default()
        };
        for rule in &self.rules {
            let source = rule.source_system.clone().unwrap_or_else(|| "*".to_string());
            *stats.rules_by_source.entry(source).or_insert(0) += 1;
            *stats.rules_by_confidence.entry(rule.confidence).or_insert(0) += 1;
            *stats.rules_by_event_type.entry(rule.event_type).or_insert(0) += 1;
        }
        stats
    }

    /// Problems in the rule table that do not prevent mapping but deserve a look.
    pub fn validate_consistency(&self) -> Vec<String> {
        let mut issues = Vec::new();
        let mut exact_keys = HashSet::new();

        for (index, rule) in self.rules.iter().enumerate() {
            let system = rule.source_system.as_deref().unwrap_or("*");
            if let StatusMatcher::Exact(status) = &rule.matcher {
                let key = format!("{}:{}", system.to_ascii_lowercase(), status.to_ascii_uppercase());
                if !exact_keys.insert(key.clone()) {
                    issues.push(format!("duplicate exact match: {key}"));
                }
            }
            if rule.description.trim().is_empty() {
                issues.push(format!(
                    "rule {index} missing description: {system}:{}",
                    rule.matcher.describe()
                ));
            }
            let has_conditions = matches!(rule.matcher, StatusMatcher::Conditional { .. });
            if rule.confidence == MappingConfidence::Low && !has_conditions {
                issues.push(format!(
                    "low confidence rule {index} without conditions: {system}:{}",
                    rule.matcher.describe()
                ));
            }
        }
        if self.catch_all.is_none() {
            issues.push("no catch-all rule registered".to_string());
        }
        issues
    }

    pub fn export_rules(&self) -> Vec<RuleExport> {
        self.rules
            .iter()
            .enumerate()
            .map(|(index, rule)| RuleExport {
                index,
                source_system: rule.source_system.clone().unwrap_or_else(|| "*".to_string()),
                tier: rule.matcher.tier(),
                source_status: rule.matcher.describe(),
                event_type: rule.event_type,
                canonical_status: rule.canonical_status.clone(),
                confidence: rule.confidence,
                description: rule.description.clone(),
                conditions: match &rule.matcher {
                    StatusMatcher::Conditional { conditions, .. } => conditions.clone(),
                    _ => Vec::new(),
                },
                bundle_hints: rule.bundle_hints.clone(),
            })
            .collect()
    }
}

fn build_details(record: &SourceRecord, mapping: &MappingResult) -> Result<EventDetails> {
    let status = mapping.canonical_status.as_deref();
    let details = match mapping.event_type.category() {
        EventCategory::Refill => EventDetails::Refill(RefillDetails {
            drug_ndc: record.drug_ndc.clone(),
            drug_name: record.drug_name.clone(),
            days_supply: record.days_supply,
            quantity: record.quantity,
            refill_due_date: validation::parse_optional_timestamp(
                "refill_due_date",
                record.refill_due_date.as_deref(),
            )?,
            ship_by_date: validation::parse_optional_timestamp(
                "ship_by_date",
                record.ship_by_date.as_deref(),
            )?,
            last_fill_date: validation::parse_optional_timestamp(
                "last_fill_date",
                record.last_fill_date.as_deref(),
            )?,
            refill_status: status.and_then(RefillStatus::parse),
            bundle_alignment_score: record.bundle_alignment_score.map(|s| s.clamp(0.0, 1.0)),
        }),
        EventCategory::PriorAuth => EventDetails::PriorAuth(PriorAuthDetails {
            pa_status: status
                .and_then(PaStatus::parse)
                .unwrap_or(match mapping.event_type {
                    EventType::PaApproved => PaStatus::Approved,
                    EventType::PaDenied => PaStatus::Denied,
                    EventType::PaExpired => PaStatus::Expired,
                    _ => PaStatus::Submitted,
                }),
            pa_type: record.pa_type.clone(),
            pa_processing_days: record.pa_processing_days,
            pa_expiry_date: None,
        }),
        EventCategory::OutOfStock => EventDetails::OutOfStock(OutOfStockDetails {
            oos_reason: record.oos_reason.clone(),
            ..OutOfStockDetails::default()
        }),
        EventCategory::Bundle => EventDetails::Bundle(BundleDetails {
            bundle_type: record.bundle_type.clone().or_else(|| {
                mapping
                    .bundle_context
                    .get("bundle_type")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            }),
            bundle_strategy: None,
            split_reason: mapping
                .bundle_context
                .get("split_reason")
                .and_then(Value::as_str)
                .map(str::to_string),
        }),
    };
    Ok(details)
}

fn default_rules() -> Vec<MappingRule> {
    use EventType as E;
    use MappingConfidence::{High, Medium};

    let refill = |s: RefillStatus| Some(s.as_str());
    let pa = |s: PaStatus| Some(s.as_str());

    let mut rules = vec![
        MappingRule::exact("centersync", "ELIGIBLE_FOR_BUNDLING", E::RefillEligible, refill(RefillStatus::Eligible), High, "Refill eligible for bundling"),
        MappingRule::exact("centersync", "BUNDLED", E::RefillBundled, refill(RefillStatus::Bundled), High, "Refill successfully bundled"),
        MappingRule::exact("centersync", "SHIPPED", E::RefillShipped, refill(RefillStatus::Shipped), High, "Refill shipped"),
        MappingRule::exact("centersync", "COMPLETED", E::RefillCompleted, refill(RefillStatus::Completed), High, "Refill completed"),
        MappingRule::exact("centersync", "CANCELLED", E::RefillCancelled, refill(RefillStatus::Cancelled), High, "Refill cancelled"),
        MappingRule::exact("centersync", "ON_HOLD", E::RefillInitiated, refill(RefillStatus::OnHold), Medium, "Refill on hold, treated as initiated"),
        MappingRule::exact("centersync", "PA_REQUIRED", E::PaSubmitted, pa(PaStatus::Submitted), High, "Prior authorization required and submitted"),
        MappingRule::exact("centersync", "PA_APPROVED", E::PaApproved, pa(PaStatus::Approved), High, "Prior authorization approved"),
        MappingRule::exact("centersync", "PA_DENIED", E::PaDenied, pa(PaStatus::Denied), High, "Prior authorization denied"),
        MappingRule::exact("hpie", "ORDER_CREATED", E::RefillInitiated, refill(RefillStatus::Pending), High, "Order created in HPIE"),
        MappingRule::exact("hpie", "ORDER_SHIPPED", E::RefillShipped, refill(RefillStatus::Shipped), High, "Order shipped from HPIE"),
        MappingRule::exact("pa_system", "SUBMITTED", E::PaSubmitted, pa(PaStatus::Submitted), High, "PA submitted to external system"),
        MappingRule::exact("pa_system", "IN_REVIEW", E::PaSubmitted, pa(PaStatus::InReview), Medium, "PA under review"),
        MappingRule::exact("pa_system", "APPROVED", E::PaApproved, pa(PaStatus::Approved), High, "PA approved by external system"),
        MappingRule::exact("pa_system", "DENIED", E::PaDenied, pa(PaStatus::Denied), High, "PA denied by external system"),
        MappingRule::exact("pa_system", "EXPIRED", E::PaExpired, pa(PaStatus::Expired), High, "PA approval expired"),
        MappingRule::exact("inventory_system", "OUT_OF_STOCK", E::OosDetected, Some("detected"), High, "Out of stock detected"),
        MappingRule::exact("inventory_system", "IN_STOCK", E::OosResolved, Some("resolved"), High, "Out of stock resolved"),
        MappingRule::exact("centersync", "BUNDLE_FORMED", E::BundleFormed, None, High, "Bundle formed")
            .with_hint("bundle_type", "standard"),
        MappingRule::exact("centersync", "BUNDLE_SPLIT", E::BundleSplit, None, High, "Bundle split")
            .with_hint("split_reason", "timing_mismatch"),
        MappingRule::exact("centersync", "BUNDLE_SHIPPED", E::BundleShipped, None, High, "Bundle shipped"),
        MappingRule::conditional(
            "centersync",
            "PENDING",
            vec![
                Condition::new("days_supply", Comparison::GreaterThan(0.0)),
                Condition::new("quantity", Comparison::GreaterThan(0.0)),
            ],
            E::RefillInitiated,
            refill(RefillStatus::Pending),
            Medium,
            "Pending status with an active supply",
        ),
    ];

    let patterns = [
        (r".*PA.*REQUIRED.*", E::PaSubmitted, pa(PaStatus::Submitted), "PA required (pattern)"),
        (r".*SHIPPED.*", E::RefillShipped, refill(RefillStatus::Shipped), "Shipped status (pattern)"),
    ];
    for (pattern, event_type, status, description) in patterns {
        match MappingRule::pattern("centersync", pattern, event_type, status, Medium, description) {
            Ok(rule) => rules.push(rule),
            Err(err) => warn!(%err, "skipping default pattern rule"),
        }
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn exact_match_is_case_insensitive_and_high_confidence() {
        let mapper = StatusMapper::with_default_rules();
        let result = mapper.map("centersync", "bundled", &Map::new()).unwrap();
        assert_eq!(result.event_type, EventType::RefillBundled);
        assert_eq!(result.canonical_status.as_deref(), Some("bundled"));
        assert_eq!(result.confidence, MappingConfidence::High);
        assert!(!result.ambiguous);
        assert!(!result.requires_manual_review);
    }

    #[test]
    fn higher_confidence_beats_pattern_without_ambiguity() {
        let mapper = StatusMapper::with_default_rules();
        let result = mapper.map("centersync", "SHIPPED", &Map::new()).unwrap();
        assert_eq!(result.confidence, MappingConfidence::High);
        assert_eq!(result.rule.description, "Refill shipped");
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn pattern_rules_catch_status_variations() {
        let mapper = StatusMapper::with_default_rules();
        let result = mapper.map("centersync", "PARTIALLY_SHIPPED", &Map::new()).unwrap();
        assert_eq!(result.event_type, EventType::RefillShipped);
        assert_eq!(result.confidence, MappingConfidence::Medium);
    }

    #[test]
    fn pending_with_supply_uses_conditional_rule() {
        let mapper = StatusMapper::with_default_rules();
        let context = ctx(json!({"days_supply": 30, "quantity": 90.0}));
        let result = mapper.map("centersync", "PENDING", &context).unwrap();
        assert_eq!(result.confidence, MappingConfidence::Medium);
        assert_eq!(result.rule.description, "Pending status with an active supply");
    }

    #[test]
    fn pending_without_matching_conditions_falls_to_catch_all() {
        let mapper = StatusMapper::with_default_rules();
        let context = ctx(json!({"days_supply": 0}));
        let result = mapper.map("centersync", "PENDING", &context).unwrap();
        assert_eq!(result.confidence, MappingConfidence::Low);
        assert_eq!(result.event_type, EventType::RefillInitiated);
        assert_eq!(result.canonical_status.as_deref(), Some("pending"));
        assert_eq!(result.rule.index, None);
        assert!(result.requires_manual_review);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn ties_are_flagged_and_resolved_by_registration_order() {
        let mut mapper = StatusMapper::with_default_rules();
        mapper.add_rule(MappingRule::exact(
            "centersync",
            "BUNDLED",
            EventType::BundleFormed,
            None,
            MappingConfidence::High,
            "Later duplicate",
        ));
        let result = mapper.map("centersync", "BUNDLED", &Map::new()).unwrap();
        assert!(result.ambiguous);
        assert!(result.requires_manual_review);
        assert_eq!(result.event_type, EventType::RefillBundled);
        assert_eq!(result.rule.description, "Refill successfully bundled");
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn missing_catch_all_is_a_configuration_defect() {
        let mapper = StatusMapper::empty();
        let err = mapper.map("hpc", "WHATEVER", &Map::new()).unwrap_err();
        assert!(matches!(err, PipelineError::UnmappableStatus { .. }));
    }

    #[test]
    fn bundle_hints_merge_with_context_hints() {
        let mapper = StatusMapper::with_default_rules();
        let context = ctx(json!({"bundle_id": "B00000001", "bundle_member_count": 3}));
        let result = mapper.map("centersync", "BUNDLE_FORMED", &context).unwrap();
        assert_eq!(result.bundle_context.get("bundle_type"), Some(&json!("standard")));
        assert_eq!(result.bundle_context.get("has_bundle_id"), Some(&json!(true)));
        assert_eq!(result.bundle_context.get("is_multi_member"), Some(&json!(true)));
    }

    #[test]
    fn conditions_cover_every_operator() {
        let context = ctx(json!({"pa_type": "renewal", "days_supply": 30, "drug_name": "metformin"}));
        assert!(Condition::new("pa_type", Comparison::Equals(json!("renewal"))).holds(&context));
        assert!(Condition::new("drug_name", Comparison::Contains("form".into())).holds(&context));
        assert!(Condition::new("pa_type", Comparison::In(vec![json!("new"), json!("renewal")])).holds(&context));
        assert!(Condition::new("days_supply", Comparison::LessThan(31.0)).holds(&context));
        assert!(!Condition::new("days_supply", Comparison::GreaterThan(30.0)).holds(&context));
        assert!(!Condition::new("quantity", Comparison::GreaterThan(0.0)).holds(&context));
    }

    #[test]
    fn canonicalize_builds_refill_event() {
        let mapper = StatusMapper::with_default_rules();
        let record = SourceRecord {
            source_key: "EVT0000001".into(),
            source_system: "centersync".into(),
            source_status: "ELIGIBLE_FOR_BUNDLING".into(),
            member_id: "M00000001".into(),
            refill_id: "R00000001".into(),
            bundle_id: Some("B00000001".into()),
            event_timestamp: "2026-10-01T09:00:00-04:00".into(),
            ship_by_date: Some("2026-10-05T00:00:00Z".into()),
            days_supply: Some(30),
            ..SourceRecord::default()
        };
        let (event, mapping) = mapper.canonicalize(&record).unwrap();
        assert_eq!(event.event_type, EventType::RefillEligible);
        assert_eq!(event.event_timestamp.to_rfc3339(), "2026-10-01T13:00:00+00:00");
        assert_eq!(event.received_timestamp, event.event_timestamp);
        assert_eq!(mapping.confidence, MappingConfidence::High);
        let details = event.refill_details().unwrap();
        assert_eq!(details.refill_status, Some(RefillStatus::Eligible));
        assert!(details.ship_by_date.is_some());
    }

    #[test]
    fn canonicalize_fails_closed_on_bad_identity() {
        let mapper = StatusMapper::with_default_rules();
        let record = SourceRecord {
            source_key: "EVT0000001".into(),
            source_system: "centersync".into(),
            source_status: "BUNDLED".into(),
            member_id: "M1".into(),
            refill_id: "R00000001".into(),
            event_timestamp: "2026-10-01T09:00:00Z".into(),
            ..SourceRecord::default()
        };
        assert!(matches!(
            mapper.canonicalize(&record),
            Err(PipelineError::InvalidIdentifier { field: "member_id", .. })
        ));
    }

    #[test]
    fn default_table_is_consistent() {
        let mapper = StatusMapper::with_default_rules();
        assert!(mapper.validate_consistency().is_empty());
        let stats = mapper.statistics();
        assert_eq!(stats.total_rules, mapper.export_rules().len());
        assert_eq!(stats.rules_by_source.get("inventory_system"), Some(&2));
    }
}
