use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

const ARTIFACT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_29a4_8d3e_5b70_9a12_c4e8_7d05_b361);

/// Name-based id for a derived artifact. Identical parts always give the same id.
pub fn artifact_id(kind: &str, parts: &[&str]) -> Uuid {
    let mut name = String::from(kind);
    for part in parts {
        name.push('\u{1f}');
        name.push_str(part);
    }
    Uuid::new_v5(&ARTIFACT_NAMESPACE, name.as_bytes())
}

/// Canonical lifecycle event types shared by every source system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RefillInitiated,
    RefillEligible,
    RefillBundled,
    RefillShipped,
    RefillCancelled,
    RefillCompleted,
    PaSubmitted,
    PaApproved,
    PaDenied,
    PaExpired,
    OosDetected,
    OosResolved,
    BundleFormed,
    BundleSplit,
    BundleShipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Refill,
    PriorAuth,
    OutOfStock,
    Bundle,
}

impl EventType {
    pub fn category(&self) -> EventCategory {
        match self {
            EventType::RefillInitiated
            | EventType::RefillEligible
            | EventType::RefillBundled
            | EventType::RefillShipped
            | EventType::RefillCancelled
            | EventType::RefillCompleted => EventCategory::Refill,
            EventType::PaSubmitted
            | EventType::PaApproved
            | EventType::PaDenied
            | EventType::PaExpired => EventCategory::PriorAuth,
            EventType::OosDetected | EventType::OosResolved => EventCategory::OutOfStock,
            EventType::BundleFormed | EventType::BundleSplit | EventType::BundleShipped => {
                EventCategory::Bundle
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RefillInitiated => "refill_initiated",
            EventType::RefillEligible => "refill_eligible",
            EventType::RefillBundled => "refill_bundled",
            EventType::RefillShipped => "refill_shipped",
            EventType::RefillCancelled => "refill_cancelled",
            EventType::RefillCompleted => "refill_completed",
            EventType::PaSubmitted => "pa_submitted",
            EventType::PaApproved => "pa_approved",
            EventType::PaDenied => "pa_denied",
            EventType::PaExpired => "pa_expired",
            EventType::OosDetected => "oos_detected",
            EventType::OosResolved => "oos_resolved",
            EventType::BundleFormed => "bundle_formed",
            EventType::BundleSplit => "bundle_split",
            EventType::BundleShipped => "bundle_shipped",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefillStatus {
    Pending,
    Eligible,
    Processing,
    Bundled,
    Shipped,
    Completed,
    Cancelled,
    OnHold,
}

impl RefillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefillStatus::Pending => "pending",
            RefillStatus::Eligible => "eligible",
            RefillStatus::Processing => "processing",
            RefillStatus::Bundled => "bundled",
            RefillStatus::Shipped => "shipped",
            RefillStatus::Completed => "completed",
            RefillStatus::Cancelled => "cancelled",
            RefillStatus::OnHold => "on_hold",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let status = match value {
            "pending" => RefillStatus::Pending,
            "eligible" => RefillStatus::Eligible,
            "processing" => RefillStatus::Processing,
            "bundled" => RefillStatus::Bundled,
            "shipped" => RefillStatus::Shipped,
            "completed" => RefillStatus::Completed,
            "cancelled" => RefillStatus::Cancelled,
            "on_hold" => RefillStatus::OnHold,
            _ => return None,
        };
        Some(status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaStatus {
    NotRequired,
    Submitted,
    Approved,
    Denied,
    Expired,
    InReview,
}

impl PaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaStatus::NotRequired => "not_required",
            PaStatus::Submitted => "submitted",
            PaStatus::Approved => "approved",
            PaStatus::Denied => "denied",
            PaStatus::Expired => "expired",
            PaStatus::InReview => "in_review",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let status = match value {
            "not_required" => PaStatus::NotRequired,
            "submitted" => PaStatus::Submitted,
            "approved" => PaStatus::Approved,
            "denied" => PaStatus::Denied,
            "expired" => PaStatus::Expired,
            "in_review" => PaStatus::InReview,
            _ => return None,
        };
        Some(status)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefillDetails {
    pub drug_ndc: Option<String>,
    pub drug_name: Option<String>,
    pub days_supply: Option<u32>,
    pub quantity: Option<f64>,
    pub refill_due_date: Option<DateTime<Utc>>,
    pub ship_by_date: Option<DateTime<Utc>>,
    pub last_fill_date: Option<DateTime<Utc>>,
    pub refill_status: Option<RefillStatus>,
    pub bundle_alignment_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorAuthDetails {
    pub pa_status: PaStatus,
    pub pa_type: Option<String>,
    pub pa_processing_days: Option<u32>,
    pub pa_expiry_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutOfStockDetails {
    pub oos_reason: Option<String>,
    pub alternative_available: Option<bool>,
    pub estimated_resupply_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleDetails {
    pub bundle_type: Option<String>,
    pub bundle_strategy: Option<String>,
    pub split_reason: Option<String>,
}

/// Kind-specific payload. The variant always agrees with the event type category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventDetails {
    Refill(RefillDetails),
    PriorAuth(PriorAuthDetails),
    OutOfStock(OutOfStockDetails),
    Bundle(BundleDetails),
}

/// One normalized lifecycle fact. Immutable once built by the mapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub source_system: String,
    pub member_id: String,
    pub refill_id: String,
    pub bundle_id: Option<String>,
    pub event_timestamp: DateTime<Utc>,
    pub received_timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub bundle_sequence: Option<u32>,
    pub bundle_member_count: Option<u32>,
    pub bundle_refill_count: Option<u32>,
    pub canonical_status: Option<String>,
    pub source_status: Option<String>,
    pub details: EventDetails,
}

impl CanonicalEvent {
    pub fn refill_details(&self) -> Option<&RefillDetails> {
        match &self.details {
            EventDetails::Refill(details) => Some(details),
            _ => None,
        }
    }

    pub fn bundle_type(&self) -> Option<&str> {
        match &self.details {
            EventDetails::Bundle(details) => details.bundle_type.as_deref(),
            _ => None,
        }
    }
}

/// Raw status record as delivered by a source system, before mapping.
///
/// Timestamps stay textual until validation so that values without an
/// offset can be rejected instead of silently assumed to be UTC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub source_key: String,
    pub source_system: String,
    pub source_status: String,
    pub member_id: String,
    pub refill_id: String,
    #[serde(default)]
    pub bundle_id: Option<String>,
    pub event_timestamp: String,
    #[serde(default)]
    pub received_timestamp: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub causation_id: Option<String>,
    #[serde(default)]
    pub bundle_sequence: Option<u32>,
    #[serde(default)]
    pub bundle_member_count: Option<u32>,
    #[serde(default)]
    pub bundle_refill_count: Option<u32>,
    #[serde(default)]
    pub drug_ndc: Option<String>,
    #[serde(default)]
    pub drug_name: Option<String>,
    #[serde(default)]
    pub days_supply: Option<u32>,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub refill_due_date: Option<String>,
    #[serde(default)]
    pub ship_by_date: Option<String>,
    #[serde(default)]
    pub last_fill_date: Option<String>,
    #[serde(default)]
    pub bundle_alignment_score: Option<f64>,
    #[serde(default)]
    pub pa_type: Option<String>,
    #[serde(default)]
    pub pa_processing_days: Option<u32>,
    #[serde(default)]
    pub oos_reason: Option<String>,
    #[serde(default)]
    pub bundle_type: Option<String>,
}

impl SourceRecord {
    /// Fields the mapper's conditional rules may inspect.
    pub fn context_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        if let Some(bundle_id) = &self.bundle_id {
            fields.insert("bundle_id".into(), Value::from(bundle_id.as_str()));
        }
        if let Some(count) = self.bundle_member_count {
            fields.insert("bundle_member_count".into(), Value::from(count));
        }
        if let Some(count) = self.bundle_refill_count {
            fields.insert("bundle_refill_count".into(), Value::from(count));
        }
        if let Some(days) = self.days_supply {
            fields.insert("days_supply".into(), Value::from(days));
        }
        if let Some(quantity) = self.quantity {
            fields.insert("quantity".into(), Value::from(quantity));
        }
        if let Some(name) = &self.drug_name {
            fields.insert("drug_name".into(), Value::from(name.as_str()));
        }
        if let Some(pa_type) = &self.pa_type {
            fields.insert("pa_type".into(), Value::from(pa_type.as_str()));
        }
        if let Some(bundle_type) = &self.bundle_type {
            fields.insert("bundle_type".into(), Value::from(bundle_type.as_str()));
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_types_fall_into_categories() {
        assert_eq!(EventType::RefillBundled.category(), EventCategory::Refill);
        assert_eq!(EventType::PaExpired.category(), EventCategory::PriorAuth);
        assert_eq!(EventType::OosResolved.category(), EventCategory::OutOfStock);
        assert_eq!(EventType::BundleShipped.category(), EventCategory::Bundle);
    }

    #[test]
    fn statuses_parse_their_wire_names() {
        assert_eq!(RefillStatus::parse("on_hold"), Some(RefillStatus::OnHold));
        assert_eq!(PaStatus::parse("in_review"), Some(PaStatus::InReview));
        assert_eq!(RefillStatus::parse("ON_HOLD"), None);
    }

    #[test]
    fn artifact_ids_are_stable_and_kind_scoped() {
        let first = artifact_id("snapshot", &["R00000001", "E1"]);
        assert_eq!(first, artifact_id("snapshot", &["R00000001", "E1"]));
        assert_ne!(first, artifact_id("metrics", &["R00000001", "E1"]));
        assert_ne!(
            artifact_id("snapshot", &["R0000000", "1E1"]),
            artifact_id("snapshot", &["R00000001", "E1"])
        );
    }

    #[test]
    fn context_fields_skip_missing_values() {
        let record = SourceRecord {
            days_supply: Some(30),
            quantity: Some(60.0),
            ..SourceRecord::default()
        };
        let fields = record.context_fields();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields.get("days_supply"), Some(&Value::from(30)));
    }
}
