use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Row, Transaction};

use refill_bundle_risk::models::SourceRecord;
use refill_bundle_risk::validation;
use refill_bundle_risk::PipelineOutput;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Insert one raw record. Returns false when its source key is already stored.
pub async fn insert_record(pool: &PgPool, record: &SourceRecord) -> anyhow::Result<bool> {
    let event_timestamp = validation::parse_timestamp("event_timestamp", &record.event_timestamp)?;
    let payload = serde_json::to_value(record)?;

    let result = sqlx::query(
        r#"
        INSERT INTO refill_bundle_risk.source_records
        (source_key, source_system, source_status, member_id, refill_id, bundle_id, event_timestamp, payload)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(&record.source_key)
    .bind(&record.source_system)
    .bind(&record.source_status)
    .bind(&record.member_id)
    .bind(&record.refill_id)
    .bind(&record.bundle_id)
    .bind(event_timestamp)
    .bind(payload)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<usize> {
    let record = |key: &str, system: &str, status: &str, refill: &str, member: &str, at: &str| {
        SourceRecord {
            source_key: key.to_string(),
            source_system: system.to_string(),
            source_status: status.to_string(),
            member_id: member.to_string(),
            refill_id: refill.to_string(),
            bundle_id: Some("BND-7Q2K-0001".to_string()),
            event_timestamp: at.to_string(),
            ..SourceRecord::default()
        }
    };

    let mut records = vec![
        SourceRecord {
            days_supply: Some(30),
            quantity: Some(30.0),
            drug_name: Some("atorvastatin 20mg".to_string()),
            last_fill_date: Some("2026-01-05T15:00:00Z".to_string()),
            refill_due_date: Some("2026-02-04T15:00:00Z".to_string()),
            ship_by_date: Some("2026-02-02T15:00:00Z".to_string()),
            ..record("seed-0001", "centersync", "PENDING", "RFL-8H3D-1001", "MBR-4X9P-2201", "2026-01-26T14:00:00Z")
        },
        SourceRecord {
            bundle_alignment_score: Some(0.72),
            ..record("seed-0002", "centersync", "ELIGIBLE_FOR_BUNDLING", "RFL-8H3D-1001", "MBR-4X9P-2201", "2026-01-27T09:30:00Z")
        },
        SourceRecord {
            days_supply: Some(90),
            quantity: Some(90.0),
            drug_name: Some("lisinopril 10mg".to_string()),
            last_fill_date: Some("2025-10-20T15:00:00Z".to_string()),
            refill_due_date: Some("2026-01-18T15:00:00Z".to_string()),
            ship_by_date: Some("2026-02-12T15:00:00Z".to_string()),
            ..record("seed-0003", "centersync", "PENDING", "RFL-8H3D-1002", "MBR-4X9P-2201", "2026-01-26T14:20:00Z")
        },
        SourceRecord {
            pa_type: Some("step_therapy".to_string()),
            ..record("seed-0004", "centersync", "PA_REQUIRED", "RFL-8H3D-1002", "MBR-4X9P-2201", "2026-01-27T11:00:00Z")
        },
        record("seed-0005", "pa_system", "IN_REVIEW", "RFL-8H3D-1002", "MBR-4X9P-2201", "2026-01-29T16:00:00Z"),
        SourceRecord {
            oos_reason: Some("manufacturer_backorder".to_string()),
            ..record("seed-0006", "inventory_system", "OUT_OF_STOCK", "RFL-8H3D-1001", "MBR-4X9P-2201", "2026-01-30T08:00:00Z")
        },
    ];
    records.push(SourceRecord {
        bundle_id: None,
        days_supply: Some(30),
        quantity: Some(30.0),
        last_fill_date: Some("2025-11-10T15:00:00Z".to_string()),
        refill_due_date: Some("2025-12-10T15:00:00Z".to_string()),
        ..record("seed-0007", "hpie", "ORDER_CREATED", "RFL-2M7T-3001", "MBR-6C1V-5502", "2026-01-28T10:00:00Z")
    });

    let mut inserted = 0usize;
    for record in &records {
        if insert_record(pool, record)
            .await
            .with_context(|| format!("failed to seed {}", record.source_key))?
        {
            inserted += 1;
        }
    }
    Ok(inserted)
}

#[derive(Debug, Default)]
pub struct ImportOutcome {
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: Vec<(usize, String)>,
}

pub fn read_csv(csv_path: &std::path::Path) -> anyhow::Result<Vec<SourceRecord>> {
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut records = Vec::new();
    for (index, result) in reader.deserialize::<SourceRecord>().enumerate() {
        let record = result.with_context(|| format!("malformed CSV row {}", index + 1))?;
        records.push(record);
    }
    Ok(records)
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<ImportOutcome> {
    let mut outcome = ImportOutcome::default();
    for (index, record) in read_csv(csv_path)?.iter().enumerate() {
        match insert_record(pool, record).await {
            Ok(true) => outcome.inserted += 1,
            Ok(false) => outcome.duplicates += 1,
            Err(err) => match err.downcast_ref::<refill_bundle_risk::PipelineError>() {
                Some(rejection) => outcome.rejected.push((index + 1, rejection.to_string())),
                None => return Err(err),
            },
        }
    }
    Ok(outcome)
}

pub async fn fetch_records(
    pool: &PgPool,
    since: DateTime<Utc>,
    bundle: Option<&str>,
    member: Option<&str>,
) -> anyhow::Result<Vec<SourceRecord>> {
    let mut query = String::from(
        "SELECT payload FROM refill_bundle_risk.source_records \
         WHERE event_timestamp >= $1",
    );

    if bundle.is_some() {
        query.push_str(" AND bundle_id = $2");
    } else if member.is_some() {
        query.push_str(" AND member_id = $2");
    }
    query.push_str(" ORDER BY arrival_seq");

    let mut rows = sqlx::query(&query).bind(since);

    if let Some(value) = bundle {
        rows = rows.bind(value);
    } else if let Some(value) = member {
        rows = rows.bind(value);
    }

    let mut records = Vec::new();
    for row in rows.fetch_all(pool).await? {
        let payload: serde_json::Value = row.get("payload");
        records.push(serde_json::from_value(payload).context("stored record payload is malformed")?);
    }

    Ok(records)
}

/// One row of the artifacts table.
struct ArtifactRow<'a> {
    kind: &'static str,
    artifact_id: &'a str,
    refill_id: &'a str,
    bundle_id: Option<&'a str>,
    version: &'a str,
    payload: serde_json::Value,
}

impl<'a> ArtifactRow<'a> {
    fn new<T: Serialize>(
        kind: &'static str,
        artifact_id: &'a str,
        refill_id: &'a str,
        bundle_id: Option<&'a str>,
        version: &'a str,
        artifact: &T,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            kind,
            artifact_id,
            refill_id,
            bundle_id,
            version,
            payload: serde_json::to_value(artifact)
                .with_context(|| format!("failed to encode {kind} {artifact_id}"))?,
        })
    }
}

async fn store_artifact(
    tx: &mut Transaction<'_, Postgres>,
    as_of: DateTime<Utc>,
    row: ArtifactRow<'_>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO refill_bundle_risk.artifacts
        (artifact_id, kind, refill_id, bundle_id, as_of, version, payload)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (artifact_id) DO NOTHING
        "#,
    )
    .bind(row.artifact_id)
    .bind(row.kind)
    .bind(row.refill_id)
    .bind(row.bundle_id)
    .bind(as_of)
    .bind(row.version)
    .bind(row.payload)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Persist every artifact of a run. Artifact ids are content derived, so a
/// repeated run over the same records writes nothing new.
pub async fn persist_output(pool: &PgPool, output: &PipelineOutput) -> anyhow::Result<()> {
    let mut rows = Vec::new();
    for snapshot in &output.snapshots {
        rows.push(ArtifactRow::new(
            "snapshot",
            &snapshot.snapshot_id,
            &snapshot.refill_id,
            snapshot.bundle_id.as_deref(),
            &snapshot.version,
            snapshot,
        )?);
    }
    for metrics in &output.metrics {
        rows.push(ArtifactRow::new(
            "metrics",
            &metrics.metrics_id,
            &metrics.refill_id,
            metrics.bundle_id.as_deref(),
            &metrics.version,
            metrics,
        )?);
    }
    for assessment in &output.assessments {
        rows.push(ArtifactRow::new(
            "assessment",
            &assessment.assessment_id,
            &assessment.refill_id,
            assessment.bundle_id.as_deref(),
            &assessment.model_version,
            assessment,
        )?);
    }
    for (explanation, assessment) in output.explanations.iter().zip(&output.assessments) {
        rows.push(ArtifactRow::new(
            "explanation",
            &explanation.explanation_id,
            &assessment.refill_id,
            assessment.bundle_id.as_deref(),
            &explanation.explanation_version,
            explanation,
        )?);
    }

    let mut tx = pool.begin().await?;
    for row in rows {
        store_artifact(&mut tx, output.as_of, row).await?;
    }
    tx.commit().await.context("failed to commit artifacts")?;
    Ok(())
}
