//! Repository tests against a live Postgres.
//!
//! Each test bootstraps the schema on `DATABASE_URL` and works inside its
//! own randomly numbered organization, so tests can share one database.
//! Without `DATABASE_URL` the tests return early.

use chrono::{DateTime, Duration, TimeZone, Utc};
use conduit_core::{
    models::{
        CancellationInfo, DeliveryMode, DlqEntry, DlqEntryId, DlqStatus, EventId, HttpMethod,
        IntegrationRule, OrgId, OrgUnitId, RecurringConfig, RetryStrategy, RuleId, RuleScope,
        ScheduleStatus, ScheduledDelivery, ScheduledDeliveryId, SchedulingConfig, TransformConfig,
    },
    storage::{schema::ensure_schema, Storage},
    Result,
};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

async fn storage() -> Result<Option<Storage>> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping storage test");
        return Ok(None);
    };
    let pool = PgPoolOptions::new().max_connections(2).connect(&url).await?;
    ensure_schema(&pool).await?;
    Ok(Some(Storage::new(pool)))
}

fn unique_id() -> i64 {
    (Uuid::new_v4().as_u64_pair().0 >> 2) as i64
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).single().unwrap_or_default()
}

fn rule(org: OrgId, event_type: &str) -> IntegrationRule {
    IntegrationRule {
        id: RuleId::new(),
        org_id: org,
        org_unit_id: None,
        name: format!("{event_type} rule"),
        event_type: event_type.to_string(),
        scope: None,
        excluded_org_unit_ids: Vec::new(),
        target_url: "https://example.com/hook".into(),
        http_method: HttpMethod::Post,
        auth: Default::default(),
        transform: TransformConfig::Passthrough,
        lookups: Vec::new(),
        delivery_mode: DeliveryMode::Immediate,
        scheduling_config: None,
        timeout_ms: 30_000,
        retry_count: 3,
        retry_strategy: RetryStrategy::Exponential,
        is_active: true,
        actions: Vec::new(),
        action_execution: Default::default(),
        created_at: base_time(),
        updated_at: base_time(),
    }
}

fn scheduled(rule: &IntegrationRule, scheduled_for: i64, patient: &str) -> ScheduledDelivery {
    ScheduledDelivery {
        id: ScheduledDeliveryId::new(),
        rule_id: rule.id,
        org_id: rule.org_id,
        org_unit_id: None,
        original_event_id: EventId(1),
        event_type: rule.event_type.clone(),
        scheduled_for,
        payload: json!({"patientId": patient}),
        status: ScheduleStatus::Pending,
        cancellation_info: Some(CancellationInfo {
            patient_id: patient.to_string(),
            scheduled_date_time: None,
        }),
        recurring_config: None,
        action_index: None,
        attempt: 1,
        last_error: None,
        cancelled_reason: None,
        cancelled_at: None,
        created_at: base_time(),
        updated_at: base_time(),
    }
}

#[tokio::test]
async fn health_check_answers() -> Result<()> {
    let Some(storage) = storage().await? else { return Ok(()) };

    storage.health_check().await
}

#[tokio::test]
async fn rules_are_found_by_event_type_and_wildcard() -> Result<()> {
    let Some(storage) = storage().await? else { return Ok(()) };
    let org = OrgId(unique_id());

    let exact = rule(org, "ORDER_PLACED");
    let wildcard = IntegrationRule { created_at: base_time() + Duration::seconds(1), ..rule(org, "*") };
    let other = rule(org, "ORDER_SHIPPED");
    let inactive = IntegrationRule { is_active: false, ..rule(org, "ORDER_PLACED") };
    for r in [&exact, &wildcard, &other, &inactive] {
        storage.rules.create(r).await?;
    }

    let found = storage.rules.find_active_for_event(org, "ORDER_PLACED").await?;

    let ids: Vec<RuleId> = found.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![exact.id, wildcard.id]);
    Ok(())
}

#[tokio::test]
async fn rule_columns_survive_storage() -> Result<()> {
    let Some(storage) = storage().await? else { return Ok(()) };
    let org = OrgId(unique_id());
    let original = IntegrationRule {
        org_unit_id: Some(OrgUnitId(7)),
        scope: Some(RuleScope::IncludeChildren),
        excluded_org_unit_ids: vec![OrgUnitId(9)],
        http_method: HttpMethod::Put,
        delivery_mode: DeliveryMode::Delayed,
        scheduling_config: Some(SchedulingConfig {
            script: "now() + 60000".into(),
            cancel_on_event_types: vec!["ORDER_CANCELLED".into()],
        }),
        retry_strategy: RetryStrategy::Linear,
        retry_count: 5,
        timeout_ms: 2_500,
        ..rule(org, "ORDER_PLACED")
    };
    storage.rules.create(&original).await?;

    let loaded = storage.rules.find_by_id(original.id).await?;

    assert_eq!(loaded.as_ref(), Some(&original));
    Ok(())
}

#[tokio::test]
async fn cancelling_rules_are_found_by_cancellation_type() -> Result<()> {
    let Some(storage) = storage().await? else { return Ok(()) };
    let org = OrgId(unique_id());
    let delayed = IntegrationRule {
        delivery_mode: DeliveryMode::Delayed,
        scheduling_config: Some(SchedulingConfig {
            script: "now() + 1000".into(),
            cancel_on_event_types: vec!["ORDER_CANCELLED".into()],
        }),
        ..rule(org, "ORDER_PLACED")
    };
    storage.rules.create(&delayed).await?;
    storage.rules.create(&rule(org, "ORDER_PLACED")).await?;

    let cancelling = storage.rules.find_cancelling(org, "ORDER_CANCELLED").await?;
    let unrelated = storage.rules.find_cancelling(org, "ORDER_SHIPPED").await?;

    assert_eq!(cancelling.len(), 1);
    assert_eq!(cancelling[0].id, delayed.id);
    assert!(unrelated.is_empty());
    Ok(())
}

#[tokio::test]
async fn checkpoint_never_moves_backwards() -> Result<()> {
    let Some(storage) = storage().await? else { return Ok(()) };
    let worker = format!("worker-{}", Uuid::new_v4());

    assert!(storage.checkpoints.find(&worker).await?.is_none());

    let first = storage.checkpoints.save(&worker, EventId(50), base_time()).await?;
    let second = storage.checkpoints.save(&worker, EventId(20), base_time()).await?;
    let third = storage.checkpoints.save(&worker, EventId(75), base_time()).await?;

    assert_eq!((first, second, third), (EventId(50), EventId(50), EventId(75)));
    let stored = storage.checkpoints.find(&worker).await?;
    assert_eq!(stored.map(|c| c.last_processed_id), Some(EventId(75)));
    Ok(())
}

#[tokio::test]
async fn due_deliveries_are_returned_oldest_first() -> Result<()> {
    let Some(storage) = storage().await? else { return Ok(()) };
    let org = OrgId(unique_id());
    let r = rule(org, "ORDER_PLACED");
    storage.rules.create(&r).await?;

    // Far-past timestamps keep rows of concurrently running tests out of the window.
    let later = scheduled(&r, 2_000, "p-1");
    let earlier = scheduled(&r, 1_000, "p-2");
    let future = scheduled(&r, i64::MAX / 2, "p-3");
    for d in [&later, &earlier, &future] {
        storage.scheduled_deliveries.create(d).await?;
    }

    let due = storage.scheduled_deliveries.find_due(2_000, 1_000).await?;
    let mine: Vec<_> = due.iter().filter(|d| d.org_id == org).map(|d| d.id).collect();

    assert_eq!(mine, vec![earlier.id, later.id]);
    Ok(())
}

#[tokio::test]
async fn completion_only_applies_to_pending_rows() -> Result<()> {
    let Some(storage) = storage().await? else { return Ok(()) };
    let org = OrgId(unique_id());
    let r = rule(org, "ORDER_PLACED");
    storage.rules.create(&r).await?;
    let d = ScheduledDelivery {
        recurring_config: Some(RecurringConfig {
            first_occurrence: 1_000,
            interval_ms: 60_000,
            max_occurrences: Some(3),
            end_date: None,
            occurrence_number: 1,
        }),
        ..scheduled(&r, 1_000, "p-1")
    };
    storage.scheduled_deliveries.create(&d).await?;

    let failed = storage
        .scheduled_deliveries
        .complete(d.id, ScheduleStatus::Failed, Some("HTTP 500"), base_time())
        .await?;
    let again =
        storage.scheduled_deliveries.complete(d.id, ScheduleStatus::Sent, None, base_time()).await?;

    assert!(failed);
    assert!(!again);
    let stored = storage.scheduled_deliveries.find_by_id(d.id).await?;
    let stored = stored.as_ref();
    assert_eq!(stored.map(|s| s.status), Some(ScheduleStatus::Failed));
    assert_eq!(stored.and_then(|s| s.last_error.as_deref()), Some("HTTP 500"));
    assert_eq!(stored.and_then(|s| s.recurring_config), d.recurring_config);
    Ok(())
}

#[tokio::test]
async fn cancellation_matches_patient_within_the_given_rules() -> Result<()> {
    let Some(storage) = storage().await? else { return Ok(()) };
    let org = OrgId(unique_id());
    let r = rule(org, "APPOINTMENT_CREATED");
    let other_rule = rule(org, "APPOINTMENT_CREATED");
    storage.rules.create(&r).await?;
    storage.rules.create(&other_rule).await?;

    let target = scheduled(&r, 5_000, "p-1");
    let other_patient = scheduled(&r, 5_000, "p-2");
    let outside_rules = scheduled(&other_rule, 5_000, "p-1");
    for d in [&target, &other_patient, &outside_rules] {
        storage.scheduled_deliveries.create(d).await?;
    }

    let criteria = CancellationInfo { patient_id: "p-1".into(), scheduled_date_time: None };
    let cancelled = storage
        .scheduled_deliveries
        .cancel_matching(org, &[r.id], &criteria, "APPOINTMENT_CANCELLED", base_time())
        .await?;

    assert_eq!(cancelled, vec![target.id]);
    let stored = storage.scheduled_deliveries.find_by_id(target.id).await?;
    assert_eq!(stored.as_ref().map(|s| s.status), Some(ScheduleStatus::Cancelled));
    assert_eq!(
        stored.and_then(|s| s.cancelled_reason),
        Some("APPOINTMENT_CANCELLED".to_string())
    );
    assert!(!storage.scheduled_deliveries.cancel_by_id(target.id, "again", base_time()).await?);
    assert!(storage.scheduled_deliveries.cancel_by_id(other_patient.id, "manual", base_time()).await?);
    Ok(())
}

#[tokio::test]
async fn reschedule_keeps_the_row_pending_for_its_next_attempt() -> Result<()> {
    let Some(storage) = storage().await? else { return Ok(()) };
    let org = OrgId(unique_id());
    let r = rule(org, "APPOINTMENT_CREATED");
    storage.rules.create(&r).await?;
    let d = ScheduledDelivery { action_index: Some(1), ..scheduled(&r, 1_000, "p-1") };
    storage.scheduled_deliveries.create(&d).await?;

    let moved = storage
        .scheduled_deliveries
        .reschedule(d.id, 2, 61_000, "DELIVERY_SERVER_ERROR: HTTP 503", base_time())
        .await?;

    assert!(moved);
    let stored = storage.scheduled_deliveries.find_by_id(d.id).await?.expect("row exists");
    assert_eq!(stored.status, ScheduleStatus::Pending);
    assert_eq!(stored.attempt, 2);
    assert_eq!(stored.action_index, Some(1));
    assert_eq!(stored.scheduled_for, 61_000);

    storage.scheduled_deliveries.cancel_by_id(d.id, "manual", base_time()).await?;
    assert!(!storage.scheduled_deliveries.reschedule(d.id, 3, 99_000, "late", base_time()).await?);
    Ok(())
}

#[tokio::test]
async fn dlq_transition_is_guarded_by_the_expected_state() -> Result<()> {
    let Some(storage) = storage().await? else { return Ok(()) };
    let org = OrgId(unique_id());
    let r = rule(org, "ORDER_PLACED");
    storage.rules.create(&r).await?;
    let entry = DlqEntry {
        id: DlqEntryId::new(),
        org_id: org,
        rule_id: r.id,
        event_id: Some(EventId(3)),
        org_unit_id: None,
        event_type: r.event_type.clone(),
        action_index: 0,
        action_name: None,
        status: DlqStatus::Pending,
        error_category: "SERVER_ERROR".into(),
        error_code: "DELIVERY_SERVER_ERROR".into(),
        error_message: "HTTP 503".into(),
        payload: json!({"orderId": "o-1"}),
        retry_count: 0,
        created_at: base_time(),
        failed_at: base_time(),
    };
    storage.dlq_entries.create(&entry).await?;

    let claimed =
        storage.dlq_entries.transition(entry.id, DlqStatus::Pending, DlqStatus::Retrying).await?;
    let raced =
        storage.dlq_entries.transition(entry.id, DlqStatus::Pending, DlqStatus::Retrying).await?;

    assert!(claimed);
    assert!(!raced);

    let resolved = DlqEntry { status: DlqStatus::Resolved, retry_count: 1, ..entry.clone() };
    let stale = DlqEntry { status: DlqStatus::Abandoned, ..entry.clone() };
    assert!(!storage.dlq_entries.update(&stale, DlqStatus::Pending).await?);
    assert!(storage.dlq_entries.update(&resolved, DlqStatus::Retrying).await?);
    let stored = storage.dlq_entries.find_by_id(entry.id).await?;
    assert_eq!(stored.as_ref().map(|e| e.status), Some(DlqStatus::Resolved));
    assert_eq!(stored.map(|e| e.retry_count), Some(1));
    Ok(())
}

#[tokio::test]
async fn unit_mapping_wins_over_organization_mapping() -> Result<()> {
    let Some(storage) = storage().await? else { return Ok(()) };
    let org = OrgId(unique_id());
    let unit = OrgUnitId(unique_id());
    let mappings = &storage.code_mappings;
    mappings.create(org, None, "GENDER", "M", &json!("male")).await?;
    mappings.create(org, Some(unit), "GENDER", "M", &json!("MALE")).await?;

    let for_unit = mappings.resolve(org, Some(unit), "GENDER", "M").await?;
    let for_org = mappings.resolve(org, None, "GENDER", "M").await?;
    let missing = mappings.resolve(org, Some(unit), "GENDER", "X").await?;

    assert_eq!(for_unit, Some(json!("MALE")));
    assert_eq!(for_org, Some(json!("male")));
    assert_eq!(missing, None);
    Ok(())
}

#[tokio::test]
async fn ancestors_are_listed_nearest_first() -> Result<()> {
    let Some(storage) = storage().await? else { return Ok(()) };
    let org = OrgId(unique_id());
    let root = OrgUnitId(unique_id());
    let region = OrgUnitId(unique_id());
    let clinic = OrgUnitId(unique_id());
    storage.org_units.create(root, org, None).await?;
    storage.org_units.create(region, org, Some(root)).await?;
    storage.org_units.create(clinic, org, Some(region)).await?;

    assert_eq!(storage.org_units.ancestors(org, clinic).await?, vec![region, root]);
    assert!(storage.org_units.ancestors(org, root).await?.is_empty());
    assert!(storage.org_units.ancestors(OrgId(unique_id()), clinic).await?.is_empty());
    Ok(())
}
