//! Wire shapes of the domain models.
//!
//! Rules are authored elsewhere as camelCase JSON documents; these tests pin
//! down how such documents load and how audit records serialize.

use chrono::{TimeZone, Utc};
use conduit_core::models::{
    ActionExecution, AuthType, CancellationInfo, DeliveryAttemptLog, DeliveryLogId, DeliveryMode,
    DeliveryStatus, DlqEntry, DlqEntryId, DlqStatus, EventId, HttpMethod, IntegrationRule, OrgId,
    OrgUnitId, RuleId, RuleScope, ScheduleStatus, ScheduledDelivery, TransformConfig,
    UnmappedBehavior,
};
use serde_json::json;

fn multi_action_rule() -> serde_json::Value {
    json!({
        "id": "0f8fad5b-d9cb-469f-a165-70867728950e",
        "orgId": 4,
        "orgUnitId": 40,
        "name": "Appointment fan-out",
        "eventType": "APPOINTMENT_CREATED",
        "scope": "INCLUDE_CHILDREN",
        "excludedOrgUnitIds": [41, 42],
        "targetUrl": "https://primary.example.com/hook",
        "httpMethod": "PATCH",
        "auth": {"authType": "BEARER", "authConfig": {"token": "t-1"}},
        "transform": {"mode": "SCRIPT", "script": "#{ id: payload.id }"},
        "lookups": [
            {"type": "GENDER", "sourceField": "gender", "targetField": "genderCode",
             "unmappedBehavior": "DEFAULT", "defaultValue": "U"}
        ],
        "deliveryMode": "DELAYED",
        "schedulingConfig": {
            "script": "payload.startsAt - 86400000",
            "cancelOnEventTypes": ["APPOINTMENT_CANCELLED"]
        },
        "timeoutMs": 5000,
        "retryCount": 2,
        "retryStrategy": "LINEAR",
        "isActive": true,
        "actionExecution": "SEQUENTIAL",
        "actions": [
            {"name": "crm", "targetUrl": "https://crm.example.com/appointments"},
            {"name": "sms", "targetUrl": "https://sms.example.com/send", "httpMethod": "POST",
             "transform": {"mode": "NONE"}}
        ],
        "createdAt": "2025-02-01T08:00:00Z",
        "updatedAt": "2025-02-02T08:00:00Z"
    })
}

#[test]
fn full_rule_document_loads() {
    let rule: IntegrationRule = serde_json::from_value(multi_action_rule()).unwrap();

    assert_eq!(rule.org_id, OrgId(4));
    assert_eq!(rule.org_unit_id, Some(OrgUnitId(40)));
    assert_eq!(rule.scope, Some(RuleScope::IncludeChildren));
    assert_eq!(rule.excluded_org_unit_ids, vec![OrgUnitId(41), OrgUnitId(42)]);
    assert_eq!(rule.http_method, HttpMethod::Patch);
    assert_eq!(rule.auth.kind(), Ok(AuthType::Bearer));
    assert_eq!(rule.auth.config["token"], "t-1");
    assert!(matches!(rule.transform, TransformConfig::Script { .. }));
    assert_eq!(rule.lookups[0].lookup_type, "GENDER");
    assert_eq!(rule.lookups[0].unmapped_behavior, UnmappedBehavior::Default);
    assert_eq!(rule.delivery_mode, DeliveryMode::Delayed);
    assert!(rule.cancels_on("APPOINTMENT_CANCELLED"));
    assert_eq!(rule.timeout_ms, 5000);
    assert_eq!(rule.action_execution, ActionExecution::Sequential);
}

#[test]
fn actions_fall_back_to_rule_settings() {
    let rule: IntegrationRule = serde_json::from_value(multi_action_rule()).unwrap();

    let targets = rule.targets();

    assert_eq!(targets.len(), 2);
    assert_eq!(targets[0].action_name.as_deref(), Some("crm"));
    assert_eq!(targets[0].http_method, HttpMethod::Patch);
    assert_eq!(targets[0].auth, rule.auth);
    assert_eq!(targets[0].transform, rule.transform);
    assert_eq!(targets[0].lookups, rule.lookups);
    assert_eq!(targets[1].http_method, HttpMethod::Post);
    assert_eq!(targets[1].transform, TransformConfig::Passthrough);
}

#[test]
fn unknown_enum_text_is_rejected() {
    let mut doc = multi_action_rule();
    doc["retryStrategy"] = json!("QUADRATIC");

    assert!(serde_json::from_value::<IntegrationRule>(doc).is_err());
}

#[test]
fn unknown_auth_type_surfaces_at_use() {
    let mut doc = multi_action_rule();
    doc["auth"] = json!({"authType": "KERBEROS"});
    let rule: IntegrationRule = serde_json::from_value(doc).unwrap();

    assert!(rule.auth.kind().is_err());
}

#[test]
fn delivery_log_serializes_camel_case() {
    let log = DeliveryAttemptLog {
        id: DeliveryLogId::new(),
        rule_id: RuleId::new(),
        event_id: Some(EventId(12)),
        scheduled_delivery_id: None,
        org_id: OrgId(1),
        action_name: Some("crm".into()),
        status: DeliveryStatus::Retrying,
        response_status: Some(503),
        response_time_ms: 42,
        attempt_count: 1,
        request_payload: Some(json!({"a": 1})),
        response_body: Some("busy".into()),
        error_code: Some("DELIVERY_SERVER_ERROR".into()),
        error_message: Some("HTTP 503".into()),
        created_at: Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap(),
    };

    let value = serde_json::to_value(&log).unwrap();

    assert_eq!(value["status"], "RETRYING");
    assert_eq!(value["eventId"], 12);
    assert_eq!(value["responseTimeMs"], 42);
    assert_eq!(value["actionName"], "crm");
    assert_eq!(value["scheduledDeliveryId"], serde_json::Value::Null);
}

#[test]
fn dlq_status_is_lowercase_and_terminality_is_fixed() {
    let entry = DlqEntry {
        id: DlqEntryId::new(),
        org_id: OrgId(1),
        rule_id: RuleId::new(),
        event_id: None,
        org_unit_id: None,
        event_type: "ORDER_PLACED".into(),
        action_index: 1,
        action_name: Some("sms".into()),
        status: DlqStatus::Abandoned,
        error_category: "CLIENT_ERROR".into(),
        error_code: "DELIVERY_CLIENT_ERROR".into(),
        error_message: "HTTP 400".into(),
        payload: json!({}),
        retry_count: 2,
        created_at: Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap(),
        failed_at: Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap(),
    };

    assert_eq!(serde_json::to_value(&entry).unwrap()["status"], "abandoned");
    assert!(DlqStatus::Abandoned.is_terminal());
    assert!(DlqStatus::Resolved.is_terminal());
    assert!(!DlqStatus::Pending.is_terminal());
    assert!(!DlqStatus::Retrying.is_terminal());
}

#[test]
fn scheduled_delivery_loads_with_cancellation_info() {
    let delivery: ScheduledDelivery = serde_json::from_value(json!({
        "id": "5b0c7e48-7e73-4b71-8d39-0c4cf3b1e9f2",
        "ruleId": "0f8fad5b-d9cb-469f-a165-70867728950e",
        "orgId": 4,
        "orgUnitId": null,
        "originalEventId": 99,
        "eventType": "APPOINTMENT_CREATED",
        "scheduledFor": 1_740_823_200_000_i64,
        "payload": {"patientId": "p-9"},
        "status": "PENDING",
        "cancellationInfo": {"patientId": "p-9", "scheduledDateTime": "2025-03-02T10:00:00.000Z"},
        "recurringConfig": null,
        "lastError": null,
        "cancelledReason": null,
        "cancelledAt": null,
        "createdAt": "2025-03-01T09:00:00Z",
        "updatedAt": "2025-03-01T09:00:00Z"
    }))
    .unwrap();

    assert_eq!(delivery.status, ScheduleStatus::Pending);
    assert_eq!(delivery.original_event_id, EventId(99));
    let info = delivery.cancellation_info.unwrap();
    assert!(info.matched_by(&CancellationInfo { patient_id: "p-9".into(), scheduled_date_time: None }));
}
