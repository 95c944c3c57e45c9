//! Dead-letter replay, abandon and circuit reset endpoints.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use conduit_api::{create_router, AppState};
use conduit_core::{
    models::{DlqEntry, DlqStatus, IntegrationRule, RuleId},
    TestClock, UrlPolicy,
};
use conduit_delivery::{
    storage::mock::MockDeliveryStorage, DeliveryClient, DispatchConfig, Dispatcher,
};
use conduit_testing::{dead_letter_for, MockTarget, RuleBuilder};
use serde_json::{json, Value};
use tower::ServiceExt;

struct Harness {
    app: Router,
    state: AppState,
    storage: Arc<MockDeliveryStorage>,
}

fn harness() -> Harness {
    let storage = Arc::new(MockDeliveryStorage::new());
    let dispatcher = Arc::new(Dispatcher::new(
        storage.clone(),
        DeliveryClient::with_defaults().unwrap(),
        Arc::new(TestClock::at_millis(1_740_823_200_000)),
        DispatchConfig { url_policy: UrlPolicy::permissive(), ..DispatchConfig::default() },
    ));
    let state = AppState::new(dispatcher);
    Harness { app: create_router(state.clone(), Duration::from_secs(5)), state, storage }
}

fn post(uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder().method("POST").uri(uri);
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, request: Request<Body>) -> Result<(StatusCode, Value)> {
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    Ok((status, serde_json::from_slice(&bytes).unwrap_or(Value::Null)))
}

async fn stored(storage: &MockDeliveryStorage, entry: &DlqEntry) -> DlqEntry {
    storage.dlq_entries().await.into_iter().find(|e| e.id == entry.id).expect("entry is stored")
}

async fn pending_entry(h: &Harness, rule: IntegrationRule) -> DlqEntry {
    let entry = dead_letter_for(&rule, json!({"orderId": "o-1"}));
    h.storage.add_rule(rule).await;
    h.storage.add_dlq(entry.clone()).await;
    entry
}

#[tokio::test]
async fn retry_resolves_entry_when_target_recovers() -> Result<()> {
    let target = MockTarget::start().await;
    target.always("/hook", 200).await;
    let h = harness();
    let entry =
        pending_entry(&h, RuleBuilder::new("ORDER_PLACED").target(target.url("/hook")).build())
            .await;

    let (status, body) = send(&h.app, post(&format!("/dlq/{}/retry", entry.id), None)).await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "resolved");
    assert_eq!(body["retryCount"], 1);
    assert_eq!(target.received_json().await, vec![json!({"orderId": "o-1"})]);
    assert_eq!(stored(&h.storage, &entry).await.status, DlqStatus::Resolved);
    Ok(())
}

#[tokio::test]
async fn failed_retry_returns_entry_to_pending() -> Result<()> {
    let target = MockTarget::start().await;
    target.always("/hook", 400).await;
    let h = harness();
    let entry =
        pending_entry(&h, RuleBuilder::new("ORDER_PLACED").target(target.url("/hook")).build())
            .await;

    let (status, body) = send(&h.app, post(&format!("/dlq/{}/retry", entry.id), None)).await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert!(body["errorCode"].is_string());
    let after = stored(&h.storage, &entry).await;
    assert_eq!(after.status, DlqStatus::Pending);
    assert_eq!(after.retry_count, 1);
    Ok(())
}

#[tokio::test]
async fn retry_of_unknown_entry_is_not_found() -> Result<()> {
    let h = harness();

    let (status, body) =
        send(&h.app, post(&format!("/dlq/{}/retry", uuid::Uuid::new_v4()), None)).await?;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "DLQ_NOT_FOUND");
    Ok(())
}

#[tokio::test]
async fn retry_of_resolved_entry_conflicts() -> Result<()> {
    let h = harness();
    let rule = RuleBuilder::new("ORDER_PLACED").build();
    let entry = DlqEntry { status: DlqStatus::Resolved, ..dead_letter_for(&rule, json!({})) };
    h.storage.add_rule(rule).await;
    h.storage.add_dlq(entry.clone()).await;

    let (status, body) = send(&h.app, post(&format!("/dlq/{}/retry", entry.id), None)).await?;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "DLQ_RESOLVED");
    Ok(())
}

#[tokio::test]
async fn retry_with_deleted_rule_is_unprocessable() -> Result<()> {
    let h = harness();
    let entry = dead_letter_for(&RuleBuilder::new("ORDER_PLACED").build(), json!({}));
    h.storage.add_dlq(entry.clone()).await;

    let (status, body) = send(&h.app, post(&format!("/dlq/{}/retry", entry.id), None)).await?;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "DLQ_RULE_MISSING");
    Ok(())
}

#[tokio::test]
async fn retry_through_an_inactive_rule_is_unprocessable() -> Result<()> {
    let target = MockTarget::start().await;
    target.always("/hook", 200).await;
    let h = harness();
    let entry = pending_entry(
        &h,
        RuleBuilder::new("ORDER_PLACED").target(target.url("/hook")).inactive().build(),
    )
    .await;

    let (status, body) = send(&h.app, post(&format!("/dlq/{}/retry", entry.id), None)).await?;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "DLQ_RULE_INACTIVE");
    assert_eq!(target.request_count().await, 0);
    assert_eq!(stored(&h.storage, &entry).await.status, DlqStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn malformed_entry_id_is_a_bad_request() -> Result<()> {
    let h = harness();

    let (status, _) = send(&h.app, post("/dlq/not-a-uuid/retry", None)).await?;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn bulk_retry_reports_each_entry() -> Result<()> {
    let target = MockTarget::start().await;
    target.always("/hook", 200).await;
    let h = harness();
    let entry =
        pending_entry(&h, RuleBuilder::new("ORDER_PLACED").target(target.url("/hook")).build())
            .await;
    let missing = uuid::Uuid::new_v4();

    let (status, body) = send(
        &h.app,
        post("/dlq/retry", Some(json!({"ids": [entry.id.0, missing]}))),
    )
    .await?;

    assert_eq!(status, StatusCode::OK);
    let results = body["results"].as_array().expect("results array");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["result"]["status"], "resolved");
    assert!(results[0].get("error").is_none());
    assert_eq!(results[1]["id"], missing.to_string());
    assert_eq!(results[1]["error"]["code"], "DLQ_NOT_FOUND");
    Ok(())
}

#[tokio::test]
async fn bulk_retry_requires_ids() -> Result<()> {
    let h = harness();

    let (status, body) = send(&h.app, post("/dlq/retry", Some(json!({"ids": []})))).await?;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
    Ok(())
}

#[tokio::test]
async fn abandon_records_the_reason() -> Result<()> {
    let h = harness();
    let entry = pending_entry(&h, RuleBuilder::new("ORDER_PLACED").build()).await;

    let (status, body) = send(
        &h.app,
        post(&format!("/dlq/{}/abandon", entry.id), Some(json!({"reason": "duplicate order"}))),
    )
    .await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "abandoned");
    let after = stored(&h.storage, &entry).await;
    assert_eq!(after.status, DlqStatus::Abandoned);
    assert!(after.error_message.ends_with("(abandoned: duplicate order)"));
    Ok(())
}

#[tokio::test]
async fn abandon_accepts_an_empty_body() -> Result<()> {
    let h = harness();
    let entry = pending_entry(&h, RuleBuilder::new("ORDER_PLACED").build()).await;

    let (status, _) = send(&h.app, post(&format!("/dlq/{}/abandon", entry.id), None)).await?;

    assert_eq!(status, StatusCode::OK);
    let after = stored(&h.storage, &entry).await;
    assert_eq!(after.status, DlqStatus::Abandoned);
    assert_eq!(after.error_message, entry.error_message);
    Ok(())
}

#[tokio::test]
async fn abandoned_entry_cannot_be_abandoned_or_retried() -> Result<()> {
    let h = harness();
    let entry = pending_entry(&h, RuleBuilder::new("ORDER_PLACED").build()).await;
    send(&h.app, post(&format!("/dlq/{}/abandon", entry.id), None)).await?;

    let (again, body) = send(&h.app, post(&format!("/dlq/{}/abandon", entry.id), None)).await?;
    let (retry, _) = send(&h.app, post(&format!("/dlq/{}/retry", entry.id), None)).await?;

    assert_eq!(again, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "DLQ_ABANDONED");
    assert_eq!(retry, StatusCode::CONFLICT);
    Ok(())
}

#[tokio::test]
async fn open_circuit_is_listed_and_reset() -> Result<()> {
    let h = harness();
    let rule_id = RuleId::new();
    for _ in 0..5 {
        h.state.circuits.record_failure(rule_id).await;
    }

    let list = Request::builder().uri("/circuits").body(Body::empty())?;
    let (_, circuits) = send(&h.app, list).await?;
    assert_eq!(circuits[0]["ruleId"], rule_id.to_string());
    assert_eq!(circuits[0]["state"], "open");
    assert_eq!(circuits[0]["consecutiveFailures"], 5);

    let (status, body) =
        send(&h.app, post(&format!("/circuits/{rule_id}/reset"), None)).await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["previousState"], "open");
    assert_eq!(body["state"], "closed");
    assert!(h.state.circuits.should_allow_request(rule_id).await);
    Ok(())
}

#[tokio::test]
async fn resetting_an_untracked_circuit_reports_no_previous_state() -> Result<()> {
    let h = harness();

    let (status, body) =
        send(&h.app, post(&format!("/circuits/{}/reset", RuleId::new()), None)).await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["previousState"], Value::Null);
    Ok(())
}
