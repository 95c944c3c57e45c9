//! Test data builders with sensible defaults.
//!
//! Builders take plain integers for org and unit ids so test bodies stay
//! short; they produce the real model types.

use chrono::{DateTime, TimeZone, Utc};
use conduit_core::models::{
    ActionExecution, AuthSettings, DeliveryMode, DlqEntry, DlqEntryId, DlqStatus, Event, EventId,
    HttpMethod, IntegrationRule, LookupConfig, OrgId, OrgUnitId, RetryStrategy, RuleAction,
    RuleId, RuleScope, SchedulingConfig, TransformConfig,
};
use serde_json::{json, Value};

/// Fixed instant used when a test does not care about time.
pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).single().unwrap_or_default()
}

/// Builder for [`IntegrationRule`].
#[derive(Debug, Clone)]
pub struct RuleBuilder {
    rule: IntegrationRule,
}

impl RuleBuilder {
    /// Active immediate rule for `event_type` in org 1, posting to
    /// `https://example.com/hook` with no retries.
    pub fn new(event_type: impl Into<String>) -> Self {
        let now = fixed_time();
        Self {
            rule: IntegrationRule {
                id: RuleId::new(),
                org_id: OrgId(1),
                org_unit_id: None,
                name: "test rule".into(),
                event_type: event_type.into(),
                scope: None,
                excluded_org_unit_ids: Vec::new(),
                target_url: "https://example.com/hook".into(),
                http_method: HttpMethod::Post,
                auth: AuthSettings::none(),
                transform: TransformConfig::Passthrough,
                lookups: Vec::new(),
                delivery_mode: DeliveryMode::Immediate,
                scheduling_config: None,
                timeout_ms: 5_000,
                retry_count: 0,
                retry_strategy: RetryStrategy::Fixed,
                is_active: true,
                actions: Vec::new(),
                action_execution: ActionExecution::Parallel,
                created_at: now,
                updated_at: now,
            },
        }
    }

    /// Sets the organization.
    pub fn org(mut self, org_id: i64) -> Self {
        self.rule.org_id = OrgId(org_id);
        self
    }

    /// Sets the anchor unit; `None` makes the rule org-wide.
    pub fn org_unit(mut self, unit: Option<i64>) -> Self {
        self.rule.org_unit_id = unit.map(OrgUnitId);
        self
    }

    /// Sets the hierarchy scope.
    pub fn scope(mut self, scope: Option<RuleScope>) -> Self {
        self.rule.scope = scope;
        self
    }

    /// Excludes descendant units.
    pub fn excluding(mut self, units: &[i64]) -> Self {
        self.rule.excluded_org_unit_ids = units.iter().copied().map(OrgUnitId).collect();
        self
    }

    /// Sets the target URL.
    pub fn target(mut self, url: impl Into<String>) -> Self {
        self.rule.target_url = url.into();
        self
    }

    /// Sets the HTTP method.
    pub fn method(mut self, method: HttpMethod) -> Self {
        self.rule.http_method = method;
        self
    }

    /// Sets the auth type and config.
    ///
    /// # Panics
    ///
    /// Panics if `config` is not a JSON object.
    pub fn auth(mut self, auth_type: &str, config: Value) -> Self {
        let Value::Object(config) = config else { panic!("auth config must be an object") };
        self.rule.auth = AuthSettings { auth_type: auth_type.into(), config };
        self
    }

    /// Sets the transform.
    pub fn transform(mut self, transform: TransformConfig) -> Self {
        self.rule.transform = transform;
        self
    }

    /// Sets a scripted transform.
    pub fn script(self, script: impl Into<String>) -> Self {
        self.transform(TransformConfig::Script { script: script.into() })
    }

    /// Appends a lookup step.
    pub fn lookup(mut self, lookup: LookupConfig) -> Self {
        self.rule.lookups.push(lookup);
        self
    }

    /// Sets the retry budget and strategy.
    pub fn retries(mut self, count: u32, strategy: RetryStrategy) -> Self {
        self.rule.retry_count = count;
        self.rule.retry_strategy = strategy;
        self
    }

    /// Sets the per-request timeout.
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.rule.timeout_ms = timeout_ms;
        self
    }

    /// Makes the rule delayed with the given scheduling script.
    pub fn delayed(mut self, script: impl Into<String>) -> Self {
        self.rule.delivery_mode = DeliveryMode::Delayed;
        self.rule.scheduling_config =
            Some(SchedulingConfig { script: script.into(), cancel_on_event_types: Vec::new() });
        self
    }

    /// Makes the rule recurring with the given scheduling script.
    pub fn recurring(mut self, script: impl Into<String>) -> Self {
        self.rule.delivery_mode = DeliveryMode::Recurring;
        self.rule.scheduling_config =
            Some(SchedulingConfig { script: script.into(), cancel_on_event_types: Vec::new() });
        self
    }

    /// Event types that cancel pending scheduled deliveries.
    ///
    /// Only effective after [`delayed`](Self::delayed) or
    /// [`recurring`](Self::recurring).
    pub fn cancel_on(mut self, event_types: &[&str]) -> Self {
        if let Some(cfg) = self.rule.scheduling_config.as_mut() {
            cfg.cancel_on_event_types = event_types.iter().map(|t| (*t).to_string()).collect();
        }
        self
    }

    /// Adds a named action that inherits everything but its URL.
    pub fn action(mut self, name: &str, url: impl Into<String>) -> Self {
        self.rule.actions.push(RuleAction {
            name: name.into(),
            target_url: url.into(),
            http_method: None,
            auth: None,
            transform: None,
            lookups: None,
        });
        self
    }

    /// Sets how actions run.
    pub fn execution(mut self, execution: ActionExecution) -> Self {
        self.rule.action_execution = execution;
        self
    }

    /// Marks the rule inactive.
    pub fn inactive(mut self) -> Self {
        self.rule.is_active = false;
        self
    }

    /// Finishes the rule.
    pub fn build(self) -> IntegrationRule {
        self.rule
    }
}

/// Builder for [`Event`].
#[derive(Debug, Clone)]
pub struct EventBuilder {
    event: Event,
}

impl EventBuilder {
    /// Event 1 of `event_type` in org 1 with payload `{"patientId": "p-1"}`.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event: Event {
                id: EventId(1),
                org_id: OrgId(1),
                org_unit_id: None,
                event_type: event_type.into(),
                payload: json!({"patientId": "p-1"}),
                timestamp: fixed_time(),
                source: "test".into(),
            },
        }
    }

    /// Sets the id.
    pub fn id(mut self, id: i64) -> Self {
        self.event.id = EventId(id);
        self
    }

    /// Sets the organization.
    pub fn org(mut self, org_id: i64) -> Self {
        self.event.org_id = OrgId(org_id);
        self
    }

    /// Sets the unit.
    pub fn org_unit(mut self, unit: Option<i64>) -> Self {
        self.event.org_unit_id = unit.map(OrgUnitId);
        self
    }

    /// Sets the payload.
    pub fn payload(mut self, payload: Value) -> Self {
        self.event.payload = payload;
        self
    }

    /// Sets the occurrence time.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.event.timestamp = timestamp;
        self
    }

    /// Finishes the event.
    pub fn build(self) -> Event {
        self.event
    }
}

/// Pending dead-letter entry for the first action of `rule`, as left by a
/// 503 from the target.
pub fn dead_letter_for(rule: &IntegrationRule, payload: Value) -> DlqEntry {
    DlqEntry {
        id: DlqEntryId::new(),
        org_id: rule.org_id,
        rule_id: rule.id,
        event_id: Some(EventId(7)),
        org_unit_id: None,
        event_type: rule.event_type.clone(),
        action_index: 0,
        action_name: None,
        status: DlqStatus::Pending,
        error_category: "server".into(),
        error_code: "DELIVERY_SERVER_ERROR".into(),
        error_message: "server error: HTTP 503".into(),
        payload,
        retry_count: 0,
        created_at: fixed_time(),
        failed_at: fixed_time(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_defaults_are_deliverable() {
        let rule = RuleBuilder::new("A").build();

        assert!(rule.is_active);
        assert!(rule.matches_event_type("A"));
        assert_eq!(rule.targets().len(), 1);
        assert_eq!(rule.retry_count, 0);
    }

    #[test]
    fn cancel_on_requires_a_schedule() {
        let immediate = RuleBuilder::new("A").cancel_on(&["B"]).build();
        let delayed = RuleBuilder::new("A").delayed("now() + 1000").cancel_on(&["B"]).build();

        assert!(!immediate.cancels_on("B"));
        assert!(delayed.cancels_on("B"));
    }

    #[test]
    fn event_builder_sets_fields() {
        let event = EventBuilder::new("A").id(7).org(3).org_unit(Some(9)).build();

        assert_eq!(event.id, EventId(7));
        assert_eq!(event.org_id, OrgId(3));
        assert_eq!(event.org_unit_id, Some(OrgUnitId(9)));
    }
}
