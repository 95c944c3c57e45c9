//! Integration rules: organization-owned delivery configuration.
//!
//! Rules are read-only from the gateway's point of view. The admin surface
//! that edits them lives elsewhere; this module only describes their shape
//! and derives the concrete delivery targets a rule fans out to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{text_enum, OrgId, OrgUnitId, RuleId};

text_enum!(
    /// How far down the unit hierarchy a rule reaches.
    RuleScope {
        /// Only events on the rule's own unit.
        EntityOnly => "ENTITY_ONLY",
        /// The rule's unit and all descendants.
        IncludeChildren => "INCLUDE_CHILDREN",
    }
);

text_enum!(
    /// HTTP method used for outbound delivery.
    HttpMethod {
        /// GET, sent without a body.
        Get => "GET",
        /// POST.
        Post => "POST",
        /// PUT.
        Put => "PUT",
        /// PATCH.
        Patch => "PATCH",
        /// DELETE, sent without a body.
        Delete => "DELETE",
    }
);

impl HttpMethod {
    /// Whether requests with this method carry the transformed payload.
    pub const fn carries_body(&self) -> bool {
        !matches!(self, Self::Get | Self::Delete)
    }
}

impl Default for HttpMethod {
    fn default() -> Self {
        Self::Post
    }
}

text_enum!(
    /// Supported outbound authentication schemes.
    AuthType {
        /// No authentication headers.
        None => "NONE",
        /// Static key in a named header.
        ApiKey => "API_KEY",
        /// HTTP basic authentication.
        Basic => "BASIC",
        /// Static bearer token.
        Bearer => "BEARER",
        /// Arbitrary static headers.
        CustomHeaders => "CUSTOM_HEADERS",
        /// OAuth2 client-credentials grant.
        Oauth2 => "OAUTH2",
        /// Configurable token fetch.
        Custom => "CUSTOM",
    }
);

text_enum!(
    /// When a matched rule delivers.
    DeliveryMode {
        /// Deliver during the polling tick.
        Immediate => "IMMEDIATE",
        /// Deliver once at a script-computed time.
        Delayed => "DELAYED",
        /// Deliver repeatedly on a script-computed cadence.
        Recurring => "RECURRING",
    }
);

impl Default for DeliveryMode {
    fn default() -> Self {
        Self::Immediate
    }
}

text_enum!(
    /// Backoff strategy between inline retries.
    RetryStrategy {
        /// Constant delay.
        Fixed => "FIXED",
        /// Delay grows linearly with the attempt number.
        Linear => "LINEAR",
        /// Delay doubles each attempt.
        Exponential => "EXPONENTIAL",
    }
);

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

text_enum!(
    /// How a multi-action rule runs its actions.
    ActionExecution {
        /// All actions concurrently.
        Parallel => "PARALLEL",
        /// One after another, in declaration order.
        Sequential => "SEQUENTIAL",
    }
);

impl Default for ActionExecution {
    fn default() -> Self {
        Self::Parallel
    }
}

text_enum!(
    /// What a lookup does when a code has no mapping.
    UnmappedBehavior {
        /// Copy the source value through.
        Passthrough => "PASSTHROUGH",
        /// Write the configured default value.
        Default => "DEFAULT",
        /// Abort the lookup chain.
        Fail => "FAIL",
    }
);

impl Default for UnmappedBehavior {
    fn default() -> Self {
        Self::Passthrough
    }
}

text_enum!(
    /// Per-field transform applied by declarative mappings.
    FieldTransform {
        /// Trim surrounding whitespace.
        Trim => "trim",
        /// Upper-case.
        Upper => "upper",
        /// Lower-case.
        Lower => "lower",
        /// Normalize to ISO-8601 UTC with millisecond precision.
        Date => "date",
        /// Substitute the mapping's default for null.
        Default => "default",
    }
);

/// Authentication configuration for a target.
///
/// `auth_type` is kept as text so that an unknown scheme surfaces as a
/// named error at delivery time instead of making the whole rule unreadable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSettings {
    /// Scheme name, one of the [`AuthType`] labels.
    pub auth_type: String,
    /// Scheme-specific settings.
    #[serde(default, rename = "authConfig")]
    pub config: Map<String, Value>,
}

impl AuthSettings {
    /// Settings for unauthenticated delivery.
    pub fn none() -> Self {
        Self { auth_type: AuthType::None.as_str().to_string(), config: Map::new() }
    }

    /// Parses the scheme name.
    pub fn kind(&self) -> Result<AuthType, String> {
        self.auth_type.parse()
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self::none()
    }
}

/// One declarative field mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    /// Dot path into the source payload, `[]` maps over arrays.
    pub source_field: String,
    /// Dot path in the output.
    pub target_field: String,
    /// Optional per-value transform.
    #[serde(default)]
    pub transform: Option<FieldTransform>,
    /// Written when the source is missing, or null under `default`.
    #[serde(default)]
    pub default_value: Option<Value>,
}

/// A constant written into every output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticField {
    /// Dot path in the output.
    pub key: String,
    /// Constant value.
    pub value: Value,
}

/// Declarative transform settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleTransform {
    /// Field mappings applied in order.
    #[serde(default)]
    pub mappings: Vec<FieldMapping>,
    /// Constants written after the mappings.
    #[serde(default)]
    pub static_fields: Vec<StaticField>,
}

/// Payload transform configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode")]
pub enum TransformConfig {
    /// Forward the payload unchanged.
    #[default]
    #[serde(rename = "NONE")]
    Passthrough,
    /// Declarative field mapping.
    #[serde(rename = "SIMPLE")]
    Simple(SimpleTransform),
    /// Sandboxed script.
    #[serde(rename = "SCRIPT")]
    Script {
        /// Script body with `payload` and `context` in scope.
        script: String,
    },
}

/// One code-mapping lookup step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupConfig {
    /// Mapping namespace, e.g. `GENDER` or `VISIT_TYPE`.
    #[serde(rename = "type")]
    pub lookup_type: String,
    /// Path of the code to resolve.
    pub source_field: String,
    /// Path the resolved value is written to.
    pub target_field: String,
    /// Policy when no mapping exists.
    #[serde(default)]
    pub unmapped_behavior: UnmappedBehavior,
    /// Value written under [`UnmappedBehavior::Default`].
    #[serde(default)]
    pub default_value: Option<Value>,
}

/// Scheduling settings for delayed and recurring rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingConfig {
    /// Script computing the delivery time or recurrence.
    pub script: String,
    /// Event types that cancel this rule's pending deliveries.
    #[serde(default)]
    pub cancel_on_event_types: Vec<String>,
}

/// A secondary target of a multi-action rule.
///
/// Unset fields inherit the rule's own settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleAction {
    /// Label used in logs and dead-letter entries.
    pub name: String,
    /// Destination URL.
    pub target_url: String,
    /// Method override.
    #[serde(default)]
    pub http_method: Option<HttpMethod>,
    /// Auth override.
    #[serde(default)]
    pub auth: Option<AuthSettings>,
    /// Transform override.
    #[serde(default)]
    pub transform: Option<TransformConfig>,
    /// Lookup override.
    #[serde(default)]
    pub lookups: Option<Vec<LookupConfig>>,
}

/// A fully resolved delivery destination.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryTarget {
    /// Position in the rule's action list, 0 for single-target rules.
    pub index: usize,
    /// Action name, `None` for single-target rules.
    pub action_name: Option<String>,
    /// Destination URL.
    pub target_url: String,
    /// HTTP method.
    pub http_method: HttpMethod,
    /// Authentication.
    pub auth: AuthSettings,
    /// Payload transform.
    pub transform: TransformConfig,
    /// Lookups run before the transform.
    pub lookups: Vec<LookupConfig>,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_retry_count() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

/// Tenant-owned integration rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationRule {
    /// Rule identifier.
    pub id: RuleId,
    /// Owning organization.
    pub org_id: OrgId,
    /// Anchor unit; `None` anchors the rule at the organization root.
    #[serde(default)]
    pub org_unit_id: Option<OrgUnitId>,
    /// Display name.
    pub name: String,
    /// Event type to match, or `*`.
    pub event_type: String,
    /// Hierarchy reach; unset inherits to descendants.
    #[serde(default)]
    pub scope: Option<RuleScope>,
    /// Units never matched by this rule.
    #[serde(default)]
    pub excluded_org_unit_ids: Vec<OrgUnitId>,
    /// Destination URL.
    pub target_url: String,
    /// HTTP method.
    #[serde(default)]
    pub http_method: HttpMethod,
    /// Authentication.
    #[serde(default)]
    pub auth: AuthSettings,
    /// Payload transform.
    #[serde(default)]
    pub transform: TransformConfig,
    /// Lookups run before the transform.
    #[serde(default)]
    pub lookups: Vec<LookupConfig>,
    /// Immediate, delayed or recurring.
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    /// Required for delayed and recurring rules.
    #[serde(default)]
    pub scheduling_config: Option<SchedulingConfig>,
    /// Per-request timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Retries after the first attempt.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Backoff between retries.
    #[serde(default)]
    pub retry_strategy: RetryStrategy,
    /// Inactive rules never match.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Additional targets; empty means the rule itself is the target.
    #[serde(default)]
    pub actions: Vec<RuleAction>,
    /// How `actions` run.
    #[serde(default)]
    pub action_execution: ActionExecution,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl IntegrationRule {
    /// Whether the rule listens to `event_type`, either exactly or by `*`.
    pub fn matches_event_type(&self, event_type: &str) -> bool {
        self.event_type == "*" || self.event_type == event_type
    }

    /// Whether `event_type` cancels this rule's pending scheduled deliveries.
    pub fn cancels_on(&self, event_type: &str) -> bool {
        self.scheduling_config
            .as_ref()
            .is_some_and(|cfg| cfg.cancel_on_event_types.iter().any(|t| t == event_type))
    }

    /// Resolves the delivery targets, applying per-action overrides.
    pub fn targets(&self) -> Vec<DeliveryTarget> {
        if self.actions.is_empty() {
            return vec![DeliveryTarget {
                index: 0,
                action_name: None,
                target_url: self.target_url.clone(),
                http_method: self.http_method,
                auth: self.auth.clone(),
                transform: self.transform.clone(),
                lookups: self.lookups.clone(),
            }];
        }

        self.actions
            .iter()
            .enumerate()
            .map(|(index, action)| DeliveryTarget {
                index,
                action_name: Some(action.name.clone()),
                target_url: action.target_url.clone(),
                http_method: action.http_method.unwrap_or(self.http_method),
                auth: action.auth.clone().unwrap_or_else(|| self.auth.clone()),
                transform: action.transform.clone().unwrap_or_else(|| self.transform.clone()),
                lookups: action.lookups.clone().unwrap_or_else(|| self.lookups.clone()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn rule_json() -> Value {
        json!({
            "id": "7f1c7a8e-3c1f-4a1e-9d52-2c3d3c9b1a11",
            "orgId": 1,
            "name": "appointments",
            "eventType": "APPOINTMENT_CREATED",
            "targetUrl": "https://example.com/hook",
            "createdAt": "2025-01-01T00:00:00Z",
            "updatedAt": "2025-01-01T00:00:00Z"
        })
    }

    #[test]
    fn minimal_rule_gets_defaults() {
        let rule: IntegrationRule = serde_json::from_value(rule_json()).unwrap();

        assert_eq!(rule.http_method, HttpMethod::Post);
        assert_eq!(rule.delivery_mode, DeliveryMode::Immediate);
        assert_eq!(rule.retry_strategy, RetryStrategy::Exponential);
        assert_eq!(rule.retry_count, 3);
        assert_eq!(rule.timeout_ms, 30_000);
        assert!(rule.is_active);
        assert_eq!(rule.transform, TransformConfig::Passthrough);
        assert_eq!(rule.auth.kind(), Ok(AuthType::None));
    }

    #[test]
    fn transform_config_is_tagged_by_mode() {
        let cfg: TransformConfig = serde_json::from_value(json!({
            "mode": "SIMPLE",
            "mappings": [{"sourceField": "a", "targetField": "b", "transform": "upper"}],
            "staticFields": [{"key": "source", "value": "conduit"}]
        }))
        .unwrap();

        let TransformConfig::Simple(simple) = cfg else { panic!("expected simple transform") };
        assert_eq!(simple.mappings[0].transform, Some(FieldTransform::Upper));
        assert_eq!(simple.static_fields[0].value, json!("conduit"));
    }

    #[test]
    fn wildcard_matches_every_event_type() {
        let mut rule: IntegrationRule = serde_json::from_value(rule_json()).unwrap();
        assert!(rule.matches_event_type("APPOINTMENT_CREATED"));
        assert!(!rule.matches_event_type("PATIENT_CREATED"));

        rule.event_type = "*".into();
        assert!(rule.matches_event_type("PATIENT_CREATED"));
    }

    #[test]
    fn single_target_rule_is_its_own_target() {
        let rule: IntegrationRule = serde_json::from_value(rule_json()).unwrap();
        let targets = rule.targets();

        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].index, 0);
        assert_eq!(targets[0].action_name, None);
        assert_eq!(targets[0].target_url, "https://example.com/hook");
    }

    #[test]
    fn actions_inherit_unset_fields() {
        let mut rule: IntegrationRule = serde_json::from_value(rule_json()).unwrap();
        rule.http_method = HttpMethod::Put;
        rule.actions = vec![
            RuleAction {
                name: "crm".into(),
                target_url: "https://crm.example.com".into(),
                http_method: None,
                auth: None,
                transform: None,
                lookups: None,
            },
            RuleAction {
                name: "audit".into(),
                target_url: "https://audit.example.com".into(),
                http_method: Some(HttpMethod::Post),
                auth: None,
                transform: None,
                lookups: None,
            },
        ];

        let targets = rule.targets();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].http_method, HttpMethod::Put);
        assert_eq!(targets[1].http_method, HttpMethod::Post);
        assert_eq!(targets[1].action_name.as_deref(), Some("audit"));
        assert_eq!(targets[1].index, 1);
    }

    #[test]
    fn cancellation_event_types_are_checked() {
        let mut rule: IntegrationRule = serde_json::from_value(rule_json()).unwrap();
        assert!(!rule.cancels_on("APPOINTMENT_CANCELLED"));

        rule.scheduling_config = Some(SchedulingConfig {
            script: "now() + 1000".into(),
            cancel_on_event_types: vec!["APPOINTMENT_CANCELLED".into()],
        });
        assert!(rule.cancels_on("APPOINTMENT_CANCELLED"));
    }

    #[test]
    fn get_and_delete_carry_no_body() {
        assert!(!HttpMethod::Get.carries_body());
        assert!(!HttpMethod::Delete.carries_body());
        assert!(HttpMethod::Patch.carries_body());
    }
}
