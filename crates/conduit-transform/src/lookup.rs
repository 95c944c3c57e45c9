//! Code-mapping lookups run before the transform.

use std::collections::HashMap;

use async_trait::async_trait;
use conduit_core::models::{LookupConfig, OrgId, OrgUnitId, UnmappedBehavior};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::{error::TransformError, path::FieldPath};

/// The lookup store could not answer.
#[derive(Debug, Clone, Error)]
#[error("code lookup failed: {0}")]
pub struct LookupStoreError(pub String);

/// Source of code mappings.
#[async_trait]
pub trait CodeLookup: Send + Sync {
    /// Resolves `source_code` of `lookup_type`, preferring a mapping for
    /// `org_unit_id` over the organization-wide one.
    async fn resolve_code(
        &self,
        org_id: OrgId,
        org_unit_id: Option<OrgUnitId>,
        lookup_type: &str,
        source_code: &str,
    ) -> Result<Option<Value>, LookupStoreError>;
}

/// Whose mappings a lookup chain consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupScope {
    /// Organization of the event.
    pub org_id: OrgId,
    /// Unit of the event.
    pub org_unit_id: Option<OrgUnitId>,
}

/// In-memory mapping table.
#[derive(Debug, Clone, Default)]
pub struct StaticCodeLookup {
    entries: HashMap<(OrgId, Option<OrgUnitId>, String, String), Value>,
}

impl StaticCodeLookup {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mapping; `org_unit_id = None` makes it organization-wide.
    #[must_use]
    pub fn with(
        mut self,
        org_id: OrgId,
        org_unit_id: Option<OrgUnitId>,
        lookup_type: &str,
        source_code: &str,
        target: Value,
    ) -> Self {
        self.insert(org_id, org_unit_id, lookup_type, source_code, target);
        self
    }

    /// Adds a mapping in place.
    pub fn insert(
        &mut self,
        org_id: OrgId,
        org_unit_id: Option<OrgUnitId>,
        lookup_type: &str,
        source_code: &str,
        target: Value,
    ) {
        self.entries
            .insert((org_id, org_unit_id, lookup_type.to_string(), source_code.to_string()), target);
    }

    /// Resolves synchronously with unit-over-org precedence.
    pub fn get(
        &self,
        org_id: OrgId,
        org_unit_id: Option<OrgUnitId>,
        lookup_type: &str,
        source_code: &str,
    ) -> Option<Value> {
        let key = |unit| (org_id, unit, lookup_type.to_string(), source_code.to_string());
        org_unit_id
            .and_then(|unit| self.entries.get(&key(Some(unit))))
            .or_else(|| self.entries.get(&key(None)))
            .cloned()
    }
}

#[async_trait]
impl CodeLookup for StaticCodeLookup {
    async fn resolve_code(
        &self,
        org_id: OrgId,
        org_unit_id: Option<OrgUnitId>,
        lookup_type: &str,
        source_code: &str,
    ) -> Result<Option<Value>, LookupStoreError> {
        Ok(self.get(org_id, org_unit_id, lookup_type, source_code))
    }
}

#[async_trait]
impl CodeLookup for conduit_core::storage::code_mappings::Repository {
    async fn resolve_code(
        &self,
        org_id: OrgId,
        org_unit_id: Option<OrgUnitId>,
        lookup_type: &str,
        source_code: &str,
    ) -> Result<Option<Value>, LookupStoreError> {
        self.resolve(org_id, org_unit_id, lookup_type, source_code)
            .await
            .map_err(|e| LookupStoreError(e.to_string()))
    }
}

fn as_code(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Runs `lookups` in order over `payload`.
///
/// Each step sees the output of the previous one. Null, missing and empty
/// source values are skipped without consulting the store.
///
/// # Errors
///
/// Returns [`TransformError::UnmappedCode`] as soon as a `FAIL` lookup meets
/// a code without mapping; later lookups do not run.
pub async fn apply_lookups(
    payload: Value,
    lookups: &[LookupConfig],
    scope: LookupScope,
    store: &dyn CodeLookup,
) -> Result<Value, TransformError> {
    let mut output = payload;

    for config in lookups {
        let source = FieldPath::parse(&config.source_field).get(&output);
        let codes: Vec<Option<Value>> = source.leaves().into_iter().map(|l| l.cloned()).collect();

        let mut resolved = Vec::with_capacity(codes.len());
        for original in codes {
            let Some(code) = original.as_ref().and_then(as_code) else {
                resolved.push(None);
                continue;
            };
            resolved.push(resolve_one(config, scope, store, &code, original).await?);
        }

        let mapped = source.replace_leaves(&mut resolved.into_iter());
        FieldPath::parse(&config.target_field).set(&mut output, &mapped);
    }

    Ok(output)
}

async fn resolve_one(
    config: &LookupConfig,
    scope: LookupScope,
    store: &dyn CodeLookup,
    code: &str,
    original: Option<Value>,
) -> Result<Option<Value>, TransformError> {
    let hit = match store
        .resolve_code(scope.org_id, scope.org_unit_id, &config.lookup_type, code)
        .await
    {
        Ok(hit) => hit,
        Err(e) => {
            warn!(
                lookup_type = %config.lookup_type,
                code,
                error = %e,
                "code lookup failed, treating as unmapped"
            );
            None
        },
    };

    if let Some(value) = hit {
        return Ok(Some(value));
    }

    match config.unmapped_behavior {
        UnmappedBehavior::Passthrough => Ok(original),
        UnmappedBehavior::Default => Ok(Some(config.default_value.clone().unwrap_or(Value::Null))),
        UnmappedBehavior::Fail => Err(TransformError::UnmappedCode {
            lookup_type: config.lookup_type.clone(),
            source_field: config.source_field.clone(),
            code: code.to_string(),
        }),
    }
}
