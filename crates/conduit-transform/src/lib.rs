//! Payload preparation for outbound deliveries.
//!
//! Before a delivery leaves the gateway its payload goes through two stages:
//!
//! 1. **Lookups** - source codes are resolved to target codes through a
//!    [`CodeLookup`] store, with a per-lookup policy for unmapped codes
//! 2. **Transform** - the payload is reshaped either declaratively (field
//!    mappings with `a.b` and `items[].code` paths) or by a tenant script
//!    running in the [`ScriptSandbox`]
//!
//! The same sandbox evaluates the scheduling scripts of delayed and
//! recurring rules, see [`scheduling`].
//!
//! # Example
//!
//! ```no_run
//! use conduit_core::models::TransformConfig;
//! use conduit_transform::{apply_transform, ScriptSandbox, TransformContext};
//! # async fn example(ctx: TransformContext) -> Result<(), conduit_transform::TransformError> {
//! let sandbox = ScriptSandbox::default();
//! let config = TransformConfig::Script { script: "#{ id: payload.id }".into() };
//!
//! let out = apply_transform(&sandbox, &config, &serde_json::json!({"id": 1}), &ctx).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod context;
pub mod dates;
pub mod error;
pub mod lookup;
pub mod mapping;
pub mod path;
pub mod sandbox;
pub mod scheduling;

use conduit_core::models::{LookupConfig, OrgId, OrgUnitId, TransformConfig};
use serde_json::Value;

pub use context::TransformContext;
pub use error::{SchedulingError, ScriptError, TransformError};
pub use lookup::{apply_lookups, CodeLookup, LookupScope, LookupStoreError, StaticCodeLookup};
pub use mapping::apply_mappings;
pub use sandbox::{SandboxConfig, ScriptSandbox};
pub use scheduling::{
    calculate_next_occurrence, execute_scheduling_script, extract_cancellation_info,
    ScheduleOutcome,
};

/// Applies one transform to `payload`.
///
/// # Errors
///
/// Only script transforms fail; see [`ScriptError`].
pub async fn apply_transform(
    sandbox: &ScriptSandbox,
    config: &TransformConfig,
    payload: &Value,
    context: &TransformContext,
) -> Result<Value, TransformError> {
    match config {
        TransformConfig::Passthrough => Ok(payload.clone()),
        TransformConfig::Simple(simple) => Ok(apply_mappings(payload, simple)),
        TransformConfig::Script { script } => {
            Ok(sandbox.run(script, payload, &context.to_value()).await?)
        },
    }
}

/// Runs the lookup chain and then the transform.
///
/// # Errors
///
/// Returns the first lookup or transform failure.
pub async fn prepare_payload(
    payload: &Value,
    lookups: &[LookupConfig],
    transform: &TransformConfig,
    store: &dyn CodeLookup,
    sandbox: &ScriptSandbox,
    context: &TransformContext,
) -> Result<Value, TransformError> {
    let scope = LookupScope {
        org_id: OrgId(context.org_id),
        org_unit_id: context.org_unit_id.map(OrgUnitId),
    };
    let looked_up = apply_lookups(payload.clone(), lookups, scope, store).await?;
    apply_transform(sandbox, transform, &looked_up, context).await
}
