//! Domain models shared by the sources, transform, delivery and API crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod delivery;
mod ids;
mod rule;
mod schedule;

pub use delivery::{
    truncate_response_body, DeliveryAttemptLog, DeliveryStatus, DlqEntry, DlqStatus,
    WorkerCheckpoint, MAX_RESPONSE_BODY_CHARS,
};
pub use ids::{DeliveryLogId, DlqEntryId, EventId, OrgId, OrgUnitId, RuleId, ScheduledDeliveryId};
pub use rule::{
    ActionExecution, AuthSettings, AuthType, DeliveryMode, DeliveryTarget, FieldMapping,
    FieldTransform, HttpMethod, IntegrationRule, LookupConfig, RetryStrategy, RuleAction,
    RuleScope, SchedulingConfig, SimpleTransform, StaticField, TransformConfig, UnmappedBehavior,
};
pub use schedule::{CancellationInfo, RecurringConfig, ScheduleStatus, ScheduledDelivery};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Declares a string-backed enum stored as TEXT.
///
/// Generates `as_str`, `Display`, `FromStr` and the sqlx codec impls from a
/// single variant/label table so the wire, log and column forms never drift.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $label)] $variant, )+
        }

        impl $name {
            /// Canonical text form.
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $label, )+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $label => Ok(Self::$variant), )+
                    other => Err(format!(concat!("invalid ", stringify!($name), ": {}"), other)),
                }
            }
        }

        impl sqlx::Type<$crate::models::PgDb> for $name {
            fn type_info() -> $crate::models::PgTypeInfo {
                <str as sqlx::Type<$crate::models::PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, $crate::models::PgDb> for $name {
            fn decode(
                value: $crate::models::PgValueRef<'r>,
            ) -> Result<Self, $crate::models::BoxDynError> {
                let s = <&str as sqlx::Decode<$crate::models::PgDb>>::decode(value)?;
                s.parse::<Self>().map_err(Into::into)
            }
        }

        impl sqlx::Encode<'_, $crate::models::PgDb> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut $crate::models::PgArgumentBuffer,
            ) -> $crate::models::EncodeResult {
                <&str as sqlx::Encode<$crate::models::PgDb>>::encode_by_ref(&self.as_str(), buf)
            }
        }
    };
}

pub(crate) use text_enum;

/// A business event as normalized by an event source.
///
/// Events are immutable once produced; the gateway never deletes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Source-scoped monotonic identifier.
    pub id: EventId,
    /// Owning organization.
    pub org_id: OrgId,
    /// Unit the event belongs to, if any.
    pub org_unit_id: Option<OrgUnitId>,
    /// Business event type, e.g. `APPOINTMENT_CREATED`.
    pub event_type: String,
    /// JSON object payload.
    pub payload: Value,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Name of the source that produced the event.
    pub source: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_uses_camel_case_on_the_wire() {
        let event = Event {
            id: EventId(7),
            org_id: OrgId(1),
            org_unit_id: Some(OrgUnitId(3)),
            event_type: "PATIENT_CREATED".into(),
            payload: serde_json::json!({"name": "x"}),
            timestamp: DateTime::<Utc>::from_timestamp_millis(0).unwrap(),
            source: "test".into(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["orgUnitId"], 3);
        assert_eq!(json["eventType"], "PATIENT_CREATED");
    }

    #[test]
    fn text_enums_round_trip_through_strings() {
        assert_eq!("ENTITY_ONLY".parse::<RuleScope>().unwrap(), RuleScope::EntityOnly);
        assert_eq!(DlqStatus::Resolved.to_string(), "resolved");
        assert!("bogus".parse::<DeliveryStatus>().is_err());
    }
}
