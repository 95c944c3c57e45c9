//! Strongly-typed identifiers.
//!
//! Rule, log, schedule and dead-letter ids are UUIDs minted by the gateway.
//! Event, organization and unit ids are 64-bit integers owned by the
//! upstream systems that produce events.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{BoxDynError, EncodeResult, PgArgumentBuffer, PgDb, PgTypeInfo, PgValueRef};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                Ok(Self(<Uuid as sqlx::Decode<PgDb>>::decode(value)?))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

macro_rules! int_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <i64 as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                Ok(Self(<i64 as sqlx::Decode<PgDb>>::decode(value)?))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id!(
    /// Identifier of an integration rule.
    RuleId
);
uuid_id!(
    /// Identifier of a delivery attempt log row.
    DeliveryLogId
);
uuid_id!(
    /// Identifier of a scheduled delivery.
    ScheduledDeliveryId
);
uuid_id!(
    /// Identifier of a dead-letter entry.
    DlqEntryId
);

int_id!(
    /// Source-scoped, monotonically increasing event identifier.
    ///
    /// For the relational source this is the row id, for the stream source
    /// the partition offset plus one.
    EventId
);
int_id!(
    /// Tenant organization identifier.
    OrgId
);
int_id!(
    /// Identifier of an entity (unit) inside an organization's hierarchy.
    OrgUnitId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_transparently() {
        assert_eq!(serde_json::to_string(&EventId(42)).unwrap(), "42");

        let rule = RuleId::new();
        assert_eq!(serde_json::to_value(rule).unwrap(), serde_json::json!(rule.0.to_string()));
    }

    #[test]
    fn event_ids_order_numerically() {
        let mut ids = vec![EventId(10), EventId(2), EventId(7)];
        ids.sort();
        assert_eq!(ids, vec![EventId(2), EventId(7), EventId(10)]);
    }
}
