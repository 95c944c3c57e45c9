//! Property tests for dedup keys, backoff bounds and checkpoint
//! monotonicity.

use std::time::Duration;

use chrono::Utc;
use conduit_core::models::{EventId, RetryStrategy};
use conduit_delivery::{
    dedup::event_key,
    storage::{mock::MockDeliveryStorage, DeliveryStorage},
    BackoffConfig, DeliveryError, RetryDecision, RetryPolicy,
};
use conduit_testing::{property::json_payload, proptest_config, EventBuilder, RuleBuilder};
use proptest::prelude::*;
use serde_json::{Map, Value};

fn reversed_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.reverse();
            Value::Object(entries.into_iter().map(|(k, v)| (k.clone(), reversed_keys(v))).collect::<Map<_, _>>())
        },
        Value::Array(items) => Value::Array(items.iter().map(reversed_keys).collect()),
        other => other.clone(),
    }
}

fn strategy() -> impl Strategy<Value = RetryStrategy> {
    prop_oneof![
        Just(RetryStrategy::Fixed),
        Just(RetryStrategy::Linear),
        Just(RetryStrategy::Exponential),
    ]
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn event_key_ignores_id_and_key_order(payload in json_payload(), a in 1_i64..1000, b in 1_i64..1000) {
        let first = EventBuilder::new("A").id(a).payload(payload.clone()).build();
        let second = EventBuilder::new("A").id(b).payload(reversed_keys(&payload)).build();

        prop_assert_eq!(event_key(&first), event_key(&second));
    }

    #[test]
    fn event_key_separates_types_and_orgs(payload in json_payload()) {
        let base = EventBuilder::new("A").payload(payload.clone()).build();
        let other_type = EventBuilder::new("B").payload(payload.clone()).build();
        let other_org = EventBuilder::new("A").org(2).payload(payload).build();

        prop_assert_ne!(event_key(&base), event_key(&other_type));
        prop_assert_ne!(event_key(&base), event_key(&other_org));
    }

    #[test]
    fn retry_delays_stay_within_the_cap(
        strategy in strategy(),
        retries in 1_u32..10,
        attempt in 1_u32..10,
        jitter in 0.0_f64..0.5,
    ) {
        let backoff = BackoffConfig {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_factor: jitter,
        };
        let rule = RuleBuilder::new("A").retries(retries, strategy).build();
        let policy = RetryPolicy::for_rule(&rule, backoff);
        let error = DeliveryError::Server { status_code: 503, body: String::new() };

        match policy.decide(attempt, &error) {
            RetryDecision::Retry { delay } => {
                prop_assert!(attempt <= retries);
                prop_assert!(delay <= backoff.max_delay.mul_f64(1.0 + jitter));
            },
            RetryDecision::Exhausted => prop_assert!(attempt > retries),
            RetryDecision::Fail => prop_assert!(false, "server errors are retryable"),
        }
    }

    #[test]
    fn checkpoint_never_moves_backwards(ids in prop::collection::vec(0_i64..1000, 1..20)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let storage = MockDeliveryStorage::new();
            let mut highest = 0;
            for id in ids {
                let stored = storage.save_checkpoint("w", EventId(id), Utc::now()).await.unwrap();
                highest = highest.max(id);
                assert_eq!(stored, EventId(highest));
            }
        });
    }
}
