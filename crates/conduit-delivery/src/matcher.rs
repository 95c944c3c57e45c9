//! Entity-hierarchy rule matching.
//!
//! A rule anchored at a unit applies to that unit under any scope. It also
//! applies to the unit's descendants when its scope is `INCLUDE_CHILDREN` or
//! unset, unless the descendant is excluded. An org-wide rule (no unit) is
//! treated as an ancestor of every unit.

use conduit_core::models::{Event, IntegrationRule, OrgUnitId, RuleScope};

/// Whether `rule` applies to `event`.
///
/// `ancestors` are the strict ancestors of the event's unit, in any order.
pub fn rule_matches(rule: &IntegrationRule, event: &Event, ancestors: &[OrgUnitId]) -> bool {
    rule.is_active
        && rule.org_id == event.org_id
        && rule.matches_event_type(&event.event_type)
        && applies_to_unit(rule, event.org_unit_id, ancestors)
}

/// Whether `event` cancels pending schedules of `rule`.
///
/// Uses the same hierarchy test as delivery matching, keyed on the rule's
/// cancel-on list instead of its event type.
pub fn rule_cancelled_by(rule: &IntegrationRule, event: &Event, ancestors: &[OrgUnitId]) -> bool {
    rule.is_active
        && rule.org_id == event.org_id
        && rule.cancels_on(&event.event_type)
        && applies_to_unit(rule, event.org_unit_id, ancestors)
}

/// Hierarchy part of matching: whether a rule anchored where `rule` is
/// covers `unit`.
pub fn applies_to_unit(
    rule: &IntegrationRule,
    unit: Option<OrgUnitId>,
    ancestors: &[OrgUnitId],
) -> bool {
    if rule.org_unit_id.is_some() && rule.org_unit_id == unit {
        return true;
    }

    if !matches!(rule.scope, None | Some(RuleScope::IncludeChildren)) {
        return false;
    }

    let is_ancestor = match rule.org_unit_id {
        None => true,
        Some(anchor) => ancestors.contains(&anchor),
    };
    let excluded = unit.is_some_and(|u| rule.excluded_org_unit_ids.contains(&u));

    is_ancestor && !excluded
}

/// Rules from `candidates` that apply to `event`, in their original order.
pub fn match_rules<'a>(
    candidates: &'a [IntegrationRule],
    event: &Event,
    ancestors: &[OrgUnitId],
) -> Vec<&'a IntegrationRule> {
    candidates.iter().filter(|rule| rule_matches(rule, event, ancestors)).collect()
}

#[cfg(test)]
mod tests {
    use conduit_core::models::OrgId;
    use conduit_testing::{EventBuilder, RuleBuilder};
    use proptest::prelude::*;

    use super::*;

    fn event(unit: Option<i64>) -> Event {
        EventBuilder::new("APPOINTMENT_CREATED").org(1).org_unit(unit).build()
    }

    fn rule(unit: Option<i64>, scope: Option<RuleScope>) -> IntegrationRule {
        RuleBuilder::new("APPOINTMENT_CREATED").org(1).org_unit(unit).scope(scope).build()
    }

    const CLINIC: i64 = 30;
    const REGION: i64 = 20;
    const HQ: i64 = 10;

    fn clinic_ancestors() -> Vec<OrgUnitId> {
        vec![OrgUnitId(REGION), OrgUnitId(HQ)]
    }

    #[test]
    fn exact_unit_matches_under_any_scope() {
        let e = event(Some(CLINIC));
        for scope in [None, Some(RuleScope::EntityOnly), Some(RuleScope::IncludeChildren)] {
            assert!(rule_matches(&rule(Some(CLINIC), scope), &e, &clinic_ancestors()));
        }
    }

    #[test]
    fn ancestor_matches_unless_entity_only() {
        let e = event(Some(CLINIC));

        assert!(rule_matches(&rule(Some(REGION), None), &e, &clinic_ancestors()));
        assert!(rule_matches(
            &rule(Some(HQ), Some(RuleScope::IncludeChildren)),
            &e,
            &clinic_ancestors()
        ));
        assert!(!rule_matches(
            &rule(Some(REGION), Some(RuleScope::EntityOnly)),
            &e,
            &clinic_ancestors()
        ));
    }

    #[test]
    fn unrelated_unit_never_matches() {
        let e = event(Some(CLINIC));
        assert!(!rule_matches(&rule(Some(99), None), &e, &clinic_ancestors()));
    }

    #[test]
    fn org_wide_rule_reaches_every_unit() {
        assert!(rule_matches(&rule(None, None), &event(Some(CLINIC)), &clinic_ancestors()));
        assert!(rule_matches(&rule(None, None), &event(None), &[]));
        assert!(!rule_matches(&rule(None, Some(RuleScope::EntityOnly)), &event(Some(CLINIC)), &[]));
    }

    #[test]
    fn exclusions_block_descendants() {
        let mut r = rule(Some(REGION), None);
        r.excluded_org_unit_ids = vec![OrgUnitId(CLINIC)];

        assert!(!rule_matches(&r, &event(Some(CLINIC)), &clinic_ancestors()));
    }

    #[test]
    fn inactive_and_mismatched_rules_are_skipped() {
        let e = event(Some(CLINIC));

        let mut inactive = rule(Some(CLINIC), None);
        inactive.is_active = false;
        assert!(!rule_matches(&inactive, &e, &clinic_ancestors()));

        let mut other_type = rule(Some(CLINIC), None);
        other_type.event_type = "PATIENT_CREATED".into();
        assert!(!rule_matches(&other_type, &e, &clinic_ancestors()));

        let mut other_org = rule(Some(CLINIC), None);
        other_org.org_id = OrgId(2);
        assert!(!rule_matches(&other_org, &e, &clinic_ancestors()));

        let mut wildcard = rule(Some(CLINIC), None);
        wildcard.event_type = "*".into();
        assert!(rule_matches(&wildcard, &e, &clinic_ancestors()));
    }

    #[test]
    fn cancellation_follows_the_cancel_list_and_hierarchy() {
        let r = RuleBuilder::new("APPOINTMENT_CREATED")
            .org_unit(Some(REGION))
            .delayed("context.timestamp")
            .cancel_on(&["APPOINTMENT_CANCELLED"])
            .build();
        let cancel = EventBuilder::new("APPOINTMENT_CANCELLED").org_unit(Some(CLINIC)).build();

        assert!(rule_cancelled_by(&r, &cancel, &clinic_ancestors()));
        assert!(!rule_cancelled_by(&r, &cancel, &[]));
        assert!(!rule_cancelled_by(&r, &event(Some(CLINIC)), &clinic_ancestors()));
    }

    fn scope_strategy() -> impl Strategy<Value = Option<RuleScope>> {
        prop_oneof![
            Just(None),
            Just(Some(RuleScope::EntityOnly)),
            Just(Some(RuleScope::IncludeChildren)),
        ]
    }

    proptest! {
        #![proptest_config(conduit_testing::proptest_config())]

        #[test]
        fn excluded_units_never_match_through_inheritance(
            scope in scope_strategy(),
            anchor in 1_i64..5,
            unit in 5_i64..10,
        ) {
            let mut r = rule(Some(anchor), scope);
            r.excluded_org_unit_ids = vec![OrgUnitId(unit)];
            let ancestors = vec![OrgUnitId(anchor)];

            prop_assert!(!rule_matches(&r, &event(Some(unit)), &ancestors));
        }

        #[test]
        fn entity_only_matches_exactly_its_unit(
            anchor in 1_i64..10,
            unit in 1_i64..10,
        ) {
            let r = rule(Some(anchor), Some(RuleScope::EntityOnly));
            let ancestors: Vec<_> = (1..unit).map(OrgUnitId).collect();

            prop_assert_eq!(rule_matches(&r, &event(Some(unit)), &ancestors), anchor == unit);
        }
    }
}
