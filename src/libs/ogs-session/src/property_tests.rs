//! Property-Based Tests for Session Credit
//!
//! Credit accounting, rule-window reconciliation, delta commit and snapshot
//! invariants over random operation sequences.

use proptest::prelude::*;
use std::sync::Arc;

use crate::bucket::{Bucket, Buckets};
use crate::config::SessiondConf;
use crate::credit::CreditBucket;
use crate::delta::SessionDelta;
use crate::rule::{PolicyRule, RuleLifetime, StaticRuleStore};
use crate::state::SessionState;
use crate::stored::StoredSessionCredit;
use crate::types::*;

#[derive(Debug, Clone)]
enum CreditOp {
    Use(u64, u64),
    Grant(GrantedUnits),
    Report,
    Fail(u32),
}

#[derive(Debug, Clone)]
enum SessionOp {
    Charge(u32, u64),
    Monitor(u64),
    Usage(usize, u64, u64),
    Reauth(u32),
    InsertRule(u32, i64, i64),
    Sync(i64),
    Trigger,
}

// Strategy for generating one direction of a grant
fn credit_unit_strategy() -> impl Strategy<Value = CreditUnit> {
    (any::<bool>(), 0u64..10_000).prop_map(|(is_valid, volume)| CreditUnit { is_valid, volume })
}

fn granted_units_strategy() -> impl Strategy<Value = GrantedUnits> {
    (credit_unit_strategy(), credit_unit_strategy(), credit_unit_strategy())
        .prop_map(|(total, tx, rx)| GrantedUnits { total, tx, rx })
}

fn credit_op_strategy() -> impl Strategy<Value = CreditOp> {
    prop_oneof![
        (0u64..5_000, 0u64..5_000).prop_map(|(tx, rx)| CreditOp::Use(tx, rx)),
        granted_units_strategy().prop_map(CreditOp::Grant),
        Just(CreditOp::Report),
        prop_oneof![Just(4012u32), Just(5030u32)].prop_map(CreditOp::Fail),
    ]
}

fn tracking_type_strategy() -> impl Strategy<Value = GrantTrackingType> {
    prop_oneof![
        Just(GrantTrackingType::TotalOnly),
        Just(GrantTrackingType::TxOnly),
        Just(GrantTrackingType::RxOnly),
        Just(GrantTrackingType::TxAndRx),
        Just(GrantTrackingType::AllTotalTxRx),
    ]
}

fn buckets_strategy() -> impl Strategy<Value = Buckets> {
    prop::array::uniform9(any::<u64>()).prop_map(|v| Buckets {
        used_tx: v[0],
        used_rx: v[1],
        allowed_total: v[2],
        allowed_tx: v[3],
        allowed_rx: v[4],
        reporting_tx: v[5],
        reporting_rx: v[6],
        reported_tx: v[7],
        reported_rx: v[8],
    })
}

fn stored_credit_strategy() -> impl Strategy<Value = StoredSessionCredit> {
    (
        any::<bool>(),
        prop_oneof![Just(CreditLimitType::Finite), Just(CreditLimitType::Infinite)],
        buckets_strategy(),
        tracking_type_strategy(),
        (any::<u64>(), any::<u64>(), any::<u64>()),
    )
        .prop_map(|(reporting, credit_limit_type, buckets, grant_tracking_type, (total, tx, rx))| {
            StoredSessionCredit {
                reporting,
                credit_limit_type,
                buckets,
                grant_tracking_type,
                received_granted_units: ReceivedGrantedUnits { total, tx, rx },
            }
        })
}

fn session_op_strategy() -> impl Strategy<Value = SessionOp> {
    prop_oneof![
        (1u32..4, 0u64..5_000).prop_map(|(rg, total)| SessionOp::Charge(rg, total)),
        (0u64..5_000).prop_map(SessionOp::Monitor),
        (0usize..6, 0u64..2_000, 0u64..2_000).prop_map(|(i, tx, rx)| SessionOp::Usage(i, tx, rx)),
        (1u32..4).prop_map(SessionOp::Reauth),
        (0u32..4, 0i64..30, 0i64..30).prop_map(|(rg, a, d)| SessionOp::InsertRule(rg, a, d)),
        (0i64..40).prop_map(SessionOp::Sync),
        Just(SessionOp::Trigger),
    ]
}

const RULE_IDS: [&str; 6] = ["static_1", "static_2", "dyn_0", "dyn_1", "dyn_2", "dyn_3"];

fn test_store() -> Arc<StaticRuleStore> {
    let store = StaticRuleStore::new();
    store.insert_rule(PolicyRule::new("static_1", 1, "m1"));
    store.insert_rule(PolicyRule::new("static_2", 2, ""));
    Arc::new(store)
}

fn new_session(store: Arc<StaticRuleStore>) -> SessionState {
    SessionState::new(
        "IMSI001010000000001",
        "session-1",
        SessionConfig::default(),
        store,
        TgppContext::default(),
        SessiondConf::default(),
    )
}

fn apply_session_op(session: &mut SessionState, op: &SessionOp, delta: &mut SessionDelta) {
    match op {
        SessionOp::Charge(rg, total) => {
            let response = CreditUpdateResponse {
                success: true,
                result_code: 2001,
                charging_key: CreditKey::new(*rg),
                credit: ChargingCredit { granted_units: GrantedUnits::total(*total), ..Default::default() },
                ..Default::default()
            };
            session.receive_charging_credit(&response, delta);
        }
        SessionOp::Monitor(total) => {
            let response = UsageMonitoringUpdateResponse {
                success: true,
                result_code: 2001,
                credit: Some(UsageMonitoringCredit {
                    monitoring_key: "m1".to_string(),
                    granted_units: GrantedUnits::total(*total),
                    ..Default::default()
                }),
                ..Default::default()
            };
            session.receive_monitor(&response, delta);
        }
        SessionOp::Usage(i, tx, rx) => session.add_rule_usage(RULE_IDS[*i], *tx, *rx, delta),
        SessionOp::Reauth(rg) => {
            session.reauth_key(&CreditKey::new(*rg), delta);
        }
        SessionOp::InsertRule(rg, activation, deactivation) => {
            let rule = PolicyRule::new(&format!("dyn_{rg}"), *rg, "m1");
            session.schedule_dynamic_rule(rule, RuleLifetime::new(*activation, *deactivation), delta);
        }
        SessionOp::Sync(now) => session.sync_rules_to_time(*now, delta),
        SessionOp::Trigger => session.add_new_event_trigger(EventTrigger::UsageReport, delta),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property 1: ALLOWED_* never decreases and every closed report stays
    /// within usage
    #[test]
    fn prop_credit_accounting(ops in prop::collection::vec(credit_op_strategy(), 1..40)) {
        let mut credit = CreditBucket::new(CreditLimitType::Finite);
        let mut delta = credit.get_delta();
        for op in ops {
            let before = *credit.buckets();
            match op {
                CreditOp::Use(tx, rx) => credit.add_used_credit(tx, rx, &mut delta),
                CreditOp::Grant(gsu) => credit.receive_credit(&gsu, &mut delta),
                CreditOp::Report => {
                    if !credit.is_reporting() {
                        credit.get_usage_for_reporting(&mut delta);
                    }
                }
                CreditOp::Fail(code) => credit.mark_failure(code, &mut delta),
            }
            let after = credit.buckets();
            prop_assert!(after.allowed_total >= before.allowed_total);
            prop_assert!(after.allowed_tx >= before.allowed_tx);
            prop_assert!(after.allowed_rx >= before.allowed_rx);
            prop_assert!(after.used_tx >= before.used_tx);
            prop_assert!(after.reported_rx >= before.reported_rx);
            if !credit.is_reporting() {
                prop_assert_eq!(after.reporting_tx, 0);
                prop_assert!(after.reported_tx <= after.used_tx);
                prop_assert!(after.reported_rx <= after.used_rx);
            }
        }
    }

    /// Property 2: infinite credit is never exhausted
    #[test]
    fn prop_infinite_never_exhausted(
        tx in any::<u64>(),
        rx in any::<u64>(),
        gsu in granted_units_strategy(),
        threshold in 0.0f32..=1.0,
    ) {
        let mut credit = CreditBucket::new(CreditLimitType::Infinite);
        let mut delta = credit.get_delta();
        credit.receive_credit(&gsu, &mut delta);
        credit.add_used_credit(tx, rx, &mut delta);
        prop_assert!(!credit.is_quota_exhausted(threshold));
    }

    /// Property 3: credit snapshot round trip is lossless
    #[test]
    fn prop_credit_marshal_round_trip(stored in stored_credit_strategy()) {
        prop_assert_eq!(CreditBucket::unmarshal(&stored).marshal(), stored);
    }

    /// Property 4: a lower threshold never reports exhaustion later than a
    /// higher one
    #[test]
    fn prop_exhaustion_monotonic_in_threshold(
        total in 1u64..100_000,
        used in 0u64..200_000,
        low in 0.0f32..=1.0,
        high in 0.0f32..=1.0,
    ) {
        let (low, high) = if low <= high { (low, high) } else { (high, low) };
        let mut credit = CreditBucket::new(CreditLimitType::Finite);
        let mut delta = credit.get_delta();
        credit.receive_credit(&GrantedUnits::total(total), &mut delta);
        credit.add_used_credit(used, 0, &mut delta);
        if credit.is_quota_exhausted(high) {
            prop_assert!(credit.is_quota_exhausted(low));
        }
    }

    /// Property 5: syncing twice at the same time records nothing the second time
    #[test]
    fn prop_sync_idempotent(
        windows in prop::collection::vec((0i64..30, 0i64..30), 1..6),
        now in 0i64..40,
    ) {
        let mut session = new_session(test_store());
        let mut delta = SessionDelta::new();
        for (i, (activation, deactivation)) in windows.iter().enumerate() {
            let lifetime = RuleLifetime::new(*activation, *deactivation);
            session.schedule_dynamic_rule(PolicyRule::new(&format!("d{i}"), 1, ""), lifetime, &mut delta);
            session.schedule_static_rule("static_1", lifetime, &mut delta);
        }
        let mut first = SessionDelta::new();
        session.sync_rules_to_time(now, &mut first);
        let mut second = SessionDelta::new();
        session.sync_rules_to_time(now, &mut second);
        prop_assert!(second.is_empty());
    }

    /// Property 6: committing a delta reproduces the working copy
    #[test]
    fn prop_apply_delta_matches_working_copy(ops in prop::collection::vec(session_op_strategy(), 1..30)) {
        let store = test_store();
        let authoritative = new_session(store);
        let mut working = authoritative.clone();
        let mut delta = SessionDelta::new();
        for op in &ops {
            apply_session_op(&mut working, op, &mut delta);
        }
        let mut committed = authoritative;
        committed.apply_delta(&delta);
        prop_assert_eq!(committed.marshal(), working.marshal());
    }

    /// Property 7: session snapshot round trip is lossless given the same catalog
    #[test]
    fn prop_session_marshal_round_trip(ops in prop::collection::vec(session_op_strategy(), 0..30)) {
        let store = test_store();
        let mut session = new_session(store.clone());
        let mut delta = SessionDelta::new();
        for op in &ops {
            apply_session_op(&mut session, op, &mut delta);
        }
        let marshaled = session.marshal();
        let restored = SessionState::unmarshal(&marshaled, store, SessiondConf::default());
        prop_assert_eq!(restored.marshal(), marshaled);

        let json = crate::stored::serialize_stored_session(&session.marshal()).unwrap();
        let decoded = crate::stored::deserialize_stored_session(&json).unwrap();
        prop_assert_eq!(decoded, session.marshal());
    }

    /// Property 8: rules without keys never contribute to total usage
    #[test]
    fn prop_untracked_usage_not_counted(tx in 0u64..1_000_000, rx in 0u64..1_000_000) {
        let mut session = new_session(test_store());
        let mut delta = SessionDelta::new();
        session.insert_dynamic_rule(PolicyRule::new("plain", 0, ""), RuleLifetime::default(), &mut delta);
        session.add_rule_usage("plain", tx, rx, &mut delta);
        prop_assert_eq!(session.get_total_credit_usage(), TotalCreditUsage::default());
    }
}

#[test]
fn test_bucket_accessors_cover_all_fields() {
    let mut buckets = Buckets::default();
    for (i, bucket) in Bucket::ALL.iter().enumerate() {
        buckets.add(*bucket, i as u64 + 1);
    }
    let total: u64 = Bucket::ALL.iter().map(|b| buckets.get(*b)).sum();
    assert_eq!(total, (1..=9).sum::<u64>());
}
