//! Change records produced by session mutations
//!
//! Every mutating operation on a working copy of a session mirrors its effect
//! into a [`SessionDelta`]. The owner commits a delta into the authoritative
//! copy with [`SessionState::apply_delta`](crate::state::SessionState::apply_delta),
//! or drops it to discard the attempt.

use crate::bucket::Buckets;
use crate::fsm::SessionFsmState;
use crate::rule::{PolicyRule, RuleLifetime};
use crate::stored::{StoredChargingGrant, StoredMonitor};
use crate::types::{
    CreditKey, EventTrigger, EventTriggerState, FinalActionInfo, GrantTrackingType,
    ReAuthState, ReceivedGrantedUnits, ServiceState, SessionConfig, TgppContext, Usage,
};
use std::collections::{BTreeMap, BTreeSet};

/// Changes to one credit.
///
/// `bucket_deltas` are additive and never carry REPORTING_*. The in-flight
/// report is carried as an absolute amount in `reporting_credit`, like every
/// other field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreditDelta {
    pub bucket_deltas: Buckets,
    pub reporting: bool,
    pub reporting_credit: Usage,
    pub grant_tracking_type: GrantTrackingType,
    pub received_granted_units: ReceivedGrantedUnits,

    // Charging grant only
    pub is_final: bool,
    pub final_action_info: FinalActionInfo,
    pub reauth_state: ReAuthState,
    pub service_state: ServiceState,
    pub expiry_time: i64,
}

/// Changes to one session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionDelta {
    pub is_fsm_updated: bool,
    pub updated_fsm_state: SessionFsmState,
    pub updated_pending_reports: Option<u32>,
    pub request_number_increment: u32,

    pub is_session_level_key_updated: bool,
    pub updated_session_level_key: Option<String>,
    pub updated_tgpp_context: Option<TgppContext>,
    pub updated_config: Option<SessionConfig>,

    pub is_pending_event_triggers_updated: bool,
    pub pending_event_triggers: BTreeMap<EventTrigger, EventTriggerState>,
    pub revalidation_time: Option<i64>,

    pub static_rules_to_install: BTreeSet<String>,
    pub static_rules_to_uninstall: BTreeSet<String>,
    pub new_scheduled_static_rules: BTreeSet<String>,

    pub dynamic_rules_to_install: Vec<PolicyRule>,
    pub dynamic_rules_to_uninstall: BTreeSet<String>,
    pub new_scheduled_dynamic_rules: Vec<PolicyRule>,

    pub gy_dynamic_rules_to_install: Vec<PolicyRule>,
    pub gy_dynamic_rules_to_uninstall: BTreeSet<String>,
    pub new_scheduled_gy_dynamic_rules: Vec<PolicyRule>,

    pub new_rule_lifetimes: BTreeMap<String, RuleLifetime>,

    pub charging_credit_to_install: BTreeMap<CreditKey, StoredChargingGrant>,
    pub charging_credit_map: BTreeMap<CreditKey, CreditDelta>,

    pub monitor_credit_to_install: BTreeMap<String, StoredMonitor>,
    pub monitor_credit_to_uninstall: BTreeSet<String>,
    pub monitor_credit_map: BTreeMap<String, CreditDelta>,
}

impl SessionDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nothing was recorded
    pub fn is_empty(&self) -> bool {
        *self == SessionDelta::default()
    }
}
