//! Persisted session snapshots
//!
//! Snapshots are plain serde structs encoded as JSON. Maps keyed by
//! [`CreditKey`] are stored as entry lists because JSON object keys must be
//! strings. Every struct accepts missing fields so older snapshots load.

use crate::bucket::Buckets;
use crate::error::{SessionError, SessionResult};
use crate::fsm::SessionFsmState;
use crate::rule::{PolicyRule, RuleLifetime, RuleState};
use crate::types::{
    CreditKey, CreditLimitType, EventTrigger, EventTriggerState, FinalActionInfo,
    GrantTrackingType, MonitoringLevel, ReAuthState, ReceivedGrantedUnits, ServiceState,
    SessionConfig, TgppContext,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Snapshot format written by this build
pub const STORED_SESSION_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredSessionCredit {
    pub reporting: bool,
    pub credit_limit_type: CreditLimitType,
    pub buckets: Buckets,
    pub grant_tracking_type: GrantTrackingType,
    pub received_granted_units: ReceivedGrantedUnits,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredMonitor {
    pub credit: StoredSessionCredit,
    pub level: MonitoringLevel,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredChargingGrant {
    pub credit: StoredSessionCredit,
    pub is_final: bool,
    pub final_action_info: FinalActionInfo,
    pub reauth_state: ReAuthState,
    pub service_state: ServiceState,
    pub expiry_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCreditEntry {
    pub key: CreditKey,
    pub grant: StoredChargingGrant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRule {
    pub rule: PolicyRule,
    pub lifetime: RuleLifetime,
    pub state: RuleState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredStaticRule {
    pub rule_id: String,
    pub lifetime: RuleLifetime,
    pub state: RuleState,
}

/// Complete persisted form of a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredSessionState {
    pub version: u32,
    pub imsi: String,
    pub session_id: String,
    pub fsm_state: SessionFsmState,
    pub config: SessionConfig,
    pub tgpp_context: TgppContext,
    pub request_number: u32,
    pub pending_reports: u32,
    pub session_level_key: Option<String>,
    pub credit_map: Vec<StoredCreditEntry>,
    pub monitor_map: BTreeMap<String, StoredMonitor>,
    pub static_rules: Vec<StoredStaticRule>,
    pub dynamic_rules: Vec<StoredRule>,
    pub gy_dynamic_rules: Vec<StoredRule>,
    pub pending_event_triggers: BTreeMap<EventTrigger, EventTriggerState>,
    pub revalidation_time: i64,
}

/// Encode a snapshot as JSON
pub fn serialize_stored_session(stored: &StoredSessionState) -> SessionResult<String> {
    Ok(serde_json::to_string(stored)?)
}

/// Decode a JSON snapshot, rejecting formats newer than this build
pub fn deserialize_stored_session(serialized: &str) -> SessionResult<StoredSessionState> {
    let stored: StoredSessionState = serde_json::from_str(serialized)?;
    if stored.version > STORED_SESSION_VERSION {
        return Err(SessionError::UnsupportedVersion {
            found: stored.version,
            supported: STORED_SESSION_VERSION,
        });
    }
    Ok(stored)
}
