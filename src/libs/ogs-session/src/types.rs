//! Keys, enums and inbound messages of the session engine
//!
//! Inbound credit and monitoring responses arrive here already decoded from
//! Gx/Gy answers; the engine never sees raw AVPs.

use crate::diameter::{FinalUnitAction, RedirectAddressType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch
pub fn unix_time_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Identifies a charging credit (Rating-Group, optional Service-Identifier)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CreditKey {
    pub rating_group: u32,
    pub service_identifier: Option<u32>,
}

impl CreditKey {
    pub fn new(rating_group: u32) -> Self {
        Self { rating_group, service_identifier: None }
    }

    pub fn with_service_identifier(rating_group: u32, service_identifier: u32) -> Self {
        Self { rating_group, service_identifier: Some(service_identifier) }
    }
}

impl fmt::Display for CreditKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.service_identifier {
            Some(si) => write!(f, "RG {} SI {}", self.rating_group, si),
            None => write!(f, "RG {}", self.rating_group),
        }
    }
}

/// Whether a credit carries a byte limit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreditLimitType {
    #[default]
    Finite,
    Infinite,
}

/// Which of the granted directions a credit enforces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrantTrackingType {
    #[default]
    TotalOnly,
    TxOnly,
    RxOnly,
    TxAndRx,
    AllTotalTxRx,
}

impl GrantTrackingType {
    pub fn name(&self) -> &'static str {
        match self {
            GrantTrackingType::TotalOnly => "TOTAL_ONLY",
            GrantTrackingType::TxOnly => "TX_ONLY",
            GrantTrackingType::RxOnly => "RX_ONLY",
            GrantTrackingType::TxAndRx => "TX_AND_RX",
            GrantTrackingType::AllTotalTxRx => "ALL_TOTAL_TX_RX",
        }
    }

    pub fn tracks_total(&self) -> bool {
        matches!(self, GrantTrackingType::TotalOnly | GrantTrackingType::AllTotalTxRx)
    }

    pub fn tracks_tx(&self) -> bool {
        matches!(
            self,
            GrantTrackingType::TxOnly | GrantTrackingType::TxAndRx | GrantTrackingType::AllTotalTxRx
        )
    }

    pub fn tracks_rx(&self) -> bool {
        matches!(
            self,
            GrantTrackingType::RxOnly | GrantTrackingType::TxAndRx | GrantTrackingType::AllTotalTxRx
        )
    }
}

/// One direction of a Granted-Service-Unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditUnit {
    pub is_valid: bool,
    pub volume: u64,
}

impl CreditUnit {
    pub fn valid(volume: u64) -> Self {
        Self { is_valid: true, volume }
    }

    /// Volume if the unit is present, zero otherwise
    pub fn valid_volume(&self) -> u64 {
        if self.is_valid {
            self.volume
        } else {
            0
        }
    }

    /// Present and carries bytes
    pub fn is_nonzero(&self) -> bool {
        self.is_valid && self.volume != 0
    }
}

/// Granted-Service-Unit volumes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantedUnits {
    pub total: CreditUnit,
    pub tx: CreditUnit,
    pub rx: CreditUnit,
}

impl GrantedUnits {
    pub fn total(volume: u64) -> Self {
        Self { total: CreditUnit::valid(volume), ..Default::default() }
    }

    pub fn tx_rx(tx: u64, rx: u64) -> Self {
        Self { tx: CreditUnit::valid(tx), rx: CreditUnit::valid(rx), ..Default::default() }
    }

    pub fn all(total: u64, tx: u64, rx: u64) -> Self {
        Self { total: CreditUnit::valid(total), tx: CreditUnit::valid(tx), rx: CreditUnit::valid(rx) }
    }

    /// Any direction carries a non-zero volume
    pub fn contains_credit(&self) -> bool {
        self.total.is_nonzero() || self.tx.is_nonzero() || self.rx.is_nonzero()
    }
}

/// Allowance snapshot taken just before the latest grant was added.
/// Exhaustion is measured against the grant received since this point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceivedGrantedUnits {
    pub total: u64,
    pub tx: u64,
    pub rx: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RedirectServer {
    pub redirect_address_type: RedirectAddressType,
    pub redirect_server_address: String,
}

/// Final-unit indication kept with a final grant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalActionInfo {
    pub final_action: FinalUnitAction,
    pub redirect_server: RedirectServer,
}

/// Charging credit carried in a CCA
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChargingCredit {
    pub granted_units: GrantedUnits,
    /// Validity-Time in seconds, 0 when absent
    pub validity_time: u32,
    pub is_final: bool,
    pub final_action: FinalUnitAction,
    pub redirect_server: RedirectServer,
}

/// One Multiple-Services-Credit-Control answer for a charging key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreditUpdateResponse {
    pub success: bool,
    pub result_code: u32,
    pub sid: String,
    pub charging_key: CreditKey,
    pub limit_type: CreditLimitType,
    pub credit: ChargingCredit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MonitoringLevel {
    SessionLevel,
    #[default]
    PccRuleLevel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MonitoringAction {
    #[default]
    Continue,
    Disable,
}

/// Usage-Monitoring-Information grant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageMonitoringCredit {
    pub monitoring_key: String,
    pub level: MonitoringLevel,
    pub action: MonitoringAction,
    pub granted_units: GrantedUnits,
}

/// Gx answer for one monitoring key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageMonitoringUpdateResponse {
    pub success: bool,
    pub result_code: u32,
    pub sid: String,
    /// Absent when the answer carried no Usage-Monitoring-Information
    pub credit: Option<UsageMonitoringCredit>,
}

/// Per-rule byte counters reported by the data plane
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleRecord {
    pub rule_id: String,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
}

/// Diameter peers serving this session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TgppContext {
    pub gx_dest_host: String,
    pub gy_dest_host: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatType {
    #[default]
    TgppLte,
    TgppWlan,
}

/// Subscriber and bearer attributes copied onto every outbound request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ue_ipv4: String,
    pub spgw_ipv4: String,
    pub msisdn: String,
    pub apn: String,
    pub imei: String,
    pub plmn_id: String,
    pub imsi_plmn_id: String,
    pub user_location: String,
    pub hardware_addr: String,
    pub rat_type: RatType,
    pub bearer_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventTrigger {
    UsageReport,
    RevalidationTimeout,
    RatChange,
    UeIpAddressChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventTriggerState {
    Pending,
    Ready,
    Cleared,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReAuthState {
    #[default]
    NotNeeded,
    Required,
    Processing,
}

/// Data-plane state of a charging credit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    #[default]
    Enabled,
    NeedsDeactivation,
    Disabled,
    NeedsActivation,
    Redirected,
    Restricted,
}

impl ServiceState {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceState::Enabled => "SERVICE_ENABLED",
            ServiceState::NeedsDeactivation => "SERVICE_NEEDS_DEACTIVATION",
            ServiceState::Disabled => "SERVICE_DISABLED",
            ServiceState::NeedsActivation => "SERVICE_NEEDS_ACTIVATION",
            ServiceState::Redirected => "SERVICE_REDIRECTED",
            ServiceState::Restricted => "SERVICE_RESTRICTED",
        }
    }
}

/// Outcome of a policy-initiated reauthorization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReAuthResult {
    UpdateInitiated,
    UpdateNotNeeded,
    SessionNotFound,
    OtherFailure,
}

/// Bytes of one report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub bytes_tx: u64,
    pub bytes_rx: u64,
}

/// Session-wide used-byte sums
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TotalCreditUsage {
    pub monitoring_tx: u64,
    pub monitoring_rx: u64,
    pub charging_tx: u64,
    pub charging_rx: u64,
}
