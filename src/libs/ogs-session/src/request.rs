//! Outbound update, termination and service-action messages

use crate::diameter::FinalUnitAction;
use crate::rule::PolicyRule;
use crate::types::{CreditKey, EventTrigger, MonitoringLevel, RatType, RedirectServer, TgppContext};

/// Kind of credit report (Gy Reporting-Reason plus engine-local triggers)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditUpdateType {
    Threshold,
    Qht,
    Final,
    QuotaExhausted,
    ValidityTimerExpired,
    OtherQuotaType,
    RatingConditionChange,
    ReauthRequired,
    PoolExhausted,
    Terminated,
}

impl CreditUpdateType {
    pub fn name(&self) -> &'static str {
        match self {
            CreditUpdateType::Threshold => "THRESHOLD",
            CreditUpdateType::Qht => "QHT",
            CreditUpdateType::Final => "FINAL",
            CreditUpdateType::QuotaExhausted => "QUOTA_EXHAUSTED",
            CreditUpdateType::ValidityTimerExpired => "VALIDITY_TIMER_EXPIRED",
            CreditUpdateType::OtherQuotaType => "OTHER_QUOTA_TYPE",
            CreditUpdateType::RatingConditionChange => "RATING_CONDITION_CHANGE",
            CreditUpdateType::ReauthRequired => "REAUTH_REQUIRED",
            CreditUpdateType::PoolExhausted => "POOL_EXHAUSTED",
            CreditUpdateType::Terminated => "TERMINATED",
        }
    }
}

/// Common fields stamped on every outbound request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub session_id: String,
    pub request_number: u32,
    /// Subscriber IMSI
    pub sid: String,
    pub msisdn: String,
    pub ue_ipv4: String,
    pub spgw_ipv4: String,
    pub apn: String,
    pub imei: String,
    pub plmn_id: String,
    pub imsi_plmn_id: String,
    pub user_location: String,
    pub hardware_addr: String,
    pub rat_type: RatType,
    pub tgpp_ctx: TgppContext,
}

/// Usage of one charging credit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditUsage {
    pub charging_key: CreditKey,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    pub update_type: CreditUpdateType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditUsageUpdate {
    pub context: RequestContext,
    pub usage: CreditUsage,
}

/// Usage of one monitoring key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageMonitorUpdate {
    pub monitoring_key: String,
    pub level: MonitoringLevel,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageMonitoringUpdateRequest {
    pub context: RequestContext,
    /// `None` for a bare event-trigger report
    pub update: Option<UsageMonitorUpdate>,
    pub event_trigger: EventTrigger,
}

/// Batch of reports collected by one `get_updates` pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSessionRequest {
    pub updates: Vec<CreditUsageUpdate>,
    pub usage_monitors: Vec<UsageMonitoringUpdateRequest>,
}

impl UpdateSessionRequest {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.usage_monitors.is_empty()
    }
}

/// Final report sent when a session completes termination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTerminateRequest {
    pub context: RequestContext,
    pub credit_usages: Vec<CreditUsage>,
    pub monitor_usages: Vec<UsageMonitorUpdate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceActionType {
    ContinueService,
    TerminateService,
    ActivateService,
    Redirect,
    RestrictAccess,
}

impl ServiceActionType {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceActionType::ContinueService => "CONTINUE_SERVICE",
            ServiceActionType::TerminateService => "TERMINATE_SERVICE",
            ServiceActionType::ActivateService => "ACTIVATE_SERVICE",
            ServiceActionType::Redirect => "REDIRECT",
            ServiceActionType::RestrictAccess => "RESTRICT_ACCESS",
        }
    }
}

impl From<FinalUnitAction> for ServiceActionType {
    fn from(action: FinalUnitAction) -> Self {
        match action {
            FinalUnitAction::Terminate => ServiceActionType::TerminateService,
            FinalUnitAction::Redirect => ServiceActionType::Redirect,
            FinalUnitAction::RestrictAccess => ServiceActionType::RestrictAccess,
        }
    }
}

/// Data-plane action flagged for a charging credit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAction {
    pub action_type: ServiceActionType,
    pub credit_key: CreditKey,
    pub imsi: String,
    pub ip_addr: String,
    pub redirect_server: Option<RedirectServer>,
    /// Installed static rules charged against the credit
    pub rule_ids: Vec<String>,
    /// Installed dynamic rules charged against the credit
    pub rule_definitions: Vec<PolicyRule>,
}
