//! Gy charging grants
//!
//! A [`ChargingGrant`] wraps a [`CreditBucket`] with the online-charging
//! attributes of a Multiple-Services-Credit-Control: final-unit indication,
//! validity timer, reauthorization and the service state on the data plane.

use crate::config::SessiondConf;
use crate::credit::CreditBucket;
use crate::delta::CreditDelta;
use crate::diameter::FinalUnitAction;
use crate::request::{CreditUpdateType, CreditUsage, ServiceActionType};
use crate::stored::StoredChargingGrant;
use crate::types::{
    ChargingCredit, CreditKey, CreditLimitType, FinalActionInfo, ReAuthState, ServiceState,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChargingGrant {
    pub credit: CreditBucket,
    pub is_final_grant: bool,
    pub final_action_info: FinalActionInfo,
    pub reauth_state: ReAuthState,
    pub service_state: ServiceState,
    /// Epoch seconds after which the grant must be revalidated, 0 if none
    pub expiry_time: i64,
}

impl ChargingGrant {
    pub fn new(limit_type: CreditLimitType) -> Self {
        Self { credit: CreditBucket::new(limit_type), ..Default::default() }
    }

    pub fn unmarshal(marshaled: &StoredChargingGrant) -> Self {
        Self {
            credit: CreditBucket::unmarshal(&marshaled.credit),
            is_final_grant: marshaled.is_final,
            final_action_info: marshaled.final_action_info.clone(),
            reauth_state: marshaled.reauth_state,
            service_state: marshaled.service_state,
            expiry_time: marshaled.expiry_time,
        }
    }

    pub fn marshal(&self) -> StoredChargingGrant {
        StoredChargingGrant {
            credit: self.credit.marshal(),
            is_final: self.is_final_grant,
            final_action_info: self.final_action_info.clone(),
            reauth_state: self.reauth_state,
            service_state: self.service_state,
            expiry_time: self.expiry_time,
        }
    }

    pub fn get_delta(&self) -> CreditDelta {
        CreditDelta {
            is_final: self.is_final_grant,
            final_action_info: self.final_action_info.clone(),
            reauth_state: self.reauth_state,
            service_state: self.service_state,
            expiry_time: self.expiry_time,
            ..self.credit.get_delta()
        }
    }

    pub fn merge_delta(&mut self, delta: &CreditDelta) {
        self.credit.merge_delta(delta);
        self.is_final_grant = delta.is_final;
        self.final_action_info = delta.final_action_info.clone();
        self.reauth_state = delta.reauth_state;
        self.service_state = delta.service_state;
        self.expiry_time = delta.expiry_time;
    }

    /// Apply a successful CCA credit received at `now`
    pub fn receive_charging_grant(&mut self, credit: &ChargingCredit, now: i64, delta: &mut CreditDelta) {
        self.is_final_grant = credit.is_final;
        delta.is_final = credit.is_final;
        if credit.is_final {
            self.final_action_info = FinalActionInfo {
                final_action: credit.final_action,
                redirect_server: credit.redirect_server.clone(),
            };
            delta.final_action_info = self.final_action_info.clone();
            log::info!("Final grant received, final action {}", credit.final_action.name());
        }

        self.expiry_time = if credit.validity_time > 0 {
            now + i64::from(credit.validity_time)
        } else {
            0
        };
        delta.expiry_time = self.expiry_time;

        self.credit.receive_credit(&credit.granted_units, delta);
    }

    /// Why this grant needs a report at `now`, if it does
    pub fn get_update_type(&self, conf: &SessiondConf, now: i64) -> Option<CreditUpdateType> {
        if self.credit.is_reporting() {
            return None;
        }
        if self.reauth_state == ReAuthState::Required {
            return Some(CreditUpdateType::ReauthRequired);
        }
        // Nothing more can be granted after a final grant is used up
        if self.is_final_grant && self.credit.is_quota_exhausted(1.0) {
            return None;
        }
        if self.credit.is_quota_exhausted(conf.usage_reporting_threshold) {
            if self.credit.is_quota_exhausted(1.0) {
                return Some(CreditUpdateType::QuotaExhausted);
            }
            return Some(CreditUpdateType::Threshold);
        }
        if self.expiry_time > 0 && self.expiry_time < now {
            return Some(CreditUpdateType::ValidityTimerExpired);
        }
        None
    }

    pub fn should_deactivate_service(&self, conf: &SessiondConf) -> bool {
        conf.terminate_service_when_quota_exhausted
            && self.service_state == ServiceState::Enabled
            && self.is_final_grant
            && self.credit.is_quota_exhausted(1.0)
    }

    /// Consume a pending service-state change and return the action the data
    /// plane must take
    pub fn get_action(&mut self, delta: &mut CreditDelta) -> ServiceActionType {
        match self.service_state {
            ServiceState::NeedsDeactivation => {
                let final_action = self.final_action_info.final_action;
                let next = match final_action {
                    FinalUnitAction::Terminate => ServiceState::Disabled,
                    FinalUnitAction::Redirect => ServiceState::Redirected,
                    FinalUnitAction::RestrictAccess => ServiceState::Restricted,
                };
                self.set_service_state(next, delta);
                ServiceActionType::from(final_action)
            }
            ServiceState::NeedsActivation => {
                self.set_service_state(ServiceState::Enabled, delta);
                ServiceActionType::ActivateService
            }
            _ => ServiceActionType::ContinueService,
        }
    }

    /// Build a usage report for `key`, moving the reported bytes into
    /// REPORTING. Terminal reports are not clamped to the grant.
    pub fn get_credit_usage(
        &mut self,
        key: CreditKey,
        update_type: CreditUpdateType,
        delta: &mut CreditDelta,
        is_terminate: bool,
    ) -> CreditUsage {
        let usage = if is_terminate {
            self.credit.get_all_unreported_usage_for_reporting(delta)
        } else {
            self.credit.get_usage_for_reporting(delta)
        };
        CreditUsage {
            charging_key: key,
            bytes_tx: usage.bytes_tx,
            bytes_rx: usage.bytes_rx,
            update_type,
        }
    }

    pub fn set_reauth_state(&mut self, state: ReAuthState, delta: &mut CreditDelta) {
        self.reauth_state = state;
        delta.reauth_state = state;
    }

    pub fn set_service_state(&mut self, state: ServiceState, delta: &mut CreditDelta) {
        if self.service_state != state {
            log::debug!("Service state {} -> {}", self.service_state.name(), state.name());
        }
        self.service_state = state;
        delta.service_state = state;
    }
}
