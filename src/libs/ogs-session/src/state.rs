//! Per-subscriber session aggregate
//!
//! [`SessionState`] owns the charging and monitoring ledgers, the three rule
//! sets and the lifecycle FSM of one data session. Every mutating call takes
//! a [`SessionDelta`] and records its effect there; the owner of the
//! authoritative copy commits it with [`SessionState::apply_delta`].
//!
//! A session is driven by exactly one owner at a time and is not internally
//! synchronized. Only the static rule catalog is shared.

use crate::bucket::Bucket;
use crate::config::SessiondConf;
use crate::delta::{CreditDelta, SessionDelta};
use crate::fsm::{SessionFsmEvent, SessionFsmState};
use crate::grant::ChargingGrant;
use crate::monitor::Monitor;
use crate::request::{
    CreditUpdateType, CreditUsageUpdate, RequestContext, ServiceAction, ServiceActionType,
    SessionTerminateRequest, UpdateSessionRequest, UsageMonitorUpdate,
    UsageMonitoringUpdateRequest,
};
use crate::rule::{
    PolicyRule, RuleLifetime, RuleSet, RuleState, RuleTransition, StaticRuleSet, StaticRuleStore,
};
use crate::stored::{StoredCreditEntry, StoredSessionState, STORED_SESSION_VERSION};
use crate::types::{
    unix_time_now, CreditKey, CreditUpdateResponse, EventTrigger, EventTriggerState,
    MonitoringAction, MonitoringLevel, ReAuthResult, ReAuthState, RuleRecord, ServiceState,
    SessionConfig, TgppContext, TotalCreditUsage, UsageMonitoringUpdateResponse,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

fn charging_delta<'a>(
    delta: &'a mut SessionDelta,
    key: CreditKey,
    grant: &ChargingGrant,
) -> &'a mut CreditDelta {
    delta
        .charging_credit_map
        .entry(key)
        .or_insert_with(|| grant.get_delta())
}

fn monitor_delta<'a>(
    delta: &'a mut SessionDelta,
    monitoring_key: &str,
    monitor: &Monitor,
) -> &'a mut CreditDelta {
    delta
        .monitor_credit_map
        .entry(monitoring_key.to_string())
        .or_insert_with(|| monitor.get_delta())
}

/// One subscriber data session
#[derive(Debug, Clone)]
pub struct SessionState {
    imsi: String,
    session_id: String,
    request_number: u32,
    curr_state: SessionFsmState,
    config: SessionConfig,
    tgpp_context: TgppContext,
    conf: SessiondConf,

    static_rule_store: Arc<StaticRuleStore>,
    static_rules: StaticRuleSet,
    dynamic_rules: RuleSet,
    gy_dynamic_rules: RuleSet,

    credit_map: BTreeMap<CreditKey, ChargingGrant>,
    monitor_map: BTreeMap<String, Monitor>,
    session_level_key: Option<String>,

    /// Data-plane reports requested but not yet received
    pending_reports: u32,
    pending_event_triggers: BTreeMap<EventTrigger, EventTriggerState>,
    revalidation_time: i64,
}

impl SessionState {
    pub fn new(
        imsi: &str,
        session_id: &str,
        config: SessionConfig,
        static_rule_store: Arc<StaticRuleStore>,
        tgpp_context: TgppContext,
        conf: SessiondConf,
    ) -> Self {
        log::info!("[{imsi}] New session {session_id}");
        Self {
            imsi: imsi.to_string(),
            session_id: session_id.to_string(),
            request_number: 1,
            curr_state: SessionFsmState::Active,
            config,
            tgpp_context,
            conf,
            static_rule_store,
            static_rules: StaticRuleSet::new(),
            dynamic_rules: RuleSet::new(),
            gy_dynamic_rules: RuleSet::new(),
            credit_map: BTreeMap::new(),
            monitor_map: BTreeMap::new(),
            session_level_key: None,
            pending_reports: 0,
            pending_event_triggers: BTreeMap::new(),
            revalidation_time: 0,
        }
    }

    /// Rebuild a session from its snapshot. Static rule definitions are
    /// resolved through `static_rule_store`.
    pub fn unmarshal(
        marshaled: &StoredSessionState,
        static_rule_store: Arc<StaticRuleStore>,
        conf: SessiondConf,
    ) -> Self {
        Self {
            imsi: marshaled.imsi.clone(),
            session_id: marshaled.session_id.clone(),
            request_number: marshaled.request_number,
            curr_state: marshaled.fsm_state,
            config: marshaled.config.clone(),
            tgpp_context: marshaled.tgpp_context.clone(),
            conf,
            static_rule_store,
            static_rules: StaticRuleSet::unmarshal(&marshaled.static_rules),
            dynamic_rules: RuleSet::unmarshal(&marshaled.dynamic_rules),
            gy_dynamic_rules: RuleSet::unmarshal(&marshaled.gy_dynamic_rules),
            credit_map: marshaled
                .credit_map
                .iter()
                .map(|entry| (entry.key, ChargingGrant::unmarshal(&entry.grant)))
                .collect(),
            monitor_map: marshaled
                .monitor_map
                .iter()
                .map(|(mkey, stored)| (mkey.clone(), Monitor::unmarshal(stored)))
                .collect(),
            session_level_key: marshaled.session_level_key.clone(),
            pending_reports: marshaled.pending_reports,
            pending_event_triggers: marshaled.pending_event_triggers.clone(),
            revalidation_time: marshaled.revalidation_time,
        }
    }

    pub fn marshal(&self) -> StoredSessionState {
        StoredSessionState {
            version: STORED_SESSION_VERSION,
            imsi: self.imsi.clone(),
            session_id: self.session_id.clone(),
            fsm_state: self.curr_state,
            config: self.config.clone(),
            tgpp_context: self.tgpp_context.clone(),
            request_number: self.request_number,
            pending_reports: self.pending_reports,
            session_level_key: self.session_level_key.clone(),
            credit_map: self
                .credit_map
                .iter()
                .map(|(key, grant)| StoredCreditEntry { key: *key, grant: grant.marshal() })
                .collect(),
            monitor_map: self
                .monitor_map
                .iter()
                .map(|(mkey, monitor)| (mkey.clone(), monitor.marshal()))
                .collect(),
            static_rules: self.static_rules.marshal(),
            dynamic_rules: self.dynamic_rules.marshal(),
            gy_dynamic_rules: self.gy_dynamic_rules.marshal(),
            pending_event_triggers: self.pending_event_triggers.clone(),
            revalidation_time: self.revalidation_time,
        }
    }

    pub fn imsi(&self) -> &str {
        &self.imsi
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn request_number(&self) -> u32 {
        self.request_number
    }

    pub fn state(&self) -> SessionFsmState {
        self.curr_state
    }

    pub fn is_active(&self) -> bool {
        self.curr_state == SessionFsmState::Active
    }

    pub fn is_terminating(&self) -> bool {
        self.curr_state.is_terminating()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn tgpp_context(&self) -> &TgppContext {
        &self.tgpp_context
    }

    pub fn session_level_key(&self) -> Option<&str> {
        self.session_level_key.as_deref()
    }

    pub fn pending_reports(&self) -> u32 {
        self.pending_reports
    }

    pub fn revalidation_time(&self) -> i64 {
        self.revalidation_time
    }

    pub fn credit(&self, key: &CreditKey) -> Option<&ChargingGrant> {
        self.credit_map.get(key)
    }

    pub fn monitor(&self, monitoring_key: &str) -> Option<&Monitor> {
        self.monitor_map.get(monitoring_key)
    }

    /// Counter of a charging credit, 0 for an unknown key
    pub fn get_charging_credit(&self, key: &CreditKey, bucket: Bucket) -> u64 {
        self.credit_map
            .get(key)
            .map(|grant| grant.credit.get_credit(bucket))
            .unwrap_or(0)
    }

    /// Counter of a monitor, 0 for an unknown key
    pub fn get_monitor_credit(&self, monitoring_key: &str, bucket: Bucket) -> u64 {
        self.monitor_map
            .get(monitoring_key)
            .map(|monitor| monitor.credit.get_credit(bucket))
            .unwrap_or(0)
    }

    pub fn static_rules(&self) -> &StaticRuleSet {
        &self.static_rules
    }

    pub fn dynamic_rules(&self) -> &RuleSet {
        &self.dynamic_rules
    }

    pub fn gy_dynamic_rules(&self) -> &RuleSet {
        &self.gy_dynamic_rules
    }

    pub fn set_tgpp_context(&mut self, tgpp_context: TgppContext, delta: &mut SessionDelta) {
        self.tgpp_context = tgpp_context.clone();
        delta.updated_tgpp_context = Some(tgpp_context);
    }

    pub fn set_config(&mut self, config: SessionConfig, delta: &mut SessionDelta) {
        self.config = config.clone();
        delta.updated_config = Some(config);
    }

    pub fn is_same_config(&self, config: &SessionConfig) -> bool {
        self.config == *config
    }

    // ---- Lifecycle ----

    fn dispatch_fsm_event(&mut self, event: SessionFsmEvent, delta: &mut SessionDelta) -> bool {
        match self.curr_state.on_event(event) {
            Some(next) => {
                log::debug!(
                    "[{}] Session {} FSM {} -> {} on {}",
                    self.imsi,
                    self.session_id,
                    self.curr_state.name(),
                    next.name(),
                    event.name()
                );
                self.curr_state = next;
                delta.is_fsm_updated = true;
                delta.updated_fsm_state = next;
                true
            }
            None => false,
        }
    }

    fn set_pending_reports(&mut self, pending_reports: u32, delta: &mut SessionDelta) {
        self.pending_reports = pending_reports;
        delta.updated_pending_reports = Some(pending_reports);
    }

    /// Defer termination until the owner starts it
    pub fn mark_as_awaiting_termination(&mut self, delta: &mut SessionDelta) {
        if !self.dispatch_fsm_event(SessionFsmEvent::ScheduleTermination, delta) {
            log::warn!(
                "[{}] Cannot schedule termination of {} in {}",
                self.imsi,
                self.session_id,
                self.curr_state.name()
            );
        }
    }

    pub fn start_termination(&mut self, delta: &mut SessionDelta) {
        if !self.dispatch_fsm_event(SessionFsmEvent::StartTermination, delta) {
            log::warn!(
                "[{}] Cannot start termination of {} in {}",
                self.imsi,
                self.session_id,
                self.curr_state.name()
            );
        }
    }

    /// Open a usage-collection round with the data plane
    pub fn new_report(&mut self, delta: &mut SessionDelta) {
        self.set_pending_reports(self.pending_reports.saturating_add(1), delta);
        self.dispatch_fsm_event(SessionFsmEvent::NewReport, delta);
    }

    /// Close a usage-collection round
    pub fn finish_report(&mut self, delta: &mut SessionDelta) {
        if self.pending_reports == 0 {
            log::warn!("[{}] finish_report with no report pending", self.imsi);
        }
        self.set_pending_reports(self.pending_reports.saturating_sub(1), delta);
        if self.pending_reports == 0 {
            self.dispatch_fsm_event(SessionFsmEvent::ReportsFlushed, delta);
        }
    }

    fn is_any_credit_reporting(&self) -> bool {
        self.credit_map.values().any(|grant| grant.credit.is_reporting())
            || self.monitor_map.values().any(|monitor| monitor.credit.is_reporting())
    }

    /// Termination has been started or scheduled, every report round is
    /// closed and no credit is waiting on an answer
    pub fn can_complete_termination(&self) -> bool {
        self.curr_state.is_terminating()
            && self.pending_reports == 0
            && !self.is_any_credit_reporting()
    }

    /// Finish termination and build the final report with all unreported
    /// usage. Returns `None` if the session is active or already terminated.
    pub fn complete_termination(&mut self, delta: &mut SessionDelta) -> Option<SessionTerminateRequest> {
        match self.curr_state {
            SessionFsmState::Active => {
                log::error!(
                    "[{}] Session {} is active, refusing to complete termination",
                    self.imsi,
                    self.session_id
                );
                return None;
            }
            SessionFsmState::Terminated => {
                log::debug!("[{}] Session {} already terminated", self.imsi, self.session_id);
                return None;
            }
            _ if !self.can_complete_termination() => {
                log::info!(
                    "[{}] Forcefully completing termination of {} in {}",
                    self.imsi,
                    self.session_id,
                    self.curr_state.name()
                );
            }
            _ => {}
        }

        self.dispatch_fsm_event(SessionFsmEvent::CompleteTermination, delta);
        let request = self.make_termination_request(delta);
        log::info!(
            "[{}] Session {} terminated with {} credit and {} monitor usages",
            self.imsi,
            self.session_id,
            request.credit_usages.len(),
            request.monitor_usages.len()
        );
        Some(request)
    }

    fn make_termination_request(&mut self, delta: &mut SessionDelta) -> SessionTerminateRequest {
        let context = self.make_request_context();

        let mut monitor_usages = Vec::new();
        for (mkey, monitor) in self.monitor_map.iter_mut() {
            let credit_delta = monitor_delta(delta, mkey, monitor);
            let usage = monitor.credit.get_all_unreported_usage_for_reporting(credit_delta);
            monitor_usages.push(UsageMonitorUpdate {
                monitoring_key: mkey.clone(),
                level: monitor.level,
                bytes_tx: usage.bytes_tx,
                bytes_rx: usage.bytes_rx,
            });
        }

        let mut credit_usages = Vec::new();
        for (key, grant) in self.credit_map.iter_mut() {
            let credit_delta = charging_delta(delta, *key, grant);
            credit_usages.push(grant.get_credit_usage(
                *key,
                CreditUpdateType::Terminated,
                credit_delta,
                true,
            ));
        }

        SessionTerminateRequest { context, credit_usages, monitor_usages }
    }

    // ---- Charging credit ----

    /// Apply a Gy answer for one charging key.
    ///
    /// Returns whether the key now holds usable credit.
    pub fn receive_charging_credit(
        &mut self,
        response: &CreditUpdateResponse,
        delta: &mut SessionDelta,
    ) -> bool {
        let key = response.charging_key;
        let now = unix_time_now();
        let Some(grant) = self.credit_map.get_mut(&key) else {
            return self.init_charging_credit(response, now, delta);
        };

        let credit_delta = charging_delta(delta, key, grant);
        if !response.success {
            log::error!(
                "[{}] Credit update failed for {key}, result code {}",
                self.imsi,
                response.result_code
            );
            grant.credit.mark_failure(response.result_code, credit_delta);
            if grant.should_deactivate_service(&self.conf) {
                grant.set_service_state(ServiceState::NeedsDeactivation, credit_delta);
            }
            return false;
        }

        log::info!("[{}] Received charging credit for {key}", self.imsi);
        grant.receive_charging_grant(&response.credit, now, credit_delta);

        if grant.reauth_state == ReAuthState::Processing {
            grant.set_reauth_state(ReAuthState::NotNeeded, credit_delta);
        }
        if !grant.credit.is_quota_exhausted(1.0) && grant.service_state != ServiceState::Enabled {
            log::info!("[{}] Quota available for {key}, activating service", self.imsi);
            grant.set_service_state(ServiceState::NeedsActivation, credit_delta);
        }

        response.credit.granted_units.contains_credit() || grant.credit.is_infinite()
    }

    fn init_charging_credit(
        &mut self,
        response: &CreditUpdateResponse,
        now: i64,
        delta: &mut SessionDelta,
    ) -> bool {
        let key = response.charging_key;
        if !response.success {
            log::error!(
                "[{}] Credit init failed for {key}, result code {}",
                self.imsi,
                response.result_code
            );
            return false;
        }

        log::info!("[{}] Initialized charging credit for {key}", self.imsi);
        let mut grant = ChargingGrant::new(response.limit_type);
        let mut scratch = grant.get_delta();
        grant.receive_charging_grant(&response.credit, now, &mut scratch);

        let has_credit = response.credit.granted_units.contains_credit() || grant.credit.is_infinite();
        delta.charging_credit_map.remove(&key);
        delta.charging_credit_to_install.insert(key, grant.marshal());
        self.credit_map.insert(key, grant);
        has_credit
    }

    // ---- Usage monitors ----

    fn set_session_level_key(&mut self, key: Option<String>, delta: &mut SessionDelta) {
        if let (Some(old), Some(new)) = (&self.session_level_key, &key) {
            if old != new {
                log::warn!(
                    "[{}] Session-level monitoring key {old} replaced by {new}",
                    self.imsi
                );
            }
        }
        self.session_level_key = key.clone();
        delta.is_session_level_key_updated = true;
        delta.updated_session_level_key = key;
    }

    /// Apply a Gx usage-monitoring answer.
    ///
    /// Returns false if the answer failed or a new monitor could not be set up.
    pub fn receive_monitor(
        &mut self,
        response: &UsageMonitoringUpdateResponse,
        delta: &mut SessionDelta,
    ) -> bool {
        let Some(credit) = &response.credit else {
            return true;
        };
        let mkey = credit.monitoring_key.as_str();

        if response.success && credit.level == MonitoringLevel::SessionLevel {
            match credit.action {
                MonitoringAction::Disable => self.set_session_level_key(None, delta),
                MonitoringAction::Continue => {
                    self.set_session_level_key(Some(mkey.to_string()), delta)
                }
            }
        }

        let Some(monitor) = self.monitor_map.get_mut(mkey) else {
            return self.init_monitor(response, delta);
        };

        let credit_delta = monitor_delta(delta, mkey, monitor);
        if !response.success {
            log::error!(
                "[{}] Monitor update failed for {mkey}, result code {}",
                self.imsi,
                response.result_code
            );
            monitor.credit.mark_failure(response.result_code, credit_delta);
            return false;
        }

        log::info!("[{}] Received monitor credit for {mkey}", self.imsi);
        monitor.credit.receive_credit(&credit.granted_units, credit_delta);

        if credit.action == MonitoringAction::Disable {
            log::info!("[{}] Disabling monitor {mkey}", self.imsi);
            self.monitor_map.remove(mkey);
            delta.monitor_credit_to_uninstall.insert(mkey.to_string());
        }
        true
    }

    fn init_monitor(&mut self, response: &UsageMonitoringUpdateResponse, delta: &mut SessionDelta) -> bool {
        let Some(credit) = &response.credit else {
            return true;
        };
        let mkey = &credit.monitoring_key;
        if !response.success {
            log::error!(
                "[{}] Monitor init failed for {mkey}, result code {}",
                self.imsi,
                response.result_code
            );
            return false;
        }
        if credit.action == MonitoringAction::Disable {
            log::warn!("[{}] Monitor {mkey} disabled before it was installed", self.imsi);
            return false;
        }

        log::info!("[{}] Initialized monitor {mkey}", self.imsi);
        let mut monitor = Monitor::new(credit.level);
        let mut scratch = monitor.get_delta();
        monitor.credit.receive_credit(&credit.granted_units, &mut scratch);

        delta.monitor_credit_map.remove(mkey);
        delta.monitor_credit_to_uninstall.remove(mkey);
        delta.monitor_credit_to_install.insert(mkey.clone(), monitor.marshal());
        self.monitor_map.insert(mkey.clone(), monitor);
        true
    }

    // ---- Usage ----

    /// Charging key of a dynamic, Gy-dynamic or catalog rule
    pub fn get_charging_key_for_rule_id(&self, rule_id: &str) -> Option<CreditKey> {
        self.dynamic_rules
            .get_charging_key_for_rule_id(rule_id)
            .or_else(|| self.gy_dynamic_rules.get_charging_key_for_rule_id(rule_id))
            .or_else(|| self.static_rule_store.get_charging_key_for_rule_id(rule_id))
    }

    pub fn get_monitoring_key_for_rule_id(&self, rule_id: &str) -> Option<String> {
        self.dynamic_rules
            .get_monitoring_key_for_rule_id(rule_id)
            .or_else(|| self.gy_dynamic_rules.get_monitoring_key_for_rule_id(rule_id))
            .or_else(|| self.static_rule_store.get_monitoring_key_for_rule_id(rule_id))
    }

    /// Account data-plane usage of one rule to its charging credit, its
    /// monitor and the session-level monitor
    pub fn add_rule_usage(&mut self, rule_id: &str, used_tx: u64, used_rx: u64, delta: &mut SessionDelta) {
        if self.curr_state == SessionFsmState::TerminatingAggregatingStats {
            self.dispatch_fsm_event(SessionFsmEvent::UsageReceived, delta);
        }

        if let Some(key) = self.get_charging_key_for_rule_id(rule_id) {
            if let Some(grant) = self.credit_map.get_mut(&key) {
                log::debug!("[{}] Rule {rule_id} used tx={used_tx} rx={used_rx} on {key}", self.imsi);
                let credit_delta = charging_delta(delta, key, grant);
                grant.credit.add_used_credit(used_tx, used_rx, credit_delta);
                if grant.should_deactivate_service(&self.conf) {
                    log::info!("[{}] Final quota for {key} exhausted", self.imsi);
                    grant.set_service_state(ServiceState::NeedsDeactivation, credit_delta);
                }
            }
        }

        let monitoring_key = self.get_monitoring_key_for_rule_id(rule_id);
        if let Some(mkey) = &monitoring_key {
            self.add_to_monitor(mkey, used_tx, used_rx, delta);
        }
        if let Some(session_key) = self.session_level_key.clone() {
            if monitoring_key.as_deref() != Some(session_key.as_str()) {
                self.add_to_monitor(&session_key, used_tx, used_rx, delta);
            }
        }
    }

    /// Account a batch of data-plane rule records
    pub fn add_rule_records(&mut self, records: &[RuleRecord], delta: &mut SessionDelta) {
        for record in records {
            self.add_rule_usage(&record.rule_id, record.bytes_tx, record.bytes_rx, delta);
        }
    }

    fn add_to_monitor(&mut self, mkey: &str, used_tx: u64, used_rx: u64, delta: &mut SessionDelta) {
        if let Some(monitor) = self.monitor_map.get_mut(mkey) {
            log::debug!("[{}] Monitor {mkey} used tx={used_tx} rx={used_rx}", self.imsi);
            let credit_delta = monitor_delta(delta, mkey, monitor);
            monitor.credit.add_used_credit(used_tx, used_rx, credit_delta);
        }
    }

    /// USED_* sums over the credits and monitors referenced by installed rules
    pub fn get_total_credit_usage(&self) -> TotalCreditUsage {
        let mut charging_keys = BTreeSet::new();
        let mut monitoring_keys = BTreeSet::new();

        for rule_id in self.static_rules.get_rule_ids() {
            if let Some(key) = self.static_rule_store.get_charging_key_for_rule_id(&rule_id) {
                charging_keys.insert(key);
            }
            if let Some(mkey) = self.static_rule_store.get_monitoring_key_for_rule_id(&rule_id) {
                monitoring_keys.insert(mkey);
            }
        }
        for rule in self.dynamic_rules.get_rules().into_iter().chain(self.gy_dynamic_rules.get_rules()) {
            if let Some(key) = rule.charging_key() {
                charging_keys.insert(key);
            }
            if let Some(mkey) = rule.monitoring_key() {
                monitoring_keys.insert(mkey.to_string());
            }
        }

        let mut usage = TotalCreditUsage::default();
        for mkey in &monitoring_keys {
            usage.monitoring_tx = usage
                .monitoring_tx
                .saturating_add(self.get_monitor_credit(mkey, Bucket::UsedTx));
            usage.monitoring_rx = usage
                .monitoring_rx
                .saturating_add(self.get_monitor_credit(mkey, Bucket::UsedRx));
        }
        for key in &charging_keys {
            usage.charging_tx = usage
                .charging_tx
                .saturating_add(self.get_charging_credit(key, Bucket::UsedTx));
            usage.charging_rx = usage
                .charging_rx
                .saturating_add(self.get_charging_credit(key, Bucket::UsedRx));
        }
        usage
    }

    // ---- Updates ----

    fn make_request_context(&self) -> RequestContext {
        RequestContext {
            session_id: self.session_id.clone(),
            request_number: self.request_number,
            sid: self.imsi.clone(),
            msisdn: self.config.msisdn.clone(),
            ue_ipv4: self.config.ue_ipv4.clone(),
            spgw_ipv4: self.config.spgw_ipv4.clone(),
            apn: self.config.apn.clone(),
            imei: self.config.imei.clone(),
            plmn_id: self.config.plmn_id.clone(),
            imsi_plmn_id: self.config.imsi_plmn_id.clone(),
            user_location: self.config.user_location.clone(),
            hardware_addr: self.config.hardware_addr.clone(),
            rat_type: self.config.rat_type,
            tgpp_ctx: self.tgpp_context.clone(),
        }
    }

    fn next_request_context(&mut self, delta: &mut SessionDelta) -> RequestContext {
        let context = self.make_request_context();
        self.request_number += 1;
        delta.request_number_increment += 1;
        context
    }

    /// Collect every pending credit report, monitor report and service
    /// action. Only an active session reports.
    pub fn get_updates(
        &mut self,
        request: &mut UpdateSessionRequest,
        actions: &mut Vec<ServiceAction>,
        delta: &mut SessionDelta,
    ) {
        if !self.is_active() {
            return;
        }
        self.get_charging_updates(request, actions, delta);
        self.get_monitor_updates(request, delta);
        self.get_event_trigger_updates(request, delta);
    }

    /// Some installed rule is charged against `key`
    fn is_charging_key_in_use(&self, key: &CreditKey) -> bool {
        let static_in_use = self
            .static_rules
            .get_rule_ids()
            .iter()
            .any(|id| self.static_rule_store.get_charging_key_for_rule_id(id).as_ref() == Some(key));
        static_in_use
            || !self.dynamic_rules.get_rule_definitions_for_charging_key(key).is_empty()
            || !self.gy_dynamic_rules.get_rule_definitions_for_charging_key(key).is_empty()
    }

    fn get_charging_updates(
        &mut self,
        request: &mut UpdateSessionRequest,
        actions: &mut Vec<ServiceAction>,
        delta: &mut SessionDelta,
    ) {
        let now = unix_time_now();
        let keys: Vec<CreditKey> = self.credit_map.keys().copied().collect();

        for key in keys {
            let orphaned = !self.is_charging_key_in_use(&key);
            let Some(grant) = self.credit_map.get_mut(&key) else {
                continue;
            };
            let credit_delta = charging_delta(delta, key, grant);

            let action_type = grant.get_action(credit_delta);
            if action_type == ServiceActionType::ContinueService {
                let update_type = match grant.get_update_type(&self.conf, now) {
                    Some(update_type) => update_type,
                    None if orphaned
                        && !grant.credit.is_reporting()
                        && grant.credit.has_unreported_usage() =>
                    {
                        CreditUpdateType::Terminated
                    }
                    None => continue,
                };
                log::debug!(
                    "[{}] Credit update for {key}, type {}",
                    self.imsi,
                    update_type.name()
                );
                if update_type == CreditUpdateType::ReauthRequired {
                    grant.set_reauth_state(ReAuthState::Processing, credit_delta);
                }
                let usage = grant.get_credit_usage(key, update_type, credit_delta, false);
                let context = self.next_request_context(delta);
                request.updates.push(CreditUsageUpdate { context, usage });
                continue;
            }

            log::info!(
                "[{}] Service action {} for {key}",
                self.imsi,
                action_type.name()
            );
            let redirect_server = (action_type == ServiceActionType::Redirect)
                .then(|| grant.final_action_info.redirect_server.clone());
            let rule_ids = self
                .static_rules
                .get_rule_ids()
                .into_iter()
                .filter(|id| self.static_rule_store.get_charging_key_for_rule_id(id) == Some(key))
                .collect();
            actions.push(ServiceAction {
                action_type,
                credit_key: key,
                imsi: self.imsi.clone(),
                ip_addr: self.config.ue_ipv4.clone(),
                redirect_server,
                rule_ids,
                rule_definitions: self.dynamic_rules.get_rule_definitions_for_charging_key(&key),
            });
        }
    }

    fn get_monitor_updates(&mut self, request: &mut UpdateSessionRequest, delta: &mut SessionDelta) {
        let threshold = self.conf.usage_reporting_threshold;
        let mut updates = Vec::new();

        for (mkey, monitor) in self.monitor_map.iter_mut() {
            if monitor.credit.is_reporting() || !monitor.credit.is_quota_exhausted(threshold) {
                continue;
            }
            log::debug!("[{}] Monitor update for {mkey}", self.imsi);
            let credit_delta = monitor_delta(delta, mkey, monitor);
            let usage = monitor.credit.get_usage_for_reporting(credit_delta);
            updates.push(UsageMonitorUpdate {
                monitoring_key: mkey.clone(),
                level: monitor.level,
                bytes_tx: usage.bytes_tx,
                bytes_rx: usage.bytes_rx,
            });
        }

        for update in updates {
            let context = self.next_request_context(delta);
            request.usage_monitors.push(UsageMonitoringUpdateRequest {
                context,
                update: Some(update),
                event_trigger: EventTrigger::UsageReport,
            });
        }
    }

    fn get_event_trigger_updates(&mut self, request: &mut UpdateSessionRequest, delta: &mut SessionDelta) {
        let revalidation_ready = self.pending_event_triggers.get(&EventTrigger::RevalidationTimeout)
            == Some(&EventTriggerState::Ready);
        if !revalidation_ready {
            return;
        }
        log::debug!("[{}] Revalidation timeout reported", self.imsi);
        let context = self.next_request_context(delta);
        request.usage_monitors.push(UsageMonitoringUpdateRequest {
            context,
            update: None,
            event_trigger: EventTrigger::RevalidationTimeout,
        });
        self.remove_event_trigger(EventTrigger::RevalidationTimeout, delta);
    }

    // ---- Event triggers ----

    pub fn add_new_event_trigger(&mut self, trigger: EventTrigger, delta: &mut SessionDelta) {
        self.set_event_trigger(trigger, EventTriggerState::Pending, delta);
    }

    pub fn mark_event_trigger_as_triggered(&mut self, trigger: EventTrigger, delta: &mut SessionDelta) {
        if !self.pending_event_triggers.contains_key(&trigger) {
            log::warn!("[{}] Event trigger {trigger:?} is not pending", self.imsi);
            return;
        }
        self.set_event_trigger(trigger, EventTriggerState::Ready, delta);
    }

    pub fn remove_event_trigger(&mut self, trigger: EventTrigger, delta: &mut SessionDelta) {
        self.pending_event_triggers.remove(&trigger);
        delta.is_pending_event_triggers_updated = true;
        delta.pending_event_triggers.insert(trigger, EventTriggerState::Cleared);
    }

    pub fn event_trigger_state(&self, trigger: EventTrigger) -> Option<EventTriggerState> {
        self.pending_event_triggers.get(&trigger).copied()
    }

    fn set_event_trigger(&mut self, trigger: EventTrigger, state: EventTriggerState, delta: &mut SessionDelta) {
        self.pending_event_triggers.insert(trigger, state);
        delta.is_pending_event_triggers_updated = true;
        delta.pending_event_triggers.insert(trigger, state);
    }

    pub fn set_revalidation_time(&mut self, revalidation_time: i64, delta: &mut SessionDelta) {
        self.revalidation_time = revalidation_time;
        delta.revalidation_time = Some(revalidation_time);
    }

    // ---- Reauthorization ----

    /// Request reauthorization of one charging key
    pub fn reauth_key(&mut self, key: &CreditKey, delta: &mut SessionDelta) -> ReAuthResult {
        let Some(grant) = self.credit_map.get_mut(key) else {
            log::warn!("[{}] Reauth for unknown charging key {key}", self.imsi);
            return ReAuthResult::SessionNotFound;
        };
        if grant.credit.is_reporting() {
            return ReAuthResult::UpdateNotNeeded;
        }
        let credit_delta = charging_delta(delta, *key, grant);
        grant.set_reauth_state(ReAuthState::Required, credit_delta);
        ReAuthResult::UpdateInitiated
    }

    /// Request reauthorization of every charging key that is not reporting
    pub fn reauth_all(&mut self, delta: &mut SessionDelta) -> ReAuthResult {
        let mut result = ReAuthResult::UpdateNotNeeded;
        for (key, grant) in self.credit_map.iter_mut() {
            if grant.credit.is_reporting() {
                continue;
            }
            let credit_delta = charging_delta(delta, *key, grant);
            grant.set_reauth_state(ReAuthState::Required, credit_delta);
            result = ReAuthResult::UpdateInitiated;
        }
        result
    }

    // ---- Rules ----

    pub fn is_static_rule_installed(&self, rule_id: &str) -> bool {
        self.static_rules.is_installed(rule_id)
    }

    pub fn is_static_rule_scheduled(&self, rule_id: &str) -> bool {
        self.static_rules.is_scheduled(rule_id)
    }

    pub fn is_dynamic_rule_installed(&self, rule_id: &str) -> bool {
        self.dynamic_rules.is_installed(rule_id)
    }

    pub fn is_dynamic_rule_scheduled(&self, rule_id: &str) -> bool {
        self.dynamic_rules.is_scheduled(rule_id)
    }

    pub fn is_gy_dynamic_rule_installed(&self, rule_id: &str) -> bool {
        self.gy_dynamic_rules.is_installed(rule_id)
    }

    /// Install a static rule from the shared catalog
    pub fn activate_static_rule(&mut self, rule_id: &str, lifetime: RuleLifetime, delta: &mut SessionDelta) {
        self.static_rules.insert_rule(rule_id, lifetime, RuleState::Active);
        delta.new_scheduled_static_rules.remove(rule_id);
        delta.static_rules_to_install.insert(rule_id.to_string());
        delta.new_rule_lifetimes.insert(rule_id.to_string(), lifetime);
    }

    /// Schedule a static rule, replacing an installed one with the same id
    pub fn schedule_static_rule(&mut self, rule_id: &str, lifetime: RuleLifetime, delta: &mut SessionDelta) {
        if self.static_rules.is_installed(rule_id) {
            self.deactivate_static_rule(rule_id, delta);
        }
        self.static_rules.insert_rule(rule_id, lifetime, RuleState::Scheduled);
        delta.new_scheduled_static_rules.insert(rule_id.to_string());
        delta.new_rule_lifetimes.insert(rule_id.to_string(), lifetime);
    }

    /// Activate a previously scheduled static rule
    pub fn install_scheduled_static_rule(&mut self, rule_id: &str, delta: &mut SessionDelta) -> bool {
        if !self.static_rules.activate_rule(rule_id) {
            return false;
        }
        delta.static_rules_to_install.insert(rule_id.to_string());
        true
    }

    /// Remove a static rule in either state
    pub fn deactivate_static_rule(&mut self, rule_id: &str, delta: &mut SessionDelta) -> bool {
        if self.static_rules.remove_rule(rule_id).is_none() {
            return false;
        }
        delta.static_rules_to_install.remove(rule_id);
        delta.new_scheduled_static_rules.remove(rule_id);
        delta.static_rules_to_uninstall.insert(rule_id.to_string());
        true
    }

    pub fn insert_dynamic_rule(&mut self, rule: PolicyRule, lifetime: RuleLifetime, delta: &mut SessionDelta) {
        if self.dynamic_rules.is_installed(&rule.id) {
            return;
        }
        delta.new_scheduled_dynamic_rules.retain(|r| r.id != rule.id);
        delta.new_rule_lifetimes.insert(rule.id.clone(), lifetime);
        delta.dynamic_rules_to_install.push(rule.clone());
        self.dynamic_rules.insert_rule(rule, lifetime, RuleState::Active);
    }

    pub fn schedule_dynamic_rule(&mut self, rule: PolicyRule, lifetime: RuleLifetime, delta: &mut SessionDelta) {
        if self.dynamic_rules.is_installed(&rule.id) {
            self.remove_dynamic_rule(&rule.id, delta);
        }
        delta.new_scheduled_dynamic_rules.retain(|r| r.id != rule.id);
        delta.new_rule_lifetimes.insert(rule.id.clone(), lifetime);
        delta.new_scheduled_dynamic_rules.push(rule.clone());
        self.dynamic_rules.insert_rule(rule, lifetime, RuleState::Scheduled);
    }

    pub fn install_scheduled_dynamic_rule(&mut self, rule_id: &str, delta: &mut SessionDelta) -> bool {
        let Some(rule) = self.dynamic_rules.activate_rule(rule_id) else {
            return false;
        };
        delta.dynamic_rules_to_install.push(rule.clone());
        true
    }

    /// Remove a dynamic rule in either state, returning it
    pub fn remove_dynamic_rule(&mut self, rule_id: &str, delta: &mut SessionDelta) -> Option<PolicyRule> {
        let entry = self.dynamic_rules.remove_rule(rule_id)?;
        delta.dynamic_rules_to_install.retain(|r| r.id != rule_id);
        delta.new_scheduled_dynamic_rules.retain(|r| r.id != rule_id);
        delta.dynamic_rules_to_uninstall.insert(rule_id.to_string());
        Some(entry.rule)
    }

    pub fn insert_gy_dynamic_rule(&mut self, rule: PolicyRule, lifetime: RuleLifetime, delta: &mut SessionDelta) {
        if self.gy_dynamic_rules.is_installed(&rule.id) {
            return;
        }
        delta.new_scheduled_gy_dynamic_rules.retain(|r| r.id != rule.id);
        delta.new_rule_lifetimes.insert(rule.id.clone(), lifetime);
        delta.gy_dynamic_rules_to_install.push(rule.clone());
        self.gy_dynamic_rules.insert_rule(rule, lifetime, RuleState::Active);
    }

    pub fn schedule_gy_dynamic_rule(&mut self, rule: PolicyRule, lifetime: RuleLifetime, delta: &mut SessionDelta) {
        if self.gy_dynamic_rules.is_installed(&rule.id) {
            self.remove_gy_dynamic_rule(&rule.id, delta);
        }
        delta.new_scheduled_gy_dynamic_rules.retain(|r| r.id != rule.id);
        delta.new_rule_lifetimes.insert(rule.id.clone(), lifetime);
        delta.new_scheduled_gy_dynamic_rules.push(rule.clone());
        self.gy_dynamic_rules.insert_rule(rule, lifetime, RuleState::Scheduled);
    }

    pub fn install_scheduled_gy_dynamic_rule(&mut self, rule_id: &str, delta: &mut SessionDelta) -> bool {
        let Some(rule) = self.gy_dynamic_rules.activate_rule(rule_id) else {
            return false;
        };
        delta.gy_dynamic_rules_to_install.push(rule.clone());
        true
    }

    pub fn remove_gy_dynamic_rule(&mut self, rule_id: &str, delta: &mut SessionDelta) -> Option<PolicyRule> {
        let entry = self.gy_dynamic_rules.remove_rule(rule_id)?;
        delta.gy_dynamic_rules_to_install.retain(|r| r.id != rule_id);
        delta.new_scheduled_gy_dynamic_rules.retain(|r| r.id != rule_id);
        delta.gy_dynamic_rules_to_uninstall.insert(rule_id.to_string());
        Some(entry.rule)
    }

    /// Installed rules feeding any monitoring key
    pub fn total_monitored_rules_count(&self) -> usize {
        let static_monitored = self
            .static_rules
            .get_rule_ids()
            .iter()
            .filter(|id| self.static_rule_store.get_monitoring_key_for_rule_id(id).is_some())
            .count();
        static_monitored
            + self.dynamic_rules.monitored_rules_count()
            + self.gy_dynamic_rules.monitored_rules_count()
    }

    pub fn active_monitored_rules_exist(&self) -> bool {
        self.total_monitored_rules_count() > 0
    }

    /// Number of charging credits plus monitors
    pub fn get_credit_key_count(&self) -> usize {
        self.credit_map.len() + self.monitor_map.len()
    }

    pub fn is_credit_state_redirected(&self, key: &CreditKey) -> bool {
        self.credit_map
            .get(key)
            .is_some_and(|grant| grant.service_state == ServiceState::Redirected)
    }

    /// Lifetime of a scheduled or installed rule of any kind
    pub fn get_rule_lifetime(&self, rule_id: &str) -> Option<RuleLifetime> {
        self.static_rules
            .get_lifetime(rule_id)
            .or_else(|| self.dynamic_rules.get_lifetime(rule_id))
            .or_else(|| self.gy_dynamic_rules.get_lifetime(rule_id))
    }

    /// Install scheduled rules whose window opened and remove rules whose
    /// window closed at `now`
    pub fn sync_rules_to_time(&mut self, now: i64, delta: &mut SessionDelta) {
        for (rule_id, transition) in self.static_rules.pending_transitions(now) {
            match transition {
                RuleTransition::Install => {
                    self.install_scheduled_static_rule(&rule_id, delta);
                }
                RuleTransition::Remove => {
                    self.deactivate_static_rule(&rule_id, delta);
                }
            }
        }
        for (rule_id, transition) in self.dynamic_rules.pending_transitions(now) {
            match transition {
                RuleTransition::Install => {
                    self.install_scheduled_dynamic_rule(&rule_id, delta);
                }
                RuleTransition::Remove => {
                    self.remove_dynamic_rule(&rule_id, delta);
                }
            }
        }
        for (rule_id, transition) in self.gy_dynamic_rules.pending_transitions(now) {
            match transition {
                RuleTransition::Install => {
                    self.install_scheduled_gy_dynamic_rule(&rule_id, delta);
                }
                RuleTransition::Remove => {
                    self.remove_gy_dynamic_rule(&rule_id, delta);
                }
            }
        }
    }

    // ---- Commit ----

    /// Fold a delta recorded against a working copy into this copy
    pub fn apply_delta(&mut self, delta: &SessionDelta) {
        if delta.is_fsm_updated {
            self.curr_state = delta.updated_fsm_state;
        }
        if let Some(pending_reports) = delta.updated_pending_reports {
            self.pending_reports = pending_reports;
        }
        self.request_number += delta.request_number_increment;
        if delta.is_session_level_key_updated {
            self.session_level_key = delta.updated_session_level_key.clone();
        }
        if let Some(tgpp_context) = &delta.updated_tgpp_context {
            self.tgpp_context = tgpp_context.clone();
        }
        if let Some(config) = &delta.updated_config {
            self.config = config.clone();
        }
        if delta.is_pending_event_triggers_updated {
            for (trigger, state) in &delta.pending_event_triggers {
                match state {
                    EventTriggerState::Cleared => {
                        self.pending_event_triggers.remove(trigger);
                    }
                    _ => {
                        self.pending_event_triggers.insert(*trigger, *state);
                    }
                }
            }
        }
        if let Some(revalidation_time) = delta.revalidation_time {
            self.revalidation_time = revalidation_time;
        }

        self.apply_rule_changes(delta);

        for (key, stored) in &delta.charging_credit_to_install {
            self.credit_map.insert(*key, ChargingGrant::unmarshal(stored));
        }
        for (key, credit_delta) in &delta.charging_credit_map {
            if let Some(grant) = self.credit_map.get_mut(key) {
                grant.merge_delta(credit_delta);
            }
        }

        for (mkey, stored) in &delta.monitor_credit_to_install {
            self.monitor_map.insert(mkey.clone(), Monitor::unmarshal(stored));
        }
        for (mkey, credit_delta) in &delta.monitor_credit_map {
            if let Some(monitor) = self.monitor_map.get_mut(mkey) {
                monitor.merge_delta(credit_delta);
            }
        }
        for mkey in &delta.monitor_credit_to_uninstall {
            self.monitor_map.remove(mkey);
        }
    }

    // Removals go first so a rule removed and re-added in one delta survives
    fn apply_rule_changes(&mut self, delta: &SessionDelta) {
        let lifetime_for = |rule_id: &str, existing: Option<RuleLifetime>| {
            delta
                .new_rule_lifetimes
                .get(rule_id)
                .copied()
                .or(existing)
                .unwrap_or_default()
        };

        for rule_id in &delta.static_rules_to_uninstall {
            self.static_rules.remove_rule(rule_id);
        }
        for rule_id in &delta.new_scheduled_static_rules {
            let lifetime = lifetime_for(rule_id.as_str(), None);
            self.static_rules.insert_rule(rule_id, lifetime, RuleState::Scheduled);
        }
        for rule_id in &delta.static_rules_to_install {
            let lifetime = lifetime_for(rule_id.as_str(), self.static_rules.get_lifetime(rule_id));
            self.static_rules.insert_rule(rule_id, lifetime, RuleState::Active);
        }

        for rule_id in &delta.dynamic_rules_to_uninstall {
            self.dynamic_rules.remove_rule(rule_id);
        }
        for rule in &delta.new_scheduled_dynamic_rules {
            let lifetime = lifetime_for(rule.id.as_str(), None);
            self.dynamic_rules.insert_rule(rule.clone(), lifetime, RuleState::Scheduled);
        }
        for rule in &delta.dynamic_rules_to_install {
            let lifetime = lifetime_for(rule.id.as_str(), self.dynamic_rules.get_lifetime(&rule.id));
            self.dynamic_rules.insert_rule(rule.clone(), lifetime, RuleState::Active);
        }

        for rule_id in &delta.gy_dynamic_rules_to_uninstall {
            self.gy_dynamic_rules.remove_rule(rule_id);
        }
        for rule in &delta.new_scheduled_gy_dynamic_rules {
            let lifetime = lifetime_for(rule.id.as_str(), None);
            self.gy_dynamic_rules.insert_rule(rule.clone(), lifetime, RuleState::Scheduled);
        }
        for rule in &delta.gy_dynamic_rules_to_install {
            let lifetime = lifetime_for(rule.id.as_str(), self.gy_dynamic_rules.get_lifetime(&rule.id));
            self.gy_dynamic_rules.insert_rule(rule.clone(), lifetime, RuleState::Active);
        }
    }
}
