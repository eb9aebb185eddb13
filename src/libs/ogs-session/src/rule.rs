//! Policy rules, their activation windows and per-session rule sets

use crate::stored::{StoredRule, StoredStaticRule};
use crate::types::{CreditKey, RedirectServer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Which reporting paths a rule's traffic feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingType {
    OnlyOcs,
    OnlyPcrf,
    OcsAndPcrf,
    NoTracking,
}

/// PCC rule as installed on the data plane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyRule {
    pub id: String,
    pub priority: u32,
    /// Charged against Gy when non-zero
    pub rating_group: u32,
    pub service_identifier: Option<u32>,
    /// Monitored over Gx when non-empty
    pub monitoring_key: String,
    pub redirect: Option<RedirectServer>,
}

impl PolicyRule {
    pub fn new(id: &str, rating_group: u32, monitoring_key: &str) -> Self {
        Self {
            id: id.to_string(),
            rating_group,
            monitoring_key: monitoring_key.to_string(),
            ..Default::default()
        }
    }

    pub fn tracking_type(&self) -> TrackingType {
        match (self.rating_group > 0, !self.monitoring_key.is_empty()) {
            (true, true) => TrackingType::OcsAndPcrf,
            (true, false) => TrackingType::OnlyOcs,
            (false, true) => TrackingType::OnlyPcrf,
            (false, false) => TrackingType::NoTracking,
        }
    }

    pub fn charging_key(&self) -> Option<CreditKey> {
        match self.tracking_type() {
            TrackingType::OnlyOcs | TrackingType::OcsAndPcrf => Some(CreditKey {
                rating_group: self.rating_group,
                service_identifier: self.service_identifier,
            }),
            _ => None,
        }
    }

    pub fn monitoring_key(&self) -> Option<&str> {
        match self.tracking_type() {
            TrackingType::OnlyPcrf | TrackingType::OcsAndPcrf => Some(&self.monitoring_key),
            _ => None,
        }
    }
}

/// Activation window in epoch seconds; 0 on either side means unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleLifetime {
    pub activation_time: i64,
    pub deactivation_time: i64,
}

impl RuleLifetime {
    pub fn new(activation_time: i64, deactivation_time: i64) -> Self {
        Self { activation_time, deactivation_time }
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.deactivation_time > 0 && self.deactivation_time <= now
    }

    pub fn should_be_active_at(&self, now: i64) -> bool {
        self.activation_time <= now && !self.is_expired_at(now)
    }

    /// What a rule in `state` must undergo at `now`
    pub fn transition_at(&self, state: RuleState, now: i64) -> Option<RuleTransition> {
        if self.is_expired_at(now) {
            return Some(RuleTransition::Remove);
        }
        if state == RuleState::Scheduled && self.should_be_active_at(now) {
            return Some(RuleTransition::Install);
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleState {
    Scheduled,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTransition {
    Install,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEntry {
    pub rule: PolicyRule,
    pub lifetime: RuleLifetime,
    pub state: RuleState,
}

/// Dynamic rules of one session, keyed by rule id.
///
/// Holds both scheduled and active rules. Key lookups only see active ones.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    entries: BTreeMap<String, RuleEntry>,
    rules_by_monitoring_key: HashMap<String, BTreeSet<String>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unmarshal(marshaled: &[StoredRule]) -> Self {
        let mut rules = Self::new();
        for stored in marshaled {
            rules.insert_rule(stored.rule.clone(), stored.lifetime, stored.state);
        }
        rules
    }

    pub fn marshal(&self) -> Vec<StoredRule> {
        self.entries
            .values()
            .map(|e| StoredRule { rule: e.rule.clone(), lifetime: e.lifetime, state: e.state })
            .collect()
    }

    /// Insert or replace a rule
    pub fn insert_rule(&mut self, rule: PolicyRule, lifetime: RuleLifetime, state: RuleState) {
        let rule_id = rule.id.clone();
        self.remove_rule(&rule_id);
        if let Some(mkey) = rule.monitoring_key() {
            self.rules_by_monitoring_key
                .entry(mkey.to_string())
                .or_default()
                .insert(rule_id.clone());
        }
        self.entries.insert(rule_id, RuleEntry { rule, lifetime, state });
    }

    pub fn remove_rule(&mut self, rule_id: &str) -> Option<RuleEntry> {
        let entry = self.entries.remove(rule_id)?;
        if let Some(mkey) = entry.rule.monitoring_key() {
            if let Some(ids) = self.rules_by_monitoring_key.get_mut(mkey) {
                ids.remove(rule_id);
                if ids.is_empty() {
                    self.rules_by_monitoring_key.remove(mkey);
                }
            }
        }
        Some(entry)
    }

    /// Move a scheduled rule to active
    pub fn activate_rule(&mut self, rule_id: &str) -> Option<&PolicyRule> {
        let entry = self.entries.get_mut(rule_id)?;
        if entry.state != RuleState::Scheduled {
            return None;
        }
        entry.state = RuleState::Active;
        Some(&entry.rule)
    }

    pub fn get_entry(&self, rule_id: &str) -> Option<&RuleEntry> {
        self.entries.get(rule_id)
    }

    /// Active rule by id
    pub fn get_rule(&self, rule_id: &str) -> Option<&PolicyRule> {
        self.entries
            .get(rule_id)
            .filter(|e| e.state == RuleState::Active)
            .map(|e| &e.rule)
    }

    pub fn get_lifetime(&self, rule_id: &str) -> Option<RuleLifetime> {
        self.entries.get(rule_id).map(|e| e.lifetime)
    }

    pub fn is_installed(&self, rule_id: &str) -> bool {
        self.get_rule(rule_id).is_some()
    }

    pub fn is_scheduled(&self, rule_id: &str) -> bool {
        self.entries
            .get(rule_id)
            .is_some_and(|e| e.state == RuleState::Scheduled)
    }

    pub fn get_charging_key_for_rule_id(&self, rule_id: &str) -> Option<CreditKey> {
        self.get_rule(rule_id)?.charging_key()
    }

    pub fn get_monitoring_key_for_rule_id(&self, rule_id: &str) -> Option<String> {
        self.get_rule(rule_id)?.monitoring_key().map(str::to_string)
    }

    pub fn get_rule_ids(&self) -> Vec<String> {
        self.active().map(|e| e.rule.id.clone()).collect()
    }

    pub fn get_scheduled_rule_ids(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.state == RuleState::Scheduled)
            .map(|e| e.rule.id.clone())
            .collect()
    }

    pub fn get_rules(&self) -> Vec<PolicyRule> {
        self.active().map(|e| e.rule.clone()).collect()
    }

    pub fn get_rule_ids_for_monitoring_key(&self, monitoring_key: &str) -> Vec<String> {
        self.rules_by_monitoring_key
            .get(monitoring_key)
            .map(|ids| ids.iter().filter(|id| self.is_installed(id)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_rule_definitions_for_charging_key(&self, key: &CreditKey) -> Vec<PolicyRule> {
        self.active()
            .filter(|e| e.rule.charging_key().as_ref() == Some(key))
            .map(|e| e.rule.clone())
            .collect()
    }

    /// Active rules that feed a monitoring key
    pub fn monitored_rules_count(&self) -> usize {
        self.active().filter(|e| e.rule.monitoring_key().is_some()).count()
    }

    /// Rules due for install or removal at `now`
    pub fn pending_transitions(&self, now: i64) -> Vec<(String, RuleTransition)> {
        self.entries
            .iter()
            .filter_map(|(id, e)| e.lifetime.transition_at(e.state, now).map(|t| (id.clone(), t)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn active(&self) -> impl Iterator<Item = &RuleEntry> {
        self.entries.values().filter(|e| e.state == RuleState::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticRuleEntry {
    pub lifetime: RuleLifetime,
    pub state: RuleState,
}

/// Static rules referenced by one session. Definitions live in the shared
/// [`StaticRuleStore`].
#[derive(Debug, Clone, Default)]
pub struct StaticRuleSet {
    entries: BTreeMap<String, StaticRuleEntry>,
}

impl StaticRuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unmarshal(marshaled: &[StoredStaticRule]) -> Self {
        let mut rules = Self::new();
        for stored in marshaled {
            rules.insert_rule(&stored.rule_id, stored.lifetime, stored.state);
        }
        rules
    }

    pub fn marshal(&self) -> Vec<StoredStaticRule> {
        self.entries
            .iter()
            .map(|(id, e)| StoredStaticRule { rule_id: id.clone(), lifetime: e.lifetime, state: e.state })
            .collect()
    }

    pub fn insert_rule(&mut self, rule_id: &str, lifetime: RuleLifetime, state: RuleState) {
        self.entries.insert(rule_id.to_string(), StaticRuleEntry { lifetime, state });
    }

    pub fn remove_rule(&mut self, rule_id: &str) -> Option<StaticRuleEntry> {
        self.entries.remove(rule_id)
    }

    pub fn activate_rule(&mut self, rule_id: &str) -> bool {
        match self.entries.get_mut(rule_id) {
            Some(e) if e.state == RuleState::Scheduled => {
                e.state = RuleState::Active;
                true
            }
            _ => false,
        }
    }

    pub fn get_lifetime(&self, rule_id: &str) -> Option<RuleLifetime> {
        self.entries.get(rule_id).map(|e| e.lifetime)
    }

    pub fn is_installed(&self, rule_id: &str) -> bool {
        self.entries.get(rule_id).is_some_and(|e| e.state == RuleState::Active)
    }

    pub fn is_scheduled(&self, rule_id: &str) -> bool {
        self.entries.get(rule_id).is_some_and(|e| e.state == RuleState::Scheduled)
    }

    pub fn get_rule_ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.state == RuleState::Active)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn get_scheduled_rule_ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.state == RuleState::Scheduled)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn pending_transitions(&self, now: i64) -> Vec<(String, RuleTransition)> {
        self.entries
            .iter()
            .filter_map(|(id, e)| e.lifetime.transition_at(e.state, now).map(|t| (id.clone(), t)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Static rule definitions shared by all sessions
#[derive(Debug, Default)]
pub struct StaticRuleStore {
    rules: RwLock<BTreeMap<String, PolicyRule>>,
}

impl StaticRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Option<RwLockReadGuard<'_, BTreeMap<String, PolicyRule>>> {
        match self.rules.read() {
            Ok(rules) => Some(rules),
            Err(e) => {
                log::error!("Static rule store lock poisoned: {e}");
                None
            }
        }
    }

    fn write(&self) -> Option<RwLockWriteGuard<'_, BTreeMap<String, PolicyRule>>> {
        match self.rules.write() {
            Ok(rules) => Some(rules),
            Err(e) => {
                log::error!("Static rule store lock poisoned: {e}");
                None
            }
        }
    }

    pub fn insert_rule(&self, rule: PolicyRule) {
        match self.write() {
            Some(mut rules) => {
                log::debug!("Static rule added: {}", rule.id);
                rules.insert(rule.id.clone(), rule);
            }
            None => log::error!("Static rule {} dropped", rule.id),
        }
    }

    pub fn remove_rule(&self, rule_id: &str) -> Option<PolicyRule> {
        self.write()?.remove(rule_id)
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<PolicyRule> {
        self.read()?.get(rule_id).cloned()
    }

    pub fn get_charging_key_for_rule_id(&self, rule_id: &str) -> Option<CreditKey> {
        self.read()?.get(rule_id)?.charging_key()
    }

    pub fn get_monitoring_key_for_rule_id(&self, rule_id: &str) -> Option<String> {
        let rules = self.read()?;
        rules.get(rule_id)?.monitoring_key().map(str::to_string)
    }

    pub fn get_rule_ids_for_charging_key(&self, key: &CreditKey) -> Vec<String> {
        self.read()
            .map(|rules| {
                rules
                    .values()
                    .filter(|r| r.charging_key().as_ref() == Some(key))
                    .map(|r| r.id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn rule_count(&self) -> usize {
        self.read().map(|r| r.len()).unwrap_or(0)
    }
}
