//! Gx usage monitors

use crate::credit::CreditBucket;
use crate::delta::CreditDelta;
use crate::stored::StoredMonitor;
use crate::types::{CreditLimitType, MonitoringLevel};

/// Credit tracked for one monitoring key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Monitor {
    pub credit: CreditBucket,
    pub level: MonitoringLevel,
}

impl Monitor {
    pub fn new(level: MonitoringLevel) -> Self {
        Self { credit: CreditBucket::new(CreditLimitType::Finite), level }
    }

    pub fn unmarshal(marshaled: &StoredMonitor) -> Self {
        Self { credit: CreditBucket::unmarshal(&marshaled.credit), level: marshaled.level }
    }

    pub fn marshal(&self) -> StoredMonitor {
        StoredMonitor { credit: self.credit.marshal(), level: self.level }
    }

    pub fn get_delta(&self) -> CreditDelta {
        self.credit.get_delta()
    }

    pub fn merge_delta(&mut self, delta: &CreditDelta) {
        self.credit.merge_delta(delta);
    }
}
