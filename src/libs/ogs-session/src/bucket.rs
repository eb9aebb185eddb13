//! Usage and allowance counters kept per credit

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the nine byte counters of a credit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Bucket {
    UsedTx,
    UsedRx,
    AllowedTotal,
    AllowedTx,
    AllowedRx,
    ReportingTx,
    ReportingRx,
    ReportedTx,
    ReportedRx,
}

impl Bucket {
    pub const ALL: [Bucket; 9] = [
        Bucket::UsedTx,
        Bucket::UsedRx,
        Bucket::AllowedTotal,
        Bucket::AllowedTx,
        Bucket::AllowedRx,
        Bucket::ReportingTx,
        Bucket::ReportingRx,
        Bucket::ReportedTx,
        Bucket::ReportedRx,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Bucket::UsedTx => "USED_TX",
            Bucket::UsedRx => "USED_RX",
            Bucket::AllowedTotal => "ALLOWED_TOTAL",
            Bucket::AllowedTx => "ALLOWED_TX",
            Bucket::AllowedRx => "ALLOWED_RX",
            Bucket::ReportingTx => "REPORTING_TX",
            Bucket::ReportingRx => "REPORTING_RX",
            Bucket::ReportedTx => "REPORTED_TX",
            Bucket::ReportedRx => "REPORTED_RX",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Counter set of a credit, all in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Buckets {
    pub used_tx: u64,
    pub used_rx: u64,
    pub allowed_total: u64,
    pub allowed_tx: u64,
    pub allowed_rx: u64,
    pub reporting_tx: u64,
    pub reporting_rx: u64,
    pub reported_tx: u64,
    pub reported_rx: u64,
}

impl Buckets {
    pub fn get(&self, bucket: Bucket) -> u64 {
        match bucket {
            Bucket::UsedTx => self.used_tx,
            Bucket::UsedRx => self.used_rx,
            Bucket::AllowedTotal => self.allowed_total,
            Bucket::AllowedTx => self.allowed_tx,
            Bucket::AllowedRx => self.allowed_rx,
            Bucket::ReportingTx => self.reporting_tx,
            Bucket::ReportingRx => self.reporting_rx,
            Bucket::ReportedTx => self.reported_tx,
            Bucket::ReportedRx => self.reported_rx,
        }
    }

    pub fn get_mut(&mut self, bucket: Bucket) -> &mut u64 {
        match bucket {
            Bucket::UsedTx => &mut self.used_tx,
            Bucket::UsedRx => &mut self.used_rx,
            Bucket::AllowedTotal => &mut self.allowed_total,
            Bucket::AllowedTx => &mut self.allowed_tx,
            Bucket::AllowedRx => &mut self.allowed_rx,
            Bucket::ReportingTx => &mut self.reporting_tx,
            Bucket::ReportingRx => &mut self.reporting_rx,
            Bucket::ReportedTx => &mut self.reported_tx,
            Bucket::ReportedRx => &mut self.reported_rx,
        }
    }

    /// Saturating add into one counter
    pub fn add(&mut self, bucket: Bucket, amount: u64) {
        let counter = self.get_mut(bucket);
        *counter = counter.saturating_add(amount);
    }

    /// Add every counter of `other` into `self`
    pub fn merge(&mut self, other: &Buckets) {
        for bucket in Bucket::ALL {
            self.add(bucket, other.get(bucket));
        }
    }

    pub fn is_empty(&self) -> bool {
        Bucket::ALL.iter().all(|b| self.get(*b) == 0)
    }
}

impl fmt::Display for Buckets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "used(tx={} rx={}) allowed(total={} tx={} rx={}) reporting(tx={} rx={}) reported(tx={} rx={})",
            self.used_tx,
            self.used_rx,
            self.allowed_total,
            self.allowed_tx,
            self.allowed_rx,
            self.reporting_tx,
            self.reporting_rx,
            self.reported_tx,
            self.reported_rx
        )
    }
}
