//! Byte-level credit accounting
//!
//! A [`CreditBucket`] tracks what was granted, what the data plane consumed
//! and what has been reported upstream. It backs both charging grants (Gy)
//! and usage monitors (Gx).

use crate::bucket::{Bucket, Buckets};
use crate::delta::CreditDelta;
use crate::diameter;
use crate::stored::StoredSessionCredit;
use crate::types::{
    CreditLimitType, GrantTrackingType, GrantedUnits, ReceivedGrantedUnits, Usage,
};

/// Granted, used and reported bytes of one credit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreditBucket {
    buckets: Buckets,
    reporting: bool,
    limit_type: CreditLimitType,
    grant_tracking_type: GrantTrackingType,
    received_granted_units: ReceivedGrantedUnits,
}

impl CreditBucket {
    pub fn new(limit_type: CreditLimitType) -> Self {
        Self { limit_type, ..Default::default() }
    }

    pub fn unmarshal(marshaled: &StoredSessionCredit) -> Self {
        Self {
            buckets: marshaled.buckets,
            reporting: marshaled.reporting,
            limit_type: marshaled.credit_limit_type,
            grant_tracking_type: marshaled.grant_tracking_type,
            received_granted_units: marshaled.received_granted_units,
        }
    }

    pub fn marshal(&self) -> StoredSessionCredit {
        StoredSessionCredit {
            reporting: self.reporting,
            credit_limit_type: self.limit_type,
            buckets: self.buckets,
            grant_tracking_type: self.grant_tracking_type,
            received_granted_units: self.received_granted_units,
        }
    }

    /// Fresh delta seeded with the absolute fields of this credit
    pub fn get_delta(&self) -> CreditDelta {
        CreditDelta {
            reporting: self.reporting,
            reporting_credit: Usage {
                bytes_tx: self.buckets.reporting_tx,
                bytes_rx: self.buckets.reporting_rx,
            },
            grant_tracking_type: self.grant_tracking_type,
            received_granted_units: self.received_granted_units,
            ..Default::default()
        }
    }

    /// Fold a committed delta into this credit
    pub fn merge_delta(&mut self, delta: &CreditDelta) {
        self.buckets.merge(&delta.bucket_deltas);
        self.buckets.reporting_tx = delta.reporting_credit.bytes_tx;
        self.buckets.reporting_rx = delta.reporting_credit.bytes_rx;
        self.reporting = delta.reporting;
        self.grant_tracking_type = delta.grant_tracking_type;
        self.received_granted_units = delta.received_granted_units;
    }

    pub fn get_credit(&self, bucket: Bucket) -> u64 {
        self.buckets.get(bucket)
    }

    pub fn buckets(&self) -> &Buckets {
        &self.buckets
    }

    pub fn is_reporting(&self) -> bool {
        self.reporting
    }

    pub fn limit_type(&self) -> CreditLimitType {
        self.limit_type
    }

    pub fn is_infinite(&self) -> bool {
        self.limit_type == CreditLimitType::Infinite
    }

    pub fn grant_tracking_type(&self) -> GrantTrackingType {
        self.grant_tracking_type
    }

    pub fn received_granted_units(&self) -> ReceivedGrantedUnits {
        self.received_granted_units
    }

    pub fn set_grant_tracking_type(&mut self, tracking_type: GrantTrackingType, delta: &mut CreditDelta) {
        self.grant_tracking_type = tracking_type;
        delta.grant_tracking_type = tracking_type;
    }

    pub fn set_received_granted_units(&mut self, rgu: ReceivedGrantedUnits, delta: &mut CreditDelta) {
        self.received_granted_units = rgu;
        delta.received_granted_units = rgu;
    }

    /// Add bytes to a single counter
    pub fn add_credit(&mut self, amount: u64, bucket: Bucket, delta: &mut CreditDelta) {
        self.buckets.add(bucket, amount);
        match bucket {
            Bucket::ReportingTx => delta.reporting_credit.bytes_tx = self.buckets.reporting_tx,
            Bucket::ReportingRx => delta.reporting_credit.bytes_rx = self.buckets.reporting_rx,
            _ => delta.bucket_deltas.add(bucket, amount),
        }
    }

    /// Record bytes consumed by the data plane
    pub fn add_used_credit(&mut self, used_tx: u64, used_rx: u64, delta: &mut CreditDelta) {
        self.add_credit(used_tx, Bucket::UsedTx, delta);
        self.add_credit(used_rx, Bucket::UsedRx, delta);
        self.log_usage();
    }

    /// Apply a successful grant.
    ///
    /// Valid directions are added to the allowance, the in-flight report (if
    /// any) is acknowledged and the reporting flag cleared.
    pub fn receive_credit(&mut self, gsu: &GrantedUnits, delta: &mut CreditDelta) {
        let tracking_type = self.determine_grant_tracking_type(gsu);
        self.set_grant_tracking_type(tracking_type, delta);

        // Exhaustion is measured against the new grant only
        let mut rgu = self.received_granted_units;
        if gsu.total.is_nonzero() {
            rgu.total = self.buckets.allowed_total;
        }
        if gsu.tx.is_nonzero() {
            rgu.tx = self.buckets.allowed_tx;
        }
        if gsu.rx.is_nonzero() {
            rgu.rx = self.buckets.allowed_rx;
        }
        self.set_received_granted_units(rgu, delta);

        self.add_credit(gsu.total.valid_volume(), Bucket::AllowedTotal, delta);
        self.add_credit(gsu.tx.valid_volume(), Bucket::AllowedTx, delta);
        self.add_credit(gsu.rx.valid_volume(), Bucket::AllowedRx, delta);

        log::info!(
            "Received grant total={} tx={} rx={} tracking={}",
            gsu.total.valid_volume(),
            gsu.tx.valid_volume(),
            gsu.rx.valid_volume(),
            tracking_type.name()
        );

        // The grant acknowledges the report in flight
        let reporting_tx = self.buckets.reporting_tx;
        let reporting_rx = self.buckets.reporting_rx;
        self.add_credit(reporting_tx, Bucket::ReportedTx, delta);
        self.add_credit(reporting_rx, Bucket::ReportedRx, delta);
        self.reset_reporting_credit(delta);

        self.log_quota_and_usage();
    }

    fn determine_grant_tracking_type(&self, gsu: &GrantedUnits) -> GrantTrackingType {
        match (gsu.total.is_valid, gsu.tx.is_valid, gsu.rx.is_valid) {
            (true, _, _) => GrantTrackingType::TotalOnly,
            (false, true, true) => GrantTrackingType::TxAndRx,
            (false, true, false) => GrantTrackingType::TxOnly,
            (false, false, true) => GrantTrackingType::RxOnly,
            (false, false, false) => {
                log::warn!(
                    "Grant carries no valid unit, keeping tracking type {}",
                    self.grant_tracking_type.name()
                );
                self.grant_tracking_type
            }
        }
    }

    /// Whether the tracked directions have consumed their grant past
    /// `threshold` (a fraction in 0..=1). Infinite credit is never exhausted.
    pub fn is_quota_exhausted(&self, threshold: f32) -> bool {
        if self.is_infinite() {
            return false;
        }
        let b = &self.buckets;
        let rgu = &self.received_granted_units;
        let used_total = b.used_tx.saturating_add(b.used_rx);
        let tracking = self.grant_tracking_type;

        let total_exhausted = tracking.tracks_total()
            && compute_quota_exhausted(b.allowed_total, used_total, threshold, rgu.total);
        let tx_exhausted = tracking.tracks_tx()
            && compute_quota_exhausted(b.allowed_tx, b.used_tx, threshold, rgu.tx);
        let rx_exhausted = tracking.tracks_rx()
            && compute_quota_exhausted(b.allowed_rx, b.used_rx, threshold, rgu.rx);

        let exhausted = total_exhausted || tx_exhausted || rx_exhausted;
        if exhausted {
            log::debug!(
                "Quota exhausted at threshold {threshold}: total={total_exhausted} tx={tx_exhausted} rx={rx_exhausted}"
            );
        }
        exhausted
    }

    /// Used bytes not yet reported nor in flight, clamped at zero
    pub fn get_unreported_usage(&self) -> Usage {
        let b = &self.buckets;
        Usage {
            bytes_tx: b.used_tx.saturating_sub(b.reported_tx.saturating_add(b.reporting_tx)),
            bytes_rx: b.used_rx.saturating_sub(b.reported_rx.saturating_add(b.reporting_rx)),
        }
    }

    pub fn has_unreported_usage(&self) -> bool {
        let usage = self.get_unreported_usage();
        usage.bytes_tx > 0 || usage.bytes_rx > 0
    }

    /// Start a report: move unreported usage (clamped to the reportable
    /// grant) into REPORTING and flag the credit as reporting
    pub fn get_usage_for_reporting(&mut self, delta: &mut CreditDelta) -> Usage {
        let mut usage = self.get_unreported_usage();
        self.apply_reporting_limits(&mut usage);
        self.start_reporting(usage, delta);
        usage
    }

    /// Like [`get_usage_for_reporting`](Self::get_usage_for_reporting) but
    /// without grant limits, for the final report of a session
    pub fn get_all_unreported_usage_for_reporting(&mut self, delta: &mut CreditDelta) -> Usage {
        let usage = self.get_unreported_usage();
        self.start_reporting(usage, delta);
        usage
    }

    fn start_reporting(&mut self, usage: Usage, delta: &mut CreditDelta) {
        self.add_credit(usage.bytes_tx, Bucket::ReportingTx, delta);
        self.add_credit(usage.bytes_rx, Bucket::ReportingRx, delta);
        self.reporting = true;
        delta.reporting = true;
        log::debug!("Reporting usage tx={} rx={}", usage.bytes_tx, usage.bytes_rx);
    }

    /// Clamp a report to what remains reportable per tracked direction.
    /// Untracked directions are zeroed.
    fn apply_reporting_limits(&self, usage: &mut Usage) {
        let b = &self.buckets;
        let tracking = self.grant_tracking_type;

        if tracking.tracks_tx() {
            let tx_limit = b.allowed_tx.saturating_sub(b.reported_tx);
            usage.bytes_tx = usage.bytes_tx.min(tx_limit);
        }
        if tracking.tracks_rx() {
            let rx_limit = b.allowed_rx.saturating_sub(b.reported_rx);
            usage.bytes_rx = usage.bytes_rx.min(rx_limit);
        }

        match tracking {
            GrantTrackingType::TotalOnly | GrantTrackingType::AllTotalTxRx => {
                let total_limit = b
                    .allowed_total
                    .saturating_sub(b.reported_tx.saturating_add(b.reported_rx));
                usage.bytes_tx = usage.bytes_tx.min(total_limit);
                usage.bytes_rx = usage.bytes_rx.min(total_limit - usage.bytes_tx);
            }
            GrantTrackingType::TxOnly => usage.bytes_rx = 0,
            GrantTrackingType::RxOnly => usage.bytes_tx = 0,
            GrantTrackingType::TxAndRx => {}
        }
    }

    /// Handle a failed answer for the in-flight report.
    ///
    /// A transient failure means the server has accounted for the report, so
    /// REPORTING is folded into REPORTED. Reporting is reset either way.
    pub fn mark_failure(&mut self, result_code: u32, delta: &mut CreditDelta) {
        if diameter::is_transient_failure(result_code) {
            let reporting_tx = self.buckets.reporting_tx;
            let reporting_rx = self.buckets.reporting_rx;
            self.add_credit(reporting_tx, Bucket::ReportedTx, delta);
            self.add_credit(reporting_rx, Bucket::ReportedRx, delta);
        }
        self.reset_reporting_credit(delta);
    }

    pub fn reset_reporting_credit(&mut self, delta: &mut CreditDelta) {
        self.buckets.reporting_tx = 0;
        self.buckets.reporting_rx = 0;
        self.reporting = false;
        delta.reporting = false;
        delta.reporting_credit = Usage::default();
    }

    fn log_usage(&self) {
        log::debug!(
            "Used tx={} rx={}, unreported={:?}",
            self.buckets.used_tx,
            self.buckets.used_rx,
            self.get_unreported_usage()
        );
    }

    fn log_quota_and_usage(&self) {
        log::debug!("Credit {} reporting={}", self.buckets, self.reporting);
    }
}

/// Whether `used` bytes of `allowed` cross `threshold` of the latest grant,
/// where the latest grant is the allowance above `granted_baseline`
fn compute_quota_exhausted(allowed: u64, used: u64, threshold: f32, granted_baseline: u64) -> bool {
    if used >= allowed {
        return true;
    }
    let remaining = allowed - used;
    let current_granted = allowed.saturating_sub(granted_baseline);
    let threshold_percent = (threshold * 100.0).round().clamp(0.0, 100.0) as u64;
    let remaining_ratio = 100 - threshold_percent;
    let remaining_limit = (current_granted as u128 * remaining_ratio as u128 / 100) as u64;
    remaining <= remaining_limit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CreditUnit;

    fn granted(total: u64) -> CreditBucket {
        let mut credit = CreditBucket::new(CreditLimitType::Finite);
        let mut delta = credit.get_delta();
        credit.receive_credit(&GrantedUnits::total(total), &mut delta);
        credit
    }

    #[test]
    fn test_receive_credit_sets_allowance() {
        let mut credit = CreditBucket::new(CreditLimitType::Finite);
        let mut delta = credit.get_delta();
        credit.receive_credit(&GrantedUnits::all(1000, 500, 500), &mut delta);

        assert_eq!(credit.get_credit(Bucket::AllowedTotal), 1000);
        assert_eq!(credit.get_credit(Bucket::AllowedTx), 500);
        assert_eq!(credit.get_credit(Bucket::AllowedRx), 500);
        assert_eq!(credit.grant_tracking_type(), GrantTrackingType::TotalOnly);
        assert_eq!(delta.bucket_deltas.allowed_total, 1000);
        assert_eq!(delta.bucket_deltas.allowed_tx, 500);
        assert_eq!(delta.grant_tracking_type, GrantTrackingType::TotalOnly);
    }

    #[test]
    fn test_tracking_type_from_units() {
        let mut credit = CreditBucket::new(CreditLimitType::Finite);
        let mut delta = credit.get_delta();

        credit.receive_credit(&GrantedUnits::tx_rx(10, 10), &mut delta);
        assert_eq!(credit.grant_tracking_type(), GrantTrackingType::TxAndRx);

        let rx_only = GrantedUnits { rx: CreditUnit::valid(5), ..Default::default() };
        credit.receive_credit(&rx_only, &mut delta);
        assert_eq!(credit.grant_tracking_type(), GrantTrackingType::RxOnly);

        // No valid unit keeps the previous type
        credit.receive_credit(&GrantedUnits::default(), &mut delta);
        assert_eq!(credit.grant_tracking_type(), GrantTrackingType::RxOnly);
    }

    #[test]
    fn test_add_used_credit() {
        let mut credit = granted(1000);
        let mut delta = credit.get_delta();
        credit.add_used_credit(100, 200, &mut delta);
        assert_eq!(credit.get_credit(Bucket::UsedTx), 100);
        assert_eq!(credit.get_credit(Bucket::UsedRx), 200);
        assert_eq!(delta.bucket_deltas.used_tx, 100);
        assert_eq!(delta.bucket_deltas.used_rx, 200);
    }

    #[test]
    fn test_quota_exhausted_at_threshold() {
        let mut credit = granted(1000);
        let mut delta = credit.get_delta();

        credit.add_used_credit(300, 400, &mut delta);
        assert!(!credit.is_quota_exhausted(0.8));

        credit.add_used_credit(50, 50, &mut delta);
        assert!(credit.is_quota_exhausted(0.8));
        assert!(!credit.is_quota_exhausted(1.0));

        credit.add_used_credit(200, 0, &mut delta);
        assert!(credit.is_quota_exhausted(1.0));
    }

    #[test]
    fn test_exhaustion_measured_against_latest_grant() {
        let mut credit = granted(1000);
        let mut delta = credit.get_delta();
        credit.add_used_credit(900, 0, &mut delta);
        assert!(credit.is_quota_exhausted(0.8));

        // 100 left of 1000, plus a 1000 grant: 1100 remaining of the new 1000
        credit.receive_credit(&GrantedUnits::total(1000), &mut delta);
        assert!(!credit.is_quota_exhausted(0.8));
        credit.add_used_credit(800, 0, &mut delta);
        // 300 remaining, limit is 20% of 1000
        assert!(!credit.is_quota_exhausted(0.8));
        credit.add_used_credit(100, 0, &mut delta);
        assert!(credit.is_quota_exhausted(0.8));
    }

    #[test]
    fn test_infinite_credit_never_exhausted() {
        let mut credit = CreditBucket::new(CreditLimitType::Infinite);
        let mut delta = credit.get_delta();
        credit.add_used_credit(1 << 40, 1 << 40, &mut delta);
        assert!(!credit.is_quota_exhausted(0.0));
        assert!(!credit.is_quota_exhausted(1.0));
    }

    #[test]
    fn test_tx_and_rx_exhaustion_is_per_direction() {
        let mut credit = CreditBucket::new(CreditLimitType::Finite);
        let mut delta = credit.get_delta();
        credit.receive_credit(&GrantedUnits::tx_rx(100, 1000), &mut delta);
        credit.add_used_credit(0, 500, &mut delta);
        assert!(!credit.is_quota_exhausted(1.0));
        credit.add_used_credit(100, 0, &mut delta);
        assert!(credit.is_quota_exhausted(1.0));
    }

    #[test]
    fn test_reporting_cycle() {
        let mut credit = granted(1000);
        let mut delta = credit.get_delta();
        credit.add_used_credit(300, 200, &mut delta);

        let usage = credit.get_usage_for_reporting(&mut delta);
        assert_eq!(usage, Usage { bytes_tx: 300, bytes_rx: 200 });
        assert!(credit.is_reporting());
        assert!(delta.reporting);
        assert_eq!(credit.get_credit(Bucket::ReportingTx), 300);
        assert_eq!(delta.bucket_deltas.reporting_tx, 0);
        assert_eq!(delta.reporting_credit, Usage { bytes_tx: 300, bytes_rx: 200 });

        // Nothing new to report while in flight
        assert_eq!(credit.get_unreported_usage(), Usage::default());

        credit.receive_credit(&GrantedUnits::total(1000), &mut delta);
        assert!(!credit.is_reporting());
        assert_eq!(credit.get_credit(Bucket::ReportedTx), 300);
        assert_eq!(credit.get_credit(Bucket::ReportedRx), 200);
        assert_eq!(credit.get_credit(Bucket::ReportingTx), 0);
        assert_eq!(delta.reporting_credit, Usage::default());
        assert_eq!(delta.bucket_deltas.reported_tx, 300);
        assert_eq!(delta.bucket_deltas.reported_rx, 200);
    }

    #[test]
    fn test_reporting_limited_by_total_grant() {
        let mut credit = granted(1000);
        let mut delta = credit.get_delta();
        credit.add_used_credit(700, 600, &mut delta);

        let usage = credit.get_usage_for_reporting(&mut delta);
        assert_eq!(usage.bytes_tx, 700);
        assert_eq!(usage.bytes_rx, 300);
    }

    #[test]
    fn test_reporting_limits_per_direction() {
        let mut credit = CreditBucket::new(CreditLimitType::Finite);
        let mut delta = credit.get_delta();
        credit.receive_credit(&GrantedUnits::tx_rx(100, 50), &mut delta);
        credit.add_used_credit(150, 80, &mut delta);

        let usage = credit.get_usage_for_reporting(&mut delta);
        assert_eq!(usage, Usage { bytes_tx: 100, bytes_rx: 50 });
    }

    #[test]
    fn test_untracked_direction_zeroed() {
        let mut credit = CreditBucket::new(CreditLimitType::Finite);
        let mut delta = credit.get_delta();
        let tx_only = GrantedUnits { tx: CreditUnit::valid(100), ..Default::default() };
        credit.receive_credit(&tx_only, &mut delta);
        credit.add_used_credit(10, 20, &mut delta);

        let usage = credit.get_usage_for_reporting(&mut delta);
        assert_eq!(usage, Usage { bytes_tx: 10, bytes_rx: 0 });
    }

    #[test]
    fn test_terminal_report_is_unclamped() {
        let mut credit = granted(100);
        let mut delta = credit.get_delta();
        credit.add_used_credit(500, 500, &mut delta);
        let usage = credit.get_all_unreported_usage_for_reporting(&mut delta);
        assert_eq!(usage, Usage { bytes_tx: 500, bytes_rx: 500 });
    }

    #[test]
    fn test_transient_failure_keeps_report() {
        let mut credit = granted(1000);
        let mut delta = credit.get_delta();
        credit.add_used_credit(100, 100, &mut delta);
        credit.get_usage_for_reporting(&mut delta);

        credit.mark_failure(4012, &mut delta);
        assert!(!credit.is_reporting());
        assert_eq!(credit.get_credit(Bucket::ReportedTx), 100);
        assert_eq!(delta.bucket_deltas.reported_rx, 100);
        assert_eq!(credit.get_unreported_usage(), Usage::default());
    }

    #[test]
    fn test_permanent_failure_discards_report() {
        let mut credit = granted(1000);
        let mut delta = credit.get_delta();
        credit.add_used_credit(100, 100, &mut delta);
        credit.get_usage_for_reporting(&mut delta);

        credit.mark_failure(5030, &mut delta);
        assert!(!credit.is_reporting());
        assert_eq!(credit.get_credit(Bucket::ReportedTx), 0);
        assert_eq!(credit.get_unreported_usage(), Usage { bytes_tx: 100, bytes_rx: 100 });
    }

    #[test]
    fn test_merge_delta_matches_working_copy() {
        let stored = granted(1000);
        let mut working = stored.clone();
        let mut delta = working.get_delta();
        working.add_used_credit(10, 20, &mut delta);
        working.receive_credit(&GrantedUnits::tx_rx(5, 5), &mut delta);

        let mut committed = stored;
        committed.merge_delta(&delta);
        assert_eq!(committed, working);
    }

    #[test]
    fn test_marshal_unmarshal() {
        let mut credit = granted(1000);
        let mut delta = credit.get_delta();
        credit.add_used_credit(10, 20, &mut delta);
        credit.get_usage_for_reporting(&mut delta);
        assert_eq!(CreditBucket::unmarshal(&credit.marshal()), credit);
    }

    #[test]
    fn test_compute_quota_exhausted() {
        assert!(compute_quota_exhausted(0, 0, 0.8, 0));
        assert!(compute_quota_exhausted(100, 100, 0.8, 0));
        assert!(compute_quota_exhausted(100, 80, 0.8, 0));
        assert!(!compute_quota_exhausted(100, 79, 0.8, 0));
        assert!(!compute_quota_exhausted(100, 99, 1.0, 0));
        assert!(compute_quota_exhausted(100, 1, 0.0, 0));
    }
}
