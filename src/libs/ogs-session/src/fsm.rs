//! Session lifecycle state machine
//!
//! ```text
//! ACTIVE ──schedule──▶ TERMINATION_SCHEDULED
//!   │                        │
//!   └──────start─────────────┴──▶ TERMINATING_FLOW_ACTIVE ◀──usage──┐
//!                                   │         │ new report         │
//!                   reports flushed │         ▼                    │
//!                                   │  TERMINATING_AGGREGATING_STATS─┘
//!                                   │         │ reports flushed
//!                                   ▼         ▼
//!                      TERMINATING_FLOW_DELETED ──complete──▶ TERMINATED
//! ```
//!
//! Every terminating state may also complete directly. Whether it is safe
//! to do so is decided by the owner of the report counter.

use serde::{Deserialize, Serialize};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionFsmState {
    /// Normal operation
    #[default]
    Active,
    /// Termination started, data-plane flows still present
    TerminatingFlowActive,
    /// Waiting for outstanding data-plane reports
    TerminatingAggregatingStats,
    /// All flows removed and reports flushed
    TerminatingFlowDeleted,
    /// Final report built, session is done
    Terminated,
    /// Termination requested but not yet started
    TerminationScheduled,
}

impl SessionFsmState {
    /// Get state name as string
    pub fn name(&self) -> &'static str {
        match self {
            SessionFsmState::Active => "SESSION_ACTIVE",
            SessionFsmState::TerminatingFlowActive => "SESSION_TERMINATING_FLOW_ACTIVE",
            SessionFsmState::TerminatingAggregatingStats => "SESSION_TERMINATING_AGGREGATING_STATS",
            SessionFsmState::TerminatingFlowDeleted => "SESSION_TERMINATING_FLOW_DELETED",
            SessionFsmState::Terminated => "SESSION_TERMINATED",
            SessionFsmState::TerminationScheduled => "SESSION_TERMINATION_SCHEDULED",
        }
    }

    /// Past ACTIVE but not yet TERMINATED
    pub fn is_terminating(&self) -> bool {
        matches!(
            self,
            SessionFsmState::TerminatingFlowActive
                | SessionFsmState::TerminatingAggregatingStats
                | SessionFsmState::TerminatingFlowDeleted
                | SessionFsmState::TerminationScheduled
        )
    }

    /// Target state for `event`, or `None` if the event does not move the
    /// session out of this state
    pub fn on_event(&self, event: SessionFsmEvent) -> Option<SessionFsmState> {
        use SessionFsmEvent as E;
        use SessionFsmState as S;

        match (self, event) {
            (S::Active, E::ScheduleTermination) => Some(S::TerminationScheduled),
            (S::Active | S::TerminationScheduled, E::StartTermination) => {
                Some(S::TerminatingFlowActive)
            }
            (S::TerminatingFlowActive, E::NewReport) => Some(S::TerminatingAggregatingStats),
            (S::TerminatingAggregatingStats, E::UsageReceived) => Some(S::TerminatingFlowActive),
            (S::TerminatingFlowActive | S::TerminatingAggregatingStats, E::ReportsFlushed) => {
                Some(S::TerminatingFlowDeleted)
            }
            (
                S::TerminationScheduled
                | S::TerminatingFlowActive
                | S::TerminatingAggregatingStats
                | S::TerminatingFlowDeleted,
                E::CompleteTermination,
            ) => Some(S::Terminated),
            _ => None,
        }
    }
}

/// Lifecycle events fed to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFsmEvent {
    ScheduleTermination,
    StartTermination,
    /// Data-plane report requested
    NewReport,
    /// Last outstanding data-plane report arrived
    ReportsFlushed,
    /// Rule usage arrived while aggregating
    UsageReceived,
    CompleteTermination,
}

impl SessionFsmEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionFsmEvent::ScheduleTermination => "SCHEDULE_TERMINATION",
            SessionFsmEvent::StartTermination => "START_TERMINATION",
            SessionFsmEvent::NewReport => "NEW_REPORT",
            SessionFsmEvent::ReportsFlushed => "REPORTS_FLUSHED",
            SessionFsmEvent::UsageReceived => "USAGE_RECEIVED",
            SessionFsmEvent::CompleteTermination => "COMPLETE_TERMINATION",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_name() {
        assert_eq!(SessionFsmState::Active.name(), "SESSION_ACTIVE");
        assert_eq!(SessionFsmState::Terminated.name(), "SESSION_TERMINATED");
    }

    #[test]
    fn test_termination_path() {
        let mut state = SessionFsmState::Active;
        for event in [
            SessionFsmEvent::StartTermination,
            SessionFsmEvent::NewReport,
            SessionFsmEvent::UsageReceived,
            SessionFsmEvent::NewReport,
            SessionFsmEvent::ReportsFlushed,
            SessionFsmEvent::CompleteTermination,
        ] {
            state = state.on_event(event).unwrap();
        }
        assert_eq!(state, SessionFsmState::Terminated);
    }

    #[test]
    fn test_scheduled_termination() {
        let state = SessionFsmState::Active
            .on_event(SessionFsmEvent::ScheduleTermination)
            .unwrap();
        assert_eq!(state, SessionFsmState::TerminationScheduled);
        assert!(state.is_terminating());
        assert_eq!(
            state.on_event(SessionFsmEvent::StartTermination),
            Some(SessionFsmState::TerminatingFlowActive)
        );
    }

    #[test]
    fn test_active_cannot_complete() {
        assert_eq!(SessionFsmState::Active.on_event(SessionFsmEvent::CompleteTermination), None);
        assert!(!SessionFsmState::Active.is_terminating());
    }

    #[test]
    fn test_ignored_events() {
        assert_eq!(SessionFsmState::Active.on_event(SessionFsmEvent::NewReport), None);
        assert_eq!(
            SessionFsmState::TerminatingFlowDeleted.on_event(SessionFsmEvent::NewReport),
            None
        );
        assert_eq!(
            SessionFsmState::TerminatingFlowDeleted.on_event(SessionFsmEvent::StartTermination),
            None
        );
        assert_eq!(
            SessionFsmState::TerminationScheduled.on_event(SessionFsmEvent::ReportsFlushed),
            None
        );
    }

    #[test]
    fn test_reports_flushed_after_usage() {
        // The last report round answered before the flush arrived
        let mut state = SessionFsmState::Active;
        for event in [
            SessionFsmEvent::StartTermination,
            SessionFsmEvent::NewReport,
            SessionFsmEvent::UsageReceived,
        ] {
            state = state.on_event(event).unwrap();
        }
        assert_eq!(state, SessionFsmState::TerminatingFlowActive);
        assert_eq!(
            state.on_event(SessionFsmEvent::ReportsFlushed),
            Some(SessionFsmState::TerminatingFlowDeleted)
        );
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        fn event_strategy() -> impl Strategy<Value = SessionFsmEvent> {
            prop_oneof![
                Just(SessionFsmEvent::ScheduleTermination),
                Just(SessionFsmEvent::StartTermination),
                Just(SessionFsmEvent::NewReport),
                Just(SessionFsmEvent::ReportsFlushed),
                Just(SessionFsmEvent::UsageReceived),
                Just(SessionFsmEvent::CompleteTermination),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(100))]

            /// Property 1: TERMINATED is absorbing
            #[test]
            fn prop_terminated_is_absorbing(events in prop::collection::vec(event_strategy(), 0..20)) {
                let mut state = SessionFsmState::Terminated;
                for event in events {
                    if let Some(next) = state.on_event(event) {
                        state = next;
                    }
                }
                prop_assert_eq!(state, SessionFsmState::Terminated);
            }

            /// Property 2: a terminating session never returns to ACTIVE
            #[test]
            fn prop_never_back_to_active(events in prop::collection::vec(event_strategy(), 1..30)) {
                let mut state = SessionFsmState::Active;
                let mut left_active = false;
                for event in events {
                    if let Some(next) = state.on_event(event) {
                        state = next;
                    }
                    if state != SessionFsmState::Active {
                        left_active = true;
                    }
                    if left_active {
                        prop_assert_ne!(state, SessionFsmState::Active);
                    }
                }
            }
        }
    }
}
