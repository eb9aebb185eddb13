//! NextGCore Session Credit Library
//!
//! Per-subscriber credit and policy state for a session-management gateway:
//! Gy charging grants, Gx usage monitors, policy-rule lifecycles and the
//! termination FSM. All operations are synchronous and in-memory; changes are
//! mirrored into a [`SessionDelta`] that the owner commits or discards.

pub mod bucket;
pub mod config;
pub mod credit;
pub mod delta;
pub mod diameter;
pub mod error;
pub mod fsm;
pub mod grant;
pub mod monitor;
pub mod request;
pub mod rule;
pub mod state;
pub mod stored;
pub mod types;

#[cfg(test)]
mod property_tests;

// Re-export commonly used types
pub use bucket::{Bucket, Buckets};
pub use config::SessiondConf;
pub use credit::CreditBucket;
pub use delta::{CreditDelta, SessionDelta};
pub use diameter::{FinalUnitAction, RedirectAddressType, ResultCode};
pub use error::{SessionError, SessionResult};
pub use fsm::{SessionFsmEvent, SessionFsmState};
pub use grant::ChargingGrant;
pub use monitor::Monitor;
pub use request::{
    CreditUpdateType, CreditUsage, CreditUsageUpdate, RequestContext, ServiceAction,
    ServiceActionType, SessionTerminateRequest, UpdateSessionRequest, UsageMonitorUpdate,
    UsageMonitoringUpdateRequest,
};
pub use rule::{
    PolicyRule, RuleLifetime, RuleSet, RuleState, StaticRuleSet, StaticRuleStore, TrackingType,
};
pub use state::SessionState;
pub use stored::{
    deserialize_stored_session, serialize_stored_session, StoredSessionState,
    STORED_SESSION_VERSION,
};
pub use types::*;
