//! Diameter credit-control values consumed by the session engine
//!
//! Result-code classes follow RFC 6733 section 7.1, final-unit actions and
//! reporting reasons follow 3GPP TS 32.299 (Gy).

use serde::{Deserialize, Serialize};

/// Diameter Result-Code values the engine reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResultCode {
    // Success (2xxx)
    Success = 2001,
    LimitedSuccess = 2002,

    // Protocol Errors (3xxx)
    UnableToDeliver = 3002,
    TooBusy = 3004,

    // Transient Failures (4xxx)
    AuthenticationRejected = 4001,
    OutOfSpace = 4002,
    ElectionLost = 4003,
    /// DIAMETER_CREDIT_CONTROL_NOT_APPLICABLE (RFC 4006)
    CreditControlNotApplicable = 4011,
    /// DIAMETER_CREDIT_LIMIT_REACHED (RFC 4006)
    CreditLimitReached = 4012,

    // Permanent Failures (5xxx)
    UnknownSessionId = 5002,
    AuthorizationRejected = 5003,
    UnableToComply = 5012,
    /// DIAMETER_USER_UNKNOWN (RFC 4006)
    UserUnknown = 5030,
}

impl ResultCode {
    /// Check if result code indicates success
    pub fn is_success(&self) -> bool {
        is_success(*self as u32)
    }

    /// Check if result code indicates transient failure
    pub fn is_transient_failure(&self) -> bool {
        is_transient_failure(*self as u32)
    }

    /// Check if result code indicates permanent failure
    pub fn is_permanent_failure(&self) -> bool {
        is_permanent_failure(*self as u32)
    }
}

impl From<u32> for ResultCode {
    fn from(value: u32) -> Self {
        match value {
            2001 => ResultCode::Success,
            2002 => ResultCode::LimitedSuccess,
            3002 => ResultCode::UnableToDeliver,
            3004 => ResultCode::TooBusy,
            4001 => ResultCode::AuthenticationRejected,
            4002 => ResultCode::OutOfSpace,
            4003 => ResultCode::ElectionLost,
            4011 => ResultCode::CreditControlNotApplicable,
            4012 => ResultCode::CreditLimitReached,
            5002 => ResultCode::UnknownSessionId,
            5003 => ResultCode::AuthorizationRejected,
            5030 => ResultCode::UserUnknown,
            _ => ResultCode::UnableToComply,
        }
    }
}

/// Raw code is in the success class (2xxx)
pub fn is_success(code: u32) -> bool {
    (2000..3000).contains(&code)
}

/// Raw code is in the transient failure class (4xxx)
pub fn is_transient_failure(code: u32) -> bool {
    (4000..5000).contains(&code)
}

/// Raw code is in the permanent failure class (5xxx)
pub fn is_permanent_failure(code: u32) -> bool {
    (5000..6000).contains(&code)
}

/// Final-Unit-Action values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FinalUnitAction {
    #[default]
    Terminate,
    Redirect,
    RestrictAccess,
}

impl FinalUnitAction {
    pub fn name(&self) -> &'static str {
        match self {
            FinalUnitAction::Terminate => "TERMINATE",
            FinalUnitAction::Redirect => "REDIRECT",
            FinalUnitAction::RestrictAccess => "RESTRICT_ACCESS",
        }
    }
}

/// Redirect-Address-Type values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RedirectAddressType {
    #[default]
    Ipv4,
    Ipv6,
    Url,
    SipUri,
}
