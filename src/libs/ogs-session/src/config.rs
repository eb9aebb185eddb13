//! Session engine configuration
//!
//! Loaded from the `sessiond:` section of the daemon YAML file. Unknown
//! sections and keys are ignored so the same file can carry other NF config.

use crate::error::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};

/// Default fraction of a grant after which usage is reported
pub const DEFAULT_USAGE_REPORTING_THRESHOLD: f32 = 0.8;

/// Runtime tunables threaded into every session at construction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessiondConf {
    /// Fraction in 0..=1 of a grant after which a usage update is sent
    pub usage_reporting_threshold: f32,
    /// Act on final-unit indications once a final grant is fully used
    pub terminate_service_when_quota_exhausted: bool,
}

impl Default for SessiondConf {
    fn default() -> Self {
        Self {
            usage_reporting_threshold: DEFAULT_USAGE_REPORTING_THRESHOLD,
            terminate_service_when_quota_exhausted: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfRoot {
    #[serde(default)]
    sessiond: Option<SessiondConf>,
}

impl SessiondConf {
    /// Parse the `sessiond:` section out of a YAML document.
    /// A missing section yields the defaults.
    pub fn from_yaml_str(yaml_str: &str) -> SessionResult<Self> {
        let root: ConfRoot = serde_yaml::from_str(yaml_str)
            .map_err(|e| SessionError::Config(e.to_string()))?;
        let conf = root.sessiond.unwrap_or_default();
        conf.validate()?;
        log::debug!(
            "sessiond config: threshold={} terminate_on_exhaust={}",
            conf.usage_reporting_threshold,
            conf.terminate_service_when_quota_exhausted
        );
        Ok(conf)
    }

    /// Load from a YAML file on disk
    pub fn from_file(path: &str) -> SessionResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn validate(&self) -> SessionResult<()> {
        let threshold = self.usage_reporting_threshold;
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(SessionError::Config(format!(
                "usage_reporting_threshold must be within 0..=1, got {threshold}"
            )));
        }
        Ok(())
    }
}
