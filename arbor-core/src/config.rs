//! Broker configuration.
//!
//! Parsing configuration files is not this crate's business: the wrapper
//! hands over an already-loaded JSON dict and [`BrokerConfig::apply_dict`]
//! maps the recognized per-subsystem options onto typed fields. Unknown keys
//! are rejected so typos fail loudly.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{CoreError, Result};

/// Overlay options: tree degree and torpidity grace window.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OverlayOptions {
    /// Tree fan-out.
    pub k: u32,
    /// Seconds without an inbound frame before a peer is declared torpid.
    pub torpid_grace: f64,
}

impl Default for OverlayOptions {
    fn default() -> Self {
        Self { k: 2, torpid_grace: 30.0 }
    }
}

/// Groups options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GroupsOptions {
    /// Seconds that join/leave updates accumulate before a batch flush.
    pub batch_timeout: f64,
}

impl Default for GroupsOptions {
    fn default() -> Self {
        Self { batch_timeout: 0.1 }
    }
}

/// State-machine options: the named script sets run by each life-cycle
/// stage. An absent script posts the corresponding `*-none` event.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateMachineOptions {
    pub rc1_script: Option<String>,
    pub rc2_script: Option<String>,
    pub rc3_script: Option<String>,
    pub cleanup_script: Option<String>,
}

/// Heartbeat options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeartbeatOptions {
    /// Seconds between rank-0 heartbeat events.
    pub period: f64,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self { period: 2.0 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigDict {
    overlay: Option<OverlayOptions>,
    groups: Option<GroupsOptions>,
    #[serde(rename = "state-machine")]
    state_machine: Option<StateMachineOptions>,
    heartbeat: Option<HeartbeatOptions>,
}

/// Complete broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// This broker's rank, 0-indexed.
    pub rank: u32,
    /// Number of ranks in the session.
    pub size: u32,
    /// Session name; scopes endpoint names so sessions do not collide.
    pub session: String,
    pub overlay: OverlayOptions,
    pub groups: GroupsOptions,
    pub state_machine: StateMachineOptions,
    pub heartbeat: HeartbeatOptions,
}

impl BrokerConfig {
    /// Configuration with defaults for a `size`-rank session.
    #[must_use]
    pub fn new(rank: u32, size: u32) -> Self {
        Self {
            rank,
            size,
            session: "default".to_owned(),
            overlay: OverlayOptions::default(),
            groups: GroupsOptions::default(),
            state_machine: StateMachineOptions::default(),
            heartbeat: HeartbeatOptions::default(),
        }
    }

    #[must_use]
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = session.into();
        self
    }

    /// Overlay the options from an externally loaded config dict.
    ///
    /// # Errors
    ///
    /// Unknown keys or mistyped values are configuration errors.
    pub fn apply_dict(mut self, dict: &serde_json::Value) -> Result<Self> {
        let parsed: ConfigDict = serde_json::from_value(dict.clone())
            .map_err(|e| CoreError::protocol(format!("config: {e}")))?;
        if let Some(overlay) = parsed.overlay {
            self.overlay = overlay;
        }
        if let Some(groups) = parsed.groups {
            self.groups = groups;
        }
        if let Some(sm) = parsed.state_machine {
            self.state_machine = sm;
        }
        if let Some(hb) = parsed.heartbeat {
            self.heartbeat = hb;
        }
        Ok(self)
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    #[must_use]
    pub fn torpid_grace(&self) -> Duration {
        Duration::from_secs_f64(self.overlay.torpid_grace)
    }

    #[must_use]
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.groups.batch_timeout)
    }

    #[must_use]
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat.period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let cfg = BrokerConfig::new(0, 4);
        assert_eq!(cfg.overlay.k, 2);
        assert_eq!(cfg.torpid_grace(), Duration::from_secs(30));
        assert_eq!(cfg.batch_timeout(), Duration::from_millis(100));
        assert!(cfg.is_root());
        assert!(cfg.state_machine.rc1_script.is_none());
    }

    #[test]
    fn apply_dict_overrides() {
        let cfg = BrokerConfig::new(1, 4)
            .apply_dict(&json!({
                "overlay": { "k": 4, "torpid_grace": 5.0 },
                "groups": { "batch_timeout": 0.02 },
                "state-machine": { "rc1_script": "echo rc1" },
            }))
            .unwrap();
        assert_eq!(cfg.overlay.k, 4);
        assert_eq!(cfg.torpid_grace(), Duration::from_secs(5));
        assert_eq!(cfg.batch_timeout(), Duration::from_millis(20));
        assert_eq!(cfg.state_machine.rc1_script.as_deref(), Some("echo rc1"));
        assert!(!cfg.is_root());
    }

    #[test]
    fn apply_dict_rejects_unknown_keys() {
        let err = BrokerConfig::new(0, 1).apply_dict(&json!({
            "overlay": { "fanout": 4 },
        }));
        assert!(err.is_err());
    }
}
