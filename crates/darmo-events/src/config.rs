use serde::{Deserialize, Serialize};

/// What `dispatch` does when a handler returns an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop at the first failing handler and return its error.
    #[default]
    Abort,
    /// Deliver to every matching handler, then report all failures.
    Continue,
}

/// Event bus settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Name attached to every log record emitted by the bus
    #[serde(default = "default_bus_name")]
    pub name: String,

    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

fn default_bus_name() -> String {
    "events".to_string()
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            name: default_bus_name(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl BusConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn from_json_str(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }
}
