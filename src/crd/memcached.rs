use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::resources::Resources;

pub const DEFAULT_PORT: i32 = 11211;
pub const FINALIZER: &str = "cache.mko.io/finalizer";
pub const NO_FINALIZER_ANNOTATION: &str = "cache.mko.io/no-finalizer";
/// Label stamped on every managed pod; the value is the owning entity name.
pub const MEMCACHED_LABEL: &str = "cache.mko.io/memcached";
pub const PROXY_DEFAULT_IMAGE: &str = "twemproxy:0.5.0";

/// Image reference split into repository name and tag.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct DockerImage {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tag: String,
}

/// Verbosity of the managed memcached processes.
///
/// - "Disable": no verbose output at all;
/// - "Enable" (default): print errors and warnings;
/// - "Moar": print client commands and responses;
/// - "Extreme": print internal state transactions.
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq,
)]
pub enum VerboseLevel {
    Disable,
    Enable,
    Moar,
    Extreme,
}

impl Default for VerboseLevel {
    fn default() -> Self {
        VerboseLevel::Enable
    }
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "cache.mko.io",
    version = "v1",
    kind = "Memcached",
    plural = "memcacheds",
    namespaced,
    status = "MemcachedStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MemcachedSpec {
    /// Number of memcached instances; the store enforces a minimum of 1.
    pub size: i32,

    /// Port the memcached containers listen on.
    #[serde(default = "default_port")]
    pub container_port: i32,

    /// Image and tag for the memcached pods; falls back to the
    /// MEMCACHED_IMAGE environment variable when omitted.
    #[serde(default)]
    pub image: DockerImage,

    #[serde(default)]
    pub verbose: VerboseLevel,

    /// CPU and memory for the memcached pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,

    /// Sharding proxy tier in front of the cache pool; absent means no proxy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySpec>,
}

fn default_port() -> i32 {
    DEFAULT_PORT
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    #[serde(default)]
    pub image: DockerImage,

    /// Number of proxy instances.
    pub replicas: i32,

    /// Listen address in `host:port` form, e.g. "0.0.0.0:22121".
    pub listen: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
}

impl ProxySpec {
    /// Port component of the listen address; 0 when unparsable, matching the
    /// lenient handling of the config this address is copied from.
    pub fn listen_port(&self) -> i32 {
        self.listen
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(0)
    }
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq,
)]
pub enum ProgressState {
    Updating,
    Ready,
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq,
)]
pub enum ConditionType {
    Ready,
    Degraded,
    Decommission,
    ScalingUp,
    ScalingDown,
    Updating,
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq,
)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct MemcachedCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(
        rename = "lastTransitionTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_transition_time: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct MemcachedStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<MemcachedCondition>>,
    /// Last known progress state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator_progress: Option<ProgressState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl MemcachedStatus {
    pub fn condition(
        &self,
        type_: ConditionType,
    ) -> Option<&MemcachedCondition> {
        self.conditions
            .as_ref()
            .and_then(|cs| cs.iter().find(|c| c.type_ == type_))
    }

    /// Status of the given condition, `Unknown` when absent.
    pub fn condition_status(&self, type_: ConditionType) -> ConditionStatus {
        self.condition(type_)
            .map(|c| c.status)
            .unwrap_or(ConditionStatus::Unknown)
    }
}

impl Memcached {
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|x| x == FINALIZER))
            .unwrap_or(false)
    }

    pub fn finalizer_opt_out(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .map(|a| a.contains_key(NO_FINALIZER_ANNOTATION))
            .unwrap_or(false)
    }

    pub fn status_or_default(&self) -> MemcachedStatus {
        self.status.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_status_defaults_to_unknown() {
        let status = MemcachedStatus::default();
        assert_eq!(
            status.condition_status(ConditionType::Decommission),
            ConditionStatus::Unknown
        );
    }

    #[test]
    fn condition_lookup_finds_matching_type() {
        let status = MemcachedStatus {
            conditions: Some(vec![MemcachedCondition {
                type_: ConditionType::ScalingDown,
                status: ConditionStatus::True,
                reason: Some("Decommission".into()),
                message: None,
                last_transition_time: None,
            }]),
            ..Default::default()
        };
        assert_eq!(
            status.condition_status(ConditionType::ScalingDown),
            ConditionStatus::True
        );
        assert_eq!(
            status.condition_status(ConditionType::ScalingUp),
            ConditionStatus::Unknown
        );
    }

    #[test]
    fn proxy_listen_port_parses_host_port() {
        let proxy = ProxySpec {
            listen: "0.0.0.0:22121".into(),
            ..Default::default()
        };
        assert_eq!(proxy.listen_port(), 22121);
    }

    #[test]
    fn proxy_listen_port_is_zero_when_malformed() {
        let proxy = ProxySpec {
            listen: "no-port-here".into(),
            ..Default::default()
        };
        assert_eq!(proxy.listen_port(), 0);
    }
}
