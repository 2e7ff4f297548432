use envconfig::Envconfig;
use std::time::Duration;

/// Runtime tuning for the operator. All knobs are plain env-backed fields so
/// tests can construct a config directly instead of poking process state.
#[derive(Envconfig, Clone, Debug)]
pub struct OperatorConfig {
    /// Fallback image used when the Memcached spec omits `image`.
    /// Env: MEMCACHED_IMAGE
    #[envconfig(from = "MEMCACHED_IMAGE")]
    pub memcached_image: Option<String>,

    /// Fallback image for the proxy tier when the proxy sub-spec omits one.
    /// Env: PROXY_IMAGE
    #[envconfig(from = "PROXY_IMAGE")]
    pub proxy_image: Option<String>,

    /// Reserved for rate limiting scale actions; not consulted by any step yet.
    /// Env: MCO_COOLDOWN_SECS
    #[envconfig(from = "MCO_COOLDOWN_SECS", default = "20")]
    pub cooldown_secs: u64,

    /// Floor applied to every requested requeue delay so repeated child-side
    /// events cannot re-invoke the loop in a tight storm.
    /// Env: MCO_MIN_REQUEUE_MS
    #[envconfig(from = "MCO_MIN_REQUEUE_MS", default = "500")]
    pub min_requeue_ms: u64,

    /// How long a pod may sit with a deletion timestamp before the pod-health
    /// check force-deletes it.
    /// Env: MCO_STUCK_POD_GRACE_SECS
    #[envconfig(from = "MCO_STUCK_POD_GRACE_SECS", default = "300")]
    pub stuck_pod_grace_secs: u64,
}

impl OperatorConfig {
    pub fn min_requeue(&self) -> Duration {
        Duration::from_millis(self.min_requeue_ms)
    }

    pub fn stuck_pod_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stuck_pod_grace_secs as i64)
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        OperatorConfig {
            memcached_image: None,
            proxy_image: None,
            cooldown_secs: 20,
            min_requeue_ms: 500,
            stuck_pod_grace_secs: 300,
        }
    }
}
