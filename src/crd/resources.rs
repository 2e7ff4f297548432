use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// CPU and memory quantities as the user writes them (e.g. "100m", "256Mi").
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct ResourceDescription {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Requested resources for one container, both halves optional.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct Resources {
    #[serde(default)]
    pub requests: ResourceDescription,
    #[serde(default)]
    pub limits: ResourceDescription,
}
