use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::warn;

use crate::crd::{ResourceDescription, Resources};

const RESOURCE_CPU: &str = "cpu";
const RESOURCE_MEMORY: &str = "memory";

/// Values users may write that mean "not set" rather than a real quantity.
const EMPTY_RESOURCE_EXAMPLES: [&str; 3] = ["", "0", "null"];

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("could not parse {label} quantity: {source}")]
    Parse {
        label: String,
        source: QuantityError,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum QuantityError {
    #[error("empty quantity string")]
    Empty,
    #[error("invalid number in quantity {0:?}")]
    InvalidNumber(String),
    #[error("unknown suffix in quantity {0:?}")]
    UnknownSuffix(String),
}

/// A Kubernetes quantity reduced to integer milli-units for comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ParsedQuantity {
    millis: i128,
}

impl ParsedQuantity {
    pub fn millis(&self) -> i128 {
        self.millis
    }

    /// Whole-unit value, truncated; for memory quantities this is bytes.
    pub fn as_bytes(&self) -> i64 {
        (self.millis / 1000) as i64
    }
}

/// Parse a quantity string like "100m", "2", "1.5Gi" or "500k".
pub fn parse_quantity(input: &str) -> Result<ParsedQuantity, QuantityError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| QuantityError::InvalidNumber(input.to_string()))?;
    let multiplier: f64 = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        _ => return Err(QuantityError::UnknownSuffix(input.to_string())),
    };
    Ok(ParsedQuantity {
        millis: (value * multiplier * 1000.0).round() as i128,
    })
}

/// Defaults applied to memcached containers when the spec leaves resources
/// (or single fields of them) unset.
pub fn default_resources() -> Resources {
    let desc = || ResourceDescription {
        cpu: Some("100m".to_string()),
        memory: Some("256Mi".to_string()),
    };
    Resources {
        requests: desc(),
        limits: desc(),
    }
}

fn is_set(value: Option<&String>) -> bool {
    value
        .map(|v| !EMPTY_RESOURCE_EXAMPLES.contains(&v.as_str()))
        .unwrap_or(false)
}

type FilledList = BTreeMap<&'static str, (Quantity, ParsedQuantity)>;

fn fill_one(
    out: &mut FilledList,
    resource: &'static str,
    spec: Option<&String>,
    default: Option<&String>,
) -> Result<(), ResolveError> {
    let (raw, label) = match (spec, default) {
        (Some(v), _) if is_set(Some(v)) => (v, resource.to_string()),
        (_, Some(v)) if is_set(Some(v)) => (v, format!("default {resource}")),
        _ => return Ok(()),
    };
    let parsed = parse_quantity(raw)
        .map_err(|source| ResolveError::Parse { label, source })?;
    out.insert(resource, (Quantity(raw.clone()), parsed));
    Ok(())
}

fn fill_resource_list(
    spec: &ResourceDescription,
    defaults: &ResourceDescription,
) -> Result<FilledList, ResolveError> {
    let mut out = FilledList::new();
    fill_one(&mut out, RESOURCE_CPU, spec.cpu.as_ref(), defaults.cpu.as_ref())?;
    fill_one(
        &mut out,
        RESOURCE_MEMORY,
        spec.memory.as_ref(),
        defaults.memory.as_ref(),
    )?;
    Ok(out)
}

/// Raise any limit that ended up below its paired request. Requests are never
/// lowered; this is a correction, not an error.
fn match_limits_with_requests_if_smaller(
    requests: &FilledList,
    limits: &mut FilledList,
    container_name: &str,
) {
    for resource in [RESOURCE_CPU, RESOURCE_MEMORY] {
        let Some((req_qty, req)) = requests.get(resource) else {
            continue;
        };
        let below = match limits.get(resource) {
            Some((limit_qty, limit)) if limit < req => {
                warn!(
                    container = container_name,
                    resource,
                    limit = %limit_qty.0,
                    request = %req_qty.0,
                    "limit is below the paired request; raising it to match"
                );
                true
            }
            _ => false,
        };
        if below {
            limits.insert(resource, (req_qty.clone(), *req));
        }
    }
}

fn into_resource_list(list: FilledList) -> BTreeMap<String, Quantity> {
    list.into_iter()
        .map(|(k, (qty, _))| (k.to_string(), qty))
        .collect()
}

/// Merge the requested resources with defaults into a full requirements pair
/// usable on a container. Fails on the first unparsable quantity; no partial
/// result is returned.
pub fn generate_resource_requirements(
    resources: Option<&Resources>,
    defaults: &Resources,
    container_name: &str,
) -> Result<ResourceRequirements, ResolveError> {
    let empty = Resources::default();
    let spec = resources.unwrap_or(&empty);

    let requests = fill_resource_list(&spec.requests, &defaults.requests)?;
    let mut limits = fill_resource_list(&spec.limits, &defaults.limits)?;
    match_limits_with_requests_if_smaller(&requests, &mut limits, container_name);

    Ok(ResourceRequirements {
        requests: Some(into_resource_list(requests)),
        limits: Some(into_resource_list(limits)),
        ..Default::default()
    })
}

/// Memory limit in bytes from a resolved requirements pair; 0 when absent,
/// which makes the command builder omit the memory-limit flag.
pub fn memory_limit_bytes(requirements: &ResourceRequirements) -> i64 {
    requirements
        .limits
        .as_ref()
        .and_then(|l| l.get(RESOURCE_MEMORY))
        .and_then(|q| parse_quantity(&q.0).ok())
        .map(|p| p.as_bytes())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(req: &ResourceRequirements, resource: &str) -> String {
        req.limits.as_ref().unwrap()[resource].0.clone()
    }

    fn request(req: &ResourceRequirements, resource: &str) -> String {
        req.requests.as_ref().unwrap()[resource].0.clone()
    }

    #[test]
    fn parses_plain_milli_and_binary_quantities() {
        assert_eq!(parse_quantity("100m").unwrap().millis(), 100);
        assert_eq!(parse_quantity("1").unwrap().millis(), 1000);
        assert_eq!(parse_quantity("2k").unwrap().millis(), 2_000_000);
        assert_eq!(
            parse_quantity("256Mi").unwrap().as_bytes(),
            256 * 1024 * 1024
        );
        assert_eq!(
            parse_quantity("1Gi").unwrap().as_bytes(),
            1024 * 1024 * 1024
        );
    }

    #[test]
    fn rejects_garbage_quantities() {
        assert!(matches!(
            parse_quantity("abc"),
            Err(QuantityError::InvalidNumber(_))
        ));
        assert!(matches!(
            parse_quantity("100x"),
            Err(QuantityError::UnknownSuffix(_))
        ));
        assert!(matches!(parse_quantity(""), Err(QuantityError::Empty)));
    }

    #[test]
    fn defaults_fill_both_halves_when_nothing_requested() {
        let resolved =
            generate_resource_requirements(None, &default_resources(), "memcached")
                .unwrap();
        assert_eq!(request(&resolved, "cpu"), "100m");
        assert_eq!(request(&resolved, "memory"), "256Mi");
        assert_eq!(limit(&resolved, "cpu"), "100m");
        assert_eq!(limit(&resolved, "memory"), "256Mi");
    }

    #[test]
    fn empty_sentinels_fall_back_to_defaults() {
        let spec = Resources {
            requests: ResourceDescription {
                cpu: Some("0".into()),
                memory: Some("null".into()),
            },
            limits: ResourceDescription {
                cpu: Some("".into()),
                memory: None,
            },
        };
        let resolved = generate_resource_requirements(
            Some(&spec),
            &default_resources(),
            "memcached",
        )
        .unwrap();
        assert_eq!(request(&resolved, "cpu"), "100m");
        assert_eq!(request(&resolved, "memory"), "256Mi");
        assert_eq!(limit(&resolved, "cpu"), "100m");
    }

    #[test]
    fn limit_below_request_is_raised_to_match() {
        let spec = Resources {
            requests: ResourceDescription {
                cpu: Some("200m".into()),
                memory: None,
            },
            limits: ResourceDescription {
                cpu: Some("100m".into()),
                memory: None,
            },
        };
        let resolved = generate_resource_requirements(
            Some(&spec),
            &default_resources(),
            "memcached",
        )
        .unwrap();
        assert_eq!(limit(&resolved, "cpu"), "200m");
        // the request side is untouched
        assert_eq!(request(&resolved, "cpu"), "200m");
    }

    #[test]
    fn parse_failure_is_labeled_and_aborts() {
        let spec = Resources {
            requests: ResourceDescription {
                cpu: Some("not-a-quantity".into()),
                memory: None,
            },
            limits: ResourceDescription::default(),
        };
        let err = generate_resource_requirements(
            Some(&spec),
            &default_resources(),
            "memcached",
        )
        .unwrap_err();
        assert!(err.to_string().contains("could not parse cpu quantity"));
    }

    #[test]
    fn default_parse_failure_carries_default_label() {
        let defaults = Resources {
            requests: ResourceDescription {
                cpu: Some("broken?".into()),
                memory: None,
            },
            limits: ResourceDescription::default(),
        };
        let err = generate_resource_requirements(None, &defaults, "memcached")
            .unwrap_err();
        assert!(
            err.to_string().contains("could not parse default cpu quantity")
        );
    }

    #[test]
    fn memory_limit_bytes_reads_resolved_limit() {
        let resolved =
            generate_resource_requirements(None, &default_resources(), "memcached")
                .unwrap();
        assert_eq!(memory_limit_bytes(&resolved), 256 * 1024 * 1024);
    }
}
