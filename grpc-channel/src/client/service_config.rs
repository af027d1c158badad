/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Service config: the policy document a resolver (or the application)
//! supplies to control load balancing, per-method behavior, retry throttling
//! and health checking.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tonic::{Code, Status};
use tracing::warn;

use super::load_balancing::{LbPolicyRegistry, pick_first};

/// An in-memory representation of a service config, usually provided to gRPC as
/// a JSON object.
#[derive(Clone)]
pub struct ServiceConfig {
    lb: LbPolicyConfig,
    methods: HashMap<String, MethodConfig>,
    retry_throttling: Option<RetryThrottlingPolicy>,
    health_check: Option<HealthCheckConfig>,
    raw: String,
}

/// The load balancing policy selected by a service config along with its
/// parsed configuration.
#[derive(Clone, Debug)]
pub(crate) struct LbPolicyConfig {
    pub(crate) name: String,
    pub(crate) config: Option<LbConfig>,
}

/// A convenience wrapper for an LB policy's configuration object.
#[derive(Debug, Clone)]
pub struct LbConfig {
    config: Arc<dyn Any + Send + Sync>,
}

impl LbConfig {
    /// Create a new LbConfig wrapper containing the provided config.
    pub fn new(config: impl Any + Send + Sync) -> Self {
        LbConfig {
            config: Arc::new(config),
        }
    }

    /// Convenience method to extract the LB policy's configuration object.
    pub fn convert_to<T: 'static + Send + Sync>(&self) -> Option<Arc<T>> {
        self.config.clone().downcast::<T>().ok()
    }
}

/// Configuration for the RPCs of one method, one service, or all services.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct MethodConfig {
    /// Whether RPCs wait for a ready transport instead of failing fast.
    pub wait_for_ready: Option<bool>,
    /// The default deadline applied to RPCs.
    pub timeout: Option<Duration>,
    pub max_request_message_bytes: Option<usize>,
    pub max_response_message_bytes: Option<usize>,
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the original RPC. Capped at 5.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub retryable_status_codes: HashSet<Code>,
}

/// Parameters of the channel's [`RetryThrottler`].
///
/// [`RetryThrottler`]: super::retry_throttler::RetryThrottler
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryThrottlingPolicy {
    /// The number of tokens the bucket holds when full; in (0, 1000].
    pub max_tokens: f64,
    /// Tokens returned to the bucket per successful RPC; positive.
    pub token_ratio: f64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthCheckConfig {
    /// The service whose health is checked on each subchannel.
    pub service_name: String,
}

/// Selects the configuration applied to individual RPCs.
///
/// Resolvers may supply their own selector with an update; otherwise the
/// channel consults the method table of the current service config.
pub trait ConfigSelector: Send + Sync {
    fn select_config(&self, method: &str) -> Result<MethodConfig, Status>;
}

/// Selects configs from the method table of a service config.
pub(crate) struct DefaultConfigSelector {
    pub(crate) sc: Arc<ServiceConfig>,
}

impl ConfigSelector for DefaultConfigSelector {
    fn select_config(&self, method: &str) -> Result<MethodConfig, Status> {
        Ok(self.sc.method_config(method).cloned().unwrap_or_default())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            lb: LbPolicyConfig {
                name: pick_first::POLICY_NAME.to_string(),
                config: None,
            },
            methods: HashMap::new(),
            retry_throttling: None,
            health_check: None,
            raw: "{}".to_string(),
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}

impl ServiceConfig {
    /// Parses a JSON service config. Load balancing configs are validated by
    /// the policies registered in `lb_registry`.
    pub fn parse(json: &str, lb_registry: &LbPolicyRegistry) -> Result<ServiceConfig, String> {
        let raw: RawServiceConfig = serde_json::from_str(json)
            .map_err(|e| format!("grpc: unmarshaling service config {json}: {e}"))?;

        let lb = match raw.load_balancing_config {
            Some(list) => parse_lb_config_list(&list, lb_registry)?,
            None => {
                let name = raw
                    .load_balancing_policy
                    .map(|n| n.to_lowercase())
                    .filter(|n| lb_registry.get(n).is_some())
                    .unwrap_or_else(|| pick_first::POLICY_NAME.to_string());
                LbPolicyConfig { name, config: None }
            }
        };

        let mut methods = HashMap::new();
        for (i, m) in raw.method_config.unwrap_or_default().into_iter().enumerate() {
            let Some(names) = m.name else {
                continue;
            };
            let mc = MethodConfig {
                wait_for_ready: m.wait_for_ready,
                timeout: m
                    .timeout
                    .as_deref()
                    .map(parse_duration)
                    .transpose()
                    .map_err(|e| format!("grpc: methodConfig[{i}]: invalid timeout: {e}"))?,
                max_request_message_bytes: m.max_request_message_bytes.map(saturating_usize),
                max_response_message_bytes: m.max_response_message_bytes.map(saturating_usize),
                retry_policy: m
                    .retry_policy
                    .map(convert_retry_policy)
                    .transpose()
                    .map_err(|e| format!("grpc: methodConfig[{i}]: {e}"))?
                    .flatten(),
            };
            for n in names {
                let path = n.path().map_err(|e| format!("grpc: methodConfig[{i}]: {e}"))?;
                if methods.contains_key(&path) {
                    return Err(format!(
                        "grpc: methodConfig[{i}]: duplicated method config name {path:?}"
                    ));
                }
                methods.insert(path, mc.clone());
            }
        }

        let retry_throttling = match raw.retry_throttling {
            Some(rt) => {
                if rt.max_tokens <= 0.0 || rt.max_tokens > 1000.0 {
                    return Err(format!(
                        "grpc: invalid retry throttling config: maxTokens ({}) out of range (0, 1000]",
                        rt.max_tokens
                    ));
                }
                if rt.token_ratio <= 0.0 {
                    return Err(format!(
                        "grpc: invalid retry throttling config: tokenRatio ({}) may not be negative",
                        rt.token_ratio
                    ));
                }
                Some(RetryThrottlingPolicy {
                    max_tokens: rt.max_tokens,
                    token_ratio: rt.token_ratio,
                })
            }
            None => None,
        };

        Ok(ServiceConfig {
            lb,
            methods,
            retry_throttling,
            health_check: raw.health_check_config.map(|h| HealthCheckConfig {
                service_name: h.service_name.unwrap_or_default(),
            }),
            raw: json.to_string(),
        })
    }

    /// The name of the load balancing policy this config selects.
    pub fn lb_policy_name(&self) -> &str {
        &self.lb.name
    }

    pub(crate) fn lb_config(&self) -> Option<LbConfig> {
        self.lb.config.clone()
    }

    /// Looks up the config of `method` ("/service/method"), falling back to
    /// the service-wide entry and then to the default entry.
    pub fn method_config(&self, method: &str) -> Option<&MethodConfig> {
        if let Some(mc) = self.methods.get(method) {
            return Some(mc);
        }
        if let Some(i) = method.rfind('/') {
            if let Some(mc) = self.methods.get(&method[..=i]) {
                return Some(mc);
            }
        }
        self.methods.get("")
    }

    pub fn retry_throttling(&self) -> Option<&RetryThrottlingPolicy> {
        self.retry_throttling.as_ref()
    }

    pub fn health_check_config(&self) -> Option<&HealthCheckConfig> {
        self.health_check.as_ref()
    }

    /// The JSON this config was parsed from.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

fn parse_lb_config_list(
    list: &[serde_json::Map<String, Value>],
    lb_registry: &LbPolicyRegistry,
) -> Result<LbPolicyConfig, String> {
    for entry in list {
        if entry.len() != 1 {
            return Err(format!(
                "invalid loadBalancingConfig: each entry must hold exactly one policy, got {}",
                entry.len()
            ));
        }
        let Some((name, cfg)) = entry.iter().next() else {
            continue;
        };
        let Some(builder) = lb_registry.get(name) else {
            // Unknown policies are skipped in favor of later entries.
            continue;
        };
        let config = builder
            .parse_config(cfg)
            .map_err(|e| format!("invalid loadBalancingConfig for {name:?}: {e}"))?;
        return Ok(LbPolicyConfig {
            name: name.clone(),
            config,
        });
    }
    Err("invalid loadBalancingConfig: no supported policies found".to_string())
}

fn convert_retry_policy(rp: RawRetryPolicy) -> Result<Option<RetryPolicy>, String> {
    let initial_backoff = parse_duration(&rp.initial_backoff)?;
    let max_backoff = parse_duration(&rp.max_backoff)?;
    if rp.max_attempts <= 1
        || initial_backoff.is_zero()
        || max_backoff.is_zero()
        || rp.backoff_multiplier <= 0.0
        || rp.retryable_status_codes.is_empty()
    {
        warn!("grpc: ignoring retry policy due to illegal configuration");
        return Ok(None);
    }
    let retryable_status_codes = rp
        .retryable_status_codes
        .iter()
        .map(parse_code)
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(Some(RetryPolicy {
        max_attempts: rp.max_attempts.min(5),
        initial_backoff,
        max_backoff,
        backoff_multiplier: rp.backoff_multiplier,
        retryable_status_codes,
    }))
}

/// Parses a protobuf JSON duration such as "1.5s".
fn parse_duration(s: &str) -> Result<Duration, String> {
    let secs = s
        .strip_suffix('s')
        .ok_or_else(|| format!("malformed duration {s:?}"))?;
    let (whole, frac) = secs.split_once('.').unwrap_or((secs, ""));
    if (whole.is_empty() && frac.is_empty()) || frac.len() > 9 {
        return Err(format!("malformed duration {s:?}"));
    }
    let whole: u64 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| format!("malformed duration {s:?}"))?
    };
    let nanos: u32 = if frac.is_empty() {
        0
    } else {
        let n: u32 = frac
            .parse()
            .map_err(|_| format!("malformed duration {s:?}"))?;
        n * 10u32.pow(9 - frac.len() as u32)
    };
    Ok(Duration::new(whole, nanos))
}

fn parse_code(v: &Value) -> Result<Code, String> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .map(Code::from_i32)
            .filter(|c| *c != Code::Unknown || n.as_i64() == Some(2))
            .ok_or_else(|| format!("invalid status code {n}")),
        Value::String(s) => code_from_name(s).ok_or_else(|| format!("invalid status code {s:?}")),
        other => Err(format!("invalid status code {other}")),
    }
}

fn code_from_name(name: &str) -> Option<Code> {
    let code = match name {
        "OK" => Code::Ok,
        "CANCELLED" => Code::Cancelled,
        "UNKNOWN" => Code::Unknown,
        "INVALID_ARGUMENT" => Code::InvalidArgument,
        "DEADLINE_EXCEEDED" => Code::DeadlineExceeded,
        "NOT_FOUND" => Code::NotFound,
        "ALREADY_EXISTS" => Code::AlreadyExists,
        "PERMISSION_DENIED" => Code::PermissionDenied,
        "RESOURCE_EXHAUSTED" => Code::ResourceExhausted,
        "FAILED_PRECONDITION" => Code::FailedPrecondition,
        "ABORTED" => Code::Aborted,
        "OUT_OF_RANGE" => Code::OutOfRange,
        "UNIMPLEMENTED" => Code::Unimplemented,
        "INTERNAL" => Code::Internal,
        "UNAVAILABLE" => Code::Unavailable,
        "DATA_LOSS" => Code::DataLoss,
        "UNAUTHENTICATED" => Code::Unauthenticated,
        _ => return None,
    };
    Some(code)
}

fn saturating_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServiceConfig {
    load_balancing_policy: Option<String>,
    load_balancing_config: Option<Vec<serde_json::Map<String, Value>>>,
    method_config: Option<Vec<RawMethodConfig>>,
    retry_throttling: Option<RawRetryThrottling>,
    health_check_config: Option<RawHealthCheckConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMethodConfig {
    name: Option<Vec<RawName>>,
    wait_for_ready: Option<bool>,
    timeout: Option<String>,
    max_request_message_bytes: Option<u64>,
    max_response_message_bytes: Option<u64>,
    retry_policy: Option<RawRetryPolicy>,
}

#[derive(Deserialize)]
struct RawName {
    service: Option<String>,
    method: Option<String>,
}

impl RawName {
    fn path(&self) -> Result<String, String> {
        let service = self.service.as_deref().unwrap_or("");
        let method = self.method.as_deref().unwrap_or("");
        if service.is_empty() {
            if !method.is_empty() {
                return Err("cannot have an empty 'service' and non-empty 'method'".to_string());
            }
            return Ok(String::new());
        }
        Ok(format!("/{service}/{method}"))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRetryPolicy {
    #[serde(default)]
    max_attempts: u32,
    #[serde(default)]
    initial_backoff: String,
    #[serde(default)]
    max_backoff: String,
    #[serde(default)]
    backoff_multiplier: f64,
    #[serde(default)]
    retryable_status_codes: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRetryThrottling {
    max_tokens: f64,
    token_ratio: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHealthCheckConfig {
    service_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::load_balancing::round_robin;

    fn parse(json: &str) -> Result<ServiceConfig, String> {
        ServiceConfig::parse(json, &LbPolicyRegistry::with_defaults())
    }

    #[test]
    fn empty_config_selects_pick_first() {
        let sc = parse("{}").unwrap();
        assert_eq!(sc.lb_policy_name(), pick_first::POLICY_NAME);
        assert!(sc.retry_throttling().is_none());
        assert!(sc.health_check_config().is_none());
    }

    #[test]
    fn legacy_policy_name() {
        let sc = parse(r#"{"loadBalancingPolicy": "ROUND_ROBIN"}"#).unwrap();
        assert_eq!(sc.lb_policy_name(), round_robin::POLICY_NAME);

        // Unknown names fall back to pick_first.
        let sc = parse(r#"{"loadBalancingPolicy": "grpclb"}"#).unwrap();
        assert_eq!(sc.lb_policy_name(), pick_first::POLICY_NAME);
    }

    #[test]
    fn first_supported_lb_config_wins() {
        let sc = parse(
            r#"{"loadBalancingConfig": [
                {"xds_experimental": {}},
                {"pick_first": {"shuffleAddressList": true}},
                {"round_robin": {}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(sc.lb_policy_name(), pick_first::POLICY_NAME);
        let cfg = sc
            .lb_config()
            .and_then(|c| c.convert_to::<pick_first::PickFirstConfig>())
            .unwrap();
        assert_eq!(cfg.shuffle_address_list, Some(true));

        let err = parse(r#"{"loadBalancingConfig": [{"xds_experimental": {}}]}"#).unwrap_err();
        assert!(err.contains("no supported policies"), "{err}");
    }

    #[test]
    fn method_config_lookup_order() {
        let sc = parse(
            r#"{"methodConfig": [
                {"name": [{"service": "foo", "method": "bar"}], "timeout": "1.5s"},
                {"name": [{"service": "foo"}], "waitForReady": true},
                {"name": [{}], "maxRequestMessageBytes": 1024}
            ]}"#,
        )
        .unwrap();
        let exact = sc.method_config("/foo/bar").unwrap();
        assert_eq!(exact.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(exact.wait_for_ready, None);

        let service = sc.method_config("/foo/baz").unwrap();
        assert_eq!(service.wait_for_ready, Some(true));

        let default = sc.method_config("/other/method").unwrap();
        assert_eq!(default.max_request_message_bytes, Some(1024));
    }

    #[test]
    fn invalid_method_names() {
        let err = parse(r#"{"methodConfig": [{"name": [{"method": "bar"}]}]}"#).unwrap_err();
        assert!(err.contains("empty 'service'"), "{err}");

        let err = parse(
            r#"{"methodConfig": [
                {"name": [{"service": "foo"}]},
                {"name": [{"service": "foo"}]}
            ]}"#,
        )
        .unwrap_err();
        assert!(err.contains("duplicated"), "{err}");
    }

    #[test]
    fn retry_policy_is_capped_or_ignored() {
        let sc = parse(
            r#"{"methodConfig": [{
                "name": [{"service": "foo"}],
                "retryPolicy": {
                    "maxAttempts": 10,
                    "initialBackoff": "0.1s",
                    "maxBackoff": "1s",
                    "backoffMultiplier": 2,
                    "retryableStatusCodes": ["UNAVAILABLE", 4]
                }
            }]}"#,
        )
        .unwrap();
        let rp = sc.method_config("/foo/x").unwrap().retry_policy.clone().unwrap();
        assert_eq!(rp.max_attempts, 5);
        assert_eq!(rp.initial_backoff, Duration::from_millis(100));
        assert!(rp.retryable_status_codes.contains(&Code::Unavailable));
        assert!(rp.retryable_status_codes.contains(&Code::DeadlineExceeded));

        let sc = parse(
            r#"{"methodConfig": [{
                "name": [{"service": "foo"}],
                "retryPolicy": {"maxAttempts": 1, "initialBackoff": "1s", "maxBackoff": "1s",
                                "backoffMultiplier": 2, "retryableStatusCodes": ["UNAVAILABLE"]}
            }]}"#,
        )
        .unwrap();
        assert!(sc.method_config("/foo/x").unwrap().retry_policy.is_none());
    }

    #[test]
    fn retry_throttling_bounds() {
        let sc = parse(r#"{"retryThrottling": {"maxTokens": 10, "tokenRatio": 0.1}}"#).unwrap();
        assert_eq!(
            sc.retry_throttling(),
            Some(&RetryThrottlingPolicy {
                max_tokens: 10.0,
                token_ratio: 0.1
            })
        );
        assert!(parse(r#"{"retryThrottling": {"maxTokens": 0, "tokenRatio": 0.1}}"#).is_err());
        assert!(parse(r#"{"retryThrottling": {"maxTokens": 1001, "tokenRatio": 0.1}}"#).is_err());
        assert!(parse(r#"{"retryThrottling": {"maxTokens": 10, "tokenRatio": 0}}"#).is_err());
    }

    #[test]
    fn health_check_service_name() {
        let sc = parse(r#"{"healthCheckConfig": {"serviceName": "grpc.health"}}"#).unwrap();
        assert_eq!(sc.health_check_config().unwrap().service_name, "grpc.health");
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("1s"), Ok(Duration::from_secs(1)));
        assert_eq!(parse_duration("0.000000001s"), Ok(Duration::from_nanos(1)));
        assert_eq!(parse_duration(".5s"), Ok(Duration::from_millis(500)));
        assert!(parse_duration("1").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("1.0000000001s").is_err());
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(parse("{").is_err());
        assert!(parse(r#"{"methodConfig": 3}"#).is_err());
    }
}
