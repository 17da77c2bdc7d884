//! Process configuration: a YAML file overridden by `LLMSAFESPACE_`-prefixed
//! environment variables. Parsed with `serde_yaml`; no dependency on a
//! dedicated config-merging crate.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            shutdown_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaderElectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub lease_duration_seconds: u64,
    pub renew_deadline_seconds: u64,
    pub retry_period_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct KubernetesConfig {
    pub config_path: Option<String>,
    pub in_cluster: bool,
    pub namespace: String,
    pub pod_name: Option<String>,
    pub leader_election: LeaderElectionConfig,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            in_cluster: false,
            namespace: "default".into(),
            pod_name: None,
            leader_election: LeaderElectionConfig {
                enabled: true,
                lease_duration_seconds: 15,
                renew_deadline_seconds: 10,
                retry_period_seconds: 2,
            },
        }
    }
}

/// Owned by the external persistence layer; this crate never opens a
/// connection, but parses and round-trips the field so a single config file
/// works for the whole product.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub ssl_mode: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime_seconds: u64,
}

/// Owned by the external cache layer; see [`DatabaseConfig`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub db: u32,
    pub pool_size: u32,
}

/// Owned by the external auth layer; see [`DatabaseConfig`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_duration_seconds: u64,
    pub api_key_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub level: String,
    pub development: bool,
    pub encoding: LogEncoding,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            development: false,
            encoding: LogEncoding::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogEncoding {
    #[default]
    Json,
    Console,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimit {
    pub requests: u32,
    pub window_seconds: u64,
}

/// Owned by the external API layer; see [`DatabaseConfig`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitingConfig {
    pub enabled: bool,
    pub limits: HashMap<String, RateLimit>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub server: ServerConfig,
    pub kubernetes: KubernetesConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
    pub rate_limiting: RateLimitingConfig,
}

const ENV_PREFIX: &str = "LLMSAFESPACE_";

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let mut cfg: Config = serde_yaml::from_str(&raw)?;
        cfg.apply_env_overrides(std::env::vars());
        Ok(cfg)
    }

    pub fn from_env_only() -> anyhow::Result<Self> {
        let mut cfg = Config::default();
        cfg.apply_env_overrides(std::env::vars());
        Ok(cfg)
    }

    /// Applies `LLMSAFESPACE_SECTION__FIELD=value` overrides on top of a
    /// base config, re-serializing to JSON and patching leaf values so that
    /// types stay correct without a bespoke per-field mapping table.
    fn apply_env_overrides(&mut self, vars: impl Iterator<Item = (String, String)>) {
        let mut doc = serde_json::to_value(&*self).expect("Config always serializes");
        for (key, value) in vars {
            let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let path: Vec<String> = rest
                .split("__")
                .map(|seg| to_camel_case(&seg.to_lowercase()))
                .collect();
            set_path(&mut doc, &path, &value);
        }
        if let Ok(merged) = serde_json::from_value(doc) {
            *self = merged;
        }
    }
}

fn to_camel_case(snake: &str) -> String {
    let mut out = String::new();
    let mut upper_next = false;
    for c in snake.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn set_path(doc: &mut serde_json::Value, path: &[String], raw_value: &str) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut cur = doc;
    for seg in parents {
        if !cur.is_object() {
            *cur = serde_json::json!({});
        }
        cur = cur
            .as_object_mut()
            .expect("just normalized to object")
            .entry(seg.clone())
            .or_insert_with(|| serde_json::json!({}));
    }
    if !cur.is_object() {
        *cur = serde_json::json!({});
    }
    let obj = cur.as_object_mut().expect("just normalized to object");
    obj.insert(last.clone(), infer_scalar(raw_value));
}

fn infer_scalar(raw: &str) -> serde_json::Value {
    if let Ok(b) = raw.parse::<bool>() {
        return serde_json::Value::Bool(b);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return serde_json::Value::Number(i.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return serde_json::Value::Number(n);
        }
    }
    serde_json::Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.kubernetes.namespace, "default");
        assert!(cfg.kubernetes.leader_election.enabled);
    }

    #[test]
    fn env_override_sets_nested_field() {
        let mut cfg = Config::default();
        cfg.apply_env_overrides(
            vec![("LLMSAFESPACE_KUBERNETES__NAMESPACE".to_string(), "sandboxes".to_string())]
                .into_iter(),
        );
        assert_eq!(cfg.kubernetes.namespace, "sandboxes");
    }

    #[test]
    fn env_override_parses_bool_and_int() {
        let mut cfg = Config::default();
        cfg.apply_env_overrides(
            vec![
                ("LLMSAFESPACE_SERVER__PORT".to_string(), "9999".to_string()),
                (
                    "LLMSAFESPACE_KUBERNETES__IN_CLUSTER".to_string(),
                    "true".to_string(),
                ),
            ]
            .into_iter(),
        );
        assert_eq!(cfg.server.port, 9999);
        assert!(cfg.kubernetes.in_cluster);
    }

    #[test]
    fn unrelated_env_vars_are_ignored() {
        let mut cfg = Config::default();
        let before = cfg.clone();
        cfg.apply_env_overrides(vec![("PATH".to_string(), "/usr/bin".to_string())].into_iter());
        assert_eq!(cfg, before);
    }

    #[test]
    fn round_trips_through_yaml() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg, back);
    }
}
