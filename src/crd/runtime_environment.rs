//! `RuntimeEnvironment`: a read-mostly catalog entry naming a
//! `(language, version, image)` triple.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::MinRecResources;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "llmsafespace.dev",
    version = "v1",
    kind = "RuntimeEnvironment",
    plural = "runtimeenvironments",
    status = "RuntimeEnvironmentStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeEnvironmentSpec {
    pub language: String,
    pub version: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_installed_packages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_features: Vec<String>,
    #[serde(default)]
    pub resource_requirements: MinRecResources,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeEnvironmentStatus {
    #[serde(default)]
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_validated: Option<String>,
}

/// `available=true` holds iff a healthcheck succeeded within `freshness`
/// seconds of `now`. The healthcheck itself runs outside this module (no
/// dedicated RuntimeEnvironment reconciler exists); this predicate is what
/// a WarmPool reconciler uses to decide whether a pool's backing runtime is
/// usable right now, independent of whatever the stored `status.available`
/// bit currently says.
pub fn is_fresh(last_validated: Option<&str>, freshness: chrono::Duration, now: chrono::DateTime<chrono::Utc>) -> bool {
    let Some(ts) = last_validated else {
        return false;
    };
    let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(ts) else {
        return false;
    };
    now.signed_duration_since(parsed.with_timezone(&chrono::Utc)) <= freshness
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn fresh_within_window() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let ts = (now - Duration::seconds(30)).to_rfc3339();
        assert!(is_fresh(Some(&ts), Duration::minutes(1), now));
    }

    #[test]
    fn stale_outside_window() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let ts = (now - Duration::minutes(5)).to_rfc3339();
        assert!(!is_fresh(Some(&ts), Duration::minutes(1), now));
    }

    #[test]
    fn missing_timestamp_is_never_fresh() {
        let now = Utc::now();
        assert!(!is_fresh(None, Duration::minutes(5), now));
    }
}
