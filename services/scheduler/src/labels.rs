//! Placement and engine-selection labels.
//!
//! Recognized labels on a service:
//!
//! - `mesos_compose.container_type`: `docker` (default) or `mesos`. The
//!   `biz.aventer.mesos_compose.container_type` key of older compose files
//!   is read the same way.
//! - `mesos_compose.placement.hostname`: a hostname or `*` glob
//! - `__mc_placement`: `unique` runs at most one task of the service per agent
//!
//! Every other label is passed through to the container untouched.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compose::ServiceSpec;

pub const ENGINE_LABEL: &str = "mesos_compose.container_type";
pub const LEGACY_ENGINE_LABEL: &str = "biz.aventer.mesos_compose.container_type";
pub const HOSTNAME_LABEL: &str = "mesos_compose.placement.hostname";
pub const PLACEMENT_LABEL: &str = "__mc_placement";

/// Returns true for labels consumed by the scheduler itself.
pub fn is_recognized(key: &str) -> bool {
    matches!(key, ENGINE_LABEL | LEGACY_ENGINE_LABEL | HOSTNAME_LABEL | PLACEMENT_LABEL)
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LabelError {
    #[error("invalid value '{value}' for label '{label}' on service '{service}'")]
    InvalidValue {
        service: String,
        label: &'static str,
        value: String,
    },
}

/// Execution engine for a service's tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Docker,
    Mesos,
}

/// A case-insensitive hostname pattern where `*` matches any run of characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostPattern(String);

impl HostPattern {
    pub fn new(pattern: &str) -> Self {
        Self(pattern.trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, host: &str) -> bool {
        glob_match(self.0.as_bytes(), host.to_ascii_lowercase().as_bytes())
    }
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

/// Scheduling constraints derived from a service's labels and placement.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlacementPolicy {
    pub engine: Engine,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<HostPattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    /// At most one task of the service per agent.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unique: bool,
}

impl PlacementPolicy {
    /// Resolve the policy for a service. Unknown engine values are rejected.
    pub fn resolve(service: &ServiceSpec) -> Result<Self, LabelError> {
        let invalid = |label: &'static str, value: &str| LabelError::InvalidValue {
            service: service.name.clone(),
            label,
            value: value.to_string(),
        };

        // Both engine keys must be valid and agree when both are set.
        let mut engine = None;
        for key in [ENGINE_LABEL, LEGACY_ENGINE_LABEL] {
            let Some(value) = service.labels.get(key) else {
                continue;
            };
            let parsed = match value.trim().to_ascii_lowercase().as_str() {
                "docker" => Engine::Docker,
                "mesos" => Engine::Mesos,
                _ => return Err(invalid(key, value)),
            };
            if engine.is_some_and(|chosen| chosen != parsed) {
                return Err(invalid(key, value));
            }
            engine = Some(parsed);
        }

        let hostname = match service.labels.get(HOSTNAME_LABEL) {
            Some(value) if value.trim().is_empty() => return Err(invalid(HOSTNAME_LABEL, value)),
            Some(value) => Some(HostPattern::new(value)),
            None => service.constraints.hostname.as_deref().map(HostPattern::new),
        };

        let unique = match service.labels.get(PLACEMENT_LABEL) {
            None => false,
            Some(value) if value.trim().eq_ignore_ascii_case("unique") => true,
            Some(value) => return Err(invalid(PLACEMENT_LABEL, value)),
        };

        Ok(Self {
            engine: engine.unwrap_or_default(),
            hostname,
            os: service.constraints.os.clone(),
            arch: service.constraints.arch.clone(),
            unique,
        })
    }

    /// True if a host with this name may run the service.
    pub fn matches_host(&self, host: &str) -> bool {
        self.hostname.as_ref().map_or(true, |p| p.matches(host))
    }

    /// True if the offer's `os` and `arch` attributes satisfy the policy.
    pub fn matches_attributes(&self, attribute: impl Fn(&str) -> Option<String>) -> bool {
        let check = |want: &Option<String>, key: &str| match want {
            None => true,
            Some(want) => attribute(key).is_some_and(|have| have.eq_ignore_ascii_case(want)),
        };
        check(&self.os, "os") && check(&self.arch, "arch")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::cluster::Resources;
    use crate::compose::{NetworkMode, PlacementConstraints, PullPolicy, RestartPolicy};
    use rstest::rstest;

    fn service(labels: &[(&str, &str)]) -> ServiceSpec {
        ServiceSpec {
            name: "web".into(),
            image: "alpine:latest".into(),
            command: None,
            entrypoint: None,
            restart: RestartPolicy::Always,
            volumes: vec![],
            environment: BTreeMap::new(),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            network: NetworkMode::Bridge,
            network_name: None,
            hostname: None,
            ports: vec![],
            privileged: false,
            pull_policy: PullPolicy::Always,
            resources: Resources { cpus: 0.1, mem: 50.0 },
            constraints: PlacementConstraints::default(),
            scale: 1,
        }
    }

    #[test]
    fn test_defaults_without_labels() {
        let policy = PlacementPolicy::resolve(&service(&[])).unwrap();
        assert_eq!(policy.engine, Engine::Docker);
        assert!(policy.hostname.is_none());
        assert!(policy.matches_host("anything"));
    }

    #[rstest]
    #[case(ENGINE_LABEL, "docker", Engine::Docker)]
    #[case(ENGINE_LABEL, "DOCKER", Engine::Docker)]
    #[case(ENGINE_LABEL, "mesos", Engine::Mesos)]
    #[case(LEGACY_ENGINE_LABEL, "docker", Engine::Docker)]
    #[case(LEGACY_ENGINE_LABEL, "Mesos", Engine::Mesos)]
    fn test_engine_label(#[case] key: &str, #[case] value: &str, #[case] expected: Engine) {
        let policy = PlacementPolicy::resolve(&service(&[(key, value)])).unwrap();
        assert_eq!(policy.engine, expected);
    }

    #[rstest]
    #[case(ENGINE_LABEL)]
    #[case(LEGACY_ENGINE_LABEL)]
    fn test_unknown_engine_rejected(#[case] key: &'static str) {
        let err = PlacementPolicy::resolve(&service(&[(key, "bogus")])).unwrap_err();
        assert_eq!(
            err,
            LabelError::InvalidValue {
                service: "web".into(),
                label: key,
                value: "bogus".into(),
            }
        );
    }

    #[test]
    fn test_conflicting_engine_keys_rejected() {
        let err = PlacementPolicy::resolve(&service(&[(ENGINE_LABEL, "docker"), (LEGACY_ENGINE_LABEL, "mesos")]))
            .unwrap_err();
        assert!(matches!(err, LabelError::InvalidValue { label: LEGACY_ENGINE_LABEL, .. }));

        let policy =
            PlacementPolicy::resolve(&service(&[(ENGINE_LABEL, "mesos"), (LEGACY_ENGINE_LABEL, "MESOS")])).unwrap();
        assert_eq!(policy.engine, Engine::Mesos);
    }

    #[rstest]
    #[case("unique", true)]
    #[case(" UNIQUE ", true)]
    fn test_unique_placement(#[case] value: &str, #[case] unique: bool) {
        let policy = PlacementPolicy::resolve(&service(&[(PLACEMENT_LABEL, value)])).unwrap();
        assert_eq!(policy.unique, unique);
        assert!(!PlacementPolicy::resolve(&service(&[])).unwrap().unique);
        assert!(PlacementPolicy::resolve(&service(&[(PLACEMENT_LABEL, "spread")])).is_err());
    }

    #[test]
    fn test_empty_hostname_rejected() {
        assert!(PlacementPolicy::resolve(&service(&[(HOSTNAME_LABEL, " ")])).is_err());
    }

    #[rstest]
    #[case("nodeA", "nodeA", true)]
    #[case("nodeA", "NODEA", true)]
    #[case("nodeA", "nodeB", false)]
    #[case("node*", "node-12", true)]
    #[case("*.dc1", "a.dc1", true)]
    #[case("*.dc1", "a.dc2", false)]
    #[case("*", "whatever", true)]
    #[case("a*b*c", "aXbYc", true)]
    #[case("a*b*c", "aXbY", false)]
    fn test_host_pattern(#[case] pattern: &str, #[case] host: &str, #[case] expected: bool) {
        assert_eq!(HostPattern::new(pattern).matches(host), expected);
    }

    #[test]
    fn test_label_overrides_constraint() {
        let mut svc = service(&[(HOSTNAME_LABEL, "nodeA")]);
        svc.constraints.hostname = Some("nodeB".into());
        let policy = PlacementPolicy::resolve(&svc).unwrap();
        assert!(policy.matches_host("nodeA"));
        assert!(!policy.matches_host("nodeB"));

        svc.labels.clear();
        let policy = PlacementPolicy::resolve(&svc).unwrap();
        assert!(policy.matches_host("nodeB"));
    }

    #[test]
    fn test_attribute_constraints() {
        let mut svc = service(&[]);
        svc.constraints.os = Some("linux".into());
        let policy = PlacementPolicy::resolve(&svc).unwrap();

        assert!(policy.matches_attributes(|k| (k == "os").then(|| "Linux".to_string())));
        assert!(!policy.matches_attributes(|k| (k == "os").then(|| "windows".to_string())));
        assert!(!policy.matches_attributes(|_| None));
    }

    #[test]
    fn test_recognized_labels() {
        assert!(is_recognized(ENGINE_LABEL));
        assert!(is_recognized(HOSTNAME_LABEL));
        assert!(is_recognized(LEGACY_ENGINE_LABEL));
        assert!(is_recognized(PLACEMENT_LABEL));
        assert!(!is_recognized("team"));
    }
}
