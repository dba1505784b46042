//! Resolved desired state for a service.

use std::sync::Arc;

use mc_reconcile::SpecHash;

use crate::compose::ServiceSpec;
use crate::error::SchedulerError;
use crate::labels::PlacementPolicy;

/// A service definition with its placement policy and spec hash resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedService {
    pub spec: ServiceSpec,
    pub policy: PlacementPolicy,
    pub spec_hash: SpecHash,
}

impl ResolvedService {
    pub fn resolve(spec: ServiceSpec) -> Result<Self, SchedulerError> {
        let policy = PlacementPolicy::resolve(&spec)?;
        let spec_hash = spec_hash(&spec)?;
        Ok(Self {
            spec,
            policy,
            spec_hash,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn scale(&self) -> u32 {
        self.spec.scale
    }
}

/// Resolve every service of a document, failing on the first bad one.
pub fn resolve_all(specs: Vec<ServiceSpec>) -> Result<Vec<Arc<ResolvedService>>, SchedulerError> {
    specs
        .into_iter()
        .map(|spec| ResolvedService::resolve(spec).map(Arc::new))
        .collect()
}

/// Hash of every launch-relevant field. Scale is excluded so that scaling
/// never replaces tasks.
pub fn spec_hash(spec: &ServiceSpec) -> Result<SpecHash, SchedulerError> {
    let mut value = serde_json::to_value(spec)
        .map_err(|e| SchedulerError::Unspecified(format!("serialize service spec: {e}")))?;
    if let Some(map) = value.as_object_mut() {
        map.remove("scale");
    }
    Ok(SpecHash::from_json(&value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::{parse, ParseOptions};
    use crate::labels::Engine;

    fn spec(yaml: &str) -> ServiceSpec {
        parse(yaml.as_bytes(), &ParseOptions::default())
            .unwrap()
            .services
            .remove(0)
    }

    #[test]
    fn test_scale_does_not_change_hash() {
        let a = spec("services:\n  web:\n    image: alpine:3.19\n    command: y\n");
        let mut b = a.clone();
        b.scale = 5;
        assert_eq!(spec_hash(&a).unwrap(), spec_hash(&b).unwrap());
    }

    #[test]
    fn test_image_changes_hash() {
        let a = spec("services:\n  web:\n    image: alpine:3.19\n    command: y\n");
        let b = spec("services:\n  web:\n    image: alpine:3.20\n    command: y\n");
        assert_ne!(spec_hash(&a).unwrap(), spec_hash(&b).unwrap());
    }

    #[test]
    fn test_resolve_rejects_bad_engine() {
        let s = spec(
            "services:\n  web:\n    image: x\n    command: y\n    labels:\n      mesos_compose.container_type: bogus\n",
        );
        let err = ResolvedService::resolve(s).unwrap_err();
        assert_eq!(err.kind(), "invalid_label_value");
    }

    #[test]
    fn test_resolve_all() {
        let doc = parse(
            b"services:\n  a:\n    image: x\n    command: y\n  b:\n    image: x\n    command: y\n    labels: ['mesos_compose.container_type=mesos']\n",
            &ParseOptions::default(),
        )
        .unwrap();
        let resolved = resolve_all(doc.services).unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[1].policy.engine, Engine::Mesos);
    }
}
