//! Typed ID definitions.
//!
//! `TaskId` is generated by the scheduler and carries its owning project and
//! service. The remaining IDs are opaque values minted by Mesos.

use std::fmt;
use std::str::FromStr;

use crate::{define_external_id, IdError, Ulid};

/// Maximum length accepted for project and service names.
pub const MAX_NAME_LEN: usize = 128;

// =============================================================================
// Names
// =============================================================================

/// Validates a project name: `[A-Za-z0-9_-]+`.
pub fn validate_project_name(name: &str) -> Result<(), IdError> {
    validate_name("project", name, |c| {
        c.is_ascii_alphanumeric() || c == '_' || c == '-'
    })
}

/// Validates a service name: `[A-Za-z0-9_.-]+`.
pub fn validate_service_name(name: &str) -> Result<(), IdError> {
    validate_name("service", name, |c| {
        c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'
    })
}

fn validate_name(kind: &'static str, name: &str, allowed: impl Fn(char) -> bool) -> Result<(), IdError> {
    if name.is_empty() {
        return Err(IdError::Empty);
    }
    if name.len() > MAX_NAME_LEN || !name.chars().all(allowed) {
        return Err(IdError::InvalidName {
            kind,
            value: name.to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Task ID
// =============================================================================

/// Identifier of one task instance of a compose service.
///
/// Ordering is by project, then service, then ULID. The ULID is only
/// millisecond-ordered, so callers that need strict creation order keep
/// their own sequence number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId {
    project: String,
    service: String,
    ulid: Ulid,
}

impl TaskId {
    /// Generates a fresh task ID for the given owner.
    pub fn new(project: &str, service: &str) -> Result<Self, IdError> {
        Self::from_parts(project, service, Ulid::new())
    }

    /// Builds a task ID from its parts, validating both names.
    pub fn from_parts(project: &str, service: &str, ulid: Ulid) -> Result<Self, IdError> {
        validate_project_name(project)?;
        validate_service_name(service)?;
        Ok(Self {
            project: project.to_string(),
            service: service.to_string(),
            ulid,
        })
    }

    /// Parses a task ID from `{project}:{service}.{ulid}`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let Some((owner, ulid_str)) = s.rsplit_once('.') else {
            return Err(IdError::MissingSeparator);
        };

        let Some((project, service)) = owner.split_once(':') else {
            return Err(IdError::MissingOwnerSeparator);
        };

        let ulid = ulid_str
            .parse::<Ulid>()
            .map_err(|e| IdError::InvalidUlid(e.to_string()))?;

        Self::from_parts(project, service, ulid)
    }

    /// Owning project name.
    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Owning service name.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn ulid(&self) -> Ulid {
        self.ulid
    }

    /// Returns true if this task belongs to the given project and service.
    #[must_use]
    pub fn belongs_to(&self, project: &str, service: &str) -> bool {
        self.project == project && self.service == service
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.project, self.service, self.ulid)
    }
}

impl FromStr for TaskId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for TaskId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for TaskId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Cluster-assigned IDs
// =============================================================================

define_external_id!(OfferId);
define_external_id!(AgentId);
define_external_id!(FrameworkId);

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_task_id_roundtrip() {
        let id = TaskId::new("shop", "web").unwrap();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(parsed.project(), "shop");
        assert_eq!(parsed.service(), "web");
    }

    #[test]
    fn test_task_id_format() {
        let ulid: Ulid = "01HV4Z2WQXKJNM8GPQY6VBKC3D".parse().unwrap();
        let id = TaskId::from_parts("shop", "web", ulid).unwrap();
        assert_eq!(id.to_string(), "shop:web.01HV4Z2WQXKJNM8GPQY6VBKC3D");
    }

    #[test]
    fn test_task_id_dotted_service() {
        let id: TaskId = "billing:worker.queue.01HV4Z3MXNKPQR9HSTZ7WCLD4E"
            .parse()
            .unwrap();
        assert_eq!(id.project(), "billing");
        assert_eq!(id.service(), "worker.queue");
        assert!(id.belongs_to("billing", "worker.queue"));
        assert!(!id.belongs_to("billing", "worker"));
    }

    #[test]
    fn test_task_id_missing_separator() {
        let result: Result<TaskId, _> = "shop:web.notaulid".parse();
        assert!(matches!(result.unwrap_err(), IdError::InvalidUlid(_)));

        let result: Result<TaskId, _> = "shopweb01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result.unwrap_err(), IdError::MissingSeparator));
    }

    #[test]
    fn test_task_id_missing_owner_separator() {
        let result: Result<TaskId, _> = "shop_web.01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            IdError::MissingOwnerSeparator
        ));
    }

    #[test]
    fn test_task_id_empty() {
        let result: Result<TaskId, _> = "".parse();
        assert!(result.unwrap_err().is_empty());
    }

    #[test]
    fn test_task_id_rejects_bad_names() {
        assert!(TaskId::new("my project", "web").unwrap_err().is_name_error());
        assert!(TaskId::new("shop", "web/1").unwrap_err().is_name_error());
        assert!(TaskId::new("sh.op", "web").unwrap_err().is_name_error());
        assert!(TaskId::new("", "web").unwrap_err().is_empty());
    }

    #[test]
    fn test_task_id_json_roundtrip() {
        let id = TaskId::new("shop", "web").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_external_id_rejects_empty() {
        assert!(OfferId::parse("").is_err());
        assert!(AgentId::parse("   ").is_err());
        assert_eq!(OfferId::parse("O-1").unwrap().as_str(), "O-1");
    }

    #[test]
    fn test_external_id_serde_transparent() {
        let id = AgentId::parse("S0").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"S0\"");
        let back: FrameworkId = serde_json::from_str("\"fw-1\"").unwrap();
        assert_eq!(back.as_str(), "fw-1");
    }

    proptest! {
        #[test]
        fn prop_task_id_roundtrip(
            project in "[A-Za-z0-9_-]{1,32}",
            service in "[A-Za-z0-9_.-]{1,32}",
        ) {
            let id = TaskId::new(&project, &service).unwrap();
            let parsed = TaskId::parse(&id.to_string()).unwrap();
            prop_assert_eq!(parsed.project(), project.as_str());
            prop_assert_eq!(parsed.service(), service.as_str());
            prop_assert_eq!(parsed, id);
        }
    }
}
