//! Compose document parsing.
//!
//! A compose document is turned into a list of [`ServiceSpec`] values with
//! all defaults applied. Parsing has no side effects; an error rejects the
//! whole document.

mod model;
mod parser;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::Resources;

pub use parser::parse;

/// Compose file format versions accepted by the parser.
pub const SUPPORTED_VERSIONS: &[&str] = &["2", "3"];

/// Errors produced while parsing a compose document.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ComposeError {
    #[error("malformed compose spec: {0}")]
    Malformed(String),

    #[error("unsupported compose version '{0}' (supported: 2.x, 3.x)")]
    UnsupportedVersion(String),
}

/// Defaults applied to services that omit resource limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParseOptions {
    pub default_cpus: f64,
    pub default_mem: f64,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            default_cpus: 0.1,
            default_mem: 50.0,
        }
    }
}

/// A parsed compose document.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposeDocument {
    /// Declared schema version, normalized (e.g. `"3.8"`).
    pub version: String,
    /// Services ordered by name.
    pub services: Vec<ServiceSpec>,
}

/// A normalized service definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<CommandLine>,
    pub restart: RestartPolicy,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub network: NetworkMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub privileged: bool,
    pub pull_policy: PullPolicy,
    pub resources: Resources,
    #[serde(default)]
    pub constraints: PlacementConstraints,
    pub scale: u32,
}

impl ServiceSpec {
    /// The command the task runs: the entrypoint followed by the command.
    pub fn effective_command(&self) -> Option<CommandLine> {
        match (&self.entrypoint, &self.command) {
            (None, None) => None,
            (None, Some(cmd)) => Some(cmd.clone()),
            (Some(entry), None) => Some(entry.clone()),
            (Some(entry), Some(cmd)) => {
                let mut argv = entry.argv();
                argv.extend(cmd.argv());
                Some(CommandLine::Exec(argv))
            }
        }
    }
}

/// A command given either as a shell string or as an argv list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandLine {
    Shell(String),
    Exec(Vec<String>),
}

impl CommandLine {
    fn argv(&self) -> Vec<String> {
        match self {
            Self::Shell(s) => vec![s.clone()],
            Self::Exec(args) => args.clone(),
        }
    }
}

/// What to do when a task ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    #[default]
    Always,
    OnFailure,
    UnlessStopped,
}

impl RestartPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        // Docker allows a retry count suffix; retries are not bounded here.
        let name = s.split_once(':').map_or(s.as_str(), |(n, _)| n);
        match name {
            "no" => Some(Self::No),
            "always" => Some(Self::Always),
            "on-failure" => Some(Self::OnFailure),
            "unless-stopped" => Some(Self::UnlessStopped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    Bridge,
    Host,
    None,
    User,
}

impl NetworkMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bridge" | "default" => Some(Self::Bridge),
            "host" => Some(Self::Host),
            "none" => Some(Self::None),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    #[default]
    Always,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(default)]
    pub protocol: Protocol,
}

/// `deploy.placement.constraints`, reduced to the keys the scheduler honors.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlacementConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
}
