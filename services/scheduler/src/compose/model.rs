//! Raw compose document shape, as deserialized from YAML.
//!
//! Compose allows several spellings for the same field (string or list,
//! list or map). These types accept all of them; the parser normalizes.

use std::collections::BTreeMap;

use serde::Deserialize;

/// A YAML scalar that may arrive as a number, string or bool.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    pub fn to_text(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Int(n) => n.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Str(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ListOrMap {
    List(Vec<String>),
    Map(BTreeMap<String, Option<Scalar>>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NetworkSelection {
    List(Vec<String>),
    Map(BTreeMap<String, serde_yaml::Value>),
}

impl NetworkSelection {
    /// First selected network; maps are ordered by name.
    pub fn first(&self) -> Option<&str> {
        match self {
            Self::List(names) => names.first().map(String::as_str),
            Self::Map(map) => map.keys().next().map(String::as_str),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComposeFile {
    #[serde(default)]
    pub version: Option<Scalar>,
    #[serde(default)]
    pub services: BTreeMap<String, RawService>,
    #[serde(default)]
    pub volumes: BTreeMap<String, Option<RawVolume>>,
    #[serde(default)]
    pub networks: BTreeMap<String, Option<RawNetwork>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawService {
    pub image: Option<String>,
    pub command: Option<StringOrList>,
    pub entrypoint: Option<StringOrList>,
    pub restart: Option<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    pub environment: Option<ListOrMap>,
    pub labels: Option<ListOrMap>,
    pub network_mode: Option<String>,
    pub networks: Option<NetworkSelection>,
    pub hostname: Option<String>,
    pub container_name: Option<String>,
    #[serde(default)]
    pub ports: Vec<Scalar>,
    #[serde(default)]
    pub privileged: bool,
    pub pull_policy: Option<String>,
    #[serde(default)]
    pub deploy: RawDeploy,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDeploy {
    pub replicas: Option<Scalar>,
    #[serde(default)]
    pub resources: RawResources,
    #[serde(default)]
    pub placement: RawPlacement,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawResources {
    #[serde(default)]
    pub limits: RawLimits,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLimits {
    pub cpus: Option<Scalar>,
    pub memory: Option<Scalar>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPlacement {
    #[serde(default)]
    pub constraints: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawVolume {
    pub driver: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawNetwork {
    pub name: Option<String>,
}
