use std::collections::BTreeMap;

use mc_id::validate_service_name;

use super::model::{ComposeFile, ListOrMap, RawService, Scalar, StringOrList};
use super::{
    CommandLine, ComposeDocument, ComposeError, NetworkMode, ParseOptions, PlacementConstraints,
    PortMapping, Protocol, PullPolicy, RestartPolicy, ServiceSpec, VolumeMount,
};
use crate::cluster::Resources;

const SUPPORTED_MAJORS: std::ops::RangeInclusive<u32> = 2..=3;
const DEFAULT_VERSION: &str = "3";

/// Parse and normalize a compose document.
pub fn parse(bytes: &[u8], options: &ParseOptions) -> Result<ComposeDocument, ComposeError> {
    let file: ComposeFile = serde_yaml::from_slice(bytes)
        .map_err(|e| ComposeError::Malformed(format!("invalid YAML: {e}")))?;

    let version = check_version(file.version.as_ref())?;

    if file.services.is_empty() {
        return Err(ComposeError::Malformed("no services defined".to_string()));
    }

    let services = file
        .services
        .iter()
        .map(|(name, raw)| normalize_service(name, raw, &file, options))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ComposeDocument { version, services })
}

fn check_version(version: Option<&Scalar>) -> Result<String, ComposeError> {
    let Some(version) = version else {
        return Ok(DEFAULT_VERSION.to_string());
    };

    let text = version.to_text();
    let major = match version {
        Scalar::Int(n) => u32::try_from(*n).ok(),
        Scalar::Float(f) if *f >= 0.0 => Some(f.trunc() as u32),
        Scalar::Str(s) => s.trim().split('.').next().and_then(|m| m.parse().ok()),
        _ => None,
    };

    match major {
        Some(m) if SUPPORTED_MAJORS.contains(&m) => Ok(text.trim().to_string()),
        _ => Err(ComposeError::UnsupportedVersion(text)),
    }
}

fn normalize_service(
    name: &str,
    raw: &RawService,
    file: &ComposeFile,
    options: &ParseOptions,
) -> Result<ServiceSpec, ComposeError> {
    let malformed = |msg: String| ComposeError::Malformed(format!("service '{name}': {msg}"));

    validate_service_name(name).map_err(|e| malformed(e.to_string()))?;

    let image = raw
        .image
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| malformed("missing required field 'image'".to_string()))?
        .to_string();

    let command = raw.command.as_ref().map(command_line).transpose().map_err(|m| malformed(format!("command {m}")))?;
    let entrypoint = raw
        .entrypoint
        .as_ref()
        .map(command_line)
        .transpose()
        .map_err(|m| malformed(format!("entrypoint {m}")))?;
    if command.is_none() && entrypoint.is_none() {
        return Err(malformed("one of 'command' or 'entrypoint' is required".to_string()));
    }

    let restart = match raw.restart.as_deref() {
        None => RestartPolicy::default(),
        Some(value) => RestartPolicy::parse(value)
            .ok_or_else(|| malformed(format!("unknown restart policy '{value}'")))?,
    };

    let (network, network_name) = network(raw, file).map_err(malformed)?;

    let hostname = if network == NetworkMode::Host {
        None
    } else {
        raw.hostname.clone().or_else(|| raw.container_name.clone())
    };

    let volumes = raw
        .volumes
        .iter()
        .map(|v| volume(v, file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(malformed)?;

    let ports = raw
        .ports
        .iter()
        .map(|p| port(&p.to_text()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(malformed)?;

    let pull_policy = match raw.pull_policy.as_deref().map(|p| p.trim().to_ascii_lowercase()) {
        None => PullPolicy::default(),
        Some(p) if p == "always" => PullPolicy::Always,
        Some(p) if p == "missing" || p == "if_not_present" || p == "never" => PullPolicy::Missing,
        Some(p) => return Err(malformed(format!("unknown pull_policy '{p}'"))),
    };

    let limits = &raw.deploy.resources.limits;
    let cpus = match &limits.cpus {
        None => options.default_cpus,
        Some(value) => positive_number(value).ok_or_else(|| malformed(format!("invalid cpus '{}'", value.to_text())))?,
    };
    let mem = match &limits.memory {
        None => options.default_mem,
        Some(value) => parse_memory(value).ok_or_else(|| malformed(format!("invalid memory '{}'", value.to_text())))?,
    };

    let scale = match &raw.deploy.replicas {
        None => 1,
        Some(value) => replicas(value).ok_or_else(|| malformed(format!("invalid replicas '{}'", value.to_text())))?,
    };

    let constraints = constraints(&raw.deploy.placement.constraints).map_err(malformed)?;

    Ok(ServiceSpec {
        name: name.to_string(),
        image,
        command,
        entrypoint,
        restart,
        volumes,
        environment: environment(raw.environment.as_ref()),
        labels: labels(raw.labels.as_ref()),
        network,
        network_name,
        hostname,
        ports,
        privileged: raw.privileged,
        pull_policy,
        resources: Resources { cpus, mem },
        constraints,
        scale,
    })
}

fn command_line(value: &StringOrList) -> Result<CommandLine, String> {
    match value {
        StringOrList::One(s) if !s.trim().is_empty() => Ok(CommandLine::Shell(s.clone())),
        StringOrList::Many(args) if !args.is_empty() => Ok(CommandLine::Exec(args.clone())),
        _ => Err("must not be empty".to_string()),
    }
}

fn environment(value: Option<&ListOrMap>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    match value {
        None => {}
        // Entries without '=' would inherit from the host; there is no host here.
        Some(ListOrMap::List(items)) => {
            for item in items {
                if let Some((k, v)) = item.split_once('=') {
                    env.insert(k.to_string(), v.to_string());
                }
            }
        }
        Some(ListOrMap::Map(map)) => {
            for (k, v) in map {
                if let Some(v) = v {
                    env.insert(k.clone(), v.to_text());
                }
            }
        }
    }
    env
}

fn labels(value: Option<&ListOrMap>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    match value {
        None => {}
        Some(ListOrMap::List(items)) => {
            for item in items {
                let (k, v) = item.split_once('=').unwrap_or((item.as_str(), ""));
                labels.insert(k.to_string(), v.to_string());
            }
        }
        Some(ListOrMap::Map(map)) => {
            for (k, v) in map {
                labels.insert(k.clone(), v.as_ref().map(Scalar::to_text).unwrap_or_default());
            }
        }
    }
    labels
}

fn network(raw: &RawService, file: &ComposeFile) -> Result<(NetworkMode, Option<String>), String> {
    let selected = raw.networks.as_ref().and_then(|n| n.first());

    let mode = match raw.network_mode.as_deref() {
        Some(mode) => NetworkMode::parse(mode).ok_or_else(|| format!("unsupported network_mode '{mode}'"))?,
        None if selected.is_some() => NetworkMode::User,
        None => NetworkMode::Bridge,
    };

    if mode != NetworkMode::User {
        return Ok((mode, None));
    }

    let name = selected.map(|key| {
        file.networks
            .get(key)
            .and_then(|n| n.as_ref())
            .and_then(|n| n.name.clone())
            .unwrap_or_else(|| key.to_string())
    });
    Ok((mode, name))
}

fn volume(entry: &str, file: &ComposeFile) -> Result<VolumeMount, String> {
    let parts: Vec<&str> = entry.split(':').collect();
    let (source, target, read_only) = match parts.as_slice() {
        [source, target] => (*source, *target, false),
        [source, target, "ro"] => (*source, *target, true),
        [source, target, "rw"] => (*source, *target, false),
        _ => return Err(format!("invalid volume '{entry}', expected source:target[:ro|rw]")),
    };
    if source.is_empty() || target.is_empty() {
        return Err(format!("invalid volume '{entry}'"));
    }

    let driver = file
        .volumes
        .get(source)
        .and_then(|v| v.as_ref())
        .and_then(|v| v.driver.clone());

    Ok(VolumeMount {
        source: source.to_string(),
        target: target.to_string(),
        read_only,
        driver,
    })
}

fn port(entry: &str) -> Result<PortMapping, String> {
    let invalid = || format!("invalid port '{entry}'");

    let (spec, protocol) = match entry.rsplit_once('/') {
        Some((spec, "tcp")) => (spec, Protocol::Tcp),
        Some((spec, "udp")) => (spec, Protocol::Udp),
        Some(_) => return Err(invalid()),
        None => (entry, Protocol::Tcp),
    };

    // [ip:]host:container; an ip prefix is ignored.
    let parts: Vec<&str> = spec.split(':').collect();
    let (host, container) = match parts.as_slice() {
        [container] => (None, *container),
        [host, container] | [_, host, container] => (Some(*host), *container),
        _ => return Err(invalid()),
    };

    let container_port = container.trim().parse().map_err(|_| invalid())?;
    let host_port = match host.map(str::trim).filter(|h| !h.is_empty()) {
        Some(h) => Some(h.parse().map_err(|_| invalid())?),
        None => None,
    };

    Ok(PortMapping {
        container_port,
        host_port,
        protocol,
    })
}

fn positive_number(value: &Scalar) -> Option<f64> {
    let n = match value {
        Scalar::Int(n) => *n as f64,
        Scalar::Float(f) => *f,
        Scalar::Str(s) => s.trim().parse().ok()?,
        Scalar::Bool(_) => return None,
    };
    (n.is_finite() && n > 0.0).then_some(n)
}

fn replicas(value: &Scalar) -> Option<u32> {
    match value {
        Scalar::Int(n) => u32::try_from(*n).ok(),
        Scalar::Str(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Memory in MiB. Bare numbers are MiB; strings may carry a unit.
pub(crate) fn parse_memory(value: &Scalar) -> Option<f64> {
    let mib = match value {
        Scalar::Str(s) => {
            let s = s.trim().to_ascii_lowercase();
            let split = s
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .unwrap_or(s.len());
            let (digits, unit) = s.split_at(split);
            let n: f64 = digits.parse().ok()?;
            match unit.trim() {
                "" | "m" | "mb" | "mib" => n,
                "b" => n / (1024.0 * 1024.0),
                "k" | "kb" | "kib" => n / 1024.0,
                "g" | "gb" | "gib" => n * 1024.0,
                _ => return None,
            }
        }
        other => positive_number(other)?,
    };
    (mib.is_finite() && mib > 0.0).then_some(mib)
}

fn constraints(entries: &[String]) -> Result<PlacementConstraints, String> {
    let mut out = PlacementConstraints::default();
    for entry in entries {
        let Some((key, value)) = entry.split_once("==") else {
            return Err(format!("unsupported placement constraint '{entry}'"));
        };
        let value = value.trim().to_string();
        if value.is_empty() {
            return Err(format!("empty placement constraint '{entry}'"));
        }
        match key.trim() {
            "node.hostname" => out.hostname = Some(value),
            "node.platform.os" => out.os = Some(value),
            "node.platform.arch" => out.arch = Some(value),
            _ => return Err(format!("unsupported placement constraint '{entry}'")),
        }
    }
    Ok(out)
}
