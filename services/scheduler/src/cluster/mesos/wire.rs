//! JSON encoding of the Mesos v1 scheduler API.
//!
//! Calls are built as `serde_json::Value`s using the protobuf field names
//! Mesos expects. Events and master task listings are decoded into the
//! scheduler's own types; fields the scheduler does not use are skipped.

use std::collections::BTreeMap;
use std::time::Duration;

use mc_id::{AgentId, FrameworkId, OfferId};
use mc_reconcile::SpecHash;
use serde::Deserialize;
use serde_json::{json, Value};

use super::MesosConfig;
use crate::cluster::{
    ClusterTask, ClusterTaskState, DriverError, LaunchSpec, Offer, Resources, SchedulerEvent,
    TaskStatus, SPEC_HASH_LABEL,
};
use crate::compose::{CommandLine, NetworkMode, PullPolicy};
use crate::labels::{self, Engine};

/// Failover timeout registered with the master: one week.
const FAILOVER_TIMEOUT_SECS: f64 = 7.0 * 24.0 * 3600.0;

// =============================================================================
// Calls
// =============================================================================

pub fn subscribe_call(config: &MesosConfig, framework_id: Option<&FrameworkId>) -> Value {
    let mut framework_info = json!({
        "user": config.user,
        "name": config.framework_name,
        "roles": [config.role],
        "capabilities": [{"type": "MULTI_ROLE"}],
        "failover_timeout": FAILOVER_TIMEOUT_SECS,
    });
    let mut call = json!({
        "type": "SUBSCRIBE",
        "subscribe": {},
    });
    if let Some(id) = framework_id {
        framework_info["id"] = json!({"value": id.as_str()});
        call["framework_id"] = json!({"value": id.as_str()});
    }
    call["subscribe"]["framework_info"] = framework_info;
    call
}

pub fn accept_call(framework_id: &FrameworkId, offer: &Offer, launch: &LaunchSpec, refuse_seconds: f64) -> Value {
    json!({
        "framework_id": {"value": framework_id.as_str()},
        "type": "ACCEPT",
        "accept": {
            "offer_ids": [{"value": offer.id.as_str()}],
            "operations": [{
                "type": "LAUNCH",
                "launch": {"task_infos": [task_info(launch)]},
            }],
            "filters": {"refuse_seconds": refuse_seconds},
        },
    })
}

pub fn decline_call(framework_id: &FrameworkId, offers: &[OfferId], refuse_seconds: f64) -> Value {
    let ids: Vec<Value> = offers.iter().map(|id| json!({"value": id.as_str()})).collect();
    json!({
        "framework_id": {"value": framework_id.as_str()},
        "type": "DECLINE",
        "decline": {
            "offer_ids": ids,
            "filters": {"refuse_seconds": refuse_seconds},
        },
    })
}

pub fn kill_call(framework_id: &FrameworkId, task_id: &str, agent_id: Option<&AgentId>) -> Value {
    let mut kill = json!({"task_id": {"value": task_id}});
    if let Some(agent) = agent_id {
        kill["agent_id"] = json!({"value": agent.as_str()});
    }
    json!({
        "framework_id": {"value": framework_id.as_str()},
        "type": "KILL",
        "kill": kill,
    })
}

/// Returns `None` for updates that carry nothing to acknowledge.
pub fn acknowledge_call(framework_id: &FrameworkId, status: &TaskStatus) -> Option<Value> {
    let uuid = status.uuid.as_deref()?;
    let agent = status.agent_id.as_ref()?;
    Some(json!({
        "framework_id": {"value": framework_id.as_str()},
        "type": "ACKNOWLEDGE",
        "acknowledge": {
            "agent_id": {"value": agent.as_str()},
            "task_id": {"value": status.task_id},
            "uuid": uuid,
        },
    }))
}

pub fn reconcile_call(framework_id: &FrameworkId) -> Value {
    json!({
        "framework_id": {"value": framework_id.as_str()},
        "type": "RECONCILE",
        "reconcile": {"tasks": []},
    })
}

pub fn simple_call(framework_id: &FrameworkId, call_type: &str) -> Value {
    json!({
        "framework_id": {"value": framework_id.as_str()},
        "type": call_type,
    })
}

fn scalar(name: &str, value: f64) -> Value {
    json!({"name": name, "type": "SCALAR", "scalar": {"value": value}})
}

/// Build the `TaskInfo` for a launch.
pub fn task_info(launch: &LaunchSpec) -> Value {
    let spec = &launch.service.spec;
    let policy = &launch.service.policy;

    let mut resources = vec![
        scalar("cpus", launch.resources.cpus),
        scalar("mem", launch.resources.mem),
    ];
    let host_ports: Vec<u16> = spec.ports.iter().filter_map(|p| p.host_port).collect();
    if !host_ports.is_empty() {
        let ranges: Vec<Value> = host_ports
            .iter()
            .map(|p| json!({"begin": p, "end": p}))
            .collect();
        resources.push(json!({"name": "ports", "type": "RANGES", "ranges": {"range": ranges}}));
    }

    let variables: Vec<Value> = spec
        .environment
        .iter()
        .map(|(k, v)| json!({"name": k, "value": v}))
        .collect();

    let mut command = json!({
        "shell": false,
        "environment": {"variables": variables},
    });
    match spec.effective_command() {
        Some(CommandLine::Shell(line)) => {
            command["shell"] = json!(true);
            command["value"] = json!(line);
        }
        Some(CommandLine::Exec(argv)) => {
            if let Some(first) = argv.first() {
                command["value"] = json!(first);
            }
            command["arguments"] = json!(argv);
        }
        None => {}
    }

    let volumes: Vec<Value> = spec
        .volumes
        .iter()
        .map(|v| {
            let mode = if v.read_only { "RO" } else { "RW" };
            match &v.driver {
                Some(driver) => json!({
                    "container_path": v.target,
                    "mode": mode,
                    "source": {
                        "type": "DOCKER_VOLUME",
                        "docker_volume": {"driver": driver, "name": v.source},
                    },
                }),
                None => json!({"container_path": v.target, "host_path": v.source, "mode": mode}),
            }
        })
        .collect();

    let mut container = json!({"volumes": volumes});
    match policy.engine {
        Engine::Docker => {
            let port_mappings: Vec<Value> = spec
                .ports
                .iter()
                .filter_map(|p| {
                    p.host_port.map(|host| {
                        json!({
                            "host_port": host,
                            "container_port": p.container_port,
                            "protocol": serde_json::to_value(p.protocol).unwrap_or(json!("tcp")),
                        })
                    })
                })
                .collect();
            container["type"] = json!("DOCKER");
            container["docker"] = json!({
                "image": spec.image,
                "network": docker_network(spec.network),
                "privileged": spec.privileged,
                "force_pull_image": spec.pull_policy == PullPolicy::Always,
                "port_mappings": port_mappings,
            });
        }
        Engine::Mesos => {
            container["type"] = json!("MESOS");
            container["mesos"] = json!({
                "image": {
                    "type": "DOCKER",
                    "cached": spec.pull_policy == PullPolicy::Missing,
                    "docker": {"name": spec.image},
                },
            });
        }
    }
    if let Some(hostname) = &spec.hostname {
        container["hostname"] = json!(hostname);
    }
    if let Some(network) = &spec.network_name {
        container["network_infos"] = json!([{"name": network}]);
    }

    let mut task_labels: Vec<Value> = spec
        .labels
        .iter()
        .filter(|(k, _)| !labels::is_recognized(k))
        .map(|(k, v)| json!({"key": k, "value": v}))
        .collect();
    task_labels.push(json!({"key": SPEC_HASH_LABEL, "value": launch.service.spec_hash.as_str()}));

    json!({
        "name": format!("{}:{}", launch.task_id.project(), launch.task_id.service()),
        "task_id": {"value": launch.task_id.to_string()},
        "agent_id": {"value": launch.agent_id.as_str()},
        "resources": resources,
        "command": command,
        "container": container,
        "labels": {"labels": task_labels},
    })
}

fn docker_network(mode: NetworkMode) -> &'static str {
    match mode {
        NetworkMode::Bridge => "BRIDGE",
        NetworkMode::Host => "HOST",
        NetworkMode::None => "NONE",
        NetworkMode::User => "USER",
    }
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Deserialize)]
struct ValueWrapper {
    value: String,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    subscribed: Option<RawSubscribed>,
    offers: Option<RawOffers>,
    rescind: Option<RawRescind>,
    update: Option<RawUpdate>,
    error: Option<RawError>,
}

#[derive(Debug, Deserialize)]
struct RawSubscribed {
    framework_id: ValueWrapper,
    heartbeat_interval_seconds: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawOffers {
    #[serde(default)]
    offers: Vec<RawOffer>,
}

#[derive(Debug, Deserialize)]
struct RawOffer {
    id: ValueWrapper,
    agent_id: ValueWrapper,
    hostname: String,
    #[serde(default)]
    resources: Vec<RawResource>,
    #[serde(default)]
    attributes: Vec<RawAttribute>,
}

#[derive(Debug, Deserialize)]
struct RawResource {
    name: String,
    scalar: Option<RawScalar>,
}

#[derive(Debug, Deserialize)]
struct RawScalar {
    value: f64,
}

#[derive(Debug, Deserialize)]
struct RawAttribute {
    name: String,
    text: Option<ValueWrapper>,
    scalar: Option<RawScalar>,
}

#[derive(Debug, Deserialize)]
struct RawRescind {
    offer_id: ValueWrapper,
}

#[derive(Debug, Deserialize)]
struct RawUpdate {
    status: RawStatus,
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    task_id: ValueWrapper,
    state: String,
    agent_id: Option<ValueWrapper>,
    message: Option<String>,
    uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawError {
    message: String,
}

/// Decode one event record. Event types the scheduler ignores yield `None`.
pub fn parse_event(record: &[u8]) -> Result<Option<SchedulerEvent>, DriverError> {
    let event: RawEvent =
        serde_json::from_slice(record).map_err(|e| DriverError::Decode(format!("event: {e}")))?;

    let missing = |field: &str| DriverError::Decode(format!("{} event without '{field}'", event.kind));

    let parsed = match event.kind.as_str() {
        "SUBSCRIBED" => {
            let sub = event.subscribed.as_ref().ok_or_else(|| missing("subscribed"))?;
            SchedulerEvent::Subscribed {
                framework_id: FrameworkId::parse(&sub.framework_id.value)
                    .map_err(|e| DriverError::Decode(e.to_string()))?,
                heartbeat_interval: sub
                    .heartbeat_interval_seconds
                    .filter(|s| s.is_finite() && *s > 0.0)
                    .map(Duration::from_secs_f64),
            }
        }
        "OFFERS" => {
            let offers = event.offers.as_ref().ok_or_else(|| missing("offers"))?;
            SchedulerEvent::Offers(offers.offers.iter().filter_map(convert_offer).collect())
        }
        "RESCIND" => {
            let rescind = event.rescind.as_ref().ok_or_else(|| missing("rescind"))?;
            match OfferId::parse(&rescind.offer_id.value) {
                Ok(id) => SchedulerEvent::Rescind(id),
                Err(_) => return Ok(None),
            }
        }
        "UPDATE" => {
            let update = event.update.as_ref().ok_or_else(|| missing("update"))?;
            let status = &update.status;
            SchedulerEvent::Update(TaskStatus {
                task_id: status.task_id.value.clone(),
                state: ClusterTaskState::from_mesos(&status.state),
                agent_id: status.agent_id.as_ref().and_then(|a| AgentId::parse(&a.value).ok()),
                message: status.message.clone(),
                uuid: status.uuid.clone(),
            })
        }
        "HEARTBEAT" => SchedulerEvent::Heartbeat,
        "ERROR" => SchedulerEvent::Error(
            event.error.map(|e| e.message).unwrap_or_else(|| "unknown error".to_string()),
        ),
        _ => return Ok(None),
    };

    Ok(Some(parsed))
}

fn convert_offer(raw: &RawOffer) -> Option<Offer> {
    let mut resources = Resources::default();
    for r in &raw.resources {
        let Some(scalar) = &r.scalar else { continue };
        match r.name.as_str() {
            "cpus" => resources.cpus += scalar.value,
            "mem" => resources.mem += scalar.value,
            _ => {}
        }
    }

    let attributes: BTreeMap<String, String> = raw
        .attributes
        .iter()
        .filter_map(|a| {
            let value = match (&a.text, &a.scalar) {
                (Some(text), _) => text.value.clone(),
                (None, Some(scalar)) => scalar.value.to_string(),
                (None, None) => return None,
            };
            Some((a.name.clone(), value))
        })
        .collect();

    Some(Offer {
        id: OfferId::parse(&raw.id.value).ok()?,
        agent_id: AgentId::parse(&raw.agent_id.value).ok()?,
        hostname: raw.hostname.clone(),
        resources,
        attributes,
    })
}

// =============================================================================
// Master task listing
// =============================================================================

#[derive(Debug, Deserialize)]
struct MasterTasks {
    #[serde(default)]
    tasks: Vec<MasterTask>,
}

#[derive(Debug, Deserialize)]
struct MasterTask {
    id: String,
    state: String,
    slave_id: Option<String>,
    resources: Option<MasterResources>,
    #[serde(default)]
    labels: Vec<MasterLabel>,
}

#[derive(Debug, Deserialize)]
struct MasterResources {
    #[serde(default)]
    cpus: f64,
    #[serde(default)]
    mem: f64,
}

#[derive(Debug, Deserialize)]
struct MasterLabel {
    key: String,
    #[serde(default)]
    value: String,
}

/// Decode the master's `/tasks` response.
pub fn parse_master_tasks(body: &[u8]) -> Result<Vec<ClusterTask>, DriverError> {
    let listing: MasterTasks =
        serde_json::from_slice(body).map_err(|e| DriverError::Decode(format!("tasks: {e}")))?;

    Ok(listing
        .tasks
        .into_iter()
        .map(|t| ClusterTask {
            spec_hash: t
                .labels
                .iter()
                .find(|l| l.key == SPEC_HASH_LABEL)
                .map(|l| SpecHash::from_raw(l.value.clone())),
            task_id: t.id,
            state: ClusterTaskState::from_mesos(&t.state),
            agent_id: t.slave_id.as_deref().and_then(|a| AgentId::parse(a).ok()),
            hostname: None,
            resources: t.resources.map(|r| Resources { cpus: r.cpus, mem: r.mem }),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mc_id::TaskId;

    use super::*;
    use crate::compose::{parse, ParseOptions};
    use crate::desired::ResolvedService;

    fn config() -> MesosConfig {
        MesosConfig {
            master: "127.0.0.1:5050".into(),
            ssl: false,
            framework_name: "mc".into(),
            role: "mc".into(),
            user: "root".into(),
            refuse_seconds: 5.0,
        }
    }

    fn launch(yaml: &str) -> LaunchSpec {
        let spec = parse(yaml.as_bytes(), &ParseOptions::default())
            .unwrap()
            .services
            .remove(0);
        let service = Arc::new(ResolvedService::resolve(spec).unwrap());
        LaunchSpec {
            task_id: TaskId::new("shop", service.name()).unwrap(),
            agent_id: AgentId::parse("agent-1").unwrap(),
            resources: service.spec.resources,
            service,
        }
    }

    #[test]
    fn test_subscribe_call_includes_framework_id_on_resubscribe() {
        let first = subscribe_call(&config(), None);
        assert_eq!(first["type"], "SUBSCRIBE");
        assert!(first.get("framework_id").is_none());
        assert_eq!(first["subscribe"]["framework_info"]["roles"][0], "mc");

        let id = FrameworkId::parse("fw-1").unwrap();
        let again = subscribe_call(&config(), Some(&id));
        assert_eq!(again["framework_id"]["value"], "fw-1");
        assert_eq!(again["subscribe"]["framework_info"]["id"]["value"], "fw-1");
    }

    #[test]
    fn test_task_info_docker() {
        let launch = launch(
            r#"
services:
  web:
    image: nginx:1.27
    command: ["nginx", "-g", "daemon off;"]
    environment: {MODE: prod}
    labels:
      team: web
      mesos_compose.placement.hostname: nodeA
    ports: ["8080:80"]
    volumes: ["/srv/data:/data:ro"]
"#,
        );
        let info = task_info(&launch);

        assert_eq!(info["task_id"]["value"], launch.task_id.to_string());
        assert_eq!(info["name"], "shop:web");
        assert_eq!(info["container"]["type"], "DOCKER");
        assert_eq!(info["container"]["docker"]["image"], "nginx:1.27");
        assert_eq!(info["container"]["docker"]["network"], "BRIDGE");
        assert_eq!(info["container"]["docker"]["port_mappings"][0]["host_port"], 8080);
        assert_eq!(info["container"]["volumes"][0]["mode"], "RO");
        assert_eq!(info["command"]["shell"], false);
        assert_eq!(info["command"]["arguments"][2], "daemon off;");
        assert_eq!(info["command"]["environment"]["variables"][0]["name"], "MODE");

        let labels = info["labels"]["labels"].as_array().unwrap();
        let keys: Vec<&str> = labels.iter().filter_map(|l| l["key"].as_str()).collect();
        assert!(keys.contains(&"team"));
        assert!(keys.contains(&SPEC_HASH_LABEL));
        assert!(!keys.contains(&crate::labels::HOSTNAME_LABEL));
    }

    #[test]
    fn test_task_info_mesos_engine_shell_command() {
        let launch = launch(
            "services:\n  job:\n    image: busybox\n    command: echo hi\n    labels: ['mesos_compose.container_type=mesos']\n",
        );
        let info = task_info(&launch);
        assert_eq!(info["container"]["type"], "MESOS");
        assert_eq!(info["container"]["mesos"]["image"]["docker"]["name"], "busybox");
        assert_eq!(info["command"]["shell"], true);
        assert_eq!(info["command"]["value"], "echo hi");
    }

    #[test]
    fn test_parse_offers_event() {
        let record = br#"{
            "type": "OFFERS",
            "offers": {"offers": [{
                "id": {"value": "O-1"},
                "agent_id": {"value": "S-1"},
                "framework_id": {"value": "fw-1"},
                "hostname": "nodeA",
                "resources": [
                    {"name": "cpus", "type": "SCALAR", "scalar": {"value": 2.0}},
                    {"name": "mem", "type": "SCALAR", "scalar": {"value": 1024.0}},
                    {"name": "ports", "type": "RANGES", "ranges": {"range": [{"begin": 31000, "end": 32000}]}}
                ],
                "attributes": [{"name": "os", "type": "TEXT", "text": {"value": "linux"}}]
            }]}
        }"#;

        let Some(SchedulerEvent::Offers(offers)) = parse_event(record).unwrap() else {
            panic!("expected offers");
        };
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].hostname, "nodeA");
        assert_eq!(offers[0].resources, Resources { cpus: 2.0, mem: 1024.0 });
        assert_eq!(offers[0].attribute("os").as_deref(), Some("linux"));
    }

    #[test]
    fn test_parse_update_and_subscribed_events() {
        let update = br#"{"type":"UPDATE","update":{"status":{
            "task_id":{"value":"shop:web.01HV4Z2WQXKJNM8GPQY6VBKC3D"},
            "state":"TASK_RUNNING","agent_id":{"value":"S-1"},"uuid":"YWJj"}}}"#;
        let Some(SchedulerEvent::Update(status)) = parse_event(update).unwrap() else {
            panic!("expected update");
        };
        assert_eq!(status.state, ClusterTaskState::Running);
        assert_eq!(status.uuid.as_deref(), Some("YWJj"));

        let id = FrameworkId::parse("fw-1").unwrap();
        let ack = acknowledge_call(&id, &status).unwrap();
        assert_eq!(ack["acknowledge"]["uuid"], "YWJj");

        let subscribed = br#"{"type":"SUBSCRIBED","subscribed":{"framework_id":{"value":"fw-9"},"heartbeat_interval_seconds":15}}"#;
        assert!(matches!(
            parse_event(subscribed).unwrap(),
            Some(SchedulerEvent::Subscribed { heartbeat_interval: Some(d), .. }) if d == Duration::from_secs(15)
        ));

        assert!(parse_event(br#"{"type":"MESSAGE"}"#).unwrap().is_none());
        assert!(parse_event(b"not json").is_err());
    }

    #[test]
    fn test_parse_master_tasks() {
        let body = br#"{"tasks":[{
            "id":"shop:web.01HV4Z2WQXKJNM8GPQY6VBKC3D",
            "name":"shop:web",
            "framework_id":"fw-1",
            "slave_id":"S-1",
            "state":"TASK_RUNNING",
            "resources":{"cpus":0.1,"mem":50.0,"disk":0.0},
            "labels":[{"key":"mesos_compose.spec_hash","value":"sha256:abc"}]
        }]}"#;
        let tasks = parse_master_tasks(body).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].state, ClusterTaskState::Running);
        assert_eq!(tasks[0].spec_hash, Some(SpecHash::from_raw("sha256:abc")));
        assert_eq!(tasks[0].agent_id.as_ref().map(|a| a.as_str()), Some("S-1"));
    }
}
