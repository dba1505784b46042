use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::cluster::mesos::MesosConfig;
use crate::compose::ParseOptions;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub mesos: MesosConfig,
    pub store_path: PathBuf,
    pub defaults: ParseOptions,
    pub reconcile_interval: Duration,
    pub reconcile_max_retries: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("MC_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:10000".to_string())
            .parse()
            .context("invalid MC_LISTEN_ADDR")?;

        let log_level = std::env::var("MC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let master = std::env::var("MC_MESOS_MASTER").unwrap_or_else(|_| "127.0.0.1:5050".to_string());

        let ssl = std::env::var("MC_MESOS_SSL")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let mesos = MesosConfig {
            master,
            ssl,
            framework_name: std::env::var("MC_FRAMEWORK_NAME").unwrap_or_else(|_| "mc".to_string()),
            role: std::env::var("MC_FRAMEWORK_ROLE").unwrap_or_else(|_| "mc".to_string()),
            user: std::env::var("MC_FRAMEWORK_USER").unwrap_or_else(|_| "root".to_string()),
            refuse_seconds: env_parse("MC_REFUSE_SECONDS", 5.0)?,
        };

        let store_path = std::env::var("MC_STORE_PATH")
            .unwrap_or_else(|_| "/var/lib/mesos-compose/state.db".to_string())
            .into();

        let defaults = ParseOptions {
            default_cpus: env_parse("MC_DEFAULT_CPU", 0.1)?,
            default_mem: env_parse("MC_DEFAULT_MEMORY", 50.0)?,
        };

        let reconcile_interval =
            Duration::from_secs(env_parse("MC_RECONCILE_INTERVAL_SECS", 1800)?);

        let reconcile_max_retries = env_parse(
            "MC_RECONCILE_MAX_RETRIES",
            mc_reconcile::DEFAULT_MAX_RETRIES,
        )?;

        Ok(Self {
            listen_addr,
            log_level,
            mesos,
            store_path,
            defaults,
            reconcile_interval,
            reconcile_max_retries,
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {key}: {raw}")),
        Err(_) => Ok(default),
    }
}
