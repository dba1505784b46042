//! Mesos v1 scheduler HTTP API driver.
//!
//! One long-lived `SUBSCRIBE` request carries the event stream; every other
//! call is a separate `POST /api/v1/scheduler` tagged with the
//! `Mesos-Stream-Id` the master handed out on subscription.

mod recordio;
pub mod wire;

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use mc_id::{AgentId, FrameworkId, OfferId};
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, instrument, warn};

use super::{ClusterDriver, ClusterTask, DriverError, LaunchSpec, Offer, SchedulerEvent, TaskStatus};

pub use recordio::RecordIoDecoder;

const STREAM_ID_HEADER: &str = "Mesos-Stream-Id";
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);
/// Missed heartbeats before the stream is considered dead.
const MISSED_HEARTBEATS: u32 = 5;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Connection and framework registration settings.
#[derive(Debug, Clone)]
pub struct MesosConfig {
    /// Master `host:port`.
    pub master: String,
    pub ssl: bool,
    pub framework_name: String,
    pub role: String,
    pub user: String,
    /// Seconds the master withholds a declined offer's resources.
    pub refuse_seconds: f64,
}

impl MesosConfig {
    pub fn base_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{scheme}://{}", self.master.trim_end_matches('/'))
    }
}

#[derive(Debug, Default)]
struct Session {
    framework_id: Option<FrameworkId>,
    stream_id: Option<String>,
}

/// HTTP driver for a Mesos master.
pub struct MesosDriver {
    client: reqwest::Client,
    config: MesosConfig,
    session: RwLock<Session>,
}

impl MesosDriver {
    pub fn new(config: MesosConfig) -> Result<Self, DriverError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            config,
            session: RwLock::new(Session::default()),
        })
    }

    /// Seed the framework ID from a previous run so the master hands back
    /// the same framework and its tasks.
    pub async fn set_framework_id(&self, id: Option<FrameworkId>) {
        self.session.write().await.framework_id = id;
    }

    pub async fn framework_id(&self) -> Option<FrameworkId> {
        self.session.read().await.framework_id.clone()
    }

    fn scheduler_url(&self) -> String {
        format!("{}/api/v1/scheduler", self.config.base_url())
    }

    /// Keep a subscription open until shutdown, reconnecting after failures.
    ///
    /// A `Disconnected` event is sent every time the stream is lost.
    #[instrument(skip_all, fields(master = %self.config.master))]
    pub async fn run(&self, events: mpsc::Sender<SchedulerEvent>, mut shutdown: watch::Receiver<bool>) {
        info!("Starting Mesos subscription loop");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.subscribe(&events, &mut shutdown).await {
                Ok(()) => info!("Mesos event stream closed"),
                Err(e) => warn!(error = %e, "Mesos event stream failed"),
            }
            self.session.write().await.stream_id = None;

            if *shutdown.borrow() || events.send(SchedulerEvent::Disconnected).await.is_err() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Mesos subscription loop shutting down");
    }

    /// Open one subscription and forward its events until it ends.
    async fn subscribe(
        &self,
        events: &mpsc::Sender<SchedulerEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), DriverError> {
        let framework_id = self.framework_id().await;
        let call = wire::subscribe_call(&self.config, framework_id.as_ref());

        let response = self
            .client
            .post(self.scheduler_url())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .json(&call)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DriverError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let stream_id = response
            .headers()
            .get(STREAM_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| DriverError::Decode(format!("missing {STREAM_ID_HEADER} header")))?;
        self.session.write().await.stream_id = Some(stream_id);

        let mut stream = response.bytes_stream();
        let mut decoder = RecordIoDecoder::new();
        let mut idle_timeout = DEFAULT_HEARTBEAT * MISSED_HEARTBEATS;

        loop {
            let chunk = tokio::select! {
                chunk = tokio::time::timeout(idle_timeout, stream.next()) => chunk,
                _ = shutdown.changed() => return Ok(()),
            };

            let chunk = match chunk {
                Err(_) => return Err(DriverError::Unavailable("event stream idle".to_string())),
                Ok(None) => return Ok(()),
                Ok(Some(chunk)) => chunk?,
            };
            decoder.push(&chunk);

            while let Some(record) = decoder.next_record()? {
                let event = match wire::parse_event(&record) {
                    Ok(Some(event)) => event,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(error = %e, "Skipping undecodable Mesos event");
                        continue;
                    }
                };

                if let SchedulerEvent::Subscribed {
                    framework_id,
                    heartbeat_interval,
                } = &event
                {
                    info!(framework_id = %framework_id, "Subscribed to Mesos master");
                    self.session.write().await.framework_id = Some(framework_id.clone());
                    idle_timeout = heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT) * MISSED_HEARTBEATS;
                }

                if events.send(event).await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    async fn session_ids(&self) -> Result<(FrameworkId, String), DriverError> {
        let session = self.session.read().await;
        match (&session.framework_id, &session.stream_id) {
            (Some(framework), Some(stream)) => Ok((framework.clone(), stream.clone())),
            _ => Err(DriverError::NotSubscribed),
        }
    }

    async fn call(&self, body: Value) -> Result<(), DriverError> {
        let (_, stream_id) = self.session_ids().await?;
        let call_type = body["type"].as_str().unwrap_or("UNKNOWN").to_string();

        let response = self
            .client
            .post(self.scheduler_url())
            .header(STREAM_ID_HEADER, stream_id)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DriverError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!(call = %call_type, "Mesos call accepted");
        Ok(())
    }

    async fn framework(&self) -> Result<FrameworkId, DriverError> {
        self.session_ids().await.map(|(framework, _)| framework)
    }
}

#[async_trait]
impl ClusterDriver for MesosDriver {
    async fn accept(&self, offer: &Offer, launch: &LaunchSpec) -> Result<(), DriverError> {
        let framework = self.framework().await?;
        self.call(wire::accept_call(&framework, offer, launch, self.config.refuse_seconds))
            .await
    }

    async fn decline(&self, offers: &[OfferId]) -> Result<(), DriverError> {
        if offers.is_empty() {
            return Ok(());
        }
        let framework = self.framework().await?;
        self.call(wire::decline_call(&framework, offers, self.config.refuse_seconds))
            .await
    }

    async fn kill(&self, task_id: &str, agent_id: Option<&AgentId>) -> Result<(), DriverError> {
        let framework = self.framework().await?;
        self.call(wire::kill_call(&framework, task_id, agent_id)).await
    }

    async fn acknowledge(&self, status: &TaskStatus) -> Result<(), DriverError> {
        let framework = self.framework().await?;
        match wire::acknowledge_call(&framework, status) {
            Some(call) => self.call(call).await,
            None => Ok(()),
        }
    }

    async fn list_tasks(&self) -> Result<Vec<ClusterTask>, DriverError> {
        let framework = self.framework_id().await.ok_or(DriverError::NotSubscribed)?;
        let url = format!("{}/tasks", self.config.base_url());

        let response = self
            .client
            .get(url)
            .query(&[("framework_id", framework.as_str()), ("limit", "100000")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DriverError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        wire::parse_master_tasks(&body)
    }

    async fn reconcile_implicit(&self) -> Result<(), DriverError> {
        let framework = self.framework().await?;
        self.call(wire::reconcile_call(&framework)).await
    }

    async fn revive(&self) -> Result<(), DriverError> {
        let framework = self.framework().await?;
        self.call(wire::simple_call(&framework, "REVIVE")).await
    }

    async fn suppress(&self) -> Result<(), DriverError> {
        let framework = self.framework().await?;
        self.call(wire::simple_call(&framework, "SUPPRESS")).await
    }
}
