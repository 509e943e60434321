/// Server monitoring
///
/// A [`HealthChecker`] probes one endpoint; the [`ServerMonitor`] runs one
/// background task per known endpoint and feeds every result into the shared
/// [`Topology`]. Members a server advertises are added to the topology and
/// picked up by the monitor's supervisor.
pub mod mongodb;

use crate::config::ClientOptions;
use crate::core::{Endpoint, ServerRole};
use crate::topology::{Observation, RoleChange, ServerDescription, Topology, TopologyView};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

pub use self::mongodb::HelloChecker;

/// Health status of an endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy(ServerDescription),
    Unhealthy { reason: String },
    Timeout,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy(description) => match description.role {
                Some(role) => write!(f, "Healthy ({})", role),
                None => write!(f, "Healthy"),
            },
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

impl HealthStatus {
    /// Check if the status represents a reachable server
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy(_))
    }
}

/// Health checker trait
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Probe one endpoint
    async fn check_health(&self, endpoint: &Endpoint) -> HealthStatus;

    /// Get the timeout for health checks
    fn check_timeout(&self) -> Duration;

    /// Drop any per-endpoint state, such as a cached monitoring channel
    async fn forget(&self, _endpoint: &Endpoint) {}
}

/// Heartbeat timing and failure policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    pub heartbeat_frequency: Duration,
    /// Minimum spacing between two checks of the same endpoint
    pub min_heartbeat_frequency: Duration,
    /// Consecutive failures before the endpoint is marked down
    pub failure_threshold: u32,
}

impl From<&ClientOptions> for MonitorSettings {
    fn from(options: &ClientOptions) -> Self {
        Self {
            heartbeat_frequency: options.heartbeat_frequency(),
            min_heartbeat_frequency: options.min_heartbeat_frequency(),
            failure_threshold: options.failure_threshold,
        }
    }
}

/// Background monitor keeping the topology current
pub struct ServerMonitor {
    topology: Topology,
    checker: Arc<dyn HealthChecker>,
    settings: MonitorSettings,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<HashMap<Endpoint, JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ServerMonitor {
    pub fn new(topology: Topology, checker: Arc<dyn HealthChecker>, settings: MonitorSettings) -> Arc<Self> {
        Arc::new(Self {
            topology,
            checker,
            settings,
            supervisor: Mutex::new(None),
            tasks: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Start monitoring. A supervisor task watches the topology and starts
    /// one heartbeat task for every endpoint that appears in it.
    pub async fn start(self: &Arc<Self>) {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.is_some() || self.closed.load(Ordering::Acquire) {
            return;
        }
        info!(
            "Starting server monitor for {} endpoint(s)",
            self.topology.snapshot().len()
        );
        let monitor = Arc::downgrade(self);
        let updates = self.topology.subscribe();
        *supervisor = Some(tokio::spawn(supervise(monitor, updates)));
    }

    /// Endpoints with a running monitor task
    pub async fn monitored(&self) -> Vec<Endpoint> {
        let tasks = self.tasks.lock().await;
        let mut endpoints: Vec<Endpoint> = tasks.keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    async fn spawn_monitor(self: &Arc<Self>, endpoint: Endpoint) {
        let mut tasks = self.tasks.lock().await;
        if self.closed.load(Ordering::Acquire) || tasks.contains_key(&endpoint) {
            return;
        }

        debug!("Monitoring {}", endpoint);
        let monitor = Arc::downgrade(self);
        let task_endpoint = endpoint.clone();
        let handle = tokio::spawn(async move {
            run_heartbeats(monitor, task_endpoint).await;
        });
        tasks.insert(endpoint, handle);
    }

    /// Run one heartbeat against `endpoint` and publish the outcome
    pub async fn check_now(&self, endpoint: &Endpoint) -> Option<RoleChange> {
        let started = Instant::now();
        let status = match timeout(self.checker.check_timeout(), self.checker.check_health(endpoint)).await {
            Ok(status) => status,
            Err(_) => HealthStatus::Timeout,
        };
        let round_trip_time = started.elapsed();

        let mut discovered = Vec::new();
        let observation = match status {
            HealthStatus::Healthy(description) => {
                debug!("Heartbeat to {} succeeded in {:?}", endpoint, round_trip_time);
                discovered = description.hosts.clone();
                Observation::Success {
                    round_trip_time,
                    description,
                }
            }
            HealthStatus::Unhealthy { reason } => {
                debug!("Heartbeat to {} failed: {}", endpoint, reason);
                self.checker.forget(endpoint).await;
                Observation::Failure { reason }
            }
            HealthStatus::Timeout => {
                debug!("Heartbeat to {} timed out", endpoint);
                self.checker.forget(endpoint).await;
                Observation::Failure {
                    reason: "heartbeat timed out".to_string(),
                }
            }
        };

        let change = self
            .topology
            .apply_observation(endpoint, observation, self.settings.failure_threshold);
        if let Some(change) = change {
            log_role_change(endpoint, change);
        }

        for fresh in self.topology.add_endpoints(discovered) {
            info!("Discovered server {} through {}", fresh, endpoint);
        }

        change
    }

    /// Stop every monitor task
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(supervisor) = self.supervisor.lock().await.take() {
            supervisor.abort();
        }
        let mut tasks = self.tasks.lock().await;
        for (endpoint, handle) in tasks.drain() {
            handle.abort();
            self.checker.forget(&endpoint).await;
        }
        info!("Server monitor stopped");
    }
}

fn log_role_change(endpoint: &Endpoint, change: RoleChange) {
    match (change.from, change.to) {
        (_, ServerRole::Down) => warn!("Server {} is down (was {})", endpoint, change.from),
        (ServerRole::Down | ServerRole::Unknown, to) if to.is_data_bearing() => {
            info!("Server {} is up as {}", endpoint, to)
        }
        (from, to) => info!("Server {} changed role from {} to {}", endpoint, from, to),
    }
}

async fn supervise(monitor: Weak<ServerMonitor>, mut updates: watch::Receiver<Arc<TopologyView>>) {
    loop {
        let endpoints: Vec<Endpoint> = updates
            .borrow_and_update()
            .endpoints()
            .map(|s| s.endpoint.clone())
            .collect();
        let Some(monitor) = monitor.upgrade() else {
            break;
        };
        for endpoint in endpoints {
            monitor.spawn_monitor(endpoint).await;
        }
        drop(monitor);

        if updates.changed().await.is_err() {
            break;
        }
    }
}

async fn run_heartbeats(monitor: Weak<ServerMonitor>, endpoint: Endpoint) {
    let mut last_check: Option<Instant> = None;
    loop {
        if let Some(last) = last_check {
            let Some((topology, settings)) = monitor.upgrade().map(|m| (m.topology.clone(), m.settings)) else {
                break;
            };
            tokio::select! {
                _ = sleep_until(last + settings.heartbeat_frequency) => {}
                _ = topology.check_requested() => {
                    sleep_until(last + settings.min_heartbeat_frequency).await;
                }
            }
        }

        let Some(monitor) = monitor.upgrade() else {
            break;
        };
        if !monitor.topology.snapshot().contains(&endpoint) {
            debug!("Stopping monitor for removed server {}", endpoint);
            monitor.tasks.lock().await.remove(&endpoint);
            break;
        }
        monitor.check_now(&endpoint).await;
        last_check = Some(Instant::now());
    }
}
