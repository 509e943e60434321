//! Scripted collaborators for tests: a transport whose replies come from a
//! closure, and a health checker whose answers are set per endpoint.
use crate::config::ClientOptions;
use crate::core::codec::{BsonCodec, Codec};
use crate::core::connection::{Channel, Transport};
use crate::core::pool::{ConnectionPool, PoolOptions};
use crate::core::{Endpoint, EndpointState, ServerRole};
use crate::dispatch::{CommandDispatcher, DispatchSettings};
use crate::health::{HealthChecker, HealthStatus};
use crate::topology::{ServerDescription, ServerSelector, Topology};
use async_trait::async_trait;
use bson::Document;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

type Responder = dyn Fn(&Endpoint, &Document) -> io::Result<Document> + Send + Sync;

struct ServerState {
    responder: Box<Responder>,
    calls: Mutex<Vec<(Endpoint, Document)>>,
    refused: Mutex<HashSet<Endpoint>>,
    send_failures: AtomicUsize,
    connects: AtomicUsize,
    reply_delay: Mutex<Option<Duration>>,
}

/// Every channel opened through a [`MockTransport`] talks to this server.
/// The responder sees each decoded command; an `Err` is delivered as a
/// receive failure, after the request was recorded.
#[derive(Clone)]
pub(crate) struct MockServer {
    state: Arc<ServerState>,
}

impl MockServer {
    pub(crate) fn new<F>(responder: F) -> Self
    where
        F: Fn(&Endpoint, &Document) -> io::Result<Document> + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(ServerState {
                responder: Box::new(responder),
                calls: Mutex::new(Vec::new()),
                refused: Mutex::new(HashSet::new()),
                send_failures: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                reply_delay: Mutex::new(None),
            }),
        }
    }

    /// Fail the next `n` sends before anything reaches the server
    pub(crate) fn fail_next_sends(&self, n: usize) {
        self.state.send_failures.store(n, Ordering::SeqCst);
    }

    pub(crate) fn refuse(&self, endpoint: &Endpoint) {
        self.state.refused.lock().unwrap().insert(endpoint.clone());
    }

    pub(crate) fn accept(&self, endpoint: &Endpoint) {
        self.state.refused.lock().unwrap().remove(endpoint);
    }

    pub(crate) fn set_reply_delay(&self, delay: Option<Duration>) {
        *self.state.reply_delay.lock().unwrap() = delay;
    }

    pub(crate) fn calls(&self) -> Vec<(Endpoint, Document)> {
        self.state.calls.lock().unwrap().clone()
    }

    /// Name (first key) of every command received, in order
    pub(crate) fn command_names(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|(_, command)| command.keys().next().cloned())
            .collect()
    }

    pub(crate) fn commands_to(&self, endpoint: &Endpoint) -> usize {
        self.calls().iter().filter(|(e, _)| e == endpoint).count()
    }

    pub(crate) fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    fn take_send_failure(&self) -> bool {
        self.state
            .send_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub(crate) struct MockTransport {
    server: MockServer,
    codec: Arc<dyn Codec>,
}

impl MockTransport {
    pub(crate) fn new(server: MockServer) -> Self {
        Self::with_codec(server, Arc::new(BsonCodec))
    }

    pub(crate) fn with_codec(server: MockServer, codec: Arc<dyn Codec>) -> Self {
        Self { server, codec }
    }

    pub(crate) fn channel_for(&self, endpoint: Endpoint) -> Box<dyn Channel> {
        Box::new(MockChannel {
            endpoint,
            server: self.server.clone(),
            codec: self.codec.clone(),
            pending: None,
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, endpoint: &Endpoint, _timeout: Duration) -> io::Result<Box<dyn Channel>> {
        if self.server.state.refused.lock().unwrap().contains(endpoint) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{endpoint} refused the connection"),
            ));
        }
        self.server.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.channel_for(endpoint.clone()))
    }
}

struct MockChannel {
    endpoint: Endpoint,
    server: MockServer,
    codec: Arc<dyn Codec>,
    pending: Option<io::Result<Document>>,
}

#[async_trait]
impl Channel for MockChannel {
    async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.server.take_send_failure() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
        }
        let command = self
            .codec
            .decode(bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.server
            .state
            .calls
            .lock()
            .unwrap()
            .push((self.endpoint.clone(), command.clone()));
        self.pending = Some((self.server.state.responder)(&self.endpoint, &command));
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> io::Result<Bytes> {
        let delay = *self.server.state.reply_delay.lock().unwrap();
        if let Some(delay) = delay {
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(io::Error::new(io::ErrorKind::TimedOut, "reply timed out"));
            }
            tokio::time::sleep(delay).await;
        }

        match self.pending.take() {
            Some(Ok(reply)) => {
                let bytes = self
                    .codec
                    .encode(&reply)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                Ok(Bytes::from(bytes))
            }
            Some(Err(e)) => Err(e),
            None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no request in flight")),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
struct MockNode {
    role: Option<ServerRole>,
    hosts: Vec<Endpoint>,
    tags: BTreeMap<String, String>,
    unreachable: bool,
    delay: Option<Duration>,
}

/// Health checker answering from per-endpoint settings. Endpoints never
/// configured are unreachable.
pub(crate) struct MockHealthChecker {
    nodes: Mutex<HashMap<Endpoint, MockNode>>,
    checks: Mutex<HashMap<Endpoint, usize>>,
    forgotten: Mutex<HashMap<Endpoint, usize>>,
    timeout: Duration,
}

impl MockHealthChecker {
    pub(crate) fn new() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            checks: Mutex::new(HashMap::new()),
            forgotten: Mutex::new(HashMap::new()),
            timeout: Duration::from_secs(1),
        }
    }

    pub(crate) fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn update<F: FnOnce(&mut MockNode)>(&self, endpoint: &Endpoint, f: F) {
        let mut nodes = self.nodes.lock().unwrap();
        f(nodes.entry(endpoint.clone()).or_default());
    }

    pub(crate) fn set_role(&self, endpoint: &Endpoint, role: ServerRole) {
        self.update(endpoint, |node| {
            node.role = Some(role);
            node.unreachable = false;
        });
    }

    pub(crate) fn set_hosts(&self, endpoint: &Endpoint, hosts: Vec<Endpoint>) {
        self.update(endpoint, |node| node.hosts = hosts);
    }

    pub(crate) fn set_tags(&self, endpoint: &Endpoint, tags: &[(&str, &str)]) {
        self.update(endpoint, |node| {
            node.tags = tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        });
    }

    pub(crate) fn set_unreachable(&self, endpoint: &Endpoint) {
        self.update(endpoint, |node| node.unreachable = true);
    }

    pub(crate) fn set_delay(&self, endpoint: &Endpoint, delay: Duration) {
        self.update(endpoint, |node| node.delay = Some(delay));
    }

    pub(crate) fn checks(&self, endpoint: &Endpoint) -> usize {
        self.checks.lock().unwrap().get(endpoint).copied().unwrap_or(0)
    }

    pub(crate) fn forgotten(&self, endpoint: &Endpoint) -> usize {
        self.forgotten.lock().unwrap().get(endpoint).copied().unwrap_or(0)
    }
}

#[async_trait]
impl HealthChecker for MockHealthChecker {
    async fn check_health(&self, endpoint: &Endpoint) -> HealthStatus {
        *self.checks.lock().unwrap().entry(endpoint.clone()).or_insert(0) += 1;
        let node = self.nodes.lock().unwrap().get(endpoint).cloned();

        let Some(node) = node else {
            return HealthStatus::Unhealthy {
                reason: format!("{endpoint} is not configured"),
            };
        };
        if let Some(delay) = node.delay {
            tokio::time::sleep(delay).await;
        }
        if node.unreachable {
            return HealthStatus::Unhealthy {
                reason: "connection refused".to_string(),
            };
        }

        HealthStatus::Healthy(ServerDescription {
            role: node.role,
            tags: node.tags,
            hosts: node.hosts,
            last_write_date: Some(SystemTime::now()),
        })
    }

    fn check_timeout(&self) -> Duration {
        self.timeout
    }

    async fn forget(&self, endpoint: &Endpoint) {
        *self.forgotten.lock().unwrap().entry(endpoint.clone()).or_insert(0) += 1;
    }
}

/// `h1` primary (5 ms) and `h2` secondary (8 ms)
pub(crate) fn replica_set() -> Topology {
    let topology = Topology::new([Endpoint::new("h1", 27017), Endpoint::new("h2", 27017)]);
    topology.set_state(EndpointState::with_role(
        Endpoint::new("h1", 27017),
        ServerRole::Primary,
        Duration::from_millis(5),
    ));
    topology.set_state(EndpointState::with_role(
        Endpoint::new("h2", 27017),
        ServerRole::Secondary,
        Duration::from_millis(8),
    ));
    topology
}

/// Dispatcher wired to `server` through a fresh pool
pub(crate) fn dispatcher(server: &MockServer, topology: Topology, options: &ClientOptions) -> CommandDispatcher {
    let pool = ConnectionPool::new(Arc::new(MockTransport::new(server.clone())), PoolOptions::from(options));
    let selector = ServerSelector::new(options.local_threshold(), options.heartbeat_frequency());
    CommandDispatcher::new(
        topology,
        selector,
        pool,
        Arc::new(BsonCodec),
        DispatchSettings::from(options),
    )
}
