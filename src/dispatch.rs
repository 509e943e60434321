/// Command dispatch: select, check out, send, interpret, retry
use crate::config::ClientOptions;
use crate::core::codec::Codec;
use crate::core::connection::Connection;
use crate::core::pool::ConnectionPool;
use crate::core::{Endpoint, Preference, ReadPreferenceMode, ServerRole};
use crate::error::{CommandError, Error, NetworkError, NetworkErrorKind, Result};
use crate::topology::{ServerSelector, Topology};
use crate::utils::{get_int, is_truthy};
use bson::Document;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Longest pause between selection attempts while no server is eligible
const SELECTION_BACKOFF: Duration = Duration::from_millis(500);

/// One command to run against the deployment
#[derive(Debug, Clone)]
pub struct Operation {
    pub database: String,
    pub command: Document,
    pub preference: Preference,
    /// Safe to send again after an ambiguous failure
    pub idempotent: bool,
    /// Reply timeout; the client's operation timeout when unset
    pub timeout: Option<Duration>,
    /// Skip selection and run on this endpoint only
    pub pinned: Option<Endpoint>,
}

impl Operation {
    /// A write: primary only, never retried
    pub fn write<S: Into<String>>(database: S, command: Document) -> Self {
        Self {
            database: database.into(),
            command,
            preference: Preference::primary(),
            idempotent: false,
            timeout: None,
            pinned: None,
        }
    }

    /// A read routed by `preference`, retried on network failure
    pub fn read<S: Into<String>>(database: S, command: Document, preference: Preference) -> Self {
        Self {
            database: database.into(),
            command,
            preference,
            idempotent: true,
            timeout: None,
            pinned: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn pinned_to(mut self, endpoint: Endpoint) -> Self {
        self.pinned = Some(endpoint);
        self
    }

    /// Command name, the first key of the command document
    pub fn name(&self) -> &str {
        self.command.keys().next().map(String::as_str).unwrap_or("<empty>")
    }
}

/// Successful server reply
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub endpoint: Endpoint,
    pub document: Document,
    /// Retries consumed before this reply arrived
    pub retries: u32,
}

/// Timeouts and retry budget used by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub server_selection_timeout: Duration,
    pub operation_timeout: Duration,
    pub wait_queue_timeout: Duration,
    pub max_retries: u32,
}

impl From<&ClientOptions> for DispatchSettings {
    fn from(options: &ClientOptions) -> Self {
        Self {
            server_selection_timeout: options.server_selection_timeout(),
            operation_timeout: options.operation_timeout(),
            wait_queue_timeout: options.wait_queue_timeout(),
            max_retries: options.read_retries(),
        }
    }
}

/// Turns an [`Operation`] into a [`Reply`] or a classified error.
///
/// Callers only ever see a reply, [`Error::Command`], [`Error::Network`],
/// [`Error::NoSuitableServer`], or [`Error::Codec`] for a request that
/// cannot be encoded.
pub struct CommandDispatcher {
    topology: Topology,
    selector: ServerSelector,
    pool: ConnectionPool,
    codec: Arc<dyn Codec>,
    settings: DispatchSettings,
}

impl CommandDispatcher {
    pub fn new(
        topology: Topology,
        selector: ServerSelector,
        pool: ConnectionPool,
        codec: Arc<dyn Codec>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            topology,
            selector,
            pool,
            codec,
            settings,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub async fn execute(&self, operation: Operation) -> Result<Reply> {
        let request = self.encode(&operation)?;
        let reply_timeout = operation.timeout.unwrap_or(self.settings.operation_timeout);
        let mut retries = 0;

        loop {
            let endpoint = match &operation.pinned {
                Some(pinned) => self.check_pinned(pinned)?,
                None => self.select(&operation.preference).await?,
            };
            debug!("Dispatching {} to {}", operation.name(), endpoint);

            match self.attempt(&endpoint, &request, reply_timeout).await {
                Ok(document) => return interpret(endpoint, document, retries),
                Err(err) => {
                    let may_retry =
                        operation.idempotent && operation.pinned.is_none() && retries < self.settings.max_retries;
                    if !may_retry {
                        return Err(err.with_retries(retries).into());
                    }
                    retries += 1;
                    warn!(
                        "Retrying {} after failure on {} (retry {}): {}",
                        operation.name(),
                        endpoint,
                        retries,
                        err
                    );
                    self.topology.request_check();
                }
            }
        }
    }

    fn encode(&self, operation: &Operation) -> Result<Vec<u8>> {
        let mut command = operation.command.clone();
        command.insert("$db", operation.database.as_str());
        if operation.preference.mode != ReadPreferenceMode::Primary {
            command.insert("$readPreference", operation.preference.to_document());
        }
        Ok(self.codec.encode(&command)?)
    }

    /// Select an endpoint, requesting heartbeats and waiting for topology
    /// changes until the selection timeout runs out
    async fn select(&self, preference: &Preference) -> Result<Endpoint> {
        let started = Instant::now();
        let deadline = started + self.settings.server_selection_timeout;
        let mut updates = self.topology.subscribe();

        loop {
            let view = updates.borrow_and_update().clone();
            if let Ok(endpoint) = self.selector.select(&view, preference) {
                return Ok(endpoint);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(
                    "No suitable server for {} in topology version {}",
                    preference,
                    view.version()
                );
                return Err(Error::NoSuitableServer {
                    preference: preference.to_string(),
                    waited: started.elapsed(),
                });
            }

            self.topology.request_check();
            let backoff = (deadline - now).min(SELECTION_BACKOFF);
            if let Ok(Err(_)) = timeout(backoff, updates.changed()).await {
                tokio::time::sleep(backoff).await;
            }
        }
    }

    fn check_pinned(&self, endpoint: &Endpoint) -> Result<Endpoint> {
        let view = self.topology.snapshot();
        match view.get(endpoint) {
            Some(state) if state.role != ServerRole::Down => Ok(endpoint.clone()),
            Some(_) => Err(Error::network(
                endpoint.clone(),
                NetworkErrorKind::Unavailable,
                "pinned server is down",
            )),
            None => Err(Error::network(
                endpoint.clone(),
                NetworkErrorKind::Unavailable,
                "pinned server is no longer part of the topology",
            )),
        }
    }

    async fn checkout(&self, endpoint: &Endpoint) -> std::result::Result<Connection, NetworkError> {
        self.pool
            .checkout(endpoint, self.settings.wait_queue_timeout)
            .await
            .map_err(|err| match err {
                Error::Network(err) => err,
                Error::PoolExhausted { endpoint } => {
                    NetworkError::new(endpoint, NetworkErrorKind::PoolExhausted, "connection pool exhausted")
                }
                Error::PoolTimeout { endpoint, waited } => NetworkError::new(
                    endpoint,
                    NetworkErrorKind::PoolTimeout,
                    format!("no connection available after {waited:?}"),
                ),
                Error::PoolClosed => {
                    NetworkError::new(endpoint.clone(), NetworkErrorKind::PoolClosed, "connection pool is closed")
                }
                other => NetworkError::new(endpoint.clone(), NetworkErrorKind::Protocol, other.to_string()),
            })
    }

    /// One send/receive on a pooled connection. The connection goes back to
    /// the pool only after a decodable reply.
    async fn attempt(
        &self,
        endpoint: &Endpoint,
        request: &[u8],
        reply_timeout: Duration,
    ) -> std::result::Result<Document, NetworkError> {
        let mut connection = self.checkout(endpoint).await?;

        let bytes = match connection.round_trip(request, reply_timeout).await {
            Ok(bytes) => bytes,
            Err(err) => {
                self.pool.invalidate(connection).await;
                return Err(err);
            }
        };

        match self.codec.decode(&bytes) {
            Ok(document) => {
                self.pool.checkin(connection).await;
                Ok(document)
            }
            Err(err) => {
                self.pool.invalidate(connection).await;
                Err(NetworkError::new(endpoint.clone(), NetworkErrorKind::Protocol, err.to_string()).ambiguous(true))
            }
        }
    }
}

/// Server-side failure carried by a reply whose `ok` is falsy
pub(crate) fn command_error(document: &Document) -> Option<CommandError> {
    if is_truthy(document.get("ok")) {
        return None;
    }
    let code = get_int(document, "code").unwrap_or(0) as i32;
    let code_name = document.get_str("codeName").ok().map(str::to_string);
    let message = document.get_str("errmsg").unwrap_or("command failed");
    Some(CommandError::new(code, code_name, message))
}

fn interpret(endpoint: Endpoint, document: Document, retries: u32) -> Result<Reply> {
    if let Some(err) = command_error(&document) {
        debug!("Command failed on {}: {}", endpoint, err);
        return Err(err.into());
    }
    Ok(Reply {
        endpoint,
        document,
        retries,
    })
}
