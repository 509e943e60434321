/// Client entry points
///
/// A [`Client`] owns the topology, its monitor, the connection pool and the
/// dispatcher. It is cheap to clone; every clone shares the same state.
/// [`Database`] and [`Collection`] handles carry a name plus the read
/// preference and write concern their operations use.
pub mod collection;
pub mod database;

pub use collection::{
    BulkWriteOptions, BulkWriteResult, Collection, DeleteResult, FindOneAndModifyOptions, FindOptions, IndexOptions,
    IndexTarget, InsertManyResult, InsertOneResult, Modification, UpdateOptions, UpdateResult, WriteModel,
};
pub use database::{CreateCollectionOptions, Database};

use crate::config::{parse_host_list, ClientOptions, ConfigError, ConnectionString};
use crate::core::codec::{Codec, OpMsgCodec};
use crate::core::connection::{TcpTransport, Transport};
use crate::core::pool::{ConnectionPool, PoolOptions};
use crate::core::Preference;
use crate::dispatch::{CommandDispatcher, DispatchSettings};
use crate::error::Result;
use crate::health::{HealthChecker, HelloChecker, MonitorSettings, ServerMonitor};
use crate::topology::selector::SelectionStrategy;
use crate::topology::{ServerSelector, Topology};
use bson::{doc, Bson};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

/// How often idle connections are swept and `min_pool_size` is refilled
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Resolve a connect target into options.
///
/// A target containing `://` is a connection string layered over `options`.
/// Anything else is a comma-separated host list replacing `options.hosts`;
/// an empty target keeps the hosts already in `options`.
pub fn resolve_target(target: &str, options: ClientOptions) -> std::result::Result<ClientOptions, ConfigError> {
    let target = target.trim();
    if target.contains("://") {
        return ConnectionString::parse(target, options.parse_mode)?.apply(options);
    }

    let mut options = options;
    if !target.is_empty() {
        options.hosts = parse_host_list(target)?;
    }
    options.validate()?;
    Ok(options)
}

/// Connect to `target` (a connection string or a host list) with the
/// default TCP transport, OP_MSG codec and `hello` monitoring
pub async fn connect(target: &str, options: ClientOptions) -> Result<Client> {
    let options = resolve_target(target, options)?;
    Client::builder(options).build().await
}

/// Assembles a [`Client`], allowing each collaborator to be replaced
pub struct ClientBuilder {
    options: ClientOptions,
    transport: Option<Arc<dyn Transport>>,
    codec: Option<Arc<dyn Codec>>,
    health_checker: Option<Arc<dyn HealthChecker>>,
    strategy: Option<Box<dyn SelectionStrategy>>,
    maintenance_interval: Duration,
}

impl ClientBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn health_checker(mut self, health_checker: Arc<dyn HealthChecker>) -> Self {
        self.health_checker = Some(health_checker);
        self
    }

    pub fn selection_strategy(mut self, strategy: Box<dyn SelectionStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Validate the options, then start monitoring and pool maintenance
    pub async fn build(self) -> Result<Client> {
        let options = self.options;
        options.validate()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(TcpTransport::new()),
        };
        let codec: Arc<dyn Codec> = match self.codec {
            Some(codec) => codec,
            None => Arc::new(OpMsgCodec::new()),
        };
        let health_checker: Arc<dyn HealthChecker> = match self.health_checker {
            Some(checker) => checker,
            None => Arc::new(
                HelloChecker::new(transport.clone(), codec.clone(), options.connect_timeout())
                    .with_app_name(options.app_name.clone()),
            ),
        };
        let selector = match self.strategy {
            Some(strategy) => {
                ServerSelector::with_strategy(options.local_threshold(), options.heartbeat_frequency(), strategy)
            }
            None => ServerSelector::new(options.local_threshold(), options.heartbeat_frequency()),
        };

        let topology = Topology::new(options.hosts.iter().cloned());
        let monitor = ServerMonitor::new(topology.clone(), health_checker, MonitorSettings::from(&options));
        let pool = ConnectionPool::new(transport, PoolOptions::from(&options));
        let dispatcher = Arc::new(CommandDispatcher::new(
            topology.clone(),
            selector,
            pool.clone(),
            codec,
            DispatchSettings::from(&options),
        ));

        info!(
            "Starting client for {} seed(s), read preference {}",
            options.hosts.len(),
            options.read_preference
        );
        monitor.start().await;
        let maintenance = pool.spawn_maintenance(self.maintenance_interval, topology);

        Ok(Client {
            inner: Arc::new(ClientInner {
                options,
                dispatcher,
                monitor,
                maintenance: Mutex::new(Some(maintenance)),
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}

struct ClientInner {
    options: ClientOptions,
    dispatcher: Arc<CommandDispatcher>,
    monitor: Arc<ServerMonitor>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Handle on a deployment
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(options: ClientOptions) -> ClientBuilder {
        ClientBuilder {
            options,
            transport: None,
            codec: None,
            health_checker: None,
            strategy: None,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn database(&self, name: &str) -> Database {
        Database::new(
            self.clone(),
            name,
            self.inner.options.read_preference.clone(),
            self.inner.options.write_concern.clone(),
        )
    }

    /// Database named in the connection string path, if any
    pub fn default_database(&self) -> Option<Database> {
        self.inner
            .options
            .default_database
            .as_deref()
            .map(|name| self.database(name))
    }

    /// Live topology; call `snapshot()` for the current view
    pub fn topology(&self) -> &Topology {
        self.inner.dispatcher.topology()
    }

    pub fn pool(&self) -> &ConnectionPool {
        self.inner.dispatcher.pool()
    }

    /// Names of every database on the deployment, from `listDatabases` on
    /// `admin`
    pub async fn database_names(&self) -> Result<Vec<String>> {
        let reply = self
            .database("admin")
            .run_read_command(doc! { "listDatabases": 1, "nameOnly": true }, Preference::primary_preferred())
            .await?;
        Ok(reply
            .get_array("databases")
            .map(|databases| {
                databases
                    .iter()
                    .filter_map(Bson::as_document)
                    .filter_map(|entry| entry.get_str("name").ok())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    pub(crate) fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.inner.dispatcher
    }

    /// Stop monitoring and maintenance and close every pooled connection.
    /// Operations issued afterwards fail with a pool-closed network error.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down client");
        self.inner.monitor.shutdown().await;
        if let Some(maintenance) = self.inner.maintenance.lock().await.take() {
            maintenance.abort();
        }
        self.inner.dispatcher.pool().close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mock::{MockHealthChecker, MockServer, MockTransport};
    use crate::core::{Endpoint, Preference, ReadPreferenceMode, ServerRole};
    use crate::error::{Error, NetworkErrorKind};
    use bson::doc;
    use std::time::Instant;

    fn h(name: &str) -> Endpoint {
        Endpoint::new(name, 27017)
    }

    fn fast(options: ClientOptions) -> ClientOptions {
        ClientOptions {
            heartbeat_frequency_ms: 50,
            min_heartbeat_frequency_ms: 5,
            server_selection_timeout_ms: 1_000,
            ..options
        }
    }

    async fn wait_for<F: Fn(&Client) -> bool>(client: &Client, condition: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition(client) {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_resolve_target() {
        let options = resolve_target("", ClientOptions::default()).unwrap();
        assert_eq!(options.hosts, vec![h("localhost")]);

        let options = resolve_target("a:1,b", ClientOptions::default()).unwrap();
        assert_eq!(options.hosts, vec![Endpoint::new("a", 1), h("b")]);

        let base = ClientOptions {
            max_pool_size: 7,
            ..Default::default()
        };
        let options = resolve_target("proto://h1,h2/app?maxPoolSize=3", base.clone()).unwrap();
        assert_eq!(options.hosts, vec![h("h1"), h("h2")]);
        assert_eq!(options.max_pool_size, 3);
        assert_eq!(options.default_database.as_deref(), Some("app"));

        let options = resolve_target("h1", base).unwrap();
        assert_eq!(options.max_pool_size, 7);

        assert!(resolve_target("mongodb+srv://cluster.example.com", ClientOptions::default()).is_err());
        assert!(resolve_target("proto://h1/?bogus=1", ClientOptions::default()).is_err());
    }

    #[tokio::test]
    async fn test_secondary_preferred_scenario() {
        let options = fast(
            resolve_target(
                "proto://h1:27017,h2:27017/db?readPreference=secondaryPreferred",
                ClientOptions::default(),
            )
            .unwrap(),
        );
        assert_eq!(options.read_preference.mode, ReadPreferenceMode::SecondaryPreferred);

        let checker = Arc::new(MockHealthChecker::new());
        checker.set_role(&h("h1"), ServerRole::Primary);
        checker.set_delay(&h("h1"), Duration::from_millis(5));
        checker.set_role(&h("h2"), ServerRole::Secondary);
        checker.set_delay(&h("h2"), Duration::from_millis(8));

        let server = MockServer::new(|endpoint, _command| Ok(doc! { "ok": 1, "me": endpoint.to_string() }));
        let client = Client::builder(options)
            .transport(Arc::new(MockTransport::new(server.clone())))
            .codec(Arc::new(crate::core::codec::BsonCodec))
            .health_checker(checker.clone())
            .build()
            .await
            .unwrap();

        wait_for(&client, |c| {
            let view = c.topology().snapshot();
            view.primary().is_some()
                && view.get(&h("h2")).map(|s| s.role) == Some(ServerRole::Secondary)
        })
        .await;

        let db = client.default_database().unwrap();
        assert_eq!(db.name(), "db");
        let reply = db
            .run_read_command(doc! { "ping": 1 }, client.options().read_preference.clone())
            .await
            .unwrap();
        assert_eq!(reply.get_str("me").unwrap(), "h2:27017");

        checker.set_unreachable(&h("h2"));
        client.topology().request_check();
        wait_for(&client, |c| {
            c.topology().snapshot().get(&h("h2")).map(|s| s.role) == Some(ServerRole::Down)
        })
        .await;

        let reply = db
            .run_read_command(doc! { "ping": 1 }, Preference::secondary_preferred())
            .await
            .unwrap();
        assert_eq!(reply.get_str("me").unwrap(), "h1:27017");

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_discovers_advertised_members() {
        let checker = Arc::new(MockHealthChecker::new());
        checker.set_role(&h("h1"), ServerRole::Primary);
        checker.set_hosts(&h("h1"), vec![h("h1"), h("h2")]);
        checker.set_role(&h("h2"), ServerRole::Secondary);

        let server = MockServer::new(|_endpoint, _command| Ok(doc! { "ok": 1 }));
        let client = Client::builder(fast(resolve_target("h1", ClientOptions::default()).unwrap()))
            .transport(Arc::new(MockTransport::new(server)))
            .health_checker(checker)
            .build()
            .await
            .unwrap();

        wait_for(&client, |c| {
            c.topology().snapshot().get(&h("h2")).map(|s| s.role) == Some(ServerRole::Secondary)
        })
        .await;
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_pool() {
        let checker = Arc::new(MockHealthChecker::new());
        checker.set_role(&h("h1"), ServerRole::Primary);
        let server = MockServer::new(|_endpoint, _command| Ok(doc! { "ok": 1 }));
        let client = Client::builder(fast(resolve_target("h1", ClientOptions::default()).unwrap()))
            .transport(Arc::new(MockTransport::new(server)))
            .codec(Arc::new(crate::core::codec::BsonCodec))
            .health_checker(checker)
            .build()
            .await
            .unwrap();
        wait_for(&client, |c| c.topology().snapshot().primary().is_some()).await;

        client.database("admin").run_command(doc! { "ping": 1 }).await.unwrap();
        client.shutdown().await;
        client.shutdown().await;
        assert!(client.pool().is_closed());

        match client.database("admin").run_command(doc! { "ping": 1 }).await {
            Err(Error::Network(err)) => assert_eq!(err.kind, NetworkErrorKind::PoolClosed),
            other => panic!("expected a pool-closed error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_options() {
        let options = ClientOptions {
            max_pool_size: 0,
            ..Default::default()
        };
        assert!(matches!(Client::builder(options).build().await, Err(Error::Config(_))));
    }
}
